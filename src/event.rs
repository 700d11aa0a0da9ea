//! Nostr event model.

use std::fmt;

use serde::{
    de::{self, Deserializer},
    ser::{SerializeSeq, Serializer},
    Deserialize, Serialize,
};
use sha2::{Digest, Sha256};

/// Marker carried by the fourth element of an `e` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Reply,
    Root,
    Mention,
}

impl Marker {
    pub fn as_str(self) -> &'static str {
        match self {
            Marker::Reply => "reply",
            Marker::Root => "root",
            Marker::Mention => "mention",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reply" => Some(Marker::Reply),
            "root" => Some(Marker::Root),
            "mention" => Some(Marker::Mention),
            _ => None,
        }
    }
}

/// Reference to another event (`["e", <id>, <relay>?, <marker>?]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceTag {
    pub event_id: String,
    pub relay: Option<String>,
    pub marker: Option<Marker>,
}

/// Reference to another author (`["p", <pubkey>, <relay>?, <petname>?]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorTag {
    pub pubkey: String,
    pub relay: Option<String>,
    pub petname: Option<String>,
}

/// Tag attached to an event.
///
/// Tags are positional arrays on the wire. Trailing optional elements are
/// omitted in the minimal form, so `["e", "aa11"]` and `["e", "aa11", ""]` are
/// distinct tags and both survive a round trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    Reference(ReferenceTag),
    Actor(ActorTag),
}

/// Tag variants known to the relay, each backed by its own storage table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagKind {
    Reference,
    Actor,
}

impl TagKind {
    pub const ALL: [TagKind; 2] = [TagKind::Reference, TagKind::Actor];

    /// Single-letter wire name.
    pub fn name(self) -> &'static str {
        match self {
            TagKind::Reference => "e",
            TagKind::Actor => "p",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "e" => Some(TagKind::Reference),
            "p" => Some(TagKind::Actor),
            _ => None,
        }
    }
}

impl Tag {
    pub fn kind(&self) -> TagKind {
        match self {
            Tag::Reference(_) => TagKind::Reference,
            Tag::Actor(_) => TagKind::Actor,
        }
    }

    /// The referenced event id or public key.
    pub fn value(&self) -> &str {
        match self {
            Tag::Reference(t) => &t.event_id,
            Tag::Actor(t) => &t.pubkey,
        }
    }

    /// Positional wire form of the tag.
    pub fn to_array(&self) -> Vec<&str> {
        let mut out = vec![self.kind().name(), self.value()];
        let (relay, last) = match self {
            Tag::Reference(t) => (t.relay.as_deref(), t.marker.map(Marker::as_str)),
            Tag::Actor(t) => (t.relay.as_deref(), t.petname.as_deref()),
        };
        match (relay, last) {
            (Some(relay), Some(last)) => {
                out.push(relay);
                out.push(last);
            }
            (None, Some(last)) => {
                out.push("");
                out.push(last);
            }
            (Some(relay), None) => out.push(relay),
            (None, None) => {}
        }
        out
    }

    /// Build a tag from its positional wire form.
    pub fn from_array(fields: &[String]) -> Result<Self, String> {
        let (name, value) = match fields {
            [name, value, ..] => (name.as_str(), value.clone()),
            _ => return Err(format!("tag {fields:?} has no value")),
        };
        if fields.len() > 4 {
            return Err(format!("tag {fields:?} has too many elements"));
        }
        let relay = fields.get(2).cloned();
        match TagKind::from_name(name) {
            Some(TagKind::Reference) => {
                let marker = match fields.get(3) {
                    Some(m) => Some(Marker::parse(m).ok_or_else(|| format!("unknown marker {m:?}"))?),
                    None => None,
                };
                Ok(Tag::Reference(ReferenceTag {
                    event_id: value,
                    relay,
                    marker,
                }))
            }
            Some(TagKind::Actor) => Ok(Tag::Actor(ActorTag {
                pubkey: value,
                relay,
                petname: fields.get(3).cloned(),
            })),
            None => Err(format!("unsupported tag type {name:?}")),
        }
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = self.to_array();
        let mut seq = serializer.serialize_seq(Some(fields.len()))?;
        for f in fields {
            seq.serialize_element(f)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Vec::<String>::deserialize(deserializer)?;
        Tag::from_array(&fields).map_err(de::Error::custom)
    }
}

/// Core Nostr event received from clients and persisted by the relay.
///
/// ```json
/// {
///   "id": "4376c65d...",
///   "pubkey": "6e468422...",
///   "created_at": 1700000000,
///   "kind": 1,
///   "tags": [["e", "aa11", "wss://relay.example", "reply"], ["p", "bb22"]],
///   "content": "hello",
///   "sig": "908a15e4..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (x-only, hex).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Kind number, deciding the storage disposition.
    pub kind: u32,
    /// Reference and actor tags in declaration order.
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Canonical serialization hashed to obtain the id.
    pub fn canonical(&self) -> String {
        serde_json::json!([0, self.pubkey, self.created_at, self.kind, self.tags, self.content])
            .to_string()
    }

    /// SHA-256 of the canonical serialization.
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.canonical().as_bytes()).into()
    }

    /// Hex id recomputed from the event fields.
    pub fn computed_id(&self) -> String {
        hex::encode(self.digest())
    }

    /// Ids referenced by `e` tags.
    pub fn referenced_events(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().filter_map(|t| match t {
            Tag::Reference(r) => Some(r.event_id.as_str()),
            Tag::Actor(_) => None,
        })
    }

    pub fn disposition(&self) -> Disposition {
        Disposition::of(self.kind)
    }
}

/// How an event of a given kind is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Always stored.
    Regular,
    /// Latest per author wins (kinds 0 and 3).
    ReplaceableByAuthor,
    /// Latest per (author, kind) wins.
    ReplaceableByAuthorKind,
    /// Deletes the author's referenced events; never stored itself.
    Deletion,
    /// Broadcast only.
    Ephemeral,
    /// Rejected.
    Unsupported,
}

impl Disposition {
    pub fn of(kind: u32) -> Self {
        match kind {
            0 | 3 => Disposition::ReplaceableByAuthor,
            5 => Disposition::Deletion,
            1..=9_999 => Disposition::Regular,
            10_000..=19_999 => Disposition::ReplaceableByAuthorKind,
            20_000..=29_999 => Disposition::Ephemeral,
            _ => Disposition::Unsupported,
        }
    }

    /// Whether the event row itself lands in storage.
    pub fn is_stored(self) -> bool {
        matches!(
            self,
            Disposition::Regular
                | Disposition::ReplaceableByAuthor
                | Disposition::ReplaceableByAuthorKind
        )
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Disposition::Regular => "regular",
            Disposition::ReplaceableByAuthor => "replaceable",
            Disposition::ReplaceableByAuthorKind => "replaceable-by-kind",
            Disposition::Deletion => "deletion",
            Disposition::Ephemeral => "ephemeral",
            Disposition::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}
