//! Table layout shared by the write path and the filter compiler.

use crate::{
    event::TagKind,
    sql::{bare, col, Field},
};

pub const EVENT: &str = "event";

pub const EVENT_ID: Field = col(EVENT, "id");
pub const EVENT_PUBKEY: Field = col(EVENT, "pubkey");
pub const EVENT_CREATED_AT: Field = col(EVENT, "created_at");
pub const EVENT_KIND: Field = col(EVENT, "kind");
pub const EVENT_CONTENT: Field = col(EVENT, "content");
pub const EVENT_SIG: Field = col(EVENT, "sig");

/// Row layout decoded by the store.
pub const EVENT_COLUMNS: [Field; 6] = [
    EVENT_ID,
    EVENT_PUBKEY,
    EVENT_CREATED_AT,
    EVENT_KIND,
    EVENT_CONTENT,
    EVENT_SIG,
];

/// Same layout, unqualified, for selecting out of a subquery.
pub const EVENT_COLUMNS_BARE: [Field; 6] = [
    bare("id"),
    bare("pubkey"),
    bare("created_at"),
    bare("kind"),
    bare("content"),
    bare("sig"),
];

/// One table per tag variant.
#[derive(Debug, Clone, Copy)]
pub struct TagTable {
    pub name: &'static str,
    pub associated_event: Field,
    pub position: Field,
    /// Referenced event id or public key.
    pub value: Field,
    pub relay: Field,
    /// Marker for `e` tags, petname for `p` tags.
    pub extra: Field,
}

impl TagTable {
    /// Column names in insert order.
    pub fn columns(&self) -> [&'static str; 5] {
        [
            self.associated_event.name,
            self.position.name,
            self.value.name,
            self.relay.name,
            self.extra.name,
        ]
    }
}

pub const E_TAG: TagTable = TagTable {
    name: "e_tag",
    associated_event: col("e_tag", "associated_event"),
    position: col("e_tag", "position"),
    value: col("e_tag", "event_id"),
    relay: col("e_tag", "relay_url"),
    extra: col("e_tag", "marker"),
};

pub const P_TAG: TagTable = TagTable {
    name: "p_tag",
    associated_event: col("p_tag", "associated_event"),
    position: col("p_tag", "position"),
    value: col("p_tag", "pubkey"),
    relay: col("p_tag", "relay_url"),
    extra: col("p_tag", "petname"),
};

pub fn tag_table(kind: TagKind) -> &'static TagTable {
    match kind {
        TagKind::Reference => &E_TAG,
        TagKind::Actor => &P_TAG,
    }
}

pub const DDL: &str = "
CREATE TABLE IF NOT EXISTS event (
    id TEXT PRIMARY KEY,
    pubkey TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    kind INTEGER NOT NULL,
    content TEXT NOT NULL,
    sig TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS event_pubkey_kind ON event(pubkey, kind);
CREATE INDEX IF NOT EXISTS event_created_at ON event(created_at);
CREATE INDEX IF NOT EXISTS event_kind ON event(kind);

CREATE TABLE IF NOT EXISTS e_tag (
    associated_event TEXT NOT NULL REFERENCES event(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    event_id TEXT NOT NULL,
    relay_url TEXT,
    marker TEXT,
    PRIMARY KEY (associated_event, position)
);
CREATE INDEX IF NOT EXISTS e_tag_event_id ON e_tag(event_id);

CREATE TABLE IF NOT EXISTS p_tag (
    associated_event TEXT NOT NULL REFERENCES event(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    pubkey TEXT NOT NULL,
    relay_url TEXT,
    petname TEXT,
    PRIMARY KEY (associated_event, position)
);
CREATE INDEX IF NOT EXISTS p_tag_pubkey ON p_tag(pubkey);
";
