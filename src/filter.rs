//! Subscription filters: decoding, the in-memory predicate used for live
//! fan-out, and the statements that push the same matching into storage.

use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use serde_json::Value;

use crate::{
    error::ProtocolError,
    event::{Event, TagKind},
    schema,
    sql::{self, build, in_set, prefix, range, select, union, Members, Order, Prefixes, Select, Statement},
};

/// A single filter; present fields are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Hex prefixes of event ids.
    pub ids: Option<Vec<String>>,
    /// Hex prefixes of author keys.
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<u64>,
    /// Tag name (without `#`) to accepted values.
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// Decode a filter object from a REQ or COUNT message.
    ///
    /// Empty lists are treated as absent. Unknown keys are ignored.
    pub fn from_value(val: &Value) -> Result<Self, ProtocolError> {
        let obj = val
            .as_object()
            .ok_or_else(|| ProtocolError::Filter("filter must be an object".into()))?;
        let mut filter = Filter::default();
        for (key, v) in obj {
            match key.as_str() {
                "ids" => filter.ids = non_empty(hex_prefixes(key, v)?),
                "authors" => filter.authors = non_empty(hex_prefixes(key, v)?),
                "kinds" => {
                    let kinds = integers(key, v)?
                        .into_iter()
                        .map(|k| {
                            u32::try_from(k)
                                .map_err(|_| ProtocolError::Filter(format!("kind {k} out of range")))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    filter.kinds = non_empty(kinds);
                }
                "since" => filter.since = Some(integer(key, v)?),
                "until" => filter.until = Some(integer(key, v)?),
                "limit" => filter.limit = Some(integer(key, v)?),
                tag if is_tag_key(tag) => {
                    let values = strings(key, v)?;
                    if !values.is_empty() {
                        filter.tags.insert(tag[1..].to_string(), values);
                    }
                }
                _ => {}
            }
        }
        Ok(filter)
    }

    /// WHERE clauses for this filter against the `event` table.
    fn clauses(&self) -> Vec<sql::Fragment> {
        let mut out = vec![];
        if let Some(ids) = &self.ids {
            out.push(key_match(schema::EVENT_ID, ids));
        }
        if let Some(authors) = &self.authors {
            out.push(key_match(schema::EVENT_PUBKEY, authors));
        }
        if let Some(kinds) = &self.kinds {
            out.push(in_set(
                schema::EVENT_KIND,
                Members::Bind(kinds.iter().map(|&k| k.into()).collect()),
            ));
        }
        if let Some(window) = range(
            schema::EVENT_CREATED_AT,
            self.since.map(Into::into),
            self.until.map(Into::into),
        ) {
            out.push(window);
        }
        for (name, values) in &self.tags {
            let Some(kind) = TagKind::from_name(name) else {
                out.push(sql::Fragment::never());
                continue;
            };
            let table = schema::tag_table(kind);
            let tagged = build(
                select(&[table.associated_event]),
                table.name,
                vec![in_set(
                    table.value,
                    Members::Bind(values.iter().map(Into::into).collect()),
                )],
                &[],
                None,
            );
            out.push(in_set(schema::EVENT_ID, Members::Query(tagged)));
        }
        out
    }

    /// Values this filter binds into a statement, including its limit.
    pub fn bound_values(&self) -> usize {
        let listed = |v: &Option<Vec<_>>| v.as_ref().map_or(0, Vec::len);
        listed(&self.ids)
            + listed(&self.authors)
            + self.kinds.as_ref().map_or(0, Vec::len)
            + self.tags.values().map(Vec::len).sum::<usize>()
            + 3
    }
}

/// Full-length keys are compared for equality, shorter ones as prefixes.
fn key_match(field: sql::Field, keys: &[String]) -> sql::Fragment {
    let (exact, partial): (Vec<&String>, Vec<&String>) =
        keys.iter().partition(|k| k.len() == KEY_HEX_LEN);
    let mut tests = vec![];
    if !exact.is_empty() {
        tests.push(in_set(
            field,
            Members::Bind(exact.into_iter().map(Into::into).collect()),
        ));
    }
    if !partial.is_empty() {
        tests.push(prefix(
            field,
            Prefixes::Bind(partial.into_iter().cloned().collect()),
        ));
    }
    if tests.len() == 1 {
        tests.remove(0)
    } else {
        sql::combine_or(tests)
    }
}

/// Hex length of a full event id or public key.
const KEY_HEX_LEN: usize = 64;

fn is_tag_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars.next() == Some('#')
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.next().is_none()
}

fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

fn strings(key: &str, v: &Value) -> Result<Vec<String>, ProtocolError> {
    v.as_array()
        .ok_or_else(|| ProtocolError::Filter(format!("{key} must be a list")))?
        .iter()
        .map(|s| {
            s.as_str()
                .map(str::to_string)
                .ok_or_else(|| ProtocolError::Filter(format!("{key} entries must be strings")))
        })
        .collect()
}

fn hex_prefixes(key: &str, v: &Value) -> Result<Vec<String>, ProtocolError> {
    let values = strings(key, v)?;
    for s in &values {
        let is_hex = s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if s.is_empty() || s.len() > KEY_HEX_LEN || !is_hex {
            return Err(ProtocolError::Filter(format!(
                "{key} entry {s:?} is not a lowercase hex prefix"
            )));
        }
    }
    Ok(values)
}

fn integer(key: &str, v: &Value) -> Result<u64, ProtocolError> {
    v.as_u64()
        .ok_or_else(|| ProtocolError::Filter(format!("{key} must be a non-negative integer")))
}

fn integers(key: &str, v: &Value) -> Result<Vec<u64>, ProtocolError> {
    v.as_array()
        .ok_or_else(|| ProtocolError::Filter(format!("{key} must be a list")))?
        .iter()
        .map(|i| integer(key, i))
        .collect()
}

/// Statement selecting stored events matching any filter, newest first.
///
/// Every filter is ordered and limited on its own; `cap` bounds each limit and
/// stands in when a filter has none.
pub fn select_events(filters: &[Filter], cap: u64) -> Statement {
    let arms = filters
        .iter()
        .map(|f| {
            let limit = f.limit.map_or(cap, |l| l.min(cap));
            build(
                select(&schema::EVENT_COLUMNS),
                schema::EVENT,
                f.clauses(),
                &[Order::Desc(schema::EVENT_CREATED_AT)],
                Some(limit),
            )
        })
        .collect();
    build(
        select(&schema::EVENT_COLUMNS_BARE),
        union(arms),
        vec![],
        &[Order::Desc(sql::bare("created_at"))],
        None,
    )
}

/// Statement counting distinct stored events matching any filter.
///
/// Limits do not apply to counts.
pub fn count_events(filters: &[Filter]) -> Statement {
    let arms = filters
        .iter()
        .map(|f| build(select(&[schema::EVENT_ID]), schema::EVENT, f.clauses(), &[], None))
        .collect();
    build(Select::count(), union(arms), vec![], &[], None)
}

/// One field test of a compiled filter.
#[derive(Debug)]
enum FieldTest {
    Id(Regex),
    Author(Regex),
    Kind(HashSet<u32>),
    Window { since: Option<u64>, until: Option<u64> },
    /// `None` for tag names the relay never stores.
    Tag {
        kind: Option<TagKind>,
        values: HashSet<String>,
    },
}

impl FieldTest {
    fn test(&self, ev: &Event) -> bool {
        match self {
            FieldTest::Id(re) => re.is_match(&ev.id),
            FieldTest::Author(re) => re.is_match(&ev.pubkey),
            FieldTest::Kind(kinds) => kinds.contains(&ev.kind),
            FieldTest::Window { since, until } => {
                since.map_or(true, |s| s <= ev.created_at)
                    && until.map_or(true, |u| ev.created_at <= u)
            }
            FieldTest::Tag { kind, values } => kind.is_some_and(|kind| {
                ev.tags
                    .iter()
                    .any(|t| t.kind() == kind && values.contains(t.value()))
            }),
        }
    }
}

fn prefix_regex(prefixes: &[String]) -> Result<Regex, ProtocolError> {
    let alternation = prefixes
        .iter()
        .map(|p| regex::escape(p))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("^(?:{alternation})")).map_err(|e| ProtocolError::Filter(e.to_string()))
}

/// Compiled form of a filter set: OR across filters, AND within each.
#[derive(Debug)]
pub struct Predicate {
    filters: Vec<Vec<FieldTest>>,
}

impl Predicate {
    pub fn compile(filters: &[Filter]) -> Result<Self, ProtocolError> {
        let filters = filters
            .iter()
            .map(|f| {
                let mut tests = vec![];
                if let Some(ids) = &f.ids {
                    tests.push(FieldTest::Id(prefix_regex(ids)?));
                }
                if let Some(authors) = &f.authors {
                    tests.push(FieldTest::Author(prefix_regex(authors)?));
                }
                if let Some(kinds) = &f.kinds {
                    tests.push(FieldTest::Kind(kinds.iter().copied().collect()));
                }
                if f.since.is_some() || f.until.is_some() {
                    tests.push(FieldTest::Window {
                        since: f.since,
                        until: f.until,
                    });
                }
                for (name, values) in &f.tags {
                    tests.push(FieldTest::Tag {
                        kind: TagKind::from_name(name),
                        values: values.iter().cloned().collect(),
                    });
                }
                Ok(tests)
            })
            .collect::<Result<Vec<_>, ProtocolError>>()?;
        Ok(Self { filters })
    }

    pub fn test(&self, ev: &Event) -> bool {
        self.filters
            .iter()
            .any(|tests| tests.iter().all(|t| t.test(ev)))
    }
}
