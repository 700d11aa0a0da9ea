//! Event store: storage dispositions on write, filter queries on read.

use std::{collections::HashMap, path::Path, sync::Arc};

use tracing::debug;

use crate::{
    db::{Batch, BatchOutcome, Row, Sqlite, Storage},
    error::{ProtocolError, RelayError, StorageError, ValidationError},
    event::{ActorTag, Disposition, Event, Marker, ReferenceTag, Tag, TagKind},
    filter::{self, Filter},
    schema::{self, TagTable},
    sql::{build, delete, equals, in_set, insert, range, select, union, Members, Operand, Order, Value},
    validation,
};

/// What a write did with the submitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Inserted as a new row.
    Stored,
    /// Already stored; nothing changed.
    Duplicate,
    /// Inserted after removing this many older replaceable events.
    Replaced(usize),
    /// A replaceable event at least as new is already stored.
    Dropped,
    /// Deletion request applied to this many stored events.
    Deleted(usize),
    /// Ephemeral; never persisted.
    NotStored,
}

impl WriteOutcome {
    /// Whether the event should be fanned out to live subscriptions.
    pub fn is_broadcast(self) -> bool {
        !matches!(self, WriteOutcome::Duplicate)
    }
}

/// Filters accepted per REQ or COUNT unless configured otherwise.
pub const DEFAULT_MAX_FILTERS: usize = 100;

/// Highest configurable filter count; each filter is one compound SELECT arm.
pub const FILTERS_CEILING: usize = 256;

/// Bound values allowed in one filter statement.
const MAX_BOUND_VALUES: usize = 30_000;

/// Events whose tags are fetched by one statement.
const HYDRATE_CHUNK: usize = 500;

/// Rows per tag insert, and targets per deletion statement.
const WRITE_CHUNK: usize = 1_000;

/// Persistent store for events and their tags.
#[derive(Clone)]
pub struct Store {
    db: Arc<dyn Storage>,
    limit_max: u64,
    max_filters: usize,
}

impl Store {
    pub fn new(db: Arc<dyn Storage>, limit_max: u64) -> Self {
        Self {
            db,
            limit_max,
            max_filters: DEFAULT_MAX_FILTERS,
        }
    }

    /// Accept at most `max` filters per request, within `1..=FILTERS_CEILING`.
    pub fn with_max_filters(mut self, max: usize) -> Self {
        self.max_filters = max.clamp(1, FILTERS_CEILING);
        self
    }

    /// Reject filter sets too large to run as one statement.
    pub fn check_filters(&self, filters: &[Filter]) -> Result<(), ProtocolError> {
        if filters.len() > self.max_filters {
            return Err(ProtocolError::TooManyFilters {
                count: filters.len(),
                max: self.max_filters,
            });
        }
        let values: usize = filters.iter().map(Filter::bound_values).sum();
        if values > MAX_BOUND_VALUES {
            return Err(ProtocolError::TooManyValues {
                count: values,
                max: MAX_BOUND_VALUES,
            });
        }
        Ok(())
    }

    /// Open the SQLite database at `path`, creating the schema if needed.
    pub fn open(path: &Path, readers: u32, limit_max: u64) -> Result<Self, StorageError> {
        Ok(Self::new(Arc::new(Sqlite::open(path, readers)?), limit_max))
    }

    /// Apply the storage disposition of `ev`'s kind.
    pub async fn write(&self, ev: &Event) -> Result<WriteOutcome, RelayError> {
        let outcome = match ev.disposition() {
            Disposition::Regular => self.insert(ev).await?,
            Disposition::ReplaceableByAuthor | Disposition::ReplaceableByAuthorKind => {
                self.replace(ev).await?
            }
            Disposition::Deletion => self.delete_referenced(ev).await?,
            Disposition::Ephemeral => WriteOutcome::NotStored,
            Disposition::Unsupported => {
                return Err(ValidationError::UnsupportedKind(ev.kind).into())
            }
        };
        debug!(id = %ev.id, kind = ev.kind, ?outcome, "write");
        Ok(outcome)
    }

    async fn insert(&self, ev: &Event) -> Result<WriteOutcome, StorageError> {
        let mut batch = Batch::new();
        push_event(&mut batch, ev);
        match self.db.apply(batch).await {
            Ok(_) => Ok(WriteOutcome::Stored),
            Err(StorageError::Conflict) => Ok(WriteOutcome::Duplicate),
            Err(e) => Err(e),
        }
    }

    /// Latest wins per (author, kind). The guard and the swap run in one
    /// transaction, so concurrent writers cannot both win.
    async fn replace(&self, ev: &Event) -> Result<WriteOutcome, StorageError> {
        let slot = || {
            vec![
                equals(schema::EVENT_PUBKEY, Operand::Bind(ev.pubkey.as_str().into())),
                equals(schema::EVENT_KIND, Operand::Bind(ev.kind.into())),
            ]
        };
        let mut newer = slot();
        newer.extend(range(
            schema::EVENT_CREATED_AT,
            Some(ev.created_at.into()),
            None,
        ));
        let guard = build(
            select(&[schema::EVENT_ID]),
            schema::EVENT,
            newer,
            &[Order::Desc(schema::EVENT_CREATED_AT)],
            Some(1),
        );
        let mut batch = Batch::guarded(guard);
        let removal = batch.push(delete(schema::EVENT, slot()));
        push_event(&mut batch, ev);
        match self.db.apply(batch).await {
            Ok(BatchOutcome::Applied(affected)) => match affected.get(removal) {
                Some(&n) if n > 0 => Ok(WriteOutcome::Replaced(n)),
                _ => Ok(WriteOutcome::Stored),
            },
            Ok(BatchOutcome::Skipped(row)) => {
                if row.first().and_then(Value::as_str) == Some(ev.id.as_str()) {
                    Ok(WriteOutcome::Duplicate)
                } else {
                    Ok(WriteOutcome::Dropped)
                }
            }
            Err(StorageError::Conflict) => Ok(WriteOutcome::Duplicate),
            Err(e) => Err(e),
        }
    }

    /// Remove the author's own events referenced by `e` tags.
    async fn delete_referenced(&self, ev: &Event) -> Result<WriteOutcome, StorageError> {
        let targets: Vec<Value> = ev.referenced_events().map(Value::from).collect();
        if targets.is_empty() {
            return Ok(WriteOutcome::Deleted(0));
        }
        let mut batch = Batch::new();
        for chunk in targets.chunks(WRITE_CHUNK) {
            batch.push(delete(
                schema::EVENT,
                vec![
                    equals(schema::EVENT_PUBKEY, Operand::Bind(ev.pubkey.as_str().into())),
                    in_set(schema::EVENT_ID, Members::Bind(chunk.to_vec())),
                ],
            ));
        }
        match self.db.apply(batch).await? {
            BatchOutcome::Applied(affected) => Ok(WriteOutcome::Deleted(affected.iter().sum())),
            BatchOutcome::Skipped(_) => Ok(WriteOutcome::Deleted(0)),
        }
    }

    /// Stored events matching any filter, newest first.
    pub async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>, RelayError> {
        if filters.is_empty() {
            return Ok(vec![]);
        }
        self.check_filters(filters)?;
        let rows = self
            .db
            .query(filter::select_events(filters, self.limit_max))
            .await?;
        Ok(self.hydrate(rows).await?)
    }

    /// Number of distinct stored events matching any filter.
    pub async fn count(&self, filters: &[Filter]) -> Result<u64, RelayError> {
        if filters.is_empty() {
            return Ok(0);
        }
        self.check_filters(filters)?;
        let rows = self.db.query(filter::count_events(filters)).await?;
        let n = rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_i64)
            .ok_or_else(|| StorageError::Decode("count returned no rows".into()))?;
        Ok(u64::try_from(n).unwrap_or_default())
    }

    /// The stored event with exactly this id.
    pub async fn fetch_event(&self, id: &str) -> Result<Event, RelayError> {
        let stmt = build(
            select(&schema::EVENT_COLUMNS),
            schema::EVENT,
            vec![equals(schema::EVENT_ID, Operand::Bind(id.into()))],
            &[],
            Some(1),
        );
        let rows = self.db.query(stmt).await?;
        self.hydrate(rows)
            .await?
            .pop()
            .ok_or_else(|| RelayError::NotFound(id.to_string()))
    }

    /// Up to `n` stored events chosen at random.
    pub async fn sample(&self, n: u64) -> Result<Vec<Event>, RelayError> {
        let stmt = build(
            select(&schema::EVENT_COLUMNS),
            schema::EVENT,
            vec![],
            &[Order::Random],
            Some(n),
        );
        let rows = self.db.query(stmt).await?;
        Ok(self.hydrate(rows).await?)
    }

    /// Re-check id and signature of a random sample of stored events.
    pub async fn verify_sample(&self, n: u64) -> Result<usize, RelayError> {
        let events = self.sample(n).await?;
        for ev in &events {
            validation::verify_integrity(ev)?;
        }
        Ok(events.len())
    }

    /// Decode event rows and attach their tags in declaration order.
    async fn hydrate(&self, rows: Vec<Row>) -> Result<Vec<Event>, StorageError> {
        let mut events = rows
            .into_iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        if events.is_empty() {
            return Ok(events);
        }
        let ids: Vec<Value> = events.iter().map(|e| Value::from(&e.id)).collect();
        let mut by_event: HashMap<String, Vec<(i64, Tag)>> = HashMap::new();
        for chunk in ids.chunks(HYDRATE_CHUNK) {
            let arms = TagKind::ALL
                .iter()
                .map(|&kind| tag_rows(schema::tag_table(kind), kind, chunk))
                .collect();
            for row in self.db.query(union(arms)).await? {
                let (event_id, position, tag) = tag_from_row(row)?;
                by_event.entry(event_id).or_default().push((position, tag));
            }
        }
        for ev in &mut events {
            if let Some(mut tags) = by_event.remove(&ev.id) {
                tags.sort_by_key(|(position, _)| *position);
                ev.tags = tags.into_iter().map(|(_, t)| t).collect();
            }
        }
        Ok(events)
    }
}

fn push_event(batch: &mut Batch, ev: &Event) {
    batch.push(insert(
        schema::EVENT,
        &["id", "pubkey", "created_at", "kind", "content", "sig"],
        vec![vec![
            ev.id.as_str().into(),
            ev.pubkey.as_str().into(),
            ev.created_at.into(),
            ev.kind.into(),
            ev.content.as_str().into(),
            ev.sig.as_str().into(),
        ]],
    ));
    for kind in TagKind::ALL {
        let rows: Vec<Vec<Value>> = ev
            .tags
            .iter()
            .enumerate()
            .filter(|(_, t)| t.kind() == kind)
            .map(|(position, t)| {
                let (relay, extra) = match t {
                    Tag::Reference(r) => (r.relay.clone(), r.marker.map(|m| m.as_str().to_string())),
                    Tag::Actor(a) => (a.relay.clone(), a.petname.clone()),
                };
                vec![
                    ev.id.as_str().into(),
                    Value::from(position as i64),
                    t.value().into(),
                    relay.into(),
                    extra.into(),
                ]
            })
            .collect();
        let table = schema::tag_table(kind);
        for chunk in rows.chunks(WRITE_CHUNK) {
            batch.push(insert(table.name, &table.columns(), chunk.to_vec()));
        }
    }
}

/// Tag rows of one table as `(event, position, tag, value, relay, extra)`.
fn tag_rows(table: &TagTable, kind: TagKind, ids: &[Value]) -> crate::sql::Statement {
    let event_key = format!("{}.{}", table.name, table.associated_event.name);
    let position_key = format!("{}.{}", table.name, table.position.name);
    let projection = select(&[
        table.associated_event,
        table.position,
        table.value,
        table.relay,
        table.extra,
    ])
    .alias(table.value.name, "value")
    .alias(table.relay.name, "relay")
    .alias(table.extra.name, "extra")
    .literal(kind.name(), "tag")
    .ordered(&[
        event_key.as_str(),
        position_key.as_str(),
        "tag",
        "value",
        "relay",
        "extra",
    ]);
    build(
        projection,
        table.name,
        vec![in_set(table.associated_event, Members::Bind(ids.to_vec()))],
        &[],
        None,
    )
}

fn text(col: Option<Value>, name: &str) -> Result<String, StorageError> {
    match col {
        Some(Value::Text(s)) => Ok(s),
        other => Err(StorageError::Decode(format!("{name}: expected text, got {other:?}"))),
    }
}

fn optional_text(col: Option<Value>, name: &str) -> Result<Option<String>, StorageError> {
    match col {
        Some(Value::Null) => Ok(None),
        other => text(other, name).map(Some),
    }
}

fn integer(col: Option<Value>, name: &str) -> Result<i64, StorageError> {
    match col {
        Some(Value::Integer(i)) => Ok(i),
        other => Err(StorageError::Decode(format!("{name}: expected integer, got {other:?}"))),
    }
}

fn event_from_row(row: Row) -> Result<Event, StorageError> {
    let mut cols = row.into_iter();
    let id = text(cols.next(), "id")?;
    let pubkey = text(cols.next(), "pubkey")?;
    let created_at = integer(cols.next(), "created_at")?;
    let kind = integer(cols.next(), "kind")?;
    Ok(Event {
        id,
        pubkey,
        created_at: u64::try_from(created_at)
            .map_err(|_| StorageError::Decode(format!("negative created_at {created_at}")))?,
        kind: u32::try_from(kind).map_err(|_| StorageError::Decode(format!("kind {kind} out of range")))?,
        tags: vec![],
        content: text(cols.next(), "content")?,
        sig: text(cols.next(), "sig")?,
    })
}

fn tag_from_row(row: Row) -> Result<(String, i64, Tag), StorageError> {
    let mut cols = row.into_iter();
    let event_id = text(cols.next(), "associated_event")?;
    let position = integer(cols.next(), "position")?;
    let name = text(cols.next(), "tag")?;
    let value = text(cols.next(), "value")?;
    let relay = optional_text(cols.next(), "relay")?;
    let extra = optional_text(cols.next(), "extra")?;
    let tag = match TagKind::from_name(&name) {
        Some(TagKind::Reference) => Tag::Reference(ReferenceTag {
            event_id: value,
            relay,
            marker: extra.as_deref().and_then(Marker::parse),
        }),
        Some(TagKind::Actor) => Tag::Actor(ActorTag {
            pubkey: value,
            relay,
            petname: extra,
        }),
        None => return Err(StorageError::Decode(format!("unknown tag table {name:?}"))),
    };
    Ok((event_id, position, tag))
}
