//! Composable, self-quoting SQL fragments.
//!
//! Raw SQL text only ever comes from `&'static str` keywords inside this
//! module. Identifiers are double-quoted, literals single-quoted, and bound
//! values are emitted as positional `?` placeholders whose values travel with
//! the fragment in the same order as the text. Joining fragments therefore
//! keeps text and parameters aligned.

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};

/// A value bound to a placeholder or rendered as a literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub(crate) fn from_ref(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(r) => Value::Integer(r as i64),
            ValueRef::Text(t) | ValueRef::Blob(t) => {
                Value::Text(String::from_utf8_lossy(t).into_owned())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::Text(s.clone())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Value::Integer(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// A column, optionally qualified by its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub table: Option<&'static str>,
    pub name: &'static str,
}

/// Column qualified by table, rendered as `"table"."name"`.
pub const fn col(table: &'static str, name: &'static str) -> Field {
    Field {
        table: Some(table),
        name,
    }
}

/// Unqualified column, rendered as `"name"`.
pub const fn bare(name: &'static str) -> Field {
    Field { table: None, name }
}

impl Field {
    fn key(&self) -> String {
        match self.table {
            Some(t) => format!("{t}.{}", self.name),
            None => self.name.to_string(),
        }
    }
}

/// A piece of SQL text with the values its placeholders bind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fragment {
    sql: String,
    params: Vec<Value>,
}

impl Fragment {
    fn keyword(sql: &'static str) -> Self {
        Self {
            sql: sql.to_string(),
            params: vec![],
        }
    }

    fn ident(name: &str) -> Self {
        Self {
            sql: quote_ident(name),
            params: vec![],
        }
    }

    fn field(f: &Field) -> Self {
        let sql = match f.table {
            Some(t) => format!("{}.{}", quote_ident(t), quote_ident(f.name)),
            None => quote_ident(f.name),
        };
        Self {
            sql,
            params: vec![],
        }
    }

    fn literal(v: &Value) -> Self {
        let sql = match v {
            Value::Null => "NULL".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        };
        Self {
            sql,
            params: vec![],
        }
    }

    fn placeholder(v: Value) -> Self {
        Self {
            sql: "?".to_string(),
            params: vec![v],
        }
    }

    /// A clause that never holds.
    pub fn never() -> Self {
        Self::keyword("0 = 1")
    }

    fn then(mut self, other: Fragment) -> Self {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params);
        self
    }

    fn then_kw(mut self, sql: &'static str) -> Self {
        self.sql.push_str(sql);
        self
    }

    fn join(parts: impl IntoIterator<Item = Fragment>, sep: &'static str) -> Self {
        let mut out = Fragment::default();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                out.sql.push_str(sep);
            }
            out = out.then(part);
        }
        out
    }

    fn wrapped(self) -> Self {
        Fragment::keyword("(").then(self).then_kw(")")
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A runnable statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement(Fragment);

impl Statement {
    pub fn sql(&self) -> &str {
        self.0.sql()
    }

    pub fn params(&self) -> &[Value] {
        self.0.params()
    }

    fn into_fragment(self) -> Fragment {
        self.0
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone)]
pub enum Operand {
    /// Bound through a placeholder.
    Bind(Value),
    /// Rendered as a quoted literal.
    Literal(Value),
    /// The result of another statement.
    Query(Statement),
}

impl Operand {
    fn into_fragment(self) -> Fragment {
        match self {
            Operand::Bind(v) => Fragment::placeholder(v),
            Operand::Literal(v) => Fragment::literal(&v),
            Operand::Query(q) => q.into_fragment().wrapped(),
        }
    }
}

/// Values tested by [`in_set`].
#[derive(Debug, Clone)]
pub enum Members {
    Bind(Vec<Value>),
    Literal(Vec<Value>),
    Query(Statement),
}

/// Prefixes tested by [`prefix`].
#[derive(Debug, Clone)]
pub enum Prefixes {
    Bind(Vec<String>),
    Literal(Vec<String>),
}

/// Projection of a `SELECT`.
///
/// Items keep insertion order unless [`Select::ordered`] names a different one.
/// Keys are `table.name` for qualified fields, the bare name otherwise, or the
/// alias once one is assigned.
#[derive(Debug, Clone, Default)]
pub struct Select {
    items: Vec<(String, Fragment)>,
}

/// Start a projection over `fields`.
pub fn select(fields: &[Field]) -> Select {
    Select {
        items: fields
            .iter()
            .map(|f| (f.key(), Fragment::field(f)))
            .collect(),
    }
}

impl Select {
    /// `COUNT(*)` projection.
    pub fn count() -> Self {
        Select {
            items: vec![("count".into(), Fragment::keyword("COUNT(*)"))],
        }
    }

    /// Rename the field whose column name is `name`.
    pub fn alias(mut self, name: &str, alias: &'static str) -> Self {
        if let Some(item) = self
            .items
            .iter_mut()
            .find(|(key, _)| key.rsplit('.').next() == Some(name))
        {
            item.0 = alias.to_string();
            let expr = std::mem::take(&mut item.1);
            item.1 = expr.then_kw(" AS ").then(Fragment::ident(alias));
        }
        self
    }

    /// Project a constant under `alias`.
    pub fn literal(mut self, value: impl Into<Value>, alias: &'static str) -> Self {
        let frag = Fragment::literal(&value.into())
            .then_kw(" AS ")
            .then(Fragment::ident(alias));
        self.items.push((alias.to_string(), frag));
        self
    }

    /// Reorder (and restrict) the projection to the given keys.
    pub fn ordered(mut self, keys: &[&str]) -> Self {
        let mut items = std::mem::take(&mut self.items);
        self.items = keys
            .iter()
            .filter_map(|k| {
                let pos = items.iter().position(|(key, _)| key == k)?;
                Some(items.remove(pos))
            })
            .collect();
        self
    }

    fn into_fragment(self) -> Fragment {
        Fragment::keyword("SELECT ").then(Fragment::join(
            self.items.into_iter().map(|(_, f)| f),
            ", ",
        ))
    }
}

/// `field = rhs`
pub fn equals(field: Field, rhs: Operand) -> Fragment {
    Fragment::field(&field)
        .then_kw(" = ")
        .then(rhs.into_fragment())
}

/// True when `field` starts with any of the prefixes.
pub fn prefix(field: Field, prefixes: Prefixes) -> Fragment {
    let tests: Vec<Fragment> = match prefixes {
        Prefixes::Bind(ps) => ps
            .into_iter()
            .map(|p| instr_is_first(field, Fragment::placeholder(Value::Text(p))))
            .collect(),
        Prefixes::Literal(ps) => ps
            .into_iter()
            .map(|p| instr_is_first(field, Fragment::literal(&Value::Text(p))))
            .collect(),
    };
    combine_or(tests)
}

fn instr_is_first(field: Field, needle: Fragment) -> Fragment {
    Fragment::keyword("instr(")
        .then(Fragment::field(&field))
        .then_kw(", ")
        .then(needle)
        .then_kw(") = 1")
}

/// `field IN (...)`
pub fn in_set(field: Field, members: Members) -> Fragment {
    let values = match members {
        Members::Bind(vs) if vs.is_empty() => return Fragment::never(),
        Members::Literal(vs) if vs.is_empty() => return Fragment::never(),
        Members::Bind(vs) => Fragment::join(vs.into_iter().map(Fragment::placeholder), ", "),
        Members::Literal(vs) => Fragment::join(vs.iter().map(Fragment::literal), ", "),
        Members::Query(q) => q.into_fragment(),
    };
    Fragment::field(&field)
        .then_kw(" IN ")
        .then(values.wrapped())
}

/// `field >= gte AND field <= lte`, emitting only the bounds supplied.
pub fn range(field: Field, gte: Option<Value>, lte: Option<Value>) -> Option<Fragment> {
    let mut clauses = vec![];
    if let Some(v) = gte {
        clauses.push(
            Fragment::field(&field)
                .then_kw(" >= ")
                .then(Fragment::placeholder(v)),
        );
    }
    if let Some(v) = lte {
        clauses.push(
            Fragment::field(&field)
                .then_kw(" <= ")
                .then(Fragment::placeholder(v)),
        );
    }
    if clauses.is_empty() {
        None
    } else {
        Some(Fragment::join(clauses, " AND "))
    }
}

/// `(a OR b OR ...)`
///
/// Terms are nested as a balanced tree, `(a OR (b OR c))`, so the parsed
/// expression stays shallow however many terms there are.
pub fn combine_or(clauses: Vec<Fragment>) -> Fragment {
    if clauses.is_empty() {
        return Fragment::never();
    }
    balanced_or(clauses).wrapped()
}

fn balanced_or(mut clauses: Vec<Fragment>) -> Fragment {
    if clauses.len() <= 2 {
        return Fragment::join(clauses, " OR ");
    }
    let right = clauses.split_off(clauses.len() / 2);
    let side = |part: Vec<Fragment>| {
        if part.len() == 1 {
            Fragment::join(part, "")
        } else {
            balanced_or(part).wrapped()
        }
    };
    side(clauses).then_kw(" OR ").then(side(right))
}

/// `INSERT INTO table (fields) VALUES (...), (...)` with one group per row.
pub fn insert(table: &'static str, fields: &[&'static str], rows: Vec<Vec<Value>>) -> Statement {
    let head = Fragment::keyword("INSERT INTO ")
        .then(Fragment::ident(table))
        .then_kw(" ")
        .then(Fragment::join(fields.iter().map(|f| Fragment::ident(f)), ", ").wrapped())
        .then_kw(" VALUES ");
    let groups = rows
        .into_iter()
        .map(|row| Fragment::join(row.into_iter().map(Fragment::placeholder), ", ").wrapped());
    Statement(head.then(Fragment::join(groups, ", ")))
}

/// `DELETE FROM table WHERE a AND b`
pub fn delete(table: &'static str, clauses: Vec<Fragment>) -> Statement {
    let head = Fragment::keyword("DELETE FROM ").then(Fragment::ident(table));
    Statement(with_where(head, clauses))
}

/// Union of statements, each evaluated as its own subquery so per-arm
/// ordering and limits hold.
pub fn union(queries: Vec<Statement>) -> Statement {
    let mut queries = queries;
    if queries.len() == 1 {
        return queries.remove(0);
    }
    let arms = queries.into_iter().map(|q| {
        Fragment::keyword("SELECT * FROM ").then(q.into_fragment().wrapped())
    });
    Statement(Fragment::join(arms, " UNION "))
}

/// Row source of [`build`].
#[derive(Debug, Clone)]
pub enum Source {
    Table(&'static str),
    Subquery(Statement),
}

impl From<&'static str> for Source {
    fn from(t: &'static str) -> Self {
        Source::Table(t)
    }
}

impl From<Statement> for Source {
    fn from(q: Statement) -> Self {
        Source::Subquery(q)
    }
}

/// Ordering term.
#[derive(Debug, Clone, Copy)]
pub enum Order {
    Asc(Field),
    Desc(Field),
    Random,
}

impl Order {
    fn into_fragment(self) -> Fragment {
        match self {
            Order::Asc(f) => Fragment::field(&f).then_kw(" ASC"),
            Order::Desc(f) => Fragment::field(&f).then_kw(" DESC"),
            Order::Random => Fragment::keyword("random()"),
        }
    }
}

/// Assemble a runnable `SELECT`.
pub fn build(
    select: Select,
    source: impl Into<Source>,
    where_clauses: Vec<Fragment>,
    order_by: &[Order],
    limit: Option<u64>,
) -> Statement {
    let from = match source.into() {
        Source::Table(t) => Fragment::ident(t),
        Source::Subquery(q) => q.into_fragment().wrapped(),
    };
    let head = select.into_fragment().then_kw(" FROM ").then(from);
    let mut out = with_where(head, where_clauses);
    if !order_by.is_empty() {
        out = out
            .then_kw(" ORDER BY ")
            .then(Fragment::join(order_by.iter().map(|o| o.into_fragment()), ", "));
    }
    if let Some(n) = limit {
        out = out.then_kw(" LIMIT ").then(Fragment::placeholder(n.into()));
    }
    Statement(out)
}

fn with_where(head: Fragment, clauses: Vec<Fragment>) -> Fragment {
    if clauses.is_empty() {
        return head;
    }
    head.then_kw(" WHERE ").then(Fragment::join(clauses, " AND "))
}
