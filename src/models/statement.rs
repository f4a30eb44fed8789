//! Portable statements.
//!
//! A statement is a JSON object whose top-level marker key (`select`,
//! `insert`, `update`, `del`, `count`, `sum`, `avg`) names its query type.
//! Drivers parse it into a [`StatementAst`] before compiling it to their
//! native query language.

use crate::error::{DatastoreError, DsResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// A single stored record.
pub type Record = Map<String, Value>;

/// Query type a statement classifies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    Count,
    Sum,
    Avg,
}

impl QueryType {
    /// Marker keys in classification order.
    const MARKERS: [(&'static str, QueryType); 7] = [
        ("select", QueryType::Select),
        ("insert", QueryType::Insert),
        ("update", QueryType::Update),
        ("del", QueryType::Delete),
        ("count", QueryType::Count),
        ("sum", QueryType::Sum),
        ("avg", QueryType::Avg),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
        }
    }

    /// The top-level key that marks this query type in a statement.
    pub fn marker(&self) -> &'static str {
        match self {
            Self::Delete => "del",
            other => other.as_str(),
        }
    }

    /// Key naming the target table.
    fn table_key(&self) -> &'static str {
        match self {
            Self::Insert => "into",
            Self::Update => "using",
            _ => "from",
        }
    }

    fn allowed_keys(&self) -> &'static [&'static str] {
        match self {
            Self::Select => &["select", "from", "where", "limit", "skip", "orderBy"],
            Self::Insert => &["insert", "into"],
            Self::Update => &["update", "using", "where"],
            Self::Delete => &["del", "from", "where"],
            Self::Count => &["count", "from", "where"],
            Self::Sum => &["sum", "from", "where"],
            Self::Avg => &["avg", "from", "where"],
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A portable, declarative query description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Statement(Map<String, Value>);

impl Statement {
    pub fn new(body: Map<String, Value>) -> Self {
        Self(body)
    }

    /// Build a statement from an arbitrary JSON value; only objects qualify.
    pub fn from_value(value: Value) -> DsResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DatastoreError::unclassifiable(format!(
                "a statement must be a JSON object, got `{}`",
                other
            ))),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Classify by the recognized marker key. Exactly one marker must be present.
    pub fn query_type(&self) -> DsResult<QueryType> {
        let found: Vec<QueryType> = QueryType::MARKERS
            .iter()
            .filter(|(key, _)| self.0.contains_key(*key))
            .map(|(_, qt)| *qt)
            .collect();

        match found.as_slice() {
            [qt] => Ok(*qt),
            [] => Err(DatastoreError::unclassifiable(format!(
                "no recognized query type marker among keys [{}] (expected one of select, insert, update, del, count, sum, avg)",
                self.0.keys().cloned().collect::<Vec<_>>().join(", ")
            ))),
            many => Err(DatastoreError::unclassifiable(format!(
                "ambiguous statement: found {} query type markers ({})",
                many.len(),
                many.iter()
                    .map(QueryType::marker)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Parse into the structured form drivers compile from.
    pub fn parse(&self) -> DsResult<StatementAst> {
        let query_type = self.query_type()?;

        if let Some(extra) = self
            .0
            .keys()
            .find(|k| !query_type.allowed_keys().contains(&k.as_str()))
        {
            return Err(DatastoreError::unsupported_construct(format!(
                "`{}` is not supported in a {} statement",
                extra, query_type
            )));
        }

        let table = match self.0.get(query_type.table_key()) {
            Some(Value::String(t)) if !t.is_empty() => t.clone(),
            _ => {
                return Err(DatastoreError::malformed_statement(format!(
                    "a {} statement needs a non-empty `{}` table name",
                    query_type,
                    query_type.table_key()
                )));
            }
        };

        let marker = &self.0[query_type.marker()];
        let mut ast = StatementAst::new(query_type, table);

        match query_type {
            QueryType::Select => ast.columns = parse_columns(marker)?,
            QueryType::Insert => ast.records = parse_records(marker)?,
            QueryType::Update => match marker {
                Value::Object(values) if !values.is_empty() => ast.values = values.clone(),
                _ => {
                    return Err(DatastoreError::malformed_statement(
                        "`update` must be a non-empty object of new values",
                    ));
                }
            },
            QueryType::Sum | QueryType::Avg => match marker {
                Value::String(col) if !col.is_empty() => ast.aggregate = Some(col.clone()),
                _ => {
                    return Err(DatastoreError::malformed_statement(format!(
                        "`{}` must name the column to aggregate",
                        query_type.marker()
                    )));
                }
            },
            QueryType::Delete | QueryType::Count => {}
        }

        if let Some(clause) = self.0.get("where") {
            ast.predicate = parse_where(clause)?;
        }
        ast.limit = parse_bound(self.0.get("limit"), "limit")?;
        ast.skip = parse_bound(self.0.get("skip"), "skip")?;
        if let Some(order) = self.0.get("orderBy") {
            ast.sort = parse_sort(order)?;
        }

        Ok(ast)
    }
}

impl From<Map<String, Value>> for Statement {
    fn from(body: Map<String, Value>) -> Self {
        Self(body)
    }
}

/// Sort direction for one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortTerm {
    pub column: String,
    pub descending: bool,
}

/// Comparison operators accepted inside `where`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Nin,
    Like,
}

impl Comparison {
    fn from_modifier(key: &str) -> Option<Self> {
        Some(match key {
            "=" | "==" => Self::Eq,
            "!=" => Self::Ne,
            "<" => Self::Lt,
            "<=" => Self::Lte,
            ">" => Self::Gt,
            ">=" => Self::Gte,
            "in" => Self::In,
            "nin" => Self::Nin,
            "like" => Self::Like,
            _ => return None,
        })
    }
}

/// A parsed `where` clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Compare {
        column: String,
        op: Comparison,
        value: Value,
    },
}

impl Predicate {
    /// Evaluate against an in-memory record. Missing columns read as null.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::And(all) => all.iter().all(|p| p.matches(record)),
            Self::Or(any) => any.iter().any(|p| p.matches(record)),
            Self::Compare { column, op, value } => {
                let actual = record.get(column).unwrap_or(&Value::Null);
                match op {
                    Comparison::Eq => values_equal(actual, value),
                    Comparison::Ne => !values_equal(actual, value),
                    Comparison::Lt => compare_values(actual, value) == Some(Ordering::Less),
                    Comparison::Lte => matches!(
                        compare_values(actual, value),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                    Comparison::Gt => compare_values(actual, value) == Some(Ordering::Greater),
                    Comparison::Gte => matches!(
                        compare_values(actual, value),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    Comparison::In => value
                        .as_array()
                        .is_some_and(|items| items.iter().any(|v| values_equal(actual, v))),
                    Comparison::Nin => value
                        .as_array()
                        .is_none_or(|items| !items.iter().any(|v| values_equal(actual, v))),
                    Comparison::Like => match (actual, value) {
                        (Value::String(text), Value::String(pattern)) => like_match(pattern, text),
                        _ => false,
                    },
                }
            }
        }
    }
}

/// Structured form of a statement.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementAst {
    pub query_type: QueryType,
    pub table: String,
    /// Selected columns; `None` selects every column.
    pub columns: Option<Vec<String>>,
    /// Records to insert.
    pub records: Vec<Record>,
    /// New values for an update.
    pub values: Record,
    /// Column for `sum`/`avg`.
    pub aggregate: Option<String>,
    pub predicate: Option<Predicate>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    pub sort: Vec<SortTerm>,
}

impl StatementAst {
    fn new(query_type: QueryType, table: String) -> Self {
        Self {
            query_type,
            table,
            columns: None,
            records: Vec::new(),
            values: Record::new(),
            aggregate: None,
            predicate: None,
            limit: None,
            skip: None,
            sort: Vec::new(),
        }
    }
}

fn parse_columns(marker: &Value) -> DsResult<Option<Vec<String>>> {
    match marker {
        Value::String(s) if s == "*" => Ok(None),
        Value::String(s) if !s.is_empty() => Ok(Some(vec![s.clone()])),
        Value::Array(items) => {
            let mut columns = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some("*") => return Ok(None),
                    Some(col) if !col.is_empty() => columns.push(col.to_string()),
                    _ => {
                        return Err(DatastoreError::malformed_statement(
                            "`select` entries must be non-empty column names",
                        ));
                    }
                }
            }
            if columns.is_empty() {
                return Err(DatastoreError::malformed_statement(
                    "`select` must list at least one column",
                ));
            }
            Ok(Some(columns))
        }
        _ => Err(DatastoreError::malformed_statement(
            "`select` must be `*` or an array of column names",
        )),
    }
}

fn parse_records(marker: &Value) -> DsResult<Vec<Record>> {
    let records = match marker {
        Value::Object(record) => vec![record.clone()],
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_object().cloned().ok_or_else(|| {
                    DatastoreError::malformed_statement("every inserted record must be an object")
                })
            })
            .collect::<DsResult<Vec<_>>>()?,
        _ => {
            return Err(DatastoreError::malformed_statement(
                "`insert` must be a record or an array of records",
            ));
        }
    };
    if records.is_empty() {
        return Err(DatastoreError::malformed_statement(
            "`insert` needs at least one record",
        ));
    }
    Ok(records)
}

fn parse_bound(value: Option<&Value>, key: &str) -> DsResult<Option<u64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| {
            DatastoreError::malformed_statement(format!(
                "`{}` must be a non-negative integer",
                key
            ))
        }),
    }
}

fn parse_sort(order: &Value) -> DsResult<Vec<SortTerm>> {
    let terms = order.as_array().ok_or_else(|| {
        DatastoreError::malformed_statement("`orderBy` must be an array of `{column: direction}`")
    })?;

    let mut sort = Vec::with_capacity(terms.len());
    for term in terms {
        let entry = term
            .as_object()
            .filter(|o| o.len() == 1)
            .and_then(|o| o.iter().next())
            .ok_or_else(|| {
                DatastoreError::malformed_statement(
                    "each `orderBy` entry must have exactly one column",
                )
            })?;
        let descending = match entry.1.as_str().map(str::to_ascii_uppercase).as_deref() {
            Some("ASC") => false,
            Some("DESC") => true,
            _ => {
                return Err(DatastoreError::malformed_statement(format!(
                    "sort direction for `{}` must be ASC or DESC",
                    entry.0
                )));
            }
        };
        sort.push(SortTerm {
            column: entry.0.clone(),
            descending,
        });
    }
    Ok(sort)
}

/// Parse a `where` clause. An empty object means "no filter".
pub fn parse_where(clause: &Value) -> DsResult<Option<Predicate>> {
    let map = clause
        .as_object()
        .ok_or_else(|| DatastoreError::malformed_statement("`where` must be an object"))?;

    let mut parts = Vec::with_capacity(map.len());
    for (key, value) in map {
        match key.as_str() {
            "and" | "or" => {
                let branches = value.as_array().ok_or_else(|| {
                    DatastoreError::malformed_statement(format!(
                        "`{}` must be an array of conditions",
                        key
                    ))
                })?;
                let mut parsed = Vec::with_capacity(branches.len());
                for branch in branches {
                    if let Some(p) = parse_where(branch)? {
                        parsed.push(p);
                    }
                }
                parts.push(if key == "and" {
                    Predicate::And(parsed)
                } else {
                    Predicate::Or(parsed)
                });
            }
            column => parts.extend(parse_constraint(column, value)?),
        }
    }

    Ok(match parts.len() {
        0 => None,
        1 => parts.pop(),
        _ => Some(Predicate::And(parts)),
    })
}

fn parse_constraint(column: &str, value: &Value) -> DsResult<Vec<Predicate>> {
    let Value::Object(modifiers) = value else {
        return Ok(vec![Predicate::Compare {
            column: column.to_string(),
            op: Comparison::Eq,
            value: value.clone(),
        }]);
    };

    if modifiers.is_empty() {
        return Err(DatastoreError::malformed_statement(format!(
            "constraint for `{}` has no modifiers",
            column
        )));
    }

    modifiers
        .iter()
        .map(|(modifier, operand)| {
            let op = Comparison::from_modifier(modifier).ok_or_else(|| {
                DatastoreError::unsupported_construct(format!(
                    "unknown modifier `{}` on `{}`",
                    modifier, column
                ))
            })?;
            match op {
                Comparison::In | Comparison::Nin if !operand.is_array() => {
                    Err(DatastoreError::malformed_statement(format!(
                        "`{}` on `{}` needs an array",
                        modifier, column
                    )))
                }
                Comparison::Like if !operand.is_string() => {
                    Err(DatastoreError::malformed_statement(format!(
                        "`like` on `{}` needs a string pattern",
                        column
                    )))
                }
                _ => Ok(Predicate::Compare {
                    column: column.to_string(),
                    op,
                    value: operand.clone(),
                }),
            }
        })
        .collect()
}

/// Equality with numbers compared by value.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering between two JSON scalars of the same kind. Nulls sort first.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        _ => None,
    }
}

/// Case-insensitive SQL `LIKE` with `%` and `_` wildcards.
pub fn like_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();

    // matched[j] == pattern[..i] matches text[..j]
    let mut matched = vec![false; text.len() + 1];
    matched[0] = true;
    for p in &pattern {
        let mut next = vec![false; text.len() + 1];
        match p {
            '%' => {
                let mut seen = false;
                for j in 0..=text.len() {
                    seen |= matched[j];
                    next[j] = seen;
                }
            }
            '_' => {
                for j in 1..=text.len() {
                    next[j] = matched[j - 1];
                }
            }
            c => {
                for j in 1..=text.len() {
                    next[j] = matched[j - 1] && text[j - 1] == *c;
                }
            }
        }
        matched = next;
    }
    matched[text.len()]
}
