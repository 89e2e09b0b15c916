//! Query descriptors shared by both backends
//!
//! A `Query` says what to fetch: filters, an order, a size bound, an
//! optional ancestor and an optional cursor. Backends translate it into
//! their native form.

pub mod params;
pub mod subquery;

pub use params::{Access, QueryParams};
pub use subquery::{limit_subqueries, post_filter, SplitFilters, SUBQUERY_CEILING};

use crate::entity::Record;
use crate::pagination::{Cursor, CursorResult};
use crate::uid::Uid;
use crate::value::Value;
use crate::{Error, Result};

/// How a filter compares a property.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(Value),
    NotEq(Value),
    /// Membership: matches when the property equals any listed value
    In(Vec<Value>),
}

/// One condition on one property.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub property: String,
    pub op: FilterOp,
}

impl Filter {
    pub fn eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            property: property.into(),
            op: FilterOp::Eq(value.into()),
        }
    }

    pub fn not_eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            property: property.into(),
            op: FilterOp::NotEq(value.into()),
        }
    }

    pub fn is_in<V: Into<Value>>(property: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self {
            property: property.into(),
            op: FilterOp::In(values.into_iter().map(Into::into).collect()),
        }
    }

    /// Number of native subqueries this filter expands into.
    pub fn fan_out(&self) -> usize {
        match &self.op {
            FilterOp::In(values) => values.len(),
            _ => 1,
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        let actual = record.field(&self.property);
        match &self.op {
            FilterOp::Eq(v) => actual.filter_matches(v),
            FilterOp::NotEq(v) => !actual.filter_matches(v),
            FilterOp::In(values) => values.iter().any(|v| actual.filter_matches(v)),
        }
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.op {
            FilterOp::Eq(v) => write!(f, "{} = {}", self.property, v.display()),
            FilterOp::NotEq(v) => write!(f, "{} != {}", self.property, v.display()),
            FilterOp::In(values) => write!(f, "{} IN ({} values)", self.property, values.len()),
        }
    }
}

/// Sort order. No property means key order (uid order for relational
/// tables).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Order {
    pub property: Option<String>,
    pub descending: bool,
}

impl Order {
    /// `''` is key order, `'-'` reverse key order, `'-name'` descending by
    /// name.
    pub fn parse(s: &str) -> Self {
        let (descending, property) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        Self {
            property: (!property.is_empty()).then(|| property.to_string()),
            descending,
        }
    }

    pub fn ascending(property: impl Into<String>) -> Self {
        Self {
            property: Some(property.into()),
            descending: false,
        }
    }

    pub fn descending(property: impl Into<String>) -> Self {
        Self {
            property: Some(property.into()),
            descending: true,
        }
    }

    pub fn reversed(&self) -> Self {
        Self {
            property: self.property.clone(),
            descending: !self.descending,
        }
    }
}

impl std::fmt::Display for Order {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.descending {
            f.write_str("-")?;
        }
        f.write_str(self.property.as_deref().unwrap_or(""))
    }
}

/// How many results to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Finite(usize),
    Unbounded,
}

impl Limit {
    /// A positive integer, or `inf`.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "inf" | "infinity" => Ok(Limit::Unbounded),
            _ => s
                .parse()
                .map(Limit::Finite)
                .map_err(|_| Error::Validation(format!("Invalid n: {}", s))),
        }
    }
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Limit::Finite(n) => write!(f, "{}", n),
            Limit::Unbounded => f.write_str("inf"),
        }
    }
}

/// What to fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    /// `None` means the backend's default size
    pub limit: Option<Limit>,
    pub ancestor: Option<Uid>,
    pub cursor: Option<Cursor>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order(mut self, order: &str) -> Self {
        self.order = Some(Order::parse(order));
        self
    }

    pub fn limit(mut self, limit: Limit) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn n(self, n: usize) -> Self {
        self.limit(Limit::Finite(n))
    }

    pub fn ancestor(mut self, ancestor: Uid) -> Self {
        self.ancestor = Some(ancestor);
        self
    }

    pub fn cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// Lazily produced results of an unbounded query.
pub type ResultStream<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

/// What a query returns: a page with cursors, or a lazy stream when the
/// size is unbounded and the backend can stream.
pub enum QueryOutcome<T> {
    Page(CursorResult<T>),
    Stream(ResultStream<T>),
}

impl<T: Send + 'static> QueryOutcome<T> {
    /// Drain into a vector, dropping any cursors.
    pub fn into_vec(self) -> Result<Vec<T>> {
        match self {
            QueryOutcome::Page(page) => Ok(page.into_items()),
            QueryOutcome::Stream(stream) => stream.collect(),
        }
    }

    /// The page, if this outcome is one.
    pub fn page(self) -> Option<CursorResult<T>> {
        match self {
            QueryOutcome::Page(page) => Some(page),
            QueryOutcome::Stream(_) => None,
        }
    }

    pub fn try_map<U: Send + 'static>(
        self,
        mut f: impl FnMut(T) -> Result<U> + Send + 'static,
    ) -> Result<QueryOutcome<U>> {
        Ok(match self {
            QueryOutcome::Page(page) => QueryOutcome::Page(page.try_map(f)?),
            QueryOutcome::Stream(stream) => {
                QueryOutcome::Stream(Box::new(stream.map(move |item| item.and_then(&mut f))))
            }
        })
    }
}

impl<T> std::fmt::Debug for QueryOutcome<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryOutcome::Page(page) => f.debug_tuple("Page").field(page).finish(),
            QueryOutcome::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}
