//! Caller-facing query parameters
//!
//! Turns `key=value` pairs from a query string into a typed `Query`:
//! - `n`: page size, an integer or `inf`
//! - `ancestor`: uid scoping the query to one entity group
//! - `order`: property name, `-` prefix for descending
//! - `cursor`: position returned by a previous page
//! - `uid`: repeatable; a batch get that can't be mixed with anything else
//! - any declared property, with a trailing `!` to negate
//!
//! Undeclared properties are dropped. Unbounded size and negation are
//! reserved for privileged callers.

use super::{Filter, FilterOp, Limit, Order, Query};
use crate::entity::{EntitySchema, META_FIELDS};
use crate::pagination::Cursor;
use crate::uid::Uid;
use crate::{Error, Result};

/// Page size for callers that don't ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Who is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    /// May run unbounded and negated queries
    Privileged,
}

/// A parsed request: either a batch get by uid or a search.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParams {
    ByUid(Vec<String>),
    Search(Query),
}

impl QueryParams {
    pub fn parse(pairs: &[(String, String)], schema: &EntitySchema, access: Access) -> Result<Self> {
        if pairs.iter().any(|(k, _)| k == "uid") {
            if pairs.iter().any(|(k, _)| k != "uid") {
                return Err(Error::Validation(
                    "Can't mix uid parameter with any others.".to_string(),
                ));
            }
            return Ok(QueryParams::ByUid(pairs.iter().map(|(_, v)| v.clone()).collect()));
        }

        let property_types = schema.property_types();
        let mut query = Query::new();
        let mut filters: Vec<(String, bool, Vec<String>)> = Vec::new();

        for (key, value) in pairs {
            match key.as_str() {
                "n" => query.limit = Some(Limit::parse(value)?),
                "order" => {
                    let order = Order::parse(value);
                    if let Some(property) = &order.property {
                        let known = property_types.contains_key(property)
                            || META_FIELDS.contains(&property.as_str());
                        if !known {
                            return Err(Error::Validation(format!(
                                "Can't order by unknown property: {}",
                                property
                            )));
                        }
                    }
                    query.order = Some(order);
                }
                "cursor" => query.cursor = Some(Cursor::parse(value)?),
                "ancestor" => {
                    let ancestor = Uid::parse(value)
                        .ok_or_else(|| Error::InvalidUid(format!("Invalid ancestor: {}", value)))?;
                    query.ancestor = Some(ancestor);
                }
                _ => {
                    let (name, negated) = match key.strip_suffix('!') {
                        Some(name) => (name, true),
                        None => (key.as_str(), false),
                    };
                    if !property_types.contains_key(name) {
                        tracing::debug!("Dropping undeclared query parameter {}", key);
                        continue;
                    }
                    match filters.iter_mut().find(|(n, neg, _)| n == name && *neg == negated) {
                        Some((_, _, values)) => values.push(value.clone()),
                        None => filters.push((name.to_string(), negated, vec![value.clone()])),
                    }
                }
            }
        }

        for (name, negated, raw_values) in filters {
            if negated && access != Access::Privileged {
                return Err(Error::PermissionDenied(format!(
                    "Negated filters are restricted: {}!",
                    name
                )));
            }
            let ty = property_types[&name];
            let mut values = raw_values
                .iter()
                .map(|raw| ty.coerce(raw))
                .collect::<Result<Vec<_>>>()?;

            let op = match (negated, values.len()) {
                (false, 1) => FilterOp::Eq(values.remove(0)),
                (true, 1) => FilterOp::NotEq(values.remove(0)),
                (false, _) => FilterOp::In(values),
                (true, _) => {
                    return Err(Error::Validation(format!("Can't negate a list: {}!", name)));
                }
            };
            query.filters.push(Filter { property: name, op });
        }

        match (query.limit, access) {
            (Some(Limit::Unbounded), Access::Public) => {
                return Err(Error::PermissionDenied(
                    "Unbounded queries are restricted.".to_string(),
                ));
            }
            (None, Access::Privileged) => query.limit = Some(Limit::Unbounded),
            (None, Access::Public) => query.limit = Some(Limit::Finite(DEFAULT_PAGE_SIZE)),
            _ => {}
        }

        Ok(QueryParams::Search(query))
    }
}
