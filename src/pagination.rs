//! Pagination - cursors, paged results, and Link headers
//!
//! Both backends page through results with a `Cursor`, but the two kinds
//! never mix: relational results carry integer offsets, document results
//! carry opaque tokens. `CursorResult` wraps one page and reads like a
//! plain slice.

use crate::{Error, Result};
use std::ops::Deref;

/// Largest offset a relational cursor may carry. SQLite binds offsets as
/// signed 64-bit integers.
pub const MAX_OFFSET: u64 = i64::MAX as u64;

/// A position in a result set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Cursor {
    /// Row offset into a relational query
    Offset(u64),
    /// Opaque, URL-safe document store position
    Token(String),
}

impl Cursor {
    /// Wire form, safe to put in a query string.
    pub fn urlsafe(&self) -> String {
        match self {
            Cursor::Offset(n) => n.to_string(),
            Cursor::Token(t) => t.clone(),
        }
    }

    /// Parse a wire cursor. Digits are an offset; anything else must look
    /// like a URL-safe token.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::Validation("Empty cursor".to_string()));
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            return s
                .parse::<u64>()
                .ok()
                .filter(|n| *n <= MAX_OFFSET)
                .map(Cursor::Offset)
                .ok_or_else(|| Error::Validation(format!("Cursor out of range: {}", s)));
        }
        if s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
            Ok(Cursor::Token(s.to_string()))
        } else {
            Err(Error::Validation(format!("Malformed cursor: {}", s)))
        }
    }

    /// Offset of a relational cursor.
    pub fn as_offset(&self) -> Result<u64> {
        match self {
            Cursor::Offset(n) if *n > MAX_OFFSET => {
                Err(Error::Validation(format!("Cursor out of range: {}", n)))
            }
            Cursor::Offset(n) => Ok(*n),
            Cursor::Token(_) => Err(Error::Validation(
                "Relational queries take integer cursors".to_string(),
            )),
        }
    }

    /// Token of a document cursor.
    pub fn as_token(&self) -> Result<&str> {
        match self {
            Cursor::Token(t) => Ok(t),
            Cursor::Offset(_) => Err(Error::Validation(
                "Document queries take opaque cursors, not offsets".to_string(),
            )),
        }
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.urlsafe())
    }
}

/// One page of results plus the cursors around it.
///
/// Derefs to a slice. Cursors are only set for queries with a finite size.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorResult<T> {
    items: Vec<T>,
    pub next_cursor: Option<Cursor>,
    pub previous_cursor: Option<Cursor>,
    /// Only relational results know where the last page starts.
    pub last_cursor: Option<Cursor>,
    pub more: bool,
}

impl<T> CursorResult<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
            previous_cursor: None,
            last_cursor: None,
            more: false,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    pub fn has_cursors(&self) -> bool {
        self.next_cursor.is_some() || self.previous_cursor.is_some()
    }

    /// Replace the items, keeping the cursors.
    pub fn with_items<U>(self, items: Vec<U>) -> CursorResult<U> {
        CursorResult {
            items,
            next_cursor: self.next_cursor,
            previous_cursor: self.previous_cursor,
            last_cursor: self.last_cursor,
            more: self.more,
        }
    }

    pub fn try_map<U>(mut self, f: impl FnMut(T) -> Result<U>) -> Result<CursorResult<U>> {
        let items = std::mem::take(&mut self.items);
        let mapped = items.into_iter().map(f).collect::<Result<Vec<_>>>()?;
        Ok(self.with_items(mapped))
    }
}

impl<T> Deref for CursorResult<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T> IntoIterator for CursorResult<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// Offsets of the neighbouring pages of a relational query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetCursors {
    pub previous: u64,
    pub next: u64,
    pub last: u64,
}

/// Page boundaries for `limit`-sized pages over `total` rows.
///
/// ```text
/// | page boundary   - row   ^ last cursor
///
/// |                  zero rows
/// ^
/// |- -|              two rows, limit 2: step back to the start
/// ^
/// |- -|- -|          four rows, limit 2
///     ^
/// |- -|-             three rows, limit 2
///     ^
/// ```
pub fn offset_cursors(offset: u64, limit: u64, total: u64) -> OffsetCursors {
    if limit == 0 {
        return OffsetCursors {
            previous: 0,
            next: 0,
            last: 0,
        };
    }
    let mut last_page = total / limit;
    if total > 0 && total % limit == 0 {
        last_page -= 1;
    }
    let last = last_page * limit;
    OffsetCursors {
        previous: offset.saturating_sub(limit),
        next: offset.saturating_add(limit).min(last),
        last,
    }
}

/// Toggle the direction of an order string. `''` (key order) becomes `'-'`.
pub fn reverse_order(order: &str) -> String {
    match order.strip_prefix('-') {
        Some(rest) => rest.to_string(),
        None => format!("-{}", order),
    }
}

/// Replace (or, with `None`, remove) query parameters in a path with a
/// query string. Other parameters keep their order.
pub fn set_query_parameters(path_and_query: &str, updates: &[(&str, Option<&str>)]) -> String {
    let (path, query) = path_and_query
        .split_once('?')
        .unwrap_or((path_and_query, ""));

    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| {
            let (k, v) = p.split_once('=').unwrap_or((p, ""));
            (decode(k), decode(v))
        })
        .filter(|(k, _)| !updates.iter().any(|(u, _)| u == k))
        .collect();

    for (key, value) in updates {
        if let Some(value) = value {
            pairs.push((key.to_string(), value.to_string()));
        }
    }

    if pairs.is_empty() {
        return path.to_string();
    }
    let query = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", path, query)
}

fn decode(s: &str) -> String {
    let s = s.replace('+', " ");
    urlencoding::decode(&s)
        .map(|c| c.into_owned())
        .unwrap_or(s)
}

/// Build an RFC 5988 `Link` header for a page of results.
///
/// Without a last cursor (document results) the last link points at the
/// first page of the reverse-ordered query, which is off by up to a page
/// when the total isn't a multiple of the page size. Returns `None` when the
/// results carry no cursors at all.
pub fn link_header<T>(path_and_query: &str, results: &CursorResult<T>, order: &str) -> Option<String> {
    if !results.has_cursors() {
        return None;
    }

    let cursor_url = |cursor: &Option<Cursor>| {
        let value = cursor.as_ref().map(Cursor::urlsafe);
        set_query_parameters(path_and_query, &[("cursor", value.as_deref())])
    };

    let first = set_query_parameters(path_and_query, &[("cursor", None)]);
    let previous = cursor_url(&results.previous_cursor);
    let next = cursor_url(&results.next_cursor);
    let last = match &results.last_cursor {
        Some(_) => cursor_url(&results.last_cursor),
        None => {
            let reversed = reverse_order(order);
            set_query_parameters(
                path_and_query,
                &[("cursor", None), ("order", Some(reversed.as_str()))],
            )
        }
    };

    Some(
        [
            format!("<{}>;rel=self", path_and_query),
            format!("<{}>;rel=first", first),
            format!("<{}>;rel=previous", previous),
            format!("<{}>;rel=next", next),
            format!("<{}>;rel=last", last),
        ]
        .join(","),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_cursors_middle_page() {
        // limit 2, offset 2, five rows
        let c = offset_cursors(2, 2, 5);
        assert_eq!(c, OffsetCursors { previous: 0, next: 4, last: 4 });
    }

    #[test]
    fn test_offset_cursors_boundaries() {
        assert_eq!(offset_cursors(0, 2, 0), OffsetCursors { previous: 0, next: 0, last: 0 });
        assert_eq!(offset_cursors(0, 2, 2).last, 0);
        assert_eq!(offset_cursors(0, 2, 4).last, 2);
        assert_eq!(offset_cursors(0, 2, 3).last, 2);
        // Next never passes the last page.
        assert_eq!(offset_cursors(4, 2, 5).next, 4);
        assert_eq!(offset_cursors(1, 2, 5).previous, 0);
    }

    #[test]
    fn test_cursor_parse() {
        assert_eq!(Cursor::parse("40").unwrap(), Cursor::Offset(40));
        assert_eq!(Cursor::parse("eyJ4IjoxfQ").unwrap(), Cursor::Token("eyJ4IjoxfQ".into()));
        assert!(Cursor::parse("").is_err());
        assert!(Cursor::parse("a b").is_err());
        assert!(Cursor::parse("12").unwrap().as_token().is_err());
        assert!(Cursor::parse("abc").unwrap().as_offset().is_err());
    }

    #[test]
    fn test_cursor_offsets_stay_in_sql_range() {
        assert_eq!(Cursor::parse("9223372036854775807").unwrap(), Cursor::Offset(MAX_OFFSET));
        assert!(matches!(Cursor::parse("9223372036854775808"), Err(Error::Validation(_))));
        assert!(matches!(Cursor::parse("18446744073709551615"), Err(Error::Validation(_))));
        assert!(matches!(Cursor::parse("99999999999999999999"), Err(Error::Validation(_))));
        assert!(Cursor::Offset(u64::MAX).as_offset().is_err());
    }

    #[test]
    fn test_offset_cursors_past_the_end() {
        // At or beyond the last row, next clamps to the last page.
        assert_eq!(offset_cursors(5, 2, 5), OffsetCursors { previous: 3, next: 4, last: 4 });
        assert_eq!(offset_cursors(100, 2, 5).next, 4);
        let far = offset_cursors(u64::MAX, 2, 5);
        assert_eq!(far.next, 4);
        assert_eq!(far.previous, u64::MAX - 2);
    }

    #[test]
    fn test_reverse_order() {
        assert_eq!(reverse_order(""), "-");
        assert_eq!(reverse_order("-"), "");
        assert_eq!(reverse_order("name"), "-name");
        assert_eq!(reverse_order("-name"), "name");
    }

    #[test]
    fn test_set_query_parameters() {
        assert_eq!(
            set_query_parameters("/api/widgets?n=2&cursor=4", &[("cursor", Some("6"))]),
            "/api/widgets?n=2&cursor=6"
        );
        assert_eq!(
            set_query_parameters("/api/widgets?cursor=4", &[("cursor", None)]),
            "/api/widgets"
        );
        assert_eq!(
            set_query_parameters("/api/widgets?name=a%20b", &[("order", Some("-name"))]),
            "/api/widgets?name=a%20b&order=-name"
        );
    }

    #[test]
    fn test_link_header_with_last_cursor() {
        let mut results = CursorResult::new(vec![1, 2]);
        results.previous_cursor = Some(Cursor::Offset(0));
        results.next_cursor = Some(Cursor::Offset(4));
        results.last_cursor = Some(Cursor::Offset(4));

        let header = link_header("/api/widgets?n=2&cursor=2", &results, "").unwrap();
        assert_eq!(
            header,
            "</api/widgets?n=2&cursor=2>;rel=self,\
             </api/widgets?n=2>;rel=first,\
             </api/widgets?n=2&cursor=0>;rel=previous,\
             </api/widgets?n=2&cursor=4>;rel=next,\
             </api/widgets?n=2&cursor=4>;rel=last"
        );
    }

    #[test]
    fn test_link_header_reverse_last() {
        let mut results = CursorResult::new(vec!["a"]);
        results.next_cursor = Some(Cursor::Token("abc".into()));
        let header = link_header("/api/themes?n=1", &results, "name").unwrap();
        assert!(header.ends_with("</api/themes?n=1&order=-name>;rel=last"));
        assert!(header.contains("</api/themes?n=1>;rel=previous"));
    }

    #[test]
    fn test_no_cursors_no_header() {
        let results = CursorResult::new(vec![1]);
        assert!(link_header("/api/widgets", &results, "").is_none());
    }

    #[test]
    fn test_cursor_result_reads_like_a_slice() {
        let results = CursorResult::new(vec![3, 1, 2]);
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().max(), Some(&3));
        assert_eq!(results[0], 3);
    }
}
