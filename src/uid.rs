//! Uid - Global, self-describing identity for every entity
//!
//! Format: `<Type>_<id>[.<Type>_<id>]*`, the entity first and its root
//! ancestor last.
//!
//! Examples:
//! - `Theme_mW4iQ4cO`
//! - `Comment_p46aOHS6.User_80h41Q4c`
//!
//! A uid alone is enough to find an entity: the type chain and every
//! ancestor are encoded in it, so no index lookup is ever needed to turn
//! it into a storage key.

use crate::{Error, Result};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Random local id length for document-store entities.
pub const DOCUMENT_ID_LENGTH: usize = 8;

/// Random local id length for relational rows. Rows are never namespaced by
/// a parent, and tables grow larger than entity groups.
pub const RELATIONAL_ID_LENGTH: usize = 16;

/// How many times `create` draws a fresh id before giving up.
pub const MAX_GENERATION_ATTEMPTS: usize = 5;

fn type_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Z][a-z]+)+$").expect("type name pattern is valid"))
}

fn local_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9\-]+$").expect("local id pattern is valid"))
}

fn long_part_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Z][a-z]+)+_[A-Za-z0-9\-]+$").expect("long uid pattern is valid")
    })
}

/// Is this a valid StandingCamelCase type name?
pub fn is_type_name(s: &str) -> bool {
    type_name_regex().is_match(s)
}

/// Is this a valid local id (letters, numbers, hyphens)?
pub fn is_local_id(s: &str) -> bool {
    local_id_regex().is_match(s)
}

/// Every dot-separated segment is `Type_id`.
pub fn is_long_form(s: &str) -> bool {
    s.split('.').all(|p| long_part_regex().is_match(p))
}

/// Every dot-separated segment is a bare local id.
pub fn is_short_form(s: &str) -> bool {
    s.split('.').all(is_local_id)
}

/// Draw `length` alphanumeric characters from the operating system's
/// random source.
pub fn random_local_id(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Type name of a uid string, taken from its first segment.
///
/// Returns `None` when the string is not a long-form uid.
pub fn type_of(uid: &str) -> Option<&str> {
    if !is_long_form(uid) {
        return None;
    }
    uid.split('_').next()
}

/// Anything that knows which entity type it belongs to: uids, storage keys,
/// records.
pub trait Kinded {
    fn type_name(&self) -> &str;
}

/// Convert a short or long uid to its long form.
///
/// Long input is returned unchanged. Short input needs the ordered type
/// chain, entity type first, with one type per dot-separated segment.
/// Mirrors a lookup of a missing record: anything that can't be converted
/// yields `None`, never an error.
pub fn to_long_form(short_or_long: &str, type_chain: Option<&[&str]>) -> Option<Uid> {
    if short_or_long.is_empty() {
        return None;
    }
    if is_long_form(short_or_long) {
        return Some(Uid(short_or_long.to_string()));
    }
    if !is_short_form(short_or_long) {
        return None;
    }

    let Some(types) = type_chain else {
        tracing::warn!(
            "Can't convert short uid {:?} without knowing its type chain",
            short_or_long
        );
        return None;
    };

    let ids: Vec<&str> = short_or_long.split('.').collect();
    if ids.len() != types.len() {
        tracing::warn!(
            "Can't convert short uids that have ancestors without knowing the ancestor types ({} ids, {} types)",
            ids.len(),
            types.len()
        );
        return None;
    }
    if !types.iter().all(|t| is_type_name(t)) {
        return None;
    }

    let long = types
        .iter()
        .zip(ids)
        .map(|(t, id)| format!("{}_{}", t, id))
        .collect::<Vec<_>>()
        .join(".");
    Some(Uid(long))
}

/// Strip every `Type_` prefix, keeping the dot-separated local ids.
pub fn to_short_form(short_or_long: &str) -> Option<String> {
    if is_long_form(short_or_long) {
        Uid::parse(short_or_long).map(|uid| uid.short())
    } else if is_short_form(short_or_long) {
        Some(short_or_long.to_string())
    } else {
        None
    }
}

/// Long uids become short, short uids become long (given the type chain).
pub fn convert(short_or_long: &str, type_chain: Option<&[&str]>) -> Option<String> {
    if is_long_form(short_or_long) {
        to_short_form(short_or_long)
    } else {
        to_long_form(short_or_long, type_chain).map(|uid| uid.0)
    }
}

/// A validated long-form uid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(String);

impl Uid {
    /// Make a globally unique uid, e.g. `Program_mW4iQ4cO`.
    ///
    /// With 8 random characters, 10,000 entities of one type collide with
    /// probability around 2E-7; creation retries on top of that.
    ///
    /// A given `identifier` replaces the random characters:
    /// `Theme_growth-mindset-is-cool`. A `parent` is appended after a dot:
    /// `Comment_p46aOHS6.User_80h41Q4c`.
    pub fn generate(
        type_name: &str,
        parent: Option<&Uid>,
        identifier: Option<&str>,
        id_length: usize,
    ) -> Result<Self> {
        if !is_type_name(type_name) {
            return Err(Error::InvalidUid(format!(
                "Invalid type name: {}. StandingCamelCase letters only.",
                type_name
            )));
        }

        let local_id = match identifier {
            Some(id) if is_local_id(id) => id.to_string(),
            Some(id) => {
                return Err(Error::InvalidUid(format!(
                    "Invalid identifier: {}. Letters, numbers, and hyphens only.",
                    id
                )));
            }
            None => random_local_id(id_length),
        };

        let mut uid = format!("{}_{}", type_name, local_id);
        if let Some(parent) = parent {
            uid.push('.');
            uid.push_str(parent.as_str());
        }
        Ok(Self(uid))
    }

    /// Parse a long-form uid. Anything else is `None`.
    pub fn parse(s: &str) -> Option<Self> {
        (!s.is_empty() && is_long_form(s)).then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `(type, local id)` pairs, entity first.
    pub fn parts(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .split('.')
            .filter_map(|part| part.split_once('_'))
    }

    /// Local id of the entity itself, without ancestry.
    pub fn local_id(&self) -> &str {
        self.parts().next().map(|(_, id)| id).unwrap_or_default()
    }

    /// Types from the entity to its root, e.g. `["Comment", "User"]`.
    pub fn type_chain(&self) -> Vec<&str> {
        self.parts().map(|(t, _)| t).collect()
    }

    /// The short form: local ids only, e.g. `p46aOHS6.80h41Q4c`.
    pub fn short(&self) -> String {
        self.parts().map(|(_, id)| id).collect::<Vec<_>>().join(".")
    }

    /// Parent uid by convention, without touching any store.
    pub fn parent(&self) -> Option<Uid> {
        self.0
            .split_once('.')
            .map(|(_, parent)| Uid(parent.to_string()))
    }

    /// Is `ancestor` this uid or one of its ancestors?
    pub fn is_within(&self, ancestor: &Uid) -> bool {
        self == ancestor || self.0.ends_with(&format!(".{}", ancestor.0))
    }

    /// Canonical storage key, root first. Each element is the type and the
    /// uid of that ancestor, so
    /// `Comment_p4.User_80` becomes
    /// `[("User", "User_80"), ("Comment", "Comment_p4.User_80")]`.
    pub fn key_path(&self) -> Vec<(String, String)> {
        let segments: Vec<&str> = self.0.split('.').collect();
        (0..segments.len())
            .rev()
            .map(|i| {
                let type_name = segments[i].split('_').next().unwrap_or_default();
                (type_name.to_string(), segments[i..].join("."))
            })
            .collect()
    }
}

impl Kinded for Uid {
    fn type_name(&self) -> &str {
        self.parts().next().map(|(t, _)| t).unwrap_or_default()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Uid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| Error::InvalidUid(s.to_string()))
    }
}

impl AsRef<str> for Uid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for Uid {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Uid::from_str(&s).map_err(serde::de::Error::custom)
    }
}
