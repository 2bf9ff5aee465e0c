//! Identity types shared by the NGS workspace.
//!
//! Every stored record is addressed by a [`DocId`] and versioned by an opaque [`Revision`]
//! handed out by the document store. Both are validated once at construction so the rest of
//! the workspace can pass them around without re-checking.
//!
//! ## Identifier form
//! - Application-allocated ids are 32 lowercase hexadecimal characters (a v4 UUID in simple
//!   form), for example `550e8400e29b41d4a716446655440000`.
//! - Well-known singleton ids (`app_state`, `pipeline_state`, ...) and design document ids
//!   (`_design/<name>`) are also accepted.
//! - Any other id starting with `_` is reserved by the store and rejected.

use std::fmt;
use std::str::FromStr;

/// Errors that can occur when creating validated identity types.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,
    /// The id uses a prefix the document store reserves for itself
    #[error("id '{0}' uses a reserved '_' prefix")]
    ReservedPrefix(String),
    /// The revision token is not of the form `<generation>-<hash>`
    #[error("malformed revision token '{0}'")]
    MalformedRevision(String),
}

/// Prefix of design document ids.
pub const DESIGN_PREFIX: &str = "_design/";

/// External identifier of a stored document.
///
/// Immutable once constructed. Equality and hashing are by the string value, which is what the
/// store uses to address the record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocId(String);

impl DocId {
    /// Validates a caller supplied id.
    ///
    /// Leading and trailing whitespace is not trimmed: ids are opaque and must round-trip
    /// exactly through the store.
    ///
    /// # Errors
    ///
    /// Returns [`TextError::Empty`] for an empty id and [`TextError::ReservedPrefix`] for an id
    /// starting with `_` that is not a design document id.
    pub fn new(input: impl Into<String>) -> Result<Self, TextError> {
        let input = input.into();
        if input.trim().is_empty() {
            return Err(TextError::Empty);
        }
        if input.starts_with('_') && !input.starts_with(DESIGN_PREFIX) {
            return Err(TextError::ReservedPrefix(input));
        }
        Ok(Self(input))
    }

    /// Allocates a fresh id in the canonical 32-hex-character form.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Id of the design document named `name`.
    pub fn design(name: &str) -> Self {
        Self(format!("{DESIGN_PREFIX}{name}"))
    }

    /// Returns true for `_design/...` ids.
    pub fn is_design(&self) -> bool {
        self.0.starts_with(DESIGN_PREFIX)
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DocId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for DocId {
    type Err = TextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl serde::Serialize for DocId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for DocId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DocId::new(s).map_err(serde::de::Error::custom)
    }
}

/// Opaque revision token assigned by the document store on every successful write.
///
/// Tokens have the form `<generation>-<hash>`. Application code never fabricates one; they are
/// only read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(String);

impl Revision {
    /// Validates a revision token read from the store.
    ///
    /// # Errors
    ///
    /// Returns [`TextError::MalformedRevision`] if the token has no numeric generation prefix.
    pub fn parse(input: impl Into<String>) -> Result<Self, TextError> {
        let input = input.into();
        if input.is_empty() {
            return Err(TextError::Empty);
        }
        match input.split_once('-') {
            Some((generation, hash))
                if !hash.is_empty() && generation.parse::<u64>().is_ok() =>
            {
                Ok(Self(input))
            }
            _ => Err(TextError::MalformedRevision(input)),
        }
    }

    /// Write generation encoded in the token (1 for the first write).
    pub fn generation(&self) -> u64 {
        self.0
            .split_once('-')
            .and_then(|(g, _)| g.parse().ok())
            .unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for Revision {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Revision {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Revision::parse(s).map_err(serde::de::Error::custom)
    }
}
