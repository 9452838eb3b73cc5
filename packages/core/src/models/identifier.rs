//! Identifiers and Reference Keys
//!
//! Every cached record is addressed by an opaque, stable identifier minted by the
//! remote collaborator. Identifiers are canonicalised exactly once, when they are
//! constructed, so every other layer can compare them byte-for-byte.
//!
//! # Canonical Form
//!
//! - UUID-shaped tokens are rendered as uppercase hyphenated UUID text
//!   (`3f2504e0-4f89-11d3-9a0c-0305e82c3301` → `3F2504E0-4F89-11D3-9A0C-0305E82C3301`)
//! - Any other token is trimmed and uppercased
//! - Empty tokens are rejected
//!
//! # Examples
//!
//! ```rust
//! use mirrorstore_core::models::{Identifier, ReferenceKey};
//!
//! let id = Identifier::parse(" 3f2504e0-4f89-11d3-9a0c-0305e82c3301 ").unwrap();
//! assert_eq!(id.as_str(), "3F2504E0-4F89-11D3-9A0C-0305E82C3301");
//!
//! let key = ReferenceKey::new("Document", id);
//! assert_eq!(key.to_string(), "Document://3F2504E0-4F89-11D3-9A0C-0305E82C3301");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Canonical identifier of a remote record
///
/// Construct through [`Identifier::parse`] or `From<Uuid>`; both produce the
/// canonical form, so two `Identifier`s are equal exactly when they name the
/// same remote record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Canonicalise a raw identifier token
    ///
    /// Returns `None` for empty or whitespace-only input.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        match Uuid::parse_str(trimmed) {
            Ok(uuid) => Some(Self::from(uuid)),
            Err(_) => Some(Self(trimmed.to_uppercase())),
        }
    }

    /// Mint a fresh random identifier
    pub fn new_v4() -> Self {
        Self::from(Uuid::new_v4())
    }

    /// Canonical text form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identifier as a UUID, when it is UUID-shaped
    pub fn as_uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.0).ok()
    }
}

impl From<Uuid> for Identifier {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.hyphenated().to_string().to_uppercase())
    }
}

impl FromStr for Identifier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| "identifier cannot be empty".to_string())
    }
}

impl TryFrom<String> for Identifier {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.0
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache index key: `(entity name, identifier)`
///
/// A record cached under a concrete entity is indexed under one key per entity
/// in its inheritance chain; all of those keys resolve to the same node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceKey {
    pub entity: String,
    pub identifier: Identifier,
}

impl ReferenceKey {
    pub fn new(entity: impl Into<String>, identifier: Identifier) -> Self {
        Self {
            entity: entity.into(),
            identifier,
        }
    }
}

impl fmt::Display for ReferenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.entity, self.identifier)
    }
}
