//! Object ID newtypes.
//!
//! The adapter shells out to Git, so object IDs arrive as text. These
//! wrappers validate the text once at the boundary so that the rest of the
//! engine can pass SHAs around without re-checking them.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The all-zeroes OID, used by Git to represent a nonexistent object.
pub const ZERO_OID: &str = "0000000000000000000000000000000000000000";

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ParseOidError {
    #[error("object ID had length {len}, expected 40: {text:?}")]
    Length { text: String, len: usize },

    #[error("object ID contained non-hexadecimal characters: {text:?}")]
    NotHex { text: String },

    #[error("the zero object ID does not name a commit")]
    Zero,
}

/// A Git object ID which is not the zero OID, i.e. which names an object
/// that actually exists.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NonZeroOid {
    inner: String,
}

impl NonZeroOid {
    /// View the OID as its 40-character hexadecimal representation.
    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl Display for NonZeroOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl fmt::Debug for NonZeroOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl FromStr for NonZeroOid {
    type Err = ParseOidError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match MaybeZeroOid::from_str(text)? {
            MaybeZeroOid::Zero => Err(ParseOidError::Zero),
            MaybeZeroOid::NonZero(oid) => Ok(oid),
        }
    }
}

impl TryFrom<String> for NonZeroOid {
    type Error = ParseOidError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<NonZeroOid> for String {
    fn from(oid: NonZeroOid) -> Self {
        oid.inner
    }
}

/// An OID as it appears in Git output, which may be the zero OID (e.g. for
/// an unborn branch's `HEAD`, or the deleted side of a reference update).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MaybeZeroOid {
    /// The zero OID.
    Zero,

    /// A non-zero OID.
    NonZero(NonZeroOid),
}

impl MaybeZeroOid {
    /// Convert into an `Option`, mapping the zero OID to `None`.
    pub fn into_option(self) -> Option<NonZeroOid> {
        match self {
            MaybeZeroOid::Zero => None,
            MaybeZeroOid::NonZero(oid) => Some(oid),
        }
    }
}

impl Display for MaybeZeroOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeZeroOid::Zero => write!(f, "{ZERO_OID}"),
            MaybeZeroOid::NonZero(oid) => write!(f, "{oid}"),
        }
    }
}

impl FromStr for MaybeZeroOid {
    type Err = ParseOidError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.len() != 40 {
            return Err(ParseOidError::Length {
                text: text.to_string(),
                len: text.len(),
            });
        }
        if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseOidError::NotHex {
                text: text.to_string(),
            });
        }
        if text == ZERO_OID {
            Ok(MaybeZeroOid::Zero)
        } else {
            Ok(MaybeZeroOid::NonZero(NonZeroOid {
                inner: text.to_ascii_lowercase(),
            }))
        }
    }
}
