//! Error types for the entity cache.

use std::fmt;

/// Result type for cache and resource operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the entity cache.
///
/// The enum is `Clone` because a single in-flight request is shared by every
/// caller waiting on the same cache key; each waiter receives its own copy of
/// the failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The backend call rejected.
    ///
    /// Propagated to every waiter of the shared in-flight request. The cache
    /// entry reverts to the state it had before the request was issued and no
    /// partial merge is applied.
    ///
    /// **Recovery:** Retry the operation; the cache performs no retries itself.
    TransportFailure(String),

    /// An update or delete was given a payload without an identity value.
    ///
    /// Raised before any request is issued, so no URL with an empty identity
    /// segment is ever sent.
    IdentityMissing {
        /// Namespace of the resource the operation targeted
        namespace: String,
        /// Name of the identity field that was absent
        field: String,
    },

    /// Resource declaration failed.
    ///
    /// Common causes:
    /// - Empty namespace
    /// - No backend on the resource and no default backend on the registry
    ///
    /// **Recovery:** Fix the declaration; this never happens at first use.
    ConfigError(String),

    /// An outgoing payload could not be turned into a JSON object.
    ///
    /// Common causes:
    /// - Typed payload serializes to a non-object (number, string, array)
    /// - Serde serialization error
    SerializationError(String),

    /// A backend response did not have the expected shape.
    ///
    /// Common causes:
    /// - Collection fetch returned something other than an array
    /// - Array member or single-entity response is not an object
    /// - `Entity::decode` into a typed shape failed
    DeserializationError(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// Whether this error came from the backend call itself.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::TransportFailure(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TransportFailure(msg) => write!(f, "Transport failure: {}", msg),
            Error::IdentityMissing { namespace, field } => {
                write!(
                    f,
                    "Identity missing: payload for {} has no '{}' field",
                    namespace, field
                )
            }
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::TransportFailure(e.to_string())
        } else if e.is_data() || e.is_syntax() || e.is_eof() {
            Error::DeserializationError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}
