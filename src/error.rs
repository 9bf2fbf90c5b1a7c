//! Error types for CoucheCache
//!
//! Three failure shapes reach callers:
//!
//! - a single error value, for single-key operations and for batches that
//!   produced nothing usable;
//! - [`PartialResultError`], for batches where some keys succeeded and some
//!   failed (inspect `data()` / `errors()` per key);
//! - nothing at all, when every key succeeded.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while routing cache operations.
///
/// `Clone` so one in-flight delegate result can be handed to every waiter
/// that was coalesced onto it.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A leaf back end reported a failure
    #[error("Backend error on {uri}: {message}")]
    Backend { uri: String, message: String },

    /// A leaf back end timed out
    #[error("Operation '{operation}' timed out on {uri}")]
    Timeout { uri: String, operation: String },

    /// The instance is not connected or has been destroyed
    #[error("Cache instance unavailable: {0}")]
    Unavailable(String),

    /// The hash ring has no point for this key
    #[error("No node available for key: {0}")]
    NoRoute(String),

    /// Caller supplied an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Topology configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Some keys of a batch succeeded, others failed
    #[error(transparent)]
    PartialResult(Box<PartialResultError>),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a back end failure.
    pub fn backend(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Backend {
            uri: uri.into(),
            message: message.into(),
        }
    }

    /// True if this is a partial batch failure.
    pub fn is_partial(&self) -> bool {
        matches!(self, Error::PartialResult(_))
    }

    /// Borrow the partial result, if any.
    pub fn as_partial(&self) -> Option<&PartialResultError> {
        match self {
            Error::PartialResult(partial) => Some(&**partial),
            _ => None,
        }
    }
}

impl From<PartialResultError> for Error {
    fn from(partial: PartialResultError) -> Self {
        Error::PartialResult(Box::new(partial))
    }
}

// =============================================================================
// Partial Results
// =============================================================================

/// Outcome of a batch that touched several destinations and saw failures.
///
/// Every key of the batch lands in exactly one of the two maps. For reads the
/// `data` value is what the back end returned (`None` for a miss); for writes
/// and deletes an acknowledged key maps to `None`.
///
/// Never nested: constructing one from errors that are themselves partial
/// results lifts their entries into this one.
#[derive(Debug, Clone, Default)]
pub struct PartialResultError {
    data: HashMap<String, Option<Bytes>>,
    errors: HashMap<String, Error>,
}

impl PartialResultError {
    /// Create a flattened partial result.
    pub fn new(data: HashMap<String, Option<Bytes>>, errors: HashMap<String, Error>) -> Self {
        let mut partial = Self {
            data,
            errors: HashMap::with_capacity(errors.len()),
        };
        for (key, error) in errors {
            partial.absorb(key, error);
        }
        partial
    }

    fn absorb(&mut self, key: String, error: Error) {
        match error {
            Error::PartialResult(nested) => {
                let PartialResultError { data, errors } = *nested;
                self.data.extend(data);
                for (nested_key, nested_error) in errors {
                    self.absorb(nested_key, nested_error);
                }
            }
            other => {
                self.errors.insert(key, other);
            }
        }
    }

    /// Keys that were processed successfully.
    pub fn data(&self) -> &HashMap<String, Option<Bytes>> {
        &self.data
    }

    /// Keys that failed, with their errors.
    pub fn errors(&self) -> &HashMap<String, Error> {
        &self.errors
    }

    /// Consume into `(data, errors)`.
    pub fn into_parts(self) -> (HashMap<String, Option<Bytes>>, HashMap<String, Error>) {
        (self.data, self.errors)
    }

    /// True if `keys` is exactly covered by the union of `data` and `errors`
    /// and the two maps are disjoint.
    pub fn is_complete_for<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> bool {
        let mut expected = 0;
        for key in keys {
            let in_data = self.data.contains_key(key);
            let in_errors = self.errors.contains_key(key);
            if in_data == in_errors {
                return false;
            }
            expected += 1;
        }
        let mut distinct: Vec<&String> = self.data.keys().chain(self.errors.keys()).collect();
        distinct.sort();
        distinct.dedup();
        distinct.len() == expected
    }
}

impl fmt::Display for PartialResultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Partial result: {} keys succeeded, {} keys failed",
            self.data.len(),
            self.errors.len()
        )
    }
}

impl std::error::Error for PartialResultError {}

/// Accumulates per-key outcomes of the sub-calls of one batch.
#[derive(Debug, Default)]
pub(crate) struct PartialResultBuilder {
    data: HashMap<String, Option<Bytes>>,
    errors: HashMap<String, Error>,
}

impl PartialResultBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn succeed(&mut self, key: &str, value: Option<Bytes>) {
        self.data.insert(key.to_string(), value);
    }

    /// Record `error` for every key of a failed sub-call. A nested partial
    /// result contributes its own per-key outcomes instead.
    pub(crate) fn fail<'a>(&mut self, keys: impl IntoIterator<Item = &'a str>, error: &Error) {
        match error.as_partial() {
            Some(nested) => {
                for key in keys {
                    if let Some(value) = nested.data.get(key) {
                        self.data.insert(key.to_string(), value.clone());
                    } else if let Some(inner) = nested.errors.get(key) {
                        self.errors.insert(key.to_string(), inner.clone());
                    } else {
                        let missing = format!("key {} missing from nested partial result", key);
                        self.errors.insert(key.to_string(), Error::Internal(missing));
                    }
                }
            }
            None => {
                for key in keys {
                    self.errors.insert(key.to_string(), error.clone());
                }
            }
        }
    }

    pub(crate) fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub(crate) fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    pub(crate) fn build(self) -> PartialResultError {
        PartialResultError::new(self.data, self.errors)
    }
}

// =============================================================================
// Tests
// =============================================================================
