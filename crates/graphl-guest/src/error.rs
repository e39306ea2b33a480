//! Guest assembly error types.

use graphl_types::TypeError;
use thiserror::Error;

/// Errors that can occur while assembling a guest module.
#[derive(Debug, Error)]
pub enum GuestError {
    /// A type name could not be resolved or a struct declaration is invalid.
    #[error(transparent)]
    Type(#[from] TypeError),

    /// A function body referenced a function that does not exist.
    #[error("unresolved symbol: {0}")]
    UnresolvedSymbol(String),

    /// Two exports share a name, or an export shadows a contract entry point.
    #[error("duplicate export: {0}")]
    DuplicateExport(String),

    /// The same host function id was assigned twice.
    #[error("host function id {0} assigned more than once")]
    DuplicateHostId(u32),

    /// A struct does not fit in the transfer window.
    #[error("struct `{name}` is {size} bytes, larger than the transfer window")]
    StructTooLarge { name: String, size: u32 },

    /// The metadata document could not be serialized.
    #[error("metadata serialization failed: {0}")]
    Metadata(#[from] serde_json::Error),

    /// The assembled module failed validation.
    #[error("WASM validation failed: {0}")]
    ValidationFailed(String),
}

/// Guest assembly result type alias.
pub type GuestResult<T> = Result<T, GuestError>;
