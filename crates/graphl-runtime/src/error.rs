//! Runtime error types.

use graphl_types::TypeError;
use thiserror::Error;

/// Error type returned by host function implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while loading a program or marshaling a call.
///
/// Load-time variants (`MetadataNotFound`, `MetadataMalformed`,
/// `ImportsUnresolved`, `UnknownType`, `MissingExport`) prevent a
/// [`Program`](crate::Program) from being created at all.  Everything else is
/// fatal to a single call only; the program stays usable afterwards.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The binary carries no embedded metadata document.
    #[error("metadata document not found in binary")]
    MetadataNotFound,

    /// The metadata document is truncated or does not match the schema.
    #[error("malformed metadata document: {0}")]
    MetadataMalformed(String),

    /// Required host functions missing from the supplied environment.
    #[error("unresolved host functions: {}", names.join(", "))]
    ImportsUnresolved { names: Vec<String> },

    /// A host value does not fit the declared type.
    #[error("value for `{field}` does not match type {expected}: found {found}")]
    ValueTypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    /// A registered implementation's signature disagrees with the dispatch
    /// key it was reached through.
    #[error("host function `{name}` declared as {declared} but called through {key}")]
    HostFunctionContractViolation {
        name: String,
        declared: String,
        key: String,
    },

    #[error("unknown type: {0}")]
    UnknownType(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// The guest dispatched to an id no implementation was registered for.
    #[error("no host function registered with id {0}")]
    UnknownHostFunctionId(u32),

    #[error("`{name}` expects {expected} arguments, got {found}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    /// The binary does not export a required entry point.
    #[error("missing export: {0}")]
    MissingExport(String),

    #[error("transfer buffer access out of bounds: offset {offset}, length {len}")]
    TransferBufferOutOfBounds { offset: usize, len: usize },

    /// The guest answered a protocol call with an impossible value.
    #[error("guest protocol violation: {0}")]
    GuestProtocol(String),

    #[error("guest string is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("options blob is {size} bytes, larger than the transfer buffer")]
    OptionsTooLarge { size: usize },

    #[error("guest rejected the options blob")]
    OptionsRejected,

    /// A host function implementation returned an error.
    #[error("host function `{name}` failed: {source}")]
    HostFunctionFailed {
        name: String,
        #[source]
        source: BoxError,
    },

    /// The sandbox engine failed: compile, link, instantiate or trap.
    #[error("wasm engine error: {0}")]
    Wasm(String),
}

impl From<TypeError> for RuntimeError {
    fn from(err: TypeError) -> Self {
        match err {
            TypeError::UnknownType(name) => RuntimeError::UnknownType(name),
            other => RuntimeError::MetadataMalformed(other.to_string()),
        }
    }
}

impl From<wasmi::Error> for RuntimeError {
    fn from(err: wasmi::Error) -> Self {
        RuntimeError::Wasm(err.to_string())
    }
}

/// Runtime result type alias.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
