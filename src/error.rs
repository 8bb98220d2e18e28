use crate::protocol::CodecKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Component type name must not be empty")]
    MissingTypeName,

    #[error("Invalid field number {number} for '{component}.{field}': must be in 1..={max}")]
    InvalidFieldNumber {
        component: String,
        field: String,
        number: u32,
        max: u32,
    },

    #[error("Field number {number} on component '{component}' is already used by '{existing}', cannot register '{field}'")]
    FieldNumberCollision {
        component: String,
        number: u32,
        existing: String,
        field: String,
    },

    #[error("Field '{field}' on component '{component}' is already registered with number {existing}, cannot re-register as {number}")]
    DuplicateFieldName {
        component: String,
        field: String,
        existing: u32,
        number: u32,
    },

    #[error("Registry is sealed, cannot register '{0}'")]
    RegistrySealed(String),

    #[error("No schema registered for component type '{0}'")]
    UnregisteredSchema(String),

    #[error("Wrong envelope type: expected {expected}, got {actual}")]
    WrongEnvelopeType { expected: CodecKind, actual: CodecKind },

    #[error("IDL error at line {line}: {message}")]
    Idl { line: usize, message: String },

    #[error("Encode error in '{component}': {message}")]
    Encode { component: String, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Validation failed for '{component}': {message}")]
    Validation { component: String, message: String },

    #[error("Missing field '{field}' on component '{component}'")]
    MissingField { component: String, field: String },

    #[error("Field '{field}' on component '{component}' has wrong type, expected {expected}")]
    FieldType {
        component: String,
        field: String,
        expected: &'static str,
    },

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl SyncError {
    /// Programmer errors that must surface at startup rather than be swallowed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SyncError::MissingTypeName
                | SyncError::InvalidFieldNumber { .. }
                | SyncError::FieldNumberCollision { .. }
                | SyncError::DuplicateFieldName { .. }
                | SyncError::RegistrySealed(_)
                | SyncError::UnregisteredSchema(_)
        )
    }

    pub(crate) fn poisoned<E: std::fmt::Display>(err: E) -> Self {
        SyncError::LockPoisoned(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
