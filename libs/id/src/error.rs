//! Parse failures for typed IDs.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("empty {id_type}")]
    Empty { id_type: &'static str },

    /// A well-formed ID of some other type, e.g. a pass ID given where a
    /// resource UID was expected.
    #[error("{id_type} must start with '{expected}_', got '{found}_'")]
    WrongType {
        id_type: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("{id_type} '{input}' is not of the form <prefix>_<ulid>")]
    Malformed { id_type: &'static str, input: String },

    #[error("{id_type} has an invalid ULID: {reason}")]
    InvalidUlid { id_type: &'static str, reason: String },
}

impl IdError {
    /// Name of the ID type that failed to parse.
    pub fn id_type(&self) -> &'static str {
        match self {
            Self::Empty { id_type }
            | Self::WrongType { id_type, .. }
            | Self::Malformed { id_type, .. }
            | Self::InvalidUlid { id_type, .. } => id_type,
        }
    }
}
