use std::fmt::{self, Display};

/// Errors produced when parsing identifiers carried in messages and records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    InvalidScanId(String),
    InvalidRankedId(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidScanId(raw) => {
                write!(f, "invalid scan id: {raw}")
            }
            ModelError::InvalidRankedId(raw) => {
                write!(f, "invalid page or leaf id: {raw}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
