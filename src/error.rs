//! Error types for building and reading constmap files.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConstMapError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("key of {length} bytes exceeds the 32-bit length field")]
    KeyTooLong { length: usize },

    #[error("value of {length} bytes exceeds the 32-bit length field")]
    ValueTooLong { length: usize },

    #[error("constmap files are limited to 4 GiB, build would need {size} bytes")]
    DatabaseFull { size: u64 },

    #[error("builder has already been finalized")]
    Finalized,

    #[error("corrupt constmap file: {0}")]
    Corrupt(String),
}

impl ConstMapError {
    /// Returns true for structural inconsistencies detected while reading.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }

    /// Returns true for errors caused by how the caller drove the builder.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::KeyTooLong { .. }
                | Self::ValueTooLong { .. }
                | Self::DatabaseFull { .. }
                | Self::Finalized
        )
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ConstMapError>;
