//! Error types for the vdisk core library.

use std::path::PathBuf;

/// The main error type for virtual disk operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The container magic did not match any supported family, or an extent
    /// declared a type this library does not handle.
    #[error("unsupported format: {message}")]
    UnsupportedFormat { message: String },

    /// A header, region table, or metadata table carried a bad signature or
    /// an impossible value.
    #[error("corrupt metadata: {message}")]
    CorruptMetadata { message: String },

    /// A BAT or grain lookup landed past the declared entry count.
    #[error("out of bounds lookup: {message}")]
    OutOfBounds { message: String },

    /// A required region GUID was absent from the region table.
    #[error("missing required region: {name}")]
    MissingRegion { name: &'static str },

    /// The image declares a parent but the resolver could not produce one.
    #[error("missing parent: {message}")]
    MissingParent { message: String },

    /// The parent locator type GUID is not one this library understands.
    #[error("unknown parent locator type: {guid}")]
    UnknownParentLocator { guid: String },

    /// A malformed line in a VMDK descriptor file.
    #[error("invalid descriptor line: {line}")]
    InvalidDescriptor { line: String },
}

/// A specialized Result type for vdisk operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create an unsupported-format error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            message: message.into(),
        }
    }

    /// Create a corrupt-metadata error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptMetadata {
            message: message.into(),
        }
    }

    /// Create an out-of-bounds-lookup error.
    pub fn out_of_bounds(message: impl Into<String>) -> Self {
        Self::OutOfBounds {
            message: message.into(),
        }
    }

    /// Create a missing-parent error.
    pub fn missing_parent(message: impl Into<String>) -> Self {
        Self::MissingParent {
            message: message.into(),
        }
    }

    /// Create an invalid-descriptor-line error.
    pub fn invalid_descriptor(line: impl Into<String>) -> Self {
        Self::InvalidDescriptor { line: line.into() }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
