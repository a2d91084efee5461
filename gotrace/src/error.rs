//! Structured error types for gotrace
//!
//! Resolution failures are fatal and surface to the caller before any
//! instrumentation is generated. Record errors are recoverable: the
//! interpreter logs and counts them, then moves on.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Failed to open binary {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse object file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: object::Error,
    },

    #[error("No symbol table found in {0} (stripped binary?)")]
    MissingSymbolTable(PathBuf),

    #[error("No executable code section found in {0}")]
    MissingCodeSection(PathBuf),

    #[error("Unsupported architecture {0}, only x86_64 can be scanned")]
    UnsupportedArchitecture(String),

    #[error("No function symbols match package prefixes {prefixes:?}")]
    NoMatchingFunctions { prefixes: Vec<String> },

    #[error(
        "Symbol {name} [0x{address:x}, +0x{size:x}) is not contained in section {section} [0x{section_start:x}, 0x{section_end:x})"
    )]
    SymbolOutOfSection {
        name: String,
        address: u64,
        size: u64,
        section: usize,
        section_start: u64,
        section_end: u64,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record {record}: expected 5 or 6 fields, found {found}")]
    FieldCount { record: usize, found: usize },

    #[error("record {record}: field {field} is not an integer: {value:?}")]
    BadInteger { record: usize, field: &'static str, value: String },

    #[error("record {record}: {reason}")]
    InvalidField { record: usize, reason: String },

    #[error("record {record}: line is not valid UTF-8")]
    NotUtf8 { record: usize },

    #[error("record {record}: truncated frame of {len} bytes")]
    Truncated { record: usize, len: usize },
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Manifest lists {0} in index_to_name but has no site for it")]
    MissingSite(String),

    #[error("Manifest indices are not dense: expected {expected}, found {found}")]
    SparseIndex { expected: u32, found: u32 },
}
