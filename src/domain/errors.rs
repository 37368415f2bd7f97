//! Structured error types for the object-file pool
//!
//! Using thiserror for automatic Display implementation and error chaining.

use std::path::PathBuf;

use thiserror::Error;

use super::types::BuildId;
use crate::elf::ElfError;
use crate::rc::RcError;

#[derive(Error, Debug)]
pub enum ObjectFileError {
    /// The descriptor was never opened. Unreachable through the pool, which
    /// always constructs entries from an open descriptor; kept as a guard on
    /// the read paths.
    #[error("file is not initialized")]
    NotInitialized,

    /// Second teardown of the same entry. Carries the stack trace captured
    /// at the first close.
    #[error("file {path} is already closed by: {closed_by}")]
    AlreadyClosed { path: PathBuf, closed_by: String },

    #[error("failed to reopen {path}: {source}")]
    Reopen {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum PoolError {
    /// The input does not start with the ELF magic (zero-length files
    /// included).
    #[error("unrecognized binary format: {0}")]
    UnrecognizedFormat(PathBuf),

    /// The image parsed as ELF but carries no sections.
    #[error("ELF file {0} does not have any sections")]
    MalformedElf(PathBuf),

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ElfError,
    },

    #[error("no object file found for build id {0}")]
    NotFound(BuildId),

    /// The cached reference for this build id can no longer be cloned.
    #[error("cached reference for build id {build_id} is gone: {source}")]
    Released {
        build_id: BuildId,
        #[source]
        source: RcError,
    },

    #[error(transparent)]
    ObjectFile(#[from] ObjectFileError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrecognized_format_display() {
        let err = PoolError::UnrecognizedFormat(PathBuf::from("/dev/null"));
        assert_eq!(err.to_string(), "unrecognized binary format: /dev/null");
    }

    #[test]
    fn test_already_closed_carries_first_close_site() {
        let err = ObjectFileError::AlreadyClosed {
            path: PathBuf::from("/usr/bin/app"),
            closed_by: "pool::tests::close_entry".to_string(),
        };
        assert!(err.to_string().contains("/usr/bin/app"));
        assert!(err.to_string().contains("close_entry"));
    }
}
