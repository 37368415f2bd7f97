//! # objfile - Object-File Pool for Continuous Profiling
//!
//! A continuous profiling agent discovers executables and shared libraries
//! at runtime and hands them to several consumers at once: symbolization,
//! upload, debug-info extraction. This crate is the part that owns the
//! underlying OS file descriptors: a concurrent cache keyed by GNU build-id
//! that shares entries through manually reference-counted handles and closes
//! each descriptor exactly once, when the last user releases it.
//!
//! ## Architecture Overview
//!
//! ```text
//!  consumers (symbolization, upload, debug info)
//!        │ try_clone / release
//!        ▼
//!  Reference<ObjectFile> ───last release───► close descriptor,
//!        ▲                                   release debug file
//!        │ open / new_file / get (dedup by build-id)
//!        ▼
//!      Pool ────access expiry────► release the pool's reference
//! ```
//!
//! ## Module Structure
//!
//! - [`rc`]: the reference-counting primitive. Handles share a resource
//!   block; the destructor runs once, synchronously, when the count reaches
//!   zero, and dropping an unreleased handle is a logged fail-safe release.
//!
//! - [`object_file`]: the cached entry. Owns the descriptor and the parsed
//!   view, serializes cursor-based readers while positional reads go
//!   straight to the descriptor, and transparently reopens a descriptor
//!   that was closed early, restoring the closed state afterward.
//!
//! - [`pool`]: the build-id-keyed cache. Validates ELF input, dedups
//!   concurrent opens of the same binary, sweeps entries idle past the
//!   access expiry, and releases its own reference on eviction so external
//!   holders keep working.
//!
//! - [`elf`] / [`buildid`]: the owned ELF snapshot (sections, notes) and
//!   the build-id extraction that produces the cache key.
//!
//! - [`domain`]: `BuildId` and the structured error types.
//!
//! ## Key Guarantees
//!
//! - A destructor fires exactly once per entry, after the final release.
//! - Releasing is single-shot per handle; double release is an error, not a
//!   double close.
//! - Eviction never severs ongoing work: it only drops the pool's own
//!   reference.
//! - One reader at a time per entry; the cursor is rewound between readers.
//!   Positional reads through the parsed view may run in parallel.

pub mod buildid;
pub mod domain;
pub mod elf;
pub mod object_file;
pub mod pool;
pub mod rc;

#[cfg(test)]
pub(crate) mod fixtures;

pub use buildid::BuildIdError;
pub use domain::{BuildId, ObjectFileError, PoolError};
pub use elf::{ElfError, ElfMetadata, ElfSection};
pub use object_file::{Info, ObjectFile, Reader};
pub use pool::{Pool, PoolStats};
pub use rc::{RcError, Reference};
