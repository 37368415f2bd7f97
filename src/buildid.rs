//! GNU build-id extraction.
//!
//! The build-id is the content-derived identifier embedded in the
//! `.note.gnu.build-id` section of an ELF image. The pool uses its lowercase
//! hex encoding as the cache key.

use thiserror::Error;

use crate::domain::BuildId;
use crate::elf::ElfMetadata;

#[derive(Error, Debug)]
pub enum BuildIdError {
    /// The image carries no GNU build-id note. Non-fatal: the pool caches
    /// such entries under the empty key.
    #[error("object file has no GNU build-id note")]
    Missing,
}

/// Extract the lowercase hex build-id from a parsed image.
///
/// # Errors
/// [`BuildIdError::Missing`] when the note is absent or empty.
pub fn build_id(elf: &ElfMetadata) -> Result<BuildId, BuildIdError> {
    match elf.build_id() {
        Some(note) if !note.is_empty() => Ok(BuildId::from_note(note)),
        _ => Err(BuildIdError::Missing),
    }
}
