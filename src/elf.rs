//! Parsed ELF view of an object file.
//!
//! Parsing works through positional reads only (`ReadCache` over the open
//! descriptor), and the result is an owned snapshot. That lets the pool
//! close and reopen the descriptor underneath consumers without invalidating
//! views they already hold: section *contents* are read back positionally
//! ([`crate::object_file::ObjectFile::section_data`] and `read_at`, keyed by
//! [`ElfSection::file_range`]), everything else lives here.

use std::fs::File;

use object::read::ReadCache;
use object::{Endianness, Object, ObjectKind, ObjectSection};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ElfError {
    /// The image parsed as something other than ELF (e.g. the file at a
    /// cached path was replaced before a reopen).
    #[error("not an ELF image")]
    NotElf,

    #[error("malformed object file: {0}")]
    Parse(#[from] object::read::Error),
}

/// One section of the parsed image.
#[derive(Debug, Clone)]
pub struct ElfSection {
    pub name: String,
    pub address: u64,
    pub size: u64,
    /// Byte range of the section contents within the file, when the section
    /// occupies file space (`None` for `.bss`-like sections).
    pub file_range: Option<(u64, u64)>,
}

/// Owned snapshot of the ELF structure of an object file.
#[derive(Debug, Clone)]
pub struct ElfMetadata {
    kind: ObjectKind,
    endianness: Endianness,
    is_64: bool,
    sections: Vec<ElfSection>,
    build_id: Option<Vec<u8>>,
}

impl ElfMetadata {
    /// Parse the image the descriptor points at.
    ///
    /// Reads are positional, but the shared cursor is moved by the
    /// underlying cache; callers that care about the cursor must rewind
    /// afterwards.
    pub fn parse(file: &File) -> Result<Self, ElfError> {
        let cache = ReadCache::new(file);
        let image = object::File::parse(&cache)?;
        if image.format() != object::BinaryFormat::Elf {
            return Err(ElfError::NotElf);
        }

        let sections = image
            .sections()
            .map(|section| ElfSection {
                name: section.name().unwrap_or_default().to_string(),
                address: section.address(),
                size: section.size(),
                file_range: section.file_range(),
            })
            .collect();

        Ok(Self {
            kind: image.kind(),
            endianness: image.endianness(),
            is_64: image.is_64(),
            build_id: image.build_id()?.map(<[u8]>::to_vec),
            sections,
        })
    }

    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[must_use]
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    #[must_use]
    pub fn is_64(&self) -> bool {
        self.is_64
    }

    #[must_use]
    pub fn sections(&self) -> &[ElfSection] {
        &self.sections
    }

    #[must_use]
    pub fn section_by_name(&self, name: &str) -> Option<&ElfSection> {
        self.sections.iter().find(|section| section.name == name)
    }

    #[must_use]
    pub fn has_section(&self, name: &str) -> bool {
        self.section_by_name(name).is_some()
    }

    /// Raw descriptor bytes of the `.note.gnu.build-id` note, if present.
    #[must_use]
    pub fn build_id(&self) -> Option<&[u8]> {
        self.build_id.as_deref()
    }
}
