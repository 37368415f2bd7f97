// Test fixtures: minimal ELF images written to temp files. The integration
// test binaries include! this file as their `common` module, so it carries
// no inner attributes and some helpers go unused in some binaries.

use std::io::Write;

use object::write::Object;
use object::{Architecture, BinaryFormat, Endianness, SectionKind};
use tempfile::NamedTempFile;

/// Serialize a GNU build-id note: header (namesz = 4, descsz, type 3 =
/// NT_GNU_BUILD_ID), the name "GNU\0", then the descriptor bytes.
fn build_id_note(id: &[u8]) -> Vec<u8> {
    let mut note = Vec::with_capacity(16 + id.len());
    note.extend_from_slice(&4u32.to_le_bytes());
    note.extend_from_slice(&u32::try_from(id.len()).unwrap().to_le_bytes());
    note.extend_from_slice(&3u32.to_le_bytes());
    note.extend_from_slice(b"GNU\0");
    note.extend_from_slice(id);
    note
}

/// Write a minimal ELF image with a populated `.text` section and, if given,
/// a GNU build-id note.
pub(crate) fn write_elf(build_id: Option<&[u8]>) -> NamedTempFile {
    let mut image = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);

    let text = image.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    image.append_section_data(text, &[0xc3; 16], 16);

    if let Some(id) = build_id {
        let note = image.add_section(Vec::new(), b".note.gnu.build-id".to_vec(), SectionKind::Note);
        image.append_section_data(note, &build_id_note(id), 4);
    }

    let bytes = image.write().expect("failed to serialize fixture ELF");

    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(&bytes).expect("failed to write fixture ELF");
    file.flush().expect("failed to flush fixture ELF");
    file
}

/// Write arbitrary (non-ELF) bytes to a temp file.
#[allow(dead_code)]
pub(crate) fn write_raw(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(bytes).expect("failed to write file");
    file.flush().expect("failed to flush file");
    file
}

/// Number of descriptors currently open in this process.
#[allow(dead_code)]
pub(crate) fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").expect("failed to read /proc/self/fd").count()
}
