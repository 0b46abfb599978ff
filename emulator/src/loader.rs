//! Guest image loading.
//!
//! Programs arrive either as raw flat binaries (placed at a caller-chosen
//! address) or as ELF executables, from which every allocatable progbits
//! section is extracted at its link address. The loader only produces
//! (address, bytes) pairs; delivery to the target is the caller's business.

use elf::abi::{SHF_ALLOC, SHT_NOBITS};
use elf::endian::AnyEndian;
use elf::ElfBytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to parse ELF: {0}")]
    Parse(#[from] elf::ParseError),
    #[error("ELF has no section headers")]
    NoSections,
    #[error("section {0} is compressed, which is not supported")]
    CompressedSection(String),
}

/// A chunk of the guest image and where it lives.
#[derive(Debug)]
pub struct Segment {
    pub name: String,
    pub address: u32,
    pub bytes: Vec<u8>,
}

/// True when `file` starts with the ELF magic.
pub fn is_elf(file: &[u8]) -> bool {
    file.starts_with(&[0x7f, b'E', b'L', b'F'])
}

/// Extract the allocatable sections of an ELF executable.
pub fn load_elf(file: &[u8]) -> Result<Vec<Segment>, LoadError> {
    let elf = ElfBytes::<AnyEndian>::minimal_parse(file)?;
    let (headers, strtab) = elf.section_headers_with_strtab()?;
    let headers = headers.ok_or(LoadError::NoSections)?;
    let mut segments = Vec::new();
    for header in headers.iter() {
        // Loadable sections with file contents; .bss stays zero
        if header.sh_flags & u64::from(SHF_ALLOC) == 0
            || header.sh_type == SHT_NOBITS
            || header.sh_size == 0
        {
            continue;
        }
        let name = match &strtab {
            Some(table) => table
                .get(header.sh_name as usize)
                .unwrap_or("<unnamed>")
                .to_string(),
            None => String::from("<unnamed>"),
        };
        let (data, compression) = elf.section_data(&header)?;
        if compression.is_some() {
            return Err(LoadError::CompressedSection(name));
        }
        log::debug!(
            "loader: section {} at {:#010x}, {} bytes",
            name,
            header.sh_addr,
            data.len()
        );
        segments.push(Segment {
            name,
            address: header.sh_addr as u32,
            bytes: data.to_vec(),
        });
    }
    Ok(segments)
}
