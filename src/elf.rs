//! ELF to flash image conversion
//!
//! Sections (rather than whole segments) are copied, so alignment padding and
//! uninitialised regions within a segment are left zeroed.

use std::path::Path;

use object::elf::{FileHeader32, FileHeader64, PT_LOAD, SHT_NOBITS};
use object::read::elf::{FileHeader, ProgramHeader, SectionHeader};
use object::{Endianness, FileKind};

use crate::{Error, Image};

/// Flash window used to select segments by physical address
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct FlashRegion {
    pub base: u64,
    pub size: u64,
}

impl FlashRegion {
    /// RP2040 XIP flash
    pub const DEFAULT: FlashRegion = FlashRegion {
        base: 0x1000_0000,
        size: 2 * 1024 * 1024,
    };

    /// Whether `size` bytes at `addr` lie entirely in this region
    pub fn contains(&self, addr: u64, size: u64) -> bool {
        match (addr.checked_add(size), self.base.checked_add(self.size)) {
            (Some(end), Some(limit)) => addr >= self.base && end <= limit,
            _ => false,
        }
    }
}

impl Default for FlashRegion {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Section data and where it is loaded
struct Chunk<'data> {
    paddr: u64,
    data: &'data [u8],
}

impl<'data> Chunk<'data> {
    fn end(&self) -> u64 {
        self.paddr + self.data.len() as u64
    }
}

/// Load an ELF file, keeping segments for which `in_flash(paddr, memsz)` holds
pub fn load_elf<P, F>(path: P, in_flash: F) -> Result<Image, Error>
where
    P: AsRef<Path>,
    F: Fn(u64, u64) -> bool,
{
    let data = std::fs::read(path.as_ref())?;
    debug!("Loaded ELF {} ({} bytes)", path.as_ref().display(), data.len());

    parse_elf(&data, in_flash)
}

/// Merge the flash-resident sections of an in-memory ELF file into one image
pub fn parse_elf<F>(data: &[u8], in_flash: F) -> Result<Image, Error>
where
    F: Fn(u64, u64) -> bool,
{
    let mut chunks = match FileKind::parse(data)? {
        FileKind::Elf32 => collect_chunks::<FileHeader32<Endianness>, _>(data, &in_flash)?,
        FileKind::Elf64 => collect_chunks::<FileHeader64<Endianness>, _>(data, &in_flash)?,
        _ => return Err(Error::NotElf),
    };

    chunks.sort_by_key(|c| c.paddr);

    // Sections may nest or share an address, so the last chunk need not end last
    let (min, max) = match (chunks.first(), chunks.iter().map(Chunk::end).max()) {
        (Some(first), Some(max)) => (first.paddr, max),
        _ => return Err(Error::EmptyImage),
    };
    if max > u32::MAX as u64 + 1 {
        return Err(Error::AddressOverflow(max));
    }

    let mut bytes = vec![0u8; (max - min) as usize];
    for c in &chunks {
        let offset = (c.paddr - min) as usize;
        bytes[offset..offset + c.data.len()].copy_from_slice(c.data);
    }

    info!(
        "ELF image: {} bytes from {} sections (0x{:08x} - 0x{:08x})",
        bytes.len(),
        chunks.len(),
        min,
        max
    );

    Ok(Image::new(min as u32, bytes))
}

fn collect_chunks<'data, Elf, F>(data: &'data [u8], in_flash: &F) -> Result<Vec<Chunk<'data>>, Error>
where
    Elf: FileHeader,
    F: Fn(u64, u64) -> bool,
{
    let header = Elf::parse(data)?;
    let endian = header.endian()?;
    let segments = header.program_headers(endian, data)?;
    let sections = header.sections(endian, data)?;

    let mut chunks = vec![];

    for segment in segments {
        let paddr: u64 = segment.p_paddr(endian).into();
        let vaddr: u64 = segment.p_vaddr(endian).into();
        let memsz: u64 = segment.p_memsz(endian).into();

        if segment.p_type(endian) != PT_LOAD || !in_flash(paddr, memsz) {
            continue;
        }

        let seg_end = match vaddr.checked_add(memsz) {
            Some(end) => end,
            None => {
                warn!("Skipping segment at 0x{:x} with invalid size 0x{:x}", vaddr, memsz);
                continue;
            }
        };

        for section in sections.iter() {
            let addr: u64 = section.sh_addr(endian).into();
            let size: u64 = section.sh_size(endian).into();

            if size == 0 || section.sh_type(endian) == SHT_NOBITS {
                continue;
            }
            match addr.checked_add(size) {
                Some(end) if addr >= vaddr && end <= seg_end => (),
                _ => continue,
            }

            let chunk = Chunk {
                paddr: paddr
                    .checked_add(addr - vaddr)
                    .ok_or(Error::AddressOverflow(paddr))?,
                data: section.data(endian, data)?,
            };
            if chunk.paddr.checked_add(chunk.data.len() as u64).is_none() {
                return Err(Error::AddressOverflow(chunk.paddr));
            }
            trace!(
                "Section at 0x{:08x} -> 0x{:08x} ({} bytes)",
                addr,
                chunk.paddr,
                chunk.data.len()
            );
            chunks.push(chunk);
        }
    }

    Ok(chunks)
}
