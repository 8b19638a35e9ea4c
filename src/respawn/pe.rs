// CLASSIFICATION: COMMUNITY
// Filename: pe.rs v0.5
// Author: Lukas Bower
// Date Modified: 2026-07-26

//! Pristine image reconstruction from on-disk PE files.
//!
//! Purification compares the child's mapped pages against what the signed
//! on-disk image says they must contain. That means laying the file out
//! by section and applying base relocations for the base the image is
//! actually mapped at, the same fix-ups the loader performed.

use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeError {
    #[error("{0}: cannot read image: {1}")]
    Read(String, std::io::Error),
    #[error("not a PE image (bad {0} signature)")]
    BadSignature(&'static str),
    #[error("image is not 64-bit")]
    NotPe64,
    #[error("malformed image: {0}")]
    Malformed(&'static str),
    #[error("unsupported relocation type {0}")]
    UnsupportedReloc(u16),
}

const DOS_MAGIC: u16 = 0x5a4d; // MZ
const PE_MAGIC: u32 = 0x0000_4550; // PE\0\0
const OPT_MAGIC_PE64: u16 = 0x20b;
const DIR_BASERELOC: usize = 5;
const REL_BASED_ABSOLUTE: u16 = 0;
const REL_BASED_DIR64: u16 = 10;

/// A section of the laid-out image, with its memory protection class.
pub struct SectionRange {
    pub rva: usize,
    pub len: usize,
    pub characteristics: u32,
}

impl SectionRange {
    pub fn executable(&self) -> bool {
        self.characteristics & 0x2000_0000 != 0 // IMAGE_SCN_MEM_EXECUTE
    }
    pub fn writable(&self) -> bool {
        self.characteristics & 0x8000_0000 != 0 // IMAGE_SCN_MEM_WRITE
    }
}

/// The pristine fixed-up copy of one image.
pub struct PristineImage {
    pub bytes: Vec<u8>,
    pub sections: Vec<SectionRange>,
    pub size_of_headers: usize,
}

fn rd_u16(b: &[u8], off: usize) -> Result<u16, PeError> {
    b.get(off..off + 2)
        .map(|s| u16::from_le_bytes([s[0], s[1]]))
        .ok_or(PeError::Malformed("short read (u16)"))
}

fn rd_u32(b: &[u8], off: usize) -> Result<u32, PeError> {
    b.get(off..off + 4)
        .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
        .ok_or(PeError::Malformed("short read (u32)"))
}

fn rd_u64(b: &[u8], off: usize) -> Result<u64, PeError> {
    b.get(off..off + 8)
        .map(|s| u64::from_le_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]]))
        .ok_or(PeError::Malformed("short read (u64)"))
}

/// Read `path`, lay it out by section, and relocate it for `actual_base`.
pub fn pristine_image(path: &Path, actual_base: u64) -> Result<PristineImage, PeError> {
    let file = std::fs::read(path)
        .map_err(|e| PeError::Read(path.display().to_string(), e))?;

    if rd_u16(&file, 0)? != DOS_MAGIC {
        return Err(PeError::BadSignature("DOS"));
    }
    let e_lfanew = rd_u32(&file, 0x3c)? as usize;
    if rd_u32(&file, e_lfanew)? != PE_MAGIC {
        return Err(PeError::BadSignature("NT"));
    }

    let file_hdr = e_lfanew + 4;
    let num_sections = rd_u16(&file, file_hdr + 2)? as usize;
    let opt_size = rd_u16(&file, file_hdr + 16)? as usize;
    let opt_hdr = file_hdr + 20;
    if rd_u16(&file, opt_hdr)? != OPT_MAGIC_PE64 {
        return Err(PeError::NotPe64);
    }
    let image_base = rd_u64(&file, opt_hdr + 24)?;
    let size_of_image = rd_u32(&file, opt_hdr + 56)? as usize;
    let size_of_headers = rd_u32(&file, opt_hdr + 60)? as usize;
    let num_dirs = rd_u32(&file, opt_hdr + 108)? as usize;

    if size_of_image == 0 || size_of_image > 0x2000_0000 {
        return Err(PeError::Malformed("absurd SizeOfImage"));
    }

    // Lay the sections out the way the loader does.
    let mut bytes = vec![0u8; size_of_image];
    let headers = file
        .get(..size_of_headers.min(file.len()))
        .ok_or(PeError::Malformed("headers past EOF"))?;
    bytes[..headers.len()].copy_from_slice(headers);

    let mut sections = Vec::with_capacity(num_sections);
    let sec_table = opt_hdr + opt_size;
    for i in 0..num_sections {
        let s = sec_table + i * 40;
        let virt_size = rd_u32(&file, s + 8)? as usize;
        let rva = rd_u32(&file, s + 12)? as usize;
        let raw_size = rd_u32(&file, s + 16)? as usize;
        let raw_off = rd_u32(&file, s + 20)? as usize;
        let characteristics = rd_u32(&file, s + 36)?;

        let copy = if virt_size == 0 {
            raw_size
        } else {
            raw_size.min(virt_size)
        };
        if rva + copy > bytes.len() || raw_off + copy > file.len() {
            return Err(PeError::Malformed("section past image or file end"));
        }
        bytes[rva..rva + copy].copy_from_slice(&file[raw_off..raw_off + copy]);
        sections.push(SectionRange {
            rva,
            len: virt_size.max(raw_size),
            characteristics,
        });
    }

    // Base relocations, exactly as the loader applied them.
    if num_dirs > DIR_BASERELOC {
        let dir = opt_hdr + 112 + DIR_BASERELOC * 8;
        let reloc_rva = rd_u32(&file, dir)? as usize;
        let reloc_size = rd_u32(&file, dir + 4)? as usize;
        if reloc_rva != 0 && reloc_size != 0 {
            apply_relocs(&mut bytes, reloc_rva, reloc_size, actual_base, image_base)?;
        }
    }

    Ok(PristineImage {
        bytes,
        sections,
        size_of_headers,
    })
}

fn apply_relocs(
    bytes: &mut [u8],
    reloc_rva: usize,
    reloc_size: usize,
    actual_base: u64,
    image_base: u64,
) -> Result<(), PeError> {
    let delta = actual_base.wrapping_sub(image_base);
    if delta == 0 {
        return Ok(());
    }
    let mut off = reloc_rva;
    let end = reloc_rva + reloc_size;
    while off + 8 <= end {
        let page_rva = rd_u32(bytes, off)? as usize;
        let block_size = rd_u32(bytes, off + 4)? as usize;
        if block_size < 8 || off + block_size > end {
            return Err(PeError::Malformed("relocation block size"));
        }
        let entries = (block_size - 8) / 2;
        for i in 0..entries {
            let raw = rd_u16(bytes, off + 8 + i * 2)?;
            let kind = raw >> 12;
            let target = page_rva + (raw & 0xfff) as usize;
            match kind {
                REL_BASED_ABSOLUTE => {}
                REL_BASED_DIR64 => {
                    let v = rd_u64(bytes, target)?.wrapping_add(delta);
                    bytes[target..target + 8].copy_from_slice(&v.to_le_bytes());
                }
                other => return Err(PeError::UnsupportedReloc(other)),
            }
        }
        off += block_size;
    }
    Ok(())
}
