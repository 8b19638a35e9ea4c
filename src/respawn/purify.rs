// CLASSIFICATION: COMMUNITY
// Filename: purify.rs v0.9
// Author: Lukas Bower
// Date Modified: 2026-08-01

//! Child purification.
//!
//! Runs in the parent while the child sits in its early-init wait. Every
//! shortcoming found here is corrected rather than merely reported, and
//! anything that cannot be corrected kills the launch.

use std::path::{Path, PathBuf};

use thiserror::Error;

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::Diagnostics::Debug::{
    CheckRemoteDebuggerPresent, FlushInstructionCache, ReadProcessMemory, WriteProcessMemory,
};
use windows_sys::Win32::System::Memory::{
    UnmapViewOfFile2, VirtualFreeEx, VirtualProtectEx, VirtualQueryEx, MEMORY_BASIC_INFORMATION,
    MEM_COMMIT, MEM_IMAGE, MEM_RELEASE, PAGE_EXECUTE, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_READWRITE,
};
use windows_sys::Win32::System::ProcessStatus::K32GetMappedFileNameW;

use super::link;
use super::pe;

const PAGE_SIZE: usize = 0x1000;

#[derive(Debug, Error)]
pub enum PurifyError {
    #[error("a debugger is attached to the child")]
    DebuggerAttached,
    #[error("child has {0} threads at purification time")]
    ExtraThreads(u32),
    #[error("unknown executable region at {addr:#x} ({len:#x} bytes) cannot be freed")]
    StuckRegion { addr: usize, len: usize },
    #[error("module {0} is not in the trusted set and cannot be unloaded")]
    StuckModule(String),
    #[error("cannot rewrite child page at {addr:#x}")]
    WriteBack { addr: usize },
    #[error("cannot read child memory at {addr:#x}")]
    ReadChild { addr: usize },
    #[error("pristine image: {0}")]
    Pe(#[from] pe::PeError),
}

/// Modules allowed to stay mapped in the purified child. Everything else
/// is unloaded or the launch dies.
const TRUSTED_MODULES: &[&str] = &["ntdll.dll"];

fn exec_protect(p: u32) -> bool {
    matches!(
        p,
        PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY
    )
}

struct Region {
    base: usize,
    alloc_base: usize,
    size: usize,
    protect: u32,
    kind: u32,
}

fn query_regions(child: HANDLE) -> Vec<Region> {
    let mut regions = Vec::new();
    let mut addr = 0usize;
    loop {
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let got = unsafe {
            VirtualQueryEx(
                child,
                addr as *const _,
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if got == 0 {
            break;
        }
        if info.State == MEM_COMMIT {
            regions.push(Region {
                base: info.BaseAddress as usize,
                alloc_base: info.AllocationBase as usize,
                size: info.RegionSize,
                protect: info.Protect,
                kind: info.Type,
            });
        }
        let next = (info.BaseAddress as usize).wrapping_add(info.RegionSize);
        if next <= addr {
            break;
        }
        addr = next;
    }
    regions
}

fn mapped_file_name(child: HANDLE, base: usize) -> Option<PathBuf> {
    let mut buf = [0u16; 1024];
    let n = unsafe {
        K32GetMappedFileNameW(child, base as *const _, buf.as_mut_ptr(), buf.len() as u32)
    };
    if n == 0 {
        return None;
    }
    Some(PathBuf::from(String::from_utf16_lossy(&buf[..n as usize])))
}

fn module_basename(path: &Path) -> String {
    path.file_name()
        .map(|f| f.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Full purification pass over the suspended-and-waiting child.
///
/// `exe_path` is the on-disk stub image (also the child's image);
/// `exe_base`/`ntdll_base` are where the child has them mapped. `hook` is
/// the address and length of the loader-thunk hook the caller installed;
/// only the caller knows it, since the parent's own link static is never
/// written.
pub fn purify_child(
    child: HANDLE,
    exe_path: &Path,
    exe_base: usize,
    ntdll_base: usize,
    hook: Option<(usize, usize)>,
) -> Result<(), PurifyError> {
    let mut debugged = 0i32;
    if unsafe { CheckRemoteDebuggerPresent(child, &mut debugged) } != 0 && debugged != 0 {
        return Err(PurifyError::DebuggerAttached);
    }
    let threads = super::spawn::count_child_threads(child);
    if threads > 1 {
        return Err(PurifyError::ExtraThreads(threads));
    }

    let regions = query_regions(child);

    // Pass 1: evict executable memory that belongs to no image mapping,
    // and unload image mappings outside the trusted set.
    let mut image_bases: Vec<usize> = Vec::new();
    for r in &regions {
        if r.kind == MEM_IMAGE {
            if !image_bases.contains(&r.alloc_base) {
                image_bases.push(r.alloc_base);
            }
            continue;
        }
        if exec_protect(r.protect) {
            log::warn!(
                "purify: freeing foreign executable region {:#x}+{:#x}",
                r.base,
                r.size
            );
            let freed = unsafe { VirtualFreeEx(child, r.alloc_base as *mut _, 0, MEM_RELEASE) };
            let freed = if freed == 0 {
                unsafe { UnmapViewOfFile2(child, r.alloc_base as *const _, 0) }
            } else {
                freed
            };
            if freed == 0 {
                return Err(PurifyError::StuckRegion {
                    addr: r.base,
                    len: r.size,
                });
            }
        }
    }

    for &base in &image_bases {
        if base == exe_base || base == ntdll_base {
            continue;
        }
        let name = mapped_file_name(child, base)
            .map(|p| module_basename(&p))
            .unwrap_or_default();
        if TRUSTED_MODULES.contains(&name.as_str()) {
            continue;
        }
        log::warn!("purify: unloading untrusted module {name} at {base:#x}");
        if unsafe { UnmapViewOfFile2(child, base as *const _, 0) } == 0 {
            return Err(PurifyError::StuckModule(name));
        }
    }

    // Pass 2: restore every image page to its pristine fixed-up content.
    // The hook range is exempted during the compare and put back in a
    // dedicated final step, so its page never counts as tampered.
    let exempt_link = (link::link_address(), link::link_size());
    restore_image(child, exe_path, exe_base, Some(exempt_link))?;
    let ntdll_path = mapped_file_name(child, ntdll_base)
        .unwrap_or_else(|| PathBuf::from(r"C:\Windows\System32\ntdll.dll"));
    restore_image_with_hook(child, &ntdll_path, ntdll_base, hook)?;

    Ok(())
}

fn restore_image(
    child: HANDLE,
    disk_path: &Path,
    base: usize,
    exempt: Option<(usize, usize)>,
) -> Result<(), PurifyError> {
    restore_image_inner(child, disk_path, base, exempt, None)
}

fn restore_image_with_hook(
    child: HANDLE,
    disk_path: &Path,
    base: usize,
    hook: Option<(usize, usize)>,
) -> Result<(), PurifyError> {
    restore_image_inner(child, disk_path, base, None, hook)
}

/// Compare the mapped image page by page against the pristine copy and
/// write back whatever differs. Writable sections are the child's own
/// business; only read-only and executable sections are enforced.
fn restore_image_inner(
    child: HANDLE,
    disk_path: &Path,
    base: usize,
    exempt: Option<(usize, usize)>,
    hook: Option<(usize, usize)>,
) -> Result<(), PurifyError> {
    let pristine = pe::pristine_image(disk_path, base as u64)?;

    let mut page = vec![0u8; PAGE_SIZE];
    for sec in &pristine.sections {
        if sec.writable() {
            continue;
        }
        let mut off = sec.rva;
        let sec_end = sec.rva + sec.len;
        while off < sec_end {
            let want_end = (off + PAGE_SIZE).min(sec_end).min(pristine.bytes.len());
            if off >= want_end {
                break;
            }
            let want = &pristine.bytes[off..want_end];
            let addr = base + off;
            let mut got = 0usize;
            let ok = unsafe {
                ReadProcessMemory(
                    child,
                    addr as *const _,
                    page.as_mut_ptr() as *mut _,
                    want.len(),
                    &mut got,
                )
            };
            if ok == 0 || got != want.len() {
                return Err(PurifyError::ReadChild { addr });
            }
            if page[..want.len()] != *want {
                let fixed = patch_exemptions(&page[..want.len()], want, addr, exempt, hook);
                if fixed != page[..want.len()] {
                    log::warn!("purify: restoring tampered page at {addr:#x}");
                    write_child_page(child, addr, &fixed)?;
                }
            }
            off = want_end;
        }
    }

    // Put the original loader-thunk bytes back now that the compare is
    // done; the hook has served its purpose.
    if let Some((addr, len)) = hook {
        if addr >= base && addr + len <= base + pristine.bytes.len() {
            let want = &pristine.bytes[addr - base..addr - base + len];
            write_child_page(child, addr, want)?;
        }
    }

    unsafe { FlushInstructionCache(child, std::ptr::null(), 0) };
    Ok(())
}

/// Build the bytes a differing page must become: pristine content, except
/// that the rendezvous block and the not-yet-removed hook keep their
/// current values.
fn patch_exemptions(
    current: &[u8],
    pristine: &[u8],
    page_addr: usize,
    exempt: Option<(usize, usize)>,
    hook: Option<(usize, usize)>,
) -> Vec<u8> {
    let mut out = pristine.to_vec();
    for range in [exempt, hook].into_iter().flatten() {
        let (start, len) = range;
        let end = start + len;
        let page_end = page_addr + current.len();
        let lo = start.max(page_addr);
        let hi = end.min(page_end);
        if lo < hi {
            let a = lo - page_addr;
            let b = hi - page_addr;
            out[a..b].copy_from_slice(&current[a..b]);
        }
    }
    out
}

fn write_child_page(child: HANDLE, addr: usize, bytes: &[u8]) -> Result<(), PurifyError> {
    unsafe {
        let mut old = 0u32;
        if VirtualProtectEx(child, addr as *mut _, bytes.len(), PAGE_READWRITE, &mut old) == 0 {
            return Err(PurifyError::WriteBack { addr });
        }
        let mut written = 0usize;
        let ok = WriteProcessMemory(
            child,
            addr as *mut _,
            bytes.as_ptr() as *const _,
            bytes.len(),
            &mut written,
        );
        let mut ignored = 0u32;
        VirtualProtectEx(child, addr as *mut _, bytes.len(), old, &mut ignored);
        if ok == 0 || written != bytes.len() {
            return Err(PurifyError::WriteBack { addr });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exemptions_keep_current_bytes_in_range() {
        let current = [0xAAu8; 32];
        let pristine = [0x00u8; 32];
        // Exempt bytes 8..16 of a page based at 0x1000.
        let out = patch_exemptions(&current, &pristine, 0x1000, Some((0x1008, 8)), None);
        assert_eq!(&out[..8], &[0u8; 8]);
        assert_eq!(&out[8..16], &[0xAAu8; 8]);
        assert_eq!(&out[16..], &[0u8; 16]);
    }

    #[test]
    fn exemptions_outside_page_do_nothing() {
        let current = [0xAAu8; 16];
        let pristine = [0x11u8; 16];
        let out = patch_exemptions(&current, &pristine, 0x1000, Some((0x9000, 64)), None);
        assert_eq!(out, pristine.to_vec());
    }
}
