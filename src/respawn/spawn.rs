// CLASSIFICATION: COMMUNITY
// Filename: spawn.rs v1.0
// Author: Lukas Bower
// Date Modified: 2026-08-01

//! Respawn mechanics: process creation, loader-thunk hooking, the
//! purification rendezvous, and handle hygiene afterwards.

use std::ffi::{OsStr, OsString};
use std::os::windows::ffi::OsStrExt;

use windows_sys::Win32::Foundation::{
    CloseHandle, DuplicateHandle, GetExitCodeProcess, HANDLE, WAIT_OBJECT_0,
};
use windows_sys::Win32::Security::{
    CreateRestrictedToken, SECURITY_ATTRIBUTES, TOKEN_ASSIGN_PRIMARY, TOKEN_DUPLICATE,
    TOKEN_QUERY, DISABLE_MAX_PRIVILEGE,
};
use windows_sys::Win32::System::Diagnostics::Debug::WriteProcessMemory;
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows_sys::Win32::System::Memory::VirtualProtectEx;
use windows_sys::Win32::System::Threading::{
    CreateEventW, CreateProcessAsUserW, CreateProcessW, GetCurrentProcess, GetProcessId,
    OpenProcessToken, ResumeThread, SetEvent, TerminateProcess, WaitForSingleObject,
    CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, INFINITE, PROCESS_INFORMATION,
    PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SYNCHRONIZE, PROCESS_TERMINATE, PROCESS_VM_READ,
    STARTUPINFOW,
};

use super::link::{self, RespawnLink, LINK_MAGIC};
use super::{purify, SENTINEL_STAGE1, SENTINEL_STAGE2};
use crate::err::{self, rc, InitOp};
use crate::identity::ProcessIdentity;

/// How long the parent waits for the child to reach early init, and the
/// child for the purified signal. Exceeding it is a purification failure.
const RENDEZVOUS_TIMEOUT_MS: u32 = 60_000;

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// Build a CreateProcess command line: sentinel argv[0], then the
/// surviving original arguments, quoted the way the C runtime unquotes.
fn build_command_line(sentinel: &str, args: &[OsString]) -> Vec<u16> {
    let mut line = OsString::from(sentinel);
    for arg in args {
        line.push(" ");
        push_quoted(&mut line, arg);
    }
    wide(&line)
}

fn push_quoted(line: &mut OsString, arg: &OsStr) {
    let s = arg.to_string_lossy();
    let needs_quotes = s.is_empty() || s.contains(' ') || s.contains('\t') || s.contains('"');
    if !needs_quotes {
        line.push(arg);
        return;
    }
    let mut quoted = String::from("\"");
    let mut backslashes = 0usize;
    for c in s.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
                continue;
            }
            _ => {}
        }
        if c != '\\' {
            quoted.extend(std::iter::repeat('\\').take(backslashes));
            backslashes = 0;
            quoted.push(c);
        }
    }
    quoted.extend(std::iter::repeat('\\').take(backslashes * 2));
    quoted.push('"');
    line.push(quoted);
}

/// First respawn: same image, fresh command line, nothing sensitive
/// inherited. The parent becomes a plain wait-and-exit shell.
pub fn respawn_first(identity: &ProcessIdentity, args: &[OsString]) -> i32 {
    crate::suplog!("respawn: first generation, shedding shims");
    let exe = wide(identity.exe_path.as_os_str());
    let mut cmdline = build_command_line(SENTINEL_STAGE1, &args[1..]);

    let mut si: STARTUPINFOW = unsafe { std::mem::zeroed() };
    si.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
    let mut pi: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

    let ok = unsafe {
        CreateProcessW(
            exe.as_ptr(),
            cmdline.as_mut_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            0, // no handle inheritance in the first hop
            CREATE_UNICODE_ENVIRONMENT,
            std::ptr::null(),
            std::ptr::null(),
            &si,
            &mut pi,
        )
    };
    if ok == 0 {
        err::fatal_msg(
            "respawn_first",
            InitOp::Misc,
            rc::INIT_FAILED,
            format_args!("CreateProcess failed: {}", last_error()),
        );
    }
    unsafe { CloseHandle(pi.hThread) };
    wait_and_adopt_exit_code(pi.hProcess)
}

/// Second respawn: suspended child, restricted token, hooked loader-init
/// thunk, purification, then hand-off. Returns the child's exit code.
pub fn respawn_second(identity: &ProcessIdentity, args: &[OsString]) -> i32 {
    crate::suplog!("respawn: second generation, creating purifiable child");

    let token = restricted_token();
    let (ping, pong) = rendezvous_events();

    let exe = wide(identity.exe_path.as_os_str());
    let mut cmdline = build_command_line(SENTINEL_STAGE2, &args[1..]);
    let mut si: STARTUPINFOW = unsafe { std::mem::zeroed() };
    si.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
    let mut pi: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

    let ok = unsafe {
        CreateProcessAsUserW(
            token,
            exe.as_ptr(),
            cmdline.as_mut_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            1, // the rendezvous events are inherited
            CREATE_SUSPENDED | CREATE_UNICODE_ENVIRONMENT,
            std::ptr::null(),
            std::ptr::null(),
            &si,
            &mut pi,
        )
    };
    unsafe { CloseHandle(token) };
    if ok == 0 {
        err::fatal_msg(
            "respawn_second",
            InitOp::Misc,
            rc::INIT_FAILED,
            format_args!("CreateProcessAsUser failed: {}", last_error()),
        );
    }

    run_purification(identity, pi.hProcess, pi.hThread, ping, pong)
}

fn run_purification(
    identity: &ProcessIdentity,
    child: HANDLE,
    main_thread: HANDLE,
    ping: HANDLE,
    pong: HANDLE,
) -> i32 {
    // Locate the loader-init thunk; same ntdll, same address over there.
    let (ntdll_base, thunk_addr) = loader_thunk_address();

    // Fill the rendezvous block and plant it in the child.
    let parent_dup = duplicate_into(child, unsafe { GetCurrentProcess() });
    let ping_dup = duplicate_into(child, ping);
    let pong_dup = duplicate_into(child, pong);
    let mut block = RespawnLink::zeroed();
    block.magic = LINK_MAGIC;
    block.ntdll_base = ntdll_base as u64;
    block.thunk_addr = thunk_addr as u64;
    block.event_ping = ping_dup;
    block.event_pong = pong_dup;
    block.parent_process = parent_dup;

    let hook = build_hook(super::early::thunk_entry_address());
    block.saved_thunk_len = hook.len() as u32;
    read_child(child, thunk_addr, &mut block.saved_thunk[..hook.len()]);

    write_child(child, link::link_address(), unsafe {
        std::slice::from_raw_parts(
            &block as *const RespawnLink as *const u8,
            std::mem::size_of::<RespawnLink>(),
        )
    });
    write_child_code(child, thunk_addr, &hook);

    // Let it run into the hook, then purify while it waits.
    unsafe { ResumeThread(main_thread) };
    if unsafe { WaitForSingleObject(ping, RENDEZVOUS_TIMEOUT_MS) } != WAIT_OBJECT_0 {
        kill_child(child, "child never reached early init");
    }
    if let Err(e) = purify::purify_child(
        child,
        &identity.exe_path,
        own_image_base(),
        ntdll_base,
        Some((thunk_addr, hook.len())),
    ) {
        kill_child(child, &format!("purification failed: {e}"));
    }

    // Handle hygiene before the child runs untrusted code: nothing with
    // write or duplicate rights may survive in this process.
    let limited = unsafe {
        let mut out: HANDLE = 0;
        let ok = DuplicateHandle(
            GetCurrentProcess(),
            child,
            GetCurrentProcess(),
            &mut out,
            PROCESS_TERMINATE
                | PROCESS_SYNCHRONIZE
                | PROCESS_QUERY_LIMITED_INFORMATION
                | PROCESS_VM_READ,
            0,
            0,
        );
        if ok == 0 {
            kill_child(child, "cannot narrow the child handle");
        }
        out
    };
    unsafe {
        CloseHandle(main_thread);
        CloseHandle(child);
    }

    unsafe { SetEvent(pong) };
    crate::suplog!("respawn: child purified, waiting for exit");

    let code = wait_and_adopt_exit_code_keep(limited);
    surface_child_error(limited);
    unsafe {
        CloseHandle(limited);
        CloseHandle(ping);
        CloseHandle(pong);
    }
    code
}

/// If the child parked an error record in its copy of the link before
/// dying, read it back (the narrowed handle kept VM_READ for exactly
/// this) and repeat it where the user can see it.
fn surface_child_error(limited: HANDLE) {
    use windows_sys::Win32::System::Diagnostics::Debug::ReadProcessMemory;

    let mut snapshot = RespawnLink::zeroed();
    let mut got = 0usize;
    let ok = unsafe {
        ReadProcessMemory(
            limited,
            link::link_address() as *const _,
            &mut snapshot as *mut RespawnLink as *mut _,
            std::mem::size_of::<RespawnLink>(),
            &mut got,
        )
    };
    if ok == 0 || got != std::mem::size_of::<RespawnLink>() {
        return;
    }
    if let Some((what, rc_val, where_, msg)) = link::take_child_error(&snapshot) {
        err::error(
            rc_val,
            false,
            format_args!("child error in {where_} (what={what}): {msg}"),
        );
    }
}

fn rendezvous_events() -> (HANDLE, HANDLE) {
    let sa = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: std::ptr::null_mut(),
        bInheritHandle: 1,
    };
    unsafe {
        let ping = CreateEventW(&sa, 0, 0, std::ptr::null());
        let pong = CreateEventW(&sa, 0, 0, std::ptr::null());
        if ping == 0 || pong == 0 {
            err::fatal_msg(
                "respawn_second",
                InitOp::Misc,
                rc::INIT_FAILED,
                format_args!("cannot create rendezvous events: {}", last_error()),
            );
        }
        (ping, pong)
    }
}

fn restricted_token() -> HANDLE {
    unsafe {
        let mut own: HANDLE = 0;
        if OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_DUPLICATE | TOKEN_ASSIGN_PRIMARY | TOKEN_QUERY,
            &mut own,
        ) == 0
        {
            err::fatal_msg(
                "respawn_second",
                InitOp::Misc,
                rc::PERMISSION_DENIED,
                format_args!("OpenProcessToken failed: {}", last_error()),
            );
        }
        let mut restricted: HANDLE = 0;
        let ok = CreateRestrictedToken(
            own,
            DISABLE_MAX_PRIVILEGE,
            0,
            std::ptr::null(),
            0,
            std::ptr::null(),
            0,
            std::ptr::null(),
            &mut restricted,
        );
        CloseHandle(own);
        if ok == 0 {
            err::fatal_msg(
                "respawn_second",
                InitOp::Misc,
                rc::PERMISSION_DENIED,
                format_args!("CreateRestrictedToken failed: {}", last_error()),
            );
        }
        restricted
    }
}

/// mov rax, imm64; jmp rax: the 12 bytes that make the child's first
/// instruction ours.
fn build_hook(target: usize) -> Vec<u8> {
    let mut hook = Vec::with_capacity(12);
    hook.extend_from_slice(&[0x48, 0xb8]);
    hook.extend_from_slice(&(target as u64).to_le_bytes());
    hook.extend_from_slice(&[0xff, 0xe0]);
    hook
}

fn loader_thunk_address() -> (usize, usize) {
    unsafe {
        let ntdll = wide(OsStr::new("ntdll.dll"));
        let base = GetModuleHandleW(ntdll.as_ptr());
        if base == 0 {
            err::fatal_msg(
                "respawn_second",
                InitOp::Misc,
                rc::INIT_FAILED,
                format_args!("ntdll has no base, which is absurd"),
            );
        }
        let name = b"LdrInitializeThunk\0";
        let addr = GetProcAddress(base, name.as_ptr());
        let Some(addr) = addr else {
            err::fatal_msg(
                "respawn_second",
                InitOp::Misc,
                rc::SYMBOL_NOT_FOUND,
                format_args!("LdrInitializeThunk not found in ntdll"),
            );
        };
        (base as usize, addr as usize)
    }
}

fn own_image_base() -> usize {
    unsafe { GetModuleHandleW(std::ptr::null()) as usize }
}

fn duplicate_into(child: HANDLE, handle: HANDLE) -> HANDLE {
    unsafe {
        let mut out: HANDLE = 0;
        const DUPLICATE_SAME_ACCESS: u32 = 0x2;
        if DuplicateHandle(
            GetCurrentProcess(),
            handle,
            child,
            &mut out,
            0,
            1,
            DUPLICATE_SAME_ACCESS,
        ) == 0
        {
            kill_child(child, "cannot duplicate a rendezvous handle into the child");
        }
        out
    }
}

fn read_child(child: HANDLE, addr: usize, buf: &mut [u8]) {
    use windows_sys::Win32::System::Diagnostics::Debug::ReadProcessMemory;
    let mut got = 0usize;
    let ok = unsafe {
        ReadProcessMemory(
            child,
            addr as *const _,
            buf.as_mut_ptr() as *mut _,
            buf.len(),
            &mut got,
        )
    };
    if ok == 0 || got != buf.len() {
        kill_child(child, "cannot read the child's loader thunk");
    }
}

fn write_child(child: HANDLE, addr: usize, bytes: &[u8]) {
    let mut written = 0usize;
    let ok = unsafe {
        WriteProcessMemory(
            child,
            addr as *mut _,
            bytes.as_ptr() as *const _,
            bytes.len(),
            &mut written,
        )
    };
    if ok == 0 || written != bytes.len() {
        kill_child(child, "cannot plant the rendezvous block in the child");
    }
}

fn write_child_code(child: HANDLE, addr: usize, bytes: &[u8]) {
    unsafe {
        let mut old = 0u32;
        const PAGE_EXECUTE_READWRITE: u32 = 0x40;
        if VirtualProtectEx(child, addr as *mut _, bytes.len(), PAGE_EXECUTE_READWRITE, &mut old)
            == 0
        {
            kill_child(child, "cannot unprotect the child's loader thunk");
        }
        write_child(child, addr, bytes);
        let mut ignored = 0u32;
        VirtualProtectEx(child, addr as *mut _, bytes.len(), old, &mut ignored);
    }
}

fn kill_child(child: HANDLE, why: &str) -> ! {
    unsafe { TerminateProcess(child, 99) };
    err::fatal_msg(
        "respawn_second",
        InitOp::Integrity,
        rc::PURIFICATION_FAILED,
        format_args!("{why}"),
    )
}

fn wait_and_adopt_exit_code(process: HANDLE) -> i32 {
    let code = wait_and_adopt_exit_code_keep(process);
    unsafe { CloseHandle(process) };
    code
}

fn wait_and_adopt_exit_code_keep(process: HANDLE) -> i32 {
    unsafe {
        WaitForSingleObject(process, INFINITE);
        let mut code: u32 = 1;
        GetExitCodeProcess(process, &mut code);
        code as i32
    }
}

/// Thread census of the child; purification insists on exactly one.
pub(super) fn count_child_threads(child: HANDLE) -> u32 {
    let pid = unsafe { GetProcessId(child) };
    let snap = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
    if snap == windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE {
        return 1;
    }
    let mut count = 0u32;
    let mut entry: THREADENTRY32 = unsafe { std::mem::zeroed() };
    entry.dwSize = std::mem::size_of::<THREADENTRY32>() as u32;
    unsafe {
        if Thread32First(snap, &mut entry) != 0 {
            loop {
                if entry.th32OwnerProcessID == pid {
                    count += 1;
                }
                if Thread32Next(snap, &mut entry) == 0 {
                    break;
                }
            }
        }
        CloseHandle(snap);
    }
    count
}

fn last_error() -> u32 {
    unsafe { windows_sys::Win32::Foundation::GetLastError() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_is_mov_rax_jmp_rax() {
        let hook = build_hook(0x1122_3344_5566_7788);
        assert_eq!(hook.len(), 12);
        assert_eq!(&hook[..2], &[0x48, 0xb8]);
        assert_eq!(&hook[10..], &[0xff, 0xe0]);
        assert_eq!(
            u64::from_le_bytes(hook[2..10].try_into().unwrap()),
            0x1122_3344_5566_7788
        );
    }

    #[test]
    fn command_line_quotes_only_when_needed() {
        let line = build_command_line(
            "sentinel",
            &[OsString::from("plain"), OsString::from("has space")],
        );
        let s = String::from_utf16_lossy(&line[..line.len() - 1]);
        assert_eq!(s, "sentinel plain \"has space\"");
    }
}
