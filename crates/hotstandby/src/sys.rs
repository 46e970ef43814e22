//! Raw `bpf(2)` and socket-option plumbing.
//!
//! Everything here is a thin wrapper over a single syscall. Attribute
//! structs mirror the prefix of `union bpf_attr` each command reads; the
//! kernel zero-fills the remainder, so passing the prefix size is enough.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

// bpf(2) commands (from linux/bpf.h).
const BPF_MAP_CREATE: libc::c_long = 0;
const BPF_MAP_LOOKUP_ELEM: libc::c_long = 1;
const BPF_MAP_UPDATE_ELEM: libc::c_long = 2;
const BPF_PROG_LOAD: libc::c_long = 5;
const BPF_OBJ_PIN: libc::c_long = 6;
const BPF_OBJ_GET: libc::c_long = 7;

pub const BPF_MAP_TYPE_REUSEPORT_SOCKARRAY: u32 = 20;
pub const BPF_PROG_TYPE_SK_REUSEPORT: u32 = 21;

const BPF_ANY: u64 = 0;

/// `src_reg` marker telling the verifier an `ld_imm64` immediate is a map fd.
pub const BPF_PSEUDO_MAP_FD: u8 = 1;

// Socket options (from asm-generic/socket.h).
const SO_ATTACH_REUSEPORT_EBPF: libc::c_int = 52;
const SO_COOKIE: libc::c_int = 57;

const VERIFIER_LOG_SIZE: usize = 1 << 20;

/// One eBPF instruction, laid out as `struct bpf_insn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Insn {
    pub code: u8,
    /// Low nibble `dst_reg`, high nibble `src_reg`.
    pub regs: u8,
    pub off: i16,
    pub imm: i32,
}

impl Insn {
    pub const SIZE: usize = mem::size_of::<Insn>();

    /// `BPF_LD | BPF_IMM | BPF_DW`, the first half of a 64-bit immediate load.
    pub const LD_IMM64: u8 = 0x18;
    /// `BPF_JMP | BPF_CALL`.
    pub const CALL: u8 = 0x85;

    pub fn from_le_bytes(b: [u8; 8]) -> Self {
        Self {
            code: b[0],
            regs: b[1],
            off: i16::from_le_bytes([b[2], b[3]]),
            imm: i32::from_le_bytes([b[4], b[5], b[6], b[7]]),
        }
    }

    pub fn src_reg(&self) -> u8 {
        self.regs >> 4
    }

    pub fn set_src_reg(&mut self, src: u8) {
        self.regs = (self.regs & 0x0f) | (src << 4);
    }
}

#[repr(C)]
#[derive(Default)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
}

#[repr(C)]
#[derive(Default)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Default)]
struct ObjAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

#[repr(C)]
#[derive(Default)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
    prog_name: [u8; 16],
    prog_ifindex: u32,
    expected_attach_type: u32,
}

fn bpf<T>(cmd: libc::c_long, attr: &mut T) -> io::Result<libc::c_long> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            mem::size_of::<T>() as libc::c_uint,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn bpf_fd<T>(cmd: libc::c_long, attr: &mut T) -> io::Result<OwnedFd> {
    let fd = bpf(cmd, attr)?;
    // SAFETY: a non-negative return from a fd-producing bpf command is a
    // fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

// ---------------------------------------------------------------------------
// Maps and pinning
// ---------------------------------------------------------------------------

/// Create an unpinned `REUSEPORT_SOCKARRAY` with `u32` keys and `u64` values.
pub fn create_sockarray(max_entries: u32) -> io::Result<OwnedFd> {
    let mut attr = MapCreateAttr {
        map_type: BPF_MAP_TYPE_REUSEPORT_SOCKARRAY,
        key_size: mem::size_of::<u32>() as u32,
        value_size: mem::size_of::<u64>() as u32,
        max_entries,
        map_flags: 0,
    };
    bpf_fd(BPF_MAP_CREATE, &mut attr)
}

/// Open a pinned bpf object (map or program) by its bpffs path.
pub fn obj_get(path: &Path) -> io::Result<OwnedFd> {
    let cpath = c_path(path)?;
    let mut attr = ObjAttr {
        pathname: cpath.as_ptr() as u64,
        ..Default::default()
    };
    bpf_fd(BPF_OBJ_GET, &mut attr)
}

/// Pin a bpf object at `path`. Fails with `EEXIST` if the path is taken.
pub fn obj_pin(fd: BorrowedFd<'_>, path: &Path) -> io::Result<()> {
    let cpath = c_path(path)?;
    let mut attr = ObjAttr {
        pathname: cpath.as_ptr() as u64,
        bpf_fd: fd.as_raw_fd() as u32,
        file_flags: 0,
    };
    bpf(BPF_OBJ_PIN, &mut attr).map(drop)
}

/// Store a socket in a sockarray slot. The kernel keeps a reference to the
/// socket itself, not to the descriptor.
pub fn sockarray_update(map: BorrowedFd<'_>, key: u32, socket: BorrowedFd<'_>) -> io::Result<()> {
    let value = socket.as_raw_fd() as u64;
    let mut attr = MapElemAttr {
        map_fd: map.as_raw_fd() as u32,
        key: &key as *const u32 as u64,
        value: &value as *const u64 as u64,
        flags: BPF_ANY,
        ..Default::default()
    };
    bpf(BPF_MAP_UPDATE_ELEM, &mut attr).map(drop)
}

/// Read a sockarray slot. With 8-byte values the kernel reports the
/// socket cookie. `ENOENT` means the slot is empty.
pub fn sockarray_lookup(map: BorrowedFd<'_>, key: u32) -> io::Result<u64> {
    let mut value: u64 = 0;
    let mut attr = MapElemAttr {
        map_fd: map.as_raw_fd() as u32,
        key: &key as *const u32 as u64,
        value: &mut value as *mut u64 as u64,
        ..Default::default()
    };
    bpf(BPF_MAP_LOOKUP_ELEM, &mut attr)?;
    Ok(value)
}

// ---------------------------------------------------------------------------
// Programs
// ---------------------------------------------------------------------------

/// Load an `sk_reuseport` program.
///
/// The first attempt runs without a verifier log. On rejection the load is
/// repeated with logging enabled so the error carries the verifier output.
pub fn load_reuseport_prog(name: &str, insns: &[Insn], license: &str) -> io::Result<OwnedFd> {
    let license = CString::new(license)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "license contains NUL"))?;
    let mut prog_name = [0u8; 16];
    for (dst, src) in prog_name.iter_mut().zip(name.bytes().take(15)) {
        *dst = src;
    }

    let mut attr = ProgLoadAttr {
        prog_type: BPF_PROG_TYPE_SK_REUSEPORT,
        insn_cnt: insns.len() as u32,
        insns: insns.as_ptr() as u64,
        license: license.as_ptr() as u64,
        prog_name,
        ..Default::default()
    };
    match bpf_fd(BPF_PROG_LOAD, &mut attr) {
        Ok(fd) => Ok(fd),
        Err(first) => {
            let mut log = vec![0u8; VERIFIER_LOG_SIZE];
            attr.log_level = 1;
            attr.log_size = log.len() as u32;
            attr.log_buf = log.as_mut_ptr() as u64;
            match bpf_fd(BPF_PROG_LOAD, &mut attr) {
                Ok(fd) => Ok(fd),
                Err(_) => {
                    let end = log.iter().position(|&b| b == 0).unwrap_or(log.len());
                    let text = String::from_utf8_lossy(&log[..end]);
                    let tail: Vec<&str> = text.lines().rev().take(8).collect();
                    let tail: Vec<&str> = tail.into_iter().rev().collect();
                    Err(io::Error::new(
                        first.kind(),
                        format!("{first}; verifier: {}", tail.join(" | ")),
                    ))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sockets and files
// ---------------------------------------------------------------------------

fn sol_socket_setsockopt<T>(fd: RawFd, opt: libc::c_int, val: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            val as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn sol_socket_getsockopt<T: Default>(fd: RawFd, opt: libc::c_int) -> io::Result<T> {
    let mut val = T::default();
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &mut val as *mut T as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(val)
    }
}

/// Attach a loaded program to the reuseport group `socket` belongs to.
/// Re-attaching replaces the group's program.
pub fn attach_reuseport_prog(socket: BorrowedFd<'_>, prog: BorrowedFd<'_>) -> io::Result<()> {
    let prog_fd: libc::c_int = prog.as_raw_fd();
    sol_socket_setsockopt(socket.as_raw_fd(), SO_ATTACH_REUSEPORT_EBPF, &prog_fd)
}

/// The kernel's 64-bit identifier for a socket, stable for its lifetime.
pub fn socket_cookie(socket: BorrowedFd<'_>) -> io::Result<u64> {
    sol_socket_getsockopt::<u64>(socket.as_raw_fd(), SO_COOKIE)
}

/// Non-blocking exclusive `flock`. `Ok(false)` means another open file
/// description holds it.
pub fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Whether `pid` names a running process. Non-positive ids never do.
pub fn process_alive(pid: libc::pid_t) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::fd::AsFd;

    #[test]
    fn insn_is_eight_bytes() {
        assert_eq!(Insn::SIZE, 8);
        assert_eq!(mem::size_of::<MapElemAttr>(), 32);
        assert_eq!(mem::size_of::<ProgLoadAttr>(), 72);
    }

    #[test]
    fn insn_decodes_little_endian_fields() {
        let insn = Insn::from_le_bytes([0x18, 0x21, 0xfe, 0xff, 0x07, 0x00, 0x00, 0x00]);
        assert_eq!(insn.code, Insn::LD_IMM64);
        assert_eq!(insn.regs & 0x0f, 1);
        assert_eq!(insn.src_reg(), 2);
        assert_eq!(insn.off, -2);
        assert_eq!(insn.imm, 7);
    }

    #[test]
    fn set_src_reg_keeps_dst() {
        let mut insn = Insn { code: Insn::LD_IMM64, regs: 0x02, off: 0, imm: 0 };
        insn.set_src_reg(BPF_PSEUDO_MAP_FD);
        assert_eq!(insn.regs, 0x12);
        assert_eq!(insn.src_reg(), BPF_PSEUDO_MAP_FD);
    }

    #[test]
    fn cookies_are_distinct_per_socket() {
        let a = TcpListener::bind("127.0.0.1:0").unwrap();
        let b = TcpListener::bind("127.0.0.1:0").unwrap();
        let ca = socket_cookie(a.as_fd()).unwrap();
        let cb = socket_cookie(b.as_fd()).unwrap();
        assert_ne!(ca, cb);
        assert_eq!(ca, socket_cookie(a.as_fd()).unwrap());
    }

    #[test]
    fn flock_is_exclusive_across_open_files() {
        let path = std::env::temp_dir().join(format!("hotstandby-sys-{}", std::process::id()));
        let first = File::create(&path).unwrap();
        let second = File::options().write(true).open(&path).unwrap();
        assert!(try_lock_exclusive(&first).unwrap());
        assert!(!try_lock_exclusive(&second).unwrap());
        drop(first);
        assert!(try_lock_exclusive(&second).unwrap());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(process_alive(std::process::id() as libc::pid_t));
        assert!(!process_alive(0));
        assert!(!process_alive(-1));
    }

    #[test]
    fn obj_get_missing_path_is_enoent_or_eperm() {
        let err = obj_get(Path::new("/sys/fs/bpf/hotstandby-does-not-exist")).unwrap_err();
        assert!(err.raw_os_error().is_some());
    }
}
