//! File access interposition, loaded into jobs through `LD_PRELOAD` or
//! `LD_AUDIT`.
//!
//! Every intercepted libc call reports its path on the control socket named
//! by `DYNMAKE_CONTROL` and waits for the answer before doing the real call,
//! so whatever the job reads is up to date by the time it reads it.
//!
//! Only libc is used here: this code runs inside arbitrary programs.

use libc::{c_char, c_int, c_long, c_uint, c_void, mode_t, size_t, ssize_t, FILE};
use std::cell::Cell;
use std::ffi::CStr;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const CONTROL_ENV: &str = "DYNMAKE_CONTROL";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Read,
    Write,
    Stat,
    Unlink,
}

impl Kind {
    fn as_str(self) -> &'static str {
        match self {
            Kind::Read => "read",
            Kind::Write => "write",
            Kind::Stat => "stat",
            Kind::Unlink => "unlink",
        }
    }
}

struct Conn {
    /// A forked child must not share its parent's connection.
    pid: libc::pid_t,
    w: UnixStream,
    r: BufReader<UnixStream>,
}

static CONN: Mutex<Option<Conn>> = Mutex::new(None);

thread_local! {
    /// Set while reporting, so our own libc calls go straight through.
    static BUSY: Cell<bool> = const { Cell::new(false) };
}

fn connect(pid: libc::pid_t) -> Option<Conn> {
    let path = std::env::var_os(CONTROL_ENV)?;
    let w = UnixStream::connect(path).ok()?;
    let r = BufReader::new(w.try_clone().ok()?);
    Some(Conn { pid, w, r })
}

fn quote(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn message(path: &str, kind: Kind, cwd: Option<&str>) -> String {
    let mut line = String::with_capacity(path.len() + 64);
    line.push_str("{\"op\":\"access\",\"path\":");
    quote(&mut line, path);
    line.push_str(",\"kind\":\"");
    line.push_str(kind.as_str());
    line.push('"');
    if let Some(cwd) = cwd {
        line.push_str(",\"cwd\":");
        quote(&mut line, cwd);
    }
    line.push_str("}\n");
    line
}

/// Send one access and wait for the engine's answer.  The answer itself is
/// not used: a dep in error is the engine's business, not the job's.
fn send(line: &str) {
    let Ok(mut guard) = CONN.lock() else {
        return;
    };
    let pid = unsafe { libc::getpid() };
    if guard.as_ref().map_or(true, |c| c.pid != pid) {
        *guard = connect(pid);
    }
    let Some(conn) = guard.as_mut() else {
        return;
    };
    let mut reply = String::new();
    let ok = conn.w.write_all(line.as_bytes()).is_ok()
        && conn.r.read_line(&mut reply).map_or(false, |n| n > 0);
    if !ok {
        *guard = None;
    }
}

/// Kernel pseudo filesystems never hold anything the engine builds.
fn ignored(path: &str) -> bool {
    path.is_empty()
        || ["/proc/", "/dev/", "/sys/"]
            .iter()
            .any(|p| path.starts_with(p))
}

/// The directory a relative path is relative to.
fn base_dir(dirfd: c_int, path: &str) -> Option<String> {
    if path.starts_with('/') {
        return None;
    }
    let dir = if dirfd == libc::AT_FDCWD {
        std::env::current_dir().ok()?
    } else {
        std::fs::read_link(format!("/proc/self/fd/{}", dirfd)).ok()?
    };
    Some(dir.to_string_lossy().into_owned())
}

unsafe fn report_at(dirfd: c_int, path: *const c_char, kind: Kind) {
    if path.is_null() {
        return;
    }
    let entered = BUSY.try_with(|b| !b.replace(true)).unwrap_or(false);
    if !entered {
        return;
    }
    let path = CStr::from_ptr(path).to_string_lossy();
    if !ignored(&path) {
        let cwd = base_dir(dirfd, &path);
        send(&message(&path, kind, cwd.as_deref()));
    }
    let _ = BUSY.try_with(|b| b.set(false));
}

unsafe fn report(path: *const c_char, kind: Kind) {
    report_at(libc::AT_FDCWD, path, kind)
}

unsafe fn report_open(dirfd: c_int, path: *const c_char, flags: c_int) {
    if flags & libc::O_DIRECTORY != 0 {
        return report_at(dirfd, path, Kind::Stat);
    }
    let mode = flags & libc::O_ACCMODE;
    if mode == libc::O_RDONLY || (mode == libc::O_RDWR && flags & libc::O_TRUNC == 0) {
        report_at(dirfd, path, Kind::Read);
    }
    if mode != libc::O_RDONLY {
        report_at(dirfd, path, Kind::Write);
    }
}

unsafe fn report_fopen(path: *const c_char, mode: *const c_char) {
    let mode = if mode.is_null() {
        &b""[..]
    } else {
        CStr::from_ptr(mode).to_bytes()
    };
    let update = mode.contains(&b'+');
    match mode.first() {
        Some(b'r') => {
            report(path, Kind::Read);
            if update {
                report(path, Kind::Write);
            }
        }
        Some(b'w') | Some(b'a') => report(path, Kind::Write),
        _ => {}
    }
}

trait Failed {
    fn failed() -> Self;
}

impl Failed for c_int {
    fn failed() -> Self {
        -1
    }
}

impl Failed for ssize_t {
    fn failed() -> Self {
        -1
    }
}

impl<T> Failed for *mut T {
    fn failed() -> Self {
        std::ptr::null_mut()
    }
}

/// What to return when the real function cannot be found.
unsafe fn missing<T: Failed>() -> T {
    *libc::__errno_location() = libc::ENOSYS;
    T::failed()
}

/// The next definition of a libc function after ours.
macro_rules! real {
    ($name:ident: $ty:ty) => {{
        static PTR: AtomicUsize = AtomicUsize::new(0);
        let mut p = PTR.load(Ordering::Relaxed);
        if p == 0 {
            let sym = concat!(stringify!($name), "\0");
            p = libc::dlsym(libc::RTLD_NEXT, sym.as_ptr() as *const c_char) as usize;
            PTR.store(p, Ordering::Relaxed);
        }
        if p == 0 {
            None
        } else {
            Some(std::mem::transmute::<usize, $ty>(p))
        }
    }};
}

/// Functions whose first argument is the accessed path.
macro_rules! interpose {
    ($(fn $name:ident($path:ident $(, $arg:ident: $ty:ty)*) -> $ret:ty => $kind:expr;)*) => {$(
        #[no_mangle]
        pub unsafe extern "C" fn $name($path: *const c_char $(, $arg: $ty)*) -> $ret {
            report($path, $kind);
            match real!($name: unsafe extern "C" fn(*const c_char $(, $ty)*) -> $ret) {
                Some(f) => f($path $(, $arg)*),
                None => missing(),
            }
        }
    )*};
}

/// Functions taking a directory fd and a path relative to it.
macro_rules! interpose_at {
    ($(fn $name:ident($dirfd:ident, $path:ident $(, $arg:ident: $ty:ty)*) -> $ret:ty => $kind:expr;)*) => {$(
        #[no_mangle]
        pub unsafe extern "C" fn $name($dirfd: c_int, $path: *const c_char $(, $arg: $ty)*) -> $ret {
            report_at($dirfd, $path, $kind);
            match real!($name: unsafe extern "C" fn(c_int, *const c_char $(, $ty)*) -> $ret) {
                Some(f) => f($dirfd, $path $(, $arg)*),
                None => missing(),
            }
        }
    )*};
}

interpose! {
    fn creat(path, mode: mode_t) -> c_int => Kind::Write;
    fn creat64(path, mode: mode_t) -> c_int => Kind::Write;
    fn truncate(path, len: libc::off_t) -> c_int => Kind::Write;
    fn stat(path, buf: *mut c_void) -> c_int => Kind::Stat;
    fn lstat(path, buf: *mut c_void) -> c_int => Kind::Stat;
    fn stat64(path, buf: *mut c_void) -> c_int => Kind::Stat;
    fn lstat64(path, buf: *mut c_void) -> c_int => Kind::Stat;
    fn access(path, mode: c_int) -> c_int => Kind::Stat;
    fn readlink(path, buf: *mut c_char, size: size_t) -> ssize_t => Kind::Read;
    fn unlink(path) -> c_int => Kind::Unlink;
    fn remove(path) -> c_int => Kind::Unlink;
    fn execve(path, argv: *const *const c_char, envp: *const *const c_char) -> c_int => Kind::Read;
}

interpose_at! {
    fn fstatat(dirfd, path, buf: *mut c_void, flags: c_int) -> c_int => Kind::Stat;
    fn fstatat64(dirfd, path, buf: *mut c_void, flags: c_int) -> c_int => Kind::Stat;
    fn statx(dirfd, path, flags: c_int, mask: c_uint, buf: *mut c_void) -> c_int => Kind::Stat;
    fn faccessat(dirfd, path, mode: c_int, flags: c_int) -> c_int => Kind::Stat;
    fn readlinkat(dirfd, path, buf: *mut c_char, size: size_t) -> ssize_t => Kind::Read;
    fn unlinkat(dirfd, path, flags: c_int) -> c_int => Kind::Unlink;
}

// glibc before 2.33 routes stat through these.
#[no_mangle]
pub unsafe extern "C" fn __xstat(ver: c_int, path: *const c_char, buf: *mut c_void) -> c_int {
    report(path, Kind::Stat);
    match real!(__xstat: unsafe extern "C" fn(c_int, *const c_char, *mut c_void) -> c_int) {
        Some(f) => f(ver, path, buf),
        None => missing(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn __lxstat(ver: c_int, path: *const c_char, buf: *mut c_void) -> c_int {
    report(path, Kind::Stat);
    match real!(__lxstat: unsafe extern "C" fn(c_int, *const c_char, *mut c_void) -> c_int) {
        Some(f) => f(ver, path, buf),
        None => missing(),
    }
}

// The open family is variadic in C.  The mode is only read when O_CREAT is
// given, and is passed in the same register either way.
#[no_mangle]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    report_open(libc::AT_FDCWD, path, flags);
    match real!(open: unsafe extern "C" fn(*const c_char, c_int, ...) -> c_int) {
        Some(f) => f(path, flags, mode),
        None => missing(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    report_open(libc::AT_FDCWD, path, flags);
    match real!(open64: unsafe extern "C" fn(*const c_char, c_int, ...) -> c_int) {
        Some(f) => f(path, flags, mode),
        None => missing(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    report_open(dirfd, path, flags);
    match real!(openat: unsafe extern "C" fn(c_int, *const c_char, c_int, ...) -> c_int) {
        Some(f) => f(dirfd, path, flags, mode),
        None => missing(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn openat64(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    report_open(dirfd, path, flags);
    match real!(openat64: unsafe extern "C" fn(c_int, *const c_char, c_int, ...) -> c_int) {
        Some(f) => f(dirfd, path, flags, mode),
        None => missing(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn fopen(path: *const c_char, mode: *const c_char) -> *mut FILE {
    report_fopen(path, mode);
    match real!(fopen: unsafe extern "C" fn(*const c_char, *const c_char) -> *mut FILE) {
        Some(f) => f(path, mode),
        None => missing(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn fopen64(path: *const c_char, mode: *const c_char) -> *mut FILE {
    report_fopen(path, mode);
    match real!(fopen64: unsafe extern "C" fn(*const c_char, *const c_char) -> *mut FILE) {
        Some(f) => f(path, mode),
        None => missing(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn rename(old: *const c_char, new: *const c_char) -> c_int {
    report(old, Kind::Unlink);
    report(new, Kind::Write);
    match real!(rename: unsafe extern "C" fn(*const c_char, *const c_char) -> c_int) {
        Some(f) => f(old, new),
        None => missing(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn renameat(olddir: c_int, old: *const c_char, newdir: c_int, new: *const c_char) -> c_int {
    report_at(olddir, old, Kind::Unlink);
    report_at(newdir, new, Kind::Write);
    match real!(renameat: unsafe extern "C" fn(c_int, *const c_char, c_int, *const c_char) -> c_int) {
        Some(f) => f(olddir, old, newdir, new),
        None => missing(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn renameat2(
    olddir: c_int,
    old: *const c_char,
    newdir: c_int,
    new: *const c_char,
    flags: c_uint,
) -> c_int {
    report_at(olddir, old, Kind::Unlink);
    report_at(newdir, new, Kind::Write);
    match real!(renameat2: unsafe extern "C" fn(c_int, *const c_char, c_int, *const c_char, c_uint) -> c_int) {
        Some(f) => f(olddir, old, newdir, new, flags),
        None => missing(),
    }
}

// LD_AUDIT entry points.  Under LD_AUDIT this library lives in its own
// namespace, so the program only reaches the functions above through
// la_symbind64.

const LAV_CURRENT: c_uint = 1;
const LA_FLG_BINDTO: c_uint = 0x01;
const LA_FLG_BINDFROM: c_uint = 0x02;
const LA_SER_ORIG: c_uint = 0x01;

#[no_mangle]
pub extern "C" fn la_version(_version: c_uint) -> c_uint {
    LAV_CURRENT
}

#[no_mangle]
pub extern "C" fn la_objopen(_map: *mut c_void, _lmid: c_long, _cookie: *mut usize) -> c_uint {
    LA_FLG_BINDTO | LA_FLG_BINDFROM
}

/// Libraries the loader looks for are deps of the job too.
#[no_mangle]
pub unsafe extern "C" fn la_objsearch(name: *const c_char, _cookie: *mut usize, flag: c_uint) -> *mut c_char {
    if flag != LA_SER_ORIG && !name.is_null() && CStr::from_ptr(name).to_bytes().contains(&b'/') {
        report(name, Kind::Read);
    }
    name as *mut c_char
}

fn replacement(name: &[u8]) -> Option<usize> {
    let f = match name {
        b"open" => open as usize,
        b"open64" => open64 as usize,
        b"openat" => openat as usize,
        b"openat64" => openat64 as usize,
        b"creat" => creat as usize,
        b"creat64" => creat64 as usize,
        b"truncate" => truncate as usize,
        b"fopen" => fopen as usize,
        b"fopen64" => fopen64 as usize,
        b"stat" => stat as usize,
        b"lstat" => lstat as usize,
        b"stat64" => stat64 as usize,
        b"lstat64" => lstat64 as usize,
        b"__xstat" => __xstat as usize,
        b"__lxstat" => __lxstat as usize,
        b"fstatat" => fstatat as usize,
        b"fstatat64" => fstatat64 as usize,
        b"statx" => statx as usize,
        b"access" => access as usize,
        b"faccessat" => faccessat as usize,
        b"readlink" => readlink as usize,
        b"readlinkat" => readlinkat as usize,
        b"unlink" => unlink as usize,
        b"unlinkat" => unlinkat as usize,
        b"remove" => remove as usize,
        b"rename" => rename as usize,
        b"renameat" => renameat as usize,
        b"renameat2" => renameat2 as usize,
        b"execve" => execve as usize,
        _ => return None,
    };
    Some(f)
}

#[no_mangle]
pub unsafe extern "C" fn la_symbind64(
    sym: *mut libc::Elf64_Sym,
    _ndx: c_uint,
    _refcook: *mut usize,
    _defcook: *mut usize,
    _flags: *mut c_uint,
    symname: *const c_char,
) -> usize {
    if !symname.is_null() {
        if let Some(f) = replacement(CStr::from_ptr(symname).to_bytes()) {
            return f;
        }
    }
    (*sym).st_value as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_lines() {
        assert_eq!(
            message("a/b", Kind::Read, Some("/repo")),
            "{\"op\":\"access\",\"path\":\"a/b\",\"kind\":\"read\",\"cwd\":\"/repo\"}\n"
        );
        assert_eq!(
            message("/x \"y\"", Kind::Unlink, None),
            "{\"op\":\"access\",\"path\":\"/x \\\"y\\\"\",\"kind\":\"unlink\"}\n"
        );
    }

    #[test]
    fn pseudo_filesystems_are_skipped() {
        assert!(ignored("/proc/self/maps"));
        assert!(ignored(""));
        assert!(!ignored("src/main.c"));
        assert!(!ignored("/repo/dev/x"));
    }

    #[test]
    fn relative_paths_get_a_base() {
        assert_eq!(base_dir(libc::AT_FDCWD, "/abs"), None);
        assert!(base_dir(libc::AT_FDCWD, "rel").is_some());
    }

    #[test]
    fn bound_symbols() {
        assert!(replacement(b"open").is_some());
        assert!(replacement(b"execve").is_some());
        assert!(replacement(b"printf").is_none());
    }
}
