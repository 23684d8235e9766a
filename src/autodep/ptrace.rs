//! Observing accesses by stopping the job at every syscall (x86_64 Linux).
//!
//! The job's first process asks to be traced before exec; its children are
//! traced automatically.  The tracing thread must be the one that spawned
//! the job, since tracees are that thread's children.

use super::protocol::Reply;
use super::{AccessKind, Link, Method, Recorder, Tracker};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::Mutex;

const PATH_MAX: usize = 4096;

#[derive(Default)]
pub struct PtraceTracker;

/// A path argument of a syscall: (dirfd, pointer), dirfd None for cwd.
#[derive(Debug, Clone, Copy)]
struct PathArg {
    dirfd: Option<i32>,
    ptr: u64,
}

fn at(dirfd: u64, ptr: u64) -> PathArg {
    let fd = dirfd as i32;
    PathArg {
        dirfd: (fd != libc::AT_FDCWD).then_some(fd),
        ptr,
    }
}

fn cwd(ptr: u64) -> PathArg {
    PathArg { dirfd: None, ptr }
}

fn open_kind(flags: u64) -> &'static [AccessKind] {
    let flags = flags as i32;
    match flags & libc::O_ACCMODE {
        libc::O_RDONLY => &[AccessKind::Read],
        // Updated in place: the old content matters.
        libc::O_RDWR if flags & libc::O_TRUNC == 0 => &[AccessKind::Read, AccessKind::Write],
        _ => &[AccessKind::Write],
    }
}

/// Decode the accesses a syscall is about to make.
fn decode(nr: i64, a: [u64; 5]) -> Vec<(PathArg, AccessKind)> {
    use AccessKind::*;
    let many = |arg: PathArg, kinds: &[AccessKind]| -> Vec<(PathArg, AccessKind)> {
        kinds.iter().map(|k| (arg, *k)).collect()
    };
    match nr {
        libc::SYS_open => many(cwd(a[0]), open_kind(a[1])),
        libc::SYS_openat => many(at(a[0], a[1]), open_kind(a[2])),
        libc::SYS_creat => vec![(cwd(a[0]), Write)],
        libc::SYS_stat | libc::SYS_lstat | libc::SYS_access => vec![(cwd(a[0]), Stat)],
        libc::SYS_newfstatat | libc::SYS_faccessat | libc::SYS_faccessat2 | libc::SYS_statx => {
            vec![(at(a[0], a[1]), Stat)]
        }
        libc::SYS_readlink | libc::SYS_execve => vec![(cwd(a[0]), Read)],
        libc::SYS_readlinkat | libc::SYS_execveat => vec![(at(a[0], a[1]), Read)],
        libc::SYS_unlink => vec![(cwd(a[0]), Unlink)],
        libc::SYS_unlinkat if a[2] as i32 & libc::AT_REMOVEDIR == 0 => {
            vec![(at(a[0], a[1]), Unlink)]
        }
        libc::SYS_rename => vec![(cwd(a[0]), Read), (cwd(a[0]), Unlink), (cwd(a[1]), Write)],
        libc::SYS_renameat | libc::SYS_renameat2 => vec![
            (at(a[0], a[1]), Read),
            (at(a[0], a[1]), Unlink),
            (at(a[2], a[3]), Write),
        ],
        libc::SYS_link => vec![(cwd(a[0]), Read), (cwd(a[1]), Write)],
        libc::SYS_linkat => vec![(at(a[0], a[1]), Read), (at(a[2], a[3]), Write)],
        libc::SYS_symlink => vec![(cwd(a[1]), Write)],
        libc::SYS_symlinkat => vec![(at(a[1], a[2]), Write)],
        _ => Vec::new(),
    }
}

/// Read a NUL-terminated string from the tracee, a page at a time so a
/// read never crosses into an unmapped page.
fn read_str(pid: libc::pid_t, mut addr: u64) -> Option<Vec<u8>> {
    if addr == 0 {
        return None;
    }
    let mut out = Vec::new();
    while out.len() < PATH_MAX {
        let chunk = 4096 - (addr % 4096) as usize;
        let mut buf = vec![0u8; chunk];
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: chunk,
        };
        let remote = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: chunk,
        };
        // Safety: local points at `chunk` writable bytes we own.
        let n = unsafe { libc::process_vm_readv(pid, &local, 1, &remote, 1, 0) };
        if n <= 0 {
            return None;
        }
        buf.truncate(n as usize);
        if let Some(nul) = buf.iter().position(|&b| b == 0) {
            out.extend_from_slice(&buf[..nul]);
            return Some(out);
        }
        out.extend_from_slice(&buf);
        addr += n as u64;
    }
    None
}

/// The directory a relative path of `pid` is resolved against.
fn base_dir(pid: libc::pid_t, dirfd: Option<i32>) -> Option<PathBuf> {
    let link = match dirfd {
        None => format!("/proc/{}/cwd", pid),
        Some(fd) => format!("/proc/{}/fd/{}", pid, fd),
    };
    std::fs::read_link(link).ok()
}

fn ptrace(req: libc::c_uint, pid: libc::pid_t, data: usize) -> libc::c_long {
    // Safety: requests used here take no pointer in `addr`.
    unsafe {
        libc::ptrace(
            req,
            pid,
            std::ptr::null_mut::<libc::c_void>(),
            data as *mut libc::c_void,
        )
    }
}

fn regs(pid: libc::pid_t) -> Option<libc::user_regs_struct> {
    // Safety: GETREGS fills the struct we pass.
    unsafe {
        let mut regs: libc::user_regs_struct = std::mem::zeroed();
        let r = libc::ptrace(
            libc::PTRACE_GETREGS,
            pid,
            std::ptr::null_mut::<libc::c_void>(),
            &mut regs as *mut _ as *mut libc::c_void,
        );
        (r >= 0).then_some(regs)
    }
}

struct Tracer<'a> {
    recorder: &'a Mutex<Recorder>,
    link: &'a dyn Link,
    /// Tracees between syscall entry and exit.
    in_syscall: rustc_hash::FxHashSet<libc::pid_t>,
}

impl Tracer<'_> {
    fn on_syscall_entry(&mut self, pid: libc::pid_t) {
        let Some(r) = regs(pid) else {
            return;
        };
        let accesses = decode(r.orig_rax as i64, [r.rdi, r.rsi, r.rdx, r.r10, r.r8]);
        for (arg, kind) in accesses {
            let Some(bytes) = read_str(pid, arg.ptr) else {
                continue;
            };
            if bytes.is_empty() {
                continue;
            }
            let path = Path::new(OsStr::from_bytes(&bytes));
            let base = if path.is_absolute() {
                None
            } else {
                base_dir(pid, arg.dirfd)
            };
            let dep = self
                .recorder
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record(base.as_deref(), path, kind);
            if let Some(dep) = dep {
                // The tracee stays stopped until the dep is resolved.
                if let Reply::Error { msg } =
                    self.link.request(super::protocol::EngineRequest::Deps(vec![dep]))
                {
                    tracing::debug!(pid, %msg, "dep in error");
                }
            }
        }
    }

    fn run(&mut self, root: libc::pid_t) -> std::io::Result<i32> {
        let mut root_status = None;
        loop {
            let mut status = 0;
            // Safety: plain waitpid.  __WNOTHREAD keeps us off other jobs'
            // children.
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::__WALL | libc::__WNOTHREAD) };
            if pid < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::ECHILD) => break,
                    _ => return Err(err),
                }
            }
            if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
                self.in_syscall.remove(&pid);
                if pid == root {
                    root_status = Some(status);
                }
                continue;
            }
            if !libc::WIFSTOPPED(status) {
                continue;
            }
            let sig = libc::WSTOPSIG(status);
            let event = (status >> 16) & 0xff;
            let mut deliver = 0;
            if sig == (libc::SIGTRAP | 0x80) {
                if self.in_syscall.remove(&pid) {
                    // Exit of the syscall; nothing to do.
                } else {
                    self.in_syscall.insert(pid);
                    self.on_syscall_entry(pid);
                }
            } else if event != 0 {
                // fork/clone/exec notifications.
            } else if sig == libc::SIGTRAP && pid == root && root_status.is_none() {
                // The stop after the initial exec.
                let opts = libc::PTRACE_O_TRACESYSGOOD
                    | libc::PTRACE_O_TRACEFORK
                    | libc::PTRACE_O_TRACEVFORK
                    | libc::PTRACE_O_TRACECLONE
                    | libc::PTRACE_O_TRACEEXEC
                    | libc::PTRACE_O_EXITKILL;
                ptrace(libc::PTRACE_SETOPTIONS, pid, opts as usize);
            } else if sig == libc::SIGSTOP {
                // New tracees start stopped.
            } else {
                deliver = sig as usize;
            }
            ptrace(libc::PTRACE_SYSCALL, pid, deliver);
        }
        root_status.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "lost track of job"))
    }
}

impl Tracker for PtraceTracker {
    fn method(&self) -> Method {
        Method::Ptrace
    }

    fn prepare(&mut self, cmd: &mut Command) -> anyhow::Result<()> {
        // Safety: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                let r = libc::ptrace(
                    libc::PTRACE_TRACEME,
                    0,
                    std::ptr::null_mut::<libc::c_void>(),
                    std::ptr::null_mut::<libc::c_void>(),
                );
                if r < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        Ok(())
    }

    fn wait(
        &mut self,
        child: &mut Child,
        recorder: &Mutex<Recorder>,
        link: &dyn Link,
    ) -> anyhow::Result<ExitStatus> {
        let mut tracer = Tracer {
            recorder,
            link,
            in_syscall: Default::default(),
        };
        let status = tracer.run(child.id() as libc::pid_t)?;
        Ok(ExitStatus::from_raw(status))
    }
}
