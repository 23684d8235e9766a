//! Spawning job processes, each in its own process group, and taking them
//! down again.

use crate::rules::rule::CmdLine;
use std::collections::BTreeMap;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

pub fn check_posix(func: &str, ret: libc::c_int) -> std::io::Result<()> {
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        return Err(std::io::Error::new(err.kind(), format!("{}: {}", func, err)));
    }
    Ok(())
}

/// The executable that will actually be exec'd for `cmd`.
pub fn program(cmd: &CmdLine) -> PathBuf {
    match cmd {
        CmdLine::Shell(_) => PathBuf::from("/bin/sh"),
        CmdLine::Argv(argv) => argv
            .first()
            .and_then(|p| crate::autodep::ld::resolve_program(p))
            .unwrap_or_default(),
    }
}

/// Build the command for a job.  stdout and stderr are piped, stdin is
/// closed.
pub fn command(cmd: &CmdLine, cwd: &Path, env: &BTreeMap<String, String>) -> anyhow::Result<Command> {
    let mut c = match cmd {
        CmdLine::Shell(text) => {
            let mut c = Command::new("/bin/sh");
            c.arg("-c").arg(text);
            c
        }
        CmdLine::Argv(argv) => {
            let Some((prog, args)) = argv.split_first() else {
                anyhow::bail!("empty command");
            };
            let mut c = Command::new(prog);
            c.args(args);
            c
        }
    };
    c.current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Safety: setpgid is async-signal-safe.
    unsafe {
        c.pre_exec(|| check_posix("setpgid", libc::setpgid(0, 0)));
    }
    Ok(c)
}

pub fn is_alive(pid: u32) -> bool {
    // Safety: signal 0 only checks for existence.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Send `sigs` in turn to the process group led by `pgid`, waiting up to
/// `grace` after each one for the leader to go away.
pub fn kill_group(pgid: u32, sigs: &[i32], grace: Duration) {
    for (i, &sig) in sigs.iter().enumerate() {
        // Safety: plain kill(2) on a process group.
        let ret = unsafe { libc::kill(-(pgid as libc::pid_t), sig) };
        if ret < 0 {
            // The group is gone.
            return;
        }
        tracing::debug!(pgid, sig, "signalled job");
        if i + 1 == sigs.len() {
            return;
        }
        let start = Instant::now();
        while start.elapsed() < grace {
            if !is_alive(pgid) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
