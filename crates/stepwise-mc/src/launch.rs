//! Starting a program under the checker.

use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;

use log::debug;
use nix::sys::ptrace;
use nix::unistd::Pid;
use stepwise_protocol::SOCKET_FD_ENV;

use crate::channel::Channel;
use crate::model_checker::{McError, ModelChecker};
use crate::remote::RemoteSimulation;

/// Spawn `program` traced by us, connected through a fresh socketpair, and
/// run it up to its first stop.
pub fn launch<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<ModelChecker, McError> {
    let (ours, theirs) = Channel::pair()?;
    let child_fd = theirs.as_fd().as_raw_fd();

    let mut command = Command::new(program);
    command.args(args).env(SOCKET_FD_ENV, child_fd.to_string());
    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        command.pre_exec(move || {
            let flags = libc::fcntl(child_fd, libc::F_GETFD);
            if flags < 0 || libc::fcntl(child_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) < 0 {
                return Err(io::Error::last_os_error());
            }
            ptrace::traceme().map_err(io::Error::from)
        });
    }

    let child = command.spawn().map_err(|source| McError::StartFailed {
        program: program.to_owned(),
        source,
    })?;
    drop(theirs);
    let pid = Pid::from_raw(child.id() as i32);
    debug!("launched {program} as {pid}");

    let process = RemoteSimulation::new(pid, ours)?;
    let mut checker = ModelChecker::for_child(process);
    checker.start()?;
    Ok(checker)
}
