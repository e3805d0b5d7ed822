use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{pipe2, Pid};

use crate::config::Config;
use crate::constants::*;
use crate::signal::ShutdownSignal;

/// A freshly started testee and our ends of its pipes
pub struct Spawned {
    pub child: Child,
    /// Requests go here
    pub control: File,
    /// Replies come from here
    pub reply: File,
    /// Merged stdout + stderr
    pub capture: File,
}

/// Start `binary` with the comm file and pipes installed at their well known descriptors.
///
/// Failing to start the binary is treated as transient ("cannot allocate memory", "text file
/// busy", ...) and retried forever, unless a global shutdown is in progress.
pub fn spawn(
    binary: &Path,
    config: &Config,
    comm_fd: RawFd,
    shutdown: &ShutdownSignal,
) -> Result<Spawned> {
    loop {
        let (control_r, control_w) =
            pipe2(OFlag::O_CLOEXEC).with_context(|| "Failed to create control pipe".to_string())?;
        let (reply_r, reply_w) =
            pipe2(OFlag::O_CLOEXEC).with_context(|| "Failed to create reply pipe".to_string())?;
        let (capture_r, capture_w) =
            pipe2(OFlag::O_CLOEXEC).with_context(|| "Failed to create stdout pipe".to_string())?;

        let mut cmd = Command::new(binary);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(
                capture_w
                    .try_clone()
                    .with_context(|| "Failed to dup stdout pipe".to_string())?,
            ))
            .stderr(Stdio::from(capture_w))
            .env(TRACEBACK_VAR, "1")
            .env(VERBOSE_VAR, config.verbosity.to_string())
            .envs(config.env.iter().map(|(k, v)| (k, v)));

        let fds = [comm_fd, control_r.as_raw_fd(), reply_w.as_raw_fd()];
        unsafe {
            cmd.pre_exec(move || install_fds(&fds));
        }

        match cmd.spawn() {
            Ok(child) => {
                // `cmd` holds the child's copies of the capture pipe. Drop those together with
                // `control_r` and `reply_w` so EOF shows up on our ends once the child dies.
                drop(cmd);
                drop(control_r);
                drop(reply_w);

                return Ok(Spawned {
                    child,
                    control: File::from(control_w),
                    reply: File::from(reply_r),
                    capture: File::from(capture_r),
                });
            }
            Err(e) => {
                warn!("Failed to start test binary {}: {}", binary.display(), e);
                if shutdown.is_triggered() {
                    bail!("Shutdown requested while starting {}", binary.display());
                }
                thread::sleep(SPAWN_RETRY_DELAY);
            }
        }
    }
}

/// Runs in the child between fork and exec: move comm file and pipe ends to fds 3, 4, 5.
///
/// Sources are first parked above the target range so a source already sitting on 3..=5
/// can't be clobbered by an earlier `dup2`. Only async-signal-safe calls allowed here.
fn install_fds(fds: &[RawFd; 3]) -> io::Result<()> {
    const PARKING_FD: RawFd = 64;

    let mut parked = [0; 3];
    for (slot, &fd) in parked.iter_mut().zip(fds.iter()) {
        *slot = cvt(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, PARKING_FD) })?;
    }
    for (target, &fd) in (COMM_FD..).zip(parked.iter()) {
        // dup2 clears FD_CLOEXEC on the target
        cvt(unsafe { libc::dup2(fd, target) })?;
    }

    Ok(())
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Read the data dir the testee announces on startup.
///
/// Anything other than a single line naming an existing directory means the testee (or the
/// environment) is broken. That is not a fuzzing finding, so it is an error.
pub fn handshake(capture: &mut File) -> Result<PathBuf> {
    let mut raw = [0u8; INIT_OUTPUT_LIMIT];
    let n = capture
        .read(&mut raw)
        .with_context(|| "Failed to read init output from testee".to_string())?;
    let init_out = String::from_utf8_lossy(&raw[..n]);

    if n == INIT_OUTPUT_LIMIT {
        bail!("Init output (length {}) too long:\n{}", n, init_out);
    }

    let data_dir = PathBuf::from(init_out.trim());
    if data_dir.as_os_str().is_empty() || !data_dir.is_dir() {
        bail!("Testee init failed:\n{}", init_out);
    }

    Ok(data_dir)
}

/// Switch our end of the capture pipe to non-blocking so the drainer never parks in read(2)
pub fn set_nonblocking(file: &File) -> Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(file.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(
        file.as_raw_fd(),
        FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
    )?;

    Ok(())
}

/// Best effort. Signalling a process that is already gone is fine.
pub fn signal(pid: Pid, sig: Signal) {
    match kill(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => (),
        Err(e) => debug!("Failed to send {:?} to {}: {}", sig, pid, e),
    }
}

/// SIGTERM the reference engine whose PID is recorded in `pid_file`, if any
pub fn terminate_companion(pid_file: &Path) {
    let contents = match fs::read_to_string(pid_file) {
        Ok(c) => c,
        Err(_) => return,
    };

    match contents.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => {
            info!("Terminating companion process {}", pid);
            signal(Pid::from_raw(pid), Signal::SIGTERM);
        }
        _ => debug!(
            "Ignoring malformed pid file {}: {:?}",
            pid_file.display(),
            contents
        ),
    }
}

pub fn child_pid(child: &Child) -> Pid {
    Pid::from_raw(child.id() as i32)
}

/// Owned pipe ends, only used by tests below
#[cfg(test)]
fn pipe() -> (std::os::unix::io::OwnedFd, std::os::unix::io::OwnedFd) {
    pipe2(OFlag::O_CLOEXEC).expect("failed to create pipe")
}

#[test]
fn test_handshake_reads_data_dir() {
    use std::io::Write;

    let dir = tempfile::tempdir().expect("failed to create temporary dir");
    let (r, w) = pipe();
    let mut w = File::from(w);
    writeln!(w, "{}", dir.path().display()).unwrap();

    let data_dir = handshake(&mut File::from(r)).expect("handshake failed");
    assert_eq!(data_dir, dir.path());
}

#[test]
fn test_handshake_rejects_bad_output() {
    use std::io::Write;

    // Directory does not exist
    let (r, w) = pipe();
    File::from(w)
        .write_all(b"/nonexistent/sqlfuzz/dir\n")
        .unwrap();
    assert!(handshake(&mut File::from(r)).is_err());

    // Nothing at all
    let (r, w) = pipe();
    drop(w);
    assert!(handshake(&mut File::from(r)).is_err());

    // Too long
    let (r, w) = pipe();
    File::from(w)
        .write_all(&[b'a'; INIT_OUTPUT_LIMIT + 10])
        .unwrap();
    assert!(handshake(&mut File::from(r)).is_err());
}

#[test]
fn test_signal_dead_process_is_harmless() {
    let mut child = Command::new("true").spawn().expect("failed to spawn true");
    let pid = child_pid(&child);
    child.wait().unwrap();

    // Reaped, so the pid is gone (ESRCH)
    signal(pid, Signal::SIGKILL);
    signal(pid, Signal::SIGKILL);
}

#[test]
fn test_terminate_companion() {
    use std::os::unix::process::ExitStatusExt;

    let dir = tempfile::tempdir().expect("failed to create temporary dir");
    let mut sleeper = Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("failed to spawn sleep");

    let pid_file = dir.path().join("mysql.pid");
    fs::write(&pid_file, format!("{}\n", sleeper.id())).unwrap();
    terminate_companion(&pid_file);

    let status = sleeper.wait().unwrap();
    assert_eq!(status.signal(), Some(libc::SIGTERM));

    // Missing and garbage pid files are ignored
    terminate_companion(&dir.path().join("missing.pid"));
    fs::write(&pid_file, "not a pid").unwrap();
    terminate_companion(&pid_file);
}
