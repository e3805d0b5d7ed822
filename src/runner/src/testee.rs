use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, select, tick, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::capture::CaptureBuffer;
use crate::config::Config;
use crate::constants::*;
use crate::mapping::Mapping;
use crate::process;
use crate::protocol::{ControlHeader, Reply};
use crate::signal::ShutdownSignal;

/// `start_time` value while no test is running
const IDLE: i64 = 0;
/// `start_time` value once the hang watcher gave up on the current test
const HUNG: i64 = -1;

/// What became of a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Testee replied. Coverage and the first `sonar_len` sonar bytes are valid.
    Completed(Reply),
    /// Testee died or hung. Call `shutdown()` to collect its output.
    Crashed { hanged: bool },
    /// Infrastructure hiccup. Throw this testee away and try again on a new one.
    Retry,
}

/// Whichever finished first while waiting on a test
enum Race {
    Reply(io::Result<[u8; REPLY_SIZE]>),
    Output(Option<Vec<u8>>),
}

/// One live testee subprocess, its pipes and the threads keeping an eye on it.
pub struct Testee {
    child: Child,
    pid: Pid,
    control: File,
    /// Fed by the reply reader, one entry per request
    replies: Receiver<io::Result<[u8; REPLY_SIZE]>>,
    data_dir: PathBuf,
    /// Nanoseconds since `epoch` when the current test started. See `IDLE` and `HUNG`.
    start_time: Arc<AtomicI64>,
    epoch: Instant,
    execs: u64,
    function: u8,
    config: Arc<Config>,
    /// Single slot: the drainer delivers once and a crashed `test()` may put it back
    output_tx: Sender<Vec<u8>>,
    output_rx: Receiver<Vec<u8>>,
    down_signal: ShutdownSignal,
    down: bool,
    /// A crash was reported and nobody collected it with `shutdown()` yet
    crashed: bool,
    drainer: Option<JoinHandle<CaptureBuffer>>,
    reply_reader: Option<JoinHandle<()>>,
    hang_watcher: Option<JoinHandle<()>>,
    shutdown_watcher: Option<JoinHandle<()>>,
    buffer: Option<CaptureBuffer>,
}

impl Testee {
    /// Start `binary`, wait for it to announce its data dir and start the monitors
    pub fn spawn(
        binary: &Path,
        mapping: &Mapping,
        function: u8,
        config: Arc<Config>,
        shutdown: &ShutdownSignal,
        buffer: CaptureBuffer,
    ) -> Result<Self> {
        use std::os::unix::io::AsRawFd;

        let process::Spawned {
            mut child,
            control,
            reply,
            mut capture,
        } = process::spawn(binary, &config, mapping.as_raw_fd(), shutdown)?;
        let pid = process::child_pid(&child);

        let data_dir = match process::handshake(&mut capture)
            .and_then(|dir| process::set_nonblocking(&capture).map(|_| dir))
        {
            Ok(dir) => dir,
            Err(e) => {
                process::signal(pid, Signal::SIGKILL);
                let _ = child.wait();
                return Err(e.context(format!("Failed to start {}", binary.display())));
            }
        };
        info!("Testee {} started with data dir {}", pid, data_dir.display());

        let start_time = Arc::new(AtomicI64::new(IDLE));
        let epoch = Instant::now();
        let (output_tx, output_rx) = bounded(1);
        let down_signal = ShutdownSignal::new();

        let drainer = {
            let down = down_signal.receiver().clone();
            let output = output_tx.clone();
            thread::Builder::new()
                .name(format!("testee-{}-stdout", pid))
                .spawn(move || drain_output(capture, buffer, down, output))
        };
        let (replies_tx, replies) = bounded(1);
        let reply_reader = {
            let down = down_signal.receiver().clone();
            thread::Builder::new()
                .name(format!("testee-{}-reply", pid))
                .spawn(move || read_replies(reply, down, replies_tx))
        };
        let hang_watcher = {
            let down = down_signal.receiver().clone();
            let start_time = Arc::clone(&start_time);
            let timeout = config.timeout;
            thread::Builder::new()
                .name(format!("testee-{}-hang", pid))
                .spawn(move || watch_hang(pid, start_time, epoch, timeout, down))
        };
        let shutdown_watcher = {
            let down = down_signal.receiver().clone();
            let global = shutdown.receiver().clone();
            thread::Builder::new()
                .name(format!("testee-{}-shutdown", pid))
                .spawn(move || watch_shutdown(pid, down, global))
        };

        let mut testee = Self {
            child,
            pid,
            control,
            replies,
            data_dir,
            start_time,
            epoch,
            execs: 0,
            function,
            config,
            output_tx,
            output_rx,
            down_signal,
            down: false,
            crashed: false,
            drainer: None,
            reply_reader: None,
            hang_watcher: None,
            shutdown_watcher: None,
            buffer: None,
        };

        // From here on, dropping `testee` tears down whatever did start
        testee.drainer = Some(drainer.with_context(|| "Failed to start stdout drainer")?);
        testee.reply_reader =
            Some(reply_reader.with_context(|| "Failed to start reply reader")?);
        testee.hang_watcher = Some(hang_watcher.with_context(|| "Failed to start hang watcher")?);
        testee.shutdown_watcher =
            Some(shutdown_watcher.with_context(|| "Failed to start shutdown watcher")?);

        Ok(testee)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Run `payload` once.
    ///
    /// Panics if the testee is down, if a crash is pending, or if `payload` does not fit the
    /// input region. All of those are bugs in the caller.
    pub fn test(&mut self, mapping: &mut Mapping, payload: &[u8]) -> Status {
        assert!(!self.down, "cannot test: testee is already shut down");
        assert!(
            !self.crashed,
            "cannot test: testee crashed and was not shut down"
        );
        assert!(
            payload.len() <= MAX_INPUT_SIZE,
            "input is too large (length {})",
            payload.len()
        );

        self.execs += 1;
        if self.execs > self.config.exec_limit {
            debug!("Testee {} reached {} execs, recycling", self.pid, self.execs - 1);
            process::signal(self.pid, Signal::SIGKILL);
            return Status::Retry;
        }

        mapping.input_mut()[..payload.len()].copy_from_slice(payload);
        self.start_time
            .store(now_nanos(self.epoch), Ordering::SeqCst);

        let header = ControlHeader {
            function: self.function,
            len: payload.len() as u64,
        };
        if let Err(e) = self.control.write_all(&header.encode()) {
            debug!("Write to testee {} failed: {}", self.pid, e);
            self.start_time.store(IDLE, Ordering::SeqCst);
            return Status::Retry;
        }

        // The test is running now. It is over once either a reply or the crash output shows up.
        let race = select! {
            recv(self.replies) -> reply => {
                Race::Reply(reply.unwrap_or_else(|_| Err(ErrorKind::BrokenPipe.into())))
            }
            recv(self.output_rx) -> output => Race::Output(output.ok()),
        };

        let hanged = self.start_time.swap(IDLE, Ordering::SeqCst) == HUNG;
        let reply = match race {
            Race::Reply(Ok(buf)) if !hanged => Reply::decode(&buf),
            Race::Output(output) => {
                if let Some(output) = output {
                    // Slot is empty again, so this can't block. `shutdown()` picks it up.
                    let _ = self.output_tx.try_send(output);
                }
                self.crashed = true;
                return Status::Crashed { hanged };
            }
            // Either the hang watcher already pulled the plug or the testee died
            Race::Reply(_) => {
                self.crashed = true;
                return Status::Crashed { hanged };
            }
        };

        if reply.sonar_len > SONAR_REGION_SIZE as u64 {
            warn!(
                "Testee {} reported sonar length {} past the region end",
                self.pid, reply.sonar_len
            );
            process::signal(self.pid, Signal::SIGKILL);
            self.crashed = true;
            return Status::Crashed { hanged: false };
        }

        Status::Completed(reply)
    }

    /// Kill the testee, collect its output and clean up after it and its companion.
    ///
    /// Panics if already down.
    pub fn shutdown(&mut self) -> Vec<u8> {
        assert!(!self.down, "cannot shutdown: testee is already shut down");
        self.down = true;
        self.crashed = false;

        // It is probably already dead, but kill it again to be sure
        process::signal(self.pid, Signal::SIGKILL);
        self.down_signal.trigger();

        // The drainer delivers right before it exits, so once joined the output is waiting
        if let Some(drainer) = self.drainer.take() {
            match drainer.join() {
                Ok(buffer) => self.buffer = Some(buffer),
                Err(_) => warn!("Stdout drainer of testee {} panicked", self.pid),
            }
        }
        let mut output = self.output_rx.try_recv().unwrap_or_default();

        // The reply reader sees EOF once the testee is dead
        for watcher in self
            .reply_reader
            .take()
            .into_iter()
            .chain(self.hang_watcher.take())
            .chain(self.shutdown_watcher.take())
        {
            let _ = watcher.join();
        }

        // Only reap after every thread that signals `pid` is gone, so we never hit a reused pid
        match self.child.wait() {
            Ok(status) if !status.success() => {
                output.extend_from_slice(status.to_string().as_bytes())
            }
            Ok(_) => (),
            Err(e) => output.extend_from_slice(e.to_string().as_bytes()),
        }

        self.cleanup_data_dirs();

        output
    }

    /// Get the capture buffer back for the next testee. Only available after `shutdown()`.
    pub fn take_buffer(&mut self) -> Option<CaptureBuffer> {
        self.buffer.take()
    }

    fn cleanup_data_dirs(&self) {
        let companion = &self.config.companion;
        let companion_dir = companion.data_dir(&self.data_dir);

        process::terminate_companion(&companion_dir.join(&companion.pid_file));

        let mut dirs = vec![self.data_dir.as_path()];
        if companion_dir != self.data_dir {
            dirs.push(companion_dir.as_path());
        }

        if self.config.move_logs {
            let dest = self.config.workdir.join("log").join(
                self.data_dir
                    .file_name()
                    .unwrap_or_else(|| self.data_dir.as_os_str()),
            );
            if let Err(e) = move_logs(&dirs, &dest) {
                warn!("Failed to move logs to {}: {:#}", dest.display(), e);
            }
        }

        if self.config.remove_data_dirs {
            for dir in &dirs {
                if let Err(e) = fs::remove_dir_all(dir) {
                    debug!("Failed to remove {}: {}", dir.display(), e);
                }
            }
        }
    }
}

impl Drop for Testee {
    fn drop(&mut self) {
        if !self.down {
            let _ = self.shutdown();
        }
    }
}

fn now_nanos(epoch: Instant) -> i64 {
    // +1 so that a test started right at `epoch` is not mistaken for IDLE
    epoch.elapsed().as_nanos() as i64 + 1
}

/// Copy `*.log` files out of `dirs` into `dest`
fn move_logs(dirs: &[&Path], dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;

    for dir in dirs {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => continue,
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "log") {
                if let Some(name) = path.file_name() {
                    let target = dest.join(name);
                    fs::copy(&path, &target)
                        .with_context(|| format!("Failed to copy {}", path.display()))?;
                    File::open(&target)?.sync_all()?;
                }
            }
        }
    }

    Ok(())
}

/// Keep the stdout pipe from filling up (which would wedge the testee) and collect crash output.
///
/// Delivers exactly once, when the pipe closes or the testee goes down.
fn drain_output(
    mut pipe: File,
    mut buffer: CaptureBuffer,
    down: Receiver<()>,
    output: Sender<Vec<u8>>,
) -> CaptureBuffer {
    let ticker = tick(DRAIN_INTERVAL);

    loop {
        let closing = select! {
            recv(ticker) -> _ => false,
            recv(down) -> _ => true,
        };

        let open = match buffer.fill_from(&mut pipe) {
            Ok(open) => open,
            Err(e) => {
                debug!("Reading testee output failed: {}", e);
                false
            }
        };

        if closing || !open {
            break;
        }
    }

    let _ = output.send(buffer.take());
    buffer
}

/// Forward every reply of the testee. A failed read is forwarded too and ends the thread.
fn read_replies(
    mut pipe: File,
    down: Receiver<()>,
    replies: Sender<io::Result<[u8; REPLY_SIZE]>>,
) {
    loop {
        let mut buf = [0u8; REPLY_SIZE];
        let reply = pipe.read_exact(&mut buf).map(|_| buf);
        let failed = reply.is_err();

        // Nobody is waiting on a reply once the testee is down
        select! {
            send(replies, reply) -> _ => (),
            recv(down) -> _ => return,
        }
        if failed {
            return;
        }
    }
}

/// Abort the testee once the current test has been running longer than `timeout`
fn watch_hang(
    pid: Pid,
    start_time: Arc<AtomicI64>,
    epoch: Instant,
    timeout: Duration,
    down: Receiver<()>,
) {
    let ticker = tick(timeout / 2);
    let limit = timeout.as_nanos() as i64;

    loop {
        select! {
            recv(ticker) -> _ => {
                let start = start_time.load(Ordering::SeqCst);
                if start <= IDLE || now_nanos(epoch) - start <= limit {
                    continue;
                }
                // Lost the race against a reply, the test finished after all
                if start_time
                    .compare_exchange(start, HUNG, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    continue;
                }

                warn!("Testee {} hung for more than {:?}, aborting", pid, timeout);
                process::signal(pid, Signal::SIGABRT);
                if let Err(RecvTimeoutError::Timeout) = down.recv_timeout(ABORT_GRACE) {
                    process::signal(pid, Signal::SIGKILL);
                }
                return;
            }
            recv(down) -> _ => return,
        }
    }
}

/// Make sure a session-wide shutdown takes the testee with it
fn watch_shutdown(pid: Pid, down: Receiver<()>, global: Receiver<()>) {
    select! {
        recv(down) -> _ => (),
        recv(global) -> _ => {
            debug!("Global shutdown, killing testee {}", pid);
            process::signal(pid, Signal::SIGKILL);
        }
    }
}

#[test]
fn test_move_logs() {
    let src = tempfile::tempdir().expect("failed to create temporary dir");
    let other = tempfile::tempdir().expect("failed to create temporary dir");
    let dest = tempfile::tempdir().expect("failed to create temporary dir");

    fs::write(src.path().join("tidb.log"), "tidb").unwrap();
    fs::write(src.path().join("data.db"), "not a log").unwrap();
    fs::write(other.path().join("mysql.log"), "mysql").unwrap();

    let target = dest.path().join("log").join("session");
    let missing = Path::new("/nonexistent/sqlfuzz");
    move_logs(&[src.path(), other.path(), missing], &target).expect("failed to move logs");

    assert_eq!(fs::read_to_string(target.join("tidb.log")).unwrap(), "tidb");
    assert_eq!(fs::read_to_string(target.join("mysql.log")).unwrap(), "mysql");
    assert!(!target.join("data.db").exists());
}

#[test]
fn test_hang_watcher_ignores_idle_and_stops_on_down() {
    let down = ShutdownSignal::new();
    let start_time = Arc::new(AtomicI64::new(IDLE));
    // Nobody owns this pid; the watcher must not signal anything while idle anyway
    let pid = Pid::from_raw(i32::MAX);

    let watcher = {
        let down = down.receiver().clone();
        let start_time = Arc::clone(&start_time);
        thread::spawn(move || {
            watch_hang(pid, start_time, Instant::now(), Duration::from_millis(20), down)
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert_eq!(start_time.load(Ordering::SeqCst), IDLE);
    down.trigger();
    watcher.join().unwrap();
}

#[test]
fn test_hang_watcher_flags_overdue_test() {
    let down = ShutdownSignal::new();
    let start_time = Arc::new(AtomicI64::new(1));
    let pid = Pid::from_raw(i32::MAX);

    let watcher = {
        let down = down.receiver().clone();
        let start_time = Arc::clone(&start_time);
        thread::spawn(move || {
            watch_hang(pid, start_time, Instant::now(), Duration::from_millis(20), down)
        })
    };

    // Give it time to notice, then cut the abort grace period short
    thread::sleep(Duration::from_millis(200));
    down.trigger();
    watcher.join().unwrap();
    assert_eq!(start_time.load(Ordering::SeqCst), HUNG);
}
