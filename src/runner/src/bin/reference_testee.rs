//! Testee side of the protocol, used to exercise the runner.
//!
//! Announces its data dir, then serves requests until the control pipe closes. A few statements
//! make it misbehave on purpose:
//!
//! * `crash`: print a panic message and exit 2
//! * `hang`: never reply
//! * `noise:N`: write N bytes to stdout before replying
//! * `sonar:N`: report N sonar bytes
//! * `sonar-overflow`: report more sonar bytes than the region holds
//! * `count`: reply with the number of statements this process has served
//!
//! Anything else replies with result 0.

use std::collections::hash_map::DefaultHasher;
use std::env;
use std::fs::{self, File};
use std::hash::Hasher;
use std::io::{self, Read, Write};
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::process::{self, exit};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use sqlfuzz_runner::constants::*;
use sqlfuzz_runner::mapping::Mapping;
use sqlfuzz_runner::protocol::{ControlHeader, Reply};

/// Where to create the data dir. Defaults to `$TMPDIR/tidb-fuzz-<pid>`.
const DATA_DIR_VAR: &str = "SQLFUZZ_DATA_DIR";

fn data_dir() -> PathBuf {
    match env::var_os(DATA_DIR_VAR) {
        Some(dir) => PathBuf::from(dir),
        None => env::temp_dir().join(format!("tidb-fuzz-{}", process::id())),
    }
}

fn run(statement: &str, served: u64, mapping: &mut Mapping) -> Result<Reply> {
    let mut reply = Reply::default();

    let (verb, arg) = match statement.find(':') {
        Some(i) => (&statement[..i], statement[i + 1..].trim().parse::<usize>().ok()),
        None => (statement, None),
    };

    match (verb, arg) {
        ("crash", _) => {
            println!("panic: runtime error: simulated crash on {:?}", statement);
            exit(2);
        }
        ("hang", _) => loop {
            thread::sleep(Duration::from_secs(60));
        },
        ("noise", Some(n)) => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle.write_all(&vec![b'x'; n])?;
            handle.flush()?;
        }
        ("sonar", Some(n)) => {
            let n = n.min(SONAR_REGION_SIZE);
            mapping.sonar_mut()[..n].iter_mut().for_each(|b| *b = 0xab);
            reply.sonar_len = n as u64;
        }
        ("sonar-overflow", _) => reply.sonar_len = SONAR_REGION_SIZE as u64 + 1,
        ("count", _) => reply.result = served,
        _ => (),
    }

    Ok(reply)
}

fn _main() -> Result<()> {
    let dir = data_dir();
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    // stdout is line buffered, so this goes out on its own
    println!("{}", dir.display());

    let mut mapping = unsafe { Mapping::inherit(COMM_FD)? };
    let mut control = unsafe { File::from_raw_fd(CONTROL_FD) };
    let mut replies = unsafe { File::from_raw_fd(REPLY_FD) };

    let mut served = 0;
    loop {
        let mut raw = [0u8; CONTROL_HEADER_SIZE];
        if control.read_exact(&mut raw).is_err() {
            // Runner went away
            return Ok(());
        }
        let header = ControlHeader::decode(&raw);
        let started = Instant::now();
        served += 1;

        let payload = mapping.input()[..header.len as usize].to_vec();
        let statement = String::from_utf8_lossy(&payload);

        let mut hasher = DefaultHasher::new();
        hasher.write_u8(header.function);
        hasher.write(&payload);
        let edge = hasher.finish() as usize % COVER_SIZE;
        let cover = mapping.coverage_mut();
        cover[edge] = cover[edge].saturating_add(1);

        let mut reply = run(statement.trim(), served, &mut mapping)?;
        reply.elapsed_ns = started.elapsed().as_nanos() as u64;
        replies.write_all(&reply.encode())?;
    }
}

fn main() {
    match _main() {
        Ok(_) => exit(0),
        Err(e) => {
            eprintln!("reference testee failed: {:#}", e);
            exit(1);
        }
    }
}
