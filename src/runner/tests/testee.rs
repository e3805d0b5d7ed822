use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use tempfile::tempdir;

use sqlfuzz_runner::capture::CaptureBuffer;
use sqlfuzz_runner::constants::MAX_INPUT_SIZE;
use sqlfuzz_runner::mapping::Mapping;
use sqlfuzz_runner::testee::{Status, Testee};
use sqlfuzz_runner::{Config, Outcome, ShutdownSignal, TestBinary, TestCase};

fn reference_testee() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_reference-testee"))
}

/// Config pointing the reference testee at `data_dir`
fn config_for(data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.env.push((
        OsString::from("SQLFUZZ_DATA_DIR"),
        data_dir.as_os_str().to_owned(),
    ));
    config
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("failed to write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .expect("failed to chmod script");
    path
}

fn case(ddl: &[&str], dml: &str) -> TestCase {
    TestCase {
        ddl: ddl.iter().map(|s| s.to_string()).collect(),
        dml: dml.to_string(),
    }
}

fn spawn_reference(mapping: &Mapping, config: Config, shutdown: &ShutdownSignal) -> Testee {
    Testee::spawn(
        &reference_testee(),
        mapping,
        0,
        Arc::new(config),
        shutdown,
        CaptureBuffer::new(),
    )
    .expect("failed to spawn reference testee")
}

#[test]
fn test_handshake_with_plain_script() {
    let dir = tempdir().expect("failed to create temporary dir");
    let data_dir = dir.path().join("data1");
    fs::create_dir(&data_dir).unwrap();
    let script = write_script(
        dir.path(),
        "announce.sh",
        &format!("echo {}\nexec sleep 30", data_dir.display()),
    );

    let mapping = Mapping::create().unwrap();
    let mut testee = Testee::spawn(
        &script,
        &mapping,
        0,
        Arc::new(Config::default()),
        &ShutdownSignal::new(),
        CaptureBuffer::new(),
    )
    .expect("handshake failed");

    assert_eq!(testee.data_dir(), data_dir.as_path());
    testee.shutdown();
}

#[test]
fn test_bad_handshake_is_fatal() {
    let dir = tempdir().expect("failed to create temporary dir");

    let script = write_script(dir.path(), "missing.sh", "echo /nonexistent/sqlfuzz/data\nexec sleep 30");
    let mut binary = TestBinary::new(&script, 0, Config::default(), ShutdownSignal::new()).unwrap();
    assert!(binary.test(&case(&[], "SELECT 1")).is_err());

    let script = write_script(dir.path(), "silent.sh", "exit 0");
    let mut binary = TestBinary::new(&script, 0, Config::default(), ShutdownSignal::new()).unwrap();
    assert!(binary.test(&case(&[], "SELECT 1")).is_err());
}

#[test]
fn test_normal_reply() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut binary = TestBinary::new(
        reference_testee(),
        0,
        config_for(dir.path()),
        ShutdownSignal::new(),
    )
    .unwrap();

    match binary
        .test(&case(&["CREATE TABLE t (a INT)"], "SELECT * FROM t"))
        .unwrap()
    {
        Outcome::Finished {
            result,
            coverage,
            sonar,
            ..
        } => {
            assert_eq!(result, 0);
            assert!(coverage.iter().any(|&b| b != 0));
            assert!(sonar.is_empty());
        }
        Outcome::Crashed { output, .. } => {
            panic!("unexpected crash: {}", String::from_utf8_lossy(&output))
        }
    }

    match binary.test(&case(&["CREATE TABLE t (a INT)"], "sonar:16")).unwrap() {
        Outcome::Finished { sonar, .. } => {
            assert_eq!(sonar.len(), 16);
            assert!(sonar.iter().all(|&b| b == 0xab));
        }
        Outcome::Crashed { .. } => panic!("unexpected crash"),
    }
}

#[test]
fn test_ddl_replayed_once_per_testee() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut binary = TestBinary::new(
        reference_testee(),
        0,
        config_for(dir.path()),
        ShutdownSignal::new(),
    )
    .unwrap();
    let case = case(&["CREATE TABLE t (a INT)", "INSERT INTO t VALUES (1)"], "count");

    // 2 ddl + 1 dml on a fresh testee, then just the dml
    for expected in 3..6 {
        match binary.test(&case).unwrap() {
            Outcome::Finished { result, .. } => assert_eq!(result, expected),
            Outcome::Crashed { .. } => panic!("unexpected crash"),
        }
    }
    assert_eq!(binary.stats().restarts, 1);
    assert_eq!(binary.stats().execs, 3);
}

#[test]
fn test_crash_then_restart() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut binary = TestBinary::new(
        reference_testee(),
        0,
        config_for(dir.path()),
        ShutdownSignal::new(),
    )
    .unwrap();

    match binary.test(&case(&["CREATE TABLE t (a INT)"], "crash")).unwrap() {
        Outcome::Crashed { output, hanged } => {
            assert!(!hanged);
            assert!(output.starts_with(b"panic: runtime error: simulated crash"));
        }
        Outcome::Finished { .. } => panic!("crash went unnoticed"),
    }

    // Next case transparently gets a fresh testee with the ddl replayed
    match binary.test(&case(&["CREATE TABLE t (a INT)"], "count")).unwrap() {
        Outcome::Finished { result, .. } => assert_eq!(result, 2),
        Outcome::Crashed { .. } => panic!("unexpected crash"),
    }
    assert_eq!(binary.stats().restarts, 2);
}

#[test]
fn test_hang_is_reported_with_banner() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut config = config_for(dir.path());
    config.timeout = Duration::from_secs(1);
    let mut binary = TestBinary::new(reference_testee(), 0, config, ShutdownSignal::new()).unwrap();

    match binary.test(&case(&[], "hang")).unwrap() {
        Outcome::Crashed { output, hanged } => {
            assert!(hanged);
            assert!(output.starts_with(b"program hanged (timeout 1 seconds)\n\n"));
        }
        Outcome::Finished { .. } => panic!("hang went unnoticed"),
    }
}

#[test]
fn test_hung_testee_is_killed() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut config = config_for(dir.path());
    config.timeout = Duration::from_secs(1);
    let mut mapping = Mapping::create().unwrap();
    let mut testee = spawn_reference(&mapping, config, &ShutdownSignal::new());
    let pid = testee.pid();

    assert_eq!(
        testee.test(&mut mapping, b"hang"),
        Status::Crashed { hanged: true }
    );
    testee.shutdown();

    // Reaped, nothing left to signal
    assert_eq!(kill(pid, None), Err(Errno::ESRCH));
}

#[test]
fn test_sub_second_timeout_is_rejected() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut config = config_for(dir.path());
    config.timeout = Duration::from_millis(500);

    assert!(TestBinary::new(reference_testee(), 0, config, ShutdownSignal::new()).is_err());
}

#[test]
fn test_closed_control_pipe_is_retried() {
    let dir = tempdir().expect("failed to create temporary dir");
    let data_dir = dir.path().join("data1");
    fs::create_dir(&data_dir).unwrap();
    // Close the control pipe before announcing, so the request write is sure to fail
    let script = write_script(
        dir.path(),
        "deaf.sh",
        &format!("exec 4<&-\necho {}\nexec sleep 30", data_dir.display()),
    );

    let mut mapping = Mapping::create().unwrap();
    let mut testee = Testee::spawn(
        &script,
        &mapping,
        0,
        Arc::new(Config::default()),
        &ShutdownSignal::new(),
        CaptureBuffer::new(),
    )
    .expect("handshake failed");

    assert_eq!(testee.test(&mut mapping, b"SELECT 1"), Status::Retry);
    testee.shutdown();
}

#[test]
fn test_sonar_overflow_is_a_crash() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut mapping = Mapping::create().unwrap();
    let mut testee = spawn_reference(&mapping, config_for(dir.path()), &ShutdownSignal::new());

    assert_eq!(
        testee.test(&mut mapping, b"sonar-overflow"),
        Status::Crashed { hanged: false }
    );
    testee.shutdown();
}

#[test]
fn test_replies_stay_in_step_across_requests() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut mapping = Mapping::create().unwrap();
    let mut testee = spawn_reference(&mapping, config_for(dir.path()), &ShutdownSignal::new());

    for served in 1..=500 {
        match testee.test(&mut mapping, b"count") {
            Status::Completed(reply) => assert_eq!(reply.result, served),
            status => panic!("request {} failed: {:?}", served, status),
        }
    }
    testee.shutdown();
}

#[test]
fn test_exec_limit_recycles_testee() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut config = config_for(dir.path());
    config.exec_limit = 3;
    let mut binary = TestBinary::new(reference_testee(), 0, config, ShutdownSignal::new()).unwrap();
    let case = case(&["CREATE TABLE t (a INT)"], "count");

    // 4th exec on the first testee trips the limit, the retry runs on a new one
    let results: Vec<u64> = (0..3)
        .map(|_| match binary.test(&case).unwrap() {
            Outcome::Finished { result, .. } => result,
            Outcome::Crashed { .. } => panic!("unexpected crash"),
        })
        .collect();

    assert_eq!(results, vec![2, 3, 2]);
    assert_eq!(binary.stats().restarts, 2);
}

#[test]
fn test_exec_limit_sends_nothing() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut config = config_for(dir.path());
    config.exec_limit = 1;
    let mut mapping = Mapping::create().unwrap();
    let mut testee = spawn_reference(&mapping, config, &ShutdownSignal::new());

    assert!(matches!(
        testee.test(&mut mapping, b"SELECT 1"),
        Status::Completed(_)
    ));

    // Payload must not even reach the input region
    assert_eq!(testee.test(&mut mapping, b"XXXXXXXX"), Status::Retry);
    assert_eq!(&mapping.input()[..8], b"SELECT 1");
    testee.shutdown();
}

#[test]
fn test_crash_on_ddl_is_fatal() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut binary = TestBinary::new(
        reference_testee(),
        0,
        config_for(dir.path()),
        ShutdownSignal::new(),
    )
    .unwrap();

    let err = binary
        .test(&case(&["CREATE TABLE t (a INT)", "crash"], "SELECT 1"))
        .expect_err("crash on ddl must be fatal");
    assert!(err.to_string().contains("crashed on ddl"));
}

#[test]
fn test_chatty_testee_does_not_deadlock() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut binary = TestBinary::new(
        reference_testee(),
        0,
        config_for(dir.path()),
        ShutdownSignal::new(),
    )
    .unwrap();

    // Way more than a pipe holds
    assert!(!binary.test(&case(&[], "noise:150000")).unwrap().is_crash());

    match binary.test(&case(&[], "crash")).unwrap() {
        Outcome::Crashed { output, .. } => {
            let output = String::from_utf8_lossy(&output);
            assert!(output.contains("panic: runtime error: simulated crash"));
        }
        Outcome::Finished { .. } => panic!("crash went unnoticed"),
    }
}

#[test]
fn test_shutdown_cleans_up_companion_and_data_dirs() {
    let dir = tempdir().expect("failed to create temporary dir");
    let data_dir = dir.path().join("tidb-fuzz-7");
    let companion_dir = dir.path().join("mysql-fuzz-7");
    let workdir = dir.path().join("work");
    fs::create_dir(&data_dir).unwrap();
    fs::create_dir(&companion_dir).unwrap();
    fs::write(data_dir.join("tidb.log"), "tidb says hi").unwrap();
    fs::write(companion_dir.join("mysql.log"), "mysql says hi").unwrap();

    let mut companion = Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("failed to spawn sleep");
    fs::write(companion_dir.join("mysql.pid"), format!("{}\n", companion.id())).unwrap();

    let mut config = config_for(&data_dir);
    config.workdir = workdir.clone();
    config.move_logs = true;
    config.remove_data_dirs = true;

    {
        let mut binary = TestBinary::new(reference_testee(), 0, config, ShutdownSignal::new()).unwrap();
        assert!(!binary.test(&case(&[], "SELECT 1")).unwrap().is_crash());
        // Dropping shuts the testee down
    }

    assert_eq!(companion.wait().unwrap().signal(), Some(libc::SIGTERM));

    let logs = workdir.join("log").join("tidb-fuzz-7");
    assert_eq!(fs::read_to_string(logs.join("tidb.log")).unwrap(), "tidb says hi");
    assert_eq!(fs::read_to_string(logs.join("mysql.log")).unwrap(), "mysql says hi");
    assert!(!data_dir.exists());
    assert!(!companion_dir.exists());
}

#[test]
fn test_global_shutdown_kills_testee() {
    let dir = tempdir().expect("failed to create temporary dir");
    let shutdown = ShutdownSignal::new();
    let mut mapping = Mapping::create().unwrap();
    let mut testee = spawn_reference(&mapping, config_for(dir.path()), &shutdown);

    assert!(matches!(
        testee.test(&mut mapping, b"SELECT 1"),
        Status::Completed(_)
    ));

    shutdown.trigger();
    thread::sleep(Duration::from_millis(200));

    assert!(!matches!(
        testee.test(&mut mapping, b"SELECT 1"),
        Status::Completed(_)
    ));
    testee.shutdown();
}

#[test]
fn test_global_shutdown_during_dml_is_not_a_crash() {
    let dir = tempdir().expect("failed to create temporary dir");
    let shutdown = ShutdownSignal::new();
    let mut binary =
        TestBinary::new(reference_testee(), 0, config_for(dir.path()), shutdown.clone()).unwrap();

    let trigger = {
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            shutdown.trigger();
        })
    };

    let err = binary
        .test(&case(&[], "hang"))
        .expect_err("interrupted dml must not be reported as a crash");
    assert!(err.to_string().contains("Shutdown requested"));
    trigger.join().unwrap();
}

#[test]
fn test_periodic_check_runs_per_attempt() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut binary = TestBinary::new(
        reference_testee(),
        0,
        config_for(dir.path()),
        ShutdownSignal::new(),
    )
    .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&calls);
        binary.set_periodic_check(move || {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }

    binary.test(&case(&[], "SELECT 1")).unwrap();
    binary.test(&case(&[], "SELECT 2")).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
#[should_panic(expected = "already shut down")]
fn test_test_after_shutdown_panics() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut mapping = Mapping::create().unwrap();
    let mut testee = spawn_reference(&mapping, config_for(dir.path()), &ShutdownSignal::new());

    testee.shutdown();
    testee.test(&mut mapping, b"SELECT 1");
}

#[test]
#[should_panic(expected = "already shut down")]
fn test_double_shutdown_panics() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mapping = Mapping::create().unwrap();
    let mut testee = spawn_reference(&mapping, config_for(dir.path()), &ShutdownSignal::new());

    testee.shutdown();
    testee.shutdown();
}

#[test]
#[should_panic(expected = "was not shut down")]
fn test_test_after_unreported_crash_panics() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut mapping = Mapping::create().unwrap();
    let mut testee = spawn_reference(&mapping, config_for(dir.path()), &ShutdownSignal::new());

    assert_eq!(
        testee.test(&mut mapping, b"crash"),
        Status::Crashed { hanged: false }
    );
    testee.test(&mut mapping, b"SELECT 1");
}

#[test]
#[should_panic(expected = "too large")]
fn test_oversized_payload_panics() {
    let dir = tempdir().expect("failed to create temporary dir");
    let mut mapping = Mapping::create().unwrap();
    let mut testee = spawn_reference(&mapping, config_for(dir.path()), &ShutdownSignal::new());

    testee.test(&mut mapping, &vec![b'a'; MAX_INPUT_SIZE + 1]);
}
