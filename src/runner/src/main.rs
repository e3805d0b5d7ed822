use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::Hasher;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use structopt::StructOpt;

use sqlfuzz_runner::{Config, Outcome, ShutdownSignal, TestBinary, TestCase};

const EXIT_CRASH: i32 = 2;

#[derive(Debug, StructOpt)]
#[structopt(name = "sqlfuzz-runner", about = "Run a SQL test case against a testee binary")]
struct Opt {
    /// Testee binary
    #[structopt(parse(from_os_str))]
    binary: PathBuf,
    /// Test case file: one statement per line, the last one is the DML
    #[structopt(parse(from_os_str))]
    testcase: PathBuf,
    /// Seconds a single statement may run before it counts as a hang
    #[structopt(short, long, default_value = "10")]
    timeout: u64,
    /// More output. Also forwarded to the testee. Repeat for more.
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,
    /// Session directory. Logs are moved into `<workdir>/log` with `--move-log`.
    #[structopt(short, long, parse(from_os_str), default_value = ".")]
    workdir: PathBuf,
    /// Copy `*.log` files out of the data dirs when a testee goes down
    #[structopt(long)]
    move_log: bool,
    /// Delete the data dirs when a testee goes down
    #[structopt(long)]
    remove_data_dir: bool,
    /// Function index sent with every request
    #[structopt(long, default_value = "0")]
    fnidx: u8,
    /// Run the test case this many times
    #[structopt(short = "n", long, default_value = "1")]
    repeat: u64,
    /// Directory to save crashing test cases and their output into
    ///
    /// Files are named after a hash of the output so repeated crashes land on the same name.
    #[structopt(short, long, parse(from_os_str))]
    crash_dir: Option<PathBuf>,
}

impl Opt {
    fn config(&self) -> Config {
        Config {
            timeout: Duration::from_secs(self.timeout),
            verbosity: self.verbose,
            workdir: self.workdir.clone(),
            move_logs: self.move_log,
            remove_data_dirs: self.remove_data_dir,
            ..Config::default()
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn output_hash(output: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(output);
    hasher.finish()
}

/// Save a crashing test case next to its output for later triage
fn save_crash(dir: &Path, case: &TestCase, output: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let name = format!("{:016x}", output_hash(output));
    let sql = dir.join(format!("{}.sql", name));
    fs::write(&sql, case.to_text())
        .with_context(|| format!("Failed to write {}", sql.display()))?;
    fs::write(dir.join(format!("{}.output", name)), output)
        .with_context(|| format!("Failed to write crash output for {}", name))?;

    Ok(sql)
}

/// Returns whether any run crashed
fn _main(opts: Opt) -> Result<bool> {
    let text = fs::read_to_string(&opts.testcase)
        .with_context(|| format!("Failed to read {}", opts.testcase.display()))?;
    let case = TestCase::parse(&text)?;

    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.trigger())
            .with_context(|| "Failed to install signal handler".to_string())?;
    }

    let mut binary = TestBinary::new(&opts.binary, opts.fnidx, opts.config(), shutdown.clone())?;
    let mut crashed = false;

    for i in 0..opts.repeat {
        if shutdown.is_triggered() {
            warn!("Interrupted after {} runs", i);
            break;
        }

        let outcome = match binary.test(&case) {
            Ok(outcome) => outcome,
            Err(e) if shutdown.is_triggered() => {
                warn!("Interrupted during run {}: {:#}", i, e);
                break;
            }
            Err(e) => return Err(e),
        };

        match outcome {
            Outcome::Finished {
                result,
                elapsed_ns,
                coverage,
                sonar,
            } => {
                let covered = coverage.iter().filter(|&&b| b != 0).count();
                info!(
                    "run {}: result={} elapsed={}ns coverage={} sonar={}B",
                    i,
                    result,
                    elapsed_ns,
                    covered,
                    sonar.len()
                );
            }
            Outcome::Crashed { output, hanged } => {
                crashed = true;
                warn!("run {}: testee {}", i, if hanged { "hanged" } else { "crashed" });
                io::stderr().write_all(&output)?;

                if let Some(dir) = &opts.crash_dir {
                    let path = save_crash(dir, &case, &output)?;
                    info!("Saved crash to {}", path.display());
                }
            }
        }
    }

    let stats = binary.stats();
    info!("execs={} restarts={}", stats.execs, stats.restarts);

    Ok(crashed)
}

fn main() {
    let opts = Opt::from_args();
    init_logging(opts.verbose);

    match _main(opts) {
        Ok(false) => exit(0),
        Ok(true) => exit(EXIT_CRASH),
        Err(e) => {
            eprintln!("Unclean runner exit: {:#}", e);
            exit(1);
        }
    }
}

#[test]
fn test_save_crash() {
    use tempfile::tempdir;

    let dir = tempdir().expect("failed to create temporary dir");
    let case = TestCase::parse("CREATE TABLE t (a INT);\nSELECT a FROM t;").unwrap();

    let first = save_crash(dir.path(), &case, b"panic: boom").expect("failed to save crash");
    let again = save_crash(dir.path(), &case, b"panic: boom").expect("failed to save crash");
    let other = save_crash(dir.path(), &case, b"panic: bang").expect("failed to save crash");

    assert_eq!(first, again);
    assert_ne!(first, other);
    assert_eq!(TestCase::parse(&fs::read_to_string(&first).unwrap()).unwrap(), case);
    assert_eq!(
        fs::read(first.with_extension("output")).unwrap(),
        b"panic: boom".to_vec()
    );
}
