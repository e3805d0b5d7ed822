use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};

use crate::constants::DEFAULT_EXEC_LIMIT;

/// Where the reference engine paired with a testee keeps its state
#[derive(Debug, Clone)]
pub struct Companion {
    /// Substring of the testee data dir naming the engine under test
    pub tag: String,
    /// Replacement that yields the reference engine's data dir
    pub companion_tag: String,
    /// PID file inside the reference engine's data dir
    pub pid_file: String,
}

impl Default for Companion {
    fn default() -> Self {
        Self {
            tag: "tidb-fuzz".to_string(),
            companion_tag: "mysql-fuzz".to_string(),
            pid_file: "mysql.pid".to_string(),
        }
    }
}

impl Companion {
    pub fn data_dir(&self, testee_data_dir: &Path) -> PathBuf {
        let s = testee_data_dir.to_string_lossy();
        PathBuf::from(s.replace(&self.tag, &self.companion_tag))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// A test running longer than this is a hang
    pub timeout: Duration,
    /// Forwarded to the testee. Also picks the default log level of the CLI.
    pub verbosity: u8,
    /// Executions before a testee is recycled
    pub exec_limit: u64,
    /// Session directory. Relocated logs end up in `<workdir>/log`.
    pub workdir: PathBuf,
    /// Copy `*.log` out of the data dirs when a testee goes down
    pub move_logs: bool,
    /// Delete the data dirs when a testee goes down
    pub remove_data_dirs: bool,
    pub companion: Companion,
    /// Extra variables for the testee environment
    pub env: Vec<(OsString, OsString)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            verbosity: 0,
            exec_limit: DEFAULT_EXEC_LIMIT,
            workdir: PathBuf::from("."),
            move_logs: false,
            remove_data_dirs: false,
            companion: Companion::default(),
            env: Vec::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        // The hang banner reports whole seconds
        if self.timeout.as_secs() == 0 || self.timeout.subsec_nanos() != 0 {
            bail!(
                "Timeout must be a positive number of whole seconds, got {:?}",
                self.timeout
            );
        }
        if self.exec_limit == 0 {
            bail!("Exec limit must be positive");
        }

        Ok(())
    }

    /// Banner prepended to the output of a hung testee
    pub fn hang_banner(&self) -> String {
        format!("program hanged (timeout {} seconds)\n\n", self.timeout.as_secs())
    }
}

#[test]
fn test_validate() {
    assert!(Config::default().validate().is_ok());

    let mut config = Config::default();
    config.timeout = Duration::from_secs(0);
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.timeout = Duration::from_millis(500);
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.timeout = Duration::from_millis(1500);
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.timeout = Duration::from_secs(1);
    assert!(config.validate().is_ok());

    let mut config = Config::default();
    config.exec_limit = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_companion_data_dir() {
    let companion = Companion::default();

    assert_eq!(
        companion.data_dir(Path::new("/tmp/work/tidb-fuzz-42")),
        PathBuf::from("/tmp/work/mysql-fuzz-42")
    );
    // No tag, no transform
    assert_eq!(
        companion.data_dir(Path::new("/tmp/data1")),
        PathBuf::from("/tmp/data1")
    );
}

#[test]
fn test_hang_banner() {
    let mut config = Config::default();
    config.timeout = Duration::from_secs(3);

    assert_eq!(config.hang_banner(), "program hanged (timeout 3 seconds)\n\n");
}
