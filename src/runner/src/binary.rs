use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use log::{debug, trace};

use crate::capture::CaptureBuffer;
use crate::case::StatementSource;
use crate::config::Config;
use crate::constants::MAX_INPUT_SIZE;
use crate::mapping::Mapping;
use crate::signal::ShutdownSignal;
use crate::testee::{Status, Testee};

/// Result of one test case
#[derive(Debug)]
pub enum Outcome<'a> {
    Finished {
        result: u64,
        elapsed_ns: u64,
        /// Whole coverage region
        coverage: &'a [u8],
        /// Valid prefix of the sonar region
        sonar: &'a [u8],
    },
    /// The testee died or hung running the DML. `output` is everything it printed.
    Crashed { output: Vec<u8>, hanged: bool },
}

impl Outcome<'_> {
    pub fn is_crash(&self) -> bool {
        matches!(self, Outcome::Crashed { .. })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Attempts to run a test case, restarts included
    pub execs: u64,
    /// Testees started
    pub restarts: u64,
}

/// What the retry loop settled on. Borrows of the mapping are only taken afterwards.
enum Verdict {
    Finished { result: u64, elapsed_ns: u64, sonar_len: usize },
    Crashed { output: Vec<u8>, hanged: bool },
}

/// Runs test cases against one binary, restarting its testee whenever needed.
///
/// Dropping it shuts down the live testee and removes the comm file.
pub struct TestBinary {
    path: PathBuf,
    mapping: Mapping,
    testee: Option<Testee>,
    /// Handed from testee to testee. `None` while a testee holds it.
    buffer: Option<CaptureBuffer>,
    function: u8,
    config: Arc<Config>,
    shutdown: ShutdownSignal,
    stats: Stats,
    periodic_check: Option<Box<dyn FnMut() + Send>>,
}

impl TestBinary {
    pub fn new<P: AsRef<Path>>(
        path: P,
        function: u8,
        config: Config,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            mapping: Mapping::create()?,
            testee: None,
            buffer: Some(CaptureBuffer::new()),
            function,
            config: Arc::new(config),
            shutdown,
            stats: Stats::default(),
            periodic_check: None,
        })
    }

    /// Called once per attempt. `test()` is the only thing that runs regularly, so periodic
    /// work can piggyback on it.
    pub fn set_periodic_check<F: FnMut() + Send + 'static>(&mut self, check: F) {
        self.periodic_check = Some(Box::new(check));
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Run the DML of `data`, starting a testee and replaying the DDL first if there is none.
    ///
    /// Crashes and hangs of the DML are reported as `Outcome::Crashed`. Errors are reserved
    /// for a broken environment (testee failing to start or crashing on DDL) and for a
    /// global shutdown interrupting the DML.
    pub fn test<S: StatementSource + ?Sized>(&mut self, data: &S) -> Result<Outcome<'_>> {
        let ddl = data.ddl();
        let dml = data.dml();

        for statement in ddl.iter().chain(std::iter::once(&dml)) {
            assert!(
                statement.len() <= MAX_INPUT_SIZE,
                "statement is too large (length {}): {}",
                statement.len(),
                statement
            );
        }
        // A fresh testee has to get through all of the DDL and the DML before it is recycled
        if ddl.len() as u64 >= self.config.exec_limit {
            bail!(
                "Test case has {} ddl statements, exec limit is {}",
                ddl.len(),
                self.config.exec_limit
            );
        }

        let verdict = loop {
            if let Some(check) = self.periodic_check.as_mut() {
                check();
            }
            self.stats.execs += 1;

            let mut testee = match self.testee.take() {
                Some(t) => t,
                None => match self.start_testee(&ddl)? {
                    Some(t) => t,
                    None => continue,
                },
            };

            debug!("dml: {}", dml);
            let status = testee.test(&mut self.mapping, dml.as_bytes());
            trace!("status: {:?}", status);

            match status {
                Status::Completed(reply) => {
                    self.testee = Some(testee);
                    break Verdict::Finished {
                        result: reply.result,
                        elapsed_ns: reply.elapsed_ns,
                        // Bounded by the sonar region size, checked by the testee
                        sonar_len: reply.sonar_len as usize,
                    };
                }
                Status::Crashed { hanged } => {
                    let mut output = self.retire(testee);
                    // We killed it ourselves, nothing to report against the testee
                    if self.shutdown.is_triggered() {
                        bail!("Shutdown requested while running dml: {}", dml);
                    }
                    if hanged {
                        let mut banner = self.config.hang_banner().into_bytes();
                        banner.append(&mut output);
                        output = banner;
                    }
                    break Verdict::Crashed { output, hanged };
                }
                Status::Retry => {
                    self.retire(testee);
                    if self.shutdown.is_triggered() {
                        bail!("Shutdown requested while running dml: {}", dml);
                    }
                }
            }
        };

        Ok(match verdict {
            Verdict::Finished {
                result,
                elapsed_ns,
                sonar_len,
            } => Outcome::Finished {
                result,
                elapsed_ns,
                coverage: self.mapping.coverage(),
                sonar: &self.mapping.sonar()[..sonar_len],
            },
            Verdict::Crashed { output, hanged } => Outcome::Crashed { output, hanged },
        })
    }

    /// Start a testee and replay `ddl` on it.
    ///
    /// `Ok(None)` means the testee had to be thrown away and the caller should try again.
    fn start_testee(&mut self, ddl: &[String]) -> Result<Option<Testee>> {
        self.stats.restarts += 1;

        let buffer = self.buffer.take().unwrap_or_default();
        let mut testee = Testee::spawn(
            &self.path,
            &self.mapping,
            self.function,
            Arc::clone(&self.config),
            &self.shutdown,
            buffer,
        )?;

        for statement in ddl {
            debug!("ddl: {}", statement);
            match testee.test(&mut self.mapping, statement.as_bytes()) {
                Status::Completed(_) => (),
                Status::Retry => {
                    self.retire(testee);
                    return Ok(None);
                }
                Status::Crashed { .. } => {
                    // DDL is assumed to be safe. Bugs are only expected on the DML.
                    let output = self.retire(testee);
                    bail!(
                        "Testee crashed on ddl: {}\n{}",
                        statement,
                        String::from_utf8_lossy(&output)
                    );
                }
            }
        }

        Ok(Some(testee))
    }

    /// Shut a testee down for good and keep its capture buffer around for the next one
    fn retire(&mut self, mut testee: Testee) -> Vec<u8> {
        let output = testee.shutdown();
        if let Some(buffer) = testee.take_buffer() {
            self.buffer = Some(buffer);
        }
        output
    }
}

impl Drop for TestBinary {
    fn drop(&mut self) {
        if let Some(testee) = self.testee.take() {
            self.retire(testee);
        }
        // `mapping` is released after this, unmapping and removing the comm file
    }
}
