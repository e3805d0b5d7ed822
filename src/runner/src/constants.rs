use std::time::Duration;

use static_assertions::const_assert_eq;

/// Coverage region at the start of the shared memory file
pub const COVER_SIZE: usize = 64 << 10;
/// Input region, right after coverage. Also the upper bound on a single statement.
pub const MAX_INPUT_SIZE: usize = 1 << 20;
/// Differential signal region, last
pub const SONAR_REGION_SIZE: usize = 1 << 20;
/// Total size of the shared memory file. Both processes must agree on this layout.
pub const COMM_SIZE: usize = COVER_SIZE + MAX_INPUT_SIZE + SONAR_REGION_SIZE;

/// Hardcoded file descriptors the testee finds its channels on
pub const COMM_FD: i32 = 3;
pub const CONTROL_FD: i32 = COMM_FD + 1;
pub const REPLY_FD: i32 = COMM_FD + 2;

/// `[function index: u8][payload length: u64 LE]`
pub const CONTROL_HEADER_SIZE: usize = 9;
/// `[result: u64][elapsed ns: u64][sonar length: u64]`, all LE
pub const REPLY_SIZE: usize = 24;

const_assert_eq!(CONTROL_HEADER_SIZE, 1 + 8);
const_assert_eq!(REPLY_SIZE, 3 * 8);

/// Upper bound on the init handshake line
pub const INIT_OUTPUT_LIMIT: usize = 1024;

/// How much output a testee can emit before old output gets overwritten
pub const CAPTURE_BUFFER_SIZE: usize = 1 << 20;

/// Testees accumulate memory over time, so they get recreated after this many runs
pub const DEFAULT_EXEC_LIMIT: u64 = 1_000_000;

pub const DRAIN_INTERVAL: Duration = Duration::from_secs(1);
pub const SPAWN_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Time between SIGABRT and SIGKILL for a hung testee
pub const ABORT_GRACE: Duration = Duration::from_secs(1);

pub const TRACEBACK_VAR: &str = "GOTRACEBACK";
pub const VERBOSE_VAR: &str = "TIFUZZ_VERBOSE";
