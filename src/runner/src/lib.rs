//! Execution core of a differential SQL fuzzer.
//!
//! A [`TestBinary`] drives one testee subprocess at a time over a shared memory file and three
//! pipes: DDL gets replayed whenever a fresh testee starts, then each test case's DML is run and
//! its reply, crash or hang reported back.

pub mod binary;
pub mod capture;
pub mod case;
pub mod config;
pub mod constants;
pub mod mapping;
pub mod process;
pub mod protocol;
pub mod signal;
pub mod testee;

pub use binary::{Outcome, Stats, TestBinary};
pub use case::{StatementSource, TestCase};
pub use config::{Companion, Config};
pub use signal::ShutdownSignal;
