//! The test-driver contract.
//!
//! A [`TestDriver`] explores and runs a package of tests. The same contract is
//! implemented by the inner driver living in the host, by the host-side
//! wrapper that funnels calls onto the host thread, and by the client-side
//! proxy that forwards calls over the channel.

mod process;

pub use process::{ProcessTestDriver, INTERPRETER_PROPERTY};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;

/// Default per-test timeout used by drivers that enforce one.
pub const DEFAULT_TEST_TIMEOUT_MS: u64 = 60_000;

/// Options passed once, before any explore or run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverOptions {
    /// Free-form driver properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Per-test timeout in milliseconds
    #[serde(default = "default_test_timeout_ms")]
    pub test_timeout_ms: u64,
}

fn default_test_timeout_ms() -> u64 {
    DEFAULT_TEST_TIMEOUT_MS
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            properties: BTreeMap::new(),
            test_timeout_ms: DEFAULT_TEST_TIMEOUT_MS,
        }
    }
}

/// The files making up a test package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestPackage {
    pub files: Vec<PathBuf>,
    pub working_directory: Option<PathBuf>,
}

impl TestPackage {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self {
            files,
            working_directory: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Only run tests whose name contains this text
    pub filter: Option<String>,
}

impl RunOptions {
    pub fn selects(&self, test: &TestCase) -> bool {
        self.filter
            .as_deref()
            .is_none_or(|filter| test.name.contains(filter))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test: TestCase,
    pub outcome: TestOutcome,
    pub duration_ms: u64,
    /// Captured output or failure description
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExploreReport {
    pub tests: Vec<TestCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub results: Vec<TestResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn passed(&self) -> usize {
        self.results
            .iter()
            .filter(|result| result.outcome == TestOutcome::Passed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Progress reported by a driver while it explores or runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestEvent {
    Log { message: String },
    TestStarted { test: TestCase },
    TestFinished { result: TestResult },
}

/// Receives [`TestEvent`]s. Called from whichever thread the driver runs on.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: TestEvent);
}

pub type SharedSink = Arc<dyn EventSink>;

impl<F> EventSink for F
where
    F: Fn(TestEvent) + Send + Sync,
{
    fn publish(&self, event: TestEvent) {
        self(event)
    }
}

/// Discards every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: TestEvent) {}
}

/// Keeps every event in arrival order.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<TestEvent>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<TestEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for CollectingSink {
    fn publish(&self, event: TestEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Explores and runs test packages.
///
/// `initialize` is called once before anything else. Implementations only
/// need to be `Send`: the host wrapper guarantees every call happens on one
/// thread.
pub trait TestDriver: Send {
    fn initialize(&mut self, options: &DriverOptions) -> Result<()>;

    fn explore(&mut self, package: &TestPackage, sink: SharedSink) -> Result<ExploreReport>;

    fn run(
        &mut self,
        package: &TestPackage,
        options: &RunOptions,
        sink: SharedSink,
    ) -> Result<RunReport>;
}
