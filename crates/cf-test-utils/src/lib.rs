#![forbid(unsafe_code)]

use cf_core::{StateSnapshot, Value};
use cf_transforms::{
    Procedure, SpecializingCompiler, StatefulProcedure, TraceCompiler, TransformError,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

pub const TEST_LOG_SCHEMA_VERSION: &str = "ctrlflow.test-log.v1";

/// Execution discipline a logged case ran under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Eager,
    Trace,
    Batched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLogEnv {
    pub os: String,
    pub arch: String,
    pub timestamp_unix_ms: u64,
}

/// One structured record per conformance case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLogV1 {
    pub schema_version: String,
    pub test_id: String,
    pub fixture_id: String,
    pub seed: Option<u64>,
    pub execution: ExecutionKind,
    pub env: TestLogEnv,
    pub result: TestResult,
    pub details: Option<String>,
}

impl TestLogV1 {
    #[must_use]
    pub fn case(
        test_id: impl Into<String>,
        fixture_id: impl Into<String>,
        execution: ExecutionKind,
        result: TestResult,
    ) -> Self {
        Self {
            schema_version: TEST_LOG_SCHEMA_VERSION.to_owned(),
            test_id: test_id.into(),
            fixture_id: fixture_id.into(),
            seed: capture_proptest_seed(),
            execution,
            env: capture_env(),
            result,
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[must_use]
pub fn capture_env() -> TestLogEnv {
    TestLogEnv {
        os: std::env::consts::OS.to_owned(),
        arch: std::env::consts::ARCH.to_owned(),
        timestamp_unix_ms: now_unix_ms_u64(),
    }
}

/// Stable id for a fixture: sha256 over its JSON encoding.
pub fn fixture_id_from_json<T: Serialize>(fixture: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(fixture)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("CF_PROPTEST_CASES")
        && let Ok(parsed) = raw.parse::<u32>()
        && parsed > 0
    {
        return parsed;
    }

    if std::env::var_os("CI").is_some() {
        512
    } else {
        64
    }
}

#[must_use]
pub fn capture_proptest_seed() -> Option<u64> {
    ["CF_PROPTEST_SEED", "PROPTEST_RNG_SEED"]
        .into_iter()
        .find_map(|name| std::env::var(name).ok()?.parse::<u64>().ok())
}

#[must_use]
pub fn test_id(module_path: &str, test_name: &str) -> String {
    format!("{module_path}::{test_name}")
}

/// Route `tracing` output through the test harness writer.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn now_unix_ms_u64() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| u64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}

/// [`SpecializingCompiler`] that records the name of every compile request.
#[derive(Debug, Default)]
pub struct CountingCompiler {
    inner: SpecializingCompiler,
    names: Mutex<Vec<String>>,
}

impl CountingCompiler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn compiled_names(&self) -> Vec<String> {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.compilations()
    }

    fn record(&self, name: &str) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_owned());
    }
}

impl TraceCompiler for CountingCompiler {
    fn compile(
        &self,
        name: &str,
        procedure: Procedure,
        example_inputs: &[Value],
    ) -> Result<Procedure, TransformError> {
        self.record(name);
        self.inner.compile(name, procedure, example_inputs)
    }

    fn compile_stateful(
        &self,
        name: &str,
        procedure: StatefulProcedure,
        example_state: &StateSnapshot,
        example_inputs: &[Value],
    ) -> Result<StatefulProcedure, TransformError> {
        self.record(name);
        self.inner
            .compile_stateful(name, procedure, example_state, example_inputs)
    }
}

/// Compiler whose first `failures` requests fail with `CompileFailed`;
/// later requests go to a [`SpecializingCompiler`].
#[derive(Debug, Default)]
pub struct FailingCompiler {
    remaining: AtomicUsize,
    inner: SpecializingCompiler,
}

impl FailingCompiler {
    #[must_use]
    pub fn failing_first(failures: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(failures),
            inner: SpecializingCompiler::new(),
        }
    }

    fn take_failure(&self, name: &str) -> Result<(), TransformError> {
        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransformError::CompileFailed {
                procedure: name.to_owned(),
                detail: "injected failure".to_owned(),
            });
        }
        Ok(())
    }
}

impl TraceCompiler for FailingCompiler {
    fn compile(
        &self,
        name: &str,
        procedure: Procedure,
        example_inputs: &[Value],
    ) -> Result<Procedure, TransformError> {
        self.take_failure(name)?;
        self.inner.compile(name, procedure, example_inputs)
    }

    fn compile_stateful(
        &self,
        name: &str,
        procedure: StatefulProcedure,
        example_state: &StateSnapshot,
        example_inputs: &[Value],
    ) -> Result<StatefulProcedure, TransformError> {
        self.take_failure(name)?;
        self.inner
            .compile_stateful(name, procedure, example_state, example_inputs)
    }
}
