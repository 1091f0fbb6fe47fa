//! Test execution collaborator.
//!
//! A [`TestHost`] runs a named subset of tests from a replica's test executable under a time
//! budget and reports one [`TestOutcome`] per requested test. [`LibtestHost`] drives any
//! executable that speaks the libtest console protocol.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::coverage::TestName;

/// Result of one test in one constrained run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    /// The test passed.
    Passed,
    /// The test failed.
    Failed,
    /// The host was stopped before the test reported.
    Timeout,
    /// The test did not run.
    NotRun,
}

impl TestOutcome {
    /// True for outcomes that count as evidence of a hang.
    pub fn is_incomplete(self) -> bool {
        matches!(self, Self::Timeout | Self::NotRun)
    }
}

/// One constrained test run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRunRequest {
    /// Test executable.
    pub executable: PathBuf,
    /// Working directory for the run.
    pub working_dir: PathBuf,
    /// Tests to run. Nothing else is executed.
    pub tests: BTreeSet<TestName>,
    /// Time budget for the whole run.
    pub timeout: Duration,
}

/// Outcomes of a constrained test run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestRunReport {
    /// Outcome per requested test.
    pub outcomes: BTreeMap<TestName, TestOutcome>,
    /// Whether the host had to be stopped at the time budget.
    pub timed_out: bool,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

/// Test host failures.
#[derive(Debug, Error)]
pub enum TestHostError {
    /// The test executable could not be started.
    #[error("failed to start test executable {executable}: {source}")]
    Spawn {
        /// Executable path.
        executable: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Reading output or waiting for the process failed.
    #[error("test host io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs tests on behalf of the round executor.
pub trait TestHost: Send + Sync {
    /// Run exactly `request.tests` and report an outcome for each of them.
    fn run_tests(
        &self,
        request: TestRunRequest,
    ) -> impl Future<Output = Result<TestRunReport, TestHostError>> + Send;
}

/// Host for executables speaking the libtest console protocol.
///
/// Runs `<executable> --exact <args..> <tests..>` and reads `test <name> ... ok|FAILED|ignored`
/// lines from stdout.
#[derive(Debug, Clone, Default)]
pub struct LibtestHost {
    args: Vec<String>,
}

impl LibtestHost {
    /// Host without extra arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an argument passed before the test names, e.g. `--test-threads=1`.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl TestHost for LibtestHost {
    async fn run_tests(&self, request: TestRunRequest) -> Result<TestRunReport, TestHostError> {
        let started = Instant::now();
        let mut child = Command::new(&request.executable)
            .current_dir(&request.working_dir)
            .arg("--exact")
            .args(&self.args)
            .args(&request.tests)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TestHostError::Spawn {
                executable: request.executable.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let mut reported = BTreeMap::new();
        let collect = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(line) = lines.next_line().await? {
                    if let Some((name, outcome)) = parse_libtest_line(&line) {
                        reported.insert(name, outcome);
                    }
                }
            }
            child.wait().await
        };

        let finished = tokio::time::timeout(request.timeout, collect).await;
        let timed_out = match finished {
            Ok(status) => {
                debug!("test host exited with {}", status?);
                false
            }
            Err(_) => {
                if let Err(err) = child.kill().await {
                    warn!("failed to stop timed out test host: {err}");
                }
                true
            }
        };

        let missing = if timed_out {
            TestOutcome::Timeout
        } else {
            TestOutcome::NotRun
        };
        let outcomes = request
            .tests
            .iter()
            .map(|test| {
                let outcome = reported.get(test).copied().unwrap_or(missing);
                (test.clone(), outcome)
            })
            .collect();

        Ok(TestRunReport {
            outcomes,
            timed_out,
            elapsed: started.elapsed(),
        })
    }
}

/// Parse one libtest console line into a test name and outcome.
pub fn parse_libtest_line(line: &str) -> Option<(TestName, TestOutcome)> {
    let rest = line.strip_prefix("test ")?;
    let (name, result) = rest.split_once(" ... ")?;
    let outcome = match result.trim() {
        "ok" => TestOutcome::Passed,
        "FAILED" => TestOutcome::Failed,
        // A requested test that libtest skips still leaves its mutation unverified, so it
        // counts as incomplete and flags the group the same way a hang does.
        other if other.starts_with("ignored") => TestOutcome::NotRun,
        _ => return None,
    };
    Some((name.trim().to_string(), outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_libtest_result_lines() {
        assert_eq!(
            parse_libtest_line("test calc::adds ... ok"),
            Some(("calc::adds".to_string(), TestOutcome::Passed))
        );
        assert_eq!(
            parse_libtest_line("test calc::subtracts ... FAILED"),
            Some(("calc::subtracts".to_string(), TestOutcome::Failed))
        );
        assert_eq!(
            parse_libtest_line("test calc::slow ... ignored, needs network"),
            Some(("calc::slow".to_string(), TestOutcome::NotRun))
        );
        assert_eq!(parse_libtest_line("test result: ok. 2 passed; 0 failed"), None);
        assert_eq!(parse_libtest_line("running 2 tests"), None);
        assert_eq!(parse_libtest_line("test calc::bench ... bench: 10 ns/iter"), None);
    }

    #[test]
    fn incomplete_outcomes() {
        assert!(TestOutcome::Timeout.is_incomplete());
        assert!(TestOutcome::NotRun.is_incomplete());
        assert!(!TestOutcome::Passed.is_incomplete());
        assert!(!TestOutcome::Failed.is_incomplete());
    }

    #[cfg(unix)]
    mod process {
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};
        use std::time::Duration;

        use tempfile::tempdir;

        use super::super::{LibtestHost, TestHost, TestHostError, TestOutcome, TestRunRequest};

        fn script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-tests");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("script should write");
            let mut perms = std::fs::metadata(&path)
                .expect("script metadata should load")
                .permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).expect("script should become executable");
            path
        }

        fn request(dir: &Path, executable: PathBuf, tests: &[&str], timeout: Duration) -> TestRunRequest {
            TestRunRequest {
                executable,
                working_dir: dir.to_path_buf(),
                tests: tests.iter().map(|t| t.to_string()).collect(),
                timeout,
            }
        }

        #[tokio::test]
        async fn unreported_tests_are_not_run() {
            let tmp = tempdir().expect("tempdir should be created");
            let exe = script(
                tmp.path(),
                "echo 'test a ... ok'\necho 'test b ... FAILED'\nexit 101",
            );

            let report = LibtestHost::new()
                .run_tests(request(tmp.path(), exe, &["a", "b", "c"], Duration::from_secs(10)))
                .await
                .expect("host should run");
            assert!(!report.timed_out);
            assert_eq!(report.outcomes["a"], TestOutcome::Passed);
            assert_eq!(report.outcomes["b"], TestOutcome::Failed);
            assert_eq!(report.outcomes["c"], TestOutcome::NotRun);
        }

        #[tokio::test]
        async fn hung_host_is_killed_and_reports_timeouts() {
            let tmp = tempdir().expect("tempdir should be created");
            let exe = script(tmp.path(), "echo 'test a ... ok'\nexec sleep 30");

            let report = LibtestHost::new()
                .run_tests(request(tmp.path(), exe, &["a", "b"], Duration::from_millis(500)))
                .await
                .expect("host should run");
            assert!(report.timed_out);
            assert!(report.elapsed < Duration::from_secs(10));
            assert_eq!(report.outcomes["a"], TestOutcome::Passed);
            assert_eq!(report.outcomes["b"], TestOutcome::Timeout);
        }

        #[tokio::test]
        async fn missing_executable_is_a_spawn_error() {
            let tmp = tempdir().expect("tempdir should be created");
            let err = LibtestHost::new()
                .run_tests(request(
                    tmp.path(),
                    tmp.path().join("missing"),
                    &["a"],
                    Duration::from_secs(1),
                ))
                .await
                .expect_err("missing executable should fail");
            assert!(matches!(err, TestHostError::Spawn { .. }));
        }
    }
}
