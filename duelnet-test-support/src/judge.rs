//! Deterministic judge driven by markers in the submitted code.
//!
//! | marker           | verdict                          |
//! |------------------|----------------------------------|
//! | `ACCEPT`         | ACCEPTED, all tests pass         |
//! | `COMPILE_ERROR`  | COMPILATION_ERROR                |
//! | `CRASH`          | sandbox failure (gateway ERROR)  |
//! | `HANG`           | never answers (gateway timeout)  |
//! | `SLEEP:<ms>`     | answer after `<ms>` milliseconds |
//! | anything else    | WRONG_ANSWER, 3 of 10 pass       |

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use duelnet::judge::{ExecMode, JudgeError, JudgeReport, JudgeRequest, JudgeStatus, TestCaseResult};
use duelnet::Judge;

pub const TOTAL_TESTS: u32 = 10;

pub struct ScriptedJudge {
    latency: Duration,
    calls: Mutex<Vec<JudgeRequest>>,
}

impl Default for ScriptedJudge {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedJudge {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Base latency for every call, on top of any `SLEEP:` marker.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<JudgeRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Verdict for `request`, ignoring latency markers.
    pub fn verdict(request: &JudgeRequest) -> Result<JudgeReport, JudgeError> {
        let code = request.code.as_str();
        if code.contains("CRASH") {
            return Err(JudgeError::Sandbox("container crashed".into()));
        }
        let (status, passed) = if code.contains("COMPILE_ERROR") {
            (JudgeStatus::CompilationError, 0)
        } else if code.contains("ACCEPT") {
            (JudgeStatus::Accepted, TOTAL_TESTS)
        } else {
            (JudgeStatus::WrongAnswer, 3)
        };

        let test_case_results = match request.mode {
            ExecMode::Run => vec![TestCaseResult {
                input: Some("[2,7,11,15], 9".into()),
                expected_output: Some("[0,1]".into()),
                actual_output: Some(if status.is_accepted() { "[0,1]" } else { "[]" }.into()),
                passed: status.is_accepted(),
                runtime_ms: Some(4),
                ..Default::default()
            }],
            ExecMode::Submit => Vec::new(),
        };

        Ok(JudgeReport {
            status,
            test_cases_passed: passed,
            total_test_cases: TOTAL_TESTS,
            runtime_ms: Some(12),
            memory_kb: Some(2048),
            error_message: (status == JudgeStatus::CompilationError)
                .then(|| "expected `;`".to_string()),
            test_case_results,
        })
    }
}

fn sleep_marker(code: &str) -> Option<Duration> {
    let rest = &code[code.find("SLEEP:")? + "SLEEP:".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok().map(Duration::from_millis)
}

#[async_trait]
impl Judge for ScriptedJudge {
    async fn execute(&self, request: &JudgeRequest) -> Result<JudgeReport, JudgeError> {
        self.calls.lock().unwrap().push(request.clone());

        if request.code.contains("HANG") {
            tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        }
        let delay = self.latency + sleep_marker(&request.code).unwrap_or(Duration::ZERO);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Self::verdict(request)
    }
}
