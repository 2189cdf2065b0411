//! Judge gateway.
//!
//! Adapts run/submit requests into calls against the external judge. Calls
//! are spawned onto the runtime and report back through a callback, so the
//! caller's event loop never waits on the sandbox. Every failure (transport,
//! timeout, sandbox error) becomes a [`JudgeStatus::Error`] report.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::JudgeConfig;
use crate::protocol::PassSummary;

/// Execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// Sample tests only, result private to the requester.
    Run,
    /// Full test suite, authoritative.
    Submit,
}

/// Terminal judge status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JudgeStatus {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    CompilationError,
    InternalError,
    /// The gateway could not obtain a verdict.
    Error,
}

impl JudgeStatus {
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestCaseResult {
    pub input: Option<String>,
    pub expected_output: Option<String>,
    pub actual_output: Option<String>,
    pub passed: bool,
    pub error: Option<String>,
    pub runtime_ms: Option<u64>,
    pub memory_kb: Option<u64>,
}

/// Full judge verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeReport {
    pub status: JudgeStatus,
    #[serde(default)]
    pub test_cases_passed: u32,
    #[serde(default)]
    pub total_test_cases: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_kb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub test_case_results: Vec<TestCaseResult>,
}

impl JudgeReport {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: JudgeStatus::Error,
            test_cases_passed: 0,
            total_test_cases: 0,
            runtime_ms: None,
            memory_kb: None,
            error_message: Some(message.into()),
            test_case_results: Vec::new(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status.is_accepted()
    }

    pub fn summary(&self, attempt: u32) -> PassSummary {
        PassSummary {
            status: self.status,
            passed: self.test_cases_passed,
            total: self.total_test_cases,
            runtime_ms: self.runtime_ms,
            memory_kb: self.memory_kb,
            attempt,
        }
    }
}

/// Request sent to the judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeRequest {
    pub mode: ExecMode,
    pub problem_id: String,
    pub language: String,
    pub code: String,
}

/// Judge errors.
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("judge timed out after {0:?}")]
    Timeout(Duration),

    #[error("judge unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("judge rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("sandbox failure: {0}")]
    Sandbox(String),
}

/// External code execution service.
#[async_trait]
pub trait Judge: Send + Sync + 'static {
    async fn execute(&self, request: &JudgeRequest) -> Result<JudgeReport, JudgeError>;
}

/// Judge reached over HTTP: `POST {url}/execute`.
pub struct HttpJudge {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpJudge {
    pub fn new(config: &JudgeConfig) -> Result<Self, JudgeError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/execute", config.url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Judge for HttpJudge {
    async fn execute(&self, request: &JudgeRequest) -> Result<JudgeReport, JudgeError> {
        let response = self.client.post(&self.endpoint).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JudgeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<JudgeReport>().await?)
    }
}

/// Spawns judge calls and absorbs their failures.
#[derive(Clone)]
pub struct JudgeGateway {
    judge: Arc<dyn Judge>,
    timeout: Duration,
    in_flight: Arc<AtomicUsize>,
}

impl JudgeGateway {
    pub fn new(judge: Arc<dyn Judge>, timeout: Duration) -> Self {
        Self {
            judge,
            timeout,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of calls currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Run one request to completion. Never fails.
    pub async fn execute(&self, request: &JudgeRequest) -> JudgeReport {
        match tokio::time::timeout(self.timeout, self.judge.execute(request)).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                tracing::warn!(
                    problem_id = %request.problem_id,
                    mode = ?request.mode,
                    error = %e,
                    "judge call failed"
                );
                JudgeReport::error(e.to_string())
            }
            Err(_) => {
                tracing::warn!(
                    problem_id = %request.problem_id,
                    mode = ?request.mode,
                    timeout = ?self.timeout,
                    "judge call timed out"
                );
                JudgeReport::error(JudgeError::Timeout(self.timeout).to_string())
            }
        }
    }

    /// Spawn `request` and hand the report to `on_complete`.
    pub fn dispatch<F>(&self, request: JudgeRequest, on_complete: F) -> JoinHandle<()>
    where
        F: FnOnce(JudgeReport) + Send + 'static,
    {
        let gateway = self.clone();
        gateway.in_flight.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let report = gateway.execute(&request).await;
            gateway.in_flight.fetch_sub(1, Ordering::Relaxed);
            on_complete(report);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    struct FixedJudge(JudgeStatus);

    #[async_trait]
    impl Judge for FixedJudge {
        async fn execute(&self, _request: &JudgeRequest) -> Result<JudgeReport, JudgeError> {
            Ok(JudgeReport {
                status: self.0,
                test_cases_passed: 3,
                total_test_cases: 3,
                runtime_ms: Some(12),
                memory_kb: Some(2048),
                error_message: None,
                test_case_results: vec![],
            })
        }
    }

    struct BrokenJudge;

    #[async_trait]
    impl Judge for BrokenJudge {
        async fn execute(&self, _request: &JudgeRequest) -> Result<JudgeReport, JudgeError> {
            Err(JudgeError::Sandbox("container crashed".into()))
        }
    }

    struct StuckJudge;

    #[async_trait]
    impl Judge for StuckJudge {
        async fn execute(&self, _request: &JudgeRequest) -> Result<JudgeReport, JudgeError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(JudgeError::Sandbox("unreachable".into()))
        }
    }

    fn request() -> JudgeRequest {
        JudgeRequest {
            mode: ExecMode::Submit,
            problem_id: "two-sum".into(),
            language: "rust".into(),
            code: "fn main() {}".into(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_reports_back() {
        let gateway = JudgeGateway::new(
            Arc::new(FixedJudge(JudgeStatus::Accepted)),
            Duration::from_secs(5),
        );
        let (tx, rx) = oneshot::channel();

        gateway.dispatch(request(), move |report| {
            let _ = tx.send(report);
        });

        let report = rx.await.unwrap();
        assert!(report.is_accepted());
        assert_eq!(gateway.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_becomes_error_report() {
        let gateway = JudgeGateway::new(Arc::new(BrokenJudge), Duration::from_secs(5));
        let report = gateway.execute(&request()).await;

        assert_eq!(report.status, JudgeStatus::Error);
        assert!(report.error_message.unwrap().contains("container crashed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_error_report() {
        let gateway = JudgeGateway::new(Arc::new(StuckJudge), Duration::from_secs(30));
        let report = gateway.execute(&request()).await;

        assert_eq!(report.status, JudgeStatus::Error);
        assert!(report.error_message.unwrap().contains("timed out"));
    }

    #[test]
    fn test_summary_drops_detail() {
        let report = JudgeReport {
            status: JudgeStatus::WrongAnswer,
            test_cases_passed: 4,
            total_test_cases: 10,
            runtime_ms: Some(80),
            memory_kb: None,
            error_message: None,
            test_case_results: vec![TestCaseResult {
                input: Some("1 2".into()),
                expected_output: Some("3".into()),
                actual_output: Some("4".into()),
                ..Default::default()
            }],
        };
        let summary = report.summary(2);
        assert_eq!(summary.status, JudgeStatus::WrongAnswer);
        assert_eq!((summary.passed, summary.total, summary.attempt), (4, 10, 2));
    }

    #[test]
    fn test_decode_judge_response() {
        let report: JudgeReport = serde_json::from_str(
            r#"{"status":"COMPILATION_ERROR","errorMessage":"expected `;`"}"#,
        )
        .unwrap();
        assert_eq!(report.status, JudgeStatus::CompilationError);
        assert_eq!(report.total_test_cases, 0);
        assert!(report.test_case_results.is_empty());
    }
}
