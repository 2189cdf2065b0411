//! Wire protocol.
//!
//! JSON text frames of the form `{"event": "<name>", "data": {..}}`.
//! Payload fields are camelCase.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::battle::{BattleState, EndReason, Outcome};
use crate::judge::{JudgeReport, JudgeStatus};

pub type UserId = String;
pub type BattleId = String;
pub type ConnectionId = u64;

/// Wall-clock epoch millis, for wire timestamps only.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Client → server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinQueue,
    LeaveQueue,
    JoinBattle(BattleRef),
    RunCode(CodePayload),
    SubmitCode(CodePayload),
    Sledge(SledgePayload),
    ForfeitBattle(BattleRef),
}

impl ClientEvent {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinQueue => "join_queue",
            Self::LeaveQueue => "leave_queue",
            Self::JoinBattle(_) => "join_battle",
            Self::RunCode(_) => "run_code",
            Self::SubmitCode(_) => "submit_code",
            Self::Sledge(_) => "sledge",
            Self::ForfeitBattle(_) => "forfeit_battle",
        }
    }

    /// Battle addressed by this event, if any.
    pub fn battle_id(&self) -> Option<&str> {
        match self {
            Self::JoinQueue | Self::LeaveQueue => None,
            Self::JoinBattle(b) | Self::ForfeitBattle(b) => Some(&b.battle_id),
            Self::RunCode(c) | Self::SubmitCode(c) => Some(&c.battle_id),
            Self::Sledge(s) => Some(&s.battle_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleRef {
    pub battle_id: BattleId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodePayload {
    pub battle_id: BattleId,
    pub code: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SledgePayload {
    pub battle_id: BattleId,
    pub message: String,
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    QueueStatus(QueueStatus),
    BattleFound(BattleFound),
    BattleStarted(BattleStarted),
    BattleState(BattleSnapshot),
    RunResult(RunResult),
    AttemptNotification(AttemptNotification),
    SubmitResult(SubmitResult),
    Sledge(SledgeMessage),
    OpponentDisconnected(OpponentPresence),
    OpponentReconnected(OpponentPresence),
    BattleEnd(BattleEnd),
    /// A newer connection for the same user took over.
    SessionReplaced,
    Error(ErrorEvent),
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::QueueStatus(_) => "queue_status",
            Self::BattleFound(_) => "battle_found",
            Self::BattleStarted(_) => "battle_started",
            Self::BattleState(_) => "battle_state",
            Self::RunResult(_) => "run_result",
            Self::AttemptNotification(_) => "attempt_notification",
            Self::SubmitResult(_) => "submit_result",
            Self::Sledge(_) => "sledge",
            Self::OpponentDisconnected(_) => "opponent_disconnected",
            Self::OpponentReconnected(_) => "opponent_reconnected",
            Self::BattleEnd(_) => "battle_end",
            Self::SessionReplaced => "session_replaced",
            Self::Error(_) => "error",
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorEvent {
            code,
            message: message.into(),
            battle_id: None,
            retry_after_ms: None,
            waited_seconds: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub users_in_queue: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opponent {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleFound {
    pub battle_id: BattleId,
    pub opponent: Opponent,
    pub problem_id: String,
    /// Epoch millis at which the countdown ends.
    pub start_time: u64,
    pub time_limit_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleStarted {
    pub battle_id: BattleId,
    pub started_at: u64,
    pub time_limit_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleSnapshot {
    pub battle_id: BattleId,
    pub problem_id: String,
    pub state: BattleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    pub time_limit_seconds: u64,
    pub remaining_seconds: u64,
    pub opponent: Opponent,
    pub opponent_connected: bool,
    pub opponent_accepted: bool,
    pub you: SideSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_language: Option<String>,
    pub accepted: bool,
    pub submissions: usize,
    pub run_in_flight: bool,
    pub submit_in_flight: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub battle_id: BattleId,
    pub result: JudgeReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    Run,
    Submit,
}

/// Content-free notice that the opponent is executing code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptNotification {
    pub battle_id: BattleId,
    pub side: UserId,
    pub kind: AttemptKind,
}

/// Submission outcome without code or test case detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassSummary {
    pub status: JudgeStatus,
    pub passed: u32,
    pub total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_kb: Option<u64>,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResult {
    pub battle_id: BattleId,
    pub user_id: UserId,
    pub pass_summary: PassSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SledgeMessage {
    pub battle_id: BattleId,
    pub from_user_id: UserId,
    pub from_username: String,
    pub text: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpponentPresence {
    pub battle_id: BattleId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_seconds: Option<u64>,
}

/// Result from the recipient's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerResult {
    Won,
    Lost,
    Draw,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleEnd {
    pub battle_id: BattleId,
    pub outcome: Outcome,
    pub reason: EndReason,
    pub result: PlayerResult,
    pub opponent_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AlreadyActive,
    Unauthorized,
    InvalidState,
    JudgeError,
    QueueTimeout,
    DisconnectGraceExpired,
    RateLimited,
    InvalidPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battle_id: Option<BattleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waited_seconds: Option<u64>,
}
