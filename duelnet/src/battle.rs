//! Battle session state machine.
//!
//! Pure and synchronous: every transition takes the current instant and
//! returns what changed. The owning actor serializes calls, so the machine
//! never sees two events at once.
//!
//! ```text
//! PENDING_START ──start──▶ IN_PROGRESS ──▶ COMPLETED | FORFEITED | DRAWN
//! ```
//!
//! The outcome is written once by [`Battle::finalize`] and never changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::BattleConfig;
use crate::judge::{JudgeReport, JudgeStatus};
use crate::protocol::{
    BattleId, BattleSnapshot, ConnectionId, Opponent, PlayerResult, SideSnapshot, UserId,
};

/// Battle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BattleState {
    PendingStart,
    InProgress,
    Completed,
    Forfeited,
    Drawn,
}

impl BattleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Forfeited | Self::Drawn)
    }
}

/// Final result of a battle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    Win {
        #[serde(rename = "winnerId")]
        winner: UserId,
    },
    Draw,
    Forfeit {
        #[serde(rename = "loserId")]
        loser: UserId,
    },
}

/// Why the battle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Accepted,
    TimeExpired,
    Forfeit,
    DisconnectGraceExpired,
    BothForfeited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: Outcome,
    pub reason: EndReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForfeitKind {
    Explicit,
    GraceExpired,
}

/// Rejected transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BattleError {
    #[error("{user_id} is not a participant of battle {battle_id}")]
    NotParticipant { battle_id: BattleId, user_id: UserId },

    #[error("battle has not started")]
    NotStarted,

    #[error("battle already started")]
    AlreadyStarted,

    #[error("battle is over")]
    Finished,

    #[error("a run is already in flight")]
    RunInFlight,

    #[error("a submission is already in flight")]
    SubmitInFlight,

    #[error("solution already accepted")]
    AlreadyAccepted,

    #[error("already forfeited")]
    AlreadyForfeited,

    #[error("no {0} pending")]
    NothingPending(&'static str),
}

/// Timing and policy for one battle.
#[derive(Debug, Clone, Copy)]
pub struct BattleRules {
    pub time_limit: Duration,
    pub reconnect_grace: Duration,
    pub end_on_first_accept: bool,
}

impl From<&BattleConfig> for BattleRules {
    fn from(config: &BattleConfig) -> Self {
        Self {
            time_limit: config.time_limit(),
            reconnect_grace: config.reconnect_grace(),
            end_on_first_accept: config.end_on_first_accept,
        }
    }
}

/// A matched user entering the battle.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: UserId,
    pub username: String,
    pub connection_id: ConnectionId,
}

/// One submit attempt, kept for audit.
#[derive(Debug, Clone)]
pub struct SubmissionEntry {
    pub attempt: u32,
    pub language: String,
    pub status: Option<JudgeStatus>,
    pub passed: u32,
    pub total: u32,
    pub submitted_at: Instant,
    pub completed_at: Option<Instant>,
    /// Completed after the outcome was fixed.
    pub after_outcome: bool,
}

/// One participant's half of the battle.
#[derive(Debug, Clone)]
pub struct Side {
    pub user_id: UserId,
    pub username: String,
    pub connection_id: Option<ConnectionId>,
    pub last_submitted_code: Option<String>,
    pub last_language: Option<String>,
    pub run_in_flight: bool,
    pub submit_in_flight: bool,
    pub submit_result: Option<JudgeReport>,
    pub forfeited: Option<ForfeitKind>,
    pub disconnected_at: Option<Instant>,
    pub submissions: Vec<SubmissionEntry>,
    accepted: Option<(Instant, u64)>,
}

impl Side {
    fn new(participant: Participant) -> Self {
        Self {
            user_id: participant.user_id,
            username: participant.username,
            connection_id: Some(participant.connection_id),
            last_submitted_code: None,
            last_language: None,
            run_in_flight: false,
            submit_in_flight: false,
            submit_result: None,
            forfeited: None,
            disconnected_at: None,
            submissions: Vec::new(),
            accepted: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted.is_some()
    }

    pub fn accepted_at(&self) -> Option<Instant> {
        self.accepted.map(|(at, _)| at)
    }

    pub fn is_connected(&self) -> bool {
        self.disconnected_at.is_none()
    }

    /// Accepted or forfeited: nothing this side does can change the result.
    fn is_decided(&self) -> bool {
        self.accepted.is_some() || self.forfeited.is_some()
    }
}

/// Presence change after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectEffect {
    /// The side went from connected to disconnected.
    pub changed: bool,
    /// A reconnect grace window must be scheduled.
    pub start_grace: bool,
}

/// Presence change after a reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectEffect {
    pub was_disconnected: bool,
    /// Set when the opponent's held forfeit resolves in this side's favour.
    pub resolution: Option<Resolution>,
}

/// Result of applying a submit verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitApplied {
    pub attempt: u32,
    pub accepted: bool,
    /// The verdict arrived after the outcome and was recorded for audit only.
    pub late: bool,
    pub resolution: Option<Resolution>,
}

/// Battle session
#[derive(Debug)]
pub struct Battle {
    pub id: BattleId,
    pub problem_id: String,
    rules: BattleRules,
    state: BattleState,
    sides: [Side; 2],
    created_at: Instant,
    started_at: Option<Instant>,
    started_at_ms: Option<u64>,
    finalized_at: Option<Instant>,
    resolution: Option<Resolution>,
    seq: u64,
}

impl Battle {
    pub fn new(
        id: BattleId,
        problem_id: String,
        participants: [Participant; 2],
        rules: BattleRules,
        now: Instant,
    ) -> Self {
        let [a, b] = participants;
        Self {
            id,
            problem_id,
            rules,
            state: BattleState::PendingStart,
            sides: [Side::new(a), Side::new(b)],
            created_at: now,
            started_at: None,
            started_at_ms: None,
            finalized_at: None,
            resolution: None,
            seq: 0,
        }
    }

    pub fn state(&self) -> BattleState {
        self.state
    }

    pub fn rules(&self) -> &BattleRules {
        &self.rules
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.resolution.as_ref().map(|r| &r.outcome)
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn finalized_at(&self) -> Option<Instant> {
        self.finalized_at
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.started_at.map(|at| at + self.rules.time_limit)
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        match self.deadline() {
            Some(deadline) => deadline.saturating_duration_since(now),
            None => self.rules.time_limit,
        }
    }

    pub fn sides(&self) -> &[Side; 2] {
        &self.sides
    }

    pub fn participants(&self) -> [&str; 2] {
        [&self.sides[0].user_id, &self.sides[1].user_id]
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.sides.iter().any(|s| s.user_id == user_id)
    }

    pub fn side(&self, user_id: &str) -> Option<&Side> {
        self.sides.iter().find(|s| s.user_id == user_id)
    }

    pub fn opponent_of(&self, user_id: &str) -> Option<&Side> {
        let idx = self.sides.iter().position(|s| s.user_id == user_id)?;
        Some(&self.sides[1 - idx])
    }

    pub fn has_in_flight(&self) -> bool {
        self.sides.iter().any(|s| s.run_in_flight || s.submit_in_flight)
    }

    /// The user who won, derived from the outcome.
    pub fn winner(&self) -> Option<&str> {
        match self.outcome()? {
            Outcome::Win { winner } => Some(winner),
            Outcome::Forfeit { loser } => self.opponent_of(loser).map(|s| s.user_id.as_str()),
            Outcome::Draw => None,
        }
    }

    pub fn result_for(&self, user_id: &str) -> Option<PlayerResult> {
        self.outcome()?;
        Some(match self.winner() {
            Some(winner) if winner == user_id => PlayerResult::Won,
            Some(_) => PlayerResult::Lost,
            None => PlayerResult::Draw,
        })
    }

    fn index_of(&self, user_id: &str) -> Result<usize, BattleError> {
        self.sides
            .iter()
            .position(|s| s.user_id == user_id)
            .ok_or_else(|| BattleError::NotParticipant {
                battle_id: self.id.clone(),
                user_id: user_id.to_string(),
            })
    }

    fn require_in_progress(&self) -> Result<(), BattleError> {
        if self.resolution.is_some() {
            return Err(BattleError::Finished);
        }
        match self.state {
            BattleState::InProgress => Ok(()),
            BattleState::PendingStart => Err(BattleError::NotStarted),
            _ => Err(BattleError::Finished),
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// End the countdown and start the clock.
    pub fn start(&mut self, now: Instant, now_ms: u64) -> Result<(), BattleError> {
        if self.resolution.is_some() {
            return Err(BattleError::Finished);
        }
        if self.state != BattleState::PendingStart {
            return Err(BattleError::AlreadyStarted);
        }
        self.state = BattleState::InProgress;
        self.started_at = Some(now);
        self.started_at_ms = Some(now_ms);
        self.next_seq();
        Ok(())
    }

    /// Whether `begin_run` would succeed, without reserving anything.
    pub fn check_run(&self, user_id: &str) -> Result<(), BattleError> {
        let idx = self.index_of(user_id)?;
        self.require_in_progress()?;
        if self.sides[idx].run_in_flight {
            return Err(BattleError::RunInFlight);
        }
        Ok(())
    }

    pub fn begin_run(&mut self, user_id: &str) -> Result<(), BattleError> {
        self.check_run(user_id)?;
        let idx = self.index_of(user_id)?;
        self.sides[idx].run_in_flight = true;
        self.next_seq();
        Ok(())
    }

    /// Clear the run slot. Allowed in any state.
    pub fn complete_run(&mut self, user_id: &str) -> Result<(), BattleError> {
        let idx = self.index_of(user_id)?;
        let side = &mut self.sides[idx];
        if !side.run_in_flight {
            return Err(BattleError::NothingPending("run"));
        }
        side.run_in_flight = false;
        self.next_seq();
        Ok(())
    }

    pub fn check_submit(&self, user_id: &str) -> Result<(), BattleError> {
        let idx = self.index_of(user_id)?;
        self.require_in_progress()?;
        let side = &self.sides[idx];
        if side.is_accepted() {
            return Err(BattleError::AlreadyAccepted);
        }
        if side.forfeited.is_some() {
            return Err(BattleError::AlreadyForfeited);
        }
        if side.submit_in_flight {
            return Err(BattleError::SubmitInFlight);
        }
        Ok(())
    }

    /// Reserve the submit slot and store the code. Returns the attempt number.
    pub fn begin_submit(
        &mut self,
        user_id: &str,
        code: &str,
        language: &str,
        now: Instant,
    ) -> Result<u32, BattleError> {
        self.check_submit(user_id)?;
        let idx = self.index_of(user_id)?;
        let side = &mut self.sides[idx];
        let attempt = side.submissions.len() as u32 + 1;
        side.submit_in_flight = true;
        side.last_submitted_code = Some(code.to_string());
        side.last_language = Some(language.to_string());
        side.submissions.push(SubmissionEntry {
            attempt,
            language: language.to_string(),
            status: None,
            passed: 0,
            total: 0,
            submitted_at: now,
            completed_at: None,
            after_outcome: false,
        });
        self.next_seq();
        Ok(attempt)
    }

    /// Apply a submit verdict. Late verdicts are recorded but inert.
    pub fn complete_submit(
        &mut self,
        user_id: &str,
        report: &JudgeReport,
        now: Instant,
    ) -> Result<SubmitApplied, BattleError> {
        let idx = self.index_of(user_id)?;
        if !self.sides[idx].submit_in_flight {
            return Err(BattleError::NothingPending("submission"));
        }
        let seq = self.next_seq();
        let late = self.resolution.is_some();

        let side = &mut self.sides[idx];
        side.submit_in_flight = false;
        side.submit_result = Some(report.clone());
        let attempt = match side.submissions.last_mut() {
            Some(entry) => {
                entry.status = Some(report.status);
                entry.passed = report.test_cases_passed;
                entry.total = report.total_test_cases;
                entry.completed_at = Some(now);
                entry.after_outcome = late;
                entry.attempt
            }
            None => 0,
        };

        let accepted = report.is_accepted();
        if late || !accepted {
            return Ok(SubmitApplied {
                attempt,
                accepted,
                late,
                resolution: None,
            });
        }

        side.accepted = Some((now, seq));
        let resolution = if self.rules.end_on_first_accept || self.sides[1 - idx].is_decided() {
            Some(self.finalize(self.resolve(), now))
        } else {
            None
        };

        Ok(SubmitApplied {
            attempt,
            accepted,
            late,
            resolution,
        })
    }

    /// Voluntary concession.
    pub fn forfeit(&mut self, user_id: &str, now: Instant) -> Result<Resolution, BattleError> {
        let idx = self.index_of(user_id)?;
        self.require_in_progress()?;
        let side = &mut self.sides[idx];
        if side.is_accepted() {
            return Err(BattleError::AlreadyAccepted);
        }
        if side.forfeited.is_some() {
            return Err(BattleError::AlreadyForfeited);
        }
        side.forfeited = Some(ForfeitKind::Explicit);
        self.next_seq();
        Ok(self.finalize(self.resolve(), now))
    }

    /// Time limit reached. No-op once finalized or before the deadline.
    pub fn expire(&mut self, now: Instant) -> Option<Resolution> {
        if self.resolution.is_some() || self.state != BattleState::InProgress {
            return None;
        }
        if self.deadline().is_some_and(|deadline| now < deadline) {
            return None;
        }
        self.next_seq();
        Some(self.finalize(self.resolve(), now))
    }

    pub fn disconnect(
        &mut self,
        user_id: &str,
        connection_id: ConnectionId,
        now: Instant,
    ) -> Result<DisconnectEffect, BattleError> {
        let idx = self.index_of(user_id)?;
        let finished = self.resolution.is_some();
        let side = &mut self.sides[idx];
        if side.connection_id != Some(connection_id) {
            return Ok(DisconnectEffect {
                changed: false,
                start_grace: false,
            });
        }
        side.connection_id = None;
        side.disconnected_at = Some(now);
        let start_grace = !finished && !side.is_decided();
        self.next_seq();
        Ok(DisconnectEffect {
            changed: true,
            start_grace,
        })
    }

    pub fn reconnect(
        &mut self,
        user_id: &str,
        connection_id: ConnectionId,
        now: Instant,
    ) -> Result<ReconnectEffect, BattleError> {
        let idx = self.index_of(user_id)?;
        let side = &mut self.sides[idx];
        let was_disconnected = side.disconnected_at.take().is_some();
        side.connection_id = Some(connection_id);
        self.next_seq();

        // The opponent's implicit forfeit was waiting on this side's window.
        let opponent = &self.sides[1 - idx];
        let resolution = if was_disconnected
            && self.resolution.is_none()
            && opponent.forfeited == Some(ForfeitKind::GraceExpired)
        {
            Some(self.finalize(self.resolve(), now))
        } else {
            None
        };

        Ok(ReconnectEffect {
            was_disconnected,
            resolution,
        })
    }

    /// The reconnect window for `user_id` lapsed.
    pub fn grace_expired(&mut self, user_id: &str, now: Instant) -> Option<Resolution> {
        let idx = self.index_of(user_id).ok()?;
        if self.resolution.is_some() {
            return None;
        }
        let grace = self.rules.reconnect_grace;
        let side = &mut self.sides[idx];
        let disconnected_at = side.disconnected_at?;
        if now < disconnected_at + grace || side.is_decided() {
            return None;
        }
        side.forfeited = Some(ForfeitKind::GraceExpired);
        self.next_seq();

        let opponent = &self.sides[1 - idx];
        if !opponent.is_decided() && opponent.disconnected_at.is_some() {
            // Held until the opponent's own window resolves.
            return None;
        }
        Some(self.finalize(self.resolve(), now))
    }

    /// Tie-break over the current side states.
    fn resolve(&self) -> Resolution {
        let first_accepted = self
            .sides
            .iter()
            .filter_map(|s| s.accepted.map(|key| (key, s)))
            .min_by_key(|(key, _)| *key);
        if let Some((_, side)) = first_accepted {
            return Resolution {
                outcome: Outcome::Win {
                    winner: side.user_id.clone(),
                },
                reason: EndReason::Accepted,
            };
        }

        match (self.sides[0].forfeited, self.sides[1].forfeited) {
            (Some(_), Some(_)) => Resolution {
                outcome: Outcome::Draw,
                reason: EndReason::BothForfeited,
            },
            (Some(kind), None) => forfeit_resolution(&self.sides[0], kind),
            (None, Some(kind)) => forfeit_resolution(&self.sides[1], kind),
            (None, None) => Resolution {
                outcome: Outcome::Draw,
                reason: EndReason::TimeExpired,
            },
        }
    }

    /// Fix the outcome. Only the first call has any effect.
    fn finalize(&mut self, resolution: Resolution, now: Instant) -> Resolution {
        if let Some(existing) = &self.resolution {
            return existing.clone();
        }
        self.state = match resolution.outcome {
            Outcome::Win { .. } => BattleState::Completed,
            Outcome::Forfeit { .. } => BattleState::Forfeited,
            Outcome::Draw => BattleState::Drawn,
        };
        self.finalized_at = Some(now);
        self.resolution = Some(resolution.clone());
        resolution
    }

    /// State as seen by `user_id`, for resync after reconnect.
    pub fn snapshot(&self, user_id: &str, now: Instant) -> Option<BattleSnapshot> {
        let side = self.side(user_id)?;
        let opponent = self.opponent_of(user_id)?;
        Some(BattleSnapshot {
            battle_id: self.id.clone(),
            problem_id: self.problem_id.clone(),
            state: self.state,
            started_at: self.started_at_ms,
            time_limit_seconds: self.rules.time_limit.as_secs(),
            remaining_seconds: if self.is_finished() {
                0
            } else {
                self.remaining(now).as_secs()
            },
            opponent: Opponent {
                user_id: opponent.user_id.clone(),
                username: opponent.username.clone(),
            },
            opponent_connected: opponent.is_connected(),
            opponent_accepted: opponent.is_accepted(),
            you: SideSnapshot {
                last_code: side.last_submitted_code.clone(),
                last_language: side.last_language.clone(),
                accepted: side.is_accepted(),
                submissions: side.submissions.len(),
                run_in_flight: side.run_in_flight,
                submit_in_flight: side.submit_in_flight,
            },
            outcome: self.outcome().cloned(),
        })
    }
}

fn forfeit_resolution(loser: &Side, kind: ForfeitKind) -> Resolution {
    Resolution {
        outcome: Outcome::Forfeit {
            loser: loser.user_id.clone(),
        },
        reason: match kind {
            ForfeitKind::Explicit => EndReason::Forfeit,
            ForfeitKind::GraceExpired => EndReason::DisconnectGraceExpired,
        },
    }
}
