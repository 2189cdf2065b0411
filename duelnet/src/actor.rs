//! Per-battle actor.
//!
//! Each battle runs as one task that owns its [`Battle`] and drains a single
//! command channel. Client events, judge completions and timer firings all
//! arrive on that channel, so transitions for one battle are strictly
//! serialized while different battles run in parallel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Instrument;

use crate::battle::{Battle, BattleError, EndReason, Outcome, Resolution};
use crate::dispatcher::Shared;
use crate::error::DispatchError;
use crate::judge::{ExecMode, JudgeReport, JudgeRequest, JudgeStatus};
use crate::persistence::{BattleRecord, PersistJob, StatsDelta, SubmissionRecord};
use crate::protocol::{
    now_millis, AttemptKind, AttemptNotification, BattleEnd, BattleFound, BattleStarted,
    ConnectionId, ErrorCode, ErrorEvent, Opponent, OpponentPresence, RunResult, ServerEvent,
    SledgeMessage, SubmitResult, UserId,
};
use crate::ratelimit::LimitedOp;
use crate::registry::{BattleHandle, RegistryError};
use crate::supervisor::{TimerKey, TimerKind};

const SETTLE_POLL: Duration = Duration::from_secs(1);

/// Input to a battle actor.
#[derive(Debug)]
pub enum BattleCommand {
    Run {
        user_id: UserId,
        code: String,
        language: String,
    },
    Submit {
        user_id: UserId,
        code: String,
        language: String,
    },
    Sledge {
        user_id: UserId,
        text: String,
    },
    Forfeit {
        user_id: UserId,
    },
    /// A participant (re)attached on `connection_id`.
    Join {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    Disconnected {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    JudgeDone {
        user_id: UserId,
        mode: ExecMode,
        report: JudgeReport,
    },
    Start,
    Expire,
    GraceExpired {
        user_id: UserId,
    },
    Evict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Register `battle` and spawn its actor.
pub(crate) fn launch(shared: &Arc<Shared>, battle: Battle) -> Result<BattleHandle, RegistryError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let [a, b] = battle.participants();
    let handle = BattleHandle::new(battle.id.clone(), [a.to_string(), b.to_string()], tx.clone());
    shared.registry.insert(handle.clone())?;

    let span = tracing::info_span!(
        "battle",
        battle_id = %battle.id,
        problem_id = %battle.problem_id
    );
    let actor = BattleActor {
        battle,
        shared: Arc::clone(shared),
        tx,
    };
    tokio::spawn(actor.run(rx).instrument(span));
    Ok(handle)
}

struct BattleActor {
    battle: Battle,
    shared: Arc<Shared>,
    /// Own address, handed to judge callbacks.
    tx: mpsc::UnboundedSender<BattleCommand>,
}

impl BattleActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<BattleCommand>) {
        self.announce();
        while let Some(command) = rx.recv().await {
            if self.handle(command) == Flow::Stop {
                break;
            }
        }
        tracing::debug!("battle actor exited");
    }

    fn handle(&mut self, command: BattleCommand) -> Flow {
        let now = Instant::now();
        match command {
            BattleCommand::Run {
                user_id,
                code,
                language,
            } => self.on_run(user_id, code, language),
            BattleCommand::Submit {
                user_id,
                code,
                language,
            } => self.on_submit(user_id, code, language, now),
            BattleCommand::Sledge { user_id, text } => self.on_sledge(&user_id, text),
            BattleCommand::Forfeit { user_id } => match self.battle.forfeit(&user_id, now) {
                Ok(resolution) => self.finish(resolution, now),
                Err(e) => self.reject(&user_id, e),
            },
            BattleCommand::Join {
                user_id,
                connection_id,
            } => self.on_join(&user_id, connection_id, now),
            BattleCommand::Disconnected {
                user_id,
                connection_id,
            } => self.on_disconnect(&user_id, connection_id, now),
            BattleCommand::JudgeDone {
                user_id,
                mode: ExecMode::Run,
                report,
            } => self.on_run_done(&user_id, report),
            BattleCommand::JudgeDone {
                user_id,
                mode: ExecMode::Submit,
                report,
            } => self.on_submit_done(&user_id, report, now),
            BattleCommand::Start => self.on_start(now),
            BattleCommand::Expire => {
                if let Some(resolution) = self.battle.expire(now) {
                    self.finish(resolution, now);
                }
            }
            BattleCommand::GraceExpired { user_id } => {
                if let Some(resolution) = self.battle.grace_expired(&user_id, now) {
                    self.finish(resolution, now);
                }
            }
            BattleCommand::Evict => return self.on_evict(now),
        }
        Flow::Continue
    }

    fn key(&self, kind: TimerKind) -> TimerKey {
        TimerKey::new(self.battle.id.clone(), kind)
    }

    fn send(&self, user_id: &str, event: ServerEvent) {
        if !self.shared.connections.send(user_id, event) {
            tracing::trace!(user_id, "participant offline, event dropped");
        }
    }

    fn send_both(&self, event: ServerEvent) {
        for user_id in self.battle.participants() {
            self.send(user_id, event.clone());
        }
    }

    fn opponent_id(&self, user_id: &str) -> Option<UserId> {
        self.battle.opponent_of(user_id).map(|s| s.user_id.clone())
    }

    fn send_error(&self, user_id: &str, code: ErrorCode, message: impl Into<String>) {
        self.send(
            user_id,
            ServerEvent::Error(ErrorEvent {
                code,
                message: message.into(),
                battle_id: Some(self.battle.id.clone()),
                retry_after_ms: None,
                waited_seconds: None,
            }),
        );
    }

    /// Take a token for `op`. Only called once the attempt is known to be
    /// accepted, so a rejected attempt costs nothing.
    fn charge(&self, op: LimitedOp, user_id: &str) -> bool {
        let result = self.shared.limits.check(op, user_id);
        if !result.allowed {
            let retry_after_ms = result.retry_after_ms();
            tracing::debug!(user_id, ?op, retry_after_ms, "attempt rate limited");
            self.send(
                user_id,
                ServerEvent::Error(ErrorEvent {
                    code: ErrorCode::RateLimited,
                    message: DispatchError::RateLimited { retry_after_ms }.to_string(),
                    battle_id: Some(self.battle.id.clone()),
                    retry_after_ms: Some(retry_after_ms),
                    waited_seconds: None,
                }),
            );
        }
        result.allowed
    }

    fn reject(&self, user_id: &str, error: BattleError) {
        let code = match error {
            BattleError::NotParticipant { .. } => ErrorCode::Unauthorized,
            _ => ErrorCode::InvalidState,
        };
        tracing::debug!(user_id, error = %error, "command rejected");
        self.send_error(user_id, code, error.to_string());
    }

    /// `battle_found` to both sides, then the start countdown.
    fn announce(&self) {
        let start_delay = self.shared.config.battle.start_delay();
        let start_time = now_millis() + start_delay.as_millis() as u64;
        let time_limit_seconds = self.battle.rules().time_limit.as_secs();
        for side in self.battle.sides() {
            let Some(opponent) = self.battle.opponent_of(&side.user_id) else {
                continue;
            };
            self.send(
                &side.user_id,
                ServerEvent::BattleFound(BattleFound {
                    battle_id: self.battle.id.clone(),
                    opponent: Opponent {
                        user_id: opponent.user_id.clone(),
                        username: opponent.username.clone(),
                    },
                    problem_id: self.battle.problem_id.clone(),
                    start_time,
                    time_limit_seconds,
                }),
            );
        }
        let [a, b] = self.battle.participants();
        tracing::info!(player_a = a, player_b = b, "battle created");
        self.shared.timers.schedule(
            self.key(TimerKind::Start),
            self.battle.created_at() + start_delay,
        );
    }

    fn on_start(&mut self, now: Instant) {
        let started_at = now_millis();
        if let Err(e) = self.battle.start(now, started_at) {
            tracing::debug!(error = %e, "start skipped");
            return;
        }
        self.send_both(ServerEvent::BattleStarted(BattleStarted {
            battle_id: self.battle.id.clone(),
            started_at,
            time_limit_seconds: self.battle.rules().time_limit.as_secs(),
        }));
        if let Some(deadline) = self.battle.deadline() {
            self.shared.timers.schedule(self.key(TimerKind::Expiry), deadline);
        }
        tracing::info!("battle started");
    }

    fn notify_attempt(&self, user_id: &str, kind: AttemptKind) {
        if let Some(opponent) = self.opponent_id(user_id) {
            self.send(
                &opponent,
                ServerEvent::AttemptNotification(AttemptNotification {
                    battle_id: self.battle.id.clone(),
                    side: user_id.to_string(),
                    kind,
                }),
            );
        }
    }

    fn dispatch_judge(&self, user_id: UserId, mode: ExecMode, code: String, language: String) {
        let request = JudgeRequest {
            mode,
            problem_id: self.battle.problem_id.clone(),
            language,
            code,
        };
        let tx = self.tx.clone();
        self.shared.judge.dispatch(request, move |report| {
            let _ = tx.send(BattleCommand::JudgeDone {
                user_id,
                mode,
                report,
            });
        });
    }

    fn on_run(&mut self, user_id: UserId, code: String, language: String) {
        if let Err(e) = self.battle.check_run(&user_id) {
            return self.reject(&user_id, e);
        }
        if !self.charge(LimitedOp::Run, &user_id) {
            return;
        }
        if let Err(e) = self.battle.begin_run(&user_id) {
            return self.reject(&user_id, e);
        }
        self.notify_attempt(&user_id, AttemptKind::Run);
        self.dispatch_judge(user_id, ExecMode::Run, code, language);
    }

    fn on_submit(&mut self, user_id: UserId, code: String, language: String, now: Instant) {
        if let Err(e) = self.battle.check_submit(&user_id) {
            return self.reject(&user_id, e);
        }
        if !self.charge(LimitedOp::Submit, &user_id) {
            return;
        }
        match self.battle.begin_submit(&user_id, &code, &language, now) {
            Ok(attempt) => {
                tracing::debug!(user_id = %user_id, attempt, "submission dispatched");
                self.notify_attempt(&user_id, AttemptKind::Submit);
                self.dispatch_judge(user_id, ExecMode::Submit, code, language);
            }
            Err(e) => self.reject(&user_id, e),
        }
    }

    fn on_run_done(&mut self, user_id: &str, report: JudgeReport) {
        if let Err(e) = self.battle.complete_run(user_id) {
            tracing::warn!(user_id, error = %e, "unexpected run completion");
            return;
        }
        if report.status == JudgeStatus::Error {
            self.send_error(
                user_id,
                ErrorCode::JudgeError,
                report.error_message.clone().unwrap_or_else(|| "judge unavailable".into()),
            );
        }
        self.send(
            user_id,
            ServerEvent::RunResult(RunResult {
                battle_id: self.battle.id.clone(),
                result: report,
            }),
        );
    }

    fn on_submit_done(&mut self, user_id: &str, report: JudgeReport, now: Instant) {
        let applied = match self.battle.complete_submit(user_id, &report, now) {
            Ok(applied) => applied,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "unexpected submit completion");
                return;
            }
        };
        tracing::info!(
            user_id,
            attempt = applied.attempt,
            status = ?report.status,
            late = applied.late,
            "submission judged"
        );

        if report.status == JudgeStatus::Error {
            self.send_error(
                user_id,
                ErrorCode::JudgeError,
                report.error_message.clone().unwrap_or_else(|| "judge unavailable".into()),
            );
        }
        if !applied.late {
            self.send_both(ServerEvent::SubmitResult(SubmitResult {
                battle_id: self.battle.id.clone(),
                user_id: user_id.to_string(),
                pass_summary: report.summary(applied.attempt),
            }));
        }

        let side = self.battle.side(user_id);
        self.shared.persistence.submit(PersistJob::Submission(SubmissionRecord {
            battle_id: self.battle.id.clone(),
            user_id: user_id.to_string(),
            problem_id: self.battle.problem_id.clone(),
            language: side.and_then(|s| s.last_language.clone()).unwrap_or_default(),
            code: side.and_then(|s| s.last_submitted_code.clone()).unwrap_or_default(),
            attempt: applied.attempt,
            status: report.status,
            passed: report.test_cases_passed,
            total: report.total_test_cases,
            runtime_ms: report.runtime_ms,
            memory_kb: report.memory_kb,
            after_outcome: applied.late,
            recorded_at: now_millis(),
        }));
        self.shared.persistence.submit(PersistJob::Stats(StatsDelta {
            user_id: user_id.to_string(),
            submissions: 1,
            accepted: u32::from(applied.accepted),
            ..Default::default()
        }));

        if let Some(resolution) = applied.resolution {
            self.finish(resolution, now);
        }
    }

    fn on_sledge(&self, user_id: &str, text: String) {
        if !self.battle.is_participant(user_id) {
            return self.send_error(user_id, ErrorCode::Unauthorized, "not a participant");
        }
        if self.battle.is_finished() {
            return self.reject(user_id, BattleError::Finished);
        }
        let from_username = self
            .battle
            .side(user_id)
            .map(|s| s.username.clone())
            .unwrap_or_default();
        self.send_both(ServerEvent::Sledge(SledgeMessage {
            battle_id: self.battle.id.clone(),
            from_user_id: user_id.to_string(),
            from_username,
            text,
            timestamp: now_millis(),
        }));
    }

    fn on_join(&mut self, user_id: &str, connection_id: ConnectionId, now: Instant) {
        let effect = match self.battle.reconnect(user_id, connection_id, now) {
            Ok(effect) => effect,
            Err(e) => return self.reject(user_id, e),
        };

        if effect.was_disconnected {
            self.shared
                .timers
                .cancel(self.key(TimerKind::Grace(user_id.to_string())));
            tracing::info!(user_id, connection_id, "participant reconnected");
            if !self.battle.is_finished() {
                if let Some(opponent) = self.opponent_id(user_id) {
                    self.send(
                        &opponent,
                        ServerEvent::OpponentReconnected(OpponentPresence {
                            battle_id: self.battle.id.clone(),
                            user_id: user_id.to_string(),
                            grace_seconds: None,
                        }),
                    );
                }
            }
        }

        if let Some(snapshot) = self.battle.snapshot(user_id, now) {
            self.send(user_id, ServerEvent::BattleState(snapshot));
        }

        if let Some(resolution) = effect.resolution {
            self.finish(resolution, now);
        } else if self.battle.is_finished() {
            if let Some(end) = self.battle_end_for(user_id) {
                self.send(user_id, ServerEvent::BattleEnd(end));
            }
        }
    }

    fn on_disconnect(&mut self, user_id: &str, connection_id: ConnectionId, now: Instant) {
        let effect = match self.battle.disconnect(user_id, connection_id, now) {
            Ok(effect) => effect,
            Err(e) => {
                tracing::debug!(user_id, error = %e, "disconnect for unknown side");
                return;
            }
        };
        if !effect.changed {
            return;
        }
        tracing::info!(
            user_id,
            connection_id,
            grace = effect.start_grace,
            "participant disconnected"
        );
        if self.battle.is_finished() {
            return;
        }

        let grace = self.battle.rules().reconnect_grace;
        if let Some(opponent) = self.opponent_id(user_id) {
            self.send(
                &opponent,
                ServerEvent::OpponentDisconnected(OpponentPresence {
                    battle_id: self.battle.id.clone(),
                    user_id: user_id.to_string(),
                    grace_seconds: effect.start_grace.then(|| grace.as_secs()),
                }),
            );
        }
        if effect.start_grace {
            self.shared
                .timers
                .schedule(self.key(TimerKind::Grace(user_id.to_string())), now + grace);
        }
    }

    fn battle_end_for(&self, user_id: &str) -> Option<BattleEnd> {
        let resolution = self.battle.resolution()?;
        Some(BattleEnd {
            battle_id: self.battle.id.clone(),
            outcome: resolution.outcome.clone(),
            reason: resolution.reason,
            result: self.battle.result_for(user_id)?,
            opponent_name: self
                .battle
                .opponent_of(user_id)
                .map(|s| s.username.clone())
                .unwrap_or_default(),
        })
    }

    /// Announce a fixed outcome and hand the participants back.
    fn finish(&mut self, resolution: Resolution, now: Instant) {
        let timers = &self.shared.timers;
        timers.cancel(self.key(TimerKind::Start));
        timers.cancel(self.key(TimerKind::Expiry));
        for user_id in self.battle.participants() {
            timers.cancel(self.key(TimerKind::Grace(user_id.to_string())));
        }
        self.shared.registry.release(&self.battle.id);

        if resolution.reason == EndReason::DisconnectGraceExpired {
            if let Outcome::Forfeit { loser } = &resolution.outcome {
                self.send_error(
                    loser,
                    ErrorCode::DisconnectGraceExpired,
                    "reconnect window expired",
                );
            }
        }
        for user_id in self.battle.participants() {
            if let Some(end) = self.battle_end_for(user_id) {
                self.send(user_id, ServerEvent::BattleEnd(end));
            }
        }

        let winner = self.battle.winner().map(str::to_string);
        let [a, b] = self.battle.participants();
        let participants = [a.to_string(), b.to_string()];
        for user_id in &participants {
            self.shared.persistence.submit(PersistJob::Stats(StatsDelta {
                user_id: user_id.clone(),
                battles_played: 1,
                battles_won: u32::from(winner.as_deref() == Some(user_id.as_str())),
                ..Default::default()
            }));
        }
        self.shared.persistence.submit(PersistJob::Battle(BattleRecord {
            battle_id: self.battle.id.clone(),
            problem_id: self.battle.problem_id.clone(),
            participants,
            outcome: resolution.outcome.clone(),
            reason: resolution.reason,
            winner: winner.clone(),
            ended_at: now_millis(),
        }));

        tracing::info!(
            outcome = ?resolution.outcome,
            reason = ?resolution.reason,
            winner = winner.as_deref().unwrap_or("-"),
            "battle ended"
        );
        self.shared.timers.schedule(
            self.key(TimerKind::Evict),
            now + self.shared.config.battle.post_battle_grace(),
        );
    }

    fn on_evict(&mut self, now: Instant) -> Flow {
        let Some(finalized_at) = self.battle.finalized_at() else {
            return Flow::Continue;
        };
        let battle_config = &self.shared.config.battle;
        let settle_deadline =
            finalized_at + battle_config.post_battle_grace() + battle_config.settle_timeout();
        if self.battle.has_in_flight() && now < settle_deadline {
            self.shared
                .timers
                .schedule(self.key(TimerKind::Evict), now + SETTLE_POLL);
            return Flow::Continue;
        }
        if self.battle.has_in_flight() {
            tracing::warn!("evicting with judge calls still in flight");
        }
        self.shared.registry.remove(&self.battle.id);
        tracing::debug!("battle evicted");
        Flow::Stop
    }
}
