//! Protocol dispatcher and orchestrator entry point.
//!
//! [`Orchestrator`] owns the shared services, authorizes every client event
//! against the session registry and forwards battle events to the owning
//! battle actor. Queue events are handled here directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::actor::{self, BattleCommand};
use crate::battle::{Battle, BattleRules, Participant};
use crate::config::Config;
use crate::connection::{ConnectionRegistry, OutboundTx};
use crate::error::{DispatchError, Result};
use crate::identity::Identity;
use crate::judge::{Judge, JudgeGateway};
use crate::matchmaker::{Matchmaker, QueueEntry};
use crate::persistence::{spawn_persistence_worker, BattleStore, PersistenceHandle};
use crate::protocol::{
    BattleId, ClientEvent, CodePayload, ConnectionId, ErrorCode, ErrorEvent, QueueStatus,
    ServerEvent,
};
use crate::ratelimit::{LimitedOp, OperationRateLimiter};
use crate::registry::{BattleHandle, RegistryError, SessionRegistry};
use crate::supervisor::{Supervisor, TimerHandle};

/// Services shared by the dispatcher, battle actors and the supervisor.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) connections: ConnectionRegistry,
    pub(crate) matchmaker: Matchmaker,
    pub(crate) registry: SessionRegistry,
    pub(crate) judge: JudgeGateway,
    pub(crate) store: Arc<dyn BattleStore>,
    pub(crate) persistence: PersistenceHandle,
    pub(crate) timers: TimerHandle,
    pub(crate) limits: OperationRateLimiter,
}

/// Battle orchestrator handle. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

type DispatchResult = std::result::Result<(), DispatchError>;

impl Orchestrator {
    /// Validate `config` and spawn the supervisor and persistence worker.
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: Config,
        judge: Arc<dyn Judge>,
        store: Arc<dyn BattleStore>,
    ) -> Result<Self> {
        config.validate()?;

        let (persistence, _worker) =
            spawn_persistence_worker(Arc::clone(&store), &config.persistence);
        let (timers, timer_rx) = TimerHandle::channel();
        let shared = Arc::new(Shared {
            connections: ConnectionRegistry::new(),
            matchmaker: Matchmaker::new(config.queue.timeout()),
            registry: SessionRegistry::new(),
            judge: JudgeGateway::new(judge, config.judge.timeout()),
            limits: OperationRateLimiter::new(&config.limits),
            store,
            persistence,
            timers,
            config,
        });

        let supervisor = Supervisor::new(timer_rx, Arc::downgrade(&shared));
        tokio::spawn(supervisor.run(
            shared.config.queue.poll_interval(),
            shared.config.queue.status_interval(),
        ));

        tracing::info!(
            time_limit_secs = shared.config.battle.time_limit_secs,
            queue_timeout_secs = shared.config.queue.timeout_secs,
            "orchestrator started"
        );
        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.shared.connections
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.shared.registry
    }

    pub fn matchmaker(&self) -> &Matchmaker {
        &self.shared.matchmaker
    }

    /// Judge calls currently outstanding across all battles.
    pub fn judge_in_flight(&self) -> usize {
        self.shared.judge.in_flight()
    }

    /// Stop the supervisor. Running battles keep their state but no timer fires.
    pub fn shutdown(&self) {
        self.shared.timers.shutdown();
    }

    /// Attach an authenticated connection. A previous connection for the same
    /// user is told `session_replaced` and closed; an active or recent battle
    /// follows the user to the new connection.
    pub fn connect(&self, identity: &Identity, tx: OutboundTx) -> ConnectionId {
        let (connection_id, replaced) =
            self.shared
                .connections
                .register(identity.user_id.clone(), identity.username.clone(), tx);

        if let Some(old) = replaced {
            tracing::info!(
                user_id = %identity.user_id,
                old = old.id,
                new = connection_id,
                "session replaced"
            );
            old.send(ServerEvent::SessionReplaced);
            old.close();
        }

        self.shared.matchmaker.rebind(&identity.user_id, connection_id);
        if let Some(handle) = self.shared.registry.battle_for(&identity.user_id) {
            handle.send(BattleCommand::Join {
                user_id: identity.user_id.clone(),
                connection_id,
            });
        }
        tracing::debug!(user_id = %identity.user_id, connection_id, "connected");
        connection_id
    }

    /// Detach a closed connection. Ignored if a newer connection took over.
    pub fn disconnect(&self, user_id: &str, connection_id: ConnectionId) {
        if !self.shared.connections.unregister(user_id, connection_id) {
            return;
        }
        if self.shared.matchmaker.dequeue(user_id).is_some() {
            tracing::debug!(user_id, "left queue on disconnect");
        }
        if let Some(handle) = self.shared.registry.battle_for(user_id) {
            handle.send(BattleCommand::Disconnected {
                user_id: user_id.to_string(),
                connection_id,
            });
        }
        tracing::debug!(user_id, connection_id, "disconnected");
    }

    /// Decode and handle one text frame. Malformed input is answered with
    /// `INVALID_PAYLOAD` and otherwise ignored.
    pub async fn handle_text(&self, user_id: &str, connection_id: ConnectionId, text: &str) {
        match ClientEvent::decode(text) {
            Ok(event) => self.handle(user_id, connection_id, event).await,
            Err(e) => {
                tracing::debug!(user_id, error = %e, "malformed frame");
                self.send_error(user_id, &DispatchError::invalid_payload(e.to_string()), None);
            }
        }
    }

    pub async fn handle(&self, user_id: &str, connection_id: ConnectionId, event: ClientEvent) {
        if !self.shared.connections.is_current(user_id, connection_id) {
            tracing::debug!(user_id, connection_id, "event from superseded connection");
            return;
        }
        let name = event.name();
        let battle_id = event.battle_id().map(str::to_string);
        if let Err(e) = self.route(user_id, connection_id, event).await {
            tracing::debug!(user_id, event = name, error = %e, "event rejected");
            self.send_error(user_id, &e, battle_id);
        }
    }

    async fn route(
        &self,
        user_id: &str,
        connection_id: ConnectionId,
        event: ClientEvent,
    ) -> DispatchResult {
        match event {
            ClientEvent::JoinQueue => self.join_queue(user_id, connection_id).await,
            ClientEvent::LeaveQueue => {
                self.leave_queue(user_id);
                Ok(())
            }
            ClientEvent::JoinBattle(target) => {
                let handle = self.authorize(user_id, &target.battle_id)?;
                forward(
                    &handle,
                    BattleCommand::Join {
                        user_id: user_id.to_string(),
                        connection_id,
                    },
                )
            }
            ClientEvent::RunCode(payload) => {
                let handle = self.authorize(user_id, &payload.battle_id)?;
                self.validate_code(&payload)?;
                forward(
                    &handle,
                    BattleCommand::Run {
                        user_id: user_id.to_string(),
                        code: payload.code,
                        language: payload.language,
                    },
                )
            }
            ClientEvent::SubmitCode(payload) => {
                let handle = self.authorize(user_id, &payload.battle_id)?;
                self.validate_code(&payload)?;
                forward(
                    &handle,
                    BattleCommand::Submit {
                        user_id: user_id.to_string(),
                        code: payload.code,
                        language: payload.language,
                    },
                )
            }
            ClientEvent::Sledge(payload) => {
                let handle = self.authorize(user_id, &payload.battle_id)?;
                let text = payload.message.trim();
                let max = self.shared.config.limits.max_sledge_len;
                let len = text.chars().count();
                if len == 0 || len > max {
                    return Err(DispatchError::invalid_payload(format!(
                        "message must be 1..={} characters",
                        max
                    )));
                }
                self.check_limit(LimitedOp::Sledge, &format!("{}:{}", user_id, handle.battle_id))?;
                forward(
                    &handle,
                    BattleCommand::Sledge {
                        user_id: user_id.to_string(),
                        text: text.to_string(),
                    },
                )
            }
            ClientEvent::ForfeitBattle(target) => {
                let handle = self.authorize(user_id, &target.battle_id)?;
                forward(
                    &handle,
                    BattleCommand::Forfeit {
                        user_id: user_id.to_string(),
                    },
                )
            }
        }
    }

    /// Unknown battles and foreign battles look the same to the caller.
    fn authorize(
        &self,
        user_id: &str,
        battle_id: &str,
    ) -> std::result::Result<BattleHandle, DispatchError> {
        match self.shared.registry.get(battle_id) {
            Some(handle) if handle.is_participant(user_id) => Ok(handle),
            _ => Err(DispatchError::unauthorized(battle_id)),
        }
    }

    fn validate_code(&self, payload: &CodePayload) -> DispatchResult {
        let max = self.shared.config.limits.max_code_len;
        if payload.code.trim().is_empty() {
            return Err(DispatchError::invalid_payload("code is empty"));
        }
        if payload.code.len() > max {
            return Err(DispatchError::invalid_payload(format!(
                "code exceeds {} bytes",
                max
            )));
        }
        if payload.language.trim().is_empty() {
            return Err(DispatchError::invalid_payload("language is required"));
        }
        Ok(())
    }

    fn check_limit(&self, op: LimitedOp, key: &str) -> DispatchResult {
        let result = self.shared.limits.check(op, key);
        if result.allowed {
            Ok(())
        } else {
            Err(DispatchError::RateLimited {
                retry_after_ms: result.retry_after_ms(),
            })
        }
    }

    fn send_error(&self, user_id: &str, error: &DispatchError, battle_id: Option<BattleId>) {
        let retry_after_ms = match error {
            DispatchError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        };
        self.shared.connections.send(
            user_id,
            ServerEvent::Error(ErrorEvent {
                code: error.code(),
                message: error.to_string(),
                battle_id,
                retry_after_ms,
                waited_seconds: None,
            }),
        );
    }

    async fn join_queue(&self, user_id: &str, connection_id: ConnectionId) -> DispatchResult {
        if self.shared.registry.is_active(user_id) {
            return Err(DispatchError::AlreadyActive);
        }
        let username = self
            .shared
            .connections
            .username(user_id)
            .unwrap_or_else(|| user_id.to_string());
        let position = self
            .shared
            .matchmaker
            .enqueue(user_id, username, connection_id, Instant::now())
            .map_err(|_| DispatchError::AlreadyActive)?;

        tracing::debug!(user_id, position, "joined queue");
        self.shared.connections.send(
            user_id,
            ServerEvent::QueueStatus(QueueStatus {
                users_in_queue: self.shared.matchmaker.len(),
                position: Some(position),
            }),
        );
        self.pair_waiting().await;
        Ok(())
    }

    fn leave_queue(&self, user_id: &str) {
        if self.shared.matchmaker.dequeue(user_id).is_some() {
            tracing::debug!(user_id, "left queue");
        }
        self.shared.connections.send(
            user_id,
            ServerEvent::QueueStatus(QueueStatus {
                users_in_queue: self.shared.matchmaker.len(),
                position: None,
            }),
        );
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.shared.matchmaker.len()
    }

    /// Notify and drop every queue entry past the queue timeout.
    pub(crate) fn sweep_queue(&self, now: Instant) {
        for entry in self.shared.matchmaker.evict_expired(now) {
            let waited = entry.waited(now).as_secs();
            tracing::info!(user_id = %entry.user_id, waited_secs = waited, "queue timeout");
            self.shared.connections.send(
                &entry.user_id,
                ServerEvent::Error(ErrorEvent {
                    code: ErrorCode::QueueTimeout,
                    message: "no opponent found".to_string(),
                    battle_id: None,
                    retry_after_ms: None,
                    waited_seconds: Some(waited),
                }),
            );
        }
    }

    pub(crate) fn broadcast_queue_status(&self) {
        let event = ServerEvent::QueueStatus(QueueStatus {
            users_in_queue: self.shared.matchmaker.len(),
            position: None,
        });
        self.shared.connections.broadcast(&event);
    }

    pub(crate) fn cleanup_limits(&self, max_idle: Duration) {
        self.shared.limits.cleanup(max_idle);
    }

    /// Still connected, still queued and not already fighting. Picks up the
    /// user's current connection id.
    fn refresh(&self, mut entry: QueueEntry) -> Option<QueueEntry> {
        let user_id = entry.user_id.as_str();
        let current = self.shared.connections.current(user_id).filter(|_| {
            !self.shared.matchmaker.is_withdrawn(user_id)
                && !self.shared.registry.is_active(user_id)
        });
        match current {
            Some(connection_id) => {
                entry.connection_id = connection_id;
                Some(entry)
            }
            None => {
                tracing::debug!(user_id, "pair member dropped before battle");
                self.shared.matchmaker.abandon(user_id);
                None
            }
        }
    }

    fn refresh_pair(&self, a: QueueEntry, b: QueueEntry) -> Option<(QueueEntry, QueueEntry)> {
        match (self.refresh(a), self.refresh(b)) {
            (Some(a), Some(b)) => Some((a, b)),
            (Some(survivor), None) | (None, Some(survivor)) => {
                self.shared.matchmaker.requeue_front(survivor);
                None
            }
            (None, None) => None,
        }
    }

    /// Close the pairing window. A side that left the queue since the last
    /// refresh sends the other back to the head.
    fn commit_pair(&self, a: QueueEntry, b: QueueEntry) -> Option<(QueueEntry, QueueEntry)> {
        match self.shared.matchmaker.commit_pair(&a.user_id, &b.user_id) {
            (true, true) => Some((a, b)),
            (true, false) => {
                self.shared.matchmaker.requeue_front(a);
                None
            }
            (false, true) => {
                self.shared.matchmaker.requeue_front(b);
                None
            }
            (false, false) => None,
        }
    }

    /// Pair the queue head two at a time until fewer than two remain.
    pub(crate) async fn pair_waiting(&self) {
        while let Some((a, b)) = self.shared.matchmaker.pop_pair() {
            let Some((a, b)) = self.refresh_pair(a, b) else {
                continue;
            };

            let problem_id = match self.shared.store.random_problem_id().await {
                Ok(problem_id) => problem_id,
                Err(e) => {
                    tracing::error!(error = %e, "no problem for new battle, pairing deferred");
                    self.shared.matchmaker.requeue_front(a);
                    self.shared.matchmaker.requeue_front(b);
                    break;
                }
            };

            let Some((a, b)) = self
                .refresh_pair(a, b)
                .and_then(|(a, b)| self.commit_pair(a, b))
            else {
                continue;
            };
            self.create_battle(a, b, problem_id);
        }
    }

    fn create_battle(&self, a: QueueEntry, b: QueueEntry, problem_id: String) {
        let battle = Battle::new(
            Uuid::new_v4().to_string(),
            problem_id,
            [participant(&a), participant(&b)],
            BattleRules::from(&self.shared.config.battle),
            Instant::now(),
        );

        match actor::launch(&self.shared, battle) {
            Ok(handle) => {
                // Either side may have re-joined the queue while the problem was picked.
                self.shared.matchmaker.dequeue(&a.user_id);
                self.shared.matchmaker.dequeue(&b.user_id);
                tracing::debug!(battle_id = %handle.battle_id, "pair launched");
            }
            Err(RegistryError::AlreadyActive(busy)) => {
                tracing::warn!(user_id = %busy, "pair member became active, requeueing partner");
                for entry in [a, b] {
                    if entry.user_id != busy {
                        self.shared.matchmaker.requeue_front(entry);
                    }
                }
            }
            Err(e @ RegistryError::DuplicateBattle(_)) => {
                tracing::error!(error = %e, "battle id collision, requeueing pair");
                self.shared.matchmaker.requeue_front(a);
                self.shared.matchmaker.requeue_front(b);
            }
        }
    }
}

fn participant(entry: &QueueEntry) -> Participant {
    Participant {
        user_id: entry.user_id.clone(),
        username: entry.username.clone(),
        connection_id: entry.connection_id,
    }
}

fn forward(handle: &BattleHandle, command: BattleCommand) -> DispatchResult {
    if handle.send(command) {
        Ok(())
    } else {
        Err(DispatchError::invalid_state("battle is over"))
    }
}
