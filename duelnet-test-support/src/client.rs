//! In-memory client attached straight to an [`Orchestrator`].
//!
//! Events go in through [`Orchestrator::handle`] and come back on the
//! connection's outbound channel, so tests exercise everything above the
//! socket without binding a port.

use std::time::Duration;

use duelnet::battle::Outcome;
use duelnet::protocol::{
    BattleEnd, BattleFound, BattleRef, BattleSnapshot, CodePayload, ConnectionId, ErrorEvent,
    SledgePayload, SubmitResult,
};
use duelnet::{ClientEvent, ErrorCode, Identity, Orchestrator, Outbound, OutboundRx, ServerEvent};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Virtual time allowed for an expected event to show up.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(3600);

pub struct TestClient {
    pub user_id: String,
    pub username: String,
    pub connection_id: ConnectionId,
    orchestrator: Orchestrator,
    rx: OutboundRx,
    history: Vec<ServerEvent>,
    closed: bool,
    wait: Duration,
}

impl TestClient {
    pub fn connect(orchestrator: &Orchestrator, user_id: &str, username: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = orchestrator.connect(&Identity::new(user_id, username), tx);
        Self {
            user_id: user_id.to_string(),
            username: username.to_string(),
            connection_id,
            orchestrator: orchestrator.clone(),
            rx,
            history: Vec::new(),
            closed: false,
            wait: DEFAULT_WAIT,
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Open a second connection for the same user.
    pub fn reconnect(&self) -> Self {
        Self::connect(&self.orchestrator, &self.user_id, &self.username).with_wait(self.wait)
    }

    /// Close this connection as the transport would.
    pub fn disconnect(&self) {
        self.orchestrator.disconnect(&self.user_id, self.connection_id);
    }

    pub async fn send(&self, event: ClientEvent) {
        self.orchestrator
            .handle(&self.user_id, self.connection_id, event)
            .await;
    }

    pub async fn send_text(&self, text: &str) {
        self.orchestrator
            .handle_text(&self.user_id, self.connection_id, text)
            .await;
    }

    pub async fn join_queue(&self) {
        self.send(ClientEvent::JoinQueue).await;
    }

    pub async fn leave_queue(&self) {
        self.send(ClientEvent::LeaveQueue).await;
    }

    pub async fn join_battle(&self, battle_id: &str) {
        self.send(ClientEvent::JoinBattle(BattleRef {
            battle_id: battle_id.to_string(),
        }))
        .await;
    }

    pub async fn run(&self, battle_id: &str, code: &str) {
        self.send(ClientEvent::RunCode(code_payload(battle_id, code)))
            .await;
    }

    pub async fn submit(&self, battle_id: &str, code: &str) {
        self.send(ClientEvent::SubmitCode(code_payload(battle_id, code)))
            .await;
    }

    pub async fn sledge(&self, battle_id: &str, message: &str) {
        self.send(ClientEvent::Sledge(SledgePayload {
            battle_id: battle_id.to_string(),
            message: message.to_string(),
        }))
        .await;
    }

    pub async fn forfeit(&self, battle_id: &str) {
        self.send(ClientEvent::ForfeitBattle(BattleRef {
            battle_id: battle_id.to_string(),
        }))
        .await;
    }

    /// Every event received so far.
    pub fn history(&self) -> &[ServerEvent] {
        &self.history
    }

    pub fn received(&self, name: &str) -> usize {
        self.history.iter().filter(|e| e.name() == name).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Pull whatever is already queued without waiting.
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut drained = Vec::new();
        while let Ok(outbound) = self.rx.try_recv() {
            match outbound {
                Outbound::Event(event) => {
                    self.history.push(event.clone());
                    drained.push(event);
                }
                Outbound::Close => self.closed = true,
            }
        }
        drained
    }

    /// Next event of any kind, or `None` on timeout or close.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        let deadline = Instant::now() + self.wait;
        self.recv_until(deadline).await
    }

    async fn recv_until(&mut self, deadline: Instant) -> Option<ServerEvent> {
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(Outbound::Event(event))) => {
                    self.history.push(event.clone());
                    return Some(event);
                }
                Ok(Some(Outbound::Close)) => self.closed = true,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Wait for the next event named `name`, skipping anything else.
    pub async fn expect(&mut self, name: &str) -> ServerEvent {
        let deadline = Instant::now() + self.wait;
        while let Some(event) = self.recv_until(deadline).await {
            if event.name() == name {
                return event;
            }
        }
        panic!(
            "{}: no `{}` event; received {:?}",
            self.user_id,
            name,
            self.history.iter().map(|e| e.name()).collect::<Vec<_>>()
        );
    }

    /// Wait until the outbound channel is closed or a `Close` frame arrives.
    pub async fn expect_closed(&mut self) {
        let deadline = Instant::now() + self.wait;
        while !self.closed {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(Outbound::Event(event))) => self.history.push(event),
                Ok(Some(Outbound::Close)) | Ok(None) => self.closed = true,
                Err(_) => panic!("{}: connection not closed", self.user_id),
            }
        }
    }

    pub async fn expect_battle_found(&mut self) -> BattleFound {
        match self.expect("battle_found").await {
            ServerEvent::BattleFound(found) => found,
            other => unreachable!("{:?}", other),
        }
    }

    /// `battle_found` then `battle_started`; returns the battle id.
    pub async fn expect_battle_start(&mut self) -> String {
        let found = self.expect_battle_found().await;
        self.expect("battle_started").await;
        found.battle_id
    }

    pub async fn expect_battle_end(&mut self) -> BattleEnd {
        match self.expect("battle_end").await {
            ServerEvent::BattleEnd(end) => end,
            other => unreachable!("{:?}", other),
        }
    }

    pub async fn expect_outcome(&mut self) -> Outcome {
        self.expect_battle_end().await.outcome
    }

    pub async fn expect_submit_result(&mut self) -> SubmitResult {
        match self.expect("submit_result").await {
            ServerEvent::SubmitResult(result) => result,
            other => unreachable!("{:?}", other),
        }
    }

    pub async fn expect_state(&mut self) -> BattleSnapshot {
        match self.expect("battle_state").await {
            ServerEvent::BattleState(snapshot) => snapshot,
            other => unreachable!("{:?}", other),
        }
    }

    pub async fn expect_error(&mut self, code: ErrorCode) -> ErrorEvent {
        let deadline = Instant::now() + self.wait;
        while let Some(event) = self.recv_until(deadline).await {
            if let ServerEvent::Error(error) = event {
                if error.code == code {
                    return error;
                }
            }
        }
        panic!("{}: no {:?} error; history {:?}", self.user_id, code, self.history);
    }
}

fn code_payload(battle_id: &str, code: &str) -> CodePayload {
    CodePayload {
        battle_id: battle_id.to_string(),
        code: code.to_string(),
        language: "python".to_string(),
    }
}
