//! Timer/expiry supervisor.
//!
//! A single task owning every battle timer plus the periodic queue sweeps.
//! Timers are keyed; scheduling a key again or cancelling it bumps its
//! generation, so an entry that was already in the heap fires into nothing.
//! Such dead entries are swept out once they clearly outnumber live ones.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Weak;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::actor::BattleCommand;
use crate::dispatcher::{Orchestrator, Shared};
use crate::protocol::{BattleId, UserId};

const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const LIMITER_MAX_IDLE: Duration = Duration::from_secs(600);
/// Dead heap entries tolerated beyond twice the live count.
const PRUNE_SLACK: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Countdown between `battle_found` and IN_PROGRESS.
    Start,
    Expiry,
    Grace(UserId),
    Evict,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub battle_id: BattleId,
    pub kind: TimerKind,
}

impl TimerKey {
    pub fn new(battle_id: impl Into<BattleId>, kind: TimerKind) -> Self {
        Self {
            battle_id: battle_id.into(),
            kind,
        }
    }

    fn command(&self) -> BattleCommand {
        match &self.kind {
            TimerKind::Start => BattleCommand::Start,
            TimerKind::Expiry => BattleCommand::Expire,
            TimerKind::Grace(user_id) => BattleCommand::GraceExpired {
                user_id: user_id.clone(),
            },
            TimerKind::Evict => BattleCommand::Evict,
        }
    }
}

#[derive(Debug)]
pub(crate) enum TimerCommand {
    Schedule { key: TimerKey, at: Instant },
    Cancel { key: TimerKey },
    Shutdown,
}

/// Cloneable front end of the supervisor.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    tx: mpsc::UnboundedSender<TimerCommand>,
}

impl TimerHandle {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<TimerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Fire `key` at `at`, replacing any pending timer with the same key.
    pub fn schedule(&self, key: TimerKey, at: Instant) {
        let _ = self.tx.send(TimerCommand::Schedule { key, at });
    }

    pub fn cancel(&self, key: TimerKey) {
        let _ = self.tx.send(TimerCommand::Cancel { key });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(TimerCommand::Shutdown);
    }
}

#[derive(Debug)]
struct Entry {
    at: Instant,
    generation: u64,
    key: TimerKey,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.generation == other.generation
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.generation).cmp(&(other.at, other.generation))
    }
}

pub(crate) struct Supervisor {
    rx: mpsc::UnboundedReceiver<TimerCommand>,
    heap: BinaryHeap<Reverse<Entry>>,
    live: HashMap<TimerKey, u64>,
    next_generation: u64,
    shared: Weak<Shared>,
}

impl Supervisor {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<TimerCommand>, shared: Weak<Shared>) -> Self {
        Self {
            rx,
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_generation: 0,
            shared,
        }
    }

    pub(crate) async fn run(mut self, queue_poll: Duration, status_every: Duration) {
        let start = Instant::now();
        let mut queue_tick = time::interval_at(start + queue_poll, queue_poll);
        queue_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status_tick = time::interval_at(start + status_every, status_every);
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_tick =
            time::interval_at(start + LIMITER_CLEANUP_INTERVAL, LIMITER_CLEANUP_INTERVAL);
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_due = self.heap.peek().map(|Reverse(entry)| entry.at);
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(TimerCommand::Schedule { key, at }) => self.schedule(key, at),
                    Some(TimerCommand::Cancel { key }) => self.cancel(&key),
                    Some(TimerCommand::Shutdown) | None => break,
                },
                _ = time::sleep_until(next_due.unwrap_or_else(Instant::now)),
                    if next_due.is_some() =>
                {
                    if !self.fire_due(Instant::now()) {
                        break;
                    }
                }
                _ = queue_tick.tick() => {
                    let Some(orchestrator) = self.orchestrator() else { break };
                    orchestrator.sweep_queue(Instant::now());
                    if orchestrator.queue_len() >= 2 {
                        tokio::spawn(async move { orchestrator.pair_waiting().await });
                    }
                }
                _ = status_tick.tick() => {
                    let Some(orchestrator) = self.orchestrator() else { break };
                    orchestrator.broadcast_queue_status();
                }
                _ = cleanup_tick.tick() => {
                    let Some(orchestrator) = self.orchestrator() else { break };
                    orchestrator.cleanup_limits(LIMITER_MAX_IDLE);
                }
            }
        }
        tracing::debug!(pending = self.live.len(), "supervisor stopped");
    }

    fn orchestrator(&self) -> Option<Orchestrator> {
        self.shared.upgrade().map(Orchestrator::from_shared)
    }

    fn schedule(&mut self, key: TimerKey, at: Instant) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.live.insert(key.clone(), generation);
        self.heap.push(Reverse(Entry {
            at,
            generation,
            key,
        }));
        self.prune_if_sparse();
    }

    fn cancel(&mut self, key: &TimerKey) {
        self.live.remove(key);
        self.prune_if_sparse();
    }

    fn prune_if_sparse(&mut self) {
        if self.heap.len() <= 2 * self.live.len() + PRUNE_SLACK {
            return;
        }
        let before = self.heap.len();
        let live = &self.live;
        self.heap.retain(|Reverse(entry)| live.get(&entry.key) == Some(&entry.generation));
        tracing::trace!(before, after = self.heap.len(), "pruned timer heap");
    }

    /// Deliver every live timer due at `now`. False once the orchestrator is gone.
    fn fire_due(&mut self, now: Instant) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.at > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            if self.live.get(&entry.key) != Some(&entry.generation) {
                continue;
            }
            self.live.remove(&entry.key);
            if !shared.registry.send(&entry.key.battle_id, entry.key.command()) {
                tracing::debug!(
                    battle_id = %entry.key.battle_id,
                    kind = ?entry.key.kind,
                    "timer for departed battle"
                );
            }
        }
        true
    }
}
