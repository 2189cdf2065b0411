//! Session registry.
//!
//! Maps battle id to the battle's command channel, and user id to the battle
//! the user is currently fighting. Mutations take a short mutex so that the
//! "one active battle per user" check and the insert are atomic; lookups go
//! straight to the maps.

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::actor::BattleCommand;
use crate::protocol::{BattleId, UserId};

/// Address of a running battle.
#[derive(Debug, Clone)]
pub struct BattleHandle {
    pub battle_id: BattleId,
    pub participants: [UserId; 2],
    tx: mpsc::UnboundedSender<BattleCommand>,
}

impl BattleHandle {
    pub(crate) fn new(
        battle_id: BattleId,
        participants: [UserId; 2],
        tx: mpsc::UnboundedSender<BattleCommand>,
    ) -> Self {
        Self {
            battle_id,
            participants,
            tx,
        }
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    /// Queue a command. False once the battle task has exited.
    pub(crate) fn send(&self, command: BattleCommand) -> bool {
        self.tx.send(command).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("user {0} already has an active battle")]
    AlreadyActive(UserId),

    #[error("battle id {0} already registered")]
    DuplicateBattle(BattleId),
}

/// Session registry
pub struct SessionRegistry {
    battles: DashMap<BattleId, BattleHandle>,
    /// Users whose battle has not been decided yet.
    active: DashMap<UserId, BattleId>,
    /// Most recent battle per user, kept until eviction for late reconnects.
    recent: DashMap<UserId, BattleId>,
    write: Mutex<()>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            battles: DashMap::new(),
            active: DashMap::new(),
            recent: DashMap::new(),
            write: Mutex::new(()),
        }
    }

    pub fn insert(&self, handle: BattleHandle) -> Result<(), RegistryError> {
        let _guard = self.write.lock();
        if self.battles.contains_key(&handle.battle_id) {
            return Err(RegistryError::DuplicateBattle(handle.battle_id));
        }
        if let Some(busy) = handle
            .participants
            .iter()
            .find(|user| self.active.contains_key(user.as_str()))
        {
            return Err(RegistryError::AlreadyActive(busy.clone()));
        }
        for user in &handle.participants {
            self.active.insert(user.clone(), handle.battle_id.clone());
            self.recent.insert(user.clone(), handle.battle_id.clone());
        }
        self.battles.insert(handle.battle_id.clone(), handle);
        Ok(())
    }

    /// Free the participants once the outcome is fixed. The battle stays
    /// addressable until [`SessionRegistry::remove`].
    pub fn release(&self, battle_id: &str) {
        let _guard = self.write.lock();
        if let Some(handle) = self.battles.get(battle_id) {
            for user in &handle.participants {
                self.active.remove_if(user.as_str(), |_, id| id == battle_id);
            }
        }
    }

    pub fn remove(&self, battle_id: &str) -> Option<BattleHandle> {
        let _guard = self.write.lock();
        let (_, handle) = self.battles.remove(battle_id)?;
        for user in &handle.participants {
            self.active.remove_if(user.as_str(), |_, id| id == battle_id);
            self.recent.remove_if(user.as_str(), |_, id| id == battle_id);
        }
        Some(handle)
    }

    pub fn get(&self, battle_id: &str) -> Option<BattleHandle> {
        self.battles.get(battle_id).map(|r| r.value().clone())
    }

    pub fn active_battle(&self, user_id: &str) -> Option<BattleId> {
        self.active.get(user_id).map(|r| r.value().clone())
    }

    pub fn is_active(&self, user_id: &str) -> bool {
        self.active.contains_key(user_id)
    }

    /// Active battle, else the most recent one still in its post-battle grace.
    pub fn battle_for(&self, user_id: &str) -> Option<BattleHandle> {
        let id = self
            .active_battle(user_id)
            .or_else(|| self.recent.get(user_id).map(|r| r.value().clone()))?;
        self.get(&id)
    }

    pub(crate) fn send(&self, battle_id: &str, command: BattleCommand) -> bool {
        self.battles
            .get(battle_id)
            .map(|h| h.send(command))
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.battles.len()
    }

    pub fn active_users(&self) -> usize {
        self.active.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
