#![allow(dead_code)]

use std::sync::Arc;

use duelnet::{Config, MemoryStore, Orchestrator};
use duelnet_test_support::{ScriptedJudge, TestClient};

pub const PROBLEM: &str = "two-sum";

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub judge: Arc<ScriptedJudge>,
    pub store: Arc<MemoryStore>,
}

pub fn harness(config: Config) -> Harness {
    let judge = Arc::new(ScriptedJudge::new());
    let store = Arc::new(MemoryStore::with_problems([PROBLEM]));
    let orchestrator = Orchestrator::start(config, judge.clone(), store.clone()).unwrap();
    Harness {
        orchestrator,
        judge,
        store,
    }
}

impl Harness {
    pub fn client(&self, user_id: &str, username: &str) -> TestClient {
        TestClient::connect(&self.orchestrator, user_id, username)
    }

    /// Alice and Bob matched, countdown elapsed.
    pub async fn started_battle(&self) -> (TestClient, TestClient, String) {
        let mut alice = self.client("alice", "Alice");
        let mut bob = self.client("bob", "Bob");
        alice.join_queue().await;
        bob.join_queue().await;

        let battle_id = alice.expect_battle_start().await;
        assert_eq!(bob.expect_battle_start().await, battle_id);
        (alice, bob, battle_id)
    }
}
