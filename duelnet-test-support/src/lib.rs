//! Test harness for DuelNet.
//!
//! - [`judge::ScriptedJudge`]: verdicts chosen by markers in the submitted code
//! - [`chaos::ChaosJudge`]: random latency and failures around another judge
//! - [`client::TestClient`]: an in-memory connection with event assertions
//! - [`store::FailingStore`]: a store whose writes fail on demand

pub mod chaos;
pub mod client;
pub mod judge;
pub mod store;

pub use chaos::ChaosJudge;
pub use client::TestClient;
pub use judge::ScriptedJudge;
pub use store::FailingStore;
