//! # DuelNet
//!
//! Real-time orchestrator for 1v1 coding battles.
//!
//! ## Features
//!
//! - **Matchmaking**: strict FIFO queue with timeouts and queue status
//! - **Battles**: one actor per battle owning a deterministic state machine
//! - **Judge fan-out**: run and submit calls spawned off the battle loop
//! - **Reconnects**: per-side grace windows and state resync
//! - **Persistence**: retried, fire-and-forget side effects
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use duelnet::{Config, HttpJudge, MemoryStore, Orchestrator, Server, TrustedTokenIdentity};
//!
//! let config = Config::default().apply_env()?;
//! let judge = Arc::new(HttpJudge::new(&config.judge)?);
//! let store = Arc::new(MemoryStore::with_problems(["two-sum"]));
//! let orchestrator = Orchestrator::start(config, judge, store)?;
//!
//! Server::new(orchestrator, Arc::new(TrustedTokenIdentity)).serve().await?;
//! ```

mod actor;
pub mod battle;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod judge;
pub mod matchmaker;
pub mod persistence;
pub mod protocol;
pub mod ratelimit;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod telemetry;

// Re-exports
pub use battle::{Battle, BattleState, EndReason, Outcome};
pub use config::Config;
pub use connection::{ConnectionRegistry, Outbound, OutboundRx, OutboundTx};
pub use dispatcher::Orchestrator;
pub use error::{DispatchError, DuelError, Result};
pub use identity::{Identity, IdentityProvider, StaticIdentity, TrustedTokenIdentity};
pub use judge::{ExecMode, HttpJudge, Judge, JudgeError, JudgeReport, JudgeRequest, JudgeStatus};
pub use matchmaker::Matchmaker;
pub use persistence::{BattleStore, MemoryStore, StoreError};
pub use protocol::{ClientEvent, ErrorCode, ServerEvent};
pub use registry::SessionRegistry;
pub use server::Server;
pub use telemetry::{init_tracing, TracingConfig, TracingGuard};
