//! DuelNet battle server.
//!
//! Usage: duelnet-server [config.json]
//!
//! The config path may also come from `DUELNET_CONFIG`. Environment
//! overrides (`PORT`, `JUDGE_URL`, `BATTLE_TIME_LIMIT`, ...) apply on top.
//! `PROBLEMS` is a comma separated list of problem ids to draw from.

use std::sync::Arc;

use duelnet::{
    init_tracing, Config, DuelError, HttpJudge, MemoryStore, Orchestrator, Result, Server,
    TracingConfig, TrustedTokenIdentity,
};

const DEFAULT_PROBLEMS: &[&str] = &["two-sum", "valid-parentheses", "merge-intervals"];

fn load_config() -> Result<Config> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DUELNET_CONFIG").ok());
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let config = config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn problems() -> Vec<String> {
    match std::env::var("PROBLEMS") {
        Ok(list) => list
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => DEFAULT_PROBLEMS.iter().map(|id| id.to_string()).collect(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let _guard = init_tracing(TracingConfig::from(&config.telemetry))?;

    let problems = problems();
    if problems.is_empty() {
        return Err(DuelError::config("PROBLEMS is empty"));
    }
    tracing::info!(
        bind = %config.server.bind_addr,
        judge = %config.judge.url,
        problems = problems.len(),
        "starting duelnet"
    );

    let judge = HttpJudge::new(&config.judge).map_err(|e| DuelError::config(e.to_string()))?;
    let store = MemoryStore::with_problems(problems);
    let orchestrator = Orchestrator::start(config, Arc::new(judge), Arc::new(store))?;
    let server = Server::new(orchestrator.clone(), Arc::new(TrustedTokenIdentity));

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            orchestrator.shutdown();
        }
    }
    Ok(())
}
