//! Robot Arena Server - headless match host
//!
//! Runs bot-vs-bot matches on the authoritative simulation core and logs
//! their outcomes. Real deployments embed the `robot_arena` library behind
//! their own transport; this binary exercises the full match lifecycle.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use robot_arena::config::{Config, LogFormat};
use robot_arena::game::{GameMatch, MatchRegistry, Participant};
use robot_arena::protocol::{MatchOver, RobotMessage};
use robot_arena::script::{BotProfile, RhaiEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(&config.log_level, config.log_format);

    info!(
        matches = config.demo_matches,
        bots = ?config.demo_bots,
        tick_rate = config.match_settings.tick_rate,
        "Starting Robot Arena Server"
    );

    let registry = Arc::new(MatchRegistry::new());
    let mut outcomes = Vec::with_capacity(config.demo_matches);

    for _ in 0..config.demo_matches {
        let participants = config
            .demo_bots
            .iter()
            .map(|name| {
                let profile = BotProfile::from_name(name);
                Participant::bot(profile).with_cosmetic(json!({ "profile": profile.name() }))
            })
            .collect();

        let (done_tx, done_rx) = oneshot::channel::<MatchOver>();
        let engine = RhaiEngine::new(&config.match_settings.script_budget);
        let (mut game_match, handle) = GameMatch::new(
            Uuid::new_v4(),
            participants,
            config.match_settings.clone(),
            engine,
            Some(Box::new(move |over| {
                let _ = done_tx.send(over);
            })),
        )?;

        if let Some(mut messages) = game_match.take_robot_messages() {
            let match_id = handle.id;
            tokio::spawn(async move {
                while let Some(message) = messages.recv().await {
                    match message {
                        RobotMessage::CodeError { robot_id, kind, message } => {
                            warn!(match_id = %match_id, robot_id = %robot_id, ?kind, "{message}");
                        }
                        RobotMessage::Log { robot_id, message } => {
                            info!(match_id = %match_id, robot_id = %robot_id, "{message}");
                        }
                    }
                }
            });
        }

        registry.insert(handle.clone());
        game_match.start();
        outcomes.push(done_rx);
    }

    let all_done = join_all(outcomes);
    tokio::pin!(all_done);

    tokio::select! {
        results = &mut all_done => {
            for result in results {
                match result {
                    Ok(over) => info!(
                        match_id = %over.match_id,
                        winner = %over.winner_name,
                        reason = ?over.reason,
                        ticks = over.tick,
                        "Match result"
                    ),
                    Err(_) => error!("Match finished without reporting a result"),
                }
            }
        }
        _ = shutdown_signal() => {
            registry.stop_all();
        }
    }

    let pruned = registry.prune_finished();
    info!(pruned, remaining = registry.active_matches(), "Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init(),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping matches");
        }
        _ = terminate => {
            info!("Received terminate signal, stopping matches");
        }
    }
}
