//! emosync - realtime session sync engine for the emotion monitor.
//!
//! Wires the aggregator, push-channel connection manager, and both poll
//! coordinators together for one live session, logs projected changes, and
//! fetches the final analysis on shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use emosync_engine::config::SyncConfig;
use emosync_engine::sync::{
    AudioMetricsSource, ConnectionManager, MonitorApi, PollCoordinator, SessionAggregator,
    TimelineRecorder, VideoStatisticsSource,
};

#[derive(Debug, Parser)]
#[command(name = "emosync", about = "Realtime session sync engine")]
struct Args {
    /// Monitor backend base URL (REST).
    #[arg(long, env = "EMOSYNC_SERVER_URL", default_value = "http://127.0.0.1:8000")]
    server_url: String,

    /// Push-channel base URL. Derived from --server-url when omitted.
    #[arg(long, env = "EMOSYNC_WS_URL")]
    ws_url: Option<String>,

    /// Session identifier. A fresh v4 UUID when omitted.
    #[arg(long, env = "EMOSYNC_SESSION_ID")]
    session_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let config = SyncConfig::from_env();

    let session_id = args
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let ws_url = args
        .ws_url
        .unwrap_or_else(|| derive_ws_url(&args.server_url));

    info!(session_id, server = %args.server_url, ws = %ws_url, "starting session sync engine");

    // Single source of truth plus its derived-event recorder, handed to
    // every producer and consumer by reference.
    let timeline = Arc::new(TimelineRecorder::new(config.timeline_capacity));
    let aggregator = SessionAggregator::new(config.clone(), timeline);
    aggregator.start_session(&session_id);

    // Push channel.
    let connection = ConnectionManager::new(config.clone(), format!("{}/ws", ws_url), aggregator.clone());
    connection.connect(&session_id);

    // Redundant pull path: fast audio metrics + slower video statistics.
    let api = Arc::new(MonitorApi::new(
        &args.server_url,
        &session_id,
        Duration::from_millis(config.request_timeout_ms),
    )?);
    let audio_poll = PollCoordinator::new(
        "audio-metrics",
        Duration::from_millis(config.audio_poll_interval_ms),
        AudioMetricsSource::new(api.clone()),
        aggregator.clone(),
    );
    let video_poll = PollCoordinator::new(
        "video-statistics",
        Duration::from_millis(config.video_poll_interval_ms),
        VideoStatisticsSource::new(api.clone()),
        aggregator.clone(),
    );
    audio_poll.enable();
    video_poll.enable();

    // Log interesting projected changes.
    spawn_change_logger(&aggregator);
    spawn_metrics_logger(&aggregator, &connection, &audio_poll, &video_poll);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    // Stop producers first so nothing mutates state mid-teardown.
    audio_poll.disable();
    video_poll.disable();
    connection.disconnect();

    // Single-shot final analysis if the push channel never delivered one.
    if aggregator.view().agent.final_state.is_none() {
        let token = aggregator.token();
        match api.analyze().await {
            Ok(patch) => aggregator.apply_agent(token, &patch),
            Err(e) => warn!(error = %e, "final analysis unavailable"),
        }
    }
    aggregator.end_session();

    let view = aggregator.view();
    info!(
        verdict = %view
            .agent
            .final_state
            .map(|v| v.to_string())
            .unwrap_or_else(|| "none".to_string()),
        frames = view.video.total_frames,
        duration_s = view.audio.duration,
        timeline_events = aggregator.timeline().len(),
        "session summary"
    );

    Ok(())
}

fn derive_ws_url(server_url: &str) -> String {
    server_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1)
}

fn spawn_change_logger(aggregator: &Arc<SessionAggregator>) {
    let mut connection = aggregator.project(|v| v.connection.state);
    tokio::spawn(async move {
        while connection.changed().await.is_ok() {
            info!(state = %*connection.borrow_and_update(), "connection state changed");
        }
    });

    let mut emotion = aggregator.project(|v| v.video.dominant_emotion.clone());
    tokio::spawn(async move {
        while emotion.changed().await.is_ok() {
            info!(emotion = %*emotion.borrow_and_update(), "dominant emotion changed");
        }
    });

    let mut verdict = aggregator.project(|v| v.agent.final_state);
    tokio::spawn(async move {
        while verdict.changed().await.is_ok() {
            if let Some(v) = *verdict.borrow_and_update() {
                info!(verdict = %v, "final result ready");
            }
        }
    });
}

fn spawn_metrics_logger(
    aggregator: &Arc<SessionAggregator>,
    connection: &Arc<ConnectionManager>,
    audio_poll: &Arc<PollCoordinator>,
    video_poll: &Arc<PollCoordinator>,
) {
    let aggregator = aggregator.clone();
    let connection = connection.clone();
    let audio_poll = audio_poll.clone();
    let video_poll = video_poll.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.tick().await; // skip the immediate tick
        loop {
            ticker.tick().await;
            info!(
                aggregator = %aggregator.metrics().summary(),
                connection = %connection.metrics().summary(),
                audio_poll = %audio_poll.metrics().summary(),
                video_poll = %video_poll.metrics().summary(),
                "sync metrics"
            );
        }
    });
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "emosync_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
