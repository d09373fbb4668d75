//! Push-channel connection manager.
//!
//! Owns one WebSocket session at a time and drives the
//! connect → connected → reconnecting state machine. Liveness comes from the
//! heartbeat monitor, so a silently-dead transport is declared down without
//! waiting for a close frame. Reconnects use a fixed, linearly-capped delay.
//!
//! Cancellation: every spawned loop carries the generation counter it was
//! started under and re-checks it (under the state lock) before any
//! transition or view mutation. `disconnect()` bumps the generation before
//! returning, so no state-change callback fires afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::models::{ConnectionInfo, ConnectionState};
use crate::sync::aggregator::SessionAggregator;
use crate::sync::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::sync::wire::{decode_frame, Inbound, PING_FRAME};

/// Why a streaming session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamEnd {
    /// Transport closed or errored, with the cause when the transport gave one.
    Transport(Option<String>),
    /// Heartbeat monitor declared the connection dead.
    HeartbeatDead,
    /// Server sent an explicit `disconnected` frame.
    ServerDisconnect,
    /// This generation was superseded by `disconnect()` or a new `connect()`.
    Cancelled,
}

#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    pub connects_attempted: AtomicU64,
    pub connects_succeeded: AtomicU64,
    pub reconnections: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub probes_sent: AtomicU64,
    pub heartbeat_deaths: AtomicU64,
}

impl ConnectionMetrics {
    pub fn summary(&self) -> String {
        format!(
            "connects={}/{} reconnects={} frames={} dropped={} probes={} hb_deaths={}",
            self.connects_succeeded.load(Ordering::Relaxed),
            self.connects_attempted.load(Ordering::Relaxed),
            self.reconnections.load(Ordering::Relaxed),
            self.frames_decoded.load(Ordering::Relaxed),
            self.frames_dropped.load(Ordering::Relaxed),
            self.probes_sent.load(Ordering::Relaxed),
            self.heartbeat_deaths.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: ConnectionState,
    session_id: Option<String>,
    attempts: u32,
    last_error: Option<String>,
    last_heartbeat_at: Option<chrono::DateTime<Utc>>,
    reconnect_enabled: bool,
}

impl Inner {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            state: self.state,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            last_heartbeat_at: self.last_heartbeat_at,
        }
    }
}

pub struct ConnectionManager {
    config: SyncConfig,
    /// Base URL of the push server, e.g. `ws://127.0.0.1:8000/ws`.
    server_url: String,
    aggregator: Arc<SessionAggregator>,
    inner: RwLock<Inner>,
    /// Generation counter. Written only while holding the `inner` write lock.
    generation: AtomicU64,
    metrics: Arc<ConnectionMetrics>,
}

impl ConnectionManager {
    pub fn new(
        config: SyncConfig,
        server_url: impl Into<String>,
        aggregator: Arc<SessionAggregator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            server_url: server_url.into(),
            aggregator,
            inner: RwLock::new(Inner::default()),
            generation: AtomicU64::new(0),
            metrics: Arc::new(ConnectionMetrics::default()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    pub fn info(&self) -> ConnectionInfo {
        self.inner.read().info()
    }

    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        &self.metrics
    }

    /// Open the push channel for a session. No-op without a session id, and
    /// idempotent while already connecting/connected to the same session.
    pub fn connect(self: &Arc<Self>, session_id: &str) {
        if session_id.trim().is_empty() {
            warn!("connect called without a session id; ignoring");
            return;
        }

        let generation = {
            let mut inner = self.inner.write();
            let already_active = matches!(
                inner.state,
                ConnectionState::Connecting
                    | ConnectionState::Connected
                    | ConnectionState::Reconnecting
            );
            if already_active && inner.session_id.as_deref() == Some(session_id) {
                debug!(session_id, "already connected/connecting; connect is a no-op");
                return;
            }

            // New generation supersedes any previous loop.
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            inner.state = ConnectionState::Connecting;
            inner.session_id = Some(session_id.to_string());
            inner.attempts = 0;
            inner.last_error = None;
            inner.reconnect_enabled = true;
            generation
        };
        self.publish();

        let manager = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            manager.run_loop(generation, session_id).await;
        });
    }

    /// Force `Disconnected`, cancel pending reconnects, and disable
    /// auto-reconnect until the next `connect()`. No state-change callback
    /// fires after this returns.
    pub fn disconnect(&self) {
        {
            let mut inner = self.inner.write();
            self.generation.fetch_add(1, Ordering::AcqRel);
            inner.state = ConnectionState::Disconnected;
            inner.reconnect_enabled = false;
            inner.last_error = None;
        }
        self.publish();
        info!("push channel disconnected by caller");
    }

    // =========================================================================
    // CONNECT / RECONNECT LOOP
    // =========================================================================

    async fn run_loop(self: Arc<Self>, generation: u64, session_id: String) {
        let url = format!(
            "{}/session/{}",
            self.server_url.trim_end_matches('/'),
            session_id
        );

        loop {
            if !self.is_current(generation) {
                return;
            }

            self.metrics.connects_attempted.fetch_add(1, Ordering::Relaxed);
            let end = match connect_async(url.as_str()).await {
                Ok((ws_stream, response)) => {
                    if !self.transition(generation, |inner| {
                        inner.state = ConnectionState::Connected;
                        inner.attempts = 0;
                        inner.last_error = None;
                    }) {
                        return;
                    }
                    self.metrics.connects_succeeded.fetch_add(1, Ordering::Relaxed);
                    info!(status = %response.status(), "push channel connected");

                    self.stream(ws_stream, generation).await
                }
                Err(e) => {
                    debug!(error = %e, "push channel connect failed");
                    if !self.transition(generation, |inner| {
                        inner.last_error = Some(e.to_string());
                    }) {
                        return;
                    }
                    // Cause already recorded by the transition above.
                    StreamEnd::Transport(None)
                }
            };

            match &end {
                StreamEnd::Cancelled => return,
                StreamEnd::HeartbeatDead => {
                    warn!("heartbeat missed-response threshold reached; treating connection as dead");
                }
                StreamEnd::Transport(_) | StreamEnd::ServerDisconnect => {}
            }

            let Some(delay) = self.begin_reconnect(generation, end) else {
                return;
            };
            sleep(delay).await;

            if !self.transition(generation, |inner| {
                inner.state = ConnectionState::Connecting;
            }) {
                return;
            }
        }
    }

    /// Record the failure and schedule the next attempt. Returns `None` when
    /// this generation is superseded, reconnect is disabled, or attempts are
    /// exhausted (terminal `Disconnected`).
    fn begin_reconnect(&self, generation: u64, end: StreamEnd) -> Option<Duration> {
        let delay = {
            let mut inner = self.inner.write();
            if self.generation.load(Ordering::Acquire) != generation || !inner.reconnect_enabled
            {
                return None;
            }

            inner.attempts += 1;
            match &end {
                StreamEnd::HeartbeatDead => {
                    inner.last_error = Some("heartbeat timeout".to_string());
                }
                StreamEnd::ServerDisconnect => {
                    inner.last_error = Some("server requested disconnect".to_string());
                }
                StreamEnd::Transport(Some(cause)) => {
                    inner.last_error = Some(cause.clone());
                }
                StreamEnd::Transport(None) | StreamEnd::Cancelled => {}
            }

            let max = self.config.max_reconnect_attempts;
            if max > 0 && inner.attempts > max {
                inner.state = ConnectionState::Disconnected;
                inner.reconnect_enabled = false;
                warn!(attempts = inner.attempts, "reconnect attempts exhausted");
                None
            } else {
                inner.state = ConnectionState::Reconnecting;
                Some(self.config.reconnect_delay(inner.attempts))
            }
        };

        self.publish();
        if let Some(delay) = delay {
            self.metrics.reconnections.fetch_add(1, Ordering::Relaxed);
            info!(delay_ms = delay.as_millis() as u64, "reconnecting");
        }
        delay
    }

    // =========================================================================
    // STREAMING
    // =========================================================================

    async fn stream<S>(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<S>,
        generation: u64,
    ) -> StreamEnd
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws_stream.split();
        let mut heartbeat = HeartbeatMonitor::new(self.config.heartbeat_miss_threshold);

        let mut probe = interval(self.config.heartbeat_interval());
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately; the first probe doubles as a hello.

        loop {
            tokio::select! {
                _ = probe.tick() => {
                    if !self.is_current(generation) {
                        return StreamEnd::Cancelled;
                    }
                    match heartbeat.on_probe_tick() {
                        HeartbeatAction::SendProbe => {
                            self.metrics.probes_sent.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = write.send(Message::Text(PING_FRAME.to_string())).await {
                                return StreamEnd::Transport(Some(e.to_string()));
                            }
                        }
                        HeartbeatAction::Dead => {
                            self.metrics.heartbeat_deaths.fetch_add(1, Ordering::Relaxed);
                            return StreamEnd::HeartbeatDead;
                        }
                    }
                }
                message = read.next() => {
                    if !self.is_current(generation) {
                        return StreamEnd::Cancelled;
                    }
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(end) = self.handle_frame(&text, &mut heartbeat, generation) {
                                return end;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = write.send(Message::Pong(payload)).await {
                                return StreamEnd::Transport(Some(e.to_string()));
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.record_liveness(&mut heartbeat, generation);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "push channel closed by server");
                            return StreamEnd::Transport(Some("closed by server".to_string()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "push channel read error");
                            return StreamEnd::Transport(Some(e.to_string()));
                        }
                        None => return StreamEnd::Transport(Some("stream ended".to_string())),
                    }
                }
            }
        }
    }

    /// Decode one text frame and hand it to the aggregator. Unparseable
    /// payloads are dropped and logged, never propagated as a crash.
    fn handle_frame(
        &self,
        text: &str,
        heartbeat: &mut HeartbeatMonitor,
        generation: u64,
    ) -> Option<StreamEnd> {
        // Token captured at dispatch time; a reset between here and the
        // apply makes the update stale and the aggregator drops it.
        let token = self.aggregator.token();

        match decode_frame(text) {
            Ok(Some(Inbound::Liveness)) => {
                self.metrics.frames_decoded.fetch_add(1, Ordering::Relaxed);
                self.record_liveness(heartbeat, generation);
            }
            Ok(Some(Inbound::Connected)) => {
                self.metrics.frames_decoded.fetch_add(1, Ordering::Relaxed);
                debug!("server confirmed subscription");
            }
            Ok(Some(Inbound::Disconnected)) => {
                self.metrics.frames_decoded.fetch_add(1, Ordering::Relaxed);
                return Some(StreamEnd::ServerDisconnect);
            }
            Ok(Some(inbound)) => {
                self.metrics.frames_decoded.fetch_add(1, Ordering::Relaxed);
                self.aggregator.apply_inbound(token, inbound);
            }
            Ok(None) => {
                debug!(frame = preview(text), "dropped unknown frame kind");
            }
            Err(e) => {
                self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, frame = preview(text), "dropped undecodable frame");
            }
        }
        None
    }

    fn record_liveness(&self, heartbeat: &mut HeartbeatMonitor, generation: u64) {
        heartbeat.record_response();
        self.transition(generation, |inner| {
            inner.last_heartbeat_at = Some(Utc::now());
        });
    }

    // =========================================================================
    // STATE TRANSITIONS
    // =========================================================================

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Apply a state mutation iff this generation is still current, then
    /// mirror the connection snapshot into the aggregator. Returns `false`
    /// when superseded (caller must stop).
    fn transition<F>(&self, generation: u64, mutate: F) -> bool
    where
        F: FnOnce(&mut Inner),
    {
        {
            let mut inner = self.inner.write();
            if self.generation.load(Ordering::Acquire) != generation {
                return false;
            }
            mutate(&mut inner);
        }
        self.publish();
        true
    }

    fn publish(&self) {
        let info = self.inner.read().info();
        self.aggregator.apply_connection(info);
    }
}

/// Leading bytes of a frame for logging, cut on a char boundary.
fn preview(text: &str) -> &str {
    let mut end = text.len().min(120);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
