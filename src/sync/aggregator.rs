//! State aggregator: the single owner of the merged session view.
//!
//! Producers (push channel, poll loops) submit partial updates tagged with
//! the session token captured at dispatch time. A session reset advances the
//! token, so updates from a superseded session are dropped instead of
//! clobbering fresh state. Consumers subscribe to value-gated projections:
//! a subscriber is only woken when its projected slice actually changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::models::{
    AgentPatch, AudioPatch, ConnectionInfo, SessionView, SurfacedError, VideoPatch,
};
use crate::sync::timeline::{EventCategory, TimelineRecorder};
use crate::sync::wire::Inbound;

/// Dominant-emotion changes below this confidence are not spikes.
const EMOTION_SPIKE_MIN_CONFIDENCE: f64 = 0.7;

/// Opaque token identifying one session generation. Advances on every reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionToken(u64);

type Projection = Box<dyn Fn(&SessionView) + Send + Sync>;

#[derive(Debug, Default)]
pub struct AggregatorMetrics {
    pub updates_applied: AtomicU64,
    pub stale_token_drops: AtomicU64,
    pub verdict_conflicts: AtomicU64,
    pub errors_surfaced: AtomicU64,
}

impl AggregatorMetrics {
    pub fn summary(&self) -> String {
        format!(
            "applied={} stale_drops={} verdict_conflicts={} errors={}",
            self.updates_applied.load(Ordering::Relaxed),
            self.stale_token_drops.load(Ordering::Relaxed),
            self.verdict_conflicts.load(Ordering::Relaxed),
            self.errors_surfaced.load(Ordering::Relaxed),
        )
    }
}

pub struct SessionAggregator {
    config: SyncConfig,
    /// Session generation counter. Written only under the view write lock.
    epoch: AtomicU64,
    session_id: RwLock<Option<String>>,
    view: RwLock<SessionView>,
    projections: Mutex<Vec<Projection>>,
    timeline: Arc<TimelineRecorder>,
    metrics: Arc<AggregatorMetrics>,
}

impl SessionAggregator {
    pub fn new(config: SyncConfig, timeline: Arc<TimelineRecorder>) -> Arc<Self> {
        Arc::new(Self {
            config,
            epoch: AtomicU64::new(0),
            session_id: RwLock::new(None),
            view: RwLock::new(SessionView::default()),
            projections: Mutex::new(Vec::new()),
            timeline,
            metrics: Arc::new(AggregatorMetrics::default()),
        })
    }

    /// Token producers must capture at dispatch time and pass back with
    /// their update.
    pub fn token(&self) -> SessionToken {
        SessionToken(self.epoch.load(Ordering::Acquire))
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn metrics(&self) -> &Arc<AggregatorMetrics> {
        &self.metrics
    }

    pub fn timeline(&self) -> &Arc<TimelineRecorder> {
        &self.timeline
    }

    /// Current merged snapshot.
    pub fn view(&self) -> SessionView {
        self.view.read().clone()
    }

    // =========================================================================
    // SESSION LIFECYCLE
    // =========================================================================

    /// Wipe session state back to initial values and advance the token.
    /// Connection status is link state, not session state, and survives.
    pub fn reset_session(&self) -> SessionToken {
        let snapshot = {
            let mut view = self.view.write();
            let connection = view.connection.clone();
            *view = SessionView {
                connection,
                ..SessionView::default()
            };
            // Advancing the epoch under the view lock makes reset atomic
            // against in-flight token-gated applies.
            self.epoch.fetch_add(1, Ordering::Release);
            view.clone()
        };
        self.timeline.clear();
        self.notify(&snapshot);
        debug!(token = self.epoch.load(Ordering::Relaxed), "session reset");
        SessionToken(self.epoch.load(Ordering::Acquire))
    }

    /// Reset plus a `session_start` timeline event for the new session id.
    pub fn start_session(&self, session_id: &str) -> SessionToken {
        let token = self.reset_session();
        *self.session_id.write() = Some(session_id.to_string());
        self.timeline.record(
            EventCategory::SessionStart,
            Some(json!({ "session_id": session_id })),
        );
        info!(session_id, "session started");
        token
    }

    /// Explicit session end. State stays readable until the next reset.
    pub fn end_session(&self) {
        let session_id = self.session_id();
        self.timeline.record(
            EventCategory::SessionStop,
            session_id.as_deref().map(|id| json!({ "session_id": id })),
        );
        info!(session_id = session_id.as_deref().unwrap_or(""), "session ended");
    }

    // =========================================================================
    // FIELD-LEVEL MERGE (token-gated)
    // =========================================================================

    pub fn apply_audio(&self, token: SessionToken, patch: &AudioPatch) {
        self.apply(token, |view| {
            let was_speech = view.audio.is_speech;
            view.audio.merge(patch);
            if !was_speech && view.audio.is_speech {
                Some((EventCategory::SpeechDetected, None))
            } else {
                None
            }
        });
    }

    pub fn apply_video(&self, token: SessionToken, patch: &VideoPatch) {
        self.apply(token, |view| {
            let had_face = view.video.face_count > 0;
            let prior_emotion = view.video.dominant_emotion.clone();
            view.video.merge(patch);

            if !had_face && view.video.face_count > 0 {
                return Some((EventCategory::FaceDetected, None));
            }
            if view.video.dominant_emotion != prior_emotion
                && view.video.confidence >= EMOTION_SPIKE_MIN_CONFIDENCE
            {
                return Some((
                    EventCategory::EmotionSpike,
                    Some(json!({
                        "emotion": view.video.dominant_emotion,
                        "confidence": view.video.confidence,
                    })),
                ));
            }
            None
        });
    }

    pub fn apply_agent(&self, token: SessionToken, patch: &AgentPatch) {
        let metrics = self.metrics.clone();
        self.apply(token, |view| {
            let had_verdict = view.agent.final_state.is_some();
            let conflict = view.agent.merge(patch);
            if conflict {
                metrics.verdict_conflicts.fetch_add(1, Ordering::Relaxed);
                if let Some(current) = view.agent.final_state {
                    warn!(
                        current = %current,
                        "dropped conflicting final verdict; session reset required"
                    );
                }
            }
            match view.agent.final_state {
                Some(verdict) if !had_verdict => Some((
                    EventCategory::ResultReady,
                    Some(json!({ "final_state": verdict.to_string() })),
                )),
                _ => None,
            }
        });
    }

    /// Surface an application-level `error` frame. Auto-dismissed after the
    /// configured window; never touches recording state.
    pub fn apply_error(&self, token: SessionToken, message: &str) {
        let metrics = self.metrics.clone();
        self.apply(token, |view| {
            metrics.errors_surfaced.fetch_add(1, Ordering::Relaxed);
            view.last_error = Some(SurfacedError {
                message: message.to_string(),
                raised_at: Instant::now(),
            });
            None
        });
    }

    /// Link state is not session-scoped: not token-gated, survives resets.
    pub fn apply_connection(&self, info: ConnectionInfo) {
        let snapshot = {
            let mut view = self.view.write();
            view.connection = info;
            view.clone()
        };
        self.notify(&snapshot);
    }

    /// Dispatch one decoded push-channel frame.
    pub fn apply_inbound(&self, token: SessionToken, inbound: Inbound) {
        match inbound {
            Inbound::Video(patch) => self.apply_video(token, &patch),
            Inbound::Audio(patch) => self.apply_audio(token, &patch),
            Inbound::SessionFlags { video, audio } => {
                self.apply_video(token, &video);
                self.apply_audio(token, &audio);
            }
            Inbound::Agent(patch) => self.apply_agent(token, &patch),
            Inbound::Error(message) => self.apply_error(token, &message),
            Inbound::SessionCompleted => {
                if token == self.token() {
                    self.end_session();
                }
            }
            // Liveness and connection acks belong to the connection manager.
            Inbound::Connected | Inbound::Disconnected | Inbound::Liveness => {}
        }
    }

    /// The error slot, hidden once the auto-dismiss window elapses.
    pub fn visible_error(&self) -> Option<String> {
        let view = self.view.read();
        view.last_error.as_ref().and_then(|e| {
            (e.raised_at.elapsed() < self.config.error_dismiss()).then(|| e.message.clone())
        })
    }

    // =========================================================================
    // SUBSCRIPTIONS
    // =========================================================================

    /// Register a projection. The returned receiver is updated only when the
    /// projected value changes (equality by value, not identity).
    pub fn project<T, F>(&self, project: F) -> watch::Receiver<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&SessionView) -> T + Send + Sync + 'static,
    {
        let initial = project(&self.view.read());
        let (tx, rx) = watch::channel(initial);
        self.projections.lock().push(Box::new(move |view| {
            tx.send_if_modified(|current| {
                let next = project(view);
                if *current != next {
                    *current = next;
                    true
                } else {
                    false
                }
            });
        }));
        rx
    }

    /// Full-view subscription.
    pub fn subscribe_view(&self) -> watch::Receiver<SessionView> {
        self.project(|view| view.clone())
    }

    // =========================================================================
    // INTERNAL
    // =========================================================================

    /// Run one token-gated mutation. The closure may return a derived
    /// timeline event (edge-triggered, computed against pre-merge state).
    fn apply<F>(&self, token: SessionToken, mutate: F)
    where
        F: FnOnce(&mut SessionView) -> Option<(EventCategory, Option<serde_json::Value>)>,
    {
        let (snapshot, event) = {
            let mut view = self.view.write();
            // Checked under the same lock reset writes under: atomic.
            if token.0 != self.epoch.load(Ordering::Acquire) {
                self.metrics.stale_token_drops.fetch_add(1, Ordering::Relaxed);
                debug!(stale = token.0, "dropped update from superseded session");
                return;
            }
            let event = mutate(&mut view);
            (view.clone(), event)
        };

        self.metrics.updates_applied.fetch_add(1, Ordering::Relaxed);
        if let Some((category, payload)) = event {
            self.timeline.record(category, payload);
        }
        self.notify(&snapshot);
    }

    fn notify(&self, view: &SessionView) {
        for projection in self.projections.lock().iter() {
            projection(view);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FinalVerdict;
    use std::collections::HashMap;

    fn aggregator() -> Arc<SessionAggregator> {
        let config = SyncConfig::default();
        let timeline = Arc::new(TimelineRecorder::new(config.timeline_capacity));
        SessionAggregator::new(config, timeline)
    }

    fn video_frames(total_frames: u64, happy: u64) -> VideoPatch {
        VideoPatch {
            total_frames: Some(total_frames),
            emotion_counts: Some(HashMap::from([("happy".to_string(), happy)])),
            ..Default::default()
        }
    }

    #[test]
    fn test_stale_token_update_is_dropped() {
        let agg = aggregator();
        let stale = agg.start_session("sess-1");
        agg.apply_video(stale, &video_frames(10, 5));

        // Reset supersedes the session; the delayed update must be a no-op.
        let fresh = agg.start_session("sess-2");
        let after_reset = agg.view();
        agg.apply_video(stale, &video_frames(99, 77));

        assert_eq!(agg.view(), after_reset);
        assert_eq!(
            agg.metrics().stale_token_drops.load(Ordering::Relaxed),
            1
        );

        // The fresh token still applies.
        agg.apply_video(fresh, &video_frames(3, 1));
        assert_eq!(agg.view().video.total_frames, 3);
    }

    #[test]
    fn test_reset_wipes_session_but_not_connection() {
        let agg = aggregator();
        let token = agg.start_session("sess-1");
        agg.apply_connection(ConnectionInfo {
            state: crate::models::ConnectionState::Connected,
            ..Default::default()
        });
        agg.apply_video(token, &video_frames(40, 20));
        agg.apply_agent(
            token,
            &AgentPatch {
                final_state: Some(FinalVerdict::Satisfied),
                ..Default::default()
            },
        );

        agg.reset_session();
        let view = agg.view();
        assert_eq!(view.video.total_frames, 0);
        assert_eq!(view.agent.final_state, None);
        assert_eq!(
            view.connection.state,
            crate::models::ConnectionState::Connected
        );
        assert!(agg.timeline().is_empty());
    }

    #[test]
    fn test_projection_notified_only_on_value_change() {
        let agg = aggregator();
        let token = agg.start_session("sess-1");
        let mut emotion = agg.project(|v| v.video.dominant_emotion.clone());
        emotion.borrow_and_update();

        // Audio update: the projected slice is untouched.
        agg.apply_audio(
            token,
            &AudioPatch {
                amplitude: Some(0.5),
                ..Default::default()
            },
        );
        assert!(!emotion.has_changed().unwrap());

        // Same dominant emotion: still no wakeup.
        agg.apply_video(
            token,
            &VideoPatch {
                dominant_emotion: Some("neutral".to_string()),
                ..Default::default()
            },
        );
        assert!(!emotion.has_changed().unwrap());

        agg.apply_video(
            token,
            &VideoPatch {
                dominant_emotion: Some("happy".to_string()),
                ..Default::default()
            },
        );
        assert!(emotion.has_changed().unwrap());
        assert_eq!(*emotion.borrow_and_update(), "happy");
    }

    #[test]
    fn test_speech_and_face_events_are_edge_triggered() {
        let agg = aggregator();
        let token = agg.start_session("sess-1");

        for _ in 0..5 {
            agg.apply_audio(
                token,
                &AudioPatch {
                    is_speech: Some(true),
                    ..Default::default()
                },
            );
            agg.apply_video(
                token,
                &VideoPatch {
                    face_count: Some(1),
                    ..Default::default()
                },
            );
        }

        let events = agg.timeline().events();
        let speech = events
            .iter()
            .filter(|e| e.category == EventCategory::SpeechDetected)
            .count();
        let face = events
            .iter()
            .filter(|e| e.category == EventCategory::FaceDetected)
            .count();
        assert_eq!(speech, 1);
        assert_eq!(face, 1);
    }

    #[test]
    fn test_result_ready_recorded_once() {
        let agg = aggregator();
        let token = agg.start_session("sess-1");

        agg.apply_agent(
            token,
            &AgentPatch {
                final_state: Some(FinalVerdict::Neutral),
                ..Default::default()
            },
        );
        agg.apply_agent(
            token,
            &AgentPatch {
                final_state: Some(FinalVerdict::Satisfied),
                ..Default::default()
            },
        );

        let ready = agg
            .timeline()
            .events()
            .iter()
            .filter(|e| e.category == EventCategory::ResultReady)
            .count();
        assert_eq!(ready, 1);
        assert_eq!(agg.view().agent.final_state, Some(FinalVerdict::Neutral));
        assert_eq!(agg.metrics().verdict_conflicts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_error_slot_auto_dismisses() {
        let mut config = SyncConfig::default();
        config.error_dismiss_ms = 0; // dismiss immediately
        let timeline = Arc::new(TimelineRecorder::new(config.timeline_capacity));
        let agg = SessionAggregator::new(config, timeline);
        let token = agg.start_session("sess-1");

        agg.apply_error(token, "inference backend unavailable");
        assert!(agg.visible_error().is_none());
        // The raw slot still holds the error until the next reset.
        assert!(agg.view().last_error.is_some());

        let agg = aggregator();
        let token = agg.start_session("sess-1");
        agg.apply_error(token, "inference backend unavailable");
        assert_eq!(
            agg.visible_error().as_deref(),
            Some("inference backend unavailable")
        );
    }

    #[test]
    fn test_apply_is_idempotent() {
        let agg = aggregator();
        let token = agg.start_session("sess-1");
        let patch = AudioPatch {
            amplitude: Some(0.3),
            is_speech: Some(false),
            duration: Some(1.5),
            ..Default::default()
        };

        agg.apply_audio(token, &patch);
        let once = agg.view();
        agg.apply_audio(token, &patch);
        assert_eq!(agg.view(), once);
    }
}
