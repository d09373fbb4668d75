//! Session view data model.
//!
//! `SessionView` is the merged, externally-observable snapshot of one
//! monitoring session. Producers (push channel, poll loops) submit partial
//! patches; only fields present in a patch overwrite the view (last writer
//! wins at field granularity). Counters and durations are clamped so they
//! never decrease within a session; only a session reset lowers them.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// Field-by-field tolerant decode: a field with an unexpected type decodes to
/// `None` instead of failing the whole patch.
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

// =============================================================================
// CONNECTION
// =============================================================================

/// Push-channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
        }
    }
}

/// Snapshot of the connection manager, mirrored into the aggregator so
/// consumers can subscribe to link health alongside session data.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    /// Attempts since the last successful connect.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

// =============================================================================
// AUDIO
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioStatus {
    #[default]
    Idle,
    Recording,
    Processing,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AudioView {
    /// Current amplitude, 0.0..=1.0.
    pub amplitude: f64,
    pub is_speech: bool,
    /// Elapsed recording duration in seconds. Non-decreasing within a session.
    pub duration: f64,
    pub status: AudioStatus,
    pub total_frames: u64,
    pub speech_frames: u64,
    pub error: Option<String>,
}

/// Partial audio update. Absent or malformed fields leave the view untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudioPatch {
    #[serde(default, deserialize_with = "lenient")]
    pub amplitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub is_speech: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub duration: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<AudioStatus>,
    #[serde(default, deserialize_with = "lenient")]
    pub total_frames: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub speech_frames: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub error: Option<String>,
}

impl AudioView {
    pub fn merge(&mut self, patch: &AudioPatch) {
        if let Some(a) = patch.amplitude {
            self.amplitude = a.clamp(0.0, 1.0);
        }
        if let Some(s) = patch.is_speech {
            self.is_speech = s;
        }
        if let Some(d) = patch.duration {
            // Monotonic within a session: stale snapshots never rewind.
            self.duration = self.duration.max(d);
        }
        if let Some(st) = patch.status {
            self.status = st;
        }
        if let Some(f) = patch.total_frames {
            self.total_frames = self.total_frames.max(f);
        }
        if let Some(f) = patch.speech_frames {
            self.speech_frames = self.speech_frames.max(f);
        }
        if let Some(e) = &patch.error {
            self.error = Some(e.clone());
        }
    }
}

// =============================================================================
// VIDEO
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoView {
    pub face_count: u32,
    /// Dominant emotion label, stored lower-cased.
    pub dominant_emotion: String,
    /// Model confidence for the dominant emotion, 0.0..=1.0.
    pub confidence: f64,
    /// Cumulative processed frames. Non-decreasing within a session.
    pub total_frames: u64,
    /// Per-emotion cumulative counts. Each value non-decreasing within a session.
    pub emotion_counts: HashMap<String, u64>,
    pub is_recording: bool,
    pub duration: f64,
}

impl Default for VideoView {
    fn default() -> Self {
        Self {
            face_count: 0,
            dominant_emotion: "neutral".to_string(),
            confidence: 0.0,
            total_frames: 0,
            emotion_counts: HashMap::new(),
            is_recording: false,
            duration: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoPatch {
    #[serde(default, deserialize_with = "lenient")]
    pub face_count: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    pub dominant_emotion: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub confidence: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub total_frames: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub emotion_counts: Option<HashMap<String, u64>>,
    #[serde(default, deserialize_with = "lenient")]
    pub is_recording: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub duration: Option<f64>,
}

impl VideoView {
    pub fn merge(&mut self, patch: &VideoPatch) {
        if let Some(n) = patch.face_count {
            self.face_count = n;
        }
        if let Some(e) = &patch.dominant_emotion {
            self.dominant_emotion = e.to_lowercase();
        }
        if let Some(c) = patch.confidence {
            self.confidence = c.clamp(0.0, 1.0);
        }
        if let Some(f) = patch.total_frames {
            self.total_frames = self.total_frames.max(f);
        }
        if let Some(counts) = &patch.emotion_counts {
            for (label, count) in counts {
                let entry = self.emotion_counts.entry(label.to_lowercase()).or_insert(0);
                *entry = (*entry).max(*count);
            }
        }
        if let Some(r) = patch.is_recording {
            self.is_recording = r;
        }
        if let Some(d) = patch.duration {
            self.duration = d;
        }
    }
}

// =============================================================================
// AGENT
// =============================================================================

/// Final satisfaction verdict. Terminal once set for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalVerdict {
    Satisfied,
    Neutral,
    Dissatisfied,
}

impl std::fmt::Display for FinalVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Satisfied => write!(f, "SATISFIED"),
            Self::Neutral => write!(f, "NEUTRAL"),
            Self::Dissatisfied => write!(f, "DISSATISFIED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AgentView {
    pub final_state: Option<FinalVerdict>,
    /// Per-label confidence, 0.0..=1.0 each. Not required to sum to 1.0.
    pub confidence: HashMap<String, f64>,
    pub reasoning: Vec<String>,
    pub recommendation: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentPatch {
    #[serde(default, deserialize_with = "lenient")]
    pub final_state: Option<FinalVerdict>,
    #[serde(default, deserialize_with = "lenient")]
    pub confidence: Option<HashMap<String, f64>>,
    #[serde(default, deserialize_with = "lenient")]
    pub reasoning: Option<Vec<String>>,
    #[serde(default, deserialize_with = "lenient")]
    pub recommendation: Option<String>,
}

impl AgentView {
    /// Merge a partial update. Returns `true` if a conflicting verdict was
    /// dropped (final state is terminal until the session resets).
    pub fn merge(&mut self, patch: &AgentPatch) -> bool {
        let mut conflict = false;
        if let Some(v) = patch.final_state {
            match self.final_state {
                None => self.final_state = Some(v),
                Some(current) if current != v => conflict = true,
                Some(_) => {}
            }
        }
        if let Some(c) = &patch.confidence {
            self.confidence = c.clone();
        }
        if let Some(r) = &patch.reasoning {
            self.reasoning = r.clone();
        }
        if let Some(r) = &patch.recommendation {
            self.recommendation = r.clone();
        }
        conflict
    }
}

// =============================================================================
// COMPOSITE VIEW
// =============================================================================

/// Error surfaced from an explicit server `error` frame. Shown to the user
/// until the auto-dismiss window elapses; never merged into session data.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfacedError {
    pub message: String,
    pub raised_at: Instant,
}

/// The merged, externally-observable session snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SessionView {
    pub audio: AudioView,
    pub video: VideoView,
    pub agent: AgentView,
    pub connection: ConnectionInfo,
    #[serde(skip)]
    pub last_error: Option<SurfacedError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_merge_is_idempotent() {
        let patch: AudioPatch = serde_json::from_str(
            r#"{"amplitude": 0.42, "is_speech": true, "duration": 3.5}"#,
        )
        .unwrap();

        let mut once = AudioView::default();
        once.merge(&patch);

        let mut twice = AudioView::default();
        twice.merge(&patch);
        twice.merge(&patch);

        assert_eq!(once, twice);
        assert_eq!(once.amplitude, 0.42);
        assert!(once.is_speech);
    }

    #[test]
    fn test_audio_duration_never_rewinds() {
        let mut view = AudioView::default();
        view.merge(&AudioPatch {
            duration: Some(10.0),
            ..Default::default()
        });
        // A stale snapshot from the slower poll path arrives late.
        view.merge(&AudioPatch {
            duration: Some(4.0),
            ..Default::default()
        });
        assert_eq!(view.duration, 10.0);
    }

    #[test]
    fn test_video_counters_monotonic() {
        let mut view = VideoView::default();
        for (frames, happy) in [(10, 5), (25, 12), (7, 3), (40, 20)] {
            view.merge(&VideoPatch {
                total_frames: Some(frames),
                emotion_counts: Some(HashMap::from([("happy".to_string(), happy)])),
                ..Default::default()
            });
        }
        assert_eq!(view.total_frames, 40);
        assert_eq!(view.emotion_counts["happy"], 20);
    }

    #[test]
    fn test_video_dominant_emotion_case_folded() {
        let mut view = VideoView::default();
        view.merge(&VideoPatch {
            dominant_emotion: Some("Happy".to_string()),
            emotion_counts: Some(HashMap::from([("HAPPY".to_string(), 3)])),
            ..Default::default()
        });
        assert_eq!(view.dominant_emotion, "happy");
        assert_eq!(view.emotion_counts["happy"], 3);
    }

    #[test]
    fn test_agent_verdict_is_terminal() {
        let mut view = AgentView::default();
        let conflict = view.merge(&AgentPatch {
            final_state: Some(FinalVerdict::Satisfied),
            ..Default::default()
        });
        assert!(!conflict);

        let conflict = view.merge(&AgentPatch {
            final_state: Some(FinalVerdict::Neutral),
            ..Default::default()
        });
        assert!(conflict);
        assert_eq!(view.final_state, Some(FinalVerdict::Satisfied));

        // Re-applying the same verdict is a silent no-op.
        let conflict = view.merge(&AgentPatch {
            final_state: Some(FinalVerdict::Satisfied),
            ..Default::default()
        });
        assert!(!conflict);
    }

    #[test]
    fn test_patch_decode_drops_malformed_fields_only() {
        // amplitude has the wrong type; the other fields must still land.
        let patch: AudioPatch = serde_json::from_str(
            r#"{"amplitude": "loud", "is_speech": true, "duration": 2.0}"#,
        )
        .unwrap();
        assert!(patch.amplitude.is_none());
        assert_eq!(patch.is_speech, Some(true));
        assert_eq!(patch.duration, Some(2.0));
    }

    #[test]
    fn test_patch_decode_ignores_unknown_fields() {
        let patch: VideoPatch = serde_json::from_str(
            r#"{"total_frames": 12, "fps": 29.7, "boxes": [[0, 0, 10, 10]]}"#,
        )
        .unwrap();
        assert_eq!(patch.total_frames, Some(12));
    }

    #[test]
    fn test_final_verdict_wire_format() {
        let v: FinalVerdict = serde_json::from_str(r#""SATISFIED""#).unwrap();
        assert_eq!(v, FinalVerdict::Satisfied);
        assert_eq!(serde_json::to_string(&v).unwrap(), r#""SATISFIED""#);
    }
}
