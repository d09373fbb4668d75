//! Push-channel wire contract.
//!
//! Every inbound frame is a tagged envelope `{type, session_id, timestamp,
//! data}`. Dispatch is a closed variant match on the `type` tag: known kinds
//! decode their `data` payload into the matching view patch, unknown kinds
//! are dropped. A frame that fails to decode never propagates as a crash.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::models::{AgentPatch, AudioPatch, AudioStatus, VideoPatch};

/// Frame tags the server may send. Unrecognized tags fold into `Unknown` and
/// are dropped by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Connected,
    Disconnected,
    VideoStats,
    AudioMetrics,
    AudioStatus,
    SessionState,
    SessionCompleted,
    FinalResult,
    Error,
    Heartbeat,
    Pong,
    #[serde(other)]
    Unknown,
}

/// Raw inbound envelope. `timestamp` is a string on data frames and a float
/// on heartbeat/pong frames, so it stays an opaque `Value`.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Value,
    #[serde(default)]
    pub data: Value,
}

/// Outbound client probe, the only frame we send.
pub const PING_FRAME: &str = r#"{"type":"ping"}"#;

#[derive(Debug, Default, Deserialize)]
struct AudioStatusData {
    #[serde(default, deserialize_with = "crate::models::lenient")]
    status: Option<AudioStatus>,
    #[serde(default, deserialize_with = "crate::models::lenient")]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionStateData {
    #[serde(default, deserialize_with = "crate::models::lenient")]
    video_active: Option<bool>,
    #[serde(default, deserialize_with = "crate::models::lenient")]
    audio_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorData {
    #[serde(default, deserialize_with = "crate::models::lenient")]
    message: Option<String>,
}

/// Decoded frame, ready to hand to the aggregator.
#[derive(Debug)]
pub enum Inbound {
    /// Subscription confirmed by the server.
    Connected,
    /// Server announced it is dropping us.
    Disconnected,
    Video(VideoPatch),
    Audio(AudioPatch),
    /// `session_state` frame: recording flags for both pipelines at once.
    SessionFlags { video: VideoPatch, audio: AudioPatch },
    /// Explicit session end.
    SessionCompleted,
    Agent(AgentPatch),
    /// Application-level error, surfaced verbatim to the error slot.
    Error(String),
    /// Server heartbeat or pong; liveness only, no view fields.
    Liveness,
}

/// Parse one frame of text off the wire.
pub fn decode_frame(text: &str) -> Result<Option<Inbound>> {
    let envelope: Envelope =
        serde_json::from_str(text).context("frame is not a valid envelope")?;
    Ok(envelope.into_inbound())
}

impl Envelope {
    /// Map the envelope onto a typed inbound event. Returns `None` for frame
    /// kinds that carry nothing for us.
    pub fn into_inbound(self) -> Option<Inbound> {
        match self.kind {
            FrameKind::Connected => Some(Inbound::Connected),
            FrameKind::Disconnected => Some(Inbound::Disconnected),
            FrameKind::VideoStats => {
                let patch: VideoPatch = serde_json::from_value(self.data).unwrap_or_default();
                Some(Inbound::Video(patch))
            }
            FrameKind::AudioMetrics => {
                let patch: AudioPatch = serde_json::from_value(self.data).unwrap_or_default();
                Some(Inbound::Audio(patch))
            }
            FrameKind::AudioStatus => {
                let data: AudioStatusData =
                    serde_json::from_value(self.data).unwrap_or_default();
                Some(Inbound::Audio(AudioPatch {
                    status: data.status,
                    error: data.error,
                    ..Default::default()
                }))
            }
            FrameKind::SessionState => {
                let data: SessionStateData =
                    serde_json::from_value(self.data).unwrap_or_default();
                Some(Inbound::SessionFlags {
                    video: VideoPatch {
                        is_recording: data.video_active,
                        ..Default::default()
                    },
                    audio: AudioPatch {
                        status: data.audio_active.map(|active| {
                            if active {
                                AudioStatus::Recording
                            } else {
                                AudioStatus::Idle
                            }
                        }),
                        ..Default::default()
                    },
                })
            }
            FrameKind::SessionCompleted => Some(Inbound::SessionCompleted),
            FrameKind::FinalResult => {
                let patch: AgentPatch = serde_json::from_value(self.data).unwrap_or_default();
                Some(Inbound::Agent(patch))
            }
            FrameKind::Error => {
                let data: ErrorData = serde_json::from_value(self.data).unwrap_or_default();
                Some(Inbound::Error(
                    data.message
                        .unwrap_or_else(|| "unknown server error".to_string()),
                ))
            }
            FrameKind::Heartbeat | FrameKind::Pong => Some(Inbound::Liveness),
            FrameKind::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_stats_frame_decodes() {
        let text = r#"{
            "type": "video_stats",
            "session_id": "sess-1",
            "timestamp": "2025-01-10T12:00:00",
            "data": {
                "face_count": 1,
                "dominant_emotion": "happy",
                "confidence": 0.91,
                "total_frames": 40,
                "emotion_counts": {"happy": 20, "neutral": 3},
                "duration": 12.5
            }
        }"#;

        match decode_frame(text).unwrap() {
            Some(Inbound::Video(patch)) => {
                assert_eq!(patch.total_frames, Some(40));
                assert_eq!(patch.confidence, Some(0.91));
                assert_eq!(patch.emotion_counts.unwrap()["happy"], 20);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_frame_has_float_timestamp() {
        let text = r#"{"type": "heartbeat", "session_id": "s", "timestamp": 1736510400.5, "server_time": 1736510400.5}"#;
        assert!(matches!(
            decode_frame(text).unwrap(),
            Some(Inbound::Liveness)
        ));
    }

    #[test]
    fn test_unknown_frame_kind_is_dropped() {
        let text = r#"{"type": "debug_snapshot", "session_id": "s", "data": {}}"#;
        assert!(decode_frame(text).unwrap().is_none());
    }

    #[test]
    fn test_malformed_frame_is_an_error_not_a_panic() {
        assert!(decode_frame("not json at all").is_err());
        assert!(decode_frame(r#"{"no_type": true}"#).is_err());
    }

    #[test]
    fn test_error_frame_surfaces_message() {
        let text =
            r#"{"type": "error", "session_id": "s", "data": {"message": "camera lost", "code": "CAM_01"}}"#;
        match decode_frame(text).unwrap() {
            Some(Inbound::Error(message)) => assert_eq!(message, "camera lost"),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_session_state_maps_both_flags() {
        let text = r#"{"type": "session_state", "session_id": "s", "data": {"video_active": true, "audio_active": false, "status": "recording"}}"#;
        match decode_frame(text).unwrap() {
            Some(Inbound::SessionFlags { video, audio }) => {
                assert_eq!(video.is_recording, Some(true));
                assert_eq!(audio.status, Some(AudioStatus::Idle));
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_final_result_frame_decodes() {
        let text = r#"{
            "type": "final_result",
            "session_id": "s",
            "data": {
                "final_state": "SATISFIED",
                "confidence": {"satisfied": 0.8, "neutral": 0.15},
                "reasoning": ["sustained positive affect"],
                "recommendation": "no follow-up needed"
            }
        }"#;
        match decode_frame(text).unwrap() {
            Some(Inbound::Agent(patch)) => {
                assert_eq!(
                    patch.final_state,
                    Some(crate::models::FinalVerdict::Satisfied)
                );
                assert_eq!(patch.reasoning.unwrap().len(), 1);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }
}
