//! Bounded timeline of notable session events.
//!
//! The recorder keeps the last N derived events (session start/stop, result
//! ready, edge-triggered detections) for display. Appending is O(1), never
//! fails, and never blocks a producer; the oldest event is evicted first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    SessionStart,
    SessionStop,
    EmotionSpike,
    SpeechDetected,
    FaceDetected,
    ResultReady,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionStart => write!(f, "session_start"),
            Self::SessionStop => write!(f, "session_stop"),
            Self::EmotionSpike => write!(f, "emotion_spike"),
            Self::SpeechDetected => write!(f, "speech_detected"),
            Self::FaceDetected => write!(f, "face_detected"),
            Self::ResultReady => write!(f, "result_ready"),
        }
    }
}

/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    pub id: u64,
    pub category: EventCategory,
    pub timestamp: DateTime<Utc>,
    pub payload: Option<Value>,
}

#[derive(Debug)]
pub struct TimelineRecorder {
    capacity: usize,
    events: Mutex<VecDeque<TimelineEvent>>,
    next_id: AtomicU64,
}

impl TimelineRecorder {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append one event, evicting the oldest when full.
    pub fn record(&self, category: EventCategory, payload: Option<Value>) {
        let event = TimelineEvent {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            category,
            timestamp: Utc::now(),
            payload,
        };

        let mut events = self.events.lock();
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Snapshot in insertion order, oldest first.
    pub fn events(&self) -> Vec<TimelineEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Wipe on session reset. Event ids keep increasing across sessions.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}
