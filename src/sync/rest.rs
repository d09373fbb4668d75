//! REST client for the monitor's read endpoints.
//!
//! Two polled endpoints (audio live metrics, video statistics) plus the
//! single-shot analysis endpoint invoked once per session on demand. The
//! session id is threaded through every request as an opaque correlation
//! key; this client never validates its format.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::time::Duration;

use crate::models::{AgentPatch, AudioPatch, VideoPatch};
use crate::sync::poller::{FieldUpdate, SnapshotSource};

/// Shape of `GET /video/statistics`. Field names differ from the view, so
/// this is decoded separately and mapped onto a `VideoPatch`.
#[derive(Debug, Default, Deserialize)]
struct VideoStatisticsResponse {
    #[serde(default, deserialize_with = "crate::models::lenient")]
    is_recording: Option<bool>,
    #[serde(default, deserialize_with = "crate::models::lenient")]
    total_frames: Option<u64>,
    #[serde(default, deserialize_with = "crate::models::lenient")]
    duration_seconds: Option<f64>,
    #[serde(default, deserialize_with = "crate::models::lenient")]
    counts: Option<std::collections::HashMap<String, u64>>,
    #[serde(default, deserialize_with = "crate::models::lenient")]
    current_emotion: Option<String>,
    #[serde(default, deserialize_with = "crate::models::lenient")]
    current_confidence: Option<f64>,
}

impl From<VideoStatisticsResponse> for VideoPatch {
    fn from(stats: VideoStatisticsResponse) -> Self {
        VideoPatch {
            is_recording: stats.is_recording,
            total_frames: stats.total_frames,
            duration: stats.duration_seconds,
            emotion_counts: stats.counts,
            dominant_emotion: stats.current_emotion,
            confidence: stats.current_confidence,
            ..Default::default()
        }
    }
}

/// HTTP client with connection pooling for the monitor backend.
#[derive(Clone)]
pub struct MonitorApi {
    client: Client,
    base_url: String,
    session_id: String,
}

impl MonitorApi {
    pub fn new(
        base_url: impl Into<String>,
        session_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_id: session_id.into(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(&[("session_id", self.session_id.as_str())])
            .send()
            .await
            .with_context(|| format!("request to {} failed", path))?;

        let status = response.status();
        if !status.is_success() {
            bail!("{} returned {}", path, status);
        }
        response
            .json()
            .await
            .with_context(|| format!("failed to decode {} response", path))
    }

    /// `GET /audio/live-metrics`: amplitude, speech flag, duration.
    pub async fn live_metrics(&self) -> Result<AudioPatch> {
        self.get_json("/audio/live-metrics").await
    }

    /// `GET /video/statistics`: cumulative frame and emotion counters.
    pub async fn video_statistics(&self) -> Result<VideoPatch> {
        let stats: VideoStatisticsResponse = self.get_json("/video/statistics").await?;
        Ok(stats.into())
    }

    /// `POST /result/analyze`: single-shot final analysis, on demand.
    pub async fn analyze(&self) -> Result<AgentPatch> {
        let url = format!("{}/result/analyze", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("session_id", self.session_id.as_str())])
            .send()
            .await
            .context("analysis request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("/result/analyze returned {}", status);
        }
        response
            .json()
            .await
            .context("failed to decode analysis response")
    }
}

/// Fast poll source: audio live metrics (~20 Hz).
pub struct AudioMetricsSource {
    api: Arc<MonitorApi>,
}

impl AudioMetricsSource {
    pub fn new(api: Arc<MonitorApi>) -> Arc<Self> {
        Arc::new(Self { api })
    }
}

#[async_trait]
impl SnapshotSource for AudioMetricsSource {
    async fn fetch(&self) -> Result<FieldUpdate> {
        Ok(FieldUpdate::Audio(self.api.live_metrics().await?))
    }
}

/// Slow poll source: video statistics (2-5 Hz).
pub struct VideoStatisticsSource {
    api: Arc<MonitorApi>,
}

impl VideoStatisticsSource {
    pub fn new(api: Arc<MonitorApi>) -> Arc<Self> {
        Arc::new(Self { api })
    }
}

#[async_trait]
impl SnapshotSource for VideoStatisticsSource {
    async fn fetch(&self) -> Result<FieldUpdate> {
        Ok(FieldUpdate::Video(self.api.video_statistics().await?))
    }
}
