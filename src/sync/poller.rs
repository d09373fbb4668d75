//! Pull-polling loops: the redundant data path.
//!
//! Each coordinator owns one fixed-interval fetch loop against a snapshot
//! source and applies the result to the aggregator. Coordinators run
//! regardless of push-channel health and are fully independent of each
//! other. A failed fetch is logged and skipped; it never kills the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::models::{AgentPatch, AudioPatch, VideoPatch};
use crate::sync::aggregator::SessionAggregator;

/// One point-in-time snapshot from a read endpoint.
#[derive(Debug)]
pub enum FieldUpdate {
    Audio(AudioPatch),
    Video(VideoPatch),
    Agent(AgentPatch),
}

/// A read endpoint the coordinator polls. Production sources wrap the
/// monitor REST API; tests substitute in-memory fakes.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch(&self) -> Result<FieldUpdate>;
}

#[derive(Debug, Default)]
pub struct PollMetrics {
    pub polls_ok: AtomicU64,
    pub polls_failed: AtomicU64,
}

impl PollMetrics {
    pub fn summary(&self) -> String {
        format!(
            "ok={} failed={}",
            self.polls_ok.load(Ordering::Relaxed),
            self.polls_failed.load(Ordering::Relaxed),
        )
    }
}

pub struct PollCoordinator {
    name: &'static str,
    period: Duration,
    source: Arc<dyn SnapshotSource>,
    aggregator: Arc<SessionAggregator>,
    /// Loop generation; `disable()` bumps it and every in-flight completion
    /// re-checks it before applying (timer cancellation alone is not a
    /// guarantee — the generation check is).
    generation: AtomicU64,
    metrics: Arc<PollMetrics>,
}

impl PollCoordinator {
    pub fn new(
        name: &'static str,
        period: Duration,
        source: Arc<dyn SnapshotSource>,
        aggregator: Arc<SessionAggregator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            period,
            source,
            aggregator,
            generation: AtomicU64::new(0),
            metrics: Arc::new(PollMetrics::default()),
        })
    }

    pub fn metrics(&self) -> &Arc<PollMetrics> {
        &self.metrics
    }

    /// Start polling: one immediate fetch, then fixed-interval repeats.
    /// Re-enabling supersedes any previous loop.
    pub fn enable(self: &Arc<Self>) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            coordinator = self.name,
            period_ms = self.period.as_millis() as u64,
            "poll coordinator enabled"
        );

        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(coordinator.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                // First tick completes immediately.
                ticker.tick().await;
                if !coordinator.is_current(generation) {
                    return;
                }
                coordinator.poll_once(generation).await;
            }
        });
    }

    /// Stop polling. The generation is invalidated before this returns: no
    /// further fetches start, and a completion that observes the bump is
    /// discarded.
    pub fn disable(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        info!(coordinator = self.name, "poll coordinator disabled");
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    async fn poll_once(&self, generation: u64) {
        // Session token captured at dispatch time, before the fetch: if a
        // reset lands while the request is in flight, the stale snapshot is
        // dropped by the aggregator.
        let token = self.aggregator.token();

        match self.source.fetch().await {
            Ok(update) => {
                if !self.is_current(generation) {
                    return;
                }
                self.metrics.polls_ok.fetch_add(1, Ordering::Relaxed);
                match update {
                    FieldUpdate::Audio(patch) => self.aggregator.apply_audio(token, &patch),
                    FieldUpdate::Video(patch) => self.aggregator.apply_video(token, &patch),
                    FieldUpdate::Agent(patch) => self.aggregator.apply_agent(token, &patch),
                }
            }
            Err(e) => {
                // Transient and independent: skip this cycle, keep the loop.
                self.metrics.polls_failed.fetch_add(1, Ordering::Relaxed);
                warn!(coordinator = self.name, error = %e, "poll fetch failed; skipping cycle");
            }
        }
        debug!(coordinator = self.name, "poll cycle complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::sync::timeline::TimelineRecorder;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicBool;

    struct CountingSource {
        amplitude: f64,
        fetches: AtomicU64,
    }

    #[async_trait]
    impl SnapshotSource for CountingSource {
        async fn fetch(&self) -> Result<FieldUpdate> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            Ok(FieldUpdate::Audio(AudioPatch {
                amplitude: Some(self.amplitude),
                ..Default::default()
            }))
        }
    }

    struct FlakySource {
        fail: AtomicBool,
    }

    #[async_trait]
    impl SnapshotSource for FlakySource {
        async fn fetch(&self) -> Result<FieldUpdate> {
            if self.fail.swap(false, Ordering::Relaxed) {
                return Err(anyhow!("503 from statistics endpoint"));
            }
            Ok(FieldUpdate::Video(VideoPatch {
                total_frames: Some(5),
                ..Default::default()
            }))
        }
    }

    fn aggregator() -> Arc<SessionAggregator> {
        let config = SyncConfig::default();
        let timeline = Arc::new(TimelineRecorder::new(config.timeline_capacity));
        SessionAggregator::new(config, timeline)
    }

    #[tokio::test]
    async fn test_enable_fetches_immediately_then_repeats() {
        let agg = aggregator();
        agg.start_session("sess-1");
        let source = Arc::new(CountingSource {
            amplitude: 0.7,
            fetches: AtomicU64::new(0),
        });
        let coordinator =
            PollCoordinator::new("audio", Duration::from_millis(10), source.clone(), agg.clone());

        coordinator.enable();
        tokio::time::sleep(Duration::from_millis(55)).await;
        coordinator.disable();

        let fetches = source.fetches.load(Ordering::Relaxed);
        assert!(fetches >= 2, "expected repeated fetches, got {}", fetches);
        assert_eq!(agg.view().audio.amplitude, 0.7);
    }

    #[tokio::test]
    async fn test_disable_stops_all_future_mutations() {
        let agg = aggregator();
        agg.start_session("sess-1");
        let source = Arc::new(CountingSource {
            amplitude: 0.9,
            fetches: AtomicU64::new(0),
        });
        let coordinator =
            PollCoordinator::new("audio", Duration::from_millis(5), source.clone(), agg.clone());

        coordinator.enable();
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.disable();

        let fetches_at_disable = source.fetches.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // At most one already-started fetch may complete; it must not apply.
        assert!(source.fetches.load(Ordering::Relaxed) <= fetches_at_disable + 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_cycle_and_continues() {
        let agg = aggregator();
        agg.start_session("sess-1");
        let source = Arc::new(FlakySource {
            fail: AtomicBool::new(true),
        });
        let coordinator =
            PollCoordinator::new("video", Duration::from_millis(10), source, agg.clone());

        coordinator.enable();
        tokio::time::sleep(Duration::from_millis(60)).await;
        coordinator.disable();

        assert!(coordinator.metrics().polls_failed.load(Ordering::Relaxed) >= 1);
        assert!(coordinator.metrics().polls_ok.load(Ordering::Relaxed) >= 1);
        assert_eq!(agg.view().video.total_frames, 5);
    }

    #[tokio::test]
    async fn test_coordinators_are_independent() {
        let agg = aggregator();
        agg.start_session("sess-1");
        let audio = Arc::new(CountingSource {
            amplitude: 0.4,
            fetches: AtomicU64::new(0),
        });
        let video = Arc::new(FlakySource {
            fail: AtomicBool::new(false),
        });

        let fast = PollCoordinator::new("audio", Duration::from_millis(5), audio, agg.clone());
        let slow = PollCoordinator::new("video", Duration::from_millis(20), video, agg.clone());
        fast.enable();
        slow.enable();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Disabling one loop leaves the other running.
        fast.disable();
        let video_ok = slow.metrics().polls_ok.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(slow.metrics().polls_ok.load(Ordering::Relaxed) > video_ok);
        slow.disable();

        let view = agg.view();
        assert_eq!(view.audio.amplitude, 0.4);
        assert_eq!(view.video.total_frames, 5);
    }
}
