//! Pipeline orchestrator.
//!
//! One worker thread pulls a frame, detects, embeds and matches each region,
//! updates the track table, hands confirmed tracks to the access logger and
//! publishes an immutable [`FrameSnapshot`]. Readers subscribe to snapshots
//! through a `watch` channel and never call into the worker.

use crate::access::{deliver, AccessLogger};
use crate::config::{ConfigError, ConfigHandle, PipelineConfig};
use crate::detector::{Detector, MinConfidence};
use crate::frame::{Frame, FrameSource, SourceError};
use crate::gallery::IdentityGallery;
use crate::matcher::{GalleryMatcher, Matcher};
use crate::recognizer::{check_crop_size, EmbedError, Embedder};
use crate::tracker::{Observation, TrackState, TrackTable};
use crate::types::{AccessEvent, BoundingBox, MatchResult, PersonId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

/// Cycles averaged for the published frame rate.
const FPS_WINDOW: usize = 30;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("frame source: {0}")]
    Source(#[from] SourceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("pipeline worker: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionStatus {
    Recognized,
    Unknown,
    /// Crop below the minimum face size; not tracked.
    TooSmall,
    /// Embedding failed for this region; not tracked.
    Failed,
}

/// One detected region as shown to the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedRegion {
    pub bbox: BoundingBox,
    pub status: RegionStatus,
    pub label: String,
    pub person_id: Option<PersonId>,
    pub similarity: Option<f32>,
    pub confidence_pct: Option<f32>,
    pub track_id: Option<u64>,
    pub track_state: Option<TrackState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    /// Rolling average over the last 30 cycles.
    pub fps: f32,
    pub frames_processed: u64,
    pub frames_dark: u64,
    /// Frames the source discarded to stay current.
    pub frames_dropped: u64,
    pub cycles_over_budget: u64,
    pub detection_failures: u64,
    pub embed_failures: u64,
    pub events_emitted: u64,
    pub events_dropped: u64,
    pub active_tracks: usize,
}

/// Result of one cycle, published to subscribers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameSnapshot {
    pub sequence: u64,
    pub processed_at: Option<DateTime<Utc>>,
    pub width: u32,
    pub height: u32,
    pub dark: bool,
    pub regions: Vec<AnnotatedRegion>,
    /// Events written during this cycle, in confirmation order.
    pub events: Vec<AccessEvent>,
    pub gallery_version: u64,
    pub stats: PipelineStats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Processed { regions: usize, events: usize },
    /// Frame too dark for detection.
    Dark,
    /// Detector failed; frame skipped.
    Skipped,
    /// No frame within the timeout.
    Idle,
}

/// Rate-limited reporting of cycles that overran the frame budget and of
/// frames dropped by the source.
#[derive(Debug, Default)]
struct BacklogMonitor {
    last_report: Option<Instant>,
    over_budget: u64,
    dropped_reported: u64,
}

impl BacklogMonitor {
    /// Returns `(over_budget, newly_dropped)` when a report is due.
    fn observe(
        &mut self,
        over_budget: bool,
        dropped_total: u64,
        now: Instant,
        interval: Duration,
    ) -> Option<(u64, u64)> {
        if over_budget {
            self.over_budget += 1;
        }
        let dropped = dropped_total.saturating_sub(self.dropped_reported);
        if self.over_budget == 0 && dropped == 0 {
            return None;
        }
        let due = self
            .last_report
            .map_or(true, |t| now.saturating_duration_since(t) >= interval);
        if !due {
            return None;
        }
        let report = (self.over_budget, dropped);
        self.last_report = Some(now);
        self.over_budget = 0;
        self.dropped_reported = dropped_total;
        Some(report)
    }
}

pub struct Pipeline {
    source: Box<dyn FrameSource>,
    detector: MinConfidence<Box<dyn Detector>>,
    embedder: Box<dyn Embedder>,
    gallery: Arc<IdentityGallery>,
    logger: Arc<dyn AccessLogger>,
    config: ConfigHandle,
    applied: Arc<PipelineConfig>,
    matcher: GalleryMatcher,
    tracks: TrackTable,
    stats: PipelineStats,
    cycle_times: VecDeque<Instant>,
    backlog: BacklogMonitor,
    snapshots: watch::Sender<Arc<FrameSnapshot>>,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Box<dyn Detector>,
        embedder: Box<dyn Embedder>,
        gallery: Arc<IdentityGallery>,
        logger: Arc<dyn AccessLogger>,
        config: ConfigHandle,
    ) -> Result<Self, PipelineError> {
        let applied = config.load();
        applied.validate()?;

        if embedder.dimension() != gallery.dimension() {
            return Err(PipelineError::Config(ConfigError {
                field: "embedding_dimension",
                reason: format!(
                    "embedder produces {} values, gallery stores {}",
                    embedder.dimension(),
                    gallery.dimension()
                ),
            }));
        }

        let (snapshots, _) = watch::channel(Arc::new(FrameSnapshot::default()));

        Ok(Self {
            source,
            detector: MinConfidence::new(detector, applied.min_detection_confidence),
            embedder,
            gallery,
            logger,
            matcher: GalleryMatcher::new(applied.metric),
            tracks: TrackTable::new(applied.tracker_settings()),
            applied,
            config,
            stats: PipelineStats::default(),
            cycle_times: VecDeque::with_capacity(FPS_WINDOW),
            backlog: BacklogMonitor::default(),
            snapshots,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<FrameSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn tracks(&self) -> &TrackTable {
        &self.tracks
    }

    /// Pick up a replaced configuration. Tracks survive the swap.
    fn refresh_config(&mut self) {
        let current = self.config.load();
        if Arc::ptr_eq(&current, &self.applied) {
            return;
        }
        self.detector
            .set_min_confidence(current.min_detection_confidence);
        self.matcher = GalleryMatcher::new(current.metric);
        self.tracks.set_settings(current.tracker_settings());
        tracing::info!(
            confirm_frames = current.confirm_frames,
            threshold = current.acceptance_threshold,
            metric = %current.metric,
            "pipeline picked up new configuration"
        );
        self.applied = current;
    }

    /// Run one acquire → detect → recognize → track → log → publish cycle.
    ///
    /// Only frame source failures other than a timeout are returned as
    /// errors; model failures are logged and the frame or region skipped.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, PipelineError> {
        self.refresh_config();
        let config = Arc::clone(&self.applied);

        let frame = match self.source.next_frame(config.frame_timeout()) {
            Ok(frame) => frame,
            Err(SourceError::Timeout(waited)) => {
                tracing::debug!(?waited, "no frame within timeout");
                self.tracks.expire(Instant::now());
                return Ok(CycleOutcome::Idle);
            }
            Err(e) => return Err(e.into()),
        };
        let started = Instant::now();

        if frame.is_dark {
            self.stats.frames_dark += 1;
            tracing::trace!(sequence = frame.sequence, "dark frame skipped");
            self.finish_cycle(&config, started);
            self.publish(&frame, Vec::new(), Vec::new());
            return Ok(CycleOutcome::Dark);
        }

        let detections = match self.detector.detect(&frame) {
            Ok(d) => d,
            Err(e) => {
                self.stats.detection_failures += 1;
                tracing::warn!(sequence = frame.sequence, error = %e, "detection failed, frame skipped");
                self.finish_cycle(&config, started);
                return Ok(CycleOutcome::Skipped);
            }
        };

        let gallery = self.gallery.snapshot();
        let mut regions = Vec::with_capacity(detections.len());
        let mut observations = Vec::new();
        // Index into `regions` for each observation.
        let mut observed_regions = Vec::new();

        for detection in &detections {
            let bbox = &detection.bbox;
            let embedded = match frame.crop(bbox) {
                Some(crop) => check_crop_size(&crop, config.min_face_size)
                    .and_then(|()| self.embedder.embed(&crop)),
                None => Err(EmbedError::InvalidInput {
                    width: 0,
                    height: 0,
                    min: config.min_face_size,
                }),
            };

            match embedded {
                Ok(embedding) => {
                    let matched =
                        self.matcher
                            .compare(&embedding, &gallery, config.acceptance_threshold);
                    observed_regions.push(regions.len());
                    regions.push(region_for(bbox, &matched));
                    observations.push(Observation::new(detection, matched));
                }
                Err(EmbedError::InvalidInput { width, height, .. }) => {
                    tracing::trace!(width, height, "face crop too small");
                    regions.push(untracked(bbox, RegionStatus::TooSmall));
                }
                Err(e) => {
                    self.stats.embed_failures += 1;
                    tracing::warn!(sequence = frame.sequence, error = %e, "embedding failed, region skipped");
                    regions.push(untracked(bbox, RegionStatus::Failed));
                }
            }
        }

        let confirmations = self.tracks.update(&observations, frame.timestamp);

        for (obs_idx, &track_id) in self.tracks.assignments().iter().enumerate() {
            if let Some(region) = observed_regions.get(obs_idx).and_then(|&i| regions.get_mut(i)) {
                region.track_id = Some(track_id);
                region.track_state = self.tracks.get(track_id).map(|t| t.state);
            }
        }

        let mut events = Vec::new();
        for confirmation in confirmations {
            let track_id = confirmation.track_id;
            if confirmation.person_id.is_some() || config.log_unknown {
                let event = AccessEvent {
                    id: uuid::Uuid::new_v4(),
                    person_id: confirmation.person_id,
                    person_name: confirmation.person_name.clone(),
                    timestamp: Utc::now(),
                    similarity: confirmation.similarity,
                    confidence_pct: MatchResult::unknown(confirmation.similarity)
                        .confidence_pct(),
                    site: config.site.clone(),
                    track_id,
                };

                match deliver(self.logger.as_ref(), &event, config.retry_policy()) {
                    Ok(()) => {
                        self.stats.events_emitted += 1;
                        tracing::info!(
                            person = ?event.person_id,
                            name = event.person_name.as_deref().unwrap_or("unknown"),
                            similarity = event.similarity,
                            track = track_id,
                            "access event recorded"
                        );
                        events.push(event);
                    }
                    Err(e) => {
                        self.stats.events_dropped += 1;
                        tracing::warn!(
                            event = %event.id,
                            person = ?event.person_id,
                            attempts = config.log_retry_attempts,
                            error = %e,
                            "dropped access event"
                        );
                    }
                }
            }
            self.tracks.mark_logged(track_id, frame.timestamp);
            if let Some(region) = regions.iter_mut().find(|r| r.track_id == Some(track_id)) {
                region.track_state = Some(TrackState::Logged);
            }
        }

        let outcome = CycleOutcome::Processed {
            regions: regions.len(),
            events: events.len(),
        };
        self.finish_cycle(&config, started);
        self.publish_with_gallery(&frame, regions, events, gallery.version());
        Ok(outcome)
    }

    /// Loop until `stop` is set or the source fails.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<PipelineStats, PipelineError> {
        tracing::info!(
            target_fps = self.applied.target_fps,
            site = %self.applied.site,
            persons = self.gallery.len(),
            "pipeline started"
        );
        while !stop.load(Ordering::Relaxed) {
            if let Err(e) = self.run_cycle() {
                tracing::error!(error = %e, "pipeline stopped on source failure");
                return Err(e);
            }
        }
        tracing::info!(
            frames = self.stats.frames_processed,
            events = self.stats.events_emitted,
            "pipeline stopped"
        );
        Ok(self.stats.clone())
    }

    /// Move the pipeline onto a dedicated worker thread.
    ///
    /// The frame source is dropped, and with it the camera released, when the
    /// worker exits on any path.
    pub fn spawn(mut self) -> Result<PipelineHandle, PipelineError> {
        let stop = Arc::new(AtomicBool::new(false));
        let snapshots = self.subscribe();
        let worker_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("yologuard-pipeline".into())
            .spawn(move || self.run(&worker_stop))
            .map_err(|e| PipelineError::Worker(e.to_string()))?;

        Ok(PipelineHandle {
            stop,
            snapshots,
            thread: Some(thread),
        })
    }

    fn finish_cycle(&mut self, config: &PipelineConfig, started: Instant) {
        let now = Instant::now();
        self.stats.frames_processed += 1;

        if self.cycle_times.len() == FPS_WINDOW {
            self.cycle_times.pop_front();
        }
        self.cycle_times.push_back(now);
        self.stats.fps = match (self.cycle_times.front(), self.cycle_times.back()) {
            (Some(first), Some(last)) if self.cycle_times.len() > 1 => {
                let span = last.duration_since(*first).as_secs_f32();
                if span > 0.0 {
                    (self.cycle_times.len() - 1) as f32 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        let over_budget = now.duration_since(started) > config.frame_budget();
        if over_budget {
            self.stats.cycles_over_budget += 1;
        }
        self.stats.frames_dropped = self.source.dropped_frames();
        self.stats.active_tracks = self.tracks.len();

        if let Some((slow, dropped)) = self.backlog.observe(
            over_budget,
            self.stats.frames_dropped,
            now,
            config.backlog_report_interval(),
        ) {
            tracing::warn!(
                slow_cycles = slow,
                dropped_frames = dropped,
                budget_ms = config.frame_budget().as_millis() as u64,
                "pipeline falling behind the camera"
            );
        }
    }

    fn publish(&self, frame: &Frame, regions: Vec<AnnotatedRegion>, events: Vec<AccessEvent>) {
        let version = self.gallery.snapshot().version();
        self.publish_with_gallery(frame, regions, events, version);
    }

    fn publish_with_gallery(
        &self,
        frame: &Frame,
        regions: Vec<AnnotatedRegion>,
        events: Vec<AccessEvent>,
        gallery_version: u64,
    ) {
        self.snapshots.send_replace(Arc::new(FrameSnapshot {
            sequence: frame.sequence,
            processed_at: Some(Utc::now()),
            width: frame.width,
            height: frame.height,
            dark: frame.is_dark,
            regions,
            events,
            gallery_version,
            stats: self.stats.clone(),
        }));
    }
}

fn region_for(bbox: &BoundingBox, matched: &MatchResult) -> AnnotatedRegion {
    let (status, label) = match &matched.person_name {
        Some(name) if matched.is_match() => (RegionStatus::Recognized, name.clone()),
        _ => (RegionStatus::Unknown, "unknown".to_string()),
    };
    AnnotatedRegion {
        bbox: bbox.clone(),
        status,
        label,
        person_id: matched.person_id,
        similarity: Some(matched.similarity),
        confidence_pct: Some(matched.confidence_pct()),
        track_id: None,
        track_state: None,
    }
}

fn untracked(bbox: &BoundingBox, status: RegionStatus) -> AnnotatedRegion {
    AnnotatedRegion {
        bbox: bbox.clone(),
        status,
        label: String::new(),
        person_id: None,
        similarity: None,
        confidence_pct: None,
        track_id: None,
        track_state: None,
    }
}

/// Owner-side handle to a running pipeline worker.
///
/// Dropping the handle stops the worker and waits for it.
pub struct PipelineHandle {
    stop: Arc<AtomicBool>,
    snapshots: watch::Receiver<Arc<FrameSnapshot>>,
    thread: Option<JoinHandle<Result<PipelineStats, PipelineError>>>,
}

impl PipelineHandle {
    pub fn subscribe(&self) -> watch::Receiver<Arc<FrameSnapshot>> {
        self.snapshots.clone()
    }

    /// Most recently published snapshot.
    pub fn latest(&self) -> Arc<FrameSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Signal the worker, wait for the in-flight cycle and return final stats.
    pub fn stop(mut self) -> Result<PipelineStats, PipelineError> {
        self.stop.store(true, Ordering::Relaxed);
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| PipelineError::Worker("pipeline thread panicked".into()))?,
            None => Ok(PipelineStats::default()),
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{LogDeliveryError, MemoryLogger};
    use crate::detector::DetectorError;
    use crate::frame::FaceCrop;
    use crate::gallery::EphemeralStore;
    use crate::types::{Detection, Embedding, Person};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves queued frames, then either times out forever or reports closed.
    struct ScriptedSource {
        frames: VecDeque<Frame>,
        close_when_empty: bool,
    }

    impl ScriptedSource {
        fn frames(n: u64) -> Self {
            Self {
                frames: (0..n)
                    .map(|i| Frame::new(vec![128; 200 * 200], 200, 200, i))
                    .collect(),
                close_when_empty: true,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self, timeout: Duration) -> Result<Frame, SourceError> {
            match self.frames.pop_front() {
                Some(frame) => Ok(frame),
                None if self.close_when_empty => Err(SourceError::Closed("end of script".into())),
                None => {
                    std::thread::sleep(Duration::from_millis(1));
                    Err(SourceError::Timeout(timeout))
                }
            }
        }
    }

    /// Same boxes on every frame; fails when `fail_on` matches the sequence.
    struct ScriptedDetector {
        confidences: Vec<f32>,
        fail_on: Option<u64>,
    }

    impl Detector for ScriptedDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
            if self.fail_on == Some(frame.sequence) {
                return Err(DetectorError::InferenceFailed("scripted".into()));
            }
            Ok(self
                .confidences
                .iter()
                .enumerate()
                .map(|(i, &confidence)| Detection {
                    bbox: BoundingBox {
                        x: 10.0 + 100.0 * i as f32,
                        y: 10.0,
                        width: 60.0,
                        height: 60.0,
                        confidence,
                        landmarks: None,
                    },
                    frame_sequence: frame.sequence,
                    captured_at: frame.timestamp,
                })
                .collect())
        }
    }

    struct FixedEmbedder {
        values: Vec<f32>,
        calls: Arc<AtomicUsize>,
    }

    impl Embedder for FixedEmbedder {
        fn embed(&mut self, _crop: &FaceCrop) -> Result<Embedding, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Embedding::new(self.values.clone()))
        }

        fn dimension(&self) -> usize {
            self.values.len()
        }
    }

    /// Rejects every write.
    struct DownLogger {
        calls: Mutex<u32>,
    }

    impl AccessLogger for DownLogger {
        fn record(&self, _event: &AccessEvent) -> Result<(), LogDeliveryError> {
            *self.calls.lock().unwrap() += 1;
            Err(LogDeliveryError::Unavailable("database locked".into()))
        }
    }

    /// Probe with cosine 0.95 against the single enrolled [1, 0].
    fn probe() -> Vec<f32> {
        vec![0.95, (1.0f32 - 0.95 * 0.95).sqrt()]
    }

    fn gallery_with_a() -> Arc<IdentityGallery> {
        let g = IdentityGallery::new(2, Arc::new(EphemeralStore));
        g.enroll(
            Person::new(PersonId(1), "A"),
            vec![Embedding::new(vec![1.0, 0.0])],
        )
        .unwrap();
        Arc::new(g)
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            acceptance_threshold: 0.8,
            confirm_frames: 2,
            log_retry_backoff_ms: 0,
            ..Default::default()
        }
    }

    struct Rig {
        pipeline: Pipeline,
        logger: Arc<MemoryLogger>,
        embeds: Arc<AtomicUsize>,
        config: ConfigHandle,
    }

    fn rig(source: ScriptedSource, detector: ScriptedDetector, cfg: PipelineConfig) -> Rig {
        let logger = Arc::new(MemoryLogger::new());
        let embeds = Arc::new(AtomicUsize::new(0));
        let config = ConfigHandle::new(cfg).unwrap();
        let pipeline = Pipeline::new(
            Box::new(source),
            Box::new(detector),
            Box::new(FixedEmbedder {
                values: probe(),
                calls: Arc::clone(&embeds),
            }),
            gallery_with_a(),
            logger.clone(),
            config.clone(),
        )
        .unwrap();
        Rig {
            pipeline,
            logger,
            embeds,
            config,
        }
    }

    fn one_face() -> ScriptedDetector {
        ScriptedDetector {
            confidences: vec![0.9],
            fail_on: None,
        }
    }

    #[test]
    fn test_five_frames_one_event_at_second() {
        let mut r = rig(ScriptedSource::frames(5), one_face(), config());

        let mut per_frame = Vec::new();
        for _ in 0..5 {
            match r.pipeline.run_cycle().unwrap() {
                CycleOutcome::Processed { events, .. } => per_frame.push(events),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(per_frame, vec![0, 1, 0, 0, 0]);

        let events = r.logger.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].person_id, Some(PersonId(1)));
        assert!((events[0].similarity - 0.95).abs() < 1e-4);
        assert!((events[0].confidence_pct - 95.0).abs() < 1e-2);
        assert_eq!(events[0].site, "main");
    }

    #[test]
    fn test_low_confidence_never_reaches_matcher() {
        let detector = ScriptedDetector {
            confidences: vec![0.4],
            fail_on: None,
        };
        let mut r = rig(ScriptedSource::frames(3), detector, config());
        for _ in 0..3 {
            assert_eq!(
                r.pipeline.run_cycle().unwrap(),
                CycleOutcome::Processed {
                    regions: 0,
                    events: 0
                }
            );
        }
        assert_eq!(r.embeds.load(Ordering::SeqCst), 0);
        assert!(r.pipeline.tracks().is_empty());
    }

    #[test]
    fn test_detector_failure_skips_frame_only() {
        let detector = ScriptedDetector {
            confidences: vec![0.9],
            fail_on: Some(1),
        };
        let mut r = rig(ScriptedSource::frames(4), detector, config());
        let outcomes: Vec<_> = (0..4).map(|_| r.pipeline.run_cycle().unwrap()).collect();
        assert_eq!(outcomes[1], CycleOutcome::Skipped);
        assert_eq!(r.pipeline.stats().detection_failures, 1);
        // a skipped frame carries no observations, so frame 2 still confirms
        assert_eq!(r.logger.events().len(), 1);
        assert_eq!(r.logger.events()[0].track_id, 1);
    }

    #[test]
    fn test_small_face_is_not_tracked() {
        let mut r = rig(
            ScriptedSource::frames(3),
            one_face(),
            PipelineConfig {
                min_face_size: 80,
                ..config()
            },
        );
        for _ in 0..3 {
            r.pipeline.run_cycle().unwrap();
        }
        assert!(r.logger.events().is_empty());
        assert_eq!(r.embeds.load(Ordering::SeqCst), 0);
        let latest = r.pipeline.subscribe().borrow().clone();
        assert_eq!(latest.regions[0].status, RegionStatus::TooSmall);
    }

    #[test]
    fn test_unknown_logged_only_when_enabled() {
        let cfg = PipelineConfig {
            acceptance_threshold: 0.99,
            ..config()
        };
        let mut r = rig(ScriptedSource::frames(3), one_face(), cfg.clone());
        for _ in 0..3 {
            r.pipeline.run_cycle().unwrap();
        }
        assert!(r.logger.events().is_empty());

        let mut r = rig(
            ScriptedSource::frames(3),
            one_face(),
            PipelineConfig {
                log_unknown: true,
                ..cfg
            },
        );
        for _ in 0..3 {
            r.pipeline.run_cycle().unwrap();
        }
        let events = r.logger.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].person_id, None);
    }

    #[test]
    fn test_failed_delivery_is_counted_and_not_retried_forever() {
        let logger = Arc::new(DownLogger {
            calls: Mutex::new(0),
        });
        let mut pipeline = Pipeline::new(
            Box::new(ScriptedSource::frames(5)),
            Box::new(one_face()),
            Box::new(FixedEmbedder {
                values: probe(),
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            gallery_with_a(),
            logger.clone(),
            ConfigHandle::new(config()).unwrap(),
        )
        .unwrap();
        for _ in 0..5 {
            pipeline.run_cycle().unwrap();
        }
        assert_eq!(pipeline.stats().events_dropped, 1);
        assert_eq!(pipeline.stats().events_emitted, 0);
        assert_eq!(*logger.calls.lock().unwrap(), 3);
    }

    #[test]
    fn test_run_ends_on_closed_source() {
        let mut r = rig(ScriptedSource::frames(2), one_face(), config());
        let stop = AtomicBool::new(false);
        let err = r.pipeline.run(&stop).unwrap_err();
        assert!(matches!(err, PipelineError::Source(SourceError::Closed(_))));
        assert_eq!(r.pipeline.stats().frames_processed, 2);
    }

    #[test]
    fn test_dark_frames_skip_detection() {
        let mut source = ScriptedSource::frames(0);
        source.frames.push_back(Frame::new(vec![0; 100 * 100], 100, 100, 0));
        let mut r = rig(source, one_face(), config());
        assert_eq!(r.pipeline.run_cycle().unwrap(), CycleOutcome::Dark);
        assert_eq!(r.pipeline.stats().frames_dark, 1);
        assert_eq!(r.embeds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_config_swap_applies_next_cycle() {
        let mut r = rig(ScriptedSource::frames(3), one_face(), config());
        r.config
            .replace(PipelineConfig {
                min_detection_confidence: 0.95,
                ..config()
            })
            .unwrap();
        for _ in 0..3 {
            r.pipeline.run_cycle().unwrap();
        }
        assert_eq!(r.embeds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_spawned_worker_publishes_and_stops() {
        let source = ScriptedSource {
            frames: (0..5)
                .map(|i| Frame::new(vec![128; 200 * 200], 200, 200, i))
                .collect(),
            close_when_empty: false,
        };
        let r = rig(source, one_face(), config());
        let logger = r.logger.clone();
        let handle = r.pipeline.spawn().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.latest().sequence < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.latest().sequence, 4);

        let stats = handle.stop().unwrap();
        assert_eq!(stats.frames_processed, 5);
        assert_eq!(stats.events_emitted, 1);
        assert_eq!(logger.events().len(), 1);
    }

    #[test]
    fn test_rejects_dimension_mismatch() {
        let result = Pipeline::new(
            Box::new(ScriptedSource::frames(0)),
            Box::new(one_face()),
            Box::new(FixedEmbedder {
                values: vec![1.0, 0.0, 0.0],
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            gallery_with_a(),
            Arc::new(MemoryLogger::new()),
            ConfigHandle::new(config()).unwrap(),
        );
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_backlog_reports_are_rate_limited() {
        let mut monitor = BacklogMonitor::default();
        let t0 = Instant::now();
        let every = Duration::from_secs(5);
        assert_eq!(monitor.observe(true, 0, t0, every), Some((1, 0)));
        assert_eq!(monitor.observe(true, 3, t0 + Duration::from_secs(1), every), None);
        assert_eq!(monitor.observe(false, 4, t0 + Duration::from_secs(2), every), None);
        assert_eq!(
            monitor.observe(false, 4, t0 + Duration::from_secs(5), every),
            Some((1, 4))
        );
        assert_eq!(monitor.observe(false, 4, t0 + Duration::from_secs(20), every), None);
    }
}
