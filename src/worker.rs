//! Detection worker.
//!
//! Consumes frames from the capture loop over a channel, keeps the
//! evidence buffer, runs inference and drives the episode lifecycle.
//!
//! Load shedding: each cycle drains *every* queued frame into the
//! buffer in arrival order but infers only the newest one. Inference
//! cost is bounded to one frame per cycle regardless of backlog while
//! every frame that arrived stays available for the evidence clip. The
//! offline [`re_detect`] path has no real-time constraint and infers
//! every frame.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use opencv::core::{Mat, Size};
use opencv::prelude::*;
use opencv::videoio::VideoWriter;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::buffer::EvidenceBuffer;
use crate::capture::FrameSource;
use crate::episode::{EpisodeAction, EpisodeTracker};
use crate::types::{AlertCode, AlertEvent, AlertKind, DetectMode, Frame, Sensitivity};

// ─── Seams ───────────────────────────────────────────────────────────────────

/// One raw model hit on a frame.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub kind: AlertKind,
    pub confidence: f32,
    /// Pixel box in frame coordinates (x1, y1, x2, y2).
    pub bbox: (i32, i32, i32, i32),
}

/// The opaque inference function. Implemented by the ONNX model set and
/// by stubs in tests.
pub trait InferBackend: Send {
    fn infer(
        &self,
        mat: &Mat,
        mode: DetectMode,
        confidence: f32,
    ) -> anyhow::Result<Vec<RawDetection>>;

    /// Draw detection boxes onto a copy of the frame.
    fn annotate(&self, mat: &Mat, _detections: &[RawDetection]) -> anyhow::Result<Mat> {
        Ok(mat.clone())
    }
}

/// One open evidence clip.
pub trait EvidenceClip: Send {
    fn write(&mut self, mat: &Mat) -> anyhow::Result<()>;
    fn close(&mut self) -> anyhow::Result<()>;
}

/// Where episode evidence (clips + annotated stills) lands.
pub trait EvidenceSink: Send {
    type Clip: EvidenceClip;
    fn open_clip(&mut self, name: &str, width: i32, height: i32, fps: f64)
        -> anyhow::Result<Self::Clip>;
    fn save_still(&mut self, name: &str, mat: &Mat) -> anyhow::Result<()>;
}

/// Reduce raw detections into the frame's alert code and per-kind max
/// confidence vector.
pub fn reduce(detections: &[RawDetection]) -> (AlertCode, [f32; 4]) {
    let mut code = AlertCode::NONE;
    let mut confs = [0.0f32; 4];
    for det in detections {
        code.set(det.kind);
        let i = det.kind.index();
        confs[i] = confs[i].max(det.confidence);
    }
    (code, confs)
}

// ─── Worker ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub mode: DetectMode,
    pub sensitivity: Sensitivity,
    pub buffer_capacity: usize,
    pub idle_timeout: Duration,
    /// Frame rate written into evidence clips.
    pub clip_fps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Sentinel received or channel closed; clean drain.
    Finished,
    /// No frame arrived within the idle timeout — upstream presumed dead.
    TimedOut,
    /// Inference or evidence writing failed fatally.
    Failed,
}

/// Per-cycle detection state, split from the channel loop so the episode
/// flow is drivable deterministically in tests.
pub struct DetectionEngine<B: InferBackend, S: EvidenceSink> {
    backend: B,
    sink: S,
    cfg: WorkerConfig,
    buffer: EvidenceBuffer,
    tracker: EpisodeTracker,
    clip: Option<S::Clip>,
    alert_tx: flume::Sender<AlertEvent>,
}

impl<B: InferBackend, S: EvidenceSink> DetectionEngine<B, S> {
    pub fn new(backend: B, sink: S, cfg: WorkerConfig, alert_tx: flume::Sender<AlertEvent>) -> Self {
        let buffer = EvidenceBuffer::new(cfg.buffer_capacity);
        let tracker = EpisodeTracker::new(cfg.buffer_capacity, cfg.sensitivity);
        Self {
            backend,
            sink,
            cfg,
            buffer,
            tracker,
            clip: None,
            alert_tx,
        }
    }

    /// Run one cycle over a batch of newly arrived frames: buffer them
    /// all, infer the newest, advance the episode.
    pub fn ingest(&mut self, frames: Vec<Frame>) -> anyhow::Result<()> {
        for frame in frames {
            self.buffer.push(frame);
        }
        let Some(frame) = self.buffer.pop_newest() else {
            return Ok(());
        };

        let detections = self
            .backend
            .infer(&frame.mat, self.cfg.mode, self.cfg.sensitivity.model_confidence())
            .context("inference failed")?;
        let (code, confs) = reduce(&detections);

        let timestamp = frame.timestamp();
        let (width, height) = (frame.mat.cols(), frame.mat.rows());

        // The frame goes back into the buffer — annotated when anything
        // fired — so the clip keeps every frame in arrival order.
        let annotated = if code.is_empty() {
            None
        } else {
            Some(self.backend.annotate(&frame.mat, &detections)?)
        };
        let still = annotated.clone();
        self.buffer.push(Frame {
            mat: annotated.unwrap_or(frame.mat),
            captured_at: frame.captured_at,
        });

        match self.tracker.observe(code, confs, timestamp.clone()) {
            EpisodeAction::Idle => {}
            EpisodeAction::Opened(event) => {
                warn!(
                    target: "detect",
                    "episode opened: {} (confidences {:?})",
                    event.code, event.confidences
                );
                let _ = self.alert_tx.send(event);
                let mut clip = self
                    .sink
                    .open_clip(&timestamp, width, height, self.cfg.clip_fps)
                    .context("evidence clip open failed")?;
                if let Some(mat) = &still {
                    if let Err(err) = self.sink.save_still(&timestamp, mat) {
                        warn!(target: "detect", "still save failed: {}", err);
                    }
                }
                flush_into(&mut self.buffer, &mut clip);
                self.clip = Some(clip);
            }
            EpisodeAction::Escalated(event) => {
                warn!(
                    target: "detect",
                    "episode escalated: {} (confidences {:?})",
                    event.code, event.confidences
                );
                let _ = self.alert_tx.send(event);
                if let Some(mat) = &still {
                    if let Err(err) = self.sink.save_still(&timestamp, mat) {
                        warn!(target: "detect", "still save failed: {}", err);
                    }
                }
                if let Some(clip) = self.clip.as_mut() {
                    flush_into(&mut self.buffer, clip);
                }
            }
            EpisodeAction::Sustained => {
                if let Some(clip) = self.clip.as_mut() {
                    flush_into(&mut self.buffer, clip);
                }
            }
            EpisodeAction::Closed => {
                if let Some(mut clip) = self.clip.take() {
                    flush_into(&mut self.buffer, &mut clip);
                    if let Err(err) = clip.close() {
                        warn!(target: "detect", "clip close failed: {}", err);
                    }
                }
                info!(target: "detect", "episode closed after cool-down");
            }
        }
        Ok(())
    }

    /// Close any open clip; called on shutdown.
    pub fn finish(&mut self) {
        if let Some(mut clip) = self.clip.take() {
            if let Err(err) = clip.close() {
                warn!(target: "detect", "clip close failed on shutdown: {}", err);
            }
        }
    }
}

fn flush_into<C: EvidenceClip>(buffer: &mut EvidenceBuffer, clip: &mut C) {
    for frame in buffer.drain_oldest() {
        if let Err(err) = clip.write(&frame.mat) {
            warn!(target: "detect", "evidence write failed: {}", err);
            break;
        }
    }
}

/// Channel loop around [`DetectionEngine`]. Runs until the sentinel
/// arrives or the channel stays empty past the idle timeout (a crashed
/// upstream is otherwise indistinguishable from a momentarily idle one).
pub fn run_detection<B: InferBackend, S: EvidenceSink>(
    backend: B,
    sink: S,
    cfg: WorkerConfig,
    frame_rx: flume::Receiver<Option<Frame>>,
    alert_tx: flume::Sender<AlertEvent>,
) -> WorkerExit {
    let idle_timeout = cfg.idle_timeout;
    let mut engine = DetectionEngine::new(backend, sink, cfg, alert_tx);
    info!(target: "detect", "detection worker started");

    loop {
        let first = match frame_rx.recv_timeout(idle_timeout) {
            Ok(msg) => msg,
            Err(flume::RecvTimeoutError::Timeout) => {
                error!(
                    target: "detect",
                    "no frame within {:?} — upstream presumed dead, exiting", idle_timeout
                );
                engine.finish();
                return WorkerExit::TimedOut;
            }
            Err(flume::RecvTimeoutError::Disconnected) => {
                engine.finish();
                return WorkerExit::Finished;
            }
        };

        let mut batch = Vec::new();
        let mut shutdown = false;
        match first {
            Some(frame) => batch.push(frame),
            None => shutdown = true,
        }
        if !shutdown {
            for msg in frame_rx.try_iter() {
                match msg {
                    Some(frame) => batch.push(frame),
                    None => {
                        shutdown = true;
                        break;
                    }
                }
            }
        }

        if !batch.is_empty() {
            if let Err(err) = engine.ingest(batch) {
                error!(target: "detect", "detection cycle failed: {:#}", err);
                engine.finish();
                return WorkerExit::Failed;
            }
        }
        if shutdown {
            engine.finish();
            info!(target: "detect", "sentinel received, detection worker exiting");
            return WorkerExit::Finished;
        }
    }
}

// ─── Offline re-detection ────────────────────────────────────────────────────

/// Re-run detection over a stored clip. Every frame is inferred (no
/// real-time constraint), every anomalous frame is saved as an annotated
/// still, and the anomalous run is written to one contiguous clip. The
/// cancellation signal is polled between frames.
pub fn re_detect<B: InferBackend, S: EvidenceSink>(
    backend: &B,
    sink: &mut S,
    cfg: &WorkerConfig,
    video_file: &Path,
    ceiling: (i32, i32),
    cancel: &watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut source = FrameSource::open_file(video_file, ceiling)?;
    let mut buffer = EvidenceBuffer::new(cfg.buffer_capacity);
    let mut clip: Option<S::Clip> = None;
    let mut frame_index = 0u64;
    let mut anomalous = 0u64;
    info!(target: "detect", "re-detect started on {}", video_file.display());

    loop {
        if *cancel.borrow() {
            info!(target: "detect", "re-detect cancelled at frame {}", frame_index);
            break;
        }
        let Some(frame) = source.read_frame()? else {
            break;
        };

        let detections =
            backend.infer(&frame.mat, cfg.mode, cfg.sensitivity.model_confidence())?;
        if detections.is_empty() {
            buffer.push(frame);
        } else {
            anomalous += 1;
            let annotated = backend.annotate(&frame.mat, &detections)?;
            sink.save_still(&format!("frame_{}", frame_index), &annotated)?;
            let (width, height) = (annotated.cols(), annotated.rows());
            buffer.push(Frame {
                mat: annotated,
                captured_at: frame.captured_at,
            });
            if clip.is_none() {
                clip = Some(sink.open_clip("re-detect", width, height, cfg.clip_fps)?);
            }
            if let Some(clip) = clip.as_mut() {
                flush_into(&mut buffer, clip);
            }
        }
        frame_index += 1;
    }

    if let Some(mut clip) = clip.take() {
        clip.close()?;
    }
    info!(
        target: "detect",
        "re-detect finished: {} frames scanned, {} anomalous", frame_index, anomalous
    );
    Ok(())
}

// ─── Disk evidence sink ──────────────────────────────────────────────────────

/// Evidence sink writing clips and stills under one per-session
/// directory (`<evidence_root>/<session>/`, clips in `video/`).
pub struct DiskEvidence {
    session_dir: PathBuf,
}

impl DiskEvidence {
    pub fn create(evidence_root: &Path, session: &str) -> anyhow::Result<Self> {
        let session_dir = evidence_root.join(session);
        std::fs::create_dir_all(session_dir.join("video"))?;
        Ok(Self { session_dir })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }
}

pub struct DiskClip {
    writer: VideoWriter,
    path: PathBuf,
}

impl EvidenceClip for DiskClip {
    fn write(&mut self, mat: &Mat) -> anyhow::Result<()> {
        self.writer.write(mat)?;
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.writer.release()?;
        info!(target: "detect", "evidence clip closed: {}", self.path.display());
        Ok(())
    }
}

impl EvidenceSink for DiskEvidence {
    type Clip = DiskClip;

    fn open_clip(
        &mut self,
        name: &str,
        width: i32,
        height: i32,
        fps: f64,
    ) -> anyhow::Result<DiskClip> {
        let path = self.session_dir.join("video").join(format!("{}.avi", name));
        let fourcc = VideoWriter::fourcc('D', 'I', 'V', 'X')?;
        let writer = VideoWriter::new(
            &path.to_string_lossy(),
            fourcc,
            fps,
            Size::new(width, height),
            true,
        )?;
        if !writer.is_opened()? {
            return Err(anyhow!("could not open evidence writer at {}", path.display()));
        }
        info!(target: "detect", "evidence clip opened: {}", path.display());
        Ok(DiskClip { writer, path })
    }

    fn save_still(&mut self, name: &str, mat: &Mat) -> anyhow::Result<()> {
        let path = self.session_dir.join(format!("{}.jpg", name));
        let ok = opencv::imgcodecs::imwrite(
            &path.to_string_lossy(),
            mat,
            &opencv::core::Vector::new(),
        )?;
        if !ok {
            return Err(anyhow!("could not write still {}", path.display()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::severity_level;
    use chrono::{Duration as ChronoDuration, Local, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    // Backend that fires `kind` at the given confidence on chosen cycles.
    struct ScriptedBackend {
        fire_on: Vec<usize>,
        confidence: f32,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(fire_on: Vec<usize>, confidence: f32) -> Self {
            Self {
                fire_on,
                confidence,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl InferBackend for ScriptedBackend {
        fn infer(
            &self,
            _mat: &Mat,
            _mode: DetectMode,
            _confidence: f32,
        ) -> anyhow::Result<Vec<RawDetection>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fire_on.contains(&call) {
                Ok(vec![RawDetection {
                    kind: AlertKind::Fire,
                    confidence: self.confidence,
                    bbox: (10, 10, 50, 50),
                }])
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[derive(Default)]
    struct SinkStats {
        opened: usize,
        closed: usize,
        written: usize,
        stills: usize,
    }

    #[derive(Clone)]
    struct RecordingSink {
        stats: Arc<std::sync::Mutex<SinkStats>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                stats: Arc::new(std::sync::Mutex::new(SinkStats::default())),
            }
        }
    }

    struct RecordingClip {
        stats: Arc<std::sync::Mutex<SinkStats>>,
    }

    impl EvidenceClip for RecordingClip {
        fn write(&mut self, _mat: &Mat) -> anyhow::Result<()> {
            self.stats.lock().unwrap().written += 1;
            Ok(())
        }
        fn close(&mut self) -> anyhow::Result<()> {
            self.stats.lock().unwrap().closed += 1;
            Ok(())
        }
    }

    impl EvidenceSink for RecordingSink {
        type Clip = RecordingClip;
        fn open_clip(
            &mut self,
            _name: &str,
            _width: i32,
            _height: i32,
            _fps: f64,
        ) -> anyhow::Result<RecordingClip> {
            self.stats.lock().unwrap().opened += 1;
            Ok(RecordingClip {
                stats: Arc::clone(&self.stats),
            })
        }
        fn save_still(&mut self, _name: &str, _mat: &Mat) -> anyhow::Result<()> {
            self.stats.lock().unwrap().stills += 1;
            Ok(())
        }
    }

    fn worker_cfg(capacity: usize) -> WorkerConfig {
        WorkerConfig {
            mode: DetectMode::All,
            sensitivity: Sensitivity::Low,
            buffer_capacity: capacity,
            idle_timeout: Duration::from_millis(200),
            clip_fps: 30.0,
        }
    }

    fn synthetic_frame(seq: i64) -> Frame {
        Frame {
            mat: Mat::default(),
            captured_at: Local.with_ymd_and_hms(2024, 6, 11, 12, 0, 0).unwrap()
                + ChronoDuration::seconds(seq),
        }
    }

    #[test]
    fn fifty_frame_run_with_one_fire_detection() {
        // Source = synthetic stream, fire fires at frame 20 @0.92.
        let backend = ScriptedBackend::new(vec![20], 0.92);
        let sink = RecordingSink::new();
        let stats = Arc::clone(&sink.stats);
        let (alert_tx, alert_rx) = flume::unbounded();
        let mut engine = DetectionEngine::new(backend, sink, worker_cfg(30), alert_tx);

        for i in 0..50 {
            engine.ingest(vec![synthetic_frame(i)]).unwrap();
        }
        engine.finish();

        let events: Vec<AlertEvent> = alert_rx.drain().collect();
        assert_eq!(events.len(), 1, "exactly one alert event");
        assert_eq!(events[0].code.bits(), 2, "fire bit");
        let level = severity_level(
            events[0].confidences[AlertKind::Fire.index()],
            events[0].sensitivity,
        );
        assert_eq!(level, 3);

        let stats = stats.lock().unwrap();
        assert_eq!(stats.opened, 1, "one evidence clip opened");
        assert_eq!(stats.closed, 1, "clip closed exactly once (at shutdown)");
        // Pre-roll (frames 0..=20) plus every later frame of the
        // still-open episode: the whole stream ends up in the clip.
        assert_eq!(stats.written, 50);
        assert_eq!(stats.stills, 1);
    }

    #[test]
    fn episode_closes_after_cooldown_and_reopens_on_new_anomaly() {
        let capacity = 5;
        let backend = ScriptedBackend::new(vec![3, 20], 0.85);
        let sink = RecordingSink::new();
        let stats = Arc::clone(&sink.stats);
        let (alert_tx, alert_rx) = flume::unbounded();
        let mut engine = DetectionEngine::new(backend, sink, worker_cfg(capacity), alert_tx);

        for i in 0..30 {
            engine.ingest(vec![synthetic_frame(i)]).unwrap();
        }
        engine.finish();

        let events: Vec<AlertEvent> = alert_rx.drain().collect();
        assert_eq!(events.len(), 2, "one event per episode");

        let stats = stats.lock().unwrap();
        assert_eq!(stats.opened, 2);
        assert_eq!(stats.closed, 2);
    }

    #[test]
    fn backlog_is_buffered_but_only_newest_is_inferred() {
        let backend = ScriptedBackend::new(vec![], 0.0);
        let sink = RecordingSink::new();
        let (alert_tx, _alert_rx) = flume::unbounded();
        let mut engine = DetectionEngine::new(backend, sink, worker_cfg(100), alert_tx);

        // Ten frames arrive in one cycle: one inference, ten buffered.
        engine
            .ingest((0..10).map(synthetic_frame).collect())
            .unwrap();
        assert_eq!(engine.backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.buffer.len(), 10);
    }

    #[test]
    fn sentinel_stops_the_channel_loop() {
        let backend = ScriptedBackend::new(vec![], 0.0);
        let sink = RecordingSink::new();
        let (frame_tx, frame_rx) = flume::unbounded();
        let (alert_tx, _alert_rx) = flume::unbounded();

        frame_tx.send(Some(synthetic_frame(0))).unwrap();
        frame_tx.send(None).unwrap();
        let exit = run_detection(backend, sink, worker_cfg(10), frame_rx, alert_tx);
        assert_eq!(exit, WorkerExit::Finished);
    }

    #[test]
    fn idle_channel_times_out() {
        let backend = ScriptedBackend::new(vec![], 0.0);
        let sink = RecordingSink::new();
        let (_frame_tx, frame_rx) = flume::unbounded::<Option<Frame>>();
        let (alert_tx, _alert_rx) = flume::unbounded();

        let exit = run_detection(backend, sink, worker_cfg(10), frame_rx, alert_tx);
        assert_eq!(exit, WorkerExit::TimedOut);
    }
}
