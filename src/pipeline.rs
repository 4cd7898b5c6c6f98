//! Pipeline controller.
//!
//! Owns the capture loop, spawns and tears down the detection and
//! visualization workers, drains alert events into the dispatcher, and
//! reports one outcome code per run through the shared status cell.
//!
//! Worker teardown is always orderly: a `None` sentinel goes down each
//! frame channel so workers drain what they already received before
//! exiting, whether the run ends by request, by source error or by end
//! of stream.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use opencv::core::{Mat, Size};
use opencv::prelude::*;
use opencv::videoio::VideoWriter;
use opencv::{highgui, imgproc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::alerts::{AlertDispatcher, SystemOutput};
use crate::capture::{FrameSource, SourceKind};
use crate::config::AppConfig;
use crate::detector::ModelSet;
use crate::display::{self, run_viewer, ViewerExit};
use crate::history::{parse_user_date, Lookup, RecordingIndex};
use crate::probe::{probe_url, ProbeOutcome};
use crate::sources::{DeviceRegistry, NetworkSource, UrlStore};
use crate::types::{
    format_timestamp, AlertEvent, DetectMode, Frame, Outcome, Sensitivity, StatusCell,
};
use crate::worker::{re_detect, run_detection, DiskEvidence, WorkerConfig};

const DISMISS_KEYS: [i32; 2] = ['q' as i32, 27];

// ─── Requests ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RunFlags {
    pub visibility: bool,
    pub record: bool,
    pub detect: bool,
}

#[derive(Debug, Clone)]
pub enum SourceSelect {
    /// nth locally scanned device.
    Local { index: usize },
    /// Network device by stored index, bare IP or URL.
    Network { source: NetworkSource, protocol: String },
    /// Stored recording by start date and per-day index.
    History { date: String, index: u32 },
}

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub source: SourceSelect,
    pub flags: RunFlags,
    pub mode: DetectMode,
    pub sensitivity: Sensitivity,
}

// ─── Handle ──────────────────────────────────────────────────────────────────

/// A started pipeline run. `stop()` requests cooperative cancellation;
/// the status cell is readable at any time; `join` resolves to the
/// final outcome code.
pub struct PipelineHandle {
    stop_tx: watch::Sender<bool>,
    pub status: Arc<StatusCell>,
    pub join: tokio::task::JoinHandle<i32>,
}

impl PipelineHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

// ─── Controller ──────────────────────────────────────────────────────────────

pub struct Pipeline {
    cfg: Arc<AppConfig>,
    devices: DeviceRegistry,
    urls: UrlStore,
    recordings: RecordingIndex,
    dispatcher: Arc<AlertDispatcher<SystemOutput>>,
}

impl Pipeline {
    pub fn new(cfg: AppConfig) -> anyhow::Result<Self> {
        let devices = DeviceRegistry::scan(cfg.capture.device_scan_limit);
        if devices.is_empty() {
            warn!(target: "pipeline", "no local video devices found");
        }
        let urls = UrlStore::load(&cfg.storage.url_store)?;
        if urls.is_empty() {
            warn!(target: "pipeline", "network device store is empty");
        }
        let recordings = RecordingIndex::open(&cfg.storage.recording_dir)?;
        let dispatcher = Arc::new(AlertDispatcher::new(
            SystemOutput::new(&cfg.alerts),
            cfg.alerts.recipients.clone(),
            Duration::from_secs(cfg.alerts.cooldown_secs),
        ));
        Ok(Self {
            cfg: Arc::new(cfg),
            devices,
            urls,
            recordings,
            dispatcher,
        })
    }

    /// Construct with pre-built registries (tests, embedders).
    pub fn with_stores(
        cfg: AppConfig,
        devices: DeviceRegistry,
        urls: UrlStore,
        recordings: RecordingIndex,
    ) -> Self {
        let dispatcher = Arc::new(AlertDispatcher::new(
            SystemOutput::new(&cfg.alerts),
            cfg.alerts.recipients.clone(),
            Duration::from_secs(cfg.alerts.cooldown_secs),
        ));
        Self {
            cfg: Arc::new(cfg),
            devices,
            urls,
            recordings,
            dispatcher,
        }
    }

    /// Start the run on a blocking task and return its handle.
    pub fn start(self, request: PipelineRequest) -> PipelineHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let status = Arc::new(StatusCell::new());
        let task_status = Arc::clone(&status);
        let join =
            tokio::task::spawn_blocking(move || self.run_blocking(request, stop_rx, &task_status));
        PipelineHandle {
            stop_tx,
            status,
            join,
        }
    }

    fn run_blocking(
        mut self,
        request: PipelineRequest,
        stop_rx: watch::Receiver<bool>,
        status: &StatusCell,
    ) -> i32 {
        let outcome = match request.source.clone() {
            SourceSelect::Local { index } => self.run_local(index, &request, &stop_rx, status),
            SourceSelect::Network { source, protocol } => {
                self.run_network(&source, &protocol, &request, &stop_rx, status)
            }
            SourceSelect::History { date, index } => {
                self.run_history(&date, index, &request, &stop_rx, status)
            }
        };
        status.post(outcome);
        info!(target: "pipeline", "run finished with outcome {}", outcome.code());
        outcome.code()
    }

    // ─── Local devices ───────────────────────────────────────────────────────

    fn run_local(
        &mut self,
        index: usize,
        request: &PipelineRequest,
        stop_rx: &watch::Receiver<bool>,
        status: &StatusCell,
    ) -> Outcome {
        if self.devices.is_empty() {
            error!(target: "pipeline", "cannot stream: no local video devices");
            return Outcome::Precondition(1);
        }
        let Some(device) = self.devices.device_at(index) else {
            error!(
                target: "pipeline",
                "device index {} out of range ({} device(s))", index, self.devices.len()
            );
            return Outcome::Precondition(2);
        };

        let kind = SourceKind::Device(device);
        let source = match FrameSource::open(&kind, self.ceiling()) {
            Ok(source) => source,
            Err(err) => {
                error!(target: "pipeline", "open failed: {}", err);
                return Outcome::OpenFailed;
            }
        };
        status.post(Outcome::Started);
        self.stream(source, request, stop_rx, /* viewer_in_process */ true)
    }

    // ─── Network devices ─────────────────────────────────────────────────────

    fn run_network(
        &mut self,
        net_source: &NetworkSource,
        protocol: &str,
        request: &PipelineRequest,
        stop_rx: &watch::Receiver<bool>,
        status: &StatusCell,
    ) -> Outcome {
        use crate::error::HomewatchError;

        let resolved = match self.urls.resolve(net_source, protocol) {
            Ok(resolved) => resolved,
            Err(HomewatchError::UnsupportedProtocol(p)) => {
                error!(target: "pipeline", "transport protocol {} is not supported", p);
                return Outcome::Precondition(2);
            }
            Err(err) => {
                error!(target: "pipeline", "cannot resolve network source: {}", err);
                return Outcome::Precondition(1);
            }
        };

        let deadline = Duration::from_secs(self.cfg.capture.url_timeout_secs);
        match probe_url(&resolved.url, deadline) {
            ProbeOutcome::Opened => {}
            ProbeOutcome::TimedOut => {
                error!(
                    target: "pipeline",
                    "connect to {} timed out after {:?}", resolved.url, deadline
                );
                return Outcome::Precondition(3);
            }
            ProbeOutcome::Failed => {
                error!(target: "pipeline", "no video stream at {}", resolved.url);
                return Outcome::OpenFailed;
            }
        }

        let kind = SourceKind::Url(resolved.url.clone());
        let source = match FrameSource::open(&kind, self.ceiling()) {
            Ok(source) => source,
            Err(err) => {
                error!(target: "pipeline", "open failed: {}", err);
                return Outcome::OpenFailed;
            }
        };
        status.post(Outcome::Started);

        // A previously unknown URL that opened is persisted for reuse.
        if !resolved.known {
            if let Err(err) = self.urls.append(&resolved.url) {
                warn!(target: "pipeline", "could not persist url: {}", err);
            }
        }

        self.stream(source, request, stop_rx, /* viewer_in_process */ false)
    }

    // ─── Streaming loop (local + network) ────────────────────────────────────

    fn stream(
        &mut self,
        mut source: FrameSource,
        request: &PipelineRequest,
        stop_rx: &watch::Receiver<bool>,
        viewer_in_process: bool,
    ) -> Outcome {
        let cfg = Arc::clone(&self.cfg);
        let flags = &request.flags;
        let idle_timeout = Duration::from_secs(cfg.capture.idle_timeout_secs);
        let title = source.label().to_string();

        // ── Detection worker ────────────────────────────────────────────
        let mut detect_tx: Option<flume::Sender<Option<Frame>>> = None;
        let mut alert_rx: Option<flume::Receiver<AlertEvent>> = None;
        let mut detect_handle = None;
        if flags.detect {
            let (tx, rx) = flume::unbounded::<Option<Frame>>();
            let (event_tx, event_rx) = flume::unbounded::<AlertEvent>();
            let worker_cfg = WorkerConfig {
                mode: request.mode,
                sensitivity: request.sensitivity,
                buffer_capacity: cfg.detector.buffer_frames,
                idle_timeout,
                clip_fps: source.fps,
            };
            let model_dir = PathBuf::from(&cfg.detector.model_dir);
            let evidence_root = PathBuf::from(&cfg.storage.evidence_dir);
            let session = format_timestamp(Local::now());
            let input_size = cfg.detector.input_size;
            let iou = cfg.detector.iou_threshold;
            let spawned = std::thread::Builder::new()
                .name("homewatch-detect".into())
                .spawn(move || {
                    let backend = match ModelSet::load(&model_dir, worker_cfg.mode, input_size, iou)
                    {
                        Ok(backend) => backend,
                        Err(err) => {
                            error!(target: "detect", "model load failed: {:#}", err);
                            return;
                        }
                    };
                    let sink = match DiskEvidence::create(&evidence_root, &session) {
                        Ok(sink) => sink,
                        Err(err) => {
                            error!(target: "detect", "evidence dir creation failed: {:#}", err);
                            return;
                        }
                    };
                    run_detection(backend, sink, worker_cfg, rx, event_tx);
                });
            match spawned {
                Ok(handle) => {
                    detect_tx = Some(tx);
                    alert_rx = Some(event_rx);
                    detect_handle = Some(handle);
                    info!(target: "pipeline", "detection worker spawned");
                }
                Err(err) => error!(target: "pipeline", "could not spawn detection worker: {}", err),
            }
        }

        // ── Visualization ───────────────────────────────────────────────
        let mut viewer_tx: Option<flume::Sender<Option<Frame>>> = None;
        let mut viewer_exit_rx: Option<flume::Receiver<ViewerExit>> = None;
        let mut viewer_handle = None;
        let mut window_open = false;
        if flags.visibility {
            if viewer_in_process {
                match display::open_window(&title, source.width, source.height) {
                    Ok(()) => window_open = true,
                    Err(err) => warn!(target: "pipeline", "window creation failed, running headless: {}", err),
                }
            } else {
                let (tx, rx) = flume::unbounded::<Option<Frame>>();
                let (exit_tx, exit_rx) = flume::bounded::<ViewerExit>(1);
                let viewer_title = title.clone();
                let (w, h) = (source.width, source.height);
                let spawned = std::thread::Builder::new()
                    .name("homewatch-viewer".into())
                    .spawn(move || run_viewer(rx, exit_tx, &viewer_title, w, h, idle_timeout));
                match spawned {
                    Ok(handle) => {
                        viewer_tx = Some(tx);
                        viewer_exit_rx = Some(exit_rx);
                        viewer_handle = Some(handle);
                        info!(target: "pipeline", "visualization worker spawned");
                    }
                    Err(err) => {
                        error!(target: "pipeline", "could not spawn visualization worker: {}", err)
                    }
                }
            }
        }

        // ── Recording writer ────────────────────────────────────────────
        // Resolution is locked to the normalized source size for the
        // whole session; every written frame is resized to match.
        let mut writer: Option<VideoWriter> = None;
        if flags.record {
            match self.open_recording_writer(&source) {
                Ok(w) => writer = Some(w),
                Err(outcome) => {
                    self.teardown(&detect_tx, &viewer_tx, detect_handle, viewer_handle);
                    if window_open {
                        let _ = highgui::destroy_window(&title);
                    }
                    return outcome;
                }
            }
        }

        info!(target: "pipeline", "streaming from {}", title);

        // ── Capture loop ────────────────────────────────────────────────
        let outcome = loop {
            if *stop_rx.borrow() {
                info!(target: "pipeline", "stop requested, shutting down");
                break Outcome::CleanStop;
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => continue, // thinned out
                Err(err) => {
                    error!(target: "pipeline", "frame fetch failed: {}", err);
                    break Outcome::ReadFailed;
                }
            };

            if let Some(tx) = &detect_tx {
                let _ = tx.send(Some(frame.clone()));
            }

            // Alert events are dispatched fire-and-forget so notification
            // latency never blocks the capture loop.
            if let Some(rx) = &alert_rx {
                for event in rx.try_iter() {
                    let dispatcher = Arc::clone(&self.dispatcher);
                    std::thread::spawn(move || dispatcher.dispatch(&event));
                }
            }

            if let Some(tx) = &viewer_tx {
                let _ = tx.send(Some(frame.clone()));
            }
            if let Some(rx) = &viewer_exit_rx {
                if let Ok(exit) = rx.try_recv() {
                    match exit {
                        ViewerExit::TimedOut => {
                            error!(target: "pipeline", "visualization worker timed out")
                        }
                        other => info!(target: "pipeline", "viewer reported {:?}", other),
                    }
                    break Outcome::CleanStop;
                }
            }
            if window_open {
                if self.poll_window(&title, &frame.mat) {
                    break Outcome::CleanStop;
                }
            }

            if let Some(writer) = writer.as_mut() {
                if let Err(err) = write_resized(writer, &frame.mat, source.width, source.height) {
                    warn!(target: "pipeline", "recording write failed: {}", err);
                }
            }
        };

        if let Some(mut w) = writer.take() {
            let _ = w.release();
        }
        if window_open {
            let _ = highgui::destroy_window(&title);
        }
        self.teardown(&detect_tx, &viewer_tx, detect_handle, viewer_handle);
        outcome
    }

    /// Allocate a recording path and open its writer, rolling the
    /// allocation back if the writer cannot be opened.
    fn open_recording_writer(&mut self, source: &FrameSource) -> Result<VideoWriter, Outcome> {
        let started = Local::now();
        let path = match self.recordings.allocate(started) {
            Ok(path) => path,
            Err(err) => {
                error!(target: "pipeline", "recording dir creation failed: {}", err);
                return Err(Outcome::RecordCreateFailed);
            }
        };
        let open = || -> crate::error::Result<VideoWriter> {
            let fourcc = VideoWriter::fourcc('D', 'I', 'V', 'X')?;
            Ok(VideoWriter::new(
                &path.to_string_lossy(),
                fourcc,
                source.fps,
                Size::new(source.width, source.height),
                true,
            )?)
        };
        match open() {
            Ok(writer) if writer.is_opened().unwrap_or(false) => {
                info!(target: "pipeline", "recording to {}", path.display());
                Ok(writer)
            }
            Ok(_) | Err(_) => {
                error!(target: "pipeline", "recording writer open failed: {}", path.display());
                self.recordings.rollback(&path);
                Err(Outcome::RecordCreateFailed)
            }
        }
    }

    /// In-process display for local/history sources. Returns true when
    /// the user dismissed the window.
    fn poll_window(&self, title: &str, mat: &Mat) -> bool {
        self.poll_window_paced(title, mat, 1)
    }

    fn poll_window_paced(&self, title: &str, mat: &Mat, delay_ms: i32) -> bool {
        if highgui::imshow(title, mat).is_err() {
            return true;
        }
        let key = highgui::wait_key(delay_ms.max(1)).unwrap_or(-1);
        if DISMISS_KEYS.contains(&(key & 0xff)) {
            return true;
        }
        highgui::get_window_property(title, highgui::WND_PROP_VISIBLE).unwrap_or(0.0) < 1.0
    }

    /// Orderly worker shutdown: sentinel down each channel, then join so
    /// evidence files are closed before the run reports.
    fn teardown(
        &self,
        detect_tx: &Option<flume::Sender<Option<Frame>>>,
        viewer_tx: &Option<flume::Sender<Option<Frame>>>,
        detect_handle: Option<std::thread::JoinHandle<()>>,
        viewer_handle: Option<std::thread::JoinHandle<()>>,
    ) {
        if let Some(tx) = detect_tx {
            let _ = tx.send(None);
        }
        if let Some(tx) = viewer_tx {
            let _ = tx.send(None);
        }
        if let Some(handle) = detect_handle {
            if handle.join().is_err() {
                error!(target: "pipeline", "detection worker panicked");
            }
        }
        if let Some(handle) = viewer_handle {
            if handle.join().is_err() {
                error!(target: "pipeline", "visualization worker panicked");
            }
        }
    }

    // ─── History playback ────────────────────────────────────────────────────

    fn run_history(
        &mut self,
        date: &str,
        index: u32,
        request: &PipelineRequest,
        stop_rx: &watch::Receiver<bool>,
        status: &StatusCell,
    ) -> Outcome {
        if self.recordings.is_empty() {
            error!(target: "pipeline", "no stored recordings");
            return Outcome::Precondition(1);
        }
        let Some(parsed) = parse_user_date(date) else {
            error!(target: "pipeline", "unparseable date {:?}", date);
            return Outcome::Precondition(2);
        };
        let (path, label) = match self.recordings.lookup(parsed, index) {
            Lookup::Found { path, label } => (path, label),
            Lookup::NoSuchDate => {
                error!(target: "pipeline", "no footage recorded on {}", parsed);
                return Outcome::Precondition(2);
            }
            Lookup::NoSuchIndex => {
                error!(target: "pipeline", "no recording {} on {}", index, parsed);
                return Outcome::Precondition(3);
            }
        };

        let mut source = match FrameSource::open_file(&path, self.ceiling()) {
            Ok(source) => source,
            Err(err) => {
                error!(target: "pipeline", "open failed: {}", err);
                return Outcome::OpenFailed;
            }
        };
        status.post(Outcome::Started);

        // Offline re-detection runs beside playback and honors the same
        // cancellation signal; playback waits for it on clean exit.
        let (redetect_cancel_tx, redetect_cancel_rx) = watch::channel(false);
        let mut redetect_handle = None;
        if request.flags.detect {
            let cfg = Arc::clone(&self.cfg);
            let worker_cfg = WorkerConfig {
                mode: request.mode,
                sensitivity: request.sensitivity,
                buffer_capacity: cfg.detector.buffer_frames,
                idle_timeout: Duration::from_secs(cfg.capture.idle_timeout_secs),
                clip_fps: source.fps,
            };
            let ceiling = self.ceiling();
            let video_file = path.clone();
            let spawned = std::thread::Builder::new()
                .name("homewatch-redetect".into())
                .spawn(move || {
                    let backend = match ModelSet::load(
                        &PathBuf::from(&cfg.detector.model_dir),
                        worker_cfg.mode,
                        cfg.detector.input_size,
                        cfg.detector.iou_threshold,
                    ) {
                        Ok(backend) => backend,
                        Err(err) => {
                            error!(target: "detect", "model load failed: {:#}", err);
                            return;
                        }
                    };
                    let session = format!("re-detect_{}", format_timestamp(Local::now()));
                    let mut sink = match DiskEvidence::create(
                        &PathBuf::from(&cfg.storage.evidence_dir),
                        &session,
                    ) {
                        Ok(sink) => sink,
                        Err(err) => {
                            error!(target: "detect", "evidence dir creation failed: {:#}", err);
                            return;
                        }
                    };
                    if let Err(err) = re_detect(
                        &backend,
                        &mut sink,
                        &worker_cfg,
                        &video_file,
                        ceiling,
                        &redetect_cancel_rx,
                    ) {
                        error!(target: "detect", "re-detect failed: {:#}", err);
                    }
                });
            match spawned {
                Ok(handle) => redetect_handle = Some(handle),
                Err(err) => error!(target: "pipeline", "could not spawn re-detect worker: {}", err),
            }
        }

        let mut window_open = false;
        if request.flags.visibility {
            match display::open_window(&label, source.width, source.height) {
                Ok(()) => window_open = true,
                Err(err) => warn!(target: "pipeline", "window creation failed: {}", err),
            }
        }

        // Pace display to roughly the original speed.
        let delay_ms = if source.fps > 0.0 {
            (500.0 / source.fps) as i32
        } else {
            1
        };
        let mut frames_read: i64 = 0;

        let outcome = loop {
            if *stop_rx.borrow() {
                info!(target: "pipeline", "stop requested during playback");
                break Outcome::CleanStop;
            }
            match source.read_frame() {
                Ok(Some(frame)) => {
                    frames_read += 1;
                    if window_open && self.poll_window_paced(&label, &frame.mat, delay_ms) {
                        info!(target: "pipeline", "playback dismissed");
                        break Outcome::CleanStop;
                    }
                }
                Ok(None) => {
                    // Distinguish end-of-stream from mid-stream rot by
                    // comparing against the declared frame count.
                    if frames_read >= source.frame_count {
                        info!(target: "pipeline", "playback finished ({} frames)", frames_read);
                        break Outcome::CleanStop;
                    }
                    error!(
                        target: "pipeline",
                        "read failed at frame {}/{} — file damaged?",
                        frames_read, source.frame_count
                    );
                    break Outcome::ReadFailed;
                }
                Err(err) => {
                    error!(target: "pipeline", "playback read error: {}", err);
                    break Outcome::ReadFailed;
                }
            }
        };

        if window_open {
            let _ = highgui::destroy_window(&label);
        }
        // Only an external stop cancels re-detection early; otherwise it
        // finishes scanning the whole file.
        if *stop_rx.borrow() {
            let _ = redetect_cancel_tx.send(true);
        }
        if let Some(handle) = redetect_handle {
            if handle.join().is_err() {
                error!(target: "pipeline", "re-detect worker panicked");
            }
        }
        outcome
    }

    fn ceiling(&self) -> (i32, i32) {
        (self.cfg.capture.max_width, self.cfg.capture.max_height)
    }
}

fn write_resized(
    writer: &mut VideoWriter,
    mat: &Mat,
    width: i32,
    height: i32,
) -> opencv::Result<()> {
    if mat.cols() == width && mat.rows() == height {
        writer.write(mat)
    } else {
        let mut resized = Mat::default();
        imgproc::resize(
            mat,
            &mut resized,
            Size::new(width, height),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;
        writer.write(&resized)
    }
}
