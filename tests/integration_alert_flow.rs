//! End-to-end flow over the public seams: synthetic frames through the
//! detection engine, emitted events through the alert dispatcher.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Local, TimeZone};
use opencv::core::Mat;

use homewatch::alerts::{AlertDispatcher, AlertOutput};
use homewatch::types::{AlertEvent, AlertKind, DetectMode, Frame, Sensitivity};
use homewatch::worker::{
    DetectionEngine, EvidenceClip, EvidenceSink, InferBackend, RawDetection, WorkerConfig,
};

// ─── Test doubles ────────────────────────────────────────────────────────────

struct FireAtFrame {
    at: usize,
    confidence: f32,
    calls: AtomicUsize,
}

impl InferBackend for FireAtFrame {
    fn infer(
        &self,
        _mat: &Mat,
        _mode: DetectMode,
        _confidence: f32,
    ) -> anyhow::Result<Vec<RawDetection>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == self.at {
            Ok(vec![RawDetection {
                kind: AlertKind::Fire,
                confidence: self.confidence,
                bbox: (10, 10, 60, 60),
            }])
        } else {
            Ok(Vec::new())
        }
    }
}

#[derive(Clone, Default)]
struct NullSink {
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

struct NullClip {
    closed: Arc<AtomicUsize>,
}

impl EvidenceClip for NullClip {
    fn write(&mut self, _mat: &Mat) -> anyhow::Result<()> {
        Ok(())
    }
    fn close(&mut self) -> anyhow::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl EvidenceSink for NullSink {
    type Clip = NullClip;
    fn open_clip(
        &mut self,
        _name: &str,
        _width: i32,
        _height: i32,
        _fps: f64,
    ) -> anyhow::Result<NullClip> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(NullClip {
            closed: Arc::clone(&self.closed),
        })
    }
    fn save_still(&mut self, _name: &str, _mat: &Mat) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingOutput {
    cues: AtomicUsize,
    last_level: AtomicU8,
    emails: Mutex<Vec<Vec<(AlertKind, u8)>>>,
}

impl AlertOutput for Arc<RecordingOutput> {
    fn cue(&self, level: u8) {
        self.cues.fetch_add(1, Ordering::SeqCst);
        self.last_level.store(level, Ordering::SeqCst);
    }
    fn email(
        &self,
        kinds: &[(AlertKind, u8)],
        _timestamp: &str,
        _recipients: &[String],
    ) -> anyhow::Result<()> {
        self.emails.lock().unwrap().push(kinds.to_vec());
        Ok(())
    }
}

fn synthetic_frame(seq: i64) -> Frame {
    Frame {
        mat: Mat::default(),
        captured_at: Local.with_ymd_and_hms(2024, 6, 11, 12, 0, 0).unwrap()
            + ChronoDuration::milliseconds(seq * 33),
    }
}

// ─── The flow ────────────────────────────────────────────────────────────────

#[test]
fn fire_detection_reaches_the_dispatcher_as_one_level_three_alert() {
    let backend = FireAtFrame {
        at: 20,
        confidence: 0.92,
        calls: AtomicUsize::new(0),
    };
    let sink = NullSink::default();
    let (opened, closed) = (Arc::clone(&sink.opened), Arc::clone(&sink.closed));
    let (alert_tx, alert_rx) = flume::unbounded::<AlertEvent>();

    let cfg = WorkerConfig {
        mode: DetectMode::All,
        sensitivity: Sensitivity::Low,
        buffer_capacity: 30,
        idle_timeout: Duration::from_secs(1),
        clip_fps: 30.0,
    };
    let mut engine = DetectionEngine::new(backend, sink, cfg, alert_tx);
    for i in 0..50 {
        engine.ingest(vec![synthetic_frame(i)]).unwrap();
    }
    engine.finish();

    // One episode, one clip.
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    // One event, carrying the fire bit.
    let events: Vec<AlertEvent> = alert_rx.drain().collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code.bits(), 2);

    // Dispatch it: cue at level 3, one email (level ≥ 3).
    let output = Arc::new(RecordingOutput::default());
    let dispatcher = AlertDispatcher::new(
        Arc::clone(&output),
        vec!["owner@example.com".into()],
        Duration::from_secs(30),
    );
    for event in &events {
        dispatcher.dispatch(event);
    }

    assert_eq!(output.cues.load(Ordering::SeqCst), 1);
    assert_eq!(output.last_level.load(Ordering::SeqCst), 3);
    let emails = output.emails.lock().unwrap();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0], vec![(AlertKind::Fire, 3)]);
}
