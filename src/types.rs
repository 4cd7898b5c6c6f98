use chrono::{DateTime, Local};
use crossbeam::atomic::AtomicCell;
use opencv::core::Mat;

/// Timestamp format shared by log lines, file names and alert payloads.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

pub fn format_timestamp(t: DateTime<Local>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

// ─── Frames ──────────────────────────────────────────────────────────────────

/// One captured frame. Ownership moves into a channel on send; each
/// downstream consumer gets its own clone.
#[derive(Debug, Clone)]
pub struct Frame {
    pub mat: Mat,
    pub captured_at: DateTime<Local>,
}

impl Frame {
    pub fn new(mat: Mat) -> Self {
        Self {
            mat,
            captured_at: Local::now(),
        }
    }

    pub fn timestamp(&self) -> String {
        format_timestamp(self.captured_at)
    }
}

// ─── Anomaly kinds ───────────────────────────────────────────────────────────

/// The four anomaly kinds the models can fire on. Each kind owns one bit
/// of an [`AlertCode`] and one slot of a confidence vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    Smoke,
    Fire,
    Stranger,
    Fall,
}

impl AlertKind {
    pub const ALL: [AlertKind; 4] = [
        AlertKind::Smoke,
        AlertKind::Fire,
        AlertKind::Stranger,
        AlertKind::Fall,
    ];

    pub fn index(self) -> usize {
        match self {
            AlertKind::Smoke => 0,
            AlertKind::Fire => 1,
            AlertKind::Stranger => 2,
            AlertKind::Fall => 3,
        }
    }

    pub fn bit(self) -> u8 {
        1 << self.index()
    }

    pub fn label(self) -> &'static str {
        match self {
            AlertKind::Smoke => "smoke",
            AlertKind::Fire => "fire",
            AlertKind::Stranger => "stranger",
            AlertKind::Fall => "person-falling",
        }
    }
}

/// Bitmask of anomaly kinds firing on one frame. OR-combinable: several
/// kinds may be set from a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlertCode(u8);

impl AlertCode {
    pub const NONE: AlertCode = AlertCode(0);

    pub fn from_bits(bits: u8) -> Self {
        AlertCode(bits & 0x0f)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn set(&mut self, kind: AlertKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(self, kind: AlertKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: AlertCode) -> AlertCode {
        AlertCode(self.0 | other.0)
    }

    /// Set kinds, in fixed smoke→fire→stranger→fall order.
    pub fn kinds(self) -> impl Iterator<Item = AlertKind> {
        AlertKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl std::fmt::Display for AlertCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<&str> = self.kinds().map(|k| k.label()).collect();
        write!(f, "{}", labels.join("+"))
    }
}

// ─── Sensitivity & severity ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensitivity {
    Low,
    High,
}

impl Sensitivity {
    /// Confidence threshold handed to the models themselves.
    pub fn model_confidence(self) -> f32 {
        match self {
            Sensitivity::Low => 0.6,
            Sensitivity::High => 0.5,
        }
    }

    fn level_floor(self) -> f32 {
        match self {
            Sensitivity::Low => 0.5,
            Sensitivity::High => 0.3,
        }
    }
}

/// Map a detection confidence to a severity level 1..=4, or 0 below the
/// sensitivity-dependent floor. Breakpoints above the floor are fixed at
/// 0.8 / 0.9 / 0.95 for both sensitivities.
pub fn severity_level(confidence: f32, sensitivity: Sensitivity) -> u8 {
    if confidence < sensitivity.level_floor() {
        0
    } else if confidence < 0.8 {
        1
    } else if confidence < 0.9 {
        2
    } else if confidence < 0.95 {
        3
    } else {
        4
    }
}

// ─── Detection mode ──────────────────────────────────────────────────────────

/// Which model(s) the detection worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectMode {
    All,
    FireSmoke,
    Person,
    Fall,
}

// ─── Alert events ────────────────────────────────────────────────────────────

/// Payload flowing from the detection worker to the alert dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvent {
    pub code: AlertCode,
    pub timestamp: String,
    /// Per-kind confidence, indexed by [`AlertKind::index`].
    pub confidences: [f32; 4],
    pub sensitivity: Sensitivity,
}

// ─── Pipeline outcome ────────────────────────────────────────────────────────

/// Closed set of pipeline outcome codes posted to the status cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Clean stop: user request, dismissed window or end of stream.
    CleanStop,
    /// The source could not be opened at all.
    OpenFailed,
    /// A mid-stream frame read failed.
    ReadFailed,
    /// Recording file or directory creation failed.
    RecordCreateFailed,
    /// Transient marker: the source opened and streaming started.
    Started,
    /// Source-specific precondition failure (1..=3, meaning depends on
    /// the source kind).
    Precondition(i32),
}

impl Outcome {
    pub fn code(self) -> i32 {
        match self {
            Outcome::CleanStop => 0,
            Outcome::OpenFailed => -1,
            Outcome::ReadFailed => -2,
            Outcome::RecordCreateFailed => -3,
            Outcome::Started => -9,
            Outcome::Precondition(n) => n,
        }
    }
}

/// Sentinel meaning "no outcome posted yet".
pub const STATUS_UNSET: i32 = -10;

/// Lock-free single-writer/multi-reader outcome slot. The controller
/// writes, the caller polls.
pub struct StatusCell(AtomicCell<i32>);

impl StatusCell {
    pub fn new() -> Self {
        StatusCell(AtomicCell::new(STATUS_UNSET))
    }

    pub fn post(&self, outcome: Outcome) {
        self.0.store(outcome.code());
    }

    pub fn code(&self) -> i32 {
        self.0.load()
    }

    pub fn is_unset(&self) -> bool {
        self.code() == STATUS_UNSET
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_code_combines_bits() {
        let mut code = AlertCode::NONE;
        code.set(AlertKind::Fire);
        code.set(AlertKind::Fall);
        assert_eq!(code.bits(), 2 | 8);
        assert!(code.contains(AlertKind::Fire));
        assert!(!code.contains(AlertKind::Smoke));
        let kinds: Vec<_> = code.kinds().collect();
        assert_eq!(kinds, vec![AlertKind::Fire, AlertKind::Fall]);
        assert_eq!(code.to_string(), "fire+person-falling");
    }

    #[test]
    fn severity_breakpoints_low() {
        assert_eq!(severity_level(0.49, Sensitivity::Low), 0);
        assert_eq!(severity_level(0.50, Sensitivity::Low), 1);
        assert_eq!(severity_level(0.79, Sensitivity::Low), 1);
        assert_eq!(severity_level(0.80, Sensitivity::Low), 2);
        assert_eq!(severity_level(0.89, Sensitivity::Low), 2);
        assert_eq!(severity_level(0.90, Sensitivity::Low), 3);
        assert_eq!(severity_level(0.949, Sensitivity::Low), 3);
        assert_eq!(severity_level(0.95, Sensitivity::Low), 4);
        assert_eq!(severity_level(1.0, Sensitivity::Low), 4);
    }

    #[test]
    fn severity_breakpoints_high() {
        assert_eq!(severity_level(0.29, Sensitivity::High), 0);
        assert_eq!(severity_level(0.30, Sensitivity::High), 1);
        assert_eq!(severity_level(0.79, Sensitivity::High), 1);
        assert_eq!(severity_level(0.95, Sensitivity::High), 4);
    }

    #[test]
    fn severity_is_monotonic() {
        for sens in [Sensitivity::Low, Sensitivity::High] {
            let mut prev = 0;
            for step in 0..=100 {
                let level = severity_level(step as f32 / 100.0, sens);
                assert!(level >= prev, "level dropped at {}", step);
                prev = level;
            }
        }
    }

    #[test]
    fn status_cell_moves_from_unset_through_started_to_terminal() {
        let cell = StatusCell::new();
        assert!(cell.is_unset());
        cell.post(Outcome::Started);
        assert_eq!(cell.code(), -9);
        cell.post(Outcome::CleanStop);
        assert_eq!(cell.code(), 0);
    }
}
