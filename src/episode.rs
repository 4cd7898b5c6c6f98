//! Alert episode lifecycle.
//!
//! An episode spans from the first anomalous frame until a full buffer
//! length of consecutive clean frames has elapsed. Within an episode the
//! per-kind confidence high-water mark gates re-alerting: a kind only
//! produces a second event when its severity *level* rises above the
//! recorded one, so a sustained fire does not alert on every frame while
//! a fire that grows from level 2 to level 3 still surfaces.

use crate::types::{severity_level, AlertCode, AlertEvent, AlertKind, Sensitivity};

/// What the detection worker must do after feeding one frame's reduced
/// result to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum EpisodeAction {
    /// No episode active and nothing fired.
    Idle,
    /// A new episode opened: emit the event, open an evidence clip and
    /// flush the whole buffer into it.
    Opened(AlertEvent),
    /// A kind escalated inside the active episode: emit the incremental
    /// event and flush the buffer into the open clip.
    Escalated(AlertEvent),
    /// The active episode continues unchanged: flush the buffer into the
    /// open clip.
    Sustained,
    /// The cool-down period expired: flush, then close the clip.
    Closed,
}

pub struct EpisodeTracker {
    /// Clean frames required to close an episode (= buffer capacity).
    cooldown_frames: usize,
    sensitivity: Sensitivity,
    active: bool,
    /// Per-kind confidence high-water mark for the current episode.
    high_water: [f32; 4],
    clean_frames: usize,
}

impl EpisodeTracker {
    pub fn new(cooldown_frames: usize, sensitivity: Sensitivity) -> Self {
        Self {
            cooldown_frames,
            sensitivity,
            active: false,
            high_water: [0.0; 4],
            clean_frames: 0,
        }
    }

    pub fn active(&self) -> bool {
        self.active
    }

    /// Feed one frame's alert code and per-kind max confidences.
    pub fn observe(
        &mut self,
        code: AlertCode,
        confidences: [f32; 4],
        timestamp: String,
    ) -> EpisodeAction {
        if code.is_empty() {
            return self.observe_clean();
        }

        self.clean_frames = 0;

        if !self.active {
            self.active = true;
            self.high_water = confidences;
            return EpisodeAction::Opened(AlertEvent {
                code,
                timestamp,
                confidences,
                sensitivity: self.sensitivity,
            });
        }

        // Compare levels (not raw confidences) against the high-water
        // mark. A kind that had not fired before starts at level 0, so a
        // genuinely new kind escalates too.
        let mut escalated = AlertCode::NONE;
        for kind in AlertKind::ALL {
            let i = kind.index();
            let recorded = severity_level(self.high_water[i], self.sensitivity);
            let observed = severity_level(confidences[i], self.sensitivity);
            if observed > recorded {
                escalated.set(kind);
                self.high_water[i] = confidences[i];
            }
        }

        if escalated.is_empty() {
            EpisodeAction::Sustained
        } else {
            EpisodeAction::Escalated(AlertEvent {
                code: escalated,
                timestamp,
                confidences,
                sensitivity: self.sensitivity,
            })
        }
    }

    fn observe_clean(&mut self) -> EpisodeAction {
        if !self.active {
            return EpisodeAction::Idle;
        }
        self.clean_frames += 1;
        if self.clean_frames >= self.cooldown_frames {
            self.active = false;
            self.high_water = [0.0; 4];
            self.clean_frames = 0;
            EpisodeAction::Closed
        } else {
            EpisodeAction::Sustained
        }
    }
}
