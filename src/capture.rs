//! Frame source adapter.
//!
//! Opens a capture handle for a local device, a network URL or a stored
//! video file, normalizes resolution and frame rate on open, and pulls
//! frames with a decode-thinning schedule derived from the effective
//! frame rate.

use std::path::{Path, PathBuf};

use opencv::core::{Mat, Size};
use opencv::prelude::*;
use opencv::{imgproc, videoio};
use tracing::info;

use crate::error::{HomewatchError, Result};
use crate::types::Frame;

/// Frame-rate readings equal to this value are an RTP clock frequency,
/// not a real rate, and are left unscaled.
const CLOCK_FREQUENCY_SENTINEL: i32 = 90_000;
const FPS_CAP: f64 = 30.0;
const DEFAULT_FPS: f64 = 30.0;

#[derive(Debug, Clone)]
pub enum SourceKind {
    Device(i32),
    Url(String),
    File(PathBuf),
}

impl SourceKind {
    pub fn label(&self) -> String {
        match self {
            SourceKind::Device(idx) => format!("device {}", idx),
            SourceKind::Url(url) => url.clone(),
            SourceKind::File(path) => path.display().to_string(),
        }
    }
}

/// Decide which grabbed frames get decoded. High-rate sources are
/// thinned so downstream work tracks wall-clock, not device rate.
struct FrameThinner {
    decode_every: u64,
    grabbed: u64,
}

impl FrameThinner {
    fn for_fps(fps: f64) -> Self {
        let decode_every = if fps >= 60.0 {
            4
        } else if fps >= 15.0 {
            2
        } else {
            1
        };
        Self {
            decode_every,
            grabbed: 0,
        }
    }

    fn should_decode(&mut self) -> bool {
        let idx = self.grabbed;
        self.grabbed = self.grabbed.wrapping_add(1);
        idx % self.decode_every == 0
    }
}

pub struct FrameSource {
    cap: videoio::VideoCapture,
    label: String,
    /// Normalized (post-cap) frame size.
    pub width: i32,
    pub height: i32,
    /// Native size as reported before normalization.
    pub real_width: i32,
    pub real_height: i32,
    pub fps: f64,
    /// Set when the device ignored the capped-resolution request and
    /// frames must be resized in software.
    resize_to: Option<Size>,
    thinner: Option<FrameThinner>,
    /// Declared frame count (file sources only).
    pub frame_count: i64,
}

impl FrameSource {
    /// Open a live source (device or URL) and normalize it against the
    /// orientation-aware resolution ceiling.
    pub fn open(kind: &SourceKind, ceiling: (i32, i32)) -> Result<Self> {
        let label = kind.label();
        let cap = match kind {
            SourceKind::Device(idx) => videoio::VideoCapture::new(*idx, videoio::CAP_ANY)?,
            SourceKind::Url(url) => videoio::VideoCapture::from_file(url, videoio::CAP_FFMPEG)?,
            SourceKind::File(path) => {
                videoio::VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)?
            }
        };
        if !cap.is_opened()? {
            return Err(HomewatchError::OpenFailed(label));
        }
        let mut source = Self::normalize(cap, label, ceiling)?;
        source.thinner = Some(FrameThinner::for_fps(source.fps));
        Ok(source)
    }

    /// Open a stored video file for replay: every frame is decoded (no
    /// thinning) and the declared frame count is read for end-of-stream
    /// detection.
    pub fn open_file(path: &Path, ceiling: (i32, i32)) -> Result<Self> {
        let label = path.display().to_string();
        let cap = videoio::VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)?;
        if !cap.is_opened()? {
            return Err(HomewatchError::OpenFailed(label));
        }
        let mut source = Self::normalize(cap, label, ceiling)?;
        source.frame_count = source.cap.get(videoio::CAP_PROP_FRAME_COUNT)? as i64;

        let fourcc = source.cap.get(videoio::CAP_PROP_FOURCC)? as i32;
        let fourcc: String = (0..4)
            .map(|i| (((fourcc >> (8 * i)) & 0xff) as u8) as char)
            .collect();
        let duration = if source.fps > 0.0 {
            source.frame_count as f64 / source.fps
        } else {
            0.0
        };
        info!(
            target: "capture",
            "opened file {} — {} frames, {:.1}s, fourcc {}",
            source.label, source.frame_count, duration, fourcc
        );
        Ok(source)
    }

    fn normalize(
        mut cap: videoio::VideoCapture,
        label: String,
        ceiling: (i32, i32),
    ) -> Result<Self> {
        let real_width = cap.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let real_height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
        let real_fps = cap.get(videoio::CAP_PROP_FPS)? as i32;

        // Orientation-aware ceiling: portrait sources get the transposed
        // limit.
        let (cap_w, cap_h) = if real_width >= real_height {
            ceiling
        } else {
            (ceiling.1, ceiling.0)
        };

        let (mut width, mut height) = (real_width, real_height);
        let mut resize_to = None;
        if real_width > cap_w || real_height > cap_h {
            // Ask the device for the capped mode, then trust only what it
            // reports back; resize in software if it would not comply.
            cap.set(videoio::CAP_PROP_FRAME_WIDTH, cap_w as f64)?;
            cap.set(videoio::CAP_PROP_FRAME_HEIGHT, cap_h as f64)?;
            width = cap.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32;
            height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
            if width > cap_w || height > cap_h {
                resize_to = Some(Size::new(cap_w, cap_h));
                width = cap_w;
                height = cap_h;
            }
        }

        let fps = if real_fps == CLOCK_FREQUENCY_SENTINEL {
            DEFAULT_FPS
        } else if real_fps as f64 > FPS_CAP {
            cap.set(videoio::CAP_PROP_FPS, FPS_CAP)?;
            let achieved = cap.get(videoio::CAP_PROP_FPS)?;
            if achieved > 0.0 {
                achieved.min(FPS_CAP)
            } else {
                FPS_CAP
            }
        } else if real_fps > 0 {
            real_fps as f64
        } else {
            DEFAULT_FPS
        };

        info!(
            target: "capture",
            "opened {} — native {}x{}@{}, normalized {}x{}@{:.0}{}",
            label, real_width, real_height, real_fps, width, height, fps,
            if resize_to.is_some() { " (software resize)" } else { "" }
        );

        Ok(Self {
            cap,
            label,
            width,
            height,
            real_width,
            real_height,
            fps,
            resize_to,
            thinner: None,
            frame_count: 0,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Grab one frame from a live source. `Ok(None)` means the frame was
    /// thinned out (grabbed but not decoded); an error means the source
    /// dropped and the run must end.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.cap.grab()? {
            return Err(HomewatchError::ReadFailed(self.label.clone()));
        }
        if let Some(thinner) = self.thinner.as_mut() {
            if !thinner.should_decode() {
                return Ok(None);
            }
        }
        let mut mat = Mat::default();
        if !self.cap.retrieve(&mut mat, 0)? || mat.empty() {
            return Err(HomewatchError::ReadFailed(self.label.clone()));
        }
        Ok(Some(Frame::new(self.apply_resize(mat)?)))
    }

    /// Read one frame from a file source. `Ok(None)` signals that the
    /// read failed — the caller compares frames-read to the declared
    /// count to tell end-of-stream from mid-stream corruption.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut mat = Mat::default();
        if !self.cap.read(&mut mat)? || mat.empty() {
            return Ok(None);
        }
        Ok(Some(Frame::new(self.apply_resize(mat)?)))
    }

    fn apply_resize(&self, mat: Mat) -> Result<Mat> {
        match self.resize_to {
            Some(size) => {
                let mut resized = Mat::default();
                imgproc::resize(&mat, &mut resized, size, 0.0, 0.0, imgproc::INTER_LINEAR)?;
                Ok(resized)
            }
            None => Ok(mat),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoded_of(fps: f64, grabs: usize) -> usize {
        let mut thinner = FrameThinner::for_fps(fps);
        (0..grabs).filter(|_| thinner.should_decode()).count()
    }

    #[test]
    fn thinning_schedule_follows_frame_rate() {
        assert_eq!(decoded_of(10.0, 40), 40); // below 15: decode all
        assert_eq!(decoded_of(30.0, 40), 20); // [15,60): every 2nd
        assert_eq!(decoded_of(60.0, 40), 10); // ≥60: every 4th
    }

    #[test]
    fn first_grab_is_always_decoded() {
        let mut thinner = FrameThinner::for_fps(60.0);
        assert!(thinner.should_decode());
        assert!(!thinner.should_decode());
    }
}
