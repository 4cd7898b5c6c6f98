//! Visualization worker.
//!
//! Network decode paths can be much slower than capture; drawing in the
//! capture loop would throttle recording and detection to display
//! speed, so network sources get their own display worker fed by a
//! frame channel. Local and history sources draw in-process instead.

use std::time::Duration;

use opencv::highgui;
use tracing::{info, warn};

use crate::types::Frame;

/// Why the viewer exited, reported on the done channel so the
/// controller can log the correct cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerExit {
    /// User pressed `q`/ESC or closed the window.
    Dismissed,
    /// No frame arrived within the idle timeout.
    TimedOut,
    /// Sentinel received — upstream ended the stream.
    Ended,
}

const DISMISS_KEYS: [i32; 2] = ['q' as i32, 27];

fn window_size(width: i32, height: i32) -> (i32, i32) {
    if width > height {
        (1280, 720)
    } else if width < height {
        (720, 1280)
    } else {
        (720, 720)
    }
}

/// Run the display loop. Sends the exit cause on `done_tx` (except for
/// the upstream-ended case, where the controller is already shutting
/// down) and drains any frames still queued so the sender never blocks
/// against a dead window.
pub fn run_viewer(
    frame_rx: flume::Receiver<Option<Frame>>,
    done_tx: flume::Sender<ViewerExit>,
    title: &str,
    width: i32,
    height: i32,
    idle_timeout: Duration,
) {
    let exit = viewer_loop(&frame_rx, title, width, height, idle_timeout);
    drain(&frame_rx);
    let _ = highgui::destroy_window(title);
    match exit {
        ViewerExit::Ended => info!(target: "viewer", "stream ended, viewer exiting"),
        cause => {
            info!(target: "viewer", "viewer exiting: {:?}", cause);
            let _ = done_tx.send(cause);
        }
    }
}

fn viewer_loop(
    frame_rx: &flume::Receiver<Option<Frame>>,
    title: &str,
    width: i32,
    height: i32,
    idle_timeout: Duration,
) -> ViewerExit {
    if let Err(err) = open_window(title, width, height) {
        warn!(target: "viewer", "could not create window: {}", err);
        return ViewerExit::Dismissed;
    }

    loop {
        let frame = match frame_rx.recv_timeout(idle_timeout) {
            Ok(Some(frame)) => frame,
            Ok(None) => return ViewerExit::Ended,
            Err(flume::RecvTimeoutError::Timeout) => {
                warn!(
                    target: "viewer",
                    "no frame within {:?} — reporting timeout", idle_timeout
                );
                return ViewerExit::TimedOut;
            }
            Err(flume::RecvTimeoutError::Disconnected) => return ViewerExit::Ended,
        };

        if highgui::imshow(title, &frame.mat).is_err() {
            return ViewerExit::Dismissed;
        }
        let key = highgui::wait_key(1).unwrap_or(-1);
        if DISMISS_KEYS.contains(&(key & 0xff)) {
            return ViewerExit::Dismissed;
        }
        let visible = highgui::get_window_property(title, highgui::WND_PROP_VISIBLE)
            .unwrap_or(0.0);
        if visible < 1.0 {
            return ViewerExit::Dismissed;
        }
    }
}

/// Create a resizable window sized for the source orientation. Also
/// used by the controller for in-process display of local sources.
pub(crate) fn open_window(title: &str, width: i32, height: i32) -> opencv::Result<()> {
    highgui::named_window(
        title,
        highgui::WINDOW_NORMAL | highgui::WINDOW_KEEPRATIO | highgui::WINDOW_GUI_EXPANDED,
    )?;
    let (w, h) = window_size(width, height);
    highgui::resize_window(title, w, h)
}

fn drain(frame_rx: &flume::Receiver<Option<Frame>>) {
    for _ in frame_rx.try_iter() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_size_is_orientation_aware() {
        assert_eq!(window_size(1920, 1080), (1280, 720));
        assert_eq!(window_size(1080, 1920), (720, 1280));
        assert_eq!(window_size(600, 600), (720, 720));
    }
}
