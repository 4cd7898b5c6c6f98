//! Connectivity probe for network sources.
//!
//! The capture backend blocks uninterruptibly on unreachable hosts, so
//! the open attempt runs in a detached worker thread that reports over a
//! single-slot channel. The caller waits at most `deadline`; on timeout
//! the worker is abandoned (a thread cannot be killed — the stuck
//! attempt dies with the process, and the caller is unblocked either
//! way).

use std::time::Duration;

use opencv::prelude::*;
use opencv::videoio::{VideoCapture, CAP_FFMPEG};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Opened,
    Failed,
    TimedOut,
}

/// Probe whether `url` yields a video stream within `deadline`.
pub fn probe_url(url: &str, deadline: Duration) -> ProbeOutcome {
    let url = url.to_string();
    probe_with(deadline, move || {
        match VideoCapture::from_file(&url, CAP_FFMPEG) {
            Ok(cap) => cap.is_opened().unwrap_or(false),
            Err(err) => {
                warn!(target: "probe", "capture open errored: {}", err);
                false
            }
        }
    })
}

/// Deadline-bounded probe over an arbitrary open attempt. Split out so
/// the timeout path is testable without a network.
pub fn probe_with<F>(deadline: Duration, open: F) -> ProbeOutcome
where
    F: FnOnce() -> bool + Send + 'static,
{
    let (tx, rx) = flume::bounded::<bool>(1);
    let spawned = std::thread::Builder::new()
        .name("homewatch-probe".into())
        .spawn(move || {
            let _ = tx.send(open());
        });
    if spawned.is_err() {
        return ProbeOutcome::Failed;
    }

    match rx.recv_timeout(deadline) {
        Ok(true) => ProbeOutcome::Opened,
        Ok(false) => ProbeOutcome::Failed,
        Err(_) => {
            debug!(target: "probe", "open attempt still blocked after {:?}, abandoning", deadline);
            ProbeOutcome::TimedOut
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn reports_success_and_failure() {
        assert_eq!(
            probe_with(Duration::from_secs(1), || true),
            ProbeOutcome::Opened
        );
        assert_eq!(
            probe_with(Duration::from_secs(1), || false),
            ProbeOutcome::Failed
        );
    }

    #[test]
    fn deadline_is_honored_for_blocked_opens() {
        let started = Instant::now();
        let outcome = probe_with(Duration::from_millis(200), || {
            std::thread::sleep(Duration::from_secs(10));
            true
        });
        let elapsed = started.elapsed();
        assert_eq!(outcome, ProbeOutcome::TimedOut);
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(600), "caller blocked too long: {:?}", elapsed);
    }
}
