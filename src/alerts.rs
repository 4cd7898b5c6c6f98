//! Alert dispatcher.
//!
//! Turns one alert event into human-visible actions: a log line for
//! every kind that fired, an audible cue keyed to the maximum severity,
//! and — at level 3 and above — an email to every registered recipient.
//! Cue and mail delivery are best-effort external collaborators behind
//! [`AlertOutput`]; their failures are logged and swallowed, never
//! propagated into the pipeline.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use tracing::{error, info, warn};

use crate::config::AlertConfig;
use crate::types::{severity_level, AlertEvent, AlertKind};

/// Severity at and above which email notification fires.
const EMAIL_LEVEL: u8 = 3;

/// Delivery sink for the cue and email actions.
pub trait AlertOutput: Send + Sync {
    fn cue(&self, level: u8);
    fn email(
        &self,
        kinds: &[(AlertKind, u8)],
        timestamp: &str,
        recipients: &[String],
    ) -> anyhow::Result<()>;
}

pub struct AlertDispatcher<O: AlertOutput> {
    output: O,
    recipients: Vec<String>,
    cooldown: Duration,
    /// Last cue time and level per kind — the dedup window.
    fired: Mutex<HashMap<AlertKind, (Instant, u8)>>,
}

impl<O: AlertOutput> AlertDispatcher<O> {
    pub fn new(output: O, recipients: Vec<String>, cooldown: Duration) -> Self {
        Self {
            output,
            recipients,
            cooldown,
            fired: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one alert event. Logging always happens; the cooldown
    /// window only gates cue/email delivery, and a level increase
    /// always breaks through it.
    pub fn dispatch(&self, event: &AlertEvent) {
        let mut deliverable: Vec<(AlertKind, u8)> = Vec::new();
        let now = Instant::now();
        let mut fired = match self.fired.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        for kind in event.code.kinds() {
            let level = severity_level(event.confidences[kind.index()], event.sensitivity);
            warn!(
                target: "alert",
                "{} at {} with risk level {}", kind.label(), event.timestamp, level
            );
            let suppressed = match fired.get(&kind) {
                Some((last, last_level)) => {
                    now.duration_since(*last) < self.cooldown && level <= *last_level
                }
                None => false,
            };
            if suppressed {
                info!(
                    target: "alert",
                    "{} cue suppressed (inside {:?} window)", kind.label(), self.cooldown
                );
            } else {
                fired.insert(kind, (now, level));
                deliverable.push((kind, level));
            }
        }
        drop(fired);

        let Some(max_level) = deliverable.iter().map(|(_, l)| *l).max() else {
            return;
        };

        self.output.cue(max_level);

        if max_level >= EMAIL_LEVEL && !self.recipients.is_empty() {
            if let Err(err) = self
                .output
                .email(&deliverable, &event.timestamp, &self.recipients)
            {
                error!(target: "alert", "email notification failed: {:#}", err);
            } else {
                info!(
                    target: "alert",
                    "email sent to {} recipient(s)", self.recipients.len()
                );
            }
        }
    }
}

// ─── System delivery ─────────────────────────────────────────────────────────

/// Real delivery: warning audio via rodio, mail via the system
/// `sendmail`/`msmtp` transport.
pub struct SystemOutput {
    audio_dir: PathBuf,
    sender: Option<String>,
}

impl SystemOutput {
    pub fn new(cfg: &AlertConfig) -> Self {
        Self {
            audio_dir: PathBuf::from(&cfg.audio_dir),
            sender: cfg.sender.clone(),
        }
    }

    fn play_cue(&self, level: u8) -> anyhow::Result<()> {
        let path = self.audio_dir.join(format!("{}.mp3", level));
        let file = std::fs::File::open(&path)
            .with_context(|| format!("opening cue {}", path.display()))?;
        let (_stream, handle) = rodio::OutputStream::try_default()?;
        let sink = rodio::Sink::try_new(&handle)?;
        sink.append(rodio::Decoder::new(std::io::BufReader::new(file))?);
        sink.sleep_until_end();
        Ok(())
    }
}

impl AlertOutput for SystemOutput {
    fn cue(&self, level: u8) {
        if level == 0 {
            return;
        }
        if let Err(err) = self.play_cue(level) {
            warn!(target: "alert", "audio cue failed: {:#}", err);
        }
    }

    fn email(
        &self,
        kinds: &[(AlertKind, u8)],
        timestamp: &str,
        recipients: &[String],
    ) -> anyhow::Result<()> {
        let body = compose_email(kinds, timestamp, recipients, self.sender.as_deref());
        send_via_transport(&body)
    }
}

/// Plain-text MIME message summarizing kind/time/level per firing kind.
fn compose_email(
    kinds: &[(AlertKind, u8)],
    timestamp: &str,
    recipients: &[String],
    sender: Option<&str>,
) -> String {
    let mut msg = String::new();
    if let Some(from) = sender {
        msg.push_str(&format!("From: {}\r\n", from));
    }
    msg.push_str(&format!("To: {}\r\n", recipients.join(", ")));
    msg.push_str("Subject: Home surveillance warning\r\n");
    msg.push_str("MIME-Version: 1.0\r\n");
    msg.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
    for (kind, level) in kinds {
        msg.push_str(&format!(
            "Detected: {}\r\nTime: {}\r\nRisk level: {}\r\n\r\n",
            kind.label(),
            timestamp,
            level
        ));
    }
    msg
}

/// Pipe the message to the first available mail transport.
fn send_via_transport(message: &str) -> anyhow::Result<()> {
    for transport in ["sendmail", "msmtp"] {
        let spawned = Command::new(transport)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(_) => continue,
        };
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(message.as_bytes())?;
        }
        let status = child.wait()?;
        if status.success() {
            return Ok(());
        }
        return Err(anyhow!("{} exited with {}", transport, status));
    }
    Err(anyhow!("no mail transport available (tried sendmail, msmtp)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertCode, Sensitivity};
    use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingOutput {
        cues: AtomicUsize,
        last_cue_level: AtomicU8,
        emails: AtomicUsize,
        emailed_kinds: Mutex<Vec<Vec<(AlertKind, u8)>>>,
    }

    impl AlertOutput for Arc<RecordingOutput> {
        fn cue(&self, level: u8) {
            self.cues.fetch_add(1, Ordering::SeqCst);
            self.last_cue_level.store(level, Ordering::SeqCst);
        }
        fn email(
            &self,
            kinds: &[(AlertKind, u8)],
            _timestamp: &str,
            _recipients: &[String],
        ) -> anyhow::Result<()> {
            self.emails.fetch_add(1, Ordering::SeqCst);
            self.emailed_kinds.lock().unwrap().push(kinds.to_vec());
            Ok(())
        }
    }

    fn event(kinds: &[(AlertKind, f32)]) -> AlertEvent {
        let mut code = AlertCode::NONE;
        let mut confs = [0.0f32; 4];
        for (kind, conf) in kinds {
            code.set(*kind);
            confs[kind.index()] = *conf;
        }
        AlertEvent {
            code,
            timestamp: "2024-06-11_12-00-00".to_string(),
            confidences: confs,
            sensitivity: Sensitivity::Low,
        }
    }

    fn dispatcher(
        cooldown: Duration,
        recipients: Vec<String>,
    ) -> (AlertDispatcher<Arc<RecordingOutput>>, Arc<RecordingOutput>) {
        let output = Arc::new(RecordingOutput::default());
        (
            AlertDispatcher::new(Arc::clone(&output), recipients, cooldown),
            output,
        )
    }

    #[test]
    fn cue_uses_maximum_severity_among_set_bits() {
        let (dispatcher, output) =
            dispatcher(Duration::from_secs(30), vec!["a@example.com".into()]);
        dispatcher.dispatch(&event(&[(AlertKind::Smoke, 0.55), (AlertKind::Fire, 0.91)]));
        assert_eq!(output.cues.load(Ordering::SeqCst), 1);
        assert_eq!(output.last_cue_level.load(Ordering::SeqCst), 3); // fire: 0.91
    }

    #[test]
    fn email_only_at_level_three_and_above() {
        let (dispatcher, output) =
            dispatcher(Duration::from_millis(0), vec!["a@example.com".into()]);
        dispatcher.dispatch(&event(&[(AlertKind::Fire, 0.85)])); // level 2
        assert_eq!(output.emails.load(Ordering::SeqCst), 0);

        dispatcher.dispatch(&event(&[(AlertKind::Fire, 0.96)])); // level 4
        assert_eq!(output.emails.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_email_without_recipients() {
        let (dispatcher, output) = dispatcher(Duration::from_millis(0), vec![]);
        dispatcher.dispatch(&event(&[(AlertKind::Fall, 0.97)]));
        assert_eq!(output.emails.load(Ordering::SeqCst), 0);
        assert_eq!(output.cues.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cooldown_suppresses_repeat_but_not_escalation() {
        let (dispatcher, output) =
            dispatcher(Duration::from_secs(60), vec!["a@example.com".into()]);

        dispatcher.dispatch(&event(&[(AlertKind::Stranger, 0.7)])); // level 1
        dispatcher.dispatch(&event(&[(AlertKind::Stranger, 0.7)])); // suppressed
        assert_eq!(output.cues.load(Ordering::SeqCst), 1);

        // A level rise breaks through the window.
        dispatcher.dispatch(&event(&[(AlertKind::Stranger, 0.96)]));
        assert_eq!(output.cues.load(Ordering::SeqCst), 2);
        assert_eq!(output.last_cue_level.load(Ordering::SeqCst), 4);
        assert_eq!(output.emails.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn email_failure_is_swallowed() {
        struct FailingOutput;
        impl AlertOutput for FailingOutput {
            fn cue(&self, _level: u8) {}
            fn email(
                &self,
                _kinds: &[(AlertKind, u8)],
                _timestamp: &str,
                _recipients: &[String],
            ) -> anyhow::Result<()> {
                Err(anyhow!("smtp down"))
            }
        }
        let dispatcher = AlertDispatcher::new(
            FailingOutput,
            vec!["a@example.com".into()],
            Duration::from_millis(0),
        );
        // Must not panic or propagate.
        dispatcher.dispatch(&event(&[(AlertKind::Fire, 0.99)]));
    }

    #[test]
    fn composed_email_lists_every_kind() {
        let msg = compose_email(
            &[(AlertKind::Fire, 3), (AlertKind::Smoke, 1)],
            "2024-06-11_12-00-00",
            &["a@example.com".into(), "b@example.com".into()],
            Some("homewatch@example.com"),
        );
        assert!(msg.contains("To: a@example.com, b@example.com"));
        assert!(msg.contains("Detected: fire"));
        assert!(msg.contains("Detected: smoke"));
        assert!(msg.contains("Risk level: 3"));
    }
}
