//! Progress reporting from the engine to its caller
//!
//! Reports are fire-and-forget: a sink must never block the engine.

use lockbox_core::Progress;
use tokio::sync::mpsc::UnboundedSender;

/// Progress callback type (percent, message)
pub type ProgressFn = Box<dyn Fn(u8, &str) + Send + Sync>;

pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: u8, message: &str);
}

/// Discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _percent: u8, _message: &str) {}
}

impl ProgressSink for ProgressFn {
    fn report(&self, percent: u8, message: &str) {
        (self)(percent.min(100), message)
    }
}

impl ProgressSink for UnboundedSender<Progress> {
    fn report(&self, percent: u8, message: &str) {
        // A dropped receiver just means nobody is watching.
        let _ = self.send(Progress {
            percent: percent.min(100),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_channel_sink() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.report(5, "Processing file...");
        tx.report(250, "clamped");
        assert_eq!(
            rx.try_recv().unwrap(),
            Progress {
                percent: 5,
                message: "Processing file...".into()
            }
        );
        assert_eq!(rx.try_recv().unwrap().percent, 100);
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Progress>();
        drop(rx);
        tx.report(50, "nobody listening");
    }

    #[test]
    fn test_closure_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: ProgressFn = {
            let seen = seen.clone();
            Box::new(move |p: u8, m: &str| seen.lock().unwrap().push((p, m.to_string())))
        };
        sink.report(10, "a");
        sink.report(100, "b");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(10, "a".to_string()), (100, "b".to_string())]
        );
    }
}
