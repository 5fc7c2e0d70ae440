use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::app::clock::Clock;
use crate::app::error::AppError;
use crate::app::models::{LogEvent, OutputPayload, OutputStream};
use crate::app::relay::OutputRelay;
use crate::app::scheduler::relock;

/// Derives extra events from a session's output lines.
pub trait LineObserver: Send {
    /// May set `event.tag` before the line is published.
    fn on_line(&mut self, event: &mut LogEvent) -> Vec<OutputPayload>;

    fn on_tick(&mut self, _now: DateTime<Utc>) -> Vec<OutputPayload> {
        Vec::new()
    }

    fn on_finish(&mut self) -> Vec<OutputPayload> {
        Vec::new()
    }
}

struct PipelineInner {
    observers: Vec<Box<dyn LineObserver>>,
    tee: Option<BufWriter<File>>,
    finished: bool,
}

/// Single writer in front of a session relay. Both reader threads push here;
/// one lock keeps each line and the events it produced contiguous.
pub struct OutputPipeline {
    serial: String,
    relay: Arc<OutputRelay>,
    clock: Arc<dyn Clock>,
    inner: Mutex<PipelineInner>,
}

impl OutputPipeline {
    pub fn new(serial: &str, relay: Arc<OutputRelay>, clock: Arc<dyn Clock>) -> Self {
        Self {
            serial: serial.to_string(),
            relay,
            clock,
            inner: Mutex::new(PipelineInner {
                observers: Vec::new(),
                tee: None,
                finished: false,
            }),
        }
    }

    pub fn with_observer(self, observer: Box<dyn LineObserver>) -> Self {
        relock(&self.inner).observers.push(observer);
        self
    }

    /// Copies every raw line to `path`.
    pub fn with_tee(self, path: &Path, trace_id: &str) -> Result<Self, AppError> {
        let file = File::create(path).map_err(|err| {
            AppError::system(format!("Failed to create output file: {err}"), trace_id)
        })?;
        relock(&self.inner).tee = Some(BufWriter::new(file));
        Ok(self)
    }

    pub fn relay(&self) -> &Arc<OutputRelay> {
        &self.relay
    }

    pub fn push_line(&self, stream: OutputStream, line: String) {
        let mut inner = relock(&self.inner);
        if inner.finished {
            return;
        }
        if let Some(tee) = inner.tee.as_mut() {
            if let Err(err) = writeln!(tee, "{line}") {
                warn!(serial = %self.serial, error = %err, "output tee write failed; disabling");
                inner.tee = None;
            }
        }

        let mut event = LogEvent {
            timestamp: self.clock.now(),
            serial: self.serial.clone(),
            stream,
            line,
            tag: None,
        };
        let derived: Vec<OutputPayload> = inner
            .observers
            .iter_mut()
            .flat_map(|observer| observer.on_line(&mut event))
            .collect();
        self.relay.publish(OutputPayload::Line(event));
        for payload in derived {
            self.relay.publish(payload);
        }
    }

    /// Periodic hook for time-based flushing.
    pub fn tick(&self) {
        let now = self.clock.now();
        let mut inner = relock(&self.inner);
        if inner.finished {
            return;
        }
        let derived: Vec<OutputPayload> = inner
            .observers
            .iter_mut()
            .flat_map(|observer| observer.on_tick(now))
            .collect();
        if let Some(tee) = inner.tee.as_mut() {
            let _ = tee.flush();
        }
        for payload in derived {
            self.relay.publish(payload);
        }
    }

    /// Flushes observers and the tee. Lines pushed afterwards are dropped.
    pub fn finish(&self) {
        let mut inner = relock(&self.inner);
        if inner.finished {
            return;
        }
        inner.finished = true;
        let derived: Vec<OutputPayload> = inner
            .observers
            .iter_mut()
            .flat_map(|observer| observer.on_finish())
            .collect();
        if let Some(mut tee) = inner.tee.take() {
            if let Err(err) = tee.flush() {
                warn!(serial = %self.serial, error = %err, "failed to flush output tee");
            }
        }
        for payload in derived {
            self.relay.publish(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::clock::SystemClock;
    use crate::app::models::{MatchKind, OutputEvent, PatternMatch};
    use tempfile::TempDir;

    struct EchoObserver;

    impl LineObserver for EchoObserver {
        fn on_line(&mut self, event: &mut LogEvent) -> Vec<OutputPayload> {
            if !event.line.contains("hit") {
                return Vec::new();
            }
            event.tag = Some("echo".to_string());
            vec![OutputPayload::Match(PatternMatch {
                pattern_id: "echo".to_string(),
                kind: MatchKind::Event,
                line: event.line.clone(),
                block: Vec::new(),
                timestamp: event.timestamp,
            })]
        }

        fn on_finish(&mut self) -> Vec<OutputPayload> {
            vec![OutputPayload::Match(PatternMatch {
                pattern_id: "final".to_string(),
                kind: MatchKind::Crash,
                line: String::new(),
                block: Vec::new(),
                timestamp: Utc::now(),
            })]
        }
    }

    #[test]
    fn line_is_tagged_then_followed_by_its_matches_and_teed() {
        let dir = TempDir::new().expect("tempdir");
        let tee_path = dir.path().join("out.log");
        let relay = Arc::new(OutputRelay::new("s-1", 100));
        let pipeline = OutputPipeline::new("ABC", Arc::clone(&relay), Arc::new(SystemClock))
            .with_observer(Box::new(EchoObserver))
            .with_tee(&tee_path, "trace-pl1")
            .expect("tee");

        pipeline.push_line(OutputStream::Stdout, "miss".to_string());
        pipeline.push_line(OutputStream::Stderr, "a hit".to_string());
        pipeline.finish();
        pipeline.push_line(OutputStream::Stdout, "late".to_string());

        let history: Vec<OutputEvent> = relay.history();
        assert_eq!(history.len(), 4);
        match &history[1].payload {
            OutputPayload::Line(event) => {
                assert_eq!(event.tag.as_deref(), Some("echo"));
                assert_eq!(event.stream, OutputStream::Stderr);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(matches!(&history[2].payload, OutputPayload::Match(m) if m.pattern_id == "echo"));
        assert!(matches!(&history[3].payload, OutputPayload::Match(m) if m.pattern_id == "final"));

        let teed = std::fs::read_to_string(&tee_path).expect("tee file");
        assert_eq!(teed, "miss\na hit\n");
    }
}
