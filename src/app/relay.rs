use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Mutex;
use std::time::Duration;

use crate::app::models::{OutputEvent, OutputPayload};

/// Per-session broadcast of process output.
///
/// Events get a strictly increasing `seq` under one lock, so every subscriber
/// sees the same order. Each subscriber owns an unbounded channel: a slow
/// reader grows its own queue instead of losing events. History kept for
/// replay is bounded by `retention`; the end sentinel is kept separately so
/// late subscribers always see it.
pub struct OutputRelay {
    session_id: String,
    inner: Mutex<RelayInner>,
}

struct RelayInner {
    retention: usize,
    history: VecDeque<OutputEvent>,
    subscribers: Vec<Sender<OutputEvent>>,
    next_seq: u64,
    end: Option<OutputEvent>,
}

impl OutputRelay {
    pub fn new(session_id: impl Into<String>, retention: usize) -> Self {
        Self {
            session_id: session_id.into(),
            inner: Mutex::new(RelayInner {
                retention: retention.max(1),
                history: VecDeque::new(),
                subscribers: Vec::new(),
                next_seq: 0,
                end: None,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Appends an event. Returns its sequence number, or `None` once closed.
    pub fn publish(&self, payload: OutputPayload) -> Option<u64> {
        if matches!(payload, OutputPayload::End { .. }) {
            return self.close(payload);
        }
        let mut inner = self.lock();
        if inner.end.is_some() {
            return None;
        }
        let event = inner.stamp(&self.session_id, payload);
        let seq = event.seq;
        inner.broadcast(&event);
        inner.history.push_back(event);
        while inner.history.len() > inner.retention {
            inner.history.pop_front();
        }
        Some(seq)
    }

    /// Emits the end sentinel once and detaches every subscriber.
    pub fn close(&self, payload: OutputPayload) -> Option<u64> {
        let mut inner = self.lock();
        if inner.end.is_some() {
            return None;
        }
        let event = inner.stamp(&self.session_id, payload);
        let seq = event.seq;
        inner.broadcast(&event);
        inner.subscribers.clear();
        inner.end = Some(event);
        Some(seq)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().end.is_some()
    }

    /// Attaches a subscriber. With `replay`, retained history is queued first;
    /// both happen under the publish lock so nothing is skipped or repeated.
    pub fn subscribe(&self, replay: bool) -> Subscription {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.lock();
        if replay {
            for event in &inner.history {
                let _ = tx.send(event.clone());
            }
        }
        match inner.end.clone() {
            Some(end) => {
                let _ = tx.send(end);
            }
            None => inner.subscribers.push(tx),
        }
        Subscription {
            receiver: rx,
            finished: false,
        }
    }

    pub fn history(&self) -> Vec<OutputEvent> {
        self.lock().history.iter().cloned().collect()
    }

    /// Last `count` output lines, oldest first.
    pub fn tail_lines(&self, count: usize) -> Vec<String> {
        let inner = self.lock();
        let mut lines: Vec<String> = inner
            .history
            .iter()
            .rev()
            .filter_map(|event| match &event.payload {
                OutputPayload::Line(log) => Some(log.line.clone()),
                _ => None,
            })
            .take(count)
            .collect();
        lines.reverse();
        lines
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RelayInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl RelayInner {
    fn stamp(&mut self, session_id: &str, payload: OutputPayload) -> OutputEvent {
        let event = OutputEvent {
            seq: self.next_seq,
            session_id: session_id.to_string(),
            payload,
        };
        self.next_seq += 1;
        event
    }

    fn broadcast(&mut self, event: &OutputEvent) {
        // A failed send means the receiver was dropped.
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

/// Receiving end of a relay subscription.
pub struct Subscription {
    receiver: Receiver<OutputEvent>,
    finished: bool,
}

impl Subscription {
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<OutputEvent> {
        if self.finished {
            return None;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(self.track(event)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.finished = true;
                None
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<OutputEvent> {
        if self.finished {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(event) => Some(self.track(event)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.finished = true;
                None
            }
        }
    }

    /// True once the end sentinel has been received.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn track(&mut self, event: OutputEvent) -> OutputEvent {
        if event.is_end() {
            self.finished = true;
        }
        event
    }
}

/// Blocking iteration up to and including the end sentinel.
impl Iterator for Subscription {
    type Item = OutputEvent;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.receiver.recv() {
            Ok(event) => Some(self.track(event)),
            Err(_) => {
                self.finished = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::models::{LogEvent, OutputStream, SessionStatus};
    use chrono::Utc;
    use std::sync::Arc;

    fn line(text: &str) -> OutputPayload {
        OutputPayload::Line(LogEvent {
            timestamp: Utc::now(),
            serial: "ABC".to_string(),
            stream: OutputStream::Stdout,
            line: text.to_string(),
            tag: None,
        })
    }

    fn end() -> OutputPayload {
        OutputPayload::End {
            status: SessionStatus::Completed,
            exit_code: Some(0),
        }
    }

    fn text_of(event: &OutputEvent) -> Option<&str> {
        match &event.payload {
            OutputPayload::Line(log) => Some(log.line.as_str()),
            _ => None,
        }
    }

    #[test]
    fn live_subscriber_receives_events_in_order_then_end() {
        let relay = OutputRelay::new("s-1", 100);
        let subscription = relay.subscribe(false);
        for index in 0..20 {
            relay.publish(line(&format!("line {index}")));
        }
        relay.close(end());

        let events: Vec<OutputEvent> = subscription.collect();
        assert_eq!(events.len(), 21);
        for (index, event) in events.iter().take(20).enumerate() {
            assert_eq!(event.seq, index as u64);
            assert_eq!(text_of(event), Some(format!("line {index}").as_str()));
        }
        assert!(events[20].is_end());
    }

    #[test]
    fn replay_is_bounded_by_retention() {
        let relay = OutputRelay::new("s-2", 3);
        for index in 0..10 {
            relay.publish(line(&format!("line {index}")));
        }
        let mut subscription = relay.subscribe(true);
        let replayed: Vec<String> = std::iter::from_fn(|| subscription.try_recv())
            .filter_map(|event| text_of(&event).map(str::to_string))
            .collect();
        assert_eq!(replayed, vec!["line 7", "line 8", "line 9"]);
        assert_eq!(relay.tail_lines(2), vec!["line 8", "line 9"]);
    }

    #[test]
    fn subscriber_after_close_gets_history_and_end() {
        let relay = OutputRelay::new("s-3", 10);
        relay.publish(line("only"));
        assert!(!relay.is_closed());
        relay.close(end());
        assert!(relay.is_closed());
        assert!(relay.publish(line("late")).is_none());
        assert!(relay.close(end()).is_none());

        let events: Vec<OutputEvent> = relay.subscribe(true).collect();
        assert_eq!(events.len(), 2);
        assert_eq!(text_of(&events[0]), Some("only"));
        assert!(events[1].is_end());
        assert_eq!(relay.subscriber_count(), 0);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let relay = OutputRelay::new("s-4", 10);
        let kept = relay.subscribe(false);
        drop(relay.subscribe(false));
        relay.publish(line("one"));
        assert_eq!(relay.subscriber_count(), 1);
        drop(kept);
    }

    #[test]
    fn concurrent_writers_keep_a_single_total_order() {
        let relay = Arc::new(OutputRelay::new("s-5", 10_000));
        let first = relay.subscribe(false);
        let second = relay.subscribe(false);

        let writers: Vec<_> = (0..2)
            .map(|writer| {
                let relay = Arc::clone(&relay);
                std::thread::spawn(move || {
                    for index in 0..200 {
                        relay.publish(line(&format!("w{writer}-{index}")));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer");
        }
        relay.close(end());

        let a: Vec<OutputEvent> = first.collect();
        let b: Vec<OutputEvent> = second.collect();
        assert_eq!(a, b);
        assert!(a.windows(2).all(|pair| pair[0].seq < pair[1].seq));
        for writer in 0..2 {
            let prefix = format!("w{writer}-");
            let order: Vec<usize> = a
                .iter()
                .filter_map(text_of)
                .filter_map(|text| text.strip_prefix(&prefix))
                .filter_map(|index| index.parse().ok())
                .collect();
            assert_eq!(order, (0..200).collect::<Vec<_>>());
        }
    }
}
