use std::collections::VecDeque;

use log::{debug, error, warn};
use tokio::sync::broadcast;

use crate::messages::{ChannelEvent, InboundEvent};

/// Ordered log of accepted inbound events. The backend session can outlive
/// any reasonable in-memory history, so retention is an explicit ring buffer
/// rather than append-forever.
pub struct MessageLog {
    entries: VecDeque<InboundEvent>,
    capacity: usize,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        MessageLog {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: InboundEvent) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InboundEvent> {
        self.entries.iter()
    }
}

/// Turns raw frames into `InboundEvent`s and filters immediately consecutive
/// duplicates. The dedup memory is a single slot: only a frame identical to
/// the most recently accepted one is dropped. A repeat separated by any other
/// accepted message passes through. That narrow guarantee is intentional.
pub struct Classifier {
    log: MessageLog,
    last_accepted: Option<String>,
}

impl Classifier {
    pub fn new(log_capacity: usize) -> Self {
        Classifier {
            log: MessageLog::new(log_capacity),
            last_accepted: None,
        }
    }

    /// Decode one raw frame. Returns the event if it was accepted and
    /// appended to the log, `None` if it was malformed or a duplicate.
    pub fn classify(&mut self, raw: &str) -> Option<InboundEvent> {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(err) => {
                debug!("Discarding non-JSON frame: {:?}", err);
                return None;
            }
        };

        let topic = match value.get("topic").and_then(|t| t.as_str()) {
            Some(t) => t.to_string(),
            None => {
                warn!("Discarding frame without topic: {}", raw);
                return None;
            }
        };
        // Presence of the key is what counts; 0, false and null are all
        // valid payloads.
        let payload = match value.get("payload") {
            Some(p) => p.clone(),
            None => {
                warn!("Discarding frame without payload: {}", raw);
                return None;
            }
        };

        let event = InboundEvent { topic, payload };
        let canonical = serde_json::to_string(&event).ok()?;
        if self.last_accepted.as_deref() == Some(canonical.as_str()) {
            debug!("Discarding duplicate frame on topic {}", event.topic);
            return None;
        }

        self.last_accepted = Some(canonical);
        self.log.push(event.clone());
        Some(event)
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    /// Bridge the channel manager's raw frames to classified events until the
    /// channel broadcast is dropped.
    pub async fn run(
        mut self,
        mut channel_rx: broadcast::Receiver<ChannelEvent>,
        tx: broadcast::Sender<InboundEvent>,
    ) {
        loop {
            match channel_rx.recv().await {
                Ok(ChannelEvent::Frame(raw)) => {
                    if let Some(event) = self.classify(&raw) {
                        debug!("Accepted event on topic {}", event.topic);
                        if tx.send(event).is_err() {
                            debug!("No subscribers for classified events");
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    error!("Classifier lagged, {} frames dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Channel broadcast closed, classifier exiting");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(topic: &str, payload: &str) -> String {
        format!(r#"{{"topic":"{topic}","payload":{payload}}}"#)
    }

    #[test]
    fn test_consecutive_duplicates_collapse() {
        let mut classifier = Classifier::new(16);
        let raw = frame("sonoff/relay-01/will", r#""hi!""#);

        assert!(classifier.classify(&raw).is_some());
        assert!(classifier.classify(&raw).is_none());
        assert_eq!(classifier.log().len(), 1);

        // A different frame resets the one-slot memory.
        let other = frame("sonoff/relay-02/will", r#""hi!""#);
        assert!(classifier.classify(&other).is_some());
        assert!(classifier.classify(&raw).is_some());
        assert_eq!(classifier.log().len(), 3);
    }

    #[test]
    fn test_malformed_frames_discarded() {
        let mut classifier = Classifier::new(16);

        assert!(classifier.classify("not json at all").is_none());
        assert!(classifier.classify(r#"{"payload":"hi!"}"#).is_none());
        assert!(classifier.classify(r#"{"topic":"a/b/c"}"#).is_none());
        assert_eq!(classifier.log().len(), 0);
    }

    #[test]
    fn test_falsy_payloads_accepted() {
        let mut classifier = Classifier::new(16);

        let zero = classifier.classify(&frame("a/b/c", "0")).unwrap();
        assert_eq!(zero.payload, serde_json::json!(0));
        assert!(classifier.classify(&frame("a/b/c", "false")).is_some());
        assert!(classifier.classify(&frame("a/b/c", "null")).is_some());
        assert_eq!(classifier.log().len(), 3);
    }

    #[test]
    fn test_log_capacity_evicts_oldest() {
        let mut classifier = Classifier::new(2);

        classifier.classify(&frame("t/1/will", r#""a""#));
        classifier.classify(&frame("t/2/will", r#""b""#));
        classifier.classify(&frame("t/3/will", r#""c""#));

        assert_eq!(classifier.log().len(), 2);
        let topics: Vec<_> = classifier.log().iter().map(|e| e.topic.as_str()).collect();
        assert_eq!(topics, vec!["t/2/will", "t/3/will"]);
    }
}
