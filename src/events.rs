use chrono::{DateTime, Utc};
use log::info;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::server::Phase;

pub const DEFAULT_SINK_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct RelayEvent {
    pub at: DateTime<Utc>,
    pub session: String,
    pub detail: String,
}

struct Queue {
    events: VecDeque<RelayEvent>,
    capacity: usize,
    dropped: u64,
}

/// Bounded multi-producer event queue. Producers drop the oldest entry on
/// overflow and the drop count is reported by the single consumer.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<Mutex<Queue>>,
}

impl EventSink {
    pub fn new(capacity: usize) -> EventSink {
        EventSink {
            inner: Arc::new(Mutex::new(Queue {
                events: VecDeque::with_capacity(capacity),
                capacity,
                dropped: 0,
            })),
        }
    }

    pub fn push(&self, session: &str, detail: String) {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if queue.events.len() == queue.capacity {
            queue.events.pop_front();
            queue.dropped += 1;
        }
        queue.events.push_back(RelayEvent {
            at: Utc::now(),
            session: session.to_string(),
            detail,
        });
    }

    /// Take everything queued plus the drop count accumulated since the
    /// last drain.
    pub fn drain(&self) -> (Vec<RelayEvent>, u64) {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let events = queue.events.drain(..).collect();
        let dropped = queue.dropped;
        queue.dropped = 0;
        (events, dropped)
    }
}

/// Single consumer: periodically drain the sink into the log until the
/// server leaves the running phase.
pub async fn run_drain(sink: EventSink, mut phase: watch::Receiver<Phase>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                drain_once(&sink);
            }
            result = phase.changed() => {
                if result.is_err() || *phase.borrow() == Phase::Closing {
                    break;
                }
            }
        }
    }

    drain_once(&sink);
}

fn drain_once(sink: &EventSink) {
    let (events, dropped) = sink.drain();
    for event in &events {
        info!(
            "session {} @ {}: {}",
            event.session,
            event.at.format("%H:%M:%S%.3f"),
            event.detail
        );
    }
    if dropped > 0 {
        info!("event sink overflowed, dropped {} events", dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_oldest_on_overflow() {
        let sink = EventSink::new(2);
        sink.push("s1", "first".to_string());
        sink.push("s1", "second".to_string());
        sink.push("s1", "third".to_string());

        let (events, dropped) = sink.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].detail, "second");
        assert_eq!(events[1].detail, "third");
        assert_eq!(dropped, 1);

        // drop counter resets after a drain
        let (_, dropped) = sink.drain();
        assert_eq!(dropped, 0);
    }

    #[test]
    fn test_multi_producer_push() {
        let sink = EventSink::new(64);
        let mut handles = Vec::new();
        for producer in 0..4 {
            let sink = sink.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..8 {
                    sink.push("shared", format!("p{} e{}", producer, i));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let (events, dropped) = sink.drain();
        assert_eq!(events.len(), 32);
        assert_eq!(dropped, 0);
    }
}
