//! Sequenced event stream with checkpoint and replay for late subscribers.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use proto::{Checkpoint, LoopState, Message, SequencedEvent, StreamEvent};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Broadcast buffer size per conversation.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

struct Log {
    next_seq: u64,
    /// Last sequence number of the previous turn; `events` starts after it.
    turn_start: u64,
    events: Vec<SequencedEvent>,
    checkpoint: Checkpoint,
}

struct Inner {
    tx: broadcast::Sender<SequencedEvent>,
    log: Mutex<Log>,
}

/// Publishes conversation events to any number of subscribers.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct StreamPublisher {
    inner: Arc<Inner>,
}

impl StreamPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                tx,
                log: Mutex::new(Log {
                    next_seq: 1,
                    turn_start: 0,
                    events: Vec::new(),
                    checkpoint: Checkpoint::default(),
                }),
            }),
        }
    }

    /// Starts a new turn: the retained log is dropped and a checkpoint taken.
    pub fn begin_turn(&self, messages: Vec<Message>, state: LoopState) {
        let mut log = self.inner.log.lock();
        log.events.clear();
        log.turn_start = log.next_seq - 1;
        log.checkpoint = Checkpoint {
            seq: log.next_seq - 1,
            state,
            messages,
        };
    }

    /// Records the conversation as of the last published event.
    pub fn checkpoint(&self, messages: Vec<Message>, state: LoopState) {
        let mut log = self.inner.log.lock();
        log.checkpoint = Checkpoint {
            seq: log.next_seq - 1,
            state,
            messages,
        };
    }

    /// Appends an event and returns its sequence number. Never blocks.
    pub fn publish(&self, event: StreamEvent) -> u64 {
        let mut log = self.inner.log.lock();
        let seq = log.next_seq;
        log.next_seq += 1;
        let sequenced = SequencedEvent { seq, event };
        log.events.push(sequenced.clone());
        // No receivers is fine: the log still holds the event.
        let _ = self.inner.tx.send(sequenced);
        seq
    }

    /// Events retained for the current turn.
    pub fn events(&self) -> Vec<SequencedEvent> {
        self.inner.log.lock().events.clone()
    }

    /// Latest checkpoint.
    pub fn current_checkpoint(&self) -> Checkpoint {
        self.inner.log.lock().checkpoint.clone()
    }

    /// Returns the latest checkpoint and a subscription that yields every
    /// event after it, then live events.
    pub fn attach(&self) -> (Checkpoint, EventSubscription) {
        let log = self.inner.log.lock();
        let checkpoint = log.checkpoint.clone();
        let backlog: VecDeque<SequencedEvent> = log
            .events
            .iter()
            .filter(|e| e.seq > checkpoint.seq)
            .cloned()
            .collect();
        // Subscribing under the lock leaves no gap between backlog and live events.
        let rx = self.inner.tx.subscribe();
        debug!(seq = checkpoint.seq, backlog = backlog.len(), "Subscriber attached");
        let subscription = EventSubscription {
            backlog,
            rx,
            last_seq: checkpoint.seq,
            inner: Arc::downgrade(&self.inner),
        };
        (checkpoint, subscription)
    }
}

impl Default for StreamPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// What a subscription yields next.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The next event in sequence.
    Event(SequencedEvent),
    /// Events were lost (the subscriber fell behind a turn boundary).
    /// The conversation restarts from this checkpoint; the events after it follow.
    Resync(Checkpoint),
}

/// Ordered view of a [`StreamPublisher`]: every event exactly once, or an
/// explicit [`Delivery::Resync`] where events could not be replayed.
pub struct EventSubscription {
    backlog: VecDeque<SequencedEvent>,
    rx: broadcast::Receiver<SequencedEvent>,
    last_seq: u64,
    inner: Weak<Inner>,
}

impl EventSubscription {
    /// Next delivery in sequence order, or `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if event.seq > self.last_seq {
                    self.last_seq = event.seq;
                    return Some(Delivery::Event(event));
                }
                continue;
            }
            match self.rx.recv().await {
                Ok(event) => {
                    if event.seq > self.last_seq {
                        self.last_seq = event.seq;
                        return Some(Delivery::Event(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let inner = self.inner.upgrade()?;
                    let log = inner.log.lock();
                    if self.last_seq < log.turn_start {
                        // The missed events belonged to a turn the log no longer holds.
                        warn!(
                            skipped,
                            last_seq = self.last_seq,
                            turn_start = log.turn_start,
                            "Subscriber lagged past a turn, resyncing from checkpoint"
                        );
                        let checkpoint = log.checkpoint.clone();
                        self.backlog = log
                            .events
                            .iter()
                            .filter(|e| e.seq > checkpoint.seq)
                            .cloned()
                            .collect();
                        self.last_seq = checkpoint.seq;
                        return Some(Delivery::Resync(checkpoint));
                    }
                    warn!(skipped, last_seq = self.last_seq, "Subscriber lagged, resyncing from log");
                    self.backlog = log
                        .events
                        .iter()
                        .filter(|e| e.seq > self.last_seq)
                        .cloned()
                        .collect();
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event, skipping over resyncs.
    pub async fn recv_event(&mut self) -> Option<SequencedEvent> {
        loop {
            if let Delivery::Event(event) = self.recv().await? {
                return Some(event);
            }
        }
    }

    /// Sequence number of the last event handed out.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }
}
