//! Per-agent message inbox.
//!
//! Each agent owns exactly one [`AgentInbox`]: an ordered queue with a
//! sidecar high-priority lane, predicate-filtered retrieval, batch
//! retrieval with a minimum-count/timeout contract, and close semantics
//! that let a runtime drain cleanly at shutdown.
//!
//! Retrieval is exactly-once: a message handed to one `get` call is never
//! seen by another. Single-message waiters are woken in arrival order, and
//! a waiter that is cancelled (its future dropped) or that times out never
//! consumes a message — anything that raced into its hand-off slot is put
//! back at the front of the queue.
//!
//! Predicates run under the inbox lock; they must be pure and cheap.

use crate::agentloom::message::{AgentId, Message, Priority};
use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};

/// Shared, clonable message predicate used to filter retrieval.
pub type MessagePredicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Errors surfaced by inbox operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxError {
    /// `put` was called after `close`.
    Closed,
    /// The inbox is closed and holds no (matching) message.
    ClosedAndEmpty,
    /// The retrieval deadline elapsed with no matching message.
    Timeout,
}

impl fmt::Display for InboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboxError::Closed => write!(f, "inbox is closed"),
            InboxError::ClosedAndEmpty => write!(f, "inbox is closed and empty"),
            InboxError::Timeout => write!(f, "timed out waiting for a message"),
        }
    }
}

impl Error for InboxError {}

/// Point-in-time counters for observability.
#[derive(Debug, Clone)]
pub struct InboxStats {
    pub size: usize,
    pub total_put: u64,
    pub total_got: u64,
    pub uptime: Duration,
}

struct Waiter {
    id: u64,
    predicate: Option<MessagePredicate>,
    tx: oneshot::Sender<Message>,
}

struct InboxInner {
    high: VecDeque<Message>,
    normal: VecDeque<Message>,
    waiters: VecDeque<Waiter>,
    closed: bool,
    next_waiter_id: u64,
    total_put: u64,
    total_got: u64,
}

impl InboxInner {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    fn matches(predicate: Option<&MessagePredicate>, msg: &Message) -> bool {
        match predicate {
            Some(p) => p(msg),
            None => true,
        }
    }

    /// Remove and return the first matching message, high lane first,
    /// preserving the relative order of everything else.
    fn take_first(&mut self, predicate: Option<&MessagePredicate>) -> Option<Message> {
        if let Some(pos) = self
            .high
            .iter()
            .position(|m| Self::matches(predicate, m))
        {
            return self.high.remove(pos);
        }
        if let Some(pos) = self
            .normal
            .iter()
            .position(|m| Self::matches(predicate, m))
        {
            return self.normal.remove(pos);
        }
        None
    }

    fn count_matching(&self, predicate: Option<&MessagePredicate>) -> usize {
        self.high
            .iter()
            .chain(self.normal.iter())
            .filter(|m| Self::matches(predicate, m))
            .count()
    }

    fn extract_matching(
        &mut self,
        predicate: Option<&MessagePredicate>,
        max: usize,
    ) -> Vec<Message> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.take_first(predicate) {
                Some(msg) => batch.push(msg),
                None => break,
            }
        }
        self.total_got += batch.len() as u64;
        batch
    }
}

/// Ordered, optionally bounded queue of messages for one agent.
pub struct AgentInbox {
    owner: AgentId,
    capacity: Option<usize>,
    inner: Mutex<InboxInner>,
    seq: watch::Sender<u64>,
    started_at: Instant,
}

impl AgentInbox {
    /// Unbounded inbox for `owner`.
    pub fn new(owner: AgentId) -> Self {
        Self::with_capacity(owner, None)
    }

    /// Inbox capped at `capacity` messages; the oldest normal-priority
    /// message is dropped on overflow.
    pub fn with_capacity(owner: AgentId, capacity: Option<usize>) -> Self {
        let (seq, _) = watch::channel(0u64);
        AgentInbox {
            owner,
            capacity,
            inner: Mutex::new(InboxInner {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
                next_waiter_id: 0,
                total_put: 0,
                total_got: 0,
            }),
            seq,
            started_at: Instant::now(),
        }
    }

    pub fn owner(&self) -> &AgentId {
        &self.owner
    }

    fn bump(&self) {
        self.seq.send_modify(|v| *v += 1);
    }

    /// Enqueue `message`. High priority goes to the front lane, which `get`
    /// consumes before anything normal.
    pub fn put(&self, message: Message, priority: Priority) -> Result<(), InboxError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(InboxError::Closed);
        }
        inner.total_put += 1;

        // Hand the message straight to the first live waiter that wants it.
        let mut msg = message;
        let mut idx = 0;
        while idx < inner.waiters.len() {
            if !InboxInner::matches(inner.waiters[idx].predicate.as_ref(), &msg) {
                idx += 1;
                continue;
            }
            let waiter = inner.waiters.remove(idx).expect("index checked");
            match waiter.tx.send(msg) {
                Ok(()) => {
                    inner.total_got += 1;
                    drop(inner);
                    self.bump();
                    return Ok(());
                }
                // Waiter already gone; reclaim the message and keep looking.
                Err(back) => msg = back,
            }
        }

        match priority {
            Priority::High => inner.high.push_back(msg),
            Priority::Normal => inner.normal.push_back(msg),
        }
        if let Some(cap) = self.capacity {
            while inner.len() > cap {
                if inner.normal.pop_front().is_none() {
                    inner.high.pop_front();
                }
            }
        }
        drop(inner);
        self.bump();
        Ok(())
    }

    /// Retrieve the first message satisfying `predicate` (or the oldest when
    /// none is given), waiting up to `timeout` (forever when `None`).
    pub async fn get(
        &self,
        predicate: Option<MessagePredicate>,
        timeout: Option<Duration>,
    ) -> Result<Message, InboxError> {
        let (id, rx) = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(msg) = inner.take_first(predicate.as_ref()) {
                inner.total_got += 1;
                return Ok(msg);
            }
            if inner.closed {
                return Err(InboxError::ClosedAndEmpty);
            }
            let (tx, rx) = oneshot::channel();
            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            inner.waiters.push_back(Waiter {
                id,
                predicate: predicate.clone(),
                tx,
            });
            (id, rx)
        };

        let mut guard = WaiterGuard {
            inbox: self,
            id,
            rx: Some(rx),
            done: false,
        };

        let outcome = {
            let rx = guard.rx.as_mut().expect("rx held");
            match timeout {
                Some(dur) => match tokio::time::timeout(dur, rx).await {
                    Ok(res) => Some(res),
                    Err(_) => None,
                },
                None => Some(rx.await),
            }
        };

        match outcome {
            Some(Ok(msg)) => {
                guard.done = true;
                Ok(msg)
            }
            // Our sender was dropped by close().
            Some(Err(_)) => {
                guard.done = true;
                Err(InboxError::ClosedAndEmpty)
            }
            // Deadline elapsed: deregister, keeping a message that raced in.
            None => match guard.settle_after_deadline() {
                Some(msg) => Ok(msg),
                None => Err(InboxError::Timeout),
            },
        }
    }

    /// Wait until at least `min` matching messages are available or
    /// `timeout` elapses, then return up to `max` matching messages in FIFO
    /// order (high lane first). An empty vec means the deadline passed with
    /// nothing matching.
    pub async fn get_batch(
        &self,
        predicate: Option<MessagePredicate>,
        max: usize,
        min: usize,
        timeout: Duration,
    ) -> Result<Vec<Message>, InboxError> {
        let min = min.max(1);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut seq = self.seq.subscribe();

        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                let matching = inner.count_matching(predicate.as_ref());
                if inner.closed {
                    if matching == 0 {
                        return Err(InboxError::ClosedAndEmpty);
                    }
                    return Ok(inner.extract_matching(predicate.as_ref(), max));
                }
                if matching >= min {
                    return Ok(inner.extract_matching(predicate.as_ref(), max));
                }
            }

            match tokio::time::timeout_at(deadline, seq.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    // Sequence sender gone (inbox dropped); nothing more will
                    // arrive, so just run out the clock.
                    tokio::time::sleep_until(deadline).await;
                    let mut inner = self.inner.lock().unwrap();
                    return Ok(inner.extract_matching(predicate.as_ref(), max));
                }
                Err(_) => {
                    let mut inner = self.inner.lock().unwrap();
                    return Ok(inner.extract_matching(predicate.as_ref(), max));
                }
            }
        }
    }

    /// Non-destructive look at the first matching message.
    pub fn peek(&self, predicate: Option<MessagePredicate>) -> Option<Message> {
        let inner = self.inner.lock().unwrap();
        inner
            .high
            .iter()
            .chain(inner.normal.iter())
            .find(|m| InboxInner::matches(predicate.as_ref(), m))
            .cloned()
    }

    /// Drop every matching message; returns how many were removed.
    pub fn remove(&self, predicate: MessagePredicate) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.len();
        inner.high.retain(|m| !predicate(m));
        inner.normal.retain(|m| !predicate(m));
        let removed = before - inner.len();
        drop(inner);
        if removed > 0 {
            self.bump();
        }
        removed
    }

    /// Remove and return every matching message without waiting. Used by the
    /// progressive-timeout path to sweep interrupts out of the queue.
    pub fn drain_matching(&self, predicate: Option<MessagePredicate>) -> Vec<Message> {
        let mut inner = self.inner.lock().unwrap();
        inner.extract_matching(predicate.as_ref(), usize::MAX)
    }

    /// Drop everything; returns how many messages were discarded.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let cleared = inner.len();
        inner.high.clear();
        inner.normal.clear();
        drop(inner);
        if cleared > 0 {
            self.bump();
        }
        cleared
    }

    /// Reject further `put`s and wake pending waiters with
    /// [`InboxError::ClosedAndEmpty`]. Messages already queued remain
    /// retrievable.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.waiters.clear();
        drop(inner);
        self.bump();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> InboxStats {
        let inner = self.inner.lock().unwrap();
        InboxStats {
            size: inner.len(),
            total_put: inner.total_put,
            total_got: inner.total_got,
            uptime: self.started_at.elapsed(),
        }
    }
}

/// Keeps a registered waiter honest: on cancellation or timeout the waiter
/// is deregistered, and a message that raced into its hand-off slot is
/// requeued at the front rather than lost.
struct WaiterGuard<'a> {
    inbox: &'a AgentInbox,
    id: u64,
    rx: Option<oneshot::Receiver<Message>>,
    done: bool,
}

impl<'a> WaiterGuard<'a> {
    /// Deregister after a timeout. Returns a message only if `put` had
    /// already committed one to this waiter.
    fn settle_after_deadline(&mut self) -> Option<Message> {
        self.done = true;
        let mut inner = self.inbox.inner.lock().unwrap();
        if let Some(pos) = inner.waiters.iter().position(|w| w.id == self.id) {
            inner.waiters.remove(pos);
            return None;
        }
        // Waiter already consumed by put(): the message is in the channel.
        self.rx
            .take()
            .and_then(|mut rx| rx.try_recv().ok())
    }
}

impl<'a> Drop for WaiterGuard<'a> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut inner = self.inbox.inner.lock().unwrap();
        if let Some(pos) = inner.waiters.iter().position(|w| w.id == self.id) {
            inner.waiters.remove(pos);
            return;
        }
        if let Some(mut rx) = self.rx.take() {
            if let Ok(msg) = rx.try_recv() {
                // Undo the hand-off: the cancelled waiter must not consume it.
                inner.total_got -= 1;
                match msg.priority {
                    Priority::High => inner.high.push_front(msg),
                    Priority::Normal => inner.normal.push_front(msg),
                }
                drop(inner);
                self.inbox.bump();
            }
        }
    }
}
