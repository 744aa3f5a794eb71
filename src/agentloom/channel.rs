//! Channels: bidirectional conduits between two or more participants.
//!
//! A channel carries discrete [`Message`]s (enqueued straight into recipient
//! inboxes) and in-progress streams (fragments pushed to registered
//! [`StreamObserver`]s). Direct channels are unique per unordered
//! participant pair — [`direct_channel_id`] derives the same id regardless
//! of argument order — while meeting channels are named by the meeting
//! owner.
//!
//! # Observer filtering
//!
//! An observer may carry a `target_human_id`. The filtering rule:
//!
//! - no target → the observer sees every stream event on the channel;
//! - target `H` → the observer sees an event iff the stream's recipient is
//!   `H`, or the stream is a broadcast (no recipient).
//!
//! # Stream lifecycle
//!
//! ```text
//! (absent) --start_stream--> Open --stream_chunk*--> Open
//!                              |--complete_stream--> Completed
//!                              |--abort_stream-----> Aborted
//! ```
//!
//! `stream_chunk`, `complete_stream`, and `abort_stream` on anything but an
//! Open stream fail with [`ChannelError::BadStreamState`]. Completing a
//! stream also delivers the final assembled message into the inboxes of
//! recipients that did not watch the fragments (buffered humans, agents).

use crate::agentloom::agent::{Agent, AgentDirectory};
use crate::agentloom::event::{Event, EventBus, EventPayload};
use crate::agentloom::message::{AgentId, ChannelId, Message, Priority, StreamId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Abort reason used when a participant leaves with streams in flight.
pub const ABORT_PARTICIPANT_LEFT: &str = "participant_left";

/// Deterministic id for the direct channel between `a` and `b`:
/// a hash over the lexicographically sorted pair, so
/// `direct_channel_id(a, b) == direct_channel_id(b, a)`.
pub fn direct_channel_id(a: &AgentId, b: &AgentId) -> ChannelId {
    let (first, second) = if a.as_str() <= b.as_str() {
        (a, b)
    } else {
        (b, a)
    };
    let mut hasher = Sha256::new();
    hasher.update(first.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(second.as_str().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest[..12].iter().map(|b| format!("{:02x}", b)).collect();
    ChannelId::new(format!("dm-{}", hex))
}

/// One member of a channel: an AI agent or a human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Participant {
    Agent { id: AgentId, klass: String },
    Human { id: AgentId, klass: String },
}

impl Participant {
    pub fn from_agent(agent: &Agent) -> Self {
        if agent.is_human() {
            Participant::Human {
                id: agent.id.clone(),
                klass: agent.klass.clone(),
            }
        } else {
            Participant::Agent {
                id: agent.id.clone(),
                klass: agent.klass.clone(),
            }
        }
    }

    pub fn id(&self) -> &AgentId {
        match self {
            Participant::Agent { id, .. } | Participant::Human { id, .. } => id,
        }
    }

    pub fn klass(&self) -> &str {
        match self {
            Participant::Agent { klass, .. } | Participant::Human { klass, .. } => klass,
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Participant::Human { .. })
    }
}

/// Lifecycle state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Completed,
    Aborted,
}

/// Errors surfaced by channel stream operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// `start_stream` was called with an id already present on this channel.
    DuplicateStream(StreamId),
    /// The stream does not exist or is not in the Open state.
    BadStreamState(StreamId),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::DuplicateStream(id) => {
                write!(f, "stream {} already exists on this channel", id)
            }
            ChannelError::BadStreamState(id) => write!(f, "stream {} is not open", id),
        }
    }
}

impl Error for ChannelError {}

/// Notification that a stream was opened.
#[derive(Debug, Clone)]
pub struct StreamStartEvent {
    pub stream_id: StreamId,
    pub channel_id: ChannelId,
    pub sender_id: AgentId,
    pub recipient_id: Option<AgentId>,
}

/// One fragment of an open stream. `seq` starts at 0 and increases by one
/// per chunk of the same stream.
#[derive(Debug, Clone)]
pub struct StreamChunkEvent {
    pub stream_id: StreamId,
    pub channel_id: ChannelId,
    pub seq: u64,
    pub chunk: String,
    pub recipient_id: Option<AgentId>,
}

/// Notification that a stream completed; carries the assembled message.
#[derive(Debug, Clone)]
pub struct StreamCompleteEvent {
    pub stream_id: StreamId,
    pub channel_id: ChannelId,
    pub final_message: Message,
    pub recipient_id: Option<AgentId>,
}

/// Notification that a stream was aborted.
#[derive(Debug, Clone)]
pub struct StreamAbortEvent {
    pub stream_id: StreamId,
    pub channel_id: ChannelId,
    pub reason: String,
    pub recipient_id: Option<AgentId>,
}

/// Receives stream events on a channel, optionally filtered to the streams
/// that concern one human.
#[async_trait]
pub trait StreamObserver: Send + Sync {
    /// When set, this observer only sees streams whose recipient is this
    /// human (or broadcasts with no recipient).
    fn target_human_id(&self) -> Option<AgentId> {
        None
    }

    async fn on_stream_start(&self, _event: &StreamStartEvent) {}
    async fn on_stream_chunk(&self, _event: &StreamChunkEvent) {}
    async fn on_stream_complete(&self, _event: &StreamCompleteEvent) {}
    async fn on_stream_abort(&self, _event: &StreamAbortEvent) {}
}

struct StreamEntry {
    sender_id: AgentId,
    recipient_id: Option<AgentId>,
    state: StreamState,
    next_seq: u64,
    total_bytes: u64,
}

struct ChannelInner {
    participants: Vec<Participant>,
    observers: Vec<Arc<dyn StreamObserver>>,
    streams: HashMap<StreamId, StreamEntry>,
}

/// A conduit between two or more participants.
pub struct Channel {
    id: ChannelId,
    explicit_meeting: bool,
    created_at: DateTime<Utc>,
    directory: Arc<AgentDirectory>,
    bus: Arc<EventBus>,
    inner: Mutex<ChannelInner>,
}

impl Channel {
    pub fn new(
        id: ChannelId,
        participants: Vec<Participant>,
        directory: Arc<AgentDirectory>,
        bus: Arc<EventBus>,
        explicit_meeting: bool,
    ) -> Self {
        Channel {
            id,
            explicit_meeting,
            created_at: Utc::now(),
            directory,
            bus,
            inner: Mutex::new(ChannelInner {
                participants,
                observers: Vec::new(),
                streams: HashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner.lock().unwrap().participants.clone()
    }

    pub fn is_direct(&self) -> bool {
        !self.explicit_meeting && self.inner.lock().unwrap().participants.len() == 2
    }

    pub fn is_meeting(&self) -> bool {
        self.explicit_meeting || self.inner.lock().unwrap().participants.len() >= 3
    }

    pub fn add_participant(&self, participant: Participant) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.participants.iter().any(|p| p.id() == participant.id()) {
            inner.participants.push(participant);
        }
    }

    /// Remove a participant and abort every open stream they initiated or
    /// were the target of, with reason [`ABORT_PARTICIPANT_LEFT`].
    pub async fn remove_participant(&self, id: &AgentId) {
        let orphaned: Vec<StreamId> = {
            let mut inner = self.inner.lock().unwrap();
            inner.participants.retain(|p| p.id() != id);
            inner
                .streams
                .iter()
                .filter(|(_, entry)| {
                    entry.state == StreamState::Open
                        && (&entry.sender_id == id || entry.recipient_id.as_ref() == Some(id))
                })
                .map(|(stream_id, _)| stream_id.clone())
                .collect()
        };
        for stream_id in orphaned {
            let _ = self.abort_stream(&stream_id, ABORT_PARTICIPANT_LEFT).await;
        }
    }

    pub fn add_stream_observer(&self, observer: Arc<dyn StreamObserver>) {
        self.inner.lock().unwrap().observers.push(observer);
    }

    pub fn remove_stream_observer(&self, observer: &Arc<dyn StreamObserver>) {
        let mut inner = self.inner.lock().unwrap();
        inner.observers.retain(|o| !Arc::ptr_eq(o, observer));
    }

    fn should_notify(observer: &Arc<dyn StreamObserver>, recipient_id: Option<&AgentId>) -> bool {
        match observer.target_human_id() {
            None => true,
            Some(target) => match recipient_id {
                None => true,
                Some(recipient) => recipient == &target,
            },
        }
    }

    /// Observers eligible for an event with this recipient, snapshotted so
    /// callbacks may mutate the observer set.
    fn observers_for(&self, recipient_id: Option<&AgentId>) -> Vec<Arc<dyn StreamObserver>> {
        self.inner
            .lock()
            .unwrap()
            .observers
            .iter()
            .filter(|o| Self::should_notify(o, recipient_id))
            .cloned()
            .collect()
    }

    /// Enqueue `message` into one participant's inbox. Returns false when the
    /// participant has no live inbox (left the program, or inbox closed).
    pub fn deliver_to(&self, id: &AgentId, message: Message, priority: Priority) -> bool {
        match self.directory.inbox(id) {
            Some(inbox) => match inbox.put(message, priority) {
                Ok(()) => true,
                Err(err) => {
                    log::warn!("channel {}: dropping message for {}: {}", self.id, id, err);
                    false
                }
            },
            None => {
                log::warn!("channel {}: no inbox for participant {}", self.id, id);
                false
            }
        }
    }

    /// Enqueue `message` into every participant's inbox except the sender's.
    /// Returns the ids actually delivered to.
    pub fn broadcast(&self, message: &Message, priority: Priority) -> Vec<AgentId> {
        let participants = self.participants();
        let mut delivered = Vec::new();
        for participant in participants {
            if participant.id() == &message.sender_id {
                continue;
            }
            if self.deliver_to(participant.id(), message.clone(), priority) {
                delivered.push(participant.id().clone());
            }
        }
        delivered
    }

    /// Open a stream. The id is chosen by the sender and must be unique
    /// within this channel.
    pub async fn start_stream(
        &self,
        stream_id: StreamId,
        sender_id: AgentId,
        recipient_id: Option<AgentId>,
    ) -> Result<(), ChannelError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.streams.contains_key(&stream_id) {
                return Err(ChannelError::DuplicateStream(stream_id));
            }
            inner.streams.insert(
                stream_id.clone(),
                StreamEntry {
                    sender_id: sender_id.clone(),
                    recipient_id: recipient_id.clone(),
                    state: StreamState::Open,
                    next_seq: 0,
                    total_bytes: 0,
                },
            );
        }

        let event = StreamStartEvent {
            stream_id: stream_id.clone(),
            channel_id: self.id.clone(),
            sender_id: sender_id.clone(),
            recipient_id: recipient_id.clone(),
        };
        let observers = self.observers_for(recipient_id.as_ref());
        join_all(observers.iter().map(|o| o.on_stream_start(&event))).await;

        let _ = self
            .bus
            .publish(Event::agent(
                sender_id,
                EventPayload::StreamStarted {
                    stream_id,
                    channel_id: self.id.clone(),
                    sender_id: event.sender_id.clone(),
                    recipient_id,
                },
            ))
            .await;
        Ok(())
    }

    /// Push one fragment of an open stream; returns the fragment's `seq`.
    pub async fn stream_chunk(
        &self,
        stream_id: &StreamId,
        chunk: impl Into<String>,
    ) -> Result<u64, ChannelError> {
        let chunk = chunk.into();
        let (seq, sender_id, recipient_id) = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .streams
                .get_mut(stream_id)
                .filter(|e| e.state == StreamState::Open)
                .ok_or_else(|| ChannelError::BadStreamState(stream_id.clone()))?;
            let seq = entry.next_seq;
            entry.next_seq += 1;
            entry.total_bytes += chunk.len() as u64;
            (seq, entry.sender_id.clone(), entry.recipient_id.clone())
        };

        let event = StreamChunkEvent {
            stream_id: stream_id.clone(),
            channel_id: self.id.clone(),
            seq,
            chunk: chunk.clone(),
            recipient_id: recipient_id.clone(),
        };
        let observers = self.observers_for(recipient_id.as_ref());
        join_all(observers.iter().map(|o| o.on_stream_chunk(&event))).await;

        let _ = self
            .bus
            .publish(Event::agent(
                sender_id,
                EventPayload::StreamChunked {
                    stream_id: stream_id.clone(),
                    seq,
                    chunk,
                    recipient_id,
                },
            ))
            .await;
        Ok(seq)
    }

    /// Complete an open stream. `final_message` goes to observers and is
    /// also enqueued for the recipients that did not watch the fragments:
    /// agents, and humans without streaming enabled.
    pub async fn complete_stream(
        &self,
        stream_id: &StreamId,
        final_message: Message,
    ) -> Result<(), ChannelError> {
        let (sender_id, recipient_id) = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .streams
                .get_mut(stream_id)
                .filter(|e| e.state == StreamState::Open)
                .ok_or_else(|| ChannelError::BadStreamState(stream_id.clone()))?;
            entry.state = StreamState::Completed;
            (entry.sender_id.clone(), entry.recipient_id.clone())
        };

        let event = StreamCompleteEvent {
            stream_id: stream_id.clone(),
            channel_id: self.id.clone(),
            final_message: final_message.clone(),
            recipient_id: recipient_id.clone(),
        };
        let observers = self.observers_for(recipient_id.as_ref());
        join_all(observers.iter().map(|o| o.on_stream_complete(&event))).await;

        // Buffered recipients get the assembled message as their only copy.
        match &recipient_id {
            Some(recipient) => {
                if !self.watched_fragments(recipient) {
                    self.deliver_to(recipient, final_message.clone(), Priority::Normal);
                }
            }
            None => {
                for participant in self.participants() {
                    if participant.id() == &sender_id {
                        continue;
                    }
                    if !self.watched_fragments(participant.id()) {
                        self.deliver_to(participant.id(), final_message.clone(), Priority::Normal);
                    }
                }
            }
        }

        let _ = self
            .bus
            .publish(Event::agent(
                sender_id,
                EventPayload::StreamCompleted {
                    stream_id: stream_id.clone(),
                    final_message,
                    recipient_id,
                },
            ))
            .await;
        Ok(())
    }

    /// Whether this participant already saw the fragments (streaming human).
    fn watched_fragments(&self, id: &AgentId) -> bool {
        self.directory
            .get(id)
            .map(|agent| agent.is_human() && agent.delivery.streaming())
            .unwrap_or(false)
    }

    /// Abort an open stream with a reason.
    pub async fn abort_stream(
        &self,
        stream_id: &StreamId,
        reason: impl Into<String>,
    ) -> Result<(), ChannelError> {
        let recipient_id = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .streams
                .get_mut(stream_id)
                .filter(|e| e.state == StreamState::Open)
                .ok_or_else(|| ChannelError::BadStreamState(stream_id.clone()))?;
            entry.state = StreamState::Aborted;
            entry.recipient_id.clone()
        };

        let event = StreamAbortEvent {
            stream_id: stream_id.clone(),
            channel_id: self.id.clone(),
            reason: reason.into(),
            recipient_id: recipient_id.clone(),
        };
        let observers = self.observers_for(recipient_id.as_ref());
        join_all(observers.iter().map(|o| o.on_stream_abort(&event))).await;
        Ok(())
    }

    pub fn stream_state(&self, stream_id: &StreamId) -> Option<StreamState> {
        self.inner
            .lock()
            .unwrap()
            .streams
            .get(stream_id)
            .map(|e| e.state)
    }

    pub fn stream_total_bytes(&self, stream_id: &StreamId) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .streams
            .get(stream_id)
            .map(|e| e.total_bytes)
    }
}
