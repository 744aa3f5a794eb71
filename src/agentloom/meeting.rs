//! Meetings: N-participant channels with lifecycle and rolling batch
//! delivery.
//!
//! A meeting wraps a channel with owner/attendee roles and a state machine
//! (Forming → Active → Ended). Broadcasts do not hit recipient inboxes one
//! by one; they pass through a [`RollingCollector`] that coalesces bursts
//! into a single delivery:
//!
//! - every message (re)arms a *rolling* timer — while messages keep coming
//!   faster than `rolling_timeout`, the batch keeps growing;
//! - the *max-batch* timer arms on the first message of a batch and never
//!   resets, bounding how long a busy meeting can starve its recipients;
//! - whichever timer fires first flushes the whole buffer through the
//!   meeting's delivery sink, and the next message starts a fresh batch.
//!
//! Delivery applies each human attendee's
//! [`MeetingNotifications`](crate::agentloom::agent::MeetingNotifications)
//! preference; `Targeted` humans only see broadcasts that name them or list
//! them in `target_agent_ids`.

use crate::agentloom::agent::{AgentDirectory, MeetingNotifications};
use crate::agentloom::channel::{Channel, Participant};
use crate::agentloom::message::{AgentId, Message, MeetingId, Priority};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle of a meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingState {
    /// Created, waiting for a second attendee to join.
    Forming,
    /// At least two attendees joined; broadcasts flow.
    Active,
    /// Over. No further broadcasts are accepted.
    Ended,
}

/// Errors surfaced by meeting operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeetingError {
    /// Broadcast or join attempted on an ended meeting.
    Ended(MeetingId),
    /// Someone other than the owner tried to end the meeting.
    NotOwner {
        meeting_id: MeetingId,
        agent_id: AgentId,
    },
    /// A join from an agent that was never invited.
    NotInvited {
        meeting_id: MeetingId,
        agent_id: AgentId,
    },
}

impl fmt::Display for MeetingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeetingError::Ended(id) => write!(f, "meeting {} has ended", id),
            MeetingError::NotOwner {
                meeting_id,
                agent_id,
            } => write!(
                f,
                "agent {} is not the owner of meeting {}",
                agent_id, meeting_id
            ),
            MeetingError::NotInvited {
                meeting_id,
                agent_id,
            } => write!(
                f,
                "agent {} was not invited to meeting {}",
                agent_id, meeting_id
            ),
        }
    }
}

impl Error for MeetingError {}

/// Receives a flushed batch of coalesced messages.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn deliver(&self, batch: Vec<Message>);
}

struct CollectorInner {
    buffer: Vec<Message>,
    last_at: Instant,
    batch_start: Instant,
    flusher_running: bool,
    /// Bumped on manual flush so a sleeping flusher task knows to stand down.
    epoch: u64,
}

/// Coalesces bursts of messages into single batched deliveries.
pub struct RollingCollector {
    rolling_timeout: Duration,
    max_batch_wait: Duration,
    sink: Arc<dyn BatchSink>,
    inner: Arc<Mutex<CollectorInner>>,
}

impl RollingCollector {
    pub fn new(
        rolling_timeout: Duration,
        max_batch_wait: Duration,
        sink: Arc<dyn BatchSink>,
    ) -> Self {
        let now = Instant::now();
        RollingCollector {
            rolling_timeout,
            max_batch_wait,
            sink,
            inner: Arc::new(Mutex::new(CollectorInner {
                buffer: Vec::new(),
                last_at: now,
                batch_start: now,
                flusher_running: false,
                epoch: 0,
            })),
        }
    }

    /// Buffer `message` and (re)arm the timers. The first message of a batch
    /// spawns the flusher task; later messages just push the rolling
    /// deadline out.
    pub fn add_message(&self, message: Message) {
        let spawn_epoch = {
            let mut inner = self.inner.lock().unwrap();
            let now = Instant::now();
            inner.buffer.push(message);
            inner.last_at = now;
            if inner.flusher_running {
                None
            } else {
                inner.batch_start = now;
                inner.flusher_running = true;
                Some(inner.epoch)
            }
        };

        if let Some(epoch) = spawn_epoch {
            let inner = Arc::clone(&self.inner);
            let sink = Arc::clone(&self.sink);
            let rolling = self.rolling_timeout;
            let max_wait = self.max_batch_wait;
            tokio::spawn(async move {
                loop {
                    let deadline = {
                        let inner = inner.lock().unwrap();
                        if inner.epoch != epoch {
                            return;
                        }
                        std::cmp::min(inner.last_at + rolling, inner.batch_start + max_wait)
                    };
                    tokio::time::sleep_until(deadline).await;

                    let batch = {
                        let mut inner = inner.lock().unwrap();
                        if inner.epoch != epoch {
                            return;
                        }
                        let now = Instant::now();
                        let rolling_expired = now >= inner.last_at + rolling;
                        let max_reached = now >= inner.batch_start + max_wait;
                        if rolling_expired || max_reached {
                            inner.flusher_running = false;
                            Some(std::mem::take(&mut inner.buffer))
                        } else {
                            None
                        }
                    };

                    if let Some(batch) = batch {
                        if !batch.is_empty() {
                            sink.deliver(batch).await;
                        }
                        return;
                    }
                }
            });
        }
    }

    /// Deliver anything buffered right now, bypassing the timers.
    pub async fn flush(&self) {
        let batch = {
            let mut inner = self.inner.lock().unwrap();
            inner.epoch += 1;
            inner.flusher_running = false;
            std::mem::take(&mut inner.buffer)
        };
        if !batch.is_empty() {
            self.sink.deliver(batch).await;
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().buffer.len()
    }
}

struct MeetingInner {
    state: MeetingState,
    invited: HashSet<AgentId>,
    joined: HashSet<AgentId>,
    ended_at: Option<DateTime<Utc>>,
}

/// Delivery sink fanning a flushed batch out to the joined attendees,
/// applying human notification preferences.
struct AttendeeSink {
    directory: Arc<AgentDirectory>,
    meeting: Arc<Mutex<MeetingInner>>,
    deliver_final_to_muted: bool,
}

impl AttendeeSink {
    fn wants(&self, attendee: &AgentId, message: &Message) -> bool {
        let agent = match self.directory.get(attendee) {
            Some(agent) => agent,
            None => return false,
        };
        if !agent.is_human() {
            return true;
        }
        match agent.delivery.meeting_notifications {
            MeetingNotifications::All => true,
            MeetingNotifications::Targeted => {
                message.target_agent_ids.contains(attendee)
                    || message.content.contains(attendee.as_str())
                    || message.content.contains(&agent.klass)
            }
            MeetingNotifications::None => self.deliver_final_to_muted,
        }
    }
}

#[async_trait]
impl BatchSink for AttendeeSink {
    async fn deliver(&self, batch: Vec<Message>) {
        let joined: Vec<AgentId> = {
            let inner = self.meeting.lock().unwrap();
            inner.joined.iter().cloned().collect()
        };
        for message in batch {
            for attendee in &joined {
                if attendee == &message.sender_id {
                    continue;
                }
                if !self.wants(attendee, &message) {
                    continue;
                }
                if let Some(inbox) = self.directory.inbox(attendee) {
                    if let Err(err) = inbox.put(message.clone(), Priority::Normal) {
                        log::warn!(
                            "meeting batch delivery to {} failed: {}",
                            attendee,
                            err
                        );
                    }
                }
            }
        }
    }
}

/// An N-participant conversation with owner, attendee state, and rolling
/// batch delivery.
pub struct Meeting {
    id: MeetingId,
    owner_id: AgentId,
    owner_klass: String,
    channel: Arc<Channel>,
    collector: RollingCollector,
    inner: Arc<Mutex<MeetingInner>>,
}

impl Meeting {
    /// Create a meeting in the Forming state. The owner is joined from the
    /// start; `invited` seeds the attendee set.
    pub fn new(
        id: MeetingId,
        owner_id: AgentId,
        owner_klass: impl Into<String>,
        channel: Arc<Channel>,
        invited: HashSet<AgentId>,
        directory: Arc<AgentDirectory>,
        rolling_timeout: Duration,
        max_batch_wait: Duration,
        deliver_final_to_muted: bool,
    ) -> Self {
        let mut joined = HashSet::new();
        joined.insert(owner_id.clone());
        let inner = Arc::new(Mutex::new(MeetingInner {
            state: MeetingState::Forming,
            invited,
            joined,
            ended_at: None,
        }));
        let sink = Arc::new(AttendeeSink {
            directory,
            meeting: Arc::clone(&inner),
            deliver_final_to_muted,
        });
        Meeting {
            id,
            owner_id,
            owner_klass: owner_klass.into(),
            channel,
            collector: RollingCollector::new(rolling_timeout, max_batch_wait, sink),
            inner,
        }
    }

    pub fn id(&self) -> &MeetingId {
        &self.id
    }

    pub fn owner_id(&self) -> &AgentId {
        &self.owner_id
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn state(&self) -> MeetingState {
        self.inner.lock().unwrap().state
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().unwrap().ended_at
    }

    pub fn joined_attendees(&self) -> HashSet<AgentId> {
        self.inner.lock().unwrap().joined.clone()
    }

    pub fn invited_attendees(&self) -> HashSet<AgentId> {
        self.inner.lock().unwrap().invited.clone()
    }

    /// Add a late invitee.
    pub fn invite(&self, agent_id: AgentId) -> Result<(), MeetingError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == MeetingState::Ended {
            return Err(MeetingError::Ended(self.id.clone()));
        }
        inner.invited.insert(agent_id);
        Ok(())
    }

    /// Transition an invitee to joined. The meeting becomes Active as soon
    /// as two attendees (owner + one joiner) are in.
    pub fn mark_joined(&self, participant: Participant) -> Result<MeetingState, MeetingError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == MeetingState::Ended {
            return Err(MeetingError::Ended(self.id.clone()));
        }
        let id = participant.id().clone();
        if id != self.owner_id && !inner.invited.contains(&id) {
            return Err(MeetingError::NotInvited {
                meeting_id: self.id.clone(),
                agent_id: id,
            });
        }
        inner.invited.remove(&id);
        inner.joined.insert(id);
        if inner.state == MeetingState::Forming && inner.joined.len() >= 2 {
            inner.state = MeetingState::Active;
        }
        let state = inner.state;
        drop(inner);
        self.channel.add_participant(participant);
        Ok(state)
    }

    /// Broadcast into the meeting through the rolling collector.
    pub fn broadcast(&self, message: Message) -> Result<(), MeetingError> {
        if self.state() == MeetingState::Ended {
            return Err(MeetingError::Ended(self.id.clone()));
        }
        self.collector.add_message(message);
        Ok(())
    }

    /// End the meeting. Owner only: anyone else gets
    /// [`MeetingError::NotOwner`]. Flushes the pending batch, then delivers
    /// a final `MeetingEnd` message to the joined attendees.
    pub async fn end(&self, by: &AgentId) -> Result<(), MeetingError> {
        if by != &self.owner_id {
            return Err(MeetingError::NotOwner {
                meeting_id: self.id.clone(),
                agent_id: by.clone(),
            });
        }
        self.finish().await;
        Ok(())
    }

    /// End unconditionally (program shutdown path).
    pub async fn end_for_shutdown(&self) {
        self.finish().await;
    }

    async fn finish(&self) {
        let joined: Vec<AgentId> = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == MeetingState::Ended {
                return;
            }
            inner.state = MeetingState::Ended;
            inner.ended_at = Some(Utc::now());
            inner.joined.iter().cloned().collect()
        };

        self.collector.flush().await;

        let farewell = Message::meeting_end(
            self.owner_id.clone(),
            self.owner_klass.clone(),
            self.id.clone(),
            format!("Meeting {} has ended.", self.id),
        );
        for attendee in joined {
            if attendee == self.owner_id {
                continue;
            }
            self.channel
                .deliver_to(&attendee, farewell.clone(), Priority::Normal);
        }
    }
}
