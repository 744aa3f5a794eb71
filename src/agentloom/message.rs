//! Shared message vocabulary for the agent runtime.
//!
//! Every conversation inside a program — agent-to-agent, agent-to-human, and
//! meeting traffic — is carried by the immutable [`Message`] struct defined
//! here, addressed with the opaque identifier newtypes ([`AgentId`],
//! [`MeetingId`], [`ChannelId`], [`StreamId`]).
//!
//! Messages are constructed through the per-type constructors
//! ([`Message::direct`], [`Message::meeting_broadcast`], …) and never mutated
//! afterwards; routing, inbox queuing, and batch delivery all clone them.
//!
//! # Example
//!
//! ```rust
//! use agentloom::message::{AgentId, Message, MessageType, Priority};
//!
//! let msg = Message::direct(
//!     AgentId::new("1000"),
//!     "Assistant",
//!     AgentId::human(),
//!     "User",
//!     "Here is the report you asked for.",
//! );
//! assert_eq!(msg.message_type, MessageType::Direct);
//! assert_eq!(msg.priority, Priority::Normal);
//! assert_eq!(msg.recipient_id.as_ref().unwrap(), &AgentId::human());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Reserved identifier of the default human participant.
pub const HUMAN_AGENT_ID: &str = "human";

/// Opaque identifier of a single agent instance, unique across a program.
///
/// Assigned by the program when the agent is created (numeric ids starting at
/// 1000 for AI agents); the value `"human"` is reserved for the default human.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        AgentId(id.into())
    }

    /// The reserved id of the default human.
    pub fn human() -> Self {
        AgentId(HUMAN_AGENT_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_human(&self) -> bool {
        self.0 == HUMAN_AGENT_ID
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a meeting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeetingId(String);

impl MeetingId {
    pub fn new(id: impl Into<String>) -> Self {
        MeetingId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a channel.
///
/// Direct channels derive their id deterministically from the participant
/// pair (see [`crate::agentloom::channel::direct_channel_id`]); meeting
/// channels are named by the meeting owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        ChannelId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a stream, generated by the sender and unique within
/// its channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        StreamId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discriminates the delivery semantics of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// One sender, one recipient.
    Direct,
    /// Invitation to join a meeting; always eligible for delivery regardless
    /// of the recipient's waiting mode.
    MeetingInvite,
    /// Broadcast inside a meeting, coalesced by the rolling collector before
    /// recipients see it.
    MeetingBroadcast,
    /// Final message delivered to joined attendees when a meeting ends.
    MeetingEnd,
    /// Synthetic runtime notification (e.g. progressive-timeout notices).
    System,
}

/// Inbox ordering class. `High` messages are consumed before `Normal` ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Normal,
    High,
}

/// An immutable message exchanged between participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Id of the sending agent.
    pub sender_id: AgentId,
    /// Klass (type name) of the sending agent, e.g. `"Accountant"` or `"User"`.
    pub sender_klass: String,
    /// Recipient agent, when the message addresses exactly one; `None` for
    /// meeting broadcasts.
    pub recipient_id: Option<AgentId>,
    /// Klass of the recipient, when known.
    pub recipient_klass: Option<String>,
    /// Free-form message body.
    pub content: String,
    pub message_type: MessageType,
    /// Meeting this message belongs to, for meeting-scoped types.
    pub meeting_id: Option<MeetingId>,
    /// Agents explicitly targeted by a meeting broadcast. Used by humans with
    /// targeted meeting notifications to decide whether the message concerns
    /// them.
    pub target_agent_ids: HashSet<AgentId>,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
}

impl Message {
    /// Build a direct message from one agent to another.
    pub fn direct(
        sender_id: AgentId,
        sender_klass: impl Into<String>,
        recipient_id: AgentId,
        recipient_klass: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Message {
            sender_id,
            sender_klass: sender_klass.into(),
            recipient_id: Some(recipient_id),
            recipient_klass: Some(recipient_klass.into()),
            content: content.into(),
            message_type: MessageType::Direct,
            meeting_id: None,
            target_agent_ids: HashSet::new(),
            timestamp: Utc::now(),
            priority: Priority::Normal,
        }
    }

    /// Build a meeting broadcast, optionally targeted at specific attendees.
    pub fn meeting_broadcast(
        sender_id: AgentId,
        sender_klass: impl Into<String>,
        meeting_id: MeetingId,
        content: impl Into<String>,
        target_agent_ids: HashSet<AgentId>,
    ) -> Self {
        Message {
            sender_id,
            sender_klass: sender_klass.into(),
            recipient_id: None,
            recipient_klass: None,
            content: content.into(),
            message_type: MessageType::MeetingBroadcast,
            meeting_id: Some(meeting_id),
            target_agent_ids,
            timestamp: Utc::now(),
            priority: Priority::Normal,
        }
    }

    /// Build a meeting invitation for a single invitee.
    pub fn meeting_invite(
        sender_id: AgentId,
        sender_klass: impl Into<String>,
        recipient_id: AgentId,
        recipient_klass: impl Into<String>,
        meeting_id: MeetingId,
        content: impl Into<String>,
    ) -> Self {
        Message {
            sender_id,
            sender_klass: sender_klass.into(),
            recipient_id: Some(recipient_id),
            recipient_klass: Some(recipient_klass.into()),
            content: content.into(),
            message_type: MessageType::MeetingInvite,
            meeting_id: Some(meeting_id),
            target_agent_ids: HashSet::new(),
            timestamp: Utc::now(),
            priority: Priority::Normal,
        }
    }

    /// Build the final message broadcast to joined attendees when a meeting
    /// ends.
    pub fn meeting_end(
        sender_id: AgentId,
        sender_klass: impl Into<String>,
        meeting_id: MeetingId,
        content: impl Into<String>,
    ) -> Self {
        Message {
            sender_id,
            sender_klass: sender_klass.into(),
            recipient_id: None,
            recipient_klass: None,
            content: content.into(),
            message_type: MessageType::MeetingEnd,
            meeting_id: Some(meeting_id),
            target_agent_ids: HashSet::new(),
            timestamp: Utc::now(),
            priority: Priority::Normal,
        }
    }

    /// Build a synthetic runtime notification addressed to `recipient_id`.
    pub fn system(recipient_id: AgentId, content: impl Into<String>) -> Self {
        Message {
            sender_id: AgentId::new("system"),
            sender_klass: "System".to_string(),
            recipient_id: Some(recipient_id),
            recipient_klass: None,
            content: content.into(),
            message_type: MessageType::System,
            meeting_id: None,
            target_agent_ids: HashSet::new(),
            timestamp: Utc::now(),
            priority: Priority::Normal,
        }
    }

    /// Return a copy carrying `High` priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// True when `agent_id` is the addressed recipient or is explicitly
    /// targeted by a broadcast.
    pub fn concerns(&self, agent_id: &AgentId) -> bool {
        self.recipient_id.as_ref() == Some(agent_id) || self.target_agent_ids.contains(agent_id)
    }
}
