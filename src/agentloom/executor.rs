//! The executor seam: where the runtime hands a turn to the outside world.
//!
//! The core never talks to an LLM. Each scheduling turn it collects a batch
//! of inbox messages and calls [`AgentExecutor::run`]; whatever drives the
//! agent — an LLM loop, a scripted test double, a human adapter — returns a
//! [`RunResult`]: an ordered list of [`Effect`]s for the runtime to apply,
//! plus whether the program should end.
//!
//! Effects execute in order. The first failing effect discards the rest of
//! the list and is recorded on the agent's error state.

use crate::agentloom::agent::Agent;
use crate::agentloom::checkpoint::Checkpoint;
use crate::agentloom::message::{AgentId, Message, MessageType, MeetingId, StreamId};
use crate::agentloom::runtime::WaitingMode;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// One instruction from the executor to the runtime.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Speak to a receiver spec (`"human"`, `"agent 1001"`, …). Like
    /// `SendMessage` with type `Direct`, but the utterance is also appended
    /// to the caller's conversation context.
    Say { target: String, content: String },
    /// Send a message to a receiver spec with an explicit type.
    SendMessage {
        target: String,
        content: String,
        message_type: MessageType,
    },
    /// Open a stream toward a receiver spec.
    StartStream { target: String, stream_id: StreamId },
    /// Push one fragment of a previously started stream.
    StreamChunk { stream_id: StreamId, chunk: String },
    /// Close a stream with its assembled final content.
    CompleteStream {
        stream_id: StreamId,
        final_content: String,
    },
    /// Suspend until the waiting mode's predicate is satisfied (or the
    /// progressive timeout fires).
    Yield { mode: WaitingMode },
    /// Create a meeting owned by this agent and invite `participants`.
    CreateMeeting {
        meeting_id: MeetingId,
        participants: Vec<AgentId>,
    },
    /// Accept a pending meeting invitation.
    JoinMeeting { meeting_id: MeetingId },
    /// End a meeting this agent owns.
    EndMeeting { meeting_id: MeetingId },
    /// Write a variable (subject to artifact promotion).
    SetVariable {
        name: String,
        value: serde_json::Value,
    },
    /// Record a checkpoint of this agent's execution state.
    Checkpoint { record: Checkpoint },
}

/// What the executor produced for one turn.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub effects: Vec<Effect>,
    pub ends_program: bool,
}

impl RunResult {
    pub fn new(effects: Vec<Effect>) -> Self {
        RunResult {
            effects,
            ends_program: false,
        }
    }

    pub fn ending_program(effects: Vec<Effect>) -> Self {
        RunResult {
            effects,
            ends_program: true,
        }
    }
}

/// Failures from inside the executor.
///
/// `Transient` failures (provider overload, rate limits) are retried by the
/// runtime with exponential backoff; `Fatal` failures stop the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    Transient(String),
    Fatal(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorError::Transient(msg) => write!(f, "transient executor error: {}", msg),
            ExecutorError::Fatal(msg) => write!(f, "fatal executor error: {}", msg),
        }
    }
}

impl Error for ExecutorError {}

/// Runs one turn of an agent: consume a message batch, decide what happens
/// next.
///
/// Implementations must be cancellation-aware at their own suspension
/// points; the runtime signals shutdown cooperatively and lets an in-flight
/// turn run to completion.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run(
        &self,
        agent: &Arc<Agent>,
        messages: Vec<Message>,
    ) -> Result<RunResult, ExecutorError>;
}
