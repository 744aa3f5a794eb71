// src/lib.rs

// Import the top-level `agentloom` module.
pub mod agentloom;

// Re-exporting key items for easier external access.
pub use agentloom::agent::{self, Agent, AgentDirectory, AgentKind, DeliveryPreferences};
pub use agentloom::call_stack::{self, CallFrame, CallStack, InstructionPointer};
pub use agentloom::channel::{self, Channel, Participant, StreamObserver};
pub use agentloom::checkpoint::{self, Checkpoint};
pub use agentloom::config::{self, RuntimeConfig};
pub use agentloom::event::{self, Event, EventBus, EventHandler, EventKind, EventPayload, Topic};
pub use agentloom::executor::{self, AgentExecutor, Effect, ExecutorError, RunResult};
pub use agentloom::inbox::{self, AgentInbox, InboxError};
pub use agentloom::meeting::{self, Meeting, MeetingState};
pub use agentloom::message::{self, AgentId, ChannelId, Message, MessageType, MeetingId, Priority, StreamId};
pub use agentloom::program::{self, AgentDefinition, Program, ProgramError};
pub use agentloom::router::{self, RouteError, RouteResult};
pub use agentloom::runtime::{self, AgentRuntime, WaitingMode};
pub use agentloom::variables::{self, Artifact, VariableStore};
