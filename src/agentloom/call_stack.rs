//! Per-agent execution context: call frames and the call stack.
//!
//! Each in-flight playbook invocation gets a [`CallFrame`] holding its
//! instruction pointer, local variables, conversation messages, and the set
//! of artifacts already loaded into context. The [`CallStack`] strings the
//! frames together and also keeps a parallel *top-level* message list used
//! when the stack is empty — those messages are program-level and always
//! included in prompt assembly.
//!
//! `add_message_to_parent` exists because built-in playbooks (`Say` and
//! friends) run in their own frame but must append their observation to the
//! caller's context.
//!
//! Stack movement publishes `CallStackPush` / `CallStackPop` /
//! `InstructionPointerMoved` events so debuggers can follow execution.

use crate::agentloom::event::{Event, EventBus, EventPayload};
use crate::agentloom::message::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Position of execution within one playbook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionPointer {
    pub playbook: String,
    /// Compiled line label, e.g. `"01"` or `"03.02"`.
    pub line_number: String,
    /// Line in the original markdown source.
    pub source_line_number: u32,
}

impl InstructionPointer {
    pub fn new(
        playbook: impl Into<String>,
        line_number: impl Into<String>,
        source_line_number: u32,
    ) -> Self {
        InstructionPointer {
            playbook: playbook.into(),
            line_number: line_number.into(),
            source_line_number,
        }
    }
}

impl fmt::Display for InstructionPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.playbook, self.line_number)
    }
}

/// One entry in a frame's (or the top-level) conversation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextMessage {
    /// Plain conversational text: observations, replies, tool output.
    Text(String),
    /// A loaded artifact; inlined at most once per stack.
    Artifact {
        name: String,
        summary: String,
        content: String,
    },
}

impl ContextMessage {
    fn artifact_name(&self) -> Option<&str> {
        match self {
            ContextMessage::Artifact { name, .. } => Some(name),
            ContextMessage::Text(_) => None,
        }
    }
}

/// Execution context of a single in-flight playbook invocation.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub instruction_pointer: InstructionPointer,
    pub locals: HashMap<String, serde_json::Value>,
    pub messages: Vec<ContextMessage>,
    pub artifacts_loaded: HashSet<String>,
    /// 1-based position in the stack; assigned on push.
    pub depth: usize,
}

impl CallFrame {
    pub fn new(instruction_pointer: InstructionPointer) -> Self {
        CallFrame {
            instruction_pointer,
            locals: HashMap::new(),
            messages: Vec::new(),
            artifacts_loaded: HashSet::new(),
            depth: 0,
        }
    }

    pub fn playbook(&self) -> &str {
        &self.instruction_pointer.playbook
    }
}

/// Ordered list of call frames plus the top-level message list.
pub struct CallStack {
    agent_id: AgentId,
    bus: Arc<EventBus>,
    frames: Vec<CallFrame>,
    top_level_messages: Vec<ContextMessage>,
    top_level_artifacts: HashSet<String>,
}

impl CallStack {
    pub fn new(agent_id: AgentId, bus: Arc<EventBus>) -> Self {
        CallStack {
            agent_id,
            bus,
            frames: Vec::new(),
            top_level_messages: Vec::new(),
            top_level_artifacts: HashSet::new(),
        }
    }

    /// Fire-and-forget event emission; stack mutation must not block on
    /// observers.
    fn emit(&self, payload: EventPayload) {
        let bus = Arc::clone(&self.bus);
        let event = Event::agent(self.agent_id.clone(), payload);
        tokio::spawn(async move {
            let _ = bus.publish(event).await;
        });
    }

    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Instruction pointers of all frames, bottom first.
    pub fn snapshot(&self) -> Vec<InstructionPointer> {
        self.frames
            .iter()
            .map(|f| f.instruction_pointer.clone())
            .collect()
    }

    /// Push `frame` on top; its depth becomes its 1-based stack position.
    pub fn push(&mut self, mut frame: CallFrame) {
        frame.depth = self.frames.len() + 1;
        let pointer = frame.instruction_pointer.clone();
        self.frames.push(frame);
        self.emit(EventPayload::CallStackPush {
            frame: pointer,
            stack: self.snapshot(),
        });
    }

    pub fn pop(&mut self) -> Option<CallFrame> {
        let frame = self.frames.pop()?;
        self.emit(EventPayload::CallStackPop {
            frame: frame.instruction_pointer.clone(),
            stack: self.snapshot(),
        });
        Some(frame)
    }

    pub fn peek(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    pub fn peek_mut(&mut self) -> Option<&mut CallFrame> {
        self.frames.last_mut()
    }

    pub fn top_level_messages(&self) -> &[ContextMessage] {
        &self.top_level_messages
    }

    /// Attach `message` to the topmost frame, or to the top-level list when
    /// the stack is empty.
    pub fn add_message(&mut self, message: ContextMessage) {
        let artifact = message.artifact_name().map(|n| n.to_string());
        match self.frames.last_mut() {
            Some(frame) => {
                if let Some(name) = artifact {
                    frame.artifacts_loaded.insert(name);
                }
                frame.messages.push(message);
            }
            None => {
                if let Some(name) = artifact {
                    self.top_level_artifacts.insert(name);
                }
                self.top_level_messages.push(message);
            }
        }
    }

    /// Attach `message` to the caller's frame (second from top); with fewer
    /// than two frames it falls through to the top-level list.
    pub fn add_message_to_parent(&mut self, message: ContextMessage) {
        let artifact = message.artifact_name().map(|n| n.to_string());
        let len = self.frames.len();
        if len >= 2 {
            let parent = &mut self.frames[len - 2];
            if let Some(name) = artifact {
                parent.artifacts_loaded.insert(name);
            }
            parent.messages.push(message);
        } else {
            if let Some(name) = artifact {
                self.top_level_artifacts.insert(name);
            }
            self.top_level_messages.push(message);
        }
    }

    /// True when an artifact named `name` is loaded anywhere on the stack or
    /// at top level.
    pub fn is_artifact_loaded(&self, name: &str) -> bool {
        self.top_level_artifacts.contains(name)
            || self.frames.iter().any(|f| f.artifacts_loaded.contains(name))
    }

    /// Load an artifact into the current context unless it is already loaded
    /// somewhere on the stack. Repeated reads of the same artifact therefore
    /// add at most one load record.
    pub fn load_artifact(
        &mut self,
        name: impl Into<String>,
        summary: impl Into<String>,
        content: impl Into<String>,
    ) {
        let name = name.into();
        if self.is_artifact_loaded(&name) {
            return;
        }
        self.add_message(ContextMessage::Artifact {
            name,
            summary: summary.into(),
            content: content.into(),
        });
    }

    /// Move the topmost frame's instruction pointer.
    pub fn advance_instruction_pointer(
        &mut self,
        playbook: impl Into<String>,
        line_number: impl Into<String>,
        source_line_number: u32,
    ) {
        let pointer = InstructionPointer::new(playbook, line_number, source_line_number);
        if let Some(frame) = self.frames.last_mut() {
            frame.instruction_pointer = pointer.clone();
        }
        self.emit(EventPayload::InstructionPointerMoved {
            pointer,
            stack: self.snapshot(),
        });
    }

    /// Replace the stack wholesale (checkpoint recovery). Depths are
    /// renumbered; no push/pop events are published for the rebuild.
    pub(crate) fn replace_frames(&mut self, frames: Vec<CallFrame>) {
        self.frames = frames;
        for (i, frame) in self.frames.iter_mut().enumerate() {
            frame.depth = i + 1;
        }
    }

    /// Assemble the compacted context handed to the executor: top-level
    /// messages first, then each frame's messages bottom-up, with artifacts
    /// de-duplicated by name across the whole assembly.
    pub fn compacted_context(&self) -> Vec<ContextMessage> {
        let mut seen_artifacts = HashSet::new();
        let mut out = Vec::new();
        let all = self
            .top_level_messages
            .iter()
            .chain(self.frames.iter().flat_map(|f| f.messages.iter()));
        for message in all {
            if let Some(name) = message.artifact_name() {
                if !seen_artifacts.insert(name.to_string()) {
                    continue;
                }
            }
            out.push(message.clone());
        }
        out
    }
}
