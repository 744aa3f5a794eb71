//! Checkpoint records and recovery.
//!
//! The runtime defines only the record *shape* — storage backends live
//! outside the core. A [`Checkpoint`] captures enough of an agent's
//! execution state (variables, namespace, call stack pointers, the
//! statement being executed) that [`Checkpoint::restore_into`] can rebuild
//! the agent exactly: the live call stack is cleared and replaced with
//! precisely the recorded frames, in order, with depths renumbered.

use crate::agentloom::agent::{Agent, AgentDirectory};
use crate::agentloom::call_stack::{CallFrame, InstructionPointer};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One recorded call frame: just the instruction pointer coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub playbook: String,
    pub line_number: String,
    pub source_line_number: u32,
}

impl FrameRecord {
    fn to_frame(&self) -> CallFrame {
        CallFrame::new(InstructionPointer::new(
            self.playbook.clone(),
            self.line_number.clone(),
            self.source_line_number,
        ))
    }
}

/// Where and what the agent was executing when the checkpoint was cut.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// The statement being executed, e.g. `"await Step('Main:03:QUE')"`.
    pub statement: String,
    /// Monotonic checkpoint counter within the execution.
    pub counter: u64,
    /// Unix timestamp (seconds).
    pub timestamp: i64,
    pub call_stack: Vec<FrameRecord>,
}

/// Compact description of one agent for the execution-state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub klass: String,
    pub busy: bool,
}

/// Variables and the agent roster at checkpoint time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStateSnapshot {
    pub variables: HashMap<String, serde_json::Value>,
    pub agents: Vec<AgentSummary>,
}

/// A complete checkpoint record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub execution_id: String,
    pub execution_state: ExecutionStateSnapshot,
    pub namespace: HashMap<String, serde_json::Value>,
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Cut a checkpoint from an agent's live state.
    pub fn capture(
        agent: &Agent,
        directory: &AgentDirectory,
        execution_id: impl Into<String>,
        statement: impl Into<String>,
        counter: u64,
    ) -> Self {
        let execution_id = execution_id.into();
        let call_stack = agent
            .call_stack()
            .snapshot()
            .into_iter()
            .map(|ip| FrameRecord {
                playbook: ip.playbook,
                line_number: ip.line_number,
                source_line_number: ip.source_line_number,
            })
            .collect();
        let agents = directory
            .all()
            .into_iter()
            .map(|a| AgentSummary {
                id: a.id.as_str().to_string(),
                klass: a.klass.clone(),
                busy: a.is_busy(),
            })
            .collect();
        Checkpoint {
            checkpoint_id: format!("{}_ckpt_{}", execution_id, counter),
            execution_id,
            execution_state: ExecutionStateSnapshot {
                variables: agent.variables().public_variables(),
                agents,
            },
            namespace: agent.namespace().clone(),
            metadata: CheckpointMetadata {
                statement: statement.into(),
                counter,
                timestamp: Utc::now().timestamp(),
                call_stack,
            },
        }
    }

    /// Rebuild `agent` from this record.
    ///
    /// The live call stack is cleared first — after this returns it holds
    /// exactly `metadata.call_stack`'s frames, in order, depths 1..n, with
    /// no residue from the pre-recovery state. Variables and namespace are
    /// replaced wholesale.
    pub fn restore_into(&self, agent: &Agent) {
        let frames: Vec<CallFrame> = self
            .metadata
            .call_stack
            .iter()
            .map(FrameRecord::to_frame)
            .collect();
        agent.call_stack().replace_frames(frames);
        agent
            .variables()
            .restore_plain(self.execution_state.variables.clone());
        *agent.namespace() = self.namespace.clone();
        agent.set_last_checkpoint(self.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentloom::agent::AgentKind;
    use crate::agentloom::event::EventBus;
    use crate::agentloom::message::AgentId;
    use std::sync::Arc;

    fn agent() -> Agent {
        Agent::new(
            AgentId::new("test_agent"),
            "TestAgent",
            AgentKind::Ai,
            Arc::new(EventBus::new("test")),
            1024,
            None,
        )
    }

    fn record(frames: Vec<(&str, &str, u32)>) -> Checkpoint {
        Checkpoint {
            checkpoint_id: "test_agent_ckpt_1".to_string(),
            execution_id: "test_agent".to_string(),
            execution_state: ExecutionStateSnapshot {
                variables: vec![("x".to_string(), serde_json::json!(10))]
                    .into_iter()
                    .collect(),
                agents: Vec::new(),
            },
            namespace: vec![("x".to_string(), serde_json::json!(10))]
                .into_iter()
                .collect(),
            metadata: CheckpointMetadata {
                statement: "await Step('Main:03:QUE')".to_string(),
                counter: 1,
                timestamp: 123456,
                call_stack: frames
                    .into_iter()
                    .map(|(p, l, s)| FrameRecord {
                        playbook: p.to_string(),
                        line_number: l.to_string(),
                        source_line_number: s,
                    })
                    .collect(),
            },
        }
    }

    #[tokio::test]
    async fn call_stack_is_restored_from_metadata() {
        let a = agent();
        record(vec![("Main", "01", 5), ("Main", "03", 10)]).restore_into(&a);

        let cs = a.call_stack();
        assert_eq!(cs.depth(), 2);
        let frames = cs.frames();
        assert_eq!(frames[0].instruction_pointer.playbook, "Main");
        assert_eq!(frames[0].instruction_pointer.line_number, "01");
        assert_eq!(frames[0].instruction_pointer.source_line_number, 5);
        assert_eq!(frames[1].instruction_pointer.line_number, "03");
        assert_eq!(frames[1].instruction_pointer.source_line_number, 10);
    }

    #[tokio::test]
    async fn empty_call_stack_is_handled() {
        let a = agent();
        record(vec![]).restore_into(&a);
        assert_eq!(a.call_stack().depth(), 0);
    }

    #[tokio::test]
    async fn existing_frames_are_cleared_before_restore() {
        let a = agent();
        a.call_stack().push(CallFrame::new(InstructionPointer::new(
            "OldPlaybook",
            "99",
            999,
        )));
        assert_eq!(a.call_stack().depth(), 1);

        record(vec![("NewPlaybook", "01", 5)]).restore_into(&a);

        let cs = a.call_stack();
        assert_eq!(cs.depth(), 1);
        assert_eq!(cs.frames()[0].instruction_pointer.playbook, "NewPlaybook");
        assert_eq!(cs.frames()[0].instruction_pointer.line_number, "01");
    }

    #[tokio::test]
    async fn nested_frames_keep_order_and_depths() {
        let a = agent();
        record(vec![
            ("Main", "01", 5),
            ("SubTask", "03", 15),
            ("Helper", "02", 25),
        ])
        .restore_into(&a);

        let cs = a.call_stack();
        assert_eq!(cs.depth(), 3);
        assert_eq!(cs.frames()[0].playbook(), "Main");
        assert_eq!(cs.frames()[1].playbook(), "SubTask");
        assert_eq!(cs.frames()[2].playbook(), "Helper");
        assert_eq!(cs.frames()[0].depth, 1);
        assert_eq!(cs.frames()[1].depth, 2);
        assert_eq!(cs.frames()[2].depth, 3);
    }

    #[tokio::test]
    async fn variables_and_namespace_are_restored() {
        let a = agent();
        a.variables().set("stale", serde_json::json!("gone"));
        record(vec![]).restore_into(&a);

        assert!(a.variables().get("stale").is_none());
        assert_eq!(
            a.variables().get("x").map(|v| v.display_value()),
            Some(serde_json::json!(10))
        );
        assert_eq!(a.namespace().get("x"), Some(&serde_json::json!(10)));
        assert!(a.last_checkpoint().is_some());
    }

    #[tokio::test]
    async fn capture_round_trips_through_serde() {
        let a = agent();
        a.call_stack()
            .push(CallFrame::new(InstructionPointer::new("Main", "01", 5)));
        a.variables().set("x", serde_json::json!(10));

        let directory = AgentDirectory::new();
        let ckpt = Checkpoint::capture(&a, &directory, "exec-1", "await Step('Main:01:SEQ')", 1);
        assert_eq!(ckpt.checkpoint_id, "exec-1_ckpt_1");
        assert_eq!(ckpt.metadata.call_stack.len(), 1);

        let json = serde_json::to_string(&ckpt).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back.metadata.call_stack, ckpt.metadata.call_stack);
        assert_eq!(
            back.execution_state.variables.get("x"),
            Some(&serde_json::json!(10))
        );
    }
}
