//! Variable storage with automatic artifact promotion.
//!
//! Agents write variables through [`VariableStore::set`]. Any value whose
//! rendered form exceeds the configured threshold is promoted to an
//! [`Artifact`] — stored with a short summary so the full content does not
//! ride along in every prompt — and observers see `Artifact: <summary>`
//! instead of the body in `VariableUpdate` events.
//!
//! Names starting with `_` are private: the implicit last-result slot `_`
//! and runtime bookkeeping live there, excluded from public snapshots.

use crate::agentloom::event::{Event, EventBus, EventPayload};
use crate::agentloom::message::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the implicit variable holding the last effect result.
pub const LAST_RESULT: &str = "_";

/// How many characters of the rendered value make up an artifact summary.
const SUMMARY_LEN: usize = 100;

/// A value too large to inline, stored with a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub summary: String,
    pub value: serde_json::Value,
}

/// A stored variable value: plain JSON, or an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Plain(serde_json::Value),
    Artifact(Artifact),
}

impl Value {
    pub fn is_artifact(&self) -> bool {
        matches!(self, Value::Artifact(_))
    }

    /// The full string rendering of the underlying value.
    pub fn rendered(&self) -> String {
        match self {
            Value::Plain(v) => render(v),
            Value::Artifact(a) => render(&a.value),
        }
    }

    /// The representation shown to observers and snapshots: artifacts
    /// collapse to their summary.
    pub fn display_value(&self) -> serde_json::Value {
        match self {
            Value::Plain(v) => v.clone(),
            Value::Artifact(a) => {
                serde_json::Value::String(format!("Artifact: {}", a.summary))
            }
        }
    }
}

fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn summarize(rendered: &str) -> String {
    if rendered.chars().count() <= SUMMARY_LEN {
        return rendered.to_string();
    }
    let head: String = rendered.chars().take(SUMMARY_LEN).collect();
    format!("{}...", head)
}

/// Per-agent variable store with artifact promotion and update events.
pub struct VariableStore {
    agent_id: AgentId,
    bus: Arc<EventBus>,
    artifact_threshold: usize,
    vars: HashMap<String, Value>,
}

impl VariableStore {
    pub fn new(agent_id: AgentId, bus: Arc<EventBus>, artifact_threshold: usize) -> Self {
        VariableStore {
            agent_id,
            bus,
            artifact_threshold,
            vars: HashMap::new(),
        }
    }

    /// Write `name`. Values whose rendering exceeds the artifact threshold
    /// are stored as an [`Artifact`]; everything else stays plain. Publishes
    /// a `VariableUpdate` event either way.
    pub fn set(&mut self, name: impl Into<String>, value: serde_json::Value) -> &Value {
        let name = name.into();
        let rendered = render(&value);
        let stored = if rendered.len() > self.artifact_threshold {
            Value::Artifact(Artifact {
                name: name.clone(),
                summary: summarize(&rendered),
                value,
            })
        } else {
            Value::Plain(value)
        };

        let event_value = stored.display_value();
        self.vars.insert(name.clone(), stored);

        let bus = Arc::clone(&self.bus);
        let event = Event::agent(
            self.agent_id.clone(),
            EventPayload::VariableUpdate {
                name: name.clone(),
                value: event_value,
            },
        );
        tokio::spawn(async move {
            let _ = bus.publish(event).await;
        });

        self.vars.get(&name).expect("just inserted")
    }

    /// Record the implicit last-result value.
    pub fn set_last_result(&mut self, value: serde_json::Value) {
        self.set(LAST_RESULT, value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn last_result(&self) -> Option<&Value> {
        self.vars.get(LAST_RESULT)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Public variables only (no `_`-prefixed names), artifacts collapsed to
    /// their summaries. This is the shape embedded in checkpoints and state
    /// snapshots.
    pub fn public_variables(&self) -> HashMap<String, serde_json::Value> {
        self.vars
            .iter()
            .filter(|(name, _)| !name.starts_with('_'))
            .map(|(name, value)| (name.clone(), value.display_value()))
            .collect()
    }

    /// Full-fidelity dump including private names, for recovery.
    pub fn to_map(&self) -> HashMap<String, Value> {
        self.vars.clone()
    }

    /// Replace the whole store (checkpoint recovery). No events are
    /// published for restored values.
    pub fn restore(&mut self, vars: HashMap<String, Value>) {
        self.vars = vars;
    }

    /// Restore from a plain map, re-running promotion on each value.
    pub fn restore_plain(&mut self, vars: HashMap<String, serde_json::Value>) {
        self.vars.clear();
        for (name, value) in vars {
            let rendered = render(&value);
            let stored = if rendered.len() > self.artifact_threshold {
                Value::Artifact(Artifact {
                    name: name.clone(),
                    summary: summarize(&rendered),
                    value,
                })
            } else {
                Value::Plain(value)
            };
            self.vars.insert(name, stored);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentloom::event::{EventHandler, EventKind, Topic};
    use std::sync::Mutex;
    use std::time::Duration;

    fn store(threshold: usize) -> VariableStore {
        VariableStore::new(
            AgentId::new("1000"),
            Arc::new(EventBus::new("test")),
            threshold,
        )
    }

    #[tokio::test]
    async fn small_values_stay_plain() {
        let mut vars = store(100);
        vars.set("x", serde_json::json!(42));
        assert!(!vars.get("x").unwrap().is_artifact());
    }

    #[tokio::test]
    async fn oversized_values_become_artifacts() {
        let mut vars = store(100);
        let big = "x".repeat(500);
        vars.set("report", serde_json::json!(big));

        match vars.get("report").unwrap() {
            Value::Artifact(a) => {
                assert_eq!(a.name, "report");
                assert!(a.summary.len() <= SUMMARY_LEN + 3);
                assert!(a.summary.ends_with("..."));
                assert_eq!(render(&a.value).len(), 500);
            }
            Value::Plain(_) => panic!("expected artifact promotion"),
        }
    }

    #[tokio::test]
    async fn promotion_boundary_is_strict() {
        let mut vars = store(10);
        vars.set("at", serde_json::json!("aaaaaaaaaa")); // exactly 10
        vars.set("over", serde_json::json!("aaaaaaaaaaa")); // 11

        assert!(!vars.get("at").unwrap().is_artifact());
        assert!(vars.get("over").unwrap().is_artifact());
    }

    #[tokio::test]
    async fn last_result_is_private() {
        let mut vars = store(100);
        vars.set_last_result(serde_json::json!("ok"));
        vars.set("visible", serde_json::json!(1));

        assert!(vars.last_result().is_some());
        let public = vars.public_variables();
        assert!(public.contains_key("visible"));
        assert!(!public.contains_key(LAST_RESULT));
    }

    #[tokio::test]
    async fn public_snapshot_collapses_artifacts() {
        let mut vars = store(10);
        vars.set("report", serde_json::json!("a very long report body here"));

        let public = vars.public_variables();
        let rendered = public.get("report").unwrap().as_str().unwrap();
        assert!(rendered.starts_with("Artifact: "));
    }

    struct UpdateRecorder {
        names: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl EventHandler for UpdateRecorder {
        async fn on_event(&self, event: &Event) {
            if let EventPayload::VariableUpdate { name, .. } = &event.payload {
                self.names.lock().unwrap().push(name.clone());
            }
            assert_eq!(event.payload.kind(), EventKind::VariableUpdate);
        }
    }

    #[tokio::test]
    async fn set_publishes_variable_update() {
        let bus = Arc::new(EventBus::new("test"));
        let recorder = Arc::new(UpdateRecorder {
            names: Mutex::new(Vec::new()),
        });
        bus.subscribe(Topic::Kind(EventKind::VariableUpdate), recorder.clone() as _)
            .unwrap();

        let mut vars = VariableStore::new(AgentId::new("1000"), Arc::clone(&bus), 100);
        vars.set("x", serde_json::json!(1));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.names.lock().unwrap().clone(), vec!["x"]);
    }

    #[tokio::test]
    async fn restore_round_trips() {
        let mut vars = store(10);
        vars.set("long", serde_json::json!("aaaaaaaaaaaaaaaaaaaa"));
        vars.set("short", serde_json::json!(7));

        let dump = vars.to_map();
        let mut restored = store(10);
        restored.restore(dump);

        assert!(restored.get("long").unwrap().is_artifact());
        assert_eq!(
            restored.get("short").unwrap(),
            &Value::Plain(serde_json::json!(7))
        );
    }
}
