//! Agent records and the program-wide agent directory.
//!
//! An [`Agent`] is an independently scheduled participant: identity (id +
//! klass), a kind discriminator (AI or human), its inbox, delivery
//! preferences, and the execution state the runtime maintains on its behalf
//! (call stack, variables, namespace, error list, busy flag, waiting
//! state).
//!
//! Channels and routers never hold `Agent` pointers; they store [`AgentId`]s
//! and resolve them through the [`AgentDirectory`] on demand, which keeps
//! the object graph acyclic.

use crate::agentloom::call_stack::CallStack;
use crate::agentloom::checkpoint::Checkpoint;
use crate::agentloom::event::EventBus;
use crate::agentloom::inbox::AgentInbox;
use crate::agentloom::message::AgentId;
use crate::agentloom::runtime::WaitingMode;
use crate::agentloom::variables::VariableStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

/// Discriminates how an agent is driven: an LLM executor loop, or an
/// inbound-message adapter for a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Ai,
    Human,
}

/// Preferred delivery conduit for a human participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryChannel {
    /// Fragments are pushed as they are produced.
    Streaming,
    /// Output is buffered and delivered as completed messages.
    Buffered,
}

/// Which meeting broadcasts a human wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingNotifications {
    /// Every broadcast.
    All,
    /// Only broadcasts that name the human (id or klass in the content) or
    /// target them explicitly.
    Targeted,
    /// No streamed broadcasts. Whether the final buffered copy still lands
    /// is governed by `RuntimeConfig::deliver_final_to_muted`.
    None,
}

/// How output reaches a human participant. Only meaningful for
/// [`AgentKind::Human`]; AI agents consume their inbox directly.
#[derive(Debug, Clone)]
pub struct DeliveryPreferences {
    pub channel: DeliveryChannel,
    /// Explicit override; when unset, streaming is derived from `channel`.
    pub streaming_enabled: Option<bool>,
    pub streaming_chunk_size: usize,
    pub buffer_timeout: Duration,
    pub buffer_messages: bool,
    pub meeting_notifications: MeetingNotifications,
}

impl Default for DeliveryPreferences {
    fn default() -> Self {
        DeliveryPreferences {
            channel: DeliveryChannel::Streaming,
            streaming_enabled: None,
            streaming_chunk_size: 80,
            buffer_timeout: Duration::from_secs(2),
            buffer_messages: true,
            meeting_notifications: MeetingNotifications::All,
        }
    }
}

impl DeliveryPreferences {
    pub fn with_channel(mut self, channel: DeliveryChannel) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_streaming_enabled(mut self, enabled: bool) -> Self {
        self.streaming_enabled = Some(enabled);
        self
    }

    pub fn with_streaming_chunk_size(mut self, size: usize) -> Self {
        self.streaming_chunk_size = size;
        self
    }

    pub fn with_buffer_timeout(mut self, timeout: Duration) -> Self {
        self.buffer_timeout = timeout;
        self
    }

    pub fn with_meeting_notifications(mut self, notifications: MeetingNotifications) -> Self {
        self.meeting_notifications = notifications;
        self
    }

    /// Whether streamed fragments should be pushed to this participant.
    /// Auto-derived from the channel type when no explicit override is set.
    pub fn streaming(&self) -> bool {
        self.streaming_enabled
            .unwrap_or(self.channel == DeliveryChannel::Streaming)
    }
}

/// What an agent's runtime is currently waiting for, plus the per-wait
/// timeout.
#[derive(Debug, Clone)]
pub struct WaitingState {
    pub mode: WaitingMode,
    pub timeout: Option<Duration>,
}

impl Default for WaitingState {
    fn default() -> Self {
        WaitingState {
            mode: WaitingMode::NotWaiting,
            timeout: None,
        }
    }
}

/// An independently scheduled participant with its own inbox and state.
pub struct Agent {
    pub id: AgentId,
    pub klass: String,
    pub kind: AgentKind,
    pub delivery: DeliveryPreferences,
    inbox: Arc<AgentInbox>,
    busy: AtomicBool,
    waiting: Mutex<WaitingState>,
    call_stack: Mutex<CallStack>,
    variables: Mutex<VariableStore>,
    namespace: Mutex<HashMap<String, serde_json::Value>>,
    errors: Mutex<Vec<String>>,
    last_checkpoint: Mutex<Option<Checkpoint>>,
}

impl Agent {
    pub fn new(
        id: AgentId,
        klass: impl Into<String>,
        kind: AgentKind,
        bus: Arc<EventBus>,
        artifact_threshold: usize,
        inbox_capacity: Option<usize>,
    ) -> Self {
        let klass = klass.into();
        Agent {
            inbox: Arc::new(AgentInbox::with_capacity(id.clone(), inbox_capacity)),
            call_stack: Mutex::new(CallStack::new(id.clone(), Arc::clone(&bus))),
            variables: Mutex::new(VariableStore::new(id.clone(), bus, artifact_threshold)),
            id,
            klass,
            kind,
            delivery: DeliveryPreferences::default(),
            busy: AtomicBool::new(false),
            waiting: Mutex::new(WaitingState::default()),
            namespace: Mutex::new(HashMap::new()),
            errors: Mutex::new(Vec::new()),
            last_checkpoint: Mutex::new(None),
        }
    }

    /// Override delivery preferences (builder pattern).
    pub fn with_delivery(mut self, delivery: DeliveryPreferences) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn inbox(&self) -> &Arc<AgentInbox> {
        &self.inbox
    }

    pub fn is_human(&self) -> bool {
        self.kind == AgentKind::Human
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    pub fn waiting(&self) -> WaitingState {
        self.waiting.lock().unwrap().clone()
    }

    pub fn set_waiting(&self, mode: WaitingMode, timeout: Option<Duration>) {
        *self.waiting.lock().unwrap() = WaitingState { mode, timeout };
    }

    pub fn call_stack(&self) -> MutexGuard<'_, CallStack> {
        self.call_stack.lock().unwrap()
    }

    pub fn variables(&self) -> MutexGuard<'_, VariableStore> {
        self.variables.lock().unwrap()
    }

    pub fn namespace(&self) -> MutexGuard<'_, HashMap<String, serde_json::Value>> {
        self.namespace.lock().unwrap()
    }

    /// Record a non-fatal execution failure on this agent.
    pub fn record_error(&self, error: impl Into<String>) {
        self.errors.lock().unwrap().push(error.into());
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn set_last_checkpoint(&self, checkpoint: Checkpoint) {
        *self.last_checkpoint.lock().unwrap() = Some(checkpoint);
    }

    pub fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.last_checkpoint.lock().unwrap().clone()
    }

    /// The observable agent state: klass, kind, error count, and the busy
    /// flag under its well-known `_busy` key.
    pub fn state_snapshot(&self) -> HashMap<String, serde_json::Value> {
        let mut state = HashMap::new();
        state.insert(
            "_busy".to_string(),
            serde_json::Value::Bool(self.is_busy()),
        );
        state.insert(
            "klass".to_string(),
            serde_json::Value::String(self.klass.clone()),
        );
        state.insert(
            "kind".to_string(),
            serde_json::Value::String(
                match self.kind {
                    AgentKind::Ai => "ai",
                    AgentKind::Human => "human",
                }
                .to_string(),
            ),
        );
        let errors = self.errors.lock().unwrap();
        state.insert(
            "errors".to_string(),
            serde_json::json!(errors.iter().cloned().collect::<Vec<_>>()),
        );
        state
    }
}

/// Program-wide registry resolving agent ids to live agents.
///
/// Shared (as an `Arc`) between the program, its channels, and its router so
/// none of them need a back-pointer to the others.
pub struct AgentDirectory {
    agents: RwLock<HashMap<AgentId, Arc<Agent>>>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        AgentDirectory {
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, agent: Arc<Agent>) {
        self.agents.write().unwrap().insert(agent.id.clone(), agent);
    }

    pub fn get(&self, id: &AgentId) -> Option<Arc<Agent>> {
        self.agents.read().unwrap().get(id).cloned()
    }

    pub fn inbox(&self, id: &AgentId) -> Option<Arc<AgentInbox>> {
        self.get(id).map(|a| Arc::clone(a.inbox()))
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.read().unwrap().contains_key(id)
    }

    pub fn all(&self) -> Vec<Arc<Agent>> {
        self.agents.read().unwrap().values().cloned().collect()
    }

    pub fn by_klass(&self, klass: &str) -> Vec<Arc<Agent>> {
        self.agents
            .read()
            .unwrap()
            .values()
            .filter(|a| a.klass == klass)
            .cloned()
            .collect()
    }

    /// The well-known `"human"` agent if present, otherwise any human.
    pub fn default_human(&self) -> Option<Arc<Agent>> {
        let agents = self.agents.read().unwrap();
        if let Some(agent) = agents.get(&AgentId::human()) {
            return Some(Arc::clone(agent));
        }
        agents.values().find(|a| a.is_human()).cloned()
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AgentDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, klass: &str, kind: AgentKind) -> Agent {
        Agent::new(
            AgentId::new(id),
            klass,
            kind,
            Arc::new(EventBus::new("test")),
            1024,
            None,
        )
    }

    #[tokio::test]
    async fn busy_flag_shows_in_state_snapshot() {
        let a = agent("1000", "Assistant", AgentKind::Ai);
        assert_eq!(
            a.state_snapshot().get("_busy"),
            Some(&serde_json::Value::Bool(false))
        );

        a.set_busy(true);
        assert_eq!(
            a.state_snapshot().get("_busy"),
            Some(&serde_json::Value::Bool(true))
        );
    }

    #[tokio::test]
    async fn recorded_errors_appear_in_snapshot() {
        let a = agent("1000", "Assistant", AgentKind::Ai);
        a.record_error("effect failed: unknown agent 9999");

        let snapshot = a.state_snapshot();
        let errors = snapshot.get("errors").unwrap().as_array().unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn streaming_is_derived_from_channel_when_unset() {
        let streaming = DeliveryPreferences::default();
        assert!(streaming.streaming());

        let buffered = DeliveryPreferences::default().with_channel(DeliveryChannel::Buffered);
        assert!(!buffered.streaming());

        let forced = DeliveryPreferences::default()
            .with_channel(DeliveryChannel::Buffered)
            .with_streaming_enabled(true);
        assert!(forced.streaming());
    }

    #[tokio::test]
    async fn directory_resolves_default_human() {
        let dir = AgentDirectory::new();
        dir.insert(Arc::new(agent("1000", "Assistant", AgentKind::Ai)));
        assert!(dir.default_human().is_none());

        dir.insert(Arc::new(agent("human", "User", AgentKind::Human)));
        let human = dir.default_human().unwrap();
        assert_eq!(human.id, AgentId::human());
    }

    #[tokio::test]
    async fn directory_filters_by_klass() {
        let dir = AgentDirectory::new();
        dir.insert(Arc::new(agent("1000", "Accountant", AgentKind::Ai)));
        dir.insert(Arc::new(agent("1001", "Accountant", AgentKind::Ai)));
        dir.insert(Arc::new(agent("1002", "Lawyer", AgentKind::Ai)));

        assert_eq!(dir.by_klass("Accountant").len(), 2);
        assert_eq!(dir.by_klass("Lawyer").len(), 1);
        assert!(dir.by_klass("Doctor").is_empty());
    }
}
