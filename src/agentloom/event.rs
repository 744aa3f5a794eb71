//! Runtime event system.
//!
//! Provides the typed pub/sub layer that ties observers — debuggers, UIs,
//! transcript recorders — to everything the runtime does: agent lifecycle,
//! call-stack movement, variable updates, channel creation, and streaming
//! output.
//!
//! # Architecture
//!
//! Events are a single tagged union, [`EventPayload`], wrapped in an
//! [`Event`] envelope carrying the session id, originating agent, and
//! timestamp. Subscriptions are keyed by [`Topic`]: either one
//! [`EventKind`] or [`Topic::All`] for a wildcard feed.
//!
//! [`EventBus::publish`] dispatches to a snapshot of the subscriber set, so
//! handlers may subscribe or unsubscribe mid-dispatch without affecting the
//! in-flight publication. Handlers for one event run concurrently with each
//! other, and `publish` returns only after every one of them has terminated;
//! a panicking handler is logged and isolated, never taking its siblings
//! down with it.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentloom::event::{Event, EventBus, EventHandler, EventKind, EventPayload, Topic};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_event(&self, event: &Event) {
//!         println!("[{}] {:?}", event.session_id, event.payload.kind());
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = EventBus::new("session-1");
//! bus.subscribe(Topic::All, Arc::new(Printer))?;
//! bus.publish(Event::program(EventPayload::ProgramTerminated {
//!     reason: "done".to_string(),
//!     exit_code: 0,
//! }))
//! .await?;
//! bus.close().await;
//! # Ok(())
//! # }
//! ```

use crate::agentloom::call_stack::InstructionPointer;
use crate::agentloom::message::{AgentId, ChannelId, Message, StreamId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;

/// How long [`EventBus::close`] waits for in-flight handler tasks to wind
/// down before dropping them.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// The payload of a runtime event.
///
/// Variants mirror everything observers can watch: agent lifecycle,
/// execution position, variables, channels, and streams. Every variant is
/// cheap to clone; large values travel as already-rendered strings or
/// [`serde_json::Value`]s.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // ── Agent lifecycle ──────────────────────────────────────────────────
    /// An agent instance was created and its runtime loop started.
    AgentStarted { klass: String, name: String },
    /// An agent's runtime loop exited. `reason` is `"finished"`, `"error"`,
    /// or `"cancelled"`.
    AgentStopped { reason: String },
    /// An agent was paused by a debugger or operator.
    AgentPaused {
        reason: String,
        line: String,
        step: String,
    },
    /// A previously paused agent resumed execution.
    AgentResumed,
    /// The agent's runtime advanced one scheduling step.
    AgentStep { mode: String },

    // ── Execution position ───────────────────────────────────────────────
    /// A call frame was pushed. Carries the new frame's pointer and a
    /// snapshot of the whole stack.
    CallStackPush {
        frame: InstructionPointer,
        stack: Vec<InstructionPointer>,
    },
    /// A call frame was popped.
    CallStackPop {
        frame: InstructionPointer,
        stack: Vec<InstructionPointer>,
    },
    /// The instruction pointer of the topmost frame moved.
    InstructionPointerMoved {
        pointer: InstructionPointer,
        stack: Vec<InstructionPointer>,
    },
    /// A playbook invocation began.
    PlaybookStart { name: String },
    /// A playbook invocation returned.
    PlaybookEnd {
        name: String,
        return_value: serde_json::Value,
        depth: usize,
    },

    // ── State ────────────────────────────────────────────────────────────
    /// A variable was written. Artifact values are rendered as
    /// `"Artifact: <summary>"` rather than inlined.
    VariableUpdate {
        name: String,
        value: serde_json::Value,
    },

    // ── Channels & streams ───────────────────────────────────────────────
    /// A channel came into existence.
    ChannelCreated {
        channel_id: ChannelId,
        is_meeting: bool,
        participant_ids: Vec<AgentId>,
    },
    /// A stream was opened on a channel.
    StreamStarted {
        stream_id: StreamId,
        channel_id: ChannelId,
        sender_id: AgentId,
        recipient_id: Option<AgentId>,
    },
    /// One fragment of an open stream. `seq` starts at 0 and increases by
    /// one per chunk of the same stream.
    StreamChunked {
        stream_id: StreamId,
        seq: u64,
        chunk: String,
        recipient_id: Option<AgentId>,
    },
    /// A stream completed; `final_message` is the assembled message that is
    /// also delivered to buffered recipients.
    StreamCompleted {
        stream_id: StreamId,
        final_message: Message,
        recipient_id: Option<AgentId>,
    },

    // ── Tooling ──────────────────────────────────────────────────────────
    /// A debugger breakpoint was hit.
    BreakpointHit {
        file_path: String,
        line_number: u32,
        source_line_number: u32,
    },
    /// One source line finished executing.
    LineExecuted {
        step: String,
        source_line_number: u32,
        text: String,
        file_path: String,
        line_number: u32,
    },
    /// The external compiler produced a compiled program.
    CompiledProgram {
        compiled_file_path: String,
        content: String,
        original_file_paths: Vec<String>,
    },

    // ── Program ──────────────────────────────────────────────────────────
    /// The whole program terminated.
    ProgramTerminated { reason: String, exit_code: i32 },
}

/// Field-less discriminant of [`EventPayload`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AgentStarted,
    AgentStopped,
    AgentPaused,
    AgentResumed,
    AgentStep,
    CallStackPush,
    CallStackPop,
    InstructionPointerMoved,
    PlaybookStart,
    PlaybookEnd,
    VariableUpdate,
    ChannelCreated,
    StreamStarted,
    StreamChunked,
    StreamCompleted,
    BreakpointHit,
    LineExecuted,
    CompiledProgram,
    ProgramTerminated,
}

impl EventPayload {
    /// The subscription key this payload dispatches under.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::AgentStarted { .. } => EventKind::AgentStarted,
            EventPayload::AgentStopped { .. } => EventKind::AgentStopped,
            EventPayload::AgentPaused { .. } => EventKind::AgentPaused,
            EventPayload::AgentResumed => EventKind::AgentResumed,
            EventPayload::AgentStep { .. } => EventKind::AgentStep,
            EventPayload::CallStackPush { .. } => EventKind::CallStackPush,
            EventPayload::CallStackPop { .. } => EventKind::CallStackPop,
            EventPayload::InstructionPointerMoved { .. } => EventKind::InstructionPointerMoved,
            EventPayload::PlaybookStart { .. } => EventKind::PlaybookStart,
            EventPayload::PlaybookEnd { .. } => EventKind::PlaybookEnd,
            EventPayload::VariableUpdate { .. } => EventKind::VariableUpdate,
            EventPayload::ChannelCreated { .. } => EventKind::ChannelCreated,
            EventPayload::StreamStarted { .. } => EventKind::StreamStarted,
            EventPayload::StreamChunked { .. } => EventKind::StreamChunked,
            EventPayload::StreamCompleted { .. } => EventKind::StreamCompleted,
            EventPayload::BreakpointHit { .. } => EventKind::BreakpointHit,
            EventPayload::LineExecuted { .. } => EventKind::LineExecuted,
            EventPayload::CompiledProgram { .. } => EventKind::CompiledProgram,
            EventPayload::ProgramTerminated { .. } => EventKind::ProgramTerminated,
        }
    }
}

/// Envelope published on the bus: payload plus session, source agent, and
/// timestamp. The session id is stamped by the bus at publish time.
#[derive(Debug, Clone)]
pub struct Event {
    pub session_id: String,
    /// Agent this event originated from; `None` for program-level events.
    pub agent_id: Option<AgentId>,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    /// An event attributed to a specific agent.
    pub fn agent(agent_id: AgentId, payload: EventPayload) -> Self {
        Event {
            session_id: String::new(),
            agent_id: Some(agent_id),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// A program-level event with no originating agent.
    pub fn program(payload: EventPayload) -> Self {
        Event {
            session_id: String::new(),
            agent_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Subscription selector: one event kind, or everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Kind(EventKind),
    All,
}

/// Trait for receiving runtime events.
///
/// Handlers are shared as `Arc<dyn EventHandler>`; the same `Arc` value is
/// the identity used by [`EventBus::unsubscribe`]. Handlers run on their own
/// tasks, so internal state needs its own synchronization.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: &Event);
}

/// Errors surfaced by the [`EventBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus is shutting down; no new subscriptions or publications.
    Closing,
    /// The handler was not registered under the given topic.
    NotSubscribed,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Closing => write!(f, "event bus is closing"),
            BusError::NotSubscribed => write!(f, "handler not subscribed to this topic"),
        }
    }
}

impl Error for BusError {}

/// Typed pub/sub event bus with wildcard subscriptions, handler error
/// isolation, and graceful shutdown.
pub struct EventBus {
    session_id: String,
    close_grace: Duration,
    subscribers: Mutex<HashMap<Topic, Vec<Arc<dyn EventHandler>>>>,
    active: Mutex<HashMap<u64, AbortHandle>>,
    next_task_id: AtomicU64,
    closing: AtomicBool,
}

impl EventBus {
    pub fn new(session_id: impl Into<String>) -> Self {
        EventBus {
            session_id: session_id.into(),
            close_grace: DEFAULT_CLOSE_GRACE,
            subscribers: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            next_task_id: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        }
    }

    /// Override the close grace window (builder pattern). Mostly useful in
    /// tests that exercise shutdown.
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Register `handler` for events matching `topic`.
    ///
    /// Wildcard ([`Topic::All`]) handlers receive every event, after the
    /// kind-specific handlers are collected into the same dispatch set.
    pub fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>) -> Result<(), BusError> {
        if self.is_closing() {
            return Err(BusError::Closing);
        }
        let mut subs = self.subscribers.lock().unwrap();
        subs.entry(topic).or_insert_with(Vec::new).push(handler);
        Ok(())
    }

    /// Remove a previously registered handler.
    ///
    /// Identity is the `Arc` itself ([`Arc::ptr_eq`]); passing a different
    /// allocation of an equivalent handler yields [`BusError::NotSubscribed`].
    pub fn unsubscribe(
        &self,
        topic: Topic,
        handler: &Arc<dyn EventHandler>,
    ) -> Result<(), BusError> {
        let mut subs = self.subscribers.lock().unwrap();
        let list = subs.get_mut(&topic).ok_or(BusError::NotSubscribed)?;
        let pos = list
            .iter()
            .position(|h| Arc::ptr_eq(h, handler))
            .ok_or(BusError::NotSubscribed)?;
        list.remove(pos);
        if list.is_empty() {
            subs.remove(&topic);
        }
        Ok(())
    }

    /// Drop all subscribers, or only those under `topic`.
    pub fn clear_subscribers(&self, topic: Option<Topic>) {
        let mut subs = self.subscribers.lock().unwrap();
        match topic {
            Some(t) => {
                subs.remove(&t);
            }
            None => subs.clear(),
        }
    }

    /// Number of handlers registered per topic.
    pub fn subscriber_count(&self) -> HashMap<Topic, usize> {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|(t, hs)| (*t, hs.len()))
            .collect()
    }

    /// Publish `event` to every matching subscriber and wait for all of them
    /// to finish.
    ///
    /// The dispatch set is snapshotted up front, so subscription changes made
    /// by handlers (or anyone else) during the dispatch do not affect it.
    /// Handler panics are logged with the event kind and isolated from
    /// sibling handlers.
    pub async fn publish(&self, event: Event) -> Result<(), BusError> {
        if self.is_closing() {
            return Err(BusError::Closing);
        }

        let mut event = event;
        event.session_id = self.session_id.clone();
        let kind = event.payload.kind();

        let handlers: Vec<Arc<dyn EventHandler>> = {
            let subs = self.subscribers.lock().unwrap();
            let mut list = Vec::new();
            if let Some(specific) = subs.get(&Topic::Kind(kind)) {
                list.extend(specific.iter().cloned());
            }
            if let Some(wildcard) = subs.get(&Topic::All) {
                list.extend(wildcard.iter().cloned());
            }
            list
        };

        if handlers.is_empty() {
            return Ok(());
        }

        let event = Arc::new(event);
        let mut joins = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let ev = Arc::clone(&event);
            let task = tokio::spawn(async move { handler.on_event(&ev).await });
            let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
            self.active.lock().unwrap().insert(id, task.abort_handle());
            joins.push((id, task));
        }

        for (id, task) in joins {
            if let Err(err) = task.await {
                if err.is_panic() {
                    log::error!("event handler panicked while handling {:?}: {}", kind, err);
                }
                // Aborted tasks (bus closing) need no report.
            }
            self.active.lock().unwrap().remove(&id);
        }

        Ok(())
    }

    /// Shut the bus down: reject new work, cancel in-flight handler tasks,
    /// and wait up to the close grace for them to drain.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);

        let handles: Vec<AbortHandle> = self.active.lock().unwrap().values().cloned().collect();
        for handle in handles {
            handle.abort();
        }

        let deadline = tokio::time::Instant::now() + self.close_grace;
        loop {
            let remaining = self.active.lock().unwrap().len();
            if remaining == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                log::warn!(
                    "event bus close grace elapsed with {} handler task(s) still active",
                    remaining
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.clear_subscribers(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    struct Recorder {
        seen: Mutex<Vec<EventKind>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn kinds(&self) -> Vec<EventKind> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn on_event(&self, event: &Event) {
            self.seen.lock().unwrap().push(event.payload.kind());
        }
    }

    struct Panicker;

    #[async_trait]
    impl EventHandler for Panicker {
        async fn on_event(&self, _event: &Event) {
            panic!("handler blew up");
        }
    }

    struct SlowCounter {
        count: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for SlowCounter {
        async fn on_event(&self, _event: &Event) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn terminated() -> Event {
        Event::program(EventPayload::ProgramTerminated {
            reason: "test".to_string(),
            exit_code: 0,
        })
    }

    #[tokio::test]
    async fn specific_and_wildcard_subscribers_both_fire() {
        let bus = EventBus::new("s1");
        let specific = Recorder::new();
        let wildcard = Recorder::new();

        bus.subscribe(
            Topic::Kind(EventKind::ProgramTerminated),
            specific.clone() as Arc<dyn EventHandler>,
        )
        .unwrap();
        bus.subscribe(Topic::All, wildcard.clone() as Arc<dyn EventHandler>)
            .unwrap();

        bus.publish(terminated()).await.unwrap();

        assert_eq!(specific.kinds(), vec![EventKind::ProgramTerminated]);
        assert_eq!(wildcard.kinds(), vec![EventKind::ProgramTerminated]);
    }

    #[tokio::test]
    async fn non_matching_kind_is_not_delivered() {
        let bus = EventBus::new("s1");
        let recorder = Recorder::new();
        bus.subscribe(
            Topic::Kind(EventKind::AgentStarted),
            recorder.clone() as Arc<dyn EventHandler>,
        )
        .unwrap();

        bus.publish(terminated()).await.unwrap();

        assert!(recorder.kinds().is_empty());
    }

    #[tokio::test]
    async fn publish_stamps_session_id() {
        struct SessionCheck {
            seen: Mutex<Option<String>>,
        }

        #[async_trait]
        impl EventHandler for SessionCheck {
            async fn on_event(&self, event: &Event) {
                *self.seen.lock().unwrap() = Some(event.session_id.clone());
            }
        }

        let bus = EventBus::new("session-42");
        let check = Arc::new(SessionCheck {
            seen: Mutex::new(None),
        });
        bus.subscribe(Topic::All, check.clone() as Arc<dyn EventHandler>)
            .unwrap();

        bus.publish(terminated()).await.unwrap();

        assert_eq!(check.seen.lock().unwrap().as_deref(), Some("session-42"));
    }

    #[tokio::test]
    async fn unsubscribe_removes_handler_and_rejects_unknown() {
        let bus = EventBus::new("s1");
        let recorder = Recorder::new();
        let handler: Arc<dyn EventHandler> = recorder.clone();

        bus.subscribe(Topic::All, handler.clone()).unwrap();
        bus.unsubscribe(Topic::All, &handler).unwrap();

        bus.publish(terminated()).await.unwrap();
        assert!(recorder.kinds().is_empty());

        assert_eq!(
            bus.unsubscribe(Topic::All, &handler),
            Err(BusError::NotSubscribed)
        );
        let other: Arc<dyn EventHandler> = Recorder::new();
        assert_eq!(
            bus.unsubscribe(Topic::Kind(EventKind::AgentStarted), &other),
            Err(BusError::NotSubscribed)
        );
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated_from_siblings() {
        init_logging();
        let bus = EventBus::new("s1");
        let recorder = Recorder::new();

        bus.subscribe(Topic::All, Arc::new(Panicker) as Arc<dyn EventHandler>)
            .unwrap();
        bus.subscribe(Topic::All, recorder.clone() as Arc<dyn EventHandler>)
            .unwrap();

        // Publish succeeds and the sibling handler still runs.
        bus.publish(terminated()).await.unwrap();
        assert_eq!(recorder.kinds(), vec![EventKind::ProgramTerminated]);
    }

    #[tokio::test]
    async fn publish_waits_for_all_handlers() {
        let bus = EventBus::new("s1");
        let counter = Arc::new(SlowCounter {
            count: AtomicUsize::new(0),
        });
        bus.subscribe(Topic::All, counter.clone() as Arc<dyn EventHandler>)
            .unwrap();

        bus.publish(terminated()).await.unwrap();

        // The handler must have completed before publish returned.
        assert_eq!(counter.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_bus_rejects_publish_and_subscribe() {
        let bus = EventBus::new("s1").with_close_grace(Duration::from_millis(100));
        bus.close().await;

        assert_eq!(bus.publish(terminated()).await, Err(BusError::Closing));
        assert_eq!(
            bus.subscribe(Topic::All, Recorder::new() as Arc<dyn EventHandler>)
                .err(),
            Some(BusError::Closing)
        );
    }

    #[tokio::test]
    async fn close_clears_subscribers() {
        let bus = EventBus::new("s1").with_close_grace(Duration::from_millis(100));
        bus.subscribe(Topic::All, Recorder::new() as Arc<dyn EventHandler>)
            .unwrap();
        assert_eq!(bus.subscriber_count().get(&Topic::All), Some(&1));

        bus.close().await;
        assert!(bus.subscriber_count().is_empty());
    }
}
