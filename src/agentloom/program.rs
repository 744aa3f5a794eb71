//! The program: top-level container and single long-lived root.
//!
//! A [`Program`] owns the event bus, the agent set, channels, meetings, and
//! active streams. Everything process-wide that a dynamic runtime would
//! stash in module globals — session ids, the default human, id counters —
//! lives here instead.
//!
//! # Lifecycle
//!
//! ```rust,no_run
//! use agentloom::program::{AgentDefinition, Program};
//! use agentloom::executor::{AgentExecutor, RunResult, ExecutorError};
//! use agentloom::agent::Agent;
//! use agentloom::message::{Message, MessageType};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct EchoExecutor;
//!
//! #[async_trait]
//! impl AgentExecutor for EchoExecutor {
//!     async fn run(
//!         &self,
//!         _agent: &Arc<Agent>,
//!         _messages: Vec<Message>,
//!     ) -> Result<RunResult, ExecutorError> {
//!         Ok(RunResult::default())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let program = Program::builder()
//!     .add_definition(AgentDefinition::ai("Assistant"))
//!     .with_executor(Arc::new(EchoExecutor))
//!     .build()
//!     .await;
//!
//! let assistant = program.create_agent("Assistant").await?;
//! program
//!     .route_message(&assistant.id, "Assistant", "human", "Hello!", MessageType::Direct)
//!     .await?;
//! program.stop("demo over", 0).await;
//! program.run_till_exit().await;
//! # Ok(())
//! # }
//! ```

use crate::agentloom::agent::{Agent, AgentDirectory, AgentKind, DeliveryPreferences};
use crate::agentloom::channel::{direct_channel_id, Channel, ChannelError, Participant};
use crate::agentloom::config::{exit_code, RuntimeConfig};
use crate::agentloom::event::{Event, EventBus, EventPayload};
use crate::agentloom::executor::AgentExecutor;
use crate::agentloom::meeting::{Meeting, MeetingError};
use crate::agentloom::message::{
    AgentId, ChannelId, Message, MeetingId, MessageType, Priority, StreamId,
};
use crate::agentloom::router::{
    parse_receiver_spec, resolve_targets, AgentProvider, ResolvedTargets, RouteError, RouteResult,
};
use crate::agentloom::runtime::{AgentRuntime, RuntimeExit};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// First id handed out to dynamically created agents.
const FIRST_AGENT_ID: u64 = 1000;

/// Errors surfaced by program operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramError {
    Route(RouteError),
    Meeting(MeetingError),
    Channel(ChannelError),
    /// `create_agent` was asked for a klass that was never defined.
    UnknownKlass(String),
    /// The program is shutting down.
    Stopped,
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramError::Route(e) => write!(f, "{}", e),
            ProgramError::Meeting(e) => write!(f, "{}", e),
            ProgramError::Channel(e) => write!(f, "{}", e),
            ProgramError::UnknownKlass(klass) => write!(f, "unknown agent klass: {}", klass),
            ProgramError::Stopped => write!(f, "program is stopping"),
        }
    }
}

impl Error for ProgramError {}

impl From<RouteError> for ProgramError {
    fn from(e: RouteError) -> Self {
        ProgramError::Route(e)
    }
}

impl From<MeetingError> for ProgramError {
    fn from(e: MeetingError) -> Self {
        match e {
            MeetingError::Ended(id) => ProgramError::Route(RouteError::MeetingEnded(id)),
            other => ProgramError::Meeting(other),
        }
    }
}

impl From<ChannelError> for ProgramError {
    fn from(e: ChannelError) -> Self {
        ProgramError::Channel(e)
    }
}

/// Compile-time description of one agent klass.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub klass: String,
    pub kind: AgentKind,
    pub description: String,
    pub delivery: Option<DeliveryPreferences>,
}

impl AgentDefinition {
    /// An AI klass driven by the program's executor.
    pub fn ai(klass: impl Into<String>) -> Self {
        AgentDefinition {
            klass: klass.into(),
            kind: AgentKind::Ai,
            description: String::new(),
            delivery: None,
        }
    }

    /// A human klass (declared with the `:Human` marker upstream).
    pub fn human(klass: impl Into<String>) -> Self {
        AgentDefinition {
            klass: klass.into(),
            kind: AgentKind::Human,
            description: String::new(),
            delivery: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryPreferences) -> Self {
        self.delivery = Some(delivery);
        self
    }
}

/// Outcome of [`Program::start_stream`]: whether fragments should actually
/// be pushed, and under which id.
#[derive(Debug, Clone)]
pub struct StreamDecision {
    pub should_stream: bool,
    pub stream_id: StreamId,
}

enum StreamRoute {
    /// Fragments flow through this channel.
    Live {
        channel: Arc<Channel>,
        recipient: Option<(AgentId, String)>,
    },
    /// Streaming was declined; only the final message is routed, to `spec`.
    Buffered { spec: String },
}

/// Builder for [`Program`].
pub struct ProgramBuilder {
    session_id: Option<String>,
    config: RuntimeConfig,
    definitions: Vec<AgentDefinition>,
    executor: Option<Arc<dyn AgentExecutor>>,
}

impl ProgramBuilder {
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn add_definition(mut self, definition: AgentDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn with_definitions(mut self, definitions: Vec<AgentDefinition>) -> Self {
        self.definitions.extend(definitions);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn AgentExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Wire the program: register klasses, instantiate declared humans (a
    /// default `User:Human` when none is declared; the first human gets the
    /// reserved id `"human"`).
    pub async fn build(self) -> Arc<Program> {
        let session_id = self
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let bus = Arc::new(
            EventBus::new(session_id.clone()).with_close_grace(self.config.bus_close_grace),
        );
        let executor = self
            .executor
            .clone()
            .expect("ProgramBuilder requires an executor (with_executor)");

        let mut definitions: HashMap<String, AgentDefinition> = HashMap::new();
        for def in &self.definitions {
            definitions.insert(def.klass.clone(), def.clone());
        }
        if !definitions.values().any(|d| d.kind == AgentKind::Human) {
            definitions.insert("User".to_string(), AgentDefinition::human("User"));
        }

        let (cancel_tx, _) = watch::channel(false);
        let program = Arc::new_cyclic(|weak: &Weak<Program>| Program {
            session_id,
            config: self.config,
            bus,
            directory: Arc::new(AgentDirectory::new()),
            definitions: Mutex::new(definitions),
            executor,
            channels: Mutex::new(HashMap::new()),
            meetings: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_agent_id: AtomicU64::new(FIRST_AGENT_ID),
            create_lock: tokio::sync::Mutex::new(()),
            cancel_tx,
            runtimes: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
            terminated_published: AtomicBool::new(false),
            exit: Mutex::new(None),
            self_ref: weak.clone(),
        });

        // Humans exist from the start; AI agents are created on demand.
        let human_klasses: Vec<String> = {
            let defs = program.definitions.lock().unwrap();
            defs.values()
                .filter(|d| d.kind == AgentKind::Human)
                .map(|d| d.klass.clone())
                .collect()
        };
        for klass in human_klasses {
            let _ = program.create_agent(&klass).await;
        }

        program
    }
}

/// Top-level container owning the bus, agents, channels, and meetings.
pub struct Program {
    session_id: String,
    config: RuntimeConfig,
    bus: Arc<EventBus>,
    directory: Arc<AgentDirectory>,
    definitions: Mutex<HashMap<String, AgentDefinition>>,
    executor: Arc<dyn AgentExecutor>,
    channels: Mutex<HashMap<ChannelId, Arc<Channel>>>,
    meetings: Mutex<HashMap<MeetingId, Arc<Meeting>>>,
    streams: Mutex<HashMap<StreamId, StreamRoute>>,
    next_agent_id: AtomicU64,
    /// Serializes instance scans in `get_or_create_agent` with creation.
    create_lock: tokio::sync::Mutex<()>,
    cancel_tx: watch::Sender<bool>,
    runtimes: Mutex<Vec<(AgentId, JoinHandle<RuntimeExit>)>>,
    stopping: AtomicBool,
    terminated_published: AtomicBool,
    exit: Mutex<Option<(String, i32)>>,
    self_ref: Weak<Program>,
}

impl Program {
    pub fn builder() -> ProgramBuilder {
        ProgramBuilder {
            session_id: None,
            config: RuntimeConfig::default(),
            definitions: Vec::new(),
            executor: None,
        }
    }

    fn arc(&self) -> Arc<Program> {
        self.self_ref.upgrade().expect("program alive")
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn directory(&self) -> &Arc<AgentDirectory> {
        &self.directory
    }

    pub fn executor(&self) -> &Arc<dyn AgentExecutor> {
        &self.executor
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn agent(&self, id: &AgentId) -> Option<Arc<Agent>> {
        self.directory.get(id)
    }

    pub fn meeting(&self, id: &MeetingId) -> Option<Arc<Meeting>> {
        self.meetings.lock().unwrap().get(id).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    /// Instantiate a new agent of `klass` and (for AI agents) start its
    /// runtime loop.
    pub async fn create_agent(&self, klass: &str) -> Result<Arc<Agent>, ProgramError> {
        if self.is_stopping() {
            return Err(ProgramError::Stopped);
        }
        let definition = self
            .definitions
            .lock()
            .unwrap()
            .get(klass)
            .cloned()
            .ok_or_else(|| ProgramError::UnknownKlass(klass.to_string()))?;

        let id = match definition.kind {
            AgentKind::Human if self.directory.default_human().is_none() => AgentId::human(),
            _ => AgentId::new(
                self.next_agent_id
                    .fetch_add(1, Ordering::SeqCst)
                    .to_string(),
            ),
        };

        let agent = Arc::new(
            Agent::new(
                id,
                definition.klass.clone(),
                definition.kind,
                Arc::clone(&self.bus),
                self.config.artifact_threshold,
                self.config.inbox_capacity,
            )
            .with_delivery(definition.delivery.clone().unwrap_or_default()),
        );
        self.directory.insert(Arc::clone(&agent));

        let _ = self
            .bus
            .publish(Event::agent(
                agent.id.clone(),
                EventPayload::AgentStarted {
                    klass: agent.klass.clone(),
                    name: agent.id.as_str().to_string(),
                },
            ))
            .await;

        if definition.kind == AgentKind::Ai {
            let runtime = AgentRuntime::new(
                self.arc(),
                Arc::clone(&agent),
                self.cancel_tx.subscribe(),
            );
            let handle = tokio::spawn(runtime.run());
            self.runtimes
                .lock()
                .unwrap()
                .push((agent.id.clone(), handle));
        }

        Ok(agent)
    }

    /// An idle instance of `klass`, or a fresh one when every instance is
    /// busy. Scans and creation are serialized under a single program-wide
    /// lock; an idle instance is picked at random so repeated callers spread
    /// across the pool.
    pub async fn get_or_create_agent(&self, klass: &str) -> Result<Arc<Agent>, ProgramError> {
        let _guard = self.create_lock.lock().await;
        let idle: Vec<Arc<Agent>> = self
            .directory
            .by_klass(klass)
            .into_iter()
            .filter(|a| !a.is_busy())
            .collect();
        if !idle.is_empty() {
            let pick = rand::thread_rng().gen_range(0..idle.len());
            return Ok(Arc::clone(&idle[pick]));
        }
        self.create_agent(klass).await
    }

    /// The direct channel for the unordered pair `{a, b}`, created on first
    /// use. `get_or_create_channel(a, b)` and `get_or_create_channel(b, a)`
    /// always return the same channel.
    pub async fn get_or_create_channel(
        &self,
        a: &AgentId,
        b: &AgentId,
    ) -> Result<Arc<Channel>, ProgramError> {
        let a_agent = self.directory.get(a);
        let b_agent = self.directory.get(b);
        let a_participant = a_agent
            .as_ref()
            .map(|agent| Participant::from_agent(agent))
            .ok_or_else(|| ProgramError::Route(RouteError::UnknownAgent(a.to_string())))?;
        let b_participant = b_agent
            .as_ref()
            .map(|agent| Participant::from_agent(agent))
            .ok_or_else(|| ProgramError::Route(RouteError::UnknownAgent(b.to_string())))?;
        Ok(self
            .direct_channel(a_participant, b_participant)
            .await)
    }

    async fn direct_channel(&self, a: Participant, b: Participant) -> Arc<Channel> {
        let id = direct_channel_id(a.id(), b.id());
        let (channel, created) = {
            let mut channels = self.channels.lock().unwrap();
            match channels.get(&id) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let channel = Arc::new(Channel::new(
                        id.clone(),
                        vec![a, b],
                        Arc::clone(&self.directory),
                        Arc::clone(&self.bus),
                        false,
                    ));
                    channels.insert(id.clone(), Arc::clone(&channel));
                    (channel, true)
                }
            }
        };
        if created {
            let participant_ids = channel.participants().iter().map(|p| p.id().clone()).collect();
            let _ = self
                .bus
                .publish(Event::program(EventPayload::ChannelCreated {
                    channel_id: id,
                    is_meeting: false,
                    participant_ids,
                }))
                .await;
        }
        channel
    }

    fn sender_participant(&self, sender_id: &AgentId, sender_klass: &str) -> Participant {
        match self.directory.get(sender_id) {
            Some(agent) => Participant::from_agent(&agent),
            // Senders outside the directory (e.g. an external surface) are
            // treated as plain agents for channel membership purposes.
            None => Participant::Agent {
                id: sender_id.clone(),
                klass: sender_klass.to_string(),
            },
        }
    }

    /// Parse `receiver_spec`, resolve its targets, and deliver `content`.
    pub async fn route_message(
        &self,
        sender_id: &AgentId,
        sender_klass: &str,
        receiver_spec: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<RouteResult, ProgramError> {
        let targets = parse_receiver_spec(receiver_spec)?;
        let resolved = resolve_targets(self, &targets, receiver_spec).await?;

        match resolved {
            ResolvedTargets::Direct(recipients) => {
                let mut delivered_to = Vec::new();
                let mut channel_id = None;
                for recipient in recipients {
                    let channel = self
                        .direct_channel(
                            self.sender_participant(sender_id, sender_klass),
                            Participant::from_agent(&recipient),
                        )
                        .await;
                    let mut message = Message::direct(
                        sender_id.clone(),
                        sender_klass,
                        recipient.id.clone(),
                        recipient.klass.clone(),
                        content,
                    );
                    message.message_type = message_type;
                    if channel.deliver_to(&recipient.id, message, Priority::Normal) {
                        delivered_to.push(recipient.id.clone());
                    }
                    channel_id = Some(channel.id().clone());
                }
                Ok(RouteResult {
                    channel_id: channel_id.expect("direct resolution is non-empty"),
                    delivered_to,
                })
            }
            ResolvedTargets::Meeting {
                meeting_id,
                target_agent_ids,
            } => {
                let meeting = self
                    .meeting(&meeting_id)
                    .ok_or(RouteError::UnknownMeeting(meeting_id.clone()))?;
                let message = Message::meeting_broadcast(
                    sender_id.clone(),
                    sender_klass,
                    meeting_id,
                    content,
                    target_agent_ids.iter().cloned().collect::<HashSet<_>>(),
                );
                meeting.broadcast(message)?;
                let delivered_to = meeting
                    .joined_attendees()
                    .into_iter()
                    .filter(|id| id != sender_id)
                    .collect();
                Ok(RouteResult {
                    channel_id: meeting.channel().id().clone(),
                    delivered_to,
                })
            }
        }
    }

    /// Create a meeting owned by `owner` and deliver `MeetingInvite`
    /// messages to every invitee.
    pub async fn create_meeting(
        &self,
        owner: &Arc<Agent>,
        meeting_id: MeetingId,
        invitees: Vec<AgentId>,
    ) -> Result<Arc<Meeting>, ProgramError> {
        let channel_id = ChannelId::new(format!("meeting-{}", meeting_id));
        let channel = Arc::new(Channel::new(
            channel_id.clone(),
            vec![Participant::from_agent(owner)],
            Arc::clone(&self.directory),
            Arc::clone(&self.bus),
            true,
        ));
        self.channels
            .lock()
            .unwrap()
            .insert(channel_id.clone(), Arc::clone(&channel));
        let _ = self
            .bus
            .publish(Event::agent(
                owner.id.clone(),
                EventPayload::ChannelCreated {
                    channel_id,
                    is_meeting: true,
                    participant_ids: vec![owner.id.clone()],
                },
            ))
            .await;

        let meeting = Arc::new(Meeting::new(
            meeting_id.clone(),
            owner.id.clone(),
            owner.klass.clone(),
            channel,
            invitees.iter().cloned().collect(),
            Arc::clone(&self.directory),
            self.config.meeting_rolling_timeout,
            self.config.meeting_max_batch_wait,
            self.config.deliver_final_to_muted,
        ));
        self.meetings
            .lock()
            .unwrap()
            .insert(meeting_id.clone(), Arc::clone(&meeting));

        for invitee in invitees {
            if let Some(agent) = self.directory.get(&invitee) {
                let invite = Message::meeting_invite(
                    owner.id.clone(),
                    owner.klass.clone(),
                    agent.id.clone(),
                    agent.klass.clone(),
                    meeting_id.clone(),
                    format!(
                        "{} invited you to meeting {}. Join to participate.",
                        owner.klass, meeting_id
                    ),
                );
                let _ = agent.inbox().put(invite, Priority::Normal);
            } else {
                log::warn!("meeting {}: invitee {} does not exist", meeting_id, invitee);
            }
        }

        Ok(meeting)
    }

    /// Accept a pending invitation on behalf of `agent`.
    pub async fn join_meeting(
        &self,
        agent: &Arc<Agent>,
        meeting_id: &MeetingId,
    ) -> Result<(), ProgramError> {
        let meeting = self
            .meeting(meeting_id)
            .ok_or(RouteError::UnknownMeeting(meeting_id.clone()))?;
        meeting.mark_joined(Participant::from_agent(agent))?;
        Ok(())
    }

    /// End a meeting on behalf of `agent` (owner only).
    pub async fn end_meeting(
        &self,
        agent: &Arc<Agent>,
        meeting_id: &MeetingId,
    ) -> Result<(), ProgramError> {
        let meeting = self
            .meeting(meeting_id)
            .ok_or(RouteError::UnknownMeeting(meeting_id.clone()))?;
        meeting.end(&agent.id).await?;
        Ok(())
    }

    /// Decide whether a stream toward `receiver_spec` should actually push
    /// fragments: streaming is on iff at least one resolved recipient is a
    /// human with streaming enabled. Either way the stream id is registered
    /// so chunk/complete effects know where to go.
    pub async fn start_stream(
        &self,
        sender_id: &AgentId,
        sender_klass: &str,
        receiver_spec: &str,
        stream_id: StreamId,
    ) -> Result<StreamDecision, ProgramError> {
        let targets = parse_receiver_spec(receiver_spec)?;
        let resolved = resolve_targets(self, &targets, receiver_spec).await?;

        match resolved {
            ResolvedTargets::Direct(recipients) => {
                let streaming_human = recipients
                    .iter()
                    .find(|r| r.is_human() && r.delivery.streaming())
                    .cloned();
                match streaming_human {
                    Some(recipient) => {
                        let channel = self
                            .direct_channel(
                                self.sender_participant(sender_id, sender_klass),
                                Participant::from_agent(&recipient),
                            )
                            .await;
                        channel
                            .start_stream(
                                stream_id.clone(),
                                sender_id.clone(),
                                Some(recipient.id.clone()),
                            )
                            .await?;
                        self.streams.lock().unwrap().insert(
                            stream_id.clone(),
                            StreamRoute::Live {
                                channel,
                                recipient: Some((recipient.id.clone(), recipient.klass.clone())),
                            },
                        );
                        Ok(StreamDecision {
                            should_stream: true,
                            stream_id,
                        })
                    }
                    None => {
                        self.streams.lock().unwrap().insert(
                            stream_id.clone(),
                            StreamRoute::Buffered {
                                spec: receiver_spec.to_string(),
                            },
                        );
                        Ok(StreamDecision {
                            should_stream: false,
                            stream_id,
                        })
                    }
                }
            }
            ResolvedTargets::Meeting { meeting_id, .. } => {
                let meeting = self
                    .meeting(&meeting_id)
                    .ok_or(RouteError::UnknownMeeting(meeting_id.clone()))?;
                let should_stream = meeting.joined_attendees().iter().any(|id| {
                    self.directory
                        .get(id)
                        .map(|a| a.is_human() && a.delivery.streaming())
                        .unwrap_or(false)
                });
                if should_stream {
                    let channel = Arc::clone(meeting.channel());
                    channel
                        .start_stream(stream_id.clone(), sender_id.clone(), None)
                        .await?;
                    self.streams.lock().unwrap().insert(
                        stream_id.clone(),
                        StreamRoute::Live {
                            channel,
                            recipient: None,
                        },
                    );
                } else {
                    self.streams.lock().unwrap().insert(
                        stream_id.clone(),
                        StreamRoute::Buffered {
                            spec: receiver_spec.to_string(),
                        },
                    );
                }
                Ok(StreamDecision {
                    should_stream,
                    stream_id,
                })
            }
        }
    }

    /// Push a fragment of a registered stream. No-op for streams where
    /// streaming was declined.
    pub async fn stream_chunk(
        &self,
        stream_id: &StreamId,
        chunk: &str,
    ) -> Result<(), ProgramError> {
        let route = {
            let streams = self.streams.lock().unwrap();
            match streams.get(stream_id) {
                Some(StreamRoute::Live { channel, .. }) => Some(Arc::clone(channel)),
                Some(StreamRoute::Buffered { .. }) => None,
                None => return Err(ChannelError::BadStreamState(stream_id.clone()).into()),
            }
        };
        if let Some(channel) = route {
            channel.stream_chunk(stream_id, chunk).await?;
        }
        Ok(())
    }

    /// Complete a registered stream. Live streams close through their
    /// channel (which delivers the final message to buffered recipients);
    /// declined streams route the final content as an ordinary message.
    pub async fn complete_stream(
        &self,
        sender_id: &AgentId,
        sender_klass: &str,
        stream_id: &StreamId,
        final_content: &str,
    ) -> Result<(), ProgramError> {
        let route = {
            let mut streams = self.streams.lock().unwrap();
            streams
                .remove(stream_id)
                .ok_or_else(|| ChannelError::BadStreamState(stream_id.clone()))?
        };
        match route {
            StreamRoute::Live { channel, recipient } => {
                let final_message = match &recipient {
                    Some((recipient_id, recipient_klass)) => Message::direct(
                        sender_id.clone(),
                        sender_klass,
                        recipient_id.clone(),
                        recipient_klass.clone(),
                        final_content,
                    ),
                    None => {
                        let mut message = Message::direct(
                            sender_id.clone(),
                            sender_klass,
                            sender_id.clone(),
                            sender_klass,
                            final_content,
                        );
                        message.recipient_id = None;
                        message.recipient_klass = None;
                        message
                    }
                };
                channel.complete_stream(stream_id, final_message).await?;
            }
            StreamRoute::Buffered { spec } => {
                self.route_message(
                    sender_id,
                    sender_klass,
                    &spec,
                    final_content,
                    MessageType::Direct,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Abort a registered live stream.
    pub async fn abort_stream(
        &self,
        stream_id: &StreamId,
        reason: &str,
    ) -> Result<(), ProgramError> {
        let route = {
            let mut streams = self.streams.lock().unwrap();
            streams
                .remove(stream_id)
                .ok_or_else(|| ChannelError::BadStreamState(stream_id.clone()))?
        };
        if let StreamRoute::Live { channel, .. } = route {
            channel.abort_stream(stream_id, reason).await?;
        }
        Ok(())
    }

    /// Broadcast cancellation: runtimes exit between batches, meetings end,
    /// inboxes close. Idempotent.
    pub async fn stop(&self, reason: &str, code: i32) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.exit.lock().unwrap() = Some((reason.to_string(), code));
        let _ = self.cancel_tx.send(true);

        let meetings: Vec<Arc<Meeting>> =
            self.meetings.lock().unwrap().values().cloned().collect();
        for meeting in meetings {
            meeting.end_for_shutdown().await;
        }

        for agent in self.directory.all() {
            agent.inbox().close();
        }
    }

    async fn publish_terminated(&self, reason: &str, code: i32) {
        if self.terminated_published.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .bus
            .publish(Event::program(EventPayload::ProgramTerminated {
                reason: reason.to_string(),
                exit_code: code,
            }))
            .await;
    }

    /// Block until every runtime exits, publish `ProgramTerminated`, close
    /// the bus, and return the exit code.
    pub async fn run_till_exit(&self) -> i32 {
        let mut errored = 0usize;
        let mut total = 0usize;
        loop {
            let batch: Vec<(AgentId, JoinHandle<RuntimeExit>)> = {
                let mut runtimes = self.runtimes.lock().unwrap();
                if runtimes.is_empty() {
                    break;
                }
                runtimes.drain(..).collect()
            };
            for (agent_id, handle) in batch {
                total += 1;
                match handle.await {
                    Ok(RuntimeExit::Error) => errored += 1,
                    Ok(_) => {}
                    Err(err) => {
                        log::error!("runtime task for agent {} failed: {}", agent_id, err);
                        errored += 1;
                    }
                }
            }
            // Agents created while we were joining land in the next pass.
        }

        let (reason, mut code) = self
            .exit
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| ("finished".to_string(), exit_code::SUCCESS));
        // A lone crashed agent (or a full wipe-out) fails the run.
        if errored > 0 && errored == total && code == exit_code::SUCCESS {
            code = exit_code::ERROR;
        }
        self.publish_terminated(&reason, code).await;
        self.bus.close().await;
        code
    }
}

#[async_trait]
impl AgentProvider for Program {
    fn agent_by_id(&self, id: &AgentId) -> Option<Arc<Agent>> {
        self.directory.get(id)
    }

    fn human_agent(&self) -> Option<Arc<Agent>> {
        self.directory.default_human()
    }

    async fn idle_or_new(&self, klass: &str) -> Result<Arc<Agent>, RouteError> {
        self.get_or_create_agent(klass)
            .await
            .map_err(|_| RouteError::UnknownAgent(klass.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentloom::executor::{ExecutorError, RunResult};
    use crate::agentloom::inbox::MessagePredicate;
    use crate::agentloom::runtime::WaitingMode;
    use std::time::Duration;

    /// Executor test double: records every batch it is handed and otherwise
    /// does nothing.
    struct RecordingExecutor {
        received: Mutex<Vec<(AgentId, Vec<String>)>>,
    }

    impl RecordingExecutor {
        fn new() -> Arc<Self> {
            Arc::new(RecordingExecutor {
                received: Mutex::new(Vec::new()),
            })
        }

        fn received_for(&self, agent_id: &AgentId) -> Vec<String> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == agent_id)
                .flat_map(|(_, contents)| contents.clone())
                .collect()
        }
    }

    #[async_trait]
    impl crate::agentloom::executor::AgentExecutor for RecordingExecutor {
        async fn run(
            &self,
            agent: &Arc<Agent>,
            messages: Vec<Message>,
        ) -> Result<RunResult, ExecutorError> {
            self.received.lock().unwrap().push((
                agent.id.clone(),
                messages.iter().map(|m| m.content.clone()).collect(),
            ));
            Ok(RunResult::default())
        }
    }

    async fn program_with(executor: Arc<RecordingExecutor>) -> Arc<Program> {
        Program::builder()
            .with_session_id("test-session")
            .add_definition(AgentDefinition::ai("Requester"))
            .add_definition(AgentDefinition::ai("Responder"))
            .with_executor(executor)
            .build()
            .await
    }

    #[tokio::test]
    async fn default_human_is_created_when_none_declared() {
        let program = program_with(RecordingExecutor::new()).await;
        let human = program.directory().default_human().unwrap();
        assert_eq!(human.id, AgentId::human());
        assert_eq!(human.klass, "User");
    }

    #[tokio::test]
    async fn agent_ids_start_at_1000() {
        let program = program_with(RecordingExecutor::new()).await;
        let a = program.create_agent("Requester").await.unwrap();
        let b = program.create_agent("Responder").await.unwrap();
        assert_eq!(a.id.as_str(), "1000");
        assert_eq!(b.id.as_str(), "1001");

        assert!(matches!(
            program.create_agent("Nonexistent").await,
            Err(ProgramError::UnknownKlass(_))
        ));
        program.stop("test over", 0).await;
        program.run_till_exit().await;
    }

    #[tokio::test]
    async fn direct_message_round_trip() {
        let executor = RecordingExecutor::new();
        let program = program_with(Arc::clone(&executor)).await;
        let a = program.create_agent("Requester").await.unwrap();
        let b = program.create_agent("Responder").await.unwrap();

        // A waits on B; the route below must not wake A.
        a.set_waiting(WaitingMode::WaitForAgent(b.id.clone()), None);

        let result = program
            .route_message(
                &a.id,
                "Requester",
                &format!("agent {}", b.id),
                "hello",
                MessageType::Direct,
            )
            .await
            .unwrap();

        assert_eq!(result.delivered_to, vec![b.id.clone()]);
        assert_eq!(program.channel_count(), 1);

        // B's runtime consumes the message and hands it to the executor.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(executor.received_for(&b.id), vec!["hello"]);
        assert_eq!(a.inbox().len(), 0);

        program.stop("test over", 0).await;
        program.run_till_exit().await;
    }

    #[tokio::test]
    async fn channel_for_a_pair_is_unique_and_symmetric() {
        let program = program_with(RecordingExecutor::new()).await;
        let a = program.create_agent("Requester").await.unwrap();
        let b = program.create_agent("Responder").await.unwrap();

        let ab = program.get_or_create_channel(&a.id, &b.id).await.unwrap();
        let ba = program.get_or_create_channel(&b.id, &a.id).await.unwrap();
        assert_eq!(ab.id(), ba.id());
        assert!(Arc::ptr_eq(&ab, &ba));
        assert_eq!(program.channel_count(), 1);

        program.stop("test over", 0).await;
        program.run_till_exit().await;
    }

    #[tokio::test]
    async fn get_or_create_prefers_an_idle_instance() {
        let program = program_with(RecordingExecutor::new()).await;
        let first = program.create_agent("Requester").await.unwrap();
        let second = program.create_agent("Requester").await.unwrap();

        first.set_busy(true);
        let picked = program.get_or_create_agent("Requester").await.unwrap();
        assert_eq!(picked.id, second.id);

        // Every instance busy: a new one is created.
        second.set_busy(true);
        let created = program.get_or_create_agent("Requester").await.unwrap();
        assert_ne!(created.id, first.id);
        assert_ne!(created.id, second.id);

        program.stop("test over", 0).await;
        program.run_till_exit().await;
    }

    #[tokio::test]
    async fn routing_by_klass_reuses_or_creates() {
        let executor = RecordingExecutor::new();
        let program = program_with(Arc::clone(&executor)).await;
        let sender = program.create_agent("Requester").await.unwrap();

        // No Responder instance exists; routing by klass creates one.
        let result = program
            .route_message(
                &sender.id,
                "Requester",
                "agent Responder",
                "ping",
                MessageType::Direct,
            )
            .await
            .unwrap();
        assert_eq!(result.delivered_to.len(), 1);
        assert_eq!(program.directory().by_klass("Responder").len(), 1);

        program.stop("test over", 0).await;
        program.run_till_exit().await;
    }

    #[tokio::test]
    async fn unparseable_spec_and_unknown_meeting_are_errors() {
        let program = program_with(RecordingExecutor::new()).await;
        let sender = program.create_agent("Requester").await.unwrap();

        assert!(matches!(
            program
                .route_message(&sender.id, "Requester", "nonsense", "x", MessageType::Direct)
                .await,
            Err(ProgramError::Route(RouteError::SpecParse(_)))
        ));
        assert!(matches!(
            program
                .route_message(&sender.id, "Requester", "meeting 42", "x", MessageType::Direct)
                .await,
            Err(ProgramError::Route(RouteError::UnknownMeeting(_)))
        ));

        program.stop("test over", 0).await;
        program.run_till_exit().await;
    }

    #[tokio::test]
    async fn meeting_creation_delivers_invites() {
        let executor = RecordingExecutor::new();
        let program = program_with(Arc::clone(&executor)).await;
        let owner = program.create_agent("Requester").await.unwrap();
        let invitee = program.create_agent("Responder").await.unwrap();

        // Park the invitee so its runtime holds the invite for us to observe.
        invitee.set_waiting(WaitingMode::WaitForUser, None);

        let meeting = program
            .create_meeting(&owner, MeetingId::new("42"), vec![invitee.id.clone()])
            .await
            .unwrap();
        assert_eq!(meeting.owner_id(), &owner.id);

        // Invitations always break through the waiting mode.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let received = executor.received_for(&invitee.id);
        assert_eq!(received.len(), 1);
        assert!(received[0].contains("invited you to meeting 42"));

        program.stop("test over", 0).await;
        program.run_till_exit().await;
    }

    #[tokio::test]
    async fn ended_meeting_is_rejected_by_routing() {
        let program = program_with(RecordingExecutor::new()).await;
        let owner = program.create_agent("Requester").await.unwrap();
        let invitee = program.create_agent("Responder").await.unwrap();

        let meeting = program
            .create_meeting(&owner, MeetingId::new("42"), vec![invitee.id.clone()])
            .await
            .unwrap();
        program.join_meeting(&invitee, meeting.id()).await.unwrap();
        program.end_meeting(&owner, meeting.id()).await.unwrap();

        assert!(matches!(
            program
                .route_message(&owner.id, "Requester", "meeting 42", "late", MessageType::Direct)
                .await,
            Err(ProgramError::Route(RouteError::MeetingEnded(_)))
        ));

        program.stop("test over", 0).await;
        program.run_till_exit().await;
    }

    #[tokio::test]
    async fn stream_decision_follows_human_preferences() {
        let executor = RecordingExecutor::new();
        let program = Program::builder()
            .with_session_id("test-session")
            .add_definition(AgentDefinition::ai("Assistant"))
            .add_definition(
                AgentDefinition::human("User").with_delivery(
                    DeliveryPreferences::default()
                        .with_channel(crate::agentloom::agent::DeliveryChannel::Buffered),
                ),
            )
            .with_executor(executor)
            .build()
            .await;
        let assistant = program.create_agent("Assistant").await.unwrap();

        // Buffered human: streaming declined, final content routed whole.
        let decision = program
            .start_stream(
                &assistant.id,
                "Assistant",
                "human",
                StreamId::new("s1"),
            )
            .await
            .unwrap();
        assert!(!decision.should_stream);

        // Chunks are tolerated as no-ops on a declined stream.
        program.stream_chunk(&StreamId::new("s1"), "partial").await.unwrap();
        program
            .complete_stream(&assistant.id, "Assistant", &StreamId::new("s1"), "full text")
            .await
            .unwrap();

        let human = program.directory().default_human().unwrap();
        assert_eq!(human.inbox().len(), 1);
        let pred: Option<MessagePredicate> = None;
        assert_eq!(human.inbox().peek(pred).unwrap().content, "full text");

        // Completing twice is an error: the stream is gone.
        assert!(matches!(
            program
                .complete_stream(&assistant.id, "Assistant", &StreamId::new("s1"), "again")
                .await,
            Err(ProgramError::Channel(ChannelError::BadStreamState(_)))
        ));

        program.stop("test over", 0).await;
        program.run_till_exit().await;
    }

    #[tokio::test]
    async fn streaming_human_gets_fragments_not_duplicates() {
        let executor = RecordingExecutor::new();
        let program = Program::builder()
            .with_session_id("test-session")
            .add_definition(AgentDefinition::ai("Assistant"))
            .with_executor(executor)
            .build()
            .await;
        let assistant = program.create_agent("Assistant").await.unwrap();

        let decision = program
            .start_stream(
                &assistant.id,
                "Assistant",
                "human",
                StreamId::new("s2"),
            )
            .await
            .unwrap();
        assert!(decision.should_stream);

        program.stream_chunk(&StreamId::new("s2"), "Hello ").await.unwrap();
        program.stream_chunk(&StreamId::new("s2"), "world").await.unwrap();
        program
            .complete_stream(&assistant.id, "Assistant", &StreamId::new("s2"), "Hello world")
            .await
            .unwrap();

        // The streaming human watched the fragments; no buffered duplicate.
        let human = program.directory().default_human().unwrap();
        assert_eq!(human.inbox().len(), 0);

        program.stop("test over", 0).await;
        program.run_till_exit().await;
    }

    #[tokio::test]
    async fn stop_produces_exit_code_and_terminated_event() {
        use crate::agentloom::event::{EventHandler, EventKind, Topic};

        struct TerminationWatch {
            seen: Mutex<Option<i32>>,
        }

        #[async_trait]
        impl EventHandler for TerminationWatch {
            async fn on_event(&self, event: &Event) {
                if let EventPayload::ProgramTerminated { exit_code, .. } = &event.payload {
                    *self.seen.lock().unwrap() = Some(*exit_code);
                }
            }
        }

        let program = program_with(RecordingExecutor::new()).await;
        let watch = Arc::new(TerminationWatch {
            seen: Mutex::new(None),
        });
        program
            .bus()
            .subscribe(Topic::Kind(EventKind::ProgramTerminated), watch.clone() as _)
            .unwrap();

        let _agent = program.create_agent("Requester").await.unwrap();
        program.stop("operator request", 7).await;
        let code = program.run_till_exit().await;

        assert_eq!(code, 7);
        assert_eq!(*watch.seen.lock().unwrap(), Some(7));
    }
}
