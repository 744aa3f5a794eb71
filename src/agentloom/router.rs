//! Receiver specifications: the grammar that names message targets.
//!
//! ```text
//! spec     := targets
//! targets  := target ("," target)*
//! target   := "human"              the default human
//!           | "agent" SP ident     a specific agent by id, or a klass
//!           | "meeting" SP ident   broadcast to a meeting
//! ```
//!
//! Examples: `human`, `agent 1003`, `agent AccountantExpert`, `meeting 42`,
//! `meeting 42, agent 1001, agent 1004` (the trailing `agent` tokens become
//! the broadcast's `target_agent_ids`).
//!
//! Parsing is pure ([`parse_receiver_spec`]); resolution goes through an
//! [`AgentProvider`] so the router can ask the program for an existing
//! instance — or a fresh one when a klass has no idle instance — without
//! holding a back-pointer to it.

use crate::agentloom::agent::Agent;
use crate::agentloom::message::{AgentId, ChannelId, MeetingId};
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// One parsed target token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTarget {
    /// The well-known default human.
    Human,
    /// `agent <ident>`: an instance id or a klass name.
    Agent(String),
    /// `meeting <ident>`.
    Meeting(String),
}

/// Errors raised while parsing or resolving a receiver spec, or delivering
/// to the resolved targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// The spec text did not match the grammar.
    SpecParse(String),
    /// No agent instance or klass matched the identifier.
    UnknownAgent(String),
    /// No meeting with this id exists.
    UnknownMeeting(MeetingId),
    /// The target meeting has already ended.
    MeetingEnded(MeetingId),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::SpecParse(spec) => write!(f, "unparseable receiver spec: {:?}", spec),
            RouteError::UnknownAgent(ident) => write!(f, "unknown agent: {}", ident),
            RouteError::UnknownMeeting(id) => write!(f, "unknown meeting: {}", id),
            RouteError::MeetingEnded(id) => write!(f, "meeting {} has ended", id),
        }
    }
}

impl Error for RouteError {}

/// Outcome of a successful route: the channel used and who got the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResult {
    pub channel_id: ChannelId,
    pub delivered_to: Vec<AgentId>,
}

/// What a spec resolved to.
pub enum ResolvedTargets {
    /// One or more individual recipients.
    Direct(Vec<Arc<Agent>>),
    /// A meeting broadcast, optionally targeted at specific attendees.
    Meeting {
        meeting_id: MeetingId,
        target_agent_ids: Vec<AgentId>,
    },
}

/// The program-side lookups the router needs during resolution.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Existing instance by exact id.
    fn agent_by_id(&self, id: &AgentId) -> Option<Arc<Agent>>;
    /// The default human, if any humans exist.
    fn human_agent(&self) -> Option<Arc<Agent>>;
    /// An idle instance of `klass`, or a freshly created one.
    async fn idle_or_new(&self, klass: &str) -> Result<Arc<Agent>, RouteError>;
}

/// Parse a receiver spec into target tokens. Leading/trailing whitespace is
/// ignored throughout.
pub fn parse_receiver_spec(spec: &str) -> Result<Vec<RawTarget>, RouteError> {
    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Err(RouteError::SpecParse(spec.to_string()));
    }

    let mut targets = Vec::new();
    for token in trimmed.split(',') {
        let token = token.trim();
        if token == "human" {
            targets.push(RawTarget::Human);
        } else if let Some(ident) = token.strip_prefix("agent ") {
            let ident = ident.trim();
            if ident.is_empty() {
                return Err(RouteError::SpecParse(spec.to_string()));
            }
            targets.push(RawTarget::Agent(ident.to_string()));
        } else if let Some(ident) = token.strip_prefix("meeting ") {
            let ident = ident.trim();
            if ident.is_empty() {
                return Err(RouteError::SpecParse(spec.to_string()));
            }
            targets.push(RawTarget::Meeting(ident.to_string()));
        } else {
            return Err(RouteError::SpecParse(spec.to_string()));
        }
    }
    Ok(targets)
}

/// Resolve parsed targets against the live program.
///
/// A leading `meeting` token turns the whole spec into a meeting broadcast;
/// the remaining `agent` tokens become its `target_agent_ids`. Otherwise
/// every token must resolve to an individual recipient — `agent <ident>`
/// prefers an existing instance with that exact id and falls back to an
/// idle-or-new instance of the klass.
pub async fn resolve_targets(
    provider: &dyn AgentProvider,
    targets: &[RawTarget],
    spec: &str,
) -> Result<ResolvedTargets, RouteError> {
    if let Some(RawTarget::Meeting(meeting_ident)) = targets.first() {
        let mut target_agent_ids = Vec::new();
        for extra in &targets[1..] {
            match extra {
                RawTarget::Agent(ident) => {
                    let agent = resolve_agent(provider, ident).await?;
                    target_agent_ids.push(agent.id.clone());
                }
                RawTarget::Human => {
                    let human = provider
                        .human_agent()
                        .ok_or_else(|| RouteError::UnknownAgent("human".to_string()))?;
                    target_agent_ids.push(human.id.clone());
                }
                RawTarget::Meeting(_) => {
                    return Err(RouteError::SpecParse(spec.to_string()));
                }
            }
        }
        return Ok(ResolvedTargets::Meeting {
            meeting_id: MeetingId::new(meeting_ident.clone()),
            target_agent_ids,
        });
    }

    let mut recipients = Vec::new();
    for target in targets {
        match target {
            RawTarget::Human => {
                let human = provider
                    .human_agent()
                    .ok_or_else(|| RouteError::UnknownAgent("human".to_string()))?;
                recipients.push(human);
            }
            RawTarget::Agent(ident) => {
                recipients.push(resolve_agent(provider, ident).await?);
            }
            RawTarget::Meeting(_) => {
                // A meeting token anywhere but first is not in the grammar.
                return Err(RouteError::SpecParse(spec.to_string()));
            }
        }
    }
    Ok(ResolvedTargets::Direct(recipients))
}

async fn resolve_agent(
    provider: &dyn AgentProvider,
    ident: &str,
) -> Result<Arc<Agent>, RouteError> {
    if let Some(agent) = provider.agent_by_id(&AgentId::new(ident)) {
        return Ok(agent);
    }
    provider.idle_or_new(ident).await
}
