//! Per-agent scheduling loop.
//!
//! Each AI agent runs one [`AgentRuntime`] on its own task. The loop pulls
//! a batch from the agent's inbox under the current waiting-mode predicate,
//! marks the agent busy, hands the batch to the external
//! [`AgentExecutor`](crate::agentloom::executor::AgentExecutor), and applies
//! the returned effects in order. Cross-agent interaction happens only
//! through inboxes, channels, and the event bus — never shared state — so
//! the loop body needs no locking of its own.
//!
//! # Progressive timeouts
//!
//! When an agent yields waiting on a specific peer and the wait times out,
//! the wait is *not* dropped. The runtime sweeps up any interrupt messages
//! that arrived during the window and delivers them to the executor along
//! with a synthetic notification — "Agent B hasn't replied in 5 seconds. To
//! continue waiting, call Yield(B) again." — so the executor decides
//! whether to keep waiting, give up, or answer the interrupt. A reply that
//! lands after the timeout is served by the next `Yield` toward that peer;
//! nothing is lost.

use crate::agentloom::agent::Agent;
use crate::agentloom::call_stack::ContextMessage;
use crate::agentloom::event::{Event, EventPayload};
use crate::agentloom::executor::{Effect, ExecutorError, RunResult};
use crate::agentloom::inbox::{InboxError, MessagePredicate};
use crate::agentloom::message::{AgentId, MeetingId, Message, MessageType, Priority};
use crate::agentloom::program::Program;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Fallback wait used when the agent has no explicit waiting timeout;
/// effectively "forever", re-entered once a day.
const IDLE_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// The predicate an agent's runtime uses to filter inbox reads at a yield
/// point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitingMode {
    /// Accept anything.
    NotWaiting,
    /// Accept a direct message from this agent, any meeting invitation, or
    /// a high-priority interrupt.
    WaitForAgent(AgentId),
    /// Accept traffic of this meeting, or a direct message targeting us.
    WaitForMeeting(MeetingId),
    /// Accept a direct message from the human.
    WaitForUser,
}

impl WaitingMode {
    /// Whether `message` satisfies this waiting mode for agent `self_id`.
    pub fn accepts(&self, message: &Message, self_id: &AgentId) -> bool {
        // Meeting invitations always break through.
        if message.message_type == MessageType::MeetingInvite {
            return true;
        }
        match self {
            WaitingMode::NotWaiting => true,
            WaitingMode::WaitForAgent(target) => {
                (message.message_type == MessageType::Direct && &message.sender_id == target)
                    || message.priority == Priority::High
            }
            WaitingMode::WaitForMeeting(meeting_id) => {
                let meeting_traffic = matches!(
                    message.message_type,
                    MessageType::MeetingBroadcast | MessageType::MeetingEnd
                ) && message.meeting_id.as_ref() == Some(meeting_id);
                meeting_traffic
                    || (message.message_type == MessageType::Direct && message.concerns(self_id))
            }
            WaitingMode::WaitForUser => {
                message.message_type == MessageType::Direct && message.sender_id.is_human()
            }
        }
    }

    /// An inbox predicate for this mode, or `None` when everything matches.
    pub fn predicate(&self, self_id: &AgentId) -> Option<MessagePredicate> {
        if *self == WaitingMode::NotWaiting {
            return None;
        }
        let mode = self.clone();
        let self_id = self_id.clone();
        Some(Arc::new(move |m: &Message| mode.accepts(m, &self_id)))
    }
}

/// Why a runtime loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeExit {
    /// Inbox drained after close, or the executor ended the program.
    Finished,
    /// The program's cancellation signal fired.
    Cancelled,
    /// A fatal executor failure (after retries).
    Error,
}

impl RuntimeExit {
    fn reason(self) -> &'static str {
        match self {
            RuntimeExit::Finished => "finished",
            RuntimeExit::Cancelled => "cancelled",
            RuntimeExit::Error => "error",
        }
    }
}

/// The scheduling loop for one AI agent.
pub struct AgentRuntime {
    program: Arc<Program>,
    agent: Arc<Agent>,
    cancel: watch::Receiver<bool>,
}

impl AgentRuntime {
    pub fn new(program: Arc<Program>, agent: Arc<Agent>, cancel: watch::Receiver<bool>) -> Self {
        AgentRuntime {
            program,
            agent,
            cancel,
        }
    }

    /// Drive the agent until shutdown, fatal error, or program end.
    pub async fn run(mut self) -> RuntimeExit {
        let exit = self.run_loop().await;
        let _ = self
            .program
            .bus()
            .publish(Event::agent(
                self.agent.id.clone(),
                EventPayload::AgentStopped {
                    reason: exit.reason().to_string(),
                },
            ))
            .await;
        exit
    }

    async fn run_loop(&mut self) -> RuntimeExit {
        loop {
            if *self.cancel.borrow() {
                return RuntimeExit::Cancelled;
            }

            let waiting = self.agent.waiting();
            let predicate = waiting.mode.predicate(&self.agent.id);
            let timeout = waiting.timeout.unwrap_or(IDLE_WAIT);

            let batch = tokio::select! {
                _ = self.cancel.changed() => return RuntimeExit::Cancelled,
                result = self
                    .agent
                    .inbox()
                    .get_batch(predicate, usize::MAX, 1, timeout) => result,
            };

            let messages = match batch {
                Ok(messages) => messages,
                Err(InboxError::ClosedAndEmpty) => return RuntimeExit::Finished,
                Err(err) => {
                    log::error!("agent {}: inbox failure: {}", self.agent.id, err);
                    return RuntimeExit::Error;
                }
            };

            let turn_input = if messages.is_empty() {
                // Timed out. Only a wait on a specific peer escalates to the
                // executor; other modes just keep waiting.
                match &waiting.mode {
                    WaitingMode::WaitForAgent(target) => {
                        let elapsed = waiting
                            .timeout
                            .unwrap_or(self.program.config().agent_wait_timeout);
                        self.timeout_notification(target, elapsed)
                    }
                    _ => continue,
                }
            } else {
                messages
            };

            let _ = self
                .program
                .bus()
                .publish(Event::agent(
                    self.agent.id.clone(),
                    EventPayload::AgentStep {
                        mode: format!("{:?}", waiting.mode),
                    },
                ))
                .await;

            self.agent.set_busy(true);
            // The executor re-yields if it wants to keep waiting.
            self.agent.set_waiting(WaitingMode::NotWaiting, None);

            let outcome = self.run_executor(turn_input).await;
            match outcome {
                Ok(result) => {
                    if let Err(failure) = self.apply_effects(&result).await {
                        log::warn!("agent {}: {}", self.agent.id, failure);
                        self.agent.record_error(failure);
                    }
                    self.agent.set_busy(false);
                    if result.ends_program {
                        self.program
                            .stop("program ended", crate::agentloom::config::exit_code::SUCCESS)
                            .await;
                        return RuntimeExit::Finished;
                    }
                }
                Err(failure) => {
                    log::error!("agent {}: executor failed: {}", self.agent.id, failure);
                    self.agent.record_error(failure);
                    self.agent.set_busy(false);
                    return RuntimeExit::Error;
                }
            }
        }
    }

    /// Build the progressive-timeout turn: swept-up interrupts plus the
    /// synthetic notification about the silent peer.
    fn timeout_notification(&self, target: &AgentId, elapsed: Duration) -> Vec<Message> {
        let interrupt_pred: MessagePredicate =
            Arc::new(|m: &Message| m.message_type == MessageType::Direct);
        let mut turn = self.agent.inbox().drain_matching(Some(interrupt_pred));

        let secs = elapsed.as_secs_f64();
        let rendered_secs = if secs.fract() == 0.0 {
            format!("{}", secs as u64)
        } else {
            format!("{:.1}", secs)
        };
        turn.push(Message::system(
            self.agent.id.clone(),
            format!(
                "Agent {target} hasn't replied in {secs} seconds. \
                 To continue waiting, call Yield({target}) again.",
                target = target,
                secs = rendered_secs,
            ),
        ));
        turn
    }

    /// Call the executor, retrying transient failures with exponential
    /// backoff. Exhaustion turns the last transient failure fatal.
    async fn run_executor(&self, messages: Vec<Message>) -> Result<RunResult, String> {
        let config = self.program.config();
        let max_attempts = config.executor_max_attempts.max(1);
        let mut delay = config.executor_backoff_base;

        for attempt in 1..=max_attempts {
            match self
                .program
                .executor()
                .run(&self.agent, messages.clone())
                .await
            {
                Ok(result) => return Ok(result),
                Err(ExecutorError::Transient(reason)) if attempt < max_attempts => {
                    log::warn!(
                        "agent {}: transient executor failure (attempt {}/{}): {}",
                        self.agent.id,
                        attempt,
                        max_attempts,
                        reason
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(ExecutorError::Transient(reason)) => {
                    return Err(format!(
                        "executor failed after {} attempts: {}",
                        max_attempts, reason
                    ));
                }
                Err(ExecutorError::Fatal(reason)) => return Err(reason),
            }
        }
        unreachable!("retry loop always returns");
    }

    /// Apply the turn's effects in order. The first failure discards the
    /// remaining effects.
    async fn apply_effects(&self, result: &RunResult) -> Result<(), String> {
        for effect in &result.effects {
            self.apply_effect(effect)
                .await
                .map_err(|e| format!("effect failed: {}", e))?;
        }
        Ok(())
    }

    async fn apply_effect(&self, effect: &Effect) -> Result<(), String> {
        let agent = &self.agent;
        match effect {
            Effect::Say { target, content } => {
                let route = self
                    .program
                    .route_message(&agent.id, &agent.klass, target, content, MessageType::Direct)
                    .await
                    .map_err(|e| e.to_string())?;
                agent.call_stack().add_message_to_parent(ContextMessage::Text(
                    format!("Said to {}: {}", target, content),
                ));
                agent
                    .variables()
                    .set_last_result(serde_json::json!({
                        "channel_id": route.channel_id.as_str(),
                        "delivered_to": route
                            .delivered_to
                            .iter()
                            .map(|id| id.as_str().to_string())
                            .collect::<Vec<_>>(),
                    }));
                Ok(())
            }
            Effect::SendMessage {
                target,
                content,
                message_type,
            } => {
                let route = self
                    .program
                    .route_message(&agent.id, &agent.klass, target, content, *message_type)
                    .await
                    .map_err(|e| e.to_string())?;
                agent
                    .variables()
                    .set_last_result(serde_json::json!({
                        "channel_id": route.channel_id.as_str(),
                        "delivered_to": route
                            .delivered_to
                            .iter()
                            .map(|id| id.as_str().to_string())
                            .collect::<Vec<_>>(),
                    }));
                Ok(())
            }
            Effect::StartStream { target, stream_id } => {
                let decision = self
                    .program
                    .start_stream(&agent.id, &agent.klass, target, stream_id.clone())
                    .await
                    .map_err(|e| e.to_string())?;
                agent
                    .variables()
                    .set_last_result(serde_json::json!({
                        "stream_id": decision.stream_id.as_str(),
                        "should_stream": decision.should_stream,
                    }));
                Ok(())
            }
            Effect::StreamChunk { stream_id, chunk } => self
                .program
                .stream_chunk(stream_id, chunk)
                .await
                .map_err(|e| e.to_string()),
            Effect::CompleteStream {
                stream_id,
                final_content,
            } => {
                self.program
                    .complete_stream(&agent.id, &agent.klass, stream_id, final_content)
                    .await
                    .map_err(|e| e.to_string())?;
                agent
                    .variables()
                    .set_last_result(serde_json::Value::String(final_content.clone()));
                Ok(())
            }
            Effect::Yield { mode } => {
                let timeout = match mode {
                    WaitingMode::WaitForAgent(_) => {
                        Some(self.program.config().agent_wait_timeout)
                    }
                    _ => None,
                };
                agent.set_waiting(mode.clone(), timeout);
                Ok(())
            }
            Effect::CreateMeeting {
                meeting_id,
                participants,
            } => {
                self.program
                    .create_meeting(agent, meeting_id.clone(), participants.clone())
                    .await
                    .map_err(|e| e.to_string())?;
                agent
                    .variables()
                    .set_last_result(serde_json::Value::String(meeting_id.as_str().to_string()));
                Ok(())
            }
            Effect::JoinMeeting { meeting_id } => self
                .program
                .join_meeting(agent, meeting_id)
                .await
                .map_err(|e| e.to_string()),
            Effect::EndMeeting { meeting_id } => self
                .program
                .end_meeting(agent, meeting_id)
                .await
                .map_err(|e| e.to_string()),
            Effect::SetVariable { name, value } => {
                let display = {
                    let mut variables = agent.variables();
                    variables.set(name.clone(), value.clone()).display_value()
                };
                agent.variables().set_last_result(display);
                Ok(())
            }
            Effect::Checkpoint { record } => {
                agent.set_last_checkpoint(record.clone());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentloom::executor::AgentExecutor;
    use crate::agentloom::message::Priority;
    use crate::agentloom::program::{AgentDefinition, Program};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn direct(sender: &str, recipient: &str, content: &str) -> Message {
        Message::direct(
            AgentId::new(sender),
            "TestAgent",
            AgentId::new(recipient),
            "TestAgent",
            content,
        )
    }

    #[test]
    fn waiting_mode_predicates_match_the_table() {
        let me = AgentId::new("1000");
        let peer = AgentId::new("1001");
        let other = AgentId::new("1002");
        let meeting = MeetingId::new("m1");

        // NotWaiting accepts anything.
        assert!(WaitingMode::NotWaiting.accepts(&direct("1002", "1000", "x"), &me));

        // WaitForAgent: direct from the peer, invites, high-priority.
        let wait_peer = WaitingMode::WaitForAgent(peer.clone());
        assert!(wait_peer.accepts(&direct("1001", "1000", "reply"), &me));
        assert!(!wait_peer.accepts(&direct("1002", "1000", "noise"), &me));
        let invite = Message::meeting_invite(
            other.clone(),
            "TestAgent",
            me.clone(),
            "TestAgent",
            meeting.clone(),
            "join us",
        );
        assert!(wait_peer.accepts(&invite, &me));
        let urgent = direct("1002", "1000", "now!").with_priority(Priority::High);
        assert!(wait_peer.accepts(&urgent, &me));

        // WaitForMeeting: that meeting's traffic, or direct aimed at us.
        let wait_meeting = WaitingMode::WaitForMeeting(meeting.clone());
        let broadcast = Message::meeting_broadcast(
            other.clone(),
            "TestAgent",
            meeting.clone(),
            "update",
            HashSet::new(),
        );
        assert!(wait_meeting.accepts(&broadcast, &me));
        let other_meeting = Message::meeting_broadcast(
            other.clone(),
            "TestAgent",
            MeetingId::new("m2"),
            "update",
            HashSet::new(),
        );
        assert!(!wait_meeting.accepts(&other_meeting, &me));
        assert!(wait_meeting.accepts(&direct("1002", "1000", "psst"), &me));

        // WaitForUser: only direct messages from the human.
        let wait_user = WaitingMode::WaitForUser;
        assert!(wait_user.accepts(&direct("human", "1000", "hello"), &me));
        assert!(!wait_user.accepts(&direct("1001", "1000", "hello"), &me));
    }

    /// Executor that parks the agent waiting on a peer, recording every
    /// turn's message contents.
    struct YieldingExecutor {
        wait_for: AgentId,
        turns: Mutex<Vec<Vec<String>>>,
    }

    impl YieldingExecutor {
        fn new(wait_for: AgentId) -> Arc<Self> {
            Arc::new(YieldingExecutor {
                wait_for,
                turns: Mutex::new(Vec::new()),
            })
        }

        fn turns(&self) -> Vec<Vec<String>> {
            self.turns.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentExecutor for YieldingExecutor {
        async fn run(
            &self,
            _agent: &Arc<Agent>,
            messages: Vec<Message>,
        ) -> Result<RunResult, ExecutorError> {
            self.turns
                .lock()
                .unwrap()
                .push(messages.iter().map(|m| m.content.clone()).collect());
            Ok(RunResult::new(vec![Effect::Yield {
                mode: WaitingMode::WaitForAgent(self.wait_for.clone()),
            }]))
        }
    }

    #[tokio::test]
    async fn progressive_timeout_notifies_and_preserves_late_reply() {
        let requester_klass = AgentDefinition::ai("Requester");
        let responder_klass = AgentDefinition::ai("Responder");

        // The responder never runs (we drive its side by hand), so only the
        // requester gets a scripted executor.
        let executor = YieldingExecutor::new(AgentId::new("1001"));
        let program = Program::builder()
            .with_session_id("timeout-test")
            .with_config(crate::agentloom::config::RuntimeConfig {
                agent_wait_timeout: Duration::from_millis(300),
                ..Default::default()
            })
            .add_definition(requester_klass)
            .add_definition(responder_klass)
            .with_executor(Arc::clone(&executor) as Arc<dyn AgentExecutor>)
            .build()
            .await;

        let requester = program.create_agent("Requester").await.unwrap();
        let responder_id = AgentId::new("1001");

        // Kick the requester: one message makes its executor yield on 1001.
        requester
            .inbox()
            .put(direct("human", "1000", "ask 1001 for the rate"), Priority::Normal)
            .unwrap();

        // Wait out the first turn plus one progressive timeout (~300 ms).
        tokio::time::sleep(Duration::from_millis(600)).await;

        let turns = executor.turns();
        assert!(turns.len() >= 2, "expected kick turn + timeout turn");
        let timeout_turn = &turns[1];
        let notification = timeout_turn.last().unwrap();
        assert!(
            notification.contains("hasn't replied in"),
            "unexpected notification: {}",
            notification
        );
        assert!(notification.contains("1001"));
        assert!(notification.contains("Yield"));

        // The late reply arrives after the timeout fired...
        program
            .route_message(
                &responder_id,
                "Responder",
                &format!("agent {}", requester.id),
                "15%",
                MessageType::Direct,
            )
            .await
            .unwrap();

        // ...and the next Yield-driven turn delivers it. No messages lost.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let turns = executor.turns();
        let last_turn = turns.last().unwrap();
        assert!(
            last_turn.iter().any(|c| c == "15%"),
            "late reply missing from turns: {:?}",
            turns
        );

        program.stop("test over", 0).await;
        program.run_till_exit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn default_wait_is_five_seconds_and_says_so() {
        let executor = YieldingExecutor::new(AgentId::new("1001"));
        let program = Program::builder()
            .with_session_id("default-timeout-test")
            .add_definition(AgentDefinition::ai("Requester"))
            .with_executor(Arc::clone(&executor) as Arc<dyn AgentExecutor>)
            .build()
            .await;

        let requester = program.create_agent("Requester").await.unwrap();
        requester
            .inbox()
            .put(direct("human", "1000", "kick"), Priority::Normal)
            .unwrap();

        // Paused clock: the 5 s default wait elapses without wall time.
        tokio::time::sleep(Duration::from_secs(6)).await;

        let turns = executor.turns();
        let notification = turns
            .iter()
            .flatten()
            .find(|c| c.contains("hasn't replied"))
            .expect("timeout notification missing");
        assert!(notification.contains("hasn't replied in 5 seconds"));
        assert!(notification.contains("1001"));

        program.stop("test over", 0).await;
        program.run_till_exit().await;
    }

    #[tokio::test]
    async fn interrupts_ride_along_with_the_timeout_notification() {
        let executor = YieldingExecutor::new(AgentId::new("1001"));
        let program = Program::builder()
            .with_session_id("interrupt-test")
            .with_config(crate::agentloom::config::RuntimeConfig {
                agent_wait_timeout: Duration::from_millis(300),
                ..Default::default()
            })
            .add_definition(AgentDefinition::ai("Requester"))
            .with_executor(Arc::clone(&executor) as Arc<dyn AgentExecutor>)
            .build()
            .await;

        let requester = program.create_agent("Requester").await.unwrap();
        requester
            .inbox()
            .put(direct("human", "1000", "kick"), Priority::Normal)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // While waiting on 1001, the human interjects. Normal-priority
        // direct chatter from others does not match the wait predicate, so
        // it is held for the timeout sweep.
        requester
            .inbox()
            .put(
                direct("human", "1000", "Are you still there?"),
                Priority::Normal,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        let turns = executor.turns();
        let timeout_turn = turns.last().unwrap();
        assert!(timeout_turn.iter().any(|c| c == "Are you still there?"));
        assert!(timeout_turn
            .iter()
            .any(|c| c.contains("hasn't replied in")));

        program.stop("test over", 0).await;
        program.run_till_exit().await;
    }

    /// Executor that fails a configurable number of times before succeeding.
    struct FlakyExecutor {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl AgentExecutor for FlakyExecutor {
        async fn run(
            &self,
            _agent: &Arc<Agent>,
            _messages: Vec<Message>,
        ) -> Result<RunResult, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ExecutorError::Transient("overloaded".to_string()));
            }
            Ok(RunResult::default())
        }
    }

    #[tokio::test]
    async fn transient_executor_failures_are_retried() {
        let flaky = Arc::new(FlakyExecutor {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let program = Program::builder()
            .with_session_id("retry-test")
            .with_config(crate::agentloom::config::RuntimeConfig {
                executor_max_attempts: 3,
                executor_backoff_base: Duration::from_millis(10),
                ..Default::default()
            })
            .add_definition(AgentDefinition::ai("Worker"))
            .with_executor(Arc::clone(&flaky) as Arc<dyn AgentExecutor>)
            .build()
            .await;

        let worker = program.create_agent("Worker").await.unwrap();
        worker
            .inbox()
            .put(direct("human", "1000", "go"), Priority::Normal)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert!(worker.errors().is_empty());

        program.stop("test over", 0).await;
        program.run_till_exit().await;
    }

    /// Executor that always fails fatally.
    struct DoomedExecutor;

    #[async_trait]
    impl AgentExecutor for DoomedExecutor {
        async fn run(
            &self,
            _agent: &Arc<Agent>,
            _messages: Vec<Message>,
        ) -> Result<RunResult, ExecutorError> {
            Err(ExecutorError::Fatal("model exploded".to_string()))
        }
    }

    #[tokio::test]
    async fn fatal_executor_failure_stops_the_agent_and_fails_the_run() {
        use crate::agentloom::event::{EventHandler, EventKind, Topic};

        struct StopWatcher {
            reasons: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl EventHandler for StopWatcher {
            async fn on_event(&self, event: &Event) {
                if let EventPayload::AgentStopped { reason } = &event.payload {
                    self.reasons.lock().unwrap().push(reason.clone());
                }
            }
        }

        let program = Program::builder()
            .with_session_id("fatal-test")
            .add_definition(AgentDefinition::ai("Worker"))
            .with_executor(Arc::new(DoomedExecutor))
            .build()
            .await;
        let watcher = Arc::new(StopWatcher {
            reasons: Mutex::new(Vec::new()),
        });
        program
            .bus()
            .subscribe(Topic::Kind(EventKind::AgentStopped), watcher.clone() as _)
            .unwrap();

        let worker = program.create_agent("Worker").await.unwrap();
        worker
            .inbox()
            .put(direct("human", "1000", "go"), Priority::Normal)
            .unwrap();

        // The lone AI agent crashed, so the whole run fails.
        let code = program.run_till_exit().await;
        assert_eq!(code, crate::agentloom::config::exit_code::ERROR);
        assert_eq!(worker.errors(), vec!["model exploded".to_string()]);
        assert_eq!(watcher.reasons.lock().unwrap().clone(), vec!["error"]);
    }

    /// Executor whose one turn sets a variable and ends the program.
    struct OneShotExecutor;

    #[async_trait]
    impl AgentExecutor for OneShotExecutor {
        async fn run(
            &self,
            _agent: &Arc<Agent>,
            _messages: Vec<Message>,
        ) -> Result<RunResult, ExecutorError> {
            Ok(RunResult::ending_program(vec![Effect::SetVariable {
                name: "answer".to_string(),
                value: serde_json::json!(42),
            }]))
        }
    }

    #[tokio::test]
    async fn effects_apply_and_ends_program_terminates_the_run() {
        let program = Program::builder()
            .with_session_id("oneshot-test")
            .add_definition(AgentDefinition::ai("Worker"))
            .with_executor(Arc::new(OneShotExecutor))
            .build()
            .await;

        let worker = program.create_agent("Worker").await.unwrap();
        worker
            .inbox()
            .put(direct("human", "1000", "go"), Priority::Normal)
            .unwrap();

        let code = program.run_till_exit().await;
        assert_eq!(code, crate::agentloom::config::exit_code::SUCCESS);
        assert_eq!(
            worker.variables().get("answer").map(|v| v.display_value()),
            Some(serde_json::json!(42))
        );
        // The implicit last-result slot tracked the write.
        assert_eq!(
            worker.variables().last_result().map(|v| v.display_value()),
            Some(serde_json::json!(42))
        );
    }
}
