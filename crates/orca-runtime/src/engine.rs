use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard, mpsc};
use tracing::{debug, info, warn};

use orca_config::AgentConfig;
use orca_core::{
    Message, OrcaError, Params, Result, Role, StreamEvent, ThinkingStage, ToolInvocation,
    render_output,
};
use orca_llm::ModelBackend;
use orca_memory::ConversationStore;

use crate::extract::extract_tool_call;
use crate::prompt::{build_prompt, system_instruction};
use crate::registry::CapabilityRegistry;

/// Title given to sessions the engine creates.
pub const DEFAULT_TITLE: &str = "New conversation";

/// Reply used whenever the model produces nothing usable.
pub const FALLBACK_REPLY: &str = "Sorry, I couldn't produce a usable response. Please try again.";

/// Collaborators supplied once at initialization.
struct Parts {
    backend: Arc<dyn ModelBackend>,
    registry: Arc<CapabilityRegistry>,
}

/// Working state of one turn: a fresh copy of one session's transcript.
struct Turn {
    session_id: String,
    instruction: String,
    history: Vec<Message>,
    limit: usize,
}

impl Turn {
    fn prompt(&self) -> String {
        build_prompt(&self.instruction, &self.history, self.limit)
    }
}

type RunLocks = Mutex<HashMap<String, Arc<TokioMutex<()>>>>;

/// Exclusive right to run a turn on one session. On drop the session's lock
/// entry is removed once no other turn holds or waits on it.
struct RunGuard<'a> {
    locks: &'a RunLocks,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        self.guard.take();
        if locks
            .get(&self.session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.session_id);
        }
    }
}

/// What happened when a turn invoked a capability.
enum ToolOutcome {
    Succeeded,
    Failed(String),
}

/// The orchestration engine.
///
/// A turn reloads the session transcript, runs a first non-streamed
/// generation to look for a tool call, optionally invokes one capability and
/// injects its output, then produces the final reply. Turns on the same
/// session are serialised; turns on different sessions may run concurrently.
pub struct Engine {
    config: AgentConfig,
    memory: Arc<dyn ConversationStore>,
    parts: OnceLock<Parts>,
    /// Session used by the calls that take no explicit session id.
    active: Mutex<String>,
    run_locks: RunLocks,
}

impl Engine {
    pub fn new(config: AgentConfig, memory: Arc<dyn ConversationStore>) -> Self {
        Self {
            config,
            memory,
            parts: OnceLock::new(),
            active: Mutex::new(String::new()),
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the backend and registry, and open the first session.
    /// Can only succeed once.
    pub async fn initialize(
        &self,
        backend: Arc<dyn ModelBackend>,
        registry: Arc<CapabilityRegistry>,
    ) -> Result<()> {
        if self.parts.get().is_some() {
            return Err(OrcaError::Init("engine is already initialized".into()));
        }
        let session_id = self
            .memory
            .create_conversation(DEFAULT_TITLE)
            .await
            .map_err(|e| OrcaError::Init(format!("cannot open initial conversation: {e}")))?;

        let backend_name = backend.name().to_string();
        let model = backend.model().to_string();
        let capabilities = registry.len();
        self.parts
            .set(Parts { backend, registry })
            .map_err(|_| OrcaError::Init("engine is already initialized".into()))?;
        *self.active.lock() = session_id.clone();

        info!(
            agent = %self.config.name,
            backend = %backend_name,
            %model,
            capabilities,
            memory = self.memory.kind(),
            session = %session_id,
            "engine initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.parts.get().is_some()
    }

    fn parts(&self) -> Result<&Parts> {
        self.parts
            .get()
            .ok_or_else(|| OrcaError::Init("engine is not initialized".into()))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<dyn ConversationStore> {
        &self.memory
    }

    pub fn registry(&self) -> Option<&Arc<CapabilityRegistry>> {
        self.parts.get().map(|p| &p.registry)
    }

    // ── Session pointer ────────────────────────────────────────

    pub fn get_conversation_id(&self) -> String {
        self.active.lock().clone()
    }

    /// Switch the active session. An empty id is rejected and changes nothing.
    pub fn set_conversation_id(&self, id: &str) -> Result<()> {
        let id = id.trim();
        if id.is_empty() {
            return Err(OrcaError::InvalidArgument(
                "conversation id cannot be empty".into(),
            ));
        }
        let mut active = self.active.lock();
        if *active != id {
            debug!(from = %active.as_str(), to = %id, "switching active conversation");
            *active = id.to_string();
        }
        Ok(())
    }

    /// Create a fresh session and make it active.
    pub async fn new_conversation(&self) -> Result<String> {
        let id = self.memory.create_conversation(DEFAULT_TITLE).await?;
        *self.active.lock() = id.clone();
        info!(session = %id, "started new conversation");
        Ok(id)
    }

    /// Record user feedback on the active session as a system message.
    pub async fn learn(&self, feedback: &str) -> Result<()> {
        let feedback = feedback.trim();
        if feedback.is_empty() {
            return Err(OrcaError::Validation("feedback cannot be empty".into()));
        }
        let session_id = self.get_conversation_id();
        if session_id.is_empty() {
            return Err(OrcaError::Init("engine is not initialized".into()));
        }
        let note = format!(
            "feedback ({}): {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            feedback
        );
        self.memory
            .add_message(&session_id, Role::System, &note)
            .await?;
        info!(session = %session_id, "recorded feedback");
        Ok(())
    }

    // ── Tools ──────────────────────────────────────────────────

    /// Invoke a registered capability directly.
    pub async fn execute_tool(&self, name: &str, params: &Params) -> Result<Value> {
        self.parts()?.registry.invoke(name, params).await
    }

    // ── Turns ──────────────────────────────────────────────────

    /// Run a non-streamed turn on the active session.
    pub async fn process(&self, input: &str) -> Result<String> {
        let session_id = self.active_session()?;
        self.process_in(&session_id, input).await
    }

    /// Run a non-streamed turn on `session_id` and return the final reply.
    pub async fn process_in(&self, session_id: &str, input: &str) -> Result<String> {
        let parts = self.parts()?;
        let _run = self.acquire_run(session_id).await;

        let mut turn = self.begin_turn(parts, session_id, input).await?;
        let pre = generate_or_empty(parts.backend.as_ref(), &turn.prompt()).await?;

        let reply = match extract_tool_call(&pre) {
            None => pre,
            Some(call) => {
                self.run_tool(parts, &mut turn, &call).await;
                generate_or_empty(parts.backend.as_ref(), &turn.prompt()).await?
            }
        };
        let reply = usable_or_fallback(reply);

        self.record(&mut turn, Message::assistant(reply.clone())).await;
        info!(session = %session_id, chars = reply.len(), "turn complete");
        Ok(reply)
    }

    /// Run a streamed turn on the active session.
    pub async fn process_stream(&self, input: &str, sink: mpsc::Sender<StreamEvent>) -> Result<()> {
        let session_id = self.active_session()?;
        self.process_stream_in(&session_id, &session_id, input, sink)
            .await
    }

    /// Run a streamed turn on `session_id`, announcing `conversation_id` as
    /// the caller-facing handle.
    ///
    /// Events arrive in order: `Meta`, `Thinking(analyzing)`, the tool stages
    /// when a call was made, `Thinking(generating)`, content deltas, then
    /// `Done` or `Error`. The sink is dropped when this returns. If the
    /// receiver goes away the in-flight backend call is abandoned and the
    /// turn ends with `Cancelled`.
    pub async fn process_stream_in(
        &self,
        conversation_id: &str,
        session_id: &str,
        input: &str,
        sink: mpsc::Sender<StreamEvent>,
    ) -> Result<()> {
        let result = self
            .stream_turn(conversation_id, session_id, input, &sink)
            .await;
        match &result {
            Ok(()) => {
                let _ = sink.send(StreamEvent::Done).await;
            }
            Err(OrcaError::Cancelled) => {
                info!(session = %session_id, "stream cancelled by consumer");
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "streamed turn failed");
                let _ = sink
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
        result
    }

    async fn stream_turn(
        &self,
        conversation_id: &str,
        session_id: &str,
        input: &str,
        sink: &mpsc::Sender<StreamEvent>,
    ) -> Result<()> {
        let parts = self.parts()?;
        let _run = until_closed(sink, async { Ok(self.acquire_run(session_id).await) }).await?;

        emit(
            sink,
            StreamEvent::Meta {
                conversation_id: conversation_id.to_string(),
                agent_conversation_id: session_id.to_string(),
            },
        )
        .await?;

        let mut turn = self.begin_turn(parts, session_id, input).await?;
        emit(
            sink,
            StreamEvent::thinking(ThinkingStage::Analyzing, "Analyzing your request..."),
        )
        .await?;

        let pre = until_closed(
            sink,
            generate_or_empty(parts.backend.as_ref(), &turn.prompt()),
        )
        .await?;

        if let Some(call) = extract_tool_call(&pre) {
            emit(
                sink,
                StreamEvent::thinking(
                    ThinkingStage::ToolCall,
                    format!("Calling tool: {}", call.name),
                ),
            )
            .await?;
            let outcome = until_closed(sink, async {
                Ok(self.run_tool(parts, &mut turn, &call).await)
            })
            .await?;
            let marker = match outcome {
                ToolOutcome::Succeeded => StreamEvent::thinking(
                    ThinkingStage::ToolResult,
                    "Tool returned a result, composing the reply...",
                ),
                ToolOutcome::Failed(reason) => StreamEvent::thinking(
                    ThinkingStage::ToolError,
                    format!("Tool failed: {reason}"),
                ),
            };
            emit(sink, marker).await?;
        }

        emit(
            sink,
            StreamEvent::thinking(ThinkingStage::Generating, "Generating the reply..."),
        )
        .await?;

        let reply = self
            .stream_reply(parts.backend.as_ref(), &turn.prompt(), sink)
            .await?;
        self.record(&mut turn, Message::assistant(reply.clone())).await;
        info!(session = %session_id, chars = reply.len(), "streamed turn complete");
        Ok(())
    }

    /// Stream the final generation to `sink` and return the full text.
    ///
    /// The backend writes into a bounded internal channel; a relay forwards
    /// each chunk as a content delta and accumulates the reply. Dropping the
    /// relay's receiver makes the backend's next send fail.
    async fn stream_reply(
        &self,
        backend: &dyn ModelBackend,
        prompt: &str,
        sink: &mpsc::Sender<StreamEvent>,
    ) -> Result<String> {
        let (tx, mut rx) = mpsc::channel::<String>(self.config.stream_buffer.max(1));

        let produce = backend.generate_stream(prompt, tx);
        let relay = async move {
            let mut full = String::new();
            while let Some(chunk) = rx.recv().await {
                if chunk.is_empty() {
                    continue;
                }
                full.push_str(&chunk);
                emit(sink, StreamEvent::Content { delta: chunk }).await?;
            }
            Ok::<_, OrcaError>(full)
        };

        let (produced, relayed) =
            until_closed(sink, async { Ok(tokio::join!(produce, relay)) }).await?;
        let full = relayed?;

        match produced {
            Ok(()) | Err(OrcaError::EmptyResponse) if full.trim().is_empty() => {
                warn!("backend streamed no usable content, sending fallback reply");
                emit(
                    sink,
                    StreamEvent::Content {
                        delta: FALLBACK_REPLY.to_string(),
                    },
                )
                .await?;
                Ok(FALLBACK_REPLY.to_string())
            }
            Ok(()) => Ok(full),
            Err(e) => Err(e),
        }
    }

    // ── Turn helpers ───────────────────────────────────────────

    fn active_session(&self) -> Result<String> {
        self.parts()?;
        let id = self.get_conversation_id();
        if id.is_empty() {
            return Err(OrcaError::Init("no active conversation".into()));
        }
        Ok(id)
    }

    /// Wait for exclusive use of `session_id`.
    async fn acquire_run(&self, session_id: &str) -> RunGuard<'_> {
        let lock = {
            let mut locks = self.run_locks.lock();
            Arc::clone(
                locks
                    .entry(session_id.to_string())
                    .or_insert_with(|| Arc::new(TokioMutex::new(()))),
            )
        };
        RunGuard {
            locks: &self.run_locks,
            session_id: session_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Sessions that currently have a run lock entry.
    #[cfg(test)]
    fn locked_sessions(&self) -> usize {
        self.run_locks.lock().len()
    }

    /// Reload the transcript for `session_id` and append the user message.
    async fn begin_turn(&self, parts: &Parts, session_id: &str, input: &str) -> Result<Turn> {
        if input.trim().is_empty() {
            return Err(OrcaError::Validation("message cannot be empty".into()));
        }
        let history = match self.memory.get_conversation(session_id).await {
            Ok(conversation) => conversation.messages,
            Err(OrcaError::ConversationNotFound(_)) => {
                warn!(session = %session_id, "conversation not in memory, starting with empty history");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        debug!(session = %session_id, messages = history.len(), "loaded transcript");

        let mut turn = Turn {
            session_id: session_id.to_string(),
            instruction: system_instruction(&self.config.system_prompt, &parts.registry.infos()),
            history,
            limit: self.config.history_limit,
        };
        self.record(&mut turn, Message::user(input)).await;
        Ok(turn)
    }

    /// Invoke the call, then append its output (or failure text) to the turn.
    async fn run_tool(&self, parts: &Parts, turn: &mut Turn, call: &ToolInvocation) -> ToolOutcome {
        info!(
            session = %turn.session_id,
            tool = %call.name,
            format = %call.format,
            "tool call detected"
        );
        let (text, outcome) = match parts.registry.invoke(&call.name, &call.params).await {
            Ok(value) => {
                debug!(tool = %call.name, "tool succeeded");
                (render_output(&value), ToolOutcome::Succeeded)
            }
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool failed");
                (
                    format!("Tool {} failed: {e}", call.name),
                    ToolOutcome::Failed(e.to_string()),
                )
            }
        };
        let injected = format!("Tool ({}) output: {}", call.name, text);
        self.record(turn, Message::system(injected)).await;
        outcome
    }

    /// Append to the turn and persist. Persistence is best-effort.
    async fn record(&self, turn: &mut Turn, message: Message) {
        if let Err(e) = self
            .memory
            .add_message(&turn.session_id, message.role, &message.content)
            .await
        {
            warn!(
                session = %turn.session_id,
                role = %message.role,
                error = %e,
                "failed to persist message"
            );
        }
        turn.history.push(message);
    }
}

async fn generate_or_empty(backend: &dyn ModelBackend, prompt: &str) -> Result<String> {
    match backend.generate(prompt).await {
        Ok(text) => Ok(text),
        Err(OrcaError::EmptyResponse) => Ok(String::new()),
        Err(e) => Err(e),
    }
}

fn usable_or_fallback(reply: String) -> String {
    if reply.trim().is_empty() {
        warn!("model returned an empty reply, using fallback");
        FALLBACK_REPLY.to_string()
    } else {
        reply
    }
}

async fn emit(sink: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Result<()> {
    sink.send(event).await.map_err(|_| OrcaError::Cancelled)
}

/// Race `fut` against the consumer going away.
async fn until_closed<T>(
    sink: &mpsc::Sender<StreamEvent>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        out = fut => out,
        _ = sink.closed() => Err(OrcaError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orca_core::Capability;
    use orca_llm::MockBackend;
    use orca_memory::SqliteStore;
    use serde_json::json;

    struct Calculator;

    #[async_trait]
    impl Capability for Calculator {
        fn name(&self) -> &str {
            "calculator"
        }

        fn description(&self) -> &str {
            "adds two numbers"
        }

        async fn execute(&self, params: &Params) -> Result<Value> {
            let a = params.get("a").and_then(Value::as_f64);
            let b = params.get("b").and_then(Value::as_f64);
            match (a, b) {
                (Some(a), Some(b)) => Ok(json!(a + b)),
                _ => Err(OrcaError::Validation("a and b must be numbers".into())),
            }
        }
    }

    async fn engine_with(backend: MockBackend) -> (Engine, Arc<dyn ConversationStore>) {
        let store: Arc<dyn ConversationStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = Engine::new(AgentConfig::default(), Arc::clone(&store));
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register(Arc::new(Calculator)).unwrap();
        engine
            .initialize(Arc::new(backend), registry)
            .await
            .unwrap();
        (engine, store)
    }

    #[tokio::test]
    async fn test_initialize_once() {
        let (engine, _) = engine_with(MockBackend::new()).await;
        assert!(!engine.get_conversation_id().is_empty());
        let err = engine
            .initialize(Arc::new(MockBackend::new()), Arc::new(CapabilityRegistry::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, OrcaError::Init(_)));
    }

    #[tokio::test]
    async fn test_uninitialized_engine_refuses_turns() {
        let store: Arc<dyn ConversationStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = Engine::new(AgentConfig::default(), store);
        assert!(matches!(engine.process("hi").await, Err(OrcaError::Init(_))));
        assert!(matches!(
            engine.execute_tool("calculator", &Params::new()).await,
            Err(OrcaError::Init(_))
        ));
    }

    #[tokio::test]
    async fn test_set_conversation_id_rejects_empty() {
        let (engine, _) = engine_with(MockBackend::new()).await;
        let before = engine.get_conversation_id();
        assert!(matches!(
            engine.set_conversation_id(""),
            Err(OrcaError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.set_conversation_id("   "),
            Err(OrcaError::InvalidArgument(_))
        ));
        assert_eq!(engine.get_conversation_id(), before);
    }

    #[tokio::test]
    async fn test_plain_turn_uses_phase_one_reply() {
        let backend = MockBackend::new().with_response("Hello there!");
        let (engine, store) = engine_with(backend.clone()).await;

        let reply = engine.process("hi").await.unwrap();
        assert_eq!(reply, "Hello there!");
        assert_eq!(backend.call_count(), 1);

        let conv = store.get_conversation(&engine.get_conversation_id()).await.unwrap();
        let roles: Vec<Role> = conv.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_tool_turn_injects_output_before_phase_two() {
        let backend = MockBackend::new()
            .with_response(r#"{"tool":"calculator","params":{"a":10,"b":5}}"#)
            .with_response("10 + 5 = 15");
        let (engine, store) = engine_with(backend.clone()).await;

        let reply = engine.process("what is 10 + 5?").await.unwrap();
        assert_eq!(reply, "10 + 5 = 15");

        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("Tool (calculator) output"));
        assert!(prompts[1].contains("system: Tool (calculator) output: 15"));
        assert!(prompts[1].ends_with("assistant: "));

        let conv = store.get_conversation(&engine.get_conversation_id()).await.unwrap();
        let roles: Vec<Role> = conv.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::System, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_tool_failure_does_not_abort_turn() {
        let backend = MockBackend::new()
            .with_response("USE TOOL: calculator a=ten, b=5")
            .with_response("I could not compute that.");
        let (engine, _) = engine_with(backend.clone()).await;

        let reply = engine.process("add ten and five").await.unwrap();
        assert_eq!(reply, "I could not compute that.");
        assert!(backend.prompts()[1].contains("Tool calculator failed"));
    }

    #[tokio::test]
    async fn test_empty_reply_becomes_fallback() {
        let backend = MockBackend::new().with_response("   ");
        let (engine, store) = engine_with(backend).await;
        assert_eq!(engine.process("hi").await.unwrap(), FALLBACK_REPLY);
        let conv = store.get_conversation(&engine.get_conversation_id()).await.unwrap();
        assert_eq!(conv.messages.last().unwrap().content, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn test_backend_failure_fails_the_turn() {
        let backend = MockBackend::new().with_error("connection reset");
        let (engine, _) = engine_with(backend).await;
        let err = engine.process("hi").await.unwrap_err();
        assert!(err.is_backend());
    }

    #[tokio::test]
    async fn test_empty_input_is_rejected() {
        let backend = MockBackend::new();
        let (engine, _) = engine_with(backend.clone()).await;
        assert!(matches!(engine.process("  ").await, Err(OrcaError::Validation(_))));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_learn_appends_feedback() {
        let (engine, store) = engine_with(MockBackend::new()).await;
        engine.learn("prefer metric units").await.unwrap();
        let conv = store.get_conversation(&engine.get_conversation_id()).await.unwrap();
        let last = conv.messages.last().unwrap();
        assert_eq!(last.role, Role::System);
        assert!(last.content.starts_with("feedback ("));
        assert!(last.content.ends_with("): prefer metric units"));
    }

    #[tokio::test]
    async fn test_new_conversation_switches_active() {
        let (engine, _) = engine_with(MockBackend::new()).await;
        let first = engine.get_conversation_id();
        let second = engine.new_conversation().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(engine.get_conversation_id(), second);
    }

    #[tokio::test]
    async fn test_execute_tool_direct() {
        let (engine, _) = engine_with(MockBackend::new()).await;
        let params = json!({"a": 2, "b": 3}).as_object().cloned().unwrap();
        assert_eq!(engine.execute_tool("calculator", &params).await.unwrap(), json!(5.0));
        assert!(engine.execute_tool("nope", &params).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_run_lock_entry_released_after_turns() {
        let (engine, _) = engine_with(
            MockBackend::new()
                .with_response("first")
                .with_response("second"),
        )
        .await;

        let (a, b) = tokio::join!(engine.process("one"), engine.process("two"));
        let mut replies = vec![a.unwrap(), b.unwrap()];
        replies.sort();
        assert_eq!(replies, vec!["first", "second"]);
        assert_eq!(engine.locked_sessions(), 0);
    }

    #[tokio::test]
    async fn test_run_lock_kept_while_held() {
        let (engine, _) = engine_with(MockBackend::new()).await;
        let held = engine.acquire_run("s1").await;
        let other = engine.acquire_run("s2").await;
        assert_eq!(engine.locked_sessions(), 2);
        drop(held);
        assert_eq!(engine.locked_sessions(), 1);
        drop(other);
        assert_eq!(engine.locked_sessions(), 0);
    }
}
