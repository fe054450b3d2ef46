//! Agent Loop
//!
//! Drives repeated provider calls, executing the requested tools in parallel
//! between calls, until the model answers without tool calls.
//!
//! ```text
//! REQUESTING_LLM ──(no tool calls)──▶ DONE
//!       ▲  │
//!       │  └──(tool calls)──▶ EXECUTING_TOOLS
//!       └─────────────────────────┘
//! any state ──▶ MAX_ITERATIONS_EXCEEDED | TIMEOUT | ERROR
//! ```
//!
//! A single deadline is captured when a run starts and re-checked, never
//! reset, before every provider call and tool batch.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::dispatch::dispatch_all;
use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::provider::{
    ChunkStream, FinishReason, GenerationOptions, LlmProvider, StreamChunk, TokenUsage,
};
use crate::thread::{self, KeyedLocks, ThreadId, ThreadStore};
use crate::tool::{ToolCall, ToolDispatch, ToolSchema};

/// Stream returned by [`Executor::execute_loop_stream`]
pub type LoopStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

const DEFAULT_MAX_ITERATIONS: usize = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Executor configuration
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Maximum provider calls per run
    pub max_iterations: usize,

    /// Generation options used when the caller does not pass any
    pub generation: GenerationOptions,

    /// Wall-clock budget for a whole run
    pub timeout: Duration,

    /// System prompt for threads created by [`Executor::run_in_thread`]
    pub system_prompt: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            generation: GenerationOptions::default(),
            timeout: DEFAULT_TIMEOUT,
            system_prompt: None,
        }
    }
}

impl ExecutorConfig {
    /// Read `AGENT_MAX_ITERATIONS` and `AGENT_TIMEOUT_SECS`, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("AGENT_MAX_ITERATIONS") {
            config.max_iterations = raw.parse().map_err(|_| {
                AgentError::Config(format!("AGENT_MAX_ITERATIONS must be an integer, got '{raw}'"))
            })?;
        }
        if let Ok(raw) = std::env::var("AGENT_TIMEOUT_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                AgentError::Config(format!("AGENT_TIMEOUT_SECS must be an integer, got '{raw}'"))
            })?;
            config.timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }
        Ok(())
    }
}

/// Outcome of a completed run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    /// Final assistant message (no tool calls)
    pub final_message: Message,

    /// Provider id of the final response
    pub response_id: String,

    /// Usage reported by the final response
    pub usage: TokenUsage,

    /// Provider calls made during the run
    pub iterations: usize,
}

/// Wall-clock budget shared by every suspension point of one run
#[derive(Clone, Copy, Debug)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    /// Time left, or `Timeout` when nothing is left
    fn remaining(&self) -> Result<Duration> {
        let left = self.at.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(AgentError::Timeout(self.budget));
        }
        Ok(left)
    }

    /// Await `fut`, giving up when the deadline passes
    async fn run<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout_at(self.at, fut).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(self.budget)),
        }
    }
}

/// The tool-calling agent loop
#[derive(Clone)]
pub struct Executor {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolDispatch>,
    config: ExecutorConfig,
}

impl Executor {
    /// Create a new executor
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolDispatch>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            config,
        }
    }

    /// Create with default configuration
    pub fn with_defaults(provider: Arc<dyn LlmProvider>, tools: Arc<dyn ToolDispatch>) -> Self {
        Self::new(provider, tools, ExecutorConfig::default())
    }

    /// Run the loop until the model answers without tool calls
    ///
    /// Assistant tool-call turns and their tool results are appended to
    /// `history`; the final answer is returned, not appended. If a tool batch
    /// does not finish, its assistant turn is removed again before returning.
    pub async fn execute_loop(
        &self,
        history: &mut Vec<Message>,
        tools: &[ToolSchema],
        options: &GenerationOptions,
        timeout: Duration,
    ) -> Result<ToolExecutionResult> {
        let deadline = Deadline::after(timeout);
        let max_iterations = self.config.max_iterations;

        for iteration in 1..=max_iterations {
            let remaining = deadline.remaining()?;
            tracing::debug!(
                iteration,
                remaining_ms = remaining.as_millis() as u64,
                "requesting completion"
            );

            let call_options = options.clone().with_timeout(remaining);
            let response = deadline
                .run(self.provider.chat_completion(history, tools, &call_options))
                .await?;

            if response.tool_calls.is_empty() {
                tracing::debug!(iteration, response_id = %response.id, "loop finished");
                return Ok(ToolExecutionResult {
                    final_message: response.message,
                    response_id: response.id,
                    usage: response.usage,
                    iterations: iteration,
                });
            }

            let calls = response.tool_calls;
            let mut assistant = response.message;
            assistant.tool_calls = calls.clone();
            history.push(assistant);

            if let Err(e) = self.run_tools(&deadline, history, &calls).await {
                // A tool-call turn never stays in history without its results.
                history.pop();
                return Err(e);
            }
        }

        tracing::warn!(max_iterations, "loop exhausted its iterations");
        Err(AgentError::MaxIterations(max_iterations))
    }

    /// Run with the configured generation options and timeout
    pub async fn run(&self, history: &mut Vec<Message>) -> Result<ToolExecutionResult> {
        let tools = self.tools.schemas();
        self.execute_loop(history, &tools, &self.config.generation, self.config.timeout)
            .await
    }

    async fn run_tools(
        &self,
        deadline: &Deadline,
        history: &mut Vec<Message>,
        calls: &[ToolCall],
    ) -> Result<()> {
        deadline.remaining()?;
        let outcomes = deadline
            .run(async { Ok::<_, AgentError>(dispatch_all(self.tools.as_ref(), calls).await) })
            .await?;
        history.extend(outcomes.into_iter().map(|o| o.into_message()));
        Ok(())
    }

    /// Streaming variant of [`Executor::execute_loop`]
    ///
    /// Text deltas are forwarded as they arrive, `tool_result` chunks follow
    /// each tool batch, and the stream ends with one `done` chunk. On failure
    /// one `error` chunk is yielded, then the error itself.
    pub fn execute_loop_stream(
        &self,
        history: Vec<Message>,
        tools: Vec<ToolSchema>,
        options: GenerationOptions,
        timeout: Duration,
    ) -> LoopStream {
        let deadline = Deadline::after(timeout);
        let provider = Arc::clone(&self.provider);
        let dispatcher = Arc::clone(&self.tools);
        let max_iterations = self.config.max_iterations;

        Box::pin(async_stream::stream! {
            let mut history = history;
            let mut iteration = 0;

            let failure = 'turns: loop {
                if iteration == max_iterations {
                    break 'turns AgentError::MaxIterations(max_iterations);
                }
                iteration += 1;

                let remaining = match deadline.remaining() {
                    Ok(remaining) => remaining,
                    Err(e) => break 'turns e,
                };
                tracing::debug!(
                    iteration,
                    remaining_ms = remaining.as_millis() as u64,
                    "requesting streamed completion"
                );

                let call_options = options.clone().with_timeout(remaining);
                let mut chunks: ChunkStream = match deadline
                    .run(provider.chat_completion_stream(&history, &tools, &call_options))
                    .await
                {
                    Ok(chunks) => chunks,
                    Err(e) => break 'turns e,
                };

                let mut text = String::new();
                let mut calls: Vec<ToolCall> = Vec::new();
                let mut finish_reason = FinishReason::Stop;
                let mut usage = TokenUsage::default();

                loop {
                    let read = async { Ok::<_, AgentError>(chunks.next().await) };
                    let next = match deadline.run(read).await {
                        Ok(next) => next,
                        Err(e) => break 'turns e,
                    };
                    match next {
                        None => break,
                        Some(Err(e)) => break 'turns e,
                        Some(Ok(StreamChunk::Delta { content })) => {
                            text.push_str(&content);
                            yield Ok(StreamChunk::Delta { content });
                        }
                        Some(Ok(StreamChunk::ToolCall { tool_calls })) => calls.extend(tool_calls),
                        Some(Ok(StreamChunk::Done { finish_reason: reason, usage: reported })) => {
                            finish_reason = reason;
                            usage = reported;
                            break;
                        }
                        Some(Ok(StreamChunk::Error { kind, message })) => {
                            break 'turns AgentError::from_stream(&kind, message);
                        }
                        Some(Ok(StreamChunk::ToolResult { .. })) => {}
                    }
                }

                if calls.is_empty() {
                    tracing::debug!(iteration, "streamed loop finished");
                    yield Ok(StreamChunk::Done { finish_reason, usage });
                    return;
                }

                let content = if text.is_empty() { None } else { Some(text) };
                history.push(Message::assistant_with_tool_calls(content, calls.clone()));

                if let Err(e) = deadline.remaining() {
                    break 'turns e;
                }
                let batch = async {
                    Ok::<_, AgentError>(dispatch_all(dispatcher.as_ref(), &calls).await)
                };
                let outcomes = match deadline.run(batch).await {
                    Ok(outcomes) => outcomes,
                    Err(e) => break 'turns e,
                };

                for outcome in outcomes {
                    yield Ok(outcome.to_chunk());
                    history.push(outcome.into_message());
                }
            };

            tracing::warn!(error = %failure, kind = failure.kind(), "streamed loop failed");
            yield Ok(StreamChunk::error(&failure));
            yield Err(failure);
        })
    }

    /// Continue a persisted thread with `user_message`
    ///
    /// The thread is created on first use (single-flight per id). It is saved
    /// with the tool turns and the final answer only when the run succeeds.
    pub async fn run_in_thread(
        &self,
        store: &dyn ThreadStore,
        locks: &KeyedLocks,
        thread_id: &ThreadId,
        user_message: Message,
    ) -> Result<ToolExecutionResult> {
        let system_prompt = self.config.system_prompt.as_deref();
        let mut thread = thread::get_or_create(store, locks, thread_id, system_prompt).await?;

        thread.messages.push(user_message);
        let result = self.run(&mut thread.messages).await?;

        thread.messages.push(result.final_message.clone());
        thread.touch();
        store.save(&thread).await?;

        Ok(result)
    }

    /// Get the tool dispatcher
    pub fn tools(&self) -> &Arc<dyn ToolDispatch> {
        &self.tools
    }

    /// Get configuration
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }
}

/// Builder for Executor configuration
pub struct ExecutorBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    tools: Option<Arc<dyn ToolDispatch>>,
    config: ExecutorConfig,
}

impl Default for ExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            tools: None,
            config: ExecutorConfig::default(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tools(mut self, tools: Arc<dyn ToolDispatch>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.config.generation.temperature = temp;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.config.generation.max_tokens = max_tokens;
        self
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn build(self) -> Result<Executor> {
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;
        let tools = self
            .tools
            .ok_or_else(|| AgentError::Config("Tool dispatcher is required".into()))?;
        self.config.validate()?;

        Ok(Executor::new(provider, tools, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use crate::provider::ChatResponse;
    use crate::thread::MemoryThreadStore;
    use crate::tool::{Parameters, ToolError};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Script = Box<dyn Fn(usize) -> ChatResponse + Send + Sync>;

    /// Answers call `n` with `script(n)`, recording what each call saw
    struct ScriptedProvider {
        script: Script,
        delay: Duration,
        calls: AtomicUsize,
        timeouts: Mutex<Vec<Option<Duration>>>,
        histories: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedProvider {
        fn new(script: impl Fn(usize) -> ChatResponse + Send + Sync + 'static) -> Self {
            Self {
                script: Box::new(script),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                timeouts: Mutex::new(Vec::new()),
                histories: Mutex::new(Vec::new()),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn respond(&self, messages: &[Message], options: &GenerationOptions) -> ChatResponse {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.timeouts.lock().unwrap().push(options.timeout);
            self.histories.lock().unwrap().push(messages.to_vec());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.script)(n)
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat_completion(
            &self,
            messages: &[Message],
            _tools: &[ToolSchema],
            options: &GenerationOptions,
        ) -> Result<ChatResponse> {
            Ok(self.respond(messages, options).await)
        }

        async fn chat_completion_stream(
            &self,
            messages: &[Message],
            _tools: &[ToolSchema],
            options: &GenerationOptions,
        ) -> Result<ChunkStream> {
            let response = self.respond(messages, options).await;
            let mut chunks = Vec::new();
            if let Some(content) = response.message.content {
                chunks.push(Ok(StreamChunk::Delta { content }));
            }
            if !response.tool_calls.is_empty() {
                chunks.push(Ok(StreamChunk::ToolCall {
                    tool_calls: response.tool_calls,
                }));
            }
            chunks.push(Ok(StreamChunk::Done {
                finish_reason: response.finish_reason,
                usage: response.usage,
            }));
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    struct TestTools;

    #[async_trait]
    impl ToolDispatch for TestTools {
        async fn execute(
            &self,
            name: &str,
            params: Parameters,
        ) -> std::result::Result<Value, ToolError> {
            if let Some(ms) = params.get("delay_ms").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            match name {
                "count_rows" => Ok(json!({"rows": 3, "echo": Value::Object(params)})),
                "query_range" => Err(ToolError::validation("invalid_date_range: start after end")),
                "flaky" => Err(ToolError::Internal(anyhow::anyhow!(
                    "KeyError: 'warehouse_password'"
                ))),
                other => Err(ToolError::UnknownTool(other.to_string())),
            }
        }

        fn schemas(&self) -> Vec<ToolSchema> {
            vec![ToolSchema::new("count_rows", "Count rows", json!({"type": "object"}))]
        }
    }

    fn call(id: &str, name: &str, params: Value) -> ToolCall {
        ToolCall::new(id, name, params.as_object().cloned().unwrap_or_default())
    }

    fn tool_turn(n: usize, calls: Vec<ToolCall>) -> ChatResponse {
        ChatResponse::new(
            format!("resp_{n}"),
            None,
            calls,
            TokenUsage::new(10, 5),
            FinishReason::ToolCalls,
        )
    }

    fn answer(n: usize, text: &str) -> ChatResponse {
        ChatResponse::new(
            format!("resp_{n}"),
            Some(text.to_string()),
            Vec::new(),
            TokenUsage::new(20, 7),
            FinishReason::Stop,
        )
    }

    fn executor(provider: Arc<ScriptedProvider>) -> Executor {
        Executor::with_defaults(provider, Arc::new(TestTools))
    }

    fn tool_body(message: &Message) -> Value {
        serde_json::from_str(message.text()).unwrap()
    }

    async fn run_single_tool(name: &str) -> Vec<Message> {
        let name = name.to_string();
        let provider = Arc::new(ScriptedProvider::new(move |n| match n {
            1 => tool_turn(n, vec![call("call_1", &name, json!({}))]),
            _ => answer(n, "done"),
        }));
        let mut history = vec![Message::user("go")];
        executor(provider)
            .execute_loop(&mut history, &[], &GenerationOptions::default(), Duration::from_secs(30))
            .await
            .unwrap();
        history
    }

    #[tokio::test]
    async fn test_single_tool_call_takes_two_llm_calls() {
        let provider = Arc::new(ScriptedProvider::new(|n| match n {
            1 => tool_turn(n, vec![call("call_1", "count_rows", json!({"table": "orders"}))]),
            _ => answer(n, "There are 3 orders."),
        }));
        let mut history = vec![Message::system("Be brief."), Message::user("How many orders?")];

        let result = executor(Arc::clone(&provider))
            .execute_loop(&mut history, &[], &GenerationOptions::default(), Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(provider.calls(), 2);
        assert_eq!(result.iterations, 2);
        assert_eq!(result.final_message.text(), "There are 3 orders.");
        assert_eq!(result.response_id, "resp_2");
        assert_eq!(result.usage, TokenUsage::new(20, 7));

        assert_eq!(history.len(), 4);
        assert_eq!(history[2].tool_calls.len(), 1);
        assert_eq!(history[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool_body(&history[3])["rows"], json!(3));

        let seen = provider.histories.lock().unwrap();
        assert_eq!(seen[1].len(), 4);
    }

    #[tokio::test]
    async fn test_validation_error_reaches_model_verbatim() {
        let history = run_single_tool("query_range").await;
        assert_eq!(
            tool_body(&history[2]),
            json!({
                "error": "invalid_date_range: start after end",
                "error_type": "ValueError"
            })
        );
    }

    #[tokio::test]
    async fn test_internal_error_is_masked_for_model() {
        let history = run_single_tool("flaky").await;
        let body = tool_body(&history[2]);
        assert_eq!(body["error_type"], json!("InternalError"));
        assert_eq!(body["error"], json!(crate::dispatch::INTERNAL_ERROR_MESSAGE));
        assert!(!history[2].text().contains("warehouse_password"));
    }

    #[tokio::test]
    async fn test_max_iterations_raised_exactly_at_limit() {
        let provider = Arc::new(ScriptedProvider::new(|n| {
            tool_turn(n, vec![call(&format!("call_{n}"), "count_rows", json!({}))])
        }));
        let mut history = vec![Message::user("loop forever")];

        let err = executor(Arc::clone(&provider))
            .execute_loop(&mut history, &[], &GenerationOptions::default(), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::MaxIterations(5)));
        assert_eq!(provider.calls(), 5);
    }

    #[tokio::test]
    async fn test_custom_max_iterations() {
        let provider = Arc::new(ScriptedProvider::new(|n| match n {
            1 | 2 => tool_turn(n, vec![call("c", "count_rows", json!({}))]),
            _ => answer(n, "late answer"),
        }));
        let exec = ExecutorBuilder::new()
            .provider(provider.clone())
            .tools(Arc::new(TestTools))
            .max_iterations(2)
            .build()
            .unwrap();

        let err = exec.run(&mut vec![Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, AgentError::MaxIterations(2)));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_results_keep_call_order_in_history() {
        let provider = Arc::new(ScriptedProvider::new(|n| match n {
            1 => tool_turn(
                n,
                vec![
                    call("a", "count_rows", json!({"delay_ms": 300})),
                    call("b", "count_rows", json!({"delay_ms": 10})),
                    call("c", "count_rows", json!({"delay_ms": 150})),
                ],
            ),
            _ => answer(n, "ok"),
        }));
        let mut history = vec![Message::user("three at once")];

        executor(provider)
            .execute_loop(&mut history, &[], &GenerationOptions::default(), Duration::from_secs(30))
            .await
            .unwrap();

        let ids: Vec<_> = history[2..]
            .iter()
            .map(|m| m.tool_call_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_budget_never_increases() {
        let provider = Arc::new(ScriptedProvider::new(|n| match n {
            1 | 2 => tool_turn(n, vec![call("c", "count_rows", json!({"delay_ms": 300}))]),
            _ => answer(n, "finished"),
        }));
        let mut history = vec![Message::user("go")];

        executor(Arc::clone(&provider))
            .execute_loop(&mut history, &[], &GenerationOptions::default(), Duration::from_secs(5))
            .await
            .unwrap();

        let timeouts: Vec<Duration> = provider
            .timeouts
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.unwrap())
            .collect();
        assert_eq!(timeouts.len(), 3);
        assert!(timeouts[0] <= Duration::from_secs(5));
        for pair in timeouts.windows(2) {
            assert!(pair[1] <= pair[0] - Duration::from_millis(300));
        }
        assert!(timeouts.iter().all(|t| !t.is_zero()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_call_issued_once_budget_is_spent() {
        let provider = Arc::new(ScriptedProvider::new(|n| match n {
            1 => tool_turn(n, vec![call("c", "count_rows", json!({"delay_ms": 2_000}))]),
            _ => answer(n, "never"),
        }));
        let mut history = vec![Message::user("go")];

        let err = executor(Arc::clone(&provider))
            .execute_loop(&mut history, &[], &GenerationOptions::default(), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Timeout(_)));
        assert_eq!(provider.calls(), 1);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let provider = Arc::new(
            ScriptedProvider::new(|n| answer(n, "too late")).with_delay(Duration::from_secs(10)),
        );

        let err = executor(provider)
            .execute_loop(
                &mut vec![Message::user("hi")],
                &[],
                &GenerationOptions::default(),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Timeout(d) if d == Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_timeout_yields_one_error_chunk_then_error() {
        let provider = Arc::new(
            ScriptedProvider::new(|n| answer(n, "too late")).with_delay(Duration::from_secs(10)),
        );

        let items: Vec<Result<StreamChunk>> = executor(provider)
            .execute_loop_stream(
                vec![Message::user("hi")],
                Vec::new(),
                GenerationOptions::default(),
                Duration::from_secs(2),
            )
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Ok(StreamChunk::Error { kind, .. }) if kind == "timeout"));
        assert!(matches!(items[1], Err(AgentError::Timeout(_))));
    }

    /// Streams one text delta, then a terminal error chunk
    struct FailingStreamProvider {
        kind: &'static str,
    }

    #[async_trait]
    impl LlmProvider for FailingStreamProvider {
        async fn chat_completion(
            &self,
            _messages: &[Message],
            _tools: &[ToolSchema],
            _options: &GenerationOptions,
        ) -> Result<ChatResponse> {
            Err(AgentError::Transport("streaming only".into()))
        }

        async fn chat_completion_stream(
            &self,
            _messages: &[Message],
            _tools: &[ToolSchema],
            _options: &GenerationOptions,
        ) -> Result<ChunkStream> {
            let chunks = vec![
                Ok(StreamChunk::Delta { content: "Let me check".into() }),
                Ok(StreamChunk::Error {
                    kind: self.kind.to_string(),
                    message: "tool call 0: arguments are not valid JSON".into(),
                }),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    async fn stream_failure(kind: &'static str) -> Vec<Result<StreamChunk>> {
        Executor::with_defaults(Arc::new(FailingStreamProvider { kind }), Arc::new(TestTools))
            .execute_loop_stream(
                vec![Message::user("rows?")],
                Vec::new(),
                GenerationOptions::default(),
                Duration::from_secs(30),
            )
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_stream_error_chunk_keeps_its_kind() {
        let items = stream_failure("provider_protocol").await;

        assert_eq!(items.len(), 3);
        assert_eq!(
            items[1].as_ref().unwrap(),
            &StreamChunk::Error {
                kind: "provider_protocol".into(),
                message: "tool call 0: arguments are not valid JSON".into(),
            }
        );
        let err = items[2].as_ref().unwrap_err();
        assert_eq!(err.kind(), "provider_protocol");
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Provider protocol error: tool call 0: arguments are not valid JSON"
        );

        let items = stream_failure("provider_transport").await;
        assert!(items[2].as_ref().unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_stream_forwards_deltas_and_tool_results() {
        let provider = Arc::new(ScriptedProvider::new(|n| match n {
            1 => {
                let mut turn = tool_turn(n, vec![call("call_1", "count_rows", json!({}))]);
                turn.message.content = Some("Checking. ".into());
                turn
            }
            _ => answer(n, "There are 3 rows."),
        }));

        let chunks: Vec<StreamChunk> = executor(Arc::clone(&provider))
            .execute_loop_stream(
                vec![Message::user("rows?")],
                Vec::new(),
                GenerationOptions::default(),
                Duration::from_secs(30),
            )
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], StreamChunk::Delta { content: "Checking. ".into() });
        assert!(matches!(
            &chunks[1],
            StreamChunk::ToolResult { tool_call_id, .. } if tool_call_id == "call_1"
        ));
        assert_eq!(chunks[2], StreamChunk::Delta { content: "There are 3 rows.".into() });
        assert!(matches!(chunks[3], StreamChunk::Done { finish_reason: FinishReason::Stop, .. }));
        assert_eq!(chunks.iter().filter(|c| c.is_terminal()).count(), 1);

        let seen = provider.histories.lock().unwrap();
        let assistant = &seen[1][1];
        assert_eq!(assistant.text(), "Checking. ");
        assert_eq!(assistant.tool_calls[0].id, "call_1");
        assert_eq!(seen[1][2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn test_stream_max_iterations() {
        let provider = Arc::new(ScriptedProvider::new(|n| {
            tool_turn(n, vec![call("c", "count_rows", json!({}))])
        }));

        let items: Vec<Result<StreamChunk>> = executor(Arc::clone(&provider))
            .execute_loop_stream(
                vec![Message::user("again")],
                Vec::new(),
                GenerationOptions::default(),
                Duration::from_secs(30),
            )
            .collect()
            .await;

        assert_eq!(provider.calls(), 5);
        let errors = items
            .iter()
            .filter(|i| matches!(i, Ok(StreamChunk::Error { .. })))
            .count();
        assert_eq!(errors, 1);
        assert!(matches!(items.last(), Some(Err(AgentError::MaxIterations(5)))));
    }

    #[tokio::test]
    async fn test_run_in_thread_persists_turns() {
        let provider = Arc::new(ScriptedProvider::new(|n| match n {
            1 => tool_turn(n, vec![call("call_1", "count_rows", json!({}))]),
            _ => answer(n, "3 rows."),
        }));
        let exec = ExecutorBuilder::new()
            .provider(provider)
            .tools(Arc::new(TestTools))
            .system_prompt("You answer with numbers.")
            .build()
            .unwrap();
        let store = MemoryThreadStore::new();
        let locks = KeyedLocks::new();
        let id = ThreadId::new();

        let result = exec
            .run_in_thread(&store, &locks, &id, Message::user("rows?"))
            .await
            .unwrap();
        assert_eq!(result.final_message.text(), "3 rows.");

        let thread = store.load(&id).await.unwrap().unwrap();
        let roles: Vec<_> = thread.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool", "assistant"]);
    }

    #[test]
    fn test_builder_requires_provider_and_positive_iterations() {
        assert!(matches!(
            ExecutorBuilder::new().build(),
            Err(AgentError::Config(_))
        ));

        let provider = Arc::new(ScriptedProvider::new(|n| answer(n, "x")));
        let err = ExecutorBuilder::new()
            .provider(provider)
            .tools(Arc::new(TestTools))
            .max_iterations(0)
            .build();
        assert!(matches!(err, Err(AgentError::Config(_))));
    }

    #[test]
    fn test_config_from_env() {
        temp_env::with_vars(
            [("AGENT_MAX_ITERATIONS", Some("8")), ("AGENT_TIMEOUT_SECS", Some("15"))],
            || {
                let config = ExecutorConfig::from_env().unwrap();
                assert_eq!(config.max_iterations, 8);
                assert_eq!(config.timeout, Duration::from_secs(15));
            },
        );
        temp_env::with_vars(
            [("AGENT_MAX_ITERATIONS", Some("lots")), ("AGENT_TIMEOUT_SECS", None::<&str>)],
            || assert!(ExecutorConfig::from_env().is_err()),
        );
        temp_env::with_vars(
            [("AGENT_MAX_ITERATIONS", None::<&str>), ("AGENT_TIMEOUT_SECS", None::<&str>)],
            || {
                let config = ExecutorConfig::from_env().unwrap();
                assert_eq!(config.max_iterations, 5);
                assert_eq!(config.timeout, Duration::from_secs(60));
            },
        );
    }
}
