use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AgentError, GuardError, SchemaError};
use crate::llm::{ChatProvider, ChatRequest, Message, OnDelta};
use crate::schema::Schema;
use crate::tools::{self, ToolContext, ToolDef, ToolSet, merge_tools};

pub(crate) mod directive;

pub use directive::{Directive, parse_directive};

pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const DEFAULT_MAX_TOOL_PASSES: u32 = 3;

/// Fire-and-forget observer; must never influence the run's decisions.
pub type TraceFn = dyn Fn(&TraceEvent) + Send + Sync;

/// Transforms the caller's messages before the run sees them.
pub type InputGuard =
    dyn Fn(Vec<Message>) -> BoxFuture<'static, Result<Vec<Message>, GuardError>> + Send + Sync;

/// Transforms the final content before it is returned.
pub type OutputGuard =
    dyn Fn(String) -> BoxFuture<'static, Result<String, GuardError>> + Send + Sync;

/// Takes over the remainder of a conversation when the model emits a
/// handoff directive; its result becomes the run's result verbatim.
pub type HandoffFn = dyn Fn(String, Vec<Message>, ToolContext) -> BoxFuture<'static, Result<RunResult, AgentError>>
    + Send
    + Sync;

#[derive(Clone, Debug, PartialEq)]
pub enum TraceEvent {
    AgentStart { agent: Option<String> },
    AgentStop,
    LlmRequest { messages: Vec<Message> },
    LlmResponse { content: String },
    ToolStart { name: String, args: Value },
    ToolStop { name: String, result: String },
    Handoff { to: String, reason: Option<String> },
}

pub(crate) fn emit(trace: Option<&TraceFn>, event: impl FnOnce() -> TraceEvent) {
    if let Some(trace) = trace {
        trace(&event());
    }
}

/// Final outcome of a run. `structured` is present only when the caller
/// supplied an output schema and parsing succeeded.
#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
    pub content: String,
    pub structured: Option<Value>,
}

impl RunResult {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            structured: None,
        }
    }
}

/// Static description of an agent: identity, instructions, tool set, and
/// optional guard/trace/handoff hooks. Constructed once and never mutated;
/// derive variants with [`AgentConfig::with`].
#[derive(Clone, Default)]
pub struct AgentConfig {
    pub name: Option<String>,
    pub instructions: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub tools: ToolSet,
    pub input_guard: Option<Arc<InputGuard>>,
    pub output_guard: Option<Arc<OutputGuard>>,
    pub on_trace: Option<Arc<TraceFn>>,
    pub handoff: Option<Arc<HandoffFn>>,
}

impl AgentConfig {
    /// Produces a new config: scalar fields and hooks from the extension win
    /// when set, and the tool sets are re-merged by name with the
    /// extension's definitions replacing same-named ones. Neither input is
    /// mutated, and the merged tool set shares no structure with either.
    pub fn with(&self, extension: AgentConfig) -> AgentConfig {
        AgentConfig {
            name: extension.name.or_else(|| self.name.clone()),
            instructions: extension.instructions.or_else(|| self.instructions.clone()),
            model: extension.model.or_else(|| self.model.clone()),
            temperature: extension.temperature.or(self.temperature),
            tools: merge_tools(&self.tools, &extension.tools),
            input_guard: extension.input_guard.or_else(|| self.input_guard.clone()),
            output_guard: extension.output_guard.or_else(|| self.output_guard.clone()),
            on_trace: extension.on_trace.or_else(|| self.on_trace.clone()),
            handoff: extension.handoff.or_else(|| self.handoff.clone()),
        }
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("name", &self.name)
            .field("instructions", &self.instructions)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct AgentBuilder {
    provider: Option<Arc<dyn ChatProvider>>,
    config: AgentConfig,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            provider: None,
            config: AgentConfig::default(),
        }
    }
}

impl AgentBuilder {
    pub fn provider<P>(mut self, provider: P) -> Self
    where
        P: ChatProvider + 'static,
    {
        self.provider = Some(Arc::new(provider));
        self
    }

    pub fn shared_provider(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Rendered as the leading system message of every run.
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.config.instructions = Some(instructions.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.config.temperature = Some(temperature);
        self
    }

    /// Registers a tool; a later registration under the same name replaces
    /// the earlier one.
    pub fn tool(mut self, tool: ToolDef) -> Self {
        self.config.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = ToolDef>) -> Self {
        for tool in tools {
            self.config.tools.insert(tool.name().to_string(), tool);
        }
        self
    }

    pub fn input_guard<F, Fut>(mut self, guard: F) -> Self
    where
        F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Message>, GuardError>> + Send + 'static,
    {
        self.config.input_guard = Some(Arc::new(move |messages| Box::pin(guard(messages))));
        self
    }

    pub fn output_guard<F, Fut>(mut self, guard: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, GuardError>> + Send + 'static,
    {
        self.config.output_guard = Some(Arc::new(move |content| Box::pin(guard(content))));
        self
    }

    pub fn on_trace<F>(mut self, observer: F) -> Self
    where
        F: Fn(&TraceEvent) + Send + Sync + 'static,
    {
        self.config.on_trace = Some(Arc::new(observer));
        self
    }

    pub fn handoff<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(String, Vec<Message>, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RunResult, AgentError>> + Send + 'static,
    {
        self.config.handoff = Some(Arc::new(move |to, messages, context| {
            Box::pin(handler(to, messages, context))
        }));
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let Some(provider) = self.provider else {
            return Err(AgentError::Config(
                "chat provider must be configured via AgentBuilder::provider(...)".to_string(),
            ));
        };

        if let Some(name) = &self.config.name {
            if name.trim().is_empty() {
                return Err(AgentError::Config("agent name must not be blank".to_string()));
            }
        }

        Ok(Agent {
            provider,
            config: self.config,
        })
    }
}

/// An agent couples a chat provider with a configuration. Runs carry their
/// own history and context, so one agent may serve concurrent runs.
pub struct Agent {
    provider: Arc<dyn ChatProvider>,
    config: AgentConfig,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Per-run options for [`Agent::run`].
#[derive(Default)]
pub struct RunRequest {
    /// New conversation turns, appended after the agent's instructions.
    pub messages: Vec<Message>,
    /// Output schema; the final content must carry a value it accepts.
    pub expect: Option<Arc<dyn Schema>>,
    /// Per-run context; a fresh one is created when absent.
    pub context: Option<ToolContext>,
    pub cancel: Option<CancellationToken>,
    pub on_delta: Option<Arc<OnDelta>>,
    /// Additional provider calls allowed after the first for feeding tool
    /// results back to the model.
    pub max_tool_passes: Option<u32>,
}

impl RunRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Single user turn shorthand.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(vec![Message::user(content)])
    }

    pub fn expect<S>(mut self, schema: S) -> Self
    where
        S: Schema + 'static,
    {
        self.expect = Some(Arc::new(schema));
        self
    }

    pub fn context(mut self, context: ToolContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn on_delta<F>(mut self, on_delta: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_delta = Some(Arc::new(on_delta));
        self
    }

    pub fn max_tool_passes(mut self, passes: u32) -> Self {
        self.max_tool_passes = Some(passes);
        self
    }
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    /// Direct construction for callers that already hold a shared provider.
    pub fn new(provider: Arc<dyn ChatProvider>, config: AgentConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Drives the conversation state machine: guard the input, seed history
    /// from the instructions, then issue bounded turns against the provider,
    /// dispatching at most one tool call per turn and feeding its result
    /// back, until the model answers in plain text, hands off, or the tool
    /// pass budget runs out.
    pub async fn run(&self, request: RunRequest) -> Result<RunResult, AgentError> {
        let RunRequest {
            mut messages,
            expect,
            context,
            cancel,
            on_delta,
            max_tool_passes,
        } = request;

        let config = &self.config;
        let context = context.unwrap_or_default();
        let trace = config.on_trace.as_deref();
        let max_tool_passes = max_tool_passes.unwrap_or(DEFAULT_MAX_TOOL_PASSES);

        if let Some(guard) = &config.input_guard {
            messages = guard(messages).await?;
        }

        let has_instructions = config.instructions.is_some();
        let mut history = Vec::with_capacity(messages.len() + 1);
        if let Some(instructions) = &config.instructions {
            history.push(Message::system(instructions.clone()));
        }
        history.append(&mut messages);

        emit(trace, || TraceEvent::AgentStart {
            agent: config.name.clone(),
        });
        debug!(
            agent = config.name.as_deref().unwrap_or("anonymous"),
            max_tool_passes, "agent run started"
        );

        let temperature = config.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        let mut last_content = String::new();

        for turn in 0..=max_tool_passes {
            let hinted = self.hinted_view(&history, has_instructions);
            emit(trace, || TraceEvent::LlmRequest {
                messages: hinted.clone(),
            });
            debug!(turn, messages = hinted.len(), "requesting completion");

            let completion = self
                .provider
                .chat(ChatRequest {
                    model: config.model.as_deref(),
                    messages: &hinted,
                    temperature,
                    cancel: cancel.as_ref(),
                    on_delta: on_delta.as_deref(),
                })
                .await?;
            last_content = completion.content;

            emit(trace, || TraceEvent::LlmResponse {
                content: last_content.clone(),
            });

            match directive::parse_directive(&last_content) {
                Some(Directive::Handoff { to, reason }) => {
                    emit(trace, || TraceEvent::Handoff {
                        to: to.clone(),
                        reason: reason.clone(),
                    });

                    if let Some(handoff) = &config.handoff {
                        debug!(to = %to, "delegating run via handoff");
                        let result = handoff(to, history, context).await;
                        emit(trace, || TraceEvent::AgentStop);
                        return result;
                    }

                    warn!(to = %to, "handoff requested but no handler configured");
                    break;
                }
                Some(Directive::ToolCall { name, args }) => {
                    if turn == max_tool_passes {
                        debug!(tool = %name, "tool pass budget exhausted; reply is final");
                        break;
                    }

                    match tools::dispatch(&config.tools, &name, args, &context, trace).await? {
                        Some(result) => {
                            history.push(Message::assistant(last_content.clone()));
                            history.push(Message::tool(name, result));
                        }
                        // Unregistered name: the reply stands as final text.
                        None => break,
                    }
                }
                None => break,
            }
        }

        let mut content = last_content;
        if let Some(guard) = &config.output_guard {
            content = guard(content).await?;
        }

        let structured = match &expect {
            Some(schema) => {
                let value = directive::extract_json(&content)
                    .ok_or(AgentError::Output(SchemaError::MissingJson))?;
                Some(schema.parse(&value).map_err(AgentError::Output)?)
            }
            None => None,
        };

        emit(trace, || TraceEvent::AgentStop);
        debug!("agent run finished");

        Ok(RunResult { content, structured })
    }

    /// Per-turn provider view: the accumulated history with a tool-hint
    /// system message inserted after the instructions, present only when
    /// tools are configured.
    fn hinted_view(&self, history: &[Message], has_instructions: bool) -> Vec<Message> {
        if self.config.tools.is_empty() {
            return history.to_vec();
        }

        let mut hinted = history.to_vec();
        let at = usize::from(has_instructions);
        hinted.insert(at, Message::system(tool_hint(&self.config.tools)));
        hinted
    }
}

fn tool_hint(tools: &ToolSet) -> String {
    let mut lines = Vec::with_capacity(tools.len() + 2);
    lines.push("You may invoke at most one tool per reply. Available tools:".to_string());
    for tool in tools.values() {
        match tool.description() {
            Some(description) => lines.push(format!("- {}: {}", tool.name(), description)),
            None => lines.push(format!("- {}", tool.name())),
        }
    }
    lines.push(
        "To invoke a tool, reply with only {\"tool\": \"NAME\", \"args\": OBJECT}.".to_string(),
    );
    lines.join("\n")
}

pub async fn run(agent: &Agent, request: RunRequest) -> Result<RunResult, AgentError> {
    agent.run(request).await
}
