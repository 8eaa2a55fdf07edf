use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::agent::directive::{Directive, parse_directive};
use crate::agent::{TraceEvent, TraceFn, emit};
use crate::error::ToolError;
use crate::schema::Schema;

/// Insertion-ordered tool registry, unique by name. Re-inserting a name
/// replaces the definition while keeping its position.
pub type ToolSet = IndexMap<String, ToolDef>;

/// Collects definitions into a registry; later entries win on name collision.
pub fn tool_set(tools: impl IntoIterator<Item = ToolDef>) -> ToolSet {
    let mut set = ToolSet::new();
    for tool in tools {
        set.insert(tool.name().to_string(), tool);
    }
    set
}

/// Seeds with `base`, overlays `extension`; last write per name wins. The
/// inputs are never shared structurally with the result.
pub fn merge_tools(base: &ToolSet, extension: &ToolSet) -> ToolSet {
    let mut merged = base.clone();
    for (name, tool) in extension {
        merged.insert(name.clone(), tool.clone());
    }
    merged
}

type SharedState = Arc<dyn Any + Send + Sync>;

/// Ephemeral per-run bag handed to every tool invocation and to the handoff
/// callback. Clones share the underlying maps, so state written by one tool
/// call is visible to later calls in the same run; the run loop itself never
/// reads or writes it.
#[derive(Clone, Default)]
pub struct ToolContext {
    metadata: Arc<RwLock<HashMap<String, Value>>>,
    state: Arc<RwLock<HashMap<TypeId, SharedState>>>,
}

impl ToolContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut metadata = self.metadata.write().expect("context metadata lock poisoned");
        metadata.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let metadata = self.metadata.read().ok()?;
        metadata.get(key).cloned()
    }

    /// Stores a typed value tools can share across calls, keyed by type.
    pub fn provide<T>(&self, value: T)
    where
        T: Send + Sync + 'static,
    {
        let mut state = self.state.write().expect("context state lock poisoned");
        state.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn shared<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let state = self.state.read().ok()?;
        let value = state.get(&TypeId::of::<T>())?.clone();
        Arc::downcast::<T>(value).ok()
    }
}

impl fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self
            .metadata
            .read()
            .map(|metadata| metadata.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        f.debug_struct("ToolContext").field("metadata", &keys).finish()
    }
}

type ToolHandler =
    dyn Fn(Value, ToolContext) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync;

/// A named function the model can request by emitting a tool directive.
/// Definitions hold no state; the handler runs fresh on every call.
#[derive(Clone)]
pub struct ToolDef {
    name: String,
    description: Option<String>,
    args_schema: Option<Arc<dyn Schema>>,
    handler: Arc<ToolHandler>,
}

impl fmt::Debug for ToolDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDef")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

impl ToolDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            args_schema: None,
            handler: Arc::new(|_args, _context| {
                Box::pin(async {
                    Err(ToolError::Execution(
                        "tool handler not configured".to_string(),
                    ))
                })
            }),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Validates arguments against `schema` before each handler invocation.
    pub fn with_schema<S>(mut self, schema: S) -> Self
    where
        S: Schema + 'static,
    {
        self.args_schema = Some(Arc::new(schema));
        self
    }

    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.handler = Arc::new(move |args, context| Box::pin(handler(args, context)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub async fn execute(&self, args: Value, context: &ToolContext) -> Result<Value, ToolError> {
        let args = match &self.args_schema {
            Some(schema) => schema.parse(&args).map_err(|err| ToolError::InvalidArguments {
                tool: self.name.clone(),
                message: err.to_string(),
            })?,
            None => args,
        };

        (self.handler)(args, context.clone()).await
    }
}

/// Attempts the at-most-one tool call embedded in `content`. Empty registry,
/// absent directive, and unknown names all return `content` unchanged; a
/// match returns the executed tool's rendered result instead. Tool failures
/// propagate.
pub async fn maybe_execute_tool(
    content: &str,
    tools: &ToolSet,
    context: &ToolContext,
    on_trace: Option<&TraceFn>,
) -> Result<String, ToolError> {
    if tools.is_empty() {
        return Ok(content.to_string());
    }

    let Some(Directive::ToolCall { name, args }) = parse_directive(content) else {
        return Ok(content.to_string());
    };

    match dispatch(tools, &name, args, context, on_trace).await? {
        Some(result) => Ok(result),
        None => Ok(content.to_string()),
    }
}

/// Resolves `name` against the registry and runs the tool. `None` means the
/// name is not registered, which callers treat as "nothing happened".
pub(crate) async fn dispatch(
    tools: &ToolSet,
    name: &str,
    args: Value,
    context: &ToolContext,
    on_trace: Option<&TraceFn>,
) -> Result<Option<String>, ToolError> {
    let Some(tool) = tools.get(name) else {
        warn!(tool = %name, "model requested unregistered tool");
        return Ok(None);
    };

    emit(on_trace, || TraceEvent::ToolStart {
        name: name.to_string(),
        args: args.clone(),
    });
    debug!(tool = %name, "executing tool");

    let result = render_result(tool.execute(args, context).await?);

    emit(on_trace, || TraceEvent::ToolStop {
        name: name.to_string(),
        result: result.clone(),
    });

    Ok(Some(result))
}

// Strings pass through untouched; everything else becomes compact JSON.
fn render_result(result: Value) -> String {
    match result {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema::JsonSchema;

    fn echo_tool(name: &str) -> ToolDef {
        ToolDef::new(name)
            .with_description(format!("echo via {name}"))
            .with_handler(|args, _context| async move { Ok(args) })
    }

    #[test]
    fn merge_overrides_by_name_and_keeps_distinct_count() {
        let base = tool_set([echo_tool("alpha"), echo_tool("beta")]);
        let extension = tool_set([
            ToolDef::new("beta")
                .with_description("replacement")
                .with_handler(|_args, _context| async move { Ok(json!("new")) }),
            echo_tool("gamma"),
        ]);

        let merged = merge_tools(&base, &extension);

        assert_eq!(merged.len(), 3);
        assert_eq!(
            merged.get("beta").and_then(ToolDef::description),
            Some("replacement")
        );
        let names = merged.keys().cloned().collect::<Vec<_>>();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn tool_set_is_last_registration_wins() {
        let set = tool_set([
            echo_tool("dup"),
            ToolDef::new("dup").with_description("latest"),
        ]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("dup").and_then(ToolDef::description), Some("latest"));
    }

    #[tokio::test]
    async fn empty_registry_is_a_pass_through() {
        let content = r#"{"tool":"calculator","args":{}}"#;
        let result = maybe_execute_tool(content, &ToolSet::new(), &ToolContext::new(), None)
            .await
            .expect("never fails on empty registry");
        assert_eq!(result, content);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_pass_through() {
        let tools = tool_set([echo_tool("known")]);
        let content = r#"{"tool":"unknown","args":{}}"#;
        let result = maybe_execute_tool(content, &tools, &ToolContext::new(), None)
            .await
            .expect("unknown tools are ignored");
        assert_eq!(result, content);
    }

    #[tokio::test]
    async fn prose_is_a_pass_through() {
        let tools = tool_set([echo_tool("known")]);
        let result = maybe_execute_tool("just words", &tools, &ToolContext::new(), None)
            .await
            .expect("prose is ignored");
        assert_eq!(result, "just words");
    }

    #[tokio::test]
    async fn string_results_pass_through_and_values_are_stringified() {
        let tools = tool_set([
            ToolDef::new("text").with_handler(|_args, _context| async move { Ok(json!("plain")) }),
            ToolDef::new("object")
                .with_handler(|_args, _context| async move { Ok(json!({"answer": 4})) }),
        ]);
        let context = ToolContext::new();

        let text = maybe_execute_tool(r#"{"tool":"text","args":{}}"#, &tools, &context, None)
            .await
            .expect("executes");
        assert_eq!(text, "plain");

        let object = maybe_execute_tool(r#"{"tool":"object","args":{}}"#, &tools, &context, None)
            .await
            .expect("executes");
        assert_eq!(object, r#"{"answer":4}"#);
    }

    #[tokio::test]
    async fn argument_schema_violations_become_invalid_arguments() {
        let schema = JsonSchema::new(json!({
            "type": "object",
            "properties": {"value": {"type": "string"}},
            "required": ["value"],
            "additionalProperties": false
        }))
        .expect("schema is well formed");

        let tool = ToolDef::new("strict")
            .with_schema(schema)
            .with_handler(|_args, _context| async move { Ok(json!("ok")) });

        let err = tool
            .execute(json!({}), &ToolContext::new())
            .await
            .expect_err("must fail");
        match err {
            ToolError::InvalidArguments { tool, message } => {
                assert_eq!(tool, "strict");
                assert!(message.contains("missing required field"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn execution_errors_propagate() {
        let tools = tool_set([ToolDef::new("boom")
            .with_handler(|_args, _context| async move {
                Err(ToolError::Execution("boom".to_string()))
            })]);

        let err = maybe_execute_tool(r#"{"tool":"boom","args":{}}"#, &tools, &ToolContext::new(), None)
            .await
            .expect_err("must fail");
        assert!(matches!(err, ToolError::Execution(_)));
    }

    #[tokio::test]
    async fn context_is_shared_by_reference_across_calls() {
        let tool = ToolDef::new("counter").with_handler(|_args, context| async move {
            let seen = context
                .get("seen")
                .and_then(|value| value.as_u64())
                .unwrap_or(0);
            context.set("seen", seen + 1);
            Ok(json!(seen + 1))
        });
        let tools = tool_set([tool]);
        let context = ToolContext::new();

        for _ in 0..2 {
            maybe_execute_tool(r#"{"tool":"counter","args":{}}"#, &tools, &context, None)
                .await
                .expect("executes");
        }

        assert_eq!(context.get("seen"), Some(json!(2)));
    }

    #[test]
    fn typed_state_round_trips() {
        let context = ToolContext::new();
        context.provide::<u32>(7);
        assert_eq!(context.shared::<u32>().as_deref(), Some(&7));
        assert!(context.shared::<String>().is_none());
    }
}
