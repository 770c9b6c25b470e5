//! A per-user session and its run loop.
//!
//! A session owns the transcript, the tool registry, and the run lock.
//! One run is one lock-guarded pass of the loop: consume seed messages,
//! then keep asking the model for its next action until it ends the
//! exchange. Every step — seed or model action — is appended to the
//! transcript, so the transcript is the causal record of the session.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use murmur_core::action::parse_output;
use murmur_core::error::{Error, ModuleError};
use murmur_core::message::{Message, MessageKind, WireMessage};
use murmur_core::module::{
    CapabilityDescriptor, ModuleContext, ModuleDocs, render_value,
};
use murmur_core::provider::CompletionClient;
use murmur_core::transport::{OutboundEvent, Transport};
use murmur_modules::registry::{ModuleBuilder, ToolRegistry};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

const DEFAULT_PROMPT: &str = include_str!("prompt.md");

/// The body of a `<tool>` action.
#[derive(Debug, Deserialize)]
struct ToolCall {
    module: String,
    function: String,
    #[serde(default)]
    args: Value,
}

pub struct Session {
    user_id: String,
    transcript: tokio::sync::Mutex<Vec<Message>>,
    run_lock: tokio::sync::Mutex<()>,
    wake_word_active: AtomicBool,
    registry: ToolRegistry,
    transport: Arc<dyn Transport>,
    client: Arc<dyn CompletionClient>,
}

impl Session {
    /// Create a session over the built-in module catalog.
    pub async fn new(ctx: ModuleContext, prompt_override: Option<&str>) -> Arc<Self> {
        Self::with_catalog(ctx, prompt_override, murmur_modules::catalog()).await
    }

    /// Create a session over an explicit module catalog.
    pub async fn with_catalog(
        ctx: ModuleContext,
        prompt_override: Option<&str>,
        catalog: Vec<(&'static str, ModuleBuilder)>,
    ) -> Arc<Self> {
        let available: Vec<&str> = catalog.iter().map(|(name, _)| *name).collect();
        let prompt = build_system_prompt(prompt_override, &available);

        let session = Arc::new(Self {
            user_id: ctx.user_id.clone(),
            transcript: tokio::sync::Mutex::new(vec![Message::system(prompt)]),
            run_lock: tokio::sync::Mutex::new(()),
            wake_word_active: AtomicBool::new(false),
            transport: ctx.transport.clone(),
            client: ctx.client.clone(),
            registry: ToolRegistry::with_modules(ctx, catalog),
        });
        session.registry.load_all().await;
        info!(user = %session.user_id, "Session created");
        session
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn wake_word_active(&self) -> bool {
        self.wake_word_active.load(Ordering::SeqCst)
    }

    pub async fn transcript(&self) -> Vec<Message> {
        self.transcript.lock().await.clone()
    }

    /// Drive one run: seed messages first, then model actions until `end`.
    ///
    /// Runs are strictly serialized per session — a second caller blocks
    /// here until the current run terminates. Starting a run always clears
    /// the wake-word window.
    pub async fn run(&self, seeds: Vec<Message>) -> Result<(), Error> {
        let _guard = self.run_lock.lock().await;
        self.wake_word_active.store(false, Ordering::SeqCst);
        self.registry.broadcast_wake_word_cleared().await;

        let mut pending = VecDeque::from(seeds);
        loop {
            let message = match pending.pop_front() {
                Some(seed) => seed,
                None => match self.next_action().await {
                    Ok(message) => message,
                    Err(e) => {
                        // The client is still owed a terminal notice.
                        let _ = self.transport.send(OutboundEvent::End).await;
                        return Err(e);
                    }
                },
            };

            debug!(user = %self.user_id, kind = %message.kind, "Appending turn");
            self.push(message.clone()).await;

            match message.kind {
                MessageKind::Tool => {
                    for reply in self.dispatch_tool(&message.content).await {
                        self.push(reply).await;
                    }
                }
                MessageKind::End => {
                    self.notify(OutboundEvent::End).await;
                    break;
                }
                MessageKind::Assistant => {
                    self.notify(OutboundEvent::Assistant {
                        content: message.content.clone(),
                    })
                    .await;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Ask the model for the next action over the serialized transcript.
    async fn next_action(&self) -> Result<Message, Error> {
        let wire: Vec<WireMessage> = {
            let transcript = self.transcript.lock().await;
            transcript.iter().map(Message::to_wire).collect()
        };
        let raw = self.client.complete(&wire).await?;

        let mut actions = parse_output(&raw);
        if actions.len() > 1 {
            warn!(
                user = %self.user_id,
                discarded = actions.len() - 1,
                "Model emitted multiple actions in one turn; keeping the first"
            );
        }
        let action = actions.remove(0);
        Ok(Message::new(
            MessageKind::from(action.tag.as_str()),
            action.content,
        ))
    }

    /// Execute a `<tool>` action and return the messages it produces, in
    /// transcript order. Every failure folds into an `error` message — a
    /// tool can never abort the run.
    async fn dispatch_tool(&self, content: &str) -> Vec<Message> {
        let call: ToolCall = match serde_json::from_str(content) {
            Ok(call) => call,
            Err(e) => return vec![Message::error(format!("Invalid tool call: {e}"))],
        };

        // Tell the client what is about to execute, before it does.
        self.notify(OutboundEvent::Tool {
            module: call.module.clone(),
            function: call.function.clone(),
            args: call.args.clone(),
        })
        .await;

        if call.module == "internal" {
            return self.dispatch_internal(&call).await;
        }

        match self
            .registry
            .invoke(&call.module, &call.function, call.args)
            .await
        {
            Ok(reply) => {
                let mut messages = reply.extras.clone();
                messages.push(Message::tool_response(reply.render()));
                messages
            }
            Err(e) => vec![Message::error(e.to_string())],
        }
    }

    /// The built-in `internal` module: importing capability modules.
    async fn dispatch_internal(&self, call: &ToolCall) -> Vec<Message> {
        if call.function != "add_tool" {
            let err = ModuleError::FunctionNotFound {
                module: "internal".into(),
                function: call.function.clone(),
            };
            return vec![Message::error(err.to_string())];
        }
        let Some(name) = call.args.get("name").and_then(Value::as_str) else {
            return vec![Message::error(
                ModuleError::InvalidArguments("missing string argument 'name'".into()).to_string(),
            )];
        };

        match self.registry.import(name).await {
            Ok(docs) => {
                info!(user = %self.user_id, module = %name, "Module imported");
                let docs = serde_json::to_value(docs).unwrap_or_default();
                vec![Message::tool_response(render_value(&docs))]
            }
            Err(e) => vec![Message::error(e.to_string())],
        }
    }

    /// The wake word was heard: open the listening window and tell every
    /// loaded module.
    pub async fn wake_word_detected(&self) {
        self.wake_word_active.store(true, Ordering::SeqCst);
        self.registry.broadcast_wake_word_detected().await;
    }

    /// Route a module-scoped client payload through the dispatch contract.
    pub async fn handle_transport_message(&self, tool: &str, data: Value) {
        if let Err(e) = self.registry.dispatch_transport_message(tool, data).await {
            warn!(user = %self.user_id, tool = %tool, error = %e, "Transport message rejected");
        }
    }

    async fn push(&self, message: Message) {
        self.transcript.lock().await.push(message);
    }

    async fn notify(&self, event: OutboundEvent) {
        if let Err(e) = self.transport.send(event).await {
            warn!(user = %self.user_id, error = %e, "Failed to notify transport");
        }
    }

    /// Write the transcript to the session cache, one file per closed
    /// session. Skipped when nothing beyond the initial system message
    /// was recorded.
    pub async fn persist(&self, dir: &Path) -> std::io::Result<Option<PathBuf>> {
        let transcript = self.transcript.lock().await.clone();
        if transcript.len() <= 1 {
            return Ok(None);
        }

        std::fs::create_dir_all(dir)?;
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let suffix: String = uuid::Uuid::new_v4().to_string().chars().take(4).collect();
        let path = dir.join(format!("{stamp} [{suffix}].json"));
        std::fs::write(&path, serde_json::to_string_pretty(&transcript)?)?;
        info!(user = %self.user_id, path = %path.display(), "Transcript persisted");
        Ok(Some(path))
    }

    /// Persist under the run lock, so a destructive clear waits for any
    /// in-flight run instead of racing its transcript writes.
    pub async fn persist_locked(&self, dir: &Path) -> std::io::Result<Option<PathBuf>> {
        let _guard = self.run_lock.lock().await;
        self.persist(dir).await
    }
}

/// The descriptor set for the always-available `internal` module.
pub fn internal_docs(available: &[&str]) -> ModuleDocs {
    ModuleDocs {
        functions: vec![CapabilityDescriptor {
            module: "internal".into(),
            function: "add_tool".into(),
            args: vec!["name".into()],
            description: format!(
                "Imports a capability module and returns its documentation. Available modules: {}.",
                available.join(", ")
            ),
        }],
    }
}

fn build_system_prompt(prompt_override: Option<&str>, available: &[&str]) -> String {
    let base = prompt_override.unwrap_or(DEFAULT_PROMPT);
    let docs = serde_json::to_string_pretty(&internal_docs(available)).unwrap_or_default();
    base.replace("[[INTERNAL_DOCS]]", &docs)
}


#[cfg(test)]
mod tests {
    use super::testing::{RecordingTransport, ScriptedClient, context};
    use super::*;
    use murmur_core::module::{Capability, CapabilityModule, ToolReply};
    use serde_json::json;
    use std::time::Duration;

    async fn bare_session(
        client: Arc<dyn CompletionClient>,
    ) -> (Arc<Session>, Arc<RecordingTransport>, tempfile::TempDir) {
        let transport = Arc::new(RecordingTransport::default());
        let (ctx, dir) = context(client, transport.clone());
        let session = Session::with_catalog(ctx, None, vec![]).await;
        (session, transport, dir)
    }

    #[tokio::test]
    async fn system_prompt_includes_internal_docs() {
        let client = Arc::new(ScriptedClient::new([]));
        let (session, _transport, _dir) = bare_session(client).await;
        let transcript = session.transcript().await;
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].kind, MessageKind::System);
        assert!(transcript[0].content.contains("add_tool"));
        assert!(!transcript[0].content.contains("[[INTERNAL_DOCS]]"));
    }

    #[tokio::test]
    async fn seeded_end_terminates_without_model_call() {
        let client = Arc::new(ScriptedClient::new([]));
        let (session, transport, _dir) = bare_session(client).await;

        session.run(vec![Message::end()]).await.unwrap();

        let transcript = session.transcript().await;
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].kind, MessageKind::End);
        assert_eq!(transport.events(), vec![OutboundEvent::End]);
    }

    #[tokio::test]
    async fn assistant_actions_notify_and_continue() {
        let client = Arc::new(ScriptedClient::new([
            "<assistant>hello there</assistant>",
            "<end></end>",
        ]));
        let (session, transport, _dir) = bare_session(client).await;

        session.run(vec![Message::user("hi")]).await.unwrap();

        let events = transport.events();
        assert_eq!(
            events,
            vec![
                OutboundEvent::Assistant {
                    content: "hello there".into()
                },
                OutboundEvent::End,
            ]
        );

        let kinds: Vec<String> = session
            .transcript()
            .await
            .iter()
            .map(|m| m.kind.to_string())
            .collect();
        assert_eq!(kinds, vec!["system", "user", "assistant", "end"]);
    }

    #[tokio::test]
    async fn multiple_actions_keep_only_the_first() {
        let client = Arc::new(ScriptedClient::new([
            "<assistant>first</assistant><assistant>second</assistant><end></end>",
            "<end></end>",
        ]));
        let (session, transport, _dir) = bare_session(client).await;

        session.run(vec![Message::user("hi")]).await.unwrap();

        assert_eq!(
            transport.events(),
            vec![
                OutboundEvent::Assistant {
                    content: "first".into()
                },
                OutboundEvent::End,
            ]
        );
        let transcript = session.transcript().await;
        assert!(transcript.iter().all(|m| m.content != "second"));
    }

    #[tokio::test]
    async fn tool_call_to_unimported_module_folds_into_error() {
        let catalog = murmur_modules::catalog();
        let client = Arc::new(ScriptedClient::new([
            r#"<tool>{"module": "clock", "function": "create_timer", "args": {"duration": 1, "unit": "seconds"}}</tool>"#,
            "<end></end>",
        ]));
        let transport = Arc::new(RecordingTransport::default());
        let (ctx, _dir) = context(client, transport.clone());
        let session = Session::with_catalog(ctx, None, catalog).await;

        session.run(vec![Message::user("timer please")]).await.unwrap();

        let transcript = session.transcript().await;
        let error = transcript
            .iter()
            .find(|m| m.kind == MessageKind::Error)
            .expect("error message in transcript");
        assert_eq!(error.content, "Module 'clock' not imported.");
    }

    #[tokio::test]
    async fn add_tool_imports_and_returns_documentation() {
        let catalog = murmur_modules::catalog();
        let client = Arc::new(ScriptedClient::new([
            r#"<tool>{"module": "internal", "function": "add_tool", "args": {"name": "time"}}</tool>"#,
            r#"<tool>{"module": "time", "function": "get_current_time", "args": {}}</tool>"#,
            "<end></end>",
        ]));
        let transport = Arc::new(RecordingTransport::default());
        let (ctx, _dir) = context(client, transport.clone());
        let session = Session::with_catalog(ctx, None, catalog).await;

        session.run(vec![Message::user("what time is it")]).await.unwrap();

        let transcript = session.transcript().await;
        let responses: Vec<&Message> = transcript
            .iter()
            .filter(|m| m.kind == MessageKind::ToolResponse)
            .collect();
        assert_eq!(responses.len(), 2);
        assert!(responses[0].content.contains("get_current_time"));
        assert!(responses[1].content.starts_with("time:"));
    }

    #[tokio::test]
    async fn malformed_tool_body_is_recoverable() {
        let client = Arc::new(ScriptedClient::new([
            "<tool>not json at all</tool>",
            "<end></end>",
        ]));
        let (session, _transport, _dir) = bare_session(client).await;

        session.run(vec![Message::user("go")]).await.unwrap();

        let transcript = session.transcript().await;
        let error = transcript
            .iter()
            .find(|m| m.kind == MessageKind::Error)
            .unwrap();
        assert!(error.content.starts_with("Invalid tool call:"));
    }

    #[tokio::test]
    async fn tool_notice_precedes_tool_response() {
        let catalog = murmur_modules::catalog();
        let client = Arc::new(ScriptedClient::new([
            r#"<tool>{"module": "internal", "function": "add_tool", "args": {"name": "time"}}</tool>"#,
            "<end></end>",
        ]));
        let transport = Arc::new(RecordingTransport::default());
        let (ctx, _dir) = context(client, transport.clone());
        let session = Session::with_catalog(ctx, None, catalog).await;

        session.run(vec![Message::user("import time")]).await.unwrap();

        match &transport.events()[0] {
            OutboundEvent::Tool { module, function, .. } => {
                assert_eq!(module, "internal");
                assert_eq!(function, "add_tool");
            }
            other => panic!("expected tool notice first, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn provider_failure_still_sends_end() {
        // Script exhausted immediately: the first model call errors.
        let client = Arc::new(ScriptedClient::new([]));
        let (session, transport, _dir) = bare_session(client).await;

        let result = session.run(vec![Message::user("hello")]).await;
        assert!(result.is_err());
        assert_eq!(transport.events(), vec![OutboundEvent::End]);
    }

    #[tokio::test]
    async fn concurrent_runs_never_interleave() {
        let client = Arc::new(
            ScriptedClient::new(["<assistant>slow reply</assistant>", "<end></end>"])
                .with_delay(Duration::from_millis(30)),
        );
        let (session, _transport, _dir) = bare_session(client).await;

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.run(vec![Message::user("first")]).await })
        };
        // Give the first run time to take the lock.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .run(vec![
                        Message::user("second"),
                        Message::assistant("queued reply"),
                        Message::end(),
                    ])
                    .await
            })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let kinds: Vec<String> = session
            .transcript()
            .await
            .iter()
            .map(|m| format!("{}:{}", m.kind, m.content))
            .collect();
        // The second run's messages all come after the first run's end.
        let end_pos = kinds.iter().position(|k| k == "end:").unwrap();
        let second_pos = kinds.iter().position(|k| k == "user:second").unwrap();
        assert!(second_pos > end_pos, "transcript interleaved: {kinds:?}");
    }

    #[tokio::test]
    async fn run_clears_the_wake_word_window() {
        let client = Arc::new(ScriptedClient::new([]));
        let (session, _transport, _dir) = bare_session(client).await;

        session.wake_word_detected().await;
        assert!(session.wake_word_active());

        session.run(vec![Message::end()]).await.unwrap();
        assert!(!session.wake_word_active());
    }

    #[tokio::test]
    async fn persist_skips_untouched_sessions() {
        let client = Arc::new(ScriptedClient::new([]));
        let (session, _transport, _dir) = bare_session(client).await;
        let cache = tempfile::tempdir().unwrap();

        assert!(session.persist(cache.path()).await.unwrap().is_none());

        session.run(vec![Message::user("hi"), Message::end()]).await.unwrap();
        let path = session
            .persist(cache.path())
            .await
            .unwrap()
            .expect("transcript file");
        let text = std::fs::read_to_string(path).unwrap();
        let records: Vec<Message> = serde_json::from_str(&text).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].kind, MessageKind::User);
        assert_eq!(records[1].content, "hi");
    }

    // --- Extras ordering through a purpose-built module ---

    static EXTRAS_CAPS: &[Capability] =
        &[Capability::new("choices", &[], "Returns alternatives.")];

    struct ExtrasModule;

    #[async_trait::async_trait]
    impl CapabilityModule for ExtrasModule {
        fn name(&self) -> &'static str {
            "extras"
        }

        fn capabilities(&self) -> &'static [Capability] {
            EXTRAS_CAPS
        }

        async fn invoke(
            &self,
            _function: &str,
            _args: Value,
        ) -> Result<ToolReply, murmur_core::error::ModuleError> {
            Ok(ToolReply::with_extras(
                json!({"error": "ambiguous", "options": ["a", "b"]}),
                vec![Message::assistant("a or b?"), Message::end()],
            ))
        }
    }

    #[tokio::test]
    async fn extras_precede_the_tool_response_in_the_transcript() {
        let client = Arc::new(ScriptedClient::new([
            r#"<tool>{"module": "extras", "function": "choices", "args": {}}</tool>"#,
            "<end></end>",
        ]));
        let transport = Arc::new(RecordingTransport::default());
        let (ctx, _dir) = context(client, transport.clone());
        let session = Session::with_catalog(
            ctx,
            None,
            vec![("extras", |_ctx| {
                Arc::new(ExtrasModule) as Arc<dyn CapabilityModule>
            })],
        )
        .await;
        session.registry.import("extras").await.unwrap();

        session.run(vec![Message::user("play something")]).await.unwrap();

        let kinds: Vec<String> = session
            .transcript()
            .await
            .iter()
            .map(|m| m.kind.to_string())
            .collect();
        assert_eq!(
            kinds,
            vec!["system", "user", "tool", "assistant", "end", "tool_response", "end"]
        );
    }
}
