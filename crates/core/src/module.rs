//! The capability module contract.
//!
//! A capability module is a pluggable unit exposing model-invocable
//! functions plus lifecycle hooks. Each module declares its functions in a
//! static capability table; the table is both the dispatch allowlist and
//! the source of the documentation injected into the system prompt.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ModuleError;
use crate::message::Message;
use crate::provider::CompletionClient;
use crate::settings::SettingsStore;
use crate::transport::{OutboundEvent, Transport};

/// One row of a module's statically declared capability table.
///
/// `hidden` rows are dispatchable and can be documented individually (see
/// [`CapabilityModule::describe`]) but are excluded from the module's
/// top-level documentation. They cover functions advertised conditionally,
/// e.g. per device type.
#[derive(Debug, Clone, Copy)]
pub struct Capability {
    pub name: &'static str,
    pub args: &'static [&'static str],
    pub description: &'static str,
    pub hidden: bool,
}

impl Capability {
    pub const fn new(
        name: &'static str,
        args: &'static [&'static str],
        description: &'static str,
    ) -> Self {
        Self {
            name,
            args,
            description,
            hidden: false,
        }
    }

    pub const fn hidden(
        name: &'static str,
        args: &'static [&'static str],
        description: &'static str,
    ) -> Self {
        Self {
            name,
            args,
            description,
            hidden: true,
        }
    }
}

/// Documentation for one model-invocable function, as briefed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub module: String,
    pub function: String,
    pub args: Vec<String>,
    pub description: String,
}

impl CapabilityDescriptor {
    pub fn from_capability(module: &str, cap: &Capability) -> Self {
        Self {
            module: module.to_string(),
            function: cap.name.to_string(),
            args: cap.args.iter().map(|a| a.to_string()).collect(),
            description: cap.description.to_string(),
        }
    }
}

/// A module's documentation: the descriptor set for its visible functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDocs {
    pub functions: Vec<CapabilityDescriptor>,
}

/// The result of a successful tool invocation.
///
/// `value` is the canonical result, rendered into the `tool_response`
/// message. `extras` are follow-up messages appended to the transcript
/// ahead of the tool response — used for "ambiguous, here are the
/// alternatives" flows where the tool wants to speak and end the run
/// itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolReply {
    pub value: Value,
    pub extras: Vec<Message>,
}

impl ToolReply {
    pub fn value(value: Value) -> Self {
        Self {
            value,
            extras: Vec::new(),
        }
    }

    pub fn with_extras(value: Value, extras: Vec<Message>) -> Self {
        Self { value, extras }
    }

    /// Render the canonical value into tool_response content.
    pub fn render(&self) -> String {
        render_value(&self.value)
    }
}

/// Canonical string form of a tool result value.
///
/// Nothing (`null`) renders empty, strings render as themselves,
/// mappings and lists as compact JSON, and other scalars in their natural
/// string form.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Tuning knobs handed to modules that talk to external surfaces.
#[derive(Debug, Clone, Copy)]
pub struct ModuleTuning {
    /// How long to wait for a delegated activation to report readiness.
    pub activation_timeout_ms: u64,
    /// Settle delay after readiness is observed, before retrying.
    pub activation_settle_ms: u64,
    /// Refresh integration tokens when expiry is within this margin.
    pub token_refresh_margin_secs: i64,
}

impl Default for ModuleTuning {
    fn default() -> Self {
        Self {
            activation_timeout_ms: 5_000,
            activation_settle_ms: 250,
            token_refresh_margin_secs: 60,
        }
    }
}

/// A handle for starting a brand-new run on the owning session.
///
/// Implementations hold a *non-owning* reference (registry lookup by user
/// id), so module → session references never form ownership cycles. Runs
/// requested here go through the same lock-guarded entry point as
/// client-initiated runs.
#[async_trait]
pub trait RunRequest: Send + Sync {
    async fn request_run(&self, seeds: Vec<Message>);
}

pub type RunRequester = Arc<dyn RunRequest>;

/// Everything a module needs from its environment, injected at
/// construction time.
#[derive(Clone)]
pub struct ModuleContext {
    pub user_id: String,
    pub settings: SettingsStore,
    pub transport: Arc<dyn Transport>,
    pub runs: RunRequester,
    pub client: Arc<dyn CompletionClient>,
    pub tuning: ModuleTuning,
}

impl ModuleContext {
    /// Send a module-scoped payload to the client, wrapped as a
    /// `tool_message` event. Delivery failures are logged, not surfaced.
    pub async fn send_tool_message(&self, tool: &str, data: Value) {
        let event = OutboundEvent::ToolMessage {
            tool: tool.to_string(),
            data,
        };
        if let Err(e) = self.transport.send(event).await {
            tracing::warn!(tool = %tool, error = %e, "Failed to deliver tool message");
        }
    }
}

/// The core capability-module trait.
#[async_trait]
pub trait CapabilityModule: Send + Sync {
    /// The stable module name (e.g. "player", "clock").
    fn name(&self) -> &'static str;

    /// The statically declared capability table.
    fn capabilities(&self) -> &'static [Capability];

    /// Dispatch one declared function with named arguments.
    async fn invoke(&self, function: &str, args: Value) -> Result<ToolReply, ModuleError>;

    /// One-time setup after construction (load settings, warm caches).
    async fn setup(&self) {}

    /// The wake word was detected on the client.
    async fn on_wake_word_detected(&self) {}

    /// A run started; the client is no longer listening for the wake word.
    async fn on_wake_word_cleared(&self) {}

    /// A module-scoped message arrived from the client.
    async fn on_transport_message(&self, _payload: Value) {}

    /// Documentation for the model: every non-hidden capability.
    fn docs(&self) -> ModuleDocs {
        ModuleDocs {
            functions: self
                .capabilities()
                .iter()
                .filter(|c| !c.hidden)
                .map(|c| CapabilityDescriptor::from_capability(self.name(), c))
                .collect(),
        }
    }

    /// Ad-hoc documentation for a single declared function, hidden or not.
    fn describe(&self, function: &str) -> Option<CapabilityDescriptor> {
        self.capabilities()
            .iter()
            .find(|c| c.name == function)
            .map(|c| CapabilityDescriptor::from_capability(self.name(), c))
    }
}

// --- Argument extraction helpers ---
//
// Tool arguments arrive as a JSON object bound by name. These helpers keep
// the per-module extraction code short and the error text uniform.

pub fn arg_str(args: &Value, name: &str) -> Result<String, ModuleError> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ModuleError::InvalidArguments(format!("missing string argument '{name}'")))
}

pub fn arg_str_opt(args: &Value, name: &str) -> Option<String> {
    args.get(name).and_then(Value::as_str).map(str::to_string)
}

pub fn arg_f64(args: &Value, name: &str) -> Result<f64, ModuleError> {
    args.get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| ModuleError::InvalidArguments(format!("missing numeric argument '{name}'")))
}

pub fn arg_i64_opt(args: &Value, name: &str) -> Option<i64> {
    args.get(name).and_then(Value::as_i64)
}

pub fn arg_bool_opt(args: &Value, name: &str) -> Option<bool> {
    args.get(name).and_then(Value::as_bool)
}

pub fn arg_str_list(args: &Value, name: &str) -> Result<Vec<String>, ModuleError> {
    args.get(name)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| ModuleError::InvalidArguments(format!("missing list argument '{name}'")))
}
