//! The per-session tool registry.
//!
//! The registry owns every loaded capability module for one session and is
//! the single dispatch boundary the orchestrator talks to. Loading a
//! module (constructing it and running its one-time setup) and importing
//! it (making it usable by the model) are separate steps: every cataloged
//! module is loaded at session start so lifecycle hooks reach it, but the
//! model only sees modules it has explicitly imported.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use murmur_core::error::ModuleError;
use murmur_core::module::{
    CapabilityDescriptor, CapabilityModule, ModuleContext, ModuleDocs, ToolReply,
};
use serde_json::Value;
use tracing::{debug, warn};

/// Constructor for one cataloged module.
pub type ModuleBuilder = fn(ModuleContext) -> Arc<dyn CapabilityModule>;

#[derive(Clone)]
struct RegistryEntry {
    module: Arc<dyn CapabilityModule>,
    functions: HashMap<String, CapabilityDescriptor>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, RegistryEntry>,
    imported: HashSet<String>,
}

/// Per-session table of loaded capability modules.
///
/// Interior state sits behind a brief, non-async mutex; module calls are
/// always awaited outside it, so a long-running tool call never blocks
/// lifecycle hooks or transport-message dispatch.
pub struct ToolRegistry {
    ctx: ModuleContext,
    builders: Vec<(&'static str, ModuleBuilder)>,
    state: Mutex<RegistryState>,
}

impl ToolRegistry {
    /// A registry over the built-in module catalog.
    pub fn new(ctx: ModuleContext) -> Self {
        Self::with_modules(ctx, crate::catalog())
    }

    /// A registry over an explicit catalog (used by tests).
    pub fn with_modules(ctx: ModuleContext, builders: Vec<(&'static str, ModuleBuilder)>) -> Self {
        Self {
            ctx,
            builders,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Names of all constructible modules.
    pub fn available(&self) -> Vec<&'static str> {
        self.builders.iter().map(|(name, _)| *name).collect()
    }

    /// Names of all loaded modules.
    pub fn loaded(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_imported(&self, name: &str) -> bool {
        self.lock().imported.contains(name)
    }

    /// Instantiate and set up a cataloged module. Idempotent per name.
    pub async fn load(&self, name: &str) -> Result<(), ModuleError> {
        let builder = self
            .builders
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, b)| *b)
            .ok_or_else(|| ModuleError::UnknownModule {
                name: name.to_string(),
                available: self.available().join(", "),
            })?;

        if self.lock().entries.contains_key(name) {
            return Ok(());
        }

        debug!(module = %name, "Loading capability module");
        let module = builder(self.ctx.clone());
        module.setup().await;

        let functions = module
            .capabilities()
            .iter()
            .map(|cap| {
                (
                    cap.name.to_string(),
                    CapabilityDescriptor::from_capability(module.name(), cap),
                )
            })
            .collect();

        // Another load may have won the race while setup ran; the first
        // instance stays (at most one instance per module name).
        self.lock()
            .entries
            .entry(name.to_string())
            .or_insert(RegistryEntry { module, functions });
        Ok(())
    }

    /// Load every cataloged module, logging failures.
    pub async fn load_all(&self) {
        for name in self.available() {
            if let Err(e) = self.load(name).await {
                warn!(module = %name, error = %e, "Failed to load module");
            }
        }
    }

    /// Make a module usable by the model; returns its documentation.
    pub async fn import(&self, name: &str) -> Result<ModuleDocs, ModuleError> {
        self.load(name).await?;
        let mut state = self.lock();
        state.imported.insert(name.to_string());
        let entry = state
            .entries
            .get(name)
            .expect("imported module must be loaded");
        Ok(entry.module.docs())
    }

    /// Dispatch one declared function on an imported module.
    pub async fn invoke(
        &self,
        module: &str,
        function: &str,
        args: Value,
    ) -> Result<ToolReply, ModuleError> {
        let entry = {
            let state = self.lock();
            if !state.imported.contains(module) {
                return Err(ModuleError::NotImported(module.to_string()));
            }
            state
                .entries
                .get(module)
                .cloned()
                .ok_or_else(|| ModuleError::NotImported(module.to_string()))?
        };

        if !entry.functions.contains_key(function) {
            return Err(ModuleError::FunctionNotFound {
                module: module.to_string(),
                function: function.to_string(),
            });
        }

        entry.module.invoke(function, args).await
    }

    /// Route a module-scoped client payload to the module's
    /// transport-message hook. Same import gate as `invoke`.
    pub async fn dispatch_transport_message(
        &self,
        tool: &str,
        data: Value,
    ) -> Result<(), ModuleError> {
        let module = {
            let state = self.lock();
            if !state.imported.contains(tool) {
                return Err(ModuleError::NotImported(tool.to_string()));
            }
            state
                .entries
                .get(tool)
                .map(|e| e.module.clone())
                .ok_or_else(|| ModuleError::NotImported(tool.to_string()))?
        };
        module.on_transport_message(data).await;
        Ok(())
    }

    pub async fn broadcast_wake_word_detected(&self) {
        for module in self.all_modules() {
            module.on_wake_word_detected().await;
        }
    }

    pub async fn broadcast_wake_word_cleared(&self) {
        for module in self.all_modules() {
            module.on_wake_word_cleared().await;
        }
    }

    fn all_modules(&self) -> Vec<Arc<dyn CapabilityModule>> {
        self.lock()
            .entries
            .values()
            .map(|e| e.module.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use async_trait::async_trait;
    use murmur_core::module::Capability;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    static PING_CAPS: &[Capability] = &[
        Capability::new("ping", &[], "Replies with pong."),
        Capability::new("fail", &[], "Always fails."),
    ];

    static WAKE_CALLS: AtomicU32 = AtomicU32::new(0);

    struct PingModule;

    #[async_trait]
    impl CapabilityModule for PingModule {
        fn name(&self) -> &'static str {
            "ping"
        }

        fn capabilities(&self) -> &'static [Capability] {
            PING_CAPS
        }

        async fn invoke(&self, function: &str, _args: Value) -> Result<ToolReply, ModuleError> {
            match function {
                "ping" => Ok(ToolReply::value(json!("pong"))),
                "fail" => Err(ModuleError::ExecutionFailed {
                    module: "ping".into(),
                    function: "fail".into(),
                    reason: "synthetic failure".into(),
                }),
                other => Err(ModuleError::FunctionNotFound {
                    module: "ping".into(),
                    function: other.into(),
                }),
            }
        }

        async fn on_wake_word_detected(&self) {
            WAKE_CALLS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ping_builder(_ctx: ModuleContext) -> Arc<dyn CapabilityModule> {
        Arc::new(PingModule)
    }

    fn test_registry() -> (ToolRegistry, tempfile::TempDir) {
        let (ctx, dir) = testing::context();
        (
            ToolRegistry::with_modules(ctx, vec![("ping", ping_builder)]),
            dir,
        )
    }

    #[tokio::test]
    async fn loaded_but_not_imported_is_invisible_to_dispatch() {
        let (registry, _dir) = test_registry();
        registry.load_all().await;
        assert_eq!(registry.loaded(), vec!["ping"]);

        let err = registry.invoke("ping", "ping", json!({})).await.unwrap_err();
        assert!(matches!(err, ModuleError::NotImported(_)));
        assert_eq!(err.to_string(), "Module 'ping' not imported.");
    }

    #[tokio::test]
    async fn import_returns_docs_and_enables_dispatch() {
        let (registry, _dir) = test_registry();
        registry.load_all().await;

        let docs = registry.import("ping").await.unwrap();
        assert_eq!(docs.functions.len(), 2);
        assert_eq!(docs.functions[0].module, "ping");

        let reply = registry.invoke("ping", "ping", json!({})).await.unwrap();
        assert_eq!(reply.render(), "pong");
    }

    #[tokio::test]
    async fn unknown_function_is_function_not_found() {
        let (registry, _dir) = test_registry();
        registry.import("ping").await.unwrap();

        let err = registry
            .invoke("ping", "bogus", json!({}))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Function 'bogus' not found in module 'ping'."
        );
    }

    #[tokio::test]
    async fn unknown_module_lists_available_names() {
        let (registry, _dir) = test_registry();
        let err = registry.import("teleporter").await.unwrap_err();
        assert!(matches!(err, ModuleError::UnknownModule { .. }));
        assert!(err.to_string().contains("ping"));
    }

    #[tokio::test]
    async fn module_failure_is_an_error_value_not_a_fault() {
        let (registry, _dir) = test_registry();
        registry.import("ping").await.unwrap();

        let err = registry.invoke("ping", "fail", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("synthetic failure"));
    }

    #[tokio::test]
    async fn load_is_idempotent_per_module_name() {
        let (registry, _dir) = test_registry();
        registry.load("ping").await.unwrap();
        let first = registry.all_modules();
        registry.load("ping").await.unwrap();
        let second = registry.all_modules();
        assert_eq!(first.len(), 1);
        assert!(Arc::ptr_eq(&first[0], &second[0]));
    }

    #[tokio::test]
    async fn wake_word_broadcast_reaches_loaded_modules() {
        let (registry, _dir) = test_registry();
        registry.load_all().await;

        // Imported or not, a loaded module gets lifecycle hooks.
        let before = WAKE_CALLS.load(Ordering::SeqCst);
        registry.broadcast_wake_word_detected().await;
        registry.broadcast_wake_word_detected().await;
        assert_eq!(WAKE_CALLS.load(Ordering::SeqCst), before + 2);
    }

    #[tokio::test]
    async fn transport_message_requires_import() {
        let (registry, _dir) = test_registry();
        registry.load_all().await;

        let err = registry
            .dispatch_transport_message("ping", json!({"message": "X"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::NotImported(_)));

        registry.import("ping").await.unwrap();
        registry
            .dispatch_transport_message("ping", json!({"message": "X"}))
            .await
            .unwrap();
    }
}
