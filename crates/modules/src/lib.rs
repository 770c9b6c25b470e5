//! Capability modules and the tool registry for Murmur.
//!
//! Modules give the assistant the ability to act in the world: play
//! music, drive smart-home devices, search the web, run timers, and do
//! time arithmetic. Each module declares a static capability table; the
//! registry loads them per session and dispatches model-requested calls.

pub mod activation;
pub mod clock;
pub mod home;
pub mod internet;
pub mod player;
pub mod registry;
pub mod time;

use std::sync::Arc;

use murmur_core::module::{CapabilityModule, ModuleContext};

pub use activation::{ActivationFailure, ActivationGate, ActivationPolicy, run_with_activation};
pub use registry::{ModuleBuilder, ToolRegistry};

/// The built-in module catalog: name → constructor, in the order the
/// modules are advertised.
pub fn catalog() -> Vec<(&'static str, ModuleBuilder)> {
    vec![
        ("player", |ctx: ModuleContext| {
            Arc::new(player::PlayerModule::new(ctx)) as Arc<dyn CapabilityModule>
        }),
        ("time", |ctx: ModuleContext| {
            Arc::new(time::TimeModule::new(ctx)) as Arc<dyn CapabilityModule>
        }),
        ("home", |ctx: ModuleContext| {
            Arc::new(home::HomeModule::new(ctx)) as Arc<dyn CapabilityModule>
        }),
        ("clock", |ctx: ModuleContext| {
            Arc::new(clock::ClockModule::new(ctx)) as Arc<dyn CapabilityModule>
        }),
        ("internet", |ctx: ModuleContext| {
            Arc::new(internet::InternetModule::new(ctx)) as Arc<dyn CapabilityModule>
        }),
    ]
}
