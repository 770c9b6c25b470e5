//! Core domain types and traits for the Murmur assistant gateway.
//!
//! This crate has no I/O of its own beyond the settings files; everything
//! here is the vocabulary the other crates speak: messages and their wire
//! format, the tag-protocol parser, the capability-module contract, the
//! transport event types, the completion-client trait, and the error
//! taxonomy.

pub mod action;
pub mod error;
pub mod message;
pub mod module;
pub mod provider;
pub mod settings;
pub mod transport;

pub use action::{ActionRecord, parse_output};
pub use error::{Error, ModuleError, ProviderError, Result, TransportError};
pub use message::{Message, MessageKind, Role, WireMessage};
pub use module::{
    Capability, CapabilityDescriptor, CapabilityModule, ModuleContext, ModuleDocs, ModuleTuning,
    RunRequest, RunRequester, ToolReply,
};
pub use provider::CompletionClient;
pub use settings::{ScopedSettings, SettingsStore};
pub use transport::{InboundEvent, OutboundEvent, Transport};
