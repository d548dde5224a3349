//! # IPFIX Forwarding Engine
//!
//! A multi-destination IPFIX forwarding storage engine: a shared template
//! manager that renumbers per-source templates into a per-ODID shared ID
//! space, a zero-copy packet builder that assembles size-bounded IPFIX
//! datagrams, and a destination manager that owns non-blocking TCP senders
//! with reconnect/template-replay and pluggable distribution.
//!
//! IPFIX message parsing and XML/CLI configuration parsing are external
//! collaborators; this crate starts from a [`config::ForwardingConfig`]
//! and an already-decoded stream of [`dispatcher::IncomingItem`]s.

pub mod cli;
pub mod config;
pub mod destination;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod packet;
pub mod sender;
pub mod templates;

pub use config::{DestinationConfig, Distribution, ForwardingConfig};
pub use dispatcher::{ForwardingDispatcher, IncomingItem};
pub use error::{ConfigError, ForwardingError};
pub use templates::TemplateType;

/// The current version of the forwarding engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
