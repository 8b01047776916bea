//! Session host for the desktop control surface.
//!
//! A [`host::Host`] owns one [`session::Session`] per conversation. Sessions accept command
//! envelopes, pull the turn's events from an [`agent_link::AgentLink`], gate risky tool calls
//! behind the [`broker::PermissionBroker`] and record every decision in the shared
//! [`audit::AuditRecorder`].

pub mod agent_link;
pub mod audit;
pub mod broker;
pub mod cli;
pub mod config;
pub mod health;
pub mod host;
pub mod scenarios;
pub mod session;
