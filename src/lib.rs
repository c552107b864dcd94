//! # agent-relay
//!
//! Control plane between a chat surface and coding-agent backends.
//!
//! This library provides:
//! - Admission control: a global concurrency cap with a bounded FIFO queue
//! - Session execution: one run at a time per conversation, crash recovery,
//!   stop/interrupt and safety checks on every tool invocation
//! - Streaming delivery: incremental, throttled rendering of a run as chat
//!   messages that are created, edited and deleted
//!
//! ## Architecture
//!
//! ```text
//!   chat request ──▶ AdmissionController ──▶ SessionDispatcher
//!                     (cap + FIFO queue)          │
//!                                                 ▼
//!                                          AgentSession ──▶ Backend
//!                                                 │      (Claude CLI or
//!                                                 │       Anthropic API)
//!                                                 ▼
//!                                       StreamingDelivery ──▶ ChatTransport
//! ```
//!
//! ## Modules
//! - `admission`: concurrency cap and request queue
//! - `backend`: provider adapters normalized to one event vocabulary
//! - `session`: per-conversation execution engine and session registry
//! - `delivery`: rendering of run events as chat messages
//! - `store`: persistence of backend session handles
//! - `policy`: safety and thinking-budget policies

pub mod admission;
pub mod backend;
pub mod config;
pub mod cost;
pub mod delivery;
pub mod error;
pub mod policy;
pub mod session;
pub mod store;
pub mod util;

#[cfg(test)]
mod testing;

pub use admission::{AdmissionConfig, AdmissionController, RelayRequest};
pub use config::Config;
pub use error::{Error, Result};
pub use session::{AgentSession, SessionDispatcher, SessionManager};
