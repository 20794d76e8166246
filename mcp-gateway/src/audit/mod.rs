//! Immutable audit logging
//!
//! Provides tamper-evident audit trails using BLAKE3 hash chaining. Every
//! gateway-relevant event (tool invocation, server registration, circuit
//! trips, workflow runs) is sealed into the chain and persisted durably.
//!
//! # Architecture
//!
//! An acton-reactive actor (`AuditAgent`) processes all audit events
//! sequentially, guaranteeing correct hash chain ordering. Callers send
//! events via fire-and-forget message passing, so audit logging never
//! blocks request handling.

pub mod agent;
pub mod chain;
pub mod config;
pub mod event;
pub mod logger;
pub mod storage;

pub use agent::AuditAgent;
pub use chain::{verify_chain, AuditChain, ChainVerificationError};
pub use config::AuditConfig;
pub use event::AuditEvent;
pub use logger::AuditLogger;
pub use storage::AuditStorage;
