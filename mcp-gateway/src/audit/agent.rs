//! Audit agent (acton-reactive actor)
//!
//! The `AuditAgent` owns the BLAKE3 hash chain state and processes events
//! sequentially, guaranteeing correct chain ordering, then persists each
//! sealed event to the configured storage backend.

use acton_reactive::prelude::*;
use std::sync::Arc;

use super::chain::AuditChain;
use super::config::AuditConfig;
use super::event::AuditEvent;
use super::storage::AuditStorage;

/// State held by the audit agent actor
#[derive(Default)]
pub struct AuditAgentState {
    /// BLAKE3 hash chain state
    pub chain: Option<AuditChain>,
    /// Persistent storage backend (falls back to chain-only, unpersisted, when absent)
    pub storage: Option<Arc<dyn AuditStorage>>,
}

// Manual Debug impl since AuditChain and dyn AuditStorage don't impl Debug
impl std::fmt::Debug for AuditAgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditAgentState")
            .field("chain", &self.chain.is_some())
            .field("storage", &self.storage.is_some())
            .finish()
    }
}

/// Internal message: chain state loaded from storage
///
/// Sent by the spawned task in `after_start` back to the agent.
#[derive(Clone, Debug)]
struct ChainLoaded {
    previous_hash: Option<String>,
    sequence: u64,
    service_name: String,
}

/// Audit agent that manages the immutable audit trail
///
/// Follows the same spawn-and-send-message pattern as `DatabasePoolAgent` and
/// `RedisPoolAgent`: connection/persistence work that isn't `Sync` runs on a
/// detached task, which reports back to the agent via a message.
pub struct AuditAgent;

impl AuditAgent {
    /// Spawn the audit agent.
    ///
    /// The agent loads chain state from storage (if configured) in
    /// `after_start`, then seals and persists `AuditEvent` messages in the
    /// order they arrive.
    pub async fn spawn(
        runtime: &mut AgentRuntime,
        config: AuditConfig,
        storage: Option<Arc<dyn AuditStorage>>,
        service_name: String,
    ) -> anyhow::Result<AgentHandle> {
        let mut agent = runtime.new_agent::<AuditAgentState>();

        if !config.enabled {
            tracing::info!("audit logging disabled, agent starts idle");
        }

        agent.model.storage = storage.clone();

        let storage_for_start = storage;
        let service_name_for_start = service_name;

        // Handle chain initialization (sent from after_start task)
        agent.mutate_on::<ChainLoaded>(|agent, envelope| {
            let msg = envelope.message().clone();
            let chain = if let Some(ref hash) = msg.previous_hash {
                AuditChain::resume(msg.service_name, hash.clone(), msg.sequence)
            } else {
                AuditChain::new(msg.service_name)
            };
            agent.model.chain = Some(chain);
            tracing::info!("audit chain initialized at sequence {}", msg.sequence);
            AgentReply::immediate()
        });

        // Handle incoming audit events
        agent.mutate_on::<AuditEvent>(|agent, envelope| {
            let event = envelope.message().clone();

            let sealed_event = match agent.model.chain {
                Some(ref mut chain) => chain.seal(event),
                None => {
                    tracing::warn!("audit chain not initialized yet, dropping event");
                    return AgentReply::immediate();
                }
            };

            let storage = agent.model.storage.clone();

            AgentReply::from_async(async move {
                if let Some(ref store) = storage {
                    if let Err(e) = store.append(&sealed_event).await {
                        tracing::error!("failed to persist audit event: {}", e);
                    }
                }
            })
        });

        // Load chain state from storage on startup
        agent.after_start(move |agent| {
            let storage = storage_for_start.clone();
            let service_name = service_name_for_start.clone();
            let self_handle = agent.handle().clone();

            AgentReply::from_async(async move {
                let (previous_hash, sequence) = if let Some(ref store) = storage {
                    match store.latest().await {
                        Ok(Some(event)) => {
                            tracing::info!(
                                "resuming audit chain at sequence {} for {}",
                                event.sequence,
                                service_name
                            );
                            (event.hash, event.sequence)
                        }
                        Ok(None) => {
                            tracing::info!("starting new audit chain for {}", service_name);
                            (None, 0)
                        }
                        Err(e) => {
                            tracing::error!(
                                "failed to load audit chain state: {}. starting fresh",
                                e
                            );
                            (None, 0)
                        }
                    }
                } else {
                    tracing::info!(
                        "no audit storage configured, starting in-memory chain for {}",
                        service_name
                    );
                    (None, 0)
                };

                self_handle
                    .send(ChainLoaded {
                        previous_hash,
                        sequence,
                        service_name,
                    })
                    .await;
            })
        });

        let handle = agent.start().await;
        Ok(handle)
    }
}
