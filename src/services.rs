//! Collaborators the engine talks to, behind traits
//!
//! Identity lookup, push fan-out and the reveal trigger are all injected
//! into the engine as trait objects.

use crate::errors::{EngineResult, WagerError};
use crate::events::EngineEvent;
use crate::games::types::Variant;
use crate::ledger::NodeId;
use crate::round::{Round, RoundId};
use crate::storage::LedgerStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Resolved bettor account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BettorIdentity {
    pub node: NodeId,
    pub blocked: bool,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, user: &str) -> EngineResult<BettorIdentity>;
}

/// One-way event fan-out. Must not block the caller.
pub trait PushChannel: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

/// Presentation layer hook for card reveals
pub trait RevealTrigger: Send + Sync {
    fn begin_reveal(&self, round: &Round);
}

/// Users are ownership nodes with the same id
pub struct StoreIdentity {
    store: Arc<dyn LedgerStore>,
}

impl StoreIdentity {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl IdentityProvider for StoreIdentity {
    async fn resolve(&self, user: &str) -> EngineResult<BettorIdentity> {
        let id = NodeId::new(user);
        let node = self
            .store
            .node(&id)
            .await?
            .ok_or_else(|| WagerError::UnknownBettor { user: user.to_string() })?;
        Ok(BettorIdentity {
            node: node.id,
            blocked: node.wagering_blocked,
        })
    }
}

/// Push channel over a tokio broadcast. Slow receivers lag and drop
/// events; the engine never waits on them.
#[derive(Clone)]
pub struct BroadcastPush {
    tx: broadcast::Sender<EngineEvent>,
}

impl BroadcastPush {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPush {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl PushChannel for BroadcastPush {
    fn publish(&self, event: EngineEvent) {
        // No receivers is not an error
        let _ = self.tx.send(event);
    }
}

/// Reveal trigger for headless tables
pub struct NoopReveal;

impl RevealTrigger for NoopReveal {
    fn begin_reveal(&self, round: &Round) {
        debug!(round_id = %round.id, "reveal requested with no presenter attached");
    }
}

/// Announces reveals on the push channel as `reveal_started` events
pub struct PushReveal {
    push: Arc<dyn PushChannel>,
}

impl PushReveal {
    pub fn new(push: Arc<dyn PushChannel>) -> Self {
        Self { push }
    }
}

impl RevealTrigger for PushReveal {
    fn begin_reveal(&self, round: &Round) {
        if let Some(outcome) = &round.outcome {
            self.push.publish(EngineEvent::RevealStarted {
                round_id: round.id.clone(),
                variant: round.variant,
                cards: outcome.layout.clone(),
                winners: outcome.winners.clone(),
                commitment: outcome.commitment.clone(),
            });
        }
    }
}

/// Round id parsed from client input, with its variant
pub fn parse_round_id(raw: &str) -> Result<(RoundId, Variant), WagerError> {
    let id = RoundId::from_raw(raw);
    match id.variant() {
        Some(variant) => Ok((id, variant)),
        None => Err(WagerError::InvalidRound {
            round_id: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EngineError;
    use crate::ledger::{NodeRole, OwnershipNode};
    use crate::money::Money;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_store_identity_resolves_block_flag() {
        let store = Arc::new(MemoryStore::new());
        let root = OwnershipNode::root("root");
        store
            .upsert_node(OwnershipNode::child("b1", NodeRole::Bettor, &root.id).blocked())
            .await
            .unwrap_err();
        store.upsert_node(root.clone()).await.unwrap();
        store
            .upsert_node(OwnershipNode::child("b1", NodeRole::Bettor, &root.id).blocked())
            .await
            .unwrap();

        let identity = StoreIdentity::new(store);
        let resolved = identity.resolve("b1").await.unwrap();
        assert!(resolved.blocked);
        assert!(matches!(
            identity.resolve("ghost").await,
            Err(EngineError::Wager(WagerError::UnknownBettor { .. }))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_push_delivers_to_subscribers() {
        let push = BroadcastPush::new(8);
        push.publish(EngineEvent::Balance {
            node: NodeId::new("lost"),
            balance: Money::ZERO,
        });

        let mut rx = push.subscribe();
        push.publish(EngineEvent::Balance {
            node: NodeId::new("b1"),
            balance: Money::from_major(3),
        });
        match rx.recv().await.unwrap() {
            EngineEvent::Balance { node, .. } => assert_eq!(node, NodeId::new("b1")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_round_id_rejects_garbage() {
        assert!(parse_round_id("dt-20240101000000000").is_ok());
        assert_eq!(
            parse_round_id("nope"),
            Err(WagerError::InvalidRound {
                round_id: "nope".to_string()
            })
        );
    }
}
