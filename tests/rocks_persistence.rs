//! Durable ledger and round cache across a process restart

use chrono::Utc;
use parlor::config::TimingConfig;
use parlor::games::types::StakeBook;
use parlor::ledger::{EntryKind, NodeId, NodeRole, OwnershipNode, Wager};
use parlor::round::{Round, RoundRecord, RoundSnapshot, RoundStatus};
use parlor::services::{BroadcastPush, NoopReveal, StoreIdentity};
use parlor::storage::{LedgerStore, RocksStore, RoundCache};
use parlor::{BetOption, EngineConfig, EngineServices, Money, Phase, RoundEngine, RoundId, Variant};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn seed(store: &RocksStore) {
    let house = OwnershipNode::root("house");
    store.upsert_node(house.clone()).await.unwrap();
    store
        .upsert_node(OwnershipNode::child("carol", NodeRole::Bettor, &house.id).with_balance(Money::from_major(50)))
        .await
        .unwrap();
}

fn engine(store: Arc<RocksStore>) -> RoundEngine {
    let mut config = EngineConfig::default();
    config.timing = TimingConfig {
        waiting_ms: 100,
        betting_ms: 1_000,
        dealing_ms: 500,
        cooldown_ms: 200,
    };
    RoundEngine::new(
        config,
        EngineServices {
            store: store.clone(),
            cache: store.clone(),
            identity: Arc::new(StoreIdentity::new(store)),
            push: Arc::new(BroadcastPush::default()),
            reveal: Arc::new(NoopReveal),
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_history_and_entries_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let round_id = RoundId::new(Variant::AndarBahar, Utc::now());

    {
        let store = RocksStore::open(dir.path()).unwrap();
        seed(&store).await;
        let placed = Wager::new(
            round_id.clone(),
            NodeId::new("carol"),
            BetOption::Bahar,
            Money::from_major(5),
            Utc::now(),
        );
        store.record_wager(&placed).await.unwrap();
        store
            .archive_round(&RoundRecord {
                round_id: round_id.clone(),
                variant: Variant::AndarBahar,
                status: RoundStatus::Voided {
                    reason: "test".to_string(),
                },
                outcome: None,
                total_staked: Money::from_major(5),
                wager_count: 1,
                created_at: Utc::now(),
                closed_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let store = RocksStore::open(dir.path()).unwrap();
    let entries = store.entries_for_owner(&NodeId::new("carol")).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, EntryKind::Wager);
    assert_eq!(entries[0].balance_after, Money::from_major(45));

    let history = store.round_history(Variant::AndarBahar, 5).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].round_id, round_id);
    assert!(store.round_history(Variant::DragonTiger, 5).await.unwrap().is_empty());

    // new entries continue the sequence instead of overwriting
    let second = Wager::new(
        round_id.clone(),
        NodeId::new("carol"),
        BetOption::Bahar,
        Money::from_major(5),
        Utc::now(),
    );
    store.record_wager(&second).await.unwrap();
    assert_eq!(store.entries_for_owner(&NodeId::new("carol")).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_engine_recovers_round_from_disk() {
    let dir = TempDir::new().unwrap();
    let now = Utc::now();
    let round_id = RoundId::new(Variant::DragonTiger, now);

    {
        let store = RocksStore::open(dir.path()).unwrap();
        seed(&store).await;
        let placed = Wager::new(
            round_id.clone(),
            NodeId::new("carol"),
            BetOption::Dragon,
            Money::from_major(20),
            now,
        );
        store.record_wager(&placed).await.unwrap();

        let mut round = Round::new(round_id.clone(), Variant::DragonTiger, now, now);
        round
            .transition(Phase::Betting, now, now + chrono::Duration::milliseconds(2_000))
            .unwrap();
        store
            .put(&RoundSnapshot {
                round,
                stakes: StakeBook::new(),
                saved_at: now,
            })
            .await
            .unwrap();
    }

    let store = Arc::new(RocksStore::open(dir.path()).unwrap());
    let engine = engine(store.clone());
    let report = engine.recover().await.unwrap();
    assert_eq!(report.resumed, vec![round_id.clone()]);

    let view = engine.round_state(Variant::DragonTiger).await.unwrap().unwrap();
    assert_eq!(view.phase, Phase::Betting);
    assert_eq!(view.total_staked, Money::from_major(20));

    // long enough to settle and retire the table
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert!(engine.round_state(Variant::DragonTiger).await.unwrap().is_none());
    let history = engine.round_history(Variant::DragonTiger, 1).await.unwrap();
    assert_eq!(history[0].round_id, round_id);
    assert_eq!(history[0].status, RoundStatus::Settled);

    // the only stake is on Dragon, so Dragon loses
    let carol = store.node(&NodeId::new("carol")).await.unwrap().unwrap();
    assert_eq!(carol.balance, Money::from_major(30));
    assert!(store.round_resolution(&round_id).await.unwrap().is_some());
    assert!(store.unresolved_rounds().await.unwrap().is_empty());
    engine.shutdown().await;
}
