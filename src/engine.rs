//! Round registry and phase timers
//!
//! Each enabled variant owns one `Table`. Its async mutex is the single
//! writer for that variant's live round: timers, wagers, joins and
//! restarts all go through it, while different variants run in parallel.
//!
//! Every phase change follows the same order: mutate the round, write the
//! snapshot to the round cache, publish `round_state`, arm the next timer.

use crate::backoff::RetryPolicy;
use crate::cards::Deck;
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult, TransitionError, WagerError};
use crate::events::EngineEvent;
use crate::games::strategy::determine_outcome;
use crate::games::types::{StakeBook, Variant};
use crate::games::StrategyTable;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::round::{Phase, Round, RoundId, RoundRecord, RoundSnapshot, RoundStatus, RoundView};
use crate::services::{parse_round_id, IdentityProvider, PushChannel, RevealTrigger};
use crate::settlement::{SettlementEngine, SettlementSummary};
use crate::storage::{LedgerStore, RoundCache};
use crate::wagers::{WagerLedger, WagerReceipt, WagerRequest};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// External collaborators handed to the engine
pub struct EngineServices {
    pub store: Arc<dyn LedgerStore>,
    pub cache: Arc<dyn RoundCache>,
    pub identity: Arc<dyn IdentityProvider>,
    pub push: Arc<dyn PushChannel>,
    pub reveal: Arc<dyn RevealTrigger>,
}

/// What `recover` found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Rounds put back on their table with the remaining phase time
    pub resumed: Vec<RoundId>,
    /// Completed rounds whose settlement had not been committed
    pub settled: Vec<RoundId>,
    /// Rounds with stakes but no surviving state, voided and refunded
    pub refunded: Vec<RoundId>,
    /// Snapshots of rounds the ledger had already closed
    pub discarded: Vec<RoundId>,
}

struct LiveRound {
    round: Round,
    stakes: StakeBook,
}

#[derive(Default)]
struct TableState {
    live: Option<LiveRound>,
    timer: Option<JoinHandle<()>>,
    /// Creation time of the newest round, keeps ids strictly increasing
    last_round_ms: i64,
}

struct Table {
    state: Mutex<TableState>,
}

struct EngineInner {
    config: EngineConfig,
    strategies: StrategyTable,
    store: Arc<dyn LedgerStore>,
    cache: Arc<dyn RoundCache>,
    push: Arc<dyn PushChannel>,
    reveal: Arc<dyn RevealTrigger>,
    wagers: WagerLedger,
    settlement: SettlementEngine,
    metrics: Arc<EngineMetrics>,
    tables: HashMap<Variant, Table>,
    subscribers: DashMap<Variant, HashSet<String>>,
    /// Background refunds of rounds whose void could not be committed
    pending_refunds: DashMap<RoundId, JoinHandle<()>>,
    refund_retry: RetryPolicy,
    shutting_down: AtomicBool,
}

#[derive(Clone)]
pub struct RoundEngine {
    inner: Arc<EngineInner>,
}

const NO_LIVE_STATE: &str = "no live state after restart";

fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

fn record(round: &Round, stakes: &StakeBook, wager_count: usize, status: RoundStatus) -> RoundRecord {
    RoundRecord {
        round_id: round.id.clone(),
        variant: round.variant,
        status,
        outcome: round.outcome.clone(),
        total_staked: stakes.total(),
        wager_count,
        created_at: round.created_at,
        closed_at: Utc::now(),
    }
}

impl RoundEngine {
    pub fn new(config: EngineConfig, services: EngineServices) -> EngineResult<Self> {
        Self::with_strategies(config, services, StrategyTable::standard())
    }

    pub fn with_strategies(
        config: EngineConfig,
        services: EngineServices,
        strategies: StrategyTable,
    ) -> EngineResult<Self> {
        let mut tables = HashMap::new();
        for variant in &config.variants.enabled {
            strategies.get(*variant)?;
            tables.insert(
                *variant,
                Table {
                    state: Mutex::new(TableState::default()),
                },
            );
        }

        let metrics = Arc::new(EngineMetrics::new());
        let retry = RetryPolicy::new(
            config.settlement.max_attempts,
            Duration::from_millis(config.settlement.backoff_ms),
        );
        let wagers = WagerLedger::new(
            services.store.clone(),
            services.identity.clone(),
            services.push.clone(),
            config.limits.clone(),
        );
        let settlement = SettlementEngine::new(
            services.store.clone(),
            services.push.clone(),
            retry,
            metrics.clone(),
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                strategies,
                store: services.store,
                cache: services.cache,
                push: services.push,
                reveal: services.reveal,
                wagers,
                settlement,
                metrics,
                tables,
                subscribers: DashMap::new(),
                pending_refunds: DashMap::new(),
                refund_retry: retry,
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    fn table(&self, variant: Variant) -> EngineResult<&Table> {
        self.inner
            .tables
            .get(&variant)
            .ok_or(EngineError::VariantDisabled(variant))
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    fn has_watchers(&self, variant: Variant) -> bool {
        self.inner.config.variants.always_on.contains(&variant)
            || self
                .inner
                .subscribers
                .get(&variant)
                .map(|users| !users.is_empty())
                .unwrap_or(false)
    }

    /// Subscribes `user` to a variant, starting a round if none is live
    pub async fn join_variant(&self, user: &str, variant: Variant) -> EngineResult<RoundView> {
        if self.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        let table = self.table(variant)?;
        self.inner
            .subscribers
            .entry(variant)
            .or_default()
            .insert(user.to_string());

        let mut state = table.state.lock().await;
        if state.live.is_none() {
            self.start_round(&mut state, variant).await;
        }
        match state.live.as_ref() {
            Some(live) => Ok(live.round.view(&live.stakes)),
            None => Err(EngineError::ShuttingDown),
        }
    }

    /// Unsubscribes `user`. The live round finishes; the table retires at
    /// the end of cooldown if nobody is left.
    pub fn leave_variant(&self, user: &str, variant: Variant) -> EngineResult<()> {
        self.table(variant)?;
        if let Some(mut users) = self.inner.subscribers.get_mut(&variant) {
            users.remove(user);
        }
        Ok(())
    }

    /// Voided rounds whose refund is still being retried
    pub fn pending_refund_count(&self) -> usize {
        self.inner.pending_refunds.len()
    }

    pub fn subscriber_count(&self, variant: Variant) -> usize {
        self.inner.subscribers.get(&variant).map(|u| u.len()).unwrap_or(0)
    }

    pub async fn round_state(&self, variant: Variant) -> EngineResult<Option<RoundView>> {
        let state = self.table(variant)?.state.lock().await;
        Ok(state.live.as_ref().map(|live| live.round.view(&live.stakes)))
    }

    pub async fn place_wager(&self, request: WagerRequest) -> EngineResult<WagerReceipt> {
        let result = self.try_place_wager(&request).await;
        self.inner.metrics.record_wager(result.is_ok());
        if let Err(e) = &result {
            debug!(user = %request.user, round_id = %request.round_id, reason = ?e.reason_code(), "wager rejected");
        }
        result
    }

    async fn try_place_wager(&self, request: &WagerRequest) -> EngineResult<WagerReceipt> {
        if self.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        let (_, variant) = parse_round_id(&request.round_id)?;
        let table = self.inner.tables.get(&variant).ok_or_else(|| WagerError::InvalidRound {
            round_id: request.round_id.clone(),
        })?;
        let strategy = self.inner.strategies.get(variant)?;

        let mut state = table.state.lock().await;
        match state.live.as_mut() {
            Some(live) => {
                self.inner
                    .wagers
                    .place(request, Some(&live.round), strategy.as_ref(), &mut live.stakes)
                    .await
            }
            None => {
                self.inner
                    .wagers
                    .place(request, None, strategy.as_ref(), &mut StakeBook::new())
                    .await
            }
        }
    }

    /// Marks the reveal of `round_id` as finished. Only affects what
    /// subscribers see; the dealing timer runs regardless. Returns false
    /// when the round is no longer dealing.
    pub async fn signal_reveal_complete(&self, round_id: &str) -> EngineResult<bool> {
        let (_, variant) = parse_round_id(round_id)?;
        let mut state = self.table(variant)?.state.lock().await;
        let live = match state.live.as_mut() {
            Some(live) if live.round.id.as_str() == round_id && live.round.phase == Phase::Dealing => live,
            _ => return Ok(false),
        };
        if !live.round.reveal_completed {
            live.round.reveal_completed = true;
            self.inner.push.publish(EngineEvent::RevealComplete {
                round_id: live.round.id.clone(),
                variant,
            });
        }
        Ok(true)
    }

    pub async fn round_history(&self, variant: Variant, limit: usize) -> EngineResult<Vec<RoundRecord>> {
        self.inner.store.round_history(variant, limit).await
    }

    /// Starts every always-on table that has no live round
    pub async fn start_always_on(&self) {
        for variant in self.inner.config.variants.always_on.clone() {
            if let Ok(table) = self.table(variant) {
                let mut state = table.state.lock().await;
                if state.live.is_none() {
                    self.start_round(&mut state, variant).await;
                }
            }
        }
    }

    /// Voids the live round of `variant`, refunding its stakes, and starts
    /// over if the table is still watched
    pub async fn force_restart(&self, variant: Variant, reason: &str) -> EngineResult<()> {
        let mut state = self.table(variant)?.state.lock().await;
        self.restart_variant(&mut state, variant, reason).await;
        Ok(())
    }

    /// Stops every timer. Live rounds stay in the cache for `recover`.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        for (variant, table) in &self.inner.tables {
            let mut state = table.state.lock().await;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            if let Some(live) = &state.live {
                info!(variant = %variant, round_id = %live.round.id, phase = %live.round.phase, "table suspended");
            }
        }
        let pending: Vec<RoundId> = self.inner.pending_refunds.iter().map(|e| e.key().clone()).collect();
        for round_id in pending {
            if let Some((_, task)) = self.inner.pending_refunds.remove(&round_id) {
                task.abort();
                info!(round_id = %round_id, "pending refund left for recovery");
            }
        }
        info!("round engine stopped");
    }

    /// Resumes cached rounds and closes out anything left unresolved
    pub async fn recover(&self) -> EngineResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let snapshots = match self.inner.cache.list().await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!(error = %e, "round cache unreadable, recovering from the ledger only");
                Vec::new()
            }
        };

        for snapshot in snapshots {
            let round_id = snapshot.round.id.clone();
            if let Err(e) = self.restore(snapshot, &mut report).await {
                error!(round_id = %round_id, error = %e, "snapshot not restored");
            }
        }

        let mut live_ids = HashSet::new();
        for table in self.inner.tables.values() {
            if let Some(live) = &table.state.lock().await.live {
                live_ids.insert(live.round.id.clone());
            }
        }

        for round_id in self.inner.store.unresolved_rounds().await? {
            if live_ids.contains(&round_id) {
                continue;
            }
            match self.void_round(&round_id, NO_LIVE_STATE, None).await {
                Ok(true) => report.refunded.push(round_id),
                Ok(false) => {}
                Err(e) => {
                    error!(round_id = %round_id, error = %e, "refund during recovery failed");
                    self.schedule_refund(round_id, NO_LIVE_STATE.to_string(), None);
                }
            }
        }

        info!(
            resumed = report.resumed.len(),
            settled = report.settled.len(),
            refunded = report.refunded.len(),
            discarded = report.discarded.len(),
            "recovery finished"
        );
        Ok(report)
    }

    async fn restore(&self, snapshot: RoundSnapshot, report: &mut RecoveryReport) -> EngineResult<()> {
        let variant = snapshot.round.variant;
        let round_id = snapshot.round.id.clone();
        let table = match self.inner.tables.get(&variant) {
            Some(table) => table,
            None => {
                warn!(variant = %variant, round_id = %round_id, "dropping snapshot of disabled variant");
                self.forget_snapshot(variant).await;
                return Ok(());
            }
        };

        let mut state = table.state.lock().await;
        if state.live.is_some() {
            return Ok(());
        }
        state.last_round_ms = state.last_round_ms.max(snapshot.round.created_at.timestamp_millis());

        if self.inner.store.round_resolution(&round_id).await?.is_some() {
            debug!(round_id = %round_id, "snapshot belongs to a closed round");
            self.forget_snapshot(variant).await;
            report.discarded.push(round_id);
            if self.has_watchers(variant) {
                self.start_round(&mut state, variant).await;
            }
            return Ok(());
        }

        let stakes = self.inner.wagers.rebuild_stakes(&round_id).await?;
        let phase = snapshot.round.phase;
        let remaining = (snapshot.round.phase_deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        state.live = Some(LiveRound {
            round: snapshot.round,
            stakes,
        });
        info!(variant = %variant, round_id = %round_id, phase = %phase, remaining_ms = remaining.as_millis() as u64, "round restored");

        if phase == Phase::Completed {
            match self.settle_live(&mut state, variant).await {
                Ok(()) => report.settled.push(round_id.clone()),
                Err(e) => {
                    error!(round_id = %round_id, error = %e, "settlement of restored round failed");
                    self.restart_variant(&mut state, variant, &e.to_string()).await;
                    return Ok(());
                }
            }
        } else {
            report.resumed.push(round_id.clone());
        }

        if let Some(live) = &state.live {
            self.publish_state(live);
        }
        self.arm(&mut state, variant, round_id, phase, remaining);
        Ok(())
    }

    async fn start_round(&self, state: &mut TableState, variant: Variant) {
        if self.is_shutting_down() {
            return;
        }
        let now_ms = Utc::now().timestamp_millis().max(state.last_round_ms + 1);
        state.last_round_ms = now_ms;
        let created = Utc.timestamp_millis_opt(now_ms).single().unwrap_or_else(Utc::now);

        let waiting = self.inner.config.timing.waiting();
        let round_id = RoundId::new(variant, created);
        let round = Round::new(round_id.clone(), variant, created, after(created, waiting));
        state.live = Some(LiveRound {
            round,
            stakes: StakeBook::new(),
        });
        self.inner.metrics.record_round_started();
        info!(variant = %variant, round_id = %round_id, "round created");

        self.persist(state).await;
        self.arm(state, variant, round_id, Phase::Waiting, waiting);
    }

    /// Writes the live round's snapshot, then publishes its state
    async fn persist(&self, state: &TableState) {
        let live = match &state.live {
            Some(live) => live,
            None => return,
        };
        let snapshot = RoundSnapshot {
            round: live.round.clone(),
            stakes: live.stakes.clone(),
            saved_at: Utc::now(),
        };
        if let Err(e) = self.inner.cache.put(&snapshot).await {
            warn!(round_id = %live.round.id, error = %e, "round snapshot not cached");
        }
        self.publish_state(live);
    }

    fn publish_state(&self, live: &LiveRound) {
        self.inner.push.publish(EngineEvent::RoundState {
            view: live.round.view(&live.stakes),
        });
    }

    async fn forget_snapshot(&self, variant: Variant) {
        if let Err(e) = self.inner.cache.remove(variant).await {
            warn!(variant = %variant, error = %e, "round snapshot not removed");
        }
    }

    fn arm(&self, state: &mut TableState, variant: Variant, round_id: RoundId, phase: Phase, delay: Duration) {
        if let Some(previous) = state.timer.take() {
            previous.abort();
        }
        let engine = self.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.on_timer(variant, round_id, phase).await;
        }));
    }

    fn on_timer(&self, variant: Variant, round_id: RoundId, phase: Phase) -> BoxFuture<'static, ()> {
        let engine = self.clone();
        async move { engine.handle_timer(variant, round_id, phase).await }.boxed()
    }

    async fn handle_timer(&self, variant: Variant, round_id: RoundId, phase: Phase) {
        let table = match self.inner.tables.get(&variant) {
            Some(table) => table,
            None => return,
        };
        let mut state = table.state.lock().await;

        let current = state
            .live
            .as_ref()
            .map(|live| live.round.id == round_id && live.round.phase == phase)
            .unwrap_or(false);
        if !current {
            debug!(variant = %variant, round_id = %round_id, phase = %phase, "stale timer ignored");
            return;
        }
        // This task is the armed timer; drop its handle without aborting
        state.timer.take();

        let result = match phase {
            Phase::Waiting => self.open_betting(&mut state, variant).await,
            Phase::Betting => self.close_betting(&mut state, variant).await,
            Phase::Dealing => self.complete_round(&mut state, variant).await,
            Phase::Completed => {
                self.finish_cooldown(&mut state, variant).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(variant = %variant, round_id = %round_id, phase = %phase, error = %e, "round failed");
            self.restart_variant(&mut state, variant, &e.to_string()).await;
        }
    }

    fn live_mut<'a>(state: &'a mut TableState, variant: Variant) -> EngineResult<&'a mut LiveRound> {
        state
            .live
            .as_mut()
            .ok_or(EngineError::Transition(TransitionError::NoLiveRound { variant }))
    }

    async fn open_betting(&self, state: &mut TableState, variant: Variant) -> EngineResult<()> {
        let betting = self.inner.config.timing.betting();
        let now = Utc::now();
        let live = Self::live_mut(state, variant)?;
        live.round.transition(Phase::Betting, now, after(now, betting))?;
        let round_id = live.round.id.clone();
        info!(variant = %variant, round_id = %round_id, "betting open");

        self.persist(state).await;
        self.arm(state, variant, round_id, Phase::Betting, betting);
        Ok(())
    }

    async fn close_betting(&self, state: &mut TableState, variant: Variant) -> EngineResult<()> {
        let strategy = self.inner.strategies.get(variant)?;
        let dealing = self.inner.config.timing.dealing();
        let live = Self::live_mut(state, variant)?;

        let outcome = {
            let mut rng = StdRng::from_entropy();
            let deck = Deck::shuffled(&mut rng);
            determine_outcome(strategy.as_ref(), &live.stakes, &deck, &mut rng)?
        };
        let now = Utc::now();
        live.round.begin_dealing(outcome, now, after(now, dealing))?;
        let round_id = live.round.id.clone();
        info!(
            variant = %variant,
            round_id = %round_id,
            winners = ?live.round.winners(),
            total_staked = %live.stakes.total(),
            "betting closed, outcome fixed"
        );

        self.persist(state).await;
        if let Some(live) = &state.live {
            self.inner.reveal.begin_reveal(&live.round);
        }
        self.arm(state, variant, round_id, Phase::Dealing, dealing);
        Ok(())
    }

    async fn complete_round(&self, state: &mut TableState, variant: Variant) -> EngineResult<()> {
        let cooldown = self.inner.config.timing.cooldown();
        let now = Utc::now();
        let live = Self::live_mut(state, variant)?;
        live.round.transition(Phase::Completed, now, after(now, cooldown))?;
        let round_id = live.round.id.clone();

        self.persist(state).await;
        self.settle_live(state, variant).await?;
        self.arm(state, variant, round_id, Phase::Completed, cooldown);
        Ok(())
    }

    /// Settles the live COMPLETED round, archives it and announces it
    async fn settle_live(&self, state: &mut TableState, variant: Variant) -> EngineResult<()> {
        let strategy = self.inner.strategies.get(variant)?;
        let live = Self::live_mut(state, variant)?;
        let summary = self
            .inner
            .settlement
            .settle_round(&live.round, strategy.as_ref())
            .await?;

        let archived = record(&live.round, &live.stakes, summary.wagers, RoundStatus::Settled);
        if let Err(e) = self.inner.store.archive_round(&archived).await {
            warn!(round_id = %live.round.id, error = %e, "round not archived");
        }
        if summary.applied {
            self.inner.metrics.record_round_settled();
        }
        self.inner.push.publish(EngineEvent::RoundSettled {
            round_id: live.round.id.clone(),
            variant,
            winners: live.round.winners().cloned().unwrap_or_default(),
            wager_count: summary.wagers,
        });
        Ok(())
    }

    async fn finish_cooldown(&self, state: &mut TableState, variant: Variant) {
        if let Some(done) = state.live.take() {
            debug!(variant = %variant, round_id = %done.round.id, "round discarded");
        }
        self.forget_snapshot(variant).await;

        if self.has_watchers(variant) {
            self.start_round(state, variant).await;
        } else {
            info!(variant = %variant, "table retired, no watchers");
        }
    }

    /// Drops the live round after a failure. Its stakes are refunded,
    /// never rolled back, and the table starts over if still watched.
    async fn restart_variant(&self, state: &mut TableState, variant: Variant, reason: &str) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        self.inner.metrics.record_variant_restart();

        if let Some(lost) = state.live.take() {
            let round_id = lost.round.id.clone();
            match self.void_round(&round_id, reason, Some(&lost)).await {
                Ok(true) => {}
                Ok(false) => debug!(round_id = %round_id, "round already closed, nothing to refund"),
                Err(e) => {
                    error!(round_id = %round_id, error = %e, "refund failed, retrying in background");
                    self.schedule_refund(round_id, reason.to_string(), Some(lost));
                }
            }
        }
        self.forget_snapshot(variant).await;

        warn!(variant = %variant, reason, "variant restarted");
        if self.has_watchers(variant) {
            self.start_round(state, variant).await;
        }
    }

    /// Refunds `round_id` and, when this call closed it, archives and
    /// announces the void. False when the round was already closed.
    async fn void_round(&self, round_id: &RoundId, reason: &str, lost: Option<&LiveRound>) -> EngineResult<bool> {
        let summary = self.inner.settlement.refund_round(round_id, reason).await?;
        if !summary.applied {
            return Ok(false);
        }
        if let Some(lost) = lost {
            let archived = record(
                &lost.round,
                &lost.stakes,
                summary.wagers,
                RoundStatus::Voided {
                    reason: reason.to_string(),
                },
            );
            if let Err(e) = self.inner.store.archive_round(&archived).await {
                warn!(round_id = %round_id, error = %e, "voided round not archived");
            }
        }
        self.announce_void(round_id, &summary);
        Ok(true)
    }

    /// Keeps retrying the refund of a round no table owns any more, until
    /// it commits or the engine shuts down
    fn schedule_refund(&self, round_id: RoundId, reason: String, lost: Option<LiveRound>) {
        if self.is_shutting_down() {
            return;
        }
        // the entry stays locked until the handle is stored, so the task
        // cannot remove itself first
        if let Entry::Vacant(slot) = self.inner.pending_refunds.entry(round_id.clone()) {
            let engine = self.clone();
            slot.insert(tokio::spawn(async move { engine.retry_refund(round_id, reason, lost).await }));
        }
    }

    async fn retry_refund(&self, round_id: RoundId, reason: String, lost: Option<LiveRound>) {
        let mut rng = StdRng::from_entropy();
        let mut attempt: u32 = 1;
        loop {
            let delay = self.inner.refund_retry.delay_for(attempt, &mut rng);
            tokio::time::sleep(delay).await;
            if self.is_shutting_down() {
                return;
            }
            match self.void_round(&round_id, &reason, lost.as_ref()).await {
                Ok(applied) => {
                    info!(round_id = %round_id, attempt, applied, "pending refund resolved");
                    break;
                }
                Err(e) => {
                    warn!(round_id = %round_id, attempt, error = %e, "pending refund failed");
                    attempt = attempt.saturating_add(1);
                }
            }
        }
        self.inner.pending_refunds.remove(&round_id);
    }

    fn announce_void(&self, round_id: &RoundId, summary: &SettlementSummary) {
        self.inner.metrics.record_round_voided();
        if let Some(variant) = round_id.variant() {
            self.inner.push.publish(EngineEvent::RoundVoided {
                round_id: round_id.clone(),
                variant,
                refunded: summary.wagers,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::Deck;
    use crate::config::TimingConfig;
    use crate::games::strategy::{Candidate, OutcomeStrategy};
    use crate::games::types::{BetOption, PlacedCard};
    use crate::games::DragonTiger;
    use crate::ledger::{NodeId, NodeRole, OwnershipNode};
    use crate::money::{Money, Rate};
    use crate::services::{BroadcastPush, PushReveal, StoreIdentity};
    use crate::storage::{MemoryRoundCache, MemoryStore};
    use rand::RngCore;
    use std::collections::BTreeSet;

    /// Dragon tiger rules that can never deal a hand
    struct Jammed;

    impl OutcomeStrategy for Jammed {
        fn variant(&self) -> Variant {
            Variant::DragonTiger
        }

        fn options(&self) -> &'static [BetOption] {
            DragonTiger.options()
        }

        fn multiplier(&self, option: BetOption) -> Option<Rate> {
            DragonTiger.multiplier(option)
        }

        fn candidates(&self) -> Vec<Candidate> {
            DragonTiger.candidates()
        }

        fn deal(&self, _: &BTreeSet<BetOption>, _: &mut Deck, _: &mut dyn RngCore) -> Option<Vec<PlacedCard>> {
            None
        }
    }

    struct Harness {
        engine: RoundEngine,
        store: Arc<MemoryStore>,
        cache: Arc<MemoryRoundCache>,
        push: BroadcastPush,
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.timing = TimingConfig {
            waiting_ms: 100,
            betting_ms: 1_000,
            dealing_ms: 500,
            cooldown_ms: 200,
        };
        config.variants.enabled = vec![Variant::DragonTiger];
        config
    }

    async fn harness(strategies: StrategyTable) -> Harness {
        harness_with(test_config(), strategies).await
    }

    async fn harness_with(config: EngineConfig, strategies: StrategyTable) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let house = OwnershipNode::root("house");
        store.upsert_node(house.clone()).await.unwrap();
        store
            .upsert_node(OwnershipNode::child("b1", NodeRole::Bettor, &house.id).with_balance(Money::from_major(100)))
            .await
            .unwrap();

        let cache = Arc::new(MemoryRoundCache::default());
        let push = BroadcastPush::new(256);
        let push_arc: Arc<BroadcastPush> = Arc::new(push.clone());
        let engine = RoundEngine::with_strategies(
            config,
            EngineServices {
                store: store.clone(),
                cache: cache.clone(),
                identity: Arc::new(StoreIdentity::new(store.clone())),
                push: push_arc.clone(),
                reveal: Arc::new(PushReveal::new(push_arc)),
            },
            strategies,
        )
        .unwrap();

        Harness {
            engine,
            store,
            cache,
            push,
        }
    }

    async fn balance(store: &MemoryStore, id: &str) -> Money {
        store.node(&NodeId::new(id)).await.unwrap().unwrap().balance
    }

    fn wager(round_id: &RoundId, option: BetOption, major: i64) -> WagerRequest {
        WagerRequest {
            user: "b1".to_string(),
            round_id: round_id.to_string(),
            option,
            stake: Money::from_major(major),
        }
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_walks_every_phase() {
        let h = harness(StrategyTable::standard()).await;
        let first = h.engine.join_variant("b1", Variant::DragonTiger).await.unwrap();
        assert_eq!(first.phase, Phase::Waiting);
        assert!(h.cache.get(Variant::DragonTiger).await.unwrap().is_some());

        sleep_ms(150).await;
        let view = h.engine.round_state(Variant::DragonTiger).await.unwrap().unwrap();
        assert_eq!(view.phase, Phase::Betting);

        h.engine
            .place_wager(wager(&first.round_id, BetOption::Dragon, 10))
            .await
            .unwrap();
        assert_eq!(balance(&h.store, "b1").await, Money::from_major(90));

        sleep_ms(1_000).await;
        let view = h.engine.round_state(Variant::DragonTiger).await.unwrap().unwrap();
        assert_eq!(view.phase, Phase::Dealing);
        assert!(!view.cards.is_empty());
        assert!(view.winners.is_none());

        sleep_ms(500).await;
        let view = h.engine.round_state(Variant::DragonTiger).await.unwrap().unwrap();
        assert_eq!(view.phase, Phase::Completed);
        let winners = view.winners.unwrap();
        assert!(!winners.contains(&BetOption::Dragon));
        assert_eq!(balance(&h.store, "b1").await, Money::from_major(90));
        assert_eq!(balance(&h.store, "house").await, Money::from_major(10));

        sleep_ms(200).await;
        let next = h.engine.round_state(Variant::DragonTiger).await.unwrap().unwrap();
        assert_eq!(next.phase, Phase::Waiting);
        assert_ne!(next.round_id, first.round_id);

        let history = h.engine.round_history(Variant::DragonTiger, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RoundStatus::Settled);
        assert_eq!(history[0].wager_count, 1);

        let metrics = h.engine.metrics();
        assert_eq!(metrics.rounds_started, 2);
        assert_eq!(metrics.rounds_settled, 1);
        assert_eq!(metrics.wagers_accepted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_follow_phase_order() {
        let h = harness(StrategyTable::standard()).await;
        let mut rx = h.push.subscribe();
        h.engine.join_variant("b1", Variant::DragonTiger).await.unwrap();
        sleep_ms(1_700).await;

        let mut phases = Vec::new();
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::RoundState { view } = &event {
                phases.push(view.phase);
            }
            kinds.push(event.kind());
        }
        assert_eq!(
            phases,
            vec![Phase::Waiting, Phase::Betting, Phase::Dealing, Phase::Completed]
        );
        let reveal = kinds.iter().position(|k| *k == "reveal_started").unwrap();
        let settled = kinds.iter().position(|k| *k == "round_settled").unwrap();
        assert!(reveal < settled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_is_idempotent_and_table_retires() {
        let h = harness(StrategyTable::standard()).await;
        let a = h.engine.join_variant("b1", Variant::DragonTiger).await.unwrap();
        let b = h.engine.join_variant("b1", Variant::DragonTiger).await.unwrap();
        assert_eq!(a.round_id, b.round_id);
        assert_eq!(h.engine.subscriber_count(Variant::DragonTiger), 1);

        h.engine.leave_variant("b1", Variant::DragonTiger).unwrap();
        h.engine.leave_variant("b1", Variant::DragonTiger).unwrap();
        assert_eq!(h.engine.subscriber_count(Variant::DragonTiger), 0);

        // the live round still finishes
        sleep_ms(1_700).await;
        assert!(h.engine.round_state(Variant::DragonTiger).await.unwrap().is_some());

        sleep_ms(200).await;
        assert!(h.engine.round_state(Variant::DragonTiger).await.unwrap().is_none());
        assert!(h.cache.get(Variant::DragonTiger).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disabled_variant_is_refused() {
        let h = harness(StrategyTable::standard()).await;
        assert!(matches!(
            h.engine.join_variant("b1", Variant::LuckySeven).await,
            Err(EngineError::VariantDisabled(Variant::LuckySeven))
        ));

        let round_id = RoundId::new(Variant::LuckySeven, Utc::now());
        let err = h
            .engine
            .place_wager(wager(&round_id, BetOption::Seven, 1))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), Some("INVALID_ROUND"));
        assert_eq!(h.engine.metrics().wagers_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wager_outside_betting_is_rejected() {
        let h = harness(StrategyTable::standard()).await;
        let view = h.engine.join_variant("b1", Variant::DragonTiger).await.unwrap();
        let err = h
            .engine
            .place_wager(wager(&view.round_id, BetOption::Tiger, 5))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), Some("INVALID_ROUND"));
        assert_eq!(balance(&h.store, "b1").await, Money::from_major(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_outcome_voids_and_refunds() {
        let mut strategies = StrategyTable::default();
        strategies.insert(Arc::new(Jammed));
        let h = harness(strategies).await;
        let mut rx = h.push.subscribe();

        let first = h.engine.join_variant("b1", Variant::DragonTiger).await.unwrap();
        sleep_ms(150).await;
        for option in [BetOption::Dragon, BetOption::Tiger, BetOption::Tie] {
            h.engine.place_wager(wager(&first.round_id, option, 10)).await.unwrap();
        }
        assert_eq!(balance(&h.store, "b1").await, Money::from_major(70));

        sleep_ms(1_000).await;
        assert_eq!(balance(&h.store, "b1").await, Money::from_major(100));
        assert_eq!(balance(&h.store, "house").await, Money::ZERO);

        let next = h.engine.round_state(Variant::DragonTiger).await.unwrap().unwrap();
        assert_eq!(next.phase, Phase::Waiting);
        assert_ne!(next.round_id, first.round_id);

        let mut voided = None;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::RoundVoided { round_id, refunded, .. } = event {
                voided = Some((round_id, refunded));
            }
        }
        assert_eq!(voided, Some((first.round_id.clone(), 3)));

        let metrics = h.engine.metrics();
        assert_eq!(metrics.rounds_voided, 1);
        assert_eq!(metrics.variant_restarts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_retried_after_store_recovers() {
        let mut config = test_config();
        config.settlement.max_attempts = 2;
        config.settlement.backoff_ms = 50;
        let mut strategies = StrategyTable::default();
        strategies.insert(Arc::new(Jammed));
        let h = harness_with(config, strategies).await;
        let mut rx = h.push.subscribe();

        let first = h.engine.join_variant("b1", Variant::DragonTiger).await.unwrap();
        sleep_ms(150).await;
        h.engine.place_wager(wager(&first.round_id, BetOption::Tiger, 10)).await.unwrap();
        h.engine.leave_variant("b1", Variant::DragonTiger).unwrap();
        assert_eq!(balance(&h.store, "b1").await, Money::from_major(90));

        // deal fails at close, then both refund attempts and the first retry
        h.store.fail_next_commits(3);
        sleep_ms(3_000).await;

        assert_eq!(balance(&h.store, "b1").await, Money::from_major(100));
        assert!(h.store.unresolved_rounds().await.unwrap().is_empty());
        assert_eq!(h.engine.pending_refund_count(), 0);

        let mut voided = None;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::RoundVoided { round_id, refunded, .. } = event {
                voided = Some((round_id, refunded));
            }
        }
        assert_eq!(voided, Some((first.round_id.clone(), 1)));

        let history = h.engine.round_history(Variant::DragonTiger, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(matches!(history[0].status, RoundStatus::Voided { .. }));

        let metrics = h.engine.metrics();
        assert_eq!(metrics.rounds_voided, 1);
        assert_eq!(metrics.rounds_settled, 0);
        assert_eq!(metrics.variant_restarts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_pending_refund() {
        let mut config = test_config();
        config.settlement.max_attempts = 1;
        config.settlement.backoff_ms = 50;
        let mut strategies = StrategyTable::default();
        strategies.insert(Arc::new(Jammed));
        let h = harness_with(config, strategies).await;

        let first = h.engine.join_variant("b1", Variant::DragonTiger).await.unwrap();
        sleep_ms(150).await;
        h.engine.place_wager(wager(&first.round_id, BetOption::Tiger, 10)).await.unwrap();
        h.engine.leave_variant("b1", Variant::DragonTiger).unwrap();

        h.store.fail_next_commits(u32::MAX);
        sleep_ms(1_000).await;
        assert_eq!(h.engine.pending_refund_count(), 1);

        h.engine.shutdown().await;
        assert_eq!(h.engine.pending_refund_count(), 0);
        h.store.fail_next_commits(0);
        sleep_ms(5_000).await;
        // left for the next recovery
        assert_eq!(balance(&h.store, "b1").await, Money::from_major(90));
        assert_eq!(h.store.unresolved_rounds().await.unwrap(), vec![first.round_id.clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reveal_complete_only_while_dealing() {
        let h = harness(StrategyTable::standard()).await;
        let view = h.engine.join_variant("b1", Variant::DragonTiger).await.unwrap();
        let id = view.round_id.to_string();
        assert!(!h.engine.signal_reveal_complete(&id).await.unwrap());

        sleep_ms(1_150).await;
        assert!(h.engine.signal_reveal_complete(&id).await.unwrap());
        let view = h.engine.round_state(Variant::DragonTiger).await.unwrap().unwrap();
        assert!(view.reveal_completed);
        assert_eq!(view.phase, Phase::Dealing);

        // the dealing timer is unaffected
        sleep_ms(500).await;
        let view = h.engine.round_state(Variant::DragonTiger).await.unwrap().unwrap();
        assert_eq!(view.phase, Phase::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_timers_and_new_joins() {
        let h = harness(StrategyTable::standard()).await;
        h.engine.join_variant("b1", Variant::DragonTiger).await.unwrap();
        h.engine.shutdown().await;

        sleep_ms(5_000).await;
        let view = h.engine.round_state(Variant::DragonTiger).await.unwrap().unwrap();
        assert_eq!(view.phase, Phase::Waiting);
        assert!(h.cache.get(Variant::DragonTiger).await.unwrap().is_some());
        assert!(matches!(
            h.engine.join_variant("b1", Variant::DragonTiger).await,
            Err(EngineError::ShuttingDown)
        ));
    }
}
