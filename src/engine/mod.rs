//! Exploit gate.
//!
//! The engine reacts to `Added` / `Updated` events from the finder. It
//! picks a held currency that is a node of the opportunity, checks the
//! balance is sufficient, re-checks the arbitrage against freshly fetched
//! order books and then runs the exploit under a single execution lock.
//! Events arriving while the lock is held are dropped.

pub mod balance;

pub use balance::{Balance, BalanceCheckpoint, DUST_THRESHOLD};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use strum::Display;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ExchangeError, OpportunityError};
use crate::exchange::{Currency, Exchange, Market};
use crate::finder::{OpportunityEvent, OpportunityMap};
use crate::metrics;
use crate::opportunity::{ExecutionSettings, ExploitOutcome, Opportunity};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Distance kept from the exact volume bounds.
    pub margin_factor: Decimal,
    /// Share of the tradable volume actually traded.
    pub safety_factor: Decimal,
    /// Also require the balance to stay below `max_volume * margin_factor`.
    pub cap_balance_by_max_volume: bool,
    /// Period of the background balance refresh.
    pub balance_refresh: Duration,
    /// Currencies never considered part of the balance.
    pub excluded_currencies: Vec<Currency>,
    /// Minimum arbitrage still worth trading at the last-minute re-check.
    pub threshold: Decimal,
    /// Order book depth requested for the re-check.
    pub order_book_depth: usize,
    /// Order execution parameters.
    pub execution: ExecutionSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            margin_factor: Decimal::new(9, 1),
            safety_factor: Decimal::new(9, 1),
            cap_balance_by_max_volume: false,
            balance_refresh: Duration::from_secs(30),
            excluded_currencies: vec!["DTH".to_string()],
            threshold: Decimal::new(1001, 3),
            order_book_depth: 5,
            execution: ExecutionSettings::default(),
        }
    }
}

/// Why an opportunity was not exploited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SkipReason {
    /// Another exploit holds the lock.
    Locked,
    /// The last balance refresh failed.
    BalanceUnavailable,
    /// The opportunity is not in the published map.
    Missing,
    /// No held currency passes the sufficiency check.
    NotExploitable,
    /// The order books could not be fetched for the re-check.
    BooksUnavailable,
    /// The arbitrage moved between detection and execution.
    ArbitrageChanged,
}

/// An opportunity cleared for execution. Holds the execution lock until
/// dropped.
#[derive(Debug)]
pub struct ExploitPlan {
    /// Opportunity rotated to `currency`.
    pub opportunity: Opportunity,
    /// Currency the cycle starts and ends in.
    pub currency: Currency,
    /// Volume of `currency` to trade.
    pub starting_volume: Decimal,
    guard: OwnedMutexGuard<()>,
}

/// Result of one execution.
#[derive(Debug)]
pub struct ExploitReport {
    /// Opportunity id.
    pub opportunity_id: String,
    /// Reference currency.
    pub currency: Currency,
    /// Traded volume.
    pub starting_volume: Decimal,
    /// Exploit result.
    pub outcome: Result<ExploitOutcome, OpportunityError>,
    /// Realized balance change.
    pub diff: BTreeMap<Currency, Decimal>,
    /// Whether the reference currency grew.
    pub gained: bool,
}

#[derive(Debug, Default)]
struct EngineCounters {
    evaluated: AtomicU64,
    skipped_locked: AtomicU64,
    not_exploitable: AtomicU64,
    exploited: AtomicU64,
    failed: AtomicU64,
    last_diff: StdMutex<BTreeMap<Currency, Decimal>>,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub evaluated: u64,
    pub skipped_locked: u64,
    pub not_exploitable: u64,
    pub exploited: u64,
    pub failed: u64,
    pub locked: bool,
    pub balance_healthy: bool,
    pub last_diff: BTreeMap<Currency, Decimal>,
}

/// Exploit gate over one exchange.
pub struct Engine<E: Exchange + ?Sized> {
    exchange: Arc<E>,
    settings: EngineSettings,
    balance: Arc<RwLock<Balance>>,
    balance_healthy: Arc<AtomicBool>,
    lock: Arc<Mutex<()>>,
    opportunities: watch::Receiver<OpportunityMap>,
    counters: Arc<EngineCounters>,
}

impl<E: Exchange + ?Sized> Clone for Engine<E> {
    fn clone(&self) -> Self {
        Self {
            exchange: self.exchange.clone(),
            settings: self.settings.clone(),
            balance: self.balance.clone(),
            balance_healthy: self.balance_healthy.clone(),
            lock: self.lock.clone(),
            opportunities: self.opportunities.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<E: Exchange + ?Sized> Engine<E> {
    /// Create an engine reading opportunities from the finder's snapshot.
    pub fn new(exchange: Arc<E>, settings: EngineSettings, opportunities: watch::Receiver<OpportunityMap>) -> Self {
        let balance = Balance::new(settings.excluded_currencies.iter().cloned());
        Self {
            exchange,
            settings,
            balance: Arc::new(RwLock::new(balance)),
            balance_healthy: Arc::new(AtomicBool::new(false)),
            lock: Arc::new(Mutex::new(())),
            opportunities,
            counters: Arc::new(EngineCounters::default()),
        }
    }

    /// Load currency precisions and fetch the initial balance.
    pub async fn init(&self, markets: &[Market]) -> Result<(), ExchangeError> {
        self.balance.write().await.set_precisions(markets);
        self.refresh_balance().await
    }

    /// Fetch the balance. On failure the engine refuses to trade until the
    /// next successful refresh.
    pub async fn refresh_balance(&self) -> Result<(), ExchangeError> {
        match self.exchange.fetch_balance().await {
            Ok(free) => {
                self.balance.write().await.replace(&free);
                self.balance_healthy.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.balance_healthy.store(false, Ordering::Release);
                warn!(error = %e, "Balance refresh failed, trading suspended");
                Err(e)
            }
        }
    }

    /// Copy of the current balance.
    pub async fn balance(&self) -> Balance {
        self.balance.read().await.clone()
    }

    /// Whether the last balance refresh succeeded.
    pub fn is_balance_healthy(&self) -> bool {
        self.balance_healthy.load(Ordering::Acquire)
    }

    /// Whether an exploit is running.
    pub fn is_locked(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> EngineStats {
        let last_diff = match self.counters.last_diff.lock() {
            Ok(diff) => diff.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        EngineStats {
            evaluated: self.counters.evaluated.load(Ordering::Relaxed),
            skipped_locked: self.counters.skipped_locked.load(Ordering::Relaxed),
            not_exploitable: self.counters.not_exploitable.load(Ordering::Relaxed),
            exploited: self.counters.exploited.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            locked: self.is_locked(),
            balance_healthy: self.is_balance_healthy(),
            last_diff,
        }
    }

    /// Decide whether opportunity `id` can be exploited now. On success the
    /// returned plan holds the execution lock.
    #[instrument(skip(self), fields(opportunity = %id))]
    pub async fn prepare(&self, id: &str) -> Result<ExploitPlan, SkipReason> {
        self.counters.evaluated.fetch_add(1, Ordering::Relaxed);

        let Ok(guard) = self.lock.clone().try_lock_owned() else {
            self.counters.skipped_locked.fetch_add(1, Ordering::Relaxed);
            debug!("Exploit in progress, event dropped");
            return Err(SkipReason::Locked);
        };

        if !self.is_balance_healthy() {
            warn!("Balance unavailable, opportunity skipped");
            return Err(SkipReason::BalanceUnavailable);
        }

        let Some(mut opportunity) = self.opportunities.borrow().get(id).cloned() else {
            error!("Opportunity missing from the published map");
            return Err(SkipReason::Missing);
        };
        let decided_arbitrage = opportunity.arbitrage();

        // the published edges may be a whole polling cycle old
        if let Err(e) = opportunity
            .update_from_api(self.exchange.as_ref(), self.settings.order_book_depth)
            .await
        {
            warn!(error = %e, "Could not refresh order books, opportunity skipped");
            return Err(SkipReason::BooksUnavailable);
        }
        let current = Opportunity::compute_arbitrage(opportunity.edges());
        if current != decided_arbitrage || current <= self.settings.threshold {
            warn!(
                decided = %decided_arbitrage,
                current = %current,
                "Arbitrage changed before execution, aborting"
            );
            return Err(SkipReason::ArbitrageChanged);
        }

        let chosen = {
            let balance = self.balance.read().await;
            let mut chosen = None;
            for currency in balance.intersection(&opportunity) {
                if let Err(e) = opportunity.change_starting_point(&currency) {
                    error!(currency = %currency, error = %e, "Could not rotate opportunity to held currency");
                    continue;
                }
                if balance.sufficient(
                    &opportunity,
                    self.settings.margin_factor,
                    self.settings.cap_balance_by_max_volume,
                ) {
                    chosen = balance.get(&currency).map(|held| (currency, held));
                    break;
                }
            }
            chosen
        };

        let Some((currency, held)) = chosen else {
            self.counters.not_exploitable.fetch_add(1, Ordering::Relaxed);
            debug!(
                min_volume = %opportunity.min_volume(),
                max_volume = ?opportunity.max_volume(),
                "Not exploitable with current balance"
            );
            return Err(SkipReason::NotExploitable);
        };

        let tradable = opportunity.max_volume().map_or(held, |max| max.min(held));
        let starting_volume = tradable * self.settings.safety_factor;

        Ok(ExploitPlan {
            opportunity,
            currency,
            starting_volume,
            guard,
        })
    }

    /// Run a plan, refresh the balance and report the realized change. The
    /// lock is released when this returns.
    #[instrument(skip(self, plan), fields(opportunity = %plan.opportunity.id(), currency = %plan.currency))]
    pub async fn execute(&self, plan: ExploitPlan) -> ExploitReport {
        let ExploitPlan {
            mut opportunity,
            currency,
            starting_volume,
            guard,
        } = plan;
        let checkpoint = self.balance.read().await.checkpoint();

        let outcome = opportunity
            .exploit(
                self.exchange.as_ref(),
                &currency,
                starting_volume,
                &self.settings.execution,
            )
            .await;

        let label = match &outcome {
            Ok(ExploitOutcome::Completed { output }) => {
                info!(input = %starting_volume, output = %output, "Opportunity exploited");
                self.counters.exploited.fetch_add(1, Ordering::Relaxed);
                "completed"
            }
            Ok(ExploitOutcome::Failed {
                error,
                stranded_currency,
                stranded_volume,
                unwind,
            }) => {
                error!(
                    edge = %error.edge(),
                    error = %error,
                    stranded_currency = %stranded_currency,
                    stranded_volume = %stranded_volume,
                    unwind = ?unwind,
                    "Exploit failed"
                );
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                "failed"
            }
            Err(e) => {
                error!(error = %e, "Exploit aborted");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                "aborted"
            }
        };
        metrics::inc_exploits(label);

        // refresh_balance logs its own failure
        let _ = self.refresh_balance().await;
        let diff = self.balance.read().await.diff(&checkpoint);
        let gained = diff.get(&currency).is_some_and(|d| *d > Decimal::ZERO);

        if gained {
            info!(diff = ?diff, "Balance diff");
        } else if self.settings.execution.mock {
            info!(diff = ?diff, "No money gained (dry run)");
        } else {
            warn!(diff = ?diff, "No money gained");
        }

        match self.counters.last_diff.lock() {
            Ok(mut last) => *last = diff.clone(),
            Err(poisoned) => *poisoned.into_inner() = diff.clone(),
        }
        drop(guard);

        ExploitReport {
            opportunity_id: opportunity.id().to_string(),
            currency,
            starting_volume,
            outcome,
            diff,
            gained,
        }
    }
}

impl<E: Exchange + ?Sized + 'static> Engine<E> {
    /// React to a finder event. Returns the spawned execution, if any.
    pub async fn handle(&self, event: &OpportunityEvent) -> Option<JoinHandle<ExploitReport>> {
        let id = match event {
            OpportunityEvent::Added { id } | OpportunityEvent::Updated { id, .. } => id,
            OpportunityEvent::Closed { .. } => return None,
        };

        match self.prepare(id).await {
            Ok(plan) => {
                let engine = self.clone();
                Some(tokio::spawn(async move { engine.execute(plan).await }))
            }
            Err(reason) => {
                debug!(opportunity = %id, reason = %reason, "Opportunity skipped");
                None
            }
        }
    }

    /// Consume finder events until the channel closes or `shutdown` flips.
    /// The balance is refreshed periodically while no exploit runs.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<OpportunityEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(mock = self.settings.execution.mock, "Engine started");
        let mut refresh = interval(self.settings.balance_refresh);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick fires immediately and init already fetched
        refresh.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle(&event).await;
                    }
                    None => break,
                },
                _ = refresh.tick() => {
                    if !self.is_locked() {
                        let _ = self.refresh_balance().await;
                    }
                }
            }
        }

        // let a running exploit finish before returning
        let _guard = self.lock.lock().await;
        info!("Engine stopped");
    }
}
