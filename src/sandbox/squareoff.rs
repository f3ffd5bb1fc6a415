// =============================================================================
// Square-Off Scheduler — timed intraday closure and weekly fund reset
// =============================================================================
//
// Cron-like, single instance: one task owns the job table, each job runs to
// completion, and a job fires at most once per day (coalescing missed
// ticks). Reload swaps the whole table from sandbox config without touching
// the running process; fire state carries across the swap by job name.
//
// Exchange groups (IST):
//   NSE/BSE/NFO/BFO 15:15 · CDS/BCD 16:45 · MCX 23:30 · NCDEX 17:00
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Asia::Kolkata;
use chrono_tz::Tz;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::sandbox::execution::fill_order;
use crate::sandbox::margin::Leverages;
use crate::sandbox::SandboxEngine;
use crate::types::{
    Exchange, Order, OrderAction, OrderStatus, PriceType, Product,
};

/// One scheduled square-off.
#[derive(Debug, Clone)]
pub struct SquareOffJob {
    pub name: String,
    pub exchanges: Vec<Exchange>,
    pub at: NaiveTime,
    last_run: Option<NaiveDate>,
}

impl SquareOffJob {
    fn new(name: &str, exchanges: Vec<Exchange>, at: NaiveTime) -> Self {
        Self { name: name.to_string(), exchanges, at, last_run: None }
    }

    /// Due when the wall clock has passed `at` and today has not fired yet.
    /// A late tick still fires once (coalesce).
    fn is_due(&self, now: DateTime<Tz>) -> bool {
        now.time() >= self.at && self.last_run != Some(now.date_naive())
    }
}

#[derive(Debug, Clone)]
struct FundResetJob {
    day: Weekday,
    at: NaiveTime,
    last_run: Option<NaiveDate>,
}

pub struct SquareOffScheduler {
    engine: Arc<SandboxEngine>,
    jobs: RwLock<Vec<SquareOffJob>>,
    fund_reset: RwLock<FundResetJob>,
}

impl SquareOffScheduler {
    pub fn new(engine: Arc<SandboxEngine>) -> Self {
        let jobs = Self::jobs_from_config(&engine);
        let fund_reset = Self::reset_from_config(&engine);
        Self {
            engine,
            jobs: RwLock::new(jobs),
            fund_reset: RwLock::new(fund_reset),
        }
    }

    fn parse_time(raw: Option<String>, default: (u32, u32)) -> NaiveTime {
        raw.and_then(|s| NaiveTime::parse_from_str(&s, "%H:%M").ok())
            .unwrap_or_else(|| NaiveTime::from_hms_opt(default.0, default.1, 0).expect("valid"))
    }

    fn jobs_from_config(engine: &Arc<SandboxEngine>) -> Vec<SquareOffJob> {
        let store = engine.store();
        vec![
            SquareOffJob::new(
                "nse_bse",
                vec![Exchange::Nse, Exchange::Bse, Exchange::Nfo, Exchange::Bfo],
                Self::parse_time(store.config("nse_bse_square_off_time").ok().flatten(), (15, 15)),
            ),
            SquareOffJob::new(
                "cds_bcd",
                vec![Exchange::Cds, Exchange::Bcd],
                Self::parse_time(store.config("cds_bcd_square_off_time").ok().flatten(), (16, 45)),
            ),
            SquareOffJob::new(
                "mcx",
                vec![Exchange::Mcx],
                Self::parse_time(store.config("mcx_square_off_time").ok().flatten(), (23, 30)),
            ),
            SquareOffJob::new(
                "ncdex",
                vec![Exchange::Ncdex],
                Self::parse_time(store.config("ncdex_square_off_time").ok().flatten(), (17, 0)),
            ),
        ]
    }

    fn reset_from_config(engine: &Arc<SandboxEngine>) -> FundResetJob {
        let store = engine.store();
        let day = match store
            .config("reset_day")
            .ok()
            .flatten()
            .unwrap_or_else(|| "sun".into())
            .to_lowercase()
            .as_str()
        {
            "mon" => Weekday::Mon,
            "tue" => Weekday::Tue,
            "wed" => Weekday::Wed,
            "thu" => Weekday::Thu,
            "fri" => Weekday::Fri,
            "sat" => Weekday::Sat,
            _ => Weekday::Sun,
        };
        FundResetJob {
            day,
            at: Self::parse_time(store.config("reset_time").ok().flatten(), (0, 0)),
            last_run: None,
        }
    }

    /// Hot reload: rebuild the table from config and swap it in, carrying
    /// today's fire state across by job name so a reload never double-fires.
    pub fn reload(&self) {
        let mut fresh = Self::jobs_from_config(&self.engine);
        {
            let current = self.jobs.read();
            for job in fresh.iter_mut() {
                if let Some(existing) = current.iter().find(|j| j.name == job.name) {
                    job.last_run = existing.last_run;
                }
            }
        }
        *self.jobs.write() = fresh;

        let mut reset = Self::reset_from_config(&self.engine);
        reset.last_run = self.fund_reset.read().last_run;
        *self.fund_reset.write() = reset;

        info!("square-off schedule reloaded");
    }

    /// Snapshot of the installed jobs (name, time).
    pub fn jobs(&self) -> Vec<(String, NaiveTime)> {
        self.jobs.read().iter().map(|j| (j.name.clone(), j.at)).collect()
    }

    /// One scheduler pass at `now`. Runs every due job to completion.
    pub async fn tick(&self, now: DateTime<Tz>) {
        if self
            .engine
            .store()
            .config("square_off_enabled")
            .ok()
            .flatten()
            .map(|v| v == "true")
            .unwrap_or(true)
        {
            let due: Vec<SquareOffJob> = self
                .jobs
                .read()
                .iter()
                .filter(|j| j.is_due(now))
                .cloned()
                .collect();

            for job in due {
                info!(job = %job.name, "square-off firing");
                if let Err(e) = square_off(&self.engine, &job.exchanges).await {
                    warn!(job = %job.name, error = %e, "square-off failed");
                }
                let mut jobs = self.jobs.write();
                if let Some(j) = jobs.iter_mut().find(|j| j.name == job.name) {
                    j.last_run = Some(now.date_naive());
                }
            }
        }

        // Weekly fund reset.
        let due_reset = {
            let reset = self.fund_reset.read();
            now.weekday() == reset.day
                && now.time() >= reset.at
                && reset.last_run != Some(now.date_naive())
        };
        if due_reset {
            if let Err(e) = self.engine.store().reset_all_funds() {
                warn!(error = %e, "weekly fund reset failed");
            }
            self.fund_reset.write().last_run = Some(now.date_naive());
        }
    }
}

impl std::fmt::Debug for SquareOffScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SquareOffScheduler")
            .field("jobs", &self.jobs())
            .finish()
    }
}

// =============================================================================
// Square-off action
// =============================================================================

/// Cancel every OPEN MIS order on the given exchanges (releasing margin),
/// then close every non-zero MIS position at the current LTP.
pub async fn square_off(
    engine: &Arc<SandboxEngine>,
    exchanges: &[Exchange],
) -> anyhow::Result<()> {
    let store = engine.store();

    // 1. Cancel open MIS orders; margin returns to available.
    for order in store.open_mis_orders_for_exchanges(exchanges)? {
        if let Err(e) = engine.cancel_order(&order.user_id, &order.order_id) {
            warn!(order_id = %order.order_id, error = %e, "square-off cancel failed");
        }
    }

    // 2. Reverse every open MIS position at LTP. The synthetic closing
    // order blocks no margin of its own; the reducing fill releases the
    // position's margin and realizes P&L.
    let leverages = Leverages::from_config(store);
    for position in store.open_mis_positions_for_exchanges(exchanges)? {
        let ltp = match engine
            .quotes()
            .ltp(&position.user_id, &position.symbol, position.exchange)
            .await
        {
            Ok(ltp) if ltp > 0.0 => ltp,
            _ => {
                warn!(symbol = %position.symbol, "no LTP for square-off — skipping");
                continue;
            }
        };

        let now = Utc::now().to_rfc3339();
        let closing = Order {
            order_id: uuid::Uuid::new_v4().to_string(),
            user_id: position.user_id.clone(),
            symbol: position.symbol.clone(),
            exchange: position.exchange,
            action: if position.net_quantity > 0 { OrderAction::Sell } else { OrderAction::Buy },
            quantity: position.net_quantity.unsigned_abs() as u32,
            price_type: PriceType::Market,
            price: None,
            trigger_price: None,
            product: Product::Mis,
            status: OrderStatus::Open,
            filled_quantity: 0,
            average_price: 0.0,
            margin_blocked: 0.0,
            created_at: now.clone(),
            updated_at: now,
            broker_order_id: None,
        };
        store.insert_order(&closing)?;

        let instrument = engine
            .registry()
            .resolve(&position.symbol, position.exchange)
            .unwrap_or(crate::symbols::Instrument {
                symbol: position.symbol.clone(),
                exchange: position.exchange,
                instrument_type: crate::types::InstrumentType::Equity,
                lot_size: 1,
                tick_size: 0.05,
                expiry: None,
                strike: None,
            });
        fill_order(store, &closing, ltp, &instrument, &leverages)?;
        info!(
            user_id = %position.user_id,
            symbol = %position.symbol,
            qty = position.net_quantity,
            ltp,
            "MIS position squared off"
        );
    }

    Ok(())
}

/// Background driver. The tick period doubles as the config-reload cadence.
pub fn spawn_scheduler(
    scheduler: Arc<SquareOffScheduler>,
    tick_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_secs.max(5)));
        info!(tick_secs, "square-off scheduler started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    scheduler.reload();
                    scheduler.tick(Utc::now().with_timezone(&Kolkata)).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("square-off scheduler stopping");
                        return;
                    }
                }
            }
        }
    })
}

// =============================================================================
// Tests
// =============================================================================
