use crate::logs::INFO;
use crate::numeric::{Collateral, PriceTriple, Ratio, KUSD};
use crate::pool::{FundingPool, PoolConfig, PoolStatus, ReservePool};
use crate::{InitArg, ProtocolError, UpgradeArg};
use candid::{CandidType, Principal};
use ic_canister_log::log;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

// Like assert_eq, but returns an error instead of panicking.
macro_rules! ensure_eq {
    ($lhs:expr, $rhs:expr, $msg:expr $(, $args:expr)* $(,)*) => {
        if $lhs != $rhs {
            return Err(format!("{} ({:?}) != {} ({:?}): {}",
                               std::stringify!($lhs), $lhs,
                               std::stringify!($rhs), $rhs,
                               format!($msg $(,$args)*)));
        }
    }
}

macro_rules! ensure {
    ($cond:expr, $msg:expr $(, $args:expr)* $(,)*) => {
        if !$cond {
            return Err(format!("Condition {} is false: {}",
                               std::stringify!($cond),
                               format!($msg $(,$args)*)));
        }
    }
}

pub type PoolId = u64;

pub const KUSD_TRANSFER_FEE: KUSD = KUSD::new(10_000);
/// Symmetric confidence band applied around the oracle quote to derive the
/// (min, anchor, max) price triple.
pub const DEFAULT_PRICE_SPREAD: Ratio = Ratio::new(dec!(0.005));
pub const DEFAULT_PRICE_FRESHNESS_NANOS: u64 = 5 * 60 * 1_000_000_000;

/// Converts a wrapped collateral's raw units into canonical units of the
/// asset the oracle actually prices.
#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateSource {
    Identity,
    Scaled { rate: Ratio },
}

impl RateSource {
    pub fn apply(&self, quote: Decimal) -> Decimal {
        match self {
            RateSource::Identity => quote,
            RateSource::Scaled { rate } => quote * rate.0,
        }
    }
}

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutToken {
    Collateral,
    Kusd,
}

/// A transfer the canister still owes someone; retried by the payout timer
/// until the ledger accepts it.
#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPayout {
    pub payout_id: u64,
    pub pool_id: PoolId,
    pub receiver: Principal,
    pub token: PayoutToken,
    pub amount: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub pool_id: PoolId,
    pub engine: FundingPool,
    /// Collateral set aside for liquidation-bonus top-ups, same token as the
    /// pool's collateral.
    pub reserve: ReservePool,
    pub collateral_ledger: Principal,
    pub collateral_symbol: String,
    pub collateral_decimals: u8,
    pub ledger_fee: Collateral,
    pub rate_source: RateSource,
    pub last_price: Option<PriceTriple>,
    pub last_price_timestamp: Option<u64>,
}

thread_local! {
    static __STATE: RefCell<Option<State>> = RefCell::default();
}

#[derive(Debug)]
pub struct State {
    pub pools: BTreeMap<PoolId, PoolRecord>,
    pub next_pool_id: PoolId,

    pub xrc_principal: Principal,
    pub kusd_ledger_principal: Principal,
    pub developer_principal: Principal,
    pub kusd_ledger_fee: KUSD,
    pub price_spread: Ratio,
    pub price_freshness_nanos: u64,

    pub pending_payouts: BTreeMap<u64, PendingPayout>,
    pub next_payout_id: u64,

    pub principal_guards: BTreeSet<Principal>,
    pub principal_guard_timestamps: BTreeMap<Principal, u64>,
    pub operation_names: BTreeMap<Principal, String>,
    pub is_timer_running: bool,
    pub is_fetching_rate: bool,
}

impl From<InitArg> for State {
    fn from(args: InitArg) -> Self {
        Self {
            pools: BTreeMap::new(),
            next_pool_id: 0,
            xrc_principal: args.xrc_principal,
            kusd_ledger_principal: args.kusd_ledger_principal,
            developer_principal: args.developer_principal,
            kusd_ledger_fee: KUSD_TRANSFER_FEE,
            price_spread: DEFAULT_PRICE_SPREAD,
            price_freshness_nanos: DEFAULT_PRICE_FRESHNESS_NANOS,
            pending_payouts: BTreeMap::new(),
            next_payout_id: 0,
            principal_guards: BTreeSet::new(),
            principal_guard_timestamps: BTreeMap::new(),
            operation_names: BTreeMap::new(),
            is_timer_running: false,
            is_fetching_rate: false,
        }
    }
}

impl State {
    pub fn upgrade(&mut self, args: UpgradeArg) {
        if let Some(nanos) = args.price_freshness_nanos {
            self.price_freshness_nanos = nanos;
        }
        if let Some(spread) = args.price_spread {
            self.price_spread = spread;
        }
    }

    pub fn pool(&self, pool_id: PoolId) -> Result<&PoolRecord, ProtocolError> {
        self.pools
            .get(&pool_id)
            .ok_or(ProtocolError::PoolNotFound)
    }

    pub fn pool_mut(&mut self, pool_id: PoolId) -> Result<&mut PoolRecord, ProtocolError> {
        self.pools
            .get_mut(&pool_id)
            .ok_or(ProtocolError::PoolNotFound)
    }

    pub fn register_pool(
        &mut self,
        config: PoolConfig,
        collateral_ledger: Principal,
        collateral_symbol: String,
        collateral_decimals: u8,
        ledger_fee: Collateral,
        rate_source: RateSource,
        timestamp: u64,
    ) -> PoolId {
        let pool_id = self.next_pool_id;
        self.next_pool_id += 1;
        self.pools.insert(
            pool_id,
            PoolRecord {
                pool_id,
                engine: FundingPool::new(config, timestamp),
                reserve: ReservePool::default(),
                collateral_ledger,
                collateral_symbol,
                collateral_decimals,
                ledger_fee,
                rate_source,
                last_price: None,
                last_price_timestamp: None,
            },
        );
        pool_id
    }

    pub fn set_pool_status(&mut self, pool_id: PoolId, status: PoolStatus) {
        if let Some(record) = self.pools.get_mut(&pool_id) {
            record.engine.status = status;
        } else {
            log!(INFO, "[set_pool_status] unknown pool {}", pool_id);
        }
    }

    /// Caches a fresh oracle quote for the pool, deriving the price triple
    /// from the configured spread and the pool's rate source. Older quotes
    /// never overwrite newer ones.
    pub fn set_price(&mut self, pool_id: PoolId, quote: Decimal, timestamp_nanos: u64) {
        let spread = self.price_spread;
        if let Some(record) = self.pools.get_mut(&pool_id) {
            if record
                .last_price_timestamp
                .map(|ts| ts >= timestamp_nanos)
                .unwrap_or(false)
            {
                return;
            }
            let canonical = record.rate_source.apply(quote);
            record.last_price = Some(PriceTriple::from_quote(
                canonical,
                spread,
                record.collateral_decimals,
            ));
            record.last_price_timestamp = Some(timestamp_nanos);
        }
    }

    pub fn check_price_not_too_old(&self, pool_id: PoolId) -> Result<(), ProtocolError> {
        let record = self.pool(pool_id)?;
        match record.last_price_timestamp {
            None => Err(ProtocolError::TemporarilyUnavailable(
                "no price available yet".to_string(),
            )),
            Some(ts) => {
                let age = ic_cdk::api::time().saturating_sub(ts);
                if age > self.price_freshness_nanos {
                    return Err(ProtocolError::TemporarilyUnavailable(format!(
                        "price is too old: {}s",
                        age / 1_000_000_000
                    )));
                }
                Ok(())
            }
        }
    }

    /// The cached price triple for a pool; the caller must have verified
    /// freshness for mutating paths.
    pub fn price_for(&self, pool_id: PoolId) -> Result<PriceTriple, ProtocolError> {
        self.pool(pool_id)?.last_price.ok_or_else(|| {
            ProtocolError::TemporarilyUnavailable("no price available yet".to_string())
        })
    }

    pub fn add_pending_payout(
        &mut self,
        pool_id: PoolId,
        receiver: Principal,
        token: PayoutToken,
        amount: u64,
    ) -> u64 {
        let payout_id = self.next_payout_id;
        self.next_payout_id += 1;
        self.pending_payouts.insert(
            payout_id,
            PendingPayout {
                payout_id,
                pool_id,
                receiver,
                token,
                amount,
            },
        );
        payout_id
    }

    pub fn complete_payout(&mut self, payout_id: u64) {
        self.pending_payouts.remove(&payout_id);
    }

    pub fn fund_reserve(&mut self, pool_id: PoolId, amount: Collateral) {
        if let Some(record) = self.pools.get_mut(&pool_id) {
            record.reserve.deposit(amount);
        } else {
            log!(INFO, "[fund_reserve] unknown pool {}", pool_id);
        }
    }

    pub fn total_collateral(&self) -> Collateral {
        Collateral::from_decimal_floor(
            self.pools
                .values()
                .map(|r| r.engine.total_collateral_raw())
                .sum(),
        )
    }

    pub fn total_debt(&self) -> KUSD {
        KUSD::from_decimal_ceil(self.pools.values().map(|r| r.engine.total_debt_raw()).sum())
    }

    /// Checks the per-pool accounting invariants; used by the self_check
    /// feature and the tests.
    pub fn check_invariants(&self) -> Result<(), String> {
        for record in self.pools.values() {
            record
                .engine
                .check_invariants()
                .map_err(|e| format!("pool {}: {}", record.pool_id, e))?;
            ensure!(
                record.reserve.balance() >= Decimal::ZERO,
                "pool {} reserve balance is negative",
                record.pool_id
            );
        }
        ensure!(
            self.next_pool_id as usize >= self.pools.len(),
            "pool id counter ran behind the registry"
        );
        Ok(())
    }

    /// Checks that this state and its event-log replay agree on everything
    /// the events are supposed to capture.
    pub fn check_semantically_eq(&self, other: &Self) -> Result<(), String> {
        ensure_eq!(self.pools, other.pools, "pools do not match");
        ensure_eq!(
            self.next_pool_id,
            other.next_pool_id,
            "next_pool_id does not match"
        );
        ensure_eq!(
            self.pending_payouts,
            other.pending_payouts,
            "pending payouts do not match"
        );
        ensure_eq!(
            self.kusd_ledger_principal,
            other.kusd_ledger_principal,
            "kusd ledger principal does not match"
        );
        Ok(())
    }
}

/// Mutates (part of) the current state using `f`.
///
/// Panics if there is no state.
pub fn mutate_state<F, R>(f: F) -> R
where
    F: FnOnce(&mut State) -> R,
{
    __STATE.with(|s| f(s.borrow_mut().as_mut().expect("State not initialized!")))
}

/// Read (part of) the current state using `f`.
///
/// Panics if there is no state.
pub fn read_state<F, R>(f: F) -> R
where
    F: FnOnce(&State) -> R,
{
    __STATE.with(|s| f(s.borrow().as_ref().expect("State not initialized!")))
}

/// Replaces the current state.
pub fn replace_state(state: State) {
    __STATE.with(|s| {
        *s.borrow_mut() = Some(state);
    });
}
