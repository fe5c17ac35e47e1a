use crate::guard::GuardError;
use crate::numeric::{Ratio, KUSD};
use crate::pool::PoolStatus;
use crate::state::read_state;
use crate::tick::{Tick, SENTINEL_TICK};
use candid::{CandidType, Deserialize, Principal};
use icrc_ledger_types::icrc1::transfer::TransferError;
use icrc_ledger_types::icrc2::transfer_from::TransferFromError;
use serde::Serialize;

pub mod dashboard;
pub mod event;
pub mod guard;
pub mod ledger;
pub mod logs;
pub mod management;
pub mod manager;
pub mod numeric;
pub mod pool;
pub mod position;
pub mod redemption;
pub mod state;
pub mod storage;
pub mod tick;
pub mod xrc;

#[cfg(any(test, feature = "test_endpoints"))]
pub mod test_helpers;

#[cfg(test)]
mod tests;

pub const SEC_NANOS: u64 = 1_000_000_000;

/// Error code carried by [ProtocolError::GenericError] when a tick-level
/// operation targets an unoccupied tick.
pub const ERROR_CODE_TICK_NOT_OCCUPIED: u64 = 1;

/// Error code carried by [ProtocolError::GenericError] when a rebalance
/// targets a position or bucket whose collateral no longer covers the debt
/// plus bonus; only liquidation can unwind it.
pub const ERROR_CODE_NEEDS_LIQUIDATION: u64 = 2;

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolArg {
    Init(InitArg),
    Upgrade(UpgradeArg),
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitArg {
    pub xrc_principal: Principal,
    pub kusd_ledger_principal: Principal,
    pub developer_principal: Principal,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeArg {
    pub price_freshness_nanos: Option<u64>,
    pub price_spread: Option<Ratio>,
}

#[derive(CandidType, Debug, Clone, PartialEq, Deserialize)]
pub enum ProtocolError {
    AmountTooLow,
    CallerNotOwner,
    PositionNotFound,
    PoolNotFound,
    DebtRatioTooSmall,
    DebtRatioTooLarge,
    RatioNotReached,
    CapacityExceeded,
    RedemptionShortfall { redeemable: KUSD },
    TemporarilyUnavailable(String),
    AlreadyProcessing,
    AnonymousCallerNotAllowed,
    TransferError(TransferError),
    TransferFromError(TransferFromError, u64),
    GenericError { error_code: u64, message: String },
}

impl From<GuardError> for ProtocolError {
    fn from(e: GuardError) -> Self {
        match e {
            GuardError::AlreadyProcessing => Self::AlreadyProcessing,
            GuardError::TooManyConcurrentRequests => {
                Self::TemporarilyUnavailable("too many concurrent requests".to_string())
            }
        }
    }
}

#[derive(CandidType, Deserialize, Debug)]
pub struct GetEventsArg {
    pub start: u64,
    pub length: u64,
}

/// Per-pool snapshot served by `get_protocol_status`.
#[derive(CandidType, Deserialize, Debug)]
pub struct PoolStatusView {
    pub pool_id: u64,
    pub collateral_symbol: String,
    pub status: PoolStatus,
    pub position_count: u64,
    pub total_collateral: u64,
    pub total_debt: u64,
    pub top_tick: Option<Tick>,
    pub debt_index: Ratio,
    pub collateral_index: Ratio,
    pub reserve_balance: u64,
    pub last_price: Option<f64>,
    pub last_price_timestamp: Option<u64>,
}

#[derive(CandidType, Deserialize, Debug)]
pub struct ProtocolStatus {
    pub pools: Vec<PoolStatusView>,
    pub total_debt: u64,
    pub pending_payouts: u64,
    pub event_count: u64,
}

pub fn get_protocol_status() -> ProtocolStatus {
    read_state(|s| ProtocolStatus {
        pools: s
            .pools
            .values()
            .map(|record| {
                let top_tick = record.engine.top_tick();
                PoolStatusView {
                    pool_id: record.pool_id,
                    collateral_symbol: record.collateral_symbol.clone(),
                    status: record.engine.status,
                    position_count: record.engine.position_count() as u64,
                    total_collateral: numeric::Collateral::from_decimal_floor(
                        record.engine.total_collateral_raw(),
                    )
                    .to_u64(),
                    total_debt: KUSD::from_decimal_ceil(record.engine.total_debt_raw()).to_u64(),
                    top_tick: (top_tick != SENTINEL_TICK).then_some(top_tick),
                    debt_index: Ratio::new(record.engine.ledger().debt_index()),
                    collateral_index: Ratio::new(record.engine.ledger().collateral_index()),
                    reserve_balance: numeric::Collateral::from_decimal_floor(
                        record.reserve.balance(),
                    )
                    .to_u64(),
                    last_price: record.last_price.map(|p| p.anchor.to_f64()),
                    last_price_timestamp: record.last_price_timestamp,
                }
            })
            .collect(),
        total_debt: s.total_debt().to_u64(),
        pending_payouts: s.pending_payouts.len() as u64,
        event_count: storage::count_events(),
    })
}
