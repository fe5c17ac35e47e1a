//! The event log: every committed state mutation is captured as one event,
//! and replaying the log from `Init` reproduces the exact same state.
//!
//! Events store the price triple the operation was executed with, so replay
//! never depends on the oracle.

use crate::numeric::{Collateral, PriceTriple, KUSD};
use crate::pool::{
    AdjustReceipt, CloseReceipt, LiquidationReceipt, OpenReceipt, PoolConfig, PoolStatus,
    RebalanceReceipt,
};
use crate::redemption::RedemptionReceipt;
use crate::state::{PayoutToken, PendingPayout, PoolId, RateSource, State};
use crate::storage::record_event;
use crate::tick::Tick;
use crate::{InitArg, ProtocolError, UpgradeArg};
use candid::{CandidType, Principal};
use serde::{Deserialize, Serialize};

#[derive(CandidType, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Event {
    #[serde(rename = "init")]
    Init(InitArg),

    #[serde(rename = "upgrade")]
    Upgrade(UpgradeArg),

    #[serde(rename = "register_pool")]
    RegisterPool {
        config: PoolConfig,
        collateral_ledger: Principal,
        collateral_symbol: String,
        collateral_decimals: u8,
        ledger_fee: Collateral,
        rate_source: RateSource,
        timestamp: u64,
    },

    #[serde(rename = "set_pool_status")]
    SetPoolStatus { pool_id: PoolId, status: PoolStatus },

    #[serde(rename = "open_position")]
    OpenPosition {
        pool_id: PoolId,
        owner: Principal,
        collateral: Collateral,
        debt: KUSD,
        price: PriceTriple,
        block_index: u64,
    },

    #[serde(rename = "adjust_position")]
    AdjustPosition {
        pool_id: PoolId,
        position_id: u64,
        caller: Principal,
        delta_collateral: i64,
        delta_debt: i64,
        price: PriceTriple,
        block_index: Option<u64>,
    },

    #[serde(rename = "close_position")]
    ClosePosition {
        pool_id: PoolId,
        position_id: u64,
        caller: Principal,
        block_index: Option<u64>,
    },

    #[serde(rename = "rebalance_position")]
    RebalancePosition {
        pool_id: PoolId,
        position_id: u64,
        max_debt: KUSD,
        price: PriceTriple,
        caller: Principal,
    },

    #[serde(rename = "rebalance_tick")]
    RebalanceTick {
        pool_id: PoolId,
        tick: Tick,
        max_debt: KUSD,
        price: PriceTriple,
        caller: Principal,
    },

    #[serde(rename = "liquidate")]
    Liquidate {
        pool_id: PoolId,
        position_id: u64,
        max_debt: KUSD,
        price: PriceTriple,
        liquidator: Principal,
    },

    #[serde(rename = "redeem")]
    Redeem {
        pool_id: PoolId,
        amount: KUSD,
        price: PriceTriple,
        redeemer: Principal,
        block_index: u64,
    },

    #[serde(rename = "charge_funding")]
    ChargeFunding { pool_id: PoolId, timestamp: u64 },

    #[serde(rename = "fund_reserve")]
    FundReserve {
        pool_id: PoolId,
        amount: Collateral,
        caller: Principal,
        block_index: u64,
    },

    #[serde(rename = "claim_fees")]
    ClaimFees { pool_id: PoolId },

    #[serde(rename = "payout_created")]
    PayoutCreated { payout: PendingPayout },

    #[serde(rename = "payout_completed")]
    PayoutCompleted {
        payout_id: u64,
        block_index: u64,
    },
}

#[derive(Debug)]
pub enum ReplayLogError {
    /// There are no events in the event log.
    EmptyLog,
    /// The event log is inconsistent.
    InconsistentLog(String),
}

// ---- apply functions, shared between live recording and replay ----

fn apply_open_position(
    state: &mut State,
    pool_id: PoolId,
    owner: Principal,
    collateral: Collateral,
    debt: KUSD,
    price: PriceTriple,
) -> Result<OpenReceipt, ProtocolError> {
    let record = state.pool_mut(pool_id)?;
    record.engine.open_position(owner, collateral, debt, price)
}

fn apply_adjust_position(
    state: &mut State,
    pool_id: PoolId,
    caller: Principal,
    position_id: u64,
    delta_collateral: i64,
    delta_debt: i64,
    price: PriceTriple,
) -> Result<AdjustReceipt, ProtocolError> {
    let record = state.pool_mut(pool_id)?;
    record
        .engine
        .adjust_position(caller, position_id, delta_collateral, delta_debt, price)
}

fn apply_close_position(
    state: &mut State,
    pool_id: PoolId,
    caller: Principal,
    position_id: u64,
) -> Result<CloseReceipt, ProtocolError> {
    let record = state.pool_mut(pool_id)?;
    record.engine.close_position(caller, position_id)
}

fn apply_rebalance_position(
    state: &mut State,
    pool_id: PoolId,
    position_id: u64,
    max_debt: KUSD,
    price: PriceTriple,
) -> Result<RebalanceReceipt, ProtocolError> {
    let record = state.pool_mut(pool_id)?;
    record.engine.rebalance_position(position_id, max_debt, price)
}

fn apply_rebalance_tick(
    state: &mut State,
    pool_id: PoolId,
    tick: Tick,
    max_debt: KUSD,
    price: PriceTriple,
) -> Result<RebalanceReceipt, ProtocolError> {
    let record = state.pool_mut(pool_id)?;
    record.engine.rebalance_tick(tick, max_debt, price)
}

fn apply_liquidate(
    state: &mut State,
    pool_id: PoolId,
    position_id: u64,
    max_debt: KUSD,
    price: PriceTriple,
) -> Result<LiquidationReceipt, ProtocolError> {
    let record = state
        .pools
        .get_mut(&pool_id)
        .ok_or(ProtocolError::PoolNotFound)?;
    let crate::state::PoolRecord { engine, reserve, .. } = record;
    engine.liquidate(position_id, max_debt, price, reserve)
}

fn apply_redeem(
    state: &mut State,
    pool_id: PoolId,
    amount: KUSD,
    price: PriceTriple,
) -> Result<RedemptionReceipt, ProtocolError> {
    let record = state.pool_mut(pool_id)?;
    // A recorded redemption already succeeded; the exact-fill requirement
    // only matters at record time.
    record.engine.redeem(amount, false, price)
}

// ---- record helpers: apply first, log only what succeeded ----

pub fn record_register_pool(
    state: &mut State,
    config: PoolConfig,
    collateral_ledger: Principal,
    collateral_symbol: String,
    collateral_decimals: u8,
    ledger_fee: Collateral,
    rate_source: RateSource,
    timestamp: u64,
) -> PoolId {
    record_event(&Event::RegisterPool {
        config: config.clone(),
        collateral_ledger,
        collateral_symbol: collateral_symbol.clone(),
        collateral_decimals,
        ledger_fee,
        rate_source: rate_source.clone(),
        timestamp,
    });
    state.register_pool(
        config,
        collateral_ledger,
        collateral_symbol,
        collateral_decimals,
        ledger_fee,
        rate_source,
        timestamp,
    )
}

pub fn record_set_pool_status(state: &mut State, pool_id: PoolId, status: PoolStatus) {
    record_event(&Event::SetPoolStatus { pool_id, status });
    state.set_pool_status(pool_id, status);
}

pub fn record_open_position(
    state: &mut State,
    pool_id: PoolId,
    owner: Principal,
    collateral: Collateral,
    debt: KUSD,
    price: PriceTriple,
    block_index: u64,
) -> Result<OpenReceipt, ProtocolError> {
    let receipt = apply_open_position(state, pool_id, owner, collateral, debt, price)?;
    record_event(&Event::OpenPosition {
        pool_id,
        owner,
        collateral,
        debt,
        price,
        block_index,
    });
    Ok(receipt)
}

#[allow(clippy::too_many_arguments)]
pub fn record_adjust_position(
    state: &mut State,
    pool_id: PoolId,
    caller: Principal,
    position_id: u64,
    delta_collateral: i64,
    delta_debt: i64,
    price: PriceTriple,
    block_index: Option<u64>,
) -> Result<AdjustReceipt, ProtocolError> {
    let receipt = apply_adjust_position(
        state,
        pool_id,
        caller,
        position_id,
        delta_collateral,
        delta_debt,
        price,
    )?;
    record_event(&Event::AdjustPosition {
        pool_id,
        position_id,
        caller,
        delta_collateral,
        delta_debt,
        price,
        block_index,
    });
    Ok(receipt)
}

pub fn record_close_position(
    state: &mut State,
    pool_id: PoolId,
    caller: Principal,
    position_id: u64,
    block_index: Option<u64>,
) -> Result<CloseReceipt, ProtocolError> {
    let receipt = apply_close_position(state, pool_id, caller, position_id)?;
    record_event(&Event::ClosePosition {
        pool_id,
        position_id,
        caller,
        block_index,
    });
    Ok(receipt)
}

pub fn record_rebalance_position(
    state: &mut State,
    pool_id: PoolId,
    position_id: u64,
    max_debt: KUSD,
    price: PriceTriple,
    caller: Principal,
) -> Result<RebalanceReceipt, ProtocolError> {
    let receipt = apply_rebalance_position(state, pool_id, position_id, max_debt, price)?;
    record_event(&Event::RebalancePosition {
        pool_id,
        position_id,
        max_debt,
        price,
        caller,
    });
    Ok(receipt)
}

pub fn record_rebalance_tick(
    state: &mut State,
    pool_id: PoolId,
    tick: Tick,
    max_debt: KUSD,
    price: PriceTriple,
    caller: Principal,
) -> Result<RebalanceReceipt, ProtocolError> {
    let receipt = apply_rebalance_tick(state, pool_id, tick, max_debt, price)?;
    record_event(&Event::RebalanceTick {
        pool_id,
        tick,
        max_debt,
        price,
        caller,
    });
    Ok(receipt)
}

pub fn record_liquidate(
    state: &mut State,
    pool_id: PoolId,
    position_id: u64,
    max_debt: KUSD,
    price: PriceTriple,
    liquidator: Principal,
) -> Result<LiquidationReceipt, ProtocolError> {
    let receipt = apply_liquidate(state, pool_id, position_id, max_debt, price)?;
    record_event(&Event::Liquidate {
        pool_id,
        position_id,
        max_debt,
        price,
        liquidator,
    });
    Ok(receipt)
}

pub fn record_redeem(
    state: &mut State,
    pool_id: PoolId,
    amount: KUSD,
    exact: bool,
    price: PriceTriple,
    redeemer: Principal,
    block_index: u64,
) -> Result<RedemptionReceipt, ProtocolError> {
    let record = state.pool_mut(pool_id)?;
    let receipt = record.engine.redeem(amount, exact, price)?;
    // Replay re-runs the walk with the non-exact form; an exact request that
    // succeeded produces the identical fill.
    record_event(&Event::Redeem {
        pool_id,
        amount,
        price,
        redeemer,
        block_index,
    });
    Ok(receipt)
}

pub fn record_charge_funding(state: &mut State, pool_id: PoolId, timestamp: u64) -> KUSD {
    record_event(&Event::ChargeFunding { pool_id, timestamp });
    match state.pool_mut(pool_id) {
        Ok(record) => record.engine.charge_funding(timestamp),
        Err(_) => KUSD::new(0),
    }
}

pub fn record_fund_reserve(
    state: &mut State,
    pool_id: PoolId,
    amount: Collateral,
    caller: Principal,
    block_index: u64,
) {
    record_event(&Event::FundReserve {
        pool_id,
        amount,
        caller,
        block_index,
    });
    state.fund_reserve(pool_id, amount);
}

pub fn record_claim_fees(state: &mut State, pool_id: PoolId) -> Result<(KUSD, Collateral), ProtocolError> {
    let record = state.pool_mut(pool_id)?;
    let fees = record.engine.take_fees();
    record_event(&Event::ClaimFees { pool_id });
    Ok(fees)
}

pub fn record_payout_created(
    state: &mut State,
    pool_id: PoolId,
    receiver: Principal,
    token: PayoutToken,
    amount: u64,
) -> u64 {
    let payout_id = state.add_pending_payout(pool_id, receiver, token, amount);
    let payout = state.pending_payouts[&payout_id];
    record_event(&Event::PayoutCreated { payout });
    payout_id
}

pub fn record_payout_completed(state: &mut State, payout_id: u64, block_index: u64) {
    record_event(&Event::PayoutCompleted {
        payout_id,
        block_index,
    });
    state.complete_payout(payout_id);
}

/// Rebuilds the state from the event log.
pub fn replay(mut events: impl Iterator<Item = Event>) -> Result<State, ReplayLogError> {
    let mut state = match events.next() {
        Some(Event::Init(args)) => State::from(args),
        Some(evt) => {
            return Err(ReplayLogError::InconsistentLog(format!(
                "The first event is not Init: {:?}",
                evt
            )))
        }
        None => return Err(ReplayLogError::EmptyLog),
    };
    for event in events {
        let outcome: Result<(), ProtocolError> = match event {
            Event::Init(_) => {
                return Err(ReplayLogError::InconsistentLog(
                    "Init event found past the start of the log".to_string(),
                ))
            }
            Event::Upgrade(args) => {
                state.upgrade(args);
                Ok(())
            }
            Event::RegisterPool {
                config,
                collateral_ledger,
                collateral_symbol,
                collateral_decimals,
                ledger_fee,
                rate_source,
                timestamp,
            } => {
                state.register_pool(
                    config,
                    collateral_ledger,
                    collateral_symbol,
                    collateral_decimals,
                    ledger_fee,
                    rate_source,
                    timestamp,
                );
                Ok(())
            }
            Event::SetPoolStatus { pool_id, status } => {
                state.set_pool_status(pool_id, status);
                Ok(())
            }
            Event::OpenPosition {
                pool_id,
                owner,
                collateral,
                debt,
                price,
                block_index: _,
            } => apply_open_position(&mut state, pool_id, owner, collateral, debt, price)
                .map(|_| ()),
            Event::AdjustPosition {
                pool_id,
                position_id,
                caller,
                delta_collateral,
                delta_debt,
                price,
                block_index: _,
            } => apply_adjust_position(
                &mut state,
                pool_id,
                caller,
                position_id,
                delta_collateral,
                delta_debt,
                price,
            )
            .map(|_| ()),
            Event::ClosePosition {
                pool_id,
                position_id,
                caller,
                block_index: _,
            } => apply_close_position(&mut state, pool_id, caller, position_id).map(|_| ()),
            Event::RebalancePosition {
                pool_id,
                position_id,
                max_debt,
                price,
                caller: _,
            } => apply_rebalance_position(&mut state, pool_id, position_id, max_debt, price)
                .map(|_| ()),
            Event::RebalanceTick {
                pool_id,
                tick,
                max_debt,
                price,
                caller: _,
            } => apply_rebalance_tick(&mut state, pool_id, tick, max_debt, price).map(|_| ()),
            Event::Liquidate {
                pool_id,
                position_id,
                max_debt,
                price,
                liquidator: _,
            } => apply_liquidate(&mut state, pool_id, position_id, max_debt, price).map(|_| ()),
            Event::Redeem {
                pool_id,
                amount,
                price,
                redeemer: _,
                block_index: _,
            } => apply_redeem(&mut state, pool_id, amount, price).map(|_| ()),
            Event::ChargeFunding { pool_id, timestamp } => {
                if let Ok(record) = state.pool_mut(pool_id) {
                    record.engine.charge_funding(timestamp);
                }
                Ok(())
            }
            Event::FundReserve {
                pool_id,
                amount,
                caller: _,
                block_index: _,
            } => {
                state.fund_reserve(pool_id, amount);
                Ok(())
            }
            Event::ClaimFees { pool_id } => {
                if let Ok(record) = state.pool_mut(pool_id) {
                    let _ = record.engine.take_fees();
                }
                Ok(())
            }
            Event::PayoutCreated { payout } => {
                state.pending_payouts.insert(payout.payout_id, payout);
                state.next_payout_id = state.next_payout_id.max(payout.payout_id + 1);
                Ok(())
            }
            Event::PayoutCompleted {
                payout_id,
                block_index: _,
            } => {
                state.complete_payout(payout_id);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            return Err(ReplayLogError::InconsistentLog(format!(
                "failed to replay a recorded operation: {:?}",
                e
            )));
        }
    }
    Ok(state)
}
