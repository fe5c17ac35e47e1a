//! Pool Manager orchestration: the async endpoint logic that moves tokens,
//! then drives the pure engine, then pays out.
//!
//! The ordering discipline mirrors the accounting rule "take before you
//! credit": inbound transfers (collateral deposits, kUSD burns) happen
//! before the engine mutation; outbound transfers (collateral payouts, kUSD
//! mints) happen after it and fall back to the pending-payout queue when a
//! ledger call fails, to be retried by the timer.

use crate::event::{
    record_adjust_position, record_close_position, record_fund_reserve, record_liquidate,
    record_open_position, record_payout_completed, record_payout_created, record_rebalance_position,
    record_rebalance_tick, record_redeem,
};
use crate::guard::{GuardPrincipal, TimerLogicGuard};
use crate::logs::{DEBUG, INFO};
use crate::management;
use crate::numeric::{Collateral, KUSD};
use crate::pool::{AdjustReceipt, CloseReceipt, LiquidationReceipt, OpenReceipt, RebalanceReceipt};
use crate::redemption::RedemptionReceipt;
use crate::state::{mutate_state, read_state, PayoutToken, PendingPayout, PoolId};
use crate::tick::Tick;
use crate::ProtocolError;
use candid::{CandidType, Principal};
use ic_canister_log::log;
use serde::Deserialize;

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct OpenPositionArg {
    pub pool_id: PoolId,
    pub collateral_amount: u64,
    pub borrow_amount: u64,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct OpenPositionSuccess {
    pub position_id: u64,
    pub fee_paid: u64,
    pub block_index: Option<u64>,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AdjustPositionArg {
    pub pool_id: PoolId,
    pub position_id: u64,
    pub delta_collateral: i64,
    pub delta_debt: i64,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct PositionArg {
    pub pool_id: PoolId,
    pub position_id: u64,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Deserialize)]
pub enum RebalanceTarget {
    Position(u64),
    Tick(Tick),
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RebalanceArg {
    pub pool_id: PoolId,
    pub target: RebalanceTarget,
    pub max_debt_amount: u64,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LiquidateArg {
    pub pool_id: PoolId,
    pub position_id: u64,
    pub max_debt_amount: u64,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RedeemArg {
    pub pool_id: PoolId,
    pub amount: u64,
    /// Reject instead of filling partially when the walk stops short.
    pub exact: bool,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct FundReserveArg {
    pub pool_id: PoolId,
    pub amount: u64,
}

fn authenticated_caller() -> Result<Principal, ProtocolError> {
    let caller = ic_cdk::caller();
    if caller == Principal::anonymous() {
        return Err(ProtocolError::AnonymousCallerNotAllowed);
    }
    Ok(caller)
}

pub async fn open_position(arg: OpenPositionArg) -> Result<OpenPositionSuccess, ProtocolError> {
    let caller = authenticated_caller()?;
    let _guard = GuardPrincipal::new(caller, "open_position")?;
    crate::xrc::ensure_fresh_price(arg.pool_id).await?;

    let collateral = Collateral::new(arg.collateral_amount);
    let debt = KUSD::new(arg.borrow_amount);
    let price = read_state(|s| s.price_for(arg.pool_id))?;

    // Dry-run before taking anyone's tokens.
    read_state(|s| {
        let mut probe = s.pool(arg.pool_id)?.engine.clone();
        probe.open_position(caller, collateral, debt, price).map(|_| ())
    })?;

    let block_index = if collateral > 0 {
        let ledger = read_state(|s| s.pool(arg.pool_id).map(|r| r.collateral_ledger))?;
        let block_index = management::transfer_collateral_from(ledger, collateral, caller)
            .await
            .map_err(|e| ProtocolError::TransferFromError(e, collateral.to_u64()))?;
        Some(block_index)
    } else {
        None
    };

    let receipt: OpenReceipt = mutate_state(|s| {
        record_open_position(
            s,
            arg.pool_id,
            caller,
            collateral,
            debt,
            price,
            block_index.unwrap_or(0),
        )
    })
    .map_err(|e| {
        // The deposit is already in; give it back through the queue.
        if collateral > 0 {
            mutate_state(|s| {
                record_payout_created(
                    s,
                    arg.pool_id,
                    caller,
                    PayoutToken::Collateral,
                    collateral.to_u64(),
                );
            });
        }
        e
    })?;

    if debt > 0 {
        payout_kusd(arg.pool_id, caller, receipt.debt_minted).await;
    }
    log!(
        INFO,
        "[open_position] {} opened position {} in pool {} with {} collateral, {} debt",
        caller,
        receipt.position_id,
        arg.pool_id,
        collateral,
        debt
    );
    Ok(OpenPositionSuccess {
        position_id: receipt.position_id,
        fee_paid: receipt.fee.to_u64(),
        block_index,
    })
}

pub async fn adjust_position(arg: AdjustPositionArg) -> Result<AdjustReceipt, ProtocolError> {
    let caller = authenticated_caller()?;
    let _guard = GuardPrincipal::new(caller, "adjust_position")?;
    crate::xrc::ensure_fresh_price(arg.pool_id).await?;
    let price = read_state(|s| s.price_for(arg.pool_id))?;

    read_state(|s| {
        let mut probe = s.pool(arg.pool_id)?.engine.clone();
        probe
            .adjust_position(caller, arg.position_id, arg.delta_collateral, arg.delta_debt, price)
            .map(|_| ())
    })?;

    let mut block_index = None;
    if arg.delta_collateral > 0 {
        let amount = Collateral::new(arg.delta_collateral as u64);
        let ledger = read_state(|s| s.pool(arg.pool_id).map(|r| r.collateral_ledger))?;
        block_index = Some(
            management::transfer_collateral_from(ledger, amount, caller)
                .await
                .map_err(|e| ProtocolError::TransferFromError(e, amount.to_u64()))?,
        );
    }
    if arg.delta_debt < 0 {
        let amount = KUSD::new(arg.delta_debt.unsigned_abs());
        block_index = Some(
            management::burn_kusd_from(amount, caller)
                .await
                .map_err(|e| ProtocolError::TransferFromError(e, amount.to_u64()))?,
        );
    }

    let receipt = mutate_state(|s| {
        record_adjust_position(
            s,
            arg.pool_id,
            caller,
            arg.position_id,
            arg.delta_collateral,
            arg.delta_debt,
            price,
            block_index,
        )
    })
    .map_err(|e| {
        mutate_state(|s| {
            if arg.delta_collateral > 0 {
                record_payout_created(
                    s,
                    arg.pool_id,
                    caller,
                    PayoutToken::Collateral,
                    arg.delta_collateral as u64,
                );
            }
            if arg.delta_debt < 0 {
                record_payout_created(
                    s,
                    arg.pool_id,
                    caller,
                    PayoutToken::Kusd,
                    arg.delta_debt.unsigned_abs(),
                );
            }
        });
        e
    })?;

    if receipt.collateral_out > 0 {
        payout_collateral(arg.pool_id, caller, receipt.collateral_out).await;
    }
    if receipt.debt_minted > 0 {
        payout_kusd(arg.pool_id, caller, receipt.debt_minted).await;
    }
    Ok(receipt)
}

pub async fn close_position(arg: PositionArg) -> Result<CloseReceipt, ProtocolError> {
    let caller = authenticated_caller()?;
    let _guard = GuardPrincipal::new(caller, "close_position")?;

    let (_, debt_due) = read_state(|s| {
        s.pool(arg.pool_id)
            .and_then(|r| r.engine.position_balances(arg.position_id))
    })?;
    let block_index = if debt_due > 0 {
        Some(
            management::burn_kusd_from(debt_due, caller)
                .await
                .map_err(|e| ProtocolError::TransferFromError(e, debt_due.to_u64()))?,
        )
    } else {
        None
    };

    let receipt = mutate_state(|s| {
        record_close_position(s, arg.pool_id, caller, arg.position_id, block_index)
    })
    .map_err(|e| {
        if debt_due > 0 {
            mutate_state(|s| {
                record_payout_created(
                    s,
                    arg.pool_id,
                    caller,
                    PayoutToken::Kusd,
                    debt_due.to_u64(),
                );
            });
        }
        e
    })?;

    if receipt.collateral_out > 0 {
        payout_collateral(arg.pool_id, caller, receipt.collateral_out).await;
    }
    log!(
        INFO,
        "[close_position] {} closed position {} in pool {}",
        caller,
        arg.position_id,
        arg.pool_id
    );
    Ok(receipt)
}

pub async fn rebalance(arg: RebalanceArg) -> Result<RebalanceReceipt, ProtocolError> {
    let caller = authenticated_caller()?;
    let _guard = GuardPrincipal::new(caller, "rebalance")?;
    crate::xrc::ensure_fresh_price(arg.pool_id).await?;
    let price = read_state(|s| s.price_for(arg.pool_id))?;
    let max_debt = KUSD::new(arg.max_debt_amount);

    read_state(|s| {
        let mut probe = s.pool(arg.pool_id)?.engine.clone();
        match arg.target {
            RebalanceTarget::Position(id) => {
                probe.rebalance_position(id, max_debt, price).map(|_| ())
            }
            RebalanceTarget::Tick(tick) => probe.rebalance_tick(tick, max_debt, price).map(|_| ()),
        }
    })?;

    management::burn_kusd_from(max_debt, caller)
        .await
        .map_err(|e| ProtocolError::TransferFromError(e, max_debt.to_u64()))?;

    let result = mutate_state(|s| match arg.target {
        RebalanceTarget::Position(id) => {
            record_rebalance_position(s, arg.pool_id, id, max_debt, price, caller)
        }
        RebalanceTarget::Tick(tick) => {
            record_rebalance_tick(s, arg.pool_id, tick, max_debt, price, caller)
        }
    });
    settle_corrective_payment(arg.pool_id, caller, max_debt, result.map(|r| (r, r.debt_repaid, r.collateral_received))).await
}

pub async fn liquidate(arg: LiquidateArg) -> Result<LiquidationReceipt, ProtocolError> {
    let caller = authenticated_caller()?;
    let _guard = GuardPrincipal::new(caller, "liquidate")?;
    crate::xrc::ensure_fresh_price(arg.pool_id).await?;
    let price = read_state(|s| s.price_for(arg.pool_id))?;
    let max_debt = KUSD::new(arg.max_debt_amount);

    read_state(|s| {
        let record = s.pool(arg.pool_id)?;
        let mut probe = record.engine.clone();
        let mut probe_reserve = record.reserve.clone();
        probe
            .liquidate(arg.position_id, max_debt, price, &mut probe_reserve)
            .map(|_| ())
    })?;

    management::burn_kusd_from(max_debt, caller)
        .await
        .map_err(|e| ProtocolError::TransferFromError(e, max_debt.to_u64()))?;

    let result = mutate_state(|s| {
        record_liquidate(s, arg.pool_id, arg.position_id, max_debt, price, caller)
    });
    settle_corrective_payment(
        arg.pool_id,
        caller,
        max_debt,
        result.map(|r| (r, r.debt_repaid, r.collateral_received)),
    )
    .await
}

pub async fn redeem(arg: RedeemArg) -> Result<RedemptionReceipt, ProtocolError> {
    let caller = authenticated_caller()?;
    let _guard = GuardPrincipal::new(caller, "redeem")?;
    crate::xrc::ensure_fresh_price(arg.pool_id).await?;
    let price = read_state(|s| s.price_for(arg.pool_id))?;
    let amount = KUSD::new(arg.amount);

    read_state(|s| {
        let mut probe = s.pool(arg.pool_id)?.engine.clone();
        probe.redeem(amount, arg.exact, price).map(|_| ())
    })?;

    let block_index = management::burn_kusd_from(amount, caller)
        .await
        .map_err(|e| ProtocolError::TransferFromError(e, amount.to_u64()))?;

    let result = mutate_state(|s| {
        record_redeem(s, arg.pool_id, amount, arg.exact, price, caller, block_index)
    });
    settle_corrective_payment(
        arg.pool_id,
        caller,
        amount,
        result.map(|r| (r, r.kusd_used, r.collateral_received)),
    )
    .await
}

pub async fn fund_reserve(arg: FundReserveArg) -> Result<u64, ProtocolError> {
    let caller = authenticated_caller()?;
    let _guard = GuardPrincipal::new(caller, "fund_reserve")?;
    let amount = Collateral::new(arg.amount);
    if amount == 0 {
        return Err(ProtocolError::AmountTooLow);
    }
    let ledger = read_state(|s| s.pool(arg.pool_id).map(|r| r.collateral_ledger))?;
    let block_index = management::transfer_collateral_from(ledger, amount, caller)
        .await
        .map_err(|e| ProtocolError::TransferFromError(e, amount.to_u64()))?;
    mutate_state(|s| record_fund_reserve(s, arg.pool_id, amount, caller, block_index));
    Ok(block_index)
}

pub async fn claim_fees(pool_id: PoolId) -> Result<(u64, u64), ProtocolError> {
    let caller = authenticated_caller()?;
    let developer = read_state(|s| s.developer_principal);
    if caller != developer {
        return Err(ProtocolError::CallerNotOwner);
    }
    let _guard = GuardPrincipal::new(caller, "claim_fees")?;
    let (kusd, collateral) = mutate_state(|s| crate::event::record_claim_fees(s, pool_id))?;
    if kusd > 0 {
        payout_kusd(pool_id, developer, kusd).await;
    }
    if collateral > 0 {
        payout_collateral(pool_id, developer, collateral).await;
    }
    Ok((kusd.to_u64(), collateral.to_u64()))
}

/// Shared tail of the burn-first corrective flows: refund the unused part of
/// the caller's kUSD payment, then pay the collateral out. On an engine
/// rejection the whole payment comes back.
async fn settle_corrective_payment<R>(
    pool_id: PoolId,
    caller: Principal,
    paid: KUSD,
    result: Result<(R, KUSD, Collateral), ProtocolError>,
) -> Result<R, ProtocolError> {
    match result {
        Ok((receipt, used, collateral)) => {
            if paid > used {
                payout_kusd(pool_id, caller, paid - used).await;
            }
            if collateral > 0 {
                payout_collateral(pool_id, caller, collateral).await;
            }
            Ok(receipt)
        }
        Err(e) => {
            payout_kusd(pool_id, caller, paid).await;
            Err(e)
        }
    }
}

/// Mints kUSD to the receiver, falling back to the pending queue.
async fn payout_kusd(pool_id: PoolId, receiver: Principal, amount: KUSD) {
    match management::mint_kusd(amount, receiver).await {
        Ok(block_index) => {
            log!(
                DEBUG,
                "[payout] minted {} kUSD to {} at block {}",
                amount,
                receiver,
                block_index
            );
        }
        Err(error) => {
            log!(
                INFO,
                "[payout] failed to mint {} kUSD to {}: {:?}, queueing",
                amount,
                receiver,
                error
            );
            mutate_state(|s| {
                record_payout_created(s, pool_id, receiver, PayoutToken::Kusd, amount.to_u64());
            });
        }
    }
}

/// Transfers collateral to the receiver (ledger fee comes out of the
/// amount), falling back to the pending queue.
async fn payout_collateral(pool_id: PoolId, receiver: Principal, amount: Collateral) {
    let (ledger, fee) = match read_state(|s| {
        s.pool(pool_id).map(|r| (r.collateral_ledger, r.ledger_fee))
    }) {
        Ok(v) => v,
        Err(_) => return,
    };
    if amount <= fee {
        log!(
            DEBUG,
            "[payout] dropping dust collateral payout of {} to {}",
            amount,
            receiver
        );
        return;
    }
    match management::transfer_collateral(ledger, amount - fee, receiver).await {
        Ok(block_index) => {
            log!(
                DEBUG,
                "[payout] sent {} collateral to {} at block {}",
                amount,
                receiver,
                block_index
            );
        }
        Err(error) => {
            log!(
                INFO,
                "[payout] failed to send {} collateral to {}: {:?}, queueing",
                amount,
                receiver,
                error
            );
            mutate_state(|s| {
                record_payout_created(
                    s,
                    pool_id,
                    receiver,
                    PayoutToken::Collateral,
                    amount.to_u64(),
                );
            });
        }
    }
}

/// Retries every queued payout once; runs on a timer.
pub async fn process_pending_payouts() {
    let _guard = match TimerLogicGuard::new() {
        Some(guard) => guard,
        None => {
            log!(DEBUG, "[process_pending_payouts] double entry.");
            return;
        }
    };
    let pending: Vec<PendingPayout> =
        read_state(|s| s.pending_payouts.values().copied().collect());
    if pending.is_empty() {
        return;
    }
    log!(
        INFO,
        "[process_pending_payouts] retrying {} payouts",
        pending.len()
    );
    for payout in pending {
        let outcome = match payout.token {
            PayoutToken::Kusd => {
                management::mint_kusd(KUSD::new(payout.amount), payout.receiver).await
            }
            PayoutToken::Collateral => {
                let (ledger, fee) = match read_state(|s| {
                    s.pool(payout.pool_id)
                        .map(|r| (r.collateral_ledger, r.ledger_fee))
                }) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if payout.amount <= fee.to_u64() {
                    mutate_state(|s| record_payout_completed(s, payout.payout_id, 0));
                    continue;
                }
                management::transfer_collateral(
                    ledger,
                    Collateral::new(payout.amount) - fee,
                    payout.receiver,
                )
                .await
            }
        };
        match outcome {
            Ok(block_index) => {
                mutate_state(|s| record_payout_completed(s, payout.payout_id, block_index));
            }
            Err(error) => {
                log!(
                    INFO,
                    "[process_pending_payouts] payout {} still failing: {:?}",
                    payout.payout_id,
                    error
                );
            }
        }
    }
}
