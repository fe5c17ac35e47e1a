//! The Funding Pool engine: one collateral token, one ledger of indexes, one
//! tick tree, one position registry.
//!
//! Every public method is a synchronous, atomic state transition: it either
//! validates fully and commits, or rejects without touching anything. Token
//! movement is the caller's (the Pool Manager's) concern; the engine only
//! accounts for it.

use crate::ledger::IndexLedger;
use crate::numeric::{debt_ratio, Collateral, PriceTriple, Ratio, KUSD};
use crate::position::{Position, PositionView};
use crate::tick::{discretize, Tick, TickTree, MAX_TICK, SENTINEL_TICK};
use crate::ProtocolError;
use candid::{CandidType, Principal};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SECONDS_PER_YEAR: u64 = 31_536_000;

/// Residual raw e8s dust below which a share balance is treated as zero.
pub const DUST_EPSILON: Decimal = dec!(0.01);

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolStatus {
    /// All operations permitted.
    Active,
    /// Only risk-reducing operations: repay, add collateral, close,
    /// rebalance, liquidate, redeem.
    Paused,
    /// Nothing moves.
    Frozen,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Debt-ratio band a position must land in after open/adjust.
    pub min_ratio: Ratio,
    pub max_ratio: Ratio,
    /// Rebalance trigger and target; positions above it can be brought back
    /// down by anyone.
    pub rebalance_ratio: Ratio,
    pub rebalance_bonus: Ratio,
    /// Liquidation trigger, strictly above the rebalance threshold.
    pub liquidation_ratio: Ratio,
    pub liquidation_bonus: Ratio,
    pub redemption_fee: Ratio,
    /// Largest share of a bucket's debt one redemption pass may take.
    pub max_redeem_ratio_per_tick: Ratio,
    pub open_fee_ratio: Ratio,
    /// Slope of the open fee in pool debt utilization.
    pub open_fee_step: Ratio,
    pub min_collateral: Collateral,
    pub min_debt: KUSD,
    pub collateral_capacity: Collateral,
    pub debt_capacity: KUSD,
    /// Annualized funding rate charged on outstanding debt.
    pub funding_apr: Ratio,
    /// Share of accrued funding skimmed into protocol fees.
    pub funding_fee_cut: Ratio,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.min_ratio.0 >= Decimal::ZERO && self.min_ratio.0 < self.max_ratio.0) {
            return Err("min_ratio must be below max_ratio".to_string());
        }
        if self.max_ratio.0 >= Decimal::ONE {
            return Err("max_ratio must be below one".to_string());
        }
        if self.rebalance_ratio.0 >= self.liquidation_ratio.0 {
            return Err("rebalance_ratio must be below liquidation_ratio".to_string());
        }
        let denom = Decimal::ONE - self.rebalance_ratio.0 * (Decimal::ONE + self.rebalance_bonus.0);
        if denom <= Decimal::ZERO {
            return Err("rebalance target incompatible with bonus".to_string());
        }
        if self.max_redeem_ratio_per_tick.0 <= Decimal::ZERO
            || self.max_redeem_ratio_per_tick.0 > Decimal::ONE
        {
            return Err("max_redeem_ratio_per_tick must be in (0, 1]".to_string());
        }
        if self.debt_capacity == 0 || self.collateral_capacity == 0 {
            return Err("capacities must be nonzero".to_string());
        }
        Ok(())
    }
}

/// Collateral set aside to top up liquidation bonuses when the liquidated
/// position cannot cover them. Raw e8s units.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservePool {
    balance: Decimal,
}

impl ReservePool {
    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn deposit(&mut self, amount: Collateral) {
        self.balance += amount.to_decimal();
    }

    /// Grants up to `up_to` raw collateral, bounded by the reserve balance.
    pub fn request_bonus(&mut self, up_to: Decimal) -> Decimal {
        debug_assert!(up_to >= Decimal::ZERO);
        let granted = up_to.min(self.balance);
        self.balance -= granted;
        granted
    }
}

#[derive(CandidType, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenReceipt {
    pub position_id: u64,
    pub debt_minted: KUSD,
    pub fee: KUSD,
}

#[derive(CandidType, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustReceipt {
    pub collateral_in: Collateral,
    pub collateral_out: Collateral,
    pub debt_minted: KUSD,
    pub debt_repaid: KUSD,
    pub fee: KUSD,
}

#[derive(CandidType, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReceipt {
    pub collateral_out: Collateral,
    pub debt_repaid: KUSD,
}

#[derive(CandidType, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceReceipt {
    pub debt_repaid: KUSD,
    pub collateral_received: Collateral,
}

#[derive(CandidType, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationReceipt {
    pub debt_repaid: KUSD,
    pub collateral_received: Collateral,
    pub bonus_from_reserve: Collateral,
    pub bad_debt_socialized: KUSD,
    pub position_closed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FundingPool {
    pub config: PoolConfig,
    pub status: PoolStatus,
    ledger: IndexLedger,
    tree: TickTree,
    positions: BTreeMap<u64, Position>,
    next_position_id: u64,
    /// Accrued protocol fees, raw e8s.
    fees_kusd: Decimal,
    fees_collateral: Decimal,
    /// Bad debt left with nobody to socialize it onto (pool emptied out by
    /// the same liquidation). Settled against the next funding accrual base.
    orphaned_debt: Decimal,
    last_funding_ts: u64,
}

impl FundingPool {
    pub fn new(config: PoolConfig, now_ts: u64) -> Self {
        Self {
            config,
            status: PoolStatus::Active,
            ledger: IndexLedger::default(),
            tree: TickTree::new(),
            positions: BTreeMap::new(),
            next_position_id: 0,
            fees_kusd: Decimal::ZERO,
            fees_collateral: Decimal::ZERO,
            orphaned_debt: Decimal::ZERO,
            last_funding_ts: now_ts,
        }
    }

    pub fn ledger(&self) -> &IndexLedger {
        &self.ledger
    }

    pub fn tree(&self) -> &TickTree {
        &self.tree
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn total_collateral_raw(&self) -> Decimal {
        self.ledger.collateral_raw(self.tree.totals().0)
    }

    pub fn total_debt_raw(&self) -> Decimal {
        self.ledger.debt_raw(self.tree.totals().1)
    }

    pub fn fees_kusd(&self) -> KUSD {
        KUSD::from_decimal_floor(self.fees_kusd)
    }

    pub fn fees_collateral(&self) -> Collateral {
        Collateral::from_decimal_floor(self.fees_collateral)
    }

    /// Withdraws accrued fees, returning the floored amounts; dust stays
    /// behind.
    pub fn take_fees(&mut self) -> (KUSD, Collateral) {
        let kusd = KUSD::from_decimal_floor(self.fees_kusd);
        let coll = Collateral::from_decimal_floor(self.fees_collateral);
        self.fees_kusd -= kusd.to_decimal();
        self.fees_collateral -= coll.to_decimal();
        (kusd, coll)
    }

    pub fn top_tick(&self) -> Tick {
        self.tree.top_tick()
    }

    // ---- lifecycle ----

    pub fn open_position(
        &mut self,
        owner: Principal,
        collateral: Collateral,
        debt: KUSD,
        price: PriceTriple,
    ) -> Result<OpenReceipt, ProtocolError> {
        self.require_status(PoolStatus::Active)?;
        if collateral == 0 && debt == 0 {
            return Err(ProtocolError::AmountTooLow);
        }
        if collateral > 0 && collateral < self.config.min_collateral {
            return Err(ProtocolError::AmountTooLow);
        }
        if debt > 0 && debt < self.config.min_debt {
            return Err(ProtocolError::AmountTooLow);
        }
        if debt > 0 && collateral == 0 {
            return Err(ProtocolError::DebtRatioTooLarge);
        }
        let fee = self.open_fee(debt.to_decimal());
        let debt_total = debt.to_decimal() + fee;
        let coll_raw = collateral.to_decimal();
        if debt > 0 {
            self.check_ratio_band(debt_total, coll_raw, price)?;
        }
        self.check_capacity(coll_raw, debt_total)?;

        let position_id = self.next_position_id;
        self.next_position_id += 1;
        self.positions.insert(
            position_id,
            Position {
                position_id,
                owner,
                collateral_shares: self.ledger.collateral_shares(coll_raw),
                debt_shares: self.ledger.debt_shares(debt_total),
                node_id: None,
            },
        );
        self.fees_kusd += fee;
        self.attach(position_id, price);
        Ok(OpenReceipt {
            position_id,
            debt_minted: debt,
            fee: KUSD::from_decimal_ceil(fee),
        })
    }

    /// Applies signed raw-amount deltas to an open position. All-or-nothing:
    /// the resulting position must satisfy the dust thresholds and the
    /// debt-ratio band. Full closes go through [Self::close_position].
    pub fn adjust_position(
        &mut self,
        caller: Principal,
        position_id: u64,
        delta_collateral: i64,
        delta_debt: i64,
        price: PriceTriple,
    ) -> Result<AdjustReceipt, ProtocolError> {
        if self.status == PoolStatus::Frozen {
            return Err(ProtocolError::TemporarilyUnavailable(
                "pool is frozen".to_string(),
            ));
        }
        let risk_reducing = delta_collateral >= 0 && delta_debt <= 0;
        if self.status == PoolStatus::Paused && !risk_reducing {
            return Err(ProtocolError::TemporarilyUnavailable(
                "pool is paused".to_string(),
            ));
        }
        if delta_collateral == 0 && delta_debt == 0 {
            return Err(ProtocolError::AmountTooLow);
        }
        self.refresh_position(position_id)?;
        let pos = &self.positions[&position_id];
        if pos.owner != caller {
            return Err(ProtocolError::CallerNotOwner);
        }
        let cur_coll = self.ledger.collateral_raw(pos.collateral_shares);
        let cur_debt = self.ledger.debt_raw(pos.debt_shares);

        let new_coll = cur_coll + Decimal::from(delta_collateral);
        let fee = if delta_debt > 0 {
            self.open_fee(Decimal::from(delta_debt))
        } else {
            Decimal::ZERO
        };
        let new_debt = cur_debt + Decimal::from(delta_debt) + fee;
        if new_coll < Decimal::ZERO || new_debt < Decimal::ZERO {
            return Err(ProtocolError::AmountTooLow);
        }
        if new_coll > Decimal::ZERO && new_coll < self.config.min_collateral.to_decimal() {
            return Err(ProtocolError::AmountTooLow);
        }
        if new_debt > DUST_EPSILON && new_debt < self.config.min_debt.to_decimal() {
            return Err(ProtocolError::AmountTooLow);
        }
        if new_debt > DUST_EPSILON {
            self.check_ratio_band(new_debt, new_coll, price)?;
        }
        if delta_collateral > 0 || delta_debt > 0 {
            self.check_capacity(
                Decimal::from(delta_collateral.max(0)),
                Decimal::from(delta_debt.max(0)) + fee,
            )?;
        }

        self.detach(position_id);
        let pos = self
            .positions
            .get_mut(&position_id)
            .expect("bug: position vanished mid-adjust");
        pos.collateral_shares = clamp_dust(self.ledger.collateral_shares(new_coll));
        pos.debt_shares = clamp_dust(self.ledger.debt_shares(new_debt));
        self.fees_kusd += fee;
        // An adjust that drains both balances destroys the position like a
        // close would; its id must never come back to life.
        if self.positions[&position_id].is_closed() {
            self.positions.remove(&position_id);
        } else {
            self.attach(position_id, price);
        }

        Ok(AdjustReceipt {
            collateral_in: Collateral::new(delta_collateral.max(0) as u64),
            collateral_out: Collateral::new((-delta_collateral).max(0) as u64),
            debt_minted: KUSD::new(delta_debt.max(0) as u64),
            debt_repaid: KUSD::new((-delta_debt).max(0) as u64),
            fee: KUSD::from_decimal_ceil(fee),
        })
    }

    /// Closes a position outright: the owner repays the full outstanding
    /// debt (rounded up) and receives the full collateral (rounded down).
    /// No ratio check applies.
    pub fn close_position(
        &mut self,
        caller: Principal,
        position_id: u64,
    ) -> Result<CloseReceipt, ProtocolError> {
        if self.status == PoolStatus::Frozen {
            return Err(ProtocolError::TemporarilyUnavailable(
                "pool is frozen".to_string(),
            ));
        }
        self.refresh_position(position_id)?;
        let pos = &self.positions[&position_id];
        if pos.owner != caller {
            return Err(ProtocolError::CallerNotOwner);
        }
        let coll_raw = self.ledger.collateral_raw(pos.collateral_shares);
        let debt_raw = self.ledger.debt_raw(pos.debt_shares);
        self.detach(position_id);
        self.positions.remove(&position_id);
        Ok(CloseReceipt {
            collateral_out: Collateral::from_decimal_floor(coll_raw),
            debt_repaid: KUSD::from_decimal_ceil(debt_raw),
        })
    }

    // ---- corrective operations ----

    /// Brings one position back down to the rebalance target: the caller
    /// repays debt and receives collateral worth `1 + bonus` times the
    /// repayment, priced at the oracle minimum.
    pub fn rebalance_position(
        &mut self,
        position_id: u64,
        max_debt: KUSD,
        price: PriceTriple,
    ) -> Result<RebalanceReceipt, ProtocolError> {
        self.require_not_frozen()?;
        if max_debt == 0 {
            return Err(ProtocolError::AmountTooLow);
        }
        self.refresh_position(position_id)?;
        let pos = &self.positions[&position_id];
        let coll_raw = self.ledger.collateral_raw(pos.collateral_shares);
        let debt_raw = self.ledger.debt_raw(pos.debt_shares);
        let (debt_removed, coll_removed) =
            self.rebalance_amounts(debt_raw, coll_raw, max_debt, price)?;

        self.detach(position_id);
        let ledger = self.ledger;
        let pos = self
            .positions
            .get_mut(&position_id)
            .expect("bug: position vanished mid-rebalance");
        pos.collateral_shares = clamp_dust(ledger.collateral_shares(coll_raw - coll_removed));
        pos.debt_shares = clamp_dust(ledger.debt_shares(debt_raw - debt_removed));
        if self.positions[&position_id].is_closed() {
            self.positions.remove(&position_id);
        } else {
            self.attach(position_id, price);
        }
        Ok(RebalanceReceipt {
            debt_repaid: KUSD::from_decimal_ceil(debt_removed),
            collateral_received: Collateral::from_decimal_floor(coll_removed),
        })
    }

    /// Rebalances a whole bucket proportionally in one settlement pass.
    /// Member positions migrate to the target bucket lazily.
    pub fn rebalance_tick(
        &mut self,
        tick: Tick,
        max_debt: KUSD,
        price: PriceTriple,
    ) -> Result<RebalanceReceipt, ProtocolError> {
        self.require_not_frozen()?;
        if max_debt == 0 {
            return Err(ProtocolError::AmountTooLow);
        }
        let (coll_shares, debt_shares) = self
            .tree
            .bucket(tick)
            .ok_or_else(|| ProtocolError::GenericError {
                error_code: crate::ERROR_CODE_TICK_NOT_OCCUPIED,
                message: format!("tick {} is not occupied", tick),
            })?;
        let coll_raw = self.ledger.collateral_raw(coll_shares);
        let debt_raw = self.ledger.debt_raw(debt_shares);
        let (debt_removed, coll_removed) =
            self.rebalance_amounts(debt_raw, coll_raw, max_debt, price)?;

        let remaining_debt = debt_raw - debt_removed;
        let remaining_coll = coll_raw - coll_removed;
        let debt_scale = remaining_debt.max(Decimal::ZERO) / debt_raw;
        let coll_scale = remaining_coll.max(Decimal::ZERO) / coll_raw;
        if remaining_debt <= DUST_EPSILON && remaining_coll <= DUST_EPSILON {
            self.tree.settle(tick, Decimal::ZERO, Decimal::ZERO, None);
        } else {
            let new_tick = discretize(debt_ratio(remaining_debt, remaining_coll, price.anchor));
            self.tree.settle(tick, coll_scale, debt_scale, Some(new_tick));
        }
        Ok(RebalanceReceipt {
            debt_repaid: KUSD::from_decimal_ceil(debt_removed),
            collateral_received: Collateral::from_decimal_floor(coll_removed),
        })
    }

    /// Forced deleveraging of a position past the liquidation threshold.
    ///
    /// The waterfall for the liquidator's `1 + bonus` collateral claim:
    /// the position's own collateral, then the reserve pool, then a
    /// collateral-index markdown across the remaining positions. Debt left
    /// on a collateral-empty position is socialized through the debt index.
    /// Never rejects for solvency reasons.
    pub fn liquidate(
        &mut self,
        position_id: u64,
        max_debt: KUSD,
        price: PriceTriple,
        reserve: &mut ReservePool,
    ) -> Result<LiquidationReceipt, ProtocolError> {
        self.require_not_frozen()?;
        if max_debt == 0 {
            return Err(ProtocolError::AmountTooLow);
        }
        self.refresh_position(position_id)?;
        let pos = &self.positions[&position_id];
        let coll_raw = self.ledger.collateral_raw(pos.collateral_shares);
        let debt_raw = self.ledger.debt_raw(pos.debt_shares);
        let ratio = debt_ratio(debt_raw, coll_raw, price.min);
        if ratio.0 <= self.config.liquidation_ratio.0 {
            return Err(ProtocolError::RatioNotReached);
        }
        let bonus = self.config.liquidation_bonus.0;
        let p = price.min.0;
        let repay = max_debt.to_decimal().min(debt_raw);
        let needed = repay * (Decimal::ONE + bonus) / p;

        // The position leaves the tree before any index surgery so that
        // socialization and redistribution only touch the others.
        self.detach(position_id);

        if needed <= coll_raw {
            let ledger = self.ledger;
            let pos = self
                .positions
                .get_mut(&position_id)
                .expect("bug: position vanished mid-liquidation");
            pos.collateral_shares = clamp_dust(ledger.collateral_shares(coll_raw - needed));
            pos.debt_shares = clamp_dust(ledger.debt_shares(debt_raw - repay));
            let closed = self.positions[&position_id].is_closed();
            if closed {
                self.positions.remove(&position_id);
            } else {
                self.attach(position_id, price);
            }
            return Ok(LiquidationReceipt {
                debt_repaid: KUSD::from_decimal_ceil(repay),
                collateral_received: Collateral::from_decimal_floor(needed),
                bonus_from_reserve: Collateral::new(0),
                bad_debt_socialized: KUSD::new(0),
                position_closed: closed,
            });
        }

        // Collateral exhausted: reserve pool first, index markdown second.
        let shortfall = needed - coll_raw;
        let granted = reserve.request_bonus(shortfall);
        let mut still_missing = shortfall - granted;
        let mut redistributed = Decimal::ZERO;
        if still_missing > Decimal::ZERO {
            let others_coll = self.ledger.collateral_raw(self.tree.totals().0);
            if others_coll > still_missing {
                self.ledger.redistribute_bonus(others_coll, still_missing);
                redistributed = still_missing;
                still_missing = Decimal::ZERO;
            }
            // Otherwise the bonus tail is simply unpayable; the liquidator
            // absorbs it.
            let _ = still_missing;
        }

        let bad_debt = debt_raw - repay;
        let mut socialized = Decimal::ZERO;
        if bad_debt > DUST_EPSILON {
            let others_debt = self.ledger.debt_raw(self.tree.totals().1);
            if others_debt > Decimal::ZERO {
                self.ledger.socialize_bad_debt(others_debt, bad_debt);
                socialized = bad_debt;
            } else {
                self.orphaned_debt += bad_debt;
            }
        }
        self.positions.remove(&position_id);
        Ok(LiquidationReceipt {
            debt_repaid: KUSD::from_decimal_ceil(repay),
            collateral_received: Collateral::from_decimal_floor(coll_raw + granted + redistributed),
            bonus_from_reserve: Collateral::from_decimal_floor(granted),
            bad_debt_socialized: KUSD::from_decimal_ceil(socialized),
            position_closed: true,
        })
    }

    /// Accrues the funding rate over the time elapsed since the previous
    /// accrual and skims the configured cut into protocol fees. Idempotent
    /// at a fixed timestamp.
    pub fn charge_funding(&mut self, now_ts: u64) -> KUSD {
        if now_ts <= self.last_funding_ts {
            return KUSD::new(0);
        }
        let elapsed = now_ts - self.last_funding_ts;
        self.last_funding_ts = now_ts;
        let total_debt = self.total_debt_raw();
        if total_debt <= Decimal::ZERO || self.config.funding_apr.0 <= Decimal::ZERO {
            return KUSD::new(0);
        }
        let factor = Decimal::ONE
            + self.config.funding_apr.0 * Decimal::from(elapsed)
                / Decimal::from(SECONDS_PER_YEAR);
        self.ledger.accrue_debt(factor);
        let mut accrued = total_debt * (factor - Decimal::ONE);
        // Orphaned bad debt is worked off against fresh accrual before any
        // fee is taken.
        if self.orphaned_debt > Decimal::ZERO {
            let offset = self.orphaned_debt.min(accrued);
            self.orphaned_debt -= offset;
            accrued -= offset;
        }
        let fee = accrued * self.config.funding_fee_cut.0;
        self.fees_kusd += fee;
        KUSD::from_decimal_floor(fee)
    }

    // ---- queries ----

    pub fn get_position(
        &self,
        position_id: u64,
        price: PriceTriple,
    ) -> Result<PositionView, ProtocolError> {
        let pos = self
            .positions
            .get(&position_id)
            .ok_or(ProtocolError::PositionNotFound)?;
        let (coll_shares, debt_shares, node) = match pos.node_id {
            Some(node) => self.tree.resolve(node, pos.collateral_shares, pos.debt_shares),
            None => (pos.collateral_shares, pos.debt_shares, None),
        };
        let coll_raw = self.ledger.collateral_raw(coll_shares);
        let debt_raw = self.ledger.debt_raw(debt_shares);
        let ratio = debt_ratio(debt_raw, coll_raw, price.anchor);
        Ok(PositionView {
            position_id: pos.position_id,
            owner: pos.owner,
            collateral: Collateral::from_decimal_floor(coll_raw),
            debt: KUSD::from_decimal_ceil(debt_raw),
            debt_ratio: ratio,
            tick: node.map(|n| self.tree.node_tick(n)).unwrap_or(SENTINEL_TICK),
        })
    }

    /// Current raw balances of a position, without needing a price: the
    /// collateral floored, the debt rounded up.
    pub fn position_balances(
        &self,
        position_id: u64,
    ) -> Result<(Collateral, KUSD), ProtocolError> {
        let pos = self
            .positions
            .get(&position_id)
            .ok_or(ProtocolError::PositionNotFound)?;
        let (coll_shares, debt_shares, _) = match pos.node_id {
            Some(node) => self.tree.resolve(node, pos.collateral_shares, pos.debt_shares),
            None => (pos.collateral_shares, pos.debt_shares, None),
        };
        Ok((
            Collateral::from_decimal_floor(self.ledger.collateral_raw(coll_shares)),
            KUSD::from_decimal_ceil(self.ledger.debt_raw(debt_shares)),
        ))
    }

    pub fn positions_of(&self, owner: Principal, price: PriceTriple) -> Vec<PositionView> {
        self.positions
            .values()
            .filter(|p| p.owner == owner)
            .filter_map(|p| self.get_position(p.position_id, price).ok())
            .collect()
    }

    /// Cross-checks the tree aggregates against the position registry.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut coll_sum = Decimal::ZERO;
        let mut debt_sum = Decimal::ZERO;
        for pos in self.positions.values() {
            let (c, d, node) = match pos.node_id {
                Some(node) => self.tree.resolve(node, pos.collateral_shares, pos.debt_shares),
                None => (pos.collateral_shares, pos.debt_shares, None),
            };
            if d > DUST_EPSILON && c <= DUST_EPSILON && node.is_some() {
                let tick = self.tree.node_tick(node.expect("bug: checked above"));
                if tick != MAX_TICK {
                    return Err(format!(
                        "position {} has debt without collateral outside the top bucket",
                        pos.position_id
                    ));
                }
            }
            coll_sum += c;
            debt_sum += d;
        }
        let (tree_coll, tree_debt) = self.tree.totals();
        if (coll_sum - tree_coll).abs() > DUST_EPSILON {
            return Err(format!(
                "collateral shares out of balance: positions {} vs tree {}",
                coll_sum, tree_coll
            ));
        }
        if (debt_sum - tree_debt).abs() > DUST_EPSILON {
            return Err(format!(
                "debt shares out of balance: positions {} vs tree {}",
                debt_sum, tree_debt
            ));
        }
        Ok(())
    }

    // ---- internals ----

    fn require_status(&self, wanted: PoolStatus) -> Result<(), ProtocolError> {
        if self.status == wanted {
            Ok(())
        } else {
            Err(ProtocolError::TemporarilyUnavailable(format!(
                "pool status is {:?}",
                self.status
            )))
        }
    }

    pub(crate) fn require_not_frozen(&self) -> Result<(), ProtocolError> {
        if self.status == PoolStatus::Frozen {
            Err(ProtocolError::TemporarilyUnavailable(
                "pool is frozen".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    pub(crate) fn settle_bucket(
        &mut self,
        tick: Tick,
        coll_scale: Decimal,
        debt_scale: Decimal,
        new_tick: Option<Tick>,
    ) {
        self.tree.settle(tick, coll_scale, debt_scale, new_tick);
    }

    pub(crate) fn add_collateral_fee(&mut self, fee: Decimal) {
        debug_assert!(fee >= Decimal::ZERO);
        self.fees_collateral += fee;
    }

    fn open_fee(&self, debt_raw: Decimal) -> Decimal {
        if debt_raw <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let utilization = debt_raw / self.config.debt_capacity.to_decimal();
        debt_raw * (self.config.open_fee_ratio.0 + self.config.open_fee_step.0 * utilization)
    }

    fn check_ratio_band(
        &self,
        debt_raw: Decimal,
        coll_raw: Decimal,
        price: PriceTriple,
    ) -> Result<(), ProtocolError> {
        let ratio = debt_ratio(debt_raw, coll_raw, price.anchor);
        if ratio.0 < self.config.min_ratio.0 {
            return Err(ProtocolError::DebtRatioTooSmall);
        }
        if ratio.0 > self.config.max_ratio.0 {
            return Err(ProtocolError::DebtRatioTooLarge);
        }
        Ok(())
    }

    fn check_capacity(
        &self,
        added_coll_raw: Decimal,
        added_debt_raw: Decimal,
    ) -> Result<(), ProtocolError> {
        if self.total_collateral_raw() + added_coll_raw
            > self.config.collateral_capacity.to_decimal()
            || self.total_debt_raw() + added_debt_raw > self.config.debt_capacity.to_decimal()
        {
            return Err(ProtocolError::CapacityExceeded);
        }
        Ok(())
    }

    /// Shared rebalance math for the position and tick forms. Prices at the
    /// oracle minimum; rejects targets already at or below the threshold.
    fn rebalance_amounts(
        &self,
        debt_raw: Decimal,
        coll_raw: Decimal,
        max_debt: KUSD,
        price: PriceTriple,
    ) -> Result<(Decimal, Decimal), ProtocolError> {
        let ratio = debt_ratio(debt_raw, coll_raw, price.min);
        if ratio.0 <= self.config.rebalance_ratio.0 {
            return Err(ProtocolError::RatioNotReached);
        }
        let target = self.config.rebalance_ratio.0;
        let bonus = self.config.rebalance_bonus.0;
        let p = price.min.0;
        // Once the collateral is worth less than the debt plus bonus,
        // repaying at `1 + bonus` per unit raises the ratio instead of
        // lowering it; only liquidation can unwind such a target.
        if debt_raw * (Decimal::ONE + bonus) >= p * coll_raw {
            return Err(ProtocolError::GenericError {
                error_code: crate::ERROR_CODE_NEEDS_LIQUIDATION,
                message: "collateral cannot cover the rebalance bonus".to_string(),
            });
        }
        let denom = Decimal::ONE - target * (Decimal::ONE + bonus);
        let full = (debt_raw - target * p * coll_raw) / denom;
        // `full < debt_raw` and `full * (1 + bonus) < p * coll_raw` both
        // follow from the guard above, so neither balance can be drained.
        let debt_removed = full.min(max_debt.to_decimal());
        let coll_removed = debt_removed * (Decimal::ONE + bonus) / p;
        Ok((debt_removed, coll_removed))
    }

    /// Folds any settlement chain into the position record. Every mutating
    /// path calls this first.
    fn refresh_position(&mut self, position_id: u64) -> Result<(), ProtocolError> {
        let pos = self
            .positions
            .get(&position_id)
            .ok_or(ProtocolError::PositionNotFound)?;
        if let Some(node) = pos.node_id {
            if !self.tree.is_live(node) {
                let (c, d, live) =
                    self.tree.resolve(node, pos.collateral_shares, pos.debt_shares);
                let pos = self
                    .positions
                    .get_mut(&position_id)
                    .expect("bug: position vanished mid-refresh");
                pos.collateral_shares = c;
                pos.debt_shares = d;
                pos.node_id = live;
            }
        }
        Ok(())
    }

    /// Removes the position's contribution from its live bucket. The caller
    /// must have refreshed the position first.
    fn detach(&mut self, position_id: u64) {
        let (node, coll, debt) = {
            let pos = &self.positions[&position_id];
            (pos.node_id, pos.collateral_shares, pos.debt_shares)
        };
        if let Some(node) = node {
            self.tree.remove_contribution(node, coll, debt);
            self.positions
                .get_mut(&position_id)
                .expect("bug: position vanished mid-detach")
                .node_id = None;
        }
    }

    /// Inserts the position's shares at the bucket for its current debt
    /// ratio, priced at the oracle anchor.
    fn attach(&mut self, position_id: u64, price: PriceTriple) {
        let (coll, debt) = {
            let pos = &self.positions[&position_id];
            (pos.collateral_shares, pos.debt_shares)
        };
        if coll == Decimal::ZERO && debt == Decimal::ZERO {
            return;
        }
        let coll_raw = self.ledger.collateral_raw(coll);
        let debt_raw = self.ledger.debt_raw(debt);
        let tick = discretize(debt_ratio(debt_raw, coll_raw, price.anchor));
        let node = self.tree.add_contribution(tick, coll, debt);
        self.positions
            .get_mut(&position_id)
            .expect("bug: position vanished mid-attach")
            .node_id = Some(node);
    }
}

/// Share dust left by Decimal division collapses to zero so that "closed"
/// stays an exact predicate.
fn clamp_dust(shares: Decimal) -> Decimal {
    if shares.abs() <= dec!(0.000001) {
        Decimal::ZERO
    } else {
        assert!(shares > Decimal::ZERO, "bug: share balance went negative");
        shares
    }
}
