//! Redemption: burning kUSD against the riskiest buckets, top tick first.
//!
//! Each pass visits the current top tick and redeems at most the per-tick
//! cap of the bucket's debt, never pushing the bucket below the minimum
//! debt ratio. Collateral leaves the bucket at full oracle-max value; the
//! redeemer receives it minus the redemption fee, which accrues to protocol
//! fees. The settled bucket cascades to a lower tick and the walk repeats
//! until the request or the tree is exhausted.

use crate::numeric::{debt_ratio, Collateral, PriceTriple, KUSD};
use crate::pool::{FundingPool, DUST_EPSILON};
use crate::tick::{discretize, SENTINEL_TICK};
use crate::ProtocolError;
use candid::CandidType;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Hard bound on settlement passes per call; each pass is O(log ticks) and
/// strictly reduces either the remaining request or the top tick.
const MAX_PASSES: u32 = 200;

#[derive(CandidType, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionReceipt {
    pub kusd_used: KUSD,
    pub collateral_received: Collateral,
    pub fee_paid: Collateral,
    pub ticks_visited: u32,
}

impl FundingPool {
    /// Redeems up to `amount` of kUSD debt against the pool. With `exact`
    /// set, a walk that stops short rejects and leaves the pool untouched.
    ///
    /// A walk is bounded to `MAX_PASSES` bucket settlements, so a non-exact
    /// call can return a partial fill even while redeemable buckets remain;
    /// the caller redeems the rest with a follow-up call.
    pub fn redeem(
        &mut self,
        amount: KUSD,
        exact: bool,
        price: PriceTriple,
    ) -> Result<RedemptionReceipt, ProtocolError> {
        if amount == 0 {
            return Err(ProtocolError::AmountTooLow);
        }
        let mut staged = self.clone();
        let receipt = staged.redeem_in_place(amount, price)?;
        if exact && receipt.kusd_used < amount {
            return Err(ProtocolError::RedemptionShortfall {
                redeemable: receipt.kusd_used,
            });
        }
        *self = staged;
        Ok(receipt)
    }

    fn redeem_in_place(
        &mut self,
        amount: KUSD,
        price: PriceTriple,
    ) -> Result<RedemptionReceipt, ProtocolError> {
        self.require_not_frozen()?;
        let p = price.max.0;
        let r_min = self.config.min_ratio.0;
        let fee_ratio = self.config.redemption_fee.0;
        let tick_cap = self.config.max_redeem_ratio_per_tick.0;

        let mut remaining = amount.to_decimal();
        let mut coll_out = Decimal::ZERO;
        let mut fee_coll = Decimal::ZERO;
        let mut passes = 0u32;

        while remaining > DUST_EPSILON && passes < MAX_PASSES {
            let tick = self.top_tick();
            if tick == SENTINEL_TICK {
                break;
            }
            let (coll_shares, debt_shares) = self
                .tree()
                .bucket(tick)
                .expect("bug: top tick has no bucket");
            let bucket_coll = self.ledger().collateral_raw(coll_shares);
            let bucket_debt = self.ledger().debt_raw(debt_shares);

            // Floor: redeeming `a` moves the bucket ratio to
            // (D - a) / (p*C - a); the cap keeps it at or above min_ratio.
            let ratio = debt_ratio(bucket_debt, bucket_coll, price.max);
            if ratio.0 <= r_min {
                break;
            }
            let floor_cap = (bucket_debt - r_min * p * bucket_coll) / (Decimal::ONE - r_min);
            let a = remaining
                .min(tick_cap * bucket_debt)
                .min(floor_cap)
                .min(bucket_debt);
            if a <= DUST_EPSILON {
                break;
            }
            let coll_leaving = a / p;
            let fee = coll_leaving * fee_ratio;

            let remaining_debt = bucket_debt - a;
            let remaining_coll = bucket_coll - coll_leaving;
            if remaining_debt <= DUST_EPSILON && remaining_coll <= DUST_EPSILON {
                self.settle_bucket(tick, Decimal::ZERO, Decimal::ZERO, None);
            } else {
                let debt_scale = remaining_debt.max(Decimal::ZERO) / bucket_debt;
                let coll_scale = remaining_coll.max(Decimal::ZERO) / bucket_coll;
                let new_tick =
                    discretize(debt_ratio(remaining_debt, remaining_coll, price.anchor));
                self.settle_bucket(tick, coll_scale, debt_scale, Some(new_tick));
            }
            self.add_collateral_fee(fee);
            remaining -= a;
            coll_out += coll_leaving - fee;
            fee_coll += fee;
            passes += 1;
        }

        Ok(RedemptionReceipt {
            kusd_used: KUSD::from_decimal_ceil(amount.to_decimal() - remaining),
            collateral_received: Collateral::from_decimal_floor(coll_out),
            fee_paid: Collateral::from_decimal_floor(fee_coll),
            ticks_visited: passes,
        })
    }
}
