//! Index Ledger: the two global scale factors that convert between a
//! position's immutable shares and its current raw amounts.
//!
//! `raw = shares * index`. Bumping `debt_index` retroactively grows every
//! position's raw debt (funding accrual, bad-debt socialization); shrinking
//! `collateral_index` retroactively reduces every position's raw collateral
//! (bonus-shortfall redistribution). Neither bump touches a single position
//! record, which is what keeps socialization O(1) instead of O(positions).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexLedger {
    debt_index: Decimal,
    collateral_index: Decimal,
}

impl Default for IndexLedger {
    fn default() -> Self {
        Self {
            debt_index: Decimal::ONE,
            collateral_index: Decimal::ONE,
        }
    }
}

impl IndexLedger {
    pub fn debt_index(&self) -> Decimal {
        self.debt_index
    }

    pub fn collateral_index(&self) -> Decimal {
        self.collateral_index
    }

    pub fn debt_raw(&self, shares: Decimal) -> Decimal {
        shares
            .checked_mul(self.debt_index)
            .expect("bug: debt index multiplication overflow")
    }

    pub fn debt_shares(&self, raw: Decimal) -> Decimal {
        raw / self.debt_index
    }

    pub fn collateral_raw(&self, shares: Decimal) -> Decimal {
        shares
            .checked_mul(self.collateral_index)
            .expect("bug: collateral index multiplication overflow")
    }

    pub fn collateral_shares(&self, raw: Decimal) -> Decimal {
        raw / self.collateral_index
    }

    /// Funding accrual: multiplies the debt index by `factor >= 1`.
    pub fn accrue_debt(&mut self, factor: Decimal) {
        assert!(factor >= Decimal::ONE, "bug: funding factor below one");
        self.debt_index = self
            .debt_index
            .checked_mul(factor)
            .expect("bug: debt index overflow");
    }

    /// Socializes `bad_debt` across all positions currently holding
    /// `total_debt_raw` of debt. After the bump the sum of raw debts has
    /// grown by exactly `bad_debt` (within Decimal precision).
    pub fn socialize_bad_debt(&mut self, total_debt_raw: Decimal, bad_debt: Decimal) {
        assert!(bad_debt >= Decimal::ZERO);
        if bad_debt == Decimal::ZERO {
            return;
        }
        assert!(
            total_debt_raw > Decimal::ZERO,
            "bug: socializing bad debt into an empty pool"
        );
        let factor = (total_debt_raw + bad_debt) / total_debt_raw;
        self.accrue_debt(factor);
    }

    /// Redistributes a liquidation-bonus shortfall: shrinks the collateral
    /// index so that the sum of raw collaterals over `total_coll_raw` drops
    /// by exactly `shortfall`.
    pub fn redistribute_bonus(&mut self, total_coll_raw: Decimal, shortfall: Decimal) {
        assert!(shortfall >= Decimal::ZERO);
        if shortfall == Decimal::ZERO {
            return;
        }
        assert!(
            total_coll_raw > shortfall,
            "bug: bonus shortfall exceeds pool collateral"
        );
        let factor = (total_coll_raw - shortfall) / total_coll_raw;
        self.collateral_index = self
            .collateral_index
            .checked_mul(factor)
            .expect("bug: collateral index overflow");
        assert!(self.collateral_index > Decimal::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn indexes_start_at_unity() {
        let ledger = IndexLedger::default();
        assert_eq!(ledger.debt_raw(dec!(100)), dec!(100));
        assert_eq!(ledger.collateral_raw(dec!(100)), dec!(100));
    }

    #[test]
    fn socialization_grows_total_debt_by_the_shortfall() {
        let mut ledger = IndexLedger::default();
        let shares = dec!(24_420);
        ledger.socialize_bad_debt(ledger.debt_raw(shares), dec!(1_000));
        let grown = ledger.debt_raw(shares);
        assert!((grown - dec!(25_420)).abs() < dec!(0.000001));
    }

    #[test]
    fn redistribution_shrinks_total_collateral_by_the_shortfall() {
        let mut ledger = IndexLedger::default();
        let shares = dec!(13.653);
        ledger.redistribute_bonus(ledger.collateral_raw(shares), dec!(1.0));
        let shrunk = ledger.collateral_raw(shares);
        assert!((shrunk - dec!(12.653)).abs() < dec!(0.000001));
    }

    #[test]
    #[should_panic(expected = "funding factor below one")]
    fn debt_index_never_decreases() {
        let mut ledger = IndexLedger::default();
        ledger.accrue_debt(dec!(0.99));
    }
}
