//! Shared fixtures for the engine tests.

use crate::numeric::{Collateral, Price, PriceTriple, Ratio, KUSD};
use crate::pool::{FundingPool, PoolConfig};
use candid::Principal;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub fn default_config() -> PoolConfig {
    PoolConfig {
        min_ratio: Ratio::new(dec!(0.1)),
        max_ratio: Ratio::new(dec!(0.75)),
        rebalance_ratio: Ratio::new(dec!(0.88)),
        rebalance_bonus: Ratio::new(dec!(0.025)),
        liquidation_ratio: Ratio::new(dec!(0.95)),
        liquidation_bonus: Ratio::new(dec!(0.05)),
        redemption_fee: Ratio::new(dec!(0.005)),
        max_redeem_ratio_per_tick: Ratio::new(dec!(0.2)),
        open_fee_ratio: Ratio::new(Decimal::ZERO),
        open_fee_step: Ratio::new(Decimal::ZERO),
        min_collateral: Collateral::new(1_000_000),
        min_debt: KUSD::new(100_000_000),
        collateral_capacity: Collateral::new(10_000_000_000_000),
        debt_capacity: KUSD::new(10_000_000_000_000_000),
        funding_apr: Ratio::new(dec!(0.05)),
        funding_fee_cut: Ratio::new(dec!(0.1)),
    }
}

pub fn new_pool() -> FundingPool {
    FundingPool::new(default_config(), 0)
}

pub fn flat_price(usd_per_token: Decimal) -> PriceTriple {
    PriceTriple::flat(Price::new(usd_per_token))
}

pub fn alice() -> Principal {
    Principal::self_authenticating(b"alice")
}

pub fn bob() -> Principal {
    Principal::self_authenticating(b"bob")
}

pub fn caroline() -> Principal {
    Principal::self_authenticating(b"caroline")
}
