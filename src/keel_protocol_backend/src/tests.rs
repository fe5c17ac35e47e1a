use crate::event::{replay, Event, ReplayLogError};
use crate::numeric::{Collateral, KUSD};
use crate::pool::{PoolStatus, ReservePool};
use crate::state::RateSource;
use crate::test_helpers::*;
use crate::{InitArg, ProtocolError};
use assert_matches::assert_matches;
use candid::Principal;
use proptest::collection::vec as pvec;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[test]
fn open_enforces_ratio_band_and_minimums() {
    let mut pool = new_pool();
    let price = flat_price(dec!(2000));

    // 1 token backing 1600 kUSD is a 0.8 ratio, above the band.
    assert_matches!(
        pool.open_position(alice(), Collateral::new(100_000_000), KUSD::new(160_000_000_000), price),
        Err(ProtocolError::DebtRatioTooLarge)
    );
    // 1 token backing 100 kUSD is a 0.05 ratio, below the band.
    assert_matches!(
        pool.open_position(alice(), Collateral::new(100_000_000), KUSD::new(10_000_000_000), price),
        Err(ProtocolError::DebtRatioTooSmall)
    );
    assert_matches!(
        pool.open_position(alice(), Collateral::new(100), KUSD::new(0), price),
        Err(ProtocolError::AmountTooLow)
    );
    assert_matches!(
        pool.open_position(alice(), Collateral::new(0), KUSD::new(100_000_000), price),
        Err(ProtocolError::DebtRatioTooLarge)
    );
    assert_eq!(pool.position_count(), 0);

    let receipt = pool
        .open_position(alice(), Collateral::new(100_000_000), KUSD::new(100_000_000_000), price)
        .unwrap();
    assert_eq!(receipt.position_id, 0);
    assert_eq!(receipt.debt_minted, 100_000_000_000u64);
    assert_eq!(receipt.fee, 0u64);
    pool.check_invariants().unwrap();
}

#[test]
fn open_charges_utilization_fee_as_extra_debt() {
    let mut config = default_config();
    config.open_fee_ratio = crate::numeric::Ratio::new(dec!(0.005));
    let mut pool = crate::pool::FundingPool::new(config, 0);
    let price = flat_price(dec!(2000));

    let receipt = pool
        .open_position(alice(), Collateral::new(100_000_000), KUSD::new(100_000_000_000), price)
        .unwrap();
    assert_eq!(receipt.debt_minted, 100_000_000_000u64);
    assert_eq!(receipt.fee, 500_000_000u64);
    assert_eq!(pool.fees_kusd(), 500_000_000u64);
    // The fee is borrowed on top of the requested amount.
    let (_, debt) = pool.position_balances(0).unwrap();
    assert_eq!(debt, 100_500_000_000u64);
}

#[test]
fn open_rejects_past_capacity() {
    let mut config = default_config();
    config.debt_capacity = KUSD::new(150_000_000_000);
    let mut pool = crate::pool::FundingPool::new(config, 0);
    let price = flat_price(dec!(2000));

    pool.open_position(alice(), Collateral::new(100_000_000), KUSD::new(100_000_000_000), price)
        .unwrap();
    assert_matches!(
        pool.open_position(bob(), Collateral::new(100_000_000), KUSD::new(100_000_000_000), price),
        Err(ProtocolError::CapacityExceeded)
    );
}

#[test]
fn adjust_moves_the_position_and_checks_the_band() {
    let mut pool = new_pool();
    let price = flat_price(dec!(2000));
    pool.open_position(alice(), Collateral::new(100_000_000), KUSD::new(100_000_000_000), price)
        .unwrap();

    assert_matches!(
        pool.adjust_position(bob(), 0, 0, -10_000_000_000, price),
        Err(ProtocolError::CallerNotOwner)
    );
    // Borrowing up to a 0.8 ratio overshoots the band and leaves no trace.
    assert_matches!(
        pool.adjust_position(alice(), 0, 0, 60_000_000_000, price),
        Err(ProtocolError::DebtRatioTooLarge)
    );
    let (coll, debt) = pool.position_balances(0).unwrap();
    assert_eq!(coll, 100_000_000u64);
    assert_eq!(debt, 100_000_000_000u64);

    // Repay half and withdraw some collateral in one move.
    let receipt = pool
        .adjust_position(alice(), 0, -20_000_000, -50_000_000_000, price)
        .unwrap();
    assert_eq!(receipt.collateral_out, 20_000_000u64);
    assert_eq!(receipt.debt_repaid, 50_000_000_000u64);
    let (coll, debt) = pool.position_balances(0).unwrap();
    assert_eq!(coll, 80_000_000u64);
    assert_eq!(debt, 50_000_000_000u64);
    pool.check_invariants().unwrap();
}

/// An adjust that empties both balances destroys the position exactly like
/// a close; the id stays dead afterwards.
#[test]
fn adjust_that_drains_everything_destroys_the_position() {
    let mut pool = new_pool();
    let price = flat_price(dec!(2000));
    pool.open_position(alice(), Collateral::new(100_000_000), KUSD::new(100_000_000_000), price)
        .unwrap();

    let receipt = pool
        .adjust_position(alice(), 0, -100_000_000, -100_000_000_000, price)
        .unwrap();
    assert_eq!(receipt.collateral_out, 100_000_000u64);
    assert_eq!(receipt.debt_repaid, 100_000_000_000u64);
    assert_eq!(pool.position_count(), 0);
    assert_eq!(pool.total_debt_raw(), Decimal::ZERO);
    assert_matches!(
        pool.position_balances(0),
        Err(ProtocolError::PositionNotFound)
    );
    assert_matches!(
        pool.adjust_position(alice(), 0, 100_000_000, 50_000_000_000, price),
        Err(ProtocolError::PositionNotFound)
    );

    // The id is never reused either.
    let receipt = pool
        .open_position(alice(), Collateral::new(100_000_000), KUSD::new(100_000_000_000), price)
        .unwrap();
    assert_eq!(receipt.position_id, 1);
    pool.check_invariants().unwrap();
}

#[test]
fn close_returns_the_full_balances() {
    let mut pool = new_pool();
    let price = flat_price(dec!(2000));
    pool.open_position(alice(), Collateral::new(100_000_000), KUSD::new(100_000_000_000), price)
        .unwrap();

    let receipt = pool.close_position(alice(), 0).unwrap();
    assert_eq!(receipt.collateral_out, 100_000_000u64);
    assert_eq!(receipt.debt_repaid, 100_000_000_000u64);
    assert_eq!(pool.position_count(), 0);
    assert_eq!(pool.total_debt_raw(), Decimal::ZERO);
    assert_eq!(pool.total_collateral_raw(), Decimal::ZERO);
    assert_matches!(
        pool.close_position(alice(), 0),
        Err(ProtocolError::PositionNotFound)
    );
}

/// Three positions opened at the same debt ratio land in one bucket; after a
/// price drop a single tick-wide rebalance brings every one of them back to
/// the target ratio.
#[test]
fn tick_rebalance_converges_every_member_to_the_target() {
    let mut pool = new_pool();
    let open_price = flat_price(dec!(2500));
    let colls = [12_300_000u64, 123_000_000, 1_230_000_000];
    let debts = [22_000_000_000u64, 220_000_000_000, 2_200_000_000_000];
    for (coll, debt) in colls.iter().zip(debts.iter()) {
        pool.open_position(alice(), Collateral::new(*coll), KUSD::new(*debt), open_price)
            .unwrap();
    }
    let tick = pool.top_tick();
    assert_eq!(tick, 7154);

    let crash = flat_price(dec!(2000));
    let receipt = pool
        .rebalance_tick(tick, KUSD::new(1_000_000_000_000), crash)
        .unwrap();
    // (D - r*pC) / (1 - r*(1+b)) with D = 24420, C = 13.653, p = 2000.
    assert!((receipt.debt_repaid.to_decimal() - dec!(398_693_877_551.0204)).abs() < dec!(2));
    assert!((receipt.collateral_received.to_decimal() - dec!(204_330_612.2449)).abs() < dec!(2));

    for id in 0..3u64 {
        let view = pool.get_position(id, crash).unwrap();
        assert!(
            (view.debt_ratio.0 - dec!(0.88)).abs() < dec!(0.000001),
            "position {} sits at {}",
            id,
            view.debt_ratio.0
        );
    }
    // The settled bucket lands on the target-ratio tick.
    let top = pool.top_tick();
    assert!((8799..=8800).contains(&top), "top tick is {}", top);
    pool.check_invariants().unwrap();
}

#[test]
fn rebalance_rejects_a_healthy_position() {
    let mut pool = new_pool();
    let price = flat_price(dec!(2000));
    pool.open_position(alice(), Collateral::new(100_000_000), KUSD::new(100_000_000_000), price)
        .unwrap();
    assert_matches!(
        pool.rebalance_position(0, KUSD::new(100_000_000_000), price),
        Err(ProtocolError::RatioNotReached)
    );
    assert_matches!(
        pool.rebalance_tick(12_000, KUSD::new(100_000_000_000), price),
        Err(ProtocolError::GenericError {
            error_code: crate::ERROR_CODE_TICK_NOT_OCCUPIED,
            ..
        })
    );
}

#[test]
fn rebalance_brings_one_position_to_the_target() {
    let mut pool = new_pool();
    pool.open_position(
        alice(),
        Collateral::new(100_000_000),
        KUSD::new(140_000_000_000),
        flat_price(dec!(2000)),
    )
    .unwrap();
    assert_eq!(pool.top_tick(), 7000);

    // At 1550 the ratio is 1400 / 1550 = 0.9032.
    let crash = flat_price(dec!(1550));
    let receipt = pool
        .rebalance_position(0, KUSD::new(100_000_000_000), crash)
        .unwrap();
    // (D - r*pC) / (1 - r*(1+b)) = (1400 - 1364) / 0.098 = 367.35 kUSD.
    assert!((receipt.debt_repaid.to_decimal() - dec!(36_734_693_877.551)).abs() < dec!(2));
    assert!((receipt.collateral_received.to_decimal() - dec!(24_292_297.564)).abs() < dec!(2));

    let view = pool.get_position(0, crash).unwrap();
    assert!(
        (view.debt_ratio.0 - dec!(0.88)).abs() < dec!(0.000001),
        "position sits at {}",
        view.debt_ratio.0
    );
    let top = pool.top_tick();
    assert!((8799..=8800).contains(&top), "top tick is {}", top);
    pool.check_invariants().unwrap();
}

/// Once the debt plus bonus outgrows the collateral value, rebalancing would
/// drain the collateral and leave naked debt behind; the position rejects
/// the rebalance and liquidation takes over.
#[test]
fn underwater_position_rejects_rebalance_and_liquidates_instead() {
    let mut pool = new_pool();
    let mut reserve = ReservePool::default();
    pool.open_position(
        alice(),
        Collateral::new(100_000_000),
        KUSD::new(100_000_000_000),
        flat_price(dec!(1400)),
    )
    .unwrap();

    // At 950 the ratio is 1000 / 950 = 1.0526: the 2.5% bonus can no longer
    // be carved out of the collateral.
    let crash = flat_price(dec!(950));
    assert_matches!(
        pool.rebalance_position(0, KUSD::new(95_000_000_000), crash),
        Err(ProtocolError::GenericError {
            error_code: crate::ERROR_CODE_NEEDS_LIQUIDATION,
            ..
        })
    );
    assert_matches!(
        pool.rebalance_tick(pool.top_tick(), KUSD::new(95_000_000_000), crash),
        Err(ProtocolError::GenericError {
            error_code: crate::ERROR_CODE_NEEDS_LIQUIDATION,
            ..
        })
    );
    // The rejection left no trace.
    let (coll, debt) = pool.position_balances(0).unwrap();
    assert_eq!(coll, 100_000_000u64);
    assert_eq!(debt, 100_000_000_000u64);

    let receipt = pool
        .liquidate(0, KUSD::new(100_000_000_000), crash, &mut reserve)
        .unwrap();
    assert!(receipt.position_closed);
    assert_eq!(receipt.debt_repaid, 100_000_000_000u64);
    assert_eq!(receipt.collateral_received, 100_000_000u64);
    assert_eq!(receipt.bad_debt_socialized, 0u64);
    assert_eq!(pool.position_count(), 0);
    pool.check_invariants().unwrap();
}

/// The liquidation bonus shortfall is drawn from the reserve, and total debt
/// drops by exactly the liquidated amount.
#[test]
fn liquidation_draws_the_reserve_for_the_bonus_shortfall() {
    let mut pool = new_pool();
    let mut reserve = ReservePool::default();
    reserve.deposit(Collateral::new(10_000_000));
    let open_price = flat_price(dec!(2500));
    pool.open_position(alice(), Collateral::new(12_300_000), KUSD::new(22_000_000_000), open_price)
        .unwrap();
    pool.open_position(bob(), Collateral::new(1_000_000_000), KUSD::new(1_000_000_000_000), open_price)
        .unwrap();

    let crash = flat_price(dec!(1850));
    let receipt = pool
        .liquidate(0, KUSD::new(22_000_000_000), crash, &mut reserve)
        .unwrap();
    assert!(receipt.position_closed);
    assert_eq!(receipt.debt_repaid, 22_000_000_000u64);
    // 220 * 1.05 / 1850 = 0.12486486 tokens owed; 0.123 covered by the
    // position, the rest by the reserve.
    assert_eq!(receipt.bonus_from_reserve, 186_486u64);
    assert_eq!(receipt.collateral_received, 12_486_486u64);
    assert_eq!(receipt.bad_debt_socialized, 0u64);
    assert!((reserve.balance() - dec!(9_813_513.5135)).abs() < dec!(1));

    // The survivor is untouched and total debt dropped by the repayment only.
    let (coll, debt) = pool.position_balances(1).unwrap();
    assert_eq!(coll, 1_000_000_000u64);
    assert_eq!(debt, 1_000_000_000_000u64);
    assert_eq!(pool.total_debt_raw(), dec!(1_000_000_000_000));
    pool.check_invariants().unwrap();
}

/// With no reserve, the bonus shortfall marks down everyone's collateral and
/// the uncovered debt is socialized onto the remaining debt, pro rata through
/// the indexes.
#[test]
fn liquidation_socializes_bad_debt_pro_rata() {
    let mut pool = new_pool();
    let mut reserve = ReservePool::default();
    let open_price = flat_price(dec!(3500));
    pool.open_position(alice(), Collateral::new(10_000_000), KUSD::new(25_000_000_000), open_price)
        .unwrap();
    pool.open_position(bob(), Collateral::new(100_000_000), KUSD::new(100_000_000_000), open_price)
        .unwrap();

    let crash = flat_price(dec!(2000));
    let receipt = pool
        .liquidate(0, KUSD::new(20_000_000_000), crash, &mut reserve)
        .unwrap();
    assert!(receipt.position_closed);
    assert_eq!(receipt.debt_repaid, 20_000_000_000u64);
    assert_eq!(receipt.bonus_from_reserve, 0u64);
    // 200 * 1.05 / 2000 = 0.105 tokens owed, 0.1 from the position and
    // 0.005 marked down across the survivors.
    assert_eq!(receipt.collateral_received, 10_500_000u64);
    assert_eq!(receipt.bad_debt_socialized, 5_000_000_000u64);

    let (coll, debt) = pool.position_balances(1).unwrap();
    assert_eq!(coll, 99_500_000u64);
    assert_eq!(debt, 105_000_000_000u64);
    pool.check_invariants().unwrap();
}

/// Liquidating the last position leaves its bad debt orphaned; the next
/// funding accruals work it off before any fee is skimmed.
#[test]
fn orphaned_bad_debt_is_worked_off_by_funding() {
    let mut pool = new_pool();
    let mut reserve = ReservePool::default();
    let open_price = flat_price(dec!(3500));
    pool.open_position(alice(), Collateral::new(10_000_000), KUSD::new(25_000_000_000), open_price)
        .unwrap();

    let crash = flat_price(dec!(2000));
    let receipt = pool
        .liquidate(0, KUSD::new(20_000_000_000), crash, &mut reserve)
        .unwrap();
    assert_eq!(receipt.bad_debt_socialized, 0u64);
    assert_eq!(pool.total_debt_raw(), Decimal::ZERO);

    pool.open_position(bob(), Collateral::new(100_000_000), KUSD::new(100_000_000_000), crash)
        .unwrap();
    // One year at 5% APR accrues exactly the 50 kUSD of orphaned debt.
    let fee = pool.charge_funding(crate::pool::SECONDS_PER_YEAR);
    assert_eq!(fee, 0u64);
    assert_eq!(pool.fees_kusd(), 0u64);
    let (_, debt) = pool.position_balances(1).unwrap();
    assert_eq!(debt, 105_000_000_000u64);

    // The next year is skimmed normally: 10% of 5.25 kUSD accrued.
    let fee = pool.charge_funding(2 * crate::pool::SECONDS_PER_YEAR);
    assert_eq!(fee, 525_000_000u64);
    assert_eq!(pool.fees_kusd(), 525_000_000u64);
    // Same timestamp again is a no-op.
    assert_eq!(pool.charge_funding(2 * crate::pool::SECONDS_PER_YEAR), 0u64);
    pool.check_invariants().unwrap();
}

#[test]
fn redemption_starts_at_the_riskiest_bucket() {
    let mut pool = new_pool();
    let price = flat_price(dec!(2000));
    pool.open_position(alice(), Collateral::new(100_000_000), KUSD::new(140_000_000_000), price)
        .unwrap();
    pool.open_position(bob(), Collateral::new(100_000_000), KUSD::new(100_000_000_000), price)
        .unwrap();
    assert_eq!(pool.top_tick(), 7000);

    let receipt = pool.redeem(KUSD::new(10_000_000_000), false, price).unwrap();
    assert_eq!(receipt.kusd_used, 10_000_000_000u64);
    assert_eq!(receipt.ticks_visited, 1);
    // 100 kUSD buys 0.05 tokens at 2000, minus the 0.5% fee.
    assert_eq!(receipt.collateral_received, 4_975_000u64);
    assert_eq!(receipt.fee_paid, 25_000u64);
    assert_eq!(pool.fees_collateral(), 25_000u64);

    // Only the riskiest position paid.
    let (coll, debt) = pool.position_balances(0).unwrap();
    assert_eq!(coll, 95_000_000u64);
    assert_eq!(debt, 130_000_000_000u64);
    let (coll, debt) = pool.position_balances(1).unwrap();
    assert_eq!(coll, 100_000_000u64);
    assert_eq!(debt, 100_000_000_000u64);
    pool.check_invariants().unwrap();
}

#[test]
fn redemption_caps_each_pass_and_cascades_down() {
    let mut pool = new_pool();
    let price = flat_price(dec!(2000));
    pool.open_position(alice(), Collateral::new(100_000_000), KUSD::new(140_000_000_000), price)
        .unwrap();
    pool.open_position(bob(), Collateral::new(100_000_000), KUSD::new(100_000_000_000), price)
        .unwrap();

    // 400 kUSD exceeds the 20% per-tick cap (280), so the bucket settles,
    // cascades to a lower tick, and a second pass takes the rest.
    let receipt = pool.redeem(KUSD::new(40_000_000_000), false, price).unwrap();
    assert_eq!(receipt.kusd_used, 40_000_000_000u64);
    assert_eq!(receipt.ticks_visited, 2);
    assert_eq!(receipt.collateral_received, 19_900_000u64);
    assert_eq!(receipt.fee_paid, 100_000u64);
    // 1000 remaining against 0.8 tokens is a 0.625 ratio.
    assert_eq!(pool.top_tick(), 6250);
    pool.check_invariants().unwrap();
}

#[test]
fn exact_redemption_rejects_on_shortfall_without_touching_the_pool() {
    let mut config = default_config();
    config.min_ratio = crate::numeric::Ratio::new(dec!(0.5));
    let mut pool = crate::pool::FundingPool::new(config, 0);
    let price = flat_price(dec!(2000));
    pool.open_position(alice(), Collateral::new(100_000_000), KUSD::new(140_000_000_000), price)
        .unwrap();

    // The walk bottoms out at the minimum-ratio floor after 800 kUSD.
    let err = pool
        .redeem(KUSD::new(200_000_000_000), true, price)
        .unwrap_err();
    match err {
        ProtocolError::RedemptionShortfall { redeemable } => {
            assert!((redeemable.to_decimal() - dec!(80_000_000_000)).abs() < dec!(2));
        }
        other => panic!("expected a redemption shortfall, got {:?}", other),
    }
    assert_eq!(pool.total_debt_raw(), dec!(140_000_000_000));

    // The non-exact form takes what the floor allows.
    let receipt = pool.redeem(KUSD::new(200_000_000_000), false, price).unwrap();
    assert!((receipt.kusd_used.to_decimal() - dec!(80_000_000_000)).abs() < dec!(2));
    assert_eq!(receipt.ticks_visited, 4);
    pool.check_invariants().unwrap();
}

/// A single call settles at most 200 buckets; a tight per-tick cap makes the
/// walk hit that bound with debt still redeemable, and the partial fill is
/// picked up by a follow-up call.
#[test]
fn redemption_walk_is_bounded_per_call() {
    let mut config = default_config();
    config.min_ratio = crate::numeric::Ratio::new(Decimal::ZERO);
    config.max_redeem_ratio_per_tick = crate::numeric::Ratio::new(dec!(0.01));
    let mut pool = crate::pool::FundingPool::new(config, 0);
    let price = flat_price(dec!(2000));
    pool.open_position(alice(), Collateral::new(100_000_000), KUSD::new(140_000_000_000), price)
        .unwrap();

    let receipt = pool.redeem(KUSD::new(140_000_000_000), false, price).unwrap();
    assert_eq!(receipt.ticks_visited, 200);
    // 1% per pass leaves 0.99^200 of the debt unredeemed.
    assert!(receipt.kusd_used > 121_000_000_000u64);
    assert!(receipt.kusd_used < 121_500_000_000u64);
    assert!(pool.total_debt_raw() > dec!(18_000_000_000));

    let receipt = pool.redeem(KUSD::new(140_000_000_000), false, price).unwrap();
    assert!(receipt.kusd_used > 0u64);
    pool.check_invariants().unwrap();
}

#[test]
fn paused_pool_only_allows_risk_reducing_moves() {
    let mut pool = new_pool();
    let price = flat_price(dec!(2000));
    pool.open_position(alice(), Collateral::new(100_000_000), KUSD::new(100_000_000_000), price)
        .unwrap();

    pool.status = PoolStatus::Paused;
    assert_matches!(
        pool.open_position(bob(), Collateral::new(100_000_000), KUSD::new(100_000_000_000), price),
        Err(ProtocolError::TemporarilyUnavailable(_))
    );
    assert_matches!(
        pool.adjust_position(alice(), 0, 0, 10_000_000_000, price),
        Err(ProtocolError::TemporarilyUnavailable(_))
    );
    pool.adjust_position(alice(), 0, 0, -10_000_000_000, price)
        .unwrap();

    pool.status = PoolStatus::Frozen;
    assert_matches!(
        pool.close_position(alice(), 0),
        Err(ProtocolError::TemporarilyUnavailable(_))
    );
    assert_matches!(
        pool.redeem(KUSD::new(10_000_000_000), false, price),
        Err(ProtocolError::TemporarilyUnavailable(_))
    );
}

fn test_init_arg() -> InitArg {
    InitArg {
        xrc_principal: Principal::from_text("uf6dk-hyaaa-aaaaq-qaaaq-cai").unwrap(),
        kusd_ledger_principal: Principal::from_text("mxzaz-hqaaa-aaaar-qaada-cai").unwrap(),
        developer_principal: alice(),
    }
}

#[test]
fn replay_rebuilds_the_state_from_the_log() {
    let price = flat_price(dec!(2000));
    let events = vec![
        Event::Init(test_init_arg()),
        Event::RegisterPool {
            config: default_config(),
            collateral_ledger: Principal::from_text("ryjl3-tyaaa-aaaaa-aaaba-cai").unwrap(),
            collateral_symbol: "ICP".to_string(),
            collateral_decimals: 8,
            ledger_fee: Collateral::new(10_000),
            rate_source: RateSource::Identity,
            timestamp: 0,
        },
        Event::OpenPosition {
            pool_id: 0,
            owner: alice(),
            collateral: Collateral::new(100_000_000),
            debt: KUSD::new(100_000_000_000),
            price,
            block_index: 1,
        },
        Event::SetPoolStatus {
            pool_id: 0,
            status: PoolStatus::Paused,
        },
        Event::AdjustPosition {
            pool_id: 0,
            position_id: 0,
            caller: alice(),
            delta_collateral: 0,
            delta_debt: -50_000_000_000,
            price,
            block_index: Some(2),
        },
    ];

    let state = replay(events.into_iter()).unwrap();
    state.check_invariants().unwrap();
    assert_eq!(state.pools.len(), 1);
    let record = state.pool(0).unwrap();
    assert_eq!(record.engine.status, PoolStatus::Paused);
    assert_eq!(record.engine.position_count(), 1);
    let (coll, debt) = record.engine.position_balances(0).unwrap();
    assert_eq!(coll, 100_000_000u64);
    assert_eq!(debt, 50_000_000_000u64);
}

#[test]
fn replay_rejects_a_malformed_log() {
    assert_matches!(
        replay(std::iter::empty()),
        Err(ReplayLogError::EmptyLog)
    );
    let events = vec![Event::SetPoolStatus {
        pool_id: 0,
        status: PoolStatus::Paused,
    }];
    assert_matches!(
        replay(events.into_iter()),
        Err(ReplayLogError::InconsistentLog(_))
    );
}

fn position_sums(pool: &crate::pool::FundingPool) -> (Decimal, Decimal) {
    let mut coll = Decimal::ZERO;
    let mut debt = Decimal::ZERO;
    for id in 0..100u64 {
        if let Ok((c, d)) = pool.position_balances(id) {
            coll += c.to_decimal();
            debt += d.to_decimal();
        }
    }
    (coll, debt)
}

proptest! {
    /// Any sequence of opens and closes keeps the tree aggregates and the
    /// position registry in agreement.
    #[test]
    fn random_lifecycle_preserves_aggregates(
        ops in pvec((2u64..1_000, 15u64..70), 1..25),
    ) {
        let mut pool = new_pool();
        let price = flat_price(dec!(2000));
        let mut ids = Vec::new();
        for (coll_centi, ratio_pct) in ops {
            let coll = Collateral::new(coll_centi * 1_000_000);
            let debt = KUSD::from_decimal_floor(
                coll.to_decimal() * dec!(2000) * Decimal::from(ratio_pct) / dec!(100),
            );
            if let Ok(receipt) = pool.open_position(alice(), coll, debt, price) {
                ids.push(receipt.position_id);
            }
            pool.check_invariants().unwrap();
        }
        for id in ids.iter().step_by(2) {
            pool.close_position(alice(), *id).unwrap();
            pool.check_invariants().unwrap();
        }
        let (coll_sum, debt_sum) = position_sums(&pool);
        let tolerance = Decimal::from(pool.position_count() as u64 + 1);
        prop_assert!((pool.total_collateral_raw() - coll_sum).abs() <= tolerance);
        prop_assert!((pool.total_debt_raw() - debt_sum).abs() <= tolerance);
    }

    /// Redeemed collateral plus fee always equals the kUSD burned at the
    /// oracle price, regardless of how many buckets the walk crosses.
    #[test]
    fn redemption_conserves_value(
        positions in pvec((10u64..2_000, 15u64..70), 1..10),
        redeem_kusd in 1_000u64..100_000,
    ) {
        let mut pool = new_pool();
        let price = flat_price(dec!(2000));
        for (coll_centi, ratio_pct) in positions {
            let coll = Collateral::new(coll_centi * 1_000_000);
            let debt = KUSD::from_decimal_floor(
                coll.to_decimal() * dec!(2000) * Decimal::from(ratio_pct) / dec!(100),
            );
            let _ = pool.open_position(alice(), coll, debt, price);
        }
        let receipt = pool.redeem(KUSD::new(redeem_kusd * 100_000_000), false, price).unwrap();
        let value_out = (receipt.collateral_received.to_decimal()
            + receipt.fee_paid.to_decimal())
            * dec!(2000);
        let tolerance = dec!(4000) * Decimal::from(receipt.ticks_visited + 1);
        prop_assert!((value_out - receipt.kusd_used.to_decimal()).abs() <= tolerance);
        pool.check_invariants().unwrap();
    }
}
