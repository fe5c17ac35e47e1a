//! Price plumbing: background polling of the Exchange Rate Canister plus
//! an on-demand refresh for price-sensitive operations.

use crate::guard::FetchXrcGuard;
use crate::logs::TRACE_XRC;
use crate::state::{mutate_state, read_state, PoolId};
use ic_canister_log::log;
use ic_xrc_types::GetExchangeRateResult;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::time::Duration;

/// Background polling cadence. Each XRC call burns ~1B cycles, so mutating
/// endpoints refresh on demand instead of polling aggressively.
pub const FETCHING_RATE_INTERVAL: Duration = Duration::from_secs(300);

/// Refreshes the cached price of every registered pool.
pub async fn fetch_all_rates() {
    let _guard = match FetchXrcGuard::new() {
        Some(guard) => guard,
        None => return,
    };
    let pool_symbols: Vec<(PoolId, String)> = read_state(|s| {
        s.pools
            .values()
            .map(|r| (r.pool_id, r.collateral_symbol.clone()))
            .collect()
    });
    for (pool_id, symbol) in pool_symbols {
        fetch_rate_for(pool_id, &symbol).await;
    }
}

async fn fetch_rate_for(pool_id: PoolId, symbol: &str) {
    match crate::management::fetch_price(symbol).await {
        Ok(GetExchangeRateResult::Ok(rate)) => {
            let quote = match (
                Decimal::from_u64(rate.rate),
                Decimal::from_u64(10_u64.pow(rate.metadata.decimals)),
            ) {
                (Some(r), Some(scale)) => r / scale,
                _ => {
                    log!(
                        TRACE_XRC,
                        "[fetch_rate] unrepresentable rate for {}: {:?}",
                        symbol,
                        rate
                    );
                    return;
                }
            };
            log!(
                TRACE_XRC,
                "[fetch_rate] {}: {} at timestamp {}",
                symbol,
                quote,
                rate.timestamp
            );
            mutate_state(|s| s.set_price(pool_id, quote, rate.timestamp * crate::SEC_NANOS));
        }
        Ok(GetExchangeRateResult::Err(error)) => {
            log!(
                TRACE_XRC,
                "[fetch_rate] XRC rejected the {} request: {:?}",
                symbol,
                error
            );
        }
        Err(error) => {
            log!(
                TRACE_XRC,
                "[fetch_rate] failed to call the XRC canister for {}: {}",
                symbol,
                error
            );
        }
    }
}

/// Ensures a pool's price is fresh enough for a price-sensitive operation,
/// fetching on demand when the cache has gone stale. Fails closed: with no
/// usable price the operation must not proceed.
pub async fn ensure_fresh_price(pool_id: PoolId) -> Result<(), crate::ProtocolError> {
    if read_state(|s| s.check_price_not_too_old(pool_id)).is_ok() {
        return Ok(());
    }
    let symbol = read_state(|s| s.pool(pool_id).map(|r| r.collateral_symbol.clone()))?;
    fetch_rate_for(pool_id, &symbol).await;
    read_state(|s| s.check_price_not_too_old(pool_id))
}
