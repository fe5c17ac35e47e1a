use candid::Principal;
use ic_canister_log::log;
use ic_cdk_macros::{init, post_upgrade, query, update};
use keel_protocol_backend::dashboard::{HttpRequest, HttpResponse};
use keel_protocol_backend::event::Event;
use keel_protocol_backend::logs::{Log, Priority, INFO};
use keel_protocol_backend::manager::{
    AdjustPositionArg, FundReserveArg, LiquidateArg, OpenPositionArg, OpenPositionSuccess,
    PositionArg, RebalanceArg, RedeemArg,
};
use keel_protocol_backend::numeric::Collateral;
use keel_protocol_backend::pool::{
    AdjustReceipt, CloseReceipt, LiquidationReceipt, PoolConfig, PoolStatus, RebalanceReceipt,
};
use keel_protocol_backend::position::PositionView;
use keel_protocol_backend::redemption::RedemptionReceipt;
use keel_protocol_backend::state::{
    mutate_state, read_state, replace_state, PoolId, RateSource, State,
};
use keel_protocol_backend::tick::Tick;
use keel_protocol_backend::{
    GetEventsArg, ProtocolArg, ProtocolError, ProtocolStatus, SEC_NANOS,
};

#[cfg(feature = "self_check")]
fn ok_or_die(result: Result<(), String>) {
    if let Err(msg) = result {
        ic_cdk::println!("{}", msg);
        ic_cdk::trap(&msg);
    }
}

/// Checks that the canister state is internally consistent and agrees with
/// the event log.
#[cfg(feature = "self_check")]
fn check_invariants() -> Result<(), String> {
    use keel_protocol_backend::event::replay;
    use keel_protocol_backend::storage::with_event_iter;

    read_state(|s| {
        s.check_invariants()?;

        let recovered_state = with_event_iter(|events| replay(events))
            .map_err(|e| format!("failed to replay the event log: {:?}", e))?;

        recovered_state.check_invariants()?;

        // A running timer can temporarily violate invariants.
        if !s.is_timer_running {
            s.check_semantically_eq(&recovered_state)?;
        }
        Ok(())
    })
}

fn check_postcondition<T>(t: T) -> T {
    #[cfg(feature = "self_check")]
    ok_or_die(check_invariants());
    t
}

fn require_developer() -> Result<(), ProtocolError> {
    if ic_cdk::caller() != read_state(|s| s.developer_principal) {
        return Err(ProtocolError::CallerNotOwner);
    }
    Ok(())
}

fn setup_timers() {
    ic_cdk_timers::set_timer_interval(
        keel_protocol_backend::xrc::FETCHING_RATE_INTERVAL,
        || ic_cdk::spawn(keel_protocol_backend::xrc::fetch_all_rates()),
    );
    ic_cdk_timers::set_timer_interval(std::time::Duration::from_secs(60), || {
        ic_cdk::spawn(keel_protocol_backend::manager::process_pending_payouts())
    });
    // Funding accrues hourly on every pool.
    ic_cdk_timers::set_timer_interval(std::time::Duration::from_secs(3600), || {
        let now = ic_cdk::api::time() / SEC_NANOS;
        mutate_state(|s| {
            let pool_ids: Vec<PoolId> = s.pools.keys().copied().collect();
            for pool_id in pool_ids {
                keel_protocol_backend::event::record_charge_funding(s, pool_id, now);
            }
        });
    });
}

fn main() {}

#[init]
fn init(arg: ProtocolArg) {
    match arg {
        ProtocolArg::Init(init_arg) => {
            log!(INFO, "[init]: initialized the protocol with arg: {:?}", init_arg);
            keel_protocol_backend::storage::record_event(&Event::Init(init_arg.clone()));
            replace_state(State::from(init_arg));
        }
        ProtocolArg::Upgrade(_) => ic_cdk::trap("expected Init got Upgrade"),
    }
    setup_timers();
}

#[post_upgrade]
fn post_upgrade(arg: ProtocolArg) {
    use keel_protocol_backend::event::replay;
    use keel_protocol_backend::storage::{count_events, record_event, with_event_iter};

    let start = ic_cdk::api::instruction_counter();

    log!(INFO, "[upgrade]: replaying {} events", count_events());

    match arg {
        ProtocolArg::Init(_) => ic_cdk::trap("expected Upgrade got Init"),
        ProtocolArg::Upgrade(upgrade_arg) => {
            log!(
                INFO,
                "[upgrade]: updating configuration with {:?}",
                upgrade_arg
            );
            record_event(&Event::Upgrade(upgrade_arg));
        }
    }

    let state = with_event_iter(|events| replay(events)).unwrap_or_else(|e| {
        ic_cdk::trap(&format!(
            "[upgrade]: failed to replay the event log: {:?}",
            e
        ))
    });

    replace_state(state);

    let end = ic_cdk::api::instruction_counter();
    log!(
        INFO,
        "[upgrade]: replaying events consumed {} instructions",
        end - start
    );

    setup_timers();
}

// ---- lifecycle ----

#[update]
async fn open_position(arg: OpenPositionArg) -> Result<OpenPositionSuccess, ProtocolError> {
    check_postcondition(keel_protocol_backend::manager::open_position(arg).await)
}

#[update]
async fn adjust_position(arg: AdjustPositionArg) -> Result<AdjustReceipt, ProtocolError> {
    check_postcondition(keel_protocol_backend::manager::adjust_position(arg).await)
}

#[update]
async fn close_position(arg: PositionArg) -> Result<CloseReceipt, ProtocolError> {
    check_postcondition(keel_protocol_backend::manager::close_position(arg).await)
}

// ---- corrective operations ----

#[update]
async fn rebalance(arg: RebalanceArg) -> Result<RebalanceReceipt, ProtocolError> {
    check_postcondition(keel_protocol_backend::manager::rebalance(arg).await)
}

#[update]
async fn liquidate(arg: LiquidateArg) -> Result<LiquidationReceipt, ProtocolError> {
    check_postcondition(keel_protocol_backend::manager::liquidate(arg).await)
}

#[update]
async fn redeem(arg: RedeemArg) -> Result<RedemptionReceipt, ProtocolError> {
    check_postcondition(keel_protocol_backend::manager::redeem(arg).await)
}

#[update]
async fn fund_reserve(arg: FundReserveArg) -> Result<u64, ProtocolError> {
    check_postcondition(keel_protocol_backend::manager::fund_reserve(arg).await)
}

// ---- administration ----

#[update]
fn register_pool(
    config: PoolConfig,
    collateral_ledger: Principal,
    collateral_symbol: String,
    collateral_decimals: u8,
    ledger_fee: u64,
    rate_source: RateSource,
) -> Result<PoolId, ProtocolError> {
    require_developer()?;
    config.validate().map_err(|message| ProtocolError::GenericError {
        error_code: 0,
        message,
    })?;
    let now = ic_cdk::api::time() / SEC_NANOS;
    let pool_id = mutate_state(|s| {
        keel_protocol_backend::event::record_register_pool(
            s,
            config,
            collateral_ledger,
            collateral_symbol,
            collateral_decimals,
            Collateral::new(ledger_fee),
            rate_source,
            now,
        )
    });
    log!(INFO, "[register_pool]: registered pool {}", pool_id);
    Ok(check_postcondition(pool_id))
}

#[update]
fn set_pool_status(pool_id: PoolId, status: PoolStatus) -> Result<(), ProtocolError> {
    require_developer()?;
    read_state(|s| s.pool(pool_id).map(|_| ()))?;
    mutate_state(|s| keel_protocol_backend::event::record_set_pool_status(s, pool_id, status));
    Ok(check_postcondition(()))
}

#[update]
async fn claim_fees(pool_id: PoolId) -> Result<(u64, u64), ProtocolError> {
    check_postcondition(keel_protocol_backend::manager::claim_fees(pool_id).await)
}

#[update]
fn charge_funding(pool_id: PoolId) -> Result<u64, ProtocolError> {
    read_state(|s| s.pool(pool_id).map(|_| ()))?;
    let now = ic_cdk::api::time() / SEC_NANOS;
    let fee = mutate_state(|s| {
        keel_protocol_backend::event::record_charge_funding(s, pool_id, now)
    });
    Ok(check_postcondition(fee.to_u64()))
}

// ---- queries ----

#[query]
fn get_protocol_status() -> ProtocolStatus {
    keel_protocol_backend::get_protocol_status()
}

#[query]
fn get_position(arg: PositionArg) -> Result<PositionView, ProtocolError> {
    read_state(|s| {
        let record = s.pool(arg.pool_id)?;
        let price = s.price_for(arg.pool_id)?;
        record.engine.get_position(arg.position_id, price)
    })
}

#[query]
fn get_positions(pool_id: PoolId, owner: Principal) -> Result<Vec<PositionView>, ProtocolError> {
    read_state(|s| {
        let record = s.pool(pool_id)?;
        let price = s.price_for(pool_id)?;
        Ok(record.engine.positions_of(owner, price))
    })
}

#[query]
fn get_top_tick(pool_id: PoolId) -> Result<Option<Tick>, ProtocolError> {
    read_state(|s| {
        let record = s.pool(pool_id)?;
        let top = record.engine.top_tick();
        Ok((top != keel_protocol_backend::tick::SENTINEL_TICK).then_some(top))
    })
}

#[query]
fn get_indexes(pool_id: PoolId) -> Result<(String, String), ProtocolError> {
    read_state(|s| {
        let ledger = s.pool(pool_id)?.engine.ledger();
        Ok((
            ledger.debt_index().to_string(),
            ledger.collateral_index().to_string(),
        ))
    })
}

#[query]
fn get_events(args: GetEventsArg) -> Vec<Event> {
    const MAX_EVENTS_PER_QUERY: u64 = 2000;

    keel_protocol_backend::storage::with_event_iter(|events| {
        events
            .skip(args.start as usize)
            .take(args.length.min(MAX_EVENTS_PER_QUERY) as usize)
            .collect()
    })
}

#[query]
fn http_request(req: HttpRequest) -> HttpResponse {
    if req.url.starts_with("/metrics") {
        let mut writer = ic_metrics_encoder::MetricsEncoder::new(
            vec![],
            (ic_cdk::api::time() / 1_000_000) as i64,
        );
        match keel_protocol_backend::dashboard::encode_metrics(&mut writer) {
            Ok(()) => HttpResponse::ok("text/plain; version=0.0.4", writer.into_inner()),
            Err(e) => HttpResponse {
                status_code: 500,
                headers: vec![],
                body: serde_bytes::ByteBuf::from(format!("failed to encode metrics: {}", e)),
            },
        }
    } else if req.url.starts_with("/dashboard") {
        HttpResponse::ok(
            "text/html; charset=utf-8",
            keel_protocol_backend::dashboard::build_dashboard(),
        )
    } else if req.url.starts_with("/logs") {
        use std::str::FromStr;
        let max_skip_timestamp = match req.url.split('?').nth(1).and_then(|params| {
            params
                .split('&')
                .find(|p| p.starts_with("time="))
                .and_then(|p| p.strip_prefix("time="))
                .map(u64::from_str)
        }) {
            Some(Ok(ts)) => ts,
            Some(Err(_)) => {
                return HttpResponse {
                    status_code: 400,
                    headers: vec![],
                    body: serde_bytes::ByteBuf::from("failed to parse the 'time' parameter"),
                }
            }
            None => 0,
        };
        let mut log = Log::default();
        log.push_logs(Priority::Info);
        log.push_logs(Priority::TraceXrc);
        log.push_logs(Priority::Debug);
        log.entries
            .retain(|entry| entry.timestamp >= max_skip_timestamp);
        log.sort_logs();

        const MAX_BODY_SIZE: usize = 3_000_000;
        HttpResponse::ok(
            "application/json; charset=utf-8",
            log.serialize_logs(MAX_BODY_SIZE).into_bytes(),
        )
    } else {
        HttpResponse::not_found()
    }
}

#[cfg(feature = "self_check")]
#[query]
fn self_check() -> Result<(), String> {
    check_invariants()
}

ic_cdk::export_candid!();
