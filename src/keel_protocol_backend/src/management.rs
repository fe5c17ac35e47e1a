//! Inter-canister calls: the kUSD ledger (mint/burn via the minting
//! account), the collateral ICRC-1 ledgers, and the XRC price oracle.

use crate::logs::DEBUG;
use crate::numeric::{Collateral, KUSD};
use crate::state::read_state;
use candid::{Nat, Principal};
use ic_canister_log::log;
use ic_xrc_types::{Asset, AssetClass, GetExchangeRateRequest, GetExchangeRateResult};
use icrc_ledger_types::icrc1::account::Account;
use icrc_ledger_types::icrc1::transfer::{TransferArg, TransferError};
use icrc_ledger_types::icrc2::transfer_from::{TransferFromArgs, TransferFromError};
use num_traits::ToPrimitive;

const XRC_CALL_COST_CYCLES: u64 = 1_000_000_000;
const XRC_MARGIN_SEC: u64 = 60;

/// Queries the XRC canister for the collateral/USD rate.
/// https://github.com/dfinity/exchange-rate-canister
pub async fn fetch_price(symbol: &str) -> Result<GetExchangeRateResult, String> {
    let base = Asset {
        symbol: symbol.to_string(),
        class: AssetClass::Cryptocurrency,
    };
    let usd = Asset {
        symbol: "USD".to_string(),
        class: AssetClass::FiatCurrency,
    };
    let timestamp_sec = ic_cdk::api::time() / crate::SEC_NANOS - XRC_MARGIN_SEC;
    let args = GetExchangeRateRequest {
        base_asset: base,
        quote_asset: usd,
        timestamp: Some(timestamp_sec),
    };
    let xrc_principal = read_state(|s| s.xrc_principal);

    let res_xrc: Result<(GetExchangeRateResult,), _> = ic_cdk::api::call::call_with_payment(
        xrc_principal,
        "get_exchange_rate",
        (args.clone(),),
        XRC_CALL_COST_CYCLES,
    )
    .await;
    match res_xrc {
        Ok((result,)) => {
            log!(DEBUG, "[fetch_price] XRC response for {:?}: {:?}", args, result);
            Ok(result)
        }
        Err((code, msg)) => Err(format!(
            "failed to call the XRC canister ({:?}): {}",
            code, msg
        )),
    }
}

/// Mints kUSD to `to`. The protocol canister is the ledger's minting
/// account, so a plain transfer out of it is a mint.
pub async fn mint_kusd(amount: KUSD, to: Principal) -> Result<u64, TransferError> {
    let ledger = read_state(|s| s.kusd_ledger_principal);
    transfer(
        ledger,
        TransferArg {
            from_subaccount: None,
            to: Account {
                owner: to,
                subaccount: None,
            },
            fee: None,
            created_at_time: None,
            memo: None,
            amount: Nat::from(amount.to_u64()),
        },
    )
    .await
}

/// Burns kUSD by pulling it from `from` into the minting account. Requires
/// an icrc2 approval from the payer.
pub async fn burn_kusd_from(amount: KUSD, from: Principal) -> Result<u64, TransferFromError> {
    let ledger = read_state(|s| s.kusd_ledger_principal);
    transfer_from(
        ledger,
        TransferFromArgs {
            spender_subaccount: None,
            from: Account {
                owner: from,
                subaccount: None,
            },
            to: Account {
                owner: ic_cdk::id(),
                subaccount: None,
            },
            amount: Nat::from(amount.to_u64()),
            fee: None,
            memo: None,
            created_at_time: None,
        },
    )
    .await
}

pub async fn transfer_collateral(
    ledger: Principal,
    amount: Collateral,
    to: Principal,
) -> Result<u64, TransferError> {
    transfer(
        ledger,
        TransferArg {
            from_subaccount: None,
            to: Account {
                owner: to,
                subaccount: None,
            },
            fee: None,
            created_at_time: None,
            memo: None,
            amount: Nat::from(amount.to_u64()),
        },
    )
    .await
}

pub async fn transfer_collateral_from(
    ledger: Principal,
    amount: Collateral,
    from: Principal,
) -> Result<u64, TransferFromError> {
    transfer_from(
        ledger,
        TransferFromArgs {
            spender_subaccount: None,
            from: Account {
                owner: from,
                subaccount: None,
            },
            to: Account {
                owner: ic_cdk::id(),
                subaccount: None,
            },
            amount: Nat::from(amount.to_u64()),
            fee: None,
            memo: None,
            created_at_time: None,
        },
    )
    .await
}

async fn transfer(ledger: Principal, arg: TransferArg) -> Result<u64, TransferError> {
    let res: Result<(Result<Nat, TransferError>,), _> =
        ic_cdk::call(ledger, "icrc1_transfer", (arg,)).await;
    match res {
        Ok((Ok(block_index),)) => Ok(block_index
            .0
            .to_u64()
            .expect("bug: block index does not fit in u64")),
        Ok((Err(err),)) => Err(err),
        Err((code, msg)) => Err(TransferError::GenericError {
            error_code: Nat::from(code as u64),
            message: msg,
        }),
    }
}

async fn transfer_from(
    ledger: Principal,
    arg: TransferFromArgs,
) -> Result<u64, TransferFromError> {
    let res: Result<(Result<Nat, TransferFromError>,), _> =
        ic_cdk::call(ledger, "icrc2_transfer_from", (arg,)).await;
    match res {
        Ok((Ok(block_index),)) => Ok(block_index
            .0
            .to_u64()
            .expect("bug: block index does not fit in u64")),
        Ok((Err(err),)) => Err(err),
        Err((code, msg)) => Err(TransferFromError::GenericError {
            error_code: Nat::from(code as u64),
            message: msg,
        }),
    }
}
