use crate::numeric::{Collateral, Ratio, KUSD};
use crate::tick::NodeId;
use candid::{CandidType, Principal};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single collateralized-debt position. Share counts only change when the
/// position itself is touched; global index bumps and tick-wide settlements
/// reprice it without writing to this record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub position_id: u64,
    pub owner: Principal,
    pub collateral_shares: Decimal,
    pub debt_shares: Decimal,
    /// Tree node the shares were last deposited into; `None` once the
    /// position holds no shares.
    pub node_id: Option<NodeId>,
}

impl Position {
    pub fn is_closed(&self) -> bool {
        self.collateral_shares == Decimal::ZERO && self.debt_shares == Decimal::ZERO
    }
}

/// Candid-facing snapshot of a position priced at the current indexes.
#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionView {
    pub position_id: u64,
    pub owner: Principal,
    pub collateral: Collateral,
    pub debt: KUSD,
    pub debt_ratio: Ratio,
    pub tick: i32,
}
