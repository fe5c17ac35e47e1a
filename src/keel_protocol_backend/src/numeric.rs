//! Typed fixed-point amounts used across the protocol.
//!
//! Raw token amounts (`Collateral`, `KUSD`) are `u64` e8s at the API edge;
//! all ratios, prices and intermediate math use `rust_decimal::Decimal`.
//! Conversions back to e8s state the rounding direction explicitly: round
//! down when the protocol pays out, round up when the protocol charges.

use candid::types::{Serializer, Type, TypeInner};
use candid::CandidType;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};

pub const E8S: u64 = 100_000_000;

macro_rules! amount_type {
    ($name:ident) => {
        #[derive(
            CandidType,
            Clone,
            Copy,
            Debug,
            Default,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize,
        )]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub fn to_u64(self) -> u64 {
                self.0
            }

            /// The amount as a Decimal in e8s units.
            pub fn to_decimal(self) -> Decimal {
                Decimal::from_u64(self.0).expect("bug: u64 always fits in Decimal")
            }

            /// Protocol pays out: round down.
            pub fn from_decimal_floor(value: Decimal) -> Self {
                debug_assert!(value >= Decimal::ZERO);
                Self(value.floor().to_u64().expect("bug: amount overflows u64"))
            }

            /// Protocol charges: round up.
            pub fn from_decimal_ceil(value: Decimal) -> Self {
                debug_assert!(value >= Decimal::ZERO);
                Self(value.ceil().to_u64().expect("bug: amount overflows u64"))
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl Add for $name {
            type Output = Self;
            fn add(self, rhs: Self) -> Self {
                Self(self.0.checked_add(rhs.0).expect("bug: amount overflow"))
            }
        }

        impl Sub for $name {
            type Output = Self;
            fn sub(self, rhs: Self) -> Self {
                Self(self.0.checked_sub(rhs.0).expect("bug: amount underflow"))
            }
        }

        impl AddAssign for $name {
            fn add_assign(&mut self, rhs: Self) {
                *self = *self + rhs;
            }
        }

        impl SubAssign for $name {
            fn sub_assign(&mut self, rhs: Self) {
                *self = *self - rhs;
            }
        }

        impl Sum for $name {
            fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
                iter.fold(Self(0), |acc, x| acc + x)
            }
        }

        impl PartialEq<u64> for $name {
            fn eq(&self, other: &u64) -> bool {
                self.0 == *other
            }
        }

        impl PartialOrd<u64> for $name {
            fn partial_cmp(&self, other: &u64) -> Option<std::cmp::Ordering> {
                self.0.partial_cmp(other)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

amount_type!(Collateral);
amount_type!(KUSD);

macro_rules! decimal_type {
    ($name:ident) => {
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Decimal);

        impl $name {
            pub const fn new(value: Decimal) -> Self {
                Self(value)
            }

            pub fn to_f64(self) -> f64 {
                self.0.to_f64().unwrap_or(f64::NAN)
            }
        }

        impl From<Decimal> for $name {
            fn from(value: Decimal) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        // Candid has no decimal type; encode as text, matching the serde
        // string representation used by the stable event log.
        impl CandidType for $name {
            fn _ty() -> Type {
                TypeInner::Text.into()
            }
            fn idl_serialize<S>(&self, serializer: S) -> Result<(), S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_text(&self.0.to_string())
            }
        }
    };
}

decimal_type!(Ratio);
decimal_type!(Price);

impl Mul<Ratio> for KUSD {
    type Output = KUSD;
    fn mul(self, rhs: Ratio) -> KUSD {
        KUSD::from_decimal_ceil(self.to_decimal() * rhs.0)
    }
}

impl Mul<Ratio> for Collateral {
    type Output = Collateral;
    fn mul(self, rhs: Ratio) -> Collateral {
        Collateral::from_decimal_ceil(self.to_decimal() * rhs.0)
    }
}

impl Div<Ratio> for KUSD {
    type Output = KUSD;
    fn div(self, rhs: Ratio) -> KUSD {
        assert!(rhs.0 > Decimal::ZERO, "bug: division by zero ratio");
        KUSD::from_decimal_floor(self.to_decimal() / rhs.0)
    }
}

impl Mul<Price> for Collateral {
    type Output = KUSD;
    fn mul(self, rhs: Price) -> KUSD {
        KUSD::from_decimal_floor(self.to_decimal() * rhs.0)
    }
}

/// Oracle price snapshot for one collateral token, as e8s scalars:
/// multiplying a collateral amount in e8s by a [Price] yields a kUSD value
/// in e8s. `min <= anchor <= max`.
#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTriple {
    pub anchor: Price,
    pub min: Price,
    pub max: Price,
}

impl PriceTriple {
    /// Builds the triple from a whole-token USD quote and a symmetric spread,
    /// normalizing for the collateral token's decimal precision: one raw
    /// collateral unit is worth `usd_per_token * 10^8 / 10^decimals` kUSD e8s.
    pub fn from_quote(usd_per_token: Decimal, spread: Ratio, decimals: u8) -> Self {
        assert!(spread.0 >= Decimal::ZERO && spread.0 < Decimal::ONE);
        let token_scale = Decimal::from_u64(10u64.pow(decimals as u32))
            .expect("bug: decimal precision out of range");
        let e8s = Decimal::from_u64(E8S).expect("bug: e8s constant");
        let anchor = usd_per_token * e8s / token_scale;
        Self {
            anchor: Price(anchor),
            min: Price(anchor * (Decimal::ONE - spread.0)),
            max: Price(anchor * (Decimal::ONE + spread.0)),
        }
    }

    /// Identity-spread triple around a single scalar, used by tests and by
    /// pools whose oracle publishes no confidence band.
    pub fn flat(price: Price) -> Self {
        Self {
            anchor: price,
            min: price,
            max: price,
        }
    }
}

/// Debt ratio of raw amounts at a given price: `debt / (collateral * price)`.
/// Returns zero when there is no debt and `Decimal::MAX` when debt exists
/// against zero collateral value.
pub fn debt_ratio(debt_raw: Decimal, coll_raw: Decimal, price: Price) -> Ratio {
    if debt_raw <= Decimal::ZERO {
        return Ratio(Decimal::ZERO);
    }
    let coll_value = coll_raw * price.0;
    if coll_value <= Decimal::ZERO {
        return Ratio(Decimal::MAX);
    }
    Ratio(debt_raw / coll_value)
}
