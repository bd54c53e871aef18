//! Portfolio domain model.
//!
//! A portfolio holds a set of option legs plus at most one hedge position on
//! a futures/perpetual instrument of the same underlying. All deltas are kept
//! in units of underlying; balances are in quote currency.

mod store;

pub use store::{FilePortfolioStore, PortfolioStore, StoreError};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Contract kind of a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractKind {
    Option,
    Future,
    Perpetual,
}

/// Option type (call or put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

/// Settlement style of a linear-or-inverse contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStyle {
    Linear,
    Inverse,
}

/// A single position leg.
///
/// `quantity` is signed: long positive, short negative. For option legs the
/// strike/expiry/option_type triple is set; `last_mark`/`last_delta`/`last_iv`
/// are the most recent market observations and are refreshed on hedge fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegPosition {
    pub instrument: String,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub contract_kind: ContractKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strike: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_type: Option<OptionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mark: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_iv: Option<f64>,
    /// Set once the venue reports the instrument de-listed; an expired leg
    /// contributes zero delta and is excluded from warm-up coverage.
    #[serde(default)]
    pub expired: bool,
}

impl LegPosition {
    /// Create an option leg.
    pub fn option(
        instrument: impl Into<String>,
        quantity: Decimal,
        avg_entry_price: Decimal,
        option_type: OptionType,
        strike: Decimal,
        expiry: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            quantity,
            avg_entry_price,
            contract_kind: ContractKind::Option,
            strike: Some(strike),
            expiry: Some(expiry),
            option_type: Some(option_type),
            last_mark: None,
            last_delta: None,
            last_iv: None,
            expired: false,
        }
    }

    /// Create an empty futures/perpetual hedge leg.
    pub fn hedge(instrument: impl Into<String>, kind: ContractKind) -> Self {
        Self {
            instrument: instrument.into(),
            quantity: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            contract_kind: kind,
            strike: None,
            expiry: None,
            option_type: None,
            last_mark: None,
            last_delta: None,
            last_iv: None,
            expired: false,
        }
    }

    pub fn is_option(&self) -> bool {
        self.contract_kind == ContractKind::Option
    }
}

/// A portfolio of option legs with an optional hedge position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: String,
    pub underlying: String,
    /// Quote-currency cash balance; mutates with hedge cash flows and funding.
    pub balance: Decimal,
    pub positions: BTreeMap<String, LegPosition>,
    /// At most one hedge instrument per portfolio.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hedge_position: Option<LegPosition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Portfolio {
    pub fn new(id: impl Into<String>, underlying: impl Into<String>, balance: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            underlying: underlying.into(),
            balance,
            positions: BTreeMap::new(),
            hedge_position: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add or replace a leg.
    pub fn upsert_leg(&mut self, leg: LegPosition) {
        self.positions.insert(leg.instrument.clone(), leg);
    }

    pub fn remove_leg(&mut self, instrument: &str) -> Option<LegPosition> {
        self.positions.remove(instrument)
    }

    /// All instruments the portfolio needs market data for.
    pub fn instruments(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .positions
            .values()
            .filter(|leg| !leg.expired)
            .map(|leg| leg.instrument.clone())
            .collect();
        if let Some(hedge) = &self.hedge_position {
            names.push(hedge.instrument.clone());
        }
        names
    }

    /// Apply a hedge fill to the hedge position and balance.
    ///
    /// `quantity` is signed (buy positive). Cash accounting: a linear fill
    /// moves `quantity * avg_price` of quote currency out of the balance, an
    /// inverse fill moves `quantity / avg_price` in. Realized PnL thus flows
    /// through the balance without a separate ledger.
    pub fn apply_hedge_fill(
        &mut self,
        instrument: &str,
        kind: ContractKind,
        style: SettlementStyle,
        quantity: Decimal,
        avg_price: Decimal,
    ) {
        let hedge = self
            .hedge_position
            .get_or_insert_with(|| LegPosition::hedge(instrument, kind));

        let old_qty = hedge.quantity;
        let new_qty = old_qty + quantity;

        // Volume-weighted entry while adding; entry is kept when reducing and
        // reset once the position crosses or reaches zero.
        if old_qty.is_zero() || (old_qty.signum() == quantity.signum()) {
            let total_cost = old_qty * hedge.avg_entry_price + quantity * avg_price;
            hedge.avg_entry_price = if new_qty.is_zero() {
                Decimal::ZERO
            } else {
                total_cost / new_qty
            };
        } else if new_qty.is_zero() || new_qty.signum() != old_qty.signum() {
            hedge.avg_entry_price = if new_qty.is_zero() { Decimal::ZERO } else { avg_price };
        }
        hedge.quantity = new_qty;
        hedge.last_mark = Some(avg_price);

        match style {
            SettlementStyle::Linear => self.balance -= quantity * avg_price,
            SettlementStyle::Inverse => {
                if !avg_price.is_zero() {
                    self.balance += quantity / avg_price;
                }
            }
        }
    }

    /// Credit or debit a venue-reported funding settlement.
    pub fn apply_funding(&mut self, amount: Decimal) {
        self.balance += amount;
    }

    /// Mark a leg expired: zero its delta and exclude it from computation.
    pub fn expire_leg(&mut self, instrument: &str) -> bool {
        match self.positions.get_mut(instrument) {
            Some(leg) => {
                leg.expired = true;
                leg.last_delta = Some(0.0);
                true
            }
            None => false,
        }
    }
}
