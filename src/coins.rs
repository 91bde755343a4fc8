//! # Coin Selection and Fee Model
//!
//! Greedy accumulation in provider order, no waste minimisation. Fees are caller
//! supplied. Leftover value below a dust threshold is folded into the primary output
//! instead of paying for an uneconomical change output.

use log::debug;

use crate::error::{SwapError, SwapResult};
use crate::types::Utxo;

/// Result of covering a target amount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub utxos: Vec<Utxo>,
    pub total_sat: u64,
    pub target_sat: u64,
}

impl Selection {
    pub fn leftover_sat(&self) -> u64 {
        self.total_sat - self.target_sat
    }
}

/// How the leftover of a selection is paid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePlan {
    /// Nothing left over
    None,
    /// Added to the primary output
    Fold(u64),
    /// Paid to a separate change output
    Output(u64),
}

impl ChangePlan {
    /// Value added on top of the primary output
    pub fn folded_sat(&self) -> u64 {
        match self {
            ChangePlan::Fold(value) => *value,
            _ => 0,
        }
    }

    /// Value of the change output, if one is created
    pub fn change_output_sat(&self) -> Option<u64> {
        match self {
            ChangePlan::Output(value) => Some(*value),
            _ => None,
        }
    }
}

/// `amount + fee`, rejecting overflow
pub fn target(amount_sat: u64, fee_sat: u64) -> SwapResult<u64> {
    amount_sat
        .checked_add(fee_sat)
        .ok_or_else(|| SwapError::input("amount", "amount + fee overflows"))
}

/// Accumulate `utxos` in order until `target_sat` is covered.
pub fn select_coins(utxos: &[Utxo], target_sat: u64) -> SwapResult<Selection> {
    if target_sat == 0 {
        return Err(SwapError::input("amount", "target must be positive"));
    }

    let mut selected = Vec::new();
    let mut total: u64 = 0;
    for utxo in utxos {
        selected.push(*utxo);
        total = total.saturating_add(utxo.value_sat);
        if total >= target_sat {
            debug!(
                "Selected {} of {} UTXOs: {} sats for target {}",
                selected.len(),
                utxos.len(),
                total,
                target_sat
            );
            return Ok(Selection {
                utxos: selected,
                total_sat: total,
                target_sat,
            });
        }
    }

    Err(SwapError::InsufficientFunds {
        required: target_sat,
        available: total,
        shortfall: target_sat - total,
    })
}

/// Decide where `leftover_sat` goes given a dust threshold.
pub fn settle_change(leftover_sat: u64, dust_threshold_sat: u64) -> ChangePlan {
    match leftover_sat {
        0 => ChangePlan::None,
        v if v < dust_threshold_sat => ChangePlan::Fold(v),
        v => ChangePlan::Output(v),
    }
}

/// Fee UTXOs must cover the fee on their own; returns the leftover.
pub fn cover_fee(fee_utxos: &[Utxo], fee_sat: u64) -> SwapResult<u64> {
    let total = fee_utxos
        .iter()
        .try_fold(0u64, |acc, u| acc.checked_add(u.value_sat))
        .ok_or_else(|| SwapError::input("fee_utxos", "total value overflows"))?;
    if total < fee_sat {
        return Err(SwapError::InsufficientFunds {
            required: fee_sat,
            available: total,
            shortfall: fee_sat - total,
        });
    }
    Ok(total - fee_sat)
}
