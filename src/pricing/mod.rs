//! Option pricing capability.
//!
//! The hedging engine prefers venue-supplied greeks from the ticker stream;
//! the [`Pricer`] trait is the fallback for legs whose tick did not carry a
//! delta. The default implementation is Black-Scholes (Black-76 on a forward
//! equal to spot when the rate is zero), which is how Deribit marks options.

use crate::portfolio::OptionType;

/// Inputs to a single price/delta evaluation.
#[derive(Debug, Clone, Copy)]
pub struct PricingInputs {
    /// Spot (underlying index) price.
    pub spot: f64,
    pub strike: f64,
    /// Time to expiry in years; non-positive means expired.
    pub years_to_expiry: f64,
    /// Annualized implied volatility as a fraction (0.8 = 80%).
    pub volatility: f64,
    pub risk_free_rate: f64,
    pub option_type: OptionType,
}

/// Capability interface for pricing a vanilla option.
pub trait Pricer: Send + Sync {
    /// Returns `(price, delta)`, both per contract in quote terms of the
    /// pricing model (delta in units of underlying per contract).
    fn price_and_delta(&self, inputs: &PricingInputs) -> (f64, f64);
}

/// Black-Scholes pricer.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlackScholesPricer;

impl Pricer for BlackScholesPricer {
    fn price_and_delta(&self, inputs: &PricingInputs) -> (f64, f64) {
        let PricingInputs {
            spot: s,
            strike: k,
            years_to_expiry: t,
            volatility: sigma,
            risk_free_rate: r,
            option_type,
        } = *inputs;

        // Expired or degenerate inputs collapse to intrinsic value and a
        // step delta.
        if t <= 0.0 || sigma <= 0.0 || s <= 0.0 || k <= 0.0 {
            return intrinsic(s, k, option_type);
        }

        let sqrt_t = t.sqrt();
        let d1 = ((s / k).ln() + (r + 0.5 * sigma * sigma) * t) / (sigma * sqrt_t);
        let d2 = d1 - sigma * sqrt_t;
        let discount = (-r * t).exp();

        match option_type {
            OptionType::Call => {
                let price = s * norm_cdf(d1) - k * discount * norm_cdf(d2);
                (price, norm_cdf(d1))
            }
            OptionType::Put => {
                let price = k * discount * norm_cdf(-d2) - s * norm_cdf(-d1);
                (price, norm_cdf(d1) - 1.0)
            }
        }
    }
}

fn intrinsic(s: f64, k: f64, option_type: OptionType) -> (f64, f64) {
    match option_type {
        OptionType::Call => {
            if s > k {
                (s - k, 1.0)
            } else {
                (0.0, 0.0)
            }
        }
        OptionType::Put => {
            if s < k {
                (k - s, -1.0)
            } else {
                (0.0, 0.0)
            }
        }
    }
}

/// Standard normal CDF.
fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Abramowitz & Stegun 7.1.26 rational approximation, |error| < 1.5e-7.
fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}
