//! European call pricing payloads.

/// Number of time steps in the binomial tree.
pub const NUM_STEPS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionPricing {
    pub spot_price: f64,
    pub strike_price: f64,
    pub time_to_maturity: f64,
    pub risk_free_rate: f64,
    pub volatility: f64,
}

impl Default for OptionPricing {
    fn default() -> Self {
        Self {
            spot_price: 100.0,
            strike_price: 100.0,
            time_to_maturity: 1.0,
            risk_free_rate: 0.05,
            volatility: 0.2,
        }
    }
}

/// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    const P: f64 = 0.327_591_1;
    const A: [f64; 5] = [
        0.254_829_592,
        -0.284_496_736,
        1.421_413_741,
        -1.453_152_027,
        1.061_405_429,
    ];

    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = A.iter().rev().fold(0.0, |acc, &a| acc * t + a) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

/// Standard normal cumulative distribution.
pub fn standard_normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

pub fn black_scholes_european(data: &OptionPricing) -> f64 {
    let sqrt_t = data.time_to_maturity.sqrt();
    let d1 = ((data.spot_price / data.strike_price).ln()
        + (data.risk_free_rate + data.volatility.powi(2) / 2.0) * data.time_to_maturity)
        / (data.volatility * sqrt_t);
    let d2 = d1 - data.volatility * sqrt_t;
    data.spot_price * standard_normal_cdf(d1)
        - data.strike_price
            * (-data.risk_free_rate * data.time_to_maturity).exp()
            * standard_normal_cdf(d2)
}

/// Cox-Ross-Rubinstein tree with [`NUM_STEPS`] steps.
pub fn binomial_european(data: &OptionPricing) -> f64 {
    let dt = data.time_to_maturity / NUM_STEPS as f64;
    let discount = (-data.risk_free_rate * dt).exp();
    let up = (data.volatility * dt.sqrt()).exp();
    let down = 1.0 / up;
    let p_up = ((data.risk_free_rate * dt).exp() - down) / (up - down);

    let mut tree = [0.0f64; NUM_STEPS + 1];
    for (i, node) in tree.iter_mut().enumerate() {
        let spot = data.spot_price * up.powi((NUM_STEPS - i) as i32) * down.powi(i as i32);
        *node = (spot - data.strike_price).max(0.0);
    }

    for step in (0..NUM_STEPS).rev() {
        for j in 0..=step {
            tree[j] = discount * (p_up * tree[j] + (1.0 - p_up) * tree[j + 1]);
        }
    }
    tree[0]
}

/// Small xorshift generator for reproducible market data.
pub struct MarketData {
    state: u64,
}

impl MarketData {
    pub fn new(seed: u64) -> Self {
        Self { state: seed | 1 }
    }

    fn next_unit(&mut self) -> f64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 11) as f64 / (1u64 << 53) as f64
    }

    fn uniform(&mut self, min: f64, max: f64) -> f64 {
        min + (max - min) * self.next_unit()
    }

    pub fn next_option(&mut self) -> OptionPricing {
        OptionPricing {
            spot_price: self.uniform(50.0, 200.0),
            strike_price: self.uniform(50.0, 200.0),
            time_to_maturity: self.uniform(0.25, 2.0),
            risk_free_rate: self.uniform(0.01, 0.1),
            volatility: self.uniform(0.1, 0.5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_normal_cdf() {
        assert!((standard_normal_cdf(0.0) - 0.5).abs() < 1e-9);
        assert!((standard_normal_cdf(1.96) - 0.975).abs() < 1e-3);
        assert!((standard_normal_cdf(-1.96) - 0.025).abs() < 1e-3);
    }

    #[test]
    fn test_black_scholes_reference_value() {
        let price = black_scholes_european(&OptionPricing::default());
        assert!((price - 10.4506).abs() < 1e-3, "got {price}");
    }

    #[test]
    fn test_binomial_close_to_black_scholes() {
        let data = OptionPricing::default();
        let tree = binomial_european(&data);
        let closed = black_scholes_european(&data);
        assert!((tree - closed).abs() < 0.5, "tree {tree}, closed form {closed}");
    }

    #[test]
    fn test_prices_respect_lower_bound() {
        let mut market = MarketData::new(7);
        for _ in 0..1000 {
            let data = market.next_option();
            let bound = (data.spot_price
                - data.strike_price * (-data.risk_free_rate * data.time_to_maturity).exp())
            .max(0.0);
            assert!(black_scholes_european(&data) >= bound - 1e-3);
            assert!(binomial_european(&data) >= bound - 1e-6);
        }
    }

    #[test]
    fn test_market_data_ranges() {
        let mut market = MarketData::new(42);
        for _ in 0..1000 {
            let data = market.next_option();
            assert!((50.0..200.0).contains(&data.spot_price));
            assert!((0.1..0.5).contains(&data.volatility));
        }
    }
}
