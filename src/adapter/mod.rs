//! Oracle adapters
//!
//! An adapter describes which aggregated symbols an oracle needs and how to
//! shape them into the oracle's answer format. Adapter kinds are a tagged
//! enum dispatched through one `compute` match; new kinds become new
//! variants, not new registry wiring.

use ethers::types::U256;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;

use crate::config::OracleSpec;
use crate::types::OracleKey;

/// One oracle's answer computed from aggregated CEX prices
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterOutput {
    /// Answer in quote-currency units
    pub answer: f64,
    /// `scale_factor * round(answer * 10^decimals)` — the 1e36 common base
    /// that makes answers comparable across oracles of differing decimals
    pub fixed_point: U256,
}

/// How an oracle's answer is derived from aggregated symbols
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adapter {
    /// Answer is one aggregated symbol, passed through
    SingleFeed { symbol: String },
}

impl Adapter {
    /// Aggregated symbols this adapter needs as input
    pub fn required_symbols(&self) -> Vec<String> {
        match self {
            Adapter::SingleFeed { symbol } => vec![symbol.clone()],
        }
    }

    /// Shape aggregated prices into the oracle's answer format.
    ///
    /// Returns None when a required symbol is missing or the fixed-point
    /// conversion cannot be represented.
    pub fn compute(
        &self,
        prices: &HashMap<String, f64>,
        decimals: u32,
        scale_factor: U256,
    ) -> Option<AdapterOutput> {
        match self {
            Adapter::SingleFeed { symbol } => {
                let answer = *prices.get(symbol)?;
                let fixed_point = to_fixed_point(answer, decimals, scale_factor)?;
                Some(AdapterOutput {
                    answer,
                    fixed_point,
                })
            }
        }
    }
}

/// Lift a float answer into the common fixed-point base. The decimal scaling
/// runs through `Decimal` so the rounding step is exact, then widens to U256.
fn to_fixed_point(answer: f64, decimals: u32, scale_factor: U256) -> Option<U256> {
    let answer = Decimal::from_f64(answer)?;
    let factor = Decimal::from_u128(10u128.checked_pow(decimals)?)?;
    let native = answer
        .checked_mul(factor)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u128()?;
    U256::from(native).checked_mul(scale_factor)
}

/// Resolution of an oracle key to its adapter
#[derive(Debug, Clone)]
pub struct ResolvedAdapter {
    pub adapter: Adapter,
    /// False when this is the default fallback — treat as unverified and add
    /// an explicit entry before relying on it in production
    pub explicit: bool,
}

/// Static `(chain_id, oracle_addr) -> Adapter` lookup
#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    entries: HashMap<OracleKey, Adapter>,
    default_symbol: String,
}

impl AdapterRegistry {
    pub fn new(default_symbol: String) -> Self {
        Self {
            entries: HashMap::new(),
            default_symbol,
        }
    }

    /// Build the registry from configured oracles: each gets a single-feed
    /// adapter on its configured symbol.
    pub fn from_specs(specs: &[OracleSpec], default_symbol: String) -> anyhow::Result<Self> {
        let mut registry = Self::new(default_symbol);
        for spec in specs {
            registry.insert(
                (spec.chain_id, spec.address()?),
                Adapter::SingleFeed {
                    symbol: spec.symbol.clone(),
                },
            );
        }
        Ok(registry)
    }

    pub fn insert(&mut self, key: OracleKey, adapter: Adapter) {
        self.entries.insert(key, adapter);
    }

    /// Adapter for an oracle, falling back to a single feed on the baseline
    /// symbol when no explicit entry exists.
    pub fn resolve(&self, chain_id: u64, oracle_addr: ethers::types::Address) -> ResolvedAdapter {
        match self.entries.get(&(chain_id, oracle_addr)) {
            Some(adapter) => ResolvedAdapter {
                adapter: adapter.clone(),
                explicit: true,
            },
            None => ResolvedAdapter {
                adapter: Adapter::SingleFeed {
                    symbol: self.default_symbol.clone(),
                },
                explicit: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Address;

    fn prices(symbol: &str, price: f64) -> HashMap<String, f64> {
        HashMap::from([(symbol.to_string(), price)])
    }

    #[test]
    fn single_feed_requires_its_symbol() {
        let adapter = Adapter::SingleFeed {
            symbol: "BTCUSDC".to_string(),
        };
        assert_eq!(adapter.required_symbols(), vec!["BTCUSDC".to_string()]);
        assert!(adapter
            .compute(&prices("ETHUSDC", 3_000.0), 8, U256::exp10(28))
            .is_none());
    }

    #[test]
    fn fixed_point_scales_to_common_base() {
        let adapter = Adapter::SingleFeed {
            symbol: "BTCUSDC".to_string(),
        };
        let out = adapter
            .compute(&prices("BTCUSDC", 65_000.123_456_78), 8, U256::exp10(28))
            .unwrap();

        // 1e28 * round(65000.12345678 * 1e8)
        let expected =
            U256::from_dec_str("65000123456780000000000000000000000000000").unwrap();
        assert_eq!(out.fixed_point, expected);
        assert_eq!(out.answer, 65_000.123_456_78);
    }

    #[test]
    fn fixed_point_rounds_the_native_answer() {
        let adapter = Adapter::SingleFeed {
            symbol: "BTCUSDC".to_string(),
        };
        // 100.000000006 * 1e8 = 10000000000.6 -> rounds up
        let out = adapter
            .compute(&prices("BTCUSDC", 100.000_000_006), 8, U256::one())
            .unwrap();
        assert_eq!(out.fixed_point, U256::from(10_000_000_001u64));
    }

    #[test]
    fn registry_falls_back_unverified() {
        let oracle: Address = "0x6ce185860a4963106506c203335a2910413708e9".parse().unwrap();
        let mut registry = AdapterRegistry::new("BTCUSDC".to_string());

        let fallback = registry.resolve(42161, oracle);
        assert!(!fallback.explicit);
        assert_eq!(
            fallback.adapter.required_symbols(),
            vec!["BTCUSDC".to_string()]
        );

        registry.insert(
            (42161, oracle),
            Adapter::SingleFeed {
                symbol: "ETHUSDC".to_string(),
            },
        );
        let resolved = registry.resolve(42161, oracle);
        assert!(resolved.explicit);
        assert_eq!(
            resolved.adapter.required_symbols(),
            vec!["ETHUSDC".to_string()]
        );
    }
}
