use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::constants::COINBASE_MATURITY;

/// Static configuration for an [`crate::engine::Engine`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub network: Network,

    /// Confirmations a coinbase output needs before `get_addr_balance` stops
    /// treating it as immature. Overridable for networks with different
    /// maturity rules (e.g. regtest chains used in tests).
    #[serde(default = "default_coinbase_maturity")]
    pub coinbase_maturity: i32,
}

fn default_coinbase_maturity() -> i32 {
    COINBASE_MATURITY
}

impl EngineConfig {
    pub fn new(network: Network) -> Self {
        EngineConfig {
            network,
            coinbase_maturity: COINBASE_MATURITY,
        }
    }
}
