//! Height sentinels and other fixed parameters shared across the engine.

/// A transaction created locally by the wallet and not yet broadcast.
pub const HEIGHT_LOCAL: i32 = -2;
/// A mempool transaction whose unconfirmed parent makes its own status unclear.
pub const HEIGHT_UNCONF_PARENT: i32 = -1;
/// A transaction seen in the mempool with no confirmations yet.
pub const HEIGHT_UNCONFIRMED: i32 = 0;

/// Number of additional confirmations a coinbase output needs before it is spendable.
pub const COINBASE_MATURITY: i32 = 100;

/// True for heights that mean "in the mempool" (unconfirmed, with or without unconfirmed parents).
pub fn is_mempool_height(height: i32) -> bool {
    height == HEIGHT_UNCONFIRMED || height == HEIGHT_UNCONF_PARENT
}
