//! External collaborators the engine is driven by or drives: the network
//! handle (chain tip, event fan-out) and the header-chain lookup used by
//! reorg undo. Wire transport itself is out of scope.

use std::cell::Cell;

use bitcoin::Txid;

use crate::model::MinedInfo;

thread_local! {
    static LOCAL_HEIGHT: Cell<Option<i32>> = const { Cell::new(None) };
}

/// The engine's view of the network layer: current chain tip and outbound
/// event fan-out. A concrete implementation owns the Electrum-style
/// connection; none of that is this crate's concern.
pub trait NetworkHandle: Send + Sync {
    fn get_local_height(&self) -> i32;

    /// Fired after `add_verified_tx` installs a new verified status.
    fn trigger_verified(&self, txid: Txid, info: &MinedInfo) {
        let _ = (txid, info);
    }

    /// Fired on up-to-date transitions.
    fn trigger_status(&self, up_to_date: bool) {
        let _ = up_to_date;
    }
}

/// Header-chain lookup used by [`crate::verify`]'s reorg handling; kept
/// separate from [`NetworkHandle`] since only reorg undo needs it.
pub trait Chain {
    /// Hash of the header at `height`, or `None` if the chain has no header
    /// there (e.g. it has been reorged away without a replacement yet).
    fn header_hash_at(&self, height: i32) -> Option<[u8; 32]>;
}

/// RAII guard caching `local_height` for the current thread so a batch of
/// queries pays one round-trip through [`NetworkHandle::get_local_height`].
/// Nested guards restore the previous value on drop, so nested decorated
/// calls stack correctly instead of clobbering an outer cache.
pub struct LocalHeightGuard {
    previous: Option<i32>,
}

impl LocalHeightGuard {
    pub fn enter(network: &dyn NetworkHandle) -> Self {
        let previous =
            LOCAL_HEIGHT.with(|cell| cell.replace(Some(network.get_local_height())));
        LocalHeightGuard { previous }
    }
}

impl Drop for LocalHeightGuard {
    fn drop(&mut self) {
        LOCAL_HEIGHT.with(|cell| cell.set(self.previous));
    }
}

/// Read the cached local height, falling back to a direct call if no guard
/// is currently active for this thread.
pub fn cached_local_height(network: &dyn NetworkHandle) -> i32 {
    let cached = LOCAL_HEIGHT.with(|cell| cell.get());
    match cached {
        Some(height) => height,
        None => network.get_local_height(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedHeight(i32);
    impl NetworkHandle for FixedHeight {
        fn get_local_height(&self) -> i32 {
            self.0
        }
    }

    #[test]
    fn guard_caches_and_restores_on_drop() {
        let net = FixedHeight(100);
        assert_eq!(cached_local_height(&net), 100);
        {
            let _guard = LocalHeightGuard::enter(&net);
            assert_eq!(cached_local_height(&FixedHeight(999)), 100);
        }
        // no guard active: falls back to a direct call again.
        assert_eq!(cached_local_height(&FixedHeight(5)), 5);
    }

    #[test]
    fn nested_guards_restore_previous_value() {
        let outer = FixedHeight(10);
        let inner = FixedHeight(20);
        let _outer_guard = LocalHeightGuard::enter(&outer);
        assert_eq!(cached_local_height(&outer), 10);
        {
            let _inner_guard = LocalHeightGuard::enter(&inner);
            assert_eq!(cached_local_height(&inner), 20);
        }
        assert_eq!(cached_local_height(&outer), 10);
    }
}
