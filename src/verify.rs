//! Verification coordinator (C6): unverified/verified transitions, reorg
//! undo, and confirmation-count computation.

use bitcoin::Txid;
use log::info;

use crate::constants::{is_mempool_height, HEIGHT_LOCAL};
use crate::engine::{Engine, PrimaryState};
use crate::model::MinedInfo;
use crate::network::Chain;
use crate::storage::Storage;

impl<S: Storage> Engine<S> {
    /// Record `txid` as pending SPV proof at `height`. A height `<= 0` means
    /// "do not verify" (mempool); `> 0` is the claimed block height to prove.
    /// Demotes an already-verified tx if the server now reports it unmined.
    pub fn add_unverified_tx(&self, txid: Txid, height: i32) {
        let mut primary = self.lock_primary();
        add_unverified_tx_locked(&mut primary, txid, height);
    }

    /// Compare-and-swap removal: only removes if the stored height still
    /// equals `height`, so a concurrent re-announcement at a different
    /// height isn't clobbered.
    pub fn remove_unverified_tx(&self, txid: Txid, height: i32) {
        let mut primary = self.lock_primary();
        if primary.unverified_tx.get(&txid) == Some(&height) {
            primary.unverified_tx.remove(&txid);
        }
    }

    pub fn add_verified_tx(&self, txid: Txid, info: MinedInfo) {
        let mut primary = self.lock_primary();
        primary.unverified_tx.remove(&txid);
        primary.verified_tx.insert(txid, info);
        drop(primary);
        self.network.trigger_verified(txid, &info);
    }

    /// On reorg from `height`: for every verified tx at `>= height`,
    /// re-check its header against `chain`; demote to unverified *at the
    /// same height* if the header is missing or no longer matches.
    pub fn undo_verifications(&self, chain: &dyn Chain, height: i32) {
        let mut primary = self.lock_primary();
        let stale: Vec<(Txid, i32)> = primary
            .verified_tx
            .iter()
            .filter(|(_, info)| info.height >= height)
            .filter(|(_, info)| chain.header_hash_at(info.height) != info.header_hash)
            .map(|(txid, info)| (*txid, info.height))
            .collect();

        for (txid, old_height) in stale {
            primary.verified_tx.remove(&txid);
            // Keep the old height: if the fork re-mines at the same height,
            // nothing else will re-trigger verification at a new one, so a
            // pending claim needs to already sit there. A genuinely new
            // height arrives via the next status update and overwrites this.
            primary.unverified_tx.insert(txid, old_height);
            info!("demoted {txid} to unverified at height {old_height} on reorg");
        }
    }

    pub fn get_tx_height(&self, txid: Txid) -> MinedInfo {
        let local_height = self.local_height();
        let primary = self.lock_primary();
        get_tx_height_locked(&primary, txid, local_height)
    }

    pub fn get_unverified_txs(&self) -> std::collections::HashMap<Txid, i32> {
        self.lock_primary().unverified_tx.clone()
    }
}

pub(crate) fn add_unverified_tx_locked(primary: &mut PrimaryState, txid: Txid, height: i32) {
    let is_verified = primary.verified_tx.contains_key(&txid);
    if is_verified && !is_mempool_height(height) {
        // Already verified and the new report isn't a demotion to mempool:
        // a pure no-op, preserving the verified/unverified disjointness.
        return;
    }
    if is_verified {
        primary.verified_tx.remove(&txid);
    }
    primary.unverified_tx.insert(txid, height);
}

pub(crate) fn get_tx_height_locked(primary: &PrimaryState, txid: Txid, local_height: i32) -> MinedInfo {
    if let Some(info) = primary.verified_tx.get(&txid) {
        let mut info = *info;
        info.conf = Some((local_height - info.height + 1).max(0) as u32);
        return info;
    }
    if let Some(height) = primary.unverified_tx.get(&txid) {
        return MinedInfo {
            height: *height,
            conf: Some(0),
            timestamp: None,
            txpos: None,
            header_hash: None,
        };
    }
    MinedInfo {
        height: HEIGHT_LOCAL,
        conf: Some(0),
        timestamp: None,
        txpos: None,
        header_hash: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use std::sync::Arc;

    fn txid(byte: u8) -> Txid {
        Txid::from_byte_array([byte; 32])
    }

    #[test]
    fn unknown_tx_reports_local_height() {
        let primary = PrimaryState::default();
        let info = get_tx_height_locked(&primary, txid(1), 100);
        assert_eq!(info.height, HEIGHT_LOCAL);
        assert_eq!(info.conf, Some(0));
    }

    #[test]
    fn verified_tx_computes_confirmations() {
        let mut primary = PrimaryState::default();
        primary.verified_tx.insert(
            txid(2),
            MinedInfo {
                height: 700,
                conf: None,
                timestamp: None,
                txpos: None,
                header_hash: Some([1; 32]),
            },
        );
        let info = get_tx_height_locked(&primary, txid(2), 710);
        assert_eq!(info.conf, Some(11));
    }

    #[test]
    fn add_unverified_demotes_verified_mempool_report() {
        let mut primary = PrimaryState::default();
        primary.verified_tx.insert(
            txid(3),
            MinedInfo {
                height: 700,
                conf: None,
                timestamp: None,
                txpos: None,
                header_hash: Some([1; 32]),
            },
        );
        add_unverified_tx_locked(&mut primary, txid(3), 0);
        assert!(!primary.verified_tx.contains_key(&txid(3)));
        assert_eq!(primary.unverified_tx.get(&txid(3)), Some(&0));
    }

    struct NoHeader;
    impl Chain for NoHeader {
        fn header_hash_at(&self, _height: i32) -> Option<[u8; 32]> {
            None
        }
    }

    struct OtherHeader;
    impl Chain for OtherHeader {
        fn header_hash_at(&self, _height: i32) -> Option<[u8; 32]> {
            Some([2; 32])
        }
    }

    #[test]
    fn reorg_demotes_when_header_mismatches() {
        struct Net;
        impl crate::network::NetworkHandle for Net {
            fn get_local_height(&self) -> i32 {
                0
            }
        }
        let engine = Engine::new(
            crate::config::EngineConfig::new(bitcoin::Network::Bitcoin),
            crate::storage::InMemoryStorage::new(),
            Arc::new(Net),
        );
        engine.add_verified_tx(
            txid(7),
            MinedInfo {
                height: 700,
                conf: None,
                timestamp: None,
                txpos: None,
                header_hash: Some([1; 32]),
            },
        );
        engine.undo_verifications(&OtherHeader, 700);
        let info = engine.get_tx_height(txid(7));
        assert_eq!(info.conf, Some(0));
        assert_eq!(info.height, 700);

        engine.add_verified_tx(
            txid(8),
            MinedInfo {
                height: 700,
                conf: None,
                timestamp: None,
                txpos: None,
                header_hash: Some([1; 32]),
            },
        );
        engine.undo_verifications(&NoHeader, 700);
        assert_eq!(engine.get_tx_height(txid(8)).height, 700);
    }
}
