//! Persistence (C1): snapshot primary and derived state to the pluggable
//! `Storage`, and run the cleanup passes on load that repair drift between
//! the persisted index and the persisted transaction set.

use std::collections::{HashMap, HashSet};

use bitcoin::{Network, Txid};
use log::{info, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::model::{MinedInfo, Transaction};
use crate::storage::Storage;

const KEY_TRANSACTIONS: &str = "transactions";
const KEY_TXI: &str = "txi";
const KEY_TXO: &str = "txo";
const KEY_TX_FEES: &str = "tx_fees";
const KEY_ADDR_HISTORY: &str = "addr_history";
const KEY_SPENT_OUTPOINTS: &str = "spent_outpoints";
const KEY_VERIFIED_TX3: &str = "verified_tx3";
const KEY_STORED_HEIGHT: &str = "stored_height";

type TxiSnapshot = HashMap<Txid, HashMap<String, HashSet<(String, u64)>>>;
type TxoSnapshot = HashMap<Txid, HashMap<String, Vec<(u32, u64, bool)>>>;
type SpentOutpointsSnapshot = HashMap<Txid, HashMap<u32, Txid>>;
type VerifiedTx3Snapshot = HashMap<Txid, (i32, Option<u64>, Option<u32>, Option<[u8; 32]>)>;

pub fn save<S: Storage>(engine: &Engine<S>) -> Result<()> {
    let primary = engine.lock_primary();
    let index = engine.lock_index();

    let tx_hex: HashMap<Txid, String> = index
        .transactions
        .iter()
        .map(|(txid, tx)| (*txid, tx.to_raw_hex()))
        .collect();
    engine.storage.put(KEY_TRANSACTIONS, &tx_hex)?;
    engine.storage.put(KEY_TXI, &index.txi)?;
    engine.storage.put(KEY_TXO, &index.txo)?;
    engine.storage.put(KEY_TX_FEES, &index.tx_fees)?;
    engine.storage.put(KEY_SPENT_OUTPOINTS, &index.spent_outpoints)?;
    engine.storage.put(KEY_ADDR_HISTORY, &primary.history)?;

    let verified: VerifiedTx3Snapshot = primary
        .verified_tx
        .iter()
        .map(|(txid, info)| (*txid, (info.height, info.timestamp, info.txpos, info.header_hash)))
        .collect();
    engine.storage.put(KEY_VERIFIED_TX3, &verified)?;
    engine.storage.put(KEY_STORED_HEIGHT, &engine.local_height())?;

    drop(index);
    drop(primary);
    engine.storage.write()?;
    info!("flushed engine state to storage");
    Ok(())
}

/// Load persisted state against addresses already registered via
/// [`Engine::add_address`], running the cleanup passes: drop history for
/// addresses the caller hasn't registered as owned, re-ingest transactions
/// whose body survived but whose index entries didn't, and drop anything
/// left unreferenced or a local-only stub with no surviving body.
pub fn load<S: Storage>(engine: &Engine<S>, network: Network) -> Result<()> {
    let tx_hex: HashMap<Txid, String> = engine.storage.get_or_default(KEY_TRANSACTIONS)?;
    let txi: TxiSnapshot = engine.storage.get_or_default(KEY_TXI)?;
    let txo: TxoSnapshot = engine.storage.get_or_default(KEY_TXO)?;
    let tx_fees: HashMap<Txid, i64> = engine.storage.get_or_default(KEY_TX_FEES)?;
    let spent_outpoints: SpentOutpointsSnapshot = engine.storage.get_or_default(KEY_SPENT_OUTPOINTS)?;
    let history: HashMap<String, Vec<(Txid, i32)>> = engine.storage.get_or_default(KEY_ADDR_HISTORY)?;
    let verified: VerifiedTx3Snapshot = engine.storage.get_or_default(KEY_VERIFIED_TX3)?;

    let mut all_bodies = HashMap::new();
    for (txid, hex) in &tx_hex {
        match Transaction::from_raw_hex(hex, network) {
            Ok(tx) => {
                all_bodies.insert(*txid, tx);
            }
            Err(err) => warn!("dropping unparsable stored transaction {txid}: {err}"),
        }
    }

    {
        let mut primary = engine.lock_primary();
        let owned: HashSet<String> = primary.history.keys().cloned().collect();
        let mut merged: HashMap<String, Vec<(Txid, i32)>> = HashMap::new();
        for (addr, hist) in history {
            if owned.contains(&addr) {
                merged.insert(addr, hist);
            } else {
                warn!("dropping persisted history for unowned address {addr}");
            }
        }
        for addr in owned {
            merged.entry(addr).or_default();
        }
        primary.history = merged;

        for (txid, (height, timestamp, txpos, header_hash)) in verified {
            primary.verified_tx.insert(
                txid,
                MinedInfo {
                    height,
                    conf: None,
                    timestamp,
                    txpos,
                    header_hash,
                },
            );
        }
    }

    {
        let mut index = engine.lock_index();
        index.tx_fees = tx_fees;
        index.spent_outpoints = spent_outpoints
            .into_iter()
            .map(|(txid, by_vout)| {
                let by_vout = by_vout
                    .into_iter()
                    .filter(|(_, spender)| all_bodies.contains_key(spender))
                    .collect::<HashMap<_, _>>();
                (txid, by_vout)
            })
            .filter(|(_, by_vout)| !by_vout.is_empty())
            .collect();

        let known_from_index: HashSet<Txid> = txi.keys().chain(txo.keys()).copied().collect();
        index.txi = txi;
        index.txo = txo;
        // Only bodies the index still references move into the live
        // transaction set; everything else is either re-ingested below or
        // dropped as an orphaned stub with no surviving index entry.
        index.transactions = all_bodies
            .iter()
            .filter(|(txid, _)| known_from_index.contains(*txid))
            .map(|(txid, tx)| (*txid, tx.clone()))
            .collect();
        for txid in known_from_index {
            index.add_tx_to_local_history(txid);
        }
    }

    // Re-ingest transactions the history references that a prior save
    // dropped from the index but whose body we still have.
    let to_reingest: Vec<(Txid, Transaction)> = {
        let primary = engine.lock_primary();
        let index = engine.lock_index();
        primary
            .history
            .values()
            .flatten()
            .filter_map(|(txid, _)| {
                let indexed = index.txi.contains_key(txid) || index.txo.contains_key(txid);
                if indexed {
                    return None;
                }
                all_bodies.get(txid).cloned().map(|tx| (*txid, tx))
            })
            .collect()
    };
    for (txid, tx) in to_reingest {
        if let Err(err) = engine.add_transaction(txid, tx, true) {
            warn!("failed to re-ingest orphaned transaction {txid} on load: {err}");
        }
    }

    Ok(())
}
