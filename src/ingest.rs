//! Ingest: `add_transaction` / `remove_transaction`, conflict resolution,
//! and the cascading dependent-eviction rule (spec C5).

use std::collections::{HashMap, HashSet, VecDeque};

use bitcoin::Txid;
use log::{info, warn};

use crate::constants::{is_mempool_height, HEIGHT_LOCAL};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::index::{outpoint_string, IndexState};
use crate::model::Transaction;
use crate::storage::Storage;
use crate::verify;

impl<S: Storage> Engine<S> {
    /// Ingest a fully-signed transaction. `Ok(true)` if kept, `Ok(false)` if
    /// conflict precedence rejected it in favor of the existing transaction,
    /// `Err(UnrelatedTransaction)` if it touches no wallet address and
    /// `allow_unrelated` is false.
    pub fn add_transaction(&self, txid: Txid, tx: Transaction, allow_unrelated: bool) -> Result<bool> {
        let local_height = self.local_height();
        let primary = self.lock_primary();
        let mut index = self.lock_index();

        let tx_height = verify::get_tx_height_locked(&primary, txid, local_height).height;

        if !allow_unrelated {
            let is_mine_input = tx.inputs.iter().any(|i| {
                index
                    .get_txin_address(i)
                    .is_some_and(|a| primary.history.contains_key(&a))
            });
            let is_mine_output = tx.outputs.iter().any(|o| {
                index
                    .get_txout_address(o, self.config.network)
                    .is_some_and(|a| primary.history.contains_key(&a))
            });
            if !is_mine_input && !is_mine_output {
                return Err(EngineError::UnrelatedTransaction);
            }
        }

        let conflicts = conflicting_transactions_locked(&index, txid, &tx)?;
        if !conflicts.is_empty() {
            let any_confirmed = conflicts
                .iter()
                .any(|c| verify::get_tx_height_locked(&primary, *c, local_height).height > 0);
            let any_mempool = conflicts.iter().any(|c| {
                is_mempool_height(verify::get_tx_height_locked(&primary, *c, local_height).height)
            });

            if any_confirmed && tx_height <= 0 {
                warn!("dropping {txid}: conflicts with an already-confirmed transaction");
                return Ok(false);
            }
            if any_mempool && !any_confirmed && tx_height == HEIGHT_LOCAL {
                warn!("dropping local {txid}: conflicts with a mempool transaction");
                return Ok(false);
            }

            let evicted = descendants_locked(&index, &conflicts);
            for victim in &evicted {
                remove_transaction_locked(&mut index, *victim);
            }
            info!("evicted {} transaction(s) conflicting with {txid}", evicted.len());
        }

        index_new_transaction(&primary.history, &mut index, txid, &tx, self.config.network);
        drop(primary);
        index.transactions.insert(txid, tx);
        index.add_tx_to_local_history(txid);

        Ok(true)
    }

    /// Drop `txid` and its index entries. Does not cascade to dependents;
    /// cascade lives in `add_transaction`'s eviction rule.
    pub fn remove_transaction(&self, txid: Txid) {
        let mut index = self.lock_index();
        remove_transaction_locked(&mut index, txid);
    }

    /// Distinct txids currently spending any input of `tx`, other than
    /// `txid` itself.
    pub fn conflicting_transactions(&self, txid: Txid, tx: &Transaction) -> Result<HashSet<Txid>> {
        let index = self.lock_index();
        conflicting_transactions_locked(&index, txid, tx)
    }

    /// Apply the remote server's authoritative history for `addr`.
    pub fn receive_history_callback(
        &self,
        addr: &str,
        new_hist: Vec<(Txid, i32)>,
        tx_fees: impl IntoIterator<Item = (Txid, i64)>,
    ) {
        let refresh: Vec<(Txid, Transaction)> = {
            let mut primary = self.lock_primary();
            let mut index = self.lock_index();

            let old_hist = primary.history.get(addr).cloned().unwrap_or_default();
            let new_set: HashSet<Txid> = new_hist.iter().map(|(t, _)| *t).collect();
            for (t, _) in &old_hist {
                if !new_set.contains(t) {
                    primary.verified_tx.remove(t);
                    primary.unverified_tx.remove(t);
                }
            }
            primary.history.insert(addr.to_string(), new_hist.clone());

            for (fee_txid, fee) in tx_fees {
                index.tx_fees.insert(fee_txid, fee);
            }

            let mut refresh = Vec::new();
            for (t, h) in &new_hist {
                verify::add_unverified_tx_locked(&mut primary, *t, *h);
                if let Some(body) = index.transactions.get(t).cloned() {
                    refresh.push((*t, body));
                }
            }
            refresh
        };

        for (t, body) in refresh {
            if let Err(err) = self.add_transaction(t, body, true) {
                warn!("refresh of cached transaction {t} after history update failed: {err}");
            }
        }
    }

    /// Receive a transaction body pushed by the syncer, at its claimed height.
    pub fn receive_tx_callback(&self, txid: Txid, tx: Transaction, height: i32) -> Result<bool> {
        self.add_unverified_tx(txid, height);
        self.add_transaction(txid, tx, true)
    }
}

fn conflicting_transactions_locked(
    index: &IndexState,
    txid: Txid,
    tx: &Transaction,
) -> Result<HashSet<Txid>> {
    let mut conflicts = HashSet::new();
    let mut self_seen = false;
    for input in &tx.inputs {
        let (Some(prev_txid), Some(prev_vout)) = (input.prevout_txid, input.prevout_vout) else {
            continue;
        };
        if let Some(spender) = index
            .spent_outpoints
            .get(&prev_txid)
            .and_then(|m| m.get(&prev_vout))
        {
            if *spender == txid {
                self_seen = true;
            } else {
                conflicts.insert(*spender);
            }
        }
    }
    if self_seen && !conflicts.is_empty() {
        return Err(EngineError::InvariantViolation(format!(
            "{txid} is both already indexed and conflicts with other spenders"
        )));
    }
    Ok(conflicts)
}

/// Transitive closure of "spends an output of a transaction in `seeds`" via
/// `spent_outpoints`. Acyclic: outpoints point from past outputs to future
/// spenders only.
fn descendants_locked(index: &IndexState, seeds: &HashSet<Txid>) -> HashSet<Txid> {
    let mut result = HashSet::new();
    let mut queue: VecDeque<Txid> = seeds.iter().copied().collect();
    while let Some(t) = queue.pop_front() {
        if !result.insert(t) {
            continue;
        }
        if let Some(spenders) = index.spent_outpoints.get(&t) {
            for spender in spenders.values() {
                if !result.contains(spender) {
                    queue.push_back(*spender);
                }
            }
        }
    }
    result
}

fn remove_transaction_locked(index: &mut IndexState, txid: Txid) {
    let removed = index.transactions.remove(&txid);
    match &removed {
        Some(tx) => {
            for input in &tx.inputs {
                if let (Some(prev_txid), Some(prev_vout)) = (input.prevout_txid, input.prevout_vout) {
                    if let Some(submap) = index.spent_outpoints.get_mut(&prev_txid) {
                        submap.remove(&prev_vout);
                        if submap.is_empty() {
                            index.spent_outpoints.remove(&prev_txid);
                        }
                    }
                }
            }
        }
        None => {
            index.spent_outpoints.retain(|_, submap| {
                submap.retain(|_, spender| *spender != txid);
                !submap.is_empty()
            });
        }
    }
    if index.spent_outpoints.get(&txid).is_some_and(|m| m.is_empty()) {
        index.spent_outpoints.remove(&txid);
    }
    index.remove_tx_from_local_history(txid);
    index.txi.remove(&txid);
    index.txo.remove(&txid);
    index.tx_fees.remove(&txid);
}

/// Populate `txi`/`txo`/`spent_outpoints` for a transaction about to be
/// inserted into `transactions`. Only wallet-owned addresses (present in
/// `history`) get `txi`/`txo` entries, matching the original's
/// `if addr and self.is_mine(addr):` guard.
fn index_new_transaction(
    history: &HashMap<String, Vec<(Txid, i32)>>,
    index: &mut IndexState,
    txid: Txid,
    tx: &Transaction,
    network: bitcoin::Network,
) {
    let is_coinbase = tx.is_coinbase();

    for input in &tx.inputs {
        let (Some(prev_txid), Some(prev_vout)) = (input.prevout_txid, input.prevout_vout) else {
            continue;
        };
        index
            .spent_outpoints
            .entry(prev_txid)
            .or_default()
            .insert(prev_vout, txid);

        if let Some(addr) = index.get_txin_address(input) {
            if !history.contains_key(&addr) {
                continue;
            }
            let value = index
                .txo
                .get(&prev_txid)
                .and_then(|m| m.get(&addr))
                .and_then(|outs| outs.iter().find(|(n, _, _)| *n == prev_vout).map(|(_, v, _)| *v));
            if let Some(value) = value {
                index
                    .txi
                    .entry(txid)
                    .or_default()
                    .entry(addr)
                    .or_default()
                    .insert((outpoint_string(prev_txid, prev_vout), value));
            }
        }
    }

    for (n, output) in tx.outputs.iter().enumerate() {
        let n = n as u32;
        let Some(addr) = index.get_txout_address(output, network) else {
            continue;
        };
        if !history.contains_key(&addr) {
            continue;
        }
        let entries = index.txo.entry(txid).or_default().entry(addr.clone()).or_default();
        let record = (n, output.value, is_coinbase);
        if !entries.contains(&record) {
            entries.push(record);
        }

        // The spender of this output may have arrived before this tx did.
        if let Some(spender) = index.spent_outpoints.get(&txid).and_then(|m| m.get(&n)).copied() {
            index
                .txi
                .entry(spender)
                .or_default()
                .entry(addr.clone())
                .or_default()
                .insert((outpoint_string(txid, n), output.value));
            index.add_tx_to_local_history(spender);
        }
    }
}
