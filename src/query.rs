//! Query engine (C7): balances, UTXO extraction, wallet delta, and ordered
//! history with running balance. Everything here is read-only and locks
//! `primary_lock` then `index_lock` per the ordering rule, with `local_height`
//! cached for the call via [`Engine::with_cached_height`].

use std::collections::{HashMap, HashSet};

use bitcoin::{Network, Txid};

use crate::config::EngineConfig;
use crate::constants::HEIGHT_LOCAL;
use crate::engine::{Engine, PrimaryState};
use crate::index::{outpoint_string, IndexState};
use crate::model::{MinedInfo, Transaction};
use crate::storage::Storage;
use crate::verify::get_tx_height_locked;

/// A spendable output credited to a tracked address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub address: String,
    pub value: u64,
    pub prevout_txid: Txid,
    pub prevout_vout: u32,
    pub height: i32,
    pub coinbase: bool,
}

/// `get_wallet_delta`'s result: the signed effect of a transaction on the
/// wallet as a whole, plus the classification bits that determine whether
/// `value`/`fee` can be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletDelta {
    /// Touches at least one tracked address, as spender or recipient.
    pub is_relevant: bool,
    /// At least one input spends a tracked address's prior output.
    pub is_mine: bool,
    /// At least one input's previous address is known but not tracked.
    pub is_partial: bool,
    /// At least one tracked input's previous output value is unknown
    /// (its transaction body hasn't been seen).
    pub is_pruned: bool,
    pub value: Option<i64>,
    pub fee: Option<i64>,
}

/// One row of [`Engine::get_history`]: the transaction, its confirmation
/// status, its net effect on the queried domain, and the wallet's running
/// balance immediately after it, in chronological order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    pub txid: Txid,
    pub info: MinedInfo,
    pub delta: Option<i64>,
    pub running_balance: Option<i64>,
}

/// Optional enricher querying an external token-overlay RPC for
/// per-transaction metadata layered on top of the base transaction. Any
/// failure degrades to `None`; it never participates in conflict resolution
/// or eviction (see the design notes' open question).
pub trait TokenOverlay: Send + Sync {
    fn enrich(&self, txid: Txid) -> Option<serde_json::Value>;
}

impl<S: Storage> Engine<S> {
    pub fn get_addr_io(&self, addr: &str) -> (HashMap<String, (i32, u64, bool)>, HashMap<String, i32>) {
        self.with_cached_height(|this| {
            let primary = this.lock_primary();
            let index = this.lock_index();
            let local_height = this.local_height();
            get_addr_io_locked(&primary, &index, local_height, addr)
        })
    }

    pub fn get_addr_utxo(&self, addr: &str) -> Vec<Utxo> {
        self.with_cached_height(|this| {
            let primary = this.lock_primary();
            let index = this.lock_index();
            let local_height = this.local_height();
            get_addr_utxo_locked(&primary, &index, local_height, addr)
        })
    }

    /// `(confirmed, unconfirmed, immature)`.
    pub fn get_addr_balance(&self, addr: &str) -> (i64, i64, i64) {
        self.with_cached_height(|this| {
            let primary = this.lock_primary();
            let index = this.lock_index();
            let local_height = this.local_height();
            get_addr_balance_locked(&primary, &index, &this.config, local_height, addr)
        })
    }

    pub fn get_balance(&self, domain: &[String]) -> (i64, i64, i64) {
        self.with_cached_height(|this| {
            let primary = this.lock_primary();
            let index = this.lock_index();
            let local_height = this.local_height();
            domain.iter().fold((0i64, 0i64, 0i64), |(c, u, x), addr| {
                let (dc, du, dx) = get_addr_balance_locked(&primary, &index, &this.config, local_height, addr);
                (c + dc, u + du, x + dx)
            })
        })
    }

    pub fn get_utxos(
        &self,
        domain: &[String],
        excluded: &HashSet<(Txid, u32)>,
        mature: bool,
        confirmed_only: bool,
        nonlocal_only: bool,
    ) -> Vec<Utxo> {
        self.with_cached_height(|this| {
            let primary = this.lock_primary();
            let index = this.lock_index();
            let local_height = this.local_height();
            let mut out = Vec::new();
            for addr in domain {
                for utxo in get_addr_utxo_locked(&primary, &index, local_height, addr) {
                    if excluded.contains(&(utxo.prevout_txid, utxo.prevout_vout)) {
                        continue;
                    }
                    if mature && utxo.coinbase && utxo.height + this.config.coinbase_maturity > local_height {
                        continue;
                    }
                    if confirmed_only && utxo.height <= 0 {
                        continue;
                    }
                    if nonlocal_only && utxo.height == HEIGHT_LOCAL {
                        continue;
                    }
                    out.push(utxo);
                }
            }
            out
        })
    }

    /// Signed effect of `txid` on `addr`: received minus spent. `None` if
    /// the transaction body isn't cached (its value is unknowable).
    pub fn get_tx_delta(&self, txid: Txid, addr: &str) -> Option<i64> {
        let index = self.lock_index();
        get_tx_delta_locked(&index, txid, addr)
    }

    pub fn get_wallet_delta(&self, tx: &Transaction) -> WalletDelta {
        let primary = self.lock_primary();
        let index = self.lock_index();
        get_wallet_delta_locked(&primary, &index, self.config.network, tx)
    }

    /// Prefer the wallet-delta fee; fall back to a previously merged
    /// server-reported fee. Caches a non-`None` result on the transaction.
    pub fn get_tx_fee(&self, txid: Txid) -> Option<i64> {
        let primary = self.lock_primary();
        let index = self.lock_index();
        let tx = index.transactions.get(&txid)?;
        if let Some(cached) = tx.cached_fee() {
            return Some(cached);
        }
        let delta = get_wallet_delta_locked(&primary, &index, self.config.network, tx);
        let fee = delta.fee.or_else(|| index.tx_fees.get(&txid).copied());
        if let Some(fee) = fee {
            tx.cache_fee(fee);
        }
        fee
    }

    /// Ordered, chronological history for every address in `domain`, with a
    /// running wallet balance attached to each row. Returns an empty list
    /// (and logs) if the reconstructed running balance doesn't land on zero
    /// or an unresolvable poison, since that indicates an inconsistent view
    /// rather than a crash-worthy bug.
    pub fn get_history(&self, domain: &[String]) -> Vec<HistoryRow> {
        self.with_cached_height(|this| {
            let primary = this.lock_primary();
            let index = this.lock_index();
            let local_height = this.local_height();

            let mut tx_deltas: HashMap<Txid, Option<i64>> = HashMap::new();
            let mut order: Vec<Txid> = Vec::new();
            let mut seen = HashSet::new();
            for addr in domain {
                let Some(hist) = primary.history.get(addr) else {
                    continue;
                };
                for (txid, _) in hist {
                    if seen.insert(*txid) {
                        order.push(*txid);
                    }
                    let delta_on_addr = get_tx_delta_locked(&index, *txid, addr);
                    let entry = tx_deltas.entry(*txid).or_insert(Some(0));
                    *entry = match (*entry, delta_on_addr) {
                        (Some(a), Some(b)) => Some(a + b),
                        _ => None,
                    };
                }
            }

            order.sort_by_key(|t| std::cmp::Reverse(get_txpos(&primary, *t)));

            let mut running = domain.iter().try_fold(0i64, |acc, addr| {
                let (c, u, x) = get_addr_balance_locked(&primary, &index, &this.config, local_height, addr);
                Some(acc + c + u + x)
            });

            let mut rows = Vec::with_capacity(order.len());
            for txid in &order {
                let delta = tx_deltas.get(txid).copied().flatten();
                let balance_after = running;
                running = match (running, delta) {
                    (Some(r), Some(d)) => Some(r - d),
                    _ => None,
                };
                let info = get_tx_height_locked(&primary, *txid, local_height);
                rows.push(HistoryRow {
                    txid: *txid,
                    info,
                    delta,
                    running_balance: balance_after,
                });
            }
            rows.reverse();

            match running {
                Some(0) | None => rows,
                Some(remainder) => {
                    log::warn!(
                        "get_history: reconstructed balance {remainder} is not zero; view is inconsistent, returning empty"
                    );
                    Vec::new()
                }
            }
        })
    }

    pub fn get_addresses(&self) -> Vec<String> {
        self.lock_primary().history.keys().cloned().collect()
    }

    pub fn get_address_history_len(&self, addr: &str) -> usize {
        self.lock_primary().history.get(addr).map_or(0, Vec::len)
    }

    pub fn is_used(&self, addr: &str) -> bool {
        self.get_address_history_len(addr) > 0
    }

    pub fn is_empty(&self, addr: &str) -> bool {
        !self.is_used(addr)
    }

    pub fn enrich_with_overlay(&self, overlay: &dyn TokenOverlay, txid: Txid) -> Option<serde_json::Value> {
        overlay.enrich(txid)
    }
}

fn get_addr_io_locked(
    primary: &PrimaryState,
    index: &IndexState,
    local_height: i32,
    addr: &str,
) -> (HashMap<String, (i32, u64, bool)>, HashMap<String, i32>) {
    let mut received = HashMap::new();
    for (txid, by_addr) in &index.txo {
        if let Some(outs) = by_addr.get(addr) {
            let height = get_tx_height_locked(primary, *txid, local_height).height;
            for (n, value, is_cb) in outs {
                received.insert(outpoint_string(*txid, *n), (height, *value, *is_cb));
            }
        }
    }
    let mut sent = HashMap::new();
    for (txid, by_addr) in &index.txi {
        if let Some(ins) = by_addr.get(addr) {
            let height = get_tx_height_locked(primary, *txid, local_height).height;
            for (outpoint, _value) in ins {
                sent.insert(outpoint.clone(), height);
            }
        }
    }
    (received, sent)
}

fn get_addr_utxo_locked(primary: &PrimaryState, index: &IndexState, local_height: i32, addr: &str) -> Vec<Utxo> {
    let (received, sent) = get_addr_io_locked(primary, index, local_height, addr);
    received
        .into_iter()
        .filter(|(outpoint, _)| !sent.contains_key(outpoint))
        .filter_map(|(outpoint, (height, value, coinbase))| {
            let (txid_str, vout_str) = outpoint.rsplit_once(':')?;
            Some(Utxo {
                address: addr.to_string(),
                value,
                prevout_txid: txid_str.parse().ok()?,
                prevout_vout: vout_str.parse().ok()?,
                height,
                coinbase,
            })
        })
        .collect()
}

fn get_addr_balance_locked(
    primary: &PrimaryState,
    index: &IndexState,
    config: &EngineConfig,
    local_height: i32,
    addr: &str,
) -> (i64, i64, i64) {
    let (received, sent) = get_addr_io_locked(primary, index, local_height, addr);
    let mut confirmed = 0i64;
    let mut unconfirmed = 0i64;
    let mut immature = 0i64;
    for (outpoint, (height, value, is_coinbase)) in &received {
        if *is_coinbase && height + config.coinbase_maturity > local_height {
            immature += *value as i64;
        } else if *height > 0 {
            confirmed += *value as i64;
        } else {
            unconfirmed += *value as i64;
        }

        if let Some(spend_height) = sent.get(outpoint) {
            if *spend_height > 0 {
                confirmed -= *value as i64;
            } else {
                unconfirmed -= *value as i64;
            }
        }
    }
    (confirmed, unconfirmed, immature)
}

fn get_tx_delta_locked(index: &IndexState, txid: Txid, addr: &str) -> Option<i64> {
    if !index.transactions.contains_key(&txid) {
        return None;
    }
    let received: i64 = index
        .txo
        .get(&txid)
        .and_then(|m| m.get(addr))
        .map(|outs| outs.iter().map(|(_, v, _)| *v as i64).sum())
        .unwrap_or(0);
    let spent: i64 = index
        .txi
        .get(&txid)
        .and_then(|m| m.get(addr))
        .map(|ins| ins.iter().map(|(_, v)| *v as i64).sum())
        .unwrap_or(0);
    Some(received - spent)
}

fn get_wallet_delta_locked(
    primary: &PrimaryState,
    index: &IndexState,
    network: Network,
    tx: &Transaction,
) -> WalletDelta {
    let mut is_mine = false;
    let mut is_partial = false;
    let mut is_pruned = false;
    let mut v_in = 0i64;

    for input in &tx.inputs {
        if input.is_coinbase {
            continue;
        }
        let Some(addr) = index.get_txin_address(input) else {
            is_partial = true;
            continue;
        };
        if !primary.history.contains_key(&addr) {
            is_partial = true;
            continue;
        }
        is_mine = true;
        let (Some(prev_txid), Some(prev_vout)) = (input.prevout_txid, input.prevout_vout) else {
            continue;
        };
        let value = index
            .txo
            .get(&prev_txid)
            .and_then(|m| m.get(&addr))
            .and_then(|outs| outs.iter().find(|(n, _, _)| *n == prev_vout).map(|(_, v, _)| *v));
        match value {
            Some(v) => v_in += v as i64,
            None => is_pruned = true,
        }
    }

    let mut v_out_mine = 0i64;
    let mut v_out = 0i64;
    let mut any_output_mine = false;
    for output in &tx.outputs {
        v_out += output.value as i64;
        if let Some(addr) = index.get_txout_address(output, network) {
            if primary.history.contains_key(&addr) {
                v_out_mine += output.value as i64;
                any_output_mine = true;
            }
        }
    }

    let is_relevant = is_mine || any_output_mine;

    if is_pruned {
        let value = if is_mine { v_out_mine - v_out } else { v_out_mine };
        return WalletDelta {
            is_relevant,
            is_mine,
            is_partial,
            is_pruned,
            value: Some(value),
            fee: None,
        };
    }

    let value = v_out_mine - v_in;
    let fee = if is_mine && !is_partial { Some(v_in - v_out) } else { None };
    WalletDelta {
        is_relevant,
        is_mine,
        is_partial,
        is_pruned,
        value: Some(value),
        fee,
    }
}

/// Sort key used by `get_history`: verified transactions sort by their
/// proved `(height, txpos)`; unverified ones with a positive claimed height
/// behave the same; non-positive (mempool/local) heights sort above all
/// verified ones but below unknowns, newest first.
fn get_txpos(primary: &PrimaryState, txid: Txid) -> (i64, i64) {
    const MEMPOOL_BASE: i64 = 1_000_000_000;
    if let Some(info) = primary.verified_tx.get(&txid) {
        return (info.height as i64, info.txpos.unwrap_or(0) as i64);
    }
    if let Some(height) = primary.unverified_tx.get(&txid) {
        return if *height > 0 {
            (*height as i64, 0)
        } else {
            (MEMPOOL_BASE - *height as i64, 0)
        };
    }
    (MEMPOOL_BASE + 1, 0)
}
