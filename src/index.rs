//! Derived index state (spec component C3): `txi`, `txo`, `spent_outpoints`,
//! `history_local`, and the per-address change signal. All of this is
//! rebuildable from `transactions` plus `history`; it exists purely to make
//! queries fast.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};

use bitcoin::{Network, Txid};

use crate::model::{OutputKind, Transaction, TxInput, TxOutput};

/// Format an outpoint the way the persisted index keys it: `"{txid}:{vout}"`.
pub fn outpoint_string(txid: Txid, vout: u32) -> String {
    format!("{txid}:{vout}")
}

/// An edge-triggered per-address change notifier. Every call to
/// [`AddressChangeSignal::bump`] wakes every thread currently inside
/// [`AddressChangeSignal::wait_for_change`]; a thread that arrives after the
/// bump waits for the *next* one. This replaces the original's
/// "set an asyncio.Event then immediately clear it" trick with an explicit
/// generation counter, per the design notes.
#[derive(Default)]
pub struct AddressChangeSignal {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl AddressChangeSignal {
    fn bump(&self) {
        let mut generation = self.generation.lock().unwrap();
        *generation = generation.wrapping_add(1);
        self.condvar.notify_all();
    }

    pub fn current_generation(&self) -> u64 {
        *self.generation.lock().unwrap()
    }

    pub fn wait_for_change(&self, since: u64) {
        let mut generation = self.generation.lock().unwrap();
        while *generation == since {
            generation = self.condvar.wait(generation).unwrap();
        }
    }
}

pub type TxiEntry = HashSet<(String, u64)>;
pub type TxoEntry = Vec<(u32, u64, bool)>;

/// Everything guarded by `index_lock` (spec §5).
#[derive(Default)]
pub struct IndexState {
    pub transactions: HashMap<Txid, Transaction>,
    /// txid -> address -> {(spent outpoint string, value)}
    pub txi: HashMap<Txid, HashMap<String, TxiEntry>>,
    /// txid -> address -> [(output index, value, is_coinbase)]
    pub txo: HashMap<Txid, HashMap<String, TxoEntry>>,
    /// prev_txid -> prev_vout -> spending txid
    pub spent_outpoints: HashMap<Txid, HashMap<u32, Txid>>,
    pub tx_fees: HashMap<Txid, i64>,
    pub history_local: HashMap<String, HashSet<Txid>>,
    pub address_change_signal: HashMap<String, Arc<AddressChangeSignal>>,
}

impl IndexState {
    fn signal_for(&mut self, addr: &str) -> Arc<AddressChangeSignal> {
        self.address_change_signal
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(AddressChangeSignal::default()))
            .clone()
    }

    /// Get (creating if absent) the change signal for `addr`, for callers
    /// that need to wait outside the lock via
    /// [`crate::engine::Engine::wait_for_address_history_to_change`].
    pub fn address_change_signal_for(&mut self, addr: &str) -> Arc<AddressChangeSignal> {
        self.signal_for(addr)
    }

    /// Insert `txid` into `history_local` for every address it touches and
    /// fire that address's change signal.
    pub fn add_tx_to_local_history(&mut self, txid: Txid) {
        let addrs = self.addresses_of(txid);
        for addr in addrs {
            self.history_local.entry(addr.clone()).or_default().insert(txid);
            self.signal_for(&addr).bump();
        }
    }

    /// Remove `txid` from every address's `history_local`, firing the change
    /// signal for addresses it was actually removed from. Silent if absent.
    pub fn remove_tx_from_local_history(&mut self, txid: Txid) {
        let mut touched = Vec::new();
        for (addr, txids) in self.history_local.iter_mut() {
            if txids.remove(&txid) {
                touched.push(addr.clone());
            }
        }
        self.history_local.retain(|_, txids| !txids.is_empty());
        for addr in touched {
            self.signal_for(&addr).bump();
        }
    }

    fn addresses_of(&self, txid: Txid) -> HashSet<String> {
        let mut addrs: HashSet<String> = self
            .txi
            .get(&txid)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        if let Some(m) = self.txo.get(&txid) {
            addrs.extend(m.keys().cloned());
        }
        addrs
    }

    /// Resolve the address an input spends from: prefer the embedded
    /// address, otherwise look up the previous output in `txo`.
    pub fn get_txin_address(&self, input: &TxInput) -> Option<String> {
        if let Some(addr) = &input.address {
            return Some(addr.clone());
        }
        let prevout_txid = input.prevout_txid?;
        let prevout_vout = input.prevout_vout?;
        let by_addr = self.txo.get(&prevout_txid)?;
        by_addr
            .iter()
            .find(|(_, outputs)| outputs.iter().any(|(n, _, _)| *n == prevout_vout))
            .map(|(addr, _)| addr.clone())
    }

    /// Resolve the address an output pays, deriving P2PKH from a raw pubkey
    /// for [`OutputKind::Pubkey`] outputs.
    pub fn get_txout_address(&self, output: &TxOutput, network: Network) -> Option<String> {
        match output.kind {
            OutputKind::Address => output.address.clone(),
            OutputKind::Pubkey => output
                .address
                .as_deref()
                .and_then(|pubkey_hex| crate::model::p2pkh_from_pubkey_hex(pubkey_hex, network)),
            OutputKind::Other => None,
        }
    }
}
