//! The engine: owns all state and enforces the two-lock acquisition order
//! (`primary_lock` before `index_lock`). Ingest, verification, and query
//! operations are implemented as further `impl<S: Storage> Engine<S>` blocks
//! in their own modules; this module only has the state containers, lock
//! plumbing, and lifecycle.
//!
//! Rust's `Mutex`/`RwLock` are not reentrant, unlike the two locks this
//! design is modeled on. Rather than hand-roll a reentrant lock, every
//! compound operation is split into a public half that acquires the locks
//! and an internal `_locked` half that takes already-held guards/references
//! — the split the design notes call out as the non-reentrant alternative.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bitcoin::Txid;

use crate::config::EngineConfig;
use crate::index::IndexState;
use crate::model::MinedInfo;
use crate::network::{LocalHeightGuard, NetworkHandle};
use crate::storage::Storage;

/// Everything guarded by `primary_lock`.
#[derive(Default)]
pub struct PrimaryState {
    pub history: HashMap<String, Vec<(Txid, i32)>>,
    pub verified_tx: HashMap<Txid, MinedInfo>,
    pub unverified_tx: HashMap<Txid, i32>,
    pub up_to_date: bool,
}

pub struct Engine<S: Storage> {
    pub(crate) config: EngineConfig,
    pub(crate) storage: S,
    pub(crate) network: Arc<dyn NetworkHandle>,
    pub(crate) primary: Mutex<PrimaryState>,
    pub(crate) index: Mutex<IndexState>,
}

impl<S: Storage> Engine<S> {
    pub fn new(config: EngineConfig, storage: S, network: Arc<dyn NetworkHandle>) -> Self {
        Engine {
            config,
            storage,
            network,
            primary: Mutex::new(PrimaryState::default()),
            index: Mutex::new(IndexState::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn lock_primary(&self) -> MutexGuard<'_, PrimaryState> {
        self.primary.lock().unwrap()
    }

    pub(crate) fn lock_index(&self) -> MutexGuard<'_, IndexState> {
        self.index.lock().unwrap()
    }

    pub(crate) fn local_height(&self) -> i32 {
        crate::network::cached_local_height(self.network.as_ref())
    }

    /// Run `f` with `local_height` cached for the duration of the call, per
    /// the thread-local decorator in the design notes.
    pub(crate) fn with_cached_height<T>(&self, f: impl FnOnce(&Self) -> T) -> T {
        let _guard = LocalHeightGuard::enter(self.network.as_ref());
        f(self)
    }

    /// Suspend the calling thread until `addr`'s history next changes. The
    /// only public method allowed to suspend (spec §5).
    pub fn wait_for_address_history_to_change(&self, addr: &str) {
        let (signal, since) = {
            let mut index = self.lock_index();
            let signal = index.address_change_signal_for(addr);
            let since = signal.current_generation();
            (signal, since)
        };
        signal.wait_for_change(since);
    }

    /// Register an address as wallet-owned. Derivation of which addresses
    /// to watch is out of scope; callers (e.g. a BIP32 derivation layer)
    /// decide what to pass here. A no-op if already registered.
    pub fn add_address(&self, addr: &str) {
        self.lock_primary().history.entry(addr.to_string()).or_default();
    }

    pub fn set_up_to_date(&self, up_to_date: bool) {
        let mut primary = self.lock_primary();
        if primary.up_to_date != up_to_date {
            primary.up_to_date = up_to_date;
            drop(primary);
            self.network.trigger_status(up_to_date);
        }
    }

    pub fn is_up_to_date(&self) -> bool {
        self.lock_primary().up_to_date
    }

    /// Flush primary and derived state to storage. The engine has no
    /// internal tasks to cancel; stop just persists.
    pub fn stop(&self) -> crate::error::Result<()> {
        crate::persistence::save(self)
    }

    /// Load persisted state, running the cleanup passes described in
    /// [`crate::persistence`]. Call [`Engine::add_address`] for every
    /// wallet-owned address first so foreign history can be pruned.
    pub fn load(&self) -> crate::error::Result<()> {
        crate::persistence::load(self, self.config.network)
    }
}
