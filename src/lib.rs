// Rust Bitcoin Wallet
// Written in 2019 by
//   Steven Roose <steven@stevenroose.org>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the CC0 Public Domain Dedication
// along with this software.
// If not, see <http://creativecommons.org/publicdomain/zero/1.0/>.
//

//! # Address-history and UTXO tracking engine
//!
//! Ingests raw transactions and per-address server history, reconciles them
//! against a persisted local view under a strict conflict-precedence rule
//! (confirmed > mempool > local), and answers balance/UTXO/history queries.
//! Wire protocol, SPV proof construction, key derivation and signing are all
//! external collaborators; see [`network`] for the traits this engine is
//! driven by and drives.

#![forbid(unsafe_code)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod index;
pub mod ingest;
pub mod model;
pub mod network;
pub mod persistence;
pub mod query;
pub mod storage;
pub mod verify;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use model::{MinedInfo, Transaction};
pub use query::{HistoryRow, TokenOverlay, Utxo, WalletDelta};
