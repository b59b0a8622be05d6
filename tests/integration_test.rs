use std::sync::Arc;

use bitcoin::hashes::Hash;
use bitcoin::{
    absolute::LockTime, Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction as BtcTransaction,
    TxIn, TxOut, Txid, Witness,
};

use addr_sync_engine::config::EngineConfig;
use addr_sync_engine::engine::Engine;
use addr_sync_engine::error::EngineError;
use addr_sync_engine::model::{MinedInfo, Transaction};
use addr_sync_engine::network::{Chain, NetworkHandle};
use addr_sync_engine::storage::InMemoryStorage;

struct FixedHeight(i32);
impl NetworkHandle for FixedHeight {
    fn get_local_height(&self) -> i32 {
        self.0
    }
}

/// Wire the engine's `log` output through to the test harness; run with
/// `RUST_LOG=debug cargo test -- --nocapture` to see it.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn engine(local_height: i32) -> Engine<InMemoryStorage> {
    init_logging();
    Engine::new(
        EngineConfig::new(Network::Regtest),
        InMemoryStorage::new(),
        Arc::new(FixedHeight(local_height)),
    )
}

fn addr(s: &str) -> Address {
    let a: Address<bitcoin::address::NetworkUnchecked> = s.parse().unwrap();
    a.require_network(Network::Bitcoin).unwrap()
}

fn paying_tx(prev: Txid, prev_vout: u32, out_addr: &Address, value: u64) -> Transaction {
    let raw = BtcTransaction {
        version: bitcoin::transaction::Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint { txid: prev, vout: prev_vout },
            script_sig: ScriptBuf::from_bytes(vec![0x51]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: out_addr.script_pubkey(),
        }],
    };
    Transaction::from_btc(raw, Network::Bitcoin)
}

fn zero_txid(seed: u8) -> Txid {
    Txid::from_byte_array([seed; 32])
}

const MINE: &str = "1BoatSLRHtKNngkdXEeobR76b53LETtpyT";
const FOREIGN: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";

#[test]
fn unrelated_transaction_is_rejected_and_state_unchanged() {
    let e = engine(100);
    e.add_address(MINE);

    let tx = paying_tx(zero_txid(1), 0, &addr(FOREIGN), 1000);
    let err = e.add_transaction(tx.txid(), tx, false).unwrap_err();
    assert!(matches!(err, EngineError::UnrelatedTransaction));

    assert_eq!(e.get_addr_balance(MINE), (0, 0, 0));
}

#[test]
fn simple_receive_updates_balance_and_utxo() {
    let e = engine(100);
    e.add_address(MINE);

    let t2 = paying_tx(zero_txid(1), 0, &addr(MINE), 100_000);
    let txid = t2.txid();
    e.add_unverified_tx(txid, 100);
    e.add_verified_tx(
        txid,
        MinedInfo { height: 100, conf: None, timestamp: None, txpos: None, header_hash: None },
    );
    assert!(e.add_transaction(txid, t2, false).unwrap());

    assert_eq!(e.get_addr_balance(MINE), (100_000, 0, 0));
    let utxos = e.get_utxos(&[MINE.to_string()], &Default::default(), false, false, false);
    assert_eq!(utxos.len(), 1);
    assert_eq!(utxos[0].value, 100_000);
    assert_eq!(utxos[0].height, 100);
    assert!(!utxos[0].coinbase);
}

#[test]
fn confirmed_conflict_beats_unconfirmed_newcomer() {
    let e = engine(250);
    e.add_address(MINE);
    let x = zero_txid(9);

    let t3 = paying_tx(x, 0, &addr(MINE), 50);
    let t3_id = t3.txid();
    e.add_unverified_tx(t3_id, 200);
    e.add_transaction(t3_id, t3, true).unwrap();
    e.add_verified_tx(
        t3_id,
        MinedInfo { height: 200, conf: None, timestamp: None, txpos: None, header_hash: None },
    );

    let t4 = paying_tx(x, 0, &addr(MINE), 50);
    let t4_id = t4.txid();
    assert!(!e.add_transaction(t4_id, t4, true).unwrap());

    assert_eq!(e.get_addr_balance(MINE), (50, 0, 0));
}

#[test]
fn new_confirmed_evicts_mempool_conflict_and_its_descendants() {
    let e = engine(300);
    e.add_address(MINE);
    let x = zero_txid(9);

    let t5 = paying_tx(x, 0, &addr(MINE), 1000);
    let t5_id = t5.txid();
    e.add_unverified_tx(t5_id, 0);
    e.add_transaction(t5_id, t5, true).unwrap();

    let t5_child = paying_tx(t5_id, 0, &addr(MINE), 900);
    let t5_child_id = t5_child.txid();
    e.add_transaction(t5_child_id, t5_child, true).unwrap();

    let t6 = paying_tx(x, 0, &addr(MINE), 950);
    let t6_id = t6.txid();
    e.add_unverified_tx(t6_id, 300);
    assert!(e.add_transaction(t6_id, t6, true).unwrap());

    assert!(e.get_addr_utxo(MINE).iter().all(|u| u.prevout_txid != t5_id && u.prevout_txid != t5_child_id));
    assert!(e.get_addr_utxo(MINE).iter().any(|u| u.prevout_txid == t6_id));
}

struct WrongHeader;
impl Chain for WrongHeader {
    fn header_hash_at(&self, _height: i32) -> Option<[u8; 32]> {
        Some([0xAA; 32])
    }
}

#[test]
fn reorg_demotes_verified_tx_to_unverified_at_same_height() {
    let e = engine(700);
    let t7 = zero_txid(7);
    e.add_verified_tx(
        t7,
        MinedInfo { height: 700, conf: None, timestamp: None, txpos: None, header_hash: Some([0xBB; 32]) },
    );

    e.undo_verifications(&WrongHeader, 700);

    let info = e.get_tx_height(t7);
    assert_eq!(info.height, 700);
    assert_eq!(info.conf, Some(0));
}

#[test]
fn history_is_chronological_with_correct_running_balances() {
    let e = engine(500);
    e.add_address(MINE);

    let tc = paying_tx(zero_txid(1), 0, &addr(MINE), 100);
    let tc_id = tc.txid();
    e.add_unverified_tx(tc_id, 500);
    e.add_transaction(tc_id, tc, true).unwrap();
    e.add_verified_tx(
        tc_id,
        MinedInfo { height: 500, conf: None, timestamp: None, txpos: None, header_hash: None },
    );

    let tb = paying_tx(zero_txid(2), 0, &addr(MINE), 20);
    let tb_id = tb.txid();
    e.add_unverified_tx(tb_id, 0);
    e.add_transaction(tb_id, tb, true).unwrap();

    let ta = paying_tx(zero_txid(3), 0, &addr(MINE), 30);
    let ta_id = ta.txid();
    e.add_unverified_tx(ta_id, addr_sync_engine::constants::HEIGHT_LOCAL);
    e.add_transaction(ta_id, ta, true).unwrap();

    // `history` is the server-reported view per address; a local tx is
    // still visible here the way a wallet's own local-history feed reports
    // its own not-yet-broadcast transactions.
    e.receive_history_callback(
        MINE,
        vec![
            (tc_id, 500),
            (tb_id, 0),
            (ta_id, addr_sync_engine::constants::HEIGHT_LOCAL),
        ],
        Vec::new(),
    );

    let history = e.get_history(&[MINE.to_string()]);
    let positions: Vec<Txid> = history.iter().map(|row| row.txid).collect();
    assert_eq!(positions, vec![tc_id, tb_id, ta_id]);

    let balances: Vec<Option<i64>> = history.iter().map(|row| row.running_balance).collect();
    assert_eq!(balances, vec![Some(100), Some(120), Some(150)]);
}

#[test]
fn fee_via_wallet_delta_is_cached() {
    let e = engine(10);
    e.add_address(MINE);

    let funding = paying_tx(zero_txid(3), 0, &addr(MINE), 1000);
    let funding_id = funding.txid();
    e.add_transaction(funding_id, funding, true).unwrap();

    let spend_raw = BtcTransaction {
        version: bitcoin::transaction::Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint { txid: funding_id, vout: 0 },
            script_sig: ScriptBuf::from_bytes(vec![0x51]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![
            TxOut { value: Amount::from_sat(800), script_pubkey: addr(FOREIGN).script_pubkey() },
            TxOut { value: Amount::from_sat(100), script_pubkey: addr(MINE).script_pubkey() },
        ],
    };
    let spend = Transaction::from_btc(spend_raw, Network::Bitcoin);
    let spend_id = spend.txid();

    let delta = e.get_wallet_delta(&spend);
    assert!(delta.is_mine);
    assert_eq!(delta.fee, Some(100));

    e.add_transaction(spend_id, spend, true).unwrap();
    assert_eq!(e.get_tx_fee(spend_id), Some(100));
}

#[test]
fn save_then_load_round_trips_balance() {
    init_logging();
    let shared_storage = Arc::new(InMemoryStorage::new());

    let e = Engine::new(EngineConfig::new(Network::Bitcoin), shared_storage.clone(), Arc::new(FixedHeight(100)));
    e.add_address(MINE);
    let tx = paying_tx(zero_txid(4), 0, &addr(MINE), 42_000);
    let txid = tx.txid();
    e.add_unverified_tx(txid, 100);
    e.add_transaction(txid, tx, true).unwrap();
    e.add_verified_tx(
        txid,
        MinedInfo { height: 100, conf: None, timestamp: None, txpos: None, header_hash: None },
    );
    e.stop().unwrap();

    let reloaded = Engine::new(EngineConfig::new(Network::Bitcoin), shared_storage, Arc::new(FixedHeight(100)));
    reloaded.add_address(MINE);
    reloaded.load().unwrap();

    assert_eq!(reloaded.get_addr_balance(MINE), (42_000, 0, 0));
}
