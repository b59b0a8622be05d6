//! Transaction model: the engine's concrete stand-in for spec C2's "opaque
//! container of inputs/outputs". Wire parsing policy (which bytes arrive,
//! from where) is out of scope; this module only needs to turn raw bytes
//! into the fields the rest of the engine reasons about.

use std::cell::Cell;

use bitcoin::consensus::encode::deserialize;
use bitcoin::{Address, Network, PublicKey, Transaction as BtcTransaction, Txid};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Confirmation/verification status of a transaction, returned by
/// `get_tx_height` and carried in `get_history` rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinedInfo {
    pub height: i32,
    pub conf: Option<u32>,
    pub timestamp: Option<u64>,
    pub txpos: Option<u32>,
    pub header_hash: Option<[u8; 32]>,
}

/// How an output's spending condition was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
    /// A standard scriptPubKey with a well-defined address encoding.
    Address,
    /// A bare pay-to-pubkey output. `address` on the owning [`TxOutput`]
    /// holds the raw pubkey hex; callers derive a P2PKH address from it
    /// via [`crate::index::get_txout_address`].
    Pubkey,
    /// Anything else (OP_RETURN, bare multisig, non-standard scripts).
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub is_coinbase: bool,
    pub prevout_txid: Option<Txid>,
    pub prevout_vout: Option<u32>,
    /// Embedded address, if the caller already knows it. Usually `None` for
    /// freshly parsed transactions: knowing the address of a spent output
    /// requires knowing that output, which the index store resolves lazily.
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub kind: OutputKind,
    pub address: Option<String>,
    pub value: u64,
}

/// A transaction known to the engine, with its inputs/outputs pre-classified.
#[derive(Debug, Clone)]
pub struct Transaction {
    raw: BtcTransaction,
    txid: Txid,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Lazily-computed fee, cached by `get_tx_fee` once it is known.
    fee_cache: Cell<Option<i64>>,
}

impl Transaction {
    /// Parse a raw transaction and classify its inputs/outputs against `network`.
    pub fn parse(raw_bytes: &[u8], network: Network) -> Result<Self, ParseError> {
        let raw: BtcTransaction = deserialize(raw_bytes)?;
        Ok(Self::from_btc(raw, network))
    }

    pub fn from_btc(raw: BtcTransaction, network: Network) -> Self {
        let txid = raw.compute_txid();

        let inputs = raw
            .input
            .iter()
            .enumerate()
            .map(|(i, txin)| {
                let is_coinbase = i == 0 && txin.previous_output.is_null();
                if is_coinbase {
                    TxInput {
                        is_coinbase: true,
                        prevout_txid: None,
                        prevout_vout: None,
                        address: None,
                    }
                } else {
                    TxInput {
                        is_coinbase: false,
                        prevout_txid: Some(txin.previous_output.txid),
                        prevout_vout: Some(txin.previous_output.vout),
                        address: None,
                    }
                }
            })
            .collect();

        let outputs = raw
            .output
            .iter()
            .map(|txout| {
                let (kind, address) = classify_output(&txout.script_pubkey, network);
                TxOutput {
                    kind,
                    address,
                    value: txout.value.to_sat(),
                }
            })
            .collect();

        Transaction {
            raw,
            txid,
            inputs,
            outputs,
            fee_cache: Cell::new(None),
        }
    }

    pub fn txid(&self) -> Txid {
        self.txid
    }

    pub fn cached_fee(&self) -> Option<i64> {
        self.fee_cache.get()
    }

    pub fn cache_fee(&self, fee: i64) {
        self.fee_cache.set(Some(fee));
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.first().is_some_and(|i| i.is_coinbase)
    }

    /// Whether the transaction is fully signed. Signing policy itself is out
    /// of scope for this engine; we only need to know that a transaction
    /// handed to `add_transaction` is final, not a half-built PSBT.
    pub fn is_complete(&self) -> bool {
        !self.raw.input.is_empty()
            && self
                .raw
                .input
                .iter()
                .enumerate()
                .all(|(i, txin)| (i == 0 && txin.previous_output.is_null()) || has_signature(txin))
    }

    pub fn raw(&self) -> &BtcTransaction {
        &self.raw
    }

    pub fn to_raw_hex(&self) -> String {
        hex::encode(bitcoin::consensus::encode::serialize(&self.raw))
    }

    pub fn from_raw_hex(hex_str: &str, network: Network) -> Result<Self, ParseError> {
        let bytes = hex::decode(hex_str).map_err(|_| {
            ParseError::Decode(bitcoin::consensus::encode::Error::ParseFailed(
                "invalid hex",
            ))
        })?;
        Self::parse(&bytes, network)
    }
}

fn has_signature(txin: &bitcoin::TxIn) -> bool {
    !txin.script_sig.is_empty() || !txin.witness.is_empty()
}

fn classify_output(script: &bitcoin::Script, network: Network) -> (OutputKind, Option<String>) {
    if let Ok(addr) = Address::from_script(script, network) {
        return (OutputKind::Address, Some(addr.to_string()));
    }
    if let Some(pubkey_bytes) = extract_p2pk_pubkey(script) {
        return (OutputKind::Pubkey, Some(hex::encode(pubkey_bytes)));
    }
    (OutputKind::Other, None)
}

/// Recognize a bare pay-to-pubkey scriptPubKey: a single pubkey push
/// followed by OP_CHECKSIG. `Address::from_script` does not assign these an
/// address, matching the original's separate `TYPE_PUBKEY` handling.
fn extract_p2pk_pubkey(script: &bitcoin::Script) -> Option<Vec<u8>> {
    const OP_CHECKSIG: u8 = 0xac;
    let bytes = script.as_bytes();
    match bytes.len() {
        35 if bytes[0] == 33 && bytes[34] == OP_CHECKSIG => Some(bytes[1..34].to_vec()),
        67 if bytes[0] == 65 && bytes[66] == OP_CHECKSIG => Some(bytes[1..66].to_vec()),
        _ => None,
    }
}

/// Derive the P2PKH address paying a raw (hex-encoded) public key, per
/// `get_txout_address`'s handling of [`OutputKind::Pubkey`] outputs.
pub fn p2pkh_from_pubkey_hex(pubkey_hex: &str, network: Network) -> Option<String> {
    let bytes = hex::decode(pubkey_hex).ok()?;
    let pubkey = PublicKey::from_slice(&bytes).ok()?;
    Some(Address::p2pkh(pubkey, network).to_string())
}
