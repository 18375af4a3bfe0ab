use crate::crypto::hash::{Hash256, Hashable};
use crate::crypto::keys::{KeyPair, PublicKey};
use crate::crypto::signatures::Signature;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const TRANSACTION_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Earliest block height the transaction may be mined at. For a coinbase
    /// this is the height of the block that carries it.
    pub lock_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub signature: Signature,
    pub public_key: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// 36-byte storage key: txid followed by the little-endian output index.
    pub fn to_key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(self.txid.as_bytes());
        key[32..].copy_from_slice(&self.vout.to_le_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != 36 {
            return None;
        }
        let txid = Hash256::from_slice(&key[..32])?;
        let vout = u32::from_le_bytes(key[32..36].try_into().ok()?);
        Some(Self { txid, vout })
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl TxOutput {
    pub fn new(value: u64, address: impl Into<String>) -> Self {
        Self {
            value,
            address: address.into(),
        }
    }
}

impl Transaction {
    /// Coinbase paying `value` to `address` in the block at `height`.
    pub fn new_coinbase(address: impl Into<String>, value: u64, height: u64) -> Self {
        Self {
            version: TRANSACTION_VERSION,
            inputs: Vec::new(),
            outputs: vec![TxOutput::new(value, address)],
            lock_time: height,
        }
    }

    /// Builds a transaction spending `inputs`, each signed by the paired key.
    pub fn new_signed(inputs: &[(OutPoint, &KeyPair)], outputs: Vec<TxOutput>) -> Result<Self> {
        let mut tx = Self {
            version: TRANSACTION_VERSION,
            inputs: inputs
                .iter()
                .map(|(outpoint, keypair)| TxInput {
                    previous_output: *outpoint,
                    signature: Signature::empty(),
                    public_key: keypair.public_key.clone(),
                })
                .collect(),
            outputs,
            lock_time: 0,
        };

        let sighash = tx.signature_hash();
        for (input, (_, keypair)) in tx.inputs.iter_mut().zip(inputs) {
            input.signature = keypair.sign(&sighash)?;
        }
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn id(&self) -> Hash256 {
        self.hash()
    }

    /// None on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, output| acc.checked_add(output.value))
    }

    pub fn size(&self) -> usize {
        bincode::serialized_size(self).map(|n| n as usize).unwrap_or(usize::MAX)
    }

    /// Digest every input signs: all fields except the signatures themselves.
    pub fn signature_hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(self.size());
        self.write_bytes(&mut data, false);
        Hash256::hash(&data)
    }

    fn write_bytes(&self, data: &mut Vec<u8>, with_signatures: bool) {
        data.extend_from_slice(&self.version.to_le_bytes());

        data.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            data.extend_from_slice(input.previous_output.txid.as_bytes());
            data.extend_from_slice(&input.previous_output.vout.to_le_bytes());

            let key = input.public_key.to_bytes();
            data.extend_from_slice(&(key.len() as u32).to_le_bytes());
            data.extend_from_slice(key);

            if with_signatures {
                data.extend_from_slice(&input.signature.to_compact());
            }
        }

        data.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            data.extend_from_slice(&output.value.to_le_bytes());
            data.extend_from_slice(&(output.address.len() as u32).to_le_bytes());
            data.extend_from_slice(output.address.as_bytes());
        }

        data.extend_from_slice(&self.lock_time.to_le_bytes());
    }
}

impl Hashable for Transaction {
    fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(self.size());
        self.write_bytes(&mut data, true);
        Hash256::hash(&data)
    }
}
