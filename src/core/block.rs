use crate::consensus::monetary::MonetaryPolicy;
use crate::consensus::params::{ConsensusParams, GENESIS_SEED};
use crate::core::Transaction;
use crate::crypto::hash::{Hash256, Hashable};
use crate::crypto::keys::KeyPair;
use crate::mining::difficulty::hash_meets_target;
use crate::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub previous_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u64,
    pub target_bits: u32,
    pub nonce: u64,
    pub height: u64,
}

impl Block {
    pub fn new(
        previous_hash: Hash256,
        transactions: Vec<Transaction>,
        target_bits: u32,
        height: u64,
        timestamp: u64,
    ) -> Self {
        let merkle_root = Self::calculate_merkle_root(&transactions);

        Self {
            header: BlockHeader {
                previous_hash,
                merkle_root,
                timestamp,
                target_bits,
                nonce: 0,
                height,
            },
            transactions,
        }
    }

    /// Deterministic first block for a parameter set. Exempt from work checks.
    pub fn genesis(params: &ConsensusParams) -> Result<Self> {
        let recipient = KeyPair::from_seed(GENESIS_SEED)?.address();
        let subsidy = MonetaryPolicy::new(params).subsidy(0);
        let coinbase = Transaction::new_coinbase(recipient, subsidy, 0);

        Ok(Self::new(
            Hash256::zero(),
            vec![coinbase],
            params.initial_target_bits,
            0,
            params.genesis_timestamp,
        ))
    }

    /// Binary merkle tree over transaction ids; an odd level repeats its last hash.
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash256 {
        if transactions.is_empty() {
            return Hash256::zero();
        }

        let mut hashes: Vec<Hash256> = transactions.iter().map(|tx| tx.id()).collect();

        while hashes.len() > 1 {
            hashes = hashes
                .chunks(2)
                .map(|pair| Hash256::combine(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
        }

        hashes[0]
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn meets_target(&self) -> bool {
        self.header.meets_target()
    }

    pub fn size(&self) -> usize {
        bincode::serialized_size(self).map(|n| n as usize).unwrap_or(usize::MAX)
    }
}

impl BlockHeader {
    pub fn meets_target(&self) -> bool {
        hash_meets_target(&self.hash(), self.target_bits)
    }
}

impl Hashable for Block {
    fn hash(&self) -> Hash256 {
        self.header.hash()
    }
}

impl Hashable for BlockHeader {
    fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(32 + 32 + 8 + 4 + 8 + 8);
        data.extend_from_slice(self.previous_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.target_bits.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        data.extend_from_slice(&self.height.to_le_bytes());

        Hash256::hash(&data)
    }
}
