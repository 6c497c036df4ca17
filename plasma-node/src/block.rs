//! Child-chain blocks
//!
//! Encoding: `rlp([[number, root, created_at], [tx, ...]])`. The block hash
//! covers `number` and `root` only, so the timestamp never changes identity.

use crate::crypto::keccak;
use crate::error::{DecodeError, Result, ValidationError};
use crate::merkle::{FixedMerkleTree, MerkleProof};
use crate::transaction::{data_at, ensure_consumed, Transaction, TxLookup};
use ethers::types::H256;
use ethers::utils::rlp::{Rlp, RlpStream};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Root carried by a header decoded without one: `keccak256(rlp(""))`
pub fn empty_rlp_root() -> H256 {
    keccak(&[0x80])
}

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Root-chain assigned number; 0 while unassigned
    pub number: u64,
    /// Merkle root of the transactions' merkle hashes
    pub root: H256,
    /// Creation time (unix seconds)
    pub created_at: u64,
}

impl BlockHeader {
    /// Create a header stamped with the current time
    pub fn new(number: u64, root: H256) -> Self {
        Self {
            number,
            root,
            created_at: chrono::Utc::now().timestamp().max(0) as u64,
        }
    }

    /// Identity hash over `(number, root)`
    pub fn hash(&self) -> H256 {
        let mut stream = RlpStream::new_list(2);
        stream.append(&self.number);
        stream.append(&self.root.as_bytes().to_vec());
        keccak(&stream.out())
    }

    fn append_to(&self, stream: &mut RlpStream) {
        stream.begin_list(3);
        stream.append(&self.number);
        stream.append(&self.root.as_bytes().to_vec());
        stream.append(&self.created_at);
    }

    /// Canonical encoding
    pub fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new();
        self.append_to(&mut stream);
        stream.out().to_vec()
    }

    fn decode_rlp(rlp: &Rlp<'_>) -> std::result::Result<Self, DecodeError> {
        if !rlp.is_list() {
            return Err(DecodeError::Rlp("header is not a list".to_string()));
        }
        let count = rlp.item_count()?;
        if count > 3 {
            return Err(DecodeError::ItemCount {
                expected: 3,
                got: count,
            });
        }

        let number = if count > 0 {
            decode_u64(data_at(rlp, 0, "number")?, "number")?
        } else {
            0
        };
        let root = if count > 1 {
            let bytes = data_at(rlp, 1, "root")?;
            if bytes.len() != 32 {
                return Err(DecodeError::FieldLength {
                    field: "root",
                    expected: 32,
                    got: bytes.len(),
                });
            }
            H256::from_slice(bytes)
        } else {
            empty_rlp_root()
        };
        let created_at = if count > 2 {
            decode_u64(data_at(rlp, 2, "created_at")?, "created_at")?
        } else {
            0
        };

        Ok(Self {
            number,
            root,
            created_at,
        })
    }
}

fn decode_u64(bytes: &[u8], field: &'static str) -> std::result::Result<u64, DecodeError> {
    if bytes.first() == Some(&0) || bytes.len() > 8 {
        return Err(DecodeError::NonCanonicalInteger(field));
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Block: header plus ordered transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Header
    pub header: BlockHeader,
    /// Transactions in leaf order
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Build a block over `transactions`, computing its root
    pub fn new(number: u64, transactions: Vec<Transaction>) -> Result<Self> {
        let root = Self::compute_root(&transactions)?;
        Ok(Self {
            header: BlockHeader::new(number, root),
            transactions,
        })
    }

    /// Assemble from an already split header and body
    pub fn from_parts(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// Split into header and body
    pub fn into_parts(self) -> (BlockHeader, Vec<Transaction>) {
        (self.header, self.transactions)
    }

    /// Decode the canonical encoding
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, DecodeError> {
        let rlp = Rlp::new(bytes);
        if !rlp.is_list() {
            return Err(DecodeError::Rlp("block is not a list".to_string()));
        }
        ensure_consumed(&rlp, bytes)?;
        let count = rlp.item_count()?;
        if count != 2 {
            return Err(DecodeError::ItemCount {
                expected: 2,
                got: count,
            });
        }

        let header = BlockHeader::decode_rlp(&rlp.at(0)?)?;
        let body = rlp.at(1)?;
        if !body.is_list() {
            return Err(DecodeError::Rlp("block body is not a list".to_string()));
        }
        let transactions = body
            .iter()
            .map(|item| Transaction::decode_rlp(&item))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            header,
            transactions,
        })
    }

    /// Canonical encoding
    pub fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(2);
        self.header.append_to(&mut stream);
        stream.begin_list(self.transactions.len());
        for tx in &self.transactions {
            stream.append_raw(&tx.encode(true), 1);
        }
        stream.out().to_vec()
    }

    /// Block hash (header hash)
    pub fn hash(&self) -> H256 {
        self.header.hash()
    }

    /// Number from the header
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Merkle root over the merkle hashes of `transactions`
    pub fn compute_root(transactions: &[Transaction]) -> Result<H256> {
        Ok(Self::tree_of(transactions)?.root())
    }

    fn tree_of(transactions: &[Transaction]) -> Result<FixedMerkleTree> {
        FixedMerkleTree::from_leaves(transactions.iter().map(Transaction::merkle_hash).collect())
    }

    /// Validate every transaction, reject cross-transaction double spends and
    /// require the header root to match the recomputed one
    pub fn validate<L: TxLookup + ?Sized>(&self, ledger: &L) -> Result<()> {
        let mut spent = HashSet::new();
        for tx in &self.transactions {
            tx.validate(ledger)?;
            for (_, position) in tx.spent_inputs() {
                if !spent.insert(position) {
                    return Err(ValidationError::DuplicateInput(position.to_string()).into());
                }
            }
        }

        let computed = Self::compute_root(&self.transactions)?;
        if computed != self.header.root {
            return Err(ValidationError::RootMismatch {
                header: format!("{:?}", self.header.root),
                computed: format!("{:?}", computed),
            }
            .into());
        }
        Ok(())
    }

    /// Inclusion proof for the transaction at `tx_index`
    pub fn merkle_proof(&self, tx_index: usize) -> Option<MerkleProof> {
        if tx_index >= self.transactions.len() {
            return None;
        }
        Self::tree_of(&self.transactions).ok()?.proof(tx_index)
    }
}

impl From<(BlockHeader, Vec<Transaction>)> for Block {
    fn from((header, transactions): (BlockHeader, Vec<Transaction>)) -> Self {
        Self::from_parts(header, transactions)
    }
}
