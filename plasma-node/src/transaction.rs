//! Child-chain transactions
//!
//! A transaction is a fixed 11-field record followed by two signatures:
//!
//! ```text
//! [blknum1, txindex1, oindex1,
//!  blknum2, txindex2, oindex2,
//!  newowner1, amount1,
//!  newowner2, amount2,
//!  fee,
//!  sig1, sig2]
//! ```
//!
//! Numeric fields are minimal big-endian byte strings, owners are 20 bytes and
//! signatures 65 bytes. Missing trailing fields decode to their defaults.

use crate::crypto::{keccak, keccak_concat, KeyPair, Signature, SIGNATURE_LENGTH};
use crate::error::{DecodeError, Error, Result, ValidationError};
use ethers::types::{Address, H256, U256};
use ethers::utils::rlp::{Rlp, RlpStream};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of fields covered by the content hash
pub const UNSIGNED_FIELD_COUNT: usize = 11;

/// Number of fields in the full encoding
pub const FIELD_COUNT: usize = 13;

/// Position of an output: `(block number, tx index, output index)`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct UtxoPosition {
    /// Child block holding the creating transaction
    pub block_number: u64,
    /// Index of the transaction in its block
    pub tx_index: u32,
    /// Output slot (0 or 1)
    pub output_index: u8,
}

impl UtxoPosition {
    /// The empty input
    pub const NULL: UtxoPosition = UtxoPosition {
        block_number: 0,
        tx_index: 0,
        output_index: 0,
    };

    /// Create a position
    pub fn new(block_number: u64, tx_index: u32, output_index: u8) -> Self {
        Self {
            block_number,
            tx_index,
            output_index,
        }
    }

    /// True for an unused input slot
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Fixed-width key suffix: three 32-byte big-endian integers
    pub fn to_key_bytes(&self) -> [u8; 96] {
        let mut key = [0u8; 96];
        key[24..32].copy_from_slice(&self.block_number.to_be_bytes());
        key[60..64].copy_from_slice(&self.tx_index.to_be_bytes());
        key[95] = self.output_index;
        key
    }

    /// Parse the fixed-width key suffix written by [`UtxoPosition::to_key_bytes`]
    pub fn from_key_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 96 {
            return None;
        }
        let block_number = u64::from_be_bytes(bytes[24..32].try_into().ok()?);
        let tx_index = u32::from_be_bytes(bytes[60..64].try_into().ok()?);
        Some(Self::new(block_number, tx_index, bytes[95]))
    }

    /// Identifier the root chain uses for an exit of this output
    pub fn exit_id(&self) -> U256 {
        let mut stream = RlpStream::new_list(3);
        stream.append(&self.block_number);
        stream.append(&u64::from(self.tx_index));
        stream.append(&u64::from(self.output_index));
        U256::from_big_endian(keccak(&stream.out()).as_bytes())
    }
}

impl fmt::Display for UtxoPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.block_number, self.tx_index, self.output_index
        )
    }
}

/// Transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Output {
    /// Owner of the output (zero address for an unused slot)
    pub owner: Address,
    /// Amount
    pub amount: U256,
}

impl Output {
    /// Create an output
    pub fn new(owner: Address, amount: U256) -> Self {
        Self { owner, amount }
    }

    /// True for an unused output slot
    pub fn is_null(&self) -> bool {
        self.owner.is_zero() && self.amount.is_zero()
    }
}

/// Which input a signature belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSlot {
    /// First input (`sig1`)
    First,
    /// Second input (`sig2`)
    Second,
}

/// Child-chain transaction
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transaction {
    /// Spent positions (null when unused)
    pub inputs: [UtxoPosition; 2],
    /// Created outputs
    pub outputs: [Output; 2],
    /// Fee paid to the operator
    pub fee: U256,
    /// Signature over [`Transaction::hash`] for input 1
    pub sig1: Signature,
    /// Signature over [`Transaction::hash`] for input 2
    pub sig2: Signature,
}

impl Transaction {
    /// Create an unsigned transaction
    pub fn new(inputs: [UtxoPosition; 2], outputs: [Output; 2], fee: U256) -> Self {
        Self {
            inputs,
            outputs,
            fee,
            sig1: Signature::EMPTY,
            sig2: Signature::EMPTY,
        }
    }

    /// Deposit transaction crediting `amount` to `owner`
    pub fn deposit(owner: Address, amount: U256) -> Self {
        Self::new(
            [UtxoPosition::NULL; 2],
            [Output::new(owner, amount), Output::default()],
            U256::zero(),
        )
    }

    /// True iff both inputs are null
    pub fn is_deposit(&self) -> bool {
        self.inputs.iter().all(UtxoPosition::is_null)
    }

    /// Inputs actually spent by this transaction
    pub fn spent_inputs(&self) -> impl Iterator<Item = (usize, UtxoPosition)> + '_ {
        self.inputs
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, input)| !input.is_null())
    }

    fn append_fields(&self, stream: &mut RlpStream) {
        for input in &self.inputs {
            stream.append(&input.block_number);
            stream.append(&u64::from(input.tx_index));
            stream.append(&u64::from(input.output_index));
        }
        for output in &self.outputs {
            stream.append(&output.owner.as_bytes().to_vec());
            stream.append(&output.amount);
        }
        stream.append(&self.fee);
    }

    /// Canonical encoding, with or without the signature fields
    pub fn encode(&self, include_signatures: bool) -> Vec<u8> {
        let mut stream = if include_signatures {
            RlpStream::new_list(FIELD_COUNT)
        } else {
            RlpStream::new_list(UNSIGNED_FIELD_COUNT)
        };
        self.append_fields(&mut stream);
        if include_signatures {
            stream.append(&self.sig1.as_bytes().to_vec());
            stream.append(&self.sig2.as_bytes().to_vec());
        }
        stream.out().to_vec()
    }

    /// Decode from the canonical encoding
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, DecodeError> {
        let rlp = Rlp::new(bytes);
        ensure_consumed(&rlp, bytes)?;
        Self::decode_rlp(&rlp)
    }

    pub(crate) fn decode_rlp(rlp: &Rlp<'_>) -> std::result::Result<Self, DecodeError> {
        if !rlp.is_list() {
            return Err(DecodeError::Rlp("transaction is not a list".to_string()));
        }
        let count = rlp.item_count()?;
        if count > FIELD_COUNT {
            return Err(DecodeError::ItemCount {
                expected: FIELD_COUNT,
                got: count,
            });
        }

        let field = |index: usize| field_at(rlp, count, index, FIELD_NAMES[index]);

        let mut inputs = [UtxoPosition::NULL; 2];
        for (slot, input) in inputs.iter_mut().enumerate() {
            let base = slot * 3;
            let block_number = decode_uint(field(base)?, "blknum", 8)?;
            let tx_index = decode_uint(field(base + 1)?, "txindex", 4)?;
            let output_index = decode_uint(field(base + 2)?, "oindex", 1)?;
            *input = UtxoPosition::new(
                block_number.low_u64(),
                tx_index.low_u32(),
                output_index.byte(0),
            );
        }

        let mut outputs = [Output::default(); 2];
        for (slot, output) in outputs.iter_mut().enumerate() {
            let base = 6 + slot * 2;
            let owner = decode_fixed::<20>(field(base)?, "newowner")?;
            let amount = decode_uint(field(base + 1)?, "amount", 32)?;
            *output = Output::new(Address::from(owner), amount);
        }

        let fee = decode_uint(field(10)?, "fee", 32)?;
        let sig1 = Signature::from_bytes(decode_fixed::<SIGNATURE_LENGTH>(field(11)?, "sig1")?);
        let sig2 = Signature::from_bytes(decode_fixed::<SIGNATURE_LENGTH>(field(12)?, "sig2")?);

        Ok(Self {
            inputs,
            outputs,
            fee,
            sig1,
            sig2,
        })
    }

    /// Content hash; covers the signatures only when requested
    pub fn hash(&self, include_signatures: bool) -> H256 {
        keccak(&self.encode(include_signatures))
    }

    /// Leaf committed into the block Merkle tree
    pub fn merkle_hash(&self) -> H256 {
        keccak_concat(&[
            self.hash(false).as_bytes(),
            self.sig1.as_bytes(),
            self.sig2.as_bytes(),
        ])
    }

    /// Sign one input slot over the unsigned content hash
    pub fn sign(&mut self, slot: InputSlot, key: &KeyPair) -> Result<()> {
        let signature = key.sign_hash(self.hash(false))?;
        match slot {
            InputSlot::First => self.sig1 = signature,
            InputSlot::Second => self.sig2 = signature,
        }
        Ok(())
    }

    /// Sign `hash(false) || sig1 || sig2 || root`, attesting the signer saw `root`
    pub fn confirm_signature(&self, root: H256, key: &KeyPair) -> Result<Signature> {
        key.sign_hash(self.confirmation_hash(root))
    }

    /// Message covered by a confirm signature
    pub fn confirmation_hash(&self, root: H256) -> H256 {
        keccak_concat(&[
            self.hash(false).as_bytes(),
            self.sig1.as_bytes(),
            self.sig2.as_bytes(),
            root.as_bytes(),
        ])
    }

    fn check_structure(&self) -> std::result::Result<(), ValidationError> {
        let [first, second] = self.inputs;
        if first.is_null() && !second.is_null() {
            return Err(ValidationError::Malformed(
                "first input is null but second is set".to_string(),
            ));
        }
        for input in self.inputs.iter().filter(|i| !i.is_null()) {
            if input.block_number == 0 {
                return Err(ValidationError::Malformed(format!(
                    "input {} references block 0",
                    input
                )));
            }
            if input.output_index > 1 {
                return Err(ValidationError::Malformed(format!(
                    "input {} has output index out of range",
                    input
                )));
            }
        }
        if !second.is_null() && first == second {
            return Err(ValidationError::DuplicateInput(first.to_string()));
        }
        Ok(())
    }

    /// Resolve the output an input position points at
    pub fn resolve_input<L: TxLookup + ?Sized>(
        ledger: &L,
        position: UtxoPosition,
    ) -> Result<Output> {
        let source = ledger
            .tx_at(position.block_number, position.tx_index)?
            .ok_or_else(|| ValidationError::UnknownInput(position.to_string()))?;
        source
            .outputs
            .get(usize::from(position.output_index))
            .copied()
            .ok_or_else(|| ValidationError::UnknownInput(position.to_string()).into())
    }

    /// Structural checks plus funds conservation against resolved inputs
    ///
    /// Deposit transactions pass the structural checks only; their value is
    /// backed by the root chain.
    pub fn validate<L: TxLookup + ?Sized>(&self, ledger: &L) -> Result<()> {
        self.check_structure()?;
        if self.is_deposit() {
            return Ok(());
        }

        let mut inputs_total = U256::zero();
        for (_, position) in self.spent_inputs() {
            let source = Self::resolve_input(ledger, position)?;
            inputs_total = inputs_total
                .checked_add(source.amount)
                .ok_or_else(|| ValidationError::Malformed("input sum overflows".to_string()))?;
        }

        let spent = self
            .outputs
            .iter()
            .try_fold(self.fee, |acc, output| acc.checked_add(output.amount))
            .ok_or_else(|| ValidationError::Malformed("output sum overflows".to_string()))?;

        if spent > inputs_total {
            return Err(ValidationError::InsufficientFunds {
                inputs: inputs_total.to_string(),
                spent: spent.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Check that every spent input is signed by the owner of its output
    pub fn verify_signatures<L: TxLookup + ?Sized>(&self, ledger: &L) -> Result<()> {
        let message = self.hash(false);
        for (slot, position) in self.spent_inputs() {
            let owner = Self::resolve_input(ledger, position)?.owner;
            let signature = if slot == 0 { &self.sig1 } else { &self.sig2 };
            if signature.recover(message) != Some(owner) {
                return Err(ValidationError::InvalidSignature(slot).into());
            }
        }
        Ok(())
    }
}

/// Source of committed transactions, addressed by position
pub trait TxLookup {
    /// Transaction at `(block_number, tx_index)`, if committed
    fn tx_at(&self, block_number: u64, tx_index: u32) -> Result<Option<Transaction>>;
}

const FIELD_NAMES: [&str; FIELD_COUNT] = [
    "blknum1", "txindex1", "oindex1", "blknum2", "txindex2", "oindex2", "newowner1", "amount1",
    "newowner2", "amount2", "fee", "sig1", "sig2",
];

/// Raw bytes of item `index`, or `None` past the end of a short list
fn field_at<'a>(
    rlp: &Rlp<'a>,
    count: usize,
    index: usize,
    field: &'static str,
) -> std::result::Result<Option<&'a [u8]>, DecodeError> {
    if index < count {
        Ok(Some(data_at(rlp, index, field)?))
    } else {
        Ok(None)
    }
}

/// Payload of the byte-string item at `index`; nested lists are refused
pub(crate) fn data_at<'a>(
    rlp: &Rlp<'a>,
    index: usize,
    field: &'static str,
) -> std::result::Result<&'a [u8], DecodeError> {
    let item = rlp.at(index)?;
    if !item.is_data() {
        return Err(DecodeError::UnexpectedList(field));
    }
    Ok(item.data()?)
}

/// Fail when `bytes` holds more than the single top-level item
pub(crate) fn ensure_consumed(rlp: &Rlp<'_>, bytes: &[u8]) -> std::result::Result<(), DecodeError> {
    let used = rlp.payload_info()?.total();
    if used < bytes.len() {
        return Err(DecodeError::TrailingBytes(bytes.len() - used));
    }
    Ok(())
}

/// Parse a minimal big-endian integer of at most `max_len` bytes
fn decode_uint(
    bytes: Option<&[u8]>,
    field: &'static str,
    max_len: usize,
) -> std::result::Result<U256, DecodeError> {
    let bytes = match bytes {
        Some(bytes) => bytes,
        None => return Ok(U256::zero()),
    };
    if bytes.first() == Some(&0) || bytes.len() > max_len {
        return Err(DecodeError::NonCanonicalInteger(field));
    }
    Ok(U256::from_big_endian(bytes))
}

/// Parse a fixed-width byte field, zero-filled when absent
fn decode_fixed<const N: usize>(
    bytes: Option<&[u8]>,
    field: &'static str,
) -> std::result::Result<[u8; N], DecodeError> {
    match bytes {
        None => Ok([0u8; N]),
        Some(bytes) => bytes.try_into().map_err(|_| DecodeError::FieldLength {
            field,
            expected: N,
            got: bytes.len(),
        }),
    }
}

impl TryFrom<&[u8]> for Transaction {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        Ok(Transaction::decode(bytes)?)
    }
}
