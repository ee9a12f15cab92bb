//! Core chain types: addresses, hashes, transactions, headers, blocks and receipts

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Error parsing a fixed-size hex value
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseBytesError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

macro_rules! fixed_bytes {
    ($(#[$doc:meta])* $name:ident, $len:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, BorshSerialize, BorshDeserialize)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn zero() -> Self {
                Self([0u8; $len])
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseBytesError> {
                let arr: [u8; $len] = bytes.try_into().map_err(|_| ParseBytesError::Length {
                    expected: $len,
                    actual: bytes.len(),
                })?;
                Ok(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }

        impl FromStr for $name {
            type Err = ParseBytesError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.strip_prefix("0x").unwrap_or(s);
                Self::from_slice(&hex::decode(raw)?)
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <String as Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_bytes!(
    /// 20-byte account address
    Address,
    20
);

fixed_bytes!(
    /// 32-byte hash
    H256,
    32
);

impl H256 {
    /// Hash arbitrary bytes
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }
}

impl Address {
    /// Derive the address controlled by an ed25519 public key
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self::from_public_key_bytes(key.as_bytes())
    }

    pub fn from_public_key_bytes(bytes: &[u8; 32]) -> Self {
        let digest = blake3::hash(bytes);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest.as_bytes()[12..]);
        Self(out)
    }

    pub fn from_signing_key(key: &SigningKey) -> Self {
        Self::from_public_key(&key.verifying_key())
    }
}

/// Hex serde for byte arrays and vectors
pub(crate) mod hex_serde {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, T: AsRef<[u8]>>(bytes: T, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&format_args!("0x{}", hex::encode(bytes.as_ref())))
    }

    pub fn deserialize<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let s = String::deserialize(d)?;
        let raw = hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(D::Error::custom)?;
        T::try_from(raw).map_err(|_| D::Error::custom("invalid byte length"))
    }
}

pub(crate) fn encode<T: BorshSerialize>(value: &T) -> Vec<u8> {
    borsh::to_vec(value).expect("in-memory borsh encoding should not fail")
}

/// Root over an ordered list of hashes
pub fn ordered_root<I: IntoIterator<Item = H256>>(items: I) -> H256 {
    let mut hasher = blake3::Hasher::new();
    for item in items {
        hasher.update(item.as_bytes());
    }
    H256(*hasher.finalize().as_bytes())
}

pub const BLOOM_BYTES: usize = 256;

/// 2048-bit bloom filter over log addresses and topics
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct Bloom(pub [u8; BLOOM_BYTES]);

impl Default for Bloom {
    fn default() -> Self {
        Self([0u8; BLOOM_BYTES])
    }
}

impl fmt::Debug for Bloom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bloom(0x{})", hex::encode(self.0))
    }
}

impl Bloom {
    fn bits(input: &[u8]) -> [(usize, u8); 3] {
        let digest = blake3::hash(input);
        let h = digest.as_bytes();
        let mut out = [(0usize, 0u8); 3];
        for (i, slot) in out.iter_mut().enumerate() {
            let bit = (u16::from_be_bytes([h[2 * i], h[2 * i + 1]]) & 2047) as usize;
            *slot = (BLOOM_BYTES - 1 - bit / 8, 1u8 << (bit % 8));
        }
        out
    }

    pub fn accrue(&mut self, input: &[u8]) {
        for (byte, mask) in Self::bits(input) {
            self.0[byte] |= mask;
        }
    }

    pub fn contains(&self, input: &[u8]) -> bool {
        Self::bits(input)
            .iter()
            .all(|(byte, mask)| self.0[*byte] & mask == *mask)
    }

    pub fn accrue_log(&mut self, log: &Log) {
        self.accrue(log.address.as_bytes());
        for topic in &log.topics {
            self.accrue(topic.as_bytes());
        }
    }

    /// Combined bloom of every log in the given receipts
    pub fn from_receipts(receipts: &[Receipt]) -> Self {
        let mut bloom = Self::default();
        for receipt in receipts {
            for (byte, other) in bloom.0.iter_mut().zip(receipt.bloom.0.iter()) {
                *byte |= other;
            }
        }
        bloom
    }
}

impl Serialize for Bloom {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex_serde::serialize(self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Bloom {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = hex_serde::deserialize(deserializer)?;
        let arr: [u8; BLOOM_BYTES] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("bloom must be 256 bytes"))?;
        Ok(Self(arr))
    }
}

/// An unsigned value transfer
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: u128,
    #[serde(with = "hex_serde")]
    pub data: Vec<u8>,
}

impl Transaction {
    /// Hash the sender signs
    pub fn signing_hash(&self) -> H256 {
        H256::hash(&encode(self))
    }

    pub fn sign(self, key: &SigningKey) -> SignedTransaction {
        let signature = key.sign(self.signing_hash().as_bytes());
        SignedTransaction {
            tx: self,
            signer: key.verifying_key().to_bytes(),
            signature: signature.to_bytes(),
        }
    }
}

/// A transaction carrying its sender's public key and signature
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx: Transaction,
    #[serde(with = "hex_serde")]
    pub signer: [u8; 32],
    #[serde(with = "hex_serde")]
    pub signature: [u8; 64],
}

impl SignedTransaction {
    pub fn hash(&self) -> H256 {
        H256::hash(&encode(self))
    }

    pub fn sender(&self) -> Address {
        Address::from_public_key_bytes(&self.signer)
    }

    pub fn nonce(&self) -> u64 {
        self.tx.nonce
    }

    /// Price used for block ordering
    pub fn effective_price(&self) -> u128 {
        self.tx.gas_price
    }

    pub fn gas_limit(&self) -> u64 {
        self.tx.gas_limit
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        let key = VerifyingKey::from_bytes(&self.signer)?;
        let signature = Signature::from_bytes(&self.signature);
        key.verify(self.tx.signing_hash().as_bytes(), &signature)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

/// Event emitted by a successful transaction
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<H256>,
    #[serde(with = "hex_serde")]
    pub data: Vec<u8>,
    /// Zero until the block is sealed
    pub block_hash: H256,
    pub block_number: u64,
    pub tx_hash: H256,
    pub tx_index: u32,
    pub log_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: H256,
    pub success: bool,
    pub gas_used: u64,
    pub cumulative_gas_used: u64,
    pub logs: Vec<Log>,
    pub bloom: Bloom,
}

impl Receipt {
    pub fn new(tx_hash: H256, gas_used: u64, cumulative_gas_used: u64, logs: Vec<Log>) -> Self {
        let mut bloom = Bloom::default();
        for log in &logs {
            bloom.accrue_log(log);
        }
        Self {
            tx_hash,
            success: true,
            gas_used,
            cumulative_gas_used,
            logs,
            bloom,
        }
    }
}

/// Length of the seal carried in `Header::extra`: public key followed by signature
pub const SEAL_LEN: usize = 32 + 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SealError {
    #[error("header carries no seal")]
    Missing,
    #[error("malformed seal of {0} bytes")]
    Malformed(usize),
    #[error("bad seal signature")]
    BadSignature,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Header {
    pub parent_hash: H256,
    pub number: u64,
    pub timestamp: u64,
    pub coinbase: Address,
    pub state_root: H256,
    pub tx_root: H256,
    pub receipts_root: H256,
    pub bloom: Bloom,
    pub gas_limit: u64,
    pub gas_used: u64,
    #[serde(with = "hex_serde")]
    pub extra: Vec<u8>,
}

impl Header {
    pub fn hash(&self) -> H256 {
        H256::hash(&encode(self))
    }

    /// Hash of the header without its seal; this is what a block maker signs
    pub fn seal_hash(&self) -> H256 {
        let mut unsealed = self.clone();
        unsealed.extra.clear();
        unsealed.hash()
    }

    pub fn seal(&mut self, key: &SigningKey) {
        let signature = key.sign(self.seal_hash().as_bytes());
        let mut extra = Vec::with_capacity(SEAL_LEN);
        extra.extend_from_slice(key.verifying_key().as_bytes());
        extra.extend_from_slice(&signature.to_bytes());
        self.extra = extra;
    }

    /// Verify the seal and return the address that produced it
    pub fn seal_signer(&self) -> Result<Address, SealError> {
        if self.extra.is_empty() {
            return Err(SealError::Missing);
        }
        if self.extra.len() != SEAL_LEN {
            return Err(SealError::Malformed(self.extra.len()));
        }
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&self.extra[..32]);
        let mut sig_bytes = [0u8; 64];
        sig_bytes.copy_from_slice(&self.extra[32..]);

        let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| SealError::BadSignature)?;
        key.verify(self.seal_hash().as_bytes(), &Signature::from_bytes(&sig_bytes))
            .map_err(|_| SealError::BadSignature)?;
        Ok(Address::from_public_key(&key))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<SignedTransaction>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<SignedTransaction>) -> Self {
        Self { header, transactions }
    }

    pub fn hash(&self) -> H256 {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> H256 {
        self.header.parent_hash
    }

    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    pub fn tx_root(&self) -> H256 {
        ordered_root(self.transactions.iter().map(SignedTransaction::hash))
    }
}

/// Root over the receipts of a block
pub fn receipts_root(receipts: &[Receipt]) -> H256 {
    ordered_root(receipts.iter().map(|r| H256::hash(&encode(r))))
}
