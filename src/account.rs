use rlp_derive::{RlpDecodable, RlpEncodable};

use crate::common::{Addr, Bytes, Hash, Wei};

/// The per-address record persisted in the account trie. The trie value is
/// exactly the RLP of this quadruple; anything else an executor tracks about
/// an account is working-set state and never reaches the root hash.
#[derive(RlpDecodable, RlpEncodable, Clone, PartialEq, Eq, Debug)]
pub struct Account {
    pub nonce: u64,
    pub balance: Wei,
    pub storage_root: Hash,
    pub code_hash: Hash,
}

impl Account {
    /// A fresh account: zero nonce and balance, no storage, no code.
    pub fn empty() -> Self {
        Self {
            nonce: 0,
            balance: Wei::zero().clone(),
            storage_root: Hash::empty_bytes_hash().clone(),
            code_hash: Hash::empty_bytes_hash().clone(),
        }
    }
}

/// A log record emitted by contract execution. `address`, `topics`, `data`
/// and `block_number` come from the emitting context; the rest is stamped
/// by [`StateDB::add_log`](crate::state::StateDB::add_log).
#[derive(Clone, Debug)]
pub struct Log {
    pub address: Addr,
    pub topics: Vec<Hash>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: Hash,
    pub tx_index: u32,
    pub block_hash: Hash,
    pub index: u32,
    pub removed: bool,
}

impl Log {
    pub fn new(address: Addr, topics: Vec<Hash>, data: Bytes) -> Self {
        Self {
            address,
            topics,
            data,
            block_number: 0,
            tx_hash: Hash::zero().clone(),
            tx_index: 0,
            block_hash: Hash::zero().clone(),
            index: 0,
            removed: false,
        }
    }
}

/// Optional account directory consulted when a brand-new address is
/// materialized and neither the working set nor the account trie knows it.
/// Most deployments leave this out and new accounts start from
/// [`Account::empty`].
pub trait AccountLoader: Send + Sync {
    fn load_account(&self, addr: &Addr) -> Option<Account>;
}

#[test]
fn test_account_rlp_roundtrip() {
    let acc = Account {
        nonce: 7,
        balance: Wei::from(1_000_000u64),
        storage_root: Hash::hash(b"root"),
        code_hash: Hash::hash(b"code"),
    };
    let enc = rlp::encode(&acc);
    let dec: Account = rlp::decode(&enc).unwrap();
    assert_eq!(acc, dec);
}

#[test]
fn test_empty_account_sentinels() {
    let acc = Account::empty();
    assert_eq!(&acc.storage_root, Hash::empty_bytes_hash());
    assert_eq!(&acc.code_hash, Hash::empty_bytes_hash());
    assert!(acc.balance.is_zero());
}
