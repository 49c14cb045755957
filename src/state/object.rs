use std::collections::hash_map::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use log::error;

use crate::account::Account;
use crate::common::{Addr, Bytes, Hash, U256RLP, Wei};
use crate::db::{Database, StateError, Trie};
use crate::state::journal::{Change, Journal};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The in-memory shadow of one account: the persisted quadruple plus the
/// lazily loaded code, the lazily opened storage trie and the slot caches
/// that shadow it. All journaling happens here or in the facade; the trie
/// is only touched by the flush paths (`update_trie` and friends).
pub(crate) struct StateObject {
    pub(crate) address: Addr,
    pub(crate) addr_hash: Hash,
    pub(crate) account: Account,

    pub(crate) code: Option<Bytes>,
    pub(crate) dirty_code: bool,

    /// Storage trie handle, opened on first slot access at the account's
    /// current storage root.
    pub(crate) trie: Option<Box<dyn Trie>>,
    /// Every slot observed or written since the last reset; shadows the
    /// trie on reads.
    pub(crate) cached_storage: HashMap<Hash, Hash>,
    /// Slot writes not yet flushed to the storage trie.
    pub(crate) dirty_storage: HashMap<Hash, Hash>,

    pub(crate) suicided: bool,
    pub(crate) deleted: bool,
    pub(crate) touched: bool,

    // Bookkeeping carried on the live object only; never encoded.
    pub(crate) created: u64,
    pub(crate) updated: u64,
}

impl StateObject {
    pub(crate) fn new(address: Addr, account: Account) -> Self {
        let now = unix_now();
        let addr_hash = Hash::hash(address.as_bytes());
        Self {
            address,
            addr_hash,
            account,
            code: None,
            dirty_code: false,
            trie: None,
            cached_storage: HashMap::new(),
            dirty_storage: HashMap::new(),
            suicided: false,
            deleted: false,
            touched: false,
            created: now,
            updated: now,
        }
    }

    /// EIP-161: no nonce, no balance, no code.
    pub(crate) fn is_empty(&self) -> bool {
        self.account.nonce == 0
            && self.account.balance.is_zero()
            && &self.account.code_hash == Hash::empty_bytes_hash()
    }

    pub(crate) fn mark_suicided(&mut self) {
        self.suicided = true;
    }

    fn touch(&mut self, journal: &mut Journal) {
        journal.append(Change::Touch {
            address: self.address.clone(),
            prev: self.touched,
        });
        self.touched = true;
    }

    // Balance / nonce / code setters. Each records its delta before
    // mutating, so the journal always holds the pre-image.

    pub(crate) fn add_balance(&mut self, journal: &mut Journal, amount: &Wei) {
        // A zero-amount credit still makes an empty account observable.
        if amount.is_zero() {
            if self.is_empty() {
                self.touch(journal);
            }
            return
        }
        let balance = self.account.balance.saturating_add(amount);
        self.set_balance(journal, balance);
    }

    pub(crate) fn sub_balance(&mut self, journal: &mut Journal, amount: &Wei) {
        if amount.is_zero() {
            return
        }
        let balance = self.account.balance.saturating_sub(amount);
        self.set_balance(journal, balance);
    }

    pub(crate) fn set_balance(&mut self, journal: &mut Journal, balance: Wei) {
        journal.append(Change::Balance {
            address: self.address.clone(),
            prev: self.account.balance.clone(),
        });
        self.set_balance_raw(balance);
    }

    pub(crate) fn set_balance_raw(&mut self, balance: Wei) {
        self.account.balance = balance;
        self.updated = unix_now();
    }

    pub(crate) fn set_nonce(&mut self, journal: &mut Journal, nonce: u64) {
        journal.append(Change::Nonce {
            address: self.address.clone(),
            prev: self.account.nonce,
        });
        self.account.nonce = nonce;
        self.updated = unix_now();
    }

    pub(crate) fn set_code(
        &mut self, db: &dyn Database, journal: &mut Journal, code_hash: Hash,
        code: Bytes,
    ) -> Result<(), StateError> {
        // The journal wants the previous blob, which may still be on disk.
        let (prev_code, res) = match self.code(db) {
            Ok(c) => (c, Ok(())),
            Err(e) => (Bytes::empty(), Err(e)),
        };
        journal.append(Change::Code {
            address: self.address.clone(),
            prev_hash: self.account.code_hash.clone(),
            prev_code,
        });
        self.code = Some(code);
        self.account.code_hash = code_hash;
        self.dirty_code = true;
        self.updated = unix_now();
        res
    }

    /// Contract bytecode, fetched through the store on first use.
    pub(crate) fn code(
        &mut self, db: &dyn Database,
    ) -> Result<Bytes, StateError> {
        if let Some(code) = &self.code {
            return Ok(code.clone())
        }
        if &self.account.code_hash == Hash::empty_bytes_hash() {
            return Ok(Bytes::empty())
        }
        let code =
            db.contract_code(&self.addr_hash, &self.account.code_hash)?;
        self.code = Some(code.clone());
        Ok(code)
    }

    pub(crate) fn code_size(
        &self, db: &dyn Database,
    ) -> Result<usize, StateError> {
        if let Some(code) = &self.code {
            return Ok(code.len())
        }
        if &self.account.code_hash == Hash::empty_bytes_hash() {
            return Ok(0)
        }
        db.contract_code_size(&self.addr_hash, &self.account.code_hash)
    }

    // Storage.

    fn storage_trie_mut(
        &mut self, db: &dyn Database,
    ) -> Result<&mut dyn Trie, StateError> {
        let trie = match self.trie.take() {
            Some(t) => t,
            None => db.open_trie(&self.account.storage_root)?,
        };
        Ok(self.trie.insert(trie).as_mut())
    }

    /// Hand the storage trie handle over, opening it first if no slot was
    /// ever accessed.
    pub(crate) fn take_trie(
        &mut self, db: &dyn Database,
    ) -> Result<Box<dyn Trie>, StateError> {
        match self.trie.take() {
            Some(t) => Ok(t),
            None => db.open_trie(&self.account.storage_root),
        }
    }

    /// Read one slot: dirty writes first, then the observed cache, then
    /// the trie. Slots absent everywhere read as the zero hash.
    pub(crate) fn get_state(
        &mut self, db: &dyn Database, key: &Hash,
    ) -> Result<Hash, StateError> {
        if let Some(value) = self.dirty_storage.get(key) {
            return Ok(value.clone())
        }
        if let Some(value) = self.cached_storage.get(key) {
            return Ok(value.clone())
        }
        let address = self.address.clone();
        let trie = self.storage_trie_mut(db)?;
        let mut value = Hash::zero().clone();
        if let Some(enc) = trie.try_get(key.as_bytes())? {
            match rlp::decode::<U256RLP>(&enc) {
                Ok(v) => value = Hash::from(v.0),
                Err(err) => {
                    error!(
                        "undecodable storage slot {} of {}: {}",
                        key, address, err
                    );
                }
            }
        }
        self.cached_storage.insert(key.clone(), value.clone());
        Ok(value)
    }

    pub(crate) fn set_state(
        &mut self, db: &dyn Database, journal: &mut Journal, key: Hash,
        value: Hash,
    ) -> Result<(), StateError> {
        let (prev, res) = match self.get_state(db, &key) {
            Ok(v) => (v, Ok(())),
            Err(e) => (Hash::zero().clone(), Err(e)),
        };
        journal.append(Change::Storage {
            address: self.address.clone(),
            key: key.clone(),
            prev,
        });
        self.set_storage_raw(key, value);
        res
    }

    pub(crate) fn set_storage_raw(&mut self, key: Hash, value: Hash) {
        self.cached_storage.insert(key.clone(), value.clone());
        self.dirty_storage.insert(key, value);
    }

    /// Flush the dirty slot set into the storage trie. Zero values delete
    /// their key. The first trie error wins but the remaining writes are
    /// still applied, matching the deferred-error policy.
    pub(crate) fn update_trie(
        &mut self, db: &dyn Database,
    ) -> Result<(), StateError> {
        if self.dirty_storage.is_empty() {
            return Ok(())
        }
        let dirty: Vec<(Hash, Hash)> = self.dirty_storage.drain().collect();
        let trie = self.storage_trie_mut(db)?;
        let mut first_err = None;
        for (key, value) in dirty {
            let res = if value.is_zero() {
                trie.try_delete(key.as_bytes())
            } else {
                let enc = rlp::encode(&U256RLP(value.into()));
                trie.try_update(key.as_bytes(), &enc)
            };
            if let Err(e) = res {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// `update_trie` plus adopting the resulting root into the account.
    pub(crate) fn update_root(
        &mut self, db: &dyn Database,
    ) -> Result<(), StateError> {
        self.update_trie(db)?;
        if let Some(trie) = &self.trie {
            self.account.storage_root = trie.hash();
        }
        Ok(())
    }

    /// `update_trie` plus committing the storage trie to the store.
    pub(crate) fn commit_trie(
        &mut self, db: &dyn Database,
    ) -> Result<(), StateError> {
        self.update_trie(db)?;
        if let Some(trie) = self.trie.as_mut() {
            let root = trie.commit(&mut |_, _| Ok(()))?;
            self.account.storage_root = root;
        }
        Ok(())
    }

    /// Decoded (key, value) pairs currently persisted in the storage trie,
    /// regardless of the caches.
    pub(crate) fn committed_storage(
        &mut self, db: &dyn Database,
    ) -> Result<Vec<(Hash, Hash)>, StateError> {
        let address = self.address.clone();
        let trie = self.storage_trie_mut(db)?;
        let mut out = Vec::new();
        for (key, value) in trie.node_iter()? {
            let key = trie.get_key(&key);
            if key.len() != 32 {
                continue
            }
            match rlp::decode::<U256RLP>(&value) {
                Ok(v) => out.push((Hash::from_slice(&key), Hash::from(v.0))),
                Err(err) => {
                    error!(
                        "undecodable storage slot of {}: {}",
                        address, err
                    );
                }
            }
        }
        Ok(out)
    }

    /// An independent clone sharing no mutable state with the original.
    pub(crate) fn deep_copy(&self, db: &dyn Database) -> StateObject {
        StateObject {
            address: self.address.clone(),
            addr_hash: self.addr_hash.clone(),
            account: self.account.clone(),
            code: self.code.clone(),
            dirty_code: self.dirty_code,
            trie: self.trie.as_ref().map(|t| db.copy_trie(t.as_ref())),
            cached_storage: self.cached_storage.clone(),
            dirty_storage: self.dirty_storage.clone(),
            suicided: self.suicided,
            deleted: self.deleted,
            touched: self.touched,
            created: self.created,
            updated: self.updated,
        }
    }
}

#[test]
fn test_zero_add_touches_empty() {
    let mut journal = Journal::default();
    let mut obj = StateObject::new(Addr::zero().clone(), Account::empty());
    assert!(obj.is_empty());
    obj.add_balance(&mut journal, Wei::zero());
    assert!(obj.touched);
    assert_eq!(journal.len(), 1);
    assert_eq!(journal.dirties_len(), 1);
}

#[test]
fn test_balance_arithmetic_journals_previous() {
    let mut journal = Journal::default();
    let mut obj = StateObject::new(Addr::zero().clone(), Account::empty());
    obj.add_balance(&mut journal, &Wei::from(100u64));
    obj.sub_balance(&mut journal, &Wei::from(30u64));
    assert_eq!(obj.account.balance, Wei::from(70u64));
    assert!(!obj.is_empty());
    // zero-amount debit is a no-op, no touch, no delta
    let before = journal.len();
    obj.sub_balance(&mut journal, Wei::zero());
    assert_eq!(journal.len(), before);
}
