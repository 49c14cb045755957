//! The mutable, revertible account state layer between an executor and its
//! persistent store. [`StateDB`] buffers every mutation in memory, journals
//! it for snapshot rollback, and folds the result into a single account
//! trie root on commit.

use std::collections::hash_map::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, error};

use crate::account::{Account, AccountLoader, Log};
use crate::common::{Addr, Bytes, Hash, Wei};
use crate::db::{Database, StateError, Trie};

mod journal;
mod object;

use journal::{Change, Journal};
use object::StateObject;

struct Revision {
    id: u32,
    journal_len: usize,
}

/// The general query and mutation interface over the world state: account
/// balances, nonces, contract code and contract storage. Objects load
/// lazily from the account trie, mutations go through the journal, and
/// nothing reaches the store before [`finalise`](StateDB::finalise) /
/// [`commit`](StateDB::commit).
///
/// Exactly one executor drives a StateDB at a time; every receiver is
/// `&mut self` and that exclusivity is the whole concurrency story.
/// Store errors observed on read or ordinary-write paths never interrupt
/// execution: the first one is memoized and handed back by `commit`.
pub struct StateDB {
    db: Arc<dyn Database>,
    trie: Box<dyn Trie>,

    /// Live objects, modified in place while processing a transition.
    pub(crate) state_objects: HashMap<Addr, StateObject>,
    state_objects_dirty: HashSet<Addr>,

    db_err: Option<StateError>,

    pub(crate) refund: u64,

    thash: Hash,
    bhash: Hash,
    tx_index: u32,
    pub(crate) logs: HashMap<Hash, Vec<Log>>,
    pub(crate) log_size: u32,

    pub(crate) preimages: HashMap<Hash, Bytes>,

    journal: Journal,
    valid_revisions: Vec<Revision>,
    next_revision_id: u32,

    account_loader: Option<Arc<dyn AccountLoader>>,
}

impl StateDB {
    /// Open a new state over the account trie rooted at `root`.
    pub fn new(
        root: &Hash, db: Arc<dyn Database>,
    ) -> Result<Self, StateError> {
        let trie = db.open_trie(root)?;
        Ok(Self {
            db,
            trie,
            state_objects: HashMap::new(),
            state_objects_dirty: HashSet::new(),
            db_err: None,
            refund: 0,
            thash: Hash::zero().clone(),
            bhash: Hash::zero().clone(),
            tx_index: 0,
            logs: HashMap::new(),
            log_size: 0,
            preimages: HashMap::new(),
            journal: Journal::default(),
            valid_revisions: Vec::new(),
            next_revision_id: 0,
            account_loader: None,
        })
    }

    /// Like [`new`](Self::new), with an account directory consulted when a
    /// previously unseen address is materialized.
    pub fn new_with_loader(
        root: &Hash, db: Arc<dyn Database>, loader: Arc<dyn AccountLoader>,
    ) -> Result<Self, StateError> {
        let mut state = Self::new(root, db)?;
        state.account_loader = Some(loader);
        Ok(state)
    }

    fn set_error(&mut self, err: StateError) {
        debug!("state error memoized: {}", err);
        if self.db_err.is_none() {
            self.db_err = Some(err);
        }
    }

    /// The first store error observed so far, if any.
    pub fn error(&self) -> Option<&StateError> {
        self.db_err.as_ref()
    }

    /// Reopen the account trie at `root` and drop all ephemeral working
    /// state. Used between blocks.
    pub fn reset(&mut self, root: &Hash) -> Result<(), StateError> {
        debug!("state reset to root {}", root);
        self.trie = self.db.open_trie(root)?;
        self.state_objects.clear();
        self.state_objects_dirty.clear();
        self.thash = Hash::zero().clone();
        self.bhash = Hash::zero().clone();
        self.tx_index = 0;
        self.logs.clear();
        self.log_size = 0;
        self.preimages.clear();
        self.clear_journal_and_refund();
        Ok(())
    }

    /// Record a log emitted by the currently prepared transaction, stamping
    /// the transaction/block context onto it.
    pub fn add_log(&mut self, mut log: Log) {
        self.journal.append(Change::AddLog {
            tx_hash: self.thash.clone(),
        });
        log.tx_hash = self.thash.clone();
        log.block_hash = self.bhash.clone();
        log.tx_index = self.tx_index;
        log.index = self.log_size;
        log.removed = false;
        self.logs.entry(self.thash.clone()).or_default().push(log);
        self.log_size += 1;
    }

    pub fn get_logs(&self, tx_hash: &Hash) -> Vec<Log> {
        self.logs.get(tx_hash).cloned().unwrap_or_default()
    }

    pub fn logs(&self) -> Vec<Log> {
        self.logs.values().flatten().cloned().collect()
    }

    /// Record a SHA3 preimage seen by the VM. First write per hash wins.
    pub fn add_preimage(&mut self, hash: Hash, preimage: &[u8]) {
        if self.preimages.contains_key(&hash) {
            return
        }
        self.journal.append(Change::AddPreimage { hash: hash.clone() });
        self.preimages.insert(hash, preimage.into());
    }

    pub fn preimages(&self) -> &HashMap<Hash, Bytes> {
        &self.preimages
    }

    pub fn add_refund(&mut self, gas: u64) {
        self.journal.append(Change::Refund { prev: self.refund });
        self.refund += gas;
    }

    pub fn get_refund(&self) -> u64 {
        self.refund
    }

    /// Whether the address exists in the state. Suicided accounts still
    /// exist until finalised.
    pub fn exist(&mut self, addr: &Addr) -> bool {
        self.ensure_state_object(addr)
    }

    /// Whether the account is non-existent or EIP-161 empty.
    pub fn empty(&mut self, addr: &Addr) -> bool {
        if !self.ensure_state_object(addr) {
            return true
        }
        match self.state_objects.get(addr) {
            Some(obj) => obj.is_empty(),
            None => true,
        }
    }

    pub fn get_balance(&mut self, addr: &Addr) -> Wei {
        if self.ensure_state_object(addr) {
            if let Some(obj) = self.state_objects.get(addr) {
                return obj.account.balance.clone()
            }
        }
        Wei::zero().clone()
    }

    pub fn get_nonce(&mut self, addr: &Addr) -> u64 {
        if self.ensure_state_object(addr) {
            if let Some(obj) = self.state_objects.get(addr) {
                return obj.account.nonce
            }
        }
        0
    }

    pub fn get_code(&mut self, addr: &Addr) -> Bytes {
        if !self.ensure_state_object(addr) {
            return Bytes::empty()
        }
        let db = self.db.clone();
        let res = match self.state_objects.get_mut(addr) {
            Some(obj) => obj.code(db.as_ref()),
            None => return Bytes::empty(),
        };
        match res {
            Ok(code) => code,
            Err(err) => {
                self.set_error(err);
                Bytes::empty()
            }
        }
    }

    pub fn get_code_size(&mut self, addr: &Addr) -> usize {
        if !self.ensure_state_object(addr) {
            return 0
        }
        let db = self.db.clone();
        let res = match self.state_objects.get(addr) {
            Some(obj) => obj.code_size(db.as_ref()),
            None => return 0,
        };
        match res {
            Ok(size) => size,
            Err(err) => {
                self.set_error(err);
                0
            }
        }
    }

    pub fn get_code_hash(&mut self, addr: &Addr) -> Hash {
        if self.ensure_state_object(addr) {
            if let Some(obj) = self.state_objects.get(addr) {
                return obj.account.code_hash.clone()
            }
        }
        Hash::zero().clone()
    }

    /// Read one storage slot. Slots absent everywhere read as zero.
    pub fn get_state(&mut self, addr: &Addr, key: &Hash) -> Hash {
        if !self.ensure_state_object(addr) {
            return Hash::zero().clone()
        }
        let db = self.db.clone();
        let res = match self.state_objects.get_mut(addr) {
            Some(obj) => obj.get_state(db.as_ref(), key),
            None => return Hash::zero().clone(),
        };
        match res {
            Ok(value) => value,
            Err(err) => {
                self.set_error(err);
                Hash::zero().clone()
            }
        }
    }

    /// The low-level store backing this state.
    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// An independent copy of the account's storage trie with all pending
    /// slot writes applied. `None` for non-existent accounts.
    pub fn storage_trie(&mut self, addr: &Addr) -> Option<Box<dyn Trie>> {
        if !self.ensure_state_object(addr) {
            return None
        }
        let db = self.db.clone();
        let obj = self.state_objects.get(addr)?;
        let mut cpy = obj.deep_copy(db.as_ref());
        if let Err(err) = cpy.update_trie(db.as_ref()) {
            self.set_error(err);
            return None
        }
        match cpy.take_trie(db.as_ref()) {
            Ok(trie) => Some(trie),
            Err(err) => {
                self.set_error(err);
                None
            }
        }
    }

    pub fn has_suicided(&mut self, addr: &Addr) -> bool {
        if self.ensure_state_object(addr) {
            if let Some(obj) = self.state_objects.get(addr) {
                return obj.suicided
            }
        }
        false
    }

    /*
     * SETTERS
     */

    pub fn add_balance(&mut self, addr: &Addr, amount: &Wei) {
        self.ensure_live_object(addr);
        if let Some(obj) = self.state_objects.get_mut(addr) {
            obj.add_balance(&mut self.journal, amount);
        }
    }

    pub fn sub_balance(&mut self, addr: &Addr, amount: &Wei) {
        self.ensure_live_object(addr);
        if let Some(obj) = self.state_objects.get_mut(addr) {
            obj.sub_balance(&mut self.journal, amount);
        }
    }

    pub fn set_balance(&mut self, addr: &Addr, balance: Wei) {
        self.ensure_live_object(addr);
        if let Some(obj) = self.state_objects.get_mut(addr) {
            obj.set_balance(&mut self.journal, balance);
        }
    }

    pub fn set_nonce(&mut self, addr: &Addr, nonce: u64) {
        self.ensure_live_object(addr);
        if let Some(obj) = self.state_objects.get_mut(addr) {
            obj.set_nonce(&mut self.journal, nonce);
        }
    }

    pub fn set_code(&mut self, addr: &Addr, code: &[u8]) {
        self.ensure_live_object(addr);
        let db = self.db.clone();
        let code_hash = Hash::hash(code);
        let res = match self.state_objects.get_mut(addr) {
            Some(obj) => obj.set_code(
                db.as_ref(),
                &mut self.journal,
                code_hash,
                code.into(),
            ),
            None => Ok(()),
        };
        if let Err(err) = res {
            self.set_error(err);
        }
    }

    pub fn set_state(&mut self, addr: &Addr, key: Hash, value: Hash) {
        self.ensure_live_object(addr);
        let db = self.db.clone();
        let res = match self.state_objects.get_mut(addr) {
            Some(obj) => {
                obj.set_state(db.as_ref(), &mut self.journal, key, value)
            }
            None => Ok(()),
        };
        if let Err(err) = res {
            self.set_error(err);
        }
    }

    /// Mark the account as suicided and zero its balance. The object stays
    /// readable until the state is finalised.
    pub fn suicide(&mut self, addr: &Addr) -> bool {
        if !self.ensure_state_object(addr) {
            return false
        }
        if let Some(obj) = self.state_objects.get_mut(addr) {
            self.journal.append(Change::Suicide {
                address: addr.clone(),
                prev: obj.suicided,
                prev_balance: obj.account.balance.clone(),
            });
            obj.mark_suicided();
            obj.set_balance_raw(Wei::zero().clone());
            return true
        }
        false
    }

    //
    // Setting, updating & deleting state object methods.
    //

    /// Write the object's account record into the account trie.
    fn update_state_object(&mut self, addr: &Addr) {
        let data = match self.state_objects.get(addr) {
            Some(obj) => rlp::encode(&obj.account).to_vec(),
            None => return,
        };
        if let Err(err) = self.trie.try_update(addr.as_bytes(), &data) {
            self.set_error(err);
        }
    }

    /// Flag the object deleted and drop it from the account trie.
    fn delete_state_object(&mut self, addr: &Addr) {
        if let Some(obj) = self.state_objects.get_mut(addr) {
            obj.deleted = true;
        }
        if let Err(err) = self.trie.try_delete(addr.as_bytes()) {
            self.set_error(err);
        }
    }

    /// Bring the object for `addr` into the working set, fetching and
    /// decoding it from the account trie on a miss. Returns false when the
    /// account does not exist or is flagged deleted.
    fn ensure_state_object(&mut self, addr: &Addr) -> bool {
        // Prefer live objects.
        if let Some(obj) = self.state_objects.get(addr) {
            return !obj.deleted
        }
        let enc = match self.trie.try_get(addr.as_bytes()) {
            Ok(Some(enc)) => enc,
            Ok(None) => return false,
            Err(err) => {
                self.set_error(err);
                return false
            }
        };
        let account = match rlp::decode::<Account>(&enc) {
            Ok(account) => account,
            Err(err) => {
                error!("failed to decode state object {}: {}", addr, err);
                return false
            }
        };
        self.set_state_object(StateObject::new(addr.clone(), account));
        true
    }

    fn set_state_object(&mut self, object: StateObject) {
        self.state_objects.insert(object.address.clone(), object);
    }

    /// Make sure a mutable object exists at `addr`, creating one if the
    /// account is unknown or was deleted.
    fn ensure_live_object(&mut self, addr: &Addr) {
        if !self.ensure_state_object(addr) {
            self.create_object(addr);
        }
    }

    /// Materialize a fresh object at `addr`, displacing any existing one
    /// into the journal. Returns the displaced object's balance.
    fn create_object(&mut self, addr: &Addr) -> Option<Wei> {
        let prev = if self.ensure_state_object(addr) {
            self.state_objects.remove(addr)
        } else {
            None
        };
        let prev_balance = prev.as_ref().map(|p| p.account.balance.clone());
        let mut account = Account::empty();
        if prev.is_none() {
            if let Some(loader) = &self.account_loader {
                if let Some(loaded) = loader.load_account(addr) {
                    account = loaded;
                }
            }
        }
        match prev {
            Some(prev) => self.journal.append(Change::ResetObject {
                prev: Box::new(prev),
            }),
            None => self.journal.append(Change::CreateObject {
                address: addr.clone(),
            }),
        }
        self.set_state_object(StateObject::new(addr.clone(), account));
        prev_balance
    }

    /// Explicitly create an account, as the CREATE operation does. If an
    /// object already lives at the address its balance carries over, so
    /// funds sent to a not-yet-deployed contract address survive the
    /// deployment.
    pub fn create_account(&mut self, addr: &Addr) {
        if let Some(balance) = self.create_object(addr) {
            if let Some(obj) = self.state_objects.get_mut(addr) {
                obj.set_balance_raw(balance);
            }
        }
    }

    /// Visit every storage slot of the account: pending/observed entries
    /// first, then committed entries they do not shadow. The callback
    /// returns false to stop the walk.
    pub fn for_each_storage(
        &mut self, addr: &Addr, f: &mut dyn FnMut(&Hash, &Hash) -> bool,
    ) {
        if !self.ensure_state_object(addr) {
            return
        }
        let db = self.db.clone();
        let (cached, committed) = match self.state_objects.get_mut(addr) {
            Some(obj) => {
                let cached: Vec<(Hash, Hash)> = obj
                    .cached_storage
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                (cached, obj.committed_storage(db.as_ref()))
            }
            None => return,
        };
        for (key, value) in &cached {
            if !f(key, value) {
                return
            }
        }
        let committed = match committed {
            Ok(entries) => entries,
            Err(err) => {
                self.set_error(err);
                return
            }
        };
        let shadowed: HashSet<&Hash> = cached.iter().map(|(k, _)| k).collect();
        for (key, value) in &committed {
            if shadowed.contains(key) {
                continue
            }
            if !f(key, value) {
                return
            }
        }
    }

    /// A deep, independent copy: same store, copied trie handle, deep
    /// copies of every object with a live delta or a pending flush.
    /// Snapshots never migrate across copies; the copy starts with an
    /// empty journal.
    pub fn copy(&self) -> StateDB {
        let mut state = StateDB {
            db: self.db.clone(),
            trie: self.db.copy_trie(self.trie.as_ref()),
            state_objects: HashMap::with_capacity(self.journal.dirties_len()),
            state_objects_dirty: HashSet::with_capacity(
                self.journal.dirties_len(),
            ),
            db_err: None,
            refund: self.refund,
            thash: Hash::zero().clone(),
            bhash: Hash::zero().clone(),
            tx_index: 0,
            logs: HashMap::with_capacity(self.logs.len()),
            log_size: self.log_size,
            preimages: HashMap::new(),
            journal: Journal::default(),
            valid_revisions: Vec::new(),
            next_revision_id: 0,
            account_loader: self.account_loader.clone(),
        };
        for addr in self.journal.dirties() {
            if let Some(obj) = self.state_objects.get(addr) {
                state
                    .state_objects
                    .insert(addr.clone(), obj.deep_copy(self.db.as_ref()));
                state.state_objects_dirty.insert(addr.clone());
            }
        }
        // The journal itself is not copied, so a copy of this copy would
        // see an empty dirty set above. Walking the flushed-dirty set as
        // well keeps copies of copies populated.
        for addr in &self.state_objects_dirty {
            if state.state_objects.contains_key(addr) {
                continue
            }
            if let Some(obj) = self.state_objects.get(addr) {
                state
                    .state_objects
                    .insert(addr.clone(), obj.deep_copy(self.db.as_ref()));
                state.state_objects_dirty.insert(addr.clone());
            }
        }
        for (hash, logs) in &self.logs {
            state.logs.insert(hash.clone(), logs.clone());
        }
        for (hash, preimage) in &self.preimages {
            state.preimages.insert(hash.clone(), preimage.clone());
        }
        state
    }

    /// An identifier for the current revision of the state.
    pub fn snapshot(&mut self) -> u32 {
        let id = self.next_revision_id;
        self.next_revision_id += 1;
        self.valid_revisions.push(Revision {
            id,
            journal_len: self.journal.len(),
        });
        id
    }

    /// Undo all state changes made since the given revision was taken.
    ///
    /// # Panics
    /// Reverting to an unknown or already-invalidated revision is a
    /// programming error in the executor and panics.
    pub fn revert_to_snapshot(&mut self, id: u32) {
        let idx = self.valid_revisions.partition_point(|r| r.id < id);
        if idx == self.valid_revisions.len()
            || self.valid_revisions[idx].id != id
        {
            panic!("revision id {} cannot be reverted", id);
        }
        let to_len = self.valid_revisions[idx].journal_len;
        debug!("reverting to snapshot {} (journal length {})", id, to_len);

        // Replay the journal backwards and drop the invalidated revisions.
        let mut journal = std::mem::take(&mut self.journal);
        journal.revert(self, to_len);
        self.journal = journal;
        self.valid_revisions.truncate(idx);
    }

    /// Flush every journalled account: drop the suicided (and, when asked,
    /// the EIP-161 empty) ones from the trie, write the rest back, and
    /// invalidate the journal. Reverting across a transaction boundary is
    /// not allowed.
    pub fn finalise(&mut self, delete_empty_objects: bool) {
        let dirties: Vec<Addr> = self.journal.dirties().cloned().collect();
        for addr in dirties {
            let (suicided, is_empty) = match self.state_objects.get(&addr) {
                // A touch can leave an address in the dirty set with no
                // surviving object after a revert; skipping it is the only
                // safe action.
                None => continue,
                Some(obj) => (obj.suicided, obj.is_empty()),
            };
            if suicided || (delete_empty_objects && is_empty) {
                self.delete_state_object(&addr);
            } else {
                let db = self.db.clone();
                let res = match self.state_objects.get_mut(&addr) {
                    Some(obj) => obj.update_root(db.as_ref()),
                    None => Ok(()),
                };
                if let Err(err) = res {
                    self.set_error(err);
                }
                self.update_state_object(&addr);
            }
            self.state_objects_dirty.insert(addr);
        }
        self.clear_journal_and_refund();
    }

    /// Current root hash over the finalised state; the value that goes
    /// into transaction receipts.
    pub fn intermediate_root(&mut self, delete_empty_objects: bool) -> Hash {
        self.finalise(delete_empty_objects);
        self.trie.hash()
    }

    /// Set the transaction/block context stamped onto logs emitted by the
    /// next execution.
    pub fn prepare(&mut self, thash: Hash, bhash: Hash, tx_index: u32) {
        self.thash = thash;
        self.bhash = bhash;
        self.tx_index = tx_index;
    }

    /// Flag flushed suicided objects as deleted so they cannot be queried
    /// again, without touching the trie. Not for consensus-related
    /// updates.
    pub fn delete_suicides(&mut self) {
        self.clear_journal_and_refund();
        let dirty: Vec<Addr> = self.state_objects_dirty.drain().collect();
        for addr in dirty {
            if let Some(obj) = self.state_objects.get_mut(&addr) {
                if obj.suicided {
                    obj.deleted = true;
                }
            }
        }
    }

    fn clear_journal_and_refund(&mut self) {
        self.journal = Journal::default();
        self.valid_revisions.clear();
        self.refund = 0;
    }

    /// Write everything dirty through to the store: code blobs, storage
    /// tries, then the account trie itself. Returns the new root, or the
    /// first error memoized along the way. The journal and refund counter
    /// are cleared either way.
    pub fn commit(
        &mut self, delete_empty_objects: bool,
    ) -> Result<Hash, StateError> {
        let res = self.commit_inner(delete_empty_objects);
        self.clear_journal_and_refund();
        res
    }

    fn commit_inner(
        &mut self, delete_empty_objects: bool,
    ) -> Result<Hash, StateError> {
        let dirties: Vec<Addr> = self.journal.dirties().cloned().collect();
        for addr in dirties {
            self.state_objects_dirty.insert(addr);
        }
        // Commit objects to the trie.
        let addrs: Vec<Addr> = self.state_objects.keys().cloned().collect();
        for addr in addrs {
            let is_dirty = self.state_objects_dirty.contains(&addr);
            let (suicided, is_empty) = match self.state_objects.get(&addr) {
                Some(obj) => (obj.suicided, obj.is_empty()),
                None => continue,
            };
            if suicided || (is_dirty && delete_empty_objects && is_empty) {
                // The object is going away; just mark the deletion in the
                // trie.
                self.delete_state_object(&addr);
            } else if is_dirty {
                let db = self.db.clone();
                let res = match self.state_objects.get_mut(&addr) {
                    Some(obj) => {
                        // Write any contract code attached to the object.
                        if obj.code.is_some() && obj.dirty_code {
                            if let Some(code) = &obj.code {
                                db.trie_db().insert_blob(
                                    obj.account.code_hash.clone(),
                                    code,
                                );
                            }
                            obj.dirty_code = false;
                        }
                        // Storage trie errors abort the commit outright.
                        obj.commit_trie(db.as_ref())
                    }
                    None => Ok(()),
                };
                res?;
                self.update_state_object(&addr);
            }
            self.state_objects_dirty.remove(&addr);
        }
        // Write trie changes, wiring each committed account's storage root
        // and code blob to its parent node.
        let db = self.db.clone();
        let root = self.trie.commit(&mut |leaf, parent| {
            let account: Account = match rlp::decode(leaf) {
                Ok(account) => account,
                Err(_) => return Ok(()),
            };
            if &account.storage_root != Hash::empty_bytes_hash() {
                db.trie_db().reference(&account.storage_root, parent);
            }
            if &account.code_hash != Hash::empty_bytes_hash() {
                db.trie_db().reference(&account.code_hash, parent);
            }
            Ok(())
        })?;
        if let Some(err) = self.db_err.clone() {
            return Err(err)
        }
        debug!("state committed, root {}", root);
        Ok(root)
    }
}
