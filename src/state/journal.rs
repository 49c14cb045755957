use std::collections::hash_map::HashMap;

use crate::common::{Addr, Bytes, Hash, Wei};
use crate::state::object::StateObject;
use crate::state::StateDB;

/// One reversible mutation. Every write path through the state records
/// exactly one of these before touching the working set; `undo` is the
/// inverse applied during snapshot rollback.
pub(crate) enum Change {
    /// A fresh object was materialized at an address with no prior object.
    CreateObject { address: Addr },
    /// An existing object was displaced by a fresh one; `prev` is the
    /// displaced object, reinstated wholesale on undo.
    ResetObject { prev: Box<StateObject> },
    Suicide { address: Addr, prev: bool, prev_balance: Wei },
    Balance { address: Addr, prev: Wei },
    Nonce { address: Addr, prev: u64 },
    Storage { address: Addr, key: Hash, prev: Hash },
    Code { address: Addr, prev_hash: Hash, prev_code: Bytes },
    Refund { prev: u64 },
    AddLog { tx_hash: Hash },
    AddPreimage { hash: Hash },
    Touch { address: Addr, prev: bool },
}

impl Change {
    /// The account whose dirty bit this change implies. Refund, log and
    /// preimage changes touch no account.
    pub(crate) fn dirtied_address(&self) -> Option<&Addr> {
        match self {
            Change::CreateObject { address } => Some(address),
            Change::ResetObject { prev } => Some(&prev.address),
            Change::Suicide { address, .. } => Some(address),
            Change::Balance { address, .. } => Some(address),
            Change::Nonce { address, .. } => Some(address),
            Change::Storage { address, .. } => Some(address),
            Change::Code { address, .. } => Some(address),
            Change::Refund { .. } => None,
            Change::AddLog { .. } => None,
            Change::AddPreimage { .. } => None,
            Change::Touch { address, .. } => Some(address),
        }
    }

    /// Restore the prior value in the working set. Undo never touches the
    /// backing trie, so it must stay infallible.
    pub(crate) fn undo(self, state: &mut StateDB) {
        match self {
            Change::CreateObject { address } => {
                state.state_objects.remove(&address);
            }
            Change::ResetObject { prev } => {
                state.state_objects.insert(prev.address.clone(), *prev);
            }
            Change::Suicide {
                address,
                prev,
                prev_balance,
            } => {
                if let Some(obj) = state.state_objects.get_mut(&address) {
                    obj.suicided = prev;
                    obj.account.balance = prev_balance;
                }
            }
            Change::Balance { address, prev } => {
                if let Some(obj) = state.state_objects.get_mut(&address) {
                    obj.account.balance = prev;
                }
            }
            Change::Nonce { address, prev } => {
                if let Some(obj) = state.state_objects.get_mut(&address) {
                    obj.account.nonce = prev;
                }
            }
            Change::Storage { address, key, prev } => {
                // The prior value goes back into both maps: a value left in
                // the dirty set would otherwise survive the rollback and
                // reach the trie on the next flush.
                if let Some(obj) = state.state_objects.get_mut(&address) {
                    obj.set_storage_raw(key, prev);
                }
            }
            Change::Code {
                address,
                prev_hash,
                prev_code,
            } => {
                if let Some(obj) = state.state_objects.get_mut(&address) {
                    obj.code = Some(prev_code);
                    obj.account.code_hash = prev_hash;
                }
            }
            Change::Refund { prev } => {
                state.refund = prev;
            }
            Change::AddLog { tx_hash } => {
                let drained = match state.logs.get_mut(&tx_hash) {
                    Some(logs) => {
                        logs.pop();
                        logs.is_empty()
                    }
                    None => false,
                };
                if drained {
                    state.logs.remove(&tx_hash);
                }
                state.log_size -= 1;
            }
            Change::AddPreimage { hash } => {
                state.preimages.remove(&hash);
            }
            Change::Touch { address, prev } => {
                if let Some(obj) = state.state_objects.get_mut(&address) {
                    obj.touched = prev;
                }
            }
        }
    }
}

/// Append-only log of [`Change`]s plus a refcount per account with at least
/// one live change. The refcounts are what `finalise` and `copy` walk to
/// find the accounts worth flushing.
#[derive(Default)]
pub(crate) struct Journal {
    entries: Vec<Change>,
    dirties: HashMap<Addr, usize>,
}

impl Journal {
    pub(crate) fn append(&mut self, change: Change) {
        if let Some(addr) = change.dirtied_address() {
            *self.dirties.entry(addr.clone()).or_insert(0) += 1;
        }
        self.entries.push(change);
    }

    /// Undo every change past `to_len`, newest first, releasing the dirty
    /// refcounts as it goes.
    pub(crate) fn revert(&mut self, state: &mut StateDB, to_len: usize) {
        while self.entries.len() > to_len {
            if let Some(change) = self.entries.pop() {
                let dirtied = change.dirtied_address().cloned();
                change.undo(state);
                if let Some(addr) = dirtied {
                    if let Some(cnt) = self.dirties.get_mut(&addr) {
                        *cnt -= 1;
                        if *cnt == 0 {
                            self.dirties.remove(&addr);
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn dirties(&self) -> impl Iterator<Item = &Addr> {
        self.dirties.keys()
    }

    pub(crate) fn dirties_len(&self) -> usize {
        self.dirties.len()
    }
}

#[test]
fn test_dirties_refcount() {
    let addr = Addr::zero().clone();
    let mut j = Journal::default();
    j.append(Change::Balance {
        address: addr.clone(),
        prev: Wei::zero().clone(),
    });
    j.append(Change::Nonce {
        address: addr.clone(),
        prev: 0,
    });
    j.append(Change::Refund { prev: 0 });
    assert_eq!(j.len(), 3);
    assert_eq!(j.dirties_len(), 1);
    assert_eq!(j.dirties().next(), Some(&addr));
}
