//! # qState: a revertible, Merkle-committed account state layer
//!
//! - qState sits between an EVM-style executor and a persistent key/value
//!   store. It presents a mutable view of the entire world state (every
//!   account's balance, nonce, contract code and contract storage) while
//!   buffering all changes in memory and committing them atomically as a
//!   single Merkle-Patricia-trie root hash.
//!
//! - The same layer has to deliver four things that are easy alone and
//!   awkward together: a cryptographically committed root any node can
//!   recompute, arbitrarily nested snapshot/rollback for VM calls, lazy
//!   loading and caching of accounts/code/slots, and bit-for-bit
//!   deterministic re-commits.
//!
//! # Design Philosophy & Overview
//! The crate keeps each component small and single-purpose:
//! - [state::StateDB]: the executor-facing facade. Orchestrates the live
//!   object set, the journal, logs, preimages and the commit pipeline.
//! - `StateObject` (internal to [state]): one account's in-memory shadow,
//!   the persisted quadruple plus lazily loaded code, a lazily opened
//!   per-account storage trie and the slot caches shadowing it.
//! - The journal (internal to [state]): an append-only log of typed
//!   deltas, one per mutation kind, each knowing how to undo itself.
//!   Snapshots are nothing but journal lengths; rollback replays the tail
//!   in reverse.
//! - [db]: the collaborator seams. [db::Database] hands out [db::Trie]
//!   handles and code blobs; qState never talks to disk directly. A
//!   reference implementation over a real Merkle-Patricia forest lives in
//!   the companion `qstate-tools` crate.
//! - [common]: the fixed-width value types ([common::Addr],
//!   [common::Hash], [common::Wei]) and their RLP forms.
//!
//! # On the Data Flow
//! Every mutation follows the same three-step shape: materialize or load
//! the target object, append the inverse delta to the journal, apply the
//! change to the in-memory fields. Reads stop at the first cache layer
//! that knows the answer (dirty slots, observed slots, then the trie).
//!
//! At a transaction boundary the executor calls
//! [state::StateDB::finalise] (drop suicided and, optionally, empty
//! accounts, flush the rest back to the account trie) or
//! [state::StateDB::intermediate_root] (finalise plus the receipt root).
//! At a block boundary, [state::StateDB::commit] additionally persists
//! code blobs and storage subtries and returns the new root:
//!
//! ```notrust
//!    executor writes          finalise / commit
//!         |                          |
//!         v                          v
//!   [ StateDB ] --journal--> [ account trie ] --commit--> root hash
//!         |                          ^
//!         v                          |
//!   [ StateObject ] --updateTrie--> [ per-account storage tries ]
//! ```
//!
//! # Errors Are Deferred
//! The executor core cannot deal with database-level errors mid-run, so
//! read failures and ordinary write failures never propagate through the
//! getters and setters: the first one is memoized and eventually returned
//! by [state::StateDB::commit]. Only two things are loud: committing a
//! storage trie (errors return immediately) and reverting to a snapshot
//! that does not exist (a programming error, and a panic).

pub mod account;
pub mod common;
pub mod db;
pub mod state;
