use thiserror::Error;

use crate::common::{Bytes, Hash};

/// Errors surfaced by the trie/store collaborators. Read failures and
/// ordinary write failures are memoized by the state layer and only come
/// back from `commit`; storage-trie commit failures return immediately.
#[derive(Error, Clone, PartialEq, Eq, Debug)]
pub enum StateError {
    #[error("trie read failed: {0}")]
    TrieRead(String),
    #[error("trie write failed: {0}")]
    TrieWrite(String),
    #[error("no state trie with root {0}")]
    UnknownRoot(Hash),
    #[error("contract code {0} not found")]
    CodeMissing(Hash),
    #[error("trie commit failed: {0}")]
    Commit(String),
}

/// One authenticated key/value trie, account or storage. A handle owns its
/// root: mutations move the handle to the new root, leaving other handles
/// opened over the same store untouched.
pub trait Trie: Send {
    /// Look a key up; absent keys are `None`, not an error.
    fn try_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError>;
    fn try_update(&mut self, key: &[u8], value: &[u8])
        -> Result<(), StateError>;
    /// Deleting an absent key is a no-op.
    fn try_delete(&mut self, key: &[u8]) -> Result<(), StateError>;
    /// Root hash over everything applied to this handle so far.
    fn hash(&self) -> Hash;
    /// Persist the trie, invoking `on_leaf` with every (encoded leaf,
    /// parent hash) pair so the caller can wire up cross-trie references.
    fn commit(
        &mut self,
        on_leaf: &mut dyn FnMut(&[u8], &Hash) -> Result<(), StateError>,
    ) -> Result<Hash, StateError>;
    /// Iterate the (key, value) leaf pairs currently in the trie.
    fn node_iter(
        &self,
    ) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)>>, StateError>;
    /// Recover the preimage of an iterator key.
    fn get_key(&self, encoded: &[u8]) -> Vec<u8>;
    fn boxed_clone(&self) -> Box<dyn Trie>;
}

/// Commit-time side channel of the backing store: raw code blobs and
/// parent/child references between committed roots.
pub trait TrieBackend {
    fn insert_blob(&self, hash: Hash, blob: &[u8]);
    fn reference(&self, child: &Hash, parent: &Hash);
}

/// The backing store handing out trie handles and code blobs. Shared by
/// reference among all state copies.
pub trait Database: Send + Sync {
    /// Open the trie rooted at `root`. The zero hash and the empty-bytes
    /// hash both open the empty trie; any other unknown root is an error.
    fn open_trie(&self, root: &Hash) -> Result<Box<dyn Trie>, StateError>;

    /// An independent handle over the same store at the same root.
    fn copy_trie(&self, trie: &dyn Trie) -> Box<dyn Trie> {
        trie.boxed_clone()
    }

    fn contract_code(
        &self, addr_hash: &Hash, code_hash: &Hash,
    ) -> Result<Bytes, StateError>;

    fn contract_code_size(
        &self, addr_hash: &Hash, code_hash: &Hash,
    ) -> Result<usize, StateError>;

    fn trie_db(&self) -> &dyn TrieBackend;
}
