use std::collections::hash_map::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use sync_unsafe_cell::SyncUnsafeCell;

use memory_db::{KeyFunction, PrefixedKey};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use reference_trie::{ExtensionLayout, RefHasher};
use rocksdb::{WriteBatch, DB};
use trie_db::{
    DBValue, HashDB, HashDBRef, Hasher, Trie as _, TrieDB, TrieDBMut, TrieMut,
};

use qstate::common::{Bytes, Hash};
use qstate::db::{Database, StateError, Trie, TrieBackend};

/// A [Database] implementation keeping a merkle trie forest (the account
/// trie plus every per-account storage trie) in a single copy-on-write
/// node store, so every root ever committed stays readable. Backed by
/// RocksDB or, for tests, an in-process map.
#[derive(Clone)]
pub struct MerkleStore(Arc<MerkleStoreInner>);

struct MerkleStoreInner {
    nodes: SyncUnsafeCell<NodeStore<RefHasher, PrefixedKey<RefHasher>>>,
    codes: Mutex<HashMap<Hash, Bytes>>,
    refs: Mutex<HashMap<Hash, i64>>,
}

impl MerkleStoreInner {
    fn nodes(&self) -> &NodeStore<RefHasher, PrefixedKey<RefHasher>> {
        unsafe { &*self.nodes.get() }
    }
    // The cell only bridges `TrieDBMut`'s `&mut dyn HashDB` requirement;
    // all actual mutation goes through the store's inner lock.
    fn nodes_mut(&self) -> &mut NodeStore<RefHasher, PrefixedKey<RefHasher>> {
        unsafe { &mut *self.nodes.get() }
    }
}

/// Root of the empty trie under [ExtensionLayout].
fn empty_trie_root() -> &'static [u8; 32] {
    static V: OnceCell<[u8; 32]> = OnceCell::new();
    V.get_or_init(|| {
        let mut db = memory_db::MemoryDB::<
            RefHasher,
            PrefixedKey<RefHasher>,
            DBValue,
        >::default();
        let mut root = <RefHasher as Hasher>::Out::default();
        let mut trie = TrieDBMut::<ExtensionLayout>::new(&mut db, &mut root);
        *trie.root()
    })
}

/// Flat key/value backend under the node store. Writes are staged and hit
/// the backend on `flush`; the trie layer flushes after every mutation
/// session.
trait KeyValueStore: Send {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn stage(&mut self, key: Vec<u8>, value: Vec<u8>);
    fn flush(&mut self);
}

#[derive(Default)]
struct MemKV {
    committed: HashMap<Vec<u8>, Vec<u8>>,
    staged: Vec<(Vec<u8>, Vec<u8>)>,
}

impl KeyValueStore for MemKV {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.committed.get(key).cloned()
    }
    fn stage(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.staged.push((key, value));
    }
    fn flush(&mut self) {
        for (key, value) in self.staged.drain(..) {
            self.committed.insert(key, value);
        }
    }
}

struct RocksKV {
    db: DB,
    wb: Option<WriteBatch>,
}

impl KeyValueStore for RocksKV {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.db.get(key).ok().flatten()
    }
    fn stage(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.wb
            .get_or_insert_with(WriteBatch::default)
            .put(key, value);
    }
    fn flush(&mut self) {
        if let Some(wb) = self.wb.take() {
            self.db.write(wb).unwrap();
        }
    }
}

struct Counter(i64);

impl Counter {
    fn encode(&self) -> DBValue {
        self.0.to_le_bytes().into()
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        Some(Self(i64::from_le_bytes(raw[..8].try_into().ok()?)))
    }
}

impl std::ops::Deref for Counter {
    type Target = i64;
    fn deref(&self) -> &i64 {
        &self.0
    }
}

/// Refcounted, copy-on-write trie node store: inserts bump a per-node
/// counter, removes are ignored, so old roots never lose their nodes and
/// the store only grows.
struct NodeStore<H: Hasher, KF: KeyFunction<H>> {
    kv: Mutex<Box<dyn KeyValueStore>>,
    prefix: Vec<u8>,
    null_node_hash: H::Out,
    null_node_data: Vec<u8>,
    _kf: PhantomData<KF>,
}

impl<H: Hasher, KF: KeyFunction<H, Key = Vec<u8>>> NodeStore<H, KF> {
    const CNT_SUFFIX: [u8; 1] = [0x0; 1];
    const DATA_SUFFIX: [u8; 1] = [0x1; 1];

    fn new(prefix: Vec<u8>, kv: Box<dyn KeyValueStore>) -> Self {
        let null_node_data = vec![0u8];
        Self {
            kv: Mutex::new(kv),
            prefix,
            null_node_hash: H::hash(&null_node_data),
            null_node_data,
            _kf: PhantomData,
        }
    }

    fn finalize_key(
        &self, key: &H::Out, prefix: hash_db::Prefix, suffix: &[u8],
    ) -> Vec<u8> {
        let mut buff = self.prefix.clone();
        buff.extend_from_slice(&KF::key(key, prefix));
        buff.extend_from_slice(suffix);
        buff
    }

    fn flush(&self) {
        self.kv.lock().flush();
    }
}

impl<H: Hasher, KF: KeyFunction<H, Key = Vec<u8>> + Sync + Send>
    hash_db::AsHashDB<H, DBValue> for NodeStore<H, KF>
{
    fn as_hash_db(&self) -> &dyn HashDB<H, DBValue> {
        self
    }
    fn as_hash_db_mut<'a>(
        &'a mut self,
    ) -> &'a mut (dyn HashDB<H, DBValue> + 'a) {
        self
    }
}

impl<H: Hasher, KF: KeyFunction<H, Key = Vec<u8>> + Sync + Send>
    HashDB<H, DBValue> for NodeStore<H, KF>
{
    fn get(
        &self, key: &H::Out, prefix: (&[u8], Option<u8>),
    ) -> Option<DBValue> {
        if key == &self.null_node_hash {
            return Some(self.null_node_data.clone())
        }
        let cnt_key = self.finalize_key(key, prefix, &Self::CNT_SUFFIX);
        let kv = self.kv.lock();
        kv.get(&cnt_key).and_then(|r| {
            let cnt = Counter::decode(&r)?;
            if *cnt > 0 {
                let data_key =
                    self.finalize_key(key, prefix, &Self::DATA_SUFFIX);
                kv.get(&data_key)
            } else {
                None
            }
        })
    }
    fn contains(&self, key: &H::Out, prefix: (&[u8], Option<u8>)) -> bool {
        if key == &self.null_node_hash {
            return true
        }
        let cnt_key = self.finalize_key(key, prefix, &Self::CNT_SUFFIX);
        match self.kv.lock().get(&cnt_key) {
            Some(v) => match Counter::decode(&v) {
                Some(cnt) => *cnt > 0,
                None => false,
            },
            None => false,
        }
    }
    fn emplace(
        &mut self, key: H::Out, prefix: (&[u8], Option<u8>), value: DBValue,
    ) {
        if value == self.null_node_data {
            return
        }
        let cnt_key = self.finalize_key(&key, prefix, &Self::CNT_SUFFIX);
        let data_key = self.finalize_key(&key, prefix, &Self::DATA_SUFFIX);
        let mut kv = self.kv.lock();
        match kv.get(&cnt_key) {
            Some(v) => {
                let cnt = Counter::decode(&v).unwrap();
                if *cnt <= 0 {
                    kv.stage(data_key, value);
                }
                kv.stage(cnt_key, Counter(*cnt + 1).encode());
            }
            None => {
                kv.stage(cnt_key, Counter(1).encode());
                kv.stage(data_key, value);
            }
        }
    }
    fn insert(&mut self, prefix: (&[u8], Option<u8>), value: &[u8]) -> H::Out {
        if value == self.null_node_data {
            return self.null_node_hash
        }
        let key = H::hash(value);
        HashDB::emplace(self, key, prefix, value.into());
        key
    }
    fn remove(&mut self, _key: &H::Out, _prefix: (&[u8], Option<u8>)) {
        // ignore remove ops to achieve a copy-on-write store
    }
}

impl<H: Hasher, KF: KeyFunction<H, Key = Vec<u8>> + Sync + Send>
    HashDBRef<H, DBValue> for NodeStore<H, KF>
{
    fn get(
        &self, key: &H::Out, prefix: (&[u8], Option<u8>),
    ) -> Option<DBValue> {
        HashDB::get(self, key, prefix)
    }
    fn contains(&self, key: &H::Out, prefix: (&[u8], Option<u8>)) -> bool {
        HashDB::contains(self, key, prefix)
    }
}

impl MerkleStore {
    /// A store over an in-process map. State is lost on drop; meant for
    /// tests and tooling.
    pub fn in_memory() -> Self {
        Self::with_backend(Box::new(MemKV::default()), b"merkle")
    }

    /// A store over RocksDB; `prefix` namespaces the trie nodes within the
    /// column family.
    pub fn rocks(db: DB, prefix: &[u8]) -> Self {
        Self::with_backend(Box::new(RocksKV { db, wb: None }), prefix)
    }

    fn with_backend(kv: Box<dyn KeyValueStore>, prefix: &[u8]) -> Self {
        Self(Arc::new(MerkleStoreInner {
            nodes: SyncUnsafeCell::new(NodeStore::new(prefix.to_vec(), kv)),
            codes: Mutex::new(HashMap::new()),
            refs: Mutex::new(HashMap::new()),
        }))
    }

    /// How many times `hash` has been referenced by committed parents.
    pub fn reference_count(&self, hash: &Hash) -> i64 {
        self.0.refs.lock().get(hash).copied().unwrap_or(0)
    }
}

impl TrieBackend for MerkleStore {
    fn insert_blob(&self, hash: Hash, blob: &[u8]) {
        self.0.codes.lock().insert(hash, blob.into());
    }
    fn reference(&self, child: &Hash, _parent: &Hash) {
        *self.0.refs.lock().entry(child.clone()).or_insert(0) += 1;
    }
}

impl Database for MerkleStore {
    fn open_trie(&self, root: &Hash) -> Result<Box<dyn Trie>, StateError> {
        let root = if root.is_zero() || root == Hash::empty_bytes_hash() {
            *empty_trie_root()
        } else {
            let mut r = <RefHasher as Hasher>::Out::default();
            r.copy_from_slice(root.as_bytes());
            if !HashDB::contains(self.0.nodes(), &r, hash_db::EMPTY_PREFIX) {
                return Err(StateError::UnknownRoot(root.clone()))
            }
            r
        };
        Ok(Box::new(MerkleTrie {
            store: self.0.clone(),
            root,
        }))
    }

    fn contract_code(
        &self, _addr_hash: &Hash, code_hash: &Hash,
    ) -> Result<Bytes, StateError> {
        self.0
            .codes
            .lock()
            .get(code_hash)
            .cloned()
            .ok_or_else(|| StateError::CodeMissing(code_hash.clone()))
    }

    fn contract_code_size(
        &self, addr_hash: &Hash, code_hash: &Hash,
    ) -> Result<usize, StateError> {
        Ok(self.contract_code(addr_hash, code_hash)?.len())
    }

    fn trie_db(&self) -> &dyn TrieBackend {
        self
    }
}

/// One trie handle over the shared node forest. Mutations adopt the new
/// root locally; handles opened over older roots keep seeing the old
/// content.
#[derive(Clone)]
pub struct MerkleTrie {
    store: Arc<MerkleStoreInner>,
    root: [u8; 32],
}

impl MerkleTrie {
    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
        let trie =
            TrieDB::<ExtensionLayout>::new(self.store.nodes(), &self.root)
                .map_err(|e| StateError::TrieRead(format!("{:?}", e)))?;
        let mut out = Vec::new();
        let iter = trie
            .iter()
            .map_err(|e| StateError::TrieRead(format!("{:?}", e)))?;
        for item in iter {
            let (key, value) =
                item.map_err(|e| StateError::TrieRead(format!("{:?}", e)))?;
            out.push((key, value));
        }
        Ok(out)
    }
}

impl Trie for MerkleTrie {
    fn try_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        let trie =
            TrieDB::<ExtensionLayout>::new(self.store.nodes(), &self.root)
                .map_err(|e| StateError::TrieRead(format!("{:?}", e)))?;
        trie.get(key)
            .map_err(|e| StateError::TrieRead(format!("{:?}", e)))
    }

    fn try_update(
        &mut self, key: &[u8], value: &[u8],
    ) -> Result<(), StateError> {
        let mut root = self.root;
        {
            let nodes = self.store.nodes_mut();
            let mut trie = if root == *empty_trie_root() {
                root = <RefHasher as Hasher>::Out::default();
                TrieDBMut::<ExtensionLayout>::new(nodes, &mut root)
            } else {
                TrieDBMut::<ExtensionLayout>::from_existing(nodes, &mut root)
                    .map_err(|e| {
                        StateError::TrieWrite(format!("{:?}", e))
                    })?
            };
            trie.insert(key, value)
                .map_err(|e| StateError::TrieWrite(format!("{:?}", e)))?;
        }
        self.store.nodes().flush();
        self.root = root;
        Ok(())
    }

    fn try_delete(&mut self, key: &[u8]) -> Result<(), StateError> {
        if self.root == *empty_trie_root() {
            return Ok(())
        }
        let mut root = self.root;
        {
            let nodes = self.store.nodes_mut();
            let mut trie =
                TrieDBMut::<ExtensionLayout>::from_existing(nodes, &mut root)
                    .map_err(|e| {
                        StateError::TrieWrite(format!("{:?}", e))
                    })?;
            trie.remove(key)
                .map_err(|e| StateError::TrieWrite(format!("{:?}", e)))?;
        }
        self.store.nodes().flush();
        self.root = root;
        Ok(())
    }

    fn hash(&self) -> Hash {
        if self.root == *empty_trie_root() {
            Hash::empty_bytes_hash().clone()
        } else {
            self.root.into()
        }
    }

    fn commit(
        &mut self,
        on_leaf: &mut dyn FnMut(&[u8], &Hash) -> Result<(), StateError>,
    ) -> Result<Hash, StateError> {
        let root = self.hash();
        let entries = self
            .entries()
            .map_err(|e| StateError::Commit(e.to_string()))?;
        for (_, value) in entries {
            on_leaf(&value, &root)?;
        }
        self.store.nodes().flush();
        Ok(root)
    }

    fn node_iter(
        &self,
    ) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)>>, StateError>
    {
        Ok(Box::new(self.entries()?.into_iter()))
    }

    fn get_key(&self, encoded: &[u8]) -> Vec<u8> {
        // keys are stored unhashed, the iterator key is the preimage
        encoded.to_vec()
    }

    fn boxed_clone(&self) -> Box<dyn Trie> {
        Box::new(self.clone())
    }
}
