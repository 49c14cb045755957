use std::collections::hash_map::HashMap;

use log::info;

use qstate::common::{Addr, Bytes, Hash, Wei};

#[derive(Clone)]
pub struct ModelAccount {
    pub balance: Wei,
    pub nonce: u64,
    pub code: Bytes,
    pub storage: HashMap<Hash, Hash>,
}

impl Default for ModelAccount {
    fn default() -> Self {
        Self {
            balance: Wei::zero().clone(),
            nonce: 0,
            code: Bytes::empty(),
            storage: HashMap::new(),
        }
    }
}

/// A flat, obviously-correct model of the world state, used as the oracle
/// in cross-validation tests. Zero-valued slots are absent, matching the
/// committed form of the real state.
#[derive(Clone, Default)]
pub struct ModelState {
    accounts: HashMap<Addr, ModelAccount>,
}

impl ModelState {
    pub fn new() -> Self {
        Self {
            accounts: HashMap::new(),
        }
    }

    fn get_account(&mut self, addr: &Addr) -> &mut ModelAccount {
        self.accounts
            .entry(addr.clone())
            .or_insert_with(ModelAccount::default)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Addr> {
        self.accounts.keys()
    }

    pub fn account(&self, addr: &Addr) -> Option<&ModelAccount> {
        self.accounts.get(addr)
    }

    pub fn storage_keys(
        &self, addr: &Addr,
    ) -> Option<impl Iterator<Item = &Hash>> {
        self.accounts.get(addr).map(|acc| acc.storage.keys())
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn get_state(&self, addr: &Addr, key: &Hash) -> Hash {
        self.accounts
            .get(addr)
            .and_then(|acc| acc.storage.get(key))
            .cloned()
            .unwrap_or_else(|| Hash::zero().clone())
    }

    pub fn get_balance(&self, addr: &Addr) -> Wei {
        self.accounts
            .get(addr)
            .map(|acc| acc.balance.clone())
            .unwrap_or_else(|| Wei::zero().clone())
    }

    pub fn get_nonce(&self, addr: &Addr) -> u64 {
        self.accounts.get(addr).map(|acc| acc.nonce).unwrap_or(0)
    }

    pub fn get_code(&self, addr: &Addr) -> Bytes {
        self.accounts
            .get(addr)
            .map(|acc| acc.code.clone())
            .unwrap_or_else(Bytes::empty)
    }

    pub fn set_state(&mut self, addr: &Addr, key: &Hash, value: &Hash) {
        info!("set_state({}, {}, {})", addr, key, value);
        let acc = self.get_account(addr);
        if value.is_zero() {
            acc.storage.remove(key);
        } else {
            acc.storage.insert(key.clone(), value.clone());
        }
    }

    pub fn set_balance(&mut self, addr: &Addr, balance: &Wei) {
        info!("set_balance({}, {})", addr, balance);
        self.get_account(addr).balance = balance.clone();
    }

    pub fn add_balance(&mut self, addr: &Addr, amount: &Wei) {
        info!("add_balance({}, {})", addr, amount);
        let acc = self.get_account(addr);
        acc.balance = acc.balance.saturating_add(amount);
    }

    pub fn sub_balance(&mut self, addr: &Addr, amount: &Wei) {
        info!("sub_balance({}, {})", addr, amount);
        let acc = self.get_account(addr);
        acc.balance = acc.balance.saturating_sub(amount);
    }

    pub fn set_nonce(&mut self, addr: &Addr, nonce: u64) {
        info!("set_nonce({}, {})", addr, nonce);
        self.get_account(addr).nonce = nonce;
    }

    pub fn set_code(&mut self, addr: &Addr, code: &[u8]) {
        info!("set_code({}, {})", addr, hex::encode(code));
        self.get_account(addr).code = code.into();
    }

    pub fn delete_account(&mut self, addr: &Addr) {
        info!("delete_account({})", addr);
        self.accounts.remove(addr);
    }

    pub fn snapshot(&self) -> Self {
        info!("snapshot()");
        self.clone()
    }

    pub fn rollback(&mut self, mut state: Self) {
        info!("rollback()");
        std::mem::swap(self, &mut state);
    }
}
