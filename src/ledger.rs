//! Purchase ledger and engagement counter.
//!
//! The [`PurchaseLedger`] is the sole authority on whether a user may see
//! gated content: it records each grant exactly once per
//! `(user, resource, transaction)` triple and answers membership queries.
//! Records are append-only and never mutated or deleted, so the full
//! purchase history stays available for display.
//!
//! The [`ClapCounter`] tracks per-user engagement on a resource with a hard
//! per-user ceiling. Increments past the ceiling degrade silently: they
//! return the unchanged total instead of erroring.
//!
//! Addresses are compared case-insensitively throughout. Both structures
//! parse addresses into [`Address`] values, whose byte-wise equality makes
//! `0xABC...` and `0xabc...` the same key; persisted JSON uses the
//! lowercase hex rendering.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::proto::{Address, TxHash};
use crate::store::{CLAPS_COLLECTION, PURCHASES_COLLECTION, StateStore, StoreError};

/// Hard ceiling on claps per user per resource.
pub const MAX_USER_CLAPS: u32 = 50;

/// Lowercase hex rendering used for persisted address keys.
fn address_key(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

/// One recorded access grant. Created exactly once per successful payment
/// flow; never mutated, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    /// The purchased resource.
    pub article_id: String,
    /// The paying address.
    pub user_address: Address,
    /// The settling transaction.
    pub tx_hash: TxHash,
    /// When the grant was recorded.
    pub timestamp: DateTime<Utc>,
    /// Price paid, as the configured decimal string.
    pub amount: String,
}

/// Append-only, idempotent record of granted access.
pub struct PurchaseLedger {
    store: Arc<dyn StateStore>,
    /// Atomic test-and-set per (user, resource, transaction) triple. This
    /// is the single guard that makes duplicate confirmation signals
    /// record one purchase.
    recorded: DashSet<(Address, String, TxHash)>,
    /// Membership index per (user, resource) for access checks.
    owned: DashSet<(Address, String)>,
    history: Mutex<Vec<Purchase>>,
}

impl PurchaseLedger {
    /// Opens the ledger, replaying any persisted history from the store.
    pub fn open(store: Arc<dyn StateStore>) -> Result<Self, StoreError> {
        let history: Vec<Purchase> = match store.load(PURCHASES_COLLECTION)? {
            Some(value) => serde_json::from_value(value).unwrap_or_default(),
            None => Vec::new(),
        };
        let recorded = DashSet::new();
        let owned = DashSet::new();
        for purchase in &history {
            recorded.insert((
                purchase.user_address,
                purchase.article_id.clone(),
                purchase.tx_hash,
            ));
            owned.insert((purchase.user_address, purchase.article_id.clone()));
        }
        Ok(Self {
            store,
            recorded,
            owned,
            history: Mutex::new(history),
        })
    }

    /// Records a grant. Returns `true` when the purchase was newly
    /// recorded, `false` when the same `(user, resource, transaction)`
    /// triple was already present.
    ///
    /// The triple check is a single atomic insert, so two notification
    /// sources racing on the same transaction reference cannot both win.
    pub fn record(&self, purchase: Purchase) -> Result<bool, StoreError> {
        let key = (
            purchase.user_address,
            purchase.article_id.clone(),
            purchase.tx_hash,
        );
        if !self.recorded.insert(key) {
            return Ok(false);
        }
        self.owned
            .insert((purchase.user_address, purchase.article_id.clone()));

        let mut history = self.history.lock().expect("ledger lock poisoned");
        history.push(purchase);
        let snapshot = serde_json::to_value(&*history).expect("purchases always serialize");
        self.store.save(PURCHASES_COLLECTION, snapshot)?;
        Ok(true)
    }

    /// Whether `address` has purchased `article_id`. Must be consulted
    /// before serving gated content.
    pub fn has_purchased(&self, address: &Address, article_id: &str) -> bool {
        self.owned.contains(&(*address, article_id.to_string()))
    }

    /// All purchases by `address`, in insertion order.
    pub fn purchases_for(&self, address: &Address) -> Vec<Purchase> {
        self.history
            .lock()
            .expect("ledger lock poisoned")
            .iter()
            .filter(|p| p.user_address == *address)
            .cloned()
            .collect()
    }

    /// The full purchase history, in insertion order.
    pub fn all(&self) -> Vec<Purchase> {
        self.history.lock().expect("ledger lock poisoned").clone()
    }
}

/// Persisted clap data for one resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClapsEntry {
    /// Sum of user increments. Excludes the configured base count.
    total: u64,
    /// Per-user increment counts, keyed by lowercase address.
    user_claps: HashMap<String, u32>,
}

/// Bounded per-user engagement counter.
pub struct ClapCounter {
    store: Arc<dyn StateStore>,
    /// Seeded counts per resource; the aggregate adds live increments on top.
    base: HashMap<String, u64>,
    data: DashMap<String, ClapsEntry>,
    /// Serializes snapshot writes to the store.
    persist: Mutex<()>,
}

impl ClapCounter {
    /// Opens the counter with seeded base counts, replaying persisted
    /// increments from the store.
    pub fn open(
        store: Arc<dyn StateStore>,
        base: HashMap<String, u64>,
    ) -> Result<Self, StoreError> {
        let data = DashMap::new();
        if let Some(value) = store.load(CLAPS_COLLECTION)? {
            let entries: HashMap<String, ClapsEntry> =
                serde_json::from_value(value).unwrap_or_default();
            for (article_id, entry) in entries {
                data.insert(article_id, entry);
            }
        }
        Ok(Self {
            store,
            base,
            data,
            persist: Mutex::new(()),
        })
    }

    fn base_for(&self, article_id: &str) -> u64 {
        self.base.get(article_id).copied().unwrap_or(0)
    }

    /// Adds one clap by `address` on `article_id` and returns the new
    /// aggregate total.
    ///
    /// Beyond [`MAX_USER_CLAPS`] the call is a no-op returning the
    /// unchanged total. The per-user check and both increments happen
    /// under the resource's entry lock, so concurrent clappers cannot
    /// push a user past the ceiling.
    pub fn clap(&self, article_id: &str, address: &Address) -> Result<u64, StoreError> {
        let user_key = address_key(address);
        let total = {
            let mut entry = self.data.entry(article_id.to_string()).or_default();
            let count = entry.user_claps.get(&user_key).copied().unwrap_or(0);
            if count >= MAX_USER_CLAPS {
                return Ok(self.base_for(article_id) + entry.total);
            }
            entry.user_claps.insert(user_key, count + 1);
            entry.total += 1;
            self.base_for(article_id) + entry.total
        };
        self.save_snapshot()?;
        Ok(total)
    }

    /// Aggregate total for a resource: configured base plus all recorded
    /// user increments.
    pub fn total(&self, article_id: &str) -> u64 {
        let increments = self.data.get(article_id).map(|e| e.total).unwrap_or(0);
        self.base_for(article_id) + increments
    }

    /// How many claps `address` has recorded on `article_id`.
    pub fn user_claps(&self, article_id: &str, address: &Address) -> u32 {
        let key = address_key(address);
        self.data
            .get(article_id)
            .and_then(|e| e.user_claps.get(&key).copied())
            .unwrap_or(0)
    }

    fn save_snapshot(&self) -> Result<(), StoreError> {
        let _guard = self.persist.lock().expect("claps lock poisoned");
        let snapshot: HashMap<String, ClapsEntry> = self
            .data
            .iter()
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .collect();
        let value = serde_json::to_value(snapshot).expect("claps always serialize");
        self.store.save(CLAPS_COLLECTION, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn tx(byte: u8) -> TxHash {
        TxHash::repeat_byte(byte)
    }

    fn purchase(article: &str, address: &str, tx_hash: TxHash) -> Purchase {
        Purchase {
            article_id: article.to_string(),
            user_address: addr(address),
            tx_hash,
            timestamp: Utc::now(),
            amount: "0.05".to_string(),
        }
    }

    const PAYER: &str = "0xad70845D9AE0B40CB68Cc289414Ea21b1Ce18BC8";

    #[test]
    fn recording_same_triple_twice_keeps_one_entry() {
        let ledger = PurchaseLedger::open(Arc::new(MemoryStore::new())).unwrap();
        assert!(ledger.record(purchase("1", PAYER, tx(1))).unwrap());
        assert!(!ledger.record(purchase("1", PAYER, tx(1))).unwrap());
        assert_eq!(ledger.all().len(), 1);
    }

    #[test]
    fn different_transactions_for_same_pair_are_both_kept() {
        // History is append-only; a second settlement for the same pair is
        // a new audit record, not a replay.
        let ledger = PurchaseLedger::open(Arc::new(MemoryStore::new())).unwrap();
        assert!(ledger.record(purchase("1", PAYER, tx(1))).unwrap());
        assert!(ledger.record(purchase("1", PAYER, tx(2))).unwrap());
        assert_eq!(ledger.all().len(), 2);
    }

    #[test]
    fn membership_is_case_insensitive() {
        let ledger = PurchaseLedger::open(Arc::new(MemoryStore::new())).unwrap();
        ledger.record(purchase("1", PAYER, tx(1))).unwrap();
        let lowercased = addr(&PAYER.to_lowercase());
        assert!(ledger.has_purchased(&lowercased, "1"));
        assert_eq!(ledger.purchases_for(&lowercased).len(), 1);
        assert!(!ledger.has_purchased(&lowercased, "2"));
    }

    #[test]
    fn concurrent_record_of_same_triple_wins_once() {
        let ledger = Arc::new(PurchaseLedger::open(Arc::new(MemoryStore::new())).unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                ledger.record(purchase("1", PAYER, tx(7))).unwrap()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
        assert_eq!(ledger.all().len(), 1);
    }

    #[test]
    fn ledger_replays_persisted_history() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        {
            let ledger = PurchaseLedger::open(Arc::clone(&store)).unwrap();
            ledger.record(purchase("1", PAYER, tx(1))).unwrap();
        }
        let reopened = PurchaseLedger::open(store).unwrap();
        assert!(reopened.has_purchased(&addr(PAYER), "1"));
        // Replay must also restore the idempotence index.
        assert!(!reopened.record(purchase("1", PAYER, tx(1))).unwrap());
    }

    #[test]
    fn claps_are_capped_per_user() {
        let counter = ClapCounter::open(Arc::new(MemoryStore::new()), HashMap::new()).unwrap();
        let user = addr(PAYER);
        let mut last = 0;
        for _ in 0..50 {
            last = counter.clap("1", &user).unwrap();
        }
        assert_eq!(last, 50);
        assert_eq!(counter.user_claps("1", &user), 50);
        // The 51st attempt returns the same total as the 50th.
        assert_eq!(counter.clap("1", &user).unwrap(), last);
        assert_eq!(counter.user_claps("1", &user), MAX_USER_CLAPS);
    }

    #[test]
    fn totals_add_base_counts() {
        let base = HashMap::from([("1".to_string(), 2847u64)]);
        let counter = ClapCounter::open(Arc::new(MemoryStore::new()), base).unwrap();
        assert_eq!(counter.total("1"), 2847);
        assert_eq!(counter.clap("1", &addr(PAYER)).unwrap(), 2848);
        assert_eq!(counter.total("1"), 2848);
        assert_eq!(counter.total("unknown"), 0);
    }

    #[test]
    fn claps_are_case_insensitive_per_user() {
        let counter = ClapCounter::open(Arc::new(MemoryStore::new()), HashMap::new()).unwrap();
        counter.clap("1", &addr(PAYER)).unwrap();
        counter.clap("1", &addr(&PAYER.to_lowercase())).unwrap();
        assert_eq!(counter.user_claps("1", &addr(PAYER)), 2);
    }

    #[test]
    fn claps_survive_reopen() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        {
            let counter = ClapCounter::open(Arc::clone(&store), HashMap::new()).unwrap();
            counter.clap("1", &addr(PAYER)).unwrap();
            counter.clap("1", &addr(PAYER)).unwrap();
        }
        let reopened = ClapCounter::open(store, HashMap::new()).unwrap();
        assert_eq!(reopened.total("1"), 2);
        assert_eq!(reopened.user_claps("1", &addr(PAYER)), 2);
    }
}
