use async_trait::async_trait;
use ck_crypto::KeyMaterial;
use ck_types::{OwnerId, TransactionRecord, TransactionStatus, TxId, WalletServiceError};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{RwLock, watch};

// ── Transaction cache (coin storage) ─────────────────────────────────

/// Snapshot published to subscribers after every cache mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheView {
    pub transactions: Vec<TransactionRecord>,
    pub has_more_old_transactions: bool,
}

struct CacheInner {
    /// First-seen order of tx ids; pagination stability depends on it.
    order: Vec<TxId>,
    records: HashMap<TxId, TransactionRecord>,
    has_more_old: bool,
}

/// Append-only, de-duplicating store of one wallet's transaction
/// summaries. Safe to call from a history poller and a status updater
/// concurrently; mutations are serialized by an internal lock and every
/// change is published on a watch channel.
pub struct TransactionCache {
    inner: Mutex<CacheInner>,
    publisher: watch::Sender<CacheView>,
}

impl Default for TransactionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionCache {
    pub fn new() -> Self {
        let initial = CacheView {
            transactions: Vec::new(),
            has_more_old_transactions: true,
        };
        let (publisher, _) = watch::channel(initial);
        Self {
            inner: Mutex::new(CacheInner {
                order: Vec::new(),
                records: HashMap::new(),
                has_more_old: true,
            }),
            publisher,
        }
    }

    /// Merges new records, deduplicating by tx id. Returns how many were
    /// actually inserted. Re-appending a known id never reorders it.
    pub fn append(&self, transactions: Vec<TransactionRecord>) -> usize {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let mut inserted = 0;
        for record in transactions {
            if inner.records.contains_key(&record.tx_id) {
                continue;
            }
            inner.order.push(record.tx_id.clone());
            inner.records.insert(record.tx_id.clone(), record);
            inserted += 1;
        }
        if inserted > 0 {
            self.publish(&inner);
        }
        inserted
    }

    /// In-place status update; a no-op returning `false` if the id is
    /// not cached.
    pub fn update_status(&self, tx_id: &TxId, status: TransactionStatus) -> bool {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let Some(record) = inner.records.get_mut(tx_id) else {
            return false;
        };
        if record.status == status {
            return true;
        }
        record.status = status;
        self.publish(&inner);
        true
    }

    pub fn set_has_more_old(&self, has_more: bool) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if inner.has_more_old != has_more {
            inner.has_more_old = has_more;
            self.publish(&inner);
        }
    }

    pub fn has_more_old(&self) -> bool {
        self.inner.lock().expect("cache lock poisoned").has_more_old
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, tx_id: &TxId) -> Option<TransactionRecord> {
        self.inner
            .lock()
            .expect("cache lock poisoned")
            .records
            .get(tx_id)
            .cloned()
    }

    /// Empties the cache (logout) and resets the pagination flag.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.order.clear();
        inner.records.clear();
        inner.has_more_old = true;
        self.publish(&inner);
    }

    pub fn snapshot(&self) -> CacheView {
        let inner = self.inner.lock().expect("cache lock poisoned");
        Self::view(&inner)
    }

    /// Reactive read surface; receivers see the current list plus the
    /// `has_more_old_transactions` flag after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<CacheView> {
        self.publisher.subscribe()
    }

    fn publish(&self, inner: &CacheInner) {
        self.publisher.send_replace(Self::view(inner));
    }

    fn view(inner: &CacheInner) -> CacheView {
        let transactions = inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id))
            .cloned()
            .collect();
        CacheView {
            transactions,
            has_more_old_transactions: inner.has_more_old,
        }
    }
}

// ── Secure persistent store ──────────────────────────────────────────

/// Device-local secure storage for cached address/nonce metadata. The
/// real implementation lives in the host application; tests and demos
/// use [`InMemorySecureStore`].
#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, WalletServiceError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), WalletServiceError>;
}

#[derive(Default)]
pub struct InMemorySecureStore {
    values: RwLock<HashMap<String, String>>,
}

#[async_trait]
impl SecureStore for InMemorySecureStore {
    async fn get(&self, key: &str) -> Result<Option<String>, WalletServiceError> {
        let guard = self.values.read().await;
        Ok(guard.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), WalletServiceError> {
        let mut guard = self.values.write().await;
        guard.insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

// ── Remote key-value store ───────────────────────────────────────────

/// Client of the remote key-value store used by the address registry.
/// Writes are signed with the owner's key material; the remote side
/// charges a registration fee, so `store` can fail with
/// [`WalletServiceError::NotEnoughMoney`].
#[async_trait]
pub trait KvsClient: Send + Sync {
    async fn get(&self, key: &str, owner: &OwnerId) -> Result<Option<String>, WalletServiceError>;

    async fn store(
        &self,
        key: &str,
        value: &str,
        owner: &OwnerId,
        keys: &KeyMaterial,
    ) -> Result<(), WalletServiceError>;
}

#[derive(Default)]
pub struct InMemoryKvs {
    values: RwLock<HashMap<(String, OwnerId), String>>,
}

#[async_trait]
impl KvsClient for InMemoryKvs {
    async fn get(&self, key: &str, owner: &OwnerId) -> Result<Option<String>, WalletServiceError> {
        let guard = self.values.read().await;
        Ok(guard.get(&(key.to_owned(), owner.clone())).cloned())
    }

    async fn store(
        &self,
        key: &str,
        value: &str,
        owner: &OwnerId,
        _keys: &KeyMaterial,
    ) -> Result<(), WalletServiceError> {
        let mut guard = self.values.write().await;
        guard.insert((key.to_owned(), owner.clone()), value.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_types::WalletAddress;
    use rust_decimal_macros::dec;

    fn record(id: &str) -> TransactionRecord {
        TransactionRecord {
            tx_id: TxId(id.to_owned()),
            sender: WalletAddress("sender".to_owned()),
            recipient: WalletAddress("recipient".to_owned()),
            amount: dec!(1),
            fee: None,
            confirmations: None,
            block_id: None,
            is_outgoing: true,
            status: TransactionStatus::Pending,
            sent_at_epoch_ms: Some(1_700_000_000_000),
            in_pool: false,
        }
    }

    #[test]
    fn append_deduplicates_by_tx_id() {
        let cache = TransactionCache::new();
        assert_eq!(cache.append(vec![record("a"), record("b")]), 2);
        assert_eq!(cache.append(vec![record("a")]), 0);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn append_preserves_first_seen_order() {
        let cache = TransactionCache::new();
        cache.append(vec![record("a"), record("b")]);
        cache.append(vec![record("b"), record("c"), record("a")]);

        let ids: Vec<String> = cache
            .snapshot()
            .transactions
            .iter()
            .map(|tx| tx.tx_id.0.clone())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn update_status_is_noop_for_unknown_id() {
        let cache = TransactionCache::new();
        cache.append(vec![record("a")]);

        assert!(!cache.update_status(&TxId("missing".to_owned()), TransactionStatus::Success));
        assert!(cache.update_status(&TxId("a".to_owned()), TransactionStatus::Success));
        assert_eq!(
            cache.get(&TxId("a".to_owned())).unwrap().status,
            TransactionStatus::Success
        );
    }

    #[test]
    fn clear_empties_and_resets_pagination() {
        let cache = TransactionCache::new();
        cache.append(vec![record("a")]);
        cache.set_has_more_old(false);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.has_more_old());
    }

    #[tokio::test]
    async fn subscribers_observe_mutations() -> anyhow::Result<()> {
        let cache = TransactionCache::new();
        let mut rx = cache.subscribe();

        cache.append(vec![record("a")]);
        rx.changed().await?;
        assert_eq!(rx.borrow().transactions.len(), 1);

        cache.set_has_more_old(false);
        rx.changed().await?;
        assert!(!rx.borrow().has_more_old_transactions);
        Ok(())
    }

    #[tokio::test]
    async fn in_memory_kvs_roundtrip() -> anyhow::Result<()> {
        use ck_crypto::{Ed25519KeyDeriver, KeyDeriver};
        use ck_types::ChainId;

        let kvs = InMemoryKvs::default();
        let owner = OwnerId("owner-1".to_owned());
        let keys = Ed25519KeyDeriver.derive("secret", &ChainId("btc".to_owned()))?;

        assert_eq!(kvs.get("btc:address", &owner).await?, None);
        kvs.store("btc:address", "1abc", &owner, &keys).await?;
        assert_eq!(
            kvs.get("btc:address", &owner).await?.as_deref(),
            Some("1abc")
        );
        Ok(())
    }

    #[tokio::test]
    async fn secure_store_roundtrip() -> anyhow::Result<()> {
        let store = InMemorySecureStore::default();
        assert_eq!(store.get("btc:last-address").await?, None);
        store.set("btc:last-address", "1abc").await?;
        assert_eq!(store.get("btc:last-address").await?.as_deref(), Some("1abc"));
        Ok(())
    }
}
