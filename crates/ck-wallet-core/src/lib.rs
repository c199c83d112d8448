//! Wallet lifecycle service: one instance per (chain, account) pair.
//! Owns the session keys, the account snapshot, and the transaction
//! cache, and drives balance/fee refreshes through the chain's node
//! pool. Consumers observe it through a watch channel (current account)
//! and a broadcast channel (discrete wallet events).

pub mod reconciler;
pub mod registry;

pub use reconciler::{ChainLookup, ReconcileContext, status_for};
pub use registry::AddressRegistry;

use ck_chain_client::{ChainAdapter, NodeConnection};
use ck_crypto::{KeyDeriver, KeyMaterial};
use ck_storage::{SecureStore, TransactionCache};
use ck_types::{
    OwnerId, TransactionRecord, TransactionStatus, ValidationResult, WalletAccount,
    WalletAddress, WalletEvent, WalletServiceError, WalletServiceState,
};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Result of reconciling one locally-known transaction against the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionStatusInfo {
    pub sent_at_epoch_ms: Option<u64>,
    pub status: TransactionStatus,
}

struct Session {
    owner: OwnerId,
    keys: KeyMaterial,
    account: WalletAccount,
}

pub struct WalletService {
    adapter: Arc<dyn ChainAdapter>,
    connection: NodeConnection,
    deriver: Arc<dyn KeyDeriver>,
    registry: Arc<AddressRegistry>,
    cache: Arc<TransactionCache>,
    secure_store: Arc<dyn SecureStore>,
    state: Mutex<WalletServiceState>,
    session: Mutex<Option<Session>>,
    account_tx: watch::Sender<Option<WalletAccount>>,
    events: broadcast::Sender<WalletEvent>,
    fee_rate: Mutex<Option<Decimal>>,
    enabled: AtomicBool,
}

impl WalletService {
    pub fn new(
        adapter: Arc<dyn ChainAdapter>,
        connection: NodeConnection,
        deriver: Arc<dyn KeyDeriver>,
        registry: Arc<AddressRegistry>,
        cache: Arc<TransactionCache>,
        secure_store: Arc<dyn SecureStore>,
    ) -> Self {
        let (account_tx, _) = watch::channel(None);
        let (events, _) = broadcast::channel(64);
        Self {
            adapter,
            connection,
            deriver,
            registry,
            cache,
            secure_store,
            state: Mutex::new(WalletServiceState::NotInitiated),
            session: Mutex::new(None),
            account_tx,
            events,
            fee_rate: Mutex::new(None),
            enabled: AtomicBool::new(true),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Derives the session keys from `secret` and opens the wallet.
    /// Re-entrant while a session is live: a second call returns the
    /// current account unchanged. A failed initiation is a dead end
    /// until [`Self::logout`] resets the service.
    pub async fn init_wallet(
        &self,
        owner: &OwnerId,
        secret: &str,
    ) -> Result<WalletAccount, WalletServiceError> {
        {
            let state = self.state.lock().expect("state lock poisoned");
            match &*state {
                WalletServiceState::Updating | WalletServiceState::UpToDate => {
                    if let Some(session) =
                        self.session.lock().expect("session lock poisoned").as_ref()
                    {
                        return Ok(session.account.clone());
                    }
                }
                WalletServiceState::InitiationFailed(_) => {
                    return Err(WalletServiceError::NotLogged);
                }
                WalletServiceState::NotInitiated => {}
            }
        }

        let keys = match self.deriver.derive(secret, self.adapter.chain_id()) {
            Ok(keys) => keys,
            Err(error) => {
                self.session.lock().expect("session lock poisoned").take();
                self.set_state(WalletServiceState::InitiationFailed(error.to_string()));
                return Err(error);
            }
        };

        let params = self.adapter.params();
        let account =
            WalletAccount::new(keys.address.clone(), params.min_balance, params.min_amount);

        {
            let mut session = self.session.lock().expect("session lock poisoned");
            *session = Some(Session {
                owner: owner.clone(),
                keys: keys.clone(),
                account: account.clone(),
            });
        }
        self.account_tx.send_replace(Some(account.clone()));
        self.set_state(WalletServiceState::UpToDate);

        // best-effort local persistence so the host can show the address offline
        let store_key = format!("{}:wallet-address", params.chain);
        if let Err(error) = self.secure_store.set(&store_key, &account.address.0).await {
            warn!(%error, "failed to persist wallet address locally");
        }

        self.spawn_registry_reconcile(
            owner.clone(),
            account.address.clone(),
            keys,
            account.balance,
        );

        info!(chain = %params.chain, address = %account.address, "wallet initialized");
        Ok(account)
    }

    /// Closes the session: cancels any parked address registration,
    /// drops the cached history, and returns to the uninitialized state.
    pub fn logout(&self) {
        if let Some(session) = self.session.lock().expect("session lock poisoned").take() {
            self.registry.cancel(&session.owner);
        }
        self.cache.clear();
        *self.fee_rate.lock().expect("fee lock poisoned") = None;
        self.account_tx.send_replace(None);
        self.set_state(WalletServiceState::NotInitiated);
        info!("wallet session closed");
    }

    /// Refreshes the balance and fee rate. At most one refresh runs at
    /// a time: a call that finds one already in flight is a no-op and
    /// touches no node.
    pub async fn update(&self) -> Result<(), WalletServiceError> {
        let address = self.session_address()?;
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state != WalletServiceState::UpToDate {
                return Ok(());
            }
            *state = WalletServiceState::Updating;
        }
        let _ = self
            .events
            .send(WalletEvent::ServiceStateChanged(WalletServiceState::Updating));

        let adapter = Arc::clone(&self.adapter);
        let target = address.clone();
        let balance = self
            .connection
            .request(move |origin| async move { adapter.get_balance(&origin, &target).await })
            .await;

        match balance {
            Ok(balance) => self.apply_balance(balance),
            Err(error) => warn!(%error, "balance refresh failed, keeping last known balance"),
        }

        self.refresh_fee_rate().await;
        self.set_state(WalletServiceState::UpToDate);
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn validate(&self, address: &WalletAddress) -> ValidationResult {
        self.adapter.validate_address(address)
    }

    /// Balance of an arbitrary address, bypassing the session account.
    pub async fn get_balance(
        &self,
        address: &WalletAddress,
    ) -> Result<Decimal, WalletServiceError> {
        let adapter = Arc::clone(&self.adapter);
        let address = address.clone();
        self.connection
            .request(move |origin| async move { adapter.get_balance(&origin, &address).await })
            .await
    }

    /// Loads one page of history into the cache. A short page means the
    /// chain has nothing older, so the pagination flag is cleared.
    pub async fn load_transactions(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<usize, WalletServiceError> {
        let address = self.session_address()?;
        let adapter = Arc::clone(&self.adapter);
        let page = self
            .connection
            .request(move |origin| async move {
                adapter.get_transactions(&origin, &address, offset, limit).await
            })
            .await?;

        let fetched = page.len();
        self.cache.append(page);
        self.cache.set_has_more_old(fetched as u64 >= limit);
        Ok(fetched)
    }

    /// Looks the transaction up on the chain, reconciles it against the
    /// local record, and writes the resulting status back to the cache.
    pub async fn status_info_for(
        &self,
        local: &TransactionRecord,
    ) -> Result<TransactionStatusInfo, WalletServiceError> {
        let wallet_address = self.session_address()?;

        let adapter = Arc::clone(&self.adapter);
        let tx_id = local.tx_id.clone();
        let lookup = match self
            .connection
            .request(move |origin| async move { adapter.get_transaction(&origin, &tx_id).await })
            .await
        {
            Ok(Some(record)) => ChainLookup::Found(record),
            Ok(None) => ChainLookup::Absent,
            Err(error) if error.is_network_class() => ChainLookup::NetworkFailure,
            Err(error) => {
                // the node answered but could not produce the record; let
                // the record's age decide between pending and failed
                debug!(%error, tx_id = %local.tx_id, "transaction lookup failed");
                ChainLookup::Absent
            }
        };

        let params = self.adapter.params();
        let ctx = ReconcileContext {
            wallet_address,
            now_epoch_ms: epoch_ms(),
            new_pending_ms: params.new_pending_ms,
            old_pending_ms: params.old_pending_ms,
        };
        let status = status_for(local, &lookup, &ctx);
        self.cache.update_status(&local.tx_id, status.clone());
        Ok(TransactionStatusInfo {
            sent_at_epoch_ms: local.sent_at_epoch_ms,
            status,
        })
    }

    // ── State and observation ────────────────────────────────────────

    pub fn state(&self) -> WalletServiceState {
        self.state.lock().expect("state lock poisoned").clone()
    }

    pub fn wallet(&self) -> Option<WalletAccount> {
        self.session
            .lock()
            .expect("session lock poisoned")
            .as_ref()
            .map(|session| session.account.clone())
    }

    pub fn fee_rate(&self) -> Option<Decimal> {
        *self.fee_rate.lock().expect("fee lock poisoned")
    }

    /// Forces the next successful refresh to re-announce the balance.
    pub fn invalidate_balance(&self) {
        let updated = {
            let mut session = self.session.lock().expect("session lock poisoned");
            let Some(session) = session.as_mut() else {
                return;
            };
            session.account.is_balance_initialized = false;
            session.account.clone()
        };
        self.account_tx.send_replace(Some(updated));
    }

    /// Zeroes the unseen balance-raise counter once the host has shown it.
    pub fn acknowledge_notifications(&self) {
        let updated = {
            let mut session = self.session.lock().expect("session lock poisoned");
            let Some(session) = session.as_mut() else {
                return;
            };
            if session.account.notification_count == 0 {
                return;
            }
            session.account.notification_count = 0;
            session.account.clone()
        };
        self.account_tx.send_replace(Some(updated));
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) != enabled {
            let _ = self.events.send(WalletEvent::ServiceEnabledChanged(enabled));
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    pub fn account_watch(&self) -> watch::Receiver<Option<WalletAccount>> {
        self.account_tx.subscribe()
    }

    pub fn cache(&self) -> &Arc<TransactionCache> {
        &self.cache
    }

    pub fn connection(&self) -> &NodeConnection {
        &self.connection
    }

    // ── Internals ────────────────────────────────────────────────────

    fn session_address(&self) -> Result<WalletAddress, WalletServiceError> {
        self.session
            .lock()
            .expect("session lock poisoned")
            .as_ref()
            .map(|session| session.account.address.clone())
            .ok_or(WalletServiceError::NotLogged)
    }

    fn set_state(&self, next: WalletServiceState) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state == next {
                return;
            }
            *state = next.clone();
        }
        let _ = self.events.send(WalletEvent::ServiceStateChanged(next));
    }

    fn apply_balance(&self, balance: Decimal) {
        let (updated, raised) = {
            let mut session = self.session.lock().expect("session lock poisoned");
            let Some(session) = session.as_mut() else {
                return;
            };
            let was_initialized = session.account.is_balance_initialized;
            let previous = session.account.balance;
            if was_initialized && previous == balance {
                return;
            }
            session.account.balance = balance;
            session.account.is_balance_initialized = true;
            let raised = was_initialized && balance > previous;
            if raised {
                session.account.notification_count += 1;
            }
            (
                session.account.clone(),
                raised.then_some((previous, balance)),
            )
        };

        self.account_tx.send_replace(Some(updated.clone()));
        let _ = self.events.send(WalletEvent::WalletUpdated(updated));
        if let Some((previous, current)) = raised {
            let _ = self
                .events
                .send(WalletEvent::BalanceRaised { previous, current });
        }
    }

    async fn refresh_fee_rate(&self) {
        let adapter = Arc::clone(&self.adapter);
        let result = self
            .connection
            .request(move |origin| async move { adapter.get_fee_rate(&origin).await })
            .await;

        match result {
            Ok(Some(rate)) => {
                let changed = {
                    let mut current = self.fee_rate.lock().expect("fee lock poisoned");
                    if *current == Some(rate) {
                        false
                    } else {
                        *current = Some(rate);
                        true
                    }
                };
                if changed {
                    let _ = self.events.send(WalletEvent::TransactionFeeUpdated(rate));
                }
            }
            Ok(None) => {}
            Err(error) => debug!(%error, "fee rate refresh failed"),
        }
    }

    /// Makes sure the remote registry maps `owner` to the session's
    /// address. Runs off the init path: registration must never delay or
    /// fail a login.
    fn spawn_registry_reconcile(
        &self,
        owner: OwnerId,
        address: WalletAddress,
        keys: KeyMaterial,
        balance: Decimal,
    ) {
        let registry = Arc::clone(&self.registry);
        let updates = self.events.subscribe();
        tokio::spawn(async move {
            let needs_save = match registry.get_wallet_address(&owner).await {
                Ok(existing) => existing != address,
                Err(WalletServiceError::WalletNotInitiated) => true,
                Err(error) => {
                    warn!(%error, "address registry lookup failed");
                    return;
                }
            };
            if needs_save {
                if let Err(error) = registry
                    .save(&owner, &address, &keys, balance, updates)
                    .await
                {
                    debug!(%error, "address registration deferred");
                }
            }
        });
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
