//! KVS-backed address registry: resolves a local account identifier to a
//! chain address, caches resolutions in memory, and re-saves a missing or
//! stale remote value. Registration costs a fee on the remote store, so a
//! save that fails on low balance parks itself behind the wallet's
//! balance-update events and retries exactly once per update.

use ck_crypto::KeyMaterial;
use ck_storage::KvsClient;
use ck_types::{OwnerId, WalletAddress, WalletEvent, WalletServiceError};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct PendingSave {
    id: Uuid,
    task: JoinHandle<()>,
}

pub struct AddressRegistry {
    kvs: Arc<dyn KvsClient>,
    /// Remote key the address is stored under, e.g. `btc:address`.
    kvs_key: String,
    registration_fee: Decimal,
    resolved: Mutex<HashMap<OwnerId, WalletAddress>>,
    pending: Mutex<HashMap<OwnerId, PendingSave>>,
}

impl AddressRegistry {
    pub fn new(kvs: Arc<dyn KvsClient>, kvs_key: impl Into<String>, registration_fee: Decimal) -> Self {
        Self {
            kvs,
            kvs_key: kvs_key.into(),
            registration_fee,
            resolved: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves `owner` to its registered chain address: the in-memory
    /// cache first, the remote store on a miss. Absence on the remote
    /// side is a distinguishable condition so callers can register one.
    pub async fn get_wallet_address(
        &self,
        owner: &OwnerId,
    ) -> Result<WalletAddress, WalletServiceError> {
        if let Some(address) = self.resolved.lock().expect("registry lock poisoned").get(owner) {
            return Ok(address.clone());
        }

        match self.kvs.get(&self.kvs_key, owner).await? {
            Some(raw) => {
                let address = WalletAddress(raw);
                self.resolved
                    .lock()
                    .expect("registry lock poisoned")
                    .insert(owner.clone(), address.clone());
                Ok(address)
            }
            None => Err(WalletServiceError::WalletNotInitiated),
        }
    }

    /// Writes `address` to the remote store. On `NotEnoughMoney` the
    /// registry subscribes to the wallet's events and retries once per
    /// balance update until the save succeeds or the subscription is
    /// cancelled; the original error is still returned to the caller.
    /// A new save request for the same owner replaces any earlier
    /// subscription, so there is never more than one in flight.
    pub async fn save(
        self: &Arc<Self>,
        owner: &OwnerId,
        address: &WalletAddress,
        keys: &KeyMaterial,
        current_balance: Decimal,
        updates: broadcast::Receiver<WalletEvent>,
    ) -> Result<(), WalletServiceError> {
        self.cancel(owner);

        match self.attempt(owner, address, keys, current_balance).await {
            Ok(()) => Ok(()),
            Err(WalletServiceError::NotEnoughMoney) => {
                self.park_retry(owner.clone(), address.clone(), keys.clone(), updates);
                Err(WalletServiceError::NotEnoughMoney)
            }
            Err(error) => Err(error),
        }
    }

    /// Cancels a parked retry, if any. Called on logout and before a new
    /// save request for the same owner.
    pub fn cancel(&self, owner: &OwnerId) {
        if let Some(parked) = self.pending.lock().expect("registry lock poisoned").remove(owner) {
            parked.task.abort();
            debug!(owner = %owner.0, "cancelled parked address registration");
        }
    }

    pub fn has_pending_save(&self, owner: &OwnerId) -> bool {
        self.pending
            .lock()
            .expect("registry lock poisoned")
            .contains_key(owner)
    }

    async fn attempt(
        &self,
        owner: &OwnerId,
        address: &WalletAddress,
        keys: &KeyMaterial,
        balance: Decimal,
    ) -> Result<(), WalletServiceError> {
        // the remote charges the fee on top, so a charged fee requires the
        // balance to strictly exceed it; a zero fee means free registration
        if !self.registration_fee.is_zero() && balance <= self.registration_fee {
            return Err(WalletServiceError::NotEnoughMoney);
        }
        self.kvs
            .store(&self.kvs_key, &address.0, owner, keys)
            .await?;
        self.resolved
            .lock()
            .expect("registry lock poisoned")
            .insert(owner.clone(), address.clone());
        Ok(())
    }

    fn park_retry(
        self: &Arc<Self>,
        owner: OwnerId,
        address: WalletAddress,
        keys: KeyMaterial,
        mut updates: broadcast::Receiver<WalletEvent>,
    ) {
        let id = Uuid::new_v4();
        let registry = Arc::clone(self);
        let task_owner = owner.clone();

        let task = tokio::spawn(async move {
            loop {
                let balance = match updates.recv().await {
                    Ok(WalletEvent::WalletUpdated(account)) => account.balance,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match registry.attempt(&task_owner, &address, &keys, balance).await {
                    Ok(()) => {
                        info!(owner = %task_owner.0, "deferred address registration succeeded");
                        let mut pending =
                            registry.pending.lock().expect("registry lock poisoned");
                        if pending.get(&task_owner).is_some_and(|parked| parked.id == id) {
                            pending.remove(&task_owner);
                        }
                        break;
                    }
                    Err(WalletServiceError::NotEnoughMoney) => continue,
                    Err(error) => {
                        warn!(owner = %task_owner.0, %error, "deferred address registration failed, waiting for next balance update");
                        continue;
                    }
                }
            }
        });

        // two saves can race past cancel() while both are awaiting the
        // remote store; the later one wins and the displaced retry must
        // be aborted, not silently dropped
        if let Some(displaced) = self
            .pending
            .lock()
            .expect("registry lock poisoned")
            .insert(owner, PendingSave { id, task })
        {
            displaced.task.abort();
        }
    }
}
