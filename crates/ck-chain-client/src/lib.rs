use async_trait::async_trait;
use ck_node_pool::{HealthChecker, NodeOrigin, NodePool, NodeStatusProbe};
use ck_types::{
    ChainId, InternalErrorKind, StatusInfo, TransactionRecord, TxId, ValidationResult,
    WalletAddress, WalletServiceError,
};
use rust_decimal::Decimal;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-chain parameters the wallet layer and reconciler need, declared
/// explicitly instead of inferred from scattered constants.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub chain: ChainId,
    pub symbol: String,
    pub decimals: u32,
    /// Balance a freshly-registered account must keep.
    pub min_balance: Decimal,
    /// Dust limit: smallest transferable amount.
    pub min_amount: Decimal,
    /// Fee charged by the remote KVS for registering an address.
    pub registration_fee: Decimal,
    /// A record younger than this with no chain counterpart is still pending.
    pub new_pending_ms: u64,
    /// A record older than this with no chain counterpart has failed.
    pub old_pending_ms: u64,
}

/// One blockchain's API surface. Adapters are stateless beyond the HTTP
/// client and map every transport or protocol failure into the closed
/// [`WalletServiceError`] taxonomy before returning.
#[async_trait]
pub trait ChainAdapter: NodeStatusProbe + Send + Sync {
    fn chain_id(&self) -> &ChainId;

    fn params(&self) -> &ChainParams;

    async fn get_balance(
        &self,
        origin: &NodeOrigin,
        address: &WalletAddress,
    ) -> Result<Decimal, WalletServiceError>;

    /// Current fee rate, for chains that expose one (UTXO chains). Account
    /// chains return `Ok(None)`.
    async fn get_fee_rate(&self, origin: &NodeOrigin) -> Result<Option<Decimal>, WalletServiceError>;

    /// A page of history for `address`, older entries at higher offsets.
    async fn get_transactions(
        &self,
        origin: &NodeOrigin,
        address: &WalletAddress,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<TransactionRecord>, WalletServiceError>;

    /// Chain-side view of one transaction; `Ok(None)` when the node does
    /// not know the id.
    async fn get_transaction(
        &self,
        origin: &NodeOrigin,
        tx_id: &TxId,
    ) -> Result<Option<TransactionRecord>, WalletServiceError>;

    /// Format and script-type validation, synchronous and offline.
    fn validate_address(&self, address: &WalletAddress) -> ValidationResult;
}

#[derive(Default)]
pub struct ChainRegistry {
    adapters: HashMap<ChainId, Arc<dyn ChainAdapter>>,
}

impl ChainRegistry {
    pub fn register(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.chain_id().clone(), adapter);
    }

    pub fn adapter(&self, chain: &ChainId) -> Option<Arc<dyn ChainAdapter>> {
        self.adapters.get(chain).cloned()
    }
}

// ── HTTP request executor ────────────────────────────────────────────

/// Thin JSON-over-HTTP executor shared by the REST adapters. Every call
/// carries an explicit timeout, tries the origin's fallback URL on a
/// network-class failure, and maps transport errors into the taxonomy.
#[derive(Clone)]
pub struct ApiCore {
    http: reqwest::Client,
    timeout: Duration,
}

impl ApiCore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        origin: &NodeOrigin,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, WalletServiceError> {
        match self.get_json_opt(origin, path, query).await? {
            Some(value) => Ok(value),
            None => Err(WalletServiceError::AccountNotFound),
        }
    }

    /// Like [`Self::get_json`] but turns a 404 into `Ok(None)` so adapters
    /// can decide what absence means (unknown tx vs unknown account).
    pub async fn get_json_opt<T: DeserializeOwned>(
        &self,
        origin: &NodeOrigin,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, WalletServiceError> {
        let mut last_error = WalletServiceError::NetworkError;
        for base in origin_urls(origin) {
            let url = format!("{}{}", base.trim_end_matches('/'), path);
            match self.get_once(&url, query).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_network_class() => {
                    debug!(%url, %error, "request failed, trying fallback if any");
                    last_error = error;
                }
                Err(error) => return Err(error),
            }
        }
        Err(last_error)
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        origin: &NodeOrigin,
        path: &str,
        body: &B,
    ) -> Result<T, WalletServiceError> {
        let mut last_error = WalletServiceError::NetworkError;
        for base in origin_urls(origin) {
            let url = format!("{}{}", base.trim_end_matches('/'), path);
            let response = self
                .http
                .post(&url)
                .timeout(self.timeout)
                .json(body)
                .send()
                .await;
            match response {
                Ok(response) => return decode_response(response).await,
                Err(error) => {
                    let mapped = map_transport_error(&error);
                    if !mapped.is_network_class() {
                        return Err(mapped);
                    }
                    debug!(%url, %error, "post failed, trying fallback if any");
                    last_error = mapped;
                }
            }
        }
        Err(last_error)
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, WalletServiceError> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .query(query)
            .send()
            .await
            .map_err(|error| map_transport_error(&error))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode_response(response).await.map(Some)
    }
}

fn origin_urls(origin: &NodeOrigin) -> impl Iterator<Item = &str> {
    std::iter::once(origin.primary.as_str()).chain(origin.fallback.as_deref())
}

async fn decode_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, WalletServiceError> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(WalletServiceError::NotLogged);
    }
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(WalletServiceError::RemoteServiceError(format!(
            "HTTP {status}: {text}"
        )));
    }
    response
        .json::<T>()
        .await
        .map_err(|_| WalletServiceError::InternalError(InternalErrorKind::Parse))
}

/// Maps a reqwest transport failure into the taxonomy. Timeouts count as
/// network errors so a hung node demotes the same way an unreachable one
/// does.
pub fn map_transport_error(error: &reqwest::Error) -> WalletServiceError {
    if error.is_decode() {
        WalletServiceError::InternalError(InternalErrorKind::Parse)
    } else {
        WalletServiceError::NetworkError
    }
}

// ── Pool-aware request path ──────────────────────────────────────────

/// Pairs a node pool with its health checker. Picks the best ranked node
/// at call time, fails fast when the pool has no allowed node, and kicks
/// off an out-of-band health check after a network-class failure without
/// delaying the caller's error.
#[derive(Clone)]
pub struct NodeConnection {
    pool: Arc<NodePool>,
    checker: Arc<HealthChecker>,
}

impl NodeConnection {
    pub fn new(pool: Arc<NodePool>, checker: Arc<HealthChecker>) -> Self {
        Self { pool, checker }
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    pub fn checker(&self) -> &Arc<HealthChecker> {
        &self.checker
    }

    pub fn has_active_node(&self) -> bool {
        self.pool.has_active_node()
    }

    pub async fn request<T, F, Fut>(&self, call: F) -> Result<T, WalletServiceError>
    where
        F: FnOnce(NodeOrigin) -> Fut,
        Fut: Future<Output = Result<T, WalletServiceError>>,
    {
        let Some(origin) = self.pool.chosen_origin() else {
            self.checker.trigger_out_of_band();
            return Err(WalletServiceError::NetworkError);
        };

        match call(origin).await {
            Ok(value) => Ok(value),
            Err(error) => {
                if error.is_network_class() {
                    warn!(%error, "request failed, scheduling health check");
                    self.checker.trigger_out_of_band();
                }
                Err(error)
            }
        }
    }
}
