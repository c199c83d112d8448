use async_trait::async_trait;
use ck_chain_client::{ApiCore, ChainAdapter, ChainParams};
use ck_node_pool::{NodeOrigin, NodeStatusProbe, PoolConfig};
use ck_types::{
    ChainId, InvalidAddressReason, NodeVersion, StatusInfo, TransactionRecord, TransactionStatus,
    TxId, ValidationResult, WalletAddress, WalletServiceError,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::{Duration, Instant};

pub const LSK: &str = "lsk";

/// lisk32 payload alphabet; addresses are `lsk` + 38 of these.
const LISK32_CHARSET: &str = "zxvcpmbn3465o978uyrtkqew2adsjhfg";

#[derive(Debug, Clone)]
pub struct LskConfig {
    pub params: ChainParams,
    pub min_node_version: NodeVersion,
    pub max_height_lag: u64,
    pub request_timeout: Duration,
}

impl LskConfig {
    pub fn mainnet() -> Self {
        Self {
            params: ChainParams {
                chain: ChainId(LSK.to_owned()),
                symbol: "LSK".to_owned(),
                decimals: 8,
                min_balance: Decimal::new(5, 2),
                min_amount: Decimal::new(1, 8),
                registration_fee: Decimal::ZERO,
                new_pending_ms: 60 * 1000,
                old_pending_ms: 60 * 60 * 1000,
            },
            min_node_version: NodeVersion(3, 0, 0),
            max_height_lag: 5,
            request_timeout: Duration::from_secs(20),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_height_lag: self.max_height_lag,
            min_version: Some(self.min_node_version),
            probe_timeout: self.request_timeout,
        }
    }
}

/// REST adapter for the Lisk service API.
pub struct LskAdapter {
    config: LskConfig,
    core: ApiCore,
}

impl LskAdapter {
    pub fn new(config: LskConfig) -> Self {
        let core = ApiCore::new(config.request_timeout);
        Self { config, core }
    }

    pub fn config(&self) -> &LskConfig {
        &self.config
    }

    fn coins(&self, beddows: &str) -> Result<Decimal, WalletServiceError> {
        let raw: i64 = beddows
            .parse()
            .map_err(|_| WalletServiceError::InternalError(ck_types::InternalErrorKind::Parse))?;
        Ok(Decimal::new(raw, self.config.params.decimals))
    }

    fn map_tx(&self, tx: LskTx) -> Result<TransactionRecord, WalletServiceError> {
        let confirmed = tx.block.as_ref().and_then(|block| block.height).is_some();
        Ok(TransactionRecord {
            tx_id: TxId(tx.id),
            sender: WalletAddress(tx.sender.address),
            recipient: WalletAddress(tx.params.recipient_address.unwrap_or_default()),
            amount: self.coins(&tx.params.amount)?,
            fee: Some(self.coins(&tx.fee)?),
            confirmations: tx.confirmations,
            block_id: tx.block.as_ref().and_then(|block| block.id.clone()),
            is_outgoing: false,
            status: TransactionStatus::NotInitiated,
            sent_at_epoch_ms: tx
                .block
                .as_ref()
                .and_then(|block| block.timestamp)
                .map(|secs| secs * 1000),
            in_pool: !confirmed && tx.execution_status.as_deref() == Some("pending"),
        })
    }
}

// ── Service API wire types ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct NetworkStatus {
    height: u64,
    #[serde(rename = "networkVersion")]
    network_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenBalance {
    #[serde(rename = "availableBalance")]
    available_balance: String,
}

#[derive(Debug, Deserialize)]
struct LskTx {
    id: String,
    fee: String,
    sender: LskParty,
    params: LskTxParams,
    block: Option<LskBlockRef>,
    confirmations: Option<u64>,
    #[serde(rename = "executionStatus")]
    execution_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LskParty {
    address: String,
}

#[derive(Debug, Deserialize)]
struct LskTxParams {
    amount: String,
    #[serde(rename = "recipientAddress")]
    recipient_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LskBlockRef {
    id: Option<String>,
    height: Option<u64>,
    timestamp: Option<u64>,
}

#[async_trait]
impl NodeStatusProbe for LskAdapter {
    async fn get_status_info(&self, origin: &NodeOrigin) -> Result<StatusInfo, WalletServiceError> {
        let started = Instant::now();
        let status: Envelope<NetworkStatus> = self
            .core
            .get_json(origin, "/api/v3/network/status", &[])
            .await?;
        let version = status
            .data
            .network_version
            .as_deref()
            .and_then(|raw| raw.parse().ok());
        Ok(StatusInfo {
            ping_ms: started.elapsed().as_millis() as u64,
            height: status.data.height,
            version,
        })
    }
}

#[async_trait]
impl ChainAdapter for LskAdapter {
    fn chain_id(&self) -> &ChainId {
        &self.config.params.chain
    }

    fn params(&self) -> &ChainParams {
        &self.config.params
    }

    async fn get_balance(
        &self,
        origin: &NodeOrigin,
        address: &WalletAddress,
    ) -> Result<Decimal, WalletServiceError> {
        let balances: Envelope<Vec<TokenBalance>> = self
            .core
            .get_json(
                origin,
                "/api/v3/token/balances",
                &[("address", address.0.clone())],
            )
            .await?;
        let Some(first) = balances.data.first() else {
            // the service answers 200 with an empty list for unknown accounts
            return Err(WalletServiceError::AccountNotFound);
        };
        self.coins(&first.available_balance)
    }

    async fn get_fee_rate(
        &self,
        _origin: &NodeOrigin,
    ) -> Result<Option<Decimal>, WalletServiceError> {
        // account-based chain; fees are fixed per transaction, not a rate
        Ok(None)
    }

    async fn get_transactions(
        &self,
        origin: &NodeOrigin,
        address: &WalletAddress,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<TransactionRecord>, WalletServiceError> {
        let txs: Envelope<Vec<LskTx>> = self
            .core
            .get_json(
                origin,
                "/api/v3/transactions",
                &[
                    ("address", address.0.clone()),
                    ("offset", offset.to_string()),
                    ("limit", limit.to_string()),
                    ("sort", "timestamp:desc".to_owned()),
                ],
            )
            .await?;
        txs.data.into_iter().map(|tx| self.map_tx(tx)).collect()
    }

    async fn get_transaction(
        &self,
        origin: &NodeOrigin,
        tx_id: &TxId,
    ) -> Result<Option<TransactionRecord>, WalletServiceError> {
        let response: Option<Envelope<Vec<LskTx>>> = self
            .core
            .get_json_opt(
                origin,
                "/api/v3/transactions",
                &[("transactionID", tx_id.0.clone())],
            )
            .await?;
        let Some(envelope) = response else {
            return Ok(None);
        };
        match envelope.data.into_iter().next() {
            Some(tx) => Ok(Some(self.map_tx(tx)?)),
            None => Ok(None),
        }
    }

    fn validate_address(&self, address: &WalletAddress) -> ValidationResult {
        validate_lsk_address(&address.0)
    }
}

fn validate_lsk_address(address: &str) -> ValidationResult {
    // legacy numeric addresses ("1234…L") are recognized but unsupported
    if address.len() > 1
        && address.ends_with('L')
        && address[..address.len() - 1].chars().all(|c| c.is_ascii_digit())
    {
        return ValidationResult::Invalid(InvalidAddressReason::UnsupportedScriptType(
            "legacy address".to_owned(),
        ));
    }

    let Some(payload) = address.strip_prefix("lsk") else {
        return ValidationResult::Invalid(InvalidAddressReason::Malformed);
    };
    if payload.len() != 38 {
        return ValidationResult::Invalid(InvalidAddressReason::Malformed);
    }
    if !payload.chars().all(|c| LISK32_CHARSET.contains(c)) {
        return ValidationResult::Invalid(InvalidAddressReason::Malformed);
    }
    ValidationResult::Valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn adapter() -> LskAdapter {
        LskAdapter::new(LskConfig::mainnet())
    }

    #[test]
    fn accepts_lisk32_addresses() {
        let address = format!("lsk{}", "o".repeat(38));
        assert_eq!(
            adapter().validate_address(&WalletAddress(address)),
            ValidationResult::Valid
        );
    }

    #[test]
    fn legacy_numeric_address_is_unsupported_not_malformed() {
        assert_eq!(
            adapter().validate_address(&WalletAddress("16313739661670634666L".to_owned())),
            ValidationResult::Invalid(InvalidAddressReason::UnsupportedScriptType(
                "legacy address".to_owned()
            ))
        );
    }

    #[test]
    fn wrong_length_or_alphabet_is_malformed() {
        let adapter = adapter();
        for address in [
            "lsktoo-short".to_owned(),
            format!("lsk{}", "o".repeat(39)),
            format!("lsk{}", "1".repeat(38)), // '1' not in lisk32
            "notanaddress".to_owned(),
        ] {
            assert_eq!(
                adapter.validate_address(&WalletAddress(address.clone())),
                ValidationResult::Invalid(InvalidAddressReason::Malformed),
                "{address} should be malformed"
            );
        }
    }

    #[test]
    fn pool_config_carries_min_version() {
        let config = LskConfig::mainnet().pool_config();
        assert_eq!(config.min_version, Some(NodeVersion(3, 0, 0)));
        assert_eq!(config.max_height_lag, 5);
    }

    fn lsk_tx(raw: serde_json::Value) -> LskTx {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn maps_confirmed_transfer() -> anyhow::Result<()> {
        let adapter = adapter();
        let record = adapter.map_tx(lsk_tx(serde_json::json!({
            "id": "tx-1",
            "fee": "143000",
            "sender": {"address": "lsksender"},
            "params": {"amount": "250000000", "recipientAddress": "lskrecipient"},
            "block": {"id": "block-9", "height": 9000, "timestamp": 1_700_000_000u64},
            "confirmations": 12,
            "executionStatus": "successful"
        })))?;

        assert_eq!(record.amount, dec!(2.5));
        assert_eq!(record.fee, Some(dec!(0.00143)));
        assert_eq!(record.confirmations, Some(12));
        assert_eq!(record.block_id.as_deref(), Some("block-9"));
        assert!(!record.in_pool);
        Ok(())
    }

    #[test]
    fn maps_pending_transfer_as_in_pool() -> anyhow::Result<()> {
        let adapter = adapter();
        let record = adapter.map_tx(lsk_tx(serde_json::json!({
            "id": "tx-2",
            "fee": "143000",
            "sender": {"address": "lsksender"},
            "params": {"amount": "1000", "recipientAddress": "lskrecipient"},
            "block": null,
            "confirmations": null,
            "executionStatus": "pending"
        })))?;

        assert!(record.in_pool);
        assert_eq!(record.confirmations, None);
        Ok(())
    }

    #[test]
    fn non_numeric_amount_is_a_parse_error() {
        let adapter = adapter();
        let result = adapter.map_tx(lsk_tx(serde_json::json!({
            "id": "tx-3",
            "fee": "0",
            "sender": {"address": "lsksender"},
            "params": {"amount": "NaN", "recipientAddress": null},
            "block": null,
            "confirmations": null,
            "executionStatus": null
        })));
        assert_eq!(
            result.unwrap_err(),
            WalletServiceError::InternalError(ck_types::InternalErrorKind::Parse)
        );
    }
}
