use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChainId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WalletAddress(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TxId(pub String);

/// Local account identifier resolved to a chain address by the address registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OwnerId(pub String);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Error taxonomy ───────────────────────────────────────────────────

/// The closed error set surfaced to collaborators. Transport and
/// chain-specific failures are mapped into this at the adapter boundary;
/// nothing chain-specific crosses into the wallet, cache, or reconciler
/// layers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WalletServiceError {
    #[error("not logged in")]
    NotLogged,
    #[error("wallet not initiated")]
    WalletNotInitiated,
    #[error("account not found")]
    AccountNotFound,
    #[error("not enough money")]
    NotEnoughMoney,
    #[error("network error")]
    NetworkError,
    #[error("no reachable node")]
    NoNetwork,
    #[error("remote service error: {0}")]
    RemoteServiceError(String),
    #[error("internal error: {0}")]
    InternalError(InternalErrorKind),
    #[error("invalid amount")]
    InvalidAmount,
    #[error("amount is below the dust limit")]
    DustAmountError,
    #[error("request cancelled")]
    RequestCancelled,
}

impl WalletServiceError {
    /// Timeouts, connection failures and an empty node pool all count as
    /// network-class for health-check demotion and status reconciliation.
    pub fn is_network_class(&self) -> bool {
        matches!(self, Self::NetworkError | Self::NoNetwork)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalErrorKind {
    Parse,
    UnknownChain,
    KeyDerivation,
    Storage,
}

impl fmt::Display for InternalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Parse => "response parsing failed",
            Self::UnknownChain => "unknown chain",
            Self::KeyDerivation => "key derivation failed",
            Self::Storage => "local storage failure",
        };
        f.write_str(label)
    }
}

// ── Node status ──────────────────────────────────────────────────────

/// Result of a single health probe against one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusInfo {
    pub ping_ms: u64,
    pub height: u64,
    pub version: Option<NodeVersion>,
}

/// Dotted node software version, e.g. `3.0.1`. Missing components parse
/// as zero so `3.0` and `3.0.0` compare equal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeVersion(pub u16, pub u16, pub u16);

impl FromStr for NodeVersion {
    type Err = WalletServiceError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim().trim_start_matches('v');
        let mut parts = trimmed.splitn(3, '.');
        let mut next = || -> Result<u16, WalletServiceError> {
            match parts.next() {
                None | Some("") => Ok(0),
                Some(part) => part
                    .parse::<u16>()
                    .map_err(|_| WalletServiceError::InternalError(InternalErrorKind::Parse)),
            }
        };
        let major = next()?;
        let minor = next()?;
        let patch = next()?;
        Ok(Self(major, minor, patch))
    }
}

impl fmt::Display for NodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

// ── Transactions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    NotInitiated,
    Pending,
    Registered,
    Success,
    Inconsistent(InconsistentReason),
    Failed,
    NoNetwork,
}

impl TransactionStatus {
    /// `Success`, `Failed` and `Inconsistent` are terminal; the rest are
    /// re-evaluated on the next poll.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Inconsistent(_))
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitiated => write!(f, "not checked yet"),
            Self::Pending => write!(f, "pending"),
            Self::Registered => write!(f, "registered by the node"),
            Self::Success => write!(f, "confirmed"),
            Self::Inconsistent(reason) => write!(f, "inconsistent: {reason}"),
            Self::Failed => write!(f, "failed"),
            Self::NoNetwork => write!(f, "no network"),
        }
    }
}

/// Why a confirmed chain transaction failed verification against the
/// locally reported one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InconsistentReason {
    WrongAmount,
    SenderMismatch,
    RecipientMismatch,
}

impl fmt::Display for InconsistentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::WrongAmount => "amount differs from the chain record",
            Self::SenderMismatch => "sender address differs from the chain record",
            Self::RecipientMismatch => "recipient address differs from the chain record",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionRecord {
    pub tx_id: TxId,
    pub sender: WalletAddress,
    pub recipient: WalletAddress,
    pub amount: Decimal,
    pub fee: Option<Decimal>,
    pub confirmations: Option<u64>,
    pub block_id: Option<String>,
    pub is_outgoing: bool,
    pub status: TransactionStatus,
    pub sent_at_epoch_ms: Option<u64>,
    /// Whether the node has accepted the transaction into its pending pool.
    #[serde(default)]
    pub in_pool: bool,
}

impl TransactionRecord {
    pub fn is_confirmed(&self) -> bool {
        self.confirmations.unwrap_or(0) > 0 || self.block_id.is_some()
    }
}

// ── Wallet ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletAccount {
    pub address: WalletAddress,
    pub balance: Decimal,
    /// One-way latch: false until the first successful balance fetch,
    /// reset only by logout or explicit invalidation.
    pub is_balance_initialized: bool,
    pub min_balance: Decimal,
    pub min_amount: Decimal,
    /// Balance raises not yet acknowledged by the host presentation layer.
    pub notification_count: u32,
}

impl WalletAccount {
    pub fn new(address: WalletAddress, min_balance: Decimal, min_amount: Decimal) -> Self {
        Self {
            address,
            balance: Decimal::ZERO,
            is_balance_initialized: false,
            min_balance,
            min_amount,
            notification_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WalletServiceState {
    NotInitiated,
    Updating,
    UpToDate,
    InitiationFailed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationResult {
    Valid,
    Invalid(InvalidAddressReason),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvalidAddressReason {
    Malformed,
    WrongNetwork,
    /// Script or address variant the wallet knowingly does not support,
    /// e.g. taproot outputs on the BTC family.
    UnsupportedScriptType(String),
}

impl fmt::Display for InvalidAddressReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed address"),
            Self::WrongNetwork => write!(f, "address belongs to a different network"),
            Self::UnsupportedScriptType(kind) => write!(f, "unsupported script type: {kind}"),
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────

/// Typed events emitted per wallet instance. The core never depends on
/// who is listening; lagging or dropped receivers are ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum WalletEvent {
    WalletUpdated(WalletAccount),
    BalanceRaised { previous: Decimal, current: Decimal },
    ServiceStateChanged(WalletServiceState),
    ServiceEnabledChanged(bool),
    TransactionFeeUpdated(Decimal),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_version_parses_short_and_prefixed_forms() {
        assert_eq!("3.0.1".parse::<NodeVersion>().unwrap(), NodeVersion(3, 0, 1));
        assert_eq!("v2.1".parse::<NodeVersion>().unwrap(), NodeVersion(2, 1, 0));
        assert_eq!("4".parse::<NodeVersion>().unwrap(), NodeVersion(4, 0, 0));
        assert!("not-a-version".parse::<NodeVersion>().is_err());
    }

    #[test]
    fn node_version_orders_numerically() {
        let older: NodeVersion = "0.9.9".parse().unwrap();
        let newer: NodeVersion = "0.10.0".parse().unwrap();
        assert!(older < newer);
        assert_eq!("1.2".parse::<NodeVersion>().unwrap(), "1.2.0".parse().unwrap());
    }

    #[test]
    fn network_class_errors() {
        assert!(WalletServiceError::NetworkError.is_network_class());
        assert!(WalletServiceError::NoNetwork.is_network_class());
        assert!(!WalletServiceError::NotEnoughMoney.is_network_class());
        assert!(!WalletServiceError::RemoteServiceError("boom".into()).is_network_class());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TransactionStatus::Success.is_final());
        assert!(TransactionStatus::Inconsistent(InconsistentReason::WrongAmount).is_final());
        assert!(!TransactionStatus::Registered.is_final());
        assert!(!TransactionStatus::NoNetwork.is_final());
    }
}
