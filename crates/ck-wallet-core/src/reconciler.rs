//! Pure reconciliation of a locally-reported transaction against the
//! chain's view of it. No clocks, no I/O: the caller supplies the time
//! and the chain lookup result, so identical inputs always classify
//! identically.

use ck_types::{InconsistentReason, TransactionRecord, TransactionStatus, WalletAddress};
use rust_decimal::Decimal;

/// Outcome of asking the chain about one tx id.
#[derive(Debug, Clone)]
pub enum ChainLookup {
    Found(TransactionRecord),
    /// The node answered and does not know the id.
    Absent,
    /// The lookup itself failed with a network-class error.
    NetworkFailure,
}

#[derive(Debug, Clone)]
pub struct ReconcileContext {
    pub wallet_address: WalletAddress,
    pub now_epoch_ms: u64,
    /// A record younger than this with no chain counterpart is pending.
    pub new_pending_ms: u64,
    /// A record older than this with no chain counterpart has failed.
    pub old_pending_ms: u64,
}

/// Accepted relative deviation between the locally reported amount and
/// the chain amount, absorbing rounding and fee-display differences.
fn amount_tolerance() -> Decimal {
    Decimal::new(5, 3) // 0.5%
}

pub fn status_for(
    local: &TransactionRecord,
    lookup: &ChainLookup,
    ctx: &ReconcileContext,
) -> TransactionStatus {
    match lookup {
        ChainLookup::NetworkFailure => TransactionStatus::NoNetwork,
        ChainLookup::Absent => {
            // an unknown sent date counts as "just now"
            let sent = local.sent_at_epoch_ms.unwrap_or(ctx.now_epoch_ms);
            let age = ctx.now_epoch_ms.saturating_sub(sent);
            if age <= ctx.new_pending_ms {
                return TransactionStatus::Pending;
            }
            if age > ctx.old_pending_ms {
                return TransactionStatus::Failed;
            }
            TransactionStatus::Pending
        }
        ChainLookup::Found(chain) => {
            if !chain.is_confirmed() {
                return if chain.in_pool {
                    TransactionStatus::Registered
                } else {
                    TransactionStatus::Pending
                };
            }

            if local.is_outgoing {
                if chain.sender != ctx.wallet_address {
                    return TransactionStatus::Inconsistent(InconsistentReason::SenderMismatch);
                }
            } else if chain.recipient != ctx.wallet_address {
                return TransactionStatus::Inconsistent(InconsistentReason::RecipientMismatch);
            }

            let deviation = (local.amount - chain.amount).abs();
            if deviation > chain.amount.abs() * amount_tolerance() {
                return TransactionStatus::Inconsistent(InconsistentReason::WrongAmount);
            }

            TransactionStatus::Success
        }
    }
}
