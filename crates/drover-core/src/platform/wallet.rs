use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PlatformResult;

/// What an on-chain action should do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionIntent {
    /// Destination address
    pub to: String,
    /// Value in wei, decimal string
    #[serde(default)]
    pub value: String,
    /// Hex calldata
    #[serde(default)]
    pub data: String,
    /// Chain id
    pub chain_id: u64,
}

/// An unsigned transaction awaiting a human signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedTransaction {
    /// Unsigned transaction, wallet-specific encoding
    pub unsigned_tx: serde_json::Value,
    /// Where the user signs it
    pub sign_url: String,
}

/// Prepares transactions for signing
///
/// Signing itself requires human or browser confirmation, so on-chain tasks
/// end in `MANUAL_REQUIRED` with the sign URL as the required action.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    /// Build the unsigned transaction for `intent`
    async fn prepare_transaction(
        &self,
        wallet_id: Uuid,
        intent: &TransactionIntent,
    ) -> PlatformResult<PreparedTransaction>;
}

/// A wallet balance snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletBalance {
    /// Wallet
    pub wallet_id: Uuid,
    /// Chain id
    pub chain_id: u64,
    /// Native balance in wei, decimal string
    pub native: String,
    /// When the balance was read
    pub synced_at: DateTime<Utc>,
}

/// Balance synchronisation for wallets
#[async_trait]
pub trait WalletService: Send + Sync {
    /// Refresh and persist the wallet's balances
    async fn sync_balance(&self, wallet_id: Uuid) -> PlatformResult<Vec<WalletBalance>>;
}
