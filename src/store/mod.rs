//! Persistence seam.
//!
//! Handlers and services only talk to `dyn Store`. `PgStore` is the
//! production implementation over the Supabase Postgres database;
//! `MemoryStore` backs local runs without a database and the test suite.
//! Every method that changes a balance is atomic on its own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Uuid;
use thiserror::Error;

use crate::models::{
    BankAccount, Transaction, TransactionType, TransferDetails, TransferReceipt, User, CURRENCY,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const EMAIL_TAKEN: &str = "This email already belongs to another account";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Insufficient balance")]
    InsufficientBalance { available: Decimal, required: Decimal },

    #[error("Account has {0} pending transaction(s)")]
    PendingTransactions(i64),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct NewBankAccount {
    pub user_id: Uuid,
    pub bank_name: String,
    pub account_name: String,
    pub account_number: String,
    pub account_type: String,
    pub balance: Decimal,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub account_name: Option<String>,
    pub is_primary: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub fan_number: Option<String>,
    pub region: Option<String>,
}

/// Single-leg balance change on one account.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub category: String,
    pub description: Option<String>,
    pub reference_number: String,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub user_id: Uuid,
    pub account_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub oldest_first: bool,
}

#[derive(Debug, Clone)]
pub struct DeletedAccount {
    pub id: Uuid,
    pub promoted: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
    pub request_id: String,
    pub request_hash: String,
}

#[derive(Debug, Clone)]
pub struct StoredTransferRequest {
    pub request_hash: String,
    pub receipt: TransferReceipt,
}

/// A fully validated transfer, ready to be applied.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub reference: String,
    pub sender: User,
    pub sender_account_id: Uuid,
    pub receiver: User,
    pub receiver_account_id: Uuid,
    pub amount: Decimal,
    pub description: Option<String>,
    pub request: Option<RequestKey>,
    pub initiated_at: DateTime<Utc>,
}

impl TransferPlan {
    pub fn receipt(&self, sender_balance: Decimal) -> TransferReceipt {
        TransferReceipt {
            transfer_id: self.reference.clone(),
            details: TransferDetails {
                amount: self.amount,
                currency: CURRENCY.to_string(),
                reference: self.reference.clone(),
                sender_account_id: self.sender_account_id,
                sender_balance,
                receiver_account_id: self.receiver_account_id,
                receiver_name: self.receiver.display_name().to_string(),
                receiver_email: self.receiver.email.clone(),
                description: self.description.clone(),
                completed_at: self.initiated_at,
            },
        }
    }

    pub fn debit_description(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("Transfer to {}", self.receiver.display_name()))
    }

    pub fn credit_description(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("Transfer from {}", self.sender.display_name()))
    }
}

#[derive(Debug, Clone)]
pub enum TransferOutcome {
    Completed(TransferReceipt),
    /// The request id was already applied with the same payload.
    Replayed(TransferReceipt),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    // Users

    /// Creates the profile row for a freshly authenticated user, or refreshes its
    /// email. Returns `None` when the user was soft-deleted.
    async fn sync_user(&self, user_id: Uuid, email: &str) -> StoreResult<Option<User>>;

    /// Soft-deleted users are never returned.
    async fn get_user(&self, user_id: Uuid) -> StoreResult<Option<User>>;

    async fn update_profile(
        &self,
        user_id: Uuid,
        update: &ProfileUpdate,
    ) -> StoreResult<Option<User>>;

    async fn soft_delete_user(&self, user_id: Uuid) -> StoreResult<bool>;

    // Bank accounts

    /// Primary first, then oldest first.
    async fn list_accounts(&self, user_id: Uuid) -> StoreResult<Vec<BankAccount>>;

    async fn get_account(&self, user_id: Uuid, account_id: Uuid)
        -> StoreResult<Option<BankAccount>>;

    async fn account_number_taken(&self, account_number: &str, bank_name: &str)
        -> StoreResult<bool>;

    /// Demotes the owner's other accounts when `is_primary` is set.
    async fn insert_account(&self, account: NewBankAccount) -> StoreResult<BankAccount>;

    async fn update_account(
        &self,
        user_id: Uuid,
        account_id: Uuid,
        update: &AccountUpdate,
    ) -> StoreResult<Option<BankAccount>>;

    /// Fails with `PendingTransactions` when the account still has pending rows.
    async fn delete_account(
        &self,
        user_id: Uuid,
        account_id: Uuid,
    ) -> StoreResult<Option<DeletedAccount>>;

    async fn post_entry(
        &self,
        user_id: Uuid,
        account_id: Uuid,
        entry: NewEntry,
    ) -> StoreResult<(BankAccount, Transaction)>;

    // Transactions

    async fn list_transactions(&self, filter: &TransactionFilter)
        -> StoreResult<Vec<Transaction>>;

    async fn find_transfer_request(
        &self,
        user_id: Uuid,
        request_id: &str,
    ) -> StoreResult<Option<StoredTransferRequest>>;

    /// Debit, credit, both legs and the request record, all or nothing.
    async fn execute_transfer(&self, plan: &TransferPlan) -> StoreResult<TransferOutcome>;
}
