use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Uuid;

use super::{
    AccountUpdate, DeletedAccount, EMAIL_TAKEN, NewBankAccount, NewEntry, ProfileUpdate, Store, StoreError,
    StoreResult, StoredTransferRequest, TransactionFilter, TransferOutcome, TransferPlan,
};
use crate::models::{
    BankAccount, Transaction, TransactionStatus, TransactionType, User, CURRENCY,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    // Insertion order doubles as creation order
    accounts: Vec<BankAccount>,
    transactions: Vec<Transaction>,
    transfer_requests: HashMap<(Uuid, String), StoredTransferRequest>,
}

impl Tables {
    fn account_mut(&mut self, user_id: Uuid, account_id: Uuid) -> Option<&mut BankAccount> {
        self.accounts
            .iter_mut()
            .find(|a| a.id == account_id && a.user_id == user_id)
    }

    fn promote(&mut self, user_id: Uuid, account_id: Uuid) {
        let now = Utc::now();
        for account in self.accounts.iter_mut().filter(|a| a.user_id == user_id) {
            let primary = account.id == account_id;
            if account.is_primary != primary {
                account.is_primary = primary;
                account.updated_at = now;
            }
        }
    }
}

/// In-process store with the same semantics as `PgStore`.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a user, standing in for the auth provider's signup hook.
    pub fn add_user(&self, email: &str, full_name: Option<&str>) -> User {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            full_name: full_name.map(str::to_string),
            phone: None,
            fan_number: None,
            region: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.lock().users.insert(user.id, user.clone());
        user
    }

    /// Appends a raw transaction row without touching balances.
    pub fn add_transaction(&self, transaction: Transaction) {
        self.lock().transactions.push(transaction);
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.lock().transactions.clone()
    }

    pub fn account(&self, account_id: Uuid) -> Option<BankAccount> {
        self.lock()
            .accounts
            .iter()
            .find(|a| a.id == account_id)
            .cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn sync_user(&self, user_id: Uuid, email: &str) -> StoreResult<Option<User>> {
        let now = Utc::now();
        let mut tables = self.lock();
        if tables.users.values().any(|u| u.id != user_id && u.email == email) {
            return Err(StoreError::Conflict(EMAIL_TAKEN.into()));
        }
        let user = tables.users.entry(user_id).or_insert_with(|| User {
            id: user_id,
            email: email.to_string(),
            full_name: None,
            phone: None,
            fan_number: None,
            region: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        });
        if user.deleted_at.is_some() {
            return Ok(None);
        }
        if user.email != email {
            user.email = email.to_string();
            user.updated_at = now;
        }
        Ok(Some(user.clone()))
    }

    async fn get_user(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        Ok(self
            .lock()
            .users
            .get(&user_id)
            .filter(|u| u.deleted_at.is_none())
            .cloned())
    }

    async fn update_profile(
        &self,
        user_id: Uuid,
        update: &ProfileUpdate,
    ) -> StoreResult<Option<User>> {
        let mut tables = self.lock();
        let Some(user) = tables
            .users
            .get_mut(&user_id)
            .filter(|u| u.deleted_at.is_none())
        else {
            return Ok(None);
        };

        if let Some(full_name) = &update.full_name {
            user.full_name = Some(full_name.clone());
        }
        if let Some(phone) = &update.phone {
            user.phone = Some(phone.clone());
        }
        if let Some(fan_number) = &update.fan_number {
            user.fan_number = Some(fan_number.clone());
        }
        if let Some(region) = &update.region {
            user.region = Some(region.clone());
        }
        user.updated_at = Utc::now();
        Ok(Some(user.clone()))
    }

    async fn soft_delete_user(&self, user_id: Uuid) -> StoreResult<bool> {
        let mut tables = self.lock();
        match tables
            .users
            .get_mut(&user_id)
            .filter(|u| u.deleted_at.is_none())
        {
            Some(user) => {
                let now = Utc::now();
                user.deleted_at = Some(now);
                user.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_accounts(&self, user_id: Uuid) -> StoreResult<Vec<BankAccount>> {
        let mut accounts: Vec<BankAccount> = self
            .lock()
            .accounts
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| !a.is_primary);
        Ok(accounts)
    }

    async fn get_account(
        &self,
        user_id: Uuid,
        account_id: Uuid,
    ) -> StoreResult<Option<BankAccount>> {
        Ok(self
            .lock()
            .accounts
            .iter()
            .find(|a| a.id == account_id && a.user_id == user_id)
            .cloned())
    }

    async fn account_number_taken(
        &self,
        account_number: &str,
        bank_name: &str,
    ) -> StoreResult<bool> {
        Ok(self
            .lock()
            .accounts
            .iter()
            .any(|a| a.account_number == account_number && a.bank_name == bank_name))
    }

    async fn insert_account(&self, account: NewBankAccount) -> StoreResult<BankAccount> {
        let mut tables = self.lock();
        if tables.accounts.iter().any(|a| {
            a.account_number == account.account_number && a.bank_name == account.bank_name
        }) {
            return Err(StoreError::Conflict(
                "Account number already exists for this bank".into(),
            ));
        }

        let now = Utc::now();
        let row = BankAccount {
            id: Uuid::new_v4(),
            user_id: account.user_id,
            bank_name: account.bank_name,
            account_name: account.account_name,
            account_number: account.account_number,
            account_type: account.account_type,
            balance: account.balance,
            currency: CURRENCY.to_string(),
            is_primary: false,
            created_at: now,
            updated_at: now,
        };
        tables.accounts.push(row.clone());

        if account.is_primary {
            tables.promote(row.user_id, row.id);
        }
        Ok(tables
            .accounts
            .iter()
            .find(|a| a.id == row.id)
            .cloned()
            .unwrap_or(row))
    }

    async fn update_account(
        &self,
        user_id: Uuid,
        account_id: Uuid,
        update: &AccountUpdate,
    ) -> StoreResult<Option<BankAccount>> {
        let mut tables = self.lock();
        let Some(account) = tables.account_mut(user_id, account_id) else {
            return Ok(None);
        };

        if let Some(name) = &update.account_name {
            account.account_name = name.clone();
        }
        if update.is_primary == Some(false) {
            account.is_primary = false;
        }
        account.updated_at = Utc::now();

        if update.is_primary == Some(true) {
            tables.promote(user_id, account_id);
        }
        Ok(tables.account_mut(user_id, account_id).map(|a| a.clone()))
    }

    async fn delete_account(
        &self,
        user_id: Uuid,
        account_id: Uuid,
    ) -> StoreResult<Option<DeletedAccount>> {
        let mut tables = self.lock();
        let Some(index) = tables
            .accounts
            .iter()
            .position(|a| a.id == account_id && a.user_id == user_id)
        else {
            return Ok(None);
        };

        let pending = tables
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id && t.status == TransactionStatus::Pending)
            .count() as i64;
        if pending > 0 {
            return Err(StoreError::PendingTransactions(pending));
        }

        let removed = tables.accounts.remove(index);
        tables.transactions.retain(|t| t.account_id != account_id);

        let mut promoted = None;
        if removed.is_primary {
            if let Some(next) = tables.accounts.iter_mut().find(|a| a.user_id == user_id) {
                next.is_primary = true;
                next.updated_at = Utc::now();
                promoted = Some(next.id);
            }
        }

        Ok(Some(DeletedAccount {
            id: removed.id,
            promoted,
        }))
    }

    async fn post_entry(
        &self,
        user_id: Uuid,
        account_id: Uuid,
        entry: NewEntry,
    ) -> StoreResult<(BankAccount, Transaction)> {
        let mut tables = self.lock();
        let account = tables
            .account_mut(user_id, account_id)
            .ok_or_else(|| StoreError::NotFound("Bank account".into()))?;

        match entry.transaction_type {
            TransactionType::Credit => account.balance += entry.amount,
            TransactionType::Debit => {
                if account.balance < entry.amount {
                    return Err(StoreError::InsufficientBalance {
                        available: account.balance,
                        required: entry.amount,
                    });
                }
                account.balance -= entry.amount;
            }
        }
        let now = Utc::now();
        account.updated_at = now;
        let account = account.clone();

        let transaction = Transaction {
            id: Uuid::new_v4(),
            user_id,
            account_id,
            amount: entry.amount,
            transaction_type: entry.transaction_type,
            category: entry.category,
            description: entry.description,
            counterpart_name: None,
            counterpart_email: None,
            reference_number: entry.reference_number,
            status: TransactionStatus::Completed,
            created_at: now,
            updated_at: now,
        };
        tables.transactions.push(transaction.clone());
        Ok((account, transaction))
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> StoreResult<Vec<Transaction>> {
        let mut rows: Vec<Transaction> = self
            .lock()
            .transactions
            .iter()
            .filter(|t| t.user_id == filter.user_id)
            .filter(|t| filter.account_id.map_or(true, |id| t.account_id == id))
            .filter(|t| filter.from.map_or(true, |from| t.created_at >= from))
            .filter(|t| filter.until.map_or(true, |until| t.created_at < until))
            .cloned()
            .collect();

        if filter.oldest_first {
            rows.sort_by_key(|t| t.created_at);
        } else {
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
        if let Some(limit) = filter.limit {
            rows.truncate(limit.max(0) as usize);
        }
        Ok(rows)
    }

    async fn find_transfer_request(
        &self,
        user_id: Uuid,
        request_id: &str,
    ) -> StoreResult<Option<StoredTransferRequest>> {
        Ok(self
            .lock()
            .transfer_requests
            .get(&(user_id, request_id.to_string()))
            .cloned())
    }

    async fn execute_transfer(&self, plan: &TransferPlan) -> StoreResult<TransferOutcome> {
        let mut tables = self.lock();
        let sender_id = plan.sender.id;
        let receiver_id = plan.receiver.id;

        if let Some(key) = &plan.request {
            if let Some(stored) = tables
                .transfer_requests
                .get(&(sender_id, key.request_id.clone()))
            {
                if stored.request_hash != key.request_hash {
                    return Err(StoreError::Conflict(
                        "requestId was already used for a different transfer".into(),
                    ));
                }
                return Ok(TransferOutcome::Replayed(stored.receipt.clone()));
            }
        }

        let sender_index = tables
            .accounts
            .iter()
            .position(|a| a.id == plan.sender_account_id && a.user_id == sender_id)
            .ok_or_else(|| StoreError::NotFound("Sender bank account".into()))?;
        let receiver_index = tables
            .accounts
            .iter()
            .position(|a| a.id == plan.receiver_account_id && a.user_id == receiver_id)
            .ok_or_else(|| StoreError::NotFound("Recipient bank account".into()))?;

        let available = tables.accounts[sender_index].balance;
        if available < plan.amount {
            return Err(StoreError::InsufficientBalance {
                available,
                required: plan.amount,
            });
        }

        let now = Utc::now();
        let sender_balance = available - plan.amount;
        {
            let sender = &mut tables.accounts[sender_index];
            sender.balance = sender_balance;
            sender.updated_at = now;
        }
        {
            let receiver = &mut tables.accounts[receiver_index];
            receiver.balance += plan.amount;
            receiver.updated_at = now;
        }

        let leg = |user_id: Uuid,
                   account_id: Uuid,
                   transaction_type: TransactionType,
                   description: String,
                   counterpart: &User| Transaction {
            id: Uuid::new_v4(),
            user_id,
            account_id,
            amount: plan.amount,
            transaction_type,
            category: "transfer".to_string(),
            description: Some(description),
            counterpart_name: Some(counterpart.display_name().to_string()),
            counterpart_email: Some(counterpart.email.clone()),
            reference_number: plan.reference.clone(),
            status: TransactionStatus::Completed,
            created_at: now,
            updated_at: now,
        };
        let debit = leg(
            sender_id,
            plan.sender_account_id,
            TransactionType::Debit,
            plan.debit_description(),
            &plan.receiver,
        );
        let credit = leg(
            receiver_id,
            plan.receiver_account_id,
            TransactionType::Credit,
            plan.credit_description(),
            &plan.sender,
        );
        tables.transactions.push(debit);
        tables.transactions.push(credit);

        let receipt = plan.receipt(sender_balance);
        if let Some(key) = &plan.request {
            tables.transfer_requests.insert(
                (sender_id, key.request_id.clone()),
                StoredTransferRequest {
                    request_hash: key.request_hash.clone(),
                    receipt: receipt.clone(),
                },
            );
        }
        Ok(TransferOutcome::Completed(receipt))
    }
}
