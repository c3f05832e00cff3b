use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    types::Uuid,
    Postgres, Row,
};

use super::{
    AccountUpdate, EMAIL_TAKEN, DeletedAccount, NewBankAccount, NewEntry, ProfileUpdate, Store, StoreError,
    StoreResult, StoredTransferRequest, TransactionFilter, TransferOutcome, TransferPlan,
};
use crate::models::{BankAccount, Transaction, TransactionStatus, TransactionType, User, CURRENCY};

const USER_COLUMNS: &str = "id, email, full_name, phone, fan_number, region, created_at, updated_at, deleted_at";

const ACCOUNT_COLUMNS: &str = "id, user_id, bank_name, account_name, account_number, account_type, \
     balance, currency, is_primary, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, user_id, account_id, amount, transaction_type, category, \
     description, counterpart_name, counterpart_email, reference_number, status, created_at, updated_at";

// Postgres unique_violation
const UNIQUE_VIOLATION: &str = "23505";
// serialization_failure and deadlock_detected
const RETRYABLE: [&str; 2] = ["40001", "40P01"];

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn is_retryable(code: Option<&str>) -> bool {
    code.is_some_and(|code| RETRYABLE.contains(&code))
}

fn retryable_to_conflict(err: StoreError) -> StoreError {
    match err {
        StoreError::Database(sqlx::Error::Database(db)) if is_retryable(db.code().as_deref()) => {
            StoreError::Conflict("Transfer collided with another transfer, please retry".into())
        }
        other => other,
    }
}

/// Both sides of a transfer are locked in id order, whichever way the money moves.
fn lock_order(first: Uuid, second: Uuid) -> Vec<Uuid> {
    let mut ids = vec![first, second];
    ids.sort();
    ids.dedup();
    ids
}

async fn lock_accounts(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    first: Uuid,
    second: Uuid,
) -> StoreResult<()> {
    sqlx::query("SELECT id FROM bank_accounts WHERE id = ANY($1) ORDER BY id FOR UPDATE")
        .bind(lock_order(first, second))
        .fetch_all(&mut **tx)
        .await?;
    Ok(())
}

async fn promote_in_tx(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    user_id: Uuid,
    account_id: Uuid,
) -> StoreResult<()> {
    // Demote first so the partial unique index on primaries never sees two
    sqlx::query(
        "UPDATE bank_accounts SET is_primary = false, updated_at = NOW()
         WHERE user_id = $1 AND id <> $2 AND is_primary",
    )
    .bind(user_id)
    .bind(account_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query("UPDATE bank_accounts SET is_primary = true, updated_at = NOW() WHERE id = $1 AND user_id = $2")
        .bind(account_id)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn sync_user(&self, user_id: Uuid, email: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (id, email) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET email = EXCLUDED.email, updated_at = NOW()
                 WHERE users.email <> EXCLUDED.email
             RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::Conflict(EMAIL_TAKEN.into())
            } else {
                err.into()
            }
        })?;

        match user {
            Some(user) if user.deleted_at.is_some() => Ok(None),
            Some(user) => Ok(Some(user)),
            // Email unchanged, so the conflicting row was left as is
            None => self.get_user(user_id).await,
        }
    }

    async fn get_user(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn update_profile(
        &self,
        user_id: Uuid,
        update: &ProfileUpdate,
    ) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET
                full_name = COALESCE($2, full_name),
                phone = COALESCE($3, phone),
                fan_number = COALESCE($4, fan_number),
                region = COALESCE($5, region),
                updated_at = NOW()
             WHERE id = $1 AND deleted_at IS NULL
             RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(&update.full_name)
        .bind(&update.phone)
        .bind(&update.fan_number)
        .bind(&update.region)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn soft_delete_user(&self, user_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE users SET deleted_at = NOW(), updated_at = NOW()
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_accounts(&self, user_id: Uuid) -> StoreResult<Vec<BankAccount>> {
        let accounts = sqlx::query_as::<_, BankAccount>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM bank_accounts
             WHERE user_id = $1
             ORDER BY is_primary DESC, created_at ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(accounts)
    }

    async fn get_account(
        &self,
        user_id: Uuid,
        account_id: Uuid,
    ) -> StoreResult<Option<BankAccount>> {
        let account = sqlx::query_as::<_, BankAccount>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM bank_accounts WHERE id = $1 AND user_id = $2"
        ))
        .bind(account_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn account_number_taken(
        &self,
        account_number: &str,
        bank_name: &str,
    ) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM bank_accounts WHERE account_number = $1 AND bank_name = $2) AS taken",
        )
        .bind(account_number)
        .bind(bank_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("taken"))
    }

    async fn insert_account(&self, account: NewBankAccount) -> StoreResult<BankAccount> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO bank_accounts
                (user_id, bank_name, account_name, account_number, account_type, balance, currency, is_primary)
             VALUES ($1, $2, $3, $4, $5, $6, $7, false)
             RETURNING id",
        )
        .bind(account.user_id)
        .bind(&account.bank_name)
        .bind(&account.account_name)
        .bind(&account.account_number)
        .bind(&account.account_type)
        .bind(account.balance)
        .bind(CURRENCY)
        .fetch_one(&mut *tx)
        .await;

        let account_id: Uuid = match inserted {
            Ok(row) => row.get("id"),
            Err(err) if is_unique_violation(&err) => {
                let _ = tx.rollback().await;
                return Err(StoreError::Conflict(
                    "Account number already exists for this bank".into(),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        if account.is_primary {
            promote_in_tx(&mut tx, account.user_id, account_id).await?;
        }

        let row = sqlx::query_as::<_, BankAccount>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM bank_accounts WHERE id = $1"
        ))
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn update_account(
        &self,
        user_id: Uuid,
        account_id: Uuid,
        update: &AccountUpdate,
    ) -> StoreResult<Option<BankAccount>> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT id FROM bank_accounts WHERE id = $1 AND user_id = $2 FOR UPDATE")
            .bind(account_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            let _ = tx.rollback().await;
            return Ok(None);
        }

        if let Some(name) = &update.account_name {
            sqlx::query("UPDATE bank_accounts SET account_name = $1, updated_at = NOW() WHERE id = $2")
                .bind(name)
                .bind(account_id)
                .execute(&mut *tx)
                .await?;
        }

        match update.is_primary {
            Some(true) => promote_in_tx(&mut tx, user_id, account_id).await?,
            Some(false) => {
                sqlx::query("UPDATE bank_accounts SET is_primary = false, updated_at = NOW() WHERE id = $1")
                    .bind(account_id)
                    .execute(&mut *tx)
                    .await?;
            }
            None => {}
        }

        let row = sqlx::query_as::<_, BankAccount>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM bank_accounts WHERE id = $1"
        ))
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(row))
    }

    async fn delete_account(
        &self,
        user_id: Uuid,
        account_id: Uuid,
    ) -> StoreResult<Option<DeletedAccount>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT is_primary FROM bank_accounts WHERE id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(account_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            let _ = tx.rollback().await;
            return Ok(None);
        };
        let was_primary: bool = row.get("is_primary");

        let pending: i64 = sqlx::query(
            "SELECT COUNT(*) AS pending FROM transactions WHERE account_id = $1 AND status = $2",
        )
        .bind(account_id)
        .bind(TransactionStatus::Pending)
        .fetch_one(&mut *tx)
        .await?
        .get("pending");
        if pending > 0 {
            let _ = tx.rollback().await;
            return Err(StoreError::PendingTransactions(pending));
        }

        sqlx::query("DELETE FROM bank_accounts WHERE id = $1")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;

        let mut promoted = None;
        if was_primary {
            promoted = sqlx::query(
                "UPDATE bank_accounts SET is_primary = true, updated_at = NOW()
                 WHERE id = (
                    SELECT id FROM bank_accounts WHERE user_id = $1
                    ORDER BY created_at ASC LIMIT 1
                 )
                 RETURNING id",
            )
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| r.get::<Uuid, _>("id"));
        }

        tx.commit().await?;
        Ok(Some(DeletedAccount {
            id: account_id,
            promoted,
        }))
    }

    async fn post_entry(
        &self,
        user_id: Uuid,
        account_id: Uuid,
        entry: NewEntry,
    ) -> StoreResult<(BankAccount, Transaction)> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query(
            "SELECT balance FROM bank_accounts WHERE id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(account_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(current) = current else {
            let _ = tx.rollback().await;
            return Err(StoreError::NotFound("Bank account".into()));
        };
        let balance: Decimal = current.get("balance");

        if entry.transaction_type == TransactionType::Debit && balance < entry.amount {
            let _ = tx.rollback().await;
            return Err(StoreError::InsufficientBalance {
                available: balance,
                required: entry.amount,
            });
        }

        let delta = match entry.transaction_type {
            TransactionType::Credit => entry.amount,
            TransactionType::Debit => -entry.amount,
        };
        let account = sqlx::query_as::<_, BankAccount>(&format!(
            "UPDATE bank_accounts SET balance = balance + $1, updated_at = NOW()
             WHERE id = $2
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(delta)
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await?;

        let transaction = sqlx::query_as::<_, Transaction>(&format!(
            "INSERT INTO transactions
                (user_id, account_id, amount, transaction_type, category, description, reference_number, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(user_id)
        .bind(account_id)
        .bind(entry.amount)
        .bind(entry.transaction_type)
        .bind(&entry.category)
        .bind(&entry.description)
        .bind(&entry.reference_number)
        .bind(TransactionStatus::Completed)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((account, transaction))
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> StoreResult<Vec<Transaction>> {
        let order = if filter.oldest_first { "ASC" } else { "DESC" };
        let rows = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             WHERE user_id = $1
               AND ($2::uuid IS NULL OR account_id = $2)
               AND ($3::timestamptz IS NULL OR created_at >= $3)
               AND ($4::timestamptz IS NULL OR created_at < $4)
             ORDER BY created_at {order}
             LIMIT $5"
        ))
        .bind(filter.user_id)
        .bind(filter.account_id)
        .bind(filter.from)
        .bind(filter.until)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_transfer_request(
        &self,
        user_id: Uuid,
        request_id: &str,
    ) -> StoreResult<Option<StoredTransferRequest>> {
        let row = sqlx::query(
            "SELECT request_hash, receipt FROM transfer_requests WHERE user_id = $1 AND request_id = $2",
        )
        .bind(user_id)
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let receipt: serde_json::Value = row.get("receipt");
                Ok(Some(StoredTransferRequest {
                    request_hash: row.get("request_hash"),
                    receipt: serde_json::from_value(receipt)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn execute_transfer(&self, plan: &TransferPlan) -> StoreResult<TransferOutcome> {
        self.transfer_in_tx(plan).await.map_err(retryable_to_conflict)
    }
}

impl PgStore {
    async fn transfer_in_tx(&self, plan: &TransferPlan) -> StoreResult<TransferOutcome> {
        let mut tx = self.pool.begin().await?;

        if let Some(key) = &plan.request {
            let existing = sqlx::query(
                "SELECT request_hash, receipt FROM transfer_requests
                 WHERE user_id = $1 AND request_id = $2",
            )
            .bind(plan.sender.id)
            .bind(&key.request_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                let _ = tx.rollback().await;
                let request_hash: String = row.get("request_hash");
                if request_hash != key.request_hash {
                    return Err(StoreError::Conflict(
                        "requestId was already used for a different transfer".into(),
                    ));
                }
                let receipt: serde_json::Value = row.get("receipt");
                return Ok(TransferOutcome::Replayed(serde_json::from_value(receipt)?));
            }
        }

        lock_accounts(&mut tx, plan.sender_account_id, plan.receiver_account_id).await?;

        // Conditional debit: a concurrent transfer can never overdraw
        let debited = sqlx::query(
            "UPDATE bank_accounts SET balance = balance - $1, updated_at = NOW()
             WHERE id = $2 AND user_id = $3 AND balance >= $1
             RETURNING balance",
        )
        .bind(plan.amount)
        .bind(plan.sender_account_id)
        .bind(plan.sender.id)
        .fetch_optional(&mut *tx)
        .await?;

        let sender_balance: Decimal = match debited {
            Some(row) => row.get("balance"),
            None => {
                let available = sqlx::query(
                    "SELECT balance FROM bank_accounts WHERE id = $1 AND user_id = $2",
                )
                .bind(plan.sender_account_id)
                .bind(plan.sender.id)
                .fetch_optional(&mut *tx)
                .await?;
                let _ = tx.rollback().await;
                return match available {
                    Some(row) => Err(StoreError::InsufficientBalance {
                        available: row.get("balance"),
                        required: plan.amount,
                    }),
                    None => Err(StoreError::NotFound("Sender bank account".into())),
                };
            }
        };

        let credited = sqlx::query(
            "UPDATE bank_accounts SET balance = balance + $1, updated_at = NOW()
             WHERE id = $2 AND user_id = $3",
        )
        .bind(plan.amount)
        .bind(plan.receiver_account_id)
        .bind(plan.receiver.id)
        .execute(&mut *tx)
        .await?;
        if credited.rows_affected() != 1 {
            let _ = tx.rollback().await;
            return Err(StoreError::NotFound("Recipient bank account".into()));
        }

        let legs = [
            (
                plan.sender.id,
                plan.sender_account_id,
                TransactionType::Debit,
                plan.debit_description(),
                &plan.receiver,
            ),
            (
                plan.receiver.id,
                plan.receiver_account_id,
                TransactionType::Credit,
                plan.credit_description(),
                &plan.sender,
            ),
        ];
        for (user_id, account_id, transaction_type, description, counterpart) in legs {
            sqlx::query(
                "INSERT INTO transactions
                    (user_id, account_id, amount, transaction_type, category, description,
                     counterpart_name, counterpart_email, reference_number, status, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, 'transfer', $5, $6, $7, $8, $9, $10, $10)",
            )
            .bind(user_id)
            .bind(account_id)
            .bind(plan.amount)
            .bind(transaction_type)
            .bind(description)
            .bind(counterpart.display_name())
            .bind(&counterpart.email)
            .bind(&plan.reference)
            .bind(TransactionStatus::Completed)
            .bind(plan.initiated_at)
            .execute(&mut *tx)
            .await?;
        }

        let receipt = plan.receipt(sender_balance);

        if let Some(key) = &plan.request {
            let stored = sqlx::query(
                "INSERT INTO transfer_requests (user_id, request_id, request_hash, receipt)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(plan.sender.id)
            .bind(&key.request_id)
            .bind(&key.request_hash)
            .bind(serde_json::to_value(&receipt)?)
            .execute(&mut *tx)
            .await;

            // A concurrent request with the same id won the race
            if let Err(err) = stored {
                let _ = tx.rollback().await;
                return Err(if is_unique_violation(&err) {
                    StoreError::Conflict("A transfer with this requestId is already in progress".into())
                } else {
                    err.into()
                });
            }
        }

        tx.commit().await?;
        Ok(TransferOutcome::Completed(receipt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_order_is_the_same_in_both_directions() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(lock_order(a, b), lock_order(b, a));
        let ids = lock_order(a, b);
        assert!(ids[0] < ids[1]);
    }

    #[test]
    fn lock_order_collapses_a_single_account() {
        let a = Uuid::new_v4();
        assert_eq!(lock_order(a, a), vec![a]);
    }

    #[test]
    fn deadlocks_and_serialization_failures_are_retryable() {
        assert!(is_retryable(Some("40P01")));
        assert!(is_retryable(Some("40001")));
        assert!(!is_retryable(Some(UNIQUE_VIOLATION)));
        assert!(!is_retryable(None));
    }

    #[test]
    fn other_errors_pass_through_unchanged() {
        let err = retryable_to_conflict(StoreError::NotFound("Sender bank account".into()));
        assert!(matches!(err, StoreError::NotFound(_)));

        let err = retryable_to_conflict(StoreError::Database(sqlx::Error::RowNotFound));
        assert!(matches!(err, StoreError::Database(_)));
    }
}
