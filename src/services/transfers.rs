//! User-to-user transfers.
//!
//! Validation happens here in a fixed order so clients get the most specific
//! error first; the store then applies the debit, the credit and both
//! transaction legs as one atomic unit. The debit is conditional on the
//! balance at write time, so the read-side balance check below is only the
//! friendly early answer, not the guard.

use chrono::Utc;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use sqlx::types::Uuid;

use crate::error::AppError;
use crate::models::{TransferReceipt, TransferResponse, UserTransferRequest};
use crate::services::reference::generate_reference;
use crate::services::validation::{
    optional_text, parse_uuid, required, validate_amount, ValidationError,
};
use crate::store::{RequestKey, Store, TransferOutcome, TransferPlan};

pub const MAX_TRANSFER_AMOUNT: Decimal = Decimal::from_parts(100_000, 0, 0, false, 0);

const MAX_REQUEST_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTransfer {
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub sender_account_id: Uuid,
    pub amount: Decimal,
    pub description: Option<String>,
    pub request_id: Option<String>,
}

impl ParsedTransfer {
    /// Fingerprint of everything that decides where money goes.
    pub fn request_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sender_id.as_bytes());
        hasher.update(self.receiver_id.as_bytes());
        hasher.update(self.sender_account_id.as_bytes());
        hasher.update(self.amount.normalize().to_string().as_bytes());
        hasher.update(self.description.as_deref().unwrap_or("").as_bytes());
        hex::encode(hasher.finalize())
    }

    fn request_key(&self) -> Option<RequestKey> {
        self.request_id.as_ref().map(|request_id| RequestKey {
            request_id: request_id.clone(),
            request_hash: self.request_hash(),
        })
    }
}

pub fn parse_transfer(req: &UserTransferRequest) -> Result<ParsedTransfer, ValidationError> {
    // Presence of every required field is checked before any format
    let sender_raw = required(&req.sender_id, "senderId")?;
    let receiver_raw = required(&req.receiver_id, "receiverId")?;
    let account_raw = required(&req.sender_bank_id, "senderBankId")?;
    let amount = req.amount.ok_or(ValidationError::Missing("amount"))?;

    let sender_id = parse_uuid(sender_raw, "senderId")?;
    let receiver_id = parse_uuid(receiver_raw, "receiverId")?;
    let sender_account_id = parse_uuid(account_raw, "senderBankId")?;

    let amount = validate_amount(amount, MAX_TRANSFER_AMOUNT)?;

    if sender_id == receiver_id {
        return Err(ValidationError::Invalid {
            field: "receiverId",
            reason: "cannot transfer to yourself",
        });
    }

    let request_id = match req.request_id.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(id) if id.len() > MAX_REQUEST_ID_LEN => {
            return Err(ValidationError::Invalid {
                field: "requestId",
                reason: "too long",
            })
        }
        Some(id) => Some(id.to_string()),
    };

    Ok(ParsedTransfer {
        sender_id,
        receiver_id,
        sender_account_id,
        amount,
        description: optional_text(&req.description, "description", 255)?,
        request_id,
    })
}

fn respond(receipt: TransferReceipt, replayed: bool) -> TransferResponse {
    let message = format!(
        "Successfully transferred {} {} to {}",
        receipt.details.amount, receipt.details.currency, receipt.details.receiver_name
    );
    TransferResponse {
        success: true,
        transfer_id: receipt.transfer_id,
        message,
        replayed,
        details: receipt.details,
    }
}

pub async fn transfer(
    store: &dyn Store,
    caller_id: Uuid,
    req: &UserTransferRequest,
) -> Result<TransferResponse, AppError> {
    let parsed = parse_transfer(req)?;

    if parsed.sender_id != caller_id {
        return Err(AppError::Forbidden(
            "You can only send money from your own account".into(),
        ));
    }

    // Replay before any reads so a retried request answers even after balances moved
    let request = parsed.request_key();
    if let Some(key) = &request {
        if let Some(stored) = store
            .find_transfer_request(parsed.sender_id, &key.request_id)
            .await?
        {
            if stored.request_hash != key.request_hash {
                return Err(AppError::Conflict(
                    "requestId was already used for a different transfer".into(),
                ));
            }
            tracing::info!(transfer_id = %stored.receipt.transfer_id, "transfer replayed");
            return Ok(respond(stored.receipt, true));
        }
    }

    let sender = store
        .get_user(parsed.sender_id)
        .await?
        .ok_or_else(|| AppError::not_found("Sender not found"))?;

    let source = store
        .get_account(parsed.sender_id, parsed.sender_account_id)
        .await?
        .ok_or_else(|| AppError::not_found("Sender bank account not found"))?;

    if source.balance < parsed.amount {
        return Err(AppError::InsufficientBalance {
            available: source.balance,
            required: parsed.amount,
        });
    }

    let receiver = store
        .get_user(parsed.receiver_id)
        .await?
        .ok_or_else(|| AppError::not_found("Recipient not found"))?;

    // Primary first, then oldest
    let destination = store
        .list_accounts(receiver.id)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::RecipientHasNoAccount {
            name: receiver.full_name.clone(),
            email: receiver.email.clone(),
        })?;

    let initiated_at = Utc::now();
    let plan = TransferPlan {
        reference: generate_reference("TRF", initiated_at),
        sender,
        sender_account_id: source.id,
        receiver,
        receiver_account_id: destination.id,
        amount: parsed.amount,
        description: parsed.description,
        request,
        initiated_at,
    };

    match store.execute_transfer(&plan).await? {
        TransferOutcome::Completed(receipt) => {
            tracing::info!(
                transfer_id = %receipt.transfer_id,
                sender_id = %plan.sender.id,
                receiver_id = %plan.receiver.id,
                amount = %plan.amount,
                "transfer completed"
            );
            Ok(respond(receipt, false))
        }
        TransferOutcome::Replayed(receipt) => {
            tracing::info!(transfer_id = %receipt.transfer_id, "transfer replayed");
            Ok(respond(receipt, true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BankAccount, TransactionType, User};
    use crate::store::{AccountUpdate, MemoryStore, NewBankAccount};

    struct Fixture {
        store: MemoryStore,
        sender: User,
        sender_account: BankAccount,
        receiver: User,
        receiver_account: BankAccount,
    }

    async fn account(store: &MemoryStore, user: &User, number: &str, balance: i64, primary: bool) -> BankAccount {
        store
            .insert_account(NewBankAccount {
                user_id: user.id,
                bank_name: "Commercial Bank of Ethiopia".into(),
                account_name: "Main".into(),
                account_number: number.into(),
                account_type: "savings".into(),
                balance: Decimal::from(balance),
                is_primary: primary,
            })
            .await
            .unwrap()
    }

    async fn fixture(sender_balance: i64) -> Fixture {
        let store = MemoryStore::new();
        let sender = store.add_user("abebe@example.com", Some("Abebe Kebede"));
        let receiver = store.add_user("almaz@example.com", Some("Almaz Tesfaye"));
        let sender_account = account(&store, &sender, "CBE1000000001", sender_balance, true).await;
        let receiver_account = account(&store, &receiver, "CBE2000000001", 40, true).await;
        Fixture {
            store,
            sender,
            sender_account,
            receiver,
            receiver_account,
        }
    }

    fn request(f: &Fixture, amount: Decimal) -> UserTransferRequest {
        UserTransferRequest {
            sender_id: Some(f.sender.id.to_string()),
            receiver_id: Some(f.receiver.id.to_string()),
            sender_bank_id: Some(f.sender_account.id.to_string()),
            amount: Some(amount),
            description: None,
            request_id: None,
        }
    }

    fn assert_untouched(f: &Fixture, sender_balance: i64) {
        assert_eq!(
            f.store.account(f.sender_account.id).unwrap().balance,
            Decimal::from(sender_balance)
        );
        assert_eq!(
            f.store.account(f.receiver_account.id).unwrap().balance,
            Decimal::from(40)
        );
        assert!(f.store.transactions().is_empty());
    }

    #[tokio::test]
    async fn transfer_moves_exact_amount_and_writes_two_legs() {
        let f = fixture(1000).await;
        let resp = transfer(&f.store, f.sender.id, &request(&f, Decimal::from(250)))
            .await
            .unwrap();

        assert!(resp.success);
        assert!(!resp.replayed);
        assert_eq!(resp.details.amount, Decimal::from(250));
        assert_eq!(resp.details.sender_balance, Decimal::from(750));
        assert_eq!(resp.details.receiver_account_id, f.receiver_account.id);
        assert_eq!(resp.details.receiver_name, "Almaz Tesfaye");

        assert_eq!(
            f.store.account(f.sender_account.id).unwrap().balance,
            Decimal::from(750)
        );
        assert_eq!(
            f.store.account(f.receiver_account.id).unwrap().balance,
            Decimal::from(290)
        );

        let legs = f.store.transactions();
        assert_eq!(legs.len(), 2);
        assert!(legs.iter().all(|t| t.reference_number == resp.transfer_id));
        let debit = legs
            .iter()
            .find(|t| t.transaction_type == TransactionType::Debit)
            .unwrap();
        let credit = legs
            .iter()
            .find(|t| t.transaction_type == TransactionType::Credit)
            .unwrap();
        assert_eq!(debit.user_id, f.sender.id);
        assert_eq!(debit.counterpart_email.as_deref(), Some("almaz@example.com"));
        assert_eq!(credit.user_id, f.receiver.id);
        assert_eq!(credit.description.as_deref(), Some("Transfer from Abebe Kebede"));
    }

    #[tokio::test]
    async fn insufficient_balance_is_rejected_without_mutation() {
        let f = fixture(100).await;
        let err = transfer(&f.store, f.sender.id, &request(&f, Decimal::from(150)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InsufficientBalance { .. }));
        assert_eq!(err.body()["error"], "Insufficient balance");
        assert_untouched(&f, 100);
    }

    #[tokio::test]
    async fn amount_bounds_are_enforced() {
        let f = fixture(1000).await;
        for amount in [Decimal::ZERO, Decimal::from(-10), Decimal::from(100_001)] {
            let err = transfer(&f.store, f.sender.id, &request(&f, amount))
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "amount {amount}");
        }
        assert_untouched(&f, 1000);
    }

    #[tokio::test]
    async fn self_transfer_is_rejected() {
        let f = fixture(1000).await;
        let mut req = request(&f, Decimal::from(10));
        req.receiver_id = req.sender_id.clone();
        let err = transfer(&f.store, f.sender.id, &req).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(msg) if msg.contains("yourself")));
        assert_untouched(&f, 1000);
    }

    #[tokio::test]
    async fn recipient_without_account_gets_distinguished_error() {
        let f = fixture(1000).await;
        let stranger = f.store.add_user("newcomer@example.com", Some("Hiwot"));
        let mut req = request(&f, Decimal::from(10));
        req.receiver_id = Some(stranger.id.to_string());

        let err = transfer(&f.store, f.sender.id, &req).await.unwrap_err();
        assert_eq!(err.code(), "RECIPIENT_NO_ACCOUNT");
        assert_eq!(err.body()["recipient"]["name"], "Hiwot");
        assert_untouched(&f, 1000);
    }

    #[tokio::test]
    async fn source_account_must_belong_to_sender() {
        let f = fixture(1000).await;
        let mut req = request(&f, Decimal::from(10));
        req.sender_bank_id = Some(f.receiver_account.id.to_string());
        let err = transfer(&f.store, f.sender.id, &req).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_untouched(&f, 1000);
    }

    #[tokio::test]
    async fn caller_must_be_sender() {
        let f = fixture(1000).await;
        let err = transfer(&f.store, f.receiver.id, &request(&f, Decimal::from(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert_untouched(&f, 1000);
    }

    #[tokio::test]
    async fn credit_goes_to_primary_account() {
        let f = fixture(1000).await;
        let second = account(&f.store, &f.receiver, "CBE2000000002", 0, true).await;
        let resp = transfer(&f.store, f.sender.id, &request(&f, Decimal::from(5)))
            .await
            .unwrap();
        assert_eq!(resp.details.receiver_account_id, second.id);
        assert_eq!(f.store.account(second.id).unwrap().balance, Decimal::from(5));
    }

    #[tokio::test]
    async fn credit_goes_to_oldest_account_without_a_primary() {
        let f = fixture(1000).await;
        let demote = AccountUpdate {
            account_name: None,
            is_primary: Some(false),
        };
        f.store
            .update_account(f.receiver.id, f.receiver_account.id, &demote)
            .await
            .unwrap()
            .unwrap();
        let newer = account(&f.store, &f.receiver, "CBE2000000002", 0, false).await;

        let resp = transfer(&f.store, f.sender.id, &request(&f, Decimal::from(5)))
            .await
            .unwrap();

        assert_eq!(resp.details.receiver_account_id, f.receiver_account.id);
        let oldest = f.store.account(f.receiver_account.id).unwrap();
        let newer = f.store.account(newer.id).unwrap();
        assert_eq!(oldest.balance, Decimal::from(45));
        assert_eq!(newer.balance, Decimal::ZERO);
        assert!(!oldest.is_primary);
        assert!(!newer.is_primary);
    }

    #[tokio::test]
    async fn request_id_replays_instead_of_paying_twice() {
        let f = fixture(1000).await;
        let mut req = request(&f, Decimal::from(100));
        req.request_id = Some("c0ffee-1".into());

        let first = transfer(&f.store, f.sender.id, &req).await.unwrap();
        let second = transfer(&f.store, f.sender.id, &req).await.unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.transfer_id, second.transfer_id);
        assert_eq!(
            f.store.account(f.sender_account.id).unwrap().balance,
            Decimal::from(900)
        );
        assert_eq!(f.store.transactions().len(), 2);

        req.amount = Some(Decimal::from(200));
        let err = transfer(&f.store, f.sender.id, &req).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn missing_fields_are_reported_first() {
        let req = UserTransferRequest {
            sender_id: Some("not-a-uuid".into()),
            receiver_id: None,
            sender_bank_id: None,
            amount: None,
            description: None,
            request_id: None,
        };
        assert_eq!(
            parse_transfer(&req),
            Err(ValidationError::Missing("receiverId"))
        );
    }

    #[test]
    fn request_hash_depends_on_amount() {
        let base = ParsedTransfer {
            sender_id: Uuid::new_v4(),
            receiver_id: Uuid::new_v4(),
            sender_account_id: Uuid::new_v4(),
            amount: Decimal::new(2500, 2),
            description: None,
            request_id: Some("r".into()),
        };
        let same = ParsedTransfer {
            amount: Decimal::from(25),
            ..base.clone()
        };
        let other = ParsedTransfer {
            amount: Decimal::from(26),
            ..base.clone()
        };
        assert_eq!(base.request_hash(), same.request_hash());
        assert_ne!(base.request_hash(), other.request_hash());
    }
}
