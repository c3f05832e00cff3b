use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use sqlx::types::Uuid;

use crate::error::AppError;
use crate::models::{
    AccountEntryRequest, BankAccount, CreateAccountRequest, Transaction, TransactionType,
    UpdateAccountRequest,
};
use crate::services::reference::generate_reference;
use crate::services::transfers::MAX_TRANSFER_AMOUNT;
use crate::services::validation::{
    bounded_text, optional_text, required, validate_amount, AccountNumber, ValidationError,
};
use crate::store::{AccountUpdate, DeletedAccount, NewBankAccount, NewEntry, Store};

pub const ACCOUNT_TYPES: [&str; 4] = ["savings", "checking", "current", "business"];

const MAX_NUMBER_ATTEMPTS: usize = 5;

/// Largest value a `NUMERIC(15,2)` balance column holds.
const MAX_BALANCE: Decimal = Decimal::from_parts(2_764_472_319, 232_830, 0, false, 2);
const GENERATED_DIGITS: usize = AccountNumber::MAX_DIGITS;

const BANK_CODES: &[(&str, &str)] = &[
    ("commercial bank of ethiopia", "CBE"),
    ("awash bank", "AWB"),
    ("dashen bank", "DSH"),
    ("bank of abyssinia", "BOA"),
    ("wegagen bank", "WGB"),
    ("hibret bank", "HBT"),
    ("nib international bank", "NIB"),
    ("cooperative bank of oromia", "CBO"),
    ("zemen bank", "ZMN"),
    ("bunna bank", "BUN"),
    ("berhan bank", "BRH"),
    ("abay bank", "ABY"),
    ("enat bank", "ENT"),
    ("oromia bank", "ORB"),
    ("lion international bank", "LIB"),
    ("addis international bank", "AIB"),
    ("development bank of ethiopia", "DBE"),
    ("nile pay", "NLP"),
];

/// Known bank code, else the initials of the bank name padded with `X`.
pub fn bank_code(bank_name: &str) -> String {
    let normalized = bank_name.trim().to_lowercase();
    if let Some((_, code)) = BANK_CODES.iter().find(|(name, _)| *name == normalized) {
        return code.to_string();
    }

    let mut code: String = bank_name
        .split_whitespace()
        .filter_map(|word| word.chars().find(|c| c.is_ascii_alphabetic()))
        .map(|c| c.to_ascii_uppercase())
        .take(3)
        .collect();
    while code.len() < 3 {
        code.push('X');
    }
    code
}

pub fn generate_account_number<R: Rng>(
    bank_name: &str,
    rng: &mut R,
) -> Result<AccountNumber, ValidationError> {
    let mut number = bank_code(bank_name);
    number.push(char::from(b'0' + rng.gen_range(1..=9u8)));
    for _ in 1..GENERATED_DIGITS {
        number.push(char::from(b'0' + rng.gen_range(0..=9u8)));
    }
    AccountNumber::parse(&number)
}

#[derive(Debug)]
struct ParsedCreate {
    bank_name: String,
    account_name: String,
    account_type: String,
    account_number: Option<AccountNumber>,
    balance: Decimal,
    is_primary: bool,
}

fn parse_create(req: &CreateAccountRequest) -> Result<ParsedCreate, ValidationError> {
    let bank_name = bounded_text(required(&req.bank_name, "bankName")?, "bankName", 100)?;
    let account_name = bounded_text(required(&req.account_name, "accountName")?, "accountName", 100)?;

    let account_type = required(&req.account_type, "accountType")?.to_lowercase();
    if !ACCOUNT_TYPES.contains(&account_type.as_str()) {
        return Err(ValidationError::InvalidFormat {
            field: "accountType",
            value: account_type,
            expected: "savings, checking, current or business",
        });
    }

    let account_number = match req.account_number.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(AccountNumber::parse(raw)?),
    };

    let balance = match req.balance {
        None => Decimal::ZERO,
        Some(b) if b < Decimal::ZERO => {
            return Err(ValidationError::Invalid {
                field: "balance",
                reason: "must not be negative",
            })
        }
        Some(b) if b > MAX_BALANCE => {
            return Err(ValidationError::Invalid {
                field: "balance",
                reason: "exceeds the maximum account balance",
            })
        }
        Some(b) if b.normalize().scale() > 2 => {
            return Err(ValidationError::Invalid {
                field: "balance",
                reason: "more than two decimal places",
            })
        }
        Some(b) => b.round_dp(2),
    };

    Ok(ParsedCreate {
        bank_name,
        account_name,
        account_type,
        account_number,
        balance,
        is_primary: req.is_primary.unwrap_or(false),
    })
}

pub async fn list_accounts(store: &dyn Store, user_id: Uuid) -> Result<Vec<BankAccount>, AppError> {
    Ok(store.list_accounts(user_id).await?)
}

pub async fn get_account(
    store: &dyn Store,
    user_id: Uuid,
    account_id: Uuid,
) -> Result<BankAccount, AppError> {
    store
        .get_account(user_id, account_id)
        .await?
        .ok_or_else(|| AppError::not_found("Bank account not found"))
}

pub async fn create_account(
    store: &dyn Store,
    user_id: Uuid,
    req: &CreateAccountRequest,
) -> Result<BankAccount, AppError> {
    let parsed = parse_create(req)?;

    if store.get_user(user_id).await?.is_none() {
        return Err(AppError::not_found("User not found"));
    }

    let account_number = match parsed.account_number {
        Some(number) => {
            if store
                .account_number_taken(number.as_str(), &parsed.bank_name)
                .await?
            {
                return Err(AppError::validation(
                    "Account number already exists for this bank",
                ));
            }
            number
        }
        None => unique_account_number(store, &parsed.bank_name).await?,
    };

    // A user's first account is always primary
    let is_primary = parsed.is_primary || store.list_accounts(user_id).await?.is_empty();

    let account = store
        .insert_account(NewBankAccount {
            user_id,
            bank_name: parsed.bank_name,
            account_name: parsed.account_name,
            account_number: account_number.into_inner(),
            account_type: parsed.account_type,
            balance: parsed.balance,
            is_primary,
        })
        .await?;

    tracing::info!(
        account_id = %account.id,
        %user_id,
        bank = %account.bank_name,
        "bank account created"
    );
    Ok(account)
}

async fn unique_account_number(store: &dyn Store, bank_name: &str) -> Result<AccountNumber, AppError> {
    for _ in 0..MAX_NUMBER_ATTEMPTS {
        let candidate = generate_account_number(bank_name, &mut rand::thread_rng())?;
        if !store.account_number_taken(candidate.as_str(), bank_name).await? {
            return Ok(candidate);
        }
    }
    Err(AppError::Internal(format!(
        "could not generate a unique account number for {bank_name}"
    )))
}

pub async fn update_account(
    store: &dyn Store,
    user_id: Uuid,
    account_id: Uuid,
    req: &UpdateAccountRequest,
) -> Result<BankAccount, AppError> {
    let account_name = optional_text(&req.account_name, "accountName", 100)?;
    if account_name.is_none() && req.is_primary.is_none() {
        return Err(AppError::validation(
            "Nothing to update: provide accountName or isPrimary",
        ));
    }

    let update = AccountUpdate {
        account_name,
        is_primary: req.is_primary,
    };
    store
        .update_account(user_id, account_id, &update)
        .await?
        .ok_or_else(|| AppError::not_found("Bank account not found"))
}

pub async fn set_primary(
    store: &dyn Store,
    user_id: Uuid,
    account_id: Uuid,
) -> Result<BankAccount, AppError> {
    let update = AccountUpdate {
        account_name: None,
        is_primary: Some(true),
    };
    let account = store
        .update_account(user_id, account_id, &update)
        .await?
        .ok_or_else(|| AppError::not_found("Bank account not found"))?;

    tracing::info!(%account_id, %user_id, "primary account changed");
    Ok(account)
}

pub async fn delete_account(
    store: &dyn Store,
    user_id: Uuid,
    account_id: Uuid,
) -> Result<DeletedAccount, AppError> {
    let deleted = store
        .delete_account(user_id, account_id)
        .await?
        .ok_or_else(|| AppError::not_found("Bank account not found"))?;

    tracing::info!(
        %account_id,
        %user_id,
        promoted = ?deleted.promoted,
        "bank account deleted"
    );
    Ok(deleted)
}

pub async fn post_entry(
    store: &dyn Store,
    user_id: Uuid,
    account_id: Uuid,
    req: &AccountEntryRequest,
) -> Result<(BankAccount, Transaction), AppError> {
    let transaction_type = match required(&req.transaction_type, "transactionType")?
        .to_lowercase()
        .as_str()
    {
        "credit" => TransactionType::Credit,
        "debit" => TransactionType::Debit,
        _ => {
            return Err(AppError::validation(
                "Invalid transactionType. Must be 'credit' or 'debit'",
            ))
        }
    };
    let amount = req
        .amount
        .ok_or(ValidationError::Missing("amount"))
        .and_then(|amount| validate_amount(amount, MAX_TRANSFER_AMOUNT))?;

    let (default_category, prefix) = match transaction_type {
        TransactionType::Credit => ("deposit", "DEP"),
        TransactionType::Debit => ("withdrawal", "WDR"),
    };
    let category = optional_text(&req.category, "category", 50)?
        .unwrap_or_else(|| default_category.to_string());

    let entry = NewEntry {
        transaction_type,
        amount,
        category,
        description: optional_text(&req.description, "description", 255)?,
        reference_number: generate_reference(prefix, Utc::now()),
    };

    let (account, transaction) = store.post_entry(user_id, account_id, entry).await?;
    tracing::info!(
        %account_id,
        reference = %transaction.reference_number,
        kind = transaction_type.as_str(),
        "balance entry posted"
    );
    Ok((account, transaction))
}
