pub mod bank_accounts;
pub mod mailer;
pub mod profile;
pub mod reference;
pub mod statements;
pub mod supabase;
pub mod transfers;
pub mod validation;
