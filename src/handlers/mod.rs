pub mod auth;
pub mod bank_accounts;
pub mod health;
pub mod statements;
pub mod transactions;
pub mod transfers;
pub mod user;
