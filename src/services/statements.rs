//! Account statements: one account, one inclusive date range, rendered as
//! CSV, an Excel-compatible HTML table or a printable HTML document.

use std::fmt::Write as _;

use chrono::{DateTime, Days, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::types::Uuid;

use crate::error::AppError;
use crate::models::{BankAccount, StatementRequest, Transaction, TransactionType, User};
use crate::services::validation::{required, required_uuid, Email, ValidationError};
use crate::store::{Store, TransactionFilter};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq)]
pub struct StatementQuery {
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub email: Option<Email>,
}

fn parse_date(raw: &str, field: &'static str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| ValidationError::InvalidFormat {
        field,
        value: raw.to_string(),
        expected: "YYYY-MM-DD",
    })
}

pub fn parse_statement_request(req: &StatementRequest) -> Result<StatementQuery, ValidationError> {
    let user_id = required_uuid(&req.user_id, "userId")?;
    let account_id = required_uuid(&req.account_id, "accountId")?;
    let start = parse_date(required(&req.start_date, "startDate")?, "startDate")?;
    let end = parse_date(required(&req.end_date, "endDate")?, "endDate")?;
    if start > end {
        return Err(ValidationError::Invalid {
            field: "startDate",
            reason: "must not be after endDate",
        });
    }

    let email = match req.email.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(Email::parse(raw)?),
    };

    Ok(StatementQuery {
        user_id,
        account_id,
        start,
        end,
        email,
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementTotals {
    pub credits: Decimal,
    pub debits: Decimal,
    pub count: usize,
}

impl StatementTotals {
    pub fn from_transactions(transactions: &[Transaction]) -> Self {
        transactions
            .iter()
            .fold(StatementTotals::default(), |mut totals, t| {
                match t.transaction_type {
                    TransactionType::Credit => totals.credits += t.amount,
                    TransactionType::Debit => totals.debits += t.amount,
                }
                totals.count += 1;
                totals
            })
    }

    pub fn net(&self) -> Decimal {
        self.credits - self.debits
    }
}

#[derive(Debug, Clone)]
pub struct Statement {
    pub owner: User,
    pub account: BankAccount,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub transactions: Vec<Transaction>,
    pub totals: StatementTotals,
    pub generated_at: DateTime<Utc>,
}

/// Loads the statement described by `query` on behalf of `caller_id`.
pub async fn build_statement(
    store: &dyn Store,
    caller_id: Uuid,
    query: &StatementQuery,
) -> Result<Statement, AppError> {
    if query.user_id != caller_id {
        return Err(AppError::Forbidden(
            "You can only request statements for your own accounts".into(),
        ));
    }

    let owner = store
        .get_user(query.user_id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;
    let account = store
        .get_account(query.user_id, query.account_id)
        .await?
        .ok_or_else(|| AppError::not_found("Bank account not found"))?;

    let until = query
        .end
        .checked_add_days(Days::new(1))
        .ok_or_else(|| AppError::validation("endDate is out of range"))?;

    let transactions = store
        .list_transactions(&TransactionFilter {
            user_id: query.user_id,
            account_id: Some(query.account_id),
            from: Some(query.start.and_time(chrono::NaiveTime::MIN).and_utc()),
            until: Some(until.and_time(chrono::NaiveTime::MIN).and_utc()),
            limit: None,
            oldest_first: true,
        })
        .await?;

    let totals = StatementTotals::from_transactions(&transactions);
    tracing::debug!(
        account_id = %account.id,
        count = totals.count,
        "statement built"
    );

    Ok(Statement {
        owner,
        account,
        start: query.start,
        end: query.end,
        transactions,
        totals,
        generated_at: Utc::now(),
    })
}

impl Statement {
    pub fn filename(&self, extension: &str) -> String {
        format!(
            "statement-{}-{}-{}.{}",
            self.account.account_number,
            self.start.format(DATE_FORMAT),
            self.end.format(DATE_FORMAT),
            extension
        )
    }

    fn period(&self) -> String {
        format!(
            "{} to {}",
            self.start.format(DATE_FORMAT),
            self.end.format(DATE_FORMAT)
        )
    }

    pub fn render_csv(&self) -> String {
        let mut out = String::new();
        let mut row = |cells: &[&str]| {
            let line: Vec<String> = cells.iter().map(|c| csv_field(c)).collect();
            out.push_str(&line.join(","));
            out.push_str("\r\n");
        };

        row(&["Nile Pay Account Statement"]);
        row(&["Account Holder", self.owner.display_name()]);
        row(&["Bank", &self.account.bank_name]);
        row(&["Account Number", &self.account.account_number]);
        row(&["Period", &self.period()]);
        row(&[]);
        row(&[
            "Date",
            "Reference",
            "Description",
            "Category",
            "Type",
            "Amount",
            "Status",
        ]);
        for t in &self.transactions {
            row(&[
                &t.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                &t.reference_number,
                t.description.as_deref().unwrap_or(""),
                &t.category,
                t.transaction_type.as_str(),
                &signed_amount(t),
                t.status.as_str(),
            ]);
        }
        row(&[]);
        row(&["Total Credits", &money(self.totals.credits)]);
        row(&["Total Debits", &money(self.totals.debits)]);
        row(&["Net Change", &money(self.totals.net())]);
        row(&["Transactions", &self.totals.count.to_string()]);
        out
    }

    fn table_html(&self) -> String {
        let mut html = String::from(
            "<table border=\"1\">\n<thead><tr><th>Date</th><th>Reference</th><th>Description</th>\
             <th>Category</th><th>Type</th><th>Amount</th><th>Status</th></tr></thead>\n<tbody>\n",
        );
        for t in &self.transactions {
            let _ = writeln!(
                html,
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                t.created_at.format("%Y-%m-%d %H:%M"),
                escape_html(&t.reference_number),
                escape_html(t.description.as_deref().unwrap_or("")),
                escape_html(&t.category),
                t.transaction_type.as_str(),
                signed_amount(t),
                t.status.as_str(),
            );
        }
        html.push_str("</tbody>\n</table>\n");
        html
    }

    fn summary_html(&self) -> String {
        format!(
            "<table class=\"summary\">\n\
             <tr><td>Total Credits</td><td>{}</td></tr>\n\
             <tr><td>Total Debits</td><td>{}</td></tr>\n\
             <tr><td>Net Change</td><td>{}</td></tr>\n\
             <tr><td>Transactions</td><td>{}</td></tr>\n\
             </table>\n",
            money(self.totals.credits),
            money(self.totals.debits),
            money(self.totals.net()),
            self.totals.count
        )
    }

    /// HTML workbook that Excel opens as a sheet.
    pub fn render_excel(&self) -> String {
        format!(
            "<html xmlns:x=\"urn:schemas-microsoft-com:office:excel\">\n\
             <head><meta charset=\"UTF-8\"></head>\n<body>\n\
             <h3>{} - {}</h3>\n<p>{}</p>\n{}{}</body>\n</html>\n",
            escape_html(self.owner.display_name()),
            escape_html(&self.account.account_number),
            escape_html(&self.period()),
            self.table_html(),
            self.summary_html()
        )
    }

    /// Printable document, used for PDF conversion and the email body.
    pub fn render_html(&self) -> String {
        format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\">\n\
             <title>Statement {account}</title>\n\
             <style>body{{font-family:sans-serif;margin:32px}}table{{border-collapse:collapse;width:100%}}\
             td,th{{padding:6px;border:1px solid #ccc;text-align:left}}.summary{{margin-top:24px;width:auto}}</style>\n\
             </head>\n<body>\n<h1>Nile Pay Account Statement</h1>\n\
             <p><strong>Account Holder:</strong> {holder}<br>\
             <strong>Bank:</strong> {bank}<br>\
             <strong>Account Number:</strong> {account}<br>\
             <strong>Period:</strong> {period}<br>\
             <strong>Current Balance:</strong> {balance} {currency}</p>\n\
             {table}{summary}\
             <p>Generated {generated}</p>\n</body>\n</html>\n",
            account = escape_html(&self.account.account_number),
            holder = escape_html(self.owner.display_name()),
            bank = escape_html(&self.account.bank_name),
            period = escape_html(&self.period()),
            balance = money(self.account.balance),
            currency = escape_html(&self.account.currency),
            table = self.table_html(),
            summary = self.summary_html(),
            generated = self.generated_at.format("%Y-%m-%d %H:%M UTC"),
        )
    }
}

fn money(value: Decimal) -> String {
    format!("{:.2}", value)
}

fn signed_amount(t: &Transaction) -> String {
    match t.transaction_type {
        TransactionType::Credit => money(t.amount),
        TransactionType::Debit => format!("-{}", money(t.amount)),
    }
}

fn csv_field(value: &str) -> String {
    // Spreadsheets evaluate cells starting with these as formulas
    let formula = value.starts_with(['=', '+', '-', '@', '\t', '\r'])
        && value.parse::<Decimal>().is_err();
    if formula {
        format!("\"'{}\"", value.replace('"', "\"\""))
    } else if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
