use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::accounts;
use crate::audit;
use crate::error::{AppError, Result};
use crate::org;
use crate::periods::parse_date;
use crate::scope::{assert_scope_access, perm, RequestContext};

#[derive(Debug, Deserialize)]
pub struct ReconcileInput {
    pub book_id: i64,
    pub bank_account_id: i64,
    pub statement_date: String,
    pub statement_balance: f64,
}

#[derive(Debug, Serialize)]
pub struct ReconcileResult {
    pub id: i64,
    pub is_reconciled: bool,
    pub statement_balance: f64,
    pub calculated_balance: f64,
    pub discrepancy: f64,
}

/// Debit-positive balance of `account_id` in `book_id` from journals that
/// reached the ledger (POSTED or later REVERSED) up to `as_of`.
pub fn gl_balance(conn: &Connection, book_id: i64, account_id: i64, as_of: &str) -> Result<f64> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(l.debit_base - l.credit_base), 0) FROM journal_lines l \
         JOIN journal_entries j ON j.id = l.journal_entry_id \
         WHERE j.book_id = ?1 AND l.account_id = ?2 AND j.status IN ('POSTED', 'REVERSED') AND j.entry_date <= ?3",
        rusqlite::params![book_id, account_id, as_of],
        |row| row.get(0),
    )?)
}

pub fn reconcile(
    conn: &Connection,
    ctx: &RequestContext,
    input: &ReconcileInput,
) -> Result<ReconcileResult> {
    ctx.require_permission(perm::BANK_WRITE)?;
    let book = org::load_book(conn, ctx.tenant_id, input.book_id)?;
    assert_scope_access(conn, ctx, book.legal_entity_id)?;
    let account = accounts::load_account(conn, ctx.tenant_id, input.bank_account_id)?;
    if !account.usable_by(book.legal_entity_id) {
        return Err(AppError::validation(format!(
            "Account {} is outside the chart of book {}",
            account.code, book.code
        )));
    }
    parse_date(&input.statement_date)?;

    let calculated = gl_balance(conn, book.id, account.id, &input.statement_date)?;
    let discrepancy = (calculated - input.statement_balance).abs();
    let is_reconciled = discrepancy < 0.01;

    conn.execute(
        "INSERT INTO bank_reconciliations (tenant_id, book_id, bank_account_id, statement_date, statement_balance, \
         calculated_balance, is_reconciled, reconciled_at, created_by) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, CASE WHEN ?7 = 1 THEN datetime('now') ELSE NULL END, ?8)",
        rusqlite::params![
            ctx.tenant_id,
            book.id,
            account.id,
            input.statement_date,
            input.statement_balance,
            calculated,
            is_reconciled as i32,
            ctx.user_id,
        ],
    )?;
    let id = conn.last_insert_rowid();
    let discrepancy = (discrepancy * 100.0).round() / 100.0;
    audit::record(
        conn,
        ctx,
        "bank.reconcile",
        "bank_reconciliation",
        Some(id),
        serde_json::json!({
            "statement_date": input.statement_date,
            "statement_balance": input.statement_balance,
            "calculated_balance": calculated,
            "is_reconciled": is_reconciled,
        }),
    )?;
    tracing::info!(
        account = %account.code,
        book = %book.code,
        is_reconciled,
        discrepancy,
        "reconciliation recorded"
    );

    Ok(ReconcileResult {
        id,
        is_reconciled,
        statement_balance: input.statement_balance,
        calculated_balance: calculated,
        discrepancy,
    })
}
