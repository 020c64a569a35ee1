//! Cash registers, sessions and cash transactions. Posting a transaction
//! books a CASH journal through the regular validators.

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::accounts;
use crate::approvals::{self, CASH_TRANSACTION};
use crate::audit;
use crate::error::{AppError, Result};
use crate::idempotency;
use crate::journal::{self, NewJournal, NewLine};
use crate::models::{
    is_zero, round_amount, AccountType, CashSessionStatus, CashTxnStatus, CashTxnType, Purpose,
    SessionMode, SourceType,
};
use crate::org;
use crate::periods::{self, parse_date, DATE_FORMAT};
use crate::posting::{self, ReverseOptions};
use crate::purpose_accounts;
use crate::query::{paged, Page, Where};
use crate::scope::{assert_scope_access, perm, RequestContext};

// ---------------------------------------------------------------------------
// Registers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CashRegister {
    pub id: i64,
    pub legal_entity_id: i64,
    pub operating_unit_id: Option<i64>,
    pub book_id: i64,
    pub code: String,
    pub name: String,
    pub account_id: i64,
    pub currency: String,
    pub session_mode: SessionMode,
    pub requires_approval: bool,
    pub is_active: bool,
}

const REGISTER_COLUMNS: &str = "id, legal_entity_id, operating_unit_id, book_id, code, name, account_id, currency, \
     session_mode, requires_approval, is_active";

fn register_from_row(row: &Row) -> rusqlite::Result<CashRegister> {
    Ok(CashRegister {
        id: row.get(0)?,
        legal_entity_id: row.get(1)?,
        operating_unit_id: row.get(2)?,
        book_id: row.get(3)?,
        code: row.get(4)?,
        name: row.get(5)?,
        account_id: row.get(6)?,
        currency: row.get(7)?,
        session_mode: row.get(8)?,
        requires_approval: row.get(9)?,
        is_active: row.get(10)?,
    })
}

pub fn load_register(conn: &Connection, tenant_id: i64, id: i64) -> Result<CashRegister> {
    conn.query_row(
        &format!("SELECT {REGISTER_COLUMNS} FROM cash_registers WHERE id = ?1 AND tenant_id = ?2"),
        [id, tenant_id],
        register_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Cash register {id}")))
}

fn default_session_mode() -> SessionMode {
    SessionMode::None
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct NewRegister {
    pub legal_entity_id: i64,
    pub operating_unit_id: Option<i64>,
    pub book_id: i64,
    pub code: String,
    pub name: String,
    pub account_id: i64,
    pub currency: Option<String>,
    #[serde(default = "default_session_mode")]
    pub session_mode: SessionMode,
    #[serde(default = "default_true")]
    pub requires_approval: bool,
}

pub fn create_register(
    conn: &Connection,
    ctx: &RequestContext,
    input: &NewRegister,
) -> Result<CashRegister> {
    ctx.require_permission(perm::CASH_WRITE)?;
    assert_scope_access(conn, ctx, input.legal_entity_id)?;
    let code = input.code.trim();
    if code.is_empty() || input.name.trim().is_empty() {
        return Err(AppError::validation("Register code and name are required"));
    }
    let book = org::load_book(conn, ctx.tenant_id, input.book_id)?;
    if book.legal_entity_id != input.legal_entity_id {
        return Err(AppError::validation("Book belongs to another legal entity"));
    }
    if let Some(ou_id) = input.operating_unit_id {
        let ou = org::load_operating_unit(conn, ctx.tenant_id, ou_id)?;
        if ou.legal_entity_id != input.legal_entity_id {
            return Err(AppError::validation("Operating unit belongs to another legal entity"));
        }
    }
    let account = accounts::load_account(conn, ctx.tenant_id, input.account_id)?;
    account
        .check_postable(input.legal_entity_id)
        .map_err(|reason| AppError::validation(format!("Register {reason}")))?;
    if account.account_type != AccountType::Asset {
        return Err(AppError::validation(format!(
            "Register account {} must be an ASSET account",
            account.code
        )));
    }
    let currency = match &input.currency {
        Some(c) => {
            org::validate_currency(c)?;
            c.to_uppercase()
        }
        None => book.base_currency.clone(),
    };
    let exists = conn
        .prepare("SELECT 1 FROM cash_registers WHERE tenant_id = ?1 AND code = ?2")?
        .exists(rusqlite::params![ctx.tenant_id, code])?;
    if exists {
        return Err(AppError::conflict(format!("Cash register '{code}' already exists")));
    }
    conn.execute(
        "INSERT INTO cash_registers (tenant_id, legal_entity_id, operating_unit_id, book_id, code, name, account_id, \
         currency, session_mode, requires_approval) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            ctx.tenant_id,
            input.legal_entity_id,
            input.operating_unit_id,
            book.id,
            code,
            input.name.trim(),
            account.id,
            currency,
            input.session_mode,
            input.requires_approval,
        ],
    )?;
    let id = conn.last_insert_rowid();
    audit::record(
        conn,
        ctx,
        "cash.register.create",
        "cash_register",
        Some(id),
        serde_json::json!({
            "code": code,
            "account_id": account.id,
            "session_mode": input.session_mode,
        }),
    )?;
    load_register(conn, ctx.tenant_id, id)
}

pub fn list_registers(
    conn: &Connection,
    ctx: &RequestContext,
    legal_entity_id: Option<i64>,
) -> Result<Vec<CashRegister>> {
    ctx.require_permission(perm::CASH_READ)?;
    let mut w = Where::new()
        .eq("tenant_id", ctx.tenant_id)
        .eq_opt("legal_entity_id", legal_entity_id);
    if let Some(ids) = ctx.scoped_ids() {
        w = w.in_ids("legal_entity_id", &ids);
    }
    let sql = format!("SELECT {REGISTER_COLUMNS} FROM cash_registers{} ORDER BY code", w.sql());
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(w.params().iter()), register_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CashSession {
    pub id: i64,
    pub register_id: i64,
    pub status: CashSessionStatus,
    pub opening_amount: f64,
    pub expected_amount: Option<f64>,
    pub counted_amount: Option<f64>,
    pub variance: Option<f64>,
    pub opened_by: Option<i64>,
    pub opened_at: String,
    pub closed_by: Option<i64>,
    pub closed_at: Option<String>,
}

const SESSION_COLUMNS: &str = "id, register_id, status, opening_amount, expected_amount, counted_amount, variance, \
     opened_by, opened_at, closed_by, closed_at";

fn session_from_row(row: &Row) -> rusqlite::Result<CashSession> {
    Ok(CashSession {
        id: row.get(0)?,
        register_id: row.get(1)?,
        status: row.get(2)?,
        opening_amount: row.get(3)?,
        expected_amount: row.get(4)?,
        counted_amount: row.get(5)?,
        variance: row.get(6)?,
        opened_by: row.get(7)?,
        opened_at: row.get(8)?,
        closed_by: row.get(9)?,
        closed_at: row.get(10)?,
    })
}

pub fn load_session(conn: &Connection, tenant_id: i64, id: i64) -> Result<CashSession> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM cash_sessions WHERE id = ?1 AND tenant_id = ?2"),
        [id, tenant_id],
        session_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Cash session {id}")))
}

pub fn open_session_of(conn: &Connection, register_id: i64) -> Result<Option<CashSession>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM cash_sessions WHERE register_id = ?1 AND status = 'OPEN'"
            ),
            [register_id],
            session_from_row,
        )
        .optional()?)
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenSession {
    #[serde(default)]
    pub opening_amount: f64,
}

pub fn open_session(
    conn: &Connection,
    ctx: &RequestContext,
    register_id: i64,
    input: &OpenSession,
) -> Result<CashSession> {
    ctx.require_permission(perm::CASH_WRITE)?;
    let register = load_register(conn, ctx.tenant_id, register_id)?;
    assert_scope_access(conn, ctx, register.legal_entity_id)?;
    if register.session_mode == SessionMode::None {
        return Err(AppError::validation(format!(
            "Register {} does not use cash sessions",
            register.code
        )));
    }
    if !input.opening_amount.is_finite() || input.opening_amount < 0.0 {
        return Err(AppError::validation("opening_amount must be a non-negative number"));
    }
    if let Some(open) = open_session_of(conn, register.id)? {
        return Err(AppError::conflict(format!(
            "Register {} already has open session {}",
            register.code, open.id
        )));
    }
    conn.execute(
        "INSERT INTO cash_sessions (tenant_id, register_id, opening_amount, opened_by) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            ctx.tenant_id,
            register.id,
            round_amount(input.opening_amount),
            ctx.user_id,
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            AppError::conflict(format!("Register {} already has an open session", register.code))
        }
        other => other.into(),
    })?;
    let id = conn.last_insert_rowid();
    audit::record(
        conn,
        ctx,
        "cash.session.open",
        "cash_session",
        Some(id),
        serde_json::json!({ "register_id": register.id, "opening_amount": input.opening_amount }),
    )?;
    tracing::info!(session_id = id, register = %register.code, "cash session opened");
    load_session(conn, ctx.tenant_id, id)
}

#[derive(Debug, Deserialize)]
pub struct CloseSession {
    pub counted_amount: f64,
}

/// Close an OPEN session. Expected cash is the opening amount plus the signed
/// amounts of every transaction posted in the session.
pub fn close_session(
    conn: &Connection,
    ctx: &RequestContext,
    session_id: i64,
    input: &CloseSession,
) -> Result<CashSession> {
    ctx.require_permission(perm::CASH_WRITE)?;
    let session = load_session(conn, ctx.tenant_id, session_id)?;
    let register = load_register(conn, ctx.tenant_id, session.register_id)?;
    assert_scope_access(conn, ctx, register.legal_entity_id)?;
    if session.status != CashSessionStatus::Open {
        return Err(AppError::conflict(format!("Cash session {session_id} is already closed")));
    }
    if !input.counted_amount.is_finite() || input.counted_amount < 0.0 {
        return Err(AppError::validation("counted_amount must be a non-negative number"));
    }
    let movements: Vec<(CashTxnType, f64)> = {
        let mut stmt = conn.prepare(
            "SELECT txn_type, amount FROM cash_transactions WHERE session_id = ?1 AND status = 'POSTED'",
        )?;
        let rows = stmt
            .query_map([session_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };
    let expected = round_amount(
        session.opening_amount + movements.iter().map(|(t, a)| signed_amount(*t, *a)).sum::<f64>(),
    );
    let counted = round_amount(input.counted_amount);
    let variance = round_amount(counted - expected);
    let updated = conn.execute(
        "UPDATE cash_sessions SET status = 'CLOSED', expected_amount = ?1, counted_amount = ?2, variance = ?3, \
         closed_by = ?4, closed_at = datetime('now') WHERE id = ?5 AND status = 'OPEN'",
        rusqlite::params![expected, counted, variance, ctx.user_id, session_id],
    )?;
    if updated == 0 {
        return Err(AppError::conflict(format!("Cash session {session_id} is already closed")));
    }
    audit::record(
        conn,
        ctx,
        "cash.session.close",
        "cash_session",
        Some(session_id),
        serde_json::json!({ "expected": expected, "counted": counted, "variance": variance }),
    )?;
    tracing::info!(
        session_id,
        register = %register.code,
        expected,
        counted,
        variance,
        "cash session closed"
    );
    load_session(conn, ctx.tenant_id, session_id)
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Effect of a transaction on the register: positive adds cash.
pub fn signed_amount(txn_type: CashTxnType, amount: f64) -> f64 {
    match txn_type {
        CashTxnType::Receipt
        | CashTxnType::WithdrawalFromBank
        | CashTxnType::OpeningFloat
        | CashTxnType::TransferIn
        | CashTxnType::ClosingAdjustment => amount,
        CashTxnType::Payout | CashTxnType::DepositToBank | CashTxnType::TransferOut => -amount,
    }
}

fn is_transfer(txn_type: CashTxnType) -> bool {
    matches!(txn_type, CashTxnType::TransferIn | CashTxnType::TransferOut)
}

/// Purpose account a transaction type falls back to when no counter account
/// is given.
fn default_counter_purpose(txn_type: CashTxnType) -> Option<Purpose> {
    match txn_type {
        CashTxnType::ClosingAdjustment => Some(Purpose::CashOverShort),
        CashTxnType::OpeningFloat => Some(Purpose::OpeningFloatOffset),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CashTransaction {
    pub id: i64,
    pub register_id: i64,
    pub session_id: Option<i64>,
    pub txn_type: CashTxnType,
    pub status: CashTxnStatus,
    pub txn_date: String,
    pub amount: f64,
    pub currency: String,
    pub counter_account_id: Option<i64>,
    pub counter_register_id: Option<i64>,
    pub description: Option<String>,
    pub journal_entry_id: Option<i64>,
    pub reversal_journal_id: Option<i64>,
    pub idempotency_key: Option<String>,
    pub created_by: Option<i64>,
    pub created_at: String,
    pub posted_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CashTxnView {
    #[serde(flatten)]
    pub transaction: CashTransaction,
    pub idempotent_replay: bool,
}

const TXN_COLUMNS: &str = "t.id, t.register_id, t.session_id, t.txn_type, t.status, t.txn_date, t.amount, t.currency, \
     t.counter_account_id, t.counter_register_id, t.description, t.journal_entry_id, t.reversal_journal_id, \
     t.idempotency_key, t.created_by, t.created_at, t.posted_at";

fn txn_from_row(row: &Row) -> rusqlite::Result<CashTransaction> {
    Ok(CashTransaction {
        id: row.get(0)?,
        register_id: row.get(1)?,
        session_id: row.get(2)?,
        txn_type: row.get(3)?,
        status: row.get(4)?,
        txn_date: row.get(5)?,
        amount: row.get(6)?,
        currency: row.get(7)?,
        counter_account_id: row.get(8)?,
        counter_register_id: row.get(9)?,
        description: row.get(10)?,
        journal_entry_id: row.get(11)?,
        reversal_journal_id: row.get(12)?,
        idempotency_key: row.get(13)?,
        created_by: row.get(14)?,
        created_at: row.get(15)?,
        posted_at: row.get(16)?,
    })
}

pub fn load_transaction(conn: &Connection, tenant_id: i64, id: i64) -> Result<CashTransaction> {
    conn.query_row(
        &format!(
            "SELECT {TXN_COLUMNS} FROM cash_transactions t WHERE t.id = ?1 AND t.tenant_id = ?2"
        ),
        [id, tenant_id],
        txn_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Cash transaction {id}")))
}

/// Load a transaction with its register, checking the caller's scope.
fn load_scoped(
    conn: &Connection,
    ctx: &RequestContext,
    id: i64,
) -> Result<(CashTransaction, CashRegister)> {
    let txn = load_transaction(conn, ctx.tenant_id, id)?;
    let register = load_register(conn, ctx.tenant_id, txn.register_id)?;
    assert_scope_access(conn, ctx, register.legal_entity_id)?;
    Ok((txn, register))
}

#[derive(Debug, Deserialize)]
pub struct NewCashTransaction {
    pub register_id: i64,
    pub txn_type: CashTxnType,
    pub txn_date: String,
    pub amount: f64,
    pub counter_account_id: Option<i64>,
    pub counter_register_id: Option<i64>,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
}

fn check_counter_register(
    conn: &Connection,
    ctx: &RequestContext,
    register: &CashRegister,
    counter_id: i64,
) -> Result<CashRegister> {
    if counter_id == register.id {
        return Err(AppError::validation("A register cannot transfer to itself"));
    }
    let counter = load_register(conn, ctx.tenant_id, counter_id)?;
    if counter.legal_entity_id != register.legal_entity_id {
        return Err(AppError::validation("Cash transfers must stay within one legal entity"));
    }
    if counter.operating_unit_id != register.operating_unit_id {
        return Err(AppError::validation(
            "Cross-operating-unit cash transfers are not supported; they need the CASH_IN_TRANSIT flow",
        ));
    }
    Ok(counter)
}

pub fn create_transaction(
    conn: &Connection,
    ctx: &RequestContext,
    input: &NewCashTransaction,
) -> Result<CashTxnView> {
    ctx.require_permission(perm::CASH_WRITE)?;
    let key = idempotency::normalize_key(input.idempotency_key.as_deref())?;
    if let Some(key) = &key {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM cash_transactions WHERE tenant_id = ?1 AND idempotency_key = ?2",
                rusqlite::params![ctx.tenant_id, key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            let (transaction, _) = load_scoped(conn, ctx, id)?;
            tracing::debug!(cash_txn_id = id, key = %key, "cash transaction replayed");
            return Ok(CashTxnView {
                transaction,
                idempotent_replay: true,
            });
        }
    }

    let register = load_register(conn, ctx.tenant_id, input.register_id)?;
    assert_scope_access(conn, ctx, register.legal_entity_id)?;
    if !register.is_active {
        return Err(AppError::validation(format!("Register {} is inactive", register.code)));
    }
    let txn_date = parse_date(&input.txn_date)?.format(DATE_FORMAT).to_string();
    if !input.amount.is_finite() {
        return Err(AppError::validation("amount must be a number"));
    }
    let amount = round_amount(input.amount);
    if input.txn_type == CashTxnType::ClosingAdjustment {
        if is_zero(amount) {
            return Err(AppError::validation("A closing adjustment needs a non-zero amount"));
        }
    } else if amount <= 0.0 || is_zero(amount) {
        return Err(AppError::validation("amount must be positive"));
    }

    if is_transfer(input.txn_type) {
        let counter_id = input
            .counter_register_id
            .ok_or_else(|| {
                AppError::validation(format!("{} requires counter_register_id", input.txn_type))
            })?;
        check_counter_register(conn, ctx, &register, counter_id)?;
        if input.counter_account_id.is_some() {
            return Err(AppError::validation(
                "Transfers take the counter register's account; omit counter_account_id",
            ));
        }
    } else {
        if input.counter_register_id.is_some() {
            return Err(AppError::validation(format!(
                "{} does not take a counter register",
                input.txn_type
            )));
        }
        match input.counter_account_id {
            Some(account_id) => {
                let account = accounts::load_account(conn, ctx.tenant_id, account_id)?;
                account
                    .check_postable(register.legal_entity_id)
                    .map_err(|reason| AppError::validation(format!("Counter {reason}")))?;
            }
            None if default_counter_purpose(input.txn_type).is_none() => {
                return Err(AppError::validation(format!(
                    "{} requires counter_account_id",
                    input.txn_type
                )));
            }
            None => {}
        }
    }

    let session_id = match register.session_mode {
        SessionMode::None => None,
        SessionMode::Optional => open_session_of(conn, register.id)?.map(|s| s.id),
        SessionMode::Required => Some(
            open_session_of(conn, register.id)?
                .ok_or_else(|| {
                    AppError::validation(format!(
                        "Register {} requires an open cash session",
                        register.code
                    ))
                })?
                .id,
        ),
    };

    conn.execute(
        "INSERT INTO cash_transactions (tenant_id, register_id, session_id, txn_type, txn_date, amount, currency, \
         counter_account_id, counter_register_id, description, idempotency_key, created_by) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        rusqlite::params![
            ctx.tenant_id,
            register.id,
            session_id,
            input.txn_type,
            txn_date,
            amount,
            register.currency,
            input.counter_account_id,
            input.counter_register_id,
            input.description,
            key,
            ctx.user_id,
        ],
    )?;
    let id = conn.last_insert_rowid();
    audit::record(
        conn,
        ctx,
        "cash.transaction.create",
        "cash_transaction",
        Some(id),
        serde_json::json!({
            "register_id": register.id,
            "txn_type": input.txn_type,
            "amount": amount,
            "session_id": session_id,
        }),
    )?;
    Ok(CashTxnView {
        transaction: load_transaction(conn, ctx.tenant_id, id)?,
        idempotent_replay: false,
    })
}

#[derive(Debug, Serialize)]
pub struct Submitted {
    pub transaction: CashTransaction,
    pub approval_request_id: i64,
}

/// DRAFT → SUBMITTED, opening an approval request.
pub fn submit(conn: &Connection, ctx: &RequestContext, id: i64) -> Result<Submitted> {
    ctx.require_permission(perm::CASH_WRITE)?;
    let (txn, _) = load_scoped(conn, ctx, id)?;
    if txn.status != CashTxnStatus::Draft {
        return Err(AppError::conflict(format!(
            "Cash transaction {id} is {}; only DRAFT can be submitted",
            txn.status
        )));
    }
    let approval_request_id = approvals::create_internal(conn, ctx, CASH_TRANSACTION, id, "POST")?;
    transition(conn, id, &[CashTxnStatus::Draft], CashTxnStatus::Submitted)?;
    audit::record(
        conn,
        ctx,
        "cash.transaction.submit",
        "cash_transaction",
        Some(id),
        serde_json::json!({ "approval_request_id": approval_request_id }),
    )?;
    Ok(Submitted {
        transaction: load_transaction(conn, ctx.tenant_id, id)?,
        approval_request_id,
    })
}

/// Target side of an approval decision: SUBMITTED → APPROVED, or back to
/// DRAFT on rejection.
pub fn apply_decision(
    conn: &Connection,
    ctx: &RequestContext,
    id: i64,
    approved: bool,
) -> Result<CashTxnStatus> {
    let (txn, _) = load_scoped(conn, ctx, id)?;
    if txn.status != CashTxnStatus::Submitted {
        return Err(AppError::conflict(format!(
            "Cash transaction {id} is {}, not SUBMITTED",
            txn.status
        )));
    }
    let next = if approved { CashTxnStatus::Approved } else { CashTxnStatus::Draft };
    transition(conn, id, &[CashTxnStatus::Submitted], next)?;
    tracing::info!(cash_txn_id = id, status = %next, "cash transaction decided");
    Ok(next)
}

/// Guarded status update; fails with 409 when the row moved meanwhile.
fn transition(conn: &Connection, id: i64, from: &[CashTxnStatus], to: CashTxnStatus) -> Result<()> {
    let allowed: Vec<String> = from.iter().map(|s| format!("'{}'", s.as_str())).collect();
    let updated = conn.execute(
        &format!(
            "UPDATE cash_transactions SET status = ?1 WHERE id = ?2 AND status IN ({})",
            allowed.join(", ")
        ),
        rusqlite::params![to, id],
    )?;
    if updated == 0 {
        return Err(AppError::conflict(format!(
            "Cash transaction {id} changed status concurrently"
        )));
    }
    Ok(())
}

fn journal_lines(
    conn: &Connection,
    ctx: &RequestContext,
    txn: &CashTransaction,
    register: &CashRegister,
) -> Result<Vec<NewLine>> {
    let counter_account_id = if let Some(counter_register_id) = txn.counter_register_id {
        check_counter_register(conn, ctx, register, counter_register_id)?.account_id
    } else if let Some(account_id) = txn.counter_account_id {
        account_id
    } else {
        let purpose = default_counter_purpose(txn.txn_type)
            .ok_or_else(|| {
                AppError::validation(format!("{} requires counter_account_id", txn.txn_type))
            })?;
        purpose_accounts::require(conn, ctx.tenant_id, register.legal_entity_id, purpose)?.id
    };
    let signed = signed_amount(txn.txn_type, txn.amount);
    let amount = signed.abs();
    let (debit, credit) = if signed > 0.0 {
        (register.account_id, counter_account_id)
    } else {
        (counter_account_id, register.account_id)
    };
    let memo = txn.description.clone();
    let mut lines = vec![NewLine::debit(debit, amount), NewLine::credit(credit, amount)];
    for line in &mut lines {
        line.description = memo.clone();
        line.currency = Some(txn.currency.clone());
        if line.account_id == register.account_id {
            line.operating_unit_id = register.operating_unit_id;
        }
    }
    Ok(lines)
}

#[derive(Debug, Serialize)]
pub struct PostedCash {
    pub transaction: CashTransaction,
    pub journal: crate::models::JournalDetail,
}

/// APPROVED (or DRAFT on registers without approval) → POSTED. Books and
/// posts a CASH journal.
pub fn post(conn: &Connection, ctx: &RequestContext, id: i64) -> Result<PostedCash> {
    ctx.require_permission(perm::CASH_POST)?;
    let (txn, register) = load_scoped(conn, ctx, id)?;
    let postable = match txn.status {
        CashTxnStatus::Approved => true,
        CashTxnStatus::Draft => !register.requires_approval,
        _ => false,
    };
    if !postable {
        return Err(AppError::conflict(if register.requires_approval {
            format!("Cash transaction {id} is {}; it must be APPROVED before posting", txn.status)
        } else {
            format!("Cash transaction {id} is {} and cannot be posted", txn.status)
        }));
    }
    if register.session_mode == SessionMode::Required {
        let open = open_session_of(conn, register.id)?;
        let ok = match (txn.session_id, &open) {
            (Some(session_id), Some(open)) => session_id == open.id,
            (None, Some(_)) => true,
            (_, None) => false,
        };
        if !ok {
            return Err(AppError::validation(format!(
                "Register {} requires the transaction's cash session to be open",
                register.code
            )));
        }
    }

    let book = org::load_book(conn, ctx.tenant_id, register.book_id)?;
    let lines = journal_lines(conn, ctx, &txn, &register)?;
    let mut input = NewJournal::system(&book, None, &txn.txn_date, SourceType::Cash)
        .source(CASH_TRANSACTION, txn.id)
        .describe(
            txn.description
                .clone()
                .unwrap_or_else(|| format!("{} {}", txn.txn_type, register.code)),
        )
        .lines(lines);
    input.currency = Some(txn.currency.clone());
    let journal_id = journal::create_internal(conn, ctx, &input)?;
    posting::post_internal(conn, ctx, journal_id)?;

    let session_id = match (register.session_mode, txn.session_id) {
        (SessionMode::None, _) => None,
        (_, Some(id)) => Some(id),
        (_, None) => open_session_of(conn, register.id)?.map(|s| s.id),
    };
    let updated = conn.execute(
        "UPDATE cash_transactions SET status = 'POSTED', journal_entry_id = ?1, session_id = ?2, posted_at = datetime('now') \
         WHERE id = ?3 AND status IN ('APPROVED', 'DRAFT')",
        rusqlite::params![journal_id, session_id, id],
    )?;
    if updated == 0 {
        return Err(AppError::conflict(format!(
            "Cash transaction {id} changed status concurrently"
        )));
    }
    audit::record(
        conn,
        ctx,
        "cash.transaction.post",
        "cash_transaction",
        Some(id),
        serde_json::json!({ "journal_id": journal_id }),
    )?;
    tracing::info!(
        cash_txn_id = id,
        journal_id,
        register = %register.code,
        "cash transaction posted"
    );
    Ok(PostedCash {
        transaction: load_transaction(conn, ctx.tenant_id, id)?,
        journal: journal::load_detail(conn, ctx.tenant_id, journal_id)?,
    })
}

pub fn cancel(conn: &Connection, ctx: &RequestContext, id: i64) -> Result<CashTransaction> {
    ctx.require_permission(perm::CASH_WRITE)?;
    let (txn, _) = load_scoped(conn, ctx, id)?;
    let open = [CashTxnStatus::Draft, CashTxnStatus::Submitted, CashTxnStatus::Approved];
    if !open.contains(&txn.status) {
        return Err(AppError::conflict(format!(
            "Cash transaction {id} is {} and cannot be cancelled",
            txn.status
        )));
    }
    let withdrawn = approvals::withdraw(conn, ctx, CASH_TRANSACTION, id, "transaction cancelled")?;
    transition(conn, id, &open, CashTxnStatus::Cancelled)?;
    audit::record(
        conn,
        ctx,
        "cash.transaction.cancel",
        "cash_transaction",
        Some(id),
        serde_json::json!({ "from": txn.status, "withdrawn_approval_id": withdrawn }),
    )?;
    load_transaction(conn, ctx.tenant_id, id)
}

#[derive(Debug, Default, Deserialize)]
pub struct ReverseCash {
    pub entry_date: Option<String>,
    pub description: Option<String>,
}

/// POSTED → REVERSED; the journal is reversed and the reversal auto-posted.
pub fn reverse(
    conn: &Connection,
    ctx: &RequestContext,
    id: i64,
    input: &ReverseCash,
) -> Result<CashTransaction> {
    ctx.require_permission(perm::CASH_POST)?;
    let (txn, _) = load_scoped(conn, ctx, id)?;
    let journal_id = match (txn.status, txn.journal_entry_id) {
        (CashTxnStatus::Posted, Some(journal_id)) => journal_id,
        _ => {
            return Err(AppError::conflict(format!(
                "Cash transaction {id} is {}; only POSTED can be reversed",
                txn.status
            )));
        }
    };
    let options = ReverseOptions {
        entry_date: Some(input.entry_date.clone().unwrap_or_else(periods::today)),
        fiscal_period_id: None,
        description: input.description.clone(),
        auto_post: true,
    };
    let reversal_id = posting::reverse_internal(conn, ctx, journal_id, &options)?;
    let updated = conn.execute(
        "UPDATE cash_transactions SET status = 'REVERSED', reversal_journal_id = ?1 WHERE id = ?2 AND status = 'POSTED'",
        rusqlite::params![reversal_id, id],
    )?;
    if updated == 0 {
        return Err(AppError::conflict(format!(
            "Cash transaction {id} changed status concurrently"
        )));
    }
    audit::record(
        conn,
        ctx,
        "cash.transaction.reverse",
        "cash_transaction",
        Some(id),
        serde_json::json!({ "journal_id": journal_id, "reversal_journal_id": reversal_id }),
    )?;
    tracing::info!(cash_txn_id = id, reversal_id, "cash transaction reversed");
    load_transaction(conn, ctx.tenant_id, id)
}

#[derive(Debug, Default, Deserialize)]
pub struct CashTxnFilter {
    pub register_id: Option<i64>,
    pub session_id: Option<i64>,
    pub status: Option<CashTxnStatus>,
    pub txn_type: Option<CashTxnType>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

pub fn list_transactions(
    conn: &Connection,
    ctx: &RequestContext,
    filter: &CashTxnFilter,
    page: Page,
) -> Result<Vec<CashTransaction>> {
    ctx.require_permission(perm::CASH_READ)?;
    let mut w = Where::new()
        .eq("t.tenant_id", ctx.tenant_id)
        .eq_opt("t.register_id", filter.register_id)
        .eq_opt("t.session_id", filter.session_id)
        .eq_opt("t.status", filter.status.map(|s| s.as_str().to_string()))
        .eq_opt("t.txn_type", filter.txn_type.map(|s| s.as_str().to_string()))
        .gte_opt("t.txn_date", filter.date_from.clone())
        .lte_opt("t.txn_date", filter.date_to.clone());
    if let Some(ids) = ctx.scoped_ids() {
        w = w.in_ids("r.legal_entity_id", &ids);
    }
    let (tail, params) = paged(&w, page);
    let sql = format!(
        "SELECT {TXN_COLUMNS} FROM cash_transactions t JOIN cash_registers r ON r.id = t.register_id{} \
         ORDER BY t.txn_date DESC, t.id DESC{tail}",
        w.sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), txn_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_transaction(
    conn: &Connection,
    ctx: &RequestContext,
    id: i64,
) -> Result<CashTransaction> {
    ctx.require_permission(perm::CASH_READ)?;
    Ok(load_scoped(conn, ctx, id)?.0)
}
