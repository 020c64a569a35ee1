use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior};

use crate::error::Result;

pub const DB_FILE: &str = "backoffice.db";

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tenants (
    id INTEGER PRIMARY KEY,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS legal_entities (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    base_currency TEXT NOT NULL,
    requires_ic_partner INTEGER DEFAULT 0,
    created_at TEXT DEFAULT (datetime('now')),
    UNIQUE (tenant_id, code),
    FOREIGN KEY (tenant_id) REFERENCES tenants(id)
);

CREATE TABLE IF NOT EXISTS operating_units (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    legal_entity_id INTEGER NOT NULL,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    UNIQUE (legal_entity_id, code),
    FOREIGN KEY (tenant_id) REFERENCES tenants(id),
    FOREIGN KEY (legal_entity_id) REFERENCES legal_entities(id)
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    email TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    password_hash TEXT NOT NULL,
    password_salt TEXT NOT NULL,
    is_active INTEGER DEFAULT 1,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (tenant_id) REFERENCES tenants(id)
);

CREATE TABLE IF NOT EXISTS roles (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    UNIQUE (tenant_id, code),
    FOREIGN KEY (tenant_id) REFERENCES tenants(id)
);

CREATE TABLE IF NOT EXISTS role_permissions (
    role_id INTEGER NOT NULL,
    permission TEXT NOT NULL,
    PRIMARY KEY (role_id, permission),
    FOREIGN KEY (role_id) REFERENCES roles(id)
);

CREATE TABLE IF NOT EXISTS user_roles (
    user_id INTEGER NOT NULL,
    role_id INTEGER NOT NULL,
    PRIMARY KEY (user_id, role_id),
    FOREIGN KEY (user_id) REFERENCES users(id),
    FOREIGN KEY (role_id) REFERENCES roles(id)
);

CREATE TABLE IF NOT EXISTS user_legal_entity_scopes (
    user_id INTEGER NOT NULL,
    legal_entity_id INTEGER NOT NULL,
    PRIMARY KEY (user_id, legal_entity_id),
    FOREIGN KEY (user_id) REFERENCES users(id),
    FOREIGN KEY (legal_entity_id) REFERENCES legal_entities(id)
);

CREATE TABLE IF NOT EXISTS sessions (
    token_hash TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    created_at TEXT DEFAULT (datetime('now')),
    expires_at TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS charts_of_accounts (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    legal_entity_id INTEGER,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    UNIQUE (tenant_id, code),
    FOREIGN KEY (tenant_id) REFERENCES tenants(id),
    FOREIGN KEY (legal_entity_id) REFERENCES legal_entities(id)
);

CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    chart_id INTEGER NOT NULL,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    account_type TEXT NOT NULL,
    normal_side TEXT NOT NULL,
    parent_id INTEGER,
    is_postable INTEGER DEFAULT 1,
    is_active INTEGER DEFAULT 1,
    created_at TEXT DEFAULT (datetime('now')),
    UNIQUE (chart_id, code),
    FOREIGN KEY (tenant_id) REFERENCES tenants(id),
    FOREIGN KEY (chart_id) REFERENCES charts_of_accounts(id),
    FOREIGN KEY (parent_id) REFERENCES accounts(id)
);

CREATE TABLE IF NOT EXISTS fiscal_calendars (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    UNIQUE (tenant_id, code),
    FOREIGN KEY (tenant_id) REFERENCES tenants(id)
);

CREATE TABLE IF NOT EXISTS fiscal_periods (
    id INTEGER PRIMARY KEY,
    calendar_id INTEGER NOT NULL,
    fiscal_year INTEGER NOT NULL,
    period_no INTEGER NOT NULL,
    name TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    is_adjustment INTEGER DEFAULT 0,
    UNIQUE (calendar_id, fiscal_year, period_no),
    FOREIGN KEY (calendar_id) REFERENCES fiscal_calendars(id)
);

CREATE TABLE IF NOT EXISTS books (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    legal_entity_id INTEGER NOT NULL,
    calendar_id INTEGER NOT NULL,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    book_type TEXT NOT NULL,
    base_currency TEXT NOT NULL,
    UNIQUE (tenant_id, code),
    FOREIGN KEY (tenant_id) REFERENCES tenants(id),
    FOREIGN KEY (legal_entity_id) REFERENCES legal_entities(id),
    FOREIGN KEY (calendar_id) REFERENCES fiscal_calendars(id)
);

CREATE TABLE IF NOT EXISTS period_statuses (
    book_id INTEGER NOT NULL,
    fiscal_period_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    note TEXT,
    updated_by INTEGER,
    updated_at TEXT DEFAULT (datetime('now')),
    PRIMARY KEY (book_id, fiscal_period_id),
    FOREIGN KEY (book_id) REFERENCES books(id),
    FOREIGN KEY (fiscal_period_id) REFERENCES fiscal_periods(id)
);

CREATE TABLE IF NOT EXISTS journal_entries (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    legal_entity_id INTEGER NOT NULL,
    book_id INTEGER NOT NULL,
    fiscal_period_id INTEGER NOT NULL,
    journal_no TEXT NOT NULL,
    entry_date TEXT NOT NULL,
    document_date TEXT,
    currency TEXT NOT NULL,
    source_type TEXT NOT NULL,
    source_ref_type TEXT,
    source_ref_id INTEGER,
    description TEXT,
    status TEXT NOT NULL DEFAULT 'DRAFT',
    total_debit_base REAL NOT NULL DEFAULT 0,
    total_credit_base REAL NOT NULL DEFAULT 0,
    mirror_of_journal_id INTEGER,
    reversal_of_journal_id INTEGER,
    reversed_by_journal_id INTEGER,
    created_by INTEGER,
    created_at TEXT DEFAULT (datetime('now')),
    posted_by INTEGER,
    posted_at TEXT,
    reversed_at TEXT,
    UNIQUE (book_id, journal_no),
    FOREIGN KEY (tenant_id) REFERENCES tenants(id),
    FOREIGN KEY (legal_entity_id) REFERENCES legal_entities(id),
    FOREIGN KEY (book_id) REFERENCES books(id),
    FOREIGN KEY (fiscal_period_id) REFERENCES fiscal_periods(id),
    FOREIGN KEY (mirror_of_journal_id) REFERENCES journal_entries(id),
    FOREIGN KEY (reversal_of_journal_id) REFERENCES journal_entries(id),
    FOREIGN KEY (reversed_by_journal_id) REFERENCES journal_entries(id)
);

CREATE INDEX IF NOT EXISTS idx_journal_entries_period
    ON journal_entries (book_id, fiscal_period_id, status);

CREATE TABLE IF NOT EXISTS journal_lines (
    id INTEGER PRIMARY KEY,
    journal_entry_id INTEGER NOT NULL,
    line_no INTEGER NOT NULL,
    account_id INTEGER NOT NULL,
    operating_unit_id INTEGER,
    subledger_ref_type TEXT,
    subledger_ref_id INTEGER,
    counterparty_legal_entity_id INTEGER,
    description TEXT,
    currency TEXT NOT NULL,
    amount_txn REAL NOT NULL,
    debit_base REAL NOT NULL DEFAULT 0,
    credit_base REAL NOT NULL DEFAULT 0,
    CHECK (debit_base >= 0 AND credit_base >= 0),
    FOREIGN KEY (journal_entry_id) REFERENCES journal_entries(id),
    FOREIGN KEY (account_id) REFERENCES accounts(id),
    FOREIGN KEY (operating_unit_id) REFERENCES operating_units(id),
    FOREIGN KEY (counterparty_legal_entity_id) REFERENCES legal_entities(id)
);

CREATE INDEX IF NOT EXISTS idx_journal_lines_entry ON journal_lines (journal_entry_id);
CREATE INDEX IF NOT EXISTS idx_journal_lines_account ON journal_lines (account_id);

CREATE TABLE IF NOT EXISTS period_close_runs (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    book_id INTEGER NOT NULL,
    fiscal_period_id INTEGER NOT NULL,
    requested_status TEXT NOT NULL,
    previous_status TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'COMPLETED',
    carry_forward_journal_id INTEGER,
    year_end_journal_id INTEGER,
    started_by INTEGER,
    created_at TEXT DEFAULT (datetime('now')),
    reopened_by INTEGER,
    reopened_at TEXT,
    reopen_reason TEXT,
    FOREIGN KEY (book_id) REFERENCES books(id),
    FOREIGN KEY (fiscal_period_id) REFERENCES fiscal_periods(id),
    FOREIGN KEY (carry_forward_journal_id) REFERENCES journal_entries(id),
    FOREIGN KEY (year_end_journal_id) REFERENCES journal_entries(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_close_runs_active
    ON period_close_runs (book_id, fiscal_period_id, requested_status)
    WHERE status = 'COMPLETED';

CREATE TABLE IF NOT EXISTS purpose_accounts (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    legal_entity_id INTEGER,
    purpose TEXT NOT NULL,
    account_id INTEGER NOT NULL,
    updated_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (tenant_id) REFERENCES tenants(id),
    FOREIGN KEY (legal_entity_id) REFERENCES legal_entities(id),
    FOREIGN KEY (account_id) REFERENCES accounts(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_purpose_accounts_scope
    ON purpose_accounts (tenant_id, COALESCE(legal_entity_id, 0), purpose);

CREATE TABLE IF NOT EXISTS approval_requests (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    target_type TEXT NOT NULL,
    target_id INTEGER NOT NULL,
    action TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    requested_by INTEGER,
    requested_at TEXT DEFAULT (datetime('now')),
    decided_by INTEGER,
    decided_at TEXT,
    decision_note TEXT,
    FOREIGN KEY (tenant_id) REFERENCES tenants(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_approval_pending_target
    ON approval_requests (target_type, target_id)
    WHERE status = 'PENDING';

CREATE TABLE IF NOT EXISTS cash_registers (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    legal_entity_id INTEGER NOT NULL,
    operating_unit_id INTEGER,
    book_id INTEGER NOT NULL,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    account_id INTEGER NOT NULL,
    currency TEXT NOT NULL,
    session_mode TEXT NOT NULL DEFAULT 'NONE',
    requires_approval INTEGER DEFAULT 1,
    is_active INTEGER DEFAULT 1,
    UNIQUE (tenant_id, code),
    FOREIGN KEY (legal_entity_id) REFERENCES legal_entities(id),
    FOREIGN KEY (operating_unit_id) REFERENCES operating_units(id),
    FOREIGN KEY (book_id) REFERENCES books(id),
    FOREIGN KEY (account_id) REFERENCES accounts(id)
);

CREATE TABLE IF NOT EXISTS cash_sessions (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    register_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'OPEN',
    opening_amount REAL NOT NULL DEFAULT 0,
    expected_amount REAL,
    counted_amount REAL,
    variance REAL,
    opened_by INTEGER,
    opened_at TEXT DEFAULT (datetime('now')),
    closed_by INTEGER,
    closed_at TEXT,
    FOREIGN KEY (register_id) REFERENCES cash_registers(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_cash_sessions_one_open
    ON cash_sessions (register_id)
    WHERE status = 'OPEN';

CREATE TABLE IF NOT EXISTS cash_transactions (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    register_id INTEGER NOT NULL,
    session_id INTEGER,
    txn_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'DRAFT',
    txn_date TEXT NOT NULL,
    amount REAL NOT NULL,
    currency TEXT NOT NULL,
    counter_account_id INTEGER,
    counter_register_id INTEGER,
    description TEXT,
    journal_entry_id INTEGER,
    reversal_journal_id INTEGER,
    idempotency_key TEXT,
    created_by INTEGER,
    created_at TEXT DEFAULT (datetime('now')),
    posted_at TEXT,
    UNIQUE (tenant_id, idempotency_key),
    FOREIGN KEY (register_id) REFERENCES cash_registers(id),
    FOREIGN KEY (session_id) REFERENCES cash_sessions(id),
    FOREIGN KEY (counter_account_id) REFERENCES accounts(id),
    FOREIGN KEY (counter_register_id) REFERENCES cash_registers(id),
    FOREIGN KEY (journal_entry_id) REFERENCES journal_entries(id)
);

CREATE TABLE IF NOT EXISTS payment_terms (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    due_days INTEGER NOT NULL,
    is_active INTEGER DEFAULT 1,
    UNIQUE (tenant_id, code),
    FOREIGN KEY (tenant_id) REFERENCES tenants(id)
);

CREATE TABLE IF NOT EXISTS counterparties (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    tax_id TEXT,
    payment_term_id INTEGER,
    is_active INTEGER DEFAULT 1,
    created_at TEXT DEFAULT (datetime('now')),
    UNIQUE (tenant_id, code),
    FOREIGN KEY (tenant_id) REFERENCES tenants(id),
    FOREIGN KEY (payment_term_id) REFERENCES payment_terms(id)
);

CREATE TABLE IF NOT EXISTS cari_documents (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    legal_entity_id INTEGER NOT NULL,
    book_id INTEGER NOT NULL,
    counterparty_id INTEGER NOT NULL,
    direction TEXT NOT NULL,
    document_no TEXT NOT NULL,
    document_date TEXT NOT NULL,
    due_date TEXT NOT NULL,
    currency TEXT NOT NULL,
    amount REAL NOT NULL,
    offset_account_id INTEGER NOT NULL,
    description TEXT,
    status TEXT NOT NULL DEFAULT 'DRAFT',
    journal_entry_id INTEGER,
    idempotency_key TEXT,
    payload_hash TEXT,
    created_by INTEGER,
    created_at TEXT DEFAULT (datetime('now')),
    UNIQUE (tenant_id, idempotency_key),
    FOREIGN KEY (legal_entity_id) REFERENCES legal_entities(id),
    FOREIGN KEY (book_id) REFERENCES books(id),
    FOREIGN KEY (counterparty_id) REFERENCES counterparties(id),
    FOREIGN KEY (offset_account_id) REFERENCES accounts(id),
    FOREIGN KEY (journal_entry_id) REFERENCES journal_entries(id)
);

CREATE TABLE IF NOT EXISTS open_items (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    legal_entity_id INTEGER NOT NULL,
    counterparty_id INTEGER NOT NULL,
    document_id INTEGER NOT NULL UNIQUE,
    direction TEXT NOT NULL,
    due_date TEXT NOT NULL,
    currency TEXT NOT NULL,
    original_amount REAL NOT NULL,
    residual_amount REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'OPEN',
    FOREIGN KEY (counterparty_id) REFERENCES counterparties(id),
    FOREIGN KEY (document_id) REFERENCES cari_documents(id)
);

CREATE TABLE IF NOT EXISTS settlement_batches (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    legal_entity_id INTEGER NOT NULL,
    book_id INTEGER NOT NULL,
    counterparty_id INTEGER NOT NULL,
    direction TEXT NOT NULL,
    settlement_date TEXT NOT NULL,
    cash_account_id INTEGER NOT NULL,
    total_amount REAL NOT NULL,
    journal_entry_id INTEGER,
    idempotency_key TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    created_by INTEGER,
    created_at TEXT DEFAULT (datetime('now')),
    UNIQUE (tenant_id, idempotency_key),
    FOREIGN KEY (counterparty_id) REFERENCES counterparties(id),
    FOREIGN KEY (cash_account_id) REFERENCES accounts(id),
    FOREIGN KEY (journal_entry_id) REFERENCES journal_entries(id)
);

CREATE TABLE IF NOT EXISTS settlement_allocations (
    id INTEGER PRIMARY KEY,
    batch_id INTEGER NOT NULL,
    open_item_id INTEGER NOT NULL,
    amount REAL NOT NULL,
    FOREIGN KEY (batch_id) REFERENCES settlement_batches(id),
    FOREIGN KEY (open_item_id) REFERENCES open_items(id)
);

CREATE TABLE IF NOT EXISTS bank_statement_imports (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    legal_entity_id INTEGER NOT NULL,
    bank_account_id INTEGER NOT NULL,
    filename TEXT NOT NULL,
    checksum TEXT NOT NULL,
    record_count INTEGER,
    date_range_start TEXT,
    date_range_end TEXT,
    imported_at TEXT DEFAULT (datetime('now')),
    UNIQUE (bank_account_id, checksum),
    FOREIGN KEY (bank_account_id) REFERENCES accounts(id)
);

CREATE TABLE IF NOT EXISTS bank_statement_lines (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    legal_entity_id INTEGER NOT NULL,
    bank_account_id INTEGER NOT NULL,
    import_id INTEGER,
    txn_date TEXT NOT NULL,
    description TEXT NOT NULL,
    amount REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'UNMATCHED',
    journal_entry_id INTEGER,
    action_idempotency_key TEXT,
    matched_at TEXT,
    UNIQUE (tenant_id, action_idempotency_key),
    FOREIGN KEY (bank_account_id) REFERENCES accounts(id),
    FOREIGN KEY (import_id) REFERENCES bank_statement_imports(id),
    FOREIGN KEY (journal_entry_id) REFERENCES journal_entries(id)
);

CREATE TABLE IF NOT EXISTS bank_rules (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    legal_entity_id INTEGER NOT NULL,
    pattern TEXT NOT NULL,
    match_type TEXT DEFAULT 'contains',
    counter_account_id INTEGER NOT NULL,
    priority INTEGER DEFAULT 0,
    hit_count INTEGER DEFAULT 0,
    is_active INTEGER DEFAULT 1,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (counter_account_id) REFERENCES accounts(id)
);

CREATE TABLE IF NOT EXISTS bank_reconciliations (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    book_id INTEGER NOT NULL,
    bank_account_id INTEGER NOT NULL,
    statement_date TEXT NOT NULL,
    statement_balance REAL NOT NULL,
    calculated_balance REAL NOT NULL,
    is_reconciled INTEGER DEFAULT 0,
    reconciled_at TEXT,
    created_by INTEGER,
    FOREIGN KEY (book_id) REFERENCES books(id),
    FOREIGN KEY (bank_account_id) REFERENCES accounts(id)
);

CREATE TABLE IF NOT EXISTS payroll_runs (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    legal_entity_id INTEGER NOT NULL,
    period_label TEXT NOT NULL,
    net_pay_total REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'CALCULATED',
    journal_entry_id INTEGER,
    journal_posted_at TEXT,
    FOREIGN KEY (journal_entry_id) REFERENCES journal_entries(id)
);

CREATE TABLE IF NOT EXISTS shareholder_commitments (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    legal_entity_id INTEGER NOT NULL,
    shareholder_name TEXT NOT NULL,
    committed_amount REAL NOT NULL,
    paid_amount REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'OPEN',
    last_journal_entry_id INTEGER,
    FOREIGN KEY (last_journal_entry_id) REFERENCES journal_entries(id)
);

CREATE TABLE IF NOT EXISTS audit_logs (
    id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    user_id INTEGER,
    action TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id INTEGER,
    request_id TEXT,
    payload TEXT,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_audit_logs_tenant ON audit_logs (tenant_id, created_at);
";

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Run `f` inside a `BEGIN IMMEDIATE` transaction: the write lock is taken up
/// front, so rows read inside `f` cannot change under it. Commits on `Ok`,
/// rolls back when the transaction is dropped on `Err`.
pub fn in_transaction<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}
