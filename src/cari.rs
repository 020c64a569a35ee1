//! Counterparty subledger: payment terms, counterparties, AR/AP documents
//! and their open items.

use chrono::Duration;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::accounts;
use crate::audit;
use crate::error::{AppError, Result};
use crate::idempotency;
use crate::journal::{self, NewJournal, NewLine};
use crate::models::{
    is_zero, round_amount, CounterpartyKind, Direction, DocumentStatus, JournalDetail,
    OpenItemStatus, Purpose, SourceType,
};
use crate::org;
use crate::periods::{parse_date, DATE_FORMAT};
use crate::posting;
use crate::purpose_accounts;
use crate::query::{paged, Page, Where};
use crate::scope::{assert_scope_access, perm, RequestContext};

pub const COUNTERPARTY_REF: &str = "COUNTERPARTY";
pub const DOCUMENT_REF: &str = "CARI_DOCUMENT";

impl Direction {
    pub fn control_purpose(&self) -> Purpose {
        match self {
            Direction::Ar => Purpose::ArControl,
            Direction::Ap => Purpose::ApControl,
        }
    }
}

impl CounterpartyKind {
    pub fn allows(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (CounterpartyKind::Both, _)
                | (CounterpartyKind::Customer, Direction::Ar)
                | (CounterpartyKind::Vendor, Direction::Ap)
        )
    }
}

// ---------------------------------------------------------------------------
// Payment terms
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PaymentTerm {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub due_days: i64,
    pub is_active: bool,
}

fn term_from_row(row: &Row) -> rusqlite::Result<PaymentTerm> {
    Ok(PaymentTerm {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        due_days: row.get(3)?,
        is_active: row.get(4)?,
    })
}

pub const DEFAULT_TERMS: &[(&str, &str, i64)] = &[
    ("NET0", "Due on receipt", 0),
    ("NET15", "Net 15 days", 15),
    ("NET30", "Net 30 days", 30),
    ("NET45", "Net 45 days", 45),
    ("NET60", "Net 60 days", 60),
    ("NET90", "Net 90 days", 90),
];

#[derive(Debug, Deserialize)]
pub struct NewPaymentTerm {
    pub code: String,
    pub name: String,
    pub due_days: i64,
}

fn term_exists(conn: &Connection, tenant_id: i64, code: &str) -> Result<bool> {
    Ok(conn
        .prepare("SELECT 1 FROM payment_terms WHERE tenant_id = ?1 AND code = ?2")?
        .exists(rusqlite::params![tenant_id, code])?)
}

fn load_term(conn: &Connection, tenant_id: i64, id: i64) -> Result<PaymentTerm> {
    conn.query_row(
        "SELECT id, code, name, due_days, is_active FROM payment_terms WHERE id = ?1 AND tenant_id = ?2",
        [id, tenant_id],
        term_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Payment term {id}")))
}

pub fn create_payment_term(
    conn: &Connection,
    ctx: &RequestContext,
    input: &NewPaymentTerm,
) -> Result<PaymentTerm> {
    ctx.require_permission(perm::CARI_WRITE)?;
    let code = input.code.trim().to_uppercase();
    if code.is_empty() {
        return Err(AppError::validation("Payment term code is required"));
    }
    if input.due_days < 0 {
        return Err(AppError::validation("due_days cannot be negative"));
    }
    if term_exists(conn, ctx.tenant_id, &code)? {
        return Err(AppError::conflict(format!("Payment term '{code}' already exists")));
    }
    conn.execute(
        "INSERT INTO payment_terms (tenant_id, code, name, due_days) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![ctx.tenant_id, code, input.name.trim(), input.due_days],
    )?;
    let id = conn.last_insert_rowid();
    audit::record(
        conn,
        ctx,
        "cari.payment_term.create",
        "payment_term",
        Some(id),
        serde_json::json!({ "code": code }),
    )?;
    load_term(conn, ctx.tenant_id, id)
}

pub fn list_payment_terms(conn: &Connection, ctx: &RequestContext) -> Result<Vec<PaymentTerm>> {
    ctx.require_permission(perm::CARI_READ)?;
    let mut stmt = conn.prepare(
        "SELECT id, code, name, due_days, is_active FROM payment_terms WHERE tenant_id = ?1 ORDER BY due_days, code",
    )?;
    let rows = stmt
        .query_map([ctx.tenant_id], term_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Serialize)]
pub struct BootstrapResult {
    pub created_count: usize,
    pub skipped_count: usize,
    pub terms: Vec<PaymentTerm>,
}

/// Seed the default NET terms, skipping codes that already exist.
pub fn bootstrap_payment_terms(conn: &Connection, ctx: &RequestContext) -> Result<BootstrapResult> {
    ctx.require_permission(perm::CARI_WRITE)?;
    let mut created_count = 0;
    let mut skipped_count = 0;
    for (code, name, due_days) in DEFAULT_TERMS {
        if term_exists(conn, ctx.tenant_id, code)? {
            skipped_count += 1;
            continue;
        }
        conn.execute(
            "INSERT INTO payment_terms (tenant_id, code, name, due_days) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![ctx.tenant_id, code, name, due_days],
        )?;
        created_count += 1;
    }
    if created_count > 0 {
        audit::record(
            conn,
            ctx,
            "cari.payment_term.bootstrap",
            "payment_term",
            None,
            serde_json::json!({ "created": created_count, "skipped": skipped_count }),
        )?;
        tracing::info!(created_count, skipped_count, "payment terms bootstrapped");
    } else {
        tracing::debug!(skipped_count, "payment term bootstrap skipped");
    }
    Ok(BootstrapResult {
        created_count,
        skipped_count,
        terms: list_payment_terms(conn, ctx)?,
    })
}

// ---------------------------------------------------------------------------
// Counterparties
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Counterparty {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub kind: CounterpartyKind,
    pub tax_id: Option<String>,
    pub payment_term_id: Option<i64>,
    pub is_active: bool,
    pub created_at: String,
}

const COUNTERPARTY_COLUMNS: &str = "id, code, name, kind, tax_id, payment_term_id, is_active, created_at";

fn counterparty_from_row(row: &Row) -> rusqlite::Result<Counterparty> {
    Ok(Counterparty {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        kind: row.get(3)?,
        tax_id: row.get(4)?,
        payment_term_id: row.get(5)?,
        is_active: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub fn load_counterparty(conn: &Connection, tenant_id: i64, id: i64) -> Result<Counterparty> {
    conn.query_row(
        &format!(
            "SELECT {COUNTERPARTY_COLUMNS} FROM counterparties WHERE id = ?1 AND tenant_id = ?2"
        ),
        [id, tenant_id],
        counterparty_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Counterparty {id}")))
}

#[derive(Debug, Deserialize)]
pub struct NewCounterparty {
    pub code: String,
    pub name: String,
    pub kind: CounterpartyKind,
    pub tax_id: Option<String>,
    pub payment_term_id: Option<i64>,
}

pub fn create_counterparty(
    conn: &Connection,
    ctx: &RequestContext,
    input: &NewCounterparty,
) -> Result<Counterparty> {
    ctx.require_permission(perm::CARI_WRITE)?;
    let code = input.code.trim();
    if code.is_empty() || input.name.trim().is_empty() {
        return Err(AppError::validation("Counterparty code and name are required"));
    }
    if let Some(term_id) = input.payment_term_id {
        load_term(conn, ctx.tenant_id, term_id)?;
    }
    let exists = conn
        .prepare("SELECT 1 FROM counterparties WHERE tenant_id = ?1 AND code = ?2")?
        .exists(rusqlite::params![ctx.tenant_id, code])?;
    if exists {
        return Err(AppError::conflict(format!("Counterparty '{code}' already exists")));
    }
    conn.execute(
        "INSERT INTO counterparties (tenant_id, code, name, kind, tax_id, payment_term_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            ctx.tenant_id,
            code,
            input.name.trim(),
            input.kind,
            input.tax_id,
            input.payment_term_id,
        ],
    )?;
    let id = conn.last_insert_rowid();
    audit::record(
        conn,
        ctx,
        "cari.counterparty.create",
        "counterparty",
        Some(id),
        serde_json::json!({ "code": code, "kind": input.kind }),
    )?;
    load_counterparty(conn, ctx.tenant_id, id)
}

#[derive(Debug, Default, Deserialize)]
pub struct CounterpartyFilter {
    pub kind: Option<CounterpartyKind>,
}

pub fn list_counterparties(
    conn: &Connection,
    ctx: &RequestContext,
    filter: &CounterpartyFilter,
    page: Page,
) -> Result<Vec<Counterparty>> {
    ctx.require_permission(perm::CARI_READ)?;
    let w = Where::new()
        .eq("tenant_id", ctx.tenant_id)
        .eq_opt("kind", filter.kind.map(|k| k.as_str().to_string()));
    let (tail, params) = paged(&w, page);
    let sql = format!(
        "SELECT {COUNTERPARTY_COLUMNS} FROM counterparties{} ORDER BY code{tail}",
        w.sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), counterparty_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_counterparty(conn: &Connection, ctx: &RequestContext, id: i64) -> Result<Counterparty> {
    ctx.require_permission(perm::CARI_READ)?;
    load_counterparty(conn, ctx.tenant_id, id)
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CariDocument {
    pub id: i64,
    pub legal_entity_id: i64,
    pub book_id: i64,
    pub counterparty_id: i64,
    pub direction: Direction,
    pub document_no: String,
    pub document_date: String,
    pub due_date: String,
    pub currency: String,
    pub amount: f64,
    pub offset_account_id: i64,
    pub description: Option<String>,
    pub status: DocumentStatus,
    pub journal_entry_id: Option<i64>,
    pub idempotency_key: Option<String>,
    pub created_at: String,
}

const DOCUMENT_COLUMNS: &str = "id, legal_entity_id, book_id, counterparty_id, direction, document_no, document_date, \
     due_date, currency, amount, offset_account_id, description, status, journal_entry_id, idempotency_key, created_at";

fn document_from_row(row: &Row) -> rusqlite::Result<CariDocument> {
    Ok(CariDocument {
        id: row.get(0)?,
        legal_entity_id: row.get(1)?,
        book_id: row.get(2)?,
        counterparty_id: row.get(3)?,
        direction: row.get(4)?,
        document_no: row.get(5)?,
        document_date: row.get(6)?,
        due_date: row.get(7)?,
        currency: row.get(8)?,
        amount: row.get(9)?,
        offset_account_id: row.get(10)?,
        description: row.get(11)?,
        status: row.get(12)?,
        journal_entry_id: row.get(13)?,
        idempotency_key: row.get(14)?,
        created_at: row.get(15)?,
    })
}

pub fn load_document(conn: &Connection, tenant_id: i64, id: i64) -> Result<CariDocument> {
    conn.query_row(
        &format!("SELECT {DOCUMENT_COLUMNS} FROM cari_documents WHERE id = ?1 AND tenant_id = ?2"),
        [id, tenant_id],
        document_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Document {id}")))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewDocument {
    pub legal_entity_id: i64,
    pub book_id: i64,
    pub counterparty_id: i64,
    pub direction: Direction,
    pub document_no: String,
    pub document_date: String,
    /// Defaults to the document date plus the counterparty's payment term.
    pub due_date: Option<String>,
    pub currency: Option<String>,
    pub amount: f64,
    pub offset_account_id: i64,
    pub description: Option<String>,
    #[serde(skip_serializing)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DocumentView {
    #[serde(flatten)]
    pub document: CariDocument,
    pub idempotent_replay: bool,
}

fn due_date_for(
    conn: &Connection,
    tenant_id: i64,
    counterparty: &Counterparty,
    document_date: &str,
) -> Result<String> {
    let due_days = match counterparty.payment_term_id {
        Some(term_id) => load_term(conn, tenant_id, term_id)?.due_days,
        None => 0,
    };
    Ok((parse_date(document_date)? + Duration::days(due_days))
        .format(DATE_FORMAT)
        .to_string())
}

/// Create a DRAFT document. The same key with the same payload replays the
/// stored row; a different payload under the key is rejected.
pub fn create_document(
    conn: &Connection,
    ctx: &RequestContext,
    input: &NewDocument,
) -> Result<DocumentView> {
    ctx.require_permission(perm::CARI_WRITE)?;
    let key = idempotency::normalize_key(input.idempotency_key.as_deref())?;
    let hash = idempotency::payload_hash(input)?;
    if let Some(key) = &key {
        let existing: Option<(i64, Option<String>)> = conn
            .query_row(
                "SELECT id, payload_hash FROM cari_documents WHERE tenant_id = ?1 AND idempotency_key = ?2",
                rusqlite::params![ctx.tenant_id, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((id, stored)) = existing {
            idempotency::check_replay(key, stored.as_deref(), &hash)?;
            let document = load_document(conn, ctx.tenant_id, id)?;
            assert_scope_access(conn, ctx, document.legal_entity_id)?;
            tracing::debug!(document_id = id, key = %key, "document create replayed");
            return Ok(DocumentView {
                document,
                idempotent_replay: true,
            });
        }
    }

    assert_scope_access(conn, ctx, input.legal_entity_id)?;
    let book = org::load_book(conn, ctx.tenant_id, input.book_id)?;
    if book.legal_entity_id != input.legal_entity_id {
        return Err(AppError::validation("Book belongs to another legal entity"));
    }
    let counterparty = load_counterparty(conn, ctx.tenant_id, input.counterparty_id)?;
    if !counterparty.is_active {
        return Err(AppError::validation(format!("Counterparty {} is inactive", counterparty.code)));
    }
    if !counterparty.kind.allows(input.direction) {
        return Err(AppError::validation(format!(
            "Counterparty {} is a {} and cannot carry {} documents",
            counterparty.code, counterparty.kind, input.direction
        )));
    }
    let document_no = input.document_no.trim();
    if document_no.is_empty() {
        return Err(AppError::validation("document_no is required"));
    }
    if !input.amount.is_finite() || input.amount <= 0.0 || is_zero(input.amount) {
        return Err(AppError::validation("amount must be positive"));
    }
    let document_date = parse_date(&input.document_date)?.format(DATE_FORMAT).to_string();
    let due_date = match &input.due_date {
        Some(raw) => parse_date(raw)?.format(DATE_FORMAT).to_string(),
        None => due_date_for(conn, ctx.tenant_id, &counterparty, &document_date)?,
    };
    if due_date < document_date {
        return Err(AppError::validation("due_date cannot precede document_date"));
    }
    let offset = accounts::load_account(conn, ctx.tenant_id, input.offset_account_id)?;
    offset
        .check_postable(input.legal_entity_id)
        .map_err(|reason| AppError::validation(format!("Offset {reason}")))?;
    let currency = match &input.currency {
        Some(c) => {
            org::validate_currency(c)?;
            c.to_uppercase()
        }
        None => book.base_currency.clone(),
    };
    let duplicate = conn
        .prepare(
            "SELECT 1 FROM cari_documents WHERE tenant_id = ?1 AND counterparty_id = ?2 AND direction = ?3 \
             AND document_no = ?4 AND status != 'CANCELLED'",
        )?
        .exists(rusqlite::params![ctx.tenant_id, counterparty.id, input.direction, document_no])?;
    if duplicate {
        return Err(AppError::conflict(format!(
            "Document {document_no} already exists for counterparty {}",
            counterparty.code
        )));
    }

    conn.execute(
        "INSERT INTO cari_documents (tenant_id, legal_entity_id, book_id, counterparty_id, direction, document_no, \
         document_date, due_date, currency, amount, offset_account_id, description, idempotency_key, payload_hash, created_by) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        rusqlite::params![
            ctx.tenant_id,
            input.legal_entity_id,
            book.id,
            counterparty.id,
            input.direction,
            document_no,
            document_date,
            due_date,
            currency,
            round_amount(input.amount),
            offset.id,
            input.description,
            key,
            hash,
            ctx.user_id,
        ],
    )?;
    let id = conn.last_insert_rowid();
    audit::record(
        conn,
        ctx,
        "cari.document.create",
        "cari_document",
        Some(id),
        serde_json::json!({
            "document_no": document_no,
            "direction": input.direction,
            "amount": input.amount,
            "counterparty_id": counterparty.id,
        }),
    )?;
    Ok(DocumentView {
        document: load_document(conn, ctx.tenant_id, id)?,
        idempotent_replay: false,
    })
}

#[derive(Debug, Serialize)]
pub struct PostedDocument {
    pub document: CariDocument,
    pub open_item: OpenItem,
    pub journal: JournalDetail,
}

/// DRAFT → POSTED: book the control-account journal and open an item for the
/// full amount.
pub fn post_document(conn: &Connection, ctx: &RequestContext, id: i64) -> Result<PostedDocument> {
    ctx.require_permission(perm::CARI_POST)?;
    let document = load_document(conn, ctx.tenant_id, id)?;
    assert_scope_access(conn, ctx, document.legal_entity_id)?;
    if document.status != DocumentStatus::Draft {
        return Err(AppError::conflict(format!(
            "Document {} is {}; only DRAFT documents can be posted",
            document.document_no, document.status
        )));
    }
    let control = purpose_accounts::require(
        conn,
        ctx.tenant_id,
        document.legal_entity_id,
        document.direction.control_purpose(),
    )?;
    let control_line = |line: NewLine| line.subledger(COUNTERPARTY_REF, document.counterparty_id);
    let lines = match document.direction {
        Direction::Ar => vec![
            control_line(NewLine::debit(control.id, document.amount)),
            NewLine::credit(document.offset_account_id, document.amount),
        ],
        Direction::Ap => vec![
            NewLine::debit(document.offset_account_id, document.amount),
            control_line(NewLine::credit(control.id, document.amount)),
        ],
    };
    let book = org::load_book(conn, ctx.tenant_id, document.book_id)?;
    let mut input = NewJournal::system(&book, None, &document.document_date, SourceType::System)
        .source(DOCUMENT_REF, document.id)
        .describe(
            document
                .description
                .clone()
                .unwrap_or_else(|| format!("{} {}", document.direction, document.document_no)),
        )
        .lines(lines);
    input.document_date = Some(document.document_date.clone());
    input.currency = Some(document.currency.clone());
    let journal_id = journal::create_internal(conn, ctx, &input)?;
    posting::post_internal(conn, ctx, journal_id)?;

    let updated = conn.execute(
        "UPDATE cari_documents SET status = 'POSTED', journal_entry_id = ?1 WHERE id = ?2 AND status = 'DRAFT'",
        [journal_id, id],
    )?;
    if updated == 0 {
        return Err(AppError::conflict(format!(
            "Document {} was posted concurrently",
            document.document_no
        )));
    }
    conn.execute(
        "INSERT INTO open_items (tenant_id, legal_entity_id, counterparty_id, document_id, direction, due_date, currency, \
         original_amount, residual_amount) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        rusqlite::params![
            ctx.tenant_id,
            document.legal_entity_id,
            document.counterparty_id,
            document.id,
            document.direction,
            document.due_date,
            document.currency,
            document.amount,
        ],
    )?;
    let open_item_id = conn.last_insert_rowid();
    audit::record(
        conn,
        ctx,
        "cari.document.post",
        "cari_document",
        Some(id),
        serde_json::json!({ "journal_id": journal_id, "open_item_id": open_item_id }),
    )?;
    tracing::info!(
        document_id = id,
        journal_id,
        open_item_id,
        direction = %document.direction,
        "document posted"
    );
    Ok(PostedDocument {
        document: load_document(conn, ctx.tenant_id, id)?,
        open_item: load_open_item(conn, ctx.tenant_id, open_item_id)?,
        journal: journal::load_detail(conn, ctx.tenant_id, journal_id)?,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct DocumentFilter {
    pub legal_entity_id: Option<i64>,
    pub counterparty_id: Option<i64>,
    pub direction: Option<Direction>,
    pub status: Option<DocumentStatus>,
}

pub fn list_documents(
    conn: &Connection,
    ctx: &RequestContext,
    filter: &DocumentFilter,
    page: Page,
) -> Result<Vec<CariDocument>> {
    ctx.require_permission(perm::CARI_READ)?;
    let mut w = Where::new()
        .eq("tenant_id", ctx.tenant_id)
        .eq_opt("legal_entity_id", filter.legal_entity_id)
        .eq_opt("counterparty_id", filter.counterparty_id)
        .eq_opt("direction", filter.direction.map(|d| d.as_str().to_string()))
        .eq_opt("status", filter.status.map(|s| s.as_str().to_string()));
    if let Some(ids) = ctx.scoped_ids() {
        w = w.in_ids("legal_entity_id", &ids);
    }
    let (tail, params) = paged(&w, page);
    let sql = format!(
        "SELECT {DOCUMENT_COLUMNS} FROM cari_documents{} ORDER BY document_date DESC, id DESC{tail}",
        w.sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), document_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Open items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct OpenItem {
    pub id: i64,
    pub legal_entity_id: i64,
    pub counterparty_id: i64,
    pub document_id: i64,
    pub document_no: String,
    pub direction: Direction,
    pub due_date: String,
    pub currency: String,
    pub original_amount: f64,
    pub residual_amount: f64,
    pub status: OpenItemStatus,
}

const OPEN_ITEM_COLUMNS: &str = "o.id, o.legal_entity_id, o.counterparty_id, o.document_id, d.document_no, o.direction, \
     o.due_date, o.currency, o.original_amount, o.residual_amount, o.status";

fn open_item_from_row(row: &Row) -> rusqlite::Result<OpenItem> {
    Ok(OpenItem {
        id: row.get(0)?,
        legal_entity_id: row.get(1)?,
        counterparty_id: row.get(2)?,
        document_id: row.get(3)?,
        document_no: row.get(4)?,
        direction: row.get(5)?,
        due_date: row.get(6)?,
        currency: row.get(7)?,
        original_amount: row.get(8)?,
        residual_amount: row.get(9)?,
        status: row.get(10)?,
    })
}

pub fn load_open_item(conn: &Connection, tenant_id: i64, id: i64) -> Result<OpenItem> {
    conn.query_row(
        &format!(
            "SELECT {OPEN_ITEM_COLUMNS} FROM open_items o JOIN cari_documents d ON d.id = o.document_id \
             WHERE o.id = ?1 AND o.tenant_id = ?2"
        ),
        [id, tenant_id],
        open_item_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Open item {id}")))
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenItemFilter {
    pub legal_entity_id: Option<i64>,
    pub counterparty_id: Option<i64>,
    pub direction: Option<Direction>,
    pub status: Option<OpenItemStatus>,
    pub due_before: Option<String>,
}

pub fn list_open_items(
    conn: &Connection,
    ctx: &RequestContext,
    filter: &OpenItemFilter,
    page: Page,
) -> Result<Vec<OpenItem>> {
    ctx.require_permission(perm::CARI_READ)?;
    let mut w = Where::new()
        .eq("o.tenant_id", ctx.tenant_id)
        .eq_opt("o.legal_entity_id", filter.legal_entity_id)
        .eq_opt("o.counterparty_id", filter.counterparty_id)
        .eq_opt("o.direction", filter.direction.map(|d| d.as_str().to_string()))
        .eq_opt("o.status", filter.status.map(|s| s.as_str().to_string()))
        .lte_opt("o.due_date", filter.due_before.clone());
    if let Some(ids) = ctx.scoped_ids() {
        w = w.in_ids("o.legal_entity_id", &ids);
    }
    let (tail, params) = paged(&w, page);
    let sql = format!(
        "SELECT {OPEN_ITEM_COLUMNS} FROM open_items o JOIN cari_documents d ON d.id = o.document_id{} \
         ORDER BY o.due_date, o.id{tail}",
        w.sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), open_item_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::JournalStatus;
    use crate::test_support::{fixture, Fixture};

    pub(crate) fn customer(conn: &Connection, fx: &Fixture, code: &str) -> Counterparty {
        create_counterparty(
            conn,
            &fx.ctx,
            &NewCounterparty {
                code: code.into(),
                name: format!("Customer {code}"),
                kind: CounterpartyKind::Customer,
                tax_id: None,
                payment_term_id: None,
            },
        )
        .unwrap()
    }

    pub(crate) fn invoice(
        fx: &Fixture,
        counterparty_id: i64,
        no: &str,
        amount: f64,
    ) -> NewDocument {
        NewDocument {
            legal_entity_id: fx.le_id,
            book_id: fx.book_id,
            counterparty_id,
            direction: Direction::Ar,
            document_no: no.into(),
            document_date: "2025-03-01".into(),
            due_date: None,
            currency: None,
            amount,
            offset_account_id: fx.revenue,
            description: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn test_bootstrap_terms_is_idempotent() {
        let (_dir, conn, fx) = fixture();
        let first = bootstrap_payment_terms(&conn, &fx.ctx).unwrap();
        assert_eq!(first.created_count, 6);
        assert_eq!(first.skipped_count, 0);
        let second = bootstrap_payment_terms(&conn, &fx.ctx).unwrap();
        assert_eq!(second.created_count, 0);
        assert_eq!(second.skipped_count, 6);
        assert_eq!(second.terms.len(), 6);
        assert_eq!(second.terms[0].code, "NET0");
    }

    #[test]
    fn test_duplicate_counterparty_code() {
        let (_dir, conn, fx) = fixture();
        customer(&conn, &fx, "ACME");
        let err = create_counterparty(
            &conn,
            &fx.ctx,
            &NewCounterparty {
                code: "ACME".into(),
                name: "Again".into(),
                kind: CounterpartyKind::Vendor,
                tax_id: None,
                payment_term_id: None,
            },
        )
        .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_due_date_from_payment_term() {
        let (_dir, conn, fx) = fixture();
        let terms = bootstrap_payment_terms(&conn, &fx.ctx).unwrap().terms;
        let net30 = terms.iter().find(|t| t.code == "NET30").unwrap();
        let cp = create_counterparty(
            &conn,
            &fx.ctx,
            &NewCounterparty {
                code: "ACME".into(),
                name: "Acme".into(),
                kind: CounterpartyKind::Both,
                tax_id: None,
                payment_term_id: Some(net30.id),
            },
        )
        .unwrap();
        let doc = create_document(&conn, &fx.ctx, &invoice(&fx, cp.id, "INV-1", 100.0)).unwrap();
        assert_eq!(doc.document.due_date, "2025-03-31");
        assert_eq!(doc.document.status, DocumentStatus::Draft);
        assert_eq!(doc.document.currency, "USD");
    }

    #[test]
    fn test_document_idempotency() {
        let (_dir, conn, fx) = fixture();
        let cp = customer(&conn, &fx, "ACME");
        let mut input = invoice(&fx, cp.id, "INV-1", 100.0);
        input.idempotency_key = Some("doc-1".into());
        let first = create_document(&conn, &fx.ctx, &input).unwrap();
        let replay = create_document(&conn, &fx.ctx, &input).unwrap();
        assert!(replay.idempotent_replay);
        assert_eq!(replay.document.id, first.document.id);

        input.amount = 120.0;
        let err = create_document(&conn, &fx.ctx, &input).unwrap_err();
        assert_eq!(err.code(), "IDEMPOTENCY_KEY_REUSED");
        let docs = list_documents(&conn, &fx.ctx, &DocumentFilter::default(), Page::default())
            .unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn test_kind_must_match_direction() {
        let (_dir, conn, fx) = fixture();
        let cp = customer(&conn, &fx, "ACME");
        let mut input = invoice(&fx, cp.id, "BILL-1", 50.0);
        input.direction = Direction::Ap;
        input.offset_account_id = fx.expense;
        let err = create_document(&conn, &fx.ctx, &input).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_post_ar_document_opens_item() {
        let (_dir, conn, fx) = fixture();
        let cp = customer(&conn, &fx, "ACME");
        let id = create_document(&conn, &fx.ctx, &invoice(&fx, cp.id, "INV-1", 100.0))
            .unwrap()
            .document
            .id;
        let posted = post_document(&conn, &fx.ctx, id).unwrap();
        assert_eq!(posted.document.status, DocumentStatus::Posted);
        assert_eq!(posted.journal.entry.status, JournalStatus::Posted);
        assert_eq!(posted.journal.entry.source_type, SourceType::System);
        let control = posted.journal.lines.iter().find(|l| l.debit_base > 0.0).unwrap();
        assert_eq!(control.account_id, fx.receivables);
        assert_eq!(control.subledger_ref_type.as_deref(), Some(COUNTERPARTY_REF));
        assert_eq!(control.subledger_ref_id, Some(cp.id));
        assert_eq!(posted.open_item.residual_amount, 100.0);
        assert_eq!(posted.open_item.status, OpenItemStatus::Open);
        assert_eq!(posted.open_item.document_no, "INV-1");

        let err = post_document(&conn, &fx.ctx, id).unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_post_ap_document_credits_control() {
        let (_dir, conn, fx) = fixture();
        let vendor = create_counterparty(
            &conn,
            &fx.ctx,
            &NewCounterparty {
                code: "SUPPLY".into(),
                name: "Supplier".into(),
                kind: CounterpartyKind::Vendor,
                tax_id: None,
                payment_term_id: None,
            },
        )
        .unwrap();
        let mut input = invoice(&fx, vendor.id, "BILL-1", 60.0);
        input.direction = Direction::Ap;
        input.offset_account_id = fx.expense;
        let id = create_document(&conn, &fx.ctx, &input).unwrap().document.id;
        let posted = post_document(&conn, &fx.ctx, id).unwrap();
        let credit = posted.journal.lines.iter().find(|l| l.credit_base > 0.0).unwrap();
        assert_eq!(credit.account_id, fx.payables);
        let items = list_open_items(
            &conn,
            &fx.ctx,
            &OpenItemFilter { direction: Some(Direction::Ap), ..OpenItemFilter::default() },
            Page::default(),
        )
        .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].counterparty_id, vendor.id);
    }
}
