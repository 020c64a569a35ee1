//! Bank statement import, matching rules, and attaching/applying statement
//! lines to the ledger.

use regex::Regex;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::accounts;
use crate::audit;
use crate::error::{AppError, Result};
use crate::idempotency;
use crate::journal::{self, NewJournal, NewLine};
use crate::models::{
    is_zero, round_amount, Account, AccountType, BankLineStatus, JournalStatus, MatchType,
    SourceType,
};
use crate::org;
use crate::periods::{parse_date, DATE_FORMAT};
use crate::posting;
use crate::query::{paged, Page, Where};
use crate::scope::{assert_scope_access, perm, RequestContext};

pub const STATEMENT_LINE_REF: &str = "BANK_STATEMENT_LINE";
pub const DEFAULT_BOOK_TYPE: &str = "LOCAL";

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a statement amount: thousands separators and `$` are ignored and
/// `(12.50)` is negative.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let s = raw.replace([',', '"', '$'], "");
    let s = s.trim();
    if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        return inner.trim().parse::<f64>().ok().map(|v| -v);
    }
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// `MM/DD/YYYY` or ISO `YYYY-MM-DD`, normalized to ISO.
pub fn parse_statement_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.contains('/') {
        let parts: Vec<&str> = raw.split('/').collect();
        if parts.len() != 3 {
            return None;
        }
        let m: u32 = parts[0].parse().ok()?;
        let d: u32 = parts[1].parse().ok()?;
        let y: i32 = parts[2].parse().ok()?;
        return chrono::NaiveDate::from_ymd_opt(y, m, d)
            .map(|dt| dt.format(DATE_FORMAT).to_string());
    }
    parse_date(raw).ok().map(|dt| dt.format(DATE_FORMAT).to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub date: String,
    pub description: String,
    pub amount: f64,
}

/// Parse `date,description,amount` rows. A leading header row is skipped;
/// errors carry the 1-based row number.
pub fn parse_statement(content: &str) -> Result<Vec<ParsedLine>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());
    let mut rows = Vec::new();
    for (i, result) in rdr.records().enumerate() {
        let n = i + 1;
        let record = result?;
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        if n == 1 && record.get(0).is_some_and(|f| f.eq_ignore_ascii_case("date")) {
            continue;
        }
        if record.len() < 3 {
            return Err(AppError::line(n, "expected date, description and amount"));
        }
        let date = parse_statement_date(&record[0])
            .ok_or_else(|| AppError::line(n, format!("invalid date '{}'", &record[0])))?;
        let description = record[1].to_string();
        if description.is_empty() {
            return Err(AppError::line(n, "description is empty"));
        }
        let amount = parse_amount(&record[2])
            .ok_or_else(|| AppError::line(n, format!("invalid amount '{}'", &record[2])))?;
        rows.push(ParsedLine {
            date,
            description,
            amount: round_amount(amount),
        });
    }
    Ok(rows)
}

fn compute_checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn is_duplicate_line(conn: &Connection, bank_account_id: i64, line: &ParsedLine) -> Result<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT 1 FROM bank_statement_lines WHERE bank_account_id = ?1 AND txn_date = ?2 AND amount = ?3 AND description = ?4",
    )?;
    Ok(stmt.exists(rusqlite::params![bank_account_id, line.date, line.amount, line.description])?)
}

fn bank_account(
    conn: &Connection,
    ctx: &RequestContext,
    legal_entity_id: i64,
    account_id: i64,
) -> Result<Account> {
    let account = accounts::load_account(conn, ctx.tenant_id, account_id)?;
    account
        .check_postable(legal_entity_id)
        .map_err(|reason| AppError::validation(format!("Bank {reason}")))?;
    if account.account_type != AccountType::Asset {
        return Err(AppError::validation(format!(
            "Bank account {} must be an ASSET account",
            account.code
        )));
    }
    Ok(account)
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ImportInput {
    pub legal_entity_id: i64,
    pub bank_account_id: i64,
    pub filename: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ImportResult {
    pub import_id: Option<i64>,
    pub imported: usize,
    pub skipped: usize,
    pub duplicate_file: bool,
}

pub fn import_statement(
    conn: &Connection,
    ctx: &RequestContext,
    input: &ImportInput,
) -> Result<ImportResult> {
    ctx.require_permission(perm::BANK_WRITE)?;
    assert_scope_access(conn, ctx, input.legal_entity_id)?;
    let account = bank_account(conn, ctx, input.legal_entity_id, input.bank_account_id)?;

    let checksum = compute_checksum(&input.content);
    let seen = conn
        .prepare(
            "SELECT 1 FROM bank_statement_imports WHERE bank_account_id = ?1 AND checksum = ?2",
        )?
        .exists(rusqlite::params![account.id, checksum])?;
    if seen {
        tracing::debug!(
            account = %account.code,
            filename = %input.filename,
            "statement already imported"
        );
        return Ok(ImportResult {
            import_id: None,
            imported: 0,
            skipped: 0,
            duplicate_file: true,
        });
    }

    let parsed = parse_statement(&input.content)?;
    let min_date = parsed.iter().map(|r| r.date.as_str()).min();
    let max_date = parsed.iter().map(|r| r.date.as_str()).max();
    conn.execute(
        "INSERT INTO bank_statement_imports (tenant_id, legal_entity_id, bank_account_id, filename, checksum, \
         record_count, date_range_start, date_range_end) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            ctx.tenant_id,
            input.legal_entity_id,
            account.id,
            input.filename,
            checksum,
            parsed.len() as i64,
            min_date,
            max_date,
        ],
    )?;
    let import_id = conn.last_insert_rowid();

    let mut imported = 0usize;
    let mut skipped = 0usize;
    for line in &parsed {
        if is_duplicate_line(conn, account.id, line)? {
            skipped += 1;
            continue;
        }
        conn.execute(
            "INSERT INTO bank_statement_lines (tenant_id, legal_entity_id, bank_account_id, import_id, txn_date, \
             description, amount) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                ctx.tenant_id,
                input.legal_entity_id,
                account.id,
                import_id,
                line.date,
                line.description,
                line.amount,
            ],
        )?;
        imported += 1;
    }
    audit::record(
        conn,
        ctx,
        "bank.import",
        "bank_statement_import",
        Some(import_id),
        serde_json::json!({ "filename": input.filename, "imported": imported, "skipped": skipped }),
    )?;
    tracing::info!(
        import_id,
        account = %account.code,
        imported,
        skipped,
        "bank statement imported"
    );
    Ok(ImportResult {
        import_id: Some(import_id),
        imported,
        skipped,
        duplicate_file: false,
    })
}

// ---------------------------------------------------------------------------
// Statement lines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatementLine {
    pub id: i64,
    pub legal_entity_id: i64,
    pub bank_account_id: i64,
    pub import_id: Option<i64>,
    pub txn_date: String,
    pub description: String,
    pub amount: f64,
    pub status: BankLineStatus,
    pub journal_entry_id: Option<i64>,
    pub action_idempotency_key: Option<String>,
    pub matched_at: Option<String>,
}

const LINE_COLUMNS: &str = "id, legal_entity_id, bank_account_id, import_id, txn_date, description, amount, status, \
     journal_entry_id, action_idempotency_key, matched_at";

fn line_from_row(row: &Row) -> rusqlite::Result<StatementLine> {
    Ok(StatementLine {
        id: row.get(0)?,
        legal_entity_id: row.get(1)?,
        bank_account_id: row.get(2)?,
        import_id: row.get(3)?,
        txn_date: row.get(4)?,
        description: row.get(5)?,
        amount: row.get(6)?,
        status: row.get(7)?,
        journal_entry_id: row.get(8)?,
        action_idempotency_key: row.get(9)?,
        matched_at: row.get(10)?,
    })
}

pub fn load_line(conn: &Connection, tenant_id: i64, id: i64) -> Result<StatementLine> {
    conn.query_row(
        &format!(
            "SELECT {LINE_COLUMNS} FROM bank_statement_lines WHERE id = ?1 AND tenant_id = ?2"
        ),
        [id, tenant_id],
        line_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Statement line {id}")))
}

#[derive(Debug, Default, Deserialize)]
pub struct LineFilter {
    pub legal_entity_id: Option<i64>,
    pub bank_account_id: Option<i64>,
    pub status: Option<BankLineStatus>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

pub fn list_lines(
    conn: &Connection,
    ctx: &RequestContext,
    filter: &LineFilter,
    page: Page,
) -> Result<Vec<StatementLine>> {
    ctx.require_permission(perm::BANK_READ)?;
    let mut w = Where::new()
        .eq("tenant_id", ctx.tenant_id)
        .eq_opt("legal_entity_id", filter.legal_entity_id)
        .eq_opt("bank_account_id", filter.bank_account_id)
        .eq_opt("status", filter.status.map(|s| s.as_str().to_string()))
        .gte_opt("txn_date", filter.date_from.clone())
        .lte_opt("txn_date", filter.date_to.clone());
    if let Some(ids) = ctx.scoped_ids() {
        w = w.in_ids("legal_entity_id", &ids);
    }
    let (tail, params) = paged(&w, page);
    let sql = format!(
        "SELECT {LINE_COLUMNS} FROM bank_statement_lines{} ORDER BY txn_date, id{tail}",
        w.sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), line_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Serialize)]
pub struct LineAction {
    pub line: StatementLine,
    pub idempotent_replay: bool,
}

/// Look up an earlier action under `key`. The key is bound to one line;
/// reusing it for another line is a mismatch.
fn replayed(
    conn: &Connection,
    ctx: &RequestContext,
    line_id: i64,
    key: &str,
) -> Result<Option<LineAction>> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM bank_statement_lines WHERE tenant_id = ?1 AND action_idempotency_key = ?2",
            rusqlite::params![ctx.tenant_id, key],
            |row| row.get(0),
        )
        .optional()?;
    match found {
        None => Ok(None),
        Some(id) if id == line_id => {
            tracing::debug!(line_id, key, "statement line action replayed");
            Ok(Some(LineAction {
                line: load_line(conn, ctx.tenant_id, id)?,
                idempotent_replay: true,
            }))
        }
        Some(_) => Err(AppError::IdempotencyMismatch(key.to_string())),
    }
}

fn unmatched_line(conn: &Connection, ctx: &RequestContext, line_id: i64) -> Result<StatementLine> {
    let line = load_line(conn, ctx.tenant_id, line_id)?;
    assert_scope_access(conn, ctx, line.legal_entity_id)?;
    if line.status != BankLineStatus::Unmatched {
        return Err(AppError::conflict(format!(
            "Statement line {line_id} is already {}",
            line.status
        )));
    }
    Ok(line)
}

#[derive(Debug, Deserialize)]
pub struct AttachInput {
    pub journal_entry_id: i64,
    pub idempotency_key: Option<String>,
}

/// Link an UNMATCHED line to a POSTED journal that touches its bank account.
pub fn attach(
    conn: &Connection,
    ctx: &RequestContext,
    line_id: i64,
    input: &AttachInput,
) -> Result<LineAction> {
    ctx.require_permission(perm::BANK_WRITE)?;
    let key = idempotency::require_key(input.idempotency_key.as_deref())?;
    if let Some(replay) = replayed(conn, ctx, line_id, &key)? {
        return Ok(replay);
    }
    let line = unmatched_line(conn, ctx, line_id)?;
    let journal = journal::load_entry(conn, ctx.tenant_id, input.journal_entry_id)?;
    if journal.legal_entity_id != line.legal_entity_id {
        return Err(AppError::validation("Journal belongs to another legal entity"));
    }
    if journal.status != JournalStatus::Posted {
        return Err(AppError::validation(format!(
            "Journal {} is {}; only POSTED journals can be attached",
            journal.journal_no, journal.status
        )));
    }
    let touches = conn
        .prepare("SELECT 1 FROM journal_lines WHERE journal_entry_id = ?1 AND account_id = ?2")?
        .exists([journal.id, line.bank_account_id])?;
    if !touches {
        return Err(AppError::validation(format!(
            "Journal {} does not touch the statement's bank account",
            journal.journal_no
        )));
    }
    mark(conn, line.id, BankLineStatus::Attached, journal.id, &key)?;
    audit::record(
        conn,
        ctx,
        "bank.line.attach",
        "bank_statement_line",
        Some(line.id),
        serde_json::json!({ "journal_id": journal.id }),
    )?;
    tracing::info!(line_id = line.id, journal_id = journal.id, "statement line attached");
    Ok(LineAction {
        line: load_line(conn, ctx.tenant_id, line.id)?,
        idempotent_replay: false,
    })
}

fn mark(
    conn: &Connection,
    line_id: i64,
    status: BankLineStatus,
    journal_id: i64,
    key: &str,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE bank_statement_lines SET status = ?1, journal_entry_id = ?2, action_idempotency_key = ?3, \
         matched_at = datetime('now') WHERE id = ?4 AND status = 'UNMATCHED'",
        rusqlite::params![status, journal_id, key, line_id],
    )?;
    if updated == 0 {
        return Err(AppError::conflict(format!(
            "Statement line {line_id} was matched concurrently"
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct ApplyInput {
    pub counter_account_id: i64,
    /// Defaults to the legal entity's LOCAL book.
    pub book_id: Option<i64>,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
}

fn resolve_book(
    conn: &Connection,
    ctx: &RequestContext,
    legal_entity_id: i64,
    book_id: Option<i64>,
) -> Result<crate::models::Book> {
    let book = match book_id {
        Some(id) => org::load_book(conn, ctx.tenant_id, id)?,
        None => org::find_book_by_type(conn, ctx.tenant_id, legal_entity_id, DEFAULT_BOOK_TYPE)?
            .ok_or_else(|| {
                AppError::validation(format!(
                    "No {DEFAULT_BOOK_TYPE} book for legal entity {legal_entity_id}; pass book_id"
                ))
            })?,
    };
    if book.legal_entity_id != legal_entity_id {
        return Err(AppError::validation("Book belongs to another legal entity"));
    }
    Ok(book)
}

fn apply_internal(
    conn: &Connection,
    ctx: &RequestContext,
    line: &StatementLine,
    book: &crate::models::Book,
    counter_account_id: i64,
    description: Option<String>,
    key: &str,
) -> Result<i64> {
    if is_zero(line.amount) {
        return Err(AppError::validation(format!("Statement line {} has a zero amount", line.id)));
    }
    let amount = line.amount.abs();
    let (debit, credit) = if line.amount > 0.0 {
        (line.bank_account_id, counter_account_id)
    } else {
        (counter_account_id, line.bank_account_id)
    };
    let input = NewJournal::system(book, None, &line.txn_date, SourceType::System)
        .source(STATEMENT_LINE_REF, line.id)
        .describe(description.unwrap_or_else(|| line.description.clone()))
        .lines(vec![NewLine::debit(debit, amount), NewLine::credit(credit, amount)]);
    let journal_id = journal::create_internal(conn, ctx, &input)?;
    posting::post_internal(conn, ctx, journal_id)?;
    mark(conn, line.id, BankLineStatus::Applied, journal_id, key)?;
    Ok(journal_id)
}

/// Book an UNMATCHED line against a counter account (positive amount: Dr bank
/// / Cr counter) and post the journal.
pub fn apply(
    conn: &Connection,
    ctx: &RequestContext,
    line_id: i64,
    input: &ApplyInput,
) -> Result<LineAction> {
    ctx.require_permission(perm::BANK_WRITE)?;
    let key = idempotency::require_key(input.idempotency_key.as_deref())?;
    if let Some(replay) = replayed(conn, ctx, line_id, &key)? {
        return Ok(replay);
    }
    let line = unmatched_line(conn, ctx, line_id)?;
    let book = resolve_book(conn, ctx, line.legal_entity_id, input.book_id)?;
    let journal_id = apply_internal(
        conn,
        ctx,
        &line,
        &book,
        input.counter_account_id,
        input.description.clone(),
        &key,
    )?;
    audit::record(
        conn,
        ctx,
        "bank.line.apply",
        "bank_statement_line",
        Some(line.id),
        serde_json::json!({
            "journal_id": journal_id,
            "counter_account_id": input.counter_account_id,
        }),
    )?;
    tracing::info!(line_id = line.id, journal_id, "statement line applied");
    Ok(LineAction {
        line: load_line(conn, ctx.tenant_id, line.id)?,
        idempotent_replay: false,
    })
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BankRule {
    pub id: i64,
    pub legal_entity_id: i64,
    pub pattern: String,
    pub match_type: MatchType,
    pub counter_account_id: i64,
    pub priority: i64,
    pub hit_count: i64,
    pub is_active: bool,
}

const RULE_COLUMNS: &str = "id, legal_entity_id, pattern, match_type, counter_account_id, priority, hit_count, is_active";

fn rule_from_row(row: &Row) -> rusqlite::Result<BankRule> {
    Ok(BankRule {
        id: row.get(0)?,
        legal_entity_id: row.get(1)?,
        pattern: row.get(2)?,
        match_type: row.get(3)?,
        counter_account_id: row.get(4)?,
        priority: row.get(5)?,
        hit_count: row.get(6)?,
        is_active: row.get(7)?,
    })
}

/// Case-insensitive for `contains`/`starts_with`; regex patterns are used as
/// written.
pub fn matches(description: &str, pattern: &str, match_type: MatchType) -> bool {
    let desc_upper = description.to_uppercase();
    let pat_upper = pattern.to_uppercase();
    match match_type {
        MatchType::Contains => desc_upper.contains(&pat_upper),
        MatchType::StartsWith => desc_upper.starts_with(&pat_upper),
        MatchType::Regex => Regex::new(pattern)
            .map(|re| re.is_match(description))
            .unwrap_or(false),
    }
}

fn default_match_type() -> MatchType {
    MatchType::Contains
}

#[derive(Debug, Deserialize)]
pub struct NewRule {
    pub legal_entity_id: i64,
    pub pattern: String,
    #[serde(default = "default_match_type")]
    pub match_type: MatchType,
    pub counter_account_id: i64,
    #[serde(default)]
    pub priority: i64,
}

pub fn create_rule(conn: &Connection, ctx: &RequestContext, input: &NewRule) -> Result<BankRule> {
    ctx.require_permission(perm::BANK_WRITE)?;
    assert_scope_access(conn, ctx, input.legal_entity_id)?;
    let pattern = input.pattern.trim();
    if pattern.is_empty() {
        return Err(AppError::validation("Rule pattern is required"));
    }
    if input.match_type == MatchType::Regex {
        Regex::new(pattern).map_err(|e| AppError::validation(format!("Invalid regex: {e}")))?;
    }
    let counter = accounts::load_account(conn, ctx.tenant_id, input.counter_account_id)?;
    counter
        .check_postable(input.legal_entity_id)
        .map_err(|reason| AppError::validation(format!("Counter {reason}")))?;
    conn.execute(
        "INSERT INTO bank_rules (tenant_id, legal_entity_id, pattern, match_type, counter_account_id, priority) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            ctx.tenant_id,
            input.legal_entity_id,
            pattern,
            input.match_type,
            counter.id,
            input.priority,
        ],
    )?;
    let id = conn.last_insert_rowid();
    audit::record(
        conn,
        ctx,
        "bank.rule.create",
        "bank_rule",
        Some(id),
        serde_json::json!({
            "pattern": pattern,
            "match_type": input.match_type,
            "counter_account_id": counter.id,
        }),
    )?;
    Ok(conn.query_row(
        &format!("SELECT {RULE_COLUMNS} FROM bank_rules WHERE id = ?1"),
        [id],
        rule_from_row,
    )?)
}

pub fn list_rules(
    conn: &Connection,
    ctx: &RequestContext,
    legal_entity_id: Option<i64>,
) -> Result<Vec<BankRule>> {
    ctx.require_permission(perm::BANK_READ)?;
    let mut w = Where::new()
        .eq("tenant_id", ctx.tenant_id)
        .eq_opt("legal_entity_id", legal_entity_id);
    if let Some(ids) = ctx.scoped_ids() {
        w = w.in_ids("legal_entity_id", &ids);
    }
    let sql = format!(
        "SELECT {RULE_COLUMNS} FROM bank_rules{} ORDER BY priority DESC, id",
        w.sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(w.params().iter()), rule_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Deserialize)]
pub struct AutoApplyInput {
    pub legal_entity_id: i64,
    pub bank_account_id: Option<i64>,
    pub book_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AutoApplyResult {
    pub applied: usize,
    pub unmatched: usize,
    pub journal_ids: Vec<i64>,
}

/// Apply the first matching active rule (highest priority first) to every
/// UNMATCHED line of the legal entity.
pub fn auto_apply(
    conn: &Connection,
    ctx: &RequestContext,
    input: &AutoApplyInput,
) -> Result<AutoApplyResult> {
    ctx.require_permission(perm::BANK_WRITE)?;
    assert_scope_access(conn, ctx, input.legal_entity_id)?;
    let book = resolve_book(conn, ctx, input.legal_entity_id, input.book_id)?;
    let rules: Vec<BankRule> = list_rules(conn, ctx, Some(input.legal_entity_id))?
        .into_iter()
        .filter(|r| r.is_active)
        .collect();
    let w = Where::new()
        .eq("tenant_id", ctx.tenant_id)
        .eq("legal_entity_id", input.legal_entity_id)
        .eq("status", BankLineStatus::Unmatched.as_str().to_string())
        .eq_opt("bank_account_id", input.bank_account_id);
    let sql = format!(
        "SELECT {LINE_COLUMNS} FROM bank_statement_lines{} ORDER BY txn_date, id",
        w.sql()
    );
    let lines = conn
        .prepare(&sql)?
        .query_map(rusqlite::params_from_iter(w.params().iter()), line_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut journal_ids = Vec::new();
    let mut unmatched = 0usize;
    for line in &lines {
        let Some(rule) = rules
            .iter()
            .find(|r| matches(&line.description, &r.pattern, r.match_type))
        else {
            unmatched += 1;
            continue;
        };
        let key = format!("auto-rule-{}-line-{}", rule.id, line.id);
        journal_ids.push(
            apply_internal(conn, ctx, line, &book, rule.counter_account_id, None, &key)?,
        );
        conn.execute("UPDATE bank_rules SET hit_count = hit_count + 1 WHERE id = ?1", [rule.id])?;
    }
    let applied = journal_ids.len();
    if applied > 0 {
        audit::record(
            conn,
            ctx,
            "bank.auto_apply",
            "bank_statement_line",
            None,
            serde_json::json!({
                "applied": applied,
                "unmatched": unmatched,
                "journal_ids": journal_ids,
            }),
        )?;
    }
    tracing::info!(
        legal_entity_id = input.legal_entity_id,
        applied,
        unmatched,
        "bank rules applied"
    );
    Ok(AutoApplyResult {
        applied,
        unmatched,
        journal_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, Fixture};

    const STATEMENT: &str = "Date,Description,Amount\n\
        03/03/2025,STRIPE PAYOUT 8812,\"1,250.00\"\n\
        2025-03-04,OFFICE DEPOT #12,(45.10)\n\
        03/05/2025,Coffee Shop,-4.50\n";

    fn import(conn: &Connection, fx: &Fixture, content: &str) -> ImportResult {
        import_statement(
            conn,
            &fx.ctx,
            &ImportInput {
                legal_entity_id: fx.le_id,
                bank_account_id: fx.bank,
                filename: "march.csv".into(),
                content: content.into(),
            },
        )
        .unwrap()
    }

    fn lines(conn: &Connection, fx: &Fixture) -> Vec<StatementLine> {
        list_lines(conn, &fx.ctx, &LineFilter::default(), Page::default()).unwrap()
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1,250.00"), Some(1250.0));
        assert_eq!(parse_amount("(45.10)"), Some(-45.1));
        assert_eq!(parse_amount("$12"), Some(12.0));
        assert_eq!(parse_amount("abc"), None);
    }

    #[test]
    fn test_parse_statement_date() {
        assert_eq!(parse_statement_date("03/05/2025").as_deref(), Some("2025-03-05"));
        assert_eq!(parse_statement_date("2025-03-05").as_deref(), Some("2025-03-05"));
        assert_eq!(parse_statement_date("13/01/2025"), None);
        assert_eq!(parse_statement_date("yesterday"), None);
    }

    #[test]
    fn test_parse_statement_reports_row() {
        let err = parse_statement("2025-03-01,Deposit,10\n2025-03-02,Broken,ten\n").unwrap_err();
        assert_eq!(err.details()["line"], 2);
        assert!(err.to_string().contains("invalid amount"));
    }

    #[test]
    fn test_import_and_duplicates() {
        let (_dir, conn, fx) = fixture();
        let first = import(&conn, &fx, STATEMENT);
        assert_eq!(first.imported, 3);
        assert!(!first.duplicate_file);

        let again = import(&conn, &fx, STATEMENT);
        assert!(again.duplicate_file);
        assert_eq!(again.imported, 0);

        let overlap = import(&conn, &fx, "03/05/2025,Coffee Shop,-4.50\n03/06/2025,Rent,-900\n");
        assert_eq!(overlap.imported, 1);
        assert_eq!(overlap.skipped, 1);
        let all = lines(&conn, &fx);
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].amount, 1250.0);
        assert_eq!(all[1].amount, -45.1);
    }

    #[test]
    fn test_apply_posts_journal_and_replays() {
        let (_dir, conn, fx) = fixture();
        import(&conn, &fx, STATEMENT);
        let deposit = lines(&conn, &fx)[0].clone();
        let input = ApplyInput {
            counter_account_id: fx.revenue,
            book_id: None,
            description: None,
            idempotency_key: Some("apply-1".into()),
        };
        let applied = apply(&conn, &fx.ctx, deposit.id, &input).unwrap();
        assert!(!applied.idempotent_replay);
        assert_eq!(applied.line.status, BankLineStatus::Applied);
        let journal = journal::load_detail(
            &conn,
            fx.tenant_id,
            applied.line.journal_entry_id.unwrap(),
        )
        .unwrap();
        assert_eq!(journal.entry.status, JournalStatus::Posted);
        let debit = journal.lines.iter().find(|l| l.debit_base > 0.0).unwrap();
        assert_eq!(debit.account_id, fx.bank);
        assert_eq!(debit.debit_base, 1250.0);

        let replay = apply(&conn, &fx.ctx, deposit.id, &input).unwrap();
        assert!(replay.idempotent_replay);
        assert_eq!(replay.line.journal_entry_id, applied.line.journal_entry_id);

        let other = lines(&conn, &fx)[1].clone();
        let err = apply(&conn, &fx.ctx, other.id, &input).unwrap_err();
        assert_eq!(err.code(), "IDEMPOTENCY_KEY_REUSED");
    }

    #[test]
    fn test_attach_requires_journal_on_bank_account() {
        let (_dir, conn, fx) = fixture();
        import(&conn, &fx, STATEMENT);
        let line = lines(&conn, &fx)[1].clone();
        let unrelated = crate::test_support::manual_journal(
            &fx,
            "2025-03-04",
            vec![NewLine::debit(fx.expense, 45.1), NewLine::credit(fx.cash, 45.1)],
        );
        let unrelated_id = journal::create(&conn, &fx.ctx, &unrelated).unwrap().journal.entry.id;
        posting::post_internal(&conn, &fx.ctx, unrelated_id).unwrap();
        let err = attach(
            &conn,
            &fx.ctx,
            line.id,
            &AttachInput { journal_entry_id: unrelated_id, idempotency_key: Some("a-1".into()) },
        )
        .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let matching = crate::test_support::manual_journal(
            &fx,
            "2025-03-04",
            vec![NewLine::debit(fx.expense, 45.1), NewLine::credit(fx.bank, 45.1)],
        );
        let matching_id = journal::create(&conn, &fx.ctx, &matching).unwrap().journal.entry.id;
        posting::post_internal(&conn, &fx.ctx, matching_id).unwrap();
        let attached = attach(
            &conn,
            &fx.ctx,
            line.id,
            &AttachInput { journal_entry_id: matching_id, idempotency_key: Some("a-1".into()) },
        )
        .unwrap();
        assert_eq!(attached.line.status, BankLineStatus::Attached);
        assert_eq!(attached.line.journal_entry_id, Some(matching_id));
    }

    #[test]
    fn test_rules_match() {
        assert!(matches("STRIPE PAYOUT 8812", "stripe", MatchType::Contains));
        assert!(matches("Office Depot #12", "OFFICE", MatchType::StartsWith));
        assert!(!matches("My Office", "OFFICE", MatchType::StartsWith));
        assert!(matches("POS 1234 COFFEE", r"^POS \d+", MatchType::Regex));
        assert!(!matches("anything", "(", MatchType::Regex));
    }

    #[test]
    fn test_auto_apply_uses_priority() {
        let (_dir, conn, fx) = fixture();
        import(&conn, &fx, STATEMENT);
        let rule = |pattern: &str, account: i64, priority: i64| {
            create_rule(
                &conn,
                &fx.ctx,
                &NewRule {
                    legal_entity_id: fx.le_id,
                    pattern: pattern.into(),
                    match_type: MatchType::Contains,
                    counter_account_id: account,
                    priority,
                },
            )
            .unwrap()
        };
        let low = rule("OFFICE", fx.capital, 1);
        let high = rule("DEPOT", fx.expense, 10);
        rule("STRIPE", fx.revenue, 0);

        let result = auto_apply(
            &conn,
            &fx.ctx,
            &AutoApplyInput { legal_entity_id: fx.le_id, bank_account_id: None, book_id: None },
        )
        .unwrap();
        assert_eq!(result.applied, 2);
        assert_eq!(result.unmatched, 1);

        let rules = list_rules(&conn, &fx.ctx, Some(fx.le_id)).unwrap();
        assert_eq!(rules.iter().find(|r| r.id == high.id).unwrap().hit_count, 1);
        assert_eq!(rules.iter().find(|r| r.id == low.id).unwrap().hit_count, 0);

        let office = lines(&conn, &fx)
            .into_iter()
            .find(|l| l.description.starts_with("OFFICE"))
            .unwrap();
        let journal = journal::load_detail(&conn, fx.tenant_id, office.journal_entry_id.unwrap())
            .unwrap();
        let debit = journal.lines.iter().find(|l| l.debit_base > 0.0).unwrap();
        assert_eq!(debit.account_id, fx.expense);

        let rerun = auto_apply(
            &conn,
            &fx.ctx,
            &AutoApplyInput { legal_entity_id: fx.le_id, bank_account_id: None, book_id: None },
        )
        .unwrap();
        assert_eq!(rerun.applied, 0);
    }
}
