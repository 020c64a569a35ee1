use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::accounts::{find_by_code, load_account};
use crate::audit;
use crate::error::{AppError, Result};
use crate::models::{
    is_zero, round_amount, Account, Book, FiscalPeriod, JournalDetail, JournalEntry, JournalLine,
    JournalStatus, LegalEntity, SourceType,
};
use crate::org::{self, load_legal_entity};
use crate::periods::{self, parse_date, DATE_FORMAT};
use crate::query::{paged, Page, Where};
use crate::scope::{assert_scope_access, perm, RequestContext};

#[derive(Debug, Clone, Deserialize)]
pub struct NewLine {
    pub account_id: i64,
    pub operating_unit_id: Option<i64>,
    pub subledger_ref_type: Option<String>,
    pub subledger_ref_id: Option<i64>,
    pub counterparty_legal_entity_id: Option<i64>,
    pub description: Option<String>,
    pub currency: Option<String>,
    pub amount_txn: Option<f64>,
    #[serde(default)]
    pub debit_base: f64,
    #[serde(default)]
    pub credit_base: f64,
}

impl NewLine {
    pub fn debit(account_id: i64, amount: f64) -> Self {
        Self::with_amounts(account_id, amount, 0.0)
    }

    pub fn credit(account_id: i64, amount: f64) -> Self {
        Self::with_amounts(account_id, 0.0, amount)
    }

    fn with_amounts(account_id: i64, debit_base: f64, credit_base: f64) -> Self {
        Self {
            account_id,
            operating_unit_id: None,
            subledger_ref_type: None,
            subledger_ref_id: None,
            counterparty_legal_entity_id: None,
            description: None,
            currency: None,
            amount_txn: None,
            debit_base,
            credit_base,
        }
    }

    pub fn subledger(mut self, ref_type: &str, ref_id: i64) -> Self {
        self.subledger_ref_type = Some(ref_type.to_string());
        self.subledger_ref_id = Some(ref_id);
        self
    }

    pub fn counterparty(mut self, legal_entity_id: i64) -> Self {
        self.counterparty_legal_entity_id = Some(legal_entity_id);
        self
    }

    pub fn operating_unit(mut self, operating_unit_id: Option<i64>) -> Self {
        self.operating_unit_id = operating_unit_id;
        self
    }
}

fn default_source_type() -> SourceType {
    SourceType::Manual
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewJournal {
    pub legal_entity_id: i64,
    pub book_id: i64,
    /// Defaults to the period of the book's calendar containing `entry_date`.
    pub fiscal_period_id: Option<i64>,
    pub entry_date: String,
    pub document_date: Option<String>,
    pub currency: Option<String>,
    #[serde(default = "default_source_type")]
    pub source_type: SourceType,
    pub source_ref_type: Option<String>,
    pub source_ref_id: Option<i64>,
    pub description: Option<String>,
    pub lines: Vec<NewLine>,
    #[serde(default)]
    pub create_mirror: bool,
    #[serde(skip)]
    pub mirror_of_journal_id: Option<i64>,
    #[serde(skip)]
    pub reversal_of_journal_id: Option<i64>,
}

impl NewJournal {
    /// Header for a journal generated by another service.
    pub fn system(
        book: &Book,
        period_id: Option<i64>,
        entry_date: &str,
        source_type: SourceType,
    ) -> Self {
        Self {
            legal_entity_id: book.legal_entity_id,
            book_id: book.id,
            fiscal_period_id: period_id,
            entry_date: entry_date.to_string(),
            document_date: None,
            currency: None,
            source_type,
            source_ref_type: None,
            source_ref_id: None,
            description: None,
            lines: Vec::new(),
            create_mirror: false,
            mirror_of_journal_id: None,
            reversal_of_journal_id: None,
        }
    }

    pub fn source(mut self, ref_type: &str, ref_id: i64) -> Self {
        self.source_ref_type = Some(ref_type.to_string());
        self.source_ref_id = Some(ref_id);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn lines(mut self, lines: Vec<NewLine>) -> Self {
        self.lines = lines;
        self
    }
}

/// A journal that passed header and line validation.
struct Checked {
    legal_entity: LegalEntity,
    book: Book,
    period: FiscalPeriod,
    entry_date: String,
    currency: String,
    accounts: Vec<Account>,
    total_debit: f64,
    total_credit: f64,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Line rules shared by creation and post-time re-validation. Line numbers in
/// errors are 1-based.
pub fn validate_lines(
    conn: &Connection,
    tenant_id: i64,
    legal_entity: &LegalEntity,
    source_type: SourceType,
    lines: &[NewLine],
) -> Result<(Vec<Account>, f64, f64)> {
    if lines.len() < 2 {
        return Err(AppError::validation("A journal needs at least two lines"));
    }
    let mut accounts = Vec::with_capacity(lines.len());
    let mut total_debit = 0.0;
    let mut total_credit = 0.0;
    let mut partners = BTreeSet::new();

    for (idx, line) in lines.iter().enumerate() {
        let n = idx + 1;
        // Checked on the stored precision.
        let (dr, cr) = (round_amount(line.debit_base), round_amount(line.credit_base));
        if !dr.is_finite() || !cr.is_finite() {
            return Err(AppError::line(n, "amounts must be finite numbers"));
        }
        if dr < 0.0 || cr < 0.0 {
            return Err(AppError::line(n, "debit and credit cannot be negative"));
        }
        if dr > 0.0 && cr > 0.0 {
            return Err(AppError::line(n, "a line carries either a debit or a credit, not both"));
        }
        if dr == 0.0 && cr == 0.0 {
            return Err(AppError::line(n, "debit and credit are both zero"));
        }

        let account = match load_account(conn, tenant_id, line.account_id) {
            Ok(account) => account,
            Err(AppError::NotFound(_)) => {
                return Err(AppError::line(n, format!("account {} not found", line.account_id)));
            }
            Err(e) => return Err(e),
        };
        account
            .check_postable(legal_entity.id)
            .map_err(|reason| AppError::line(n, reason))?;

        if let Some(ou_id) = line.operating_unit_id {
            let ou = org::load_operating_unit(conn, tenant_id, ou_id).map_err(|_| {
                AppError::line(n, format!("operating unit {ou_id} not found"))
            })?;
            if ou.legal_entity_id != legal_entity.id {
                return Err(AppError::line(
                    n,
                    format!("operating unit {} belongs to another legal entity", ou.code),
                ));
            }
        }

        if let Some(partner) = line.counterparty_legal_entity_id {
            if partner == legal_entity.id {
                return Err(AppError::line(
                    n,
                    "counterparty legal entity must differ from the journal's legal entity",
                ));
            }
            load_legal_entity(conn, tenant_id, partner)
                .map_err(|_| {
                    AppError::line(n, format!("counterparty legal entity {partner} not found"))
                })?;
            partners.insert(partner);
        } else if source_type == SourceType::Intercompany && legal_entity.requires_ic_partner {
            return Err(AppError::line(
                n,
                format!(
                    "legal entity {} requires a counterparty on every intercompany line",
                    legal_entity.code
                ),
            ));
        }

        total_debit += dr;
        total_credit += cr;
        accounts.push(account);
    }

    if !is_zero(total_debit - total_credit) {
        return Err(AppError::validation(format!(
            "Journal is unbalanced: debits {:.4} != credits {:.4}",
            total_debit, total_credit
        )));
    }
    if source_type == SourceType::Intercompany && partners.is_empty() {
        return Err(AppError::validation(
            "Intercompany journals need at least one line with a counterparty legal entity",
        ));
    }
    Ok((accounts, round_amount(total_debit), round_amount(total_credit)))
}

fn check(conn: &Connection, ctx: &RequestContext, input: &NewJournal) -> Result<Checked> {
    assert_scope_access(conn, ctx, input.legal_entity_id)?;
    let legal_entity = load_legal_entity(conn, ctx.tenant_id, input.legal_entity_id)?;
    let book = org::load_book(conn, ctx.tenant_id, input.book_id)?;
    if book.legal_entity_id != legal_entity.id {
        return Err(AppError::validation(format!(
            "Book {} does not belong to legal entity {}",
            book.code, legal_entity.code
        )));
    }
    let entry_date = parse_date(&input.entry_date)?.format(DATE_FORMAT).to_string();
    if let Some(doc) = &input.document_date {
        parse_date(doc)?;
    }
    let period = match input.fiscal_period_id {
        Some(id) => periods::period_of_book(conn, &book, id)?,
        None => periods::period_for_date(conn, book.calendar_id, &entry_date)?.ok_or_else(|| {
            AppError::validation(format!(
                "No fiscal period of book {} contains {entry_date}",
                book.code
            ))
        })?,
    };
    if entry_date < period.start_date || entry_date > period.end_date {
        return Err(AppError::validation(format!(
            "Entry date {entry_date} is outside fiscal period {} ({} to {})",
            period.name, period.start_date, period.end_date
        )));
    }
    let currency = input
        .currency
        .clone()
        .unwrap_or_else(|| book.base_currency.clone())
        .to_uppercase();
    org::validate_currency(&currency)?;

    let (accounts, total_debit, total_credit) =
        validate_lines(conn, ctx.tenant_id, &legal_entity, input.source_type, &input.lines)?;
    Ok(Checked {
        legal_entity,
        book,
        period,
        entry_date,
        currency,
        accounts,
        total_debit,
        total_credit,
    })
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

fn next_journal_no(conn: &Connection, book_id: i64) -> Result<String> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM journal_entries WHERE book_id = ?1",
        [book_id],
        |row| row.get(0),
    )?;
    Ok(format!("JE-{:06}", count + 1))
}

fn insert(
    conn: &Connection,
    ctx: &RequestContext,
    input: &NewJournal,
    checked: &Checked,
) -> Result<i64> {
    let journal_no = next_journal_no(conn, checked.book.id)?;
    conn.execute(
        "INSERT INTO journal_entries (tenant_id, legal_entity_id, book_id, fiscal_period_id, journal_no, entry_date, \
         document_date, currency, source_type, source_ref_type, source_ref_id, description, status, \
         total_debit_base, total_credit_base, mirror_of_journal_id, reversal_of_journal_id, created_by) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'DRAFT', ?13, ?14, ?15, ?16, ?17)",
        rusqlite::params![
            ctx.tenant_id,
            checked.legal_entity.id,
            checked.book.id,
            checked.period.id,
            journal_no,
            checked.entry_date,
            input.document_date,
            checked.currency,
            input.source_type,
            input.source_ref_type,
            input.source_ref_id,
            input.description,
            checked.total_debit,
            checked.total_credit,
            input.mirror_of_journal_id,
            input.reversal_of_journal_id,
            ctx.user_id,
        ],
    )?;
    let journal_id = conn.last_insert_rowid();

    let mut stmt = conn.prepare_cached(
        "INSERT INTO journal_lines (journal_entry_id, line_no, account_id, operating_unit_id, subledger_ref_type, \
         subledger_ref_id, counterparty_legal_entity_id, description, currency, amount_txn, debit_base, credit_base) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;
    for (idx, line) in input.lines.iter().enumerate() {
        let amount_txn = line.amount_txn.unwrap_or(line.debit_base - line.credit_base);
        stmt.execute(rusqlite::params![
            journal_id,
            (idx + 1) as i64,
            line.account_id,
            line.operating_unit_id,
            line.subledger_ref_type,
            line.subledger_ref_id,
            line.counterparty_legal_entity_id,
            line.description,
            line.currency.clone().unwrap_or_else(|| checked.currency.clone()),
            amount_txn,
            round_amount(line.debit_base),
            round_amount(line.credit_base),
        ])?;
    }
    Ok(journal_id)
}

#[derive(Debug, Serialize)]
pub struct CreatedJournal {
    pub journal: JournalDetail,
    pub mirror: Option<JournalDetail>,
}

/// Manual journal creation (`POST /journals`). CASH journals are owned by the
/// cash module and rejected here.
pub fn create(
    conn: &Connection,
    ctx: &RequestContext,
    input: &NewJournal,
) -> Result<CreatedJournal> {
    if input.source_type == SourceType::Cash {
        return Err(AppError::validation(
            "Source type CASH is reserved for the cash module; create cash transactions instead",
        ));
    }
    ctx.require_permission(perm::JOURNAL_CREATE)?;
    let journal_id = create_internal(conn, ctx, input)?;

    let mirror = if input.create_mirror {
        if input.source_type != SourceType::Intercompany {
            return Err(AppError::validation(
                "Mirrors can only be generated for INTERCOMPANY journals",
            ));
        }
        let mirror_id = create_mirror(conn, ctx, journal_id)?;
        Some(load_detail(conn, ctx.tenant_id, mirror_id)?)
    } else {
        None
    };
    let journal = load_detail(conn, ctx.tenant_id, journal_id)?;
    audit::record(
        conn,
        ctx,
        "journal.create",
        "journal_entry",
        Some(journal_id),
        serde_json::json!({
            "journal_no": journal.entry.journal_no,
            "lines": journal.lines.len(),
            "mirror_id": mirror.as_ref().map(|m| m.entry.id),
        }),
    )?;
    Ok(CreatedJournal { journal, mirror })
}

/// Validate and insert a DRAFT journal on behalf of another service. The
/// caller owns the permission check.
pub fn create_internal(conn: &Connection, ctx: &RequestContext, input: &NewJournal) -> Result<i64> {
    let checked = check(conn, ctx, input)?;
    let id = insert(conn, ctx, input, &checked)?;
    tracing::debug!(
        journal_id = id,
        book = %checked.book.code,
        period = %checked.period.name,
        accounts = checked.accounts.len(),
        "draft journal created"
    );
    Ok(id)
}

/// Build the partner-side DRAFT of an intercompany journal: same book type,
/// swapped sides, accounts resolved by code in the partner's scope.
fn create_mirror(conn: &Connection, ctx: &RequestContext, origin_id: i64) -> Result<i64> {
    let origin = load_detail(conn, ctx.tenant_id, origin_id)?;
    let partners: BTreeSet<i64> = origin
        .lines
        .iter()
        .filter_map(|l| l.counterparty_legal_entity_id)
        .collect();
    let partner = match partners.len() {
        1 => partners.into_iter().next().unwrap_or_default(),
        n => {
            return Err(AppError::validation(format!(
                "Mirror generation needs exactly one counterparty legal entity, found {n}"
            )));
        }
    };
    assert_scope_access(conn, ctx, partner)?;
    let origin_book = org::load_book(conn, ctx.tenant_id, origin.entry.book_id)?;
    let partner_book = org::find_book_by_type(conn, ctx.tenant_id, partner, &origin_book.book_type)?
        .ok_or_else(|| {
            AppError::validation(format!(
                "Counterparty legal entity {partner} has no {} book",
                origin_book.book_type
            ))
        })?;

    let mut lines = Vec::with_capacity(origin.lines.len());
    for (idx, line) in origin.lines.iter().enumerate() {
        let account = load_account(conn, ctx.tenant_id, line.account_id)?;
        let mirrored = if account.chart_legal_entity_id.is_none() {
            account
        } else {
            find_by_code(conn, ctx.tenant_id, partner, &account.code)?.ok_or_else(|| {
                AppError::line(
                    idx + 1,
                    format!("no account {} in the counterparty's chart", account.code),
                )
            })?
        };
        lines.push(NewLine {
            account_id: mirrored.id,
            operating_unit_id: None,
            subledger_ref_type: line.subledger_ref_type.clone(),
            subledger_ref_id: line.subledger_ref_id,
            counterparty_legal_entity_id: Some(origin.entry.legal_entity_id),
            description: line.description.clone(),
            currency: Some(line.currency.clone()),
            amount_txn: Some(-line.amount_txn),
            debit_base: line.credit_base,
            credit_base: line.debit_base,
        });
    }

    let mut mirror = NewJournal::system(
        &partner_book,
        None,
        &origin.entry.entry_date,
        SourceType::Intercompany,
    )
    .describe(format!("Mirror of {}", origin.entry.journal_no))
    .lines(lines);
    mirror.document_date = origin.entry.document_date.clone();
    mirror.currency = Some(origin.entry.currency.clone());
    mirror.source_ref_type = origin.entry.source_ref_type.clone();
    mirror.source_ref_id = origin.entry.source_ref_id;
    mirror.mirror_of_journal_id = Some(origin.entry.id);
    create_internal(conn, ctx, &mirror)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

const ENTRY_COLUMNS: &str = "id, tenant_id, legal_entity_id, book_id, fiscal_period_id, journal_no, entry_date, \
     document_date, currency, source_type, source_ref_type, source_ref_id, description, status, total_debit_base, \
     total_credit_base, mirror_of_journal_id, reversal_of_journal_id, reversed_by_journal_id, created_by, \
     created_at, posted_at";

fn entry_from_row(row: &Row) -> rusqlite::Result<JournalEntry> {
    Ok(JournalEntry {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        legal_entity_id: row.get(2)?,
        book_id: row.get(3)?,
        fiscal_period_id: row.get(4)?,
        journal_no: row.get(5)?,
        entry_date: row.get(6)?,
        document_date: row.get(7)?,
        currency: row.get(8)?,
        source_type: row.get(9)?,
        source_ref_type: row.get(10)?,
        source_ref_id: row.get(11)?,
        description: row.get(12)?,
        status: row.get(13)?,
        total_debit_base: row.get(14)?,
        total_credit_base: row.get(15)?,
        mirror_of_journal_id: row.get(16)?,
        reversal_of_journal_id: row.get(17)?,
        reversed_by_journal_id: row.get(18)?,
        created_by: row.get(19)?,
        created_at: row.get(20)?,
        posted_at: row.get(21)?,
    })
}

pub fn load_entry(conn: &Connection, tenant_id: i64, id: i64) -> Result<JournalEntry> {
    conn.query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM journal_entries WHERE id = ?1 AND tenant_id = ?2"),
        [id, tenant_id],
        entry_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Journal {id}")))
}

pub fn load_lines(conn: &Connection, journal_id: i64) -> Result<Vec<JournalLine>> {
    let mut stmt = conn.prepare_cached(
        "SELECT l.id, l.journal_entry_id, l.line_no, l.account_id, a.code, l.operating_unit_id, \
         l.subledger_ref_type, l.subledger_ref_id, l.counterparty_legal_entity_id, l.description, l.currency, \
         l.amount_txn, l.debit_base, l.credit_base \
         FROM journal_lines l JOIN accounts a ON a.id = l.account_id \
         WHERE l.journal_entry_id = ?1 ORDER BY l.line_no",
    )?;
    let rows = stmt
        .query_map([journal_id], |row| {
            Ok(JournalLine {
                id: row.get(0)?,
                journal_entry_id: row.get(1)?,
                line_no: row.get(2)?,
                account_id: row.get(3)?,
                account_code: row.get(4)?,
                operating_unit_id: row.get(5)?,
                subledger_ref_type: row.get(6)?,
                subledger_ref_id: row.get(7)?,
                counterparty_legal_entity_id: row.get(8)?,
                description: row.get(9)?,
                currency: row.get(10)?,
                amount_txn: row.get(11)?,
                debit_base: row.get(12)?,
                credit_base: row.get(13)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_detail(conn: &Connection, tenant_id: i64, id: i64) -> Result<JournalDetail> {
    let entry = load_entry(conn, tenant_id, id)?;
    let lines = load_lines(conn, id)?;
    Ok(JournalDetail { entry, lines })
}

/// Stored lines turned back into input form, for re-validation and reversal.
pub fn as_new_lines(lines: &[JournalLine]) -> Vec<NewLine> {
    lines
        .iter()
        .map(|l| NewLine {
            account_id: l.account_id,
            operating_unit_id: l.operating_unit_id,
            subledger_ref_type: l.subledger_ref_type.clone(),
            subledger_ref_id: l.subledger_ref_id,
            counterparty_legal_entity_id: l.counterparty_legal_entity_id,
            description: l.description.clone(),
            currency: Some(l.currency.clone()),
            amount_txn: Some(l.amount_txn),
            debit_base: l.debit_base,
            credit_base: l.credit_base,
        })
        .collect()
}

pub fn get(conn: &Connection, ctx: &RequestContext, id: i64) -> Result<JournalDetail> {
    ctx.require_permission(perm::JOURNAL_READ)?;
    let detail = load_detail(conn, ctx.tenant_id, id)?;
    assert_scope_access(conn, ctx, detail.entry.legal_entity_id)?;
    Ok(detail)
}

#[derive(Debug, Default, Deserialize)]
pub struct JournalFilter {
    pub legal_entity_id: Option<i64>,
    pub book_id: Option<i64>,
    pub fiscal_period_id: Option<i64>,
    pub status: Option<JournalStatus>,
    pub source_type: Option<SourceType>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

pub fn list(
    conn: &Connection,
    ctx: &RequestContext,
    filter: &JournalFilter,
    page: Page,
) -> Result<Vec<JournalEntry>> {
    ctx.require_permission(perm::JOURNAL_READ)?;
    let mut w = Where::new()
        .eq("tenant_id", ctx.tenant_id)
        .eq_opt("legal_entity_id", filter.legal_entity_id)
        .eq_opt("book_id", filter.book_id)
        .eq_opt("fiscal_period_id", filter.fiscal_period_id)
        .eq_opt("status", filter.status.map(|s| s.as_str().to_string()))
        .eq_opt("source_type", filter.source_type.map(|s| s.as_str().to_string()))
        .gte_opt("entry_date", filter.date_from.clone())
        .lte_opt("entry_date", filter.date_to.clone());
    if let Some(ids) = ctx.scoped_ids() {
        w = w.in_ids("legal_entity_id", &ids);
    }
    let (tail, params) = paged(&w, page);
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM journal_entries{} ORDER BY entry_date DESC, id DESC{tail}",
        w.sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), entry_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, manual_journal as manual};

    #[test]
    fn test_create_balanced_draft() {
        let (_dir, conn, fx) = fixture();
        let input = manual(
            &fx,
            "2025-03-10",
            vec![NewLine::debit(fx.cash, 100.0), NewLine::credit(fx.revenue, 100.0)],
        );
        let created = create(&conn, &fx.ctx, &input).unwrap();
        let entry = &created.journal.entry;
        assert_eq!(entry.status, JournalStatus::Draft);
        assert_eq!(entry.fiscal_period_id, fx.periods[2]);
        assert_eq!(entry.journal_no, "JE-000001");
        assert_eq!(entry.currency, "USD");
        assert_eq!(entry.total_debit_base, 100.0);
        assert_eq!(created.journal.lines.len(), 2);
        assert_eq!(created.journal.lines[0].account_code, "1010");
        assert!(created.mirror.is_none());

        let second = create(&conn, &fx.ctx, &input).unwrap();
        assert_eq!(second.journal.entry.journal_no, "JE-000002");
    }

    #[test]
    fn test_cash_source_is_reserved_even_when_unbalanced() {
        let (_dir, conn, fx) = fixture();
        let mut input = manual(
            &fx,
            "2025-03-10",
            vec![NewLine::debit(fx.cash, 100.0), NewLine::credit(fx.revenue, 1.0)],
        );
        input.source_type = SourceType::Cash;
        let err = create(&conn, &fx.ctx, &input).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_unbalanced_rejected() {
        let (_dir, conn, fx) = fixture();
        let input = manual(
            &fx,
            "2025-03-10",
            vec![NewLine::debit(fx.cash, 100.0), NewLine::credit(fx.revenue, 99.0)],
        );
        let err = create(&conn, &fx.ctx, &input).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("unbalanced"));
    }

    #[test]
    fn test_balance_within_epsilon_accepted() {
        let (_dir, conn, fx) = fixture();
        let input = manual(
            &fx,
            "2025-03-10",
            vec![
                NewLine::debit(fx.cash, 0.1),
                NewLine::debit(fx.cash, 0.2),
                NewLine::credit(fx.revenue, 0.3),
            ],
        );
        assert!(create(&conn, &fx.ctx, &input).is_ok());
    }

    #[test]
    fn test_line_errors_carry_line_number() {
        let (_dir, conn, fx) = fixture();
        let mut both = NewLine::debit(fx.cash, 10.0);
        both.credit_base = 10.0;
        let input = manual(&fx, "2025-03-10", vec![NewLine::credit(fx.revenue, 10.0), both]);
        let err = create(&conn, &fx.ctx, &input).unwrap_err();
        assert_eq!(err.details()["line"], 2);

        let input = manual(
            &fx,
            "2025-03-10",
            vec![NewLine::debit(fx.cash, -5.0), NewLine::credit(fx.revenue, 5.0)],
        );
        let err = create(&conn, &fx.ctx, &input).unwrap_err();
        assert_eq!(err.details()["line"], 1);

        let input = manual(
            &fx,
            "2025-03-10",
            vec![NewLine::debit(fx.cash, 0.0), NewLine::credit(fx.revenue, 0.0)],
        );
        let err = create(&conn, &fx.ctx, &input).unwrap_err();
        assert!(err.to_string().contains("both zero"));
    }

    #[test]
    fn test_amounts_below_stored_precision_rejected() {
        let (_dir, conn, fx) = fixture();
        let input = manual(
            &fx,
            "2025-03-10",
            vec![NewLine::debit(fx.cash, 0.00004), NewLine::credit(fx.revenue, 0.00004)],
        );
        let err = create(&conn, &fx.ctx, &input).unwrap_err();
        assert_eq!(err.details()["line"], 1);
        assert!(err.to_string().contains("both zero"));
        let drafts: i64 = conn
            .query_row("SELECT COUNT(*) FROM journal_entries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(drafts, 0);
    }

    #[test]
    fn test_account_rules() {
        let (_dir, conn, fx) = fixture();
        for bad in [fx.current_assets, fx.inactive, 999_999] {
            let input = manual(
                &fx,
                "2025-03-10",
                vec![NewLine::debit(bad, 5.0), NewLine::credit(fx.revenue, 5.0)],
            );
            let err = create(&conn, &fx.ctx, &input).unwrap_err();
            assert_eq!(err.details()["line"], 1, "account {bad}");
        }
    }

    #[test]
    fn test_single_line_rejected() {
        let (_dir, conn, fx) = fixture();
        let input = manual(&fx, "2025-03-10", vec![NewLine::debit(fx.cash, 5.0)]);
        assert!(create(&conn, &fx.ctx, &input).is_err());
    }

    #[test]
    fn test_entry_date_outside_period_rejected() {
        let (_dir, conn, fx) = fixture();
        let mut input = manual(
            &fx,
            "2025-03-10",
            vec![NewLine::debit(fx.cash, 5.0), NewLine::credit(fx.revenue, 5.0)],
        );
        input.fiscal_period_id = Some(fx.periods[0]);
        let err = create(&conn, &fx.ctx, &input).unwrap_err();
        assert!(err.to_string().contains("outside fiscal period"));
    }

    #[test]
    fn test_book_of_other_entity_rejected() {
        let (_dir, conn, fx) = fixture();
        let mut input = manual(
            &fx,
            "2025-03-10",
            vec![NewLine::debit(fx.cash, 5.0), NewLine::credit(fx.revenue, 5.0)],
        );
        input.book_id = fx.book2_id;
        assert_eq!(create(&conn, &fx.ctx, &input).unwrap_err().status_code(), 400);
    }

    #[test]
    fn test_out_of_scope_entity_forbidden() {
        let (_dir, conn, fx) = fixture();
        let mut ctx = fx.ctx.clone();
        ctx.legal_entity_ids = Some([fx.le2_id].into_iter().collect());
        let input = manual(
            &fx,
            "2025-03-10",
            vec![NewLine::debit(fx.cash, 5.0), NewLine::credit(fx.revenue, 5.0)],
        );
        assert_eq!(create(&conn, &ctx, &input).unwrap_err().status_code(), 403);
    }

    #[test]
    fn test_intercompany_requires_partner() {
        let (_dir, conn, fx) = fixture();
        let mut input = manual(
            &fx,
            "2025-03-10",
            vec![NewLine::debit(fx.ic_receivable, 50.0), NewLine::credit(fx.revenue, 50.0)],
        );
        input.source_type = SourceType::Intercompany;
        let err = create(&conn, &fx.ctx, &input).unwrap_err();
        assert!(err.to_string().contains("counterparty"));

        input.lines[0] = NewLine::debit(fx.ic_receivable, 50.0).counterparty(fx.le_id);
        let err = create(&conn, &fx.ctx, &input).unwrap_err();
        assert_eq!(err.details()["line"], 1);

        input.lines[0] = NewLine::debit(fx.ic_receivable, 50.0).counterparty(fx.le2_id);
        assert!(create(&conn, &fx.ctx, &input).is_ok());
    }

    #[test]
    fn test_requires_ic_partner_on_every_line() {
        let (_dir, conn, fx) = fixture();
        conn.execute("UPDATE legal_entities SET requires_ic_partner = 1 WHERE id = ?1", [fx.le_id])
            .unwrap();
        let mut input = manual(
            &fx,
            "2025-03-10",
            vec![
                NewLine::debit(fx.ic_receivable, 50.0).counterparty(fx.le2_id),
                NewLine::credit(fx.revenue, 50.0),
            ],
        );
        input.source_type = SourceType::Intercompany;
        let err = create(&conn, &fx.ctx, &input).unwrap_err();
        assert_eq!(err.details()["line"], 2);
    }

    #[test]
    fn test_mirror_swaps_sides_in_partner_book() {
        let (_dir, conn, fx) = fixture();
        let mut input = manual(
            &fx,
            "2025-03-10",
            vec![
                NewLine::debit(fx.ic_receivable, 75.0).counterparty(fx.le2_id),
                NewLine::credit(fx.revenue, 75.0).counterparty(fx.le2_id),
            ],
        );
        input.source_type = SourceType::Intercompany;
        input.create_mirror = true;
        let created = create(&conn, &fx.ctx, &input).unwrap();
        let mirror = created.mirror.unwrap();
        assert_eq!(mirror.entry.legal_entity_id, fx.le2_id);
        assert_eq!(mirror.entry.book_id, fx.book2_id);
        assert_eq!(mirror.entry.status, JournalStatus::Draft);
        assert_eq!(mirror.entry.mirror_of_journal_id, Some(created.journal.entry.id));
        assert_eq!(mirror.lines[0].credit_base, 75.0);
        assert_eq!(mirror.lines[0].account_id, fx.ic_receivable);
        assert_eq!(mirror.lines[1].debit_base, 75.0);
        assert!(mirror.lines.iter().all(|l| l.counterparty_legal_entity_id == Some(fx.le_id)));
    }

    #[test]
    fn test_mirror_needs_single_partner() {
        let (_dir, conn, fx) = fixture();
        conn.execute(
            "INSERT INTO legal_entities (tenant_id, code, name, base_currency) VALUES (?1, 'THIRD', 'Third', 'USD')",
            [fx.tenant_id],
        )
        .unwrap();
        let third = conn.last_insert_rowid();
        let mut input = manual(
            &fx,
            "2025-03-10",
            vec![
                NewLine::debit(fx.ic_receivable, 75.0).counterparty(fx.le2_id),
                NewLine::credit(fx.revenue, 75.0).counterparty(third),
            ],
        );
        input.source_type = SourceType::Intercompany;
        input.create_mirror = true;
        let err = create(&conn, &fx.ctx, &input).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn test_list_filters_and_scope() {
        let (_dir, conn, fx) = fixture();
        let input = manual(
            &fx,
            "2025-03-10",
            vec![NewLine::debit(fx.cash, 5.0), NewLine::credit(fx.revenue, 5.0)],
        );
        create(&conn, &fx.ctx, &input).unwrap();
        let april = manual(
            &fx,
            "2025-04-02",
            vec![NewLine::debit(fx.cash, 5.0), NewLine::credit(fx.revenue, 5.0)],
        );
        create(&conn, &fx.ctx, &april).unwrap();

        let filter =
            JournalFilter { date_from: Some("2025-04-01".into()), ..JournalFilter::default() };
        let rows = list(&conn, &fx.ctx, &filter, Page::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entry_date, "2025-04-02");

        let mut scoped = fx.ctx.clone();
        scoped.legal_entity_ids = Some([fx.le2_id].into_iter().collect());
        assert!(
            list(&conn, &scoped, &JournalFilter::default(), Page::default()).unwrap().is_empty()
        );
        assert_eq!(get(&conn, &scoped, rows[0].id).unwrap_err().status_code(), 403);
    }
}
