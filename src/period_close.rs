//! Period close orchestration: carry-forward and year-end journals, period
//! status transitions, and reopen.

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::audit;
use crate::error::{AppError, Result};
use crate::journal::{self, NewJournal, NewLine};
use crate::models::{
    is_zero, Account, AccountType, Book, CloseRunStatus, FiscalPeriod, PeriodStatus, Purpose,
    SourceType,
};
use crate::org;
use crate::periods;
use crate::posting::{self, ReverseOptions};
use crate::purpose_accounts;
use crate::scope::{assert_scope_access, perm, RequestContext};
use crate::trial_balance::{self, TrialBalance};

pub const PERIOD_CLOSE_REF: &str = "PERIOD_CLOSE";

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct CloseRequest {
    pub requested_status: PeriodStatus,
    #[serde(default = "default_true")]
    pub carry_forward: bool,
    #[serde(default)]
    pub year_end: bool,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseRun {
    pub id: i64,
    pub book_id: i64,
    pub fiscal_period_id: i64,
    pub requested_status: PeriodStatus,
    pub previous_status: PeriodStatus,
    pub status: CloseRunStatus,
    pub carry_forward_journal_id: Option<i64>,
    pub year_end_journal_id: Option<i64>,
    pub started_by: Option<i64>,
    pub created_at: String,
    pub reopened_at: Option<String>,
    pub reopen_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CloseResult {
    pub run: CloseRun,
    pub idempotent: bool,
    pub period_status: PeriodStatus,
}

const RUN_COLUMNS: &str = "id, book_id, fiscal_period_id, requested_status, previous_status, status, \
     carry_forward_journal_id, year_end_journal_id, started_by, created_at, reopened_at, reopen_reason";

fn run_from_row(row: &Row) -> rusqlite::Result<CloseRun> {
    Ok(CloseRun {
        id: row.get(0)?,
        book_id: row.get(1)?,
        fiscal_period_id: row.get(2)?,
        requested_status: row.get(3)?,
        previous_status: row.get(4)?,
        status: row.get(5)?,
        carry_forward_journal_id: row.get(6)?,
        year_end_journal_id: row.get(7)?,
        started_by: row.get(8)?,
        created_at: row.get(9)?,
        reopened_at: row.get(10)?,
        reopen_reason: row.get(11)?,
    })
}

fn load_run(conn: &Connection, run_id: i64) -> Result<CloseRun> {
    Ok(conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM period_close_runs WHERE id = ?1"),
        [run_id],
        run_from_row,
    )?)
}

fn completed_run(
    conn: &Connection,
    book_id: i64,
    period_id: i64,
    requested: PeriodStatus,
) -> Result<Option<CloseRun>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {RUN_COLUMNS} FROM period_close_runs \
                 WHERE book_id = ?1 AND fiscal_period_id = ?2 AND requested_status = ?3 AND status = 'COMPLETED'"
            ),
            rusqlite::params![book_id, period_id, requested],
            run_from_row,
        )
        .optional()?)
}

/// One line per non-zero leaf row matching `keep`. With `invert` the line
/// zeroes the balance, otherwise it reproduces it. Returns the lines and the
/// summed net of the rows they came from.
fn balance_lines(
    tb: &TrialBalance,
    keep: impl Fn(AccountType) -> bool,
    invert: bool,
) -> (Vec<NewLine>, f64) {
    let mut lines = Vec::new();
    let mut net = 0.0;
    for row in tb.leaves() {
        if is_zero(row.net) || !keep(row.account_type) {
            continue;
        }
        net += row.net;
        let carry = if invert { -row.net } else { row.net };
        lines.push(if carry > 0.0 {
            NewLine::debit(row.account_id, carry)
        } else {
            NewLine::credit(row.account_id, -carry)
        });
    }
    (lines, net)
}

/// A line on retained earnings that absorbs `net` (debit - credit) of the
/// other lines with the opposite sign, so the journal balances.
fn retained_earnings_line(account: &Account, net: f64) -> NewLine {
    if net > 0.0 {
        NewLine::debit(account.id, net)
    } else {
        NewLine::credit(account.id, -net)
    }
}

#[allow(clippy::too_many_arguments)]
fn post_generated(
    conn: &Connection,
    ctx: &RequestContext,
    book: &Book,
    period: &FiscalPeriod,
    entry_date: &str,
    run_id: i64,
    description: String,
    lines: Vec<NewLine>,
) -> Result<Option<i64>> {
    if lines.len() < 2 {
        return Ok(None);
    }
    let input = NewJournal::system(book, Some(period.id), entry_date, SourceType::System)
        .source(PERIOD_CLOSE_REF, run_id)
        .describe(description)
        .lines(lines);
    let id = journal::create_internal(conn, ctx, &input)?;
    posting::post_internal(conn, ctx, id)?;
    Ok(Some(id))
}

pub fn close(
    conn: &Connection,
    ctx: &RequestContext,
    book_id: i64,
    period_id: i64,
    request: &CloseRequest,
) -> Result<CloseResult> {
    ctx.require_permission(perm::PERIOD_CLOSE)?;
    let book = org::load_book(conn, ctx.tenant_id, book_id)?;
    assert_scope_access(conn, ctx, book.legal_entity_id)?;
    let period = periods::period_of_book(conn, &book, period_id)?;
    let requested = request.requested_status;
    if requested == PeriodStatus::Open {
        return Err(AppError::validation("requested_status must be SOFT_CLOSED or HARD_CLOSED"));
    }

    if let Some(run) = completed_run(conn, book.id, period.id, requested)? {
        tracing::debug!(
            run_id = run.id,
            book = %book.code,
            period = %period.name,
            "close request replayed"
        );
        return Ok(CloseResult {
            period_status: periods::get_status(conn, book.id, period.id)?,
            run,
            idempotent: true,
        });
    }

    let current = periods::get_status(conn, book.id, period.id)?;
    if requested.rank() <= current.rank() {
        return Err(AppError::conflict(format!(
            "Period {} is already {current}; cannot close to {requested}",
            period.name
        )));
    }

    // Journals are only generated when leaving OPEN.
    let mut plan = None;
    if current == PeriodStatus::Open {
        let tb = trial_balance::compute(conn, book.id, period.id, false)?;
        if !tb.is_balanced {
            return Err(AppError::validation(format!(
                "Trial balance for {} is unbalanced (debits {:.4}, credits {:.4}); cannot close",
                period.name, tb.total_debit, tb.total_credit
            )));
        }
        if request.year_end && !periods::is_last_of_year(conn, &period)? {
            return Err(AppError::validation(format!(
                "Year-end closing is only allowed on the last period of fiscal year {}",
                period.fiscal_year
            )));
        }
        let next = if request.carry_forward {
            // Carry-forward moves one period's movements; periods close in order.
            if let Some(prev) = periods::previous_period(conn, &period)? {
                if periods::get_status(conn, book.id, prev.id)? == PeriodStatus::Open {
                    return Err(AppError::conflict(format!(
                        "Period {} is still OPEN; close it before carrying {} forward",
                        prev.name, period.name
                    )));
                }
            }
            let next = periods::next_period(conn, &period)?.ok_or_else(|| {
                AppError::validation(format!(
                    "No period follows {} to carry balances into",
                    period.name
                ))
            })?;
            periods::ensure_open(conn, &book, &next)?;
            Some(next)
        } else {
            None
        };
        let has_pl = tb
            .leaves()
            .any(|r| !r.account_type.is_balance_sheet() && !is_zero(r.net));
        let retained = if has_pl && (request.year_end || request.carry_forward) {
            Some(
                purpose_accounts::require(
                    conn,
                    ctx.tenant_id,
                    book.legal_entity_id,
                    Purpose::RetainedEarnings,
                )?,
            )
        } else {
            None
        };
        plan = Some((next, retained));
    }

    conn.execute(
        "INSERT INTO period_close_runs (tenant_id, book_id, fiscal_period_id, requested_status, previous_status, started_by) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![ctx.tenant_id, book.id, period.id, requested, current, ctx.user_id],
    )?;
    let run_id = conn.last_insert_rowid();

    let mut year_end_journal_id = None;
    let mut carry_forward_journal_id = None;
    if let Some((next, retained)) = plan {
        if request.year_end {
            let tb = trial_balance::compute(conn, book.id, period.id, false)?;
            let (mut lines, pl_net) = balance_lines(&tb, |t| !t.is_balance_sheet(), true);
            if !is_zero(pl_net) {
                if let Some(re) = &retained {
                    lines.push(retained_earnings_line(re, pl_net));
                }
            }
            year_end_journal_id = post_generated(
                conn,
                ctx,
                &book,
                &period,
                &period.end_date,
                run_id,
                format!("Year-end close {}", period.fiscal_year),
                lines,
            )?;
        }
        if let Some(next) = next {
            let tb = trial_balance::compute(conn, book.id, period.id, false)?;
            let (mut lines, _) = balance_lines(&tb, |t| t.is_balance_sheet(), false);
            let pl_net: f64 = tb
                .leaves()
                .filter(|r| !r.account_type.is_balance_sheet())
                .map(|r| r.net)
                .sum();
            if !is_zero(pl_net) {
                let re = retained.as_ref().ok_or_else(|| {
                    AppError::Internal("retained earnings account was not resolved".to_string())
                })?;
                lines.push(retained_earnings_line(re, pl_net));
            }
            carry_forward_journal_id = post_generated(
                conn,
                ctx,
                &book,
                &next,
                &next.start_date,
                run_id,
                format!("Carry-forward from {}", period.name),
                lines,
            )?;
        }
    }

    conn.execute(
        "UPDATE period_close_runs SET carry_forward_journal_id = ?1, year_end_journal_id = ?2 WHERE id = ?3",
        rusqlite::params![carry_forward_journal_id, year_end_journal_id, run_id],
    )?;
    periods::set_status(conn, ctx, book.id, period.id, requested, request.note.as_deref())?;
    audit::record(
        conn,
        ctx,
        "period.close",
        "period_close_run",
        Some(run_id),
        serde_json::json!({
            "book_id": book.id,
            "fiscal_period_id": period.id,
            "from": current,
            "to": requested,
            "carry_forward_journal_id": carry_forward_journal_id,
            "year_end_journal_id": year_end_journal_id,
        }),
    )?;
    tracing::info!(
        run_id,
        book = %book.code,
        period = %period.name,
        from = %current,
        to = %requested,
        "period closed"
    );
    Ok(CloseResult {
        run: load_run(conn, run_id)?,
        idempotent: false,
        period_status: requested,
    })
}

// ---------------------------------------------------------------------------
// Reopen
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ReopenRequest {
    pub reason: String,
    /// Defaults to OPEN.
    pub target_status: Option<PeriodStatus>,
}

#[derive(Debug, Serialize)]
pub struct ReopenResult {
    pub book_id: i64,
    pub fiscal_period_id: i64,
    pub previous_status: PeriodStatus,
    pub status: PeriodStatus,
    pub reopened_run_ids: Vec<i64>,
    pub reversal_journal_ids: Vec<i64>,
}

pub fn reopen(
    conn: &Connection,
    ctx: &RequestContext,
    book_id: i64,
    period_id: i64,
    request: &ReopenRequest,
) -> Result<ReopenResult> {
    ctx.require_permission(perm::PERIOD_REOPEN)?;
    let reason = request.reason.trim();
    if reason.is_empty() {
        return Err(AppError::validation("A reason is required to reopen a period"));
    }
    let book = org::load_book(conn, ctx.tenant_id, book_id)?;
    assert_scope_access(conn, ctx, book.legal_entity_id)?;
    let period = periods::period_of_book(conn, &book, period_id)?;
    let target = request.target_status.unwrap_or(PeriodStatus::Open);
    let current = periods::get_status(conn, book.id, period.id)?;
    if target.rank() >= current.rank() {
        return Err(AppError::conflict(format!(
            "Period {} is {current}; reopen target {target} must be lower",
            period.name
        )));
    }

    let affected: Vec<CloseRun> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM period_close_runs \
             WHERE book_id = ?1 AND fiscal_period_id = ?2 AND status = 'COMPLETED' ORDER BY id"
        ))?;
        let runs = stmt
            .query_map([book.id, period.id], run_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        runs.into_iter()
            .filter(|run| run.requested_status.rank() > target.rank())
            .collect()
    };

    // The closing period must accept the year-end reversal, so lower the
    // status before reversing.
    periods::set_status(conn, ctx, book.id, period.id, target, Some(reason))?;

    let mut reversal_journal_ids = Vec::new();
    if target == PeriodStatus::Open {
        for run in &affected {
            let generated = [run.year_end_journal_id, run.carry_forward_journal_id];
            for journal_id in generated.into_iter().flatten() {
                let original = journal::load_entry(conn, ctx.tenant_id, journal_id)?;
                if original.status != crate::models::JournalStatus::Posted {
                    continue;
                }
                let options = ReverseOptions {
                    entry_date: Some(original.entry_date.clone()),
                    fiscal_period_id: Some(original.fiscal_period_id),
                    description: Some(format!(
                        "Reopen {}: reversal of {}",
                        period.name,
                        original.journal_no
                    )),
                    auto_post: true,
                };
                reversal_journal_ids.push(
                    posting::reverse_internal(conn, ctx, journal_id, &options)?,
                );
            }
        }
    }

    let reopened_run_ids: Vec<i64> = affected.iter().map(|r| r.id).collect();
    for run_id in &reopened_run_ids {
        conn.execute(
            "UPDATE period_close_runs SET status = 'REOPENED', reopened_by = ?1, reopened_at = datetime('now'), \
             reopen_reason = ?2 WHERE id = ?3",
            rusqlite::params![ctx.user_id, reason, run_id],
        )?;
    }

    audit::record(
        conn,
        ctx,
        "period.reopen",
        "fiscal_period",
        Some(period.id),
        serde_json::json!({
            "book_id": book.id,
            "from": current,
            "to": target,
            "reason": reason,
            "reopened_run_ids": reopened_run_ids,
            "reversal_journal_ids": reversal_journal_ids,
        }),
    )?;
    tracing::info!(
        book = %book.code,
        period = %period.name,
        from = %current,
        to = %target,
        reversals = reversal_journal_ids.len(),
        "period reopened"
    );
    Ok(ReopenResult {
        book_id: book.id,
        fiscal_period_id: period.id,
        previous_status: current,
        status: target,
        reopened_run_ids,
        reversal_journal_ids,
    })
}

pub fn list_runs(
    conn: &Connection,
    ctx: &RequestContext,
    book_id: i64,
    period_id: i64,
) -> Result<Vec<CloseRun>> {
    ctx.require_permission(perm::PERIOD_READ)?;
    let book = org::load_book(conn, ctx.tenant_id, book_id)?;
    assert_scope_access(conn, ctx, book.legal_entity_id)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM period_close_runs WHERE book_id = ?1 AND fiscal_period_id = ?2 ORDER BY id"
    ))?;
    let runs = stmt
        .query_map([book.id, period_id], run_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(runs)
}
