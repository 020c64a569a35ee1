use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::audit;
use crate::error::{AppError, Result};
use crate::models::{Book, FiscalCalendar, FiscalPeriod, PeriodStatus};
use crate::org;
use crate::scope::{assert_scope_access, perm, RequestContext};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .map_err(|_| AppError::validation(format!("Invalid date '{raw}', expected YYYY-MM-DD")))
}

pub fn today() -> String {
    chrono::Local::now().date_naive().format(DATE_FORMAT).to_string()
}

// ---------------------------------------------------------------------------
// Calendars and periods
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct NewCalendar {
    pub code: String,
    pub name: String,
}

pub fn list_calendars(conn: &Connection, ctx: &RequestContext) -> Result<Vec<FiscalCalendar>> {
    ctx.require_permission(perm::PERIOD_READ)?;
    let mut stmt = conn.prepare(
        "SELECT id, tenant_id, code, name FROM fiscal_calendars WHERE tenant_id = ?1 ORDER BY code",
    )?;
    let rows = stmt
        .query_map([ctx.tenant_id], |row| {
            Ok(FiscalCalendar {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                code: row.get(2)?,
                name: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn create_calendar(
    conn: &Connection,
    ctx: &RequestContext,
    input: &NewCalendar,
) -> Result<FiscalCalendar> {
    ctx.require_permission(perm::CONFIG_WRITE)?;
    let code = input.code.trim();
    if code.is_empty() {
        return Err(AppError::validation("Calendar code is required"));
    }
    let exists = conn
        .prepare("SELECT 1 FROM fiscal_calendars WHERE tenant_id = ?1 AND code = ?2")?
        .exists(rusqlite::params![ctx.tenant_id, code])?;
    if exists {
        return Err(AppError::conflict(format!("Calendar '{code}' already exists")));
    }
    conn.execute(
        "INSERT INTO fiscal_calendars (tenant_id, code, name) VALUES (?1, ?2, ?3)",
        rusqlite::params![ctx.tenant_id, code, input.name.trim()],
    )?;
    let id = conn.last_insert_rowid();
    audit::record(
        conn,
        ctx,
        "calendar.create",
        "fiscal_calendar",
        Some(id),
        serde_json::json!({ "code": code }),
    )?;
    Ok(FiscalCalendar {
        id,
        tenant_id: ctx.tenant_id,
        code: code.to_string(),
        name: input.name.trim().to_string(),
    })
}

fn ensure_calendar(conn: &Connection, tenant_id: i64, calendar_id: i64) -> Result<()> {
    let found = conn
        .prepare("SELECT 1 FROM fiscal_calendars WHERE id = ?1 AND tenant_id = ?2")?
        .exists([calendar_id, tenant_id])?;
    if found {
        Ok(())
    } else {
        Err(AppError::not_found(format!("Fiscal calendar {calendar_id}")))
    }
}

#[derive(Debug, Deserialize)]
pub struct GeneratePeriods {
    pub fiscal_year: i32,
    /// First month of the fiscal year (1 = January).
    #[serde(default = "default_start_month")]
    pub start_month: u32,
}

fn default_start_month() -> u32 {
    1
}

#[derive(Debug, Serialize)]
pub struct GenerateResult {
    pub created_count: usize,
    pub skipped_count: usize,
    pub periods: Vec<FiscalPeriod>,
}

/// Generate twelve monthly periods for a fiscal year. Existing period numbers
/// are left alone.
pub fn generate_periods(
    conn: &Connection,
    ctx: &RequestContext,
    calendar_id: i64,
    input: &GeneratePeriods,
) -> Result<GenerateResult> {
    ctx.require_permission(perm::CONFIG_WRITE)?;
    ensure_calendar(conn, ctx.tenant_id, calendar_id)?;
    if !(1..=12).contains(&input.start_month) {
        return Err(AppError::validation("start_month must be between 1 and 12"));
    }
    let mut created_count = 0;
    let mut skipped_count = 0;
    for period_no in 1..=12u32 {
        let offset = input.start_month - 1 + period_no - 1;
        let year =
            input.fiscal_year - if input.start_month > 1 { 1 } else { 0 } + (offset / 12) as i32;
        let month = offset % 12 + 1;
        let start = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| {
                AppError::validation(format!("Invalid fiscal year {}", input.fiscal_year))
            })?;
        let next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        }
        .ok_or_else(|| AppError::validation(format!("Invalid fiscal year {}", input.fiscal_year)))?;
        let end = next.pred_opt().unwrap_or(next);

        let exists = conn
            .prepare(
                "SELECT 1 FROM fiscal_periods WHERE calendar_id = ?1 AND fiscal_year = ?2 AND period_no = ?3",
            )?
            .exists(rusqlite::params![calendar_id, input.fiscal_year, period_no])?;
        if exists {
            skipped_count += 1;
            continue;
        }
        conn.execute(
            "INSERT INTO fiscal_periods (calendar_id, fiscal_year, period_no, name, start_date, end_date) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                calendar_id,
                input.fiscal_year,
                period_no,
                format!("{}-{:02}", start.year(), start.month()),
                start.format(DATE_FORMAT).to_string(),
                end.format(DATE_FORMAT).to_string(),
            ],
        )?;
        created_count += 1;
    }
    audit::record(
        conn,
        ctx,
        "calendar.generate",
        "fiscal_calendar",
        Some(calendar_id),
        serde_json::json!({ "fiscal_year": input.fiscal_year, "created": created_count }),
    )?;
    let periods = load_periods(conn, calendar_id)?
        .into_iter()
        .filter(|p| p.fiscal_year == input.fiscal_year)
        .collect();
    Ok(GenerateResult {
        created_count,
        skipped_count,
        periods,
    })
}

const PERIOD_COLUMNS: &str = "id, calendar_id, fiscal_year, period_no, name, start_date, end_date, is_adjustment";

fn period_from_row(row: &Row) -> rusqlite::Result<FiscalPeriod> {
    Ok(FiscalPeriod {
        id: row.get(0)?,
        calendar_id: row.get(1)?,
        fiscal_year: row.get(2)?,
        period_no: row.get(3)?,
        name: row.get(4)?,
        start_date: row.get(5)?,
        end_date: row.get(6)?,
        is_adjustment: row.get(7)?,
    })
}

fn load_periods(conn: &Connection, calendar_id: i64) -> Result<Vec<FiscalPeriod>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PERIOD_COLUMNS} FROM fiscal_periods WHERE calendar_id = ?1 ORDER BY fiscal_year, period_no"
    ))?;
    let rows = stmt
        .query_map([calendar_id], period_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_periods(
    conn: &Connection,
    ctx: &RequestContext,
    calendar_id: i64,
) -> Result<Vec<FiscalPeriod>> {
    ctx.require_permission(perm::PERIOD_READ)?;
    ensure_calendar(conn, ctx.tenant_id, calendar_id)?;
    load_periods(conn, calendar_id)
}

pub fn load_period(conn: &Connection, period_id: i64) -> Result<FiscalPeriod> {
    conn.query_row(
        &format!("SELECT {PERIOD_COLUMNS} FROM fiscal_periods WHERE id = ?1"),
        [period_id],
        period_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Fiscal period {period_id}")))
}

/// Load a period and check it belongs to the book's calendar.
pub fn period_of_book(conn: &Connection, book: &Book, period_id: i64) -> Result<FiscalPeriod> {
    let period = load_period(conn, period_id)?;
    if period.calendar_id != book.calendar_id {
        return Err(AppError::validation(format!(
            "Fiscal period {} does not belong to the calendar of book {}",
            period.name, book.code
        )));
    }
    Ok(period)
}

/// The non-adjustment period of the calendar whose range contains `date`.
pub fn period_for_date(
    conn: &Connection,
    calendar_id: i64,
    date: &str,
) -> Result<Option<FiscalPeriod>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {PERIOD_COLUMNS} FROM fiscal_periods \
                 WHERE calendar_id = ?1 AND start_date <= ?2 AND end_date >= ?2 \
                 ORDER BY is_adjustment, period_no LIMIT 1"
            ),
            rusqlite::params![calendar_id, date],
            period_from_row,
        )
        .optional()?)
}

/// The period that follows `period` in its calendar, across year boundaries.
pub fn next_period(conn: &Connection, period: &FiscalPeriod) -> Result<Option<FiscalPeriod>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {PERIOD_COLUMNS} FROM fiscal_periods \
                 WHERE calendar_id = ?1 AND is_adjustment = 0 \
                 AND (fiscal_year > ?2 OR (fiscal_year = ?2 AND period_no > ?3)) \
                 ORDER BY fiscal_year, period_no LIMIT 1"
            ),
            rusqlite::params![period.calendar_id, period.fiscal_year, period.period_no],
            period_from_row,
        )
        .optional()?)
}

/// The non-adjustment period immediately before `period` in its calendar.
pub fn previous_period(conn: &Connection, period: &FiscalPeriod) -> Result<Option<FiscalPeriod>> {
    // An adjustment period follows every regular period of its year.
    let period_no = if period.is_adjustment { i32::MAX } else { period.period_no };
    Ok(conn
        .query_row(
            &format!(
                "SELECT {PERIOD_COLUMNS} FROM fiscal_periods \
                 WHERE calendar_id = ?1 AND is_adjustment = 0 \
                 AND (fiscal_year < ?2 OR (fiscal_year = ?2 AND period_no < ?3)) \
                 ORDER BY fiscal_year DESC, period_no DESC LIMIT 1"
            ),
            rusqlite::params![period.calendar_id, period.fiscal_year, period_no],
            period_from_row,
        )
        .optional()?)
}

pub fn is_last_of_year(conn: &Connection, period: &FiscalPeriod) -> Result<bool> {
    if period.is_adjustment {
        return Ok(false);
    }
    let later = conn
        .prepare(
            "SELECT 1 FROM fiscal_periods WHERE calendar_id = ?1 AND fiscal_year = ?2 \
             AND is_adjustment = 0 AND period_no > ?3",
        )?
        .exists(rusqlite::params![period.calendar_id, period.fiscal_year, period.period_no])?;
    Ok(!later)
}

// ---------------------------------------------------------------------------
// Period status
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PeriodStatusView {
    pub book_id: i64,
    pub fiscal_period_id: i64,
    pub period_name: String,
    pub status: PeriodStatus,
    pub note: Option<String>,
    pub updated_at: Option<String>,
}

/// A missing status row means the period is OPEN.
pub fn get_status(conn: &Connection, book_id: i64, period_id: i64) -> Result<PeriodStatus> {
    let status: Option<PeriodStatus> = conn
        .query_row(
            "SELECT status FROM period_statuses WHERE book_id = ?1 AND fiscal_period_id = ?2",
            [book_id, period_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(status.unwrap_or(PeriodStatus::Open))
}

pub fn set_status(
    conn: &Connection,
    ctx: &RequestContext,
    book_id: i64,
    period_id: i64,
    status: PeriodStatus,
    note: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO period_statuses (book_id, fiscal_period_id, status, note, updated_by, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, datetime('now')) \
         ON CONFLICT (book_id, fiscal_period_id) DO UPDATE SET \
         status = excluded.status, note = excluded.note, updated_by = excluded.updated_by, updated_at = excluded.updated_at",
        rusqlite::params![book_id, period_id, status, note, ctx.user_id],
    )?;
    Ok(())
}

/// Posting gate: anything but OPEN blocks the write.
pub fn ensure_open(conn: &Connection, book: &Book, period: &FiscalPeriod) -> Result<()> {
    let status = get_status(conn, book.id, period.id)?;
    if status != PeriodStatus::Open {
        return Err(AppError::PeriodNotOpen {
            book: book.code.clone(),
            period: period.name.clone(),
            status,
        });
    }
    Ok(())
}

pub fn status_view(
    conn: &Connection,
    ctx: &RequestContext,
    book_id: i64,
    period_id: i64,
) -> Result<PeriodStatusView> {
    ctx.require_permission(perm::PERIOD_READ)?;
    let book = org::load_book(conn, ctx.tenant_id, book_id)?;
    assert_scope_access(conn, ctx, book.legal_entity_id)?;
    let period = period_of_book(conn, &book, period_id)?;
    let row: Option<(PeriodStatus, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT status, note, updated_at FROM period_statuses WHERE book_id = ?1 AND fiscal_period_id = ?2",
            [book_id, period_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let (status, note, updated_at) = row.unwrap_or((PeriodStatus::Open, None, None));
    Ok(PeriodStatusView {
        book_id,
        fiscal_period_id: period.id,
        period_name: period.name,
        status,
        note,
        updated_at,
    })
}
