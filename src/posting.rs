use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::audit;
use crate::commitments::{self, SideEffect};
use crate::error::{AppError, Result};
use crate::journal::{self, as_new_lines, NewJournal, NewLine};
use crate::models::{JournalDetail, JournalEntry, JournalStatus};
use crate::org::{self, load_legal_entity};
use crate::periods::{self, parse_date, DATE_FORMAT};
use crate::scope::{assert_scope_access, perm, RequestContext};

pub const REVERSAL_REF: &str = "REVERSAL";

#[derive(Debug, Default, Deserialize)]
pub struct PostOptions {
    #[serde(default)]
    pub post_mirrors: bool,
}

#[derive(Debug, Serialize)]
pub struct PostResult {
    pub journal: JournalDetail,
    pub mirrors: Vec<JournalDetail>,
    pub side_effects: Vec<SideEffect>,
}

/// DRAFT → POSTED with post-time re-validation and the period gate. No
/// permission check; callers own it.
pub fn post_internal(
    conn: &Connection,
    ctx: &RequestContext,
    journal_id: i64,
) -> Result<JournalEntry> {
    let entry = journal::load_entry(conn, ctx.tenant_id, journal_id)?;
    assert_scope_access(conn, ctx, entry.legal_entity_id)?;
    if entry.status != JournalStatus::Draft {
        return Err(AppError::conflict(format!(
            "Journal {} is {}; only DRAFT journals can be posted",
            entry.journal_no, entry.status
        )));
    }
    let legal_entity = load_legal_entity(conn, ctx.tenant_id, entry.legal_entity_id)?;
    let lines = journal::load_lines(conn, entry.id)?;
    journal::validate_lines(
        conn,
        ctx.tenant_id,
        &legal_entity,
        entry.source_type,
        &as_new_lines(&lines),
    )?;

    let book = org::load_book(conn, ctx.tenant_id, entry.book_id)?;
    let period = periods::period_of_book(conn, &book, entry.fiscal_period_id)?;
    periods::ensure_open(conn, &book, &period)?;

    let updated = conn.execute(
        "UPDATE journal_entries SET status = 'POSTED', posted_by = ?1, posted_at = datetime('now') \
         WHERE id = ?2 AND status = 'DRAFT'",
        rusqlite::params![ctx.user_id, entry.id],
    )?;
    if updated == 0 {
        return Err(AppError::conflict(format!(
            "Journal {} was posted concurrently",
            entry.journal_no
        )));
    }
    tracing::info!(
        journal_id = entry.id,
        journal_no = %entry.journal_no,
        book = %book.code,
        period = %period.name,
        source_type = %entry.source_type,
        "journal posted"
    );
    journal::load_entry(conn, ctx.tenant_id, entry.id)
}

pub fn post(
    conn: &Connection,
    ctx: &RequestContext,
    journal_id: i64,
    options: &PostOptions,
) -> Result<PostResult> {
    ctx.require_permission(perm::JOURNAL_POST)?;
    let entry = post_internal(conn, ctx, journal_id)?;

    let mut side_effects = commitments::sync_after_post(conn, &entry);
    let mut mirrors = Vec::new();
    if options.post_mirrors {
        let mut stmt = conn.prepare(
            "SELECT id FROM journal_entries WHERE mirror_of_journal_id = ?1 AND tenant_id = ?2 AND status = 'DRAFT' ORDER BY id",
        )?;
        let mirror_ids = stmt
            .query_map([entry.id, ctx.tenant_id], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for mirror_id in mirror_ids {
            let mirror = post_internal(conn, ctx, mirror_id)?;
            side_effects.extend(commitments::sync_after_post(conn, &mirror));
            mirrors.push(journal::load_detail(conn, ctx.tenant_id, mirror_id)?);
        }
    }

    audit::record(
        conn,
        ctx,
        "journal.post",
        "journal_entry",
        Some(entry.id),
        serde_json::json!({
            "journal_no": entry.journal_no,
            "mirror_ids": mirrors.iter().map(|m| m.entry.id).collect::<Vec<_>>(),
            "side_effects": side_effects,
        }),
    )?;
    Ok(PostResult {
        journal: journal::load_detail(conn, ctx.tenant_id, entry.id)?,
        mirrors,
        side_effects,
    })
}

// ---------------------------------------------------------------------------
// Reversal
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ReverseOptions {
    /// Defaults to today.
    pub entry_date: Option<String>,
    /// Defaults to the period of the book's calendar containing `entry_date`.
    pub fiscal_period_id: Option<i64>,
    pub description: Option<String>,
    #[serde(default)]
    pub auto_post: bool,
}

#[derive(Debug, Serialize)]
pub struct ReverseResult {
    pub original: JournalEntry,
    pub reversal: JournalDetail,
}

/// POSTED → REVERSED. Creates the swapped journal and links both ways; the
/// guarded status update makes the transition happen at most once.
pub fn reverse_internal(
    conn: &Connection,
    ctx: &RequestContext,
    journal_id: i64,
    options: &ReverseOptions,
) -> Result<i64> {
    let original = journal::load_detail(conn, ctx.tenant_id, journal_id)?;
    let entry = &original.entry;
    assert_scope_access(conn, ctx, entry.legal_entity_id)?;
    match entry.status {
        JournalStatus::Posted => {}
        JournalStatus::Reversed => {
            return Err(AppError::conflict(format!(
                "Journal {} is already reversed",
                entry.journal_no
            )));
        }
        JournalStatus::Draft => {
            return Err(AppError::conflict(format!(
                "Journal {} is DRAFT; only POSTED journals can be reversed",
                entry.journal_no
            )));
        }
    }

    let book = org::load_book(conn, ctx.tenant_id, entry.book_id)?;
    let entry_date = match &options.entry_date {
        Some(raw) => parse_date(raw)?.format(DATE_FORMAT).to_string(),
        None => periods::today(),
    };
    let lines: Vec<NewLine> = as_new_lines(&original.lines)
        .into_iter()
        .map(|mut line| {
            std::mem::swap(&mut line.debit_base, &mut line.credit_base);
            line.amount_txn = line.amount_txn.map(|a| -a);
            line
        })
        .collect();
    let mut reversal = NewJournal::system(
        &book,
        options.fiscal_period_id,
        &entry_date,
        entry.source_type,
    )
    .source(REVERSAL_REF, entry.id)
    .describe(
            options
                .description
                .clone()
                .unwrap_or_else(|| format!("Reversal of {}", entry.journal_no)),
        )
        .lines(lines);
    reversal.currency = Some(entry.currency.clone());
    reversal.reversal_of_journal_id = Some(entry.id);
    let reversal_id = journal::create_internal(conn, ctx, &reversal)?;

    let updated = conn.execute(
        "UPDATE journal_entries SET status = 'REVERSED', reversed_by_journal_id = ?1, reversed_at = datetime('now') \
         WHERE id = ?2 AND status = 'POSTED'",
        [reversal_id, entry.id],
    )?;
    if updated == 0 {
        return Err(AppError::conflict(format!("Journal {} is already reversed", entry.journal_no)));
    }
    if options.auto_post {
        post_internal(conn, ctx, reversal_id)?;
    }
    tracing::info!(
        journal_id = entry.id,
        reversal_id,
        auto_post = options.auto_post,
        "journal reversed"
    );
    Ok(reversal_id)
}

pub fn reverse(
    conn: &Connection,
    ctx: &RequestContext,
    journal_id: i64,
    options: &ReverseOptions,
) -> Result<ReverseResult> {
    ctx.require_permission(perm::JOURNAL_REVERSE)?;
    let reversal_id = reverse_internal(conn, ctx, journal_id, options)?;
    audit::record(
        conn,
        ctx,
        "journal.reverse",
        "journal_entry",
        Some(journal_id),
        serde_json::json!({ "reversal_id": reversal_id, "auto_post": options.auto_post }),
    )?;
    Ok(ReverseResult {
        original: journal::load_entry(conn, ctx.tenant_id, journal_id)?,
        reversal: journal::load_detail(conn, ctx.tenant_id, reversal_id)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::in_transaction;
    use crate::journal::create;
    use crate::models::{PeriodStatus, SourceType};
    use crate::test_support::{fixture, manual_journal};

    fn draft(conn: &Connection, fx: &crate::test_support::Fixture, date: &str, amount: f64) -> i64 {
        let input = manual_journal(
            fx,
            date,
            vec![NewLine::debit(fx.cash, amount), NewLine::credit(fx.revenue, amount)],
        );
        create(conn, &fx.ctx, &input).unwrap().journal.entry.id
    }

    #[test]
    fn test_post_into_open_period() {
        let (_dir, conn, fx) = fixture();
        let id = draft(&conn, &fx, "2025-03-10", 100.0);
        let result = post(&conn, &fx.ctx, id, &PostOptions::default()).unwrap();
        assert_eq!(result.journal.entry.status, JournalStatus::Posted);
        assert!(result.journal.entry.posted_at.is_some());
        assert!(result.side_effects.is_empty());
    }

    #[test]
    fn test_post_into_closed_period_names_status() {
        let (_dir, conn, fx) = fixture();
        let id = draft(&conn, &fx, "2025-03-10", 100.0);
        for status in [PeriodStatus::SoftClosed, PeriodStatus::HardClosed] {
            periods::set_status(&conn, &fx.ctx, fx.book_id, fx.periods[2], status, None).unwrap();
            let err = post(&conn, &fx.ctx, id, &PostOptions::default()).unwrap_err();
            assert_eq!(err.status_code(), 409);
            assert!(err.to_string().contains(status.as_str()));
        }
    }

    #[test]
    fn test_post_twice_conflicts() {
        let (_dir, conn, fx) = fixture();
        let id = draft(&conn, &fx, "2025-03-10", 100.0);
        post(&conn, &fx.ctx, id, &PostOptions::default()).unwrap();
        let err = post(&conn, &fx.ctx, id, &PostOptions::default()).unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_post_revalidates_accounts() {
        let (_dir, conn, fx) = fixture();
        let id = draft(&conn, &fx, "2025-03-10", 100.0);
        conn.execute("UPDATE accounts SET is_active = 0 WHERE id = ?1", [fx.revenue]).unwrap();
        let err = post(&conn, &fx.ctx, id, &PostOptions::default()).unwrap_err();
        assert_eq!(err.details()["line"], 2);
    }

    fn intercompany_with_mirror(
        conn: &Connection,
        fx: &crate::test_support::Fixture,
    ) -> (i64, i64) {
        let mut input = manual_journal(
            fx,
            "2025-03-10",
            vec![
                NewLine::debit(fx.ic_receivable, 40.0).counterparty(fx.le2_id),
                NewLine::credit(fx.revenue, 40.0).counterparty(fx.le2_id),
            ],
        );
        input.source_type = SourceType::Intercompany;
        input.create_mirror = true;
        let created = create(conn, &fx.ctx, &input).unwrap();
        (created.journal.entry.id, created.mirror.unwrap().entry.id)
    }

    #[test]
    fn test_post_mirrors_together() {
        let (_dir, conn, fx) = fixture();
        let (id, mirror_id) = intercompany_with_mirror(&conn, &fx);
        let result = post(&conn, &fx.ctx, id, &PostOptions { post_mirrors: true }).unwrap();
        assert_eq!(result.mirrors.len(), 1);
        assert_eq!(result.mirrors[0].entry.id, mirror_id);
        assert_eq!(result.mirrors[0].entry.status, JournalStatus::Posted);
    }

    #[test]
    fn test_mirror_posting_syncs_its_source_document() {
        let (_dir, conn, fx) = fixture();
        conn.execute(
            "INSERT INTO payroll_runs (tenant_id, legal_entity_id, period_label, net_pay_total) VALUES (?1, ?2, '2025-03', 40)",
            [fx.tenant_id, fx.le2_id],
        )
        .unwrap();
        let run_id = conn.last_insert_rowid();
        let mut input = manual_journal(
            &fx,
            "2025-03-10",
            vec![
                NewLine::debit(fx.ic_receivable, 40.0).counterparty(fx.le2_id),
                NewLine::credit(fx.revenue, 40.0).counterparty(fx.le2_id),
            ],
        );
        input.source_type = SourceType::Intercompany;
        input.source_ref_type = Some(commitments::PAYROLL_RUN.to_string());
        input.source_ref_id = Some(run_id);
        input.create_mirror = true;
        let created = create(&conn, &fx.ctx, &input).unwrap();
        let mirror_id = created.mirror.unwrap().entry.id;

        let result = post(
            &conn,
            &fx.ctx,
            created.journal.entry.id,
            &PostOptions { post_mirrors: true },
        )
        .unwrap();
        assert_eq!(result.side_effects.len(), 2);
        assert!(!result.side_effects[0].ok);
        assert!(result.side_effects[1].ok, "{}", result.side_effects[1].message);
        let linked: Option<i64> = conn
            .query_row(
                "SELECT journal_entry_id FROM payroll_runs WHERE id = ?1",
                [run_id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(linked, Some(mirror_id));
    }

    #[test]
    fn test_mirror_failure_rolls_back_origin() {
        let (_dir, mut conn, fx) = fixture();
        let (id, _) = intercompany_with_mirror(&conn, &fx);
        periods::set_status(
            &conn,
            &fx.ctx,
            fx.book2_id,
            fx.periods[2],
            PeriodStatus::SoftClosed,
            None,
        )
        .unwrap();
        let ctx = fx.ctx.clone();
        let err = in_transaction(&mut conn, |tx| {
            post(tx, &ctx, id, &PostOptions { post_mirrors: true })
        })
        .unwrap_err();
        assert_eq!(err.code(), "PERIOD_NOT_OPEN");
        let status: JournalStatus = conn
            .query_row("SELECT status FROM journal_entries WHERE id = ?1", [id], |r| r.get(0))
            .unwrap();
        assert_eq!(status, JournalStatus::Draft);
    }

    #[test]
    fn test_reversal_swaps_lines_once() {
        let (_dir, conn, fx) = fixture();
        let id = draft(&conn, &fx, "2025-03-10", 100.0);
        post(&conn, &fx.ctx, id, &PostOptions::default()).unwrap();
        let options = ReverseOptions {
            entry_date: Some("2025-03-20".into()),
            auto_post: true,
            ..ReverseOptions::default()
        };
        let result = reverse(&conn, &fx.ctx, id, &options).unwrap();
        assert_eq!(result.original.status, JournalStatus::Reversed);
        assert_eq!(result.original.reversed_by_journal_id, Some(result.reversal.entry.id));
        assert_eq!(result.reversal.entry.status, JournalStatus::Posted);
        assert_eq!(result.reversal.entry.reversal_of_journal_id, Some(id));
        assert_eq!(result.reversal.entry.source_ref_type.as_deref(), Some(REVERSAL_REF));
        assert_eq!(result.reversal.lines[0].credit_base, 100.0);
        assert_eq!(result.reversal.lines[1].debit_base, 100.0);

        let net: f64 = conn
            .query_row(
                "SELECT SUM(l.debit_base - l.credit_base) FROM journal_lines l WHERE l.account_id = ?1",
                [fx.cash],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(net, 0.0);

        let err = reverse(&conn, &fx.ctx, id, &options).unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_reversal_requires_posted() {
        let (_dir, conn, fx) = fixture();
        let id = draft(&conn, &fx, "2025-03-10", 100.0);
        let options =
            ReverseOptions { entry_date: Some("2025-03-20".into()), ..ReverseOptions::default() };
        assert_eq!(reverse(&conn, &fx.ctx, id, &options).unwrap_err().status_code(), 409);
    }

    #[test]
    fn test_reversal_defaults_period_from_date() {
        let (_dir, conn, fx) = fixture();
        let id = draft(&conn, &fx, "2025-03-10", 100.0);
        post(&conn, &fx.ctx, id, &PostOptions::default()).unwrap();
        let options =
            ReverseOptions { entry_date: Some("2025-04-01".into()), ..ReverseOptions::default() };
        let result = reverse(&conn, &fx.ctx, id, &options).unwrap();
        assert_eq!(result.reversal.entry.fiscal_period_id, fx.periods[3]);
        assert_eq!(result.reversal.entry.status, JournalStatus::Draft);
    }

    #[test]
    fn test_payroll_sync_reported() {
        let (_dir, conn, fx) = fixture();
        conn.execute(
            "INSERT INTO payroll_runs (tenant_id, legal_entity_id, period_label, net_pay_total) VALUES (?1, ?2, '2025-03', 100)",
            [fx.tenant_id, fx.le_id],
        )
        .unwrap();
        let run_id = conn.last_insert_rowid();
        let mut input = manual_journal(
            &fx,
            "2025-03-31",
            vec![NewLine::debit(fx.expense, 100.0), NewLine::credit(fx.bank, 100.0)],
        );
        input.source_ref_type = Some(commitments::PAYROLL_RUN.to_string());
        input.source_ref_id = Some(run_id);
        let id = create(&conn, &fx.ctx, &input).unwrap().journal.entry.id;
        let result = post(&conn, &fx.ctx, id, &PostOptions::default()).unwrap();
        assert_eq!(result.side_effects.len(), 1);
        assert!(result.side_effects[0].ok);
        let (status, linked): (String, Option<i64>) = conn
            .query_row("SELECT status, journal_entry_id FROM payroll_runs WHERE id = ?1", [run_id], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(status, "POSTED");
        assert_eq!(linked, Some(id));
    }

    #[test]
    fn test_failed_sync_does_not_fail_post() {
        let (_dir, conn, fx) = fixture();
        let mut input = manual_journal(
            &fx,
            "2025-03-31",
            vec![NewLine::debit(fx.bank, 500.0), NewLine::credit(fx.capital, 500.0)],
        );
        input.source_ref_type = Some(commitments::SHAREHOLDER_COMMITMENT.to_string());
        input.source_ref_id = Some(4242);
        let id = create(&conn, &fx.ctx, &input).unwrap().journal.entry.id;
        let result = post(&conn, &fx.ctx, id, &PostOptions::default()).unwrap();
        assert_eq!(result.journal.entry.status, JournalStatus::Posted);
        assert_eq!(result.side_effects[0].kind, commitments::SHAREHOLDER_COMMITMENT);
        assert!(!result.side_effects[0].ok);
    }

    #[test]
    fn test_shareholder_commitment_paid_in_full() {
        let (_dir, conn, fx) = fixture();
        conn.execute(
            "INSERT INTO shareholder_commitments (tenant_id, legal_entity_id, shareholder_name, committed_amount) \
             VALUES (?1, ?2, 'Founder', 500)",
            [fx.tenant_id, fx.le_id],
        )
        .unwrap();
        let commitment = conn.last_insert_rowid();
        let mut input = manual_journal(
            &fx,
            "2025-03-31",
            vec![NewLine::debit(fx.bank, 500.0), NewLine::credit(fx.capital, 500.0)],
        );
        input.source_ref_type = Some(commitments::SHAREHOLDER_COMMITMENT.to_string());
        input.source_ref_id = Some(commitment);
        let id = create(&conn, &fx.ctx, &input).unwrap().journal.entry.id;
        let result = post(&conn, &fx.ctx, id, &PostOptions::default()).unwrap();
        assert!(result.side_effects[0].ok, "{}", result.side_effects[0].message);
        let status: String = conn
            .query_row(
                "SELECT status FROM shareholder_commitments WHERE id = ?1",
                [commitment],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(status, "PAID");
    }
}
