//! Best-effort updates of source documents once their journal is posted.

use rusqlite::Connection;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::{is_zero, JournalEntry};

pub const PAYROLL_RUN: &str = "PAYROLL_RUN";
pub const SHAREHOLDER_COMMITMENT: &str = "SHAREHOLDER_COMMITMENT";

#[derive(Debug, Clone, Serialize)]
pub struct SideEffect {
    pub kind: String,
    pub ok: bool,
    pub message: String,
}

/// Run the sync for the journal's source document, if it has one. Each sync
/// runs in its own savepoint so a failure leaves the posting intact.
pub fn sync_after_post(conn: &Connection, journal: &JournalEntry) -> Vec<SideEffect> {
    let (Some(kind), Some(ref_id)) = (journal.source_ref_type.as_deref(), journal.source_ref_id)
    else {
        return Vec::new();
    };
    let outcome = match kind {
        PAYROLL_RUN => guarded(conn, |c| sync_payroll_run(c, journal, ref_id)),
        SHAREHOLDER_COMMITMENT => {
            guarded(conn, |c| sync_shareholder_commitment(c, journal, ref_id))
        }
        _ => return Vec::new(),
    };
    let effect = match outcome {
        Ok(message) => SideEffect {
            kind: kind.to_string(),
            ok: true,
            message,
        },
        Err(e) => {
            tracing::warn!(journal_id = journal.id, kind, error = %e, "commitment sync failed");
            SideEffect {
                kind: kind.to_string(),
                ok: false,
                message: e.to_string(),
            }
        }
    };
    vec![effect]
}

fn guarded(conn: &Connection, f: impl FnOnce(&Connection) -> Result<String>) -> Result<String> {
    conn.execute_batch("SAVEPOINT commitment_sync")?;
    match f(conn) {
        Ok(message) => {
            conn.execute_batch("RELEASE commitment_sync")?;
            Ok(message)
        }
        Err(e) => {
            conn.execute_batch("ROLLBACK TO commitment_sync; RELEASE commitment_sync")?;
            Err(e)
        }
    }
}

fn sync_payroll_run(conn: &Connection, journal: &JournalEntry, run_id: i64) -> Result<String> {
    let updated = conn.execute(
        "UPDATE payroll_runs SET status = 'POSTED', journal_entry_id = ?1, journal_posted_at = datetime('now') \
         WHERE id = ?2 AND tenant_id = ?3 AND legal_entity_id = ?4",
        rusqlite::params![journal.id, run_id, journal.tenant_id, journal.legal_entity_id],
    )?;
    if updated == 0 {
        return Err(AppError::not_found(format!("Payroll run {run_id}")));
    }
    Ok(format!("payroll run {run_id} marked POSTED"))
}

fn sync_shareholder_commitment(
    conn: &Connection,
    journal: &JournalEntry,
    commitment_id: i64,
) -> Result<String> {
    let (committed, paid): (f64, f64) = conn
        .query_row(
            "SELECT committed_amount, paid_amount FROM shareholder_commitments \
             WHERE id = ?1 AND tenant_id = ?2 AND legal_entity_id = ?3",
            rusqlite::params![commitment_id, journal.tenant_id, journal.legal_entity_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => AppError::not_found(format!(
                "Shareholder commitment {commitment_id}"
            )),
            other => other.into(),
        })?;
    let new_paid = paid + journal.total_debit_base;
    if new_paid - committed > 0.0 && !is_zero(new_paid - committed) {
        return Err(AppError::validation(format!(
            "payment of {:.2} exceeds the open commitment of {:.2}",
            journal.total_debit_base,
            committed - paid
        )));
    }
    let status = if is_zero(new_paid - committed) { "PAID" } else { "PARTIALLY_PAID" };
    conn.execute(
        "UPDATE shareholder_commitments SET paid_amount = ?1, status = ?2, last_journal_entry_id = ?3 WHERE id = ?4",
        rusqlite::params![new_paid, status, journal.id, commitment_id],
    )?;
    Ok(format!("shareholder commitment {commitment_id} is {status}"))
}
