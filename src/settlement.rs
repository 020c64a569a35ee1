//! Settlement batches: cash allocated against open items of one counterparty.

use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::accounts;
use crate::audit;
use crate::cari::{self, COUNTERPARTY_REF};
use crate::error::{AppError, Result};
use crate::idempotency;
use crate::journal::{self, NewJournal, NewLine};
use crate::models::{is_zero, round_amount, Direction, OpenItemStatus, SourceType};
use crate::org;
use crate::periods::{parse_date, DATE_FORMAT};
use crate::posting;
use crate::purpose_accounts;
use crate::query::{paged, Page, Where};
use crate::scope::{assert_scope_access, perm, RequestContext};

pub const SETTLEMENT_REF: &str = "SETTLEMENT_BATCH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub open_item_id: i64,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementBatch {
    pub id: i64,
    pub legal_entity_id: i64,
    pub book_id: i64,
    pub counterparty_id: i64,
    pub direction: Direction,
    pub settlement_date: String,
    pub cash_account_id: i64,
    pub total_amount: f64,
    pub journal_entry_id: Option<i64>,
    pub idempotency_key: String,
    pub created_at: String,
    pub allocations: Vec<Allocation>,
}

#[derive(Debug, Serialize)]
pub struct SettlementView {
    #[serde(flatten)]
    pub batch: SettlementBatch,
    pub idempotent_replay: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewSettlement {
    pub legal_entity_id: i64,
    pub book_id: i64,
    pub counterparty_id: i64,
    pub direction: Direction,
    pub settlement_date: String,
    pub cash_account_id: i64,
    pub allocations: Vec<Allocation>,
    #[serde(skip_serializing)]
    pub idempotency_key: Option<String>,
}

const BATCH_COLUMNS: &str = "id, legal_entity_id, book_id, counterparty_id, direction, settlement_date, cash_account_id, \
     total_amount, journal_entry_id, idempotency_key, created_at";

fn batch_from_row(row: &Row) -> rusqlite::Result<SettlementBatch> {
    Ok(SettlementBatch {
        id: row.get(0)?,
        legal_entity_id: row.get(1)?,
        book_id: row.get(2)?,
        counterparty_id: row.get(3)?,
        direction: row.get(4)?,
        settlement_date: row.get(5)?,
        cash_account_id: row.get(6)?,
        total_amount: row.get(7)?,
        journal_entry_id: row.get(8)?,
        idempotency_key: row.get(9)?,
        created_at: row.get(10)?,
        allocations: Vec::new(),
    })
}

fn load_allocations(conn: &Connection, batch_id: i64) -> Result<Vec<Allocation>> {
    let mut stmt = conn.prepare(
        "SELECT open_item_id, amount FROM settlement_allocations WHERE batch_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([batch_id], |row| {
            Ok(Allocation {
                open_item_id: row.get(0)?,
                amount: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_batch(conn: &Connection, tenant_id: i64, id: i64) -> Result<SettlementBatch> {
    let mut batch = conn
        .query_row(
            &format!(
                "SELECT {BATCH_COLUMNS} FROM settlement_batches WHERE id = ?1 AND tenant_id = ?2"
            ),
            [id, tenant_id],
            batch_from_row,
        )
        .optional()?
        .ok_or_else(|| AppError::not_found(format!("Settlement batch {id}")))?;
    batch.allocations = load_allocations(conn, id)?;
    Ok(batch)
}

/// Allocate cash against open items and post the settlement journal. The
/// idempotency key is mandatory.
pub fn create(
    conn: &Connection,
    ctx: &RequestContext,
    input: &NewSettlement,
) -> Result<SettlementView> {
    ctx.require_permission(perm::CARI_POST)?;
    let key = idempotency::require_key(input.idempotency_key.as_deref())?;
    let hash = idempotency::payload_hash(input)?;
    let existing: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, payload_hash FROM settlement_batches WHERE tenant_id = ?1 AND idempotency_key = ?2",
            rusqlite::params![ctx.tenant_id, key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    if let Some((id, stored)) = existing {
        idempotency::check_replay(&key, Some(&stored), &hash)?;
        let batch = load_batch(conn, ctx.tenant_id, id)?;
        assert_scope_access(conn, ctx, batch.legal_entity_id)?;
        tracing::debug!(batch_id = id, key = %key, "settlement replayed");
        return Ok(SettlementView {
            batch,
            idempotent_replay: true,
        });
    }

    assert_scope_access(conn, ctx, input.legal_entity_id)?;
    let book = org::load_book(conn, ctx.tenant_id, input.book_id)?;
    if book.legal_entity_id != input.legal_entity_id {
        return Err(AppError::validation("Book belongs to another legal entity"));
    }
    let counterparty = cari::load_counterparty(conn, ctx.tenant_id, input.counterparty_id)?;
    let settlement_date = parse_date(&input.settlement_date)?.format(DATE_FORMAT).to_string();
    let cash = accounts::load_account(conn, ctx.tenant_id, input.cash_account_id)?;
    cash.check_postable(input.legal_entity_id)
        .map_err(|reason| AppError::validation(format!("Cash {reason}")))?;
    if input.allocations.is_empty() {
        return Err(AppError::validation("A settlement needs at least one allocation"));
    }

    let mut seen = BTreeSet::new();
    let mut items = Vec::with_capacity(input.allocations.len());
    for (i, allocation) in input.allocations.iter().enumerate() {
        let n = i + 1;
        if !seen.insert(allocation.open_item_id) {
            return Err(AppError::line(
                n,
                format!("open item {} is allocated twice", allocation.open_item_id),
            ));
        }
        if !allocation.amount.is_finite() || allocation.amount <= 0.0 || is_zero(allocation.amount)
        {
            return Err(AppError::line(n, "allocation amount must be positive"));
        }
        let item = cari::load_open_item(conn, ctx.tenant_id, allocation.open_item_id)?;
        if item.legal_entity_id != input.legal_entity_id
            || item.counterparty_id != counterparty.id
            || item.direction != input.direction
        {
            return Err(AppError::line(
                n,
                format!(
                    "open item {} does not belong to {} {} of this legal entity",
                    item.id, counterparty.code, input.direction
                ),
            ));
        }
        if item.status == OpenItemStatus::Settled {
            return Err(AppError::line(n, format!("open item {} is already settled", item.id)));
        }
        let excess = allocation.amount - item.residual_amount;
        if excess > 0.0 && !is_zero(excess) {
            return Err(AppError::line(
                n,
                format!(
                    "allocation {:.2} exceeds the residual {:.2} of {}",
                    allocation.amount, item.residual_amount, item.document_no
                ),
            ));
        }
        items.push((item, round_amount(allocation.amount)));
    }
    let total = round_amount(items.iter().map(|(_, amount)| amount).sum());

    conn.execute(
        "INSERT INTO settlement_batches (tenant_id, legal_entity_id, book_id, counterparty_id, direction, settlement_date, \
         cash_account_id, total_amount, idempotency_key, payload_hash, created_by) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            ctx.tenant_id,
            input.legal_entity_id,
            book.id,
            counterparty.id,
            input.direction,
            settlement_date,
            cash.id,
            total,
            key,
            hash,
            ctx.user_id,
        ],
    )?;
    let batch_id = conn.last_insert_rowid();

    for (item, amount) in &items {
        conn.execute(
            "INSERT INTO settlement_allocations (batch_id, open_item_id, amount) VALUES (?1, ?2, ?3)",
            rusqlite::params![batch_id, item.id, amount],
        )?;
        let residual = round_amount(item.residual_amount - amount);
        let status = if is_zero(residual) {
            OpenItemStatus::Settled
        } else {
            OpenItemStatus::PartiallySettled
        };
        let residual = if is_zero(residual) { 0.0 } else { residual };
        let updated = conn.execute(
            "UPDATE open_items SET residual_amount = ?1, status = ?2 WHERE id = ?3 AND residual_amount = ?4",
            rusqlite::params![residual, status, item.id, item.residual_amount],
        )?;
        if updated == 0 {
            return Err(AppError::conflict(format!("Open item {} changed concurrently", item.id)));
        }
    }

    let control = purpose_accounts::require(
        conn,
        ctx.tenant_id,
        input.legal_entity_id,
        input.direction.control_purpose(),
    )?;
    let control_line = |line: NewLine| line.subledger(COUNTERPARTY_REF, counterparty.id);
    let lines = match input.direction {
        Direction::Ar => vec![
            NewLine::debit(cash.id, total),
            control_line(NewLine::credit(control.id, total)),
        ],
        Direction::Ap => vec![
            control_line(NewLine::debit(control.id, total)),
            NewLine::credit(cash.id, total),
        ],
    };
    let journal_input = NewJournal::system(&book, None, &settlement_date, SourceType::System)
        .source(SETTLEMENT_REF, batch_id)
        .describe(format!("Settlement {} {}", input.direction, counterparty.code))
        .lines(lines);
    let journal_id = journal::create_internal(conn, ctx, &journal_input)?;
    posting::post_internal(conn, ctx, journal_id)?;
    conn.execute(
        "UPDATE settlement_batches SET journal_entry_id = ?1 WHERE id = ?2",
        [journal_id, batch_id],
    )?;

    audit::record(
        conn,
        ctx,
        "cari.settlement.create",
        "settlement_batch",
        Some(batch_id),
        serde_json::json!({
            "counterparty_id": counterparty.id,
            "direction": input.direction,
            "total": total,
            "allocations": items.len(),
            "journal_id": journal_id,
        }),
    )?;
    tracing::info!(
        batch_id,
        journal_id,
        counterparty = %counterparty.code,
        total,
        "settled"
    );
    Ok(SettlementView {
        batch: load_batch(conn, ctx.tenant_id, batch_id)?,
        idempotent_replay: false,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct SettlementFilter {
    pub legal_entity_id: Option<i64>,
    pub counterparty_id: Option<i64>,
    pub direction: Option<Direction>,
}

pub fn list(
    conn: &Connection,
    ctx: &RequestContext,
    filter: &SettlementFilter,
    page: Page,
) -> Result<Vec<SettlementBatch>> {
    ctx.require_permission(perm::CARI_READ)?;
    let mut w = Where::new()
        .eq("tenant_id", ctx.tenant_id)
        .eq_opt("legal_entity_id", filter.legal_entity_id)
        .eq_opt("counterparty_id", filter.counterparty_id)
        .eq_opt("direction", filter.direction.map(|d| d.as_str().to_string()));
    if let Some(ids) = ctx.scoped_ids() {
        w = w.in_ids("legal_entity_id", &ids);
    }
    let (tail, params) = paged(&w, page);
    let sql = format!(
        "SELECT {BATCH_COLUMNS} FROM settlement_batches{} ORDER BY settlement_date DESC, id DESC{tail}",
        w.sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), batch_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for batch in &mut rows {
        batch.allocations = load_allocations(conn, batch.id)?;
    }
    Ok(rows)
}

pub fn get(conn: &Connection, ctx: &RequestContext, id: i64) -> Result<SettlementBatch> {
    ctx.require_permission(perm::CARI_READ)?;
    let batch = load_batch(conn, ctx.tenant_id, id)?;
    assert_scope_access(conn, ctx, batch.legal_entity_id)?;
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cari::tests::{customer, invoice};
    use crate::cari::{create_document, post_document};
    use crate::test_support::{fixture, Fixture};

    fn posted_invoice(
        conn: &Connection,
        fx: &Fixture,
        counterparty_id: i64,
        no: &str,
        amount: f64,
    ) -> i64 {
        let id = create_document(conn, &fx.ctx, &invoice(fx, counterparty_id, no, amount))
            .unwrap()
            .document
            .id;
        post_document(conn, &fx.ctx, id).unwrap().open_item.id
    }

    fn settlement(
        fx: &Fixture,
        counterparty_id: i64,
        key: &str,
        allocations: Vec<Allocation>,
    ) -> NewSettlement {
        NewSettlement {
            legal_entity_id: fx.le_id,
            book_id: fx.book_id,
            counterparty_id,
            direction: Direction::Ar,
            settlement_date: "2025-03-20".into(),
            cash_account_id: fx.bank,
            allocations,
            idempotency_key: Some(key.into()),
        }
    }

    #[test]
    fn test_partial_then_full_settlement() {
        let (_dir, conn, fx) = fixture();
        let cp = customer(&conn, &fx, "ACME");
        let item = posted_invoice(&conn, &fx, cp.id, "INV-1", 100.0);

        let first = create(
            &conn,
            &fx.ctx,
            &settlement(&fx, cp.id, "s-1", vec![Allocation { open_item_id: item, amount: 40.0 }]),
        )
        .unwrap();
        assert!(!first.idempotent_replay);
        assert_eq!(first.batch.total_amount, 40.0);
        let open = cari::load_open_item(&conn, fx.tenant_id, item).unwrap();
        assert_eq!(open.residual_amount, 60.0);
        assert_eq!(open.status, OpenItemStatus::PartiallySettled);

        let journal = journal::load_detail(
            &conn,
            fx.tenant_id,
            first.batch.journal_entry_id.unwrap(),
        )
        .unwrap();
        let debit = journal.lines.iter().find(|l| l.debit_base > 0.0).unwrap();
        assert_eq!(debit.account_id, fx.bank);
        let credit = journal.lines.iter().find(|l| l.credit_base > 0.0).unwrap();
        assert_eq!(credit.account_id, fx.receivables);
        assert_eq!(credit.subledger_ref_id, Some(cp.id));

        create(
            &conn,
            &fx.ctx,
            &settlement(&fx, cp.id, "s-2", vec![Allocation { open_item_id: item, amount: 60.0 }]),
        )
        .unwrap();
        let open = cari::load_open_item(&conn, fx.tenant_id, item).unwrap();
        assert_eq!(open.residual_amount, 0.0);
        assert_eq!(open.status, OpenItemStatus::Settled);
    }

    #[test]
    fn test_replay_and_mismatch() {
        let (_dir, conn, fx) = fixture();
        let cp = customer(&conn, &fx, "ACME");
        let item = posted_invoice(&conn, &fx, cp.id, "INV-1", 100.0);
        let input = settlement(
            &fx,
            cp.id,
            "s-1",
            vec![Allocation { open_item_id: item, amount: 30.0 }],
        );
        let first = create(&conn, &fx.ctx, &input).unwrap();
        let replay = create(&conn, &fx.ctx, &input).unwrap();
        assert!(replay.idempotent_replay);
        assert_eq!(replay.batch.id, first.batch.id);
        assert_eq!(cari::load_open_item(&conn, fx.tenant_id, item).unwrap().residual_amount, 70.0);

        let changed = settlement(
            &fx,
            cp.id,
            "s-1",
            vec![Allocation { open_item_id: item, amount: 31.0 }],
        );
        let err = create(&conn, &fx.ctx, &changed).unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert_eq!(
            list(&conn, &fx.ctx, &SettlementFilter::default(), Page::default()).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_key_is_required() {
        let (_dir, conn, fx) = fixture();
        let cp = customer(&conn, &fx, "ACME");
        let item = posted_invoice(&conn, &fx, cp.id, "INV-1", 100.0);
        let mut input = settlement(
            &fx,
            cp.id,
            "x",
            vec![Allocation { open_item_id: item, amount: 30.0 }],
        );
        input.idempotency_key = None;
        assert_eq!(create(&conn, &fx.ctx, &input).unwrap_err().status_code(), 400);
    }

    #[test]
    fn test_over_allocation_rejected() {
        let (_dir, conn, fx) = fixture();
        let cp = customer(&conn, &fx, "ACME");
        let item = posted_invoice(&conn, &fx, cp.id, "INV-1", 100.0);
        let input = settlement(
            &fx,
            cp.id,
            "s-1",
            vec![Allocation { open_item_id: item, amount: 100.5 }],
        );
        let err = create(&conn, &fx.ctx, &input).unwrap_err();
        assert!(err.to_string().contains("exceeds the residual"), "{err}");
        assert_eq!(err.details()["line"], 1);
    }

    #[test]
    fn test_items_must_match_counterparty() {
        let (_dir, conn, fx) = fixture();
        let acme = customer(&conn, &fx, "ACME");
        let other = customer(&conn, &fx, "OTHER");
        let item = posted_invoice(&conn, &fx, acme.id, "INV-1", 100.0);
        let input = settlement(
            &fx,
            other.id,
            "s-1",
            vec![Allocation { open_item_id: item, amount: 10.0 }],
        );
        assert_eq!(create(&conn, &fx.ctx, &input).unwrap_err().status_code(), 400);
    }

    #[test]
    fn test_settles_several_items() {
        let (_dir, conn, fx) = fixture();
        let cp = customer(&conn, &fx, "ACME");
        let a = posted_invoice(&conn, &fx, cp.id, "INV-1", 100.0);
        let b = posted_invoice(&conn, &fx, cp.id, "INV-2", 50.0);
        let result = create(
            &conn,
            &fx.ctx,
            &settlement(
                &fx,
                cp.id,
                "s-1",
                vec![
                    Allocation { open_item_id: a, amount: 100.0 },
                    Allocation { open_item_id: b, amount: 25.0 },
                ],
            ),
        )
        .unwrap();
        assert_eq!(result.batch.total_amount, 125.0);
        assert_eq!(result.batch.allocations.len(), 2);
        let fetched = get(&conn, &fx.ctx, result.batch.id).unwrap();
        assert_eq!(fetched.allocations[1].amount, 25.0);
    }
}
