//! Maker-checker approval requests. A request references its target row;
//! deciding it moves the target through its own state machine.

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::audit;
use crate::cash;
use crate::error::{AppError, Result};
use crate::models::ApprovalStatus;
use crate::query::{paged, Page, Where};
use crate::scope::{perm, RequestContext};

pub const CASH_TRANSACTION: &str = "CASH_TRANSACTION";

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: i64,
    pub target_type: String,
    pub target_id: i64,
    pub action: String,
    pub status: ApprovalStatus,
    pub requested_by: Option<i64>,
    pub requested_at: String,
    pub decided_by: Option<i64>,
    pub decided_at: Option<String>,
    pub decision_note: Option<String>,
}

const COLUMNS: &str = "id, target_type, target_id, action, status, requested_by, requested_at, \
     decided_by, decided_at, decision_note";
const LIST_COLUMNS: &str = "a.id, a.target_type, a.target_id, a.action, a.status, a.requested_by, a.requested_at, \
     a.decided_by, a.decided_at, a.decision_note";

fn from_row(row: &Row) -> rusqlite::Result<ApprovalRequest> {
    Ok(ApprovalRequest {
        id: row.get(0)?,
        target_type: row.get(1)?,
        target_id: row.get(2)?,
        action: row.get(3)?,
        status: row.get(4)?,
        requested_by: row.get(5)?,
        requested_at: row.get(6)?,
        decided_by: row.get(7)?,
        decided_at: row.get(8)?,
        decision_note: row.get(9)?,
    })
}

pub fn load(conn: &Connection, tenant_id: i64, id: i64) -> Result<ApprovalRequest> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM approval_requests WHERE id = ?1 AND tenant_id = ?2"),
        [id, tenant_id],
        from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Approval request {id}")))
}

pub fn pending_for(
    conn: &Connection,
    tenant_id: i64,
    target_type: &str,
    target_id: i64,
) -> Result<Option<ApprovalRequest>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM approval_requests \
                 WHERE tenant_id = ?1 AND target_type = ?2 AND target_id = ?3 AND status = 'PENDING'"
            ),
            rusqlite::params![tenant_id, target_type, target_id],
            from_row,
        )
        .optional()?)
}

/// Open a PENDING request for a target. The caller owns the permission check
/// and the target's own transition.
pub fn create_internal(
    conn: &Connection,
    ctx: &RequestContext,
    target_type: &str,
    target_id: i64,
    action: &str,
) -> Result<i64> {
    if pending_for(conn, ctx.tenant_id, target_type, target_id)?.is_some() {
        return Err(AppError::conflict(format!(
            "{target_type} {target_id} already has a pending approval request"
        )));
    }
    conn.execute(
        "INSERT INTO approval_requests (tenant_id, target_type, target_id, action, requested_by) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![ctx.tenant_id, target_type, target_id, action, ctx.user_id],
    )?;
    let id = conn.last_insert_rowid();
    tracing::info!(approval_id = id, target_type, target_id, action, "approval requested");
    Ok(id)
}

/// Close a pending request without touching its target, e.g. when the target
/// is cancelled.
pub fn withdraw(
    conn: &Connection,
    ctx: &RequestContext,
    target_type: &str,
    target_id: i64,
    note: &str,
) -> Result<Option<i64>> {
    let Some(request) = pending_for(conn, ctx.tenant_id, target_type, target_id)? else {
        return Ok(None);
    };
    conn.execute(
        "UPDATE approval_requests SET status = 'REJECTED', decided_by = ?1, decided_at = datetime('now'), \
         decision_note = ?2 WHERE id = ?3 AND status = 'PENDING'",
        rusqlite::params![ctx.user_id, note, request.id],
    )?;
    Ok(Some(request.id))
}

#[derive(Debug, Default, Deserialize)]
pub struct ApprovalFilter {
    pub status: Option<ApprovalStatus>,
    pub target_type: Option<String>,
}

pub fn list(
    conn: &Connection,
    ctx: &RequestContext,
    filter: &ApprovalFilter,
    page: Page,
) -> Result<Vec<ApprovalRequest>> {
    ctx.require_permission(perm::APPROVAL_DECIDE)?;
    let mut w = Where::new()
        .eq("a.tenant_id", ctx.tenant_id)
        .eq_opt("a.status", filter.status.map(|s| s.as_str().to_string()))
        .eq_opt("a.target_type", filter.target_type.clone());
    // Scope follows the register of the target cash transaction.
    if let Some(ids) = ctx.scoped_ids() {
        w = w.in_ids("r.legal_entity_id", &ids);
    }
    let (tail, params) = paged(&w, page);
    let sql = format!(
        "SELECT {LIST_COLUMNS} FROM approval_requests a \
         LEFT JOIN cash_transactions t ON a.target_type = '{CASH_TRANSACTION}' AND t.id = a.target_id \
         LEFT JOIN cash_registers r ON r.id = t.register_id{} ORDER BY a.id DESC{tail}",
        w.sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Default, Deserialize)]
pub struct DecisionInput {
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Decided {
    pub request: ApprovalRequest,
    /// Status the target moved to.
    pub target_status: String,
}

/// PENDING → APPROVED / REJECTED, then dispatch to the target.
pub fn decide(
    conn: &Connection,
    ctx: &RequestContext,
    id: i64,
    approve: bool,
    input: &DecisionInput,
) -> Result<Decided> {
    ctx.require_permission(perm::APPROVAL_DECIDE)?;
    let request = load(conn, ctx.tenant_id, id)?;
    if request.status != ApprovalStatus::Pending {
        return Err(AppError::conflict(format!(
            "Approval request {id} is already {}",
            request.status
        )));
    }
    if ctx.user_id.is_some() && ctx.user_id == request.requested_by {
        return Err(AppError::forbidden("Requesters cannot decide their own approval request"));
    }

    let target_status = match request.target_type.as_str() {
        CASH_TRANSACTION => {
            cash::apply_decision(conn, ctx, request.target_id, approve)?.to_string()
        }
        other => {
            return Err(AppError::validation(format!("Unknown approval target type '{other}'")));
        }
    };

    let status = if approve { ApprovalStatus::Approved } else { ApprovalStatus::Rejected };
    let updated = conn.execute(
        "UPDATE approval_requests SET status = ?1, decided_by = ?2, decided_at = datetime('now'), decision_note = ?3 \
         WHERE id = ?4 AND status = 'PENDING'",
        rusqlite::params![status, ctx.user_id, input.note, id],
    )?;
    if updated == 0 {
        return Err(AppError::conflict(format!("Approval request {id} was decided concurrently")));
    }
    audit::record(
        conn,
        ctx,
        if approve { "approval.approve" } else { "approval.reject" },
        "approval_request",
        Some(id),
        serde_json::json!({
            "target_type": request.target_type,
            "target_id": request.target_id,
            "target_status": target_status,
            "note": input.note,
        }),
    )?;
    tracing::info!(
        approval_id = id,
        status = %status,
        target_status = %target_status,
        "approval decided"
    );
    Ok(Decided {
        request: load(conn, ctx.tenant_id, id)?,
        target_status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;

    #[test]
    fn test_one_pending_request_per_target() {
        let (_dir, conn, fx) = fixture();
        let id = create_internal(&conn, &fx.ctx, "PAYMENT", 7, "POST").unwrap();
        let err = create_internal(&conn, &fx.ctx, "PAYMENT", 7, "POST").unwrap_err();
        assert_eq!(err.status_code(), 409);
        let pending = pending_for(&conn, fx.tenant_id, "PAYMENT", 7).unwrap().unwrap();
        assert_eq!(pending.id, id);
        assert_eq!(pending.requested_by, Some(fx.user_id));
    }

    #[test]
    fn test_withdraw_clears_pending() {
        let (_dir, conn, fx) = fixture();
        let id = create_internal(&conn, &fx.ctx, "PAYMENT", 7, "POST").unwrap();
        assert_eq!(withdraw(&conn, &fx.ctx, "PAYMENT", 7, "cancelled").unwrap(), Some(id));
        assert!(pending_for(&conn, fx.tenant_id, "PAYMENT", 7).unwrap().is_none());
        assert_eq!(load(&conn, fx.tenant_id, id).unwrap().status, ApprovalStatus::Rejected);
        create_internal(&conn, &fx.ctx, "PAYMENT", 7, "POST").unwrap();
    }

    #[test]
    fn test_requester_cannot_decide() {
        let (_dir, conn, fx) = fixture();
        let id = create_internal(&conn, &fx.ctx, CASH_TRANSACTION, 1, "POST").unwrap();
        let err = decide(&conn, &fx.ctx, id, true, &DecisionInput::default()).unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn test_unknown_target_is_rejected() {
        let (_dir, conn, fx) = fixture();
        let id = create_internal(&conn, &fx.ctx, "PAYMENT", 1, "POST").unwrap();
        let checker = RequestContext { user_id: Some(fx.user_id + 100), ..fx.ctx.clone() };
        let err = decide(&conn, &checker, id, true, &DecisionInput::default()).unwrap_err();
        assert_eq!(err.status_code(), 400);
        let listed = list(&conn, &fx.ctx, &ApprovalFilter::default(), Page::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ApprovalStatus::Pending);
    }
}
