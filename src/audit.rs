use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::query::{paged, Page, Where};
use crate::scope::{perm, RequestContext};

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub user_id: Option<i64>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<i64>,
    pub request_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditFilter {
    pub resource_type: Option<String>,
    pub resource_id: Option<i64>,
    pub action: Option<String>,
    pub user_id: Option<i64>,
}

pub fn record(
    conn: &Connection,
    ctx: &RequestContext,
    action: &str,
    resource_type: &str,
    resource_id: Option<i64>,
    payload: serde_json::Value,
) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_logs (tenant_id, user_id, action, resource_type, resource_id, request_id, payload) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            ctx.tenant_id,
            ctx.user_id,
            action,
            resource_type,
            resource_id,
            ctx.request_id,
            payload.to_string(),
        ],
    )?;
    Ok(())
}

pub fn list(
    conn: &Connection,
    ctx: &RequestContext,
    filter: &AuditFilter,
    page: Page,
) -> Result<Vec<AuditEntry>> {
    ctx.require_permission(perm::AUDIT_READ)?;
    let w = Where::new()
        .eq("tenant_id", ctx.tenant_id)
        .eq_opt("resource_type", filter.resource_type.clone())
        .eq_opt("resource_id", filter.resource_id)
        .eq_opt("action", filter.action.clone())
        .eq_opt("user_id", filter.user_id);
    let (tail, params) = paged(&w, page);
    let sql = format!(
        "SELECT id, user_id, action, resource_type, resource_id, request_id, payload, created_at \
         FROM audit_logs{} ORDER BY id DESC{tail}",
        w.sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), |row| {
            let payload: Option<String> = row.get(6)?;
            Ok(AuditEntry {
                id: row.get(0)?,
                user_id: row.get(1)?,
                action: row.get(2)?,
                resource_type: row.get(3)?,
                resource_id: row.get(4)?,
                request_id: row.get(5)?,
                payload: payload
                    .and_then(|p| serde_json::from_str(&p).ok())
                    .unwrap_or(serde_json::Value::Null),
                created_at: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
