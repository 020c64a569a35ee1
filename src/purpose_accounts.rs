//! Purpose-account configuration: which GL account plays a system role
//! (retained earnings, AR/AP control, cash over/short, opening float offset)
//! for a tenant or one of its legal entities.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::accounts::load_account;
use crate::audit;
use crate::error::{AppError, Result};
use crate::models::{Account, Purpose};
use crate::scope::{assert_scope_access, perm, RequestContext};

/// Resolved mapping for one legal entity. Entity rows override tenant rows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PurposeAccounts {
    pub legal_entity_id: i64,
    pub accounts: BTreeMap<Purpose, i64>,
}

impl PurposeAccounts {
    pub fn get(&self, purpose: Purpose) -> Option<i64> {
        self.accounts.get(&purpose).copied()
    }
}

pub fn resolve(conn: &Connection, tenant_id: i64, legal_entity_id: i64) -> Result<PurposeAccounts> {
    let mut stmt = conn.prepare(
        "SELECT purpose, account_id FROM purpose_accounts \
         WHERE tenant_id = ?1 AND (legal_entity_id IS NULL OR legal_entity_id = ?2) \
         ORDER BY legal_entity_id IS NOT NULL",
    )?;
    let rows = stmt
        .query_map([tenant_id, legal_entity_id], |row| {
            Ok((row.get::<_, Purpose>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    // Tenant rows come first; entity rows overwrite them.
    let accounts = rows.into_iter().collect();
    Ok(PurposeAccounts {
        legal_entity_id,
        accounts,
    })
}

/// Resolve one purpose and re-validate the mapped account at use time.
pub fn require(
    conn: &Connection,
    tenant_id: i64,
    legal_entity_id: i64,
    purpose: Purpose,
) -> Result<Account> {
    let mapping = resolve(conn, tenant_id, legal_entity_id)?;
    let account_id = mapping.get(purpose).ok_or_else(|| {
        AppError::validation(format!(
            "No {purpose} purpose account is configured for legal entity {legal_entity_id}"
        ))
    })?;
    let account = load_account(conn, tenant_id, account_id)?;
    account
        .check_postable(legal_entity_id)
        .map_err(|reason| {
            AppError::validation(format!("{purpose} purpose account is unusable: {reason}"))
        })?;
    Ok(account)
}

#[derive(Debug, Deserialize)]
pub struct SetPurposeAccount {
    pub purpose: Purpose,
    pub account_id: i64,
    /// Omit to set the tenant-wide default.
    pub legal_entity_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PurposeAccountRow {
    pub purpose: Purpose,
    pub legal_entity_id: Option<i64>,
    pub account_id: i64,
    pub account_code: String,
    pub updated_at: String,
}

pub fn set(
    conn: &Connection,
    ctx: &RequestContext,
    input: &SetPurposeAccount,
) -> Result<PurposeAccountRow> {
    ctx.require_permission(perm::CONFIG_WRITE)?;
    let account = load_account(conn, ctx.tenant_id, input.account_id)?;
    match input.legal_entity_id {
        Some(le) => {
            assert_scope_access(conn, ctx, le)?;
            account
                .check_postable(le)
                .map_err(|reason| {
                    AppError::validation(format!("Cannot map {}: {reason}", input.purpose))
                })?;
        }
        None => {
            if ctx.legal_entity_ids.is_some() {
                return Err(AppError::forbidden(
                    "Tenant-wide purpose accounts require tenant-wide scope",
                ));
            }
            if account.chart_legal_entity_id.is_some() {
                return Err(AppError::validation(
                    "Tenant-wide purpose accounts must come from a GLOBAL chart",
                ));
            }
            if !account.is_active || !account.is_postable || account.has_children {
                return Err(AppError::validation(format!(
                    "Cannot map {}: account {} is not an active postable leaf",
                    input.purpose, account.code
                )));
            }
        }
    }

    let updated = conn.execute(
        "UPDATE purpose_accounts SET account_id = ?4, updated_at = datetime('now') \
         WHERE tenant_id = ?1 AND legal_entity_id IS ?2 AND purpose = ?3",
        rusqlite::params![ctx.tenant_id, input.legal_entity_id, input.purpose, input.account_id],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO purpose_accounts (tenant_id, legal_entity_id, purpose, account_id) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                ctx.tenant_id,
                input.legal_entity_id,
                input.purpose,
                input.account_id,
            ],
        )?;
    }
    audit::record(
        conn,
        ctx,
        "purpose_account.set",
        "purpose_account",
        None,
        serde_json::json!({
            "purpose": input.purpose,
            "legal_entity_id": input.legal_entity_id,
            "account_id": input.account_id,
        }),
    )?;
    tracing::info!(purpose = %input.purpose, account = %account.code, "purpose account mapped");

    list(conn, ctx, input.legal_entity_id)?
        .into_iter()
        .find(|row| row.purpose == input.purpose && row.legal_entity_id == input.legal_entity_id)
        .ok_or_else(|| AppError::Internal("purpose account row vanished after upsert".to_string()))
}

/// Raw configuration rows: tenant defaults plus, when given, one entity's overrides.
pub fn list(
    conn: &Connection,
    ctx: &RequestContext,
    legal_entity_id: Option<i64>,
) -> Result<Vec<PurposeAccountRow>> {
    ctx.require_permission(perm::CONFIG_READ)?;
    if let Some(le) = legal_entity_id {
        assert_scope_access(conn, ctx, le)?;
    }
    let mut stmt = conn.prepare(
        "SELECT p.purpose, p.legal_entity_id, p.account_id, a.code, p.updated_at \
         FROM purpose_accounts p JOIN accounts a ON a.id = p.account_id \
         WHERE p.tenant_id = ?1 AND (p.legal_entity_id IS NULL OR p.legal_entity_id = ?2) \
         ORDER BY p.purpose, p.legal_entity_id",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![ctx.tenant_id, legal_entity_id], |row| {
            Ok(PurposeAccountRow {
                purpose: row.get(0)?,
                legal_entity_id: row.get(1)?,
                account_id: row.get(2)?,
                account_code: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;

    #[test]
    fn test_tenant_defaults_resolve() {
        let (_dir, conn, fx) = fixture();
        let mapping = resolve(&conn, fx.tenant_id, fx.le_id).unwrap();
        assert_eq!(mapping.get(Purpose::RetainedEarnings), Some(fx.retained_earnings));
        assert_eq!(mapping.get(Purpose::ArControl), Some(fx.receivables));
    }

    #[test]
    fn test_entity_override_wins() {
        let (_dir, conn, fx) = fixture();
        set(
            &conn,
            &fx.ctx,
            &SetPurposeAccount {
                purpose: Purpose::CashOverShort,
                account_id: fx.expense,
                legal_entity_id: Some(fx.le2_id),
            },
        )
        .unwrap();
        let sub = resolve(&conn, fx.tenant_id, fx.le2_id).unwrap();
        assert_eq!(sub.get(Purpose::CashOverShort), Some(fx.expense));
        let hq = resolve(&conn, fx.tenant_id, fx.le_id).unwrap();
        assert_eq!(hq.get(Purpose::CashOverShort), Some(fx.over_short));
    }

    #[test]
    fn test_set_replaces_existing_mapping() {
        let (_dir, conn, fx) = fixture();
        let row = set(
            &conn,
            &fx.ctx,
            &SetPurposeAccount {
                purpose: Purpose::RetainedEarnings,
                account_id: fx.capital,
                legal_entity_id: None,
            },
        )
        .unwrap();
        assert_eq!(row.account_code, "3000");
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM purpose_accounts WHERE purpose = 'RETAINED_EARNINGS'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_require_rejects_missing_and_unusable() {
        let (_dir, conn, fx) = fixture();
        conn.execute("DELETE FROM purpose_accounts WHERE purpose = 'AP_CONTROL'", []).unwrap();
        let err = require(&conn, fx.tenant_id, fx.le_id, Purpose::ApControl).unwrap_err();
        assert!(err.to_string().contains("AP_CONTROL"));

        conn.execute("UPDATE accounts SET is_active = 0 WHERE id = ?1", [fx.retained_earnings])
            .unwrap();
        let err = require(&conn, fx.tenant_id, fx.le_id, Purpose::RetainedEarnings).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("inactive"));
    }

    #[test]
    fn test_set_rejects_parent_account() {
        let (_dir, conn, fx) = fixture();
        let err = set(
            &conn,
            &fx.ctx,
            &SetPurposeAccount {
                purpose: Purpose::ArControl,
                account_id: fx.current_assets,
                legal_entity_id: Some(fx.le_id),
            },
        )
        .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
