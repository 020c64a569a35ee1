use rusqlite::{Connection, OptionalExtension, Row};
use serde::Deserialize;

use crate::audit;
use crate::error::{AppError, Result};
use crate::models::{Account, AccountType, NormalSide};
use crate::org;
use crate::scope::{assert_scope_access, perm, RequestContext};

const ACCOUNT_SELECT: &str = "SELECT a.id, a.tenant_id, a.chart_id, c.legal_entity_id, a.code, a.name, \
     a.account_type, a.normal_side, a.parent_id, a.is_postable, a.is_active, \
     EXISTS (SELECT 1 FROM accounts ch WHERE ch.parent_id = a.id) \
     FROM accounts a JOIN charts_of_accounts c ON c.id = a.chart_id";

fn account_from_row(row: &Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        chart_id: row.get(2)?,
        chart_legal_entity_id: row.get(3)?,
        code: row.get(4)?,
        name: row.get(5)?,
        account_type: row.get(6)?,
        normal_side: row.get(7)?,
        parent_id: row.get(8)?,
        is_postable: row.get(9)?,
        is_active: row.get(10)?,
        has_children: row.get(11)?,
    })
}

pub fn load_account(conn: &Connection, tenant_id: i64, id: i64) -> Result<Account> {
    conn.query_row(
        &format!("{ACCOUNT_SELECT} WHERE a.id = ?1 AND a.tenant_id = ?2"),
        [id, tenant_id],
        account_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Account {id}")))
}

/// Resolve an account by code for a legal entity: an entity-bound chart wins
/// over a GLOBAL one.
pub fn find_by_code(
    conn: &Connection,
    tenant_id: i64,
    legal_entity_id: i64,
    code: &str,
) -> Result<Option<Account>> {
    Ok(conn
        .query_row(
            &format!(
                "{ACCOUNT_SELECT} WHERE a.tenant_id = ?1 AND a.code = ?2 \
                 AND (c.legal_entity_id = ?3 OR c.legal_entity_id IS NULL) \
                 ORDER BY c.legal_entity_id IS NULL, a.id LIMIT 1"
            ),
            rusqlite::params![tenant_id, code, legal_entity_id],
            account_from_row,
        )
        .optional()?)
}

impl Account {
    pub fn usable_by(&self, legal_entity_id: i64) -> bool {
        self.chart_legal_entity_id.map_or(true, |le| le == legal_entity_id)
    }

    /// Whether journal lines may be booked to this account for the entity.
    pub fn check_postable(&self, legal_entity_id: i64) -> std::result::Result<(), String> {
        if !self.is_active {
            return Err(format!("account {} is inactive", self.code));
        }
        if !self.is_postable {
            return Err(format!("account {} is not postable", self.code));
        }
        if self.has_children {
            return Err(format!("account {} is a roll-up parent", self.code));
        }
        if !self.usable_by(legal_entity_id) {
            return Err(format!("account {} belongs to another legal entity's chart", self.code));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AccountFilter {
    pub chart_id: Option<i64>,
    pub account_type: Option<AccountType>,
    pub include_inactive: Option<bool>,
}

pub fn list(
    conn: &Connection,
    ctx: &RequestContext,
    filter: &AccountFilter,
) -> Result<Vec<Account>> {
    ctx.require_permission(perm::ACCOUNT_READ)?;
    let mut stmt = conn.prepare(&format!(
        "{ACCOUNT_SELECT} WHERE a.tenant_id = ?1 ORDER BY a.code, a.id"
    ))?;
    let rows = stmt
        .query_map([ctx.tenant_id], account_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let include_inactive = filter.include_inactive.unwrap_or(false);
    Ok(rows
        .into_iter()
        .filter(|a| a.chart_legal_entity_id.map_or(true, |le| ctx.can_access(le)))
        .filter(|a| filter.chart_id.map_or(true, |c| a.chart_id == c))
        .filter(|a| filter.account_type.map_or(true, |t| a.account_type == t))
        .filter(|a| include_inactive || a.is_active)
        .collect())
}

pub fn get(conn: &Connection, ctx: &RequestContext, id: i64) -> Result<Account> {
    ctx.require_permission(perm::ACCOUNT_READ)?;
    let account = load_account(conn, ctx.tenant_id, id)?;
    if let Some(le) = account.chart_legal_entity_id {
        assert_scope_access(conn, ctx, le)?;
    }
    Ok(account)
}

#[derive(Debug, Deserialize)]
pub struct NewAccount {
    pub chart_id: i64,
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    pub normal_side: Option<NormalSide>,
    pub parent_id: Option<i64>,
    #[serde(default = "default_true")]
    pub is_postable: bool,
}

fn default_true() -> bool {
    true
}

pub fn create(conn: &Connection, ctx: &RequestContext, input: &NewAccount) -> Result<Account> {
    ctx.require_permission(perm::ACCOUNT_WRITE)?;
    let chart = org::load_chart(conn, ctx.tenant_id, input.chart_id)?;
    if let Some(le) = chart.legal_entity_id {
        assert_scope_access(conn, ctx, le)?;
    }
    let code = input.code.trim();
    if code.is_empty() || input.name.trim().is_empty() {
        return Err(AppError::validation("Account code and name are required"));
    }
    if let Some(parent_id) = input.parent_id {
        let parent = load_account(conn, ctx.tenant_id, parent_id)?;
        if parent.chart_id != chart.id {
            return Err(AppError::validation("Parent account must belong to the same chart"));
        }
    }
    let exists = conn
        .prepare("SELECT 1 FROM accounts WHERE chart_id = ?1 AND code = ?2")?
        .exists(rusqlite::params![chart.id, code])?;
    if exists {
        return Err(AppError::conflict(format!(
            "Account '{code}' already exists in chart {}",
            chart.code
        )));
    }
    let side = input
        .normal_side
        .unwrap_or_else(|| input.account_type.default_normal_side());
    conn.execute(
        "INSERT INTO accounts (tenant_id, chart_id, code, name, account_type, normal_side, parent_id, is_postable) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            ctx.tenant_id,
            chart.id,
            code,
            input.name.trim(),
            input.account_type,
            side,
            input.parent_id,
            input.is_postable,
        ],
    )?;
    let id = conn.last_insert_rowid();
    audit::record(
        conn,
        ctx,
        "account.create",
        "account",
        Some(id),
        serde_json::json!({ "code": code, "chart_id": chart.id }),
    )?;
    load_account(conn, ctx.tenant_id, id)
}

#[derive(Debug, Default, Deserialize)]
pub struct AccountPatch {
    pub name: Option<String>,
    pub is_active: Option<bool>,
    pub is_postable: Option<bool>,
}

pub fn update(
    conn: &Connection,
    ctx: &RequestContext,
    id: i64,
    patch: &AccountPatch,
) -> Result<Account> {
    ctx.require_permission(perm::ACCOUNT_WRITE)?;
    let account = load_account(conn, ctx.tenant_id, id)?;
    if let Some(le) = account.chart_legal_entity_id {
        assert_scope_access(conn, ctx, le)?;
    }
    if let Some(name) = &patch.name {
        if name.trim().is_empty() {
            return Err(AppError::validation("Account name cannot be empty"));
        }
        conn.execute(
            "UPDATE accounts SET name = ?1 WHERE id = ?2",
            rusqlite::params![name.trim(), id],
        )?;
    }
    if let Some(active) = patch.is_active {
        conn.execute(
            "UPDATE accounts SET is_active = ?1 WHERE id = ?2",
            rusqlite::params![active, id],
        )?;
    }
    if let Some(postable) = patch.is_postable {
        conn.execute(
            "UPDATE accounts SET is_postable = ?1 WHERE id = ?2",
            rusqlite::params![postable, id],
        )?;
    }
    audit::record(
        conn,
        ctx,
        "account.update",
        "account",
        Some(id),
        serde_json::json!({
            "name": patch.name,
            "is_active": patch.is_active,
            "is_postable": patch.is_postable,
        }),
    )?;
    load_account(conn, ctx.tenant_id, id)
}
