use rusqlite::{Connection, OptionalExtension, Row};
use serde::Deserialize;

use crate::audit;
use crate::error::{AppError, Result};
use crate::models::{Book, Chart, LegalEntity, OperatingUnit};
use crate::scope::{assert_scope_access, perm, RequestContext};

// ---------------------------------------------------------------------------
// Legal entities
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct NewLegalEntity {
    pub code: String,
    pub name: String,
    pub base_currency: String,
    #[serde(default)]
    pub requires_ic_partner: bool,
}

fn legal_entity_from_row(row: &Row) -> rusqlite::Result<LegalEntity> {
    Ok(LegalEntity {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        code: row.get(2)?,
        name: row.get(3)?,
        base_currency: row.get(4)?,
        requires_ic_partner: row.get(5)?,
    })
}

const LEGAL_ENTITY_COLUMNS: &str = "id, tenant_id, code, name, base_currency, requires_ic_partner";

pub fn load_legal_entity(conn: &Connection, tenant_id: i64, id: i64) -> Result<LegalEntity> {
    conn.query_row(
        &format!(
            "SELECT {LEGAL_ENTITY_COLUMNS} FROM legal_entities WHERE id = ?1 AND tenant_id = ?2"
        ),
        [id, tenant_id],
        legal_entity_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Legal entity {id}")))
}

pub fn list_legal_entities(conn: &Connection, ctx: &RequestContext) -> Result<Vec<LegalEntity>> {
    ctx.require_permission(perm::ORG_READ)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {LEGAL_ENTITY_COLUMNS} FROM legal_entities WHERE tenant_id = ?1 ORDER BY code"
    ))?;
    let rows = stmt
        .query_map([ctx.tenant_id], legal_entity_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().filter(|le| ctx.can_access(le.id)).collect())
}

pub fn create_legal_entity(
    conn: &Connection,
    ctx: &RequestContext,
    input: &NewLegalEntity,
) -> Result<LegalEntity> {
    ctx.require_permission(perm::ORG_WRITE)?;
    if ctx.legal_entity_ids.is_some() {
        return Err(AppError::forbidden("Creating legal entities requires tenant-wide scope"));
    }
    let code = input.code.trim();
    if code.is_empty() || input.name.trim().is_empty() {
        return Err(AppError::validation("Legal entity code and name are required"));
    }
    validate_currency(&input.base_currency)?;
    let exists = conn
        .prepare("SELECT 1 FROM legal_entities WHERE tenant_id = ?1 AND code = ?2")?
        .exists(rusqlite::params![ctx.tenant_id, code])?;
    if exists {
        return Err(AppError::conflict(format!("Legal entity '{code}' already exists")));
    }
    conn.execute(
        "INSERT INTO legal_entities (tenant_id, code, name, base_currency, requires_ic_partner) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            ctx.tenant_id,
            code,
            input.name.trim(),
            input.base_currency.to_uppercase(),
            input.requires_ic_partner,
        ],
    )?;
    let id = conn.last_insert_rowid();
    audit::record(
        conn,
        ctx,
        "legal_entity.create",
        "legal_entity",
        Some(id),
        serde_json::json!({ "code": code }),
    )?;
    load_legal_entity(conn, ctx.tenant_id, id)
}

pub fn validate_currency(raw: &str) -> Result<()> {
    if raw.len() == 3 && raw.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(())
    } else {
        Err(AppError::validation(format!("Invalid currency code '{raw}'")))
    }
}

// ---------------------------------------------------------------------------
// Operating units
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct NewOperatingUnit {
    pub code: String,
    pub name: String,
}

pub fn load_operating_unit(conn: &Connection, tenant_id: i64, id: i64) -> Result<OperatingUnit> {
    conn.query_row(
        "SELECT id, tenant_id, legal_entity_id, code, name FROM operating_units WHERE id = ?1 AND tenant_id = ?2",
        [id, tenant_id],
        |row| {
            Ok(OperatingUnit {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                legal_entity_id: row.get(2)?,
                code: row.get(3)?,
                name: row.get(4)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Operating unit {id}")))
}

pub fn create_operating_unit(
    conn: &Connection,
    ctx: &RequestContext,
    legal_entity_id: i64,
    input: &NewOperatingUnit,
) -> Result<OperatingUnit> {
    ctx.require_permission(perm::ORG_WRITE)?;
    assert_scope_access(conn, ctx, legal_entity_id)?;
    let code = input.code.trim();
    if code.is_empty() {
        return Err(AppError::validation("Operating unit code is required"));
    }
    let exists = conn
        .prepare("SELECT 1 FROM operating_units WHERE legal_entity_id = ?1 AND code = ?2")?
        .exists(rusqlite::params![legal_entity_id, code])?;
    if exists {
        return Err(AppError::conflict(format!("Operating unit '{code}' already exists")));
    }
    conn.execute(
        "INSERT INTO operating_units (tenant_id, legal_entity_id, code, name) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![ctx.tenant_id, legal_entity_id, code, input.name.trim()],
    )?;
    let id = conn.last_insert_rowid();
    audit::record(
        conn,
        ctx,
        "operating_unit.create",
        "operating_unit",
        Some(id),
        serde_json::json!({ "legal_entity_id": legal_entity_id, "code": code }),
    )?;
    load_operating_unit(conn, ctx.tenant_id, id)
}

// ---------------------------------------------------------------------------
// Charts of accounts
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct NewChart {
    pub code: String,
    pub name: String,
    /// Omit for a GLOBAL chart.
    pub legal_entity_id: Option<i64>,
}

fn chart_from_row(row: &Row) -> rusqlite::Result<Chart> {
    Ok(Chart {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        legal_entity_id: row.get(2)?,
        code: row.get(3)?,
        name: row.get(4)?,
    })
}

pub fn load_chart(conn: &Connection, tenant_id: i64, id: i64) -> Result<Chart> {
    conn.query_row(
        "SELECT id, tenant_id, legal_entity_id, code, name FROM charts_of_accounts WHERE id = ?1 AND tenant_id = ?2",
        [id, tenant_id],
        chart_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Chart {id}")))
}

pub fn list_charts(conn: &Connection, ctx: &RequestContext) -> Result<Vec<Chart>> {
    ctx.require_permission(perm::ACCOUNT_READ)?;
    let mut stmt = conn.prepare(
        "SELECT id, tenant_id, legal_entity_id, code, name FROM charts_of_accounts WHERE tenant_id = ?1 ORDER BY code",
    )?;
    let rows = stmt
        .query_map([ctx.tenant_id], chart_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|c| c.legal_entity_id.map_or(true, |le| ctx.can_access(le)))
        .collect())
}

pub fn create_chart(conn: &Connection, ctx: &RequestContext, input: &NewChart) -> Result<Chart> {
    ctx.require_permission(perm::ACCOUNT_WRITE)?;
    match input.legal_entity_id {
        Some(le) => assert_scope_access(conn, ctx, le)?,
        None if ctx.legal_entity_ids.is_some() => {
            return Err(AppError::forbidden("GLOBAL charts require tenant-wide scope"));
        }
        None => {}
    }
    let code = input.code.trim();
    if code.is_empty() {
        return Err(AppError::validation("Chart code is required"));
    }
    let exists = conn
        .prepare("SELECT 1 FROM charts_of_accounts WHERE tenant_id = ?1 AND code = ?2")?
        .exists(rusqlite::params![ctx.tenant_id, code])?;
    if exists {
        return Err(AppError::conflict(format!("Chart '{code}' already exists")));
    }
    conn.execute(
        "INSERT INTO charts_of_accounts (tenant_id, legal_entity_id, code, name) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![ctx.tenant_id, input.legal_entity_id, code, input.name.trim()],
    )?;
    let id = conn.last_insert_rowid();
    audit::record(
        conn,
        ctx,
        "chart.create",
        "chart",
        Some(id),
        serde_json::json!({ "code": code }),
    )?;
    load_chart(conn, ctx.tenant_id, id)
}

// ---------------------------------------------------------------------------
// Books
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct NewBook {
    pub legal_entity_id: i64,
    pub calendar_id: i64,
    pub code: String,
    pub name: String,
    pub book_type: String,
    pub base_currency: Option<String>,
}

const BOOK_COLUMNS: &str = "id, tenant_id, legal_entity_id, calendar_id, code, name, book_type, base_currency";

fn book_from_row(row: &Row) -> rusqlite::Result<Book> {
    Ok(Book {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        legal_entity_id: row.get(2)?,
        calendar_id: row.get(3)?,
        code: row.get(4)?,
        name: row.get(5)?,
        book_type: row.get(6)?,
        base_currency: row.get(7)?,
    })
}

pub fn load_book(conn: &Connection, tenant_id: i64, id: i64) -> Result<Book> {
    conn.query_row(
        &format!("SELECT {BOOK_COLUMNS} FROM books WHERE id = ?1 AND tenant_id = ?2"),
        [id, tenant_id],
        book_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Book {id}")))
}

/// The partner entity's book of the same type, used for intercompany mirrors.
pub fn find_book_by_type(
    conn: &Connection,
    tenant_id: i64,
    legal_entity_id: i64,
    book_type: &str,
) -> Result<Option<Book>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {BOOK_COLUMNS} FROM books WHERE tenant_id = ?1 AND legal_entity_id = ?2 AND book_type = ?3 \
                 ORDER BY id LIMIT 1"
            ),
            rusqlite::params![tenant_id, legal_entity_id, book_type],
            book_from_row,
        )
        .optional()?)
}

pub fn list_books(
    conn: &Connection,
    ctx: &RequestContext,
    legal_entity_id: Option<i64>,
) -> Result<Vec<Book>> {
    ctx.require_permission(perm::ORG_READ)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {BOOK_COLUMNS} FROM books WHERE tenant_id = ?1 ORDER BY code"
    ))?;
    let rows = stmt
        .query_map([ctx.tenant_id], book_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|b| ctx.can_access(b.legal_entity_id))
        .filter(|b| legal_entity_id.map_or(true, |le| b.legal_entity_id == le))
        .collect())
}

pub fn create_book(conn: &Connection, ctx: &RequestContext, input: &NewBook) -> Result<Book> {
    ctx.require_permission(perm::ORG_WRITE)?;
    assert_scope_access(conn, ctx, input.legal_entity_id)?;
    let le = load_legal_entity(conn, ctx.tenant_id, input.legal_entity_id)?;
    let calendar_ok = conn
        .prepare("SELECT 1 FROM fiscal_calendars WHERE id = ?1 AND tenant_id = ?2")?
        .exists([input.calendar_id, ctx.tenant_id])?;
    if !calendar_ok {
        return Err(AppError::not_found(format!("Fiscal calendar {}", input.calendar_id)));
    }
    let code = input.code.trim();
    let book_type = input.book_type.trim().to_uppercase();
    if code.is_empty() || book_type.is_empty() {
        return Err(AppError::validation("Book code and book type are required"));
    }
    let currency = input.base_currency.clone().unwrap_or(le.base_currency).to_uppercase();
    validate_currency(&currency)?;
    let exists = conn
        .prepare("SELECT 1 FROM books WHERE tenant_id = ?1 AND code = ?2")?
        .exists(rusqlite::params![ctx.tenant_id, code])?;
    if exists {
        return Err(AppError::conflict(format!("Book '{code}' already exists")));
    }
    conn.execute(
        "INSERT INTO books (tenant_id, legal_entity_id, calendar_id, code, name, book_type, base_currency) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            ctx.tenant_id,
            input.legal_entity_id,
            input.calendar_id,
            code,
            input.name.trim(),
            book_type,
            currency,
        ],
    )?;
    let id = conn.last_insert_rowid();
    audit::record(
        conn,
        ctx,
        "book.create",
        "book",
        Some(id),
        serde_json::json!({ "code": code, "book_type": book_type }),
    )?;
    load_book(conn, ctx.tenant_id, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;

    #[test]
    fn test_create_and_list_legal_entities() {
        let (_dir, conn, fx) = fixture();
        let le = create_legal_entity(
            &conn,
            &fx.ctx,
            &NewLegalEntity {
                code: "EU".into(),
                name: "Acme Europe".into(),
                base_currency: "eur".into(),
                requires_ic_partner: true,
            },
        )
        .unwrap();
        assert_eq!(le.base_currency, "EUR");
        assert!(le.requires_ic_partner);
        let all = list_legal_entities(&conn, &fx.ctx).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_duplicate_legal_entity_code_conflicts() {
        let (_dir, conn, fx) = fixture();
        let input = NewLegalEntity {
            code: "HQ".into(),
            name: "Again".into(),
            base_currency: "USD".into(),
            requires_ic_partner: false,
        };
        let err = create_legal_entity(&conn, &fx.ctx, &input).unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_scoped_user_sees_only_their_entities() {
        let (_dir, conn, fx) = fixture();
        let mut ctx = fx.ctx.clone();
        ctx.legal_entity_ids = Some([fx.le2_id].into_iter().collect());
        let visible = list_legal_entities(&conn, &ctx).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].code, "SUB");

        let books = list_books(&conn, &ctx, None).unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].id, fx.book2_id);

        let err = create_operating_unit(
            &conn,
            &ctx,
            fx.le_id,
            &NewOperatingUnit { code: "X".into(), name: "X".into() },
        )
        .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn test_create_book_defaults_currency_from_entity() {
        let (_dir, conn, fx) = fixture();
        let book = create_book(
            &conn,
            &fx.ctx,
            &NewBook {
                legal_entity_id: fx.le_id,
                calendar_id: fx.calendar_id,
                code: "HQ-GROUP".into(),
                name: "HQ group book".into(),
                book_type: "group".into(),
                base_currency: None,
            },
        )
        .unwrap();
        assert_eq!(book.base_currency, "USD");
        assert_eq!(book.book_type, "GROUP");
        let found = find_book_by_type(&conn, fx.tenant_id, fx.le_id, "GROUP").unwrap();
        assert_eq!(found.map(|b| b.id), Some(book.id));
    }

    #[test]
    fn test_entity_of_other_tenant_is_not_found() {
        let (_dir, conn, fx) = fixture();
        let mut ctx = fx.ctx.clone();
        ctx.tenant_id += 1;
        let err = create_operating_unit(
            &conn,
            &ctx,
            fx.le_id,
            &NewOperatingUnit { code: "X".into(), name: "X".into() },
        )
        .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}
