//! Shared seed data for unit tests: one tenant, two legal entities on a
//! GLOBAL chart, a monthly 2025 calendar, a LOCAL book per entity, and purpose
//! mappings for the first entity.

use std::collections::BTreeSet;

use rusqlite::Connection;

use crate::db::{get_connection, init_db};
use crate::journal::{NewJournal, NewLine};
use crate::models::SourceType;
use crate::scope::RequestContext;

pub struct Fixture {
    pub tenant_id: i64,
    pub user_id: i64,
    pub le_id: i64,
    pub le2_id: i64,
    pub ou_id: i64,
    pub ou2_id: i64,
    pub chart_id: i64,
    pub calendar_id: i64,
    pub book_id: i64,
    pub book2_id: i64,
    /// 2025-01 .. 2025-12, in order.
    pub periods: Vec<i64>,
    pub current_assets: i64,
    pub cash: i64,
    pub petty_cash: i64,
    pub bank: i64,
    pub receivables: i64,
    pub ic_receivable: i64,
    pub payables: i64,
    pub ic_payable: i64,
    pub capital: i64,
    pub retained_earnings: i64,
    pub revenue: i64,
    pub expense: i64,
    pub over_short: i64,
    pub inactive: i64,
    pub ctx: RequestContext,
}

fn insert(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> i64 {
    conn.execute(sql, params).unwrap();
    conn.last_insert_rowid()
}

fn account(
    conn: &Connection,
    tenant: i64,
    chart: i64,
    code: &str,
    name: &str,
    kind: &str,
    side: &str,
    parent: Option<i64>,
) -> i64 {
    insert(
        conn,
        "INSERT INTO accounts (tenant_id, chart_id, code, name, account_type, normal_side, parent_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![tenant, chart, code, name, kind, side, parent],
    )
}

pub fn fixture() -> (tempfile::TempDir, Connection, Fixture) {
    let dir = tempfile::tempdir().unwrap();
    let conn = get_connection(&dir.path().join("test.db")).unwrap();
    init_db(&conn).unwrap();

    let tenant_id = insert(
        &conn,
        "INSERT INTO tenants (code, name) VALUES ('ACME', 'Acme Holdings')",
        [],
    );
    let user_id = insert(
        &conn,
        "INSERT INTO users (tenant_id, email, display_name, password_hash, password_salt) \
         VALUES (?1, 'admin@acme.test', 'Admin', 'x', 'y')",
        [tenant_id],
    );
    let le_id = insert(
        &conn,
        "INSERT INTO legal_entities (tenant_id, code, name, base_currency) VALUES (?1, 'HQ', 'Acme HQ', 'USD')",
        [tenant_id],
    );
    let le2_id = insert(
        &conn,
        "INSERT INTO legal_entities (tenant_id, code, name, base_currency) VALUES (?1, 'SUB', 'Acme Sub', 'USD')",
        [tenant_id],
    );
    let ou_id = insert(
        &conn,
        "INSERT INTO operating_units (tenant_id, legal_entity_id, code, name) VALUES (?1, ?2, 'STORE1', 'Store 1')",
        [tenant_id, le_id],
    );
    let ou2_id = insert(
        &conn,
        "INSERT INTO operating_units (tenant_id, legal_entity_id, code, name) VALUES (?1, ?2, 'STORE2', 'Store 2')",
        [tenant_id, le_id],
    );
    let chart_id = insert(
        &conn,
        "INSERT INTO charts_of_accounts (tenant_id, legal_entity_id, code, name) VALUES (?1, NULL, 'GLOBAL', 'Group chart')",
        [tenant_id],
    );

    let current_assets = account(
        &conn,
        tenant_id,
        chart_id,
        "1000",
        "Current Assets",
        "ASSET",
        "DEBIT",
        None,
    );
    let cash = account(
        &conn,
        tenant_id,
        chart_id,
        "1010",
        "Cash",
        "ASSET",
        "DEBIT",
        Some(current_assets),
    );
    let petty_cash = account(
        &conn,
        tenant_id,
        chart_id,
        "1015",
        "Petty Cash",
        "ASSET",
        "DEBIT",
        Some(current_assets),
    );
    let bank = account(
        &conn,
        tenant_id,
        chart_id,
        "1020",
        "Bank",
        "ASSET",
        "DEBIT",
        Some(current_assets),
    );
    let receivables = account(
        &conn,
        tenant_id,
        chart_id,
        "1100",
        "Trade Receivables",
        "ASSET",
        "DEBIT",
        Some(current_assets),
    );
    let ic_receivable = account(
        &conn,
        tenant_id,
        chart_id,
        "1300",
        "Intercompany Receivable",
        "ASSET",
        "DEBIT",
        None,
    );
    let payables = account(
        &conn,
        tenant_id,
        chart_id,
        "2000",
        "Trade Payables",
        "LIABILITY",
        "CREDIT",
        None,
    );
    let ic_payable = account(
        &conn,
        tenant_id,
        chart_id,
        "2300",
        "Intercompany Payable",
        "LIABILITY",
        "CREDIT",
        None,
    );
    let capital = account(
        &conn,
        tenant_id,
        chart_id,
        "3000",
        "Share Capital",
        "EQUITY",
        "CREDIT",
        None,
    );
    let retained_earnings = account(
        &conn,
        tenant_id,
        chart_id,
        "3100",
        "Retained Earnings",
        "EQUITY",
        "CREDIT",
        None,
    );
    let revenue = account(&conn, tenant_id, chart_id, "4000", "Revenue", "REVENUE", "CREDIT", None);
    let expense = account(
        &conn,
        tenant_id,
        chart_id,
        "5000",
        "Operating Expenses",
        "EXPENSE",
        "DEBIT",
        None,
    );
    let over_short = account(
        &conn,
        tenant_id,
        chart_id,
        "5900",
        "Cash Over/Short",
        "EXPENSE",
        "DEBIT",
        None,
    );
    let inactive = account(&conn, tenant_id, chart_id, "5999", "Retired", "EXPENSE", "DEBIT", None);
    conn.execute("UPDATE accounts SET is_active = 0 WHERE id = ?1", [inactive]).unwrap();

    let calendar_id = insert(
        &conn,
        "INSERT INTO fiscal_calendars (tenant_id, code, name) VALUES (?1, 'CAL', 'Calendar year')",
        [tenant_id],
    );
    let mut periods = Vec::new();
    for month in 1..=12u32 {
        let start = chrono::NaiveDate::from_ymd_opt(2025, month, 1).unwrap();
        let end = if month == 12 {
            chrono::NaiveDate::from_ymd_opt(2025, 12, 31).unwrap()
        } else {
            chrono::NaiveDate::from_ymd_opt(2025, month + 1, 1).unwrap() - chrono::Duration::days(1)
        };
        periods.push(insert(
            &conn,
            "INSERT INTO fiscal_periods (calendar_id, fiscal_year, period_no, name, start_date, end_date) \
             VALUES (?1, 2025, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                calendar_id,
                month,
                format!("2025-{month:02}"),
                start.format("%Y-%m-%d").to_string(),
                end.format("%Y-%m-%d").to_string(),
            ],
        ));
    }

    let book_id = insert(
        &conn,
        "INSERT INTO books (tenant_id, legal_entity_id, calendar_id, code, name, book_type, base_currency) \
         VALUES (?1, ?2, ?3, 'HQ-LOCAL', 'HQ local book', 'LOCAL', 'USD')",
        [tenant_id, le_id, calendar_id],
    );
    let book2_id = insert(
        &conn,
        "INSERT INTO books (tenant_id, legal_entity_id, calendar_id, code, name, book_type, base_currency) \
         VALUES (?1, ?2, ?3, 'SUB-LOCAL', 'Sub local book', 'LOCAL', 'USD')",
        [tenant_id, le2_id, calendar_id],
    );

    for (purpose, account_id) in [
        ("RETAINED_EARNINGS", retained_earnings),
        ("AR_CONTROL", receivables),
        ("AP_CONTROL", payables),
        ("CASH_OVER_SHORT", over_short),
        ("OPENING_FLOAT_OFFSET", bank),
    ] {
        conn.execute(
            "INSERT INTO purpose_accounts (tenant_id, legal_entity_id, purpose, account_id) VALUES (?1, NULL, ?2, ?3)",
            rusqlite::params![tenant_id, purpose, account_id],
        )
        .unwrap();
    }

    let ctx = RequestContext {
        tenant_id,
        user_id: Some(user_id),
        permissions: BTreeSet::from(["*".to_string()]),
        legal_entity_ids: None,
        request_id: "test-request".to_string(),
    };

    let fx = Fixture {
        tenant_id,
        user_id,
        le_id,
        le2_id,
        ou_id,
        ou2_id,
        chart_id,
        calendar_id,
        book_id,
        book2_id,
        periods,
        current_assets,
        cash,
        petty_cash,
        bank,
        receivables,
        ic_receivable,
        payables,
        ic_payable,
        capital,
        retained_earnings,
        revenue,
        expense,
        over_short,
        inactive,
        ctx,
    };
    (dir, conn, fx)
}

/// A MANUAL journal header for the HQ book with the given lines.
pub fn manual_journal(fx: &Fixture, date: &str, lines: Vec<NewLine>) -> NewJournal {
    NewJournal {
        legal_entity_id: fx.le_id,
        book_id: fx.book_id,
        fiscal_period_id: None,
        entry_date: date.to_string(),
        document_date: None,
        currency: None,
        source_type: SourceType::Manual,
        source_ref_type: None,
        source_ref_id: None,
        description: Some("test".to_string()),
        lines,
        create_mirror: false,
        mirror_of_journal_id: None,
        reversal_of_journal_id: None,
    }
}
