use chrono::{Datelike, Local};
use colored::Colorize;
use rusqlite::Connection;

use super::open_db;
use crate::accounts::{self, NewAccount};
use crate::auth;
use crate::bank::{self, AutoApplyInput, ImportInput, NewRule};
use crate::cari::{self, NewCounterparty, NewDocument};
use crate::db::in_transaction;
use crate::error::Result;
use crate::journal::{self, NewJournal, NewLine};
use crate::models::{AccountType, Book, CounterpartyKind, Direction, MatchType, Purpose, SourceType};
use crate::org::{self, NewBook, NewChart, NewLegalEntity};
use crate::periods::{self, GeneratePeriods, NewCalendar};
use crate::posting::{self, PostOptions};
use crate::purpose_accounts::{self, SetPurposeAccount};
use crate::scope::RequestContext;
use crate::settlement::{self, Allocation, NewSettlement};

pub const TENANT_CODE: &str = "DEMO";
pub const ADMIN_EMAIL: &str = "admin@demo.local";
const ADMIN_PASSWORD: &str = "demo-password";

/// (code, name, type, parent code)
const CHART: &[(&str, &str, AccountType, Option<&str>)] = &[
    ("1000", "Current Assets", AccountType::Asset, None),
    ("1010", "Cash on Hand", AccountType::Asset, Some("1000")),
    ("1020", "Operating Bank", AccountType::Asset, Some("1000")),
    ("1100", "Trade Receivables", AccountType::Asset, Some("1000")),
    ("2000", "Trade Payables", AccountType::Liability, None),
    ("3000", "Share Capital", AccountType::Equity, None),
    ("3100", "Retained Earnings", AccountType::Equity, None),
    ("4000", "Consulting Revenue", AccountType::Revenue, None),
    ("5000", "Rent", AccountType::Expense, None),
    ("5100", "Software Subscriptions", AccountType::Expense, None),
    ("5200", "Bank Fees", AccountType::Expense, None),
    ("5900", "Cash Over/Short", AccountType::Expense, None),
];

const PURPOSES: &[(Purpose, &str)] = &[
    (Purpose::RetainedEarnings, "3100"),
    (Purpose::ArControl, "1100"),
    (Purpose::ApControl, "2000"),
    (Purpose::CashOverShort, "5900"),
    (Purpose::OpeningFloatOffset, "1020"),
];

/// Bank rules: (pattern, match type, counter account code, priority)
const RULES: &[(&str, MatchType, &str, i64)] = &[
    ("GITHUB", MatchType::Contains, "5100", 10),
    ("ADOBE", MatchType::Contains, "5100", 10),
    ("SERVICE FEE", MatchType::StartsWith, "5200", 5),
];

fn statement(year: i32) -> String {
    let mut csv = String::from("Date,Description,Amount\n");
    for month in 1..=3 {
        csv.push_str(&format!("{month:02}/05/{year},GITHUB INC,-21.00\n"));
        csv.push_str(&format!("{month:02}/07/{year},ADOBE CREATIVE CLOUD,-54.99\n"));
        csv.push_str(&format!("{month:02}/28/{year},SERVICE FEE MONTHLY,-12.00\n"));
    }
    csv.push_str(&format!("02/20/{year},WIRE IN NORTHWIND,4000.00\n"));
    csv
}

fn code_id(accounts: &[(String, i64)], code: &str) -> i64 {
    accounts
        .iter()
        .find(|(c, _)| c == code)
        .map(|(_, id)| *id)
        .unwrap_or_default()
}

fn post_manual(
    conn: &Connection,
    ctx: &RequestContext,
    book: &Book,
    date: &str,
    description: &str,
    lines: Vec<NewLine>,
) -> Result<i64> {
    let input = NewJournal::system(book, None, date, SourceType::Manual)
        .describe(description)
        .lines(lines);
    let created = journal::create(conn, ctx, &input)?;
    let id = created.journal.entry.id;
    posting::post(conn, ctx, id, &PostOptions::default())?;
    Ok(id)
}

fn seed(conn: &Connection, year: i32) -> Result<()> {
    let (tenant_id, admin_role) = auth::create_tenant(conn, TENANT_CODE, "Demo Trading Co")?;
    let mut password = ADMIN_PASSWORD.to_string();
    auth::create_user(conn, tenant_id, ADMIN_EMAIL, "Demo Admin", &mut password, &[admin_role])?;
    let ctx = RequestContext::system(tenant_id);

    let hq = org::create_legal_entity(
        conn,
        &ctx,
        &NewLegalEntity {
            code: "HQ".into(),
            name: "Demo Trading HQ".into(),
            base_currency: "USD".into(),
            requires_ic_partner: false,
        },
    )?;
    let chart = org::create_chart(
        conn,
        &ctx,
        &NewChart {
            code: "GLOBAL".into(),
            name: "Group chart".into(),
            legal_entity_id: None,
        },
    )?;

    let mut ids: Vec<(String, i64)> = Vec::new();
    for (code, name, account_type, parent) in CHART {
        let account = accounts::create(
            conn,
            &ctx,
            &NewAccount {
                chart_id: chart.id,
                code: code.to_string(),
                name: name.to_string(),
                account_type: *account_type,
                normal_side: None,
                parent_id: parent.map(|p| code_id(&ids, p)),
                is_postable: true,
            },
        )?;
        ids.push((code.to_string(), account.id));
    }
    for (purpose, code) in PURPOSES {
        purpose_accounts::set(
            conn,
            &ctx,
            &SetPurposeAccount {
                purpose: *purpose,
                account_id: code_id(&ids, code),
                legal_entity_id: None,
            },
        )?;
    }

    let calendar = periods::create_calendar(
        conn,
        &ctx,
        &NewCalendar {
            code: "FY".into(),
            name: "Calendar fiscal year".into(),
        },
    )?;
    periods::generate_periods(
        conn,
        &ctx,
        calendar.id,
        &GeneratePeriods {
            fiscal_year: year,
            start_month: 1,
        },
    )?;
    let book = org::create_book(
        conn,
        &ctx,
        &NewBook {
            legal_entity_id: hq.id,
            calendar_id: calendar.id,
            code: "HQ-LOCAL".into(),
            name: "HQ local book".into(),
            book_type: "LOCAL".into(),
            base_currency: None,
        },
    )?;

    let bank_id = code_id(&ids, "1020");
    post_manual(
        conn,
        &ctx,
        &book,
        &format!("{year}-01-02"),
        "Opening capital",
        vec![NewLine::debit(bank_id, 50_000.0), NewLine::credit(code_id(&ids, "3000"), 50_000.0)],
    )?;
    for month in 1..=3 {
        post_manual(
            conn,
            &ctx,
            &book,
            &format!("{year}-{month:02}-01"),
            "Office rent",
            vec![NewLine::debit(code_id(&ids, "5000"), 2_400.0), NewLine::credit(bank_id, 2_400.0)],
        )?;
    }

    let customer = cari::create_counterparty(
        conn,
        &ctx,
        &NewCounterparty {
            code: "NORTHWIND".into(),
            name: "Northwind Traders".into(),
            kind: CounterpartyKind::Customer,
            tax_id: None,
            payment_term_id: None,
        },
    )?;
    let invoice = cari::create_document(
        conn,
        &ctx,
        &NewDocument {
            legal_entity_id: hq.id,
            book_id: book.id,
            counterparty_id: customer.id,
            direction: Direction::Ar,
            document_no: "INV-0001".into(),
            document_date: format!("{year}-02-01"),
            due_date: None,
            currency: None,
            amount: 6_500.0,
            offset_account_id: code_id(&ids, "4000"),
            description: Some("February consulting".into()),
            idempotency_key: Some("demo-inv-0001".into()),
        },
    )?;
    let posted = cari::post_document(conn, &ctx, invoice.document.id)?;
    settlement::create(
        conn,
        &ctx,
        &NewSettlement {
            legal_entity_id: hq.id,
            book_id: book.id,
            counterparty_id: customer.id,
            direction: Direction::Ar,
            settlement_date: format!("{year}-02-20"),
            cash_account_id: bank_id,
            allocations: vec![Allocation {
                open_item_id: posted.open_item.id,
                amount: 4_000.0,
            }],
            idempotency_key: Some("demo-settle-0001".into()),
        },
    )?;

    bank::import_statement(
        conn,
        &ctx,
        &ImportInput {
            legal_entity_id: hq.id,
            bank_account_id: bank_id,
            filename: "demo-statement.csv".into(),
            content: statement(year),
        },
    )?;
    for (pattern, match_type, counter, priority) in RULES {
        bank::create_rule(
            conn,
            &ctx,
            &NewRule {
                legal_entity_id: hq.id,
                pattern: pattern.to_string(),
                match_type: *match_type,
                counter_account_id: code_id(&ids, counter),
                priority: *priority,
            },
        )?;
    }
    let applied = bank::auto_apply(
        conn,
        &ctx,
        &AutoApplyInput {
            legal_entity_id: hq.id,
            bank_account_id: Some(bank_id),
            book_id: Some(book.id),
        },
    )?;
    tracing::info!(tenant_id, applied = applied.applied, "demo tenant seeded");
    Ok(())
}

pub fn run() -> Result<()> {
    let mut conn = open_db()?;
    let year = Local::now().year();
    in_transaction(&mut conn, |tx| seed(tx, year))?;

    println!("{} tenant {TENANT_CODE} for fiscal year {year}", "Seeded".green().bold());
    println!("Sign in as {ADMIN_EMAIL} / {ADMIN_PASSWORD}");
    println!(
        "Try: backoffice report trial-balance --tenant {TENANT_CODE} --book HQ-LOCAL --period {year}-03"
    );
    Ok(())
}
