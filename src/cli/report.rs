use colored::Colorize;
use comfy_table::{Cell, Table};
use rusqlite::OptionalExtension;

use super::{book_by_code, open_db, tenant_ctx};
use crate::error::{AppError, Result};
use crate::fmt::money;
use crate::trial_balance::{self, TrialBalanceQuery};

pub fn trial_balance(tenant: &str, book: &str, period: &str, rollup: bool) -> Result<()> {
    let conn = open_db()?;
    let ctx = tenant_ctx(&conn, tenant)?;
    let book = book_by_code(&conn, &ctx, book)?;
    let fiscal_period_id: i64 = conn
        .query_row(
            "SELECT id FROM fiscal_periods WHERE calendar_id = ?1 AND name = ?2",
            rusqlite::params![book.calendar_id, period],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| {
            AppError::not_found(format!("Period '{period}' in the calendar of {}", book.code))
        })?;

    let tb = trial_balance::report(
        &conn,
        &ctx,
        &TrialBalanceQuery {
            book_id: book.id,
            fiscal_period_id,
            rollup,
        },
    )?;

    let mut table = Table::new();
    table.set_header(vec!["Code", "Account", "Type", "Debit", "Credit", "Balance"]);
    for row in &tb.rows {
        let name = if row.is_rollup {
            row.account_name.bold().to_string()
        } else {
            format!("  {}", row.account_name)
        };
        table.add_row(vec![
            Cell::new(&row.account_code),
            Cell::new(name),
            Cell::new(row.account_type),
            Cell::new(money(row.debit)),
            Cell::new(money(row.credit)),
            Cell::new(money(row.balance)),
        ]);
    }
    table.add_row(vec![
        Cell::new(""),
        Cell::new("Total".bold()),
        Cell::new(""),
        Cell::new(money(tb.total_debit).bold()),
        Cell::new(money(tb.total_credit).bold()),
        Cell::new(""),
    ]);

    println!("Trial Balance: {} {}\n{table}", book.code, tb.period_name);
    if tb.is_balanced {
        println!("{}", "Balanced".green());
    } else {
        println!(
            "{}",
            format!("Out of balance by {}", money(tb.total_debit - tb.total_credit)).red().bold()
        );
    }
    Ok(())
}
