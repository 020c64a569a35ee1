use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{is_zero, round_amount, AccountType, NormalSide};
use crate::org;
use crate::periods;
use crate::scope::{assert_scope_access, perm, RequestContext};

#[derive(Debug, Clone, Serialize)]
pub struct TrialBalanceRow {
    pub account_id: i64,
    pub account_code: String,
    pub account_name: String,
    pub account_type: AccountType,
    pub normal_side: NormalSide,
    pub parent_id: Option<i64>,
    pub debit: f64,
    pub credit: f64,
    /// debit - credit
    pub net: f64,
    /// Net expressed on the account's normal side.
    pub balance: f64,
    pub is_rollup: bool,
}

impl TrialBalanceRow {
    fn finish(&mut self) {
        self.debit = round_amount(self.debit);
        self.credit = round_amount(self.credit);
        self.net = round_amount(self.debit - self.credit);
        self.balance = match self.normal_side {
            NormalSide::Debit => self.net,
            NormalSide::Credit => round_amount(-self.net),
        };
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialBalance {
    pub book_id: i64,
    pub fiscal_period_id: i64,
    pub period_name: String,
    pub rows: Vec<TrialBalanceRow>,
    pub total_debit: f64,
    pub total_credit: f64,
    pub is_balanced: bool,
}

impl TrialBalance {
    /// Leaf rows only; roll-up rows repeat their descendants' totals.
    pub fn leaves(&self) -> impl Iterator<Item = &TrialBalanceRow> {
        self.rows.iter().filter(|r| !r.is_rollup)
    }
}

#[derive(Debug, Deserialize)]
pub struct TrialBalanceQuery {
    pub book_id: i64,
    pub fiscal_period_id: i64,
    #[serde(default)]
    pub rollup: bool,
}

/// Sum POSTED and REVERSED lines per account for one book and period. A
/// reversed journal stays in the books; its reversal offsets it.
pub fn compute(
    conn: &Connection,
    book_id: i64,
    period_id: i64,
    rollup: bool,
) -> Result<TrialBalance> {
    let period_name: String = conn.query_row(
        "SELECT name FROM fiscal_periods WHERE id = ?1",
        [period_id],
        |row| row.get(0),
    )?;
    let mut stmt = conn.prepare(
        "SELECT a.id, a.code, a.name, a.account_type, a.normal_side, a.parent_id, \
         COALESCE(SUM(l.debit_base), 0), COALESCE(SUM(l.credit_base), 0) \
         FROM journal_lines l \
         JOIN journal_entries j ON j.id = l.journal_entry_id \
         JOIN accounts a ON a.id = l.account_id \
         WHERE j.book_id = ?1 AND j.fiscal_period_id = ?2 AND j.status IN ('POSTED', 'REVERSED') \
         GROUP BY a.id ORDER BY a.code",
    )?;
    let mut rows = stmt
        .query_map([book_id, period_id], |row| {
            Ok(TrialBalanceRow {
                account_id: row.get(0)?,
                account_code: row.get(1)?,
                account_name: row.get(2)?,
                account_type: row.get(3)?,
                normal_side: row.get(4)?,
                parent_id: row.get(5)?,
                debit: row.get(6)?,
                credit: row.get(7)?,
                net: 0.0,
                balance: 0.0,
                is_rollup: false,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for row in &mut rows {
        row.finish();
    }

    let total_debit = round_amount(rows.iter().map(|r| r.debit).sum());
    let total_credit = round_amount(rows.iter().map(|r| r.credit).sum());

    if rollup {
        let rollups = rollup_rows(conn, &rows)?;
        rows.extend(rollups);
        rows.sort_by(|a, b| {
            a.account_code.cmp(&b.account_code).then(b.is_rollup.cmp(&a.is_rollup))
        });
    }

    Ok(TrialBalance {
        book_id,
        fiscal_period_id: period_id,
        period_name,
        rows,
        total_debit,
        total_credit,
        is_balanced: is_zero(total_debit - total_credit),
    })
}

/// One row per ancestor of any leaf, carrying the sum of its descendants.
fn rollup_rows(conn: &Connection, leaves: &[TrialBalanceRow]) -> Result<Vec<TrialBalanceRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, code, name, account_type, normal_side, parent_id FROM accounts WHERE id = ?1",
    )?;
    let mut parents: BTreeMap<i64, TrialBalanceRow> = BTreeMap::new();
    for leaf in leaves {
        let mut next = leaf.parent_id;
        while let Some(parent_id) = next {
            if !parents.contains_key(&parent_id) {
                let row = stmt.query_row([parent_id], |row| {
                    Ok(TrialBalanceRow {
                        account_id: row.get(0)?,
                        account_code: row.get(1)?,
                        account_name: row.get(2)?,
                        account_type: row.get(3)?,
                        normal_side: row.get(4)?,
                        parent_id: row.get(5)?,
                        debit: 0.0,
                        credit: 0.0,
                        net: 0.0,
                        balance: 0.0,
                        is_rollup: true,
                    })
                })?;
                parents.insert(parent_id, row);
            }
            let Some(parent) = parents.get_mut(&parent_id) else { break };
            parent.debit += leaf.debit;
            parent.credit += leaf.credit;
            next = parent.parent_id;
        }
    }
    Ok(parents
        .into_values()
        .map(|mut row| {
            row.finish();
            row
        })
        .collect())
}

pub fn report(
    conn: &Connection,
    ctx: &RequestContext,
    query: &TrialBalanceQuery,
) -> Result<TrialBalance> {
    ctx.require_permission(perm::REPORT_READ)?;
    let book = org::load_book(conn, ctx.tenant_id, query.book_id)?;
    assert_scope_access(conn, ctx, book.legal_entity_id)?;
    let period = periods::period_of_book(conn, &book, query.fiscal_period_id)?;
    compute(conn, book.id, period.id, query.rollup)
}
