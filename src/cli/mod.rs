pub mod accounts;
pub mod backup;
pub mod bank;
pub mod demo;
pub mod init;
pub mod report;
pub mod serve;
pub mod status;
pub mod tenant;

use clap::{Parser, Subcommand};
use rusqlite::{Connection, OptionalExtension};

use crate::db::get_connection;
use crate::error::{AppError, Result};
use crate::models::Book;
use crate::scope::RequestContext;
use crate::settings::load_settings;

#[derive(Parser)]
#[command(name = "backoffice", version, about = "Multi-tenant back-office ledger: journals, cash, counterparties, bank.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Choose a data directory and initialize the database.
    Init {
        /// Path for backoffice data (default: the platform data directory)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Run the JSON API.
    Serve {
        /// Listen address, e.g. 0.0.0.0:8080 (default from settings)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Manage tenants.
    Tenant {
        #[command(subcommand)]
        command: TenantCommands,
    },
    /// Seed a DEMO tenant with entities, accounts, periods and activity.
    Demo,
    /// Chart of accounts.
    Accounts {
        #[command(subcommand)]
        command: AccountsCommands,
    },
    /// Bank statements.
    Bank {
        #[command(subcommand)]
        command: BankCommands,
    },
    /// Generate reports.
    Report {
        #[command(subcommand)]
        command: ReportCommands,
    },
    /// Back up the database.
    Backup {
        /// Output path (default: <data_dir>/backups/backoffice-YYYYMMDD-HHMMSS.db)
        #[arg(long)]
        output: Option<String>,
    },
    /// Show current database and summary statistics.
    Status,
}

#[derive(Subcommand)]
pub enum TenantCommands {
    /// Create a tenant and its first administrator. The password is
    /// prompted for, or read from BACKOFFICE_ADMIN_PASSWORD.
    Create {
        /// Short tenant code, e.g. ACME
        code: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// Administrator email
        #[arg(long = "admin-email")]
        admin_email: String,
    },
}

#[derive(Subcommand)]
pub enum AccountsCommands {
    /// List the accounts visible to a legal entity.
    List {
        #[arg(long)]
        tenant: String,
        /// Legal entity code; omit to list every chart
        #[arg(long)]
        entity: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum BankCommands {
    /// Import a CSV statement (date, description, amount).
    Import {
        /// Path to the CSV file
        file: String,
        #[arg(long)]
        tenant: String,
        /// Legal entity code
        #[arg(long)]
        entity: String,
        /// Bank account code
        #[arg(long)]
        account: String,
    },
}

#[derive(Subcommand)]
pub enum ReportCommands {
    /// Trial balance for one book and fiscal period.
    TrialBalance {
        #[arg(long)]
        tenant: String,
        /// Book code, e.g. HQ-LOCAL
        #[arg(long)]
        book: String,
        /// Period name: YYYY-MM
        #[arg(long)]
        period: String,
        /// Include roll-up parent rows
        #[arg(long)]
        rollup: bool,
    },
}

pub(crate) fn open_db() -> Result<Connection> {
    let db_path = load_settings().db_path();
    if !db_path.exists() {
        return Err(AppError::Settings(format!(
            "No database at {}. Run `backoffice init` first.",
            db_path.display()
        )));
    }
    get_connection(&db_path)
}

/// A full-permission context for the tenant with `code`.
pub(crate) fn tenant_ctx(conn: &Connection, code: &str) -> Result<RequestContext> {
    let tenant_id: i64 = conn
        .query_row("SELECT id FROM tenants WHERE code = ?1", [code], |row| row.get(0))
        .optional()?
        .ok_or_else(|| AppError::not_found(format!("Tenant '{code}'")))?;
    Ok(RequestContext::system(tenant_id))
}

pub(crate) fn legal_entity_id(conn: &Connection, ctx: &RequestContext, code: &str) -> Result<i64> {
    conn.query_row(
        "SELECT id FROM legal_entities WHERE tenant_id = ?1 AND code = ?2",
        rusqlite::params![ctx.tenant_id, code],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Legal entity '{code}'")))
}

pub(crate) fn book_by_code(conn: &Connection, ctx: &RequestContext, code: &str) -> Result<Book> {
    let id: i64 = conn
        .query_row(
            "SELECT id FROM books WHERE tenant_id = ?1 AND code = ?2",
            rusqlite::params![ctx.tenant_id, code],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| AppError::not_found(format!("Book '{code}'")))?;
    crate::org::load_book(conn, ctx.tenant_id, id)
}
