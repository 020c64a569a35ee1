use crate::db::get_connection;
use crate::error::Result;
use crate::fmt::format_bytes;
use crate::settings::load_settings;

const COUNTS: &[(&str, &str)] = &[
    ("Tenants", "SELECT count(*) FROM tenants"),
    ("Legal entities", "SELECT count(*) FROM legal_entities"),
    ("Accounts", "SELECT count(*) FROM accounts"),
    ("Journals", "SELECT count(*) FROM journal_entries"),
    ("Posted", "SELECT count(*) FROM journal_entries WHERE status = 'POSTED'"),
    ("Open items", "SELECT count(*) FROM open_items WHERE status != 'SETTLED'"),
    ("Unmatched bank", "SELECT count(*) FROM bank_statement_lines WHERE status = 'UNMATCHED'"),
    ("Pending approvals", "SELECT count(*) FROM approval_requests WHERE status = 'PENDING'"),
];

pub fn run() -> Result<()> {
    let settings = load_settings();
    let db_path = settings.db_path();

    println!("Data dir:   {}", settings.data_dir);
    println!("Database:   {}", db_path.display());
    println!("Listen:     {}", settings.bind_addr);

    if !db_path.exists() {
        println!();
        println!("Database not found. Run `backoffice init` to set up.");
        return Ok(());
    }

    let size = std::fs::metadata(&db_path)?.len();
    println!("DB size:    {}", format_bytes(size));

    let conn = get_connection(&db_path)?;
    println!();
    for (label, sql) in COUNTS {
        let count: i64 = conn.query_row(sql, [], |r| r.get(0))?;
        println!("{:<19}{count}", format!("{label}:"));
    }
    Ok(())
}
