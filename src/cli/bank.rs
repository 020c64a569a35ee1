use std::path::Path;

use colored::Colorize;

use super::{legal_entity_id, open_db, tenant_ctx};
use crate::accounts;
use crate::bank::{self, ImportInput};
use crate::db::in_transaction;
use crate::error::{AppError, Result};

pub fn import(file: &str, tenant: &str, entity: &str, account: &str) -> Result<()> {
    let path = Path::new(file);
    let content = std::fs::read_to_string(path)?;
    let mut conn = open_db()?;
    let ctx = tenant_ctx(&conn, tenant)?;
    let le = legal_entity_id(&conn, &ctx, entity)?;
    let bank_account = accounts::find_by_code(&conn, ctx.tenant_id, le, account)?
        .ok_or_else(|| AppError::not_found(format!("Account '{account}'")))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file.to_string());

    let result = in_transaction(&mut conn, |tx| {
        bank::import_statement(
            tx,
            &ctx,
            &ImportInput {
                legal_entity_id: le,
                bank_account_id: bank_account.id,
                filename,
                content,
            },
        )
    })?;

    if result.duplicate_file {
        println!("{}", "This file has already been imported.".yellow());
    } else {
        println!(
            "Imported {} lines into {} ({} duplicates skipped)",
            result.imported.to_string().green(),
            bank_account.code,
            result.skipped
        );
    }
    Ok(())
}
