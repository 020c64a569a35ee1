use colored::Colorize;
use zeroize::Zeroize;

use super::open_db;
use crate::auth;
use crate::db::in_transaction;
use crate::error::{AppError, Result};

pub const PASSWORD_ENV: &str = "BACKOFFICE_ADMIN_PASSWORD";

fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    let mut password = rpassword::prompt_password("Admin password: ")?;
    let mut confirm = rpassword::prompt_password("Confirm password: ")?;
    let matches = password == confirm;
    confirm.zeroize();
    if !matches {
        password.zeroize();
        return Err(AppError::validation("Passwords do not match"));
    }
    Ok(password)
}

pub fn create(code: &str, name: &str, admin_email: &str) -> Result<()> {
    let mut password = read_password()?;
    let mut conn = open_db()?;
    let (tenant_id, user_id) = in_transaction(&mut conn, |tx| {
        let (tenant_id, admin_role) = auth::create_tenant(tx, code, name)?;
        let user_id = auth::create_user(
            tx,
            tenant_id,
            admin_email,
            "Administrator",
            &mut password,
            &[admin_role],
        )?;
        Ok((tenant_id, user_id))
    })?;
    password.zeroize();
    tracing::info!(tenant_id, user_id, "tenant created");
    println!("{} tenant {code} (id {tenant_id})", "Created".green().bold());
    println!("Administrator: {admin_email}");
    Ok(())
}
