use comfy_table::{Cell, Table};

use super::{legal_entity_id, open_db, tenant_ctx};
use crate::accounts::{self, AccountFilter};
use crate::error::Result;

pub fn list(tenant: &str, entity: Option<&str>) -> Result<()> {
    let conn = open_db()?;
    let ctx = tenant_ctx(&conn, tenant)?;
    let le = entity.map(|code| legal_entity_id(&conn, &ctx, code)).transpose()?;
    let rows: Vec<_> = accounts::list(&conn, &ctx, &AccountFilter::default())?
        .into_iter()
        .filter(|a| le.map_or(true, |le| a.usable_by(le)))
        .collect();

    let mut table = Table::new();
    table.set_header(vec!["ID", "Code", "Name", "Type", "Side", "Postable"]);
    for account in &rows {
        let postable = account.is_postable && !account.has_children;
        table.add_row(vec![
            Cell::new(account.id),
            Cell::new(&account.code),
            Cell::new(&account.name),
            Cell::new(account.account_type),
            Cell::new(account.normal_side),
            Cell::new(if postable { "yes" } else { "" }),
        ]);
    }
    println!("Accounts ({})\n{table}", rows.len());
    Ok(())
}
