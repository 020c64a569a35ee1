use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::error::{AppError, Result};

/// Permission strings checked by handlers. Grants may use `prefix.*` or `*`.
pub mod perm {
    pub const ORG_READ: &str = "org.read";
    pub const ORG_WRITE: &str = "org.write";
    pub const ACCOUNT_READ: &str = "gl.account.read";
    pub const ACCOUNT_WRITE: &str = "gl.account.write";
    pub const JOURNAL_READ: &str = "gl.journal.read";
    pub const JOURNAL_CREATE: &str = "gl.journal.create";
    pub const JOURNAL_POST: &str = "gl.journal.post";
    pub const JOURNAL_REVERSE: &str = "gl.journal.reverse";
    pub const PERIOD_READ: &str = "gl.period.read";
    pub const PERIOD_CLOSE: &str = "gl.period.close";
    pub const PERIOD_REOPEN: &str = "gl.period.reopen";
    pub const REPORT_READ: &str = "gl.report.read";
    pub const CONFIG_READ: &str = "gl.config.read";
    pub const CONFIG_WRITE: &str = "gl.config.write";
    pub const CASH_READ: &str = "cash.read";
    pub const CASH_WRITE: &str = "cash.write";
    pub const CASH_POST: &str = "cash.post";
    pub const APPROVAL_DECIDE: &str = "approval.decide";
    pub const CARI_READ: &str = "cari.read";
    pub const CARI_WRITE: &str = "cari.write";
    pub const CARI_POST: &str = "cari.post";
    pub const BANK_READ: &str = "bank.read";
    pub const BANK_WRITE: &str = "bank.write";
    pub const AUDIT_READ: &str = "audit.read";
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    pub tenant_id: i64,
    pub user_id: Option<i64>,
    pub permissions: BTreeSet<String>,
    /// `None` grants every legal entity of the tenant.
    pub legal_entity_ids: Option<BTreeSet<i64>>,
    pub request_id: String,
}

impl RequestContext {
    /// Full-access context for operator commands run from the CLI.
    pub fn system(tenant_id: i64) -> Self {
        Self {
            tenant_id,
            user_id: None,
            permissions: BTreeSet::from(["*".to_string()]),
            legal_entity_ids: None,
            request_id: "cli".to_string(),
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|granted| {
            granted == "*"
                || granted == permission
                || granted
                    .strip_suffix('*')
                    .is_some_and(|prefix| prefix.ends_with('.') && permission.starts_with(prefix))
        })
    }

    pub fn require_permission(&self, permission: &str) -> Result<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(AppError::forbidden(format!("Missing permission '{permission}'")))
        }
    }

    pub fn can_access(&self, legal_entity_id: i64) -> bool {
        match &self.legal_entity_ids {
            None => true,
            Some(ids) => ids.contains(&legal_entity_id),
        }
    }

    /// Legal entity ids a list query must be restricted to, if any.
    pub fn scoped_ids(&self) -> Option<Vec<i64>> {
        self.legal_entity_ids.as_ref().map(|ids| ids.iter().copied().collect())
    }
}

/// Check that the legal entity exists inside the caller's tenant and that the
/// caller's scope covers it. Must run before any mutation touching it.
pub fn assert_scope_access(
    conn: &Connection,
    ctx: &RequestContext,
    legal_entity_id: i64,
) -> Result<()> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM legal_entities WHERE id = ?1 AND tenant_id = ?2",
            rusqlite::params![legal_entity_id, ctx.tenant_id],
            |row| row.get(0),
        )
        .optional()?;
    if found.is_none() {
        return Err(AppError::not_found(format!("Legal entity {legal_entity_id}")));
    }
    if !ctx.can_access(legal_entity_id) {
        return Err(AppError::forbidden(format!(
            "No access to legal entity {legal_entity_id}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(perms: &[&str], scopes: Option<&[i64]>) -> RequestContext {
        RequestContext {
            tenant_id: 1,
            user_id: Some(1),
            permissions: perms.iter().map(|p| p.to_string()).collect(),
            legal_entity_ids: scopes.map(|s| s.iter().copied().collect()),
            request_id: "test".to_string(),
        }
    }

    #[test]
    fn test_exact_and_wildcard_permissions() {
        let ctx = ctx_with(&["gl.journal.read", "cash.*"], None);
        assert!(ctx.has_permission(perm::JOURNAL_READ));
        assert!(ctx.has_permission(perm::CASH_POST));
        assert!(!ctx.has_permission(perm::JOURNAL_POST));
        assert!(!ctx.has_permission("cashier.read"));
        assert!(ctx_with(&["*"], None).has_permission(perm::PERIOD_REOPEN));
    }

    #[test]
    fn test_missing_permission_is_forbidden() {
        let err = ctx_with(&[], None).require_permission(perm::JOURNAL_CREATE).unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert!(err.to_string().contains("gl.journal.create"));
    }

    #[test]
    fn test_scope_restriction() {
        let ctx = ctx_with(&["*"], Some(&[2]));
        assert!(ctx.can_access(2));
        assert!(!ctx.can_access(3));
        assert_eq!(ctx.scoped_ids(), Some(vec![2]));
        assert!(RequestContext::system(1).can_access(99));
    }
}
