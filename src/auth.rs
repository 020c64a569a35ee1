use std::collections::BTreeSet;

use chrono::{Duration, Utc};
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{AppError, Result};
use crate::scope::RequestContext;

pub const SESSION_COOKIE: &str = "session";

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

pub fn hash_password(password: &str, salt: &str) -> String {
    sha256_hex(&[salt.as_bytes(), b":", password.as_bytes()])
}

pub fn hash_token(token: &str) -> String {
    sha256_hex(&[token.as_bytes()])
}

// ---------------------------------------------------------------------------
// Tenants, roles, users
// ---------------------------------------------------------------------------

/// Create a tenant together with an `ADMIN` role holding every permission.
pub fn create_tenant(conn: &Connection, code: &str, name: &str) -> Result<(i64, i64)> {
    if code.trim().is_empty() {
        return Err(AppError::validation("Tenant code is required"));
    }
    let exists = conn
        .prepare("SELECT 1 FROM tenants WHERE code = ?1")?
        .exists([code])?;
    if exists {
        return Err(AppError::conflict(format!("Tenant '{code}' already exists")));
    }
    conn.execute("INSERT INTO tenants (code, name) VALUES (?1, ?2)", [code, name])?;
    let tenant_id = conn.last_insert_rowid();
    let role_id = create_role(conn, tenant_id, "ADMIN", "Administrator", &["*"])?;
    Ok((tenant_id, role_id))
}

pub fn create_role(
    conn: &Connection,
    tenant_id: i64,
    code: &str,
    name: &str,
    permissions: &[&str],
) -> Result<i64> {
    conn.execute(
        "INSERT INTO roles (tenant_id, code, name) VALUES (?1, ?2, ?3)",
        rusqlite::params![tenant_id, code, name],
    )?;
    let role_id = conn.last_insert_rowid();
    for permission in permissions {
        conn.execute(
            "INSERT INTO role_permissions (role_id, permission) VALUES (?1, ?2)",
            rusqlite::params![role_id, permission],
        )?;
    }
    Ok(role_id)
}

/// Create a user and wipe the plaintext password from memory afterwards.
pub fn create_user(
    conn: &Connection,
    tenant_id: i64,
    email: &str,
    display_name: &str,
    password: &mut String,
    role_ids: &[i64],
) -> Result<i64> {
    if password.len() < 8 {
        password.zeroize();
        return Err(AppError::validation("Password must be at least 8 characters"));
    }
    let salt = random_hex(16);
    let hash = hash_password(password, &salt);
    password.zeroize();

    let email = email.trim().to_lowercase();
    let exists = conn.prepare("SELECT 1 FROM users WHERE email = ?1")?.exists([&email])?;
    if exists {
        return Err(AppError::conflict(format!("User '{email}' already exists")));
    }
    conn.execute(
        "INSERT INTO users (tenant_id, email, display_name, password_hash, password_salt) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![tenant_id, email, display_name, hash, salt],
    )?;
    let user_id = conn.last_insert_rowid();
    for role_id in role_ids {
        conn.execute(
            "INSERT INTO user_roles (user_id, role_id) VALUES (?1, ?2)",
            [user_id, *role_id],
        )?;
    }
    Ok(user_id)
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct LoginResult {
    #[serde(skip)]
    pub token: String,
    pub user_id: i64,
    pub tenant_id: i64,
    pub expires_at: String,
}

pub fn login(
    conn: &Connection,
    email: &str,
    password: &str,
    ttl_hours: i64,
) -> Result<LoginResult> {
    let email = email.trim().to_lowercase();
    let row: Option<(i64, i64, String, String, bool)> = conn
        .query_row(
            "SELECT id, tenant_id, password_hash, password_salt, is_active FROM users WHERE email = ?1",
            [&email],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .optional()?;
    let invalid = || AppError::Unauthenticated("Invalid email or password".to_string());
    let (user_id, tenant_id, stored_hash, salt, is_active) = row.ok_or_else(invalid)?;
    if !is_active || hash_password(password, &salt) != stored_hash {
        tracing::info!(email = %email, "login rejected");
        return Err(invalid());
    }

    let token = random_hex(32);
    let expires_at = (Utc::now() + Duration::hours(ttl_hours))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string();
    conn.execute(
        "INSERT INTO sessions (token_hash, user_id, expires_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![hash_token(&token), user_id, expires_at],
    )?;
    tracing::info!(user_id, tenant_id, "session issued");
    Ok(LoginResult {
        token,
        user_id,
        tenant_id,
        expires_at,
    })
}

pub fn logout(conn: &Connection, token: &str) -> Result<()> {
    conn.execute("DELETE FROM sessions WHERE token_hash = ?1", [hash_token(token)])?;
    Ok(())
}

/// Resolve a session token into the caller's tenant, permissions and scope.
pub fn resolve_session(conn: &Connection, token: &str, request_id: &str) -> Result<RequestContext> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT u.id, u.tenant_id FROM sessions s JOIN users u ON u.id = s.user_id \
             WHERE s.token_hash = ?1 AND s.expires_at > datetime('now') AND u.is_active = 1",
            [hash_token(token)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (user_id, tenant_id) =
        row.ok_or_else(|| AppError::Unauthenticated("Session expired or invalid".to_string()))?;

    let mut stmt = conn.prepare(
        "SELECT DISTINCT rp.permission FROM user_roles ur \
         JOIN role_permissions rp ON rp.role_id = ur.role_id WHERE ur.user_id = ?1",
    )?;
    let permissions: BTreeSet<String> = stmt
        .query_map([user_id], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT legal_entity_id FROM user_legal_entity_scopes WHERE user_id = ?1",
    )?;
    let scopes: BTreeSet<i64> = stmt
        .query_map([user_id], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;

    Ok(RequestContext {
        tenant_id,
        user_id: Some(user_id),
        permissions,
        legal_entity_ids: if scopes.is_empty() { None } else { Some(scopes) },
        request_id: request_id.to_string(),
    })
}
