// ABOUTME: Privilege and server setting checks for replication sources
// ABOUTME: Verifies the role may replicate and that wal_level is logical

use crate::error::{Error, Result};
use crate::session::Session;

/// Privileges of the connected role that matter for a replication source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivilegeCheck {
    /// Role has REPLICATION (needed to create and read slots)
    pub has_replication: bool,
    /// Role is a superuser (bypasses other privilege requirements)
    pub is_superuser: bool,
}

impl PrivilegeCheck {
    pub fn can_replicate(&self) -> bool {
        self.has_replication || self.is_superuser
    }
}

/// Query `pg_roles` for the connected role
///
/// # Errors
///
/// Returns an error if the query fails or returns no row.
pub async fn check_replication_privileges(session: &mut dyn Session) -> Result<PrivilegeCheck> {
    let rows = session
        .query(
            "SELECT rolreplication, rolsuper FROM pg_roles WHERE rolname = current_user",
            &[],
        )
        .await?;
    let row = rows
        .first()
        .ok_or_else(|| Error::config("Connected role not found in pg_roles"))?;

    Ok(PrivilegeCheck {
        has_replication: row
            .get("rolreplication")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        is_superuser: row
            .get("rolsuper")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    })
}

/// Current `wal_level` setting, e.g. "replica" or "logical"
pub async fn check_wal_level(session: &mut dyn Session) -> Result<String> {
    let rows = session.query("SHOW wal_level", &[]).await?;
    rows.first()
        .and_then(|row| row.get("wal_level"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::config("SHOW wal_level returned no value"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::{row, FakeSession};
    use serde_json::json;

    #[tokio::test]
    async fn test_check_replication_privileges() {
        let mut session = FakeSession::new(Box::new(|_, _| {
            Ok(vec![row(json!({"rolreplication": false, "rolsuper": true}))])
        }));
        let privileges = check_replication_privileges(&mut session).await.unwrap();
        assert!(!privileges.has_replication);
        assert!(privileges.can_replicate());
    }

    #[tokio::test]
    async fn test_check_wal_level() {
        let mut session = FakeSession::new(Box::new(|_, _| {
            Ok(vec![row(json!({"wal_level": "logical"}))])
        }));
        assert_eq!(check_wal_level(&mut session).await.unwrap(), "logical");
    }

    #[tokio::test]
    async fn test_check_wal_level_missing_row() {
        let mut session = FakeSession::empty();
        assert!(check_wal_level(&mut session).await.is_err());
    }
}
