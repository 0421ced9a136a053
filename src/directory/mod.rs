//! Studies and researcher principals.
//!
//! The pipeline only needs a narrow slice of the platform's relational
//! model: the studies that own data, and the researcher principals that may
//! read it. Batch users are researchers without a password that exist solely
//! to hold read grants for pipeline jobs.

pub mod credentials;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use self::credentials::{hash_secret, verify_secret, CredentialPair, HashedSecret};
use crate::storage::now_rfc3339;

/// Role granted to batch users on every study.
pub const RESEARCHER_ROLE: &str = "researcher";

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("study {0} not found")]
    StudyNotFound(i64),

    #[error("researcher '{0}' not found")]
    ResearcherNotFound(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// A data-owning study.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Study {
    pub id: i64,
    pub object_id: String,
    pub name: String,
    pub deleted: bool,
}

/// A researcher principal. Secrets never leave the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Researcher {
    pub id: i64,
    pub username: String,
    pub is_batch_user: bool,
    pub access_key_id: Option<String>,
}

fn study_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Study> {
    Ok(Study {
        id: row.get(0)?,
        object_id: row.get(1)?,
        name: row.get(2)?,
        deleted: row.get::<_, i64>(3)? != 0,
    })
}

fn researcher_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Researcher> {
    Ok(Researcher {
        id: row.get(0)?,
        username: row.get(1)?,
        is_batch_user: row.get::<_, i64>(2)? != 0,
        access_key_id: row.get(3)?,
    })
}

/// Insert a new study.
pub fn create_study(conn: &Connection, object_id: &str, name: &str) -> Result<Study, DirectoryError> {
    if object_id.trim().is_empty() {
        return Err(DirectoryError::Invalid {
            field: "object_id",
            reason: "must not be empty".into(),
        });
    }
    if name.trim().is_empty() {
        return Err(DirectoryError::Invalid {
            field: "name",
            reason: "must not be empty".into(),
        });
    }

    conn.execute(
        "INSERT INTO studies (object_id, name) VALUES (?1, ?2)",
        params![object_id, name],
    )?;
    let id = conn.last_insert_rowid();
    tracing::info!(study_id = id, %object_id, %name, "study created");

    Ok(Study {
        id,
        object_id: object_id.to_string(),
        name: name.to_string(),
        deleted: false,
    })
}

pub fn get_study(conn: &Connection, id: i64) -> Result<Study, DirectoryError> {
    conn.query_row(
        "SELECT id, object_id, name, deleted FROM studies WHERE id = ?1",
        params![id],
        study_from_row,
    )
    .optional()?
    .ok_or(DirectoryError::StudyNotFound(id))
}

/// All studies that have not been deleted, oldest first.
pub fn list_studies(conn: &Connection) -> Result<Vec<Study>, DirectoryError> {
    let mut stmt =
        conn.prepare("SELECT id, object_id, name, deleted FROM studies WHERE deleted = 0 ORDER BY id")?;
    let rows = stmt.query_map([], study_from_row)?;
    let mut studies = Vec::new();
    for r in rows {
        studies.push(r?);
    }
    Ok(studies)
}

pub fn mark_study_deleted(conn: &Connection, id: i64) -> Result<(), DirectoryError> {
    let changed = conn.execute("UPDATE studies SET deleted = 1 WHERE id = ?1", params![id])?;
    if changed == 0 {
        return Err(DirectoryError::StudyNotFound(id));
    }
    Ok(())
}

pub fn find_researcher(conn: &Connection, username: &str) -> Result<Option<Researcher>, DirectoryError> {
    Ok(conn
        .query_row(
            "SELECT id, username, is_batch_user, access_key_id FROM researchers WHERE username = ?1",
            params![username],
            researcher_from_row,
        )
        .optional()?)
}

/// Insert an interactive researcher. The password hash column stays empty
/// here; web login is handled outside this crate.
pub fn create_researcher(conn: &Connection, username: &str) -> Result<Researcher, DirectoryError> {
    conn.execute(
        "INSERT INTO researchers (username, is_batch_user) VALUES (?1, 0)",
        params![username],
    )?;
    Ok(Researcher {
        id: conn.last_insert_rowid(),
        username: username.to_string(),
        is_batch_user: false,
        access_key_id: None,
    })
}

/// Fetch the batch principal named `username`, creating it without a
/// password if it does not exist yet.
pub fn get_or_create_batch_user(conn: &Connection, username: &str) -> Result<Researcher, DirectoryError> {
    if let Some(existing) = find_researcher(conn, username)? {
        conn.execute(
            "UPDATE researchers SET updated_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), existing.id],
        )?;
        return Ok(existing);
    }

    conn.execute(
        "INSERT INTO researchers (username, is_batch_user, password_hash) VALUES (?1, 1, NULL)",
        params![username],
    )?;
    let id = conn.last_insert_rowid();
    tracing::info!(researcher_id = id, %username, "batch user created");

    Ok(Researcher {
        id,
        username: username.to_string(),
        is_batch_user: true,
        access_key_id: None,
    })
}

/// Grant `researcher` read access to `study_id` unless a relation exists.
/// Returns `true` when a new grant was written.
pub fn ensure_study_access(conn: &Connection, researcher_id: i64, study_id: i64) -> Result<bool, DirectoryError> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO study_relations (study_id, researcher_id, relationship)
         VALUES (?1, ?2, ?3)",
        params![study_id, researcher_id, RESEARCHER_ROLE],
    )?;
    Ok(changed > 0)
}

/// Study ids `researcher_id` holds any relation to.
pub fn studies_for_researcher(conn: &Connection, researcher_id: i64) -> Result<Vec<i64>, DirectoryError> {
    let mut stmt =
        conn.prepare("SELECT study_id FROM study_relations WHERE researcher_id = ?1 ORDER BY study_id")?;
    let rows = stmt.query_map(params![researcher_id], |row| row.get::<_, i64>(0))?;
    let mut ids = Vec::new();
    for r in rows {
        ids.push(r?);
    }
    Ok(ids)
}

/// Replace the researcher's access credentials, invalidating any prior pair.
pub fn reset_access_credentials(conn: &Connection, researcher_id: i64) -> Result<CredentialPair, DirectoryError> {
    let pair = CredentialPair::generate();
    store_access_credentials(conn, researcher_id, &pair.access_key, &hash_secret(&pair.secret_key))?;
    Ok(pair)
}

/// Persist an already hashed pair in a single statement.
pub fn store_access_credentials(
    conn: &Connection,
    researcher_id: i64,
    access_key: &str,
    hashed: &HashedSecret,
) -> Result<(), DirectoryError> {
    let changed = conn.execute(
        "UPDATE researchers
         SET access_key_id = ?1, access_key_secret = ?2, access_key_secret_salt = ?3, updated_at = ?4
         WHERE id = ?5",
        params![access_key, hashed.encoded(), hashed.salt, now_rfc3339(), researcher_id],
    )?;
    if changed == 0 {
        return Err(DirectoryError::ResearcherNotFound(researcher_id.to_string()));
    }
    Ok(())
}

pub fn validate_access_credentials(
    conn: &Connection,
    access_key: &str,
    secret_key: &str,
) -> Result<Option<Researcher>, DirectoryError> {
    let found = conn
        .query_row(
            "SELECT id, username, is_batch_user, access_key_id, access_key_secret, access_key_secret_salt
             FROM researchers WHERE access_key_id = ?1",
            params![access_key],
            |row| {
                let researcher = researcher_from_row(row)?;
                let hash: Option<String> = row.get(4)?;
                let salt: Option<String> = row.get(5)?;
                Ok((researcher, hash, salt))
            },
        )
        .optional()?;

    match found {
        Some((researcher, Some(hash), Some(salt))) => match HashedSecret::from_encoded(&hash, salt) {
            Some(stored) if verify_secret(secret_key, &stored) => Ok(Some(researcher)),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::migrate(&conn).unwrap();
        conn
    }

    #[test]
    fn test_study_lifecycle() {
        let conn = conn();
        let study = create_study(&conn, "obj123", "Sleep Study").unwrap();
        assert_eq!(get_study(&conn, study.id).unwrap(), study);
        assert_eq!(list_studies(&conn).unwrap().len(), 1);

        mark_study_deleted(&conn, study.id).unwrap();
        assert!(list_studies(&conn).unwrap().is_empty());
        assert!(get_study(&conn, study.id).unwrap().deleted);
    }

    #[test]
    fn test_get_missing_study_is_not_found() {
        let conn = conn();
        assert!(matches!(get_study(&conn, 42), Err(DirectoryError::StudyNotFound(42))));
    }

    #[test]
    fn test_create_study_rejects_blank_object_id() {
        let conn = conn();
        let err = create_study(&conn, "  ", "x").unwrap_err();
        assert!(matches!(err, DirectoryError::Invalid { field: "object_id", .. }));
    }

    #[test]
    fn test_batch_user_is_created_once() {
        let conn = conn();
        let first = get_or_create_batch_user(&conn, "BATCH USER daily").unwrap();
        let second = get_or_create_batch_user(&conn, "BATCH USER daily").unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.is_batch_user);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM researchers", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_ensure_study_access_is_an_upsert() {
        let conn = conn();
        let study = create_study(&conn, "obj1", "One").unwrap();
        let user = get_or_create_batch_user(&conn, "BATCH USER hourly").unwrap();

        assert!(ensure_study_access(&conn, user.id, study.id).unwrap());
        assert!(!ensure_study_access(&conn, user.id, study.id).unwrap());
        assert_eq!(studies_for_researcher(&conn, user.id).unwrap(), vec![study.id]);
    }

    #[test]
    fn test_reset_credentials_invalidates_previous_pair() {
        let conn = conn();
        let user = get_or_create_batch_user(&conn, "BATCH USER weekly").unwrap();

        let old = reset_access_credentials(&conn, user.id).unwrap();
        let new = reset_access_credentials(&conn, user.id).unwrap();
        assert_ne!(old, new);

        assert!(validate_access_credentials(&conn, &old.access_key, &old.secret_key)
            .unwrap()
            .is_none());
        let found = validate_access_credentials(&conn, &new.access_key, &new.secret_key)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, user.id);
        assert!(validate_access_credentials(&conn, &new.access_key, "wrong")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_stored_secret_carries_iteration_count() {
        let conn = conn();
        let user = get_or_create_batch_user(&conn, "BATCH USER daily").unwrap();
        let pair = reset_access_credentials(&conn, user.id).unwrap();

        let column: String = conn
            .query_row("SELECT access_key_secret FROM researchers WHERE id = ?1", [user.id], |r| r.get(0))
            .unwrap();
        assert!(column.starts_with(&format!("pbkdf2_sha256${}$", credentials::PBKDF2_ITERATIONS)));
        assert!(!column.contains(&pair.secret_key));

        // A hash in any other format never validates.
        conn.execute("UPDATE researchers SET access_key_secret = 'bare' WHERE id = ?1", [user.id])
            .unwrap();
        assert!(validate_access_credentials(&conn, &pair.access_key, &pair.secret_key)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_reset_credentials_for_missing_researcher() {
        let conn = conn();
        assert!(matches!(
            reset_access_credentials(&conn, 7),
            Err(DirectoryError::ResearcherNotFound(_))
        ));
    }
}
