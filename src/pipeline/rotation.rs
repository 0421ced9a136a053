//! Data access credential rotation for batch users.

use std::sync::{Mutex, PoisonError};

use rusqlite::TransactionBehavior;

use super::config::ResolvedConfig;
use super::{Frequency, PipelineError};
use crate::backend::{ParameterKind, ParameterStore};
use crate::directory;
use crate::directory::credentials::{hash_secret, CredentialPair};
use crate::storage::Pool;

/// One lock per frequency, indexed by discriminant.
static ROTATION_LOCKS: [Mutex<()>; Frequency::ALL.len()] = [
    Mutex::new(()),
    Mutex::new(()),
    Mutex::new(()),
    Mutex::new(()),
    Mutex::new(()),
];

/// What a rotation touched. Never carries the credentials themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub researcher_id: i64,
    pub username: String,
    pub new_grants: usize,
    pub access_key_parameter: String,
    pub secret_key_parameter: String,
}

/// Refresh the batch user of `freq` and publish its new key pair.
///
/// No database lock is held while talking to the parameter store. The batch
/// user and its study grants are committed first in a short transaction. The
/// new pair is then published, and its hash is written last in a single
/// statement.
///
/// If either parameter write fails, the stored hash is untouched and the
/// previous pair keeps validating. If the access key was published but the
/// secret was not, or the final hash write fails, the parameter store is
/// ahead of the database and nothing validates for this frequency until the
/// next successful rotation.
///
/// Rotations of one frequency are serialized within this process only.
/// Different frequencies never wait on each other.
pub fn rotate(
    pool: &Pool,
    parameters: &dyn ParameterStore,
    config: &ResolvedConfig,
    freq: Frequency,
) -> Result<RotationReport, PipelineError> {
    let (access_key_parameter, secret_key_parameter) = config.ssm_names(freq)?;
    let username = freq.batch_username();

    let _serialized = ROTATION_LOCKS[freq as usize]
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    let (researcher, new_grants) = {
        let mut conn = pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(directory::DirectoryError::from)?;

        let researcher = directory::get_or_create_batch_user(&tx, &username)?;
        let mut new_grants = 0;
        for study in directory::list_studies(&tx)? {
            if directory::ensure_study_access(&tx, researcher.id, study.id)? {
                new_grants += 1;
            }
        }
        tx.commit().map_err(directory::DirectoryError::from)?;
        (researcher, new_grants)
    };

    let pair = CredentialPair::generate();
    let hashed = hash_secret(&pair.secret_key);

    parameters.put_parameter(&access_key_parameter, &pair.access_key, ParameterKind::SecureString, true)?;
    parameters.put_parameter(&secret_key_parameter, &pair.secret_key, ParameterKind::SecureString, true)?;

    let conn = pool.get()?;
    directory::store_access_credentials(&conn, researcher.id, &pair.access_key, &hashed)?;
    drop(pair);

    tracing::info!(
        %freq,
        researcher_id = researcher.id,
        new_grants,
        parameter = %access_key_parameter,
        "data access credentials rotated"
    );

    Ok(RotationReport {
        researcher_id: researcher.id,
        username,
        new_grants,
        access_key_parameter,
        secret_key_parameter,
    })
}
