//! Postgres-backed store.
//!
//! Hand-written SQL over `sqlx`; every query runs under a `db.query`
//! tracing span. Uniqueness lives in the schema (see `sql/schema.sql`) and
//! unique violations are mapped back to the offending field by constraint
//! name. The throttle compare-and-set is a conditional UPDATE on the
//! failure count.

use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::credential::{ChallengePurpose, ContactChange, OtpCredential};
use crate::otp::OtpSecret;
use crate::throttle::Throttle;
use crate::user::{ContactKind, UserRecord};

use super::{IdentityStore, StoreError};

const USER_COLUMNS: &str =
    "id, username, username_folded, email, phone, password_hash, created_at, updated_at";
const CREDENTIAL_COLUMNS: &str = "id, user_id, kind, purpose, bound_value, secret, confirmed, \
     expires_at, failure_count, locked_until, created_at, updated_at";

/// Store backed by a Postgres connection pool.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_user_where(
        &self,
        column: &'static str,
        value: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = $1");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        sqlx::query_as::<_, UserRecord>(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(backend)
    }
}

#[async_trait::async_trait]
impl IdentityStore for PgStore {
    async fn insert_user(
        &self,
        user: &UserRecord,
        credentials: &[OtpCredential],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let query = "INSERT INTO users \
             (id, username, username_folded, email, phone, password_hash, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user.id)
            .bind(user.username.as_deref())
            .bind(user.username_folded.as_deref())
            .bind(user.email.as_deref())
            .bind(user.phone.as_deref())
            .bind(&user.password_hash)
            .bind(user.created_at)
            .bind(user.updated_at)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .map_err(write_error)?;

        for credential in credentials {
            insert_credential_tx(&mut tx, credential).await?;
        }

        tx.commit().await.map_err(backend)
    }

    async fn fetch_user(&self, id: Uuid) -> Result<UserRecord, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        sqlx::query_as::<_, UserRecord>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(backend)?
            .ok_or(StoreError::UserNotFound)
    }

    async fn find_by_username(
        &self,
        username_folded: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        self.find_user_where("username_folded", username_folded).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        self.find_user_where("email", email).await
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<UserRecord>, StoreError> {
        self.find_user_where("phone", phone).await
    }

    async fn update_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let query = "UPDATE users \
             SET username = $2, username_folded = $3, password_hash = $4, updated_at = $5 \
             WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user.id)
            .bind(user.username.as_deref())
            .bind(user.username_folded.as_deref())
            .bind(&user.password_hash)
            .bind(user.updated_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(write_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound);
        }
        Ok(())
    }

    async fn update_contact(
        &self,
        user: &UserRecord,
        kind: ContactKind,
        change: &ContactChange,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let query = match kind {
            ContactKind::Email => "UPDATE users SET email = $2, updated_at = $3 WHERE id = $1",
            ContactKind::Phone => "UPDATE users SET phone = $2, updated_at = $3 WHERE id = $1",
        };
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user.id)
            .bind(user.contact(kind))
            .bind(user.updated_at)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .map_err(write_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound);
        }

        match change {
            ContactChange::Create(credential) => {
                insert_credential_tx(&mut tx, credential).await?;
            }
            ContactChange::Rebind { value, at } => {
                let query = "UPDATE otp_credentials \
                     SET bound_value = $3, secret = NULL, confirmed = FALSE, expires_at = NULL, \
                         failure_count = 0, locked_until = NULL, updated_at = $4 \
                     WHERE user_id = $1 AND kind = $2";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(user.id)
                    .bind(kind.as_str())
                    .bind(value)
                    .bind(at)
                    .execute(&mut *tx)
                    .instrument(span)
                    .await
                    .map_err(backend)?;
            }
            ContactChange::Delete => {
                let query = "DELETE FROM otp_credentials WHERE user_id = $1 AND kind = $2";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "DELETE",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(user.id)
                    .bind(kind.as_str())
                    .execute(&mut *tx)
                    .instrument(span)
                    .await
                    .map_err(backend)?;
            }
            ContactChange::Unchanged => {}
        }

        tx.commit().await.map_err(backend)
    }

    async fn delete_user(&self, id: Uuid) -> Result<(), StoreError> {
        let query = "DELETE FROM users WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound);
        }
        Ok(())
    }

    async fn insert_credential(&self, credential: &OtpCredential) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        insert_credential_tx(&mut tx, credential).await?;
        tx.commit().await.map_err(backend)
    }

    async fn fetch_credential(
        &self,
        user_id: Uuid,
        kind: ContactKind,
        purpose: ChallengePurpose,
    ) -> Result<OtpCredential, StoreError> {
        let query = format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM otp_credentials \
             WHERE user_id = $1 AND kind = $2 AND purpose = $3"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        sqlx::query_as::<_, OtpCredential>(&query)
            .bind(user_id)
            .bind(kind.as_str())
            .bind(purpose.as_str())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(backend)?
            .ok_or(StoreError::CredentialNotFound)
    }

    async fn update_credential_guarded(
        &self,
        credential: &OtpCredential,
        expected_failures: u32,
    ) -> Result<(), StoreError> {
        let query = "UPDATE otp_credentials \
             SET bound_value = $2, secret = $3, confirmed = $4, expires_at = $5, \
                 failure_count = $6, locked_until = $7, updated_at = $8 \
             WHERE id = $1 AND failure_count = $9";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let throttle = credential.otp.throttle();
        let result = sqlx::query(query)
            .bind(credential.id)
            .bind(&credential.bound_value)
            .bind(credential.otp.secret())
            .bind(credential.otp.is_confirmed())
            .bind(credential.otp.expires_at())
            .bind(count_to_db(throttle.failure_count()))
            .bind(throttle.locked_until())
            .bind(credential.updated_at)
            .bind(count_to_db(expected_failures))
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Zero rows means either a lost race or a deleted credential.
        let query = "SELECT 1 AS present FROM otp_credentials WHERE id = $1";
        let row = sqlx::query(query)
            .bind(credential.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        if row.is_some() {
            Err(StoreError::Conflict)
        } else {
            Err(StoreError::CredentialNotFound)
        }
    }
}

async fn insert_credential_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    credential: &OtpCredential,
) -> Result<(), StoreError> {
    let query = "INSERT INTO otp_credentials \
         (id, user_id, kind, purpose, bound_value, secret, confirmed, expires_at, \
          failure_count, locked_until, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let throttle = credential.otp.throttle();
    sqlx::query(query)
        .bind(credential.id)
        .bind(credential.user_id)
        .bind(credential.kind.as_str())
        .bind(credential.purpose.as_str())
        .bind(&credential.bound_value)
        .bind(credential.otp.secret())
        .bind(credential.otp.is_confirmed())
        .bind(credential.otp.expires_at())
        .bind(count_to_db(throttle.failure_count()))
        .bind(throttle.locked_until())
        .bind(credential.created_at)
        .bind(credential.updated_at)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .map_err(write_error)?;
    Ok(())
}

impl<'r> FromRow<'r, PgRow> for UserRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            username_folded: row.try_get("username_folded")?,
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
            password_hash: row.try_get("password_hash")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for OtpCredential {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let purpose: String = row.try_get("purpose")?;
        let failure_count: i32 = row.try_get("failure_count")?;
        let otp = OtpSecret::new(
            row.try_get("secret")?,
            row.try_get("confirmed")?,
            row.try_get("expires_at")?,
            Throttle::new(count_from_db(failure_count), row.try_get("locked_until")?),
        );
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            kind: parse_kind(&kind)?,
            purpose: parse_purpose(&purpose)?,
            bound_value: row.try_get("bound_value")?,
            otp,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Parse the persisted `otp_credentials.kind` textual value.
fn parse_kind(value: &str) -> Result<ContactKind, sqlx::Error> {
    match value {
        "email" => Ok(ContactKind::Email),
        "phone" => Ok(ContactKind::Phone),
        _ => Err(decode_error(format!(
            "invalid otp_credentials.kind value: {value}"
        ))),
    }
}

/// Parse the persisted `otp_credentials.purpose` textual value.
fn parse_purpose(value: &str) -> Result<ChallengePurpose, sqlx::Error> {
    match value {
        "setup" => Ok(ChallengePurpose::Setup),
        "login" => Ok(ChallengePurpose::Login),
        _ => Err(decode_error(format!(
            "invalid otp_credentials.purpose value: {value}"
        ))),
    }
}

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message,
    )))
}

fn count_to_db(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

fn count_from_db(count: i32) -> u32 {
    u32::try_from(count).unwrap_or(0)
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(Box::new(err))
}

/// Maps unique and foreign-key violations onto the typed store errors;
/// everything else is a backend failure.
fn write_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        let code = db_err.code();
        let code = code.as_deref();
        if code == Some("23505") {
            return StoreError::Duplicate(match db_err.constraint() {
                Some("users_username_folded_key") => "username",
                Some("users_email_key") => "email",
                Some("users_phone_key") => "phone",
                _ => "identifier",
            });
        }
        if code == Some("23503") {
            return StoreError::UserNotFound;
        }
    }
    backend(err)
}
