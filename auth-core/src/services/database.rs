//! PostgreSQL store for subjects, refresh families and share grants.
//!
//! Uses sqlx runtime queries against the schema in `migrations/`.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{FromRow, PgExecutor};
use uuid::Uuid;

use crate::models::subject::fold_identifier;
use crate::models::{
    FamilyId, PermissionLevel, RecordState, RefreshCredentialRecord, ResourceRecord,
    RevocationReason, ShareGrant, Subject,
};
use crate::services::store::{GrantStore, SubjectStore, TokenStore, TransitionOutcome};
use crate::services::CoreError;
use crate::utils::PasswordHashString;

#[derive(Debug, FromRow)]
struct RefreshCredentialRow {
    record_id: Uuid,
    subject_id: Uuid,
    family_id: Uuid,
    generation_num: i32,
    token_hash_text: String,
    state_code: String,
    replaced_by_record_id: Option<Uuid>,
    revocation_reason_code: Option<String>,
    expiry_utc: DateTime<Utc>,
    created_utc: DateTime<Utc>,
    consumed_utc: Option<DateTime<Utc>>,
    revoked_utc: Option<DateTime<Utc>>,
}

impl TryFrom<RefreshCredentialRow> for RefreshCredentialRecord {
    type Error = CoreError;

    fn try_from(row: RefreshCredentialRow) -> Result<Self, Self::Error> {
        let state = RecordState::parse(&row.state_code).ok_or_else(|| {
            CoreError::Store(anyhow!("Unknown refresh state code: {}", row.state_code))
        })?;
        let revocation_reason = match row.revocation_reason_code.as_deref() {
            Some(code) => Some(RevocationReason::parse(code).ok_or_else(|| {
                CoreError::Store(anyhow!("Unknown revocation reason code: {}", code))
            })?),
            None => None,
        };

        Ok(RefreshCredentialRecord {
            record_id: row.record_id,
            subject_id: row.subject_id,
            family_id: FamilyId::from_uuid(row.family_id),
            generation: row.generation_num,
            token_hash: row.token_hash_text,
            state,
            replaced_by: row.replaced_by_record_id,
            revocation_reason,
            expires_utc: row.expiry_utc,
            created_utc: row.created_utc,
            consumed_utc: row.consumed_utc,
            revoked_utc: row.revoked_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct ShareGrantRow {
    grant_id: Uuid,
    subject_id: Uuid,
    resource_id: Uuid,
    level_code: String,
    granted_by: Option<Uuid>,
    created_utc: DateTime<Utc>,
    revoked_utc: Option<DateTime<Utc>>,
    revoked_by: Option<Uuid>,
}

impl TryFrom<ShareGrantRow> for ShareGrant {
    type Error = CoreError;

    fn try_from(row: ShareGrantRow) -> Result<Self, Self::Error> {
        let level = PermissionLevel::parse(&row.level_code).ok_or_else(|| {
            CoreError::Store(anyhow!("Unknown permission level code: {}", row.level_code))
        })?;
        Ok(ShareGrant {
            grant_id: row.grant_id,
            subject_id: row.subject_id,
            resource_id: row.resource_id,
            level,
            granted_by: row.granted_by,
            created_utc: row.created_utc,
            revoked_utc: row.revoked_utc,
            revoked_by: row.revoked_by,
        })
    }
}

fn into_records(rows: Vec<RefreshCredentialRow>) -> Result<Vec<RefreshCredentialRecord>, CoreError> {
    rows.into_iter().map(RefreshCredentialRecord::try_from).collect()
}

async fn insert_record<'e, E: PgExecutor<'e>>(
    executor: E,
    record: &RefreshCredentialRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO refresh_credentials (
            record_id, family_id, subject_id, generation_num, token_hash_text, state_code,
            replaced_by_record_id, revocation_reason_code, expiry_utc, created_utc,
            consumed_utc, revoked_utc
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(record.record_id)
    .bind(record.family_id.as_uuid())
    .bind(record.subject_id)
    .bind(record.generation)
    .bind(&record.token_hash)
    .bind(record.state.as_str())
    .bind(record.replaced_by)
    .bind(record.revocation_reason.map(|r| r.as_str()))
    .bind(record.expires_utc)
    .bind(record.created_utc)
    .bind(record.consumed_utc)
    .bind(record.revoked_utc)
    .execute(executor)
    .await?;
    Ok(())
}

async fn revoke_family_records<'e, E: PgExecutor<'e>>(
    executor: E,
    family_ids: &[Uuid],
    reason: RevocationReason,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE refresh_credentials
        SET state_code = 'revoked', revocation_reason_code = $2, revoked_utc = NOW()
        WHERE family_id = ANY($1) AND state_code <> 'revoked'
        "#,
    )
    .bind(family_ids)
    .bind(reason.as_str())
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database wrapper from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Health check - ping the database.
    pub async fn health_check(&self) -> Result<(), CoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                CoreError::Store(anyhow!("Database health check failed: {}", e))
            })?;
        Ok(())
    }

    // ==================== Subject Operations ====================

    /// Insert a new subject.
    pub async fn insert_subject(&self, subject: &Subject) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO subjects (
                subject_id, email, username, email_key, username_key, password_hash,
                active_flag, admin_flag, deleted_utc, last_authenticated_utc,
                password_changed_utc, created_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(subject.subject_id)
        .bind(&subject.email)
        .bind(&subject.username)
        .bind(fold_identifier(&subject.email))
        .bind(fold_identifier(&subject.username))
        .bind(&subject.password_hash)
        .bind(subject.active_flag)
        .bind(subject.admin_flag)
        .bind(subject.deleted_utc)
        .bind(subject.last_authenticated_utc)
        .bind(subject.password_changed_utc)
        .bind(subject.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_subject_active(&self, subject_id: Uuid, active: bool) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE subjects SET active_flag = $2 WHERE subject_id = $1")
            .bind(subject_id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn soft_delete_subject(&self, subject_id: Uuid) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE subjects SET deleted_utc = NOW() WHERE subject_id = $1 AND deleted_utc IS NULL",
        )
        .bind(subject_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ==================== Resource & Grant Operations ====================

    /// Insert a resource together with its creator's owner grant.
    pub async fn insert_resource(&self, resource: &ResourceRecord) -> Result<ShareGrant, CoreError> {
        let owner_grant = ShareGrant::new(
            resource.owner_subject_id,
            resource.resource_id,
            PermissionLevel::Owner,
            Some(resource.owner_subject_id),
        );

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO resources (resource_id, owner_subject_id, created_utc, deleted_utc)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(resource.resource_id)
        .bind(resource.owner_subject_id)
        .bind(resource.created_utc)
        .bind(resource.deleted_utc)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO share_grants (grant_id, subject_id, resource_id, level_code, granted_by, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(owner_grant.grant_id)
        .bind(owner_grant.subject_id)
        .bind(owner_grant.resource_id)
        .bind(owner_grant.level.as_str())
        .bind(owner_grant.granted_by)
        .bind(owner_grant.created_utc)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(owner_grant)
    }

    /// Grant `level`, replacing the level of an existing active grant.
    pub async fn put_grant(
        &self,
        subject_id: Uuid,
        resource_id: Uuid,
        level: PermissionLevel,
        granted_by: Uuid,
    ) -> Result<ShareGrant, CoreError> {
        let row = sqlx::query_as::<_, ShareGrantRow>(
            r#"
            INSERT INTO share_grants (grant_id, subject_id, resource_id, level_code, granted_by, created_utc)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (subject_id, resource_id) WHERE revoked_utc IS NULL
            DO UPDATE SET level_code = EXCLUDED.level_code, granted_by = EXCLUDED.granted_by
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subject_id)
        .bind(resource_id)
        .bind(level.as_str())
        .bind(granted_by)
        .fetch_one(&self.pool)
        .await?;
        ShareGrant::try_from(row)
    }

    /// Mark the active grant revoked. The row stays as history.
    pub async fn revoke_grant(
        &self,
        subject_id: Uuid,
        resource_id: Uuid,
        revoked_by: Uuid,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE share_grants SET revoked_utc = NOW(), revoked_by = $3
            WHERE subject_id = $1 AND resource_id = $2 AND revoked_utc IS NULL
            "#,
        )
        .bind(subject_id)
        .bind(resource_id)
        .bind(revoked_by)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_resource(&self, resource_id: Uuid) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE resources SET deleted_utc = NOW() WHERE resource_id = $1 AND deleted_utc IS NULL",
        )
        .bind(resource_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SubjectStore for Database {
    async fn find_by_id(&self, subject_id: Uuid) -> Result<Option<Subject>, CoreError> {
        Ok(sqlx::query_as::<_, Subject>(
            "SELECT * FROM subjects WHERE subject_id = $1 AND deleted_utc IS NULL",
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<Subject>, CoreError> {
        // An email match wins over a username match.
        Ok(sqlx::query_as::<_, Subject>(
            r#"
            SELECT * FROM subjects
            WHERE (email_key = $1 OR username_key = $1)
              AND deleted_utc IS NULL
            ORDER BY (email_key = $1) DESC
            LIMIT 1
            "#,
        )
        .bind(fold_identifier(identifier))
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn mark_password_changed(
        &self,
        subject_id: Uuid,
        password_hash: &PasswordHashString,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE subjects SET password_hash = $2, password_changed_utc = NOW()
            WHERE subject_id = $1
            "#,
        )
        .bind(subject_id)
        .bind(password_hash.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::Store(anyhow!("Subject {} not found", subject_id)));
        }
        Ok(())
    }

    async fn record_authentication(
        &self,
        subject_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE subjects SET last_authenticated_utc = $2 WHERE subject_id = $1")
            .bind(subject_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for Database {
    async fn insert(&self, record: &RefreshCredentialRecord) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO refresh_families (family_id, subject_id, current_generation_num, created_utc)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(record.family_id.as_uuid())
        .bind(record.subject_id)
        .bind(record.generation)
        .bind(record.created_utc)
        .execute(&mut *tx)
        .await?;

        insert_record(&mut *tx, record).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshCredentialRecord>, CoreError> {
        let row = sqlx::query_as::<_, RefreshCredentialRow>(
            "SELECT * FROM refresh_credentials WHERE token_hash_text = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RefreshCredentialRecord::try_from).transpose()
    }

    async fn atomic_transition(
        &self,
        record_id: Uuid,
        expected: RecordState,
        new_state: RecordState,
        successor: Option<&RefreshCredentialRecord>,
    ) -> Result<TransitionOutcome, CoreError> {
        let mut tx = self.pool.begin().await?;

        // The family row lock serializes this against revoke_family.
        let family: Option<(Uuid, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT f.family_id, f.revoked_utc
            FROM refresh_families f
            JOIN refresh_credentials r ON r.family_id = f.family_id
            WHERE r.record_id = $1
            FOR UPDATE OF f
            "#,
        )
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((family_id, family_revoked_utc)) = family else {
            return Ok(TransitionOutcome::NotFound);
        };
        if family_revoked_utc.is_some() {
            return Ok(TransitionOutcome::FamilyRevoked);
        }
        if let Some(next) = successor {
            if next.family_id.as_uuid() != family_id {
                return Err(CoreError::Store(anyhow!(
                    "Successor belongs to family {}, expected {}",
                    next.family_id,
                    family_id
                )));
            }
        }

        let updated = sqlx::query(
            r#"
            UPDATE refresh_credentials
            SET state_code = $3::text,
                consumed_utc = CASE WHEN $3::text = 'consumed' THEN NOW() ELSE consumed_utc END,
                revoked_utc = CASE WHEN $3::text = 'revoked' THEN NOW() ELSE revoked_utc END
            WHERE record_id = $1 AND state_code = $2
            "#,
        )
        .bind(record_id)
        .bind(expected.as_str())
        .bind(new_state.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT state_code FROM refresh_credentials WHERE record_id = $1")
                    .bind(record_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(match current.as_deref().and_then(RecordState::parse) {
                Some(state) => TransitionOutcome::StateMismatch(state),
                None => TransitionOutcome::NotFound,
            });
        }

        if let Some(next) = successor {
            insert_record(&mut *tx, next).await?;

            sqlx::query(
                "UPDATE refresh_credentials SET replaced_by_record_id = $2 WHERE record_id = $1",
            )
            .bind(record_id)
            .bind(next.record_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE refresh_families SET current_generation_num = $2 WHERE family_id = $1",
            )
            .bind(family_id)
            .bind(next.generation)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(TransitionOutcome::Applied)
    }

    async fn revoke_family(
        &self,
        family_id: FamilyId,
        reason: RevocationReason,
    ) -> Result<u64, CoreError> {
        let mut tx = self.pool.begin().await?;

        // Takes the same row lock atomic_transition waits on.
        sqlx::query(
            r#"
            UPDATE refresh_families SET revoked_utc = NOW(), revocation_reason_code = $2
            WHERE family_id = $1 AND revoked_utc IS NULL
            "#,
        )
        .bind(family_id.as_uuid())
        .bind(reason.as_str())
        .execute(&mut *tx)
        .await?;

        let changed = revoke_family_records(&mut *tx, &[family_id.as_uuid()], reason).await?;

        tx.commit().await?;
        Ok(changed)
    }

    async fn revoke_subject_families(
        &self,
        subject_id: Uuid,
        reason: RevocationReason,
    ) -> Result<Vec<FamilyId>, CoreError> {
        let mut tx = self.pool.begin().await?;

        let family_ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE refresh_families SET revoked_utc = NOW(), revocation_reason_code = $2
            WHERE subject_id = $1 AND revoked_utc IS NULL
            RETURNING family_id
            "#,
        )
        .bind(subject_id)
        .bind(reason.as_str())
        .fetch_all(&mut *tx)
        .await?;

        if !family_ids.is_empty() {
            revoke_family_records(&mut *tx, &family_ids, reason).await?;
        }

        tx.commit().await?;
        Ok(family_ids.into_iter().map(FamilyId::from_uuid).collect())
    }

    async fn family_records(
        &self,
        family_id: FamilyId,
    ) -> Result<Vec<RefreshCredentialRecord>, CoreError> {
        let rows = sqlx::query_as::<_, RefreshCredentialRow>(
            "SELECT * FROM refresh_credentials WHERE family_id = $1 ORDER BY generation_num",
        )
        .bind(family_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    async fn active_records_for_subject(
        &self,
        subject_id: Uuid,
    ) -> Result<Vec<RefreshCredentialRecord>, CoreError> {
        let rows = sqlx::query_as::<_, RefreshCredentialRow>(
            r#"
            SELECT * FROM refresh_credentials
            WHERE subject_id = $1 AND state_code = 'active'
            ORDER BY created_utc
            "#,
        )
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }
}

#[async_trait]
impl GrantStore for Database {
    async fn find_resource(&self, resource_id: Uuid) -> Result<Option<ResourceRecord>, CoreError> {
        Ok(
            sqlx::query_as::<_, ResourceRecord>("SELECT * FROM resources WHERE resource_id = $1")
                .bind(resource_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_active_grant(
        &self,
        subject_id: Uuid,
        resource_id: Uuid,
    ) -> Result<Option<ShareGrant>, CoreError> {
        let row = sqlx::query_as::<_, ShareGrantRow>(
            r#"
            SELECT * FROM share_grants
            WHERE subject_id = $1 AND resource_id = $2 AND revoked_utc IS NULL
            "#,
        )
        .bind(subject_id)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ShareGrant::try_from).transpose()
    }

    async fn grant_history(
        &self,
        subject_id: Uuid,
        resource_id: Uuid,
    ) -> Result<Vec<ShareGrant>, CoreError> {
        let rows = sqlx::query_as::<_, ShareGrantRow>(
            r#"
            SELECT * FROM share_grants
            WHERE subject_id = $1 AND resource_id = $2
            ORDER BY created_utc
            "#,
        )
        .bind(subject_id)
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ShareGrant::try_from).collect()
    }
}
