//! PostgreSQL pool, schema bootstrap, and the relational side of the data
//! model: job postings, applications, the PII side map, and queue
//! durability rows.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Application, ApplicationRef, JobPosting, SubjectCode};

/// Creates and returns a PostgreSQL connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    info!("PostgreSQL connection pool established");
    Ok(pool)
}

/// Creates the tables this service owns. Idempotent; runs at startup.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), AppError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS job_postings (
            posting_id   UUID PRIMARY KEY,
            jd_id        UUID NOT NULL,
            public_token TEXT NOT NULL UNIQUE,
            subject_code TEXT NOT NULL UNIQUE,
            active       BOOLEAN NOT NULL DEFAULT TRUE,
            created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
            created_by   UUID NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS applications (
            application_id           UUID PRIMARY KEY,
            posting_id               UUID NOT NULL,
            cv_id                    UUID NOT NULL,
            applicant_name           TEXT,
            applicant_email          TEXT,
            applicant_phone          TEXT,
            email_id                 TEXT NOT NULL UNIQUE,
            status                   TEXT NOT NULL DEFAULT 'received',
            match_score              REAL,
            submitted_at             TIMESTAMPTZ NOT NULL DEFAULT now(),
            requires_manual_matching BOOLEAN NOT NULL DEFAULT TRUE,
            orphaned                 BOOLEAN NOT NULL DEFAULT FALSE
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS document_pii (
            document_id UUID PRIMARY KEY,
            email       TEXT,
            phone       TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS queue_jobs (
            id          UUID PRIMARY KEY,
            kind        TEXT NOT NULL,
            priority    TEXT NOT NULL,
            payload     JSONB NOT NULL,
            idem_key    TEXT NOT NULL,
            attempts    INT NOT NULL DEFAULT 0,
            status      TEXT NOT NULL,
            checkpoint  TEXT,
            error       TEXT,
            result      JSONB,
            created_at  TIMESTAMPTZ NOT NULL,
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
            deadline_ms BIGINT
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Debug, sqlx::FromRow)]
struct PostingRow {
    posting_id: Uuid,
    jd_id: Uuid,
    public_token: String,
    subject_code: String,
    active: bool,
    created_at: DateTime<Utc>,
    created_by: Uuid,
}

impl PostingRow {
    fn into_posting(self, applications: Vec<ApplicationRef>) -> Result<JobPosting, AppError> {
        Ok(JobPosting {
            posting_id: self.posting_id,
            jd_id: self.jd_id,
            public_token: self.public_token,
            subject_code: SubjectCode::parse(&self.subject_code)?,
            active: self.active,
            created_at: self.created_at,
            created_by: self.created_by,
            applications,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
#[allow(dead_code)]
struct ApplicationRow {
    application_id: Uuid,
    posting_id: Uuid,
    cv_id: Uuid,
    applicant_name: Option<String>,
    applicant_email: Option<String>,
    applicant_phone: Option<String>,
    email_id: String,
    status: String,
    match_score: Option<f32>,
    submitted_at: DateTime<Utc>,
    requires_manual_matching: bool,
    orphaned: bool,
}

pub async fn insert_posting(pool: &PgPool, posting: &JobPosting) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO job_postings
            (posting_id, jd_id, public_token, subject_code, active, created_at, created_by)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(posting.posting_id)
    .bind(posting.jd_id)
    .bind(&posting.public_token)
    .bind(posting.subject_code.as_str())
    .bind(posting.active)
    .bind(posting.created_at)
    .bind(posting.created_by)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_posting(pool: &PgPool, posting_id: Uuid) -> Result<Option<JobPosting>, AppError> {
    let row: Option<PostingRow> =
        sqlx::query_as("SELECT * FROM job_postings WHERE posting_id = $1")
            .bind(posting_id)
            .fetch_optional(pool)
            .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let applications = posting_applications(pool, posting_id).await?;
    Ok(Some(row.into_posting(applications)?))
}

/// Lookup for the mail ingestor. Only active postings route applications.
pub async fn get_posting_by_subject_code(
    pool: &PgPool,
    code: &SubjectCode,
) -> Result<Option<JobPosting>, AppError> {
    let row: Option<PostingRow> =
        sqlx::query_as("SELECT * FROM job_postings WHERE subject_code = $1")
            .bind(code.as_str())
            .fetch_optional(pool)
            .await?;
    match row {
        Some(row) => Ok(Some(row.into_posting(Vec::new())?)),
        None => Ok(None),
    }
}

async fn posting_applications(
    pool: &PgPool,
    posting_id: Uuid,
) -> Result<Vec<ApplicationRef>, AppError> {
    let rows: Vec<ApplicationRow> = sqlx::query_as(
        "SELECT * FROM applications WHERE posting_id = $1 ORDER BY submitted_at",
    )
    .bind(posting_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| ApplicationRef {
            cv_id: r.cv_id,
            status: r.status,
            submitted_at: r.submitted_at,
            match_score: r.match_score,
        })
        .collect())
}

pub async fn insert_application(pool: &PgPool, application: &Application) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO applications
            (application_id, posting_id, cv_id, applicant_name, applicant_email,
             applicant_phone, email_id, submitted_at, requires_manual_matching, orphaned)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
         ON CONFLICT (email_id) DO NOTHING",
    )
    .bind(application.application_id)
    .bind(application.posting_id)
    .bind(application.cv_id)
    .bind(&application.applicant_name)
    .bind(&application.applicant_email)
    .bind(&application.applicant_phone)
    .bind(&application.email_id)
    .bind(application.submitted_at)
    .bind(application.requires_manual_matching)
    .bind(application.orphaned)
    .execute(pool)
    .await?;
    Ok(())
}

/// Soft-state deletion rule: removing a CV or posting marks its
/// applications orphaned instead of deleting them.
pub async fn orphan_applications_for_cv(pool: &PgPool, cv_id: Uuid) -> Result<u64, AppError> {
    let result = sqlx::query("UPDATE applications SET orphaned = TRUE WHERE cv_id = $1")
        .bind(cv_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn orphan_applications_for_posting(
    pool: &PgPool,
    posting_id: Uuid,
) -> Result<u64, AppError> {
    let result = sqlx::query("UPDATE applications SET orphaned = TRUE WHERE posting_id = $1")
        .bind(posting_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// PII side map: originals of masked tokens, keyed by document id. These
/// never enter the vector store.
pub async fn upsert_document_pii(
    pool: &PgPool,
    document_id: Uuid,
    email: Option<&str>,
    phone: Option<&str>,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO document_pii (document_id, email, phone)
         VALUES ($1, $2, $3)
         ON CONFLICT (document_id) DO UPDATE SET email = $2, phone = $3",
    )
    .bind(document_id)
    .bind(email)
    .bind(phone)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_document_pii(pool: &PgPool, document_id: Uuid) -> Result<(), AppError> {
    sqlx::query("DELETE FROM document_pii WHERE document_id = $1")
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}
