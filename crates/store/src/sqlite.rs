use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use batch::{BatchJob, CheckpointState, CheckpointStore};
use chrono::{SecondsFormat, Utc};
use extract::{FeatureNameEntry, Insight, Taxonomy};
use ingest::{RequestKey, TranscriptRecord, TranscriptSource};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, QueryBuilder, Row, Sqlite};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::sink::{FeatureSink, InsightSink};

pub const DEFAULT_TRANSCRIPT_VIEW: &str = "v_transcripts";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS transcripts (
        transcript_id TEXT PRIMARY KEY,
        transcript_text TEXT NOT NULL DEFAULT '',
        summary TEXT,
        deal_id TEXT,
        deal_name TEXT,
        company_name TEXT,
        deal_region TEXT,
        deal_country TEXT,
        industry TEXT,
        company_size TEXT,
        segment TEXT,
        amount REAL,
        deal_stage TEXT,
        deal_owner TEXT,
        call_owner TEXT,
        call_date TEXT
    )
    "#,
    "CREATE VIEW IF NOT EXISTS v_transcripts AS SELECT * FROM transcripts",
    r#"
    CREATE TABLE IF NOT EXISTS transcript_insights (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        content_hash TEXT NOT NULL UNIQUE,
        transcript_id TEXT NOT NULL,
        transcript_chunk INTEGER NOT NULL,
        insight_type TEXT NOT NULL,
        insight_subtype TEXT NOT NULL,
        module TEXT,
        summary TEXT NOT NULL,
        verbatim_quote TEXT,
        confidence REAL NOT NULL CHECK (confidence >= 0 AND confidence <= 1),
        competitor_name TEXT,
        competitor_relationship TEXT,
        feature_name TEXT,
        gap_description TEXT,
        gap_priority TEXT,
        faq_topic TEXT,
        deal_id TEXT,
        deal_name TEXT,
        company_name TEXT,
        region TEXT,
        country TEXT,
        industry TEXT,
        company_size TEXT,
        segment TEXT,
        amount REAL,
        deal_stage TEXT,
        deal_owner TEXT,
        call_owner TEXT,
        call_date TEXT,
        model_used TEXT NOT NULL,
        prompt_version TEXT NOT NULL,
        batch_id TEXT,
        processed_at TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_insights_transcript ON transcript_insights (transcript_id, prompt_version)",
    "CREATE INDEX IF NOT EXISTS idx_insights_type ON transcript_insights (insight_type, insight_subtype)",
    // Rows of each transcript's most recently processed prompt version only.
    r#"
    CREATE VIEW IF NOT EXISTS v_insights_latest AS
    SELECT i.* FROM transcript_insights i
    WHERE i.prompt_version = (
        SELECT l.prompt_version FROM transcript_insights l
        WHERE l.transcript_id = i.transcript_id
        ORDER BY l.processed_at DESC, l.id DESC
        LIMIT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tax_feature_names (
        code TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        suggested_module TEXT,
        is_seed INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_checkpoint (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        prompt_version TEXT,
        job TEXT,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE TABLE IF NOT EXISTS checkpoint_pending_keys (request_key TEXT PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS checkpoint_loaded_hashes (content_hash TEXT PRIMARY KEY)",
];

/// SQLite-backed transcript view, insight sink, feature table and checkpoint.
pub struct SqliteStore {
    pool: SqlitePool,
    transcript_view: String,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Read any row shape into a record. Columns the record does not know are
/// ignored and missing ones stay `None`.
fn record_from_row(row: &SqliteRow) -> Result<TranscriptRecord> {
    let mut fields = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let Some(text) = row.try_get_unchecked::<Option<String>, _>(i)? else {
            continue;
        };
        let value = if column.name() == "amount" {
            match text.trim().parse::<f64>() {
                Ok(amount) => Value::from(amount),
                Err(_) => continue,
            }
        } else {
            Value::String(text)
        };
        fields.insert(column.name().to_string(), value);
    }
    serde_json::from_value(Value::Object(fields)).context("Transcript row does not match the record shape")
}

impl SqliteStore {
    pub async fn open(path: &Path, transcript_view: &str) -> Result<Self> {
        ensure!(
            is_identifier(transcript_view),
            "invalid transcript view name '{}'",
            transcript_view
        );
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .context(format!("Failed to create database directory: {:?}", parent))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(
                SqliteConnectOptions::from_str(path.to_str().context("Invalid database path")?)
                    .context("Failed to parse database path")?
                    .busy_timeout(Duration::from_secs(5))
                    .journal_mode(SqliteJournalMode::Wal)
                    .create_if_missing(true),
            )
            .await
            .context(format!("Failed to open database: {:?}", path))?;

        debug!(path = %path.display(), view = transcript_view, "Opened SQLite store");
        Ok(Self {
            pool,
            transcript_view: transcript_view.to_string(),
        })
    }

    /// Create tables and views. Safe to run repeatedly.
    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to apply schema")?;
        }
        info!("Database schema ready");
        Ok(())
    }

    /// Insert the taxonomy's seed features. Returns how many were new.
    pub async fn seed_features(&self, taxonomy: &Taxonomy) -> Result<usize> {
        let mut inserted = 0;
        for feature in taxonomy.seed_features() {
            if self.append_feature(feature).await? {
                inserted += 1;
            }
        }
        info!(inserted, "Seeded feature names");
        Ok(inserted)
    }

    /// Load records into the `transcripts` table behind the default view.
    pub async fn import_transcripts(&self, records: &[TranscriptRecord]) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for record in records {
            let crm = &record.crm;
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO transcripts (
                    transcript_id, transcript_text, summary,
                    deal_id, deal_name, company_name, deal_region, deal_country,
                    industry, company_size, segment, amount,
                    deal_stage, deal_owner, call_owner, call_date
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.transcript_id)
            .bind(&record.transcript_text)
            .bind(&record.summary)
            .bind(&crm.deal_id)
            .bind(&crm.deal_name)
            .bind(&crm.company_name)
            .bind(&crm.region)
            .bind(&crm.country)
            .bind(&crm.industry)
            .bind(&crm.company_size)
            .bind(&crm.segment)
            .bind(crm.amount)
            .bind(&crm.deal_stage)
            .bind(&crm.deal_owner)
            .bind(&crm.call_owner)
            .bind(&crm.call_date)
            .execute(&mut *tx)
            .await
            .context(format!("Failed to import transcript {}", record.transcript_id))?;
        }
        tx.commit().await.context("Failed to commit transcript import")?;
        info!(count = records.len(), "Imported transcripts");
        Ok(records.len())
    }

    /// Insight totals per prompt version, newest version first.
    pub async fn counts_by_version(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT prompt_version, COUNT(*) AS n, MAX(processed_at) AS last_at
            FROM transcript_insights
            GROUP BY prompt_version
            ORDER BY last_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count insights")?;

        rows.iter()
            .map(|row| Ok((row.try_get("prompt_version")?, row.try_get("n")?)))
            .collect()
    }
}

#[async_trait]
impl TranscriptSource for SqliteStore {
    async fn fetch_transcripts(&self, limit: Option<usize>) -> Result<Vec<TranscriptRecord>> {
        let sql = format!("SELECT * FROM {} LIMIT ?", self.transcript_view);
        let rows = sqlx::query(&sql)
            .bind(limit.map(|n| n as i64).unwrap_or(-1))
            .fetch_all(&self.pool)
            .await
            .context(format!("Failed to read transcript view {}", self.transcript_view))?;
        rows.iter().map(record_from_row).collect()
    }

    async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<TranscriptRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT * FROM {} WHERE transcript_id IN (",
            self.transcript_view
        ));
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .context(format!("Failed to read transcript view {}", self.transcript_view))?;
        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl InsightSink for SqliteStore {
    async fn insert_if_absent(&self, insight: &Insight) -> Result<bool> {
        let crm = &insight.crm;
        let result = sqlx::query(
            r#"
            INSERT INTO transcript_insights (
                content_hash, transcript_id, transcript_chunk,
                insight_type, insight_subtype, module,
                summary, verbatim_quote, confidence,
                competitor_name, competitor_relationship,
                feature_name, gap_description, gap_priority, faq_topic,
                deal_id, deal_name, company_name, region, country,
                industry, company_size, segment, amount,
                deal_stage, deal_owner, call_owner, call_date,
                model_used, prompt_version, batch_id, processed_at
            )
            VALUES (
                ?, ?, ?,
                ?, ?, ?,
                ?, ?, ?,
                ?, ?,
                ?, ?, ?, ?,
                ?, ?, ?, ?, ?,
                ?, ?, ?, ?,
                ?, ?, ?, ?,
                ?, ?, ?, ?
            )
            ON CONFLICT(content_hash) DO NOTHING
            "#,
        )
        .bind(&insight.content_hash)
        .bind(&insight.transcript_id)
        .bind(insight.transcript_chunk as i64)
        .bind(insight.insight_type.as_str())
        .bind(&insight.insight_subtype)
        .bind(&insight.module)
        .bind(&insight.summary)
        .bind(&insight.verbatim_quote)
        .bind(insight.confidence)
        .bind(&insight.competitor_name)
        .bind(&insight.competitor_relationship)
        .bind(&insight.feature_name)
        .bind(&insight.gap_description)
        .bind(insight.gap_priority.map(|p| p.as_str()))
        .bind(&insight.faq_topic)
        .bind(&crm.deal_id)
        .bind(&crm.deal_name)
        .bind(&crm.company_name)
        .bind(&crm.region)
        .bind(&crm.country)
        .bind(&crm.industry)
        .bind(&crm.company_size)
        .bind(&crm.segment)
        .bind(crm.amount)
        .bind(&crm.deal_stage)
        .bind(&crm.deal_owner)
        .bind(&crm.call_owner)
        .bind(&crm.call_date)
        .bind(&insight.model_used)
        .bind(&insight.prompt_version)
        .bind(&insight.batch_id)
        .bind(insight.processed_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await
        .context(format!("Failed to insert insight {}", insight.content_hash))?;

        Ok(result.rows_affected() == 1)
    }

    async fn processed_transcripts(&self, prompt_version: &str) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT transcript_id FROM transcript_insights WHERE prompt_version = ?",
        )
        .bind(prompt_version)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read processed transcripts")?;
        Ok(ids.into_iter().collect())
    }

    async fn insight_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transcript_insights")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count insights")?;
        Ok(count as usize)
    }
}

#[async_trait]
impl FeatureSink for SqliteStore {
    async fn load_features(&self) -> Result<Vec<FeatureNameEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT code, display_name, suggested_module, is_seed
            FROM tax_feature_names
            ORDER BY is_seed DESC, code
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to read feature names")?;

        rows.iter()
            .map(|row| {
                Ok(FeatureNameEntry {
                    code: row.try_get("code")?,
                    display_name: row.try_get("display_name")?,
                    suggested_module: row.try_get("suggested_module")?,
                    is_seed: row.try_get("is_seed")?,
                })
            })
            .collect()
    }

    async fn append_feature(&self, entry: &FeatureNameEntry) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO tax_feature_names (code, display_name, suggested_module, is_seed)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(code) DO NOTHING
            "#,
        )
        .bind(&entry.code)
        .bind(&entry.display_name)
        .bind(&entry.suggested_module)
        .bind(entry.is_seed)
        .execute(&self.pool)
        .await
        .context(format!("Failed to store feature name {}", entry.code))?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn load(&self) -> Result<Option<CheckpointState>> {
        let row = sqlx::query("SELECT prompt_version, job FROM pipeline_checkpoint WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read checkpoint")?;
        let pending: Vec<String> = sqlx::query_scalar("SELECT request_key FROM checkpoint_pending_keys")
            .fetch_all(&self.pool)
            .await
            .context("Failed to read pending request keys")?;
        let loaded: Vec<String> = sqlx::query_scalar("SELECT content_hash FROM checkpoint_loaded_hashes")
            .fetch_all(&self.pool)
            .await
            .context("Failed to read loaded fingerprints")?;

        if row.is_none() && pending.is_empty() && loaded.is_empty() {
            return Ok(None);
        }

        let (prompt_version, job) = match row {
            Some(row) => {
                let job: Option<String> = row.try_get("job")?;
                let job = job
                    .map(|json| serde_json::from_str::<BatchJob>(&json))
                    .transpose()
                    .context("Checkpointed job is corrupt")?;
                (row.try_get("prompt_version")?, job)
            }
            None => (None, None),
        };

        let pending_request_keys = pending
            .iter()
            .map(|key| key.parse::<RequestKey>().map_err(anyhow::Error::msg))
            .collect::<Result<BTreeSet<_>>>()
            .context("Checkpointed request key is corrupt")?;

        Ok(Some(CheckpointState {
            prompt_version,
            job,
            pending_request_keys,
            loaded_fingerprints: loaded.into_iter().collect(),
        }))
    }

    async fn save(&self, state: &CheckpointState) -> Result<()> {
        let job = state
            .job
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode job")?;

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for table in ["pipeline_checkpoint", "checkpoint_pending_keys", "checkpoint_loaded_hashes"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("INSERT INTO pipeline_checkpoint (id, prompt_version, job, updated_at) VALUES (1, ?, ?, ?)")
            .bind(&state.prompt_version)
            .bind(job)
            .bind(now())
            .execute(&mut *tx)
            .await?;
        for key in &state.pending_request_keys {
            sqlx::query("INSERT INTO checkpoint_pending_keys (request_key) VALUES (?)")
                .bind(key.to_string())
                .execute(&mut *tx)
                .await?;
        }
        for hash in &state.loaded_fingerprints {
            sqlx::query("INSERT INTO checkpoint_loaded_hashes (content_hash) VALUES (?)")
                .bind(hash)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await.context("Failed to commit checkpoint")?;

        debug!(
            job_id = state.job_id().unwrap_or("-"),
            pending = state.pending_request_keys.len(),
            loaded = state.loaded_fingerprints.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn mark_loaded(&self, content_hash: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO checkpoint_loaded_hashes (content_hash) VALUES (?)")
            .bind(content_hash)
            .execute(&self.pool)
            .await
            .context("Failed to checkpoint loaded fingerprint")?;
        Ok(())
    }

    async fn mark_resolved(&self, key: &RequestKey) -> Result<()> {
        sqlx::query("DELETE FROM checkpoint_pending_keys WHERE request_key = ?")
            .bind(key.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to checkpoint resolved request")?;
        Ok(())
    }

    async fn mark_job_state(&self, job: &BatchJob) -> Result<()> {
        let encoded = serde_json::to_string(job).context("Failed to encode job")?;
        sqlx::query(
            r#"
            INSERT INTO pipeline_checkpoint (id, job, updated_at) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET job = excluded.job, updated_at = excluded.updated_at
            "#,
        )
        .bind(encoded)
        .bind(now())
        .execute(&self.pool)
        .await
        .context("Failed to checkpoint job state")?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for table in ["pipeline_checkpoint", "checkpoint_pending_keys", "checkpoint_loaded_hashes"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await.context("Failed to clear checkpoint")?;
        Ok(())
    }
}
