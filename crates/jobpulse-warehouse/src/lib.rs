//! Warehouse collaborators: staging sink, batch ledger and the merge executor.

use std::collections::BTreeSet;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use jobpulse_core::{CanonicalPosting, CityClusterRow, IdMatch, PositionRow, RawPosting, SkillRow};

pub const CRATE_NAME: &str = "jobpulse-warehouse";

pub const RAW_LOADS_TABLE: &str = "raw_loads";
pub const RAW_POSTINGS_TABLE: &str = "raw_postings";
pub const LEDGER_TABLE: &str = "processed_loads";
pub const JOBS_BATCH_TABLE: &str = "jobs_batch";
pub const POSITIONS_BATCH_TABLE: &str = "jobs_positions_batch";
pub const CITY_CLUSTERS_BATCH_TABLE: &str = "jobs_city_clusters_batch";
pub const SKILLS_BATCH_TABLE: &str = "jobs_skills_batch";
pub const ID_MATCHING_TABLE: &str = "posting_id_matching";
pub const JOBS_TABLE: &str = "jobs";

/// Column set of the long-lived analytical table, in merge order.
pub const JOBS_FINAL_COLUMNS: [&str; 10] = [
    "id",
    "date_created",
    "company",
    "portal",
    "url",
    "years_of_experience",
    "description",
    "city_clusters",
    "positions",
    "skills",
];

/// One append-only ledger record. Start entries carry no `finished_at`;
/// completion entries are separate rows, and eligibility filters on
/// `max(finished_at)` per load.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub load_id: String,
    pub processed_by: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    pub fn start(load_id: &str, processed_by: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            load_id: load_id.to_string(),
            processed_by: processed_by.to_string(),
            started_at,
            finished_at: None,
        }
    }

    pub fn finish(
        load_id: &str,
        processed_by: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            load_id: load_id.to_string(),
            processed_by: processed_by.to_string(),
            started_at,
            finished_at: Some(finished_at),
        }
    }
}

// ---------------------------------------------------------------------------
// Merge executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MergeSpec<'a> {
    pub destination: &'a str,
    pub source: &'a str,
    pub key_columns: &'a [&'a str],
    pub insert_columns: &'a [&'a str],
    pub update_columns: &'a [&'a str],
    pub raise_duplicates_error: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: u64,
    pub updated: u64,
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("at least one of insert_columns / update_columns must be non-empty")]
    NoColumns,
    #[error("found {count} duplicated keys in {table} on {key_columns:?}")]
    DuplicateKeys {
        table: String,
        key_columns: Vec<String>,
        count: i64,
    },
}

/// Render the conditional upsert. Matched rows update the update columns
/// (key columns excluded), unmatched rows insert the insert columns; either
/// clause is omitted when its column list is empty.
pub fn build_merge_statement(
    destination: &str,
    source: &str,
    key_columns: &[&str],
    insert_columns: &[&str],
    update_columns: &[&str],
) -> Result<String, MergeError> {
    if insert_columns.is_empty() && update_columns.is_empty() {
        return Err(MergeError::NoColumns);
    }

    let match_clause = key_columns
        .iter()
        .map(|col| format!("t.{col} = s.{col}"))
        .collect::<Vec<_>>()
        .join("\n    AND ");

    let update_columns: Vec<&str> = update_columns
        .iter()
        .copied()
        .filter(|col| !key_columns.contains(col))
        .collect();
    let update_statement = if update_columns.is_empty() {
        String::new()
    } else {
        let update_clause = update_columns
            .iter()
            .map(|col| format!("t.{col} = s.{col}"))
            .collect::<Vec<_>>()
            .join(",\n        ");
        format!("\nWHEN MATCHED THEN\n    UPDATE SET\n        {update_clause}")
    };

    let insert_statement = if insert_columns.is_empty() {
        String::new()
    } else {
        let insert_columns_clause = insert_columns.join(",\n        ");
        let insert_values_clause = insert_columns
            .iter()
            .map(|col| format!("s.{col}"))
            .collect::<Vec<_>>()
            .join(",\n        ");
        format!(
            "\nWHEN NOT MATCHED THEN\n    INSERT (\n        {insert_columns_clause}\n    )\n    VALUES (\n        {insert_values_clause}\n    )"
        )
    };

    Ok(format!(
        "MERGE INTO {destination} t\nUSING {source} s\n    ON {match_clause}{update_statement}{insert_statement}"
    ))
}

// ---------------------------------------------------------------------------
// Warehouse interface
// ---------------------------------------------------------------------------

/// The storage seam the pipeline runs against: raw posting source, staging
/// sink, ledger and merge executor.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Register a staged load; `status = 0` makes it visible to the transform.
    async fn register_load(&self, load_id: &str, loaded_at: DateTime<Utc>) -> Result<()>;

    async fn append_raw_postings(&self, rows: &[RawPosting]) -> Result<()>;

    /// Raw rows of every load without a finished ledger entry for this
    /// pipeline, filtered by locale, ordered by `(load_id, source_row_id)`.
    async fn unprocessed_postings(&self, pipeline_name: &str, locale: &str)
        -> Result<Vec<RawPosting>>;

    async fn append_ledger_entries(&self, entries: &[LedgerEntry]) -> Result<()>;

    async fn replace_canonical_batch(&self, rows: &[CanonicalPosting]) -> Result<()>;
    async fn replace_position_batch(&self, rows: &[PositionRow]) -> Result<()>;
    async fn replace_city_cluster_batch(&self, rows: &[CityClusterRow]) -> Result<()>;
    async fn replace_skill_batch(&self, rows: &[SkillRow]) -> Result<()>;

    async fn append_id_matches(&self, rows: &[IdMatch], matched_at: DateTime<Utc>) -> Result<()>;

    /// Upsert the staged canonical batch into the analytical table.
    async fn merge_canonical_batch(&self, raise_duplicates_error: bool) -> Result<MergeOutcome>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgWarehouse {
    pool: PgPool,
    dataset: String,
    analytical_dataset: String,
}

impl PgWarehouse {
    pub async fn connect(
        database_url: &str,
        dataset: &str,
        analytical_dataset: &str,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to warehouse")?;
        Ok(Self::from_pool(pool, dataset, analytical_dataset))
    }

    pub fn from_pool(pool: PgPool, dataset: &str, analytical_dataset: &str) -> Self {
        Self {
            pool,
            dataset: dataset.to_string(),
            analytical_dataset: analytical_dataset.to_string(),
        }
    }

    fn staging_table(&self, table: &str) -> String {
        format!("{}.{}", self.dataset, table)
    }

    fn analytical_table(&self, table: &str) -> String {
        format!("{}.{}", self.analytical_dataset, table)
    }

    /// Idempotent schema bootstrap for every table this crate touches.
    pub async fn run_migrations(&self) -> Result<()> {
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.dataset),
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.analytical_dataset),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    load_id TEXT NOT NULL,
                    status INT NOT NULL,
                    loaded_at TIMESTAMPTZ NOT NULL
                )",
                self.staging_table(RAW_LOADS_TABLE)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    load_id TEXT NOT NULL,
                    source_row_id TEXT NOT NULL,
                    company TEXT,
                    city TEXT,
                    title TEXT,
                    occupation TEXT,
                    url TEXT,
                    portal TEXT,
                    experience_months DOUBLE PRECISION,
                    date_created DATE NOT NULL,
                    description TEXT,
                    locale TEXT
                )",
                self.staging_table(RAW_POSTINGS_TABLE)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    load_id TEXT NOT NULL,
                    processed_by TEXT NOT NULL,
                    started_at TIMESTAMPTZ NOT NULL,
                    finished_at TIMESTAMPTZ
                )",
                self.staging_table(LEDGER_TABLE)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT NOT NULL,
                    date_created DATE NOT NULL,
                    company TEXT,
                    portal TEXT,
                    url TEXT,
                    years_of_experience INT,
                    description TEXT,
                    city_clusters TEXT[] NOT NULL,
                    positions TEXT[] NOT NULL,
                    skills TEXT[] NOT NULL
                )",
                self.staging_table(JOBS_BATCH_TABLE)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    posting_id TEXT NOT NULL,
                    title_raw TEXT,
                    occupation_raw TEXT,
                    position TEXT NOT NULL
                )",
                self.staging_table(POSITIONS_BATCH_TABLE)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    posting_id TEXT NOT NULL,
                    city_raw TEXT,
                    city_cluster TEXT NOT NULL
                )",
                self.staging_table(CITY_CLUSTERS_BATCH_TABLE)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    posting_id TEXT NOT NULL,
                    skill TEXT NOT NULL
                )",
                self.staging_table(SKILLS_BATCH_TABLE)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    source_row_id TEXT NOT NULL,
                    posting_id TEXT NOT NULL,
                    is_source BOOLEAN NOT NULL,
                    matched_at TIMESTAMPTZ NOT NULL
                )",
                self.staging_table(ID_MATCHING_TABLE)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT NOT NULL,
                    date_created DATE NOT NULL,
                    company TEXT,
                    portal TEXT,
                    url TEXT,
                    years_of_experience INT,
                    description TEXT,
                    city_clusters TEXT[] NOT NULL,
                    positions TEXT[] NOT NULL,
                    skills TEXT[] NOT NULL
                )",
                self.analytical_table(JOBS_TABLE)
            ),
        ];
        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("running migration: {statement}"))?;
        }
        info!(dataset = %self.dataset, analytical = %self.analytical_dataset, "warehouse schema ready");
        Ok(())
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        sqlx::query(&format!("TRUNCATE TABLE {table}"))
            .execute(&self.pool)
            .await
            .with_context(|| format!("truncating {table}"))?;
        debug!(table, "truncated");
        Ok(())
    }

    /// Count key duplicates in `table`; fatal or warning per `raise_error`.
    pub async fn check_duplicates(
        &self,
        table: &str,
        key_columns: &[&str],
        raise_error: bool,
    ) -> Result<bool> {
        let group_by = key_columns.join(", ");
        let query = format!(
            "SELECT COUNT(1) AS duplicate_count FROM (
                SELECT 1 FROM {table} GROUP BY {group_by} HAVING COUNT(1) > 1
            ) d"
        );
        let row = sqlx::query(&query)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("checking duplicates in {table}"))?;
        let count: i64 = row.try_get("duplicate_count")?;
        if count > 0 {
            let error = MergeError::DuplicateKeys {
                table: table.to_string(),
                key_columns: key_columns.iter().map(|c| c.to_string()).collect(),
                count,
            };
            if raise_error {
                return Err(error.into());
            }
            warn!("{error}");
            return Ok(true);
        }
        Ok(false)
    }

    /// Key-based upsert with pre-merge duplicate assertions on both tables.
    pub async fn merge(&self, spec: &MergeSpec<'_>) -> Result<MergeOutcome> {
        let span = info_span!("merge", source = spec.source, destination = spec.destination);
        let _guard = span.enter();

        self.check_duplicates(spec.source, spec.key_columns, spec.raise_duplicates_error)
            .await?;
        self.check_duplicates(spec.destination, spec.key_columns, spec.raise_duplicates_error)
            .await?;

        let statement = build_merge_statement(
            spec.destination,
            spec.source,
            spec.key_columns,
            spec.insert_columns,
            spec.update_columns,
        )?;

        // Postgres reports one combined row count for MERGE, so the
        // inserted/updated split is read off a join before executing.
        let match_clause = spec
            .key_columns
            .iter()
            .map(|col| format!("t.{col} = s.{col}"))
            .collect::<Vec<_>>()
            .join(" AND ");
        let first_key = spec.key_columns[0];
        let counts_query = format!(
            "SELECT count(*) AS source_rows, count(t.{first_key}) AS matched_rows
             FROM {} s LEFT JOIN {} t ON {match_clause}",
            spec.source, spec.destination
        );
        let counts = sqlx::query(&counts_query)
            .fetch_one(&self.pool)
            .await
            .context("counting merge candidates")?;
        let source_rows: i64 = counts.try_get("source_rows")?;
        let matched_rows: i64 = counts.try_get("matched_rows")?;

        debug!(statement = %statement, "executing merge");
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .with_context(|| format!("merging {} into {}", spec.source, spec.destination))?;

        let outcome = MergeOutcome {
            inserted: (source_rows - matched_rows) as u64,
            updated: matched_rows as u64,
        };
        info!(
            source = spec.source,
            destination = spec.destination,
            inserted = outcome.inserted,
            updated = outcome.updated,
            "merge complete"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn register_load(&self, load_id: &str, loaded_at: DateTime<Utc>) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (load_id, status, loaded_at) VALUES ($1, 0, $2)",
            self.staging_table(RAW_LOADS_TABLE)
        );
        sqlx::query(&query)
            .bind(load_id)
            .bind(loaded_at)
            .execute(&self.pool)
            .await
            .with_context(|| format!("registering load {load_id}"))?;
        Ok(())
    }

    async fn append_raw_postings(&self, rows: &[RawPosting]) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (load_id, source_row_id, company, city, title, occupation,
                             url, portal, experience_months, date_created, description, locale)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            self.staging_table(RAW_POSTINGS_TABLE)
        );
        let mut tx = self.pool.begin().await.context("starting transaction")?;
        for row in rows {
            sqlx::query(&query)
                .bind(&row.load_id)
                .bind(&row.source_row_id)
                .bind(&row.company)
                .bind(&row.city)
                .bind(&row.title)
                .bind(&row.occupation)
                .bind(&row.url)
                .bind(&row.portal)
                .bind(row.experience_months)
                .bind(row.date_created)
                .bind(&row.description)
                .bind(&row.locale)
                .execute(&mut *tx)
                .await
                .context("appending raw posting")?;
        }
        tx.commit().await.context("committing raw postings")?;
        Ok(())
    }

    async fn unprocessed_postings(
        &self,
        pipeline_name: &str,
        locale: &str,
    ) -> Result<Vec<RawPosting>> {
        let query = format!(
            "WITH processed_loads AS (
                SELECT load_id
                FROM {ledger}
                WHERE processed_by = $1
                GROUP BY load_id
                HAVING max(finished_at) IS NOT NULL
            ),
            new_loads AS (
                SELECT DISTINCT rl.load_id
                FROM {raw_loads} rl
                LEFT JOIN processed_loads pl ON rl.load_id = pl.load_id
                WHERE rl.status = 0
                  AND pl.load_id IS NULL
            )
            SELECT rp.load_id, rp.source_row_id, rp.company, rp.city, rp.title,
                   rp.occupation, rp.url, rp.portal, rp.experience_months,
                   rp.date_created, rp.description, rp.locale
            FROM {raw_postings} rp
            INNER JOIN new_loads nl ON rp.load_id = nl.load_id
            WHERE rp.locale = $2
            ORDER BY rp.load_id, rp.source_row_id",
            ledger = self.staging_table(LEDGER_TABLE),
            raw_loads = self.staging_table(RAW_LOADS_TABLE),
            raw_postings = self.staging_table(RAW_POSTINGS_TABLE),
        );
        let rows = sqlx::query(&query)
            .bind(pipeline_name)
            .bind(locale)
            .fetch_all(&self.pool)
            .await
            .context("querying unprocessed postings")?;

        rows.into_iter()
            .map(|row| {
                Ok(RawPosting {
                    load_id: row.try_get("load_id")?,
                    source_row_id: row.try_get("source_row_id")?,
                    company: row.try_get("company")?,
                    city: row.try_get("city")?,
                    title: row.try_get("title")?,
                    occupation: row.try_get("occupation")?,
                    url: row.try_get("url")?,
                    portal: row.try_get("portal")?,
                    experience_months: row.try_get("experience_months")?,
                    date_created: row.try_get("date_created")?,
                    description: row.try_get("description")?,
                    locale: row.try_get("locale")?,
                })
            })
            .collect()
    }

    async fn append_ledger_entries(&self, entries: &[LedgerEntry]) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (load_id, processed_by, started_at, finished_at)
             VALUES ($1, $2, $3, $4)",
            self.staging_table(LEDGER_TABLE)
        );
        let mut tx = self.pool.begin().await.context("starting transaction")?;
        for entry in entries {
            sqlx::query(&query)
                .bind(&entry.load_id)
                .bind(&entry.processed_by)
                .bind(entry.started_at)
                .bind(entry.finished_at)
                .execute(&mut *tx)
                .await
                .context("appending ledger entry")?;
        }
        tx.commit().await.context("committing ledger entries")?;
        Ok(())
    }

    async fn replace_canonical_batch(&self, rows: &[CanonicalPosting]) -> Result<()> {
        let table = self.staging_table(JOBS_BATCH_TABLE);
        self.truncate(&table).await?;
        let query = format!(
            "INSERT INTO {table} (id, date_created, company, portal, url,
                                  years_of_experience, description, city_clusters, positions, skills)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        );
        let mut tx = self.pool.begin().await.context("starting transaction")?;
        for row in rows {
            sqlx::query(&query)
                .bind(&row.id)
                .bind(row.date_created)
                .bind(&row.company)
                .bind(&row.portal)
                .bind(&row.url)
                .bind(row.years_of_experience)
                .bind(&row.description)
                .bind(&row.city_clusters)
                .bind(&row.positions)
                .bind(&row.skills)
                .execute(&mut *tx)
                .await
                .context("staging canonical posting")?;
        }
        tx.commit().await.context("committing canonical batch")?;
        info!(rows = rows.len(), table = %table, "staged canonical batch");
        Ok(())
    }

    async fn replace_position_batch(&self, rows: &[PositionRow]) -> Result<()> {
        let table = self.staging_table(POSITIONS_BATCH_TABLE);
        self.truncate(&table).await?;
        let query = format!(
            "INSERT INTO {table} (posting_id, title_raw, occupation_raw, position)
             VALUES ($1, $2, $3, $4)"
        );
        let mut tx = self.pool.begin().await.context("starting transaction")?;
        for row in rows {
            sqlx::query(&query)
                .bind(&row.posting_id)
                .bind(&row.title_raw)
                .bind(&row.occupation_raw)
                .bind(&row.position)
                .execute(&mut *tx)
                .await
                .context("staging position row")?;
        }
        tx.commit().await.context("committing position batch")?;
        Ok(())
    }

    async fn replace_city_cluster_batch(&self, rows: &[CityClusterRow]) -> Result<()> {
        let table = self.staging_table(CITY_CLUSTERS_BATCH_TABLE);
        self.truncate(&table).await?;
        let query = format!(
            "INSERT INTO {table} (posting_id, city_raw, city_cluster) VALUES ($1, $2, $3)"
        );
        let mut tx = self.pool.begin().await.context("starting transaction")?;
        for row in rows {
            sqlx::query(&query)
                .bind(&row.posting_id)
                .bind(&row.city_raw)
                .bind(&row.city_cluster)
                .execute(&mut *tx)
                .await
                .context("staging city cluster row")?;
        }
        tx.commit().await.context("committing city cluster batch")?;
        Ok(())
    }

    async fn replace_skill_batch(&self, rows: &[SkillRow]) -> Result<()> {
        let table = self.staging_table(SKILLS_BATCH_TABLE);
        self.truncate(&table).await?;
        let query = format!("INSERT INTO {table} (posting_id, skill) VALUES ($1, $2)");
        let mut tx = self.pool.begin().await.context("starting transaction")?;
        for row in rows {
            sqlx::query(&query)
                .bind(&row.posting_id)
                .bind(&row.skill)
                .execute(&mut *tx)
                .await
                .context("staging skill row")?;
        }
        tx.commit().await.context("committing skill batch")?;
        Ok(())
    }

    async fn append_id_matches(&self, rows: &[IdMatch], matched_at: DateTime<Utc>) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (source_row_id, posting_id, is_source, matched_at)
             VALUES ($1, $2, $3, $4)",
            self.staging_table(ID_MATCHING_TABLE)
        );
        let mut tx = self.pool.begin().await.context("starting transaction")?;
        for row in rows {
            sqlx::query(&query)
                .bind(&row.source_row_id)
                .bind(&row.posting_id)
                .bind(row.is_source)
                .bind(matched_at)
                .execute(&mut *tx)
                .await
                .context("appending id match")?;
        }
        tx.commit().await.context("committing id matches")?;
        Ok(())
    }

    async fn merge_canonical_batch(&self, raise_duplicates_error: bool) -> Result<MergeOutcome> {
        let destination = self.analytical_table(JOBS_TABLE);
        let source = self.staging_table(JOBS_BATCH_TABLE);
        self.merge(&MergeSpec {
            destination: &destination,
            source: &source,
            key_columns: &["id"],
            insert_columns: &JOBS_FINAL_COLUMNS,
            update_columns: &JOBS_FINAL_COLUMNS,
            raise_duplicates_error,
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    raw_loads: Vec<(String, i32)>,
    raw_postings: Vec<RawPosting>,
    ledger: Vec<LedgerEntry>,
    jobs_batch: Vec<CanonicalPosting>,
    positions_batch: Vec<PositionRow>,
    city_clusters_batch: Vec<CityClusterRow>,
    skills_batch: Vec<SkillRow>,
    id_matches: Vec<(IdMatch, DateTime<Utc>)>,
    jobs: Vec<CanonicalPosting>,
}

/// Warehouse backed by plain vectors. Mirrors the Postgres implementation's
/// observable behavior so the pipeline can be exercised without a database.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger_entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().expect("warehouse lock").ledger.clone()
    }

    pub fn jobs(&self) -> Vec<CanonicalPosting> {
        self.state.lock().expect("warehouse lock").jobs.clone()
    }

    pub fn staged_jobs_batch(&self) -> Vec<CanonicalPosting> {
        self.state.lock().expect("warehouse lock").jobs_batch.clone()
    }

    pub fn staged_positions(&self) -> Vec<PositionRow> {
        self.state.lock().expect("warehouse lock").positions_batch.clone()
    }

    pub fn staged_city_clusters(&self) -> Vec<CityClusterRow> {
        self.state.lock().expect("warehouse lock").city_clusters_batch.clone()
    }

    pub fn staged_skills(&self) -> Vec<SkillRow> {
        self.state.lock().expect("warehouse lock").skills_batch.clone()
    }

    pub fn id_matches(&self) -> Vec<IdMatch> {
        self.state
            .lock()
            .expect("warehouse lock")
            .id_matches
            .iter()
            .map(|(row, _)| row.clone())
            .collect()
    }

    fn duplicate_job_ids(rows: &[CanonicalPosting]) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut duplicates = BTreeSet::new();
        for row in rows {
            if !seen.insert(row.id.as_str()) {
                duplicates.insert(row.id.clone());
            }
        }
        duplicates.into_iter().collect()
    }

    fn assert_no_duplicates(
        rows: &[CanonicalPosting],
        table: &str,
        raise_error: bool,
    ) -> Result<()> {
        let duplicates = Self::duplicate_job_ids(rows);
        if duplicates.is_empty() {
            return Ok(());
        }
        let error = MergeError::DuplicateKeys {
            table: table.to_string(),
            key_columns: vec!["id".to_string()],
            count: duplicates.len() as i64,
        };
        if raise_error {
            return Err(error.into());
        }
        warn!("{error}");
        Ok(())
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn register_load(&self, load_id: &str, _loaded_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().expect("warehouse lock");
        state.raw_loads.push((load_id.to_string(), 0));
        Ok(())
    }

    async fn append_raw_postings(&self, rows: &[RawPosting]) -> Result<()> {
        let mut state = self.state.lock().expect("warehouse lock");
        state.raw_postings.extend_from_slice(rows);
        Ok(())
    }

    async fn unprocessed_postings(
        &self,
        pipeline_name: &str,
        locale: &str,
    ) -> Result<Vec<RawPosting>> {
        let state = self.state.lock().expect("warehouse lock");
        let finished: BTreeSet<&str> = state
            .ledger
            .iter()
            .filter(|entry| entry.processed_by == pipeline_name && entry.finished_at.is_some())
            .map(|entry| entry.load_id.as_str())
            .collect();
        let eligible: BTreeSet<&str> = state
            .raw_loads
            .iter()
            .filter(|(load_id, status)| *status == 0 && !finished.contains(load_id.as_str()))
            .map(|(load_id, _)| load_id.as_str())
            .collect();
        let mut rows: Vec<RawPosting> = state
            .raw_postings
            .iter()
            .filter(|row| {
                eligible.contains(row.load_id.as_str()) && row.locale.as_deref() == Some(locale)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.load_id.as_str(), a.source_row_id.as_str())
                .cmp(&(b.load_id.as_str(), b.source_row_id.as_str()))
        });
        Ok(rows)
    }

    async fn append_ledger_entries(&self, entries: &[LedgerEntry]) -> Result<()> {
        let mut state = self.state.lock().expect("warehouse lock");
        state.ledger.extend_from_slice(entries);
        Ok(())
    }

    async fn replace_canonical_batch(&self, rows: &[CanonicalPosting]) -> Result<()> {
        let mut state = self.state.lock().expect("warehouse lock");
        state.jobs_batch = rows.to_vec();
        Ok(())
    }

    async fn replace_position_batch(&self, rows: &[PositionRow]) -> Result<()> {
        let mut state = self.state.lock().expect("warehouse lock");
        state.positions_batch = rows.to_vec();
        Ok(())
    }

    async fn replace_city_cluster_batch(&self, rows: &[CityClusterRow]) -> Result<()> {
        let mut state = self.state.lock().expect("warehouse lock");
        state.city_clusters_batch = rows.to_vec();
        Ok(())
    }

    async fn replace_skill_batch(&self, rows: &[SkillRow]) -> Result<()> {
        let mut state = self.state.lock().expect("warehouse lock");
        state.skills_batch = rows.to_vec();
        Ok(())
    }

    async fn append_id_matches(&self, rows: &[IdMatch], matched_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().expect("warehouse lock");
        state
            .id_matches
            .extend(rows.iter().map(|row| (row.clone(), matched_at)));
        Ok(())
    }

    async fn merge_canonical_batch(&self, raise_duplicates_error: bool) -> Result<MergeOutcome> {
        let mut state = self.state.lock().expect("warehouse lock");
        Self::assert_no_duplicates(&state.jobs_batch, JOBS_BATCH_TABLE, raise_duplicates_error)?;
        Self::assert_no_duplicates(&state.jobs, JOBS_TABLE, raise_duplicates_error)?;

        let mut outcome = MergeOutcome::default();
        let batch = state.jobs_batch.clone();
        for row in batch {
            match state.jobs.iter_mut().find(|job| job.id == row.id) {
                Some(existing) => {
                    *existing = row;
                    outcome.updated += 1;
                }
                None => {
                    state.jobs.push(row);
                    outcome.inserted += 1;
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn canonical(id: &str) -> CanonicalPosting {
        CanonicalPosting {
            id: id.to_string(),
            date_created: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            company: Some("Acme".into()),
            portal: Some("jobs.example".into()),
            url: None,
            years_of_experience: Some(2),
            description: Some("desc".into()),
            city_clusters: vec!["Berlin".into()],
            positions: vec!["Data Engineer".into()],
            skills: vec!["SQL".into()],
        }
    }

    fn raw(load_id: &str, source_row_id: &str) -> RawPosting {
        RawPosting {
            load_id: load_id.to_string(),
            source_row_id: source_row_id.to_string(),
            company: Some("Acme".into()),
            city: Some("Berlin".into()),
            title: Some("Data Engineer".into()),
            occupation: None,
            url: None,
            portal: None,
            experience_months: None,
            date_created: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            description: None,
            locale: Some("en_DE".into()),
        }
    }

    #[test]
    fn merge_statement_renders_both_clauses() {
        let statement = build_merge_statement(
            "jp.jobs",
            "jobs_postings.jobs_batch",
            &["id"],
            &["id", "company"],
            &["id", "company"],
        )
        .unwrap();
        assert!(statement.starts_with("MERGE INTO jp.jobs t\nUSING jobs_postings.jobs_batch s"));
        assert!(statement.contains("ON t.id = s.id"));
        // Key columns never appear in the update clause.
        assert!(statement.contains("UPDATE SET\n        t.company = s.company"));
        assert!(!statement.contains("t.id = s.id,"));
        assert!(statement.contains("WHEN NOT MATCHED THEN\n    INSERT"));
        assert!(statement.contains("s.company"));
    }

    #[test]
    fn merge_statement_omits_empty_clauses() {
        let insert_only =
            build_merge_statement("d", "s", &["id"], &["id", "company"], &[]).unwrap();
        assert!(!insert_only.contains("WHEN MATCHED"));
        assert!(insert_only.contains("WHEN NOT MATCHED"));

        let update_only = build_merge_statement("d", "s", &["id"], &[], &["company"]).unwrap();
        assert!(update_only.contains("WHEN MATCHED"));
        assert!(!update_only.contains("WHEN NOT MATCHED"));
    }

    #[test]
    fn merge_statement_requires_some_columns() {
        let err = build_merge_statement("d", "s", &["id"], &[], &[]).unwrap_err();
        assert!(matches!(err, MergeError::NoColumns));
    }

    #[tokio::test]
    async fn ledger_eligibility_filters_finished_loads() {
        let warehouse = MemoryWarehouse::new();
        let now = Utc::now();
        warehouse.register_load("load-1", now).await.unwrap();
        warehouse.register_load("load-2", now).await.unwrap();
        warehouse
            .append_raw_postings(&[raw("load-1", "a"), raw("load-2", "b")])
            .await
            .unwrap();

        // Started but unfinished: still eligible.
        warehouse
            .append_ledger_entries(&[LedgerEntry::start("load-1", "transform", now)])
            .await
            .unwrap();
        let rows = warehouse
            .unprocessed_postings("transform", "en_DE")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        // Finished: excluded from the next run.
        warehouse
            .append_ledger_entries(&[LedgerEntry::finish("load-1", "transform", now, now)])
            .await
            .unwrap();
        let rows = warehouse
            .unprocessed_postings("transform", "en_DE")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].load_id, "load-2");

        // A different pipeline name sees everything.
        let rows = warehouse
            .unprocessed_postings("other_pipeline", "en_DE")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn unprocessed_postings_filters_locale_and_orders_rows() {
        let warehouse = MemoryWarehouse::new();
        let now = Utc::now();
        warehouse.register_load("load-1", now).await.unwrap();
        let mut other_locale = raw("load-1", "c");
        other_locale.locale = Some("de_DE".into());
        warehouse
            .append_raw_postings(&[raw("load-1", "b"), other_locale, raw("load-1", "a")])
            .await
            .unwrap();

        let rows = warehouse
            .unprocessed_postings("transform", "en_DE")
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.source_row_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn memory_merge_upserts_by_id() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .replace_canonical_batch(&[canonical("fp-1"), canonical("fp-2")])
            .await
            .unwrap();
        let outcome = warehouse.merge_canonical_batch(true).await.unwrap();
        assert_eq!(outcome, MergeOutcome { inserted: 2, updated: 0 });

        let mut changed = canonical("fp-2");
        changed.company = Some("Globex".into());
        warehouse
            .replace_canonical_batch(&[changed, canonical("fp-3")])
            .await
            .unwrap();
        let outcome = warehouse.merge_canonical_batch(true).await.unwrap();
        assert_eq!(outcome, MergeOutcome { inserted: 1, updated: 1 });

        let jobs = warehouse.jobs();
        assert_eq!(jobs.len(), 3);
        let merged = jobs.iter().find(|job| job.id == "fp-2").unwrap();
        assert_eq!(merged.company.as_deref(), Some("Globex"));
    }

    #[tokio::test]
    async fn memory_merge_rejects_duplicate_source_keys() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .replace_canonical_batch(&[canonical("fp-1"), canonical("fp-1")])
            .await
            .unwrap();
        let err = warehouse.merge_canonical_batch(true).await.unwrap_err();
        assert!(err.to_string().contains("duplicated keys"));

        // Downgraded to a warning: the merge proceeds.
        let outcome = warehouse.merge_canonical_batch(false).await.unwrap();
        assert_eq!(outcome.inserted + outcome.updated, 2);
    }
}
