//! SQLite implementation of the hydrochain [`Store`].
//!
//! Every unit of work is one SQLite transaction: committing the scope
//! commits the transaction, dropping it rolls back. Enumerations are stored
//! as their serde names, timestamps as RFC 3339 text, and the derived id
//! lists (`Study::case_ids`, `Case::run_ids`) are read from the child tables
//! rather than stored.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE studies (id INTEGER PRIMARY KEY AUTOINCREMENT, name, base_path, state);
//! CREATE TABLE cases (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     study_id INTEGER NOT NULL REFERENCES studies (id) ON DELETE CASCADE,
//!     path, name, year, month, revision, program, state,
//!     UNIQUE (study_id, path)
//! );
//! CREATE TABLE runs (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     case_id INTEGER NOT NULL REFERENCES cases (id) ON DELETE CASCADE,
//!     job_id, name, working_dir, program, version, processors, executable,
//!     args, submitted, started, ended, state, end_reason
//! );
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use hydrochain_store_sqlite::SqliteStore;
//!
//! let store = SqliteStore::open("/data/pmo/hydrochain.db").await?;
//! let deps = Deps { store: Arc::new(store), ..deps };
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hydrochain::model::{Case, Run, Study};
use hydrochain::store::{Aggregate, Store, UnitOfWork};
use hydrochain::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::str::FromStr;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

fn backend(err: sqlx::Error) -> StoreError {
    if let Some(db) = err.as_database_error() {
        if db.is_unique_violation() || db.is_foreign_key_violation() {
            return StoreError::Constraint(db.message().to_string());
        }
    }
    StoreError::Backend(err.to_string())
}

/// Serde name of a unit enum variant, e.g. `CaseState::Done` → `"Done"`.
fn encode_enum<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Backend(format!("not a unit variant: {other}"))),
    }
}

fn decode_enum<T: DeserializeOwned>(name: String) -> Result<T, StoreError> {
    Ok(serde_json::from_value(serde_json::Value::String(name))?)
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(column).map_err(backend)
}

fn get_u32(row: &SqliteRow, column: &str) -> Result<u32, StoreError> {
    let raw: i64 = get(row, column)?;
    u32::try_from(raw).map_err(|_| StoreError::Backend(format!("{column} out of range: {raw}")))
}

// ============================================================================
// Table mapping
// ============================================================================

#[async_trait]
trait Table: Aggregate + Sized {
    const TABLE: &'static str;
    /// Foreign key column, if any.
    const PARENT: Option<&'static str>;
    /// Tie-break order for listings.
    const ORDER: &'static str;

    async fn insert(conn: &mut SqliteConnection, record: &Self) -> Result<i64, StoreError>;

    /// Returns the number of rows touched.
    async fn replace(conn: &mut SqliteConnection, record: &Self) -> Result<u64, StoreError>;

    fn from_row(row: &SqliteRow) -> Result<Self, StoreError>;

    /// Fills fields derived from child tables.
    async fn hydrate(conn: &mut SqliteConnection, record: &mut Self) -> Result<(), StoreError>;
}

async fn child_ids(
    conn: &mut SqliteConnection,
    sql: &str,
    parent: i64,
) -> Result<Vec<i64>, StoreError> {
    let rows = sqlx::query(sql)
        .bind(parent)
        .fetch_all(conn)
        .await
        .map_err(backend)?;
    rows.iter().map(|r| get(r, "id")).collect()
}

#[async_trait]
impl Table for Study {
    const TABLE: &'static str = "studies";
    const PARENT: Option<&'static str> = None;
    const ORDER: &'static str = "id";

    async fn insert(conn: &mut SqliteConnection, record: &Self) -> Result<i64, StoreError> {
        let result = sqlx::query("INSERT INTO studies (name, base_path, state) VALUES (?, ?, ?)")
            .bind(&record.name)
            .bind(path_text(&record.base_path))
            .bind(encode_enum(&record.state)?)
            .execute(conn)
            .await
            .map_err(backend)?;
        Ok(result.last_insert_rowid())
    }

    async fn replace(conn: &mut SqliteConnection, record: &Self) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE studies SET name = ?, base_path = ?, state = ? WHERE id = ?")
            .bind(&record.name)
            .bind(path_text(&record.base_path))
            .bind(encode_enum(&record.state)?)
            .bind(record.id)
            .execute(conn)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    fn from_row(row: &SqliteRow) -> Result<Self, StoreError> {
        Ok(Study {
            id: get(row, "id")?,
            name: get(row, "name")?,
            base_path: PathBuf::from(get::<String>(row, "base_path")?),
            state: decode_enum(get(row, "state")?)?,
            case_ids: Vec::new(),
        })
    }

    async fn hydrate(conn: &mut SqliteConnection, record: &mut Self) -> Result<(), StoreError> {
        record.case_ids = child_ids(
            conn,
            "SELECT id FROM cases WHERE study_id = ? ORDER BY year, month, revision, id",
            record.id,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Table for Case {
    const TABLE: &'static str = "cases";
    const PARENT: Option<&'static str> = Some("study_id");
    const ORDER: &'static str = "year, month, revision, id";

    async fn insert(conn: &mut SqliteConnection, record: &Self) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO cases (study_id, path, name, year, month, revision, program, state)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.study_id)
        .bind(path_text(&record.path))
        .bind(&record.name)
        .bind(record.year)
        .bind(i64::from(record.month))
        .bind(i64::from(record.revision))
        .bind(encode_enum(&record.program)?)
        .bind(encode_enum(&record.state)?)
        .execute(conn)
        .await
        .map_err(backend)?;
        Ok(result.last_insert_rowid())
    }

    async fn replace(conn: &mut SqliteConnection, record: &Self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cases
            SET study_id = ?, path = ?, name = ?, year = ?, month = ?, revision = ?,
                program = ?, state = ?
            WHERE id = ?
            "#,
        )
        .bind(record.study_id)
        .bind(path_text(&record.path))
        .bind(&record.name)
        .bind(record.year)
        .bind(i64::from(record.month))
        .bind(i64::from(record.revision))
        .bind(encode_enum(&record.program)?)
        .bind(encode_enum(&record.state)?)
        .bind(record.id)
        .execute(conn)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected())
    }

    fn from_row(row: &SqliteRow) -> Result<Self, StoreError> {
        Ok(Case {
            id: get(row, "id")?,
            study_id: get(row, "study_id")?,
            path: PathBuf::from(get::<String>(row, "path")?),
            name: get(row, "name")?,
            year: get(row, "year")?,
            month: get_u32(row, "month")?,
            revision: get_u32(row, "revision")?,
            program: decode_enum(get(row, "program")?)?,
            state: decode_enum(get(row, "state")?)?,
            run_ids: Vec::new(),
        })
    }

    async fn hydrate(conn: &mut SqliteConnection, record: &mut Self) -> Result<(), StoreError> {
        record.run_ids =
            child_ids(conn, "SELECT id FROM runs WHERE case_id = ? ORDER BY id", record.id).await?;
        Ok(())
    }
}

#[async_trait]
impl Table for Run {
    const TABLE: &'static str = "runs";
    const PARENT: Option<&'static str> = Some("case_id");
    const ORDER: &'static str = "id";

    async fn insert(conn: &mut SqliteConnection, record: &Self) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs (case_id, job_id, name, working_dir, program, version, processors,
                              executable, args, submitted, started, ended, state, end_reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.case_id)
        .bind(record.job_id.as_deref())
        .bind(&record.name)
        .bind(path_text(&record.working_dir))
        .bind(encode_enum(&record.program)?)
        .bind(&record.version)
        .bind(i64::from(record.processors))
        .bind(path_text(&record.executable))
        .bind(serde_json::to_string(&record.args)?)
        .bind(record.submitted)
        .bind(record.started)
        .bind(record.ended)
        .bind(encode_enum(&record.state)?)
        .bind(record.end_reason.as_deref())
        .execute(conn)
        .await
        .map_err(backend)?;
        Ok(result.last_insert_rowid())
    }

    async fn replace(conn: &mut SqliteConnection, record: &Self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET case_id = ?, job_id = ?, name = ?, working_dir = ?, program = ?, version = ?,
                processors = ?, executable = ?, args = ?, submitted = ?, started = ?,
                ended = ?, state = ?, end_reason = ?
            WHERE id = ?
            "#,
        )
        .bind(record.case_id)
        .bind(record.job_id.as_deref())
        .bind(&record.name)
        .bind(path_text(&record.working_dir))
        .bind(encode_enum(&record.program)?)
        .bind(&record.version)
        .bind(i64::from(record.processors))
        .bind(path_text(&record.executable))
        .bind(serde_json::to_string(&record.args)?)
        .bind(record.submitted)
        .bind(record.started)
        .bind(record.ended)
        .bind(encode_enum(&record.state)?)
        .bind(record.end_reason.as_deref())
        .bind(record.id)
        .execute(conn)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected())
    }

    fn from_row(row: &SqliteRow) -> Result<Self, StoreError> {
        let args: String = get(row, "args")?;
        Ok(Run {
            id: get(row, "id")?,
            case_id: get(row, "case_id")?,
            job_id: get(row, "job_id")?,
            name: get(row, "name")?,
            working_dir: PathBuf::from(get::<String>(row, "working_dir")?),
            program: decode_enum(get(row, "program")?)?,
            version: get(row, "version")?,
            processors: get_u32(row, "processors")?,
            executable: PathBuf::from(get::<String>(row, "executable")?),
            args: serde_json::from_str(&args)?,
            submitted: get::<DateTime<Utc>>(row, "submitted")?,
            started: get(row, "started")?,
            ended: get(row, "ended")?,
            state: decode_enum(get(row, "state")?)?,
            end_reason: get(row, "end_reason")?,
        })
    }

    async fn hydrate(_conn: &mut SqliteConnection, _record: &mut Self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ============================================================================
// Unit of work
// ============================================================================

/// One SQLite transaction scoped to one aggregate family.
pub struct SqliteScope<T> {
    tx: Transaction<'static, Sqlite>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Table> SqliteScope<T> {
    async fn fetch(&mut self, sql: &str, bind: Option<i64>) -> Result<Vec<T>, StoreError> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&mut *self.tx).await.map_err(backend)?;
        let mut records = rows.iter().map(T::from_row).collect::<Result<Vec<_>, _>>()?;
        for record in &mut records {
            T::hydrate(&mut self.tx, record).await?;
        }
        Ok(records)
    }
}

#[async_trait]
impl<T: Table> UnitOfWork<T> for SqliteScope<T> {
    async fn create(&mut self, mut record: T) -> Result<T, StoreError> {
        let id = T::insert(&mut self.tx, &record).await?;
        record.set_id(id);
        T::hydrate(&mut self.tx, &mut record).await?;
        Ok(record)
    }

    async fn read(&mut self, id: i64) -> Result<Option<T>, StoreError> {
        let sql = format!("SELECT * FROM {} WHERE id = ?", T::TABLE);
        Ok(self.fetch(&sql, Some(id)).await?.into_iter().next())
    }

    async fn update(&mut self, record: &T) -> Result<(), StoreError> {
        if T::replace(&mut self.tx, record).await? == 0 {
            return Err(StoreError::NotFound {
                kind: T::KIND,
                id: record.id(),
            });
        }
        Ok(())
    }

    async fn delete(&mut self, id: i64) -> Result<bool, StoreError> {
        let sql = format!("DELETE FROM {} WHERE id = ?", T::TABLE);
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&mut self) -> Result<Vec<T>, StoreError> {
        let sql = format!("SELECT * FROM {} ORDER BY {}", T::TABLE, T::ORDER);
        self.fetch(&sql, None).await
    }

    async fn list_by_parent(&mut self, parent_id: i64) -> Result<Vec<T>, StoreError> {
        let Some(column) = T::PARENT else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT * FROM {} WHERE {column} = ? ORDER BY {}",
            T::TABLE,
            T::ORDER
        );
        self.fetch(&sql, Some(parent_id)).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(backend)
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating when missing) the database file and applies the
    /// schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(backend)?;
        tracing::debug!(path = %path.as_ref().display(), "sqlite state database opened");
        Self::with_pool(pool).await
    }

    /// Private in-memory database, mostly for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(backend)?
            .foreign_keys(true);
        // One connection that never expires: every connection to
        // `:memory:` is a different database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(backend)?;
        Self::with_pool(pool).await
    }

    /// Applies the schema on an existing pool.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn scope<T: Table>(&self) -> Result<Box<dyn UnitOfWork<T>>, StoreError> {
        let tx = self.pool.begin().await.map_err(backend)?;
        Ok(Box::new(SqliteScope::<T> {
            tx,
            _kind: PhantomData,
        }))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn studies(&self) -> Result<Box<dyn UnitOfWork<Study>>, StoreError> {
        self.scope::<Study>().await
    }

    async fn cases(&self) -> Result<Box<dyn UnitOfWork<Case>>, StoreError> {
        self.scope::<Case>().await
    }

    async fn runs(&self) -> Result<Box<dyn UnitOfWork<Run>>, StoreError> {
        self.scope::<Run>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrochain::model::{CaseState, Program, RunState, StudyState};
    use hydrochain::store::{delete_study, StoreExt};

    async fn seeded() -> (SqliteStore, Study) {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut uow = store.studies().await.unwrap();
        let study = uow.create(Study::new("pmo", "/data/pmo")).await.unwrap();
        uow.commit().await.unwrap();
        (store, study)
    }

    fn case(study_id: i64, path: &str, month: u32, revision: u32) -> Case {
        Case {
            id: 0,
            study_id,
            path: PathBuf::from(path),
            name: format!("decomp_2020_{month:02}_rv{revision}"),
            year: 2020,
            month,
            revision,
            program: Program::ShortHorizon,
            state: CaseState::NotStarted,
            run_ids: vec![],
        }
    }

    fn run(case_id: i64) -> Run {
        Run {
            id: 0,
            case_id,
            job_id: None,
            name: "decomp_2020_01_rv1".into(),
            working_dir: PathBuf::from("/data/pmo/2020_01_rv1/decomp"),
            program: Program::ShortHorizon,
            version: "31.0.2".into(),
            processors: 72,
            executable: PathBuf::from("/opt/decomp/bin/decomp"),
            args: vec!["31.0.2".into()],
            submitted: Utc::now(),
            started: None,
            ended: None,
            state: RunState::NotStarted,
            end_reason: None,
        }
    }

    #[tokio::test]
    async fn test_study_round_trip() {
        let (store, study) = seeded().await;
        let mut loaded = store.load_study(study.id).await.unwrap();
        assert_eq!(loaded, study);

        loaded.state = StudyState::Executing;
        store.save_study(&loaded).await.unwrap();
        assert_eq!(store.load_study(study.id).await.unwrap().state, StudyState::Executing);
    }

    #[tokio::test]
    async fn test_rollback_on_drop() {
        let (store, study) = seeded().await;
        {
            let mut uow = store.cases().await.unwrap();
            uow.create(case(study.id, "2020_01_rv1/decomp", 1, 1)).await.unwrap();
        }
        assert!(store.cases_of(study.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_derived_id_lists_follow_children() {
        let (store, study) = seeded().await;

        let mut uow = store.cases().await.unwrap();
        let later = uow.create(case(study.id, "2020_02_rv1/decomp", 2, 1)).await.unwrap();
        let earlier = uow.create(case(study.id, "2020_01_rv1/decomp", 1, 1)).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.runs().await.unwrap();
        let first = uow.create(run(earlier.id)).await.unwrap();
        let second = uow.create(run(earlier.id)).await.unwrap();
        uow.commit().await.unwrap();

        let study = store.load_study(study.id).await.unwrap();
        assert_eq!(study.case_ids, vec![earlier.id, later.id]);

        let earlier = store.load_case(earlier.id).await.unwrap();
        assert_eq!(earlier.run_ids, vec![first.id, second.id]);
        assert_eq!(earlier.flex_count(), 1);
    }

    #[tokio::test]
    async fn test_run_fields_survive_storage() {
        let (store, study) = seeded().await;
        let mut uow = store.cases().await.unwrap();
        let c = uow.create(case(study.id, "2020_01_rv1/decomp", 1, 1)).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.runs().await.unwrap();
        let mut r = uow.create(run(c.id)).await.unwrap();
        uow.commit().await.unwrap();

        let now = Utc::now();
        r.job_id = Some("4711".into());
        r.enter(RunState::Running, now);
        r.close("scheduler reported an error state", now);
        store.save_run(&r).await.unwrap();

        let loaded = store.load_run(r.id).await.unwrap();
        assert_eq!(loaded.job_id.as_deref(), Some("4711"));
        assert_eq!(loaded.state, RunState::Error);
        assert_eq!(loaded.args, r.args);
        assert_eq!(loaded.end_reason, r.end_reason);
        assert_eq!(loaded.started.map(|t| t.timestamp_micros()), Some(now.timestamp_micros()));
        assert!(loaded.ended.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_case_path_is_a_constraint_error() {
        let (store, study) = seeded().await;
        let mut uow = store.cases().await.unwrap();
        uow.create(case(study.id, "2020_01_rv1/decomp", 1, 1)).await.unwrap();
        let err = uow
            .create(case(study.id, "2020_01_rv1/decomp", 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        let (store, study) = seeded().await;
        let mut uow = store.cases().await.unwrap();
        let c = uow.create(case(study.id, "2020_01_rv1/decomp", 1, 1)).await.unwrap();
        uow.commit().await.unwrap();
        let mut uow = store.runs().await.unwrap();
        let r = uow.create(run(c.id)).await.unwrap();
        uow.commit().await.unwrap();

        assert!(delete_study(&store, study.id).await.unwrap());
        assert!(store.runs().await.unwrap().read(r.id).await.unwrap().is_none());
        assert!(!delete_study(&store, study.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_database_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hydrochain.db");
        let id = {
            let store = SqliteStore::open(&path).await.unwrap();
            let mut uow = store.studies().await.unwrap();
            let study = uow.create(Study::new("pmo", dir.path())).await.unwrap();
            uow.commit().await.unwrap();
            store.pool().close().await;
            study.id
        };
        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(store.load_study(id).await.unwrap().name, "pmo");
    }
}
