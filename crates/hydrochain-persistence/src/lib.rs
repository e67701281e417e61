//! JSON document backend for the hydrochain [`Store`].
//!
//! Three documents live under the study base path, one per aggregate family:
//!
//! ```text
//! <base>/studies.json   [Study, ...]
//! <base>/cases.json     [Case, ...]
//! <base>/runs.json      [Run, ...]
//! ```
//!
//! Each document is an array of records. A unit of work holds the document's
//! lock for its whole lifetime, works on an in-memory copy and writes the
//! copy back on commit through a temporary file and a rename, so a crash
//! leaves either the old or the new document on disk.

use async_trait::async_trait;
use hydrochain::model::{Case, Run, Study};
use hydrochain::store::{Aggregate, Store, UnitOfWork};
use hydrochain::{StoreError, SyncFormat};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub const STUDIES_FILE: &str = "studies.json";
pub const CASES_FILE: &str = "cases.json";
pub const RUNS_FILE: &str = "runs.json";

/// One JSON document guarded by a writer lock.
struct Document {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl Document {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn open<T: Aggregate>(&self, format: SyncFormat) -> Result<DocumentScope<T>, StoreError> {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        let records = read_records(&self.path, format).await?;
        Ok(DocumentScope {
            path: self.path.clone(),
            format,
            records,
            dirty: false,
            _guard: guard,
            _kind: PhantomData,
        })
    }
}

/// A missing document is created empty.
async fn read_records<T: Aggregate>(path: &Path, format: SyncFormat) -> Result<Vec<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            write_records::<T>(path, &[], format).await?;
            tracing::debug!(path = %path.display(), "empty document created");
            Ok(Vec::new())
        }
        Err(err) => Err(err.into()),
    }
}

async fn write_records<T: Aggregate>(
    path: &Path,
    records: &[T],
    format: SyncFormat,
) -> Result<(), StoreError> {
    let bytes = match format {
        SyncFormat::Pretty => serde_json::to_vec_pretty(records)?,
        SyncFormat::Compact => serde_json::to_vec(records)?,
    };
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Unit of work over one document.
pub struct DocumentScope<T> {
    path: PathBuf,
    format: SyncFormat,
    records: Vec<T>,
    dirty: bool,
    _guard: OwnedMutexGuard<()>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Aggregate> DocumentScope<T> {
    fn position(&self, id: i64) -> Option<usize> {
        self.records.iter().position(|r| r.id() == id)
    }

    fn next_id(&self) -> i64 {
        self.records.iter().map(Aggregate::id).max().unwrap_or(0) + 1
    }

    fn check_unique(&self, record: &T) -> Result<(), StoreError> {
        match self
            .records
            .iter()
            .find(|r| r.id() != record.id() && record.conflicts_with(r))
        {
            Some(existing) => Err(StoreError::Constraint(format!(
                "{} clashes with {} {}",
                T::KIND,
                T::KIND,
                existing.id()
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<T: Aggregate> UnitOfWork<T> for DocumentScope<T> {
    async fn create(&mut self, mut record: T) -> Result<T, StoreError> {
        record.set_id(self.next_id());
        self.check_unique(&record)?;
        self.records.push(record.clone());
        self.dirty = true;
        Ok(record)
    }

    async fn read(&mut self, id: i64) -> Result<Option<T>, StoreError> {
        Ok(self.position(id).map(|i| self.records[i].clone()))
    }

    async fn update(&mut self, record: &T) -> Result<(), StoreError> {
        let index = self.position(record.id()).ok_or(StoreError::NotFound {
            kind: T::KIND,
            id: record.id(),
        })?;
        self.check_unique(record)?;
        self.records[index] = record.clone();
        self.dirty = true;
        Ok(())
    }

    async fn delete(&mut self, id: i64) -> Result<bool, StoreError> {
        match self.position(id) {
            Some(index) => {
                self.records.remove(index);
                self.dirty = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&mut self) -> Result<Vec<T>, StoreError> {
        Ok(self.records.clone())
    }

    async fn list_by_parent(&mut self, parent_id: i64) -> Result<Vec<T>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.parent_id() == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        write_records(&self.path, &self.records, self.format).await?;
        tracing::trace!(path = %self.path.display(), records = self.records.len(), "document written");
        Ok(())
    }
}

/// File-backed [`Store`] rooted at a study base path.
pub struct JsonFileStore {
    root: PathBuf,
    format: SyncFormat,
    studies: Document,
    cases: Document,
    runs: Document,
}

impl JsonFileStore {
    /// Opens (or lazily creates) the documents under `root`.
    pub async fn open(root: impl Into<PathBuf>, format: SyncFormat) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            studies: Document::new(root.join(STUDIES_FILE)),
            cases: Document::new(root.join(CASES_FILE)),
            runs: Document::new(root.join(RUNS_FILE)),
            root,
            format,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cases_path(&self) -> &Path {
        &self.cases.path
    }

    pub fn runs_path(&self) -> &Path {
        &self.runs.path
    }

    pub fn studies_path(&self) -> &Path {
        &self.studies.path
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn studies(&self) -> Result<Box<dyn UnitOfWork<Study>>, StoreError> {
        Ok(Box::new(self.studies.open::<Study>(self.format).await?))
    }

    async fn cases(&self) -> Result<Box<dyn UnitOfWork<Case>>, StoreError> {
        Ok(Box::new(self.cases.open::<Case>(self.format).await?))
    }

    async fn runs(&self) -> Result<Box<dyn UnitOfWork<Run>>, StoreError> {
        Ok(Box::new(self.runs.open::<Run>(self.format).await?))
    }
}
