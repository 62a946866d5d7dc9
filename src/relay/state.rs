// ABOUTME: Watermark store for change relay - tracks the last sent version per table
// ABOUTME: Persists high-water marks atomically so a restart resumes where it stopped

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Table name -> last synchronized version. This is also the on-disk format.
pub type Watermarks = BTreeMap<String, u64>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WatermarkError {
    #[error("watermark for {table} cannot move backwards from {current} to {requested}")]
    Regression {
        table: String,
        current: u64,
        requested: u64,
    },
}

/// Durable surface the watermark store loads from and saves to.
#[async_trait]
pub trait WatermarkPersistence: Send + Sync {
    /// Load all watermarks. A surface that was never written loads as empty.
    async fn load(&self) -> Result<Watermarks>;

    /// Replace the persisted watermarks. Must be all-or-nothing.
    async fn save(&self, watermarks: &Watermarks) -> Result<()>;
}

/// Watermarks stored as a JSON object in a single file.
///
/// Saves write a temp file next to the destination, fsync it and rename it
/// over the old file, so a crash leaves either the old or the new content.
#[derive(Debug, Clone)]
pub struct JsonFileWatermarks {
    path: PathBuf,
}

impl JsonFileWatermarks {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the default state file path for the current directory
    pub fn default_path() -> PathBuf {
        PathBuf::from(".change-relay/watermarks.json")
    }
}

#[async_trait]
impl WatermarkPersistence for JsonFileWatermarks {
    async fn load(&self) -> Result<Watermarks> {
        let exists = tokio::fs::try_exists(&self.path)
            .await
            .with_context(|| format!("Failed to check watermark file {:?}", self.path))?;
        if !exists {
            tracing::info!(
                "No watermark file at {:?}; all tables start at 0",
                self.path
            );
            return Ok(Watermarks::new());
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read watermarks from {:?}", self.path))?;
        let watermarks: Watermarks = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse watermarks from {:?}", self.path))?;
        Ok(watermarks)
    }

    async fn save(&self, watermarks: &Watermarks) -> Result<()> {
        let contents =
            serde_json::to_vec_pretty(watermarks).context("Failed to serialize watermarks")?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomically(&path, &contents))
            .await
            .context("Watermark save task failed")?
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)
        .with_context(|| format!("Failed to create directory {:?}", parent))?;

    let mut temp = tempfile::NamedTempFile::new_in(&parent)
        .with_context(|| format!("Failed to create temp file in {:?}", parent))?;
    temp.write_all(contents)
        .context("Failed to write watermark temp file")?;
    temp.as_file()
        .sync_all()
        .context("Failed to sync watermark temp file")?;
    temp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to write watermarks to {:?}", path))?;
    Ok(())
}

/// In-process persistence, mainly for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryWatermarks {
    saved: Mutex<Watermarks>,
    saves: Mutex<u64>,
}

impl MemoryWatermarks {
    pub fn with_watermarks(watermarks: Watermarks) -> Self {
        Self {
            saved: Mutex::new(watermarks),
            saves: Mutex::new(0),
        }
    }

    /// What was last saved.
    pub fn saved(&self) -> Watermarks {
        self.saved.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn save_count(&self) -> u64 {
        self.saves.lock().map(|n| *n).unwrap_or_default()
    }
}

#[async_trait]
impl WatermarkPersistence for MemoryWatermarks {
    async fn load(&self) -> Result<Watermarks> {
        Ok(self.saved())
    }

    async fn save(&self, watermarks: &Watermarks) -> Result<()> {
        let mut saved = self
            .saved
            .lock()
            .map_err(|_| anyhow::anyhow!("watermark mutex poisoned"))?;
        *saved = watermarks.clone();
        if let Ok(mut saves) = self.saves.lock() {
            *saves += 1;
        }
        Ok(())
    }
}

/// Per-table watermarks with monotonic updates and explicit flushing.
///
/// The store has a single writer: the sync daemon owns it and mutates it
/// through `&mut self`. Updates stay in memory until [`flush`](Self::flush).
pub struct WatermarkStore {
    persistence: Box<dyn WatermarkPersistence>,
    watermarks: Watermarks,
    dirty: bool,
}

impl WatermarkStore {
    /// Load the persisted watermarks. A missing surface starts every table at 0;
    /// an unreadable one is an error rather than a silent reset.
    pub async fn open(persistence: Box<dyn WatermarkPersistence>) -> Result<Self> {
        let watermarks = persistence
            .load()
            .await
            .context("Failed to load watermarks")?;
        tracing::info!("Loaded watermarks for {} tables", watermarks.len());
        Ok(Self {
            persistence,
            watermarks,
            dirty: false,
        })
    }

    /// Last synchronized version for `table`, 0 if the table was never synced.
    pub fn get(&self, table: &str) -> u64 {
        self.watermarks.get(table).copied().unwrap_or(0)
    }

    /// Advance the watermark for `table`. Setting the current value again is a
    /// no-op; a lower value is rejected.
    pub fn set(&mut self, table: &str, watermark: u64) -> Result<(), WatermarkError> {
        let current = self.get(table);
        if watermark < current {
            return Err(WatermarkError::Regression {
                table: table.to_string(),
                current,
                requested: watermark,
            });
        }
        if watermark == current && self.watermarks.contains_key(table) {
            return Ok(());
        }
        self.watermarks.insert(table.to_string(), watermark);
        self.dirty = true;
        Ok(())
    }

    /// Persist all current values if anything changed since the last flush.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.persistence
            .save(&self.watermarks)
            .await
            .context("Failed to persist watermarks")?;
        self.dirty = false;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn snapshot(&self) -> &Watermarks {
        &self.watermarks
    }
}
