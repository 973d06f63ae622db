// =============================================================================
// TickerCache — date-keyed persisted selection results
// =============================================================================
//
// Grounded on `examples/original_source/common/cache/file_ticker_cache.py`:
// one JSON file per calendar date (`YYYY-MM-DD.json`, a flat array of
// symbols), save-of-empty-list is a no-op, load of a missing/disabled/
// unreadable/malformed file returns `None` (a corrupt entry is a miss, not a
// fatal error — only `save` surfaces I/O failures), and sweeping deletes
// every file whose date precedes today while skipping (not failing on)
// filenames that don't parse as dates. Persistence follows the crate's
// atomic tmp-then-rename convention.
// =============================================================================

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::types::Symbol;

/// Boundary the selection pipeline calls through for cache reads/writes.
pub trait TickerCache: Send + Sync {
    /// No-op if `symbols` is empty or the cache is disabled.
    fn save(&self, date: NaiveDate, symbols: &[Symbol]) -> Result<(), CacheError>;

    /// `None` if disabled, missing, unreadable, or the underlying file fails
    /// to parse — a corrupt cache entry is a miss, not a fatal error.
    fn load(&self, date: NaiveDate) -> Result<Option<Vec<Symbol>>, CacheError>;

    /// Delete every cache entry whose date is strictly before `today`.
    /// Entries whose filename doesn't parse as a date are skipped, not
    /// treated as an error.
    fn sweep(&self, today: NaiveDate) -> Result<(), CacheError>;
}

pub struct FileTickerCache {
    enabled: bool,
    cache_dir: PathBuf,
}

impl FileTickerCache {
    pub fn new(enabled: bool, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled,
            cache_dir: cache_dir.into(),
        }
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.cache_dir.join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    fn ensure_dir(&self) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.cache_dir).map_err(|source| CacheError::Write {
            date: "<mkdir>".to_string(),
            source,
        })
    }
}

impl TickerCache for FileTickerCache {
    fn save(&self, date: NaiveDate, symbols: &[Symbol]) -> Result<(), CacheError> {
        if !self.enabled {
            debug!("cache disabled, skipping save");
            return Ok(());
        }
        if symbols.is_empty() {
            return Ok(());
        }

        self.ensure_dir()?;
        let path = self.path_for(date);
        let date_str = date.to_string();

        let raw: Vec<&str> = symbols.iter().map(Symbol::as_str).collect();
        let content = serde_json::to_string_pretty(&raw).map_err(|source| CacheError::Malformed {
            date: date_str.clone(),
            source,
        })?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content).map_err(|source| CacheError::Write {
            date: date_str.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|source| CacheError::Write {
            date: date_str.clone(),
            source,
        })?;

        info!(count = symbols.len(), path = %path.display(), "cached tickers");
        Ok(())
    }

    fn load(&self, date: NaiveDate) -> Result<Option<Vec<Symbol>>, CacheError> {
        if !self.enabled {
            debug!("cache disabled, skipping load");
            return Ok(None);
        }

        let path = self.path_for(date);
        if !path.exists() {
            debug!(date = %date, "no cache entry found");
            return Ok(None);
        }

        // A read or parse failure here is a cache miss, not a fatal error —
        // spec §4.2: "load returns ∅ on any error other than 'present and
        // well-formed'". Only `save` surfaces I/O failures to its caller.
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(source) => {
                warn!(date = %date, error = %source, "failed to read cache entry, treating as a miss");
                return Ok(None);
            }
        };
        let raw: Vec<String> = match serde_json::from_str(&content) {
            Ok(raw) => raw,
            Err(source) => {
                warn!(date = %date, error = %source, "cache entry is not valid JSON, treating as a miss");
                return Ok(None);
            }
        };

        let symbols: Vec<Symbol> = raw.into_iter().map(Symbol::from).collect();
        info!(count = symbols.len(), date = %date, "loaded tickers from cache");
        Ok(Some(symbols))
    }

    fn sweep(&self, today: NaiveDate) -> Result<(), CacheError> {
        if !self.cache_dir.exists() {
            return Ok(());
        }

        let mut deleted = 0u32;
        let entries = std::fs::read_dir(&self.cache_dir).map_err(|source| CacheError::Read {
            date: "<sweep>".to_string(),
            source,
        })?;

        for entry in entries.flatten() {
            let path: PathBuf = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(s) => s,
                None => continue,
            };
            match NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
                Ok(file_date) if file_date < today => {
                    if std::fs::remove_file(&path).is_ok() {
                        deleted += 1;
                        debug!(path = %path.display(), "deleted old cache entry");
                    }
                }
                Ok(_) => {}
                Err(_) => {
                    warn!(path = %path.display(), "skipping cache file with unparseable date");
                }
            }
        }

        if deleted > 0 {
            info!(deleted, "swept old cache entries");
        }
        Ok(())
    }
}
