use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Detection,
    Ocr,
    Reorder,
    Translate,
    Update,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Detection,
        Stage::Ocr,
        Stage::Reorder,
        Stage::Translate,
        Stage::Update,
    ];

    pub fn number(self) -> u8 {
        match self {
            Stage::Detection => 1,
            Stage::Ocr => 2,
            Stage::Reorder => 3,
            Stage::Translate => 4,
            Stage::Update => 5,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Detection => "detection",
            Stage::Ocr => "ocr",
            Stage::Reorder => "reorder",
            Stage::Translate => "translate",
            Stage::Update => "update",
        }
    }

    pub fn from_number(number: u8) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| stage.number() == number)
    }

    /// `stage3_reorder`
    pub fn key(self) -> String {
        format!("stage{}_{}", self.number(), self.label())
    }

    fn file_suffix(self) -> String {
        format!("_{}.json", self.key())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheFileInfo {
    pub name: String,
    pub size: u64,
    pub modified: String,
}

/// Per-image, per-stage JSON results under one directory.
///
/// Reads never fail: a missing or unreadable entry is a cache miss.
#[derive(Debug, Clone)]
pub struct StageCache {
    dir: PathBuf,
}

impl StageCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create results dir: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, stage: Stage, image_name: &str) -> PathBuf {
        self.path_for_stem(stage, &image_stem(image_name))
    }

    fn path_for_stem(&self, stage: Stage, stem: &str) -> PathBuf {
        self.dir.join(format!("{}{}", stem, stage.file_suffix()))
    }

    pub fn load<T: DeserializeOwned>(&self, stage: Stage, image_name: &str) -> Option<T> {
        let path = self.path_for(stage, image_name);
        if !path.exists() {
            return None;
        }
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                warn!("failed to read stage cache {}: {}", path.display(), err);
                return None;
            }
        };
        match serde_json::from_str::<T>(&content) {
            Ok(value) => {
                debug!("loaded {} for {}", stage.key(), image_name);
                Some(value)
            }
            Err(err) => {
                warn!("ignoring corrupt stage cache {}: {}", path.display(), err);
                None
            }
        }
    }

    /// Overwrites the entry with `data` plus `timestamp` and `stage` fields.
    pub fn save<T: Serialize>(&self, stage: Stage, image_name: &str, data: &T) -> Result<PathBuf> {
        let path = self.path_for(stage, image_name);
        let mut object = match serde_json::to_value(data)
            .with_context(|| format!("failed to serialize {}", stage.key()))?
        {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        object.insert("timestamp".to_string(), Value::from(storage::now_rfc3339()));
        object.insert("stage".to_string(), Value::from(stage.number()));
        storage::write_json_atomic(&path, &Value::Object(object))?;
        debug!("saved {} for {} to {}", stage.key(), image_name, path.display());
        Ok(path)
    }

    pub fn exists(&self, stage: Stage, image_name: &str) -> bool {
        self.path_for(stage, image_name).exists()
    }

    /// True when no entry remains afterwards, including when there was none.
    pub fn clear(&self, stage: Stage, image_name: &str) -> bool {
        remove_entry(&self.path_for(stage, image_name)).is_some()
    }

    /// Returns the number of files actually deleted.
    pub fn clear_all(&self, image_name: &str) -> usize {
        self.clear_stem(&image_stem(image_name))
    }

    fn clear_stem(&self, stem: &str) -> usize {
        Stage::ALL
            .into_iter()
            .filter(|stage| remove_entry(&self.path_for_stem(*stage, stem)) == Some(true))
            .count()
    }

    /// Clears every image that has at least one entry. Returns files deleted.
    pub fn clear_everything(&self) -> usize {
        self.cached_stems()
            .iter()
            .map(|stem| self.clear_stem(stem))
            .sum()
    }

    pub fn progress(&self, image_name: &str) -> BTreeMap<String, bool> {
        Stage::ALL
            .into_iter()
            .map(|stage| (stage.key(), self.exists(stage, image_name)))
            .collect()
    }

    pub fn list(&self, image_name: Option<&str>) -> Vec<CacheFileInfo> {
        let prefix = image_name.map(image_stem);
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = split_cache_file_name(&name) else {
                continue;
            };
            if let Some(prefix) = prefix.as_deref()
                && stem != prefix
            {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let modified = metadata
                .modified()
                .map(storage::system_time_rfc3339)
                .unwrap_or_else(|_| "unknown".to_string());
            files.push(CacheFileInfo {
                name,
                size: metadata.len(),
                modified,
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }

    /// Image stems that own at least one cache file, each listed once.
    pub fn cached_stems(&self) -> BTreeSet<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return BTreeSet::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                split_cache_file_name(&name).map(str::to_string)
            })
            .collect()
    }
}

pub(crate) fn image_stem(image_name: &str) -> String {
    Path::new(image_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| image_name.to_string())
}

/// Strips a known `_stage{N}_{label}.json` suffix and returns the image stem.
fn split_cache_file_name(name: &str) -> Option<&str> {
    Stage::ALL.into_iter().find_map(|stage| {
        name.strip_suffix(stage.file_suffix().as_str())
            .filter(|stem| !stem.is_empty())
    })
}

/// `Some(true)` deleted, `Some(false)` already absent, `None` still present.
fn remove_entry(path: &Path) -> Option<bool> {
    match fs::remove_file(path) {
        Ok(()) => Some(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Some(false),
        Err(err) => {
            warn!("failed to delete stage cache {}: {}", path.display(), err);
            None
        }
    }
}
