use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

use crate::storage;

pub const STORE_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminologyMetadata {
    pub created_at: String,
    pub updated_at: String,
    pub version: String,
    pub total_terms: usize,
}

impl TerminologyMetadata {
    fn fresh() -> Self {
        let now = storage::now_rfc3339();
        Self {
            created_at: now.clone(),
            updated_at: now,
            version: STORE_VERSION.to_string(),
            total_terms: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TerminologyDocument {
    #[serde(default)]
    ja_to_zh: BTreeMap<String, String>,
    metadata: Option<TerminologyMetadata>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TerminologyStatistics {
    pub total_terms: usize,
    pub created_at: String,
    pub updated_at: String,
    pub version: String,
    pub file_path: String,
    pub file_exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Txt,
}

impl ExportFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        ext.parse().ok()
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "txt" | "tsv" => Ok(ExportFormat::Txt),
            other => Err(anyhow!("unsupported terminology format: {}", other)),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Txt => "txt",
        };
        f.write_str(name)
    }
}

/// Glossary of source term to target term shared by every image in a run.
///
/// The first mapping recorded for a source term is kept; later conflicting
/// targets are reported and dropped. Persistence failures are logged and the
/// in-memory store stays usable.
#[derive(Debug, Clone)]
pub struct TerminologyStore {
    path: PathBuf,
    terms: BTreeMap<String, String>,
    metadata: TerminologyMetadata,
}

impl TerminologyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            terms: BTreeMap::new(),
            metadata: TerminologyMetadata::fresh(),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        let mut store = Self::new(path);
        store.load();
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the backing file. A missing file starts a fresh store; an
    /// unreadable one does too, and returns false.
    pub fn load(&mut self) -> bool {
        if !self.path.exists() {
            self.reset();
            info!("starting new terminology store at {}", self.path.display());
            return true;
        }
        match read_document(&self.path) {
            Ok(document) => {
                self.terms = document.ja_to_zh;
                self.metadata = document.metadata.unwrap_or_else(TerminologyMetadata::fresh);
                info!("loaded {} terminology entries", self.terms.len());
                true
            }
            Err(err) => {
                warn!("failed to load terminology store: {:#}", err);
                self.reset();
                false
            }
        }
    }

    fn reset(&mut self) {
        self.terms.clear();
        self.metadata = TerminologyMetadata::fresh();
    }

    pub fn save(&mut self) -> bool {
        self.metadata.updated_at = storage::now_rfc3339();
        self.metadata.total_terms = self.terms.len();
        let document = TerminologyDocument {
            ja_to_zh: self.terms.clone(),
            metadata: Some(self.metadata.clone()),
        };
        match storage::write_json_atomic(&self.path, &document) {
            Ok(()) => {
                info!("terminology store saved ({} terms)", self.terms.len());
                true
            }
            Err(err) => {
                warn!("failed to save terminology store: {:#}", err);
                false
            }
        }
    }

    pub fn add_term(&mut self, source: &str, target: &str) -> bool {
        if let Some(existing) = self.terms.get(source) {
            if existing != target {
                warn!(
                    "terminology conflict for {}: keeping {} (ignored {})",
                    source, existing, target
                );
            }
            return false;
        }
        self.terms.insert(source.to_string(), target.to_string());
        info!("new term: {} -> {}", source, target);
        true
    }

    pub fn update_terms<'a, I>(&mut self, batch: I) -> usize
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut added = 0;
        for (source, target) in batch {
            if self.add_term(source, target) {
                added += 1;
            }
        }
        if added > 0 {
            self.save();
        }
        added
    }

    pub fn get_term(&self, source: &str) -> Option<&str> {
        self.terms.get(source).map(String::as_str)
    }

    pub fn get_all(&self) -> BTreeMap<String, String> {
        self.terms.clone()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn search(&self, keyword: &str) -> BTreeMap<String, String> {
        self.terms
            .iter()
            .filter(|(source, target)| source.contains(keyword) || target.contains(keyword))
            .map(|(source, target)| (source.clone(), target.clone()))
            .collect()
    }

    pub fn remove_term(&mut self, source: &str) -> bool {
        if self.terms.remove(source).is_none() {
            return false;
        }
        info!("removed term: {}", source);
        self.save();
        true
    }

    pub fn statistics(&self) -> TerminologyStatistics {
        let file_path = std::path::absolute(&self.path)
            .unwrap_or_else(|_| self.path.clone())
            .display()
            .to_string();
        TerminologyStatistics {
            total_terms: self.terms.len(),
            created_at: self.metadata.created_at.clone(),
            updated_at: self.metadata.updated_at.clone(),
            version: self.metadata.version.clone(),
            file_path,
            file_exists: self.path.exists(),
        }
    }

    pub fn export(&self, path: &Path, format: ExportFormat) -> bool {
        match self.write_export(path, format) {
            Ok(()) => {
                info!("terminology exported to {} ({})", path.display(), format);
                true
            }
            Err(err) => {
                warn!("failed to export terminology: {:#}", err);
                false
            }
        }
    }

    fn write_export(&self, path: &Path, format: ExportFormat) -> Result<()> {
        let content = match format {
            ExportFormat::Json => {
                let mut metadata = self.metadata.clone();
                metadata.total_terms = self.terms.len();
                let document = TerminologyDocument {
                    ja_to_zh: self.terms.clone(),
                    metadata: Some(metadata),
                };
                serde_json::to_string_pretty(&document)?
            }
            ExportFormat::Csv => {
                let mut out = String::from("Japanese,Chinese\n");
                for (source, target) in &self.terms {
                    out.push_str(&csv_field(source));
                    out.push(',');
                    out.push_str(&csv_field(target));
                    out.push('\n');
                }
                out
            }
            ExportFormat::Txt => self
                .terms
                .iter()
                .map(|(source, target)| format!("{}\t{}\n", source, target))
                .collect(),
        };
        fs::write(path, content)
            .with_context(|| format!("failed to write export: {}", path.display()))
    }

    /// Merges a glossary file through `update_terms`. The format follows the
    /// file extension; `.json` accepts a store document or a flat object.
    pub fn import(&mut self, path: &Path) -> Result<usize> {
        let format = ExportFormat::from_path(path).unwrap_or(ExportFormat::Txt);
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read glossary: {}", path.display()))?;
        let entries = match format {
            ExportFormat::Json => parse_json_glossary(&content)
                .with_context(|| format!("failed to parse glossary: {}", path.display()))?,
            ExportFormat::Csv => parse_csv_glossary(&content),
            ExportFormat::Txt => parse_tab_glossary(&content),
        };
        Ok(self.update_terms(entries.iter().map(|(source, target)| (source, target))))
    }
}

fn read_document(path: &Path) -> Result<TerminologyDocument> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read terminology: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse terminology: {}", path.display()))
}

fn parse_json_glossary(content: &str) -> Result<Vec<(String, String)>> {
    let value: Value = serde_json::from_str(content)?;
    let object = match value.get("ja_to_zh") {
        Some(inner) => inner,
        None => &value,
    };
    let map = object
        .as_object()
        .ok_or_else(|| anyhow!("glossary must be a JSON object"))?;
    Ok(map
        .iter()
        .filter_map(|(source, target)| {
            target
                .as_str()
                .map(|target| (source.clone(), target.to_string()))
        })
        .collect())
}

fn parse_csv_glossary(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .filter_map(|line| {
            let fields = split_csv_line(line);
            match fields.as_slice() {
                [source, target, ..] => Some((source.clone(), target.clone())),
                _ => None,
            }
        })
        .filter(|(source, target)| {
            !(source.eq_ignore_ascii_case("japanese") && target.eq_ignore_ascii_case("chinese"))
        })
        .filter(|(source, target)| !source.is_empty() && !target.is_empty())
        .collect()
}

fn parse_tab_glossary(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .map(|(source, target)| (source.trim().to_string(), target.trim().to_string()))
        .filter(|(source, target)| !source.is_empty() && !target.is_empty())
        .collect()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields.into_iter().map(|field| field.trim().to_string()).collect()
}
