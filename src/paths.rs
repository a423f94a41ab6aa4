use std::path::{Path, PathBuf};

const BASE_DIR_ENV: &str = "COMIC_TRANSLATOR_RUST_DIR";
const BASE_DIR_NAME: &str = ".comic-translator-rust";

/// Where settings, stage results and the terminology store live by default.
pub(crate) fn base_dir() -> PathBuf {
    if let Some(dir) = base_dir_override() {
        return dir;
    }
    home_join(BASE_DIR_NAME).unwrap_or_else(|| PathBuf::from(BASE_DIR_NAME))
}

pub(crate) fn settings_dir() -> Option<PathBuf> {
    if let Some(dir) = base_dir_override() {
        return Some(dir);
    }
    home_join(BASE_DIR_NAME)
}

pub(crate) fn default_results_dir() -> PathBuf {
    base_dir().join("stages_results")
}

pub(crate) fn default_terminology_path() -> PathBuf {
    base_dir().join("terminology_dict.json")
}

/// Expands a leading `~` and normalizes separators. Empty input yields None.
pub(crate) fn resolve_user_path(value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(normalize_path(PathBuf::from(expand_tilde(trimmed))))
}

fn base_dir_override() -> Option<PathBuf> {
    std::env::var(BASE_DIR_ENV)
        .ok()
        .and_then(|value| resolve_user_path(&value))
}

fn home_join(suffix: &str) -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(suffix))
        }
    })
}

fn normalize_path(path: PathBuf) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        normalized.push(component.as_os_str());
    }
    normalized
}

fn expand_tilde(value: &str) -> String {
    if (value == "~" || value.starts_with("~/"))
        && let Ok(home) = std::env::var("HOME")
    {
        let home = home.trim();
        if home.is_empty() {
            return value.to_string();
        }
        if value == "~" {
            return home.to_string();
        }
        return format!("{}{}", home, &value[1..]);
    }
    value.to_string()
}
