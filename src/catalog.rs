//! Model catalog — what's on disk.
//!
//! Scans the models directory for `.gguf` files and resolves operator-given
//! names to absolute paths. Sharded models (weights split across
//! `<base>(-part)?-NNNNN-of-NNNNN.gguf` files) are collapsed to one entry
//! keyed on the first shard; later shards are suppressed from listings and
//! attached to the entry's shard list.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::store::ModelsDirProvider;

/// A shard filename decomposed: base name, 1-based index, total count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardName {
    pub base: String,
    pub index: u32,
    pub total: u32,
}

/// Parse `<base>(-part)?-NNNNN-of-NNNNN.gguf`, case-insensitively.
pub fn parse_shard_name(filename: &str) -> Option<ShardName> {
    // Compiled per call; scan volume is a directory listing, not a hot path.
    let re = Regex::new(r"(?i)^(.+?)(?:-part)?-(\d{5})-of-(\d{5})\.gguf$")
        .expect("shard pattern is valid");
    let caps = re.captures(filename)?;
    Some(ShardName {
        base: caps[1].to_string(),
        index: caps[2].parse().ok()?,
        total: caps[3].parse().ok()?,
    })
}

/// One installed model as presented to operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    /// Entry-point file name (first shard for sharded sets).
    pub filename: String,
    /// Absolute path of the entry-point file.
    pub path: PathBuf,
    /// File size; sum over present shards for sharded sets.
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub is_sharded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_count: Option<u32>,
    /// All shard paths ordered by index; empty for single-file models.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub shard_paths: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_model_name: Option<String>,
    /// For sharded sets: whether every shard is present on disk.
    pub exists: bool,
}

/// Read-only view over the models directory.
pub struct Catalog {
    provider: Arc<dyn ModelsDirProvider>,
}

impl Catalog {
    pub fn new(provider: Arc<dyn ModelsDirProvider>) -> Self {
        Self { provider }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.provider.models_dir()
    }

    /// Enumerate installed models, recursively. Sharded sets appear once.
    pub fn scan(&self) -> Vec<ModelInfo> {
        let root = self.models_dir();
        let mut singles: Vec<(PathBuf, u64, DateTime<Utc>)> = Vec::new();
        // Keyed by (directory, lowercased base, total).
        let mut shard_sets: std::collections::HashMap<
            (PathBuf, String, u32),
            Vec<(u32, PathBuf, u64, DateTime<Utc>)>,
        > = std::collections::HashMap::new();

        for entry in WalkDir::new(&root).follow_links(true).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.to_lowercase().ends_with(".gguf") {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "unreadable model file");
                    continue;
                }
            };
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            match parse_shard_name(name) {
                Some(shard) => {
                    let key = (
                        path.parent().unwrap_or(Path::new("")).to_path_buf(),
                        shard.base.to_lowercase(),
                        shard.total,
                    );
                    shard_sets.entry(key).or_default().push((
                        shard.index,
                        path.to_path_buf(),
                        meta.len(),
                        modified,
                    ));
                }
                None => singles.push((path.to_path_buf(), meta.len(), modified)),
            }
        }

        let mut models: Vec<ModelInfo> = singles
            .into_iter()
            .map(|(path, size, modified)| ModelInfo {
                filename: file_name_string(&path),
                path,
                size,
                modified,
                is_sharded: false,
                shard_count: None,
                shard_paths: Vec::new(),
                base_model_name: None,
                exists: true,
            })
            .collect();

        for ((_dir, _base_key, total), mut shards) in shard_sets {
            shards.sort_by_key(|(index, ..)| *index);
            // The set is addressed by its first shard; a set missing shard 1
            // has no entry point and is not listed.
            let Some(first) = shards.iter().find(|(index, ..)| *index == 1) else {
                continue;
            };
            let entry_path = first.1.clone();
            let entry_name = file_name_string(&entry_path);
            let base = parse_shard_name(&entry_name).map(|s| s.base);
            let present: std::collections::HashSet<u32> =
                shards.iter().map(|(index, ..)| *index).collect();
            let exists = (1..=total).all(|i| present.contains(&i));

            models.push(ModelInfo {
                filename: entry_name,
                path: entry_path,
                size: shards.iter().map(|(_, _, size, _)| size).sum(),
                modified: shards
                    .iter()
                    .map(|(_, _, _, modified)| *modified)
                    .max()
                    .unwrap_or_else(Utc::now),
                is_sharded: true,
                shard_count: Some(total),
                shard_paths: shards.iter().map(|(_, path, ..)| path.clone()).collect(),
                base_model_name: base,
                exists,
            });
        }

        models.sort_by(|a, b| a.filename.cmp(&b.filename));
        models
    }

    /// Find the catalog entry whose entry-point path equals `path`.
    pub fn entry_for_path(&self, path: &Path) -> Option<ModelInfo> {
        self.scan().into_iter().find(|m| m.path == path)
    }

    /// Resolve an operator-supplied model name to the entry-point path.
    ///
    /// Tries, in order: absolute path; `<modelsDir>/<name>`;
    /// `<modelsDir>/<name>.gguf`; a scan for matching base model name; a
    /// scan for matching filename-without-extension.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let as_path = Path::new(name);
        if as_path.is_absolute() && as_path.is_file() {
            return Some(as_path.to_path_buf());
        }

        let dir = self.models_dir();
        let direct = dir.join(name);
        if direct.is_file() {
            return Some(direct);
        }
        let with_ext = dir.join(format!("{name}.gguf"));
        if with_ext.is_file() {
            return Some(with_ext);
        }

        let models = self.scan();
        if let Some(model) = models
            .iter()
            .find(|m| m.base_model_name.as_deref() == Some(name))
        {
            return Some(model.path.clone());
        }
        models
            .iter()
            .find(|m| {
                m.filename
                    .strip_suffix(".gguf")
                    .or_else(|| m.filename.strip_suffix(".GGUF"))
                    .is_some_and(|stem| stem == name)
            })
            .map(|m| m.path.clone())
    }

    /// Resolve a name to its full catalog entry (used by deletion, which
    /// needs shard paths, not just the entry point).
    pub fn resolve_entry(&self, name: &str) -> Option<ModelInfo> {
        let path = self.resolve(name)?;
        self.entry_for_path(&path).or_else(|| {
            // Absolute path outside the models directory: synthesize a
            // single-file entry so deletion by path still works.
            let meta = std::fs::metadata(&path).ok()?;
            Some(ModelInfo {
                filename: file_name_string(&path),
                path,
                size: meta.len(),
                modified: meta.modified().map(DateTime::<Utc>::from).ok()?,
                is_sharded: false,
                shard_count: None,
                shard_paths: Vec::new(),
                base_model_name: None,
                exists: true,
            })
        })
    }
}

fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
