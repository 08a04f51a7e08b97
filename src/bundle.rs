use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::error::{PolicydError, PolicydResult};

/// In-memory policy override: relative path -> rule text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicyBundle {
    files: BTreeMap<String, String>,
}

impl PolicyBundle {
    /// Builds a bundle from `(path, content)` pairs. A repeated path is a
    /// caller bug and is rejected rather than silently overwritten.
    pub fn from_entries<I, P, C>(entries: I) -> PolicydResult<Self>
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        let mut files = BTreeMap::new();
        for (path, content) in entries {
            let path = path.into();
            validate_entry_path(&path)?;
            if files.insert(path.clone(), content.into()).is_some() {
                return Err(PolicydError::build(format!(
                    "duplicate bundle path '{}'",
                    path
                )));
            }
        }
        if files.is_empty() {
            return Err(PolicydError::build("bundle must contain at least one file"));
        }
        Ok(Self { files })
    }

    pub fn single(path: &str, content: &str) -> PolicydResult<Self> {
        Self::from_entries([(path, content)])
    }

    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Archive materialized on disk, ready to be attached as a resource.
#[derive(Debug, Clone)]
pub struct BuiltBundle {
    pub path: PathBuf,
    pub sha256: String,
    pub entries: Vec<String>,
}

/// Writes `bundle` as `<scratch_dir>/<name>`. Entries are written in sorted
/// order with a fixed timestamp so equal bundles give equal bytes.
pub fn build(scratch_dir: &Path, name: &str, bundle: &PolicyBundle) -> PolicydResult<BuiltBundle> {
    if name.trim().is_empty() || name.contains('/') || name.contains('\\') {
        return Err(PolicydError::build(format!(
            "bundle name '{}' must be a plain file name",
            name
        )));
    }
    if bundle.is_empty() {
        return Err(PolicydError::build("bundle must contain at least one file"));
    }

    let path = scratch_dir.join(name);
    let file = File::create(&path).map_err(|err| {
        PolicydError::build(format!("failed to create {}: {}", path.display(), err))
    })?;

    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);

    for (entry, content) in bundle.files() {
        writer
            .start_file(entry.as_str(), options)
            .map_err(|err| PolicydError::build(format!("failed to add '{}': {}", entry, err)))?;
        writer
            .write_all(content.as_bytes())
            .map_err(|err| PolicydError::build(format!("failed to write '{}': {}", entry, err)))?;
    }
    writer.finish().map_err(|err| {
        PolicydError::build(format!("failed to finish {}: {}", path.display(), err))
    })?;

    let bytes = fs::read(&path).map_err(|err| {
        PolicydError::build(format!("failed to read back {}: {}", path.display(), err))
    })?;
    let sha256 = format!("{:x}", Sha256::digest(&bytes));
    debug!(
        bundle = %path.display(),
        entries = bundle.len(),
        sha256 = %sha256,
        "policy bundle written"
    );

    Ok(BuiltBundle {
        path,
        sha256,
        entries: bundle.paths().map(ToString::to_string).collect(),
    })
}

/// Reads an archive back into a path -> content map.
pub fn read_entries(path: &Path) -> PolicydResult<BTreeMap<String, String>> {
    let file = File::open(path)
        .map_err(|err| PolicydError::build(format!("failed to open {}: {}", path.display(), err)))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|err| PolicydError::build(format!("failed to read {}: {}", path.display(), err)))?;

    let mut entries = BTreeMap::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| PolicydError::build(format!("bad entry #{}: {}", index, err)))?;
        let name = entry.name().to_string();
        let mut content = String::new();
        entry
            .read_to_string(&mut content)
            .map_err(|err| PolicydError::build(format!("entry '{}' is not utf-8: {}", name, err)))?;
        entries.insert(name, content);
    }
    Ok(entries)
}

fn validate_entry_path(path: &str) -> PolicydResult<()> {
    if path.trim().is_empty() {
        return Err(PolicydError::build("bundle path must not be empty"));
    }
    if path.contains('\\') {
        return Err(PolicydError::build(format!(
            "bundle path '{}' must use '/' separators",
            path
        )));
    }
    let escapes = Path::new(path)
        .components()
        .any(|part| !matches!(part, Component::Normal(_)));
    if escapes {
        return Err(PolicydError::build(format!(
            "bundle path '{}' must be relative and stay inside the bundle",
            path
        )));
    }
    Ok(())
}
