use crate::error::{DeployError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// One top-level entry of the shipped code tree. `local_path` is relative to
/// the working directory, `remote_path` relative to the remote run directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathToShip {
    pub local_path: PathBuf,
    pub remote_path: PathBuf,
}

impl PathToShip {
    fn same(rel: PathBuf) -> Self {
        Self {
            local_path: rel.clone(),
            remote_path: rel,
        }
    }
}

/// Lists what to ship from `working_dir`: its children minus `exclude`,
/// descending only into directories that contain an excluded path, plus the
/// explicit `extra` paths (`src` or `src:dest`).
pub fn paths_to_ship(
    working_dir: &Path,
    exclude: &[String],
    extra: &[String],
) -> Result<BTreeSet<PathToShip>> {
    let excludes: Vec<PathBuf> = exclude
        .iter()
        .map(|e| normalize_path(&working_dir.join(e)))
        .collect();
    let mut out = BTreeSet::new();
    list_dir(working_dir, working_dir, &excludes, &mut out)?;

    for raw in extra {
        let (src, dest) = match raw.split_once(':') {
            Some((src, dest)) => (src, Some(dest)),
            None => (raw.as_str(), None),
        };
        let local = relative_to(&normalize_path(&working_dir.join(src)), working_dir);
        let remote = match dest {
            Some(dest) => strip_parent_segments(Path::new(dest)),
            None => strip_parent_segments(&local),
        };
        if remote.as_os_str().is_empty() {
            return Err(DeployError::configuration(format!(
                "path to copy {:?} has no usable destination",
                raw
            )));
        }
        out.insert(PathToShip {
            local_path: local,
            remote_path: remote,
        });
    }
    Ok(out)
}

fn list_dir(
    dir: &Path,
    working_dir: &Path,
    excludes: &[PathBuf],
    out: &mut BTreeSet<PathToShip>,
) -> Result<()> {
    let walker = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(|e| DeployError::transfer(e.to_string()))?;
        let path = entry.path();
        if excludes.iter().any(|e| path.starts_with(e)) {
            continue;
        }
        if excludes.iter().any(|e| e.starts_with(path)) {
            if entry.file_type().is_dir() {
                list_dir(path, working_dir, excludes, out)?;
            }
            continue;
        }
        let rel = path.strip_prefix(working_dir).unwrap_or(path).to_path_buf();
        out.insert(PathToShip::same(rel));
    }
    Ok(())
}

/// Packs every entry into one gzip-compressed tarball at `dest`.
pub fn build_archive(working_dir: &Path, entries: &BTreeSet<PathToShip>, dest: &Path) -> Result<()> {
    let file = File::create(dest)?;
    let mut tar = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for entry in entries {
        let src = normalize_path(&working_dir.join(&entry.local_path));
        let meta = fs::metadata(&src).map_err(|e| {
            DeployError::transfer(format!("cannot read {}: {}", src.display(), e))
        })?;
        debug!(path = %entry.remote_path.display(), "adding to deployment archive");
        let appended = if meta.is_dir() {
            tar.append_dir_all(&entry.remote_path, &src)
        } else {
            tar.append_path_with_name(&src, &entry.remote_path)
        };
        appended.map_err(|e| {
            DeployError::transfer(format!("cannot archive {}: {}", src.display(), e))
        })?;
    }
    tar.into_inner()
        .and_then(|enc| enc.finish())
        .map_err(|e| DeployError::transfer(format!("cannot finish archive: {}", e)))?;
    Ok(())
}

pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Lexical `path` relative to `base`; both are expected to be normalized.
pub fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path_parts: Vec<Component> = path.components().collect();
    let base_parts: Vec<Component> = base.components().collect();
    let common = path_parts
        .iter()
        .zip(base_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..base_parts.len() {
        out.push("..");
    }
    for part in &path_parts[common..] {
        out.push(part.as_os_str());
    }
    out
}

fn strip_parent_segments(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}
