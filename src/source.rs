//! Item sources: where datasets come from.
//!
//! The gateway resolves view paths against an `ItemSource` and never touches
//! the filesystem directly, so alternative backends (object stores, catalogs)
//! can slot in behind the same trait. `FileSource` is the shipped
//! implementation: a directory tree of `.h5ad` files with per-dataset
//! `_annotations` directories next to them.

use crate::error::GatewayError;
use crate::key::BackendKey;
use crate::launcher::{LaunchSpec, ANNOTATIONS_SUFFIX, DATASET_SUFFIX};
use std::path::{Path, PathBuf};
use tracing::debug;

const ANNOTATION_FILE_SUFFIX: &str = ".csv";

/// Successful resolution of a view path: the identity of the backend that
/// should serve it plus what to launch if it is not running yet.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub key: BackendKey,
    pub spec: LaunchSpec,
}

/// One dataset as listed on the index page, with its existing annotation
/// files.
#[derive(Debug, Clone)]
pub struct DatasetItem {
    pub dataset: String,
    pub annotations: Vec<String>,
}

pub trait ItemSource: Send + Sync {
    /// Source name, used as the `/source/<name>/` path prefix.
    fn name(&self) -> &str;

    /// Every dataset this source offers, with existing annotation files.
    fn list_items(&self) -> Result<Vec<DatasetItem>, GatewayError>;

    /// Resolve a decoded view path to a key and launch spec. The path may
    /// carry a sub-resource tail (`czi/pbmc3k.h5ad/static/app.js`); resolution
    /// walks up from the full path until something matches.
    fn lookup(&self, path: &str) -> Result<Lookup, GatewayError>;

    /// Absolute location of a relative item path.
    fn local_path(&self, relative: &str) -> PathBuf;

    /// Relative annotations directory belonging to a dataset:
    /// `czi/pbmc3k.h5ad` -> `czi/pbmc3k_annotations`.
    fn annotations_subpath(&self, dataset: &str) -> String;

    /// Make a dataset's annotation target writable before a backend is
    /// launched against it.
    fn create_annotation(&self, dataset: &str) -> Result<(), GatewayError>;
}

/// Directory-tree source rooted at the configured data directory.
pub struct FileSource {
    name: String,
    root: PathBuf,
}

impl FileSource {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    /// Classify one candidate path. `None` means "no match here, try the
    /// parent", distinct from a hard resolution error.
    fn classify(&self, relative: &str) -> Result<Option<Lookup>, GatewayError> {
        if relative.ends_with(DATASET_SUFFIX) && self.local_path(relative).is_file() {
            return Ok(Some(self.dataset_lookup(relative, None)));
        }

        if let Some((dir, _file)) = relative.rsplit_once('/') {
            if relative.ends_with(ANNOTATION_FILE_SUFFIX) && dir.ends_with(ANNOTATIONS_SUFFIX) {
                let dataset = sibling_dataset(dir);
                if self.local_path(&dataset).is_file() {
                    // The csv itself may not exist yet; the backend creates it
                    // on first save, so only the directory has to be there.
                    self.create_annotation(&dataset)?;
                    return Ok(Some(
                        self.dataset_lookup(&dataset, Some(relative.to_string())),
                    ));
                }
            }
        }

        if relative.ends_with(ANNOTATIONS_SUFFIX) {
            let dataset = sibling_dataset(relative);
            if self.local_path(&dataset).is_file() {
                self.create_annotation(&dataset)?;
                return Ok(Some(self.dataset_lookup(&dataset, Some(String::new()))));
            }
        }

        Ok(None)
    }

    fn dataset_lookup(&self, dataset: &str, annotation: Option<String>) -> Lookup {
        let annotation_path = annotation.as_ref().map(|a| {
            if a.is_empty() {
                String::new()
            } else {
                self.local_path(a).to_string_lossy().into_owned()
            }
        });
        Lookup {
            key: BackendKey::new(self.name.clone(), dataset, annotation),
            spec: LaunchSpec {
                file_path: self.local_path(dataset).to_string_lossy().into_owned(),
                annotation_path,
            },
        }
    }

    fn collect_datasets(
        &self,
        dir: &Path,
        items: &mut Vec<DatasetItem>,
    ) -> Result<(), GatewayError> {
        let listing = std::fs::read_dir(dir).map_err(|e| {
            GatewayError::Internal(format!("reading {}: {e}", dir.display()))
        })?;
        for dir_entry in listing {
            let dir_entry = dir_entry
                .map_err(|e| GatewayError::Internal(format!("reading {}: {e}", dir.display())))?;
            let path = dir_entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.is_dir() {
                // Annotation directories are listed with their dataset, not
                // walked as dataset containers.
                if !name.ends_with(ANNOTATIONS_SUFFIX) {
                    self.collect_datasets(&path, items)?;
                }
            } else if name.ends_with(DATASET_SUFFIX) {
                let relative = self.relative_of(&path);
                let annotations = self.existing_annotations(&relative);
                items.push(DatasetItem {
                    dataset: relative,
                    annotations,
                });
            }
        }
        Ok(())
    }

    fn existing_annotations(&self, dataset: &str) -> Vec<String> {
        let subpath = self.annotations_subpath(dataset);
        let Ok(listing) = std::fs::read_dir(self.local_path(&subpath)) else {
            return Vec::new();
        };
        let mut annotations: Vec<String> = listing
            .flatten()
            .filter_map(|f| {
                let name = f.file_name().to_str()?.to_string();
                name.ends_with(ANNOTATION_FILE_SUFFIX)
                    .then(|| format!("{subpath}/{name}"))
            })
            .collect();
        annotations.sort();
        annotations
    }

    fn relative_of(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

impl ItemSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_items(&self) -> Result<Vec<DatasetItem>, GatewayError> {
        let mut items = Vec::new();
        self.collect_datasets(&self.root, &mut items)?;
        items.sort_by(|a, b| a.dataset.cmp(&b.dataset));
        Ok(items)
    }

    fn lookup(&self, path: &str) -> Result<Lookup, GatewayError> {
        let mut candidate = path.trim_matches('/');
        while !candidate.is_empty() {
            if let Some(lookup) = self.classify(candidate)? {
                debug!(
                    source = %self.name,
                    path = %path,
                    dataset = %lookup.key.dataset,
                    annotation = ?lookup.key.annotation,
                    "resolved view path"
                );
                return Ok(lookup);
            }
            candidate = match candidate.rsplit_once('/') {
                Some((parent, _)) => parent,
                None => break,
            };
        }
        Err(GatewayError::NotFound(path.to_string()))
    }

    fn local_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    fn annotations_subpath(&self, dataset: &str) -> String {
        let stem = dataset.strip_suffix(DATASET_SUFFIX).unwrap_or(dataset);
        format!("{stem}{ANNOTATIONS_SUFFIX}")
    }

    fn create_annotation(&self, dataset: &str) -> Result<(), GatewayError> {
        let dir = self.local_path(&self.annotations_subpath(dataset));
        std::fs::create_dir_all(&dir).map_err(|e| {
            GatewayError::Internal(format!(
                "creating annotations directory {}: {e}",
                dir.display()
            ))
        })
    }
}

/// Dataset file belonging to an annotations directory path:
/// `czi/pbmc3k_annotations` -> `czi/pbmc3k.h5ad`.
fn sibling_dataset(annotations_dir: &str) -> String {
    let stem = annotations_dir
        .strip_suffix(ANNOTATIONS_SUFFIX)
        .unwrap_or(annotations_dir);
    format!("{stem}{DATASET_SUFFIX}")
}
