//! Identity of a backend: which dataset (and optional annotation target) a
//! spawned process serves.
//!
//! There are three kinds of key, mirroring the path forms the resolver
//! produces:
//! 1. `somedir/dataset.h5ad` — a plain dataset; descriptor == dataset.
//! 2. `somedir/dataset_annotations/my.csv` — a concrete annotations file;
//!    descriptor is the csv path, dataset is the sibling h5ad.
//! 3. `somedir/dataset_annotations` — an annotation directory with no file
//!    chosen yet; `annotation` is `Some("")`.

use serde::Serialize;

/// Identifies the logical resource one backend process serves, independent of
/// runtime state. Two keys with the same dataset but different annotation
/// targets are distinct backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BackendKey {
    /// Name of the item source this key was resolved against.
    pub source: String,
    /// Canonical path of the primary dataset file.
    pub dataset: String,
    /// Annotation target. `None` means no annotations; `Some("")` means the
    /// annotation directory with no specific file yet. The distinction is
    /// significant for equality and for the launch command.
    pub annotation: Option<String>,
}

impl BackendKey {
    pub fn new(
        source: impl Into<String>,
        dataset: impl Into<String>,
        annotation: Option<String>,
    ) -> Self {
        Self {
            source: source.into(),
            dataset: dataset.into(),
            annotation,
        }
    }

    /// The canonical string path identifying this resource: the annotation
    /// descriptor when one exists, otherwise the dataset itself. Used both as
    /// the cache lookup key and to reconstruct proxy URLs.
    pub fn descriptor(&self) -> &str {
        match &self.annotation {
            Some(a) if !a.is_empty() => a,
            Some(_) => &self.dataset,
            None => &self.dataset,
        }
    }

    /// Path under which this key is served, without the external host part.
    /// With `include_source` the source name becomes a path prefix, which is
    /// how multi-source deployments keep descriptors unambiguous.
    pub fn view_path(&self, include_source: bool) -> String {
        let descriptor = encode_descriptor(self.descriptor());
        if include_source {
            format!("/source/{}/view/{}", self.source, descriptor)
        } else {
            format!("/view/{}", descriptor)
        }
    }

    /// Canonical base path for proxied content, always slash-terminated.
    /// Relative references inside the backend UI resolve against this.
    pub fn gateway_basepath(&self, external_base: &str, include_source: bool) -> String {
        format!("{}{}/", external_base, self.view_path(include_source))
    }

    pub fn relaunch_path(&self, include_source: bool) -> String {
        let descriptor = encode_descriptor(self.descriptor());
        if include_source {
            format!("/source/{}/relaunch/{}", self.source, descriptor)
        } else {
            format!("/relaunch/{}", descriptor)
        }
    }
}

/// Percent-encode a descriptor for use in a URL path, keeping the slashes
/// that separate its segments.
fn encode_descriptor(descriptor: &str) -> String {
    descriptor
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
