//! Per-file state tracked by the dependency graph.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

/// Type-erased, plugin-attached value stored on a file node. Content buffers,
/// parsed ASTs and similar intermediate artifacts all travel through the
/// pipeline in this shape; the core never looks inside.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// A single file within the build graph.
///
/// Identity is the `path`. Everything else is processing state: the current
/// type tag (which transform plugins may rewrite, e.g. `jade` -> `html`), the
/// type tag captured at first encounter, lifecycle flags for the analysis
/// phase, and an opaque metadata map for plugin data.
#[derive(Clone)]
pub struct FileNode {
    /// Unique identifier within one graph.
    pub path: Utf8PathBuf,
    /// Current processing type tag. Plugins may rewrite this mid-pipeline.
    pub file_type: String,
    /// True if this file was requested directly as a build entry.
    pub is_entry: bool,
    initial_type: String,
    analyzing: bool,
    analyzed: bool,
    metadata: HashMap<Box<str>, Dynamic>,
}

impl FileNode {
    pub(crate) fn new(path: Utf8PathBuf, is_entry: bool) -> Self {
        let file_type = extension_of(&path);
        Self {
            path,
            initial_type: file_type.clone(),
            file_type,
            is_entry,
            analyzing: false,
            analyzed: false,
            metadata: HashMap::new(),
        }
    }

    pub(crate) fn from_parts(
        path: Utf8PathBuf,
        file_type: String,
        initial_type: String,
        is_entry: bool,
        analyzed: bool,
    ) -> Self {
        Self {
            path,
            file_type,
            initial_type,
            is_entry,
            analyzing: false,
            analyzed,
            metadata: HashMap::new(),
        }
    }

    /// The type tag this file had when it first entered the graph. Unlike
    /// [`file_type`](Self::file_type) this never changes, so the `preread`
    /// stage keeps dispatching to the same handlers across rebuilds even
    /// after a transform rewrote the current type.
    pub fn initial_type(&self) -> &str {
        &self.initial_type
    }

    /// True while the analysis stage sequence is running for this file.
    pub fn is_analyzing(&self) -> bool {
        self.analyzing
    }

    /// True once the analysis stage sequence has completed and the result
    /// has not been invalidated since.
    pub fn is_analyzed(&self) -> bool {
        self.analyzed
    }

    /// Mark the cached analysis result as stale. The next analysis pass will
    /// rerun the full stage sequence for this file. Typically called from a
    /// `preread` handler that compared file modification times.
    pub fn invalidate(&mut self) {
        self.analyzed = false;
    }

    pub(crate) fn set_analyzing(&mut self, value: bool) {
        self.analyzing = value;
        if value {
            // the two flags are mutually exclusive at any instant
            self.analyzed = false;
        }
    }

    pub(crate) fn set_analyzed(&mut self) {
        self.analyzing = false;
        self.analyzed = true;
    }

    /// Attach an arbitrary value under `key`, replacing any previous value.
    pub fn set_meta<T>(&mut self, key: impl Into<Box<str>>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.metadata.insert(key.into(), Arc::new(value));
    }

    /// Borrow a previously attached value, downcast to its concrete type.
    /// Returns `None` when the key is absent or holds a different type.
    pub fn meta<T>(&self, key: &str) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        self.metadata.get(key)?.downcast_ref()
    }

    /// Remove and return the raw value stored under `key`.
    pub fn take_meta(&mut self, key: &str) -> Option<Dynamic> {
        self.metadata.remove(key)
    }

    pub fn has_meta(&self, key: &str) -> bool {
        self.metadata.contains_key(key)
    }
}

impl Debug for FileNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileNode")
            .field("path", &self.path)
            .field("file_type", &self.file_type)
            .field("is_entry", &self.is_entry)
            .field("analyzing", &self.analyzing)
            .field("analyzed", &self.analyzed)
            .field("metadata", &self.metadata.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub(crate) fn extension_of(path: &Utf8Path) -> String {
    path.extension().unwrap_or_default().to_string()
}
