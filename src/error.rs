use camino::Utf8PathBuf;
use thiserror::Error;

use crate::hooks::Stage;

/// Failures surfaced by the public build entry points.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("an entry file is required")]
    NoEntries,

    #[error("hook '{0}' failed for '{1}':\n{2}")]
    Hook(Stage, Utf8PathBuf, anyhow::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph contains a cycle through '{path}'")]
    Cycle { path: Utf8PathBuf },
}
