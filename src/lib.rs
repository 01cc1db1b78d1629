#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod analyze;
mod assemble;
mod builder;
mod error;
mod graph;
mod hooks;
mod node;
mod queue;

pub use crate::builder::{BuildEvent, BuildRecord, Builder, Timings};
pub use crate::error::{BuildError, GraphError};
pub use crate::graph::{Graph, NodeSnapshot, SharedGraph, Snapshot};
pub use crate::hooks::{HookContext, Stage};
pub use crate::node::{Dynamic, FileNode};
pub use crate::queue::{Injector, TaskQueue};

/// Opt-in console logging for build internals, filtered through `RUST_LOG`.
#[cfg(feature = "logging")]
pub mod logging {
    use tracing_subscriber::EnvFilter;

    pub fn init() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    }
}
