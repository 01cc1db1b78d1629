//! The per-(stage, file type) handler registry.
//!
//! Plugins attach behavior to named build stages; the registry stores one
//! ordered handler list per (stage, type) key and runs each list strictly
//! sequentially. Sequencing is load-bearing: a `read` handler relies on state
//! its `preread` predecessor left on the file node.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use futures::future::BoxFuture;
use parking_lot::{MappedMutexGuard, MutexGuard};
use tracing::trace;

use crate::error::BuildError;
use crate::graph::{Graph, SharedGraph};
use crate::node::FileNode;

/// A named point in the per-file processing pipeline.
///
/// The first five stages belong to the analysis phase, the remaining four to
/// assembly. `Postdependencies` deliberately runs during assembly even though
/// its name pairs it with `Dependencies`: graph mutations from analysis must
/// be finalized before handlers start rewiring edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Preread,
    Read,
    Postread,
    Predependencies,
    Dependencies,
    Postdependencies,
    Prewrite,
    Write,
    Postwrite,
}

impl Stage {
    /// Stages run by the analysis orchestrator, in order.
    pub const ANALYSIS: [Stage; 5] = [
        Stage::Preread,
        Stage::Read,
        Stage::Postread,
        Stage::Predependencies,
        Stage::Dependencies,
    ];

    /// Stages run by the assembly orchestrator, in order.
    pub const ASSEMBLY: [Stage; 4] = [
        Stage::Postdependencies,
        Stage::Prewrite,
        Stage::Write,
        Stage::Postwrite,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Preread => "preread",
            Stage::Read => "read",
            Stage::Postread => "postread",
            Stage::Predependencies => "predependencies",
            Stage::Dependencies => "dependencies",
            Stage::Postdependencies => "postdependencies",
            Stage::Prewrite => "prewrite",
            Stage::Write => "write",
            Stage::Postwrite => "postwrite",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a hook handler gets to see: the file it was dispatched for and
/// the graph that file lives in.
///
/// Graph access goes through a lock so that concurrently processed files can
/// interleave safely. Guards must not be held across an `await`; take what
/// you need, drop the guard, then suspend.
#[derive(Clone)]
pub struct HookContext {
    /// Path of the file this hook invocation is about.
    pub path: Utf8PathBuf,
    pub(crate) graph: SharedGraph,
}

impl HookContext {
    /// Lock the graph for synchronous inspection or mutation.
    pub fn graph(&self) -> MutexGuard<'_, Graph> {
        self.graph.lock()
    }

    /// Lock the graph and borrow this invocation's file node.
    ///
    /// # Panics
    /// Panics if the node was removed from the graph while its own hook was
    /// running, which breaks the registry contract.
    pub fn file(&self) -> MappedMutexGuard<'_, FileNode> {
        MutexGuard::map(self.graph.lock(), |graph| {
            graph
                .get_mut(&self.path)
                .expect("file node exists while its hooks run")
        })
    }
}

/// The one normalized handler shape every registration collapses to: take a
/// context, eventually report success or failure exactly once.
pub(crate) type Handler =
    Arc<dyn Fn(HookContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Default, Clone)]
pub(crate) struct Hooks {
    handlers: HashMap<(Stage, Box<str>), Vec<Handler>>,
}

impl Hooks {
    /// Register `handler` for every type in `types`. Registration appends:
    /// a later `set` for the same key extends the list, never replaces it.
    pub(crate) fn set<F, Fut>(&mut self, stage: Stage, types: &[&str], handler: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        for file_type in types {
            trace!("{stage}:{file_type} register handler");
            self.handlers
                .entry((stage, Box::from(*file_type)))
                .or_default()
                .push(handler.clone());
        }
    }

    pub(crate) fn has(&self, stage: Stage, file_type: &str) -> bool {
        self.handlers.contains_key(&(stage, Box::from(file_type)))
    }

    /// Run every handler registered for (stage, type), sequentially in
    /// registration order. Completes immediately when nothing is registered.
    /// The first failing handler aborts the rest of the stage and the error
    /// is wrapped with enough context to locate the offending plugin.
    pub(crate) async fn run(
        &self,
        stage: Stage,
        file_type: &str,
        ctx: &HookContext,
    ) -> Result<(), BuildError> {
        let Some(handlers) = self.handlers.get(&(stage, Box::from(file_type))) else {
            trace!("{stage}:{file_type} has no handlers");
            return Ok(());
        };

        trace!(
            "{stage}:{file_type} run with {} handlers for {}",
            handlers.len(),
            ctx.path
        );
        for handler in handlers {
            handler(ctx.clone())
                .await
                .map_err(|err| BuildError::Hook(stage, ctx.path.clone(), err))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    fn context_for(path: &str) -> HookContext {
        let mut graph = Graph::new();
        graph.add_node(path, true);
        HookContext {
            path: path.into(),
            graph: Arc::new(parking_lot::Mutex::new(graph)),
        }
    }

    #[tokio::test]
    async fn missing_handlers_complete_immediately() {
        let hooks = Hooks::default();
        let ctx = context_for("/a.txt");
        hooks.run(Stage::Read, "txt", &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn handlers_run_sequentially_in_registration_order() {
        let called = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = Hooks::default();

        let log = called.clone();
        hooks.set(Stage::Read, &["txt"], move |_ctx| {
            let log = log.clone();
            async move {
                // the slow handler still finishes before the next one starts
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.lock().unwrap().push("read1");
                Ok(())
            }
        });

        let log = called.clone();
        hooks.set(Stage::Read, &["txt"], move |_ctx| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push("read2");
                Ok(())
            }
        });

        let ctx = context_for("/a.txt");
        hooks.run(Stage::Read, "txt", &ctx).await.unwrap();
        assert_eq!(*called.lock().unwrap(), ["read1", "read2"]);
    }

    #[tokio::test]
    async fn registration_is_per_type() {
        let called = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = Hooks::default();

        let log = called.clone();
        hooks.set(Stage::Read, &["txt", "md"], move |ctx| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(ctx.path.to_string());
                Ok(())
            }
        });

        assert!(hooks.has(Stage::Read, "txt"));
        assert!(hooks.has(Stage::Read, "md"));
        assert!(!hooks.has(Stage::Read, "js"));
        assert!(!hooks.has(Stage::Write, "txt"));

        let ctx = context_for("/a.js");
        hooks.run(Stage::Read, "js", &ctx).await.unwrap();
        assert!(called.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn a_failure_aborts_the_remaining_handlers() {
        let called = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = Hooks::default();

        hooks.set(Stage::Read, &["txt"], |_ctx| async {
            anyhow::bail!("boom")
        });

        let log = called.clone();
        hooks.set(Stage::Read, &["txt"], move |_ctx| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push("unreachable");
                Ok(())
            }
        });

        let ctx = context_for("/a.txt");
        let err = hooks.run(Stage::Read, "txt", &ctx).await.unwrap_err();
        assert!(matches!(err, BuildError::Hook(Stage::Read, _, _)));
        assert!(called.lock().unwrap().is_empty());
    }

    #[test]
    fn stage_names_are_lowercase() {
        assert_eq!(Stage::Preread.to_string(), "preread");
        assert_eq!(Stage::Postdependencies.to_string(), "postdependencies");
        assert_eq!(Stage::ANALYSIS.len() + Stage::ASSEMBLY.len(), 9);
    }
}
