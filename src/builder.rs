//! The public registration and build-trigger surface.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::BuildError;
use crate::graph::{Graph, SharedGraph, Snapshot};
use crate::hooks::{HookContext, Hooks, Stage};

/// Lifecycle notification emitted while a build runs. Observers registered
/// with [`Builder::observe`] receive every event; they cannot affect control
/// flow. Useful for logging, progress display and timing collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    /// A stage's handler list is about to run for a file.
    BeforeStage { stage: Stage, path: Utf8PathBuf },
    /// A stage's handler list completed for a file.
    AfterStage { stage: Stage, path: Utf8PathBuf },
    /// A file entered the analysis traversal.
    BeforeAnalyze { path: Utf8PathBuf },
    /// A file finished its analysis visit, including dependency discovery.
    AfterAnalyze { path: Utf8PathBuf },
    /// A file entered the assembly write-out pipeline.
    BeforeAssemble { path: Utf8PathBuf },
    /// A file was fully assembled (`postwrite` completed).
    AfterAssemble { path: Utf8PathBuf },
}

type ObserverFn = Arc<dyn Fn(&BuildEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct EventSink(Arc<Vec<ObserverFn>>);

impl EventSink {
    pub(crate) fn emit(&self, event: BuildEvent) {
        for observer in self.0.iter() {
            observer(&event);
        }
    }
}

/// Wall-clock totals accumulated per label over one build. Stage labels add
/// up across files, so `timings.get("read")` is the total time spent in
/// `read` handlers for the whole build.
#[derive(Debug, Clone, Default)]
pub struct Timings {
    totals: HashMap<Box<str>, Duration>,
}

impl Timings {
    pub(crate) fn add(&mut self, label: &str, elapsed: Duration) {
        *self.totals.entry(Box::from(label)).or_default() += elapsed;
    }

    pub fn get(&self, label: &str) -> Option<Duration> {
        self.totals.get(label).copied()
    }

    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.totals.keys().map(AsRef::as_ref).collect();
        labels.sort_unstable();
        labels
    }
}

impl fmt::Display for Timings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels = self.labels();
        let width = labels.iter().map(|l| l.len()).max().unwrap_or(0);
        for label in labels {
            writeln!(f, "{label:width$}  {:?}", self.totals[label])?;
        }
        Ok(())
    }
}

/// The outcome of one `analyze`/`assemble`/`build` call: which entries were
/// requested, the resulting graph view, and where the time went.
///
/// For `analyze` the graph is a snapshot of the builder's live graph; for
/// `assemble`/`build` it is the pruned, cycle-broken assembly clone with any
/// files the write stages derived.
#[derive(Debug)]
pub struct BuildRecord {
    pub entries: Vec<Utf8PathBuf>,
    pub graph: Graph,
    pub timings: Timings,
}

/// Per-call state shared by the two orchestrators: the registered hooks, the
/// observer sink, accumulated timings and the concurrency limit.
#[derive(Clone)]
pub(crate) struct RunCx {
    pub(crate) hooks: Arc<Hooks>,
    pub(crate) events: EventSink,
    pub(crate) timings: Arc<Mutex<Timings>>,
    pub(crate) concurrency: usize,
}

impl RunCx {
    /// Run one stage for one file: resolve the dispatch type, surround the
    /// handler list with before/after events and record the elapsed time.
    ///
    /// `preread` dispatches on the file's *initial* type so that invalidation
    /// checks keep firing after a transform rewrote the current type;
    /// every other stage uses the current type.
    pub(crate) async fn run_stage(
        &self,
        graph: &SharedGraph,
        stage: Stage,
        path: &Utf8Path,
    ) -> Result<(), BuildError> {
        let file_type = {
            let g = graph.lock();
            let Some(node) = g.get(path) else {
                return Ok(());
            };
            match stage {
                Stage::Preread => node.initial_type().to_string(),
                _ => node.file_type.clone(),
            }
        };

        self.events.emit(BuildEvent::BeforeStage {
            stage,
            path: path.to_owned(),
        });

        let ctx = HookContext {
            path: path.to_owned(),
            graph: graph.clone(),
        };
        let started = Instant::now();
        let result = self.hooks.run(stage, &file_type, &ctx).await;
        self.timings.lock().add(stage.name(), started.elapsed());

        if result.is_ok() {
            self.events.emit(BuildEvent::AfterStage {
                stage,
                path: path.to_owned(),
            });
        }
        result
    }
}

/// The core builder. Plugins register stage handlers against file types, then
/// one of the build entry points walks the dependency graph and drives those
/// handlers in order.
///
/// The builder owns its graph for its whole lifetime, which is what makes
/// repeat builds cheap: files analyzed by an earlier call are skipped until a
/// `preread` handler invalidates them.
pub struct Builder {
    hooks: Hooks,
    graph: SharedGraph,
    observers: Vec<ObserverFn>,
    concurrency: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::with_graph(Graph::new())
    }

    /// Start from a pre-populated graph, e.g. one restored from a
    /// [`Snapshot`] persisted by an earlier process.
    pub fn with_graph(graph: Graph) -> Self {
        debug!("initialize");
        Self {
            hooks: Hooks::default(),
            graph: Arc::new(Mutex::new(graph)),
            observers: Vec::new(),
            concurrency: usize::MAX,
        }
    }

    /// Cap how many files may be in flight at once during analysis and the
    /// write stages. Defaults to unbounded.
    pub fn concurrency(&mut self, limit: usize) -> &mut Self {
        self.concurrency = limit.max(1);
        self
    }

    /// Register an asynchronous handler for `stage`, once per type in
    /// `types`. Handlers for the same (stage, type) run in registration
    /// order.
    pub fn on<F, Fut>(&mut self, stage: Stage, types: &[&str], handler: F) -> &mut Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.set(stage, types, handler);
        self
    }

    /// Register a plain synchronous handler. Adapted to the same internal
    /// shape as [`on`](Self::on), so both kinds mix freely in one pipeline.
    pub fn on_fn<F>(&mut self, stage: Stage, types: &[&str], handler: F) -> &mut Self
    where
        F: Fn(HookContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.on(stage, types, move |ctx| {
            let handler = handler.clone();
            async move { handler(ctx) }
        })
    }

    /// Apply a plugin: a setup function that receives the builder and
    /// registers whatever handlers it needs.
    pub fn with_plugin(&mut self, plugin: impl FnOnce(&mut Self)) -> &mut Self {
        plugin(self);
        self
    }

    /// Subscribe to [`BuildEvent`] lifecycle notifications.
    pub fn observe(&mut self, observer: impl Fn(&BuildEvent) + Send + Sync + 'static) -> &mut Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Shared handle to the builder's live graph.
    pub fn graph(&self) -> SharedGraph {
        self.graph.clone()
    }

    /// Serializable snapshot of the live graph.
    pub fn snapshot(&self) -> Snapshot {
        self.graph.lock().snapshot()
    }

    /// Discover and analyze the dependency graph for the given entries.
    pub async fn analyze(
        &self,
        entries: impl IntoIterator<Item = impl Into<Utf8PathBuf>>,
    ) -> Result<BuildRecord, BuildError> {
        let entries = collect_entries(entries)?;
        let cx = self.run_cx();

        let started = Instant::now();
        crate::analyze::run(&cx, &self.graph, &entries).await?;
        cx.timings.lock().add("analyze", started.elapsed());

        let graph = self.graph.lock().clone();
        Ok(finish(entries, graph, cx))
    }

    /// Assemble previously analyzed entries into build artifacts.
    pub async fn assemble(
        &self,
        entries: impl IntoIterator<Item = impl Into<Utf8PathBuf>>,
    ) -> Result<BuildRecord, BuildError> {
        let entries = collect_entries(entries)?;
        let cx = self.run_cx();

        let started = Instant::now();
        let graph = crate::assemble::run(&cx, &self.graph, &entries).await?;
        cx.timings.lock().add("assemble", started.elapsed());

        Ok(finish(entries, graph, cx))
    }

    /// The primary entry point: a full analysis + assembly pass.
    pub async fn build(
        &self,
        entries: impl IntoIterator<Item = impl Into<Utf8PathBuf>>,
    ) -> Result<BuildRecord, BuildError> {
        let entries = collect_entries(entries)?;
        let cx = self.run_cx();

        let started = Instant::now();
        crate::analyze::run(&cx, &self.graph, &entries).await?;
        cx.timings.lock().add("analyze", started.elapsed());

        let started = Instant::now();
        let graph = crate::assemble::run(&cx, &self.graph, &entries).await?;
        cx.timings.lock().add("assemble", started.elapsed());

        Ok(finish(entries, graph, cx))
    }

    /// [`build`](Self::build) for synchronous callers, driven by a throwaway
    /// current-thread runtime.
    pub fn build_blocking(
        &self,
        entries: impl IntoIterator<Item = impl Into<Utf8PathBuf>>,
    ) -> Result<BuildRecord, BuildError> {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("Failed to build runtime")
            .block_on(self.build(entries))
    }

    fn run_cx(&self) -> RunCx {
        RunCx {
            hooks: Arc::new(self.hooks.clone()),
            events: EventSink(Arc::new(self.observers.clone())),
            timings: Arc::new(Mutex::new(Timings::default())),
            concurrency: self.concurrency,
        }
    }
}

fn collect_entries(
    entries: impl IntoIterator<Item = impl Into<Utf8PathBuf>>,
) -> Result<Vec<Utf8PathBuf>, BuildError> {
    let entries: Vec<Utf8PathBuf> = entries.into_iter().map(Into::into).collect();
    if entries.is_empty() {
        return Err(BuildError::NoEntries);
    }
    Ok(entries)
}

fn finish(entries: Vec<Utf8PathBuf>, graph: Graph, cx: RunCx) -> BuildRecord {
    BuildRecord {
        entries,
        graph,
        timings: cx.timings.lock().clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[tokio::test]
    async fn an_entry_is_required() {
        let builder = Builder::new();
        let entries: [&str; 0] = [];
        assert!(matches!(
            builder.build(entries).await,
            Err(BuildError::NoEntries)
        ));
    }

    #[tokio::test]
    async fn plugins_receive_the_builder() {
        let mut builder = Builder::new();
        builder.with_plugin(|builder| {
            builder.on_fn(Stage::Read, &["txt"], |_ctx| Ok(()));
        });
        // registration went through the plugin
        let record = builder.build(["/a.txt"]).await.unwrap();
        assert_eq!(record.entries, vec![Utf8PathBuf::from("/a.txt")]);
    }

    #[tokio::test]
    async fn records_carry_stage_timings() {
        let mut builder = Builder::new();
        builder.on_fn(Stage::Read, &["txt"], |_ctx| Ok(()));

        let record = builder.build(["/a.txt"]).await.unwrap();
        assert!(record.timings.get("analyze").is_some());
        assert!(record.timings.get("assemble").is_some());
        assert!(record.timings.get("read").is_some());

        let printed = record.timings.to_string();
        assert!(printed.contains("analyze"));
    }

    #[tokio::test]
    async fn observers_see_stage_events_in_order() {
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let mut builder = Builder::new();
        builder.on_fn(Stage::Read, &["txt"], |_ctx| Ok(()));
        {
            let seen = seen.clone();
            builder.observe(move |event| {
                if let BuildEvent::BeforeStage { stage, path } = event {
                    seen.lock().unwrap().push(format!("{stage}:{path}"));
                }
            });
        }

        builder.build(["/a.txt"]).await.unwrap();

        let seen = seen.lock().unwrap();
        let preread = seen.iter().position(|e| e == "preread:/a.txt").unwrap();
        let read = seen.iter().position(|e| e == "read:/a.txt").unwrap();
        let write = seen.iter().position(|e| e == "write:/a.txt").unwrap();
        assert!(preread < read && read < write);
    }

    #[test]
    fn blocking_wrapper_runs_a_full_build() {
        let processed = Arc::new(StdMutex::new(Vec::new()));

        let mut builder = Builder::new();
        {
            let processed = processed.clone();
            builder.on_fn(Stage::Write, &["txt"], move |ctx| {
                processed.lock().unwrap().push(ctx.path.clone());
                Ok(())
            });
        }

        builder.build_blocking(["/a.txt"]).unwrap();
        assert_eq!(*processed.lock().unwrap(), vec![Utf8PathBuf::from("/a.txt")]);
    }

    #[tokio::test]
    async fn a_predefined_graph_is_reused() {
        let mut graph = Graph::new();
        graph.add_node("/a.txt", true);
        graph.add_dependency("/a.txt", "/b.txt");

        let builder = Builder::with_graph(graph);
        let record = builder.analyze(["/a.txt"]).await.unwrap();
        assert!(record.graph.contains("/b.txt"));
    }
}
