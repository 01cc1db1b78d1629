//! Analysis phase: populate the dependency graph for a set of entries.
//!
//! Each file runs the five analysis stages at most once per "dirty" cycle,
//! then its discovered dependencies are fed back into the task queue. The
//! graph may be cyclic; the visited set and the per-node `analyzing` flag
//! together guarantee termination on diamonds and cycles alike.

use std::collections::HashSet;
use std::sync::Arc;

use camino::Utf8PathBuf;
use parking_lot::Mutex;
use tracing::debug;

use crate::builder::{BuildEvent, RunCx};
use crate::error::BuildError;
use crate::graph::SharedGraph;
use crate::hooks::Stage;
use crate::node::FileNode;
use crate::queue::{Injector, TaskQueue};

type Visited = Arc<Mutex<HashSet<Utf8PathBuf>>>;

pub(crate) async fn run(
    cx: &RunCx,
    graph: &SharedGraph,
    entries: &[Utf8PathBuf],
) -> Result<(), BuildError> {
    debug!("analyzing {entries:?}");

    let visited: Visited = Arc::new(Mutex::new(HashSet::new()));

    // seed entry nodes up front so the entry flag is set on first sight
    {
        let mut graph = graph.lock();
        for entry in entries {
            graph.add_node(entry.clone(), true);
        }
    }

    let queue = {
        let cx = cx.clone();
        let graph = graph.clone();
        let visited = visited.clone();
        TaskQueue::<Utf8PathBuf, BuildError>::new(cx.concurrency, move |path, injector| {
            analyze_file(cx.clone(), graph.clone(), visited.clone(), path, injector)
        })
    };

    for entry in entries {
        queue.add(entry.clone());
    }
    queue.run().await?;

    // Invalidated files that are no longer reachable from the requested
    // entries would otherwise be skipped silently; sweep for them until the
    // graph settles.
    loop {
        let known: Vec<Utf8PathBuf> = {
            let graph = graph.lock();
            graph
                .nodes()
                .filter(|node| !node.is_analyzed())
                .map(|node| node.path.clone())
                .collect()
        };
        let stale: Vec<Utf8PathBuf> = {
            let visited = visited.lock();
            known
                .into_iter()
                .filter(|path| !visited.contains(path))
                .collect()
        };
        if stale.is_empty() {
            break;
        }

        debug!("re-analyzing {} stale files", stale.len());
        for path in stale {
            queue.add(path);
        }
        queue.run().await?;
    }

    Ok(())
}

/// Analyze one file: the guarded stage sequence followed by dependency
/// recursion via the queue.
async fn analyze_file(
    cx: RunCx,
    graph: SharedGraph,
    visited: Visited,
    path: Utf8PathBuf,
    injector: Injector<Utf8PathBuf>,
) -> Result<(), BuildError> {
    {
        let mut graph = graph.lock();
        let node = graph.add_node(path.clone(), false);
        if node.is_analyzing() {
            // another traversal is already inside this file's sequence
            return Ok(());
        }
        if !visited.lock().insert(path.clone()) {
            return Ok(());
        }
    }

    cx.events.emit(BuildEvent::BeforeAnalyze { path: path.clone() });

    // preread always runs, even for files analyzed in an earlier call; it is
    // the designated invalidation check and may clear the analyzed flag
    cx.run_stage(&graph, Stage::Preread, &path).await?;

    // claim the stage sequence atomically so concurrent traversals of the
    // same file cannot run it twice
    let claimed = {
        let mut graph = graph.lock();
        match graph.get_mut(&path) {
            Some(node) if !node.is_analyzed() && !node.is_analyzing() => {
                node.set_analyzing(true);
                true
            }
            _ => false,
        }
    };

    if claimed {
        let result = async {
            cx.run_stage(&graph, Stage::Read, &path).await?;
            cx.run_stage(&graph, Stage::Postread, &path).await?;
            cx.run_stage(&graph, Stage::Predependencies, &path).await?;
            cx.run_stage(&graph, Stage::Dependencies, &path).await
        }
        .await;

        {
            let mut graph = graph.lock();
            if let Some(node) = graph.get_mut(&path) {
                match &result {
                    Ok(()) => node.set_analyzed(),
                    Err(_) => {
                        // a failed file must look neither in-progress nor done
                        node.set_analyzing(false);
                        node.invalidate();
                    }
                }
            }
        }
        result?;
    }

    // recurse into the current dependency edges, skipping anything already
    // in flight or already visited by this call
    let dependencies = graph.lock().dependencies_of(&path);
    {
        let graph = graph.lock();
        let visited = visited.lock();
        for dependency in dependencies {
            let analyzing = graph
                .get(&dependency)
                .map(FileNode::is_analyzing)
                .unwrap_or(false);
            if !analyzing && !visited.contains(&dependency) {
                injector.add(dependency);
            }
        }
    }

    cx.events.emit(BuildEvent::AfterAnalyze { path });
    Ok(())
}
