//! Assembly phase: emit build artifacts in dependency order.
//!
//! Works on an isolated clone of the analysis graph so that anything the
//! write stages add (a minified variant, a compressed sibling) cannot leak
//! back into the graph the next analysis pass will reuse.

use std::collections::HashSet;
use std::sync::Arc;

use camino::Utf8PathBuf;
use parking_lot::Mutex;
use tracing::debug;

use crate::builder::{BuildEvent, RunCx};
use crate::error::BuildError;
use crate::graph::{Graph, SharedGraph};
use crate::hooks::Stage;
use crate::queue::TaskQueue;

pub(crate) async fn run(
    cx: &RunCx,
    live: &SharedGraph,
    entries: &[Utf8PathBuf],
) -> Result<Graph, BuildError> {
    debug!("assembling {entries:?}");

    let graph: SharedGraph = {
        let mut clone = live.lock().clone();
        // cycles are legal during analysis, but a topological order needs an
        // acyclic view; prune afterwards so stale files from earlier builds
        // cost nothing
        clone.remove_cycles();
        clone.prune(entries);
        Arc::new(Mutex::new(clone))
    };

    // postdependencies must run one file at a time: handlers may add or
    // remove dependency edges and unroll them into the graph, and interleaved
    // mutation would race
    let order = graph.lock().topological_order()?;
    for path in order {
        cx.run_stage(&graph, Stage::Postdependencies, &path).await?;
    }

    // prewrite handlers may add brand-new files; keep re-polling the node
    // list until the processed set covers the whole graph
    let mut prewritten: HashSet<Utf8PathBuf> = HashSet::new();
    loop {
        let fresh: Vec<Utf8PathBuf> = graph
            .lock()
            .topological_order()?
            .into_iter()
            .filter(|path| !prewritten.contains(path))
            .collect();
        if fresh.is_empty() {
            break;
        }
        for path in fresh {
            prewritten.insert(path.clone());
            cx.events.emit(BuildEvent::BeforeAssemble { path: path.clone() });
            cx.run_stage(&graph, Stage::Prewrite, &path).await?;
        }
    }

    // the order-sensitive stages are done; write and postwrite only emit
    // per-file output, so they share the bounded-concurrency queue
    let queue = {
        let cx = cx.clone();
        let graph = graph.clone();
        TaskQueue::<Utf8PathBuf, BuildError>::new(cx.concurrency, move |path, _| {
            let cx = cx.clone();
            let graph = graph.clone();
            async move {
                cx.run_stage(&graph, Stage::Write, &path).await?;
                cx.run_stage(&graph, Stage::Postwrite, &path).await?;
                cx.events.emit(BuildEvent::AfterAssemble { path });
                Ok(())
            }
        })
    };

    // fetch the list again: prewrite may have changed it
    for path in graph.lock().topological_order()? {
        queue.add(path);
    }
    queue.run().await?;

    let assembled = graph.lock().clone();
    Ok(assembled)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::builder::Builder;

    type Log = Arc<StdMutex<Vec<String>>>;

    /// a -> b -> c chain declared through the dependencies hook.
    fn chain_builder() -> Builder {
        let mut builder = Builder::new();
        builder.on_fn(Stage::Dependencies, &["txt"], |ctx| {
            let mut graph = ctx.graph();
            match ctx.path.as_str() {
                "/a.txt" => graph.add_dependency("/a.txt", "/b.txt"),
                "/b.txt" => graph.add_dependency("/b.txt", "/c.txt"),
                _ => {}
            }
            Ok(())
        });
        builder
    }

    #[tokio::test]
    async fn writes_happen_bottom_up() {
        let log: Log = Default::default();
        let mut builder = chain_builder();
        {
            let log = log.clone();
            builder.on_fn(Stage::Write, &["txt"], move |ctx| {
                log.lock().unwrap().push(ctx.path.to_string());
                Ok(())
            });
        }

        builder.build(["/a.txt"]).await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["/c.txt", "/b.txt", "/a.txt"]);
    }

    #[tokio::test]
    async fn postdependencies_run_strictly_sequentially() {
        let log: Log = Default::default();
        let mut builder = chain_builder();
        {
            let log = log.clone();
            builder.on(Stage::Postdependencies, &["txt"], move |ctx| {
                let log = log.clone();
                async move {
                    // staggered so that parallel execution would finish in
                    // the wrong order
                    let delay = match ctx.path.as_str() {
                        "/a.txt" => 1,
                        "/b.txt" => 10,
                        _ => 25,
                    };
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    log.lock().unwrap().push(ctx.path.to_string());
                    Ok(())
                }
            });
        }

        builder.build(["/a.txt"]).await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["/c.txt", "/b.txt", "/a.txt"]);
    }

    #[tokio::test]
    async fn write_stages_run_in_order_per_file() {
        let log: Log = Default::default();
        let mut builder = Builder::new();
        for stage in [Stage::Prewrite, Stage::Write, Stage::Postwrite] {
            let log = log.clone();
            builder.on_fn(stage, &["txt"], move |_ctx| {
                log.lock().unwrap().push(stage.name().to_string());
                Ok(())
            });
        }

        builder.build(["/a.txt"]).await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["prewrite", "write", "postwrite"]);
    }

    #[tokio::test]
    async fn prewrite_may_add_derived_files() {
        let log: Log = Default::default();
        let mut builder = Builder::new();
        builder.on_fn(Stage::Prewrite, &["txt"], |ctx| {
            let derived = Utf8PathBuf::from(format!("{}.gz", ctx.path));
            ctx.graph().add_node(derived, false);
            Ok(())
        });
        {
            let log = log.clone();
            builder.on_fn(Stage::Write, &["txt", "gz"], move |ctx| {
                log.lock().unwrap().push(ctx.path.to_string());
                Ok(())
            });
        }

        let record = builder.build(["/a.txt"]).await.unwrap();

        // the compressed sibling went through prewrite polling and write
        let written = log.lock().unwrap().clone();
        assert!(written.contains(&"/a.txt".to_string()));
        assert!(written.contains(&"/a.txt.gz".to_string()));
        assert!(record.graph.contains("/a.txt.gz"));
    }

    #[tokio::test]
    async fn assembly_mutations_do_not_leak_into_the_live_graph() {
        let mut builder = Builder::new();
        builder.on_fn(Stage::Prewrite, &["txt"], |ctx| {
            let derived = Utf8PathBuf::from(format!("{}.gz", ctx.path));
            ctx.graph().add_node(derived, false);
            Ok(())
        });

        let record = builder.build(["/a.txt"]).await.unwrap();
        assert!(record.graph.contains("/a.txt.gz"));

        let live = builder.graph();
        assert!(!live.lock().contains("/a.txt.gz"));
    }

    #[tokio::test]
    async fn orphans_are_not_assembled() {
        let log: Log = Default::default();

        let mut graph = Graph::new();
        graph.add_node("/a.txt", true);
        graph.add_node("/stale.txt", false);

        let mut builder = Builder::with_graph(graph);
        {
            let log = log.clone();
            builder.on_fn(Stage::Write, &["txt"], move |ctx| {
                log.lock().unwrap().push(ctx.path.to_string());
                Ok(())
            });
        }

        builder.build(["/a.txt"]).await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["/a.txt"]);

        // pruning happened on the assembly clone only
        let live = builder.graph();
        assert!(live.lock().contains("/stale.txt"));
    }

    #[tokio::test]
    async fn cyclic_graphs_still_assemble_every_file() {
        let log: Log = Default::default();
        let mut builder = Builder::new();
        builder.on_fn(Stage::Dependencies, &["txt"], |ctx| {
            let mut graph = ctx.graph();
            match ctx.path.as_str() {
                "/a.txt" => graph.add_dependency("/a.txt", "/b.txt"),
                "/b.txt" => graph.add_dependency("/b.txt", "/c.txt"),
                // circular back to b
                "/c.txt" => graph.add_dependency("/c.txt", "/b.txt"),
                _ => {}
            }
            Ok(())
        });
        {
            let log = log.clone();
            builder.on_fn(Stage::Write, &["txt"], move |ctx| {
                log.lock().unwrap().push(ctx.path.to_string());
                Ok(())
            });
        }

        builder.build(["/a.txt"]).await.unwrap();
        let mut written = log.lock().unwrap().clone();
        written.sort();
        assert_eq!(written, ["/a.txt", "/b.txt", "/c.txt"]);
    }

    #[tokio::test]
    async fn assemble_events_fire_per_file_in_dependency_order() {
        let log: Log = Default::default();
        let mut builder = chain_builder();
        {
            let log = log.clone();
            builder.observe(move |event| {
                if let BuildEvent::AfterAssemble { path } = event {
                    log.lock().unwrap().push(path.to_string());
                }
            });
        }

        builder.build(["/a.txt"]).await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["/c.txt", "/b.txt", "/a.txt"]);
    }

    #[tokio::test]
    async fn a_failing_write_aborts_the_build() {
        let mut builder = chain_builder();
        builder.on_fn(Stage::Write, &["txt"], |ctx| {
            if ctx.path == "/b.txt" {
                anyhow::bail!("disk full");
            }
            Ok(())
        });

        let err = builder.build(["/a.txt"]).await.unwrap_err();
        match err {
            BuildError::Hook(Stage::Write, path, source) => {
                assert_eq!(path, "/b.txt");
                assert_eq!(source.to_string(), "disk full");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
