//! End-to-end scheduler runs over small resolved graphs.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cellar_build::patch::PatchApplyError;
use cellar_build::{CancelToken, MemoryFetcher, NodeOutcome, RunOptions, Scheduler};
use cellar_core::{
    Arch, ArgRule, BuildContext, BuildGraph, BuildRecipe, CheckContext, DependencyKind,
    DependencyRef, Descriptor, InMemorySource, IntegrityHash, Locator, PackageId, Platform,
    RecipeError, SourceSpec, Version,
};
use cellar_store::{fingerprint_graph, Cellar, LocalBottleFeed, Provenance};

fn platform() -> Platform {
    Platform::new("catalina", Arch::X86_64)
}

fn options() -> RunOptions {
    RunOptions::new(platform()).jobs(4)
}

fn pkg(name: &str) -> PackageId {
    PackageId::new(name.parse().unwrap(), Version::new("1.0"))
}

fn noop_patcher() -> impl cellar_build::Patcher {
    |_: &[u8], _: &Path| Ok::<(), PatchApplyError>(())
}

/// Recipe that counts invocations and stages a marker file.
fn counting_recipe(counter: Arc<AtomicUsize>) -> Arc<dyn BuildRecipe> {
    Arc::new(move |ctx: &BuildContext| -> Result<(), RecipeError> {
        counter.fetch_add(1, Ordering::SeqCst);
        fs::write(ctx.staging_dir.join("built"), b"ok")?;
        Ok(())
    })
}

fn failing_recipe() -> Arc<dyn BuildRecipe> {
    Arc::new(|_: &BuildContext| -> Result<(), RecipeError> {
        Err(RecipeError::ExitStatus {
            step: "make".into(),
            status: 2,
        })
    })
}

/// Registers a payload for `name` with the fetcher and returns a
/// descriptor depending on `deps` at runtime kind.
fn descriptor(
    name: &str,
    fetcher: &mut MemoryFetcher,
    recipe: Arc<dyn BuildRecipe>,
    deps: &[&str],
) -> Descriptor {
    let url = format!("https://example.org/{name}.tar");
    let payload = format!("{name} sources");
    fetcher.insert(url.clone(), payload.clone().into_bytes());
    let mut desc = Descriptor::new(
        pkg(name),
        SourceSpec::new(Locator::new(url), IntegrityHash::of_bytes(payload.as_bytes())),
        recipe,
    );
    for dep in deps {
        desc = desc.with_dependency(DependencyRef::new(
            dep.parse().unwrap(),
            DependencyKind::Runtime,
        ));
    }
    desc
}

#[test]
fn diamond_builds_shared_dependency_once() {
    let cellar_dir = tempfile::tempdir().unwrap();
    let cellar = Cellar::open(cellar_dir.path()).unwrap();
    let mut fetcher = MemoryFetcher::new();
    let mut source = InMemorySource::new();

    let a_builds = Arc::new(AtomicUsize::new(0));
    source.insert(descriptor(
        "a",
        &mut fetcher,
        counting_recipe(Arc::clone(&a_builds)),
        &[],
    ));

    // b and c both read a's install root while building.
    for name in ["b", "c"] {
        let url = format!("https://example.org/{name}.tar");
        fetcher.insert(url.clone(), b"src".to_vec());
        source.insert(
            Descriptor::new(
                pkg(name),
                SourceSpec::new(Locator::new(url), IntegrityHash::of_bytes(b"src")),
                Arc::new(|ctx: &BuildContext| -> Result<(), RecipeError> {
                    let a_root = ctx
                        .dep_root(&"a".parse().unwrap())
                        .ok_or_else(|| RecipeError::Failed("missing dep root for a".into()))?;
                    if !a_root.join("built").exists() {
                        return Err(RecipeError::Failed("a not installed".into()));
                    }
                    fs::write(ctx.staging_dir.join("built"), b"ok")?;
                    Ok(())
                }),
            )
            .with_dependency(DependencyRef::new("a".parse().unwrap(), DependencyKind::Runtime)),
        );
    }

    let d_builds = Arc::new(AtomicUsize::new(0));
    let d = source.insert(descriptor(
        "d",
        &mut fetcher,
        counting_recipe(Arc::clone(&d_builds)),
        &["b", "c"],
    ));

    let graph = BuildGraph::resolve(&[d], &source, &platform()).unwrap();
    let patcher = noop_patcher();
    let report = Scheduler::new(&graph, &cellar, &fetcher, &patcher, options()).run();

    assert!(report.success(), "report: {report:?}");
    assert_eq!(a_builds.load(Ordering::SeqCst), 1);
    assert_eq!(d_builds.load(Ordering::SeqCst), 1);
    for name in ["a", "b", "c", "d"] {
        match report.outcome(&pkg(name)) {
            Some(NodeOutcome::Installed { provenance, .. }) => {
                assert_eq!(*provenance, Provenance::Built)
            }
            other => panic!("{name}: unexpected outcome {other:?}"),
        }
    }
}

#[test]
fn requesting_two_dependents_builds_shared_dep_once() {
    let cellar_dir = tempfile::tempdir().unwrap();
    let cellar = Cellar::open(cellar_dir.path()).unwrap();
    let mut fetcher = MemoryFetcher::new();
    let mut source = InMemorySource::new();

    let total = Arc::new(AtomicUsize::new(0));
    source.insert(descriptor(
        "a",
        &mut fetcher,
        counting_recipe(Arc::clone(&total)),
        &[],
    ));
    let b = source.insert(descriptor(
        "b",
        &mut fetcher,
        counting_recipe(Arc::clone(&total)),
        &["a"],
    ));
    let c = source.insert(descriptor(
        "c",
        &mut fetcher,
        counting_recipe(Arc::clone(&total)),
        &["a"],
    ));

    let graph = BuildGraph::resolve(&[b, c], &source, &platform()).unwrap();
    let patcher = noop_patcher();
    let report = Scheduler::new(&graph, &cellar, &fetcher, &patcher, options()).run();

    assert!(report.success());
    // a once, b once, c once, even though a is referenced twice.
    assert_eq!(total.load(Ordering::SeqCst), 3);
}

#[test]
fn second_run_is_all_cache_hits() {
    let cellar_dir = tempfile::tempdir().unwrap();
    let cellar = Cellar::open(cellar_dir.path()).unwrap();
    let mut fetcher = MemoryFetcher::new();
    let mut source = InMemorySource::new();

    let a_builds = Arc::new(AtomicUsize::new(0));
    let b_builds = Arc::new(AtomicUsize::new(0));
    source.insert(descriptor(
        "a",
        &mut fetcher,
        counting_recipe(Arc::clone(&a_builds)),
        &[],
    ));
    let b = source.insert(descriptor(
        "b",
        &mut fetcher,
        counting_recipe(Arc::clone(&b_builds)),
        &["a"],
    ));

    let graph = BuildGraph::resolve(&[b], &source, &platform()).unwrap();
    let patcher = noop_patcher();

    let first = Scheduler::new(&graph, &cellar, &fetcher, &patcher, options()).run();
    assert!(first.success());
    assert_eq!(a_builds.load(Ordering::SeqCst), 1);
    assert_eq!(b_builds.load(Ordering::SeqCst), 1);

    let second = Scheduler::new(&graph, &cellar, &fetcher, &patcher, options()).run();
    assert!(second.success());
    // No recipe runs again; roots come straight from the cellar.
    assert_eq!(a_builds.load(Ordering::SeqCst), 1);
    assert_eq!(b_builds.load(Ordering::SeqCst), 1);
}

#[test]
fn failure_skips_dependents_but_not_siblings() {
    let cellar_dir = tempfile::tempdir().unwrap();
    let cellar = Cellar::open(cellar_dir.path()).unwrap();
    let mut fetcher = MemoryFetcher::new();
    let mut source = InMemorySource::new();

    source.insert(descriptor(
        "a",
        &mut fetcher,
        counting_recipe(Arc::new(AtomicUsize::new(0))),
        &[],
    ));
    source.insert(descriptor("b", &mut fetcher, failing_recipe(), &["a"]));
    source.insert(descriptor(
        "c",
        &mut fetcher,
        counting_recipe(Arc::new(AtomicUsize::new(0))),
        &["a"],
    ));
    let d_builds = Arc::new(AtomicUsize::new(0));
    let d = source.insert(descriptor(
        "d",
        &mut fetcher,
        counting_recipe(Arc::clone(&d_builds)),
        &["b", "c"],
    ));

    let graph = BuildGraph::resolve(&[d], &source, &platform()).unwrap();
    let patcher = noop_patcher();
    let report = Scheduler::new(&graph, &cellar, &fetcher, &patcher, options()).run();

    assert!(!report.success());
    assert!(matches!(
        report.outcome(&pkg("a")),
        Some(NodeOutcome::Installed { .. })
    ));
    assert!(matches!(
        report.outcome(&pkg("c")),
        Some(NodeOutcome::Installed { .. })
    ));
    match report.outcome(&pkg("b")) {
        Some(NodeOutcome::Failed { stage, .. }) => {
            assert_eq!(*stage, cellar_build::BuildStage::Recipe)
        }
        other => panic!("b: unexpected outcome {other:?}"),
    }
    match report.outcome(&pkg("d")) {
        Some(NodeOutcome::Skipped { due_to: Some(dep) }) => assert_eq!(dep, &pkg("b")),
        other => panic!("d: unexpected outcome {other:?}"),
    }
    assert_eq!(d_builds.load(Ordering::SeqCst), 0);
}

#[test]
fn changed_args_rebuild_only_the_changed_subtree() {
    let cellar_dir = tempfile::tempdir().unwrap();
    let cellar = Cellar::open(cellar_dir.path()).unwrap();
    let mut fetcher = MemoryFetcher::new();

    let a_builds = Arc::new(AtomicUsize::new(0));
    let b_builds = Arc::new(AtomicUsize::new(0));

    let graph_with_args = |args: &[&str],
                           fetcher: &mut MemoryFetcher|
     -> BuildGraph {
        let mut source = InMemorySource::new();
        let a = source.insert(descriptor(
            "a",
            fetcher,
            counting_recipe(Arc::clone(&a_builds)),
            &[],
        ));
        let mut b = descriptor("b", fetcher, counting_recipe(Arc::clone(&b_builds)), &[]);
        if !args.is_empty() {
            b = b.with_args(ArgRule::always(args.iter().map(|s| s.to_string())));
        }
        let b = source.insert(b);
        BuildGraph::resolve(&[a, b], &source, &platform()).unwrap()
    };

    let patcher = noop_patcher();
    let first = graph_with_args(&["-release"], &mut fetcher);
    assert!(Scheduler::new(&first, &cellar, &fetcher, &patcher, options())
        .run()
        .success());
    assert_eq!(a_builds.load(Ordering::SeqCst), 1);
    assert_eq!(b_builds.load(Ordering::SeqCst), 1);

    // Different configure arguments give b a new fingerprint; a keeps
    // its cached root.
    let second = graph_with_args(&["-debug"], &mut fetcher);
    assert!(Scheduler::new(&second, &cellar, &fetcher, &patcher, options())
        .run()
        .success());
    assert_eq!(a_builds.load(Ordering::SeqCst), 1);
    assert_eq!(b_builds.load(Ordering::SeqCst), 2);
}

#[test]
fn bottles_satisfy_nodes_before_any_fetch() {
    let cellar_dir = tempfile::tempdir().unwrap();
    let cellar = Cellar::open(cellar_dir.path()).unwrap();
    let mut fetcher = MemoryFetcher::new();
    let mut source = InMemorySource::new();

    // zlib's source is deliberately absent from the fetcher: if the
    // scheduler tried to build it, the run would fail at fetch.
    let zlib_builds = Arc::new(AtomicUsize::new(0));
    source.insert(
        Descriptor::new(
            pkg("zlib"),
            SourceSpec::new(
                Locator::new("https://example.org/zlib.tar"),
                IntegrityHash::of_bytes(b"zlib sources"),
            ),
            counting_recipe(Arc::clone(&zlib_builds)),
        ),
    );
    let app = source.insert(
        Descriptor::new(
            pkg("app"),
            SourceSpec::new(
                Locator::new("https://example.org/app.tar"),
                IntegrityHash::of_bytes(b"app sources"),
            ),
            Arc::new(|ctx: &BuildContext| -> Result<(), RecipeError> {
                let zlib = ctx
                    .dep_root(&"zlib".parse().unwrap())
                    .ok_or_else(|| RecipeError::Failed("missing zlib root".into()))?;
                if !zlib.join("lib/libz.a").exists() {
                    return Err(RecipeError::Failed("bottled payload missing".into()));
                }
                fs::write(ctx.staging_dir.join("built"), b"ok")?;
                Ok(())
            }),
        )
        .with_dependency(DependencyRef::new(
            "zlib".parse().unwrap(),
            DependencyKind::Runtime,
        )),
    );
    fetcher.insert("https://example.org/app.tar", b"app sources".to_vec());

    let graph = BuildGraph::resolve(&[app], &source, &platform()).unwrap();
    let fingerprints = fingerprint_graph(&graph, &platform());

    let payload = tempfile::tempdir().unwrap();
    fs::create_dir_all(payload.path().join("lib")).unwrap();
    fs::write(payload.path().join("lib/libz.a"), b"archive").unwrap();
    let mut feed = LocalBottleFeed::new();
    feed.insert_dir(
        pkg("zlib"),
        platform().tag(),
        fingerprints[&pkg("zlib")],
        payload.path(),
    )
    .unwrap();

    let patcher = noop_patcher();
    let report = Scheduler::new(&graph, &cellar, &fetcher, &patcher, options())
        .with_bottles(&feed)
        .run();

    assert!(report.success(), "report: {report:?}");
    assert_eq!(zlib_builds.load(Ordering::SeqCst), 0);
    match report.outcome(&pkg("zlib")) {
        Some(NodeOutcome::Installed { provenance, .. }) => {
            assert_eq!(*provenance, Provenance::Bottled)
        }
        other => panic!("zlib: unexpected outcome {other:?}"),
    }
}

/// Spins until `flag` is set by another build, failing the recipe if
/// no progress is seen in time.
fn await_flag(flag: &AtomicBool) -> Result<(), RecipeError> {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !flag.load(Ordering::SeqCst) {
        if Instant::now() > deadline {
            return Err(RecipeError::Failed("other builds never progressed".into()));
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

#[test]
fn exclusive_builds_serialize_with_each_other() {
    let cellar_dir = tempfile::tempdir().unwrap();
    let cellar = Cellar::open(cellar_dir.path()).unwrap();
    let mut fetcher = MemoryFetcher::new();
    let mut source = InMemorySource::new();

    let exclusive_active = Arc::new(AtomicUsize::new(0));
    let exclusive_saw = Arc::new(AtomicUsize::new(0));

    let mut roots = Vec::new();
    for name in ["p1", "p2"] {
        roots.push(source.insert(descriptor(
            name,
            &mut fetcher,
            counting_recipe(Arc::new(AtomicUsize::new(0))),
            &[],
        )));
    }
    for name in ["qt-webengine", "qt-webkit"] {
        let exclusive_active = Arc::clone(&exclusive_active);
        let exclusive_saw = Arc::clone(&exclusive_saw);
        roots.push(source.insert(
            descriptor(
                name,
                &mut fetcher,
                Arc::new(move |ctx: &BuildContext| -> Result<(), RecipeError> {
                    let seen = exclusive_active.fetch_add(1, Ordering::SeqCst) + 1;
                    exclusive_saw.fetch_max(seen, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    fs::write(ctx.staging_dir.join("built"), b"ok")?;
                    exclusive_active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }),
                &[],
            )
            .exclusive_build(),
        ));
    }

    let graph = BuildGraph::resolve(&roots, &source, &platform()).unwrap();
    let patcher = noop_patcher();
    let report = Scheduler::new(&graph, &cellar, &fetcher, &patcher, options()).run();

    assert!(report.success());
    assert_eq!(
        exclusive_saw.load(Ordering::SeqCst),
        1,
        "two exclusive builds held the slot at once"
    );
}

#[test]
fn exclusive_build_does_not_stall_unrelated_subtrees() {
    let cellar_dir = tempfile::tempdir().unwrap();
    let cellar = Cellar::open(cellar_dir.path()).unwrap();
    let mut fetcher = MemoryFetcher::new();
    let mut source = InMemorySource::new();

    // The exclusive build refuses to finish until the unrelated
    // leaf -> app chain has completed, so the run only succeeds if
    // parallel-safe work keeps flowing while the slot is held.
    let chain_done = Arc::new(AtomicBool::new(false));
    let exclusive = {
        let chain_done = Arc::clone(&chain_done);
        source.insert(
            descriptor(
                "qt-webengine",
                &mut fetcher,
                Arc::new(move |ctx: &BuildContext| -> Result<(), RecipeError> {
                    await_flag(&chain_done)?;
                    fs::write(ctx.staging_dir.join("built"), b"ok")?;
                    Ok(())
                }),
                &[],
            )
            .exclusive_build(),
        )
    };
    source.insert(descriptor(
        "leaf",
        &mut fetcher,
        counting_recipe(Arc::new(AtomicUsize::new(0))),
        &[],
    ));
    let app = {
        let chain_done = Arc::clone(&chain_done);
        source.insert(descriptor(
            "app",
            &mut fetcher,
            Arc::new(move |ctx: &BuildContext| -> Result<(), RecipeError> {
                fs::write(ctx.staging_dir.join("built"), b"ok")?;
                chain_done.store(true, Ordering::SeqCst);
                Ok(())
            }),
            &["leaf"],
        ))
    };

    let graph = BuildGraph::resolve(&[exclusive, app], &source, &platform()).unwrap();
    let patcher = noop_patcher();
    let report = Scheduler::new(&graph, &cellar, &fetcher, &patcher, options()).run();

    assert!(report.success(), "report: {report:?}");
}

#[test]
fn early_finishers_advance_their_dependents_immediately() {
    let cellar_dir = tempfile::tempdir().unwrap();
    let cellar = Cellar::open(cellar_dir.path()).unwrap();
    let mut fetcher = MemoryFetcher::new();
    let mut source = InMemorySource::new();

    // "bulk" starts alongside "leaf" and only finishes once leaf's
    // dependent has been dispatched and built.
    let chain_done = Arc::new(AtomicBool::new(false));
    let bulk = {
        let chain_done = Arc::clone(&chain_done);
        source.insert(descriptor(
            "bulk",
            &mut fetcher,
            Arc::new(move |ctx: &BuildContext| -> Result<(), RecipeError> {
                await_flag(&chain_done)?;
                fs::write(ctx.staging_dir.join("built"), b"ok")?;
                Ok(())
            }),
            &[],
        ))
    };
    source.insert(descriptor(
        "leaf",
        &mut fetcher,
        counting_recipe(Arc::new(AtomicUsize::new(0))),
        &[],
    ));
    let app = {
        let chain_done = Arc::clone(&chain_done);
        source.insert(descriptor(
            "app",
            &mut fetcher,
            Arc::new(move |ctx: &BuildContext| -> Result<(), RecipeError> {
                fs::write(ctx.staging_dir.join("built"), b"ok")?;
                chain_done.store(true, Ordering::SeqCst);
                Ok(())
            }),
            &["leaf"],
        ))
    };

    let graph = BuildGraph::resolve(&[bulk, app], &source, &platform()).unwrap();
    let patcher = noop_patcher();
    let report = Scheduler::new(&graph, &cellar, &fetcher, &patcher, options()).run();

    assert!(report.success(), "report: {report:?}");
}

#[test]
fn cancellation_skips_everything_not_yet_started() {
    let cellar_dir = tempfile::tempdir().unwrap();
    let cellar = Cellar::open(cellar_dir.path()).unwrap();
    let mut fetcher = MemoryFetcher::new();
    let mut source = InMemorySource::new();

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        source.insert(descriptor(
            "a",
            &mut fetcher,
            Arc::new(move |ctx: &BuildContext| -> Result<(), RecipeError> {
                fs::write(ctx.staging_dir.join("built"), b"ok")?;
                cancel.cancel();
                Ok(())
            }),
            &[],
        ));
    }
    source.insert(descriptor(
        "b",
        &mut fetcher,
        counting_recipe(Arc::new(AtomicUsize::new(0))),
        &["a"],
    ));
    let c = source.insert(descriptor(
        "c",
        &mut fetcher,
        counting_recipe(Arc::new(AtomicUsize::new(0))),
        &["b"],
    ));

    let graph = BuildGraph::resolve(&[c], &source, &platform()).unwrap();
    let patcher = noop_patcher();
    let report =
        Scheduler::new(&graph, &cellar, &fetcher, &patcher, options()).run_with(&cancel);

    assert!(!report.success());
    assert!(matches!(
        report.outcome(&pkg("a")),
        Some(NodeOutcome::Installed { .. })
    ));
    for name in ["b", "c"] {
        match report.outcome(&pkg(name)) {
            Some(NodeOutcome::Skipped { due_to: None }) => {}
            other => panic!("{name}: unexpected outcome {other:?}"),
        }
    }
}

#[test]
fn check_results_are_advisory() {
    let cellar_dir = tempfile::tempdir().unwrap();
    let cellar = Cellar::open(cellar_dir.path()).unwrap();
    let mut fetcher = MemoryFetcher::new();
    let mut source = InMemorySource::new();

    let good = source.insert(
        descriptor(
            "good",
            &mut fetcher,
            counting_recipe(Arc::new(AtomicUsize::new(0))),
            &[],
        )
        .with_check(Arc::new(|ctx: &CheckContext| -> Result<(), RecipeError> {
            if ctx.install_root.join("built").exists() {
                Ok(())
            } else {
                Err(RecipeError::Failed("marker missing".into()))
            }
        })),
    );
    let bad = source.insert(
        descriptor(
            "flaky",
            &mut fetcher,
            counting_recipe(Arc::new(AtomicUsize::new(0))),
            &[],
        )
        .with_check(Arc::new(|_: &CheckContext| -> Result<(), RecipeError> {
            Err(RecipeError::ExitStatus {
                step: "smoke test".into(),
                status: 1,
            })
        })),
    );

    let graph = BuildGraph::resolve(&[good, bad], &source, &platform()).unwrap();
    let patcher = noop_patcher();
    let report = Scheduler::new(&graph, &cellar, &fetcher, &patcher, options()).run();

    // A failed check never fails the run or unpublishes the root.
    assert!(report.success());
    assert_eq!(report.tests.len(), 2);
    assert!(report.test_outcome(&pkg("good")).unwrap().passed());
    assert!(!report.test_outcome(&pkg("flaky")).unwrap().passed());
}

#[test]
fn check_recipes_reach_test_dependency_roots() {
    let cellar_dir = tempfile::tempdir().unwrap();
    let cellar = Cellar::open(cellar_dir.path()).unwrap();
    let mut fetcher = MemoryFetcher::new();
    let mut source = InMemorySource::new();

    let runner_builds = Arc::new(AtomicUsize::new(0));
    source.insert(descriptor(
        "test-runner",
        &mut fetcher,
        counting_recipe(Arc::clone(&runner_builds)),
        &[],
    ));
    let lib = source.insert(
        descriptor(
            "lib",
            &mut fetcher,
            counting_recipe(Arc::new(AtomicUsize::new(0))),
            &[],
        )
        .with_dependency(DependencyRef::new(
            "test-runner".parse().unwrap(),
            DependencyKind::Test,
        ))
        .with_check(Arc::new(|ctx: &CheckContext| -> Result<(), RecipeError> {
            let runner = ctx
                .dep_root(&"test-runner".parse().unwrap())
                .ok_or_else(|| RecipeError::Failed("test dependency root missing".into()))?;
            if runner.join("built").exists() {
                Ok(())
            } else {
                Err(RecipeError::Failed("runner payload missing".into()))
            }
        })),
    );

    let graph = BuildGraph::resolve(&[lib], &source, &platform()).unwrap();
    let patcher = noop_patcher();
    let report = Scheduler::new(&graph, &cellar, &fetcher, &patcher, options()).run();

    assert!(report.success(), "report: {report:?}");
    assert_eq!(runner_builds.load(Ordering::SeqCst), 1);
    assert!(report.test_outcome(&pkg("lib")).unwrap().passed());
}
