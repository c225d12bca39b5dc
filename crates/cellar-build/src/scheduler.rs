//! Dependency-ordered parallel dispatch.
//!
//! Every pending node whose build-constraining dependencies are all
//! installed is ready. Ready nodes are spawned onto a bounded worker
//! pool the moment they become ready: when a node finishes, its
//! dependents are examined and dispatched immediately, so one slow
//! build never holds back an unrelated subtree. Nodes flagged as not
//! parallel-safe contend for a single global build slot, serializing
//! with each other while parallel-safe builds keep running alongside.
//!
//! Before any source is fetched, the whole graph is fingerprinted and
//! swept against the cellar and the bottle feed, so cache hits and
//! bottle installs satisfy dependents without touching the network.
//!
//! A node failure fails only that node; dependents are skipped with
//! the failing dependency named, and independent subtrees keep
//! building. Cancellation is cooperative: in-flight builds finish,
//! nothing new starts. Check recipes run after dispatch settles, once
//! every test dependency has had its chance to install.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::Scope;
use tracing::{debug, info, warn};

use cellar_core::{BuildGraph, DependencyKind, PackageId, PackageName};
use cellar_store::{
    fingerprint_graph, install_bottle, BottleFeed, Cellar, Fingerprint, InstallRoot, NoBottles,
};

use crate::error::BuildStage;
use crate::executor::Executor;
use crate::fetch::Fetcher;
use crate::patch::Patcher;
use crate::report::{NodeOutcome, NodeReport, RunReport};
use crate::verifier::Verifier;
use crate::RunOptions;

static NO_BOTTLES: NoBottles = NoBottles;

/// Cooperative cancellation handle, cloneable across threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress of one node during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Ready,
    Building,
    Installed(InstallRoot),
    Failed { stage: BuildStage, reason: String },
    Skipped { due_to: Option<PackageId> },
}

/// State shared between the coordinator and the workers.
struct RunShared {
    states: Mutex<HashMap<PackageId, NodeState>>,
    /// The single global slot for non-parallel-safe builds.
    slot: Mutex<()>,
}

/// Drives a resolved graph to completion.
pub struct Scheduler<'a> {
    graph: &'a BuildGraph,
    cellar: &'a Cellar,
    fetcher: &'a dyn Fetcher,
    patcher: &'a dyn Patcher,
    bottles: &'a dyn BottleFeed,
    options: RunOptions,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        graph: &'a BuildGraph,
        cellar: &'a Cellar,
        fetcher: &'a dyn Fetcher,
        patcher: &'a dyn Patcher,
        options: RunOptions,
    ) -> Self {
        Scheduler {
            graph,
            cellar,
            fetcher,
            patcher,
            bottles: &NO_BOTTLES,
            options,
        }
    }

    pub fn with_bottles(mut self, bottles: &'a dyn BottleFeed) -> Self {
        self.bottles = bottles;
        self
    }

    /// Runs the whole graph to a terminal state.
    pub fn run(&self) -> RunReport {
        self.run_with(&CancelToken::new())
    }

    /// Like [`run`](Self::run), but observing an external cancellation
    /// token between node starts.
    pub fn run_with(&self, cancel: &CancelToken) -> RunReport {
        info!(
            nodes = self.graph.len(),
            jobs = self.options.jobs,
            platform = %self.options.platform.tag(),
            "starting run"
        );
        let fingerprints = fingerprint_graph(self.graph, &self.options.platform);
        let mut initial: HashMap<PackageId, NodeState> = self
            .graph
            .topo_order()
            .iter()
            .map(|id| (id.clone(), NodeState::Pending))
            .collect();
        self.prepopulate(&fingerprints, &mut initial);
        let prepopulated: HashSet<PackageId> = initial
            .iter()
            .filter(|(_, state)| matches!(state, NodeState::Installed(_)))
            .map(|(id, _)| id.clone())
            .collect();

        let shared = RunShared {
            states: Mutex::new(initial),
            slot: Mutex::new(()),
        };
        let executor = Executor::new(self.cellar, self.fetcher, self.patcher, &self.options);

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.jobs)
            .build()
        {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!(error = %err, "worker pool unavailable, building sequentially");
                None
            }
        };
        match &pool {
            Some(pool) => pool.scope(|scope| {
                let ready = self.claim_ready(&mut shared.states.lock());
                for id in ready {
                    self.spawn_node(scope, id, &executor, &fingerprints, &shared, cancel);
                }
            }),
            None => self.run_sequential(&executor, &fingerprints, &shared, cancel),
        }

        let mut states = shared.states.into_inner();
        // Anything not yet terminal was cut off by cancellation.
        for state in states.values_mut() {
            if matches!(
                state,
                NodeState::Pending | NodeState::Ready | NodeState::Building
            ) {
                *state = NodeState::Skipped { due_to: None };
            }
        }

        let tests = self.run_checks(&states, &prepopulated);

        let nodes = self
            .graph
            .topo_order()
            .iter()
            .map(|id| {
                let outcome = match states.remove(id) {
                    Some(NodeState::Installed(root)) => NodeOutcome::Installed {
                        provenance: root.provenance,
                        path: root.path,
                    },
                    Some(NodeState::Failed { stage, reason }) => {
                        NodeOutcome::Failed { stage, reason }
                    }
                    Some(NodeState::Skipped { due_to }) => NodeOutcome::Skipped { due_to },
                    _ => NodeOutcome::Skipped { due_to: None },
                };
                NodeReport {
                    id: id.clone(),
                    fingerprint: fingerprints[id],
                    outcome,
                    keg_only: self
                        .graph
                        .descriptor(id)
                        .and_then(|d| d.keg_only.clone()),
                }
            })
            .collect();
        let report = RunReport {
            roots: self.graph.roots().to_vec(),
            nodes,
            tests,
        };
        info!(success = report.success(), "run finished");
        report
    }

    /// Satisfies nodes from the cellar and the bottle feed, providers
    /// first, before anything is fetched or built.
    fn prepopulate(
        &self,
        fingerprints: &BTreeMap<PackageId, Fingerprint>,
        states: &mut HashMap<PackageId, NodeState>,
    ) {
        for id in self.graph.topo_order() {
            let fingerprint = &fingerprints[id];
            if let Some(root) = self.cellar.lookup(fingerprint) {
                debug!(package = %id, %fingerprint, "cache hit");
                states.insert(id.clone(), NodeState::Installed(root));
                continue;
            }
            let tag = self.options.platform.tag();
            if let Some(bottle) = self.bottles.bottle(id, fingerprint, &tag) {
                match install_bottle(self.cellar, id, fingerprint, &bottle) {
                    Ok(root) => {
                        info!(package = %id, %fingerprint, "installed from bottle");
                        states.insert(id.clone(), NodeState::Installed(root));
                    }
                    Err(err) => {
                        warn!(package = %id, error = %err, "bottle rejected, will build from source");
                    }
                }
            }
        }
    }

    fn spawn_node<'s>(
        &'s self,
        scope: &Scope<'s>,
        id: PackageId,
        executor: &'s Executor<'_>,
        fingerprints: &'s BTreeMap<PackageId, Fingerprint>,
        shared: &'s RunShared,
        cancel: &'s CancelToken,
    ) {
        scope.spawn(move |scope| {
            for next in self.run_node(&id, executor, fingerprints, shared, cancel) {
                self.spawn_node(scope, next, executor, fingerprints, shared, cancel);
            }
        });
    }

    fn run_sequential(
        &self,
        executor: &Executor<'_>,
        fingerprints: &BTreeMap<PackageId, Fingerprint>,
        shared: &RunShared,
        cancel: &CancelToken,
    ) {
        let mut queue: VecDeque<PackageId> =
            self.claim_ready(&mut shared.states.lock()).into();
        while let Some(id) = queue.pop_front() {
            queue.extend(self.run_node(&id, executor, fingerprints, shared, cancel));
        }
    }

    /// Builds one node and returns the dependents it made ready.
    fn run_node(
        &self,
        id: &PackageId,
        executor: &Executor<'_>,
        fingerprints: &BTreeMap<PackageId, Fingerprint>,
        shared: &RunShared,
        cancel: &CancelToken,
    ) -> Vec<PackageId> {
        if cancel.is_cancelled() {
            return Vec::new();
        }
        let descriptor = self
            .graph
            .descriptor(id)
            .expect("scheduled nodes are resolved");
        let dep_roots = {
            let mut states = shared.states.lock();
            states.insert(id.clone(), NodeState::Building);
            self.dep_roots(id, &states)
        };

        // Non-parallel-safe builds contend for the single global slot;
        // parallel-safe nodes never touch it.
        let _slot = descriptor.exclusive_build.then(|| shared.slot.lock());
        let state = match executor.execute(descriptor, &fingerprints[id], &dep_roots) {
            Ok(root) => NodeState::Installed(root),
            Err(err) => {
                warn!(package = %id, stage = %err.stage(), error = %err, "build failed");
                NodeState::Failed {
                    stage: err.stage(),
                    reason: err.to_string(),
                }
            }
        };

        let mut states = shared.states.lock();
        let failed = matches!(state, NodeState::Failed { .. });
        states.insert(id.clone(), state);
        if failed {
            self.skip_dependents(id, &mut states);
            Vec::new()
        } else {
            self.claim_ready_dependents(id, &mut states)
        }
    }

    /// Marks every pending node with all build-constraining
    /// dependencies installed as ready, returning them.
    fn claim_ready(&self, states: &mut HashMap<PackageId, NodeState>) -> Vec<PackageId> {
        let ready: Vec<PackageId> = self
            .graph
            .topo_order()
            .iter()
            .filter(|id| states[*id] == NodeState::Pending)
            .filter(|id| {
                self.graph
                    .build_dependencies_of(id)
                    .iter()
                    .all(|dep| matches!(states[dep], NodeState::Installed(_)))
            })
            .cloned()
            .collect();
        for id in &ready {
            states.insert(id.clone(), NodeState::Ready);
        }
        ready
    }

    /// Direct dependents of a just-installed node that became ready.
    fn claim_ready_dependents(
        &self,
        id: &PackageId,
        states: &mut HashMap<PackageId, NodeState>,
    ) -> Vec<PackageId> {
        let mut dependents: Vec<PackageId> = self
            .graph
            .dependents_of(id)
            .into_iter()
            .filter(|(_, kind)| kind.constrains_build())
            .map(|(dependent, _)| dependent)
            .collect();
        dependents.sort();
        dependents.dedup();
        dependents.retain(|dependent| {
            states[dependent] == NodeState::Pending
                && self
                    .graph
                    .build_dependencies_of(dependent)
                    .iter()
                    .all(|dep| matches!(states[dep], NodeState::Installed(_)))
        });
        for dependent in &dependents {
            states.insert(dependent.clone(), NodeState::Ready);
        }
        dependents
    }

    /// Marks every pending node downstream of a failure as skipped,
    /// naming the blocking dependency.
    fn skip_dependents(&self, failed: &PackageId, states: &mut HashMap<PackageId, NodeState>) {
        let mut queue = VecDeque::from([failed.clone()]);
        while let Some(blocked) = queue.pop_front() {
            for (dependent, kind) in self.graph.dependents_of(&blocked) {
                if !kind.constrains_build() || states[&dependent] != NodeState::Pending {
                    continue;
                }
                debug!(package = %dependent, due_to = %blocked, "skipping");
                states.insert(
                    dependent.clone(),
                    NodeState::Skipped {
                        due_to: Some(blocked.clone()),
                    },
                );
                queue.push_back(dependent);
            }
        }
    }

    /// Runs check recipes for every node installed during this run,
    /// with its runtime and test dependency roots resolved.
    fn run_checks(
        &self,
        states: &HashMap<PackageId, NodeState>,
        prepopulated: &HashSet<PackageId>,
    ) -> Vec<crate::verifier::TestReport> {
        let verifier = Verifier::new(&self.options);
        let mut tests = Vec::new();
        for id in self.graph.topo_order() {
            if prepopulated.contains(id) {
                continue;
            }
            let Some(NodeState::Installed(root)) = states.get(id) else {
                continue;
            };
            let descriptor = self
                .graph
                .descriptor(id)
                .expect("scheduled nodes are resolved");
            let check_roots = self.check_dep_roots(id, states);
            if let Some(report) = verifier.verify(descriptor, root, &check_roots) {
                tests.push(report);
            }
        }
        tests
    }

    fn dep_roots(
        &self,
        id: &PackageId,
        states: &HashMap<PackageId, NodeState>,
    ) -> BTreeMap<PackageName, PathBuf> {
        self.graph
            .build_dependencies_of(id)
            .into_iter()
            .filter_map(|dep| match &states[&dep] {
                NodeState::Installed(root) => Some((dep.name, root.path.clone())),
                _ => None,
            })
            .collect()
    }

    fn check_dep_roots(
        &self,
        id: &PackageId,
        states: &HashMap<PackageId, NodeState>,
    ) -> BTreeMap<PackageName, PathBuf> {
        self.graph
            .dependencies_of(id)
            .into_iter()
            .filter(|(_, kind)| !matches!(kind, DependencyKind::Build))
            .filter_map(|(dep, _)| match states.get(&dep) {
                Some(NodeState::Installed(root)) => Some((dep.name, root.path.clone())),
                _ => None,
            })
            .collect()
    }
}
