//! The build graph: descriptors connected by typed dependency edges.
//!
//! [`BuildGraph::resolve`] is a pure function over the requested
//! descriptors plus resolver queries. It applies platform-conditional
//! filtering before edge creation, enforces one concrete version per
//! name, and rejects cycles among build-time/runtime edges before any
//! build closure can execute. The topological order is captured at
//! resolution time and reused by fingerprinting and scheduling.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::{EdgeFiltered, EdgeRef};
use petgraph::{Directed, Direction};

use crate::descriptor::{DependencyKind, Descriptor, DescriptorSource};
use crate::error::CoreError;
use crate::id::PackageId;
use crate::platform::Platform;

/// DAG of descriptors. Edges point from consumer to provider.
#[derive(Debug)]
pub struct BuildGraph {
    graph: StableGraph<Arc<Descriptor>, DependencyKind, Directed, u32>,
    index: HashMap<PackageId, NodeIndex<u32>>,
    roots: Vec<PackageId>,
    /// Providers-first topological order over build-constraining edges.
    topo: Vec<PackageId>,
}

impl BuildGraph {
    /// Resolves a requested descriptor set into a build graph.
    ///
    /// Transitively referenced descriptors are fetched by name from
    /// `source`. Dependency references whose platform predicate does
    /// not match are dropped before edge creation. Fails with
    /// [`CoreError::Cycle`] or [`CoreError::VersionConflict`] without
    /// side effects.
    pub fn resolve(
        requested: &[Arc<Descriptor>],
        source: &dyn DescriptorSource,
        platform: &Platform,
    ) -> Result<Self, CoreError> {
        let mut graph = StableGraph::<Arc<Descriptor>, DependencyKind, Directed, u32>::new();
        let mut by_name = HashMap::new();
        let mut index = HashMap::new();
        let mut roots = Vec::new();
        let mut queue = Vec::new();

        for desc in requested {
            match by_name.get(&desc.id.name) {
                None => {
                    let idx = graph.add_node(Arc::clone(desc));
                    by_name.insert(desc.id.name.clone(), idx);
                    index.insert(desc.id.clone(), idx);
                    roots.push(desc.id.clone());
                    queue.push(idx);
                }
                Some(&existing) => {
                    let resolved: &Arc<Descriptor> = &graph[existing];
                    if resolved.id == desc.id {
                        return Err(CoreError::DuplicateDescriptor {
                            id: desc.id.clone(),
                        });
                    }
                    return Err(CoreError::VersionConflict {
                        name: desc.id.name.clone(),
                        wanted: desc.id.version.clone(),
                        available: resolved.id.version.clone(),
                        requested_by: desc.id.clone(),
                    });
                }
            }
        }

        while let Some(consumer_idx) = queue.pop() {
            let consumer = Arc::clone(&graph[consumer_idx]);
            for dep in &consumer.dependencies {
                if !dep.when.matches(platform) {
                    continue;
                }
                let provider_idx = match by_name.get(&dep.name) {
                    Some(&idx) => idx,
                    None => {
                        let descriptor = source.descriptor(&dep.name).ok_or_else(|| {
                            CoreError::UnknownDependency {
                                name: dep.name.clone(),
                                requested_by: consumer.id.clone(),
                            }
                        })?;
                        let idx = graph.add_node(Arc::clone(&descriptor));
                        by_name.insert(dep.name.clone(), idx);
                        index.insert(descriptor.id.clone(), idx);
                        queue.push(idx);
                        idx
                    }
                };
                if let Some(wanted) = &dep.version {
                    let provider: &Arc<Descriptor> = &graph[provider_idx];
                    if *wanted != provider.id.version {
                        return Err(CoreError::VersionConflict {
                            name: dep.name.clone(),
                            wanted: wanted.clone(),
                            available: provider.id.version.clone(),
                            requested_by: consumer.id.clone(),
                        });
                    }
                }
                graph.add_edge(consumer_idx, provider_idx, dep.kind);
            }
        }

        let topo = toposort_providers_first(&graph)?;

        Ok(BuildGraph {
            graph,
            index,
            roots,
            topo,
        })
    }

    /// Providers-first topological order. Executing serially in this
    /// order never reaches a node before its dependencies.
    pub fn topo_order(&self) -> &[PackageId] {
        &self.topo
    }

    /// The requested identities, preserved as graph roots.
    pub fn roots(&self) -> &[PackageId] {
        &self.roots
    }

    pub fn descriptor(&self, id: &PackageId) -> Option<&Arc<Descriptor>> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    /// Direct dependencies of a node with their edge kinds.
    pub fn dependencies_of(&self, id: &PackageId) -> Vec<(PackageId, DependencyKind)> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Direct dependents of a node with their edge kinds.
    pub fn dependents_of(&self, id: &PackageId) -> Vec<(PackageId, DependencyKind)> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependencies across build-constraining edges only,
    /// deduplicated (a pair may be connected by several edge kinds).
    pub fn build_dependencies_of(&self, id: &PackageId) -> Vec<PackageId> {
        let mut deps: Vec<PackageId> = self
            .dependencies_of(id)
            .into_iter()
            .filter(|(_, kind)| kind.constrains_build())
            .map(|(dep, _)| dep)
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn neighbors(&self, id: &PackageId, dir: Direction) -> Vec<(PackageId, DependencyKind)> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, dir)
            .map(|edge| {
                let other = match dir {
                    Direction::Outgoing => edge.target(),
                    Direction::Incoming => edge.source(),
                };
                (self.graph[other].id.clone(), *edge.weight())
            })
            .collect()
    }
}

/// Topological sort over build-constraining edges, providers first.
///
/// On a cycle, recovers the cycle members via strongly connected
/// components so the error can name them.
fn toposort_providers_first(
    graph: &StableGraph<Arc<Descriptor>, DependencyKind, Directed, u32>,
) -> Result<Vec<PackageId>, CoreError> {
    let filtered = EdgeFiltered::from_fn(graph, |edge| edge.weight().constrains_build());
    match petgraph::algo::toposort(&filtered, None) {
        Ok(order) => {
            // toposort places consumers before providers; reverse so
            // dependencies come first.
            Ok(order
                .into_iter()
                .rev()
                .map(|idx| graph[idx].id.clone())
                .collect())
        }
        Err(_) => {
            let sccs = petgraph::algo::tarjan_scc(&filtered);
            let members = sccs
                .into_iter()
                .find(|scc| {
                    scc.len() > 1
                        || graph
                            .edges(scc[0])
                            .any(|e| e.target() == scc[0] && e.weight().constrains_build())
                })
                .map(|scc| scc.into_iter().map(|idx| graph[idx].id.clone()).collect())
                .unwrap_or_default();
            Err(CoreError::Cycle { members })
        }
    }
}
