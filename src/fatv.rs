//! Flow-Atomic Transfer Volumes: regions of the network bounded only by
//! metered cuts, across which inflow must equal outflow.
//!
//! [`extract`] reduces a [`TopologyGraph`] into a [`FatvTable`]. Clusters of
//! junctions joined by unmetered sections are found as weakly-connected
//! components; clusters touching the exterior are unbounded and dropped.
//! Consecutive track sets on one section add a trivial FATV each.

use petgraph::Direction;
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

use crate::topology::{DetectorId, TopologyGraph, TrackSet};

pub type FatvId = usize;

/// Detectors whose crossing marks entry into (`IN`) and exit from (`OUT`) a FATV.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fatv {
    #[serde(rename = "IN")]
    pub inbound: Vec<DetectorId>,
    #[serde(rename = "OUT")]
    pub outbound: Vec<DetectorId>,
}

impl Fatv {
    /// A FATV with an empty side can never be balanced against anything.
    pub fn is_malformed(&self) -> bool {
        self.inbound.is_empty() || self.outbound.is_empty()
    }

    pub fn detectors(&self) -> impl Iterator<Item = DetectorId> + '_ {
        self.inbound.iter().chain(self.outbound.iter()).copied()
    }
}

/// FATVs keyed and ordered by integer id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FatvTable {
    fatvs: BTreeMap<FatvId, Fatv>,
}

impl FatvTable {
    /// Numbers FATVs 0..N-1 in iteration order.
    pub fn from_fatvs(fatvs: impl IntoIterator<Item = Fatv>) -> Self {
        Self {
            fatvs: fatvs.into_iter().enumerate().collect(),
        }
    }

    pub fn get(&self, id: FatvId) -> Option<&Fatv> {
        self.fatvs.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FatvId, &Fatv)> {
        self.fatvs.iter().map(|(&id, fatv)| (id, fatv))
    }

    pub fn len(&self) -> usize {
        self.fatvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fatvs.is_empty()
    }

    /// Builds the detector → FATV index used for neighbor lookups.
    pub fn membership(&self) -> Membership {
        let mut membership = Membership::default();
        for (id, fatv) in self.iter() {
            for &d in &fatv.inbound {
                push_unique(membership.inbound.entry(d).or_default(), id);
            }
            for &d in &fatv.outbound {
                push_unique(membership.outbound.entry(d).or_default(), id);
            }
        }
        membership
    }

    /// Every detector sharing a FATV with `detector`, itself included.
    pub fn neighborhood(&self, membership: &Membership, detector: DetectorId) -> Vec<DetectorId> {
        let fatvs = membership
            .inbound_of(detector)
            .iter()
            .chain(membership.outbound_of(detector));

        let mut dets = BTreeSet::new();
        for &id in fatvs {
            if let Some(fatv) = self.get(id) {
                dets.extend(fatv.detectors());
            }
        }
        dets.into_iter().collect()
    }
}

fn push_unique(ids: &mut Vec<FatvId>, id: FatvId) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

/// Static detector → FATV index: the FATVs a detector enters (`IN` side) and
/// leaves (`OUT` side). Ids are ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    inbound: HashMap<DetectorId, Vec<FatvId>>,
    outbound: HashMap<DetectorId, Vec<FatvId>>,
}

impl Membership {
    /// FATVs listing `detector` in their `IN` set.
    pub fn inbound_of(&self, detector: DetectorId) -> &[FatvId] {
        self.inbound.get(&detector).map(Vec::as_slice).unwrap_or_default()
    }

    /// FATVs listing `detector` in their `OUT` set.
    pub fn outbound_of(&self, detector: DetectorId) -> &[FatvId] {
        self.outbound.get(&detector).map(Vec::as_slice).unwrap_or_default()
    }

    /// The FATV the detector feeds into. The highest id wins when several do.
    pub fn fatv_in(&self, detector: DetectorId) -> Option<FatvId> {
        self.inbound_of(detector).last().copied()
    }

    /// The FATV the detector drains. The highest id wins when several do.
    pub fn fatv_out(&self, detector: DetectorId) -> Option<FatvId> {
        self.outbound_of(detector).last().copied()
    }
}

/// Derives the FATV table of a topology. Component FATVs come first, ordered
/// by their lowest junction node, followed by trivial FATVs in section order.
pub fn extract(topology: &TopologyGraph) -> FatvTable {
    let graph = topology.graph();

    let mut components = UnionFind::new(graph.node_count());
    for edge in graph.edge_references() {
        if !topology.section(*edge.weight()).is_metered() {
            components.union(edge.source().index(), edge.target().index());
        }
    }
    let labels = components.into_labeling();
    let exterior_label = labels[topology.exterior().index()];

    // Node indices grow monotonically, so slot order is lowest-node order.
    let mut slots: HashMap<usize, usize> = HashMap::new();
    let mut groups: Vec<(usize, Vec<petgraph::graph::NodeIndex>)> = Vec::new();
    for node in graph.node_indices() {
        let label = labels[node.index()];
        let slot = *slots.entry(label).or_insert_with(|| {
            groups.push((label, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(node);
    }

    let mut fatvs = Vec::new();
    let mut discarded = 0usize;
    for (label, nodes) in &groups {
        if *label == exterior_label {
            debug!(junctions = nodes.len(), "Component reaches the exterior unmetered, discarding");
            discarded += 1;
            continue;
        }

        let mut entering = Vec::new();
        let mut leaving = Vec::new();
        for &node in nodes {
            for edge in graph.edges_directed(node, Direction::Incoming) {
                if labels[edge.source().index()] != *label {
                    entering.push(*edge.weight());
                }
            }
            for edge in graph.edges_directed(node, Direction::Outgoing) {
                if labels[edge.target().index()] != *label {
                    leaving.push(*edge.weight());
                }
            }
        }
        entering.sort_unstable();
        leaving.sort_unstable();

        let inbound = flatten(
            topology,
            entering.iter().filter_map(|&s| topology.section(s).last_track_set()),
        );
        let outbound = flatten(
            topology,
            leaving.iter().filter_map(|&s| topology.section(s).first_track_set()),
        );
        fatvs.push(Fatv { inbound, outbound });
    }
    let component_count = fatvs.len();

    for section in topology.sections() {
        for pair in section.track_sets.windows(2) {
            fatvs.push(Fatv {
                inbound: flatten(topology, std::iter::once(&pair[0])),
                outbound: flatten(topology, std::iter::once(&pair[1])),
            });
        }
    }

    info!(
        fatvs = fatvs.len(),
        components = component_count,
        trivial = fatvs.len() - component_count,
        discarded,
        "FATV extraction complete"
    );

    FatvTable::from_fatvs(fatvs)
}

fn flatten<'a>(
    topology: &TopologyGraph,
    sets: impl Iterator<Item = &'a TrackSet>,
) -> Vec<DetectorId> {
    let mut ids = Vec::new();
    for set in sets {
        for id in topology.track_set_ids(set) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}
