//! In-memory road network: junctions as nodes, sections as directed edges,
//! detectors grouped into ordered track sets per section.
//!
//! Records live in arenas and refer to each other by index, so sections,
//! junctions and detectors never hold references to one another.

use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::config::DetectorFilter;
use crate::parser::TopologyInput;

pub type DetectorId = u64;
pub type JunctionId = i64;
pub type SectionId = i64;

/// Graph node. `id` is `None` for the exterior node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Junction {
    pub id: Option<JunctionId>,
}

impl Junction {
    pub fn is_exterior(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detector {
    pub id: DetectorId,
    pub section: usize,
    pub first_lane: u32,
    pub last_lane: u32,
    pub start_position: f64,
}

impl Detector {
    pub fn lane_span(&self) -> (u32, u32) {
        (self.first_lane, self.last_lane)
    }
}

/// Detectors of one section spanning identical lanes, treated as a single
/// measurement point. `members` index into the detector arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSet {
    pub first_lane: u32,
    pub last_lane: u32,
    pub members: Vec<usize>,
}

impl TrackSet {
    pub fn lane_span(&self) -> (u32, u32) {
        (self.first_lane, self.last_lane)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub id: SectionId,
    pub origin: NodeIndex,
    pub destination: NodeIndex,
    /// Track sets in the order a vehicle crosses them.
    pub track_sets: Vec<TrackSet>,
}

impl Section {
    pub fn is_metered(&self) -> bool {
        !self.track_sets.is_empty()
    }

    /// The track set a vehicle crosses first, just after leaving the origin.
    pub fn first_track_set(&self) -> Option<&TrackSet> {
        self.track_sets.first()
    }

    /// The track set a vehicle crosses last, just before reaching the destination.
    pub fn last_track_set(&self) -> Option<&TrackSet> {
        self.track_sets.last()
    }
}

/// Directed multigraph over junctions. Edge weights index into the section arena.
#[derive(Debug, Clone)]
pub struct TopologyGraph {
    graph: DiGraph<Junction, usize>,
    exterior: NodeIndex,
    sections: Vec<Section>,
    detectors: Vec<Detector>,
}

impl TopologyGraph {
    /// Builds the graph from a topology export, keeping only detectors the
    /// filter accepts.
    pub fn build(input: &TopologyInput, filter: &DetectorFilter) -> Self {
        let mut graph = DiGraph::new();
        let exterior = graph.add_node(Junction { id: None });

        let mut nodes: HashMap<JunctionId, NodeIndex> = HashMap::new();
        for junction in &input.junctions {
            nodes
                .entry(junction.id)
                .or_insert_with(|| graph.add_node(Junction { id: Some(junction.id) }));
        }

        let mut sections = Vec::with_capacity(input.sections.len());
        let mut section_index: HashMap<SectionId, usize> = HashMap::new();
        for record in &input.sections {
            if section_index.contains_key(&record.id) {
                warn!(section = record.id, "Duplicate section id, keeping the first");
                continue;
            }
            let origin = resolve_junction(&mut graph, &mut nodes, exterior, record.origin);
            let destination = resolve_junction(&mut graph, &mut nodes, exterior, record.destination);

            let idx = sections.len();
            section_index.insert(record.id, idx);
            graph.add_edge(origin, destination, idx);
            sections.push(Section {
                id: record.id,
                origin,
                destination,
                track_sets: Vec::new(),
            });
        }

        let mut detectors = Vec::new();
        let mut by_section: Vec<Vec<usize>> = vec![Vec::new(); sections.len()];
        let mut seen = HashSet::new();
        let mut filtered = 0usize;
        for record in &input.detectors {
            let Some(id) = filter.accept(&record.id) else {
                debug!(detector = %record.id, "Detector not on the public feed, dropping");
                filtered += 1;
                continue;
            };
            let Some(&section) = section_index.get(&record.section_id) else {
                warn!(detector = id, section = record.section_id, "Detector on unknown section, dropping");
                continue;
            };
            if !seen.insert(id) {
                warn!(detector = id, "Duplicate detector id, keeping the first");
                continue;
            }

            by_section[section].push(detectors.len());
            detectors.push(Detector {
                id,
                section,
                first_lane: record.first_lane,
                last_lane: record.last_lane,
                start_position: record.start_position,
            });
        }

        for (section, members) in by_section.into_iter().enumerate() {
            sections[section].track_sets = group_track_sets(&detectors, members);
        }

        info!(
            junctions = graph.node_count() - 1,
            sections = sections.len(),
            detectors = detectors.len(),
            filtered,
            "Topology graph built"
        );

        Self {
            graph,
            exterior,
            sections,
            detectors,
        }
    }

    pub fn graph(&self) -> &DiGraph<Junction, usize> {
        &self.graph
    }

    pub fn exterior(&self) -> NodeIndex {
        self.exterior
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, idx: usize) -> &Section {
        &self.sections[idx]
    }

    pub fn detector(&self, idx: usize) -> &Detector {
        &self.detectors[idx]
    }

    /// External ids of a track set's detectors, in crossing order.
    pub fn track_set_ids<'a>(&'a self, set: &'a TrackSet) -> impl Iterator<Item = DetectorId> + 'a {
        set.members.iter().map(|&m| self.detectors[m].id)
    }

    /// Sorted ids of every detector kept in the topology.
    pub fn tracked_detectors(&self) -> Vec<DetectorId> {
        let mut ids: Vec<_> = self.detectors.iter().map(|d| d.id).collect();
        ids.sort_unstable();
        ids
    }
}

fn resolve_junction(
    graph: &mut DiGraph<Junction, usize>,
    nodes: &mut HashMap<JunctionId, NodeIndex>,
    exterior: NodeIndex,
    id: Option<JunctionId>,
) -> NodeIndex {
    match id {
        None => exterior,
        Some(id) => *nodes.entry(id).or_insert_with(|| {
            warn!(junction = id, "Section references unlisted junction, adding it");
            graph.add_node(Junction { id: Some(id) })
        }),
    }
}

/// Groups a section's detectors by lane span. Sets are ordered by the first
/// position at which they are encountered.
fn group_track_sets(detectors: &[Detector], mut members: Vec<usize>) -> Vec<TrackSet> {
    members.sort_by(|&a, &b| {
        let (a, b) = (&detectors[a], &detectors[b]);
        a.start_position
            .total_cmp(&b.start_position)
            .then(a.lane_span().cmp(&b.lane_span()))
            .then(a.id.cmp(&b.id))
    });

    let mut sets: Vec<TrackSet> = Vec::new();
    for m in members {
        let span = detectors[m].lane_span();
        match sets.iter_mut().find(|set| set.lane_span() == span) {
            Some(set) => set.members.push(m),
            None => sets.push(TrackSet {
                first_lane: span.0,
                last_lane: span.1,
                members: vec![m],
            }),
        }
    }
    sets
}
