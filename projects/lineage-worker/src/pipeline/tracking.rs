use crate::error::PipelineError;
use crate::pipeline::runner::{ModelRunner, ScratchFiles};
use crate::pipeline::types::ObjectFeatureSet;
use crate::pipeline::windows::Window;
use anyhow::{bail, Context, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

const MODEL_RELEASE: &str = "https://github.com/weigertlab/trackastra-models/releases/download/v0.3.0";

/// Pretrained tracking transformers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(try_from = "String")]
pub enum TrackingModel {
    #[serde(rename = "ctc")]
    #[default]
    Ctc,
    #[serde(rename = "general_2d")]
    General2d,
}

impl TrackingModel {
    pub fn name(&self) -> &'static str {
        match self {
            TrackingModel::Ctc => "ctc",
            TrackingModel::General2d => "general_2d",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            TrackingModel::Ctc => "Cell Tracking Challenge (2D+3D)",
            TrackingModel::General2d => "General Model (2D)",
        }
    }

    pub fn supports_dims(&self, dims: usize) -> bool {
        match self {
            TrackingModel::Ctc => dims == 2 || dims == 3,
            TrackingModel::General2d => dims == 2,
        }
    }

    pub fn url(&self) -> String {
        format!("{}/{}.zip", MODEL_RELEASE, self.name())
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [TrackingModel::Ctc, TrackingModel::General2d]
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl TryFrom<String> for TrackingModel {
    type Error = String;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::from_name(&name).ok_or_else(|| format!("unknown tracking model '{}'", name))
    }
}

/// How predicted associations are turned into tracks.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// Greedy linking, objects may divide
    #[default]
    Greedy,
    /// Greedy linking without divisions
    GreedyNodiv,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrackingConfig {
    pub edge_threshold: f64,
    pub num_dimensions: usize,
    pub normalization: f64,
    pub mode: TrackingMode,
}

/// One object at one timepoint.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackNode {
    pub timepoint: i32,
    pub label: i32,
}

/// Edge list as exchanged with the runner. Endpoints index into `nodes`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct WireGraph {
    pub nodes: Vec<TrackNode>,
    pub edges: Vec<WireEdge>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WireEdge {
    pub source: usize,
    pub target: usize,
    #[serde(default)]
    pub weight: Option<f32>,
}

/// Directed graph linking objects across timepoints.
///
/// Each `(timepoint, label)` appears once. Edges point forward in time and
/// may carry the model's association score.
#[derive(Debug, Clone, Default)]
pub struct PredictionGraph {
    graph: DiGraph<TrackNode, Option<f32>>,
    index: HashMap<TrackNode, NodeIndex>,
}

impl PredictionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: TrackNode) -> NodeIndex {
        if let Some(&idx) = self.index.get(&node) {
            return idx;
        }
        let idx = self.graph.add_node(node);
        self.index.insert(node, idx);
        idx
    }

    pub fn add_edge(&mut self, source: TrackNode, target: TrackNode, weight: Option<f32>) {
        let a = self.add_node(source);
        let b = self.add_node(target);
        self.graph.add_edge(a, b, weight);
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Every edge with its endpoints, in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = (TrackNode, TrackNode, Option<f32>)> + '_ {
        self.graph
            .edge_references()
            .map(|e| (self.graph[e.source()], self.graph[e.target()], *e.weight()))
    }

    pub fn from_wire(wire: WireGraph) -> Result<Self> {
        let mut graph = Self::new();
        for node in &wire.nodes {
            graph.add_node(*node);
        }
        for (i, edge) in wire.edges.iter().enumerate() {
            let (Some(&source), Some(&target)) =
                (wire.nodes.get(edge.source), wire.nodes.get(edge.target))
            else {
                bail!(
                    "Edge {} references node {} -> {}, but only {} nodes exist",
                    i,
                    edge.source,
                    edge.target,
                    wire.nodes.len()
                );
            };
            graph.add_edge(source, target, edge.weight);
        }
        Ok(graph)
    }
}

/// Sequence model linking objects across timepoints.
pub trait Tracker {
    fn track<'a>(
        &mut self,
        windows: &mut dyn Iterator<Item = Window<'a>>,
        sets: &'a [ObjectFeatureSet],
        config: &TrackingConfig,
    ) -> Result<PredictionGraph>;
}

#[derive(Serialize)]
struct TimepointFiles {
    timepoint: usize,
    labels: PathBuf,
    coords: PathBuf,
    timepoints: PathBuf,
    features: BTreeMap<&'static str, PathBuf>,
}

#[derive(Serialize)]
struct TrackJob<'a> {
    task: &'static str,
    model: &'static str,
    weights: Option<&'a Path>,
    config: &'a TrackingConfig,
    timepoints: Vec<TimepointFiles>,
    /// Half-open timepoint ranges
    windows: Vec<[usize; 2]>,
    graph: PathBuf,
}

/// Tracker backed by an external runner program.
pub struct CommandTracker {
    runner: ModelRunner,
    model: TrackingModel,
    weights: Option<PathBuf>,
}

impl CommandTracker {
    pub fn new(runner: ModelRunner, model: TrackingModel, weights: Option<PathBuf>) -> Self {
        Self {
            runner,
            model,
            weights,
        }
    }

    fn write_set(
        &self,
        set: &ObjectFeatureSet,
        scratch: &mut ScratchFiles,
    ) -> Result<TimepointFiles> {
        let prefix = format!("track.t{}", set.timepoint);
        let mut features = BTreeMap::new();
        for (kind, values) in &set.features {
            let path = self
                .runner
                .write_array(&format!("{}.{}", prefix, kind.name()), &values.view().into_dyn())?;
            features.insert(kind.name(), scratch.track(path));
        }
        let labels = self
            .runner
            .write_array(&format!("{}.labels", prefix), &set.labels.view().into_dyn())?;
        let coords = self
            .runner
            .write_array(&format!("{}.coords", prefix), &set.coords.view().into_dyn())?;
        let timepoints = self.runner.write_array(
            &format!("{}.timepoints", prefix),
            &set.timepoints.view().into_dyn(),
        )?;
        Ok(TimepointFiles {
            timepoint: set.timepoint,
            labels: scratch.track(labels),
            coords: scratch.track(coords),
            timepoints: scratch.track(timepoints),
            features,
        })
    }
}

impl Tracker for CommandTracker {
    fn track<'a>(
        &mut self,
        windows: &mut dyn Iterator<Item = Window<'a>>,
        sets: &'a [ObjectFeatureSet],
        config: &TrackingConfig,
    ) -> Result<PredictionGraph> {
        if !self.model.supports_dims(config.num_dimensions) {
            return Err(PipelineError::IncompatibleModel {
                model: self.model.name().to_string(),
                dims: config.num_dimensions,
            }
            .into());
        }

        let mut scratch = ScratchFiles::new();
        let timepoints = sets
            .iter()
            .map(|set| self.write_set(set, &mut scratch))
            .collect::<Result<Vec<_>>>()?;
        let graph_path = scratch.track(self.runner.scratch_path("track", "graph.json"));
        let job = TrackJob {
            task: "track",
            model: self.model.name(),
            weights: self.weights.as_deref(),
            config,
            timepoints,
            windows: windows
                .map(|w| {
                    tracing::debug!(
                        "Window {}..{} holds {} objects",
                        w.start,
                        w.end(),
                        w.num_objects()
                    );
                    [w.start, w.end()]
                })
                .collect(),
            graph: graph_path.clone(),
        };
        self.runner.run("track", &job)?;
        tracing::debug!("Tracking used {} runner jobs", self.runner.jobs_run());

        if !graph_path.exists() {
            return Err(PipelineError::MissingOutput("prediction graph".to_string()).into());
        }
        let content = std::fs::read_to_string(&graph_path)
            .with_context(|| format!("Failed to read prediction graph {:?}", graph_path))?;
        let wire: WireGraph =
            serde_json::from_str(&content).context("Runner wrote an invalid prediction graph")?;

        PredictionGraph::from_wire(wire)
    }
}
