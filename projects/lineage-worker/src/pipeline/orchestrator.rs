// Pipeline orchestrator: runs one invocation from request to result manifest
//
// Reads the input arrays named by the request, drives the stages, writes the
// output arrays once at the end and reports through the status channel.
// A failed invocation removes every array it created and writes no manifest.

use crate::error::PipelineError;
use crate::model_cache::ModelCache;
use crate::pipeline::detection::{CommandDetector, DetectionModel, Detector};
use crate::pipeline::detection_worker::run_detection;
use crate::pipeline::edges::EdgeTable;
use crate::pipeline::feature::{count_objects, extract_feature_sets};
use crate::pipeline::measure::{MomentMeasurer, RegionMeasurer};
use crate::pipeline::runner::ModelRunner;
use crate::pipeline::tracking::{CommandTracker, Tracker, TrackingConfig, TrackingModel};
use crate::pipeline::types::{RegionProps, SingleTimepointProps, Volume};
use crate::pipeline::windows::WindowBuilder;
use crate::run_artifacts::{InvocationKind, InvocationResult};
use crate::run_context::{
    DetectionRequest, LinkPredictionRequest, RegionPropsArrays, RegionPropsRequest,
};
use crate::shm::SharedArrayDir;
use crate::status::{InvocationStatus, StatusSink};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use ndarray::{ArrayD, Axis};
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Builds the model implementations used by an invocation.
pub trait ModelBackend {
    fn detector(
        &self,
        model: DetectionModel,
        weights: Option<PathBuf>,
    ) -> Result<Box<dyn Detector>>;

    fn tracker(&self, model: TrackingModel, weights: Option<PathBuf>) -> Result<Box<dyn Tracker>>;
}

/// Models served by an external runner program.
pub struct RunnerBackend {
    program: PathBuf,
    args: Vec<String>,
    work_dir: PathBuf,
}

impl RunnerBackend {
    pub fn new(program: &Path, args: Vec<String>, work_dir: &Path) -> Result<Self> {
        fs::create_dir_all(work_dir)
            .with_context(|| format!("Failed to create runner work directory {:?}", work_dir))?;
        Ok(Self {
            program: program.to_path_buf(),
            args,
            work_dir: work_dir.to_path_buf(),
        })
    }

    fn runner(&self) -> ModelRunner {
        ModelRunner::new(&self.program, &self.work_dir).with_args(self.args.clone())
    }
}

impl ModelBackend for RunnerBackend {
    fn detector(
        &self,
        model: DetectionModel,
        weights: Option<PathBuf>,
    ) -> Result<Box<dyn Detector>> {
        Ok(Box::new(CommandDetector::new(self.runner(), model, weights)))
    }

    fn tracker(&self, model: TrackingModel, weights: Option<PathBuf>) -> Result<Box<dyn Tracker>> {
        Ok(Box::new(CommandTracker::new(self.runner(), model, weights)))
    }
}

/// One invocation as requested by the host.
#[derive(Debug, Clone)]
pub enum InvocationRequest {
    Detect(DetectionRequest),
    RegionProps(RegionPropsRequest),
    PredictLinks(LinkPredictionRequest),
}

impl InvocationRequest {
    pub fn id(&self) -> &str {
        match self {
            InvocationRequest::Detect(r) => &r.id,
            InvocationRequest::RegionProps(r) => &r.id,
            InvocationRequest::PredictLinks(r) => &r.id,
        }
    }

    pub fn kind(&self) -> InvocationKind {
        match self {
            InvocationRequest::Detect(_) => InvocationKind::Detect,
            InvocationRequest::RegionProps(_) => InvocationKind::RegionProps,
            InvocationRequest::PredictLinks(_) => InvocationKind::PredictLinks,
        }
    }
}

/// Run one invocation to completion.
///
/// On success the result manifest is written and a completion message sent.
/// On failure the arrays created so far are removed and a failure message
/// carries the error to the host.
pub fn execute(
    request: &InvocationRequest,
    shm: &SharedArrayDir,
    cache: &ModelCache,
    backend: &dyn ModelBackend,
    sink: &dyn StatusSink,
) -> Result<InvocationResult> {
    let status = InvocationStatus::new(request.id(), sink);
    shm.keep_created();
    let manifest = InvocationResult::manifest_path(shm.root(), request.id());
    if manifest.exists() {
        fs::remove_file(&manifest)
            .with_context(|| format!("Failed to remove stale result {:?}", manifest))?;
    }

    tracing::info!("Starting invocation '{}' ({:?})", request.id(), request.kind());
    let outcome = match request {
        InvocationRequest::Detect(r) => run_detection_invocation(r, shm, cache, backend, &status),
        InvocationRequest::RegionProps(r) => run_region_props(r, shm, &status),
        InvocationRequest::PredictLinks(r) => run_link_prediction(r, shm, cache, backend, &status),
    }
    .and_then(|mut result| {
        result.messages_sent = status.messages_sent();
        result.completed_at = Utc::now();
        result.write(shm.root())?;
        Ok(result)
    });

    match outcome {
        Ok(result) => {
            tracing::debug!("Progress: {}", status.to_progress_json());
            tracing::debug!("Shared arrays present: {:?}", shm.list());
            status.complete(&format!(
                "Invocation '{}' completed with {} output arrays",
                result.id,
                result.outputs.len()
            ));
            Ok(result)
        }
        Err(e) => {
            shm.discard_created();
            status.fail(&format!("{:#}", e));
            Err(e)
        }
    }
}

/// Segment one volume and write the label image in the input's element type.
pub fn run_detection_invocation(
    request: &DetectionRequest,
    shm: &SharedArrayDir,
    cache: &ModelCache,
    backend: &dyn ModelBackend,
    status: &InvocationStatus<'_>,
) -> Result<InvocationResult> {
    status.message(&format!(
        "Reading image '{}' {:?} ({})",
        request.image.name, request.image.shape, request.image.dtype
    ));
    let data = shm.read_f32(&request.image)?;
    let volume = Volume::new(data, request.image.dtype, request.has_channel);

    status.message(&format!("Loading model: {}", request.model.display_name()));
    let weights = cache.ensure_detection(request.model)?;
    let mut detector = backend.detector(request.model, weights)?;

    let outcome = run_detection(request, &volume, detector.as_mut(), status)?;

    let output = shm.write_labels_as(&request.output, &outcome.labels, request.image.dtype)?;
    let num_objects = outcome
        .labels
        .iter()
        .filter(|&&l| l > 0)
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    status.message(&format!(
        "Label image with {} objects saved to shared memory as '{}'",
        num_objects, output.name
    ));

    let mut result =
        InvocationResult::new(&request.id, InvocationKind::Detect).with_output(&request.output, output);
    if !outcome.details.is_null() {
        result.details = Some(outcome.details);
    }
    Ok(result)
}

/// Region measurements in their transfer layout.
struct PropsArrays {
    labels: ArrayD<i32>,
    timepoints: ArrayD<i32>,
    coords: ArrayD<f32>,
    diameter: ArrayD<f32>,
    intensity: ArrayD<f32>,
    inertia_tensor: ArrayD<f32>,
    border_dist: ArrayD<f32>,
}

impl PropsArrays {
    /// One frame: `[N]` vectors, coords `[D, N]`, tensors `[K, N]`.
    fn flat(props: SingleTimepointProps) -> Self {
        Self {
            labels: props.labels.into_dyn(),
            timepoints: props.timepoints.into_dyn(),
            coords: props.coords.t().to_owned().into_dyn(),
            diameter: props.diameters.into_dyn(),
            intensity: props.intensities.into_dyn(),
            inertia_tensor: props.inertia_tensors.t().to_owned().into_dyn(),
            border_dist: props.border_dists.into_dyn(),
        }
    }

    fn padded(props: RegionProps) -> Self {
        Self {
            labels: props.labels.into_dyn(),
            timepoints: props.timepoints.into_dyn(),
            coords: props.coords.into_dyn(),
            diameter: props.diameters.into_dyn(),
            intensity: props.intensities.into_dyn(),
            inertia_tensor: props.inertia_tensors.into_dyn(),
            border_dist: props.border_dists.into_dyn(),
        }
    }

    fn write(&self, shm: &SharedArrayDir, prefix: &str) -> Result<RegionPropsArrays> {
        let name = |n: &str| format!("{}{}", prefix, n);
        Ok(RegionPropsArrays {
            labels: shm.write(&name("labels"), &self.labels)?,
            timepoints: shm.write(&name("timepoints"), &self.timepoints)?,
            coords: shm.write(&name("coords"), &self.coords)?,
            diameter: shm.write(&name("diameter"), &self.diameter)?,
            intensity: shm.write(&name("intensity"), &self.intensity)?,
            inertia_tensor: shm.write(&name("inertia_tensor"), &self.inertia_tensor)?,
            border_dist: shm.write(&name("border_dist"), &self.border_dist)?,
        })
    }
}

/// Measure objects of a labelled frame, or of every frame of a series.
pub fn run_region_props(
    request: &RegionPropsRequest,
    shm: &SharedArrayDir,
    status: &InvocationStatus<'_>,
) -> Result<InvocationResult> {
    request.validate()?;
    let image = shm.read_f32(&request.image)?;
    let mask = shm.read_i32(&request.mask)?;
    status.message(&format!(
        "Measuring objects in image {:?} with mask {:?}",
        image.shape(),
        mask.shape()
    ));
    let measurer = MomentMeasurer::new(request.normalize);

    let (arrays, num_objects) = if request.series {
        if image.ndim() < 3 {
            bail!(
                "A time series needs a leading time axis, got image of shape {:?}",
                image.shape()
            );
        }
        if image.shape() != mask.shape() {
            return Err(PipelineError::ShapeMismatch {
                what: "mask".to_string(),
                expected: image.shape().to_vec(),
                actual: mask.shape().to_vec(),
            }
            .into());
        }

        let num_timepoints = image.len_of(Axis(0));
        status.begin_stage("measure", num_timepoints);
        let mut per_timepoint = Vec::with_capacity(num_timepoints);
        for t in 0..num_timepoints {
            let start = Instant::now();
            let props = measurer.measure(
                &image.index_axis(Axis(0), t),
                &mask.index_axis(Axis(0), t),
                t as i32,
            )?;
            tracing::debug!("Timepoint {}: {} objects", t, props.len());
            per_timepoint.push(if props.is_empty() { None } else { Some(props) });
            status.update_stage("measure", t + 1, start.elapsed().as_secs_f64() * 1000.0);
        }
        let num_objects = per_timepoint.iter().flatten().map(|p| p.len()).sum::<usize>();
        let packed = RegionProps::pack(&per_timepoint, request.window_size)?;
        tracing::debug!(
            "Packed {} timepoints, up to {} objects each",
            packed.num_timepoints(),
            packed.capacity()
        );
        (PropsArrays::padded(packed), num_objects)
    } else {
        let props = measurer.measure(&image.view(), &mask.view(), request.timepoint)?;
        let num_objects = props.len();
        (PropsArrays::flat(props), num_objects)
    };
    status.message(&format!(
        "Feature extraction completed. Found {} objects",
        num_objects
    ));

    let written = arrays.write(shm, &request.output_prefix)?;
    let mut result = InvocationResult::new(&request.id, InvocationKind::RegionProps);
    for (name, array) in written.iter() {
        result = result.with_output(name, array.clone());
    }
    Ok(result)
}

/// Predict links between objects of consecutive timepoints and write the
/// flattened edge table.
pub fn run_link_prediction(
    request: &LinkPredictionRequest,
    shm: &SharedArrayDir,
    cache: &ModelCache,
    backend: &dyn ModelBackend,
    status: &InvocationStatus<'_>,
) -> Result<InvocationResult> {
    request.validate()?;
    let arrays = &request.region_props;
    let props = RegionProps::from_arrays(
        shm.read_i32(&arrays.labels)?,
        shm.read_i32(&arrays.timepoints)?,
        shm.read_f32(&arrays.coords)?,
        shm.read_f32(&arrays.diameter)?,
        shm.read_f32(&arrays.intensity)?,
        shm.read_f32(&arrays.inertia_tensor)?,
        shm.read_f32(&arrays.border_dist)?,
    )?;
    status.message("Read data from Region Props");

    let num_dimensions = props.coord_dims();
    if !request.model.supports_dims(num_dimensions) {
        return Err(PipelineError::IncompatibleModel {
            model: request.model.display_name().to_string(),
            dims: num_dimensions,
        }
        .into());
    }

    status.begin_stage("features", 1);
    let start = Instant::now();
    let sets = extract_feature_sets(&props)?;
    status.update_stage("features", 1, start.elapsed().as_secs_f64() * 1000.0);
    tracing::debug!(
        "Extracted {} objects over {} timepoints",
        count_objects(&sets),
        sets.len()
    );

    status.message(&format!("Loading model: {}", request.model.display_name()));
    let weights = cache.ensure_tracking(request.model)?;
    let mut tracker = backend.tracker(request.model, Some(weights))?;

    let builder = WindowBuilder::new(request.window_size)?;
    let mut windows = builder.windows(&sets);
    status.message(&format!(
        "Window building from features completed. {} windows of {} timepoints",
        builder.count(sets.len()),
        builder.window_size()
    ));

    let config = TrackingConfig {
        edge_threshold: request.edge_threshold,
        num_dimensions,
        normalization: request.normalization,
        mode: request.mode,
    };
    status.begin_stage("predict", 1);
    let start = Instant::now();
    let graph = tracker.track(&mut windows, &sets, &config)?;
    status.update_stage("predict", 1, start.elapsed().as_secs_f64() * 1000.0);
    if let Some(progress) = status.stage("predict") {
        tracing::debug!("Prediction took {:.1} ms", progress.ms_per_unit);
    }
    status.message("Predictions completed");
    status.message(&format!(
        "Tracking graph construction completed. Nodes: {}, Edges: {}",
        graph.node_count(),
        graph.edge_count()
    ));

    let table = EdgeTable::from_graph(&graph);
    let output = shm.write(&request.output, &table.rows.clone().into_dyn())?;

    if let Some(path) = &request.export_csv {
        let file = fs::File::create(path)
            .with_context(|| format!("Failed to create edge table export {:?}", path))?;
        table.write_csv(BufWriter::new(file))?;
        status.message(&format!("Edge table exported to {:?}", path));
    }
    status.message(&format!("{} edges saved to shared memory", table.len()));

    Ok(InvocationResult::new(&request.id, InvocationKind::PredictLinks)
        .with_output(&request.output, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_cache::WeightFetcher;
    use crate::pipeline::detection::{Detection, DetectionConfig};
    use crate::pipeline::normalize::PercentileRange;
    use crate::pipeline::rescale::DiameterSettings;
    use crate::pipeline::tracking::{PredictionGraph, TrackNode, TrackingMode};
    use crate::pipeline::types::ObjectFeatureSet;
    use crate::pipeline::windows::Window;
    use crate::shm::{array_ref, ElementType};
    use crate::status::RecordingSink;
    use ndarray::{s, Array2, Array3, ArrayViewD};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct StubFetcher;

    impl WeightFetcher for StubFetcher {
        fn fetch(&self, _url: &str, dest: &Path) -> Result<()> {
            fs::write(dest, b"weights")?;
            Ok(())
        }
    }

    struct ThresholdDetector;

    impl Detector for ThresholdDetector {
        fn guess_tiles(&mut self, image: &ArrayViewD<'_, f32>) -> Result<Vec<usize>> {
            Ok(vec![1; image.ndim()])
        }

        fn predict(
            &mut self,
            image: &ArrayViewD<'_, f32>,
            _config: &DetectionConfig,
        ) -> Result<Detection> {
            Ok(Detection {
                labels: image.mapv(|v| if v > 0.5 { 1 } else { 0 }),
                details: serde_json::Value::Null,
            })
        }
    }

    /// Links every object to the object with the same label one timepoint later.
    struct SameLabelTracker {
        windows_seen: Rc<RefCell<Vec<[usize; 2]>>>,
    }

    impl Tracker for SameLabelTracker {
        fn track<'a>(
            &mut self,
            windows: &mut dyn Iterator<Item = Window<'a>>,
            sets: &'a [ObjectFeatureSet],
            _config: &TrackingConfig,
        ) -> Result<PredictionGraph> {
            self.windows_seen
                .borrow_mut()
                .extend(windows.map(|w| [w.start, w.end()]));
            let mut graph = PredictionGraph::new();
            for pair in sets.windows(2) {
                for &label in pair[0].labels.iter() {
                    let source = TrackNode {
                        timepoint: pair[0].timepoint as i32,
                        label,
                    };
                    graph.add_node(source);
                    if pair[1].labels.iter().any(|&l| l == label) {
                        let target = TrackNode {
                            timepoint: pair[1].timepoint as i32,
                            label,
                        };
                        graph.add_edge(source, target, Some(0.9));
                    }
                }
            }
            Ok(graph)
        }
    }

    struct FakeBackend {
        windows_seen: Rc<RefCell<Vec<[usize; 2]>>>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                windows_seen: Rc::new(RefCell::new(Vec::new())),
            }
        }
    }

    impl ModelBackend for FakeBackend {
        fn detector(
            &self,
            _model: DetectionModel,
            _weights: Option<PathBuf>,
        ) -> Result<Box<dyn Detector>> {
            Ok(Box::new(ThresholdDetector))
        }

        fn tracker(
            &self,
            _model: TrackingModel,
            weights: Option<PathBuf>,
        ) -> Result<Box<dyn Tracker>> {
            assert!(weights.is_some());
            Ok(Box::new(SameLabelTracker {
                windows_seen: self.windows_seen.clone(),
            }))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        shm: SharedArrayDir,
        cache: ModelCache,
        backend: FakeBackend,
        sink: RecordingSink,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let shm = SharedArrayDir::open(&dir.path().join("shm")).unwrap();
        let cache = ModelCache::new(&dir.path().join("models"), Box::new(StubFetcher));
        Fixture {
            _dir: dir,
            shm,
            cache,
            backend: FakeBackend::new(),
            sink: RecordingSink::new(),
        }
    }

    impl Fixture {
        fn execute(&self, request: InvocationRequest) -> Result<InvocationResult> {
            execute(&request, &self.shm, &self.cache, &self.backend, &self.sink)
        }
    }

    /// Square objects with labels `labels` on a `[size, size]` frame.
    fn frame(size: usize, labels: &[i32]) -> (Array2<f32>, Array2<i32>) {
        let mut image = Array2::<f32>::from_elem((size, size), 5.0);
        let mut mask = Array2::<i32>::zeros((size, size));
        for (i, &label) in labels.iter().enumerate() {
            let r = 2 + 5 * i;
            image.slice_mut(s![r..r + 3, 2..5]).fill(200.0);
            mask.slice_mut(s![r..r + 3, 2..5]).fill(label);
        }
        (image, mask)
    }

    fn series(size: usize, frames: &[&[i32]]) -> (Array3<f32>, Array3<i32>) {
        let mut image = Array3::<f32>::zeros((frames.len(), size, size));
        let mut mask = Array3::<i32>::zeros((frames.len(), size, size));
        for (t, labels) in frames.iter().enumerate() {
            let (i, m) = frame(size, labels);
            image.index_axis_mut(Axis(0), t).assign(&i);
            mask.index_axis_mut(Axis(0), t).assign(&m);
        }
        (image, mask)
    }

    fn region_props_request(image: &str, mask: &str, series: bool) -> RegionPropsRequest {
        RegionPropsRequest {
            id: "region-props".to_string(),
            image: array_ref(image, ElementType::Float32, &[]),
            mask: array_ref(mask, ElementType::Int32, &[]),
            timepoint: 0,
            series,
            window_size: 2,
            normalize: PercentileRange::default(),
            output_prefix: String::new(),
        }
    }

    fn link_request(region_props: RegionPropsArrays) -> LinkPredictionRequest {
        LinkPredictionRequest {
            id: "predict-links".to_string(),
            region_props,
            window_size: 2,
            edge_threshold: 0.05,
            model: TrackingModel::Ctc,
            mode: TrackingMode::Greedy,
            normalization: 1.0,
            output: "edges".to_string(),
            export_csv: None,
        }
    }

    fn outputs_as_arrays(result: &InvocationResult) -> RegionPropsArrays {
        let get = |n: &str| result.outputs[n].clone();
        RegionPropsArrays {
            labels: get("labels"),
            timepoints: get("timepoints"),
            coords: get("coords"),
            diameter: get("diameter"),
            intensity: get("intensity"),
            inertia_tensor: get("inertia_tensor"),
            border_dist: get("border_dist"),
        }
    }

    #[test]
    fn test_detection_invocation_writes_labels_in_input_dtype() {
        let fx = fixture();
        let mut image = Array2::<u16>::from_elem((24, 24), 10);
        image.slice_mut(s![8..16, 8..16]).fill(900);
        let input = fx.shm.write("frame", &image.into_dyn()).unwrap();

        let request = DetectionRequest {
            id: "detect-1".to_string(),
            image: input,
            has_channel: false,
            model: DetectionModel::Demo,
            prob_thresh: 0.5,
            nms_thresh: 0.4,
            diameters: DiameterSettings::default(),
            normalize: PercentileRange::default(),
            output: "label_image".to_string(),
        };
        let result = fx.execute(InvocationRequest::Detect(request)).unwrap();

        let output = &result.outputs["label_image"];
        assert_eq!(output.dtype, ElementType::Uint16);
        assert_eq!(output.shape, vec![24, 24]);
        let labels = fx.shm.read::<u16>(output).unwrap();
        assert_eq!(labels[[12, 12]], 1);
        assert_eq!(labels[[0, 0]], 0);

        assert!(InvocationResult::manifest_path(fx.shm.root(), "detect-1").exists());
        assert!(fx.sink.contains("1 objects saved to shared memory"));
        assert_eq!(result.messages_sent + 1, fx.sink.messages().len());
    }

    #[test]
    fn test_region_props_single_frame_layout() {
        let fx = fixture();
        let (image, mask) = frame(20, &[7, 3]);
        fx.shm.write("image", &image.into_dyn()).unwrap();
        fx.shm.write("mask", &mask.into_dyn()).unwrap();

        let mut request = region_props_request("image", "mask", false);
        request.image.shape = vec![20, 20];
        request.mask.shape = vec![20, 20];
        request.timepoint = 5;
        let result = fx.execute(InvocationRequest::RegionProps(request)).unwrap();

        assert_eq!(result.outputs.len(), 7);
        assert_eq!(result.outputs["labels"].shape, vec![2]);
        assert_eq!(result.outputs["coords"].shape, vec![2, 2]);
        assert_eq!(result.outputs["inertia_tensor"].shape, vec![4, 2]);

        let labels = fx.shm.read::<i32>(&result.outputs["labels"]).unwrap();
        assert_eq!(labels.as_slice().unwrap(), &[3, 7]);
        let timepoints = fx.shm.read::<i32>(&result.outputs["timepoints"]).unwrap();
        assert!(timepoints.iter().all(|&t| t == 5));
        assert!(fx.sink.contains("Feature extraction completed. Found 2 objects"));
    }

    #[test]
    fn test_series_measure_then_link() {
        let fx = fixture();
        let (image, mask) = series(24, &[&[1, 2, 3], &[], &[1, 3]]);
        let image = fx.shm.write("movie", &image.into_dyn()).unwrap();
        let mask = fx.shm.write("movie_labels", &mask.into_dyn()).unwrap();

        let mut request = region_props_request("movie", "movie_labels", true);
        request.image = image;
        request.mask = mask;
        let props = fx.execute(InvocationRequest::RegionProps(request)).unwrap();
        assert_eq!(props.outputs["labels"].shape, vec![3, 3]);
        assert_eq!(props.outputs["coords"].shape, vec![2, 3, 3]);

        let result = fx
            .execute(InvocationRequest::PredictLinks(link_request(
                outputs_as_arrays(&props),
            )))
            .unwrap();

        // [3, 0, 2] objects with window size 2 give two windows
        assert_eq!(*fx.backend.windows_seen.borrow(), vec![[0, 2], [1, 3]]);
        // nothing at t=1, so nothing links
        let edges = fx.shm.read::<f32>(&result.outputs["edges"]).unwrap();
        assert_eq!(edges.shape(), &[0, 5]);
        assert!(fx.sink.contains("Tracking graph construction completed. Nodes: 3, Edges: 0"));
        assert!(fx.sink.contains("0 edges saved to shared memory"));
    }

    #[test]
    fn test_link_prediction_writes_edges_and_csv() {
        let fx = fixture();
        let (image, mask) = series(24, &[&[4, 9], &[4, 9], &[9]]);
        let image = fx.shm.write("movie", &image.into_dyn()).unwrap();
        let mask = fx.shm.write("movie_labels", &mask.into_dyn()).unwrap();
        let mut request = region_props_request("movie", "movie_labels", true);
        request.image = image;
        request.mask = mask;
        request.output_prefix = "rp_".to_string();
        let props = fx.execute(InvocationRequest::RegionProps(request)).unwrap();
        assert_eq!(props.outputs["labels"].name, "rp_labels");

        let csv_path = fx.shm.root().join("edges.csv");
        let mut request = link_request(outputs_as_arrays(&props));
        request.export_csv = Some(csv_path.clone());
        let result = fx.execute(InvocationRequest::PredictLinks(request)).unwrap();

        let edges = fx.shm.read::<f32>(&result.outputs["edges"]).unwrap();
        assert_eq!(edges.shape(), &[3, 5]);
        assert_eq!(
            edges.slice(s![0, ..]).to_vec(),
            vec![0.0, 4.0, 1.0, 4.0, 0.9]
        );
        let csv = fs::read_to_string(&csv_path).unwrap();
        assert_eq!(csv.lines().count(), 4);
        assert!(fx.sink.contains("3 edges saved to shared memory"));
        assert!(fx.cache.root().join("trackastra").join("ctc").exists());
    }

    #[test]
    fn test_failure_discards_outputs_and_writes_no_manifest() {
        let fx = fixture();
        let (image, mask) = series(24, &[&[1], &[1]]);
        let image = fx.shm.write("movie", &image.into_dyn()).unwrap();
        let mask = fx.shm.write("movie_labels", &mask.into_dyn()).unwrap();
        let mut request = region_props_request("movie", "movie_labels", true);
        request.image = image;
        request.mask = mask;
        let props = fx.execute(InvocationRequest::RegionProps(request)).unwrap();

        let mut request = link_request(outputs_as_arrays(&props));
        request.export_csv = Some(fx.shm.root().join("missing").join("edges.csv"));
        let err = fx
            .execute(InvocationRequest::PredictLinks(request))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("edge table export"));

        assert!(!fx.shm.list().contains(&"edges".to_string()));
        assert!(!InvocationResult::manifest_path(fx.shm.root(), "predict-links").exists());
        let last = fx.sink.messages().pop().unwrap();
        assert!(last.contains("Failed to create edge table export"));
    }

    #[test]
    fn test_incompatible_tracking_model_is_fatal() {
        let fx = fixture();
        let mut image = Array3::<f32>::zeros((8, 8, 8));
        let mut mask = Array3::<i32>::zeros((8, 8, 8));
        image.slice_mut(s![2..5, 2..5, 2..5]).fill(100.0);
        mask.slice_mut(s![2..5, 2..5, 2..5]).fill(1);
        // A single 3D frame measured per timepoint gives 3D coordinates
        let image = fx.shm.write("vol", &image.insert_axis(Axis(0)).into_dyn()).unwrap();
        let mask = fx.shm.write("vol_labels", &mask.insert_axis(Axis(0)).into_dyn()).unwrap();
        let mut request = region_props_request("vol", "vol_labels", true);
        request.image = image;
        request.mask = mask;
        let props = fx.execute(InvocationRequest::RegionProps(request)).unwrap();
        assert_eq!(props.outputs["coords"].shape, vec![3, 1, 1]);

        let mut request = link_request(outputs_as_arrays(&props));
        request.model = TrackingModel::General2d;
        let err = fx
            .execute(InvocationRequest::PredictLinks(request))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::IncompatibleModel { dims: 3, .. })
        ));
        // checked before any download
        assert!(!fx.cache.root().join("trackastra").exists());
    }
}
