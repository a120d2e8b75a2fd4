//! Named pipelines selectable at startup.

use std::{collections::BTreeMap, fmt, sync::Arc};

use anyhow::Result;
use ml_core::{Detection, Detector, InferenceEngine, detector::ImageView};
use thiserror::Error;
use tracing::{debug, warn};
use video_ingest::{ColorFrame, DepthFrame, FrameFormat};

use crate::{
    localize::{DepthSampling, localize},
    pipeline::config::DetectionConfig,
};

pub const DETECTION_DEPTH: &str = "detection-depth";
pub const PASSTHROUGH: &str = "passthrough";
pub const IDLE: &str = "idle";
pub const BUILTIN_PIPELINES: [&str; 3] = [DETECTION_DEPTH, PASSTHROUGH, IDLE];

/// One frame in, detections out.
pub trait Pipeline: Send {
    fn name(&self) -> &str;

    fn process(&mut self, color: &ColorFrame, depth: &DepthFrame) -> Result<Vec<Detection>>;

    /// Whether results should reach the publisher at all.
    fn publishes(&self) -> bool {
        true
    }
}

/// Creates inference engines for pipelines that need one.
pub type EngineFactory = Arc<dyn Fn() -> Result<Box<dyn InferenceEngine>> + Send + Sync>;

/// Everything a pipeline factory may draw on.
#[derive(Clone)]
pub struct PipelineContext {
    pub detection: DetectionConfig,
    pub engine: Option<EngineFactory>,
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("detection", &self.detection)
            .field("engine", &self.engine.is_some())
            .finish()
    }
}

type Factory = Box<dyn Fn(&PipelineContext) -> Result<Box<dyn Pipeline>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown pipeline {name:?}, available: {available}")]
    Unknown { name: String, available: String },
    #[error("failed to build pipeline {name:?}: {source:#}")]
    Build {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Name to factory table, populated explicitly at startup.
pub struct PipelineRegistry {
    factories: BTreeMap<String, Factory>,
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl PipelineRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(DETECTION_DEPTH, |ctx| {
            let factory = ctx
                .engine
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("no inference engine configured"))?;
            let engine = factory()?;
            Ok(Box::new(DetectionDepthPipeline::new(
                Detector::new(engine),
                &ctx.detection,
            )))
        });
        registry.register(PASSTHROUGH, |_| Ok(Box::new(PassthroughPipeline)));
        registry.register(IDLE, |_| Ok(Box::new(IdlePipeline)));
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&PipelineContext) -> Result<Box<dyn Pipeline>> + Send + Sync + 'static,
    {
        if self.factories.insert(name.to_owned(), Box::new(factory)).is_some() {
            warn!(pipeline = name, "pipeline factory replaced");
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn build(&self, name: &str, ctx: &PipelineContext) -> Result<Box<dyn Pipeline>, RegistryError> {
        let factory = self.factories.get(name).ok_or_else(|| RegistryError::Unknown {
            name: name.to_owned(),
            available: self.names().join(", "),
        })?;
        debug!(pipeline = name, "building pipeline");
        factory(ctx).map_err(|source| RegistryError::Build {
            name: name.to_owned(),
            source,
        })
    }
}

/// Detect objects, then attach a 3D position from the depth frame.
pub struct DetectionDepthPipeline {
    detector: Detector,
    confidence: f32,
    iou: f32,
    sampling: DepthSampling,
}

impl DetectionDepthPipeline {
    pub fn new(detector: Detector, config: &DetectionConfig) -> Self {
        Self {
            detector,
            confidence: config.confidence,
            iou: config.iou,
            sampling: config.sampling,
        }
    }
}

impl Pipeline for DetectionDepthPipeline {
    fn name(&self) -> &str {
        DETECTION_DEPTH
    }

    fn process(&mut self, color: &ColorFrame, depth: &DepthFrame) -> Result<Vec<Detection>> {
        let converted;
        let bgr = match color.format {
            FrameFormat::Bgr8 => color.data.as_slice(),
            FrameFormat::Gray8 => {
                converted = color.to_bgr8();
                converted.as_slice()
            }
        };
        let image = ImageView::new(bgr, color.width, color.height);
        let candidates = self.detector.detect(image, self.confidence, self.iou)?;

        let mut detections = Vec::with_capacity(candidates.len());
        let mut last_error = None;
        let mut dropped = 0usize;
        for candidate in candidates {
            match localize(&candidate.rect, depth, self.sampling) {
                Ok(Some(hit)) => detections.push(candidate.with_position(hit.point, hit.depth_mm)),
                Ok(None) => detections.push(candidate),
                Err(err) => {
                    warn!(class_id = candidate.class_id, "dropping detection: {err}");
                    metrics::counter!("pipeline_dropped_candidates_total").increment(1);
                    dropped += 1;
                    last_error = Some(err);
                }
            }
        }
        // Every candidate failed, so the depth frame itself is unusable.
        if detections.is_empty() {
            if let Some(err) = last_error {
                return Err(anyhow::Error::new(err)
                    .context(format!("all {dropped} candidate(s) failed depth localization")));
            }
        }
        Ok(detections)
    }
}

/// Keeps the camera and publisher exercised without running a model.
pub struct PassthroughPipeline;

impl Pipeline for PassthroughPipeline {
    fn name(&self) -> &str {
        PASSTHROUGH
    }

    fn process(&mut self, _color: &ColorFrame, _depth: &DepthFrame) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

/// Consumes frames and publishes nothing.
pub struct IdlePipeline;

impl Pipeline for IdlePipeline {
    fn name(&self) -> &str {
        IDLE
    }

    fn process(&mut self, _color: &ColorFrame, _depth: &DepthFrame) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }

    fn publishes(&self) -> bool {
        false
    }
}
