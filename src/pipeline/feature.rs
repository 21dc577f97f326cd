//! Per-feature processing: isolate, clip, recognize, emit.

use std::{fmt, sync::Arc};

use super::{WorkloadCounter, feedback::Feedback};
use crate::{
    async_utils::spawn_blocking_propagating_panics,
    errors::PipelineError,
    layer::{Crs, PolygonFeature},
    prelude::*,
    raster::{
        Raster8,
        clip::{IsolatedFeature, clip_to_feature},
    },
    recognizer::{RecognitionErrorPolicy, TextRecognizer},
    sink::FeatureSink,
};

/// Where a feature is in its trip through [`FeatureProcessor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureStage {
    Idle,
    GeometryIsolated,
    Clipped,
    Recognized,
    Emitted,
}

impl fmt::Display for FeatureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeatureStage::Idle => "idle",
            FeatureStage::GeometryIsolated => "geometry isolated",
            FeatureStage::Clipped => "clipped",
            FeatureStage::Recognized => "recognized",
            FeatureStage::Emitted => "emitted",
        };
        f.write_str(name)
    }
}

/// What happened to one feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureOutcome {
    /// The feature was written to the sink.
    Emitted,
    /// Recognition failed and the feature was left out.
    Skipped,
}

/// Runs features through the pipeline, one at a time.
pub struct FeatureProcessor<'a> {
    workspace: IsolatedFeature,
    stage: FeatureStage,
    recognizer: &'a TextRecognizer,
    feedback: &'a dyn Feedback,
    text_field: &'a str,
    policy: RecognitionErrorPolicy,
    crs: Option<&'a Crs>,
}

impl<'a> FeatureProcessor<'a> {
    /// Create a processor. `crs` is assigned to every raster before clipping.
    pub fn new(
        recognizer: &'a TextRecognizer,
        feedback: &'a dyn Feedback,
        text_field: &'a str,
        policy: RecognitionErrorPolicy,
        crs: Option<&'a Crs>,
    ) -> Self {
        Self {
            workspace: IsolatedFeature::new(),
            stage: FeatureStage::Idle,
            recognizer,
            feedback,
            text_field,
            policy,
            crs,
        }
    }

    /// The stage reached by the last feature processed.
    pub fn stage(&self) -> FeatureStage {
        self.stage
    }

    fn advance(&mut self, stage: FeatureStage) {
        trace!(from = %self.stage, to = %stage, "Feature stage");
        self.stage = stage;
    }

    /// Process `feature` against `raster`, emitting it to `sink` and counting
    /// it in `counter`.
    ///
    /// Returns [`FeatureOutcome::Skipped`] only when recognition fails under
    /// [`RecognitionErrorPolicy::Skip`]. Every other failure is an error.
    #[instrument(level = "debug", skip_all, fields(id = %feature.id, raster = %raster.name))]
    pub async fn process(
        &mut self,
        raster: &Arc<Raster8>,
        feature: &PolygonFeature,
        sink: &mut dyn FeatureSink,
        counter: &mut WorkloadCounter,
    ) -> Result<FeatureOutcome> {
        self.advance(FeatureStage::Idle);

        self.workspace.isolate(feature);
        debug_assert_eq!(self.workspace.len(), 1);
        let isolated = self
            .workspace
            .current()
            .cloned()
            .ok_or_else(|| anyhow!("feature {} was not isolated", feature.id))?;
        self.advance(FeatureStage::GeometryIsolated);

        let clip = {
            let source = raster.clone();
            let cutline = isolated.shape().clone();
            let crs = self.crs.cloned();
            spawn_blocking_propagating_panics(move || {
                clip_to_feature(&source, &cutline, crs.as_ref())
            })
            .await
            .with_context(|| {
                format!("cannot clip raster {:?} to feature {}", raster.name, feature.id)
            })?
        };
        debug!(
            width = clip.image.width(),
            height = clip.image.height(),
            "Clipped raster"
        );
        self.advance(FeatureStage::Clipped);

        let text = match self.recognizer.recognize(&clip.image).await {
            Ok(text) => text,
            Err(source) => {
                let err = anyhow::Error::from(PipelineError::Recognition {
                    feature_id: feature.id,
                    raster: raster.name.clone(),
                    source,
                });
                match self.policy {
                    RecognitionErrorPolicy::Abort => return Err(err),
                    RecognitionErrorPolicy::Skip => {
                        warn!("Skipping feature: {:#}", err);
                        self.feedback
                            .push_info(&format!("Skipped feature {}: {:#}", feature.id, err));
                        self.advance(FeatureStage::Idle);
                        return Ok(FeatureOutcome::Skipped);
                    }
                }
            }
        };
        self.advance(FeatureStage::Recognized);

        let mut output = isolated;
        output.stamp_text(self.text_field, text.clone());
        sink.add_feature(&output)
            .await
            .with_context(|| format!("cannot write feature {}", feature.id))?;
        self.advance(FeatureStage::Emitted);

        if let Some(percent) = counter.record_completion() {
            self.feedback.set_progress(percent);
        }
        self.feedback.set_progress_text(&format!(
            "{}/{}  id: {}",
            counter.actual(),
            counter.total(),
            feature.id
        ));
        self.feedback.push_info(&text);
        Ok(FeatureOutcome::Emitted)
    }
}
