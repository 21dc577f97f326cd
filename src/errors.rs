//! Errors that callers need to tell apart.
//!
//! Almost everything in this crate returns [`anyhow::Result`]. The few failure
//! kinds that change what the run does next are wrapped in [`PipelineError`],
//! so that callers can find them again with [`anyhow::Error::downcast_ref`].

use thiserror::Error;

use crate::layer::FeatureId;

/// Failures with a defined effect on the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The run cannot start. Raised before any feature is read.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A raster could not be converted to single-band 8-bit. The raster is
    /// skipped and the run continues.
    #[error("could not convert raster {raster:?} to single-band 8-bit")]
    Conversion {
        raster: String,
        #[source]
        source: anyhow::Error,
    },

    /// The recognition engine failed on one feature.
    #[error("text recognition failed for feature {feature_id} on raster {raster:?}")]
    Recognition {
        feature_id: FeatureId,
        raster: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Build a [`PipelineError::Configuration`] wrapped as an [`anyhow::Error`].
    pub fn configuration(msg: impl Into<String>) -> anyhow::Error {
        PipelineError::Configuration(msg.into()).into()
    }

    /// Is this error (or anything it wraps) a configuration error?
    #[cfg(test)]
    pub fn is_configuration(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<PipelineError>(),
                Some(PipelineError::Configuration(_))
            )
        })
    }
}
