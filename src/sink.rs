//! Where finished features go.
//!
//! Every emitted feature is written as soon as it is recognized, so a run that
//! is canceled or aborted still leaves behind everything emitted so far.

use tokio::io::{AsyncWriteExt as _, BufWriter};

use crate::{
    async_utils::io::{BoxedWriter, create_writer},
    layer::{PolygonFeature, PolygonLayer},
    prelude::*,
};

/// Receives features once their text has been set.
#[async_trait]
pub trait FeatureSink: Send {
    /// Add one feature to the output.
    async fn add_feature(&mut self, feature: &PolygonFeature) -> Result<()>;
}

/// How features are laid out in the output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// One GeoJSON `FeatureCollection` document.
    FeatureCollection,
    /// One GeoJSON `Feature` per line.
    JsonLines,
}

impl OutputFormat {
    /// Pick a format for `path`. Files ending in `.geojson` or `.json` get a
    /// `FeatureCollection`, everything else (including standard output) gets
    /// JSON Lines.
    pub fn for_path(path: Option<&Path>) -> Self {
        let extension = path
            .and_then(|p| p.extension())
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("geojson") | Some("json") => OutputFormat::FeatureCollection,
            _ => OutputFormat::JsonLines,
        }
    }
}

/// Writes features as GeoJSON to a file or standard output.
pub struct GeoJsonSink {
    writer: BufWriter<BoxedWriter>,
    format: OutputFormat,
    fields: Vec<String>,
    written: usize,
}

impl GeoJsonSink {
    /// Create the output at `path` (or standard output), using the schema of
    /// `layer`.
    pub async fn create(path: Option<&Path>, layer: &PolygonLayer) -> Result<Self> {
        let format = OutputFormat::for_path(path);
        let mut writer = BufWriter::new(create_writer(path).await?);
        if format == OutputFormat::FeatureCollection {
            let mut header = serde_json::json!({ "type": "FeatureCollection" });
            if let Some(crs) = &layer.crs {
                header["crs"] = serde_json::json!({
                    "type": "name",
                    "properties": { "name": crs.to_urn() },
                });
            }
            let header = serde_json::to_string(&header)
                .context("failed to serialize FeatureCollection header")?;
            // Reopen the object so we can stream the features into it.
            let header = header
                .strip_suffix('}')
                .ok_or_else(|| anyhow!("unexpected FeatureCollection header {}", header))?;
            writer
                .write_all(format!("{header},\"features\":[\n").as_bytes())
                .await
                .context("failed to write output header")?;
        }
        Ok(Self {
            writer,
            format,
            fields: layer.fields.clone(),
            written: 0,
        })
    }

    /// How many features have been written.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Close the output. Must be called, even after a failed run, or a
    /// `FeatureCollection` will be left unterminated.
    pub async fn finish(mut self) -> Result<()> {
        if self.format == OutputFormat::FeatureCollection {
            self.writer
                .write_all(b"\n]}\n")
                .await
                .context("failed to write output trailer")?;
        }
        self.writer.flush().await.context("failed to flush output")?;
        debug!(features = self.written, "Closed output");
        Ok(())
    }
}

#[async_trait]
impl FeatureSink for GeoJsonSink {
    async fn add_feature(&mut self, feature: &PolygonFeature) -> Result<()> {
        let json = serde_json::to_string(&feature.to_geojson(&self.fields))
            .with_context(|| format!("failed to serialize feature {}", feature.id))?;
        let separator: &[u8] = match (self.format, self.written) {
            (OutputFormat::FeatureCollection, 0) => b"",
            (OutputFormat::FeatureCollection, _) => b",\n",
            (OutputFormat::JsonLines, _) => b"",
        };
        self.writer
            .write_all(separator)
            .await
            .context("failed to write output")?;
        self.writer
            .write_all(json.as_bytes())
            .await
            .context("failed to write output")?;
        if self.format == OutputFormat::JsonLines {
            self.writer
                .write_all(b"\n")
                .await
                .context("failed to write output")?;
        }
        self.written += 1;
        Ok(())
    }
}

/// Collects features in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemorySink {
    pub(crate) features: Vec<PolygonFeature>,
}

#[cfg(test)]
#[async_trait]
impl FeatureSink for MemorySink {
    async fn add_feature(&mut self, feature: &PolygonFeature) -> Result<()> {
        self.features.push(feature.clone());
        Ok(())
    }
}
