//! The `ocr` subcommand.

use std::sync::Arc;

use clap::Args;

use super::LayerOpts;
use crate::{
    async_utils::io::write_json_pretty,
    pipeline::{
        RunController, RunOptions,
        feedback::{CancelFlag, UiFeedback},
    },
    prelude::*,
    recognizer::{
        EngineMode, RecognitionConfig, RecognitionErrorPolicy, SegmentationMode,
        TextRecognizer, tesseract::TesseractEngine,
    },
    sink::GeoJsonSink,
    spatial_index::SpatialIndex,
    ui::Ui,
};

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    #[clap(flatten)]
    pub layers: LayerOpts,

    /// The text field that receives recognized text. It must already exist.
    #[clap(short = 'f', long = "field", value_name = "NAME")]
    pub text_field: String,

    /// Page segmentation mode, by number (0-13) or name.
    #[clap(long = "psm", value_name = "MODE", default_value = "7")]
    pub segmentation_mode: SegmentationMode,

    /// OCR engine mode, by number (0-3) or name.
    #[clap(long = "oem", value_name = "MODE", default_value = "1")]
    pub engine_mode: EngineMode,

    /// Recognition language, as passed to tesseract (for example, `pol` or
    /// `eng+pol`).
    #[clap(long = "lang", value_name = "CODE", default_value = "pol")]
    pub language: String,

    /// Remove one trailing comma from recognized text.
    #[clap(
        long,
        value_name = "BOOL",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub strip_trailing_comma: bool,

    /// Folder for temporary files. Defaults to the system temporary folder.
    #[clap(long, value_name = "DIR")]
    pub temp_dir: Option<PathBuf>,

    /// The tesseract executable.
    #[clap(
        long,
        env = "TESSERACT_CMD",
        value_name = "PATH",
        default_value = "tesseract"
    )]
    pub tesseract_cmd: PathBuf,

    /// Folder holding tesseract's language data.
    #[clap(long, value_name = "DIR")]
    pub tessdata_dir: Option<PathBuf>,

    /// What to do when recognition fails for one feature.
    #[clap(long, value_enum, default_value_t = RecognitionErrorPolicy::Abort)]
    pub on_recognition_error: RecognitionErrorPolicy,

    /// Output path. Use `.geojson` or `.json` for a FeatureCollection, or
    /// anything else for one feature per line. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Write a JSON summary of the run here.
    #[clap(long, value_name = "PATH")]
    pub summary_out: Option<PathBuf>,
}

impl OcrOpts {
    fn recognition_config(&self) -> RecognitionConfig {
        RecognitionConfig {
            segmentation_mode: self.segmentation_mode,
            engine_mode: self.engine_mode,
            language: self.language.clone(),
            strip_trailing_comma: self.strip_trailing_comma,
        }
    }
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    // Configuration errors must surface before we read any features.
    let rasters = opts.layers.resolve_rasters().await?;
    let layer = opts.layers.read_layer().await?;
    layer.check_text_field(&opts.text_field)?;
    let index = SpatialIndex::build(&layer.features);
    debug!(entries = index.len(), "Built spatial index");

    let config = opts.recognition_config();
    info!(
        psm = %config.segmentation_mode,
        oem = %config.engine_mode,
        lang = %config.language,
        "Recognition: {}",
        config.segmentation_mode.description()
    );
    let engine = TesseractEngine::new(
        opts.tesseract_cmd.clone(),
        opts.tessdata_dir.clone(),
        opts.temp_dir.clone(),
        config.clone(),
    );
    let recognizer = TextRecognizer::new(Arc::new(engine), config.strip_trailing_comma);

    let cancel = CancelFlag::new();
    cancel.cancel_on_ctrl_c();
    let feedback = UiFeedback::new(&ui, cancel);

    let controller = RunController::new(
        &layer,
        &index,
        recognizer,
        &feedback,
        RunOptions {
            text_field: opts.text_field.clone(),
            policy: opts.on_recognition_error,
        },
    );

    // Always close the output, so a failed run keeps what it emitted.
    let mut sink = GeoJsonSink::create(opts.output_path.as_deref(), &layer).await?;
    let result = controller.run(&rasters, &mut sink).await;
    debug!(features = sink.written(), "Finishing output");
    sink.finish().await?;
    feedback.finish();
    let summary = result?;

    if let Some(path) = &opts.summary_out {
        write_json_pretty(Some(path), &summary).await?;
    }
    if summary.canceled {
        return Err(anyhow!(
            "canceled after recognizing {} of {} features",
            summary.recognized,
            summary.total
        ));
    }
    info!("Recognized: {}", summary.recognized);
    Ok(())
}
