//! OCR engine wrapping the `tesseract` CLI tool.

use std::io::Cursor;

use image::{GrayImage, ImageFormat};
use tokio::process::Command;

use super::{OcrEngine, RecognitionConfig};
use crate::{async_utils::check_for_command_failure, prelude::*};

/// Runs `tesseract` once per image.
///
/// Every call gets its own temporary directory, so there are no shared input
/// files to trip over.
#[derive(Clone, Debug)]
pub struct TesseractEngine {
    command: PathBuf,
    tessdata_dir: Option<PathBuf>,
    temp_dir: Option<PathBuf>,
    config: RecognitionConfig,
}

impl TesseractEngine {
    /// Create a new engine.
    ///
    /// If `temp_dir` is set, scratch files are created inside it. Otherwise
    /// the system temporary directory is used.
    pub fn new(
        command: PathBuf,
        tessdata_dir: Option<PathBuf>,
        temp_dir: Option<PathBuf>,
        config: RecognitionConfig,
    ) -> Self {
        Self {
            command,
            tessdata_dir,
            temp_dir,
            config,
        }
    }

    /// The arguments passed after the input path.
    fn arguments(&self) -> Vec<String> {
        let mut args = vec![
            "stdout".to_owned(),
            "--psm".to_owned(),
            self.config.segmentation_mode.number().to_string(),
            "--oem".to_owned(),
            self.config.engine_mode.number().to_string(),
            "-l".to_owned(),
            self.config.language.clone(),
        ];
        if let Some(tessdata_dir) = &self.tessdata_dir {
            args.push("--tessdata-dir".to_owned());
            args.push(tessdata_dir.display().to_string());
        }
        args
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        match &self.temp_dir {
            Some(parent) => tempfile::TempDir::with_prefix_in("raster-ocr", parent)
                .with_context(|| {
                    format!("cannot create scratch directory in {}", parent.display())
                }),
            None => tempfile::TempDir::with_prefix("raster-ocr")
                .context("cannot create scratch directory"),
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    #[instrument(level = "debug", skip_all, fields(width = image.width(), height = image.height()))]
    async fn ocr_image(&self, image: &GrayImage) -> Result<String> {
        let mut png = Cursor::new(Vec::new());
        image
            .write_to(&mut png, ImageFormat::Png)
            .context("cannot encode image as PNG")?;

        // Write our input to a temporary file.
        let tmpdir = self.scratch_dir()?;
        let input_path = tmpdir.path().join("input.png");
        tokio::fs::write(&input_path, png.into_inner())
            .await
            .context("cannot write tesseract input file")?;

        // Run tesseract, reading the text from standard output.
        let output = Command::new(&self.command)
            .arg(&input_path)
            .args(self.arguments())
            .output()
            .await
            .with_context(|| format!("cannot run {}", self.command.display()))?;
        check_for_command_failure("tesseract", &output, None)?;

        let text = String::from_utf8(output.stdout)
            .context("tesseract output was not valid UTF-8")?;
        // Tesseract ends its output with a newline and a form feed.
        Ok(text
            .trim_end_matches(|c: char| c.is_whitespace() || c == '\u{000C}')
            .to_owned())
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;
    use crate::recognizer::SegmentationMode;

    #[test]
    fn builds_command_line() {
        let config = RecognitionConfig {
            segmentation_mode: SegmentationMode::SingleWord,
            language: "eng+pol".to_owned(),
            ..RecognitionConfig::default()
        };
        let engine = TesseractEngine::new(
            "tesseract".into(),
            Some("/opt/tessdata".into()),
            None,
            config,
        );
        assert_eq!(
            engine.arguments(),
            vec![
                "stdout",
                "--psm",
                "8",
                "--oem",
                "1",
                "-l",
                "eng+pol",
                "--tessdata-dir",
                "/opt/tessdata"
            ]
        );
    }

    #[tokio::test]
    async fn scratch_files_go_in_temp_dir() -> Result<()> {
        let parent = tempfile::TempDir::with_prefix("scratch-parent")?;
        let engine = TesseractEngine::new(
            "tesseract".into(),
            None,
            Some(parent.path().to_owned()),
            RecognitionConfig::default(),
        );
        let first = engine.scratch_dir()?;
        let second = engine.scratch_dir()?;
        assert!(first.path().starts_with(parent.path()));
        assert_ne!(first.path(), second.path());
        Ok(())
    }

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let engine = TesseractEngine::new(
            "/nonexistent/tesseract".into(),
            None,
            None,
            RecognitionConfig::default(),
        );
        let image = GrayImage::from_pixel(4, 4, Luma([255]));
        assert!(engine.ocr_image(&image).await.is_err());
    }

    #[tokio::test]
    #[ignore = "Requires tesseract to be installed"]
    async fn blank_image_yields_empty_text() -> Result<()> {
        let config = RecognitionConfig {
            language: "eng".to_owned(),
            ..RecognitionConfig::default()
        };
        let engine = TesseractEngine::new("tesseract".into(), None, None, config);
        let image = GrayImage::from_pixel(64, 32, Luma([255]));
        assert_eq!(engine.ocr_image(&image).await?, "");
        Ok(())
    }
}
