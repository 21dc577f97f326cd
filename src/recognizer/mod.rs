//! Text recognition.
//!
//! An [`OcrEngine`] turns an image into raw text. [`TextRecognizer`] wraps an
//! engine and applies our text cleanup.

use std::{fmt, str::FromStr, sync::Arc};

use clap::ValueEnum;
use image::GrayImage;

use crate::prelude::*;

pub mod tesseract;

/// Declare a mode enum whose values have a fixed number, a kebab-case name
/// and a description. Modes parse from either the number or the name, and
/// display as the number.
macro_rules! numbered_modes {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident = ($number:literal, $label:literal, $description:literal),)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
        pub enum $name {
            $(#[doc = $description] $variant,)+
        }

        impl $name {
            /// Every mode, in numeric order.
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            /// The number the engine knows this mode by.
            pub fn number(self) -> u8 {
                match self {
                    $($name::$variant => $number,)+
                }
            }

            /// A short name for this mode.
            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }

            /// A human-readable description.
            pub fn description(self) -> &'static str {
                match self {
                    $($name::$variant => $description,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.number())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self> {
                let s = s.trim();
                $name::ALL
                    .iter()
                    .copied()
                    .find(|mode| s == mode.number().to_string() || s.eq_ignore_ascii_case(mode.label()))
                    .ok_or_else(|| {
                        let known = $name::ALL
                            .iter()
                            .map(|mode| format!("{} ({})", mode.number(), mode.label()))
                            .collect::<Vec<_>>()
                            .join(", ");
                        anyhow!("unknown {} {:?} (expected one of: {})", stringify!($name), s, known)
                    })
            }
        }
    };
}

numbered_modes! {
    /// How the engine splits an image into text regions.
    pub enum SegmentationMode {
        OsdOnly = (0, "osd-only", "Orientation and script detection (OSD) only."),
        AutoOsd = (1, "auto-osd", "Automatic page segmentation with OSD."),
        AutoOnly = (2, "auto-only", "Automatic page segmentation, but no OSD, or OCR."),
        Auto = (3, "auto", "Fully automatic page segmentation, but no OSD."),
        SingleColumn = (4, "single-column", "Assume a single column of text of variable sizes."),
        SingleBlockVertical = (5, "single-block-vertical", "Assume a single uniform block of vertically aligned text."),
        SingleBlock = (6, "single-block", "Assume a single uniform block of text."),
        SingleLine = (7, "single-line", "Treat the image as a single text line."),
        SingleWord = (8, "single-word", "Treat the image as a single word."),
        CircleWord = (9, "circle-word", "Treat the image as a single word in a circle."),
        SingleChar = (10, "single-char", "Treat the image as a single character."),
        SparseText = (11, "sparse-text", "Sparse text. Find as much text as possible in no particular order."),
        SparseTextOsd = (12, "sparse-text-osd", "Sparse text with OSD."),
        RawLine = (13, "raw-line", "Raw line. Treat the image as a single text line, bypassing engine-specific hacks."),
    }
}

impl Default for SegmentationMode {
    fn default() -> Self {
        SegmentationMode::SingleLine
    }
}

numbered_modes! {
    /// Which recognition engine variant to use.
    pub enum EngineMode {
        Legacy = (0, "legacy", "Legacy engine only."),
        Lstm = (1, "lstm", "Neural net LSTM engine only."),
        LegacyLstm = (2, "legacy-lstm", "Legacy and LSTM engines combined."),
        Available = (3, "available", "Whatever the engine has available."),
    }
}

impl Default for EngineMode {
    fn default() -> Self {
        EngineMode::Lstm
    }
}

/// What to do when the engine fails on one feature.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum RecognitionErrorPolicy {
    /// Stop the whole run.
    #[default]
    Abort,
    /// Log the failure, leave the feature out of the output, and continue.
    Skip,
}

/// Recognition settings, fixed for a run.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognitionConfig {
    pub segmentation_mode: SegmentationMode,
    pub engine_mode: EngineMode,
    /// Engine language code, e.g. `pol` or `eng+pol`.
    pub language: String,
    /// Drop a single trailing comma from recognized text.
    pub strip_trailing_comma: bool,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            segmentation_mode: SegmentationMode::default(),
            engine_mode: EngineMode::default(),
            language: "pol".to_owned(),
            strip_trailing_comma: true,
        }
    }
}

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Recognize the text in `image`.
    async fn ocr_image(&self, image: &GrayImage) -> Result<String>;
}

/// Recognizes text and cleans it up.
#[derive(Clone)]
pub struct TextRecognizer {
    engine: Arc<dyn OcrEngine>,
    strip_trailing_comma: bool,
}

impl TextRecognizer {
    /// Wrap `engine`.
    pub fn new(engine: Arc<dyn OcrEngine>, strip_trailing_comma: bool) -> Self {
        Self {
            engine,
            strip_trailing_comma,
        }
    }

    /// Recognize the text in `image`. Engine errors are returned as-is.
    pub async fn recognize(&self, image: &GrayImage) -> Result<String> {
        let text = self.engine.ocr_image(image).await?;
        if self.strip_trailing_comma {
            Ok(strip_trailing_comma(&text).to_owned())
        } else {
            Ok(text)
        }
    }
}

/// Remove exactly one trailing comma, if present.
pub fn strip_trailing_comma(text: &str) -> &str {
    text.strip_suffix(',').unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEngine(&'static str);

    #[async_trait]
    impl OcrEngine for FixedEngine {
        async fn ocr_image(&self, _image: &GrayImage) -> Result<String> {
            Ok(self.0.to_owned())
        }
    }

    #[test]
    fn strips_one_trailing_comma() {
        assert_eq!(strip_trailing_comma("abc,"), "abc");
        assert_eq!(strip_trailing_comma("abc,,"), "abc,");
        assert_eq!(strip_trailing_comma("abc, "), "abc, ");
        assert_eq!(strip_trailing_comma("abc."), "abc.");
        assert_eq!(strip_trailing_comma(","), "");
        assert_eq!(strip_trailing_comma(""), "");
    }

    #[test]
    fn stripping_stripped_text_changes_nothing() {
        let once = strip_trailing_comma("Main St. 12,");
        assert_eq!(strip_trailing_comma(once), once);
    }

    #[test]
    fn parses_modes_by_number_and_name() {
        assert_eq!(
            "7".parse::<SegmentationMode>().unwrap(),
            SegmentationMode::SingleLine
        );
        assert_eq!(
            "sparse-text".parse::<SegmentationMode>().unwrap(),
            SegmentationMode::SparseText
        );
        assert_eq!("1".parse::<EngineMode>().unwrap(), EngineMode::Lstm);
        assert!("14".parse::<SegmentationMode>().is_err());
        assert!("4".parse::<EngineMode>().is_err());
        assert_eq!(SegmentationMode::ALL.len(), 14);
        assert_eq!(EngineMode::ALL.len(), 4);
        assert_eq!(SegmentationMode::RawLine.to_string(), "13");
    }

    #[test]
    fn defaults_match_documented_defaults() {
        let config = RecognitionConfig::default();
        assert_eq!(config.segmentation_mode.number(), 7);
        assert_eq!(config.engine_mode.number(), 1);
        assert!(config.strip_trailing_comma);
    }

    #[tokio::test]
    async fn recognizer_applies_comma_policy() -> Result<()> {
        let image = GrayImage::new(1, 1);
        let stripping = TextRecognizer::new(Arc::new(FixedEngine("Kraków,")), true);
        assert_eq!(stripping.recognize(&image).await?, "Kraków");
        let keeping = TextRecognizer::new(Arc::new(FixedEngine("Kraków,")), false);
        assert_eq!(keeping.recognize(&image).await?, "Kraków,");
        Ok(())
    }
}
