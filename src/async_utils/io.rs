//! I/O utilities.
//!
//! Reading JSON and TOML configuration files, and writing JSONL output to a
//! file or to standard output.

use futures::{pin_mut, stream::StreamExt as _};
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use super::BoxedStream;
use crate::prelude::*;

/// A stream of [`serde_json::Value`] values.
pub type JsonStream = BoxedStream<Result<Value>>;

/// Read TOML or JSON from a file. JSON is detected by extension.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    // Read all at once because our parsing libraries don't do async I/O.
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    let ext = path.extension().unwrap_or_default();
    if ext == "json" {
        serde_json::from_str(&data).with_context(|| {
            format!("Failed to parse JSON from file at path: {:?}", path)
        })
    } else {
        toml::from_str(&data).with_context(|| {
            format!("Failed to parse TOML from file at path: {:?}", path)
        })
    }
}

/// Writer type returned by [`create_writer`].
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>;

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(path: Option<&Path>) -> Result<BoxedWriter> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write a stream of JSON values to either standard output or a file, one per
/// line.
pub async fn write_output(path: Option<&Path>, stream: JsonStream) -> Result<()> {
    let mut writer = BufWriter::new(create_writer(path).await?);
    pin_mut!(stream);
    while let Some(value) = stream.next().await {
        let value = value?;
        let json = serde_json::to_string(&value)
            .with_context(|| format!("Failed to serialize JSON from value: {:?}", value))?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

/// Write a single value as pretty-printed JSON.
pub async fn write_json_pretty<T: Serialize>(path: Option<&Path>, value: &T) -> Result<()> {
    let mut writer = create_writer(path).await?;
    let json = serde_json::to_string_pretty(value).context("failed to serialize JSON")?;
    writer
        .write_all(json.as_bytes())
        .await
        .context("failed to write JSON")?;
    writer.write_all(b"\n").await.context("failed to write JSON")?;
    writer.flush().await.context("failed to flush JSON")?;
    Ok(())
}
