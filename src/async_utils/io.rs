//! I/O utilities.
//!
//! We read lists of input paths (one per line) from files or standard input,
//! and write JSON or JSONL output to files or standard output.

use futures::{Stream, StreamExt as _, TryStreamExt as _, pin_mut};
use serde::Serialize;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader, BufWriter},
};
use tokio_stream::wrappers::LinesStream;

use crate::prelude::*;

/// Read a newline-separated list of paths from `path`, or from standard input
/// if `path` is `-`. Blank lines are skipped.
pub async fn read_path_list(path: &Path) -> Result<Vec<PathBuf>> {
    let reader: Box<dyn AsyncRead + Unpin + Send> = if path == Path::new("-") {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            File::open(path)
                .await
                .with_context(|| format!("Failed to open file at path: {:?}", path))?,
        )
    };
    LinesStream::new(BufReader::new(reader).lines())
        .try_filter_map(|line| async move {
            let line = line.trim();
            Ok((!line.is_empty()).then(|| PathBuf::from(line)))
        })
        .try_collect()
        .await
        .with_context(|| format!("Failed to read path list from {:?}", path))
}

/// Create an [`AsyncWrite`] for a file or stdout.
async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
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

/// Write a stream of values as JSONL to either standard output or a file.
pub async fn write_output<T, S>(path: Option<&Path>, stream: S) -> Result<()>
where
    T: Serialize,
    S: Stream<Item = Result<T>>,
{
    let mut writer = BufWriter::new(create_writer(path).await?);
    pin_mut!(stream);
    while let Some(value) = stream.next().await {
        let json = serde_json::to_string(&value?).context("Failed to serialize JSON")?;
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

/// Write a single pretty-printed JSON value to either standard output or a
/// file.
pub async fn write_json<T: Serialize>(path: Option<&Path>, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(create_writer(path).await?);
    let mut json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    json.push('\n');
    writer
        .write_all(json.as_bytes())
        .await
        .context("Failed to write JSON to output")?;
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}
