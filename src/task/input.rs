//! Data fed to the child's stdin

use super::progress::ProgressTracker;
use std::fmt;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CHUNK_SIZE: usize = 64 * 1024;

/// One queued input
pub enum InputSource {
    /// In-memory bytes
    Bytes(Vec<u8>),
    /// A file, opened when the task starts
    File(PathBuf),
    /// Any async reader
    Reader {
        /// The reader
        reader: Box<dyn AsyncRead + Send + Unpin>,
        /// Number of bytes the reader will yield, if known
        length: Option<u64>,
    },
}

impl InputSource {
    /// Wrap an async reader
    pub fn reader(reader: impl AsyncRead + Send + Unpin + 'static, length: Option<u64>) -> Self {
        InputSource::Reader {
            reader: Box::new(reader),
            length,
        }
    }

    /// Number of bytes this source will produce, if known
    pub async fn declared_len(&self) -> Option<u64> {
        self.length_probe().resolve().await
    }

    pub(crate) fn length_probe(&self) -> LengthProbe {
        match self {
            InputSource::Bytes(bytes) => LengthProbe::Known(Some(bytes.len() as u64)),
            InputSource::File(path) => LengthProbe::Stat(path.clone()),
            InputSource::Reader { length, .. } => LengthProbe::Known(*length),
        }
    }

    pub(crate) async fn open(self) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        Ok(match self {
            InputSource::Bytes(bytes) => Box::new(Cursor::new(bytes)),
            InputSource::File(path) => Box::new(tokio::fs::File::open(path).await?),
            InputSource::Reader { reader, .. } => reader,
        })
    }
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSource::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            InputSource::File(path) => f.debug_tuple("File").field(path).finish(),
            InputSource::Reader { length, .. } => {
                f.debug_struct("Reader").field("length", length).finish_non_exhaustive()
            }
        }
    }
}

impl From<Vec<u8>> for InputSource {
    fn from(bytes: Vec<u8>) -> Self {
        InputSource::Bytes(bytes)
    }
}

impl From<&[u8]> for InputSource {
    fn from(bytes: &[u8]) -> Self {
        InputSource::Bytes(bytes.to_vec())
    }
}

impl From<String> for InputSource {
    fn from(text: String) -> Self {
        InputSource::Bytes(text.into_bytes())
    }
}

/// Owned length lookup, so that no borrow of a (non-`Sync`) reader is held
/// across an await
pub(crate) enum LengthProbe {
    Known(Option<u64>),
    Stat(PathBuf),
}

impl LengthProbe {
    async fn resolve(self) -> Option<u64> {
        match self {
            LengthProbe::Known(length) => length,
            LengthProbe::Stat(path) => tokio::fs::metadata(path).await.ok().map(|m| m.len()),
        }
    }
}

/// Sum of declared lengths, or `None` if any source does not declare one
pub(crate) async fn total_len(probes: Vec<LengthProbe>) -> Option<u64> {
    let mut total = 0u64;
    for probe in probes {
        total = total.checked_add(probe.resolve().await?)?;
    }
    Some(total)
}

/// Probes for every queued input
pub(crate) fn length_probes(inputs: &[InputSource]) -> Vec<LengthProbe> {
    inputs.iter().map(InputSource::length_probe).collect()
}

/// Write every input in order, then close the stream so the child sees EOF
pub(crate) async fn write_inputs<W>(
    mut sink: W,
    inputs: Vec<InputSource>,
    progress: Arc<ProgressTracker>,
) -> std::io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    for input in inputs {
        let mut reader = input.open().await?;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n]).await?;
            written += n as u64;
            progress.record_written(n as u64);
        }
    }
    sink.shutdown().await?;
    Ok(written)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn declared_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("message.txt");
        std::fs::write(&path, b"0123456789").unwrap();

        let inputs = vec![
            InputSource::from(b"abc".as_slice()),
            InputSource::File(path.clone()),
        ];
        assert_eq!(total_len(length_probes(&inputs)).await, Some(13));

        let inputs = vec![
            InputSource::File(path),
            InputSource::reader(tokio::io::empty(), None),
        ];
        assert_eq!(total_len(length_probes(&inputs)).await, None);
        assert_eq!(total_len(Vec::new()).await, Some(0));
    }

    #[tokio::test]
    async fn writes_inputs_in_call_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("middle");
        std::fs::write(&path, b"-middle-").unwrap();

        let inputs = vec![
            InputSource::from("first".to_string()),
            InputSource::File(path),
            InputSource::reader(&b"last"[..], Some(4)),
        ];
        let tracker = Arc::new(ProgressTracker::new(Some(17), None));
        let mut sink = Vec::new();
        let written = write_inputs(&mut sink, inputs, tracker.clone()).await.unwrap();

        assert_eq!(sink, b"first-middle-last");
        assert_eq!(written, 17);
        assert_eq!(tracker.current().processed, 17);
    }

    #[tokio::test]
    async fn missing_file_fails_the_writer() {
        let inputs = vec![InputSource::File(PathBuf::from("/nonexistent/input.gpg"))];
        let tracker = Arc::new(ProgressTracker::new(None, None));
        let err = write_inputs(Vec::new(), inputs, tracker).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
