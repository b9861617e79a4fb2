//! The "pipe + two tasks" single-pass ingestion core (spec §4.1 steps
//! 1-5, §5, §9). Two cooperating tasks share one in-memory pipe: a
//! writer/tee that owns the synchronous parser and feeds it bytes pulled
//! from the async source stream, and a reader task that streams the
//! other end of the pipe into object storage. Neither task buffers the
//! whole payload.
//!
//! The `pipe` crate gives us a sync, in-memory `Read`/`Write` pair with
//! no async awareness, so the parser (which only knows `std::io::Read`,
//! per `ArtifactParser`) can run unmodified on a blocking thread while
//! the object-store upload, which is async, runs on its own task bridged
//! through an `mpsc` channel — the same "blocking work off the async
//! runtime" split the teacher uses for CPU-bound build steps.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;

use fleet_common::ArtifactMeta;

use crate::objectstore::{ByteStream, ObjectStore};
use crate::parser::{ArtifactParser, ParseError};

pub struct PipelineOutcome {
    pub meta: ArtifactMeta,
    pub size: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("upload to object storage failed: {0}")]
    Upload(#[source] anyhow::Error),
    #[error("ingestion pipeline task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Source stream type the pipeline tees from: the raw bytes of the
/// incoming multipart upload or a staged blob being re-read for
/// `CompleteUpload`.
pub type SourceStream = std::pin::Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

pub async fn run(
    source: SourceStream,
    parser: Arc<dyn ArtifactParser>,
    headers_only: bool,
    object_store: Arc<dyn ObjectStore>,
    key: String,
    channel_buffer: usize,
) -> Result<PipelineOutcome, PipelineError> {
    let (pipe_reader, pipe_writer) = pipe::pipe();
    let runtime_handle = tokio::runtime::Handle::current();
    let counter = Arc::new(AtomicU64::new(0));

    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(channel_buffer);

    let upload_task: tokio::task::JoinHandle<Result<(), PipelineError>> = tokio::spawn({
        let object_store = object_store.clone();
        let key = key.clone();
        async move {
            let stream: ByteStream = Box::pin(ReceiverStream::new(rx));
            object_store
                .put_object(&key, stream)
                .await
                .map_err(|e| PipelineError::Upload(anyhow::Error::new(e)))
        }
    });

    let pump_task = tokio::task::spawn_blocking(move || {
        let mut reader = pipe_reader;
        let mut buf = [0u8; 64 * 1024];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });

    let parse_result: Result<Result<ArtifactMeta, ParseError>, tokio::task::JoinError> = tokio::task::spawn_blocking({
        let counter = counter.clone();
        move || {
            let mut tee = CountingTeeReader {
                source,
                handle: runtime_handle,
                writer: pipe_writer,
                counter,
                leftover: Bytes::new(),
            };

            let result = if headers_only {
                parser.read_headers_only(&mut tee)
            } else {
                parser.read(&mut tee)
            };

            // Drain whatever the parser didn't consume so the reader task
            // observes EOF rather than blocking forever (spec §4.1 step 4).
            let mut sink = [0u8; 64 * 1024];
            loop {
                match tee.read(&mut sink) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            // Dropping `tee` here closes the pipe's write end.
            result
        }
    })
    .await;

    let parsed = match parse_result {
        Ok(Ok(meta)) => Ok(meta),
        Ok(Err(parse_err)) => Err(PipelineError::from(parse_err)),
        Err(join_err) => Err(PipelineError::from(join_err)),
    };

    let _ = pump_task.await;
    let upload_result = upload_task.await.unwrap_or_else(|e| Err(PipelineError::from(e)));

    // Parse failure wins over upload failure (SPEC_FULL.md's grounding of
    // spec §9's "propagate as the primary error" note, absent a
    // CloseWithError-equivalent in the `pipe` crate).
    let meta = parsed?;
    upload_result?;

    Ok(PipelineOutcome {
        size: counter.load(Ordering::Relaxed),
        meta,
    })
}

struct CountingTeeReader {
    source: SourceStream,
    handle: tokio::runtime::Handle,
    writer: pipe::PipeWriter,
    counter: Arc<AtomicU64>,
    leftover: Bytes,
}

impl Read for CountingTeeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.leftover.is_empty() {
            match self.handle.block_on(self.source.next()) {
                None => return Ok(0),
                Some(Err(e)) => return Err(e),
                Some(Ok(bytes)) => self.leftover = bytes,
            }
        }

        let n = std::cmp::min(buf.len(), self.leftover.len());
        let chunk = self.leftover.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        self.counter.fetch_add(n as u64, Ordering::Relaxed);
        self.writer.write_all(&buf[..n])?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectstore::local::LocalObjectStore;
    use crate::parser::TarArtifactParser;

    fn source_of(chunks: Vec<&'static [u8]>) -> SourceStream {
        Box::pin(futures::stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c))),
        ))
    }

    fn make_artifact() -> Vec<u8> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write as _;

        let mut builder = ::tar::Builder::new(Vec::new());
        let mut append = |builder: &mut ::tar::Builder<Vec<u8>>, name: &str, data: &[u8]| {
            let mut header = ::tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        };
        let header_json = br#"{
            "name": "App1 v1.0",
            "format": "mender",
            "format_version": 3,
            "device_types_compatible": ["bar"],
            "updates": [{"type": "rootfs-image", "files": [{"name": "app.bin"}]}]
        }"#;
        append(&mut builder, "header-info.json", header_json);
        append(&mut builder, "0/files/app.bin", b"payload-bytes");
        let tar_bytes = builder.into_inner().unwrap();

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar_bytes).unwrap();
        gz.finish().unwrap()
    }

    #[tokio::test]
    async fn pipeline_parses_and_uploads_in_one_pass() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path(), b"k".to_vec()));
        let artifact_bytes = make_artifact();
        let expected_len = artifact_bytes.len() as u64;

        // Split into multiple chunks to exercise the tee across reads.
        let mid = artifact_bytes.len() / 2;
        let chunk_a: &'static [u8] = Box::leak(artifact_bytes[..mid].to_vec().into_boxed_slice());
        let chunk_b: &'static [u8] = Box::leak(artifact_bytes[mid..].to_vec().into_boxed_slice());

        let outcome = run(
            source_of(vec![chunk_a, chunk_b]),
            Arc::new(TarArtifactParser::new()),
            false,
            store.clone(),
            "images/t/a1".to_string(),
            16,
        )
        .await
        .unwrap();

        assert_eq!(outcome.meta.name, "App1 v1.0");
        assert_eq!(outcome.size, expected_len);
        assert_eq!(store.stat_object("images/t/a1").await.unwrap(), expected_len);
    }
}
