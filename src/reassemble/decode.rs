//! Per-part decompression (§4.4 step 2). Each decoder produces a stream of
//! `Bytes` chunks (128 KiB - 2 MiB) that the caller sparse-writes in order;
//! nothing here ever buffers a whole decoded part in memory.

use std::path::Path;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use tokio::io::AsyncReadExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::error::{PullError, Result};
use crate::oci::manifest::Decoder;

pub const MIN_CHUNK_SIZE: usize = 128 * 1024;
pub const MAX_CHUNK_SIZE: usize = 2 * 1024 * 1024;

type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// The outcome of decoding one part: either a successful stream of the
/// decoder's own output, or a signal to fall back to a verbatim copy.
pub enum DecodedPart {
    Stream(ByteStream),
    Fallback,
}

/// Opens `part_path` through the decoder selected for this part's media type.
/// Subprocess decoders (`AppleArchive`) are located via `PATH`; a missing
/// binary degrades to `DecodedPart::Fallback` rather than panicking.
pub async fn open_part(part_path: &Path, decoder: Decoder, ordinal: u32) -> Result<DecodedPart> {
    match decoder {
        Decoder::None => Ok(DecodedPart::Stream(raw_stream(part_path).await?)),
        Decoder::Gzip => Ok(DecodedPart::Stream(gzip_stream(part_path).await?)),
        Decoder::Lz4 => Ok(DecodedPart::Stream(lz4_stream(part_path).await?)),
        Decoder::AppleArchive => apple_archive_stream(part_path, ordinal).await,
    }
}

async fn raw_stream(part_path: &Path) -> Result<ByteStream> {
    let file = tokio::fs::File::open(part_path).await?;
    Ok(chunked_reader_stream(file))
}

async fn gzip_stream(part_path: &Path) -> Result<ByteStream> {
    let file = tokio::fs::File::open(part_path).await?;
    let reader = tokio::io::BufReader::new(file);
    let decoder = async_compression::tokio::bufread::GzipDecoder::new(reader);
    Ok(chunked_reader_stream(decoder))
}

/// Runs the CPU-heavy LZ4 frame decode on the blocking pool, feeding decoded
/// chunks back to the async caller over a bounded channel.
async fn lz4_stream(part_path: &Path) -> Result<ByteStream> {
    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(4);
    let path = part_path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let result = (|| -> std::io::Result<()> {
            let file = std::fs::File::open(&path)?;
            let mut decoder = lz4_flex::frame::FrameDecoder::new(file);
            let mut buf = vec![0u8; MAX_CHUNK_SIZE];
            loop {
                use std::io::Read;
                let n = decoder.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    break;
                }
            }
            Ok(())
        })();
        if let Err(e) = result {
            let _ = tx.blocking_send(Err(e));
        }
    });

    Ok(Box::pin(ReceiverStream::new(rx)))
}

/// Shells out to the host's `aa`/`apple_archive` binary, locating it via
/// `PATH`. No maintained in-process LZFSE decoder exists for Rust, so this is
/// the one decoder that crosses a process boundary (design notes §9).
async fn apple_archive_stream(part_path: &Path, ordinal: u32) -> Result<DecodedPart> {
    let binary = match which::which("aa").or_else(|_| which::which("apple_archive")) {
        Ok(path) => path,
        Err(_) => {
            warn!(part = ordinal, "no Apple Archive extractor found on PATH, falling back to direct copy");
            return Ok(DecodedPart::Fallback);
        }
    };

    let mut child = tokio::process::Command::new(binary)
        .arg("extract")
        .arg("-i")
        .arg(part_path)
        .arg("-o")
        .arg("-")
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| PullError::DecompressionFailed {
            part: ordinal,
            reason: format!("failed to spawn Apple Archive extractor: {e}"),
        })?;

    let stdout = child.stdout.take().ok_or_else(|| PullError::DecompressionFailed {
        part: ordinal,
        reason: "extractor did not expose stdout".to_string(),
    })?;

    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(4);
    tokio::spawn(async move {
        let mut reader = stdout;
        let mut buf = vec![0u8; MAX_CHUNK_SIZE];
        let mut produced_any = false;
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    produced_any = true;
                    if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
        let status = child.wait().await;
        let failed = !produced_any
            || match &status {
                Ok(s) => !s.success(),
                Err(_) => true,
            };
        if failed {
            let reason = match status {
                Ok(s) => format!("apple archive extractor exited with {s}"),
                Err(e) => format!("failed to wait for apple archive extractor: {e}"),
            };
            // Surfaced as a stream error so the consumer falls back to a
            // direct copy of the part, the same as the `!produced_any` case.
            let _ = tx.send(Err(std::io::Error::new(std::io::ErrorKind::Other, reason))).await;
        }
    });

    Ok(DecodedPart::Stream(Box::pin(ReceiverStream::new(rx))))
}

fn chunked_reader_stream<R>(reader: R) -> ByteStream
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(4);
    tokio::spawn(async move {
        let mut reader = Box::pin(reader);
        let mut buf = vec![0u8; MAX_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

