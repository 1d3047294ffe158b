//! Part reassembly (C4): orders chunks, streams decompression, sparse-writes
//! the result, and optionally hands off to a host-provided disk converter.

pub mod decode;
pub mod sparse;

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::collaborators::DiskConverter;
use crate::config::PullConfig;
use crate::error::{PullError, Result};
use crate::oci::manifest::Decoder;
use decode::DecodedPart;

/// One ordered disk-chunk input to the reassembler.
pub struct Part {
    pub ordinal: u32,
    pub path: PathBuf,
    pub decoder: Decoder,
}

/// Reassembles `parts` (already sorted by ordinal) into `target_path`.
///
/// `logical_size` is `Some(L)` whenever a size source was found (manifest
/// annotation or VM config `disk_size`, §4.4 step 1); the file is truncated
/// to `L` up front to materialize the sparse target. A multi-part image with
/// `logical_size: None` is a caller bug (`MissingUncompressedSize` must have
/// been raised before reaching here) and is rejected defensively. A
/// single-part image with `logical_size: None` (e.g. an uncompressed
/// whole-disk layer with no annotation) is allowed: the file simply grows as
/// its one part is written, with no pre-sized sparse tail.
///
/// Single-chunk whole-disk images are just a `parts` slice of length one with
/// `Decoder::None` or whatever the layer's media type selected; this is the
/// same code path as the multi-chunk case (§4.4, B2).
///
/// `expected_parts` is the chunk count declared by the manifest (§6
/// `part.total`, or the count of disk-chunk layers when absent, via
/// [`crate::oci::manifest::expected_chunk_total`]); when `Some` and fewer
/// parts were actually gathered than declared, the first missing trailing
/// ordinal is reported as [`PullError::MissingPart`] rather than silently
/// reassembling a truncated disk.
pub async fn reassemble(
    parts: &[Part],
    target_path: &Path,
    logical_size: Option<u64>,
    expected_parts: Option<u32>,
    config: &PullConfig,
    converter: &dyn DiskConverter,
) -> Result<()> {
    if logical_size.is_none() && parts.len() > 1 {
        return Err(PullError::MissingUncompressedSize);
    }

    if let Some(parent) = target_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if target_path.exists() {
        tokio::fs::remove_file(target_path).await?;
    }

    let mut file = tokio::fs::File::create(target_path)
        .await
        .map_err(|e| PullError::FileCreationFailed {
            path: target_path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if let Some(size) = logical_size {
        file.set_len(size)
            .await
            .map_err(|e| PullError::ReassemblySetupFailed {
                path: target_path.to_path_buf(),
                cause: e.to_string(),
            })?;
    }

    let mut offset = 0u64;
    for (expected_ordinal, part) in (1u32..).zip(parts.iter()) {
        if part.ordinal != expected_ordinal {
            return Err(PullError::MissingPart { part: expected_ordinal });
        }
        offset += write_part(&mut file, offset, part).await?;
    }

    if let Some(total) = expected_parts {
        if parts.len() as u32 != total {
            return Err(PullError::MissingPart {
                part: parts.len() as u32 + 1,
            });
        }
    }

    if let Some(size) = logical_size {
        if offset != size {
            warn!(
                written = offset,
                logical_size = size,
                "reassembled size does not match logical size; sparse tail left as truncated"
            );
        }
    }

    file.flush().await?;
    drop(file);

    if config.convert_after_reassembly {
        maybe_convert(target_path, logical_size.unwrap_or(offset), config, converter).await;
    }

    Ok(())
}

/// Streams one part's decoded bytes through the zero-skipping writer, falling
/// back to a verbatim copy if the decoder can't be used or produces nothing.
async fn write_part(file: &mut tokio::fs::File, start_offset: u64, part: &Part) -> Result<u64> {
    let opened = decode::open_part(&part.path, part.decoder, part.ordinal).await?;

    let mut stream = match opened {
        DecodedPart::Stream(stream) => stream,
        DecodedPart::Fallback => return copy_verbatim(file, start_offset, &part.path).await,
    };

    let mut offset = start_offset;
    let mut wrote_any = false;
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                info!(part = part.ordinal, error = %e, "decoder reported a failure, falling back to direct copy");
                return copy_verbatim(file, start_offset, &part.path).await.map_err(|copy_err| {
                    PullError::DecompressionFailed {
                        part: part.ordinal,
                        reason: format!("decoder failed ({e}) and direct-copy fallback also failed: {copy_err}"),
                    }
                });
            }
        };
        if chunk.is_empty() {
            continue;
        }
        wrote_any = true;
        offset += sparse::write_sparse(file, offset, &chunk).await?;
    }

    if !wrote_any && part.decoder != Decoder::None {
        info!(part = part.ordinal, "decoder produced no output, falling back to direct copy");
        return copy_verbatim(file, start_offset, &part.path).await;
    }

    Ok(offset - start_offset)
}

async fn copy_verbatim(file: &mut tokio::fs::File, start_offset: u64, part_path: &Path) -> Result<u64> {
    let mut source = tokio::fs::File::open(part_path).await?;
    let mut offset = start_offset;
    let mut buf = vec![0u8; decode::MAX_CHUNK_SIZE];
    loop {
        use tokio::io::AsyncReadExt;
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        offset += sparse::write_sparse(file, offset, &buf[..n]).await?;
    }
    Ok(offset - start_offset)
}

/// Invokes the host-provided converter when enough free space is available
/// (§4.4 step 4); any failure or insufficient space keeps the plain sparse
/// file rather than surfacing an error.
async fn maybe_convert(target_path: &Path, used_bytes: u64, config: &PullConfig, converter: &dyn DiskConverter) {
    let required = used_bytes.saturating_add(config.convert_min_free_space);
    match available_space(target_path) {
        Some(free) if free >= required => {
            if let Err(e) = converter.convert(target_path).await {
                warn!(error = %e, "disk conversion failed, keeping plain sparse file");
            }
        }
        Some(free) => {
            info!(free, required, "insufficient free space for disk conversion, skipping");
        }
        None => {
            warn!("could not determine free disk space, skipping disk conversion");
        }
    }
}

/// Finds the disk (by longest matching mount point) backing `path`'s parent
/// directory and returns its available space.
fn available_space(path: &Path) -> Option<u64> {
    let parent = path.parent().unwrap_or(path);
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| parent.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}
