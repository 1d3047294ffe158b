//! Zero-skipping write: the mechanism that makes the reassembled `disk.img`
//! sparse instead of fully allocated (§4.4 step 2, design notes §9).

use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// 4 MiB, as specified.
pub const HOLE_GRANULARITY: u64 = 4 * 1024 * 1024;

/// Writes `data` to `file` starting at `file_offset`, splitting on
/// `HOLE_GRANULARITY`-aligned boundaries (aligned to absolute file offset,
/// not to the start of `data`). Any fully-aligned all-zero block is skipped
/// via `seek` instead of written; everything else — non-zero blocks and
/// unaligned leading/trailing partial windows — is written verbatim.
///
/// Returns the number of bytes advanced (always `data.len()`).
pub async fn write_sparse(file: &mut File, file_offset: u64, data: &[u8]) -> std::io::Result<u64> {
    let mut pos = file_offset;
    let mut cursor = 0usize;

    while cursor < data.len() {
        let next_boundary = (pos / HOLE_GRANULARITY + 1) * HOLE_GRANULARITY;
        let window_len = (next_boundary - pos) as usize;
        let window_end = (cursor + window_len).min(data.len());
        let segment = &data[cursor..window_end];

        let is_aligned_start = pos % HOLE_GRANULARITY == 0;
        let is_full_block = segment.len() as u64 == HOLE_GRANULARITY;

        if is_aligned_start && is_full_block && segment.iter().all(|&b| b == 0) {
            pos += segment.len() as u64;
        } else {
            file.seek(SeekFrom::Start(pos)).await?;
            file.write_all(segment).await?;
            pos += segment.len() as u64;
        }

        cursor = window_end;
    }

    Ok(pos - file_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_back(path: &std::path::Path) -> Vec<u8> {
        let mut f = File::open(path).await.unwrap();
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn writes_small_nonzero_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut file = File::create(&path).await.unwrap();
        file.set_len(HOLE_GRANULARITY * 2).await.unwrap();

        let data = vec![7u8; 128];
        write_sparse(&mut file, 0, &data).await.unwrap();
        drop(file);

        let content = read_back(&path).await;
        assert_eq!(&content[..128], &data[..]);
    }

    #[tokio::test]
    async fn skips_full_aligned_zero_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut file = File::create(&path).await.unwrap();
        let total = HOLE_GRANULARITY * 2;
        file.set_len(total).await.unwrap();

        let zero_block = vec![0u8; HOLE_GRANULARITY as usize];
        let advanced = write_sparse(&mut file, 0, &zero_block).await.unwrap();
        assert_eq!(advanced, HOLE_GRANULARITY);

        let mut nonzero_block = vec![9u8; HOLE_GRANULARITY as usize];
        write_sparse(&mut file, HOLE_GRANULARITY, &mut nonzero_block).await.unwrap();
        drop(file);

        let content = read_back(&path).await;
        assert_eq!(content.len(), total as usize);
        assert!(content[..HOLE_GRANULARITY as usize].iter().all(|&b| b == 0));
        assert!(content[HOLE_GRANULARITY as usize..].iter().all(|&b| b == 9));
    }

    #[tokio::test]
    async fn unaligned_tail_is_written_even_if_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut file = File::create(&path).await.unwrap();
        file.set_len(HOLE_GRANULARITY).await.unwrap();

        // Starts at an unaligned offset, so even an all-zero segment must be written
        // (it isn't a full aligned block).
        let data = vec![0u8; 64];
        let advanced = write_sparse(&mut file, 10, &data).await.unwrap();
        assert_eq!(advanced, 64);
    }
}
