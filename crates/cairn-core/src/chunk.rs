//! Splitting byte streams into chunks and reassembling them

use crate::{Error, Result};

/// Split data into ordered chunks of at most `max_chunk_size` bytes.
///
/// Every chunk except the last is full; no padding is added.
pub fn split(data: &[u8], max_chunk_size: usize) -> Result<Vec<Vec<u8>>> {
    if max_chunk_size == 0 {
        return Err(Error::InvalidData("chunk size must be non-zero".to_string()));
    }
    Ok(data.chunks(max_chunk_size).map(|c| c.to_vec()).collect())
}

/// Reassemble chunks into the original byte stream
pub fn join<C: AsRef<[u8]>>(chunks: &[C]) -> Vec<u8> {
    let total = chunks.iter().map(|c| c.as_ref().len()).sum();
    let mut out = Vec::with_capacity(total);
    for chunk in chunks {
        out.extend_from_slice(chunk.as_ref());
    }
    out
}

/// Number of chunks `split` yields for a given size
pub fn chunk_count(len: usize, max_chunk_size: usize) -> usize {
    if max_chunk_size == 0 {
        return 0;
    }
    len.div_ceil(max_chunk_size)
}

/// Simple MIME type detection based on file extension
pub fn detect_mime_type(name: &str) -> Option<String> {
    let ext = std::path::Path::new(name)
        .extension()?
        .to_str()?
        .to_lowercase();
    let mime = match ext.as_str() {
        "txt" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "gzip" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        _ => return None,
    };
    Some(mime.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CHUNK_SIZE;

    #[test]
    fn test_split_and_join() {
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 1000).map(|i| (i % 251) as u8).collect();
        let chunks = split(&data, CHUNK_SIZE).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), CHUNK_SIZE);
        assert_eq!(chunks[2].len(), 1000);
        assert_eq!(join(&chunks), data);
    }

    #[test]
    fn test_chunking_sizes() {
        for len in [0, 1, 999, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 4 * CHUNK_SIZE] {
            let data = vec![0x5au8; len];
            let chunks = split(&data, CHUNK_SIZE).unwrap();
            assert_eq!(chunks.len(), chunk_count(len, CHUNK_SIZE), "len {}", len);
            assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= CHUNK_SIZE));
            assert_eq!(join(&chunks), data);
        }
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(split(b"abc", 0).is_err());
    }

    #[test]
    fn test_detect_mime_type() {
        assert_eq!(detect_mime_type("Report.PDF").as_deref(), Some("application/pdf"));
        assert_eq!(detect_mime_type("notes.txt").as_deref(), Some("text/plain"));
        assert_eq!(detect_mime_type("no_extension"), None);
    }
}
