//! Whole-file copies with optional zstd and content checksums.

use crate::utils::errors::{EngineError, Result};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

const COPY_BUFFER: usize = 128 * 1024;

/// Writer adapter that checksums what passes through it.
struct CrcWriter<W: Write> {
    inner: W,
    hasher: crc32fast::Hasher,
    written: u64,
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Result of a whole-file copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOutcome {
    /// Bytes read from the source.
    pub read_bytes: u64,
    /// Bytes written to the destination.
    pub written_bytes: u64,
    /// CRC32 of the uncompressed content.
    pub crc: u32,
}

/// Copy `src` to `dst`, compressing at `level` when given.
pub fn store_file(src: &Path, dst: &Path, level: Option<i32>) -> Result<CopyOutcome> {
    let input = File::open(src).map_err(|e| EngineError::file("open", src, e))?;
    let output = File::create(dst).map_err(|e| EngineError::file("create", dst, e))?;
    let mut reader = BufReader::with_capacity(COPY_BUFFER, input);
    let mut hasher = crc32fast::Hasher::new();
    let mut counting = CrcWriter {
        inner: BufWriter::with_capacity(COPY_BUFFER, output),
        hasher: crc32fast::Hasher::new(),
        written: 0,
    };

    let mut read_bytes = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER];
    match level {
        Some(level) => {
            let mut encoder = zstd::stream::Encoder::new(&mut counting, level)
                .map_err(|e| EngineError::Compression(e.to_string()))?;
            loop {
                let n = reader.read(&mut buf).map_err(|e| EngineError::file("read", src, e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                read_bytes += n as u64;
                encoder.write_all(&buf[..n]).map_err(|e| EngineError::file("write", dst, e))?;
            }
            encoder.finish().map_err(|e| EngineError::Compression(e.to_string()))?;
        }
        None => loop {
            let n = reader.read(&mut buf).map_err(|e| EngineError::file("read", src, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            read_bytes += n as u64;
            counting.write_all(&buf[..n]).map_err(|e| EngineError::file("write", dst, e))?;
        },
    }
    counting.flush().map_err(|e| EngineError::file("write", dst, e))?;

    Ok(CopyOutcome {
        read_bytes,
        written_bytes: counting.written,
        crc: hasher.finalize(),
    })
}

/// Stream the uncompressed content of a stored file into `sink`.
pub fn read_stored<W: Write>(stored: &Path, compressed: bool, sink: W) -> Result<CopyOutcome> {
    let input = File::open(stored).map_err(|e| EngineError::file("open", stored, e))?;
    let read_bytes = input.metadata().map(|m| m.len()).unwrap_or(0);
    let mut writer = CrcWriter {
        inner: sink,
        hasher: crc32fast::Hasher::new(),
        written: 0,
    };
    let reader = BufReader::with_capacity(COPY_BUFFER, input);
    if compressed {
        let mut decoder = zstd::stream::Decoder::new(reader)
            .map_err(|e| EngineError::Compression(e.to_string()))?;
        io::copy(&mut decoder, &mut writer).map_err(|e| {
            EngineError::Corruption(format!(
                "cannot decompress \"{}\": {}",
                stored.display(),
                e
            ))
        })?;
    } else {
        let mut reader = reader;
        io::copy(&mut reader, &mut writer).map_err(|e| EngineError::file("read", stored, e))?;
    }
    writer.flush()?;
    Ok(CopyOutcome {
        read_bytes,
        written_bytes: writer.written,
        crc: writer.hasher.finalize(),
    })
}

/// Restore a stored file to `dst`.
pub fn restore_file(stored: &Path, compressed: bool, dst: &Path) -> Result<CopyOutcome> {
    let output = File::create(dst).map_err(|e| EngineError::file("create", dst, e))?;
    let mut writer = BufWriter::with_capacity(COPY_BUFFER, output);
    let outcome = read_stored(stored, compressed, &mut writer)?;
    writer.flush().map_err(|e| EngineError::file("write", dst, e))?;
    Ok(outcome)
}

/// CRC32 of a file's content.
pub fn file_crc(path: &Path) -> Result<u32> {
    Ok(read_stored(path, false, io::sink())?.crc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_restore_compressed() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("postgresql.conf");
        let content = b"shared_buffers = 128MB\n".repeat(500);
        std::fs::write(&src, &content).unwrap();

        let stored = dir.path().join("stored");
        let out = store_file(&src, &stored, Some(3)).unwrap();
        assert_eq!(out.read_bytes, content.len() as u64);
        assert!(out.written_bytes < out.read_bytes);
        assert_eq!(out.crc, crc32fast::hash(&content));

        let restored = dir.path().join("restored");
        let back = restore_file(&stored, true, &restored).unwrap();
        assert_eq!(back.crc, out.crc);
        assert_eq!(std::fs::read(&restored).unwrap(), content);
    }

    #[test]
    fn test_plain_copy() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("PG_VERSION");
        std::fs::write(&src, b"16\n").unwrap();
        let dst = dir.path().join("copy");
        let out = store_file(&src, &dst, None).unwrap();
        assert_eq!(out.written_bytes, 3);
        assert_eq!(file_crc(&dst).unwrap(), out.crc);
    }
}
