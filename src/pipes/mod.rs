//! Byte pipes: a pull/push chain of `Source`/`Sink` stages.
//!
//! Mirrors the teacher's `Codec` trait in spirit (one trait, several
//! implementations selected at runtime) but the contract is streaming
//! rather than whole-buffer, per the incremental pump model the archive
//! format needs: a `Source` is pulled from (`pump`), a `Sink` is pushed
//! into (`pump` + `finish`), and a chain is built by boxing stages behind
//! `Box<dyn Source>` / `Box<dyn Sink>` rather than nesting generics, since
//! the concrete chain shape (checksum → compression → encryption) is
//! decided at runtime from the catalogue's declared filters.

pub mod checksum;
pub mod crypto;
pub mod zstd_pipe;

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{ArchivariusError, Result};

/// Pulls bytes. `bytes_read < buf.len()` implies end-of-stream; a source
/// must not be pumped again after reporting eof.
pub trait Source {
    fn pump(&mut self, buf: &mut [u8]) -> Result<(usize, bool)>;

    /// Reads every remaining byte into a fresh `Vec`. Used by the pipes
    /// that must buffer an entire blob before they can act (whole-archive
    /// AEAD, the catalogue/snapshot body).
    fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let (n, eof) = self.pump(&mut buf)?;
            out.extend_from_slice(&buf[..n]);
            if eof {
                break;
            }
        }
        Ok(out)
    }

    /// Discards exactly `n` bytes, erroring if the source runs dry first.
    fn discard(&mut self, mut n: u64) -> Result<()> {
        let mut buf = [0u8; 64 * 1024];
        while n > 0 {
            let want = n.min(buf.len() as u64) as usize;
            let (read, eof) = self.pump(&mut buf[..want])?;
            n -= read as u64;
            if n > 0 && eof {
                return Err(ArchivariusError::Truncated {
                    path: PathBuf::new(),
                    expected: n,
                    found: 0,
                });
            }
        }
        Ok(())
    }
}

/// Pushes bytes. `finish` must be idempotent and must flush every
/// downstream stage (compressor epilogue, AEAD tag, file `fsync` is the
/// caller's job via `HostFs`, not this trait's).
pub trait Sink {
    fn pump(&mut self, buf: &[u8]) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Buffered file source. Any read error after the stream has started is
/// surfaced as a plain `IoFailure` — a read side never produces the
/// `UnrecoverableOutput` tag, that is reserved for sinks (invariant P1).
pub struct FileSource {
    path: PathBuf,
    reader: BufReader<File>,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| ArchivariusError::io(path.clone(), e))?;
        Ok(FileSource {
            path,
            reader: BufReader::with_capacity(128 * 1024, file),
        })
    }

    /// Opens the file positioned at a byte offset, for the reader's
    /// seek-then-pump discard pattern when the offset is cheap to reach
    /// with a raw seek instead of pumping-and-discarding through filters.
    pub fn open_at(path: impl AsRef<Path>, offset: u64) -> Result<Self> {
        use std::io::Seek;
        let mut source = Self::open(path)?;
        source
            .reader
            .seek(io::SeekFrom::Start(offset))
            .map_err(|e| ArchivariusError::io(source.path.clone(), e))?;
        Ok(source)
    }
}

impl Source for FileSource {
    fn pump(&mut self, buf: &mut [u8]) -> Result<(usize, bool)> {
        let mut total = 0;
        while total < buf.len() {
            match self.reader.read(&mut buf[total..]) {
                Ok(0) => return Ok((total, true)),
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ArchivariusError::io(self.path.clone(), e)),
            }
        }
        Ok((total, false))
    }
}

/// Buffered file sink. Any write error after the first successful byte is
/// tagged `UnrecoverableOutput` per invariant P1.
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    wrote_any: bool,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| ArchivariusError::io(path.clone(), e))?;
        Ok(FileSink {
            path,
            writer: Some(BufWriter::with_capacity(128 * 1024, file)),
            wrote_any: false,
        })
    }

    fn tag_error(&self, e: io::Error) -> ArchivariusError {
        if self.wrote_any {
            ArchivariusError::unrecoverable_output(self.path.clone(), e)
        } else {
            ArchivariusError::io(self.path.clone(), e)
        }
    }
}

impl Sink for FileSink {
    fn pump(&mut self, buf: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .expect("pump called on a finished FileSink");
        writer.write_all(buf).map_err(|e| self.tag_error(e))?;
        self.wrote_any = true;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| self.tag_error(e))?;
        }
        Ok(())
    }
}

/// Adapts a boxed `Source` to `std::io::Read`, for pipes built on crates
/// that only speak the standard traits (`zstd`'s streaming decoder).
/// Stages own their next stage (`Box<dyn Source>`/`Box<dyn Sink>`) rather
/// than borrowing it, since the chain shape is decided at runtime from
/// declared filters and built bottom-up, each stage taking ownership of
/// the one before it.
pub struct SourceAsRead(pub Box<dyn Source>);

impl Read for SourceAsRead {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, _eof) = self
            .0
            .pump(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(n)
    }
}

/// Adapts a boxed `Sink` to `std::io::Write`, for pipes built on crates
/// that only speak the standard traits (`zstd`'s streaming encoder).
pub struct SinkAsWrite(pub Box<dyn Sink>);

impl Write for SinkAsWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .pump(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        {
            let mut sink = FileSink::create(&path).unwrap();
            sink.pump(b"hello world").unwrap();
            sink.finish().unwrap();
        }
        let mut source = FileSource::open(&path).unwrap();
        let data = source.read_to_end().unwrap();
        assert_eq!(&data, b"hello world");
    }

    #[test]
    fn discard_reports_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        {
            let mut sink = FileSink::create(&path).unwrap();
            sink.pump(b"short").unwrap();
            sink.finish().unwrap();
        }
        let mut source = FileSource::open(&path).unwrap();
        assert!(source.discard(100).is_err());
    }
}
