//! zstd streaming compression pipe. Levels are named per the original
//! source's observed defaults rather than left as magic numbers.

use std::io::{Read, Write};

use super::{Sink, SinkAsWrite, Source, SourceAsRead};
use crate::error::{ArchivariusError, Result};

pub const LEVEL_CONTENT: i32 = 11;
pub const LEVEL_SNAPSHOT: i32 = 14;
pub const LEVEL_CATALOGUE: i32 = 22;

fn io_err(e: std::io::Error) -> ArchivariusError {
    ArchivariusError::CorruptFile {
        path: std::path::PathBuf::new(),
        detail: format!("zstd stream error: {e}"),
    }
}

/// Compresses everything pumped in, writing to `next` on `finish`.
pub struct ZstdCompressSink {
    encoder: Option<zstd::stream::write::Encoder<'static, SinkAsWrite>>,
}

impl ZstdCompressSink {
    pub fn new(next: Box<dyn Sink>, level: i32) -> Result<Self> {
        let encoder = zstd::stream::write::Encoder::new(SinkAsWrite(next), level).map_err(io_err)?;
        Ok(ZstdCompressSink {
            encoder: Some(encoder),
        })
    }
}

impl Sink for ZstdCompressSink {
    fn pump(&mut self, buf: &[u8]) -> Result<()> {
        self.encoder
            .as_mut()
            .expect("pump after finish")
            .write_all(buf)
            .map_err(io_err)
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.take() {
            let mut writer = encoder.finish().map_err(io_err)?;
            writer.0.finish()?;
        }
        Ok(())
    }
}

/// Decompresses bytes pulled from `next`.
pub struct ZstdDecompressSource {
    decoder: zstd::stream::read::Decoder<'static, std::io::BufReader<SourceAsRead>>,
}

impl ZstdDecompressSource {
    pub fn new(next: Box<dyn Source>) -> Result<Self> {
        let decoder = zstd::stream::read::Decoder::new(SourceAsRead(next)).map_err(io_err)?;
        Ok(ZstdDecompressSource { decoder })
    }
}

impl Source for ZstdDecompressSource {
    fn pump(&mut self, buf: &mut [u8]) -> Result<(usize, bool)> {
        let mut total = 0;
        while total < buf.len() {
            match self.decoder.read(&mut buf[total..]) {
                Ok(0) => return Ok((total, true)),
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_err(e)),
            }
        }
        Ok((total, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipes::{FileSink, FileSource};

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        {
            let file_sink = FileSink::create(&path).unwrap();
            let mut z = ZstdCompressSink::new(Box::new(file_sink), LEVEL_CONTENT).unwrap();
            z.pump(b"the quick brown fox jumps over the lazy dog").unwrap();
            z.finish().unwrap();
        }
        let file_source = FileSource::open(&path).unwrap();
        let mut z = ZstdDecompressSource::new(Box::new(file_source)).unwrap();
        let data = z.read_to_end().unwrap();
        assert_eq!(&data, b"the quick brown fox jumps over the lazy dog");
    }
}
