//! Varint integers, fixed 8-byte trailers, and the framed-message helper
//! shared by the catalogue and snapshot-state wire formats. Every framed
//! message in this format uses an XXH64 structural checksum over the
//! message body — the stronger BLAKE2b checksum is a per-Content-Ref
//! concern, not part of framing (see `content_ref::Checksum`).

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ArchivariusError, Result};
use crate::pipes::{Sink, Source};

const MAX_VARINT_BYTES: usize = 10;

pub fn write_varint(sink: &mut dyn Sink, mut value: u64) -> Result<()> {
    let mut buf = [0u8; MAX_VARINT_BYTES];
    let mut i = 0;
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf[i] = byte;
        i += 1;
        if value == 0 {
            break;
        }
    }
    sink.pump(&buf[..i])
}

pub fn read_varint(source: &mut dyn Source) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for _ in 0..MAX_VARINT_BYTES {
        let mut byte = [0u8; 1];
        let (n, eof) = source.pump(&mut byte)?;
        if n == 0 {
            return Err(ArchivariusError::CorruptFile {
                path: PathBuf::new(),
                detail: "eof while reading varint".into(),
            });
        }
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if eof {
            break;
        }
    }
    Err(ArchivariusError::CorruptFile {
        path: PathBuf::new(),
        detail: "varint longer than 10 bytes".into(),
    })
}

pub fn write_fixed64(sink: &mut dyn Sink, value: u64) -> Result<()> {
    sink.pump(&value.to_le_bytes())
}

pub fn read_fixed64(source: &mut dyn Source) -> Result<u64> {
    let mut buf = [0u8; 8];
    let mut total = 0;
    while total < 8 {
        let (n, eof) = source.pump(&mut buf[total..])?;
        total += n;
        if total < 8 && eof {
            return Err(ArchivariusError::CorruptFile {
                path: PathBuf::new(),
                detail: "eof while reading fixed64".into(),
            });
        }
    }
    Ok(u64::from_le_bytes(buf))
}

/// Writes `varint(len) | bytes | fixed64(xxh64(bytes))`.
pub fn put_message<T: Serialize>(sink: &mut dyn Sink, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value).map_err(|e| ArchivariusError::CorruptFile {
        path: PathBuf::new(),
        detail: format!("failed to serialize message: {e}"),
    })?;
    write_varint(sink, bytes.len() as u64)?;
    sink.pump(&bytes)?;
    let checksum = xxhash_rust::xxh64::xxh64(&bytes, 0);
    write_fixed64(sink, checksum)
}

/// Reads a message written by [`put_message`], verifying its trailer.
pub fn get_message<T: DeserializeOwned>(source: &mut dyn Source) -> Result<T> {
    let len = read_varint(source)? as usize;
    let mut bytes = vec![0u8; len];
    let mut total = 0;
    while total < len {
        let (n, eof) = source.pump(&mut bytes[total..])?;
        total += n;
        if total < len && eof {
            return Err(ArchivariusError::Truncated {
                path: PathBuf::new(),
                expected: len as u64,
                found: total as u64,
            });
        }
    }
    let stored = read_fixed64(source)?;
    let computed = xxhash_rust::xxh64::xxh64(&bytes, 0);
    if stored != computed {
        return Err(ArchivariusError::CorruptFile {
            path: PathBuf::new(),
            detail: "message checksum mismatch".into(),
        });
    }
    bincode::deserialize(&bytes).map_err(|e| ArchivariusError::CorruptFile {
        path: PathBuf::new(),
        detail: format!("failed to deserialize message: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipes::{FileSink, FileSource};
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn varint_roundtrip() {
        for v in [0u64, 1, 127, 128, 300, u64::MAX] {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("v");
            {
                let mut sink = FileSink::create(&path).unwrap();
                write_varint(&mut sink, v).unwrap();
                sink.finish().unwrap();
            }
            let mut source = FileSource::open(&path).unwrap();
            assert_eq!(read_varint(&mut source).unwrap(), v);
        }
    }

    #[test]
    fn message_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m");
        let sample = Sample {
            a: 42,
            b: "hello".into(),
        };
        {
            let mut sink = FileSink::create(&path).unwrap();
            put_message(&mut sink, &sample).unwrap();
            sink.finish().unwrap();
        }
        let mut source = FileSource::open(&path).unwrap();
        let got: Sample = get_message(&mut source).unwrap();
        assert_eq!(got, sample);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m");
        let sample = Sample {
            a: 1,
            b: "x".into(),
        };
        {
            let mut sink = FileSink::create(&path).unwrap();
            put_message(&mut sink, &sample).unwrap();
            sink.finish().unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();
        let mut source = FileSource::open(&path).unwrap();
        let result: Result<Sample> = get_message(&mut source);
        assert!(result.is_err());
    }
}
