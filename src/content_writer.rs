//! Streams one or more input files into one or more content files,
//! applying the checksum → compression → encryption pipeline, honoring a
//! minimum content-file size, and returning a [`ContentRef`] per input.

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::Local;

use crate::content_ref::ContentRef;
use crate::error::Result;
use crate::filters::FilterSet;
use crate::hostfs::HostFs;
use crate::pipes::checksum::Checksummer;
use crate::pipes::crypto::{XChaChaSink, KEY_LEN, NONCE_LEN};
use crate::pipes::zstd_pipe::{ZstdCompressSink, LEVEL_CONTENT};
use crate::pipes::{FileSink, FileSource, Sink, Source};

/// Running byte count after every filter stage; shared with the chain via
/// `Rc<Cell<_>>` since the chain is boxed and its concrete type erased.
struct CountingSink {
    next: Box<dyn Sink>,
    counter: Rc<Cell<u64>>,
}

impl Sink for CountingSink {
    fn pump(&mut self, buf: &[u8]) -> Result<()> {
        self.counter.set(self.counter.get() + buf.len() as u64);
        self.next.pump(buf)
    }
    fn finish(&mut self) -> Result<()> {
        self.next.finish()
    }
}

#[derive(Default, Clone, Copy)]
pub struct CompressionStats {
    pub original: u64,
    pub compressed: u64,
}

struct OpenFile {
    name: String,
    chain: Box<dyn Sink>,
    written_counter: Rc<Cell<u64>>,
    bytes_pumped: u64,
    nonce: Option<[u8; NONCE_LEN]>,
}

pub struct ContentFileWriter<'h> {
    host: &'h dyn HostFs,
    archive_dir: PathBuf,
    compression: bool,
    encryption_key: Option<[u8; KEY_LEN]>,
    min_file_size: u64,
    current: Option<OpenFile>,
    pub stats: CompressionStats,
}

impl<'h> ContentFileWriter<'h> {
    pub fn new(host: &'h dyn HostFs, archive_dir: impl Into<PathBuf>) -> Self {
        ContentFileWriter {
            host,
            archive_dir: archive_dir.into(),
            compression: false,
            encryption_key: None,
            min_file_size: 0,
            current: None,
            stats: CompressionStats::default(),
        }
    }

    /// Must be called before any `add`.
    pub fn enable_compression(&mut self) -> &mut Self {
        self.compression = true;
        self
    }

    /// Must be called before any `add`. Switches the checksum type to
    /// keyed BLAKE2b for every subsequent blob.
    pub fn enable_encryption(&mut self, key: [u8; KEY_LEN]) -> &mut Self {
        self.encryption_key = Some(key);
        self
    }

    pub fn min_file_size(&mut self, bytes: u64) -> &mut Self {
        self.min_file_size = bytes;
        self
    }

    fn unique_name(&self) -> String {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let base = format!("c{stamp}");
        if !self.host.exists(&self.archive_dir.join(&base)) {
            return base;
        }
        for n in 1.. {
            let candidate = format!("{base}#{n}");
            if !self.host.exists(&self.archive_dir.join(&candidate)) {
                return candidate;
            }
        }
        unreachable!()
    }

    fn current_filters(&self, nonce: Option<[u8; NONCE_LEN]>) -> FilterSet {
        FilterSet {
            zstd_level: self.compression.then_some(LEVEL_CONTENT),
            chapoly_nonce: None,
            chacha_nonce: nonce,
        }
    }

    fn open_new_file(&mut self) -> Result<()> {
        if let Some(mut open) = self.current.take() {
            open.chain.finish()?;
        }
        let name = self.unique_name();
        let path = self.archive_dir.join(&name);
        let file_sink = FileSink::create(&path)?;
        let counter = Rc::new(Cell::new(0));
        let counting = CountingSink {
            next: Box::new(file_sink),
            counter: counter.clone(),
        };
        let mut chain: Box<dyn Sink> = Box::new(counting);
        let nonce = if let Some(key) = self.encryption_key {
            let nonce = random_nonce();
            chain = Box::new(XChaChaSink::new(chain, key, nonce));
            Some(nonce)
        } else {
            None
        };
        if self.compression {
            chain = Box::new(ZstdCompressSink::new(chain, LEVEL_CONTENT)?);
        }
        self.current = Some(OpenFile {
            name,
            chain,
            written_counter: counter,
            bytes_pumped: 0,
            nonce,
        });
        Ok(())
    }

    fn needs_rollover(&self) -> bool {
        match &self.current {
            None => true,
            Some(open) => open.written_counter.get() >= self.min_file_size,
        }
    }

    /// Streams `path`'s contents through the pipeline and returns its ref.
    pub fn add(&mut self, path: &Path) -> Result<ContentRef> {
        if self.needs_rollover() {
            self.open_new_file()?;
        }
        let open = self.current.as_mut().expect("just opened");
        let start = open.written_counter.get();
        let from = open.bytes_pumped;

        let mut checksummer = if self.encryption_key.is_some() {
            Checksummer::blake2b512_keyed(self.encryption_key.as_ref().unwrap())
        } else {
            Checksummer::xxh64()
        };

        let mut source = FileSource::open(path)?;
        let mut buf = [0u8; 128 * 1024];
        loop {
            let (n, eof) = source.pump(&mut buf)?;
            if n > 0 {
                checksummer.update(&buf[..n]);
                open.chain.pump(&buf[..n])?;
                open.bytes_pumped += n as u64;
            }
            if eof {
                break;
            }
        }

        let to = open.bytes_pumped;
        let checksum = checksummer.finalize();
        let end = open.written_counter.get();
        let space_taken = (end - start).max(1);
        let name = open.name.clone();
        let nonce = open.nonce;

        self.stats.original += to - from;
        self.stats.compressed += space_taken;

        Ok(ContentRef {
            content_file_name: name,
            from,
            to,
            filters: self.current_filters(nonce),
            space_taken,
            checksum,
            ref_count: 1,
        })
    }

    /// Closes the currently-open content file, flushing every filter.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(mut open) = self.current.take() {
            open.chain.finish()?;
        }
        Ok(())
    }
}

fn random_nonce() -> [u8; NONCE_LEN] {
    use std::time::{SystemTime, UNIX_EPOCH};
    // A fresh nonce per content file; uniqueness (not secrecy) is the
    // requirement; seed from coarse time plus an incrementing counter so
    // two rollovers inside the same process never collide.
    thread_local! {
        static COUNTER: Cell<u64> = Cell::new(0);
    }
    let counter = COUNTER.with(|c| {
        let v = c.get();
        c.set(v.wrapping_add(1));
        v
    });
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&now.to_le_bytes());
    nonce[8..16].copy_from_slice(&counter.to_le_bytes());
    getrandom::getrandom(&mut nonce[16..]).expect("system RNG must be available");
    nonce
}
