//! Streaming content-defined chunker over any `Read` source

use crate::config::ChunkerConfig;
use crate::error::Result;
use crate::rolling::{BoundaryDetector, BuzHash, RollingHash};
use bytes::{Bytes, BytesMut};
use std::io::{self, Read};

const READ_SIZE: usize = 1024 * 1024;

/// A content-defined chunk of the source
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Byte offset of this chunk in the source
    pub offset: u64,
    /// Chunk content
    pub data: Bytes,
}

impl Chunk {
    /// Chunk length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length chunk (never produced by the chunker)
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Splits a byte stream into contiguous chunks. Lazy, finite and not restartable.
pub struct Chunker<R: Read, H: RollingHash = BuzHash> {
    source: R,
    detector: BoundaryDetector<H>,
    buf: BytesMut,
    scanned: usize,
    offset: u64,
    eof: bool,
}

impl<R: Read> Chunker<R, BuzHash> {
    /// Chunk `source` with the default rolling hash
    pub fn new(config: &ChunkerConfig, source: R) -> Result<Self> {
        Ok(Self::with_detector(BoundaryDetector::new(config)?, source))
    }
}

impl<R: Read, H: RollingHash> Chunker<R, H> {
    /// Chunk `source` with a pre-built detector
    pub fn with_detector(detector: BoundaryDetector<H>, source: R) -> Self {
        Self {
            source,
            detector,
            buf: BytesMut::new(),
            scanned: 0,
            offset: 0,
            eof: false,
        }
    }

    /// Bytes consumed into emitted chunks so far
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Produce the next chunk, or None at end of stream.
    pub fn next_chunk(&mut self) -> io::Result<Option<Chunk>> {
        loop {
            while self.scanned < self.buf.len() {
                let byte = self.buf[self.scanned];
                self.scanned += 1;
                if self.detector.push(byte) {
                    return Ok(Some(self.split_chunk()));
                }
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                // Tail flush, regardless of min size
                self.detector.reset();
                return Ok(Some(self.split_chunk()));
            }
            self.fill()?;
        }
    }

    fn split_chunk(&mut self) -> Chunk {
        let data = self.buf.split_to(self.scanned).freeze();
        self.scanned = 0;
        let chunk = Chunk {
            offset: self.offset,
            data,
        };
        self.offset += chunk.data.len() as u64;
        chunk
    }

    fn fill(&mut self) -> io::Result<()> {
        let start = self.buf.len();
        self.buf.resize(start + READ_SIZE, 0);
        let read = loop {
            match self.source.read(&mut self.buf[start..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(e);
                }
            }
        };
        self.buf.truncate(start + read);
        if read == 0 {
            self.eof = true;
        }
        Ok(())
    }
}

impl<R: Read, H: RollingHash> Iterator for Chunker<R, H> {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}
