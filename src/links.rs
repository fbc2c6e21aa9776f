//! Binary Hi-C link records.
//!
//! The wire format is a headerless stream of fixed-width little-endian
//! records: `{seq_a: u32, pos_a: u32, seq_b: u32, pos_b: u32, mq_a: u8,
//! mq_b: u8}` (18 bytes). Order is arbitrary; the reader streams with
//! O(1) buffering and is byte-exact idempotent.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Result, ScafError};

pub const LINK_RECORD_BYTES: usize = 18;

/// One paired-end contact observation in source-sequence coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkRecord {
    pub seq_a: u32,
    pub pos_a: u32,
    pub seq_b: u32,
    pub pos_b: u32,
    pub mq_a: u8,
    pub mq_b: u8,
}

impl LinkRecord {
    pub fn from_bytes(buf: &[u8; LINK_RECORD_BYTES]) -> Self {
        LinkRecord {
            seq_a: LittleEndian::read_u32(&buf[0..4]),
            pos_a: LittleEndian::read_u32(&buf[4..8]),
            seq_b: LittleEndian::read_u32(&buf[8..12]),
            pos_b: LittleEndian::read_u32(&buf[12..16]),
            mq_a: buf[16],
            mq_b: buf[17],
        }
    }

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.seq_a)?;
        w.write_u32::<LittleEndian>(self.pos_a)?;
        w.write_u32::<LittleEndian>(self.seq_b)?;
        w.write_u32::<LittleEndian>(self.pos_b)?;
        w.write_u8(self.mq_a)?;
        w.write_u8(self.mq_b)?;
        Ok(())
    }
}

/// Streaming reader over a binary link file.
pub struct LinkReader {
    path: PathBuf,
    inner: BufReader<File>,
    n_seq: u32,
}

impl LinkReader {
    /// Open a link file. `n_seq` bounds the valid sequence id space;
    /// records referencing ids beyond it are malformed input.
    pub fn open(path: &Path, n_seq: usize) -> Result<Self> {
        Ok(LinkReader {
            path: path.to_path_buf(),
            inner: BufReader::new(File::open(path)?),
            n_seq: n_seq as u32,
        })
    }

    fn next_record(&mut self) -> Result<Option<LinkRecord>> {
        let mut buf = [0u8; LINK_RECORD_BYTES];
        match self.inner.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let rec = LinkRecord::from_bytes(&buf);
        if rec.seq_a >= self.n_seq || rec.seq_b >= self.n_seq {
            return Err(ScafError::InputFormat {
                path: self.path.clone(),
                reason: format!(
                    "sequence id out of range ({} or {} >= {})",
                    rec.seq_a, rec.seq_b, self.n_seq
                ),
            });
        }
        Ok(Some(rec))
    }
}

impl Iterator for LinkReader {
    type Item = Result<LinkRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Iterate link records passing the mapping-quality threshold on both
/// ends, applying `f` to each. Errors stop the stream.
pub fn for_each_link<F>(path: &Path, n_seq: usize, mq: u8, mut f: F) -> Result<()>
where
    F: FnMut(&LinkRecord),
{
    for rec in LinkReader::open(path, n_seq)? {
        let rec = rec?;
        if rec.mq_a < mq || rec.mq_b < mq {
            continue;
        }
        f(&rec);
    }
    Ok(())
}
