//! Snapshot stream framing.
//!
//! A snapshot is a length-delimited [`SnapshotHeader`] followed by
//! `record_count` length-delimited [`SnapshotRecord`]s in key order.

use prost::Message;

use crate::common::{Error, Result};
use crate::master::{SnapshotHeader, SnapshotRecord};
use crate::metadata::rocks::Db;
use crate::metadata::utils::APPLIED_KEY;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Lazy, point-in-time record stream over the metadata store.
///
/// The underlying RocksDB iterator pins the store state at creation, so
/// applies that land while the stream is being consumed are not observed.
/// Ask the state machine for a new reader to restart from the beginning.
pub struct SnapshotReader<'a> {
    applied_index: u64,
    iter: rocksdb::DBIteratorWithThreadMode<'a, Db>,
}

impl<'a> SnapshotReader<'a> {
    pub(crate) fn new(applied_index: u64, iter: rocksdb::DBIteratorWithThreadMode<'a, Db>) -> Self {
        Self {
            applied_index,
            iter,
        }
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    /// Serialize header and records into one buffer.
    pub fn encode(self) -> Result<Vec<u8>> {
        let applied_index = self.applied_index;
        let mut body = Vec::new();
        let mut record_count = 0u64;
        for record in self {
            record?
                .encode_length_delimited(&mut body)
                .map_err(|e| Error::Serialization(format!("snapshot record: {e}")))?;
            record_count += 1;
        }
        let header = SnapshotHeader {
            version: SNAPSHOT_VERSION,
            applied_index,
            record_count,
        };
        let mut buf = Vec::with_capacity(header.encoded_len() + 10 + body.len());
        header
            .encode_length_delimited(&mut buf)
            .map_err(|e| Error::Serialization(format!("snapshot header: {e}")))?;
        buf.extend_from_slice(&body);
        Ok(buf)
    }
}

impl Iterator for SnapshotReader<'_> {
    type Item = Result<SnapshotRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, value) = match self.iter.next()? {
                Ok(kv) => kv,
                Err(e) => return Some(Err(Error::StoreIo(e.to_string()))),
            };
            if key.as_ref() == APPLIED_KEY {
                continue;
            }
            return Some(Ok(SnapshotRecord {
                key: key.to_vec(),
                value: value.to_vec(),
            }));
        }
    }
}

/// Incremental decoder for an encoded snapshot.
pub struct SnapshotDecoder<'a> {
    header: SnapshotHeader,
    buf: &'a [u8],
}

impl<'a> SnapshotDecoder<'a> {
    pub fn new(mut buf: &'a [u8]) -> Result<Self> {
        let header = SnapshotHeader::decode_length_delimited(&mut buf)
            .map_err(|e| Error::SnapshotApply(format!("bad snapshot header: {e}")))?;
        if header.version != SNAPSHOT_VERSION {
            return Err(Error::SnapshotApply(format!(
                "unsupported snapshot version {}",
                header.version
            )));
        }
        Ok(Self { header, buf })
    }

    pub fn applied_index(&self) -> u64 {
        self.header.applied_index
    }

    /// Number of records the writer put in the stream.
    pub fn record_count(&self) -> u64 {
        self.header.record_count
    }
}

impl Iterator for SnapshotDecoder<'_> {
    type Item = Result<SnapshotRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        match SnapshotRecord::decode_length_delimited(&mut self.buf) {
            Ok(record) => Some(Ok(record)),
            Err(e) => {
                self.buf = &[];
                Some(Err(Error::SnapshotApply(format!("bad snapshot record: {e}"))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_rejects_truncated_record() {
        let mut buf = Vec::new();
        SnapshotHeader {
            version: SNAPSHOT_VERSION,
            applied_index: 9,
            record_count: 1,
        }
        .encode_length_delimited(&mut buf)
        .unwrap();
        SnapshotRecord {
            key: b"#user#alice".to_vec(),
            value: vec![1, 2, 3],
        }
        .encode_length_delimited(&mut buf)
        .unwrap();
        buf.truncate(buf.len() - 2);

        let mut decoder = SnapshotDecoder::new(&buf).unwrap();
        assert_eq!(decoder.applied_index(), 9);
        assert!(matches!(decoder.next(), Some(Err(Error::SnapshotApply(_)))));
        assert!(decoder.next().is_none());
    }

    #[test]
    fn test_decoder_rejects_unknown_version() {
        let mut buf = Vec::new();
        SnapshotHeader {
            version: 42,
            applied_index: 1,
            record_count: 0,
        }
        .encode_length_delimited(&mut buf)
        .unwrap();
        assert!(matches!(
            SnapshotDecoder::new(&buf),
            Err(Error::SnapshotApply(_))
        ));
    }
}
