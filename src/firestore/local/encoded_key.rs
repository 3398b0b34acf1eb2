//! Order-preserving composite keys for the KV tables.
//!
//! Strings escape `0x00` as `0x00 0xFF` and end with `0x00 0x01`. Path segments
//! end with `0x00 0x02` and a whole path with `0x00 0x01`, so a parent path sorts
//! before its children and [`KeyBuilder::path_prefix`] matches every descendant.
//! Integers are big-endian with the sign bit flipped.

use crate::firestore::error::{data_loss, FirestoreResult};
use crate::firestore::model::ResourcePath;

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x01;
const SEGMENT_SEPARATOR: u8 = 0x02;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyBuilder {
    bytes: Vec<u8>,
}

impl KeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn string(mut self, value: &str) -> Self {
        self.write_escaped(value.as_bytes());
        self.bytes.extend_from_slice(&[ESCAPE, TERMINATOR]);
        self
    }

    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.write_escaped(value);
        self.bytes.extend_from_slice(&[ESCAPE, TERMINATOR]);
        self
    }

    /// Escaped bytes without a terminator; bounds a range over [`Self::bytes`] keys.
    pub fn bytes_prefix(mut self, value: &[u8]) -> Self {
        self.write_escaped(value);
        self
    }

    pub fn int(mut self, value: i64) -> Self {
        self.bytes
            .extend_from_slice(&((value as u64) ^ (1 << 63)).to_be_bytes());
        self
    }

    pub fn path(self, path: &ResourcePath) -> Self {
        let mut builder = self.path_prefix(path);
        builder.bytes.extend_from_slice(&[ESCAPE, TERMINATOR]);
        builder
    }

    /// Path without its terminator: a prefix of the path itself and of every
    /// path below it.
    pub fn path_prefix(mut self, path: &ResourcePath) -> Self {
        for segment in path.iter() {
            self.write_escaped(segment.as_bytes());
            self.bytes.extend_from_slice(&[ESCAPE, SEGMENT_SEPARATOR]);
        }
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }

    fn write_escaped(&mut self, value: &[u8]) {
        for byte in value {
            self.bytes.push(*byte);
            if *byte == ESCAPE {
                self.bytes.push(ESCAPED_ZERO);
            }
        }
    }
}

/// Decodes keys written by [`KeyBuilder`], component by component.
pub struct KeyReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> KeyReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub fn string(&mut self) -> FirestoreResult<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw).map_err(|err| data_loss(format!("Invalid key string: {err}")))
    }

    pub fn bytes(&mut self) -> FirestoreResult<Vec<u8>> {
        let (raw, marker) = self.read_escaped()?;
        if marker != TERMINATOR {
            return Err(data_loss("Expected a terminated key component"));
        }
        Ok(raw)
    }

    pub fn int(&mut self) -> FirestoreResult<i64> {
        let end = self.position + 8;
        let slice = self
            .bytes
            .get(self.position..end)
            .ok_or_else(|| data_loss("Truncated integer key component"))?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(slice);
        self.position = end;
        Ok((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
    }

    pub fn path(&mut self) -> FirestoreResult<ResourcePath> {
        let mut segments = Vec::new();
        loop {
            let (raw, marker) = self.read_escaped()?;
            if marker == TERMINATOR {
                if !raw.is_empty() {
                    return Err(data_loss("Unexpected bytes before path terminator"));
                }
                return Ok(ResourcePath::new(segments));
            }
            let segment = String::from_utf8(raw)
                .map_err(|err| data_loss(format!("Invalid path segment: {err}")))?;
            segments.push(segment);
        }
    }

    pub fn is_done(&self) -> bool {
        self.position >= self.bytes.len()
    }

    fn read_escaped(&mut self) -> FirestoreResult<(Vec<u8>, u8)> {
        let mut out = Vec::new();
        while self.position < self.bytes.len() {
            let byte = self.bytes[self.position];
            self.position += 1;
            if byte != ESCAPE {
                out.push(byte);
                continue;
            }
            let marker = *self
                .bytes
                .get(self.position)
                .ok_or_else(|| data_loss("Truncated key escape"))?;
            self.position += 1;
            match marker {
                ESCAPED_ZERO => out.push(ESCAPE),
                TERMINATOR | SEGMENT_SEPARATOR => return Ok((out, marker)),
                other => return Err(data_loss(format!("Invalid key escape {other:#x}"))),
            }
        }
        Err(data_loss("Unterminated key component"))
    }
}
