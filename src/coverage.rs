//! Per-test coverage measured on unmutated code.
//!
//! The probe side records "test T executed member M" hits through a [`CoverageRecorder`]
//! and hands them over as a count-prefixed record stream. The scheduler only works with the
//! decoded [`CoverageMap`] and its inverted [`CoverageIndex`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::MemberId;

/// Fully qualified test name as understood by the test host.
pub type TestName = String;

/// `test name -> covered members`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageMap {
    tests: BTreeMap<TestName, BTreeSet<MemberId>>,
}

impl CoverageMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `test` covers `member`.
    pub fn insert(&mut self, test: impl Into<TestName>, member: MemberId) {
        self.tests.entry(test.into()).or_default().insert(member);
    }

    /// Register a test that covers nothing.
    pub fn insert_test(&mut self, test: impl Into<TestName>) {
        self.tests.entry(test.into()).or_default();
    }

    /// Members covered by one test.
    pub fn covered_by(&self, test: &str) -> Option<&BTreeSet<MemberId>> {
        self.tests.get(test)
    }

    /// Iterate tests in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&TestName, &BTreeSet<MemberId>)> {
        self.tests.iter()
    }

    /// Number of tests.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// True if no test was recorded.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Build the `member -> tests` index used by the binder.
    pub fn invert(&self) -> CoverageIndex {
        let mut by_member: HashMap<MemberId, BTreeSet<TestName>> = HashMap::new();
        for (test, members) in &self.tests {
            for member in members {
                by_member
                    .entry(member.clone())
                    .or_default()
                    .insert(test.clone());
            }
        }
        CoverageIndex { by_member }
    }
}

impl FromIterator<(TestName, MemberId)> for CoverageMap {
    fn from_iter<I: IntoIterator<Item = (TestName, MemberId)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (test, member) in iter {
            map.insert(test, member);
        }
        map
    }
}

/// Inverted coverage: `member -> tests executing it`.
#[derive(Debug, Clone, Default)]
pub struct CoverageIndex {
    by_member: HashMap<MemberId, BTreeSet<TestName>>,
}

impl CoverageIndex {
    /// Tests covering `member`, if any.
    pub fn tests_for(&self, member: &MemberId) -> Option<&BTreeSet<TestName>> {
        self.by_member.get(member)
    }

    /// Number of covered members.
    pub fn len(&self) -> usize {
        self.by_member.len()
    }

    /// True if nothing is covered.
    pub fn is_empty(&self) -> bool {
        self.by_member.is_empty()
    }
}

/// Coverage map together with the wall-clock duration of the pass that produced it.
#[derive(Debug, Clone, Default)]
pub struct CoverageReport {
    /// Measured coverage.
    pub map: CoverageMap,
    /// Duration of the coverage test run.
    pub elapsed: Duration,
}

/// Explicit recording context for coverage probes.
///
/// Probes call [`enter_test`](Self::enter_test) when a test starts and
/// [`record`](Self::record) for every member entry.
#[derive(Debug, Default)]
pub struct CoverageRecorder {
    current: Option<TestName>,
    map: CoverageMap,
    dropped: usize,
}

impl CoverageRecorder {
    /// New recorder with no active test.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute subsequent hits to `test`.
    pub fn enter_test(&mut self, test: impl Into<TestName>) {
        let test = test.into();
        self.map.insert_test(test.clone());
        self.current = Some(test);
    }

    /// Stop attributing hits.
    pub fn leave_test(&mut self) {
        self.current = None;
    }

    /// Record a member hit for the active test.
    pub fn record(&mut self, assembly: &str, handle: u32) {
        match &self.current {
            Some(test) => self.map.insert(test.clone(), MemberId::new(assembly, handle)),
            None => self.dropped += 1,
        }
    }

    /// Hits recorded while no test was active.
    pub fn dropped_hits(&self) -> usize {
        self.dropped
    }

    /// Encode the recorded coverage as a record stream.
    pub fn encode(&self) -> Vec<u8> {
        encode_stream(&self.map)
    }

    /// Finish recording.
    pub fn finish(self) -> CoverageMap {
        self.map
    }
}

/// Coverage stream decode errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoverageError {
    /// Input ended in the middle of a record.
    #[error("coverage stream truncated at byte {offset}: needed {needed} more byte(s)")]
    Truncated {
        /// Offset where the read started.
        offset: usize,
        /// Bytes required.
        needed: usize,
    },
    /// A count field was negative.
    #[error("negative count {value} at byte {offset}")]
    NegativeCount {
        /// Offset of the count.
        offset: usize,
        /// Decoded value.
        value: i32,
    },
    /// A string length prefix was longer than five bytes.
    #[error("malformed string length prefix at byte {offset}")]
    BadLength {
        /// Offset of the prefix.
        offset: usize,
    },
    /// A string was not valid UTF-8.
    #[error("invalid utf-8 string at byte {offset}")]
    InvalidUtf8 {
        /// Offset of the string body.
        offset: usize,
    },
}

struct StreamReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> StreamReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CoverageError> {
        let remaining = self.bytes.len() - self.pos;
        if remaining < len {
            return Err(CoverageError::Truncated {
                offset: self.pos,
                needed: len - remaining,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_i32(&mut self) -> Result<i32, CoverageError> {
        let raw = self.take(4)?;
        Ok(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn read_count(&mut self) -> Result<usize, CoverageError> {
        let offset = self.pos;
        let value = self.read_i32()?;
        usize::try_from(value).map_err(|_| CoverageError::NegativeCount { offset, value })
    }

    fn read_string(&mut self) -> Result<String, CoverageError> {
        let offset = self.pos;
        let mut len: u32 = 0;
        let mut shift = 0;
        loop {
            if shift >= 35 {
                return Err(CoverageError::BadLength { offset });
            }
            let byte = self.take(1)?[0];
            len |= u32::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let body_offset = self.pos;
        let body = self.take(len as usize)?;
        String::from_utf8(body.to_vec()).map_err(|_| CoverageError::InvalidUtf8 {
            offset: body_offset,
        })
    }
}

/// Decode a coverage record stream.
///
/// Layout (little endian): `i32` test count, then per test a string name, an `i32` entry
/// count and per entry a string assembly name plus an `i32` entity handle. Strings carry a
/// 7-bit varint byte-length prefix. Bytes after the last record are ignored, since the
/// producer writes into a fixed-size shared segment.
pub fn decode_stream(bytes: &[u8]) -> Result<CoverageMap, CoverageError> {
    let mut reader = StreamReader { bytes, pos: 0 };
    let mut map = CoverageMap::new();

    let tests = reader.read_count()?;
    for _ in 0..tests {
        let test = reader.read_string()?;
        map.insert_test(test.clone());
        let entries = reader.read_count()?;
        for _ in 0..entries {
            let assembly = reader.read_string()?;
            let handle = reader.read_i32()? as u32;
            map.insert(test.clone(), MemberId::new(assembly, handle));
        }
    }

    Ok(map)
}

/// Encode a coverage map in the record stream layout read by [`decode_stream`].
pub fn encode_stream(map: &CoverageMap) -> Vec<u8> {
    let mut out = Vec::new();
    write_count(&mut out, map.len());
    for (test, members) in map.iter() {
        write_string(&mut out, test);
        write_count(&mut out, members.len());
        for member in members {
            write_string(&mut out, &member.assembly);
            out.extend_from_slice(&member.handle.to_le_bytes());
        }
    }
    out
}

fn write_count(out: &mut Vec<u8>, count: usize) {
    let count = i32::try_from(count).unwrap_or(i32::MAX);
    out.extend_from_slice(&count.to_le_bytes());
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    let mut len = value.len() as u32;
    while len >= 0x80 {
        out.push((len as u8 & 0x7f) | 0x80);
        len >>= 7;
    }
    out.push(len as u8);
    out.extend_from_slice(value.as_bytes());
}
