//! Value types exchanged by the read-task sub-protocol.

use std::fmt;

use bytes::BufMut;

use crate::codec::wire::{DecodeResult, WireBufMut, WireReader};
use crate::errors::NativeSrvError;
use crate::protocol::{MIN_PARALLEL_REPLICAS_PROTOCOL_VERSION, PARALLEL_REPLICAS_PROTOCOL_VERSION};

/// Identifies a data part of a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartInfo {
    pub partition_id: String,
    pub min_block: u64,
    pub max_block: u64,
    pub level: u32,
    pub mutation: u64,
}

impl PartInfo {
    pub fn new(partition_id: impl Into<String>, min_block: u64, max_block: u64, level: u32) -> Self {
        PartInfo {
            partition_id: partition_id.into(),
            min_block,
            max_block,
            level,
            mutation: 0,
        }
    }

    /// Conventional part name, e.g. `all_1_1_0`.
    pub fn name(&self) -> String {
        if self.mutation == 0 {
            format!(
                "{}_{}_{}_{}",
                self.partition_id, self.min_block, self.max_block, self.level
            )
        } else {
            format!(
                "{}_{}_{}_{}_{}",
                self.partition_id, self.min_block, self.max_block, self.level, self.mutation
            )
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_string(&self.partition_id);
        buf.put_varint(self.min_block);
        buf.put_varint(self.max_block);
        buf.put_varint(self.level as u64);
        buf.put_varint(self.mutation);
    }

    fn decode(r: &mut WireReader<'_>) -> DecodeResult<Self> {
        Ok(PartInfo {
            partition_id: r.read_string()?,
            min_block: r.read_varint()?,
            max_block: r.read_varint()?,
            level: r.read_varint()? as u32,
            mutation: r.read_varint()?,
        })
    }
}

impl fmt::Display for PartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Half open range of marks `[begin, end)` inside a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarkRange {
    pub begin: u64,
    pub end: u64,
}

impl MarkRange {
    pub fn new(begin: u64, end: u64) -> Self {
        MarkRange { begin, end }
    }

    pub fn num_marks(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }
}

/// Mark ranges to read from a single part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangesInDataPart {
    pub part: PartInfo,
    pub ranges: Vec<MarkRange>,
}

impl RangesInDataPart {
    pub fn num_marks(&self) -> u64 {
        self.ranges.iter().map(|r| r.num_marks()).sum()
    }
}

/// A set of parts and mark ranges.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RangesInDataPartsDescription {
    pub parts: Vec<RangesInDataPart>,
}

impl RangesInDataPartsDescription {
    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|p| p.ranges.is_empty())
    }

    pub fn num_marks(&self) -> u64 {
        self.parts.iter().map(|p| p.num_marks()).sum()
    }

    /// Add a range, merging into an existing entry for the same part.
    pub fn push(&mut self, part: &PartInfo, range: MarkRange) {
        match self.parts.iter_mut().find(|p| &p.part == part) {
            Some(existing) => existing.ranges.push(range),
            None => self.parts.push(RangesInDataPart {
                part: part.clone(),
                ranges: vec![range],
            }),
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_varint(self.parts.len() as u64);
        for part in &self.parts {
            part.part.encode(buf);
            buf.put_varint(part.ranges.len() as u64);
            for range in &part.ranges {
                buf.put_varint(range.begin);
                buf.put_varint(range.end);
            }
        }
    }

    pub fn decode(r: &mut WireReader<'_>) -> DecodeResult<Self> {
        let num_parts = r.read_varint_usize()?;
        let mut parts = Vec::with_capacity(num_parts.min(1024));
        for _ in 0..num_parts {
            let part = PartInfo::decode(r)?;
            let num_ranges = r.read_varint_usize()?;
            let mut ranges = Vec::with_capacity(num_ranges.min(1024));
            for _ in 0..num_ranges {
                let begin = r.read_varint()?;
                let end = r.read_varint()?;
                if end < begin {
                    return Err(NativeSrvError::malformed(format!(
                        "invalid mark range [{begin}, {end}) for part {part}"
                    ))
                    .into());
                }
                ranges.push(MarkRange { begin, end });
            }
            parts.push(RangesInDataPart { part, ranges });
        }
        Ok(RangesInDataPartsDescription { parts })
    }
}

/// Order in which ranges must be handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinationMode {
    #[default]
    Default = 0,
    WithOrder = 1,
    ReverseOrder = 2,
}

impl CoordinationMode {
    fn from_wire(v: u8) -> DecodeResult<Self> {
        Ok(match v {
            0 => Self::Default,
            1 => Self::WithOrder,
            2 => Self::ReverseOrder,
            other => {
                return Err(
                    NativeSrvError::malformed(format!("unknown coordination mode {other}")).into(),
                );
            }
        })
    }
}

fn read_version(r: &mut WireReader<'_>) -> DecodeResult<u64> {
    let version = r.read_varint()?;
    if version < MIN_PARALLEL_REPLICAS_PROTOCOL_VERSION {
        return Err(NativeSrvError::IncompatibleProtocol(format!(
            "parallel replicas protocol version {version} is older than {MIN_PARALLEL_REPLICAS_PROTOCOL_VERSION}"
        ))
        .into());
    }
    Ok(version)
}

/// Sent once per query by a reading replica, describing everything it could
/// read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialAllRangesAnnouncement {
    pub mode: CoordinationMode,
    pub description: RangesInDataPartsDescription,
    pub replica_num: u64,
}

impl InitialAllRangesAnnouncement {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_varint(PARALLEL_REPLICAS_PROTOCOL_VERSION);
        buf.put_u8(self.mode as u8);
        self.description.encode(buf);
        buf.put_varint(self.replica_num);
    }

    pub fn decode(r: &mut WireReader<'_>) -> DecodeResult<Self> {
        read_version(r)?;
        let mode = CoordinationMode::from_wire(r.read_u8()?)?;
        let description = RangesInDataPartsDescription::decode(r)?;
        let replica_num = r.read_varint()?;
        Ok(InitialAllRangesAnnouncement {
            mode,
            description,
            replica_num,
        })
    }
}

/// A reading replica asking for its next batch of ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelReadRequest {
    pub mode: CoordinationMode,
    pub replica_num: u64,
    pub min_number_of_marks: u64,
    /// Ranges the replica already holds, only meaningful for ordered modes.
    pub description: RangesInDataPartsDescription,
}

impl ParallelReadRequest {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_varint(PARALLEL_REPLICAS_PROTOCOL_VERSION);
        buf.put_u8(self.mode as u8);
        buf.put_varint(self.replica_num);
        buf.put_varint(self.min_number_of_marks);
        self.description.encode(buf);
    }

    pub fn decode(r: &mut WireReader<'_>) -> DecodeResult<Self> {
        read_version(r)?;
        Ok(ParallelReadRequest {
            mode: CoordinationMode::from_wire(r.read_u8()?)?,
            replica_num: r.read_varint()?,
            min_number_of_marks: r.read_varint()?,
            description: RangesInDataPartsDescription::decode(r)?,
        })
    }
}

/// The coordinator's answer: more ranges, or `finish` once nothing is left.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParallelReadResponse {
    pub finish: bool,
    pub description: RangesInDataPartsDescription,
}

impl ParallelReadResponse {
    pub fn finished() -> Self {
        ParallelReadResponse {
            finish: true,
            description: RangesInDataPartsDescription::default(),
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_varint(PARALLEL_REPLICAS_PROTOCOL_VERSION);
        buf.put_bool(self.finish);
        self.description.encode(buf);
    }

    pub fn decode(r: &mut WireReader<'_>) -> DecodeResult<Self> {
        read_version(r)?;
        Ok(ParallelReadResponse {
            finish: r.read_bool()?,
            description: RangesInDataPartsDescription::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_merges_ranges_by_part() {
        let a = PartInfo::new("all", 1, 1, 0);
        let b = PartInfo::new("all", 2, 2, 0);
        let mut desc = RangesInDataPartsDescription::default();
        desc.push(&a, MarkRange::new(0, 4));
        desc.push(&b, MarkRange::new(0, 2));
        desc.push(&a, MarkRange::new(4, 8));

        assert_eq!(2, desc.parts.len());
        assert_eq!(8, desc.parts[0].num_marks());
        assert_eq!(10, desc.num_marks());
        assert_eq!("all_1_1_0", a.name());
    }

    #[test]
    fn request_wire_format() {
        let mut description = RangesInDataPartsDescription::default();
        description.push(&PartInfo::new("all", 3, 5, 1), MarkRange::new(2, 9));
        let req = ParallelReadRequest {
            mode: CoordinationMode::WithOrder,
            replica_num: 2,
            min_number_of_marks: 16,
            description,
        };

        let mut buf = Vec::new();
        req.encode(&mut buf);
        assert_eq!(PARALLEL_REPLICAS_PROTOCOL_VERSION as u8, buf[0]);
        assert_eq!(1, buf[1]);

        let mut r = WireReader::new(&buf);
        assert_eq!(req, ParallelReadRequest::decode(&mut r).unwrap());
        assert!(r.is_empty());
    }

    #[test]
    fn old_versions_are_rejected() {
        let mut buf = Vec::new();
        buf.put_varint(1);
        buf.put_bool(true);
        RangesInDataPartsDescription::default().encode(&mut buf);
        ParallelReadResponse::decode(&mut WireReader::new(&buf)).unwrap_err();
    }
}
