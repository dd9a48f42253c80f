//! Column oriented blocks and their native wire encoding.

use std::fmt;
use std::str::FromStr;

use bytes::BufMut;

use crate::codec::wire::{DecodeResult, WireBufMut, WireReader};
use crate::errors::{ExecError, NativeSrvError};
use crate::protocol::revision;

/// Upper bound on rows/columns accepted in a single block.
const MAX_BLOCK_DIMENSION: usize = 1 << 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    /// Seconds since the unix epoch.
    DateTime,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UInt8 => "UInt8",
            Self::UInt16 => "UInt16",
            Self::UInt32 => "UInt32",
            Self::UInt64 => "UInt64",
            Self::Int8 => "Int8",
            Self::Int16 => "Int16",
            Self::Int32 => "Int32",
            Self::Int64 => "Int64",
            Self::Float32 => "Float32",
            Self::Float64 => "Float64",
            Self::String => "String",
            Self::DateTime => "DateTime",
        }
    }
}

impl FromStr for DataType {
    type Err = NativeSrvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "UInt8" => Self::UInt8,
            "UInt16" => Self::UInt16,
            "UInt32" => Self::UInt32,
            "UInt64" => Self::UInt64,
            "Int8" => Self::Int8,
            "Int16" => Self::Int16,
            "Int32" => Self::Int32,
            "Int64" => Self::Int64,
            "Float32" => Self::Float32,
            "Float64" => Self::Float64,
            "String" => Self::String,
            "DateTime" => Self::DateTime,
            other => {
                return Err(NativeSrvError::malformed(format!("unsupported column type '{other}'")));
            }
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Values of a single column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(Vec<String>),
    DateTime(Vec<u32>),
}

macro_rules! each_fixed {
    ($self:expr, $v:ident => $body:expr, $s:ident => $str_body:expr) => {
        match $self {
            ColumnData::UInt8($v) => $body,
            ColumnData::UInt16($v) => $body,
            ColumnData::UInt32($v) => $body,
            ColumnData::UInt64($v) => $body,
            ColumnData::Int8($v) => $body,
            ColumnData::Int16($v) => $body,
            ColumnData::Int32($v) => $body,
            ColumnData::Int64($v) => $body,
            ColumnData::Float32($v) => $body,
            ColumnData::Float64($v) => $body,
            ColumnData::DateTime($v) => $body,
            ColumnData::String($s) => $str_body,
        }
    };
}

impl ColumnData {
    pub fn empty(data_type: DataType) -> Self {
        match data_type {
            DataType::UInt8 => Self::UInt8(Vec::new()),
            DataType::UInt16 => Self::UInt16(Vec::new()),
            DataType::UInt32 => Self::UInt32(Vec::new()),
            DataType::UInt64 => Self::UInt64(Vec::new()),
            DataType::Int8 => Self::Int8(Vec::new()),
            DataType::Int16 => Self::Int16(Vec::new()),
            DataType::Int32 => Self::Int32(Vec::new()),
            DataType::Int64 => Self::Int64(Vec::new()),
            DataType::Float32 => Self::Float32(Vec::new()),
            DataType::Float64 => Self::Float64(Vec::new()),
            DataType::String => Self::String(Vec::new()),
            DataType::DateTime => Self::DateTime(Vec::new()),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::UInt8(_) => DataType::UInt8,
            Self::UInt16(_) => DataType::UInt16,
            Self::UInt32(_) => DataType::UInt32,
            Self::UInt64(_) => DataType::UInt64,
            Self::Int8(_) => DataType::Int8,
            Self::Int16(_) => DataType::Int16,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Float32(_) => DataType::Float32,
            Self::Float64(_) => DataType::Float64,
            Self::String(_) => DataType::String,
            Self::DateTime(_) => DataType::DateTime,
        }
    }

    pub fn len(&self) -> usize {
        each_fixed!(self, v => v.len(), s => s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate in-memory size, used for progress accounting.
    pub fn byte_size(&self) -> usize {
        each_fixed!(
            self,
            v => std::mem::size_of_val(v.as_slice()),
            s => s.iter().map(|s| s.len() + 1).sum()
        )
    }

    /// Value at `idx` as a u64, if the column is an unsigned integer.
    pub fn get_u64(&self, idx: usize) -> Option<u64> {
        match self {
            Self::UInt8(v) => v.get(idx).map(|v| *v as u64),
            Self::UInt16(v) => v.get(idx).map(|v| *v as u64),
            Self::UInt32(v) | Self::DateTime(v) => v.get(idx).map(|v| *v as u64),
            Self::UInt64(v) => v.get(idx).copied(),
            _ => None,
        }
    }

    /// Append all values from `other`, which must have the same type.
    pub fn extend(&mut self, other: &ColumnData) -> Result<(), ExecError> {
        match (self, other) {
            (Self::UInt8(a), Self::UInt8(b)) => a.extend_from_slice(b),
            (Self::UInt16(a), Self::UInt16(b)) => a.extend_from_slice(b),
            (Self::UInt32(a), Self::UInt32(b)) => a.extend_from_slice(b),
            (Self::UInt64(a), Self::UInt64(b)) => a.extend_from_slice(b),
            (Self::Int8(a), Self::Int8(b)) => a.extend_from_slice(b),
            (Self::Int16(a), Self::Int16(b)) => a.extend_from_slice(b),
            (Self::Int32(a), Self::Int32(b)) => a.extend_from_slice(b),
            (Self::Int64(a), Self::Int64(b)) => a.extend_from_slice(b),
            (Self::Float32(a), Self::Float32(b)) => a.extend_from_slice(b),
            (Self::Float64(a), Self::Float64(b)) => a.extend_from_slice(b),
            (Self::String(a), Self::String(b)) => a.extend_from_slice(b),
            (Self::DateTime(a), Self::DateTime(b)) => a.extend_from_slice(b),
            (a, b) => {
                return Err(ExecError::type_mismatch(format!(
                    "cannot append {} to {}",
                    b.data_type(),
                    a.data_type()
                )));
            }
        }
        Ok(())
    }

    /// Copy out rows `[start, end)`.
    pub fn slice(&self, start: usize, end: usize) -> ColumnData {
        match self {
            Self::UInt8(v) => Self::UInt8(v[start..end].to_vec()),
            Self::UInt16(v) => Self::UInt16(v[start..end].to_vec()),
            Self::UInt32(v) => Self::UInt32(v[start..end].to_vec()),
            Self::UInt64(v) => Self::UInt64(v[start..end].to_vec()),
            Self::Int8(v) => Self::Int8(v[start..end].to_vec()),
            Self::Int16(v) => Self::Int16(v[start..end].to_vec()),
            Self::Int32(v) => Self::Int32(v[start..end].to_vec()),
            Self::Int64(v) => Self::Int64(v[start..end].to_vec()),
            Self::Float32(v) => Self::Float32(v[start..end].to_vec()),
            Self::Float64(v) => Self::Float64(v[start..end].to_vec()),
            Self::String(v) => Self::String(v[start..end].to_vec()),
            Self::DateTime(v) => Self::DateTime(v[start..end].to_vec()),
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Self::UInt8(v) => buf.put_slice(v),
            Self::UInt16(v) => v.iter().for_each(|x| buf.put_u16_le(*x)),
            Self::UInt32(v) | Self::DateTime(v) => v.iter().for_each(|x| buf.put_u32_le(*x)),
            Self::UInt64(v) => v.iter().for_each(|x| buf.put_u64_le(*x)),
            Self::Int8(v) => v.iter().for_each(|x| buf.put_i8(*x)),
            Self::Int16(v) => v.iter().for_each(|x| buf.put_i16_le(*x)),
            Self::Int32(v) => v.iter().for_each(|x| buf.put_i32_le(*x)),
            Self::Int64(v) => v.iter().for_each(|x| buf.put_i64_le(*x)),
            Self::Float32(v) => v.iter().for_each(|x| buf.put_f32_le(*x)),
            Self::Float64(v) => v.iter().for_each(|x| buf.put_f64_le(*x)),
            Self::String(v) => v.iter().for_each(|s| buf.put_string(s)),
        }
    }

    fn decode(data_type: DataType, rows: usize, r: &mut WireReader<'_>) -> DecodeResult<Self> {
        fn fixed<T, const N: usize>(
            r: &mut WireReader<'_>,
            rows: usize,
            f: fn([u8; N]) -> T,
        ) -> DecodeResult<Vec<T>> {
            let bytes = r.read_bytes(rows * N)?;
            Ok(bytes
                .chunks_exact(N)
                .map(|c| {
                    let mut arr = [0; N];
                    arr.copy_from_slice(c);
                    f(arr)
                })
                .collect())
        }

        Ok(match data_type {
            DataType::UInt8 => Self::UInt8(r.read_bytes(rows)?.to_vec()),
            DataType::UInt16 => Self::UInt16(fixed(r, rows, u16::from_le_bytes)?),
            DataType::UInt32 => Self::UInt32(fixed(r, rows, u32::from_le_bytes)?),
            DataType::UInt64 => Self::UInt64(fixed(r, rows, u64::from_le_bytes)?),
            DataType::Int8 => Self::Int8(fixed(r, rows, i8::from_le_bytes)?),
            DataType::Int16 => Self::Int16(fixed(r, rows, i16::from_le_bytes)?),
            DataType::Int32 => Self::Int32(fixed(r, rows, i32::from_le_bytes)?),
            DataType::Int64 => Self::Int64(fixed(r, rows, i64::from_le_bytes)?),
            DataType::Float32 => Self::Float32(fixed(r, rows, f32::from_le_bytes)?),
            DataType::Float64 => Self::Float64(fixed(r, rows, f64::from_le_bytes)?),
            DataType::DateTime => Self::DateTime(fixed(r, rows, u32::from_le_bytes)?),
            DataType::String => {
                let mut out = Vec::with_capacity(rows.min(65536));
                for _ in 0..rows {
                    out.push(r.read_string()?);
                }
                Self::String(out)
            }
        })
    }
}

macro_rules! impl_from_vec {
    ($($t:ty => $variant:ident),*) => {
        $(impl From<Vec<$t>> for ColumnData {
            fn from(v: Vec<$t>) -> Self {
                ColumnData::$variant(v)
            }
        })*
    };
}

impl_from_vec!(
    u8 => UInt8, u16 => UInt16, u32 => UInt32, u64 => UInt64,
    i8 => Int8, i16 => Int16, i32 => Int32, i64 => Int64,
    f32 => Float32, f64 => Float64, String => String
);

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: impl Into<ColumnData>) -> Self {
        Column {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Extra block metadata carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub is_overflows: bool,
    pub bucket_num: i32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        BlockInfo {
            is_overflows: false,
            bucket_num: -1,
        }
    }
}

/// A batch of rows stored by column.
///
/// A block with no columns and no rows marks the end of a data stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub info: BlockInfo,
    pub columns: Vec<Column>,
}

impl Block {
    pub fn new(columns: Vec<Column>) -> Self {
        Block {
            info: BlockInfo::default(),
            columns,
        }
    }

    /// Create a block with no rows for the given schema.
    pub fn header<'a>(schema: impl IntoIterator<Item = (&'a str, DataType)>) -> Self {
        Block::new(
            schema
                .into_iter()
                .map(|(name, typ)| Column {
                    name: name.to_string(),
                    data: ColumnData::empty(typ),
                })
                .collect(),
        )
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.data.len()).unwrap_or(0)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Whether this is the empty end-of-data marker.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.num_rows() == 0
    }

    pub fn byte_size(&self) -> usize {
        self.columns.iter().map(|c| c.data.byte_size()).sum()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Copy of this block without rows.
    pub fn to_header(&self) -> Block {
        Block {
            info: self.info,
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    data: ColumnData::empty(c.data.data_type()),
                })
                .collect(),
        }
    }

    pub fn schema(&self) -> Vec<(&str, DataType)> {
        self.columns
            .iter()
            .map(|c| (c.name.as_str(), c.data.data_type()))
            .collect()
    }

    /// Check that this block matches the expected header, by position.
    pub fn check_matches_header(&self, header: &Block) -> Result<(), ExecError> {
        if self.num_columns() != header.num_columns() {
            return Err(ExecError::type_mismatch(format!(
                "Block structure mismatch: expected {} columns, got {}",
                header.num_columns(),
                self.num_columns()
            )));
        }
        for (got, expected) in self.columns.iter().zip(&header.columns) {
            if got.name != expected.name || got.data.data_type() != expected.data.data_type() {
                return Err(ExecError::type_mismatch(format!(
                    "Block structure mismatch: expected column `{}` {}, got `{}` {}",
                    expected.name,
                    expected.data.data_type(),
                    got.name,
                    got.data.data_type()
                )));
            }
        }
        Ok(())
    }

    /// Copy out rows `[start, end)` of every column.
    pub fn slice(&self, start: usize, end: usize) -> Block {
        Block {
            info: self.info,
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    data: c.data.slice(start, end),
                })
                .collect(),
        }
    }

    /// Text description of the columns, as sent in TableColumns packets.
    pub fn columns_description(&self) -> String {
        let mut out = format!(
            "columns format version: 1\n{} columns:\n",
            self.num_columns()
        );
        for col in &self.columns {
            out.push_str(&format!("`{}` {}\n", col.name, col.data.data_type()));
        }
        out
    }

    /// Encode the block body (without table name or compression).
    pub fn encode_native(&self, buf: &mut impl BufMut, rev: u64) {
        // Block info is a sequence of numbered fields terminated by 0.
        buf.put_varint(1);
        buf.put_bool(self.info.is_overflows);
        buf.put_varint(2);
        buf.put_i32_le(self.info.bucket_num);
        buf.put_varint(0);

        buf.put_varint(self.num_columns() as u64);
        buf.put_varint(self.num_rows() as u64);

        for col in &self.columns {
            buf.put_string(&col.name);
            buf.put_string(col.data.data_type().name());
            if rev >= revision::CUSTOM_SERIALIZATION {
                // No custom serialization.
                buf.put_u8(0);
            }
            col.data.encode(buf);
        }
    }

    pub fn decode_native(r: &mut WireReader<'_>, rev: u64) -> DecodeResult<Block> {
        let mut info = BlockInfo::default();
        loop {
            match r.read_varint()? {
                0 => break,
                1 => info.is_overflows = r.read_bool()?,
                2 => info.bucket_num = r.read_i32_le()?,
                other => {
                    return Err(NativeSrvError::malformed(format!(
                        "unknown block info field {other}"
                    ))
                    .into());
                }
            }
        }

        let num_columns = r.read_varint_usize()?;
        let num_rows = r.read_varint_usize()?;
        if num_columns > MAX_BLOCK_DIMENSION || num_rows > MAX_BLOCK_DIMENSION {
            return Err(NativeSrvError::malformed(format!(
                "block dimensions too large ({num_columns} columns, {num_rows} rows)"
            ))
            .into());
        }

        let mut columns = Vec::with_capacity(num_columns);
        for _ in 0..num_columns {
            let name = r.read_string()?;
            let data_type: DataType = r.read_string()?.parse()?;
            if rev >= revision::CUSTOM_SERIALIZATION && r.read_bool()? {
                return Err(NativeSrvError::malformed(format!(
                    "custom serialization of column `{name}` is not supported"
                ))
                .into());
            }
            let data = ColumnData::decode(data_type, num_rows, r)?;
            columns.push(Column { name, data });
        }

        Ok(Block { info, columns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Block {
        Block::new(vec![
            Column::new("id", vec![1u64, 2, 3]),
            Column::new("name", vec!["a".to_string(), "bb".to_string(), String::new()]),
            Column::new("delta", vec![-1i32, 0, 1]),
        ])
    }

    #[test]
    fn native_encoding_is_decodable() {
        let block = sample();
        for rev in [revision::MIN_SUPPORTED, revision::SERVER] {
            let mut buf = Vec::new();
            block.encode_native(&mut buf, rev);

            let mut r = WireReader::new(&buf);
            let decoded = Block::decode_native(&mut r, rev).unwrap();
            assert_eq!(block, decoded);
            assert!(r.is_empty());
        }
    }

    #[test]
    fn custom_serialization_flag_is_gated() {
        let block = Block::new(vec![Column::new("a", vec![7u8])]);
        let mut old = Vec::new();
        block.encode_native(&mut old, revision::CUSTOM_SERIALIZATION - 1);
        let mut new = Vec::new();
        block.encode_native(&mut new, revision::CUSTOM_SERIALIZATION);
        assert_eq!(old.len() + 1, new.len());
    }

    #[test]
    fn header_checks() {
        let block = sample();
        let header = block.to_header();
        assert_eq!(0, header.num_rows());
        assert_eq!(3, header.num_columns());
        block.check_matches_header(&header).unwrap();

        let wrong = Block::new(vec![Column::new("id", vec![1u32])]);
        let err = wrong.check_matches_header(&header).unwrap_err();
        assert_eq!(crate::errors::codes::TYPE_MISMATCH, err.code);
    }

    #[test]
    fn empty_marker() {
        assert!(Block::default().is_empty());
        assert!(!sample().to_header().is_empty());
    }

    #[test]
    fn columns_description_format() {
        let desc = Block::header([("a", DataType::UInt64), ("b", DataType::String)])
            .columns_description();
        assert_eq!("columns format version: 1\n2 columns:\n`a` UInt64\n`b` String\n", desc);
    }

    #[test]
    fn extend_and_slice() {
        let mut col = ColumnData::from(vec![1u64, 2]);
        col.extend(&ColumnData::from(vec![3u64])).unwrap();
        assert_eq!(ColumnData::from(vec![2u64, 3]), col.slice(1, 3));
        col.extend(&ColumnData::from(vec![1u8])).unwrap_err();
    }
}
