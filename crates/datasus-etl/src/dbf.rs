//! dBase III table reader
//!
//! Decompressed DATASUS files are plain dBase III tables:
//!
//! ```text
//! +--------------------+ 0
//! | header (32 bytes)  |   record count (u32 LE @4), header length (u16 LE @8),
//! |                    |   record length (u16 LE @10)
//! +--------------------+ 32
//! | field descriptors  |   32 bytes each, terminated by 0x0D
//! +--------------------+ header length
//! | records            |   fixed width, first byte is the deletion flag
//! +--------------------+
//! ```
//!
//! Text is latin-1. Records flagged as deleted are skipped.

use crate::error::{EtlError, Result};
use std::fs::File;
use std::io::{BufReader, Cursor, ErrorKind, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

const HEADER_LEN: usize = 32;
const DESCRIPTOR_LEN: usize = 32;
const DESCRIPTOR_TERMINATOR: u8 = 0x0D;
const DELETED_FLAG: u8 = b'*';

/// Column type as declared in a field descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Character,
    Numeric,
    Float,
    Date,
    Logical,
    Other(u8),
}

impl FieldType {
    fn from_code(code: u8) -> Self {
        match code {
            b'C' => FieldType::Character,
            b'N' => FieldType::Numeric,
            b'F' => FieldType::Float,
            b'D' => FieldType::Date,
            b'L' => FieldType::Logical,
            other => FieldType::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub length: usize,
    pub decimals: u8,
}

impl FieldDescriptor {
    /// Whether values of this field are whole numbers
    pub fn is_integer(&self) -> bool {
        self.field_type == FieldType::Numeric && self.decimals == 0
    }
}

/// Decoded cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Logical(bool),
}

/// A dBase III table read record by record
///
/// Only the header is read on open. Records are pulled from `R` one at a
/// time, so memory stays at one record whatever the table size.
#[derive(Debug)]
pub struct DbfTable<R = BufReader<File>> {
    path: PathBuf,
    fields: Vec<FieldDescriptor>,
    record_count: usize,
    record_len: usize,
    reader: R,
    /// Records consumed so far, deleted ones included
    position: usize,
}

impl DbfTable {
    /// Open the table at `path` and validate its header
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Self::from_reader(path, BufReader::new(file), Some(len))
    }
}

impl DbfTable<Cursor<Vec<u8>>> {
    /// Validate an in-memory table; `path` is only used in error messages
    pub fn from_bytes(path: impl Into<PathBuf>, data: Vec<u8>) -> Result<Self> {
        let len = data.len() as u64;
        Self::from_reader(path, Cursor::new(data), Some(len))
    }
}

impl<R: Read> DbfTable<R> {
    /// Read the header from `reader`, leaving it at the first record.
    ///
    /// With `source_len`, a body shorter than the declared record count is
    /// rejected up front; otherwise truncation surfaces while iterating.
    pub fn from_reader(
        path: impl Into<PathBuf>,
        mut reader: R,
        source_len: Option<u64>,
    ) -> Result<Self> {
        let path = path.into();

        let mut header = vec![0u8; HEADER_LEN];
        read_exact_or(&mut reader, &mut header, &path, "truncated header")?;

        let record_count = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let header_len = u16::from_le_bytes([header[8], header[9]]) as usize;
        let record_len = u16::from_le_bytes([header[10], header[11]]) as usize;

        let beyond_source = source_len.is_some_and(|len| header_len as u64 > len);
        if header_len < HEADER_LEN + 1 || beyond_source {
            return Err(EtlError::dbf(
                &path,
                format!("invalid header length {}", header_len),
            ));
        }

        header.resize(header_len, 0);
        read_exact_or(
            &mut reader,
            &mut header[HEADER_LEN..],
            &path,
            format!("invalid header length {}", header_len),
        )?;

        let fields = parse_descriptors(&path, &header)?;
        if fields.is_empty() {
            return Err(EtlError::dbf(&path, "no field descriptors"));
        }

        let declared: usize = 1 + fields.iter().map(|f| f.length).sum::<usize>();
        if declared != record_len {
            return Err(EtlError::dbf(
                &path,
                format!(
                    "record length {} does not match field widths ({})",
                    record_len, declared
                ),
            ));
        }

        let needed = (record_count as u64)
            .checked_mul(record_len as u64)
            .and_then(|body| body.checked_add(header_len as u64))
            .ok_or_else(|| EtlError::dbf(&path, "record count overflows"))?;
        if let Some(len) = source_len.filter(|&len| len < needed) {
            return Err(EtlError::dbf(
                &path,
                format!(
                    "expected {} records but file holds only {} bytes",
                    record_count, len
                ),
            ));
        }

        debug!(
            path = %path.display(),
            fields = fields.len(),
            records = record_count,
            "Opened DBF table"
        );

        Ok(Self {
            path,
            fields,
            record_count,
            record_len,
            reader,
            position: 0,
        })
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Number of records declared in the header, deleted ones included
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Live records in file order, continuing from the last one read
    pub fn records(&mut self) -> Records<'_, R> {
        let buf = vec![0u8; self.record_len];
        Records { table: self, buf }
    }

    /// Up to `max` live records; empty once the table is exhausted
    pub fn read_batch(&mut self, max: usize) -> Result<Vec<Vec<Value>>> {
        self.records().take(max).collect()
    }
}

/// Iterator over non-deleted records
pub struct Records<'a, R> {
    table: &'a mut DbfTable<R>,
    buf: Vec<u8>,
}

impl<R: Read> Iterator for Records<'_, R> {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        let table = &mut *self.table;
        while table.position < table.record_count {
            let index = table.position;
            table.position += 1;

            if let Err(e) = read_exact_or(
                &mut table.reader,
                &mut self.buf,
                &table.path,
                format!("truncated record {}", index),
            ) {
                // Nothing after a short read can be trusted
                table.position = table.record_count;
                return Some(Err(e));
            }

            if self.buf[0] == DELETED_FLAG {
                continue;
            }
            return Some(decode_record(&table.path, &table.fields, &self.buf));
        }
        None
    }
}

/// `read_exact`, reporting end of input as a DBF format error
fn read_exact_or(
    reader: &mut impl Read,
    buf: &mut [u8],
    path: &Path,
    reason: impl Into<String>,
) -> Result<()> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(EtlError::dbf(path, reason)),
        Err(e) => Err(e.into()),
    }
}

fn decode_record(path: &Path, fields: &[FieldDescriptor], raw: &[u8]) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(fields.len());
    let mut offset = 1;
    for field in fields {
        let cell = &raw[offset..offset + field.length];
        offset += field.length;
        values.push(
            decode_value(field, cell)
                .map_err(|reason| EtlError::dbf(path, format!("field {}: {}", field.name, reason)))?,
        );
    }
    Ok(values)
}

fn parse_descriptors(path: &Path, header: &[u8]) -> Result<Vec<FieldDescriptor>> {
    let mut fields = Vec::new();
    let mut offset = HEADER_LEN;

    loop {
        match header.get(offset) {
            Some(&DESCRIPTOR_TERMINATOR) => break,
            Some(_) if offset + DESCRIPTOR_LEN <= header.len() => {}
            _ => return Err(EtlError::dbf(path, "unterminated field descriptor list")),
        }

        let raw = &header[offset..offset + DESCRIPTOR_LEN];
        let name_end = raw[..11].iter().position(|&b| b == 0).unwrap_or(11);
        fields.push(FieldDescriptor {
            name: latin1(&raw[..name_end]).trim().to_string(),
            field_type: FieldType::from_code(raw[11]),
            length: raw[16] as usize,
            decimals: raw[17],
        });

        offset += DESCRIPTOR_LEN;
    }

    Ok(fields)
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn decode_value(field: &FieldDescriptor, cell: &[u8]) -> std::result::Result<Value, String> {
    let text = latin1(cell);
    let trimmed = text.trim();

    match field.field_type {
        FieldType::Character | FieldType::Other(_) => Ok(Value::Text(trimmed.to_string())),
        FieldType::Numeric | FieldType::Float => {
            // Overflowed numeric cells are filled with asterisks
            if trimmed.is_empty() || trimmed.bytes().all(|b| b == b'*') {
                return Ok(Value::Null);
            }
            if field.is_integer() {
                if let Ok(n) = trimmed.parse::<i64>() {
                    return Ok(Value::Integer(n));
                }
            }
            trimmed
                .parse::<f64>()
                .map(Value::Real)
                .map_err(|_| format!("invalid number '{}'", trimmed))
        }
        FieldType::Date => {
            if trimmed.is_empty() || trimmed.bytes().all(|b| b == b'0') {
                return Ok(Value::Null);
            }
            if trimmed.len() == 8 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
                return Ok(Value::Text(format!(
                    "{}-{}-{}",
                    &trimmed[..4],
                    &trimmed[4..6],
                    &trimmed[6..]
                )));
            }
            Err(format!("invalid date '{}'", trimmed))
        }
        FieldType::Logical => Ok(match trimmed {
            "T" | "t" | "Y" | "y" => Value::Logical(true),
            "F" | "f" | "N" | "n" => Value::Logical(false),
            _ => Value::Null,
        }),
    }
}
