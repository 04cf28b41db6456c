/// NPY container header codec
///
/// Layout: magic `\x93NUMPY`, two version bytes, a little-endian header length
/// (u16 for version 1.0, u32 for 2.0/3.0) and a Python dict literal padded with
/// spaces and terminated by `\n`. The data block starts right after the header
/// and is aligned to `HEADER_ALIGNMENT` bytes.

use std::path::Path;

use crate::error::{storage_error, ScanResult};
use crate::storage::Dtype;

/// Magic bytes identifying NPY files
const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Data block alignment used when writing headers
pub const HEADER_ALIGNMENT: usize = 64;

/// Magic + version + length field of a version 1.0 header
const PREAMBLE_V1: usize = 10;

/// Magic + version + length field of a version 2.0 header
const PREAMBLE_V2: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyHeader {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    /// Byte offset of the first element
    pub data_offset: usize,
    /// Byte length of the data block
    pub data_len: usize,
}

/// Bytes needed for `shape` elements of `dtype`, `None` on overflow
pub fn byte_len(dtype: Dtype, shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(dtype.size(), |acc, &d| acc.checked_mul(d))
}

impl NpyHeader {
    pub fn element_count(&self) -> usize {
        self.data_len / self.dtype.size()
    }

    /// Encode a header for `dtype`/`shape`; the returned bytes end exactly at
    /// the start of the data block
    pub fn encode(dtype: Dtype, shape: &[usize]) -> Vec<u8> {
        let shape_str = match shape.len() {
            0 => "()".to_string(),
            1 => format!("({},)", shape[0]),
            _ => {
                let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
                format!("({})", dims.join(", "))
            }
        };
        let dict = format!(
            "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
            dtype.descr(),
            shape_str
        );

        // Version 1.0 unless the dict does not fit a u16 length field
        let (version, preamble) = if dict.len() + 1 + PREAMBLE_V1 + HEADER_ALIGNMENT <= u16::MAX as usize {
            (1u8, PREAMBLE_V1)
        } else {
            (2u8, PREAMBLE_V2)
        };

        let unpadded = preamble + dict.len() + 1;
        let pad = (HEADER_ALIGNMENT - unpadded % HEADER_ALIGNMENT) % HEADER_ALIGNMENT;
        let header_len = dict.len() + pad + 1;

        let mut bytes = Vec::with_capacity(preamble + header_len);
        bytes.extend_from_slice(NPY_MAGIC);
        bytes.push(version);
        bytes.push(0);
        if version == 1 {
            bytes.extend_from_slice(&(header_len as u16).to_le_bytes());
        } else {
            bytes.extend_from_slice(&(header_len as u32).to_le_bytes());
        }
        bytes.extend_from_slice(dict.as_bytes());
        bytes.resize(bytes.len() + pad, b' ');
        bytes.push(b'\n');
        bytes
    }

    /// Parse the header at the start of `data`; `path` is only used for errors
    pub fn parse(data: &[u8], path: &Path) -> ScanResult<Self> {
        if data.len() < PREAMBLE_V1 || &data[..NPY_MAGIC.len()] != NPY_MAGIC {
            return Err(storage_error(path, "missing NPY magic"));
        }

        let major = data[6];
        let (preamble, header_len) = match major {
            1 => (PREAMBLE_V1, u16::from_le_bytes([data[8], data[9]]) as usize),
            2 | 3 => {
                if data.len() < PREAMBLE_V2 {
                    return Err(storage_error(path, "truncated NPY preamble"));
                }
                let len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
                (PREAMBLE_V2, len as usize)
            }
            other => {
                return Err(storage_error(path, format!("unsupported NPY version {}", other)));
            }
        };

        let data_offset = preamble + header_len;
        if data.len() < data_offset {
            return Err(storage_error(path, "header length exceeds file size"));
        }
        let dict = std::str::from_utf8(&data[preamble..data_offset])
            .map_err(|_| storage_error(path, "header is not valid UTF-8"))?;

        let descr = dict_value(dict, "descr")
            .and_then(quoted)
            .ok_or_else(|| storage_error(path, "header has no 'descr'"))?;
        let dtype = Dtype::from_descr(descr)
            .ok_or_else(|| storage_error(path, format!("unsupported dtype '{}'", descr)))?;

        match dict_value(dict, "fortran_order") {
            Some(v) if v.starts_with("False") => {}
            Some(v) if v.starts_with("True") => {
                return Err(storage_error(path, "fortran-ordered arrays are not supported"));
            }
            _ => return Err(storage_error(path, "header has no 'fortran_order'")),
        }

        let shape = dict_value(dict, "shape")
            .and_then(parse_shape)
            .ok_or_else(|| storage_error(path, "header has a missing or malformed 'shape'"))?;

        let data_len = byte_len(dtype, &shape)
            .filter(|len| len.checked_add(data_offset).is_some())
            .ok_or_else(|| storage_error(path, format!("shape {:?} overflows the address space", shape)))?;
        if data.len() - data_offset < data_len {
            return Err(storage_error(
                path,
                format!(
                    "data block truncated: expected {} bytes, found {}",
                    data_len,
                    data.len() - data_offset
                ),
            ));
        }
        Ok(NpyHeader {
            dtype,
            shape,
            data_offset,
            data_len,
        })
    }
}

/// Text following `'key':` in the header dict
fn dict_value<'a>(dict: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{}'", key);
    let start = dict.find(&needle)? + needle.len();
    let rest = dict[start..].trim_start();
    Some(rest.strip_prefix(':')?.trim_start())
}

fn quoted(value: &str) -> Option<&str> {
    let inner = value.strip_prefix('\'')?;
    let end = inner.find('\'')?;
    Some(&inner[..end])
}

fn parse_shape(value: &str) -> Option<Vec<usize>> {
    let inner = value.strip_prefix('(')?;
    let end = inner.find(')')?;
    inner[..end]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_end_matches('L').parse::<usize>().ok())
        .collect()
}
