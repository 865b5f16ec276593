//! NPY file loading for golden reference values
//!
//! Reads NumPy `.npy` files exported by a reference implementation and turns
//! them into debug-point values or tensors. Also writes `f64` arrays, which
//! is enough to exchange matrices with NumPy.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use super::value::DebugValue;

const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Element type of an NPY array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpyDtype {
    /// `<f4`
    F32,
    /// `<f8`
    F64,
    /// `<i4`
    I32,
    /// `<i8`
    I64,
}

impl NpyDtype {
    fn parse(descr: &str) -> Result<Self> {
        if descr.starts_with('>') {
            anyhow::bail!("Big-endian NPY data is not supported: {}", descr);
        }
        match descr.trim_start_matches(['<', '|', '=']) {
            "f4" => Ok(NpyDtype::F32),
            "f8" => Ok(NpyDtype::F64),
            "i4" => Ok(NpyDtype::I32),
            "i8" => Ok(NpyDtype::I64),
            _ => anyhow::bail!("Unsupported dtype: {}", descr),
        }
    }

    fn size(self) -> usize {
        match self {
            NpyDtype::F32 | NpyDtype::I32 => 4,
            NpyDtype::F64 | NpyDtype::I64 => 8,
        }
    }
}

/// NPY array data
#[derive(Debug, Clone)]
pub struct NpyArray {
    /// Shape of the array (empty for 0-d arrays)
    pub shape: Vec<usize>,
    /// Element type
    pub dtype: NpyDtype,
    /// Raw little-endian data bytes
    pub data: Vec<u8>,
}

impl NpyArray {
    /// Get total number of elements
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the array is an integer array
    pub fn is_integer(&self) -> bool {
        matches!(self.dtype, NpyDtype::I32 | NpyDtype::I64)
    }

    /// Values widened to `f64`, whatever the stored dtype
    pub fn to_f64(&self) -> Vec<f64> {
        match self.dtype {
            NpyDtype::F32 => self
                .data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
                .collect(),
            NpyDtype::F64 => self
                .data
                .chunks_exact(8)
                .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect(),
            NpyDtype::I32 | NpyDtype::I64 => self.to_i64().into_iter().map(|v| v as f64).collect(),
        }
    }

    /// Values as `i64`; float data is truncated
    pub fn to_i64(&self) -> Vec<i64> {
        match self.dtype {
            NpyDtype::I32 => self
                .data
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64)
                .collect(),
            NpyDtype::I64 => self
                .data
                .chunks_exact(8)
                .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect(),
            NpyDtype::F32 | NpyDtype::F64 => self.to_f64().into_iter().map(|v| v as i64).collect(),
        }
    }

    /// Build an `f64` tensor with the array's shape
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let tensor = Tensor::from_vec(self.to_f64(), self.shape.as_slice(), device)?;
        Ok(tensor)
    }

    /// Convert to a debug value: 0-d arrays become scalars, the rest tensors
    pub fn to_debug_value(&self, device: &Device) -> Result<DebugValue> {
        if self.shape.is_empty() {
            let value = if self.is_integer() {
                DebugValue::Integer(self.to_i64()[0])
            } else {
                DebugValue::Scalar(self.to_f64()[0])
            };
            return Ok(value);
        }
        Ok(DebugValue::Matrix(self.to_tensor(device)?))
    }
}

/// Load an NPY file
pub fn load_npy<P: AsRef<Path>>(path: P) -> Result<NpyArray> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open NPY file: {:?}", path))?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        anyhow::bail!("Invalid NPY magic number");
    }

    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    let (header_len, prefix_len) = if version[0] == 1 {
        let mut len_bytes = [0u8; 2];
        reader.read_exact(&mut len_bytes)?;
        (u16::from_le_bytes(len_bytes) as usize, 10)
    } else {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        (u32::from_le_bytes(len_bytes) as usize, 12)
    };
    let payload_len = file_len
        .checked_sub((prefix_len + header_len) as u64)
        .with_context(|| format!("Truncated NPY header in {:?}", path))?;

    let mut header_bytes = vec![0u8; header_len];
    reader.read_exact(&mut header_bytes)?;
    let header = String::from_utf8_lossy(&header_bytes);

    if parse_fortran_order(&header)? {
        anyhow::bail!("Fortran-ordered NPY arrays are not supported: {:?}", path);
    }
    let dtype = NpyDtype::parse(&parse_dtype(&header)?)?;
    let shape = parse_shape(&header)?;

    let data_size = shape
        .iter()
        .try_fold(dtype.size(), |acc, &d| acc.checked_mul(d))
        .with_context(|| format!("NPY shape {:?} overflows in {:?}", shape, path))?;
    if data_size as u64 != payload_len {
        anyhow::bail!(
            "NPY shape {:?} needs {} bytes but {:?} holds {}",
            shape,
            data_size,
            path,
            payload_len
        );
    }
    let mut data = vec![0u8; data_size];
    reader.read_exact(&mut data)
        .with_context(|| format!("Truncated NPY data in {:?}", path))?;

    Ok(NpyArray { shape, dtype, data })
}

/// Load an NPY file as a debug-point value
pub fn load_debug_value<P: AsRef<Path>>(path: P, device: &Device) -> Result<DebugValue> {
    load_npy(path)?.to_debug_value(device)
}

/// Load an NPY file as an `f64` tensor
pub fn load_npy_tensor<P: AsRef<Path>>(path: P, device: &Device) -> Result<Tensor> {
    load_npy(path)?.to_tensor(device)
}

/// Write `data` with `shape` as a version 1.0 little-endian `f64` NPY file
pub fn save_npy_f64<P: AsRef<Path>>(path: P, shape: &[usize], data: &[f64]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if expected != data.len() {
        anyhow::bail!("Shape {:?} needs {} values, got {}", shape, expected, data.len());
    }

    let shape_str = match shape {
        [] => "()".to_string(),
        [n] => format!("({},)", n),
        dims => format!(
            "({})",
            dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': {}, }}",
        shape_str
    );
    // magic + version + u16 length + header + '\n' must be a multiple of 64
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let path = path.as_ref();
    let file = File::create(path)
        .with_context(|| format!("Failed to create NPY file: {:?}", path))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_all(&(header.len() as u16).to_le_bytes())?;
    writer.write_all(header.as_bytes())?;
    for v in data {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Write a tensor as an `f64` NPY file
pub fn save_tensor_npy<P: AsRef<Path>>(path: P, tensor: &Tensor) -> Result<()> {
    let data: Vec<f64> = tensor
        .to_dtype(candle_core::DType::F64)?
        .flatten_all()?
        .to_vec1()?;
    save_npy_f64(path, tensor.dims(), &data)
}

/// Parse dtype from NPY header
fn parse_dtype(header: &str) -> Result<String> {
    let start = header.find("'descr'")
        .or_else(|| header.find("\"descr\""))
        .ok_or_else(|| anyhow::anyhow!("No descr in header"))?;

    let rest = &header[start + "'descr'".len()..];
    let colon = rest.find(':').ok_or_else(|| anyhow::anyhow!("No colon after descr"))?;
    let after_colon = &rest[colon + 1..];

    let quote_start = after_colon.find(['\'', '"'])
        .ok_or_else(|| anyhow::anyhow!("No dtype string"))?;
    let quote_char = &after_colon[quote_start..quote_start + 1];
    let dtype_start = quote_start + 1;
    let dtype_end = after_colon[dtype_start..].find(quote_char)
        .ok_or_else(|| anyhow::anyhow!("Unclosed dtype string"))?;

    Ok(after_colon[dtype_start..dtype_start + dtype_end].to_string())
}

/// Parse the fortran_order flag from NPY header
fn parse_fortran_order(header: &str) -> Result<bool> {
    let start = header.find("fortran_order")
        .ok_or_else(|| anyhow::anyhow!("No fortran_order in header"))?;
    let rest = &header[start..];
    Ok(rest.find("True").is_some_and(|t| rest.find("False").map_or(true, |f| t < f)))
}

/// Parse shape from NPY header
fn parse_shape(header: &str) -> Result<Vec<usize>> {
    let start = header.find("'shape'")
        .or_else(|| header.find("\"shape\""))
        .ok_or_else(|| anyhow::anyhow!("No shape in header"))?;

    let rest = &header[start..];
    let paren_start = rest.find('(')
        .ok_or_else(|| anyhow::anyhow!("No shape tuple"))?;
    let paren_end = rest.find(')')
        .ok_or_else(|| anyhow::anyhow!("Unclosed shape tuple"))?;

    rest[paren_start + 1..paren_end]
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|e| anyhow::anyhow!("Invalid shape element: {}", e))
        })
        .collect()
}
