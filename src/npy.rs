//! Canonical `.npy` v1.0 serialization for the tensor frames exchanged
//! with the decision server. Only the three element types the protocol
//! uses are supported: little-endian `i32` and `f64`, and `u8`.

use crate::error::Error;

const MAGIC: &[u8; 6] = b"\x93NUMPY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    I4,
    F8,
    U1,
}

impl Dtype {
    pub fn descr(self) -> &'static str {
        match self {
            Dtype::I4 => "<i4",
            Dtype::F8 => "<f8",
            Dtype::U1 => "|u1",
        }
    }

    pub fn word_size(self) -> usize {
        match self {
            Dtype::I4 => 4,
            Dtype::F8 => 8,
            Dtype::U1 => 1,
        }
    }

    fn from_descr(descr: &str) -> Option<Self> {
        match descr {
            "<i4" => Some(Dtype::I4),
            "<f8" => Some(Dtype::F8),
            "|u1" | "<u1" => Some(Dtype::U1),
            _ => None,
        }
    }
}

/// A dense row-major tensor plus its dtype and shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    data: Vec<u8>,
}

impl Tensor {
    pub fn from_i32(shape: Vec<usize>, values: &[i32]) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            dtype: Dtype::I4,
            shape,
            data,
        }
    }

    pub fn from_f64(shape: Vec<usize>, values: &[f64]) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            dtype: Dtype::F8,
            shape,
            data,
        }
    }

    pub fn from_u8(shape: Vec<usize>, values: &[u8]) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        Self {
            dtype: Dtype::U1,
            shape,
            data: values.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the first element that is not zero, across all supported
    /// dtypes. This is how a one-hot decision vector is decoded.
    pub fn first_nonzero(&self) -> Option<usize> {
        match self.dtype {
            Dtype::U1 => self.data.iter().position(|b| *b != 0),
            Dtype::I4 => self
                .data
                .chunks_exact(4)
                .position(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) != 0),
            Dtype::F8 => self.data.chunks_exact(8).position(|c| {
                f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) != 0.0
            }),
        }
    }

    /// Serialize: magic, version 1.0, padded ASCII header dict, raw
    /// little-endian elements. The header is space-padded so that the
    /// total preamble length is a multiple of 64, as numpy writes it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let shape = match self.shape.len() {
            0 => "()".to_string(),
            1 => format!("({},)", self.shape[0]),
            _ => format!(
                "({})",
                self.shape
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        let mut header = format!(
            "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
            self.dtype.descr(),
            shape
        );
        let preamble = MAGIC.len() + 2 + 2; // magic + version + header-len field
        let padded = (preamble + header.len() + 1).div_ceil(64) * 64;
        while preamble + header.len() + 1 < padded {
            header.push(' ');
        }
        header.push('\n');

        let mut out = Vec::with_capacity(padded + self.data.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&[0x01, 0x00]);
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse a v1.0 buffer back into a tensor.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 10 || &bytes[..6] != MAGIC {
            return Err(Error::Protocol("tensor frame lacks npy magic".into()));
        }
        if bytes[6] != 1 {
            return Err(Error::Protocol(format!(
                "unsupported npy version {}.{}",
                bytes[6], bytes[7]
            )));
        }
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        let body_start = 10 + header_len;
        if bytes.len() < body_start {
            return Err(Error::Protocol("truncated npy header".into()));
        }
        let header = std::str::from_utf8(&bytes[10..body_start])
            .map_err(|_| Error::Protocol("npy header is not ASCII".into()))?;

        let descr = extract_quoted(header, "'descr':")
            .ok_or_else(|| Error::Protocol("npy header lacks descr".into()))?;
        let dtype = Dtype::from_descr(&descr)
            .ok_or_else(|| Error::Protocol(format!("unsupported npy dtype {descr:?}")))?;
        if header.contains("'fortran_order': True") {
            return Err(Error::Protocol("fortran-ordered tensors unsupported".into()));
        }
        let shape = extract_shape(header)
            .ok_or_else(|| Error::Protocol("npy header lacks shape".into()))?;

        let expected = shape.iter().product::<usize>() * dtype.word_size();
        let data = &bytes[body_start..];
        if data.len() != expected {
            return Err(Error::Protocol(format!(
                "npy payload is {} B, header promises {} B",
                data.len(),
                expected
            )));
        }
        Ok(Self {
            dtype,
            shape,
            data: data.to_vec(),
        })
    }

    #[cfg(test)]
    pub fn as_f64(&self) -> Vec<f64> {
        assert_eq!(self.dtype, Dtype::F8);
        self.data
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect()
    }

    #[cfg(test)]
    pub fn as_i32(&self) -> Vec<i32> {
        assert_eq!(self.dtype, Dtype::I4);
        self.data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

fn extract_quoted(header: &str, key: &str) -> Option<String> {
    let at = header.find(key)? + key.len();
    let rest = &header[at..];
    let open = rest.find('\'')?;
    let close = rest[open + 1..].find('\'')?;
    Some(rest[open + 1..open + 1 + close].to_string())
}

fn extract_shape(header: &str) -> Option<Vec<usize>> {
    let at = header.find("'shape':")?;
    let rest = &header[at..];
    let open = rest.find('(')?;
    let close = rest.find(')')?;
    let inner = &rest[open + 1..close];
    let mut shape = vec![];
    for part in inner.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        shape.push(part.parse().ok()?);
    }
    Some(shape)
}
