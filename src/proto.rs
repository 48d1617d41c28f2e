//! Length-prefixed framing for the decision-server link.
//!
//! Every frame is a big-endian `u64` byte count followed by that many
//! bytes. A frame either carries one of the ASCII tags below or a tensor
//! in `.npy` form.

use std::io::{Read, Write};

use crate::error::Error;
use crate::npy::Tensor;

pub const CONN: &str = "CONN";
pub const SBMT: &str = "SBMT";
pub const WAIT: &str = "WAIT";
pub const CNFM: &str = "CNFM";

/// Upper bound on a single frame; anything larger is a framing error, not
/// a tensor we ever exchange.
const MAX_FRAME: u64 = 1 << 30;

pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), Error> {
    w.write_all(&(payload.len() as u64).to_be_bytes())?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>, Error> {
    let mut len = [0_u8; 8];
    r.read_exact(&mut len)?;
    let len = u64::from_be_bytes(len);
    if len > MAX_FRAME {
        return Err(Error::Protocol(format!("frame of {len} B refused")));
    }
    let mut payload = vec![0_u8; len as usize];
    r.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_message<W: Write>(w: &mut W, tag: &str) -> Result<(), Error> {
    write_frame(w, tag.as_bytes())
}

pub fn read_message<R: Read>(r: &mut R) -> Result<String, Error> {
    let payload = read_frame(r)?;
    String::from_utf8(payload).map_err(|_| Error::Protocol("message frame is not ASCII".into()))
}

/// Read a message frame and require an exact tag.
pub fn expect<R: Read>(r: &mut R, tag: &str) -> Result<(), Error> {
    let got = read_message(r)?;
    if got != tag {
        return Err(Error::Protocol(format!("expected {tag:?}, got {got:?}")));
    }
    Ok(())
}

pub fn write_tensor<W: Write>(w: &mut W, tensor: &Tensor) -> Result<(), Error> {
    write_frame(w, &tensor.to_bytes())
}

pub fn read_tensor<R: Read>(r: &mut R) -> Result<Tensor, Error> {
    Tensor::parse(&read_frame(r)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip() {
        let mut buf = vec![];
        write_message(&mut buf, SBMT).unwrap();
        assert_eq!(&buf[..8], &4_u64.to_be_bytes());
        let mut r = buf.as_slice();
        assert_eq!(read_message(&mut r).unwrap(), "SBMT");
    }

    #[test]
    fn test_expect_mismatch_is_protocol_error() {
        let mut buf = vec![];
        write_message(&mut buf, WAIT).unwrap();
        let mut r = buf.as_slice();
        assert!(matches!(expect(&mut r, CNFM), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_tensor_round_trip() {
        let t = Tensor::from_f64(vec![1, 4], &[2.0, 1.0, 1e10, 5e8]);
        let mut buf = vec![];
        write_tensor(&mut buf, &t).unwrap();
        let mut r = buf.as_slice();
        assert_eq!(read_tensor(&mut r).unwrap(), t);
    }

    #[test]
    fn test_oversized_frame_refused() {
        let mut buf = vec![];
        buf.extend_from_slice(&(MAX_FRAME + 1).to_be_bytes());
        let mut r = buf.as_slice();
        assert!(matches!(read_frame(&mut r), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_truncated_frame_is_io_error() {
        let mut buf = vec![];
        buf.extend_from_slice(&100_u64.to_be_bytes());
        buf.extend_from_slice(b"short");
        let mut r = buf.as_slice();
        assert!(matches!(read_frame(&mut r), Err(Error::Io(_))));
    }
}
