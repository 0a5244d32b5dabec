//! # Module Image Format
//!
//! A controller module image is a fixed header, an opaque payload (tuning
//! tables, filter coefficients, I/O maps) and a trailing signature over
//! header + payload.
//!
//! ```text
//!  offset  size  field
//!  0       4     magic "TKRM"
//!  4       1     format (1)
//!  5       1     entry table index
//!  6       2     reserved, zero
//!  8       4     version (LE)
//!  12      4     payload length (LE)
//!  16      n     payload
//!  16+n    64    signature, r || s
//! ```

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::MAX_IMAGE_BYTES;

pub const MAGIC: [u8; 4] = *b"TKRM";
pub const FORMAT_V1: u8 = 1;
pub const HEADER_LEN: usize = 16;
pub const SIGNATURE_LEN: usize = 64;

/// Structural problems found before the signature is even checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("image truncated at {0} bytes")]
    Truncated(usize),
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported image format {0}")]
    UnsupportedFormat(u8),
    #[error("payload length {declared} does not match image ({actual} bytes)")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("image of {0} bytes exceeds slot capacity")]
    TooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleHeader {
    pub format: u8,
    pub entry: u8,
    pub version: u32,
    pub payload_len: u32,
}

impl ModuleHeader {
    pub const fn new(entry: u8, version: u32, payload_len: u32) -> Self {
        Self {
            format: FORMAT_V1,
            entry,
            version,
            payload_len,
        }
    }

    fn write(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&MAGIC);
        out[4] = self.format;
        out[5] = self.entry;
        out[6..8].copy_from_slice(&[0, 0]);
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(word)
}

/// Borrowed view of a parsed image.
#[derive(Debug, Clone, Copy)]
pub struct ModuleImage<'a> {
    header: ModuleHeader,
    signed: &'a [u8],
    signature: &'a [u8],
}

impl<'a> ModuleImage<'a> {
    /// Check structure and split the image. Does not verify the signature.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ImageError> {
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(ImageError::TooLarge(bytes.len()));
        }
        if bytes.len() < HEADER_LEN + SIGNATURE_LEN {
            return Err(ImageError::Truncated(bytes.len()));
        }
        if bytes[0..4] != MAGIC {
            return Err(ImageError::BadMagic);
        }
        let format = bytes[4];
        if format != FORMAT_V1 {
            return Err(ImageError::UnsupportedFormat(format));
        }
        let header = ModuleHeader {
            format,
            entry: bytes[5],
            version: le_u32(&bytes[8..12]),
            payload_len: le_u32(&bytes[12..16]),
        };
        let signed_len = HEADER_LEN + header.payload_len as usize;
        if signed_len + SIGNATURE_LEN != bytes.len() {
            return Err(ImageError::LengthMismatch {
                declared: header.payload_len,
                actual: bytes.len(),
            });
        }
        let (signed, signature) = bytes.split_at(signed_len);
        Ok(Self {
            header,
            signed,
            signature,
        })
    }

    pub fn header(&self) -> &ModuleHeader {
        &self.header
    }

    pub fn version(&self) -> u32 {
        self.header.version
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.signed[HEADER_LEN..]
    }

    /// Header + payload: the bytes the signature covers.
    pub fn signed_bytes(&self) -> &'a [u8] {
        self.signed
    }

    pub fn signature(&self) -> &'a [u8] {
        self.signature
    }

    /// SHA-256 of the signed bytes.
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.signed).into()
    }

    /// First four digest bytes, for log lines.
    pub fn fingerprint(&self) -> u32 {
        let digest = self.digest();
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}

/// Write header + payload into `out` and return the signed length. The
/// caller signs `out[..len]` and passes the signature to [`append_signature`].
pub fn write_unsigned(entry: u8, version: u32, payload: &[u8], out: &mut [u8]) -> Result<usize, ImageError> {
    let signed_len = HEADER_LEN + payload.len();
    let total = signed_len + SIGNATURE_LEN;
    if total > MAX_IMAGE_BYTES || total > out.len() {
        return Err(ImageError::TooLarge(total));
    }
    ModuleHeader::new(entry, version, payload.len() as u32).write(&mut out[..HEADER_LEN]);
    out[HEADER_LEN..signed_len].copy_from_slice(payload);
    Ok(signed_len)
}

/// Append a signature after `signed_len` bytes. Returns the image length.
pub fn append_signature(out: &mut [u8], signed_len: usize, signature: &[u8]) -> Result<usize, ImageError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(ImageError::Truncated(signature.len()));
    }
    let total = signed_len + SIGNATURE_LEN;
    if total > out.len() {
        return Err(ImageError::TooLarge(total));
    }
    out[signed_len..total].copy_from_slice(signature);
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(payload: &[u8]) -> ([u8; MAX_IMAGE_BYTES], usize) {
        let mut buf = [0u8; MAX_IMAGE_BYTES];
        let signed = write_unsigned(2, 7, payload, &mut buf).unwrap();
        let len = append_signature(&mut buf, signed, &[0xAB; SIGNATURE_LEN]).unwrap();
        (buf, len)
    }

    #[test]
    fn test_parse_layout() {
        let (buf, len) = build(b"gains:1,2,3");
        let image = ModuleImage::parse(&buf[..len]).unwrap();
        assert_eq!(image.header().entry, 2);
        assert_eq!(image.version(), 7);
        assert_eq!(image.payload(), b"gains:1,2,3");
        assert_eq!(image.signed_bytes().len(), HEADER_LEN + 11);
        assert_eq!(image.signature(), &[0xAB; SIGNATURE_LEN][..]);
    }

    #[test]
    fn test_structural_errors() {
        let (mut buf, len) = build(b"xyz");
        assert_eq!(ModuleImage::parse(&buf[..40]).unwrap_err(), ImageError::Truncated(40));
        assert!(matches!(
            ModuleImage::parse(&buf[..len - 1]),
            Err(ImageError::LengthMismatch { declared: 3, .. })
        ));
        buf[4] = 9;
        assert_eq!(ModuleImage::parse(&buf[..len]).unwrap_err(), ImageError::UnsupportedFormat(9));
        buf[0] = b'X';
        assert_eq!(ModuleImage::parse(&buf[..len]).unwrap_err(), ImageError::BadMagic);
    }

    #[test]
    fn test_oversized_payload_refused() {
        let mut buf = [0u8; MAX_IMAGE_BYTES];
        let payload = [0u8; MAX_IMAGE_BYTES];
        assert!(matches!(
            write_unsigned(0, 1, &payload, &mut buf),
            Err(ImageError::TooLarge(_))
        ));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let (a, len_a) = build(b"one");
        let (b, len_b) = build(b"two");
        let fa = ModuleImage::parse(&a[..len_a]).unwrap().fingerprint();
        let fb = ModuleImage::parse(&b[..len_b]).unwrap().fingerprint();
        assert_ne!(fa, fb);
    }
}
