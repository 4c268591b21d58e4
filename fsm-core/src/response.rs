//! Typed response envelope: 4-byte LE type tag + type-specific payload.
//!
//! Used when a peer returns a scalar or an image instead of free text. The
//! message boundary is the transport frame boundary, so strings and pixel
//! blocks carry no length prefix of their own.

use std::fmt;

pub const TAG_FLOAT: u32 = 1;
pub const TAG_INT: u32 = 2;
pub const TAG_TEXT: u32 = 3;
pub const TAG_BOOL: u32 = 4;
pub const TAG_FLOAT_IMAGE: u32 = 5;
pub const TAG_U16_IMAGE: u32 = 6;

const TAG_SIZE: usize = 4;
/// Tag + rows + cols + capture timestamp + exposure.
pub const IMAGE_HEADER_SIZE: usize = TAG_SIZE + 4 + 4 + 8 + 8;

/// A camera frame with its capture metadata. Pixels are row-major, `rows * cols` long.
#[derive(Debug, Clone, PartialEq)]
pub struct Image<P> {
    pub rows: u32,
    pub cols: u32,
    pub capture_timestamp: f64,
    pub exposure_seconds: f64,
    pub pixels: Vec<P>,
}

impl<P> Image<P> {
    fn pixel_count(&self) -> Option<usize> {
        (self.rows as usize).checked_mul(self.cols as usize)
    }
}

/// A decoded typed response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Float(f64),
    Int(i32),
    Text(String),
    Bool(bool),
    FloatImage(Image<f32>),
    U16Image(Image<u16>),
}

impl Response {
    pub fn tag(&self) -> u32 {
        match self {
            Response::Float(_) => TAG_FLOAT,
            Response::Int(_) => TAG_INT,
            Response::Text(_) => TAG_TEXT,
            Response::Bool(_) => TAG_BOOL,
            Response::FloatImage(_) => TAG_FLOAT_IMAGE,
            Response::U16Image(_) => TAG_U16_IMAGE,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Float(v) => write!(f, "{}", v),
            Response::Int(v) => write!(f, "{}", v),
            Response::Text(s) => f.write_str(s),
            Response::Bool(b) => write!(f, "{}", b),
            Response::FloatImage(img) => write!(
                f,
                "float image {}x{} (captured {}, exposure {} s)",
                img.rows, img.cols, img.capture_timestamp, img.exposure_seconds
            ),
            Response::U16Image(img) => write!(
                f,
                "u16 image {}x{} (captured {}, exposure {} s)",
                img.rows, img.cols, img.capture_timestamp, img.exposure_seconds
            ),
        }
    }
}

/// Encode a typed response into a single envelope.
pub fn encode_response(resp: &Response) -> Result<Vec<u8>, ResponseEncodeError> {
    let mut out = Vec::with_capacity(TAG_SIZE + 8);
    out.extend_from_slice(&resp.tag().to_le_bytes());
    match resp {
        Response::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        Response::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
        Response::Text(s) => out.extend_from_slice(s.as_bytes()),
        Response::Bool(b) => out.extend_from_slice(&u32::from(*b).to_le_bytes()),
        Response::FloatImage(img) => {
            encode_image_header(&mut out, img)?;
            for px in &img.pixels {
                out.extend_from_slice(&px.to_le_bytes());
            }
        }
        Response::U16Image(img) => {
            encode_image_header(&mut out, img)?;
            for px in &img.pixels {
                out.extend_from_slice(&px.to_le_bytes());
            }
        }
    }
    Ok(out)
}

fn encode_image_header<P>(out: &mut Vec<u8>, img: &Image<P>) -> Result<(), ResponseEncodeError> {
    let expected = img.pixel_count().ok_or(ResponseEncodeError::DimensionsOverflow)?;
    if expected != img.pixels.len() {
        return Err(ResponseEncodeError::PixelCountMismatch {
            expected,
            actual: img.pixels.len(),
        });
    }
    out.extend_from_slice(&img.rows.to_le_bytes());
    out.extend_from_slice(&img.cols.to_le_bytes());
    out.extend_from_slice(&img.capture_timestamp.to_le_bytes());
    out.extend_from_slice(&img.exposure_seconds.to_le_bytes());
    Ok(())
}

/// Error encoding an image whose pixel buffer disagrees with its dimensions.
#[derive(Debug, thiserror::Error)]
pub enum ResponseEncodeError {
    #[error("image has {actual} pixels, dimensions require {expected}")]
    PixelCountMismatch { expected: usize, actual: usize },
    #[error("image dimensions overflow")]
    DimensionsOverflow,
}

/// Decode one envelope. The whole slice is the message.
pub fn decode_response(bytes: &[u8]) -> Result<Response, ResponseDecodeError> {
    if bytes.len() < TAG_SIZE {
        return Err(ResponseDecodeError::MalformedResponse(format!(
            "envelope is {} bytes, no room for a type tag",
            bytes.len()
        )));
    }
    let tag = u32::from_le_bytes(fixed::<4>(&bytes[..TAG_SIZE])?);
    let payload = &bytes[TAG_SIZE..];
    match tag {
        TAG_FLOAT => Ok(Response::Float(f64::from_le_bytes(fixed::<8>(payload)?))),
        TAG_INT => Ok(Response::Int(i32::from_le_bytes(fixed::<4>(payload)?))),
        TAG_TEXT => String::from_utf8(payload.to_vec())
            .map(Response::Text)
            .map_err(|e| ResponseDecodeError::MalformedResponse(e.to_string())),
        TAG_BOOL => Ok(Response::Bool(u32::from_le_bytes(fixed::<4>(payload)?) != 0)),
        TAG_FLOAT_IMAGE => decode_image(bytes, f32::from_le_bytes).map(Response::FloatImage),
        TAG_U16_IMAGE => decode_image(bytes, u16::from_le_bytes).map(Response::U16Image),
        other => Err(ResponseDecodeError::UnsupportedResponseType(other)),
    }
}

fn fixed<const N: usize>(payload: &[u8]) -> Result<[u8; N], ResponseDecodeError> {
    <[u8; N]>::try_from(payload).map_err(|_| {
        ResponseDecodeError::MalformedResponse(format!(
            "expected {} payload bytes, got {}",
            N,
            payload.len()
        ))
    })
}

fn decode_image<P, const W: usize>(
    bytes: &[u8],
    pixel: fn([u8; W]) -> P,
) -> Result<Image<P>, ResponseDecodeError> {
    if bytes.len() < IMAGE_HEADER_SIZE {
        return Err(ResponseDecodeError::FrameTooShort {
            expected: IMAGE_HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    let rows = u32::from_le_bytes(fixed::<4>(&bytes[4..8])?);
    let cols = u32::from_le_bytes(fixed::<4>(&bytes[8..12])?);
    let capture_timestamp = f64::from_le_bytes(fixed::<8>(&bytes[12..20])?);
    let exposure_seconds = f64::from_le_bytes(fixed::<8>(&bytes[20..28])?);

    let expected = (rows as usize)
        .checked_mul(cols as usize)
        .and_then(|n| n.checked_mul(W))
        .and_then(|n| n.checked_add(IMAGE_HEADER_SIZE))
        .ok_or_else(|| {
            ResponseDecodeError::MalformedResponse(format!("image {}x{} overflows", rows, cols))
        })?;
    if bytes.len() < expected {
        return Err(ResponseDecodeError::FrameTooShort {
            expected,
            actual: bytes.len(),
        });
    }
    if bytes.len() > expected {
        return Err(ResponseDecodeError::MalformedResponse(format!(
            "{} trailing bytes after {}x{} image",
            bytes.len() - expected,
            rows,
            cols
        )));
    }
    let pixels = bytes[IMAGE_HEADER_SIZE..]
        .chunks_exact(W)
        .map(|c| {
            let mut raw = [0u8; W];
            raw.copy_from_slice(c);
            pixel(raw)
        })
        .collect();
    Ok(Image {
        rows,
        cols,
        capture_timestamp,
        exposure_seconds,
        pixels,
    })
}

/// Error decoding a typed envelope. Distinct from transport failures so operators
/// can tell "peer sent garbage" from "peer unreachable".
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResponseDecodeError {
    #[error("unsupported response type {0}")]
    UnsupportedResponseType(u32),
    #[error("image frame too short: need {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> Image<u16> {
        Image {
            rows: 3,
            cols: 4,
            capture_timestamp: 1_700_000_000.25,
            exposure_seconds: 0.5,
            pixels: (0..12).map(|i| i * 1000 + 7).collect(),
        }
    }

    #[test]
    fn roundtrip_scalars_and_image() {
        for resp in [
            Response::Bool(true),
            Response::Bool(false),
            Response::Float(-273.15),
            Response::U16Image(sample_image()),
        ] {
            let bytes = encode_response(&resp).unwrap();
            assert_eq!(decode_response(&bytes).unwrap(), resp);
        }
    }

    #[test]
    fn u16_image_layout_is_byte_exact() {
        let bytes = encode_response(&Response::U16Image(sample_image())).unwrap();
        assert_eq!(bytes.len(), IMAGE_HEADER_SIZE + 12 * 2);
        assert_eq!(&bytes[0..4], &6u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &4u32.to_le_bytes());
        assert_eq!(&bytes[20..28], &0.5f64.to_le_bytes());
        assert_eq!(&bytes[28..30], &7u16.to_le_bytes());
    }

    #[test]
    fn short_image_frame_rejected() {
        let bytes = encode_response(&Response::U16Image(sample_image())).unwrap();
        let err = decode_response(&bytes[..bytes.len() - 1]).unwrap_err();
        assert_eq!(
            err,
            ResponseDecodeError::FrameTooShort {
                expected: 52,
                actual: 51
            }
        );
        // Header cut off mid-way is still a short frame, not a panic.
        assert!(matches!(
            decode_response(&bytes[..10]),
            Err(ResponseDecodeError::FrameTooShort { .. })
        ));
    }

    #[test]
    fn bool_decodes_any_nonzero() {
        let mut bytes = TAG_BOOL.to_le_bytes().to_vec();
        bytes.extend_from_slice(&42u32.to_le_bytes());
        assert_eq!(decode_response(&bytes).unwrap(), Response::Bool(true));
    }

    #[test]
    fn text_payload_is_verbatim() {
        let mut bytes = TAG_TEXT.to_le_bytes().to_vec();
        bytes.extend_from_slice("filter=Hα".as_bytes());
        assert_eq!(
            decode_response(&bytes).unwrap(),
            Response::Text("filter=Hα".into())
        );
    }

    #[test]
    fn unknown_tag_unsupported() {
        let bytes = 9u32.to_le_bytes();
        assert_eq!(
            decode_response(&bytes),
            Err(ResponseDecodeError::UnsupportedResponseType(9))
        );
    }

    #[test]
    fn truncated_scalar_malformed() {
        let mut bytes = TAG_FLOAT.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0, 1, 2]);
        assert!(matches!(
            decode_response(&bytes),
            Err(ResponseDecodeError::MalformedResponse(_))
        ));
        assert!(matches!(
            decode_response(&[1, 0]),
            Err(ResponseDecodeError::MalformedResponse(_))
        ));
    }

    #[test]
    fn float_image_roundtrip() {
        let img = Image {
            rows: 2,
            cols: 2,
            capture_timestamp: 12.0,
            exposure_seconds: 3.0,
            pixels: vec![0.0f32, 1.5, -2.25, 1e6],
        };
        let bytes = encode_response(&Response::FloatImage(img.clone())).unwrap();
        assert_eq!(bytes.len(), IMAGE_HEADER_SIZE + 4 * 4);
        assert_eq!(decode_response(&bytes).unwrap(), Response::FloatImage(img));
    }

    #[test]
    fn encode_rejects_pixel_mismatch() {
        let mut img = sample_image();
        img.pixels.pop();
        assert!(matches!(
            encode_response(&Response::U16Image(img)),
            Err(ResponseEncodeError::PixelCountMismatch {
                expected: 12,
                actual: 11
            })
        ));
    }
}
