//! Magic-byte format detection and header dimension extraction.
//!
//! Classifies raw attachment bytes into one of the supported formats and
//! reads width/height straight out of the format header. Pure parsing,
//! no file I/O.

use std::fmt;

use thiserror::Error;

pub const GIF_SIGNATURE: &[u8; 3] = b"GIF";
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
pub const PNG_SIGNATURE: &[u8; 4] = b"\x89PNG";
pub const BMP_SIGNATURE: &[u8; 2] = b"BM";
pub const PDF_SIGNATURE: &[u8; 5] = b"%PDF-";

const TIFF_LE: [u8; 4] = [0x49, 0x49, 0x2A, 0x00];
const TIFF_BE: [u8; 4] = [0x4D, 0x4D, 0x00, 0x2A];

/// TIFF IFD tags carrying the raster dimensions.
const TIFF_TAG_HEIGHT: u16 = 256;
const TIFF_TAG_WIDTH: u16 = 257;

/// Supported attachment formats. Anything else is rejected before the
/// pipeline starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Gif,
    Jpeg,
    Png,
    Bmp,
    Tiff,
    Pdf,
}

impl ImageFormat {
    /// Canonical file extensions for the format, first one preferred.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Gif => &["gif"],
            Self::Jpeg => &["jpg", "jpeg", "jpe"],
            Self::Png => &["png"],
            Self::Bmp => &["bmp"],
            Self::Tiff => &["tif", "tiff"],
            Self::Pdf => &["pdf"],
        }
    }

    /// Content types a part declaring this format is expected to carry.
    pub fn content_types(&self) -> &'static [&'static str] {
        match self {
            Self::Gif => &["image/gif"],
            Self::Jpeg => &["image/jpeg", "image/pjpeg"],
            Self::Png => &["image/png", "image/x-png"],
            Self::Bmp => &["image/bmp", "image/x-ms-bmp"],
            Self::Tiff => &["image/tiff"],
            Self::Pdf => &["application/pdf"],
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gif => "gif",
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Bmp => "bmp",
            Self::Tiff => "tiff",
            Self::Pdf => "pdf",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while sniffing attachment bytes.
#[derive(Debug, Error)]
pub enum SniffError {
    #[error("no known format signature")]
    Unrecognized,

    #[error("truncated {0} header")]
    Truncated(&'static str),

    #[error("jpeg: no start-of-frame marker before end of data")]
    MissingStartOfFrame,
}

/// Result of sniffing: detected format plus header dimensions.
///
/// PDF carries no pixel dimensions; it reports 0x0 and the header version
/// string instead.
#[derive(Debug, Clone)]
pub struct Sniffed {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub pdf_version: Option<String>,
}

/// Classify raw bytes and extract dimensions from the format header.
///
/// Signatures are checked in a fixed priority order; the first match wins.
pub fn sniff(data: &[u8]) -> Result<Sniffed, SniffError> {
    if data.starts_with(GIF_SIGNATURE) {
        return sniff_gif(data);
    }
    if data.len() >= 2 && data[0..2] == JPEG_SOI {
        return sniff_jpeg(data);
    }
    if data.starts_with(PNG_SIGNATURE) {
        return sniff_png(data);
    }
    if data.starts_with(BMP_SIGNATURE) {
        return sniff_bmp(data);
    }
    if data.len() >= 4 && (data[0..4] == TIFF_LE || data[0..4] == TIFF_BE) {
        return sniff_tiff(data);
    }
    if data.starts_with(PDF_SIGNATURE) {
        return sniff_pdf(data);
    }
    Err(SniffError::Unrecognized)
}

fn sniff_gif(data: &[u8]) -> Result<Sniffed, SniffError> {
    if data.len() < 10 {
        return Err(SniffError::Truncated("gif"));
    }
    let width = u16::from_le_bytes([data[6], data[7]]) as u32;
    let height = u16::from_le_bytes([data[8], data[9]]) as u32;
    Ok(Sniffed {
        format: ImageFormat::Gif,
        width,
        height,
        pdf_version: None,
    })
}

/// Start-of-frame markers. C4 (DHT), C8 (JPG) and CC (DAC) look like SOF
/// markers but carry no frame header.
fn is_sof_marker(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

fn sniff_jpeg(data: &[u8]) -> Result<Sniffed, SniffError> {
    let mut pos = 2usize;

    while pos + 3 < data.len() {
        let flag = data[pos];
        let marker = data[pos + 1];
        if flag != 0xFF {
            break;
        }

        if is_sof_marker(marker) {
            // Segment layout: len(2) precision(1) height(2) width(2)
            if pos + 9 > data.len() {
                return Err(SniffError::Truncated("jpeg"));
            }
            let height = u16::from_be_bytes([data[pos + 5], data[pos + 6]]) as u32;
            let width = u16::from_be_bytes([data[pos + 7], data[pos + 8]]) as u32;
            return Ok(Sniffed {
                format: ImageFormat::Jpeg,
                width,
                height,
                pdf_version: None,
            });
        }

        let seg_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        if seg_len < 2 {
            break;
        }
        pos += 2 + seg_len;
    }

    Err(SniffError::MissingStartOfFrame)
}

fn sniff_png(data: &[u8]) -> Result<Sniffed, SniffError> {
    if data.len() < 24 {
        return Err(SniffError::Truncated("png"));
    }
    let width = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
    let height = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
    Ok(Sniffed {
        format: ImageFormat::Png,
        width,
        height,
        pdf_version: None,
    })
}

fn sniff_bmp(data: &[u8]) -> Result<Sniffed, SniffError> {
    if data.len() < 26 {
        return Err(SniffError::Truncated("bmp"));
    }
    let width = u32::from_le_bytes([data[18], data[19], data[20], data[21]]);
    let height = u32::from_le_bytes([data[22], data[23], data[24], data[25]]);
    Ok(Sniffed {
        format: ImageFormat::Bmp,
        width,
        height,
        pdf_version: None,
    })
}

fn sniff_tiff(data: &[u8]) -> Result<Sniffed, SniffError> {
    let big_endian = data[0..4] == TIFF_BE;

    let read16 = |at: usize| -> Option<u16> {
        let b = data.get(at..at + 2)?;
        Some(if big_endian {
            u16::from_be_bytes([b[0], b[1]])
        } else {
            u16::from_le_bytes([b[0], b[1]])
        })
    };
    let read32 = |at: usize| -> Option<u32> {
        let b = data.get(at..at + 4)?;
        Some(if big_endian {
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        } else {
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        })
    };

    let ifd_offset = read32(4).ok_or(SniffError::Truncated("tiff"))? as usize;
    let entry_count = read16(ifd_offset).ok_or(SniffError::Truncated("tiff"))? as usize;

    let mut width = 0u32;
    let mut height = 0u32;
    for i in 0..entry_count {
        let entry = ifd_offset + 2 + i * 12;
        let tag = read16(entry).ok_or(SniffError::Truncated("tiff"))?;
        if tag != TIFF_TAG_HEIGHT && tag != TIFF_TAG_WIDTH {
            continue;
        }
        let field_type = read16(entry + 2).ok_or(SniffError::Truncated("tiff"))?;
        // SHORT values sit in the first two bytes of the value word.
        let value = if field_type == 3 {
            read16(entry + 8).ok_or(SniffError::Truncated("tiff"))? as u32
        } else {
            read32(entry + 8).ok_or(SniffError::Truncated("tiff"))?
        };
        if tag == TIFF_TAG_HEIGHT {
            height = value;
        } else {
            width = value;
        }
        if width > 0 && height > 0 {
            break;
        }
    }

    // Dimension tags missing or zero: fall back to 1x1 so the gate can
    // still reason about the image.
    if width == 0 {
        width = 1;
    }
    if height == 0 {
        height = 1;
    }

    Ok(Sniffed {
        format: ImageFormat::Tiff,
        width,
        height,
        pdf_version: None,
    })
}

fn sniff_pdf(data: &[u8]) -> Result<Sniffed, SniffError> {
    if data.len() < 8 {
        return Err(SniffError::Truncated("pdf"));
    }
    let version = String::from_utf8_lossy(&data[5..8]).to_string();
    Ok(Sniffed {
        format: ImageFormat::Pdf,
        width: 0,
        height: 0,
        pdf_version: Some(version),
    })
}
