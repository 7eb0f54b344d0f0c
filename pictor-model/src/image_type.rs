#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Image (or container) formats the pipeline recognizes by magic number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ImageType {
    Jpeg,
    Png,
    Gif,
    Webp,
    Heic,
    Mp4,
}

impl ImageType {
    /// Sniff the format from a byte prefix.
    ///
    /// Returns `None` when the prefix is too short or matches nothing.
    /// WebP requires the RIFF chunk id at offset 8; HEIC and MP4 share the
    /// ISO `ftyp` box at offset 4 and are split by brand.
    pub fn from_bytes(data: &[u8]) -> Option<ImageType> {
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(ImageType::Jpeg);
        }
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A])
        {
            return Some(ImageType::Png);
        }
        if data.starts_with(b"GIF") {
            return Some(ImageType::Gif);
        }
        if data.len() >= 12
            && data.starts_with(b"RIFF")
            && &data[8..12] == b"WEBP"
        {
            return Some(ImageType::Webp);
        }
        if data.len() >= 12 && &data[4..8] == b"ftyp" {
            return match &data[8..12] {
                b"heic" | b"heix" | b"hevc" | b"hevx" | b"mif1" | b"msf1" => {
                    Some(ImageType::Heic)
                }
                _ => Some(ImageType::Mp4),
            };
        }
        None
    }
}
