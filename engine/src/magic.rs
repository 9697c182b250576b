//! Content type sniffing from leading magic bytes.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};

const SNIFF_LEN: usize = 16;

/// Detected content type of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Jpeg,
    Png,
    Gif,
    Tiff,
    Mp4,
    Mov,
    Mkv,
    Avi,
    Mp3,
    Flac,
    Wav,
    Pdf,
    Other,
}

/// Broad class used to decide whether metadata extraction is worthwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Image,
    Video,
    Audio,
    Document,
    Other,
}

impl ContentType {
    pub fn category(self) -> Category {
        match self {
            Self::Jpeg | Self::Png | Self::Gif | Self::Tiff => Category::Image,
            Self::Mp4 | Self::Mov | Self::Mkv | Self::Avi => Category::Video,
            Self::Mp3 | Self::Flac | Self::Wav => Category::Audio,
            Self::Pdf => Category::Document,
            Self::Other => Category::Other,
        }
    }

    pub fn warrants_metadata(self) -> bool {
        self.category() != Category::Other
    }
}

/// Classify a buffer holding the first bytes of a file.
pub fn sniff(head: &[u8]) -> ContentType {
    let starts = |magic: &[u8]| head.starts_with(magic);

    if starts(&[0xff, 0xd8, 0xff]) {
        ContentType::Jpeg
    } else if starts(b"\x89PNG\r\n\x1a\n") {
        ContentType::Png
    } else if starts(b"GIF87a") || starts(b"GIF89a") {
        ContentType::Gif
    } else if starts(b"II*\0") || starts(b"MM\0*") {
        ContentType::Tiff
    } else if starts(b"%PDF") {
        ContentType::Pdf
    } else if starts(b"fLaC") {
        ContentType::Flac
    } else if starts(b"ID3") || starts(&[0xff, 0xfb]) || starts(&[0xff, 0xf3]) {
        ContentType::Mp3
    } else if starts(&[0x1a, 0x45, 0xdf, 0xa3]) {
        ContentType::Mkv
    } else if head.len() >= 12 && &head[..4] == b"RIFF" {
        match &head[8..12] {
            b"WAVE" => ContentType::Wav,
            b"AVI " => ContentType::Avi,
            _ => ContentType::Other,
        }
    } else if head.len() >= 12 && &head[4..8] == b"ftyp" {
        if &head[8..12] == b"qt  " {
            ContentType::Mov
        } else {
            ContentType::Mp4
        }
    } else {
        ContentType::Other
    }
}

/// Read the head of a file and classify it.
pub fn sniff_file(path: &Path) -> io::Result<ContentType> {
    let mut file = File::open(path)?;
    let mut head = [0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        match file.read(&mut head[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(sniff(&head[..filled]))
}
