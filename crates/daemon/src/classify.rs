//! Content classifier for files arriving in the backup tree.
//!
//! Identifies file content from magic byte signatures read out of the first
//! 64 bytes, falling back to extension lookup when no signature matches.
//! Signatures are evaluated in one explicit priority order so that formats
//! sharing leading bytes (the `ftyp` family, RIFF containers, the EBML
//! header) always resolve the same way.

use std::path::Path;

/// Number of leading bytes read for signature matching. Every recognized
/// signature fits inside this window.
pub const HEADER_LEN: usize = 64;

/// Content type detected for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Jpeg,
    Png,
    Gif,
    Heic,
    Webp,
    Mp4,
    Mov,
    Avi,
    Mpg,
    Wmv,
    Flv,
    Webm,
    Mkv,
    Mp3,
    M4a,
    Wav,
    Sqlite,
    Pdf,
    Plist,
    Zip,
    Gzip,
    Xml,
    Json,
    Text,
    Unknown,
}

impl ContentType {
    /// Short name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Jpeg => "JPEG",
            ContentType::Png => "PNG",
            ContentType::Gif => "GIF",
            ContentType::Heic => "HEIC",
            ContentType::Webp => "WEBP",
            ContentType::Mp4 => "MP4",
            ContentType::Mov => "MOV",
            ContentType::Avi => "AVI",
            ContentType::Mpg => "MPG",
            ContentType::Wmv => "WMV",
            ContentType::Flv => "FLV",
            ContentType::Webm => "WebM",
            ContentType::Mkv => "MKV",
            ContentType::Mp3 => "MP3",
            ContentType::M4a => "M4A",
            ContentType::Wav => "WAV",
            ContentType::Sqlite => "SQLite",
            ContentType::Pdf => "PDF",
            ContentType::Plist => "PLIST",
            ContentType::Zip => "ZIP",
            ContentType::Gzip => "GZIP",
            ContentType::Xml => "XML",
            ContentType::Json => "JSON",
            ContentType::Text => "Text",
            ContentType::Unknown => "Unknown",
        }
    }

    /// True for video container formats handled by the thumbnail converter.
    pub fn is_video(&self) -> bool {
        matches!(
            self,
            ContentType::Mp4
                | ContentType::Mov
                | ContentType::Avi
                | ContentType::Mpg
                | ContentType::Wmv
                | ContentType::Flv
                | ContentType::Webm
                | ContentType::Mkv
        )
    }

    /// True for image formats decoded in-process.
    pub fn is_raster_image(&self) -> bool {
        matches!(
            self,
            ContentType::Jpeg | ContentType::Png | ContentType::Gif | ContentType::Webp
        )
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reliability tier of a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// Magic bytes matched.
    High,
    /// Extension fallback.
    Low,
    /// Nothing matched.
    None,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::High => write!(f, "high (magic bytes)"),
            Confidence::Low => write!(f, "low (extension)"),
            Confidence::None => write!(f, "none"),
        }
    }
}

/// Result of classifying one file. Derived per file, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationResult {
    pub content_type: ContentType,
    pub confidence: Confidence,
}

/// A known content signature: magic byte patterns at a fixed offset plus the
/// canonical extension used for fallback lookup.
#[derive(Debug, Clone, Copy)]
pub struct ContentSignature {
    pub content_type: ContentType,
    pub extension: &'static str,
    pub magic: &'static [&'static [u8]],
    pub offset: usize,
    pub description: &'static str,
}

/// Signature table in evaluation order: first match wins.
///
/// Ordering constraints, not just preference:
/// - HEIC (`ftypheic`), M4A (`ftypM4A`), and MOV (`ftypqt`) must precede the
///   generic MP4 `ftyp` entry.
/// - AVI and WEBP match inside a RIFF container at offset 8 and must precede
///   the bare `RIFF` WAV entry at offset 0.
/// - WebM and MKV share the EBML header; WebM is listed first, so EBML
///   content classifies as WebM by magic and MKV stays reachable through its
///   extension.
pub const SIGNATURES: &[ContentSignature] = &[
    ContentSignature {
        content_type: ContentType::Sqlite,
        extension: "db",
        magic: &[&[
            0x53, 0x51, 0x4C, 0x69, 0x74, 0x65, 0x20, 0x66, 0x6F, 0x72, 0x6D, 0x61, 0x74, 0x20,
            0x33, 0x00,
        ]],
        offset: 0,
        description: "SQLite Database",
    },
    ContentSignature {
        content_type: ContentType::Wmv,
        extension: "wmv",
        magic: &[&[0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11]],
        offset: 0,
        description: "Windows Media Video",
    },
    ContentSignature {
        content_type: ContentType::Png,
        extension: "png",
        magic: &[&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]],
        offset: 0,
        description: "PNG Image",
    },
    ContentSignature {
        content_type: ContentType::Heic,
        extension: "heic",
        magic: &[b"ftypheic"],
        offset: 4,
        description: "HEIC Image",
    },
    ContentSignature {
        content_type: ContentType::M4a,
        extension: "m4a",
        magic: &[b"ftypM4A"],
        offset: 4,
        description: "M4A Audio",
    },
    ContentSignature {
        content_type: ContentType::Mov,
        extension: "mov",
        magic: &[b"ftypqt"],
        offset: 4,
        description: "QuickTime MOV Video",
    },
    ContentSignature {
        content_type: ContentType::Plist,
        extension: "plist",
        magic: &[b"bplist"],
        offset: 0,
        description: "Binary Property List",
    },
    ContentSignature {
        content_type: ContentType::Gif,
        extension: "gif",
        magic: &[b"GIF87a", b"GIF89a"],
        offset: 0,
        description: "GIF Image",
    },
    ContentSignature {
        content_type: ContentType::Xml,
        extension: "xml",
        magic: &[b"<?xml"],
        offset: 0,
        description: "XML Document",
    },
    ContentSignature {
        content_type: ContentType::Pdf,
        extension: "pdf",
        magic: &[b"%PDF"],
        offset: 0,
        description: "Adobe PDF Document",
    },
    ContentSignature {
        content_type: ContentType::Flv,
        extension: "flv",
        magic: &[&[0x46, 0x4C, 0x56, 0x01]],
        offset: 0,
        description: "Flash Video",
    },
    ContentSignature {
        content_type: ContentType::Zip,
        extension: "zip",
        magic: &[
            &[0x50, 0x4B, 0x03, 0x04],
            &[0x50, 0x4B, 0x05, 0x06],
            &[0x50, 0x4B, 0x07, 0x08],
        ],
        offset: 0,
        description: "ZIP Archive",
    },
    ContentSignature {
        content_type: ContentType::Mpg,
        extension: "mpg",
        magic: &[
            &[0x00, 0x00, 0x01, 0xBA],
            &[0x00, 0x00, 0x01, 0xB3],
            &[0x00, 0x00, 0x01, 0xB0],
        ],
        offset: 0,
        description: "MPEG Video",
    },
    ContentSignature {
        content_type: ContentType::Webm,
        extension: "webm",
        magic: &[&[0x1A, 0x45, 0xDF, 0xA3]],
        offset: 0,
        description: "WebM Video",
    },
    ContentSignature {
        content_type: ContentType::Mkv,
        extension: "mkv",
        magic: &[&[0x1A, 0x45, 0xDF, 0xA3]],
        offset: 0,
        description: "Matroska Video",
    },
    ContentSignature {
        content_type: ContentType::Avi,
        extension: "avi",
        magic: &[b"AVI "],
        offset: 8,
        description: "AVI Video",
    },
    ContentSignature {
        content_type: ContentType::Webp,
        extension: "webp",
        magic: &[b"WEBP"],
        offset: 8,
        description: "WEBP Image",
    },
    ContentSignature {
        content_type: ContentType::Mp4,
        extension: "mp4",
        magic: &[b"ftyp"],
        offset: 4,
        description: "MP4 Video",
    },
    ContentSignature {
        content_type: ContentType::Wav,
        extension: "wav",
        magic: &[b"RIFF"],
        offset: 0,
        description: "WAV Audio",
    },
    ContentSignature {
        content_type: ContentType::Mp3,
        extension: "mp3",
        magic: &[b"ID3", &[0xFF, 0xFB], &[0xFF, 0xF3], &[0xFF, 0xF2]],
        offset: 0,
        description: "MP3 Audio",
    },
    ContentSignature {
        content_type: ContentType::Jpeg,
        extension: "jpg",
        magic: &[&[0xFF, 0xD8, 0xFF]],
        offset: 0,
        description: "JPEG Image",
    },
    ContentSignature {
        content_type: ContentType::Gzip,
        extension: "gz",
        magic: &[&[0x1F, 0x8B]],
        offset: 0,
        description: "GZIP Archive",
    },
    ContentSignature {
        content_type: ContentType::Json,
        extension: "json",
        magic: &[b"{", b"["],
        offset: 0,
        description: "JSON Data",
    },
];

/// Plain-text extensions without magic bytes.
const TEXT_EXTENSIONS: &[&str] = &["txt", "log", "css", "js", "html", "md", "csv"];

/// Checks whether `buffer` contains `pattern` at `offset`.
fn matches_at(buffer: &[u8], pattern: &[u8], offset: usize) -> bool {
    buffer.len() >= offset + pattern.len() && &buffer[offset..offset + pattern.len()] == pattern
}

/// Classify by magic bytes alone. Returns `None` when no signature matches.
fn classify_magic(header: &[u8]) -> Option<ContentType> {
    for signature in SIGNATURES {
        for pattern in signature.magic {
            if matches_at(header, pattern, signature.offset) {
                return Some(signature.content_type);
            }
        }
    }
    None
}

/// Classify by a lowercased extension without the leading dot.
fn classify_extension(ext: &str) -> Option<ContentType> {
    if let Some(signature) = SIGNATURES.iter().find(|s| s.extension == ext) {
        return Some(signature.content_type);
    }
    if TEXT_EXTENSIONS.contains(&ext) {
        return Some(ContentType::Text);
    }
    // Common container aliases recognized by extension only.
    match ext {
        "jpeg" => Some(ContentType::Jpeg),
        "m4v" | "mpeg" => Some(ContentType::Mp4),
        _ => None,
    }
}

/// Normalize an extension candidate: lowercase, leading dot stripped.
fn normalize_extension(ext: &str) -> String {
    ext.trim_start_matches('.').to_lowercase()
}

/// Classify a file from the first [`HEADER_LEN`] bytes of its content and
/// its path.
///
/// Magic bytes win with `High` confidence; otherwise the file's own extension
/// is looked up with `Low` confidence; otherwise `Unknown`/`None`.
pub fn classify(header: &[u8], path: &Path) -> ClassificationResult {
    classify_with_hint(header, path, None)
}

/// Classify with an optional extension hint from an external report.
///
/// The hint is consulted ahead of the on-disk filename extension because
/// backup payload files are stored under hash names with no extension.
pub fn classify_with_hint(
    header: &[u8],
    path: &Path,
    extension_hint: Option<&str>,
) -> ClassificationResult {
    if let Some(content_type) = classify_magic(header) {
        return ClassificationResult {
            content_type,
            confidence: Confidence::High,
        };
    }

    let fallbacks = extension_hint
        .map(normalize_extension)
        .into_iter()
        .chain(
            path.extension()
                .and_then(|e| e.to_str())
                .map(normalize_extension),
        );

    for ext in fallbacks {
        if ext.is_empty() {
            continue;
        }
        if let Some(content_type) = classify_extension(&ext) {
            return ClassificationResult {
                content_type,
                confidence: Confidence::Low,
            };
        }
    }

    ClassificationResult {
        content_type: ContentType::Unknown,
        confidence: Confidence::None,
    }
}

/// Human-readable description of a content type, from the signature table.
pub fn describe(content_type: ContentType) -> &'static str {
    SIGNATURES
        .iter()
        .find(|s| s.content_type == content_type)
        .map(|s| s.description)
        .unwrap_or(match content_type {
            ContentType::Text => "Plain Text File",
            _ => "Unknown File Type",
        })
}
