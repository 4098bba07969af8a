//! File-type detection for atomizer selection.
//!
//! Magic bytes win over extensions; extensions win over the UTF-8 heuristic.

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const TEXT_PLAIN: &str = "text/plain";
pub const TAR: &str = "application/x-tar";
pub const SAFETENSORS: &str = "application/x-safetensors";
pub const PGM: &str = "image/x-portable-graymap";
pub const PPM: &str = "image/x-portable-pixmap";

const USTAR_MAGIC_OFFSET: usize = 257;

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub content_type: String,
    pub extension: Option<String>,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f32,
}

impl Detection {
    fn new(content_type: &str, extension: &str, confidence: f32) -> Self {
        Self {
            content_type: content_type.to_string(),
            extension: Some(extension.to_string()),
            confidence,
        }
    }
}

pub trait FileTypeDetector: Send + Sync {
    fn detect(&self, content: &[u8], filename: Option<&str>) -> Detection;
}

/// Magic-byte and extension based detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct MagicDetector;

impl FileTypeDetector for MagicDetector {
    fn detect(&self, content: &[u8], filename: Option<&str>) -> Detection {
        if let Some(detection) = detect_magic(content) {
            return detection;
        }

        let extension = filename
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());
        if let Some(content_type) = extension.as_deref().and_then(content_type_for_extension) {
            return Detection {
                content_type: content_type.to_string(),
                extension,
                confidence: 0.6,
            };
        }

        if std::str::from_utf8(content).is_ok() {
            return Detection {
                content_type: TEXT_PLAIN.to_string(),
                extension: extension.or_else(|| Some("txt".to_string())),
                confidence: 0.5,
            };
        }

        Detection {
            content_type: OCTET_STREAM.to_string(),
            extension,
            confidence: 0.1,
        }
    }
}

fn detect_magic(content: &[u8]) -> Option<Detection> {
    if content.len() >= 3
        && content[0] == b'P'
        && content[2].is_ascii_whitespace()
    {
        match content[1] {
            b'5' => return Some(Detection::new(PGM, "pgm", 0.9)),
            b'6' => return Some(Detection::new(PPM, "ppm", 0.9)),
            _ => {}
        }
    }

    if content.len() >= USTAR_MAGIC_OFFSET + 5
        && &content[USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + 5] == b"ustar"
    {
        return Some(Detection::new(TAR, "tar", 0.95));
    }

    if content.len() > 9 {
        let mut len_bytes = [0_u8; 8];
        len_bytes.copy_from_slice(&content[..8]);
        let header_len = u64::from_le_bytes(len_bytes);
        if header_len >= 2 && header_len <= (content.len() - 8) as u64 && content[8] == b'{' {
            return Some(Detection::new(SAFETENSORS, "safetensors", 0.8));
        }
    }

    None
}

fn content_type_for_extension(extension: &str) -> Option<&'static str> {
    match extension {
        "txt" | "md" | "csv" | "json" | "log" | "rs" | "py" | "toml" | "yaml" | "yml" => {
            Some(TEXT_PLAIN)
        }
        "tar" => Some(TAR),
        "safetensors" => Some(SAFETENSORS),
        "pgm" => Some(PGM),
        "ppm" | "pnm" => Some(PPM),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{FileTypeDetector, MagicDetector, OCTET_STREAM, PGM, SAFETENSORS, TAR, TEXT_PLAIN};

    #[test]
    fn magic_bytes_beat_misleading_extensions() {
        let detection = MagicDetector.detect(b"P5\n2 2\n255\n\x00\x01\x02\x03", Some("notes.txt"));
        assert_eq!(detection.content_type, PGM);
        assert!(detection.confidence > 0.8);
    }

    #[test]
    fn ustar_magic_is_found_at_offset_257() {
        let mut block = vec![0_u8; 512];
        block[257..262].copy_from_slice(b"ustar");
        assert_eq!(MagicDetector.detect(&block, None).content_type, TAR);
    }

    #[test]
    fn safetensors_header_length_prefix_is_recognised() {
        let header = br#"{"a":{}}"#;
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header);
        assert_eq!(MagicDetector.detect(&bytes, None).content_type, SAFETENSORS);
    }

    #[test]
    fn falls_back_to_utf8_then_octet_stream() {
        let text = MagicDetector.detect("héllo".as_bytes(), None);
        assert_eq!(text.content_type, TEXT_PLAIN);
        assert_eq!(text.extension.as_deref(), Some("txt"));
        assert_eq!(MagicDetector.detect(&[0xff, 0xfe, 0x00], None).content_type, OCTET_STREAM);
    }
}
