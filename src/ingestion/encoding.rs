//! Text encoding resolution and line reading.
//!
//! Resolution tries strict UTF-8 first. When that fails, the head of the file is fed to
//! `chardetng` and a short list of candidates is decoded lossily until one of them yields at
//! least one non-blank line.

use std::path::Path;

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE};
use tracing::{info, warn};

use crate::error::PipelineResult;

/// A text encoding the pipeline knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    /// UTF-8 with an optional leading byte-order mark.
    Utf8Sig,
    /// UTF-16, endianness from the BOM, little-endian without one.
    Utf16,
    /// UTF-32, endianness from the BOM, little-endian without one.
    Utf32,
    /// ISO-8859-1: every byte maps to the code point of the same value.
    Latin1,
    /// Any other WHATWG encoding, usually the statistical detector's guess.
    Detected(&'static Encoding),
}

impl TextEncoding {
    /// Resolve a label as stored on a run (`"utf-8"`, `"latin1"`, `"windows-1252"`, ...).
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Self::Utf8),
            "utf-8-sig" | "utf8-sig" => Some(Self::Utf8Sig),
            "utf-16" | "utf16" => Some(Self::Utf16),
            "utf-32" | "utf32" => Some(Self::Utf32),
            "latin1" | "latin-1" | "iso-8859-1" | "iso8859-1" => Some(Self::Latin1),
            other => Encoding::for_label(other.as_bytes()).map(|enc| {
                if enc == encoding_rs::UTF_8 {
                    Self::Utf8
                } else {
                    Self::Detected(enc)
                }
            }),
        }
    }

    /// Lower-case label, stable across runs.
    pub fn name(&self) -> String {
        match self {
            Self::Utf8 => "utf-8".to_string(),
            Self::Utf8Sig => "utf-8-sig".to_string(),
            Self::Utf16 => "utf-16".to_string(),
            Self::Utf32 => "utf-32".to_string(),
            Self::Latin1 => "latin1".to_string(),
            Self::Detected(enc) => enc.name().to_ascii_lowercase(),
        }
    }

    /// Decode `bytes`, replacing invalid sequences with U+FFFD.
    pub fn decode_lossy(&self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 | Self::Utf8Sig => String::from_utf8_lossy(bytes).into_owned(),
            Self::Utf16 => {
                let (enc, body) = match bytes {
                    [0xFE, 0xFF, rest @ ..] => (UTF_16BE, rest),
                    [0xFF, 0xFE, rest @ ..] => (UTF_16LE, rest),
                    _ => (UTF_16LE, bytes),
                };
                enc.decode_without_bom_handling(body).0.into_owned()
            }
            Self::Utf32 => decode_utf32_lossy(bytes),
            Self::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Self::Detected(enc) => enc.decode_without_bom_handling(bytes).0.into_owned(),
        }
    }
}

fn decode_utf32_lossy(bytes: &[u8]) -> String {
    let (big_endian, body) = match bytes {
        [0x00, 0x00, 0xFE, 0xFF, rest @ ..] => (true, rest),
        [0xFF, 0xFE, 0x00, 0x00, rest @ ..] => (false, rest),
        _ => (false, bytes),
    };
    let chunks = body.chunks_exact(4);
    let trailing = !chunks.remainder().is_empty();
    let mut out: String = chunks
        .map(|c| {
            let raw = [c[0], c[1], c[2], c[3]];
            let cp = if big_endian {
                u32::from_be_bytes(raw)
            } else {
                u32::from_le_bytes(raw)
            };
            char::from_u32(cp).unwrap_or(char::REPLACEMENT_CHARACTER)
        })
        .collect();
    if trailing {
        out.push(char::REPLACEMENT_CHARACTER);
    }
    out
}

/// Split decoded text into physical lines.
///
/// `\r\n` and bare `\r` are normalized to `\n`, a leading BOM is removed and a trailing newline
/// does not produce an extra empty line.
pub fn split_lines(text: &str) -> Vec<String> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    if text.is_empty() {
        return Vec::new();
    }
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let body = normalized.strip_suffix('\n').unwrap_or(&normalized);
    body.split('\n').map(str::to_string).collect()
}

/// Lines decoded with the encoding that resolution settled on.
#[derive(Debug, Clone)]
pub struct DecodedText {
    pub encoding: TextEncoding,
    pub lines: Vec<String>,
    pub warnings: Vec<String>,
}

/// Every candidate decoded to blank content.
#[derive(Debug, Clone)]
pub struct EncodingExhausted {
    pub message: String,
    pub warnings: Vec<String>,
}

/// Resolve the encoding of `bytes` (the full content of `file_name`).
pub fn resolve_encoding(
    bytes: &[u8],
    file_name: &str,
    probe_bytes: usize,
) -> Result<DecodedText, EncodingExhausted> {
    let mut warnings = Vec::new();

    match std::str::from_utf8(bytes) {
        Ok(text) => {
            let lines = split_lines(text);
            info!(file = file_name, lines = lines.len(), "decoded as utf-8");
            return Ok(DecodedText {
                encoding: TextEncoding::Utf8,
                lines,
                warnings,
            });
        }
        Err(_) => {
            let msg = format!(
                "[ENCODING] UTF-8 decode failed for {file_name}, trying detection and fallback encodings."
            );
            warn!("{msg}");
            warnings.push(msg);
        }
    }

    let probe = &bytes[..bytes.len().min(probe_bytes)];
    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(probe, probe.len() == bytes.len());
    let detected = detector.guess(None, false);
    info!(file = file_name, detected = detected.name(), "statistical encoding guess");

    let mut tried: Vec<String> = Vec::new();
    for candidate in candidate_encodings(detected) {
        let label = candidate.name();
        if tried.iter().any(|t| t.eq_ignore_ascii_case(&label)) {
            continue;
        }
        tried.push(label.clone());

        let lines = split_lines(&candidate.decode_lossy(bytes));
        if lines.iter().any(|l| !l.trim().is_empty()) {
            info!(file = file_name, encoding = %label, lines = lines.len(), "decoded with fallback encoding");
            return Ok(DecodedText {
                encoding: candidate,
                lines,
                warnings,
            });
        }
        let msg = format!(
            "[ENCODING] Read 0 non-empty lines from {file_name} with encoding {label}. Trying next encoding..."
        );
        warn!("{msg}");
        warnings.push(msg);
    }

    let message = exhausted_message(&tried, bytes);
    warnings.push(message.clone());
    Err(EncodingExhausted { message, warnings })
}

fn candidate_encodings(detected: &'static Encoding) -> [TextEncoding; 5] {
    [
        TextEncoding::Detected(detected),
        TextEncoding::Utf8Sig,
        TextEncoding::Utf16,
        TextEncoding::Utf32,
        TextEncoding::Latin1,
    ]
}

fn exhausted_message(tried: &[String], bytes: &[u8]) -> String {
    let tried = tried
        .iter()
        .map(|t| format!("'{t}'"))
        .collect::<Vec<_>>()
        .join(", ");
    let hex = bytes
        .iter()
        .take(32)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "Could not read file with any known encoding. Tried: [{tried}]. First 32 bytes (hex): {hex}"
    )
}

/// Read a text file with a previously resolved encoding label (UTF-8 when unset or unknown).
pub fn read_lines(path: &Path, encoding: Option<&str>) -> PipelineResult<Vec<String>> {
    let bytes = std::fs::read(path)?;
    let enc = encoding
        .and_then(TextEncoding::from_label)
        .unwrap_or(TextEncoding::Utf8);
    Ok(split_lines(&enc.decode_lossy(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_lines_normalizes_endings_and_bom() {
        let lines = split_lines("\u{feff}a,b\r\nc,d\re,f\n");
        assert_eq!(lines, vec!["a,b", "c,d", "e,f"]);
        assert!(split_lines("").is_empty());
        assert_eq!(split_lines("\n\n"), vec!["", ""]);
    }

    #[test]
    fn valid_utf8_resolves_without_detection() {
        let decoded = resolve_encoding("name,city\nJosé,Málaga\n".as_bytes(), "a.csv", 4096).unwrap();
        assert_eq!(decoded.encoding, TextEncoding::Utf8);
        assert_eq!(decoded.lines[1], "José,Málaga");
        assert!(decoded.warnings.is_empty());
    }

    #[test]
    fn invalid_utf8_falls_back_to_a_single_byte_encoding() {
        // "José;Málaga" in ISO-8859-1.
        let bytes = b"name;city\nJos\xe9;M\xe1laga\n";
        let decoded = resolve_encoding(bytes, "a.csv", 4096).unwrap();
        assert_ne!(decoded.encoding, TextEncoding::Utf8);
        assert_eq!(decoded.lines[1], "José;Málaga");
        assert!(!decoded.warnings.is_empty());
    }

    #[test]
    fn utf16_with_bom_is_decoded() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "a,b\n".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let text = TextEncoding::Utf16.decode_lossy(&bytes);
        assert_eq!(split_lines(&text), vec!["a,b"]);
    }

    #[test]
    fn utf32_little_endian_is_decoded() {
        let mut bytes = Vec::new();
        for c in "x;y".chars() {
            bytes.extend_from_slice(&(c as u32).to_le_bytes());
        }
        bytes.push(0x41);
        assert_eq!(TextEncoding::Utf32.decode_lossy(&bytes), "x;y\u{fffd}");
    }

    #[test]
    fn labels_round_trip() {
        for label in ["utf-8", "utf-8-sig", "utf-16", "utf-32", "latin1", "windows-1252"] {
            let enc = TextEncoding::from_label(label).unwrap();
            assert_eq!(enc.name(), label);
        }
        assert_eq!(TextEncoding::Latin1.decode_lossy(&[0x80]), "\u{80}");
    }

    #[test]
    fn exhausted_message_lists_candidates_and_hex() {
        let msg = exhausted_message(&["utf-16".to_string(), "latin1".to_string()], &[0xde, 0xad]);
        assert!(msg.starts_with("Could not read file with any known encoding. Tried: ['utf-16', 'latin1']"));
        assert!(msg.ends_with("de ad"));
    }
}
