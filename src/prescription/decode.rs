//! Encoding detection for legacy prescription exports.
//!
//! Candidates are tried in configured order. A candidate wins when it decodes
//! the bytes without a single malformed sequence and enough of the resulting
//! letters are Hangul. If nothing qualifies the bytes are read as UTF-8,
//! replacing invalid sequences.

use encoding_rs::Encoding;
use log::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    /// Canonical name of the encoding used.
    pub encoding: &'static str,
    /// True when no candidate qualified and the UTF-8 fallback was used.
    pub fallback: bool,
}

/// Share of alphabetic characters that are Hangul (syllables or jamo).
pub fn hangul_ratio(text: &str) -> f64 {
    let mut letters = 0usize;
    let mut hangul = 0usize;
    for c in text.chars().filter(|c| c.is_alphabetic()) {
        letters += 1;
        if is_hangul(c) {
            hangul += 1;
        }
    }
    if letters == 0 {
        0.0
    } else {
        hangul as f64 / letters as f64
    }
}

fn is_hangul(c: char) -> bool {
    matches!(c,
        '\u{AC00}'..='\u{D7A3}'   // syllables
        | '\u{1100}'..='\u{11FF}' // jamo
        | '\u{3131}'..='\u{318E}' // compatibility jamo
    )
}

pub fn decode(bytes: &[u8], labels: &[String], min_ratio: f64) -> Decoded {
    for label in labels {
        let Some(encoding) = Encoding::for_label(label.trim().as_bytes()) else {
            warn!("Unknown encoding label '{}' skipped", label);
            continue;
        };
        let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes)
        else {
            debug!("{} rejected: malformed input", encoding.name());
            continue;
        };
        let ratio = hangul_ratio(&text);
        if ratio >= min_ratio && ratio > 0.0 {
            return Decoded {
                text: strip_bom(text.into_owned()),
                encoding: encoding.name(),
                fallback: false,
            };
        }
        debug!("{} rejected: Hangul ratio {:.2}", encoding.name(), ratio);
    }

    let text = match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            warn!("No configured encoding fits; decoding as UTF-8 with replacement");
            String::from_utf8_lossy(bytes).into_owned()
        }
    };
    Decoded {
        text: strip_bom(text),
        encoding: encoding_rs::UTF_8.name(),
        fallback: true,
    }
}

fn strip_bom(text: String) -> String {
    match text.strip_prefix('\u{FEFF}') {
        Some(rest) => rest.to_string(),
        None => text,
    }
}
