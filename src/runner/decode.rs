//! Ordered decoder chain for script output.
//!
//! Each raw line is tried against the configured decoders in order; the
//! chain always ends with lossy UTF-8, so decoding never fails.

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decoder {
    /// Strict UTF-8.
    Utf8,
    /// ISO-8859-1. Rejects the C1 control range, which in practice means the
    /// bytes were some other encoding.
    Latin1,
    /// UTF-8 with replacement characters.
    Lossy,
}

impl Decoder {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Decoder::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" => Some(Decoder::Latin1),
            "lossy" => Some(Decoder::Lossy),
            _ => None,
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            Decoder::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_owned),
            Decoder::Latin1 => {
                if bytes.iter().any(|b| (0x80..=0x9f).contains(b)) {
                    None
                } else {
                    Some(bytes.iter().map(|&b| char::from(b)).collect())
                }
            }
            Decoder::Lossy => Some(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}

/// A decoded line and the decoder that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    pub decoder: Decoder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderChain {
    decoders: Vec<Decoder>,
}

impl DecoderChain {
    pub fn from_names(names: &[String]) -> Result<Self> {
        let mut decoders = Vec::with_capacity(names.len() + 1);
        for name in names {
            let decoder = Decoder::from_name(name)
                .ok_or_else(|| anyhow::anyhow!("unknown encoding '{}'", name))?;
            if !decoders.contains(&decoder) {
                decoders.push(decoder);
            }
        }
        // Lossy must be last, and nothing after it would ever run.
        decoders.retain(|d| *d != Decoder::Lossy);
        decoders.push(Decoder::Lossy);
        Ok(Self { decoders })
    }

    pub fn decoders(&self) -> &[Decoder] {
        &self.decoders
    }

    /// Decode one raw line, stripping the trailing line terminator.
    pub fn decode_line(&self, raw: &[u8]) -> Decoded {
        let mut end = raw.len();
        while end > 0 && matches!(raw[end - 1], b'\n' | b'\r') {
            end -= 1;
        }
        let bytes = &raw[..end];

        for decoder in &self.decoders {
            if let Some(text) = decoder.decode(bytes) {
                return Decoded {
                    text,
                    decoder: *decoder,
                };
            }
        }
        Decoded {
            text: String::from_utf8_lossy(bytes).into_owned(),
            decoder: Decoder::Lossy,
        }
    }
}

impl Default for DecoderChain {
    fn default() -> Self {
        Self {
            decoders: vec![Decoder::Utf8, Decoder::Latin1, Decoder::Lossy],
        }
    }
}
