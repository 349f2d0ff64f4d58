//! Conversion of text between named charsets.
//!
//! # Design
//! Both names are resolved through the charset table. Conversion decodes the
//! source strictly into a `String`, then encodes that into the target.
//! Decoding rejects malformed input so callers can keep the original bytes;
//! encoding is lossy-tolerant (unmappable characters become numeric
//! character references, as `encoding_rs` does for legacy encoders).
//!
//! `encoding_rs` has no UTF-16 encoder, so UTF-16 output is produced by
//! hand, without a byte order mark.

use std::borrow::Cow;

use encoding_rs::{UTF_16BE, UTF_16LE};

use crate::charset::{self, Codec};
use crate::error::TranscodeError;

fn resolve(name: &str) -> Result<Codec, TranscodeError> {
    charset::lookup(name).ok_or_else(|| TranscodeError::UnsupportedCharset(name.to_string()))
}

/// Decode `bytes` under `from` into a `String`.
pub fn decode(bytes: &[u8], from: &str) -> Result<String, TranscodeError> {
    decode_with(bytes, resolve(from)?)
}

/// Encode `text` into the charset named `to`.
pub fn encode(text: &str, to: &str) -> Result<Vec<u8>, TranscodeError> {
    Ok(encode_with(text, resolve(to)?))
}

/// Convert `bytes` from charset `from` to charset `to`.
///
/// Borrows the input unchanged when both names resolve to the same codec or
/// the input is empty.
pub fn transcode<'a>(bytes: &'a [u8], from: &str, to: &str) -> Result<Cow<'a, [u8]>, TranscodeError> {
    let source = resolve(from)?;
    let target = resolve(to)?;
    if source == target || bytes.is_empty() {
        return Ok(Cow::Borrowed(bytes));
    }
    let text = decode_with(bytes, source)?;
    Ok(Cow::Owned(encode_with(&text, target)))
}

/// Transcode `buffer` in place. On error the buffer is left untouched.
pub fn transcode_in_place(buffer: &mut Vec<u8>, from: &str, to: &str) -> Result<(), TranscodeError> {
    if let Cow::Owned(converted) = transcode(buffer, from, to)? {
        *buffer = converted;
    }
    Ok(())
}

fn decode_with(bytes: &[u8], codec: Codec) -> Result<String, TranscodeError> {
    let encoding = codec.encoding();
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(Cow::into_owned)
        .ok_or(TranscodeError::Malformed(encoding.name()))
}

fn encode_with(text: &str, codec: Codec) -> Vec<u8> {
    let encoding = codec.encoding();
    if encoding == UTF_16LE {
        return text.encode_utf16().flat_map(u16::to_le_bytes).collect();
    }
    if encoding == UTF_16BE {
        return text.encode_utf16().flat_map(u16::to_be_bytes).collect();
    }
    let (encoded, _, _) = encoding.encode(text);
    encoded.into_owned()
}
