//! Process-wide table of supported charset names.
//!
//! # Design
//! The table maps lower-cased IANA names and common aliases to an
//! `encoding_rs` codec. It is immutable and built exactly once. Hosts call
//! [`init`] during start-up so construction cost is paid up front; lookups
//! made before that still succeed and build the table on first use.
//!
//! A name missing from the table is unsupported. Lookups never fall back to
//! a default codec.

use std::collections::HashMap;
use std::fmt;

use encoding_rs::{
    Encoding, BIG5, EUC_JP, EUC_KR, GB18030, GBK, IBM866, ISO_2022_JP, ISO_8859_10,
    ISO_8859_13, ISO_8859_14, ISO_8859_15, ISO_8859_16, ISO_8859_2, ISO_8859_3, ISO_8859_4,
    ISO_8859_5, ISO_8859_6, ISO_8859_7, ISO_8859_8, KOI8_R, KOI8_U, MACINTOSH, SHIFT_JIS,
    UTF_16BE, UTF_16LE, UTF_8, WINDOWS_1250, WINDOWS_1251, WINDOWS_1252, WINDOWS_1253,
    WINDOWS_1254, WINDOWS_1255, WINDOWS_1256, WINDOWS_1257, WINDOWS_1258, WINDOWS_874,
};
use once_cell::sync::Lazy;

/// A transcoding-capable codec resolved from a charset name.
///
/// Two names resolve to the same `Codec` exactly when they share the
/// underlying encoding.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Codec(&'static Encoding);

impl Codec {
    pub fn encoding(self) -> &'static Encoding {
        self.0
    }

    /// Canonical WHATWG name of the codec, e.g. `windows-1252`.
    pub fn name(self) -> &'static str {
        self.0.name()
    }

    pub fn is_utf8(self) -> bool {
        self.0 == UTF_8
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Codec({})", self.name())
    }
}

fn aliases() -> Vec<(&'static str, &'static Encoding)> {
    vec![
        // ASCII and Latin-1 decode as windows-1252, a strict superset.
        ("ansi_x3.4-1968", WINDOWS_1252),
        ("ansi_x3.4-1986", WINDOWS_1252),
        ("ascii", WINDOWS_1252),
        ("cp367", WINDOWS_1252),
        ("cp819", WINDOWS_1252),
        ("csascii", WINDOWS_1252),
        ("ibm367", WINDOWS_1252),
        ("ibm819", WINDOWS_1252),
        ("iso-8859-1", WINDOWS_1252),
        ("iso-ir-100", WINDOWS_1252),
        ("iso-ir-6", WINDOWS_1252),
        ("iso646-us", WINDOWS_1252),
        ("iso8859-1", WINDOWS_1252),
        ("iso_646.irv:1991", WINDOWS_1252),
        ("iso_8859-1", WINDOWS_1252),
        ("iso_8859-1:1987", WINDOWS_1252),
        ("l1", WINDOWS_1252),
        ("latin1", WINDOWS_1252),
        ("us", WINDOWS_1252),
        ("us-ascii", WINDOWS_1252),
        ("windows-1252", WINDOWS_1252),
        ("x-cp1252", WINDOWS_1252),
        // Chinese
        ("big5", BIG5),
        ("csbig5", BIG5),
        ("x-x-big5", BIG5),
        ("chinese", GBK),
        ("csgb2312", GBK),
        ("csiso58gb231280", GBK),
        ("gb2312", GBK),
        ("gb_2312-80", GBK),
        ("gbk", GBK),
        ("hz-gb-2312", GBK),
        ("iso-ir-58", GBK),
        ("gb18030", GB18030),
        // Korean
        ("cseuckr", EUC_KR),
        ("csksc56011987", EUC_KR),
        ("euc-kr", EUC_KR),
        ("iso-ir-149", EUC_KR),
        ("korean", EUC_KR),
        ("ks-c-5601", EUC_KR),
        ("ks-c-5601-1987", EUC_KR),
        ("ks_c_5601", EUC_KR),
        ("ks_c_5601-1987", EUC_KR),
        ("ks_c_5601-1989", EUC_KR),
        ("ksc-5601", EUC_KR),
        ("ksc5601", EUC_KR),
        ("ksc_5601", EUC_KR),
        // Japanese
        ("cseucpkdfmtjapanese", EUC_JP),
        ("euc-jp", EUC_JP),
        ("x-euc", EUC_JP),
        ("x-euc-jp", EUC_JP),
        ("csiso2022jp", ISO_2022_JP),
        ("iso-2022-jp", ISO_2022_JP),
        ("csshiftjis", SHIFT_JIS),
        ("ms_kanji", SHIFT_JIS),
        ("shift-jis", SHIFT_JIS),
        ("shift_jis", SHIFT_JIS),
        ("sjis", SHIFT_JIS),
        ("windows-31j", SHIFT_JIS),
        ("x-sjis", SHIFT_JIS),
        // ISO-8859 family
        ("csisolatin2", ISO_8859_2),
        ("iso-8859-2", ISO_8859_2),
        ("iso-ir-101", ISO_8859_2),
        ("iso8859-2", ISO_8859_2),
        ("iso_8859-2", ISO_8859_2),
        ("iso_8859-2:1987", ISO_8859_2),
        ("l2", ISO_8859_2),
        ("latin2", ISO_8859_2),
        ("iso-8859-3", ISO_8859_3),
        ("latin3", ISO_8859_3),
        ("iso-8859-4", ISO_8859_4),
        ("latin4", ISO_8859_4),
        ("cyrillic", ISO_8859_5),
        ("iso-8859-5", ISO_8859_5),
        ("arabic", ISO_8859_6),
        ("iso-8859-6", ISO_8859_6),
        ("greek", ISO_8859_7),
        ("iso-8859-7", ISO_8859_7),
        ("csisolatinhebrew", ISO_8859_8),
        ("hebrew", ISO_8859_8),
        ("iso-8859-8", ISO_8859_8),
        ("iso-ir-138", ISO_8859_8),
        ("iso_8859-8", ISO_8859_8),
        ("iso_8859-8:1988", ISO_8859_8),
        ("iso-8859-9", WINDOWS_1254),
        ("latin5", WINDOWS_1254),
        ("iso-8859-10", ISO_8859_10),
        ("iso-8859-11", WINDOWS_874),
        ("iso-8859-13", ISO_8859_13),
        ("iso-8859-14", ISO_8859_14),
        ("iso-8859-15", ISO_8859_15),
        ("latin-9", ISO_8859_15),
        ("iso-8859-16", ISO_8859_16),
        // Cyrillic
        ("cskoi8r", KOI8_R),
        ("koi8-r", KOI8_R),
        ("koi8-u", KOI8_U),
        ("ibm866", IBM866),
        ("cp866", IBM866),
        // Thai
        ("tis-620", WINDOWS_874),
        ("windows-874", WINDOWS_874),
        // Windows code pages
        ("windows-1250", WINDOWS_1250),
        ("x-cp1250", WINDOWS_1250),
        ("windows-1251", WINDOWS_1251),
        ("x-cp1251", WINDOWS_1251),
        ("windows-1253", WINDOWS_1253),
        ("windows-1254", WINDOWS_1254),
        ("windows-1255", WINDOWS_1255),
        ("windows-1256", WINDOWS_1256),
        ("windows-1257", WINDOWS_1257),
        ("windows-1258", WINDOWS_1258),
        ("macintosh", MACINTOSH),
        // Unicode
        ("unicode-1-1-utf-8", UTF_8),
        ("utf-8", UTF_8),
        ("utf8", UTF_8),
        ("utf-16", UTF_16LE),
        ("utf-16le", UTF_16LE),
        ("utf-16be", UTF_16BE),
    ]
}

/// Immutable charset-name to codec map.
#[derive(Debug)]
pub struct CharsetTable {
    codecs: HashMap<&'static str, Codec>,
}

static TABLE: Lazy<CharsetTable> = Lazy::new(CharsetTable::build);

/// Build the process-wide table. Idempotent and thread-safe.
pub fn init() {
    Lazy::force(&TABLE);
}

impl CharsetTable {
    fn build() -> Self {
        let codecs = aliases()
            .into_iter()
            .map(|(name, encoding)| (name, Codec(encoding)))
            .collect();
        Self { codecs }
    }

    /// The process-wide table.
    pub fn global() -> &'static CharsetTable {
        &TABLE
    }

    /// Look up `name` ignoring ASCII case and surrounding whitespace.
    pub fn lookup(&self, name: &str) -> Option<Codec> {
        let name = name.trim();
        if let Some(codec) = self.codecs.get(name) {
            return Some(*codec);
        }
        self.codecs.get(name.to_ascii_lowercase().as_str()).copied()
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

/// Shorthand for `CharsetTable::global().lookup(name)`.
pub fn lookup(name: &str) -> Option<Codec> {
    CharsetTable::global().lookup(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case_and_whitespace() {
        let table = CharsetTable::global();
        let a = table.lookup("ISO-8859-1").unwrap();
        let b = table.lookup("  iso-8859-1 ").unwrap();
        let c = table.lookup("Latin1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.name(), "windows-1252");
    }

    #[test]
    fn lookup_is_stable() {
        for (name, _) in aliases() {
            let first = lookup(name);
            let second = lookup(name);
            assert!(first.is_some(), "{name} should be supported");
            assert_eq!(first, second);
        }
    }

    #[test]
    fn unsupported_names_never_fall_back() {
        init();
        assert!(lookup("utf-7").is_none());
        assert!(lookup("ibm852").is_none());
        assert!(lookup("").is_none());
        assert!(lookup("definitely-not-a-charset").is_none());
    }

    #[test]
    fn aliases_share_a_codec() {
        assert_eq!(lookup("shift_jis"), lookup("x-sjis"));
        assert_eq!(lookup("gb2312"), lookup("GBK"));
        assert_ne!(lookup("utf-16le"), lookup("utf-16be"));
        assert!(lookup("UTF8").unwrap().is_utf8());
    }

    #[test]
    fn every_alias_is_lower_case() {
        for (name, _) in aliases() {
            assert_eq!(name, name.to_ascii_lowercase());
        }
        assert_eq!(CharsetTable::global().len(), aliases().len());
    }
}
