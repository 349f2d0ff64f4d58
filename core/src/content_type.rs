//! MIME type classification and charset discovery.
//!
//! # Design
//! Works on raw header strings and raw body bytes so it can run before the
//! body has been decoded. Matching is ASCII case-insensitive. Charset names
//! are returned lower-cased so they can be fed straight into the charset
//! table.
//!
//! A charset declared in the Content-Type header always takes priority over
//! one sniffed from content, and sniffing only applies to HTML and XML.

/// Result of [`classify`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentClass {
    pub is_xml: bool,
    pub is_html: bool,
    pub is_text: bool,
}

const XML_PREFIXES: &[&str] = &[
    "text/xml",
    "application/xml",
    "application/xhtml",
    "application/rss+xml",
    "application/atom+xml",
];

const HTML_PREFIXES: &[&str] = &["text/html", "application/xhtml"];

const TEXT_PREFIXES: &[&str] = &[
    "text/",
    "application/json",
    "application/javascript",
    "application/x-javascript",
    "application/ecmascript",
    "application/x-www-form-urlencoded",
];

/// The media type part of a Content-Type value, without parameters.
pub fn media_type(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or("").trim()
}

pub fn classify(content_type: &str) -> ContentClass {
    let media = media_type(content_type).to_ascii_lowercase();
    let is_xml = XML_PREFIXES.iter().any(|p| media.starts_with(p)) || media.ends_with("+xml");
    let is_html = HTML_PREFIXES.iter().any(|p| media.starts_with(p));
    let is_text = is_xml || is_html || TEXT_PREFIXES.iter().any(|p| media.starts_with(p));
    ContentClass {
        is_xml,
        is_html,
        is_text,
    }
}

/// Parse the `charset=` parameter of a Content-Type value.
pub fn charset_from_header(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        normalize_charset(value.trim().trim_matches(|c| c == '"' || c == '\''))
    })
}

/// Replace or add the `charset=` parameter of a Content-Type value.
pub fn with_charset(content_type: &str, charset: &str) -> String {
    let param = format!("charset={charset}");
    let mut parts: Vec<&str> = content_type
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter(|p| {
            !p.split_once('=')
                .is_some_and(|(name, _)| name.trim().eq_ignore_ascii_case("charset"))
        })
        .collect();
    if parts.is_empty() {
        parts.push("text/plain");
    }
    parts.push(&param);
    parts.join("; ")
}

/// Sniff a charset declared inside an HTML or XML document.
///
/// Returns `None` for other content types or when nothing is declared.
pub fn charset_from_content(content_type: &str, content: &[u8]) -> Option<String> {
    let class = classify(content_type);
    if class.is_html {
        return html_meta_charset(content);
    }
    if class.is_xml {
        return xml_declared_encoding(content);
    }
    None
}

fn normalize_charset(value: &str) -> Option<String> {
    let valid = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'));
    valid.then(|| value.to_ascii_lowercase())
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// `<?xml version="1.0" encoding="X"?>`
fn xml_declared_encoding(content: &[u8]) -> Option<String> {
    let lower = content.to_ascii_lowercase();
    let start = find(&lower, b"<?xml", 0)?;
    let end = find(&lower, b"?>", start)?;
    let attrs = parse_attributes(&lower[start + b"<?xml".len()..end]);
    attrs
        .into_iter()
        .find(|(name, _)| name == "encoding")
        .and_then(|(_, value)| normalize_charset(&value))
}

/// Every `<meta charset>` wins over `<meta http-equiv="content-type">`,
/// each in document order.
fn html_meta_charset(content: &[u8]) -> Option<String> {
    let lower = content.to_ascii_lowercase();
    let metas = meta_tags(&lower);

    let direct = metas.iter().find_map(|attrs| {
        attrs
            .iter()
            .find(|(name, _)| name == "charset")
            .and_then(|(_, value)| normalize_charset(value))
    });
    if direct.is_some() {
        return direct;
    }

    metas.iter().find_map(|attrs| {
        let is_content_type = attrs
            .iter()
            .any(|(name, value)| name == "http-equiv" && value.trim() == "content-type");
        if !is_content_type {
            return None;
        }
        attrs
            .iter()
            .find(|(name, _)| name == "content")
            .and_then(|(_, value)| charset_from_header(value))
    })
}

type Attributes = Vec<(String, String)>;

fn meta_tags(lower: &[u8]) -> Vec<Attributes> {
    let mut tags = Vec::new();
    let mut pos = 0;
    while let Some(start) = find(lower, b"<meta", pos) {
        let body_start = start + b"<meta".len();
        let Some(&next) = lower.get(body_start) else {
            break;
        };
        let Some(end) = find(lower, b">", body_start) else {
            break;
        };
        if next.is_ascii_whitespace() || next == b'/' {
            tags.push(parse_attributes(&lower[body_start..end]));
        }
        pos = end;
    }
    tags
}

fn parse_attributes(tag: &[u8]) -> Attributes {
    let mut attrs = Vec::new();
    let mut i = 0;
    let n = tag.len();
    while i < n {
        while i < n && (tag[i].is_ascii_whitespace() || tag[i] == b'/') {
            i += 1;
        }
        let name_start = i;
        while i < n && !tag[i].is_ascii_whitespace() && !matches!(tag[i], b'=' | b'/') {
            i += 1;
        }
        let name = String::from_utf8_lossy(&tag[name_start..i]).into_owned();
        while i < n && tag[i].is_ascii_whitespace() {
            i += 1;
        }
        let mut value = String::new();
        if i < n && tag[i] == b'=' {
            i += 1;
            while i < n && tag[i].is_ascii_whitespace() {
                i += 1;
            }
            if i < n && (tag[i] == b'"' || tag[i] == b'\'') {
                let quote = tag[i];
                i += 1;
                let value_start = i;
                while i < n && tag[i] != quote {
                    i += 1;
                }
                value = String::from_utf8_lossy(&tag[value_start..i]).into_owned();
                i += 1;
            } else {
                let value_start = i;
                while i < n && !tag[i].is_ascii_whitespace() {
                    i += 1;
                }
                value = String::from_utf8_lossy(&tag[value_start..i]).into_owned();
            }
        }
        if !name.is_empty() {
            attrs.push((name, value));
        }
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_text_family() {
        assert!(classify("text/plain").is_text);
        assert!(classify("application/json; charset=utf-8").is_text);
        assert!(classify("Application/JavaScript").is_text);
        assert!(classify("application/x-www-form-urlencoded").is_text);
        assert!(!classify("application/octet-stream").is_text);
        assert!(!classify("image/png").is_text);
        assert_eq!(classify(""), ContentClass::default());
    }

    #[test]
    fn classify_xml_and_html() {
        let svg = classify("image/svg+xml");
        assert!(svg.is_xml && svg.is_text && !svg.is_html);

        let xhtml = classify("application/xhtml+xml");
        assert!(xhtml.is_xml && xhtml.is_html && xhtml.is_text);

        let html = classify("TEXT/HTML; charset=utf-8");
        assert!(html.is_html && !html.is_xml);

        assert!(classify("application/rss+xml").is_xml);
    }

    #[test]
    fn charset_from_header_variants() {
        assert_eq!(
            charset_from_header("text/html; charset=ISO-8859-1").as_deref(),
            Some("iso-8859-1")
        );
        assert_eq!(
            charset_from_header("text/plain;Charset=\"UTF-8\"").as_deref(),
            Some("utf-8")
        );
        assert_eq!(
            charset_from_header("text/plain; format=flowed; charset=koi8-r").as_deref(),
            Some("koi8-r")
        );
        assert_eq!(charset_from_header("text/plain"), None);
        assert_eq!(charset_from_header("text/plain; charset="), None);
    }

    #[test]
    fn with_charset_appends_or_replaces() {
        assert_eq!(with_charset("text/plain", "UTF-8"), "text/plain; charset=UTF-8");
        assert_eq!(
            with_charset("text/plain; charset=latin1; format=flowed", "UTF-8"),
            "text/plain; format=flowed; charset=UTF-8"
        );
    }

    #[test]
    fn sniff_html_meta_charset() {
        let page = b"<html><head><META Charset=\"ISO-8859-1\"></head></html>";
        assert_eq!(
            charset_from_content("text/html", page).as_deref(),
            Some("iso-8859-1")
        );
    }

    #[test]
    fn sniff_html_prefers_meta_charset_over_http_equiv() {
        let page = br#"<head>
            <meta http-equiv="Content-Type" content="text/html; charset=windows-1251">
            <meta charset="koi8-r">
        </head>"#;
        assert_eq!(
            charset_from_content("text/html", page).as_deref(),
            Some("koi8-r")
        );
    }

    #[test]
    fn sniff_html_http_equiv() {
        let page = br#"<meta name="viewport" content="width=device-width">
            <meta http-equiv="content-type" content="text/html;charset=Shift_JIS">"#;
        assert_eq!(
            charset_from_content("text/html", page).as_deref(),
            Some("shift_jis")
        );
    }

    #[test]
    fn sniff_html_without_declaration() {
        let page = b"<html><metadata>nothing</metadata></html>";
        assert_eq!(charset_from_content("text/html", page), None);
    }

    #[test]
    fn sniff_xml_declaration() {
        let doc = b"<?xml version='1.0' encoding='EUC-JP'?><rss/>";
        assert_eq!(
            charset_from_content("application/rss+xml", doc).as_deref(),
            Some("euc-jp")
        );
        let doc = b"<?xml version=\"1.0\"?><rss/>";
        assert_eq!(charset_from_content("text/xml", doc), None);
    }

    #[test]
    fn sniff_skips_non_markup() {
        let body = b"<meta charset=\"koi8-r\">";
        assert_eq!(charset_from_content("text/plain", body), None);
    }
}
