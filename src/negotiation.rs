//! Content negotiation over `Accept`, `Accept-Charset` and `Range`.

/// One entry of an `Accept-Charset` header, normalized to lowercase.
#[derive(Debug, Clone, PartialEq)]
pub struct CharsetPreference {
    pub name: String,
    pub q: f32,
    explicit_q: bool,
}

/// Parse an `Accept-Charset` header into preferences ordered by descending q.
///
/// An absent header means `utf-8` is acceptable. An entry with an explicit
/// `q` outranks one with an implied q of the same value; otherwise entries of
/// equal rank keep their relative input order. `q=0` entries stay in the
/// list: the original service treated them as acceptable and that behavior
/// is load-bearing for existing clients, RFC 7231 notwithstanding.
pub fn parse_accept_charset(header: Option<&str>) -> Vec<CharsetPreference> {
    let Some(header) = header else {
        return vec![CharsetPreference {
            name: "utf-8".to_string(),
            q: 1.0,
            explicit_q: false,
        }];
    };
    let mut preferences: Vec<CharsetPreference> = header
        .split(',')
        .filter_map(parse_charset_entry)
        .collect();
    if preferences.is_empty() {
        preferences.push(CharsetPreference {
            name: "utf-8".to_string(),
            q: 1.0,
            explicit_q: false,
        });
    }
    preferences.sort_by(|a, b| {
        b.q.partial_cmp(&a.q)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.explicit_q.cmp(&a.explicit_q))
    });
    preferences
}

fn parse_charset_entry(entry: &str) -> Option<CharsetPreference> {
    let mut parts = entry.split(';');
    let name = parts.next()?.trim().to_lowercase();
    if name.is_empty() {
        return None;
    }
    let mut q = 1.0;
    let mut explicit_q = false;
    for param in parts {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case("q") {
                if let Ok(parsed) = value.trim().parse::<f32>() {
                    q = parsed;
                    explicit_q = true;
                }
            }
        }
    }
    Some(CharsetPreference {
        name,
        q,
        explicit_q,
    })
}

/// Select the best charset out of `available`.
///
/// Walks the parsed preferences in order and returns the first one present
/// in `available` (case-insensitive). A `*` entry matches the first
/// available charset.
pub fn negotiate_charset(header: Option<&str>, available: &[&str]) -> Option<String> {
    for preference in parse_accept_charset(header) {
        if preference.name == "*" {
            return available.first().map(|s| s.to_string());
        }
        if let Some(found) = available
            .iter()
            .find(|a| a.eq_ignore_ascii_case(&preference.name))
        {
            return Some(found.to_string());
        }
    }
    None
}

/// One media range of an `Accept` header.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRange {
    pub type_: String,
    pub subtype: String,
    pub parameters: Vec<(String, String)>,
    pub q: f32,
}

impl MediaRange {
    pub fn matches(&self, media_type: &str) -> bool {
        let (type_, subtype) = media_type.split_once('/').unwrap_or((media_type, ""));
        (self.type_ == "*" || self.type_.eq_ignore_ascii_case(type_))
            && (self.subtype == "*" || self.subtype.eq_ignore_ascii_case(subtype))
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse an `Accept` header into media ranges ordered by descending q.
/// An absent header accepts anything.
pub fn parse_accept(header: Option<&str>) -> Vec<MediaRange> {
    let Some(header) = header else {
        return vec![MediaRange {
            type_: "*".to_string(),
            subtype: "*".to_string(),
            parameters: Vec::new(),
            q: 1.0,
        }];
    };
    let mut ranges: Vec<MediaRange> = header.split(',').filter_map(parse_media_range).collect();
    ranges.sort_by(|a, b| b.q.partial_cmp(&a.q).unwrap_or(std::cmp::Ordering::Equal));
    ranges
}

fn parse_media_range(entry: &str) -> Option<MediaRange> {
    let mut parts = entry.split(';');
    let full_type = parts.next()?.trim().to_lowercase();
    if full_type.is_empty() {
        return None;
    }
    let (type_, subtype) = full_type.split_once('/').unwrap_or((full_type.as_str(), "*"));
    let mut parameters = Vec::new();
    let mut q = 1.0;
    for param in parts {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim().trim_matches('"').to_string();
        if key == "q" {
            if let Ok(parsed) = value.parse::<f32>() {
                q = parsed;
            }
        } else {
            parameters.push((key, value));
        }
    }
    Some(MediaRange {
        type_: type_.to_string(),
        subtype: subtype.to_string(),
        parameters,
        q,
    })
}

/// Pick the best of `offered` for the request's `Accept` header, or `None`
/// when nothing offered is acceptable.
pub fn negotiate_media_type(header: Option<&str>, offered: &[&str]) -> Option<String> {
    for range in parse_accept(header) {
        if let Some(found) = offered.iter().find(|o| range.matches(o)) {
            return Some(found.to_string());
        }
    }
    None
}

/// A half-open byte range request; `end` is inclusive and `u64::MAX` means
/// "to the end of the object".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

/// Parse a `Range` header value. Only `bytes=start-end` and `bytes=start-`
/// are recognized; everything else is `None`.
pub fn parse_range(header: &str) -> Option<ByteRange> {
    let spec = header.trim();
    if spec.len() < 6 || !spec[..6].eq_ignore_ascii_case("bytes=") {
        return None;
    }
    let rest = &spec[6..];
    let (start, end) = rest.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end = end.trim();
    let end: u64 = if end.is_empty() {
        u64::MAX
    } else {
        end.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some(ByteRange { start, end })
}
