//! Leading timestamp markers that can be re-applied without piling up.
//!
//! Patterns use the familiar `yyyy-MM-dd HH:mm:ss` notation. One pattern
//! compiles to both a formatter and a regex that recognizes anything the
//! formatter could have produced.

use {
    chrono::{DateTime, Local},
    regex::Regex,
};

use crate::error::{Error, Result};

/// Pattern tokens, longest first so `yyyy` wins over `yy`.
const TOKENS: &[(&str, &str, &str)] = &[
    ("yyyy", "%Y", r"\d{4}"),
    ("fff", "%3f", r"\d{3}"),
    ("yy", "%y", r"\d{2}"),
    ("MM", "%m", r"\d{2}"),
    ("dd", "%d", r"\d{2}"),
    ("HH", "%H", r"\d{2}"),
    ("hh", "%I", r"\d{2}"),
    ("mm", "%M", r"\d{2}"),
    ("ss", "%S", r"\d{2}"),
];

/// A compiled timestamp pattern.
#[derive(Debug, Clone)]
pub struct TimestampFormat {
    pattern: String,
    strftime: String,
    matcher: Regex,
}

impl TimestampFormat {
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut strftime = String::new();
        let mut source = String::new();
        let mut fields = 0;
        let mut rest = pattern;

        'outer: while !rest.is_empty() {
            for (token, fmt, re) in TOKENS {
                if let Some(after) = rest.strip_prefix(token) {
                    strftime.push_str(fmt);
                    source.push_str(re);
                    fields += 1;
                    rest = after;
                    continue 'outer;
                }
            }
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                if c == '%' {
                    strftime.push_str("%%");
                } else {
                    strftime.push(c);
                }
                source.push_str(&regex::escape(c.encode_utf8(&mut [0; 4])));
            }
            rest = chars.as_str();
        }

        if fields == 0 {
            return Err(Error::invalid_time_format(
                pattern,
                "contains no date or time fields",
            ));
        }

        Ok(Self {
            pattern: pattern.to_string(),
            strftime,
            matcher: Regex::new(&source)?,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn format(&self, at: DateTime<Local>) -> String {
        at.format(&self.strftime).to_string()
    }

    /// Whether `text` holds at least one marker.
    pub fn is_match(&self, text: &str) -> bool {
        self.matcher.is_match(text)
    }

    pub fn starts_with_marker(&self, text: &str) -> bool {
        self.matcher.find(text).is_some_and(|m| m.start() == 0)
    }

    /// `text` with every marker removed, wherever it sits.
    pub fn strip(&self, text: &str) -> String {
        self.matcher.replace_all(text, "").into_owned()
    }

    /// Exactly one fresh leading marker followed by the stripped text.
    pub fn normalize(&self, text: &str, at: DateTime<Local>) -> String {
        format!("{}{}", self.format(at), self.strip(text))
    }

    /// When `text` holds more than one marker, keep only the first one and
    /// move it to the front. `None` when there is nothing to collapse.
    pub fn collapse_duplicates(&self, text: &str) -> Option<String> {
        let mut found = self.matcher.find_iter(text);
        let first = found.next()?;
        found.next()?;
        Some(format!("{}{}", first.as_str(), self.strip(text)))
    }
}
