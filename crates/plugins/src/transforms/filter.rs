//! Banned-word masking followed by a length limit.

/// Replacement for every banned-word occurrence.
pub const DEFAULT_MASK: &str = "***";

/// Appended after a truncated text.
pub const DEFAULT_TRUNCATION_SUFFIX: &str = "...[truncated]";

/// Passes over the text before a text whose masks keep forming new matches
/// is replaced by a single mask.
const MAX_PASSES: usize = 8;

/// Result of [`ContentFilter::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    pub text: String,
    pub masked: bool,
    pub truncated: bool,
}

impl FilterOutcome {
    pub fn modified(&self) -> bool {
        self.masked || self.truncated
    }
}

/// Masks banned substrings (case-sensitive) then enforces a maximum length
/// in characters. The suffix is not counted against the limit.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    banned: Vec<String>,
    max_chars: usize,
    mask: String,
    suffix: String,
}

impl ContentFilter {
    pub fn new(banned: impl IntoIterator<Item = impl Into<String>>, max_chars: usize) -> Self {
        Self {
            banned: banned
                .into_iter()
                .map(Into::into)
                .filter(|w: &String| !w.is_empty())
                .collect(),
            max_chars,
            mask: DEFAULT_MASK.to_string(),
            suffix: DEFAULT_TRUNCATION_SUFFIX.to_string(),
        }
    }

    #[must_use]
    pub fn with_mask(mut self, mask: impl Into<String>) -> Self {
        self.mask = mask.into();
        self
    }

    #[must_use]
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn apply(&self, text: &str) -> FilterOutcome {
        let (masked_text, masked) = self.mask_banned(text);
        // Masks and words differ in length, so the limit is checked after masking.
        match truncate_chars(&masked_text, self.max_chars) {
            Some(head) => FilterOutcome {
                text: self.attach_suffix(head),
                masked,
                truncated: true,
            },
            None => FilterOutcome {
                text: masked_text,
                masked,
                truncated: false,
            },
        }
    }

    /// `head` plus the (masked) suffix. The head loses trailing characters
    /// until no banned word spans the join.
    fn attach_suffix(&self, mut head: &str) -> String {
        let (suffix, _) = self.mask_banned(&self.suffix);
        loop {
            let joined = format!("{head}{suffix}");
            if head.is_empty() || !self.contains_banned(&joined) {
                return joined;
            }
            let last = head.char_indices().last().map_or(0, |(idx, _)| idx);
            head = &head[..last];
        }
    }

    /// Banned words that can still be masked; a word inside the mask never can.
    fn active_words(&self) -> impl Iterator<Item = &str> {
        self.banned
            .iter()
            .map(String::as_str)
            .filter(|word| !self.mask.contains(word))
    }

    fn contains_banned(&self, text: &str) -> bool {
        self.active_words().any(|word| text.contains(word))
    }

    fn mask_banned(&self, text: &str) -> (String, bool) {
        let mut current = text.to_string();
        for _ in 0..MAX_PASSES {
            if !self.contains_banned(&current) {
                break;
            }
            for word in self.active_words() {
                if current.contains(word) {
                    current = current.replace(word, &self.mask);
                }
            }
        }
        if self.contains_banned(&current) {
            // Masks keep forming new matches; a lone mask holds no active word.
            return (self.mask.clone(), true);
        }
        let masked = current != text;
        (current, masked)
    }
}

/// First `max` characters of `text`, or `None` when it already fits.
pub fn truncate_chars(text: &str, max: usize) -> Option<&str> {
    text.char_indices().nth(max).map(|(idx, _)| &text[..idx])
}
