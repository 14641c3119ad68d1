//! Glob-style key patterns.
//!
//! | glob  | matches                          |
//! |-------|----------------------------------|
//! | `*`   | any run of characters except `/` |
//! | `?`   | one character except `/`         |
//! | `**`  | anything, `/` included           |
//! | `**/` | zero or more whole segments      |

use std::fmt;

use regex::Regex;

use crate::{Error, Result};

/// A compiled glob matched against whole keys.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    regex: Regex,
    literal_len: usize,
}

impl KeyPattern {
    /// # Errors
    ///
    /// `InvalidPattern` for an empty pattern.
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern is empty".to_string(),
            });
        }

        let mut re = String::with_capacity(pattern.len() * 2 + 2);
        re.push('^');
        let mut literal_len = 0;
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                }
                '*' => re.push_str("[^/]*"),
                '?' => re.push_str("[^/]"),
                other => {
                    literal_len += 1;
                    re.push_str(&regex::escape(other.encode_utf8(&mut [0; 4])));
                }
            }
        }
        re.push('$');

        let regex = Regex::new(&re).map_err(|e| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
            literal_len,
        })
    }

    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Literal characters in the pattern; more means more specific.
    #[must_use]
    pub const fn specificity(&self) -> usize {
        self.literal_len
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for KeyPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for KeyPattern {}
