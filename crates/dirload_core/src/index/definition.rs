//! Attribute index configuration and key extraction.

use crate::index::{IndexKey, IndexKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Entry limit used when none is configured.
pub const DEFAULT_ENTRY_LIMIT: usize = 4000;

/// Substring length used when none is configured.
const DEFAULT_SUBSTRING_LENGTH: usize = 6;

const PRESENCE_KEY: &[u8] = b"+";

/// Extensible matching rules an attribute index can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExtensibleRule {
    /// Case-sensitive equality.
    CaseExactMatch,
    /// Case-sensitive substrings.
    CaseExactSubstringsMatch,
    /// Case-insensitive equality.
    CaseIgnoreMatch,
    /// Case-insensitive substrings.
    CaseIgnoreSubstringsMatch,
}

impl ExtensibleRule {
    /// Returns the rule name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ExtensibleRule::CaseExactMatch => "caseExactMatch",
            ExtensibleRule::CaseExactSubstringsMatch => "caseExactSubstringsMatch",
            ExtensibleRule::CaseIgnoreMatch => "caseIgnoreMatch",
            ExtensibleRule::CaseIgnoreSubstringsMatch => "caseIgnoreSubstringsMatch",
        }
    }

    /// Returns true for rules whose keys go to the extensible substring stream.
    #[must_use]
    pub const fn is_substring(self) -> bool {
        matches!(
            self,
            ExtensibleRule::CaseExactSubstringsMatch | ExtensibleRule::CaseIgnoreSubstringsMatch
        )
    }

    const fn tag(self) -> u8 {
        match self {
            ExtensibleRule::CaseExactMatch => 1,
            ExtensibleRule::CaseExactSubstringsMatch => 2,
            ExtensibleRule::CaseIgnoreMatch => 3,
            ExtensibleRule::CaseIgnoreSubstringsMatch => 4,
        }
    }

    fn normalize(self, value: &str) -> String {
        let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
        match self {
            ExtensibleRule::CaseExactMatch | ExtensibleRule::CaseExactSubstringsMatch => collapsed,
            ExtensibleRule::CaseIgnoreMatch | ExtensibleRule::CaseIgnoreSubstringsMatch => {
                collapsed.to_lowercase()
            }
        }
    }
}

/// Configuration of the indexes of one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeIndexConfig {
    /// Lower-cased attribute type.
    pub attribute: String,
    /// Configured kinds. Extensible kinds are implied by `extensible_rules`.
    pub kinds: BTreeSet<IndexKind>,
    /// Maximum IDs tracked per key; zero means unlimited.
    pub entry_limit: usize,
    /// Keep counts for keys above the limit.
    pub maintain_count: bool,
    /// Length of substring keys.
    pub substring_length: usize,
    /// Extensible matching rules.
    pub extensible_rules: BTreeSet<ExtensibleRule>,
}

impl AttributeIndexConfig {
    /// Creates a configuration for `attribute` with no kinds.
    #[must_use]
    pub fn new(attribute: &str) -> Self {
        Self {
            attribute: attribute.to_ascii_lowercase(),
            kinds: BTreeSet::new(),
            entry_limit: DEFAULT_ENTRY_LIMIT,
            maintain_count: false,
            substring_length: DEFAULT_SUBSTRING_LENGTH,
            extensible_rules: BTreeSet::new(),
        }
    }

    /// Adds an index kind.
    #[must_use]
    pub fn with_kind(mut self, kind: IndexKind) -> Self {
        if !kind.is_extensible() && kind != IndexKind::Dn2Id {
            self.kinds.insert(kind);
        }
        self
    }

    /// Adds an extensible matching rule.
    #[must_use]
    pub fn with_extensible_rule(mut self, rule: ExtensibleRule) -> Self {
        self.extensible_rules.insert(rule);
        self
    }

    /// Sets the entry limit.
    #[must_use]
    pub const fn entry_limit(mut self, limit: usize) -> Self {
        self.entry_limit = limit;
        self
    }

    /// Sets whether counts are maintained above the limit.
    #[must_use]
    pub const fn maintain_count(mut self, value: bool) -> Self {
        self.maintain_count = value;
        self
    }

    /// Sets the substring key length.
    #[must_use]
    pub const fn substring_length(mut self, length: usize) -> Self {
        self.substring_length = length;
        self
    }

    /// Returns every stream kind this attribute produces keys for.
    #[must_use]
    pub fn stream_kinds(&self) -> Vec<IndexKind> {
        let mut kinds: Vec<IndexKind> = self.kinds.iter().copied().collect();
        if self.extensible_rules.iter().any(|rule| rule.is_substring()) {
            kinds.push(IndexKind::ExtensibleSubstring);
        }
        if self.extensible_rules.iter().any(|rule| !rule.is_substring()) {
            kinds.push(IndexKind::ExtensibleShared);
        }
        kinds
    }

    /// Returns the stream key of `kind` for this attribute.
    #[must_use]
    pub fn index_key(&self, kind: IndexKind) -> IndexKey {
        IndexKey::new(&self.attribute, kind, self.entry_limit, self.maintain_count)
    }

    /// Number of indexes counted against the memory budget.
    ///
    /// Each substring extensible rule counts on its own and all extensible
    /// rules together share one more index.
    #[must_use]
    pub fn planned_index_count(&self) -> usize {
        let substring_rules = self
            .extensible_rules
            .iter()
            .filter(|rule| rule.is_substring())
            .count();
        let shared = usize::from(!self.extensible_rules.is_empty());
        self.kinds.len() + substring_rules + shared
    }

    /// Extracts the keys `values` produce for the `kind` stream.
    pub fn extract_keys(&self, kind: IndexKind, values: &[String], keys: &mut BTreeSet<Vec<u8>>) {
        if values.is_empty() {
            return;
        }
        match kind {
            IndexKind::Dn2Id => {}
            IndexKind::Presence => {
                keys.insert(PRESENCE_KEY.to_vec());
            }
            IndexKind::Equality => {
                for value in values {
                    keys.insert(normalize(value).into_bytes());
                }
            }
            IndexKind::Ordering => {
                for value in values {
                    keys.insert(ordering_key(&normalize(value)));
                }
            }
            IndexKind::Substring => {
                for value in values {
                    substring_keys(&normalize(value), self.substring_length, None, keys);
                }
            }
            IndexKind::Approximate => {
                for value in values {
                    if let Some(code) = phonetic_code(value) {
                        keys.insert(code.into_bytes());
                    }
                }
            }
            IndexKind::ExtensibleSubstring => {
                for rule in self.extensible_rules.iter().filter(|r| r.is_substring()) {
                    for value in values {
                        let normalized = rule.normalize(value);
                        substring_keys(&normalized, self.substring_length, Some(rule.tag()), keys);
                    }
                }
            }
            IndexKind::ExtensibleShared => {
                for rule in self.extensible_rules.iter().filter(|r| !r.is_substring()) {
                    for value in values {
                        let mut key = vec![rule.tag()];
                        key.extend_from_slice(rule.normalize(value).as_bytes());
                        keys.insert(key);
                    }
                }
            }
        }
    }
}

fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Non-negative integers get a length prefix so byte order is numeric order.
fn ordering_key(normalized: &str) -> Vec<u8> {
    if !normalized.is_empty() && normalized.bytes().all(|b| b.is_ascii_digit()) {
        let digits = normalized.trim_start_matches('0');
        let digits = if digits.is_empty() { "0" } else { digits };
        if digits.len() <= usize::from(u8::MAX) {
            let mut key = Vec::with_capacity(digits.len() + 2);
            key.push(0x00);
            key.push(digits.len() as u8);
            key.extend_from_slice(digits.as_bytes());
            return key;
        }
    }
    normalized.as_bytes().to_vec()
}

fn substring_keys(value: &str, length: usize, tag: Option<u8>, keys: &mut BTreeSet<Vec<u8>>) {
    let chars: Vec<char> = value.chars().collect();
    let length = length.max(1);
    for start in 0..chars.len() {
        let end = (start + length).min(chars.len());
        let mut key = Vec::new();
        if let Some(tag) = tag {
            key.push(tag);
        }
        key.extend(chars[start..end].iter().collect::<String>().into_bytes());
        keys.insert(key);
    }
}

/// Soundex-style code of the letters in `value`.
fn phonetic_code(value: &str) -> Option<String> {
    let mut letters = value
        .chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase());
    let first = letters.next()?;
    let digit = |c: char| match c {
        'B' | 'F' | 'P' | 'V' => Some('1'),
        'C' | 'G' | 'J' | 'K' | 'Q' | 'S' | 'X' | 'Z' => Some('2'),
        'D' | 'T' => Some('3'),
        'L' => Some('4'),
        'M' | 'N' => Some('5'),
        'R' => Some('6'),
        _ => None,
    };

    let mut code = String::with_capacity(4);
    code.push(first);
    let mut last = digit(first);
    for c in letters {
        if code.len() == 4 {
            break;
        }
        let current = digit(c);
        if let Some(d) = current {
            if current != last {
                code.push(d);
            }
        }
        if c != 'H' && c != 'W' {
            last = current;
        }
    }
    while code.len() < 4 {
        code.push('0');
    }
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(config: &AttributeIndexConfig, kind: IndexKind, values: &[&str]) -> Vec<Vec<u8>> {
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        let mut out = BTreeSet::new();
        config.extract_keys(kind, &values, &mut out);
        out.into_iter().collect()
    }

    #[test]
    fn equality_and_presence() {
        let config = AttributeIndexConfig::new("cn")
            .with_kind(IndexKind::Equality)
            .with_kind(IndexKind::Presence);
        assert_eq!(keys(&config, IndexKind::Equality, &["Bob  Smith"]), vec![b"bob smith".to_vec()]);
        assert_eq!(keys(&config, IndexKind::Presence, &["a", "b"]), vec![b"+".to_vec()]);
        assert!(keys(&config, IndexKind::Presence, &[]).is_empty());
    }

    #[test]
    fn substring_keys_cover_every_suffix() {
        let config = AttributeIndexConfig::new("cn").substring_length(3);
        let extracted = keys(&config, IndexKind::Substring, &["Abcd"]);
        let expected: Vec<Vec<u8>> = ["abc", "bcd", "cd", "d"]
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        assert_eq!(extracted, expected);
    }

    #[test]
    fn ordering_keys_sort_numbers_numerically() {
        let config = AttributeIndexConfig::new("uidnumber");
        let nine = keys(&config, IndexKind::Ordering, &["9"]);
        let ten = keys(&config, IndexKind::Ordering, &["010"]);
        assert!(nine[0] < ten[0]);
        assert_eq!(keys(&config, IndexKind::Ordering, &["Zeta"]), vec![b"zeta".to_vec()]);
    }

    #[test]
    fn approximate_keys_match_similar_names() {
        let config = AttributeIndexConfig::new("sn");
        assert_eq!(
            keys(&config, IndexKind::Approximate, &["Robert"]),
            keys(&config, IndexKind::Approximate, &["Rupert"])
        );
        assert_eq!(keys(&config, IndexKind::Approximate, &["Robert"]), vec![b"R163".to_vec()]);
        assert!(keys(&config, IndexKind::Approximate, &["1234"]).is_empty());
    }

    #[test]
    fn extensible_streams_and_counts() {
        let config = AttributeIndexConfig::new("description")
            .with_kind(IndexKind::Equality)
            .with_extensible_rule(ExtensibleRule::CaseExactMatch)
            .with_extensible_rule(ExtensibleRule::CaseIgnoreSubstringsMatch);

        assert_eq!(
            config.stream_kinds(),
            vec![
                IndexKind::Equality,
                IndexKind::ExtensibleSubstring,
                IndexKind::ExtensibleShared
            ]
        );
        assert_eq!(config.planned_index_count(), 3);

        let shared = keys(&config, IndexKind::ExtensibleShared, &["Mixed Case"]);
        let mut expected = vec![1u8];
        expected.extend_from_slice(b"Mixed Case");
        assert_eq!(shared, vec![expected]);
        let sub = keys(&config, IndexKind::ExtensibleSubstring, &["AB"]);
        assert_eq!(sub, vec![vec![4, b'a', b'b'], vec![4, b'b']]);
    }

    #[test]
    fn extensible_kinds_are_not_configured_directly() {
        let config = AttributeIndexConfig::new("cn").with_kind(IndexKind::ExtensibleShared);
        assert!(config.stream_kinds().is_empty());
        assert_eq!(config.planned_index_count(), 0);
    }
}
