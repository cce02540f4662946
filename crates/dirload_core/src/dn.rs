//! Distinguished names and the DN key encoding.
//!
//! A [`Dn`] is parsed once, normalised (lower-cased attribute types and
//! values, collapsed whitespace, sorted multi-valued RDNs) and then compared
//! by its normalised form only.
//!
//! The dn2id tree is keyed by a *DN key*: for every RDN below the suffix
//! base, top-down, a `0x00` separator followed by the normalised RDN. The
//! base entry itself has the empty key. Because the separator sorts below
//! every byte a normalised RDN can contain:
//!
//! - a parent key is a strict prefix of each of its children's keys, so a
//!   key-ordered scan always yields a parent before its descendants
//! - the whole subtree of `key` is the range `[key, key + 0x01)`

use crate::error::{CoreError, CoreResult};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Byte that precedes every RDN in a DN key.
pub const DN_KEY_SEPARATOR: u8 = 0x00;

/// Byte appended to a DN key to form the exclusive upper bound of its subtree.
pub const DN_KEY_SUBTREE_BOUND: u8 = 0x01;

const SPECIAL: &[char] = &[',', '+', '"', '\\', '<', '>', ';', '='];

/// One relative distinguished name, possibly multi-valued.
#[derive(Debug, Clone)]
pub struct Rdn {
    original: String,
    normalized: String,
}

impl Rdn {
    fn parse(raw: &str, dn: &str) -> CoreResult<Self> {
        let mut avas = Vec::new();
        for ava in split_unescaped(raw, '+') {
            let Some(eq) = find_unescaped(ava, '=') else {
                return Err(CoreError::invalid_dn(dn, format!("RDN {ava:?} has no '='")));
            };
            let attribute = ava[..eq].trim().to_ascii_lowercase();
            if attribute.is_empty() {
                return Err(CoreError::invalid_dn(dn, "empty attribute type"));
            }
            let value = normalize_value(&unescape(ava[eq + 1..].trim(), dn)?);
            if value.contains('\0') {
                return Err(CoreError::invalid_dn(dn, "value contains a NUL byte"));
            }
            avas.push(format!("{attribute}={}", escape(&value)));
        }
        avas.sort();

        Ok(Self {
            original: raw.trim().to_string(),
            normalized: avas.join("+"),
        })
    }

    /// Returns the RDN as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Returns the normalised RDN.
    #[must_use]
    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for Rdn {}

/// A parsed distinguished name.
///
/// RDNs are stored leaf first, the way they are written.
#[derive(Debug, Clone)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    /// Parses a DN such as `cn=bob,ou=people,dc=example,dc=com`.
    ///
    /// The empty string parses to the root DN.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidDn`] for malformed RDNs, dangling escapes
    /// or values containing NUL.
    pub fn parse(text: &str) -> CoreResult<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut rdns = Vec::new();
        for raw in split_unescaped(trimmed, ',') {
            if raw.trim().is_empty() {
                return Err(CoreError::invalid_dn(text, "empty RDN"));
            }
            rdns.push(Rdn::parse(raw, text)?);
        }
        Ok(Self { rdns })
    }

    /// Returns the root DN (no RDNs).
    #[must_use]
    pub const fn root() -> Self {
        Self { rdns: Vec::new() }
    }

    /// Returns true for the root DN.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Returns the number of RDNs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rdns.len()
    }

    /// Returns true for the root DN.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Returns the leaf RDN, if any.
    #[must_use]
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    /// Returns the parent DN, or `None` for the root DN.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Self {
                rdns: self.rdns[1..].to_vec(),
            })
        }
    }

    /// Returns a child of this DN with the given leaf RDN.
    ///
    /// # Errors
    ///
    /// Returns an error if `rdn` is not a valid RDN.
    pub fn child(&self, rdn: &str) -> CoreResult<Self> {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(Rdn::parse(rdn, rdn)?);
        rdns.extend(self.rdns.iter().cloned());
        Ok(Self { rdns })
    }

    /// Returns true if `self` lies strictly below `ancestor`.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        self.rdns.len() > ancestor.rdns.len() && self.ends_with(ancestor)
    }

    /// Returns true if `self` equals `other` or lies below it.
    #[must_use]
    pub fn is_under_or_equal(&self, other: &Dn) -> bool {
        self.rdns.len() >= other.rdns.len() && self.ends_with(other)
    }

    fn ends_with(&self, other: &Dn) -> bool {
        let skip = self.rdns.len() - other.rdns.len();
        self.rdns[skip..] == other.rdns[..]
    }

    /// Returns the normalised string form.
    #[must_use]
    pub fn normalized(&self) -> String {
        self.rdns
            .iter()
            .map(Rdn::normalized)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Encodes the DN key of `self` relative to the suffix `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if `self` is not `base` or below it.
    pub fn to_key(&self, base: &Dn) -> CoreResult<Vec<u8>> {
        if !self.is_under_or_equal(base) {
            return Err(CoreError::invalid_dn(
                self.to_string(),
                format!("not within suffix '{base}'"),
            ));
        }
        let depth = self.rdns.len() - base.rdns.len();
        let mut key = Vec::new();
        for rdn in self.rdns[..depth].iter().rev() {
            key.push(DN_KEY_SEPARATOR);
            key.extend_from_slice(rdn.normalized.as_bytes());
        }
        Ok(key)
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.rdns == other.rdns
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for rdn in &self.rdns {
            rdn.normalized.hash(state);
        }
    }
}

impl PartialOrd for Dn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dn {
    /// Orders hierarchically: ancestors before descendants, siblings by
    /// normalised RDN.
    fn cmp(&self, other: &Self) -> Ordering {
        let mine = self.rdns.iter().rev().map(Rdn::normalized);
        let theirs = other.rdns.iter().rev().map(Rdn::normalized);
        mine.cmp(theirs)
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(&rdn.original)?;
        }
        Ok(())
    }
}

/// Returns the DN key of the parent of `key`, or `None` for the base key.
///
/// A key one level below the base yields the empty base key.
#[must_use]
pub fn parent_key(key: &[u8]) -> Option<&[u8]> {
    if key.is_empty() {
        return None;
    }
    let pos = key.iter().rposition(|&b| b == DN_KEY_SEPARATOR).unwrap_or(0);
    Some(&key[..pos])
}

/// Returns the exclusive upper bound of the subtree rooted at `key`.
#[must_use]
pub fn subtree_upper_bound(key: &[u8]) -> Vec<u8> {
    let mut bound = Vec::with_capacity(key.len() + 1);
    bound.extend_from_slice(key);
    bound.push(DN_KEY_SUBTREE_BOUND);
    bound
}

fn split_unescaped(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    let mut quoted = false;
    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            quoted = !quoted;
        } else if c == separator && !quoted {
            parts.push(&text[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&text[start..]);
    parts
}

fn find_unescaped(text: &str, needle: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == needle {
            return Some(i);
        }
    }
    None
}

fn unescape(value: &str, dn: &str) -> CoreResult<String> {
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    let mut bytes = Vec::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        let Some(next) = chars.next() else {
            return Err(CoreError::invalid_dn(dn, "dangling escape"));
        };
        if let Some(high) = next.to_digit(16) {
            let low = chars
                .next()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| CoreError::invalid_dn(dn, "truncated hex escape"))?;
            bytes.push((high * 16 + low) as u8);
        } else {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(next.encode_utf8(&mut buf).as_bytes());
        }
    }
    String::from_utf8(bytes).map_err(|_| CoreError::invalid_dn(dn, "escaped value is not UTF-8"))
}

fn normalize_value(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        if SPECIAL.contains(&c) || (i == 0 && c == '#') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dn(text: &str) -> Dn {
        Dn::parse(text).unwrap()
    }

    #[test]
    fn parse_and_normalize() {
        let parsed = dn("CN=Bob  Smith, OU=People,dc=Example,DC=com");
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed.normalized(), "cn=bob smith,ou=people,dc=example,dc=com");
        assert_eq!(parsed, dn("cn=bob smith,ou=people,dc=example,dc=com"));
    }

    #[test]
    fn escaped_separators_stay_in_value() {
        let parsed = dn(r"cn=Smith\, Bob,dc=com");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.rdn().unwrap().normalized(), r"cn=smith\, bob");
        assert_eq!(dn(r"cn=Smith\2C Bob,dc=com"), parsed);
    }

    #[test]
    fn multi_valued_rdn_is_order_insensitive() {
        assert_eq!(dn("uid=a+cn=b,dc=com"), dn("cn=b+uid=a,dc=com"));
    }

    #[test]
    fn invalid_dns_are_rejected() {
        assert!(Dn::parse("cn=a,,dc=com").is_err());
        assert!(Dn::parse("nodelimiter").is_err());
        assert!(Dn::parse(r"cn=a\").is_err());
        assert!(Dn::parse(r"cn=a\00,dc=com").is_err());
    }

    #[test]
    fn hierarchy() {
        let base = dn("dc=example,dc=com");
        let people = dn("ou=people,dc=example,dc=com");
        let bob = dn("cn=bob,ou=people,dc=example,dc=com");

        assert_eq!(bob.parent().unwrap(), people);
        assert!(bob.is_descendant_of(&base));
        assert!(!base.is_descendant_of(&base));
        assert!(base.is_under_or_equal(&base));
        assert!(!dn("dc=other,dc=com").is_under_or_equal(&base));
        assert!(Dn::root().parent().is_none());
        assert_eq!(people.child("cn=Bob").unwrap(), bob);
        assert!(base < people && people < bob);
    }

    #[test]
    fn dn_keys() {
        let base = dn("dc=example,dc=com");
        assert!(base.to_key(&base).unwrap().is_empty());

        let bob = dn("cn=Bob,ou=People,dc=example,dc=com");
        assert_eq!(bob.to_key(&base).unwrap(), b"\0ou=people\0cn=bob".to_vec());
        assert!(dn("dc=other,dc=com").to_key(&base).is_err());
    }

    #[test]
    fn parent_keys() {
        assert_eq!(parent_key(b""), None);
        assert_eq!(parent_key(b"\0ou=people"), Some(&b""[..]));
        assert_eq!(parent_key(b"\0ou=people\0cn=bob"), Some(&b"\0ou=people"[..]));
    }

    #[test]
    fn subtree_bound_excludes_siblings() {
        let base = dn("dc=com");
        let branch = dn("ou=a,dc=com").to_key(&base).unwrap();
        let child = dn("cn=x,ou=a,dc=com").to_key(&base).unwrap();
        let sibling = dn("ou=ab,dc=com").to_key(&base).unwrap();
        let bound = subtree_upper_bound(&branch);

        assert!(child.as_slice() < bound.as_slice());
        assert!(sibling.as_slice() >= bound.as_slice());
    }

    proptest! {
        #[test]
        fn parent_key_is_key_of_parent(
            labels in prop::collection::vec("[a-z]{1,6}", 1..6)
        ) {
            let base = dn("dc=com");
            let mut current = base.clone();
            for label in &labels {
                current = current.child(&format!("ou={label}")).unwrap();
            }
            let key = current.to_key(&base).unwrap();
            let parent = current.parent().unwrap().to_key(&base).unwrap();
            prop_assert_eq!(parent_key(&key), Some(parent.as_slice()));
            prop_assert!(parent < key);
        }
    }
}
