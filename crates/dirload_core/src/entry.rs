//! Directory entries as seen by the loader.

use crate::dn::Dn;
use std::collections::BTreeMap;

/// Attribute holding an entry's object classes.
pub const OBJECT_CLASS: &str = "objectclass";

/// Attribute holding referral URLs.
pub const REF_ATTRIBUTE: &str = "ref";

/// A directory entry: a DN plus multi-valued attributes.
///
/// Attribute names are case-insensitive and stored lower-cased. Values keep
/// the case they were supplied in; index key extraction normalises them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    dn: Dn,
    attributes: BTreeMap<String, Vec<String>>,
}

impl Entry {
    /// Creates an entry with no attributes.
    #[must_use]
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            attributes: BTreeMap::new(),
        }
    }

    /// Adds one value, ignoring exact duplicates.
    pub fn add_value(&mut self, attribute: &str, value: impl Into<String>) {
        let value = value.into();
        let values = self
            .attributes
            .entry(attribute.to_ascii_lowercase())
            .or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    /// Builder form of [`Entry::add_value`].
    #[must_use]
    pub fn with_value(mut self, attribute: &str, value: impl Into<String>) -> Self {
        self.add_value(attribute, value);
        self
    }

    /// Replaces every value of `attribute`.
    pub fn set_values(&mut self, attribute: &str, values: Vec<String>) {
        let name = attribute.to_ascii_lowercase();
        if values.is_empty() {
            self.attributes.remove(&name);
        } else {
            self.attributes.insert(name, values);
        }
    }

    /// Returns the entry DN.
    #[must_use]
    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    /// Returns the values of `attribute`, empty if absent.
    #[must_use]
    pub fn values(&self, attribute: &str) -> &[String] {
        self.attributes
            .get(&attribute.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns true if the entry has at least one value for `attribute`.
    #[must_use]
    pub fn has_attribute(&self, attribute: &str) -> bool {
        !self.values(attribute).is_empty()
    }

    /// Iterates over `(attribute, values)` pairs in name order.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.attributes
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Returns true if the entry carries the given object class.
    #[must_use]
    pub fn has_object_class(&self, class: &str) -> bool {
        self.values(OBJECT_CLASS)
            .iter()
            .any(|value| value.eq_ignore_ascii_case(class))
    }

    /// Returns true for smart-referral entries.
    #[must_use]
    pub fn is_referral(&self) -> bool {
        self.has_object_class("referral") && self.has_attribute(REF_ATTRIBUTE)
    }

    /// Returns the referral URLs of a referral entry.
    #[must_use]
    pub fn referral_urls(&self) -> &[String] {
        if self.is_referral() {
            self.values(REF_ATTRIBUTE)
        } else {
            &[]
        }
    }
}
