//! Metadata canonicalization: named label sets and their compact runtime
//! tags.
//!
//! Policies describe metadata symbolically (`uart_meta`, `ram_meta`, ...);
//! at runtime the engine only ever compares [`Tag`]s. The factory resolves
//! identifiers to canonical label sets and the converter interns label sets
//! into tags, so tag equality is O(1) on the hot path and label-set-equal
//! metadata always collapses onto the same tag.

use std::collections::HashMap;

use thiserror::Error;
use warden_tags::Tag;

pub type Result<T> = std::result::Result<T, MetaError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetaError {
    #[error("unknown meta-set identifier '{0}'")]
    UnknownMetaSet(String),
}

/// Interned policy label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(u32);

/// Configuration generation counter.
///
/// Tags and cached decisions are only meaningful within one generation;
/// every reload bumps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Generation(u64);

impl Generation {
    #[must_use]
    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// A named set of policy labels, resolved once from a symbolic identifier and
/// immutable afterwards.
///
/// Labels are stored sorted and deduplicated, so label-set equality is plain
/// slice equality regardless of the order or repetition in the definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetaSet {
    labels: Box<[LabelId]>,
}

impl MetaSet {
    pub fn labels(&self) -> &[LabelId] {
        &self.labels
    }

    /// The empty label set.
    pub fn empty() -> MetaSet {
        MetaSet { labels: Box::new([]) }
    }
}

/// Resolves symbolic metadata identifiers to canonical label sets.
///
/// Definitions come from the loaded policy metadata; the factory is rebuilt
/// wholesale on configuration reload.
#[derive(Debug, Default)]
pub struct MetaSetFactory {
    label_names: Vec<String>,
    label_ids: HashMap<String, LabelId>,
    sets: HashMap<String, MetaSet>,
}

impl MetaSetFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern_label(&mut self, name: &str) -> LabelId {
        if let Some(id) = self.label_ids.get(name) {
            return *id;
        }
        let id = LabelId(self.label_names.len() as u32);
        self.label_names.push(name.to_owned());
        self.label_ids.insert(name.to_owned(), id);
        id
    }

    /// Defines (or redefines) `identifier` as the given labels. Order and
    /// duplicates do not matter; the stored set is canonical.
    pub fn define<I, S>(&mut self, identifier: &str, labels: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ids: Vec<LabelId> = labels
            .into_iter()
            .map(|label| self.intern_label(label.as_ref()))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        self.sets.insert(
            identifier.to_owned(),
            MetaSet {
                labels: ids.into_boxed_slice(),
            },
        );
    }

    pub fn get_meta_set(&self, identifier: &str) -> Result<&MetaSet> {
        self.sets
            .get(identifier)
            .ok_or_else(|| MetaError::UnknownMetaSet(identifier.to_owned()))
    }

    pub fn label_name(&self, id: LabelId) -> Option<&str> {
        self.label_names.get(id.0 as usize).map(String::as_str)
    }
}

/// Converts label sets to compact runtime tags by interning.
///
/// Repeated conversions of label-set-equal inputs return the same [`Tag`],
/// which is what makes tag equality usable as label-set equality throughout
/// the hot path. The mapping is a pure function of one configuration
/// generation; a fresh converter is built on every reload, invalidating all
/// previously issued tags.
#[derive(Debug)]
pub struct TagConverter {
    by_labels: HashMap<Box<[LabelId]>, Tag>,
    label_sets: Vec<Box<[LabelId]>>,
}

impl TagConverter {
    /// The empty label set is interned first so every converter issues the
    /// same stable default tag.
    pub fn new() -> Self {
        let mut converter = Self {
            by_labels: HashMap::new(),
            label_sets: Vec::new(),
        };
        converter.meta_set_to_tag(&MetaSet::empty());
        converter
    }

    /// Tag of the empty label set.
    pub fn default_tag(&self) -> Tag {
        Tag::from_bits(0)
    }

    pub fn meta_set_to_tag(&mut self, set: &MetaSet) -> Tag {
        if let Some(tag) = self.by_labels.get(set.labels()) {
            return *tag;
        }
        let tag = Tag::from_bits(self.label_sets.len() as u64);
        let labels: Box<[LabelId]> = set.labels().into();
        self.label_sets.push(labels.clone());
        self.by_labels.insert(labels, tag);
        tag
    }

    /// Label set a tag was issued for, if the tag belongs to this generation.
    pub fn labels_of(&self, tag: Tag) -> Option<&[LabelId]> {
        let idx = usize::try_from(tag.to_bits()).ok()?;
        self.label_sets.get(idx).map(Box::as_ref)
    }

    pub fn tag_count(&self) -> usize {
        self.label_sets.len()
    }

    /// Human-readable rendering of a tag's label set, e.g.
    /// `{SOC.IO.UART, requires.heap}`.
    pub fn describe(&self, tag: Tag, factory: &MetaSetFactory) -> String {
        let Some(labels) = self.labels_of(tag) else {
            return format!("{tag} (unknown)");
        };
        let mut out = String::from("{");
        for (i, id) in labels.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            match factory.label_name(*id) {
                Some(name) => out.push_str(name),
                None => out.push_str("<label?>"),
            }
        }
        out.push('}');
        out
    }
}

impl Default for TagConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_set_equal_identifiers_canonicalize_to_the_same_tag() {
        let mut factory = MetaSetFactory::new();
        factory.define("uart_meta", ["SOC.IO.UART", "SOC.IO"]);
        factory.define("uart_alias", ["SOC.IO", "SOC.IO.UART", "SOC.IO"]);
        factory.define("ram_meta", ["SOC.Memory.RAM"]);

        let mut converter = TagConverter::new();
        let uart = converter
            .meta_set_to_tag(factory.get_meta_set("uart_meta").unwrap());
        let alias = converter
            .meta_set_to_tag(factory.get_meta_set("uart_alias").unwrap());
        let ram = converter
            .meta_set_to_tag(factory.get_meta_set("ram_meta").unwrap());

        assert_eq!(uart, alias);
        assert_ne!(uart, ram);
        // Repeated conversion is stable.
        assert_eq!(
            converter.meta_set_to_tag(factory.get_meta_set("uart_meta").unwrap()),
            uart
        );
    }

    #[test]
    fn unknown_identifier_is_an_error() {
        let factory = MetaSetFactory::new();
        assert_eq!(
            factory.get_meta_set("nope").unwrap_err(),
            MetaError::UnknownMetaSet("nope".to_owned())
        );
    }

    #[test]
    fn empty_set_is_the_default_tag() {
        let mut converter = TagConverter::new();
        assert_eq!(
            converter.meta_set_to_tag(&MetaSet::empty()),
            converter.default_tag()
        );
    }

    #[test]
    fn fresh_converter_invalidates_prior_tags() {
        let mut factory = MetaSetFactory::new();
        factory.define("a", ["x"]);
        factory.define("b", ["y"]);

        let mut old = TagConverter::new();
        // Intern "a" then "b" so "b" gets the higher tag value.
        let _ = old.meta_set_to_tag(factory.get_meta_set("a").unwrap());
        let old_b = old.meta_set_to_tag(factory.get_meta_set("b").unwrap());

        // A new generation interning "b" first assigns it different bits;
        // tags must never be compared across converters.
        let mut new = TagConverter::new();
        let new_b = new.meta_set_to_tag(factory.get_meta_set("b").unwrap());
        assert_ne!(old_b.to_bits(), new_b.to_bits());
    }

    #[test]
    fn describe_renders_label_names() {
        let mut factory = MetaSetFactory::new();
        factory.define("uart_meta", ["SOC.IO.UART"]);

        let mut converter = TagConverter::new();
        let tag = converter
            .meta_set_to_tag(factory.get_meta_set("uart_meta").unwrap());
        assert_eq!(converter.describe(tag, &factory), "{SOC.IO.UART}");
        assert_eq!(converter.describe(converter.default_tag(), &factory), "{}");

        let bogus = Tag::from_bits(0xFFFF);
        assert!(converter.describe(bogus, &factory).ends_with("(unknown)"));
    }
}
