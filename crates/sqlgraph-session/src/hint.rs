//! Load hints: the set of relation paths to populate.
//!
//! A hint is a small tree keyed by field name. `LoadHint::parse(&["books.reviews",
//! "publisher"])` describes "each author's books, each book's reviews, and the
//! author's publisher". Leaves may name primitive fields; reactive declarations
//! use those leaves to know which column changes matter.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadHint {
    children: BTreeMap<&'static str, LoadHint>,
}

impl LoadHint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a hint from dotted paths.
    pub fn parse(paths: &[&'static str]) -> Self {
        let mut hint = Self::new();
        for path in paths {
            hint.add_path(path);
        }
        hint
    }

    /// Add one dotted path, creating intermediate nodes.
    pub fn add_path(&mut self, path: &'static str) {
        let mut node = self;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            node = node.children.entry(segment).or_default();
        }
    }

    #[must_use]
    pub fn with(mut self, name: &'static str, child: LoadHint) -> Self {
        self.children.entry(name).or_default().merge(&child);
        self
    }

    pub fn merge(&mut self, other: &LoadHint) {
        for (name, child) in &other.children {
            self.children.entry(name).or_default().merge(child);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&LoadHint> {
        self.children.get(name)
    }

    pub fn children(&self) -> impl Iterator<Item = (&'static str, &LoadHint)> {
        self.children.iter().map(|(k, v)| (*k, v))
    }

    /// Every root-to-leaf path, dotted.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (name, child) in &self.children {
            if child.is_empty() {
                out.push((*name).to_string());
            } else {
                for rest in child.paths() {
                    out.push(format!("{name}.{rest}"));
                }
            }
        }
        out
    }
}

impl From<&'static str> for LoadHint {
    fn from(path: &'static str) -> Self {
        Self::parse(&[path])
    }
}

impl<const N: usize> From<[&'static str; N]> for LoadHint {
    fn from(paths: [&'static str; N]) -> Self {
        Self::parse(&paths)
    }
}

impl fmt::Display for LoadHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.paths().join(", "))
    }
}
