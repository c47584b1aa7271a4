use std::ops::Index;
use std::slice;

/// A single URL parameter, consisting of a key and a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub key: String,
    pub value: String,
}

impl Param {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Param {
        Param {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The ordered list of parameters captured by a route match. The first
/// wildcard in the registered path produces the first entry, so values can
/// also be read by position.
///
/// The buffer lives inside the pooled request context: clearing it between
/// requests keeps the allocation, and the engine pre-sizes its capacity to
/// the largest parameter count seen at registration time.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Params(Vec<Param>);

impl Params {
    pub(crate) fn with_capacity(capacity: usize) -> Params {
        Params(Vec::with_capacity(capacity))
    }

    /// Returns the value of the first parameter whose key matches `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|param| param.key == name)
            .map(|param| param.value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> slice::Iter<'_, Param> {
        self.0.iter()
    }

    pub(crate) fn push(&mut self, param: Param) {
        self.0.push(param);
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }
}

impl Index<usize> for Params {
    type Output = str;

    fn index(&self, i: usize) -> &Self::Output {
        &self.0[i].value
    }
}

impl<'p> IntoIterator for &'p Params {
    type Item = &'p Param;
    type IntoIter = slice::Iter<'p, Param>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Param> for Params {
    fn from_iter<I: IntoIterator<Item = Param>>(iter: I) -> Params {
        Params(iter.into_iter().collect())
    }
}
