//! Route table: exact paths first, then parameterized paths in
//! registration order. The first match wins; there is no ranking.

use std::collections::{BTreeMap, HashMap};

/// Captured `:param` values.
pub type Params = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    /// Matches the rest of the path, including nothing.
    Rest,
}

/// Compiled path pattern (`users/:id`, `files/*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

pub(crate) fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    normalize(path).split('/').filter(|s| !s.is_empty())
}

impl PathPattern {
    pub fn parse(raw: &str) -> Self {
        let segments = split(raw)
            .map(|s| {
                if s == "*" {
                    Segment::Rest
                } else if let Some(name) = s.strip_prefix(':') {
                    Segment::Param(name.to_string())
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        Self {
            raw: normalize(raw).to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_dynamic(&self) -> bool {
        self.segments.iter().any(|s| !matches!(s, Segment::Literal(_)))
    }

    pub fn matches(&self, path: &str) -> Option<Params> {
        let mut params = Params::new();
        let mut parts = split(path);
        for seg in &self.segments {
            match seg {
                Segment::Rest => return Some(params),
                Segment::Literal(lit) => {
                    if parts.next() != Some(lit.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = parts.next()?;
                    params.insert(name.clone(), value.to_string());
                }
            }
        }
        parts.next().is_none().then_some(params)
    }
}

#[derive(Debug)]
pub struct RouteTable<T> {
    exact: HashMap<String, T>,
    dynamic: Vec<(PathPattern, T)>,
}

impl<T> Default for RouteTable<T> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            dynamic: Vec::new(),
        }
    }
}

impl<T> RouteTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace. A replaced dynamic route keeps its position.
    pub fn insert(&mut self, path: &str, value: T) {
        let pattern = PathPattern::parse(path);
        if !pattern.is_dynamic() {
            self.exact.insert(pattern.raw, value);
            return;
        }
        match self.dynamic.iter_mut().find(|(p, _)| *p == pattern) {
            Some(slot) => slot.1 = value,
            None => self.dynamic.push((pattern, value)),
        }
    }

    pub fn remove(&mut self, path: &str) -> bool {
        let pattern = PathPattern::parse(path);
        if !pattern.is_dynamic() {
            return self.exact.remove(&pattern.raw).is_some();
        }
        let before = self.dynamic.len();
        self.dynamic.retain(|(p, _)| *p != pattern);
        before != self.dynamic.len()
    }

    pub fn resolve(&self, path: &str) -> Option<(&T, Params)> {
        if let Some(v) = self.exact.get(normalize(path)) {
            return Some((v, Params::new()));
        }
        self.dynamic
            .iter()
            .find_map(|(p, v)| p.matches(path).map(|params| (v, params)))
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.dynamic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
