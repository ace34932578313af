//! Static (verb, path-pattern) routing with named parameters.
//!
//! Patterns are split on `/`. A segment starting with `:` binds a
//! parameter; the name runs over `[A-Za-z0-9_]` and anything after it is
//! a literal suffix that must close the segment:
//!
//! ```text
//! /annotations/:id.jsonld   matches  /annotations/1234.jsonld   → {id: "1234"}
//! /annotations/             matches  /annotations/              → {}
//! ```

use std::collections::HashMap;
use thiserror::Error;

use crate::protocol::Verb;

/// Extracted path parameters.
pub type Params = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("Pattern must start with '/': {0}")]
    NotAbsolute(String),
    #[error("Empty parameter name in pattern: {0}")]
    EmptyParam(String),
    #[error("Route already registered: {verb} {pattern}")]
    Duplicate { verb: Verb, pattern: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param { name: String, suffix: String },
}

/// A parsed path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    source: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, RouteError> {
        let rest = pattern
            .strip_prefix('/')
            .ok_or_else(|| RouteError::NotAbsolute(pattern.to_owned()))?;

        let mut segments = Vec::new();
        for raw in rest.split('/') {
            match raw.strip_prefix(':') {
                Some(param) => {
                    let end = param
                        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                        .unwrap_or(param.len());
                    if end == 0 {
                        return Err(RouteError::EmptyParam(pattern.to_owned()));
                    }
                    segments.push(Segment::Param {
                        name: param[..end].to_owned(),
                        suffix: param[end..].to_owned(),
                    });
                }
                None => segments.push(Segment::Literal(raw.to_owned())),
            }
        }

        Ok(Self {
            source: pattern.to_owned(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a concrete path, returning bound parameters.
    pub fn matches(&self, path: &str) -> Option<Params> {
        let rest = path.strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = Params::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) => {
                    if lit != part {
                        return None;
                    }
                }
                Segment::Param { name, suffix } => {
                    let value = part.strip_suffix(suffix.as_str())?;
                    if value.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), value.to_owned());
                }
            }
        }
        Some(params)
    }
}

struct Route<H> {
    verb: Verb,
    pattern: PathPattern,
    handler: H,
}

/// Ordered route table. First registered match wins.
pub struct RouteTable<H> {
    routes: Vec<Route<H>>,
}

impl<H> Default for RouteTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> RouteTable<H> {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register `handler` for `verb` + `pattern`.
    ///
    /// Registering the exact same verb and pattern twice is rejected.
    pub fn set_handler(&mut self, verb: Verb, pattern: &str, handler: H) -> Result<(), RouteError> {
        let pattern = PathPattern::parse(pattern)?;
        if self
            .routes
            .iter()
            .any(|r| r.verb == verb && r.pattern == pattern)
        {
            return Err(RouteError::Duplicate {
                verb,
                pattern: pattern.source,
            });
        }
        self.routes.push(Route {
            verb,
            pattern,
            handler,
        });
        Ok(())
    }

    /// Find the handler for a request.
    pub fn lookup(&self, verb: Verb, path: &str) -> Option<(&H, Params)> {
        self.routes
            .iter()
            .filter(|r| r.verb == verb)
            .find_map(|r| r.pattern.matches(path).map(|params| (&r.handler, params)))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered (verb, pattern) pairs in order.
    pub fn entries(&self) -> impl Iterator<Item = (Verb, &str)> {
        self.routes.iter().map(|r| (r.verb, r.pattern.as_str()))
    }
}
