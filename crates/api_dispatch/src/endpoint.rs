//! Hierarchical endpoint namespace.
//!
//! Each [`EndpointNode`] owns one path segment. Children are created on first
//! access, so paths that were not registered up front still resolve; the
//! namespace is a convenience, not a whitelist.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock, Weak};

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use url::Url;

use crate::error::{BaseUrlCannotBeABaseSnafu, ConfigError, InvalidBaseUrlSnafu};

pub const SEPARATOR: char = '/';

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[snafu(display("endpoint path contains an empty segment: '{path}'"))]
    EmptySegment { path: String },

    #[snafu(display("invalid endpoint segment '{segment}'"))]
    InvalidSegment { segment: String },
}

pub struct EndpointNode {
    segment: String,
    parent: Weak<EndpointNode>,
    children: RwLock<BTreeMap<String, Arc<EndpointNode>>>,
    path: OnceLock<String>,
}

impl fmt::Debug for EndpointNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointNode")
            .field("path", &self.full_path())
            .finish_non_exhaustive()
    }
}

impl EndpointNode {
    fn root() -> Arc<Self> {
        Arc::new(Self {
            segment: String::new(),
            parent: Weak::new(),
            children: RwLock::default(),
            path: OnceLock::new(),
        })
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    pub fn is_root(&self) -> bool {
        self.segment.is_empty()
    }

    pub fn parent(&self) -> Option<Arc<EndpointNode>> {
        self.parent.upgrade()
    }

    /// Root-to-node path joined by [`SEPARATOR`]. Empty for the root.
    pub fn full_path(&self) -> &str {
        self.path.get_or_init(|| match self.parent() {
            Some(parent) if !parent.is_root() => {
                format!("{}{SEPARATOR}{}", parent.full_path(), self.segment)
            }
            _ => self.segment.clone(),
        })
    }

    pub fn child(&self, segment: &str) -> Option<Arc<EndpointNode>> {
        self.children
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(segment)
            .cloned()
    }

    pub fn children(&self) -> Vec<Arc<EndpointNode>> {
        self.children
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn child_or_insert(self: &Arc<Self>, segment: &str) -> Arc<EndpointNode> {
        if let Some(child) = self.child(segment) {
            return child;
        }
        let mut children = self
            .children
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(children.entry(segment.to_string()).or_insert_with(|| {
            Arc::new(EndpointNode {
                segment: segment.to_string(),
                parent: Arc::downgrade(self),
                children: RwLock::default(),
                path: OnceLock::new(),
            })
        }))
    }
}

/// A resolved node together with its request URL.
#[derive(Clone, Debug)]
pub struct Endpoint {
    node: Arc<EndpointNode>,
    url: Url,
}

impl Endpoint {
    pub fn node(&self) -> &Arc<EndpointNode> {
        &self.node
    }

    /// URL without query parameters.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn path(&self) -> &str {
        self.node.full_path()
    }

    /// Event topic for responses from this endpoint: its final path segment.
    pub fn topic(&self) -> &str {
        self.node.segment()
    }
}

/// The endpoint namespace of one upstream API, rooted at its base URL.
#[derive(Debug)]
pub struct EndpointTree {
    base: Url,
    root: Arc<EndpointNode>,
}

impl EndpointTree {
    /// `base` is normalized to end with a separator, so `https://host/api`
    /// and `https://host/api/` behave the same.
    pub fn new(base: &str) -> Result<Self, ConfigError> {
        let mut url = Url::parse(base).context(InvalidBaseUrlSnafu { url: base })?;
        ensure!(
            !url.cannot_be_a_base(),
            BaseUrlCannotBeABaseSnafu { url: base }
        );
        if !url.path().ends_with(SEPARATOR) {
            let path = format!("{}{SEPARATOR}", url.path());
            url.set_path(&path);
        }
        url.set_query(None);
        url.set_fragment(None);

        Ok(Self {
            base: url,
            root: EndpointNode::root(),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn root(&self) -> &Arc<EndpointNode> {
        &self.root
    }

    pub fn root_endpoint(&self) -> Endpoint {
        Endpoint {
            node: Arc::clone(&self.root),
            url: self.base.clone(),
        }
    }

    /// Registers separator-delimited paths such as `series/observations`.
    pub fn add_endpoints<I, S>(&self, paths: I) -> Result<(), EndpointError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for path in paths {
            self.resolve_path(path.as_ref())?;
        }
        Ok(())
    }

    /// Walks `segments` from the root, creating unknown children on the way.
    pub fn resolve<I, S>(&self, segments: I) -> Result<Endpoint, EndpointError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut node = Arc::clone(&self.root);
        for segment in segments {
            let segment = validate(segment.as_ref())?;
            node = node.child_or_insert(segment);
        }
        let url = self.url_for(&node);
        Ok(Endpoint { node, url })
    }

    /// Like [`resolve`](Self::resolve) for a `/`-delimited path. Leading and
    /// trailing separators are ignored; empty inner segments are rejected.
    pub fn resolve_path(&self, path: &str) -> Result<Endpoint, EndpointError> {
        let trimmed = path.trim_matches(SEPARATOR);
        if trimmed.is_empty() {
            return self.resolve(std::iter::empty::<&str>());
        }
        if trimmed.split(SEPARATOR).any(str::is_empty) {
            return EmptySegmentSnafu { path }.fail();
        }
        self.resolve(trimmed.split(SEPARATOR))
    }

    /// Looks a path up without creating nodes.
    pub fn get(&self, path: &str) -> Option<Endpoint> {
        let mut node = Arc::clone(&self.root);
        let segments = path
            .trim_matches(SEPARATOR)
            .split(SEPARATOR)
            .filter(|s| !s.is_empty());
        for segment in segments {
            node = node.child(segment)?;
        }
        let url = self.url_for(&node);
        Some(Endpoint { node, url })
    }

    /// URLs of every node below the root, depth-first in segment order.
    pub fn endpoints(&self) -> Vec<Url> {
        let mut urls = Vec::new();
        let mut stack: Vec<Arc<EndpointNode>> = self.root.children().into_iter().rev().collect();
        while let Some(node) = stack.pop() {
            urls.push(self.url_for(&node));
            stack.extend(node.children().into_iter().rev());
        }
        urls
    }

    fn url_for(&self, node: &EndpointNode) -> Url {
        let mut url = self.base.clone();
        if node.is_root() {
            return url;
        }
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(node.full_path().split(SEPARATOR));
        }
        url
    }
}

fn validate(segment: &str) -> Result<&str, EndpointError> {
    let segment = Some(segment)
        .filter(|s| !s.is_empty())
        .context(EmptySegmentSnafu { path: segment })?;
    ensure!(
        !segment.contains(['/', '?', '#']) && segment != "." && segment != "..",
        InvalidSegmentSnafu { segment }
    );
    Ok(segment)
}
