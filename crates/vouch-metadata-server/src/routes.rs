//! The metadata endpoint tree.
//!
//! Listing endpoints return the immediate children of a path, one per line,
//! with a trailing slash on entries that have children of their own. The
//! known paths live in a prefix trie so nesting can grow without touching
//! the listing logic.

use std::collections::BTreeMap;

/// Paths of the metadata surface, relative to the server root.
///
/// Parameterized segments (the service-account name) are routed separately
/// and intentionally absent here; the service-account listing has its own
/// handler.
pub const METADATA_PATHS: &[&str] = &[
    "computeMetadata/v1/project/project-id",
    "computeMetadata/v1/project/numeric-project-id",
    "computeMetadata/v1/universe/universe-domain",
    "computeMetadata/v1/instance/service-accounts/",
];

/// A prefix trie over known endpoint paths.
#[derive(Debug, Default)]
pub struct EndpointTrie {
    root: Node,
}

#[derive(Debug, Default)]
struct Node {
    children: BTreeMap<String, Node>,
    /// Marked for paths inserted with a trailing slash: the node lists as a
    /// directory even without registered children.
    directory: bool,
}

impl EndpointTrie {
    /// Builds the trie over the fixed metadata surface.
    pub fn new() -> Self {
        let mut trie = Self::default();
        for path in METADATA_PATHS {
            trie.insert(path);
        }
        trie
    }

    /// Inserts a path. A trailing slash marks a directory endpoint.
    pub fn insert(&mut self, path: &str) {
        let directory = path.ends_with('/');
        let mut node = &mut self.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node.children.entry(segment.to_string()).or_default();
        }
        if directory {
            node.directory = true;
        }
    }

    /// Lists the immediate children of `path`, one level deep.
    ///
    /// Children that have children themselves (or are directory endpoints)
    /// carry a trailing slash. Unknown paths list as empty.
    pub fn list_children(&self, path: &str) -> Vec<String> {
        let mut node = &self.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match node.children.get(segment) {
                Some(child) => node = child,
                None => return Vec::new(),
            }
        }

        node.children
            .iter()
            .map(|(name, child)| {
                if child.directory || !child.children.is_empty() {
                    format!("{name}/")
                } else {
                    name.clone()
                }
            })
            .collect()
    }

    /// Renders the listing body: one child per line.
    pub fn listing_body(&self, path: &str) -> String {
        self.list_children(path)
            .into_iter()
            .map(|child| format!("{child}\n"))
            .collect()
    }
}
