use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// A tree of download links: categories nest until a list of URLs.
///
/// ```json
/// { "Debian": { "Cloud": ["https://.../debian-12-generic-amd64.qcow2"] },
///   "Alpine": ["https://.../alpine-virt-3.20.3-x86_64.iso"] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkNode {
    Leaves(Vec<String>),
    Category(BTreeMap<String, LinkNode>),
}

impl LinkNode {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse link tree")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read link tree: {:?}", path))?;
        Self::from_json(&text)
    }

    /// Every URL in the tree, depth first, without duplicates.
    pub fn flatten(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        self.collect_into(&mut seen, &mut urls);
        urls
    }

    fn collect_into(&self, seen: &mut HashSet<String>, urls: &mut Vec<String>) {
        match self {
            LinkNode::Leaves(leaves) => {
                for url in leaves.iter().map(|u| u.trim()).filter(|u| !u.is_empty()) {
                    if seen.insert(url.to_string()) {
                        urls.push(url.to_string());
                    }
                }
            }
            LinkNode::Category(children) => {
                for child in children.values() {
                    child.collect_into(seen, urls);
                }
            }
        }
    }

    /// Subtree at `path`, e.g. `["Debian", "Cloud"]`.
    pub fn find(&self, path: &[&str]) -> Option<&LinkNode> {
        match path.split_first() {
            None => Some(self),
            Some((head, rest)) => match self {
                LinkNode::Category(children) => children.get(*head)?.find(rest),
                LinkNode::Leaves(_) => None,
            },
        }
    }
}
