//! Static region topology and per-region health tagging.
//!
//! Regions form a rooted tree; each node carries the endpoint that fronts
//! the upstream in that region plus fallback edges to sibling regions.
//! Fallback edges may form cycles, so traversal always keeps a visited set.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

/// Health of a region as last observed by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegionStatus {
    #[default]
    Healthy,
    Unhealthy,
    Deprecated,
}

/// `region_id → status` map. Missing entries are healthy.
pub type RegionHealth = HashMap<String, RegionStatus>;

fn health_of(health: &RegionHealth, id: &str) -> RegionStatus {
    health.get(id).copied().unwrap_or_default()
}

/// One node of the region tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionNode {
    pub id: String,
    pub label: String,
    pub provider: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default)]
    pub children: Vec<RegionNode>,
    /// Ids of sibling regions to try when this one degrades.
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

impl RegionNode {
    pub fn new(id: &str, label: &str, provider: &str, endpoint: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            provider: provider.to_string(),
            endpoint: endpoint.to_string(),
            weight: None,
            children: Vec::new(),
            fallbacks: Vec::new(),
        }
    }

    pub fn with_fallbacks(mut self, fallbacks: &[&str]) -> Self {
        self.fallbacks = fallbacks.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_children(mut self, children: Vec<RegionNode>) -> Self {
        self.children = children;
        self
    }
}

/// Immutable rooted tree of regions, loaded once at initialization.
pub struct RegionRegistry {
    root: RegionNode,
}

impl RegionRegistry {
    pub fn new(root: RegionNode) -> Self {
        Self { root }
    }

    /// Demo topology mirroring the mock backend's `/regions/{id}` layout.
    pub fn builtin(backend_base_url: &str) -> Self {
        let base = backend_base_url.trim_end_matches('/');
        let regional = |id: &str| format!("{base}/regions/{id}");
        let root = RegionNode::new("global", "Global entry", "battle-healer", base).with_children(
            vec![
                RegionNode::new(
                    "aws-us-east-1",
                    "AWS US East",
                    "aws",
                    &regional("aws-us-east-1"),
                )
                .with_fallbacks(&["aws-eu-west-1", "gcp-us-central1"]),
                RegionNode::new(
                    "aws-eu-west-1",
                    "AWS EU West",
                    "aws",
                    &regional("aws-eu-west-1"),
                )
                .with_fallbacks(&["gcp-us-central1", "aws-us-east-1"]),
                RegionNode::new(
                    "gcp-us-central1",
                    "GCP US Central",
                    "gcp",
                    &regional("gcp-us-central1"),
                )
                .with_fallbacks(&["aws-us-east-1"]),
                RegionNode::new(
                    "maintenance-ap",
                    "APAC (maintenance)",
                    "aws",
                    &regional("maintenance-ap"),
                )
                .with_fallbacks(&["aws-us-east-1"]),
                RegionNode::new(
                    "deprecated-eu",
                    "EU (deprecated)",
                    "aws",
                    &regional("deprecated-eu"),
                )
                .with_fallbacks(&["aws-eu-west-1"]),
            ],
        );
        Self::new(root)
    }

    pub fn root(&self) -> &RegionNode {
        &self.root
    }

    /// Endpoints of the root's direct children, the default region set.
    pub fn top_level_endpoints(&self) -> Vec<String> {
        self.root
            .children
            .iter()
            .map(|n| n.endpoint.clone())
            .collect()
    }

    /// Pre-order traversal of the whole tree.
    pub fn flatten(&self) -> Vec<&RegionNode> {
        let mut out = Vec::new();
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            out.push(node);
            for child in node.children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    pub fn find_by_id(&self, id: &str) -> Option<&RegionNode> {
        self.flatten().into_iter().find(|n| n.id == id)
    }

    /// Case-insensitive endpoint lookup.
    pub fn find_by_endpoint(&self, endpoint: &str) -> Option<&RegionNode> {
        self.flatten()
            .into_iter()
            .find(|n| n.endpoint.eq_ignore_ascii_case(endpoint))
    }

    /// Next region to try after `current_id`, given the observed health.
    ///
    /// BFS over each node's `children ++ fallbacks`, skipping unhealthy and
    /// deprecated nodes unless they appear in `force_include`. When the BFS
    /// exhausts, scans the root's children (then the rest of the tree) for
    /// the first acceptable node. Returns `None` only when no node passes
    /// the health filter.
    pub fn resolve_next(
        &self,
        current_id: &str,
        health: &RegionHealth,
        force_include: &[&str],
    ) -> Option<&RegionNode> {
        let acceptable = |node: &RegionNode| {
            health_of(health, &node.id) == RegionStatus::Healthy
                || force_include.contains(&node.id.as_str())
        };

        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(current_id);
        let mut queue: VecDeque<&str> = VecDeque::new();

        if let Some(current) = self.find_by_id(current_id) {
            for child in &current.children {
                queue.push_back(child.id.as_str());
            }
            for fallback in &current.fallbacks {
                queue.push_back(fallback.as_str());
            }
        }

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let Some(node) = self.find_by_id(id) else {
                continue;
            };
            if acceptable(node) {
                return Some(node);
            }
            for child in &node.children {
                queue.push_back(child.id.as_str());
            }
            for fallback in &node.fallbacks {
                queue.push_back(fallback.as_str());
            }
        }

        // BFS exhausted: fall back to the first acceptable root child, then
        // anywhere in the tree.
        self.root
            .children
            .iter()
            .find(|&node| node.id != current_id && acceptable(node))
            .or_else(|| {
                self.flatten()
                    .into_iter()
                    .find(|&node| node.id != current_id && acceptable(node))
            })
    }
}
