//! Aggregate registry of tools, resources, and prompts across endpoints
//!
//! Every entry is exposed under a namespaced name,
//! `"<endpoint_id>__<name>"`, so identically named items on different
//! endpoints never collide. Resource names are display labels only; within
//! one endpoint a resource is identified by its URI. The registry is never patched in place: the
//! manager builds a fresh [`Registry`] from the catalogs of the currently
//! connected clients, in connection order, whenever any catalog changes.

use std::collections::HashMap;

use serde::Serialize;

use crate::mcp::client::Catalog;
use crate::mcp::config::NAMESPACE_SEPARATOR;
use crate::mcp::types::{McpTool, Prompt, Resource};

/// Build the namespaced name of `name` on `endpoint`.
///
/// # Examples
///
/// ```
/// use mcphub::mcp::registry::qualify;
///
/// assert_eq!(qualify("files", "read_file"), "files__read_file");
/// ```
pub fn qualify(endpoint: &str, name: &str) -> String {
    format!("{endpoint}{NAMESPACE_SEPARATOR}{name}")
}

/// Split a namespaced name into `(endpoint_id, name)`.
///
/// Endpoint ids cannot contain the separator, so the first occurrence
/// delimits the id.
///
/// # Examples
///
/// ```
/// use mcphub::mcp::registry::split_qualified;
///
/// assert_eq!(split_qualified("files__read__v2"), Some(("files", "read__v2")));
/// assert_eq!(split_qualified("plain"), None);
/// ```
pub fn split_qualified(qualified: &str) -> Option<(&str, &str)> {
    qualified
        .split_once(NAMESPACE_SEPARATOR)
        .filter(|(id, name)| !id.is_empty() && !name.is_empty())
}

/// A tool as exposed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    /// Namespaced name.
    pub name: String,
    /// Owning endpoint.
    pub endpoint_id: String,
    /// The endpoint's own definition, including its unqualified name.
    pub tool: McpTool,
}

impl ToolDescriptor {
    /// Description, if the endpoint supplied one.
    pub fn description(&self) -> Option<&str> {
        self.tool.description.as_deref()
    }

    /// JSON schema of the arguments.
    pub fn input_schema(&self) -> &serde_json::Value {
        &self.tool.input_schema
    }
}

/// A resource as exposed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDescriptor {
    /// Namespaced name.
    pub name: String,
    /// Owning endpoint.
    pub endpoint_id: String,
    /// The endpoint's own definition.
    pub resource: Resource,
}

impl ResourceDescriptor {
    /// The resource URI, unchanged from the endpoint.
    pub fn uri(&self) -> &str {
        &self.resource.uri
    }
}

/// A prompt template as exposed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptDescriptor {
    /// Namespaced name.
    pub name: String,
    /// Owning endpoint.
    pub endpoint_id: String,
    /// The endpoint's own definition.
    pub prompt: Prompt,
}

#[derive(Debug, Clone)]
struct Section<T> {
    entries: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T> Default for Section<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> Section<T> {
    fn insert(&mut self, name: String, entry: T) {
        if self.index.contains_key(&name) {
            tracing::debug!(name = %name, "duplicate registry entry ignored");
            return;
        }
        self.index.insert(name, self.entries.len());
        self.entries.push(entry);
    }

    fn get(&self, name: &str) -> Option<&T> {
        self.index.get(name).map(|&i| &self.entries[i])
    }
}

/// Point-in-time aggregate of every connected endpoint's catalog.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    tools: Section<ToolDescriptor>,
    resources: Section<ResourceDescriptor>,
    prompts: Section<PromptDescriptor>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from `(endpoint_id, catalog)` pairs.
    ///
    /// Pairs must be supplied in connection order; that order decides
    /// listing order and bare-URI resource ownership.
    pub fn build<'a, I>(sources: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a Catalog)>,
    {
        let mut registry = Self::new();
        for (endpoint, catalog) in sources {
            for tool in &catalog.tools {
                let name = qualify(endpoint, &tool.name);
                registry.tools.insert(
                    name.clone(),
                    ToolDescriptor {
                        name,
                        endpoint_id: endpoint.to_string(),
                        tool: tool.clone(),
                    },
                );
            }
            for resource in &catalog.resources {
                let name = qualify(endpoint, &resource.name);
                registry.resources.insert(
                    qualify(endpoint, &resource.uri),
                    ResourceDescriptor {
                        name,
                        endpoint_id: endpoint.to_string(),
                        resource: resource.clone(),
                    },
                );
            }
            for prompt in &catalog.prompts {
                let name = qualify(endpoint, &prompt.name);
                registry.prompts.insert(
                    name.clone(),
                    PromptDescriptor {
                        name,
                        endpoint_id: endpoint.to_string(),
                        prompt: prompt.clone(),
                    },
                );
            }
        }
        registry
    }

    /// All tools, in connection order.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools.entries
    }

    /// All resources, in connection order.
    pub fn resources(&self) -> &[ResourceDescriptor] {
        &self.resources.entries
    }

    /// All prompts, in connection order.
    pub fn prompts(&self) -> &[PromptDescriptor] {
        &self.prompts.entries
    }

    /// Look up a tool by namespaced name.
    pub fn tool(&self, qualified: &str) -> Option<&ToolDescriptor> {
        self.tools.get(qualified)
    }

    /// Look up a prompt by namespaced name.
    pub fn prompt(&self, qualified: &str) -> Option<&PromptDescriptor> {
        self.prompts.get(qualified)
    }

    /// Look up a resource by `"<endpoint>__<uri>"`, falling back to the
    /// first resource whose namespaced name matches.
    pub fn resource(&self, qualified: &str) -> Option<&ResourceDescriptor> {
        self.resources
            .get(qualified)
            .or_else(|| self.resources.entries.iter().find(|r| r.name == qualified))
    }

    /// Find the owner of `uri` among the entries accepted by `eligible`.
    ///
    /// Entries are tried in connection order, so the endpoint that
    /// connected earliest wins.
    pub fn resource_by_uri<F>(&self, uri: &str, mut eligible: F) -> Option<&ResourceDescriptor>
    where
        F: FnMut(&ResourceDescriptor) -> bool,
    {
        self.resources
            .entries
            .iter()
            .find(|r| r.resource.uri == uri && eligible(r))
    }

    /// `(tools, resources, prompts)` counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.tools.entries.len(),
            self.resources.entries.len(),
            self.prompts.entries.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::fake::tool;

    fn resource(uri: &str, name: &str) -> Resource {
        Resource {
            uri: uri.to_string(),
            name: name.to_string(),
            description: None,
            mime_type: None,
        }
    }

    fn catalog(tools: &[&str], resources: &[(&str, &str)]) -> Catalog {
        Catalog {
            tools: tools.iter().map(|t| tool(t)).collect(),
            resources: resources.iter().map(|(u, n)| resource(u, n)).collect(),
            prompts: Vec::new(),
        }
    }

    #[test]
    fn test_same_tool_name_on_two_endpoints_does_not_collide() {
        let a = catalog(&["search"], &[]);
        let b = catalog(&["search"], &[]);
        let registry = Registry::build([("a", &a), ("b", &b)]);
        let names: Vec<&str> = registry.tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a__search", "b__search"]);
        assert_eq!(registry.tool("b__search").unwrap().endpoint_id, "b");
        assert_eq!(registry.tool("b__search").unwrap().tool.name, "search");
        assert!(registry.tool("search").is_none());
    }

    #[test]
    fn test_bare_uri_lookup_prefers_earliest_connection() {
        let first = catalog(&[], &[("file:///shared", "shared")]);
        let second = catalog(&[], &[("file:///shared", "shared")]);
        let registry = Registry::build([("late", &second), ("early", &first)]);
        assert_eq!(
            registry
                .resource_by_uri("file:///shared", |_| true)
                .unwrap()
                .endpoint_id,
            "late"
        );

        let registry = Registry::build([("early", &first), ("late", &second)]);
        let found = registry.resource_by_uri("file:///shared", |_| true).unwrap();
        assert_eq!(found.endpoint_id, "early");
        let skipped = registry
            .resource_by_uri("file:///shared", |r| r.endpoint_id != "early")
            .unwrap();
        assert_eq!(skipped.endpoint_id, "late");
        assert!(registry.resource_by_uri("file:///other", |_| true).is_none());
    }

    #[test]
    fn test_resources_sharing_a_name_are_all_kept() {
        let docs = catalog(
            &[],
            &[("file:///a/README.md", "README.md"), ("file:///b/README.md", "README.md")],
        );
        let registry = Registry::build([("docs", &docs)]);
        assert_eq!(registry.resources().len(), 2);
        let b = registry
            .resource_by_uri("file:///b/README.md", |_| true)
            .unwrap();
        assert_eq!(b.endpoint_id, "docs");
        assert_eq!(b.name, "docs__README.md");
        assert_eq!(
            registry.resource("docs__file:///b/README.md").unwrap().uri(),
            "file:///b/README.md"
        );
        assert_eq!(
            registry.resource("docs__README.md").unwrap().uri(),
            "file:///a/README.md"
        );
    }

    #[test]
    fn test_duplicate_uri_on_one_endpoint_is_listed_once() {
        let a = catalog(&["x", "y"], &[("mem://1", "one"), ("mem://1", "again")]);
        let registry = Registry::build([("a", &a)]);
        assert_eq!(registry.counts(), (2, 1, 0));
        assert_eq!(Registry::new().counts(), (0, 0, 0));
    }

    #[test]
    fn test_split_qualified_rejects_empty_parts() {
        assert_eq!(split_qualified("__tool"), None);
        assert_eq!(split_qualified("files__"), None);
        assert_eq!(split_qualified("a__b"), Some(("a", "b")));
    }
}
