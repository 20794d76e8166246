//! Tool/prompt/resource registry.
//!
//! Maps qualified names (`<serverName>/<localName>`) to capability
//! descriptors published by connected backend servers, plus a reverse index
//! from server id to the set of qualified names it owns. The registry never
//! stores a backend client handle itself — only the server id — so its
//! lifetime is independent of [`crate::pool::ConnectionPool`] (see §3
//! "Ownership" in the design notes).

use std::collections::HashSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of capability a [`CapabilityEntry`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Prompt,
    Resource,
}

/// A single registered tool, prompt, or resource.
///
/// The qualified name (`server_name/local_name`) is the registry's primary
/// key; `local_name` and `server_name` are kept alongside so search and
/// bare-name lookup don't need to re-split the qualified string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityEntry {
    pub qualified_name: String,
    pub local_name: String,
    pub server_name: String,
    pub server_id: Uuid,
    pub kind: CapabilityKind,
    pub description: String,
    /// JSON schema (tools) or argument schema (prompts); opaque to the registry.
    pub input_schema: serde_json::Value,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

impl CapabilityEntry {
    pub fn qualify(server_name: &str, local_name: &str) -> String {
        format!("{}/{}", server_name, local_name)
    }
}

/// Filters and pagination for [`Registry::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub kind: Option<CapabilityKind>,
    pub query: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub server_id: Option<Uuid>,
    pub offset: usize,
    pub limit: usize,
}

/// A page of search results plus the total matching count (pre-pagination).
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub items: Vec<CapabilityEntry>,
    pub total: usize,
}

/// Namespaced index of backend capabilities.
///
/// Single-writer-per-server-id semantics are provided by `DashMap`'s
/// per-shard locking: concurrent `register_server` calls for distinct
/// server ids never contend, matching §5's "readers lock-free... or RW
/// locks as the implementation chooses" guidance.
#[derive(Debug, Default)]
pub struct Registry {
    entries: DashMap<String, CapabilityEntry>,
    by_server: DashMap<Uuid, HashSet<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) one capability entry, updating the reverse index.
    pub fn upsert(&self, entry: CapabilityEntry) {
        self.by_server
            .entry(entry.server_id)
            .or_default()
            .insert(entry.qualified_name.clone());
        self.entries.insert(entry.qualified_name.clone(), entry);
    }

    /// Register every capability a server publishes in one call; entries
    /// for that server not present in `entries` are removed first so a
    /// re-register reflects the backend's current catalog exactly.
    pub fn register_server(&self, server_id: Uuid, entries: Vec<CapabilityEntry>) {
        self.unregister_server(server_id);
        for entry in entries {
            self.upsert(entry);
        }
    }

    /// Remove every entry owned by `server_id`.
    pub fn unregister_server(&self, server_id: Uuid) {
        if let Some((_, names)) = self.by_server.remove(&server_id) {
            for name in names {
                self.entries.remove(&name);
            }
        }
    }

    /// Look up by fully qualified name, or, if `name_or_local` has no `/`,
    /// by the unique entry ending in `/<name>`. Ambiguous bare names return
    /// the first-registered match (insertion order is not tracked, so in
    /// practice this is "some" match) per §9's documented undefined
    /// behavior; callers SHOULD qualify.
    pub fn find(&self, name_or_local: &str) -> Option<CapabilityEntry> {
        if let Some(entry) = self.entries.get(name_or_local) {
            return Some(entry.clone());
        }
        let suffix = format!("/{}", name_or_local);
        self.entries
            .iter()
            .find(|kv| kv.key().ends_with(&suffix))
            .map(|kv| kv.value().clone())
    }

    /// Substring search over name/description/server name, with filters.
    pub fn search(&self, opts: &SearchOptions) -> SearchPage {
        let query_lower = opts.query.as_ref().map(|q| q.to_lowercase());

        let mut matches: Vec<CapabilityEntry> = self
            .entries
            .iter()
            .filter(|kv| {
                let e = kv.value();
                if let Some(kind) = opts.kind {
                    if e.kind != kind {
                        return false;
                    }
                }
                if let Some(server_id) = opts.server_id {
                    if e.server_id != server_id {
                        return false;
                    }
                }
                if let Some(category) = &opts.category {
                    if e.category.as_deref() != Some(category.as_str()) {
                        return false;
                    }
                }
                if !opts.tags.is_empty() && !opts.tags.iter().any(|t| e.tags.contains(t)) {
                    return false;
                }
                if let Some(q) = &query_lower {
                    let haystack = format!(
                        "{} {} {}",
                        e.local_name.to_lowercase(),
                        e.description.to_lowercase(),
                        e.server_name.to_lowercase()
                    );
                    if !haystack.contains(q.as_str()) {
                        return false;
                    }
                }
                true
            })
            .map(|kv| kv.value().clone())
            .collect();

        matches.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        let total = matches.len();

        let limit = if opts.limit == 0 { total } else { opts.limit };
        let page = matches
            .into_iter()
            .skip(opts.offset)
            .take(limit)
            .collect();

        SearchPage { items: page, total }
    }

    pub fn server_capability_count(&self, server_id: Uuid) -> usize {
        self.by_server.get(&server_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(server_id: Uuid, server: &str, local: &str, kind: CapabilityKind) -> CapabilityEntry {
        CapabilityEntry {
            qualified_name: CapabilityEntry::qualify(server, local),
            local_name: local.to_string(),
            server_name: server.to_string(),
            server_id,
            kind,
            description: format!("{local} does things"),
            input_schema: serde_json::json!({}),
            category: Some("files".to_string()),
            tags: vec!["io".to_string()],
            registered_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn qualified_lookup_and_bare_lookup() {
        let registry = Registry::new();
        let sid = Uuid::now_v7();
        registry.upsert(entry(sid, "fs", "read", CapabilityKind::Tool));

        assert!(registry.find("fs/read").is_some());
        assert!(registry.find("read").is_some());
        assert!(registry.find("missing").is_none());
    }

    #[test]
    fn register_server_replaces_prior_catalog() {
        let registry = Registry::new();
        let sid = Uuid::now_v7();
        registry.register_server(
            sid,
            vec![
                entry(sid, "fs", "read", CapabilityKind::Tool),
                entry(sid, "fs", "write", CapabilityKind::Tool),
            ],
        );
        assert_eq!(registry.server_capability_count(sid), 2);

        registry.register_server(sid, vec![entry(sid, "fs", "read", CapabilityKind::Tool)]);
        assert_eq!(registry.server_capability_count(sid), 1);
        assert!(registry.find("fs/write").is_none());
    }

    #[test]
    fn unregister_server_removes_all_entries() {
        let registry = Registry::new();
        let sid = Uuid::now_v7();
        registry.register_server(sid, vec![entry(sid, "fs", "read", CapabilityKind::Tool)]);
        registry.unregister_server(sid);

        assert!(registry.is_empty());
        assert_eq!(registry.server_capability_count(sid), 0);
    }

    #[test]
    fn search_filters_by_query_and_category() {
        let registry = Registry::new();
        let sid = Uuid::now_v7();
        registry.register_server(
            sid,
            vec![
                entry(sid, "fs", "read", CapabilityKind::Tool),
                entry(sid, "mem", "store", CapabilityKind::Tool),
            ],
        );

        let page = registry.search(&SearchOptions {
            query: Some("read".to_string()),
            ..Default::default()
        });
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].qualified_name, "fs/read");
    }

    #[test]
    fn search_pagination() {
        let registry = Registry::new();
        let sid = Uuid::now_v7();
        for i in 0..5 {
            registry.upsert(entry(sid, "fs", &format!("tool{i}"), CapabilityKind::Tool));
        }

        let page = registry.search(&SearchOptions {
            offset: 2,
            limit: 2,
            ..Default::default()
        });
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
    }
}
