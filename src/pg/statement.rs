//! Prepared statement management and caching.
//!
//! This module provides:
//! - `PreparedStatement`: a server-side statement with its described types
//! - `StatementCache`: per-connection LRU keyed by SQL text
//!
//! Statement handles are scoped to the connection that parsed them, so the
//! cache lives inside `PgConnection` and dies with it.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::protocol::{FieldDescription, Format};
use super::types::Oid;

/// Column descriptions shared between a statement and every row it produces.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

// ============================================================================
// Prepared Statement
// ============================================================================

/// A statement parsed by the server and described with Describe('S').
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-side name; empty for the unnamed statement
    pub name: String,
    pub query: String,
    /// Parameter types from ParameterDescription
    pub param_types: Vec<Oid>,
    /// Result columns from RowDescription (empty for NoData)
    pub columns: SharedColumns,
    /// Per-column result format requested in Bind
    pub result_formats: Vec<Format>,
}

impl PreparedStatement {
    pub fn new(
        name: String,
        query: String,
        param_types: Vec<Oid>,
        columns: Vec<FieldDescription>,
    ) -> Self {
        let result_formats = columns
            .iter()
            .map(|c| {
                if c.type_oid.has_binary_decoder() {
                    Format::Binary
                } else {
                    Format::Text
                }
            })
            .collect();
        Self {
            name,
            query,
            param_types,
            columns: Arc::new(columns),
            result_formats,
        }
    }

    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Column descriptions as they will arrive, with the requested formats applied.
    pub fn bound_columns(&self) -> SharedColumns {
        if self
            .columns
            .iter()
            .zip(&self.result_formats)
            .all(|(c, f)| c.format == *f)
        {
            return Arc::clone(&self.columns);
        }
        Arc::new(
            self.columns
                .iter()
                .zip(&self.result_formats)
                .map(|(c, f)| FieldDescription {
                    format: *f,
                    ..c.clone()
                })
                .collect(),
        )
    }
}

// ============================================================================
// Statement Cache (O(1) LRU)
// ============================================================================

/// LRU cache of prepared statements for one connection.
///
/// Evicted and invalidated statements are queued for a Close message that the
/// connection pipelines ahead of its next Sync.
pub struct StatementCache {
    cache: Option<LruCache<String, Arc<PreparedStatement>>>,
    next_id: u64,
    pending_close: Vec<String>,
}

impl StatementCache {
    /// A capacity of zero disables caching: every query uses the unnamed statement.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: NonZeroUsize::new(capacity).map(LruCache::new),
            next_id: 0,
            pending_close: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Look up a statement and mark it recently used.
    pub fn get(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.as_mut()?.get(query).map(Arc::clone)
    }

    pub fn contains(&self, query: &str) -> bool {
        self.cache.as_ref().is_some_and(|c| c.contains(query))
    }

    /// Insert a statement. Returns the name of the statement evicted to make
    /// room, which is also queued for closing.
    pub fn insert(&mut self, statement: Arc<PreparedStatement>) -> Option<String> {
        let cache = self.cache.as_mut()?;
        let name = statement.name.clone();
        // push returns either the replaced entry for this key or the LRU victim
        let evicted = cache
            .push(statement.query.clone(), statement)
            .map(|(_, old)| old.name.clone())
            .filter(|old| *old != name);
        if let Some(ref name) = evicted {
            tracing::debug!(statement = %name, "Evicting prepared statement");
            self.pending_close.push(name.clone());
        }
        evicted
    }

    /// Drop a statement the server no longer recognises (or whose plan
    /// changed result type) and queue it for closing.
    pub fn invalidate(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        let removed = self.cache.as_mut()?.pop(query)?;
        self.pending_close.push(removed.name.clone());
        Some(removed)
    }

    /// Queue a statement prepared outside the cache for closing.
    pub fn queue_close(&mut self, name: String) {
        self.pending_close.push(name);
    }

    /// Statements waiting for a Close message.
    pub fn take_pending_close(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_close)
    }

    pub fn has_pending_close(&self) -> bool {
        !self.pending_close.is_empty()
    }

    pub fn next_statement_name(&mut self) -> String {
        self.next_id += 1;
        format!("pgkit_s{}", self.next_id)
    }

    pub fn len(&self) -> usize {
        self.cache.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything without closing anything on the server. Used once the
    /// server side is gone (connection closed).
    pub fn clear(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
        self.pending_close.clear();
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(name: &str, query: &str) -> Arc<PreparedStatement> {
        Arc::new(PreparedStatement::new(
            name.to_string(),
            query.to_string(),
            vec![],
            vec![],
        ))
    }

    fn column(name: &str, oid: Oid) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid: oid,
            type_size: -1,
            type_modifier: -1,
            format: Format::Text,
        }
    }

    #[test]
    fn test_result_formats_follow_decoders() {
        let s = PreparedStatement::new(
            "s".to_string(),
            "SELECT id, price FROM t".to_string(),
            vec![],
            vec![column("id", Oid::INT4), column("price", Oid::NUMERIC)],
        );
        assert_eq!(s.result_formats, vec![Format::Binary, Format::Text]);
        let bound = s.bound_columns();
        assert_eq!(bound[0].format, Format::Binary);
        assert_eq!(bound[1].format, Format::Text);
        assert!(s.returns_rows());
    }

    #[test]
    fn test_cache_basic_operations() {
        let mut cache = StatementCache::new(10);
        assert!(cache.is_empty());

        assert_eq!(cache.insert(stmt("s1", "SELECT 1")), None);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("SELECT 1"));
        assert_eq!(cache.get("SELECT 1").unwrap().name, "s1");
        assert!(cache.get("SELECT 2").is_none());
    }

    #[test]
    fn test_lru_eviction_queues_close() {
        let mut cache = StatementCache::new(2);
        cache.insert(stmt("s1", "q1"));
        cache.insert(stmt("s2", "q2"));
        cache.get("q1");

        let evicted = cache.insert(stmt("s3", "q3"));
        assert_eq!(evicted, Some("s2".to_string()));
        assert!(cache.get("q2").is_none());
        assert!(cache.get("q1").is_some());
        assert_eq!(cache.take_pending_close(), vec!["s2".to_string()]);
        assert!(!cache.has_pending_close());
    }

    #[test]
    fn test_replacing_same_query_closes_old_handle() {
        let mut cache = StatementCache::new(2);
        cache.insert(stmt("s1", "q1"));
        let evicted = cache.insert(stmt("s2", "q1"));
        assert_eq!(evicted, Some("s1".to_string()));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("q1").unwrap().name, "s2");
    }

    #[test]
    fn test_invalidate() {
        let mut cache = StatementCache::new(10);
        cache.insert(stmt("s1", "q1"));
        assert_eq!(cache.invalidate("q1").unwrap().name, "s1");
        assert!(cache.get("q1").is_none());
        assert_eq!(cache.take_pending_close(), vec!["s1".to_string()]);
        assert!(cache.invalidate("q1").is_none());
    }

    #[test]
    fn test_disabled_cache() {
        let mut cache = StatementCache::new(0);
        assert!(!cache.is_enabled());
        assert_eq!(cache.insert(stmt("s1", "q1")), None);
        assert!(cache.get("q1").is_none());
    }

    #[test]
    fn test_unique_statement_names() {
        let mut cache = StatementCache::new(10);
        let names: std::collections::HashSet<String> =
            (0..10).map(|_| cache.next_statement_name()).collect();
        assert_eq!(names.len(), 10);
        assert!(names.iter().all(|n| n.starts_with("pgkit_s")));
    }
}
