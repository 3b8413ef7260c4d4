//! Schema-driven compaction strategy.
//!
//! Applies the per-family retention rules while compaction walks cells in
//! key order: TTL-expired cells are dropped, versions beyond the family's
//! cap are dropped, and counter deltas are coalesced. Reads share the same
//! rules through [`CellFilter`], so a logically dead cell is invisible even
//! while it is still physically present.

use std::sync::{Arc, RwLock};

use crate::engine::key::ValueKind;
use crate::engine::strategy::{CompactionStrategy, StrategyFactory};
use crate::schema::TableSchema;
use crate::tablet::cell::{now_micros, CellKey};

/// A schema update swaps the inner `Arc`; strategies created afterwards see
/// the new rules while in-flight walks keep the schema they started with.
pub struct SchemaStrategyFactory {
    schema: RwLock<Arc<TableSchema>>,
}

impl SchemaStrategyFactory {
    pub fn new(schema: TableSchema) -> Arc<Self> {
        Arc::new(Self {
            schema: RwLock::new(Arc::new(schema)),
        })
    }

    pub fn update_schema(&self, schema: TableSchema) {
        *self.schema.write().unwrap() = Arc::new(schema);
    }

    pub fn schema(&self) -> Arc<TableSchema> {
        self.schema.read().unwrap().clone()
    }
}

impl StrategyFactory for SchemaStrategyFactory {
    fn name(&self) -> &'static str {
        "schema"
    }

    fn create(&self) -> Box<dyn CompactionStrategy> {
        Box::new(SchemaStrategy {
            filter: CellFilter::new(self.schema()),
        })
    }
}

struct SchemaStrategy {
    filter: CellFilter,
}

impl CompactionStrategy for SchemaStrategy {
    fn drop_cell(&mut self, raw_key: &[u8], kind: ValueKind, _value: &[u8]) -> bool {
        if kind == ValueKind::Deletion {
            // Tombstone lifetime is the engine's business.
            return false;
        }
        self.filter.is_dead(raw_key)
    }

    fn expiry_of(&mut self, raw_key: &[u8]) -> Option<u64> {
        let cell = CellKey::decode(raw_key).ok()?;
        let ttl = self.filter.schema.family(&cell.family)?.ttl_secs;
        (ttl > 0).then(|| cell.timestamp + ttl * 1_000_000)
    }

    fn merge_atomics(&self) -> bool {
        true
    }
}

/// Stateful per-walk retention filter, shared by compaction and reads.
/// Cells must arrive in cell-key order (family, qualifier, timestamp
/// descending within a row).
pub struct CellFilter {
    schema: Arc<TableSchema>,
    now: u64,
    current_cell: Option<(Vec<u8>, String, Vec<u8>)>,
    versions_seen: u32,
}

impl CellFilter {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        Self {
            schema,
            now: now_micros(),
            current_cell: None,
            versions_seen: 0,
        }
    }

    /// True when the cell is expired, past its version cap, or belongs to a
    /// family the schema no longer knows.
    pub fn is_dead(&mut self, raw_key: &[u8]) -> bool {
        let cell = match CellKey::decode(raw_key) {
            Ok(cell) => cell,
            Err(_) => return false,
        };
        let family = match self.schema.family(&cell.family) {
            Some(family) => family,
            None => return true,
        };

        let ident = (cell.row, cell.family.clone(), cell.qualifier);
        if self.current_cell.as_ref() != Some(&ident) {
            self.current_cell = Some(ident);
            self.versions_seen = 0;
        }
        self.versions_seen += 1;

        if family.max_versions > 0 && self.versions_seen > family.max_versions {
            return true;
        }
        if family.ttl_secs > 0 && cell.timestamp + family.ttl_secs * 1_000_000 < self.now {
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnFamily, LocalityGroup};

    fn schema() -> TableSchema {
        TableSchema::new("t").locality_group(
            LocalityGroup::new("lg")
                .family(ColumnFamily::new("versioned").max_versions(2))
                .family(ColumnFamily::new("expiring").ttl_secs(60)),
        )
    }

    #[test]
    fn test_version_cap() {
        let mut filter = CellFilter::new(Arc::new(schema()));
        let now = now_micros();
        for (i, expect_dead) in [(0u64, false), (1, false), (2, true), (3, true)] {
            let key = CellKey::new(b"r", "versioned", b"q", now - i).encode();
            assert_eq!(filter.is_dead(&key), expect_dead, "version {}", i);
        }
        // A different qualifier resets the count.
        let key = CellKey::new(b"r", "versioned", b"q2", now).encode();
        assert!(!filter.is_dead(&key));
    }

    #[test]
    fn test_ttl_expiry() {
        let mut filter = CellFilter::new(Arc::new(schema()));
        let now = now_micros();

        let fresh = CellKey::new(b"r", "expiring", b"q", now).encode();
        assert!(!filter.is_dead(&fresh));

        let stale = CellKey::new(b"r", "expiring", b"q2", now - 120 * 1_000_000).encode();
        assert!(filter.is_dead(&stale));
    }

    #[test]
    fn test_unknown_family_dropped() {
        let mut filter = CellFilter::new(Arc::new(schema()));
        let key = CellKey::new(b"r", "ghost", b"q", now_micros()).encode();
        assert!(filter.is_dead(&key));
    }

    #[test]
    fn test_factory_sees_schema_updates() {
        let factory = SchemaStrategyFactory::new(schema());
        let mut updated = schema();
        updated.locality_groups[0].families[0].max_versions = 1;
        factory.update_schema(updated);

        let mut strategy = factory.create();
        let now = now_micros();
        let first = CellKey::new(b"r", "versioned", b"q", now).encode();
        let second = CellKey::new(b"r", "versioned", b"q", now - 1).encode();
        assert!(!strategy.drop_cell(&first, ValueKind::Value, b""));
        assert!(strategy.drop_cell(&second, ValueKind::Value, b""));
    }
}
