use serde::{Deserialize, Serialize};

use crate::errinput;
use crate::error::Result;

/// Per-family retention and storage options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFamily {
    pub name: String,
    /// Versions kept per cell; older versions beyond this are dropped by
    /// compaction and hidden from reads.
    pub max_versions: u32,
    /// Time-to-live in seconds. Zero means no expiry.
    pub ttl_secs: u64,
}

impl ColumnFamily {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_versions: 1,
            ttl_secs: 0,
        }
    }

    pub fn max_versions(mut self, n: u32) -> Self {
        self.max_versions = n;
        self
    }

    pub fn ttl_secs(mut self, secs: u64) -> Self {
        self.ttl_secs = secs;
        self
    }
}

/// Block compression selector for a locality group. Only the identity codec
/// is wired in; the block trailer reserves a byte for the codec id so adding
/// one is a format-compatible change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
}

/// A named set of column families co-stored in one LSM engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalityGroup {
    pub name: String,
    pub families: Vec<ColumnFamily>,
    pub compression: Compression,
    /// Bloom filter block emitted per SSTable when set.
    pub bloom_filter: bool,
    /// Hash-shard the memtable across this many skip lists. 1 means the
    /// plain single-list memtable.
    pub memtable_shards: usize,
}

impl LocalityGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            families: Vec::new(),
            compression: Compression::None,
            bloom_filter: true,
            memtable_shards: 1,
        }
    }

    pub fn family(mut self, cf: ColumnFamily) -> Self {
        self.families.push(cf);
        self
    }

    pub fn bloom_filter(mut self, on: bool) -> Self {
        self.bloom_filter = on;
        self
    }

    pub fn memtable_shards(mut self, shards: usize) -> Self {
        self.memtable_shards = shards.max(1);
        self
    }
}

/// A table's schema: locality groups and their family options. Mutable in
/// place through `Update`; engines pick up the new values at their next
/// background iteration boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_name: String,
    pub locality_groups: Vec<LocalityGroup>,
}

impl TableSchema {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            locality_groups: Vec::new(),
        }
    }

    pub fn locality_group(mut self, lg: LocalityGroup) -> Self {
        self.locality_groups.push(lg);
        self
    }

    /// A loadable schema names at least one locality group, and no family
    /// appears in two groups.
    pub fn validate(&self) -> Result<()> {
        if self.locality_groups.is_empty() {
            return Err(errinput!(
                "schema for {:?} has no locality groups",
                self.table_name
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for lg in &self.locality_groups {
            for cf in &lg.families {
                if !seen.insert(cf.name.as_str()) {
                    return Err(errinput!(
                        "column family {:?} appears in more than one locality group",
                        cf.name
                    ));
                }
            }
        }
        Ok(())
    }

    /// Locality group index owning the given column family, if any.
    pub fn group_of(&self, family: &str) -> Option<usize> {
        self.locality_groups
            .iter()
            .position(|lg| lg.families.iter().any(|cf| cf.name == family))
    }

    /// Family options, looked up across all groups.
    pub fn family(&self, family: &str) -> Option<&ColumnFamily> {
        self.locality_groups
            .iter()
            .flat_map(|lg| lg.families.iter())
            .find(|cf| cf.name == family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TableSchema {
        TableSchema::new("webtable")
            .locality_group(
                LocalityGroup::new("default")
                    .family(ColumnFamily::new("contents").max_versions(3))
                    .family(ColumnFamily::new("meta").ttl_secs(86400)),
            )
            .locality_group(LocalityGroup::new("anchors").family(ColumnFamily::new("anchor")))
    }

    #[test]
    fn test_validate_and_lookup() -> Result<()> {
        let schema = sample();
        schema.validate()?;
        assert_eq!(schema.group_of("anchor"), Some(1));
        assert_eq!(schema.group_of("contents"), Some(0));
        assert_eq!(schema.group_of("nope"), None);
        assert_eq!(schema.family("contents").unwrap().max_versions, 3);
        Ok(())
    }

    #[test]
    fn test_rejects_empty_and_duplicate() {
        assert!(TableSchema::new("t").validate().is_err());

        let dup = TableSchema::new("t")
            .locality_group(LocalityGroup::new("a").family(ColumnFamily::new("cf")))
            .locality_group(LocalityGroup::new("b").family(ColumnFamily::new("cf")));
        assert!(dup.validate().is_err());
    }
}
