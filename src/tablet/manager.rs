//! Registry of live tablets on this server.
//!
//! An ordered map from `(table_name, key_start)` to the tablet, so locating
//! the owner of a key is one range probe. Insertion rejects overlapping
//! ranges: exactly one tablet per `(table, range)` may be `Ready` at a
//! time. Callers receive a counted handle; dropping it releases the
//! reference the manager took on their behalf.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use crate::errinput;
use crate::error::{Error, Result};
use crate::tablet::Tablet;

/// Reference-counted loan of a tablet. Operations hold one for their whole
/// duration, which is what `Unloading2` waits out.
pub struct TabletHandle {
    tablet: Arc<Tablet>,
}

impl TabletHandle {
    fn new(tablet: Arc<Tablet>) -> Self {
        tablet.add_ref();
        Self { tablet }
    }

    pub fn tablet(&self) -> &Arc<Tablet> {
        &self.tablet
    }
}

impl Deref for TabletHandle {
    type Target = Tablet;

    fn deref(&self) -> &Tablet {
        &self.tablet
    }
}

impl Drop for TabletHandle {
    fn drop(&mut self) {
        self.tablet.dec_ref();
    }
}

#[derive(Default)]
pub struct TabletManager {
    tablets: Mutex<BTreeMap<(String, Vec<u8>), Arc<Tablet>>>,
}

impl TabletManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tablet; overlap with any existing range of the same table
    /// is rejected.
    pub fn add(&self, tablet: Arc<Tablet>) -> Result<()> {
        let mut tablets = self.tablets.lock().unwrap();
        let id = tablet.id();
        for ((table, _), existing) in tablets.iter() {
            if table != &id.table_name {
                continue;
            }
            let other = existing.id();
            let disjoint = (!id.key_end.is_empty() && id.key_end <= other.key_start)
                || (!other.key_end.is_empty() && other.key_end <= id.key_start);
            if !disjoint {
                return Err(errinput!(
                    "tablet range overlaps existing [{:?}, {:?})",
                    other.key_start,
                    other.key_end
                ));
            }
        }
        tablets.insert((id.table_name.clone(), id.key_start.clone()), tablet);
        Ok(())
    }

    pub fn remove(&self, table: &str, key_start: &[u8]) -> Option<Arc<Tablet>> {
        self.tablets
            .lock()
            .unwrap()
            .remove(&(table.to_string(), key_start.to_vec()))
    }

    /// The unique tablet of `table` whose range contains `row`.
    pub fn get_tablet(&self, table: &str, row: &[u8]) -> Result<TabletHandle> {
        let tablets = self.tablets.lock().unwrap();
        let upper = (table.to_string(), row.to_vec());
        let candidate = tablets
            .range(..=upper)
            .next_back()
            .filter(|((t, _), _)| t == table)
            .map(|(_, tablet)| tablet.clone());
        match candidate {
            Some(tablet) if tablet.id().contains_row(row) => Ok(TabletHandle::new(tablet)),
            _ => Err(Error::NotInRange),
        }
    }

    /// Exact-range lookup for control operations.
    pub fn get_exact(&self, table: &str, key_start: &[u8]) -> Result<TabletHandle> {
        self.tablets
            .lock()
            .unwrap()
            .get(&(table.to_string(), key_start.to_vec()))
            .cloned()
            .map(TabletHandle::new)
            .ok_or(Error::NotInRange)
    }

    pub fn list(&self) -> Vec<Arc<Tablet>> {
        self.tablets.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tablets.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tablets.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfs::LocalDfs;
    use crate::engine::sstable::TableCache;
    use crate::schema::{ColumnFamily, LocalityGroup, TableSchema};
    use crate::tablet::TabletId;
    use std::collections::HashSet;

    fn make_tablet(dir: &std::path::Path, table: &str, start: &[u8], end: &[u8]) -> Arc<Tablet> {
        let dfs = LocalDfs::new();
        let table_cache = Arc::new(TableCache::new(dfs.clone(), 16, None));
        Tablet::load(
            dfs,
            table_cache,
            TabletId {
                table_name: table.into(),
                key_start: start.to_vec(),
                key_end: end.to_vec(),
                create_time: 0,
                version: 1,
                parents: vec![],
            },
            dir.to_path_buf(),
            TableSchema::new(table)
                .locality_group(LocalityGroup::new("lg").family(ColumnFamily::new("cf"))),
            vec![],
            &HashSet::new(),
            vec![],
            vec![],
            false,
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_routing_by_row() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = TabletManager::new();
        manager.add(make_tablet(&dir.path().join("a"), "t", b"", b"m"))?;
        manager.add(make_tablet(&dir.path().join("b"), "t", b"m", b""))?;

        assert_eq!(manager.get_tablet("t", b"apple")?.id().key_end, b"m");
        assert_eq!(manager.get_tablet("t", b"m")?.id().key_start, b"m");
        assert_eq!(manager.get_tablet("t", b"zebra")?.id().key_start, b"m");
        assert!(manager.get_tablet("other", b"apple").is_err());
        Ok(())
    }

    #[test]
    fn test_overlap_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = TabletManager::new();
        manager.add(make_tablet(&dir.path().join("a"), "t", b"c", b"p"))?;

        let overlap = make_tablet(&dir.path().join("b"), "t", b"m", b"z");
        assert!(manager.add(overlap).is_err());

        // Same range on a different table is fine.
        manager.add(make_tablet(&dir.path().join("c"), "u", b"m", b"z"))?;
        assert_eq!(manager.len(), 2);
        Ok(())
    }

    #[test]
    fn test_handle_refcounts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = TabletManager::new();
        manager.add(make_tablet(&dir.path().join("a"), "t", b"", b""))?;

        let handle = manager.get_tablet("t", b"row")?;
        assert_eq!(handle.ref_count(), 1);
        {
            let second = manager.get_tablet("t", b"row")?;
            assert_eq!(second.ref_count(), 2);
        }
        assert_eq!(handle.ref_count(), 1);
        drop(handle);

        let tablet = manager.remove("t", b"").unwrap();
        assert_eq!(tablet.ref_count(), 0);
        Ok(())
    }

    #[test]
    fn test_row_outside_all_ranges() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = TabletManager::new();
        manager.add(make_tablet(&dir.path().join("a"), "t", b"f", b"m"))?;

        assert!(matches!(
            manager.get_tablet("t", b"a"),
            Err(Error::NotInRange)
        ));
        assert!(matches!(
            manager.get_tablet("t", b"z"),
            Err(Error::NotInRange)
        ));
        Ok(())
    }
}
