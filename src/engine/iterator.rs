//! Merging of sorted internal-key streams.
//!
//! A min-heap ranks the head entry of each source by internal-key order, so
//! the merged stream yields every version of every key: newest version
//! first within a key, sources tie-broken by index (lower index = newer
//! source). Nothing is deduplicated here; snapshot filtering, version caps
//! and tombstone handling are the consumer's job.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::engine::key::InternalKey;
use crate::error::Result;

/// A sorted stream of internal-key entries.
pub type EngineIter = Box<dyn Iterator<Item = Result<(InternalKey, Vec<u8>)>> + Send>;

struct HeapEntry {
    key: InternalKey,
    value: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behaviour; equal keys prefer the newer
        // (lower-indexed) source.
        match self.key.cmp(&other.key) {
            Ordering::Equal => other.source.cmp(&self.source),
            ord => ord.reverse(),
        }
    }
}

pub struct MergeIter {
    sources: Vec<EngineIter>,
    heap: BinaryHeap<HeapEntry>,
    failed: Option<crate::error::Error>,
}

impl MergeIter {
    pub fn new(mut sources: Vec<EngineIter>) -> Self {
        let mut heap = BinaryHeap::new();
        let mut failed = None;
        for (source, iter) in sources.iter_mut().enumerate() {
            match iter.next() {
                Some(Ok((key, value))) => heap.push(HeapEntry { key, value, source }),
                Some(Err(e)) => failed = Some(e),
                None => {}
            }
        }
        Self {
            sources,
            heap,
            failed,
        }
    }
}

impl Iterator for MergeIter {
    type Item = Result<(InternalKey, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.failed.take() {
            self.heap.clear();
            return Some(Err(err));
        }
        let entry = self.heap.pop()?;
        match self.sources[entry.source].next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry {
                key,
                value,
                source: entry.source,
            }),
            Some(Err(e)) => self.failed = Some(e),
            None => {}
        }
        Some(Ok((entry.key, entry.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::key::ValueKind;

    fn source(entries: Vec<(&[u8], u64)>) -> EngineIter {
        let items: Vec<Result<(InternalKey, Vec<u8>)>> = entries
            .into_iter()
            .map(|(raw, seq)| {
                Ok((
                    InternalKey::new(raw.to_vec(), seq, ValueKind::Value),
                    seq.to_be_bytes().to_vec(),
                ))
            })
            .collect();
        Box::new(items.into_iter())
    }

    #[test]
    fn test_merge_preserves_all_versions() {
        let merged = MergeIter::new(vec![
            source(vec![(b"a", 9), (b"c", 2)]),
            source(vec![(b"a", 4), (b"b", 7)]),
        ]);
        let keys: Vec<(Vec<u8>, u64)> = merged
            .map(|r| {
                let (k, _) = r.unwrap();
                (k.raw_key.clone(), k.sequence)
            })
            .collect();
        assert_eq!(
            keys,
            vec![
                (b"a".to_vec(), 9),
                (b"a".to_vec(), 4),
                (b"b".to_vec(), 7),
                (b"c".to_vec(), 2),
            ]
        );
    }

    #[test]
    fn test_merge_empty_sources() {
        let merged = MergeIter::new(vec![source(vec![]), source(vec![(b"x", 1)])]);
        assert_eq!(merged.count(), 1);
        assert_eq!(MergeIter::new(Vec::new()).count(), 0);
    }

    #[test]
    fn test_error_propagates_and_stops() {
        let bad: EngineIter = Box::new(
            vec![
                Ok((InternalKey::new(b"a".to_vec(), 1, ValueKind::Value), vec![])),
                Err(crate::errcorrupt!("boom")),
            ]
            .into_iter(),
        );
        let merged = MergeIter::new(vec![bad]);
        let results: Vec<_> = merged.collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
