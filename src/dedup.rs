//! Session-wide de-duplication of catalog items.
//!
//! Every path that appends an item to a session's results goes through
//! [`DedupIndex::admit`], whichever strategy produced the item. The set
//! lives exactly as long as one harvest session.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::models::CatalogItem;

/// Set of item identifiers already emitted in this session.
#[derive(Debug, Default)]
pub struct DedupIndex {
    seen: Mutex<HashSet<String>>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    /// Record `id`. Returns `true` if it was not seen before.
    pub fn mark(&self, id: &str) -> bool {
        self.lock().insert(id.to_string())
    }

    /// Check-and-mark in one locked step. Returns the item back when it is
    /// new, `None` when it is a duplicate.
    pub fn admit(&self, item: CatalogItem) -> Option<CatalogItem> {
        if self.mark(&item.id) {
            Some(item)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // A poisoned set is still a valid set of ids.
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(id: &str) -> CatalogItem {
        CatalogItem {
            id: id.to_string(),
            sku: None,
            name: None,
            url: format!("https://shop.example/{}", id),
            price: None,
            brand: "B".to_string(),
            in_stock: None,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn test_mark_then_seen() {
        let index = DedupIndex::new();
        assert!(!index.seen("a"));
        assert!(index.mark("a"));
        assert!(index.seen("a"));
        assert!(!index.mark("a"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_admit_rejects_duplicates() {
        let index = DedupIndex::new();
        assert!(index.admit(item("1")).is_some());
        assert!(index.admit(item("2")).is_some());
        assert!(index.admit(item("1")).is_none());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_shared_across_threads() {
        let index = std::sync::Arc::new(DedupIndex::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let index = index.clone();
                std::thread::spawn(move || (0..100).filter(|i| index.mark(&i.to_string())).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
        assert_eq!(index.len(), 100);
    }
}
