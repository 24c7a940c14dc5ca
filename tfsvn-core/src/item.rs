//! Content item tree shared between the prefetch worker and consumers
//!
//! The upstream metadata layer builds one tree per request (folders, files,
//! and tombstones at a target revision) and hands it to the prefetch loader.
//! The loader is the only writer of an item's load state; a consumer is the
//! only taker. Child order is insertion order and doubles as the pipeline's
//! processing order.

use std::sync::{Arc, Mutex};

use crate::svndiff;

/// What kind of versioned entry an item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Folder,
    /// Deletion marker. Carries no content and must never be fetched.
    Tombstone,
}

/// The codec output for one file: the base64 svndiff stream plus the md5 of
/// the raw content (hex-lower, 32 chars).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub base64: String,
    pub md5: String,
}

impl EncodedPayload {
    /// Encode raw file bytes into the wire payload the gateway transmits.
    pub fn encode(raw: &[u8]) -> Self {
        Self {
            base64: svndiff::encode_chunked_base64(raw),
            md5: format!("{:x}", md5::compute(raw)),
        }
    }

    /// Bytes this payload counts against the prefetch budget.
    pub fn len(&self) -> usize {
        self.base64.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base64.is_empty()
    }
}

#[derive(Debug, Default)]
struct LoadState {
    /// Set exactly once, never reverts. Survives the payload being taken.
    loaded: bool,
    payload: Option<EncodedPayload>,
}

/// One versioned filesystem entry in the request's tree.
#[derive(Debug)]
pub struct ContentItem {
    name: String,
    revision: u64,
    /// Raw content length from upstream metadata (files only).
    size: u64,
    kind: ItemKind,
    children: Vec<Arc<ContentItem>>,
    state: Mutex<LoadState>,
}

impl ContentItem {
    /// Create a file item. `size` is the raw content length reported by the
    /// upstream metadata layer.
    pub fn file(name: impl Into<String>, revision: u64, size: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            revision,
            size,
            kind: ItemKind::File,
            children: Vec::new(),
            state: Mutex::new(LoadState::default()),
        })
    }

    /// Create a folder item with its children in processing order.
    pub fn folder(
        name: impl Into<String>,
        revision: u64,
        children: Vec<Arc<ContentItem>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            revision,
            size: 0,
            kind: ItemKind::Folder,
            children,
            state: Mutex::new(LoadState::default()),
        })
    }

    /// Create a deletion marker.
    pub fn tombstone(name: impl Into<String>, revision: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            revision,
            size: 0,
            kind: ItemKind::Tombstone,
            children: Vec::new(),
            state: Mutex::new(LoadState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn children(&self) -> &[Arc<ContentItem>] {
        &self.children
    }

    /// Whether the loader has published this item's payload. Stays true
    /// after the payload is taken.
    pub fn is_loaded(&self) -> bool {
        self.state.lock().unwrap().loaded
    }

    /// Store the encoded payload and mark the item loaded. Returns the
    /// payload length for budget accounting. Write-once.
    pub(crate) fn publish(&self, payload: EncodedPayload) -> usize {
        let mut state = self.state.lock().unwrap();
        debug_assert!(!state.loaded, "item {:?} published twice", self.name);
        let size = payload.len();
        state.loaded = true;
        state.payload = Some(payload);
        size
    }

    /// Take the payload, leaving `loaded` set. Returns `None` if the item is
    /// not loaded yet or was already taken.
    pub(crate) fn rob(&self) -> Option<EncodedPayload> {
        let mut state = self.state.lock().unwrap();
        if !state.loaded {
            return None;
        }
        state.payload.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_encode_shape() {
        let payload = EncodedPayload::encode(b"hello world");
        assert_eq!(payload.md5, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(payload.md5.len(), 32);
        assert!(!payload.base64.is_empty());
        assert_eq!(payload.len(), payload.base64.len());
    }

    #[test]
    fn rob_clears_payload_but_not_loaded() {
        let item = ContentItem::file("a.txt", 3, 5);
        assert!(item.rob().is_none());
        assert!(!item.is_loaded());

        let size = item.publish(EncodedPayload::encode(b"abcde"));
        assert!(size > 0);
        assert!(item.is_loaded());

        let payload = item.rob().unwrap();
        assert_eq!(payload.len(), size);
        assert!(item.is_loaded());
        assert!(item.rob().is_none());
    }

    #[test]
    fn children_keep_insertion_order() {
        let folder = ContentItem::folder(
            "trunk",
            7,
            vec![
                ContentItem::file("b.txt", 7, 1),
                ContentItem::tombstone("gone.txt", 7),
                ContentItem::file("a.txt", 7, 1),
            ],
        );
        let names: Vec<&str> = folder.children().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["b.txt", "gone.txt", "a.txt"]);
    }
}
