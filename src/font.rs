//! Owned font-face handles with stable identity.
//!
//! The shaping stage hands the renderer `Arc<FontFace>` per glyph run. The
//! glyph cache keys on [`FaceId`] and keeps one `Arc` clone per resident
//! entry, released when the cache is cleared — an explicit version of the
//! refcount contract a native text stack would give us for free.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use swash::{CacheKey, FontRef};

static NEXT_FACE_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique identity of a loaded font face.
///
/// Two `FontFace` values never share an id, even when loaded from the same
/// bytes; identity tracks the handle, not the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaceId(u32);

impl FaceId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// A font face owning its backing data, usable with swash's scaler.
pub struct FontFace {
    data: Vec<u8>,
    offset: u32,
    key: CacheKey,
    id: FaceId,
}

impl FontFace {
    /// Load face `index` from a font collection or single-font file.
    ///
    /// Returns `None` when the data is not a parseable font.
    pub fn from_data(data: Vec<u8>, index: usize) -> Option<Arc<Self>> {
        let font = FontRef::from_index(&data, index)?;
        let (offset, key) = (font.offset, font.key);
        let id = FaceId(NEXT_FACE_ID.fetch_add(1, Ordering::Relaxed));
        Some(Arc::new(Self {
            data,
            offset,
            key,
            id,
        }))
    }

    pub fn id(&self) -> FaceId {
        self.id
    }

    /// Borrow a swash `FontRef` for scaling/metrics queries.
    pub fn as_ref(&self) -> FontRef<'_> {
        FontRef {
            data: &self.data,
            offset: self.offset,
            key: self.key,
        }
    }
}

impl std::fmt::Debug for FontFace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontFace")
            .field("id", &self.id)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A face handle for cache/atlas tests that never touches swash.
    ///
    /// `FontFace::from_data` needs a real font file; tests only need
    /// identity, so this fabricates a face with empty data and a fresh id.
    pub fn dummy_face() -> Arc<FontFace> {
        Arc::new(FontFace {
            data: Vec::new(),
            offset: 0,
            key: CacheKey::new(),
            id: FaceId(NEXT_FACE_ID.fetch_add(1, Ordering::Relaxed)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::dummy_face;

    #[test]
    fn ids_are_unique_per_handle() {
        let a = dummy_face();
        let b = dummy_face();
        assert_ne!(a.id(), b.id());
    }
}
