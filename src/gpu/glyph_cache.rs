//! Open-addressing cache mapping (font face, glyph id) to atlas slots.
//!
//! Linear probing over a power-of-two table, grown at 50% load. Entries are
//! only meaningful for the atlas generation that produced them; an atlas
//! reset clears the table wholesale rather than invalidating incrementally.
//!
//! The cache owns one `Arc<FontFace>` per resident key, acquired on insert
//! and released on [`clear`](GlyphCache::clear) — the glyph arrays in the
//! payload may drop their faces between frames without invalidating slots.

use std::sync::Arc;

use crate::font::FontFace;

/// Shading classification recorded at rasterization time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GlyphShading {
    /// Zero-area glyph (control character, space): a valid no-op entry so
    /// the glyph is never re-rasterized.
    #[default]
    None,
    Grayscale,
    ClearType,
    /// Multi-colored glyph (emoji); sampled as-is, foreground color ignored.
    Color,
}

/// One cached glyph: where it lives in the atlas and how to draw it.
#[derive(Default)]
pub struct GlyphCacheEntry {
    /// Occupancy marker and owned face reference.
    face: Option<Arc<FontFace>>,
    glyph: u16,
    pub shading: GlyphShading,
    /// Atlas texel rect: x, y, w, h.
    pub tex: [u16; 4],
    /// Signed pixel offset from the rasterization origin (the baseline) to
    /// the rect's top-left.
    pub offset: [i16; 2],
}

impl GlyphCacheEntry {
    /// Whether the glyph produces any pixels at all.
    pub fn is_visible(&self) -> bool {
        self.tex[2] != 0 && self.tex[3] != 0
    }
}

const INITIAL_SLOTS: usize = 256;

pub struct GlyphCache {
    slots: Vec<GlyphCacheEntry>,
    mask: usize,
    /// Grow threshold: half the slot count.
    capacity: usize,
    len: usize,
}

impl Default for GlyphCache {
    fn default() -> Self {
        Self::new()
    }
}

impl GlyphCache {
    pub fn new() -> Self {
        Self {
            slots: (0..INITIAL_SLOTS).map(|_| GlyphCacheEntry::default()).collect(),
            mask: INITIAL_SLOTS - 1,
            capacity: INITIAL_SLOTS / 2,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Look up `(face, glyph)`, inserting a zero-initialized entry on miss.
    ///
    /// Returns the entry and whether it was just inserted; a fresh entry is
    /// expected to be filled in by the caller's rasterization path.
    pub fn find_or_insert(
        &mut self,
        face: &Arc<FontFace>,
        glyph: u16,
    ) -> (&mut GlyphCacheEntry, bool) {
        let id = face.id();
        let hash = Self::hash(id.as_u32(), glyph);

        let mut i = hash;
        let found = loop {
            let entry = &self.slots[i & self.mask];
            match &entry.face {
                Some(f) if f.id() == id && entry.glyph == glyph => break Some(i & self.mask),
                Some(_) => i = i.wrapping_add(1),
                None => break None,
            }
        };

        if let Some(idx) = found {
            return (&mut self.slots[idx], false);
        }

        if self.len >= self.capacity {
            self.grow();
        }
        self.len += 1;

        let idx = self.probe_vacant(Self::hash(id.as_u32(), glyph));
        let entry = &mut self.slots[idx];
        entry.face = Some(Arc::clone(face));
        entry.glyph = glyph;
        (entry, true)
    }

    /// Drop every entry and its face reference. Called on atlas reset;
    /// re-population happens lazily on the next lookups.
    pub fn clear(&mut self) {
        if self.len == 0 {
            return;
        }
        for entry in &mut self.slots {
            *entry = GlyphCacheEntry::default();
        }
        self.len = 0;
    }

    fn probe_vacant(&self, hash: usize) -> usize {
        let mut i = hash;
        loop {
            if self.slots[i & self.mask].face.is_none() {
                return i & self.mask;
            }
            i = i.wrapping_add(1);
        }
    }

    fn grow(&mut self) {
        let new_len = self.slots.len() << 1;
        assert!(new_len < i32::MAX as usize, "glyph cache overflow");

        let old = std::mem::replace(
            &mut self.slots,
            (0..new_len).map(|_| GlyphCacheEntry::default()).collect(),
        );
        self.mask = new_len - 1;
        self.capacity = new_len / 2;

        for entry in old {
            if let Some(face) = &entry.face {
                let idx = self.probe_vacant(Self::hash(face.id().as_u32(), entry.glyph));
                self.slots[idx] = entry;
            }
        }
    }

    fn hash(face_id: u32, glyph: u16) -> usize {
        let key = (u64::from(face_id) << 16) | u64::from(glyph);
        // Fibonacci multiplicative hash; the upper bits carry the mixing.
        (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::font::test_support::dummy_face;

    #[test]
    fn second_lookup_hits_without_insert() {
        let mut cache = GlyphCache::new();
        let face = dummy_face();

        let (entry, inserted) = cache.find_or_insert(&face, 42);
        assert!(inserted);
        entry.tex = [1, 2, 3, 4];

        let (entry, inserted) = cache.find_or_insert(&face, 42);
        assert!(!inserted);
        assert_eq!(entry.tex, [1, 2, 3, 4]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_faces_do_not_collide_logically() {
        let mut cache = GlyphCache::new();
        let a = dummy_face();
        let b = dummy_face();

        cache.find_or_insert(&a, 7).0.tex = [1, 0, 1, 1];
        cache.find_or_insert(&b, 7).0.tex = [2, 0, 1, 1];

        assert_eq!(cache.find_or_insert(&a, 7).0.tex, [1, 0, 1, 1]);
        assert_eq!(cache.find_or_insert(&b, 7).0.tex, [2, 0, 1, 1]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn clear_forgets_everything() {
        let mut cache = GlyphCache::new();
        let face = dummy_face();
        for glyph in 0..100 {
            cache.find_or_insert(&face, glyph);
        }
        assert_eq!(cache.len(), 100);

        cache.clear();
        assert!(cache.is_empty());
        let (_, inserted) = cache.find_or_insert(&face, 0);
        assert!(inserted, "cleared key must read as a miss");
    }

    #[test]
    fn clear_releases_face_references() {
        let mut cache = GlyphCache::new();
        let face = dummy_face();
        cache.find_or_insert(&face, 1);
        cache.find_or_insert(&face, 2);
        // Two entries hold clones, plus the local binding.
        assert_eq!(Arc::strong_count(&face), 3);
        cache.clear();
        assert_eq!(Arc::strong_count(&face), 1);
    }

    #[test]
    fn grows_past_fifty_percent_load() {
        let mut cache = GlyphCache::new();
        let face = dummy_face();
        // INITIAL_SLOTS/2 is the growth threshold; exceed it well past one
        // doubling and verify nothing is lost to rehashing.
        for glyph in 0..400u16 {
            let (entry, inserted) = cache.find_or_insert(&face, glyph);
            assert!(inserted);
            entry.tex = [glyph, 0, 1, 1];
        }
        assert_eq!(cache.len(), 400);
        for glyph in 0..400u16 {
            let (entry, inserted) = cache.find_or_insert(&face, glyph);
            assert!(!inserted, "glyph {glyph} lost during growth");
            assert_eq!(entry.tex[0], glyph);
        }
    }
}
