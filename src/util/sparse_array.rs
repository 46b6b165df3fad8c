//! Segmented arrays indexed by object number.
//!
//! Page, section and index numbers are sparse: a recovery pass may touch
//! page 5 and page 90 000 and nothing in between. `SparseArray` allocates
//! fixed-width segments on first touch so that memory follows the objects
//! actually seen. `DenseArray` is the simple growable variant used for the
//! per-table-space section use counts.

/// Number of slots per `SparseArray` segment.
pub const SPARSE_SEGMENT_WIDTH: usize = 128;

/// Tiered array of `T` allocating one segment per `SPARSE_SEGMENT_WIDTH` slots.
#[derive(Debug, Clone)]
pub struct SparseArray<T> {
    segments: Vec<Option<Box<[T]>>>,
    len: usize,
}

impl<T: Default + Clone> SparseArray<T> {
    /// Creates an empty array.
    #[must_use]
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            len: 0,
        }
    }

    /// Returns the slot at `index`, if its segment has been allocated.
    #[must_use]
    pub fn get(&self, index: u32) -> Option<&T> {
        let (segment, slot) = Self::locate(index);
        self.segments
            .get(segment)
            .and_then(Option::as_ref)
            .map(|s| &s[slot])
    }

    /// Returns a mutable slot at `index`, if its segment has been allocated.
    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        let (segment, slot) = Self::locate(index);
        self.segments
            .get_mut(segment)
            .and_then(Option::as_mut)
            .map(|s| &mut s[slot])
    }

    /// Returns the slot at `index`, allocating its segment with defaults.
    pub fn get_or_insert(&mut self, index: u32) -> &mut T {
        let (segment, slot) = Self::locate(index);
        if segment >= self.segments.len() {
            self.segments.resize_with(segment + 1, || None);
        }
        let entry = &mut self.segments[segment];
        if entry.is_none() {
            *entry = Some(vec![T::default(); SPARSE_SEGMENT_WIDTH].into_boxed_slice());
            self.len += 1;
        }
        match entry {
            Some(s) => &mut s[slot],
            None => unreachable!("segment allocated above"),
        }
    }

    /// Iterates allocated slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.segments
            .iter()
            .enumerate()
            .filter_map(|(n, s)| s.as_ref().map(|s| (n, s)))
            .flat_map(|(n, s)| {
                s.iter()
                    .enumerate()
                    .map(move |(slot, v)| ((n * SPARSE_SEGMENT_WIDTH + slot) as u32, v))
            })
    }

    /// Number of allocated segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.len
    }

    /// Drops every segment.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }

    fn locate(index: u32) -> (usize, usize) {
        let index = index as usize;
        (index / SPARSE_SEGMENT_WIDTH, index % SPARSE_SEGMENT_WIDTH)
    }
}

impl<T: Default + Clone> Default for SparseArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Growable array that reads missing slots as `T::default()`.
#[derive(Debug, Clone, Default)]
pub struct DenseArray<T> {
    values: Vec<T>,
}

impl<T: Default + Clone> DenseArray<T> {
    /// Creates an empty array.
    #[must_use]
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Returns the value at `index` or the default.
    #[must_use]
    pub fn get(&self, index: u32) -> T {
        self.values.get(index as usize).cloned().unwrap_or_default()
    }

    /// Returns a mutable slot at `index`, growing the array as needed.
    pub fn get_mut(&mut self, index: u32) -> &mut T {
        let index = index as usize;
        if index >= self.values.len() {
            self.values.resize(index + 1, T::default());
        }
        &mut self.values[index]
    }

    /// Number of slots currently backed by storage.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no slot has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Resets every slot.
    pub fn zap(&mut self) {
        self.values.clear();
    }
}
