//! A dense hash map scanning 16-slot metadata groups with SIMD.
//!
//! The table is a pair of parallel flat arrays: a byte-per-slot metadata
//! array and an entry array holding `(K, V)` pairs. A metadata byte is
//! either one of two sentinels (`EMPTY`, `TOMBSTONE`, both with the high bit
//! set) or the 7-bit fingerprint of the resident key's hash. Every probe
//! step loads 16 metadata bytes at the current cursor and compares them
//! against a broadcast of the sought fingerprint in one SSE2 operation,
//! yielding a 16-bit candidate mask. Only candidate slots are checked
//! against the actual key, so the entry array is rarely touched for
//! mismatches.
//!
//! ## Design
//!
//! A key's hash is folded to its home slot with the golden-ratio multiply
//! (`h * 0x9E3779B9 >> shift`). Probing advances over 16-slot groups with
//! triangular strides: the cursor moves by `16 * k` on the `k`-th step, so
//! the cumulative offsets are `16, 48, 96, 160, …`. Over a power-of-two
//! capacity this sequence visits every group exactly once, which is what
//! makes an `EMPTY` slot a sound terminator for both lookups and inserts.
//!
//! The probe cursor never wraps. When the next stride would run past the
//! capacity, the cursor is re-anchored from a rotated copy of the hash and
//! probing continues; if the re-anchored walk overruns a second time the
//! sequence ends (a lookup reports the key absent, an insert resizes and
//! retries). Keeping the hot loop free of wrap-around masking is worth the
//! occasional entry landing outside its natural cache line.
//!
//! Both arrays are `capacity + 16` slots long. The 16-slot tail exists so a
//! group load anchored at the last legal cursor stays in bounds; entries can
//! land in the tail when a group straddles the capacity boundary, and every
//! whole-table walk (iteration, clearing, rehashing) covers it.
//!
//! Removal writes a `TOMBSTONE`. Tombstones do not terminate probes, so
//! insertion prefers the first tombstone in a group over the first empty in
//! the same group, which keeps the effective load stable under churn.
//! Rehashing drops them: each live entry is replayed into the doubled table
//! through an insert path that skips the duplicate check.
//!
//! All data lives in one contiguous type-erased allocation,
//! `[ Metadata | Entries ]`, with the metadata array serving as the oracle
//! for which entries are initialized.
//!
//! ## Safety Invariants
//!
//! 1. **Index bounds**: the probe cursor is always in `[0, capacity]`, so a
//!    16-byte load at the cursor ends at or before `capacity + 16`, the
//!    length of both arrays.
//! 2. **Initialization**: a metadata byte with the high bit clear is a
//!    fingerprint and marks an initialized entry; `EMPTY` and `TOMBSTONE`
//!    mark slots whose entry must not be read.
//! 3. **Reachability**: every fingerprint slot is reachable from its key's
//!    home cursor by the probe sequence before any `EMPTY`-containing group,
//!    because insertion walks the same sequence a lookup does and never
//!    places past the group that would terminate the lookup.

use alloc::alloc::handle_alloc_error;
use alloc::boxed::Box;
use core::alloc::Layout;
#[cfg(target_arch = "x86")]
use core::arch::x86::*;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::*;
use core::fmt;
use core::fmt::Debug;
use core::hash::BuildHasher;
use core::hash::Hash;
use core::mem::MaybeUninit;
use core::ops::Index;
use core::ptr::NonNull;

use cfg_if::cfg_if;

use crate::mix;

/// Metadata value marking a never-used slot. Terminates probes.
const EMPTY: u8 = 0xFF;

/// Metadata value marking a deleted slot. Does not terminate probes and is
/// recycled by later insertions.
const TOMBSTONE: u8 = 0xFE;

/// High bit shared by both sentinels; fingerprints keep it clear.
const SENTINEL_BIT: u8 = 0x80;

/// Slots scanned per probe step, and the length of the array tail.
const GROUP: usize = 16;

const MIN_CAPACITY: usize = 16;
const MIN_LOAD_FACTOR: f32 = 0.125;
const MAX_LOAD_FACTOR: f32 = 0.9;
const DEFAULT_LOAD_FACTOR: f32 = 0.9;

#[inline(always)]
const fn is_fingerprint(meta: u8) -> bool {
    meta & SENTINEL_BIT == 0
}

#[inline(always)]
fn vector128_supported() -> bool {
    cfg!(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "sse2"
    )) || cfg!(all(target_arch = "aarch64", target_feature = "neon"))
}

cfg_if! {
    if #[cfg(all(any(target_arch = "x86", target_arch = "x86_64"), target_feature = "sse2"))] {
        /// Compare 16 metadata bytes at `ptr` against `byte`, returning a
        /// bitmask of matching positions (bit 0 = lowest address).
        ///
        /// # Safety
        ///
        /// `ptr` must be valid for reads of 16 bytes.
        #[inline(always)]
        unsafe fn scan_group(ptr: *const u8, byte: u8) -> u16 {
            // SAFETY: The caller guarantees 16 readable bytes; the load is
            // unaligned.
            unsafe {
                let needle = _mm_set1_epi8(byte as i8);
                let data = _mm_loadu_si128(ptr as *const __m128i);
                let cmp = _mm_cmpeq_epi8(data, needle);
                _mm_movemask_epi8(cmp) as u16
            }
        }

        /// Prefetches data into the cache.
        ///
        /// # Safety
        ///
        /// `ptr` must point to memory that is safe to read from.
        #[inline(always)]
        unsafe fn prefetch<T>(ptr: *const T) {
            // SAFETY: The caller guarantees the address is valid for reads.
            unsafe {
                _mm_prefetch(ptr as *const i8, _MM_HINT_T0);
            }
        }
    } else {
        /// Compare 16 metadata bytes at `ptr` against `byte`, returning a
        /// bitmask of matching positions (bit 0 = lowest address).
        ///
        /// # Safety
        ///
        /// `ptr` must be valid for reads of 16 bytes.
        #[inline(always)]
        unsafe fn scan_group(ptr: *const u8, byte: u8) -> u16 {
            let mut mask: u16 = 0;
            for i in 0..GROUP {
                // SAFETY: The caller guarantees 16 readable bytes.
                if unsafe { *ptr.add(i) } == byte {
                    mask |= 1 << i;
                }
            }
            mask
        }

        #[inline(always)]
        unsafe fn prefetch<T>(_ptr: *const T) {}
    }
}

/// Error returned by [`DenseMap`] constructors on targets without a 128-bit
/// byte-compare vector capability.
///
/// The group scan is the table's hot path and is built around a
/// 16-byte-wide equality compare; rather than silently degrading, the table
/// refuses to construct where no such capability was compiled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsupportedPlatform;

impl fmt::Display for UnsupportedPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dense map requires a 128-bit byte-compare vector capability")
    }
}

impl core::error::Error for UnsupportedPlatform {}

/// Triangular probe sequence over 16-slot groups, with a single re-anchor
/// when the cursor would run off the end of the table.
struct Probe {
    cursor: usize,
    stride: usize,
    reanchored: bool,
}

impl Probe {
    #[inline(always)]
    fn start(cursor: usize) -> Self {
        Probe {
            cursor,
            stride: 0,
            reanchored: false,
        }
    }

    /// Advance to the next group. Returns `false` when the sequence is
    /// exhausted (second overrun).
    #[inline(always)]
    fn advance(&mut self, hash: u32, capacity: usize, shift: u32) -> bool {
        self.stride += GROUP;
        let next = self.cursor + self.stride;
        if next <= capacity {
            self.cursor = next;
            return true;
        }

        if self.reanchored {
            return false;
        }
        self.reanchored = true;
        self.cursor = mix::reanchor_left(hash, self.stride as u32, shift);
        true
    }
}

#[derive(Debug, Clone, Copy)]
struct DataLayout {
    layout: Layout,
    metadata_offset: usize,
    entries_offset: usize,
}

impl DataLayout {
    fn new<K, V>(slots: usize) -> Self {
        let metadata_layout = Layout::array::<u8>(slots).expect("allocation size overflow");
        let entries_layout =
            Layout::array::<MaybeUninit<(K, V)>>(slots).expect("allocation size overflow");

        let (layout, metadata_offset) = Layout::new::<()>().extend(metadata_layout).unwrap();
        let (layout, entries_offset) = layout.extend(entries_layout).unwrap();

        DataLayout {
            layout,
            metadata_offset,
            entries_offset,
        }
    }
}

/// A hash map probing 16-slot metadata groups with a single vector compare.
///
/// `DenseMap<K, V, S>` stores key-value pairs where keys implement
/// `Hash + Eq`, hashes them through a configurable [`BuildHasher`], and
/// resolves collisions with triangular group probing over a byte-per-slot
/// metadata array. Inserting never overwrites: a duplicate key is rejected
/// and the resident value kept. Removal uses tombstones; rehashing doubles
/// the capacity and drops them.
///
/// # Performance Characteristics
///
/// - **Memory**: 1 byte per slot overhead, plus the size of `(K, V)`.
/// - **Load**: up to 0.9 before a resize is triggered.
pub struct DenseMap<K, V, S> {
    layout: DataLayout,
    alloc: NonNull<u8>,

    populated: usize,
    max_pop: usize,
    capacity: usize,
    shift: u32,
    load_factor: f32,

    hash_builder: S,

    _phantom: core::marker::PhantomData<(K, V)>,
}

impl<K, V, S> Debug for DenseMap<K, V, S>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in self.iter() {
            map.entry(k, v);
        }
        map.finish()
    }
}

impl<K, V, S> Clone for DenseMap<K, V, S>
where
    K: Clone,
    V: Clone,
    S: Clone,
{
    fn clone(&self) -> Self {
        // SAFETY: The layout size is never zero (capacity is floored at
        // MIN_CAPACITY). Allocation failure is handled. The copy duplicates
        // the metadata array wholesale.
        let alloc = unsafe {
            let raw_alloc = alloc::alloc::alloc(self.layout.layout);
            if raw_alloc.is_null() {
                handle_alloc_error(self.layout.layout);
            }

            core::ptr::copy_nonoverlapping(
                self.alloc.as_ptr().add(self.layout.metadata_offset),
                raw_alloc.add(self.layout.metadata_offset),
                self.capacity + GROUP,
            );

            NonNull::new_unchecked(raw_alloc)
        };

        let new_map = Self {
            layout: self.layout,
            alloc,
            populated: self.populated,
            max_pop: self.max_pop,
            capacity: self.capacity,
            shift: self.shift,
            load_factor: self.load_factor,
            hash_builder: self.hash_builder.clone(),
            _phantom: core::marker::PhantomData,
        };

        // SAFETY: Both maps share the same layout, so indices are valid for
        // both. A fingerprint byte guarantees the source entry is
        // initialized, and the destination slot is uninitialized storage of
        // the same type.
        unsafe {
            let src_entries = self.entries_ptr().as_ref();
            let dst_entries = new_map.entries_ptr().as_mut();

            for (slot, &meta) in self.metadata_ptr().as_ref().iter().enumerate() {
                if is_fingerprint(meta) {
                    dst_entries
                        .get_unchecked_mut(slot)
                        .write(src_entries.get_unchecked(slot).assume_init_ref().clone());
                }
            }
        }

        new_map
    }
}

impl<K, V, S> Drop for DenseMap<K, V, S> {
    fn drop(&mut self) {
        // SAFETY: Fingerprint metadata guarantees the entry is initialized;
        // the allocation matches `self.layout`.
        unsafe {
            if core::mem::needs_drop::<(K, V)>() && self.populated > 0 {
                for (slot, &meta) in self.metadata_ptr().as_ref().iter().enumerate() {
                    if is_fingerprint(meta) {
                        self.entries_ptr()
                            .as_mut()
                            .get_unchecked_mut(slot)
                            .assume_init_drop();
                    }
                }
            }

            alloc::alloc::dealloc(self.alloc.as_ptr(), self.layout.layout);
        }
    }
}

impl<K, V, S> DenseMap<K, V, S> {
    fn metadata_ptr(&self) -> NonNull<[u8]> {
        // SAFETY: `self.alloc` points to a live allocation described by
        // `self.layout`; the metadata array spans `capacity + GROUP` bytes
        // starting at `metadata_offset`.
        unsafe {
            NonNull::slice_from_raw_parts(
                self.alloc.add(self.layout.metadata_offset).cast(),
                self.capacity + GROUP,
            )
        }
    }

    fn entries_ptr(&self) -> NonNull<[MaybeUninit<(K, V)>]> {
        // SAFETY: As above, for the entry array at `entries_offset`.
        unsafe {
            NonNull::slice_from_raw_parts(
                self.alloc.add(self.layout.entries_offset).cast(),
                self.capacity + GROUP,
            )
        }
    }

    /// Returns the number of entries in the map.
    pub fn len(&self) -> usize {
        self.populated
    }

    /// Returns `true` if the map contains no entries.
    pub fn is_empty(&self) -> bool {
        self.populated == 0
    }

    /// Returns the slot capacity of the map.
    ///
    /// Always a power of two. The map resizes once the entry count reaches
    /// `capacity * load_factor`, so the usable capacity is smaller.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Removes all entries from the map.
    ///
    /// Values are dropped, metadata is reset to empty, and the entry count
    /// returns to zero. The allocated capacity is preserved.
    pub fn clear(&mut self) {
        // SAFETY: Fingerprint metadata guarantees initialization; the
        // write_bytes covers exactly the metadata array.
        unsafe {
            if core::mem::needs_drop::<(K, V)>() && self.populated > 0 {
                for (slot, &meta) in self.metadata_ptr().as_ref().iter().enumerate() {
                    if is_fingerprint(meta) {
                        self.entries_ptr()
                            .as_mut()
                            .get_unchecked_mut(slot)
                            .assume_init_drop();
                    }
                }
            }

            core::ptr::write_bytes(
                self.alloc.as_ptr().add(self.layout.metadata_offset),
                EMPTY,
                self.capacity + GROUP,
            );
        }

        self.populated = 0;
    }

    /// Returns an iterator over the entries of the map.
    ///
    /// Slots are walked from the highest index to the lowest, so removing
    /// the key just yielded does not disturb positions still to be visited.
    /// The order is otherwise unspecified, and any mutation invalidates an
    /// iteration in progress.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter {
            map: self,
            slot: self.capacity + GROUP,
        }
    }

    /// Returns an iterator over the keys of the map.
    pub fn keys(&self) -> Keys<'_, K, V, S> {
        Keys { inner: self.iter() }
    }

    /// Returns an iterator over the values of the map.
    pub fn values(&self) -> Values<'_, K, V, S> {
        Values { inner: self.iter() }
    }

    /// Returns an iterator that removes and yields all entries.
    ///
    /// The map is emptied up front; leaking the iterator leaks the unyielded
    /// values without dropping them.
    pub fn drain(&mut self) -> Drain<'_, K, V, S> {
        let slots = self.capacity + GROUP;
        let mut occupied = alloc::vec![EMPTY; slots].into_boxed_slice();

        // SAFETY: The copy and fill both cover exactly the metadata array.
        // Moving the occupancy bytes out before clearing them means a leaked
        // `Drain` leaves the map consistently empty rather than pointing at
        // moved-out entries.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.metadata_ptr().as_ref().as_ptr(),
                occupied.as_mut_ptr(),
                slots,
            );

            core::ptr::write_bytes(
                self.alloc.as_ptr().add(self.layout.metadata_offset),
                EMPTY,
                slots,
            );
        }

        self.populated = 0;

        Drain {
            occupied,
            map: self,
            slot: slots,
        }
    }
}

impl<K, V, S> DenseMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Creates a new map with the given hasher builder.
    ///
    /// # Errors
    ///
    /// Returns [`UnsupportedPlatform`] if no 128-bit byte-compare capability
    /// was compiled in.
    pub fn with_hasher(hash_builder: S) -> Result<Self, UnsupportedPlatform> {
        Self::with_capacity_and_hasher(0, hash_builder)
    }

    /// Creates a new map with space for `capacity` slots.
    ///
    /// The capacity is rounded up to a power of two and floored at 16. The
    /// load factor defaults to 0.9.
    ///
    /// # Errors
    ///
    /// Returns [`UnsupportedPlatform`] if no 128-bit byte-compare capability
    /// was compiled in.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::collections::hash_map::RandomState;
    ///
    /// use fib_hash::DenseMap;
    ///
    /// let map: DenseMap<u64, u64, _> =
    ///     DenseMap::with_capacity_and_hasher(100, RandomState::new()).unwrap();
    /// assert_eq!(map.capacity(), 128);
    /// ```
    pub fn with_capacity_and_hasher(
        capacity: usize,
        hash_builder: S,
    ) -> Result<Self, UnsupportedPlatform> {
        Self::with_capacity_and_load_factor(capacity, DEFAULT_LOAD_FACTOR, hash_builder)
    }

    /// Creates a new map with the given capacity and load factor.
    ///
    /// The load factor is clamped into `[0.125, 0.9]`; the capacity is
    /// rounded up to a power of two and floored at 16.
    ///
    /// # Errors
    ///
    /// Returns [`UnsupportedPlatform`] if no 128-bit byte-compare capability
    /// was compiled in.
    pub fn with_capacity_and_load_factor(
        capacity: usize,
        load_factor: f32,
        hash_builder: S,
    ) -> Result<Self, UnsupportedPlatform> {
        if !vector128_supported() {
            return Err(UnsupportedPlatform);
        }

        let load_factor = load_factor.clamp(MIN_LOAD_FACTOR, MAX_LOAD_FACTOR);
        let capacity = capacity.next_power_of_two().max(MIN_CAPACITY);
        let layout = DataLayout::new::<K, V>(capacity + GROUP);

        // SAFETY: The layout size is non-zero and allocation failure is
        // handled. Seeding the metadata array with EMPTY establishes the
        // occupancy oracle before any entry is touched.
        let alloc = unsafe {
            let raw_alloc = alloc::alloc::alloc(layout.layout);
            if raw_alloc.is_null() {
                handle_alloc_error(layout.layout);
            }

            core::ptr::write_bytes(raw_alloc.add(layout.metadata_offset), EMPTY, capacity + GROUP);

            NonNull::new_unchecked(raw_alloc)
        };

        Ok(Self {
            layout,
            alloc,
            populated: 0,
            max_pop: (capacity as f32 * load_factor) as usize,
            capacity,
            shift: 32 - capacity.trailing_zeros(),
            load_factor,
            hash_builder,
            _phantom: core::marker::PhantomData,
        })
    }

    #[inline(always)]
    fn hash_of(&self, key: &K) -> u32 {
        self.hash_builder.hash_one(key) as u32
    }

    /// Walk the probe sequence looking for `key`, returning its slot.
    ///
    /// Fingerprint candidates in each group are examined in ascending offset
    /// order; a group containing an empty slot terminates the walk.
    #[inline]
    fn find_slot(&self, hash: u32, key: &K) -> Option<usize> {
        let h2 = mix::fingerprint(hash);
        let mut probe = Probe::start(mix::home(hash, self.shift));

        loop {
            // SAFETY: The probe cursor stays in [0, capacity], so the
            // 16-byte load ends inside the padded metadata array.
            let group = unsafe { self.metadata_ptr().as_ref().as_ptr().add(probe.cursor) };
            let mut candidates = unsafe { scan_group(group, h2) };

            if candidates != 0 {
                // SAFETY: Entry rows are in bounds for the same reason the
                // metadata row is.
                unsafe {
                    prefetch(self.entries_ptr().as_ref().as_ptr().add(probe.cursor));
                }
            }

            while candidates != 0 {
                let offset = candidates.trailing_zeros() as usize;
                candidates ^= 1 << offset;

                let slot = probe.cursor + offset;
                // SAFETY: `slot < capacity + GROUP`, and the fingerprint at
                // `slot` guarantees the entry is initialized.
                if unsafe {
                    self.entries_ptr()
                        .as_ref()
                        .get_unchecked(slot)
                        .assume_init_ref()
                        .0
                        == *key
                } {
                    return Some(slot);
                }
            }

            // SAFETY: Same cursor bound as the candidate scan.
            if unsafe { scan_group(group, EMPTY) } != 0 {
                return None;
            }

            if !probe.advance(hash, self.capacity, self.shift) {
                return None;
            }
        }
    }

    /// Walk the probe sequence for a free slot, preferring the first
    /// tombstone in a group over the first empty in the same group.
    ///
    /// Returns `None` when the sequence is exhausted without finding either.
    #[inline]
    fn find_free_slot(&self, hash: u32) -> Option<usize> {
        let mut probe = Probe::start(mix::home(hash, self.shift));

        loop {
            // SAFETY: The probe cursor stays in [0, capacity], so the
            // 16-byte loads end inside the padded metadata array.
            unsafe {
                let group = self.metadata_ptr().as_ref().as_ptr().add(probe.cursor);

                let tombstones = scan_group(group, TOMBSTONE);
                if tombstones != 0 {
                    return Some(probe.cursor + tombstones.trailing_zeros() as usize);
                }

                let empties = scan_group(group, EMPTY);
                if empties != 0 {
                    return Some(probe.cursor + empties.trailing_zeros() as usize);
                }
            }

            if !probe.advance(hash, self.capacity, self.shift) {
                return None;
            }
        }
    }

    /// Place an entry known not to be in the map, resizing as needed.
    ///
    /// This is the path rehashing replays entries through: no duplicate
    /// check, first tombstone-or-empty slot in probe order wins.
    fn insert_unique(&mut self, hash: u32, key: K, value: V) {
        let slot = loop {
            match self.find_free_slot(hash) {
                Some(slot) => break slot,
                None => self.resize(),
            }
        };

        // SAFETY: `slot` came from `find_free_slot`, so it is in bounds and
        // its metadata is a sentinel; writing the entry does not overwrite a
        // live value.
        unsafe {
            *self
                .metadata_ptr()
                .as_mut()
                .get_unchecked_mut(slot) = mix::fingerprint(hash);
            self.entries_ptr()
                .as_mut()
                .get_unchecked_mut(slot)
                .write((key, value));
        }

        self.populated += 1;
    }

    /// Inserts a key-value pair into the map.
    ///
    /// Returns `true` if the key was not present. If the key is already in
    /// the map, nothing is changed and `false` is returned; in particular
    /// the resident value is *not* overwritten (use [`update`] for that).
    ///
    /// May trigger a rehash when the entry count has reached
    /// `capacity * load_factor`.
    ///
    /// [`update`]: DenseMap::update
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::collections::hash_map::RandomState;
    ///
    /// use fib_hash::DenseMap;
    ///
    /// let mut map = DenseMap::with_hasher(RandomState::new()).unwrap();
    /// assert!(map.insert(37, "a"));
    /// assert!(!map.insert(37, "b"));
    /// assert_eq!(map.get(&37), Some(&"a"));
    /// ```
    pub fn insert(&mut self, key: K, value: V) -> bool {
        if self.populated >= self.max_pop {
            self.resize();
        }

        let hash = self.hash_of(&key);
        if self.find_slot(hash, &key).is_some() {
            return false;
        }

        self.insert_unique(hash, key, value);
        true
    }

    /// Returns a reference to the value corresponding to the key.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::collections::hash_map::RandomState;
    ///
    /// use fib_hash::DenseMap;
    ///
    /// let mut map = DenseMap::with_hasher(RandomState::new()).unwrap();
    /// map.insert(1, "a");
    /// assert_eq!(map.get(&1), Some(&"a"));
    /// assert_eq!(map.get(&2), None);
    /// ```
    pub fn get(&self, key: &K) -> Option<&V> {
        if self.populated == 0 {
            return None;
        }

        let hash = self.hash_of(key);
        let slot = self.find_slot(hash, key)?;

        // SAFETY: `find_slot` only returns occupied, in-bounds slots.
        Some(unsafe {
            &self
                .entries_ptr()
                .as_ref()
                .get_unchecked(slot)
                .assume_init_ref()
                .1
        })
    }

    /// Returns a mutable reference to the value corresponding to the key.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.populated == 0 {
            return None;
        }

        let hash = self.hash_of(key);
        let slot = self.find_slot(hash, key)?;

        // SAFETY: `find_slot` only returns occupied, in-bounds slots.
        Some(unsafe {
            &mut self
                .entries_ptr()
                .as_mut()
                .get_unchecked_mut(slot)
                .assume_init_mut()
                .1
        })
    }

    /// Overwrites the value of an existing key in place.
    ///
    /// Returns `true` if the key was present. If the key is absent the map
    /// is unchanged, the new value is dropped, and `false` is returned.
    pub fn update(&mut self, key: &K, value: V) -> bool {
        if self.populated == 0 {
            return false;
        }

        let hash = self.hash_of(key);
        match self.find_slot(hash, key) {
            Some(slot) => {
                // SAFETY: `find_slot` only returns occupied, in-bounds
                // slots.
                unsafe {
                    self.entries_ptr()
                        .as_mut()
                        .get_unchecked_mut(slot)
                        .assume_init_mut()
                        .1 = value;
                }
                true
            }
            None => false,
        }
    }

    /// Removes a key from the map, returning its value if it was present.
    ///
    /// The slot becomes a tombstone: it does not terminate probes for other
    /// keys and will be recycled by a later insertion or dropped by the next
    /// rehash.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::collections::hash_map::RandomState;
    ///
    /// use fib_hash::DenseMap;
    ///
    /// let mut map = DenseMap::with_hasher(RandomState::new()).unwrap();
    /// map.insert(1, "a");
    /// assert_eq!(map.remove(&1), Some("a"));
    /// assert_eq!(map.remove(&1), None);
    /// ```
    pub fn remove(&mut self, key: &K) -> Option<V> {
        if self.populated == 0 {
            return None;
        }

        let hash = self.hash_of(key);
        let slot = self.find_slot(hash, key)?;

        self.populated -= 1;

        // SAFETY: `find_slot` only returns occupied, in-bounds slots.
        // Marking the metadata as TOMBSTONE before reading the entry out
        // keeps the occupancy oracle truthful.
        unsafe {
            *self.metadata_ptr().as_mut().get_unchecked_mut(slot) = TOMBSTONE;
            let (_key, value) = self
                .entries_ptr()
                .as_ref()
                .get_unchecked(slot)
                .assume_init_read();
            Some(value)
        }
    }

    /// Returns `true` if the map contains the given key.
    pub fn contains_key(&self, key: &K) -> bool {
        if self.populated == 0 {
            return false;
        }

        let hash = self.hash_of(key);
        self.find_slot(hash, key).is_some()
    }

    /// Returns the slot index currently holding `key`, by linear scan.
    ///
    /// Intended for tests and introspection; the index is invalidated by any
    /// rehash.
    pub fn index_of(&self, key: &K) -> Option<usize> {
        // SAFETY: The walk covers exactly the slots of both arrays, and a
        // fingerprint guarantees the entry is initialized.
        unsafe {
            for (slot, &meta) in self.metadata_ptr().as_ref().iter().enumerate() {
                if is_fingerprint(meta)
                    && self
                        .entries_ptr()
                        .as_ref()
                        .get_unchecked(slot)
                        .assume_init_ref()
                        .0
                        == *key
                {
                    return Some(slot);
                }
            }
        }

        None
    }

    /// Inserts a clone of every entry of `other` through the public insert
    /// path.
    ///
    /// Keys already present in `self` keep their resident values.
    pub fn copy_from(&mut self, other: &DenseMap<K, V, S>)
    where
        K: Clone,
        V: Clone,
    {
        self.reserve(other.len());
        for (key, value) in other.iter() {
            self.insert(key.clone(), value.clone());
        }
    }

    /// Reserves capacity for at least `additional` more entries, doubling
    /// until `len() + additional` fits under the load factor.
    pub fn reserve(&mut self, additional: usize) {
        let required = self.populated.saturating_add(additional);
        while required > self.max_pop {
            self.resize();
        }
    }

    #[cold]
    #[inline(never)]
    fn resize(&mut self) {
        let new_capacity = self.capacity * 2;
        let new_layout = DataLayout::new::<K, V>(new_capacity + GROUP);

        // SAFETY: The layout size is non-zero and allocation failure is
        // handled; the metadata array is seeded EMPTY before use.
        let new_alloc = unsafe {
            let raw_alloc = alloc::alloc::alloc(new_layout.layout);
            if raw_alloc.is_null() {
                handle_alloc_error(new_layout.layout);
            }

            core::ptr::write_bytes(
                raw_alloc.add(new_layout.metadata_offset),
                EMPTY,
                new_capacity + GROUP,
            );

            NonNull::new_unchecked(raw_alloc)
        };

        let old_layout = core::mem::replace(&mut self.layout, new_layout);
        let old_alloc = core::mem::replace(&mut self.alloc, new_alloc);
        let old_slots = self.capacity + GROUP;

        self.capacity = new_capacity;
        self.shift -= 1;
        self.max_pop = (new_capacity as f32 * self.load_factor) as usize;
        self.populated = 0;

        // SAFETY: The old allocation stays valid until the dealloc below.
        // Each fingerprint byte marks an initialized entry, which is moved
        // out exactly once and replayed through the unique-insert path;
        // tombstoned and empty slots hold no live value. The old allocation
        // is then freed without running destructors for the moved-out
        // entries, which is correct as ownership has transferred.
        unsafe {
            let old_metadata: NonNull<[u8]> = NonNull::slice_from_raw_parts(
                old_alloc.add(old_layout.metadata_offset).cast(),
                old_slots,
            );
            let old_entries: NonNull<[MaybeUninit<(K, V)>]> = NonNull::slice_from_raw_parts(
                old_alloc.add(old_layout.entries_offset).cast(),
                old_slots,
            );

            for (slot, &meta) in old_metadata.as_ref().iter().enumerate() {
                if !is_fingerprint(meta) {
                    continue;
                }

                let (key, value) = old_entries.as_ref().get_unchecked(slot).assume_init_read();
                let hash = self.hash_of(&key);
                self.insert_unique(hash, key, value);
            }

            alloc::alloc::dealloc(old_alloc.as_ptr(), old_layout.layout);
        }
    }
}

impl<K, V, S> Index<&K> for DenseMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    type Output = V;

    fn index(&self, key: &K) -> &V {
        self.get(key).expect("key not found")
    }
}

impl<'a, K, V, S> IntoIterator for &'a DenseMap<K, V, S> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// An iterator over the entries of a [`DenseMap`].
///
/// Created by [`DenseMap::iter`]. Walks slots from the highest index to the
/// lowest.
pub struct Iter<'a, K, V, S> {
    map: &'a DenseMap<K, V, S>,
    slot: usize,
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: `slot` only decreases and starts at the array length, so
        // every access is in bounds; a fingerprint guarantees the entry is
        // initialized.
        unsafe {
            while self.slot > 0 {
                self.slot -= 1;

                if is_fingerprint(*self.map.metadata_ptr().as_ref().get_unchecked(self.slot)) {
                    let (key, value) = self
                        .map
                        .entries_ptr()
                        .as_ref()
                        .get_unchecked(self.slot)
                        .assume_init_ref();
                    return Some((key, value));
                }
            }
        }

        None
    }
}

/// An iterator over the keys of a [`DenseMap`].
///
/// Created by [`DenseMap::keys`].
pub struct Keys<'a, K, V, S> {
    inner: Iter<'a, K, V, S>,
}

impl<'a, K, V, S> Iterator for Keys<'a, K, V, S> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(key, _)| key)
    }
}

/// An iterator over the values of a [`DenseMap`].
///
/// Created by [`DenseMap::values`].
pub struct Values<'a, K, V, S> {
    inner: Iter<'a, K, V, S>,
}

impl<'a, K, V, S> Iterator for Values<'a, K, V, S> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, value)| value)
    }
}

/// A draining iterator over the entries of a [`DenseMap`].
///
/// Created by [`DenseMap::drain`]. The map is emptied when the iterator is
/// created; dropping the iterator drops the unyielded entries.
pub struct Drain<'a, K, V, S> {
    occupied: Box<[u8]>,
    map: &'a mut DenseMap<K, V, S>,
    slot: usize,
}

impl<K, V, S> Iterator for Drain<'_, K, V, S> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: `occupied` is a snapshot of the metadata taken before it
        // was cleared, so a fingerprint byte still marks an initialized
        // entry; each entry is read out at most once because `slot` only
        // decreases.
        unsafe {
            while self.slot > 0 {
                self.slot -= 1;

                if is_fingerprint(*self.occupied.get_unchecked(self.slot)) {
                    return Some(
                        self.map
                            .entries_ptr()
                            .as_ref()
                            .get_unchecked(self.slot)
                            .assume_init_read(),
                    );
                }
            }
        }

        None
    }
}

impl<K, V, S> Drop for Drain<'_, K, V, S> {
    fn drop(&mut self) {
        for _ in &mut *self {}
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::String;
    use alloc::string::ToString;
    use alloc::vec::Vec;
    use core::hash::Hasher;

    use rand::TryRngCore;
    use rand::rngs::OsRng;
    use siphasher::sip::SipHasher;

    use super::*;

    /// Hashes a key to itself, so tests with literal integer keys probe
    /// exactly where the mixing step sends them.
    #[derive(Clone, Default)]
    struct IdentityState;

    impl BuildHasher for IdentityState {
        type Hasher = IdentityHasher;

        fn build_hasher(&self) -> IdentityHasher {
            IdentityHasher(0)
        }
    }

    struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }

        fn write(&mut self, bytes: &[u8]) {
            for &b in bytes {
                self.0 = (self.0 << 8) | u64::from(b);
            }
        }

        fn write_u32(&mut self, i: u32) {
            self.0 = u64::from(i);
        }

        fn write_u64(&mut self, i: u64) {
            self.0 = i;
        }
    }

    /// Hashes every key to zero; all probes collide on one home group.
    #[derive(Clone, Default)]
    struct CollidingState;

    impl BuildHasher for CollidingState {
        type Hasher = CollidingHasher;

        fn build_hasher(&self) -> CollidingHasher {
            CollidingHasher
        }
    }

    struct CollidingHasher;

    impl Hasher for CollidingHasher {
        fn finish(&self) -> u64 {
            0
        }

        fn write(&mut self, _bytes: &[u8]) {}
    }

    #[derive(Clone)]
    struct SipState {
        k0: u64,
        k1: u64,
    }

    impl SipState {
        fn random() -> Self {
            let mut rng = OsRng;
            Self {
                k0: rng.try_next_u64().unwrap(),
                k1: rng.try_next_u64().unwrap(),
            }
        }
    }

    impl BuildHasher for SipState {
        type Hasher = SipHasher;

        fn build_hasher(&self) -> SipHasher {
            SipHasher::new_with_keys(self.k0, self.k1)
        }
    }

    fn identity_map() -> DenseMap<u32, u64, IdentityState> {
        DenseMap::with_capacity_and_hasher(16, IdentityState).unwrap()
    }

    #[test]
    fn construction_succeeds_on_supported_platform() {
        assert!(DenseMap::<u32, u32, _>::with_hasher(IdentityState).is_ok());
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let map: DenseMap<u32, u32, _> =
            DenseMap::with_capacity_and_hasher(17, IdentityState).unwrap();
        assert_eq!(map.capacity(), 32);

        let map: DenseMap<u32, u32, _> =
            DenseMap::with_capacity_and_hasher(0, IdentityState).unwrap();
        assert_eq!(map.capacity(), 16);
    }

    #[test]
    fn insert_and_get_small() {
        let mut map = identity_map();
        assert!(map.insert(1, 100));
        assert!(map.insert(2, 200));
        assert!(map.insert(3, 300));

        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&2), Some(&200));
        assert!(!map.contains_key(&4));
    }

    #[test]
    fn fourteen_inserts_do_not_rehash() {
        let mut map = identity_map();
        for k in 1..=14u32 {
            assert!(map.insert(k, u64::from(k) * u64::from(k)));
        }

        assert_eq!(map.capacity(), 16);
        assert_eq!(map.len(), 14);
        assert_eq!(map.get(&7), Some(&49));
    }

    #[test]
    fn fifteenth_insert_rehashes() {
        let mut map = identity_map();
        for k in 1..=15u32 {
            assert!(map.insert(k, u64::from(k) * u64::from(k)));
        }

        assert_eq!(map.capacity(), 32);
        assert_eq!(map.len(), 15);
        for k in 1..=15u32 {
            assert_eq!(map.get(&k), Some(&(u64::from(k) * u64::from(k))));
        }
    }

    #[test]
    fn remove_even_keys() {
        let mut map = identity_map();
        for k in 1..=100u32 {
            assert!(map.insert(k, u64::from(k) * u64::from(k)));
        }
        for k in (2..=100u32).step_by(2) {
            assert_eq!(map.remove(&k), Some(u64::from(k) * u64::from(k)));
        }

        assert_eq!(map.len(), 50);
        assert!(!map.contains_key(&2));
        assert!(map.contains_key(&51));
        assert_eq!(map.get(&99), Some(&9801));
    }

    #[test]
    fn update_hits_and_misses() {
        let mut map: DenseMap<u32, String, _> =
            DenseMap::with_capacity_and_hasher(16, IdentityState).unwrap();
        assert!(map.insert(42, "a".to_string()));
        assert!(map.update(&42, "b".to_string()));
        assert!(!map.update(&43, "x".to_string()));

        assert_eq!(map.get(&42), Some(&"b".to_string()));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn duplicate_insert_keeps_resident_value() {
        let mut map = identity_map();
        assert!(map.insert(7, 1));
        assert!(!map.insert(7, 2));

        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&7), Some(&1));
    }

    #[test]
    fn colliding_keys_all_retrievable() {
        let mut map: DenseMap<u32, u64, _> =
            DenseMap::with_capacity_and_hasher(16, CollidingState).unwrap();
        for k in 0..50u32 {
            assert!(map.insert(k, u64::from(k)));
        }

        assert_eq!(map.len(), 50);
        for k in 0..50u32 {
            assert_eq!(map.get(&k), Some(&u64::from(k)));
        }
    }

    #[test]
    fn tombstone_is_recycled_before_empty() {
        let mut map: DenseMap<u32, u64, _> =
            DenseMap::with_capacity_and_hasher(16, CollidingState).unwrap();
        map.insert(1, 10);
        map.insert(2, 20);
        map.insert(3, 30);

        let slot = map.index_of(&2).unwrap();
        assert!(map.remove(&2).is_some());

        // The next insert colliding onto the same group takes the tombstone
        // even though empties exist later in the group.
        map.insert(4, 40);
        assert_eq!(map.index_of(&4), Some(slot));
        assert_eq!(map.get(&4), Some(&40));
    }

    #[test]
    fn reinserted_key_reuses_its_slot() {
        let mut map = identity_map();
        map.insert(9, 90);
        let slot = map.index_of(&9).unwrap();

        assert_eq!(map.remove(&9), Some(90));
        assert!(map.insert(9, 91));
        assert_eq!(map.index_of(&9), Some(slot));
    }

    #[test]
    fn insert_remove_churn_does_not_grow_capacity() {
        let mut map = identity_map();
        for _ in 0..1000 {
            assert!(map.insert(5, 55));
            assert_eq!(map.remove(&5), Some(55));
        }

        assert_eq!(map.capacity(), 16);
        assert!(!map.contains_key(&5));
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn load_factor_is_clamped() {
        let mut map: DenseMap<u32, u64, _> =
            DenseMap::with_capacity_and_load_factor(16, 0.99, IdentityState).unwrap();
        for k in 1..=15u32 {
            map.insert(k, 0);
        }

        // Clamped to 0.9, so the fifteenth insert crossed 16 * 0.9 = 14.4
        // and doubled the table.
        assert_eq!(map.capacity(), 32);
    }

    #[test]
    fn zero_load_factor_is_floored() {
        let mut map: DenseMap<u32, u64, _> =
            DenseMap::with_capacity_and_load_factor(16, 0.0, IdentityState).unwrap();
        for k in 0..32u32 {
            assert!(map.insert(k, u64::from(k)));
        }

        // Floored to 0.125, so the table doubles on load like any other
        // configuration instead of resizing on every insert.
        assert_eq!(map.len(), 32);
        assert_eq!(map.capacity(), 256);
        for k in 0..32u32 {
            assert_eq!(map.get(&k), Some(&u64::from(k)));
        }
    }

    #[test]
    fn clear_resets_but_keeps_capacity() {
        let mut map = identity_map();
        for k in 0..30u32 {
            map.insert(k, u64::from(k));
        }
        let capacity = map.capacity();

        map.clear();

        assert_eq!(map.len(), 0);
        assert_eq!(map.capacity(), capacity);
        for k in 0..30u32 {
            assert_eq!(map.get(&k), None);
        }

        assert!(map.insert(3, 33));
        assert_eq!(map.get(&3), Some(&33));
    }

    #[test]
    fn iter_yields_each_entry_once() {
        let mut map = identity_map();
        for k in 10..20u32 {
            map.insert(k, u64::from(k) + 1);
        }

        let mut keys: Vec<u32> = map.keys().copied().collect();
        keys.sort_unstable();
        assert_eq!(keys, (10..20u32).collect::<Vec<_>>());

        let total: u64 = map.values().sum();
        assert_eq!(total, (10..20u64).map(|k| k + 1).sum());

        assert_eq!(map.iter().count(), map.len());
    }

    #[test]
    fn drain_empties_the_map() {
        let mut map = identity_map();
        for k in 0..10u32 {
            map.insert(k, u64::from(k));
        }

        let mut drained: Vec<(u32, u64)> = map.drain().collect();
        drained.sort_unstable();
        assert_eq!(drained.len(), 10);
        assert_eq!(drained[3], (3, 3));

        assert_eq!(map.len(), 0);
        assert_eq!(map.get(&3), None);
        assert!(map.insert(3, 30));
    }

    #[test]
    fn dropping_drain_midway_drops_the_rest() {
        let mut map: DenseMap<u32, String, _> =
            DenseMap::with_capacity_and_hasher(16, IdentityState).unwrap();
        for k in 0..8u32 {
            map.insert(k, k.to_string());
        }

        {
            let mut drain = map.drain();
            drain.next();
            drain.next();
        }

        assert_eq!(map.len(), 0);
        assert!(map.is_empty());
    }

    #[test]
    fn clone_preserves_contents() {
        let mut map: DenseMap<u32, String, _> =
            DenseMap::with_capacity_and_hasher(16, IdentityState).unwrap();
        for k in 0..20u32 {
            map.insert(k, k.to_string());
        }

        let cloned = map.clone();
        assert_eq!(cloned.len(), map.len());
        for k in 0..20u32 {
            assert_eq!(cloned.get(&k), Some(&k.to_string()));
        }
    }

    #[test]
    fn copy_from_uses_public_insert_semantics() {
        let mut target = identity_map();
        target.insert(1, 10);

        let mut source = identity_map();
        source.insert(1, 99);
        source.insert(2, 20);
        source.insert(3, 30);

        target.copy_from(&source);

        assert_eq!(target.len(), 3);
        // The duplicate key kept its resident value.
        assert_eq!(target.get(&1), Some(&10));
        assert_eq!(target.get(&2), Some(&20));
        assert_eq!(target.get(&3), Some(&30));
    }

    #[test]
    fn index_operator_returns_value() {
        let mut map = identity_map();
        map.insert(8, 80);
        assert_eq!(map[&8], 80);
    }

    #[test]
    #[should_panic(expected = "key not found")]
    fn index_operator_panics_on_missing_key() {
        let map = identity_map();
        let _ = map[&1];
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn insert_many_random_hash() {
        let state = SipState::random();
        let mut map: DenseMap<u64, u64, _> =
            DenseMap::with_capacity_and_hasher(0, state).unwrap();

        for k in 0..100_000u64 {
            assert!(map.insert(k, k.wrapping_mul(31)));
        }

        assert_eq!(map.len(), 100_000);
        for k in 0..100_000u64 {
            assert_eq!(map.get(&k), Some(&k.wrapping_mul(31)));
        }
        assert!(map.get(&100_001).is_none());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn removal_sweep_random_hash() {
        let state = SipState::random();
        let mut map: DenseMap<u64, u64, _> =
            DenseMap::with_capacity_and_hasher(0, state).unwrap();

        for k in 0..10_000u64 {
            map.insert(k, k);
        }
        for k in 0..10_000u64 {
            if k % 3 == 0 {
                assert_eq!(map.remove(&k), Some(k));
            }
        }

        for k in 0..10_000u64 {
            if k % 3 == 0 {
                assert!(!map.contains_key(&k));
            } else {
                assert_eq!(map.get(&k), Some(&k));
            }
        }
    }

    #[test]
    fn entries_survive_repeated_rehash() {
        let mut map: DenseMap<u32, String, _> =
            DenseMap::with_capacity_and_hasher(16, IdentityState).unwrap();
        for k in 0..500u32 {
            map.insert(k, k.to_string());
        }

        assert!(map.capacity() >= 512);
        for k in 0..500u32 {
            assert_eq!(map.get(&k), Some(&k.to_string()));
        }
    }
}
