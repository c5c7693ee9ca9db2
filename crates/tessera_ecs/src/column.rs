// column.rs - Type-erased component column
//
// One contiguous buffer per sized id per table, allocated with the layout
// the component was registered with. The column drives registered hooks for
// default-construction and drop; moves between columns are bitwise. Rows are
// removed by swap-remove only; callers are responsible for fixing up the
// entity index entry of the row that moved into the hole.

use crate::component::TypeInfo;
use crate::error::{EcsError, EcsResult};
use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

/// Raw storage for every value of one component across a table's rows.
pub struct Column {
    size: usize,
    align: usize,
    len: usize,
    cap: usize,
    data: NonNull<u8>,
    default_fn: Option<unsafe fn(*mut u8)>,
    drop_fn: Option<unsafe fn(*mut u8)>,
}

// SAFETY: the buffer is uniquely owned by the column and only reachable
// through it; hook pointers come from types that are Send + Sync.
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl Column {
    const MIN_CAPACITY: usize = 8;

    /// Create an empty column for a sized component. Does not allocate.
    pub fn new(info: &TypeInfo) -> Self {
        debug_assert!(info.size > 0, "zero-sized ids do not get columns");
        Self {
            size: info.size,
            align: info.align,
            len: 0,
            cap: 0,
            data: NonNull::dangling(),
            default_fn: info.default_fn,
            drop_fn: info.drop_fn,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn element_size(&self) -> usize {
        self.size
    }

    /// Pointer to the value at `row`.
    #[inline]
    pub fn ptr(&self, row: usize) -> *mut u8 {
        debug_assert!(row < self.len, "row {} out of bounds (len {})", row, self.len);
        // SAFETY: row < len <= cap, and the buffer holds cap elements.
        unsafe { self.data.as_ptr().add(row * self.size) }
    }

    /// Append a default-constructed value, returning its row.
    pub fn push_default(&mut self) -> EcsResult<usize> {
        self.reserve_one()?;
        let row = self.len;
        // SAFETY: row < cap after reserve_one; the slot is uninitialized.
        unsafe {
            let dst = self.data.as_ptr().add(row * self.size);
            match self.default_fn {
                Some(default_fn) => default_fn(dst),
                None => ptr::write_bytes(dst, 0, self.size),
            }
        }
        self.len = row + 1;
        Ok(row)
    }

    /// Append a value moved in from `src` (bitwise), returning its row.
    ///
    /// The source bytes must not be dropped by the caller afterwards.
    pub fn push_moved_from(&mut self, src: *const u8) -> EcsResult<usize> {
        self.reserve_one()?;
        let row = self.len;
        // SAFETY: src holds one initialized value of this layout; dst is an
        // uninitialized slot inside the reserved buffer.
        unsafe {
            let dst = self.data.as_ptr().add(row * self.size);
            ptr::copy_nonoverlapping(src, dst, self.size);
        }
        self.len = row + 1;
        Ok(row)
    }

    /// Replace the initialized value at `row` with the bytes at `src`.
    ///
    /// The previous value is dropped; the source bytes are moved in and must
    /// not be dropped by the caller afterwards.
    pub fn replace_from(&mut self, row: usize, src: *const u8) {
        let dst = self.ptr(row);
        // SAFETY: dst holds an initialized value of this layout; src holds
        // another, and the two never alias (src comes from outside storage).
        unsafe {
            if let Some(drop_fn) = self.drop_fn {
                drop_fn(dst);
            }
            ptr::copy_nonoverlapping(src, dst, self.size);
        }
    }

    /// Remove `row` by swapping the last row into it and truncating.
    ///
    /// When `drop_removed` is false the removed value's bytes are forgotten
    /// instead of dropped (used after the value was moved to another column).
    pub fn swap_remove(&mut self, row: usize, drop_removed: bool) {
        debug_assert!(row < self.len);
        let last = self.len - 1;
        // SAFETY: row and last are both in-bounds initialized slots.
        unsafe {
            let dst = self.data.as_ptr().add(row * self.size);
            if drop_removed {
                if let Some(drop_fn) = self.drop_fn {
                    drop_fn(dst);
                }
            }
            if row != last {
                let src = self.data.as_ptr().add(last * self.size);
                ptr::copy_nonoverlapping(src, dst, self.size);
            }
        }
        self.len = last;
    }

    /// Drop and discard the last row. Used to roll back a partially built
    /// destination row when a later column fails to allocate.
    pub fn pop_drop(&mut self) {
        debug_assert!(self.len > 0);
        let last = self.len - 1;
        if let Some(drop_fn) = self.drop_fn {
            // SAFETY: last is an in-bounds initialized slot.
            unsafe { drop_fn(self.data.as_ptr().add(last * self.size)) }
        }
        self.len = last;
    }

    /// Discard the last row without dropping it. Used to roll back a
    /// moved-in value that still lives in its source column.
    pub fn pop_forget(&mut self) {
        debug_assert!(self.len > 0);
        self.len -= 1;
    }

    /// Drop every value and keep the allocation.
    pub fn clear(&mut self) {
        if let Some(drop_fn) = self.drop_fn {
            for row in 0..self.len {
                // SAFETY: every slot below len is initialized.
                unsafe { drop_fn(self.data.as_ptr().add(row * self.size)) }
            }
        }
        self.len = 0;
    }

    fn reserve_one(&mut self) -> EcsResult<()> {
        if self.len < self.cap {
            return Ok(());
        }
        let new_cap = (self.cap * 2).max(Self::MIN_CAPACITY);
        let bytes = new_cap
            .checked_mul(self.size)
            .ok_or(EcsError::AllocFailed { bytes: usize::MAX })?;
        let new_layout = Layout::from_size_align(bytes, self.align)
            .map_err(|_| EcsError::AllocFailed { bytes })?;
        // SAFETY: new_layout has non-zero size (size > 0, new_cap > 0).
        let new_data = unsafe { alloc::alloc(new_layout) };
        let Some(new_data) = NonNull::new(new_data) else {
            return Err(EcsError::AllocFailed { bytes });
        };
        if self.cap > 0 {
            // SAFETY: both buffers are live; len * size bytes are initialized
            // in the old one and fit in the new one.
            unsafe {
                ptr::copy_nonoverlapping(
                    self.data.as_ptr(),
                    new_data.as_ptr(),
                    self.len * self.size,
                );
                alloc::dealloc(self.data.as_ptr(), self.current_layout());
            }
        }
        self.data = new_data;
        self.cap = new_cap;
        Ok(())
    }

    fn current_layout(&self) -> Layout {
        // Reconstructs the layout used for the live allocation; only called
        // while cap > 0, so the original construction succeeded.
        Layout::from_size_align(self.cap * self.size, self.align)
            .expect("layout was valid at allocation time")
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        self.clear();
        if self.cap > 0 {
            // SAFETY: data was allocated with current_layout and all values
            // were dropped by clear().
            unsafe { alloc::dealloc(self.data.as_ptr(), self.current_layout()) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::TypeInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Tracked(u64);

    impl Default for Tracked {
        fn default() -> Self {
            Tracked(0xAB)
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked_column() -> Column {
        Column::new(&TypeInfo::of::<Tracked>("Tracked"))
    }

    fn read_u64(col: &Column, row: usize) -> u64 {
        // SAFETY: test columns only hold Tracked(u64).
        unsafe { *(col.ptr(row) as *const u64) }
    }

    #[test]
    fn push_default_runs_the_hook() {
        let mut col = tracked_column();
        let row = col.push_default().unwrap();
        assert_eq!(read_u64(&col, row), 0xAB);
        assert_eq!(col.len(), 1);
    }

    #[test]
    fn swap_remove_moves_last_into_hole() {
        let mut col = Column::new(&TypeInfo::of::<u64>("U64"));
        for v in [10u64, 20, 30] {
            let row = col.push_moved_from(&v as *const u64 as *const u8).unwrap();
            assert_eq!(row as u64 * 10 + 10, v);
        }
        col.swap_remove(0, true);
        assert_eq!(col.len(), 2);
        assert_eq!(read_u64(&col, 0), 30);
        assert_eq!(read_u64(&col, 1), 20);
    }

    #[test]
    fn moved_out_values_are_not_double_dropped() {
        DROPS.store(0, Ordering::SeqCst);
        let mut src = tracked_column();
        let mut dst = tracked_column();
        src.push_default().unwrap();
        dst.push_moved_from(src.ptr(0)).unwrap();
        src.swap_remove(0, false); // value now lives in dst
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);
        drop(dst);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        drop(src);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_drops_every_value() {
        DROPS.store(0, Ordering::SeqCst);
        let mut col = tracked_column();
        for _ in 0..5 {
            col.push_default().unwrap();
        }
        col.clear();
        assert_eq!(DROPS.load(Ordering::SeqCst), 5);
        assert!(col.is_empty());
    }
}
