use std::{
    alloc::{self, Layout},
    ops::Range,
    ptr::NonNull,
};

const CACHE_LINE_SIZE: usize = 64;

/// Reserved bytes at the end of the allocation that are never offered as
/// writable. Gives the decoder safe over-read slack near the write cursor.
pub const TAIL_SIZE: usize = 1024;

/// Chunk size + tail. Shrink never goes below this.
pub const MIN_CAPACITY: usize = 65_536 + 4;

const DEFAULT_CAPACITY: usize = 65_536 * 4;

/// Receive-volume statistics driving buffer grow/shrink decisions.
#[derive(Clone, Copy, Debug, Default)]
struct BufferStats {
    last_bytes_recvd: usize,
    ema_recv: f64,
}

impl BufferStats {
    /// EMA smoothing factor.
    const ALPHA: f64 = 0.2;
    const GROW_THRESHOLD: f64 = 0.8;
    const SHRINK_THRESHOLD: f64 = 0.8;

    #[inline]
    fn update(&mut self, bytes_this_cycle: usize) {
        self.last_bytes_recvd = bytes_this_cycle;
        self.ema_recv = Self::ALPHA * bytes_this_cycle as f64 + (1.0 - Self::ALPHA) * self.ema_recv;
    }

    #[inline]
    fn should_grow(&self, capacity: usize) -> bool {
        self.ema_recv > capacity as f64 * Self::GROW_THRESHOLD
    }

    #[inline]
    fn should_shrink(&self, capacity: usize) -> bool {
        self.ema_recv < capacity as f64 * Self::SHRINK_THRESHOLD
    }
}

/// Cache-line-aligned resizable I/O buffer with independent read and write
/// cursors. `len() == write - read` is the number of bytes awaiting
/// consumption.
///
/// Growth preserves bytes up to the write cursor and both cursors; shrink
/// compacts the live `read..write` range to the front. Decoded values holding
/// views into this buffer are invalidated by `consume` past their bytes, by
/// `reset` and by reallocation.
pub struct ByteBuffer {
    data: NonNull<u8>,
    capacity: usize,
    write: usize,
    read: usize,
    stats: BufferStats,
}

// One owner; views handed out borrow the buffer.
unsafe impl Send for ByteBuffer {}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = align_capacity(capacity.max(MIN_CAPACITY));
        Self {
            data: allocate_aligned(capacity),
            capacity,
            write: 0,
            read: 0,
            stats: BufferStats::default(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn write_pos(&self) -> usize {
        self.write
    }

    #[inline]
    pub fn read_pos(&self) -> usize {
        self.read
    }

    /// Bytes written but not yet consumed.
    #[inline]
    pub fn len(&self) -> usize {
        self.write - self.read
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.write == self.read
    }

    /// Bytes that can be written before a grow is needed. The tail region is
    /// never offered.
    #[inline]
    pub fn writable_len(&self) -> usize {
        (self.capacity - TAIL_SIZE).saturating_sub(self.write)
    }

    /// The unwritten region at the write cursor, excluding the tail.
    #[inline]
    pub fn writable(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.data.as_ptr().add(self.write), self.writable_len())
        }
    }

    /// The `read..write` region awaiting consumption.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr().add(self.read), self.len()) }
    }

    /// An arbitrary written span, for header patching.
    #[inline]
    pub fn span_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        debug_assert!(range.end <= self.write);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.data.as_ptr().add(range.start),
                range.end - range.start,
            )
        }
    }

    /// Move the write cursor forward over bytes placed via `writable()`.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        self.write += n;
        debug_assert!(self.write <= self.capacity);
    }

    /// Move the read cursor forward over processed bytes.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        self.read += n;
        debug_assert!(self.read <= self.write);
    }

    /// Copy `bytes` in at the write cursor, growing if needed.
    #[inline]
    pub fn write(&mut self, bytes: &[u8]) {
        self.ensure_space(bytes.len());
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.data.as_ptr().add(self.write),
                bytes.len(),
            );
        }
        self.write += bytes.len();
    }

    /// Overwrite already-written bytes at `pos` (length-word patching).
    #[inline]
    pub fn write_at(&mut self, pos: usize, bytes: &[u8]) {
        debug_assert!(pos + bytes.len() <= self.write);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.as_ptr().add(pos), bytes.len());
        }
    }

    /// Reserve `n` writable bytes without writing them (the caller will patch
    /// the span later).
    #[inline]
    pub fn skip(&mut self, n: usize) {
        self.ensure_space(n);
        self.write += n;
    }

    /// Make room for `n` more bytes, doubling capacity as needed.
    #[inline]
    pub fn ensure_space(&mut self, n: usize) {
        if self.writable_len() < n {
            self.grow(n);
        }
    }

    /// Doubles capacity until `write + n + TAIL_SIZE` fits, unless traffic
    /// stats say the current capacity is already comfortable and `n` fits.
    /// Bytes up to the write cursor and both cursors are preserved.
    pub fn grow(&mut self, n: usize) {
        if !self.stats.should_grow(self.capacity) && self.write + n <= self.capacity - TAIL_SIZE {
            return;
        }

        let mut new_capacity = self.capacity << 1;
        while self.write + n > new_capacity - TAIL_SIZE {
            new_capacity <<= 1;
        }

        self.reallocate(new_capacity, false);
    }

    /// If the receive EMA has dropped well below capacity, reallocate down to
    /// `align(max(2 * len, MIN_CAPACITY))` and compact the live bytes to the
    /// front.
    pub fn shrink(&mut self) {
        if !self.stats.should_shrink(self.capacity) {
            return;
        }

        let target = align_capacity((self.len() << 1).max(MIN_CAPACITY));
        if target >= self.capacity {
            return;
        }

        self.reallocate(target, true);
    }

    /// Cursor-only reset; no deallocation.
    #[inline]
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    /// Rewind only the read cursor.
    #[inline]
    pub fn reset_read(&mut self) {
        self.read = 0;
    }

    /// Feed the EMA with this cycle's receive volume.
    #[inline]
    pub fn update_stats(&mut self, bytes_this_cycle: usize) {
        self.stats.update(bytes_this_cycle);
    }

    fn reallocate(&mut self, new_capacity: usize, compact: bool) {
        let new_data = allocate_aligned(new_capacity);
        unsafe {
            if compact {
                let used = self.len();
                std::ptr::copy_nonoverlapping(
                    self.data.as_ptr().add(self.read),
                    new_data.as_ptr(),
                    used,
                );
                self.write = used;
                self.read = 0;
            } else {
                std::ptr::copy_nonoverlapping(self.data.as_ptr(), new_data.as_ptr(), self.write);
            }
            alloc::dealloc(self.data.as_ptr(), layout_for(self.capacity));
        }
        self.data = new_data;
        self.capacity = new_capacity;
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ByteBuffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.data.as_ptr(), layout_for(self.capacity)) }
    }
}

impl std::fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("capacity", &self.capacity)
            .field("read", &self.read)
            .field("write", &self.write)
            .finish()
    }
}

fn layout_for(capacity: usize) -> Layout {
    Layout::from_size_align(capacity, CACHE_LINE_SIZE).expect("buffer layout")
}

fn allocate_aligned(capacity: usize) -> NonNull<u8> {
    let ptr = unsafe { alloc::alloc_zeroed(layout_for(capacity)) };
    NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout_for(capacity)))
}

fn align_capacity(n: usize) -> usize {
    n.div_ceil(CACHE_LINE_SIZE) * CACHE_LINE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_and_min_capacity() {
        let buf = ByteBuffer::with_capacity(1);
        assert_eq!(buf.capacity() % CACHE_LINE_SIZE, 0);
        assert!(buf.capacity() >= MIN_CAPACITY);
        assert_eq!(buf.data.as_ptr() as usize % CACHE_LINE_SIZE, 0);
    }

    #[test]
    fn write_read_cursors() {
        let mut buf = ByteBuffer::new();
        buf.write(b"hello");
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.readable(), b"hello");
        buf.consume(2);
        assert_eq!(buf.readable(), b"llo");
        buf.reset_read();
        assert_eq!(buf.readable(), b"hello");
        buf.reset();
        assert!(buf.is_empty());
    }

    #[test]
    fn grow_preserves_live_bytes() {
        let mut buf = ByteBuffer::new();
        let payload: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        buf.write(&payload);
        buf.consume(100);
        let before: Vec<u8> = buf.readable().to_vec();

        let cap = buf.capacity();
        buf.grow(cap * 2);
        assert!(buf.capacity() > cap);
        assert_eq!(buf.readable(), &before[..]);
        assert_eq!(buf.read_pos(), 100);
    }

    #[test]
    fn ensure_space_doubles_until_fit() {
        let mut buf = ByteBuffer::new();
        let cap = buf.capacity();
        let huge = vec![0xAB; cap * 3];
        buf.write(&huge);
        assert!(buf.capacity() >= cap * 3 + TAIL_SIZE);
        assert_eq!(buf.readable(), &huge[..]);
    }

    #[test]
    fn tail_is_never_writable() {
        let mut buf = ByteBuffer::new();
        assert_eq!(buf.writable_len(), buf.capacity() - TAIL_SIZE);
        let n = buf.writable().len();
        assert_eq!(n, buf.capacity() - TAIL_SIZE);
    }

    #[test]
    fn shrink_compacts_when_traffic_drops() {
        let mut buf = ByteBuffer::with_capacity(MIN_CAPACITY);
        // Force growth to a large capacity first.
        let big = vec![1u8; MIN_CAPACITY * 4];
        buf.write(&big);
        let grown = buf.capacity();
        assert!(grown > MIN_CAPACITY);

        buf.consume(big.len() - 16);
        // Quiet traffic: EMA decays toward zero.
        for _ in 0..16 {
            buf.update_stats(0);
        }
        buf.shrink();
        assert!(buf.capacity() < grown);
        assert_eq!(buf.len(), 16);
        assert_eq!(buf.read_pos(), 0);
        assert_eq!(buf.readable(), &big[..16]);
    }

    #[test]
    fn shrink_holds_while_traffic_high() {
        let mut buf = ByteBuffer::with_capacity(MIN_CAPACITY);
        let big = vec![1u8; MIN_CAPACITY * 4];
        buf.write(&big);
        let grown = buf.capacity();

        for _ in 0..16 {
            buf.update_stats(grown);
        }
        buf.shrink();
        assert_eq!(buf.capacity(), grown);
    }
}
