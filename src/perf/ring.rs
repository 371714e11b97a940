use std::ptr;
use std::sync::atomic::{fence, Ordering};

use super::sys::PerfEventMmapPage;

/// Reader over one kernel sample ring. The mapping starts with the meta
/// page; the data area of `data_size` bytes (a power of two) follows.
///
/// The kernel publishes records by advancing `data_head`; consuming them
/// means copying out and advancing `data_tail`. `data_head` is read with
/// acquire semantics and `data_tail` written with release semantics, and
/// the kernel guarantees `data_head` never wraps over an unconsumed
/// `data_tail`.
pub struct RingBuffer {
    base: *mut u8,
    page_size: usize,
    data_size: u64,
}

unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// # Safety
    ///
    /// `base` must point to a live perf mmap area of
    /// `(data_pages + 1) * page_size` bytes, and `data_pages` must be a
    /// power of two.
    pub unsafe fn new(base: *mut u8, data_pages: usize, page_size: usize) -> Self {
        debug_assert!(data_pages.is_power_of_two());
        RingBuffer {
            base,
            page_size,
            data_size: (data_pages * page_size) as u64,
        }
    }

    fn meta(&self) -> *mut PerfEventMmapPage {
        self.base as *mut PerfEventMmapPage
    }

    fn data(&self) -> *mut u8 {
        unsafe { self.base.add(self.page_size) }
    }

    fn read_head(&self) -> u64 {
        let head = unsafe { ptr::read_volatile(&(*self.meta()).data_head) };
        fence(Ordering::Acquire);
        head
    }

    fn read_tail(&self) -> u64 {
        // Only this reader writes the tail, no barrier needed to re-read it.
        unsafe { ptr::read_volatile(&(*self.meta()).data_tail) }
    }

    fn write_tail(&mut self, value: u64) {
        fence(Ordering::AcqRel);
        unsafe { ptr::write_volatile(&mut (*self.meta()).data_tail, value) };
    }

    pub fn pending(&self) -> u64 {
        self.read_head().wrapping_sub(self.read_tail())
    }

    /// Copy out exactly `buf.len()` bytes, advancing the tail. Returns
    /// false, consuming nothing, when fewer bytes are available; a record
    /// half-written at the tail stays in place for the next read.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> bool {
        let head = self.read_head();
        let tail = self.read_tail();
        let size = buf.len() as u64;

        if head.wrapping_sub(tail) < size {
            return false;
        }

        let offset = (tail & (self.data_size - 1)) as usize;
        let first = std::cmp::min(size as usize, self.data_size as usize - offset);
        unsafe {
            ptr::copy_nonoverlapping(self.data().add(offset), buf.as_mut_ptr(), first);
            if first < buf.len() {
                ptr::copy_nonoverlapping(
                    self.data(),
                    buf.as_mut_ptr().add(first),
                    buf.len() - first,
                );
            }
        }

        self.write_tail(tail + size);
        true
    }

    /// Drop up to `size` bytes of unread content.
    pub fn skip(&mut self, size: usize) {
        let head = self.read_head();
        let tail = self.read_tail();
        let size = std::cmp::min(size as u64, head.wrapping_sub(tail));
        self.write_tail(tail + size);
    }

    /// Drop everything the kernel has published so far.
    pub fn reset(&mut self) {
        let head = self.read_head();
        self.write_tail(head);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const TEST_PAGE: usize = 4096;

    /// A fake ring living in plain memory, with a writer that mimics the
    /// kernel side (wrap-aware copy, release-publish of `data_head`).
    pub struct TestRing {
        mem: Vec<u64>,
        data_pages: usize,
    }

    impl TestRing {
        pub fn new(data_pages: usize) -> Self {
            let total = (data_pages + 1) * TEST_PAGE;
            TestRing {
                mem: vec![0u64; total / 8],
                data_pages,
            }
        }

        pub fn base(&mut self) -> *mut u8 {
            self.mem.as_mut_ptr() as *mut u8
        }

        pub fn reader(&mut self) -> RingBuffer {
            unsafe { RingBuffer::new(self.base(), self.data_pages, TEST_PAGE) }
        }

        pub fn push(&mut self, bytes: &[u8]) {
            let data_size = (self.data_pages * TEST_PAGE) as u64;
            let base = self.base();
            let meta = base as *mut PerfEventMmapPage;
            let head = unsafe { ptr::read_volatile(&(*meta).data_head) };

            let offset = (head & (data_size - 1)) as usize;
            let first = std::cmp::min(bytes.len(), data_size as usize - offset);
            unsafe {
                let data = base.add(TEST_PAGE);
                ptr::copy_nonoverlapping(bytes.as_ptr(), data.add(offset), first);
                if first < bytes.len() {
                    ptr::copy_nonoverlapping(bytes.as_ptr().add(first), data, bytes.len() - first);
                }
                fence(Ordering::Release);
                ptr::write_volatile(&mut (*meta).data_head, head + bytes.len() as u64);
            }
        }
    }

    #[test]
    fn wrapped_stream_reads_back_byte_for_byte() {
        let data_pages = 2;
        let data_size = data_pages * TEST_PAGE;
        let mut ring = TestRing::new(data_pages);

        // More than one full ring of traffic, pushed and drained in
        // chunks so the tail keeps making room.
        let total = data_size + data_size / 2 + 13;
        let written: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let mut read_back = Vec::new();

        let chunk = 1000;
        let mut reader = ring.reader();
        let mut pos = 0;
        while pos < written.len() {
            let n = std::cmp::min(chunk, written.len() - pos);
            ring.push(&written[pos..pos + n]);
            pos += n;

            let mut buf = vec![0u8; n];
            assert!(reader.read_exact(&mut buf));
            read_back.extend_from_slice(&buf);
        }

        assert_eq!(read_back, written);
    }

    #[test]
    fn partial_record_survives_two_reads() {
        let mut ring = TestRing::new(1);
        ring.push(&[1u8; 20]);

        let mut reader = ring.reader();
        let mut buf16 = [0u8; 16];
        assert!(reader.read_exact(&mut buf16));

        // Only 4 of 16 bytes are there: nothing must be consumed.
        assert!(!reader.read_exact(&mut buf16));
        assert_eq!(reader.pending(), 4);

        ring.push(&[2u8; 12]);
        assert!(reader.read_exact(&mut buf16));
        assert_eq!(&buf16[..4], &[1u8; 4]);
        assert_eq!(&buf16[4..], &[2u8; 12]);
    }

    #[test]
    fn skip_and_reset_reclaim_content() {
        let mut ring = TestRing::new(1);
        ring.push(&[7u8; 100]);

        let mut reader = ring.reader();
        reader.skip(40);
        assert_eq!(reader.pending(), 60);

        // Skipping past the head clamps to the head.
        reader.skip(1000);
        assert_eq!(reader.pending(), 0);

        ring.push(&[8u8; 10]);
        reader.reset();
        assert_eq!(reader.pending(), 0);
    }
}
