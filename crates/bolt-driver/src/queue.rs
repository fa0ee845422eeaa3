use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// Avoid false sharing between the producer and consumer cursors.
#[repr(align(64))]
struct CachePadded<T>(T);

struct Slot<T> {
    full: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Lock-free single-producer single-consumer ring.
///
/// Capacity rounds up to a power of two. Each slot carries its own full flag:
/// the producer publishes with a release store after writing the value, the
/// consumer acquires it before reading. Head and tail live on separate cache
/// lines and are only ever written by their own side.
///
/// Exactly one thread may push and one may pop. Use two queues rather than
/// one MPMC when traffic flows both ways.
pub struct RingQueue<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        let slots = (0..capacity)
            .map(|_| Slot { full: AtomicBool::new(false), value: UnsafeCell::new(MaybeUninit::uninit()) })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Producer side. Returns the item back when the ring is full; the caller
    /// yields and retries, no blocking on the hot path.
    pub fn push(&self, item: T) -> Result<(), T> {
        let pos = self.tail.0.load(Ordering::Relaxed);
        let slot = &self.slots[pos & self.mask];
        if slot.full.load(Ordering::Acquire) {
            return Err(item);
        }
        unsafe { (*slot.value.get()).write(item) };
        slot.full.store(true, Ordering::Release);
        self.tail.0.store(pos.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side.
    pub fn pop(&self) -> Option<T> {
        let pos = self.head.0.load(Ordering::Relaxed);
        let slot = &self.slots[pos & self.mask];
        if !slot.full.load(Ordering::Acquire) {
            return None;
        }
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        slot.full.store(false, Ordering::Release);
        self.head.0.store(pos.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Racy by nature; exact only from the consumer thread.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.0.load(Ordering::Acquire);
        let head = self.head.0.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let q: RingQueue<u32> = RingQueue::new(10);
        assert_eq!(q.capacity(), 16);
    }

    #[test]
    fn fifo_order() {
        let q = RingQueue::new(8);
        for i in 0..8 {
            q.push(i).unwrap();
        }
        assert!(q.push(99).is_err());
        for i in 0..8 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn wraps_many_times() {
        let q = RingQueue::new(4);
        for i in 0..1000u32 {
            q.push(i).unwrap();
            assert_eq!(q.pop(), Some(i));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn full_then_drain_then_reuse() {
        let q = RingQueue::new(2);
        q.push("a".to_string()).unwrap();
        q.push("b".to_string()).unwrap();
        assert!(q.push("c".to_string()).is_err());
        assert_eq!(q.pop().as_deref(), Some("a"));
        q.push("c".to_string()).unwrap();
        assert_eq!(q.pop().as_deref(), Some("b"));
        assert_eq!(q.pop().as_deref(), Some("c"));
    }

    #[test]
    fn drops_undrained_items() {
        let q = RingQueue::new(8);
        q.push(Arc::new(1)).unwrap();
        let probe = Arc::new(2);
        q.push(probe.clone()).unwrap();
        drop(q);
        assert_eq!(Arc::strong_count(&probe), 1);
    }

    fn soak(total: usize, capacity: usize) {
        let q = Arc::new(RingQueue::new(capacity));

        let consumer = {
            let q = q.clone();
            std::thread::spawn(move || {
                let mut expected = 0usize;
                while expected < total {
                    if let Some(v) = q.pop() {
                        assert_eq!(v, expected);
                        expected += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            })
        };

        let producer = {
            let q = q.clone();
            std::thread::spawn(move || {
                for i in 0..total {
                    let mut item = i;
                    loop {
                        match q.push(item) {
                            Ok(()) => break,
                            Err(back) => {
                                item = back;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
    }

    #[test]
    fn spsc_soak_small_ring() {
        soak(100_000, 4);
    }

    #[test]
    fn spsc_soak_large_ring() {
        soak(100_000, 1024);
    }
}
