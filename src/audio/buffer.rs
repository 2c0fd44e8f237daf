//! Frame queues between the audio pipelines and the sockets
//!
//! The same circular queue serves both directions: the outbound queue sits
//! between the frame assembler and the socket-send thread, the jitter buffer
//! between the socket-receive thread and playback. When full, the oldest
//! frame is evicted, so staleness stays bounded.

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::chunk::{ByteSource, ChunkSink};

/// Bounded FIFO of raw frames that evicts the oldest entry on overflow
pub struct FrameRing {
    queue: ArrayQueue<Bytes>,
    /// Paired with `ready`, held while notifying so a waiter cannot miss a push
    signal: Mutex<()>,
    ready: Condvar,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            signal: Mutex::new(()),
            ready: Condvar::new(),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Push a frame, evicting the oldest one if full.
    /// Returns false if something was evicted.
    pub fn push(&self, frame: Bytes) -> bool {
        let evicted = self.queue.force_push(frame).is_some();
        if evicted {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
        }

        let _guard = self.signal.lock();
        self.ready.notify_one();
        !evicted
    }

    pub fn try_pop(&self) -> Option<Bytes> {
        self.queue.pop()
    }

    /// Wait up to `timeout` for a frame
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Bytes> {
        if let Some(frame) = self.queue.pop() {
            return Some(frame);
        }

        let mut guard = self.signal.lock();
        if self.queue.is_empty() {
            self.ready.wait_for(&mut guard, timeout);
        }
        drop(guard);
        self.queue.pop()
    }

    /// Drop every queued frame
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    pub(crate) fn record_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    pub fn reset_stats(&self) {
        self.overflow_count.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
    }
}

/// Thread-safe handle to a frame ring
pub type SharedFrameRing = Arc<FrameRing>;

/// Create a new shared frame ring
pub fn create_shared_ring(capacity: usize) -> SharedFrameRing {
    Arc::new(FrameRing::new(capacity))
}

/// Packs the framed chunk stream into fixed-size frames, one per datagram
pub struct FrameAssembler {
    ring: SharedFrameRing,
    frame: Vec<u8>,
    frame_size: usize,
}

impl FrameAssembler {
    pub fn new(ring: SharedFrameRing, frame_size: usize) -> Self {
        Self {
            ring,
            frame: Vec::with_capacity(frame_size),
            frame_size: frame_size.max(1),
        }
    }

    fn emit(&mut self) {
        let frame = std::mem::replace(&mut self.frame, Vec::with_capacity(self.frame_size));
        self.ring.push(Bytes::from(frame));
    }
}

impl ChunkSink for FrameAssembler {
    fn write(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let room = self.frame_size - self.frame.len();
            let take = room.min(bytes.len());
            self.frame.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.frame.len() == self.frame_size {
                self.emit();
            }
        }
    }

    /// Pad the partial frame with zeros and queue it
    fn flush(&mut self) {
        if self.frame.is_empty() {
            return;
        }
        self.frame.resize(self.frame_size, 0);
        self.emit();
    }
}

/// Byte-level consumer of the jitter buffer.
///
/// Never blocks: an empty buffer yields a zero-filled frame. After
/// `exhaustion_frames` silent frames in a row it reports exhaustion once by
/// returning 0, then starts over. Once released it returns 0 for good.
pub struct JitterReader {
    ring: SharedFrameRing,
    current: Bytes,
    position: usize,
    zero_frame: Bytes,
    silent_frames: usize,
    exhaustion_frames: usize,
    released: Arc<AtomicBool>,
}

/// Ends a [`JitterReader`] from another thread
#[derive(Clone)]
pub struct JitterRelease(Arc<AtomicBool>);

impl JitterRelease {
    pub fn release(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl JitterReader {
    pub fn new(ring: SharedFrameRing, frame_size: usize, exhaustion_frames: usize) -> Self {
        Self {
            ring,
            current: Bytes::new(),
            position: 0,
            zero_frame: Bytes::from(vec![0u8; frame_size.max(1)]),
            silent_frames: 0,
            exhaustion_frames: exhaustion_frames.max(1),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn release_handle(&self) -> JitterRelease {
        JitterRelease(self.released.clone())
    }

    /// Load the next frame; false once the silence run hits the limit
    fn advance(&mut self) -> bool {
        self.position = 0;
        if let Some(frame) = self.ring.try_pop() {
            self.current = frame;
            self.silent_frames = 0;
            return true;
        }

        self.ring.record_underrun();
        if self.silent_frames >= self.exhaustion_frames {
            self.silent_frames = 0;
            self.current = Bytes::new();
            return false;
        }
        self.silent_frames += 1;
        self.current = self.zero_frame.clone();
        true
    }
}

impl ByteSource for JitterReader {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.released.load(Ordering::SeqCst) {
            return 0;
        }
        let mut filled = 0;
        while filled < buf.len() {
            if self.position >= self.current.len() && !self.advance() {
                break;
            }
            let available = &self.current[self.position..];
            let take = available.len().min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&available[..take]);
            self.position += take;
            filled += take;
        }
        filled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 4])
    }

    #[test]
    fn test_ring_fifo() {
        let ring = FrameRing::new(4);
        assert!(ring.push(frame(1)));
        assert!(ring.push(frame(2)));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.try_pop().unwrap(), frame(1));
        assert_eq!(ring.try_pop().unwrap(), frame(2));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let ring = FrameRing::new(3);
        for tag in 1..=5 {
            ring.push(frame(tag));
        }
        assert_eq!(ring.overflow_count(), 2);
        let drained: Vec<_> = std::iter::from_fn(|| ring.try_pop()).collect();
        assert_eq!(drained, vec![frame(3), frame(4), frame(5)]);
    }

    #[test]
    fn test_pop_timeout_wakes_on_push() {
        let ring = create_shared_ring(3);
        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                ring.push(frame(9));
            })
        };
        let popped = ring.pop_timeout(Duration::from_secs(5));
        producer.join().unwrap();
        assert_eq!(popped, Some(frame(9)));
    }

    #[test]
    fn test_pop_timeout_expires_empty() {
        let ring = FrameRing::new(3);
        assert_eq!(ring.pop_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn test_assembler_emits_full_frames() {
        let ring = create_shared_ring(8);
        let mut assembler = FrameAssembler::new(ring.clone(), 4);

        assembler.write(&[1, 2, 3]);
        assert!(ring.is_empty());
        assembler.write(&[4, 5, 6, 7, 8, 9]);
        assert_eq!(ring.len(), 2);

        assembler.flush();
        assert_eq!(ring.try_pop().unwrap().as_ref(), &[1, 2, 3, 4]);
        assert_eq!(ring.try_pop().unwrap().as_ref(), &[5, 6, 7, 8]);
        assert_eq!(ring.try_pop().unwrap().as_ref(), &[9, 0, 0, 0]);
    }

    #[test]
    fn test_reader_zero_fills_empty_buffer() {
        let ring = create_shared_ring(3);
        let mut reader = JitterReader::new(ring.clone(), 8, 4);

        let mut buf = [0xAAu8; 8];
        assert_eq!(reader.read(&mut buf), 8);
        assert_eq!(buf, [0u8; 8]);
        assert_eq!(ring.underrun_count(), 1);
    }

    #[test]
    fn test_reader_spans_frames() {
        let ring = create_shared_ring(3);
        ring.push(Bytes::from_static(&[1, 2, 3]));
        ring.push(Bytes::from_static(&[4, 5, 6]));
        let mut reader = JitterReader::new(ring, 3, 4);

        let mut buf = [0u8; 5];
        assert_eq!(reader.read(&mut buf), 5);
        assert_eq!(buf, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_reader_reports_exhaustion_once() {
        let ring = create_shared_ring(3);
        let mut reader = JitterReader::new(ring.clone(), 2, 2);

        let mut byte = [0u8; 1];
        // Two silent frames of two bytes each
        for _ in 0..4 {
            assert_eq!(reader.read(&mut byte), 1);
        }
        assert_eq!(reader.read(&mut byte), 0);

        ring.push(Bytes::from_static(&[7, 7]));
        assert_eq!(reader.read(&mut byte), 1);
        assert_eq!(byte[0], 7);
    }

    #[test]
    fn test_released_reader_stays_empty() {
        let ring = create_shared_ring(3);
        let mut reader = JitterReader::new(ring.clone(), 2, 2);
        reader.release_handle().release();

        ring.push(Bytes::from_static(&[7, 7]));
        let mut byte = [0u8; 1];
        assert_eq!(reader.read(&mut byte), 0);
        assert_eq!(reader.read(&mut byte), 0);
    }

    proptest! {
        #[test]
        fn prop_overflow_keeps_newest(capacity in 1usize..8, extra in 1usize..16) {
            let ring = FrameRing::new(capacity);
            let total = capacity + extra;
            for i in 0..total {
                ring.push(Bytes::from(vec![i as u8]));
            }
            let drained: Vec<u8> = std::iter::from_fn(|| ring.try_pop()).map(|f| f[0]).collect();
            let expected: Vec<u8> = (extra..total).map(|i| i as u8).collect();
            prop_assert_eq!(drained, expected);
        }
    }
}
