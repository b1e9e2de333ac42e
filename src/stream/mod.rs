//! Stream fan-out
//!
//! A stream exists while a path has an active publisher. It owns one
//! drop-oldest ring per reader and a dedicated delivery task per reader,
//! so a slow reader loses its own oldest units instead of backpressuring
//! the publisher or its siblings.

mod ring;

pub use ring::UnitRing;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::media::{Media, TrackId, Unit};
use crate::session::SessionId;

/// Reader-side delivery callback. Invoked on the reader's delivery task,
/// never on the publisher's.
pub type UnitCallback = Arc<dyn Fn(Arc<Unit>) + Send + Sync>;

struct StreamReader {
    ring: Arc<UnitRing>,
    callbacks: HashMap<TrackId, UnitCallback>,
}

pub struct Stream {
    medias: Vec<Media>,
    ring_capacity: usize,
    generate_rtp_packets: bool,
    readers: Mutex<HashMap<SessionId, StreamReader>>,
    closed: AtomicBool,
    bytes_received: AtomicU64,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("medias", &self.medias)
            .field("ring_capacity", &self.ring_capacity)
            .field("generate_rtp_packets", &self.generate_rtp_packets)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("bytes_received", &self.bytes_received.load(Ordering::Relaxed))
            .finish()
    }
}

impl Stream {
    /// `ring_capacity` is the configured per-reader buffer depth
    /// (`readBufferCount`). `generate_rtp_packets` marks streams whose
    /// publisher hands over raw payloads, so reader-side packetizers know
    /// units will not carry original RTP.
    pub fn new(medias: Vec<Media>, ring_capacity: usize, generate_rtp_packets: bool) -> Arc<Self> {
        Arc::new(Self {
            medias,
            ring_capacity,
            generate_rtp_packets,
            readers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            bytes_received: AtomicU64::new(0),
        })
    }

    pub fn generate_rtp_packets(&self) -> bool {
        self.generate_rtp_packets
    }

    /// Immutable snapshot of the announced track list.
    pub fn medias(&self) -> &[Media] {
        &self.medias
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn reader_count(&self) -> usize {
        self.readers.lock().unwrap().len()
    }

    /// Fan a unit out to every reader registered for `track`. Non-blocking:
    /// full rings drop their oldest queued delivery.
    pub fn write_unit(&self, track: TrackId, unit: Unit) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.bytes_received
            .fetch_add(unit.size() as u64, Ordering::Relaxed);

        let unit = Arc::new(unit);
        let readers = self.readers.lock().unwrap();
        for reader in readers.values() {
            if let Some(cb) = reader.callbacks.get(&track) {
                let cb = Arc::clone(cb);
                let unit = Arc::clone(&unit);
                reader.ring.push(Box::new(move || cb(unit)));
            }
        }
    }

    /// Register `cb` for (reader, track). After this returns every future
    /// `write_unit` on the track is delivered to `cb`. Idempotent per
    /// (reader, track): a second registration replaces the callback.
    pub fn reader_add(&self, reader: SessionId, track: TrackId, cb: UnitCallback) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut readers = self.readers.lock().unwrap();
        let entry = readers.entry(reader).or_insert_with(|| {
            let ring = Arc::new(UnitRing::new(self.ring_capacity));
            spawn_delivery_task(Arc::clone(&ring));
            StreamReader {
                ring,
                callbacks: HashMap::new(),
            }
        });
        entry.callbacks.insert(track, cb);
    }

    /// Drop every registration of `reader` and close its ring; queued
    /// deliveries are discarded without being invoked.
    pub fn reader_remove(&self, reader: SessionId) {
        let removed = self.readers.lock().unwrap().remove(&reader);
        if let Some(removed) = removed {
            removed.ring.close();
        }
    }

    /// Units dropped so far because `reader` was too slow.
    pub fn reader_overflow(&self, reader: SessionId) -> u64 {
        self.readers
            .lock()
            .unwrap()
            .get(&reader)
            .map(|r| r.ring.overflow())
            .unwrap_or(0)
    }

    /// Final teardown. Subsequent `write_unit` is a no-op; every reader's
    /// delivery task ends once its ring drains its close signal.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut readers = self.readers.lock().unwrap();
        for (_, reader) in readers.drain() {
            reader.ring.close();
        }
    }
}

fn spawn_delivery_task(ring: Arc<UnitRing>) {
    tokio::spawn(async move {
        while let Some(item) = ring.pull().await {
            item();
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::media::{Codec, Format, MediaKind, RtpPacket};

    fn test_medias() -> Vec<Media> {
        vec![Media::new(
            MediaKind::Video,
            vec![Format::new(Codec::H264, 96, 90000)],
        )]
    }

    fn test_unit(seq: u16) -> Unit {
        Unit::from_rtp(
            Codec::H264,
            Duration::from_millis(u64::from(seq) * 40),
            RtpPacket {
                payload_type: 96,
                sequence_number: seq,
                timestamp: u32::from(seq) * 3000,
                ssrc: 1,
                marker: true,
                payload: Bytes::from_static(&[0x65, 0x00]),
            },
        )
    }

    fn track() -> TrackId {
        TrackId::new(0, 0)
    }

    fn collector() -> (UnitCallback, mpsc::UnboundedReceiver<u16>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cb: UnitCallback = Arc::new(move |unit: Arc<Unit>| {
            let _ = tx.send(unit.rtp_packets[0].sequence_number);
        });
        (cb, rx)
    }

    #[tokio::test]
    async fn test_delivery_in_order() {
        let stream = Stream::new(test_medias(), 512, false);
        let reader = SessionId::new();
        let (cb, mut rx) = collector();

        stream.reader_add(reader, track(), cb);
        for seq in 0..100 {
            stream.write_unit(track(), test_unit(seq));
        }

        for expected in 0..100 {
            assert_eq!(rx.recv().await, Some(expected));
        }
        assert_eq!(stream.reader_overflow(reader), 0);
    }

    #[tokio::test]
    async fn test_no_delivery_after_remove() {
        let stream = Stream::new(test_medias(), 512, false);
        let reader = SessionId::new();
        let (cb, mut rx) = collector();

        stream.reader_add(reader, track(), cb);
        stream.write_unit(track(), test_unit(0));
        assert_eq!(rx.recv().await, Some(0));

        stream.reader_remove(reader);
        stream.write_unit(track(), test_unit(1));

        // channel closes once the callback (and its sender) is dropped
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_readers_do_not_share_rings() {
        let stream = Stream::new(test_medias(), 512, false);
        let fast = SessionId::new();
        let slow = SessionId::new();
        let (fast_cb, mut fast_rx) = collector();
        let (slow_cb, mut slow_rx) = collector();

        stream.reader_add(fast, track(), fast_cb);
        stream.reader_add(slow, track(), slow_cb);

        stream.write_unit(track(), test_unit(3));

        assert_eq!(fast_rx.recv().await, Some(3));
        assert_eq!(slow_rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_write_after_close_is_noop() {
        let stream = Stream::new(test_medias(), 512, false);
        let reader = SessionId::new();
        let (cb, mut rx) = collector();

        stream.reader_add(reader, track(), cb);
        stream.close();
        stream.write_unit(track(), test_unit(0));

        assert_eq!(rx.recv().await, None);
        assert_eq!(stream.bytes_received(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_track_not_delivered() {
        let stream = Stream::new(test_medias(), 512, false);
        let reader = SessionId::new();
        let seen = Arc::new(Mutex::new(0u32));
        let seen2 = Arc::clone(&seen);
        stream.reader_add(
            reader,
            TrackId::new(1, 0),
            Arc::new(move |_| {
                *seen2.lock().unwrap() += 1;
            }),
        );

        stream.write_unit(track(), test_unit(0));
        tokio::task::yield_now().await;
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bytes_received() {
        let stream = Stream::new(test_medias(), 512, false);
        stream.write_unit(track(), test_unit(0));
        stream.write_unit(track(), test_unit(1));
        // 2 packets, 12-byte header + 2-byte payload each
        assert_eq!(stream.bytes_received(), 28);
    }
}
