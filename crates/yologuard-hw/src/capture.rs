//! Threaded, bounded-latency frame source.
//!
//! A capture thread pulls frames as fast as the device delivers them into a
//! small bounded queue. When the queue is full the oldest frame is discarded,
//! so the consumer always gets the freshest frames and never falls behind by
//! more than the queue depth.

use crate::camera::{Camera, CameraError, CameraSettings, CameraStream};
use crate::convert::RawGray;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use yologuard_core::{Frame, FrameSource, SourceError};

/// Anything the capture thread can pull grayscale images from.
pub trait Grabber: Send + 'static {
    /// Block for the next image. `Ok(None)` when nothing arrived yet.
    fn grab(&mut self) -> Result<Option<RawGray>, CameraError>;
}

impl Grabber for CameraStream {
    fn grab(&mut self) -> Result<Option<RawGray>, CameraError> {
        self.next_gray()
    }
}

type Delivery = Result<Frame, SourceError>;

pub struct ThreadedSource {
    rx: Receiver<Delivery>,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadedSource {
    /// Start a capture thread over `grabber`.
    ///
    /// `queue_depth` is clamped to at least 1. The first `warmup_frames`
    /// images are discarded.
    pub fn spawn<G: Grabber>(
        name: &str,
        grabber: G,
        queue_depth: usize,
        warmup_frames: usize,
    ) -> Result<Self, SourceError> {
        let (tx, rx) = crossbeam_channel::bounded(queue_depth.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        let pump = Pump {
            grabber,
            tx,
            drain: rx.clone(),
            stop: Arc::clone(&stop),
            dropped: Arc::clone(&dropped),
            warmup_frames,
        };
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || pump.run())
            .map_err(|e| SourceError::Open(format!("capture thread: {e}")))?;

        Ok(Self {
            rx,
            stop,
            dropped,
            thread: Some(thread),
        })
    }
}

impl FrameSource for ThreadedSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, SourceError> {
        match self.rx.recv_timeout(timeout) {
            Ok(delivery) => delivery,
            Err(RecvTimeoutError::Timeout) => Err(SourceError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(SourceError::Closed("capture thread exited".into()))
            }
        }
    }

    fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for ThreadedSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("capture thread panicked");
            }
        }
        tracing::debug!("frame source released");
    }
}

struct Pump<G> {
    grabber: G,
    tx: Sender<Delivery>,
    // Consumer-side handle used to evict the oldest queued frame.
    drain: Receiver<Delivery>,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    warmup_frames: usize,
}

impl<G: Grabber> Pump<G> {
    fn run(mut self) {
        let mut warmup = self.warmup_frames;
        let mut sequence = 0u64;

        while !self.stop.load(Ordering::Relaxed) {
            let raw = match self.grabber.grab() {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) if e.is_frame_local() => {
                    tracing::warn!(error = %e, "frame discarded");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "capture failed, closing source");
                    self.offer(Err(SourceError::Closed(e.to_string())));
                    return;
                }
            };

            if warmup > 0 {
                warmup -= 1;
                if warmup == 0 {
                    tracing::debug!(count = self.warmup_frames, "warmup frames discarded");
                }
                continue;
            }

            let frame = Frame::new(raw.data, raw.width, raw.height, sequence);
            sequence += 1;
            if !self.offer(Ok(frame)) {
                return;
            }
        }
    }

    /// Queue without blocking, evicting the oldest entry when full.
    /// Returns `false` once the consumer is gone.
    fn offer(&self, delivery: Delivery) -> bool {
        match self.tx.try_send(delivery) {
            Ok(()) => true,
            Err(TrySendError::Disconnected(_)) => false,
            Err(TrySendError::Full(delivery)) => {
                if self.drain.try_recv().is_ok() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                match self.tx.try_send(delivery) {
                    Ok(()) => true,
                    Err(TrySendError::Disconnected(_)) => false,
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                }
            }
        }
    }
}

/// The camera-backed frame source the daemon runs on.
pub type CameraSource = ThreadedSource;

impl ThreadedSource {
    /// Open the camera with bounded retry and start capturing.
    ///
    /// Failure to open is returned to the caller; the camera is released when
    /// the returned source is dropped.
    pub fn open(settings: &CameraSettings) -> Result<Self, CameraError> {
        let camera = Camera::open_with_retry(settings)?;
        let (width, height, format) = (camera.width, camera.height, camera.pixel_format());
        let stream = camera.into_stream()?;

        let source = Self::spawn(
            "yologuard-capture",
            stream,
            settings.queue_depth,
            settings.warmup_frames,
        )
        .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;

        tracing::info!(
            device = %settings.device,
            width,
            height,
            ?format,
            queue_depth = settings.queue_depth,
            "camera source started"
        );
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    /// Emits numbered 2x2 frames whose first pixel is the image number.
    struct Counter {
        next: u8,
        limit: Option<u8>,
        pace: Duration,
        released: Arc<AtomicU32>,
    }

    impl Counter {
        fn new(limit: Option<u8>, pace: Duration) -> (Self, Arc<AtomicU32>) {
            let released = Arc::new(AtomicU32::new(0));
            (
                Self {
                    next: 0,
                    limit,
                    pace,
                    released: Arc::clone(&released),
                },
                released,
            )
        }
    }

    impl Drop for Counter {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Grabber for Counter {
        fn grab(&mut self) -> Result<Option<RawGray>, CameraError> {
            if Some(self.next) == self.limit {
                return Err(CameraError::CaptureFailed("unplugged".into()));
            }
            std::thread::sleep(self.pace);
            let n = self.next;
            self.next = self.next.wrapping_add(1);
            Ok(Some(RawGray {
                data: vec![n, 200, 200, 200],
                width: 2,
                height: 2,
            }))
        }
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_frames_in_capture_order_after_warmup() {
        let (grabber, _) = Counter::new(None, Duration::from_millis(2));
        let mut source = ThreadedSource::spawn("test-capture", grabber, 8, 3).unwrap();

        let first = source.next_frame(WAIT).unwrap();
        assert_eq!(first.data[0], 3);
        assert_eq!(first.sequence, 0);

        let mut last = first.sequence;
        for _ in 0..5 {
            let f = source.next_frame(WAIT).unwrap();
            assert!(f.sequence > last);
            last = f.sequence;
        }
    }

    #[test]
    fn test_slow_consumer_gets_fresh_frames() {
        let (grabber, _) = Counter::new(None, Duration::from_millis(1));
        let mut source = ThreadedSource::spawn("test-capture", grabber, 2, 0).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        let f = source.next_frame(WAIT).unwrap();
        assert!(f.sequence > 10, "stale frame {}", f.sequence);
        assert!(source.dropped_frames() > 0);
    }

    #[test]
    fn test_capture_error_closes_source() {
        let (grabber, _) = Counter::new(Some(2), Duration::ZERO);
        let mut source = ThreadedSource::spawn("test-capture", grabber, 4, 0).unwrap();

        assert!(source.next_frame(WAIT).is_ok());
        assert!(source.next_frame(WAIT).is_ok());
        assert!(matches!(source.next_frame(WAIT), Err(SourceError::Closed(_))));
        assert!(matches!(source.next_frame(WAIT), Err(SourceError::Closed(_))));
    }

    #[test]
    fn test_corrupt_frame_is_skipped() {
        /// Fails to decode every third image, then recovers.
        struct Glitchy(u8);
        impl Grabber for Glitchy {
            fn grab(&mut self) -> Result<Option<RawGray>, CameraError> {
                std::thread::sleep(Duration::from_millis(1));
                self.0 = self.0.wrapping_add(1);
                if self.0 % 3 == 0 {
                    return Err(CameraError::CorruptFrame("bad jpeg".into()));
                }
                Ok(Some(RawGray {
                    data: vec![self.0; 4],
                    width: 2,
                    height: 2,
                }))
            }
        }

        let mut source = ThreadedSource::spawn("test-capture", Glitchy(0), 16, 0).unwrap();
        let mut pixels = Vec::new();
        for _ in 0..6 {
            pixels.push(source.next_frame(WAIT).unwrap().data[0]);
        }
        assert_eq!(pixels, vec![1, 2, 4, 5, 7, 8]);
        assert!(source.dropped_frames() >= 2);
    }

    #[test]
    fn test_timeout_when_no_frames() {
        struct Silent;
        impl Grabber for Silent {
            fn grab(&mut self) -> Result<Option<RawGray>, CameraError> {
                std::thread::sleep(Duration::from_millis(5));
                Ok(None)
            }
        }
        let mut source = ThreadedSource::spawn("test-capture", Silent, 2, 0).unwrap();
        let started = Instant::now();
        let err = source.next_frame(Duration::from_millis(30)).unwrap_err();
        assert_eq!(err, SourceError::Timeout(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_drop_releases_grabber() {
        let (grabber, released) = Counter::new(None, Duration::from_millis(1));
        let source = ThreadedSource::spawn("test-capture", grabber, 2, 0).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        drop(source);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
