//! Continuous frame fetching with bounded, most-recent-first delivery.
//!
//! While running, a worker thread repeatedly takes the transport for one
//! poll, decodes whatever payload arrived and pushes the result into a small
//! [`FrameQueue`]. The queue drops its oldest entry when full. Consumers call
//! [`FrameStream::get_frame`], which hands out the newest frame that arrived
//! after the last acknowledged commit. Arrival is the moment the link
//! received the payload, not the moment the worker got to it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::codec::{DataFrame, FrameCodec, FrameScaling};
use crate::commit::EpochClock;
use crate::error::{MokuError, Result};
use crate::lock;
use crate::transport::SharedTransport;

/// Lifecycle of the fetch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Running,
}

struct Delivery {
    result: Result<DataFrame>,
    arrived_at: Instant,
}

struct QueueInner {
    entries: VecDeque<Delivery>,
    capacity: usize,
}

/// Bounded delivery queue shared by the worker and consumers.
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
            }),
            ready: Condvar::new(),
        }
    }

    /// Append a decoded frame or per-frame error that arrived at
    /// `arrived_at`, evicting the oldest entry when full.
    pub fn push(&self, result: Result<DataFrame>, arrived_at: Instant) {
        let mut inner = lock(&self.inner);
        inner.entries.push_back(Delivery { result, arrived_at });
        while inner.entries.len() > inner.capacity {
            inner.entries.pop_front();
            debug!("frame queue full, dropped oldest");
        }
        self.ready.notify_all();
    }

    /// Wait up to `timeout` for the newest entry that arrived at or after
    /// `not_before`. Older entries are discarded.
    pub fn pop_newest(
        &self,
        timeout: Duration,
        not_before: impl Fn() -> Option<Instant>,
    ) -> Result<DataFrame> {
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.inner);
        loop {
            if let Some(cutoff) = not_before() {
                let before = inner.entries.len();
                inner.entries.retain(|d| d.arrived_at >= cutoff);
                let stale = before - inner.entries.len();
                if stale > 0 {
                    debug!(stale, "discarded frames from before the last commit");
                }
            }
            if let Some(delivery) = inner.entries.pop_back() {
                return delivery.result;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MokuError::FrameTimeout(timeout));
            }
            inner = self
                .ready
                .wait_timeout(inner, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|p| p.into_inner().0);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.inner).entries.clear();
    }

    pub fn capacity(&self) -> usize {
        lock(&self.inner).capacity
    }

    fn set_capacity(&self, capacity: usize) {
        let mut inner = lock(&self.inner);
        inner.capacity = capacity;
        while inner.entries.len() > capacity {
            inner.entries.pop_front();
        }
    }
}

struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// The frame pipeline of one session.
pub struct FrameStream {
    transport: Arc<SharedTransport>,
    codec: Arc<RwLock<FrameCodec>>,
    clock: Arc<EpochClock>,
    queue: Arc<FrameQueue>,
    poll_interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl FrameStream {
    pub fn new(
        transport: Arc<SharedTransport>,
        clock: Arc<EpochClock>,
        scaling: FrameScaling,
        buffer_length: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            codec: Arc::new(RwLock::new(FrameCodec::new(scaling))),
            clock,
            queue: Arc::new(FrameQueue::new(buffer_length)),
            poll_interval,
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> StreamState {
        match lock(&self.worker).as_ref() {
            Some(worker) if !worker.handle.is_finished() => StreamState::Running,
            _ => StreamState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == StreamState::Running
    }

    /// Start the fetch loop. Does nothing if it is already running.
    pub fn start(&self) -> Result<()> {
        let mut slot = lock(&self.worker);
        if let Some(worker) = slot.as_ref() {
            if !worker.handle.is_finished() {
                return Ok(());
            }
        }
        if let Some(finished) = slot.take() {
            let _ = finished.handle.join();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let fetch = FetchLoop {
            transport: Arc::clone(&self.transport),
            codec: Arc::clone(&self.codec),
            queue: Arc::clone(&self.queue),
            stop: Arc::clone(&stop),
            poll_interval: self.poll_interval,
        };
        let handle = thread::Builder::new()
            .name("mokulink-frames".into())
            .spawn(move || fetch.run())
            .map_err(|e| MokuError::invalid(format!("cannot spawn frame worker: {e}")))?;
        *slot = Some(Worker { handle, stop });
        info!(poll_ms = self.poll_interval.as_millis() as u64, "frame stream started");
        Ok(())
    }

    /// Stop the fetch loop and wait for it to exit. The loop notices within
    /// one fetch, which blocks for at most one poll interval. Safe to call
    /// from any thread, any number of times.
    pub fn stop(&self) {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::Release);
            if worker.handle.join().is_err() {
                warn!("frame worker panicked");
            }
            info!("frame stream stopped");
        }
    }

    /// Newest frame that arrived after the last acknowledged commit.
    pub fn get_frame(&self, timeout: Duration) -> Result<DataFrame> {
        self.queue
            .pop_newest(timeout, || self.clock.current().acknowledged_at)
    }

    /// Discard everything queued.
    pub fn flush(&self) {
        self.queue.clear();
    }

    pub fn set_buffer_length(&self, length: usize) -> Result<()> {
        if length == 0 {
            return Err(MokuError::out_of_range("frame buffer length must be at least 1"));
        }
        self.queue.set_capacity(length);
        Ok(())
    }

    pub fn buffer_length(&self) -> usize {
        self.queue.capacity()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Replace the scaling used for frames decoded from now on.
    pub fn set_scaling(&self, scaling: FrameScaling) {
        self.codec
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .set_scaling(scaling);
    }

    pub fn scaling(&self) -> FrameScaling {
        self.codec
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .scaling()
            .clone()
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FetchLoop {
    transport: Arc<SharedTransport>,
    codec: Arc<RwLock<FrameCodec>>,
    queue: Arc<FrameQueue>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl FetchLoop {
    fn run(self) {
        while !self.stop.load(Ordering::Acquire) {
            let fetched = self
                .transport
                .acquire_for_poll()
                .read_frame_payload(self.poll_interval);
            match fetched {
                Ok(None) => {}
                Ok(Some(payload)) => {
                    let decoded = self
                        .codec
                        .read()
                        .unwrap_or_else(|p| p.into_inner())
                        .decode(&payload.data);
                    match &decoded {
                        Ok(frame) => debug!(
                            frame_id = frame.header.frame_id,
                            state_id = frame.header.state_id,
                            "frame decoded"
                        ),
                        Err(err) => warn!(error = %err, len = payload.data.len(), "frame dropped"),
                    }
                    self.queue.push(decoded, payload.received_at);
                }
                Err(err) => {
                    let terminal = err.is_terminal();
                    warn!(error = %err, terminal, "frame fetch failed");
                    self.queue.push(Err(err.into()), Instant::now());
                    if terminal {
                        break;
                    }
                }
            }
        }
        debug!("frame loop exited");
    }
}

#[cfg(test)]
mod tests {
    use mokulink_transport::mock::{MockFailure, MockHandle, MockTransport};

    use super::*;
    use crate::codec::{encode_frame, FrameHeader};

    fn stream(buffer: usize) -> (FrameStream, MockHandle, Arc<EpochClock>) {
        let (mock, handle) = MockTransport::new();
        let clock = Arc::new(EpochClock::new());
        let stream = FrameStream::new(
            Arc::new(SharedTransport::new(Box::new(mock))),
            Arc::clone(&clock),
            FrameScaling::new(1, vec![1.0]),
            buffer,
            Duration::from_millis(10),
        );
        (stream, handle, clock)
    }

    fn frame(id: u16) -> bytes::Bytes {
        let header = FrameHeader {
            frame_id: id,
            instrument_id: 1,
            ..FrameHeader::default()
        };
        encode_frame(&header, &[vec![Some(i32::from(id))]]).unwrap()
    }

    fn wait_for_queue(stream: &FrameStream, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while stream.queued() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn get_frame_times_out_without_data() {
        let (stream, _handle, _clock) = stream(4);
        stream.start().unwrap();
        let start = Instant::now();
        let err = stream.get_frame(Duration::from_millis(100)).unwrap_err();
        let waited = start.elapsed();
        assert!(matches!(err, MokuError::FrameTimeout(_)));
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(400));
        stream.stop();
    }

    #[test]
    fn newest_frame_first_and_oldest_dropped() {
        let (stream, handle, _clock) = stream(2);
        for id in 1..=3 {
            handle.push_frame(frame(id));
        }
        stream.start().unwrap();
        wait_for_queue(&stream, 2);
        while handle.pending_frames() > 0 {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(30));
        stream.stop();

        assert_eq!(stream.queued(), 2);
        let newest = stream.get_frame(Duration::from_millis(10)).unwrap();
        assert_eq!(newest.header.frame_id, 3);
        let older = stream.get_frame(Duration::from_millis(10)).unwrap();
        assert_eq!(older.header.frame_id, 2);
    }

    #[test]
    fn decode_error_is_delivered_and_stream_continues() {
        let (stream, handle, _clock) = stream(4);
        stream.start().unwrap();
        handle.push_frame(bytes::Bytes::from_static(b"junk"));
        let err = stream.get_frame(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, MokuError::Stream(_)));

        handle.push_frame(frame(8));
        let ok = stream.get_frame(Duration::from_secs(2)).unwrap();
        assert_eq!(ok.header.frame_id, 8);
        assert!(stream.is_running());
        stream.stop();
    }

    #[test]
    fn terminal_transport_error_stops_the_loop() {
        let (stream, handle, _clock) = stream(4);
        stream.start().unwrap();
        handle.fail_next_frame_read(MockFailure::Disconnect);
        let err = stream.get_frame(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, MokuError::Network(_)));

        let deadline = Instant::now() + Duration::from_secs(2);
        while stream.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    #[test]
    fn frames_before_commit_ack_are_discarded() {
        let (stream, handle, clock) = stream(4);
        handle.push_frame(frame(1));
        stream.start().unwrap();
        wait_for_queue(&stream, 1);

        thread::sleep(Duration::from_millis(5));
        clock.advance(1, Instant::now());
        assert!(matches!(
            stream.get_frame(Duration::from_millis(50)),
            Err(MokuError::FrameTimeout(_))
        ));

        handle.push_frame(frame(2));
        let fresh = stream.get_frame(Duration::from_secs(2)).unwrap();
        assert_eq!(fresh.header.frame_id, 2);
        stream.stop();
    }

    #[test]
    fn frame_received_before_ack_but_read_after_is_discarded() {
        let (stream, handle, clock) = stream(4);
        handle.push_frame(frame(1));
        thread::sleep(Duration::from_millis(5));
        clock.advance(1, Instant::now());

        stream.start().unwrap();
        assert!(matches!(
            stream.get_frame(Duration::from_millis(80)),
            Err(MokuError::FrameTimeout(_))
        ));
        assert_eq!(handle.pending_frames(), 0, "frame was never fetched");
        stream.stop();
    }

    #[test]
    fn stop_returns_within_one_fetch() {
        let (mock, _handle) = MockTransport::new();
        let poll = Duration::from_millis(150);
        let stream = FrameStream::new(
            Arc::new(SharedTransport::new(Box::new(mock))),
            Arc::new(EpochClock::new()),
            FrameScaling::new(1, vec![1.0]),
            4,
            poll,
        );
        stream.start().unwrap();
        // Let the worker block inside an empty frame read.
        thread::sleep(Duration::from_millis(30));

        let started = Instant::now();
        stream.stop();
        let took = started.elapsed();
        assert!(took < poll + Duration::from_millis(100), "stop took {took:?}");
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    #[test]
    fn stop_from_another_thread() {
        let (stream, _handle, _clock) = stream(4);
        let stream = Arc::new(stream);
        stream.start().unwrap();
        let other = Arc::clone(&stream);
        thread::spawn(move || other.stop()).join().unwrap();
        assert!(!stream.is_running());
    }

    #[test]
    fn start_is_idempotent_and_stop_is_safe() {
        let (stream, _handle, _clock) = stream(4);
        stream.stop();
        stream.start().unwrap();
        stream.start().unwrap();
        assert_eq!(stream.state(), StreamState::Running);
        stream.stop();
        stream.stop();
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    #[test]
    fn buffer_length_must_be_positive() {
        let (stream, _handle, _clock) = stream(4);
        assert!(stream.set_buffer_length(0).is_err());
        stream.set_buffer_length(1).unwrap();
        assert_eq!(stream.buffer_length(), 1);
    }
}
