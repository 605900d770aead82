//! Background pre-buffering of active conversions.
//!
//! A single long-lived worker thread drives enqueued conversion buffers a
//! small chunk at a time, round-robin, so that every active stream stays a
//! bit ahead of its reader without starving the others. Reader threads and
//! the worker compete fairly for each buffer's fill mutex because the
//! worker only ever takes one chunk before yielding.
//!
//! Buffers reference their producer weakly, so a buffer whose handler went
//! away degrades to "complete" on the worker's next touch; `forget` only
//! has to clear queued work, never to synchronise with a teardown.

use crate::buffer::ConversionBuffer;
use crate::lock;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Bytes produced per worker turn before re-queueing.
const BUFFER_CHUNK: u64 = 8 << 10;

struct WorkItem {
    buffer: Arc<ConversionBuffer>,
    goal: u64,
}

struct Queue {
    items: VecDeque<WorkItem>,
    stopped: bool,
}

struct Shared {
    buffer_ahead: u64,
    queue: Mutex<Queue>,
    /// Signalled when work is enqueued or the thread is stopped.
    enqueue_event: Condvar,
}

/// Handle to the pre-buffer worker thread.
pub struct BufferThread {
    shared: Arc<Shared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl BufferThread {
    /// Start the worker. `buffer_ahead` is how far beyond the highest read
    /// position each enqueued buffer is driven.
    pub fn start(buffer_ahead: u64) -> Self {
        let shared = Arc::new(Shared {
            buffer_ahead,
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                stopped: false,
            }),
            enqueue_event: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let join = std::thread::Builder::new()
            .name("folve-prebuffer".to_string())
            .spawn(move || run(&worker_shared))
            .ok();
        if join.is_none() {
            tracing::error!("could not start pre-buffer thread; pre-buffering disabled");
        }
        Self {
            shared,
            join: Mutex::new(join),
        }
    }

    /// Ask the worker to drive `buffer` until `max_accessed + buffer_ahead`
    /// bytes exist. If the buffer is already queued only its goal is
    /// updated.
    pub fn enqueue(&self, buffer: &Arc<ConversionBuffer>) {
        let goal = buffer.max_accessed() + self.shared.buffer_ahead;
        let mut queue = lock(&self.shared.queue);
        if queue.stopped {
            return;
        }
        for item in &mut queue.items {
            if Arc::ptr_eq(&item.buffer, buffer) {
                item.goal = goal;
                return;
            }
        }
        queue.items.push_back(WorkItem {
            buffer: Arc::clone(buffer),
            goal,
        });
        self.shared.enqueue_event.notify_one();
    }

    /// Drop all queued work for `buffer`. A chunk already in flight
    /// finishes on its own; the buffer's weak producer link keeps that
    /// safe even when the handler is going away right now.
    pub fn forget(&self, buffer: &Arc<ConversionBuffer>) {
        let mut queue = lock(&self.shared.queue);
        queue.items.retain(|item| !Arc::ptr_eq(&item.buffer, buffer));
    }

    /// Stop the worker and join it. Further enqueues are ignored.
    pub fn stop(&self) {
        {
            let mut queue = lock(&self.shared.queue);
            queue.stopped = true;
            queue.items.clear();
        }
        self.shared.enqueue_event.notify_all();
        if let Some(handle) = lock(&self.join).take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BufferThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Arc<Shared>) {
    loop {
        let (buffer, goal) = {
            let mut queue = lock(&shared.queue);
            loop {
                if queue.stopped {
                    return;
                }
                if let Some(front) = queue.items.front() {
                    break (Arc::clone(&front.buffer), front.goal);
                }
                queue = shared
                    .enqueue_event
                    .wait(queue)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        };

        // One bounded chunk per turn, without holding the queue lock, so
        // reader threads get their share of the buffer's fill mutex and we
        // round-robin across all scheduled buffers.
        let work_complete =
            buffer.fill_until(buffer.file_size() + BUFFER_CHUNK) || buffer.file_size() >= goal;

        {
            let mut queue = lock(&shared.queue);
            // `forget` may have pruned the queue while we were filling;
            // only rotate the entry if it is still ours.
            if let Some(front) = queue.items.front() {
                if Arc::ptr_eq(&front.buffer, &buffer) {
                    let front = queue.items.pop_front().unwrap_or_else(|| unreachable!());
                    if !work_complete {
                        queue.items.push_back(front);
                    }
                }
            }
        }
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SoundSource;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;
    use std::time::{Duration, Instant};

    /// Appends 64 bytes per producer call, up to `limit_calls` calls.
    struct ChunkedSource {
        buffer: Mutex<Option<Arc<ConversionBuffer>>>,
        calls: AtomicUsize,
        limit_calls: usize,
    }

    impl ChunkedSource {
        fn new(limit_calls: usize) -> Arc<Self> {
            Arc::new(Self {
                buffer: Mutex::new(None),
                calls: AtomicUsize::new(0),
                limit_calls,
            })
        }

        fn make_buffer(self: &Arc<Self>) -> Arc<ConversionBuffer> {
            let self_dyn: Arc<dyn SoundSource> = self.clone();
            let weak: Weak<dyn SoundSource> = Arc::downgrade(&self_dyn);
            let buffer = Arc::new(ConversionBuffer::new(weak).unwrap());
            *self.buffer.lock().unwrap() = Some(Arc::clone(&buffer));
            buffer
        }

        fn release(&self) {
            *self.buffer.lock().unwrap() = None;
        }
    }

    impl SoundSource for ChunkedSource {
        fn add_more_sound_data(&self) -> bool {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.limit_calls {
                return false;
            }
            let buffer = self.buffer.lock().unwrap().clone().unwrap();
            buffer.append(&[0u8; 64]).unwrap();
            true
        }
    }

    fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn worker_reaches_goal_then_leaves_buffer_alone() {
        let source = ChunkedSource::new(usize::MAX);
        let buffer = source.make_buffer();
        let thread = BufferThread::start(512);

        thread.enqueue(&buffer);
        assert!(wait_until(5000, || buffer.file_size() >= 512));

        thread.forget(&buffer);
        // Whatever chunk was in flight finishes; afterwards the size must
        // stay put.
        std::thread::sleep(Duration::from_millis(50));
        let settled = buffer.file_size();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(buffer.file_size(), settled);

        thread.stop();
        source.release();
    }

    #[test]
    fn exhausted_buffer_is_dropped_from_queue() {
        let source = ChunkedSource::new(3); // 192 bytes then EOF
        let buffer = source.make_buffer();
        let thread = BufferThread::start(1 << 20);

        thread.enqueue(&buffer);
        assert!(wait_until(5000, || buffer.is_file_complete()));
        assert_eq!(buffer.file_size(), 192);

        thread.stop();
        source.release();
    }

    #[test]
    fn round_robin_services_all_buffers() {
        let source_a = ChunkedSource::new(usize::MAX);
        let source_b = ChunkedSource::new(usize::MAX);
        let buffer_a = source_a.make_buffer();
        let buffer_b = source_b.make_buffer();
        let thread = BufferThread::start(16 << 10);

        thread.enqueue(&buffer_a);
        thread.enqueue(&buffer_b);
        assert!(wait_until(5000, || {
            buffer_a.file_size() > 0 && buffer_b.file_size() > 0
        }));

        thread.forget(&buffer_a);
        thread.forget(&buffer_b);
        thread.stop();
        source_a.release();
        source_b.release();
    }

    #[test]
    fn dead_producer_completes_work() {
        let source = ChunkedSource::new(usize::MAX);
        let buffer = source.make_buffer();
        let thread = BufferThread::start(1 << 20);

        // Drop the producer before the worker gets to it: the weak link
        // must degrade the buffer to complete instead of dangling.
        *source.buffer.lock().unwrap() = None;
        drop(source);
        thread.enqueue(&buffer);
        assert!(wait_until(5000, || buffer.is_file_complete()));
        thread.stop();
    }

    #[test]
    fn stop_is_idempotent_and_drop_safe() {
        let thread = BufferThread::start(1024);
        thread.stop();
        thread.stop();
        drop(thread);
    }
}
