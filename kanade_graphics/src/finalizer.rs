use ash::vk;
use parking_lot::Mutex;

type FinalizeFn = Box<dyn FnOnce() + Send + 'static>;

struct FinalizerEntry {
    /// Remaining frames before the entry may run. Ignored when semaphore
    /// waits are present.
    lifetime: u32,
    execute: Option<FinalizeFn>,
    debug_name: &'static str,
    waits: Vec<(vk::Semaphore, u64)>,
}

/// Deferred-destruction queue. Producers on any thread push closures; the
/// frame driver drains eligible entries once per frame. An entry runs after
/// `frame_buffer_count + 1` frames have elapsed, or, for async work that is
/// not covered by the frame ring, once every listed timeline semaphore has
/// reached its target value.
pub struct FinalizerQueue {
    entries: Mutex<Vec<FinalizerEntry>>,
    frame_lifetime: u32,
}

impl FinalizerQueue {
    pub(crate) fn new(frame_buffer_count: u32) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            frame_lifetime: frame_buffer_count + 1,
        }
    }

    pub(crate) fn push(&self, execute: impl FnOnce() + Send + 'static, debug_name: &'static str) {
        self.entries.lock().push(FinalizerEntry {
            lifetime: self.frame_lifetime,
            execute: Some(Box::new(execute)),
            debug_name,
            waits: Vec::new(),
        });
    }

    pub(crate) fn push_async(
        &self,
        execute: impl FnOnce() + Send + 'static,
        waits: Vec<(vk::Semaphore, u64)>,
        debug_name: &'static str,
    ) {
        self.entries.lock().push(FinalizerEntry {
            lifetime: self.frame_lifetime,
            execute: Some(Box::new(execute)),
            debug_name,
            waits,
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub(crate) fn iterate(&self, device: &ash::Device, force: bool) {
        self.iterate_with(
            |semaphore| unsafe { device.get_semaphore_counter_value(semaphore).unwrap_or(0) },
            force,
        );
    }

    fn iterate_with(&self, semaphore_value: impl Fn(vk::Semaphore) -> u64, force: bool) {
        // Entries are drained outside the lock while executing: a destructor
        // may push new entries onto this same queue.
        let mut index = 0;
        loop {
            let mut ready = None;
            {
                let mut entries = self.entries.lock();
                if index >= entries.len() {
                    break;
                }

                let entry = &mut entries[index];
                let execute = if !entry.waits.is_empty() {
                    entry
                        .waits
                        .iter()
                        .all(|&(semaphore, value)| semaphore_value(semaphore) >= value)
                } else if entry.lifetime > 0 {
                    entry.lifetime -= 1;
                    false
                } else {
                    true
                };

                if execute || force {
                    ready = Some(entries.remove(index));
                }
            }

            match ready {
                Some(mut entry) => {
                    if !entry.debug_name.is_empty() {
                        log::trace!("Finalizer: {}", entry.debug_name);
                    }
                    if let Some(execute) = entry.execute.take() {
                        execute();
                    }
                }
                None => index += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use ash::vk::{self, Handle};

    use super::FinalizerQueue;

    fn counting_entry(queue: &FinalizerQueue, counter: &Arc<AtomicU32>) {
        let counter = counter.clone();
        queue.push(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            "test entry",
        );
    }

    #[test]
    fn entry_runs_after_lifetime_frames() {
        let queue = FinalizerQueue::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        counting_entry(&queue, &counter);

        // Lifetime is frame_buffer_count + 1 decrements, then one more
        // iteration actually executes.
        for _ in 0..3 {
            queue.iterate_with(|_| 0, false);
            assert_eq!(counter.load(Ordering::SeqCst), 0);
        }
        queue.iterate_with(|_| 0, false);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn forced_pass_drains_everything() {
        let queue = FinalizerQueue::new(3);
        let counter = Arc::new(AtomicU32::new(0));
        counting_entry(&queue, &counter);
        counting_entry(&queue, &counter);

        queue.iterate_with(|_| 0, true);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn destructor_may_enqueue_more_work() {
        // Mirrors the two-pass shutdown: the first forced pass runs an entry
        // whose destructor pushes another entry; the second pass drains it.
        let queue = Arc::new(FinalizerQueue::new(2));
        let counter = Arc::new(AtomicU32::new(0));

        let inner_queue = queue.clone();
        let inner_counter = counter.clone();
        queue.push(
            move || {
                let counter = inner_counter.clone();
                inner_queue.push(
                    move || {
                        counter.fetch_add(10, Ordering::SeqCst);
                    },
                    "inner",
                );
                inner_counter.fetch_add(1, Ordering::SeqCst);
            },
            "outer",
        );

        queue.iterate_with(|_| 0, true);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!queue.is_empty());

        queue.iterate_with(|_| 0, true);
        assert_eq!(counter.load(Ordering::SeqCst), 11);
        assert!(queue.is_empty());
    }

    #[test]
    fn semaphore_gated_entry_waits_for_value() {
        let queue = FinalizerQueue::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        let semaphore = vk::Semaphore::from_raw(0xdead);

        let inner = counter.clone();
        queue.push_async(
            move || {
                inner.fetch_add(1, Ordering::SeqCst);
            },
            vec![(semaphore, 5)],
            "gated",
        );

        queue.iterate_with(|_| 4, false);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        queue.iterate_with(|_| 5, false);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
