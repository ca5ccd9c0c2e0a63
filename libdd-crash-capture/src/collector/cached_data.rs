// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background cache of thread names.
//!
//! Reading `/proc` for every thread while handling a crash is slow, so a low
//! priority worker refreshes the names periodically. The crash path freezes
//! the cache before reading it; a frozen cache is never replaced or freed.

use super::thread_suspend::{
    add_reserved_thread, current_thread_id, list_threads, thread_name, MAX_THREADS,
};
use crate::shared::sync::MutexExt;
use libc::pid_t;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

// Lots can happen in the first few seconds of operation.
const QUICK_POLL_COUNT: usize = 4;
const QUICK_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct ThreadCache {
    names: Vec<(pid_t, String)>,
}

pub struct CachedData {
    // Always null or from `Box::into_raw`.
    cache: AtomicPtr<ThreadCache>,
    freeze_count: AtomicIsize,
    stopped: AtomicBool,
    interval: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CachedData {
    /// Builds the cache without a worker; call [`CachedData::refresh`] to fill it.
    pub fn new(interval: Duration) -> Self {
        Self {
            cache: AtomicPtr::new(ptr::null_mut()),
            freeze_count: AtomicIsize::new(0),
            stopped: AtomicBool::new(false),
            interval,
            worker: Mutex::new(None),
        }
    }

    /// Builds the cache and starts its worker thread.
    pub fn start(interval: Duration) -> anyhow::Result<Arc<Self>> {
        let data = Arc::new(Self::new(interval));
        let worker_data = data.clone();
        let handle = thread::Builder::new()
            .name("crash-cached-data".to_string())
            .spawn(move || worker_data.run())?;
        *data.worker.lock_or_recover() = Some(handle);
        Ok(data)
    }

    fn run(&self) {
        add_reserved_thread(current_thread_id());
        let mut quick_polls = QUICK_POLL_COUNT;
        while !self.stopped.load(SeqCst) {
            if !self.is_frozen() {
                self.refresh();
            }
            let interval = if quick_polls > 0 {
                quick_polls -= 1;
                QUICK_POLL_INTERVAL
            } else {
                self.interval
            };
            thread::park_timeout(interval);
        }
        debug!("Cached data worker stopped");
    }

    /// Re-reads the thread list and names.
    pub fn refresh(&self) {
        let mut tids = vec![0 as pid_t; MAX_THREADS];
        let count = list_threads(&mut tids);
        let mut buffer = [0u8; 64];
        let names = tids[..count]
            .iter()
            .filter_map(|tid| thread_name(*tid, &mut buffer).map(|name| (*tid, name.to_string())))
            .collect();
        let fresh = Box::into_raw(Box::new(ThreadCache { names }));
        let old = self.cache.swap(fresh, SeqCst);
        // A reader that froze the cache may still hold the old pointer.
        if !old.is_null() && !self.is_frozen() {
            // SAFETY: came from Box::into_raw above and is no longer shared.
            unsafe { drop(Box::from_raw(old)) };
        }
    }

    /// Stops cache updates. Nested freezes are allowed.
    pub fn freeze(&self) {
        if self.freeze_count.fetch_add(1, SeqCst) <= 0 {
            // Let an update that is already swapping finish.
            thread::yield_now();
        }
    }

    /// Resumes cache updates. Extra calls are ignored.
    pub fn unfreeze(&self) {
        if self.freeze_count.fetch_sub(1, SeqCst) <= 0 {
            self.freeze_count.fetch_add(1, SeqCst);
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze_count.load(SeqCst) > 0
    }

    /// Copies the cached name of `tid` into `buffer`. Only meaningful while
    /// frozen.
    pub fn thread_name<'b>(&self, tid: pid_t, buffer: &'b mut [u8]) -> Option<&'b str> {
        let cache = self.cache.load(SeqCst);
        if cache.is_null() {
            return None;
        }
        // SAFETY: non-null pointers come from Box::into_raw and are not freed
        // while frozen.
        let (_, name) = unsafe { &*cache }.names.iter().find(|(t, _)| *t == tid)?;
        let length = name.len().min(buffer.len());
        buffer[..length].copy_from_slice(&name.as_bytes()[..length]);
        std::str::from_utf8(&buffer[..length]).ok()
    }

    pub fn stop(&self) {
        self.stopped.store(true, SeqCst);
        let handle = self.worker.lock_or_recover().take();
        if let Some(handle) = handle {
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("Cached data worker panicked");
            }
        }
    }
}

impl Drop for CachedData {
    fn drop(&mut self) {
        let old = self.cache.swap(ptr::null_mut(), SeqCst);
        if !old.is_null() {
            // SAFETY: came from Box::into_raw in refresh.
            unsafe { drop(Box::from_raw(old)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_refresh_finds_named_thread() {
        let data = CachedData::new(Duration::from_secs(60));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let worker = thread::Builder::new()
            .name("cache-named".to_string())
            .spawn(move || {
                ready_tx.send(current_thread_id()).unwrap();
                done_rx.recv().unwrap();
            })
            .unwrap();
        let tid = ready_rx.recv().unwrap();

        let mut buffer = [0u8; 32];
        assert_eq!(data.thread_name(tid, &mut buffer), None);
        data.refresh();
        data.freeze();
        assert_eq!(data.thread_name(tid, &mut buffer), Some("cache-named"));
        data.unfreeze();

        done_tx.send(()).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_freeze_is_counted() {
        let data = CachedData::new(Duration::from_secs(60));
        data.unfreeze();
        assert!(!data.is_frozen());
        data.freeze();
        data.freeze();
        data.unfreeze();
        assert!(data.is_frozen());
        data.unfreeze();
        assert!(!data.is_frozen());
        data.unfreeze();
        data.freeze();
        assert!(data.is_frozen());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_worker_starts_and_stops() -> anyhow::Result<()> {
        let data = CachedData::start(Duration::from_secs(60))?;
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while data.cache.load(SeqCst).is_null() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!data.cache.load(SeqCst).is_null());
        data.stop();
        Ok(())
    }
}
