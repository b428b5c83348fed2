//! The call-site table: aggregates sampled allocations by the stack
//! trace that performed them.
//!
//! Sites are shared between the table's bucket chains and the live
//! allocation records that point back at them. Clearing the profile
//! unlinks every site from the table; a site that still has live
//! sampled bytes at that point survives through its outstanding
//! allocation records alone and goes away when the last of them is
//! freed. All operations on the table and on site counters run under
//! the agent's table monitor; the counter atomics only exist to make
//! sharing sound.

use heapster_host::MethodId;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

/// Number of hash buckets; the same table size the tcmalloc heap
/// profiler uses.
pub const NBUCKETS: usize = 179_999;

/// Captured stacks are truncated to this many frames. Deeper traces
/// aggregate with any other trace that shares the same truncated
/// prefix.
pub const MAX_FRAMES: usize = 100;

/// Mixed hash of the frame method identifiers, adapted from the
/// google-perftools heap profiler.
pub fn hash_stack(frames: &[MethodId]) -> u64 {
    let mut h: u64 = 0;
    for frame in frames {
        h = h.wrapping_add(frame.0 as u64);
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h
}

/// One distinct allocation stack observed at sampling time.
pub struct Site {
    hash: u64,
    stack: Box<[MethodId]>,
    num_allocs: AtomicU64,
    num_bytes: AtomicU64,
    active: AtomicBool,
    next: Option<Arc<Site>>,
}

impl Site {
    fn new(hash: u64, frames: &[MethodId], next: Option<Arc<Site>>) -> Arc<Self> {
        Arc::new(Site {
            hash,
            stack: frames.into(),
            num_allocs: AtomicU64::new(0),
            num_bytes: AtomicU64::new(0),
            active: AtomicBool::new(true),
            next,
        })
    }

    pub fn stack(&self) -> &[MethodId] {
        &self.stack
    }

    pub fn nframes(&self) -> usize {
        self.stack.len()
    }

    /// Cumulative count of sampled allocations attributed to this
    /// site. Monotonic.
    pub fn num_allocs(&self) -> u64 {
        self.num_allocs.load(Relaxed)
    }

    /// Currently-live sampled bytes attributed to this site.
    pub fn num_bytes(&self) -> u64 {
        self.num_bytes.load(Relaxed)
    }

    /// False once the profile has been cleared while this site still
    /// had live bytes.
    pub fn is_active(&self) -> bool {
        self.active.load(Relaxed)
    }

    /// Return `size` bytes to the site when a sampled object is freed.
    pub fn release_bytes(&self, size: u64) {
        self.num_bytes.fetch_sub(size, Relaxed);
    }
}

pub struct SiteTable {
    buckets: Vec<Option<Arc<Site>>>,
}

impl Default for SiteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SiteTable {
    pub fn new() -> Self {
        SiteTable {
            buckets: vec![None; NBUCKETS],
        }
    }

    /// Find the site for `frames`, creating it on first sight, and
    /// charge one allocation of `size` bytes to it. `hash` is the
    /// caller-computed [`hash_stack`] of `frames`.
    pub fn record_allocation(&mut self, hash: u64, frames: &[MethodId], size: u64) -> Arc<Site> {
        let bucket = (hash % NBUCKETS as u64) as usize;

        let mut found = None;
        let mut cursor = self.buckets[bucket].as_ref();
        while let Some(site) = cursor {
            if site.hash == hash && site.stack.as_ref() == frames {
                found = Some(site.clone());
                break;
            }
            cursor = site.next.as_ref();
        }

        let site = match found {
            Some(site) => site,
            None => {
                let site = Site::new(hash, frames, self.buckets[bucket].take());
                self.buckets[bucket] = Some(site.clone());
                site
            }
        };

        site.num_allocs.fetch_add(1, Relaxed);
        site.num_bytes.fetch_add(size, Relaxed);
        site
    }

    /// Unlink every site. A site that still has live sampled bytes is
    /// marked inactive first; it stays alive through its outstanding
    /// allocation records and is freed when the last one is dropped.
    pub fn clear(&mut self) {
        for head in &mut self.buckets {
            let mut cursor = head.take();
            while let Some(site) = cursor {
                if site.num_bytes() > 0 {
                    site.active.store(false, Relaxed);
                }
                cursor = site.next.clone();
            }
        }
    }

    /// Visit every site currently linked from the table. Order is
    /// unspecified.
    pub fn sites(&self) -> Sites<'_> {
        Sites {
            buckets: self.buckets.iter(),
            cursor: None,
        }
    }
}

pub struct Sites<'a> {
    buckets: std::slice::Iter<'a, Option<Arc<Site>>>,
    cursor: Option<&'a Arc<Site>>,
}

impl<'a> Iterator for Sites<'a> {
    type Item = &'a Arc<Site>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(site) = self.cursor.take() {
                self.cursor = site.next.as_ref();
                return Some(site);
            }
            match self.buckets.next() {
                Some(head) => self.cursor = head.as_ref(),
                None => return None,
            }
        }
    }
}
