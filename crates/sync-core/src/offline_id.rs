//! Identifiers for rows created while offline.
//!
//! Server-assigned keys come from positive sequences, so offline rows take
//! negative keys derived from the clock, a process-wide counter and random
//! bits. They never collide with a sequence value and are unlikely to
//! collide with each other across devices.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a strictly negative offline key.
pub fn generate() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
    let entropy = u64::from(rand::random::<u32>());

    let mut id = ((now << 22) ^ (counter << 6) ^ entropy) & (i64::MAX as u64);
    if id == 0 {
        id = 1;
    }
    -(id as i64)
}
