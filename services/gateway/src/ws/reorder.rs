//! Timestamp-based reordering of relayed audio frames.
//!
//! UDP-relayed frames can arrive out of order. The buffer releases frames in
//! non-decreasing timestamp order while holding at most a small window of
//! late arrivals; when the window is full a late frame is released anyway
//! rather than dropped, trading perfect order for liveness. Best-effort by
//! construction: sustained overflow reorders.

use bytes::Bytes;
use std::collections::BTreeMap;

const CAPACITY: usize = 20;

pub struct ReorderBuffer {
    last_processed: u32,
    held: BTreeMap<u32, Bytes>,
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self {
            last_processed: 0,
            held: BTreeMap::new(),
        }
    }

    /// Accepts one timestamped frame and returns the frames now ready for
    /// the recognizer, in release order.
    pub fn push(&mut self, timestamp: u32, payload: Bytes) -> Vec<Bytes> {
        let mut out = Vec::new();
        if timestamp >= self.last_processed {
            self.last_processed = timestamp;
            out.push(payload);
            // Drain held frames past the watermark in ascending order.
            while let Some((&t, _)) = self.held.first_key_value() {
                if t <= self.last_processed {
                    break;
                }
                let (t, frame) = self.held.pop_first().expect("checked non-empty");
                self.last_processed = t;
                out.push(frame);
            }
        } else if self.held.len() < CAPACITY {
            self.held.insert(timestamp, payload);
        } else {
            tracing::debug!(timestamp, "reorder window full, releasing late frame");
            out.push(payload);
        }
        out
    }

    pub fn pending(&self) -> usize {
        self.held.len()
    }
}
