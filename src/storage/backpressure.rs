//! Write backpressure on ranges that grew far beyond their split size.

use std::sync::Arc;

use crate::kvpb::keys::{key_max, SYSTEM_MAX};
use crate::kvpb::{BatchRequest, Span};
use crate::storage::queue::ProcessCallback;
use crate::storage::replica::Replica;
use crate::utils::{Ctx, KvError, LogEvery};

use lazy_static::lazy_static;

use tokio::sync::oneshot;
use tokio::time::Duration;

lazy_static! {
    static ref BACKPRESSURE_LOG: LogEvery = LogEvery::new(Duration::from_millis(500));

    /// Writes inside these spans may be held back. The system keyspace is
    /// left out so its unsplittable ranges never block.
    static ref BACKPRESSURABLE_SPANS: Vec<Span> =
        vec![Span::range(SYSTEM_MAX, key_max())];
}

/// True if a range of `size` bytes exceeds `multiplier` times its
/// `max_bytes`. A multiplier of zero disables backpressure.
pub(super) fn should_backpressure_writes(size: i64, max_bytes: i64, multiplier: f64) -> bool {
    if multiplier == 0.0 || max_bytes <= 0 {
        return false;
    }
    size as f64 > max_bytes as f64 * multiplier
}

/// True if the batch contains a write that may be held back.
pub(super) fn can_backpressure_batch(ba: &BatchRequest) -> bool {
    ba.requests.iter().any(|req| {
        req.method().can_backpressure()
            && BACKPRESSURABLE_SPANS.iter().any(|s| s.contains_span(&req.span()))
    })
}

impl Replica {
    fn should_backpressure(&self) -> bool {
        let (size, start_key) = {
            let desc = match self.desc() {
                Ok(desc) => desc,
                Err(_) => return false,
            };
            (self.stats().total(), desc.start_key)
        };
        let zone = self.system_config.zone_for_key(&start_key);
        should_backpressure_writes(size, zone.range_max_bytes, self.config.backpressure_multiplier)
    }

    /// Blocks a write to an oversized range until an ongoing split of the
    /// range completes. Lets the write through if no split is queued.
    pub(super) async fn maybe_backpressure_batch(self: &Arc<Self>, ctx: &Ctx, ba: &BatchRequest) -> Result<(), KvError> {
        if !can_backpressure_batch(ba) {
            return Ok(());
        }
        let mut first = true;
        while self.should_backpressure() {
            if first {
                first = false;
                if BACKPRESSURE_LOG.should_log() {
                    pf_warn!(self.tag; "applying backpressure to limit range growth on batch {}", ba);
                }
            }
            let split_queue = self.store()?.split_queue()?;
            let (tx, rx) = oneshot::channel();
            let cb: ProcessCallback = Box::new(move |res| {
                let _ = tx.send(res);
            });
            let rx = if split_queue.maybe_add_callback(self.range_id, cb) {
                rx
            } else {
                split_queue.maybe_add(self, self.clock.now());
                let (tx, rx) = oneshot::channel();
                let cb: ProcessCallback = Box::new(move |res| {
                    let _ = tx.send(res);
                });
                if !split_queue.maybe_add_callback(self.range_id, cb) {
                    // not queued, or stuck in purgatory
                    return Ok(());
                }
                rx
            };

            let res = ctx
                .run(async {
                    rx.await
                        .map_err(|_| KvError::msg("split queue dropped backpressure callback"))
                })
                .await
                .map_err(|e| KvError::msg(format!("aborted while applying backpressure: {}", e)))?;
            if let Err(e) = res {
                return Err(KvError::msg(format!(
                    "split failed while applying backpressure: {}",
                    e
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod backpressure_tests {
    use super::*;
    use crate::kvpb::Request;

    #[test]
    fn size_threshold() {
        let cases = [
            (100, 100, 2.0, false),
            (200, 100, 2.0, false),
            (201, 100, 2.0, true),
            (10_000, 100, 0.0, false),
            (151, 100, 1.5, true),
            (150, 0, 2.0, false),
        ];
        for (size, max, mult, expect) in cases {
            assert_eq!(
                should_backpressure_writes(size, max, mult),
                expect,
                "size={} max={} mult={}",
                size,
                max,
                mult
            );
        }
    }

    #[test]
    fn only_user_writes_are_held_back() {
        assert!(can_backpressure_batch(&BatchRequest::single(Request::put("a", "v"))));
        assert!(!can_backpressure_batch(&BatchRequest::single(Request::get("a"))));
        assert!(!can_backpressure_batch(&BatchRequest::single(Request::put(
            &b"\x01sys"[..],
            "v"
        ))));
    }
}
