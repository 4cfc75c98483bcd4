use dashmap::DashMap;

use crate::protocol::MessageKind;

/// Per-kind monotonic timestamp filter.
///
/// The same upstream event can reach the relay more than once (retries,
/// multiple relay paths). Consumers must only ever observe state moving
/// forward, so a message is accepted only if its timestamp is strictly
/// greater than the last accepted timestamp *for its kind*. Kinds are
/// independent: an old ping never suppresses a newer games update.
#[derive(Debug, Default)]
pub struct Deduplicator {
    /// kind -> last accepted timestamp (absent entry means 0)
    last_seen: DashMap<MessageKind, i64>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self {
            last_seen: DashMap::new(),
        }
    }

    /// Decide whether a message should be processed.
    ///
    /// Timestamp-less messages are always accepted; they carry no sequence
    /// to compare against. The compare-and-update runs inside a single map
    /// entry critical section, so two dispatches of the same kind cannot
    /// interleave between the read and the write.
    pub fn accept(&self, kind: MessageKind, timestamp: Option<i64>) -> bool {
        let Some(timestamp) = timestamp else {
            return true;
        };

        match self.last_seen.entry(kind) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if timestamp > *entry.get() {
                    entry.insert(timestamp);
                    true
                } else {
                    tracing::debug!(
                        kind = %kind,
                        timestamp = timestamp,
                        last_seen = *entry.get(),
                        "Dropping duplicate or stale message"
                    );
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                if timestamp > 0 {
                    entry.insert(timestamp);
                    true
                } else {
                    tracing::debug!(
                        kind = %kind,
                        timestamp = timestamp,
                        "Dropping message at or below initial watermark"
                    );
                    false
                }
            }
        }
    }

    /// Last accepted timestamp for a kind (0 if none yet).
    pub fn last_seen(&self, kind: MessageKind) -> i64 {
        self.last_seen.get(&kind).map(|v| *v).unwrap_or(0)
    }

    /// Forget all watermarks. Test/debug affordance only; production code
    /// never rewinds the table.
    pub fn reset(&self) {
        self.last_seen.clear();
        tracing::debug!("Deduplication watermarks reset");
    }
}
