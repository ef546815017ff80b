//! Reassembly of multi-part legacy messages.
//!
//! Old nodes split large application messages into parts sharing one
//! `app_hash`. Parts are collected per hash until every slot is filled.
//! Partial messages that see no new part for [`REASSEMBLY_TIMEOUT`] are
//! discarded; cleanup happens whenever a part arrives. At most
//! [`MAX_PENDING_MESSAGES`] messages are collected at once and a rebuilt
//! message never exceeds [`MAX_FRAME_SIZE`].

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};

use crate::error::{P2pError, P2pResult};
use crate::parcel::{Parcel, ParcelType};
use crate::protocol::v9::V9Msg;
use crate::protocol::MAX_FRAME_SIZE;

/// Maximum time a partial message waits for its next part.
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Partial messages kept per connection. The oldest is evicted first.
pub const MAX_PENDING_MESSAGES: usize = 32;

/// Parts received so far for one application hash.
#[derive(Debug)]
struct PartialMessage {
    parts_total: u16,
    parts: BTreeMap<u16, Vec<u8>>,
    size: usize,
    target_peer: String,
    first_received: Instant,
    most_recent_received: Instant,
}

impl PartialMessage {
    fn complete(&self) -> bool {
        self.parts.len() == usize::from(self.parts_total)
    }

    /// Smallest size the whole message can still end up with.
    fn minimum_size(&self) -> usize {
        self.size + usize::from(self.parts_total) - self.parts.len()
    }

    fn assemble(self) -> Parcel {
        let mut payload = BytesMut::with_capacity(self.size);
        for part in self.parts.into_values() {
            payload.put_slice(&part);
        }
        Parcel {
            kind: ParcelType::Message,
            address: self.target_peer,
            payload: payload.freeze(),
        }
    }
}

/// Collects message parts until whole messages can be rebuilt.
#[derive(Debug)]
pub struct PartsAssembler {
    messages: HashMap<String, PartialMessage>,
    timeout: Duration,
    max_pending: usize,
    max_size: usize,
}

impl Default for PartsAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PartsAssembler {
    pub fn new() -> Self {
        Self::with_timeout(REASSEMBLY_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            messages: HashMap::new(),
            timeout,
            max_pending: MAX_PENDING_MESSAGES,
            max_size: MAX_FRAME_SIZE,
        }
    }

    /// Override the pending message count and rebuilt size limits.
    pub fn with_limits(mut self, max_pending: usize, max_size: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self.max_size = max_size;
        self
    }

    /// Number of messages waiting for parts.
    pub fn pending(&self) -> usize {
        self.messages.len()
    }

    /// Add a part. Returns the whole message once its last part arrived.
    pub fn handle_part(&mut self, msg: V9Msg) -> P2pResult<Option<Parcel>> {
        self.handle_part_at(msg, Instant::now())
    }

    pub(crate) fn handle_part_at(&mut self, msg: V9Msg, now: Instant) -> P2pResult<Option<Parcel>> {
        self.cleanup(now);

        let header = &msg.header;
        let total = header.parts_total;
        if total == 0 || header.part_no >= total || usize::from(total) > self.max_size {
            return Err(P2pError::InvalidPart(format!(
                "part {} of {} for {}",
                header.part_no, header.parts_total, header.app_hash
            )));
        }

        let app_hash = header.app_hash.clone();
        if !self.messages.contains_key(&app_hash) && self.messages.len() >= self.max_pending {
            self.evict_oldest();
        }
        let partial = self
            .messages
            .entry(app_hash.clone())
            .or_insert_with(|| PartialMessage {
                parts_total: total,
                parts: BTreeMap::new(),
                size: 0,
                target_peer: header.target_peer.clone(),
                first_received: now,
                most_recent_received: now,
            });

        if partial.parts_total != total {
            return Err(P2pError::InvalidPart(format!(
                "{} announced {} parts, earlier parts said {}",
                app_hash, total, partial.parts_total
            )));
        }

        let part_no = header.part_no;
        if let Some(old) = partial.parts.insert(part_no, msg.payload) {
            partial.size -= old.len();
        }
        partial.size += partial.parts.get(&part_no).map_or(0, Vec::len);
        partial.most_recent_received = now;

        if partial.minimum_size() > self.max_size {
            self.messages.remove(&app_hash);
            return Err(P2pError::InvalidPart(format!(
                "{} would exceed {} bytes",
                app_hash, self.max_size
            )));
        }

        if !partial.complete() {
            return Ok(None);
        }

        match self.messages.remove(&app_hash) {
            Some(done) => {
                tracing::trace!(
                    app_hash = %app_hash,
                    waited = ?now.duration_since(done.first_received),
                    "reassembled message"
                );
                Ok(Some(done.assemble()))
            }
            None => Ok(None),
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .messages
            .iter()
            .min_by_key(|(_, partial)| partial.first_received)
            .map(|(hash, _)| hash.clone());
        if let Some(hash) = oldest {
            tracing::debug!(app_hash = %hash, "evicting partial message");
            self.messages.remove(&hash);
        }
    }

    fn cleanup(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.messages
            .retain(|_, partial| now.duration_since(partial.most_recent_received) <= timeout);
    }
}
