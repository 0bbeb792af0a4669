use std::collections::hash_map::Entry;
use std::collections::BTreeMap;
use anyhow::{anyhow, bail};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;
use crate::wire::compression::Compression;
use crate::wire::control_frame::MessageStart;
use crate::wire::message_id::MessageId;
use crate::wire::MessageType;

/// A message that is being received: its header was seen, and chunks are copied into a buffer
///  of the declared size as they arrive.
#[derive(Debug)]
pub struct PendingMessage {
    message_type: MessageType,
    compression: Compression,
    metadata: String,
    buf: Vec<u8>,
    /// where the next chunk goes: set by range frames, advanced by chunks
    cursor: usize,
    /// end of the most recently declared range, if any
    range_end: Option<usize>,
    /// received byte ranges as `start -> end`, adjacent ranges merged
    covered: BTreeMap<usize, usize>,
}

impl PendingMessage {
    /// Records `start..end` as received. Returns `false` if it overlaps bytes that were
    ///  received before.
    fn cover(&mut self, start: usize, end: usize) -> bool {
        if start == end {
            return true;
        }
        let before = self.covered.range(..=start).next_back().map(|(&s, &e)| (s, e));
        if let Some((_, before_end)) = before {
            if before_end > start {
                return false;
            }
        }
        let after = self.covered.range(start..).next().map(|(&s, &e)| (s, e));
        if let Some((after_start, _)) = after {
            if after_start < end {
                return false;
            }
        }

        let mut merged_start = start;
        let mut merged_end = end;
        if let Some((before_start, before_end)) = before {
            if before_end == start {
                self.covered.remove(&before_start);
                merged_start = before_start;
            }
        }
        if let Some((after_start, after_end)) = after {
            if after_start == end {
                self.covered.remove(&after_start);
                merged_end = after_end;
            }
        }
        self.covered.insert(merged_start, merged_end);
        true
    }

    fn is_complete(&self) -> bool {
        self.buf.is_empty() || self.covered.get(&0) == Some(&self.buf.len())
    }

    fn num_received(&self) -> usize {
        self.covered.iter().map(|(s, e)| e - s).sum()
    }
}

/// A fully received message, still in its transmitted (i.e. possibly compressed) form
#[derive(Debug, PartialEq, Eq)]
pub struct CompletedMessage {
    pub id: MessageId,
    pub message_type: MessageType,
    pub compression: Compression,
    pub metadata: String,
    pub body: Vec<u8>,
}

/// Per-connection table of messages in flight. It is owned by the connection's receive loop and
///  dropped with it, which abandons all partially received messages.
///
/// Frames of different messages may arrive interleaved, so every operation is keyed by message
///  id. All errors are protocol errors concerning a single frame, and they leave the table in a
///  consistent state.
pub struct ReassemblyTable {
    max_message_size: usize,
    max_in_flight_bytes: usize,
    /// summed declared lengths of the pending messages
    in_flight_bytes: usize,
    pending: FxHashMap<MessageId, PendingMessage>,
    /// messages that were rejected at their start frame: their remaining frames are dropped quietly
    skipped: FxHashSet<MessageId>,
}

impl ReassemblyTable {
    pub fn new(max_message_size: usize, max_in_flight_bytes: usize) -> ReassemblyTable {
        ReassemblyTable {
            max_message_size,
            max_in_flight_bytes,
            in_flight_bytes: 0,
            pending: FxHashMap::default(),
            skipped: FxHashSet::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.skipped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.skipped.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.pending.contains_key(id) || self.skipped.contains(id)
    }

    /// Marks a message whose start frame was seen as not to be received. Its chunks are
    ///  dropped, and its end frame completes nothing.
    pub fn skip(&mut self, id: &MessageId) -> anyhow::Result<()> {
        if self.contains(id) {
            bail!("message id {:?} is already in flight", id);
        }
        self.skipped.insert(id.clone());
        Ok(())
    }

    pub fn start(&mut self, start: &MessageStart) -> anyhow::Result<()> {
        if start.content_length > self.max_message_size {
            bail!("message {:?} declares {} bytes, exceeding the maximum of {}", start.id, start.content_length, self.max_message_size);
        }

        if self.in_flight_bytes + start.content_length > self.max_in_flight_bytes {
            bail!("message {:?} with {} bytes would exceed the limit of {} bytes in flight ({} pending)", start.id, start.content_length, self.max_in_flight_bytes, self.in_flight_bytes);
        }

        if self.skipped.contains(&start.id) {
            bail!("message id {:?} is already in flight", start.id);
        }
        match self.pending.entry(start.id.clone()) {
            Entry::Occupied(_) => {
                bail!("message id {:?} is already in flight", start.id)
            }
            Entry::Vacant(e) => {
                trace!("starting reassembly of {:?} with {} bytes", start.id, start.content_length);
                e.insert(PendingMessage {
                    message_type: start.message_type,
                    compression: start.compression,
                    metadata: start.metadata.clone(),
                    buf: vec![0u8; start.content_length],
                    cursor: 0,
                    range_end: None,
                    covered: BTreeMap::new(),
                });
                self.in_flight_bytes += start.content_length;
                Ok(())
            }
        }
    }

    pub fn range(&mut self, id: &MessageId, start: usize, end: usize) -> anyhow::Result<()> {
        if self.skipped.contains(id) {
            return Ok(());
        }
        let pending = self.get_pending(id)?;
        if end > pending.buf.len() {
            bail!("range {}-{} for {:?} exceeds the declared length of {}", start, end, id, pending.buf.len());
        }
        pending.cursor = start;
        pending.range_end = Some(end);
        Ok(())
    }

    pub fn chunk(&mut self, id: &MessageId, chunk: &[u8]) -> anyhow::Result<()> {
        if self.skipped.contains(id) {
            trace!("dropping chunk of skipped message {:?}", id);
            return Ok(());
        }
        let pending = self.get_pending(id)?;

        let start = pending.cursor;
        let end = start + chunk.len();
        if end > pending.buf.len() {
            bail!("chunk of {} bytes at offset {} overflows the declared length {} of {:?}", chunk.len(), start, pending.buf.len(), id);
        }
        if let Some(range_end) = pending.range_end {
            if end != range_end {
                bail!("chunk of {} bytes at offset {} does not match the declared range ending at {} for {:?}", chunk.len(), start, range_end, id);
            }
        }

        if !pending.cover(start, end) {
            bail!("chunk {}-{} of {:?} overlaps bytes that were already received", start, end, id);
        }

        pending.buf[start..end].copy_from_slice(chunk);
        pending.cursor = end;
        pending.range_end = None;
        Ok(())
    }

    /// Removes the message from the table - whether or not it is complete. Returns `None` for a
    ///  skipped message.
    pub fn end(&mut self, id: &MessageId) -> anyhow::Result<Option<CompletedMessage>> {
        if self.skipped.remove(id) {
            return Ok(None);
        }
        let pending = self.pending.remove(id)
            .ok_or_else(|| anyhow!("end of unknown message {:?}", id))?;
        self.in_flight_bytes -= pending.buf.len();

        if !pending.is_complete() {
            bail!("message {:?} ended after {} of {} bytes - discarding", id, pending.num_received(), pending.buf.len());
        }

        Ok(Some(CompletedMessage {
            id: id.clone(),
            message_type: pending.message_type,
            compression: pending.compression,
            metadata: pending.metadata,
            body: pending.buf,
        }))
    }

    fn get_pending(&mut self, id: &MessageId) -> anyhow::Result<&mut PendingMessage> {
        self.pending.get_mut(id)
            .ok_or_else(|| anyhow!("frame for unknown message {:?} - late frame or missing start", id))
    }
}
