//! Message reassembly with bounded memory.
//!
//! The reassembler collects the fragments of each message, keyed by
//! (source, message id), until the fragment count is reached, then
//! concatenates them in fragment-index order and hands the message up once.
//!
//! # Design
//!
//! - **Bounded window**: Track at most `max_inflight` partial messages
//! - **Per-message state**: For each message, track received fragments
//! - **Delivered history**: Remember recently delivered message ids per
//!   source so late fragments are discarded instead of starting a new message
//! - **Superseded partials**: A source's fragments arrive in transport
//!   order, so a fragment of a newer message means the older partial
//!   message from that source lost fragments its sender gave up on. The
//!   older one is dropped and reported through
//!   [`take_superseded`](Reassembler::take_superseded). Nothing is ever
//!   dropped on a timer: a fragment the transport acknowledged stays until
//!   its message completes or is superseded.
//!
//! # Thread Safety
//!
//! This structure is NOT thread-safe. It is owned by a single host stack.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::error::{ReassemblyError, Result};
use crate::frame::{Address, Frame};

/// Delivered message ids remembered per source.
const DELIVERED_HISTORY: usize = 1024;

/// State for a single message being reassembled.
#[derive(Debug)]
struct MessageState {
    fragment_count: u8,

    /// Fragments received so far, by fragment index
    fragments: HashMap<u8, Vec<u8>>,
}

impl MessageState {
    fn new(fragment_count: u8) -> Self {
        Self {
            fragment_count,
            fragments: HashMap::new(),
        }
    }

    /// Insert a fragment and return true if the message is now complete.
    fn insert(&mut self, message_id: u16, index: u8, count: u8, payload: Vec<u8>) -> Result<bool> {
        if count != self.fragment_count {
            return Err(ReassemblyError::FragmentCountMismatch {
                message_id,
                expected: self.fragment_count,
                actual: count,
            }
            .into());
        }

        if self.fragments.contains_key(&index) {
            return Err(ReassemblyError::DuplicateFragment {
                message_id,
                fragment_index: index,
            }
            .into());
        }

        self.fragments.insert(index, payload);
        Ok(self.fragments.len() == self.fragment_count as usize)
    }

    /// Concatenate fragments in index order (consumes the state).
    fn assemble(self) -> Vec<u8> {
        let mut fragments: Vec<_> = self.fragments.into_iter().collect();
        fragments.sort_by_key(|(index, _)| *index);
        fragments.into_iter().flat_map(|(_, data)| data).collect()
    }

    fn missing_count(&self) -> usize {
        self.fragment_count as usize - self.fragments.len()
    }
}

/// Recently delivered message ids for one source.
#[derive(Debug, Default)]
struct DeliveredHistory {
    order: VecDeque<u16>,
    ids: HashSet<u16>,
}

impl DeliveredHistory {
    fn contains(&self, message_id: u16) -> bool {
        self.ids.contains(&message_id)
    }

    fn record(&mut self, message_id: u16) {
        if !self.ids.insert(message_id) {
            return;
        }
        self.order.push_back(message_id);
        if self.order.len() > DELIVERED_HISTORY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub source: Address,
    pub message_id: u16,
    pub data: Vec<u8>,
}

/// Collects fragments back into messages.
pub struct Reassembler {
    max_inflight: usize,
    messages: HashMap<(Address, u16), MessageState>,
    delivered: HashMap<Address, DeliveredHistory>,
    superseded: Vec<ReassemblyError>,
}

impl Reassembler {
    /// Create a new reassembler.
    ///
    /// `max_inflight` bounds the partial messages tracked at once. Each
    /// source holds at most one, so it bounds the sources too.
    pub fn new(max_inflight: usize) -> Self {
        Self {
            max_inflight,
            messages: HashMap::new(),
            delivered: HashMap::new(),
            superseded: Vec::new(),
        }
    }

    /// Whether a fragment from `source` can be taken without hitting
    /// [`ReassemblyError::WindowFull`].
    ///
    /// A source that already has a partial message always has room, since
    /// any new message from it replaces the old one.
    pub fn has_room_for(&self, source: Address) -> bool {
        self.messages.len() < self.max_inflight
            || self.messages.keys().any(|(from, _)| *from == source)
    }

    /// Insert a data fragment.
    ///
    /// # Returns
    /// - `Ok(Some(message))` if this fragment completed its message
    /// - `Ok(None)` if the fragment was buffered, or discarded because its
    ///   message was already delivered
    ///
    /// Fragments from one source must be inserted in transport order.
    ///
    /// # Errors
    /// - `ReassemblyError::WindowFull` if too many partial messages are in flight
    /// - `ReassemblyError::DuplicateFragment` if the fragment was already buffered
    /// - `ReassemblyError::FragmentCountMismatch` if fragments disagree on the count
    pub fn insert(&mut self, frame: Frame) -> Result<Option<Reassembled>> {
        let header = frame.header;
        let key = (header.source, header.message_id);

        if self
            .delivered
            .get(&header.source)
            .is_some_and(|history| history.contains(header.message_id))
        {
            return Ok(None);
        }

        if !self.messages.contains_key(&key) {
            self.supersede(header.source);
            if self.messages.len() >= self.max_inflight {
                return Err(ReassemblyError::WindowFull {
                    max: self.max_inflight,
                }
                .into());
            }
            self.messages
                .insert(key, MessageState::new(header.fragment_count));
        }

        let complete = match self.messages.get_mut(&key) {
            Some(state) => state.insert(
                header.message_id,
                header.fragment_index,
                header.fragment_count,
                frame.payload,
            )?,
            None => false,
        };

        if !complete {
            return Ok(None);
        }

        let Some(state) = self.messages.remove(&key) else {
            return Ok(None);
        };
        self.delivered
            .entry(header.source)
            .or_default()
            .record(header.message_id);

        Ok(Some(Reassembled {
            source: header.source,
            message_id: header.message_id,
            data: state.assemble(),
        }))
    }

    /// Partial messages dropped because a newer message from the same
    /// source started, oldest first.
    pub fn take_superseded(&mut self) -> Vec<ReassemblyError> {
        std::mem::take(&mut self.superseded)
    }

    fn supersede(&mut self, source: Address) {
        let stale: Vec<(Address, u16)> = self
            .messages
            .keys()
            .filter(|(from, _)| *from == source)
            .copied()
            .collect();

        for key in stale {
            if let Some(state) = self.messages.remove(&key) {
                debug!(source = %key.0, message_id = key.1, "partial message superseded");
                self.superseded.push(ReassemblyError::Superseded {
                    source_addr: key.0,
                    message_id: key.1,
                    missing: state.missing_count(),
                });
            }
        }
    }

    /// Drop partial state and history for one source.
    pub fn forget(&mut self, source: Address) {
        self.messages.retain(|(from, _), _| *from != source);
        self.delivered.remove(&source);
    }

    pub fn stats(&self) -> ReassemblerStats {
        ReassemblerStats {
            partial_messages: self.messages.len(),
            buffered_fragments: self.messages.values().map(|s| s.fragments.len()).sum(),
        }
    }

    /// Whether no partial messages are being tracked.
    pub fn is_idle(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Statistics about reassembler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblerStats {
    /// Messages with at least one fragment but not yet complete
    pub partial_messages: usize,

    /// Fragments held across all partial messages
    pub buffered_fragments: usize,
}
