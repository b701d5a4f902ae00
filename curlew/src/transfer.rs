//! In-flight transfers and their slot table.

use slab::Slab;

use crate::chain::BufferChain;
use crate::engine::TransferId;
use crate::request::{Request, Token};
use crate::session::SessionKey;

/// One request on its way through the reactor.
///
/// Created by [`Session::submit`](crate::Session::submit), moved through the
/// submission channel, and owned by the reactor until it becomes a
/// [`Completion`](crate::Completion).
#[derive(Debug)]
pub(crate) struct Transfer {
    pub(crate) session: SessionKey,
    pub(crate) token: Token,
    pub(crate) request: Request,
    pub(crate) headers: BufferChain,
    pub(crate) body: BufferChain,
}

impl Transfer {
    pub(crate) fn new(session: SessionKey, token: Token, request: Request) -> Self {
        Transfer {
            session,
            token,
            request,
            headers: BufferChain::new(),
            body: BufferChain::new(),
        }
    }
}

enum Slot {
    /// Owned by the engine, collecting response bytes.
    InFlight(Box<Transfer>),
    /// Finished and delivered. The engine still holds state for the id until
    /// the consumer releases the completion.
    Retired,
}

struct Entry {
    generation: u32,
    slot: Slot,
}

/// Per-session table of transfer slots.
///
/// A slot is only reused after the engine's `cleanup` for its previous id,
/// so an engine never sees the same id for two live transfers.
pub(crate) struct TransferTable {
    entries: Slab<Entry>,
    next_generation: u32,
    in_flight: usize,
}

impl TransferTable {
    pub(crate) fn new() -> Self {
        TransferTable {
            entries: Slab::new(),
            next_generation: 0,
            in_flight: 0,
        }
    }

    /// The id the next [`insert`](Self::insert) will return.
    pub(crate) fn next_id(&self) -> TransferId {
        TransferId {
            index: self.entries.vacant_key() as u32,
            generation: self.next_generation,
        }
    }

    pub(crate) fn insert(&mut self, transfer: Transfer) -> TransferId {
        let id = self.next_id();
        let index = self.entries.insert(Entry {
            generation: id.generation,
            slot: Slot::InFlight(Box::new(transfer)),
        });
        debug_assert_eq!(index, id.index());
        self.next_generation = self.next_generation.wrapping_add(1);
        self.in_flight += 1;
        id
    }

    fn entry_mut(&mut self, id: TransferId) -> Option<&mut Entry> {
        self.entries
            .get_mut(id.index())
            .filter(|e| e.generation == id.generation)
    }

    pub(crate) fn get_mut(&mut self, id: TransferId) -> Option<&mut Transfer> {
        match &mut self.entry_mut(id)?.slot {
            Slot::InFlight(transfer) => Some(transfer.as_mut()),
            Slot::Retired => None,
        }
    }

    /// Take the transfer out of its slot and mark the slot retired. Returns
    /// `None` if the id is stale or already retired.
    pub(crate) fn retire(&mut self, id: TransferId) -> Option<Transfer> {
        let entry = self.entry_mut(id)?;
        match std::mem::replace(&mut entry.slot, Slot::Retired) {
            Slot::InFlight(transfer) => {
                self.in_flight -= 1;
                Some(*transfer)
            }
            Slot::Retired => None,
        }
    }

    /// Free a retired slot. Returns true if the id named one.
    pub(crate) fn release(&mut self, id: TransferId) -> bool {
        let retired = matches!(
            self.entry_mut(id),
            Some(Entry {
                slot: Slot::Retired,
                ..
            })
        );
        if retired {
            self.entries.remove(id.index());
        }
        retired
    }

    /// Transfers still collecting response bytes.
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// No slot is held, in flight or retired.
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
