//! Asynchronous transfer state
//!
//! Every handle has one slot per direction. A slot moves
//! `Idle -> Pending -> {Complete, Error, Aborted} -> Idle`; the terminal
//! states are never stored, they are what [`Transfers::settle`] reports
//! while putting the slot back to idle.
//!
//! Settling is first-come: the interrupt path completing a transfer and an
//! application calling abort race for the same slot, and only the one that
//! finds it pending gets to notify. That is the exactly-once guarantee.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;

use crate::event::{Completion, EventCore, EventFlags};
use crate::result::StatusCode;

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    const fn index(self) -> usize {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }
}

/// Fault reported by hardware for a failed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferFault {
    /// Bus or controller error
    Hardware,
    /// Receive side lost data
    Overflow,
    /// Transmit side ran dry
    Underflow,
    /// Peer stopped responding
    Timeout,
}

/// Terminal state of an async transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferEvent {
    /// Transfer finished; `bytes` is the amount moved
    Complete { bytes: usize },
    /// Hardware reported a fault
    Error { kind: TransferFault },
    /// Cancelled before completion
    Aborted,
}

impl TransferEvent {
    pub fn is_complete(&self) -> bool {
        matches!(self, TransferEvent::Complete { .. })
    }

    pub fn bytes(&self) -> Option<usize> {
        match self {
            TransferEvent::Complete { bytes } => Some(*bytes),
            _ => None,
        }
    }
}

/// Current state of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferState {
    Idle,
    Pending { len: usize },
}

impl TransferState {
    pub fn is_pending(&self) -> bool {
        matches!(self, TransferState::Pending { .. })
    }
}

/// What a backend found when servicing its interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Serviced<F> {
    /// Hardware conditions to raise through the enabled mask
    pub events: F,
    /// Outcome of the async read, if it just finished
    pub read: Option<TransferEvent>,
    /// Outcome of the async write, if it just finished
    pub write: Option<TransferEvent>,
}

impl<F: EventFlags> Serviced<F> {
    pub fn none() -> Self {
        Self {
            events: F::empty(),
            read: None,
            write: None,
        }
    }

    pub fn events(events: F) -> Self {
        Self {
            events,
            ..Self::none()
        }
    }
}

impl<F: EventFlags> Default for Serviced<F> {
    fn default() -> Self {
        Self::none()
    }
}

/// Read and write slots of one handle
pub struct Transfers {
    slots: Mutex<CriticalSectionRawMutex, RefCell<[TransferState; 2]>>,
    done: [Signal<CriticalSectionRawMutex, TransferEvent>; 2],
}

impl Default for Transfers {
    fn default() -> Self {
        Self::new()
    }
}

impl Transfers {
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(RefCell::new([TransferState::Idle; 2])),
            done: [Signal::new(), Signal::new()],
        }
    }

    pub fn state(&self, direction: Direction) -> TransferState {
        self.slots.lock(|s| s.borrow()[direction.index()])
    }

    pub fn is_pending(&self, direction: Direction) -> bool {
        self.state(direction).is_pending()
    }

    /// Either direction pending
    pub fn is_busy(&self) -> bool {
        self.slots.lock(|s| s.borrow().iter().any(TransferState::is_pending))
    }

    /// Move a slot from idle to pending
    ///
    /// Fails with `Busy` and leaves the pending transfer untouched if the
    /// slot is already in use.
    pub fn begin<E: From<StatusCode>>(&self, direction: Direction, len: usize) -> Result<(), E> {
        self.slots.lock(|s| {
            let mut s = s.borrow_mut();
            let slot = &mut s[direction.index()];
            if slot.is_pending() {
                return Err(StatusCode::Busy.into());
            }
            *slot = TransferState::Pending { len };
            self.done[direction.index()].reset();
            Ok(())
        })
    }

    /// Undo a `begin` whose hardware start failed
    ///
    /// No notification is sent: from the caller's point of view the
    /// transfer never started.
    pub fn rollback(&self, direction: Direction) {
        self.slots
            .lock(|s| s.borrow_mut()[direction.index()] = TransferState::Idle);
    }

    /// Settle a pending transfer and notify
    ///
    /// Returns `true` if this call found the slot pending and delivered the
    /// outcome; `false` means someone else already settled it and nothing
    /// was delivered.
    pub fn settle<F: EventFlags>(
        &self,
        direction: Direction,
        outcome: TransferEvent,
        events: &EventCore<F>,
    ) -> bool {
        critical_section::with(|_| {
            let won = self.slots.lock(|s| {
                let mut s = s.borrow_mut();
                let slot = &mut s[direction.index()];
                let pending = slot.is_pending();
                *slot = TransferState::Idle;
                pending
            });
            if won {
                self.done[direction.index()].signal(outcome);
                events.deliver_completion(Completion { direction, outcome });
            }
            won
        })
    }

    /// Settle as aborted
    pub fn abort<F: EventFlags>(&self, direction: Direction, events: &EventCore<F>) -> bool {
        self.settle(direction, TransferEvent::Aborted, events)
    }

    /// Settle whatever the interrupt finished, then raise the rest
    pub fn dispatch<F: EventFlags>(&self, serviced: Serviced<F>, events: &EventCore<F>) {
        if let Some(outcome) = serviced.read {
            self.settle(Direction::Read, outcome, events);
        }
        if let Some(outcome) = serviced.write {
            self.settle(Direction::Write, outcome, events);
        }
        events.raise(serviced.events);
    }

    /// Wait for the current transfer in `direction` to settle
    ///
    /// Fails with `InvalidArgument` when nothing is pending and no outcome
    /// is left to collect, since that wait could never end.
    pub async fn wait<E: From<StatusCode>>(&self, direction: Direction) -> Result<TransferEvent, E> {
        let done = &self.done[direction.index()];
        let armed = critical_section::with(|_| self.is_pending(direction) || done.signaled());
        if !armed {
            return Err(StatusCode::InvalidArgument.into());
        }
        Ok(done.wait().await)
    }

    /// Take the settled outcome without waiting
    pub fn try_outcome(&self, direction: Direction) -> Option<TransferEvent> {
        self.done[direction.index()].try_take()
    }
}
