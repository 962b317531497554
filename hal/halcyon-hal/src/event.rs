//! Event masks and callback delivery
//!
//! Each driver owns an [`EventCore`] holding its registered handler and the
//! set of enabled event bits. Handler lookup and invocation happen inside one
//! critical section, so swapping the handler is atomic with respect to
//! delivery: every notification goes to exactly the handler that was
//! registered when it was raised.

use core::cell::RefCell;
use core::ops::BitAnd;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::transfer::{Direction, TransferEvent};

/// Declare a peripheral event mask
///
/// Wraps `bitflags!` and adds the derives and `defmt` formatting every mask
/// in this crate shares.
macro_rules! event_flags {
    (
        $(#[$outer:meta])*
        pub struct $name:ident: u32 {
            $( $(#[$inner:ident $($args:tt)*])* const $flag:ident = $value:expr; )*
        }
    ) => {
        bitflags::bitflags! {
            $(#[$outer])*
            #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name: u32 {
                $( $(#[$inner $($args)*])* const $flag = $value; )*
            }
        }

        #[cfg(feature = "defmt")]
        impl defmt::Format for $name {
            fn format(&self, f: defmt::Formatter) {
                defmt::write!(f, "{=str}({=u32:#x})", stringify!($name), self.bits())
            }
        }
    };
}

pub(crate) use event_flags;

/// Bitmask of hardware conditions for one peripheral
pub trait EventFlags:
    bitflags::Flags + Copy + PartialEq + BitAnd<Output = Self> + core::fmt::Debug + 'static
{
    /// Flag reported alongside a settled transfer
    fn completion(direction: Direction, outcome: &TransferEvent) -> Self;
}

/// A transfer that reached a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Completion {
    pub direction: Direction,
    pub outcome: TransferEvent,
}

/// What a handler receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Notification<F> {
    /// Event bits that triggered this call
    pub events: F,
    /// Set when the call reports the end of an async transfer
    pub transfer: Option<Completion>,
}

/// Callback registered on a driver
///
/// Runs in interrupt context. The handler's own fields play the role of
/// the callback argument.
pub trait EventHandler<F>: Sync {
    fn on_event(&self, note: Notification<F>);
}

impl<F, T> EventHandler<F> for T
where
    T: Fn(Notification<F>) + Sync,
{
    fn on_event(&self, note: Notification<F>) {
        self(note)
    }
}

struct Registration<F: 'static> {
    handler: Option<&'static dyn EventHandler<F>>,
    enabled: F,
    priority: u8,
}

/// Handler slot plus enabled-event mask
pub struct EventCore<F: EventFlags> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<Registration<F>>>,
}

impl<F: EventFlags> Default for EventCore<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: EventFlags> EventCore<F> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Registration {
                handler: None,
                enabled: F::empty(),
                priority: 0,
            })),
        }
    }

    /// Replace the handler; `None` unregisters
    pub fn register(&self, handler: Option<&'static dyn EventHandler<F>>) {
        self.inner.lock(|r| r.borrow_mut().handler = handler);
    }

    pub fn has_handler(&self) -> bool {
        self.inner.lock(|r| r.borrow().handler.is_some())
    }

    /// Enable or disable event bits
    ///
    /// `priority` is recorded for the interrupt line when enabling.
    pub fn enable(&self, mask: F, priority: u8, enable: bool) {
        self.inner.lock(|r| {
            let mut r = r.borrow_mut();
            if enable {
                r.enabled.insert(mask);
                r.priority = priority;
            } else {
                r.enabled.remove(mask);
            }
        });
    }

    pub fn enabled(&self) -> F {
        self.inner.lock(|r| r.borrow().enabled)
    }

    pub fn priority(&self) -> u8 {
        self.inner.lock(|r| r.borrow().priority)
    }

    /// Drop the handler and disable every event
    pub fn clear(&self) {
        self.inner.lock(|r| {
            let mut r = r.borrow_mut();
            r.handler = None;
            r.enabled = F::empty();
        });
    }

    /// Deliver hardware conditions, filtered by the enabled mask
    ///
    /// Returns the bits that reached a handler.
    pub fn raise(&self, events: F) -> F {
        critical_section::with(|_| {
            let (handler, delivered) = self.inner.lock(|r| {
                let r = r.borrow();
                (r.handler, events & r.enabled)
            });
            match handler {
                Some(handler) if !delivered.is_empty() => {
                    handler.on_event(Notification {
                        events: delivered,
                        transfer: None,
                    });
                    delivered
                }
                _ => F::empty(),
            }
        })
    }

    /// Deliver a settled transfer
    ///
    /// Completions are not filtered by the enabled mask: every started
    /// transfer reports exactly once to whichever handler is registered.
    pub(crate) fn deliver_completion(&self, completion: Completion) -> bool {
        critical_section::with(|_| {
            let handler = self.inner.lock(|r| r.borrow().handler);
            match handler {
                Some(handler) => {
                    handler.on_event(Notification {
                        events: F::completion(completion.direction, &completion.outcome),
                        transfer: Some(completion),
                    });
                    true
                }
                None => false,
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use portable_atomic::{AtomicU32, Ordering};

    event_flags! {
        /// Flags used by the core tests
        pub struct TestEvent: u32 {
            /// Receive level reached
            const FIFO = 1 << 0;
            #[doc = "Data lost"]
            const OVERFLOW = 1 << 1;
            const DONE = 1 << 2;
            const FAILED = 1 << 3;
        }
    }

    impl EventFlags for TestEvent {
        fn completion(_direction: Direction, outcome: &TransferEvent) -> Self {
            match outcome {
                TransferEvent::Error { .. } => TestEvent::FAILED,
                _ => TestEvent::DONE,
            }
        }
    }

    /// Handler that counts calls and remembers the last event bits
    pub(crate) struct Recorder {
        pub calls: AtomicU32,
        pub last_bits: AtomicU32,
        pub completions: AtomicU32,
    }

    impl Recorder {
        pub const fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                last_bits: AtomicU32::new(0),
                completions: AtomicU32::new(0),
            }
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn completions(&self) -> u32 {
            self.completions.load(Ordering::SeqCst)
        }

        pub fn reset(&self) {
            self.calls.store(0, Ordering::SeqCst);
            self.last_bits.store(0, Ordering::SeqCst);
            self.completions.store(0, Ordering::SeqCst);
        }
    }

    impl EventHandler<TestEvent> for Recorder {
        fn on_event(&self, note: Notification<TestEvent>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_bits.store(note.events.bits(), Ordering::SeqCst);
            if note.transfer.is_some() {
                self.completions.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_raise_filters_by_enabled_mask() {
        static REC: Recorder = Recorder::new();
        let core: EventCore<TestEvent> = EventCore::new();
        core.register(Some(&REC));

        // Nothing enabled yet
        assert_eq!(core.raise(TestEvent::FIFO), TestEvent::empty());
        assert_eq!(REC.calls(), 0);

        core.enable(TestEvent::FIFO | TestEvent::OVERFLOW, 3, true);
        assert_eq!(core.priority(), 3);
        let delivered = core.raise(TestEvent::FIFO | TestEvent::DONE);
        assert_eq!(delivered, TestEvent::FIFO);
        assert_eq!(REC.calls(), 1);
        assert_eq!(REC.last_bits.load(Ordering::SeqCst), TestEvent::FIFO.bits());
    }

    #[test]
    fn test_disable_removes_only_named_bits() {
        let core: EventCore<TestEvent> = EventCore::new();
        core.enable(TestEvent::all(), 0, true);
        core.enable(TestEvent::OVERFLOW, 0, false);
        assert_eq!(core.enabled(), TestEvent::all() - TestEvent::OVERFLOW);
    }

    #[test]
    fn test_raise_without_handler_delivers_nothing() {
        let core: EventCore<TestEvent> = EventCore::new();
        core.enable(TestEvent::all(), 0, true);
        assert!(core.raise(TestEvent::FIFO).is_empty());
    }

    #[test]
    fn test_replacing_handler() {
        static FIRST: Recorder = Recorder::new();
        static SECOND: Recorder = Recorder::new();
        let core: EventCore<TestEvent> = EventCore::new();
        core.enable(TestEvent::FIFO, 0, true);

        core.register(Some(&FIRST));
        core.raise(TestEvent::FIFO);
        core.register(Some(&SECOND));
        core.raise(TestEvent::FIFO);

        assert_eq!(FIRST.calls(), 1);
        assert_eq!(SECOND.calls(), 1);

        core.register(None);
        assert!(!core.has_handler());
        core.raise(TestEvent::FIFO);
        assert_eq!(SECOND.calls(), 1);
    }

    #[test]
    fn test_closure_handler() {
        static HITS: AtomicU32 = AtomicU32::new(0);
        fn on_event(note: Notification<TestEvent>) {
            HITS.fetch_add(note.events.bits(), Ordering::SeqCst);
        }

        let core: EventCore<TestEvent> = EventCore::new();
        core.register(Some(&on_event));
        core.enable(TestEvent::OVERFLOW, 0, true);
        core.raise(TestEvent::OVERFLOW);
        assert_eq!(HITS.load(Ordering::SeqCst), TestEvent::OVERFLOW.bits());
    }

    #[test]
    fn test_completion_ignores_mask() {
        static REC: Recorder = Recorder::new();
        let core: EventCore<TestEvent> = EventCore::new();
        core.register(Some(&REC));

        let delivered = core.deliver_completion(Completion {
            direction: Direction::Write,
            outcome: TransferEvent::Complete { bytes: 4 },
        });
        assert!(delivered);
        assert_eq!(REC.completions(), 1);
        assert_eq!(REC.last_bits.load(Ordering::SeqCst), TestEvent::DONE.bits());
    }

    #[test]
    fn test_clear() {
        static REC: Recorder = Recorder::new();
        let core: EventCore<TestEvent> = EventCore::new();
        core.register(Some(&REC));
        core.enable(TestEvent::all(), 0, true);
        core.clear();
        assert!(core.enabled().is_empty());
        assert!(!core.has_handler());
    }
}
