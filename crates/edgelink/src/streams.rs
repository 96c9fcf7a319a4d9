use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use edgelink_object::{Error, Result};
use tracing::{debug, trace, warn};

/// Capacity of the stream table; bounds concurrent subscriptions.
pub const MAX_STREAMS: usize = 16;

/// Opaque token naming a live stream-table slot.
///
/// Layout: `(generation << 16) | (index + 1)`. Zero is never valid, so a
/// zero-initialized handle cannot accidentally resolve. Releasing a slot
/// bumps its generation, which invalidates every outstanding handle to it
/// even after the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u32);

impl SubscriptionHandle {
    fn from_parts(generation: u16, index: usize) -> Self {
        Self((u32::from(generation) << 16) | (index as u32 + 1))
    }

    /// Slot index; underflow wraps to `u16::MAX`, which fails bounds checks.
    fn index(self) -> usize {
        ((self.0 & 0xFFFF) as u16).wrapping_sub(1) as usize
    }

    fn generation(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Raw 32-bit value, e.g. for logging.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Per-subscription payload sink, invoked on the reader thread.
pub(crate) trait StreamEvents: Send {
    fn on_event(&mut self, payload: &[u8], handle: SubscriptionHandle) -> Result<()>;
}

/// What the reader observed on a subscription stream.
pub(crate) enum Delivery<'a> {
    /// A payload frame; `terminate` set means this is the stream's last.
    Event { payload: &'a [u8], terminate: bool },
    /// Server-side error; the stream is dead.
    Error { payload: &'a [u8] },
}

/// Response recorded for a pending subscription open.
#[derive(Debug)]
pub(crate) struct Ack {
    pub error: bool,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct PendingAck {
    /// Set when the opener timed out; the eventual response frees the slot.
    abandoned: bool,
    ack: Option<Ack>,
}

enum SlotState {
    Free,
    Pending(PendingAck),
    Active,
}

struct Slot {
    stream_id: i32,
    generation: u16,
    state: SlotState,
    events: Option<Box<dyn StreamEvents>>,
}

impl Slot {
    const fn new() -> Self {
        Self { stream_id: 0, generation: 0, state: SlotState::Free, events: None }
    }

    fn free(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.state = SlotState::Free;
        self.events = None;
    }
}

struct TableInner {
    slots: [Slot; MAX_STREAMS],
    /// Slot currently running a callback, and on which thread. Guards
    /// release against an in-flight dispatch while still letting the
    /// callback close its own handle.
    dispatching: Option<(usize, ThreadId)>,
}

/// Fixed-capacity table of in-flight streams with generational handles.
pub(crate) struct StreamTable {
    inner: Mutex<TableInner>,
    signal: Condvar,
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                slots: std::array::from_fn(|_| Slot::new()),
                dispatching: None,
            }),
            signal: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn validate(inner: &TableInner, handle: SubscriptionHandle) -> Result<usize> {
        let index = handle.index();
        if index >= MAX_STREAMS {
            return Err(Error::Invalid);
        }
        let slot = &inner.slots[index];
        if slot.generation != handle.generation() || matches!(slot.state, SlotState::Free) {
            return Err(Error::NoEntry);
        }
        Ok(index)
    }

    /// Installs `events` in a free slot for `stream_id`, initially pending
    /// its open acknowledgment. `NoMem` when the table is full.
    pub fn register(
        &self,
        stream_id: i32,
        events: Box<dyn StreamEvents>,
    ) -> Result<SubscriptionHandle> {
        let mut inner = self.lock();
        for (index, slot) in inner.slots.iter_mut().enumerate() {
            if matches!(slot.state, SlotState::Free) {
                slot.stream_id = stream_id;
                slot.state = SlotState::Pending(PendingAck::default());
                slot.events = Some(events);
                let handle = SubscriptionHandle::from_parts(slot.generation, index);
                debug!(stream_id, index, handle = handle.raw(), "registered stream");
                return Ok(handle);
            }
        }
        warn!(stream_id, "stream table full");
        Err(Error::NoMem)
    }

    /// Blocks while another thread is mid-callback on slot `index`.
    fn wait_not_dispatching<'g>(
        &self,
        mut inner: MutexGuard<'g, TableInner>,
        index: usize,
    ) -> MutexGuard<'g, TableInner> {
        loop {
            match inner.dispatching {
                Some((busy, tid)) if busy == index && tid != thread::current().id() => {
                    inner = self.signal.wait(inner).unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                _ => return inner,
            }
        }
    }

    /// Releases the slot named by `handle`, returning its stream id.
    ///
    /// Waits for any in-flight callback on another thread to return first; a
    /// callback releasing its own handle proceeds immediately.
    pub fn release(&self, handle: SubscriptionHandle) -> Result<i32> {
        let mut inner = self.lock();
        let index = Self::validate(&inner, handle)?;
        inner = self.wait_not_dispatching(inner, index);
        // The dispatch just waited out may itself have released the slot.
        let index = Self::validate(&inner, handle)?;

        let slot = &mut inner.slots[index];
        let stream_id = slot.stream_id;
        slot.free();
        debug!(stream_id, index, handle = handle.raw(), "released stream");
        self.signal.notify_all();
        Ok(stream_id)
    }

    /// Runs `action` under the table lock if `handle` is live, passing the
    /// slot index. Keeps the slot pinned against concurrent release for the
    /// duration.
    pub fn protected<R>(
        &self,
        handle: SubscriptionHandle,
        action: impl FnOnce(usize) -> R,
    ) -> Result<R> {
        let inner = self.lock();
        let index = Self::validate(&inner, handle)?;
        Ok(action(index))
    }

    /// Waits for the open acknowledgment on a pending slot.
    ///
    /// On timeout the slot is marked abandoned: it stays reserved, and the
    /// late acknowledgment (or error) frees it when it eventually arrives.
    pub fn wait_ack(&self, handle: SubscriptionHandle, timeout: Duration) -> Result<Ack> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            let index = Self::validate(&inner, handle)?;
            let SlotState::Pending(pending) = &mut inner.slots[index].state else {
                return Err(Error::Failure);
            };
            if let Some(ack) = pending.ack.take() {
                return Ok(ack);
            }

            let now = Instant::now();
            if now >= deadline {
                pending.abandoned = true;
                return Err(Error::Timeout);
            }
            let (guard, _) = self
                .signal
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inner = guard;
        }
    }

    /// Promotes a pending slot to active once its open was acknowledged.
    pub fn activate(&self, handle: SubscriptionHandle) -> Result<()> {
        let mut inner = self.lock();
        let index = Self::validate(&inner, handle)?;
        match inner.slots[index].state {
            SlotState::Pending(_) => {
                inner.slots[index].state = SlotState::Active;
                Ok(())
            }
            _ => Err(Error::Failure),
        }
    }

    /// Routes a frame on `stream_id` to its slot. Unknown stream ids are
    /// dropped silently; the owner may have closed concurrently.
    pub fn deliver(&self, stream_id: i32, delivery: Delivery<'_>) {
        let mut inner = self.lock();
        let Some(index) = inner
            .slots
            .iter()
            .position(|s| !matches!(s.state, SlotState::Free) && s.stream_id == stream_id)
        else {
            trace!(stream_id, "dropping frame for unknown stream");
            return;
        };

        if matches!(inner.slots[index].state, SlotState::Pending(_)) {
            let abandoned = match &inner.slots[index].state {
                SlotState::Pending(pending) => pending.abandoned,
                _ => false,
            };
            if abandoned {
                debug!(stream_id, "acknowledgment for abandoned open; freeing slot");
                inner.slots[index].free();
            } else {
                let ack = match delivery {
                    Delivery::Event { payload, .. } => Ack { error: false, payload: payload.to_vec() },
                    Delivery::Error { payload } => Ack { error: true, payload: payload.to_vec() },
                };
                if let SlotState::Pending(pending) = &mut inner.slots[index].state {
                    pending.ack = Some(ack);
                }
            }
            self.signal.notify_all();
            return;
        }

        match delivery {
            Delivery::Event { payload, terminate } => {
                self.dispatch_event(inner, index, payload, terminate);
            }
            Delivery::Error { .. } => {
                warn!(stream_id, "server error on subscription stream; closing");
                inner.slots[index].free();
                self.signal.notify_all();
            }
        }
    }

    /// Invokes the slot's callback outside the lock, with the slot pinned by
    /// the `dispatching` marker so cross-thread release blocks until the
    /// callback returns.
    fn dispatch_event(
        &self,
        mut inner: MutexGuard<'_, TableInner>,
        index: usize,
        payload: &[u8],
        terminate: bool,
    ) {
        let slot = &mut inner.slots[index];
        let handle = SubscriptionHandle::from_parts(slot.generation, index);
        let Some(mut events) = slot.events.take() else {
            // Reader is single-threaded, so a second dispatch cannot race
            // the callback out of the slot.
            debug!(index, "slot has no callback; dropping frame");
            return;
        };
        inner.dispatching = Some((index, thread::current().id()));
        drop(inner);

        let result = events.on_event(payload, handle);

        let mut inner = self.lock();
        inner.dispatching = None;
        let slot = &mut inner.slots[index];
        let still_live =
            slot.generation == handle.generation() && !matches!(slot.state, SlotState::Free);
        if still_live {
            slot.events = Some(events);
            if terminate {
                debug!(index, "stream terminated by server");
                slot.free();
            }
        }
        self.signal.notify_all();

        if let Err(err) = result {
            debug!(index, %err, "subscription callback failed; payload dropped");
        }
    }

    /// Frees every slot; used when the transport dies. Runs on the reader
    /// thread, so no dispatch can be in flight.
    pub fn release_all(&self) {
        let mut inner = self.lock();
        for slot in &mut inner.slots {
            if !matches!(slot.state, SlotState::Free) {
                slot.free();
            }
        }
        self.signal.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingEvents(Arc<AtomicUsize>);

    impl StreamEvents for CountingEvents {
        fn on_event(&mut self, _payload: &[u8], _handle: SubscriptionHandle) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting(table: &StreamTable, stream_id: i32) -> (SubscriptionHandle, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle =
            table.register(stream_id, Box::new(CountingEvents(Arc::clone(&count)))).unwrap();
        table.activate(handle).unwrap();
        (handle, count)
    }

    #[test]
    fn handle_is_never_zero_and_survives_round_trip() {
        let table = StreamTable::new();
        let (handle, _) = counting(&table, 2);
        assert_ne!(handle.raw(), 0);
        assert_eq!(handle.index(), 0);
        assert!(table.protected(handle, |_| ()).is_ok());
    }

    #[test]
    fn validate_fails_after_release_even_when_slot_reused() {
        let table = StreamTable::new();
        let (old, _) = counting(&table, 2);
        assert_eq!(table.release(old).unwrap(), 2);
        assert_eq!(table.protected(old, |_| ()).unwrap_err(), Error::NoEntry);

        // Reuse bumps into the same slot with a fresh generation.
        let (new, _) = counting(&table, 3);
        assert_eq!(new.index(), old.index());
        assert_ne!(new.raw(), old.raw());
        assert_eq!(table.protected(old, |_| ()).unwrap_err(), Error::NoEntry);
        assert!(table.protected(new, |_| ()).is_ok());
    }

    #[test]
    fn forged_handles_are_invalid() {
        let table = StreamTable::new();
        let forged = SubscriptionHandle(u32::from(u16::MAX));
        assert_eq!(table.protected(forged, |_| ()).unwrap_err(), Error::Invalid);
        let zero = SubscriptionHandle(0);
        assert_eq!(table.protected(zero, |_| ()).unwrap_err(), Error::Invalid);
    }

    #[test]
    fn table_capacity_is_enforced() {
        let table = StreamTable::new();
        let handles: Vec<_> = (0..MAX_STREAMS as i32)
            .map(|i| counting(&table, i + 2).0)
            .collect();
        let overflow = table.register(100, Box::new(CountingEvents(Arc::default())));
        assert_eq!(overflow.unwrap_err(), Error::NoMem);

        table.release(handles[0]).unwrap();
        assert!(table.register(100, Box::new(CountingEvents(Arc::default()))).is_ok());
    }

    #[test]
    fn deliver_routes_by_stream_id() {
        let table = StreamTable::new();
        let (_h2, count2) = counting(&table, 2);
        let (_h3, count3) = counting(&table, 3);

        table.deliver(3, Delivery::Event { payload: b"x", terminate: false });
        table.deliver(3, Delivery::Event { payload: b"y", terminate: false });
        table.deliver(2, Delivery::Event { payload: b"z", terminate: false });
        // Unknown stream: silently dropped.
        table.deliver(9, Delivery::Event { payload: b"?", terminate: false });

        assert_eq!(count2.load(Ordering::SeqCst), 1);
        assert_eq!(count3.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn terminate_frees_slot_after_callback() {
        let table = StreamTable::new();
        let (handle, count) = counting(&table, 2);

        table.deliver(2, Delivery::Event { payload: b"last", terminate: true });
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(table.protected(handle, |_| ()).unwrap_err(), Error::NoEntry);

        table.deliver(2, Delivery::Event { payload: b"late", terminate: false });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn server_error_frees_slot_without_callback() {
        let table = StreamTable::new();
        let (handle, count) = counting(&table, 2);
        table.deliver(2, Delivery::Error { payload: b"{}" });
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(table.protected(handle, |_| ()).unwrap_err(), Error::NoEntry);
    }

    struct SelfClosing {
        table: &'static StreamTable,
    }

    impl StreamEvents for SelfClosing {
        fn on_event(&mut self, _payload: &[u8], handle: SubscriptionHandle) -> Result<()> {
            // Closing from within the callback must not deadlock.
            self.table.release(handle)?;
            Ok(())
        }
    }

    #[test]
    fn callback_may_close_its_own_handle() {
        let table = Box::leak(Box::new(StreamTable::new()));
        let handle = table.register(2, Box::new(SelfClosing { table })).unwrap();
        table.activate(handle).unwrap();

        table.deliver(2, Delivery::Event { payload: b"x", terminate: false });
        assert_eq!(table.protected(handle, |_| ()).unwrap_err(), Error::NoEntry);
    }

    #[test]
    fn cross_thread_close_waits_for_callback() {
        use std::sync::mpsc;

        struct Gated {
            entered: mpsc::Sender<()>,
            proceed: mpsc::Receiver<()>,
        }
        impl StreamEvents for Gated {
            fn on_event(&mut self, _payload: &[u8], _handle: SubscriptionHandle) -> Result<()> {
                self.entered.send(()).unwrap();
                self.proceed.recv().unwrap();
                Ok(())
            }
        }

        let table = Arc::new(StreamTable::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (proceed_tx, proceed_rx) = mpsc::channel();
        let handle = table
            .register(2, Box::new(Gated { entered: entered_tx, proceed: proceed_rx }))
            .unwrap();
        table.activate(handle).unwrap();

        let reader = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                table.deliver(2, Delivery::Event { payload: b"x", terminate: false });
            })
        };
        entered_rx.recv().unwrap();

        let closer = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.release(handle))
        };
        // The callback is still parked, so close must not have finished.
        thread::sleep(Duration::from_millis(50));
        assert!(!closer.is_finished());

        proceed_tx.send(()).unwrap();
        closer.join().unwrap().unwrap();
        reader.join().unwrap();

        // A frame after the close is dropped.
        table.deliver(2, Delivery::Event { payload: b"late", terminate: false });
        assert_eq!(table.protected(handle, |_| ()).unwrap_err(), Error::NoEntry);
    }

    #[test]
    fn abandoned_open_is_freed_by_late_ack() {
        let table = StreamTable::new();
        let handle = table.register(2, Box::new(CountingEvents(Arc::default()))).unwrap();

        assert_eq!(
            table.wait_ack(handle, Duration::from_millis(10)).unwrap_err(),
            Error::Timeout
        );
        // Slot stays reserved until the late acknowledgment lands.
        assert!(table.protected(handle, |_| ()).is_ok());

        table.deliver(2, Delivery::Event { payload: b"", terminate: false });
        assert_eq!(table.protected(handle, |_| ()).unwrap_err(), Error::NoEntry);
    }

    #[test]
    fn ack_rendezvous() {
        let table = Arc::new(StreamTable::new());
        let handle = table.register(2, Box::new(CountingEvents(Arc::default()))).unwrap();

        let acker = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                table.deliver(2, Delivery::Event { payload: b"ok", terminate: false });
            })
        };

        let ack = table.wait_ack(handle, Duration::from_secs(5)).unwrap();
        assert!(!ack.error);
        assert_eq!(ack.payload, b"ok");
        acker.join().unwrap();

        table.activate(handle).unwrap();
        assert!(table.protected(handle, |_| ()).is_ok());
    }

    #[test]
    fn release_all_invalidates_everything() {
        let table = StreamTable::new();
        let (a, _) = counting(&table, 2);
        let (b, _) = counting(&table, 3);
        table.release_all();
        assert_eq!(table.protected(a, |_| ()).unwrap_err(), Error::NoEntry);
        assert_eq!(table.protected(b, |_| ()).unwrap_err(), Error::NoEntry);
    }
}
