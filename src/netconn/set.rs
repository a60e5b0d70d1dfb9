//! Shared state backing one module's connection pool.
//!
//! Owned by the caller rather than the module so the unsolicited-event
//! rules can borrow it for the life of the transport. One async lock
//! serializes pool mutation; per-slot signals replace the event-flag
//! group of classic designs, keeping the waiter keyed by connection id.

use core::array;
use core::cell::{Cell, RefCell};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use heapless::Vec;
use no_std_net::IpAddr;

use super::{ConnEvent, NetconnType};
use crate::config::{NETCONN_RX_MSG_MAX, NETCONN_RX_QUEUE};

/// One inbound segment as delivered to `recv`.
pub type RecvData = Vec<u8, NETCONN_RX_MSG_MAX>;

/// Externally observable lifecycle of a virtual connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NetconnState {
    /// Slot unallocated.
    Null,
    /// Allocated and created on the module, not yet connected.
    Init,
    /// Connected, data may flow.
    Connect,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Slot {
    pub connect_id: i8,
    pub state: NetconnState,
    pub ty: Option<NetconnType>,
    pub remote_ip: Option<IpAddr>,
    pub remote_port: u16,
}

impl Slot {
    pub(crate) const FREE: Slot = Slot {
        connect_id: -1,
        state: NetconnState::Null,
        ty: None,
        remote_ip: None,
        remote_port: 0,
    };
}

pub struct NetconnResources<const N: usize> {
    /// Serializes allocation and every multi-step operation on the pool.
    pub(crate) lock: Mutex<CriticalSectionRawMutex, ()>,
    pub(crate) slots: BlockingMutex<CriticalSectionRawMutex, RefCell<[Slot; N]>>,
    /// Wakeups posted by the event rules, one waiter lane per slot.
    pub(crate) events: [Signal<CriticalSectionRawMutex, ConnEvent>; N],
    /// Bounded inbound queues, one per slot.
    pub(crate) queues: [Channel<CriticalSectionRawMutex, RecvData, NETCONN_RX_QUEUE>; N],
    pub(crate) dns: Signal<CriticalSectionRawMutex, IpAddr>,
    /// Connection addressed by the send exchange currently holding the
    /// link. Some completion lines carry no id; this cursor is the only
    /// legal way to attribute them, and only a [`SendTicket`] writes it.
    pub(crate) cursor: BlockingMutex<CriticalSectionRawMutex, Cell<Option<u8>>>,
}

impl<const N: usize> NetconnResources<N> {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            slots: BlockingMutex::new(RefCell::new([Slot::FREE; N])),
            events: array::from_fn(|_| Signal::new()),
            queues: array::from_fn(|_| Channel::new()),
            dns: Signal::new(),
            cursor: BlockingMutex::new(Cell::new(None)),
        }
    }

    pub(crate) fn slot_state(&self, id: usize) -> Option<NetconnState> {
        if id >= N {
            return None;
        }
        Some(self.slots.lock(|s| s.borrow()[id].state))
    }

    pub(crate) fn with_slot<R>(&self, id: usize, f: impl FnOnce(&mut Slot) -> R) -> Option<R> {
        if id >= N {
            return None;
        }
        Some(self.slots.lock(|s| f(&mut s.borrow_mut()[id])))
    }

    pub(crate) fn current_send(&self) -> Option<u8> {
        self.cursor.lock(|c| c.get())
    }

    /// Return a slot to its unallocated defaults and free its queue.
    /// Shared by local close and the remote-close event.
    pub(crate) fn teardown(&self, id: usize) {
        if id >= N {
            return;
        }
        while self.queues[id].try_receive().is_ok() {}
        self.events[id].reset();
        self.with_slot(id, |s| *s = Slot::FREE);
    }

    pub(crate) fn live_count(&self) -> usize {
        self.slots.lock(|s| {
            s.borrow()
                .iter()
                .filter(|s| s.state != NetconnState::Null)
                .count()
        })
    }
}

impl<const N: usize> Default for NetconnResources<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Attribution of an in-flight send, held for the duration of one
/// exchange. Dropping it clears the cursor.
pub(crate) struct SendTicket<'r, const N: usize> {
    res: &'r NetconnResources<N>,
}

impl<'r, const N: usize> SendTicket<'r, N> {
    pub(crate) fn new(res: &'r NetconnResources<N>, id: u8) -> Self {
        res.cursor.lock(|c| c.set(Some(id)));
        Self { res }
    }
}

impl<const N: usize> Drop for SendTicket<'_, N> {
    fn drop(&mut self) {
        self.res.cursor.lock(|c| c.set(None));
    }
}
