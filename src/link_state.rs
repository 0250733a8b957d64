//! Shared state of one link, guarded by a single mutex with two condition variables: one for
//!  "the outstanding frame was acknowledged", one for "there is something for the application
//!  to pick up". All locking lives behind the methods of [LinkState]; neither the mutex nor
//!  the condvars are visible to callers, so no caller can hold the lock across unrelated work.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Outcome of waiting for the ACK of the outstanding frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckWait {
    Acked,
    TimedOut,
    /// the link died while waiting, there is no point in retransmitting
    Closed,
}

/// What the receiving side of the link has for the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Data(Vec<u8>),
    /// the peer declared its stream complete
    End,
    /// nothing new within the poll interval, ask again
    Idle,
    /// the link died before the peer completed its stream
    Closed,
}

#[derive(Debug)]
struct LinkStateInner {
    /// id the next fresh outbound frame will carry, alternating 0 and 1
    next_send_id: u16,
    /// true while a sent frame waits for its ACK
    awaiting_ack: bool,
    /// id of the frame awaiting its ACK
    outstanding_id: u16,
    /// id of the last accepted inbound data/END frame; an inbound frame repeating it is a
    ///  duplicate that gets re-ACKed but not redelivered
    last_received_id: Option<u16>,
    /// payloads accepted from the peer in arrival order, not yet picked up by the application.
    ///  Every frame in here was already ACKed, so losing one would break the delivery promise;
    ///  stop-and-wait keeps the backlog to the application's scheduling lag.
    inbound_data: VecDeque<Vec<u8>>,
    peer_sent_end: bool,
    local_sent_end: bool,
    /// latch set when the link dies for any reason; wakes and unblocks everything
    closed: bool,
}

pub struct LinkState {
    inner: Mutex<LinkStateInner>,
    ack_cond: Condvar,
    data_cond: Condvar,
}

impl LinkState {
    pub fn new() -> LinkState {
        LinkState {
            inner: Mutex::new(LinkStateInner {
                next_send_id: 0,
                awaiting_ack: false,
                outstanding_id: 0,
                last_received_id: None,
                inbound_data: VecDeque::new(),
                peer_sent_end: false,
                local_sent_end: false,
                closed: false,
            }),
            ack_cond: Condvar::new(),
            data_cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkStateInner> {
        self.inner.lock().expect("link state mutex poisoned")
    }

    pub fn next_send_id(&self) -> u16 {
        self.lock().next_send_id
    }

    /// Arms the ack wait for `id`. Called once per unit, before the first transmission
    ///  attempt; arming per attempt would throw away an ACK that arrives in the gap between
    ///  two attempts.
    pub fn arm_ack_wait(&self, id: u16) {
        let mut inner = self.lock();
        inner.awaiting_ack = true;
        inner.outstanding_id = id;
    }

    /// Blocks until the dispatcher signals the ACK of the armed frame, the timeout elapses,
    ///  or the link is closed. Called once per transmission attempt.
    pub fn await_ack(&self, timeout: Duration) -> AckWait {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if !inner.awaiting_ack {
                return AckWait::Acked;
            }
            if inner.closed {
                return AckWait::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return AckWait::TimedOut;
            }
            let (guard, _) = self
                .ack_cond
                .wait_timeout(inner, deadline - now)
                .expect("link state mutex poisoned");
            inner = guard;
        }
    }

    /// Called by the dispatcher for every inbound ACK. Returns false if no send is waiting for
    ///  this id; such an ACK is stale or unsolicited and the caller drops it.
    pub fn on_ack(&self, id: u16) -> bool {
        let mut inner = self.lock();
        if inner.awaiting_ack && inner.outstanding_id == id {
            inner.awaiting_ack = false;
            self.ack_cond.notify_all();
            true
        } else {
            false
        }
    }

    /// Flips the send id after an acknowledged unit, latching the local end flag if that unit
    ///  was the final one.
    pub fn advance_send_id(&self, was_final: bool) {
        let mut inner = self.lock();
        inner.next_send_id ^= 1;
        if was_final {
            inner.local_sent_end = true;
        }
    }

    /// Marks that this side will never send an END frame of its own. The hash relay presets
    ///  this because its stream ends implicitly with the peer's.
    pub fn mark_local_end(&self) {
        self.lock().local_sent_end = true;
    }

    /// Records an accepted data payload and wakes the application. Returns false for a
    ///  duplicate, which the caller re-ACKs without redelivery.
    pub fn accept_data(&self, id: u16, payload: &[u8]) -> bool {
        let mut inner = self.lock();
        if inner.last_received_id == Some(id) {
            return false;
        }
        inner.last_received_id = Some(id);
        inner.inbound_data.push_back(payload.to_vec());
        self.data_cond.notify_all();
        true
    }

    /// Records the peer's END. Duplicates follow the same re-ACK rule as data frames.
    pub fn accept_end(&self, id: u16) -> bool {
        let mut inner = self.lock();
        if inner.last_received_id == Some(id) {
            return false;
        }
        inner.last_received_id = Some(id);
        inner.peer_sent_end = true;
        self.data_cond.notify_all();
        true
    }

    /// Hands the next inbound event to the application. Backlogged payloads win over the end
    ///  flag, so no unit of a completed stream is ever skipped.
    pub fn await_inbound(&self, timeout: Duration) -> Inbound {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(payload) = inner.inbound_data.pop_front() {
                return Inbound::Data(payload);
            }
            if inner.peer_sent_end {
                return Inbound::End;
            }
            if inner.closed {
                return Inbound::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Inbound::Idle;
            }
            let (guard, _) = self
                .data_cond
                .wait_timeout(inner, deadline - now)
                .expect("link state mutex poisoned");
            inner = guard;
        }
    }

    pub fn peer_sent_end(&self) -> bool {
        self.lock().peer_sent_end
    }

    pub fn both_ends_done(&self) -> bool {
        let inner = self.lock();
        inner.peer_sent_end && inner.local_sent_end
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Declares the link dead and wakes every waiting thread. Idempotent.
    pub fn close(&self) {
        let mut inner = self.lock();
        if !inner.closed {
            inner.closed = true;
            self.ack_cond.notify_all();
            self.data_cond.notify_all();
        }
    }
}

impl Default for LinkState {
    fn default() -> Self {
        LinkState::new()
    }
}
