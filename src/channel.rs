//! L7: channels — buffered, unbuffered (rendezvous), `select`.
//!
//! Buffered sends go through the store barrier (spec.md §4.7): a buffered
//! channel is itself a container a value can outlive, so the same Region
//! Closure Property that guards pairs/arrays/dicts applies to it.
//! Unbuffered (rendezvous) sends hand the value directly to a waiting
//! receiver without ever parking it in a container, so no repair is
//! needed there.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::barrier::omni_store_repair;
use crate::region::Region;
use crate::value::Value;

struct ChannelState {
    buffer: VecDeque<Value>,
    /// Waiting for a rendezvous partner (unbuffered channels only): a
    /// sender parks its value here until a receiver claims it.
    rendezvous_slot: Option<Value>,
    /// Count of receivers currently parked in `recv()` on an unbuffered
    /// channel with nothing to take yet. Lets `try_send` tell a genuine
    /// rendezvous-ready moment apart from a channel with no receiver at
    /// all, which a non-blocking send must never claim to satisfy.
    waiting_receivers: usize,
    closed: bool,
}

pub struct ChannelInner {
    capacity: usize,
    holder_region: Region,
    state: Mutex<ChannelState>,
    not_empty: Condvar,
    not_full: Condvar,
}

pub fn make_channel(capacity: usize, holder_region: &Region) -> ChannelInner {
    ChannelInner {
        capacity,
        holder_region: holder_region.clone(),
        state: Mutex::new(ChannelState {
            buffer: VecDeque::new(),
            rendezvous_slot: None,
            waiting_receivers: 0,
            closed: false,
        }),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RecvError {
    Closed,
}

impl ChannelInner {
    pub fn is_buffered(&self) -> bool {
        self.capacity > 0
    }

    /// Blocking send. For a buffered channel, the value is repaired
    /// against this channel's holder region before being enqueued,
    /// exactly like storing into an array or dict.
    pub fn send(&self, merge_threshold: usize, mut v: Value) -> Result<(), SendError> {
        if self.is_buffered() {
            v = omni_store_repair(v, &self.holder_region, merge_threshold);
            let mut state = self.state.lock();
            loop {
                if state.closed {
                    return Err(SendError::Closed);
                }
                if state.buffer.len() < self.capacity {
                    state.buffer.push_back(v);
                    self.not_empty.notify_one();
                    return Ok(());
                }
                self.not_full.wait(&mut state);
            }
        } else {
            let mut state = self.state.lock();
            loop {
                if state.closed {
                    return Err(SendError::Closed);
                }
                if state.rendezvous_slot.is_none() {
                    state.rendezvous_slot = Some(v);
                    self.not_empty.notify_one();
                    // wait for the receiver to actually take it
                    while state.rendezvous_slot.is_some() && !state.closed {
                        self.not_full.wait(&mut state);
                    }
                    return Ok(());
                }
                self.not_full.wait(&mut state);
            }
        }
    }

    /// Blocking receive. On an unbuffered channel, counts this call in
    /// `waiting_receivers` for the whole time it's parked with nothing to
    /// take, so `try_send` can recognize a genuine rendezvous-ready moment.
    pub fn recv(&self) -> Result<Value, RecvError> {
        let mut state = self.state.lock();
        if !self.is_buffered() {
            state.waiting_receivers += 1;
        }
        let result = loop {
            if self.is_buffered() {
                if let Some(v) = state.buffer.pop_front() {
                    self.not_full.notify_one();
                    break Ok(v);
                }
            } else if let Some(v) = state.rendezvous_slot.take() {
                self.not_full.notify_all();
                break Ok(v);
            }
            if state.closed {
                break Err(RecvError::Closed);
            }
            self.not_empty.wait(&mut state);
        };
        if !self.is_buffered() {
            state.waiting_receivers -= 1;
        }
        result
    }

    pub fn try_send(&self, merge_threshold: usize, mut v: Value) -> Result<bool, SendError> {
        if self.is_buffered() {
            v = omni_store_repair(v, &self.holder_region, merge_threshold);
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(SendError::Closed);
        }
        if self.is_buffered() {
            if state.buffer.len() < self.capacity {
                state.buffer.push_back(v);
                self.not_empty.notify_one();
                return Ok(true);
            }
        } else if state.rendezvous_slot.is_none() && state.waiting_receivers > 0 {
            // A receiver is already parked in recv() with nothing to take;
            // handing the value off now is what a blocking send would do
            // too, just without waiting around for the receiver to wake up
            // and actually claim it.
            state.rendezvous_slot = Some(v);
            self.not_empty.notify_one();
            return Ok(true);
        }
        Ok(false)
    }

    pub fn try_recv(&self) -> Result<Option<Value>, RecvError> {
        let mut state = self.state.lock();
        if self.is_buffered() {
            if let Some(v) = state.buffer.pop_front() {
                self.not_full.notify_one();
                return Ok(Some(v));
            }
        } else if let Some(v) = state.rendezvous_slot.take() {
            self.not_full.notify_all();
            return Ok(Some(v));
        }
        if state.closed {
            return Err(RecvError::Closed);
        }
        Ok(None)
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        trace!("channel closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// One arm of a `select`.
pub enum SelectCase<'a> {
    Send(&'a ChannelInner, Value),
    Recv(&'a ChannelInner),
}

pub enum SelectResult {
    Sent(usize),
    Received(usize, Value),
    Default,
}

/// Poll each case in order and take the first one that doesn't block,
/// spinning with a short yield between sweeps otherwise. `default_case`,
/// when `true`, makes `select` return `SelectResult::Default` immediately
/// if no case is ready on the first sweep (spec.md §4.7's non-blocking
/// `select`).
pub fn fiber_select(merge_threshold: usize, cases: &[SelectCase], default_case: bool) -> SelectResult {
    let attempted = AtomicBool::new(false);
    loop {
        for (i, case) in cases.iter().enumerate() {
            match case {
                SelectCase::Send(chan, v) => {
                    if let Ok(true) = chan.try_send(merge_threshold, *v) {
                        return SelectResult::Sent(i);
                    }
                }
                SelectCase::Recv(chan) => {
                    if let Ok(Some(v)) = chan.try_recv() {
                        return SelectResult::Received(i, v);
                    }
                }
            }
        }
        if default_case {
            return SelectResult::Default;
        }
        attempted.store(true, Ordering::Relaxed);
        crate::fiber::fiber_yield();
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::region_create;
    use crate::value::mk_int;

    #[test]
    fn buffered_send_recv_roundtrip() {
        let r = region_create();
        let chan = make_channel(2, &r);
        chan.send(64, mk_int(1)).unwrap();
        chan.send(64, mk_int(2)).unwrap();
        assert_eq!(crate::value::obj_to_int_immediate(chan.recv().unwrap()), Some(1));
        assert_eq!(crate::value::obj_to_int_immediate(chan.recv().unwrap()), Some(2));
    }

    #[test]
    fn closed_channel_rejects_send_and_drains_then_errors() {
        let r = region_create();
        let chan = make_channel(1, &r);
        chan.send(64, mk_int(5)).unwrap();
        chan.close();
        assert_eq!(chan.send(64, mk_int(6)), Err(SendError::Closed));
        assert_eq!(crate::value::obj_to_int_immediate(chan.recv().unwrap()), Some(5));
        assert_eq!(chan.recv(), Err(RecvError::Closed));
    }

    #[test]
    fn unbuffered_rendezvous_hands_off_directly() {
        let r = region_create();
        let chan = std::sync::Arc::new(make_channel(0, &r));
        let chan2 = chan.clone();
        let t = std::thread::spawn(move || chan2.recv().unwrap());
        chan.send(64, mk_int(99)).unwrap();
        let v = t.join().unwrap();
        assert_eq!(crate::value::obj_to_int_immediate(v), Some(99));
    }

    #[test]
    fn try_send_on_unbuffered_channel_with_no_receiver_returns_false() {
        let r = region_create();
        let chan = make_channel(0, &r);
        assert_eq!(chan.try_send(64, mk_int(1)), Ok(false));
    }

    #[test]
    fn try_send_succeeds_when_receiver_is_already_parked() {
        let r = region_create();
        let chan = std::sync::Arc::new(make_channel(0, &r));
        let chan2 = chan.clone();
        let t = std::thread::spawn(move || chan2.recv().unwrap());
        loop {
            if chan.state.lock().waiting_receivers > 0 {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(chan.try_send(64, mk_int(42)), Ok(true));
        let v = t.join().unwrap();
        assert_eq!(crate::value::obj_to_int_immediate(v), Some(42));
    }

    #[test]
    fn try_recv_on_empty_buffered_channel_returns_none() {
        let r = region_create();
        let chan = make_channel(1, &r);
        assert_eq!(chan.try_recv().unwrap(), None);
    }

    #[test]
    fn select_with_default_returns_default_when_nothing_ready() {
        let r = region_create();
        let chan = make_channel(1, &r);
        let result = fiber_select(64, &[SelectCase::Recv(&chan)], true);
        assert!(matches!(result, SelectResult::Default));
    }

    #[test]
    fn select_picks_ready_recv_case() {
        let r = region_create();
        let chan = make_channel(1, &r);
        chan.send(64, mk_int(7)).unwrap();
        let result = fiber_select(64, &[SelectCase::Recv(&chan)], true);
        match result {
            SelectResult::Received(0, v) => assert_eq!(crate::value::obj_to_int_immediate(v), Some(7)),
            _ => panic!("expected Received"),
        }
    }

    proptest::proptest! {
        // L1: send(v); recv() returns v back, for any sequence of integers
        // pushed through a buffered channel large enough to hold them all.
        #[test]
        fn l1_send_recv_round_trips_any_sequence(values in proptest::collection::vec(-1000i64..1000, 0..32)) {
            let r = region_create();
            let chan = make_channel(values.len().max(1), &r);
            for n in &values {
                chan.send(64, mk_int(*n)).unwrap();
            }
            for n in &values {
                let got = chan.recv().unwrap();
                assert_eq!(crate::value::obj_to_int_immediate(got), Some(*n));
            }
        }

        // I2: closing a channel any number of times is equivalent to once.
        #[test]
        fn i2_close_is_idempotent(n_closes in 1u32..8) {
            let r = region_create();
            let chan = make_channel(1, &r);
            for _ in 0..n_closes {
                chan.close();
            }
            assert!(chan.is_closed());
            assert_eq!(chan.send(64, mk_int(1)), Err(SendError::Closed));
        }
    }
}
