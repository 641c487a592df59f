use std::{
    collections::{HashMap, VecDeque},
    sync::{Condvar, Mutex},
};

use buddyfs_proto::{Command, Frame};
use buddyfs_timing::{Duration, Instant};

/// One outstanding request: the command the caller is waiting on, the
/// responses collected so far, and the absolute deadline past which
/// `reap_expired` wakes the waiter with nothing (§4.3).
struct Waiter {
    expected: Command,
    responses: VecDeque<Frame>,
    deadline: Instant,
    consumed: bool,
}

/// Correlates outbound requests with their responses by request id.
///
/// Mirrors the original's static `NetworkRequest` map plus a `_Delete`
/// vector: entries aren't dropped the instant a waiter wakes, because
/// another thread may still be mid-`wait` on the same condvar. Expired or
/// already-consumed waiters move to a pending-delete list and are only
/// freed on the *next* `reap_expired` pass, giving any racing waker a safe
/// window to finish using them (§9).
pub struct RequestRegistry {
    inner: Mutex<Inner>,
    cv: Condvar,
}

struct Inner {
    waiters: HashMap<u32, Waiter>,
    pending_delete: Vec<u32>,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner { waiters: HashMap::new(), pending_delete: Vec::new() }),
            cv: Condvar::new(),
        }
    }
}

impl RequestRegistry {
    /// Registers a new wait for `reqid`, replacing any existing entry for
    /// that id (matches the original; callers are responsible for not
    /// reusing an id within a live deadline window — Open Question 5).
    pub fn register(&self, reqid: u32, expected: Command, timeout: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.waiters.insert(
            reqid,
            Waiter {
                expected,
                responses: VecDeque::new(),
                deadline: Instant::now() + timeout,
                consumed: false,
            },
        );
    }

    /// Called from the reactor's receive path before cliques run. Pushes
    /// `frame` onto the matching waiter and wakes anyone blocked on it.
    /// Returns `true` if a waiter was found for this id and command.
    pub fn offer(&self, frame: Frame) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(waiter) = inner.waiters.get_mut(&frame.reqid) else { return false };
        if waiter.expected != frame.cmd {
            return false;
        }
        waiter.responses.push_back(frame);
        self.cv.notify_all();
        true
    }

    /// Blocks until a response for `reqid` arrives or the deadline passes.
    /// Returns the responses collected (possibly empty on timeout).
    pub fn wait_for_response(&self, reqid: u32) -> Vec<Frame> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let Some(waiter) = inner.waiters.get(&reqid) else { return Vec::new() };
            if !waiter.responses.is_empty() {
                break;
            }
            let remaining = waiter.deadline.saturating_sub(Instant::now());
            if remaining == Duration::ZERO {
                break;
            }
            let (guard, _timeout) =
                self.cv.wait_timeout(inner, remaining.into()).unwrap();
            inner = guard;
        }
        match inner.waiters.get_mut(&reqid) {
            Some(waiter) => {
                waiter.consumed = true;
                waiter.responses.drain(..).collect()
            }
            None => Vec::new(),
        }
    }

    /// Moves timed-out or already-consumed waiters to the pending-delete
    /// list, wakes them with nothing, and frees the *previous* pass's
    /// pending-delete entries (§9's two-phase teardown).
    pub fn reap_expired(&self) {
        let mut inner = self.inner.lock().unwrap();
        for id in inner.pending_delete.drain(..).collect::<Vec<_>>() {
            inner.waiters.remove(&id);
        }

        let now = Instant::now();
        let expired: Vec<u32> = inner
            .waiters
            .iter()
            .filter(|(_, w)| w.consumed || w.deadline.elapsed_since(now) == Duration::ZERO)
            .map(|(id, _)| *id)
            .collect();

        if expired.is_empty() {
            return;
        }
        inner.pending_delete.extend(&expired);
        drop(inner);
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn offer_wakes_a_waiting_caller() {
        let registry = Arc::new(RequestRegistry::default());
        registry.register(7, Command::Pong, Duration::from_secs(5));

        let r2 = registry.clone();
        let handle = thread::spawn(move || r2.wait_for_response(7));

        thread::sleep(std::time::Duration::from_millis(20));
        let frame = Frame::new(Command::Pong, 7);
        assert!(registry.offer(frame.clone()));

        let got = handle.join().unwrap();
        assert_eq!(got, vec![frame]);
    }

    #[test]
    fn mismatched_command_is_ignored() {
        let registry = RequestRegistry::default();
        registry.register(1, Command::Pong, Duration::from_secs(1));
        assert!(!registry.offer(Frame::new(Command::Ping, 1)));
    }

    #[test]
    fn wait_times_out_with_no_response() {
        let registry = RequestRegistry::default();
        registry.register(9, Command::Pong, Duration::from_millis(10));
        let got = registry.wait_for_response(9);
        assert!(got.is_empty());
    }

    #[test]
    fn reap_expired_frees_previous_passes_entries() {
        let registry = RequestRegistry::default();
        registry.register(3, Command::Pong, Duration::ZERO);
        registry.reap_expired();
        {
            let inner = registry.inner.lock().unwrap();
            assert!(inner.waiters.contains_key(&3));
            assert!(inner.pending_delete.contains(&3));
        }
        registry.reap_expired();
        let inner = registry.inner.lock().unwrap();
        assert!(!inner.waiters.contains_key(&3));
    }

    #[test]
    fn register_clobbers_existing_waiter_for_same_id() {
        let registry = RequestRegistry::default();
        registry.register(5, Command::Pong, Duration::from_secs(5));
        registry.offer(Frame::new(Command::Pong, 5));
        registry.register(5, Command::Pong, Duration::from_secs(5));
        assert!(registry.wait_for_response(5).is_empty());
    }
}
