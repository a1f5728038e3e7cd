// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Safe abstractions for synchronization primitives.

use mcast_api::SessionHdl;
use std::sync::Condvar;
use std::sync::Mutex;

/// A device gate keyed by session handle.
///
/// Serializes mutating operations against one device: a session must
/// enter the gate before touching the device's shadow state or
/// hardware, and other sessions block until it exits. Entry is
/// reentrant for the holding session, so a batch can span many calls
/// without re-acquiring.
///
/// The gate is deliberately not a `Mutex<Device>`: the hold spans
/// whole operations (or whole batches), not individual data accesses,
/// and the owner is a session, not a thread.
pub struct SessionGate {
    owner: Mutex<Option<(SessionHdl, u32)>>,
    cv: Condvar,
}

impl SessionGate {
    pub fn new() -> Self {
        Self { owner: Mutex::new(None), cv: Condvar::new() }
    }

    /// Enter the gate as `sess`, blocking while another session holds
    /// it.
    pub fn enter(&self, sess: SessionHdl) {
        let mut owner = self.owner.lock().unwrap();
        loop {
            match *owner {
                None => {
                    *owner = Some((sess, 1));
                    return;
                }
                Some((holder, ref mut depth)) if holder == sess => {
                    *depth += 1;
                    return;
                }
                Some(_) => {
                    owner = self.cv.wait(owner).unwrap();
                }
            }
        }
    }

    /// Exit the gate. Panics if `sess` is not the holder; that is
    /// always a caller bug.
    pub fn exit(&self, sess: SessionHdl) {
        let mut owner = self.owner.lock().unwrap();
        match *owner {
            Some((holder, ref mut depth)) if holder == sess => {
                *depth -= 1;
                if *depth == 0 {
                    *owner = None;
                    self.cv.notify_one();
                }
            }
            _ => panic!("gate exit by non-holder {:?}", sess),
        }
    }

    pub fn holder(&self) -> Option<SessionHdl> {
        self.owner.lock().unwrap().map(|(h, _)| h)
    }
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reentrant_for_holder() {
        let gate = SessionGate::new();
        let s = SessionHdl(1);
        gate.enter(s);
        gate.enter(s);
        gate.exit(s);
        assert_eq!(gate.holder(), Some(s));
        gate.exit(s);
        assert_eq!(gate.holder(), None);
    }

    #[test]
    fn excludes_other_sessions() {
        let gate = Arc::new(SessionGate::new());
        let a = SessionHdl(1);
        let b = SessionHdl(2);

        gate.enter(a);
        let gate2 = Arc::clone(&gate);
        let waiter = thread::spawn(move || {
            gate2.enter(b);
            gate2.exit(b);
        });
        // The waiter cannot enter until we exit.
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(gate.holder(), Some(a));
        gate.exit(a);
        waiter.join().unwrap();
        assert_eq!(gate.holder(), None);
    }
}
