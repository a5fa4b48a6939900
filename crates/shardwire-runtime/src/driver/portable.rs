//! Portable event loop built on a mutex + condvar.
//!
//! Wakes set a flag and notify; the loop sleeps on the condvar until the
//! flag is set or the next heartbeat is due.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use shardwire_core::{EventLoop, LoopControl, LoopHandler, LoopWaker};

struct WakeSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl LoopWaker for WakeSignal {
    fn wake(&self) -> io::Result<()> {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
        Ok(())
    }
}

pub struct PortableLoop {
    signal: Arc<WakeSignal>,
}

impl PortableLoop {
    pub fn new() -> Self {
        Self {
            signal: Arc::new(WakeSignal {
                pending: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    /// Sleep until woken or `deadline`. Returns whether a wake was pending.
    fn wait(&self, deadline: Instant) -> bool {
        let mut pending = self.signal.pending.lock();
        if !*pending {
            self.signal.cond.wait_until(&mut pending, deadline);
        }
        std::mem::replace(&mut *pending, false)
    }
}

impl Default for PortableLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop for PortableLoop {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn waker(&self) -> Arc<dyn LoopWaker> {
        self.signal.clone()
    }

    fn run(&mut self, heartbeat: Duration, handler: &mut dyn LoopHandler) -> io::Result<()> {
        if handler.on_wake() == LoopControl::Stop {
            return Ok(());
        }

        let mut next_beat = Instant::now() + heartbeat;
        loop {
            if Instant::now() >= next_beat {
                next_beat = Instant::now() + heartbeat;
                if handler.on_heartbeat() == LoopControl::Stop {
                    return Ok(());
                }
                continue;
            }
            if self.wait(next_beat) && handler.on_wake() == LoopControl::Stop {
                return Ok(());
            }
        }
    }
}
