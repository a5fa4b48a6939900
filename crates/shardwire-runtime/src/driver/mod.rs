//! Event loop drivers.
//!
//! - [`PortableLoop`]: mutex + condvar, any OS
//! - `EpollLoop`: epoll + eventfd, Linux only

mod portable;

pub use portable::PortableLoop;

use std::io;

use shardwire_core::EventLoop;

use crate::config::DriverKind;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub use epoll::EpollLoop;

        fn platform_loop() -> io::Result<Box<dyn EventLoop>> {
            Ok(Box::new(EpollLoop::new()?))
        }
    } else {
        fn platform_loop() -> io::Result<Box<dyn EventLoop>> {
            Ok(Box::new(PortableLoop::new()))
        }
    }
}

/// Build the loop for `kind`. Called on the shard thread.
pub fn create_loop(kind: DriverKind) -> io::Result<Box<dyn EventLoop>> {
    match kind {
        DriverKind::Platform => platform_loop(),
        DriverKind::Portable => Ok(Box::new(PortableLoop::new())),
    }
}

/// Time left until `deadline`, rounded up to whole milliseconds.
pub(crate) fn millis_until(deadline: std::time::Instant) -> i32 {
    let left = deadline.saturating_duration_since(std::time::Instant::now());
    let ms = left.as_micros().div_ceil(1000);
    ms.min(i32::MAX as u128) as i32
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use shardwire_core::{LoopControl, LoopHandler};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Stops after `wakes` wakes; counts heartbeats.
    pub(crate) struct Counting {
        pub wakes: Arc<AtomicUsize>,
        pub beats: Arc<AtomicUsize>,
        pub stop_after_wakes: usize,
        pub stop_after_beats: usize,
    }

    impl LoopHandler for Counting {
        fn on_wake(&mut self) -> LoopControl {
            let n = self.wakes.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.stop_after_wakes {
                LoopControl::Stop
            } else {
                LoopControl::Continue
            }
        }

        fn on_heartbeat(&mut self) -> LoopControl {
            let n = self.beats.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.stop_after_beats {
                LoopControl::Stop
            } else {
                LoopControl::Continue
            }
        }
    }

    /// Shared driver contract checks.
    pub(crate) fn exercise(mut event_loop: Box<dyn EventLoop>) {
        // Wake from another thread ends the loop on the second on_wake.
        let wakes = Arc::new(AtomicUsize::new(0));
        let beats = Arc::new(AtomicUsize::new(0));
        let waker = event_loop.waker();
        let mut handler = Counting {
            wakes: Arc::clone(&wakes),
            beats: Arc::clone(&beats),
            stop_after_wakes: 2,
            stop_after_beats: usize::MAX,
        };
        let poke = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
            waker.wake().unwrap();
        });
        event_loop.run(Duration::from_secs(30), &mut handler).unwrap();
        poke.join().unwrap();
        assert_eq!(wakes.load(Ordering::SeqCst), 2);

        // Heartbeats fire on schedule without any wake.
        let started = Instant::now();
        let mut handler = Counting {
            wakes: Arc::new(AtomicUsize::new(0)),
            beats: Arc::clone(&beats),
            stop_after_wakes: usize::MAX,
            stop_after_beats: 3,
        };
        event_loop.run(Duration::from_millis(10), &mut handler).unwrap();
        assert_eq!(beats.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_millis_until_rounds_up() {
        let deadline = Instant::now() + Duration::from_micros(1500);
        let ms = millis_until(deadline);
        assert!((1..=2).contains(&ms));
        assert_eq!(millis_until(Instant::now() - Duration::from_secs(1)), 0);
    }

    #[test]
    fn test_platform_loop_contract() {
        exercise(create_loop(DriverKind::Platform).unwrap());
    }

    #[test]
    fn test_portable_loop_contract() {
        exercise(create_loop(DriverKind::Portable).unwrap());
    }
}
