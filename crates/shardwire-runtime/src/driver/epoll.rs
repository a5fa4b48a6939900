//! epoll + eventfd event loop (Linux).
//!
//! The eventfd is the wake primitive: `wake()` adds 1 to its counter,
//! the loop reads (and so resets) it when epoll reports it readable.
//! Several wakes before the read collapse into one `on_wake`.
//!
//! The eventfd is owned by the waker, not the loop, so a producer holding
//! the waker after the shard exits writes to a still-open descriptor.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use shardwire_core::{EventLoop, LoopControl, LoopHandler, LoopWaker};

use super::millis_until;

const WAKE_TOKEN: u64 = 1;

struct EventFdWaker {
    fd: RawFd,
}

impl EventFdWaker {
    fn create() -> io::Result<Self> {
        // Safety: plain syscall, no pointers.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Reset the counter. Returns whether a wake was pending.
    fn drain(&self) -> io::Result<bool> {
        let mut value: u64 = 0;
        // Safety: reads exactly 8 bytes into `value`.
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(value > 0)
    }
}

impl LoopWaker for EventFdWaker {
    fn wake(&self) -> io::Result<()> {
        let value: u64 = 1;
        // Safety: writes exactly 8 bytes from `value`.
        let ret = unsafe {
            libc::write(
                self.fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: a wake is already pending.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for EventFdWaker {
    fn drop(&mut self) {
        // Safety: we own the descriptor.
        unsafe { libc::close(self.fd) };
    }
}

pub struct EpollLoop {
    epfd: RawFd,
    waker: Arc<EventFdWaker>,
}

impl EpollLoop {
    pub fn new() -> io::Result<Self> {
        let waker = Arc::new(EventFdWaker::create()?);
        // Safety: plain syscall, no pointers.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let this = Self { epfd, waker };

        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        // Safety: both descriptors are open; `event` outlives the call.
        let ret = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, this.waker.fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(this)
    }
}

impl EventLoop for EpollLoop {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn waker(&self) -> Arc<dyn LoopWaker> {
        self.waker.clone()
    }

    fn run(&mut self, heartbeat: Duration, handler: &mut dyn LoopHandler) -> io::Result<()> {
        if handler.on_wake() == LoopControl::Stop {
            return Ok(());
        }

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
        let mut next_beat = Instant::now() + heartbeat;

        loop {
            if Instant::now() >= next_beat {
                next_beat = Instant::now() + heartbeat;
                if handler.on_heartbeat() == LoopControl::Stop {
                    return Ok(());
                }
                continue;
            }

            // Safety: `events` is a valid buffer of the given length.
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    millis_until(next_beat),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            // epoll_event is packed on x86_64; copy the field out.
            let woke = events[..n as usize].iter().any(|e| {
                let token = e.u64;
                token == WAKE_TOKEN
            });
            if woke {
                self.waker.drain()?;
                if handler.on_wake() == LoopControl::Stop {
                    return Ok(());
                }
            }
        }
    }
}

impl Drop for EpollLoop {
    fn drop(&mut self) {
        // Safety: we own the descriptor.
        unsafe { libc::close(self.epfd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wakes_coalesce() {
        let event_loop = EpollLoop::new().unwrap();
        let waker = event_loop.waker();
        for _ in 0..100 {
            waker.wake().unwrap();
        }
        assert!(event_loop.waker.drain().unwrap());
        assert!(!event_loop.waker.drain().unwrap());
    }

    #[test]
    fn test_waker_outlives_loop() {
        let event_loop = EpollLoop::new().unwrap();
        let waker = event_loop.waker();
        drop(event_loop);
        waker.wake().unwrap();
    }
}
