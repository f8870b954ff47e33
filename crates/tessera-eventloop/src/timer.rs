//! timerfd-backed periodic timers.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};

use rustix::time::{
    timerfd_create, timerfd_settime, Itimerspec, TimerfdClockId, TimerfdFlags, TimerfdTimerFlags,
    Timespec,
};

use crate::LoopError;

/// Owns the timerfd backing a periodic timer. Dropping it closes the fd;
/// remove the associated [`crate::EventSource`] first.
#[derive(Debug)]
pub struct TimerSource {
    fd: OwnedFd,
}

impl TimerSource {
    pub(crate) fn new(period_ms: u32) -> Result<TimerSource, LoopError> {
        let fd = timerfd_create(
            TimerfdClockId::Monotonic,
            TimerfdFlags::NONBLOCK | TimerfdFlags::CLOEXEC,
        )?;

        let period = Timespec {
            tv_sec: i64::from(period_ms / 1000),
            tv_nsec: i64::from(period_ms % 1000) * 1_000_000,
        };
        let spec = Itimerspec {
            it_interval: period,
            // First expiration after one full period.
            it_value: period,
        };
        timerfd_settime(&fd, TimerfdTimerFlags::empty(), &spec)?;
        Ok(TimerSource { fd })
    }

    /// Reprogram the period without recreating the fd.
    pub fn set_period_ms(&self, period_ms: u32) -> Result<(), LoopError> {
        let period = Timespec {
            tv_sec: i64::from(period_ms / 1000),
            tv_nsec: i64::from(period_ms % 1000) * 1_000_000,
        };
        let spec = Itimerspec {
            it_interval: period,
            it_value: period,
        };
        timerfd_settime(&self.fd, TimerfdTimerFlags::empty(), &spec)?;
        Ok(())
    }
}

impl AsFd for TimerSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Drain the expiration counter, collapsing missed ticks. Returns the
/// number of elapsed periods (0 when nothing was pending).
pub(crate) fn drain(fd: RawFd) -> u64 {
    let mut buf = [0u8; 8];
    // SAFETY: fd is the timerfd registered by add_timer and still open.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    loop {
        match rustix::io::read(borrowed, &mut buf) {
            Ok(8) => return u64::from_ne_bytes(buf),
            Ok(_) => return 0,
            Err(rustix::io::Errno::INTR) => continue,
            Err(_) => return 0,
        }
    }
}
