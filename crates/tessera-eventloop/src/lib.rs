//! Single-threaded epoll reactor.
//!
//! Every RDP connection owns one [`EventLoop`] on its own thread. Sources
//! are registered with an interest mask and a callback; the callback runs
//! on the loop thread with the bits that were actually signalled. Sources
//! can be dumped with [`EventLoop::store_state`] and reinstalled on a
//! different loop with [`EventLoop::restore_source`] without losing the
//! fd identity, which is how an RDP socket migrates between runloops
//! during shadowing.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use rustix::event::epoll;

mod timer;

pub use timer::TimerSource;

/// Readiness bits tested by the loop and reported to callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0x01);
    pub const WRITE: Interest = Interest(0x02);
    pub const HANGUP: Interest = Interest(0x04);
    pub const ERROR: Interest = Interest(0x08);

    #[must_use]
    pub fn contains(self, other: Interest) -> bool {
        (self.0 & other.0) == other.0
    }

    #[must_use]
    pub fn intersects(self, other: Interest) -> bool {
        (self.0 & other.0) != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("epoll operation failed: {0}")]
    Epoll(#[from] rustix::io::Errno),
    #[error("event source is no longer registered")]
    StaleSource,
    #[error("invalid file descriptor")]
    BadFd,
}

/// Callback invoked when a source becomes ready. Receives the loop so it
/// can change masks, reschedule or remove sources while dispatching.
pub type SourceCallback = Box<dyn FnMut(&mut EventLoop, Interest, RawFd) + Send>;

/// Handle to a registered source. Cloning is intentionally not provided;
/// the owner of the handle controls the source's lifetime.
#[derive(Debug)]
pub struct EventSource {
    slot: usize,
    generation: u64,
}

/// A dumped source, ready to be reinstalled on another loop. Keeps the fd
/// identity; the fd itself stays open and owned by the caller.
pub struct SourceState {
    fd: RawFd,
    mask: Interest,
    callback: SourceCallback,
}

impl SourceState {
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[must_use]
    pub fn mask(&self) -> Interest {
        self.mask
    }
}

impl std::fmt::Debug for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceState")
            .field("fd", &self.fd)
            .field("mask", &self.mask)
            .finish_non_exhaustive()
    }
}

struct Slot {
    fd: RawFd,
    mask: Interest,
    generation: u64,
    marked_for_remove: bool,
    reschedule_mask: Interest,
    /// Taken out while the callback runs so dispatch can hand the loop
    /// to it mutably.
    callback: Option<SourceCallback>,
    is_timer: bool,
}

/// The reactor. One per runloop thread.
pub struct EventLoop {
    epoll: OwnedFd,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    next_generation: u64,
    rescheduled: VecDeque<usize>,
    /// Slots whose memory reclamation is deferred until after the current
    /// dispatch pass, so a callback may remove its own source.
    cleanups: Vec<usize>,
    dispatching: bool,
}

impl EventLoop {
    pub fn new() -> Result<EventLoop, LoopError> {
        let epoll = epoll::create(epoll::CreateFlags::CLOEXEC)?;
        Ok(EventLoop {
            epoll,
            slots: Vec::new(),
            free: Vec::new(),
            next_generation: 1,
            rescheduled: VecDeque::new(),
            cleanups: Vec::new(),
            dispatching: false,
        })
    }

    fn epoll_flags(mask: Interest) -> epoll::EventFlags {
        let mut flags = epoll::EventFlags::empty();
        if mask.contains(Interest::READ) {
            flags |= epoll::EventFlags::IN;
        }
        if mask.contains(Interest::WRITE) {
            flags |= epoll::EventFlags::OUT;
        }
        if mask.contains(Interest::ERROR) {
            flags |= epoll::EventFlags::ERR;
        }
        flags
    }

    fn alloc_slot(&mut self, slot: Slot) -> (usize, u64) {
        let generation = slot.generation;
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(slot);
            (idx, generation)
        } else {
            self.slots.push(Some(slot));
            (self.slots.len() - 1, generation)
        }
    }

    fn register(
        &mut self,
        fd: RawFd,
        mask: Interest,
        callback: SourceCallback,
        is_timer: bool,
    ) -> Result<EventSource, LoopError> {
        if fd < 0 {
            return Err(LoopError::BadFd);
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let (slot, generation) = self.alloc_slot(Slot {
            fd,
            mask,
            generation,
            marked_for_remove: false,
            reschedule_mask: Interest::NONE,
            callback: Some(callback),
            is_timer,
        });

        let data = epoll::EventData::new_u64(Self::pack(slot, generation));
        // SAFETY: the caller keeps fd open while the source is registered;
        // the loop never closes it.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = epoll::add(&self.epoll, borrowed, data, Self::epoll_flags(mask)) {
            self.slots[slot] = None;
            self.free.push(slot);
            return Err(LoopError::Epoll(e));
        }

        Ok(EventSource { slot, generation })
    }

    /// Register a raw file descriptor.
    pub fn add_fd(
        &mut self,
        fd: RawFd,
        mask: Interest,
        callback: SourceCallback,
    ) -> Result<EventSource, LoopError> {
        self.register(fd, mask, callback, false)
    }

    /// Register anything that exposes a pollable fd (pipes, eventfds,
    /// sockets). The handle is borrowed only for registration.
    pub fn add_handle(
        &mut self,
        handle: &impl AsFd,
        mask: Interest,
        callback: SourceCallback,
    ) -> Result<EventSource, LoopError> {
        self.register(handle.as_fd().as_raw_fd(), mask, callback, false)
    }

    /// Register a periodic timer firing every `period_ms`. Missed periods
    /// collapse: the callback runs at most once per dispatch pass.
    pub fn add_timer(
        &mut self,
        period_ms: u32,
        mut callback: impl FnMut(&mut EventLoop) + Send + 'static,
    ) -> Result<(EventSource, TimerSource), LoopError> {
        let timer = TimerSource::new(period_ms)?;
        let timer_fd = timer.as_fd().as_raw_fd();
        let source = self.register(
            timer_fd,
            Interest::READ,
            Box::new(move |evloop, mask, fd| {
                if !mask.contains(Interest::READ) {
                    return;
                }
                if timer::drain(fd) > 0 {
                    callback(evloop);
                }
            }),
            true,
        )?;
        Ok((source, timer))
    }

    fn pack(slot: usize, generation: u64) -> u64 {
        ((slot as u64) << 32) | (generation & 0xffff_ffff)
    }

    fn unpack(data: u64) -> (usize, u64) {
        ((data >> 32) as usize, data & 0xffff_ffff)
    }

    fn live_slot(&mut self, source: &EventSource) -> Result<&mut Slot, LoopError> {
        match self.slots.get_mut(source.slot) {
            Some(Some(slot))
                if slot.generation == source.generation && !slot.marked_for_remove =>
            {
                Ok(slot)
            }
            _ => Err(LoopError::StaleSource),
        }
    }

    /// Atomically change the tested bits of a source. O(1).
    pub fn change_mask(&mut self, source: &EventSource, new_mask: Interest) -> Result<(), LoopError> {
        let epfd = self.epoll.as_raw_fd();
        let slot = self.live_slot(source)?;
        if slot.mask == new_mask {
            return Ok(());
        }
        let data = epoll::EventData::new_u64(Self::pack(source.slot, slot.generation));
        // SAFETY: fd registered and still open per the add_fd contract.
        let borrowed = unsafe { BorrowedFd::borrow_raw(slot.fd) };
        let epoll = unsafe { BorrowedFd::borrow_raw(epfd) };
        epoll::modify(epoll, borrowed, data, Self::epoll_flags(new_mask))?;
        slot.mask = new_mask;
        Ok(())
    }

    /// Current mask of a source.
    pub fn mask(&self, source: &EventSource) -> Option<Interest> {
        match self.slots.get(source.slot) {
            Some(Some(slot)) if !slot.marked_for_remove => Some(slot.mask),
            _ => None,
        }
    }

    /// Fd of a source.
    pub fn fd(&self, source: &EventSource) -> Option<RawFd> {
        match self.slots.get(source.slot) {
            Some(Some(slot)) if !slot.marked_for_remove => Some(slot.fd),
            _ => None,
        }
    }

    /// Dump a source so it can be reinstalled on another loop with
    /// [`EventLoop::restore_source`]. The source is removed from this
    /// loop; the fd stays open.
    pub fn store_state(&mut self, mut source: EventSource) -> Result<SourceState, LoopError> {
        let slot = self.live_slot(&source)?;
        let fd = slot.fd;
        let mask = slot.mask;
        let callback = slot.callback.take().ok_or(LoopError::StaleSource)?;
        self.remove_source(&mut source);
        Ok(SourceState { fd, mask, callback })
    }

    /// Reinstall a previously stored source. Fires on the very first
    /// dispatch if the fd is already ready (level-triggered registration).
    pub fn restore_source(&mut self, state: SourceState) -> Result<EventSource, LoopError> {
        self.register(state.fd, state.mask, state.callback, false)
    }

    /// Mark a source as read-ready before the next dispatch, without any
    /// kernel involvement. Used when a component consumed an internal
    /// buffer and wants to re-enter its callback on the same tick.
    pub fn reschedule_for_read(&mut self, source: &EventSource) -> Result<(), LoopError> {
        self.reschedule(source, Interest::READ)
    }

    /// Same as [`EventLoop::reschedule_for_read`] for write readiness.
    pub fn reschedule_for_write(&mut self, source: &EventSource) -> Result<(), LoopError> {
        self.reschedule(source, Interest::WRITE)
    }

    fn reschedule(&mut self, source: &EventSource, bits: Interest) -> Result<(), LoopError> {
        let idx = source.slot;
        let slot = self.live_slot(source)?;
        let first = slot.reschedule_mask.is_empty();
        slot.reschedule_mask |= bits;
        if first {
            self.rescheduled.push_back(idx);
        }
        Ok(())
    }

    /// Remove a source: the handle is invalidated, the fd is deregistered
    /// from the kernel, and slot reclamation is deferred until after the
    /// current dispatch pass so the running callback stays safe.
    pub fn remove_source(&mut self, source: &mut EventSource) {
        let Some(Some(slot)) = self.slots.get_mut(source.slot) else {
            return;
        };
        if slot.generation != source.generation || slot.marked_for_remove {
            return;
        }
        slot.marked_for_remove = true;
        let fd = slot.fd;
        // SAFETY: still open; deregistration only.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = epoll::delete(&self.epoll, borrowed) {
            tracing::debug!(fd, error = %e, "epoll delete failed while removing source");
        }
        let idx = source.slot;
        source.generation = 0;
        if self.dispatching {
            self.cleanups.push(idx);
        } else {
            self.slots[idx] = None;
            self.free.push(idx);
        }
    }

    fn run_callback(&mut self, idx: usize, mask: Interest) {
        let (mut callback, fd) = {
            let Some(Some(slot)) = self.slots.get_mut(idx) else {
                return;
            };
            if slot.marked_for_remove {
                return;
            }
            let Some(cb) = slot.callback.take() else {
                return;
            };
            (cb, slot.fd)
        };

        callback(self, mask, fd);

        // The callback may have removed its own source (or store_state'd
        // it); only put the closure back if the slot is still live.
        if let Some(Some(slot)) = self.slots.get_mut(idx) {
            if slot.callback.is_none() {
                slot.callback = Some(callback);
            }
        }
    }

    fn treat_rescheduled(&mut self) {
        while let Some(idx) = self.rescheduled.pop_front() {
            let mask = {
                let Some(Some(slot)) = self.slots.get_mut(idx) else {
                    continue;
                };
                if slot.marked_for_remove {
                    continue;
                }
                std::mem::replace(&mut slot.reschedule_mask, Interest::NONE)
            };
            if !mask.is_empty() {
                self.run_callback(idx, mask);
            }
        }
    }

    fn treat_cleanups(&mut self) {
        while let Some(idx) = self.cleanups.pop() {
            self.slots[idx] = None;
            self.free.push(idx);
        }
    }

    /// Run one reactor pass: wait up to `timeout_ms`, invoke ready
    /// callbacks in arrival order, run rescheduled sources, then reclaim
    /// removed slots. Returns the number of callbacks invoked.
    pub fn dispatch(&mut self, timeout_ms: i32) -> Result<usize, LoopError> {
        let mut events = epoll::EventVec::with_capacity(64);
        loop {
            match epoll::wait(&self.epoll, &mut events, timeout_ms) {
                Ok(()) => break,
                Err(rustix::io::Errno::INTR) => continue,
                Err(e) => return Err(LoopError::Epoll(e)),
            }
        }

        self.dispatching = true;
        let mut invoked = 0;
        for event in events.iter() {
            let (idx, generation) = Self::unpack(event.data.u64());
            let flags = event.flags;

            let mask = {
                let Some(Some(slot)) = self.slots.get(idx) else {
                    continue;
                };
                if slot.marked_for_remove || slot.generation & 0xffff_ffff != generation {
                    continue;
                }
                let mut mask = Interest::NONE;
                if slot.mask.contains(Interest::READ) && flags.contains(epoll::EventFlags::IN) {
                    mask |= Interest::READ;
                }
                if slot.mask.contains(Interest::WRITE) && flags.contains(epoll::EventFlags::OUT) {
                    mask |= Interest::WRITE;
                }
                // ERR/HUP are reported by the kernel whether requested or
                // not; surface them as Hangup+Error so the owner notices.
                if flags.intersects(epoll::EventFlags::ERR | epoll::EventFlags::HUP) {
                    if slot.mask.contains(Interest::HANGUP) && flags.contains(epoll::EventFlags::HUP)
                    {
                        mask |= Interest::HANGUP;
                    }
                    if slot.mask.contains(Interest::ERROR) && flags.contains(epoll::EventFlags::ERR)
                    {
                        mask |= Interest::ERROR;
                    }
                    if mask.is_empty() && !slot.mask.intersects(Interest::HANGUP | Interest::ERROR)
                    {
                        mask = Interest::HANGUP | Interest::ERROR;
                    }
                }
                mask
            };

            if mask.is_empty() {
                continue;
            }
            self.run_callback(idx, mask);
            invoked += 1;
        }

        self.treat_rescheduled();
        self.dispatching = false;
        self.treat_cleanups();
        Ok(invoked)
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("sources", &(self.slots.len() - self.free.len()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::pipe::{pipe_with, PipeFlags};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn nonblocking_pipe() -> (OwnedFd, OwnedFd) {
        pipe_with(PipeFlags::NONBLOCK | PipeFlags::CLOEXEC).expect("pipe")
    }

    #[test]
    fn read_callback_fires() {
        let mut evloop = EventLoop::new().unwrap();
        let (rx, tx) = nonblocking_pipe();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);

        let _src = evloop
            .add_handle(
                &rx,
                Interest::READ,
                Box::new(move |_l, mask, fd| {
                    assert!(mask.contains(Interest::READ));
                    let mut buf = [0u8; 16];
                    rustix::io::read(unsafe { BorrowedFd::borrow_raw(fd) }, &mut buf).unwrap();
                    hits2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        rustix::io::write(&tx, b"x").unwrap();
        let n = evloop.dispatch(100).unwrap();
        assert_eq!(n, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Nothing pending: zero callbacks.
        let n = evloop.dispatch(0).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn mask_change_stops_delivery() {
        let mut evloop = EventLoop::new().unwrap();
        let (rx, tx) = nonblocking_pipe();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);

        let src = evloop
            .add_handle(
                &rx,
                Interest::READ,
                Box::new(move |_l, _mask, _fd| {
                    hits2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        evloop.change_mask(&src, Interest::NONE).unwrap();
        rustix::io::write(&tx, b"x").unwrap();
        evloop.dispatch(10).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        evloop.change_mask(&src, Interest::READ).unwrap();
        evloop.dispatch(10).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_during_callback_is_safe() {
        let mut evloop = EventLoop::new().unwrap();
        let (rx, tx) = nonblocking_pipe();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);

        let src = evloop
            .add_handle(
                &rx,
                Interest::READ,
                Box::new(move |_l, _mask, _fd| {
                    hits2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        // A second source whose callback removes the first one.
        let (rx2, tx2) = nonblocking_pipe();
        let mut victim = Some(src);
        let _src2 = evloop
            .add_handle(
                &rx2,
                Interest::READ,
                Box::new(move |l, _mask, fd| {
                    let mut buf = [0u8; 16];
                    let _ = rustix::io::read(unsafe { BorrowedFd::borrow_raw(fd) }, &mut buf);
                    if let Some(mut s) = victim.take() {
                        l.remove_source(&mut s);
                    }
                }),
            )
            .unwrap();

        rustix::io::write(&tx2, b"x").unwrap();
        evloop.dispatch(10).unwrap();

        // First source was removed: writing to its pipe does nothing.
        rustix::io::write(&tx, b"x").unwrap();
        evloop.dispatch(10).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reschedule_runs_same_pass() {
        let mut evloop = EventLoop::new().unwrap();
        let (rx, tx) = nonblocking_pipe();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);

        let src = evloop
            .add_handle(
                &rx,
                Interest::READ,
                Box::new(move |_l, _mask, fd| {
                    let mut buf = [0u8; 16];
                    let _ = rustix::io::read(unsafe { BorrowedFd::borrow_raw(fd) }, &mut buf);
                    hits2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        rustix::io::write(&tx, b"x").unwrap();
        evloop.reschedule_for_read(&src).unwrap();
        // One kernel-reported wakeup plus one rescheduled run, both in a
        // single dispatch pass.
        evloop.dispatch(10).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn store_restore_preserves_identity_and_fires_if_ready() {
        let mut loop_a = EventLoop::new().unwrap();
        let mut loop_b = EventLoop::new().unwrap();
        let (rx, tx) = nonblocking_pipe();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let raw = rx.as_fd().as_raw_fd();

        let src = loop_a
            .add_handle(
                &rx,
                Interest::READ,
                Box::new(move |_l, mask, fd| {
                    assert!(mask.contains(Interest::READ));
                    let mut buf = [0u8; 16];
                    let _ = rustix::io::read(unsafe { BorrowedFd::borrow_raw(fd) }, &mut buf);
                    hits2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        // Data arrives before the migration.
        rustix::io::write(&tx, b"x").unwrap();

        let state = loop_a.store_state(src).unwrap();
        assert_eq!(state.fd(), raw);
        assert_eq!(state.mask(), Interest::READ);

        let _src_b = loop_b.restore_source(state).unwrap();

        // The old loop no longer sees the fd.
        assert_eq!(loop_a.dispatch(0).unwrap(), 0);
        // The new loop fires on the very first dispatch.
        assert_eq!(loop_b.dispatch(100).unwrap(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timer_collapses_missed_ticks() {
        let mut evloop = EventLoop::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);

        let (_src, _timer) = evloop
            .add_timer(10, move |_l| {
                hits2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // Sleep well past several periods; all pending expirations must
        // collapse to a single invocation.
        std::thread::sleep(std::time::Duration::from_millis(55));
        evloop.dispatch(10).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
