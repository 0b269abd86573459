// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Public queue type: ties the allocator, the pending queue, the wakeup
// semaphore and the tick source together behind one `Arc<Inner<C>>`, the
// same shape used elsewhere in this codebase for a handle that must stay
// valid even if the value wrapping it is moved (raw pointers taken into the
// allocator's region must keep pointing at something stable).

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::arena::Arena;
use crate::clock::{Clock, SystemClock};
use crate::handle::{incid, npw2, Handle};
use crate::header::{tick_diff, Header, RawCallback, ONE_SHOT};
use crate::pending::PendingQueue;
use crate::sync::Semaphore;

struct QueueLockState {
    pending: PendingQueue,
    breaks: u32,
}

struct Inner<C: Clock> {
    arena: Arena,
    queuelock: Mutex<QueueLockState>,
    sem: Semaphore,
    clock: C,
    npw2: u32,
    dispatching: AtomicBool,
}

/// A bounded, single-process event queue: allocate a slot, fill in its
/// payload, and post it for one-shot or periodic dispatch at a caller-chosen
/// tick. Cheap to clone — every clone shares the same backing region and
/// pending queue.
pub struct Queue<C: Clock = SystemClock> {
    inner: Arc<Inner<C>>,
}

impl<C: Clock> Clone for Queue<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Queue<SystemClock> {
    /// Create a queue backed by a freshly allocated region of `capacity`
    /// bytes, ticking off the system clock.
    pub fn create(capacity: usize) -> io::Result<Self> {
        Self::with_clock(capacity, SystemClock::new())
    }

    /// Create a queue that takes ownership of a caller-provided region
    /// instead of allocating its own, for callers that already manage their
    /// memory budget (e.g. a static buffer on an embedded target).
    pub fn create_inplace(region: Box<[u8]>) -> io::Result<Self> {
        Self::with_clock_inplace(region, SystemClock::new())
    }
}

impl<C: Clock> Queue<C> {
    /// Like [`Queue::create`], but driven by an arbitrary [`Clock`]
    /// implementation instead of the system clock.
    pub fn with_clock(capacity: usize, clock: C) -> io::Result<Self> {
        if capacity == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "capacity must be nonzero"));
        }
        Self::with_clock_inplace(vec![0u8; capacity].into_boxed_slice(), clock)
    }

    /// Like [`Queue::create_inplace`], but driven by an arbitrary [`Clock`].
    pub fn with_clock_inplace(region: Box<[u8]>, clock: C) -> io::Result<Self> {
        if region.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "region must be nonzero length"));
        }
        let npw2 = npw2(region.len());
        debug!("equeue: queue created with {} byte region, npw2={npw2}", region.len());
        Ok(Self {
            inner: Arc::new(Inner {
                arena: Arena::new(region),
                queuelock: Mutex::new(QueueLockState { pending: PendingQueue::new(), breaks: 0 }),
                sem: Semaphore::new(),
                clock,
                npw2,
                dispatching: AtomicBool::new(false),
            }),
        })
    }

    /// Reserve a slot able to hold `payload_size` bytes. Returns `None` if
    /// the backing region has no chunk large enough and no more room to
    /// grow into. The returned builder must be posted or dropped; dropping
    /// it without posting returns the slot to the free index.
    pub fn alloc(&self, payload_size: usize) -> Option<Event<'_, C>> {
        let header = self.inner.arena.alloc(payload_size)?;
        Some(Event {
            queue: self,
            header,
            payload_size,
            delay_ms: 0,
            period_ms: None,
            cb: None,
            dtor: None,
            posted: false,
        })
    }

    /// `delay_ms < 0` means "do not post": the event is deallocated
    /// immediately and the returned handle is already stale (`cancel` on it
    /// is a no-op), mirroring a negative `header.target` read at post time.
    fn post_header(
        &self,
        header: NonNull<Header>,
        delay_ms: i64,
        period_ms: Option<u32>,
        cb: Option<RawCallback>,
        dtor: Option<RawCallback>,
    ) -> Handle {
        let inner = &self.inner;

        let gen = unsafe {
            let prev = header.as_ref().id.load(Ordering::Relaxed);
            let gen = incid(prev.unsigned_abs() as i32, inner.npw2);
            header.as_ref().id.store(gen, Ordering::Relaxed);
            gen
        };
        let handle = Handle::encode(gen, inner.arena.offset_of(header), inner.npw2);

        if delay_ms < 0 {
            unsafe {
                header.as_ref().dtor.store(Header::encode_callback(dtor), Ordering::Relaxed);
            }
            run_dtor(header);
            let bumped = incid(gen, inner.npw2);
            unsafe {
                header.as_ref().id.store(bumped, Ordering::Relaxed);
            }
            inner.arena.dealloc(header);
            trace!("equeue: post with negative delay, handle gen={gen} freed without enqueuing");
            return handle;
        }

        let now = inner.clock.now_ms();
        let target = now.wrapping_add(delay_ms as u32);
        let period = period_ms.map(|p| p as i32).unwrap_or(ONE_SHOT);
        unsafe {
            header.as_ref().period.store(period, Ordering::Relaxed);
            header.as_ref().cb.store(Header::encode_callback(cb), Ordering::Relaxed);
            header.as_ref().dtor.store(Header::encode_callback(dtor), Ordering::Relaxed);
        }

        let mut state = inner.queuelock.lock().unwrap();
        state.pending.enqueue(header, target);
        drop(state);
        inner.sem.signal();

        trace!("equeue: posted handle gen={gen} target={target}");
        handle
    }

    /// Cancel a pending or in-flight event. Returns `true` if the handle was
    /// still live (whether or not it was mid-dispatch); returns `false` for
    /// a stale handle (already one-shot-completed and freed, or reused by a
    /// later post).
    ///
    /// Cancelling an in-flight periodic event lets its current invocation
    /// finish but suppresses the next re-enqueue; it does not interrupt the
    /// callback already running.
    pub fn cancel(&self, handle: Handle) -> bool {
        let inner = &self.inner;
        let (gen, offset) = handle.decode(inner.npw2);
        if gen == 0 {
            return false;
        }
        let Some(header) = inner.arena.header_at_checked(offset) else {
            trace!("equeue: cancel on out-of-range handle offset={offset}");
            return false;
        };

        let mut state = inner.queuelock.lock().unwrap();
        let cur = unsafe { header.as_ref().id.load(Ordering::Acquire) };

        if cur == gen {
            state.pending.unqueue(header);
            let bumped = incid(gen, inner.npw2);
            unsafe {
                header.as_ref().id.store(bumped, Ordering::Release);
            }
            drop(state);
            run_dtor(header);
            inner.arena.dealloc(header);
            trace!("equeue: cancelled pending handle gen={gen}, bumped to {bumped}");
            true
        } else if cur == -gen {
            drop(state);
            unsafe {
                header.as_ref().cb.store(0, Ordering::Release);
                header.as_ref().period.store(ONE_SHOT, Ordering::Release);
            }
            trace!("equeue: cancelled in-flight handle gen={gen}, will not re-enqueue");
            true
        } else {
            trace!("equeue: cancel on stale handle gen={gen} (current {cur})");
            false
        }
    }

    /// Recover the handle for an event from its payload pointer, for a
    /// `RawCallback` that only receives `*mut u8` and needs to cancel (or
    /// otherwise refer to) its own event, e.g. a periodic callback that
    /// wants to stop its own future firings without capturing a `Handle`.
    ///
    /// # Safety
    /// `payload` must have been produced by this queue's allocator (via
    /// [`Queue::alloc`]) and must still be live — in practice, this means
    /// calling it only from within that event's own `cb`/`dtor`.
    pub unsafe fn handle_for_payload(&self, payload: *mut u8) -> Handle {
        let inner = &self.inner;
        let header = Header::from_payload(payload);
        let cur = header.as_ref().id.load(Ordering::Acquire);
        Handle::encode(cur.unsigned_abs() as i32, inner.arena.offset_of(header), inner.npw2)
    }

    /// Request that the nearest running (or next-started) [`dispatch`] call
    /// return once it has finished executing whatever is currently due.
    ///
    /// [`dispatch`]: Queue::dispatch
    pub fn break_(&self) {
        let mut state = self.inner.queuelock.lock().unwrap();
        state.breaks = state.breaks.saturating_add(1);
        drop(state);
        self.inner.sem.signal();
    }

    /// Run the dispatch loop: repeatedly wait for the next due event (or
    /// for [`Queue::break_`] to be called), mark due events in-flight,
    /// execute them, and re-enqueue periodic ones.
    ///
    /// `ms` is a relative budget for this call: `ms < 0` means "dispatch
    /// forever" (until broken); otherwise the loop returns once `ms`
    /// milliseconds have elapsed, independent of whether `break_` was ever
    /// called.
    ///
    /// Returns an error if another thread is already dispatching this
    /// queue; only one dispatcher may run at a time.
    pub fn dispatch(&self, ms: i64) -> io::Result<()> {
        let inner = &self.inner;
        if inner.dispatching.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "dispatch is already running on this queue",
            ));
        }
        let _guard = DispatchingGuard(inner);

        let deadline_abs = (ms >= 0).then(|| inner.clock.now_ms().wrapping_add(ms as u32));

        debug!("equeue: dispatch loop starting (ms={ms})");
        loop {
            {
                let mut state = inner.queuelock.lock().unwrap();
                if state.breaks > 0 {
                    state.breaks -= 1;
                    debug!("equeue: dispatch loop breaking");
                    return Ok(());
                }
            }

            let (_, next_deadline) = self.drain_and_execute();
            let now = inner.clock.now_ms();

            if let Some(deadline_abs) = deadline_abs {
                if tick_diff(now, deadline_abs) >= 0 {
                    debug!("equeue: dispatch loop exhausted its budget");
                    return Ok(());
                }
            }

            let mut timeout = next_deadline.map(|target| Duration::from_millis(tick_diff(target, now).max(0) as u64));
            if let Some(deadline_abs) = deadline_abs {
                let budget_left = Duration::from_millis(tick_diff(deadline_abs, now).max(0) as u64);
                timeout = Some(timeout.map_or(budget_left, |t| t.min(budget_left)));
            }
            inner.sem.wait(timeout);
        }
    }

    /// Fire every event currently due without blocking, then return the
    /// number fired. Useful for callers that drive dispatch from their own
    /// polling loop (or from tests using a
    /// [`VirtualClock`](crate::VirtualClock)) instead of dedicating a
    /// thread to [`Queue::dispatch`].
    pub fn poll(&self) -> usize {
        let mut fired = 0;
        loop {
            let (due_count, _next_deadline) = self.drain_and_execute();
            fired += due_count;
            if due_count == 0 {
                break;
            }
        }
        fired
    }

    /// Dequeue and execute every event due right now; returns how many
    /// fired and the next deadline, if any events remain pending.
    fn drain_and_execute(&self) -> (usize, Option<u32>) {
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let (due, next_deadline) = {
            let mut state = inner.queuelock.lock().unwrap();
            let (due, next_deadline) = state.pending.dequeue_due(now);
            // Mark in-flight while still holding the lock: a concurrent
            // `cancel` must see the negated generation as soon as the
            // event is no longer reachable through the pending queue, never
            // a window where it looks both dequeued and pending.
            for header in &due {
                let cur = unsafe { header.as_ref().id.load(Ordering::Acquire) };
                unsafe {
                    header.as_ref().id.store(-cur, Ordering::Release);
                }
            }
            (due, next_deadline)
        };

        let count = due.len();
        if count > 0 {
            trace!("equeue: dispatching {count} due event(s)");
        }
        for header in due {
            self.execute(header);
        }
        (count, next_deadline)
    }

    fn execute(&self, header: NonNull<Header>) {
        let inner = &self.inner;

        let cb_bits = unsafe { header.as_ref().cb.load(Ordering::Acquire) };
        if let Some(cb) = unsafe { Header::decode_callback(cb_bits) } {
            let payload = Header::payload_ptr(header);
            unsafe { cb(payload) };
        }

        let period = unsafe { header.as_ref().period.load(Ordering::Acquire) };
        if period == ONE_SHOT {
            // Advance generation before deallocating: a handle for this
            // completed (or cancelled-while-in-flight) event must become
            // stale, not continue to match `cancel`'s pending-branch check
            // against an already-reused or already-freed chunk.
            let cur = unsafe { header.as_ref().id.load(Ordering::Acquire) };
            let bumped = incid(cur.unsigned_abs() as i32, inner.npw2);
            unsafe {
                header.as_ref().id.store(bumped, Ordering::Release);
            }
            run_dtor(header);
            inner.arena.dealloc(header);
        } else {
            let cur = unsafe { header.as_ref().id.load(Ordering::Acquire) };
            if cur < 0 {
                unsafe {
                    header.as_ref().id.store(-cur, Ordering::Release);
                }
            }
            let now = inner.clock.now_ms();
            let target = now.wrapping_add(period as u32);
            {
                let mut state = inner.queuelock.lock().unwrap();
                state.pending.enqueue(header, target);
            }
            inner.sem.signal();
        }
    }

    /// Schedule `f` to run once, as soon as the dispatch loop next wakes.
    pub fn call<F>(&self, f: F) -> io::Result<Handle>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_closure(0, None, f)
    }

    /// Schedule `f` to run once, after `delay_ms` milliseconds.
    pub fn call_in<F>(&self, delay_ms: u32, f: F) -> io::Result<Handle>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_closure(delay_ms as i64, None, f)
    }

    /// Schedule `f` to run every `period_ms` milliseconds, starting after
    /// one period. The period is measured from each invocation's
    /// completion, so a slow callback pushes later firings back rather than
    /// bunching them up.
    pub fn call_every<F>(&self, period_ms: u32, f: F) -> io::Result<Handle>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_closure(period_ms as i64, Some(period_ms), f)
    }

    fn schedule_closure<F>(&self, delay_ms: i64, period_ms: Option<u32>, f: F) -> io::Result<Handle>
    where
        F: FnMut() + Send + 'static,
    {
        let boxed: Box<dyn FnMut() + Send> = Box::new(f);
        let size = std::mem::size_of_val(&boxed);

        let mut event = self.alloc(size).ok_or_else(|| {
            warn!("equeue: schedule_closure failed, region exhausted");
            io::Error::new(io::ErrorKind::OutOfMemory, "event queue region exhausted")
        })?;

        unsafe {
            std::ptr::write(event.payload_mut().as_mut_ptr() as *mut Box<dyn FnMut() + Send>, boxed);
        }

        event.delay_ms = delay_ms;
        event.period_ms = period_ms;
        event.cb = Some(invoke_boxed_closure);
        event.dtor = Some(drop_boxed_closure);

        Ok(event.post())
    }
}

impl<C: Clock> Drop for Inner<C> {
    fn drop(&mut self) {
        // Run destructors on whatever is still pending; the arena's backing
        // region is reclaimed right after by `Arena`'s own `Drop`, so there
        // is no need to run `dealloc` here too.
        let mut state = self.queuelock.lock().unwrap();
        let remaining = state.pending.drain_all();
        drop(state);
        for header in remaining {
            run_dtor(header);
        }
    }
}

struct DispatchingGuard<'a, C: Clock>(&'a Inner<C>);

impl<'a, C: Clock> Drop for DispatchingGuard<'a, C> {
    fn drop(&mut self) {
        self.0.dispatching.store(false, Ordering::Release);
    }
}

fn run_dtor(header: NonNull<Header>) {
    let dtor_bits = unsafe { header.as_ref().dtor.load(Ordering::Acquire) };
    if let Some(dtor) = unsafe { Header::decode_callback(dtor_bits) } {
        let payload = Header::payload_ptr(header);
        unsafe { dtor(payload) };
    }
}

/// # Safety
/// `payload` must point at a live `Box<dyn FnMut() + Send>` written by
/// `schedule_closure`.
unsafe fn invoke_boxed_closure(payload: *mut u8) {
    let closure = &mut *(payload as *mut Box<dyn FnMut() + Send>);
    (closure)();
}

/// # Safety
/// `payload` must point at a live `Box<dyn FnMut() + Send>` written by
/// `schedule_closure`, not yet dropped.
unsafe fn drop_boxed_closure(payload: *mut u8) {
    std::ptr::drop_in_place(payload as *mut Box<dyn FnMut() + Send>);
}

/// A reserved, not-yet-posted (or already-posted) event slot.
///
/// Obtained from [`Queue::alloc`]. Write payload bytes via
/// [`payload_mut`](Event::payload_mut), set delay/period/callbacks, then
/// call [`post`](Event::post). Dropping without posting frees the slot.
pub struct Event<'a, C: Clock> {
    queue: &'a Queue<C>,
    header: NonNull<Header>,
    payload_size: usize,
    delay_ms: i64,
    period_ms: Option<u32>,
    cb: Option<RawCallback>,
    dtor: Option<RawCallback>,
    posted: bool,
}

impl<'a, C: Clock> Event<'a, C> {
    /// The writable payload bytes reserved by `alloc`.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(Header::payload_ptr(self.header), self.payload_size) }
    }

    /// Fire this many milliseconds after `post` is called. Default `0`.
    ///
    /// A negative `delay_ms` means "do not post": `post` deallocates the
    /// slot immediately and returns a handle for which `cancel` is already
    /// a no-op.
    pub fn set_delay(mut self, delay_ms: i64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Re-fire every `period_ms` milliseconds instead of firing once.
    pub fn set_period(mut self, period_ms: u32) -> Self {
        self.period_ms = Some(period_ms);
        self
    }

    /// Callback invoked with the payload pointer when this event fires.
    pub fn set_callback(mut self, cb: RawCallback) -> Self {
        self.cb = Some(cb);
        self
    }

    /// Destructor invoked on the payload just before the slot is freed
    /// (after a one-shot fires, or on cancellation).
    pub fn set_dtor(mut self, dtor: RawCallback) -> Self {
        self.dtor = Some(dtor);
        self
    }

    /// Hand this event to the queue. Returns a handle usable with
    /// [`Queue::cancel`].
    pub fn post(mut self) -> Handle {
        self.posted = true;
        self.queue.post_header(self.header, self.delay_ms, self.period_ms, self.cb, self.dtor)
    }
}

impl<'a, C: Clock> Drop for Event<'a, C> {
    fn drop(&mut self) {
        if !self.posted {
            // `self.dtor` lives on the builder until `post_header` flushes it
            // to the header; a dropped-without-posting event must run it
            // from here instead of reading `header.dtor`, which still holds
            // whatever a previous occupant of this chunk left behind.
            if let Some(dtor) = self.dtor {
                let payload = Header::payload_ptr(self.header);
                unsafe { dtor(payload) };
            }
            self.queue.inner.arena.dealloc(self.header);
        }
    }
}
