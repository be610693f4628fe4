//! A pool of one-shot software timers, multiplexed over a single hardware
//! tick source.
//!
//! Platforms without a native async time source drive [`SoftTimer::tick`]
//! from a 1 ms interrupt and use [`SoftTimer::wait`] futures for timeouts.
//! Timers have millisecond granularity and a maximum period of 65535 ms.
//!
//! Timer IDs are globally unique and statically partitioned into per-port,
//! per-subsystem banks, so concurrent policy-engine, Type-C and protocol
//! activity cannot collide. The [`TimerId`] constructors compute the bank
//! offsets in one place.
use core::cell::RefCell;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use critical_section::Mutex;

/// Capacity of the default timer pool.
pub const MAX_TIMERS: usize = 63;

/// A statically partitioned timer identifier.
///
/// Each port owns a 256-ID stride; within a port, IDs 0x00..0x0F belong to
/// the policy engine, 0x10..0x1F to the Type-C state machine, 0x20..0x2F to
/// the protocol layer, and 0x40 upwards to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerId(u16);

impl TimerId {
    const PORT_STRIDE: u16 = 0x100;
    const POLICY_ENGINE_BANK: u16 = 0x00;
    const TYPE_C_BANK: u16 = 0x10;
    const PROTOCOL_BANK: u16 = 0x20;
    const APPLICATION_BANK: u16 = 0x40;

    const fn in_bank(port: u8, bank: u16, index: u8) -> Self {
        Self((port as u16 + 1) * Self::PORT_STRIDE + bank + index as u16)
    }

    /// A policy-engine timer ID for the given port.
    pub const fn policy_engine(port: u8, index: u8) -> Self {
        assert!(index < 16);
        Self::in_bank(port, Self::POLICY_ENGINE_BANK, index)
    }

    /// A Type-C state machine timer ID for the given port.
    pub const fn type_c(port: u8, index: u8) -> Self {
        assert!(index < 16);
        Self::in_bank(port, Self::TYPE_C_BANK, index)
    }

    /// A protocol-layer timer ID for the given port.
    pub const fn protocol(port: u8, index: u8) -> Self {
        assert!(index < 16);
        Self::in_bank(port, Self::PROTOCOL_BANK, index)
    }

    /// An application timer ID for the given port.
    pub const fn application(port: u8, index: u8) -> Self {
        assert!(index < 0xC0);
        Self::in_bank(port, Self::APPLICATION_BANK, index)
    }

    /// The raw ID value.
    pub const fn raw(self) -> u16 {
        self.0
    }
}

#[derive(Debug)]
struct Slot {
    id: TimerId,
    remaining_ms: u16,
    expired: bool,
    waker: Option<Waker>,
}

struct Inner<const N: usize> {
    slots: [Option<Slot>; N],
}

impl<const N: usize> Inner<N> {
    const EMPTY: Option<Slot> = None;

    const fn new() -> Self {
        Self {
            slots: [Self::EMPTY; N],
        }
    }

    fn slot_of(&mut self, id: TimerId) -> Option<&mut Slot> {
        self.slots
            .iter_mut()
            .filter_map(Option::as_mut)
            .find(|slot| slot.id == id)
    }

    fn start(&mut self, id: TimerId, period_ms: u16) -> bool {
        if self.slot_of(id).is_some() {
            return false;
        }

        let Some(free) = self.slots.iter_mut().find(|slot| slot.is_none()) else {
            return false;
        };

        *free = Some(Slot {
            id,
            remaining_ms: period_ms,
            expired: period_ms == 0,
            waker: None,
        });
        true
    }

    fn stop(&mut self, id: TimerId) -> bool {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(active) if active.id == id) {
                *slot = None;
                return true;
            }
        }
        false
    }

    /// Credit `elapsed_ms` against every active slot, waking expired timers.
    ///
    /// Slots without a waker are freed on expiry. Slots with a waker stay
    /// allocated, flagged as expired, until their future consumes them.
    fn advance(&mut self, elapsed_ms: u16) {
        for slot in self.slots.iter_mut() {
            let Some(active) = slot else { continue };
            if active.expired {
                continue;
            }

            active.remaining_ms = active.remaining_ms.saturating_sub(elapsed_ms);
            if active.remaining_ms == 0 {
                active.expired = true;
                match active.waker.take() {
                    Some(waker) => waker.wake(),
                    None => *slot = None,
                }
            }
        }
    }
}

/// A pool of up to `N` concurrent one-shot timers.
pub struct SoftTimer<const N: usize = MAX_TIMERS> {
    inner: Mutex<RefCell<Inner<N>>>,
}

impl<const N: usize> Default for SoftTimer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SoftTimer<N> {
    /// Create an empty pool. Usable in statics.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner::new())),
        }
    }

    /// Start a timer.
    ///
    /// Returns `false` if no slot is free or a timer with this ID is already
    /// running. A running timer is never restarted implicitly; stop it first.
    pub fn start(&self, id: TimerId, period_ms: u16) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).start(id, period_ms))
    }

    /// Stop a timer. Returns whether it was running.
    pub fn stop(&self, id: TimerId) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).stop(id))
    }

    /// Stop every timer whose ID lies in `lo..=hi`.
    pub fn stop_range(&self, lo: TimerId, hi: TimerId) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            for slot in inner.slots.iter_mut() {
                if matches!(slot, Some(active) if active.id >= lo && active.id <= hi) {
                    *slot = None;
                }
            }
        })
    }

    /// Stop all timers.
    pub fn stop_all(&self) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            for slot in inner.slots.iter_mut() {
                *slot = None;
            }
        })
    }

    /// Whether a timer with this ID is running and not yet expired.
    pub fn is_running(&self, id: TimerId) -> bool {
        critical_section::with(|cs| {
            matches!(
                self.inner.borrow_ref_mut(cs).slot_of(id),
                Some(slot) if !slot.expired
            )
        })
    }

    /// Whether any timer with an ID in `lo..=hi` is running.
    pub fn any_running_in(&self, lo: TimerId, hi: TimerId) -> bool {
        critical_section::with(|cs| {
            self.inner
                .borrow_ref_mut(cs)
                .slots
                .iter()
                .flatten()
                .any(|slot| slot.id >= lo && slot.id <= hi && !slot.expired)
        })
    }

    /// Milliseconds until expiry, or `None` if the timer is not running.
    pub fn remaining(&self, id: TimerId) -> Option<u16> {
        critical_section::with(|cs| {
            self.inner
                .borrow_ref_mut(cs)
                .slot_of(id)
                .map(|slot| slot.remaining_ms)
        })
    }

    /// Number of active timers.
    pub fn active_count(&self) -> u8 {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).slots.iter().flatten().count() as u8)
    }

    /// Advance all timers by one millisecond. Call from the hardware tick.
    pub fn tick(&self) {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).advance(1))
    }

    /// Prepare for tickless sleep.
    ///
    /// Returns the shortest remaining period, which the platform programs as
    /// its wakeup, or `None` when no timer is active and the tick can stop
    /// entirely. Credit the actually slept time via [`Self::resume`].
    pub fn enter_sleep(&self) -> Option<u16> {
        critical_section::with(|cs| {
            self.inner
                .borrow_ref_mut(cs)
                .slots
                .iter()
                .flatten()
                .filter(|slot| !slot.expired)
                .map(|slot| slot.remaining_ms)
                .min()
        })
    }

    /// Credit time slept in tickless mode, dispatching expiries that fell due.
    pub fn resume(&self, elapsed_ms: u16) {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).advance(elapsed_ms))
    }

    /// Start a timer and wait for its expiry.
    ///
    /// If a timer with this ID is already running, the future resolves on
    /// that existing timer's expiry instead. Dropping the future stops the
    /// timer, so it is safe to use in `select` arms.
    pub fn wait(&self, id: TimerId, period_ms: u16) -> Wait<'_, N> {
        let started = self.start(id, period_ms);
        if !started && !self.is_running(id) {
            error!("soft timer pool exhausted, timeout {} fires immediately", id.raw());
        }

        Wait { pool: self, id }
    }
}

/// Future resolving on expiry of a soft timer. Created by [`SoftTimer::wait`].
pub struct Wait<'a, const N: usize> {
    pool: &'a SoftTimer<N>,
    id: TimerId,
}

impl<const N: usize> Future for Wait<'_, N> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        critical_section::with(|cs| {
            let mut inner = self.pool.inner.borrow_ref_mut(cs);
            match inner.slot_of(self.id) {
                None => Poll::Ready(()),
                Some(slot) if slot.expired => {
                    inner.stop(self.id);
                    Poll::Ready(())
                }
                Some(slot) => {
                    slot.waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
    }
}

impl<const N: usize> Drop for Wait<'_, N> {
    fn drop(&mut self) {
        self.pool.stop(self.id);
    }
}

#[cfg(test)]
mod tests {
    use core::future::Future;
    use core::pin::pin;
    use core::task::{Context, Poll, Waker};

    use super::{SoftTimer, TimerId};

    const ID: TimerId = TimerId::application(0, 0);
    const OTHER: TimerId = TimerId::application(0, 1);

    #[test]
    fn id_banks_are_disjoint_per_port() {
        assert_eq!(TimerId::policy_engine(0, 0).raw(), 0x100);
        assert_eq!(TimerId::policy_engine(0, 15).raw(), 0x10F);
        assert_eq!(TimerId::policy_engine(1, 0).raw(), 0x200);
        assert_eq!(TimerId::type_c(0, 0).raw(), 0x110);
        assert_eq!(TimerId::protocol(0, 0).raw(), 0x120);
        assert!(TimerId::application(0, 0).raw() > TimerId::protocol(0, 15).raw());
    }

    #[test]
    fn start_never_overwrites_a_running_timer() {
        let pool: SoftTimer<4> = SoftTimer::new();

        assert!(pool.start(ID, 10));
        assert!(!pool.start(ID, 99));
        assert_eq!(pool.remaining(ID), Some(10));
    }

    #[test]
    fn stop_then_start_yields_the_new_period() {
        let pool: SoftTimer<4> = SoftTimer::new();

        assert!(pool.start(ID, 10));
        for _ in 0..9 {
            pool.tick();
        }
        assert!(pool.stop(ID));
        assert!(pool.start(ID, 20));

        // No residual expiry from the first instance.
        pool.tick();
        assert!(pool.is_running(ID));
        assert_eq!(pool.remaining(ID), Some(19));
    }

    #[test]
    fn expiry_frees_the_slot() {
        let pool: SoftTimer<1> = SoftTimer::new();

        assert!(pool.start(ID, 2));
        assert!(!pool.start(OTHER, 1)); // Pool full.
        pool.tick();
        assert!(pool.is_running(ID));
        pool.tick();
        assert!(!pool.is_running(ID));
        assert_eq!(pool.active_count(), 0);
        assert!(pool.start(OTHER, 1));
    }

    #[test]
    fn range_operations() {
        let pool: SoftTimer<8> = SoftTimer::new();

        assert!(pool.start(TimerId::policy_engine(0, 1), 50));
        assert!(pool.start(TimerId::type_c(0, 2), 50));
        assert!(pool.start(TimerId::application(0, 3), 50));

        assert!(pool.any_running_in(TimerId::policy_engine(0, 0), TimerId::policy_engine(0, 15)));
        pool.stop_range(TimerId::policy_engine(0, 0), TimerId::policy_engine(0, 15));
        assert!(!pool.any_running_in(TimerId::policy_engine(0, 0), TimerId::policy_engine(0, 15)));
        assert_eq!(pool.active_count(), 2);

        pool.stop_all();
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn tickless_sleep_round_trip() {
        let pool: SoftTimer<4> = SoftTimer::new();

        assert!(pool.start(ID, 30));
        assert!(pool.start(OTHER, 12));

        assert_eq!(pool.enter_sleep(), Some(12));
        pool.resume(12);

        assert!(!pool.is_running(OTHER));
        assert_eq!(pool.remaining(ID), Some(18));
    }

    #[test]
    fn wait_future_resolves_on_tick() {
        let pool: SoftTimer<4> = SoftTimer::new();
        let waker = Waker::noop();
        let mut cx = Context::from_waker(&waker);

        let mut wait = pin!(pool.wait(ID, 2));
        assert_eq!(wait.as_mut().poll(&mut cx), Poll::Pending);

        pool.tick();
        assert_eq!(wait.as_mut().poll(&mut cx), Poll::Pending);

        pool.tick();
        assert_eq!(wait.as_mut().poll(&mut cx), Poll::Ready(()));
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn dropping_the_wait_future_cancels_the_timer() {
        let pool: SoftTimer<4> = SoftTimer::new();

        {
            let _wait = pool.wait(ID, 100);
            assert!(pool.is_running(ID));
        }
        assert!(!pool.is_running(ID));
    }
}
