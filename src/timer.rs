//! Deadline timer service.
//!
//! Multiplexes any number of logical timeouts onto the single hardware alarm
//! of a [`TimerHal`]. Each timer carries an event value instead of a callback;
//! [`TimerService::expire`] hands fired events back to the caller, which
//! processes them after the service is no longer borrowed. Handlers are
//! therefore free to set or clear timers while reacting to an expiry.
//!
//! Handles pair a slot index with a generation counter, so a handle kept
//! after its timer fired or was cleared can never cancel a later timer that
//! reuses the same slot.

use alloc::vec::Vec;
use core::time::Duration;

use tracing::{error, trace};

use crate::error::{Error, Result};
use crate::hal::TimerHal;
use crate::time::Instant;

/// Number of slots added whenever the slot array is exhausted.
pub const TIMER_SLOT_CHUNK: usize = 8;

/// Identifies one armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct TimerSlot<E> {
    deadline: Instant,
    enabled: bool,
    generation: u32,
    event: Option<E>,
}

impl<E> TimerSlot<E> {
    const fn vacant() -> Self {
        Self { deadline: Instant::ZERO, enabled: false, generation: 0, event: None }
    }

    fn is_free(&self) -> bool {
        !self.enabled && self.event.is_none()
    }
}

/// Timer multiplexer owning the hardware alarm.
#[derive(Debug)]
pub struct TimerService<H, E> {
    hal: H,
    slots: Vec<TimerSlot<E>>,
    last_ticks: u64,
    current: Instant,
    armed: Option<Instant>,
}

impl<H: TimerHal, E> TimerService<H, E> {
    pub fn new(hal: H) -> Self {
        let last_ticks = hal.get_time();
        Self { hal, slots: Vec::new(), last_ticks, current: Instant::ZERO, armed: None }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    /// Current time.
    ///
    /// The counter may wrap at most once between two calls.
    pub fn now(&mut self) -> Instant {
        let ticks = self.hal.get_time();
        let delta = if ticks >= self.last_ticks {
            ticks - self.last_ticks
        } else {
            (self.hal.max_time_value() - self.last_ticks).saturating_add(ticks)
        };
        self.last_ticks = ticks;
        let nanos = delta.saturating_mul(self.hal.ns_per_tick());
        self.current = self.current + Duration::from_nanos(nanos);
        self.current
    }

    /// Arms a timer delivering `event` after `timeout`.
    pub fn set_timer(&mut self, timeout: Duration, event: E) -> Result<TimerHandle> {
        let deadline = self.now() + timeout;
        let index = match self.slots.iter().position(TimerSlot::is_free) {
            Some(index) => index,
            None => self.grow()?,
        };

        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.deadline = deadline;
        slot.enabled = true;
        slot.event = Some(event);
        let handle = TimerHandle { index: index as u32, generation: slot.generation };

        if let Err(err) = self.rearm() {
            let slot = &mut self.slots[index];
            slot.enabled = false;
            slot.event = None;
            if let Err(err) = self.rearm() {
                error!("Failed to restore alarm after rollback: {}", err);
            }
            return Err(err);
        }

        trace!("Timer {:?} armed for {:?}", handle, timeout);
        Ok(handle)
    }

    /// Cancels a timer. Unknown, stale and already fired handles are rejected.
    pub fn clear_timer(&mut self, handle: TimerHandle) -> Result<()> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.enabled && slot.generation == handle.generation)
            .ok_or(Error::InvalidTimer)?;
        slot.enabled = false;
        slot.event = None;
        trace!("Timer {:?} cleared", handle);
        self.rearm()
    }

    /// Whether `handle` still refers to an armed timer.
    pub fn is_active(&self, handle: TimerHandle) -> bool {
        self.slots
            .get(handle.index as usize)
            .is_some_and(|slot| slot.enabled && slot.generation == handle.generation)
    }

    /// Number of armed timers.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.enabled).count()
    }

    /// Collects every due timer. Call when the hardware alarm fires.
    pub fn expire(&mut self) -> Vec<(TimerHandle, E)> {
        self.expire_at_most(usize::MAX)
    }

    /// Collects up to `limit` due timers. The rest stay armed and the alarm
    /// is programmed to fire again right away.
    pub fn expire_at_most(&mut self, limit: usize) -> Vec<(TimerHandle, E)> {
        let now = self.now();

        let mut fired = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if fired.len() >= limit {
                break;
            }
            if slot.enabled && slot.deadline <= now {
                slot.enabled = false;
                if let Some(event) = slot.event.take() {
                    fired.push((TimerHandle { index: index as u32, generation: slot.generation }, event));
                }
            }
        }

        // The one-shot alarm is spent, or fired early because of clamping
        let next = self.nearest_deadline();
        if let Err(err) = self.program(next) {
            error!("Failed to rearm alarm: {}", err);
        }
        fired
    }

    /// Whether an armed timer is already past its deadline.
    pub fn has_due(&mut self) -> bool {
        let now = self.now();
        self.slots.iter().any(|slot| slot.enabled && slot.deadline <= now)
    }

    fn grow(&mut self) -> Result<usize> {
        let index = self.slots.len();
        self.slots.try_reserve(TIMER_SLOT_CHUNK).map_err(|_| Error::OutOfMemory)?;
        self.slots.extend((0..TIMER_SLOT_CHUNK).map(|_| TimerSlot::vacant()));
        trace!("Timer slots grown to {}", self.slots.len());
        Ok(index)
    }

    fn nearest_deadline(&self) -> Option<Instant> {
        self.slots.iter().filter(|slot| slot.enabled).map(|slot| slot.deadline).min()
    }

    /// Programs the alarm for the nearest deadline if it changed.
    fn rearm(&mut self) -> Result<()> {
        let next = self.nearest_deadline();
        if next == self.armed {
            return Ok(());
        }
        self.program(next)
    }

    /// Programs the alarm for `next`, or leaves it disarmed for `None`.
    fn program(&mut self, next: Option<Instant>) -> Result<()> {
        self.hal.clear_alarm();
        self.armed = None;
        let Some(deadline) = next else {
            return Ok(());
        };

        let now = self.now();
        let nanos = deadline.saturating_duration_since(now).as_nanos();
        let ns_per_tick = self.hal.ns_per_tick().max(1) as u128;
        let ticks = nanos.div_ceil(ns_per_tick);
        // Keep the delta unambiguous for the wrap detection in now()
        let limit = (self.hal.max_time_value() / 2) as u128;
        let ticks = ticks.min(limit) as u64;

        self.hal.set_alarm(ticks)?;
        self.armed = Some(deadline);
        Ok(())
    }
}
