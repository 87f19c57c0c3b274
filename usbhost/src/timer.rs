//! Single-shot millisecond timers run from the bus task.
//!
//! A timer is allocated once with the event it delivers, then started and
//! cancelled any number of times. Expiry never calls back directly: the task
//! loop pops expired events and dispatches them, so handlers may freely
//! start, cancel or free timers (including their own).

use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u32);

struct TimerSlot<E> {
    event: E,
    deadline: Option<u64>,
    seq: u64,
}

pub struct Timers<E> {
    slots: Vec<Option<TimerSlot<E>>>,
    free: Vec<u32>,
    seq: u64,
}

impl<E: Copy> Timers<E> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            seq: 0,
        }
    }

    pub fn alloc(&mut self, event: E) -> TimerId {
        let slot = TimerSlot {
            event,
            deadline: None,
            seq: 0,
        };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                TimerId(idx)
            }
            None => {
                self.slots.push(Some(slot));
                TimerId(self.slots.len() as u32 - 1)
            }
        }
    }

    /// Arm (or re-arm) the timer to fire `ms` after `now`.
    pub fn start(&mut self, id: TimerId, now: u64, ms: u32) {
        self.seq += 1;
        let seq = self.seq;
        match self.slot_mut(id) {
            Some(slot) => {
                slot.deadline = Some(now + ms as u64);
                slot.seq = seq;
            }
            None => log::warn!("timer: start of freed timer {:?}", id),
        }
    }

    /// Disarm. Returns whether the timer was running.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.slot_mut(id)
            .and_then(|slot| slot.deadline.take())
            .is_some()
    }

    pub fn free(&mut self, id: TimerId) {
        if let Some(entry) = self.slots.get_mut(id.0 as usize) {
            if entry.take().is_some() {
                self.free.push(id.0);
            }
        }
    }

    pub fn is_running(&self, id: TimerId) -> bool {
        matches!(
            self.slots.get(id.0 as usize),
            Some(Some(TimerSlot { deadline: Some(_), .. }))
        )
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.slots
            .iter()
            .flatten()
            .filter_map(|slot| slot.deadline)
            .min()
    }

    /// Disarm and return the earliest timer due at `now`. Timers due at the
    /// same instant come back in the order they were started.
    pub fn pop_expired(&mut self, now: u64) -> Option<(TimerId, E)> {
        let mut best: Option<(usize, u64, u64)> = None;
        for (idx, slot) in self.slots.iter().enumerate() {
            let Some(slot) = slot else { continue };
            let Some(deadline) = slot.deadline else { continue };
            if deadline > now {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, d, s)) => (deadline, slot.seq) < (d, s),
            };
            if better {
                best = Some((idx, deadline, slot.seq));
            }
        }
        let (idx, _, _) = best?;
        let slot = self.slots[idx].as_mut()?;
        slot.deadline = None;
        Some((TimerId(idx as u32), slot.event))
    }

    fn slot_mut(&mut self, id: TimerId) -> Option<&mut TimerSlot<E>> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }
}

impl<E: Copy> Default for Timers<E> {
    fn default() -> Self {
        Self::new()
    }
}
