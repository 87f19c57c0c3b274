//! SubState: one pending asynchronous operation with a timeout.
//!
//! Every protocol step of the root hub and device enumeration machines runs
//! through a SubState. It holds either one in-flight request or one pure
//! wait, never both:
//!
//! ```text
//! Idle -> TimerUrb -> Idle                       (request finished in time)
//!                  -> TimeoutPendingUrb -> Idle  (timer fired, abort forced)
//! Idle -> Timer -> Idle                          (wait elapsed)
//! ```
//!
//! When the timer wins against a request the endpoint is aborted and the
//! final notification waits for the completion the abort forces; the
//! controller may still touch the buffer until then.
//!
//! The optional [`Hold`] passed to `submit`/`wait` travels with the
//! operation and is handed to the terminal continuation, which drops it.

use crate::bus::{DeviceId, HcId, UsbHost};
use crate::error::{UrbStatus, UsbError, UsbResult};
use crate::hcd::EpHandle;
use crate::refcount::Hold;
use crate::timer::TimerId;
use crate::urb::{Urb, UrbId};

/// Which object a SubState belongs to; selects the continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubRef {
    Port(HcId, u8),
    Device(DeviceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubPhase {
    Idle,
    /// Request submitted, timer armed
    TimerUrb(UrbId),
    /// Timer fired first; abort requested, waiting for the forced completion
    TimeoutPendingUrb(UrbId),
    /// Pure delay
    Timer,
}

/// What the timer firing means for the operation
#[derive(Debug)]
pub enum TimerOutcome {
    /// Abort this request; the operation ends on its completion
    Abort(UrbId),
    /// The wait is over
    Elapsed(Option<Hold>),
    /// Nothing to do (operation already finished)
    Stale,
}

#[derive(Debug)]
pub enum CancelOutcome {
    Idle,
    /// A wait was dropped; no continuation runs
    Dropped(Option<Hold>),
    /// Request in flight: abort it, its completion still arrives
    Abort(UrbId),
}

#[derive(Debug)]
pub enum SubOutcome {
    /// The request finished; status is `Timeout` when the timer won
    Request(Urb),
    Elapsed,
}

/// Terminal result handed to the owner's continuation.
#[derive(Debug)]
pub struct SubResult {
    pub outcome: SubOutcome,
    pub hold: Option<Hold>,
}

#[derive(Debug)]
pub struct SubState {
    phase: SubPhase,
    timer: TimerId,
    hold: Option<Hold>,
}

impl SubState {
    pub fn new(timer: TimerId) -> Self {
        Self {
            phase: SubPhase::Idle,
            timer,
            hold: None,
        }
    }

    pub fn timer(&self) -> TimerId {
        self.timer
    }

    pub fn phase(&self) -> SubPhase {
        self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase == SubPhase::Idle
    }

    fn check_idle(&self) -> UsbResult<()> {
        if self.is_idle() {
            Ok(())
        } else {
            log::warn!("substate: operation started while {:?}", self.phase);
            Err(UsbError::Busy)
        }
    }

    /// A request was accepted by the controller.
    pub fn begin_request(&mut self, urb: UrbId, hold: Option<Hold>) -> UsbResult<()> {
        self.check_idle()?;
        self.phase = SubPhase::TimerUrb(urb);
        self.hold = hold;
        Ok(())
    }

    pub fn begin_wait(&mut self, hold: Option<Hold>) -> UsbResult<()> {
        self.check_idle()?;
        self.phase = SubPhase::Timer;
        self.hold = hold;
        Ok(())
    }

    pub fn on_timer(&mut self) -> TimerOutcome {
        match self.phase {
            SubPhase::TimerUrb(urb) => {
                self.phase = SubPhase::TimeoutPendingUrb(urb);
                TimerOutcome::Abort(urb)
            }
            SubPhase::Timer => {
                self.phase = SubPhase::Idle;
                TimerOutcome::Elapsed(self.hold.take())
            }
            SubPhase::Idle | SubPhase::TimeoutPendingUrb(_) => TimerOutcome::Stale,
        }
    }

    /// The request finished. Returns whether it had timed out, plus the
    /// hold; `None` if `urb` is not the request this SubState is tracking.
    pub fn on_request_done(&mut self, urb: UrbId) -> Option<(bool, Option<Hold>)> {
        let timed_out = match self.phase {
            SubPhase::TimerUrb(id) if id == urb => false,
            SubPhase::TimeoutPendingUrb(id) if id == urb => true,
            _ => return None,
        };
        self.phase = SubPhase::Idle;
        Some((timed_out, self.hold.take()))
    }

    pub fn cancel(&mut self) -> CancelOutcome {
        match self.phase {
            SubPhase::Idle => CancelOutcome::Idle,
            SubPhase::Timer => {
                self.phase = SubPhase::Idle;
                CancelOutcome::Dropped(self.hold.take())
            }
            SubPhase::TimerUrb(urb) | SubPhase::TimeoutPendingUrb(urb) => CancelOutcome::Abort(urb),
        }
    }
}

impl UsbHost {
    /// Submit `urb` on `ep` and arm a `timeout_ms` timer.
    ///
    /// On error nothing was queued and no continuation will run.
    pub(crate) fn sub_submit(
        &mut self,
        sub: SubRef,
        hc: HcId,
        ep: EpHandle,
        device: Option<DeviceId>,
        urb: Urb,
        timeout_ms: u32,
        hold: Option<Hold>,
    ) -> UsbResult<UrbId> {
        self.sub_mut(sub).ok_or(UsbError::NotFound)?.check_idle()?;
        let id = self.dispatch(hc, ep, device, urb, crate::bus::Owner::Sub(sub), None)?;
        let state = self.sub_mut(sub).ok_or(UsbError::NotFound)?;
        state.begin_request(id, hold)?;
        let timer = state.timer();
        self.timers.start(timer, self.now, timeout_ms);
        Ok(id)
    }

    /// Run the owner's continuation after `ms`.
    pub(crate) fn sub_wait(&mut self, sub: SubRef, ms: u32, hold: Option<Hold>) -> UsbResult<()> {
        let state = self.sub_mut(sub).ok_or(UsbError::NotFound)?;
        state.begin_wait(hold)?;
        let timer = state.timer();
        self.timers.start(timer, self.now, ms);
        Ok(())
    }

    pub(crate) fn sub_cancel(&mut self, sub: SubRef) {
        let Some(state) = self.sub_mut(sub) else {
            return;
        };
        let timer = state.timer();
        match state.cancel() {
            CancelOutcome::Idle => {}
            CancelOutcome::Dropped(hold) => {
                self.timers.cancel(timer);
                drop(hold);
            }
            CancelOutcome::Abort(urb) => {
                self.timers.cancel(timer);
                self.abort_request(urb);
            }
        }
    }

    pub(crate) fn sub_timer_fired(&mut self, sub: SubRef) {
        let Some(state) = self.sub_mut(sub) else {
            return;
        };
        match state.on_timer() {
            TimerOutcome::Abort(urb) => {
                log::debug!("substate: {:?} request {:?} timed out, aborting", sub, urb);
                self.abort_request(urb);
            }
            TimerOutcome::Elapsed(hold) => self.sub_finished(
                sub,
                SubResult {
                    outcome: SubOutcome::Elapsed,
                    hold,
                },
            ),
            TimerOutcome::Stale => {}
        }
    }

    pub(crate) fn sub_request_done(&mut self, sub: SubRef, id: UrbId, mut urb: Urb) {
        let Some(state) = self.sub_mut(sub) else {
            log::debug!("substate: completion {:?} for vanished {:?}", id, sub);
            return;
        };
        let Some((timed_out, hold)) = state.on_request_done(id) else {
            log::warn!("substate: {:?} got completion of untracked request {:?}", sub, id);
            return;
        };
        let timer = state.timer();
        self.timers.cancel(timer);
        if timed_out {
            urb.status = Some(UrbStatus::Timeout);
        }
        self.sub_finished(
            sub,
            SubResult {
                outcome: SubOutcome::Request(urb),
                hold,
            },
        );
    }

    fn sub_finished(&mut self, sub: SubRef, result: SubResult) {
        match sub {
            SubRef::Port(hc, port) => self.port_continue(hc, port, result),
            SubRef::Device(device) => self.device_continue(device, result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refcount::RefCount;
    use crate::timer::Timers;

    fn substate() -> SubState {
        let mut timers = Timers::new();
        SubState::new(timers.alloc(()))
    }

    #[test]
    fn test_request_completes_in_time() {
        let refs = RefCount::new();
        let mut sub = substate();
        sub.begin_request(UrbId(1), Some(refs.hold())).unwrap();
        assert_eq!(refs.count(), 2);
        assert_eq!(sub.phase(), SubPhase::TimerUrb(UrbId(1)));

        let (timed_out, hold) = sub.on_request_done(UrbId(1)).unwrap();
        assert!(!timed_out);
        assert!(sub.is_idle());
        drop(hold);
        assert!(refs.is_idle());
        // the timer firing late is harmless
        assert!(matches!(sub.on_timer(), TimerOutcome::Stale));
    }

    #[test]
    fn test_wait_elapses() {
        let refs = RefCount::new();
        let mut sub = substate();
        sub.begin_wait(Some(refs.hold())).unwrap();
        match sub.on_timer() {
            TimerOutcome::Elapsed(hold) => {
                assert!(hold.is_some());
                assert_eq!(refs.count(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(refs.is_idle());
        assert!(sub.is_idle());
    }

    #[test]
    fn test_timeout_waits_for_forced_completion() {
        let refs = RefCount::new();
        let mut sub = substate();
        sub.begin_request(UrbId(7), Some(refs.hold())).unwrap();
        assert!(matches!(sub.on_timer(), TimerOutcome::Abort(UrbId(7))));
        assert_eq!(sub.phase(), SubPhase::TimeoutPendingUrb(UrbId(7)));
        // still holding until the request really ends
        assert_eq!(refs.count(), 2);
        assert!(matches!(sub.on_timer(), TimerOutcome::Stale));

        let (timed_out, hold) = sub.on_request_done(UrbId(7)).unwrap();
        assert!(timed_out);
        drop(hold);
        assert!(refs.is_idle());
    }

    #[test]
    fn test_second_operation_is_busy() {
        let refs = RefCount::new();
        let mut sub = substate();
        sub.begin_wait(None).unwrap();
        assert_eq!(sub.begin_request(UrbId(2), Some(refs.hold())), Err(UsbError::Busy));
        assert_eq!(sub.begin_wait(None), Err(UsbError::Busy));
        // the refused hold was dropped with the call
        assert!(refs.is_idle());
        assert_eq!(sub.phase(), SubPhase::Timer);
    }

    #[test]
    fn test_foreign_completion_is_ignored() {
        let mut sub = substate();
        sub.begin_request(UrbId(3), None).unwrap();
        assert!(sub.on_request_done(UrbId(4)).is_none());
        assert_eq!(sub.phase(), SubPhase::TimerUrb(UrbId(3)));
    }

    #[test]
    fn test_cancel() {
        let refs = RefCount::new();
        let mut sub = substate();
        sub.begin_wait(Some(refs.hold())).unwrap();
        match sub.cancel() {
            CancelOutcome::Dropped(hold) => drop(hold),
            other => panic!("unexpected {:?}", other),
        }
        assert!(refs.is_idle());

        sub.begin_request(UrbId(5), Some(refs.hold())).unwrap();
        assert!(matches!(sub.cancel(), CancelOutcome::Abort(UrbId(5))));
        // the request still owns the hold until its completion
        assert_eq!(refs.count(), 2);
        let (_, hold) = sub.on_request_done(UrbId(5)).unwrap();
        drop(hold);
        assert!(refs.is_idle());
        assert!(matches!(sub.cancel(), CancelOutcome::Idle));
    }
}
