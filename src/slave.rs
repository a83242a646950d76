/*!
    Fieldbus state changes of a slave, with retries.

    Drives are slow and sometimes moody about state changes: a request can be silently ignored while the drive finishes some internal initialization, or refused from PRE-OP straight to OPERATIONAL while it would be accepted through SAFE-OP. [StateController] hides this behind a single blocking call.
*/

use crate::{
    registers::{AlState, AlStatusCode},
    transport::{Transport, SlaveStatus},
    config::Timing,
    error::StateTransitionError,
    };
use std::{thread::sleep, time::Duration};


/// drive slaves to a requested state, with the retry policy given by its [Timing]
pub struct StateController<'a> {
    timing: &'a Timing,
}

impl<'a> StateController<'a> {
    pub fn new(timing: &'a Timing) -> Self {
        Self {timing}
    }

    /**
        request the given state to the slave and wait for it to be reached

        Each attempt clears the AL status, requests the state, then polls it. When the slave stays in PRE-OP while OPERATIONAL is requested, the controller passes once through SAFE-OP with longer delays before retrying. Errors of the transport during polls are considered as an unreached state, so they are retried as well.
    */
    pub fn set_state(&self, transport: &mut dyn Transport, slave: u16, target: AlState) -> Result<(), StateTransitionError> {
        let timing = self.timing;
        let mut last = SlaveStatus {state: None, al_status: AlStatusCode::NONE};
        let mut escalated = false;

        for attempt in 1 ..= timing.state_attempts {
            log::trace!("slave {} requesting {}, attempt {}", slave, target, attempt);
            transport.clear_al_status(slave);
            match transport.set_slave_state(slave, target) {
                Ok(()) => {
                    sleep(timing.state_settle);
                    if self.wait(transport, slave, target, timing.state_polls, &mut last) {
                        log::debug!("slave {} reached {} after {} attempts", slave, target, attempt);
                        return Ok(());
                    }
                },
                Err(err) => log::debug!("slave {} refused request for {}: {}", slave, target, err),
            }
            log::debug!("slave {} in {:?} instead of {}, AL status {}", slave, last.state, target, last.al_status);

            // some drives only accept OPERATIONAL when coming from SAFE-OP
            if ! escalated && target == AlState::Operational && last.state == Some(AlState::PreOperational) {
                escalated = true;
                log::info!("slave {} stuck in {}, going through {}", slave, AlState::PreOperational, AlState::SafeOperational);
                if self.escalate(transport, slave, AlState::SafeOperational, &mut last)
                && self.escalate(transport, slave, AlState::Operational, &mut last) {
                    log::debug!("slave {} reached {} through {}", slave, target, AlState::SafeOperational);
                    return Ok(());
                }
            }
            if attempt < timing.state_attempts {
                sleep(timing.state_retry);
            }
        }
        log::error!("slave {} failed to reach {} after {} attempts", slave, target, timing.state_attempts);
        Err(StateTransitionError {
            slave,
            target,
            observed: last.state,
            al_status: last.al_status,
            attempts: timing.state_attempts,
        })
    }

    /// request a state with the long settle time and the doubled poll bound of an escalation
    fn escalate(&self, transport: &mut dyn Transport, slave: u16, target: AlState, last: &mut SlaveStatus) -> bool {
        if let Err(err) = transport.set_slave_state(slave, target) {
            log::debug!("slave {} refused request for {}: {}", slave, target, err);
            return false;
        }
        sleep(self.timing.escalation_settle);
        self.wait(transport, slave, target, self.timing.state_polls.saturating_mul(2), last)
    }

    /// poll the slave state until it reaches the target or the poll bound elapses
    fn wait(&self, transport: &mut dyn Transport, slave: u16, target: AlState, polls: u32, last: &mut SlaveStatus) -> bool {
        for poll in 0 .. polls {
            if poll != 0 && self.timing.state_poll_interval != Duration::ZERO {
                sleep(self.timing.state_poll_interval);
            }
            match transport.slave_state(slave) {
                Ok(status) => {
                    *last = status;
                    if status.state == Some(target)
                        {return true}
                },
                Err(err) => log::trace!("slave {} state unreadable: {}", slave, err),
            }
        }
        false
    }
}
