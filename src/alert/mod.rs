//! Countdown state machine for a single alert cycle.
//!
//! ```text
//! MONITORING --trigger--> COUNTDOWN --tick(0) / force--> DISPATCHING
//!     ^                      |                               |
//!     |<------cancel---------+                     complete_dispatch
//!     |                                                      v
//!     +<------resume------ CONFIRMING <--begin_confirmation-- SENT
//! ```
//!
//! Every transition is a no-op when called from the wrong state; callers
//! learn whether it applied from the return value. At most one cycle is
//! ever in flight.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::types::{
    AlertMessages, KineticSnapshot, MessageSource, Position, Recipient, TriggerContext,
    TriggerReason,
};

/// Countdown configuration
#[derive(Debug, Clone)]
pub struct CountdownConfig {
    /// Ticks (seconds) between trigger and dispatch
    pub ticks: u32,
}

impl Default for CountdownConfig {
    fn default() -> Self {
        Self { ticks: 10 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertState {
    Monitoring,
    Countdown,
    Dispatching,
    Sent,
    Confirming,
}

/// The live alert cycle. Fields are only written by `AlertStateMachine`.
#[derive(Debug, Clone, Serialize)]
pub struct AlertCycle {
    /// Increments on every trigger; 0 before the first cycle
    pub id: u64,
    pub state: AlertState,
    pub remaining_ticks: u32,
    pub context: Option<TriggerContext>,
    pub messages: Option<AlertMessages>,
    pub message_source: Option<MessageSource>,
    pub family_acknowledged: bool,
    pub ambulance_acknowledged: bool,
    /// Set once the family SMS has been handed to the messenger
    pub auto_dispatch_fired: bool,
}

impl AlertCycle {
    fn idle(id: u64) -> Self {
        Self {
            id,
            state: AlertState::Monitoring,
            remaining_ticks: 0,
            context: None,
            messages: None,
            message_source: None,
            family_acknowledged: false,
            ambulance_acknowledged: false,
            auto_dispatch_fired: false,
        }
    }
}

/// Handed to the message dispatcher when a countdown completes
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub cycle_id: u64,
    pub context: TriggerContext,
}

/// Result of delivering one countdown tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No countdown running for that cycle
    Ignored,
    /// Still counting; remaining ticks
    Counting(u32),
    /// Reached zero; the machine is now DISPATCHING
    Dispatch(DispatchRequest),
}

pub struct AlertStateMachine {
    config: CountdownConfig,
    cycle: AlertCycle,
}

impl AlertStateMachine {
    pub fn new(config: CountdownConfig) -> Self {
        Self {
            config,
            cycle: AlertCycle::idle(0),
        }
    }

    pub fn state(&self) -> AlertState {
        self.cycle.state
    }

    pub fn cycle(&self) -> &AlertCycle {
        &self.cycle
    }

    pub fn countdown_length(&self) -> u32 {
        self.config.ticks
    }

    /// Start a cycle. Ignored unless MONITORING.
    /// Returns the new cycle id when a countdown started.
    pub fn trigger(
        &mut self,
        reason: TriggerReason,
        snapshot: KineticSnapshot,
        position: Option<Position>,
    ) -> Option<u64> {
        if self.cycle.state != AlertState::Monitoring {
            debug!("Trigger {} ignored in state {:?}", reason, self.cycle.state);
            return None;
        }

        let id = self.cycle.id + 1;
        self.cycle = AlertCycle::idle(id);
        self.cycle.state = AlertState::Countdown;
        self.cycle.remaining_ticks = self.config.ticks;
        self.cycle.context = Some(TriggerContext {
            reason,
            snapshot,
            position,
            triggered_at: Utc::now(),
        });

        warn!(
            "🚨 Alert cycle #{} triggered ({}, {:.2}g), dispatch in {}s",
            id, reason, snapshot.total, self.config.ticks
        );

        Some(id)
    }

    /// Deliver one countdown tick for `cycle_id`
    pub fn tick(&mut self, cycle_id: u64) -> TickOutcome {
        if self.cycle.state != AlertState::Countdown || self.cycle.id != cycle_id {
            return TickOutcome::Ignored;
        }

        self.cycle.remaining_ticks = self.cycle.remaining_ticks.saturating_sub(1);
        if self.cycle.remaining_ticks > 0 {
            debug!("⏳ Cycle #{}: {}s remaining", cycle_id, self.cycle.remaining_ticks);
            return TickOutcome::Counting(self.cycle.remaining_ticks);
        }

        match self.enter_dispatching() {
            Some(request) => TickOutcome::Dispatch(request),
            None => TickOutcome::Ignored,
        }
    }

    /// Skip the remaining ticks. Only from COUNTDOWN.
    pub fn force_dispatch(&mut self) -> Option<DispatchRequest> {
        if self.cycle.state != AlertState::Countdown {
            debug!("Force dispatch ignored in state {:?}", self.cycle.state);
            return None;
        }
        info!("⏩ Cycle #{}: dispatch forced with {}s left", self.cycle.id, self.cycle.remaining_ticks);
        self.cycle.remaining_ticks = 0;
        self.enter_dispatching()
    }

    fn enter_dispatching(&mut self) -> Option<DispatchRequest> {
        let context = self.cycle.context.clone()?;
        self.cycle.state = AlertState::Dispatching;
        info!("📨 Cycle #{}: dispatching", self.cycle.id);
        Some(DispatchRequest {
            cycle_id: self.cycle.id,
            context,
        })
    }

    /// Abort the countdown. Only from COUNTDOWN.
    pub fn cancel(&mut self) -> bool {
        if self.cycle.state != AlertState::Countdown {
            debug!("Cancel ignored in state {:?}", self.cycle.state);
            return false;
        }
        info!("✋ Cycle #{} cancelled with {}s left", self.cycle.id, self.cycle.remaining_ticks);
        self.cycle = AlertCycle::idle(self.cycle.id);
        true
    }

    /// Store the composed messages and move to SENT
    pub fn complete_dispatch(
        &mut self,
        cycle_id: u64,
        messages: AlertMessages,
        source: MessageSource,
    ) -> bool {
        if self.cycle.state != AlertState::Dispatching || self.cycle.id != cycle_id {
            warn!("Dispatch result for cycle #{} discarded", cycle_id);
            return false;
        }
        self.cycle.messages = Some(messages);
        self.cycle.message_source = Some(source);
        self.cycle.state = AlertState::Sent;
        info!("✅ Cycle #{}: messages ready ({:?})", cycle_id, source);
        true
    }

    /// Family message for the one-time automatic send.
    /// Returns `Some` exactly once per cycle, and only once SENT.
    pub fn take_auto_dispatch(&mut self) -> Option<String> {
        if self.cycle.state != AlertState::Sent || self.cycle.auto_dispatch_fired {
            return None;
        }
        let body = self.cycle.messages.as_ref()?.family.clone();
        self.cycle.auto_dispatch_fired = true;
        Some(body)
    }

    /// Message body for a manual (re)send. Allowed while SENT or CONFIRMING.
    pub fn message_for(&self, recipient: Recipient) -> Option<&str> {
        match self.cycle.state {
            AlertState::Sent | AlertState::Confirming => self
                .cycle
                .messages
                .as_ref()
                .map(|m| m.for_recipient(recipient)),
            _ => None,
        }
    }

    /// Operator moves on to confirming delivery
    pub fn begin_confirmation(&mut self) -> bool {
        if self.cycle.state != AlertState::Sent {
            return false;
        }
        self.cycle.state = AlertState::Confirming;
        true
    }

    /// Toggle the per-recipient acknowledgment flag. Only while CONFIRMING.
    pub fn acknowledge(&mut self, recipient: Recipient) -> bool {
        if self.cycle.state != AlertState::Confirming {
            return false;
        }
        let flag = match recipient {
            Recipient::Family => &mut self.cycle.family_acknowledged,
            Recipient::Ambulance => &mut self.cycle.ambulance_acknowledged,
        };
        *flag = !*flag;
        debug!("Cycle #{}: {:?} acknowledged = {}", self.cycle.id, recipient, *flag);
        true
    }

    /// Close the cycle and return to MONITORING. Only from CONFIRMING.
    pub fn resume(&mut self) -> bool {
        if self.cycle.state != AlertState::Confirming {
            return false;
        }
        info!("🔄 Cycle #{} closed, monitoring resumed", self.cycle.id);
        self.cycle = AlertCycle::idle(self.cycle.id);
        true
    }
}

impl Default for AlertStateMachine {
    fn default() -> Self {
        Self::new(CountdownConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> KineticSnapshot {
        KineticSnapshot { gx: 0.1, gy: 4.1, gz: 0.9, total: 4.2 }
    }

    fn triggered() -> (AlertStateMachine, u64) {
        let mut machine = AlertStateMachine::default();
        let id = machine
            .trigger(TriggerReason::Impact, snapshot(), Some(Position::new(1.0, 2.0)))
            .unwrap();
        (machine, id)
    }

    fn messages() -> AlertMessages {
        AlertMessages {
            family: "family body".to_string(),
            ambulance: "ambulance body".to_string(),
        }
    }

    fn sent() -> (AlertStateMachine, u64) {
        let (mut machine, id) = triggered();
        machine.force_dispatch().unwrap();
        assert!(machine.complete_dispatch(id, messages(), MessageSource::Fallback));
        (machine, id)
    }

    #[test]
    fn test_trigger_starts_countdown() {
        let (machine, id) = triggered();
        assert_eq!(id, 1);
        assert_eq!(machine.state(), AlertState::Countdown);
        assert_eq!(machine.cycle().remaining_ticks, 10);

        let context = machine.cycle().context.as_ref().unwrap();
        assert_eq!(context.reason, TriggerReason::Impact);
        assert_eq!(context.snapshot, snapshot());
    }

    #[test]
    fn test_second_trigger_is_noop() {
        let (mut machine, id) = triggered();
        machine.tick(id);

        assert!(machine.trigger(TriggerReason::Movement, snapshot(), None).is_none());
        assert_eq!(machine.cycle().id, id);
        assert_eq!(machine.cycle().remaining_ticks, 9);
        assert_eq!(machine.cycle().context.as_ref().unwrap().reason, TriggerReason::Impact);
    }

    #[test]
    fn test_countdown_reaches_dispatch() {
        let (mut machine, id) = triggered();

        for expected in (1..10).rev() {
            assert_eq!(machine.tick(id), TickOutcome::Counting(expected));
        }
        match machine.tick(id) {
            TickOutcome::Dispatch(req) => {
                assert_eq!(req.cycle_id, id);
                assert_eq!(req.context.reason, TriggerReason::Impact);
            }
            other => panic!("expected dispatch, got {:?}", other),
        }
        assert_eq!(machine.state(), AlertState::Dispatching);

        // Further ticks, cancel and trigger have no effect
        assert_eq!(machine.tick(id), TickOutcome::Ignored);
        assert!(!machine.cancel());
        assert!(machine.trigger(TriggerReason::Impact, snapshot(), None).is_none());
        assert_eq!(machine.state(), AlertState::Dispatching);
    }

    #[test]
    fn test_cancel_returns_to_monitoring() {
        let (mut machine, id) = triggered();
        for _ in 0..7 {
            machine.tick(id);
        }
        assert_eq!(machine.cycle().remaining_ticks, 3);

        assert!(machine.cancel());
        assert_eq!(machine.state(), AlertState::Monitoring);
        assert_eq!(machine.cycle().remaining_ticks, 0);
        assert!(machine.cycle().context.is_none());

        // Late ticks from the cancelled cycle are ignored
        assert_eq!(machine.tick(id), TickOutcome::Ignored);
        assert!(!machine.cancel());
    }

    #[test]
    fn test_stale_tick_does_not_drive_new_cycle() {
        let (mut machine, old) = triggered();
        assert!(machine.cancel());
        let new = machine.trigger(TriggerReason::Movement, snapshot(), None).unwrap();
        assert_ne!(old, new);

        assert_eq!(machine.tick(old), TickOutcome::Ignored);
        assert_eq!(machine.cycle().remaining_ticks, 10);
    }

    #[test]
    fn test_force_dispatch_only_from_countdown() {
        let mut idle = AlertStateMachine::default();
        assert!(idle.force_dispatch().is_none());

        let (mut machine, id) = triggered();
        let req = machine.force_dispatch().unwrap();
        assert_eq!(req.cycle_id, id);
        assert_eq!(machine.state(), AlertState::Dispatching);
        assert!(machine.force_dispatch().is_none());
    }

    #[test]
    fn test_complete_dispatch_checks_cycle() {
        let (mut machine, id) = triggered();
        assert!(!machine.complete_dispatch(id, messages(), MessageSource::Generated), "not dispatching yet");

        machine.force_dispatch().unwrap();
        assert!(!machine.complete_dispatch(id + 1, messages(), MessageSource::Generated));
        assert!(machine.complete_dispatch(id, messages(), MessageSource::Generated));
        assert_eq!(machine.state(), AlertState::Sent);
        assert_eq!(machine.cycle().message_source, Some(MessageSource::Generated));
    }

    #[test]
    fn test_auto_dispatch_fires_once() {
        let (mut machine, _) = sent();
        assert!(!machine.cycle().auto_dispatch_fired);

        assert_eq!(machine.take_auto_dispatch().as_deref(), Some("family body"));
        assert!(machine.cycle().auto_dispatch_fired);
        assert!(machine.take_auto_dispatch().is_none());
        assert!(machine.take_auto_dispatch().is_none());
    }

    #[test]
    fn test_manual_send_available_after_dispatch() {
        let (mut machine, _) = triggered();
        assert!(machine.message_for(Recipient::Ambulance).is_none());

        machine.force_dispatch().unwrap();
        assert!(machine.message_for(Recipient::Ambulance).is_none());

        let (mut machine, _) = sent();
        assert_eq!(machine.message_for(Recipient::Ambulance), Some("ambulance body"));
        machine.begin_confirmation();
        assert_eq!(machine.message_for(Recipient::Family), Some("family body"));
    }

    #[test]
    fn test_acknowledge_toggles_only_in_confirming() {
        let (mut machine, _) = sent();
        assert!(!machine.acknowledge(Recipient::Family), "not confirming yet");

        assert!(machine.begin_confirmation());
        assert_eq!(machine.state(), AlertState::Confirming);

        assert!(machine.acknowledge(Recipient::Family));
        assert!(machine.cycle().family_acknowledged);
        assert!(!machine.cycle().ambulance_acknowledged);

        assert!(machine.acknowledge(Recipient::Family));
        assert!(!machine.cycle().family_acknowledged);
        assert_eq!(machine.state(), AlertState::Confirming);
    }

    #[test]
    fn test_resume_clears_cycle() {
        let (mut machine, id) = sent();
        assert!(!machine.resume(), "resume requires confirming");

        machine.begin_confirmation();
        machine.acknowledge(Recipient::Ambulance);
        assert!(machine.resume());

        let cycle = machine.cycle();
        assert_eq!(cycle.state, AlertState::Monitoring);
        assert_eq!(cycle.id, id);
        assert!(cycle.context.is_none());
        assert!(cycle.messages.is_none());
        assert!(!cycle.ambulance_acknowledged);
        assert!(!cycle.auto_dispatch_fired);

        // A new cycle can start again
        assert_eq!(machine.trigger(TriggerReason::Impact, snapshot(), None), Some(id + 1));
    }

    #[test]
    fn test_zero_length_countdown_dispatches_on_first_tick() {
        let mut machine = AlertStateMachine::new(CountdownConfig { ticks: 0 });
        let id = machine.trigger(TriggerReason::Impact, snapshot(), None).unwrap();
        assert!(matches!(machine.tick(id), TickOutcome::Dispatch(_)));
    }
}
