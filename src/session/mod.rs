//! Monitoring session: wires sensor and location input to the trigger
//! policy and the alert state machine.
//!
//! `Session` is synchronous and owns all mutable state (profile, anchor,
//! latest readings, the live alert cycle). `runtime::SessionRuntime` drives
//! it from async tasks and serializes every call through one lock.

pub mod runtime;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::alert::{AlertState, AlertStateMachine, CountdownConfig, DispatchRequest, TickOutcome};
use crate::detection::{DetectionConfig, DetectionError, TriggerPolicy};
use crate::dispatch::sms::{Messenger, SmsIntent};
use crate::dispatch::{AlertRequest, ComposedAlert};
use crate::kinematics;
use crate::types::{
    AccelerationReading, AlertMessages, EmergencyContacts, KineticSample, MessageSource, Position,
    Profile, Recipient, TriggerReason,
};

#[derive(Error, Debug, PartialEq)]
pub enum SessionError {
    #[error("No profile registered")]
    NotRegistered,
    #[error("Profile already registered")]
    AlreadyRegistered,
    #[error("Invalid profile: {0}")]
    InvalidProfile(String),
    #[error(transparent)]
    Detection(#[from] DetectionError),
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub detection: DetectionConfig,
    pub countdown: CountdownConfig,
    pub contacts: EmergencyContacts,
    /// Countdown tick period
    pub tick_interval: Duration,
    /// Location evaluation period
    pub location_poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            detection: DetectionConfig::default(),
            countdown: CountdownConfig::default(),
            contacts: EmergencyContacts::default(),
            tick_interval: Duration::from_secs(1),
            location_poll_interval: Duration::from_secs(2),
        }
    }
}

/// Read-only projection for the UI
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub registered: bool,
    pub driver: Option<String>,
    pub state: AlertState,
    pub cycle_id: u64,
    pub remaining_ticks: u32,
    pub countdown_length: u32,
    pub reason: Option<TriggerReason>,
    pub gforce: f64,
    pub speed: f64,
    pub threshold: f64,
    pub position: Option<Position>,
    pub anchor: Option<Position>,
    pub displacement_m: f64,
    pub messages: Option<AlertMessages>,
    pub message_source: Option<MessageSource>,
    pub family_acknowledged: bool,
    pub ambulance_acknowledged: bool,
    pub auto_dispatch_fired: bool,
    pub ambulance_contact: String,
}

pub struct Session {
    config: SessionConfig,
    profile: Option<Profile>,
    policy: TriggerPolicy,
    machine: AlertStateMachine,
    /// Movement baseline for the current monitoring interval
    anchor: Option<Position>,
    current: Option<Position>,
    latest: Option<KineticSample>,
    messenger: Arc<dyn Messenger>,
}

impl Session {
    pub fn new(config: SessionConfig, messenger: Arc<dyn Messenger>) -> Self {
        Self {
            policy: TriggerPolicy::new(config.detection.clone()),
            machine: AlertStateMachine::new(config.countdown.clone()),
            config,
            profile: None,
            anchor: None,
            current: None,
            latest: None,
            messenger,
        }
    }

    pub fn state(&self) -> AlertState {
        self.machine.state()
    }

    pub fn machine(&self) -> &AlertStateMachine {
        &self.machine
    }

    pub fn anchor(&self) -> Option<&Position> {
        self.anchor.as_ref()
    }

    /// Register the driver. Monitoring starts once this succeeds.
    pub fn register(&mut self, profile: Profile) -> Result<(), SessionError> {
        if self.profile.is_some() {
            return Err(SessionError::AlreadyRegistered);
        }
        profile.validate().map_err(SessionError::InvalidProfile)?;

        info!("🪪 Registered {} (vehicle {})", profile.name, profile.vehicle_number);
        self.profile = Some(profile);
        self.reset_anchor();
        Ok(())
    }

    pub fn set_threshold(&mut self, gforce: f64) -> Result<(), SessionError> {
        Ok(self.policy.set_threshold(gforce)?)
    }

    fn monitoring(&self) -> bool {
        self.profile.is_some() && self.machine.state() == AlertState::Monitoring
    }

    fn displacement(&self) -> f64 {
        kinematics::compute_displacement(self.anchor.as_ref(), self.current.as_ref())
    }

    /// Feed an accelerometer reading. Returns the cycle id if it started one.
    pub fn on_motion(&mut self, reading: &AccelerationReading) -> Option<u64> {
        let sample = kinematics::evaluate(reading);
        self.latest = Some(sample);
        self.policy.record_gforce(sample.gforce);

        if !self.monitoring() || !self.policy.impact_detected() {
            return None;
        }
        self.trigger(TriggerReason::Impact)
    }

    /// Feed a position fix. Returns the cycle id if it started one.
    pub fn on_position(&mut self, position: Position) -> Option<u64> {
        self.current = Some(position);
        self.policy.record_speed(position.speed_or_zero());

        if self.profile.is_some() && self.anchor.is_none() {
            debug!("📍 Anchor established at {:.5}, {:.5}", position.latitude, position.longitude);
            self.anchor = Some(position);
        }

        if !self.monitoring() {
            return None;
        }
        let reason = self.policy.evaluate(self.displacement())?;
        self.trigger(reason)
    }

    /// Start an alert cycle with the current snapshot. No-op unless monitoring.
    /// The recorded g-force is consumed so later fixes cannot re-fire it.
    pub fn trigger(&mut self, reason: TriggerReason) -> Option<u64> {
        if self.profile.is_none() {
            return None;
        }
        let snapshot = self
            .latest
            .as_ref()
            .map(kinematics::snapshot)
            .unwrap_or_default();
        let cycle_id = self.machine.trigger(reason, snapshot, self.current)?;
        self.policy.clear_impact();
        Some(cycle_id)
    }

    pub fn tick(&mut self, cycle_id: u64) -> TickOutcome {
        self.machine.tick(cycle_id)
    }

    /// Cancel the countdown and re-anchor at the latest position
    pub fn cancel(&mut self) -> bool {
        if !self.machine.cancel() {
            return false;
        }
        self.reset_anchor();
        true
    }

    pub fn force_dispatch(&mut self) -> Option<DispatchRequest> {
        self.machine.force_dispatch()
    }

    /// Inputs for the message dispatcher
    pub fn alert_request(&self, request: &DispatchRequest) -> Result<AlertRequest, SessionError> {
        let profile = self.profile.clone().ok_or(SessionError::NotRegistered)?;
        Ok(AlertRequest {
            profile,
            position: request.context.position.or(self.current),
            contacts: self.config.contacts.clone(),
            reason: request.context.reason,
            snapshot: request.context.snapshot,
        })
    }

    /// Store the composed messages and fire the one-time family SMS
    pub fn complete_dispatch(&mut self, cycle_id: u64, composed: ComposedAlert) -> bool {
        if !self
            .machine
            .complete_dispatch(cycle_id, composed.messages, composed.source)
        {
            return false;
        }
        if let Some(body) = self.machine.take_auto_dispatch() {
            if let Some(intent) = self.intent(Recipient::Family, body) {
                self.messenger.send(&intent);
            }
        }
        true
    }

    fn intent(&self, recipient: Recipient, body: String) -> Option<SmsIntent> {
        let to = match recipient {
            Recipient::Family => self.profile.as_ref()?.emergency_contact.clone(),
            Recipient::Ambulance => self.config.contacts.ambulance.clone(),
        };
        Some(SmsIntent::new(recipient, to, body))
    }

    /// Manually (re)send one message. Available once messages exist.
    pub fn send_to(&self, recipient: Recipient) -> Option<SmsIntent> {
        let body = self.machine.message_for(recipient)?.to_string();
        let intent = self.intent(recipient, body)?;
        self.messenger.send(&intent);
        Some(intent)
    }

    pub fn begin_confirmation(&mut self) -> bool {
        self.machine.begin_confirmation()
    }

    pub fn acknowledge(&mut self, recipient: Recipient) -> bool {
        self.machine.acknowledge(recipient)
    }

    /// Close the cycle and re-anchor at the latest position
    pub fn resume(&mut self) -> bool {
        if !self.machine.resume() {
            return false;
        }
        self.reset_anchor();
        true
    }

    /// Fresh baseline for a new monitoring interval
    fn reset_anchor(&mut self) {
        self.policy.clear_impact();
        self.anchor = self.current;
        if let Some(p) = &self.anchor {
            debug!("📍 Anchor reset to {:.5}, {:.5}", p.latitude, p.longitude);
        }
    }

    pub fn view(&self) -> SessionView {
        let cycle = self.machine.cycle();
        SessionView {
            registered: self.profile.is_some(),
            driver: self.profile.as_ref().map(|p| p.name.clone()),
            state: cycle.state,
            cycle_id: cycle.id,
            remaining_ticks: cycle.remaining_ticks,
            countdown_length: self.machine.countdown_length(),
            reason: cycle.context.as_ref().map(|c| c.reason),
            gforce: self.policy.current_gforce(),
            speed: self.policy.current_speed(),
            threshold: self.policy.threshold(),
            position: self.current,
            anchor: self.anchor,
            displacement_m: self.displacement(),
            messages: cycle.messages.clone(),
            message_source: cycle.message_source,
            family_acknowledged: cycle.family_acknowledged,
            ambulance_acknowledged: cycle.ambulance_acknowledged,
            auto_dispatch_fired: cycle.auto_dispatch_fired,
            ambulance_contact: self.config.contacts.ambulance.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::sms::testing::RecordingMessenger;
    use crate::dispatch::{MessageDispatcher, MAX_SMS_CHARS};
    use crate::kinematics::STANDARD_GRAVITY;

    const KMH_20: f64 = 20.0 / 3.6;

    fn jane() -> Profile {
        Profile {
            name: "Jane Doe".to_string(),
            mobile: "+1-555-0100".to_string(),
            vehicle_number: "ABC123".to_string(),
            age: 34,
            blood_group: "O-".to_string(),
            address: "12 Elm Street".to_string(),
            emergency_contact: "+1-555-0111".to_string(),
        }
    }

    fn session() -> (Session, Arc<RecordingMessenger>) {
        let messenger = Arc::new(RecordingMessenger::default());
        let mut session = Session::new(SessionConfig::default(), messenger.clone());
        session.register(jane()).unwrap();
        (session, messenger)
    }

    fn impact(g: f64) -> AccelerationReading {
        AccelerationReading::new(0.0, g * STANDARD_GRAVITY, 0.0)
    }

    fn home() -> Position {
        Position::new(12.9716, 77.5946)
    }

    /// ~0.001 degrees of latitude is ~111 m
    fn far() -> Position {
        Position::new(12.9726, 77.5946)
    }

    #[test]
    fn test_registration_rules() {
        let mut session = Session::new(SessionConfig::default(), Arc::new(RecordingMessenger::default()));

        let mut bad = jane();
        bad.mobile.clear();
        assert!(matches!(session.register(bad), Err(SessionError::InvalidProfile(_))));

        // Nothing fires before registration
        session.on_position(home().with_speed(KMH_20));
        assert!(session.on_motion(&impact(6.0)).is_none());
        assert!(session.trigger(TriggerReason::Impact).is_none());
        assert!(session.anchor().is_none());

        session.register(jane()).unwrap();
        assert_eq!(session.register(jane()), Err(SessionError::AlreadyRegistered));
        assert_eq!(session.anchor(), Some(&home().with_speed(KMH_20)), "anchored at last known fix");
    }

    #[test]
    fn test_impact_needs_speed() {
        let (mut session, _) = session();
        session.on_position(home());
        assert!(session.on_motion(&impact(6.0)).is_none(), "stationary drop");
        session.on_motion(&impact(1.0));

        session.on_position(home().with_speed(KMH_20));
        assert!(session.on_motion(&impact(3.4)).is_none(), "below threshold");
        assert_eq!(session.on_motion(&impact(4.2)), Some(1));
        assert_eq!(session.state(), AlertState::Countdown);
    }

    #[test]
    fn test_position_fix_reevaluates_impact() {
        let (mut session, _) = session();
        session.on_position(home());
        session.on_motion(&impact(5.0));
        assert_eq!(session.state(), AlertState::Monitoring);

        // Speed arrives with the next fix while the g-force is still high
        assert!(session.on_position(home().with_speed(KMH_20)).is_some());
        let reason = session.machine().cycle().context.as_ref().unwrap().reason;
        assert_eq!(reason, TriggerReason::Impact);
        assert_eq!(session.view().gforce, 0.0, "reading consumed by the cycle");
    }

    #[test]
    fn test_cancelled_impact_does_not_refire_from_fixes() {
        let (mut session, _) = session();
        let fix = home().with_speed(KMH_20);
        session.on_position(fix);
        assert_eq!(session.on_motion(&impact(4.2)), Some(1));
        assert!(session.cancel());

        // Location poll re-delivers the same fix with no new motion
        for _ in 0..3 {
            assert!(session.on_position(fix).is_none());
        }
        assert_eq!(session.state(), AlertState::Monitoring);
        assert_eq!(session.machine().cycle().id, 1);

        // A fresh crash reading still fires
        assert_eq!(session.on_motion(&impact(4.2)), Some(2));
    }

    #[test]
    fn test_countdown_readings_do_not_survive_cancel() {
        let (mut session, _) = session();
        let fix = home().with_speed(KMH_20);
        session.on_position(fix);
        session.on_motion(&impact(4.2)).unwrap();

        // Phone knocked about during the countdown
        session.on_motion(&impact(6.0));
        assert!(session.cancel());
        assert!(session.on_position(fix).is_none());
        assert_eq!(session.state(), AlertState::Monitoring);
    }

    #[test]
    fn test_movement_trigger() {
        let (mut session, _) = session();
        assert!(session.on_position(home()).is_none());
        assert_eq!(session.anchor(), Some(&home()));

        let id = session.on_position(far()).unwrap();
        let context = session.machine().cycle().context.clone().unwrap();
        assert_eq!(id, 1);
        assert_eq!(context.reason, TriggerReason::Movement);
        assert_eq!(context.position, Some(far()));
    }

    #[test]
    fn test_simultaneous_triggers_dedupe() {
        let (mut session, _) = session();
        session.on_position(home().with_speed(KMH_20));
        assert!(session.on_motion(&impact(6.0)).is_some());
        assert!(session.on_position(far().with_speed(KMH_20)).is_none());
        assert!(session.on_motion(&impact(7.0)).is_none());
        assert_eq!(session.machine().cycle().id, 1);
    }

    #[test]
    fn test_cancel_reanchors() {
        let (mut session, _) = session();
        session.on_position(home().with_speed(KMH_20));
        let id = session.on_motion(&impact(4.2)).unwrap();

        // Vehicle drifts during the countdown
        session.on_position(far());
        for _ in 0..7 {
            session.tick(id);
        }
        assert!(session.cancel());
        assert_eq!(session.state(), AlertState::Monitoring);
        assert_eq!(session.anchor(), Some(&far()));

        // The pre-incident anchor no longer causes a movement trigger
        assert!(session.on_position(far()).is_none());
        assert!(!session.cancel());
    }

    #[test]
    fn test_end_to_end_dispatch() {
        let (mut session, messenger) = session();
        session.on_position(home().with_speed(KMH_20));
        let id = session.on_motion(&impact(4.2)).unwrap();
        assert_eq!(session.view().remaining_ticks, 10);

        let mut request = None;
        for _ in 0..10 {
            if let TickOutcome::Dispatch(req) = session.tick(id) {
                request = Some(req);
            }
        }
        let request = request.expect("countdown should reach zero after 10 ticks");
        assert_eq!(session.state(), AlertState::Dispatching);

        let alert = session.alert_request(&request).unwrap();
        let composed = tokio_test::block_on(MessageDispatcher::offline().compose(&alert));
        assert!(session.complete_dispatch(id, composed));
        assert_eq!(session.state(), AlertState::Sent);

        let messages = session.view().messages.unwrap();
        for body in [&messages.family, &messages.ambulance] {
            assert!(!body.is_empty());
            assert!(body.chars().count() <= MAX_SMS_CHARS);
            assert!(body.contains("Jane Doe"));
            assert!(body.contains("+1-555-0199"));
        }

        // Family SMS went out automatically, exactly once
        let sent = messenger.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, Recipient::Family);
        assert_eq!(sent[0].to, "+1-555-0111");
        assert!(session.view().auto_dispatch_fired);
        assert!(!session.complete_dispatch(id, tokio_test::block_on(MessageDispatcher::offline().compose(&alert))));
        assert_eq!(messenger.sent().len(), 1);

        // Ambulance message is manual, and can be resent
        let intent = session.send_to(Recipient::Ambulance).unwrap();
        assert_eq!(intent.to, "+1-555-0199");
        session.send_to(Recipient::Ambulance).unwrap();
        assert_eq!(messenger.sent().len(), 3);
    }

    #[test]
    fn test_confirmation_flow_and_resume() {
        let (mut session, _) = session();
        session.on_position(home().with_speed(KMH_20));
        let id = session.on_motion(&impact(4.2)).unwrap();
        let req = session.force_dispatch().unwrap();
        let alert = session.alert_request(&req).unwrap();
        session.complete_dispatch(id, tokio_test::block_on(MessageDispatcher::offline().compose(&alert)));

        assert!(!session.resume());
        assert!(session.begin_confirmation());
        assert!(session.acknowledge(Recipient::Family));
        assert!(session.view().family_acknowledged);

        session.on_position(far());
        assert!(session.resume());
        let view = session.view();
        assert_eq!(view.state, AlertState::Monitoring);
        assert!(!view.family_acknowledged);
        assert!(view.messages.is_none());
        assert_eq!(view.anchor, Some(far()));
    }

    #[test]
    fn test_threshold_adjustment() {
        let (mut session, _) = session();
        assert!(session.set_threshold(5.0).is_ok());
        assert!(matches!(session.set_threshold(12.0), Err(SessionError::Detection(_))));

        session.on_position(home().with_speed(KMH_20));
        assert!(session.on_motion(&impact(4.2)).is_none());
        assert!(session.on_motion(&impact(5.5)).is_some());
    }

    #[test]
    fn test_alert_request_without_fix() {
        let (mut session, _) = session();
        let id = session.trigger(TriggerReason::Impact).unwrap();
        let req = session.force_dispatch().unwrap();
        assert_eq!(req.cycle_id, id);

        let alert = session.alert_request(&req).unwrap();
        assert!(alert.position.is_none());
        assert_eq!(alert.snapshot.total, 0.0);
        assert_eq!(alert.contacts.ambulance, "+1-555-0199");
    }
}
