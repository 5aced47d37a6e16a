//! Async driver for a [`Session`].
//!
//! Owns the countdown timer task, the location poller and the dispatcher
//! hand-off. All session mutations go through the write half of one
//! `RwLock`; message generation runs without holding it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{Session, SessionConfig, SessionError, SessionView};
use crate::alert::{AlertState, DispatchRequest, TickOutcome};
use crate::api::websocket::{WsBroadcaster, WsEvent};
use crate::dispatch::sms::{Messenger, SmsIntent};
use crate::dispatch::MessageDispatcher;
use crate::types::{AccelerationReading, Position, Profile, Recipient, TriggerReason};

/// Source of the device's current position
#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn current_fix(&self) -> Option<Position>;
}

/// Holds the most recently pushed fix
pub struct LatestFix {
    sender: watch::Sender<Option<Position>>,
}

impl LatestFix {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    pub fn push(&self, position: Position) {
        self.sender.send_replace(Some(position));
    }

    pub fn latest(&self) -> Option<Position> {
        *self.sender.borrow()
    }
}

impl Default for LatestFix {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocationSource for LatestFix {
    async fn current_fix(&self) -> Option<Position> {
        self.latest()
    }
}

/// Countdown timer task for one alert cycle
struct CountdownTimer {
    cycle_id: u64,
    handle: JoinHandle<()>,
}

pub struct SessionRuntime {
    session: RwLock<Session>,
    dispatcher: MessageDispatcher,
    broadcaster: WsBroadcaster,
    location: Arc<LatestFix>,
    /// Locked only while the session write lock is held
    countdown: Mutex<Option<CountdownTimer>>,
    tick_interval: Duration,
    poll_interval: Duration,
}

impl SessionRuntime {
    pub fn new(
        config: SessionConfig,
        dispatcher: MessageDispatcher,
        messenger: Arc<dyn Messenger>,
    ) -> Arc<Self> {
        let tick_interval = config.tick_interval;
        let poll_interval = config.location_poll_interval;
        Arc::new(Self {
            session: RwLock::new(Session::new(config, messenger)),
            dispatcher,
            broadcaster: WsBroadcaster::new(256),
            location: Arc::new(LatestFix::new()),
            countdown: Mutex::new(None),
            tick_interval,
            poll_interval,
        })
    }

    pub fn broadcaster(&self) -> &WsBroadcaster {
        &self.broadcaster
    }

    /// Feed for device-pushed position fixes
    pub fn location_feed(&self) -> Arc<LatestFix> {
        self.location.clone()
    }

    pub fn dispatcher_online(&self) -> bool {
        self.dispatcher.is_online()
    }

    pub async fn view(&self) -> SessionView {
        self.session.read().await.view()
    }

    pub async fn state(&self) -> AlertState {
        self.session.read().await.state()
    }

    pub async fn register(&self, profile: Profile) -> Result<(), SessionError> {
        self.session.write().await.register(profile)?;
        self.publish().await;
        Ok(())
    }

    pub async fn set_threshold(&self, gforce: f64) -> Result<(), SessionError> {
        self.session.write().await.set_threshold(gforce)?;
        self.publish().await;
        Ok(())
    }

    /// Evaluate one accelerometer sample
    pub async fn ingest_motion(self: &Arc<Self>, reading: AccelerationReading) -> Option<u64> {
        let started = self.start_cycle_if(move |session| session.on_motion(&reading)).await;
        let view = self.view().await;
        self.broadcaster.broadcast(WsEvent::Telemetry {
            gforce: view.gforce,
            speed: view.speed,
        });
        started
    }

    /// Record a device fix; it is evaluated on the next location poll
    pub fn push_fix(&self, position: Position) {
        self.location.push(position);
    }

    /// Evaluate one position fix immediately
    pub async fn ingest_position(self: &Arc<Self>, position: Position) -> Option<u64> {
        self.start_cycle_if(move |session| session.on_position(position)).await
    }

    /// Manual trigger ("simulate impact")
    pub async fn trigger_manual(self: &Arc<Self>, reason: TriggerReason) -> Option<u64> {
        self.start_cycle_if(move |session| session.trigger(reason)).await
    }

    /// Run `evaluate` under the write lock and arm the timer before releasing it
    async fn start_cycle_if<F>(self: &Arc<Self>, evaluate: F) -> Option<u64>
    where
        F: FnOnce(&mut Session) -> Option<u64> + Send,
    {
        let started = {
            let mut session = self.session.write().await;
            let started = evaluate(&mut *session);
            if let Some(cycle_id) = started {
                self.arm_countdown(cycle_id).await;
            }
            started
        };

        if let Some(cycle_id) = started {
            warn!("🚨 Alert cycle #{} started, countdown running", cycle_id);
            self.publish().await;
        }
        started
    }

    /// Spawn the cycle's timer; ticks once per `tick_interval`.
    /// Caller holds the session write lock.
    async fn arm_countdown(self: &Arc<Self>, cycle_id: u64) {
        let runtime = self.clone();
        let period = self.tick_interval;

        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let outcome = runtime.session.write().await.tick(cycle_id);
                match outcome {
                    TickOutcome::Counting(remaining) => {
                        debug!("⏳ Cycle #{}: {}s left", cycle_id, remaining);
                        runtime.publish().await;
                    }
                    TickOutcome::Dispatch(request) => {
                        runtime.publish().await;
                        runtime.spawn_dispatch(request);
                        break;
                    }
                    TickOutcome::Ignored => break,
                }
            }
        });

        let timer = CountdownTimer { cycle_id, handle };
        if let Some(stale) = self.countdown.lock().await.replace(timer) {
            debug!("Dropping timer of finished cycle #{}", stale.cycle_id);
            stale.handle.abort();
        }
    }

    /// Abort the timer if it belongs to `cycle_id`.
    /// Caller holds the session write lock.
    async fn stop_countdown(&self, cycle_id: u64) {
        let mut timer = self.countdown.lock().await;
        let owned = timer.as_ref().map(|t| t.cycle_id);
        match owned {
            Some(id) if id == cycle_id => {
                if let Some(t) = timer.take() {
                    t.handle.abort();
                }
            }
            Some(id) => debug!("Timer belongs to cycle #{}, not #{}", id, cycle_id),
            None => {}
        }
    }

    /// Whether a countdown timer task is still running
    pub async fn countdown_active(&self) -> bool {
        self.countdown
            .lock()
            .await
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    fn spawn_dispatch(self: &Arc<Self>, request: DispatchRequest) {
        let runtime = self.clone();
        tokio::spawn(async move {
            runtime.run_dispatch(request).await;
        });
    }

    async fn run_dispatch(&self, request: DispatchRequest) {
        let alert = match self.session.read().await.alert_request(&request) {
            Ok(alert) => alert,
            Err(e) => {
                error!("Cannot compose messages for cycle #{}: {}", request.cycle_id, e);
                return;
            }
        };

        info!("📨 Composing emergency messages for cycle #{}", request.cycle_id);
        let composed = self.dispatcher.compose(&alert).await;
        let source = composed.source;

        if self.session.write().await.complete_dispatch(request.cycle_id, composed) {
            info!("✅ Cycle #{} messages ready ({:?})", request.cycle_id, source);
        } else {
            warn!("Discarded messages for stale cycle #{}", request.cycle_id);
        }
        self.publish().await;
    }

    /// "I'm OK": stop the countdown and return to monitoring
    pub async fn cancel(&self) -> bool {
        {
            let mut session = self.session.write().await;
            let cycle_id = session.machine().cycle().id;
            if !session.cancel() {
                return false;
            }
            self.stop_countdown(cycle_id).await;
        }
        info!("🛑 Alert cancelled by driver");
        self.publish().await;
        true
    }

    /// "Send now": skip the rest of the countdown
    pub async fn force_dispatch(self: &Arc<Self>) -> bool {
        let request = {
            let mut session = self.session.write().await;
            let Some(request) = session.force_dispatch() else {
                return false;
            };
            self.stop_countdown(request.cycle_id).await;
            request
        };
        info!("⏩ Countdown skipped for cycle #{}", request.cycle_id);
        self.publish().await;
        self.spawn_dispatch(request);
        true
    }

    pub async fn confirm(&self) -> bool {
        let accepted = self.session.write().await.begin_confirmation();
        if accepted {
            self.publish().await;
        }
        accepted
    }

    pub async fn acknowledge(&self, recipient: Recipient) -> bool {
        let accepted = self.session.write().await.acknowledge(recipient);
        if accepted {
            self.publish().await;
        }
        accepted
    }

    pub async fn send_to(&self, recipient: Recipient) -> Option<SmsIntent> {
        self.session.read().await.send_to(recipient)
    }

    pub async fn resume(&self) -> bool {
        let accepted = self.session.write().await.resume();
        if accepted {
            info!("🟢 Monitoring resumed");
            self.publish().await;
        }
        accepted
    }

    async fn publish(&self) {
        let view = self.session.read().await.view();
        self.broadcaster.broadcast(WsEvent::Session { view });
    }

    /// Evaluate the source's current fix every `location_poll_interval`
    pub fn spawn_location_poller(self: &Arc<Self>, source: Arc<dyn LocationSource>) -> JoinHandle<()> {
        let runtime = self.clone();
        let period = self.poll_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match source.current_fix().await {
                    Some(fix) => {
                        runtime.ingest_position(fix).await;
                    }
                    None => debug!("📍 No position fix yet"),
                }
            }
        })
    }
}
