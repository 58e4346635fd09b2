//! Display power controller.
//! Long dictation sessions spend most of their time listening, so after a
//! silence threshold the display dims and transcription is suspended, with
//! the Goertzel tone detector as the low-power wake path. States cycle
//! Active → IdleDimmed → Waking → Active for the life of a session; the
//! controller is forced back to Active when the session stops or the link
//! drops.
//!
//! Transitions return [`PowerDirective`]s for the dispatcher to execute;
//! display brightness is written here directly because this controller is
//! its only writer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::metrics::{metric_names, MetricsRegistry};
use crate::scheduler::{Scheduler, TimerKind};

/// Seam to the platform's display brightness control.
pub trait DisplayBacklight: Send + Sync {
    /// Current brightness in [0.0, 1.0].
    fn brightness(&self) -> f32;
    fn set_brightness(&self, level: f32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PowerState {
    Active,
    IdleDimmed,
    Waking,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::Active => write!(f, "Active"),
            PowerState::IdleDimmed => write!(f, "IdleDimmed"),
            PowerState::Waking => write!(f, "Waking"),
        }
    }
}

impl PowerState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: PowerState) -> bool {
        matches!(
            (self, next),
            (PowerState::Active, PowerState::IdleDimmed)
                | (PowerState::IdleDimmed, PowerState::Waking)
                | (PowerState::Waking, PowerState::Active)
                // Forced back to Active on session stop / disconnect.
                | (_, PowerState::Active)
        )
    }
}

/// Power tunables.
#[derive(Debug, Clone)]
pub struct PowerConfig {
    /// Silence duration after which the display dims.
    pub silence_timeout: Duration,
    /// Period of the silence check while Active.
    pub tick_interval: Duration,
    /// Settle delay between Waking and Active, giving the speech engine
    /// time to reinitialize before its output is accepted.
    pub settle_delay: Duration,
    /// Brightness floor while dimmed.
    pub dim_level: f32,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            silence_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_secs(1),
            settle_delay: Duration::from_millis(500),
            dim_level: 0.05,
        }
    }
}

/// Cross-component effects of a power transition, executed by the
/// dispatcher on the control thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerDirective {
    SuspendTranscription,
    ResumeTranscription,
    ArmToneDetector,
    DisarmToneDetector,
}

pub struct PowerController {
    config: PowerConfig,
    backlight: Arc<dyn DisplayBacklight>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<MetricsRegistry>,

    state: PowerState,
    /// True while a dictation session is running.
    running: bool,
    last_activity: Instant,
    /// Captured on Active → IdleDimmed, consumed on the way back out.
    saved_brightness: Option<f32>,
    dimmed_at: Option<Instant>,
    waking_at: Option<Instant>,

    state_tx: watch::Sender<PowerState>,
    state_rx: watch::Receiver<PowerState>,
}

impl PowerController {
    pub fn new(
        config: PowerConfig,
        backlight: Arc<dyn DisplayBacklight>,
        scheduler: Arc<Scheduler>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(PowerState::Active);
        Self {
            config,
            backlight,
            scheduler,
            metrics,
            state: PowerState::Active,
            running: false,
            last_activity: Instant::now(),
            saved_brightness: None,
            dimmed_at: None,
            waking_at: None,
            state_tx,
            state_rx,
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == PowerState::Active
    }

    /// Subscribe to power state changes.
    pub fn subscribe(&self) -> watch::Receiver<PowerState> {
        self.state_rx.clone()
    }

    /// A dictation session started: begin watching for silence.
    pub fn begin_session(&mut self, now: Instant) {
        if self.running {
            return;
        }
        self.running = true;
        self.last_activity = now;
        self.transition(PowerState::Active);
        self.scheduler
            .arm_timer(TimerKind::SilenceTick, self.config.tick_interval);
        debug!("power controller engaged");
    }

    /// Session over (stop, speech end, or disconnect): force Active,
    /// undoing whatever the idle path changed.
    pub fn end_session(&mut self) -> Vec<PowerDirective> {
        if !self.running {
            return Vec::new();
        }
        self.running = false;
        self.scheduler.disarm_timer(TimerKind::SilenceTick);
        self.scheduler.disarm_timer(TimerKind::WakeSettle);

        let mut directives = Vec::new();
        if self.state == PowerState::IdleDimmed {
            self.restore_brightness();
            directives.push(PowerDirective::DisarmToneDetector);
        }
        self.dimmed_at = None;
        self.waking_at = None;
        self.transition(PowerState::Active);
        debug!("power controller disengaged");
        directives
    }

    /// Transcript activity feeds the silence timer. Not expected outside
    /// Active; ignored elsewhere.
    pub fn on_activity(&mut self, now: Instant) {
        if self.running && self.state == PowerState::Active {
            self.last_activity = now;
        } else {
            debug!(state = %self.state, "activity ignored");
        }
    }

    /// Periodic silence check. Entering IdleDimmed suspends transcription,
    /// dims the display, and arms the tone detector, each exactly once.
    pub fn on_silence_tick(&mut self, now: Instant) -> Vec<PowerDirective> {
        if !self.running || self.state != PowerState::Active {
            return Vec::new();
        }
        if now.duration_since(self.last_activity) <= self.config.silence_timeout {
            self.scheduler
                .arm_timer(TimerKind::SilenceTick, self.config.tick_interval);
            return Vec::new();
        }

        self.transition(PowerState::IdleDimmed);
        let current = self.backlight.brightness();
        self.saved_brightness = Some(current);
        self.backlight.set_brightness(self.config.dim_level);
        self.dimmed_at = Some(now);
        info!(
            saved_brightness = current,
            dim_level = self.config.dim_level,
            "silence timeout, display dimmed"
        );
        vec![
            PowerDirective::SuspendTranscription,
            PowerDirective::ArmToneDetector,
        ]
    }

    /// Confirmed wake tone. Only meaningful while dimmed; single spurious
    /// blocks never reach here (the detector debounces).
    pub fn on_tone_confirmed(&mut self, now: Instant) -> Vec<PowerDirective> {
        if self.state != PowerState::IdleDimmed {
            debug!(state = %self.state, "tone confirmation ignored");
            return Vec::new();
        }
        if let Some(dimmed) = self.dimmed_at.take() {
            self.metrics.record(
                metric_names::TONE_CONFIRM,
                now.duration_since(dimmed).as_micros() as f64,
            );
        }
        self.transition(PowerState::Waking);
        self.restore_brightness();
        self.waking_at = Some(now);
        self.scheduler
            .arm_timer(TimerKind::WakeSettle, self.config.settle_delay);
        info!("wake tone confirmed, resuming");
        vec![
            PowerDirective::DisarmToneDetector,
            PowerDirective::ResumeTranscription,
        ]
    }

    /// Settle delay elapsed: the speech engine had time to reinitialize,
    /// so its output is accepted again.
    pub fn on_settle_elapsed(&mut self, now: Instant) -> Vec<PowerDirective> {
        if self.state != PowerState::Waking {
            return Vec::new();
        }
        if let Some(waking) = self.waking_at.take() {
            self.metrics.record(
                metric_names::WAKE_TO_ACTIVE,
                now.duration_since(waking).as_micros() as f64,
            );
        }
        self.transition(PowerState::Active);
        self.last_activity = now;
        self.scheduler
            .arm_timer(TimerKind::SilenceTick, self.config.tick_interval);
        Vec::new()
    }

    fn restore_brightness(&mut self) {
        if let Some(level) = self.saved_brightness.take() {
            self.backlight.set_brightness(level);
            debug!(level, "brightness restored");
        }
    }

    /// Attempt a state transition; same-state requests are no-ops and
    /// invalid edges are logged and skipped.
    fn transition(&mut self, next: PowerState) {
        let current = self.state;
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "invalid power transition");
            return;
        }
        self.state = next;
        let _ = self.state_tx.send(next);
        info!(from = %current, to = %next, "power_transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct MockBacklight {
        level: Mutex<f32>,
        sets: Mutex<Vec<f32>>,
    }

    impl MockBacklight {
        fn new(level: f32) -> Self {
            Self {
                level: Mutex::new(level),
                sets: Mutex::new(Vec::new()),
            }
        }
    }

    impl DisplayBacklight for MockBacklight {
        fn brightness(&self) -> f32 {
            *self.level.lock()
        }

        fn set_brightness(&self, level: f32) {
            *self.level.lock() = level;
            self.sets.lock().push(level);
        }
    }

    struct Fixture {
        power: PowerController,
        backlight: Arc<MockBacklight>,
        scheduler: Arc<Scheduler>,
        start: Instant,
    }

    fn fixture() -> Fixture {
        let backlight = Arc::new(MockBacklight::new(0.8));
        let scheduler = Arc::new(Scheduler::new());
        let mut power = PowerController::new(
            PowerConfig::default(),
            Arc::clone(&backlight) as Arc<dyn DisplayBacklight>,
            Arc::clone(&scheduler),
            Arc::new(MetricsRegistry::new()),
        );
        let start = Instant::now();
        power.begin_session(start);
        Fixture {
            power,
            backlight,
            scheduler,
            start,
        }
    }

    fn past_timeout(fx: &Fixture) -> Instant {
        fx.start + Duration::from_secs(6)
    }

    #[test]
    fn silence_dims_and_suspends_exactly_once() {
        let mut fx = fixture();

        let directives = fx.power.on_silence_tick(past_timeout(&fx));
        assert_eq!(
            directives,
            vec![
                PowerDirective::SuspendTranscription,
                PowerDirective::ArmToneDetector
            ]
        );
        assert_eq!(fx.power.state(), PowerState::IdleDimmed);
        assert!((fx.backlight.brightness() - 0.05).abs() < f32::EPSILON);

        // A stale tick while dimmed changes nothing.
        let again = fx.power.on_silence_tick(past_timeout(&fx) + Duration::from_secs(1));
        assert!(again.is_empty());
        assert_eq!(fx.backlight.sets.lock().len(), 1, "dimmed exactly once");
    }

    #[test]
    fn activity_defers_dimming() {
        let mut fx = fixture();

        let tick1 = fx.start + Duration::from_secs(3);
        assert!(fx.power.on_silence_tick(tick1).is_empty());
        assert!(fx.scheduler.timer_armed(TimerKind::SilenceTick), "tick re-armed");

        fx.power.on_activity(fx.start + Duration::from_secs(4));
        // Six seconds in, but only two since the last activity.
        assert!(fx.power.on_silence_tick(past_timeout(&fx)).is_empty());
        assert_eq!(fx.power.state(), PowerState::Active);
    }

    #[test]
    fn tone_wakes_and_restores_saved_brightness() {
        let mut fx = fixture();
        fx.power.on_silence_tick(past_timeout(&fx));

        let directives = fx
            .power
            .on_tone_confirmed(past_timeout(&fx) + Duration::from_secs(30));
        assert_eq!(
            directives,
            vec![
                PowerDirective::DisarmToneDetector,
                PowerDirective::ResumeTranscription
            ]
        );
        assert_eq!(fx.power.state(), PowerState::Waking);
        // The exact brightness captured at dim time comes back.
        assert!((fx.backlight.brightness() - 0.8).abs() < f32::EPSILON);
        assert!(fx.scheduler.timer_armed(TimerKind::WakeSettle));

        let settle = fx
            .power
            .on_settle_elapsed(past_timeout(&fx) + Duration::from_secs(31));
        assert!(settle.is_empty());
        assert_eq!(fx.power.state(), PowerState::Active);
        assert!(fx.scheduler.timer_armed(TimerKind::SilenceTick));
    }

    #[test]
    fn tone_ignored_unless_dimmed() {
        let mut fx = fixture();
        assert!(fx.power.on_tone_confirmed(fx.start).is_empty());
        assert_eq!(fx.power.state(), PowerState::Active);
    }

    #[test]
    fn settle_ignored_unless_waking() {
        let mut fx = fixture();
        assert!(fx.power.on_settle_elapsed(fx.start).is_empty());

        fx.power.on_silence_tick(past_timeout(&fx));
        // Still dimmed: a stray settle timer must not skip Waking.
        assert!(fx.power.on_settle_elapsed(past_timeout(&fx)).is_empty());
        assert_eq!(fx.power.state(), PowerState::IdleDimmed);
    }

    #[test]
    fn activity_ignored_while_dimmed() {
        let mut fx = fixture();
        fx.power.on_silence_tick(past_timeout(&fx));
        fx.power.on_activity(past_timeout(&fx) + Duration::from_secs(1));
        assert_eq!(fx.power.state(), PowerState::IdleDimmed);
    }

    #[test]
    fn end_session_restores_from_dimmed() {
        let mut fx = fixture();
        fx.power.on_silence_tick(past_timeout(&fx));

        let directives = fx.power.end_session();
        assert_eq!(directives, vec![PowerDirective::DisarmToneDetector]);
        assert_eq!(fx.power.state(), PowerState::Active);
        assert!((fx.backlight.brightness() - 0.8).abs() < f32::EPSILON);
        assert!(!fx.scheduler.timer_armed(TimerKind::SilenceTick));
        assert!(!fx.scheduler.timer_armed(TimerKind::WakeSettle));
    }

    #[test]
    fn end_session_without_session_is_noop() {
        let backlight = Arc::new(MockBacklight::new(0.8));
        let scheduler = Arc::new(Scheduler::new());
        let mut power = PowerController::new(
            PowerConfig::default(),
            Arc::clone(&backlight) as Arc<dyn DisplayBacklight>,
            scheduler,
            Arc::new(MetricsRegistry::new()),
        );
        assert!(power.end_session().is_empty());
        assert!(backlight.sets.lock().is_empty());
    }

    #[test]
    fn full_power_cycle_publishes_states() {
        let mut fx = fixture();
        let rx = fx.power.subscribe();

        fx.power.on_silence_tick(past_timeout(&fx));
        assert_eq!(*rx.borrow(), PowerState::IdleDimmed);

        fx.power.on_tone_confirmed(past_timeout(&fx) + Duration::from_secs(1));
        assert_eq!(*rx.borrow(), PowerState::Waking);

        fx.power.on_settle_elapsed(past_timeout(&fx) + Duration::from_secs(2));
        assert_eq!(*rx.borrow(), PowerState::Active);
    }
}
