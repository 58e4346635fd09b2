//! Control-thread scheduler: one event queue, one timer wheel.
//! Every transport, speech, audio, timer, and user notification funnels
//! into a single crossbeam channel drained by a dedicated control thread
//! that owns all mutable session state, so no two callbacks can interleave.
//! Timed work (scan window, reconnect delays, silence tick, wake settle)
//! lives in the wheel instead of ad hoc per-feature timers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio::WakeToneListener;
use crate::codec::KeyCommand;
use crate::connection::ConnectionManager;
use crate::power::{PowerController, PowerDirective};
use crate::prefs::Preferences;
use crate::session::DictationSession;
use crate::transport::{LinkEvent, PeripheralId};

/// Commands from the embedding application (UI layer, tests).
#[derive(Debug, Clone)]
pub enum UserCommand {
    StartScan,
    StopScan,
    Connect(PeripheralId),
    Disconnect,
    StartDictation,
    StopDictation,
    SwitchLanguageSlot,
    SendEnter,
}

/// Everything the control thread can be woken by.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    Link(LinkEvent),
    /// Whole-string transcript snapshot from the speech engine.
    Transcript { generation: u64, text: String },
    /// Terminal end/error signal from the speech engine.
    SpeechEnded {
        generation: u64,
        error: Option<String>,
    },
    /// Confirmed wake tone from the audio pipeline.
    ToneConfirmed,
    Timer(TimerKind),
    Command(UserCommand),
    Shutdown,
}

/// The four logical timers of the system. One deadline slot each;
/// re-arming replaces the previous deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Discovery window before the single-candidate rule is evaluated.
    ScanWindow,
    /// Delay before a reconnect attempt re-enters scanning.
    Reconnect,
    /// Periodic silence check while dictation is active.
    SilenceTick,
    /// Settle delay between Waking and Active.
    WakeSettle,
}

impl TimerKind {
    const ALL: [TimerKind; 4] = [
        TimerKind::ScanWindow,
        TimerKind::Reconnect,
        TimerKind::SilenceTick,
        TimerKind::WakeSettle,
    ];

    fn slot(self) -> usize {
        match self {
            TimerKind::ScanWindow => 0,
            TimerKind::Reconnect => 1,
            TimerKind::SilenceTick => 2,
            TimerKind::WakeSettle => 3,
        }
    }
}

/// One-deadline-per-kind timer wheel.
struct TimerWheel {
    deadlines: [Option<Instant>; 4],
}

impl TimerWheel {
    fn new() -> Self {
        Self {
            deadlines: [None; 4],
        }
    }

    fn arm(&mut self, kind: TimerKind, deadline: Instant) {
        self.deadlines[kind.slot()] = Some(deadline);
    }

    fn disarm(&mut self, kind: TimerKind) {
        self.deadlines[kind.slot()] = None;
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Pop every expired timer, earliest first.
    fn take_expired(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut expired: Vec<(Instant, TimerKind)> = Vec::new();
        for kind in TimerKind::ALL {
            if let Some(deadline) = self.deadlines[kind.slot()] {
                if deadline <= now {
                    self.deadlines[kind.slot()] = None;
                    expired.push((deadline, kind));
                }
            }
        }
        expired.sort_by_key(|(deadline, _)| *deadline);
        expired.into_iter().map(|(_, kind)| kind).collect()
    }
}

/// Cloneable handle producers use to push events into the control queue.
#[derive(Clone)]
pub struct EventSender {
    tx: cb::Sender<ControlEvent>,
}

impl EventSender {
    pub fn submit(&self, event: ControlEvent) {
        // Send failure means the control loop is gone; nothing to do.
        let _ = self.tx.send(event);
    }
}

/// Owns the control queue and the timer wheel.
pub struct Scheduler {
    tx: cb::Sender<ControlEvent>,
    rx: Mutex<Option<cb::Receiver<ControlEvent>>>,
    timers: Mutex<TimerWheel>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, rx) = cb::unbounded();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            timers: Mutex::new(TimerWheel::new()),
        }
    }

    /// Submit an event (never blocks).
    pub fn submit(&self, event: ControlEvent) {
        let _ = self.tx.send(event);
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Arm a timer to fire after `delay`. Re-arming replaces the deadline.
    pub fn arm_timer(&self, kind: TimerKind, delay: Duration) {
        self.timers.lock().arm(kind, Instant::now() + delay);
        debug!(timer = ?kind, delay_ms = delay.as_millis() as u64, "timer_armed");
    }

    pub fn disarm_timer(&self, kind: TimerKind) {
        self.timers.lock().disarm(kind);
    }

    pub fn timer_armed(&self, kind: TimerKind) -> bool {
        self.timers.lock().deadlines[kind.slot()].is_some()
    }

    /// Time remaining until a timer fires, if armed.
    pub fn time_until(&self, kind: TimerKind) -> Option<Duration> {
        self.timers.lock().deadlines[kind.slot()]
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn until_next_deadline(&self, now: Instant) -> Option<Duration> {
        self.timers
            .lock()
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    fn take_expired(&self, now: Instant) -> Vec<TimerKind> {
        self.timers.lock().take_expired(now)
    }

    /// Take the control receiver (can only be called once, by the loop).
    pub fn take_receiver(&self) -> Option<cb::Receiver<ControlEvent>> {
        self.rx.lock().take()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// All mutable state of the bridge, owned by the control thread.
pub(crate) struct Runtime {
    pub connection: ConnectionManager,
    pub power: PowerController,
    pub session: DictationSession,
    pub tone: WakeToneListener,
    pub prefs: Preferences,
}

/// Upper bound on a park when no timer is armed.
const IDLE_PARK: Duration = Duration::from_secs(60);

/// Control loop: runs on a dedicated OS thread. Drains the event queue and
/// fires expired timers, dispatching both into the state machines.
pub(crate) fn run_control_loop(
    scheduler: Arc<Scheduler>,
    mut runtime: Runtime,
) -> std::thread::JoinHandle<()> {
    let rx = scheduler
        .take_receiver()
        .expect("control receiver already taken");

    std::thread::Builder::new()
        .name("control".into())
        .spawn(move || {
            info!("control loop started");
            loop {
                let timeout = scheduler
                    .until_next_deadline(Instant::now())
                    .unwrap_or(IDLE_PARK);

                match rx.recv_timeout(timeout) {
                    Ok(ControlEvent::Shutdown) => break,
                    Ok(event) => dispatch(&mut runtime, event),
                    Err(cb::RecvTimeoutError::Timeout) => {}
                    Err(cb::RecvTimeoutError::Disconnected) => break,
                }

                for kind in scheduler.take_expired(Instant::now()) {
                    dispatch(&mut runtime, ControlEvent::Timer(kind));
                }
            }
            stop_dictation(&mut runtime);
            runtime.tone.disarm();
            info!("control loop exiting");
        })
        .expect("failed to spawn control thread")
}

fn dispatch(rt: &mut Runtime, event: ControlEvent) {
    match event {
        ControlEvent::Link(link_event) => {
            let had_link = rt.connection.is_connected();
            rt.connection.handle_link_event(link_event);
            if had_link && !rt.connection.is_connected() && rt.session.is_active() {
                info!("link lost, ending dictation session");
                stop_dictation(rt);
            }
        }

        ControlEvent::Transcript { generation, text } => {
            if !rt.session.accepts(generation) {
                debug!(generation, "stale transcript dropped");
                return;
            }
            if !rt.power.is_active() {
                debug!("transcript ignored while display dimmed");
                return;
            }
            rt.power.on_activity(Instant::now());
            rt.session.apply_snapshot(&mut rt.connection, &text);
        }

        ControlEvent::SpeechEnded { generation, error } => {
            if rt.session.on_speech_ended(generation, error) {
                let directives = rt.power.end_session();
                apply_power_directives(rt, directives);
            }
        }

        ControlEvent::ToneConfirmed => {
            let directives = rt.power.on_tone_confirmed(Instant::now());
            apply_power_directives(rt, directives);
        }

        ControlEvent::Timer(TimerKind::ScanWindow) => rt.connection.on_scan_window_elapsed(),
        ControlEvent::Timer(TimerKind::Reconnect) => rt.connection.on_retry_elapsed(),
        ControlEvent::Timer(TimerKind::SilenceTick) => {
            let directives = rt.power.on_silence_tick(Instant::now());
            apply_power_directives(rt, directives);
        }
        ControlEvent::Timer(TimerKind::WakeSettle) => {
            let directives = rt.power.on_settle_elapsed(Instant::now());
            apply_power_directives(rt, directives);
        }

        ControlEvent::Command(command) => handle_command(rt, command),

        // Consumed by the loop before dispatch.
        ControlEvent::Shutdown => {}
    }
}

fn handle_command(rt: &mut Runtime, command: UserCommand) {
    match command {
        UserCommand::StartScan => rt.connection.start_scan(),
        UserCommand::StopScan => rt.connection.stop_scan(),
        UserCommand::Connect(id) => rt.connection.connect(id),
        UserCommand::Disconnect => {
            stop_dictation(rt);
            rt.connection.disconnect();
        }
        UserCommand::StartDictation => start_dictation(rt),
        UserCommand::StopDictation => stop_dictation(rt),
        UserCommand::SwitchLanguageSlot => {
            let slot = rt.prefs.switch_slot();
            info!(
                slot,
                language = rt.prefs.active_language(),
                "language_slot_switched"
            );
        }
        UserCommand::SendEnter => {
            if let Err(e) = rt.connection.deliver(KeyCommand::Enter) {
                warn!(error = %e, "enter keystroke not delivered");
            }
        }
    }
}

fn start_dictation(rt: &mut Runtime) {
    if !rt.connection.is_ready() {
        warn!("dictation requires a ready link");
        return;
    }
    if rt.session.is_active() {
        return;
    }
    let language = rt.prefs.active_language().to_string();
    match rt.session.start(&language) {
        Ok(()) => rt.power.begin_session(Instant::now()),
        Err(e) => warn!(error = %e, "could not start dictation"),
    }
}

fn stop_dictation(rt: &mut Runtime) {
    if !rt.session.is_active() {
        return;
    }
    rt.session.stop();
    let directives = rt.power.end_session();
    apply_power_directives(rt, directives);
}

/// Execute the cross-component effects a power transition asks for. A
/// failed resume unwinds through `end_session`, whose directives join the
/// queue.
fn apply_power_directives(rt: &mut Runtime, directives: Vec<PowerDirective>) {
    let mut queue = std::collections::VecDeque::from(directives);
    while let Some(directive) = queue.pop_front() {
        match directive {
            PowerDirective::SuspendTranscription => rt.session.suspend(),
            PowerDirective::ResumeTranscription => {
                if !rt.session.resume() {
                    warn!("resume failed, ending session");
                    rt.session.stop();
                    queue.extend(rt.power.end_session());
                }
            }
            PowerDirective::ArmToneDetector => rt.tone.arm(),
            PowerDirective::DisarmToneDetector => rt.tone.disarm(),
        }
    }
}
