//! airtype: control core of a voice-to-keystroke bridge.
//! Transcript snapshots from a speech engine are diffed, encoded as
//! keystroke frames, and streamed to a BLE keyboard peripheral; a power
//! controller dims the display during silence and wakes on a detected
//! tone. All mutable state lives on one control thread fed by a single
//! event queue; the platform seams (transport, speech engine, display
//! backlight, preference storage) are traits the embedding application
//! implements.

pub mod audio;
pub mod cancellation;
pub mod codec;
pub mod connection;
pub mod diff;
pub mod metrics;
pub mod phrase;
pub mod power;
pub mod prefs;
pub mod scheduler;
pub mod session;
pub mod speech;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use audio::goertzel::ToneConfig;
use audio::WakeToneListener;
use connection::{ConnectionConfig, ConnectionManager, LinkSnapshot};
use metrics::{MetricSummary, MetricsRegistry};
use phrase::PhraseMap;
use power::{DisplayBacklight, PowerConfig, PowerController, PowerState};
use prefs::{KeyValueStore, Preferences};
use scheduler::{ControlEvent, EventSender, Runtime, Scheduler, UserCommand};
use session::{DictationSession, SessionSnapshot};
use speech::SpeechRecognizer;
use transport::Transport;

/// Tunables for every subsystem, defaulted to the reference behavior.
#[derive(Default)]
pub struct BridgeConfig {
    pub connection: ConnectionConfig,
    pub power: PowerConfig,
    pub tone: ToneConfig,
    pub phrases: PhraseMap,
}

/// The assembled bridge. Owns the control thread; everything else reaches
/// it through commands, events, and watch subscriptions.
pub struct Bridge {
    scheduler: Arc<Scheduler>,
    metrics: Arc<MetricsRegistry>,
    control: Option<std::thread::JoinHandle<()>>,
    link_updates: watch::Receiver<LinkSnapshot>,
    session_updates: watch::Receiver<SessionSnapshot>,
    power_updates: watch::Receiver<PowerState>,
}

impl Bridge {
    /// Wire the components, bind the adapters to the event queue, and
    /// start the control thread.
    pub fn start(
        config: BridgeConfig,
        transport: Arc<dyn Transport>,
        speech: Arc<dyn SpeechRecognizer>,
        backlight: Arc<dyn DisplayBacklight>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new());
        let metrics = Arc::new(MetricsRegistry::new());

        transport.bind(scheduler.sender());
        speech.bind(scheduler.sender());

        let connection = ConnectionManager::new(
            config.connection,
            Arc::clone(&transport),
            Arc::clone(&scheduler),
            Arc::clone(&metrics),
        );
        let power = PowerController::new(
            config.power,
            backlight,
            Arc::clone(&scheduler),
            Arc::clone(&metrics),
        );
        let session = DictationSession::new(speech, config.phrases, Arc::clone(&metrics));
        let tone = WakeToneListener::new(config.tone, scheduler.sender());
        let prefs = Preferences::load(store);

        let link_updates = connection.subscribe();
        let session_updates = session.subscribe();
        let power_updates = power.subscribe();

        let runtime = Runtime {
            connection,
            power,
            session,
            tone,
            prefs,
        };
        let control = scheduler::run_control_loop(Arc::clone(&scheduler), runtime);

        info!("bridge started");
        Self {
            scheduler,
            metrics,
            control: Some(control),
            link_updates,
            session_updates,
            power_updates,
        }
    }

    /// Handle for adapters (and tests) to push events directly.
    pub fn sender(&self) -> EventSender {
        self.scheduler.sender()
    }

    /// Submit a user command.
    pub fn command(&self, command: UserCommand) {
        self.scheduler.submit(ControlEvent::Command(command));
    }

    /// Link snapshots, updated on every connection state change.
    pub fn link_updates(&self) -> watch::Receiver<LinkSnapshot> {
        self.link_updates.clone()
    }

    /// Session snapshots: recognized/transmitted text and errors.
    pub fn session_updates(&self) -> watch::Receiver<SessionSnapshot> {
        self.session_updates.clone()
    }

    /// Power state changes.
    pub fn power_updates(&self) -> watch::Receiver<PowerState> {
        self.power_updates.clone()
    }

    /// p50/p95/p99 summary of all recorded timing points.
    pub fn metrics_summary(&self) -> HashMap<String, MetricSummary> {
        self.metrics.summary()
    }

    /// Stop the control loop and wait for it to wind down.
    pub fn shutdown(mut self) {
        self.stop_control();
        info!("bridge stopped");
    }

    fn stop_control(&mut self) {
        if let Some(handle) = self.control.take() {
            self.scheduler.submit(ControlEvent::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop_control();
    }
}

/// Install the default tracing subscriber.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "airtype=debug".parse().unwrap()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}
