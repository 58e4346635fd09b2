//! Dictation session orchestration.
//! Routes transcript snapshots through the phrase stage and the diff
//! engine, then delivers the resulting keystroke commands over the link:
//! delete frames first, then insert chunks, in order. Owns the session
//! generation so snapshots in flight across a stop, suspend, or resume are
//! dropped instead of racing the state reset.
//!
//! Suspend/resume (the idle/wake path) closes the current diff segment:
//! the remote keeps its text, the diff re-anchors at empty, and the next
//! segment joins with a single space that is itself tracked in diff space,
//! so backspace counts stay aligned: no data loss, no duplicates.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cancellation::SessionGeneration;
use crate::codec::KeyCommand;
use crate::connection::ConnectionManager;
use crate::diff::DiffEngine;
use crate::metrics::{metric_names, MetricsRegistry, SessionIds};
use crate::phrase::{KeyAction, PhraseMap, Segment};
use crate::speech::{SpeechError, SpeechRecognizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Inactive,
    Recording,
    /// Power-idle: the engine is stopped but the session survives and the
    /// remote text is kept.
    Suspended,
}

/// Snapshot of the session published on every change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub recording: bool,
    /// What the speech engine last heard.
    pub recognized: String,
    /// What the remote buffer should now contain.
    pub transmitted: String,
    pub language: String,
    pub error: Option<String>,
}

pub struct DictationSession {
    speech: Arc<dyn SpeechRecognizer>,
    phrases: PhraseMap,
    diff: DiffEngine,
    generation: SessionGeneration,
    metrics: Arc<MetricsRegistry>,

    state: SessionState,
    /// Text of earlier segments, already final on the remote side.
    committed: String,
    language: String,
    ids: Option<SessionIds>,

    snapshot_tx: watch::Sender<SessionSnapshot>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
}

impl DictationSession {
    pub fn new(
        speech: Arc<dyn SpeechRecognizer>,
        phrases: PhraseMap,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        Self {
            speech,
            phrases,
            diff: DiffEngine::new(),
            generation: SessionGeneration::new(),
            metrics,
            state: SessionState::Inactive,
            committed: String::new(),
            language: String::new(),
            ids: None,
            snapshot_tx,
            snapshot_rx,
        }
    }

    /// Subscribe to session snapshots.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn is_active(&self) -> bool {
        self.state != SessionState::Inactive
    }

    pub fn is_recording(&self) -> bool {
        self.state == SessionState::Recording
    }

    /// True when a transcript stamped with `generation` should be applied.
    pub fn accepts(&self, generation: u64) -> bool {
        self.state == SessionState::Recording && self.generation.accepts(generation)
    }

    /// Begin a recording session. Resets diff state first so nothing stale
    /// leaks into the new session.
    pub fn start(&mut self, language: &str) -> Result<(), SpeechError> {
        if self.state != SessionState::Inactive {
            return Ok(());
        }
        self.diff.reset();
        self.committed.clear();
        let (_token, generation) = self.generation.advance();
        let ids = SessionIds::new(generation);
        self.language = language.to_string();

        if let Err(e) = self.speech.start(language, generation) {
            self.publish(Some(e.to_string()));
            return Err(e);
        }

        info!(
            session_id = %ids.session_id,
            trace_id = %ids.trace_id,
            language,
            "dictation_session_started"
        );
        self.ids = Some(ids);
        self.state = SessionState::Recording;
        self.publish(None);
        Ok(())
    }

    /// Stop the session. The generation advance is the stop-grace debounce:
    /// snapshots already in flight are dropped on arrival.
    pub fn stop(&mut self) {
        if self.state == SessionState::Inactive {
            return;
        }
        self.speech.stop();
        self.generation.advance();
        self.diff.reset();
        self.committed.clear();
        self.state = SessionState::Inactive;
        if let Some(ids) = self.ids.take() {
            info!(session_id = %ids.session_id, "dictation_session_stopped");
        }
        self.publish(None);
    }

    /// Power-idle entry: stop the engine but keep the session. The current
    /// segment is committed so the diff can re-anchor on resume.
    pub fn suspend(&mut self) {
        if self.state != SessionState::Recording {
            return;
        }
        self.speech.stop();
        self.generation.advance();
        self.committed.push_str(self.diff.acknowledged());
        self.diff.reset();
        self.state = SessionState::Suspended;
        info!("dictation suspended");
        self.publish(None);
    }

    /// Power-wake: restart the engine on a fresh transcript and a fresh
    /// generation. Returns false when the engine refuses, in which case the
    /// caller ends the session.
    pub fn resume(&mut self) -> bool {
        if self.state != SessionState::Suspended {
            return self.state == SessionState::Recording;
        }
        let (_token, generation) = self.generation.advance();
        match self.speech.start(&self.language, generation) {
            Ok(()) => {
                self.state = SessionState::Recording;
                info!("dictation resumed");
                self.publish(None);
                true
            }
            Err(e) => {
                warn!(error = %e, "speech engine refused to resume");
                self.publish(Some(e.to_string()));
                self.state = SessionState::Inactive;
                false
            }
        }
    }

    /// Terminal event from the speech engine. Returns true when it ended
    /// the live session (so the caller can unwind power state).
    pub fn on_speech_ended(&mut self, generation: u64, error: Option<String>) -> bool {
        if !self.generation.accepts(generation) || self.state == SessionState::Inactive {
            debug!(generation, "stale speech end dropped");
            return false;
        }
        match &error {
            Some(msg) => warn!(error = %msg, "speech engine ended with error"),
            None => info!("speech engine ended"),
        }
        self.generation.advance();
        self.diff.reset();
        self.committed.clear();
        self.state = SessionState::Inactive;
        self.ids = None;
        self.publish(error);
        true
    }

    /// Apply one transcript snapshot: phrase stage → diff → wire commands.
    /// Deletes go out before inserts; insert runs split around phrase
    /// stand-ins into their combo frames. Delete counts above the protocol
    /// ceiling become multiple Backspace frames.
    pub fn apply_snapshot(&mut self, link: &mut ConnectionManager, raw: &str) {
        let wire_span = self.metrics.span(metric_names::SNAPSHOT_TO_WIRE);

        let clean = self.phrases.apply(raw);
        let mut target = String::with_capacity(clean.len() + 1);
        if !self.committed.is_empty() && !clean.is_empty() {
            // Segment joiner; lives in diff space so deletes stay aligned.
            target.push(' ');
        }
        target.push_str(&clean);

        let diff_started = Instant::now();
        let script = self.diff.compute(&target);
        self.metrics.record(
            metric_names::DIFF_COMPUTE,
            diff_started.elapsed().as_micros() as f64,
        );

        if !script.is_empty() {
            let mut remaining = script.delete_count;
            while remaining > 0 {
                let chunk = remaining.min(usize::from(u8::MAX)) as u8;
                if link.deliver(KeyCommand::Delete(chunk)).is_err() {
                    break;
                }
                remaining -= usize::from(chunk);
            }

            for segment in self.phrases.segments(&script.insert_text) {
                let cmd = match segment {
                    Segment::Text(text) => KeyCommand::Insert(text),
                    Segment::Key(KeyAction::Combo(key)) => KeyCommand::ControlCombo(key),
                    Segment::Key(KeyAction::Enter) => KeyCommand::Enter,
                };
                if link.deliver(cmd).is_err() {
                    break;
                }
            }
            wire_span.finish();
        }

        debug!(
            deleted = script.delete_count,
            inserted = script.insert_text.len(),
            "snapshot_applied"
        );
        self.publish(None);
    }

    fn publish(&self, error: Option<String>) {
        let mut transmitted =
            String::with_capacity(self.committed.len() + self.diff.acknowledged().len());
        transmitted.push_str(&self.committed);
        transmitted.push_str(self.diff.acknowledged());

        let snapshot = SessionSnapshot {
            recording: self.state == SessionState::Recording,
            recognized: self.diff.acknowledged().trim_start().to_string(),
            transmitted,
            language: self.language.clone(),
            error,
        };
        let _ = self.snapshot_tx.send(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, ConnectionManager};
    use crate::scheduler::{EventSender, Scheduler};
    use crate::transport::{LinkEvent, PeripheralId, ScanFilter, Transport, TransportError};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MockTransport {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl Transport for MockTransport {
        fn bind(&self, _events: EventSender) {}
        fn start_scan(&self, _filter: &ScanFilter) -> Result<(), TransportError> {
            Ok(())
        }
        fn stop_scan(&self) {}
        fn connect(&self, _id: PeripheralId) -> Result<(), TransportError> {
            Ok(())
        }
        fn disconnect(&self) {}
        fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockSpeech {
        starts: Mutex<Vec<(String, u64)>>,
        stops: Mutex<usize>,
        refuse: Mutex<bool>,
    }

    impl MockSpeech {
        fn last_generation(&self) -> u64 {
            self.starts.lock().last().expect("speech never started").1
        }
    }

    impl SpeechRecognizer for MockSpeech {
        fn bind(&self, _events: EventSender) {}

        fn start(&self, language: &str, generation: u64) -> Result<(), SpeechError> {
            if *self.refuse.lock() {
                return Err(SpeechError::LanguageUnavailable(language.to_string()));
            }
            self.starts.lock().push((language.to_string(), generation));
            Ok(())
        }

        fn stop(&self) {
            *self.stops.lock() += 1;
        }
    }

    struct Fixture {
        session: DictationSession,
        link: ConnectionManager,
        transport: Arc<MockTransport>,
        speech: Arc<MockSpeech>,
    }

    /// Session against a ready link with the given frame budget.
    fn fixture(max_frame: usize) -> Fixture {
        let transport = Arc::new(MockTransport::default());
        let speech = Arc::new(MockSpeech::default());
        let scheduler = Arc::new(Scheduler::new());
        let metrics = Arc::new(MetricsRegistry::new());

        let mut link = ConnectionManager::new(
            ConnectionConfig::default(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            scheduler,
            Arc::clone(&metrics),
        );
        link.handle_link_event(LinkEvent::AdapterAvailable(true));
        let id = PeripheralId::random();
        link.connect(id);
        link.handle_link_event(LinkEvent::Connected { id, name: None });
        link.handle_link_event(LinkEvent::LinkReady { max_frame });

        let session = DictationSession::new(
            Arc::clone(&speech) as Arc<dyn SpeechRecognizer>,
            PhraseMap::with_defaults(),
            metrics,
        );
        Fixture {
            session,
            link,
            transport,
            speech,
        }
    }

    fn frames(fx: &Fixture) -> Vec<Vec<u8>> {
        fx.transport.frames.lock().clone()
    }

    #[test]
    fn strict_suffix_growth_sends_inserts_only() {
        let mut fx = fixture(20);
        fx.session.start("en-US").unwrap();

        for snapshot in ["hel", "hello", "hello world"] {
            fx.session.apply_snapshot(&mut fx.link, snapshot);
        }

        assert_eq!(
            frames(&fx),
            vec![
                b"\x02hel".to_vec(),
                b"\x02lo".to_vec(),
                b"\x02 world".to_vec(),
            ],
            "zero backspace frames for suffix extensions"
        );
        assert_eq!(fx.session.subscribe().borrow().transmitted, "hello world");
    }

    #[test]
    fn suffix_revision_deletes_then_inserts() {
        let mut fx = fixture(20);
        fx.session.start("en-US").unwrap();

        fx.session.apply_snapshot(&mut fx.link, "i want four");
        fx.session.apply_snapshot(&mut fx.link, "i want for");

        let sent = frames(&fx);
        assert_eq!(sent[1], vec![0x01, 3], "delete the revised suffix first");
        assert_eq!(sent[2], b"\x02or".to_vec());
    }

    #[test]
    fn oversized_delete_splits_at_protocol_ceiling() {
        let mut fx = fixture(400);
        fx.session.start("en-US").unwrap();

        let long: String = "x".repeat(300);
        fx.session.apply_snapshot(&mut fx.link, &long);
        fx.session.apply_snapshot(&mut fx.link, "");

        let sent = frames(&fx);
        assert_eq!(sent[1], vec![0x01, 255]);
        assert_eq!(sent[2], vec![0x01, 45]);
    }

    #[test]
    fn long_insert_chunks_to_frame_budget() {
        let mut fx = fixture(20);
        fx.session.start("en-US").unwrap();

        let text = "abcdefghijklmnopqrstuvwxyz0123456789";
        fx.session.apply_snapshot(&mut fx.link, text);

        let sent = frames(&fx);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|f| f.len() <= 20));
        let joined: Vec<u8> = sent.iter().flat_map(|f| f[1..].to_vec()).collect();
        assert_eq!(String::from_utf8(joined).unwrap(), text);
    }

    #[test]
    fn trigger_phrase_becomes_control_combo() {
        let mut fx = fixture(20);
        fx.session.start("en-US").unwrap();

        fx.session.apply_snapshot(&mut fx.link, "hello new line world");

        assert_eq!(
            frames(&fx),
            vec![
                b"\x02hello".to_vec(),
                vec![0x04, b'j'],
                b"\x02world".to_vec(),
            ]
        );
    }

    #[test]
    fn stale_generations_are_rejected() {
        let mut fx = fixture(20);
        fx.session.start("en-US").unwrap();
        let live = fx.speech.last_generation();
        assert!(fx.session.accepts(live));

        fx.session.stop();
        assert!(!fx.session.accepts(live), "stopped sessions drop snapshots");
        assert_eq!(*fx.speech.stops.lock(), 1);
    }

    #[test]
    fn suspend_resume_joins_segments_without_data_loss() {
        let mut fx = fixture(20);
        fx.session.start("en-US").unwrap();
        fx.session.apply_snapshot(&mut fx.link, "hello world");

        fx.session.suspend();
        assert!(fx.session.is_active());
        assert!(!fx.session.is_recording());
        let suspended_gen = fx.speech.last_generation();

        assert!(fx.session.resume());
        assert!(fx.session.is_recording());
        assert!(fx.speech.last_generation() > suspended_gen, "fresh generation");

        // Fresh engine transcript after wake; remote text is preserved and
        // the new segment joins with a single space.
        fx.session.apply_snapshot(&mut fx.link, "again");
        assert_eq!(frames(&fx).last().unwrap(), &b"\x02 again".to_vec());
        assert_eq!(
            fx.session.subscribe().borrow().transmitted,
            "hello world again"
        );
    }

    #[test]
    fn resume_refusal_deactivates_session() {
        let mut fx = fixture(20);
        fx.session.start("en-US").unwrap();
        fx.session.suspend();

        *fx.speech.refuse.lock() = true;
        assert!(!fx.session.resume());
        assert!(!fx.session.is_active());
        assert!(fx.session.subscribe().borrow().error.is_some());
    }

    #[test]
    fn start_refusal_surfaces_capability_error() {
        let mut fx = fixture(20);
        *fx.speech.refuse.lock() = true;

        assert!(fx.session.start("xx-XX").is_err());
        assert!(!fx.session.is_active());
        assert!(fx.session.subscribe().borrow().error.is_some());
    }

    #[test]
    fn speech_end_tears_down_once() {
        let mut fx = fixture(20);
        fx.session.start("en-US").unwrap();
        let live = fx.speech.last_generation();

        assert!(fx.session.on_speech_ended(live, Some("engine died".into())));
        assert!(!fx.session.is_active());
        assert!(fx.session.subscribe().borrow().error.is_some());

        // The duplicate end event is stale by then.
        assert!(!fx.session.on_speech_ended(live, None));
    }

    #[test]
    fn restart_does_not_inherit_prior_text() {
        let mut fx = fixture(20);
        fx.session.start("en-US").unwrap();
        fx.session.apply_snapshot(&mut fx.link, "first session");
        fx.session.stop();

        fx.session.start("de-CH").unwrap();
        fx.session.apply_snapshot(&mut fx.link, "zweite");

        // No delete-everything edit at the start of the new session.
        let sent = frames(&fx);
        assert!(sent.iter().all(|f| f[0] != 0x01));
        assert_eq!(fx.session.subscribe().borrow().transmitted, "zweite");
    }
}
