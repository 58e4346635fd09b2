//! Speech-transcription collaborator seam.
//! The engine is external. It emits whole-string snapshot events, each
//! superseding the last, plus a terminal end/error event. Events are
//! stamped with the session generation so snapshots already in flight when
//! a session stops are dropped instead of racing the state reset.

use std::fmt;

use crate::scheduler::EventSender;

/// Capability errors: they abort the current recording attempt and surface
/// a message, but never touch connection state.
#[derive(Debug)]
pub enum SpeechError {
    /// Engine cannot transcribe the requested language.
    LanguageUnavailable(String),
    PermissionDenied,
    Engine(String),
}

impl fmt::Display for SpeechError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeechError::LanguageUnavailable(tag) => {
                write!(f, "speech recognition unavailable for {tag}")
            }
            SpeechError::PermissionDenied => write!(f, "microphone or speech permission denied"),
            SpeechError::Engine(msg) => write!(f, "speech engine error: {msg}"),
        }
    }
}

/// Outbound surface of the speech engine adapter.
///
/// Adapters push `ControlEvent::Transcript` and `ControlEvent::SpeechEnded`
/// through the `EventSender` handed to [`SpeechRecognizer::bind`], stamping
/// every event with the `generation` given to [`SpeechRecognizer::start`].
pub trait SpeechRecognizer: Send + Sync {
    /// Attach the adapter to the control queue. Called once by the bridge
    /// before any other method.
    fn bind(&self, events: EventSender);

    /// Begin continuous recognition for a BCP-47 language tag.
    fn start(&self, language: &str, generation: u64) -> Result<(), SpeechError>;

    /// Ask the engine to stop. Events already in flight may still arrive;
    /// their stale generation gets them dropped.
    fn stop(&self);
}
