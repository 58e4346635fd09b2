//! Wake-tone listening pipeline.
//! Manages: audio device → ring buffer → Goertzel detection → control queue.
//! Audio capture runs on cpal's callback thread, which only writes samples.
//! A dedicated listener thread owns the stream, drains fixed-size blocks
//! through the detector, and submits confirmation events. The listener is
//! armed only while the power controller sits in IdleDimmed.

pub mod goertzel;
pub mod ring_buffer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::scheduler::{ControlEvent, EventSender};
use goertzel::{BlockOutcome, GoertzelDetector, ToneConfig};
use ring_buffer::RingBuffer;

/// Seconds of audio the ring buffer holds.
const RING_SECONDS: f32 = 2.0;

/// Arms and disarms the low-power tone capture pipeline.
pub struct WakeToneListener {
    config: ToneConfig,
    events: EventSender,
    active: Mutex<Option<ListenerHandle>>,
}

struct ListenerHandle {
    stop_flag: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl WakeToneListener {
    pub fn new(config: ToneConfig, events: EventSender) -> Self {
        Self {
            config,
            events,
            active: Mutex::new(None),
        }
    }

    /// Start listening. No-op when already armed. Capture problems are
    /// logged and absorbed: a device without a usable microphone simply
    /// never wakes by tone.
    pub fn arm(&self) {
        let mut active = self.active.lock();
        if active.is_some() {
            return;
        }
        let stop_flag = Arc::new(AtomicBool::new(false));
        let config = self.config.clone();
        let events = self.events.clone();
        let stop = Arc::clone(&stop_flag);
        let thread = match std::thread::Builder::new()
            .name("tone-listener".into())
            .spawn(move || run_listener(config, events, stop))
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "failed to spawn tone listener");
                return;
            }
        };
        *active = Some(ListenerHandle { stop_flag, thread });
        info!(target_hz = self.config.target_hz, "tone detector armed");
    }

    /// Stop listening and release the microphone.
    pub fn disarm(&self) {
        if let Some(handle) = self.active.lock().take() {
            handle.stop_flag.store(true, Ordering::SeqCst);
            let _ = handle.thread.join();
            info!("tone detector disarmed");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.active.lock().is_some()
    }
}

/// Listener loop. The cpal stream must live on this thread (it is not
/// Send); dropping it at exit stops capture.
fn run_listener(config: ToneConfig, events: EventSender, stop_flag: Arc<AtomicBool>) {
    let ring = Arc::new(Mutex::new(RingBuffer::new(config.sample_rate, RING_SECONDS)));

    let stream = match start_capture_stream(&config, Arc::clone(&ring)) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "tone capture unavailable (no mic access?)");
            return;
        }
    };

    let mut detector = GoertzelDetector::new(config.clone());
    let mut block = vec![0i16; config.block_size];
    // Half a block of headroom between polls.
    let idle_wait = Duration::from_millis(
        (config.block_size as u64 * 1000 / u64::from(config.sample_rate) / 2).max(1),
    );

    info!("tone listener loop started");
    while !stop_flag.load(Ordering::Relaxed) {
        let read = {
            let mut rb = ring.lock();
            if rb.available() < block.len() {
                0
            } else {
                rb.read(&mut block)
            }
        };
        if read == 0 {
            std::thread::sleep(idle_wait);
            continue;
        }
        if detector.process_block(&block[..read]) == BlockOutcome::Confirmed {
            info!("wake tone confirmed");
            events.submit(ControlEvent::ToneConfirmed);
        }
    }

    drop(stream);
    info!("tone listener loop stopped");
}

/// Start the cpal capture stream at the detector's reduced sample rate.
fn start_capture_stream(
    config: &ToneConfig,
    ring: Arc<Mutex<RingBuffer>>,
) -> Result<cpal::Stream, String> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or("no audio input device available")?;

    let stream_config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                // Audio callback: just write to the ring buffer. No
                // allocation, no blocking.
                let mut rb = ring.lock();
                rb.write(data);
            },
            |err| {
                error!(error = %err, "tone capture error");
            },
            None,
        )
        .map_err(|e| format!("failed to build input stream: {e}"))?;

    stream
        .play()
        .map_err(|e| format!("failed to start capture stream: {e}"))?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    fn listener() -> WakeToneListener {
        let scheduler = Scheduler::new();
        WakeToneListener::new(ToneConfig::default(), scheduler.sender())
    }

    #[test]
    fn arm_is_idempotent_and_disarm_joins() {
        let tone = listener();
        tone.arm();
        assert!(tone.is_armed());
        tone.arm();
        assert!(tone.is_armed());

        tone.disarm();
        assert!(!tone.is_armed());
    }

    #[test]
    fn disarm_without_arm_is_noop() {
        let tone = listener();
        tone.disarm();
        assert!(!tone.is_armed());
    }
}
