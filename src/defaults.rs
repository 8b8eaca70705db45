//! Default configuration constants for vocalink.
//!
//! Shared by the config structs, the processors and the task so every layer
//! agrees on the same tuning values.

/// Default audio sample rate in Hz.
///
/// 16kHz is the rate realtime speech models expect on their input side.
pub const SAMPLE_RATE: u32 = 16000;

/// Default input chunk length in milliseconds.
///
/// Transports commonly deliver 20ms frames; the WAV source slices to match.
pub const CHUNK_MS: u32 = 20;

/// Default speech probability threshold (0.0 to 1.0).
pub const VAD_THRESHOLD: f32 = 0.5;

/// Default confirmation window in seconds.
///
/// Speech must hold above the threshold this long before SpeechStarted fires.
pub const VAD_START_SECS: f64 = 0.2;

/// Default silence duration in seconds that ends a user turn.
///
/// Kept short to align with the phrase endpointing of realtime models.
pub const VAD_STOP_SECS: f64 = 0.2;

/// Upper bound accepted for either VAD window, in seconds.
pub const MAX_VAD_WINDOW_SECS: f64 = 60.0;

/// RMS level that maps to a speech probability of 1.0 in the energy analyzer.
///
/// With the default threshold of 0.5 this places the speech boundary at an
/// RMS of 0.02, a level tuned for typical microphone input.
pub const RMS_FULL_SCALE: f32 = 0.04;

/// Default capacity of each processor's inbound data queue.
pub const QUEUE_CAPACITY: usize = 64;

/// Default grace period for teardown after a cancel, in seconds.
pub const CANCEL_GRACE_SECS: u64 = 5;

/// Default idle timeout in seconds. Zero disables idle detection.
pub const IDLE_TIMEOUT_SECS: u64 = 300;

/// Default system instruction prepended to every model run.
pub const SYSTEM_INSTRUCTION: &str = "You are very knowledgable about dogs. \
Your output will be spoken aloud, so avoid special characters that can't easily be spoken, \
such as emojis or bullet points. Respond to what the user said in a creative and helpful way.";

/// Default user message seeded when a client connects.
pub const INITIAL_PROMPT: &str = "Say hello and introduce yourself.";

/// Capacity of a model backend's response event stream.
pub const RESPONSE_STREAM_CAPACITY: usize = 32;
