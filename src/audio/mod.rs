pub mod capture;
pub mod pcm;
pub mod scheduler;

pub use capture::CapturePipeline;
pub use pcm::PlaybackChunk;
pub use scheduler::{ManualClock, MonotonicClock, OutputClock, PlaybackScheduler, PlaybackSink};

/// Sample rate (16kHz) the remote service accepts for captured audio.
pub const INPUT_SAMPLE_RATE_HZ: u32 = 16_000;
/// Sample rate (24kHz) of the audio the remote service streams back.
pub const OUTPUT_SAMPLE_RATE_HZ: u32 = 24_000;
/// Both directions are mono.
pub const AUDIO_CHANNELS: u16 = 1;
/// Samples per captured frame handed to the encoder.
pub const CAPTURE_FRAME_SIZE: usize = 4096;
