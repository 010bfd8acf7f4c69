//! Realtime voice mentoring over the Gemini Live API.
//!
//! The crate has two halves. The client half captures microphone audio,
//! streams it over a live WebSocket connection and schedules the model's
//! spoken replies for gapless playback; [`session::SessionController`] owns
//! that lifecycle. The server half is a key-rotating proxy
//! ([`proxy::router`]) that keeps upstream API keys out of clients while
//! serving the text actions (`chat`, `mental_map`) and handing out keys for
//! direct voice connections (`get_voice_key`).

pub mod audio;
pub mod backend;
pub mod error;
pub mod proxy;
pub mod session;
pub mod types;

pub use backend::BackendClient;
pub use error::MentorError;
pub use session::{
    CredentialSource, LiveConnector, SessionConfig, SessionController, SessionState,
    SessionStatus, TungsteniteConnector,
};
