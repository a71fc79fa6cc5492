//! LiveLink - real-time voice and vision session with a Live API model
//!
//! Microphone audio and camera snapshots stream up over a websocket, model
//! speech is scheduled gaplessly on the speaker, and function calls from the
//! model run through a gated tool dispatcher. The session survives dropped
//! connections by reconnecting in place.

#![forbid(unsafe_code)]

pub mod audio_encoder;
pub mod audio_pipeline;
pub mod config;
pub mod devices;
pub mod dispatcher;
pub mod gemini;
pub mod gemini_client;
pub mod health;
pub mod media;
pub mod playback;
#[cfg(feature = "pulse")]
pub mod pulse;
pub mod scenario;
pub mod session;
pub mod session_fsm;
pub mod tools;
pub mod transport;
pub mod video_sampler;
pub mod view;
pub mod wav_io;
