//! Local companion service for the Factorio GPT assistant mod.
//!
//! The mod speaks plain HTTP on localhost; this crate exposes that surface
//! (`GET /status`, `POST /chat`, `POST /config`), forwards chat payloads to
//! OpenAI's chat-completions endpoint, and keeps the rate-limit snapshot the
//! last successful call reported. Configuration (API key, model profiles,
//! consent) persists in `~/.factorio-gpt/config.json` with the key stored
//! base64-obfuscated.

pub mod cli;
pub mod config;
pub mod http;
pub mod relay;
pub mod server;
pub mod setup;
pub mod types;

pub use relay::RelayService;
pub use server::serve;
