//! # adk-bidi-cli
//!
//! Process surface for the `adk-bidi` voice bridge.
//!
//! ## Overview
//!
//! - [`serve`] - WebSocket server: one bridge session per browser connection
//! - [`harness`] - offline harnesses driving the bridge from recorded PCM
//! - [`logging`] - subscriber setup
//!
//! ## CLI Usage
//!
//! ```bash
//! # Serve browser clients against the simulated agent
//! bidi-bridge serve --port 8080
//!
//! # Measure latency against a real backend
//! bidi-bridge --backend ws --endpoint wss://agent.example/bidi latency --runs 5
//!
//! # Barge-in check
//! bidi-bridge barge-in --question /tmp/test_long.pcm --interrupt /tmp/test_interrupt.pcm
//! ```

pub mod cli;
pub mod harness;
pub mod logging;
pub mod report;
pub mod serve;
