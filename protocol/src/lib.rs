//! GAIA GA Command Protocol
//!
//! Wire contract between a coordinator and the device workers that run a
//! genetic-algorithm engine on its behalf.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────┐  prepare/run/pause/...  ┌──────────────┐
//!  │Coordinator│ ───────────────────────►│Worker (GPU 0)│
//!  │           │◄─────────────────────── │              │
//!  └───────────┘  device_info/generation └──────────────┘
//!                 _result/best/end ...
//! ```
//!
//! ## Framing
//! - Every message is `STX` + JSON body + `ETX`
//! - Commands: `{"command": <name>, "data": <payload>}`
//! - Results: `{"type": <name>, "data": <payload>}`
//! - Binary payloads travel as base64 strings
//!
//! ## Decoding
//! - Frames decode into [`CommandFrame`]/[`ResultFrame`] first, then into the
//!   typed [`Command`]/[`WorkerResult`] with a per-kind payload schema
//! - Unknown names and malformed payloads surface as [`ProtocolError`]s and
//!   never tear down the connection

pub mod error;
pub mod frame;
pub mod types;

pub use error::{ProtocolError, Result};
pub use frame::{FrameCodec, FRAME_BEGIN, FRAME_END};
pub use types::*;
