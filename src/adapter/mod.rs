//! External-process UDP adapter: wire protocol plus the client/server
//! session worker built on it (spec.md §4.5).

pub mod protocol;
pub mod session;

pub use protocol::{Frame, FrameBody, MsgType, HEADER_LEN, MAX_DATAGRAM};
pub use session::{AdapterWorker, FrameDecoder, FrameEncoder};
