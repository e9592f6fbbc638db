//! JSON-RPC 2.0 plumbing.
//!
//! - [`transport`] turns a byte channel into whole frames and back
//! - [`protocol`] defines the envelopes and error codes
//! - [`router`] is where inbound handlers are registered
//! - [`engine`] decodes frames, dispatches them and correlates responses

pub mod engine;
pub mod protocol;
pub mod router;
pub mod transport;

pub use engine::{Peer, RpcEngine, CANCEL_REQUEST};
pub use protocol::{ErrorCode, Message, Notification, Request, RequestId, Response, ResponseError};
pub use router::{boxed, ExitStatus, HandlerResult, Router};
pub use transport::{Channel, FrameReader, FrameWriter, Framing, MAX_FRAME_BYTES};
