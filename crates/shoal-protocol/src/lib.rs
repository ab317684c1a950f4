//! shoal-protocol: RESP wire codec and the buffered I/O it rides on.
//!
//! Provides a streaming decoder/encoder for the RESP framing spoken by the
//! backends this proxy fronts, plus the linear buffered reader/writer and
//! the off-heap buffer allocator that make zero-copy decoding safe.
//!
//! # quick start
//!
//! ```
//! use shoal_protocol::{decode_from_bytes, encode_to_bytes, Resp};
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! # rt.block_on(async {
//! let frame = decode_from_bytes(b"+OK\r\n").await.unwrap();
//! assert_eq!(frame, Resp::simple("OK"));
//!
//! let wire = encode_to_bytes(&frame).await.unwrap();
//! assert_eq!(wire, b"+OK\r\n");
//! # });
//! ```

pub mod buf;
pub mod decode;
pub mod encode;
pub mod error;
pub mod offheap;
pub mod resp;

pub use decode::{decode_from_bytes, decode_multi_bulk_from_bytes, Decoder};
pub use encode::{encode_to_bytes, Encoder, FlushEncoder};
pub use error::ProtocolError;
pub use resp::{btoi64, Resp, MAX_ARRAY_LEN, MAX_BULK_LEN};
