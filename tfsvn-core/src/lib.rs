//! TfSvn Core Library
//!
//! Core functionality for TfSvn including:
//! - svndiff wire codec (signature, windows, instructions, varints)
//! - Content item tree shared between the prefetch worker and consumers
//! - Bounded prefetch loader with backpressure, cancellation, and timeouts
//! - Blocking consumer handshake used while streaming response bodies

pub mod item;
pub mod loader;
pub mod svndiff;

pub use item::{ContentItem, EncodedPayload, ItemKind};
pub use loader::{ContentSource, LoaderConfig, LoaderError, PrefetchLoader};
pub use svndiff::{
    DiffError, DiffInstruction, DiffWindow, apply_stream, apply_window, decode_windows,
    encode_chunked_base64, encode_replace, encoded_len_hint,
};
