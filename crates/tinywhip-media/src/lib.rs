//! Media utilities for tinywhip
//!
//! This crate provides the codec catalog shared by the relay:
//! - The fixed payload-type table for Opus, VP8, VP9 and H.264 (with RTX)
//! - Deriving an egress catalog from the codecs a publisher actually sent

pub mod codec;

pub use codec::*;
