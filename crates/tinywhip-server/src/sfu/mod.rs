//! SFU (Selective Forwarding Unit) for WHIP/WHEP
//!
//! Publishers push tracks under a stream identifier; every subscriber of that
//! identifier gets the same RTP, forwarded without any processing or
//! transcoding. Each published track has one shared local track that all
//! subscribers attach to.

mod manager;
mod session;
mod stream;
mod track_router;

pub use manager::{Negotiated, SfuManager};
pub use session::{Session, SessionRegistry, SessionRole, SessionState};
pub use stream::{PublishedTrack, StreamEntry, StreamRegistry};
pub use track_router::{
    FeedbackSink, RelayConfig, RelayExit, RtpSink, RtpSource, TrackRouter,
};
