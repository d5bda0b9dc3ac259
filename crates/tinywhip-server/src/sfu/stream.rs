//! Stream Registry
//!
//! Maps stream identifiers to the tracks their publisher is currently
//! sending. The registry lock only guards the map itself; each entry has its
//! own lock for its track list, so unrelated streams never contend.

use crate::error::{AppError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tinywhip_media::CodecInfo;
use tokio::sync::RwLock;
use uuid::Uuid;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// A publisher track made available to subscribers.
///
/// `local_track` is the single fan-out sink every subscriber attaches to.
#[derive(Clone)]
pub struct PublishedTrack {
    pub id: Uuid,
    pub codec: CodecInfo,
    pub local_track: Arc<TrackLocalStaticRTP>,
}

impl PublishedTrack {
    pub fn new(codec: CodecInfo, local_track: Arc<TrackLocalStaticRTP>) -> Self {
        Self {
            id: Uuid::new_v4(),
            codec,
            local_track,
        }
    }
}

/// Tracks published under one stream identifier
pub struct StreamEntry {
    stream_id: String,
    publisher: Uuid,
    tracks: RwLock<Vec<PublishedTrack>>,
}

impl StreamEntry {
    pub fn new(stream_id: String, publisher: Uuid) -> Self {
        Self {
            stream_id,
            publisher,
            tracks: RwLock::new(Vec::new()),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Session ID of the publisher that owns this entry
    pub fn publisher(&self) -> Uuid {
        self.publisher
    }

    pub async fn push(&self, track: PublishedTrack) {
        let mut tracks = self.tracks.write().await;
        tracks.push(track);
        tracing::debug!(
            "Stream {} now has {} published tracks",
            self.stream_id,
            tracks.len()
        );
    }

    /// Remove a track, returning whether it was present
    pub async fn remove_track(&self, track_id: Uuid) -> bool {
        let mut tracks = self.tracks.write().await;
        let before = tracks.len();
        tracks.retain(|t| t.id != track_id);
        before != tracks.len()
    }

    /// Snapshot of the live tracks, in publish order
    pub async fn tracks(&self) -> Vec<PublishedTrack> {
        self.tracks.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.tracks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tracks.read().await.is_empty()
    }
}

#[derive(Default)]
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, Arc<StreamEntry>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `entry` the current entry for its stream ID.
    ///
    /// The last publisher wins: an existing entry is replaced.
    pub async fn publish(&self, entry: Arc<StreamEntry>) {
        let stream_id = entry.stream_id().to_string();
        let publisher = entry.publisher();
        let previous = self.streams.write().await.insert(stream_id.clone(), entry);

        if let Some(previous) = previous {
            tracing::info!(
                "Stream {} taken over by session {} (was {})",
                stream_id,
                publisher,
                previous.publisher()
            );
        } else {
            tracing::info!("Stream {} published by session {}", stream_id, publisher);
        }
    }

    pub async fn get(&self, stream_id: &str) -> Result<Arc<StreamEntry>> {
        self.streams
            .read()
            .await
            .get(stream_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Stream {} not found", stream_id)))
    }

    /// Append to whichever entry is current for `stream_id`.
    ///
    /// A publisher's ingest appends through its own [`StreamEntry`] handle
    /// instead, so its tracks never land in an entry that replaced it.
    pub async fn append_track(&self, stream_id: &str, track: PublishedTrack) -> Result<()> {
        let entry = self.get(stream_id).await?;
        entry.push(track).await;
        Ok(())
    }

    pub async fn remove(&self, stream_id: &str) -> Option<Arc<StreamEntry>> {
        self.streams.write().await.remove(stream_id)
    }

    /// Remove the entry for `stream_id` only if `publisher` still owns it
    pub async fn unpublish(&self, stream_id: &str, publisher: Uuid) -> bool {
        let mut streams = self.streams.write().await;
        match streams.get(stream_id) {
            Some(entry) if entry.publisher() == publisher => {
                streams.remove(stream_id);
                tracing::info!("Stream {} unpublished by session {}", stream_id, publisher);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.streams.read().await.len()
    }
}
