//! Core types shared across the media selection engine.

use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Synchronization source identifier, a 32-bit RTP stream id.
pub type Ssrc = u32;

/// Opaque 64-bit hash of an endpoint's stable string id. Zero means
/// "none" and is never produced by [`endpoint_id_hash`].
pub type EndpointIdHash = u64;

/// Hash an endpoint's string id into the key every engine map uses.
pub fn endpoint_id_hash(endpoint_id: &str) -> EndpointIdHash {
    let mut hasher = DefaultHasher::new();
    endpoint_id.hash(&mut hasher);
    // Zero is reserved for "no endpoint".
    hasher.finish().max(1)
}

/// One simulcast encoding layer's SSRC pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SimulcastLevel {
    pub ssrc: Ssrc,
    /// RTX / feedback stream paired with `ssrc`.
    pub feedback_ssrc: Ssrc,
    /// Whether the layer currently carries media. Carried for the stream
    /// registry; the active media list does not consult it.
    pub media_active: bool,
}

impl SimulcastLevel {
    pub fn new(ssrc: Ssrc, feedback_ssrc: Ssrc) -> Self {
        Self { ssrc, feedback_ssrc, media_active: false }
    }
}

/// What a simulcast stream is carrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamContentType {
    /// Regular camera video.
    Camera,
    /// Screen-share / presentation content.
    Slides,
}

/// A sender's set of encoded layers at multiple bitrates.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulcastStream {
    pub levels: Vec<SimulcastLevel>,
    pub content_type: StreamContentType,
}

impl SimulcastStream {
    pub fn camera(levels: Vec<SimulcastLevel>) -> Self {
        Self { levels, content_type: StreamContentType::Camera }
    }

    pub fn slides(levels: Vec<SimulcastLevel>) -> Self {
        Self { levels, content_type: StreamContentType::Slides }
    }

    pub fn is_sending_video(&self) -> bool {
        !self.levels.is_empty() && self.content_type == StreamContentType::Camera
    }

    pub fn is_sending_slides(&self) -> bool {
        !self.levels.is_empty() && self.content_type == StreamContentType::Slides
    }

    /// SSRC of the base layer, the one rewritten for receivers.
    pub fn main_ssrc(&self) -> Option<Ssrc> {
        self.levels.first().map(|level| level.ssrc)
    }
}

/// Audio level sample pushed by RTP worker threads.
///
/// `level` is the loudness on a `dBov + 127` scale: 127 is the highest
/// volume (0 dBov), 0 means muted/silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioLevelSample {
    pub endpoint_id_hash: EndpointIdHash,
    pub level: u8,
    pub ptt: bool,
}

/// An endpoint whose score currently exceeds the silence threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActiveTalker {
    pub endpoint_id_hash: EndpointIdHash,
    pub is_ptt: bool,
    pub score: u8,
    pub noise_level: u8,
}

/// Engine-side view of a participant's video stream, as the stream
/// registry hands it to the message builders.
#[derive(Debug, Clone)]
pub struct VideoStreamHandle {
    /// The endpoint's stable string id, as sent on the data channel.
    pub endpoint_id: String,
    pub simulcast_stream: SimulcastStream,
    pub secondary_simulcast_stream: Option<SimulcastStream>,
    /// Synthetic level on which this *receiver* gets its pinned content.
    pub pin_ssrc: Option<SimulcastLevel>,
}

impl VideoStreamHandle {
    pub fn is_sending_video(&self) -> bool {
        self.simulcast_stream.is_sending_video()
            || self
                .secondary_simulcast_stream
                .as_ref()
                .is_some_and(|stream| stream.is_sending_video())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_hash_is_stable_and_nonzero() {
        let a = endpoint_id_hash("endpoint-a");
        assert_eq!(a, endpoint_id_hash("endpoint-a"));
        assert_ne!(a, 0);
        assert_ne!(a, endpoint_id_hash("endpoint-b"));
    }

    #[test]
    fn simulcast_capabilities() {
        let camera = SimulcastStream::camera(vec![SimulcastLevel::new(1, 2)]);
        assert!(camera.is_sending_video());
        assert!(!camera.is_sending_slides());
        assert_eq!(camera.main_ssrc(), Some(1));

        let slides = SimulcastStream::slides(vec![SimulcastLevel::new(3, 4)]);
        assert!(slides.is_sending_slides());
        assert!(!slides.is_sending_video());

        let idle = SimulcastStream::camera(Vec::new());
        assert!(!idle.is_sending_video());
        assert_eq!(idle.main_ssrc(), None);
    }
}
