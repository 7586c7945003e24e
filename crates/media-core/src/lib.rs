//! # Media core for the Switchboard conference bridge
//!
//! `media-core` hosts the per-conference media selection engine. Its
//! centerpiece is the [`ActiveMediaList`]: the dominant-speaker detection
//! and active-talker ranking engine of the selective forwarding unit,
//! together with the synthetic SSRC pools it recycles across speaker
//! transitions and the data-channel notifications it renders for each
//! receiver.
//!
//! ## Core components
//!
//! - **[`ActiveMediaList`]**: speaker scoring, dominant-speaker
//!   arbitration, bounded active-audio/active-video rotations with SSRC
//!   rewrite pools
//! - **[`AudioLevelProducer`]**: lock-free ingest handle for RTP worker
//!   threads feeding per-packet audio levels
//! - **[`ActiveTalkerReader`]**: snapshot handle letting API threads read
//!   the current talker set without touching the engine thread
//! - **Data-channel builders**: bounded JSON payloads telling each
//!   receiver which endpoints and SSRCs it is currently subscribed to
//!
//! ## Threading
//!
//! The engine is single-writer: one media-engine thread owns the
//! `&mut ActiveMediaList` and with it every mutating entry point. RTP
//! workers only push level samples through their producer handle and API
//! threads only read published snapshots, so no call in this crate blocks
//! the engine loop.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use switchboard_media_core::{ActiveMediaConfig, ActiveMediaList, SimulcastLevel};
//!
//! let audio_ssrcs = vec![0xa000, 0xa001, 0xa002];
//! let video_ssrcs: Vec<SimulcastLevel> = allocate_video_ssrcs();
//! let mut list = ActiveMediaList::new(1, &audio_ssrcs, &video_ssrcs, ActiveMediaConfig::default())?;
//!
//! let producer = list.level_producer(); // hand to RTP workers
//! let reader = list.talker_reader();    // hand to API threads
//!
//! loop {
//!     let result = list.process(now_ns());
//!     if result.dominant_speaker_changed {
//!         // re-send last-N / user-media-map messages to receivers
//!     }
//! }
//! ```

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod types;

// Re-export core types
pub use config::ActiveMediaConfig;
pub use engine::active_media_list::{
    ActiveMediaList, ActiveTalkerReader, AudioLevelProducer, ProcessResult,
    VideoScreenShareSsrcMapping, MAX_PARTICIPANTS, SSRC_REWRITE_ARRAY_SIZE,
};
pub use error::{Error, Result};
pub use types::{
    endpoint_id_hash, ActiveTalker, AudioLevelSample, EndpointIdHash, SimulcastLevel,
    SimulcastStream, Ssrc, StreamContentType, VideoStreamHandle,
};

// Re-export the bounded builder the data-channel payloads are written into
pub use api::data_channel::DataChannelMessageBuilder;
pub use infra_common::strings::StringBuilder;
