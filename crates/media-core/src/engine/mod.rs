//! The per-conference media selection engine.

pub mod active_media_list;
pub(crate) mod audio_participant;

pub use active_media_list::{
    ActiveMediaList, ActiveTalkerReader, AudioLevelProducer, ProcessResult,
    VideoScreenShareSsrcMapping,
};
