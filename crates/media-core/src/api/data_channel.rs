//! JSON fragments for conference data-channel notifications.
//!
//! Two message kinds are sent to receivers over the SCTP data channel:
//! the last-N endpoint list (`LastNEndpointsChangeEvent`) and the
//! endpoint-to-SSRC map (`UserMediaMap`). Both are assembled piecewise
//! into a bounded [`StringBuilder`] so an oversized conference can never
//! blow past the data-channel MTU; key names and ordering are part of
//! the wire contract with clients.

use infra_common::strings::StringBuilder;

use crate::types::Ssrc;

/// Data-channel payloads are capped at 1024 bytes.
pub const MESSAGE_CAPACITY: usize = 1024;

/// Builder sized for one data-channel payload.
pub type DataChannelMessageBuilder = StringBuilder<MESSAGE_CAPACITY>;

pub(crate) fn make_last_n_start(out: &mut DataChannelMessageBuilder) {
    out.append("{\"colibriClass\":\"LastNEndpointsChangeEvent\",\"lastNEndpoints\":[");
}

pub(crate) fn make_last_n_append(
    out: &mut DataChannelMessageBuilder,
    endpoint_id: &str,
    is_first: bool,
) {
    if !is_first {
        out.append(",");
    }
    out.append("\"").append(endpoint_id).append("\"");
}

pub(crate) fn make_last_n_end(out: &mut DataChannelMessageBuilder) {
    out.append("]}");
}

pub(crate) fn make_user_media_map_start(out: &mut DataChannelMessageBuilder) {
    out.append("{\"colibriClass\":\"UserMediaMap\",\"endpoints\":[");
}

pub(crate) fn make_user_media_map_endpoint_start(
    out: &mut DataChannelMessageBuilder,
    endpoint_id: &str,
    is_first: bool,
) {
    if !is_first {
        out.append(",");
    }
    out.append("{\"endpoint\":\"").append(endpoint_id).append("\",\"ssrcs\":[");
}

pub(crate) fn add_user_media_ssrc(out: &mut DataChannelMessageBuilder, ssrc: Ssrc, is_first: bool) {
    if !is_first {
        out.append(",");
    }
    out.append_unsigned(u64::from(ssrc));
}

pub(crate) fn make_user_media_map_endpoint_end(out: &mut DataChannelMessageBuilder) {
    out.append("]}");
}

pub(crate) fn make_user_media_map_end(out: &mut DataChannelMessageBuilder) {
    out.append("]}");
}
