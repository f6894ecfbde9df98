//! ActivityPub media type negotiation.

use axum::http::{HeaderMap, header};

/// Content type written on every ActivityPub response.
pub const CONTENT_TYPE_LD_JSON: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// `Accept` sent when dereferencing.
pub const ACCEPT_ACTIVITY: &str = "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

const AS_PROFILE: &str = "https://www.w3.org/ns/activitystreams";

/// Whether one media range names ActivityPub JSON.
///
/// `application/activity+json` always qualifies. `application/ld+json`
/// qualifies bare or with the ActivityStreams profile, quoted or not.
#[must_use]
pub fn is_activity_pub_media_type(value: &str) -> bool {
    let mut parts = value.split(';').map(str::trim);
    let essence = parts.next().unwrap_or_default().to_ascii_lowercase();
    match essence.as_str() {
        "application/activity+json" => true,
        "application/ld+json" => parts
            .filter_map(|param| param.split_once('='))
            .filter(|(name, _)| name.trim().eq_ignore_ascii_case("profile"))
            .all(|(_, profile)| {
                profile
                    .trim()
                    .trim_matches('"')
                    .split_whitespace()
                    .any(|p| p == AS_PROFILE)
            }),
        _ => false,
    }
}

fn header_has_activity_pub_type(headers: &HeaderMap, name: header::HeaderName) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(is_activity_pub_media_type)
}

/// Whether a POST carries an ActivityPub body.
#[must_use]
pub fn is_activity_pub_post(headers: &HeaderMap) -> bool {
    header_has_activity_pub_type(headers, header::CONTENT_TYPE)
}

/// Whether a GET asks for an ActivityPub representation.
#[must_use]
pub fn is_activity_pub_get(headers: &HeaderMap) -> bool {
    header_has_activity_pub_type(headers, header::ACCEPT)
}
