//! Message body extraction.
//!
//! Walks the MIME part tree depth-first: first `text/plain` part, else
//! first `text/html` part (converted to text), else the root body when it
//! declares no content type.
//! Never fails; an empty string means there was nothing textual to decode.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use tracing::{debug, warn};

use crate::source::types::{MessageDetail, MessagePart};

/// base64url, accepting bodies with or without `=` padding.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Plain text of a message, or empty if none could be decoded.
pub fn extract_text(detail: &MessageDetail) -> String {
    let Some(payload) = detail.payload.as_ref() else {
        debug!(message_id = %detail.id, "Message has no payload");
        return String::new();
    };

    if let Some(text) = find_part_with_mime(payload, "text/plain").and_then(decode_part_body) {
        return text;
    }

    if let Some(html) = find_part_with_mime(payload, "text/html").and_then(decode_part_body) {
        return html_to_text(&html);
    }

    // An untyped root body is taken as text; a typed non-text one never is.
    if payload.mime_type.is_none() {
        return decode_part_body(payload).unwrap_or_default();
    }

    debug!(message_id = %detail.id, mime = ?payload.mime_type, "No textual part");
    String::new()
}

/// First part (root included) whose declared type matches, depth-first.
fn find_part_with_mime<'a>(part: &'a MessagePart, target: &str) -> Option<&'a MessagePart> {
    if part
        .mime_type
        .as_deref()
        .is_some_and(|mime| mime_matches(mime, target))
    {
        return Some(part);
    }

    part.parts
        .iter()
        .flatten()
        .find_map(|child| find_part_with_mime(child, target))
}

/// Compare the media type only, ignoring parameters like `charset`.
fn mime_matches(declared: &str, target: &str) -> bool {
    declared
        .split(';')
        .next()
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(target))
}

fn decode_part_body(part: &MessagePart) -> Option<String> {
    let data = part.body.as_ref()?.data.as_deref()?;
    if data.is_empty() {
        return None;
    }

    match URL_SAFE_LENIENT.decode(data.trim()) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            warn!(error = %e, mime = ?part.mime_type, "Failed to decode part body");
            None
        }
    }
}

/// Wide enough that notices never wrap mid-amount.
const HTML_WRAP_WIDTH: usize = 10_000;

fn html_to_text(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), HTML_WRAP_WIDTH) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            warn!(error = %e, "HTML to text conversion failed");
            String::new()
        }
    }
}
