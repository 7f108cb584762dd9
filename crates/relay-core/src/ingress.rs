//! Platform-independent pieces of inbound handling: trigger detection,
//! attachment selection and image encoding.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::{domain::ImagePayload, errors::Error, utils::strip_trigger_prefix, Result};

/// Prompt used when a triggered message carries only an image.
pub const DEFAULT_IMAGE_PROMPT: &str = "Describe this image.";

const RESET_KEYWORD: &str = "reset";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Prompt(String),
    Reset,
}

/// Decide what a message means for the bot. `None` means "not for us".
pub fn classify(text: &str, prefix: &str) -> Option<Inbound> {
    let rest = strip_trigger_prefix(text, prefix)?;
    if rest.trim().eq_ignore_ascii_case(RESET_KEYWORD) {
        return Some(Inbound::Reset);
    }
    Some(Inbound::Prompt(rest.trim_end().to_string()))
}

/// An attachment as declared by the platform, before download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundAttachment {
    pub file_id: String,
    pub content_type: Option<String>,
    pub size: Option<usize>,
}

impl InboundAttachment {
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("image/"))
    }
}

/// First attachment whose declared content type is `image/*`.
pub fn select_image(attachments: &[InboundAttachment]) -> Option<&InboundAttachment> {
    attachments.iter().find(|a| a.is_image())
}

/// Reject attachments that are declared larger than allowed, before download.
pub fn check_declared_size(att: &InboundAttachment, max_bytes: usize) -> Result<()> {
    match att.size {
        Some(size) if size > max_bytes => Err(Error::Attachment(format!(
            "attachment is {size} bytes, limit is {max_bytes}"
        ))),
        _ => Ok(()),
    }
}

/// Base64-encode downloaded image bytes for transport.
pub fn encode_image(bytes: &[u8], mime_type: &str, max_bytes: usize) -> Result<ImagePayload> {
    if bytes.is_empty() {
        return Err(Error::Attachment("attachment is empty".to_string()));
    }
    if bytes.len() > max_bytes {
        return Err(Error::Attachment(format!(
            "attachment is {} bytes, limit is {max_bytes}",
            bytes.len()
        )));
    }
    Ok(ImagePayload {
        mime_type: mime_type.to_string(),
        base64: STANDARD.encode(bytes),
    })
}
