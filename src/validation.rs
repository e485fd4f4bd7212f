//! Checks that run before a message ever reaches the network.

use crate::config::{ALLOWED_DOCUMENT_TYPES, MAX_ATTACHMENT_BYTES, MAX_MESSAGE_CHARS};
use crate::error::{Result, SyncError};
use crate::models::{AttachmentKind, OutgoingAttachment, OutgoingMessage};

pub fn validate_message(message: &OutgoingMessage) -> Result<()> {
    let text = message.content.as_deref().map(str::trim).unwrap_or("");

    if text.is_empty() && message.attachment.is_none() {
        return Err(SyncError::Validation(
            "message needs text or an attachment".into(),
        ));
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(SyncError::Validation(format!(
            "message longer than {MAX_MESSAGE_CHARS} characters"
        )));
    }
    if let Some(attachment) = &message.attachment {
        validate_attachment(attachment)?;
    }
    Ok(())
}

pub fn validate_attachment(attachment: &OutgoingAttachment) -> Result<()> {
    if attachment.data.is_empty() {
        return Err(SyncError::Validation(format!(
            "attachment {} is empty",
            attachment.name
        )));
    }
    if attachment.data.len() > MAX_ATTACHMENT_BYTES {
        return Err(SyncError::Validation(format!(
            "attachment {} exceeds {} MiB",
            attachment.name,
            MAX_ATTACHMENT_BYTES / (1024 * 1024)
        )));
    }

    let content_type = attachment.content_type.to_ascii_lowercase();
    let allowed = match attachment.kind {
        AttachmentKind::Image => content_type.starts_with("image/"),
        AttachmentKind::Video => content_type.starts_with("video/"),
        AttachmentKind::Audio => content_type.starts_with("audio/"),
        AttachmentKind::Document => ALLOWED_DOCUMENT_TYPES
            .iter()
            .any(|prefix| content_type.starts_with(prefix)),
    };
    if !allowed {
        return Err(SyncError::Validation(format!(
            "{} is not an allowed {} type",
            attachment.content_type,
            attachment.kind.as_str()
        )));
    }
    Ok(())
}
