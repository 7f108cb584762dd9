use teloxide::{net::Download, prelude::*, types::Message};

use relay_core::{
    domain::ImagePayload,
    errors::Error,
    ingress::{check_declared_size, encode_image, select_image, InboundAttachment},
    Result,
};

/// Telegram re-encodes photos as JPEG.
const PHOTO_MIME: &str = "image/jpeg";

fn attachments_of(msg: &Message) -> Vec<InboundAttachment> {
    let mut out = Vec::new();
    // Photo sizes are ordered smallest first.
    if let Some(best) = msg.photo().and_then(|sizes| sizes.last()) {
        out.push(InboundAttachment {
            file_id: best.file.id.clone(),
            content_type: Some(PHOTO_MIME.to_string()),
            size: Some(best.file.size as usize),
        });
    }
    if let Some(doc) = msg.document() {
        out.push(InboundAttachment {
            file_id: doc.file.id.clone(),
            content_type: doc.mime_type.as_ref().map(|m| m.essence_str().to_string()),
            size: Some(doc.file.size as usize),
        });
    }
    out
}

/// Download and encode the first image attached to `msg`, if any.
pub(super) async fn load_image(
    bot: &Bot,
    msg: &Message,
    max_bytes: usize,
) -> Result<Option<ImagePayload>> {
    let attachments = attachments_of(msg);
    let Some(att) = select_image(&attachments) else {
        return Ok(None);
    };
    check_declared_size(att, max_bytes)?;

    let bytes = download(bot, &att.file_id).await?;
    let mime = att.content_type.as_deref().unwrap_or(PHOTO_MIME);
    let payload = encode_image(&bytes, mime, max_bytes)?;
    tracing::debug!(bytes = bytes.len(), mime, "image attachment encoded");
    Ok(Some(payload))
}

async fn download(bot: &Bot, file_id: &str) -> Result<Vec<u8>> {
    let file = bot
        .get_file(file_id.to_string())
        .await
        .map_err(|e| Error::Attachment(format!("get_file failed: {e}")))?;

    let mut buf = Vec::new();
    bot.download_file(&file.path, &mut buf)
        .await
        .map_err(|e| Error::Attachment(format!("download failed: {e}")))?;
    Ok(buf)
}
