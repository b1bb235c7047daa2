//! Assembly of the opening user message from text, attachments and search
//! context.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::turn::Turn;
use crate::config::LimitsSection;

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    /// Passed to the assistant with `--file`
    Image,
    /// Announced but not inlined
    Pdf,
    /// Inlined as a fenced block
    Text,
}

impl AttachmentKind {
    pub fn of(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            AttachmentKind::Image
        } else if ext == "pdf" {
            AttachmentKind::Pdf
        } else {
            AttachmentKind::Text
        }
    }
}

/// Text for the opening user record plus image paths for the launch flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledMessage {
    pub text: String,
    pub image_paths: Vec<PathBuf>,
}

/// Resolve a bare attachment name to a file directly inside `upload_dir`.
///
/// Names with path separators or `..`, missing files, and anything that
/// resolves outside the directory (symlinks included) yield `None`.
pub async fn resolve_attachment(upload_dir: &Path, name: &str) -> Option<PathBuf> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        warn!(name, "rejecting attachment name");
        return None;
    }

    let dir = tokio::fs::canonicalize(upload_dir).await.ok()?;
    let path = match tokio::fs::canonicalize(upload_dir.join(name)).await {
        Ok(path) => path,
        Err(e) => {
            debug!(name, error = %e, "attachment not found");
            return None;
        }
    };
    if path.parent() != Some(dir.as_path()) {
        warn!(name, "attachment resolves outside the upload directory");
        return None;
    }
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Some(path),
        _ => None,
    }
}

/// Build the message text for `turn`.
///
/// At most `max_attachments` references are honoured. Text attachments are
/// cut at `attachment_char_budget` characters each.
pub async fn assemble(turn: &Turn, upload_dir: &Path, limits: &LimitsSection) -> AssembledMessage {
    let mut text = turn.message.trim().to_string();
    let mut image_paths = Vec::new();

    if turn.attachments.len() > limits.max_attachments {
        warn!(
            requested = turn.attachments.len(),
            max = limits.max_attachments,
            "ignoring attachments beyond the limit"
        );
    }

    for name in turn.attachments.iter().take(limits.max_attachments) {
        let Some(path) = resolve_attachment(upload_dir, name).await else {
            continue;
        };
        match AttachmentKind::of(&path) {
            AttachmentKind::Image => image_paths.push(path),
            AttachmentKind::Pdf => {
                text.push_str(&format!(
                    "\n\n--- Attachment: {} (PDF, contents not inlined) ---",
                    name
                ));
            }
            AttachmentKind::Text => match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let content = String::from_utf8_lossy(&bytes);
                    let content = truncate_chars(&content, limits.attachment_char_budget);
                    text.push_str(&format!(
                        "\n\n--- Attachment: {} ---\n```\n{}\n```",
                        name, content
                    ));
                }
                Err(e) => warn!(name, error = %e, "failed to read attachment"),
            },
        }
    }

    if let Some(context) = &turn.search_context {
        text = format!("{}\n\n---\n\n[User question]\n{}", context, text);
    }

    AssembledMessage { text, image_paths }
}

fn truncate_chars(content: &str, budget: usize) -> String {
    match content.char_indices().nth(budget) {
        Some((cut, _)) => format!(
            "{}\n... (truncated, exceeds {} characters)",
            &content[..cut],
            budget
        ),
        None => content.to_string(),
    }
}
