//! Files staged with `/attach` for the next prompt.
//!
//! Images and audio travel as data URLs next to the prompt. Anything else
//! must be UTF-8 text and is folded into the prompt body itself.

use std::error::Error;
use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::core::message::Attachments;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Image,
    Audio,
}

fn media_type(path: &Path) -> Option<(MediaKind, &'static str)> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let found = match ext.as_str() {
        "png" => (MediaKind::Image, "image/png"),
        "jpg" | "jpeg" => (MediaKind::Image, "image/jpeg"),
        "gif" => (MediaKind::Image, "image/gif"),
        "webp" => (MediaKind::Image, "image/webp"),
        "mp3" => (MediaKind::Audio, "audio/mpeg"),
        "wav" => (MediaKind::Audio, "audio/wav"),
        "ogg" => (MediaKind::Audio, "audio/ogg"),
        "flac" => (MediaKind::Audio, "audio/flac"),
        "m4a" => (MediaKind::Audio, "audio/mp4"),
        _ => return None,
    };
    Some(found)
}

pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

#[derive(Debug, Default)]
pub struct PendingAttachments {
    media: Attachments,
    texts: Vec<(String, String)>,
}

impl PendingAttachments {
    pub fn is_empty(&self) -> bool {
        self.media.is_empty() && self.texts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.media.images.len() + self.media.audios.len() + self.texts.len()
    }

    /// Read `path` and stage it. Returns a short description for the user.
    pub fn add_file(&mut self, path: &Path) -> Result<String, Box<dyn Error>> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let bytes = fs::read(path)?;

        match media_type(path) {
            Some((MediaKind::Image, mime)) => {
                self.media.images.push(data_url(mime, &bytes));
                Ok(format!("image {name}"))
            }
            Some((MediaKind::Audio, mime)) => {
                self.media.audios.push(data_url(mime, &bytes));
                Ok(format!("audio {name}"))
            }
            None => {
                let content = String::from_utf8(bytes)
                    .map_err(|_| format!("{name} is neither text nor a known image/audio type"))?;
                self.texts.push((name.clone(), content));
                Ok(format!("file {name}"))
            }
        }
    }

    /// Final prompt text and media for a submission. The staging area is
    /// left as is; call [`clear`](Self::clear) once the prompt was accepted.
    pub fn compose(&self, prompt: &str) -> (String, Attachments) {
        let mut full = prompt.to_string();
        if !self.texts.is_empty() {
            full.push_str("\n\nFile contents:\n");
            for (name, content) in &self.texts {
                full.push_str(&format!("\n--- {name} ---\n{content}\n"));
            }
        }
        (full, self.media.clone())
    }

    /// [`compose`](Self::compose), then empty the staging area.
    pub fn take_for_prompt(&mut self, prompt: &str) -> (String, Attachments) {
        let composed = self.compose(prompt);
        self.clear();
        composed
    }

    pub fn clear(&mut self) {
        self.media = Attachments::default();
        self.texts.clear();
    }
}
