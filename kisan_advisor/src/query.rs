//! The farmer's query as received from the ingress layer.

use std::sync::Arc;

use crate::engine::{Part, Role, Turn};

/// Binary media attached to a query (already decoded from transport).
#[derive(Debug, Clone, PartialEq)]
pub struct Media {
    pub mime_type: String,
    pub data: Arc<[u8]>,
}

impl Media {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: Arc::from(data),
        }
    }
}

/// Immutable once received.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub text: Option<String>,
    pub media: Option<Media>,
}

impl Query {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            media: None,
        }
    }

    pub fn media(media: Media) -> Self {
        Self {
            text: None,
            media: Some(media),
        }
    }

    pub fn with_media(mut self, media: Media) -> Self {
        self.media = Some(media);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, |t| t.trim().is_empty()) && self.media.is_none()
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    /// Text stand-in forwarded to steps that never see the media itself.
    pub fn prompt_text(&self) -> String {
        match (&self.text, &self.media) {
            (Some(t), _) if !t.trim().is_empty() => t.clone(),
            (_, Some(_)) => "[The farmer attached a crop photo without any text.]".to_string(),
            _ => String::new(),
        }
    }

    /// User turn carrying the text and any media.
    pub fn to_turn(&self) -> Turn {
        let mut parts = Vec::new();
        if let Some(text) = self.text.as_ref().filter(|t| !t.trim().is_empty()) {
            parts.push(Part::Text(text.clone()));
        }
        if let Some(media) = &self.media {
            parts.push(Part::InlineData {
                mime_type: media.mime_type.clone(),
                data: media.data.clone(),
            });
        }
        Turn {
            role: Role::User,
            parts,
        }
    }
}
