//! Presentation records and the JSON wire frames exchanged over the relay.
//!
//! Every frame is `{ "event": <name>, "data": <payload> }`. Controllers send
//! `setVerse`, `clearVerse`, `setHymn`, `clearHymn`; overlays receive
//! `updateVerse`, `clearVerse`, `setHymn`, `clearHymn`; controllers receive
//! `overlayConnected` / `overlayDisconnected`.

use serde::{Deserialize, Serialize};

use crate::errors::RelayError;

/// A single Bible verse as stored in the lookup database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerseRecord {
    pub book: u32,
    pub chapter: u32,
    pub verse: u32,
    pub book_name: String,
    pub text: String,
}

/// One selected hymn stanza. `verse` holds newline-separated lines.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HymnRecord {
    pub title: String,
    pub verse: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    Left,
    Center,
    Right,
}

/// Display options chosen on the controller. Every field is optional; the
/// overlay supplies its own defaults. Image and video sources may be plain
/// URLs or data URIs and are passed through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_video: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_opacity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_align: Option<TextAlign>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub justify_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub align_items: Option<String>,
}

impl StyleOptions {
    pub fn validate(&self) -> Result<(), RelayError> {
        if let Some(opacity) = self.background_opacity {
            if !(0.0..=1.0).contains(&opacity) {
                return Err(RelayError::InvalidStyle(format!(
                    "backgroundOpacity {opacity} outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// Verse variant of an update-presentation payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersePresentation {
    #[serde(rename = "verse")]
    pub content: VerseRecord,
    #[serde(rename = "styles", default)]
    pub display_style: StyleOptions,
}

/// Hymn variant of an update-presentation payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HymnPresentation {
    #[serde(rename = "hymn")]
    pub content: HymnRecord,
    #[serde(rename = "styles", default)]
    pub display_style: StyleOptions,
}

/// An event a controller emits for its overlays.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum PresentationEvent {
    SetVerse(VersePresentation),
    ClearVerse,
    SetHymn(HymnPresentation),
    ClearHymn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    UpdatePresentation,
    ClearPresentation,
}

impl PresentationEvent {
    /// Decode and validate a controller text frame.
    pub fn from_wire(text: &str) -> Result<Self, RelayError> {
        let event: Self =
            serde_json::from_str(text).map_err(|e| RelayError::MalformedFrame(e.to_string()))?;
        match &event {
            Self::SetVerse(p) => p.display_style.validate()?,
            Self::SetHymn(p) => p.display_style.validate()?,
            Self::ClearVerse | Self::ClearHymn => {}
        }
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::SetVerse(_) | Self::SetHymn(_) => EventKind::UpdatePresentation,
            Self::ClearVerse | Self::ClearHymn => EventKind::ClearPresentation,
        }
    }

    /// Wire name as received from the controller.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetVerse(_) => "setVerse",
            Self::ClearVerse => "clearVerse",
            Self::SetHymn(_) => "setHymn",
            Self::ClearHymn => "clearHymn",
        }
    }

    /// The frame overlays receive for this event.
    pub fn to_overlay_frame(&self) -> ServerFrame<'_> {
        match self {
            Self::SetVerse(p) => ServerFrame::UpdateVerse(p),
            Self::ClearVerse => ServerFrame::ClearVerse,
            Self::SetHymn(p) => ServerFrame::SetHymn(p),
            Self::ClearHymn => ServerFrame::ClearHymn,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorPayload<'a> {
    pub message: &'a str,
}

/// Frames the relay sends to clients.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerFrame<'a> {
    UpdateVerse(&'a VersePresentation),
    ClearVerse,
    SetHymn(&'a HymnPresentation),
    ClearHymn,
    /// Peer-present: at least one overlay is bound to the session.
    OverlayConnected,
    /// Peer-absent: the overlay set became empty.
    OverlayDisconnected,
    Error(ErrorPayload<'a>),
}

impl ServerFrame<'_> {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
