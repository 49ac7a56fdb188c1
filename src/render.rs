//! Turns canonical playback state into the message shown on the surface.

use crate::models::{Embed, EmbedField, EmbedFooter, EmbedImage, MessagePayload};
use crate::playback::{Playback, PlaybackState};
use crate::utils::{format_clock, unix_seconds};

/// Content of the message while nothing is playing.
pub const IDLE_CONTENT: &str = "idle";

const PLAYING_COLOR: u32 = 0x1D_B9_54;
const PAUSED_COLOR: u32 = 0x53_53_53;

pub fn render(playback: &Playback) -> MessagePayload {
    match playback {
        Playback::Idle => MessagePayload {
            content: IDLE_CONTENT.to_string(),
            embeds: Vec::new(),
        },
        Playback::Track(state) => MessagePayload {
            content: String::new(),
            embeds: vec![track_embed(state)],
        },
    }
}

fn track_embed(state: &PlaybackState) -> Embed {
    let artists = if state.artist_names.is_empty() {
        "unknown artist".to_string()
    } else {
        state.artist_names.join(", ")
    };
    let description = if state.is_playing {
        format!("{}\nends <t:{}:R>", artists, unix_seconds(state.ends_at))
    } else {
        artists
    };

    Embed {
        title: Some(state.title.clone()),
        url: state.track_url.clone(),
        description: Some(description),
        color: Some(if state.is_playing {
            PLAYING_COLOR
        } else {
            PAUSED_COLOR
        }),
        thumbnail: state
            .album_art_url
            .as_ref()
            .map(|url| EmbedImage { url: url.clone() }),
        fields: vec![EmbedField {
            name: "progress".to_string(),
            value: format!(
                "{} / {}",
                format_clock(state.progress_ms),
                format_clock(state.duration_ms)
            ),
            inline: true,
        }],
        footer: Some(EmbedFooter {
            text: if state.is_playing { "playing" } else { "paused" }.to_string(),
        }),
    }
}
