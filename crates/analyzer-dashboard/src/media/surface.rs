//! Headless playback surface.  Tracks what a preview tile would show; the
//! actual pixels come from the decoder process (adaptive) or from the client
//! that renders the tile (native).

use analyzer_proto::config::PreviewConfig;
use async_trait::async_trait;

use super::{MediaError, PlaybackSurface};

#[derive(Debug, Default)]
pub struct PreviewSurface {
    source: Option<String>,
    decoder: Option<String>,
    playing: bool,
    fullscreen: bool,
    autoplay: bool,
    allow_fullscreen: bool,
}

impl PreviewSurface {
    pub fn new(config: &PreviewConfig) -> Self {
        Self {
            autoplay: config.autoplay,
            allow_fullscreen: config.allow_fullscreen,
            ..Self::default()
        }
    }

    /// URL bound for native playback.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn decoder(&self) -> Option<&str> {
        self.decoder.as_deref()
    }
}

#[async_trait]
impl PlaybackSurface for PreviewSurface {
    fn reset(&mut self) {
        self.source = None;
        self.decoder = None;
        self.playing = false;
    }

    fn bind_source(&mut self, url: &str) -> Result<(), MediaError> {
        if url.trim().is_empty() {
            return Err(MediaError::Decoder("empty source".into()));
        }
        self.source = Some(url.to_string());
        Ok(())
    }

    fn attach_decoder(&mut self, decoder: &str) {
        self.decoder = Some(decoder.to_string());
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    async fn play(&mut self) -> Result<(), MediaError> {
        if self.source.is_none() && self.decoder.is_none() {
            return Err(MediaError::Decoder("nothing bound".into()));
        }
        if !self.autoplay {
            return Err(MediaError::AutoplayBlocked);
        }
        self.playing = true;
        Ok(())
    }

    async fn request_fullscreen(&mut self) -> Result<(), MediaError> {
        if !self.allow_fullscreen {
            return Err(MediaError::FullscreenRefused);
        }
        self.fullscreen = true;
        Ok(())
    }

    async fn exit_fullscreen(&mut self) -> Result<(), MediaError> {
        self.fullscreen = false;
        Ok(())
    }
}
