//! Load request parameters
//!
//! Everything a caller supplies alongside the resource identifier. All fields
//! except `indispensable` feed the cache key, so two requests that differ only
//! in urgency still share one cache entry and one physical fetch.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where the raw bytes of a resource come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    /// Fetched over HTTP(S) through memory -> disk -> network
    #[default]
    Http,
    /// Read straight from a local path by the disk engine
    LocalFile,
}

impl SourceType {
    pub(crate) fn tag(self) -> u8 {
        match self {
            SourceType::Http => 1,
            SourceType::LocalFile => 2,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Http => write!(f, "http"),
            SourceType::LocalFile => write!(f, "local-file"),
        }
    }
}

/// Decode target format handed to the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PixelFormat {
    #[default]
    Argb8888,
    Rgb565,
    Alpha8,
    /// Keep the raw encoded bytes
    Raw,
}

impl PixelFormat {
    pub(crate) fn tag(self) -> u8 {
        match self {
            PixelFormat::Argb8888 => 1,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Alpha8 => 3,
            PixelFormat::Raw => 4,
        }
    }
}

/// Parameters of a single load
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LoadParams {
    /// Requested width (0 = original)
    pub width: u32,
    /// Requested height (0 = original)
    pub height: u32,
    pub source: SourceType,
    pub pixel_format: PixelFormat,
    /// Relaxed timeouts and a tolerant low-speed configuration
    pub indispensable: bool,
}

impl LoadParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_source(mut self, source: SourceType) -> Self {
        self.source = source;
        self
    }

    pub fn with_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    pub fn indispensable(mut self) -> Self {
        self.indispensable = true;
        self
    }
}

/// Resource identifier plus parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub resource_id: String,
    pub params: LoadParams,
}

impl LoadRequest {
    pub fn new(resource_id: impl Into<String>, params: LoadParams) -> Self {
        Self {
            resource_id: resource_id.into(),
            params,
        }
    }
}
