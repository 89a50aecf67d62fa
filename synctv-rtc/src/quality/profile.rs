//! Stream quality tiers

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A named quality tier of the bitrate ladder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProfile {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
}

impl StreamProfile {
    fn tier(
        name: &str,
        (width, height): (u32, u32),
        framerate: u32,
        (min_bitrate_kbps, max_bitrate_kbps): (u32, u32),
    ) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            framerate,
            min_bitrate_kbps,
            max_bitrate_kbps,
        }
    }
}

/// Encoder limits handed to the media transport for a profile
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncodingParameters {
    pub max_bitrate_kbps: u32,
    pub max_framerate: u32,
    /// Downscale factor relative to the top tier, when the transport supports it
    pub scale_resolution_down_by: Option<f64>,
}

/// Ordered set of stream profiles, lowest tier first
#[derive(Debug, Clone)]
pub struct ProfileLadder {
    tiers: Vec<Arc<StreamProfile>>,
}

impl ProfileLadder {
    /// Seven tiers from minimal to ultra
    #[must_use]
    pub fn standard() -> Self {
        Self::new(vec![
            StreamProfile::tier("minimal", (320, 180), 15, (100, 250)),
            StreamProfile::tier("low", (480, 270), 15, (250, 500)),
            StreamProfile::tier("sd", (640, 360), 24, (500, 900)),
            StreamProfile::tier("standard", (854, 480), 30, (900, 1_500)),
            StreamProfile::tier("hd", (1280, 720), 30, (1_500, 2_500)),
            StreamProfile::tier("full_hd", (1920, 1080), 30, (2_500, 4_500)),
            StreamProfile::tier("ultra", (3840, 2160), 30, (4_500, 12_000)),
        ])
    }

    #[must_use]
    pub fn new(tiers: Vec<StreamProfile>) -> Self {
        Self {
            tiers: tiers.into_iter().map(Arc::new).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    #[must_use]
    pub fn tiers(&self) -> &[Arc<StreamProfile>] {
        &self.tiers
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<StreamProfile>> {
        self.tiers.get(index)
    }

    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.tiers.iter().position(|p| p.name == name)
    }

    /// Encoder limits for the tier at `index`
    #[must_use]
    pub fn encoding_parameters(&self, index: usize) -> Option<EncodingParameters> {
        let profile = self.tiers.get(index)?;
        let top = self.tiers.last()?;
        let scale = if profile.height > 0 && profile.height < top.height {
            Some(f64::from(top.height) / f64::from(profile.height))
        } else {
            None
        };

        Some(EncodingParameters {
            max_bitrate_kbps: profile.max_bitrate_kbps,
            max_framerate: profile.framerate,
            scale_resolution_down_by: scale,
        })
    }
}
