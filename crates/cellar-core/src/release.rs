use serde::{Deserialize, Serialize};

use crate::error::EnqueueError;

pub const GZIP_CONTENT_TYPE: &str = "application/gzip";

/// Upstream release bundle: a tag plus downloadable assets, one of which
/// is expected to be the gzip-compressed tool tarball.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub content_type: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

impl Release {
    /// Picks the one asset whose content type marks it as a gzip archive.
    /// Zero or multiple candidates reject the release as a whole.
    pub fn archive_asset(&self) -> Result<&ReleaseAsset, EnqueueError> {
        let mut candidates = self
            .assets
            .iter()
            .filter(|asset| asset.content_type == GZIP_CONTENT_TYPE);
        let first = candidates
            .next()
            .ok_or_else(|| EnqueueError::NoArchiveAsset(self.tag_name.clone()))?;
        let extra = candidates.count();
        if extra > 0 {
            return Err(EnqueueError::AmbiguousArchiveAsset {
                tag: self.tag_name.clone(),
                count: extra + 1,
            });
        }
        Ok(first)
    }
}
