// CCLAB: Reproducible Congestion-Control Experiments on Emulated Network Paths
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Video quality of a received stream, compared to the sent one with `ffmpeg`.

use std::{fs, path::Path, process::Stdio};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::FlowError;

/// Name of the file that stores the derived metrics in the flow directory.
pub const QUALITY_FILE: &str = "video_quality.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Average structural similarity over all frames and planes
    pub ssim: Option<f64>,
    /// Average peak signal-to-noise ratio, in dB. `inf` for identical videos.
    #[serde(default, with = "cclab_utils::serde::option_float")]
    pub psnr: Option<f64>,
}

lazy_static! {
    static ref SSIM: Regex = Regex::new(r"SSIM .*All:\s*([0-9.]+)").unwrap();
    static ref PSNR: Regex = Regex::new(r"PSNR .*average:\s*([0-9.]+|inf)").unwrap();
}

/// Extract the SSIM average from the summary `ffmpeg` prints to stderr.
pub fn parse_ssim(output: &str) -> Option<f64> {
    SSIM.captures_iter(output)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Extract the PSNR average from the summary `ffmpeg` prints to stderr.
pub fn parse_psnr(output: &str) -> Option<f64> {
    PSNR.captures_iter(output)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| match m.as_str() {
            "inf" => Some(f64::INFINITY),
            x => x.parse().ok(),
        })
}

async fn ffmpeg(filter: &str, distorted: &Path, reference: &Path) -> Result<String, FlowError> {
    let output = Command::new("ffmpeg")
        .args(["-hide_banner", "-nostats", "-i"])
        .arg(distorted)
        .arg("-i")
        .arg(reference)
        .args(["-lavfi", filter, "-f", "null", "-"])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| FlowError::Spawn("ffmpeg".to_string(), e))?;
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if output.status.success() {
        Ok(stderr)
    } else {
        Err(FlowError::Tool(
            format!("ffmpeg -lavfi {filter}"),
            stderr.lines().last().unwrap_or_default().to_string(),
        ))
    }
}

/// Derive the quality metrics of `distorted` relative to `reference`, and store them in
/// `{dir}/video_quality.json`. Returns `None` if one of the two videos does not exist.
pub async fn derive_and_store(
    reference: &Path,
    distorted: &Path,
    dir: &Path,
) -> Result<Option<QualityMetrics>, FlowError> {
    for video in [reference, distorted] {
        if !video.exists() {
            log::warn!(
                "[quality] {} does not exist, skipping quality metrics",
                video.to_string_lossy()
            );
            return Ok(None);
        }
    }
    let metrics = QualityMetrics {
        ssim: parse_ssim(&ffmpeg("ssim", distorted, reference).await?),
        psnr: parse_psnr(&ffmpeg("psnr", distorted, reference).await?),
    };
    log::debug!("[quality] {}: {metrics:?}", distorted.to_string_lossy());
    fs::write(dir.join(QUALITY_FILE), serde_json::to_string_pretty(&metrics)?)?;
    Ok(Some(metrics))
}
