use std::path::Path;

use super::FrameDataset;
use crate::global_types::Timestamp;

/// 带 index.csv 的图像序列目录
///
/// ```text
/// timestamp,filename
/// 1403636579763555584,frame_000.png
/// ```
#[derive(Debug, Default)]
pub struct ImageSequence {
    frames: Vec<(Timestamp, String)>,
}

impl ImageSequence {
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let dir = Path::new(path);
        let csv_path = dir.join("index.csv");
        let mut reader = csv::Reader::from_path(&csv_path)?;
        let mut frames = Vec::new();
        for record in reader.records() {
            let record = record?;
            let timestamp = record[0].trim().parse::<i64>()?;
            let name = record[1].trim().to_string();
            let frame_path = dir.join(name).to_string_lossy().to_string();
            frames.push((Timestamp(timestamp), frame_path));
        }
        frames.sort_by_key(|(t, _)| t.0);
        log::info!("dataset {}: {} frames", path, frames.len());
        Ok(Self { frames })
    }
}

impl FrameDataset for ImageSequence {
    fn frame_list(&self) -> &[(Timestamp, String)] {
        &self.frames
    }
}
