//! 数据集处理
//!
//! 一个目录就是一段视频：index.csv 给出每帧的时间戳和文件名。
mod image_seq;

pub type DefaultDataset = image_seq::ImageSequence;

use crate::global_types::Timestamp;

pub trait FrameDataset {
    /// 读取图像列表
    /// 返回时间戳和图像路径，按时间升序。
    fn frame_list(&self) -> &[(Timestamp, String)];
}
