//! 错误分类
//!
//! 四类可恢复错误都是稳态条件，处理循环记录日志后继续运行。

use std::fmt::Display;

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerError {
    /// 特征点或对应点不足
    InsufficientFeatures { found: usize, needed: usize },
    /// 退化几何：纯平面、无视差、或本质矩阵分解没有物理有效解。
    DegenerateGeometry(&'static str),
    /// 跟踪丢失，回到引导阶段。
    TrackingLost { left: usize },
    /// 分类距离超过阈值，没有识别出 marker。
    ClassificationUncertain,
    /// 输入图像为空或格式错误，只影响当前调用。
    EmptyInput,
    /// 词典或训练集还没有准备好
    NotTrained,
}

impl Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerError::InsufficientFeatures { found, needed } => {
                write!(f, "insufficient features: found {} need {}", found, needed)
            }
            TrackerError::DegenerateGeometry(what) => {
                write!(f, "degenerate geometry: {}", what)
            }
            TrackerError::TrackingLost { left } => {
                write!(f, "tracking lost: {} features left", left)
            }
            TrackerError::ClassificationUncertain => {
                write!(f, "no marker recognized")
            }
            TrackerError::EmptyInput => write!(f, "empty input image"),
            TrackerError::NotTrained => write!(f, "detector not trained"),
        }
    }
}

impl std::error::Error for TrackerError {}
