//! 特征前端
//!
//! 检测、描述、匹配三种能力抽象成一个 trait，
//! 核心算法只依赖这个契约，不依赖具体算法。

use opencv::core::{DMatch, KeyPoint, Mat, Point2f, Ptr, Vector};
use opencv::features2d::{BFMatcher, ORB_ScoreType, ORB};
use opencv::prelude::*;

pub trait FeatureBackend {
    /// 只检测特征点
    fn detect(&mut self, image: &Mat, mask: &Mat) -> opencv::Result<Vector<KeyPoint>>;
    /// 检测特征点并计算描述子
    fn detect_and_compute(
        &mut self,
        image: &Mat,
        mask: &Mat,
    ) -> opencv::Result<(Vector<KeyPoint>, Mat)>;
    /// query 的每个描述子在 train 中的 k 个最近邻
    fn knn_match(&self, query: &Mat, train: &Mat, k: i32)
        -> opencv::Result<Vector<Vector<DMatch>>>;
}

/// ORB + 汉明距离暴力匹配
pub struct OrbBackend {
    orb: Ptr<ORB>,
    matcher: Ptr<BFMatcher>,
}

impl OrbBackend {
    pub fn new() -> opencv::Result<Self> {
        let orb = ORB::create(
            crate::config::MAX_FEATURES,
            1.2,
            8,
            31,
            0,
            2,
            ORB_ScoreType::HARRIS_SCORE,
            31,
            20,
        )?;
        let matcher = BFMatcher::create(opencv::core::NORM_HAMMING, false)?;
        Ok(Self { orb, matcher })
    }
}

impl FeatureBackend for OrbBackend {
    fn detect(&mut self, image: &Mat, mask: &Mat) -> opencv::Result<Vector<KeyPoint>> {
        let mut keypoints = Vector::<KeyPoint>::new();
        self.orb.detect(image, &mut keypoints, mask)?;
        Ok(keypoints)
    }

    fn detect_and_compute(
        &mut self,
        image: &Mat,
        mask: &Mat,
    ) -> opencv::Result<(Vector<KeyPoint>, Mat)> {
        let mut keypoints = Vector::<KeyPoint>::new();
        let mut descriptors = Mat::default();
        self.orb
            .detect_and_compute(image, mask, &mut keypoints, &mut descriptors, false)?;
        Ok((keypoints, descriptors))
    }

    fn knn_match(
        &self,
        query: &Mat,
        train: &Mat,
        k: i32,
    ) -> opencv::Result<Vector<Vector<DMatch>>> {
        let mut matches = Vector::<Vector<DMatch>>::new();
        self.matcher
            .knn_train_match(query, train, &mut matches, k, &Mat::default(), false)?;
        Ok(matches)
    }
}

/// 彩色图转灰度，已经是单通道就直接克隆。
pub fn to_gray(img: &Mat) -> Mat {
    if img.channels() == 1 {
        img.clone()
    } else {
        let mut gray = Mat::default();
        opencv::imgproc::cvt_color(img, &mut gray, opencv::imgproc::COLOR_BGR2GRAY, 0).unwrap();
        gray
    }
}

/// 特征点的像素位置
pub fn keypoint_positions(keypoints: &Vector<KeyPoint>) -> Vector<Point2f> {
    keypoints.iter().map(|kp| kp.pt()).collect()
}
