#![allow(dead_code)]

/// 每帧最多提取的 ORB 特征点数量
pub const MAX_FEATURES: i32 = 500;
/// 注册 marker 时最少需要的特征点数量，低于该值无法跟踪。
pub const MIN_MARKER_KEYPOINTS: usize = 25;
/// 单应矩阵引导阶段最少的内点数量（单应估计的下限是4）。
pub const MIN_BOOTSTRAP_INLIERS: usize = 4;
/// 光流跟踪的最少特征点数量，低于该值回到引导阶段。
pub const MIN_TRACKED_FEATURES: usize = 10;
/// 位姿求解（PnP）的最少对应点数量
pub const MIN_PNP_CORRESPONDENCES: usize = 4;

/// Lowe ratio test：次近邻距离比值上限
pub const LOWE_RATIO: f32 = 0.8;
/// RANSAC 重投影阈值（像素）
pub const RANSAC_REPROJ_THRESHOLD: f64 = 3.0;

/// LK 光流窗口大小
pub const LK_WIN_SIZE: i32 = 21;
/// LK 光流金字塔层数
pub const LK_MAX_LEVEL: i32 = 3;
/// LK 光流误差上限，超过则丢弃该点。
pub const LK_MAX_ERROR: f32 = 12.0;
/// 反向光流，然后匹配正向光流，进行特征点筛选。
pub const FLOW_BACK: bool = true;
/// 正反光流的距离上限（像素）
pub const FLOW_BACK_DIST: f32 = 0.5;

/// 两视图引导所需的最小平均视差（像素）
pub const MIN_BOOTSTRAP_PARALLAX: f64 = 10.0;
/// 单应内点比例超过该值认为是退化配置（纯平面或纯旋转）。
pub const PLANAR_DEGENERACY_RATIO: f64 = 0.9;
/// 估计基础矩阵最少的对应点数量（八点法的下限）。
pub const MIN_TWO_VIEW_PAIRS: usize = 8;
/// 三角化点在两个视图中深度为正的最小比例
pub const POSITIVE_DEPTH_FRACTION: f64 = 0.75;
/// 三角化后平均重投影误差上限（像素）
pub const MAX_MEAN_REPROJ_ERROR: f64 = 4.5;

/// 视觉词典的词数
pub const VOCAB_WORDS: i32 = 96;
/// PCA 降维后的维数
pub const PCA_COMPONENTS: usize = 12;
/// kNN 分类的 k
pub const KNN_K: usize = 3;
/// 最近邻距离超过该值认为没有识别出 marker。
pub const BOW_REJECT_DISTANCE: f64 = 0.55;

/// worker 等待新帧的超时（毫秒）
pub const FRAME_WAIT_MS: u64 = 20;
