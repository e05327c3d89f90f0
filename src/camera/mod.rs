//! 相机内参
//!
//! 每个跟踪器实例持有一个固定的针孔内参矩阵 K，
//! 所有位姿计算都依赖它。

mod pinhole_camera;
pub use pinhole_camera::{PinholeCamera, PinholeParameters};
