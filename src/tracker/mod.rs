//! 平面 marker 跟踪器
//!
//! 给定一张 marker 图像，在视频流中检测并持续跟踪它。
//! 两个阶段：先用单应矩阵引导建立对应关系，
//! 再用稀疏光流逐帧推进，并周期性地用 2D-3D 对应求解 3D 位姿。
//! 特征数量不足时自动回到引导阶段重新开始。

use nalgebra::Matrix4;
use opencv::core::{Mat, Point2d, Point2f, Point3d, Size, TermCriteria, Vector};
use opencv::prelude::*;

use crate::camera::PinholeCamera;
use crate::config::*;
use crate::error::TrackerError;
use crate::feature_backend::{keypoint_positions, to_gray, FeatureBackend};
use crate::global_types::TrackingState;
use crate::pose::{model_view_from_rt, solve_pose};

pub struct Tracker<B: FeatureBackend> {
    backend: B,
    camera: PinholeCamera,

    // marker 注册后不再变化
    marker_kp: Vector<Point2f>,
    marker_desc: Mat,
    marker_bb: Vector<Point2f>,
    marker_size: Size,

    state: TrackingState,
    /// 当前跟踪的特征点位置，和 [Self::features_on_marker] 永远等长。
    tracked_features: Vector<Point2f>,
    /// 每个跟踪点对应的 marker 特征点下标
    features_on_marker: Vec<usize>,
    prev_gray: Mat,
    homography: Mat,

    /// 上一次 PnP 的结果，作为下一次求解的初始值。
    pose_seed: Option<(Mat, Mat)>,
    model_view: Option<Matrix4<f64>>,
}

/// 删除 keep 为 false 的点。
pub(crate) fn keep_points(v: &Vector<Point2f>, keep: &[bool]) -> Vector<Point2f> {
    keep.iter()
        .zip(v.iter())
        .filter(|(k, _)| **k)
        .map(|(_, p)| p)
        .collect()
}

pub(crate) fn keep_indices(v: &[usize], keep: &[bool]) -> Vec<usize> {
    keep.iter()
        .zip(v.iter())
        .filter(|(k, _)| **k)
        .map(|(_, i)| *i)
        .collect()
}

/// 判断点是否在图像边界内。
#[inline]
pub(crate) fn in_border(pt: &Point2f, cols: i32, rows: i32) -> bool {
    const BORDER_SIZE: i32 = 1;
    let img_x = pt.x.round() as i32;
    let img_y = pt.y.round() as i32;

    img_x >= BORDER_SIZE
        && img_x < cols - BORDER_SIZE
        && img_y >= BORDER_SIZE
        && img_y < rows - BORDER_SIZE
}

/// 计算两个点之间的欧几里得距离。
#[inline]
pub(crate) fn distance(a: &Point2f, b: &Point2f) -> f32 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    (dx * dx + dy * dy).sqrt()
}

/// LK 光流推进一组点，返回新位置和保留标记。
/// 正向光流之后可选地做反向光流校验，去掉往返误差大的点。
pub(crate) fn flow_forward(
    prev_gray: &Mat,
    cur_gray: &Mat,
    prev_pts: &Vector<Point2f>,
) -> (Vector<Point2f>, Vec<bool>) {
    if prev_pts.is_empty() {
        return (Vector::new(), Vec::new());
    }
    let mut cur_pts = Vector::<Point2f>::new();
    let mut status = Vector::<u8>::new();
    let mut err = Vector::<f32>::new();
    opencv::video::calc_optical_flow_pyr_lk(
        prev_gray,
        cur_gray,
        prev_pts,
        &mut cur_pts,
        &mut status,
        &mut err,
        Size::new(LK_WIN_SIZE, LK_WIN_SIZE),
        LK_MAX_LEVEL,
        TermCriteria::default().unwrap(),
        0,
        1e-4,
    )
    .unwrap();

    let mut keep: Vec<bool> = (0..prev_pts.len())
        .map(|i| status.get(i).unwrap() != 0 && err.get(i).unwrap() < LK_MAX_ERROR)
        .collect();

    if FLOW_BACK {
        let mut reverse_pts = prev_pts.clone();
        let mut reverse_status = Vector::<u8>::new();
        let mut reverse_err = Vector::<f32>::new();
        opencv::video::calc_optical_flow_pyr_lk(
            cur_gray,
            prev_gray,
            &cur_pts,
            &mut reverse_pts,
            &mut reverse_status,
            &mut reverse_err,
            Size::new(LK_WIN_SIZE, LK_WIN_SIZE),
            1,
            TermCriteria::default().unwrap(),
            opencv::video::OPTFLOW_USE_INITIAL_FLOW,
            1e-4,
        )
        .unwrap();
        for i in 0..keep.len() {
            keep[i] = keep[i]
                && reverse_status.get(i).unwrap() != 0
                && distance(&prev_pts.get(i).unwrap(), &reverse_pts.get(i).unwrap())
                    <= FLOW_BACK_DIST;
        }
    }

    for i in 0..keep.len() {
        keep[i] = keep[i] && in_border(&cur_pts.get(i).unwrap(), cur_gray.cols(), cur_gray.rows());
    }
    (cur_pts, keep)
}

impl<B: FeatureBackend> Tracker<B> {
    pub fn new(backend: B, camera: PinholeCamera) -> Self {
        Self {
            backend,
            camera,
            marker_kp: Vector::new(),
            marker_desc: Mat::default(),
            marker_bb: Vector::new(),
            marker_size: Size::default(),
            state: TrackingState::Idle,
            tracked_features: Vector::new(),
            features_on_marker: Vec::new(),
            prev_gray: Mat::default(),
            homography: Mat::default(),
            pose_seed: None,
            model_view: None,
        }
    }

    /// 注册要跟踪的 marker。纹理太弱（特征点不足）时失败，不改动任何状态。
    pub fn set_marker(&mut self, marker: &Mat) -> Result<(), TrackerError> {
        if marker.empty() {
            return Err(TrackerError::EmptyInput);
        }
        let gray = to_gray(marker);
        let (keypoints, descriptors) = self
            .backend
            .detect_and_compute(&gray, &Mat::default())
            .map_err(|_| TrackerError::EmptyInput)?;
        if keypoints.len() < MIN_MARKER_KEYPOINTS {
            return Err(TrackerError::InsufficientFeatures {
                found: keypoints.len(),
                needed: MIN_MARKER_KEYPOINTS,
            });
        }

        let w = gray.cols() as f32;
        let h = gray.rows() as f32;
        self.marker_kp = keypoint_positions(&keypoints);
        self.marker_desc = descriptors;
        self.marker_bb = Vector::from_iter([
            Point2f::new(0.0, 0.0),
            Point2f::new(w, 0.0),
            Point2f::new(w, h),
            Point2f::new(0.0, h),
        ]);
        self.marker_size = Size::new(gray.cols(), gray.rows());
        self.tracked_features.clear();
        self.features_on_marker.clear();
        self.pose_seed = None;
        self.state = TrackingState::Bootstrapping;
        log::info!("marker set: {} keypoints", self.marker_kp.len());
        Ok(())
    }

    /// 单应矩阵引导：帧描述子和 marker 描述子做比值检验匹配，
    /// RANSAC 估计 marker 平面到图像的单应，只保留内点。
    /// 内点足够则进入跟踪阶段，否则下一帧重试。
    pub fn bootstrap_tracking(
        &mut self,
        gray: &Mat,
        use_homography: Option<&Mat>,
        mask: &Mat,
    ) -> Result<(), TrackerError> {
        let (keypoints, descriptors) = self
            .backend
            .detect_and_compute(gray, mask)
            .map_err(|_| TrackerError::EmptyInput)?;
        if descriptors.rows() < 2 {
            return Err(TrackerError::InsufficientFeatures {
                found: descriptors.rows() as usize,
                needed: MIN_BOOTSTRAP_INLIERS,
            });
        }
        let frame_pts = keypoint_positions(&keypoints);

        // ratio test 去掉模糊匹配
        let matches = self
            .backend
            .knn_match(&descriptors, &self.marker_desc, 2)
            .map_err(|_| TrackerError::EmptyInput)?;
        let mut marker_pts = Vector::<Point2f>::new();
        let mut frame_matched = Vector::<Point2f>::new();
        let mut marker_idx = Vec::<usize>::new();
        for pair in matches.iter() {
            if pair.len() < 2 {
                continue;
            }
            let best = pair.get(0).unwrap();
            let second = pair.get(1).unwrap();
            if best.distance < LOWE_RATIO * second.distance {
                marker_pts.push(self.marker_kp.get(best.train_idx as usize).unwrap());
                frame_matched.push(frame_pts.get(best.query_idx as usize).unwrap());
                marker_idx.push(best.train_idx as usize);
            }
        }

        // 调用方给了单应时先用它过滤匹配
        if let Some(h) = use_homography {
            if !h.empty() {
                let mut warped = Vector::<Point2f>::new();
                opencv::core::perspective_transform(&marker_pts, &mut warped, h).unwrap();
                let keep: Vec<bool> = (0..marker_pts.len())
                    .map(|i| {
                        distance(&warped.get(i).unwrap(), &frame_matched.get(i).unwrap())
                            <= 2.0 * RANSAC_REPROJ_THRESHOLD as f32
                    })
                    .collect();
                marker_pts = keep_points(&marker_pts, &keep);
                frame_matched = keep_points(&frame_matched, &keep);
                marker_idx = keep_indices(&marker_idx, &keep);
            }
        }

        if marker_pts.len() < MIN_BOOTSTRAP_INLIERS {
            return Err(TrackerError::InsufficientFeatures {
                found: marker_pts.len(),
                needed: MIN_BOOTSTRAP_INLIERS,
            });
        }

        let mut inlier_mask = Vector::<u8>::new();
        let homography = opencv::calib3d::find_homography(
            &marker_pts,
            &frame_matched,
            &mut inlier_mask,
            opencv::calib3d::RANSAC,
            RANSAC_REPROJ_THRESHOLD,
        )
        .unwrap_or_default();
        if homography.empty() {
            return Err(TrackerError::DegenerateGeometry("homography not found"));
        }

        let keep: Vec<bool> = (0..frame_matched.len())
            .map(|i| inlier_mask.get(i).unwrap() != 0)
            .collect();
        let inliers = keep.iter().filter(|k| **k).count();
        if inliers < MIN_BOOTSTRAP_INLIERS {
            return Err(TrackerError::InsufficientFeatures {
                found: inliers,
                needed: MIN_BOOTSTRAP_INLIERS,
            });
        }

        self.tracked_features = keep_points(&frame_matched, &keep);
        self.features_on_marker = keep_indices(&marker_idx, &keep);
        log::debug!(
            "homography: {}",
            crate::global_cast::MatPrinter(homography.clone())
        );
        self.homography = homography;
        self.prev_gray = gray.clone();
        self.state = TrackingState::Tracking;
        log::info!("bootstrap ok: {} inliers", inliers);
        Ok(())
    }

    /// 光流推进所有跟踪点，失败点连同对应下标一起删除。
    /// 剩余数量低于下限时跟踪丢失，回到引导阶段。
    pub fn track(&mut self, gray: &Mat) -> Result<(), TrackerError> {
        let (cur_pts, keep) = flow_forward(&self.prev_gray, gray, &self.tracked_features);
        self.tracked_features = keep_points(&cur_pts, &keep);
        self.features_on_marker = keep_indices(&self.features_on_marker, &keep);
        self.prev_gray = gray.clone();

        if self.tracked_features.len() < MIN_TRACKED_FEATURES {
            let left = self.tracked_features.len();
            self.tracked_features.clear();
            self.features_on_marker.clear();
            self.pose_seed = None;
            self.state = TrackingState::Bootstrapping;
            log::warn!("tracking lost with {} features, back to bootstrap", left);
            return Err(TrackerError::TrackingLost { left });
        }
        Ok(())
    }

    /// 每帧驱动入口：按状态分发，然后在对应点足够时更新位姿。
    pub fn process(&mut self, frame: &Mat, mask: &Mat) -> Result<(), TrackerError> {
        if frame.empty() {
            return Err(TrackerError::EmptyInput);
        }
        let gray = to_gray(frame);
        match self.state {
            TrackingState::Idle => {
                log::warn!("process called before set_marker");
                Ok(())
            }
            TrackingState::Bootstrapping => self.bootstrap_tracking(&gray, None, mask),
            TrackingState::Tracking => {
                self.track(&gray)?;
                if self.can_calc_model_view_matrix() {
                    self.calc_model_view_matrix();
                }
                Ok(())
            }
        }
    }

    pub fn can_calc_model_view_matrix(&self) -> bool {
        self.state == TrackingState::Tracking
            && self.tracked_features.len() >= MIN_PNP_CORRESPONDENCES
    }

    /// 跟踪点和 marker 平面（z=0，以 marker 中心为原点）上的对应点做 PnP，
    /// 结果转换到渲染约定。求解失败时矩阵保持上一次的值。
    pub fn calc_model_view_matrix(&mut self) {
        if self.tracked_features.len() < MIN_PNP_CORRESPONDENCES {
            return;
        }
        let half_w = self.marker_size.width as f64 / 2.0;
        let half_h = self.marker_size.height as f64 / 2.0;
        let mut object_points = Vector::<Point3d>::new();
        let mut image_points = Vector::<Point2d>::new();
        for (pt, idx) in self
            .tracked_features
            .iter()
            .zip(self.features_on_marker.iter())
        {
            let mp = self.marker_kp.get(*idx).unwrap();
            object_points.push(Point3d::new(mp.x as f64 - half_w, mp.y as f64 - half_h, 0.0));
            image_points.push(Point2d::new(pt.x as f64, pt.y as f64));
        }

        let seed = self.pose_seed.as_ref().map(|(r, t)| (r, t));
        if let Some(solved) = solve_pose(&object_points, &image_points, &self.camera.k_mat(), seed)
        {
            self.model_view = Some(model_view_from_rt(&solved.rotation, &solved.translation));
            self.pose_seed = Some((solved.rvec, solved.tvec));
        }
    }

    /// 没有算出过位姿时返回单位矩阵。
    pub fn model_view_matrix(&self) -> Matrix4<f64> {
        self.model_view.unwrap_or_else(Matrix4::identity)
    }

    #[allow(dead_code)]
    pub fn reset(&mut self) {
        self.tracked_features.clear();
        self.features_on_marker.clear();
        self.pose_seed = None;
        self.model_view = None;
        self.state = if self.marker_kp.is_empty() {
            TrackingState::Idle
        } else {
            TrackingState::Bootstrapping
        };
    }

    #[allow(dead_code)]
    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn is_tracking(&self) -> bool {
        self.state == TrackingState::Tracking
    }

    pub fn tracked_features(&self) -> &Vector<Point2f> {
        &self.tracked_features
    }

    #[allow(dead_code)]
    pub fn features_on_marker(&self) -> &[usize] {
        &self.features_on_marker
    }

    #[allow(dead_code)]
    pub fn homography(&self) -> &Mat {
        &self.homography
    }

    #[allow(dead_code)]
    pub fn marker_bounding_box(&self) -> &Vector<Point2f> {
        &self.marker_bb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{PinholeCamera, PinholeParameters};
    use crate::feature_backend::test_support::textured_image;
    use crate::feature_backend::OrbBackend;
    use opencv::core::Scalar;

    fn test_camera() -> PinholeCamera {
        PinholeCamera::from_parameters(PinholeParameters {
            camera_name: "test".to_string(),
            image_width: 480,
            image_height: 360,
            fx: 460.0,
            fy: 460.0,
            cx: 240.0,
            cy: 180.0,
        })
        .unwrap()
    }

    fn new_tracker() -> Tracker<OrbBackend> {
        Tracker::new(OrbBackend::new().unwrap(), test_camera())
    }

    /// 已知单应矩阵，marker 变形后作为帧输入。
    fn warp(marker: &Mat, h: &Mat, width: i32, height: i32) -> Mat {
        let mut frame = Mat::default();
        opencv::imgproc::warp_perspective(
            marker,
            &mut frame,
            h,
            Size::new(width, height),
            opencv::imgproc::INTER_LINEAR,
            opencv::core::BORDER_CONSTANT,
            Scalar::from(200),
        )
        .unwrap();
        frame
    }

    fn known_homography() -> Mat {
        Mat::from_slice_2d(&[
            [0.98, -0.05, 60.0],
            [0.04, 0.97, 40.0],
            [0.00004, -0.00002, 1.0],
        ])
        .unwrap()
    }

    #[test]
    fn test_set_marker_low_texture_fails_without_mutation() {
        let mut tracker = new_tracker();
        let flat =
            Mat::new_rows_cols_with_default(240, 320, opencv::core::CV_8UC1, Scalar::from(128))
                .unwrap();
        let err = tracker.set_marker(&flat).unwrap_err();
        assert!(matches!(err, TrackerError::InsufficientFeatures { .. }));
        assert_eq!(tracker.state(), TrackingState::Idle);
        assert!(tracker.marker_kp.is_empty());
    }

    #[test]
    fn test_set_marker_empty_input() {
        let mut tracker = new_tracker();
        assert_eq!(
            tracker.set_marker(&Mat::default()),
            Err(TrackerError::EmptyInput)
        );
    }

    #[test]
    fn test_bootstrap_recovers_known_homography() {
        let mut tracker = new_tracker();
        let marker = textured_image(320, 240, 42);
        tracker.set_marker(&marker).unwrap();
        assert_eq!(tracker.state(), TrackingState::Bootstrapping);

        let h_true = known_homography();
        let frame = warp(&marker, &h_true, 480, 360);
        tracker
            .bootstrap_tracking(&frame, None, &Mat::default())
            .unwrap();
        assert_eq!(tracker.state(), TrackingState::Tracking);

        // 比较四个角点在两个单应下的投影
        let corners = tracker.marker_bounding_box().clone();
        let mut by_true = Vector::<Point2f>::new();
        let mut by_est = Vector::<Point2f>::new();
        opencv::core::perspective_transform(&corners, &mut by_true, &h_true).unwrap();
        opencv::core::perspective_transform(&corners, &mut by_est, tracker.homography()).unwrap();
        for i in 0..4 {
            let d = distance(&by_true.get(i).unwrap(), &by_est.get(i).unwrap());
            assert!(d < 5.0, "corner {} off by {} px", i, d);
        }
    }

    #[test]
    fn test_pose_computed_after_bootstrap_and_track() {
        let mut tracker = new_tracker();
        let marker = textured_image(320, 240, 42);
        tracker.set_marker(&marker).unwrap();
        assert_eq!(tracker.model_view_matrix(), Matrix4::identity());

        let frame = warp(&marker, &known_homography(), 480, 360);
        tracker.process(&frame, &Mat::default()).unwrap();
        assert!(tracker.is_tracking());
        // 同一帧再跟踪一次，光流位移为零，位姿可以求解。
        tracker.process(&frame, &Mat::default()).unwrap();
        assert_ne!(tracker.model_view_matrix(), Matrix4::identity());
    }

    #[test]
    fn test_features_and_links_stay_equal_length() {
        let mut tracker = new_tracker();
        let marker = textured_image(320, 240, 42);
        tracker.set_marker(&marker).unwrap();
        let frame = warp(&marker, &known_homography(), 480, 360);
        tracker.process(&frame, &Mat::default()).unwrap();
        assert_eq!(
            tracker.tracked_features().len(),
            tracker.features_on_marker().len()
        );
        for _ in 0..3 {
            let _ = tracker.process(&frame, &Mat::default());
            assert_eq!(
                tracker.tracked_features().len(),
                tracker.features_on_marker().len()
            );
        }
    }

    #[test]
    fn test_tracking_lost_returns_to_bootstrap() {
        let mut tracker = new_tracker();
        let marker = textured_image(320, 240, 42);
        tracker.set_marker(&marker).unwrap();
        let frame = warp(&marker, &known_homography(), 480, 360);
        tracker.process(&frame, &Mat::default()).unwrap();
        assert!(tracker.is_tracking());

        // 全黑帧上光流全部失败，触发跟踪丢失。
        let black =
            Mat::new_rows_cols_with_default(360, 480, opencv::core::CV_8UC1, Scalar::from(0))
                .unwrap();
        let err = tracker.process(&black, &Mat::default()).unwrap_err();
        assert!(matches!(err, TrackerError::TrackingLost { .. }));
        assert_eq!(tracker.state(), TrackingState::Bootstrapping);
        assert_eq!(tracker.tracked_features().len(), 0);
        assert_eq!(tracker.features_on_marker().len(), 0);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut tracker = new_tracker();
        let marker = textured_image(320, 240, 42);
        tracker.set_marker(&marker).unwrap();
        let frame = warp(&marker, &known_homography(), 480, 360);
        tracker.process(&frame, &Mat::default()).unwrap();
        tracker.reset();
        assert_eq!(tracker.state(), TrackingState::Bootstrapping);
        assert_eq!(tracker.tracked_features().len(), 0);
    }
}
