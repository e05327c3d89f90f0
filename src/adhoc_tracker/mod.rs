//! 自建 marker 跟踪器
//!
//! 不需要预先注册的 marker：从任意有纹理的表面上取两帧，
//! 用两视图 SfM（基础矩阵 -> 本质矩阵 -> 三角化）建立自己的 3D 点云，
//! 之后和平面跟踪器一样用光流 + PnP 逐帧更新位姿。

pub mod two_view;

use nalgebra::{Matrix4, Rotation3, Vector2};
use opencv::core::{Mat, Point2d, Point2f, Point3d, Vector};
use opencv::prelude::*;

use crate::camera::PinholeCamera;
use crate::config::*;
use crate::error::TrackerError;
use crate::feature_backend::{keypoint_positions, to_gray, FeatureBackend};
use crate::global_cast::Matrix3d;
use crate::global_types::TrackingState;
use crate::pose::{model_view_from_rt, solve_pose};
use crate::tracker::{distance, flow_forward, keep_points};

use two_view::{decompose_e_to_r_and_t, pose_matrix, triangulate_and_check_reproj};

pub struct SimpleAdHocTracker<B: FeatureBackend> {
    backend: B,
    camera: PinholeCamera,

    state: TrackingState,
    /// 第一视图里的参考位置，引导期间和 [Self::tracked_features] 同步删减。
    bootstrap_kp: Vector<Point2f>,
    tracked_features: Vector<Point2f>,
    /// 三角化出的点云，跟踪阶段和 [Self::tracked_features] 永远等长。
    tracked_features_3d: Vec<Point3d>,
    prev_gray: Mat,

    pose_seed: Option<(Mat, Mat)>,
    model_view: Option<Matrix4<f64>>,
}

fn keep_points_3d(v: &[Point3d], keep: &[bool]) -> Vec<Point3d> {
    keep.iter()
        .zip(v.iter())
        .filter(|(k, _)| **k)
        .map(|(_, p)| *p)
        .collect()
}

impl<B: FeatureBackend> SimpleAdHocTracker<B> {
    pub fn new(backend: B, camera: PinholeCamera) -> Self {
        Self {
            backend,
            camera,
            state: TrackingState::Idle,
            bootstrap_kp: Vector::new(),
            tracked_features: Vector::new(),
            tracked_features_3d: Vec::new(),
            prev_gray: Mat::default(),
            pose_seed: None,
            model_view: None,
        }
    }

    /// 把当前帧作为第一视图，重新开始引导。
    #[allow(dead_code)]
    pub fn bootstrap(&mut self, frame: &Mat) -> Result<(), TrackerError> {
        if frame.empty() {
            return Err(TrackerError::EmptyInput);
        }
        self.bootstrap_gray(&to_gray(frame))
    }

    fn bootstrap_gray(&mut self, gray: &Mat) -> Result<(), TrackerError> {
        let keypoints = self
            .backend
            .detect(gray, &Mat::default())
            .map_err(|_| TrackerError::EmptyInput)?;
        if keypoints.len() < MIN_MARKER_KEYPOINTS {
            return Err(TrackerError::InsufficientFeatures {
                found: keypoints.len(),
                needed: MIN_MARKER_KEYPOINTS,
            });
        }
        self.bootstrap_kp = keypoint_positions(&keypoints);
        self.tracked_features = self.bootstrap_kp.clone();
        self.tracked_features_3d.clear();
        self.prev_gray = gray.clone();
        self.pose_seed = None;
        self.state = TrackingState::Bootstrapping;
        log::info!("adhoc bootstrap: {} keypoints", self.bootstrap_kp.len());
        Ok(())
    }

    /// 把第一视图的特征点光流跟踪到当前帧。
    /// 平均视差足够、并且点对不能被纯单应解释时才尝试三角化；
    /// 否则留在引导阶段等待更好的第二帧。
    pub fn bootstrap_track(&mut self, gray: &Mat) -> Result<(), TrackerError> {
        if self.tracked_features.is_empty() {
            return self.bootstrap_gray(gray);
        }
        let (cur_pts, keep) = flow_forward(&self.prev_gray, gray, &self.tracked_features);
        self.tracked_features = keep_points(&cur_pts, &keep);
        self.bootstrap_kp = keep_points(&self.bootstrap_kp, &keep);
        self.prev_gray = gray.clone();

        if self.tracked_features.len() < MIN_TRACKED_FEATURES {
            let left = self.tracked_features.len();
            log::warn!("adhoc bootstrap lost with {} features, reseeding", left);
            self.bootstrap_gray(gray)?;
            return Err(TrackerError::TrackingLost { left });
        }

        // 平均视差
        let n = self.tracked_features.len();
        let mut sum_parallax = 0.0f64;
        for i in 0..n {
            sum_parallax += distance(
                &self.bootstrap_kp.get(i).unwrap(),
                &self.tracked_features.get(i).unwrap(),
            ) as f64;
        }
        let average_parallax = sum_parallax / n as f64;
        if average_parallax < MIN_BOOTSTRAP_PARALLAX {
            log::debug!("parallax {:.1}px, waiting", average_parallax);
            return Ok(());
        }

        // 退化检查：单应内点比例过高说明是纯平面或纯旋转。
        let mut inlier_mask = Vector::<u8>::new();
        let homography = opencv::calib3d::find_homography(
            &self.tracked_features,
            &self.bootstrap_kp,
            &mut inlier_mask,
            opencv::calib3d::RANSAC,
            RANSAC_REPROJ_THRESHOLD,
        )
        .unwrap_or_default();
        if !homography.empty() {
            let inliers = opencv::core::count_non_zero(&inlier_mask).unwrap_or(0);
            let ratio = inliers as f64 / n as f64;
            if ratio >= PLANAR_DEGENERACY_RATIO {
                log::debug!("homography explains {:.0}% of pairs, degenerate", ratio * 100.0);
                return Err(TrackerError::DegenerateGeometry("planar two-view pair"));
            }
        }

        self.camera_pose_and_triangulation_from_fundamental()
    }

    /// 基础矩阵 -> 本质矩阵 -> 四个候选位姿逐个做三角化检验，
    /// 第一个通过的候选生成点云并进入跟踪阶段。
    pub fn camera_pose_and_triangulation_from_fundamental(&mut self) -> Result<(), TrackerError> {
        let n = self.tracked_features.len();
        if n < MIN_TWO_VIEW_PAIRS {
            return Err(TrackerError::InsufficientFeatures {
                found: n,
                needed: MIN_TWO_VIEW_PAIRS,
            });
        }

        let mut mask = Vector::<u8>::new();
        let fund_mat = opencv::calib3d::find_fundamental_mat_1(
            &self.bootstrap_kp,
            &self.tracked_features,
            opencv::calib3d::FM_RANSAC,
            1.0,
            0.99,
            &mut mask,
        )
        .unwrap_or_default();
        if fund_mat.rows() != 3 || fund_mat.cols() != 3 {
            return Err(TrackerError::DegenerateGeometry("fundamental not found"));
        }

        // 只保留基础矩阵的内点
        let keep: Vec<bool> = (0..n).map(|i| mask.get(i).unwrap() != 0).collect();
        self.bootstrap_kp = keep_points(&self.bootstrap_kp, &keep);
        self.tracked_features = keep_points(&self.tracked_features, &keep);
        let n = self.tracked_features.len();
        if n < MIN_TWO_VIEW_PAIRS {
            return Err(TrackerError::InsufficientFeatures {
                found: n,
                needed: MIN_TWO_VIEW_PAIRS,
            });
        }

        // E = K^T F K
        let f = Matrix3d::from(fund_mat).0;
        let k = *self.camera.k();
        let e = k.transpose() * f * k;
        let decomposition = decompose_e_to_r_and_t(&e)
            .ok_or(TrackerError::DegenerateGeometry("essential decomposition"))?;

        let mut norm0 = Vec::with_capacity(n);
        let mut norm1 = Vec::with_capacity(n);
        let mut px0 = Vec::with_capacity(n);
        let mut px1 = Vec::with_capacity(n);
        for i in 0..n {
            let a = self.bootstrap_kp.get(i).unwrap();
            let b = self.tracked_features.get(i).unwrap();
            let la = self
                .camera
                .lift_projective(&Point2d::new(a.x as f64, a.y as f64));
            let lb = self
                .camera
                .lift_projective(&Point2d::new(b.x as f64, b.y as f64));
            norm0.push(Vector2::new(la.x / la.z, la.y / la.z));
            norm1.push(Vector2::new(lb.x / lb.z, lb.y / lb.z));
            px0.push(Vector2::new(a.x as f64, a.y as f64));
            px1.push(Vector2::new(b.x as f64, b.y as f64));
        }

        let pose0 = Matrix4::<f64>::identity();
        for (rc, tc) in decomposition.candidates() {
            let pose1 = pose_matrix(&rc, &tc);
            let check =
                triangulate_and_check_reproj(&pose0, &pose1, &norm0, &norm1, &px0, &px1, &k);
            if !check.accepted {
                continue;
            }
            // 三角化失败的点对两边同步删除，保持 2D 和 3D 等长。
            self.bootstrap_kp = keep_points(&self.bootstrap_kp, &check.kept);
            self.tracked_features = keep_points(&self.tracked_features, &check.kept);
            self.tracked_features_3d = check
                .points
                .iter()
                .map(|p| Point3d::new(p.x, p.y, p.z))
                .collect();
            let rotation = Rotation3::from_matrix_unchecked(rc);
            let rvec: Mat = crate::global_cast::Rotation3d(rotation).into();
            let tvec: Mat = crate::global_cast::Vector3d(tc).into();
            self.pose_seed = Some((rvec, tvec));
            self.state = TrackingState::Tracking;
            log::info!(
                "adhoc map built: {} points, mean reproj {:.2}px",
                self.tracked_features_3d.len(),
                check.mean_reproj_error
            );
            return Ok(());
        }
        Err(TrackerError::DegenerateGeometry("no positive-depth candidate"))
    }

    /// 光流推进，2D 点和 3D 点同步删减。
    pub fn track(&mut self, gray: &Mat) -> Result<(), TrackerError> {
        let (cur_pts, keep) = flow_forward(&self.prev_gray, gray, &self.tracked_features);
        self.tracked_features = keep_points(&cur_pts, &keep);
        self.tracked_features_3d = keep_points_3d(&self.tracked_features_3d, &keep);
        self.prev_gray = gray.clone();

        if self.tracked_features.len() < MIN_TRACKED_FEATURES {
            let left = self.tracked_features.len();
            self.tracked_features_3d.clear();
            self.pose_seed = None;
            log::warn!("adhoc tracking lost with {} features", left);
            // 丢失后直接用当前帧重新引导
            if self.bootstrap_gray(gray).is_err() {
                self.bootstrap_kp.clear();
                self.tracked_features.clear();
            }
            self.state = TrackingState::Bootstrapping;
            return Err(TrackerError::TrackingLost { left });
        }
        Ok(())
    }

    /// 每帧驱动入口。`newmap` 为真时丢弃现有点云，从当前帧重新引导。
    pub fn process(&mut self, frame: &Mat, newmap: bool) -> Result<(), TrackerError> {
        if frame.empty() {
            return Err(TrackerError::EmptyInput);
        }
        let gray = to_gray(frame);
        if newmap || self.state == TrackingState::Idle {
            return self.bootstrap_gray(&gray);
        }
        match self.state {
            TrackingState::Idle => unreachable!(),
            TrackingState::Bootstrapping => self.bootstrap_track(&gray),
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
            && self.tracked_features.len() == self.tracked_features_3d.len()
    }

    /// 点云和当前 2D 观测做 PnP，失败时矩阵保持上一次的值。
    pub fn calc_model_view_matrix(&mut self) {
        if self.tracked_features.len() < MIN_PNP_CORRESPONDENCES {
            return;
        }
        let object_points: Vector<Point3d> = self.tracked_features_3d.iter().copied().collect();
        let image_points: Vector<Point2d> = self
            .tracked_features
            .iter()
            .map(|p| Point2d::new(p.x as f64, p.y as f64))
            .collect();

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
        self.bootstrap_kp.clear();
        self.tracked_features.clear();
        self.tracked_features_3d.clear();
        self.pose_seed = None;
        self.model_view = None;
        self.state = TrackingState::Idle;
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn is_tracking(&self) -> bool {
        self.state == TrackingState::Tracking
    }

    pub fn tracked_features(&self) -> &Vector<Point2f> {
        &self.tracked_features
    }

    pub fn tracked_points_3d(&self) -> &[Point3d] {
        &self.tracked_features_3d
    }
}
