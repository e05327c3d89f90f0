//! 位姿求解
//!
//! 2D-3D 对应点的 PnP 求解，以及检测坐标系到渲染坐标系的转换。
//! 检测约定相机看向 +Z，渲染约定看向 -Z，两者之间是固定的轴翻转。

use nalgebra::{Matrix4, Rotation3, Vector3};
use opencv::core::{Mat, Point2d, Point3d, Vector};

use crate::global_cast::{Rotation3d, Vector3d};

/// 求解出的相机位姿，rvec/tvec 保留 [Mat] 形式作为下一次求解的初始值。
pub struct SolvedPose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
    pub rvec: Mat,
    pub tvec: Mat,
}

/// PnP 求解。有初始值时用迭代法热启动，收敛失败返回 None。
pub fn solve_pose(
    object_points: &Vector<Point3d>,
    image_points: &Vector<Point2d>,
    k: &Mat,
    seed: Option<(&Mat, &Mat)>,
) -> Option<SolvedPose> {
    if object_points.len() < crate::config::MIN_PNP_CORRESPONDENCES
        || object_points.len() != image_points.len()
    {
        return None;
    }
    let d = Mat::default();

    let (mut rvec, mut tvec, use_guess) = match seed {
        Some((r, t)) => (r.clone(), t.clone(), true),
        None => (Mat::default(), Mat::default(), false),
    };

    let ok = opencv::calib3d::solve_pnp(
        object_points,
        image_points,
        k,
        &d,
        &mut rvec,
        &mut tvec,
        use_guess,
        opencv::calib3d::SOLVEPNP_ITERATIVE,
    )
    .unwrap_or(false);
    if !ok {
        return None;
    }

    let rotation = Rotation3d::from(rvec.clone()).0;
    let translation = Vector3d::from(tvec.clone()).0;
    Some(SolvedPose {
        rotation,
        translation,
        rvec,
        tvec,
    })
}

/// 检测坐标系到渲染坐标系的固定翻转
pub fn cv_to_gl() -> Matrix4<f64> {
    Matrix4::from_diagonal(&nalgebra::Vector4::new(1.0, -1.0, -1.0, 1.0))
}

/// R|t 组合成渲染约定下的 model-view 矩阵
pub fn model_view_from_rt(rotation: &Rotation3<f64>, translation: &Vector3<f64>) -> Matrix4<f64> {
    let mut rt = Matrix4::<f64>::identity();
    rt.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation.matrix());
    rt.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
    cv_to_gl() * rt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{PinholeCamera, PinholeParameters};

    fn test_camera() -> PinholeCamera {
        PinholeCamera::from_parameters(PinholeParameters {
            camera_name: "test".to_string(),
            image_width: 640,
            image_height: 480,
            fx: 460.0,
            fy: 460.0,
            cx: 320.0,
            cy: 240.0,
        })
        .unwrap()
    }

    #[test]
    fn test_solve_pose_recovers_planar_pose() {
        let cam = test_camera();
        let rotation = Rotation3::from_euler_angles(0.25, -0.1, 0.05);
        let translation = Vector3::new(0.05, -0.1, 1.5);

        let mut object_points = Vector::<Point3d>::new();
        let mut image_points = Vector::<Point2d>::new();
        for i in 0..6 {
            for j in 0..5 {
                let p = Vector3::new(i as f64 * 0.1 - 0.25, j as f64 * 0.1 - 0.2, 0.0);
                let pc = rotation * p + translation;
                object_points.push(Point3d::new(p.x, p.y, p.z));
                image_points.push(cam.project(&pc));
            }
        }

        let solved = solve_pose(&object_points, &image_points, &cam.k_mat(), None).unwrap();
        assert!((solved.rotation.matrix() - rotation.matrix()).norm() < 1e-2);
        assert!((solved.translation - translation).norm() < 1e-2);
    }

    #[test]
    fn test_solve_pose_too_few_points() {
        let cam = test_camera();
        let mut object_points = Vector::<Point3d>::new();
        let mut image_points = Vector::<Point2d>::new();
        for i in 0..3 {
            object_points.push(Point3d::new(i as f64, 0.0, 0.0));
            image_points.push(Point2d::new(i as f64, 0.0));
        }
        assert!(solve_pose(&object_points, &image_points, &cam.k_mat(), None).is_none());
    }

    #[test]
    fn test_model_view_flips_y_and_z() {
        let translation = Vector3::new(1.0, 2.0, 3.0);
        let mv = model_view_from_rt(&Rotation3::identity(), &translation);
        assert_eq!(mv[(0, 3)], 1.0);
        assert_eq!(mv[(1, 3)], -2.0);
        assert_eq!(mv[(2, 3)], -3.0);
        assert_eq!(mv[(1, 1)], -1.0);
        assert_eq!(mv[(2, 2)], -1.0);
        assert_eq!(mv[(3, 3)], 1.0);
    }
}
