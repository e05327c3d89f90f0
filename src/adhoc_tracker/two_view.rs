//! 两视图几何
//!
//! 本质矩阵分解和三角化都是不可变输入上的纯函数，
//! 调用方负责在四个候选位姿里做视差/深度判别。

use nalgebra::{Matrix3, Matrix4, RowVector4, Vector2, Vector3, Vector4, SVD};

/// 本质矩阵分解出的候选：两个旋转，平移方向符号未定。
#[derive(Debug, Clone)]
pub struct EssentialDecomposition {
    pub r1: Matrix3<f64>,
    pub r2: Matrix3<f64>,
    pub t: Vector3<f64>,
}

impl EssentialDecomposition {
    /// 四个 (R, t) 候选，按标准顺序排列。
    pub fn candidates(&self) -> [(Matrix3<f64>, Vector3<f64>); 4] {
        [
            (self.r1, self.t),
            (self.r1, -self.t),
            (self.r2, self.t),
            (self.r2, -self.t),
        ]
    }
}

/// SVD 分解本质矩阵。旋转行列式为负时翻转 E 的符号重做，
/// 奇异值比例失衡说明输入不是有效的本质矩阵，返回 None。
pub fn decompose_e_to_r_and_t(e: &Matrix3<f64>) -> Option<EssentialDecomposition> {
    let mut e = *e;
    for _ in 0..2 {
        let svd = SVD::new(e, true, true);
        let u = svd.u?;
        let v_t = svd.v_t?;
        let sv = svd.singular_values;
        if sv[1].abs() < 1e-12 || (sv[0] / sv[1] - 1.0).abs() > 0.3 {
            return None;
        }

        #[rustfmt::skip]
        let w = Matrix3::new(
            0.0, -1.0, 0.0,
            1.0,  0.0, 0.0,
            0.0,  0.0, 1.0,
        );
        let r1 = u * w * v_t;
        let r2 = u * w.transpose() * v_t;
        let t = u.column(2).into_owned();

        if r1.determinant() < 0.0 {
            e = -e;
            continue;
        }
        return Some(EssentialDecomposition { r1, r2, t });
    }
    None
}

/// 4x4 设计矩阵的 SVD 线性三角化，输入是归一化相机坐标。
pub fn triangulate_point(
    point_i: &Vector2<f64>,
    point_j: &Vector2<f64>,
    pose_i: &Matrix4<f64>,
    pose_j: &Matrix4<f64>,
) -> Option<Vector3<f64>> {
    let row0: RowVector4<f64> = pose_i.row(2) * point_i.x - pose_i.row(0);
    let row1: RowVector4<f64> = pose_i.row(2) * point_i.y - pose_i.row(1);
    let row2: RowVector4<f64> = pose_j.row(2) * point_j.x - pose_j.row(0);
    let row3: RowVector4<f64> = pose_j.row(2) * point_j.y - pose_j.row(1);
    let design_matrix = Matrix4::<f64>::from_rows(&[row0, row1, row2, row3]);

    let v = SVD::new(design_matrix, false, true).v_t?.transpose();
    let tri_pt = v.column(3);
    if tri_pt[3].abs() < 1e-12 {
        return None;
    }
    Some(Vector3::new(
        tri_pt[0] / tri_pt[3],
        tri_pt[1] / tri_pt[3],
        tri_pt[2] / tri_pt[3],
    ))
}

/// 一个候选位姿的三角化检验结果
#[derive(Debug, Default)]
pub struct TwoViewCheck {
    pub accepted: bool,
    pub points: Vec<Vector3<f64>>,
    /// 和输入对应点对齐的保留标记，三角化失败的点对为 false。
    pub kept: Vec<bool>,
    pub positive_fraction: f64,
    pub mean_reproj_error: f64,
}

/// 用候选位姿对所有对应点三角化，
/// 两视图正深度比例和平均像素重投影误差同时达标才接受。
pub fn triangulate_and_check_reproj(
    pose0: &Matrix4<f64>,
    pose1: &Matrix4<f64>,
    norm0: &[Vector2<f64>],
    norm1: &[Vector2<f64>],
    px0: &[Vector2<f64>],
    px1: &[Vector2<f64>],
    k: &Matrix3<f64>,
) -> TwoViewCheck {
    assert_eq!(norm0.len(), norm1.len());
    assert_eq!(px0.len(), px1.len());
    let n = norm0.len();
    if n == 0 {
        return TwoViewCheck::default();
    }

    let mut points = Vec::with_capacity(n);
    let mut kept = vec![true; n];
    let mut positive = 0usize;
    let mut err_sum = 0.0;
    let mut err_cnt = 0usize;
    for i in 0..n {
        let point = match triangulate_point(&norm0[i], &norm1[i], pose0, pose1) {
            Some(p) => p,
            None => {
                kept[i] = false;
                continue;
            }
        };
        let hp = Vector4::new(point.x, point.y, point.z, 1.0);
        let in0 = pose0 * hp;
        let in1 = pose1 * hp;
        if in0.z > 0.0 && in1.z > 0.0 {
            positive += 1;
        }
        for (cam_pt, px) in [(in0, &px0[i]), (in1, &px1[i])] {
            if cam_pt.z.abs() > 1e-12 {
                let uvw = k * Vector3::new(cam_pt.x, cam_pt.y, cam_pt.z);
                let proj = Vector2::new(uvw.x / uvw.z, uvw.y / uvw.z);
                err_sum += (proj - px).norm();
                err_cnt += 1;
            }
        }
        points.push(point);
    }

    let positive_fraction = positive as f64 / n as f64;
    let mean_reproj_error = if err_cnt > 0 {
        err_sum / err_cnt as f64
    } else {
        f64::MAX
    };
    let accepted = positive_fraction > crate::config::POSITIVE_DEPTH_FRACTION
        && mean_reproj_error < crate::config::MAX_MEAN_REPROJ_ERROR;
    TwoViewCheck {
        accepted,
        points,
        kept,
        positive_fraction,
        mean_reproj_error,
    }
}

/// R|t 拼成 4x4 位姿矩阵
pub fn pose_matrix(r: &Matrix3<f64>, t: &Vector3<f64>) -> Matrix4<f64> {
    let mut pose = Matrix4::<f64>::identity();
    pose.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    pose.fixed_view_mut::<3, 1>(0, 3).copy_from(t);
    pose
}

/// 反对称矩阵 [t]x
#[allow(dead_code)]
pub fn skew_symmetric(t: &Vector3<f64>) -> Matrix3<f64> {
    #[rustfmt::skip]
    let m = Matrix3::new(
        0.0, -t.z,  t.y,
        t.z,  0.0, -t.x,
       -t.y,  t.x,  0.0,
    );
    m
}
