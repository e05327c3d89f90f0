//! 全局类型转换
//!
//! 用于 [Mat] 和 nalgebra 类型之间的转换，
//! 位姿求解和单应估计都要在两种类型之间来回传递。

use nalgebra::*;
use opencv::core::{Mat, CV_64F};
use opencv::prelude::*;
use std::fmt::Display;

/// 实现 Display trait 用于打印
pub struct MatPrinter(pub Mat);

impl Display for MatPrinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rows = self.0.rows();
        let cols = self.0.cols();
        writeln!(f)?;
        for i in 0..rows {
            for j in 0..cols {
                write!(f, "{}, ", self.0.at_2d::<f64>(i, j).unwrap())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Matrix3d(pub Matrix3<f64>);

impl Display for Matrix3d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 将 [Mat] 转换为 [Matrix3]
impl From<Mat> for Matrix3d {
    fn from(mat: Mat) -> Self {
        let rows = mat.rows();
        let cols = mat.cols();
        assert!(rows == 3 && cols == 3);
        let mut matrix = Matrix3::<f64>::zeros();
        for i in 0..3 {
            for j in 0..3 {
                matrix[(i, j)] = *mat.at_2d::<f64>(i as i32, j as i32).unwrap();
            }
        }
        Matrix3d(matrix)
    }
}

/// 将 [Matrix3] 转换为 [Mat]
impl From<Matrix3d> for Mat {
    fn from(m: Matrix3d) -> Mat {
        let mut mat = Mat::zeros_nd(&[3, 3], CV_64F).unwrap().to_mat().unwrap();
        for i in 0..3 {
            for j in 0..3 {
                *mat.at_2d_mut::<f64>(i as i32, j as i32).unwrap() = m.0[(i, j)];
            }
        }
        mat
    }
}

#[test]
fn test_mat_to_matrix() {
    let mat = Mat::from_slice_2d(&[[2.0, 0.0, 1.0], [0.0, 2.0, 1.0], [0.0, 0.0, 1.0]]).unwrap();
    let matrix = Matrix3d::from(mat);
    assert_eq!(matrix.0[(0, 0)], 2.0);
    assert_eq!(matrix.0[(1, 2)], 1.0);

    let mat: Mat = Matrix3d(Matrix3::identity()).into();
    assert_eq!(*mat.at_2d::<f64>(2, 2).unwrap(), 1.0);
}

#[derive(Debug, Clone, Default)]
pub struct Rotation3d(pub Rotation3<f64>);
impl Display for Rotation3d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 旋转向量（axis-angle）形式的 [Mat] 转换为 [Rotation3]
impl From<Mat> for Rotation3d {
    fn from(rvec: Mat) -> Self {
        let v = Vector3d::from(rvec).0;
        Rotation3d(Rotation3::new(v))
    }
}

/// [Rotation3] 转换为旋转向量形式的 [Mat]，作为 PnP 的初始值。
impl From<Rotation3d> for Mat {
    fn from(r: Rotation3d) -> Mat {
        let rvec = r.0.scaled_axis();
        Vector3d(rvec).into()
    }
}

#[test]
fn test_rotation_roundtrip() {
    let r = Rotation3::from_axis_angle(&nalgebra::Vector3::z_axis(), 0.7);
    let mat: Mat = Rotation3d(r).into();
    let back = Rotation3d::from(mat).0;
    assert!((r.matrix() - back.matrix()).norm() < 1e-12);
}

#[derive(Debug, Clone, Default)]
pub struct Vector3d(pub Vector3<f64>);
impl Display for Vector3d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Mat> for Vector3d {
    fn from(mat: Mat) -> Self {
        let rows = mat.rows();
        let cols = mat.cols();
        assert!(rows == 3 && cols == 1);
        let mut vector = Vector3::<f64>::zeros();
        for i in 0..3 {
            vector[i] = *mat.at_2d::<f64>(i as i32, 0).unwrap();
        }
        Vector3d(vector)
    }
}

impl From<Vector3d> for Mat {
    fn from(v: Vector3d) -> Mat {
        let mut mat = Mat::zeros_nd(&[3, 1], CV_64F).unwrap().to_mat().unwrap();
        for i in 0..3 {
            *mat.at_2d_mut::<f64>(i as i32, 0).unwrap() = v.0[i];
        }
        mat
    }
}

#[test]
fn test_mat_to_vector() {
    let mat = Mat::from_slice_2d(&[[1.0], [2.0], [3.0]]).unwrap();
    let vector = Vector3d::from(mat);
    assert_eq!(vector.0, Vector3::new(1.0, 2.0, 3.0));

    let mat: Mat = Vector3d(Vector3::new(4.0, 5.0, 6.0)).into();
    assert_eq!(*mat.at_2d::<f64>(1, 0).unwrap(), 5.0);
}
