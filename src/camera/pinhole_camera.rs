use anyhow::bail;
use nalgebra::{Matrix3, Vector3};
use opencv::core::{FileNodeTraitConst, FileStorageTrait, FileStorageTraitConst, Mat, Point2d};

#[derive(Debug, Clone, Default)]
pub struct PinholeParameters {
    pub camera_name: String,
    // size
    pub image_width: i32,
    pub image_height: i32,
    // intrinsic
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl PinholeParameters {
    pub const CAMERA_TYPE: &'static str = "PINHOLE";

    pub fn read_from_yaml(path: &str) -> anyhow::Result<Self> {
        let fs = opencv::core::FileStorage::new(
            path,
            opencv::core::FileStorage_Mode::READ as i32,
            "utf-8",
        )?;

        if !fs.is_opened()? {
            bail!("cannot open camera file {}", path);
        }
        if let Ok(model_type) = fs.get("model_type") {
            let model_type = model_type.to_string()?;
            if !model_type.is_empty() && model_type != Self::CAMERA_TYPE {
                bail!("model type {} is not pinhole", model_type);
            }
        }
        let camera_name = fs.get("camera_name")?.to_string()?;
        let image_width = fs.get("image_width")?.to_i32()?;
        let image_height = fs.get("image_height")?.to_i32()?;
        // intrinsic
        let projection_parameters = fs.get("projection_parameters")?;
        let fx = projection_parameters.get("fx")?.to_f64()?;
        let fy = projection_parameters.get("fy")?.to_f64()?;
        let cx = projection_parameters.get("cx")?.to_f64()?;
        let cy = projection_parameters.get("cy")?.to_f64()?;

        Ok(Self {
            camera_name,
            image_width,
            image_height,
            fx,
            fy,
            cx,
            cy,
        })
    }

    #[allow(dead_code)]
    pub fn write_to_yaml(&self, path: &str) -> anyhow::Result<()> {
        let mut fs = opencv::core::FileStorage::new(
            path,
            opencv::core::FileStorage_Mode::WRITE as i32,
            "utf-8",
        )?;

        fs.write_str("model_type", Self::CAMERA_TYPE)?;
        fs.write_str("camera_name", &self.camera_name)?;
        fs.write_i32("image_width", self.image_width)?;
        fs.write_i32("image_height", self.image_height)?;
        // intrinsic
        fs.start_write_struct("projection_parameters", opencv::core::FileNode_MAP, "")?;
        fs.write_f64("fx", self.fx)?;
        fs.write_f64("fy", self.fy)?;
        fs.write_f64("cx", self.cx)?;
        fs.write_f64("cy", self.cy)?;
        fs.end_write_struct()?;
        Ok(())
    }
}

/// 针孔相机，缓存 K 和 K 的逆。
#[derive(Debug, Clone)]
pub struct PinholeCamera {
    pub parameters: PinholeParameters,
    k: Matrix3<f64>,
    k_inv: Matrix3<f64>,
}

impl PinholeCamera {
    /// K 必须可逆（fx、fy 不能为 0）。
    pub fn from_parameters(parameters: PinholeParameters) -> anyhow::Result<Self> {
        let k = Matrix3::new(
            parameters.fx,
            0.0,
            parameters.cx,
            0.0,
            parameters.fy,
            parameters.cy,
            0.0,
            0.0,
            1.0,
        );
        let k_inv = match k.try_inverse() {
            Some(inv) => inv,
            None => bail!("calibration matrix is not invertible: {}", k),
        };
        Ok(Self {
            parameters,
            k,
            k_inv,
        })
    }

    pub fn from_yaml(path: &str) -> anyhow::Result<Self> {
        Self::from_parameters(PinholeParameters::read_from_yaml(path)?)
    }

    pub fn k(&self) -> &Matrix3<f64> {
        &self.k
    }

    /// K 的 [Mat] 形式，传给 calib3d。
    pub fn k_mat(&self) -> Mat {
        crate::global_cast::Matrix3d(self.k).into()
    }

    /// 像素坐标 -> 归一化相机坐标 (x, y, 1)
    pub fn lift_projective(&self, p: &Point2d) -> Vector3<f64> {
        self.k_inv * Vector3::new(p.x, p.y, 1.0)
    }

    /// 相机坐标系下的 3D 点 -> 像素坐标
    #[allow(dead_code)]
    pub fn project(&self, p: &Vector3<f64>) -> Point2d {
        let uvw = self.k * p;
        Point2d::new(uvw.x / uvw.z, uvw.y / uvw.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_parameters() -> PinholeParameters {
        PinholeParameters {
            camera_name: "cam0".to_string(),
            image_width: 640,
            image_height: 480,
            fx: 460.0,
            fy: 460.0,
            cx: 320.0,
            cy: 240.0,
        }
    }

    #[test]
    fn test_lift_project_roundtrip() {
        let cam = PinholeCamera::from_parameters(test_parameters()).unwrap();
        let p = Point2d::new(100.0, 50.0);
        let ray = cam.lift_projective(&p);
        let back = cam.project(&ray);
        assert!((back.x - p.x).abs() < 1e-9);
        assert!((back.y - p.y).abs() < 1e-9);
    }

    #[test]
    fn test_singular_k_rejected() {
        let mut parameters = test_parameters();
        parameters.fx = 0.0;
        assert!(PinholeCamera::from_parameters(parameters).is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let path = std::env::temp_dir().join("artrack_cam_test.yaml");
        let path = path.to_str().unwrap();
        let parameters = test_parameters();
        parameters.write_to_yaml(path).unwrap();
        let read = PinholeParameters::read_from_yaml(path).unwrap();
        assert_eq!(read.camera_name, parameters.camera_name);
        assert_eq!(read.fx, parameters.fx);
        assert_eq!(read.image_height, parameters.image_height);
    }
}
