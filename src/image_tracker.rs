//! 跟踪编排
//!
//! 持有一个 marker 识别器和若干平面跟踪器 worker：
//! 没有任何 worker 在跟踪时把帧送给识别器，
//! 识别出已注册且还没有 worker 的 marker 就为它拉起新的跟踪线程，
//! 每一帧广播给所有 worker。

use nalgebra::Matrix4;
use opencv::core::Mat;
use opencv::prelude::*;

use crate::camera::PinholeCamera;
use crate::error::TrackerError;
use crate::feature_backend::OrbBackend;
use crate::marker_detector::MarkerDetector;
use crate::runtime::TrackerWorker;

pub struct ImageTracker {
    camera: PinholeCamera,
    detector: MarkerDetector<OrbBackend>,
    workers: Vec<TrackerWorker>,
}

impl ImageTracker {
    pub fn new(camera: PinholeCamera, detector: MarkerDetector<OrbBackend>) -> Self {
        Self {
            camera,
            detector,
            workers: Vec::new(),
        }
    }

    /// 每帧调用一次。
    pub fn update(&mut self, frame: &Mat) -> Result<(), TrackerError> {
        if frame.empty() {
            return Err(TrackerError::EmptyInput);
        }

        if !self.any_tracking() {
            match self.detector.detect_marker_in_image(frame, &Mat::default()) {
                Ok(Some(label)) => {
                    let known = self.workers.iter().any(|w| w.label() == label);
                    if !known {
                        if let Some(marker) = self.detector.marker(&label) {
                            log::info!("recognized marker '{}', spawning tracker", label);
                            self.workers.push(TrackerWorker::spawn_planar(
                                &label,
                                self.camera.clone(),
                                marker.clone(),
                            ));
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => log::debug!("recognition skipped: {}", e),
            }
        }

        for worker in self.workers.iter() {
            worker.update(frame);
        }
        Ok(())
    }

    pub fn any_tracking(&self) -> bool {
        self.workers.iter().any(|w| w.is_tracking())
    }

    pub fn workers(&self) -> &[TrackerWorker] {
        &self.workers
    }

    /// 渲染端读取：每个 worker 的 model-view 矩阵快照。
    pub fn model_view_matrices(&self) -> Vec<(String, Matrix4<f64>)> {
        self.workers
            .iter()
            .map(|w| (w.label().to_string(), w.model_view_matrix()))
            .collect()
    }

    pub fn detector(&self) -> &MarkerDetector<OrbBackend> {
        &self.detector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{PinholeCamera, PinholeParameters};
    use crate::feature_backend::test_support::textured_image;
    use std::time::Duration;

    fn test_camera() -> PinholeCamera {
        PinholeCamera::from_parameters(PinholeParameters {
            camera_name: "test".to_string(),
            image_width: 320,
            image_height: 240,
            fx: 460.0,
            fy: 460.0,
            cx: 160.0,
            cy: 120.0,
        })
        .unwrap()
    }

    #[test]
    fn test_update_rejects_empty_frame() {
        let detector = MarkerDetector::new(OrbBackend::new().unwrap());
        let mut tracker = ImageTracker::new(test_camera(), detector);
        assert_eq!(
            tracker.update(&Mat::default()),
            Err(TrackerError::EmptyInput)
        );
    }

    #[test]
    fn test_recognition_spawns_single_worker() {
        let mut detector = MarkerDetector::new(OrbBackend::new().unwrap());
        let image = textured_image(320, 240, 42);
        detector.add_marker(&image, "poster").unwrap();
        detector.cluster().unwrap();
        detector.add_image_to_training(&image, "poster").unwrap();

        let mut tracker = ImageTracker::new(test_camera(), detector);
        assert!(tracker.workers().is_empty());

        tracker.update(&image).unwrap();
        assert_eq!(tracker.workers().len(), 1);
        assert_eq!(tracker.workers()[0].label(), "poster");

        // 同一个 marker 不会拉起第二个 worker
        for _ in 0..40 {
            tracker.update(&image).unwrap();
            std::thread::sleep(Duration::from_millis(10));
            if tracker.any_tracking() {
                break;
            }
        }
        assert_eq!(tracker.workers().len(), 1);
        assert_eq!(tracker.model_view_matrices().len(), 1);
    }
}
