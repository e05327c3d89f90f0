//! 跟踪器的运行时
//!
//! 每个跟踪器实例在自己的 worker 线程上持续处理，
//! 和产生帧的线程解耦：生产者把最新帧写进单槽缓冲（覆盖未消费的旧帧，
//! 帧可以丢弃、从不排队），worker 只在没有新帧时阻塞。
//! 位姿矩阵的读写都在锁内完成，消费者随时能读到一致的快照。
//! 停止是协作式的：标志位只在两帧之间检查，从不打断计算。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use nalgebra::Matrix4;
use opencv::core::Mat;

use crate::camera::PinholeCamera;
use crate::config::FRAME_WAIT_MS;
use crate::feature_backend::OrbBackend;
use crate::tracker::Tracker;

/// 单槽的帧缓冲
#[derive(Default)]
pub struct FrameSlot {
    inner: Mutex<Option<Mat>>,
    cond: Condvar,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入最新帧，未消费的旧帧直接覆盖。
    pub fn publish(&self, frame: Mat) {
        let mut guard = self.inner.lock().unwrap();
        if guard.replace(frame).is_some() {
            log::trace!("frame dropped");
        }
        drop(guard);
        self.cond.notify_one();
    }

    /// 取走当前帧，没有新帧时最多阻塞 `timeout`。
    pub fn take_timeout(&self, timeout: Duration) -> Option<Mat> {
        let guard = self.inner.lock().unwrap();
        let (mut guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |slot| slot.is_none())
            .unwrap();
        guard.take()
    }
}

/// 位姿矩阵的共享快照，算出第一个位姿之前读到单位矩阵。
#[derive(Default)]
pub struct SharedPose {
    inner: Mutex<Option<Matrix4<f64>>>,
}

impl SharedPose {
    pub fn set(&self, matrix: Matrix4<f64>) {
        *self.inner.lock().unwrap() = Some(matrix);
    }

    pub fn get(&self) -> Matrix4<f64> {
        self.inner.lock().unwrap().unwrap_or_else(Matrix4::identity)
    }
}

/// 调试叠加用的跟踪点快照
#[derive(Default)]
struct SharedPoints(Mutex<Vec<(f32, f32)>>);

/// 在专属线程上跑一个平面跟踪器。
/// 跟踪器本体在线程内部构造，线程之间只共享帧槽和输出快照。
pub struct TrackerWorker {
    label: String,
    slot: Arc<FrameSlot>,
    pose: Arc<SharedPose>,
    points: Arc<SharedPoints>,
    tracking: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TrackerWorker {
    pub fn spawn_planar(label: &str, camera: PinholeCamera, marker: Mat) -> Self {
        let slot = Arc::new(FrameSlot::new());
        let pose = Arc::new(SharedPose::default());
        let points = Arc::new(SharedPoints::default());
        let tracking = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_label = label.to_string();
        let thread_slot = slot.clone();
        let thread_pose = pose.clone();
        let thread_points = points.clone();
        let thread_tracking = tracking.clone();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(format!("tracker-{}", label))
            .spawn(move || {
                let backend = match OrbBackend::new() {
                    Ok(backend) => backend,
                    Err(e) => {
                        log::error!("{}: feature backend failed: {}", thread_label, e);
                        return;
                    }
                };
                let mut tracker = Tracker::new(backend, camera);
                if let Err(e) = tracker.set_marker(&marker) {
                    log::error!("{}: set_marker failed: {}", thread_label, e);
                    return;
                }

                while !thread_stop.load(Ordering::Acquire) {
                    let frame =
                        match thread_slot.take_timeout(Duration::from_millis(FRAME_WAIT_MS)) {
                            Some(frame) => frame,
                            None => continue,
                        };
                    if let Err(e) = tracker.process(&frame, &Mat::default()) {
                        log::debug!("{}: {}", thread_label, e);
                    }
                    thread_pose.set(tracker.model_view_matrix());
                    *thread_points.0.lock().unwrap() = tracker
                        .tracked_features()
                        .iter()
                        .map(|p| (p.x, p.y))
                        .collect();
                    thread_tracking.store(tracker.is_tracking(), Ordering::Release);
                }
                log::info!("{}: worker stopped", thread_label);
            })
            .expect("failed to spawn tracker worker");

        Self {
            label: label.to_string(),
            slot,
            pose,
            points,
            tracking,
            stop,
            handle: Some(handle),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// 生产者每帧调用，从不阻塞在 worker 上。
    pub fn update(&self, frame: &Mat) {
        self.slot.publish(frame.clone());
    }

    pub fn model_view_matrix(&self) -> Matrix4<f64> {
        self.pose.get()
    }

    pub fn tracked_features(&self) -> Vec<(f32, f32)> {
        self.points.0.lock().unwrap().clone()
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TrackerWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{PinholeCamera, PinholeParameters};
    use crate::feature_backend::test_support::textured_image;
    use opencv::core::{Scalar, Size, CV_8UC1};
    use opencv::prelude::*;

    fn frame_with_value(value: i32) -> Mat {
        Mat::new_rows_cols_with_default(1, 1, CV_8UC1, Scalar::from(value)).unwrap()
    }

    #[test]
    fn test_slot_keeps_only_latest_frame() {
        let slot = FrameSlot::new();
        slot.publish(frame_with_value(1));
        slot.publish(frame_with_value(2));
        let frame = slot.take_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(*frame.at_2d::<u8>(0, 0).unwrap(), 2);
        assert!(slot.take_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_pose_defaults_to_identity() {
        let pose = SharedPose::default();
        assert_eq!(pose.get(), Matrix4::identity());
        let mut m = Matrix4::identity();
        m[(0, 3)] = 2.0;
        pose.set(m);
        assert_eq!(pose.get(), m);
    }

    #[test]
    fn test_worker_tracks_published_frames() {
        let camera = PinholeCamera::from_parameters(PinholeParameters {
            camera_name: "test".to_string(),
            image_width: 480,
            image_height: 360,
            fx: 460.0,
            fy: 460.0,
            cx: 240.0,
            cy: 180.0,
        })
        .unwrap();
        let marker = textured_image(320, 240, 42);
        let h = Mat::from_slice_2d(&[
            [0.98, -0.05, 60.0],
            [0.04, 0.97, 40.0],
            [0.00004, -0.00002, 1.0],
        ])
        .unwrap();
        let mut frame = Mat::default();
        opencv::imgproc::warp_perspective(
            &marker,
            &mut frame,
            &h,
            Size::new(480, 360),
            opencv::imgproc::INTER_LINEAR,
            opencv::core::BORDER_CONSTANT,
            Scalar::from(200),
        )
        .unwrap();

        let mut worker = TrackerWorker::spawn_planar("test", camera, marker);
        assert_eq!(worker.model_view_matrix(), Matrix4::identity());

        let mut tracked = false;
        for _ in 0..200 {
            worker.update(&frame);
            std::thread::sleep(Duration::from_millis(25));
            if worker.is_tracking() && worker.model_view_matrix() != Matrix4::identity() {
                tracked = true;
                break;
            }
        }
        worker.stop();
        assert!(tracked, "worker never reached tracking state");
        assert!(!worker.tracked_features().is_empty());
    }
}
