/// opencv
/// https://docs.rs/opencv/latest/opencv/all.html
///
/// nalgebra
/// https://docs.rs/nalgebra/latest/nalgebra/
extern crate opencv;

mod adhoc_tracker;
mod camera;
mod config;
mod dataset;
mod error;
mod feature_backend;
mod global_cast;
mod global_types;
mod image_tracker;
mod marker_detector;
mod pose;
mod runtime;
mod tracker; // 平面 marker 跟踪

use opencv::core::{Mat, Point2i, Scalar};
use opencv::highgui;
use opencv::imgcodecs;
use opencv::imgproc::{COLOR_GRAY2BGR, LINE_8};
use opencv::prelude::*;

use crate::adhoc_tracker::SimpleAdHocTracker;
use crate::camera::PinholeCamera;
use crate::dataset::{DefaultDataset, FrameDataset};
use crate::feature_backend::OrbBackend;
use crate::image_tracker::ImageTracker;
use crate::marker_detector::MarkerDetector;

const FREQUENCY: i32 = 30;

fn draw_features(img: &Mat, features: &[(f32, f32)]) -> anyhow::Result<Mat> {
    let mut img_show = Mat::default();
    opencv::imgproc::cvt_color(img, &mut img_show, COLOR_GRAY2BGR, 0)?;
    for (x, y) in features {
        opencv::imgproc::circle(
            &mut img_show,
            Point2i::new(*x as i32, *y as i32),
            2,
            Scalar::from((0, 255, 0)),
            2,
            LINE_8,
            0,
        )?;
    }
    Ok(img_show)
}

/// 没有给 marker 时：对任意有纹理的表面做两视图 SfM 引导再跟踪。
fn run_adhoc(camera: PinholeCamera, dataset: &DefaultDataset) -> anyhow::Result<()> {
    let mut tracker = SimpleAdHocTracker::new(OrbBackend::new()?, camera);
    for (timestamp, path) in dataset.frame_list() {
        let img = match imgcodecs::imread(path, imgcodecs::IMREAD_GRAYSCALE) {
            Ok(img) if !img.empty() => img,
            _ => {
                log::warn!("cannot read frame {}", path);
                continue;
            }
        };
        if let Err(e) = tracker.process(&img, false) {
            log::debug!("t={:.3} {:?}: {}", timestamp.as_sec(), tracker.state(), e);
        }
        if tracker.is_tracking() {
            let mv = tracker.model_view_matrix();
            log::info!(
                "t={:.3} adhoc {} points translation=({:.2}, {:.2}, {:.2})",
                timestamp.as_sec(),
                tracker.tracked_points_3d().len(),
                mv[(0, 3)],
                mv[(1, 3)],
                mv[(2, 3)],
            );
        }

        let features: Vec<(f32, f32)> =
            tracker.tracked_features().iter().map(|p| (p.x, p.y)).collect();
        highgui::imshow("artrack", &draw_features(&img, &features)?)?;
        highgui::wait_key(1000 / FREQUENCY)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        anyhow::bail!("usage: artrack-rs <camera.yaml> <dataset_dir> [marker.png ...]");
    }
    let camera_file = &args[0];
    let dataset_dir = &args[1];
    let marker_files = &args[2..];

    let camera = PinholeCamera::from_yaml(camera_file)?;
    log::info!("camera: {:?}", camera.parameters);
    let dataset = DefaultDataset::new(dataset_dir)?;

    if marker_files.is_empty() {
        return run_adhoc(camera, &dataset);
    }

    // 注册 marker，聚类出词典，再把 marker 图像本身作为训练样本。
    // ARTRACK_DETECTOR_FILE 指向已有的存档时直接加载，跳过训练。
    let mut detector = MarkerDetector::new(OrbBackend::new()?);
    let store_path = std::env::var("ARTRACK_DETECTOR_FILE").ok();
    let loaded = match &store_path {
        Some(path) if std::path::Path::new(path).exists() => {
            detector.read_from_file(path)?;
            true
        }
        _ => false,
    };
    if !loaded {
        let mut labels = Vec::new();
        for marker_file in marker_files {
            labels.push(detector.add_marker_file(marker_file)?);
        }
        detector.cluster()?;
        log::info!("vocabulary: {} words", detector.vocabulary().rows());
        for label in labels.iter() {
            let marker = detector.marker(label).unwrap().clone();
            detector.add_image_to_training(&marker, label)?;
        }
        if labels.len() >= 2 {
            detector.fit_projection()?;
        }
        if let Some(path) = &store_path {
            detector.save_to_file(path)?;
        }
    }

    let mut image_tracker = ImageTracker::new(camera, detector);
    log::info!(
        "trained labels: {:?}",
        image_tracker.detector().training_labels()
    );

    for (timestamp, path) in dataset.frame_list() {
        let img = match imgcodecs::imread(path, imgcodecs::IMREAD_GRAYSCALE) {
            Ok(img) if !img.empty() => img,
            _ => {
                log::warn!("cannot read frame {}", path);
                continue;
            }
        };
        if let Err(e) = image_tracker.update(&img) {
            log::warn!("update failed: {}", e);
            continue;
        }

        for (label, mv) in image_tracker.model_view_matrices() {
            log::info!(
                "t={:.3} '{}' translation=({:.2}, {:.2}, {:.2})",
                timestamp.as_sec(),
                label,
                mv[(0, 3)],
                mv[(1, 3)],
                mv[(2, 3)],
            );
        }

        // 调试叠加：画出每个 worker 当前的跟踪点
        let mut features = Vec::new();
        for worker in image_tracker.workers() {
            features.extend(worker.tracked_features());
        }
        highgui::imshow("artrack", &draw_features(&img, &features)?)?;
        highgui::wait_key(1000 / FREQUENCY)?;
    }
    Ok(())
}
