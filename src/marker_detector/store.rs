//! 识别器状态的持久化
//!
//! 词典、训练集、PCA 基和注册的 marker 图像转换成纯数据结构后
//! 用 JSON 落盘。保存再加载后分类行为完全一致。

use std::fs::File;
use std::io::{BufReader, BufWriter};

use opencv::core::{Mat, Scalar, CV_32F, CV_8UC1};
use opencv::prelude::*;
use serde::{Deserialize, Serialize};

use super::{MarkerDetector, PcaBasis, TrainingSample};
use crate::feature_backend::FeatureBackend;

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkerImage {
    pub label: String,
    pub rows: i32,
    pub cols: i32,
    pub data: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DetectorStore {
    pub vocabulary: Vec<Vec<f32>>,
    pub training: Vec<(Vec<f64>, String)>,
    pub training_labels_uniq: Vec<String>,
    pub pca: Option<PcaBasis>,
    pub markers: Vec<MarkerImage>,
}

fn mat_to_rows_f32(mat: &Mat) -> Vec<Vec<f32>> {
    let mut rows = Vec::with_capacity(mat.rows() as usize);
    for i in 0..mat.rows() {
        let mut row = Vec::with_capacity(mat.cols() as usize);
        for j in 0..mat.cols() {
            row.push(*mat.at_2d::<f32>(i, j).unwrap());
        }
        rows.push(row);
    }
    rows
}

fn rows_to_mat_f32(rows: &[Vec<f32>]) -> Mat {
    if rows.is_empty() {
        return Mat::default();
    }
    let mut mat = Mat::new_rows_cols_with_default(
        rows.len() as i32,
        rows[0].len() as i32,
        CV_32F,
        Scalar::from(0.0),
    )
    .unwrap();
    for (i, row) in rows.iter().enumerate() {
        for (j, v) in row.iter().enumerate() {
            *mat.at_2d_mut::<f32>(i as i32, j as i32).unwrap() = *v;
        }
    }
    mat
}

fn gray_to_store(label: &str, image: &Mat) -> MarkerImage {
    let mut data = Vec::with_capacity((image.rows() * image.cols()) as usize);
    for i in 0..image.rows() {
        for j in 0..image.cols() {
            data.push(*image.at_2d::<u8>(i, j).unwrap());
        }
    }
    MarkerImage {
        label: label.to_string(),
        rows: image.rows(),
        cols: image.cols(),
        data,
    }
}

fn store_to_gray(stored: &MarkerImage) -> Mat {
    let mut image =
        Mat::new_rows_cols_with_default(stored.rows, stored.cols, CV_8UC1, Scalar::from(0))
            .unwrap();
    for i in 0..stored.rows {
        for j in 0..stored.cols {
            *image.at_2d_mut::<u8>(i, j).unwrap() =
                stored.data[(i * stored.cols + j) as usize];
        }
    }
    image
}

impl DetectorStore {
    pub fn from_detector<B: FeatureBackend>(detector: &MarkerDetector<B>) -> Self {
        Self {
            vocabulary: mat_to_rows_f32(&detector.vocabulary),
            training: detector
                .training
                .iter()
                .map(|sample| (sample.encoding.clone(), sample.label.clone()))
                .collect(),
            training_labels_uniq: detector.training_labels_uniq.clone(),
            pca: detector.pca.clone(),
            markers: detector
                .markers
                .iter()
                .map(|(label, image)| gray_to_store(label, image))
                .collect(),
        }
    }

    pub fn apply_to<B: FeatureBackend>(self, detector: &mut MarkerDetector<B>) {
        detector.vocabulary = rows_to_mat_f32(&self.vocabulary);
        detector.training = self
            .training
            .into_iter()
            .map(|(encoding, label)| TrainingSample { encoding, label })
            .collect();
        detector.training_labels_uniq = self.training_labels_uniq;
        detector.pca = self.pca;
        detector.markers = self
            .markers
            .iter()
            .map(|stored| (stored.label.clone(), store_to_gray(stored)))
            .collect();
        // 描述子池不持久化，加载后的词典本来就不允许重聚类。
        detector.pooled_descriptors.clear();
    }
}

pub(super) fn save<B: FeatureBackend>(
    detector: &MarkerDetector<B>,
    path: &str,
) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer(BufWriter::new(file), &DetectorStore::from_detector(detector))?;
    log::info!("detector state saved to {}", path);
    Ok(())
}

pub(super) fn load<B: FeatureBackend>(
    detector: &mut MarkerDetector<B>,
    path: &str,
) -> anyhow::Result<()> {
    let file = File::open(path)?;
    let store: DetectorStore = serde_json::from_reader(BufReader::new(file))?;
    store.apply_to(detector);
    log::info!("detector state loaded from {}", path);
    Ok(())
}
