//! Bag-of-Visual-Words marker 识别器
//!
//! 训练阶段：注册 marker 图像、聚类出视觉词典、
//! 把训练图像编码成定长直方图（可选 PCA 降维）。
//! 识别阶段：查询图像同样编码后做 kNN 投票，
//! 最近邻距离超过阈值时认为没有识别出 marker。

mod store;

pub use store::DetectorStore;

use opencv::core::{Mat, TermCriteria, Vector, CV_32F};
use opencv::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::*;
use crate::error::TrackerError;
use crate::feature_backend::{to_gray, FeatureBackend};

/// PCA 基：均值加上前若干个主成分，拟合一次后不再改变。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PcaBasis {
    pub mean: Vec<f64>,
    /// components[c] 是第 c 个主成分，长度等于词典大小。
    pub components: Vec<Vec<f64>>,
}

impl PcaBasis {
    pub fn project(&self, encoding: &[f64]) -> Vec<f64> {
        self.components
            .iter()
            .map(|component| {
                component
                    .iter()
                    .zip(encoding.iter().zip(self.mean.iter()))
                    .map(|(c, (e, m))| c * (e - m))
                    .sum()
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct TrainingSample {
    /// 原始 BOW 编码，投影在查询时做。
    encoding: Vec<f64>,
    label: String,
}

pub struct MarkerDetector<B: FeatureBackend> {
    backend: B,
    /// 每个 marker 的描述子（CV_32F），聚类前的池。
    pooled_descriptors: Vector<Mat>,
    /// 聚类中心，每行一个视觉词。聚类之后不再变化。
    vocabulary: Mat,
    markers: Vec<(String, Mat)>,
    training: Vec<TrainingSample>,
    training_labels_uniq: Vec<String>,
    pca: Option<PcaBasis>,
}

impl<B: FeatureBackend> MarkerDetector<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            pooled_descriptors: Vector::new(),
            vocabulary: Mat::default(),
            markers: Vec::new(),
            training: Vec::new(),
            training_labels_uniq: Vec::new(),
            pca: None,
        }
    }

    /// 注册一个 marker 图像。纹理不足时失败，不改动任何状态。
    pub fn add_marker(&mut self, image: &Mat, label: &str) -> Result<(), TrackerError> {
        if image.empty() {
            return Err(TrackerError::EmptyInput);
        }
        let gray = to_gray(image);
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
        let mut float_desc = Mat::default();
        descriptors
            .convert_to(&mut float_desc, CV_32F, 1.0, 0.0)
            .unwrap();
        self.pooled_descriptors.push(float_desc);
        self.markers.push((label.to_string(), gray));
        log::info!("marker '{}' added: {} descriptors", label, keypoints.len());
        Ok(())
    }

    /// 从文件注册 marker，label 取文件名。
    pub fn add_marker_file(&mut self, path: &str) -> anyhow::Result<String> {
        let image = opencv::imgcodecs::imread(path, opencv::imgcodecs::IMREAD_GRAYSCALE)?;
        let label = std::path::Path::new(path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(path)
            .to_string();
        self.add_marker(&image, &label)?;
        Ok(label)
    }

    /// 对所有已注册 marker 的描述子池做 k-means，得到视觉词典。
    /// 注册完所有 marker 之后调用一次；词典建好后不可重建。
    pub fn cluster(&mut self) -> Result<(), TrackerError> {
        if !self.vocabulary.empty() {
            log::warn!("vocabulary already built, cluster() ignored");
            return Ok(());
        }
        if self.pooled_descriptors.is_empty() {
            return Err(TrackerError::InsufficientFeatures {
                found: 0,
                needed: 1,
            });
        }
        let mut pooled = Mat::default();
        opencv::core::vconcat(&self.pooled_descriptors, &mut pooled).unwrap();

        let k = VOCAB_WORDS.min(pooled.rows());
        let criteria = TermCriteria::new(
            opencv::core::TermCriteria_EPS + opencv::core::TermCriteria_COUNT,
            100,
            1e-4,
        )
        .unwrap();
        let mut labels = Mat::default();
        let mut centers = Mat::default();
        opencv::core::kmeans(
            &pooled,
            k,
            &mut labels,
            criteria,
            3,
            opencv::core::KMEANS_PP_CENTERS,
            &mut centers,
        )
        .unwrap();
        self.vocabulary = centers;
        log::info!(
            "vocabulary built: {} words from {} descriptors",
            k,
            pooled.rows()
        );
        Ok(())
    }

    /// 把一张图像编码成词典上的归一化直方图。
    /// 长度固定为词典大小，和图像上检出多少特征点无关。
    pub fn extract_bow_descriptor(
        &mut self,
        image: &Mat,
        mask: &Mat,
    ) -> Result<Vec<f64>, TrackerError> {
        if self.vocabulary.empty() {
            return Err(TrackerError::NotTrained);
        }
        if image.empty() {
            return Err(TrackerError::EmptyInput);
        }
        let gray = to_gray(image);
        let (_, descriptors) = self
            .backend
            .detect_and_compute(&gray, mask)
            .map_err(|_| TrackerError::EmptyInput)?;
        if descriptors.rows() == 0 {
            return Err(TrackerError::InsufficientFeatures {
                found: 0,
                needed: 1,
            });
        }
        let mut float_desc = Mat::default();
        descriptors
            .convert_to(&mut float_desc, CV_32F, 1.0, 0.0)
            .unwrap();

        let words = self.vocabulary.rows();
        let dim = self.vocabulary.cols();
        let mut histogram = vec![0.0f64; words as usize];
        for r in 0..float_desc.rows() {
            let mut best_word = 0usize;
            let mut best_dist = f64::MAX;
            for w in 0..words {
                let mut dist = 0.0f64;
                for d in 0..dim {
                    let diff = (*float_desc.at_2d::<f32>(r, d).unwrap()
                        - *self.vocabulary.at_2d::<f32>(w, d).unwrap())
                        as f64;
                    dist += diff * diff;
                }
                if dist < best_dist {
                    best_dist = dist;
                    best_word = w as usize;
                }
            }
            histogram[best_word] += 1.0;
        }
        let sum: f64 = histogram.iter().sum();
        for v in histogram.iter_mut() {
            *v /= sum;
        }
        Ok(histogram)
    }

    /// 编码一张训练图像并追加到训练集。
    pub fn add_image_to_training(
        &mut self,
        image: &Mat,
        label: &str,
    ) -> Result<(), TrackerError> {
        let encoding = self.extract_bow_descriptor(image, &Mat::default())?;
        self.training.push(TrainingSample {
            encoding,
            label: label.to_string(),
        });
        if !self.training_labels_uniq.iter().any(|l| l == label) {
            self.training_labels_uniq.push(label.to_string());
        }
        Ok(())
    }

    /// 在当前训练集上拟合一次 PCA 基，之后不再重拟合。
    /// 不调用也可以，分类会直接在原始编码上进行。
    pub fn fit_projection(&mut self) -> Result<(), TrackerError> {
        if self.pca.is_some() {
            log::warn!("projection already fitted, fit_projection() ignored");
            return Ok(());
        }
        let n = self.training.len();
        if n < 2 {
            return Err(TrackerError::InsufficientFeatures { found: n, needed: 2 });
        }
        let dim = self.training[0].encoding.len();
        let mut mean = vec![0.0f64; dim];
        for sample in self.training.iter() {
            for (m, e) in mean.iter_mut().zip(sample.encoding.iter()) {
                *m += e;
            }
        }
        for m in mean.iter_mut() {
            *m /= n as f64;
        }

        let mut centered = nalgebra::DMatrix::<f64>::zeros(n, dim);
        for (i, sample) in self.training.iter().enumerate() {
            for j in 0..dim {
                centered[(i, j)] = sample.encoding[j] - mean[j];
            }
        }
        let svd = nalgebra::SVD::new(centered, false, true);
        let v_t = match svd.v_t {
            Some(v_t) => v_t,
            None => return Err(TrackerError::DegenerateGeometry("pca svd failed")),
        };
        let keep = PCA_COMPONENTS.min(dim).min(v_t.nrows());
        let components = (0..keep)
            .map(|c| v_t.row(c).iter().copied().collect())
            .collect();
        self.pca = Some(PcaBasis { mean, components });
        log::info!("projection fitted: {} -> {} dims", dim, keep);
        Ok(())
    }

    fn project(&self, encoding: &[f64]) -> Vec<f64> {
        match &self.pca {
            Some(basis) => basis.project(encoding),
            None => encoding.to_vec(),
        }
    }

    /// kNN 多数投票，平票取最近的。
    /// 最近邻距离超过阈值时分类不可信。
    fn nearest_label(&self, query: &[f64]) -> Result<String, TrackerError> {
        if self.training.is_empty() {
            return Err(TrackerError::NotTrained);
        }
        let mut neighbors: Vec<(f64, &str)> = self
            .training
            .iter()
            .map(|sample| {
                let projected = self.project(&sample.encoding);
                let dist = projected
                    .iter()
                    .zip(query.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f64>()
                    .sqrt();
                (dist, sample.label.as_str())
            })
            .collect();
        neighbors.sort_by(|a, b| a.0.total_cmp(&b.0));

        if neighbors[0].0 > BOW_REJECT_DISTANCE {
            log::debug!("nearest distance {:.3} over threshold", neighbors[0].0);
            return Err(TrackerError::ClassificationUncertain);
        }
        let k = KNN_K.min(neighbors.len());
        let mut best: Option<(&str, usize)> = None;
        for &(_, label) in neighbors[..k].iter() {
            let votes = neighbors[..k].iter().filter(|&&(_, l)| l == label).count();
            match best {
                Some((_, best_votes)) if best_votes >= votes => {}
                _ => best = Some((label, votes)),
            }
        }
        match best {
            Some((label, _)) => Ok(label.to_string()),
            None => Err(TrackerError::ClassificationUncertain),
        }
    }

    /// 识别查询图像里的 marker。
    /// 训练集为空或距离超过阈值时返回 None，不抛错误。
    pub fn detect_marker_in_image(
        &mut self,
        image: &Mat,
        mask: &Mat,
    ) -> Result<Option<String>, TrackerError> {
        if self.training.is_empty() {
            return Ok(None);
        }
        let encoding = self.extract_bow_descriptor(image, mask)?;
        let query = self.project(&encoding);
        match self.nearest_label(&query) {
            Ok(label) => Ok(Some(label)),
            Err(TrackerError::ClassificationUncertain) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 注册过的 marker 图像，给跟踪器实例化用。
    pub fn marker(&self, label: &str) -> Option<&Mat> {
        self.markers
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, image)| image)
    }

    pub fn vocabulary(&self) -> &Mat {
        &self.vocabulary
    }

    pub fn training_labels(&self) -> &[String] {
        &self.training_labels_uniq
    }

    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        store::save(self, path)
    }

    pub fn read_from_file(&mut self, path: &str) -> anyhow::Result<()> {
        store::load(self, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_backend::test_support::textured_image;
    use crate::feature_backend::OrbBackend;
    use opencv::core::{Scalar, Size};

    fn new_detector() -> MarkerDetector<OrbBackend> {
        MarkerDetector::new(OrbBackend::new().unwrap())
    }

    fn trained_detector() -> (MarkerDetector<OrbBackend>, Vec<(String, Mat)>) {
        let mut detector = new_detector();
        let mut images = Vec::new();
        for (seed, label) in [(21u64, "alpha"), (22, "beta"), (23, "gamma")] {
            let image = textured_image(320, 240, seed);
            detector.add_marker(&image, label).unwrap();
            images.push((label.to_string(), image));
        }
        detector.cluster().unwrap();
        for (label, image) in images.iter() {
            detector.add_image_to_training(image, label).unwrap();
        }
        (detector, images)
    }

    fn blurred(image: &Mat) -> Mat {
        let mut out = Mat::default();
        opencv::imgproc::gaussian_blur(
            image,
            &mut out,
            Size::new(3, 3),
            0.0,
            0.0,
            opencv::core::BORDER_DEFAULT,
        )
        .unwrap();
        out
    }

    #[test]
    fn test_add_marker_low_texture_fails_without_mutation() {
        let mut detector = new_detector();
        let flat =
            Mat::new_rows_cols_with_default(240, 320, opencv::core::CV_8UC1, Scalar::from(128))
                .unwrap();
        let err = detector.add_marker(&flat, "flat").unwrap_err();
        assert!(matches!(err, TrackerError::InsufficientFeatures { .. }));
        assert!(detector.markers.is_empty());
        assert!(detector.pooled_descriptors.is_empty());
    }

    #[test]
    fn test_encode_before_cluster_fails() {
        let mut detector = new_detector();
        let image = textured_image(320, 240, 21);
        detector.add_marker(&image, "alpha").unwrap();
        assert_eq!(
            detector.extract_bow_descriptor(&image, &Mat::default()),
            Err(TrackerError::NotTrained)
        );
    }

    #[test]
    fn test_bow_descriptor_fixed_length_and_normalized() {
        let (mut detector, images) = trained_detector();
        let words = detector.vocabulary().rows() as usize;
        for (_, image) in images.iter() {
            let encoding = detector
                .extract_bow_descriptor(image, &Mat::default())
                .unwrap();
            assert_eq!(encoding.len(), words);
            let sum: f64 = encoding.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_training_images_classify_as_themselves() {
        let (mut detector, images) = trained_detector();
        for (label, image) in images.iter() {
            let got = detector
                .detect_marker_in_image(image, &Mat::default())
                .unwrap();
            assert_eq!(got.as_deref(), Some(label.as_str()));
        }
    }

    #[test]
    fn test_empty_training_returns_none() {
        let mut detector = new_detector();
        let image = textured_image(320, 240, 21);
        detector.add_marker(&image, "alpha").unwrap();
        detector.cluster().unwrap();
        assert_eq!(
            detector.detect_marker_in_image(&image, &Mat::default()),
            Ok(None)
        );
    }

    #[test]
    fn test_rejection_threshold() {
        let mut detector = new_detector();
        detector.training.push(TrainingSample {
            encoding: vec![1.0, 0.0, 0.0],
            label: "alpha".to_string(),
        });
        detector.training.push(TrainingSample {
            encoding: vec![0.9, 0.1, 0.0],
            label: "alpha".to_string(),
        });
        assert_eq!(
            detector.nearest_label(&[1.0, 0.0, 0.0]),
            Ok("alpha".to_string())
        );
        // 距离远超过阈值
        assert_eq!(
            detector.nearest_label(&[0.0, 0.0, 5.0]),
            Err(TrackerError::ClassificationUncertain)
        );
    }

    #[test]
    fn test_majority_vote_with_tie_takes_nearest() {
        let mut detector = new_detector();
        for (encoding, label) in [
            (vec![1.0, 0.0], "alpha"),
            (vec![0.8, 0.2], "beta"),
            (vec![0.7, 0.3], "beta"),
        ] {
            detector.training.push(TrainingSample {
                encoding,
                label: label.to_string(),
            });
        }
        // beta 两票胜出
        assert_eq!(detector.nearest_label(&[0.75, 0.25]), Ok("beta".to_string()));
        // 最近邻是 alpha，但 k=3 里 beta 仍然两票。
        assert_eq!(detector.nearest_label(&[1.0, 0.0]), Ok("beta".to_string()));
    }

    #[test]
    fn test_projection_reduces_dimension_and_keeps_closure() {
        let (mut detector, images) = trained_detector();
        detector.fit_projection().unwrap();
        let basis = detector.pca.clone().unwrap();
        assert!(basis.components.len() <= PCA_COMPONENTS);
        for (label, image) in images.iter() {
            let got = detector
                .detect_marker_in_image(image, &Mat::default())
                .unwrap();
            assert_eq!(got.as_deref(), Some(label.as_str()));
        }
    }

    #[test]
    fn test_save_load_keeps_classification_identical() {
        let (mut detector, images) = trained_detector();
        detector.fit_projection().unwrap();

        // 训练图像加一组模糊过的查询作为保留集
        let mut queries: Vec<Mat> = images.iter().map(|(_, image)| image.clone()).collect();
        queries.extend(images.iter().map(|(_, image)| blurred(image)));
        let before: Vec<Option<String>> = queries
            .iter()
            .map(|q| detector.detect_marker_in_image(q, &Mat::default()).unwrap())
            .collect();

        let path = std::env::temp_dir().join("artrack_detector_test.json");
        let path = path.to_str().unwrap();
        detector.save_to_file(path).unwrap();

        let mut restored = new_detector();
        restored.read_from_file(path).unwrap();
        assert_eq!(restored.training_labels(), detector.training_labels());

        let after: Vec<Option<String>> = queries
            .iter()
            .map(|q| restored.detect_marker_in_image(q, &Mat::default()).unwrap())
            .collect();
        assert_eq!(before, after);

        // 恢复出来的 marker 图像可以直接给跟踪器用
        assert!(restored.marker("alpha").is_some());
        assert_eq!(restored.marker("alpha").unwrap().rows(), 240);
    }
}
