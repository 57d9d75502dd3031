use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Dirichlet, Distribution};
use serde::{Deserialize, Serialize};
use tensorflow::{
    Graph, ImportGraphDefOptions, Session, SessionOptions, SessionRunArgs, Status, Tensor,
};
use thiserror::Error;

pub const NUM_CLASSES: usize = 6;
pub const CLASS_NAMES: [&str; NUM_CLASSES] =
    ["cardboard", "glass", "metal", "paper", "plastic", "trash"];

const IMG_SIZE: u32 = 224;
const INPUT_OP: &str = "x";
const OUTPUT_OP: &str = "Identity";

// Demo mode seeds from a prefix of the upload so identical uploads rank
// identically within one process run.
const DEMO_SEED_PREFIX: usize = 100;
const DEMO_CONCENTRATION: f64 = 0.5;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Graph(#[from] Status),
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("inference failed: {0}")]
    Inference(#[from] Status),
    #[error("unexpected model output length {0}")]
    OutputShape(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassScore {
    pub class: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    pub predicted_class: String,
    pub confidence: f32,
    pub all_predictions: Vec<ClassScore>,
}

pub struct Model {
    graph: Graph,
    session: Session,
}

impl Model {
    pub fn load(path: &str) -> Result<Self, LoadError> {
        let model_bytes = std::fs::read(path)?;

        let mut graph = Graph::new();
        graph.import_graph_def(&model_bytes, &ImportGraphDefOptions::new())?;
        let session = Session::new(&SessionOptions::new(), &graph)?;

        Ok(Model { graph, session })
    }

    fn run(&self, pixels: &[f32]) -> Result<Vec<f32>, ClassifyError> {
        let mut input: Tensor<f32> =
            Tensor::new(&[1, IMG_SIZE as u64, IMG_SIZE as u64, 3]);
        input.copy_from_slice(pixels);

        let input_op = self.graph.operation_by_name_required(INPUT_OP)?;
        let output_op = self.graph.operation_by_name_required(OUTPUT_OP)?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&input_op, 0, &input);
        let fetch_token = args.request_fetch(&output_op, 0);
        self.session.run(&mut args)?;

        let output: Tensor<f32> = args.fetch(fetch_token)?;
        Ok(output.to_vec())
    }
}

pub enum ModelState {
    Loaded(Model),
    Unavailable(String),
}

impl ModelState {
    pub fn init(path: &str) -> Self {
        match Model::load(path) {
            Ok(model) => {
                log::info!("Model loaded from {}", path);
                ModelState::Loaded(model)
            }
            Err(err) => {
                log::warn!(
                    "Could not load model from {}: {}. Serving demo predictions until restart.",
                    path,
                    err
                );
                ModelState::Unavailable(err.to_string())
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelState::Loaded(_))
    }

    pub fn classify(&self, image_bytes: &[u8]) -> Result<PredictionResult, ClassifyError> {
        let pixels = preprocess(image_bytes)?;

        let scores = match self {
            ModelState::Loaded(model) => model.run(&pixels)?,
            ModelState::Unavailable(_) => demo_scores(image_bytes),
        };
        if scores.len() != NUM_CLASSES {
            return Err(ClassifyError::OutputShape(scores.len()));
        }

        Ok(rank(&scores))
    }
}

fn preprocess(image_bytes: &[u8]) -> Result<Vec<f32>, ClassifyError> {
    let img = image::load_from_memory(image_bytes)?;
    let rgb = img.resize_exact(IMG_SIZE, IMG_SIZE, FilterType::Triangle).to_rgb8();

    let mut pixels = Vec::with_capacity((IMG_SIZE * IMG_SIZE * 3) as usize);
    for pixel in rgb.pixels() {
        pixels.push(pixel[0] as f32 / 255.0);
        pixels.push(pixel[1] as f32 / 255.0);
        pixels.push(pixel[2] as f32 / 255.0);
    }

    Ok(pixels)
}

fn demo_scores(image_bytes: &[u8]) -> Vec<f32> {
    let mut hasher = DefaultHasher::new();
    image_bytes[..image_bytes.len().min(DEMO_SEED_PREFIX)].hash(&mut hasher);
    let mut rng = StdRng::seed_from_u64(hasher.finish());

    let dirichlet = Dirichlet::new([DEMO_CONCENTRATION; NUM_CLASSES])
        .expect("concentration parameters are positive");
    let sample: [f64; NUM_CLASSES] = dirichlet.sample(&mut rng);

    sample.iter().map(|&v| v as f32).collect()
}

// Stable descending sort, so ties keep class order and the first entry is the
// argmax with the lowest index.
fn rank(scores: &[f32]) -> PredictionResult {
    let mut all_predictions: Vec<ClassScore> = CLASS_NAMES
        .iter()
        .zip(scores)
        .map(|(class, &confidence)| ClassScore {
            class: class.to_string(),
            confidence,
        })
        .collect();

    all_predictions.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    PredictionResult {
        predicted_class: all_predictions[0].class.clone(),
        confidence: all_predictions[0].confidence,
        all_predictions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageOutputFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn rank_orders_scores_descending() {
        let result = rank(&[0.05, 0.1, 0.6, 0.05, 0.15, 0.05]);

        assert_eq!(result.predicted_class, "metal");
        assert_eq!(result.confidence, 0.6);
        assert_eq!(result.all_predictions.len(), NUM_CLASSES);
        assert!(result
            .all_predictions
            .windows(2)
            .all(|w| w[0].confidence >= w[1].confidence));
    }

    #[test]
    fn rank_breaks_ties_by_class_order() {
        let result = rank(&[0.25, 0.25, 0.2, 0.1, 0.1, 0.1]);

        assert_eq!(result.predicted_class, "cardboard");
        assert_eq!(result.all_predictions[0].class, "cardboard");
        assert_eq!(result.all_predictions[1].class, "glass");
    }

    #[test]
    fn demo_scores_form_a_distribution() {
        let scores = demo_scores(b"some upload bytes");

        assert_eq!(scores.len(), NUM_CLASSES);
        assert!(scores.iter().all(|&s| (0.0..=1.0).contains(&s)));
        let total: f32 = scores.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn demo_scores_depend_only_on_the_first_100_bytes() {
        let a = vec![7u8; 200];
        let mut b = a.clone();
        b[150] = 9;

        assert_eq!(demo_scores(&a), demo_scores(&b));
    }

    #[test]
    fn demo_scores_change_with_early_bytes() {
        let a = vec![7u8; 200];
        let mut b = a.clone();
        b[50] = 9;

        assert_ne!(demo_scores(&a), demo_scores(&b));
    }

    #[test]
    fn preprocess_produces_a_normalized_224_square() {
        let pixels = preprocess(&png_bytes(64, 48)).unwrap();

        assert_eq!(pixels.len(), 224 * 224 * 3);
        assert!(pixels.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn preprocess_rejects_undecodable_bytes() {
        assert!(preprocess(b"definitely not an image").is_err());
    }

    #[test]
    fn unavailable_model_classifies_deterministically() {
        let state = ModelState::Unavailable("model file not found".to_string());
        let image = png_bytes(32, 32);

        let first = state.classify(&image).unwrap();
        let second = state.classify(&image).unwrap();

        assert_eq!(first.all_predictions.len(), NUM_CLASSES);
        assert_eq!(first.predicted_class, first.all_predictions[0].class);
        assert_eq!(first.confidence, first.all_predictions[0].confidence);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }
}
