//! 学習データセット
//!
//! MNIST形式（IDXファイル）または `<root>/<数字>/*.png` 形式のディレクトリから
//! 正規化済みの画像とラベルを読み込みます。

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};
use flate2::read::GzDecoder;

use crate::error::{DigitError, Result};
use crate::ml::label_codec::{self, OneHot};
use crate::ml::ml_model::{IMAGE_SIZE, NUM_CLASSES};
use crate::ml::normalize::{ImageNormalizer, ImageTensor};

const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
const IDX_LABELS_MAGIC: u32 = 0x0000_0801;

const MNIST_TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const MNIST_TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const MNIST_TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const MNIST_TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// データセットアイテム（正規化済み画像 + one-hotターゲット）
#[derive(Clone, Debug)]
pub struct DigitItem {
    pub image: ImageTensor,
    pub target: OneHot,
}

impl DigitItem {
    /// ラベルを検証してアイテムを作成
    pub fn new(image: ImageTensor, label: i64) -> Result<Self> {
        Ok(Self {
            image,
            target: label_codec::encode(label)?,
        })
    }

    pub fn label(&self) -> u8 {
        self.target.label()
    }
}

/// メモリ上に保持する学習データセット
#[derive(Clone, Debug, Default)]
pub struct DigitDataset {
    items: Vec<DigitItem>,
}

impl DigitDataset {
    pub fn new(items: Vec<DigitItem>) -> Self {
        Self { items }
    }

    /// MNISTのIDXファイルを読み込み、(学習用, テスト用) を返す
    ///
    /// 各ファイルは非圧縮、または `.gz` 付きのgzip圧縮を受け付けます。
    pub fn from_mnist_dir(data_dir: &Path) -> Result<(Self, Self)> {
        let train = Self::from_idx_files(
            &resolve_idx_file(data_dir, MNIST_TRAIN_IMAGES)?,
            &resolve_idx_file(data_dir, MNIST_TRAIN_LABELS)?,
        )?;
        let test = Self::from_idx_files(
            &resolve_idx_file(data_dir, MNIST_TEST_IMAGES)?,
            &resolve_idx_file(data_dir, MNIST_TEST_LABELS)?,
        )?;

        log::info!(
            "MNISTを読み込みました: 学習 {} 枚, テスト {} 枚",
            train.len(),
            test.len()
        );
        Ok((train, test))
    }

    /// 指定ディレクトリにMNISTのIDXファイルが揃っているか
    pub fn is_mnist_dir(data_dir: &Path) -> bool {
        [
            MNIST_TRAIN_IMAGES,
            MNIST_TRAIN_LABELS,
            MNIST_TEST_IMAGES,
            MNIST_TEST_LABELS,
        ]
        .iter()
        .all(|name| resolve_idx_file(data_dir, name).is_ok())
    }

    /// 画像・ラベルのIDXファイル組から読み込む
    pub fn from_idx_files(images_path: &Path, labels_path: &Path) -> Result<Self> {
        let images = parse_idx_images(&read_maybe_gz(images_path)?)?;
        let labels = parse_idx_labels(&read_maybe_gz(labels_path)?)?;

        if images.len() != labels.len() {
            return Err(DigitError::dataset(format!(
                "{} images but {} labels ({} / {})",
                images.len(),
                labels.len(),
                images_path.display(),
                labels_path.display()
            )));
        }

        let items = images
            .into_iter()
            .zip(labels)
            .map(|(image, label)| DigitItem::new(image, i64::from(label)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { items })
    }

    /// `<data_dir>/<0..9>/` 以下の画像を読み込む
    ///
    /// 各画像は `normalizer` で正規化されます。数字ディレクトリが存在しない
    /// クラスはスキップします。
    pub fn from_directory(data_dir: &Path, normalizer: &ImageNormalizer) -> Result<Self> {
        let mut items = Vec::new();

        for label in 0..NUM_CLASSES {
            let class_dir = data_dir.join(label.to_string());
            if !class_dir.is_dir() {
                log::warn!("クラスディレクトリが存在しません: {}", class_dir.display());
                continue;
            }

            let mut paths: Vec<PathBuf> = std::fs::read_dir(&class_dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_file() && has_image_extension(path))
                .collect();
            // 読み込み順を決定的にする
            paths.sort();

            for path in paths {
                let image = normalizer.normalize_path(&path)?;
                items.push(DigitItem::new(image, label as i64)?);
            }
        }

        if items.is_empty() {
            return Err(DigitError::dataset(format!(
                "no training samples found in {}",
                data_dir.display()
            )));
        }

        let dataset = Self { items };
        for (label, count) in dataset.class_counts().iter().enumerate() {
            log::info!("  クラス {label}: {count} 枚");
        }
        Ok(dataset)
    }

    /// データセットを学習用と検証用に分割
    ///
    /// `seed` で決定的にシャッフルしてから `train_ratio` の割合で分けます。
    pub fn split(self, train_ratio: f32, seed: u64) -> (Self, Self) {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut items = self.items;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        items.shuffle(&mut rng);

        let ratio = train_ratio.clamp(0.0, 1.0);
        let train_len = ((items.len() as f32 * ratio) as usize).min(items.len());
        let valid = items.split_off(train_len);

        (Self { items }, Self { items: valid })
    }

    /// クラスごとのサンプル数
    pub fn class_counts(&self) -> [usize; NUM_CLASSES] {
        let mut counts = [0; NUM_CLASSES];
        for item in &self.items {
            counts[item.label() as usize] += 1;
        }
        counts
    }

    pub fn items(&self) -> &[DigitItem] {
        &self.items
    }
}

impl Dataset<DigitItem> for DigitDataset {
    fn get(&self, index: usize) -> Option<DigitItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// バッチャー
#[derive(Clone, Debug)]
pub struct DigitBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> DigitBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct DigitBatch<B: Backend> {
    /// [batch_size, 1, 28, 28]
    pub images: Tensor<B, 4>,
    /// one-hot [batch_size, 10]
    pub targets: Tensor<B, 2>,
    /// 整数ラベル [batch_size]
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, DigitItem, DigitBatch<B>> for DigitBatcher<B> {
    fn batch(&self, items: Vec<DigitItem>, _device: &B::Device) -> DigitBatch<B> {
        let batch_size = items.len();
        let mut pixels = Vec::with_capacity(batch_size * ImageTensor::LEN);
        let mut targets = Vec::with_capacity(batch_size * NUM_CLASSES);
        let mut labels = Vec::with_capacity(batch_size);

        for item in &items {
            pixels.extend_from_slice(item.image.as_slice());
            targets.extend_from_slice(item.target.as_slice());
            labels.push(i64::from(item.label()));
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device).reshape([
            batch_size,
            1,
            IMAGE_SIZE,
            IMAGE_SIZE,
        ]);
        let targets = Tensor::<B, 1>::from_floats(targets.as_slice(), &self.device)
            .reshape([batch_size, NUM_CLASSES]);
        let labels = Tensor::<B, 1, Int>::from_ints(labels.as_slice(), &self.device);

        DigitBatch {
            images,
            targets,
            labels,
        }
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// `name` または `name.gz` を探す
fn resolve_idx_file(data_dir: &Path, name: &str) -> Result<PathBuf> {
    let plain = data_dir.join(name);
    if plain.is_file() {
        return Ok(plain);
    }
    let gz = data_dir.join(format!("{name}.gz"));
    if gz.is_file() {
        return Ok(gz);
    }
    Err(DigitError::dataset(format!(
        "{name} not found in {}",
        data_dir.display()
    )))
}

fn read_maybe_gz(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut bytes = Vec::new();
    if path.extension().and_then(|s| s.to_str()) == Some("gz") {
        GzDecoder::new(file).read_to_end(&mut bytes).map_err(|e| {
            DigitError::dataset(format!("failed to decompress {}: {e}", path.display()))
        })?;
    } else {
        let mut file = file;
        file.read_to_end(&mut bytes)?;
    }
    Ok(bytes)
}

fn read_be_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| DigitError::dataset("truncated IDX header"))
}

/// IDX3（画像）形式を解析
pub fn parse_idx_images(bytes: &[u8]) -> Result<Vec<ImageTensor>> {
    let magic = read_be_u32(bytes, 0)?;
    if magic != IDX_IMAGES_MAGIC {
        return Err(DigitError::dataset(format!(
            "bad IDX image magic {magic:#010x}"
        )));
    }

    let count = read_be_u32(bytes, 4)? as usize;
    let rows = read_be_u32(bytes, 8)? as usize;
    let cols = read_be_u32(bytes, 12)? as usize;
    if rows != IMAGE_SIZE || cols != IMAGE_SIZE {
        return Err(DigitError::dataset(format!(
            "expected {IMAGE_SIZE}x{IMAGE_SIZE} images, got {rows}x{cols}"
        )));
    }

    let payload = &bytes[16..];
    let expected = count * ImageTensor::LEN;
    if payload.len() < expected {
        return Err(DigitError::dataset(format!(
            "IDX image payload truncated: expected {expected} bytes, got {}",
            payload.len()
        )));
    }

    payload[..expected]
        .chunks_exact(ImageTensor::LEN)
        .map(ImageTensor::from_pixels)
        .collect()
}

/// IDX1（ラベル）形式を解析
pub fn parse_idx_labels(bytes: &[u8]) -> Result<Vec<u8>> {
    let magic = read_be_u32(bytes, 0)?;
    if magic != IDX_LABELS_MAGIC {
        return Err(DigitError::dataset(format!(
            "bad IDX label magic {magic:#010x}"
        )));
    }

    let count = read_be_u32(bytes, 4)? as usize;
    let payload = &bytes[8..];
    if payload.len() < count {
        return Err(DigitError::dataset(format!(
            "IDX label payload truncated: expected {count} bytes, got {}",
            payload.len()
        )));
    }

    Ok(payload[..count].to_vec())
}
