//! 画像の正規化
//!
//! 任意サイズ・任意形式の画像を 28x28x1、値域 [0, 1] のテンソルに変換します。
//! 学習時と推論時で同じ処理を共有します。

use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};
use image::{imageops::FilterType, DynamicImage, GrayImage, Luma};
use serde::{Deserialize, Serialize};

use crate::error::{DigitError, Result};
use crate::ml::ml_model::IMAGE_SIZE;

/// 切り出し時に内容領域の周囲に残す余白（ピクセル）
pub const DEFAULT_CROP_MARGIN: u32 = 2;

/// 背景とみなす輝度（これ未満の画素を内容とみなす）
pub const DEFAULT_BACKGROUND_LEVEL: u8 = 255;

/// 正規化済み画像テンソル
///
/// 形状 (28, 28, 1)、行優先で 784 要素、各値は [0, 1]。
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
}

impl ImageTensor {
    /// 要素数
    pub const LEN: usize = IMAGE_SIZE * IMAGE_SIZE;

    /// 形状 (height, width, channels)
    pub const SHAPE: [usize; 3] = [IMAGE_SIZE, IMAGE_SIZE, 1];

    /// 0～255の輝度値から作成
    pub fn from_pixels(pixels: &[u8]) -> Result<Self> {
        if pixels.len() != Self::LEN {
            return Err(DigitError::dataset(format!(
                "expected {} pixels, got {}",
                Self::LEN,
                pixels.len()
            )));
        }

        Ok(Self {
            data: pixels.iter().map(|&p| f32::from(p) / 255.0).collect(),
        })
    }

    /// 正規化済みの値から作成（長さと値域を検証）
    pub fn from_vec(data: Vec<f32>) -> Result<Self> {
        if data.len() != Self::LEN {
            return Err(DigitError::dataset(format!(
                "expected {} values, got {}",
                Self::LEN,
                data.len()
            )));
        }
        if let Some(v) = data.iter().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(DigitError::dataset(format!("value {v} outside [0, 1]")));
        }

        Ok(Self { data })
    }

    /// 全画素が同じ値のテンソル（範囲外は [0, 1] に丸め、NaN は 0）
    pub fn uniform(value: f32) -> Self {
        let value = if value.is_nan() {
            0.0
        } else {
            value.clamp(0.0, 1.0)
        };
        Self {
            data: vec![value; Self::LEN],
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        Self::SHAPE
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// (row, col) の値
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row >= IMAGE_SIZE || col >= IMAGE_SIZE {
            return None;
        }
        self.data.get(row * IMAGE_SIZE + col).copied()
    }

    /// 8bitグレースケール画像に戻す
    pub fn to_luma_image(&self) -> GrayImage {
        GrayImage::from_fn(IMAGE_SIZE as u32, IMAGE_SIZE as u32, |x, y| {
            let value = self.data[y as usize * IMAGE_SIZE + x as usize];
            Luma([(value * 255.0).round() as u8])
        })
    }

    /// バッチサイズ1のモデル入力 [1, 1, 28, 28] に変換
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        Tensor::<B, 1>::from_floats(self.data.as_slice(), device).reshape([
            1,
            1,
            IMAGE_SIZE,
            IMAGE_SIZE,
        ])
    }
}

/// 画像正規化の設定と処理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageNormalizer {
    /// 内容領域（背景以外の画素）で切り出してからリサイズするか
    pub crop_to_content: bool,
    /// 切り出し時の余白（ピクセル）
    pub crop_margin: u32,
    /// 背景輝度
    pub background_level: u8,
}

impl Default for ImageNormalizer {
    fn default() -> Self {
        Self {
            crop_to_content: true,
            crop_margin: DEFAULT_CROP_MARGIN,
            background_level: DEFAULT_BACKGROUND_LEVEL,
        }
    }
}

impl ImageNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 切り出しの有効/無効を設定
    pub fn with_crop(mut self, crop_to_content: bool) -> Self {
        self.crop_to_content = crop_to_content;
        self
    }

    /// 画像ファイルを読み込んで正規化
    pub fn normalize_path(&self, path: &Path) -> Result<ImageTensor> {
        let img = image::open(path)
            .map_err(|e| DigitError::image_read(path.display().to_string(), e.to_string()))?;
        Ok(self.normalize_image(&img))
    }

    /// エンコード済みバイト列（PNG/JPEG等）を正規化
    pub fn normalize_bytes(&self, bytes: &[u8]) -> Result<ImageTensor> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| DigitError::image_read("<memory>", e.to_string()))?;
        Ok(self.normalize_image(&img))
    }

    /// デコード済み画像を正規化
    pub fn normalize_image(&self, img: &DynamicImage) -> ImageTensor {
        let gray = img.to_luma8();

        let gray = match self.content_bounds(&gray) {
            Some((x, y, width, height)) if self.crop_to_content => {
                log::debug!("内容領域で切り出し: ({x}, {y}) {width}x{height}");
                image::imageops::crop_imm(&gray, x, y, width, height).to_image()
            }
            _ => gray,
        };

        let target = IMAGE_SIZE as u32;
        let resized = if gray.dimensions() == (target, target) {
            gray
        } else {
            image::imageops::resize(&gray, target, target, FilterType::Lanczos3)
        };

        ImageTensor {
            data: resized.pixels().map(|p| f32::from(p[0]) / 255.0).collect(),
        }
    }

    /// 背景以外の画素を囲む矩形（余白込み、画像範囲にクランプ）
    ///
    /// # 戻り値
    /// - (x, y, width, height)。背景以外の画素がなければ `None`
    pub fn content_bounds(&self, gray: &GrayImage) -> Option<(u32, u32, u32, u32)> {
        let (width, height) = gray.dimensions();
        let mut bounds: Option<(u32, u32, u32, u32)> = None;

        for (x, y, pixel) in gray.enumerate_pixels() {
            if pixel[0] >= self.background_level {
                continue;
            }
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }

        let (min_x, min_y, max_x, max_y) = bounds?;
        let x0 = min_x.saturating_sub(self.crop_margin);
        let y0 = min_y.saturating_sub(self.crop_margin);
        let x1 = max_x.saturating_add(self.crop_margin).min(width - 1);
        let y1 = max_y.saturating_add(self.crop_margin).min(height - 1);

        Some((x0, y0, x1 - x0 + 1, y1 - y0 + 1))
    }
}
