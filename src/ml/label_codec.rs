//! ラベルとone-hot／確率ベクトルの相互変換

use serde::{Deserialize, Serialize};

use crate::error::{DigitError, Result};
use crate::ml::ml_model::NUM_CLASSES;

/// 学習ターゲット用のone-hotベクトル
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OneHot([f32; NUM_CLASSES]);

impl OneHot {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// 1.0 が立っているインデックス
    pub fn label(&self) -> u8 {
        decode(&self.0) as u8
    }
}

/// Softmax出力の確率ベクトル（長さ10、総和1）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityVector([f32; NUM_CLASSES]);

impl ProbabilityVector {
    /// スライスから作成（長さが10でなければ `None`）
    pub fn from_slice(values: &[f32]) -> Option<Self> {
        let array: [f32; NUM_CLASSES] = values.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<f32> {
        self.0.get(index).copied()
    }

    /// 最大確率のインデックス（同値は小さいインデックス優先）
    pub fn argmax(&self) -> usize {
        decode(&self.0)
    }

    pub fn sum(&self) -> f32 {
        self.0.iter().sum()
    }
}

/// ラベルをone-hotベクトルに変換
///
/// # エラー
/// - ラベルが [0, 9] の範囲外なら `DigitError::InvalidLabel`
pub fn encode(label: i64) -> Result<OneHot> {
    let index = usize::try_from(label)
        .ok()
        .filter(|&i| i < NUM_CLASSES)
        .ok_or(DigitError::InvalidLabel(label))?;

    let mut one_hot = [0.0; NUM_CLASSES];
    one_hot[index] = 1.0;
    Ok(OneHot(one_hot))
}

/// 確率ベクトルから最大要素のインデックスを返す
///
/// 同値の場合は走査順で最初のものを返します。空スライスは 0。
pub fn decode(probabilities: &[f32]) -> usize {
    let mut best = 0;
    for (i, &p) in probabilities.iter().enumerate().skip(1) {
        if p > probabilities[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_labels() {
        for label in 0..10 {
            let one_hot = encode(label).unwrap();
            assert_eq!(decode(one_hot.as_slice()), label as usize);
            assert_eq!(one_hot.label(), label as u8);
        }
    }

    #[test]
    fn test_encode_shape() {
        let one_hot = encode(7).unwrap();
        assert_eq!(one_hot.as_slice().len(), 10);
        assert_eq!(one_hot.as_slice().iter().sum::<f32>(), 1.0);
        assert_eq!(one_hot.as_slice()[7], 1.0);
    }

    #[test]
    fn test_encode_out_of_range() {
        assert!(matches!(encode(10), Err(DigitError::InvalidLabel(10))));
        assert!(matches!(encode(-1), Err(DigitError::InvalidLabel(-1))));
    }

    #[test]
    fn test_decode_tie_takes_first() {
        let probs = [0.1, 0.3, 0.05, 0.3, 0.25, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(decode(&probs), 1);
    }

    #[test]
    fn test_decode_uniform_is_zero() {
        assert_eq!(decode(&[0.1; 10]), 0);
    }

    #[test]
    fn test_probability_vector_from_slice() {
        assert!(ProbabilityVector::from_slice(&[0.1; 10]).is_some());
        assert!(ProbabilityVector::from_slice(&[0.1; 9]).is_none());

        let probs = ProbabilityVector::from_slice(&[0.0, 0.0, 0.9, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
            .unwrap();
        assert_eq!(probs.argmax(), 2);
        assert_eq!(probs.get(2), Some(0.9));
        assert!((probs.sum() - 1.0).abs() < 1e-6);
    }
}
