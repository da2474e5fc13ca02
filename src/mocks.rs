use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ndarray::prelude::*;
use parking_lot::Mutex;

use crate::device::ExecutionDevice;
use crate::errors::{Result, SegError};
use crate::preprocess::ModelInput;
use crate::runtime::RawPrediction;
use crate::traits::SegmentationModel;

/// テスト用のモックセグメンテーションモデル
///
/// 入力サイズの1/4で3チャンネルのマスクを返す。各ロジットはサンプルした正規化済み画素の
/// チャンネル平均なので、明るい領域は正、パディングはちょうど0になる。3チャンネル目は1チャンネル目の符号反転
#[derive(Debug)]
pub struct MockSegmentationModel {
    pub image_size: u32,
    fail: bool,
    delay: Option<Duration>,
    device_lock: Mutex<()>,
    predict_calls: AtomicUsize,
    release_calls: AtomicUsize,
}

impl MockSegmentationModel {
    pub const fn new(image_size: u32) -> Self {
        Self {
            image_size,
            fail: false,
            delay: None,
            device_lock: Mutex::new(()),
            predict_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
        }
    }

    /// すべての`predict`呼び出しを推論エラーにする
    pub const fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// 呼び出しごとにデバイスロックを`delay`の間保持する
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn predict_calls(&self) -> usize {
        self.predict_calls.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }
}

impl SegmentationModel for MockSegmentationModel {
    fn input_size(&self) -> u32 {
        self.image_size
    }

    fn device(&self) -> ExecutionDevice {
        ExecutionDevice::Cpu
    }

    fn predict(&self, input: &ModelInput) -> Result<RawPrediction> {
        let _device = self.device_lock.lock();
        self.predict_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail {
            return Err(SegError::inference("mock run", "configured to fail"));
        }

        let side = (self.image_size / 4).max(1) as usize;
        let stride = self.image_size as usize / side;
        let pixels = input.pixel_values.index_axis(Axis(0), 0);
        let masks = Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
            let value = pixels
                .slice(s![.., y * stride, x * stride])
                .mean()
                .unwrap_or(0.0);
            if channel == 2 {
                -value
            } else {
                value
            }
        });
        Ok(RawPrediction::new(masks.into_dyn()))
    }

    fn release_caches(&self) {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// テスト用のモックモデル作成（SAMの標準入力サイズ）
pub const fn create_mock_model() -> MockSegmentationModel {
    MockSegmentationModel::new(1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::SourceImage;
    use crate::preprocess::{Processor, PromptPoint};
    use image::{DynamicImage, Rgb, RgbImage};

    #[test]
    fn test_mock_model_creation() {
        let mock = create_mock_model();
        assert_eq!(mock.input_size(), 1024);
        assert_eq!(mock.device(), ExecutionDevice::Cpu);
    }

    #[test]
    fn test_mock_model_predict() -> Result<()> {
        let mock = MockSegmentationModel::new(16);
        let image = SourceImage::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            16,
            8,
            Rgb([255, 255, 255]),
        )));
        let input = Processor::with_size(16).prepare(&image, &[PromptPoint::new(8.0, 4.0)])?;

        let prediction = mock.predict(&input)?;
        assert_eq!(prediction.shape(), &[1, 3, 4, 4]);
        // 上段は白画像、下段はパディングをサンプル
        assert!(prediction.masks()[[0, 0, 0, 0]] > 0.0);
        assert!(prediction.masks()[[0, 2, 0, 0]] < 0.0);
        assert_eq!(prediction.masks()[[0, 0, 3, 0]], 0.0);
        assert_eq!(mock.predict_calls(), 1);
        Ok(())
    }
}
