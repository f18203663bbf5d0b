use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageOutputFormat};

/// 从解复用器得到的原始帧（编码后的 JPEG 字节）
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Position in the sampled sequence, counting frames dropped downstream.
    pub index: u64,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(index: u64, data: Vec<u8>) -> Self {
        Self { index, data }
    }

    /// Recording timestamp of this frame given the chunk start and the
    /// sampling period.
    pub fn vod_timestamp(&self, start_seconds: u64, period_seconds: f64) -> f64 {
        start_seconds as f64 + self.index as f64 * period_seconds
    }

    pub fn decode(&self) -> Result<DecodedFrame, image::ImageError> {
        let image = image::load_from_memory(&self.data)?;
        Ok(DecodedFrame::from_image(&image))
    }
}

/// 解码后的灰度帧，匹配与 OCR 都在灰度上进行
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub gray: GrayImage,
}

impl DecodedFrame {
    pub fn from_image(image: &DynamicImage) -> Self {
        Self {
            gray: image.to_luma8(),
        }
    }

    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }

    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> GrayImage {
        image::imageops::crop_imm(&self.gray, x, y, width, height).to_image()
    }
}

pub fn encode_jpeg(gray: &GrayImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    gray.write_to(&mut buffer, ImageOutputFormat::Jpeg(quality))?;
    Ok(buffer.into_inner())
}

pub fn encode_png(gray: &GrayImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    gray.write_to(&mut buffer, ImageOutputFormat::Png)?;
    Ok(buffer.into_inner())
}
