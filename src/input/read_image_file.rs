// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::Path;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "gif", "webp"];

/// 单张图片输入，只产生一帧
pub struct ImageFileInput {
  image: Option<RgbImage>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    Self::open(url.path())
  }
}

impl ImageFileInput {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ImageFileInputError> {
    let path = path.as_ref();
    info!("读取图片文件: {}", path.display());
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;

    Ok(ImageFileInput {
      image: Some(image.into_rgb8()),
    })
  }

  pub fn is_image_path(path: &Path) -> bool {
    path
      .extension()
      .and_then(|ext| ext.to_str())
      .map(|ext| {
        let ext = ext.to_lowercase();
        IMAGE_EXTENSIONS.contains(&ext.as_str())
      })
      .unwrap_or(false)
  }

  pub fn into_frames(self) -> ImageFileInputFrames {
    ImageFileInputFrames { inner: self }
  }
}

pub struct ImageFileInputFrames {
  inner: ImageFileInput,
}

impl Iterator for ImageFileInputFrames {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    self.inner.image.take().map(Frame::from)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn image_yields_exactly_one_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("still.png");
    RgbImage::from_pixel(4, 3, image::Rgb([9, 8, 7]))
      .save(&path)
      .unwrap();

    let url = Url::from_file_path(&path).unwrap();
    let url = Url::parse(&format!("image://{}", url.path())).unwrap();
    let mut frames = ImageFileInput::from_url(&url).unwrap().into_frames();

    let frame = frames.next().unwrap();
    assert_eq!((frame.width(), frame.height()), (4, 3));
    assert!(frames.next().is_none());
  }

  #[test]
  fn recognises_image_extensions() {
    assert!(ImageFileInput::is_image_path(Path::new("a/b.JPG")));
    assert!(!ImageFileInput::is_image_path(Path::new("a/b.mp4")));
    assert!(!ImageFileInput::is_image_path(Path::new("noext")));
  }
}
