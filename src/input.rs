// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use thiserror::Error;

use crate::{FromUrl, frame::Frame};

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{
  GStreamerInput, GStreamerInputError, GStreamerInputFrames, GStreamerInputPipelineBuilder,
};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer input error: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("Input kind not enabled in this build: {0}")]
  Unsupported(String),
}

pub enum InputWrapper {
  #[cfg(feature = "gstreamer_input")]
  GStreamerInput(GStreamerInput),
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "gstreamer_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == GStreamerInputPipelineBuilder::SCHEME {
        let input = GStreamerInputPipelineBuilder::from_url(url)?.build()?;
        return Ok(InputWrapper::GStreamerInput(input));
      }
    }
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    Err(InputError::SchemeMismatch)
  }
}

impl InputWrapper {
  /// 打开编号为 `index` 的摄像头（`/dev/video{index}`）
  pub fn camera(index: u32) -> Result<Self, InputError> {
    #[cfg(feature = "gstreamer_input")]
    {
      let input = GStreamerInputPipelineBuilder::new()
        .camera(format!("/dev/video{}", index))
        .target_format("RGB")
        .build()?;
      Ok(InputWrapper::GStreamerInput(input))
    }
    #[cfg(not(feature = "gstreamer_input"))]
    {
      Err(InputError::Unsupported(format!("camera {}", index)))
    }
  }

  /// 打开视频文件；图片文件（jpg/png 等）只产生一帧
  pub fn file<P: AsRef<Path>>(path: P) -> Result<Self, InputError> {
    let path = path.as_ref();

    #[cfg(feature = "read_image_file")]
    if ImageFileInput::is_image_path(path) {
      return Ok(InputWrapper::ReadImageFile(ImageFileInput::open(path)?));
    }

    #[cfg(feature = "gstreamer_input")]
    {
      let input = GStreamerInputPipelineBuilder::new()
        .file(path.to_string_lossy())
        .target_format("RGB")
        .build()?;
      Ok(InputWrapper::GStreamerInput(input))
    }
    #[cfg(not(feature = "gstreamer_input"))]
    {
      Err(InputError::Unsupported(path.display().to_string()))
    }
  }

  pub fn into_frames(self) -> InputWrapperIter {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => InputWrapperIter::GStreamerInput(input.into_frames()),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => InputWrapperIter::ReadImageFile(input.into_frames()),
    }
  }
}

pub enum InputWrapperIter {
  #[cfg(feature = "gstreamer_input")]
  GStreamerInput(GStreamerInputFrames),
  #[cfg(feature = "read_image_file")]
  ReadImageFile(self::read_image_file::ImageFileInputFrames),
}

impl InputWrapperIter {
  /// 输入源帧率（已知时）
  pub fn fps(&self) -> Option<f64> {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapperIter::GStreamerInput(input) => input.fps(),
      #[cfg(feature = "read_image_file")]
      InputWrapperIter::ReadImageFile(_) => None,
    }
  }
}

impl Iterator for InputWrapperIter {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapperIter::GStreamerInput(input) => input.next(),
      #[cfg(feature = "read_image_file")]
      InputWrapperIter::ReadImageFile(input) => input.next(),
    }
  }
}
