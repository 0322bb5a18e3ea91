use {
    candle::{DType, Device, Tensor, IndexOp},
    image::{RgbImage, imageops::{self, FilterType}},
    crate::error::{Error, Result},
};

/// Largest dimensions not above the given ones that the autoencoder accepts.
pub fn snap_to_latent_grid(width: u32, height: u32) -> (u32, u32) {
    (width - width % 8, height - height % 8)
}

pub fn resize(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    imageops::resize(image, width, height, FilterType::Lanczos3)
}

/// Converts an image into a `(1, 3, h, w)` tensor with values in `[-1, 1]`.
pub fn image_to_tensor(image: &RgbImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (width, height) = image.dimensions();
    let tensor = Tensor::from_vec(image.as_raw().clone(), (height as usize, width as usize, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?
        .to_dtype(dtype)?
        .to_device(device)?;
    Ok(tensor)
}

/// Converts the first image of a decoded `(b, 3, h, w)` batch with values in `[-1, 1]` into an image.
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let image = ((tensor.to_dtype(DType::F32)? / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
    let image = (image.clamp(0f32, 1f32)? * 255.)?.round()?.to_dtype(DType::U8)?.i(0)?;

    let (channels, height, width) = image.dims3()?;
    if channels != 3 {
        return Err(Error::InvalidDimensions {
            width,
            height,
            reason: format!("expected 3 channels, got {}", channels),
        });
    }

    let pixels = image.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| Error::InvalidDimensions {
            width,
            height,
            reason: "pixel buffer does not match image size".to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use {
        image::Rgb,
        super::*,
    };

    #[test]
    fn snapping_rounds_down_to_multiple_of_eight() {
        assert_eq!(snap_to_latent_grid(960, 540), (960, 536));
        assert_eq!(snap_to_latent_grid(1920, 1080), (1920, 1080));
        assert_eq!(snap_to_latent_grid(768, 1152), (768, 1152));
    }

    #[test]
    fn image_tensor_conversion_preserves_pixels() {
        let mut image = RgbImage::from_pixel(3, 2, Rgb([0, 128, 255]));
        image.put_pixel(2, 1, Rgb([255, 255, 0]));

        let tensor = image_to_tensor(&image, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(tensor.dims4().unwrap(), (1, 3, 2, 3));

        let restored = tensor_to_image(&tensor).unwrap();
        assert_eq!(restored.dimensions(), (3, 2));
        assert_eq!(restored.get_pixel(2, 1), &Rgb([255, 255, 0]));
        assert_eq!(restored.get_pixel(0, 0)[0], 0);
        assert_eq!(restored.get_pixel(0, 0)[2], 255);
    }

    #[test]
    fn resize_to_same_size_is_noop() {
        let image = RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]));
        assert_eq!(resize(&image, 4, 4), image);
        assert_eq!(resize(&image, 8, 6).dimensions(), (8, 6));
    }
}
