//! Post-processing applied to generated images.
//!
//! Each adjustment interpolates between the image and a "degenerate" version of it
//! (blurred, flat gray or grayscale), so a factor of `1.0` leaves the image unchanged,
//! values below `1.0` move towards the degenerate image and values above push away from it.

use {
    serde::{Deserialize, Serialize},
    image::{RgbImage, Rgb, imageops},
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct UnsharpMask {
    pub radius: f32,
    pub percent: i32,
    pub threshold: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct EnhanceParams {
    pub sharpness: f32,
    pub contrast: f32,
    pub color: f32,
    pub unsharp_mask: Option<UnsharpMask>,
}

impl Default for EnhanceParams {
    fn default() -> Self {
        Self {
            sharpness: 1.0,
            contrast: 1.0,
            color: 1.0,
            unsharp_mask: None,
        }
    }
}

impl EnhanceParams {
    pub fn bulk() -> Self {
        Self {
            sharpness: 1.15,
            contrast: 1.05,
            color: 1.02,
            unsharp_mask: None,
        }
    }

    pub fn sdxl() -> Self {
        Self {
            sharpness: 1.10,
            contrast: 1.05,
            color: 1.03,
            unsharp_mask: None,
        }
    }

    /// Stronger sharpening plus an unsharp mask, for images upscaled without diffusion.
    pub fn wallpaper_4k() -> Self {
        Self {
            sharpness: 1.20,
            contrast: 1.05,
            color: 1.03,
            unsharp_mask: Some(UnsharpMask {
                radius: 1.5,
                percent: 50,
                threshold: 3,
            }),
        }
    }
}

/// Applies sharpness, contrast, color and the optional unsharp mask, in that order.
pub fn enhance(image: &RgbImage, params: &EnhanceParams) -> RgbImage {
    let image = sharpness(image, params.sharpness);
    let image = contrast(&image, params.contrast);
    let image = color(&image, params.color);

    match &params.unsharp_mask {
        Some(mask) => unsharp_mask(&image, mask),
        None => image,
    }
}

pub fn sharpness(image: &RgbImage, factor: f32) -> RgbImage {
    blend(&smooth(image), image, factor)
}

pub fn contrast(image: &RgbImage, factor: f32) -> RgbImage {
    let mean = mean_luma(image);
    let degenerate = RgbImage::from_pixel(image.width(), image.height(), Rgb([mean, mean, mean]));
    blend(&degenerate, image, factor)
}

pub fn color(image: &RgbImage, factor: f32) -> RgbImage {
    let degenerate = RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let l = luma(image.get_pixel(x, y));
        Rgb([l, l, l])
    });
    blend(&degenerate, image, factor)
}

pub fn unsharp_mask(image: &RgbImage, mask: &UnsharpMask) -> RgbImage {
    let blurred = imageops::blur(image, mask.radius);

    let mut output = image.clone();
    for (out, (input, blurred)) in output.pixels_mut().zip(image.pixels().zip(blurred.pixels())) {
        for c in 0..3 {
            let value = input[c] as i32;
            let diff = value - blurred[c] as i32;
            out[c] = if diff.abs() >= mask.threshold {
                (value + diff * mask.percent / 100).clamp(0, 255) as u8
            } else {
                input[c]
            };
        }
    }

    output
}

/// ITU-R 601-2 luma in fixed point.
fn luma(pixel: &Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    ((r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16) as u8
}

fn mean_luma(image: &RgbImage) -> u8 {
    let count = image.width() as u64 * image.height() as u64;
    if count == 0 {
        return 0;
    }

    let sum: u64 = image.pixels().map(|p| luma(p) as u64).sum();
    (sum as f64 / count as f64 + 0.5) as u8
}

// out = degenerate + factor * (image - degenerate)
fn blend(degenerate: &RgbImage, image: &RgbImage, factor: f32) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let a = degenerate.get_pixel(x, y);
        let b = image.get_pixel(x, y);

        let mut out = [0u8; 3];
        for c in 0..3 {
            let value = a[c] as f32 + factor * (b[c] as f32 - a[c] as f32);
            out[c] = value.clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    })
}

// 3x3 smoothing kernel (1 1 1 / 1 5 1 / 1 1 1) / 13, border pixels are copied as is
fn smooth(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    if width < 3 || height < 3 {
        return image.clone();
    }

    let mut output = image.clone();
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut sums = [0u32; 3];
            for dy in 0..3 {
                for dx in 0..3 {
                    let weight = if dx == 1 && dy == 1 { 5 } else { 1 };
                    let pixel = image.get_pixel(x + dx - 1, y + dy - 1);
                    for c in 0..3 {
                        sums[c] += pixel[c] as u32 * weight;
                    }
                }
            }

            let pixel = output.get_pixel_mut(x, y);
            for c in 0..3 {
                pixel[c] = ((sums[c] as f32 / 13.0) + 0.5).min(255.0) as u8;
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 30 % 256) as u8, (y * 45 % 256) as u8, ((x + y) * 20 % 256) as u8])
        })
    }

    #[test]
    fn unit_factors_are_identity() {
        let image = gradient(8, 6);
        let enhanced = enhance(&image, &EnhanceParams::default());
        assert_eq!(enhanced, image);
    }

    #[test]
    fn zero_color_produces_grayscale() {
        let image = RgbImage::from_pixel(2, 2, Rgb([255, 0, 0]));
        let gray = color(&image, 0.0);

        let pixel = gray.get_pixel(0, 0);
        assert_eq!(pixel[0], pixel[1]);
        assert_eq!(pixel[1], pixel[2]);
        assert_eq!(pixel[0], 76);
    }

    #[test]
    fn contrast_of_flat_image_is_unchanged() {
        let image = RgbImage::from_pixel(5, 5, Rgb([120, 120, 120]));
        assert_eq!(contrast(&image, 1.5), image);
    }

    #[test]
    fn contrast_pushes_away_from_mean() {
        let mut image = RgbImage::from_pixel(2, 1, Rgb([100, 100, 100]));
        image.put_pixel(1, 0, Rgb([200, 200, 200]));

        let enhanced = contrast(&image, 2.0);
        assert_eq!(enhanced.get_pixel(0, 0), &Rgb([50, 50, 50]));
        assert_eq!(enhanced.get_pixel(1, 0), &Rgb([250, 250, 250]));
    }

    #[test]
    fn sharpness_keeps_border_pixels() {
        let image = gradient(6, 6);
        let sharpened = sharpness(&image, 2.0);

        for x in 0..6 {
            assert_eq!(sharpened.get_pixel(x, 0), image.get_pixel(x, 0));
            assert_eq!(sharpened.get_pixel(x, 5), image.get_pixel(x, 5));
        }
    }

    #[test]
    fn sharpness_amplifies_isolated_peak() {
        let mut image = RgbImage::from_pixel(5, 5, Rgb([100, 100, 100]));
        image.put_pixel(2, 2, Rgb([152, 152, 152]));

        let sharpened = sharpness(&image, 2.0);
        assert!(sharpened.get_pixel(2, 2)[0] > 152);
        assert!(sharpened.get_pixel(1, 2)[0] < 100);
    }

    #[test]
    fn unsharp_mask_respects_threshold() {
        let image = gradient(16, 16);
        let mask = UnsharpMask {
            radius: 1.5,
            percent: 50,
            threshold: 256,
        };
        assert_eq!(unsharp_mask(&image, &mask), image);
    }

    // 16 pixels wide, dark up to x = 7 and bright from x = 8
    fn step_edge() -> RgbImage {
        RgbImage::from_fn(16, 4, |x, _| if x < 8 { Rgb([100, 100, 100]) } else { Rgb([200, 200, 200]) })
    }

    #[test]
    fn unsharp_mask_overshoots_step_edge() {
        let mask = UnsharpMask {
            radius: 1.5,
            percent: 50,
            threshold: 3,
        };
        let enhanced = unsharp_mask(&step_edge(), &mask);

        let row: Vec<u8> = (4..12).map(|x| enhanced.get_pixel(x, 2)[0]).collect();
        assert_eq!(row, vec![100, 98, 93, 82, 218, 207, 202, 200]);
    }

    #[test]
    fn unsharp_mask_threshold_is_inclusive() {
        let image = step_edge();
        let blurred = imageops::blur(&image, 1.5);
        let diff = image.get_pixel(6, 2)[0] as i32 - blurred.get_pixel(6, 2)[0] as i32;
        assert!(diff != 0);

        let at_threshold = unsharp_mask(&image, &UnsharpMask {
            radius: 1.5,
            percent: 100,
            threshold: diff.abs(),
        });
        assert_eq!(at_threshold.get_pixel(6, 2)[0] as i32, 100 + diff);

        let above_threshold = unsharp_mask(&image, &UnsharpMask {
            radius: 1.5,
            percent: 100,
            threshold: diff.abs() + 1,
        });
        assert_eq!(above_threshold.get_pixel(6, 2)[0], 100);
    }

    #[test]
    fn unsharp_mask_leaves_flat_image_alone() {
        let image = RgbImage::from_pixel(9, 9, Rgb([128, 128, 128]));
        let enhanced = enhance(&image, &EnhanceParams::wallpaper_4k());
        assert_eq!(enhanced, image);
    }

    #[test]
    fn presets_match_programs() {
        assert_eq!(EnhanceParams::bulk().sharpness, 1.15);
        assert_eq!(EnhanceParams::sdxl().color, 1.03);
        assert_eq!(EnhanceParams::wallpaper_4k().unsharp_mask.unwrap().percent, 50);
    }
}
