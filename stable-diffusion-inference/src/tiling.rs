//! Tiled VAE encoding and decoding.
//!
//! Large images are split into overlapping tiles that go through the autoencoder one by one,
//! the overlapping parts are linearly cross-faded (top to bottom, then left to right) so seams
//! do not show. Peak memory is bounded by the tile size rather than by the image size.

use {
    candle::{Result, Tensor},
    candle_transformers::models::stable_diffusion::vae::AutoEncoderKL,
};

/// Tile edge in pixels.
pub const SAMPLE_TILE_SIZE: usize = 512;
/// Tile edge in latent units.
pub const LATENT_TILE_SIZE: usize = SAMPLE_TILE_SIZE / 8;
pub const TILE_OVERLAP: f64 = 0.25;

pub fn needs_tiling(height: usize, width: usize, tile: usize) -> bool {
    height > tile || width > tile
}

/// Decodes latents of shape `(b, 4, h, w)` into images of shape `(b, 3, 8h, 8w)`.
pub fn tiled_decode(vae: &AutoEncoderKL, latents: &Tensor) -> Result<Tensor> {
    process_tiled(latents, LATENT_TILE_SIZE, SAMPLE_TILE_SIZE, |tile| vae.decode(tile))
}

/// Encodes images of shape `(b, 3, h, w)` and samples latents of shape `(b, 4, h/8, w/8)`.
///
/// candle's autoencoder only hands out samples of the latent distribution, not its mean and
/// deviation, so every tile is sampled on its own and the samples are blended. Noise in the
/// overlaps ends up slightly weaker than in the rest of the latents.
pub fn tiled_encode(vae: &AutoEncoderKL, images: &Tensor) -> Result<Tensor> {
    process_tiled(images, SAMPLE_TILE_SIZE, LATENT_TILE_SIZE, |tile| vae.encode(tile)?.sample())
}

pub fn tile_starts(len: usize, stride: usize) -> Vec<usize> {
    (0..len).step_by(stride.max(1)).collect()
}

fn process_tiled<F>(input: &Tensor, tile_in: usize, tile_out: usize, mut f: F) -> Result<Tensor>
where
    F: FnMut(&Tensor) -> Result<Tensor>,
{
    let (_, _, height, width) = input.dims4()?;

    let stride = (tile_in as f64 * (1. - TILE_OVERLAP)) as usize;
    let blend_extent = (tile_out as f64 * TILE_OVERLAP) as usize;
    let row_limit = tile_out - blend_extent;

    let mut rows: Vec<Vec<Tensor>> = Vec::new();
    for y in tile_starts(height, stride) {
        let mut row = Vec::new();
        for x in tile_starts(width, stride) {
            let tile = input
                .narrow(2, y, tile_in.min(height - y))?
                .narrow(3, x, tile_in.min(width - x))?;
            row.push(f(&tile)?);
        }
        rows.push(row);
    }

    let mut result_rows = Vec::with_capacity(rows.len());
    for i in 0..rows.len() {
        let mut result_row = Vec::with_capacity(rows[i].len());
        for j in 0..rows[i].len() {
            let mut tile = rows[i][j].clone();
            if i > 0 {
                tile = blend_v(&rows[i - 1][j], &tile, blend_extent)?;
            }
            if j > 0 {
                tile = blend_h(&rows[i][j - 1], &tile, blend_extent)?;
            }
            // later neighbours blend against the already blended tile
            rows[i][j] = tile.clone();

            let (_, _, tile_height, tile_width) = tile.dims4()?;
            result_row.push(
                tile.narrow(2, 0, row_limit.min(tile_height))?
                    .narrow(3, 0, row_limit.min(tile_width))?
            );
        }
        result_rows.push(Tensor::cat(&result_row, 3)?);
    }

    Tensor::cat(&result_rows, 2)
}

pub fn blend_v(top: &Tensor, bottom: &Tensor, extent: usize) -> Result<Tensor> {
    blend(top, bottom, extent, 2)
}

pub fn blend_h(left: &Tensor, right: &Tensor, extent: usize) -> Result<Tensor> {
    blend(left, right, extent, 3)
}

// the first `extent` rows (or columns) of `b` fade in from the last `extent` of `a`
fn blend(a: &Tensor, b: &Tensor, extent: usize, dim: usize) -> Result<Tensor> {
    let a_len = a.dim(dim)?;
    let b_len = b.dim(dim)?;
    let extent = extent.min(a_len).min(b_len);
    if extent == 0 {
        return Ok(b.clone());
    }

    let ramp: Vec<f32> = (0..extent).map(|i| i as f32 / extent as f32).collect();
    let shape = if dim == 2 { (1, 1, extent, 1) } else { (1, 1, 1, extent) };
    let weights = Tensor::from_vec(ramp, shape, b.device())?.to_dtype(b.dtype())?;

    let a_tail = a.narrow(dim, a_len - extent, extent)?;
    let b_head = b.narrow(dim, 0, extent)?;
    let blended = (a_tail.broadcast_mul(&weights.affine(-1., 1.)?)? + b_head.broadcast_mul(&weights)?)?;

    if b_len == extent {
        return Ok(blended);
    }
    Tensor::cat(&[&blended, &b.narrow(dim, extent, b_len - extent)?], dim)
}
