//! Tiles a four-image batch into a single 2x2 grid PNG.

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, RgbaImage};
use std::io::Cursor;

/// Number of images a composite grid is built from.
pub const GRID_IMAGES: usize = 4;

/// Decode four equally sized PNG buffers and tile them left-to-right,
/// top-to-bottom into one PNG twice the width and height.
pub fn tile_images(pngs: &[Vec<u8>]) -> Result<Vec<u8>> {
    if pngs.len() != GRID_IMAGES {
        return Err(anyhow!(
            "expected {} images to tile, got {}",
            GRID_IMAGES,
            pngs.len()
        ));
    }

    let images = pngs
        .iter()
        .map(|buf| image::load_from_memory(buf).context("failed to decode result image"))
        .collect::<Result<Vec<_>>>()?;

    let (width, height) = (images[0].width(), images[0].height());
    if images
        .iter()
        .any(|img| img.width() != width || img.height() != height)
    {
        return Err(anyhow!("result images are not the same size"));
    }

    let mut canvas = RgbaImage::new(width * 2, height * 2);
    for (idx, img) in images.iter().enumerate() {
        let x = (idx as u32 % 2) * width;
        let y = (idx as u32 / 2) * height;
        image::imageops::replace(&mut canvas, &img.to_rgba8(), i64::from(x), i64::from(y));
    }

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(canvas)
        .write_to(&mut out, image::ImageFormat::Png)
        .context("failed to encode composite PNG")?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn solid_png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba(color));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn tiles_four_images_into_grid() {
        let pngs = vec![
            solid_png(8, 6, [255, 0, 0, 255]),
            solid_png(8, 6, [0, 255, 0, 255]),
            solid_png(8, 6, [0, 0, 255, 255]),
            solid_png(8, 6, [255, 255, 0, 255]),
        ];

        let composite = tile_images(&pngs).unwrap();
        let img = image::load_from_memory(&composite).unwrap().to_rgba8();
        assert_eq!(img.width(), 16);
        assert_eq!(img.height(), 12);

        // One pixel per quadrant.
        assert_eq!(img.get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
        assert_eq!(img.get_pixel(8, 0), &Rgba([0, 255, 0, 255]));
        assert_eq!(img.get_pixel(0, 6), &Rgba([0, 0, 255, 255]));
        assert_eq!(img.get_pixel(8, 6), &Rgba([255, 255, 0, 255]));
    }

    #[test]
    fn rejects_wrong_count() {
        let pngs = vec![solid_png(4, 4, [0, 0, 0, 255]); 3];
        assert!(tile_images(&pngs).is_err());
    }

    #[test]
    fn rejects_mismatched_sizes() {
        let pngs = vec![
            solid_png(4, 4, [0, 0, 0, 255]),
            solid_png(4, 4, [0, 0, 0, 255]),
            solid_png(4, 4, [0, 0, 0, 255]),
            solid_png(8, 4, [0, 0, 0, 255]),
        ];
        assert!(tile_images(&pngs).is_err());
    }
}
