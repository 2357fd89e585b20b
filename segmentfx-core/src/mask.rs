//! Pixel helpers for single-channel masks

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};

pub const FOREGROUND: u8 = 255;

/// Maps every non-zero pixel to 255.
pub fn binarize(mask: &GrayImage) -> GrayImage {
    let mut out = mask.clone();
    for pixel in out.pixels_mut() {
        if pixel.0[0] > 0 {
            pixel.0[0] = FOREGROUND;
        }
    }
    out
}

/// Nearest-neighbour resize followed by re-binarisation.
pub fn resize_binary(mask: &GrayImage, size: (u32, u32)) -> GrayImage {
    if mask.dimensions() == size {
        return binarize(mask);
    }
    let resized = imageops::resize(mask, size.0, size.1, FilterType::Nearest);
    binarize(&resized)
}

/// Pixel-wise maximum over `masks`; an all-zero mask when there are none.
pub fn combine_max<'a>(
    size: (u32, u32),
    masks: impl IntoIterator<Item = &'a GrayImage>,
) -> GrayImage {
    let mut combined = GrayImage::new(size.0, size.1);
    for mask in masks {
        for (x, y, pixel) in mask.enumerate_pixels() {
            if x >= size.0 || y >= size.1 {
                continue;
            }
            let current = combined.get_pixel_mut(x, y);
            if pixel.0[0] > current.0[0] {
                *current = *pixel;
            }
        }
    }
    combined
}

/// Keeps foreground only where `limit` is also foreground.
pub fn intersect(mask: &GrayImage, limit: &GrayImage) -> GrayImage {
    let (width, height) = mask.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let inside = x < limit.width() && y < limit.height() && limit.get_pixel(x, y).0[0] > 0;
        if inside && mask.get_pixel(x, y).0[0] > 0 {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}

pub fn foreground_area(mask: &GrayImage) -> u32 {
    mask.pixels().filter(|p| p.0[0] > 0).count() as u32
}
