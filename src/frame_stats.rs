// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use image::GrayImage;
use imageproc::rect::Rect;

/// Square region of `size` pixels on a side centered in `image`, shrunk to
/// fit small images. None if the image is empty.
pub fn central_region(image: &GrayImage, size: u32) -> Option<Rect> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return None;
    }
    let w = size.min(width).max(1);
    let h = size.min(height).max(1);
    Some(Rect::at(((width - w) / 2) as i32, ((height - h) / 2) as i32).of_size(w, h))
}

/// Mean pixel value within `region`. Used to spot saturated or black frames
/// while sweeping exposures.
pub fn region_mean(image: &GrayImage, region: &Rect) -> f64 {
    let mut sum = 0u64;
    let mut count = 0u64;
    for y in region.top()..region.bottom() + 1 {
        for x in region.left()..region.right() + 1 {
            if x < 0 || y < 0 || x as u32 >= image.width() || y as u32 >= image.height() {
                continue;
            }
            sum += image.get_pixel(x as u32, y as u32).0[0] as u64;
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    sum as f64 / count as f64
}

pub fn central_mean(image: &GrayImage, size: u32) -> Option<f64> {
    central_region(image, size).map(|roi| region_mean(image, &roi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn central_region_is_centered_and_clipped() {
        let image = GrayImage::new(100, 60);
        let roi = central_region(&image, 30).unwrap();
        assert_eq!((roi.left(), roi.top(), roi.width(), roi.height()), (35, 15, 30, 30));

        let small = GrayImage::new(8, 4);
        let roi = central_region(&small, 30).unwrap();
        assert_eq!((roi.left(), roi.top(), roi.width(), roi.height()), (0, 0, 8, 4));
    }

    #[test]
    fn mean_only_counts_the_region() {
        let mut image = GrayImage::from_pixel(10, 10, Luma([0]));
        for y in 4..6 {
            for x in 4..6 {
                image.put_pixel(x, y, Luma([200]));
            }
        }
        assert_eq!(central_mean(&image, 2), Some(200.0));
        assert_eq!(central_mean(&image, 10), Some(8.0));
        assert_eq!(central_mean(&GrayImage::new(0, 0), 10), None);
    }
}
