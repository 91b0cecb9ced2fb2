use image::{
    imageops::{self, FilterType},
    Rgb, RgbImage,
};

use crate::{FeatureVector, ModelParameters, ResizeMode};

pub fn extract(img: &RgbImage, params: &ModelParameters) -> FeatureVector {
    let fitted = fit(
        img,
        params.image_input_width,
        params.image_input_height,
        params.image_resize_mode,
    );
    let gray = params.image_channel_count == 1;
    FeatureVector(fitted.pixels().map(|p| pack(p, gray)).collect())
}

/// Brings `img` to exactly `w`x`h` using the model's resize mode.
pub fn fit(img: &RgbImage, w: u32, h: u32, mode: ResizeMode) -> RgbImage {
    let (iw, ih) = img.dimensions();
    if (iw, ih) == (w, h) {
        return img.clone();
    }

    match mode {
        ResizeMode::Squash => imageops::resize(img, w, h, FilterType::Triangle),
        ResizeMode::FitLongest => {
            let (nw, nh) = scaled(iw, ih, w, h, false);
            let resized = imageops::resize(img, nw, nh, FilterType::Triangle);

            let mut canvas = RgbImage::new(w, h);
            imageops::overlay(&mut canvas, &resized, ((w - nw) / 2) as i64, ((h - nh) / 2) as i64);
            canvas
        }
        // unknown modes fall back to the runner default
        ResizeMode::FitShortest | ResizeMode::Unknown => {
            let (nw, nh) = scaled(iw, ih, w, h, true);
            let resized = imageops::resize(img, nw, nh, FilterType::Triangle);
            imageops::crop_imm(&resized, (nw - w) / 2, (nh - h) / 2, w, h).to_image()
        }
    }
}

/// Aspect-preserving size where one side matches the target exactly: the
/// other side overflows (`cover`) or underflows it.
fn scaled(iw: u32, ih: u32, w: u32, h: u32, cover: bool) -> (u32, u32) {
    let (iw, ih, w64, h64) = (iw as u64, ih as u64, w as u64, h as u64);
    let width_bound = (w64 * ih >= h64 * iw) == cover;
    if width_bound {
        let nh = if cover { (ih * w64).div_ceil(iw) } else { (ih * w64 + iw / 2) / iw };
        (w, (nh as u32).clamp(1, if cover { u32::MAX } else { h }))
    } else {
        let nw = if cover { (iw * h64).div_ceil(ih) } else { (iw * h64 + ih / 2) / ih };
        ((nw as u32).clamp(1, if cover { u32::MAX } else { w }), h)
    }
}

fn pack(p: &Rgb<u8>, gray: bool) -> u32 {
    let [r, g, b] = p.0;
    if gray {
        let l = luma(r, g, b);
        (l << 16) | (l << 8) | l
    } else {
        ((r as u32) << 16) | ((g as u32) << 8) | b as u32
    }
}

fn luma(r: u8, g: u8, b: u8) -> u32 {
    (299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(w: u32, h: u32, channels: u32, mode: ResizeMode) -> ModelParameters {
        ModelParameters {
            image_input_width: w,
            image_input_height: h,
            image_channel_count: channels,
            image_resize_mode: mode,
            labels: vec!["pill".into()],
            model_type: None,
            threshold: None,
        }
    }

    #[test]
    fn rgb_pixels_pack_high_to_low() {
        let img = RgbImage::from_pixel(2, 2, Rgb([1, 2, 3]));
        let f = extract(&img, &params(2, 2, 3, ResizeMode::FitShortest));
        assert_eq!(f.0, vec![0x010203; 4]);
    }

    #[test]
    fn gray_pixels_repeat_luma() {
        let img = RgbImage::from_pixel(2, 1, Rgb([255, 255, 255]));
        let f = extract(&img, &params(2, 1, 1, ResizeMode::FitShortest));
        assert_eq!(f.0, vec![0xFFFFFF, 0xFFFFFF]);

        let black = RgbImage::new(1, 1);
        assert_eq!(extract(&black, &params(1, 1, 1, ResizeMode::Squash)).0, vec![0]);
    }

    #[test]
    fn fit_shortest_crops_the_center() {
        // left third red, middle third green, right third blue
        let img = RgbImage::from_fn(300, 100, |x, _| match x {
            0..=99 => Rgb([255, 0, 0]),
            100..=199 => Rgb([0, 255, 0]),
            _ => Rgb([0, 0, 255]),
        });
        let out = fit(&img, 96, 96, ResizeMode::FitShortest);
        assert_eq!(out.dimensions(), (96, 96));
        assert_eq!(out.get_pixel(48, 48).0, [0, 255, 0]);
        assert_eq!(out.get_pixel(2, 0).0, [0, 255, 0]);
        assert_eq!(out.get_pixel(93, 95).0, [0, 255, 0]);
    }

    #[test]
    fn fit_longest_letterboxes_on_black() {
        let img = RgbImage::from_pixel(200, 100, Rgb([255, 255, 255]));
        let out = fit(&img, 96, 96, ResizeMode::FitLongest);
        assert_eq!(out.dimensions(), (96, 96));
        assert_eq!(out.get_pixel(48, 0).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(48, 95).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(48, 48).0, [255, 255, 255]);
    }

    #[test]
    fn squash_ignores_aspect() {
        let img = RgbImage::from_pixel(640, 120, Rgb([9, 9, 9]));
        let f = extract(&img, &params(96, 96, 3, ResizeMode::Squash));
        assert_eq!(f.0.len(), 96 * 96);
        assert!(f.0.iter().all(|v| *v == 0x090909));
    }

    #[test]
    fn scaled_sizes_are_exact_on_the_bound_side() {
        assert_eq!(scaled(300, 100, 96, 96, true), (288, 96));
        assert_eq!(scaled(100, 300, 96, 96, true), (96, 288));
        assert_eq!(scaled(200, 100, 96, 96, false), (96, 48));
        assert_eq!(scaled(333, 1000, 96, 96, false), (32, 96));
    }

    #[test]
    fn feature_length_matches_grid() {
        let img = RgbImage::new(320, 240);
        let f = extract(&img, &params(160, 120, 3, ResizeMode::FitShortest));
        assert_eq!(f.0.len(), 160 * 120);
    }
}
