//! Wire models for the AUTOMATIC1111-compatible HTTP API.
//!
//! The txt2img endpoint nests the seed bookkeeping inside an `info` field
//! that is itself a JSON document serialized to a string; the raw structs
//! here mirror that shape, and `parse_txt2img_body` flattens it into the
//! typed response the queue consumes.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TextToImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: i64,
    pub height: i64,
    pub restore_faces: bool,
    pub enable_hr: bool,
    pub hr_resize_x: i64,
    pub hr_resize_y: i64,
    pub denoising_strength: f64,
    pub batch_size: i64,
    pub seed: i64,
    pub subseed: i64,
    pub subseed_strength: f64,
    pub sampler_name: String,
    pub cfg_scale: f64,
    pub steps: i64,
    pub n_iter: i64,
}

/// Decoded txt2img result: PNG buffers plus the seeds the backend resolved.
#[derive(Debug, Clone)]
pub struct TextToImageResponse {
    pub images: Vec<Vec<u8>>,
    pub seeds: Vec<i64>,
    pub subseeds: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ProgressResponse {
    pub progress: f64,
    pub eta_relative: f64,
}

/// Upscale call parameters. The backend regenerates the source image from
/// `txt2img` (iteration count forced to 1) before the dedicated upscale pass.
#[derive(Debug, Clone)]
pub struct UpscaleRequest {
    pub resize_mode: i64,
    pub upscaling_resize: i64,
    pub upscaler: String,
    pub txt2img: TextToImageRequest,
}

#[derive(Debug, Clone)]
pub struct UpscaleResponse {
    pub image: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct RawTextToImageResponse {
    images: Vec<String>,
    info: String,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    all_seeds: Vec<i64>,
    all_subseeds: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RawUpscaleRequest {
    pub resize_mode: i64,
    pub upscaling_resize: i64,
    pub upscaler1: String,
    pub image: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawUpscaleResponse {
    pub image: String,
}

pub(crate) fn parse_txt2img_body(body: &str) -> Result<TextToImageResponse> {
    let raw: RawTextToImageResponse =
        serde_json::from_str(body).context("invalid txt2img response JSON")?;
    let info: RawInfo =
        serde_json::from_str(&raw.info).context("invalid txt2img info payload")?;

    let images = raw
        .images
        .iter()
        .map(|b64| {
            BASE64
                .decode(b64)
                .context("invalid base64 image in txt2img response")
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(TextToImageResponse {
        images,
        seeds: info.all_seeds,
        subseeds: info.all_subseeds,
    })
}

pub(crate) fn encode_image(png: &[u8]) -> String {
    BASE64.encode(png)
}

pub(crate) fn decode_image(b64: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(b64)
        .context("invalid base64 image in upscale response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_txt2img_flattens_info() {
        let body = serde_json::json!({
            "images": [BASE64.encode([1u8, 2, 3]), BASE64.encode([4u8, 5])],
            "info": "{\"seed\": 7, \"all_seeds\": [7, 8], \"all_subseeds\": [70, 80]}",
        })
        .to_string();

        let resp = parse_txt2img_body(&body).unwrap();
        assert_eq!(resp.images, vec![vec![1, 2, 3], vec![4, 5]]);
        assert_eq!(resp.seeds, vec![7, 8]);
        assert_eq!(resp.subseeds, vec![70, 80]);
    }

    #[test]
    fn parse_txt2img_rejects_bad_info() {
        let body = serde_json::json!({
            "images": [],
            "info": "not json",
        })
        .to_string();
        assert!(parse_txt2img_body(&body).is_err());
    }

    #[test]
    fn parse_txt2img_rejects_bad_base64() {
        let body = serde_json::json!({
            "images": ["@@not-base64@@"],
            "info": "{\"all_seeds\": [], \"all_subseeds\": []}",
        })
        .to_string();
        assert!(parse_txt2img_body(&body).is_err());
    }

    #[test]
    fn request_serializes_snake_case_fields() {
        let req = TextToImageRequest {
            prompt: "a cat".into(),
            negative_prompt: "dog".into(),
            width: 768,
            height: 768,
            restore_faces: true,
            enable_hr: false,
            hr_resize_x: 0,
            hr_resize_y: 0,
            denoising_strength: 0.7,
            batch_size: 1,
            seed: -1,
            subseed: -1,
            subseed_strength: 0.0,
            sampler_name: "Euler a".into(),
            cfg_scale: 9.0,
            steps: 20,
            n_iter: 4,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["negative_prompt"], "dog");
        assert_eq!(v["hr_resize_x"], 0);
        assert_eq!(v["n_iter"], 4);
        assert_eq!(v["sampler_name"], "Euler a");
    }
}
