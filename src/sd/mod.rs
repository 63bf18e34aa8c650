use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::fmt;
use tracing::{debug, warn};

pub mod model;

pub use model::{
    ProgressResponse, TextToImageRequest, TextToImageResponse, UpscaleRequest, UpscaleResponse,
};

use model::{parse_txt2img_body, RawUpscaleRequest, RawUpscaleResponse};

/// Typed client for the remote image-synthesis service.
///
/// The queue only sees this trait; tests script it with canned responses.
#[async_trait]
pub trait SdApi: Send + Sync {
    async fn text_to_image(&self, req: &TextToImageRequest) -> Result<TextToImageResponse>;

    async fn current_progress(&self) -> Result<ProgressResponse>;

    async fn upscale_image(&self, req: &UpscaleRequest) -> Result<UpscaleResponse>;
}

#[derive(Clone)]
pub struct SdClient {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for SdClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SdClient {
    pub fn new(host: &str) -> Result<Self> {
        let host = host.trim_end_matches('/');
        let base_url = Url::parse(&format!("{}/", host))
            .with_context(|| format!("invalid SD host: {}", host))?;
        let http = Client::builder()
            .user_agent("tg-imaginebot/0.1")
            .no_proxy()
            .build()
            .expect("reqwest client");
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("invalid SD base URL")
    }

    async fn post_json<B: serde::Serialize>(&self, path: &str, body: &B) -> Result<String> {
        let url = self.endpoint(path)?;
        let res = self
            .http
            .post(url.clone())
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to reach SD API at {}", url))?;

        let status = res.status();
        let text = res.text().await.context("failed to read SD response")?;
        if !status.is_success() {
            warn!(%url, %status, "SD API error");
            return Err(anyhow!("SD API error {}: {}", status, text));
        }
        Ok(text)
    }
}

#[async_trait]
impl SdApi for SdClient {
    async fn text_to_image(&self, req: &TextToImageRequest) -> Result<TextToImageResponse> {
        debug!(
            width = req.width,
            height = req.height,
            n_iter = req.n_iter,
            enable_hr = req.enable_hr,
            "submitting txt2img"
        );
        let body = self.post_json("sdapi/v1/txt2img", req).await?;
        parse_txt2img_body(&body)
    }

    async fn current_progress(&self) -> Result<ProgressResponse> {
        let url = self.endpoint("sdapi/v1/progress")?;
        let res = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("failed to reach SD API at {}", url))?;
        if !res.status().is_success() {
            return Err(anyhow!("SD API error {}", res.status()));
        }
        res.json::<ProgressResponse>()
            .await
            .context("invalid progress response JSON")
    }

    async fn upscale_image(&self, req: &UpscaleRequest) -> Result<UpscaleResponse> {
        // Deterministically regenerate the source image first; the upscale
        // endpoint operates on image data, not parameters.
        let mut regen_req = req.txt2img.clone();
        regen_req.n_iter = 1;
        let regenerated = self.text_to_image(&regen_req).await?;
        let source = regenerated
            .images
            .first()
            .ok_or_else(|| anyhow!("txt2img returned no image to upscale"))?;

        let raw = RawUpscaleRequest {
            resize_mode: req.resize_mode,
            upscaling_resize: req.upscaling_resize,
            upscaler1: req.upscaler.clone(),
            image: model::encode_image(source),
        };
        let body = self.post_json("sdapi/v1/extra-single-image", &raw).await?;
        let parsed: RawUpscaleResponse =
            serde_json::from_str(&body).context("invalid upscale response JSON")?;
        Ok(UpscaleResponse {
            image: model::decode_image(&parsed.image)?,
        })
    }
}
