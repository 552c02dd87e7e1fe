//! Media attached to relayed messages.
//!
//! A [`SyncImage`] is fetched lazily the first time a destination asks for
//! it and then rendered per `(pixel_limit, video_as_gif)` pair, each result
//! memoized on the image. Processing runs on the [`WorkerPool`]:
//!
//! ```text
//! fetch ─► still? ── webp ─► png ── larger than limit ─► resize
//!        └ movie? ── over size cap ─► unchanged + photo tag
//!                 ├─ gif ─► resize frames
//!                 └─ video ─► MovieBackend::to_gif (10 fps) when requested
//! ```

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::imageops::FilterType;
use image::{AnimationDecoder, Frame, ImageFormat};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{ImageError, ImageResult};
use crate::worker::WorkerPool;

/// Frame rate used when converting videos to GIF.
pub const MOVIE_GIF_FPS: u32 = 10;

/// Default byte cap above which movies are forwarded unchanged.
pub const DEFAULT_MOVIE_SIZE_CAP: usize = 10 * 1024 * 1024;

const MOVIE_EXTENSIONS: &[&str] = &["gif", "mp4", "avi", "mov", "webm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Photo,
    Sticker,
    Gif,
    Video,
}

impl ImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Sticker => "sticker",
            Self::Gif => "gif",
            Self::Video => "video",
        }
    }
}

/// What to download for a URL-backed image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
}

/// Raw download result.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

/// Downloads remote media.
#[async_trait]
pub trait MediaFetcher: Send + Sync + 'static {
    async fn fetch(&self, request: &MediaRequest) -> ImageResult<FetchedMedia>;
}

/// Converts video containers into animated GIFs.
#[async_trait]
pub trait MovieBackend: Send + Sync + 'static {
    async fn to_gif(
        &self,
        bytes: Arc<Vec<u8>>,
        extension: &str,
        fps: u32,
        pixel_limit: u32,
    ) -> ImageResult<Vec<u8>>;
}

/// Fetcher backed by `reqwest`.
#[cfg(feature = "http-fetch")]
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[cfg(feature = "http-fetch")]
impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http-fetch")]
#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn fetch(&self, request: &MediaRequest) -> ImageResult<FetchedMedia> {
        use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, COOKIE};

        let fail = |reason: String| ImageError::Fetch {
            url: request.url.clone(),
            reason,
        };
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.cookies.is_empty() {
            let cookie = request
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(COOKIE, cookie);
        }
        let response = builder
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| fail(e.to_string()))?;
        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(CONTENT_TYPE);
        let content_disposition = header(CONTENT_DISPOSITION);
        let bytes = response.bytes().await.map_err(|e| fail(e.to_string()))?;
        Ok(FetchedMedia {
            bytes: bytes.to_vec(),
            content_type,
            content_disposition,
        })
    }
}

/// Processing backends shared by all images.
#[derive(Clone)]
pub struct ImagePipeline {
    fetcher: Option<Arc<dyn MediaFetcher>>,
    movies: Option<Arc<dyn MovieBackend>>,
    pool: WorkerPool,
    movie_size_cap: usize,
}

impl std::fmt::Debug for ImagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePipeline")
            .field("has_fetcher", &self.fetcher.is_some())
            .field("has_movie_backend", &self.movies.is_some())
            .field("movie_size_cap", &self.movie_size_cap)
            .finish()
    }
}

impl ImagePipeline {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            fetcher: None,
            movies: None,
            pool,
            movie_size_cap: DEFAULT_MOVIE_SIZE_CAP,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn MediaFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_movie_backend(mut self, backend: Arc<dyn MovieBackend>) -> Self {
        self.movies = Some(backend);
        self
    }

    pub fn with_movie_size_cap(mut self, cap: usize) -> Self {
        self.movie_size_cap = cap;
        self
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    async fn blocking<F, R>(&self, job: F) -> ImageResult<R>
    where
        F: FnOnce() -> ImageResult<R> + Send + 'static,
        R: Send + 'static,
    {
        self.pool
            .run(job)
            .await
            .map_err(|e| ImageError::Worker(e.to_string()))?
    }
}

/// One rendering of a [`SyncImage`] for a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Arc<Vec<u8>>,
    pub filename: String,
    /// The destination should label the upload as a photo link instead of
    /// embedding it (oversized movies).
    pub add_photo_tag: bool,
}

#[derive(Debug)]
enum ImageSource {
    Bytes(Arc<Vec<u8>>),
    Url(MediaRequest),
}

#[derive(Debug)]
struct RawMedia {
    bytes: Arc<Vec<u8>>,
    filename: String,
}

/// A lazily fetched image or movie.
#[derive(Debug)]
pub struct SyncImage {
    pub kind: ImageType,
    /// Declared dimensions, when the source platform reported them.
    pub size: Option<(u32, u32)>,
    source: ImageSource,
    filename: Option<String>,
    raw: OnceCell<RawMedia>,
    rendered: Mutex<HashMap<(u32, bool), ImageData>>,
}

impl SyncImage {
    pub fn from_bytes(kind: ImageType, bytes: Vec<u8>, filename: impl Into<String>) -> Self {
        Self::build(kind, ImageSource::Bytes(Arc::new(bytes)), Some(filename.into()))
    }

    pub fn from_url(kind: ImageType, request: MediaRequest) -> Self {
        Self::build(kind, ImageSource::Url(request), None)
    }

    fn build(kind: ImageType, source: ImageSource, filename: Option<String>) -> Self {
        Self {
            kind,
            size: None,
            source,
            filename,
            raw: OnceCell::new(),
            rendered: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = Some((width, height));
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Source URL for URL-backed images; used as the upload cache key.
    pub fn url(&self) -> Option<&str> {
        match &self.source {
            ImageSource::Url(req) => Some(&req.url),
            ImageSource::Bytes(_) => None,
        }
    }

    async fn raw(&self, pipeline: &ImagePipeline) -> ImageResult<&RawMedia> {
        self.raw
            .get_or_try_init(|| async {
                match &self.source {
                    ImageSource::Bytes(bytes) => Ok(RawMedia {
                        bytes: Arc::clone(bytes),
                        filename: self.filename.clone().unwrap_or_else(|| {
                            with_extension("image", guess_extension(bytes).unwrap_or("png"))
                        }),
                    }),
                    ImageSource::Url(request) => {
                        let fetcher = pipeline.fetcher.as_ref().ok_or_else(|| {
                            ImageError::Unsupported("no media fetcher configured".into())
                        })?;
                        let fetched = fetcher.fetch(request).await?;
                        let filename = self
                            .filename
                            .clone()
                            .unwrap_or_else(|| derive_filename(request, &fetched));
                        debug!(url = %request.url, filename = %filename, size = fetched.bytes.len(), "Fetched media");
                        Ok(RawMedia {
                            bytes: Arc::new(fetched.bytes),
                            filename,
                        })
                    }
                }
            })
            .await
    }

    /// Returns the rendering for `pixel_limit` (0 = unlimited).
    pub async fn get_data(
        &self,
        pipeline: &ImagePipeline,
        pixel_limit: u32,
        video_as_gif: bool,
    ) -> ImageResult<ImageData> {
        let key = (pixel_limit, video_as_gif);
        if let Some(done) = self.rendered.lock().get(&key) {
            return Ok(done.clone());
        }
        let raw = self.raw(pipeline).await?;
        let ext = extension(&raw.filename);
        let data = if MOVIE_EXTENSIONS.contains(&ext.as_str()) {
            process_movie(pipeline, raw, &ext, pixel_limit, video_as_gif).await?
        } else {
            process_still(pipeline, raw, &ext, pixel_limit).await?
        };
        self.rendered.lock().insert(key, data.clone());
        Ok(data)
    }
}

// =============================================================================
// Processing
// =============================================================================

/// New dimensions that fit `(width, height)` within `limit`, or `None` when
/// no resize is needed.
pub fn fit_within((width, height): (u32, u32), limit: u32) -> Option<(u32, u32)> {
    let longest = width.max(height);
    if limit == 0 || longest <= limit {
        return None;
    }
    let scale = f64::from(limit) / f64::from(longest);
    let scaled = |v: u32| ((f64::from(v) * scale).round() as u32).max(1);
    Some((scaled(width), scaled(height)))
}

async fn process_still(
    pipeline: &ImagePipeline,
    raw: &RawMedia,
    ext: &str,
    pixel_limit: u32,
) -> ImageResult<ImageData> {
    let mut bytes = Arc::clone(&raw.bytes);
    let mut filename = raw.filename.clone();

    if ext == "webp" {
        let source = Arc::clone(&bytes);
        bytes = Arc::new(pipeline.blocking(move || reencode(&source, ImageFormat::Png)).await?);
        filename = with_extension(stem(&filename), "png");
    }

    if pixel_limit > 0 {
        let source = Arc::clone(&bytes);
        if let Some(resized) = pipeline
            .blocking(move || resize_still(&source, pixel_limit))
            .await?
        {
            bytes = Arc::new(resized);
        }
    }

    Ok(ImageData {
        bytes,
        filename,
        add_photo_tag: false,
    })
}

async fn process_movie(
    pipeline: &ImagePipeline,
    raw: &RawMedia,
    ext: &str,
    pixel_limit: u32,
    video_as_gif: bool,
) -> ImageResult<ImageData> {
    let unchanged = |add_photo_tag| ImageData {
        bytes: Arc::clone(&raw.bytes),
        filename: raw.filename.clone(),
        add_photo_tag,
    };
    if raw.bytes.len() > pipeline.movie_size_cap {
        debug!(filename = %raw.filename, size = raw.bytes.len(), "Movie exceeds size cap");
        return Ok(unchanged(true));
    }
    if ext == "gif" {
        if pixel_limit == 0 {
            return Ok(unchanged(false));
        }
        let source = Arc::clone(&raw.bytes);
        return Ok(match pipeline.blocking(move || resize_gif(&source, pixel_limit)).await? {
            Some(resized) => ImageData {
                bytes: Arc::new(resized),
                filename: raw.filename.clone(),
                add_photo_tag: false,
            },
            None => unchanged(false),
        });
    }
    if !video_as_gif {
        return Ok(unchanged(false));
    }
    let Some(backend) = &pipeline.movies else {
        warn!(filename = %raw.filename, "No movie backend, forwarding video unchanged");
        return Ok(unchanged(false));
    };
    let gif = backend
        .to_gif(Arc::clone(&raw.bytes), ext, MOVIE_GIF_FPS, pixel_limit)
        .await?;
    Ok(ImageData {
        bytes: Arc::new(gif),
        filename: with_extension(stem(&raw.filename), "gif"),
        add_photo_tag: false,
    })
}

fn reencode(bytes: &[u8], format: ImageFormat) -> ImageResult<Vec<u8>> {
    let img = image::load_from_memory(bytes)?;
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format)?;
    Ok(out.into_inner())
}

fn resize_still(bytes: &[u8], limit: u32) -> ImageResult<Option<Vec<u8>>> {
    let format = image::guess_format(bytes)?;
    let img = image::load_from_memory_with_format(bytes, format)?;
    let Some((w, h)) = fit_within((img.width(), img.height()), limit) else {
        return Ok(None);
    };
    let resized = img.resize_exact(w, h, FilterType::Lanczos3);
    let format = match format {
        ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Gif => format,
        _ => ImageFormat::Png,
    };
    let mut out = Cursor::new(Vec::new());
    resized.write_to(&mut out, format)?;
    Ok(Some(out.into_inner()))
}

fn resize_gif(bytes: &[u8], limit: u32) -> ImageResult<Option<Vec<u8>>> {
    let decoder = GifDecoder::new(Cursor::new(bytes))?;
    let frames = decoder.into_frames().collect_frames()?;
    let Some(first) = frames.first() else {
        return Ok(None);
    };
    let Some((w, h)) = fit_within(first.buffer().dimensions(), limit) else {
        return Ok(None);
    };
    let resized: Vec<Frame> = frames
        .iter()
        .map(|frame| {
            let buffer = image::imageops::resize(frame.buffer(), w, h, FilterType::Triangle);
            Frame::from_parts(buffer, 0, 0, frame.delay())
        })
        .collect();
    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut out);
        encoder.set_repeat(Repeat::Infinite)?;
        encoder.encode_frames(resized)?;
    }
    Ok(Some(out))
}

// ─── Filenames ──────────────────────────────────────────────────────────────

fn extension(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

fn stem(filename: &str) -> &str {
    filename.rsplit_once('.').map_or(filename, |(stem, _)| stem)
}

fn with_extension(stem: &str, ext: &str) -> String {
    format!("{stem}.{ext}")
}

fn guess_extension(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Png => Some("png"),
        ImageFormat::Jpeg => Some("jpg"),
        ImageFormat::Gif => Some("gif"),
        ImageFormat::WebP => Some("webp"),
        _ => None,
    }
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or_default().trim();
    Some(match essence {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "video/x-msvideo" => "avi",
        "video/quicktime" => "mov",
        "video/webm" => "webm",
        _ => return None,
    })
}

fn disposition_filename(header: &str) -> Option<String> {
    header.split(';').find_map(|part| {
        let value = part.trim().strip_prefix("filename=")?;
        let value = value.trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// The name comes from Content-Disposition or the URL; the extension from
/// what was actually served: Content-Type, then the bytes, then the name.
fn derive_filename(request: &MediaRequest, fetched: &FetchedMedia) -> String {
    let name = fetched
        .content_disposition
        .as_deref()
        .and_then(disposition_filename)
        .or_else(|| {
            request
                .url
                .split(['?', '#'])
                .next()
                .and_then(|path| path.rsplit('/').next())
                .filter(|name| !name.is_empty())
                .map(|name| {
                    urlencoding::decode(name)
                        .map(|n| n.into_owned())
                        .unwrap_or_else(|_| name.to_string())
                })
        })
        .unwrap_or_else(|| "image".to_string());
    let served = fetched
        .content_type
        .as_deref()
        .and_then(extension_for_mime)
        .or_else(|| guess_extension(&fetched.bytes));
    match served {
        Some(ext) => with_extension(stem(&name), ext),
        None if !extension(&name).is_empty() => name,
        None => with_extension(&name, "bin"),
    }
}
