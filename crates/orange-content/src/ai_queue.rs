//! AI dispatch queue
//!
//! Images waiting for classification share one queue per page, drained by
//! at most `concurrency` workers. Each image is sent to the background
//! context on its own and the verdict is applied to that image, whatever
//! order responses come back in. Any failure leaves the image visible.

use crate::actions::FilterActions;
use crate::dom::{NodeId, SharedDocument};
use crate::marks;
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, RgbaImage};
use orange_config::Sensitivity;
use orange_runtime::{
    encode_data_url, ImagePayload, MessageSender, MessageType, Request, Response, RouterError, Target,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Simultaneous classification requests
    pub concurrency: usize,
    /// Images narrower or shorter than this are not worth classifying
    pub min_image_side: f32,
    /// Unblocked results above this confidence are blurred
    pub grey_zone: f32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            min_image_side: 50.0,
            grey_zone: 0.65,
        }
    }
}

/// Network fallback for images whose pixels cannot be read back
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Mime type and bytes, or `None` if the image is unavailable.
    async fn fetch(&self, url: &str) -> Option<(String, Vec<u8>)>;
}

pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Option<(String, Vec<u8>)> {
        let response = match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!("Image fetch failed: {} ({})", url, response.status());
                return None;
            }
            Err(e) => {
                warn!("Image fetch failed: {} ({})", url, e);
                return None;
            }
        };
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        match response.bytes().await {
            Ok(bytes) => Some((mime, bytes.to_vec())),
            Err(e) => {
                warn!("Image fetch failed: {} ({})", url, e);
                None
            }
        }
    }
}

/// Worker tasks started by one `enqueue` call
#[derive(Debug, Default)]
pub struct DispatchHandle {
    workers: Vec<JoinHandle<()>>,
}

impl DispatchHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for these workers to drain the queue.
    pub async fn wait(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("Dispatch worker ended abnormally: {}", e);
            }
        }
    }
}

struct QueueState {
    items: VecDeque<(NodeId, Sensitivity)>,
    workers: usize,
}

struct DispatcherInner {
    doc: SharedDocument,
    sender: Arc<dyn MessageSender>,
    fetcher: Option<Arc<dyn ImageFetcher>>,
    actions: FilterActions,
    config: DispatchConfig,
    queue: Mutex<QueueState>,
    stopped: AtomicBool,
}

/// Clears the scanning mark however the request ends
struct ScanningGuard<'a> {
    doc: &'a SharedDocument,
    img: NodeId,
}

impl Drop for ScanningGuard<'_> {
    fn drop(&mut self) {
        marks::clear_scanning(&mut self.doc.lock(), self.img);
    }
}

/// Gives the worker's slot back however the worker ends
struct WorkerSlot<'a> {
    inner: &'a DispatcherInner,
}

impl Drop for WorkerSlot<'_> {
    fn drop(&mut self) {
        let mut queue = self.inner.queue.lock();
        queue.workers = queue.workers.saturating_sub(1);
    }
}

/// What the worker read off the image before releasing the document
struct Snapshot {
    source: String,
    pixels: Option<RgbaImage>,
}

#[derive(Clone)]
pub struct AiDispatcher {
    inner: Arc<DispatcherInner>,
}

impl AiDispatcher {
    pub fn new(
        doc: SharedDocument,
        sender: Arc<dyn MessageSender>,
        fetcher: Option<Arc<dyn ImageFetcher>>,
        actions: FilterActions,
        config: DispatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                doc,
                sender,
                fetcher,
                actions,
                config,
                queue: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    workers: 0,
                }),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Dispatching stopped because the extension context went away.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Images waiting for a worker.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().items.len()
    }

    /// Queue images for classification and start workers up to the limit.
    /// Must be called inside a tokio runtime.
    pub fn enqueue(&self, images: Vec<NodeId>, sensitivity: Sensitivity) -> DispatchHandle {
        if self.is_stopped() {
            return DispatchHandle::default();
        }
        let mut queue = self.inner.queue.lock();
        for img in images {
            if !queue.items.iter().any(|(queued, _)| *queued == img) {
                queue.items.push_back((img, sensitivity));
            }
        }

        let idle_slots = self.inner.config.concurrency.saturating_sub(queue.workers);
        let spawn = idle_slots.min(queue.items.len());
        queue.workers += spawn;
        drop(queue);

        let workers = (0..spawn)
            .map(|_| {
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.run_worker().await })
            })
            .collect();
        DispatchHandle { workers }
    }

    fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            info!("Context invalidated. Please refresh.");
            self.inner.queue.lock().items.clear();
        }
    }

    async fn run_worker(&self) {
        let _slot = WorkerSlot { inner: &self.inner };
        loop {
            let next = {
                let mut queue = self.inner.queue.lock();
                match queue.items.pop_front() {
                    Some(next) if !self.is_stopped() => next,
                    _ => return,
                }
            };
            self.process(next.0, next.1).await;
        }
    }

    async fn process(&self, img: NodeId, sensitivity: Sensitivity) {
        let Some(snapshot) = self.claim(img) else {
            return;
        };
        let _scanning = ScanningGuard { doc: &self.inner.doc, img };

        let payload = self.build_payload(snapshot, sensitivity).await;
        let request = Request::new(Target::Background, MessageType::CheckImage, payload.to_value());

        match self.inner.sender.send(request).await {
            Ok(response) => self.apply(img, &response),
            Err(RouterError::ContextInvalidated) => self.stop(),
        }
    }

    /// Mark the image as scanning and snapshot what the payload needs.
    fn claim(&self, img: NodeId) -> Option<Snapshot> {
        let mut doc = self.inner.doc.lock();
        if marks::is_scanning(&doc, img) || marks::is_settled(&doc, img) {
            return None;
        }
        let (width, height) = doc.rendered_size(img);
        let min = self.inner.config.min_image_side;
        if width < min || height < min {
            return None;
        }
        let source = doc.image_source(img)?.to_string();

        let pixels = doc
            .image(img)
            .filter(|i| i.origin_clean && i.natural_width > 0)
            .and_then(|i| i.pixels.clone());
        marks::mark_scanning(&mut doc, img);
        Some(Snapshot { source, pixels })
    }

    async fn build_payload(&self, snapshot: Snapshot, sensitivity: Sensitivity) -> ImagePayload {
        let payload = ImagePayload::new(Some(snapshot.source.clone()), sensitivity);

        if snapshot.source.starts_with("data:") {
            return payload.with_base64(snapshot.source);
        }
        if let Some(data_url) = snapshot.pixels.and_then(encode_pixels) {
            return payload.with_base64(data_url);
        }
        if let Some(fetcher) = &self.inner.fetcher {
            if let Some((mime, bytes)) = fetcher.fetch(&snapshot.source).await {
                return payload.with_base64(encode_data_url(&mime, &bytes));
            }
        }
        debug!("No image data for {}, sending URL only", snapshot.source);
        payload
    }

    fn apply(&self, img: NodeId, response: &Response) {
        let Some(result) = response.classification() else {
            debug!(
                "Classification failed: {}",
                response.error.as_deref().unwrap_or("unknown error")
            );
            return;
        };

        let pct = result.confidence_pct();
        let mut doc = self.inner.doc.lock();
        if result.is_blocked {
            self.inner.actions.hide(&mut doc, img, &format!("AI detected ({}%)", pct));
        } else if result.confidence > self.inner.config.grey_zone {
            self.inner
                .actions
                .blur(&mut doc, img, &format!("AI low-confidence match ({}%)", pct));
        }
    }
}

/// Re-encode decoded pixels as a PNG data URL.
fn encode_pixels(pixels: RgbaImage) -> Option<String> {
    let mut out = Cursor::new(Vec::new());
    match DynamicImage::ImageRgba8(pixels).write_to(&mut out, ImageFormat::Png) {
        Ok(()) => Some(encode_data_url("image/png", &out.into_inner())),
        Err(e) => {
            debug!("Pixel extraction failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{Document, ImageData};
    use orange_config::BlockCounter;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    /// Scores by URL, tracks concurrency
    #[derive(Default)]
    struct StubSender {
        scores: HashMap<String, f32>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        seen: Mutex<Vec<Value>>,
        invalidated: bool,
        panic_on: Option<String>,
    }

    #[async_trait]
    impl MessageSender for StubSender {
        async fn send(&self, request: Request) -> Result<Response, RouterError> {
            if self.invalidated {
                return Err(RouterError::ContextInvalidated);
            }
            if self.panic_on.is_some() && self.panic_on.as_deref() == request.data["url"].as_str() {
                panic!("sender blew up");
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let url = request.data["url"].as_str().unwrap_or_default().to_string();
            self.seen.lock().push(request.data);
            let score = self.scores.get(&url).copied().unwrap_or(0.0);
            Ok(Response {
                success: true,
                is_blocked: Some(score >= 0.85),
                confidence: Some(score),
                layer: Some("stub".into()),
                ..Response::default()
            })
        }
    }

    struct StaticFetcher;

    #[async_trait]
    impl ImageFetcher for StaticFetcher {
        async fn fetch(&self, _url: &str) -> Option<(String, Vec<u8>)> {
            Some(("image/gif".into(), vec![1, 2, 3]))
        }
    }

    fn add_image(doc: &mut Document, src: &str, size: f32) -> NodeId {
        let img = doc.append_element(doc.body(), "img", &[("src", src)]);
        doc.set_layout(img, size, size);
        doc.set_image(img, ImageData::loaded(RgbaImage::new(4, 4)));
        img
    }

    fn dispatcher(doc: &SharedDocument, sender: Arc<StubSender>) -> AiDispatcher {
        AiDispatcher::new(
            doc.clone(),
            sender,
            None,
            FilterActions::new(BlockCounter::detached()),
            DispatchConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_three_in_flight() {
        let mut doc = Document::new("x");
        let images: Vec<NodeId> = (0..10).map(|i| add_image(&mut doc, &format!("https://x/{}.png", i), 100.0)).collect();
        let doc = doc.into_shared();
        let sender = Arc::new(StubSender {
            delay: Duration::from_millis(100),
            ..StubSender::default()
        });
        let dispatcher = dispatcher(&doc, sender.clone());

        let handle = dispatcher.enqueue(images[..6].to_vec(), Sensitivity::Balanced);
        assert_eq!(handle.worker_count(), 3);
        // Workers already running: nothing new to start
        let late = dispatcher.enqueue(images[6..].to_vec(), Sensitivity::Balanced);
        assert_eq!(late.worker_count(), 0);

        handle.wait().await;
        assert_eq!(sender.seen.lock().len(), 10);
        assert_eq!(sender.max_in_flight.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.pending(), 0);

        // Scanning marks are always cleared
        let doc = doc.lock();
        assert!(images.iter().all(|&img| !marks::is_scanning(&doc, img)));
    }

    #[tokio::test]
    async fn test_results_hide_blur_or_leave() {
        let mut doc = Document::new("x");
        let blocked = add_image(&mut doc, "https://x/blocked.png", 100.0);
        let grey = add_image(&mut doc, "https://x/grey.png", 100.0);
        let clean = add_image(&mut doc, "https://x/clean.png", 100.0);
        let doc = doc.into_shared();

        let mut scores = HashMap::new();
        scores.insert("https://x/blocked.png".to_string(), 0.9);
        scores.insert("https://x/grey.png".to_string(), 0.7);
        scores.insert("https://x/clean.png".to_string(), 0.3);
        let sender = Arc::new(StubSender {
            scores,
            ..StubSender::default()
        });

        dispatcher(&doc, sender)
            .enqueue(vec![blocked, grey, clean], Sensitivity::Balanced)
            .wait()
            .await;

        let doc = doc.lock();
        assert!(marks::is_hidden(&doc, blocked));
        assert_eq!(doc.style(blocked, "display"), Some("none"));
        assert!(crate::actions::placeholder_for(&doc, blocked).is_some());
        assert_eq!(
            doc.attr(crate::actions::placeholder_for(&doc, blocked).unwrap(), "title"),
            Some("Filtered: AI detected (90%)")
        );

        assert!(marks::is_hidden(&doc, grey));
        assert_eq!(doc.style(grey, "filter"), Some("blur(20px)"));
        assert_eq!(doc.style(grey, "display"), None);

        assert_eq!(marks::scan_mark(&doc, clean), marks::ScanMark::Unmarked);
        assert_eq!(doc.style(clean, "filter"), None);
    }

    #[tokio::test]
    async fn test_panicking_worker_returns_its_slot() {
        let mut doc = Document::new("x");
        let bad = add_image(&mut doc, "https://x/bad.png", 100.0);
        let good = add_image(&mut doc, "https://x/good.png", 100.0);
        let doc = doc.into_shared();
        let mut scores = HashMap::new();
        scores.insert("https://x/good.png".to_string(), 0.9);
        let sender = Arc::new(StubSender {
            scores,
            panic_on: Some("https://x/bad.png".into()),
            ..StubSender::default()
        });
        let dispatcher = dispatcher(&doc, sender.clone());

        let handle = dispatcher.enqueue(vec![bad], Sensitivity::Balanced);
        assert_eq!(handle.worker_count(), 1);
        handle.wait().await;

        assert_eq!(dispatcher.inner.queue.lock().workers, 0);
        assert!(!marks::is_scanning(&doc.lock(), bad));
        assert!(!marks::is_hidden(&doc.lock(), bad));

        let handle = dispatcher.enqueue(vec![good], Sensitivity::Balanced);
        assert_eq!(handle.worker_count(), 1);
        handle.wait().await;
        assert!(marks::is_hidden(&doc.lock(), good));
        assert_eq!(sender.seen.lock().len(), 1);
    }

    /// Serves `/pic.png`, `/bare` (no content type) and 404 for anything else
    async fn serve_images(png: Vec<u8>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let png = png.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let line = String::from_utf8_lossy(&request);
                    let path = line.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (head, body) = match path.as_str() {
                        "/pic.png" => (
                            format!("HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\n", png.len()),
                            png,
                        ),
                        "/bare" => (format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n", 3), vec![7, 8, 9]),
                        _ => ("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n".to_string(), Vec::new()),
                    };
                    let _ = stream.write_all(format!("{}Connection: close\r\n\r\n", head).as_bytes()).await;
                    let _ = stream.write_all(&body).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    fn local_fetcher() -> HttpImageFetcher {
        HttpImageFetcher::with_client(reqwest::Client::builder().no_proxy().build().unwrap())
    }

    #[tokio::test]
    async fn test_http_fetcher() {
        let mut png = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(RgbaImage::new(3, 3))
            .write_to(&mut png, ImageFormat::Png)
            .unwrap();
        let png = png.into_inner();
        let base = serve_images(png.clone()).await;
        let fetcher = local_fetcher();

        let (mime, bytes) = fetcher.fetch(&format!("{}/pic.png", base)).await.unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, png);

        let (mime, bytes) = fetcher.fetch(&format!("{}/bare", base)).await.unwrap();
        assert_eq!(mime, "image/jpeg");
        assert_eq!(bytes, vec![7, 8, 9]);

        assert!(fetcher.fetch(&format!("{}/missing.png", base)).await.is_none());
        assert!(fetcher.fetch("not a url").await.is_none());
    }

    #[tokio::test]
    async fn test_fetched_bytes_become_payload() {
        let base = serve_images(vec![1, 2, 3]).await;
        let mut doc = Document::new("x");
        let src = format!("{}/pic.png", base);
        let img = doc.append_element(doc.body(), "img", &[("src", src.as_str())]);
        doc.set_layout(img, 100.0, 100.0);
        doc.set_image(img, ImageData::cross_origin(RgbaImage::new(4, 4)));
        let doc = doc.into_shared();
        let sender = Arc::new(StubSender::default());

        AiDispatcher::new(
            doc.clone(),
            sender.clone(),
            Some(Arc::new(local_fetcher())),
            FilterActions::new(BlockCounter::detached()),
            DispatchConfig::default(),
        )
        .enqueue(vec![img], Sensitivity::Balanced)
        .wait()
        .await;

        let seen = sender.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["data"], "data:image/png;base64,AQID");
    }

    #[tokio::test]
    async fn test_skips_small_and_sourceless_images() {
        let mut doc = Document::new("x");
        let small = add_image(&mut doc, "https://x/icon.png", 40.0);
        let no_src = add_image(&mut doc, "", 100.0);
        let doc = doc.into_shared();
        let sender = Arc::new(StubSender::default());

        dispatcher(&doc, sender.clone())
            .enqueue(vec![small, no_src], Sensitivity::Balanced)
            .wait()
            .await;
        assert!(sender.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_payload_sources() {
        let mut doc = Document::new("x");
        let inline = add_image(&mut doc, "data:image/png;base64,AAAA", 100.0);
        let rendered = add_image(&mut doc, "https://x/rendered.png", 100.0);
        let tainted = add_image(&mut doc, "https://cdn.other/tainted.png", 100.0);
        doc.set_image(tainted, ImageData::cross_origin(RgbaImage::new(4, 4)));
        let doc = doc.into_shared();
        let sender = Arc::new(StubSender::default());

        AiDispatcher::new(
            doc.clone(),
            sender.clone(),
            Some(Arc::new(StaticFetcher)),
            FilterActions::new(BlockCounter::detached()),
            DispatchConfig {
                concurrency: 1,
                ..DispatchConfig::default()
            },
        )
        .enqueue(vec![inline, rendered, tainted], Sensitivity::Strict)
        .wait()
        .await;

        let seen = sender.seen.lock();
        assert_eq!(seen[0]["data"], "data:image/png;base64,AAAA");
        assert!(seen[1]["data"].as_str().unwrap().starts_with("data:image/png;base64,"));
        assert_eq!(seen[2]["data"], "data:image/gif;base64,AQID");
        assert!(seen.iter().all(|p| p["type"] == "base64" && p["sensitivity"] == "strict"));
    }

    #[tokio::test]
    async fn test_context_invalidation_stops_dispatch() {
        let mut doc = Document::new("x");
        let a = add_image(&mut doc, "https://x/a.png", 100.0);
        let b = add_image(&mut doc, "https://x/b.png", 100.0);
        let doc = doc.into_shared();
        let sender = Arc::new(StubSender {
            invalidated: true,
            ..StubSender::default()
        });
        let dispatcher = dispatcher(&doc, sender);

        dispatcher.enqueue(vec![a, b], Sensitivity::Balanced).wait().await;
        assert!(dispatcher.is_stopped());
        assert_eq!(dispatcher.enqueue(vec![a], Sensitivity::Balanced).worker_count(), 0);

        let doc = doc.lock();
        assert!(!marks::is_hidden(&doc, a));
        assert!(!marks::is_scanning(&doc, a));
    }

    #[tokio::test]
    async fn test_failed_classification_leaves_image_visible() {
        struct Failing;

        #[async_trait]
        impl MessageSender for Failing {
            async fn send(&self, _request: Request) -> Result<Response, RouterError> {
                Ok(Response::error("Model not initialized"))
            }
        }

        let mut doc = Document::new("x");
        let img = add_image(&mut doc, "https://x/a.png", 100.0);
        let doc = doc.into_shared();

        AiDispatcher::new(
            doc.clone(),
            Arc::new(Failing),
            None,
            FilterActions::new(BlockCounter::detached()),
            DispatchConfig::default(),
        )
        .enqueue(vec![img], Sensitivity::Balanced)
        .wait()
        .await;

        assert_eq!(marks::scan_mark(&doc.lock(), img), marks::ScanMark::Unmarked);
    }
}
