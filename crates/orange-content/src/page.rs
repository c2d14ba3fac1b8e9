//! Page lifecycle: gate on config, scan once, then rescan on debounced
//! document mutations until the page goes away.

use crate::actions::FilterActions;
use crate::ai_queue::{AiDispatcher, DispatchConfig, ImageFetcher};
use crate::debounce::{wait_for, Debouncer};
use crate::dom::{MutationRecord, SharedDocument};
use crate::scanner::{ScanReport, Scanner, ScannerOptions};
use orange_config::{load_config, BlockCounter, Settings, Storage};
use orange_runtime::MessageSender;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct PageOptions {
    pub scanner: ScannerOptions,
    pub dispatch: DispatchConfig,
    /// Quiet period before a mutation-triggered rescan
    pub debounce: Duration,
    /// Site-specific container selectors
    pub extra_selectors: Vec<String>,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            scanner: ScannerOptions::default(),
            dispatch: DispatchConfig::default(),
            debounce: Duration::from_millis(500),
            extra_selectors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Filtering switched off globally
    Disabled,
    /// Host is on the whitelist
    Whitelisted,
    /// Nothing to match
    NoKeywords,
    /// Scanned and watching for mutations
    Active,
    /// Observer torn down
    Disconnected,
}

/// Everything a rescan needs
struct ScanJob {
    doc: SharedDocument,
    scanner: Arc<Scanner>,
    keywords: Vec<String>,
    settings: Settings,
    extra_selectors: Vec<String>,
}

impl ScanJob {
    fn run(&self) -> ScanReport {
        self.scanner
            .scan(&self.doc, &self.keywords, &self.settings, &self.extra_selectors)
    }

    fn stopped(&self) -> bool {
        self.scanner.dispatcher().is_some_and(AiDispatcher::is_stopped)
    }
}

pub struct PageFilter {
    state: Mutex<PageState>,
    scanner: Option<Arc<Scanner>>,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl PageFilter {
    /// Load the config, run the first scan and start watching the page.
    pub async fn start(
        doc: SharedDocument,
        storage: Arc<dyn Storage>,
        sender: Arc<dyn MessageSender>,
        fetcher: Option<Arc<dyn ImageFetcher>>,
        options: PageOptions,
    ) -> Self {
        let config = load_config(storage.as_ref()).await;
        let hostname = doc.lock().hostname().to_string();

        let gate = if !config.settings.enabled_global {
            Some(PageState::Disabled)
        } else if config.lists.is_whitelisted(&hostname) {
            Some(PageState::Whitelisted)
        } else if config.lists.user_keywords.is_empty() {
            Some(PageState::NoKeywords)
        } else {
            None
        };
        if let Some(state) = gate {
            info!("Disabled for this site ({:?})", state);
            return Self {
                state: Mutex::new(state),
                scanner: None,
                observer: Mutex::new(None),
            };
        }

        let (counter, _writer) = BlockCounter::persisted(storage);
        let actions = FilterActions::new(counter);
        let dispatcher = AiDispatcher::new(doc.clone(), sender, fetcher, actions.clone(), options.dispatch);
        let scanner = Arc::new(Scanner::new(options.scanner, actions, Some(dispatcher)));

        let job = ScanJob {
            doc: doc.clone(),
            scanner: scanner.clone(),
            keywords: config.lists.user_keywords,
            settings: config.settings,
            extra_selectors: options.extra_selectors,
        };
        job.run();

        let records = doc.lock().observe();
        let observer = tokio::spawn(watch(job, records, options.debounce));
        info!("Filtering {}", hostname);

        Self {
            state: Mutex::new(PageState::Active),
            scanner: Some(scanner),
            observer: Mutex::new(Some(observer)),
        }
    }

    pub fn state(&self) -> PageState {
        *self.state.lock()
    }

    pub fn scanner(&self) -> Option<&Arc<Scanner>> {
        self.scanner.as_ref()
    }

    /// Hide and blur actions on this page so far.
    pub fn blocked_count(&self) -> u64 {
        self.scanner
            .as_ref()
            .map(|s| s.actions().counter().session_count())
            .unwrap_or(0)
    }

    /// Page is going away: stop watching for mutations. In-flight
    /// classifications are abandoned, not cancelled.
    pub async fn disconnect(&self) {
        let observer = self.observer.lock().take();
        if let Some(observer) = observer {
            observer.abort();
            let _ = observer.await;
            *self.state.lock() = PageState::Disconnected;
            debug!("Mutation observer disconnected");
        }
    }
}

async fn watch(job: ScanJob, mut records: mpsc::UnboundedReceiver<MutationRecord>, delay: Duration) {
    let mut debouncer = Debouncer::new(delay);
    loop {
        let deadline = debouncer.deadline();
        tokio::select! {
            record = records.recv() => match record {
                Some(_) => debouncer.signal(),
                None => break,
            },
            _ = wait_for(deadline) => {
                if !debouncer.take_due() {
                    continue;
                }
                if job.stopped() {
                    info!("Extension context invalidated, no longer filtering this page");
                    break;
                }
                job.run();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{Document, ImageData, NodeId};
    use crate::actions::placeholder_for;
    use crate::marks;
    use async_trait::async_trait;
    use image::{DynamicImage, RgbaImage};
    use orange_config::{
        get_blocked_count, save_config, AiMode, FilterConfig, FilterLists, MemoryStorage, Sensitivity,
    };
    use orange_rules::DynamicRuleStore;
    use orange_runtime::{
        BridgeConfig, ClassificationResult, Classifier, ClassifierError, ClassifierRegistry,
        ExtensionContext, ModelStatus, Request, Response, RouterError,
    };

    struct Unreachable;

    #[async_trait]
    impl MessageSender for Unreachable {
        async fn send(&self, _request: Request) -> Result<Response, RouterError> {
            Err(RouterError::ContextInvalidated)
        }
    }

    async fn storage_with(config: FilterConfig) -> Arc<dyn Storage> {
        let storage = MemoryStorage::new();
        save_config(&storage, &config).await.unwrap();
        Arc::new(storage)
    }

    fn news_page(text: &str) -> (SharedDocument, NodeId) {
        let mut doc = Document::new("news.example");
        let body = doc.body();
        let card = doc.append_element(body, "article", &[]);
        doc.append_text(card, text);
        (doc.into_shared(), card)
    }

    async fn start(doc: &SharedDocument, storage: Arc<dyn Storage>) -> PageFilter {
        PageFilter::start(doc.clone(), storage, Arc::new(Unreachable), None, PageOptions::default()).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_gating() {
        let (doc, card) = news_page("trump rally");

        let mut config = FilterConfig::default();
        config.settings.enabled_global = false;
        let page = start(&doc, storage_with(config).await).await;
        assert_eq!(page.state(), PageState::Disabled);

        let mut config = FilterConfig::default();
        config.lists = FilterLists::new(["news.example"], ["trump"]);
        let page = start(&doc, storage_with(config).await).await;
        assert_eq!(page.state(), PageState::Whitelisted);

        let mut config = FilterConfig::default();
        config.lists = FilterLists::new(["example.com"], Vec::<String>::new());
        let page = start(&doc, storage_with(config).await).await;
        assert_eq!(page.state(), PageState::NoKeywords);

        assert!(!marks::is_hidden(&doc.lock(), card));
        assert_eq!(doc.lock().observer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_scan_and_persisted_count() {
        let (doc, card) = news_page("Trump rally tonight");
        let storage = storage_with(FilterConfig::default()).await;

        let page = start(&doc, storage.clone()).await;
        assert_eq!(page.state(), PageState::Active);
        assert!(marks::is_hidden(&doc.lock(), card));
        assert_eq!(page.blocked_count(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(get_blocked_count(storage.as_ref()).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_rescan() {
        let (doc, _card) = news_page("weather");
        let page = start(&doc, storage_with(FilterConfig::default()).await).await;
        let scanner = page.scanner().unwrap().clone();
        assert_eq!(scanner.pass_count(), 1);

        // A burst of mutations
        let late = {
            let mut doc = doc.lock();
            let body = doc.body();
            let late = doc.append_element(body, "div", &[("class", "post")]);
            doc.append_text(late, "trump");
            doc.append_element(body, "p", &[]);
            late
        };

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!marks::is_hidden(&doc.lock(), late));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(marks::is_hidden(&doc.lock(), late));
        assert_eq!(scanner.pass_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_rescans() {
        let (doc, _card) = news_page("weather");
        let page = start(&doc, storage_with(FilterConfig::default()).await).await;
        assert_eq!(doc.lock().observer_count(), 1);

        page.disconnect().await;
        assert_eq!(page.state(), PageState::Disconnected);
        assert_eq!(doc.lock().observer_count(), 0);

        let late = {
            let mut doc = doc.lock();
            let body = doc.body();
            let late = doc.append_element(body, "article", &[]);
            doc.append_text(late, "trump");
            late
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!marks::is_hidden(&doc.lock(), late));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_context_disconnects_observer() {
        let mut doc = Document::new("news.example");
        let body = doc.body();
        let img = doc.append_element(body, "img", &[("src", "https://cdn.example/a.png")]);
        doc.set_layout(img, 200.0, 200.0);
        doc.set_image(img, ImageData::loaded(RgbaImage::new(8, 8)));
        let doc = doc.into_shared();

        let mut config = FilterConfig::default();
        config.settings.ai_consent = true;
        let page = start(&doc, storage_with(config).await).await;
        assert_eq!(page.state(), PageState::Active);

        // Let the dispatch fail, then poke the observer
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(page.scanner().unwrap().dispatcher().unwrap().is_stopped());
        {
            let mut doc = doc.lock();
            let body = doc.body();
            doc.append_element(body, "div", &[]);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(doc.lock().observer_count(), 0);
        assert!(!marks::is_hidden(&doc.lock(), img));
    }

    /// Scores images by their average red channel
    struct Redness;

    #[async_trait]
    impl Classifier for Redness {
        fn id(&self) -> &str {
            "redness"
        }

        async fn classify(
            &self,
            image: &DynamicImage,
            sensitivity: Sensitivity,
        ) -> Result<ClassificationResult, ClassifierError> {
            let rgba = image.to_rgba8();
            let total: u64 = rgba.pixels().map(|p| p.0[0] as u64).sum();
            let score = total as f32 / ((rgba.width() * rgba.height()).max(1) as f32 * 255.0);
            Ok(ClassificationResult::from_score(score, "redness", sensitivity))
        }
    }

    #[tokio::test]
    async fn test_images_classified_through_background() {
        let mut config = FilterConfig::default();
        config.settings.ai_consent = true;
        config.settings.ai_mode = AiMode::Classifier("redness".into());
        let storage = storage_with(config).await;

        let mut registry = ClassifierRegistry::new();
        registry.register("redness", || Ok(Arc::new(Redness) as Arc<dyn Classifier>));
        let context = ExtensionContext::start(
            storage.clone(),
            Arc::new(DynamicRuleStore::new()),
            registry,
            BridgeConfig::default(),
        )
        .await;

        let mut doc = Document::new("news.example");
        let body = doc.body();
        let red = doc.append_element(body, "img", &[("src", "https://cdn.example/red.png")]);
        let blue = doc.append_element(body, "img", &[("src", "https://cdn.example/blue.png")]);
        for (img, color) in [(red, [255, 0, 0, 255]), (blue, [0, 0, 255, 255])] {
            doc.set_layout(img, 120.0, 80.0);
            doc.set_image(img, ImageData::loaded(RgbaImage::from_pixel(12, 8, image::Rgba(color))));
        }
        let doc = doc.into_shared();

        let page = PageFilter::start(
            doc.clone(),
            storage,
            Arc::new(context.router().clone()),
            None,
            PageOptions::default(),
        )
        .await;

        for _ in 0..100 {
            if marks::is_hidden(&doc.lock(), red) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(marks::is_hidden(&doc.lock(), red));
        assert!(placeholder_for(&doc.lock(), red).is_some());
        assert!(!marks::is_hidden(&doc.lock(), blue));
        assert_eq!(context.model_status(), ModelStatus::Ready);
        assert_eq!(page.blocked_count(), 1);

        context.shutdown().await;
        page.disconnect().await;
    }
}
