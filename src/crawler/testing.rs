//! In-memory doubles for exercising rounds without a network or disk

use crate::crawler::extract::{ExtractError, Extracted, Extractor, HtmlLinkExtractor, Page};
use crate::crawler::transport::{Response, Transport, TransportError};
use crate::record::FetchRecord;
use crate::storage::{ContentEntry, SegmentSink, StorageResult, TextEntry};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Mutex;

pub(crate) fn html(url: &str, body: &str) -> Response {
    Response {
        code: 200,
        final_url: url.to_string(),
        content_type: Some("text/html".to_string()),
        headers: BTreeMap::new(),
        body: body.as_bytes().to_vec(),
        truncated: false,
    }
}

pub(crate) fn not_found(url: &str) -> Response {
    Response {
        code: 404,
        content_type: None,
        ..html(url, "")
    }
}

#[derive(Clone)]
enum Reply {
    Page(Response),
    Error(TransportError),
    Hang,
}

/// Answers from a fixed table; unknown URLs are 404
#[derive(Default)]
pub(crate) struct StaticTransport {
    replies: HashMap<String, Reply>,
    calls: Mutex<HashMap<String, usize>>,
}

impl StaticTransport {
    pub fn page(mut self, url: &str, response: Response) -> Self {
        self.replies.insert(url.to_string(), Reply::Page(response));
        self
    }

    pub fn error(mut self, url: &str, error: TransportError) -> Self {
        self.replies.insert(url.to_string(), Reply::Error(error));
        self
    }

    /// The fetch never completes
    pub fn hang(mut self, url: &str) -> Self {
        self.replies.insert(url.to_string(), Reply::Hang);
        self
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}

impl Transport for StaticTransport {
    fn fetch(
        &self,
        record: &FetchRecord,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(record.url().to_string())
            .or_insert(0) += 1;
        let reply = self.replies.get(record.url()).cloned();
        let url = record.url().to_string();
        async move {
            match reply {
                Some(Reply::Page(response)) => Ok(response),
                Some(Reply::Error(error)) => Err(error),
                Some(Reply::Hang) => std::future::pending().await,
                None => Ok(not_found(&url)),
            }
        }
    }
}

/// Keeps everything a round writes in memory
#[derive(Default)]
pub(crate) struct MemorySink {
    fetch: Mutex<Vec<FetchRecord>>,
    links: Mutex<Vec<(String, FetchRecord)>>,
    content: Mutex<Vec<ContentEntry>>,
    text: Mutex<Vec<TextEntry>>,
}

impl MemorySink {
    /// Latest outcome written for `url`
    pub fn outcome(&self, url: &str) -> Option<FetchRecord> {
        self.fetch
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.url() == url)
            .cloned()
    }

    pub fn links_of(&self, parent_key: &str) -> Vec<FetchRecord> {
        self.links
            .lock()
            .unwrap()
            .iter()
            .filter(|(parent, _)| parent == parent_key)
            .map(|(_, link)| link.clone())
            .collect()
    }

    pub fn has_content(&self, key: &str) -> bool {
        self.content.lock().unwrap().iter().any(|c| c.key == key)
    }
}

impl SegmentSink for MemorySink {
    fn write_fetch(&self, record: &FetchRecord) -> StorageResult<()> {
        self.fetch.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn write_content(&self, content: &ContentEntry) -> StorageResult<()> {
        self.content.lock().unwrap().push(content.clone());
        Ok(())
    }

    fn write_links(&self, parent_key: &str, links: &[FetchRecord]) -> StorageResult<()> {
        self.links
            .lock()
            .unwrap()
            .extend(links.iter().map(|l| (parent_key.to_string(), l.clone())));
        Ok(())
    }

    fn write_text(&self, text: &TextEntry) -> StorageResult<()> {
        self.text.lock().unwrap().push(text.clone());
        Ok(())
    }
}

/// HTML extraction that also remembers which hooks ran
#[derive(Default)]
pub(crate) struct RecordingExtractor {
    html: HtmlLinkExtractor,
    fail: bool,
    fetched: Mutex<Vec<String>>,
    not_found: Mutex<Vec<String>>,
    failed: Mutex<Vec<String>>,
}

impl RecordingExtractor {
    /// `on_fetched` always errors
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn not_found(&self) -> Vec<String> {
        self.not_found.lock().unwrap().clone()
    }

    pub fn failed(&self) -> Vec<String> {
        self.failed.lock().unwrap().clone()
    }
}

impl Extractor for RecordingExtractor {
    fn on_fetched(&self, page: &Page<'_>) -> Result<Extracted, ExtractError> {
        self.fetched
            .lock()
            .unwrap()
            .push(page.record.url().to_string());
        if self.fail {
            return Err(ExtractError::Other("refused".to_string()));
        }
        self.html.on_fetched(page)
    }

    fn on_not_found(&self, page: &Page<'_>) -> Result<(), ExtractError> {
        self.not_found
            .lock()
            .unwrap()
            .push(page.record.url().to_string());
        Ok(())
    }

    fn on_failed(&self, page: &Page<'_>) -> Result<(), ExtractError> {
        self.failed.lock().unwrap().push(page.record.url().to_string());
        Ok(())
    }
}
