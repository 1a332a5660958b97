//! Extraction of links, text and structured output from fetched pages
//!
//! Workers call an [`Extractor`] once per fetch attempt, with the hook that
//! matches the outcome. The bundled [`HtmlLinkExtractor`] follows links and
//! pulls the title and visible text out of HTML pages.

use crate::config::ExtractConfig;
use crate::crawler::transport::{Response, TransportError};
use crate::record::FetchRecord;
use crate::url::{normalize_url, same_host};
use scraper::{ElementRef, Html, Node, Selector};
use serde_json::json;
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

/// A fetch attempt as seen by an extractor
#[derive(Debug, Clone, Copy)]
pub struct Page<'a> {
    pub record: &'a FetchRecord,
    /// `None` when every attempt failed
    pub response: Option<&'a Response>,
    /// Terminal transport error, if any
    pub error: Option<&'a TransportError>,
}

/// What an extractor produced for a fetched page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    /// Records discovered on the page; merged as linked when new
    pub links: Vec<FetchRecord>,
    pub text: Option<String>,
    pub output: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Failed to parse page: {0}")]
    Parse(String),

    #[error("Extraction failed: {0}")]
    Other(String),
}

/// Page-handling hooks supplied by the user of the engine
///
/// Errors are logged by the worker; the fetch outcome is recorded regardless.
pub trait Extractor: Send + Sync + 'static {
    /// Called for 2xx and 3xx responses
    fn on_fetched(&self, page: &Page<'_>) -> Result<Extracted, ExtractError>;

    /// Called for 404 and 410 responses
    fn on_not_found(&self, _page: &Page<'_>) -> Result<(), ExtractError> {
        Ok(())
    }

    /// Called for other status codes and for exhausted retries
    fn on_failed(&self, _page: &Page<'_>) -> Result<(), ExtractError> {
        Ok(())
    }
}

/// Follows links found in HTML pages
///
/// # Link Extraction Rules
///
/// **Include:**
/// - `<a href="...">` tags
/// - `<link rel="canonical" href="...">`
///
/// **Exclude:**
/// - `<a href="..." download>`
/// - `javascript:`, `mailto:`, `tel:` links
/// - Data URIs and fragment-only links
/// - Links to other hosts, unless `same_host_only` is off
///
/// `rel="nofollow"` links are followed.
#[derive(Debug, Clone)]
pub struct HtmlLinkExtractor {
    same_host_only: bool,
    store_text: bool,
}

impl Default for HtmlLinkExtractor {
    fn default() -> Self {
        Self::new(&ExtractConfig::default())
    }
}

impl HtmlLinkExtractor {
    pub fn new(config: &ExtractConfig) -> Self {
        Self {
            same_host_only: config.same_host_only,
            store_text: config.store_text,
        }
    }
}

impl Extractor for HtmlLinkExtractor {
    fn on_fetched(&self, page: &Page<'_>) -> Result<Extracted, ExtractError> {
        let response = match page.response {
            Some(response) if response.is_html() => response,
            _ => return Ok(Extracted::default()),
        };

        let base_url = Url::parse(&response.final_url)
            .map_err(|e| ExtractError::Parse(format!("{}: {}", response.final_url, e)))?;
        let parsed = parse_html(&response.text(), &base_url);

        let mut seen = HashSet::new();
        let links = parsed
            .links
            .into_iter()
            .filter(|link| !self.same_host_only || same_host(link, &response.final_url))
            .filter(|link| seen.insert(link.clone()))
            .map(FetchRecord::linked)
            .collect();

        Ok(Extracted {
            links,
            text: if self.store_text { parsed.text } else { None },
            output: Some(json!({
                "url": response.final_url,
                "http_code": response.code,
                "title": parsed.title,
            })),
        })
    }
}

/// Extracted information from an HTML page
#[derive(Debug, Clone)]
pub struct ParsedPage {
    /// The page title (from <title> tag)
    pub title: Option<String>,

    /// All links found on the page, absolute and normalized
    pub links: Vec<String>,

    /// Visible body text, whitespace collapsed
    pub text: Option<String>,
}

/// Parses HTML content and extracts links, title and text
///
/// # Example
///
/// ```
/// use sumi_harvest::crawler::parse_html;
/// use url::Url;
///
/// let html = r#"<html><head><title>Test</title></head><body><a href="/page">Link</a></body></html>"#;
/// let base_url = Url::parse("https://example.com/").unwrap();
/// let parsed = parse_html(html, &base_url);
/// assert_eq!(parsed.title, Some("Test".to_string()));
/// assert_eq!(parsed.links, vec!["https://example.com/page".to_string()]);
/// ```
pub fn parse_html(html: &str, base_url: &Url) -> ParsedPage {
    let document = Html::parse_document(html);

    ParsedPage {
        title: extract_title(&document),
        links: extract_links(&document, base_url),
        text: extract_text(&document),
    }
}

fn extract_title(document: &Html) -> Option<String> {
    let title_selector = Selector::parse("title").ok()?;

    document
        .select(&title_selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn extract_links(document: &Html, base_url: &Url) -> Vec<String> {
    let mut links = Vec::new();

    if let Ok(a_selector) = Selector::parse("a[href]") {
        for element in document.select(&a_selector) {
            if element.value().attr("download").is_some() {
                continue;
            }

            if let Some(href) = element.value().attr("href") {
                if let Some(absolute_url) = resolve_link(href, base_url) {
                    links.push(absolute_url);
                }
            }
        }
    }

    if let Ok(canonical_selector) = Selector::parse("link[rel='canonical'][href]") {
        for element in document.select(&canonical_selector) {
            if let Some(href) = element.value().attr("href") {
                if let Some(absolute_url) = resolve_link(href, base_url) {
                    links.push(absolute_url);
                }
            }
        }
    }

    links
}

/// Resolves a link href to a normalized absolute URL
///
/// Returns None if the link should be excluded:
/// - javascript:, mailto:, tel: schemes
/// - data: URIs
/// - Fragment-only links
/// - Invalid or non-HTTP(S) URLs after resolution
fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lower = href.to_lowercase();
    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
    {
        return None;
    }

    let absolute_url = base_url.join(href).ok()?;
    normalize_url(absolute_url.as_str())
        .ok()
        .map(|u| u.to_string())
}

fn extract_text(document: &Html) -> Option<String> {
    let body_selector = Selector::parse("body").ok()?;
    let body = document.select(&body_selector).next()?;

    let mut words = Vec::new();
    collect_text(body, &mut words);

    let text = words.join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn collect_text<'a>(element: ElementRef<'a>, words: &mut Vec<&'a str>) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => words.extend(text.split_whitespace()),
            Node::Element(el) if matches!(el.name(), "script" | "style" | "noscript") => {}
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    collect_text(child, words);
                }
            }
            _ => {}
        }
    }
}
