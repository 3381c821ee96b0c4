//! Best-effort metadata extraction from HTML pages and feed entries.
//!
//! The matchers run in a fixed order: structured `<link>` elements first, then
//! Open Graph meta tags, then a fallback scan for the first inline image.
//! Each matcher is a pure function over the raw HTML and tolerates malformed
//! markup; extraction returns partial or empty results instead of failing.

use scraper::{Html, Selector};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::fetcher::PageFetch;
use crate::types::{FeedrankError, Result};

pub const FLASH_MIME: &str = "application/x-shockwave-flash";

/// Query parameters stripped from image URLs so downstream consumers get the
/// highest-resolution variant.
const SIZE_PARAMS: [&str; 5] = ["w", "h", "width", "height", "size"];

/// Structured media tags resolved for a page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaTags {
    pub image: Option<String>,
    pub image_alt: Option<String>,
    pub video: Option<String>,
    pub video_type: Option<String>,
}

impl MediaTags {
    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.video.is_none()
    }
}

/// One content representation of a feed entry.
#[derive(Debug, Clone)]
pub struct ContentVariant {
    pub media_type: String,
    pub body: String,
}

/// Resolves titles and media tags for URLs by fetching them and running the
/// pure matchers below.
pub struct MetadataExtractor {
    fetcher: Arc<dyn PageFetch>,
}

impl MetadataExtractor {
    pub fn new(fetcher: Arc<dyn PageFetch>) -> Self {
        Self { fetcher }
    }

    /// Page title from `og:title`, else the `<title>` element.
    ///
    /// Non-HTML content types and pages without any title markup fail with
    /// `MetadataUnavailable`; the title must be treated as unresolved, never
    /// as an empty string.
    pub async fn page_title(&self, url: &str) -> Result<String> {
        let page = self.fetcher.fetch_page(url).await?;
        if !is_html(&page.content_type) {
            return Err(FeedrankError::MetadataUnavailable { url: url.to_string() });
        }
        let body = page.body.unwrap_or_default();
        html_title(&body)
            .map(|title| crate::utils::unescape(&title))
            .ok_or_else(|| FeedrankError::MetadataUnavailable { url: url.to_string() })
    }

    /// Image/video tags for a URL, dispatching on content type.
    pub async fn media_tags(&self, url: &str) -> Result<MediaTags> {
        let page = self.fetcher.fetch_page(url).await?;
        Ok(extract_media(&page.content_type, page.body.as_deref(), url))
    }

    /// Icon URL and description for a channel's site page, used to backfill
    /// channels that arrived without either. Falls back to the feed's own
    /// image and subtitle when the page has neither.
    pub async fn icon_and_description(
        &self,
        link: &str,
        feed_icon: Option<&str>,
        feed_description: Option<&str>,
    ) -> Result<(Option<String>, Option<String>)> {
        let page = self.fetcher.fetch_page(link).await?;
        let mut icon = None;
        let mut description = None;
        if is_html(&page.content_type) {
            let body = page.body.unwrap_or_default();
            icon = html_icon(&body);
            description = html_description(&body);
        }
        Ok((
            icon.or_else(|| feed_icon.map(str::to_string)),
            description.or_else(|| feed_description.map(str::to_string)),
        ))
    }
}

/// Content-type dispatch over fetched bytes.
///
/// Images and videos are their own media; HTML runs through the matcher
/// chain. Anything else yields empty tags.
pub fn extract_media(content_type: &str, body: Option<&str>, source_url: &str) -> MediaTags {
    if content_type.starts_with("image/") {
        return MediaTags {
            image: Some(source_url.to_string()),
            ..MediaTags::default()
        };
    }
    if content_type.starts_with("video/") || mime_essence(content_type) == FLASH_MIME {
        return MediaTags {
            video: Some(source_url.to_string()),
            video_type: Some(mime_essence(content_type).to_string()),
            ..MediaTags::default()
        };
    }
    if is_html(content_type) {
        if let Some(html) = body {
            return media_tags_from_html(html);
        }
    }
    MediaTags::default()
}

/// Matcher chain for HTML documents: `<link rel="image_src">` before
/// `og:image`, `<link rel="video_src">` before `og:video`. A video without a
/// declared type defaults to the flash MIME.
pub fn media_tags_from_html(html: &str) -> MediaTags {
    let doc = Html::parse_document(html);

    let image = link_rel_href(&doc, "image_src")
        .or_else(|| og_content(&doc, "og:image"))
        .map(|url| normalize_image_url(&url));

    let video = link_rel_href(&doc, "video_src").or_else(|| og_content(&doc, "og:video"));
    let video_type = video.as_ref().map(|_| {
        link_rel_href(&doc, "video_type")
            .or_else(|| og_content(&doc, "og:video:type"))
            .unwrap_or_else(|| FLASH_MIME.to_string())
    });

    MediaTags {
        image,
        image_alt: None,
        video,
        video_type,
    }
}

/// `og:title` meta content, else the `<title>` element text.
pub fn html_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    og_content(&doc, "og:title").or_else(|| title_element(&doc))
}

/// `<meta name="description">` content.
pub fn html_description(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    meta_named(&doc, "description")
}

/// Href of the first `<link>` whose rel list mentions "icon".
pub fn html_icon(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    link_rel_href(&doc, "icon")
}

/// First inline `<img>` that points at a raster image (.jpg/.png, query
/// string allowed), with its alt text.
pub fn first_inline_image(html: &str) -> Option<(String, Option<String>)> {
    let doc = Html::parse_fragment(html);
    let selector = Selector::parse("img[src]").ok()?;
    for img in doc.select(&selector) {
        let src = img.value().attr("src")?.trim();
        if is_raster_image_url(src) {
            let alt = img
                .value()
                .attr("alt")
                .map(str::trim)
                .filter(|alt| !alt.is_empty())
                .map(str::to_string);
            return Some((src.to_string(), alt));
        }
    }
    None
}

/// Picks the best body of a feed entry: `application/xhtml+xml`, then
/// `text/html`, then the first variant, then the plain summary.
pub fn best_content(variants: &[ContentVariant], summary: Option<&str>) -> Option<String> {
    for wanted in ["application/xhtml+xml", "text/html"] {
        if let Some(variant) = variants
            .iter()
            .find(|v| mime_essence(&v.media_type) == wanted)
        {
            return Some(variant.body.clone());
        }
    }
    variants
        .first()
        .map(|v| v.body.clone())
        .or_else(|| summary.map(str::to_string))
}

/// Strips width/height/size query parameters so consumers receive the
/// highest-resolution variant. Unparseable URLs pass through untouched.
pub fn normalize_image_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    if url.query().is_none() {
        return raw.to_string();
    }
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !SIZE_PARAMS.contains(&key.to_ascii_lowercase().as_str()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url.to_string()
}

pub fn is_html(content_type: &str) -> bool {
    content_type.starts_with("text/html")
}

fn mime_essence(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

fn is_raster_image_url(src: &str) -> bool {
    let lower = src.to_ascii_lowercase();
    lower.ends_with(".jpg")
        || lower.contains(".jpg?")
        || lower.ends_with(".png")
        || lower.contains(".png?")
}

/// Content of the first `<meta property="...">` matching `property`, in
/// either attribute order. Tag names and property values match
/// case-insensitively; the HTML parser already normalizes attribute order.
fn og_content(doc: &Html, property: &str) -> Option<String> {
    let selector = Selector::parse("meta").ok()?;
    for meta in doc.select(&selector) {
        let matches = meta
            .value()
            .attr("property")
            .map(|p| p.trim().eq_ignore_ascii_case(property))
            .unwrap_or(false);
        if matches {
            if let Some(content) = nonempty_attr(meta.value().attr("content")) {
                debug!(property, "matched open graph tag");
                return Some(content);
            }
        }
    }
    None
}

fn meta_named(doc: &Html, name: &str) -> Option<String> {
    let selector = Selector::parse("meta").ok()?;
    for meta in doc.select(&selector) {
        let matches = meta
            .value()
            .attr("name")
            .map(|n| n.trim().eq_ignore_ascii_case(name))
            .unwrap_or(false);
        if matches {
            if let Some(content) = nonempty_attr(meta.value().attr("content")) {
                return Some(content);
            }
        }
    }
    None
}

/// Href of the first `<link>` whose rel attribute contains `rel` as a
/// substring, mirroring how sites declare `shortcut icon`, `image_src`, etc.
fn link_rel_href(doc: &Html, rel: &str) -> Option<String> {
    let selector = Selector::parse("link").ok()?;
    for link in doc.select(&selector) {
        let matches = link
            .value()
            .attr("rel")
            .map(|r| r.to_ascii_lowercase().contains(rel))
            .unwrap_or(false);
        if matches {
            if let Some(href) = nonempty_attr(link.value().attr("href")) {
                return Some(href);
            }
        }
    }
    None
}

fn title_element(doc: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    doc.select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|title| !title.is_empty())
}

fn nonempty_attr(attr: Option<&str>) -> Option<String> {
    attr.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
