use std::collections::HashSet;

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

pub const FILE_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "csv", "txt", "zip", "rar", "tar", "gz",
    "json", "xml", "rtf",
];

const DOWNLOAD_QUERY_TOKENS: &[&str] = &["download", "file", "attachment"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLink {
    pub url: String,
    pub filename: String,
    pub title: String,
    pub extension: Option<String>,
}

/// Links and embeds in `body` that point at downloadable files.
///
/// Anchors come first, then `iframe`/`embed`/`object` sources; each absolute
/// URL appears once, at its first occurrence.
pub fn find_files(body: &str, base_url: &Url) -> Vec<FileLink> {
    let document = Html::parse_document(body);
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    let anchors = selector("a[href]");
    for element in document.select(&anchors) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Some(url) = resolve_file_url(base_url, href) else {
            continue;
        };
        if !seen.insert(url.to_string()) {
            continue;
        }

        let filename = basename(&url);
        let title = non_empty(inner_text(&element)).unwrap_or_else(|| filename.clone());
        out.push(FileLink {
            url: url.to_string(),
            extension: extension(&url),
            filename,
            title,
        });
    }

    let embeds = selector("iframe, embed, object");
    for element in document.select(&embeds) {
        let attrs = element.value();
        let Some(src) = attrs
            .attr("src")
            .filter(|s| !s.trim().is_empty())
            .or_else(|| attrs.attr("data"))
        else {
            continue;
        };
        let Some(url) = resolve_file_url(base_url, src) else {
            continue;
        };
        if !seen.insert(url.to_string()) {
            continue;
        }

        let filename = basename(&url);
        let title = attrs
            .attr("title")
            .and_then(|t| non_empty(t.to_owned()))
            .or_else(|| non_empty(inner_text(&element)))
            .unwrap_or_else(|| filename.clone());
        out.push(FileLink {
            url: url.to_string(),
            extension: extension(&url),
            filename,
            title,
        });
    }

    out
}

/// Whether an absolute URL looks like a downloadable file.
pub fn is_file_url(url: &Url) -> bool {
    if extension(url).is_some_and(|ext| FILE_EXTENSIONS.contains(&ext.as_str())) {
        return true;
    }

    url.query().is_some_and(|query| {
        let query = query.to_ascii_lowercase();
        DOWNLOAD_QUERY_TOKENS
            .iter()
            .any(|token| query.contains(token))
    })
}

/// Lower-cased extension of the last path segment, without the dot.
pub fn extension(url: &Url) -> Option<String> {
    let name = basename(url);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn basename(url: &Url) -> String {
    url.path()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_owned()
}

fn resolve_file_url(base_url: &Url, target: &str) -> Option<Url> {
    let target = target.trim();
    if target.is_empty() {
        return None;
    }
    let url = base_url.join(target).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    is_file_url(&url).then_some(url)
}

fn inner_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn selector(css: &'static str) -> Selector {
    // Static selectors; parsing cannot fail.
    Selector::parse(css).unwrap_or_else(|err| panic!("static selector {css:?}: {err}"))
}
