use scraper::{Html, Selector};
use sha2::Digest as _;

/// Fingerprint of a fetched document, optionally narrowed to a CSS selection.
///
/// Matching elements are serialized as outer HTML and concatenated in
/// document order. A selector that is invalid or matches nothing falls back to
/// the whole body.
pub fn fingerprint(body: &str, selector: Option<&str>) -> String {
    let selected = selector.and_then(|selector| select_content(body, selector));
    sha256_hex(selected.as_deref().unwrap_or(body).as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = sha2::Sha256::digest(bytes);
    hex::encode(digest)
}

fn select_content(body: &str, selector: &str) -> Option<String> {
    let parsed = match Selector::parse(selector) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(selector, %err, "invalid css selector; fingerprinting whole document");
            return None;
        }
    };

    let document = Html::parse_document(body);
    let mut matched = false;
    let mut out = String::new();
    for element in document.select(&parsed) {
        matched = true;
        out.push_str(&element.html());
    }

    if !matched {
        tracing::warn!(selector, "css selector matched nothing; fingerprinting whole document");
        return None;
    }
    Some(out)
}
