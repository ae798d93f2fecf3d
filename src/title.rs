//! Broadcaster page title lookup.
//!
//! The title only feeds the artifact file name, so every failure here is
//! soft: the session logs it and records with an empty title.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use castrec_common::BroadcasterId;
use regex::Regex;
use reqwest::Client;

/// Upper bound on the page fetch.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(4);

const TITLE_CLASS: &str = "tw-player-page-title-title";
const DESCRIPTION_CLASS: &str = "tw-player-page-title-description";

/// Looks up the current stream title for a broadcaster.
#[async_trait]
pub trait TitleLookup: Send + Sync {
    async fn title(&self, broadcaster: &BroadcasterId) -> Result<String>;
}

/// [`TitleLookup`] that scrapes the broadcaster's public page.
pub struct PageTitleLookup {
    client: Client,
    base_url: String,
}

impl PageTitleLookup {
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client: {}", e);
                Client::new()
            });

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TitleLookup for PageTitleLookup {
    async fn title(&self, broadcaster: &BroadcasterId) -> Result<String> {
        let url = format!(
            "{}/{}",
            self.base_url,
            urlencoding::encode(broadcaster.as_str())
        );
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("Stream page request failed ({}): {}", status, url);
        }

        let html = response.text().await?;
        Ok(extract_title(&html))
    }
}

static TITLE_OPEN_RE: LazyLock<Regex> = LazyLock::new(|| opening_tag_with_class(TITLE_CLASS));
static DESCRIPTION_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| opening_tag_with_class(DESCRIPTION_CLASS));
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(/?)([A-Za-z][A-Za-z0-9]*)\b[^>]*?(/?)>").expect("tag pattern is valid")
});
static H2_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<h2\b[^>]*>(.*?)</h2>").expect("h2 pattern is valid"));
static ANY_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("markup pattern is valid"));

fn opening_tag_with_class(class: &str) -> Regex {
    Regex::new(&format!(
        r#"(?s)<([A-Za-z][A-Za-z0-9]*)\b[^>]*\bclass="[^"]*{}[^"]*"[^>]*>"#,
        regex::escape(class)
    ))
    .expect("class pattern is valid")
}

/// Pull "`<title> <description>`" out of a broadcaster page.
///
/// The title is the first `h2` inside the title container; the description
/// is the text of the description element. Either may be missing.
pub fn extract_title(html: &str) -> String {
    let title = element_inner(html, &TITLE_OPEN_RE)
        .and_then(|container| H2_RE.captures(container))
        .and_then(|c| c.get(1))
        .map(|h2| text_content(h2.as_str()))
        .unwrap_or_default();
    if title.is_empty() {
        tracing::debug!("Stream title element not found");
    }

    let description = element_inner(html, &DESCRIPTION_OPEN_RE)
        .map(text_content)
        .unwrap_or_default();

    format!("{title} {description}").trim().to_string()
}

/// Markup between the first element matched by `open_re` and its closing tag.
///
/// Nested elements with the same tag name are balanced. An element that is
/// never closed extends to the end of the document.
fn element_inner<'a>(html: &'a str, open_re: &Regex) -> Option<&'a str> {
    let open = open_re.captures(html)?;
    let whole = open.get(0)?;
    if whole.as_str().ends_with("/>") {
        return Some("");
    }
    let name = open.get(1)?.as_str();
    let rest = &html[whole.end()..];

    let mut depth = 1usize;
    for tag in TAG_RE.captures_iter(rest) {
        if !tag[2].eq_ignore_ascii_case(name) {
            continue;
        }
        if !tag[1].is_empty() {
            depth -= 1;
            if depth == 0 {
                return tag.get(0).map(|m| &rest[..m.start()]);
            }
        } else if tag[3].is_empty() {
            depth += 1;
        }
    }
    Some(rest)
}

fn text_content(fragment: &str) -> String {
    inner_text(&ANY_TAG_RE.replace_all(fragment, " "))
}

fn inner_text(fragment: &str) -> String {
    let decoded = fragment
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAGE: &str = r#"
<html><body>
  <div class="tw-player-page-title tw-player-page-title-title">
    <h2>
      Late night   <b>talk</b>
    </h2>
  </div>
  <span class="tw-player-page-title-description">
    Tom &amp; Jerry
    <span class="tw-player-page-title-description-text"></span>
  </span>
</body></html>
"#;

    #[test]
    fn extracts_title_and_description() {
        assert_eq!(extract_title(PAGE), "Late night talk Tom & Jerry");
    }

    #[test]
    fn missing_elements_give_empty_parts() {
        assert_eq!(extract_title("<html></html>"), "");

        let only_title = r#"<div class="tw-player-page-title-title"><h2>Solo</h2></div>"#;
        assert_eq!(extract_title(only_title), "Solo");
    }

    #[test]
    fn heading_outside_title_container_is_ignored() {
        let page = r#"<div class="tw-player-page-title-title"><span>no heading</span></div><section><h2>Recommended lives</h2></section>"#;
        assert_eq!(extract_title(page), "");
    }

    #[test]
    fn nested_containers_stay_in_scope() {
        let page = r#"
<div class="tw-player-page-title-title">
  <div class="badge">LIVE</div>
  <div><h2>Inner heading</h2></div>
</div>
<h2>Sidebar</h2>
<span class="tw-player-page-title-description">Part <span>two</span> recap</span>
<span>footer</span>
"#;
        assert_eq!(extract_title(page), "Inner heading Part two recap");
    }

    #[test]
    fn inner_text_collapses_whitespace() {
        assert_eq!(inner_text("  a \n\t b&nbsp;c "), "a b c");
    }

    #[tokio::test]
    async fn fetches_page_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/caster"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .mount(&server)
            .await;

        let lookup = PageTitleLookup::new(&format!("{}/", server.uri()));
        let id = BroadcasterId::parse("caster").unwrap();
        assert_eq!(
            lookup.title(&id).await.unwrap(),
            "Late night talk Tom & Jerry"
        );
    }

    #[tokio::test]
    async fn non_success_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let lookup = PageTitleLookup::new(&server.uri());
        let id = BroadcasterId::parse("nobody").unwrap();
        let err = lookup.title(&id).await.unwrap_err();
        assert!(err.to_string().contains("404"));
    }
}
