//! Direct HTTP fetch extraction, no third-party service.

use super::{ExtractedPage, ExtractionProvider};
use crate::error::PipelineError;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use std::sync::OnceLock;
use tracing::debug;

const MAX_CONTENT_CHARS: usize = 20_000;

pub struct DirectFetchExtractor {
    client: Client,
}

impl DirectFetchExtractor {
    pub fn new(timeout_secs: u64) -> Result<Self, PipelineError> {
        Ok(Self {
            client: super::http_client(timeout_secs)?,
        })
    }
}

#[async_trait]
impl ExtractionProvider for DirectFetchExtractor {
    async fn extract(&self, url: &str) -> Result<ExtractedPage, PipelineError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| PipelineError::malformed("direct", format!("Invalid source URL '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(PipelineError::malformed(
                "direct",
                format!("Unsupported URL scheme for '{url}'"),
            ));
        }

        debug!(url = %url, "Fetching page");
        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest("direct", e))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::from_reqwest("direct", e))?;
        if !status.is_success() {
            return Err(PipelineError::from_status("direct", status.as_u16(), &body));
        }

        let (title, text) =
            if content_type.contains("text/html") || content_type.contains("application/xhtml") {
                (extract_title(&body).unwrap_or_default(), html_to_text(&body))
            } else {
                (String::new(), body)
            };
        let text: String = text.chars().take(MAX_CONTENT_CHARS).collect();
        Ok(ExtractedPage::from_content(url, &title, text))
    }

    fn name(&self) -> &str {
        "direct"
    }
}

fn title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"))
}

fn noise_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|noscript|svg|head)\b[^>]*>.*?</(script|style|noscript|svg|head)>")
            .expect("valid regex")
    })
}

fn block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)</?(p|div|br|li|tr|h[1-6]|section|article)[^>]*>").expect("valid regex")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("valid regex"))
}

fn extract_title(html: &str) -> Option<String> {
    title_re()
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| decode_entities(m.as_str().trim()))
        .filter(|t| !t.is_empty())
}

/// Strip markup and collapse blank lines.
fn html_to_text(html: &str) -> String {
    let without_noise = noise_re().replace_all(html, " ");
    let with_breaks = block_re().replace_all(&without_noise, "\n");
    let stripped = tag_re().replace_all(&with_breaks, "");
    let decoded = decode_entities(&stripped);

    decoded
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_patterns_compile() {
        assert!(title_re().is_match("<title>x</title>"));
        assert!(noise_re().is_match("<script>x</script>"));
        assert!(block_re().is_match("<p>"));
        assert!(tag_re().is_match("<span class=\"a\">"));
    }

    #[test]
    fn test_html_to_text() {
        let html = r#"<html><head><title>Ignored head</title></head>
            <body><h1>Market map</h1>
            <script>var x = 1;</script>
            <p>Rust adoption &amp; growth</p><div>  second   line </div></body></html>"#;
        let text = html_to_text(html);
        assert_eq!(text, "Market map\nRust adoption & growth\nsecond line");
    }

    #[test]
    fn test_extract_title() {
        assert_eq!(
            extract_title("<html><title> Q3 &amp; Q4 </title></html>").as_deref(),
            Some("Q3 & Q4")
        );
        assert_eq!(extract_title("<p>no title</p>"), None);
    }

    #[tokio::test]
    async fn test_rejects_non_http_urls() {
        let extractor = DirectFetchExtractor::new(5).unwrap();
        assert!(matches!(
            extractor.extract("ftp://files.test/a").await,
            Err(PipelineError::MalformedResponse { .. })
        ));
        assert!(extractor.extract("not a url").await.is_err());
    }
}
