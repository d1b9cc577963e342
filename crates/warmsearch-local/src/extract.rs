use std::io::Cursor;
use warmsearch_core::{Parser, SearchTarget};

/// Convert HTML to readable text (html2text renders headings/links in Markdown style).
pub fn html_to_text(html: &str, width: usize) -> String {
    html2text::from_read(Cursor::new(html.as_bytes()), width).unwrap_or_else(|_| html.to_string())
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultItem {
    pub title: String,
    pub url: String,
    pub snippet: Option<String>,
}

/// Renders result blocks as a numbered Markdown list, falling back to the text of the
/// content container when no blocks match.
#[derive(Debug, Clone)]
pub struct ResultsMarkdownParser {
    width: usize,
}

impl ResultsMarkdownParser {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.clamp(40, 400),
        }
    }
}

impl Default for ResultsMarkdownParser {
    fn default() -> Self {
        Self::new(100)
    }
}

impl Parser for ResultsMarkdownParser {
    fn extract(&self, html: &str, target: &SearchTarget) -> Option<String> {
        let items = parse_results(html, target);
        if !items.is_empty() {
            return Some(render_markdown(&items));
        }
        container_text(html, &target.content_selector, self.width)
    }
}

pub fn parse_results(html: &str, target: &SearchTarget) -> Vec<ResultItem> {
    let doc = html_scraper::Html::parse_document(html);
    let (Ok(block_sel), Ok(title_sel)) = (
        html_scraper::Selector::parse(&target.result_selector),
        html_scraper::Selector::parse(&target.title_selector),
    ) else {
        return Vec::new();
    };
    let snippet_sel = html_scraper::Selector::parse(&target.snippet_selector).ok();
    let skip_sel = target
        .skip_selector
        .as_deref()
        .and_then(|s| html_scraper::Selector::parse(s).ok());

    let mut out = Vec::new();
    for block in doc.select(&block_sel) {
        if out.len() >= target.max_results {
            break;
        }
        if let Some(skip) = &skip_sel {
            if skip.matches(&block) {
                continue;
            }
        }
        let Some(link) = block.select(&title_sel).next() else {
            continue;
        };
        let title = norm_ws(&link.text().collect::<String>());
        let Some(url) = link.value().attr("href").and_then(resolve_href) else {
            continue;
        };
        if title.is_empty() {
            continue;
        }
        let snippet = snippet_sel
            .as_ref()
            .and_then(|s| block.select(s).next())
            .map(|el| norm_ws(&el.text().collect::<String>()))
            .filter(|s| !s.is_empty());
        out.push(ResultItem {
            title,
            url,
            snippet,
        });
    }
    out
}

/// Result links may be redirect wrappers (`//duckduckgo.com/l/?uddg=<encoded>`); unwrap them.
pub fn resolve_href(href: &str) -> Option<String> {
    let href = href.trim();
    let base = url::Url::parse("https://duckduckgo.com/").ok()?;
    let u = base.join(href).ok()?;
    if u.path() == "/l/" || u.path() == "/l" {
        if let Some((_, dest)) = u.query_pairs().find(|(k, _)| k == "uddg") {
            return Some(dest.into_owned());
        }
    }
    match u.scheme() {
        "http" | "https" if !href.starts_with('/') || href.starts_with("//") => Some(u.to_string()),
        _ => None,
    }
}

fn escape_md(s: &str) -> String {
    s.replace('[', "\\[").replace(']', "\\]")
}

pub fn render_markdown(items: &[ResultItem]) -> String {
    let mut out = String::new();
    for (i, item) in items.iter().enumerate() {
        out.push_str(&format!("{}. [{}]({})\n", i + 1, escape_md(&item.title), item.url));
        if let Some(snippet) = &item.snippet {
            out.push_str("   ");
            out.push_str(snippet);
            out.push('\n');
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn container_text(html: &str, selector: &str, width: usize) -> Option<String> {
    let doc = html_scraper::Html::parse_document(html);
    let inner = html_scraper::Selector::parse(selector)
        .ok()
        .and_then(|sel| doc.select(&sel).next().map(|el| el.html()));
    let text = match inner {
        Some(fragment) => html_to_text(&fragment, width),
        None => html_to_text(html, width),
    };
    let text = text.trim();
    if text.chars().any(|c| c.is_alphanumeric()) {
        Some(text.to_string())
    } else {
        None
    }
}
