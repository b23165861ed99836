//! Markdown-to-HTML rendering for message bodies.
//!
//! Rendering is a pure function of the message text. Raw HTML in the source is
//! escaped rather than passed through, and link targets with script-capable
//! schemes are neutralized, so the output is safe to hand to any HTML surface.

use pulldown_cmark::{html, CodeBlockKind, CowStr, Event, Options, Parser, Tag};

/// Converts message content into safe markup.
pub trait MarkupRenderer: Send {
    fn render(&self, text: &str) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownRenderer;

impl MarkupRenderer for MarkdownRenderer {
    fn render(&self, text: &str) -> String {
        render_markdown(text)
    }
}

fn parser_options() -> Options {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    options
}

pub fn render_markdown(text: &str) -> String {
    let parser = Parser::new_ext(text, parser_options()).map(sanitize_event);
    let mut out = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

fn sanitize_event(event: Event<'_>) -> Event<'_> {
    match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        Event::Start(Tag::Link {
            link_type,
            dest_url,
            title,
            id,
        }) => Event::Start(Tag::Link {
            link_type,
            dest_url: safe_url(dest_url),
            title,
            id,
        }),
        Event::Start(Tag::Image {
            link_type,
            dest_url,
            title,
            id,
        }) => Event::Start(Tag::Image {
            link_type,
            dest_url: safe_url(dest_url),
            title,
            id,
        }),
        other => other,
    }
}

/// Languages of the fenced code blocks in `text`, first occurrence order.
/// Only the first word of an info string names the language.
pub fn code_block_languages(text: &str) -> Vec<String> {
    let mut languages: Vec<String> = Vec::new();
    for event in Parser::new_ext(text, parser_options()) {
        let Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) = event else {
            continue;
        };
        let Some(lang) = info.split_whitespace().next() else {
            continue;
        };
        if !languages.iter().any(|known| known == lang) {
            languages.push(lang.to_string());
        }
    }
    languages
}

fn safe_url(url: CowStr<'_>) -> CowStr<'_> {
    let lowered = url.trim_start().to_ascii_lowercase();
    let blocked = ["javascript:", "vbscript:", "data:text/html"];
    if blocked.iter().any(|scheme| lowered.starts_with(scheme)) {
        CowStr::Borrowed("#")
    } else {
        url
    }
}
