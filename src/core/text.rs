//! Comment text to HTML. Plain-text comments get escaping, paragraphs,
//! nested `>` quotes and autolinks for URLs, email addresses, bugs and
//! attachments; markdown comments are rendered with only bug and attachment
//! autolinks added.

use std::sync::OnceLock;

use pulldown_cmark::{html, CowStr, Event, Options, Parser, Tag, TagEnd};
use regex::{Captures, Regex};

use crate::core::models::Comment;

static ATTACHMENT_LABEL: OnceLock<Regex> = OnceLock::new();
static PARAGRAPH_BREAK: OnceLock<Regex> = OnceLock::new();
static LINKS: OnceLock<Regex> = OnceLock::new();
static RECORD_LINKS: OnceLock<Regex> = OnceLock::new();

fn attachment_label() -> &'static Regex {
    ATTACHMENT_LABEL
        .get_or_init(|| Regex::new(r"(?m)^Created attachment \d+\n.*\n?").expect("static pattern"))
}

fn paragraph_break() -> &'static Regex {
    PARAGRAPH_BREAK.get_or_init(|| Regex::new(r"\n{2,}").expect("static pattern"))
}

fn links() -> &'static Regex {
    LINKS.get_or_init(|| {
        Regex::new(concat!(
            r"(?P<url>(?:https?|feed|ftps?|ircs?|mailto|news):(?://)?[\w-]+(?:\.[\w-]+)+",
            r"(?:(?:&amp;|[\w.,@?^=%$:/~+#-])*(?:&amp;|[\w@?^=%$/~+#-]))?)",
            r"|(?P<email>[A-Za-z0-9.!#$%*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?",
            r"(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+)",
            r"|(?i:\bbug\s*#?(?P<bug>\d+))",
            r"|(?i:\battachment\s*#?(?P<att>\d+))",
        ))
        .expect("static pattern")
    })
}

fn record_links() -> &'static Regex {
    RECORD_LINKS.get_or_init(|| {
        Regex::new(r"(?i:\bbug\s*#?(?P<bug>\d+))|(?i:\battachment\s*#?(?P<att>\d+))")
            .expect("static pattern")
    })
}

/// Format a comment as HTML, following its markdown flag.
pub fn render_comment(comment: &Comment) -> String {
    if comment.is_markdown {
        parse_markdown_comment(&comment.text)
    } else {
        parse_comment(&comment.text)
    }
}

/// Format a plain-text comment as HTML.
pub fn parse_comment(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }

    // The server prepends "Created attachment N\n<description>" to attachment comments
    let text = attachment_label().replace(text, "");
    let escaped = escape_html(text.trim_matches('\n'));

    let mut html = String::new();
    for paragraph in paragraph_break().split(&escaped) {
        if paragraph.trim().is_empty() {
            continue;
        }
        html.push_str("<p>");
        html.push_str(&quote_block(paragraph));
        html.push_str("</p>");
    }

    linkify(&html.replace('\n', "<br>"))
}

/// Render a markdown comment. Raw HTML in the source is shown as text; bug
/// and attachment references outside links and code become links.
pub fn parse_markdown_comment(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }
    let text = attachment_label().replace(text, "");

    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TABLES);

    let mut link_depth = 0usize;
    let mut in_code_block = false;
    let events = Parser::new_ext(&text, options).map(|event| match event {
        Event::Start(Tag::Link { .. }) => {
            link_depth += 1;
            event
        }
        Event::End(TagEnd::Link) => {
            link_depth = link_depth.saturating_sub(1);
            event
        }
        Event::Start(Tag::CodeBlock(_)) => {
            in_code_block = true;
            event
        }
        Event::End(TagEnd::CodeBlock) => {
            in_code_block = false;
            event
        }
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        Event::Text(t) if link_depth == 0 && !in_code_block => {
            Event::InlineHtml(CowStr::from(link_records(&escape_html(&t))))
        }
        other => other,
    });

    let mut out = String::new();
    html::push_html(&mut out, events);
    out.trim_end().to_string()
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

enum Piece {
    Line(String),
    Quote(String),
}

/// Wrap runs of `&gt;`-prefixed lines in `<blockquote>`, recursing for
/// deeper quote levels. Input is already escaped.
fn quote_block(paragraph: &str) -> String {
    let mut pieces = Vec::new();
    let mut quoted: Vec<&str> = Vec::new();

    for line in paragraph.split('\n') {
        match strip_quote_marker(line) {
            Some(rest) => quoted.push(rest),
            None => {
                flush_quote(&mut quoted, &mut pieces);
                pieces.push(Piece::Line(line.to_string()));
            }
        }
    }
    flush_quote(&mut quoted, &mut pieces);

    let mut out = String::new();
    let mut prev_line = false;
    for piece in pieces {
        match piece {
            Piece::Line(line) => {
                if prev_line {
                    out.push('\n');
                }
                out.push_str(&line);
                prev_line = true;
            }
            Piece::Quote(quote) => {
                out.push_str(&quote);
                prev_line = false;
            }
        }
    }
    out
}

fn flush_quote(quoted: &mut Vec<&str>, pieces: &mut Vec<Piece>) {
    if quoted.is_empty() {
        return;
    }
    let inner = quote_block(&quoted.join("\n"));
    pieces.push(Piece::Quote(format!("<blockquote><p>{inner}</p></blockquote>")));
    quoted.clear();
}

fn strip_quote_marker(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("&gt;")?;
    Some(rest.strip_prefix(|c: char| c.is_whitespace()).unwrap_or(rest))
}

fn linkify(html: &str) -> String {
    links()
        .replace_all(html, |caps: &Captures| {
            if let Some(url) = caps.name("url") {
                format!(r#"<a href="{0}">{0}</a>"#, url.as_str())
            } else if let Some(email) = caps.name("email") {
                format!(r#"<a href="mailto:{0}">{0}</a>"#, email.as_str())
            } else {
                record_link(caps)
            }
        })
        .into_owned()
}

/// Bug and attachment autolinks only.
fn link_records(html: &str) -> String {
    record_links()
        .replace_all(html, |caps: &Captures| record_link(caps))
        .into_owned()
}

fn record_link(caps: &Captures) -> String {
    let matched = &caps[0];
    if let Some(bug) = caps.name("bug") {
        let id = bug.as_str();
        format!(r#"<a href="/bug/{id}" data-bug-id="{id}">{matched}</a>"#)
    } else if let Some(att) = caps.name("att") {
        let id = att.as_str();
        format!(r#"<a href="/attachment/{id}" data-att-id="{id}">{matched}</a>"#)
    } else {
        matched.to_string()
    }
}
