//! Debug-mode error pages showing the failing source

use askama::Template;

use crate::render::{RenderError, SourceLang};

const HIGHLIGHT_START: &str = "<span style=\"color: red !important\">";
const HIGHLIGHT_END: &str = "</span>";

/// Page title for an error in the given language.
pub fn error_title(lang: Option<SourceLang>) -> &'static str {
    match lang {
        None => "Error",
        Some(SourceLang::Lua) => "Lua Error",
        Some(SourceLang::Css) | Some(SourceLang::Scss) => "CSS Error",
        Some(SourceLang::Gcss) => "GCSS Error",
        Some(SourceLang::Html) => "HTML Error",
        Some(SourceLang::Jsx) => "JSX Error",
        Some(SourceLang::Amber) => "Amber Error",
        Some(SourceLang::Pongo2) => "Pongo2 Error",
        Some(SourceLang::Markdown) => "Markdown Error",
    }
}

/// 1-based line number mentioned in `message`.
///
/// Script errors look like `file.lua:12: message` (the number may be
/// followed by a parenthesized column); template errors carry `- Line: 12,`.
pub fn line_from_message(lang: Option<SourceLang>, message: &str) -> Option<usize> {
    match lang {
        Some(SourceLang::Lua) => colon_line(message),
        Some(SourceLang::Amber) | Some(SourceLang::Pongo2) => dash_line(message),
        _ => colon_line(message).or_else(|| dash_line(message)),
    }
}

fn colon_line(message: &str) -> Option<usize> {
    let mut fields = message.splitn(3, ':');
    let _name = fields.next()?;
    let number = fields.next()?;
    fields.next()?;
    let number = number.split('(').next()?.trim();
    number.parse().ok().filter(|n| *n > 0)
}

fn dash_line(message: &str) -> Option<usize> {
    static LINE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r"- Line: *(\d+)").expect("static regex")
    });
    LINE.captures(message)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
        .filter(|n| *n > 0)
}

/// HTML-escape `source`, wrapping `line` (1-based) in a red highlight.
pub fn highlight_source(source: &str, line: Option<usize>) -> String {
    let mut out = String::with_capacity(source.len() + 64);
    for (i, text) in source.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let escaped = html_escape::encode_text(text);
        if line == Some(i + 1) {
            out.push_str(HIGHLIGHT_START);
            out.push_str(&escaped);
            out.push_str(HIGHLIGHT_END);
        } else {
            out.push_str(&escaped);
        }
    }
    out
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorPage<'a> {
    title: &'a str,
    filename: &'a str,
    lang_class: &'a str,
    code: &'a str,
    message: &'a str,
    version: &'a str,
}

/// Render the debug error page for `err` raised while rendering `source`.
pub fn error_page(
    filename: &str,
    source: &[u8],
    err: &RenderError,
    version: &str,
) -> Result<String, askama::Error> {
    let source = String::from_utf8_lossy(source);
    let line = err
        .line
        .or_else(|| line_from_message(err.lang, &err.message));
    let code = highlight_source(&source, line);
    let lang_class = match err.lang {
        None | Some(SourceLang::Amber) | Some(SourceLang::Gcss) => "nohighlight",
        Some(lang) => lang.as_str(),
    };

    ErrorPage {
        title: error_title(err.lang),
        filename,
        lang_class,
        code: &code,
        message: err.message.trim(),
        version,
    }
    .render()
}
