use pulldown_cmark::{html, Event, HeadingLevel, Options, Parser, Tag, TagEnd};

use super::{RenderContext, RenderError, Renderer, SourceLang, HTML_UTF8};
use crate::theme::Theme;

/// Markdown to a themed HTML page.
///
/// Leading `title: ...` and `theme: ...` lines override the page title
/// (otherwise the first `#` heading, then the file name) and the theme.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownRenderer;

struct Keywords<'a> {
    title: Option<&'a str>,
    theme: Option<&'a str>,
}

fn extract_keywords(source: &str) -> (Keywords<'_>, &str) {
    let mut keywords = Keywords {
        title: None,
        theme: None,
    };
    let mut rest = source;
    loop {
        let (line, tail) = rest.split_once('\n').unwrap_or((rest, ""));
        if let Some(value) = line.strip_prefix("title:") {
            keywords.title = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("theme:") {
            keywords.theme = Some(value.trim());
        } else {
            break;
        }
        rest = tail;
        if rest.is_empty() {
            break;
        }
    }
    (keywords, rest)
}

fn first_h1(markdown: &str) -> Option<String> {
    let mut in_h1 = false;
    let mut title = String::new();
    for event in Parser::new(markdown) {
        match event {
            Event::Start(Tag::Heading {
                level: HeadingLevel::H1,
                ..
            }) => in_h1 = true,
            Event::End(TagEnd::Heading(HeadingLevel::H1)) => break,
            Event::Text(text) | Event::Code(text) if in_h1 => title.push_str(&text),
            _ => {}
        }
    }
    let title = title.trim();
    (!title.is_empty()).then(|| title.to_string())
}

impl Renderer for MarkdownRenderer {
    fn content_type(&self) -> &str {
        HTML_UTF8
    }

    fn render(&self, ctx: &RenderContext<'_>, source: &[u8]) -> Result<Vec<u8>, RenderError> {
        let source = std::str::from_utf8(source).map_err(|e| {
            RenderError::new(SourceLang::Markdown, format!("not valid UTF-8: {}", e))
        })?;
        let (keywords, markdown) = extract_keywords(source);

        let options = Options::ENABLE_TABLES
            | Options::ENABLE_FOOTNOTES
            | Options::ENABLE_STRIKETHROUGH
            | Options::ENABLE_TASKLISTS;
        let mut body = String::with_capacity(markdown.len() * 3 / 2);
        html::push_html(&mut body, Parser::new_ext(markdown, options));

        let title = match keywords.title {
            Some(title) => title.to_string(),
            None => first_h1(markdown).unwrap_or_else(|| {
                ctx.filename
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            }),
        };
        let theme = match keywords.theme {
            Some(name) => name.parse::<Theme>().unwrap_or_default(),
            None => ctx.theme.clone(),
        };

        theme
            .bare_page(&title, &body)
            .map(String::into_bytes)
            .map_err(|e| RenderError::new(SourceLang::Markdown, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn render(source: &str) -> String {
        let theme = Theme::Gray;
        let ctx = RenderContext {
            filename: Path::new("/srv/sub/index.md"),
            theme: &theme,
            data: None,
        };
        String::from_utf8(MarkdownRenderer.render(&ctx, source.as_bytes()).unwrap()).unwrap()
    }

    #[test]
    fn test_heading_becomes_h1_and_title() {
        let page = render("# hi");
        assert!(page.contains("<h1>hi</h1>"));
        assert!(page.contains("<title>hi</title>"));
    }

    #[test]
    fn test_title_falls_back_to_filename() {
        let page = render("just text");
        assert!(page.contains("<title>index.md</title>"));
        assert!(page.contains("<p>just text</p>"));
    }

    #[test]
    fn test_keywords() {
        let page = render("title: Custom\ntheme: dark\n# heading\n");
        assert!(page.contains("<title>Custom</title>"));
        assert!(page.contains("#f0f0f0"));
        assert!(!page.contains("title: Custom"));
        assert!(page.contains("<h1>heading</h1>"));
    }

    #[test]
    fn test_tasklist() {
        let page = render("- [x] done\n- [ ] todo\n");
        assert!(page.contains("checkbox"));
    }

    #[test]
    fn test_invalid_utf8() {
        let theme = Theme::Gray;
        let ctx = RenderContext {
            filename: Path::new("bad.md"),
            theme: &theme,
            data: None,
        };
        let err = MarkdownRenderer.render(&ctx, &[0xff, 0xfe]).unwrap_err();
        assert_eq!(err.lang, Some(SourceLang::Markdown));
    }
}
