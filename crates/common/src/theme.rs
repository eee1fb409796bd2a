//! Built-in page themes and the themed page skeleton

use std::convert::Infallible;
use std::fmt::{self, Display};
use std::str::FromStr;

use askama::Template;

const GRAY_CSS: &str = "body { background-color: #e7eaed; color: #0b0b0b; font-family: 'Lato', sans-serif; font-weight: 300; margin: 4.5em; font-size: 1em; } a { color: #401010; font-family: courier; } a:hover { color: #801010; } a:active { color: yellow; } h1 { color: #101010; } img { max-width: 100%; }";

const DARK_CSS: &str = "body { background-color: #101010; color: #f0f0f0; font-family: 'Lato', sans-serif; font-weight: 400; margin: 4.5em; font-size: 1em; } a { color: #c0a0a0; font-family: courier; } a:hover { color: #f0a0a0; } a:active { color: yellow; } h1 { color: #f0f0f0; } img { max-width: 100%; }";

const BW_CSS: &str = "body { background-color: #ffffff; color: #000000; font-family: serif; margin: 4.5em; font-size: 1em; } a { color: #000000; text-decoration: underline; } a:hover { background-color: #000000; color: #ffffff; } h1 { border-bottom: 2px solid #000000; } img { max-width: 100%; }";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Theme {
    #[default]
    Gray,
    Dark,
    Bw,
    /// Anything ending in `.css` is linked as an external stylesheet.
    Stylesheet(String),
}

impl Theme {
    pub fn name(&self) -> &str {
        match self {
            Theme::Gray => "gray",
            Theme::Dark => "dark",
            Theme::Bw => "bw",
            Theme::Stylesheet(url) => url,
        }
    }

    /// Markup that goes into `<head>` to apply the theme.
    pub fn head_html(&self) -> String {
        match self {
            Theme::Gray => format!("<style>{}</style>", GRAY_CSS),
            Theme::Dark => format!("<style>{}</style>", DARK_CSS),
            Theme::Bw => format!("<style>{}</style>", BW_CSS),
            Theme::Stylesheet(url) => format!(
                "<link rel=\"stylesheet\" href=\"{}\">",
                html_escape::encode_double_quoted_attribute(url)
            ),
        }
    }

    /// Wrap `body_html` in a complete page using this theme.
    pub fn page(&self, title: &str, body_html: &str) -> Result<String, askama::Error> {
        ThemedPage {
            title,
            head: &self.head_html(),
            body: body_html,
            show_heading: true,
        }
        .render()
    }

    /// Like [`page`](Self::page), without repeating the title as a heading.
    pub fn bare_page(&self, title: &str, body_html: &str) -> Result<String, askama::Error> {
        ThemedPage {
            title,
            head: &self.head_html(),
            body: body_html,
            show_heading: false,
        }
        .render()
    }
}

impl FromStr for Theme {
    type Err = Infallible;

    /// Unknown names fall back to the default theme.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" | "default" | "light" | "gray" => Theme::Gray,
            "dark" => Theme::Dark,
            "bw" => Theme::Bw,
            css if css.ends_with(".css") => Theme::Stylesheet(css.to_string()),
            other => {
                tracing::warn!(theme = other, "unknown theme, using gray");
                Theme::Gray
            }
        })
    }
}

impl Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Template)]
#[template(path = "page.html")]
struct ThemedPage<'a> {
    title: &'a str,
    head: &'a str,
    body: &'a str,
    show_heading: bool,
}
