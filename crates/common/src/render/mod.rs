//! Renderer contract and the extension → renderer registry

mod markdown;

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::cache::DataBlock;
use crate::theme::Theme;

pub use markdown::MarkdownRenderer;

pub const HTML_UTF8: &str = "text/html; charset=utf-8";
pub const CSS_UTF8: &str = "text/css; charset=utf-8";
pub const JAVASCRIPT_UTF8: &str = "text/javascript; charset=utf-8";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Companion data file looked up next to sources of renderers that consume one.
pub const DATA_FILENAME: &str = "data.lua";

/// Extensions served as downloads. `.tar.*` entries are matched before the
/// plain extension.
pub const DOWNLOAD_EXTENSIONS: &[&str] = &[
    "", ".exe", ".com", ".elf", ".tgz", ".tar.gz", ".tbz2", ".tar.bz2", ".tar.xz", ".txz", ".gz",
    ".zip", ".7z", ".rar", ".arj", ".lz",
];

/// Source language of a failing file, used for error page titles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceLang {
    Lua,
    Css,
    Gcss,
    Scss,
    Html,
    Jsx,
    Amber,
    Pongo2,
    Markdown,
}

impl SourceLang {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceLang::Lua => "lua",
            SourceLang::Css => "css",
            SourceLang::Gcss => "gcss",
            SourceLang::Scss => "scss",
            SourceLang::Html => "html",
            SourceLang::Jsx => "jsx",
            SourceLang::Amber => "amber",
            SourceLang::Pongo2 => "pongo2",
            SourceLang::Markdown => "markdown",
        }
    }
}

impl Display for SourceLang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed transform. Never a panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderError {
    pub lang: Option<SourceLang>,
    pub message: String,
    /// 1-based line in the source, when known.
    pub line: Option<usize>,
}

impl RenderError {
    pub fn new(lang: impl Into<Option<SourceLang>>, message: impl Into<String>) -> Self {
        Self {
            lang: lang.into(),
            message: message.into(),
            line: None,
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

impl Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lang {
            Some(lang) => write!(f, "{} error: {}", lang, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RenderError {}

/// What a renderer gets to see besides the source bytes.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    /// Filesystem path of the source file.
    pub filename: &'a Path,
    pub theme: &'a Theme,
    /// The companion data file, for renderers that consume one.
    pub data: Option<&'a DataBlock>,
}

/// A pure transform from source bytes to response bytes.
pub trait Renderer: Send + Sync {
    fn content_type(&self) -> &str;

    fn render(&self, ctx: &RenderContext<'_>, source: &[u8]) -> Result<Vec<u8>, RenderError>;

    /// Whether a sibling [`DATA_FILENAME`] should be loaded and handed over.
    fn consumes_data_file(&self) -> bool {
        false
    }
}

/// Placeholder for a renderer that is not linked into this build.
#[derive(Debug, Clone)]
pub struct UnavailableRenderer {
    lang: SourceLang,
    content_type: &'static str,
    consumes_data_file: bool,
}

impl UnavailableRenderer {
    pub fn new(lang: SourceLang, content_type: &'static str) -> Self {
        Self {
            lang,
            content_type,
            consumes_data_file: false,
        }
    }

    pub fn with_data_file(mut self) -> Self {
        self.consumes_data_file = true;
        self
    }
}

impl Renderer for UnavailableRenderer {
    fn content_type(&self) -> &str {
        self.content_type
    }

    fn render(&self, _ctx: &RenderContext<'_>, _source: &[u8]) -> Result<Vec<u8>, RenderError> {
        Err(RenderError::new(
            self.lang,
            format!("no {} renderer is installed", self.lang),
        ))
    }

    fn consumes_data_file(&self) -> bool {
        self.consumes_data_file
    }
}

/// Request details exposed to a script.
#[derive(Debug, Clone, Copy)]
pub struct ScriptContext<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub root: &'a Path,
}

/// What a script produced. Headers and status are optional.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutput {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Embedded scripting runtime, supplied by the embedding program.
pub trait ScriptEngine: Send + Sync {
    /// Run the script at `path` for a request.
    fn run_file(&self, path: &Path, ctx: &ScriptContext<'_>) -> Result<ScriptOutput, RenderError>;

    /// Run a snippet of code, returning whatever it printed.
    fn run_string(&self, source: &str) -> Result<String, RenderError>;

    fn set_value(&self, name: &str, value: &str);

    fn value(&self, name: &str) -> Option<String>;
}

/// How the dispatcher should treat a file.
#[derive(Clone)]
pub enum Handling {
    /// Transform through a renderer.
    Render(Arc<dyn Renderer>),
    /// Serve as HTML, with auto-refresh applied.
    Html,
    /// Hand to the script engine.
    Script,
    /// Serve as an attachment.
    Download,
    /// Serve as-is with this content type.
    Static(String),
}

impl fmt::Debug for Handling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handling::Render(r) => write!(f, "Render({})", r.content_type()),
            Handling::Html => f.write_str("Html"),
            Handling::Script => f.write_str("Script"),
            Handling::Download => f.write_str("Download"),
            Handling::Static(ct) => write!(f, "Static({})", ct),
        }
    }
}

/// Lowercased extension with the leading dot, `""` when there is none.
/// `.tar.*` double extensions are kept whole.
pub fn extension_of(path: &Path) -> String {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
        return String::new();
    };
    if let Some(pos) = name.rfind(".tar.") {
        if pos > 0 && !name[pos + 5..].contains('.') {
            return name[pos..].to_string();
        }
    }
    match name.rfind('.') {
        Some(pos) if pos > 0 => name[pos..].to_string(),
        _ => String::new(),
    }
}

/// `Content-Type` for a static file, with a charset for textual types.
pub fn mime_for(ext: &str) -> String {
    let guess = mime_guess::from_ext(ext.trim_start_matches('.')).first_or_octet_stream();
    let essence = guess.essence_str();
    let textual = guess.type_() == mime_guess::mime::TEXT
        || matches!(
            essence,
            "application/javascript" | "application/json" | "application/xml"
        );
    if textual {
        format!("{}; charset=utf-8", essence)
    } else {
        essence.to_string()
    }
}

/// Maps normalized extensions to renderers.
#[derive(Clone)]
pub struct RendererRegistry {
    renderers: HashMap<String, Arc<dyn Renderer>>,
}

impl RendererRegistry {
    /// An empty registry: every file is served raw.
    pub fn empty() -> Self {
        Self {
            renderers: HashMap::new(),
        }
    }

    /// The built-in mappings. Template and stylesheet languages without a
    /// bundled implementation answer with a [`RenderError`] until a real
    /// renderer is registered in their place.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        let markdown: Arc<dyn Renderer> = Arc::new(MarkdownRenderer);
        registry.register_arc(".md", markdown.clone());
        registry.register_arc(".markdown", markdown);

        let amber: Arc<dyn Renderer> =
            Arc::new(UnavailableRenderer::new(SourceLang::Amber, HTML_UTF8).with_data_file());
        registry.register_arc(".amber", amber.clone());
        registry.register_arc(".amb", amber);

        let pongo2: Arc<dyn Renderer> =
            Arc::new(UnavailableRenderer::new(SourceLang::Pongo2, HTML_UTF8).with_data_file());
        for ext in [".po2", ".pongo2", ".tpl", ".tmpl"] {
            registry.register_arc(ext, pongo2.clone());
        }

        registry.register(".gcss", UnavailableRenderer::new(SourceLang::Gcss, CSS_UTF8));
        registry.register(".scss", UnavailableRenderer::new(SourceLang::Scss, CSS_UTF8));
        registry.register(".jsx", UnavailableRenderer::new(SourceLang::Jsx, JAVASCRIPT_UTF8));

        registry
    }

    pub fn register(&mut self, ext: &str, renderer: impl Renderer + 'static) {
        self.register_arc(ext, Arc::new(renderer));
    }

    pub fn register_arc(&mut self, ext: &str, renderer: Arc<dyn Renderer>) {
        self.renderers.insert(normalize_ext(ext), renderer);
    }

    pub fn get(&self, ext: &str) -> Option<Arc<dyn Renderer>> {
        self.renderers.get(&normalize_ext(ext)).cloned()
    }

    /// Decide how to serve `path`.
    pub fn resolve(&self, path: &Path) -> Handling {
        let ext = extension_of(path);
        if let Some(renderer) = self.renderers.get(&ext) {
            return Handling::Render(renderer.clone());
        }
        match ext.as_str() {
            ".html" | ".htm" => Handling::Html,
            ".lua" => Handling::Script,
            e if DOWNLOAD_EXTENSIONS.contains(&e) => Handling::Download,
            e => Handling::Static(mime_for(e)),
        }
    }
}

impl Default for RendererRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for RendererRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut exts: Vec<_> = self.renderers.keys().collect();
        exts.sort();
        f.debug_struct("RendererRegistry")
            .field("extensions", &exts)
            .finish()
    }
}

fn normalize_ext(ext: &str) -> String {
    let ext = ext.to_lowercase();
    if ext.is_empty() || ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}
