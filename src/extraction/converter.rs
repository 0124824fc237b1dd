//! Document conversion — bytes in, structured elements out.
//!
//! Converters are synchronous and CPU-bound; async callers go through
//! [`convert_blocking`] so conversion runs on the blocking pool.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ExtractionError;

/// Default page limit applied to every conversion.
pub const MAX_PAGES: usize = 100;
/// Default input size limit (20 MiB).
pub const MAX_FILE_SIZE: usize = 20 * 1024 * 1024;
/// Default chunk size for title-based chunking.
pub const DEFAULT_CHUNK_CHARACTERS: usize = 500;

/// Limits enforced before and during conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionLimits {
    pub max_pages: usize,
    pub max_file_size: usize,
}

impl Default for ConversionLimits {
    fn default() -> Self {
        Self {
            max_pages: MAX_PAGES,
            max_file_size: MAX_FILE_SIZE,
        }
    }
}

impl ConversionLimits {
    pub fn check_size(&self, size: usize) -> Result<(), ExtractionError> {
        if size > self.max_file_size {
            return Err(ExtractionError::InputTooLarge {
                size,
                max: self.max_file_size,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementKind {
    Title,
    NarrativeText,
    ListItem,
}

/// One structural element of a converted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub kind: ElementKind,
    pub text: String,
    /// 1-based page number.
    pub page: usize,
    /// Heading level for titles, 0 otherwise.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub level: u8,
}

fn is_zero(level: &u8) -> bool {
    *level == 0
}

impl Element {
    fn new(kind: ElementKind, text: impl Into<String>, page: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            page,
            level: 0,
        }
    }

    fn title(text: impl Into<String>, page: usize, level: u8) -> Self {
        Self {
            level,
            ..Self::new(ElementKind::Title, text, page)
        }
    }
}

/// A text chunk ready for embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
}

/// Result of a conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertedDocument {
    pub name: String,
    pub mime_type: String,
    pub pages: usize,
    pub elements: Vec<Element>,
}

impl ConvertedDocument {
    /// Render the document as markdown.
    pub fn to_markdown(&self) -> String {
        let mut blocks: Vec<String> = Vec::with_capacity(self.elements.len());
        let mut list: Vec<String> = Vec::new();
        for element in &self.elements {
            if element.kind == ElementKind::ListItem {
                list.push(format!("- {}", element.text));
                continue;
            }
            if !list.is_empty() {
                blocks.push(list.join("\n"));
                list.clear();
            }
            match element.kind {
                ElementKind::Title => {
                    let level = usize::from(element.level.clamp(1, 6));
                    blocks.push(format!("{} {}", "#".repeat(level), element.text));
                }
                _ => blocks.push(element.text.clone()),
            }
        }
        if !list.is_empty() {
            blocks.push(list.join("\n"));
        }
        blocks.join("\n\n")
    }

    /// One chunk per body element; consecutive list items form one chunk.
    /// Titles only structure the document and are not emitted.
    pub fn hierarchical_chunks(&self) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut list: Vec<&str> = Vec::new();
        for element in &self.elements {
            if element.kind == ElementKind::ListItem {
                list.push(&element.text);
                continue;
            }
            if !list.is_empty() {
                chunks.push(Chunk { text: list.join("\n") });
                list.clear();
            }
            if element.kind == ElementKind::NarrativeText {
                chunks.push(Chunk {
                    text: element.text.clone(),
                });
            }
        }
        if !list.is_empty() {
            chunks.push(Chunk { text: list.join("\n") });
        }
        chunks
    }
}

/// A section of text produced by [`chunk_by_title`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitledChunk {
    pub text: String,
    /// Page of the first element in the chunk.
    pub page: usize,
}

/// Group elements into sections starting at each title, then pack each
/// section into chunks of at most `max_characters`.
pub fn chunk_by_title(elements: &[Element], max_characters: usize) -> Vec<TitledChunk> {
    let max_characters = max_characters.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut page = 0;

    let flush = |current: &mut String, page: usize, chunks: &mut Vec<TitledChunk>| {
        if !current.is_empty() {
            chunks.push(TitledChunk {
                text: std::mem::take(current),
                page,
            });
        }
    };

    for element in elements {
        if element.kind == ElementKind::Title {
            flush(&mut current, page, &mut chunks);
        }
        for piece in split_chars(&element.text, max_characters) {
            let joined_len = current.chars().count() + 2 + piece.chars().count();
            if !current.is_empty() && joined_len > max_characters {
                flush(&mut current, page, &mut chunks);
            }
            if current.is_empty() {
                page = element.page;
            } else {
                current.push_str("\n\n");
            }
            current.push_str(piece);
        }
    }
    flush(&mut current, page, &mut chunks);
    chunks
}

/// Split `text` into pieces of at most `max` characters.
fn split_chars(text: &str, max: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in text.char_indices() {
        if count == max {
            pieces.push(&text[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Pluggable document converter.
pub trait Converter: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Convert `bytes`. `mime_type` may be absent, in which case the
    /// converter may infer it from `file_name`.
    fn convert(
        &self,
        file_name: &str,
        mime_type: Option<&str>,
        bytes: &[u8],
        limits: &ConversionLimits,
    ) -> Result<ConvertedDocument, ExtractionError>;
}

/// Run a conversion on the blocking pool.
pub async fn convert_blocking(
    converter: Arc<dyn Converter>,
    file_name: String,
    mime_type: Option<String>,
    bytes: Vec<u8>,
    limits: ConversionLimits,
) -> Result<ConvertedDocument, ExtractionError> {
    limits.check_size(bytes.len())?;
    tokio::task::spawn_blocking(move || {
        converter.convert(&file_name, mime_type.as_deref(), &bytes, &limits)
    })
    .await
    .map_err(|e| ExtractionError::Panicked(e.to_string()))?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextFormat {
    Plain,
    Markdown,
    Json,
}

/// Built-in converter for plain text, markdown and JSON inputs.
///
/// Form feeds separate pages. Markdown headings and list markers are
/// recognised in both text formats; in plain text a short single-line
/// paragraph without terminal punctuation is also treated as a title.
pub struct PlainTextConverter {
    heading: Regex,
    list_item: Regex,
}

impl PlainTextConverter {
    pub fn new() -> Self {
        Self {
            heading: Regex::new(r"^(#{1,6})\s+(.+?)\s*#*\s*$").unwrap(),
            list_item: Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+(.+)$").unwrap(),
        }
    }

    fn detect(file_name: &str, mime_type: Option<&str>) -> Option<(TextFormat, String)> {
        let mime = mime_type
            .map(|m| m.split(';').next().unwrap_or(m).trim().to_ascii_lowercase())
            .filter(|m| !m.is_empty() && m != "application/octet-stream");
        if let Some(mime) = mime {
            let format = match mime.as_str() {
                "text/markdown" | "text/x-markdown" => TextFormat::Markdown,
                "application/json" => TextFormat::Json,
                m if m.starts_with("text/") => TextFormat::Plain,
                _ => return None,
            };
            return Some((format, mime));
        }

        let ext = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "md" | "markdown" => Some((TextFormat::Markdown, "text/markdown".into())),
            "json" => Some((TextFormat::Json, "application/json".into())),
            "txt" | "text" | "csv" | "log" => Some((TextFormat::Plain, "text/plain".into())),
            _ => None,
        }
    }

    fn parse_page(&self, page_text: &str, page: usize, format: TextFormat, out: &mut Vec<Element>) {
        let mut paragraph: Vec<&str> = Vec::new();

        for line in page_text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                self.flush_paragraph(&mut paragraph, page, format, out);
                continue;
            }
            if let Some(caps) = self.heading.captures(trimmed) {
                self.flush_paragraph(&mut paragraph, page, format, out);
                // Capture 1 is at most six '#'.
                let level = caps[1].len() as u8;
                out.push(Element::title(&caps[2], page, level));
                continue;
            }
            if let Some(caps) = self.list_item.captures(line) {
                self.flush_paragraph(&mut paragraph, page, format, out);
                out.push(Element::new(ElementKind::ListItem, caps[1].trim(), page));
                continue;
            }
            paragraph.push(trimmed);
        }
        self.flush_paragraph(&mut paragraph, page, format, out);
    }

    fn flush_paragraph(
        &self,
        paragraph: &mut Vec<&str>,
        page: usize,
        format: TextFormat,
        out: &mut Vec<Element>,
    ) {
        if paragraph.is_empty() {
            return;
        }
        let text = paragraph.join(" ");
        paragraph.clear();
        if format == TextFormat::Plain && looks_like_title(&text) {
            out.push(Element::title(text, page, 1));
        } else {
            out.push(Element::new(ElementKind::NarrativeText, text, page));
        }
    }
}

impl Default for PlainTextConverter {
    fn default() -> Self {
        Self::new()
    }
}

fn looks_like_title(text: &str) -> bool {
    text.chars().count() <= 80
        && text.chars().next().is_some_and(char::is_uppercase)
        && !text.ends_with(['.', '!', '?', ':', ';', ','])
        && text.split_whitespace().count() <= 12
}

impl Converter for PlainTextConverter {
    fn name(&self) -> &str {
        "plain-text"
    }

    fn convert(
        &self,
        file_name: &str,
        mime_type: Option<&str>,
        bytes: &[u8],
        limits: &ConversionLimits,
    ) -> Result<ConvertedDocument, ExtractionError> {
        limits.check_size(bytes.len())?;
        let (format, mime) =
            Self::detect(file_name, mime_type).ok_or_else(|| ExtractionError::UnsupportedInput {
                backend: self.name().to_string(),
                mime_type: mime_type.unwrap_or("unknown").to_string(),
            })?;
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ExtractionError::Conversion(format!("{file_name} is not UTF-8: {e}")))?;

        if format == TextFormat::Json {
            let value: serde_json::Value = serde_json::from_str(text)?;
            return Ok(ConvertedDocument {
                name: file_name.to_string(),
                mime_type: mime,
                pages: 1,
                elements: vec![Element::new(
                    ElementKind::NarrativeText,
                    serde_json::to_string_pretty(&value)?,
                    1,
                )],
            });
        }

        let pages: Vec<&str> = text.split('\x0c').collect();
        if pages.len() > limits.max_pages {
            return Err(ExtractionError::TooManyPages {
                pages: pages.len(),
                max: limits.max_pages,
            });
        }

        let mut elements = Vec::new();
        for (idx, page_text) in pages.iter().enumerate() {
            self.parse_page(page_text, idx + 1, format, &mut elements);
        }

        Ok(ConvertedDocument {
            name: file_name.to_string(),
            mime_type: mime,
            pages: pages.len(),
            elements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(name: &str, mime: Option<&str>, body: &str) -> ConvertedDocument {
        PlainTextConverter::new()
            .convert(name, mime, body.as_bytes(), &ConversionLimits::default())
            .unwrap()
    }

    #[test]
    fn markdown_structure() {
        let doc = convert(
            "notes.md",
            Some("text/markdown"),
            "# Intro\n\nFirst line\ncontinues here.\n\n- one\n- two\n\n## Details ##\nBody.",
        );
        let kinds: Vec<ElementKind> = doc.elements.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ElementKind::Title,
                ElementKind::NarrativeText,
                ElementKind::ListItem,
                ElementKind::ListItem,
                ElementKind::Title,
                ElementKind::NarrativeText,
            ]
        );
        assert_eq!(doc.elements[1].text, "First line continues here.");
        assert_eq!(doc.elements[4].text, "Details");
        assert_eq!(doc.elements[4].level, 2);
        assert_eq!(
            doc.to_markdown(),
            "# Intro\n\nFirst line continues here.\n\n- one\n- two\n\n## Details\n\nBody."
        );
    }

    #[test]
    fn hierarchical_chunks_skip_titles_and_merge_lists() {
        let doc = convert("a.md", None, "# T\n\nPara.\n\n- a\n- b\n\nEnd.");
        let texts: Vec<String> = doc.hierarchical_chunks().into_iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["Para.", "a\nb", "End."]);
    }

    #[test]
    fn plain_text_titles_and_pages() {
        let doc = convert(
            "report.txt",
            Some("text/plain; charset=utf-8"),
            "Quarterly Report\n\nRevenue grew.\x0cAppendix\n\nNothing here.",
        );
        assert_eq!(doc.pages, 2);
        assert_eq!(doc.elements[0].kind, ElementKind::Title);
        assert_eq!(doc.elements[1].kind, ElementKind::NarrativeText);
        assert_eq!(doc.elements[2].page, 2);
    }

    #[test]
    fn json_is_pretty_printed() {
        let doc = convert("data.json", Some("application/json"), r#"{"a":1}"#);
        assert_eq!(doc.elements.len(), 1);
        assert_eq!(doc.elements[0].text, "{\n  \"a\": 1\n}");
    }

    #[test]
    fn rejects_unknown_types_and_limits() {
        let converter = PlainTextConverter::new();
        let limits = ConversionLimits::default();
        assert!(matches!(
            converter.convert("scan.pdf", Some("application/pdf"), b"%PDF", &limits),
            Err(ExtractionError::UnsupportedInput { .. })
        ));
        assert!(matches!(
            converter.convert("blob.bin", None, b"x", &limits),
            Err(ExtractionError::UnsupportedInput { .. })
        ));

        let small = ConversionLimits {
            max_pages: 2,
            max_file_size: 8,
        };
        assert!(matches!(
            converter.convert("a.txt", None, b"123456789", &small),
            Err(ExtractionError::InputTooLarge { size: 9, max: 8 })
        ));
        assert!(matches!(
            converter.convert("a.txt", None, b"a\x0cb\x0cc", &small),
            Err(ExtractionError::TooManyPages { pages: 3, max: 2 })
        ));
    }

    #[test]
    fn chunking_by_title_respects_sections_and_size() {
        let elements = vec![
            Element::title("A", 1, 1),
            Element::new(ElementKind::NarrativeText, "aaaa", 1),
            Element::title("B", 2, 1),
            Element::new(ElementKind::NarrativeText, "bbbbbbbbbbbb", 2),
        ];
        let chunks = chunk_by_title(&elements, 10);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["A\n\naaaa", "B", "bbbbbbbbbb", "bb"]);
        assert_eq!(chunks[1].page, 2);
    }

    #[tokio::test]
    async fn blocking_conversion() {
        let converter: Arc<dyn Converter> = Arc::new(PlainTextConverter::new());
        let doc = convert_blocking(
            converter,
            "a.md".into(),
            None,
            b"# Hi".to_vec(),
            ConversionLimits::default(),
        )
        .await
        .unwrap();
        assert_eq!(doc.elements[0].kind, ElementKind::Title);
    }
}
