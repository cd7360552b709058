//! Parser registry and the reference chunking parsers

use async_trait::async_trait;
use calamine::Reader;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{ParserConfig, ParserKind, UNBOUNDED_PAGE};

use super::chunker::TextChunker;

/// Progress callback handed to parsers: `(progress, message)`
pub type ProgressFn<'a> = &'a (dyn Fn(Option<f32>, &str) -> Result<()> + Send + Sync);

/// Everything a parser needs to chunk one page range of a document
pub struct ParseRequest<'a> {
    pub name: &'a str,
    pub binary: &'a [u8],
    pub from_page: u32,
    pub to_page: u32,
    pub language: &'a str,
    pub kb_id: &'a str,
    pub tenant_id: &'a str,
    pub parser_config: &'a ParserConfig,
}

impl ParseRequest<'_> {
    /// Lowercased file extension
    pub fn extension(&self) -> String {
        self.name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default()
    }
}

/// One chunk as produced by a parser
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedChunk {
    pub content: String,
    /// 1-based pages the content came from
    pub page_num_int: Vec<u32>,
    /// Raw image bytes to be stored next to the chunk
    pub image: Option<Vec<u8>>,
}

impl ParsedChunk {
    pub fn text(content: impl Into<String>, pages: Vec<u32>) -> Self {
        Self {
            content: content.into(),
            page_num_int: pages,
            image: None,
        }
    }
}

/// A chunking routine for one parser kind
#[async_trait]
pub trait ChunkParser: Send + Sync {
    async fn chunk(&self, request: &ParseRequest<'_>, progress: ProgressFn<'_>) -> Result<Vec<ParsedChunk>>;

    /// Name for logging
    fn name(&self) -> &str;
}

/// Parser lookup keyed by parser kind, built once at startup
#[derive(Clone, Default)]
pub struct ParserRegistry {
    parsers: HashMap<ParserKind, Arc<dyn ChunkParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the reference parsers
    ///
    /// `naive` serves the text-like kinds, `one` keeps documents whole and
    /// `table` emits one chunk per row.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let naive: Arc<dyn ChunkParser> = Arc::new(NaiveParser);
        for kind in [
            ParserKind::Naive,
            ParserKind::Paper,
            ParserKind::Book,
            ParserKind::Laws,
            ParserKind::Manual,
            ParserKind::KnowledgeGraph,
        ] {
            registry.register(kind, Arc::clone(&naive));
        }
        registry.register(ParserKind::One, Arc::new(OneParser));
        registry.register(ParserKind::Table, Arc::new(TableParser));
        registry
    }

    pub fn register(&mut self, kind: ParserKind, parser: Arc<dyn ChunkParser>) {
        self.parsers.insert(kind, parser);
    }

    pub fn get(&self, kind: ParserKind) -> Result<Arc<dyn ChunkParser>> {
        self.parsers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::UnsupportedParser(kind.as_str().to_string()))
    }

    pub fn contains(&self, kind: ParserKind) -> bool {
        self.parsers.contains_key(&kind)
    }
}

/// Text of one page (1-based)
#[derive(Debug, Clone)]
struct PageText {
    page_number: u32,
    text: String,
}

/// Extract page text within `[from_page, to_page)`; non-PDF input is a single page
fn extract_pages(request: &ParseRequest<'_>) -> Result<Vec<PageText>> {
    if request.extension() != "pdf" {
        if request.from_page > 0 {
            return Ok(Vec::new());
        }
        return Ok(vec![PageText {
            page_number: 1,
            text: String::from_utf8_lossy(request.binary).into_owned(),
        }]);
    }

    let doc = lopdf::Document::load_mem(request.binary)
        .map_err(|e| Error::file_parse(request.name, format!("Failed to load PDF: {}", e)))?;

    let mut pages = Vec::new();
    for page_number in doc.get_pages().into_keys() {
        let index = page_number.saturating_sub(1);
        if index < request.from_page || index >= request.to_page {
            continue;
        }
        match doc.extract_text(&[page_number]) {
            Ok(text) => pages.push(PageText { page_number, text }),
            Err(e) => tracing::debug!("No text on page {} of {}: {}", page_number, request.name, e),
        }
    }
    Ok(pages)
}

/// Sentence-aware chunking of text and PDF documents
pub struct NaiveParser;

#[async_trait]
impl ChunkParser for NaiveParser {
    async fn chunk(&self, request: &ParseRequest<'_>, progress: ProgressFn<'_>) -> Result<Vec<ParsedChunk>> {
        progress(Some(0.1), "Start to parse.")?;
        let pages = extract_pages(request)?;
        progress(Some(0.4), &format!("Extracted text from {} page(s).", pages.len()))?;

        let chunker = TextChunker::new(request.parser_config.chunk_token_num())
            .with_delimiters(&request.parser_config.delimiter());

        let mut chunks = Vec::new();
        for page in &pages {
            for content in chunker.chunk(&page.text) {
                chunks.push(ParsedChunk::text(content, vec![page.page_number]));
            }
        }

        progress(Some(0.6), &format!("Finish parsing: {} chunk(s).", chunks.len()))?;
        Ok(chunks)
    }

    fn name(&self) -> &str {
        "naive"
    }
}

/// Whole document as a single chunk
pub struct OneParser;

#[async_trait]
impl ChunkParser for OneParser {
    async fn chunk(&self, request: &ParseRequest<'_>, progress: ProgressFn<'_>) -> Result<Vec<ParsedChunk>> {
        progress(Some(0.1), "Start to parse.")?;
        let pages = extract_pages(request)?;

        let page_numbers: Vec<u32> = pages.iter().map(|p| p.page_number).collect();
        let content = pages
            .iter()
            .map(|p| p.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        progress(Some(0.6), "Finish parsing.")?;
        if content.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![ParsedChunk::text(content, page_numbers)])
    }

    fn name(&self) -> &str {
        "one"
    }
}

/// One chunk per data row, rows addressed as `[from_page, to_page)`
pub struct TableParser;

impl TableParser {
    /// Header and data rows of a CSV or spreadsheet
    fn read_rows(request: &ParseRequest<'_>) -> Result<(Vec<String>, Vec<Vec<String>>)> {
        match request.extension().as_str() {
            "csv" | "txt" => {
                let mut reader = csv::ReaderBuilder::new()
                    .flexible(true)
                    .from_reader(request.binary);
                let header = reader
                    .headers()
                    .map_err(|e| Error::file_parse(request.name, e.to_string()))?
                    .iter()
                    .map(str::to_string)
                    .collect();
                let mut rows = Vec::new();
                for record in reader.records() {
                    let record = record.map_err(|e| Error::file_parse(request.name, e.to_string()))?;
                    rows.push(record.iter().map(str::to_string).collect());
                }
                Ok((header, rows))
            }
            _ => {
                let cursor = std::io::Cursor::new(request.binary);
                let mut workbook = calamine::open_workbook_auto_from_rs(cursor)
                    .map_err(|e| Error::file_parse(request.name, e.to_string()))?;
                let Some(sheet) = workbook.sheet_names().first().cloned() else {
                    return Ok((Vec::new(), Vec::new()));
                };
                let range = workbook
                    .worksheet_range(&sheet)
                    .map_err(|e| Error::file_parse(request.name, e.to_string()))?;

                let mut rows = range.rows().map(|row| {
                    row.iter()
                        .map(|cell| match cell {
                            calamine::Data::Empty => String::new(),
                            calamine::Data::String(s) => s.clone(),
                            calamine::Data::Float(f) => f.to_string(),
                            calamine::Data::Int(i) => i.to_string(),
                            calamine::Data::Bool(b) => b.to_string(),
                            calamine::Data::DateTime(dt) => dt.as_f64().to_string(),
                            calamine::Data::DateTimeIso(s) | calamine::Data::DurationIso(s) => s.clone(),
                            _ => String::new(),
                        })
                        .collect::<Vec<_>>()
                });
                let header = rows.next().unwrap_or_default();
                Ok((header, rows.collect()))
            }
        }
    }
}

#[async_trait]
impl ChunkParser for TableParser {
    async fn chunk(&self, request: &ParseRequest<'_>, progress: ProgressFn<'_>) -> Result<Vec<ParsedChunk>> {
        progress(Some(0.1), "Start to parse.")?;
        let (header, rows) = Self::read_rows(request)?;

        let from = request.from_page as usize;
        let to = (request.to_page.min(UNBOUNDED_PAGE) as usize).min(rows.len());
        let mut chunks = Vec::new();
        for row in rows.get(from..to).unwrap_or_default() {
            let content = header
                .iter()
                .zip(row.iter())
                .filter(|(_, value)| !value.trim().is_empty())
                .map(|(name, value)| format!("{}: {}", name.trim(), value.trim()))
                .collect::<Vec<_>>()
                .join("; ");
            if !content.is_empty() {
                chunks.push(ParsedChunk::text(content, Vec::new()));
            }
        }

        progress(Some(0.6), &format!("Finish parsing: {} row(s).", chunks.len()))?;
        Ok(chunks)
    }

    fn name(&self) -> &str {
        "table"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: Option<f32>, _: &str) -> Result<()> {
        Ok(())
    }

    fn request<'a>(name: &'a str, binary: &'a [u8], config: &'a ParserConfig, from: u32, to: u32) -> ParseRequest<'a> {
        ParseRequest {
            name,
            binary,
            from_page: from,
            to_page: to,
            language: "English",
            kb_id: "kb1",
            tenant_id: "t1",
            parser_config: config,
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ParserRegistry::with_defaults();
        assert_eq!(registry.get(ParserKind::Paper).unwrap().name(), "naive");
        assert_eq!(registry.get(ParserKind::Table).unwrap().name(), "table");
        assert!(matches!(
            registry.get(ParserKind::Audio),
            Err(Error::UnsupportedParser(_))
        ));
    }

    #[tokio::test]
    async fn test_naive_text() {
        let config = ParserConfig::default();
        let text = "First sentence here. Second sentence here.\nThird line.";
        let chunks = NaiveParser
            .chunk(&request("notes.txt", text.as_bytes(), &config, 0, UNBOUNDED_PAGE), &noop)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page_num_int, vec![1]);
        assert!(chunks[0].content.contains("Third line."));
    }

    #[tokio::test]
    async fn test_one_parser_keeps_whole_document() {
        let config = ParserConfig::default();
        let text = "word ".repeat(500);
        let chunks = OneParser
            .chunk(&request("big.md", text.as_bytes(), &config, 0, UNBOUNDED_PAGE), &noop)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_table_rows_slice() {
        let config = ParserConfig::default();
        let csv = "name,price\napple,1\npear,2\nplum,3\n";
        let chunks = TableParser
            .chunk(&request("fruit.csv", csv.as_bytes(), &config, 1, 3), &noop)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "name: pear; price: 2");
    }

    #[tokio::test]
    async fn test_progress_error_propagates() {
        let config = ParserConfig::default();
        let cancel = |_: Option<f32>, _: &str| -> Result<()> { Err(Error::Canceled) };
        let err = NaiveParser
            .chunk(&request("a.txt", b"text", &config, 0, UNBOUNDED_PAGE), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_canceled());
    }
}
