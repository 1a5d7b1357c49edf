//! Multi-format text extraction for uploaded documents (PDF, DOCX, HTML).
//!
//! Given raw bytes and a declared format, produces [`ParsedContent`]:
//! normalized UTF-8 text plus ordered structural segments. Parsing is pure
//! in `(bytes, PARSER_VERSION)`: identical input always yields identical
//! output. It never touches the cache or store; the orchestrator owns
//! those side effects.

use std::io::Read;

use scraper::{ElementRef, Html, Selector};

use crate::error::StageError;
use crate::models::{DocumentFormat, ParsedContent, Segment, SegmentKind};

/// Bump when segmentation or normalization rules change; cached parses
/// are keyed on it.
pub const PARSER_VERSION: &str = "parser-v1";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// HTML block-level elements that become segments.
const HTML_BLOCK_SELECTOR: &str = "p, h1, h2, h3, h4, h5, h6, li, td, th, pre, blockquote";

/// Parse raw bytes as the declared format.
pub fn parse_document(
    content_hash: &str,
    bytes: &[u8],
    format: DocumentFormat,
) -> Result<ParsedContent, StageError> {
    let pieces = match format {
        DocumentFormat::Pdf => parse_pdf(bytes)?,
        DocumentFormat::Docx => parse_docx(bytes)?,
        DocumentFormat::Html => parse_html(bytes)?,
    };
    assemble(content_hash, pieces)
}

/// Join segment texts with blank lines and compute offset ranges.
/// Fails with `EmptyContent` when nothing extractable remains.
fn assemble(
    content_hash: &str,
    pieces: Vec<(SegmentKind, String)>,
) -> Result<ParsedContent, StageError> {
    let mut text = String::new();
    let mut segments = Vec::new();

    for (kind, piece) in pieces {
        let trimmed = piece.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        let start = text.len();
        text.push_str(trimmed);
        segments.push(Segment {
            kind,
            start,
            end: text.len(),
        });
    }

    if text.is_empty() {
        return Err(StageError::EmptyContent);
    }

    Ok(ParsedContent {
        content_hash: content_hash.to_string(),
        text,
        segments,
        parser_version: PARSER_VERSION.to_string(),
    })
}

fn parse_pdf(bytes: &[u8]) -> Result<Vec<(SegmentKind, String)>, StageError> {
    if !bytes.starts_with(b"%PDF-") {
        return Err(StageError::CorruptInput("missing %PDF- header".to_string()));
    }
    let raw = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| StageError::CorruptInput(format!("pdf: {}", e)))?;

    // Page breaks surface as form feeds when the extractor emits them;
    // otherwise fall back to blank-line boundaries.
    let pieces: Vec<(SegmentKind, String)> = if raw.contains('\u{c}') {
        raw.split('\u{c}')
            .map(|p| (SegmentKind::Page, p.to_string()))
            .collect()
    } else {
        raw.split("\n\n")
            .map(|p| (SegmentKind::Page, p.to_string()))
            .collect()
    };
    Ok(pieces)
}

fn parse_docx(bytes: &[u8]) -> Result<Vec<(SegmentKind, String)>, StageError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| StageError::CorruptInput(format!("docx: {}", e)))?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| StageError::CorruptInput("docx: word/document.xml not found".to_string()))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| StageError::CorruptInput(format!("docx: {}", e)))?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(StageError::CorruptInput(
                "docx: word/document.xml exceeds size limit".to_string(),
            ));
        }
    }

    docx_paragraphs(&doc_xml)
}

/// Walk document.xml collecting `<w:t>` runs grouped by `<w:p>` paragraph.
fn docx_paragraphs(xml: &[u8]) -> Result<Vec<(SegmentKind, String)>, StageError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut paragraphs: Vec<(SegmentKind, String)> = Vec::new();
    let mut current = String::new();
    let mut in_paragraph = false;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => {
                    in_paragraph = true;
                    current.clear();
                }
                b"t" => in_text = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_text => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"p" if in_paragraph => {
                    paragraphs.push((SegmentKind::Paragraph, std::mem::take(&mut current)));
                    in_paragraph = false;
                }
                b"t" => in_text = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(StageError::CorruptInput(format!("docx xml: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    // Text outside any <w:p> (malformed but salvageable) becomes one paragraph
    if !current.is_empty() {
        paragraphs.push((SegmentKind::Paragraph, current));
    }

    Ok(paragraphs)
}

fn parse_html(bytes: &[u8]) -> Result<Vec<(SegmentKind, String)>, StageError> {
    let source = std::str::from_utf8(bytes)
        .map_err(|_| StageError::CorruptInput("html: invalid utf-8".to_string()))?;

    let doc = Html::parse_document(source);
    let selector = Selector::parse(HTML_BLOCK_SELECTOR)
        .map_err(|e| StageError::CorruptInput(format!("html selector: {}", e)))?;

    // A nested match (a <p> inside <blockquote>, a <li> under <td>) would
    // repeat its text in two segments; only the outermost match counts.
    let mut pieces: Vec<(SegmentKind, String)> = doc
        .select(&selector)
        .filter(|el| {
            !el.ancestors()
                .filter_map(ElementRef::wrap)
                .any(|a| selector.matches(&a))
        })
        .map(|el| (SegmentKind::Block, element_text(el)))
        .collect();

    // No block elements at all: fall back to the whole document as one block
    if pieces.iter().all(|(_, t)| t.trim().is_empty()) {
        pieces = vec![(SegmentKind::Block, element_text(doc.root_element()))];
    }

    Ok(pieces)
}

/// Text content of an element with `<script>` and `<style>` contents dropped.
fn element_text(el: ElementRef<'_>) -> String {
    let mut out = String::new();
    for node in el.descendants() {
        if let Some(text) = node.value().as_text() {
            let skipped = node
                .ancestors()
                .filter_map(ElementRef::wrap)
                .any(|a| matches!(a.value().name(), "script" | "style"));
            if !skipped {
                out.push_str(text);
                out.push(' ');
            }
        }
    }
    // Collapse runs of whitespace left behind by markup
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
