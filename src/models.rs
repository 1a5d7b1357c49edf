//! Core data models used throughout findex.
//!
//! These types represent the documents, parsed content, feature vectors,
//! classification results, and tasks that flow through the processing
//! pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported upload formats. Closed set: the parser dispatches on this,
/// there is no open-ended format registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Html,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Html => "html",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            "html" | "htm" => Some(DocumentFormat::Html),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "application/pdf",
            DocumentFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            DocumentFormat::Html => "text/html",
        }
    }

    /// Best-effort magic-byte sniff. Returns `None` for unrecognized bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF-") {
            return Some(DocumentFormat::Pdf);
        }
        if bytes.starts_with(b"PK\x03\x04") {
            return Some(DocumentFormat::Docx);
        }
        // HTML: first non-whitespace byte is '<' (skip a UTF-8 BOM if present)
        let rest = bytes.strip_prefix(b"\xef\xbb\xbf".as_slice()).unwrap_or(bytes);
        let first = rest.iter().find(|b| !b.is_ascii_whitespace());
        if first == Some(&b'<') {
            return Some(DocumentFormat::Html);
        }
        None
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable reference to uploaded content. Identity is `content_hash`
/// (sha256 of the raw bytes), never the filename: byte-identical uploads
/// collapse to one row.
#[derive(Debug, Clone)]
pub struct Document {
    pub content_hash: String,
    pub format: DocumentFormat,
    pub size_bytes: i64,
    pub original_filename: Option<String>,
    pub blob_path: String,
    pub received_at: i64,
}

/// Kind tag for a structural segment of parsed text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    /// A PDF page.
    Page,
    /// A DOCX paragraph.
    Paragraph,
    /// An HTML block element.
    Block,
}

/// One ordered structural segment: a byte range into the normalized text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub start: usize,
    pub end: usize,
}

/// Normalized text plus structural metadata derived from a [`Document`].
/// Pure in `(bytes, parser_version)`; cached by content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedContent {
    pub content_hash: String,
    pub text: String,
    pub segments: Vec<Segment>,
    pub parser_version: String,
}

/// Sparse term-weighted representation of a document. The `BTreeMap`
/// keeps term order deterministic so repeated extraction is bit-identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub content_hash: String,
    pub feature_version: String,
    pub terms: BTreeMap<String, f64>,
    pub token_count: u64,
}

/// Closed category set for financial documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    FinancialReport,
    Contract,
    Invoice,
    Other,
}

impl Label {
    pub const ALL: [Label; 4] = [
        Label::FinancialReport,
        Label::Contract,
        Label::Invoice,
        Label::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::FinancialReport => "financial-report",
            Label::Contract => "contract",
            Label::Invoice => "invoice",
            Label::Other => "other",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "financial-report" => Some(Label::FinancialReport),
            "contract" => Some(Label::Contract),
            "invoice" => Some(Label::Invoice),
            "other" => Some(Label::Other),
            _ => None,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable classification outcome. A new model or feature version
/// produces a new row, never an overwrite.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub content_hash: String,
    pub feature_version: String,
    pub model_version: String,
    pub label: Label,
    pub confidence: f64,
    pub needs_review: bool,
    pub classified_at: i64,
}

/// Pipeline stage of a task. Transitions are forward-only; `Failed` is
/// reachable from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStage {
    Queued,
    Parsing,
    Extracting,
    Classifying,
    Indexing,
    Done,
    Failed,
}

impl TaskStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStage::Queued => "queued",
            TaskStage::Parsing => "parsing",
            TaskStage::Extracting => "extracting",
            TaskStage::Classifying => "classifying",
            TaskStage::Indexing => "indexing",
            TaskStage::Done => "done",
            TaskStage::Failed => "failed",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStage::Queued),
            "parsing" => Some(TaskStage::Parsing),
            "extracting" => Some(TaskStage::Extracting),
            "classifying" => Some(TaskStage::Classifying),
            "indexing" => Some(TaskStage::Indexing),
            "done" => Some(TaskStage::Done),
            "failed" => Some(TaskStage::Failed),
            _ => None,
        }
    }

    /// Position in the forward order. `Failed` shares the terminal slot.
    pub fn ordinal(&self) -> u8 {
        match self {
            TaskStage::Queued => 0,
            TaskStage::Parsing => 1,
            TaskStage::Extracting => 2,
            TaskStage::Classifying => 3,
            TaskStage::Indexing => 4,
            TaskStage::Done | TaskStage::Failed => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStage::Done | TaskStage::Failed)
    }

    /// The stage that follows on success. Terminal stages have no successor.
    pub fn next(&self) -> Option<TaskStage> {
        match self {
            TaskStage::Queued => Some(TaskStage::Parsing),
            TaskStage::Parsing => Some(TaskStage::Extracting),
            TaskStage::Extracting => Some(TaskStage::Classifying),
            TaskStage::Classifying => Some(TaskStage::Indexing),
            TaskStage::Indexing => Some(TaskStage::Done),
            TaskStage::Done | TaskStage::Failed => None,
        }
    }
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One orchestrated run of a document through the pipeline. The versions
/// are captured at creation time; reprocessing under new versions means a
/// new task, leaving this one's history untouched.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    pub content_hash: String,
    pub current_stage: TaskStage,
    pub feature_version: String,
    pub model_version: String,
    /// Attempt count per stage, keyed by stage name.
    pub attempt_counts: BTreeMap<String, u32>,
    pub last_error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub fn attempts(&self, stage: TaskStage) -> u32 {
        self.attempt_counts
            .get(stage.as_str())
            .copied()
            .unwrap_or(0)
    }
}

/// A ranked search hit from the index.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub content_hash: String,
    pub label: String,
    pub confidence: f64,
    pub format: String,
    pub score: f64,
    pub snippet: String,
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub fn ts_to_datetime(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
}
