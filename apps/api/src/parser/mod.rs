//! Parser adapter: raw upload bytes in, cleaned masked UTF-8 text out.
//!
//! Accepted inputs: PDF, DOCX, DOC, TXT, and common image types (which only
//! succeed when an OCR hook is installed). Output text is NFC-normalized with
//! runs of whitespace collapsed to single spaces and paragraph breaks kept
//! as `\n\n`. Deterministic for identical bytes.

pub mod pii;

use unicode_normalization::UnicodeNormalization;

use crate::errors::AppError;
use crate::parser::pii::{mask_pii, ExtractedPii};

/// Upload size ceiling (10 MiB).
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Output of a successful parse. `text` is already PII-masked; originals
/// travel out-of-band in `pii` and go to the side map, never the store.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub text: String,
    pub mime: String,
    pub warnings: Vec<String>,
    pub pii: ExtractedPii,
}

/// Fallback used only when a PDF has an empty text layer or the input is an
/// image. The default installation has none and such inputs fail as Corrupt.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, bytes: &[u8]) -> Result<String, String>;
}

pub struct Parser {
    ocr: Option<Box<dyn OcrEngine>>,
}

impl Default for Parser {
    fn default() -> Self {
        Self { ocr: None }
    }
}

impl Parser {
    pub fn new(ocr: Option<Box<dyn OcrEngine>>) -> Self {
        Self { ocr }
    }

    /// `Parse(blob) → (text, mime, warnings)` per the adapter contract.
    pub fn parse(&self, bytes: &[u8], declared_mime: &str) -> Result<ParsedDocument, AppError> {
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(AppError::TooLarge {
                size: bytes.len(),
                limit: MAX_UPLOAD_BYTES,
            });
        }
        if bytes.is_empty() {
            return Err(AppError::Corrupt("empty upload".to_string()));
        }

        let mime = sniff_mime(bytes, declared_mime)?;
        let mut warnings = Vec::new();

        let raw = match mime.as_str() {
            "application/pdf" => {
                let text = pdf_extract::extract_text_from_mem(bytes)
                    .map_err(|e| AppError::Corrupt(format!("PDF parse failed: {e}")))?;
                if text.trim().is_empty() {
                    warnings.push("empty PDF text layer, falling back to OCR".to_string());
                    self.run_ocr(bytes)?
                } else {
                    text
                }
            }
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            | "application/msword" => extract_docx_text(bytes)?,
            "text/plain" => String::from_utf8_lossy(bytes).into_owned(),
            m if m.starts_with("image/") => {
                warnings.push(format!("image upload ({m}), using OCR"));
                self.run_ocr(bytes)?
            }
            other => return Err(AppError::UnsupportedType(other.to_string())),
        };

        let cleaned = clean_text(&raw);
        if cleaned.is_empty() {
            return Err(AppError::Corrupt("document contains no text".to_string()));
        }

        let (text, pii) = mask_pii(&cleaned);
        Ok(ParsedDocument {
            text,
            mime,
            warnings,
            pii,
        })
    }

    fn run_ocr(&self, bytes: &[u8]) -> Result<String, AppError> {
        match &self.ocr {
            Some(engine) => engine
                .recognize(bytes)
                .map_err(|e| AppError::Corrupt(format!("OCR failed: {e}"))),
            None => Err(AppError::Corrupt(
                "no text layer and no OCR engine installed".to_string(),
            )),
        }
    }
}

/// Resolves the effective MIME from magic bytes, trusting the declared type
/// only when the content is ambiguous (plain text).
fn sniff_mime(bytes: &[u8], declared: &str) -> Result<String, AppError> {
    if bytes.starts_with(b"%PDF-") {
        return Ok("application/pdf".to_string());
    }
    // DOCX is a zip container; legacy DOC uses the OLE2 magic.
    if bytes.starts_with(b"PK\x03\x04") {
        return Ok(
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document".to_string(),
        );
    }
    if bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) {
        return Ok("application/msword".to_string());
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Ok("image/jpeg".to_string());
    }
    if bytes.starts_with(b"\x89PNG") {
        return Ok("image/png".to_string());
    }

    let declared = declared
        .split(';')
        .next()
        .unwrap_or(declared)
        .trim()
        .to_ascii_lowercase();
    match declared.as_str() {
        "text/plain" | "" => {
            if std::str::from_utf8(bytes).is_ok() {
                Ok("text/plain".to_string())
            } else {
                Err(AppError::Corrupt("binary data declared as text".to_string()))
            }
        }
        "application/pdf"
        | "application/msword"
        | "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            // Declared as a document format but the magic did not match.
            Err(AppError::Corrupt(format!(
                "content does not match declared type {declared}"
            )))
        }
        other => Err(AppError::UnsupportedType(other.to_string())),
    }
}

fn extract_docx_text(bytes: &[u8]) -> Result<String, AppError> {
    let docx = docx_rs::read_docx(bytes)
        .map_err(|e| AppError::Corrupt(format!("DOCX parse failed: {e}")))?;

    let mut text = String::new();
    for child in &docx.document.children {
        if let docx_rs::DocumentChild::Paragraph(paragraph) = child {
            for child in &paragraph.children {
                if let docx_rs::ParagraphChild::Run(run) = child {
                    for child in &run.children {
                        match child {
                            docx_rs::RunChild::Text(t) => text.push_str(&t.text),
                            docx_rs::RunChild::Tab(_) => text.push(' '),
                            docx_rs::RunChild::Break(_) => text.push('\n'),
                            _ => {}
                        }
                    }
                }
            }
            text.push_str("\n\n");
        }
    }
    Ok(text)
}

/// NFC-normalizes and collapses whitespace. Two or more consecutive newlines
/// become one paragraph break (`\n\n`); all other whitespace runs become a
/// single space.
pub fn clean_text(raw: &str) -> String {
    let normalized: String = raw.nfc().collect();

    let mut out = String::with_capacity(normalized.len());
    for (i, paragraph) in normalized
        .split("\n\n")
        .map(|p| {
            p.split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|p| !p.is_empty())
        .enumerate()
    {
        if i > 0 {
            out.push_str("\n\n");
        }
        out.push_str(&paragraph);
    }
    out
}
