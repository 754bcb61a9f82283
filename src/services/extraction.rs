// src/services/extraction.rs

//! Plain text from uploaded documents. PDFs go through `pdf-extract`; Word files are
//! read straight from the `word/document.xml` part of the package.

use std::{
    io::{Cursor, Read},
    sync::LazyLock,
};

use regex::{Captures, Regex};

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("PDF extraction error: {0}")]
    Pdf(String),
    #[error("Word extraction error: {0}")]
    Word(String),
    #[error("Document type is not supported: {0}")]
    Unsupported(String),
}

static PARAGRAPH_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</w:p>|<w:br\b[^>]*/>|<w:cr\b[^>]*/>").expect("valid regex"));
static TAB: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<w:tab\s*/>").expect("valid regex"));
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(lt|gt|quot|apos|amp|#[0-9]+|#x[0-9a-fA-F]+);").expect("valid regex")
});

/// Extracts text on the blocking pool. An empty string means the document has no
/// text layer (a scanned PDF, for instance).
pub async fn extract_text(content_type: &str, bytes: Vec<u8>) -> Result<String, ExtractionError> {
    let content_type = content_type.to_string();

    tokio::task::spawn_blocking(move || match content_type.as_str() {
        "application/pdf" => extract_pdf(&bytes),
        "application/msword"
        | "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            extract_word(&bytes)
        }
        other => Err(ExtractionError::Unsupported(other.to_string())),
    })
    .await
    .map_err(|e| ExtractionError::Pdf(format!("extraction task failed: {}", e)))?
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractionError> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| ExtractionError::Pdf(e.to_string()))?;

    Ok(if text.trim().is_empty() { String::new() } else { text })
}

fn extract_word(bytes: &[u8]) -> Result<String, ExtractionError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractionError::Word(e.to_string()))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractionError::Word(e.to_string()))?
        .read_to_string(&mut xml)
        .map_err(|e| ExtractionError::Word(e.to_string()))?;

    Ok(document_xml_to_text(&xml))
}

/// Flattens WordprocessingML into lines of text.
fn document_xml_to_text(xml: &str) -> String {
    let text = PARAGRAPH_END.replace_all(xml, "\n");
    let text = TAB.replace_all(&text, "\t");
    let text = TAG.replace_all(&text, "");

    let text = ENTITY.replace_all(&text, |caps: &Captures| {
        decode_entity(&caps[1]).map_or_else(|| caps[0].to_string(), String::from)
    });

    text.trim().to_string()
}

/// Named XML entities and numeric character references. `None` for code points
/// that are not valid characters.
fn decode_entity(name: &str) -> Option<char> {
    match name {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "amp" => Some('&'),
        _ => {
            let code = match name.strip_prefix("#x") {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => name.strip_prefix('#')?.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}
