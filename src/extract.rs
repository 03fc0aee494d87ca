//! Plain-text extraction from uploaded documents

use crate::error::{Result, ServiceError};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::Read;
use tracing::debug;

/// Supported upload formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Docx,
    Txt,
}

impl FileKind {
    /// Detect the format from the filename extension
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = filename.rsplit('.').next()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(FileKind::Pdf),
            "docx" => Some(FileKind::Docx),
            "txt" => Some(FileKind::Txt),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Docx => "docx",
            FileKind::Txt => "txt",
        }
    }
}

/// Extract plain text from the uploaded bytes
pub fn extract_text(kind: FileKind, bytes: &[u8]) -> Result<String> {
    let text = match kind {
        FileKind::Pdf => extract_pdf(bytes)?,
        FileKind::Docx => extract_docx(bytes)?,
        FileKind::Txt => String::from_utf8(bytes.to_vec())
            .map_err(|e| ServiceError::Validation(format!("Extraction failed: {}", e)))?,
    };

    debug!(
        "Extracted {} characters from {} input",
        text.len(),
        kind.as_str()
    );
    Ok(text)
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| ServiceError::Validation(format!("Extraction failed: {}", e)))
}

/// DOCX is a zip archive; the body text lives in word/document.xml.
/// Paragraphs are concatenated with newlines.
fn extract_docx(bytes: &[u8]) -> Result<String> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| ServiceError::Validation(format!("Extraction failed: {}", e)))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| ServiceError::Validation(format!("Extraction failed: {}", e)))?
        .read_to_string(&mut xml)
        .map_err(|e| ServiceError::Validation(format!("Extraction failed: {}", e)))?;

    let mut reader = Reader::from_str(&xml);
    let mut out = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"w:t" => in_text = true,
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let piece = t
                    .unescape()
                    .map_err(|e| ServiceError::Validation(format!("Extraction failed: {}", e)))?;
                out.push_str(&piece);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ServiceError::Validation(format!("Extraction failed: {}", e)))
            }
            _ => {}
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_kind_detection() {
        assert_eq!(FileKind::from_filename("report.pdf"), Some(FileKind::Pdf));
        assert_eq!(FileKind::from_filename("Q4.DOCX"), Some(FileKind::Docx));
        assert_eq!(FileKind::from_filename("notes.txt"), Some(FileKind::Txt));
        assert_eq!(FileKind::from_filename("image.png"), None);
        assert_eq!(FileKind::from_filename("noextension"), None);
    }

    #[test]
    fn test_txt_extraction() {
        let text = extract_text(FileKind::Txt, "Q4 revenue was $2.5M".as_bytes()).unwrap();
        assert_eq!(text, "Q4 revenue was $2.5M");
    }

    #[test]
    fn test_txt_invalid_utf8_rejected() {
        let result = extract_text(FileKind::Txt, &[0xff, 0xfe, 0x00]);
        assert!(matches!(result, Err(ServiceError::Validation(_))));
    }

    fn docx_fixture(paragraphs: &[&str]) -> Vec<u8> {
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
            .collect();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"ns\"><w:body>{}</w:body></w:document>",
            body
        );

        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(xml.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_docx_paragraph_extraction() {
        let bytes = docx_fixture(&["First paragraph.", "Second paragraph."]);
        let text = extract_text(FileKind::Docx, &bytes).unwrap();
        assert_eq!(text, "First paragraph.\nSecond paragraph.\n");
    }

    #[test]
    fn test_docx_garbage_rejected() {
        let result = extract_text(FileKind::Docx, b"not a zip archive");
        assert!(matches!(result, Err(ServiceError::Validation(_))));
    }

    #[test]
    fn test_pdf_garbage_rejected() {
        let result = extract_text(FileKind::Pdf, b"not a pdf");
        assert!(matches!(result, Err(ServiceError::Validation(_))));
    }
}
