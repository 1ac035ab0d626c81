//! Refinement backend: raw source bytes to normalized plain text.
//!
//! [`ExtractBackend`] picks a converter from the file extension:
//!
//! | Extension              | Converter                                   |
//! |------------------------|---------------------------------------------|
//! | `pdf`                  | `pdf-extract`                               |
//! | `docx`                 | `word/document.xml`, one paragraph per `w:p` |
//! | `pptx`                 | `ppt/slides/slideN.xml`, one paragraph per slide |
//! | `xlsx`                 | shared + inline strings, one paragraph per sheet |
//! | `md`, `markdown`, `txt`| UTF-8 validated passthrough                 |
//!
//! Every converter's output goes through [`normalize_text`]. Conversion is
//! CPU-bound and runs on the blocking pool.

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{Cursor, Read};
use thiserror::Error;
use zip::ZipArchive;

/// Cap on sheets read from one workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Cap on decompressed bytes read from one ZIP member.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: '{0}'")]
    Unsupported(String),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),

    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("text file is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("conversion task failed: {0}")]
    Task(String),
}

/// Converts one raw source file into normalized text.
#[async_trait]
pub trait RefinementBackend: Send + Sync {
    async fn convert(&self, filename: &str, bytes: Vec<u8>) -> Result<String, ExtractError>;
}

/// Local, in-process extraction for PDF, OOXML and text files.
pub struct ExtractBackend {
    max_file_bytes: u64,
}

impl ExtractBackend {
    pub fn new(max_file_bytes: u64) -> Self {
        Self { max_file_bytes }
    }
}

#[async_trait]
impl RefinementBackend for ExtractBackend {
    async fn convert(&self, filename: &str, bytes: Vec<u8>) -> Result<String, ExtractError> {
        let format = Format::from_filename(filename)
            .ok_or_else(|| ExtractError::Unsupported(extension(filename).to_string()))?;
        let size = bytes.len() as u64;
        if size > self.max_file_bytes {
            return Err(ExtractError::TooLarge {
                size,
                limit: self.max_file_bytes,
            });
        }

        let raw = tokio::task::spawn_blocking(move || format.extract(&bytes))
            .await
            .map_err(|e| ExtractError::Task(e.to_string()))??;
        Ok(normalize_text(&raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    Text,
}

impl Format {
    fn from_filename(filename: &str) -> Option<Self> {
        match extension(filename).to_ascii_lowercase().as_str() {
            "pdf" => Some(Format::Pdf),
            "docx" => Some(Format::Docx),
            "pptx" => Some(Format::Pptx),
            "xlsx" => Some(Format::Xlsx),
            "md" | "markdown" | "txt" | "text" => Some(Format::Text),
            _ => None,
        }
    }

    fn extract(self, bytes: &[u8]) -> Result<String, ExtractError> {
        match self {
            Format::Pdf => pdf_extract::extract_text_from_mem(bytes)
                .map_err(|e| ExtractError::Pdf(e.to_string())),
            Format::Docx => extract_docx(bytes),
            Format::Pptx => extract_pptx(bytes),
            Format::Xlsx => extract_xlsx(bytes),
            Format::Text => Ok(String::from_utf8(bytes.to_vec())?),
        }
    }
}

fn extension(filename: &str) -> &str {
    let base = filename.rsplit('/').next().unwrap_or(filename);
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext,
        _ => "",
    }
}

/// Canonical text form: LF line endings, no trailing whitespace, at most one
/// blank line between paragraphs, no leading/trailing blank lines.
pub fn normalize_text(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0usize;

    for line in unified.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_run > 0 { "\n\n" } else { "\n" });
        }
        blank_run = 0;
        out.push_str(line);
    }
    out
}

type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "{} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Members named `<prefix><N>.xml`, sorted by `N`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Text of every `<t>` element, joined per enclosing `paragraph` element.
/// Runs inside one paragraph are concatenated; paragraphs are separated by
/// a newline.
fn text_runs(xml: &[u8], paragraph: &[u8]) -> Result<String, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    let mut current = String::new();
    let mut paragraphs: Vec<String> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                } else if name.as_ref() == paragraph && !current.trim().is_empty() {
                    paragraphs.push(std::mem::take(&mut current));
                }
            }
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !current.trim().is_empty() {
        paragraphs.push(current);
    }
    Ok(paragraphs.join("\n"))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;
    text_runs(&xml, b"p")
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let slides = numbered_entries(&archive, "ppt/slides/slide");
    if slides.is_empty() {
        return Err(ExtractError::Ooxml("presentation has no slides".into()));
    }

    let mut out = Vec::with_capacity(slides.len());
    for name in slides {
        let xml = read_entry(&mut archive, &name)?;
        let text = text_runs(&xml, b"p")?;
        if !text.is_empty() {
            out.push(text);
        }
    }
    Ok(out.join("\n\n"))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        let xml = read_entry(&mut archive, "xl/sharedStrings.xml")?;
        shared_strings(&xml)?
    } else {
        Vec::new()
    };

    let mut out = Vec::new();
    for name in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_entry(&mut archive, &name)?;
        let cells = sheet_cells(&xml, &shared)?;
        if !cells.is_empty() {
            out.push(cells.join(" "));
        }
    }
    Ok(out.join("\n\n"))
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.push(current.take().unwrap_or_default()),
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                if let Some(s) = current.as_mut() {
                    let text = te
                        .unescape()
                        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                    s.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(PartialEq)]
enum CellKind {
    Shared,
    Inline,
    Other,
}

/// String cells of one worksheet, in document order. Numeric cells are
/// skipped.
fn sheet_cells(xml: &[u8], shared: &[String]) -> Result<Vec<String>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut cells = Vec::new();
    let mut kind = CellKind::Other;
    let mut in_value = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    let t = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.as_ref() == b"t")
                        .map(|a| a.value.into_owned());
                    kind = match t.as_deref() {
                        Some(b"s") => CellKind::Shared,
                        Some(b"inlineStr") => CellKind::Inline,
                        _ => CellKind::Other,
                    };
                }
                b"v" if kind == CellKind::Shared => in_value = true,
                b"t" if kind == CellKind::Inline => in_value = true,
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => kind = CellKind::Other,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te
                    .unescape()
                    .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                let value = raw.trim();
                match kind {
                    CellKind::Shared => {
                        if let Some(s) = value.parse::<usize>().ok().and_then(|i| shared.get(i)) {
                            cells.push(s.clone());
                        }
                    }
                    CellKind::Inline if !value.is_empty() => cells.push(value.to_string()),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut out);
            for (name, body) in entries {
                zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        out.into_inner()
    }

    fn backend() -> ExtractBackend {
        ExtractBackend::new(1024 * 1024)
    }

    #[test]
    fn test_normalize_text() {
        let raw = "Title  \r\n\r\n\r\n\r\nBody line\t\nnext\r\n\n\n";
        assert_eq!(normalize_text(raw), "Title\n\nBody line\nnext");
        assert_eq!(normalize_text("\n\n  \n"), "");
    }

    #[test]
    fn test_extension_lookup() {
        assert_eq!(extension("decks/q3.PPTX"), "PPTX");
        assert_eq!(extension("dir.v2/README"), "");
        assert_eq!(extension(".hidden"), "");
        assert_eq!(Format::from_filename("notes/a.MD"), Some(Format::Text));
        assert_eq!(Format::from_filename("image.png"), None);
    }

    #[tokio::test]
    async fn test_unsupported_extension() {
        let err = backend().convert("photo.png", vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(ext) if ext == "png"));
    }

    #[tokio::test]
    async fn test_invalid_pdf() {
        let err = backend().convert("a.pdf", b"not a pdf".to_vec()).await.unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[tokio::test]
    async fn test_invalid_zip_for_docx() {
        let err = backend().convert("a.docx", b"not a zip".to_vec()).await.unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[tokio::test]
    async fn test_oversized_input_rejected() {
        let err = ExtractBackend::new(4)
            .convert("a.txt", b"hello".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::TooLarge { size: 5, limit: 4 }));
    }

    #[tokio::test]
    async fn test_text_must_be_utf8() {
        let err = backend().convert("a.md", vec![0xff, 0xfe]).await.unwrap_err();
        assert!(matches!(err, ExtractError::Encoding(_)));
    }

    #[tokio::test]
    async fn test_docx_paragraphs() {
        let doc = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Quarterly</w:t></w:r><w:r><w:t xml:space="preserve"> review</w:t></w:r></w:p>
    <w:p><w:r><w:t>Revenue &amp; costs</w:t></w:r></w:p>
  </w:body>
</w:document>"#;
        let bytes = zip_with(&[("word/document.xml", doc)]);
        let text = backend().convert("report.docx", bytes).await.unwrap();
        assert_eq!(text, "Quarterly review\nRevenue & costs");
    }

    #[tokio::test]
    async fn test_pptx_slides_in_numeric_order() {
        let slide = |t: &str| {
            format!(
                r#"<p:sld xmlns:p="p" xmlns:a="a"><p:cSld><p:spTree><p:sp><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>"#,
                t
            )
        };
        let (s1, s2, s10) = (slide("one"), slide("two"), slide("ten"));
        let bytes = zip_with(&[
            ("ppt/slides/slide10.xml", s10.as_str()),
            ("ppt/slides/slide2.xml", s2.as_str()),
            ("ppt/slides/slide1.xml", s1.as_str()),
        ]);
        let text = backend().convert("deck.pptx", bytes).await.unwrap();
        assert_eq!(text, "one\n\ntwo\n\nten");
    }

    #[tokio::test]
    async fn test_xlsx_shared_and_inline_strings() {
        let shared = r#"<sst><si><t>Region</t></si><si><r><t>No</t></r><r><t>rth</t></r></si></sst>"#;
        let sheet = r#"<worksheet><sheetData><row>
            <c r="A1" t="s"><v>0</v></c>
            <c r="B1" t="s"><v>1</v></c>
            <c r="C1"><v>42</v></c>
            <c r="D1" t="inlineStr"><is><t>inline</t></is></c>
        </row></sheetData></worksheet>"#;
        let bytes = zip_with(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        let text = backend().convert("book.xlsx", bytes).await.unwrap();
        assert_eq!(text, "Region North inline");
    }
}
