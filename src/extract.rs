//! Multi-format content extraction.
//!
//! Extractors are selected purely by file extension through a small
//! registry, all implementing the same contract: raw bytes in, plain UTF-8
//! text plus [`ParserMetadata`] out. Plain-text formats go through a UTF-8
//! decoder with a Latin-1 fallback; PDF and OOXML formats delegate to
//! `pdf-extract` and `zip` + `quick-xml`, then have their whitespace
//! normalized before returning.
//!
//! All failures here are fatal to the owning ingestion task: a parser that
//! rejected a document once will reject it every time.

use std::io::Read;

use crate::error::{PipelineError, Result};
use crate::models::ParserMetadata;

/// Zip-bomb protection: maximum decompressed bytes read from one ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Maximum worksheets processed per xlsx.
const XLSX_MAX_SHEETS: usize = 100;

struct RawExtraction {
    text: String,
    parser: &'static str,
    pages: Option<usize>,
}

type ExtractorFn = fn(&[u8]) -> Result<RawExtraction>;

/// Extensions accepted by the upload allow-list.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "csv", "json", "log", "pdf", "docx", "pptx", "xlsx",
];

fn extractor_for(extension: &str) -> Option<ExtractorFn> {
    match extension {
        "txt" | "md" | "markdown" | "csv" | "json" | "log" => Some(extract_plain_text),
        "pdf" => Some(extract_pdf),
        "docx" => Some(extract_docx),
        "pptx" => Some(extract_pptx),
        "xlsx" => Some(extract_xlsx),
        _ => None,
    }
}

/// Lower-cased extension of `filename`, or empty string.
pub fn file_extension(filename: &str) -> String {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Extract plain text and metadata from `bytes`.
///
/// Fails with [`PipelineError::UnsupportedFormat`] when no extractor is
/// registered for the extension, [`PipelineError::ExtractionFailed`] when
/// the format parser rejects the document, and
/// [`PipelineError::EmptyContent`] when parsing succeeds but yields no
/// usable text.
pub fn extract(bytes: &[u8], filename: &str) -> Result<(String, ParserMetadata)> {
    let extension = file_extension(filename);
    let extractor = extractor_for(&extension)
        .ok_or_else(|| PipelineError::UnsupportedFormat(extension.clone()))?;

    let raw = extractor(bytes)?;
    let text = normalize_whitespace(&raw.text);
    if text.is_empty() {
        return Err(PipelineError::EmptyContent);
    }

    let metadata = ParserMetadata {
        extension,
        parser: raw.parser.to_string(),
        pages: raw.pages,
    };
    Ok((text, metadata))
}

/// Collapse horizontal whitespace runs and limit blank-line runs to one.
fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if blank_run > 0 {
                out.push('\n');
            }
        }
        blank_run = 0;
        out.push_str(&collapsed);
    }
    out
}

// ============ Plain text ============

fn extract_plain_text(bytes: &[u8]) -> Result<RawExtraction> {
    let (text, parser) = match std::str::from_utf8(bytes) {
        Ok(s) => (s.to_string(), "utf8"),
        // Fallback decoding: treat every byte as a Latin-1 code point.
        Err(_) => (bytes.iter().map(|&b| b as char).collect(), "latin1"),
    };
    Ok(RawExtraction {
        text,
        parser,
        pages: None,
    })
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8]) -> Result<RawExtraction> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| PipelineError::ExtractionFailed(format!("pdf: {e}")))?;
    // pdf-extract separates pages with form feeds.
    let feeds = text.matches('\u{c}').count();
    let pages = if feeds > 0 { Some(feeds + 1) } else { None };
    Ok(RawExtraction {
        text: text.replace('\u{c}', "\n"),
        parser: "pdf-extract",
        pages,
    })
}

// ============ OOXML (docx / pptx / xlsx) ============

fn open_archive(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| PipelineError::ExtractionFailed(format!("ooxml: {e}")))
}

fn read_entry(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| PipelineError::ExtractionFailed(format!("ooxml: {name}: {e}")))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| PipelineError::ExtractionFailed(format!("ooxml: {name}: {e}")))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(PipelineError::ExtractionFailed(format!(
            "ooxml: entry {name} exceeds {MAX_XML_ENTRY_BYTES} byte limit"
        )));
    }
    Ok(out)
}

/// Entry names matching `prefix`/`suffix`, sorted by the numeric infix
/// (`slide2.xml` before `slide10.xml`).
fn numbered_entries(
    archive: &zip::ZipArchive<std::io::Cursor<&[u8]>>,
    prefix: &str,
    suffix: &str,
) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(suffix))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(suffix)
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Pull the character content of every `<t>` text run out of an OOXML part,
/// dropping all other markup. Word and PowerPoint both use `t` as the local
/// name of their text elements (`w:t`, `a:t`).
fn text_runs(xml: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_run = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                in_run = e.local_name().as_ref() == b"t";
            }
            Ok(quick_xml::events::Event::Text(t)) if in_run => {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(_)) => in_run = false,
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(PipelineError::ExtractionFailed(format!("ooxml xml: {e}"))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<RawExtraction> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;
    Ok(RawExtraction {
        text: text_runs(&xml)?,
        parser: "docx",
        pages: None,
    })
}

fn extract_pptx(bytes: &[u8]) -> Result<RawExtraction> {
    let mut archive = open_archive(bytes)?;
    let slides = numbered_entries(&archive, "ppt/slides/slide", ".xml");
    let slide_count = slides.len();
    let mut out = String::new();
    for name in slides {
        let xml = read_entry(&mut archive, &name)?;
        let text = text_runs(&xml)?;
        if !out.is_empty() && !text.is_empty() {
            out.push('\n');
        }
        out.push_str(&text);
    }
    Ok(RawExtraction {
        text: out,
        parser: "pptx",
        pages: Some(slide_count),
    })
}

fn extract_xlsx(bytes: &[u8]) -> Result<RawExtraction> {
    let mut archive = open_archive(bytes)?;
    let shared = read_shared_strings(&mut archive)?;
    let sheets = numbered_entries(&archive, "xl/worksheets/sheet", ".xml");
    let sheet_count = sheets.len().min(XLSX_MAX_SHEETS);
    let mut out = String::new();
    for name in sheets.into_iter().take(XLSX_MAX_SHEETS) {
        let xml = read_entry(&mut archive, &name)?;
        let cells = sheet_cells(&xml, &shared)?;
        if !out.is_empty() && !cells.is_empty() {
            out.push('\n');
        }
        out.push_str(&cells);
    }
    Ok(RawExtraction {
        text: out,
        parser: "xlsx",
        pages: Some(sheet_count),
    })
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>> {
    let xml = read_entry(archive, "xl/sharedStrings.xml")?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut depth_si = false;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    depth_si = true;
                    strings.push(String::new());
                }
                b"t" if depth_si => in_t = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(t)) if in_t => {
                if let Some(last) = strings.last_mut() {
                    last.push_str(t.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"si" => depth_si = false,
                b"t" => in_t = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(PipelineError::ExtractionFailed(format!(
                    "ooxml sharedStrings: {e}"
                )))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Resolve shared-string cells of one worksheet into space-joined text.
/// Inline numeric values are kept as-is.
fn sheet_cells(xml: &[u8], shared: &[String]) -> Result<String> {
    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut is_shared = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    is_shared = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" => in_value = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(t)) if in_value => {
                let v = t.unescape().unwrap_or_default();
                let v = v.trim();
                if !v.is_empty() {
                    if is_shared {
                        if let Ok(i) = v.parse::<usize>() {
                            if let Some(s) = shared.get(i) {
                                cells.push(s.clone());
                            }
                        }
                    } else {
                        cells.push(v.to_string());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"c" => is_shared = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(PipelineError::ExtractionFailed(format!(
                    "ooxml worksheet: {e}"
                )))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_extension_is_unsupported() {
        let err = extract(b"MZ\x90", "installer.exe").unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(ext) if ext == "exe"));
    }

    #[test]
    fn missing_extension_is_unsupported() {
        let err = extract(b"data", "README").unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
    }

    #[test]
    fn plain_text_passes_through() {
        let (text, meta) = extract("hello   world\n\n\n\nbye".as_bytes(), "notes.txt").unwrap();
        assert_eq!(text, "hello world\n\nbye");
        assert_eq!(meta.extension, "txt");
        assert_eq!(meta.parser, "utf8");
    }

    #[test]
    fn invalid_utf8_falls_back_to_latin1() {
        let bytes = b"caf\xe9 au lait";
        let (text, meta) = extract(bytes, "menu.txt").unwrap();
        assert_eq!(text, "café au lait");
        assert_eq!(meta.parser, "latin1");
    }

    #[test]
    fn whitespace_only_text_is_empty_content() {
        let err = extract(b"  \n\t \n ", "blank.txt").unwrap_err();
        assert!(matches!(err, PipelineError::EmptyContent));
    }

    #[test]
    fn corrupt_pdf_is_extraction_failed() {
        let err = extract(b"not a pdf", "report.pdf").unwrap_err();
        assert!(matches!(err, PipelineError::ExtractionFailed(_)));
    }

    #[test]
    fn corrupt_zip_is_extraction_failed_for_docx() {
        let err = extract(b"not a zip", "memo.docx").unwrap_err();
        assert!(matches!(err, PipelineError::ExtractionFailed(_)));
    }

    #[test]
    fn well_formed_pdf_is_not_misclassified() {
        // pdf-extract may or may not recover glyphs from a hand-built
        // minimal PDF, but it must parse it: the only acceptable outcomes
        // are extracted text or EmptyContent, never ExtractionFailed.
        let pdf = minimal_pdf("fixture test phrase");
        match extract(&pdf, "fixture.pdf") {
            Ok((_, meta)) => assert_eq!(meta.parser, "pdf-extract"),
            Err(PipelineError::EmptyContent) => {}
            Err(other) => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn docx_text_runs_are_extracted() {
        let docx = build_zip(&[(
            "word/document.xml",
            r#"<?xml version="1.0"?>
               <w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
                 <w:body><w:p><w:r><w:t>Design review notes</w:t></w:r></w:p>
                 <w:p><w:r><w:t>Action items follow</w:t></w:r></w:p></w:body>
               </w:document>"#,
        )]);
        let (text, meta) = extract(&docx, "review.docx").unwrap();
        assert!(text.contains("Design review notes"));
        assert!(text.contains("Action items follow"));
        assert_eq!(meta.parser, "docx");
    }

    #[test]
    fn pptx_slides_are_ordered_numerically() {
        let slide = |s: &str| {
            format!(
                r#"<p:sld xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main">
                   <a:t>{s}</a:t></p:sld>"#
            )
        };
        let pptx = build_zip(&[
            ("ppt/slides/slide10.xml", &slide("tenth")),
            ("ppt/slides/slide2.xml", &slide("second")),
            ("ppt/slides/slide1.xml", &slide("first")),
        ]);
        let (text, meta) = extract(&pptx, "deck.pptx").unwrap();
        let first = text.find("first").unwrap();
        let second = text.find("second").unwrap();
        let tenth = text.find("tenth").unwrap();
        assert!(first < second && second < tenth);
        assert_eq!(meta.pages, Some(3));
    }

    #[test]
    fn xlsx_resolves_shared_strings() {
        let xlsx = build_zip(&[
            (
                "xl/sharedStrings.xml",
                r#"<sst><si><t>alpha</t></si><si><t>beta</t></si></sst>"#,
            ),
            (
                "xl/worksheets/sheet1.xml",
                r#"<worksheet><sheetData>
                     <row><c t="s"><v>1</v></c><c t="s"><v>0</v></c><c><v>42</v></c></row>
                   </sheetData></worksheet>"#,
            ),
        ]);
        let (text, meta) = extract(&xlsx, "table.xlsx").unwrap();
        assert_eq!(text, "beta alpha 42");
        assert_eq!(meta.pages, Some(1));
    }

    fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        use std::io::Write;
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, content) in entries {
                writer.start_file(name.to_string(), options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    /// Minimal single-page PDF with a text-showing operator, built with
    /// correct xref byte offsets so pdf-extract can parse it.
    fn minimal_pdf(phrase: &str) -> Vec<u8> {
        let stream = format!("BT /F1 12 Tf 100 700 Td ({phrase}) Tj ET\n");
        let mut out = Vec::new();
        out.extend_from_slice(b"%PDF-1.4\n");
        let o1 = out.len();
        out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
        let o2 = out.len();
        out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
        let o3 = out.len();
        out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
        let o4 = out.len();
        out.extend_from_slice(
            format!(
                "4 0 obj << /Length {} >> stream\n{}endstream endobj\n",
                stream.len(),
                stream
            )
            .as_bytes(),
        );
        let o5 = out.len();
        out.extend_from_slice(
            b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
        );
        let xref_start = out.len();
        out.extend_from_slice(b"xref\n0 6\n");
        out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
        for offset in [o1, o2, o3, o4, o5] {
            out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
        }
        out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
        out.extend_from_slice(format!("{xref_start}\n").as_bytes());
        out.extend_from_slice(b"%%EOF\n");
        out
    }
}
