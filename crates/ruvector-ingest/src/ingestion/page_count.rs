//! Page and row counts used to slice documents into tasks

use calamine::Reader;

use crate::error::{Error, Result};

/// Number of pages in a PDF
pub fn pdf_page_count(name: &str, binary: &[u8]) -> Result<u32> {
    let doc = lopdf::Document::load_mem(binary)
        .map_err(|e| Error::file_parse(name, format!("Failed to load PDF: {}", e)))?;
    Ok(doc.get_pages().len() as u32)
}

/// Number of data rows in a CSV file or the first sheet of a workbook
pub fn table_row_count(name: &str, binary: &[u8]) -> Result<u32> {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    if matches!(extension.as_str(), "csv" | "txt") {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(binary);
        let mut rows = 0u32;
        for record in reader.records() {
            record.map_err(|e| Error::file_parse(name, e.to_string()))?;
            rows += 1;
        }
        return Ok(rows);
    }

    let cursor = std::io::Cursor::new(binary);
    let mut workbook = calamine::open_workbook_auto_from_rs(cursor)
        .map_err(|e| Error::file_parse(name, e.to_string()))?;
    let Some(sheet) = workbook.sheet_names().first().cloned() else {
        return Ok(0);
    };
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| Error::file_parse(name, e.to_string()))?;
    Ok(range.height().saturating_sub(1) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_row_count_excludes_header() {
        let csv = b"a,b\n1,2\n3,4\n5,6\n";
        assert_eq!(table_row_count("t.csv", csv).unwrap(), 3);
    }

    #[test]
    fn test_pdf_page_count() {
        let pages: Vec<String> = (1..=25).map(|i| format!("Page {} body", i)).collect();
        let pdf = crate::providers::mock::sample_pdf(&pages).unwrap();
        assert_eq!(pdf_page_count("sample.pdf", &pdf).unwrap(), 25);
    }

    #[test]
    fn test_invalid_pdf() {
        assert!(pdf_page_count("broken.pdf", b"not a pdf").is_err());
    }
}
