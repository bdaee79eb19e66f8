//! Document model and format detection.
//!
//! A [`Document`] is an immutable, named binary payload. Preprocessing never
//! mutates one in place; it produces a replacement with the same name via
//! [`Document::with_bytes`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Format of a document, derived from its file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Png,
    Jpeg,
    Docx,
    Doc,
    Txt,
    Xlsx,
    Xls,
    Csv,
    Html,
    Md,
}

impl DocumentKind {
    /// Detect the kind from a file name. Unknown extensions map to PDF.
    pub fn from_name(name: &str) -> Self {
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "png" => Self::Png,
            "jpg" | "jpeg" => Self::Jpeg,
            "docx" => Self::Docx,
            "doc" => Self::Doc,
            "txt" => Self::Txt,
            "xlsx" => Self::Xlsx,
            "xls" => Self::Xls,
            "csv" => Self::Csv,
            "html" | "htm" => Self::Html,
            "md" => Self::Md,
            _ => Self::Pdf,
        }
    }

    /// Format tag used in service attachment blocks.
    pub fn format_tag(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Docx => "docx",
            Self::Doc => "doc",
            Self::Txt => "txt",
            Self::Xlsx => "xlsx",
            Self::Xls => "xls",
            Self::Csv => "csv",
            Self::Html => "html",
            Self::Md => "md",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            Self::Doc => "application/msword",
            Self::Txt => "text/plain",
            Self::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            Self::Xls => "application/vnd.ms-excel",
            Self::Csv => "text/csv",
            Self::Html => "text/html",
            Self::Md => "text/markdown",
        }
    }

    /// Whether the kind is sent as an image block rather than a document block.
    pub fn is_image(self) -> bool {
        matches!(self, Self::Png | Self::Jpeg)
    }

    /// Whether the kind has pages that can be truncated.
    pub fn is_paginated(self) -> bool {
        matches!(self, Self::Pdf)
    }
}

/// A named binary payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    name: String,
    kind: DocumentKind,
    bytes: Bytes,
}

impl Document {
    /// Create a document, detecting its kind from the name.
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let name = name.into();
        let kind = DocumentKind::from_name(&name);
        Self {
            name,
            kind,
            bytes: bytes.into(),
        }
    }

    /// Create a document with an explicit kind.
    pub fn with_kind(name: impl Into<String>, kind: DocumentKind, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            kind,
            bytes: bytes.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Return a copy with the same name carrying replacement bytes.
    pub fn with_bytes(&self, bytes: impl Into<Bytes>, kind: DocumentKind) -> Self {
        Self {
            name: self.name.clone(),
            kind,
            bytes: bytes.into(),
        }
    }

    /// Name used for the attachment block (see [`clean_file_name`]).
    pub fn attachment_name(&self) -> String {
        clean_file_name(&self.name)
    }
}

/// Reduce a file name to characters the service accepts in block names.
///
/// Strips any directory and extension, keeps word characters, whitespace,
/// `-`, `(`, `)`, `[`, `]`, and collapses runs of whitespace. Falls back
/// to `"Document"` when nothing survives.
pub fn clean_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name);
    let stem = match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => base,
    };
    let kept: String = stem
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace() || "-()[]".contains(*c))
        .collect();
    let cleaned = kept.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        "Document".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_name() {
        assert_eq!(DocumentKind::from_name("a.PDF"), DocumentKind::Pdf);
        assert_eq!(DocumentKind::from_name("scan.jpg"), DocumentKind::Jpeg);
        assert_eq!(DocumentKind::from_name("report.xlsx"), DocumentKind::Xlsx);
        assert_eq!(DocumentKind::from_name("page.htm"), DocumentKind::Html);
        // Unknown and missing extensions fall back to pdf
        assert_eq!(DocumentKind::from_name("blob.bin"), DocumentKind::Pdf);
        assert_eq!(DocumentKind::from_name("README"), DocumentKind::Pdf);
    }

    #[test]
    fn test_kind_flags() {
        assert!(DocumentKind::Png.is_image());
        assert!(!DocumentKind::Pdf.is_image());
        assert!(DocumentKind::Pdf.is_paginated());
        assert_eq!(DocumentKind::Jpeg.format_tag(), "jpeg");
    }

    #[test]
    fn test_with_bytes_keeps_name() {
        let doc = Document::new("photo.png", vec![1u8, 2, 3]);
        let replaced = doc.with_bytes(vec![9u8], DocumentKind::Jpeg);
        assert_eq!(replaced.name(), "photo.png");
        assert_eq!(replaced.kind(), DocumentKind::Jpeg);
        assert_eq!(replaced.size(), 1);
        // Original untouched
        assert_eq!(doc.size(), 3);
    }

    #[test]
    fn test_clean_file_name() {
        assert_eq!(clean_file_name("dir/PO #123 (final).pdf"), "PO 123 (final)");
        assert_eq!(clean_file_name("Quote   v2.docx"), "Quote v2");
        assert_eq!(clean_file_name("C:\\tmp\\scan[1].png"), "scan[1]");
        assert_eq!(clean_file_name("###.pdf"), "Document");
    }
}
