//! Prompt templates per analysis kind.
//!
//! Templates are opaque to the scheduler; the generator substitutes file
//! context into `{placeholder}` slots. Every template declares the
//! expected response format so the scorer can parse deterministically.

use crate::store::FileRecord;
use crate::types::AnalysisKind;

/// Shared response-format contract appended to candidate-producing prompts.
const CANDIDATE_FORMAT: &str = r#"Respond with a JSON object only, shaped exactly like:
{"candidates": [{"value": "...", "confidence": 0-100, "reasoning": "..."}]}
Order candidates from best to worst. Do not wrap the JSON in markdown."#;

const RENAME_TEMPLATE: &str = r#"You are a file-organization assistant. Propose up to 3 better filenames for this file.

File context:
- current name: {file_name}
- extension: {extension}
- size: {size_mb} MB
- relative path: {relative_path}
- type: {mime}
- modified (epoch seconds): {modified}

Keep the original extension. Prefer lowercase_with_underscores. Avoid dates unless clearly part of the content.
"#;

const CLASSIFICATION_TEMPLATE: &str = r#"You are a file-organization assistant. Assign this file to the single best category (e.g. finance, legal, media, code, personal, work).

File context:
- name: {file_name}
- extension: {extension}
- size: {size_mb} MB
- relative path: {relative_path}
- type: {mime}

Each candidate value is a category name.
"#;

const SUMMARY_TEMPLATE: &str = r#"You are a file-organization assistant. Write a one-to-two sentence summary of what this file likely contains.

File context:
- name: {file_name}
- extension: {extension}
- size: {size_mb} MB
- relative path: {relative_path}
- type: {mime}
- modified (epoch seconds): {modified}

Each candidate value is a summary sentence.
"#;

const METADATA_TEMPLATE: &str = r#"You are a file-organization assistant. Extract likely metadata fields for this file (author, date, topic, project) from its name and path.

File context:
- name: {file_name}
- extension: {extension}
- relative path: {relative_path}
- type: {mime}

Each candidate value is a compact "key: value" line.
"#;

const BATCH_HEADER: &str = r#"You are a file-organization assistant. Consider the following files together and propose the single best shared category or folder name for the group.

Files:
"#;

/// Build a combined prompt over a set of files for batch analysis.
///
/// Candidates apply to the group as a whole (e.g. a folder name), so the
/// per-file context is reduced to one line each.
pub fn batch_prompt(files: &[FileRecord]) -> String {
    let mut prompt = String::from(BATCH_HEADER);
    for file in files {
        prompt.push_str(&format!(
            "- {} ({}, {} MB, {})\n",
            file.name,
            file.extension,
            file.size_mb(),
            mime_type(&file.extension)
        ));
    }
    prompt.push('\n');
    prompt.push_str(CANDIDATE_FORMAT);
    prompt
}

/// Build the prompt for one (file, kind) pair.
pub fn prompt_for(kind: AnalysisKind, file: &FileRecord) -> String {
    let template = match kind {
        AnalysisKind::RenameSuggestions => RENAME_TEMPLATE,
        AnalysisKind::Classification => CLASSIFICATION_TEMPLATE,
        AnalysisKind::ContentSummary => SUMMARY_TEMPLATE,
        AnalysisKind::MetadataExtraction => METADATA_TEMPLATE,
    };
    format!("{}\n{CANDIDATE_FORMAT}", render(template, file))
}

/// Substitute file-context placeholders into a template.
fn render(template: &str, file: &FileRecord) -> String {
    template
        .replace("{file_name}", &file.name)
        .replace("{extension}", &file.extension)
        .replace("{size_mb}", &file.size_mb().to_string())
        .replace(
            "{relative_path}",
            file.relative_path.as_deref().unwrap_or(&file.path),
        )
        .replace("{mime}", mime_type(&file.extension))
        .replace("{modified}", &file.modified_at.to_string())
}

/// Coarse MIME classification by extension, for prompt context only.
pub fn mime_type(extension: &str) -> &'static str {
    match extension {
        "pdf" => "application/pdf",
        "doc" | "docx" => "application/msword",
        "xls" | "xlsx" => "application/vnd.ms-excel",
        "ppt" | "pptx" => "application/vnd.ms-powerpoint",
        "txt" | "md" | "rtf" | "odt" => "text/plain",
        "html" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "heic" => "image/*",
        "mp3" | "wav" | "flac" => "audio/*",
        "mp4" | "mov" | "mkv" => "video/*",
        "zip" | "tar" | "gz" | "7z" => "application/archive",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> FileRecord {
        FileRecord {
            id: 1,
            path: "/t/docs/project_report.pdf".to_owned(),
            name: "project_report.pdf".to_owned(),
            extension: "pdf".to_owned(),
            size_bytes: 2 * 1024 * 1024,
            modified_at: 1_700_000_000,
            parent_dir: "/t/docs".to_owned(),
            relative_path: Some("docs/project_report.pdf".to_owned()),
        }
    }

    #[test]
    fn test_placeholders_substituted() {
        let prompt = prompt_for(AnalysisKind::RenameSuggestions, &file());
        assert!(prompt.contains("project_report.pdf"));
        assert!(prompt.contains("- extension: pdf"));
        assert!(prompt.contains("- size: 2 MB"));
        assert!(prompt.contains("docs/project_report.pdf"));
        assert!(prompt.contains("application/pdf"));
        for placeholder in [
            "{file_name}",
            "{extension}",
            "{size_mb}",
            "{relative_path}",
            "{mime}",
            "{modified}",
        ] {
            assert!(
                !prompt.contains(placeholder),
                "unsubstituted placeholder {placeholder}"
            );
        }
    }

    #[test]
    fn test_every_kind_declares_response_format() {
        for kind in [
            AnalysisKind::RenameSuggestions,
            AnalysisKind::Classification,
            AnalysisKind::ContentSummary,
            AnalysisKind::MetadataExtraction,
        ] {
            let prompt = prompt_for(kind, &file());
            assert!(
                prompt.contains(r#""candidates""#),
                "{kind} prompt must declare the response shape"
            );
        }
    }

    #[test]
    fn test_batch_prompt_lists_every_file() {
        let mut second = file();
        second.name = "invoice_march.pdf".to_owned();
        let prompt = batch_prompt(&[file(), second]);
        assert!(prompt.contains("- project_report.pdf"));
        assert!(prompt.contains("- invoice_march.pdf"));
        assert!(prompt.contains(r#""candidates""#));
    }

    #[test]
    fn test_relative_path_falls_back_to_absolute() {
        let mut record = file();
        record.relative_path = None;
        let prompt = prompt_for(AnalysisKind::Classification, &record);
        assert!(prompt.contains("/t/docs/project_report.pdf"));
    }

    #[test]
    fn test_mime_classification() {
        assert_eq!(mime_type("pdf"), "application/pdf");
        assert_eq!(mime_type("jpg"), "image/*");
        assert_eq!(mime_type("zip"), "application/archive");
        assert_eq!(mime_type("xyz"), "application/octet-stream");
    }
}
