//! Output path layout.
//!
//! Files land at `{output_root}/{job_name}/{analysis_type}/{image_stem}.{ext}`.

use super::collaborators::{AnalysisType, OutputFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What to do when the output file already exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Overwrite,
    /// Append `-1`, `-2`, ... to the stem until the name is free.
    Suffix,
}

impl ConflictPolicy {
    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Some(Self::Overwrite),
            "suffix" => Some(Self::Suffix),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::Suffix => "suffix",
        }
    }
}

/// Replaces characters that would escape or split a path component.
fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// File stem of `source`, or `"image"` when it has none.
pub fn image_stem(source: &Path) -> String {
    source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

/// Builds the unresolved output path for one export item.
pub fn output_path(
    output_root: &Path,
    job_name: &str,
    analysis: &AnalysisType,
    stem: &str,
    format: OutputFormat,
) -> PathBuf {
    output_root
        .join(sanitize_component(job_name))
        .join(sanitize_component(analysis.as_str()))
        .join(format!("{}.{}", sanitize_component(stem), format.extension()))
}

/// `path` with `-{n}` appended to its stem. `n == 0` returns `path` itself.
pub fn suffixed_path(path: &Path, n: u32) -> PathBuf {
    if n == 0 {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    path.with_file_name(format!("{stem}-{n}{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let path = output_path(
            Path::new("/out"),
            "J1",
            &AnalysisType::new("histogram"),
            "beach",
            OutputFormat::Json,
        );
        assert_eq!(path, PathBuf::from("/out/J1/histogram/beach.json"));
    }

    #[test]
    fn test_job_name_cannot_escape_root() {
        let path = output_path(
            Path::new("/out"),
            "../etc",
            &AnalysisType::new("a/b"),
            "x",
            OutputFormat::Csv,
        );
        assert_eq!(path, PathBuf::from("/out/.._etc/a_b/x.csv"));
        let path = output_path(Path::new("/out"), "..", &AnalysisType::new("s"), "x", OutputFormat::Txt);
        assert_eq!(path, PathBuf::from("/out/_/s/x.txt"));
    }

    #[test]
    fn test_image_stem() {
        assert_eq!(image_stem(Path::new("/photos/IMG_0001.CR2")), "IMG_0001");
        assert_eq!(image_stem(Path::new("/")), "image");
    }

    #[test]
    fn test_suffixed_path() {
        let path = Path::new("/out/J1/histogram/beach.json");
        assert_eq!(suffixed_path(path, 0), path);
        assert_eq!(suffixed_path(path, 1), PathBuf::from("/out/J1/histogram/beach-1.json"));
        assert_eq!(suffixed_path(path, 12), PathBuf::from("/out/J1/histogram/beach-12.json"));
        assert_eq!(suffixed_path(Path::new("/out/raw"), 2), PathBuf::from("/out/raw-2"));
    }

    #[test]
    fn test_policy_keys() {
        assert_eq!(ConflictPolicy::from_key(" Suffix "), Some(ConflictPolicy::Suffix));
        assert_eq!(ConflictPolicy::from_key("overwrite"), Some(ConflictPolicy::Overwrite));
        assert_eq!(ConflictPolicy::from_key("rename"), None);
    }
}
