//! Page manifests.
//!
//! A manifest is a JSONL file with one record per page: `{"id": 0, "path":
//! "pages/p0.png"}`. Page ids are stable integer indices chosen by the
//! caller; they determine processing priority (lowest first).

use tokio::fs;

use crate::prelude::*;

/// One page to OCR. Immutable once created.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PageEntry {
    /// Stable page index.
    pub id: u32,

    /// Where to find the page image. The transport resolves this to actual
    /// image data at dispatch time.
    pub path: PathBuf,
}

/// Read a page manifest from a JSONL file.
///
/// Blank lines are skipped. Duplicate ids are allowed here and deduplicated
/// at registration time, keeping the first occurrence.
pub async fn read_manifest(path: &Path) -> Result<Vec<PageEntry>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read manifest {:?}", path))?;
    parse_manifest(&text).with_context(|| format!("failed to parse manifest {:?}", path))
}

/// Parse manifest text. Split out for testability.
fn parse_manifest(text: &str) -> Result<Vec<PageEntry>> {
    let mut entries = vec![];
    for (line_idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry = serde_json::from_str::<PageEntry>(line)
            .with_context(|| format!("bad manifest record on line {}", line_idx + 1))?;
        entries.push(entry);
    }
    if entries.is_empty() {
        return Err(anyhow!("manifest contains no pages"));
    }
    Ok(entries)
}
