//! n8n documentation knowledge: markdown cleanup, chunking and hit formatting
//! for the `n8n_docs` memory collection.

use cradle_memory::MemoryRecord;
use serde::{Deserialize, Serialize};

pub const DOCS_COLLECTION: &str = "n8n_docs";

const MAX_CHUNK_CHARS: usize = 1200;
const MIN_BREAK_CHARS: usize = 200;
const SNIPPET_CHARS: usize = 500;

/// One documentation search result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocHit {
    /// Page URL, or the source file when the chunk has no URL
    pub source: String,
    pub snippet: String,
    pub score: f64,
}

impl DocHit {
    pub fn from_record(record: &MemoryRecord) -> Self {
        let source = record
            .metadata_str("url")
            .filter(|url| !url.is_empty())
            .or_else(|| record.metadata_str("source_file"))
            .unwrap_or("unknown")
            .to_string();
        Self {
            source,
            snippet: snippet(&record.content),
            score: record.score,
        }
    }
}

fn snippet(content: &str) -> String {
    if content.chars().count() > SNIPPET_CHARS {
        let mut cut: String = content.chars().take(SNIPPET_CHARS).collect();
        cut.push('…');
        cut
    } else {
        content.to_string()
    }
}

/// Drop front matter, fenced code, images and blank lines; keep link text
pub fn clean_markdown(markdown: &str) -> String {
    let mut lines = Vec::new();
    let mut in_code = false;
    let mut in_front_matter = false;

    for (i, line) in markdown.lines().enumerate() {
        let trimmed = line.trim();
        if i == 0 && trimmed == "---" {
            in_front_matter = true;
            continue;
        }
        if in_front_matter {
            if trimmed == "---" {
                in_front_matter = false;
            }
            continue;
        }
        if trimmed.starts_with("```") {
            in_code = !in_code;
            continue;
        }
        if in_code || trimmed.is_empty() {
            continue;
        }
        let text = strip_links(trimmed);
        if !text.trim().is_empty() {
            lines.push(text.trim().to_string());
        }
    }
    lines.join("\n")
}

/// `![alt](src)` is removed, `[text](href)` becomes `text`
fn strip_links(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(open) = rest.find('[') {
        let image = open > 0 && rest[..open].ends_with('!');
        let Some(close) = rest[open..].find("](").map(|i| open + i) else {
            break;
        };
        let Some(end) = rest[close..].find(')').map(|i| close + i) else {
            break;
        };
        let before = if image { &rest[..open - 1] } else { &rest[..open] };
        out.push_str(before);
        if !image {
            out.push_str(&rest[open + 1..close]);
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Split into chunks of at most 1200 characters, preferring to break at a
/// newline when one falls far enough into the chunk
pub fn chunk_text(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let mut end = (start + MAX_CHUNK_CHARS).min(chars.len());
        if end < chars.len() {
            if let Some(newline) = chars[start..end].iter().rposition(|c| *c == '\n') {
                if newline > MIN_BREAK_CHARS {
                    end = start + newline;
                }
            }
        }
        let chunk: String = chars[start..end].iter().collect();
        if !chunk.trim().is_empty() {
            chunks.push(chunk.trim().to_string());
        }
        start = end;
    }
    chunks
}

/// `Source: <url>` blocks separated by blank lines
pub fn format_context(hits: &[DocHit]) -> String {
    hits.iter()
        .map(|hit| format!("Source: {}\n{}", hit.source, hit.snippet))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    #[test]
    fn test_clean_markdown() {
        let md = "---\ntitle: Cron\n---\n# Schedule Trigger\n\nSee [the docs](https://docs.n8n.io/x) here.\n![diagram](img.png)\n```js\nconst x = 1;\n```\nDone.";
        assert_eq!(clean_markdown(md), "# Schedule Trigger\nSee the docs here.\nDone.");
    }

    #[test]
    fn test_chunk_text_breaks_on_newline() {
        let line = "x".repeat(300);
        let text = vec![line.clone(); 6].join("\n");
        let chunks = chunk_text(&text);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.chars().count() <= MAX_CHUNK_CHARS));
        assert!(chunks[0].ends_with('x'));
        assert_eq!(chunks.concat().replace('\n', "").len(), 1800);
    }

    #[test]
    fn test_short_text_is_one_chunk() {
        assert_eq!(chunk_text("hello"), vec!["hello".to_string()]);
        assert!(chunk_text("").is_empty());
    }

    #[test]
    fn test_hit_source_and_snippet() {
        let mut meta = Map::new();
        meta.insert("url".into(), json!(""));
        meta.insert("source_file".into(), json!("nodes/cron.md"));
        let record = MemoryRecord::new(DOCS_COLLECTION, &"a".repeat(600), meta);

        let hit = DocHit::from_record(&record);
        assert_eq!(hit.source, "nodes/cron.md");
        assert!(hit.snippet.ends_with('…'));
        assert_eq!(hit.snippet.chars().count(), SNIPPET_CHARS + 1);

        let context = format_context(&[hit.clone(), hit]);
        assert!(context.starts_with("Source: nodes/cron.md\n"));
        assert_eq!(context.matches("\n\nSource: ").count(), 1);
    }
}
