//! Extraction prompt.

use sha2::{Digest, Sha256};

use crate::types::document::DocumentRecord;
use crate::types::requirement::ExtractionRequirement;

/// Prompt for extracting every requirement target from one paper.
pub const EXTRACT_PROMPT: &str = r#"Extract the requested information from this research paper.

Paper: {title}
Authors: {authors}

Extract EVERY target below. If the paper does not contain the information
for a target, set its value to null and say so in "missing". Do not guess.

Targets:
{targets}

Output JSON:
{
    "targets": {
        "<target name>": <value in the requested format, or null>
    },
    "missing": ["names of targets the paper does not answer"]
}

Paper Content:
{content}"#;

/// Hash of the prompt template, for invalidating cached extractions when the
/// wording changes.
pub fn extract_prompt_hash() -> String {
    let mut hasher = Sha256::new();
    hasher.update(EXTRACT_PROMPT.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Format the extraction prompt for a paper and its full requirement set.
pub fn format_extract_prompt(
    record: &DocumentRecord,
    content: &str,
    requirements: &ExtractionRequirement,
) -> String {
    let targets = requirements
        .targets()
        .iter()
        .map(|t| {
            let required = if t.required { " (required)" } else { "" };
            format!("- {} [{}]{}: {}", t.name, t.format, required, t.description)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let authors = if record.authors.is_empty() {
        "unknown".to_string()
    } else {
        record.authors.join(", ")
    };

    fill_placeholders(
        EXTRACT_PROMPT,
        &[
            ("title", record.title.as_str()),
            ("authors", authors.as_str()),
            ("targets", targets.as_str()),
            ("content", content),
        ],
    )
}

/// Substitute `{name}` placeholders in one pass over the template. Inserted
/// values are never rescanned, and unknown braces are copied as-is.
fn fill_placeholders(template: &str, values: &[(&str, &str)]) -> String {
    let extra: usize = values.iter().map(|(_, v)| v.len()).sum();
    let mut out = String::with_capacity(template.len() + extra);
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let hit = values.iter().find(|(name, _)| {
            tail.strip_prefix(*name)
                .is_some_and(|after| after.starts_with('}'))
        });
        match hit {
            Some((name, value)) => {
                out.push_str(value);
                rest = &tail[name.len() + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}
