//! Agent transcript reading.
//!
//! The agent appends one JSON entry per line to its transcript. For
//! notifications the last assistant entry is more faithful than a scraped
//! screen, so its text blocks (and any question it asked) are preferred.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

const ASK_USER_TOOL: &str = "AskUserQuestion";

static QUESTION_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\?($|\s)|^\d+\.").expect("question start pattern is valid")
});

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: Option<EntryMessage>,
}

#[derive(Debug, Deserialize)]
struct EntryMessage {
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct AskInput {
    #[serde(default)]
    questions: Vec<Question>,
}

#[derive(Debug, Default, Deserialize)]
struct Question {
    #[serde(default)]
    question: String,
    #[serde(default)]
    options: Vec<QuestionOption>,
}

#[derive(Debug, Default, Deserialize)]
struct QuestionOption {
    #[serde(default)]
    label: String,
}

/// Content blocks of an assistant entry, or `None` for anything else.
fn assistant_blocks(line: &str) -> Option<Vec<Block>> {
    let entry: Entry = serde_json::from_str(line).ok()?;
    if entry.kind != "assistant" {
        return None;
    }
    let content = entry.message?.content;
    if !content.is_array() {
        return None;
    }
    let blocks: Vec<serde_json::Value> = serde_json::from_value(content).ok()?;
    Some(
        blocks
            .into_iter()
            .map(|b| serde_json::from_value(b).unwrap_or(Block::Other))
            .collect(),
    )
}

/// Text of one assistant entry. A pending question is rendered as the
/// question followed by `N. label` lines, and preamble before it is dropped.
fn render_blocks(blocks: Vec<Block>) -> Option<String> {
    let mut texts: Vec<String> = Vec::new();
    let mut has_question = false;

    for block in blocks {
        match block {
            Block::Text { text } if !text.is_empty() => texts.push(text),
            Block::ToolUse { name, input } if name == ASK_USER_TOOL && !input.is_null() => {
                has_question = true;
                let ask: AskInput = serde_json::from_value(input).unwrap_or_default();
                for question in ask.questions {
                    texts.push(question.question);
                    texts.extend(
                        question
                            .options
                            .iter()
                            .enumerate()
                            .map(|(idx, opt)| format!("{}. {}", idx + 1, opt.label)),
                    );
                }
            }
            _ => {}
        }
    }

    if has_question && texts.len() > 1 {
        if let Some(start) = texts.iter().position(|t| QUESTION_START.is_match(t)) {
            texts.drain(..start);
        }
    }

    (!texts.is_empty()).then(|| texts.join("\n"))
}

/// The most recent assistant message with any text in it.
///
/// Unreadable files and malformed lines yield `None` or are skipped.
pub fn last_assistant_message(path: &Path) -> Option<String> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "transcript unreadable");
            return None;
        }
    };

    contents
        .trim()
        .lines()
        .rev()
        .filter_map(assistant_blocks)
        .find_map(render_blocks)
}
