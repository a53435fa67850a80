//! Tool-call extraction from free-form model output, post-hoc over the
//! full text or incrementally per streamed delta.
//!
//! The incremental path is stateless: every call receives the full
//! previous/current accumulated text (and token-id history, for parsers
//! keyed on special token ids), and emits only what became newly visible.
//! Inside a tool block nothing is emitted until the block closes, so a
//! function name split across deltas is never half-parsed.

use serde_json::Value;
use tokenflow_common::{
    ChatCompletionRequest, DeltaFunctionCall, DeltaMessage, DeltaToolCall,
    ExtractedToolCallInfo, ToolCall,
};
use tracing::{info, trace, warn};

const HERMES_START: &str = "<tool_call>";
const HERMES_END: &str = "</tool_call>";
const MISTRAL_MARKER: &str = "[TOOL_CALLS]";

/// Accumulated state for one incremental extraction call, owned by the
/// streaming loop and passed in fresh each delta.
pub struct StreamingToolContext<'a> {
    pub previous_text: &'a str,
    pub current_text: &'a str,
    pub delta_text: &'a str,
    pub previous_token_ids: &'a [u32],
    pub current_token_ids: &'a [u32],
    pub delta_token_ids: &'a [u32],
}

/// Closed set of tool-call syntaxes, selected once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallParser {
    /// Qwen-family `<tool_call>{json}</tool_call>` blocks
    Hermes,
    /// `[TOOL_CALLS][{...}, ...]` JSON list
    Mistral,
}

impl ToolCallParser {
    /// Resolve the parser for a model: explicit override first, then a
    /// model-name heuristic, defaulting to Hermes.
    pub fn for_model(model_name: &str, override_name: Option<&str>) -> Self {
        if let Some(name) = override_name {
            match name.to_ascii_lowercase().as_str() {
                "mistral" => return ToolCallParser::Mistral,
                "hermes" | "qwen" => return ToolCallParser::Hermes,
                other => warn!(parser = other, "unknown tool parser override, using model heuristic"),
            }
        }
        let lower = model_name.to_ascii_lowercase();
        let parser = if lower.contains("mistral") || lower.contains("mixtral") {
            ToolCallParser::Mistral
        } else {
            ToolCallParser::Hermes
        };
        info!(model = model_name, parser = ?parser, "tool parser selected");
        parser
    }

    /// Extract tool calls from the complete generated text.
    pub fn extract_full(
        &self,
        output: &str,
        request: &ChatCompletionRequest,
    ) -> ExtractedToolCallInfo {
        let scan = self.scan(output);
        let mut content = scan.content;
        let mut tool_calls = Vec::new();

        for block in &scan.closed_blocks {
            match self.parse_block(block) {
                Some(calls) => tool_calls.extend(calls),
                None => {
                    warn!("unparseable tool-call block, returning it as content");
                    self.flush_block(&mut content, block, true);
                }
            }
        }
        if let Some(open) = &scan.open_block {
            // Generation ended mid-block; accept it if it already parses
            match self.parse_block(open) {
                Some(calls) => tool_calls.extend(calls),
                None => self.flush_block(&mut content, open, false),
            }
        }

        if request.parallel_tool_calls == Some(false) && tool_calls.len() > 1 {
            tool_calls.truncate(1);
        }

        let trimmed = content.trim();
        ExtractedToolCallInfo {
            tools_called: !tool_calls.is_empty(),
            content: if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            },
            tool_calls,
        }
    }

    /// Incremental extraction for one delta. Returns the message fragment
    /// that became visible with this delta, or `None` when everything is
    /// still buffered inside an unfinished tool block.
    pub fn extract_streaming(
        &self,
        ctx: &StreamingToolContext<'_>,
        request: &ChatCompletionRequest,
    ) -> Option<DeltaMessage> {
        if ctx.delta_text.is_empty() {
            return None;
        }
        trace!(
            previous_tokens = ctx.previous_token_ids.len(),
            current_tokens = ctx.current_token_ids.len(),
            delta_tokens = ctx.delta_token_ids.len(),
            "incremental tool-call scan"
        );

        let prev = self.scan(ctx.previous_text);
        let cur = self.scan(ctx.current_text);

        let mut delta = DeltaMessage::default();
        if cur.content.len() > prev.content.len() {
            delta.content = Some(cur.content[prev.content.len()..].to_string());
        }

        let mut fragments = Vec::new();
        let mut flushed = String::new();
        let mut index = self.call_count(&prev.closed_blocks);

        for block in &cur.closed_blocks[prev.closed_blocks.len()..] {
            match self.parse_block(block) {
                Some(calls) => {
                    for call in calls {
                        fragments.push(DeltaToolCall {
                            id: Some(call.id),
                            tool_type: Some("function".to_string()),
                            index,
                            function: Some(DeltaFunctionCall {
                                name: Some(call.function.name),
                                arguments: Some(call.function.arguments),
                            }),
                        });
                        index += 1;
                    }
                }
                None => {
                    warn!("unparseable tool-call block in stream, returning it as content");
                    self.flush_block(&mut flushed, block, true);
                }
            }
        }

        if !flushed.is_empty() {
            delta.content = Some(match delta.content.take() {
                Some(content) => content + &flushed,
                None => flushed,
            });
        }

        if request.parallel_tool_calls == Some(false) {
            fragments.retain(|fragment| fragment.index == 0);
        }
        delta.tool_calls = fragments;

        if delta.is_empty() {
            None
        } else {
            Some(delta)
        }
    }

    fn scan(&self, text: &str) -> Scan {
        match self {
            ToolCallParser::Hermes => scan_hermes(text),
            ToolCallParser::Mistral => scan_mistral(text),
        }
    }

    fn parse_block(&self, block: &str) -> Option<Vec<ToolCall>> {
        match self {
            ToolCallParser::Hermes => {
                let value: Value = serde_json::from_str(block.trim()).ok()?;
                Some(vec![tool_call_from_value(&value)?])
            }
            ToolCallParser::Mistral => {
                let values: Vec<Value> = serde_json::from_str(block.trim()).ok()?;
                values.iter().map(tool_call_from_value).collect()
            }
        }
    }

    fn call_count(&self, blocks: &[String]) -> usize {
        match self {
            ToolCallParser::Hermes => blocks.len(),
            ToolCallParser::Mistral => blocks
                .iter()
                .map(|block| self.parse_block(block).map_or(0, |calls| calls.len()))
                .sum(),
        }
    }

    fn flush_block(&self, content: &mut String, block: &str, closed: bool) {
        match self {
            ToolCallParser::Hermes => {
                content.push_str(HERMES_START);
                content.push_str(block);
                if closed {
                    content.push_str(HERMES_END);
                }
            }
            ToolCallParser::Mistral => {
                content.push_str(MISTRAL_MARKER);
                content.push_str(block);
            }
        }
    }
}

/// One pass over accumulated text: plain content outside tool blocks (with
/// a trailing partial start marker held back), the closed blocks in order,
/// and the tail of an unfinished block.
#[derive(Debug, Default)]
struct Scan {
    content: String,
    closed_blocks: Vec<String>,
    open_block: Option<String>,
}

fn scan_hermes(text: &str) -> Scan {
    let mut scan = Scan::default();
    let mut rest = text;
    loop {
        match rest.find(HERMES_START) {
            Some(start) => {
                scan.content.push_str(&rest[..start]);
                let after = &rest[start + HERMES_START.len()..];
                match after.find(HERMES_END) {
                    Some(end) => {
                        scan.closed_blocks.push(after[..end].to_string());
                        rest = &after[end + HERMES_END.len()..];
                    }
                    None => {
                        scan.open_block = Some(after.to_string());
                        return scan;
                    }
                }
            }
            None => {
                let visible = rest.len() - trailing_marker_prefix(rest, HERMES_START);
                scan.content.push_str(&rest[..visible]);
                return scan;
            }
        }
    }
}

fn scan_mistral(text: &str) -> Scan {
    let mut scan = Scan::default();
    let Some(start) = text.find(MISTRAL_MARKER) else {
        let visible = text.len() - trailing_marker_prefix(text, MISTRAL_MARKER);
        scan.content.push_str(&text[..visible]);
        return scan;
    };

    scan.content.push_str(&text[..start]);
    let region = &text[start + MISTRAL_MARKER.len()..];

    let mut values = serde_json::Deserializer::from_str(region).into_iter::<Value>();
    match values.next() {
        Some(Ok(value)) if value.is_array() => {
            let consumed = values.byte_offset();
            scan.closed_blocks.push(region[..consumed].to_string());
            scan.content.push_str(&region[consumed..]);
        }
        _ => scan.open_block = Some(region.to_string()),
    }
    scan
}

/// Length of the longest proper prefix of `marker` that `text` ends with.
/// Holding it back keeps a marker split across deltas out of the content.
fn trailing_marker_prefix(text: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(text.len());
    for len in (1..=max).rev() {
        let split = text.len() - len;
        if text.is_char_boundary(split) && marker.starts_with(&text[split..]) {
            return len;
        }
    }
    0
}

fn tool_call_from_value(value: &Value) -> Option<ToolCall> {
    let name = value.get("name")?.as_str()?.to_string();
    let arguments = match value.get("arguments").or_else(|| value.get("parameters")) {
        None => "{}".to_string(),
        Some(Value::String(raw)) => raw.clone(),
        Some(other) => other.to_string(),
    };
    Some(ToolCall::new(name, arguments))
}
