use codec::{SpecialTokens, StructuredValue, TokenLookup};

/// One scored unit of a document parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParsedItem {
    pub text: String,
    pub label: String,
}

impl ParsedItem {
    pub fn new(text: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            label: label.into(),
        }
    }
}

/// Turns a decoded token string (prediction or target) into scored items.
pub trait Postprocessor: Send + Sync {
    fn items(&self, sequence: &str, lookup: &dyn TokenLookup) -> Vec<ParsedItem>;

    /// Plain text used for edit-distance scoring.
    fn answer_text(&self, sequence: &str, lookup: &dyn TokenLookup) -> String {
        self.items(sequence, lookup)
            .into_iter()
            .map(|item| item.text)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Strips the prompt and special tokens, decodes the tag structure and
/// flattens it.
///
/// Everything before the prompt end is prompt. When the prompt end is a tag of
/// its own (`<s_answer>` after a `<s_docvqa>` task start) it opens the answer
/// region and is kept so that its end tag still pairs up.
///
/// A map carrying a `text` leaf is one item, labelled by its `label` leaf when
/// present. Any other leaf becomes an item labelled with the innermost key
/// around it.
#[derive(Debug, Clone)]
pub struct TagPostprocessor {
    prompt_end: String,
    keep_prompt_end: bool,
    removed: Vec<String>,
}

impl TagPostprocessor {
    pub fn new(special: &SpecialTokens, task_start: &str, prompt_end: &str) -> Self {
        let mut removed = vec![
            task_start.to_string(),
            special.eos.clone(),
            special.pad.clone(),
            special.unk.clone(),
        ];
        removed.retain(|token| !token.is_empty());
        Self {
            prompt_end: prompt_end.to_string(),
            keep_prompt_end: prompt_end != task_start,
            removed,
        }
    }

    fn strip(&self, sequence: &str) -> String {
        let answer = match sequence.find(&self.prompt_end) {
            Some(start) if !self.prompt_end.is_empty() => {
                if self.keep_prompt_end {
                    &sequence[start..]
                } else {
                    &sequence[start + self.prompt_end.len()..]
                }
            }
            _ => sequence,
        };
        let mut cleaned = answer.to_string();
        for token in &self.removed {
            cleaned = cleaned.replace(token.as_str(), "");
        }
        cleaned.trim().to_string()
    }
}

impl Postprocessor for TagPostprocessor {
    fn items(&self, sequence: &str, lookup: &dyn TokenLookup) -> Vec<ParsedItem> {
        let cleaned = self.strip(sequence);
        if cleaned.is_empty() {
            return Vec::new();
        }
        let parsed = codec::decode(&cleaned, lookup);
        let mut items = Vec::new();
        flatten(&parsed, codec::TEXT_SEQUENCE_KEY, &mut items);
        items
    }
}

fn flatten(value: &StructuredValue, enclosing: &str, out: &mut Vec<ParsedItem>) {
    match value {
        StructuredValue::Map(entries) => {
            if let Some(StructuredValue::Leaf(text)) = value.get("text") {
                let label = match value.get("label") {
                    Some(StructuredValue::Leaf(label)) => label.as_str(),
                    _ => enclosing,
                };
                if !text.trim().is_empty() {
                    out.push(ParsedItem::new(text.trim(), label));
                }
                return;
            }
            for (key, inner) in entries {
                flatten(inner, key, out);
            }
        }
        StructuredValue::Sequence(items) => {
            for item in items {
                flatten(item, enclosing, out);
            }
        }
        StructuredValue::Leaf(text) => {
            if !text.trim().is_empty() {
                out.push(ParsedItem::new(text.trim(), enclosing));
            }
        }
    }
}
