//! Flat token string → structured value, the inverse of [`crate::TokenCodec`].
//!
//! Decoding is lenient because it runs on model output: a start tag without a
//! matching end tag is dropped, empty nested structures are skipped and text
//! that carries no tags at all comes back as `{"text_sequence": text}`.

use std::sync::OnceLock;

use regex::Regex;

use crate::encode::{end_tag, TokenLookup, SEPARATOR_TOKEN, TEXT_SEQUENCE_KEY};
use crate::value::StructuredValue;

type Entries = Vec<(String, StructuredValue)>;

fn start_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<s_(.*?)>").expect("static start tag pattern"))
}

/// Decodes a generated or target token string back into a structured value.
pub fn decode(tokens: &str, lookup: &dyn TokenLookup) -> StructuredValue {
    let (mut maps, remainder) = parse_siblings(tokens, lookup);
    match maps.len() {
        0 => StructuredValue::Map(vec![(
            TEXT_SEQUENCE_KEY.to_string(),
            StructuredValue::Leaf(remainder),
        )]),
        1 => StructuredValue::Map(maps.remove(0)),
        _ => StructuredValue::Sequence(maps.into_iter().map(StructuredValue::Map).collect()),
    }
}

/// Parses maps separated by `<sep/>` at one nesting level. Returns the maps and
/// whatever text was left unparsed.
fn parse_siblings(tokens: &str, lookup: &dyn TokenLookup) -> (Vec<Entries>, String) {
    let mut output: Entries = Vec::new();
    let mut tokens = tokens.to_string();

    loop {
        let Some(captures) = start_tag_pattern().captures(&tokens) else {
            break;
        };
        let (open_start, open_end) = match captures.get(0) {
            Some(found) => (found.start(), found.end()),
            None => break,
        };
        let open = tokens[open_start..open_end].to_string();
        let key = captures
            .get(1)
            .map(|found| found.as_str().to_string())
            .unwrap_or_default();
        let close = end_tag(&key);

        let Some(close_pos) = tokens.find(&close) else {
            tokens = tokens.replace(&open, "");
            continue;
        };

        if let Some(relative) = tokens[open_end..].find(&close) {
            let content = tokens[open_end..open_end + relative].trim();
            if content.contains("<s_") && content.contains("</s_") {
                let (mut nested, _) = parse_siblings(content, lookup);
                match nested.len() {
                    0 => {}
                    1 => insert(&mut output, key, StructuredValue::Map(nested.remove(0))),
                    _ => insert(
                        &mut output,
                        key,
                        StructuredValue::Sequence(
                            nested.into_iter().map(StructuredValue::Map).collect(),
                        ),
                    ),
                }
            } else {
                let mut leaves: Vec<StructuredValue> = content
                    .split(SEPARATOR_TOKEN)
                    .map(|leaf| StructuredValue::Leaf(unwrap_categorical(leaf.trim(), lookup)))
                    .collect();
                let value = if leaves.len() == 1 {
                    leaves.remove(0)
                } else {
                    StructuredValue::Sequence(leaves)
                };
                insert(&mut output, key, value);
            }
        }

        tokens = tokens[close_pos + close.len()..].trim().to_string();
        if let Some(rest) = tokens.strip_prefix(SEPARATOR_TOKEN) {
            let (siblings, remainder) = parse_siblings(rest, lookup);
            let mut maps = vec![output];
            maps.extend(siblings);
            return (maps, remainder);
        }
    }

    if output.is_empty() {
        (Vec::new(), tokens)
    } else {
        (vec![output], tokens)
    }
}

fn insert(entries: &mut Entries, key: String, value: StructuredValue) {
    if let Some(slot) = entries.iter_mut().find(|(existing, _)| *existing == key) {
        slot.1 = value;
    } else {
        entries.push((key, value));
    }
}

fn unwrap_categorical(leaf: &str, lookup: &dyn TokenLookup) -> String {
    if leaf.len() > 3 && leaf.starts_with('<') && leaf.ends_with("/>") && lookup.contains_added(leaf)
    {
        leaf[1..leaf.len() - 2].to_string()
    } else {
        leaf.to_string()
    }
}
