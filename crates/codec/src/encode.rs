//! Structured value → flat token string.

use std::collections::HashSet;

use crate::value::StructuredValue;

/// Joins sequence elements.
pub const SEPARATOR_TOKEN: &str = "<sep/>";
/// Map key whose value is emitted verbatim when it is the only entry.
pub const TEXT_SEQUENCE_KEY: &str = "text_sequence";

/// Start tag emitted for a map key.
pub fn start_tag(key: &str) -> String {
    format!("<s_{key}>")
}

/// End tag emitted for a map key.
pub fn end_tag(key: &str) -> String {
    format!("</s_{key}>")
}

/// Form under which a categorical leaf is registered as a single token.
pub fn categorical_tag(value: &str) -> String {
    format!("<{value}/>")
}

/// Answers whether a token has been registered as an added token.
pub trait TokenLookup {
    fn contains_added(&self, token: &str) -> bool;
}

impl TokenLookup for HashSet<String> {
    fn contains_added(&self, token: &str) -> bool {
        self.contains(token)
    }
}

/// Result of encoding one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoding {
    pub text: String,
    /// Key tags seen while encoding, first-seen order, no duplicates.
    pub discovered: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCodec {
    sort_keys: bool,
}

impl TokenCodec {
    pub fn new(sort_keys: bool) -> Self {
        Self { sort_keys }
    }

    pub fn sort_keys(&self) -> bool {
        self.sort_keys
    }

    /// Encodes `value` without touching any vocabulary. Newly seen key tags are
    /// returned in [`Encoding::discovered`] for the caller to register.
    pub fn encode(&self, value: &StructuredValue, lookup: &dyn TokenLookup) -> Encoding {
        let mut discovered = Discovered::default();
        let mut text = String::new();
        self.encode_into(value, lookup, &mut text, &mut discovered);
        Encoding {
            text,
            discovered: discovered.ordered,
        }
    }

    fn encode_into(
        &self,
        value: &StructuredValue,
        lookup: &dyn TokenLookup,
        out: &mut String,
        discovered: &mut Discovered,
    ) {
        match value {
            StructuredValue::Leaf(text) => {
                let tagged = categorical_tag(text);
                if lookup.contains_added(&tagged) {
                    out.push_str(&tagged);
                } else {
                    out.push_str(text);
                }
            }
            StructuredValue::Sequence(items) => {
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(SEPARATOR_TOKEN);
                    }
                    self.encode_into(item, lookup, out, discovered);
                }
            }
            StructuredValue::Map(entries) => {
                if let [(key, inner)] = entries.as_slice() {
                    if key == TEXT_SEQUENCE_KEY {
                        self.encode_into(inner, lookup, out, discovered);
                        return;
                    }
                }

                let mut ordered: Vec<&(String, StructuredValue)> = entries.iter().collect();
                if self.sort_keys {
                    ordered.sort_by(|a, b| b.0.cmp(&a.0));
                }

                for (key, inner) in ordered {
                    let open = start_tag(key);
                    let close = end_tag(key);
                    out.push_str(&open);
                    discovered.push(open);
                    discovered.push(close.clone());
                    self.encode_into(inner, lookup, out, discovered);
                    out.push_str(&close);
                }
            }
        }
    }
}

#[derive(Default)]
struct Discovered {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl Discovered {
    fn push(&mut self, token: String) {
        if self.seen.insert(token.clone()) {
            self.ordered.push(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> StructuredValue {
        StructuredValue::from_json_str(json).unwrap()
    }

    #[test]
    fn nested_maps_and_lists() {
        let value = parse(r#"{"menu": [{"nm": "latte", "cnt": "2"}, {"nm": "tea"}], "total": "9"}"#);
        let encoded = TokenCodec::new(false).encode(&value, &HashSet::new());
        assert_eq!(
            encoded.text,
            "<s_menu><s_nm>latte</s_nm><s_cnt>2</s_cnt><sep/><s_nm>tea</s_nm></s_menu><s_total>9</s_total>"
        );
    }

    #[test]
    fn sorted_keys_descend() {
        let value = parse(r#"{"a": "1", "c": "3", "b": "2"}"#);
        let encoded = TokenCodec::new(true).encode(&value, &HashSet::new());
        assert_eq!(encoded.text, "<s_c>3</s_c><s_b>2</s_b><s_a>1</s_a>");
    }

    #[test]
    fn text_sequence_is_verbatim() {
        let value = parse(r#"{"text_sequence": "already flat"}"#);
        let encoded = TokenCodec::new(true).encode(&value, &HashSet::new());
        assert_eq!(encoded.text, "already flat");
        assert!(encoded.discovered.is_empty());
    }

    #[test]
    fn text_sequence_with_siblings_is_an_ordinary_key() {
        let value = parse(r#"{"text_sequence": "x", "other": "y"}"#);
        let encoded = TokenCodec::new(false).encode(&value, &HashSet::new());
        assert_eq!(
            encoded.text,
            "<s_text_sequence>x</s_text_sequence><s_other>y</s_other>"
        );
    }

    #[test]
    fn categorical_leaves_use_registered_tags() {
        let value = parse(r#"{"label": "question", "text": "Name"}"#);
        let registered: HashSet<String> = [categorical_tag("question")].into_iter().collect();
        let encoded = TokenCodec::new(false).encode(&value, &registered);
        assert_eq!(
            encoded.text,
            "<s_label><question/></s_label><s_text>Name</s_text>"
        );
    }

    #[test]
    fn discovered_tags_are_unique_and_ordered() {
        let value = parse(r#"{"items": [{"k": "1"}, {"k": "2"}]}"#);
        let encoded = TokenCodec::new(false).encode(&value, &HashSet::new());
        assert_eq!(
            encoded.discovered,
            vec!["<s_items>", "</s_items>", "<s_k>", "</s_k>"]
        );
    }

    #[test]
    fn encoding_is_deterministic() {
        let value = parse(r#"{"z": {"y": ["1", "2"]}, "a": "b"}"#);
        let codec = TokenCodec::new(true);
        let lookup = HashSet::new();
        assert_eq!(codec.encode(&value, &lookup), codec.encode(&value, &lookup));
    }
}
