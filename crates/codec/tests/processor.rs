use std::path::Path;

use anyhow::Result;
use codec::{
    decode, CodecError, Processor, ResizeError, SpecialTokens, StructuredValue, TokenCodec,
    VocabularyResize,
};
use tempfile::tempdir;
use tokenizers::Tokenizer;

struct SizeTracker {
    size: usize,
}

impl VocabularyResize for SizeTracker {
    fn resize_vocabulary(&mut self, new_size: usize) -> std::result::Result<(), ResizeError> {
        self.size = new_size;
        Ok(())
    }
}

fn write_tokenizer(dir: &Path) -> Result<Tokenizer> {
    let special = |id: u32, content: &str| {
        serde_json::json!({
            "id": id, "content": content, "single_word": false, "lstrip": false,
            "rstrip": false, "normalized": false, "special": true
        })
    };
    let tokenizer_json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [special(0, "<pad>"), special(1, "<unk>"), special(2, "</s>")],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {
                "<pad>": 0, "<unk>": 1, "</s>": 2,
                "iced": 3, "latte": 4, "tea": 5, "2": 6, "total": 7
            },
            "unk_token": "<unk>"
        }
    });
    let path = dir.join("base_tokenizer.json");
    std::fs::write(&path, serde_json::to_string_pretty(&tokenizer_json)?)?;
    Tokenizer::from_file(&path).map_err(|e| anyhow::anyhow!("cannot load tokenizer: {e}"))
}

fn processor(dir: &Path) -> Result<Processor> {
    Ok(Processor::new(write_tokenizer(dir)?, SpecialTokens::default())?)
}

#[test]
fn missing_special_token_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let special = SpecialTokens {
        pad: "<mask>".into(),
        ..SpecialTokens::default()
    };
    let err = Processor::new(write_tokenizer(dir.path())?, special)
        .err()
        .expect("construction should fail");
    assert!(matches!(err, CodecError::UnknownSpecialToken(token) if token == "<mask>"));
    Ok(())
}

#[test]
fn registered_tags_tokenize_to_single_ids() -> Result<()> {
    let dir = tempdir()?;
    let mut processor = processor(dir.path())?;
    let mut model = SizeTracker { size: 0 };

    let value = StructuredValue::from_json_str(r#"{"menu": {"nm": "iced latte", "cnt": "2"}}"#)?;
    let encoding = TokenCodec::new(false).encode(&value, &processor);
    let added = processor.add_tokens(&encoding.discovered, &mut model)?;
    assert_eq!(added, 6);
    assert_eq!(model.size, processor.vocab_size());

    let text = format!("{}</s>", encoding.text);
    let ids = processor.tokenize(&text, 16)?;
    let id = |token: &str| processor.token_to_id(token).expect("registered");
    assert_eq!(
        &ids[..10],
        &[
            id("<s_menu>"),
            id("<s_nm>"),
            3,
            4,
            id("</s_nm>"),
            id("<s_cnt>"),
            6,
            id("</s_cnt>"),
            id("</s_menu>"),
            processor.eos_id(),
        ]
    );
    assert!(ids[10..].iter().all(|&id| id == processor.pad_id()));
    Ok(())
}

#[test]
fn tokenize_truncates_to_max_length() -> Result<()> {
    let dir = tempdir()?;
    let processor = processor(dir.path())?;
    let ids = processor.tokenize("iced latte tea total", 2)?;
    assert_eq!(ids, vec![3, 4]);
    Ok(())
}

#[test]
fn decoded_ids_parse_back_to_the_value() -> Result<()> {
    let dir = tempdir()?;
    let mut processor = processor(dir.path())?;
    let mut model = SizeTracker { size: 0 };

    let value = StructuredValue::from_json_str(r#"{"nm": "tea", "total": "2"}"#)?;
    let encoding = TokenCodec::new(false).encode(&value, &processor);
    processor.add_tokens(&encoding.discovered, &mut model)?;

    let ids = processor.tokenize(&format!("{}</s>", encoding.text), 12)?;
    let text = processor.decode(&ids, true)?;
    // no decoder configured, so tokens come back space-joined
    assert_eq!(text, "<s_nm> tea </s_nm> <s_total> 2 </s_total>");
    assert_eq!(decode(&text, &processor), value);

    let kept = processor.decode(&ids, false)?;
    assert!(kept.contains("</s>") && kept.contains("<pad>"));
    Ok(())
}

#[test]
fn added_tokens_live_in_the_tokenizer() -> Result<()> {
    let dir = tempdir()?;
    let mut processor = processor(dir.path())?;
    let mut model = SizeTracker { size: 0 };
    processor.add_tokens(&["<s_menu>", "</s_menu>", "<sep/>"], &mut model)?;

    for token in ["<s_menu>", "</s_menu>", "<sep/>"] {
        assert_eq!(
            processor.tokenizer().token_to_id(token),
            processor.token_to_id(token)
        );
    }

    let saved = dir.path().join("processor");
    processor.save(&saved)?;
    let plain = Tokenizer::from_file(saved.join(codec::TOKENIZER_FILE))
        .map_err(|e| anyhow::anyhow!("cannot load tokenizer: {e}"))?;
    let text = "<s_menu>tea<sep/>iced latte</s_menu></s>";
    let encoding = plain
        .encode(text, false)
        .map_err(|e| anyhow::anyhow!("cannot encode: {e}"))?;
    assert_eq!(encoding.get_ids(), processor.encode(text)?.as_slice());
    assert_eq!(encoding.get_ids().len(), 7);
    Ok(())
}

#[test]
fn tokens_already_in_the_tokenizer_are_reused_on_load() -> Result<()> {
    let dir = tempdir()?;
    let mut processor = processor(dir.path())?;
    let mut model = SizeTracker { size: 0 };
    processor.add_tokens(&["<s_a>", "</s_a>"], &mut model)?;
    let saved = dir.path().join("processor");
    processor.save(&saved)?;

    let mut restored = Processor::load(&saved)?;
    assert_eq!(restored.registry().added_tokens(), ["<s_a>", "</s_a>"]);
    restored.add_tokens(&["<s_b>"], &mut model)?;
    assert_eq!(restored.token_to_id("<s_b>"), Some(processor.vocab_size() as u32));
    assert_eq!(
        restored.tokenizer().token_to_id("<s_b>"),
        restored.token_to_id("<s_b>")
    );
    Ok(())
}

#[test]
fn save_and_load_preserve_the_vocabulary() -> Result<()> {
    let dir = tempdir()?;
    let mut processor = processor(dir.path())?;
    let mut model = SizeTracker { size: 0 };
    processor.add_tokens(&["<s_docvqa>", "<s_answer>", "<yes/>"], &mut model)?;
    processor.set_prompt_end("<s_answer>");

    let saved = dir.path().join("processor");
    processor.save(&saved)?;
    let restored = Processor::load(&saved)?;

    assert_eq!(restored.vocab_size(), processor.vocab_size());
    assert_eq!(restored.prompt_end_id(), processor.prompt_end_id());
    assert_eq!(restored.token_to_id("<yes/>"), processor.token_to_id("<yes/>"));
    assert_eq!(
        restored.tokenize("<s_docvqa>tea<s_answer>", 4)?,
        processor.tokenize("<s_docvqa>tea<s_answer>", 4)?
    );
    Ok(())
}
