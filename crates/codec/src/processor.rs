use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokenizers::tokenizer::AddedToken;
use tokenizers::Tokenizer;

use crate::encode::TokenLookup;
use crate::errors::{artifact, CodecError, Result};
use crate::vocabulary::{VocabularyRegistry, VocabularyResize, VocabularySnapshot};

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const VOCABULARY_FILE: &str = "vocabulary.json";
pub const SPECIAL_TOKENS_FILE: &str = "special_tokens.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub pad: String,
    pub eos: String,
    pub unk: String,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            pad: "<pad>".into(),
            eos: "</s>".into(),
            unk: "<unk>".into(),
        }
    }
}

/// Base sub-word tokenizer plus the growing vocabulary of structural tokens.
///
/// Every token registered in the vocabulary is mirrored into the tokenizer's
/// added vocabulary, so a tag such as `<s_menu>` is split out by the
/// tokenizer itself and always maps to exactly one id.
#[derive(Clone)]
pub struct Processor {
    tokenizer: Tokenizer,
    registry: VocabularyRegistry,
    special: SpecialTokens,
    pad_id: u32,
    eos_id: u32,
    unk_id: u32,
}

impl Processor {
    pub fn new(tokenizer: Tokenizer, special: SpecialTokens) -> Result<Self> {
        let registry = VocabularyRegistry::from_base(tokenizer.get_vocab(true));
        Self::assemble(tokenizer, registry, special)
    }

    pub fn from_tokenizer_file(path: &Path, special: SpecialTokens) -> Result<Self> {
        let tokenizer = load_tokenizer(path)?;
        Self::new(tokenizer, special)
    }

    fn assemble(
        mut tokenizer: Tokenizer,
        registry: VocabularyRegistry,
        special: SpecialTokens,
    ) -> Result<Self> {
        let lookup = |token: &str| {
            registry
                .token_to_id(token)
                .ok_or_else(|| CodecError::UnknownSpecialToken(token.to_string()))
        };
        let pad_id = lookup(&special.pad)?;
        let eos_id = lookup(&special.eos)?;
        let unk_id = lookup(&special.unk)?;

        // already part of the vocabulary, so their ids are reused
        tokenizer.add_special_tokens(&[
            AddedToken::from(special.pad.clone(), true),
            AddedToken::from(special.eos.clone(), true),
            AddedToken::from(special.unk.clone(), true),
        ]);

        let mut processor = Self {
            tokenizer,
            registry,
            special,
            pad_id,
            eos_id,
            unk_id,
        };
        processor.sync_added_tokens()?;
        Ok(processor)
    }

    pub fn registry(&self) -> &VocabularyRegistry {
        &self.registry
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    pub fn unk_id(&self) -> u32 {
        self.unk_id
    }

    pub fn vocab_size(&self) -> usize {
        self.registry.len()
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.registry.token_to_id(token)
    }

    pub fn prompt_end_id(&self) -> Option<u32> {
        self.registry.prompt_end_id()
    }

    pub fn set_prompt_end(&mut self, token: impl Into<String>) {
        self.registry.set_prompt_end(token);
    }

    /// See [`VocabularyRegistry::add_tokens`]. New tokens are also added to the
    /// tokenizer, which must hand out the same ids.
    pub fn add_tokens<S: AsRef<str>>(
        &mut self,
        tokens: &[S],
        model: &mut dyn VocabularyResize,
    ) -> Result<usize> {
        let added = self.registry.add_tokens(tokens, model)?;
        if added > 0 {
            self.sync_added_tokens()?;
        }
        Ok(added)
    }

    /// Tokenizes without truncation or padding.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.tokenizer.encode(text, false)?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Tokenizes to exactly `max_length` ids: longer input is truncated,
    /// shorter input is right-padded with the pad id.
    pub fn tokenize(&self, text: &str, max_length: usize) -> Result<Vec<u32>> {
        let mut ids = self.encode(text)?;
        ids.truncate(max_length);
        ids.resize(max_length, self.pad_id);
        Ok(ids)
    }

    /// Inverse of [`Processor::encode`]. Added tokens come back verbatim;
    /// pad, eos and unk are dropped when `skip_special` is set.
    pub fn decode(&self, ids: &[u32], skip_special: bool) -> Result<String> {
        let kept: Vec<u32> = if skip_special {
            ids.iter()
                .copied()
                .filter(|&id| id != self.pad_id && id != self.eos_id && id != self.unk_id)
                .collect()
        } else {
            ids.to_vec()
        };
        Ok(self.tokenizer.decode(&kept, false)?)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        self.tokenizer.save(dir.join(TOKENIZER_FILE), false)?;
        write_json(&dir.join(VOCABULARY_FILE), &self.registry.snapshot())?;
        write_json(&dir.join(SPECIAL_TOKENS_FILE), &self.special)?;
        Ok(())
    }

    /// The saved tokenizer already carries the added tokens; they are taken
    /// out of the base vocabulary and replayed from the snapshot so that the
    /// registry sees them as added.
    pub fn load(dir: &Path) -> Result<Self> {
        let tokenizer = load_tokenizer(&dir.join(TOKENIZER_FILE))?;
        let snapshot: VocabularySnapshot = read_json(&dir.join(VOCABULARY_FILE))?;
        let special: SpecialTokens = read_json(&dir.join(SPECIAL_TOKENS_FILE))?;

        let mut base = tokenizer.get_vocab(true);
        for token in &snapshot.added_tokens {
            base.remove(&token.content);
        }
        let registry = VocabularyRegistry::restore(base, &snapshot)?;
        Self::assemble(tokenizer, registry, special)
    }

    /// Adds every registered token the tokenizer does not know yet and checks
    /// that both sides agree on every id.
    fn sync_added_tokens(&mut self) -> Result<()> {
        let missing: Vec<AddedToken> = self
            .registry
            .added_tokens()
            .iter()
            .filter(|token| self.tokenizer.token_to_id(token).is_none())
            .map(|token| AddedToken::from(token.clone(), true))
            .collect();
        if !missing.is_empty() {
            self.tokenizer.add_tokens(&missing);
        }

        for token in self.registry.added_tokens() {
            let expected = self.registry.token_to_id(token);
            let assigned = self.tokenizer.token_to_id(token);
            if assigned != expected {
                return Err(CodecError::InvalidStructure(format!(
                    "added token '{}' has id {:?} in the tokenizer but {:?} in the vocabulary",
                    token, assigned, expected
                )));
            }
        }
        Ok(())
    }
}

impl TokenLookup for Processor {
    fn contains_added(&self, token: &str) -> bool {
        self.registry.contains_added(token)
    }
}

fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    if !path.is_file() {
        return Err(artifact(format!(
            "tokenizer json not found at {}",
            path.display()
        )));
    }
    Tokenizer::from_file(path).map_err(CodecError::from)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    if !path.is_file() {
        return Err(artifact(format!("{} not found", path.display())));
    }
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
