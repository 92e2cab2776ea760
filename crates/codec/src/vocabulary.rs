use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::encode::TokenLookup;
use crate::errors::{CodecError, Result};

pub type ResizeError = Box<dyn std::error::Error + Send + Sync>;

/// Implemented by whatever owns the embedding/output tables that must track
/// the vocabulary size.
pub trait VocabularyResize {
    fn resize_vocabulary(&mut self, new_size: usize) -> std::result::Result<(), ResizeError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedToken {
    pub content: String,
    pub id: u32,
}

/// Serialized form of the tokens registered on top of the base vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularySnapshot {
    pub added_tokens: Vec<AddedToken>,
    #[serde(default)]
    pub prompt_end_token: Option<String>,
}

/// Token string → id mapping that only ever grows.
///
/// The base vocabulary comes from the sub-word tokenizer. Added tokens take
/// the next free id in registration order and keep it for the lifetime of the
/// registry.
#[derive(Debug, Clone)]
pub struct VocabularyRegistry {
    token_to_id: HashMap<String, u32>,
    id_to_token: HashMap<u32, String>,
    added: Vec<String>,
    added_lookup: HashSet<String>,
    next_id: u32,
    prompt_end_token: Option<String>,
    prompt_end_id: Option<u32>,
}

impl VocabularyRegistry {
    pub fn from_base(base: HashMap<String, u32>) -> Self {
        let next_id = base.values().max().map(|max| max + 1).unwrap_or(0);
        let id_to_token = base.iter().map(|(token, id)| (*id, token.clone())).collect();
        Self {
            token_to_id: base,
            id_to_token,
            added: Vec::new(),
            added_lookup: HashSet::new(),
            next_id,
            prompt_end_token: None,
            prompt_end_id: None,
        }
    }

    /// Number of ids the model must be able to embed.
    pub fn len(&self) -> usize {
        self.next_id as usize
    }

    pub fn is_empty(&self) -> bool {
        self.next_id == 0
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    pub fn id_to_token(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(&id).map(String::as_str)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.token_to_id.contains_key(token)
    }

    /// Tokens registered on top of the base vocabulary, in registration order.
    pub fn added_tokens(&self) -> &[String] {
        &self.added
    }

    /// Registers every token not already known and resizes `model` when the
    /// vocabulary grew. Returns how many tokens were new.
    pub fn add_tokens<S: AsRef<str>>(
        &mut self,
        tokens: &[S],
        model: &mut dyn VocabularyResize,
    ) -> Result<usize> {
        let added = tokens
            .iter()
            .filter(|token| self.insert(token.as_ref()))
            .count();

        if added > 0 {
            let size = self.len();
            model
                .resize_vocabulary(size)
                .map_err(|err| CodecError::ResizeFailed {
                    size,
                    reason: err.to_string(),
                })?;
            self.refresh_prompt_end();
        }
        Ok(added)
    }

    /// Names the token that ends the decoder prompt. The id is looked up now
    /// and again after every growth.
    pub fn set_prompt_end(&mut self, token: impl Into<String>) {
        self.prompt_end_token = Some(token.into());
        self.refresh_prompt_end();
    }

    pub fn prompt_end_token(&self) -> Option<&str> {
        self.prompt_end_token.as_deref()
    }

    pub fn prompt_end_id(&self) -> Option<u32> {
        self.prompt_end_id
    }

    pub fn snapshot(&self) -> VocabularySnapshot {
        VocabularySnapshot {
            added_tokens: self
                .added
                .iter()
                .filter_map(|token| {
                    self.token_to_id(token).map(|id| AddedToken {
                        content: token.clone(),
                        id,
                    })
                })
                .collect(),
            prompt_end_token: self.prompt_end_token.clone(),
        }
    }

    /// Rebuilds a registry from a base vocabulary and a snapshot. Ids must come
    /// back exactly as they were saved.
    pub fn restore(base: HashMap<String, u32>, snapshot: &VocabularySnapshot) -> Result<Self> {
        let mut registry = Self::from_base(base);
        for token in &snapshot.added_tokens {
            if !registry.insert(&token.content) {
                return Err(CodecError::InvalidStructure(format!(
                    "added token '{}' collides with the base vocabulary",
                    token.content
                )));
            }
            let assigned = registry.token_to_id(&token.content);
            if assigned != Some(token.id) {
                return Err(CodecError::InvalidStructure(format!(
                    "added token '{}' restored with id {:?}, expected {}",
                    token.content, assigned, token.id
                )));
            }
        }
        if let Some(token) = &snapshot.prompt_end_token {
            registry.set_prompt_end(token.clone());
        }
        Ok(registry)
    }

    fn insert(&mut self, token: &str) -> bool {
        if self.token_to_id.contains_key(token) {
            return false;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.token_to_id.insert(token.to_string(), id);
        self.id_to_token.insert(id, token.to_string());
        self.added.push(token.to_string());
        self.added_lookup.insert(token.to_string());
        true
    }

    fn refresh_prompt_end(&mut self) {
        self.prompt_end_id = self
            .prompt_end_token
            .as_deref()
            .and_then(|token| self.token_to_id(token));
    }
}

impl TokenLookup for VocabularyRegistry {
    fn contains_added(&self, token: &str) -> bool {
        self.added_lookup.contains(token)
    }
}
