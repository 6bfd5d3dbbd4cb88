use crate::predictor::{EncoderKind, PredictorError, TextEncodings, TreePredictor};
use crate::tree::{Tree, TreeParseError};
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use thiserror::Error;

const CONTROL_TOKEN: &str = "prompt";

#[derive(Error, Debug)]
pub enum ControlParseError {
    #[error("Invalid prompt: {0}")]
    Tree(#[from] TreeParseError),
    #[error("Text encoding failed: {0}")]
    Encoding(#[from] PredictorError),
    #[error("{0} encodings do not match the parsed tree")]
    Inconsistent(EncoderKind),
}

/// Extracts the tree prompt from a `<header>:<prompt>` control
/// message. The header must contain `prompt`.
pub fn control_prompt(text: &str) -> Option<&str> {
    let (header, prompt) = text.split_once(':')?;
    header.contains(CONTROL_TOKEN).then_some(prompt)
}

/// Immutable prompt state: a tree and the text encodings computed from it.
#[derive(Debug)]
pub struct Configuration {
    prompt: String,
    tree: Tree,
    clip_encodings: TextEncodings,
    owl_encodings: TextEncodings,
}

impl Configuration {
    pub fn build(predictor: &dyn TreePredictor, prompt: &str) -> Result<Self, ControlParseError> {
        let tree = Tree::from_prompt(prompt)?;
        let clip_encodings = predictor.encode_text(&tree, EncoderKind::Clip)?;
        let owl_encodings = predictor.encode_text(&tree, EncoderKind::Owl)?;

        for encodings in [&clip_encodings, &owl_encodings] {
            if !encodings.matches(&tree) {
                return Err(ControlParseError::Inconsistent(encodings.encoder));
            }
        }

        Ok(Self {
            prompt: prompt.trim().to_string(),
            tree,
            clip_encodings,
            owl_encodings,
        })
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn clip_encodings(&self) -> &TextEncodings {
        &self.clip_encodings
    }

    pub fn owl_encodings(&self) -> &TextEncodings {
        &self.owl_encodings
    }
}

/// Process-wide published configuration.
///
/// Readers load a cloned `Arc` of the current snapshot and writers swap the
/// pointer. Neither side takes a lock.
#[derive(Clone, Default)]
pub struct PromptStore {
    current: Arc<ArcSwapOption<Configuration>>,
}

impl PromptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, configuration: Configuration) -> Arc<Configuration> {
        let snapshot = Arc::new(configuration);
        self.current.store(Some(Arc::clone(&snapshot)));
        snapshot
    }

    pub fn get(&self) -> Option<Arc<Configuration>> {
        self.current.load_full()
    }
}
