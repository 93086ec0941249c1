//! Tokenizer handle: special tokens, padding and truncated encoding.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokenizers::{AddedToken, PaddingParams, Tokenizer};

use crate::config::ModelFamily;
use crate::dataset::TokenizedPrompt;
use crate::error::{Result, TunerError};

/// Context window used when neither the config nor the tokenizer sets one.
pub const DEFAULT_CONTEXT_WINDOW: usize = 2048;

/// Token added when the tokenizer has neither a pad nor an eos token.
pub const FALLBACK_PAD_TOKEN: &str = "<pad>";

/// Special token as written in `tokenizer_config.json`: either a bare string
/// or an added-token object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenSpec {
    /// `"</s>"`
    Plain(String),
    /// `{"content": "</s>", ...}`
    Added {
        /// Token text.
        content: String,
    },
}

impl TokenSpec {
    fn into_content(self) -> String {
        match self {
            Self::Plain(s) | Self::Added { content: s } => s,
        }
    }
}

/// `tokenizer_config.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenizerConfigFile {
    /// End-of-sequence token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos_token: Option<TokenSpec>,
    /// Beginning-of-sequence token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bos_token: Option<TokenSpec>,
    /// Padding token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pad_token: Option<TokenSpec>,
    /// Longest sequence the model accepts. Stored as a float upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_max_length: Option<f64>,
    /// Everything else.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// How [`TokenizerHandle::ensure_pad_token`] obtained the padding token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadTokenSource {
    /// The tokenizer already defined one.
    Existing,
    /// Reused the end-of-sequence token.
    EndOfSequence,
    /// Added [`FALLBACK_PAD_TOKEN`] to the vocabulary.
    Added,
}

/// Loaded tokenizer plus the special-token metadata the pipeline needs.
pub struct TokenizerHandle {
    inner: Tokenizer,
    eos_token: Option<String>,
    bos_token: Option<String>,
    pad_token: Option<String>,
    model_max_length: usize,
    extra: Map<String, Value>,
}

impl TokenizerHandle {
    /// Load `tokenizer.json` and the optional `tokenizer_config.json` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::ModelLoad`] if `tokenizer.json` is missing or
    /// invalid, or if `tokenizer_config.json` exists but does not parse.
    pub fn from_dir(dir: &Path, family: ModelFamily) -> Result<Self> {
        let tokenizer_path = dir.join("tokenizer.json");
        if !tokenizer_path.is_file() {
            return Err(TunerError::ModelLoad(format!(
                "tokenizer not found: {}",
                tokenizer_path.display()
            )));
        }
        let inner = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| TunerError::ModelLoad(format!("failed to load {}: {e}", tokenizer_path.display())))?;

        let config_path = dir.join("tokenizer_config.json");
        let config = if config_path.is_file() {
            serde_json::from_str(&std::fs::read_to_string(&config_path)?)
                .map_err(|e| TunerError::ModelLoad(format!("invalid {}: {e}", config_path.display())))?
        } else {
            TokenizerConfigFile::default()
        };

        Ok(Self::new(inner, config, family))
    }

    /// Wrap an in-memory tokenizer.
    #[must_use]
    pub fn new(inner: Tokenizer, config: TokenizerConfigFile, family: ModelFamily) -> Self {
        let (default_bos, default_eos) = match family {
            ModelFamily::Auto => (None, None),
            ModelFamily::Llama => (Some("<s>"), Some("</s>")),
        };

        let model_max_length = config
            .model_max_length
            .filter(|len| *len >= 1.0 && *len <= 1e9)
            .map_or(DEFAULT_CONTEXT_WINDOW, |len| {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let len = len as usize;
                len
            });

        Self {
            inner,
            eos_token: config
                .eos_token
                .map(TokenSpec::into_content)
                .or_else(|| default_eos.map(String::from)),
            bos_token: config
                .bos_token
                .map(TokenSpec::into_content)
                .or_else(|| default_bos.map(String::from)),
            pad_token: config.pad_token.map(TokenSpec::into_content),
            model_max_length,
            extra: config.extra,
        }
    }

    /// End-of-sequence token, if defined.
    #[must_use]
    pub fn eos_token(&self) -> Option<&str> {
        self.eos_token.as_deref()
    }

    /// Padding token, if defined.
    #[must_use]
    pub fn pad_token(&self) -> Option<&str> {
        self.pad_token.as_deref()
    }

    /// Longest sequence the model accepts.
    #[must_use]
    pub fn model_max_length(&self) -> usize {
        self.model_max_length
    }

    /// Vocabulary size including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// The wrapped tokenizer.
    #[must_use]
    pub fn inner(&self) -> &Tokenizer {
        &self.inner
    }

    /// Guarantee a padding token and configure batch padding with it.
    ///
    /// The end-of-sequence token is reused only when it is in the
    /// vocabulary; otherwise a dedicated pad token is added.
    ///
    /// # Errors
    ///
    /// Returns an error if a declared pad token has no id in the vocabulary.
    pub fn ensure_pad_token(&mut self) -> Result<PadTokenSource> {
        let usable_eos = self
            .eos_token
            .as_ref()
            .filter(|eos| self.inner.token_to_id(eos).is_some());
        if let (Some(eos), None) = (&self.eos_token, usable_eos) {
            tracing::warn!(eos_token = %eos, "eos token is not in the vocabulary, adding {FALLBACK_PAD_TOKEN} for padding");
        }

        let (pad, source) = match (&self.pad_token, usable_eos) {
            (Some(pad), _) => (pad.clone(), PadTokenSource::Existing),
            (None, Some(eos)) => (eos.clone(), PadTokenSource::EndOfSequence),
            (None, None) => {
                self.inner
                    .add_special_tokens(&[AddedToken::from(FALLBACK_PAD_TOKEN, true)]);
                (FALLBACK_PAD_TOKEN.to_string(), PadTokenSource::Added)
            }
        };

        let pad_id = self
            .inner
            .token_to_id(&pad)
            .ok_or_else(|| TunerError::ModelLoad(format!("pad token {pad:?} is not in the vocabulary")))?;
        self.inner.with_padding(Some(PaddingParams {
            pad_id,
            pad_token: pad.clone(),
            ..Default::default()
        }));
        self.pad_token = Some(pad);

        tracing::debug!(?source, pad_id, "padding token configured");
        Ok(source)
    }

    /// Encode `text`, truncating to at most `max_len` tokens. Never pads.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_truncated(&self, text: &str, max_len: usize) -> Result<TokenizedPrompt> {
        let encoding = self.inner.encode(text, true)?;
        let len = encoding.get_ids().len().min(max_len);
        Ok(TokenizedPrompt {
            input_ids: encoding.get_ids()[..len].to_vec(),
            attention_mask: encoding.get_attention_mask()[..len].to_vec(),
        })
    }

    /// Write `tokenizer.json` and `tokenizer_config.json` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be written.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        self.inner.save(dir.join("tokenizer.json"), false)?;

        #[allow(clippy::cast_precision_loss)]
        let config = TokenizerConfigFile {
            eos_token: self.eos_token.clone().map(TokenSpec::Plain),
            bos_token: self.bos_token.clone().map(TokenSpec::Plain),
            pad_token: self.pad_token.clone().map(TokenSpec::Plain),
            model_max_length: Some(self.model_max_length as f64),
            extra: self.extra.clone(),
        };
        std::fs::write(
            dir.join("tokenizer_config.json"),
            serde_json::to_string_pretty(&config)?,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for TokenizerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenizerHandle")
            .field("vocab_size", &self.vocab_size())
            .field("eos_token", &self.eos_token)
            .field("pad_token", &self.pad_token)
            .field("model_max_length", &self.model_max_length)
            .finish_non_exhaustive()
    }
}
