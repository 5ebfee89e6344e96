use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

use candle_core::quantized::gguf_file;
use tokenizers::{AddedToken, Tokenizer as HfTokenizer};
use tracing::{debug, info};

use crate::error::{RuntimeError, RuntimeResult};

/// How a single token id is turned back into bytes.
///
/// Streaming renders one token at a time, so the HF decoder pipeline is
/// bypassed where it would mangle isolated tokens: byte-level BPE is mapped
/// back through the GPT-2 byte table and SentencePiece byte-fallback tokens
/// become their raw byte. Neither path ever produces U+FFFD for a character
/// that spans two tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenizerKind {
    /// GPT-2 / Qwen2 style byte-level BPE (`Ġ` is a space, `Ċ` a newline).
    Gpt2,
    /// SentencePiece / LLaMA style: `▁` word boundary, `<0xNN>` byte fallback.
    SentencePiece,
    /// Loaded from a `tokenizer.json`; decoding goes through its own decoder.
    File,
}

/// Special tokens that end generation besides the declared EOS.
const END_OF_TURN_TOKENS: &[&str] = &["<|im_end|>", "<|eot_id|>", "<|endoftext|>", "<|end_of_text|>"];

/// Wrapper around the Hugging Face `tokenizers` crate with byte-exact
/// per-token rendering.
#[derive(Debug)]
pub struct Tokenizer {
    inner: HfTokenizer,
    kind: TokenizerKind,
    eos_token_id: Option<u32>,
    bos_token_id: Option<u32>,
    add_bos: bool,
    special_ids: HashSet<u32>,
    eog_ids: HashSet<u32>,
}

impl Tokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    pub fn from_file(path: &Path) -> RuntimeResult<Self> {
        let inner =
            HfTokenizer::from_file(path).map_err(|e| RuntimeError::Tokenizer(e.to_string()))?;

        let eos_token_id = lookup_first(&inner, &["</s>", "<|endoftext|>", "<eos>"]);
        let bos_token_id = lookup_first(&inner, &["<s>", "<|startoftext|>", "<bos>"]);
        let special_ids: HashSet<u32> = inner
            .get_added_tokens_decoder()
            .iter()
            .filter(|(_, token)| token.special)
            .map(|(id, _)| *id)
            .collect();

        debug!(
            path = %path.display(),
            eos_token_id,
            bos_token_id,
            specials = special_ids.len(),
            "Tokenizer loaded from file"
        );

        Ok(Self::assemble(inner, TokenizerKind::File, eos_token_id, bos_token_id, false, special_ids))
    }

    /// Build a tokenizer from the `tokenizer.ggml.*` metadata embedded in a
    /// GGUF file.
    ///
    /// Dispatches on `tokenizer.ggml.model`:
    /// - `"llama"` → SentencePiece Unigram
    /// - anything else → byte-level BPE
    pub fn from_gguf_metadata(metadata: &HashMap<String, gguf_file::Value>) -> RuntimeResult<Self> {
        let tokens = gguf_string_array(metadata, "tokenizer.ggml.tokens").ok_or_else(|| {
            RuntimeError::Tokenizer("GGUF file has no tokenizer.ggml.tokens".to_string())
        })?;
        let tokenizer_model = match metadata.get("tokenizer.ggml.model") {
            Some(gguf_file::Value::String(s)) => s.clone(),
            _ => "gpt2".to_string(),
        };
        let merges = gguf_string_array(metadata, "tokenizer.ggml.merges").unwrap_or_default();

        info!(
            vocab_size = tokens.len(),
            merges = merges.len(),
            tokenizer_model = %tokenizer_model,
            "Building tokenizer from GGUF metadata"
        );

        let (mut inner, kind) = match tokenizer_model.as_str() {
            "llama" | "llama2" | "llama3" => {
                let scores = gguf_f32_array(metadata, "tokenizer.ggml.scores")
                    .unwrap_or_else(|| vec![0.0f32; tokens.len()]);
                let vocab: Vec<(String, f64)> = tokens
                    .iter()
                    .zip(scores.iter().chain(std::iter::repeat(&0.0f32)))
                    .map(|(t, &s)| (t.clone(), s as f64))
                    .collect();
                let unk_id =
                    gguf_u32(metadata, "tokenizer.ggml.unknown_token_id").map(|id| id as usize);
                let unigram = tokenizers::models::unigram::Unigram::from(vocab, unk_id, true)
                    .map_err(|e| RuntimeError::Tokenizer(format!("Unigram build error: {e}")))?;
                (HfTokenizer::new(unigram), TokenizerKind::SentencePiece)
            }
            _ => {
                let vocab: tokenizers::models::bpe::Vocab =
                    tokens.iter().enumerate().map(|(i, t)| (t.clone(), i as u32)).collect();
                let merges: Vec<(String, String)> = merges
                    .iter()
                    .filter_map(|m| {
                        let (a, b) = m.split_once(' ')?;
                        Some((a.to_string(), b.to_string()))
                    })
                    .collect();
                let bpe = tokenizers::models::bpe::BPE::builder()
                    .vocab_and_merges(vocab, merges)
                    .byte_fallback(true)
                    .build()
                    .map_err(|e| RuntimeError::Tokenizer(format!("BPE build error: {e}")))?;
                (HfTokenizer::new(bpe), TokenizerKind::Gpt2)
            }
        };

        match kind {
            TokenizerKind::SentencePiece => {
                use tokenizers::pre_tokenizers::metaspace::{Metaspace, PrependScheme};
                inner.with_pre_tokenizer(Some(Metaspace::new('▁', PrependScheme::First, false)));
            }
            TokenizerKind::Gpt2 => {
                use tokenizers::pre_tokenizers::byte_level::ByteLevel;
                inner.with_pre_tokenizer(Some(ByteLevel::new(false, true, true)));
            }
            TokenizerKind::File => {}
        }

        let eos_token_id = gguf_u32(metadata, "tokenizer.ggml.eos_token_id");
        let bos_token_id = gguf_u32(metadata, "tokenizer.ggml.bos_token_id");
        let add_bos = match metadata.get("tokenizer.ggml.add_bos_token") {
            Some(gguf_file::Value::Bool(b)) => *b,
            _ => kind == TokenizerKind::SentencePiece,
        };

        // Control (3) and user-defined (4) entries, plus anything shaped like
        // a chat marker, must encode as single ids.
        let mut special_ids: HashSet<u32> =
            [eos_token_id, bos_token_id].into_iter().flatten().collect();
        if let Some(gguf_file::Value::Array(types)) = metadata.get("tokenizer.ggml.token_type") {
            for (i, typ) in types.iter().enumerate() {
                let control = match typ {
                    gguf_file::Value::I32(t) => *t == 3 || *t == 4,
                    gguf_file::Value::U32(t) => *t == 3 || *t == 4,
                    gguf_file::Value::U8(t) => *t == 3 || *t == 4,
                    _ => false,
                };
                if control {
                    special_ids.insert(i as u32);
                }
            }
        }
        for (i, tok) in tokens.iter().enumerate() {
            if (tok.starts_with("<|") && tok.ends_with("|>")) || tok == "<s>" || tok == "</s>" {
                special_ids.insert(i as u32);
            }
        }
        let added: Vec<AddedToken> = special_ids
            .iter()
            .filter_map(|&i| tokens.get(i as usize))
            .map(|tok| AddedToken::from(tok.clone(), true))
            .collect();
        if !added.is_empty() {
            debug!(count = added.len(), "Registering special tokens");
            inner.add_special_tokens(&added);
        }

        Ok(Self::assemble(inner, kind, eos_token_id, bos_token_id, add_bos, special_ids))
    }

    fn assemble(
        inner: HfTokenizer,
        kind: TokenizerKind,
        eos_token_id: Option<u32>,
        bos_token_id: Option<u32>,
        add_bos: bool,
        special_ids: HashSet<u32>,
    ) -> Self {
        let vocab = inner.get_vocab(true);
        let eog_ids: HashSet<u32> = END_OF_TURN_TOKENS
            .iter()
            .filter_map(|t| vocab.get(*t).copied())
            .chain(eos_token_id)
            .collect();
        Self { inner, kind, eos_token_id, bos_token_id, add_bos, special_ids, eog_ids }
    }

    /// Encode text. Added special tokens are always matched as single ids;
    /// `add_special` prepends BOS when the model expects one.
    pub fn encode(&self, text: &str, add_special: bool) -> RuntimeResult<Vec<u32>> {
        let encoding =
            self.inner.encode(text, false).map_err(|e| RuntimeError::Tokenizer(e.to_string()))?;
        let mut ids = Vec::with_capacity(encoding.len() + 1);
        if add_special && self.add_bos {
            ids.extend(self.bos_token_id);
        }
        ids.extend_from_slice(encoding.get_ids());
        Ok(ids)
    }

    /// Raw bytes of one token. Special tokens render as nothing unless
    /// `special` is set.
    pub fn piece_bytes(&self, id: u32, special: bool) -> RuntimeResult<Vec<u8>> {
        if self.special_ids.contains(&id) {
            if !special {
                return Ok(Vec::new());
            }
            return self.raw_token(id).map(|raw| raw.into_bytes());
        }
        match self.kind {
            TokenizerKind::SentencePiece => {
                let raw = self.raw_token(id)?;
                if let Some(b) = byte_fallback(&raw) {
                    return Ok(vec![b]);
                }
                Ok(raw.replace('\u{2581}', " ").into_bytes())
            }
            TokenizerKind::Gpt2 => Ok(byte_level_bytes(&self.raw_token(id)?)),
            TokenizerKind::File => self
                .inner
                .decode(&[id], false)
                .map(String::into_bytes)
                .map_err(|e| RuntimeError::Tokenizer(e.to_string())),
        }
    }

    pub fn is_eog(&self, id: u32) -> bool {
        self.eog_ids.contains(&id)
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Look up the id of an exact token string (e.g. `"<|im_end|>"`).
    pub fn token_id(&self, text: &str) -> Option<u32> {
        self.inner.token_to_id(text)
    }

    fn raw_token(&self, id: u32) -> RuntimeResult<String> {
        self.inner
            .id_to_token(id)
            .ok_or_else(|| RuntimeError::Tokenizer(format!("Unknown token id: {id}")))
    }
}

fn lookup_first(tokenizer: &HfTokenizer, candidates: &[&str]) -> Option<u32> {
    candidates.iter().find_map(|c| tokenizer.token_to_id(c))
}

/// `<0xNN>` → `NN`.
fn byte_fallback(raw: &str) -> Option<u8> {
    let hex = raw.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// Inverse of the GPT-2 `bytes_to_unicode` table.
fn byte_level_table() -> &'static HashMap<char, u8> {
    static TABLE: OnceLock<HashMap<char, u8>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut bytes: Vec<u8> =
            (b'!'..=b'~').chain(0xA1u8..=0xAC).chain(0xAEu8..=0xFF).collect();
        let mut chars: Vec<u32> = bytes.iter().map(|&b| b as u32).collect();
        let mut n = 0u32;
        for b in 0..=255u8 {
            if !bytes.contains(&b) {
                bytes.push(b);
                chars.push(256 + n);
                n += 1;
            }
        }
        chars
            .into_iter()
            .zip(bytes)
            .filter_map(|(c, b)| char::from_u32(c).map(|c| (c, b)))
            .collect()
    })
}

fn byte_level_bytes(raw: &str) -> Vec<u8> {
    let table = byte_level_table();
    let mut out = Vec::with_capacity(raw.len());
    for c in raw.chars() {
        match table.get(&c) {
            Some(&b) => out.push(b),
            None => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out
}

// ─── GGUF metadata helpers ────────────────────────────────────────────────────

fn gguf_string_array(metadata: &HashMap<String, gguf_file::Value>, key: &str) -> Option<Vec<String>> {
    match metadata.get(key) {
        Some(gguf_file::Value::Array(arr)) => {
            let strings: Vec<String> = arr
                .iter()
                .filter_map(|v| match v {
                    gguf_file::Value::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect();
            (!strings.is_empty()).then_some(strings)
        }
        _ => None,
    }
}

fn gguf_f32_array(metadata: &HashMap<String, gguf_file::Value>, key: &str) -> Option<Vec<f32>> {
    match metadata.get(key) {
        Some(gguf_file::Value::Array(arr)) => {
            let floats: Vec<f32> = arr
                .iter()
                .filter_map(|v| match v {
                    gguf_file::Value::F32(f) => Some(*f),
                    _ => None,
                })
                .collect();
            (!floats.is_empty()).then_some(floats)
        }
        _ => None,
    }
}

/// Extract a u32 value from GGUF metadata, tolerating different integer widths.
pub fn gguf_u32(metadata: &HashMap<String, gguf_file::Value>, key: &str) -> Option<u32> {
    match metadata.get(key) {
        Some(gguf_file::Value::U32(v)) => Some(*v),
        Some(gguf_file::Value::U64(v)) => u32::try_from(*v).ok(),
        Some(gguf_file::Value::I32(v)) => u32::try_from(*v).ok(),
        _ => None,
    }
}
