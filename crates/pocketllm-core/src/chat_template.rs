//! Chat prompt formatting for different model instruction formats.
//!
//! | `fmt`    | Template                                                  |
//! |----------|-----------------------------------------------------------|
//! | `chatml` | ChatML (`<\|im_start\|>` / `<\|im_end\|>`)                |
//! | `qwen2`  | Alias for `chatml`                                        |
//! | `llama3` | LLaMA-3 instruct (`<\|start_header_id\|>` / `<\|eot_id\|>`) |
//! | `llama2` | LLaMA-2 / Mistral `[INST]` format                         |
//! | `llama`  | Alias for `llama2`                                        |
//! | _other_  | Plain-text `System/User/Assistant` fallback               |
//!
//! Formatting works one turn at a time so the prompt budget builder can cost
//! and drop turns individually. A complete prompt is
//! `system block + turns… + assistant opener`. BOS is never written here;
//! the tokenizer adds it when the model asks for one.

use serde::{Deserialize, Serialize};

// ── Conversation data ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, text: text.into() }
    }
}

// ── Format selector ──────────────────────────────────────────────────────────

/// Typed chat template selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatFormat {
    /// ChatML, used by Qwen2, OpenHermes and SmolLM.
    #[default]
    ChatML,
    /// LLaMA-3 instruct format.
    LLaMA3,
    /// LLaMA-2 / Mistral `[INST]` format. The system block is its own
    /// closed exchange so every turn renders independently.
    LLaMA2,
    /// Unknown model: plain-text `System/User/Assistant` fallback.
    Plain,
}

impl std::str::FromStr for ChatFormat {
    // Parsing never fails; unknown strings map to `Plain`.
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "chatml" | "qwen2" => Self::ChatML,
            "llama3" => Self::LLaMA3,
            "llama2" | "llama" | "mistral" => Self::LLaMA2,
            _ => Self::Plain,
        })
    }
}

impl std::fmt::Display for ChatFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ChatML => "chatml",
            Self::LLaMA3 => "llama3",
            Self::LLaMA2 => "llama2",
            Self::Plain => "plain",
        })
    }
}

impl ChatFormat {
    /// Pick a format from the special tokens a vocabulary defines.
    pub fn detect(has_token: impl Fn(&str) -> bool) -> Self {
        if has_token("<|im_start|>") {
            Self::ChatML
        } else if has_token("<|start_header_id|>") {
            Self::LLaMA3
        } else if has_token("[INST]") {
            Self::LLaMA2
        } else {
            Self::Plain
        }
    }

    /// Render the system preamble. Empty input renders nothing.
    pub fn render_system(self, system: &str) -> String {
        if system.is_empty() {
            return String::new();
        }
        self.render(Role::System, system)
    }

    pub fn render_turn(self, turn: &Turn) -> String {
        self.render(turn.role, &turn.text)
    }

    /// Opening tag of the reply the model is about to write.
    pub fn assistant_open(self) -> &'static str {
        match self {
            Self::ChatML => "<|im_start|>assistant\n",
            Self::LLaMA3 => "<|start_header_id|>assistant<|end_header_id|>\n\n",
            // The closing [/INST] of the last user turn already hands over.
            Self::LLaMA2 => "",
            Self::Plain => "Assistant:",
        }
    }

    /// Text markers that end a reply when they show up in decoded output.
    ///
    /// All markers of one format share the leading `<`, which
    /// [`StopBuffer`](crate::stop::StopBuffer) relies on.
    pub fn stop_markers(self) -> &'static [&'static str] {
        match self {
            // <|im_start|> is included because a well-trained ChatML model may
            // emit it to begin the next turn.
            Self::ChatML => &["<|im_end|>", "<|im_start|>", "<|endoftext|>", "<|user|>"],
            Self::LLaMA3 => &["<|eot_id|>", "<|end_of_text|>", "<|start_header_id|>"],
            Self::LLaMA2 => &["</s>", "<s>[INST]"],
            Self::Plain => &["</s>", "<|endoftext|>"],
        }
    }

    /// Substrings that end generation when found inside a single token piece.
    pub fn turn_markers(self) -> &'static [&'static str] {
        match self {
            Self::ChatML | Self::Plain => crate::session::DEFAULT_TURN_MARKERS,
            Self::LLaMA3 => &["<|eot_id|>", "<|start_header_id|>"],
            Self::LLaMA2 => &["[INST]", "</s>"],
        }
    }

    fn render(self, role: Role, text: &str) -> String {
        match self {
            Self::ChatML => format!("<|im_start|>{}\n{text}<|im_end|>\n", role.as_str()),
            Self::LLaMA3 => format!(
                "<|start_header_id|>{}<|end_header_id|>\n\n{text}<|eot_id|>",
                role.as_str()
            ),
            Self::LLaMA2 => match role {
                Role::System => format!("<s>[INST] <<SYS>>\n{text}\n<</SYS>> [/INST]</s>\n"),
                Role::User => format!("<s>[INST] {text} [/INST]"),
                Role::Assistant => format!(" {text} </s>\n"),
            },
            Self::Plain => {
                let label = match role {
                    Role::System => "System",
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                };
                format!("{label}: {text}\n\n")
            }
        }
    }
}

/// Render a complete prompt with every turn included.
pub fn build_chat_prompt(format: ChatFormat, system: &str, turns: &[Turn]) -> String {
    let mut s = format.render_system(system);
    for turn in turns {
        s.push_str(&format.render_turn(turn));
    }
    s.push_str(format.assistant_open());
    s
}

// ── Tests ─────────────────────────────────────────────────────────────────────
