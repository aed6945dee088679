use std::collections::HashMap;

use anyhow::Result;

use crate::error::ModelError;

pub const BOS_TOKEN: &str = "<bos>";
pub const EOS_TOKEN: &str = "<eos>";
pub const PAD_TOKEN: &str = "<pad>";
/// Structural markers rendered as whitespace when decoding to text.
pub const TAB_TOKEN: &str = "<t>";
pub const NEWLINE_TOKEN: &str = "<b>";
pub const SPACE_TOKEN: &str = "<s>";

const RESERVED: [&str; 6] = [
    BOS_TOKEN,
    EOS_TOKEN,
    PAD_TOKEN,
    TAB_TOKEN,
    NEWLINE_TOKEN,
    SPACE_TOKEN,
];

/// Bijective token <-> id table, fixed at model construction.
///
/// Must contain the reserved control tokens and the structural whitespace
/// markers; anything else decodes to its literal symbol string.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    w2i: HashMap<String, u32>,
    i2w: HashMap<u32, String>,
    bos: u32,
    eos: u32,
    pad: u32,
}

impl Vocabulary {
    pub fn new(w2i: HashMap<String, u32>) -> Result<Self> {
        let mut i2w = HashMap::with_capacity(w2i.len());
        for (word, &id) in &w2i {
            if let Some(previous) = i2w.insert(id, word.clone()) {
                return Err(ModelError::configuration(format!(
                    "vocabulary is not bijective: id {id} maps to both {previous:?} and {word:?}"
                ))
                .into());
            }
        }
        for token in RESERVED {
            if !w2i.contains_key(token) {
                return Err(ModelError::configuration(format!(
                    "vocabulary is missing the reserved token {token:?}"
                ))
                .into());
            }
        }
        let bos = w2i[BOS_TOKEN];
        let eos = w2i[EOS_TOKEN];
        let pad = w2i[PAD_TOKEN];
        Ok(Self {
            w2i,
            i2w,
            bos,
            eos,
            pad,
        })
    }

    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let mut w2i = HashMap::new();
        for (word, id) in pairs {
            let word = word.into();
            if w2i.insert(word.clone(), id).is_some() {
                return Err(ModelError::configuration(format!(
                    "vocabulary lists the token {word:?} twice"
                ))
                .into());
            }
        }
        Self::new(w2i)
    }

    pub fn len(&self) -> usize {
        self.w2i.len()
    }

    pub fn is_empty(&self) -> bool {
        self.w2i.is_empty()
    }

    pub fn id_of(&self, token: &str) -> Option<u32> {
        self.w2i.get(token).copied()
    }

    pub fn symbol_of(&self, id: u32) -> Option<&str> {
        self.i2w.get(&id).map(String::as_str)
    }

    pub fn bos_id(&self) -> u32 {
        self.bos
    }

    pub fn eos_id(&self) -> u32 {
        self.eos
    }

    pub fn pad_id(&self) -> u32 {
        self.pad
    }

    /// Render an id sequence as text.
    ///
    /// `<bos>` is skipped wherever it appears, decoding stops at the first
    /// `<eos>`, the structural markers become tab/newline/space, and every
    /// other symbol is concatenated literally with no separator.
    pub fn decode_text(&self, ids: &[u32]) -> Result<String> {
        let mut out = String::new();
        for &id in ids {
            if id == self.bos {
                continue;
            }
            if id == self.eos {
                break;
            }
            let symbol = self.i2w.get(&id).ok_or_else(|| {
                ModelError::configuration(format!("id {id} is not in the vocabulary"))
            })?;
            match symbol.as_str() {
                TAB_TOKEN => out.push('\t'),
                NEWLINE_TOKEN => out.push('\n'),
                SPACE_TOKEN => out.push(' '),
                other => out.push_str(other),
            }
        }
        Ok(out)
    }
}
