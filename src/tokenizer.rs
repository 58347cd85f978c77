use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result};

pub const UNK_TOKEN: &str = "<unk>";
pub const EOS_TOKEN: &str = "<eos>";
pub const UNK_ID: i64 = 0;
pub const EOS_ID: i64 = 1;

/// Whitespace word tokenizer with a vocabulary fitted on a training corpus.
/// Words are numbered in order of first appearance after the two special tokens.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    word_to_id: HashMap<String, i64>,
    id_to_word: Vec<String>,
}

impl Tokenizer {
    pub fn fit(text: &str) -> Self {
        let mut tokenizer = Tokenizer {
            word_to_id: HashMap::new(),
            id_to_word: Vec::new(),
        };
        tokenizer.insert(UNK_TOKEN);
        tokenizer.insert(EOS_TOKEN);
        for word in text.split_whitespace() {
            tokenizer.insert(word);
        }
        tokenizer
    }

    fn insert(&mut self, word: &str) {
        if !self.word_to_id.contains_key(word) {
            let id = self.id_to_word.len() as i64;
            self.word_to_id.insert(word.to_string(), id);
            self.id_to_word.push(word.to_string());
        }
    }

    /// Maps each whitespace-separated word to its id; unseen words become `UNK_ID`.
    pub fn encode(&self, text: &str) -> Vec<i64> {
        text.split_whitespace()
            .map(|word| self.word_to_id.get(word).copied().unwrap_or(UNK_ID))
            .collect()
    }

    /// Joins words with spaces; `EOS_ID` ends a line.
    #[cfg(test)]
    pub fn decode(&self, tokens: &[i64]) -> Result<String> {
        let mut text = String::new();
        for &token in tokens {
            let word = usize::try_from(token)
                .ok()
                .and_then(|index| self.id_to_word.get(index))
                .ok_or_else(|| anyhow::anyhow!("Invalid token found: {}", token))?;
            if token == EOS_ID {
                text.push('\n');
                continue;
            }
            if !text.is_empty() && !text.ends_with('\n') {
                text.push(' ');
            }
            text.push_str(word);
        }
        Ok(text)
    }
}

/// Anything that can turn one corpus line into model token ids.
pub trait LineEncoder {
    fn vocab_size(&self) -> i64;
    fn encode_line(&self, line: &str) -> Result<Vec<i64>>;
}

impl LineEncoder for Tokenizer {
    fn vocab_size(&self) -> i64 {
        self.id_to_word.len() as i64
    }

    /// Encodes the line's words followed by `EOS_ID`.
    fn encode_line(&self, line: &str) -> Result<Vec<i64>> {
        let mut ids = self.encode(line);
        ids.push(EOS_ID);
        Ok(ids)
    }
}

/// Pretrained tokenizers (e.g. GPT-2 BPE) saved in the Hugging Face `tokenizer.json`
/// format. Lines are encoded without special tokens.
impl LineEncoder for tokenizers::Tokenizer {
    fn vocab_size(&self) -> i64 {
        self.get_vocab_size(true) as i64
    }

    fn encode_line(&self, line: &str) -> Result<Vec<i64>> {
        let encoding = self
            .encode(line, false)
            .map_err(|e| anyhow::anyhow!("failed to encode line: {}", e))?;
        Ok(encoding.get_ids().iter().map(|&id| i64::from(id)).collect())
    }
}

pub fn load_pretrained(path: &Path) -> Result<tokenizers::Tokenizer> {
    tokenizers::Tokenizer::from_file(path)
        .map_err(|e| anyhow::anyhow!("Cannot load tokenizer from '{}': {}", path.display(), e))
}

/// Reads a corpus file one line at a time, skipping blank lines.
pub fn read_corpus(path: &Path, encoder: &dyn LineEncoder) -> Result<Vec<i64>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read corpus {}", path.display()))?;
    let mut ids = Vec::new();
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        ids.extend(encoder.encode_line(line)?);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tokenizer_round_trip() -> Result<()> {
        let tokenizer = Tokenizer::fit("the cat sat on the mat");
        assert_eq!(tokenizer.vocab_size(), 2 + 5);
        let tokens = tokenizer.encode("the mat sat");
        assert_eq!(tokens, vec![2, 6, 4]);
        assert_eq!(tokenizer.decode(&tokens)?, "the mat sat");
        Ok(())
    }

    #[test]
    fn test_unknown_words_map_to_unk() {
        let tokenizer = Tokenizer::fit("a b c");
        assert_eq!(tokenizer.encode("a zebra c"), vec![2, UNK_ID, 4]);
    }

    #[test]
    fn test_decode_rejects_invalid_ids() {
        let tokenizer = Tokenizer::fit("a b");
        assert!(tokenizer.decode(&[2, 99]).is_err());
        assert!(tokenizer.decode(&[-1]).is_err());
    }

    #[test]
    fn test_read_corpus_appends_eos_per_line() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("train.txt");
        let mut f = std::fs::File::create(&path)?;
        writeln!(f, " = Valkyria = \n\nthe game began\n")?;
        let tokenizer = Tokenizer::fit(&std::fs::read_to_string(&path)?);
        let ids = read_corpus(&path, &tokenizer)?;
        assert_eq!(ids, vec![2, 3, 2, EOS_ID, 4, 5, 6, EOS_ID]);
        assert_eq!(tokenizer.decode(&ids)?, "= Valkyria =\nthe game began\n");
        Ok(())
    }

    #[test]
    fn test_pretrained_tokenizer_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tokenizer.json");
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": { "[UNK]": 0, "the": 1, "game": 2, "began": 3 },
                "unk_token": "[UNK]"
            }
        });
        std::fs::write(&path, serde_json::to_string(&json)?)?;
        let tokenizer = load_pretrained(&path)?;
        assert_eq!(LineEncoder::vocab_size(&tokenizer), 4);

        let corpus = dir.path().join("train.txt");
        std::fs::write(&corpus, "the game began\n\nthe end\n")?;
        assert_eq!(read_corpus(&corpus, &tokenizer)?, vec![1, 2, 3, 1, 0]);
        Ok(())
    }

    #[test]
    fn test_missing_tokenizer_file_is_an_error() {
        assert!(load_pretrained(Path::new("/nonexistent/tokenizer.json")).is_err());
    }

    #[test]
    fn test_missing_corpus_is_an_error() {
        let tokenizer = Tokenizer::fit("");
        assert!(read_corpus(Path::new("/nonexistent/wiki.txt"), &tokenizer).is_err());
    }
}
