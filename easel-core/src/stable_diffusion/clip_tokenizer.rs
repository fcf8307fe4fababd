//! CLIP tokenizer assembled from the `vocab.json` and `merges.txt` pair that
//! older diffusers repositories ship instead of a `tokenizer.json`.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Error, Result};
use serde_json::{json, Map, Value};
use tokenizers::Tokenizer;

use super::END_OF_TEXT;

const START_OF_TEXT: &str = "<|startoftext|>";
const END_OF_WORD: &str = "</w>";

/// Splits text the way CLIP does before byte-level BPE.
const PRE_TOKENIZE_PATTERN: &str =
    r"<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|[\p{L}]+|[\p{N}]|[^\s\p{L}\p{N}]+";

pub(super) fn has_vocab_and_merges(dir: &Path) -> bool {
    dir.join("vocab.json").is_file() && dir.join("merges.txt").is_file()
}

pub(super) fn from_vocab_and_merges(dir: &Path) -> Result<Tokenizer> {
    let vocab_path = dir.join("vocab.json");
    let vocab: Map<String, Value> = serde_json::from_slice(
        &fs::read(&vocab_path).with_context(|| format!("failed to read {}", vocab_path.display()))?,
    )
    .with_context(|| format!("failed to parse {}", vocab_path.display()))?;

    let merges_path = dir.join("merges.txt");
    let merges_text = fs::read_to_string(&merges_path)
        .with_context(|| format!("failed to read {}", merges_path.display()))?;
    let merges: Vec<&str> = merges_text
        .lines()
        .filter(|line| !line.starts_with("#version") && !line.trim().is_empty())
        .collect();

    let special_id = |token: &str| {
        vocab
            .get(token)
            .and_then(Value::as_u64)
            .with_context(|| format!("{} has no {token} entry", vocab_path.display()))
    };
    let start_id = special_id(START_OF_TEXT)?;
    let end_id = special_id(END_OF_TEXT)?;

    let added_token = |id: u64, content: &str| {
        json!({
            "id": id,
            "content": content,
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": true,
            "special": true,
        })
    };
    let description = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [added_token(start_id, START_OF_TEXT), added_token(end_id, END_OF_TEXT)],
        "normalizer": {
            "type": "Sequence",
            "normalizers": [
                { "type": "NFC" },
                { "type": "Replace", "pattern": { "Regex": r"\s+" }, "content": " " },
                { "type": "Lowercase" },
            ],
        },
        "pre_tokenizer": {
            "type": "Sequence",
            "pretokenizers": [
                {
                    "type": "Split",
                    "pattern": { "Regex": PRE_TOKENIZE_PATTERN },
                    "behavior": "Removed",
                    "invert": true,
                },
                { "type": "ByteLevel", "add_prefix_space": false, "trim_offsets": true, "use_regex": false },
            ],
        },
        "post_processor": {
            "type": "RobertaProcessing",
            "sep": [END_OF_TEXT, end_id],
            "cls": [START_OF_TEXT, start_id],
            "trim_offsets": false,
            "add_prefix_space": false,
        },
        "decoder": { "type": "ByteLevel", "add_prefix_space": true, "trim_offsets": true, "use_regex": true },
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": END_OF_TEXT,
            "continuing_subword_prefix": "",
            "end_of_word_suffix": END_OF_WORD,
            "fuse_unk": false,
            "byte_fallback": false,
            "vocab": vocab,
            "merges": merges,
        },
    });

    tracing::debug!(dir = %dir.display(), merges = merges.len(), "building CLIP tokenizer");
    Tokenizer::from_str(&description.to_string())
        .map_err(Error::msg)
        .with_context(|| format!("failed to build a CLIP tokenizer from {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fixture(dir: &Path) {
        let vocab = json!({
            START_OF_TEXT: 0,
            END_OF_TEXT: 1,
            "a": 2,
            "b": 3,
            "a</w>": 4,
            "b</w>": 5,
            "ab</w>": 6,
        });
        fs::write(dir.join("vocab.json"), vocab.to_string()).unwrap();
        fs::write(dir.join("merges.txt"), "#version: 0.2\na b</w>\n").unwrap();
    }

    #[test]
    fn words_get_end_of_word_merges_and_special_tokens() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        assert!(has_vocab_and_merges(dir.path()));

        let tokenizer = from_vocab_and_merges(dir.path()).unwrap();
        let ids = |text: &str| tokenizer.encode(text, true).unwrap().get_ids().to_vec();
        assert_eq!(ids("AB"), vec![0, 6, 1]);
        assert_eq!(ids("a   b"), vec![0, 4, 5, 1]);
        assert_eq!(tokenizer.token_to_id(END_OF_TEXT), Some(1));
    }

    #[test]
    fn missing_special_tokens_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("vocab.json"), r#"{"a": 0}"#).unwrap();
        fs::write(dir.path().join("merges.txt"), "").unwrap();
        let err = from_vocab_and_merges(dir.path()).unwrap_err();
        assert!(err.to_string().contains(START_OF_TEXT));
    }

    #[test]
    fn directories_without_both_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("vocab.json"), "{}").unwrap();
        assert!(!has_vocab_and_merges(dir.path()));
    }
}
