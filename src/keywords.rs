//! Human-readable keywords per entity type, loaded from the cause-keyword
//! YAML and attached to each reported cause.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{InferError, Result};

#[derive(Debug, Deserialize)]
struct KeywordFile {
    #[serde(default)]
    entity_keywords: HashMap<String, String>,
}

/// Entity-type to keyword table; unknown types map to the empty string.
#[derive(Debug, Default)]
pub struct CauseKeywords {
    entity_keywords: HashMap<String, String>,
}

impl CauseKeywords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| InferError::Inference(format!("unable to read keyword file: {e}")))?;
        self.load_yaml(&content)
    }

    pub fn load_yaml(&mut self, content: &str) -> Result<()> {
        let file: KeywordFile = serde_yaml::from_str(content)
            .map_err(|e| InferError::Inference(format!("invalid keyword file: {e}")))?;
        self.entity_keywords.extend(file.entity_keywords);
        Ok(())
    }

    pub fn keyword_of(&self, entity_type: &str) -> String {
        self.entity_keywords
            .get(entity_type)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_lookup() {
        let mut keywords = CauseKeywords::new();
        keywords
            .load_yaml(
                r#"
entity_keywords:
  disk: disk I/O
  proc: process
"#,
            )
            .unwrap();
        assert_eq!(keywords.keyword_of("disk"), "disk I/O");
        assert_eq!(keywords.keyword_of("unknown"), "");
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        let mut keywords = CauseKeywords::new();
        assert!(keywords.load_yaml("entity_keywords: [a, b]").is_err());
    }
}
