use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::ChatError;

/// A named system prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub name: String,
    pub system_text: String,
    pub description: String,
}

/// On-disk shape of one `prompt.json` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PromptEntry {
    system: String,
    #[serde(default)]
    description: String,
}

const DEFAULT_PROMPT: &str = r#"You are a helpful assistant that is good at conversation and careful reasoning.

- Answer concisely and accurately; say so when you are unsure.
- Use Markdown for code and structured content.
- Keep the language of your reply the same as the user's message."#;

static BUILTIN_TEMPLATES: Lazy<BTreeMap<String, PromptTemplate>> = Lazy::new(|| {
    let mut map = BTreeMap::new();
    map.insert(
        "default".to_string(),
        PromptTemplate {
            name: "default".to_string(),
            system_text: DEFAULT_PROMPT.to_string(),
            description: "Default system prompt".to_string(),
        },
    );
    map
});

/// Read-only name → template lookup, loaded once at startup
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    templates: BTreeMap<String, PromptTemplate>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self {
            templates: BUILTIN_TEMPLATES.clone(),
        }
    }
}

impl PromptLibrary {
    /// Built-ins, overridden by `prompt.json`, overridden by `<dir>/*.md`.
    ///
    /// Each markdown file becomes a template named after its file stem with
    /// the whole file as system text.
    pub fn load(prompt_file: &Path, prompts_dir: &Path) -> Result<Self> {
        let mut library = Self::default();

        if prompt_file.exists() {
            let content = fs::read_to_string(prompt_file)
                .with_context(|| format!("Failed to read {}", prompt_file.display()))?;
            match serde_json::from_str::<BTreeMap<String, PromptEntry>>(&content) {
                Ok(entries) => {
                    for (name, entry) in entries {
                        library.insert(name, entry.system, entry.description);
                    }
                }
                Err(e) => warn!("Ignoring malformed {}: {}", prompt_file.display(), e),
            }
        }

        if prompts_dir.is_dir() {
            let entries = fs::read_dir(prompts_dir)
                .with_context(|| format!("Failed to read {}", prompts_dir.display()))?;
            for entry in entries {
                let path = entry.context("Failed to read directory entry")?.path();
                if path.extension().and_then(|s| s.to_str()) != Some("md") {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                if text.trim().is_empty() {
                    continue;
                }
                library.insert(name.to_string(), text.trim().to_string(), name.to_string());
            }
        }

        debug!(count = library.templates.len(), "Loaded prompt templates");
        Ok(library)
    }

    pub fn from_templates(templates: impl IntoIterator<Item = PromptTemplate>) -> Self {
        let mut library = Self::default();
        for template in templates {
            library.templates.insert(template.name.clone(), template);
        }
        library
    }

    fn insert(&mut self, name: String, system_text: String, description: String) {
        self.templates.insert(
            name.clone(),
            PromptTemplate {
                name,
                system_text,
                description,
            },
        );
    }

    /// Look up a template; unknown names are a configuration problem.
    pub fn get(&self, name: &str) -> Result<&PromptTemplate, ChatError> {
        self.templates
            .get(name)
            .ok_or_else(|| ChatError::Configuration(format!("unknown prompt template '{}'", name)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn templates(&self) -> impl Iterator<Item = &PromptTemplate> {
        self.templates.values()
    }
}
