//! Prompt template loading and rendering.
//!
//! Templates live on disk as `{base}/{id}/{version}/{section}.md` so they can
//! be edited without recompiling. Every call site supplies an embedded
//! fallback template, which keeps the engine usable when the asset directory
//! is missing (e.g. installed binary run from an arbitrary cwd).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

/// Section files assembled into a template, in order.
const SECTION_NAMES: &[&str] = &["role", "contract", "task"];

#[derive(Clone, Debug)]
pub struct PromptTemplate {
    pub id: String,
    pub version: String,
    pub sections: Vec<(String, String)>, // (name, content)
}

pub trait PromptStore: Send + Sync {
    fn get_template(&self, id: &str, version: &str) -> EngineResult<PromptTemplate>;
}

/// Reads prompt sections from a directory tree.
#[derive(Clone)]
pub struct FilePromptStore {
    base_dir: PathBuf,
}

impl FilePromptStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn read_section(&self, id: &str, version: &str, name: &str) -> EngineResult<String> {
        let path = self
            .base_dir
            .join(id)
            .join(version)
            .join(format!("{}.md", name));
        fs::read_to_string(&path).map_err(|e| {
            EngineError::Prompt(format!(
                "failed to read prompt section {} for {}/{}: {}",
                name, id, version, e
            ))
        })
    }
}

impl PromptStore for FilePromptStore {
    fn get_template(&self, id: &str, version: &str) -> EngineResult<PromptTemplate> {
        let mut sections = Vec::new();
        for name in SECTION_NAMES {
            if let Ok(content) = self.read_section(id, version, name) {
                sections.push((name.to_string(), content));
            }
        }
        if sections.is_empty() {
            return Err(EngineError::Prompt(format!(
                "no prompt sections found for {}/{} in {}",
                id,
                version,
                self.base_dir.display()
            )));
        }
        Ok(PromptTemplate {
            id: id.to_string(),
            version: version.to_string(),
            sections,
        })
    }
}

#[derive(Clone)]
pub struct PromptManager<S: PromptStore> {
    store: Option<S>,
    version: String,
}

impl<S: PromptStore> PromptManager<S> {
    pub fn new(store: S, version: impl Into<String>) -> Self {
        Self {
            store: Some(store),
            version: version.into(),
        }
    }

    /// A manager with no backing store; every render uses the fallback.
    pub fn embedded_only(version: impl Into<String>) -> Self {
        Self {
            store: None,
            version: version.into(),
        }
    }

    pub fn render(&self, id: &str, vars: &HashMap<String, String>) -> EngineResult<String> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| EngineError::Prompt("no prompt store configured".to_string()))?;
        let template = store.get_template(id, &self.version)?;
        let mut buf = String::new();
        for (_name, content) in template.sections {
            buf.push_str(&content);
            if !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push('\n');
        }
        Ok(substitute(&buf, vars))
    }

    /// Render from the store, or fall back to `fallback` (also substituted)
    /// when the asset is unavailable. Logs once per miss.
    pub fn render_or(&self, id: &str, vars: &HashMap<String, String>, fallback: &str) -> String {
        match self.render(id, vars) {
            Ok(text) => text,
            Err(e) => {
                if self.store.is_some() {
                    tracing::warn!(prompt = id, error = %e, "prompt asset unavailable, using embedded fallback");
                }
                substitute(fallback, vars)
            }
        }
    }
}

/// Simple variable substitution: `{var}`.
fn substitute(template: &str, vars: &HashMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (k, v) in vars {
        let needle = format!("{{{}}}", k);
        rendered = rendered.replace(&needle, v);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_file_store_assembles_sections() {
        let dir = tempfile::tempdir().unwrap();
        let section_dir = dir.path().join("gap_assessment").join("v1");
        std::fs::create_dir_all(&section_dir).unwrap();
        std::fs::write(section_dir.join("role.md"), "You assess gaps.\n").unwrap();
        std::fs::write(section_dir.join("task.md"), "Request: {request}\n").unwrap();

        let manager = PromptManager::new(FilePromptStore::new(dir.path()), "v1");
        let rendered = manager
            .render("gap_assessment", &vars(&[("request", "sum a csv")]))
            .unwrap();
        assert!(rendered.contains("You assess gaps."));
        assert!(rendered.contains("Request: sum a csv"));
    }

    #[test]
    fn test_missing_assets_use_fallback() {
        let manager: PromptManager<FilePromptStore> = PromptManager::embedded_only("v1");
        let rendered = manager.render_or(
            "gap_assessment",
            &vars(&[("request", "x")]),
            "fallback for {request}",
        );
        assert_eq!(rendered, "fallback for x");
    }

    #[test]
    fn test_unknown_vars_left_in_place() {
        let rendered = substitute("a {known} b {unknown}", &vars(&[("known", "1")]));
        assert_eq!(rendered, "a 1 b {unknown}");
    }
}
