//! Pattern definitions and the YAML pattern registry.
//!
//! Patterns are the human-authored input of the forge: a parameterized code
//! template plus closed pools of legal substitution values. This module loads
//! them from YAML files, validates their structure and hands them to the
//! generation run.
//!
//! # Example
//!
//! ```ignore
//! use pattern_forge::pattern::PatternRegistry;
//!
//! let mut registry = PatternRegistry::new();
//! registry.load_directory("patterns/")?;
//!
//! let pattern = registry.get("circle_area")?;
//! println!("Loaded pattern: {}", pattern.id);
//! ```

pub mod constraints;
pub mod schema;

pub use constraints::Constraint;
pub use schema::{
    normalize_import, placeholders, BindingValue, Pattern, PatternMetadata, PatternPart,
    Pedagogy, MAX_COMPLEXITY, MIN_COMPLEXITY,
};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::PatternError;

/// A pattern file that could not be loaded.
#[derive(Debug)]
pub struct LoadWarning {
    pub path: PathBuf,
    pub error: PatternError,
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext == "yaml" || ext == "yml")
        .unwrap_or(false)
}

/// Registry of validated patterns loaded from YAML files.
///
/// Directory loads skip malformed files and keep them as [`LoadWarning`]s so
/// one bad pattern never hides the rest of a library.
#[derive(Debug, Default)]
pub struct PatternRegistry {
    /// Loaded patterns, keyed by ID.
    patterns: BTreeMap<String, Pattern>,
    /// Source file of each pattern loaded from disk.
    loaded_paths: BTreeMap<String, PathBuf>,
    /// Files skipped during directory loads.
    warnings: Vec<LoadWarning>,
}

impl PatternRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a single pattern from a YAML file.
    ///
    /// The pattern is validated after parsing; on failure nothing is added.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the YAML pattern file.
    ///
    /// # Returns
    ///
    /// A reference to the loaded pattern.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<&Pattern, PatternError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        let pattern: Pattern =
            serde_yaml::from_str(&content).map_err(|e| PatternError::ParseError {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        let id = pattern.id.clone();
        self.insert(pattern)?;
        self.loaded_paths.insert(id.clone(), path.to_path_buf());
        debug!(pattern_id = %id, path = %path.display(), "Loaded pattern");

        self.get(&id)
    }

    /// Loads all YAML patterns from a directory (non-recursive).
    ///
    /// Files must have a `.yaml` or `.yml` extension. Files that fail to parse
    /// or validate are recorded as warnings.
    ///
    /// # Returns
    ///
    /// The number of patterns successfully loaded.
    pub fn load_directory<P: AsRef<Path>>(&mut self, dir: P) -> Result<usize, PatternError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if path.is_file() && is_yaml(&path) {
                files.push(path);
            }
        }
        Ok(self.load_files(files))
    }

    /// Loads all YAML patterns below a directory, descending into
    /// subdirectories.
    pub fn load_directory_recursive<P: AsRef<Path>>(
        &mut self,
        dir: P,
    ) -> Result<usize, PatternError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir.as_ref()) {
            let entry = entry?;
            if entry.file_type().is_file() && is_yaml(entry.path()) {
                files.push(entry.into_path());
            }
        }
        Ok(self.load_files(files))
    }

    fn load_files(&mut self, mut files: Vec<PathBuf>) -> usize {
        files.sort();
        let mut count = 0;
        for path in files {
            match self.load_file(&path) {
                Ok(_) => count += 1,
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "Skipping malformed pattern");
                    self.warnings.push(LoadWarning { path, error });
                }
            }
        }
        count
    }

    /// Registers a pattern directly without loading from file.
    ///
    /// The pattern is validated before being added.
    pub fn register(&mut self, pattern: Pattern) -> Result<(), PatternError> {
        self.insert(pattern)
    }

    fn insert(&mut self, pattern: Pattern) -> Result<(), PatternError> {
        pattern.validate()?;
        if self.patterns.contains_key(&pattern.id) {
            return Err(PatternError::DuplicateId(pattern.id));
        }
        self.patterns.insert(pattern.id.clone(), pattern);
        Ok(())
    }

    /// Gets a pattern by its ID.
    pub fn get(&self, id: &str) -> Result<&Pattern, PatternError> {
        self.patterns
            .get(id)
            .ok_or_else(|| PatternError::NotFound(id.to_string()))
    }

    /// Gets the file path from which a pattern was loaded.
    pub fn get_path(&self, id: &str) -> Option<&Path> {
        self.loaded_paths.get(id).map(|p| p.as_path())
    }

    /// Returns the number of loaded patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Returns true if no patterns are loaded.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns an iterator over all loaded patterns, ordered by ID.
    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.values()
    }

    /// Returns patterns filtered by category.
    pub fn by_category(&self, category: &str) -> Vec<&Pattern> {
        self.patterns
            .values()
            .filter(|p| p.category == category)
            .collect()
    }

    /// Returns patterns whose complexity lies in the inclusive range.
    pub fn by_complexity(&self, min: u8, max: u8) -> Vec<&Pattern> {
        self.patterns
            .values()
            .filter(|p| (min..=max).contains(&p.complexity))
            .collect()
    }

    /// Files skipped by directory loads.
    pub fn warnings(&self) -> &[LoadWarning] {
        &self.warnings
    }

    /// Concatenates another registry into this one.
    ///
    /// Patterns whose ID is already present are skipped and recorded as
    /// warnings.
    pub fn merge(&mut self, other: PatternRegistry) {
        self.warnings.extend(other.warnings);
        for (id, pattern) in other.patterns {
            let path = other.loaded_paths.get(&id).cloned().unwrap_or_default();
            if self.patterns.contains_key(&id) {
                warn!(pattern_id = %id, "Duplicate pattern ID while merging registries");
                self.warnings.push(LoadWarning {
                    path,
                    error: PatternError::DuplicateId(id),
                });
                continue;
            }
            self.patterns.insert(id.clone(), pattern);
            self.loaded_paths.insert(id, path);
        }
    }

    /// Consumes the registry, yielding its patterns ordered by ID.
    pub fn into_patterns(self) -> Vec<Pattern> {
        self.patterns.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn pattern_yaml(id: &str) -> String {
        format!(
            r#"
id: {id}
version: "1.2.0"
category: geometry
complexity: 2
metadata:
  author: forge
  tags: [math]
  pedagogy:
    concept: functions
instruction: "Write a function returning {{{{ factor }}}} times the circle area."
requires: [math]
template: |
  def area(r):
      return {{{{ factor }}}} * math.pi * r ** 2
bindings:
  factor: ["1.0", "2.0"]
checks:
  - "assert abs(area(1) - math.pi) < 1e-9"
"#
        )
    }

    #[test]
    fn test_registry_new() {
        let registry = PatternRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_load_single_file() {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        writeln!(file, "{}", pattern_yaml("circle_area")).expect("failed to write");

        let mut registry = PatternRegistry::new();
        let pattern = registry.load_file(file.path()).expect("failed to load");

        assert_eq!(pattern.id, "circle_area");
        assert_eq!(pattern.complexity, 2);
        assert_eq!(pattern.metadata.pedagogy.concept.as_deref(), Some("functions"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_path("circle_area"), Some(file.path()));
    }

    #[test]
    fn test_load_directory_skips_malformed() {
        let dir = tempdir().expect("failed to create temp dir");
        fs::write(dir.path().join("a.yaml"), pattern_yaml("a")).expect("failed to write");
        fs::write(dir.path().join("b.yml"), pattern_yaml("b")).expect("failed to write");
        fs::write(dir.path().join("notes.txt"), "ignored").expect("failed to write");
        fs::write(
            dir.path().join("broken.yaml"),
            pattern_yaml("broken").replace("factor: [\"1.0\", \"2.0\"]", "other: [x]"),
        )
        .expect("failed to write");

        let mut registry = PatternRegistry::new();
        let count = registry.load_directory(dir.path()).expect("failed to load");

        assert_eq!(count, 2);
        assert_eq!(registry.warnings().len(), 1);
        assert!(registry.warnings()[0].path.ends_with("broken.yaml"));
    }

    #[test]
    fn test_load_directory_recursive() {
        let dir = tempdir().expect("failed to create temp dir");
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).expect("failed to create subdir");
        fs::write(dir.path().join("top.yaml"), pattern_yaml("top")).expect("failed to write");
        fs::write(nested.join("deep.yaml"), pattern_yaml("deep")).expect("failed to write");

        let mut flat = PatternRegistry::new();
        assert_eq!(flat.load_directory(dir.path()).expect("load failed"), 1);

        let mut recursive = PatternRegistry::new();
        assert_eq!(
            recursive
                .load_directory_recursive(dir.path())
                .expect("load failed"),
            2
        );
        assert!(recursive.get("deep").is_ok());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let pattern: Pattern = serde_yaml::from_str(&pattern_yaml("dup")).expect("parse failed");
        let mut registry = PatternRegistry::new();
        registry.register(pattern.clone()).expect("first register");
        assert!(matches!(
            registry.register(pattern),
            Err(PatternError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_merge_and_filters() {
        let a: Pattern = serde_yaml::from_str(&pattern_yaml("a")).expect("parse failed");
        let b: Pattern = serde_yaml::from_str(&pattern_yaml("b")).expect("parse failed");

        let mut first = PatternRegistry::new();
        first.register(a.clone()).expect("register a");
        let mut second = PatternRegistry::new();
        second.register(a).expect("register a again");
        second.register(b).expect("register b");

        first.merge(second);
        assert_eq!(first.len(), 2);
        assert_eq!(first.warnings().len(), 1);
        assert_eq!(first.by_category("geometry").len(), 2);
        assert_eq!(first.by_complexity(1, 1).len(), 0);
        assert_eq!(first.by_complexity(2, 3).len(), 2);

        let ids: Vec<String> = first.into_patterns().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_get_missing() {
        let registry = PatternRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(PatternError::NotFound(_))
        ));
    }
}
