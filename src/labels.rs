use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelError {
    #[error("failed to read class list {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("class list is empty")]
    Empty,

    #[error("duplicate class label {0:?}")]
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassLabel {
    pub name: String,
    pub description: Option<String>,
}

/// Ordered class labels; index `i` names output `i` of the model.
#[derive(Debug, Clone)]
pub struct ClassLabels {
    labels: Vec<ClassLabel>,
}

impl ClassLabels {
    pub fn new(labels: Vec<ClassLabel>) -> Result<Self, LabelError> {
        if labels.is_empty() {
            return Err(LabelError::Empty);
        }
        for (i, label) in labels.iter().enumerate() {
            if labels[..i].iter().any(|l| l.name == label.name) {
                return Err(LabelError::Duplicate(label.name.clone()));
            }
        }
        Ok(Self { labels })
    }

    pub fn load(path: &Path) -> Result<Self, LabelError> {
        let content = std::fs::read_to_string(path).map_err(|source| LabelError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// One label per line, optionally `name | description`. Blank lines and
    /// `#` comments are skipped.
    pub fn parse(content: &str) -> Result<Self, LabelError> {
        let labels = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| match line.split_once('|') {
                Some((name, description)) => ClassLabel {
                    name: name.trim().to_string(),
                    description: Some(description.trim().to_string())
                        .filter(|d| !d.is_empty()),
                },
                None => ClassLabel {
                    name: line.to_string(),
                    description: None,
                },
            })
            .collect();
        Self::new(labels)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassLabel> {
        self.labels.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|l| l.name.as_str())
    }

    pub fn get(&self, index: usize) -> Option<&ClassLabel> {
        self.labels.get(index)
    }

    /// Human-readable description, falling back to the label itself.
    pub fn describe<'a>(&'a self, name: &'a str) -> &'a str {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .and_then(|l| l.description.as_deref())
            .unwrap_or(name)
    }

    pub fn has_descriptions(&self) -> bool {
        self.labels.iter().any(|l| l.description.is_some())
    }
}
