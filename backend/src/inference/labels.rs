use std::fs;

#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    #[error("Failed to read labels file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Labels file contains no classes")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub class_id: String,
    pub class_name: String,
}

/// Ordered label space of the model; index `i` names output score `i`.
#[derive(Debug, Clone)]
pub struct LabelSet {
    labels: Vec<Label>,
}

impl LabelSet {
    pub fn load(path: &str) -> Result<Self, LabelError> {
        let text = fs::read_to_string(path).map_err(|source| LabelError::Io {
            path: path.to_string(),
            source,
        })?;
        let labels = Self::parse(&text)?;
        log::info!("Loaded {} class labels from {}", labels.len(), path);
        Ok(labels)
    }

    /// One class per non-empty line: `class_id class_name` or a bare name,
    /// in which case the line index becomes the id.
    pub fn parse(text: &str) -> Result<Self, LabelError> {
        let labels: Vec<Label> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .enumerate()
            .map(|(index, line)| match line.split_once(char::is_whitespace) {
                Some((id, name)) => Label {
                    class_id: id.to_string(),
                    class_name: name.trim().to_string(),
                },
                None => Label {
                    class_id: index.to_string(),
                    class_name: line.to_string(),
                },
            })
            .collect();

        if labels.is_empty() {
            return Err(LabelError::Empty);
        }
        Ok(Self { labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn get(&self, index: usize) -> Option<&Label> {
        self.labels.get(index)
    }
}
