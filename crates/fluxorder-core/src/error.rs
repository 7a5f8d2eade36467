use thiserror::Error;

#[derive(Debug, Error)]
pub enum FluxError {
    #[error("not initialized: run 'fluxorder init'")]
    NotInitialized,

    #[error("unit not found: {0}")]
    UnitNotFound(String),

    #[error("duplicate unit declaration: {0}")]
    DuplicateUnit(String),

    #[error("invalid unit name '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidName(String),

    #[error("invalid interval '{0}': expected a duration such as 30s, 10m or 1h30m")]
    InvalidInterval(String),

    #[error("unit '{unit}' depends on undeclared unit '{dependency}'")]
    UnknownDependency { unit: String, dependency: String },

    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("invalid declaration in {file}: {reason}")]
    InvalidDeclaration { file: String, reason: String },

    #[error("render error: {0}")]
    Render(String),

    #[error("source error for '{path}': {reason}")]
    Source { path: String, reason: String },

    #[error("image policy error: {0}")]
    ImagePolicy(String),

    #[error("state store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FluxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_path_in_order() {
        let err = FluxError::CycleDetected {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }
}
