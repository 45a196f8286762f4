use thiserror::Error;

use crate::model::{FieldIssue, ProfileId};

/// 配置生成失败；阻止启动，不会自动重试
#[derive(Debug, Clone, Error)]
pub enum ConfigValidationError {
    #[error("{entity}: {} invalid field(s): {}", issues.len(), join_issues(issues))]
    InvalidFields {
        entity: String,
        issues: Vec<FieldIssue>,
    },

    #[error("{entity}: chain cycle {}", join_path(path))]
    ChainCycle { entity: String, path: Vec<ProfileId> },

    #[error("{entity}: referenced profile #{id} does not exist")]
    MissingProfile { entity: String, id: ProfileId },
}

impl ConfigValidationError {
    /// 出问题的字段名，非字段类错误为空
    pub fn fields(&self) -> Vec<&str> {
        match self {
            ConfigValidationError::InvalidFields { issues, .. } => {
                issues.iter().map(|i| i.field.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn entity(&self) -> &str {
        match self {
            ConfigValidationError::InvalidFields { entity, .. }
            | ConfigValidationError::ChainCycle { entity, .. }
            | ConfigValidationError::MissingProfile { entity, .. } => entity,
        }
    }
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|i| {
            if i.entity.is_empty() {
                format!("{}: {}", i.field, i.message)
            } else {
                i.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_path(path: &[ProfileId]) -> String {
    path.iter()
        .map(|id| format!("#{id}"))
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_lists_every_issue() {
        let err = ConfigValidationError::InvalidFields {
            entity: "#1 a".into(),
            issues: vec![
                FieldIssue {
                    entity: "#1 a".into(),
                    field: "server".into(),
                    message: "required".into(),
                },
                FieldIssue {
                    entity: "#1 a".into(),
                    field: "port".into(),
                    message: "must be in 1..=65535".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 invalid field(s)"));
        assert!(msg.contains("server: required"));
        assert!(msg.contains("port: must be"));
        assert_eq!(err.fields(), vec!["server", "port"]);
    }

    #[test]
    fn cycle_path_rendered() {
        let err = ConfigValidationError::ChainCycle {
            entity: "#5 chain".into(),
            path: vec![5, 6, 5],
        };
        assert_eq!(err.to_string(), "#5 chain: chain cycle #5 -> #6 -> #5");
    }
}
