use serde::{Deserialize, Serialize};

/// The (target, database, branch) triple a draft is scoped to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkContext {
    #[serde(default)]
    pub target_id: String,
    #[serde(default)]
    pub db_name: String,
    #[serde(default)]
    pub branch_name: String,
}

impl WorkContext {
    pub fn new(
        target_id: impl Into<String>,
        db_name: impl Into<String>,
        branch_name: impl Into<String>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            db_name: db_name.into(),
            branch_name: branch_name.into(),
        }
    }

    /// All three parts are set.
    pub fn is_complete(&self) -> bool {
        !self.target_id.is_empty() && !self.db_name.is_empty() && !self.branch_name.is_empty()
    }

    /// Selecting a target drops the database and branch selection.
    pub fn with_target(&self, target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            db_name: String::new(),
            branch_name: String::new(),
        }
    }

    /// Selecting a database drops the branch selection.
    pub fn with_database(&self, db_name: impl Into<String>) -> Self {
        Self {
            target_id: self.target_id.clone(),
            db_name: db_name.into(),
            branch_name: String::new(),
        }
    }

    pub fn with_branch(&self, branch_name: impl Into<String>) -> Self {
        Self {
            target_id: self.target_id.clone(),
            db_name: self.db_name.clone(),
            branch_name: branch_name.into(),
        }
    }

    pub fn is_on_branch(&self, branch: &str) -> bool {
        self.branch_name == branch
    }
}

impl std::fmt::Display for WorkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let part = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };
        write!(
            f,
            "{}/{}@{}",
            part(&self.target_id),
            part(&self.db_name),
            part(&self.branch_name)
        )
    }
}
