//! Deployment history records.

use super::{keyword_enum, required_keyword, required_ref, Schema};
use crate::entity::EntityId;
use crate::error::EntityResult;
use crate::value::{Attrs, Value};

keyword_enum! {
    pub enum DeploymentStatus {
        InProgress => "in_progress",
        Active => "active",
        Failed => "failed",
        RolledBack => "rolled_back",
    }
}

/// Source control provenance of a rollout.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GitInfo {
    pub sha: String,
    pub branch: Option<String>,
    pub message: Option<String>,
    pub author: Option<String>,
}

/// One rollout attempt. Only the in-progress record is ever rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub app: EntityId,
    pub app_version: Option<EntityId>,
    pub status: DeploymentStatus,
    pub started_at: u64,
    pub completed_at: Option<u64>,
    pub git: Option<GitInfo>,
    pub error: Option<String>,
}

impl Schema for Deployment {
    const KIND: &'static str = "deployment";
    const FIELDS: &'static [&'static str] = &[
        "deployment.app",
        "deployment.app_version",
        "deployment.status",
        "deployment.started_at",
        "deployment.completed_at",
        "deployment.git_sha",
        "deployment.git_branch",
        "deployment.git_message",
        "deployment.git_author",
        "deployment.error",
    ];
    const INDEXED: &'static [&'static str] = &["deployment.app", "deployment.status"];

    fn encode(&self, attrs: &mut Attrs) {
        attrs.set("deployment.app", Value::Ref(self.app.clone()));
        attrs.set_opt(
            "deployment.app_version",
            self.app_version.clone().map(Value::Ref),
        );
        attrs.set("deployment.status", self.status.keyword());
        attrs.set("deployment.started_at", Value::Time(self.started_at));
        attrs.set_opt("deployment.completed_at", self.completed_at.map(Value::Time));
        let git = self.git.as_ref();
        attrs.set_opt("deployment.git_sha", git.map(|g| Value::string(&g.sha)));
        attrs.set_opt(
            "deployment.git_branch",
            git.and_then(|g| g.branch.as_ref()).map(Value::string),
        );
        attrs.set_opt(
            "deployment.git_message",
            git.and_then(|g| g.message.as_ref()).map(Value::string),
        );
        attrs.set_opt(
            "deployment.git_author",
            git.and_then(|g| g.author.as_ref()).map(Value::string),
        );
        attrs.set_opt("deployment.error", self.error.as_ref().map(Value::string));
    }

    fn decode(attrs: &Attrs) -> EntityResult<Self> {
        let git = attrs.string("deployment.git_sha").map(|sha| GitInfo {
            sha: sha.to_string(),
            branch: attrs.string("deployment.git_branch").map(str::to_string),
            message: attrs.string("deployment.git_message").map(str::to_string),
            author: attrs.string("deployment.git_author").map(str::to_string),
        });
        Ok(Self {
            app: required_ref(attrs, Self::KIND, "deployment.app")?,
            app_version: attrs.reference("deployment.app_version").cloned(),
            status: required_keyword(attrs, Self::KIND, "deployment.status")?,
            started_at: attrs.time("deployment.started_at").unwrap_or(0),
            completed_at: attrs.time("deployment.completed_at"),
            git,
            error: attrs.string("deployment.error").map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    #[test]
    fn deployment_round_trips_with_git_provenance() {
        let dep = Deployment {
            app: EntityId::parse("app/web").unwrap(),
            app_version: Some(EntityId::parse("app_version/web-v2").unwrap()),
            status: DeploymentStatus::Active,
            started_at: 1000,
            completed_at: Some(2000),
            git: Some(GitInfo {
                sha: "abc123".to_string(),
                branch: Some("main".to_string()),
                message: None,
                author: Some("dev@example.com".to_string()),
            }),
            error: None,
        };
        let entity =
            Entity::from_schema(EntityId::parse("deployment/web-1").unwrap(), &dep).unwrap();
        assert_eq!(entity.decode::<Deployment>().unwrap(), dep);
    }

    #[test]
    fn status_keywords() {
        assert_eq!(DeploymentStatus::RolledBack.as_str(), "rolled_back");
        assert_eq!(
            "in_progress".parse::<DeploymentStatus>().unwrap(),
            DeploymentStatus::InProgress
        );
    }
}
