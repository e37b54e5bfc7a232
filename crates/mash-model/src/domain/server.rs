use serde::{Deserialize, Serialize};

use super::{ConfigurationType, RecordId, TaskType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerType {
    Unknown,
    #[default]
    Unidentified,
    Compilation,
    Experiments,
    Application,
    Clustering,
    Debugging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerSubtype {
    #[default]
    None,
    Images,
    Interactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    #[default]
    Unknown,
    Online,
    Offline,
}

/// Goal offered by an interactive application server, with its environments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvidedGoal {
    pub name: String,
    #[serde(default)]
    pub environments: Vec<String>,
}

/// A machine of the computation farm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: RecordId,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub server_type: ServerType,
    pub subtype: ServerSubtype,
    pub status: ServerStatus,
    /// Task families an experiment server accepts.
    #[serde(default)]
    pub supported_tasks: Vec<TaskType>,
    /// When set, the server only runs experiments of this type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrict_experiment: Option<ConfigurationType>,
    #[serde(default)]
    pub provided_databases: Vec<String>,
    #[serde(default)]
    pub provided_goals: Vec<ProvidedGoal>,
    /// Algorithm of a Clustering Server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clustering_algorithm: Option<String>,
}

impl Server {
    pub fn provides_database(&self, name: &str) -> bool {
        self.provided_databases.iter().any(|db| db == name)
    }

    pub fn provides_goal(&self, goal: &str, environment: &str) -> bool {
        self.provided_goals
            .iter()
            .any(|g| g.name == goal && g.environments.iter().any(|e| e == environment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_lookup_requires_matching_environment() {
        let server = Server {
            provided_goals: vec![ProvidedGoal {
                name: "reach".into(),
                environments: vec!["maze".into()],
            }],
            ..Default::default()
        };
        assert!(server.provides_goal("reach", "maze"));
        assert!(!server.provides_goal("reach", "arena"));
        assert!(!server.provides_goal("grab", "maze"));
    }

    #[test]
    fn database_lookup() {
        let server = Server {
            provided_databases: vec!["mnist".into()],
            ..Default::default()
        };
        assert!(server.provides_database("mnist"));
        assert!(!server.provides_database("coil"));
    }
}
