use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::RecordId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeuristicStatus {
    #[default]
    Ok,
    Disabled,
    Deleted,
}

/// A versioned feature-extraction plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeuristicVersion {
    pub id: RecordId,
    pub author: String,
    pub name: String,
    pub version: u32,
    pub status: HeuristicStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub status_date: Option<OffsetDateTime>,
    /// Compiled, analyzed and tested by a Compilation Server.
    #[serde(default)]
    pub checked: bool,
    /// Every evaluation experiment of the version is done.
    #[serde(default)]
    pub evaluated: bool,
    #[serde(default)]
    pub public: bool,
    /// Simple heuristics are neither evaluated nor signed.
    #[serde(default)]
    pub simple: bool,
    /// Global rank among the evaluated versions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<i64>,
    /// Source file, relative to the author's folder of its repository.
    #[serde(default)]
    pub filename: String,
}

impl HeuristicVersion {
    /// Name used on the wire: `author/name`, or `author/name/version` past the first version.
    pub fn fullname(&self) -> String {
        if self.version > 1 {
            format!("{}/{}/{}", self.author.to_lowercase(), self.name, self.version)
        } else {
            format!("{}/{}", self.author.to_lowercase(), self.name)
        }
    }

    /// `author/name/version`, whatever the version.
    pub fn absolutename(&self) -> String {
        format!("{}/{}/{}", self.author.to_lowercase(), self.name, self.version)
    }

    pub fn matches(&self, author: &str, name: &str, version: u32) -> bool {
        self.author.eq_ignore_ascii_case(author) && self.name == name && self.version == version
    }

    /// Whether both are versions of the same heuristic.
    pub fn same_heuristic(&self, other: &HeuristicVersion) -> bool {
        self.author.eq_ignore_ascii_case(&other.author) && self.name == other.name
    }

    /// File name of the version once moved to the heuristics repository:
    /// `<slug>.cpp`, or `<slug>_v<version>.cpp` past the first version.
    pub fn repository_filename(&self) -> String {
        let slug = slugify(&self.name);
        if self.version > 1 {
            format!("{slug}_v{}.cpp", self.version)
        } else {
            format!("{slug}.cpp")
        }
    }
}

/// Lower-case ASCII letters, digits, `_` and `-`, whitespace runs turned
/// into a single `-`.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for c in text.trim().chars() {
        if c.is_whitespace() || c == '-' {
            pending_dash = !slug.is_empty();
        } else if c.is_ascii_alphanumeric() || c == '_' {
            if pending_dash {
                slug.push('-');
                pending_dash = false;
            }
            slug.push(c.to_ascii_lowercase());
        }
    }
    slug
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstrumentStatus {
    #[default]
    Enabled,
    Experimental,
    Disabled,
    Builtin,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: RecordId,
    pub author: String,
    pub name: String,
    pub status: InstrumentStatus,
}

impl Instrument {
    pub fn fullname(&self) -> String {
        format!("{}/{}", self.author.to_lowercase(), self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginErrorType {
    Crash,
    Timeout,
    #[default]
    Other,
}

/// Structured description of a plugin failure reported by an Experiment Server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginErrorReport {
    pub id: RecordId,
    pub experiment: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heuristic_version: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goalplanner: Option<String>,
    pub error_type: PluginErrorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

impl PluginErrorReport {
    /// The plugin the report is about, as shown in e-mails.
    pub fn culprit(&self) -> String {
        if let Some(id) = self.heuristic_version {
            format!("heuristic version #{id}")
        } else if let Some(id) = self.instrument {
            format!("instrument #{id}")
        } else if let Some(name) = self.classifier.as_deref() {
            format!("classifier {name}")
        } else if let Some(name) = self.goalplanner.as_deref() {
            format!("goal-planner {name}")
        } else {
            "unknown plugin".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_version_fullname_omits_version() {
        let hv = HeuristicVersion {
            author: "User1".into(),
            name: "heuristic1".into(),
            version: 1,
            ..Default::default()
        };
        assert_eq!(hv.fullname(), "user1/heuristic1");

        assert_eq!(hv.absolutename(), "user1/heuristic1/1");

        let hv = HeuristicVersion { version: 3, ..hv };
        assert_eq!(hv.fullname(), "user1/heuristic1/3");
    }

    #[test]
    fn matches_ignores_author_case() {
        let hv = HeuristicVersion {
            author: "User1".into(),
            name: "h".into(),
            version: 2,
            ..Default::default()
        };
        assert!(hv.matches("user1", "h", 2));
        assert!(!hv.matches("user1", "h", 1));
    }

    #[test]
    fn repository_filename_is_slugified() {
        let hv = HeuristicVersion {
            name: "My Heuristic".into(),
            version: 1,
            ..Default::default()
        };
        assert_eq!(hv.repository_filename(), "my-heuristic.cpp");

        let hv = HeuristicVersion { version: 2, ..hv };
        assert_eq!(hv.repository_filename(), "my-heuristic_v2.cpp");
    }

    #[test]
    fn slugify_drops_punctuation() {
        assert_eq!(slugify("  user1/Edges  (fast) "), "user1edges-fast");
        assert_eq!(slugify("a -- b"), "a-b");
    }

    #[test]
    fn report_culprit_prefers_heuristic() {
        let report = PluginErrorReport {
            heuristic_version: Some(4),
            classifier: Some("user/svm".into()),
            ..Default::default()
        };
        assert_eq!(report.culprit(), "heuristic version #4");
    }
}
