use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::warn;

/// Metadata parsed from a skill's YAML frontmatter.
pub struct SkillInfo {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
    pub always: bool,
    pub available: bool,
    pub missing_requirements: Vec<String>,
}

/// Loads markdown-based skills from the workspace `skills/` directory.
///
/// Each skill is a `skills/<name>/SKILL.md` file with frontmatter. Skills
/// marked `always: true` are injected into every context in full; the rest
/// appear as a one-line summary the agent can expand with `read_file`.
pub struct SkillsLoader {
    workspace_skills: PathBuf,
    frontmatter_re: Regex,
}

impl SkillsLoader {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace_skills: workspace.join("skills"),
            frontmatter_re: Regex::new(r"(?s)^---\n(.*?)\n---").unwrap(),
        }
    }

    /// List all available skills with metadata.
    pub fn list_skills(&self) -> Vec<SkillInfo> {
        let mut skills = Vec::new();

        let entries = match std::fs::read_dir(&self.workspace_skills) {
            Ok(e) => e,
            Err(_) => return skills,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let skill_file = path.join("SKILL.md");
            if !skill_file.exists() {
                continue;
            }

            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .to_string();

            let content = match std::fs::read_to_string(&skill_file) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to read skill {name}: {e}");
                    continue;
                }
            };

            let meta = self.parse_frontmatter(&content);
            let description = meta.get("description").cloned().unwrap_or_default();
            let always = meta.get("always").map(|v| v == "true").unwrap_or(false);
            let (available, missing) = check_requirements(&meta);

            skills.push(SkillInfo {
                name,
                description,
                path: skill_file,
                always,
                available,
                missing_requirements: missing,
            });
        }

        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    /// Get names of skills marked as `always: true`.
    pub fn get_always_skills(&self) -> Vec<String> {
        self.list_skills()
            .into_iter()
            .filter(|s| s.always && s.available)
            .map(|s| s.name)
            .collect()
    }

    /// Load a skill's full content by name.
    pub fn load_skill(&self, name: &str) -> Option<String> {
        let path = self.workspace_skills.join(name).join("SKILL.md");
        std::fs::read_to_string(path).ok()
    }

    /// Load specific skills for context injection, stripping frontmatter.
    pub fn load_skills_for_context(&self, skill_names: &[String]) -> String {
        let mut parts = Vec::new();
        for name in skill_names {
            if let Some(content) = self.load_skill(name) {
                let body = self.strip_frontmatter(&content).to_string();
                parts.push(format!("### Skill: {name}\n\n{body}"));
            }
        }
        parts.join("\n\n---\n\n")
    }

    /// Build a summary of non-always skills for the system prompt.
    pub fn build_skills_summary(&self) -> String {
        let skills = self.list_skills();
        let mut lines = Vec::new();
        for s in &skills {
            if s.always {
                continue; // Always-loaded skills are shown in full, not in summary
            }
            let mut line = format!(
                "- **{}** — {} (`{}`)",
                s.name,
                s.description,
                s.path.display()
            );
            if !s.available {
                let missing = s.missing_requirements.join(", ");
                line.push_str(&format!(" [needs: {missing}]"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }

    fn parse_frontmatter(&self, content: &str) -> HashMap<String, String> {
        let mut meta = HashMap::new();

        if let Some(caps) = self.frontmatter_re.captures(content) {
            let yaml_block = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            for line in yaml_block.lines() {
                if let Some((key, value)) = line.split_once(':') {
                    let key = key.trim().to_string();
                    let value = value
                        .trim()
                        .trim_matches('"')
                        .trim_matches('\'')
                        .to_string();
                    meta.insert(key, value);
                }
            }
        }

        meta
    }

    fn strip_frontmatter<'a>(&self, content: &'a str) -> &'a str {
        if let Some(m) = self.frontmatter_re.find(content) {
            content[m.end()..].trim_start()
        } else {
            content
        }
    }
}

/// Check a skill's declared requirements (binaries on PATH, env vars).
fn check_requirements(meta: &HashMap<String, String>) -> (bool, Vec<String>) {
    let mut missing = Vec::new();

    let metadata_str = match meta.get("metadata") {
        Some(s) => s,
        None => return (true, missing),
    };

    let skill_meta: serde_json::Value = match serde_json::from_str(metadata_str) {
        Ok(v) => v,
        Err(_) => return (true, missing),
    };

    let requires = match skill_meta.get("coracle").and_then(|n| n.get("requires")) {
        Some(r) => r,
        None => return (true, missing),
    };

    if let Some(bins) = requires.get("bins").and_then(|b| b.as_array()) {
        for bin in bins {
            if let Some(bin_name) = bin.as_str() {
                if which::which(bin_name).is_err() {
                    missing.push(format!("CLI: {bin_name}"));
                }
            }
        }
    }

    if let Some(envs) = requires.get("env").and_then(|e| e.as_array()) {
        for env in envs {
            if let Some(env_name) = env.as_str() {
                if std::env::var(env_name).is_err() {
                    missing.push(format!("ENV: {env_name}"));
                }
            }
        }
    }

    (missing.is_empty(), missing)
}
