use std::env;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// Optional YAML configuration mirroring the CLI surface; CLI flags win over
/// file values.
#[derive(Debug, Default, Deserialize, Serialize, Clone)]
pub struct ConfigFile {
    pub target: Option<String>,
    pub wordlist: Option<String>,
    pub quick: Option<bool>,
    pub quick_wordlist: Option<String>,
    pub concurrency: Option<usize>,
    pub timeout: Option<u64>,
    pub method: Option<String>,
    pub follow_redirects: Option<bool>,
    pub match_status: Option<String>,
    pub filter_size: Option<String>,
    pub similarity_threshold: Option<f64>,
    pub no_baseline: Option<bool>,
    pub show_similarity: Option<bool>,
    pub progress_file: Option<String>,
    pub attempt_log: Option<String>,
    pub run_id: Option<String>,
    pub pre_hook: Option<String>,
    pub output: Option<String>,
    pub verifier: Option<String>,
    pub no_color: Option<bool>,
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("USERPROFILE").map(PathBuf::from))
        .or_else(|| {
            let drive = env::var_os("HOMEDRIVE")?;
            let path = env::var_os("HOMEPATH")?;
            Some(PathBuf::from(drive).join(path))
        })
}

pub fn default_config_path() -> Option<PathBuf> {
    Some(home_dir()?.join(".delver").join("config.yml"))
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn load_config(path: &PathBuf, allow_missing: bool) -> Result<ConfigFile, String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_yaml::from_str::<ConfigFile>(&contents)
            .map_err(|e| format!("failed to parse config '{}': {e}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && allow_missing => {
            Ok(ConfigFile::default())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(format!("config file not found '{}'", path.display()))
        }
        Err(e) => Err(format!("failed to read config '{}': {e}", path.display())),
    }
}

fn default_config_yaml() -> String {
    r#"# Delver config
#
# Location (default):
#   ~/.delver/config.yml

# Target template; FUZZ, {{FUZZ}} and %s are recognized placeholders.
# target: https://example.com/FUZZ

# Input
# wordlist: ./wordlists/common.txt
# quick: false
# quick_wordlist: ./wordlists/common.quick.txt

# Performance
concurrency: 10
timeout: 10

# HTTP
method: HEAD
follow_redirects: false

# Matching
# match_status: "200,204,301,302,401,403"
# filter_size: "100-5000"
similarity_threshold: 0.6
no_baseline: false

# Resume
# progress_file: ./delver-progress.json
# attempt_log: ./delver-attempts.jsonl
# run_id: ""

# Hooks
# pre_hook: ./fetch-auth.sh
# verifier: ./plugins/verify.py

# Output
# output: ./results.jsonl
show_similarity: false
no_color: false
"#
    .to_string()
}

pub fn ensure_default_config_file(path: &PathBuf) -> Result<(), String> {
    if path.exists() {
        return Ok(());
    }
    let parent = path
        .parent()
        .ok_or_else(|| format!("invalid config path '{}'", path.display()))?;
    std::fs::create_dir_all(parent).map_err(|e| {
        format!(
            "failed to create config directory '{}': {e}",
            parent.display()
        )
    })?;
    let contents = default_config_yaml();
    std::fs::write(path, contents)
        .map_err(|e| format!("failed to write config file '{}': {e}", path.display()))?;
    Ok(())
}
