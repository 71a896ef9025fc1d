//! Renders `.tmpl` stage scripts from the environment's script config.
//!
//! A build may ship templates such as `deployd/RESTARTING.tmpl`. On first
//! staging the script directory is copied to `deployd_template/`, and every
//! template found there is rendered back into `deployd/` without its suffix.
//! Two placeholder forms are understood:
//!
//! - `${DEPLOYD_KEY}` or `${DEPLOYD_KEY:default}` (also `{$DEPLOYD_KEY...}`),
//!   replaced by the configured value, else the default, else left alone
//! - `$DEPLOYD_KEY` or `$DEPLOYD_{KEY}`, replaced only when `KEY` is configured

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::{Captures, Regex};
use tracing::{debug, info};

use crate::deploy::hooks::SCRIPT_DIR_NAME;
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::storage::layout::StorageLayout;

/// Pristine copy of the build's script directory
pub const TEMPLATE_DIR_NAME: &str = "deployd_template";

const TEMPLATE_SUFFIX: &str = ".tmpl";

const DEFAULTED: &str = r"(?:\{\$|\$\{)DEPLOYD_(?P<key>[a-zA-Z0-9\-_]+)(?P<colon>:)?(?P<default>.*?)\}";
const PLAIN: &str = r"\$DEPLOYD_(?:(?P<named>[a-zA-Z][_a-zA-Z0-9\-]*)|\{(?P<braced>[a-zA-Z][_a-zA-Z0-9\-]*)\})";

pub struct ScriptTransformer {
    values: BTreeMap<String, String>,
    defaulted: Regex,
    plain: Regex,
}

impl ScriptTransformer {
    pub fn new(values: BTreeMap<String, String>) -> Result<Self, AgentError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| AgentError::InvariantError(format!("template pattern: {}", e)))
        };
        Ok(Self {
            values,
            defaulted: compile(DEFAULTED)?,
            plain: compile(PLAIN)?,
        })
    }

    /// Values from `<agent_dir>/<env>_SCRIPT_CONFIG`; a missing file means none
    pub async fn load(layout: &StorageLayout, env_name: &str) -> Result<Self, AgentError> {
        let file = layout.script_config_file(env_name);
        let values = if file.exists().await {
            parse_script_config(&file.read_string().await?)
        } else {
            BTreeMap::new()
        };
        Self::new(values)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn render(&self, template: &str) -> String {
        let defaulted = self.defaulted.replace_all(template, |caps: &Captures| {
            let key = &caps["key"];
            let fallback = caps.name("colon").map(|_| &caps["default"]);
            match self.values.get(key).map(String::as_str).or(fallback) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        });
        self.plain
            .replace_all(&defaulted, |caps: &Captures| {
                let key = caps
                    .name("named")
                    .or_else(|| caps.name("braced"))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match self.values.get(key) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Render every template under `<target>/deployd_template` into
    /// `<target>/deployd`. Returns how many scripts were written.
    pub async fn transform(&self, target: &Path) -> Result<usize, AgentError> {
        let script_dir = Dir::new(target.join(SCRIPT_DIR_NAME));
        if !script_dir.exists().await {
            debug!("No script directory under {:?}, nothing to render", target);
            return Ok(0);
        }

        let template_dir = Dir::new(target.join(TEMPLATE_DIR_NAME));
        if !template_dir.exists().await {
            copy_tree(script_dir.path(), template_dir.path()).await?;
        }

        let mut rendered = 0;
        for template in walk_files(template_dir.path()).await? {
            let Ok(relative) = template.strip_prefix(template_dir.path()) else {
                continue;
            };
            let relative = relative.to_string_lossy();
            let Some(script) = relative.strip_suffix(TEMPLATE_SUFFIX) else {
                continue;
            };

            let source = File::new(&template).read_string().await?;
            let dest = File::new(script_dir.path().join(script));
            dest.write_atomic(self.render(&source).as_bytes()).await?;
            info!("Rendered {:?} to {:?}", template, dest.path());
            rendered += 1;
        }
        Ok(rendered)
    }
}

/// `KEY=value` lines; surrounding quotes and spaces are dropped from both sides
pub fn parse_script_config(contents: &str) -> BTreeMap<String, String> {
    let trim = |s: &str| s.trim_matches(|c: char| matches!(c, '"' | '\'' | ' ' | '\n' | '\r')).to_string();
    contents
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (trim(key), trim(value)))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

async fn walk_files(root: &Path) -> Result<Vec<PathBuf>, AgentError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let dir = Dir::new(dir);
        files.extend(dir.list_files().await?);
        pending.extend(dir.list_dirs().await?);
    }
    files.sort();
    Ok(files)
}

async fn copy_tree(from: &Path, to: &Path) -> Result<(), AgentError> {
    for file in walk_files(from).await? {
        let Ok(relative) = file.strip_prefix(from) else {
            continue;
        };
        let dest = to.join(relative);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&file, &dest).await?;
    }
    Dir::new(to).create().await
}
