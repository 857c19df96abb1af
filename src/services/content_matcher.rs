//! Content script matching and injection planning.
//!
//! Patterns compile to anchored regexes once, when an extension's content
//! scripts are registered. Per navigation the matcher only evaluates them.

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::host::{InjectionTime, UserScript};
use crate::services::extension_files::read_extension_file;
use crate::types::errors::{ManifestError, RuntimeError};
use crate::types::manifest::{ContentScriptDescriptor, RunAt};

const ALL_URLS: &str = "<all_urls>";

/// A compiled URL match pattern.
#[derive(Debug, Clone)]
pub struct MatchPattern {
    source: String,
    /// `None` for `<all_urls>`.
    regex: Option<Regex>,
}

impl MatchPattern {
    pub fn compile(pattern: &str) -> Result<Self, ManifestError> {
        if pattern == ALL_URLS {
            return Ok(Self {
                source: pattern.to_string(),
                regex: None,
            });
        }
        let mut expr = String::with_capacity(pattern.len() * 2 + 2);
        expr.push('^');
        for c in pattern.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => {
                    let mut buf = [0u8; 4];
                    expr.push_str(&regex::escape(other.encode_utf8(&mut buf)));
                }
            }
        }
        expr.push('$');
        let regex = Regex::new(&expr).map_err(|_| ManifestError::InvalidHostPattern(pattern.to_string()))?;
        Ok(Self {
            source: pattern.to_string(),
            regex: Some(regex),
        })
    }

    pub fn matches(&self, url: &str) -> bool {
        match &self.regex {
            None => true,
            Some(re) => re.is_match(url),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<MatchPattern>, ManifestError> {
    patterns.iter().map(|p| MatchPattern::compile(p)).collect()
}

/// `true` when at least one include pattern matches and no exclude pattern does.
pub fn should_inject(descriptor: &ContentScriptDescriptor, url: &str) -> bool {
    match (compile_all(&descriptor.matches), compile_all(&descriptor.exclude_matches)) {
        (Ok(includes), Ok(excludes)) => decide(&includes, &excludes, url),
        _ => false,
    }
}

fn decide(includes: &[MatchPattern], excludes: &[MatchPattern], url: &str) -> bool {
    includes.iter().any(|p| p.matches(url)) && !excludes.iter().any(|p| p.matches(url))
}

/// Script timing for a descriptor. Idle runs with document-end.
pub fn injection_time(run_at: RunAt) -> InjectionTime {
    match run_at {
        RunAt::DocumentStart => InjectionTime::DocumentStart,
        RunAt::DocumentEnd | RunAt::DocumentIdle => InjectionTime::DocumentEnd,
    }
}

/// Wraps a stylesheet in a script that appends it to the document head.
pub fn css_injection_script(extension_id: &str, css: &str) -> String {
    let css = serde_json::Value::String(css.to_string()).to_string();
    let id = serde_json::Value::String(extension_id.to_string()).to_string();
    format!(
        "(function(){{var s=document.createElement('style');s.setAttribute('data-extension-id',{});s.textContent={};(document.head||document.documentElement).appendChild(s);}})();",
        id, css
    )
}

/// Frame a navigation happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Top,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionKind {
    Script,
    Style,
}

/// One file to inject into one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedInjection {
    pub extension_id: String,
    pub descriptor_index: usize,
    pub file: String,
    pub kind: InjectionKind,
    pub timing: InjectionTime,
    pub all_frames: bool,
    /// Ready to evaluate; stylesheets are already wrapped.
    pub source: String,
}

/// A registered descriptor with its patterns compiled and files loaded.
#[derive(Debug, Clone)]
pub struct CompiledContentScript {
    pub extension_id: String,
    pub index: usize,
    pub descriptor: ContentScriptDescriptor,
    includes: Vec<MatchPattern>,
    excludes: Vec<MatchPattern>,
    scripts: Vec<(String, String)>,
    styles: Vec<(String, String)>,
}

impl CompiledContentScript {
    pub fn compile(
        extension_id: &str,
        index: usize,
        descriptor: &ContentScriptDescriptor,
        install_path: &Path,
    ) -> Result<Self, RuntimeError> {
        let includes = compile_all(&descriptor.matches)?;
        let excludes = compile_all(&descriptor.exclude_matches)?;
        let scripts = descriptor
            .js
            .iter()
            .map(|file| Ok((file.clone(), read_extension_file(install_path, file, extension_id)?)))
            .collect::<Result<Vec<_>, RuntimeError>>()?;
        let styles = descriptor
            .css
            .iter()
            .map(|file| Ok((file.clone(), read_extension_file(install_path, file, extension_id)?)))
            .collect::<Result<Vec<_>, RuntimeError>>()?;
        Ok(Self {
            extension_id: extension_id.to_string(),
            index,
            descriptor: descriptor.clone(),
            includes,
            excludes,
            scripts,
            styles,
        })
    }

    pub fn should_inject(&self, url: &str) -> bool {
        decide(&self.includes, &self.excludes, url)
    }

    pub fn applies_to_frame(&self, frame: FrameKind) -> bool {
        frame == FrameKind::Top || self.descriptor.all_frames
    }

    /// Files to inject, styles first so they apply before scripts read layout.
    pub fn injections(&self) -> Vec<PlannedInjection> {
        let mut planned = Vec::with_capacity(self.styles.len() + self.scripts.len());
        for (file, css) in &self.styles {
            planned.push(PlannedInjection {
                extension_id: self.extension_id.clone(),
                descriptor_index: self.index,
                file: file.clone(),
                kind: InjectionKind::Style,
                timing: InjectionTime::DocumentEnd,
                all_frames: self.descriptor.all_frames,
                source: css_injection_script(&self.extension_id, css),
            });
        }
        let timing = injection_time(self.descriptor.run_at);
        for (file, js) in &self.scripts {
            planned.push(PlannedInjection {
                extension_id: self.extension_id.clone(),
                descriptor_index: self.index,
                file: file.clone(),
                kind: InjectionKind::Script,
                timing,
                all_frames: self.descriptor.all_frames,
                source: js.clone(),
            });
        }
        planned
    }

    pub fn user_scripts(&self) -> Vec<UserScript> {
        self.injections()
            .into_iter()
            .map(|p| UserScript {
                extension_id: p.extension_id,
                file: p.file,
                source: p.source,
                timing: p.timing,
                all_frames: p.all_frames,
                matches: self.descriptor.matches.clone(),
                exclude_matches: self.descriptor.exclude_matches.clone(),
            })
            .collect()
    }
}

/// Registry of compiled content scripts in registration order.
#[derive(Debug, Default)]
pub struct ContentScriptMatcher {
    next_seq: u64,
    scripts: BTreeMap<u64, CompiledContentScript>,
}

impl ContentScriptMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_registered(&self, extension_id: &str, index: usize) -> bool {
        self.scripts
            .values()
            .any(|s| s.extension_id == extension_id && s.index == index)
    }

    /// Compiles every descriptor of an extension. Already registered descriptors are kept as is.
    ///
    /// All-or-nothing: a missing file leaves none of the extension's new
    /// descriptors registered.
    pub fn register(
        &mut self,
        extension_id: &str,
        install_path: &Path,
        descriptors: &[ContentScriptDescriptor],
    ) -> Result<usize, RuntimeError> {
        let mut compiled = Vec::new();
        for (index, descriptor) in descriptors.iter().enumerate() {
            if self.is_registered(extension_id, index) {
                continue;
            }
            compiled.push(CompiledContentScript::compile(extension_id, index, descriptor, install_path)?);
        }
        let added = compiled.len();
        for script in compiled {
            self.scripts.insert(self.next_seq, script);
            self.next_seq += 1;
        }
        debug!(target: "content_scripts", extension_id, added, "registered content scripts");
        Ok(added)
    }

    pub fn unregister(&mut self, extension_id: &str) -> usize {
        let before = self.scripts.len();
        self.scripts.retain(|_, s| s.extension_id != extension_id);
        before - self.scripts.len()
    }

    pub fn count(&self, extension_id: &str) -> usize {
        self.scripts.values().filter(|s| s.extension_id == extension_id).count()
    }

    /// Descriptors that apply to a navigation.
    pub fn matching(&self, url: &str, frame: FrameKind) -> Vec<&CompiledContentScript> {
        self.scripts
            .values()
            .filter(|s| s.applies_to_frame(frame) && s.should_inject(url))
            .collect()
    }

    /// Every file to inject for a navigation, in registration order.
    pub fn plan(&self, url: &str, frame: FrameKind) -> Vec<PlannedInjection> {
        self.matching(url, frame)
            .into_iter()
            .flat_map(CompiledContentScript::injections)
            .collect()
    }
}
