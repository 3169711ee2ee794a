//! Command gate for the exec tool.
//!
//! The permitted binary set is never cached: [`compute_allowlist`] is
//! evaluated from the static set and the currently enabled features at
//! every check, so toggling a feature takes effect on the next command.

use crate::config::ExecConfig;
use crate::errors::ExecError;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

pub trait AllowlistProvider: Send + Sync {
    fn allowed_binaries(&self) -> BTreeSet<String>;
}

pub fn compute_allowlist(
    static_set: &BTreeSet<String>,
    feature_binaries: &BTreeMap<String, Vec<String>>,
    enabled_features: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut allowed = static_set.clone();
    for feature in enabled_features {
        if let Some(binaries) = feature_binaries.get(feature) {
            allowed.extend(binaries.iter().cloned());
        }
    }
    allowed
}

/// Static binaries plus feature-gated extensions toggled at runtime.
pub struct FeatureAllowlist {
    static_set: BTreeSet<String>,
    feature_binaries: BTreeMap<String, Vec<String>>,
    enabled: RwLock<BTreeSet<String>>,
}

impl FeatureAllowlist {
    pub fn new(
        static_set: impl IntoIterator<Item = String>,
        feature_binaries: BTreeMap<String, Vec<String>>,
        enabled_features: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            static_set: static_set.into_iter().collect(),
            feature_binaries,
            enabled: RwLock::new(enabled_features.into_iter().collect()),
        }
    }

    pub fn from_config(config: &ExecConfig) -> Self {
        Self::new(
            config.static_allowlist.iter().cloned(),
            config.feature_binaries.clone(),
            config.enabled_features.iter().cloned(),
        )
    }

    pub fn enable_feature(&self, feature: &str) {
        self.enabled
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(feature.to_string());
    }

    pub fn disable_feature(&self, feature: &str) {
        self.enabled
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(feature);
    }

    pub fn enabled_features(&self) -> BTreeSet<String> {
        self.enabled
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AllowlistProvider for FeatureAllowlist {
    fn allowed_binaries(&self) -> BTreeSet<String> {
        compute_allowlist(
            &self.static_set,
            &self.feature_binaries,
            &self.enabled_features(),
        )
    }
}

/// Resolves binary names through the search path, then the fallback dirs.
#[derive(Clone, Debug)]
pub struct BinaryResolver {
    search_path: Vec<PathBuf>,
    fallback_dirs: Vec<PathBuf>,
}

impl BinaryResolver {
    pub fn new(search_path: Vec<PathBuf>, fallback_dirs: Vec<PathBuf>) -> Self {
        Self {
            search_path,
            fallback_dirs,
        }
    }

    pub fn from_config(config: &ExecConfig) -> Self {
        let search_path = config.search_path.clone().unwrap_or_else(|| {
            env::var_os("PATH")
                .map(|path| env::split_paths(&path).collect())
                .unwrap_or_default()
        });
        Self::new(search_path, config.fallback_dirs.clone())
    }

    /// A path-qualified binary resolves only when it lives in one of the
    /// search or fallback directories.
    pub fn resolve(&self, binary: &str) -> Option<PathBuf> {
        if binary.contains('/') {
            let path = PathBuf::from(binary);
            if !is_executable(&path) {
                return None;
            }
            let parent = path.parent()?.canonicalize().ok()?;
            let permitted = self
                .search_path
                .iter()
                .chain(self.fallback_dirs.iter())
                .filter_map(|dir| dir.canonicalize().ok())
                .any(|dir| dir == parent);
            return permitted.then_some(path);
        }
        self.search_path
            .iter()
            .chain(self.fallback_dirs.iter())
            .map(|dir| dir.join(binary))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Checks every segment of a command line against the allowlist.
#[derive(Clone)]
pub struct CommandGate {
    allowlist: Arc<dyn AllowlistProvider>,
    resolver: BinaryResolver,
}

impl CommandGate {
    pub fn new(allowlist: Arc<dyn AllowlistProvider>, resolver: BinaryResolver) -> Self {
        Self {
            allowlist,
            resolver,
        }
    }

    pub fn check(&self, command: &str) -> Result<Vec<PathBuf>, ExecError> {
        if command.contains('`') || command.contains("$(") {
            return Err(ExecError::AllowlistDenied(
                "command substitution is not permitted".to_string(),
            ));
        }
        let binaries = command_binaries(command);
        if binaries.is_empty() {
            return Err(ExecError::AllowlistDenied("empty command".to_string()));
        }

        let allowed = self.allowlist.allowed_binaries();
        let mut resolved = Vec::with_capacity(binaries.len());
        for binary in binaries {
            let name = Path::new(&binary)
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(binary.as_str());
            if !allowed.contains(name) {
                return Err(ExecError::AllowlistDenied(format!(
                    "`{name}` is not an allowed binary"
                )));
            }
            let path = self.resolver.resolve(&binary).ok_or_else(|| {
                ExecError::AllowlistDenied(format!(
                    "`{name}` was not found on the search path or fallback directories"
                ))
            })?;
            resolved.push(path);
        }
        Ok(resolved)
    }
}

/// First word of every `|`, `||`, `&&`, `;`, `&` or newline separated
/// segment, skipping leading `VAR=value` assignments.
pub fn command_binaries(command: &str) -> Vec<String> {
    split_segments(command)
        .iter()
        .filter_map(|segment| {
            split_words(segment)
                .into_iter()
                .find(|word| !is_env_assignment(word))
        })
        .collect()
}

fn is_env_assignment(word: &str) -> bool {
    let Some((name, _)) = word.split_once('=') else {
        return false;
    };
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn split_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = command.chars().peekable();

    while let Some(ch) = chars.next() {
        match (quote, ch) {
            (Some(open), c) if c == open => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(ch);
                current.push(ch);
            }
            (None, '\\') => {
                current.push(ch);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (None, '|' | '&' | ';' | '\n') => {
                if matches!(ch, '|' | '&') && chars.peek() == Some(&ch) {
                    chars.next();
                }
                // `2>&1` and `&>` are redirections, not separators.
                if ch == '&' && (current.ends_with('>') || chars.peek() == Some(&'>')) {
                    current.push(ch);
                    continue;
                }
                segments.push(std::mem::take(&mut current));
            }
            (None, c) => current.push(c),
        }
    }
    segments.push(current);
    segments
        .into_iter()
        .map(|segment| segment.trim().to_string())
        .filter(|segment| !segment.is_empty())
        .collect()
}

fn split_words(segment: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in segment.chars() {
        match (quote, ch) {
            (Some(open), c) if c == open => quote = None,
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => quote = Some(ch),
            (None, c) if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            (None, c) => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn compute_allowlist_adds_only_enabled_feature_binaries() {
        let features = BTreeMap::from([
            ("git".to_string(), vec!["git".to_string()]),
            ("media".to_string(), vec!["ffmpeg".to_string()]),
        ]);
        let allowed = compute_allowlist(&set(&["ls"]), &features, &set(&["git"]));
        assert_eq!(allowed, set(&["git", "ls"]));
    }

    #[test]
    fn feature_toggle_is_visible_on_next_check() {
        let allowlist = FeatureAllowlist::new(
            ["ls".to_string()],
            BTreeMap::from([("git".to_string(), vec!["git".to_string()])]),
            Vec::new(),
        );
        assert!(!allowlist.allowed_binaries().contains("git"));
        allowlist.enable_feature("git");
        assert!(allowlist.allowed_binaries().contains("git"));
        allowlist.disable_feature("git");
        assert!(!allowlist.allowed_binaries().contains("git"));
    }

    #[test]
    fn command_binaries_checks_every_segment() {
        assert_eq!(
            command_binaries("ls -la | grep foo && echo 'a|b'; FOO=1 cat x || true"),
            vec!["ls", "grep", "echo", "cat", "true"]
        );
    }

    #[test]
    fn redirections_are_not_segment_separators() {
        assert_eq!(command_binaries("make 2>&1"), vec!["make"]);
        assert_eq!(command_binaries("sleep 1 &"), vec!["sleep"]);
    }

    #[cfg(unix)]
    #[test]
    fn gate_denies_binaries_outside_the_allowlist() {
        let allowlist = Arc::new(FeatureAllowlist::new(
            ["sh".to_string()],
            BTreeMap::new(),
            Vec::new(),
        ));
        let resolver = BinaryResolver::new(
            vec![PathBuf::from("/bin"), PathBuf::from("/usr/bin")],
            Vec::new(),
        );
        let gate = CommandGate::new(allowlist, resolver);

        let error = gate
            .check("sh -c true | rm -rf /tmp/x")
            .expect_err("rm is not allowed");
        assert!(error.to_string().contains("`rm`"));
        assert!(gate.check("echo $(whoami)").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn resolver_falls_back_to_explicit_dirs() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let tool = tmp.path().join("relay-test-tool");
        std::fs::write(&tool, "#!/bin/sh\n").expect("write tool");
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755))
            .expect("chmod tool");

        let resolver = BinaryResolver::new(Vec::new(), vec![tmp.path().to_path_buf()]);
        assert_eq!(resolver.resolve("relay-test-tool"), Some(tool));
        assert_eq!(resolver.resolve("relay-missing-tool"), None);
    }

    #[cfg(unix)]
    #[test]
    fn path_qualified_binary_outside_known_dirs_is_denied() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let impostor = tmp.path().join("echo");
        std::fs::write(&impostor, "#!/bin/sh\n").expect("write impostor");
        std::fs::set_permissions(&impostor, std::fs::Permissions::from_mode(0o755))
            .expect("chmod impostor");

        let allowlist = Arc::new(FeatureAllowlist::new(
            ["echo".to_string()],
            BTreeMap::new(),
            Vec::new(),
        ));
        let resolver = BinaryResolver::new(
            vec![PathBuf::from("/bin"), PathBuf::from("/usr/bin")],
            Vec::new(),
        );
        let gate = CommandGate::new(allowlist.clone(), resolver);
        let command = impostor.display().to_string();
        let error = gate.check(&command).expect_err("impostor must be refused");
        assert!(matches!(error, ExecError::AllowlistDenied(_)));

        let trusting = BinaryResolver::new(Vec::new(), vec![tmp.path().to_path_buf()]);
        let gate = CommandGate::new(allowlist, trusting);
        assert_eq!(
            gate.check(&command).expect("fallback dir is trusted"),
            vec![impostor]
        );
    }
}
