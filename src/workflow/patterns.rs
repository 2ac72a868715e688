//! Input Patterns and Output Rules
//!
//! Pure matching logic linking task inputs to task outputs:
//! - [`InputPattern`] decides whether a path is an input of a task and
//!   captures the parts of it that output templates may reuse
//! - [`OutputRule`] turns a matched input into the task's output path(s)
//!
//! Nothing in here touches the graph or the filesystem.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobMatcher};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::DefinitionError;

/// Values captured while matching an input path, keyed by placeholder name.
pub type Captures = BTreeMap<String, String>;

/// `{name}` placeholders in output templates.
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("placeholder regex is valid"));

/// `\1`-style back-references, accepted as an alias for `{1}`.
static BACKREFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\([0-9]+)").expect("backreference regex is valid"));

/// Pattern selecting the input files of a task.
#[derive(Clone)]
pub enum InputPattern {
    /// Shell-style glob, e.g. `data.dir/*.fastq.gz`
    Glob { source: String, matcher: GlobMatcher },
    /// Regular expression matched against the whole path
    Regex { source: String, regex: Regex },
}

impl InputPattern {
    /// Compiles a glob pattern.
    pub fn glob(pattern: &str) -> Result<Self, String> {
        let glob = Glob::new(pattern).map_err(|e| e.to_string())?;
        Ok(Self::Glob {
            source: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    /// Compiles a regular expression. The expression is anchored so that it
    /// must match the entire path.
    pub fn regex(pattern: &str) -> Result<Self, String> {
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| e.to_string())?;
        Ok(Self::Regex {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Matches a path, returning the captured values on success.
    ///
    /// Every match exposes `path`, `dir`, `file`, `stem` and `ext`. Regex
    /// matches additionally expose numbered groups (`0` is the whole path)
    /// and named groups, which take precedence over the implicit values.
    pub fn matches(&self, path: &Path) -> Option<Captures> {
        let text = path.to_str()?;

        let mut captures = path_captures(path);

        match self {
            Self::Glob { matcher, .. } => {
                if !matcher.is_match(path) {
                    return None;
                }
            }
            Self::Regex { regex, .. } => {
                let caps = regex.captures(text)?;
                for (index, group) in caps.iter().enumerate() {
                    if let Some(group) = group {
                        captures.insert(index.to_string(), group.as_str().to_string());
                    }
                }
                for name in regex.capture_names().flatten() {
                    if let Some(group) = caps.name(name) {
                        captures.insert(name.to_string(), group.as_str().to_string());
                    }
                }
            }
        }

        Some(captures)
    }

    /// Names of the placeholders a match of this pattern will provide,
    /// excluding the implicit ones.
    fn group_names(&self) -> Vec<String> {
        match self {
            Self::Glob { .. } => Vec::new(),
            Self::Regex { regex, .. } => {
                let mut names: Vec<String> =
                    (0..regex.captures_len()).map(|i| i.to_string()).collect();
                names.extend(regex.capture_names().flatten().map(str::to_string));
                names
            }
        }
    }

    /// Returns every placeholder an output template may reference.
    pub fn available_placeholders(&self) -> Vec<String> {
        let mut names: Vec<String> = IMPLICIT_CAPTURES.iter().map(|s| s.to_string()).collect();
        names.extend(self.group_names());
        names
    }
}

impl fmt::Debug for InputPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Glob { source, .. } => write!(f, "Glob({:?})", source),
            Self::Regex { source, .. } => write!(f, "Regex({:?})", source),
        }
    }
}

const IMPLICIT_CAPTURES: &[&str] = &["path", "dir", "file", "stem", "ext"];

/// Captures available for every matched path.
///
/// `stem` stops at the first `.` so that multi-part suffixes such as
/// `.fastq.gz` are stripped as a whole.
pub fn path_captures(path: &Path) -> Captures {
    let text = path.to_string_lossy().into_owned();
    let file = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(&text)
        .to_string();

    let dir = path
        .parent()
        .and_then(|p| p.to_str())
        .unwrap_or_default()
        .to_string();

    let (stem, ext) = match file.find('.') {
        Some(0) | None => (file.clone(), String::new()),
        Some(index) => (file[..index].to_string(), file[index + 1..].to_string()),
    };

    let mut captures = Captures::new();
    captures.insert("path".to_string(), text);
    captures.insert("dir".to_string(), dir);
    captures.insert("file".to_string(), file);
    captures.insert("stem".to_string(), stem);
    captures.insert("ext".to_string(), ext);
    captures
}

/// Function deriving output paths from an input path.
pub type DeriveFn = Arc<dyn Fn(&Path) -> Vec<PathBuf> + Send + Sync>;

/// Rule producing the output path(s) of a task instance.
#[derive(Clone)]
pub enum OutputRule {
    /// Templates with `{placeholder}` or `\N` references into the captures
    Template(Vec<String>),
    /// Paths independent of the input, used by merge tasks
    Fixed(Vec<PathBuf>),
    /// Explicit transformation function
    Derive(DeriveFn),
    /// The task produces no files
    Nothing,
}

impl OutputRule {
    /// Single-template rule.
    pub fn template(template: impl Into<String>) -> Self {
        Self::Template(vec![template.into()])
    }

    /// Single fixed output.
    pub fn fixed(path: impl Into<PathBuf>) -> Self {
        Self::Fixed(vec![path.into()])
    }

    /// Rule backed by a transformation function.
    pub fn derive<F>(f: F) -> Self
    where
        F: Fn(&Path) -> Vec<PathBuf> + Send + Sync + 'static,
    {
        Self::Derive(Arc::new(f))
    }

    /// Placeholders referenced by a template rule.
    pub fn placeholders(&self) -> Vec<String> {
        match self {
            Self::Template(templates) => templates
                .iter()
                .flat_map(|t| placeholder_names(&normalize_backreferences(t)))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Derives the outputs for one matched input.
    pub fn derive_outputs(
        &self,
        task: &str,
        input: &Path,
        captures: &Captures,
    ) -> Result<Vec<PathBuf>, DefinitionError> {
        let outputs = match self {
            Self::Template(templates) => templates
                .iter()
                .map(|t| substitute(t, captures).map(PathBuf::from))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|placeholder| DefinitionError::UnresolvedPlaceholder {
                    task: task.to_string(),
                    placeholder,
                })?,
            Self::Fixed(paths) => paths.clone(),
            Self::Derive(f) => f(input),
            Self::Nothing => Vec::new(),
        };

        debug!("{}: {} -> {:?}", task, input.display(), outputs);
        Ok(outputs)
    }
}

impl fmt::Debug for OutputRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Template(t) => f.debug_tuple("Template").field(t).finish(),
            Self::Fixed(p) => f.debug_tuple("Fixed").field(p).finish(),
            Self::Derive(_) => f.write_str("Derive(<fn>)"),
            Self::Nothing => f.write_str("Nothing"),
        }
    }
}

/// Extracts placeholder names from a template.
///
/// ```
/// use ontvc::workflow::patterns::placeholder_names;
///
/// let names = placeholder_names("Clair.dir/{sample}/{1}.vcf.gz");
/// assert_eq!(names, vec!["sample", "1"]);
/// ```
pub fn placeholder_names(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

fn normalize_backreferences(template: &str) -> String {
    BACKREFERENCE.replace_all(template, "{$1}").into_owned()
}

/// Substitutes captures into a template.
///
/// Returns the name of the first placeholder with no captured value.
pub fn substitute(template: &str, captures: &Captures) -> Result<String, String> {
    let normalized = normalize_backreferences(template);

    if let Some(missing) = placeholder_names(&normalized)
        .into_iter()
        .find(|name| !captures.contains_key(name))
    {
        return Err(missing);
    }

    Ok(PLACEHOLDER
        .replace_all(&normalized, |caps: &regex::Captures| {
            captures.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned())
}
