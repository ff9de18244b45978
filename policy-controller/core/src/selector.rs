use config_policy_controller_k8s_api::{
    labels::{self, Selector, SelectorError},
    policy::NamespaceSelector,
};
use regex::Regex;

/// A compiled namespace selector.
///
/// A namespace is targeted when its name matches at least one include
/// pattern (or there are none), matches no exclude pattern, and its labels
/// satisfy the label criteria.
#[derive(Clone, Debug)]
pub struct NamespaceTarget {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    labels: Selector,
}

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("invalid namespace pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("error parsing namespace label selector: {0}")]
    Labels(#[from] SelectorError),
}

// === impl NamespaceTarget ===

impl NamespaceTarget {
    pub fn new(selector: &NamespaceSelector) -> Result<Self, TargetError> {
        Ok(Self {
            include: compile_all(&selector.include)?,
            exclude: compile_all(&selector.exclude)?,
            labels: Selector::try_from(&selector.label_selector())?,
        })
    }

    pub fn matches(&self, name: &str, labels: &labels::Map) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|re| re.is_match(name));
        included && !self.exclude.iter().any(|re| re.is_match(name)) && self.labels.matches_map(labels)
    }

    /// Returns the sorted, deduplicated names of the targeted namespaces.
    pub fn resolve<'n>(
        &self,
        namespaces: impl IntoIterator<Item = (&'n str, &'n labels::Map)>,
    ) -> Vec<String> {
        let mut names = namespaces
            .into_iter()
            .filter(|(name, labels)| self.matches(name, labels))
            .map(|(name, _)| name.to_string())
            .collect::<Vec<_>>();
        names.sort();
        names.dedup();
        names
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, TargetError> {
    patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| {
            glob(p).map_err(|source| TargetError::Pattern {
                pattern: p.to_string(),
                source,
            })
        })
        .collect()
}

/// Compiles a shell-style glob (`*`, `?`, `[a-z]`, `[!a-z]`) into an
/// anchored regular expression.
fn glob(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => {
                re.push('[');
                if matches!(chars.peek(), Some('!' | '^')) {
                    chars.next();
                    re.push('^');
                }
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    if c == '\\' || c == '[' {
                        re.push('\\');
                    }
                    re.push(c);
                }
                if !closed {
                    // Let the regex parser report the unterminated class.
                    continue;
                }
                re.push(']');
            }
            '\\' => match chars.next() {
                Some(escaped) => re.push_str(&regex::escape(&escaped.to_string())),
                None => re.push_str(r"\\"),
            },
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}
