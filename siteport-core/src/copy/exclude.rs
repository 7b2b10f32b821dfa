/// Exclusion rules for tree copies.
///
/// A rule with a `/` matches a path relative to the copy root (and everything
/// below it); `*.ext` matches a file-name suffix; anything else matches a
/// file or directory name at any depth.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExcludeRules {
    rules: Vec<String>,
}

impl ExcludeRules {
    pub fn new<S: AsRef<str>>(rules: &[S]) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|r| r.as_ref().trim().trim_end_matches('/').to_string())
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// `rel` is `/`-separated and relative to the copy root.
    pub fn matches(&self, rel: &str) -> bool {
        let name = rel.rsplit('/').next().unwrap_or(rel);
        self.rules.iter().any(|r| {
            if r.contains('/') {
                rel == r || rel.strip_prefix(r.as_str()).is_some_and(|rest| rest.starts_with('/'))
            } else if let Some(ext) = r.strip_prefix('*') {
                name.ends_with(ext)
            } else {
                name == r
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_path_and_suffix_rules() {
        let x = ExcludeRules::new(&["cache", "2019/old/", "*.log", " "]);
        assert!(x.matches("cache"));
        assert!(x.matches("sites/2/cache"));
        assert!(x.matches("2019/old"));
        assert!(x.matches("2019/old/pic.jpg"));
        assert!(!x.matches("2019/older/pic.jpg"));
        assert!(x.matches("debug.log"));
        assert!(!x.matches("catalog.jpg"));
        assert!(ExcludeRules::new::<&str>(&[]).is_empty());
    }
}
