//! Lab job templates.
//!
//! A template is plain text with `##NAME##` placeholders drawn from a closed
//! set of variables.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{PipelineError, Result};

const DELIMITER: &str = "##";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TemplateVar {
    KernelVersion,
    KernelPackageUrl,
    Uid,
    Arch,
    Hostname,
    HostnameTag,
}

impl TemplateVar {
    pub const ALL: [TemplateVar; 6] = [
        TemplateVar::KernelVersion,
        TemplateVar::KernelPackageUrl,
        TemplateVar::Uid,
        TemplateVar::Arch,
        TemplateVar::Hostname,
        TemplateVar::HostnameTag,
    ];

    pub fn placeholder(self) -> &'static str {
        match self {
            Self::KernelVersion => "KVER",
            Self::KernelPackageUrl => "KPKG_URL",
            Self::Uid => "UID",
            Self::Arch => "ARCH",
            Self::Hostname => "HOSTNAME",
            Self::HostnameTag => "HOSTNAMETAG",
        }
    }
}

impl fmt::Display for TemplateVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{DELIMITER}{}{DELIMITER}", self.placeholder())
    }
}

impl FromStr for TemplateVar {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|var| var.placeholder() == s)
            .ok_or_else(|| PipelineError::Template(format!("unknown placeholder {DELIMITER}{s}{DELIMITER}")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    values: BTreeMap<TemplateVar, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, var: TemplateVar, value: impl Into<String>) -> Self {
        self.set(var, value);
        self
    }

    pub fn set(&mut self, var: TemplateVar, value: impl Into<String>) {
        self.values.insert(var, value.into());
    }

    pub fn get(&self, var: TemplateVar) -> Option<&str> {
        self.values.get(&var).map(String::as_str)
    }
}

/// Substitute every placeholder in `template`.
///
/// Unset variables render as an empty string. A `##...##` pair that does not
/// name a known variable is an error. Text between delimiters that contains
/// whitespace is not treated as a placeholder.
pub fn render(template: &str, vars: &TemplateVars) -> Result<String> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(DELIMITER) {
        let after = &rest[start + DELIMITER.len()..];
        let Some(end) = after.find(DELIMITER) else {
            break;
        };
        let name = &after[..end];
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            output.push_str(&rest[..start + DELIMITER.len()]);
            rest = after;
            continue;
        }

        let var: TemplateVar = name.parse()?;
        output.push_str(&rest[..start]);
        output.push_str(vars.get(var).unwrap_or_default());
        rest = &after[end + DELIMITER.len()..];
    }

    output.push_str(rest);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_placeholders() {
        let vars = TemplateVars::new()
            .with(TemplateVar::KernelVersion, "6.6.0")
            .with(TemplateVar::KernelPackageUrl, "https://a/b.tar.gz")
            .with(TemplateVar::Uid, "patched-0011");
        let job = "<job kver=\"##KVER##\" url=\"##KPKG_URL##\">##UID##</job>";
        assert_eq!(
            render(job, &vars).unwrap(),
            "<job kver=\"6.6.0\" url=\"https://a/b.tar.gz\">patched-0011</job>"
        );
    }

    #[test]
    fn missing_values_render_empty() {
        let rendered = render("host=##HOSTNAME##;", &TemplateVars::new()).unwrap();
        assert_eq!(rendered, "host=;");
    }

    #[test]
    fn unknown_placeholder_is_rejected() {
        let err = render("##KVERSION##", &TemplateVars::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Template(_)));
    }

    #[test]
    fn ordinary_hashes_pass_through() {
        let text = "## comment ## and #single# ##UID";
        assert_eq!(render(text, &TemplateVars::new()).unwrap(), text);
    }
}
