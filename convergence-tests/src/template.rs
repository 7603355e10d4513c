use std::collections::BTreeMap;

use thiserror::Error as ThisError;

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum TemplateError {
    #[error("variable '{0}' is not defined")]
    UnknownVariable(String),

    #[error("unterminated variable reference in '{0}'")]
    Unterminated(String),
}

/// Values available to replica command templates, referenced as `${name}`.
#[derive(Clone, Debug, Default)]
pub struct TemplateVars {
    vars: BTreeMap<&'static str, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: &'static str, value: impl Into<String>) -> Self {
        drop(self.vars.insert(name, value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

/// Replaces every `${name}` reference in `input` with its value.
///
/// References to undefined variables are errors, never passed through.
pub fn expand(input: &str, vars: &TemplateVars) -> Result<String, TemplateError> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);

        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(TemplateError::Unterminated(input.to_owned()));
        };

        let name = &after[..end];
        let value = vars
            .get(name)
            .ok_or_else(|| TemplateError::UnknownVariable(name.to_owned()))?;
        output.push_str(value);

        rest = &after[end + 1..];
    }

    output.push_str(rest);

    Ok(output)
}

pub fn expand_all<'a>(
    inputs: impl IntoIterator<Item = &'a String>,
    vars: &TemplateVars,
) -> Result<Vec<String>, TemplateError> {
    inputs.into_iter().map(|input| expand(input, vars)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> TemplateVars {
        TemplateVars::new()
            .with("port", "8080")
            .with("nodeId", "node1")
            .with("dataDir", "/tmp/run/node1")
    }

    #[test]
    fn expands_whole_and_embedded_references() {
        let vars = vars();

        assert_eq!(expand("${port}", &vars).unwrap(), "8080", "whole argument");
        assert_eq!(
            expand("--data-path=${dataDir}", &vars).unwrap(),
            "--data-path=/tmp/run/node1",
            "embedded reference"
        );
        assert_eq!(
            expand("${nodeId}@${port}", &vars).unwrap(),
            "node1@8080",
            "several references"
        );
        assert_eq!(expand("--release", &vars).unwrap(), "--release", "no references");
    }

    #[test]
    fn rejects_unknown_and_unterminated_references() {
        let vars = vars();

        assert_eq!(
            expand("${grpcPort}", &vars),
            Err(TemplateError::UnknownVariable("grpcPort".to_owned())),
            "unknown variables must not pass through"
        );
        assert_eq!(
            expand("--port=${port", &vars),
            Err(TemplateError::Unterminated("--port=${port".to_owned())),
            "missing closing brace"
        );
    }

    #[test]
    fn expands_every_argument() {
        let args = vec![
            "--port".to_owned(),
            "${port}".to_owned(),
            "--node-id".to_owned(),
            "${nodeId}".to_owned(),
        ];

        assert_eq!(
            expand_all(&args, &vars()).unwrap(),
            ["--port", "8080", "--node-id", "node1"],
            "arguments keep their order"
        );
        assert!(
            expand_all(&["${missing}".to_owned()], &vars()).is_err(),
            "one bad argument fails the whole command"
        );
    }
}
