use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

use crate::catalog::{InputKind, KeyedInput, ToolKind};
use crate::error::{Result, ScanError};
use crate::ports;

const MAX_LABEL_LEN: usize = 63;
const MAX_DOMAIN_LEN: usize = 253;

/// A resolved program plus argument vector. Executed without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

impl Serialize for CommandLine {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn quote(token: &str) -> String {
    let plain = !token.is_empty()
        && !token
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '\\' | '$' | '`'));
    if plain {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}

/// Per-tool choices made for one target.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolSelection {
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

/// Maps (tool, domain, flags, inputs) to a command line.
///
/// Pure: no I/O, and identical arguments always produce identical commands.
/// Flags and inputs are emitted in catalog order, never in selection order.
#[derive(Debug, Clone, Default)]
pub struct CommandBuilder {
    programs: HashMap<ToolKind, String>,
}

impl CommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the executable used for `tool` (the template's first token).
    pub fn with_program(mut self, tool: ToolKind, program: impl Into<String>) -> Self {
        self.programs.insert(tool, program.into());
        self
    }

    pub fn build(
        &self,
        tool: ToolKind,
        domain: &str,
        flags: &[String],
        inputs: &BTreeMap<String, String>,
    ) -> Result<CommandLine> {
        let domain = validate_domain(domain)?;
        let def = tool.definition();

        let mut tokens = def
            .template
            .split_whitespace()
            .map(|t| t.replace("{domain}", &domain));
        // Templates are static and never empty.
        let template_program = tokens.next().unwrap_or_else(|| tool.as_str().to_string());
        let program = self
            .programs
            .get(&tool)
            .cloned()
            .unwrap_or(template_program);
        let mut args: Vec<String> = tokens.collect();

        for token in flags {
            if def.flag(token).is_none() {
                return Err(ScanError::UnknownParameter {
                    tool,
                    param: token.clone(),
                });
            }
        }
        for param in def.flags {
            if flags.iter().any(|f| f == param.flag) {
                args.push(param.flag.to_string());
            }
        }

        for key in inputs.keys() {
            if def.input(key).is_none() {
                return Err(ScanError::UnknownParameter {
                    tool,
                    param: key.clone(),
                });
            }
        }
        for input in def.inputs {
            let provided = inputs
                .get(input.key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty());
            let value = match provided {
                Some(v) => v,
                None if input.required && !input.default.is_empty() => input.default,
                None if input.required => {
                    return Err(invalid(tool, input, "a value is required".into()));
                }
                None => continue,
            };
            check_value(tool, input, value)?;
            args.push(input.key.to_string());
            args.push(value.to_string());
        }

        Ok(CommandLine { program, args })
    }

    pub fn build_selection(
        &self,
        tool: ToolKind,
        domain: &str,
        selection: &ToolSelection,
    ) -> Result<CommandLine> {
        self.build(tool, domain, &selection.flags, &selection.inputs)
    }
}

fn invalid(tool: ToolKind, input: &KeyedInput, reason: String) -> ScanError {
    ScanError::InvalidParameterValue {
        tool,
        key: input.key.to_string(),
        reason,
    }
}

fn check_value(tool: ToolKind, input: &KeyedInput, value: &str) -> Result<()> {
    match input.kind {
        InputKind::Text => {
            if value.chars().any(char::is_control) {
                return Err(invalid(tool, input, "control characters are not allowed".into()));
            }
        }
        InputKind::Number { min, max } => {
            let n = parse_number(tool, input, value)?;
            if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                return Err(invalid(
                    tool,
                    input,
                    format!("{n} is outside {}", bounds(min, max)),
                ));
            }
        }
        InputKind::Range { min, max, step } => {
            let n = parse_number(tool, input, value)?;
            if n < min || n > max {
                return Err(invalid(tool, input, format!("{n} is outside {min}..={max}")));
            }
            if step > 1 && (n - min) % step != 0 {
                return Err(invalid(
                    tool,
                    input,
                    format!("{n} is not a multiple of {step} from {min}"),
                ));
            }
        }
        InputKind::Ports => {
            ports::parse_port_list(value).map_err(|e| invalid(tool, input, format!("{e:#}")))?;
        }
    }
    Ok(())
}

fn parse_number(tool: ToolKind, input: &KeyedInput, value: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .map_err(|e| invalid(tool, input, format!("'{value}' is not a number: {e}")))
}

fn bounds(min: Option<i64>, max: Option<i64>) -> String {
    match (min, max) {
        (Some(lo), Some(hi)) => format!("{lo}..={hi}"),
        (Some(lo), None) => format!(">= {lo}"),
        (None, Some(hi)) => format!("<= {hi}"),
        (None, None) => "any".to_string(),
    }
}

/// Validate a hostname and return its normalised (trimmed, lower-case) form.
///
/// Labels are 1-63 letters, digits or hyphens, never starting or ending with
/// a hyphen, joined by single dots.
pub fn validate_domain(raw: &str) -> Result<String> {
    let domain = raw.trim().to_ascii_lowercase();
    let reject = || ScanError::InvalidDomain(raw.to_string());

    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return Err(reject());
    }
    for label in domain.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(reject());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(reject());
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(reject());
        }
    }
    Ok(domain)
}
