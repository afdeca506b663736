//! Declarative validators (`validate.json`).
//!
//! ```json
//! {
//!   "flagPattern": "FLAG\\{[^}]+\\}",
//!   "steps": [
//!     { "step": 1, "infer": "^nmap", "command": "^nmap\\s", "output": "22/tcp\\s+open",
//!       "hint": "Scan the target first.", "achievements": ["recon"] },
//!     { "step": 2, "command": "^submit", "flag": "FLAG{found}", "flagRequired": true }
//!   ],
//!   "default": { "pass": false, "hint": "Nothing to check for this step." }
//! }
//! ```
//!
//! A step passes when every pattern it names matches. Without a step in
//! the request, the first rule whose `infer` pattern matches the command
//! selects one.

use super::{ValidationRequest, Validator};
use crate::error::{Error, Result};
use regex::Regex;
use sandboxd_protocol::ValidationResult;
use serde::Deserialize;
use std::collections::BTreeSet;

const DEFAULT_HINT: &str = "Try the required command for this step.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawRuleSet {
    #[serde(default)]
    flag_pattern: Option<String>,
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default)]
    default: Option<ValidationResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawStep {
    step: u32,
    #[serde(default)]
    infer: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    flag: Option<String>,
    #[serde(default)]
    hint: Option<String>,
    #[serde(default)]
    achievements: Option<BTreeSet<String>>,
    #[serde(default)]
    menu: Option<Vec<String>>,
    #[serde(default)]
    flag_required: bool,
}

#[derive(Debug)]
struct StepRule {
    step: u32,
    infer: Option<Regex>,
    command: Option<Regex>,
    output: Option<Regex>,
    flag: Option<String>,
    hint: Option<String>,
    achievements: Option<BTreeSet<String>>,
    menu: Option<Vec<String>>,
    flag_required: bool,
}

/// A parsed `validate.json`.
#[derive(Debug)]
pub struct RuleSet {
    source: String,
    flag_pattern: Option<Regex>,
    steps: Vec<StepRule>,
    default: Option<ValidationResult>,
}

fn compile(source: &str, field: &str, pattern: Option<String>) -> Result<Option<Regex>> {
    pattern
        .map(|p| {
            Regex::new(&p).map_err(|e| Error::validator(source, format!("{}: {}", field, e)))
        })
        .transpose()
}

impl RuleSet {
    /// Parse and compile a rule set. `source` names it in errors.
    pub fn parse(source: &str, bytes: &[u8]) -> Result<Self> {
        let raw: RawRuleSet =
            serde_json::from_slice(bytes).map_err(|e| Error::validator(source, e.to_string()))?;

        let mut steps = Vec::with_capacity(raw.steps.len());
        for step in raw.steps {
            let field = |name: &str| format!("step {} {}", step.step, name);
            steps.push(StepRule {
                step: step.step,
                infer: compile(source, &field("infer"), step.infer)?,
                command: compile(source, &field("command"), step.command)?,
                output: compile(source, &field("output"), step.output)?,
                flag: step.flag,
                hint: step.hint,
                achievements: step.achievements,
                menu: step.menu,
                flag_required: step.flag_required,
            });
        }

        Ok(Self {
            source: source.to_string(),
            flag_pattern: compile(source, "flagPattern", raw.flag_pattern)?,
            steps,
            default: raw.default,
        })
    }

    /// Where the rule set was read from.
    pub fn source(&self) -> &str {
        &self.source
    }

    fn infer_step(&self, command: &str) -> Option<u32> {
        self.steps
            .iter()
            .find(|rule| rule.infer.as_ref().is_some_and(|re| re.is_match(command)))
            .map(|rule| rule.step)
    }

    fn submitted_flag<'a>(&self, request: &'a ValidationRequest) -> Option<&'a str> {
        if let Some(flag) = request.flag.as_deref().filter(|f| !f.is_empty()) {
            return Some(flag);
        }
        self.flag_pattern
            .as_ref()
            .and_then(|re| re.find(&request.command))
            .map(|m| m.as_str())
    }

    /// Judge a request. `None` means the rule set has no opinion.
    pub fn evaluate(&self, request: &ValidationRequest) -> Option<ValidationResult> {
        let step = request.step.or_else(|| self.infer_step(&request.command));
        let rule = step.and_then(|step| self.steps.iter().find(|rule| rule.step == step));
        let Some(rule) = rule else {
            return self.default.clone();
        };

        let command_ok = rule
            .command
            .as_ref()
            .map_or(true, |re| re.is_match(&request.command));
        let output_ok = rule
            .output
            .as_ref()
            .map_or(true, |re| re.is_match(&request.output));
        let flag_ok = match (&rule.flag, self.submitted_flag(request)) {
            (Some(expected), Some(given)) => expected == given,
            (Some(_), None) => !rule.flag_required,
            (None, _) => true,
        };

        if command_ok && output_ok && flag_ok {
            Some(ValidationResult {
                pass: true,
                hint: None,
                menu: rule.menu.clone(),
                achievements: rule.achievements.clone(),
                flag_required: false,
            })
        } else {
            Some(ValidationResult {
                pass: false,
                hint: Some(rule.hint.clone().unwrap_or_else(|| DEFAULT_HINT.to_string())),
                menu: None,
                achievements: None,
                flag_required: rule.flag_required && !flag_ok,
            })
        }
    }
}

impl Validator for RuleSet {
    fn validate(&self, request: &ValidationRequest) -> Result<Option<ValidationResult>> {
        Ok(self.evaluate(request))
    }
}
