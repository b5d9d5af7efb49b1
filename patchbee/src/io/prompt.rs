//! Prompt rendering for the backend and fixer requests.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::types::{ApplyMode, Iteration};

const ASSIST_TEMPLATE: &str = include_str!("prompts/assist.md");
const AUTO_SYSTEM_TEMPLATE: &str = include_str!("prompts/auto_system.md");
const INITIAL_TEMPLATE: &str = include_str!("prompts/initial.md");
const RETRY_TEMPLATE: &str = include_str!("prompts/retry.md");
const FIXER_TEMPLATE: &str = include_str!("prompts/fixer.md");

/// A rendered system + user prompt pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    /// Single document used for the run log.
    pub fn render(&self) -> String {
        format!(
            "# System\n\n{}\n\n# User\n\n{}\n",
            self.system.trim(),
            self.user.trim()
        )
    }
}

/// What the model is asked to fix in `patchbee auto`.
#[derive(Debug, Clone, Default)]
pub struct TaskDescription {
    pub instructions: Option<String>,
    /// Verification command as shown to the model.
    pub command: String,
    /// Verification script text, when the command names a readable file.
    pub script: Option<String>,
}

/// Template engine wrapper around minijinja.
pub struct Prompts {
    env: Environment<'static>,
}

impl Prompts {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in [
            ("assist", ASSIST_TEMPLATE),
            ("auto_system", AUTO_SYSTEM_TEMPLATE),
            ("initial", INITIAL_TEMPLATE),
            ("retry", RETRY_TEMPLATE),
            ("fixer", FIXER_TEMPLATE),
        ] {
            env.add_template(name, source)
                .with_context(|| format!("load {name} prompt template"))?;
        }
        Ok(Self { env })
    }

    /// One-shot `assist` prompt: the context in the system prompt, the request as user prompt.
    pub fn assist(&self, code: &str, instructions: &str) -> Result<Prompt> {
        let system = self.render("assist", context! { code => code })?;
        Ok(Prompt {
            system,
            user: instructions.trim().to_string(),
        })
    }

    /// First iteration of the workflow.
    pub fn initial(&self, mode: ApplyMode, code: &str, task: &TaskDescription) -> Result<Prompt> {
        let system = self.auto_system(mode, code)?;
        let user = self.render(
            "initial",
            context! {
                instructions => non_blank(task.instructions.as_deref()),
                command => task.command.as_str(),
                script => non_blank(task.script.as_deref()),
            },
        )?;
        Ok(Prompt { system, user })
    }

    /// Later iterations: embeds the previous proposal and why it failed.
    pub fn retry(
        &self,
        mode: ApplyMode,
        code: &str,
        task: &TaskDescription,
        previous: &Iteration,
    ) -> Result<Prompt> {
        let system = self.auto_system(mode, code)?;
        let proposal = previous.proposal.as_ref().map(|p| p.render());
        let failure = previous
            .failure
            .as_ref()
            .map(|f| f.feedback())
            .unwrap_or_default();
        let user = self.render(
            "retry",
            context! {
                index => previous.index,
                mode => mode.as_str(),
                instructions => non_blank(task.instructions.as_deref()),
                proposal => non_blank(proposal.as_deref()),
                command => task.command.as_str(),
                script => non_blank(task.script.as_deref()),
                failure => failure.trim(),
            },
        )?;
        debug!(index = previous.index, "rendered retry prompt");
        Ok(Prompt { system, user })
    }

    /// Fixer request: a single user prompt asking for syntactically valid JSON.
    pub fn fixer(&self, raw: &str) -> Result<Prompt> {
        let user = self.render("fixer", context! { raw => raw })?;
        Ok(Prompt {
            system: String::new(),
            user,
        })
    }

    fn auto_system(&self, mode: ApplyMode, code: &str) -> Result<String> {
        self.render(
            "auto_system",
            context! { mode => mode.as_str(), code => code },
        )
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        template
            .render(ctx)
            .with_context(|| format!("render {name} prompt"))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
