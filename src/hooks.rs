//! Caller-supplied scripts run in the page during a capture
//!
//! A script is either a single source string, run right before each
//! serialization, or a bundle with one optional script per lifecycle phase.
//! Scripts can be written as a function expression or as a bare function
//! body; either way they can call the wait helpers below, which throw an
//! error containing "not found within timeout" when they give up.

use crate::page::Page;
use crate::{CaptureError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::debug;

/// Helpers in scope for every hook script.
const HOOK_PRELUDE: &str = r#"
const waitForTimeout = (ms) => new Promise((resolve) => setTimeout(resolve, ms));
const waitFor = async (predicate, timeout = 30000, label = 'Condition') => {
  const started = Date.now();
  while (true) {
    const result = await predicate();
    if (result) return result;
    if (Date.now() - started >= timeout) {
      throw new Error(`${label} not found within timeout: ${timeout}ms`);
    }
    await waitForTimeout(100);
  }
};
const waitForSelector = (selector, timeout) =>
  waitFor(() => document.querySelector(selector), timeout, `Selector "${selector}"`);
const waitForXPath = (xpath, timeout) =>
  waitFor(() => document.evaluate(xpath, document, null,
    XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue, timeout, `XPath "${xpath}"`);
const helpers = { waitFor, waitForTimeout, waitForSelector, waitForXPath };
"#;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    AfterNavigation,
    BeforeResize,
    AfterResize,
    BeforeSnapshot,
}

impl HookPhase {
    pub const ALL: [HookPhase; 4] = [
        HookPhase::AfterNavigation,
        HookPhase::BeforeResize,
        HookPhase::AfterResize,
        HookPhase::BeforeSnapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::AfterNavigation => "afterNavigation",
            HookPhase::BeforeResize => "beforeResize",
            HookPhase::AfterResize => "afterResize",
            HookPhase::BeforeSnapshot => "beforeSnapshot",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookBundle {
    #[serde(default, alias = "after_navigation")]
    pub after_navigation: Option<String>,
    #[serde(default, alias = "before_resize")]
    pub before_resize: Option<String>,
    #[serde(default, alias = "after_resize")]
    pub after_resize: Option<String>,
    #[serde(default, alias = "before_snapshot")]
    pub before_snapshot: Option<String>,
}

impl HookBundle {
    pub fn get(&self, phase: HookPhase) -> Option<&str> {
        match phase {
            HookPhase::AfterNavigation => self.after_navigation.as_deref(),
            HookPhase::BeforeResize => self.before_resize.as_deref(),
            HookPhase::AfterResize => self.after_resize.as_deref(),
            HookPhase::BeforeSnapshot => self.before_snapshot.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ExecuteScript {
    Source(String),
    Hooks(HookBundle),
}

impl ExecuteScript {
    pub fn script_for(&self, phase: HookPhase) -> Option<&str> {
        match self {
            ExecuteScript::Source(source) if phase == HookPhase::BeforeSnapshot => {
                Some(source.as_str())
            }
            ExecuteScript::Source(_) => None,
            ExecuteScript::Hooks(bundle) => bundle.get(phase),
        }
        .filter(|source| !source.trim().is_empty())
    }

    pub fn scripts(&self) -> Vec<(HookPhase, &str)> {
        HookPhase::ALL
            .iter()
            .filter_map(|phase| self.script_for(*phase).map(|source| (*phase, source)))
            .collect()
    }

    /// Parse every script in the page without running any of them.
    pub async fn compile(&self, page: &Page) -> Result<()> {
        for (phase, source) in self.scripts() {
            debug!("Compiling {} script", phase.as_str());
            page.compile(&format!("({})", wrap_script(source))).await?;
        }
        Ok(())
    }

    /// Run the script for `phase`, if any.
    pub async fn run(&self, page: &Page, phase: HookPhase) -> Result<()> {
        let Some(source) = self.script_for(phase) else {
            return Ok(());
        };

        debug!("Running {} script", phase.as_str());
        page.evaluate(&wrap_script(source), &[])
            .await
            .map(|_| ())
            .map_err(|e| match e {
                CaptureError::Script(message) if message.contains("not found within timeout") => {
                    CaptureError::WaitTimeout(message)
                }
                e => e,
            })
    }
}

/// Whether `source` is a function expression rather than a function body.
fn is_function_expression(source: &str) -> bool {
    let source = source.trim_start();
    let keyword = |word: &str| {
        source
            .strip_prefix(word)
            .map_or(false, |rest| rest.starts_with(|c: char| c == '(' || c == '*' || c.is_whitespace()))
    };
    if keyword("function") || keyword("async") {
        return true;
    }

    match source.find("=>") {
        Some(arrow) => {
            let head = source[..arrow].trim();
            head.starts_with('(')
                || head
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '$')
        }
        None => false,
    }
}

/// Build a function source that runs `source` with the helpers in scope.
pub fn wrap_script(source: &str) -> String {
    let call = if is_function_expression(source) {
        format!("await ({source})(helpers)")
    } else {
        format!("await (async ({{ waitFor, waitForTimeout, waitForSelector, waitForXPath }}) => {{\n{source}\n}})(helpers)")
    };

    format!("async () => {{\n{HOOK_PRELUDE}\n{call};\n}}")
}

pub async fn wait_for_timeout(page: &Page, timeout: Duration) -> Result<()> {
    debug!("Wait for {}ms timeout", timeout.as_millis());
    page.guard(async {
        tokio::time::sleep(timeout).await;
        Ok(())
    })
    .await
}

/// Poll until `selector` matches an element, giving up after `timeout`.
pub async fn wait_for_selector(page: &Page, selector: &str, timeout: Duration) -> Result<()> {
    debug!("Wait for selector: {}", selector);
    let started = Instant::now();

    loop {
        let found = page
            .evaluate(
                "(selector) => document.querySelector(selector) !== null",
                &[json!(selector)],
            )
            .await?;
        if found == Value::Bool(true) {
            return Ok(());
        }

        if started.elapsed() >= timeout {
            return Err(CaptureError::WaitTimeout(format!(
                "Selector \"{}\" not found within timeout: {}ms",
                selector,
                timeout.as_millis()
            )));
        }

        wait_for_timeout(page, WAIT_POLL_INTERVAL).await?;
    }
}
