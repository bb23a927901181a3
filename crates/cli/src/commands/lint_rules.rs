use anyhow::Context;
use serde::Serialize;
use serde_json::json;

use crate::commands::{current_thread_runtime, CommandResult};
use expensa_core::config::{AppConfig, LoadOptions};
use expensa_db::{connect_with_config, ApprovalService, Repositories};

#[derive(Debug, Serialize)]
pub(crate) struct LintFinding {
    pub rule_id: String,
    pub error: String,
}

/// Reports stored rules whose condition no longer parses. Such rules are
/// skipped (or refused, depending on `rules.unparsable_condition`) at
/// evaluation time, so they are worth fixing before they matter.
pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "lint-rules",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match current_thread_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "lint-rules",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    match runtime.block_on(collect_findings(&config)) {
        Ok(findings) if findings.is_empty() => {
            CommandResult::success("lint-rules", "every stored rule condition parses")
        }
        Ok(findings) => CommandResult::failure_with_data(
            "lint-rules",
            "unparsable_conditions",
            format!("{} stored rule(s) have conditions that do not parse", findings.len()),
            6,
            Some(json!({ "findings": findings })),
        ),
        Err(error) => CommandResult::failure("lint-rules", "persistence", format!("{error:#}"), 5),
    }
}

pub(crate) async fn collect_findings(config: &AppConfig) -> anyhow::Result<Vec<LintFinding>> {
    let pool = connect_with_config(&config.database)
        .await
        .with_context(|| format!("failed to connect to `{}`", config.database.url))?;
    let service = ApprovalService::from_config(Repositories::sqlite(pool.clone()), config);
    let findings = service.lint_rules().await.context("failed to load stored rules")?;
    pool.close().await;

    Ok(findings
        .into_iter()
        .map(|(rule_id, error)| LintFinding { rule_id: rule_id.0, error: error.to_string() })
        .collect())
}
