use expensa_core::config::{AppConfig, LoadOptions};
use expensa_db::{connect_with_config, migrations};
use serde::Serialize;

use crate::commands::current_thread_runtime;
use crate::commands::lint_rules::collect_findings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["database_connectivity", "migration_status", "rule_conditions"] {
                checks.push(skipped(name, "configuration did not load"));
            }
        }
    }

    let failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let overall_status = if failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match current_thread_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![
                DoctorCheck {
                    name: "database_connectivity",
                    status: CheckStatus::Fail,
                    details: format!("failed to initialize async runtime: {error}"),
                },
                skipped("migration_status", "no async runtime"),
                skipped("rule_conditions", "no async runtime"),
            ];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    skipped("migration_status", "database is unreachable"),
                    skipped("rule_conditions", "database is unreachable"),
                ];
            }
        };

        let mut checks = vec![DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        }];

        let pending = migrations::pending_versions(&pool).await;
        pool.close().await;
        match pending {
            Ok(pending) if pending.is_empty() => checks.push(DoctorCheck {
                name: "migration_status",
                status: CheckStatus::Pass,
                details: "schema is up to date".to_string(),
            }),
            Ok(pending) => {
                checks.push(DoctorCheck {
                    name: "migration_status",
                    status: CheckStatus::Fail,
                    details: format!(
                        "{} pending migration(s); run `expensa migrate`",
                        pending.len()
                    ),
                });
                checks.push(skipped("rule_conditions", "schema is not migrated"));
                return checks;
            }
            Err(error) => {
                checks.push(DoctorCheck {
                    name: "migration_status",
                    status: CheckStatus::Fail,
                    details: format!("failed to read migration state: {error}"),
                });
                checks.push(skipped("rule_conditions", "migration state unknown"));
                return checks;
            }
        }

        checks.push(match collect_findings(config).await {
            Ok(findings) if findings.is_empty() => DoctorCheck {
                name: "rule_conditions",
                status: CheckStatus::Pass,
                details: "every stored rule condition parses".to_string(),
            },
            Ok(findings) => DoctorCheck {
                name: "rule_conditions",
                status: CheckStatus::Fail,
                details: findings
                    .iter()
                    .map(|finding| format!("{}: {}", finding.rule_id, finding.error))
                    .collect::<Vec<_>>()
                    .join("; "),
            },
            Err(error) => DoctorCheck {
                name: "rule_conditions",
                status: CheckStatus::Fail,
                details: format!("{error:#}"),
            },
        });
        checks
    })
}

fn skipped(name: &'static str, reason: &str) -> DoctorCheck {
    DoctorCheck { name, status: CheckStatus::Skipped, details: format!("skipped because {reason}") }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
