use insureflow_core::config::{AppConfig, IntegrationMode, LoadOptions};
use insureflow_core::flows::{FlowRegistry, StepValidator};
use insureflow_db::{connect_with_config, migrations};
use insureflow_integrations::build_clients;
use serde::Serialize;

use crate::commands::CommandResult;

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

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str) -> Self {
        Self {
            name,
            status: CheckStatus::Skipped,
            details: "skipped because configuration did not load".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck::pass("config_validation", "configuration loaded and validated"));
            checks.push(check_flow_registry(&config));
            checks.push(check_integrations(&config));
            checks.push(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            checks.push(DoctorCheck::skipped("flow_registry"));
            checks.push(DoctorCheck::skipped("integrations"));
            checks.push(DoctorCheck::skipped("database_connectivity"));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_flow_registry(config: &AppConfig) -> DoctorCheck {
    let registry = match FlowRegistry::load(&config.flows) {
        Ok(registry) => registry,
        Err(error) => return DoctorCheck::fail("flow_registry", error.to_string()),
    };
    match StepValidator::new(&registry) {
        Ok(_) => DoctorCheck::pass("flow_registry", format!("{} flow(s) loaded", registry.len())),
        Err(error) => DoctorCheck::fail("flow_registry", format!("invalid field pattern: {error}")),
    }
}

fn check_integrations(config: &AppConfig) -> DoctorCheck {
    match build_clients(&config.integrations) {
        Ok(_) => {
            let mode = match config.integrations.mode {
                IntegrationMode::Mock => "mock clients selected (offline, deterministic)",
                IntegrationMode::Real => "HTTP clients configured for every provider",
            };
            DoctorCheck::pass("integrations", mode)
        }
        Err(error) => DoctorCheck::fail("integrations", error.to_string()),
    }
}

fn check_database(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck::fail(
                "database_connectivity",
                format!("failed to initialize async runtime: {error}"),
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;
        let pending = migrations::pending_versions(&pool)
            .await
            .map_err(|error| format!("failed to read migration state: {error}"));
        pool.close().await;
        pending
    });

    match result {
        Ok(pending) if pending.is_empty() => DoctorCheck::pass(
            "database_connectivity",
            format!("connected using `{}`, schema up to date", config.database.url),
        ),
        Ok(pending) => DoctorCheck::pass(
            "database_connectivity",
            format!(
                "connected using `{}`, {} migration(s) pending (run `insureflow migrate`)",
                config.database.url,
                pending.len()
            ),
        ),
        Err(error) => DoctorCheck::fail("database_connectivity", error),
    }
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
