use std::path::Path;

use insureflow_core::flows::{FlowDefinition, FlowRegistry, StepValidator};

use crate::commands::{load_config, CommandResult};

/// Loads a flow registry the way the server would and summarizes it.
///
/// Field patterns are compiled too, so a file that passes here will not fail
/// at server startup.
pub fn run(path: Option<&Path>) -> CommandResult {
    let loaded = match path {
        Some(path) => FlowRegistry::load_from_path(path),
        None => match load_config("flows") {
            Ok(config) => FlowRegistry::load(&config.flows),
            Err(failure) => return failure,
        },
    };

    let registry = match loaded {
        Ok(registry) => registry,
        Err(error) => return CommandResult::failure("flows", "flow_registry", error.to_string(), 3),
    };
    if let Err(error) = StepValidator::new(&registry) {
        return CommandResult::failure(
            "flows",
            "flow_registry",
            format!("invalid field pattern: {error}"),
            3,
        );
    }

    let mut lines = vec![format!("{} flow(s) loaded", registry.len())];
    lines.extend(registry.flows().map(summarize));
    CommandResult::success("flows", lines.join("\n"))
}

fn summarize(flow: &FlowDefinition) -> String {
    let steps: Vec<&str> = flow.steps.iter().map(|step| step.step_name.as_str()).collect();
    format!("  - {}: {} ({} steps: {})", flow.flow_id, flow.display_name, steps.len(), steps.join(" -> "))
}
