//! Context presentation: text and json formatters.

use super::section_title;
use crate::context::{ContextValidation, ProjectContext};
use crate::error::ApiError;
use owo_colors::OwoColorize;
use serde_json::json;

pub fn format_context_text_output(
    context: &ProjectContext,
    validation: &ContextValidation,
    show_text: bool,
) -> String {
    let mut out = section_title(&format!("Project {}", context.project_id));
    out.push_str(&format!("\n  Name: {}", context.metadata.name));
    if let Some(client) = &context.metadata.client {
        out.push_str(&format!("\n  Client: {}", client));
    }
    out.push_str(&format!(
        "\n  Capability text: {} chars",
        context.capability_text.chars().count()
    ));
    out.push_str(&format!(
        "\n  Requirement text: {} chars",
        context.requirement_text.chars().count()
    ));
    out.push_str(&format!("\n  Estimated tokens: {}", validation.token_estimate));

    let verdict = if !validation.valid {
        format!("{}", "over limit".red())
    } else if validation.warning.is_some() {
        format!("{}", "near limit".yellow())
    } else {
        format!("{}", "ok".green())
    };
    out.push_str(&format!("\n  Status: {}", verdict));
    if let Some(warning) = &validation.warning {
        out.push_str(&format!("\n  Warning: {}", warning));
    }

    if show_text {
        out.push_str("\n\n");
        out.push_str(&context.render());
    }
    out
}

pub fn format_context_json_output(
    context: &ProjectContext,
    validation: &ContextValidation,
    show_text: bool,
) -> Result<String, ApiError> {
    let mut value = json!({
        "project_id": context.project_id,
        "metadata": context.metadata,
        "token_estimate": validation.token_estimate,
        "valid": validation.valid,
        "warning": validation.warning,
        "assembled_at": context.assembled_at.to_rfc3339(),
        "from_cache": context.from_cache,
    });
    if show_text {
        value["text"] = json!(context.render());
    }
    Ok(serde_json::to_string_pretty(&value)?)
}
