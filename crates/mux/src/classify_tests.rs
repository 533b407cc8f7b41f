// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::protocol::CommandPayload;

fn payload_for(tag: &str) -> CommandPayload {
    match tag {
        "prompt" => CommandPayload::Prompt { message: "m".to_owned() },
        "steer" => CommandPayload::Steer { message: "m".to_owned() },
        "follow_up" => CommandPayload::FollowUp { message: "m".to_owned() },
        "compact" => CommandPayload::Compact,
        "bash" => CommandPayload::Bash { command: "ls".to_owned() },
        "abort" => CommandPayload::Abort,
        "abort_bash" => CommandPayload::AbortBash,
        "abort_compaction" => CommandPayload::AbortCompaction,
        "abort_retry" => CommandPayload::AbortRetry,
        "get_state" => CommandPayload::GetState,
        "get_messages" => CommandPayload::GetMessages,
        "set_model" => CommandPayload::SetModel { provider: "p".to_owned(), model: "m".to_owned() },
        "set_session_name" => CommandPayload::SetSessionName { name: "n".to_owned() },
        "list_sessions" => CommandPayload::ListSessions,
        "health_check" => CommandPayload::HealthCheck,
        "export_html" => CommandPayload::ExportHtml { path: None },
        "extension_ui_response" => CommandPayload::ExtensionUiResponse {
            request_id: "r".to_owned(),
            value: None,
            confirmed: None,
            responses: None,
            cancelled: false,
        },
        _ => CommandPayload::GetState,
    }
}

#[yare::parameterized(
    prompt = { "prompt" },
    steer = { "steer" },
    follow_up = { "follow_up" },
    compact = { "compact" },
)]
fn llm_commands_are_long(tag: &str) {
    assert_eq!(timeout_class(&payload_for(tag)), TimeoutClass::Long);
}

#[yare::parameterized(
    bash = { "bash" },
    abort = { "abort" },
    abort_bash = { "abort_bash" },
    abort_compaction = { "abort_compaction" },
    abort_retry = { "abort_retry" },
)]
fn stream_holders_have_no_timer(tag: &str) {
    assert_eq!(timeout_class(&payload_for(tag)), TimeoutClass::None);
}

#[yare::parameterized(
    get_state = { "get_state" },
    get_messages = { "get_messages" },
    set_model = { "set_model" },
    list_sessions = { "list_sessions" },
    health_check = { "health_check" },
    extension_ui_response = { "extension_ui_response" },
)]
fn everything_else_is_short(tag: &str) {
    assert_eq!(timeout_class(&payload_for(tag)), TimeoutClass::Short);
}

#[yare::parameterized(
    prompt = { "prompt", true },
    bash = { "bash", true },
    set_model = { "set_model", true },
    set_session_name = { "set_session_name", true },
    compact = { "compact", true },
    get_state = { "get_state", false },
    get_messages = { "get_messages", false },
    abort = { "abort", false },
    export_html = { "export_html", false },
    extension_ui_response = { "extension_ui_response", false },
    list_sessions = { "list_sessions", false },
)]
fn mutation_classification(tag: &str, expected: bool) {
    assert_eq!(mutates(&payload_for(tag)), expected);
}

#[test]
fn budgets_resolve_from_config() {
    let config = MuxConfig::default();
    assert_eq!(
        TimeoutClass::Short.budget(&config),
        Some(std::time::Duration::from_millis(30_000))
    );
    assert_eq!(
        TimeoutClass::Long.budget(&config),
        Some(std::time::Duration::from_millis(300_000))
    );
    assert_eq!(TimeoutClass::None.budget(&config), None);
}
